//! Per-file timelines: the append-only history of what every task did to a
//! file, how each merge went, and what landed on the shared branch.

pub mod store;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{MainBranchEvent, MergeResult, TaskSnapshot};

pub use store::TimelineStore;

/// Payload of one timeline entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "payload", rename_all = "snake_case")]
pub enum TimelineEventKind {
    Snapshot(TaskSnapshot),
    MergeResult(MergeResult),
    MainBranchEvent(MainBranchEvent),
}

/// One timestamped entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimelineEvent {
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: TimelineEventKind,
}

/// Ordered history of one file. Events are only ever appended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTimeline {
    pub file_path: String,
    #[serde(default)]
    pub events: Vec<TimelineEvent>,
}

impl FileTimeline {
    pub fn new(file_path: impl Into<String>) -> Self {
        Self {
            file_path: file_path.into(),
            events: Vec::new(),
        }
    }

    /// Timestamps never run backwards, even if the clock does.
    fn push(&mut self, kind: TimelineEventKind) {
        let now = Utc::now();
        let timestamp = match self.events.last() {
            Some(last) if last.timestamp > now => last.timestamp,
            _ => now,
        };
        self.events.push(TimelineEvent { timestamp, kind });
    }

    /// Record a task's snapshot. Re-recording an identical snapshot (same
    /// task, same content hash) is a no-op; returns whether it was added.
    pub fn record_snapshot(&mut self, snapshot: TaskSnapshot) -> bool {
        let duplicate = self.snapshots().any(|s| {
            s.task_id == snapshot.task_id && s.content_hash == snapshot.content_hash
        });
        if duplicate {
            return false;
        }
        self.push(TimelineEventKind::Snapshot(snapshot));
        true
    }

    pub fn record_merge_result(&mut self, result: MergeResult) {
        self.push(TimelineEventKind::MergeResult(result));
    }

    pub fn record_main_branch_event(&mut self, event: MainBranchEvent) {
        self.push(TimelineEventKind::MainBranchEvent(event));
    }

    pub fn snapshots(&self) -> impl Iterator<Item = &TaskSnapshot> {
        self.events.iter().filter_map(|e| match &e.kind {
            TimelineEventKind::Snapshot(s) => Some(s),
            _ => None,
        })
    }

    pub fn merge_results(&self) -> impl Iterator<Item = &MergeResult> {
        self.events.iter().filter_map(|e| match &e.kind {
            TimelineEventKind::MergeResult(r) => Some(r),
            _ => None,
        })
    }

    pub fn main_branch_events(&self) -> impl Iterator<Item = &MainBranchEvent> {
        self.events.iter().filter_map(|e| match &e.kind {
            TimelineEventKind::MainBranchEvent(m) => Some(m),
            _ => None,
        })
    }

    /// Most recent snapshot recorded for `task_id`.
    pub fn latest_snapshot(&self, task_id: &str) -> Option<&TaskSnapshot> {
        self.snapshots().filter(|s| s.task_id == task_id).last()
    }

    /// Whether a main-branch event integrates `task_id`.
    pub fn is_landed(&self, task_id: &str) -> bool {
        self.main_branch_events()
            .any(|m| m.task_ids.iter().any(|t| t == task_id))
    }

    /// Tasks with snapshots that have not landed yet, in first-seen order.
    pub fn pending_tasks(&self) -> Vec<String> {
        let mut pending: Vec<String> = Vec::new();
        for snapshot in self.snapshots() {
            if !self.is_landed(&snapshot.task_id) && !pending.contains(&snapshot.task_id) {
                pending.push(snapshot.task_id.clone());
            }
        }
        pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::BTreeSet;

    use crate::models::{ConflictRegion, ConflictSeverity, MergeFailure, FILE_TOP};

    fn snapshot(task: &str, content: &str) -> TaskSnapshot {
        TaskSnapshot::new(task, "intent", Utc::now(), content, Vec::new())
    }

    fn region() -> ConflictRegion {
        ConflictRegion {
            file_path: "src/a.ts".into(),
            location: FILE_TOP.into(),
            tasks_involved: vec!["t1".into(), "t2".into()],
            change_types: BTreeSet::new(),
            severity: ConflictSeverity::Low,
            can_auto_merge: true,
        }
    }

    #[test]
    fn test_record_and_query() {
        let mut timeline = FileTimeline::new("src/a.ts");
        assert!(timeline.record_snapshot(snapshot("t1", "a")));
        assert!(timeline.record_snapshot(snapshot("t2", "b")));
        assert!(!timeline.record_snapshot(snapshot("t1", "a")));
        assert!(timeline.record_snapshot(snapshot("t1", "a2")));
        timeline.record_merge_result(MergeResult::failed(&region(), MergeFailure::Cancelled, None));

        assert_eq!(timeline.snapshots().count(), 3);
        assert_eq!(timeline.merge_results().count(), 1);
        assert_eq!(
            timeline.latest_snapshot("t1").unwrap().content_hash,
            crate::models::content_hash("a2")
        );
        assert_eq!(timeline.pending_tasks(), vec!["t1", "t2"]);

        timeline.record_main_branch_event(MainBranchEvent {
            commit_ref: "abc123".into(),
            task_ids: vec!["t1".into()],
            content_hash: crate::models::content_hash("merged"),
            description: None,
        });
        assert!(timeline.is_landed("t1"));
        assert!(!timeline.is_landed("t2"));
        assert_eq!(timeline.pending_tasks(), vec!["t2"]);
    }

    #[test]
    fn test_timestamps_are_monotonic() {
        let mut timeline = FileTimeline::new("f.py");
        for i in 0..20 {
            timeline.record_snapshot(snapshot("t", &i.to_string()));
        }
        assert!(timeline
            .events
            .windows(2)
            .all(|w| w[0].timestamp <= w[1].timestamp));
    }

    #[test]
    fn test_event_serialization_shape() {
        let mut timeline = FileTimeline::new("f.py");
        timeline.record_merge_result(MergeResult::human_required(&region(), "blocking"));
        let json = serde_json::to_value(&timeline).unwrap();
        assert_eq!(json["events"][0]["kind"], "merge_result");
        assert_eq!(json["events"][0]["payload"]["decision"], "HUMAN_REQUIRED");

        let back: FileTimeline = serde_json::from_value(json).unwrap();
        assert_eq!(back, timeline);
    }
}
