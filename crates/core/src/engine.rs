//! The merge engine.
//!
//! [`MergeEngine`] reconciles every task's edits to a set of files. For each
//! file it:
//!
//! 1. Analyzes each task's (baseline, after) pair into semantic changes.
//! 2. Plans one region per touched location and grades contested ones.
//! 3. Applies safe regions with a deterministic strategy, threading a working
//!    copy of the file through them.
//! 4. Hands everything else to the AI resolver, or to a human when the
//!    region is blocking or no resolver is available.
//! 5. Appends snapshots and results to the file's timeline and saves it.
//!
//! Files run in parallel up to `engine.max_parallel_files`; each file's
//! timeline is held under its writer lock for the whole cycle.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::analyzer::{Language, SemanticAnalyzer};
use crate::config::{EngineConfig, MergeConfig};
use crate::conflict::{strategy_for, AiResolver, ConflictDetector, MergeContext, StrategyRegistry};
use crate::errors::{CoreError, TimelineError};
use crate::llm::{HttpLlmClient, LlmClient};
use crate::models::{
    ConflictRegion, ConflictSeverity, MainBranchEvent, MergeDecision, MergeResult, TaskSnapshot,
};
use crate::timeline::{FileTimeline, TimelineStore};

/// Location key used for whole-file results.
pub const WHOLE_FILE: &str = "file";

/// Strategy name recorded when only one task touched a file.
pub const SINGLE_TASK: &str = "single_task";

// ---------------------------------------------------------------------------
// Requests & outcomes
// ---------------------------------------------------------------------------

/// One task's version of a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInput {
    pub task_id: String,
    #[serde(default)]
    pub intent: String,
    #[serde(default = "Utc::now")]
    pub started_at: DateTime<Utc>,
    /// Full file content after the task's edits.
    pub after: String,
}

/// Everything needed to merge one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMergeRequest {
    pub file_path: String,
    /// Content all tasks started from.
    pub baseline: String,
    pub tasks: Vec<TaskInput>,
}

/// Counts of region outcomes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeStats {
    pub regions: usize,
    pub auto_merged: usize,
    pub ai_resolved: usize,
    pub failed: usize,
    pub human_required: usize,
}

impl MergeStats {
    pub fn from_results(results: &[MergeResult]) -> Self {
        let mut stats = Self {
            regions: results.len(),
            ..Self::default()
        };
        for result in results {
            match result.decision {
                MergeDecision::AutoMerged => stats.auto_merged += 1,
                MergeDecision::AiResolved => stats.ai_resolved += 1,
                MergeDecision::Failed => stats.failed += 1,
                MergeDecision::HumanRequired => stats.human_required += 1,
            }
        }
        stats
    }
}

/// Result of merging one file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMergeOutcome {
    pub file_path: String,
    /// One result per region, in region order.
    pub results: Vec<MergeResult>,
    /// Final file content; present only when every region succeeded.
    pub merged_content: Option<String>,
    /// Set when the file matched a skip pattern and was not merged.
    #[serde(default)]
    pub skipped: bool,
}

impl FileMergeOutcome {
    pub fn stats(&self) -> MergeStats {
        MergeStats::from_results(&self.results)
    }

    /// Regions a caller must act on (FAILED or HUMAN_REQUIRED).
    pub fn escalations(&self) -> impl Iterator<Item = &MergeResult> {
        self.results.iter().filter(|r| !r.is_success())
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

struct EngineInner {
    config: EngineConfig,
    store: TimelineStore,
    resolver: AiResolver,
}

/// Cheap-to-clone handle; clones share the store and its locks.
#[derive(Clone)]
pub struct MergeEngine {
    inner: Arc<EngineInner>,
}

impl MergeEngine {
    /// Create an engine with an explicit LLM client (or none).
    pub fn new(config: &MergeConfig, client: Option<Arc<dyn LlmClient>>) -> Self {
        info!(
            root = %config.storage.root.display(),
            max_parallel_files = config.engine.max_parallel_files,
            resolver = client.is_some() && config.resolver.enabled,
            "initializing merge engine"
        );
        Self {
            inner: Arc::new(EngineInner {
                config: config.engine.clone(),
                store: TimelineStore::new(&config.storage.root),
                resolver: AiResolver::new(client, config.resolver.clone()),
            }),
        }
    }

    /// Create an engine that talks to the configured HTTP endpoint. Without
    /// a resolved API key the resolver is left out and unresolvable regions
    /// go to a human.
    pub fn from_config(config: &MergeConfig) -> Self {
        let client: Option<Arc<dyn LlmClient>> = if config.resolver.enabled {
            match HttpLlmClient::new(&config.llm) {
                Ok(client) => Some(Arc::new(client)),
                Err(e) => {
                    warn!(error = %e, "AI resolver unavailable");
                    None
                }
            }
        } else {
            None
        };
        Self::new(config, client)
    }

    pub fn store(&self) -> &TimelineStore {
        &self.inner.store
    }

    /// Merge many files concurrently. Results are returned in input order.
    pub async fn run(
        &self,
        requests: Vec<FileMergeRequest>,
        cancel: CancellationToken,
    ) -> Vec<Result<FileMergeOutcome, CoreError>> {
        let permits = Arc::new(Semaphore::new(self.inner.config.max_parallel_files.max(1)));
        let paths: Vec<String> = requests.iter().map(|r| r.file_path.clone()).collect();
        info!(files = paths.len(), "starting merge run");

        let mut set = JoinSet::new();
        for (idx, request) in requests.into_iter().enumerate() {
            let engine = self.clone();
            let permits = permits.clone();
            let cancel = cancel.clone();
            set.spawn(async move {
                let _permit = permits.acquire_owned().await;
                (idx, engine.process_file(request, &cancel).await)
            });
        }

        let mut slots: Vec<Option<Result<FileMergeOutcome, CoreError>>> =
            paths.iter().map(|_| None).collect();
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok((idx, outcome)) => slots[idx] = Some(outcome),
                Err(e) => error!(error = %e, "merge worker failed"),
            }
        }

        slots
            .into_iter()
            .zip(paths)
            .map(|(slot, file_path)| {
                slot.unwrap_or_else(|| {
                    Err(CoreError::WorkerFailed {
                        file_path,
                        detail: "task panicked or was aborted".into(),
                    })
                })
            })
            .collect()
    }

    /// Merge one file and record the cycle in its timeline.
    pub async fn process_file(
        &self,
        request: FileMergeRequest,
        cancel: &CancellationToken,
    ) -> Result<FileMergeOutcome, CoreError> {
        let file_path = request.file_path.as_str();
        if self.inner.config.is_skipped(file_path) {
            info!(file = file_path, "file matches a skip pattern; not merging");
            return Ok(FileMergeOutcome {
                file_path: request.file_path.clone(),
                results: Vec::new(),
                merged_content: None,
                skipped: true,
            });
        }
        let language = SemanticAnalyzer::language_for(file_path)?;

        let _guard = self.inner.store.write_lock(file_path).await;
        let mut timeline = self.load_for_write(file_path)?;

        let snapshots = analyze_tasks(&request)?;
        for snapshot in &snapshots {
            timeline.record_snapshot(snapshot.clone());
        }

        let touched: Vec<&TaskInput> = request
            .tasks
            .iter()
            .filter(|t| t.after != request.baseline)
            .collect();
        info!(
            file = file_path,
            tasks = request.tasks.len(),
            touched = touched.len(),
            "merging file"
        );

        let (results, working) = match touched.as_slice() {
            [] => (Vec::new(), request.baseline.clone()),
            [only] => {
                let region = whole_file_region(file_path, only, &snapshots);
                let result = MergeResult::auto_merged(&region, only.after.clone(), SINGLE_TASK);
                (vec![result], only.after.clone())
            }
            _ => {
                self.merge_regions(file_path, language, &request.baseline, &snapshots, cancel)
                    .await
            }
        };

        let merged_content = results
            .iter()
            .all(MergeResult::is_success)
            .then_some(working);
        for result in &results {
            timeline.record_merge_result(result.clone());
        }
        self.persist(file_path, timeline).await?;

        let outcome = FileMergeOutcome {
            file_path: request.file_path.clone(),
            results,
            merged_content,
            skipped: false,
        };
        let stats = outcome.stats();
        info!(
            file = file_path,
            regions = stats.regions,
            auto_merged = stats.auto_merged,
            ai_resolved = stats.ai_resolved,
            failed = stats.failed,
            human_required = stats.human_required,
            "file merge complete"
        );
        Ok(outcome)
    }

    /// Route every planned region. Returns per-region results in region
    /// order plus the final working content.
    async fn merge_regions(
        &self,
        file_path: &str,
        language: Language,
        baseline: &str,
        snapshots: &[TaskSnapshot],
        cancel: &CancellationToken,
    ) -> (Vec<MergeResult>, String) {
        let regions = ConflictDetector::plan(file_path, snapshots);
        let mut results: Vec<Option<MergeResult>> = regions.iter().map(|_| None).collect();
        let mut pending: Vec<usize> = Vec::new();
        // FAILED strategy results, by region index.
        let mut declined: HashMap<usize, MergeResult> = HashMap::new();
        let mut working = baseline.to_string();

        for (idx, region) in regions.iter().enumerate() {
            if region.severity == ConflictSeverity::Blocking {
                warn!(
                    file = file_path,
                    location = %region.location,
                    "blocking conflict; human review required"
                );
                results[idx] = Some(MergeResult::human_required(
                    region,
                    format!("blocking conflict on {}", describe_types(region)),
                ));
                continue;
            }
            if !region.can_auto_merge {
                pending.push(idx);
                continue;
            }
            let Some(strategy) = strategy_for(&region.change_types) else {
                pending.push(idx);
                continue;
            };
            let ctx = context(file_path, language, &working, snapshots, region);
            let result = StrategyRegistry::execute(&ctx, strategy);
            if let Some(content) = result.merged_content.as_ref().filter(|_| result.is_success()) {
                working = content.clone();
                results[idx] = Some(result);
            } else {
                debug!(
                    file = file_path,
                    location = %region.location,
                    error = ?result.error,
                    "strategy failed; routing to AI resolver"
                );
                declined.insert(idx, result);
                pending.push(idx);
            }
        }

        if !self.inner.resolver.is_available() {
            // Without a resolver a strategy failure is the final word.
            let (failed, rest): (Vec<usize>, Vec<usize>) = std::mem::take(&mut pending)
                .into_iter()
                .partition(|idx| declined.contains_key(idx));
            for idx in failed {
                results[idx] = declined.remove(&idx);
            }
            pending = rest;
        }

        if !pending.is_empty() {
            let resolved = self
                .resolve_pending(file_path, language, &mut working, snapshots, &regions, &pending, cancel)
                .await;
            for (idx, result) in pending.iter().zip(resolved) {
                let result = match declined.get(idx) {
                    Some(prior) => with_strategy_failure(result, prior),
                    None => result,
                };
                results[*idx] = Some(result);
            }
        }

        let results = results
            .into_iter()
            .zip(&regions)
            .map(|(slot, region)| {
                slot.unwrap_or_else(|| MergeResult::human_required(region, "region was not routed"))
            })
            .collect();
        (results, working)
    }

    /// Send the regions no strategy could merge to the resolver, batched
    /// when configured. `working` is advanced past every resolved region.
    #[allow(clippy::too_many_arguments)]
    async fn resolve_pending(
        &self,
        file_path: &str,
        language: Language,
        working: &mut String,
        snapshots: &[TaskSnapshot],
        regions: &[ConflictRegion],
        pending: &[usize],
        cancel: &CancellationToken,
    ) -> Vec<MergeResult> {
        let resolver = &self.inner.resolver;

        if resolver.config().batch_regions && pending.len() > 1 {
            let results = {
                let ctxs: Vec<MergeContext<'_>> = pending
                    .iter()
                    .map(|&idx| context(file_path, language, working, snapshots, &regions[idx]))
                    .collect();
                resolver.resolve_batch(&ctxs, cancel).await
            };
            if let Some(content) = results
                .iter()
                .rev()
                .find(|r| r.is_success())
                .and_then(|r| r.merged_content.clone())
            {
                *working = content;
            }
            return results;
        }

        let mut results = Vec::with_capacity(pending.len());
        for &idx in pending {
            let result = {
                let ctx = context(file_path, language, working, snapshots, &regions[idx]);
                resolver.resolve(&ctx, cancel).await
            };
            if let Some(content) = result.merged_content.as_ref().filter(|_| result.is_success()) {
                *working = content.clone();
            }
            results.push(result);
        }
        results
    }

    fn load_for_write(&self, file_path: &str) -> Result<FileTimeline, TimelineError> {
        match self.inner.store.load(file_path) {
            Err(TimelineError::StorageCorruption { path, detail })
                if self.inner.config.quarantine_corrupt_timelines =>
            {
                warn!(file = file_path, path = %path, detail = %detail, "starting a fresh timeline");
                self.inner.store.quarantine(file_path)?;
                Ok(FileTimeline::new(file_path))
            }
            other => other,
        }
    }

    /// Record that `event` landed on the shared branch for `file_path`.
    pub async fn record_landed(
        &self,
        file_path: &str,
        event: MainBranchEvent,
    ) -> Result<(), TimelineError> {
        let _guard = self.inner.store.write_lock(file_path).await;
        let mut timeline = self.load_for_write(file_path)?;
        info!(
            file = file_path,
            commit = %event.commit_ref,
            tasks = event.task_ids.len(),
            "recording main branch event"
        );
        timeline.record_main_branch_event(event);
        self.persist(file_path, timeline).await
    }

    /// Save a timeline and index it on the blocking pool. Callers hold the
    /// file's writer lock until this returns.
    async fn persist(&self, file_path: &str, timeline: FileTimeline) -> Result<(), TimelineError> {
        let engine = self.clone();
        let file_path = file_path.to_string();
        tokio::task::spawn_blocking(move || {
            engine.inner.store.save(&file_path, &timeline)?;
            engine.inner.store.update_index(&[file_path.as_str()])
        })
        .await
        .map_err(std::io::Error::from)?
    }

    /// Read a file's timeline under its reader lock.
    pub async fn read_timeline(&self, file_path: &str) -> Result<FileTimeline, TimelineError> {
        let _guard = self.inner.store.read_lock(file_path).await;
        self.inner.store.load(file_path)
    }
}

fn context<'a>(
    file_path: &'a str,
    language: Language,
    working: &'a str,
    snapshots: &'a [TaskSnapshot],
    region: &'a ConflictRegion,
) -> MergeContext<'a> {
    MergeContext {
        file_path,
        baseline_content: working,
        language,
        snapshots,
        region,
    }
}

/// Note an earlier strategy failure on an escalated resolver result.
fn with_strategy_failure(mut result: MergeResult, declined: &MergeResult) -> MergeResult {
    let Some(failure) = declined.error.as_ref().filter(|_| !result.is_success()) else {
        return result;
    };
    let note = format!(
        "{} failed first: {}",
        declined.strategy_used.as_deref().unwrap_or("strategy"),
        failure
    );
    result.reason = Some(match result.reason.take() {
        Some(reason) => format!("{}; {}", reason, note),
        None => note,
    });
    result
}

fn describe_types(region: &ConflictRegion) -> String {
    region
        .change_types
        .iter()
        .map(|t| t.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Analyze every task against the shared baseline.
fn analyze_tasks(request: &FileMergeRequest) -> Result<Vec<TaskSnapshot>, CoreError> {
    let extension = std::path::Path::new(&request.file_path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or_default();
    request
        .tasks
        .iter()
        .map(|task| -> Result<TaskSnapshot, CoreError> {
            let changes = SemanticAnalyzer::analyze(
                &request.file_path,
                &request.baseline,
                &task.after,
                extension,
            )?;
            debug!(
                file = %request.file_path,
                task_id = %task.task_id,
                changes = changes.len(),
                "task analyzed"
            );
            Ok(TaskSnapshot::new(
                task.task_id.clone(),
                task.intent.clone(),
                task.started_at,
                &task.after,
                changes,
            ))
        })
        .collect()
}

fn whole_file_region(file_path: &str, task: &TaskInput, snapshots: &[TaskSnapshot]) -> ConflictRegion {
    let change_types: BTreeSet<_> = snapshots
        .iter()
        .filter(|s| s.task_id == task.task_id)
        .flat_map(|s| s.semantic_changes.iter().map(|c| c.change_type))
        .collect();
    ConflictRegion {
        file_path: file_path.to_string(),
        location: WHOLE_FILE.to_string(),
        tasks_involved: vec![task.task_id.clone()],
        change_types,
        severity: ConflictSeverity::None,
        can_auto_merge: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(root: &std::path::Path) -> MergeConfig {
        let mut config = MergeConfig::default();
        config.storage.root = root.to_path_buf();
        config
    }

    fn task(id: &str, after: &str) -> TaskInput {
        TaskInput {
            task_id: id.into(),
            intent: format!("intent of {id}"),
            started_at: Utc::now(),
            after: after.into(),
        }
    }

    #[test]
    fn test_merge_stats() {
        let region = ConflictRegion {
            file_path: "a.py".into(),
            location: WHOLE_FILE.into(),
            tasks_involved: vec!["t".into()],
            change_types: BTreeSet::new(),
            severity: ConflictSeverity::None,
            can_auto_merge: true,
        };
        let results = vec![
            MergeResult::auto_merged(&region, "x".into(), SINGLE_TASK),
            MergeResult::human_required(&region, "why"),
        ];
        let stats = MergeStats::from_results(&results);
        assert_eq!(stats.regions, 2);
        assert_eq!(stats.auto_merged, 1);
        assert_eq!(stats.human_required, 1);
    }

    #[test]
    fn test_strategy_failure_noted_on_escalation() {
        let region = ConflictRegion {
            file_path: "a.ts".into(),
            location: crate::models::FILE_TOP.into(),
            tasks_involved: vec!["t1".into(), "t2".into()],
            change_types: BTreeSet::new(),
            severity: ConflictSeverity::None,
            can_auto_merge: true,
        };
        let declined = MergeResult::failed(
            &region,
            crate::models::MergeFailure::StrategyDeclined {
                reason: "local name 'x' is bound twice".into(),
            },
            Some("combine_imports"),
        );

        let human = with_strategy_failure(
            MergeResult::human_required(&region, "no AI resolver available"),
            &declined,
        );
        assert_eq!(
            human.reason.as_deref(),
            Some("no AI resolver available; combine_imports failed first: strategy declined: local name 'x' is bound twice")
        );

        let resolved = MergeResult::ai_resolved(&region, "import x from \"y\";\n".into());
        assert_eq!(with_strategy_failure(resolved.clone(), &declined), resolved);
    }

    #[tokio::test]
    async fn test_single_task_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MergeEngine::new(&config(dir.path()), None);
        let base = "def a():\n    return 1\n";
        let after = "def a():\n    return 2\n";
        let outcome = engine
            .process_file(
                FileMergeRequest {
                    file_path: "pkg/a.py".into(),
                    baseline: base.into(),
                    tasks: vec![task("t1", after), task("t2", base)],
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(outcome.results.len(), 1);
        assert_eq!(outcome.results[0].strategy_used.as_deref(), Some(SINGLE_TASK));
        assert_eq!(outcome.merged_content.as_deref(), Some(after));

        let timeline = engine.read_timeline("pkg/a.py").await.unwrap();
        assert_eq!(timeline.snapshots().count(), 2);
        assert_eq!(timeline.merge_results().count(), 1);
    }

    #[tokio::test]
    async fn test_skip_pattern_bypasses_merge() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MergeEngine::new(&config(dir.path()), None);
        let outcome = engine
            .process_file(
                FileMergeRequest {
                    file_path: "web/yarn.lock".into(),
                    baseline: "a".into(),
                    tasks: vec![task("t1", "b"), task("t2", "c")],
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert!(outcome.skipped);
        assert!(outcome.results.is_empty());
        assert!(engine.store().tracked_files().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_unsupported_language_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MergeEngine::new(&config(dir.path()), None);
        let err = engine
            .process_file(
                FileMergeRequest {
                    file_path: "README.md".into(),
                    baseline: "a".into(),
                    tasks: vec![task("t1", "b"), task("t2", "c")],
                },
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::Analyzer(_)));
    }

    #[tokio::test]
    async fn test_record_landed() {
        let dir = tempfile::tempdir().unwrap();
        let engine = MergeEngine::new(&config(dir.path()), None);
        engine
            .record_landed(
                "src/lib.rs",
                MainBranchEvent {
                    commit_ref: "c0ffee".into(),
                    task_ids: vec!["t1".into()],
                    content_hash: crate::models::content_hash("x"),
                    description: None,
                },
            )
            .await
            .unwrap();
        let timeline = engine.read_timeline("src/lib.rs").await.unwrap();
        assert!(timeline.is_landed("t1"));
        assert_eq!(engine.store().tracked_files().unwrap(), vec!["src/lib.rs"]);
    }
}
