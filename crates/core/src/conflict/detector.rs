//! Conflict detection.
//!
//! Given every task's change list for one file, the detector groups changes
//! by exact location and classifies each location touched by more than one
//! task into a [`ConflictRegion`] with a severity.

use std::collections::{BTreeSet, HashMap};

use tracing::{debug, info};

use crate::models::{
    ChangeDetail, ChangeType, ConflictRegion, ConflictSeverity, SemanticChange, TaskSnapshot,
};

use super::strategies::strategy_for;

// ---------------------------------------------------------------------------
// Grouping
// ---------------------------------------------------------------------------

/// All changes recorded at one location, tagged with their task.
#[derive(Debug, Clone)]
pub(crate) struct LocationGroup<'a> {
    pub location: &'a str,
    pub contributions: Vec<(&'a str, &'a SemanticChange)>,
}

impl<'a> LocationGroup<'a> {
    /// Distinct task ids in first-seen order.
    pub fn tasks(&self) -> Vec<String> {
        let mut tasks: Vec<String> = Vec::new();
        for (task, _) in &self.contributions {
            if !tasks.iter().any(|t| t == task) {
                tasks.push(task.to_string());
            }
        }
        tasks
    }

    pub fn change_types(&self) -> BTreeSet<ChangeType> {
        self.contributions
            .iter()
            .map(|(_, c)| c.change_type)
            .collect()
    }

    /// Every task contributed exactly the same set of changes.
    pub fn is_unanimous(&self) -> bool {
        let mut per_task: Vec<(&str, Vec<String>)> = Vec::new();
        for (task, change) in &self.contributions {
            match per_task.iter_mut().find(|(t, _)| t == task) {
                Some((_, hashes)) => hashes.push(change.content_hash()),
                None => per_task.push((*task, vec![change.content_hash()])),
            }
        }
        for (_, hashes) in per_task.iter_mut() {
            hashes.sort();
        }
        per_task.windows(2).all(|w| w[0].1 == w[1].1)
    }
}

/// Group changes by location in first-seen order (task order, then each
/// task's detection order).
pub(crate) fn group_by_location(snapshots: &[TaskSnapshot]) -> Vec<LocationGroup<'_>> {
    let mut groups: Vec<LocationGroup<'_>> = Vec::new();
    let mut index: HashMap<&str, usize> = HashMap::new();
    for snapshot in snapshots {
        for change in &snapshot.semantic_changes {
            let slot = *index.entry(change.location.as_str()).or_insert_with(|| {
                groups.push(LocationGroup {
                    location: change.location.as_str(),
                    contributions: Vec::new(),
                });
                groups.len() - 1
            });
            groups[slot]
                .contributions
                .push((snapshot.task_id.as_str(), change));
        }
    }
    groups
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

/// Stateless conflict detector over task snapshots of one file.
pub struct ConflictDetector;

impl ConflictDetector {
    /// Regions where two or more tasks made differing changes at the same
    /// location, in first-seen location order.
    pub fn detect(file_path: &str, snapshots: &[TaskSnapshot]) -> Vec<ConflictRegion> {
        info!(
            file = file_path,
            tasks = snapshots.len(),
            "detecting conflicts"
        );

        let regions: Vec<ConflictRegion> = group_by_location(snapshots)
            .iter()
            .filter(|g| g.tasks().len() > 1 && !g.is_unanimous())
            .map(|g| Self::region_for(file_path, g))
            .collect();

        info!(
            file = file_path,
            count = regions.len(),
            "conflict detection complete"
        );
        regions
    }

    /// One region per location, including uncontested and unanimous ones
    /// (which get severity NONE). Used by the engine to apply every change.
    pub fn plan(file_path: &str, snapshots: &[TaskSnapshot]) -> Vec<ConflictRegion> {
        group_by_location(snapshots)
            .iter()
            .map(|g| {
                if g.tasks().len() > 1 && !g.is_unanimous() {
                    Self::region_for(file_path, g)
                } else {
                    let change_types = g.change_types();
                    ConflictRegion {
                        file_path: file_path.to_string(),
                        location: g.location.to_string(),
                        tasks_involved: g.tasks(),
                        can_auto_merge: strategy_for(&change_types).is_some(),
                        change_types,
                        severity: ConflictSeverity::None,
                    }
                }
            })
            .collect()
    }

    fn region_for(file_path: &str, group: &LocationGroup<'_>) -> ConflictRegion {
        let change_types = group.change_types();
        let severity = classify(&group.contributions);
        let can_auto_merge =
            severity <= ConflictSeverity::Low && strategy_for(&change_types).is_some();
        debug!(
            file = file_path,
            location = group.location,
            severity = %severity,
            can_auto_merge,
            "conflict region"
        );
        ConflictRegion {
            file_path: file_path.to_string(),
            location: group.location.to_string(),
            tasks_involved: group.tasks(),
            change_types,
            severity,
            can_auto_merge,
        }
    }
}

/// Severity cascade; the first matching rule wins.
pub(crate) fn classify(contributions: &[(&str, &SemanticChange)]) -> ConflictSeverity {
    let types: BTreeSet<ChangeType> = contributions.iter().map(|(_, c)| c.change_type).collect();

    // 1. Purely additive imports or exports.
    if types.len() == 1
        && matches!(
            types.first(),
            Some(ChangeType::AddImport | ChangeType::AddExport)
        )
    {
        return ConflictSeverity::None;
    }

    // 2. Attribute edits that never disagree on a name.
    if types.len() == 1
        && types.contains(&ChangeType::ModifyJsxProps)
        && props_are_disjoint(contributions)
    {
        return ConflictSeverity::Low;
    }

    // 3. Removal racing an addition or modification of the same target.
    let mut by_target: HashMap<&str, Vec<ChangeType>> = HashMap::new();
    for (_, change) in contributions {
        by_target
            .entry(change.target.as_str())
            .or_default()
            .push(change.change_type);
    }
    if by_target.values().any(|kinds| {
        kinds.iter().any(|k| k.is_removal()) && kinds.iter().any(|k| !k.is_removal())
    }) {
        return ConflictSeverity::Medium;
    }

    // 4. Two or more tasks rewriting the same body.
    let mut body_editors: HashMap<&str, BTreeSet<&str>> = HashMap::new();
    for (task, change) in contributions {
        if change.change_type.is_body_modification() {
            body_editors
                .entry(change.target.as_str())
                .or_default()
                .insert(*task);
        }
    }
    if body_editors.values().any(|tasks| tasks.len() >= 2) {
        return ConflictSeverity::High;
    }

    // 5. Signatures and types.
    if types.iter().any(|t| t.is_structural()) {
        return ConflictSeverity::Blocking;
    }

    let import_export_only = types.iter().all(|t| {
        matches!(
            t,
            ChangeType::AddImport
                | ChangeType::RemoveImport
                | ChangeType::AddExport
                | ChangeType::RemoveExport
        )
    });
    if import_export_only {
        ConflictSeverity::Low
    } else {
        ConflictSeverity::Medium
    }
}

/// No attribute name is set by two tasks to different values.
fn props_are_disjoint(contributions: &[(&str, &SemanticChange)]) -> bool {
    let mut seen: HashMap<&str, (&str, Option<&str>)> = HashMap::new();
    for (task, change) in contributions {
        let ChangeDetail::JsxProps { props, .. } = &change.detail else {
            return false;
        };
        for prop in props {
            let value = prop.value.as_deref();
            match seen.get(prop.name.as_str()) {
                Some((other_task, other_value)) if other_task != task && *other_value != value => {
                    return false;
                }
                Some(_) => {}
                None => {
                    seen.insert(prop.name.as_str(), (*task, value));
                }
            }
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    use crate::models::{jsx_location, PropChange, FILE_TOP};

    fn snapshot(task: &str, changes: Vec<SemanticChange>) -> TaskSnapshot {
        TaskSnapshot::new(
            task,
            format!("intent of {task}"),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
            "",
            changes,
        )
    }

    fn add_import(stmt: &str) -> SemanticChange {
        SemanticChange {
            change_type: ChangeType::AddImport,
            target: stmt.into(),
            location: FILE_TOP.into(),
            line_start: 1,
            line_end: 1,
            content_before: None,
            content_after: Some(stmt.into()),
            detail: ChangeDetail::Import {
                statement: stmt.into(),
                source: "x".into(),
                bindings: vec![],
            },
        }
    }

    fn decl(change_type: ChangeType, name: &str, body: &str) -> SemanticChange {
        let kind = change_type.declaration_kind().unwrap();
        SemanticChange {
            change_type,
            target: name.into(),
            location: crate::models::declaration_location(kind, name),
            line_start: 1,
            line_end: 3,
            content_before: Some("old".into()),
            content_after: if change_type.is_removal() {
                None
            } else {
                Some(body.into())
            },
            detail: ChangeDetail::Declaration { kind, anchor: None },
        }
    }

    fn props(name: &str, value: &str) -> SemanticChange {
        SemanticChange {
            change_type: ChangeType::ModifyJsxProps,
            target: "Button".into(),
            location: jsx_location("App", "Button", 0),
            line_start: 4,
            line_end: 4,
            content_before: None,
            content_after: None,
            detail: ChangeDetail::JsxProps {
                component: "Button".into(),
                occurrence: 0,
                props: vec![PropChange {
                    name: name.into(),
                    value: Some(value.into()),
                }],
            },
        }
    }

    #[test]
    fn test_single_task_locations_emit_nothing() {
        let snaps = vec![
            snapshot("a", vec![add_import("import a")]),
            snapshot("b", vec![decl(ChangeType::AddFunction, "f", "function f() {}")]),
        ];
        assert!(ConflictDetector::detect("x.ts", &snaps).is_empty());
        let plan = ConflictDetector::plan("x.ts", &snaps);
        assert_eq!(plan.len(), 2);
        assert!(plan.iter().all(|r| r.is_uncontested() && r.can_auto_merge));
    }

    #[test]
    fn test_additive_imports_are_none() {
        let snaps = vec![
            snapshot("a", vec![add_import("import a")]),
            snapshot("b", vec![add_import("import b")]),
        ];
        let regions = ConflictDetector::detect("x.ts", &snaps);
        assert_eq!(regions.len(), 1);
        assert_eq!(regions[0].severity, ConflictSeverity::None);
        assert!(regions[0].can_auto_merge);
        assert_eq!(regions[0].tasks_involved, vec!["a", "b"]);
    }

    #[test]
    fn test_identical_contributions_are_not_conflicts() {
        let snaps = vec![
            snapshot("a", vec![decl(ChangeType::ModifyFunctionBody, "f", "same")]),
            snapshot("b", vec![decl(ChangeType::ModifyFunctionBody, "f", "same")]),
        ];
        assert!(ConflictDetector::detect("x.ts", &snaps).is_empty());
        let plan = ConflictDetector::plan("x.ts", &snaps);
        assert_eq!(plan[0].severity, ConflictSeverity::None);
        assert_eq!(plan[0].tasks_involved.len(), 2);
    }

    #[test]
    fn test_disjoint_props_are_low_and_colliding_props_are_medium() {
        let snaps = vec![
            snapshot("a", vec![props("variant", "\"primary\"")]),
            snapshot("b", vec![props("size", "\"sm\"")]),
        ];
        let regions = ConflictDetector::detect("x.tsx", &snaps);
        assert_eq!(regions[0].severity, ConflictSeverity::Low);
        assert!(regions[0].can_auto_merge);

        let snaps = vec![
            snapshot("a", vec![props("variant", "\"primary\"")]),
            snapshot("b", vec![props("variant", "\"ghost\"")]),
        ];
        let regions = ConflictDetector::detect("x.tsx", &snaps);
        assert_eq!(regions[0].severity, ConflictSeverity::Medium);
        assert!(!regions[0].can_auto_merge);
    }

    #[test]
    fn test_remove_vs_modify_is_medium() {
        let snaps = vec![
            snapshot("a", vec![decl(ChangeType::RemoveFunction, "f", "")]),
            snapshot("b", vec![decl(ChangeType::ModifyFunctionBody, "f", "new")]),
        ];
        let regions = ConflictDetector::detect("x.ts", &snaps);
        assert_eq!(regions[0].severity, ConflictSeverity::Medium);
    }

    #[test]
    fn test_competing_bodies_are_high() {
        let snaps = vec![
            snapshot("a", vec![decl(ChangeType::ModifyFunctionBody, "f", "one")]),
            snapshot("b", vec![decl(ChangeType::ModifyFunctionBody, "f", "two")]),
        ];
        let regions = ConflictDetector::detect("x.ts", &snaps);
        assert_eq!(regions[0].severity, ConflictSeverity::High);
        assert!(!regions[0].can_auto_merge);
    }

    #[test]
    fn test_signature_change_is_blocking() {
        let snaps = vec![
            snapshot("a", vec![decl(ChangeType::ModifyFunctionSignature, "f", "one")]),
            snapshot("b", vec![decl(ChangeType::ModifyFunctionBody, "f", "two")]),
        ];
        let regions = ConflictDetector::detect("x.ts", &snaps);
        assert_eq!(regions[0].severity, ConflictSeverity::Blocking);
    }

    #[test]
    fn test_cascade_prefers_earlier_rules() {
        // Body edits by two tasks plus a signature edit: HIGH is checked first.
        let snaps = vec![
            snapshot("a", vec![decl(ChangeType::ModifyFunctionBody, "f", "one")]),
            snapshot("b", vec![decl(ChangeType::ModifyFunctionBody, "f", "two")]),
            snapshot("c", vec![decl(ChangeType::ModifyFunctionSignature, "f", "three")]),
        ];
        let regions = ConflictDetector::detect("x.ts", &snaps);
        assert_eq!(regions[0].severity, ConflictSeverity::High);

        // Competing additions of the same declaration fall through to MEDIUM.
        let snaps = vec![
            snapshot("a", vec![decl(ChangeType::AddType, "T", "type T = 1")]),
            snapshot("b", vec![decl(ChangeType::AddType, "T", "type T = 2")]),
        ];
        assert_eq!(
            ConflictDetector::detect("x.ts", &snaps)[0].severity,
            ConflictSeverity::Medium
        );
    }

    #[test]
    fn test_detection_is_symmetric_in_task_order() {
        let a = snapshot(
            "a",
            vec![add_import("import a"), props("variant", "\"primary\"")],
        );
        let b = snapshot(
            "b",
            vec![add_import("import b"), props("size", "\"sm\"")],
        );
        let c = snapshot("c", vec![decl(ChangeType::ModifyFunctionBody, "App", "x")]);
        let forward = ConflictDetector::detect("x.tsx", &[a.clone(), b.clone(), c.clone()]);
        let backward = ConflictDetector::detect("x.tsx", &[c, b, a]);
        assert_eq!(forward.len(), backward.len());
        for region in &forward {
            let other = backward
                .iter()
                .find(|r| r.location == region.location)
                .unwrap();
            assert_eq!(other.severity, region.severity);
            assert_eq!(other.can_auto_merge, region.can_auto_merge);
            let mut x = region.tasks_involved.clone();
            let mut y = other.tasks_involved.clone();
            x.sort();
            y.sort();
            assert_eq!(x, y);
        }
    }
}
