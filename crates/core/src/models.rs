//! Shared vocabulary of the merge engine: change kinds, locations,
//! severities, and results.
//!
//! These types bridge the analyzer, detector, strategies, resolver, and the
//! timeline store. They carry no merge logic beyond invariant checks.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ---------------------------------------------------------------------------
// Content hashing
// ---------------------------------------------------------------------------

/// Deterministic content address for a stored blob (`sha256:<hex>`).
pub fn content_hash(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    format!("sha256:{}", hex::encode(digest))
}

// ---------------------------------------------------------------------------
// Locations
// ---------------------------------------------------------------------------

/// Location key for the import block at the top of a file.
pub const FILE_TOP: &str = "file_top";

/// Location key for the file's export statements.
pub const FILE_EXPORTS: &str = "file_exports";

/// Location key for a named top-level declaration, e.g. `function:render`.
pub fn declaration_location(kind: DeclarationKind, name: &str) -> String {
    format!("{}:{}", kind.location_prefix(), name)
}

/// Location key for the `occurrence`-th opening tag of `component` inside
/// the top-level declaration `enclosing` (empty for file scope).
pub fn jsx_location(enclosing: &str, component: &str, occurrence: usize) -> String {
    if enclosing.is_empty() {
        format!("jsx:{}#{}", component, occurrence)
    } else {
        format!("jsx:{}/{}#{}", enclosing, component, occurrence)
    }
}

// ---------------------------------------------------------------------------
// Change kinds
// ---------------------------------------------------------------------------

/// Family of a top-level declaration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclarationKind {
    Function,
    Class,
    Variable,
    Type,
}

impl DeclarationKind {
    pub fn location_prefix(self) -> &'static str {
        match self {
            Self::Function => "function",
            Self::Class => "class",
            Self::Variable => "variable",
            Self::Type => "type",
        }
    }
}

/// What happened to a declaration between two versions of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclarationOp {
    Added,
    Removed,
    /// Body changed, header unchanged.
    Modified,
    /// Header (signature) changed.
    Reshaped,
}

/// Closed set of semantic change kinds.
///
/// Declaration order is the canonical sort order used for strategy keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    AddImport,
    RemoveImport,
    AddExport,
    RemoveExport,
    AddFunction,
    RemoveFunction,
    ModifyFunctionBody,
    ModifyFunctionSignature,
    AddClass,
    RemoveClass,
    ModifyClass,
    AddVariable,
    RemoveVariable,
    ModifyVariable,
    AddType,
    RemoveType,
    ModifyType,
    ModifyJsxProps,
}

impl ChangeType {
    /// Map a declaration kind and operation onto its change type.
    pub fn for_declaration(kind: DeclarationKind, op: DeclarationOp) -> Self {
        use DeclarationKind as K;
        use DeclarationOp as O;
        match (kind, op) {
            (K::Function, O::Added) => Self::AddFunction,
            (K::Function, O::Removed) => Self::RemoveFunction,
            (K::Function, O::Modified) => Self::ModifyFunctionBody,
            (K::Function, O::Reshaped) => Self::ModifyFunctionSignature,
            (K::Class, O::Added) => Self::AddClass,
            (K::Class, O::Removed) => Self::RemoveClass,
            (K::Class, O::Modified | O::Reshaped) => Self::ModifyClass,
            (K::Variable, O::Added) => Self::AddVariable,
            (K::Variable, O::Removed) => Self::RemoveVariable,
            (K::Variable, O::Modified | O::Reshaped) => Self::ModifyVariable,
            (K::Type, O::Added) => Self::AddType,
            (K::Type, O::Removed) => Self::RemoveType,
            (K::Type, O::Modified | O::Reshaped) => Self::ModifyType,
        }
    }

    /// The declaration family this change belongs to, if any.
    pub fn declaration_kind(self) -> Option<DeclarationKind> {
        match self {
            Self::AddFunction
            | Self::RemoveFunction
            | Self::ModifyFunctionBody
            | Self::ModifyFunctionSignature => Some(DeclarationKind::Function),
            Self::AddClass | Self::RemoveClass | Self::ModifyClass => Some(DeclarationKind::Class),
            Self::AddVariable | Self::RemoveVariable | Self::ModifyVariable => {
                Some(DeclarationKind::Variable)
            }
            Self::AddType | Self::RemoveType | Self::ModifyType => Some(DeclarationKind::Type),
            _ => None,
        }
    }

    pub fn is_addition(self) -> bool {
        matches!(
            self,
            Self::AddImport
                | Self::AddExport
                | Self::AddFunction
                | Self::AddClass
                | Self::AddVariable
                | Self::AddType
        )
    }

    pub fn is_removal(self) -> bool {
        matches!(
            self,
            Self::RemoveImport
                | Self::RemoveExport
                | Self::RemoveFunction
                | Self::RemoveClass
                | Self::RemoveVariable
                | Self::RemoveType
        )
    }

    pub fn is_modification(self) -> bool {
        !self.is_addition() && !self.is_removal()
    }

    /// Free-text body edits that cannot be combined mechanically.
    pub fn is_body_modification(self) -> bool {
        matches!(
            self,
            Self::ModifyFunctionBody | Self::ModifyClass | Self::ModifyVariable
        )
    }

    /// Type or signature edits: a location carrying these is unsafe to merge
    /// without a human.
    pub fn is_structural(self) -> bool {
        matches!(self, Self::ModifyFunctionSignature | Self::ModifyType)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::AddImport => "ADD_IMPORT",
            Self::RemoveImport => "REMOVE_IMPORT",
            Self::AddExport => "ADD_EXPORT",
            Self::RemoveExport => "REMOVE_EXPORT",
            Self::AddFunction => "ADD_FUNCTION",
            Self::RemoveFunction => "REMOVE_FUNCTION",
            Self::ModifyFunctionBody => "MODIFY_FUNCTION_BODY",
            Self::ModifyFunctionSignature => "MODIFY_FUNCTION_SIGNATURE",
            Self::AddClass => "ADD_CLASS",
            Self::RemoveClass => "REMOVE_CLASS",
            Self::ModifyClass => "MODIFY_CLASS",
            Self::AddVariable => "ADD_VARIABLE",
            Self::RemoveVariable => "REMOVE_VARIABLE",
            Self::ModifyVariable => "MODIFY_VARIABLE",
            Self::AddType => "ADD_TYPE",
            Self::RemoveType => "REMOVE_TYPE",
            Self::ModifyType => "MODIFY_TYPE",
            Self::ModifyJsxProps => "MODIFY_JSX_PROPS",
        }
    }
}

impl std::fmt::Display for ChangeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Change detail (typed metadata)
// ---------------------------------------------------------------------------

/// One name brought into scope by an import statement.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportBinding {
    /// Name as exported by the source module.
    pub imported: String,
    /// Name bound in the importing file.
    pub local: String,
}

/// A single attribute edit on a JSX opening tag.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PropChange {
    pub name: String,
    /// Raw attribute value text (`"primary"`, `{onClick}`); empty for a bare
    /// boolean attribute; `None` when the attribute was removed.
    pub value: Option<String>,
}

/// Strategy-specific data, one variant per change family.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "detail", rename_all = "snake_case")]
pub enum ChangeDetail {
    Import {
        /// Whitespace-normalized statement text.
        statement: String,
        source: String,
        bindings: Vec<ImportBinding>,
    },
    Export {
        statement: String,
    },
    Declaration {
        kind: DeclarationKind,
        /// Location of the declaration preceding this one in the task's file.
        anchor: Option<String>,
    },
    JsxProps {
        component: String,
        occurrence: usize,
        props: Vec<PropChange>,
    },
}

// ---------------------------------------------------------------------------
// SemanticChange
// ---------------------------------------------------------------------------

/// One structurally classified edit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SemanticChange {
    pub change_type: ChangeType,
    /// Symbol or statement the change applies to (may be empty).
    pub target: String,
    /// Stable region key; see [`FILE_TOP`], [`declaration_location`].
    pub location: String,
    /// Advisory, 1-indexed, for display only.
    pub line_start: usize,
    pub line_end: usize,
    pub content_before: Option<String>,
    pub content_after: Option<String>,
    pub detail: ChangeDetail,
}

impl SemanticChange {
    /// Check that `detail` has the shape `change_type` requires.
    pub fn is_consistent(&self) -> bool {
        match (&self.detail, self.change_type) {
            (ChangeDetail::Import { .. }, ChangeType::AddImport | ChangeType::RemoveImport) => true,
            (ChangeDetail::Export { .. }, ChangeType::AddExport | ChangeType::RemoveExport) => true,
            (ChangeDetail::JsxProps { props, .. }, ChangeType::ModifyJsxProps) => !props.is_empty(),
            (ChangeDetail::Declaration { kind, .. }, ct) => ct.declaration_kind() == Some(*kind),
            _ => false,
        }
    }

    /// Hash identifying the effect of this change, independent of which task
    /// produced it or where its lines fell.
    pub fn content_hash(&self) -> String {
        let mut material = String::new();
        material.push_str(self.change_type.as_str());
        material.push('\0');
        material.push_str(&self.location);
        material.push('\0');
        material.push_str(&self.target);
        material.push('\0');
        match &self.detail {
            ChangeDetail::JsxProps { props, .. } => {
                for p in props {
                    material.push_str(&p.name);
                    material.push('=');
                    material.push_str(p.value.as_deref().unwrap_or("\u{1}"));
                    material.push('\0');
                }
            }
            _ => {
                material.push_str(self.content_after.as_deref().unwrap_or_default());
            }
        }
        content_hash(&material)
    }
}

// ---------------------------------------------------------------------------
// TaskSnapshot
// ---------------------------------------------------------------------------

/// One task's contribution to a file. Immutable once recorded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub task_intent: String,
    pub started_at: DateTime<Utc>,
    /// Hash of the task's full post-edit file content.
    pub content_hash: String,
    /// In detection order.
    pub semantic_changes: Vec<SemanticChange>,
}

impl TaskSnapshot {
    pub fn new(
        task_id: impl Into<String>,
        task_intent: impl Into<String>,
        started_at: DateTime<Utc>,
        after_content: &str,
        semantic_changes: Vec<SemanticChange>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            task_intent: task_intent.into(),
            started_at,
            content_hash: content_hash(after_content),
            semantic_changes,
        }
    }

    pub fn has_changes(&self) -> bool {
        !self.semantic_changes.is_empty()
    }

    /// Changes this task made at `location`, in detection order.
    pub fn changes_at<'a>(&'a self, location: &'a str) -> impl Iterator<Item = &'a SemanticChange> {
        self.semantic_changes
            .iter()
            .filter(move |c| c.location == location)
    }
}

// ---------------------------------------------------------------------------
// Severity & regions
// ---------------------------------------------------------------------------

/// Collision severity, ordered from harmless to blocking.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictSeverity {
    None,
    Low,
    Medium,
    High,
    Blocking,
}

impl std::fmt::Display for ConflictSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::None => write!(f, "none"),
            Self::Low => write!(f, "low"),
            Self::Medium => write!(f, "medium"),
            Self::High => write!(f, "high"),
            Self::Blocking => write!(f, "blocking"),
        }
    }
}

/// The unit of merge work: one location and the tasks that touched it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictRegion {
    pub file_path: String,
    pub location: String,
    /// Distinct task ids in first-seen order.
    pub tasks_involved: Vec<String>,
    pub change_types: BTreeSet<ChangeType>,
    pub severity: ConflictSeverity,
    pub can_auto_merge: bool,
}

impl ConflictRegion {
    /// A single task touched this location; nothing to reconcile.
    pub fn is_uncontested(&self) -> bool {
        self.tasks_involved.len() <= 1
    }
}

// ---------------------------------------------------------------------------
// Merge results
// ---------------------------------------------------------------------------

/// Final outcome of processing one region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MergeDecision {
    AutoMerged,
    AiResolved,
    Failed,
    HumanRequired,
}

impl std::fmt::Display for MergeDecision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AutoMerged => write!(f, "auto_merged"),
            Self::AiResolved => write!(f, "ai_resolved"),
            Self::Failed => write!(f, "failed"),
            Self::HumanRequired => write!(f, "human_required"),
        }
    }
}

/// Why a region FAILED. Serializable so it survives in the timeline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MergeFailure {
    /// A strategy refused to merge; a correctness signal, not a bug.
    StrategyDeclined { reason: String },
    UnregisteredStrategy { strategy: String },
    NoCodeBlockFound { language: String },
    MalformedResolverResponse { detail: String },
    Cancelled,
    ResolverTransport { detail: String },
    /// The code a change was computed against is no longer in the working
    /// content.
    StaleRegion { detail: String },
}

impl std::fmt::Display for MergeFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::StrategyDeclined { reason } => write!(f, "strategy declined: {}", reason),
            Self::UnregisteredStrategy { strategy } => {
                write!(f, "unregistered strategy '{}'", strategy)
            }
            Self::NoCodeBlockFound { language } => {
                write!(f, "no {} code block found", language)
            }
            Self::MalformedResolverResponse { detail } => {
                write!(f, "malformed resolver response: {}", detail)
            }
            Self::Cancelled => write!(f, "cancelled"),
            Self::ResolverTransport { detail } => write!(f, "resolver transport error: {}", detail),
            Self::StaleRegion { detail } => write!(f, "stale region: {}", detail),
        }
    }
}

/// Outcome of processing one region.
///
/// Carries the region's file, location, severity, and contributing tasks so a
/// FAILED or HUMAN_REQUIRED result can be escalated without re-deriving it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeResult {
    pub file_path: String,
    pub location: String,
    pub severity: ConflictSeverity,
    pub tasks_involved: Vec<String>,
    pub decision: MergeDecision,
    /// Present iff `decision` is AUTO_MERGED or AI_RESOLVED.
    pub merged_content: Option<String>,
    pub content_hash: Option<String>,
    pub strategy_used: Option<String>,
    /// Present iff `decision` is FAILED.
    pub error: Option<MergeFailure>,
    /// Why a human is needed, for HUMAN_REQUIRED results.
    #[serde(default)]
    pub reason: Option<String>,
}

impl MergeResult {
    fn for_region(region: &ConflictRegion, decision: MergeDecision) -> Self {
        Self {
            file_path: region.file_path.clone(),
            location: region.location.clone(),
            severity: region.severity,
            tasks_involved: region.tasks_involved.clone(),
            decision,
            merged_content: None,
            content_hash: None,
            strategy_used: None,
            error: None,
            reason: None,
        }
    }

    pub fn auto_merged(region: &ConflictRegion, content: String, strategy: &str) -> Self {
        let mut result = Self::for_region(region, MergeDecision::AutoMerged);
        result.strategy_used = Some(strategy.to_string());
        result.with_content(content)
    }

    pub fn ai_resolved(region: &ConflictRegion, content: String) -> Self {
        let mut result = Self::for_region(region, MergeDecision::AiResolved);
        result.strategy_used = Some("ai_resolver".to_string());
        result.with_content(content)
    }

    pub fn failed(region: &ConflictRegion, failure: MergeFailure, strategy: Option<&str>) -> Self {
        let mut result = Self::for_region(region, MergeDecision::Failed);
        result.strategy_used = strategy.map(str::to_string);
        result.error = Some(failure);
        result
    }

    pub fn human_required(region: &ConflictRegion, reason: impl Into<String>) -> Self {
        let mut result = Self::for_region(region, MergeDecision::HumanRequired);
        result.reason = Some(reason.into());
        result
    }

    /// Replace the merged content (and its hash).
    pub fn with_content(mut self, content: String) -> Self {
        self.content_hash = Some(content_hash(&content));
        self.merged_content = Some(content);
        self
    }

    pub fn is_success(&self) -> bool {
        matches!(
            self.decision,
            MergeDecision::AutoMerged | MergeDecision::AiResolved
        )
    }

    /// Check the decision/content/error invariants.
    pub fn is_consistent(&self) -> bool {
        self.is_success() == self.merged_content.is_some()
            && (self.decision == MergeDecision::Failed) == self.error.is_some()
    }
}

// ---------------------------------------------------------------------------
// Main branch events
// ---------------------------------------------------------------------------

/// A change set that actually landed on the shared branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainBranchEvent {
    /// Commit or merge reference on the shared branch.
    pub commit_ref: String,
    /// Tasks whose snapshots this landing integrates.
    pub task_ids: Vec<String>,
    /// Hash of the file content as landed.
    pub content_hash: String,
    #[serde(default)]
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn region() -> ConflictRegion {
        ConflictRegion {
            file_path: "src/App.tsx".into(),
            location: FILE_TOP.into(),
            tasks_involved: vec!["a".into(), "b".into()],
            change_types: BTreeSet::from([ChangeType::AddImport]),
            severity: ConflictSeverity::None,
            can_auto_merge: true,
        }
    }

    #[test]
    fn test_content_hash_is_deterministic() {
        assert_eq!(content_hash("abc"), content_hash("abc"));
        assert_ne!(content_hash("abc"), content_hash("abd"));
        assert!(content_hash("").starts_with("sha256:"));
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ConflictSeverity::None < ConflictSeverity::Low);
        assert!(ConflictSeverity::Low < ConflictSeverity::Medium);
        assert!(ConflictSeverity::High < ConflictSeverity::Blocking);
    }

    #[test]
    fn test_change_type_serde_names() {
        let json = serde_json::to_string(&ChangeType::ModifyJsxProps).unwrap();
        assert_eq!(json, "\"MODIFY_JSX_PROPS\"");
        assert_eq!(ChangeType::AddImport.to_string(), "ADD_IMPORT");
    }

    #[test]
    fn test_declaration_mapping() {
        assert_eq!(
            ChangeType::for_declaration(DeclarationKind::Function, DeclarationOp::Reshaped),
            ChangeType::ModifyFunctionSignature
        );
        assert_eq!(
            ChangeType::for_declaration(DeclarationKind::Type, DeclarationOp::Modified),
            ChangeType::ModifyType
        );
        assert!(ChangeType::ModifyType.is_structural());
        assert!(ChangeType::ModifyClass.is_body_modification());
        assert!(ChangeType::RemoveClass.is_removal());
    }

    #[test]
    fn test_detail_consistency() {
        let mut change = SemanticChange {
            change_type: ChangeType::ModifyJsxProps,
            target: "Button".into(),
            location: jsx_location("App", "Button", 0),
            line_start: 3,
            line_end: 3,
            content_before: None,
            content_after: None,
            detail: ChangeDetail::JsxProps {
                component: "Button".into(),
                occurrence: 0,
                props: vec![PropChange {
                    name: "variant".into(),
                    value: Some("\"primary\"".into()),
                }],
            },
        };
        assert!(change.is_consistent());

        change.change_type = ChangeType::AddImport;
        assert!(!change.is_consistent());
    }

    #[test]
    fn test_merge_result_invariants() {
        let r = region();
        let ok = MergeResult::auto_merged(&r, "x".into(), "combine_imports");
        assert!(ok.is_consistent());
        assert_eq!(ok.content_hash.as_deref(), Some(content_hash("x").as_str()));

        let failed = MergeResult::failed(&r, MergeFailure::Cancelled, None);
        assert!(failed.is_consistent());
        assert!(!failed.is_success());

        let human = MergeResult::human_required(&r, "blocking");
        assert!(human.is_consistent());
        assert_eq!(human.tasks_involved, vec!["a", "b"]);
    }

    #[test]
    fn test_failure_serde_tag() {
        let json = serde_json::to_value(MergeFailure::NoCodeBlockFound {
            language: "rust".into(),
        })
        .unwrap();
        assert_eq!(json["kind"], "no_code_block_found");
    }

    #[test]
    fn test_locations() {
        assert_eq!(
            declaration_location(DeclarationKind::Class, "Widget"),
            "class:Widget"
        );
        assert_eq!(jsx_location("", "Button", 2), "jsx:Button#2");
        assert_eq!(jsx_location("App", "Button", 0), "jsx:App/Button#0");
    }
}
