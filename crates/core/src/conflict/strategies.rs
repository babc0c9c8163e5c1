//! Deterministic merge strategies.
//!
//! Each strategy is a pure function from a [`MergeContext`] to whole-file
//! content. A strategy that cannot merge safely returns a FAILED
//! [`MergeResult`]; it never panics and never guesses.

use std::collections::{BTreeSet, HashMap, HashSet};

use tracing::{debug, warn};

use crate::analyzer::jsx::{apply_prop_changes, render_tag};
use crate::analyzer::locate::{
    append_block, find_declaration, find_jsx_tag, insert_block_at_line, insert_lines_after,
    parse_jsx_location, remove_declaration_lines, remove_line_spans, replace_imports,
    replace_range, splice,
};
use crate::analyzer::structure::{
    collapse_ws, extract_declarations, extract_exports, extract_imports, render_import_block,
};
use crate::analyzer::Language;
use crate::models::{
    ChangeDetail, ChangeType, ConflictRegion, ImportBinding, MergeFailure, MergeResult,
    PropChange, SemanticChange, TaskSnapshot,
};

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Every registered strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StrategyId {
    CombineImports,
    CombineExports,
    CombineProps,
    AppendDeclaration,
    ReplaceDeclaration,
    RemoveDeclaration,
}

impl StrategyId {
    pub const ALL: [StrategyId; 6] = [
        Self::CombineImports,
        Self::CombineExports,
        Self::CombineProps,
        Self::AppendDeclaration,
        Self::ReplaceDeclaration,
        Self::RemoveDeclaration,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::CombineImports => "combine_imports",
            Self::CombineExports => "combine_exports",
            Self::CombineProps => "combine_props",
            Self::AppendDeclaration => "append_declaration",
            Self::ReplaceDeclaration => "replace_declaration",
            Self::RemoveDeclaration => "remove_declaration",
        }
    }

    pub fn parse(id: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.as_str() == id)
    }
}

impl std::fmt::Display for StrategyId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The strategy registered for an exact set of change types, if any.
pub fn strategy_for(types: &BTreeSet<ChangeType>) -> Option<StrategyId> {
    use ChangeType as C;
    let key: Vec<ChangeType> = types.iter().copied().collect();
    match key.as_slice() {
        [C::AddImport] | [C::RemoveImport] | [C::AddImport, C::RemoveImport] => {
            Some(StrategyId::CombineImports)
        }
        [C::AddExport] | [C::RemoveExport] | [C::AddExport, C::RemoveExport] => {
            Some(StrategyId::CombineExports)
        }
        [C::ModifyJsxProps] => Some(StrategyId::CombineProps),
        [single] if single.declaration_kind().is_some() => {
            if single.is_addition() {
                Some(StrategyId::AppendDeclaration)
            } else if single.is_removal() {
                Some(StrategyId::RemoveDeclaration)
            } else {
                Some(StrategyId::ReplaceDeclaration)
            }
        }
        _ => None,
    }
}

/// Inputs a strategy merges from.
#[derive(Debug, Clone, Copy)]
pub struct MergeContext<'a> {
    pub file_path: &'a str,
    /// Current working content of the file.
    pub baseline_content: &'a str,
    pub language: Language,
    pub snapshots: &'a [TaskSnapshot],
    pub region: &'a ConflictRegion,
}

impl<'a> MergeContext<'a> {
    /// Changes at the region's location from the region's tasks, in task
    /// order; identical changes from several tasks appear once.
    pub fn contributions(&self) -> Vec<(&'a str, &'a SemanticChange)> {
        let region: &'a ConflictRegion = self.region;
        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for snapshot in self.snapshots {
            if !region.tasks_involved.contains(&snapshot.task_id) {
                continue;
            }
            for change in snapshot.changes_at(&region.location) {
                if seen.insert(change.content_hash()) {
                    out.push((snapshot.task_id.as_str(), change));
                }
            }
        }
        out
    }
}

/// Dispatch over [`StrategyId`].
pub struct StrategyRegistry;

impl StrategyRegistry {
    pub fn can_handle(strategy_id: &str) -> bool {
        StrategyId::parse(strategy_id).is_some()
    }

    /// Run a strategy by its string id.
    pub fn merge(ctx: &MergeContext<'_>, strategy_id: &str) -> MergeResult {
        match StrategyId::parse(strategy_id) {
            Some(strategy) => Self::execute(ctx, strategy),
            None => {
                warn!(strategy = strategy_id, "unregistered strategy requested");
                MergeResult::failed(
                    ctx.region,
                    MergeFailure::UnregisteredStrategy {
                        strategy: strategy_id.to_string(),
                    },
                    None,
                )
            }
        }
    }

    pub fn execute(ctx: &MergeContext<'_>, strategy: StrategyId) -> MergeResult {
        let outcome = match strategy {
            StrategyId::CombineImports => combine_imports(ctx),
            StrategyId::CombineExports => combine_exports(ctx),
            StrategyId::CombineProps => combine_props(ctx),
            StrategyId::AppendDeclaration => append_declaration(ctx),
            StrategyId::ReplaceDeclaration => replace_declaration(ctx),
            StrategyId::RemoveDeclaration => remove_declaration(ctx),
        };
        match outcome {
            Ok(content) => {
                debug!(
                    file = ctx.file_path,
                    location = %ctx.region.location,
                    strategy = %strategy,
                    "strategy merged region"
                );
                MergeResult::auto_merged(ctx.region, content, strategy.as_str())
            }
            Err(failure) => {
                warn!(
                    file = ctx.file_path,
                    location = %ctx.region.location,
                    strategy = %strategy,
                    error = %failure,
                    "strategy declined"
                );
                MergeResult::failed(ctx.region, failure, Some(strategy.as_str()))
            }
        }
    }
}

fn declined(reason: impl Into<String>) -> MergeFailure {
    MergeFailure::StrategyDeclined {
        reason: reason.into(),
    }
}

fn stale(detail: impl Into<String>) -> MergeFailure {
    MergeFailure::StaleRegion {
        detail: detail.into(),
    }
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct ImportEntry {
    raw: String,
    bindings: Vec<ImportBinding>,
}

/// `import { a, b as c } from "x";` split into parts.
struct NamedImport {
    specifiers: Vec<String>,
    source: String,
    quote: char,
    semicolon: bool,
}

impl NamedImport {
    fn parse(raw: &str) -> Option<Self> {
        let flat = collapse_ws(raw);
        let semicolon = flat.ends_with(';');
        let body = flat.trim_end_matches(';').trim();
        let rest = body.strip_prefix("import {")?;
        let (inner, tail) = rest.split_once('}')?;
        let src = tail.trim().strip_prefix("from ")?.trim();
        let quote = src.chars().next().filter(|q| *q == '"' || *q == '\'')?;
        Some(Self {
            specifiers: inner
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect(),
            source: src.trim_matches(quote).to_string(),
            quote,
            semicolon,
        })
    }

    fn render(&self) -> String {
        format!(
            "import {{ {} }} from {q}{}{q}{}",
            self.specifiers.join(", "),
            self.source,
            if self.semicolon { ";" } else { "" },
            q = self.quote,
        )
    }
}

/// Fold named-only imports from the same module into one statement.
fn coalesce_named_imports(entries: Vec<ImportEntry>) -> Vec<ImportEntry> {
    let mut out: Vec<ImportEntry> = Vec::new();
    for entry in entries {
        let Some(named) = NamedImport::parse(&entry.raw) else {
            out.push(entry);
            continue;
        };
        let target = out.iter_mut().find_map(|existing| {
            NamedImport::parse(&existing.raw)
                .filter(|n| n.source == named.source)
                .map(|n| (existing, n))
        });
        match target {
            Some((existing, mut merged)) => {
                for spec in named.specifiers {
                    if !merged.specifiers.contains(&spec) {
                        merged.specifiers.push(spec);
                    }
                }
                existing.raw = merged.render();
                for binding in entry.bindings {
                    if !existing.bindings.contains(&binding) {
                        existing.bindings.push(binding);
                    }
                }
            }
            None => out.push(entry),
        }
    }
    out
}

/// Reject a local name bound to two different origins, or (outside Python)
/// bound twice at all.
fn check_bindings(entries: &[ImportEntry], lang: Language) -> Result<(), MergeFailure> {
    let mut bound: HashMap<&str, (&str, usize)> = HashMap::new();
    for (idx, entry) in entries.iter().enumerate() {
        for binding in &entry.bindings {
            let local = binding.local.as_str();
            if matches!(local, "" | "_" | "." | "*") {
                continue;
            }
            match bound.get(local) {
                Some((origin, _)) if *origin != binding.imported => {
                    return Err(declined(format!(
                        "local name '{}' is bound to both '{}' and '{}'",
                        local, origin, binding.imported
                    )));
                }
                Some((_, other)) if *other != idx && lang != Language::Python => {
                    return Err(declined(format!(
                        "'{}' would be imported by two statements",
                        local
                    )));
                }
                Some(_) => {}
                None => {
                    bound.insert(local, (binding.imported.as_str(), idx));
                }
            }
        }
    }
    Ok(())
}

fn combine_imports(ctx: &MergeContext<'_>) -> Result<String, MergeFailure> {
    let lang = ctx.language;
    let contributions = ctx.contributions();

    let removed: HashSet<&str> = contributions
        .iter()
        .filter(|(_, c)| c.change_type == ChangeType::RemoveImport)
        .filter_map(|(_, c)| match &c.detail {
            ChangeDetail::Import { statement, .. } => Some(statement.as_str()),
            _ => None,
        })
        .collect();

    let mut seen: HashSet<String> = HashSet::new();
    let mut entries: Vec<ImportEntry> = Vec::new();
    for imp in extract_imports(ctx.baseline_content, lang) {
        if removed.contains(imp.normalized.as_str()) || !seen.insert(imp.normalized.clone()) {
            continue;
        }
        entries.push(ImportEntry {
            raw: imp.raw,
            bindings: imp.bindings,
        });
    }
    for (_, change) in &contributions {
        if change.change_type != ChangeType::AddImport {
            continue;
        }
        let ChangeDetail::Import {
            statement,
            bindings,
            ..
        } = &change.detail
        else {
            return Err(declined("import change without import detail"));
        };
        if !seen.insert(statement.clone()) {
            continue;
        }
        entries.push(ImportEntry {
            raw: change
                .content_after
                .clone()
                .unwrap_or_else(|| statement.clone()),
            bindings: bindings.clone(),
        });
    }

    if lang.supports_jsx() {
        entries = coalesce_named_imports(entries);
    }
    check_bindings(&entries, lang)?;

    let statements: Vec<String> = entries.into_iter().map(|e| e.raw).collect();
    let block = render_import_block(lang, &statements);
    Ok(replace_imports(ctx.baseline_content, lang, &block))
}

// ---------------------------------------------------------------------------
// Exports
// ---------------------------------------------------------------------------

fn combine_exports(ctx: &MergeContext<'_>) -> Result<String, MergeFailure> {
    let lang = ctx.language;
    let contributions = ctx.contributions();
    let statement_of = |c: &SemanticChange| match &c.detail {
        ChangeDetail::Export { statement } => Some(statement.clone()),
        _ => None,
    };

    let removed: HashSet<String> = contributions
        .iter()
        .filter(|(_, c)| c.change_type == ChangeType::RemoveExport)
        .filter_map(|(_, c)| statement_of(c))
        .collect();

    let exports = extract_exports(ctx.baseline_content, lang);
    let spans: Vec<(usize, usize)> = exports
        .iter()
        .filter(|e| removed.contains(&e.normalized))
        .map(|e| (e.start, e.end))
        .collect();
    let content = remove_line_spans(ctx.baseline_content, &spans);

    let mut present: HashSet<String> = exports
        .into_iter()
        .map(|e| e.normalized)
        .filter(|n| !removed.contains(n))
        .collect();
    let mut added = Vec::new();
    for (_, change) in &contributions {
        if change.change_type != ChangeType::AddExport {
            continue;
        }
        let statement =
            statement_of(change).ok_or_else(|| declined("export change without export detail"))?;
        if present.insert(statement) {
            added.push(change.content_after.clone().unwrap_or_default());
        }
    }
    if added.is_empty() {
        return Ok(content);
    }

    let block = added.join("\n");
    Ok(match extract_exports(&content, lang).last() {
        Some(last) => insert_lines_after(&content, last.end, &block),
        None => append_block(&content, &block),
    })
}

// ---------------------------------------------------------------------------
// JSX props
// ---------------------------------------------------------------------------

fn line_indent(content: &str, offset: usize) -> String {
    let line_start = content[..offset].rfind('\n').map_or(0, |i| i + 1);
    content[line_start..]
        .chars()
        .take_while(|c| *c == ' ' || *c == '\t')
        .collect()
}

fn combine_props(ctx: &MergeContext<'_>) -> Result<String, MergeFailure> {
    let baseline = ctx.baseline_content;
    let key = parse_jsx_location(&ctx.region.location)
        .ok_or_else(|| declined(format!("'{}' is not an attribute location", ctx.region.location)))?;
    let tag = find_jsx_tag(baseline, &key, ctx.language).ok_or_else(|| {
        stale(format!(
            "<{}> occurrence {} not found",
            key.component, key.occurrence
        ))
    })?;

    let mut chosen: HashMap<&str, (&str, Option<&str>)> = HashMap::new();
    let mut edits: Vec<PropChange> = Vec::new();
    for (task, change) in ctx.contributions() {
        let ChangeDetail::JsxProps { props, .. } = &change.detail else {
            return Err(declined("non-attribute change at an attribute location"));
        };
        for prop in props {
            let value = prop.value.as_deref();
            match chosen.get(prop.name.as_str()) {
                Some((other_task, other_value)) if *other_value != value => {
                    return Err(declined(format!(
                        "attribute '{}' set differently by '{}' and '{}'",
                        prop.name, other_task, task
                    )));
                }
                Some(_) => {}
                None => {
                    chosen.insert(prop.name.as_str(), (task, value));
                    edits.push(prop.clone());
                }
            }
        }
    }

    let attrs = apply_prop_changes(&tag.attrs, &edits);
    let indent = baseline[tag.span.clone()]
        .contains('\n')
        .then(|| line_indent(baseline, tag.span.start));
    let rendered = render_tag(&tag.component, &attrs, tag.self_closing, indent.as_deref());
    Ok(replace_range(baseline, tag.span, &rendered))
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

fn single_change<'a>(ctx: &MergeContext<'a>) -> Result<&'a SemanticChange, MergeFailure> {
    let contributions = ctx.contributions();
    match contributions.as_slice() {
        [(_, change)] => Ok(*change),
        [] => Err(declined("no change recorded at this location")),
        many => Err(declined(format!(
            "{} competing changes at '{}'",
            many.len(),
            ctx.region.location
        ))),
    }
}

fn same_text(a: &str, b: &str) -> bool {
    a.trim_end() == b.trim_end()
}

fn append_declaration(ctx: &MergeContext<'_>) -> Result<String, MergeFailure> {
    let (baseline, lang) = (ctx.baseline_content, ctx.language);
    let change = single_change(ctx)?;
    let text = change
        .content_after
        .as_deref()
        .ok_or_else(|| declined("addition carries no content"))?;

    if let Some(existing) = find_declaration(baseline, &change.location, lang) {
        if same_text(&existing.text, text) {
            return Ok(baseline.to_string());
        }
        return Err(stale(format!(
            "'{}' already exists with different content",
            change.target
        )));
    }

    let decls = extract_declarations(baseline, lang);
    let anchor = match &change.detail {
        ChangeDetail::Declaration { anchor, .. } => anchor.as_deref(),
        _ => None,
    };
    match anchor {
        Some(anchor) => {
            if let Some(prev) = decls.iter().find(|d| d.location == anchor) {
                return Ok(insert_block_at_line(baseline, prev.end + 1, text));
            }
        }
        None => {
            if let Some(first) = decls.first() {
                return Ok(insert_block_at_line(baseline, first.start, text));
            }
        }
    }

    // End of file, ahead of any trailing export statements.
    let last_decl_end = decls.last().map(|d| d.end);
    let trailing_export = extract_exports(baseline, lang)
        .into_iter()
        .find(|e| last_decl_end.map_or(true, |end| e.start > end));
    Ok(match trailing_export {
        Some(export) => insert_block_at_line(baseline, export.start, text),
        None => append_block(baseline, text),
    })
}

fn replace_declaration(ctx: &MergeContext<'_>) -> Result<String, MergeFailure> {
    let (baseline, lang) = (ctx.baseline_content, ctx.language);
    let change = single_change(ctx)?;
    let after = change
        .content_after
        .as_deref()
        .ok_or_else(|| declined("modification carries no content"))?;
    let Some(decl) = find_declaration(baseline, &change.location, lang) else {
        return Err(stale(format!("'{}' is no longer present", change.target)));
    };
    if same_text(&decl.text, after) {
        return Ok(baseline.to_string());
    }
    if !change
        .content_before
        .as_deref()
        .is_some_and(|before| same_text(&decl.text, before))
    {
        return Err(stale(format!(
            "'{}' changed since the task read it",
            change.target
        )));
    }
    Ok(splice(baseline, &change.location, lang, after))
}

fn remove_declaration(ctx: &MergeContext<'_>) -> Result<String, MergeFailure> {
    let (baseline, lang) = (ctx.baseline_content, ctx.language);
    let change = single_change(ctx)?;
    let Some(decl) = find_declaration(baseline, &change.location, lang) else {
        return Ok(baseline.to_string());
    };
    if !change
        .content_before
        .as_deref()
        .is_some_and(|before| same_text(&decl.text, before))
    {
        return Err(stale(format!(
            "'{}' changed since the task read it",
            change.target
        )));
    }
    Ok(remove_declaration_lines(baseline, &decl))
}
