//! Semantic analyzer: turns a (before, after) pair of file contents into an
//! ordered list of [`SemanticChange`]s.
//!
//! Output order is fixed: import changes, export changes, declaration
//! changes, then JSX attribute changes. Downstream grouping relies on it.

pub mod language;

pub(crate) mod jsx;
pub(crate) mod locate;
pub(crate) mod structure;

use std::collections::{HashMap, HashSet};

use tracing::debug;

use crate::errors::AnalyzerError;
use crate::models::{
    jsx_location, ChangeDetail, ChangeType, DeclarationKind, DeclarationOp, SemanticChange,
    FILE_EXPORTS, FILE_TOP,
};

pub use language::Language;

use jsx::{diff_attrs, occurrences, scan_tags, tag_skeleton};
use structure::{extract_declarations, extract_exports, extract_imports, Declaration};

/// Stateless, deterministic change extractor.
pub struct SemanticAnalyzer;

impl SemanticAnalyzer {
    /// Classify the edits between `before` and `after`.
    ///
    /// Fails only when no pattern table exists for `file_extension`; callers
    /// then fall back to non-semantic handling. Identical inputs yield an
    /// empty list.
    pub fn analyze(
        file_path: &str,
        before: &str,
        after: &str,
        file_extension: &str,
    ) -> Result<Vec<SemanticChange>, AnalyzerError> {
        let lang = Language::from_extension(file_extension).ok_or_else(|| {
            AnalyzerError::UnsupportedLanguage {
                file_path: file_path.to_string(),
                extension: file_extension.to_string(),
            }
        })?;

        if before == after {
            return Ok(Vec::new());
        }

        let mut changes = Vec::new();
        import_changes(before, after, lang, &mut changes);
        export_changes(before, after, lang, &mut changes);
        let attribute_changes = declaration_changes(before, after, lang, &mut changes);
        changes.extend(attribute_changes);

        debug!(
            file = file_path,
            language = %lang,
            count = changes.len(),
            "analyzed file"
        );
        Ok(changes)
    }

    /// Resolve the language for a path, mirroring [`analyze`](Self::analyze)'s
    /// error.
    pub fn language_for(file_path: &str) -> Result<Language, AnalyzerError> {
        Language::from_path(file_path).ok_or_else(|| AnalyzerError::UnsupportedLanguage {
            file_path: file_path.to_string(),
            extension: std::path::Path::new(file_path)
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default()
                .to_string(),
        })
    }
}

// ---------------------------------------------------------------------------
// Imports and exports
// ---------------------------------------------------------------------------

fn import_changes(before: &str, after: &str, lang: Language, out: &mut Vec<SemanticChange>) {
    let before_imports = extract_imports(before, lang);
    let after_imports = extract_imports(after, lang);
    let before_keys: HashSet<&str> = before_imports.iter().map(|i| i.normalized.as_str()).collect();
    let after_keys: HashSet<&str> = after_imports.iter().map(|i| i.normalized.as_str()).collect();

    let mut emitted = HashSet::new();
    for imp in &after_imports {
        if before_keys.contains(imp.normalized.as_str()) || !emitted.insert(imp.normalized.as_str()) {
            continue;
        }
        out.push(SemanticChange {
            change_type: ChangeType::AddImport,
            target: imp.normalized.clone(),
            location: FILE_TOP.to_string(),
            line_start: imp.start + 1,
            line_end: imp.end + 1,
            content_before: None,
            content_after: Some(imp.raw.clone()),
            detail: ChangeDetail::Import {
                statement: imp.normalized.clone(),
                source: imp.source.clone(),
                bindings: imp.bindings.clone(),
            },
        });
    }

    let mut emitted = HashSet::new();
    for imp in &before_imports {
        if after_keys.contains(imp.normalized.as_str()) || !emitted.insert(imp.normalized.as_str()) {
            continue;
        }
        out.push(SemanticChange {
            change_type: ChangeType::RemoveImport,
            target: imp.normalized.clone(),
            location: FILE_TOP.to_string(),
            line_start: imp.start + 1,
            line_end: imp.end + 1,
            content_before: Some(imp.raw.clone()),
            content_after: None,
            detail: ChangeDetail::Import {
                statement: imp.normalized.clone(),
                source: imp.source.clone(),
                bindings: imp.bindings.clone(),
            },
        });
    }
}

fn export_changes(before: &str, after: &str, lang: Language, out: &mut Vec<SemanticChange>) {
    let before_exports = extract_exports(before, lang);
    let after_exports = extract_exports(after, lang);
    let before_keys: HashSet<&str> = before_exports.iter().map(|e| e.normalized.as_str()).collect();
    let after_keys: HashSet<&str> = after_exports.iter().map(|e| e.normalized.as_str()).collect();

    for exp in after_exports
        .iter()
        .filter(|e| !before_keys.contains(e.normalized.as_str()))
    {
        out.push(SemanticChange {
            change_type: ChangeType::AddExport,
            target: exp.normalized.clone(),
            location: FILE_EXPORTS.to_string(),
            line_start: exp.start + 1,
            line_end: exp.end + 1,
            content_before: None,
            content_after: Some(exp.raw.clone()),
            detail: ChangeDetail::Export {
                statement: exp.normalized.clone(),
            },
        });
    }
    for exp in before_exports
        .iter()
        .filter(|e| !after_keys.contains(e.normalized.as_str()))
    {
        out.push(SemanticChange {
            change_type: ChangeType::RemoveExport,
            target: exp.normalized.clone(),
            location: FILE_EXPORTS.to_string(),
            line_start: exp.start + 1,
            line_end: exp.end + 1,
            content_before: Some(exp.raw.clone()),
            content_after: None,
            detail: ChangeDetail::Export {
                statement: exp.normalized.clone(),
            },
        });
    }
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// Declaration text up to where its body opens, whitespace-collapsed.
fn signature(decl: &Declaration, lang: Language) -> String {
    let opener = if lang.uses_braces() { '{' } else { ':' };
    let mut depth = 0i32;
    let mut cut = decl.text.len();
    for (idx, c) in decl.text.char_indices() {
        match c {
            '(' | '[' | '<' => depth += 1,
            ')' | ']' | '>' if depth > 0 => depth -= 1,
            c if c == opener && depth == 0 => {
                cut = idx;
                break;
            }
            _ => {}
        }
    }
    decl.text[..cut].split_whitespace().collect::<Vec<_>>().join(" ")
}

fn declaration_change(
    decl: &Declaration,
    op: DeclarationOp,
    before: Option<&Declaration>,
    anchor: Option<String>,
) -> SemanticChange {
    let after = if op == DeclarationOp::Removed {
        None
    } else {
        Some(decl.text.clone())
    };
    SemanticChange {
        change_type: ChangeType::for_declaration(decl.kind, op),
        target: decl.name.clone(),
        location: decl.location.clone(),
        line_start: decl.start + 1,
        line_end: decl.end + 1,
        content_before: before.map(|b| b.text.clone()),
        content_after: after,
        detail: ChangeDetail::Declaration {
            kind: decl.kind,
            anchor,
        },
    }
}

/// Emits declaration changes into `out` and returns attribute-level changes,
/// which the caller appends last.
fn declaration_changes(
    before: &str,
    after: &str,
    lang: Language,
    out: &mut Vec<SemanticChange>,
) -> Vec<SemanticChange> {
    let before_decls = extract_declarations(before, lang);
    let after_decls = extract_declarations(after, lang);
    let before_by_location: HashMap<&str, &Declaration> = before_decls
        .iter()
        .map(|d| (d.location.as_str(), d))
        .collect();
    let after_locations: HashSet<&str> = after_decls.iter().map(|d| d.location.as_str()).collect();
    let mut attribute_changes = Vec::new();

    for (idx, decl) in after_decls.iter().enumerate() {
        let anchor = idx
            .checked_sub(1)
            .map(|prev| after_decls[prev].location.clone());
        match before_by_location.get(decl.location.as_str()) {
            None => out.push(declaration_change(decl, DeclarationOp::Added, None, anchor)),
            Some(prev) if prev.text == decl.text => {}
            Some(prev) => {
                if lang.supports_jsx() {
                    if let Some(props) = jsx_prop_changes(prev, decl) {
                        attribute_changes.extend(props);
                        continue;
                    }
                }
                let op = if decl.kind == DeclarationKind::Function
                    && signature(prev, lang) != signature(decl, lang)
                {
                    DeclarationOp::Reshaped
                } else {
                    DeclarationOp::Modified
                };
                out.push(declaration_change(decl, op, Some(prev), anchor));
            }
        }
    }

    for (idx, decl) in before_decls.iter().enumerate() {
        if after_locations.contains(decl.location.as_str()) {
            continue;
        }
        let anchor = idx
            .checked_sub(1)
            .map(|prev| before_decls[prev].location.clone());
        out.push(declaration_change(
            decl,
            DeclarationOp::Removed,
            Some(decl),
            anchor,
        ));
    }

    attribute_changes
}

/// If the only differences between two versions of a declaration are JSX
/// attribute edits, return one change per edited tag.
fn jsx_prop_changes(before: &Declaration, after: &Declaration) -> Option<Vec<SemanticChange>> {
    let before_tags = scan_tags(&before.text);
    let after_tags = scan_tags(&after.text);
    if before_tags.is_empty() || before_tags.len() != after_tags.len() {
        return None;
    }
    if before_tags
        .iter()
        .zip(&after_tags)
        .any(|(b, a)| b.component != a.component)
    {
        return None;
    }
    if tag_skeleton(&before.text, &before_tags) != tag_skeleton(&after.text, &after_tags) {
        return None;
    }

    let mut changes = Vec::new();
    for ((b, a), occurrence) in before_tags
        .iter()
        .zip(&after_tags)
        .zip(occurrences(&after_tags))
    {
        let props = diff_attrs(&b.attrs, &a.attrs);
        if props.is_empty() {
            continue;
        }
        let line_start = after.start + after.text[..a.span.start].matches('\n').count() + 1;
        let line_end = line_start + after.text[a.span.clone()].matches('\n').count();
        changes.push(SemanticChange {
            change_type: ChangeType::ModifyJsxProps,
            target: a.component.clone(),
            location: jsx_location(&after.name, &a.component, occurrence),
            line_start,
            line_end,
            content_before: Some(before.text[b.span.clone()].to_string()),
            content_after: Some(after.text[a.span.clone()].to_string()),
            detail: ChangeDetail::JsxProps {
                component: a.component.clone(),
                occurrence,
                props,
            },
        });
    }
    if changes.is_empty() {
        None
    } else {
        Some(changes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PropChange;

    const BASE: &str = r#"import { useState } from "react";

export function App() {
  const [n, setN] = useState(0);
  return <Button variant="primary" onClick={() => setN(n + 1)} />;
}

export default App;
"#;

    fn types(changes: &[SemanticChange]) -> Vec<(ChangeType, &str)> {
        changes
            .iter()
            .map(|c| (c.change_type, c.location.as_str()))
            .collect()
    }

    #[test]
    fn test_identical_content_yields_nothing() {
        let changes = SemanticAnalyzer::analyze("src/App.tsx", BASE, BASE, "tsx").unwrap();
        assert!(changes.is_empty());
    }

    #[test]
    fn test_unsupported_extension() {
        let err = SemanticAnalyzer::analyze("README.md", "a", "b", "md").unwrap_err();
        assert!(matches!(err, AnalyzerError::UnsupportedLanguage { .. }));
    }

    #[test]
    fn test_added_import_and_function_in_order() {
        let after = BASE
            .replace(
                "import { useState } from \"react\";",
                "import { useState } from \"react\";\nimport { api } from \"./api\";",
            )
            + "\nexport function helper() {\n  return api();\n}\n";
        let changes = SemanticAnalyzer::analyze("src/App.tsx", BASE, &after, "tsx").unwrap();
        assert_eq!(
            types(&changes),
            vec![
                (ChangeType::AddImport, FILE_TOP),
                (ChangeType::AddFunction, "function:helper"),
            ]
        );
        match &changes[1].detail {
            ChangeDetail::Declaration { anchor, .. } => {
                assert_eq!(anchor.as_deref(), Some("function:App"))
            }
            other => panic!("unexpected detail {other:?}"),
        }
        assert!(changes.iter().all(SemanticChange::is_consistent));
    }

    #[test]
    fn test_props_only_edit_is_attribute_change() {
        let after = BASE.replace("variant=\"primary\"", "variant=\"ghost\" size=\"sm\"");
        let changes = SemanticAnalyzer::analyze("src/App.tsx", BASE, &after, "tsx").unwrap();
        assert_eq!(
            types(&changes),
            vec![(ChangeType::ModifyJsxProps, "jsx:App/Button#0")]
        );
        match &changes[0].detail {
            ChangeDetail::JsxProps { props, .. } => assert_eq!(
                props,
                &vec![
                    PropChange {
                        name: "variant".into(),
                        value: Some("\"ghost\"".into())
                    },
                    PropChange {
                        name: "size".into(),
                        value: Some("\"sm\"".into())
                    },
                ]
            ),
            other => panic!("unexpected detail {other:?}"),
        }
        assert_eq!(changes[0].line_start, 5);
    }

    #[test]
    fn test_body_vs_signature_change() {
        let body = BASE.replace("useState(0)", "useState(10)");
        let changes = SemanticAnalyzer::analyze("src/App.tsx", BASE, &body, "tsx").unwrap();
        assert_eq!(
            types(&changes),
            vec![(ChangeType::ModifyFunctionBody, "function:App")]
        );

        let sig = BASE.replace("export function App()", "export function App(props: Props)");
        let changes = SemanticAnalyzer::analyze("src/App.tsx", BASE, &sig, "tsx").unwrap();
        assert_eq!(
            types(&changes),
            vec![(ChangeType::ModifyFunctionSignature, "function:App")]
        );
    }

    #[test]
    fn test_removed_declaration_and_import() {
        let before = "import os\nimport sys\n\n\ndef a():\n    return 1\n\n\ndef b():\n    return 2\n";
        let after = "import os\n\n\ndef a():\n    return 1\n";
        let changes = SemanticAnalyzer::analyze("tool.py", before, after, "py").unwrap();
        assert_eq!(
            types(&changes),
            vec![
                (ChangeType::RemoveImport, FILE_TOP),
                (ChangeType::RemoveFunction, "function:b"),
            ]
        );
        assert_eq!(changes[1].content_after, None);
        assert!(changes[1].content_before.as_deref().unwrap().contains("return 2"));
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let after = "use std::fmt;\nuse std::io;\n\npub struct A;\n\nfn run() {}\n";
        let before = "use std::fmt;\n\nfn run() { todo!() }\n";
        let first = SemanticAnalyzer::analyze("lib.rs", before, after, "rs").unwrap();
        let second = SemanticAnalyzer::analyze("lib.rs", before, after, "rs").unwrap();
        assert_eq!(first, second);
        assert_eq!(
            types(&first),
            vec![
                (ChangeType::AddImport, FILE_TOP),
                (ChangeType::AddType, "type:A"),
                (ChangeType::ModifyFunctionBody, "function:run"),
            ]
        );
    }

    #[test]
    fn test_export_statements() {
        let before = "export { a };\n";
        let after = "export { a };\nexport * from \"./b\";\n";
        let changes = SemanticAnalyzer::analyze("index.ts", before, after, "ts").unwrap();
        assert_eq!(types(&changes), vec![(ChangeType::AddExport, FILE_EXPORTS)]);
    }
}
