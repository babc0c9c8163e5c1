//! Resolve location keys back to text, and splice replacement text in.

use std::ops::Range;

use crate::models::{FILE_EXPORTS, FILE_TOP};

use super::jsx::{occurrences, scan_tags, JsxTag};
use super::language::Language;
use super::structure::{
    extract_declarations, extract_exports, extract_imports, header_end, Declaration, SourceLines,
};

/// A parsed `jsx:` location key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JsxKey<'a> {
    pub enclosing: &'a str,
    pub component: &'a str,
    pub occurrence: usize,
}

pub(crate) fn parse_jsx_location(location: &str) -> Option<JsxKey<'_>> {
    let rest = location.strip_prefix("jsx:")?;
    let (path, occurrence) = rest.rsplit_once('#')?;
    let occurrence = occurrence.parse().ok()?;
    let (enclosing, component) = match path.rsplit_once('/') {
        Some((enclosing, component)) => (enclosing, component),
        None => ("", path),
    };
    Some(JsxKey {
        enclosing,
        component,
        occurrence,
    })
}

/// The declaration at a `function:`/`class:`/... location.
pub(crate) fn find_declaration(content: &str, location: &str, lang: Language) -> Option<Declaration> {
    extract_declarations(content, lang)
        .into_iter()
        .find(|d| d.location == location)
}

/// Byte range of a declaration's lines, including the final newline.
pub(crate) fn declaration_range(content: &str, decl: &Declaration) -> Range<usize> {
    SourceLines::new(content).byte_range(decl.start, decl.end)
}

/// The opening tag a `jsx:` key names, with its span made absolute.
pub(crate) fn find_jsx_tag(content: &str, key: &JsxKey<'_>, lang: Language) -> Option<JsxTag> {
    let scope = if key.enclosing.is_empty() {
        0..content.len()
    } else {
        let decl = extract_declarations(content, lang)
            .into_iter()
            .find(|d| d.name == key.enclosing)?;
        declaration_range(content, &decl)
    };
    let tags = scan_tags(&content[scope.clone()]);
    let occ = occurrences(&tags);
    tags.into_iter()
        .zip(occ)
        .find(|(tag, n)| tag.component == key.component && *n == key.occurrence)
        .map(|(mut tag, _)| {
            tag.span = tag.span.start + scope.start..tag.span.end + scope.start;
            tag
        })
}

/// Current text at `location`, if the location exists in `content`.
pub(crate) fn region_text(content: &str, location: &str, lang: Language) -> Option<String> {
    if location == FILE_TOP {
        let imports = extract_imports(content, lang);
        let first = imports.first()?.start;
        let last = imports.iter().map(|i| i.end).max()?;
        return Some(SourceLines::new(content).text(first, last).to_string());
    }
    if location == FILE_EXPORTS {
        let exports = extract_exports(content, lang);
        if exports.is_empty() {
            return None;
        }
        return Some(
            exports
                .iter()
                .map(|e| e.raw.as_str())
                .collect::<Vec<_>>()
                .join("\n"),
        );
    }
    if let Some(key) = parse_jsx_location(location) {
        let tag = find_jsx_tag(content, &key, lang)?;
        return Some(content[tag.span].to_string());
    }
    find_declaration(content, location, lang).map(|d| d.text)
}

// ---------------------------------------------------------------------------
// Splicing
// ---------------------------------------------------------------------------

fn with_newline(text: &str) -> String {
    let mut out = text.trim_end_matches('\n').to_string();
    out.push('\n');
    out
}

pub(crate) fn replace_range(content: &str, range: Range<usize>, replacement: &str) -> String {
    let mut out = String::with_capacity(content.len() + replacement.len());
    out.push_str(&content[..range.start]);
    out.push_str(replacement);
    out.push_str(&content[range.end..]);
    out
}

/// Append a block at end of file, separated by one blank line.
pub(crate) fn append_block(content: &str, block: &str) -> String {
    let mut out = content.to_string();
    if !out.is_empty() {
        if !out.ends_with('\n') {
            out.push('\n');
        }
        if !out.ends_with("\n\n") {
            out.push('\n');
        }
    }
    out.push_str(&with_newline(block));
    out
}

/// Insert a block before line `at`, separated from surrounding code by one
/// blank line.
pub(crate) fn insert_block_at_line(content: &str, at: usize, block: &str) -> String {
    let lines = SourceLines::new(content);
    if at >= lines.len() {
        return append_block(content, block);
    }
    let offset = lines.byte_range(at, at).start;
    let (head, tail) = content.split_at(offset);
    let mut out = head.to_string();
    if !head.trim().is_empty() && !head.ends_with("\n\n") {
        out.push('\n');
    }
    out.push_str(&with_newline(block));
    if !tail.starts_with('\n') && !tail.is_empty() {
        out.push('\n');
    }
    out.push_str(tail);
    out
}

/// Insert `block` directly after line `line`, with no separating blank line.
pub(crate) fn insert_lines_after(content: &str, line: usize, block: &str) -> String {
    let lines = SourceLines::new(content);
    if line + 1 >= lines.len() {
        let mut out = content.to_string();
        if !out.is_empty() && !out.ends_with('\n') {
            out.push('\n');
        }
        out.push_str(&with_newline(block));
        return out;
    }
    let offset = lines.byte_range(line + 1, line + 1).start;
    let (head, tail) = content.split_at(offset);
    format!("{}{}{}", head, with_newline(block), tail)
}

/// Drop whole lines covered by `spans` (inclusive line pairs).
pub(crate) fn remove_line_spans(content: &str, spans: &[(usize, usize)]) -> String {
    rewrite_spans(content, spans, None)
}

/// Drop whole lines covered by `spans` (inclusive line pairs). When
/// `insert` is given, it is placed where the first span began.
fn rewrite_spans(content: &str, spans: &[(usize, usize)], insert: Option<&str>) -> String {
    let lines = SourceLines::new(content);
    let first = spans.iter().map(|s| s.0).min();
    let mut out = String::with_capacity(content.len());
    for i in 0..lines.len() {
        if Some(i) == first {
            if let Some(block) = insert.filter(|b| !b.is_empty()) {
                out.push_str(&with_newline(block));
            }
        }
        if spans.iter().any(|&(s, e)| i >= s && i <= e) {
            continue;
        }
        out.push_str(&content[lines.byte_range(i, i)]);
    }
    out
}

/// Replace the file's import statements with `block` (may be empty).
pub(crate) fn replace_imports(content: &str, lang: Language, block: &str) -> String {
    let imports = extract_imports(content, lang);
    if imports.is_empty() {
        if block.trim().is_empty() {
            return content.to_string();
        }
        let at = header_end(&SourceLines::new(content), lang);
        return insert_block_at_line(content, at, block);
    }
    let mut spans: Vec<(usize, usize)> = imports.iter().map(|i| (i.start, i.end)).collect();
    spans.dedup();
    rewrite_spans(content, &spans, Some(block))
}

/// Replace the file's export statements with `block`, appended at the end.
pub(crate) fn replace_exports(content: &str, lang: Language, block: &str) -> String {
    let spans: Vec<(usize, usize)> = extract_exports(content, lang)
        .iter()
        .map(|e| (e.start, e.end))
        .collect();
    let stripped = rewrite_spans(content, &spans, None);
    if block.trim().is_empty() {
        return stripped;
    }
    append_block(stripped.trim_end_matches('\n'), block)
}

/// Remove the declaration's lines plus one following blank line.
pub(crate) fn remove_declaration_lines(content: &str, decl: &Declaration) -> String {
    let lines = SourceLines::new(content);
    let mut end = decl.end;
    if end + 1 < lines.len() && lines.line(end + 1).trim().is_empty() {
        end += 1;
    } else if decl.start > 0 && lines.line(decl.start - 1).trim().is_empty() {
        return rewrite_spans(content, &[(decl.start - 1, decl.end)], None);
    }
    rewrite_spans(content, &[(decl.start, end)], None)
}

/// Replace whatever `content` holds at `location` with `replacement`,
/// appending it when the location has no code yet.
pub(crate) fn splice(content: &str, location: &str, lang: Language, replacement: &str) -> String {
    if location == FILE_TOP {
        return replace_imports(content, lang, replacement.trim_end());
    }
    if location == FILE_EXPORTS {
        return replace_exports(content, lang, replacement.trim_end());
    }
    if let Some(key) = parse_jsx_location(location) {
        return match find_jsx_tag(content, &key, lang) {
            Some(tag) => replace_range(content, tag.span, replacement.trim()),
            None => append_block(content, replacement),
        };
    }
    match find_declaration(content, location, lang) {
        Some(decl) => {
            let range = declaration_range(content, &decl);
            let mut text = replacement.trim_end_matches('\n').to_string();
            if content[range.clone()].ends_with('\n') {
                text.push('\n');
            }
            replace_range(content, range, &text)
        }
        None => append_block(content, replacement),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP: &str = "import { useState } from \"react\";\n\nexport function App() {\n  return <Button variant=\"primary\" />;\n}\n\nexport default App;\n";

    #[test]
    fn test_parse_jsx_location() {
        let key = parse_jsx_location("jsx:App/Button#1").unwrap();
        assert_eq!(key.enclosing, "App");
        assert_eq!(key.component, "Button");
        assert_eq!(key.occurrence, 1);
        assert_eq!(parse_jsx_location("jsx:Button#0").unwrap().enclosing, "");
        assert!(parse_jsx_location("function:App").is_none());
    }

    #[test]
    fn test_region_text() {
        let lang = Language::TypeScript;
        assert_eq!(
            region_text(APP, FILE_TOP, lang).as_deref(),
            Some("import { useState } from \"react\";")
        );
        assert_eq!(
            region_text(APP, "jsx:App/Button#0", lang).as_deref(),
            Some("<Button variant=\"primary\" />")
        );
        assert!(region_text(APP, "function:App", lang)
            .unwrap()
            .ends_with("}"));
        assert_eq!(
            region_text(APP, FILE_EXPORTS, lang).as_deref(),
            Some("export default App;")
        );
        assert!(region_text(APP, "function:Missing", lang).is_none());
    }

    #[test]
    fn test_splice_declaration_and_append() {
        let lang = Language::TypeScript;
        let out = splice(APP, "function:App", lang, "export function App() {\n  return null;\n}");
        assert!(out.contains("return null;"));
        assert!(!out.contains("Button"));
        assert!(out.ends_with("export default App;\n"));

        let out = splice(APP, "function:helper", lang, "function helper() {}");
        assert!(out.ends_with("export default App;\n\nfunction helper() {}\n"));
    }

    #[test]
    fn test_replace_imports_without_existing_block() {
        let src = "// header\n\nconst a = 1;\n";
        let out = replace_imports(src, Language::TypeScript, "import x from \"x\";");
        assert_eq!(out, "// header\n\nimport x from \"x\";\n\nconst a = 1;\n");
    }

    #[test]
    fn test_remove_declaration_lines() {
        let src = "function a() {}\n\nfunction b() {}\n\nfunction c() {}\n";
        let decl = find_declaration(src, "function:b", Language::TypeScript).unwrap();
        let out = remove_declaration_lines(src, &decl);
        assert_eq!(out, "function a() {}\n\nfunction c() {}\n");
    }
}
