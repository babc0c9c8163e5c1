//! JSX opening-tag scanner.
//!
//! Finds `<Component attr=... />` opening tags in a slice of source text and
//! splits their attribute lists. Closing tags, fragments, and generic type
//! arguments (`Array<string>`) are skipped.

use std::ops::Range;

use crate::models::PropChange;

/// One parsed opening tag.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct JsxTag {
    pub component: String,
    /// Byte span of the whole tag within the scanned text.
    pub span: Range<usize>,
    /// `(name, raw value)` in source order; the value is empty for bare
    /// attributes and spreads (whose name is the full `{...x}` text).
    pub attrs: Vec<(String, String)>,
    pub self_closing: bool,
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

/// Every opening tag in `text`, ordered by start offset.
pub(crate) fn scan_tags(text: &str) -> Vec<JsxTag> {
    let bytes = text.as_bytes();
    let mut tags = Vec::new();
    for i in 0..bytes.len() {
        if bytes[i] != b'<' {
            continue;
        }
        if i > 0 {
            let prev = bytes[i - 1];
            if is_ident_byte(prev) || prev == b')' || prev == b']' {
                continue;
            }
        }
        if let Some(tag) = parse_tag(text, i) {
            tags.push(tag);
        }
    }
    tags
}

fn skip_ws(bytes: &[u8], mut j: usize) -> usize {
    while j < bytes.len() && bytes[j].is_ascii_whitespace() {
        j += 1;
    }
    j
}

/// Index one past the `}` matching the `{` at `open`.
fn balanced_brace_end(bytes: &[u8], open: usize) -> Option<usize> {
    let mut depth = 0i32;
    let mut quote: Option<u8> = None;
    let mut j = open;
    while j < bytes.len() {
        let b = bytes[j];
        if let Some(q) = quote {
            if b == b'\\' {
                j += 2;
                continue;
            }
            if b == q {
                quote = None;
            }
            j += 1;
            continue;
        }
        match b {
            b'"' | b'\'' | b'`' => quote = Some(b),
            b'{' => depth += 1,
            b'}' => {
                depth -= 1;
                if depth == 0 {
                    return Some(j + 1);
                }
            }
            _ => {}
        }
        j += 1;
    }
    None
}

fn parse_tag(text: &str, start: usize) -> Option<JsxTag> {
    let bytes = text.as_bytes();
    let mut j = start + 1;
    if j >= bytes.len() || !bytes[j].is_ascii_alphabetic() {
        return None;
    }
    while j < bytes.len() && (is_ident_byte(bytes[j]) || bytes[j] == b'.' || bytes[j] == b'-') {
        j += 1;
    }
    let component = text[start + 1..j].to_string();
    let mut attrs = Vec::new();

    loop {
        let before_ws = j;
        j = skip_ws(bytes, j);
        if j >= bytes.len() {
            return None;
        }
        match bytes[j] {
            b'/' if bytes.get(j + 1) == Some(&b'>') => {
                return Some(JsxTag {
                    component,
                    span: start..j + 2,
                    attrs,
                    self_closing: true,
                });
            }
            b'>' => {
                return Some(JsxTag {
                    component,
                    span: start..j + 1,
                    attrs,
                    self_closing: false,
                });
            }
            b'{' => {
                let end = balanced_brace_end(bytes, j)?;
                attrs.push((text[j..end].to_string(), String::new()));
                j = end;
            }
            b if (b.is_ascii_alphabetic() || b == b'_' || b == b'$') && j > before_ws => {
                let name_start = j;
                while j < bytes.len()
                    && (is_ident_byte(bytes[j]) || matches!(bytes[j], b'-' | b':' | b'.'))
                {
                    j += 1;
                }
                let name = text[name_start..j].to_string();
                let after_name = skip_ws(bytes, j);
                if bytes.get(after_name) != Some(&b'=') {
                    attrs.push((name, String::new()));
                    continue;
                }
                let value_start = skip_ws(bytes, after_name + 1);
                let value_end = match bytes.get(value_start) {
                    Some(&q @ (b'"' | b'\'')) => {
                        let close = text[value_start + 1..].find(q as char)?;
                        value_start + 1 + close + 1
                    }
                    Some(b'{') => balanced_brace_end(bytes, value_start)?,
                    _ => return None,
                };
                attrs.push((name, text[value_start..value_end].to_string()));
                j = value_end;
            }
            _ => return None,
        }
    }
}

/// Render an opening tag. Multi-line layout is used when `indent` is given.
pub(crate) fn render_tag(
    component: &str,
    attrs: &[(String, String)],
    self_closing: bool,
    indent: Option<&str>,
) -> String {
    let close = if self_closing { "/>" } else { ">" };
    let render_attr = |(name, value): &(String, String)| {
        if value.is_empty() {
            name.clone()
        } else {
            format!("{}={}", name, value)
        }
    };
    match indent {
        Some(indent) if !attrs.is_empty() => {
            let mut out = format!("<{}", component);
            for attr in attrs {
                out.push('\n');
                out.push_str(indent);
                out.push_str("  ");
                out.push_str(&render_attr(attr));
            }
            out.push('\n');
            out.push_str(indent);
            out.push_str(close);
            out
        }
        _ => {
            let mut out = format!("<{}", component);
            for attr in attrs {
                out.push(' ');
                out.push_str(&render_attr(attr));
            }
            out.push(' ');
            out.push_str(close);
            if !self_closing {
                // `<Comp a="x" >` reads oddly; keep `>` attached.
                out = out.trim_end_matches(" >").to_string() + ">";
            }
            out
        }
    }
}

/// Attribute edits turning `before` into `after`. Sets come first in
/// `after` order, then removals in `before` order.
pub(crate) fn diff_attrs(before: &[(String, String)], after: &[(String, String)]) -> Vec<PropChange> {
    let mut changes = Vec::new();
    for (name, value) in after {
        let previous = before.iter().find(|(n, _)| n == name).map(|(_, v)| v);
        if previous != Some(value) {
            changes.push(PropChange {
                name: name.clone(),
                value: Some(value.clone()),
            });
        }
    }
    for (name, _) in before {
        if !after.iter().any(|(n, _)| n == name) {
            changes.push(PropChange {
                name: name.clone(),
                value: None,
            });
        }
    }
    changes
}

/// Apply attribute edits in order. Returns the new attribute list.
pub(crate) fn apply_prop_changes(
    attrs: &[(String, String)],
    changes: &[PropChange],
) -> Vec<(String, String)> {
    let mut out = attrs.to_vec();
    for change in changes {
        let existing = out.iter().position(|(n, _)| *n == change.name);
        match (&change.value, existing) {
            (None, Some(idx)) => {
                out.remove(idx);
            }
            (None, None) => {}
            (Some(value), Some(idx)) => out[idx].1 = value.clone(),
            (Some(value), None) => out.push((change.name.clone(), value.clone())),
        }
    }
    out
}

/// Source text with every opening tag replaced by its component name, so two
/// versions can be compared for non-attribute differences.
pub(crate) fn tag_skeleton(text: &str, tags: &[JsxTag]) -> String {
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for tag in tags {
        if tag.span.start < cursor {
            // Nested inside a previous tag's attribute value.
            continue;
        }
        out.push_str(&text[cursor..tag.span.start]);
        out.push_str("<\u{0}");
        out.push_str(&tag.component);
        out.push('\u{0}');
        out.push_str(if tag.self_closing { "/>" } else { ">" });
        cursor = tag.span.end;
    }
    out.push_str(&text[cursor..]);
    out
}

/// Occurrence index of each tag among tags with the same component.
pub(crate) fn occurrences(tags: &[JsxTag]) -> Vec<usize> {
    let mut seen: Vec<(&str, usize)> = Vec::new();
    tags.iter()
        .map(|tag| match seen.iter_mut().find(|(c, _)| *c == tag.component) {
            Some((_, n)) => {
                *n += 1;
                *n
            }
            None => {
                seen.push((&tag.component, 0));
                0
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scan_basic_tags() {
        let src = r#"return (<div className="app"><Button variant="primary" onClick={() => go({a: 1})} disabled /></div>);"#;
        let tags = scan_tags(src);
        assert_eq!(tags.len(), 2);
        assert_eq!(tags[0].component, "div");
        assert!(!tags[0].self_closing);
        assert_eq!(tags[1].component, "Button");
        assert!(tags[1].self_closing);
        let attrs: Vec<(&str, &str)> = tags[1]
            .attrs
            .iter()
            .map(|(n, v)| (n.as_str(), v.as_str()))
            .collect();
        assert_eq!(
            attrs,
            vec![
                ("variant", "\"primary\""),
                ("onClick", "{() => go({a: 1})}"),
                ("disabled", ""),
            ]
        );
    }

    #[test]
    fn test_generics_and_comparisons_are_not_tags() {
        let src = "const xs: Array<string> = []; if (a < b && c > d) {}";
        assert!(scan_tags(src).is_empty());
    }

    #[test]
    fn test_spread_attribute() {
        let tags = scan_tags("<Card {...props} title='x'/>");
        assert_eq!(tags.len(), 1);
        assert_eq!(tags[0].attrs[0].0, "{...props}");
        assert_eq!(tags[0].attrs[1], ("title".to_string(), "'x'".to_string()));
    }

    #[test]
    fn test_diff_and_apply() {
        let before = vec![
            ("a".to_string(), "\"1\"".to_string()),
            ("b".to_string(), "{x}".to_string()),
        ];
        let after = vec![
            ("a".to_string(), "\"2\"".to_string()),
            ("c".to_string(), String::new()),
        ];
        let changes = diff_attrs(&before, &after);
        assert_eq!(changes.len(), 3);
        assert_eq!(changes[2].value, None);
        assert_eq!(apply_prop_changes(&before, &changes), after);
    }

    #[test]
    fn test_render_tag() {
        let attrs = vec![
            ("variant".to_string(), "\"primary\"".to_string()),
            ("disabled".to_string(), String::new()),
        ];
        assert_eq!(
            render_tag("Button", &attrs, true, None),
            "<Button variant=\"primary\" disabled />"
        );
        assert_eq!(render_tag("div", &[], false, None), "<div>");
        assert_eq!(
            render_tag("Button", &attrs, true, Some("    ")),
            "<Button\n      variant=\"primary\"\n      disabled\n    />"
        );
    }

    #[test]
    fn test_skeleton_ignores_attributes() {
        let a = "<A x=\"1\" /><B />";
        let b = "<A x=\"2\" y /><B />";
        assert_eq!(
            tag_skeleton(a, &scan_tags(a)),
            tag_skeleton(b, &scan_tags(b))
        );
        assert_eq!(occurrences(&scan_tags("<A/><B/><A/>")), vec![0, 0, 1]);
    }
}
