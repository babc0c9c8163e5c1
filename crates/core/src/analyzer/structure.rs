//! Line-oriented structure extraction.
//!
//! This is structural matching, not parsing: statements and declaration
//! blocks are found by anchored patterns plus bracket balancing (brace
//! languages) or indentation (Python). Good enough to key changes by
//! location; anything subtler is left to the resolver.

use std::collections::HashMap;
use std::ops::Range;

use crate::models::{declaration_location, DeclarationKind, ImportBinding};

use super::language::Language;

// ---------------------------------------------------------------------------
// Line index
// ---------------------------------------------------------------------------

/// A content string split into lines with byte offsets preserved.
pub(crate) struct SourceLines<'a> {
    content: &'a str,
    starts: Vec<usize>,
}

impl<'a> SourceLines<'a> {
    pub fn new(content: &'a str) -> Self {
        let mut starts = Vec::new();
        let mut pos = 0;
        for piece in content.split_inclusive('\n') {
            starts.push(pos);
            pos += piece.len();
        }
        Self { content, starts }
    }

    pub fn len(&self) -> usize {
        self.starts.len()
    }

    /// Line `i` without its terminator.
    pub fn line(&self, i: usize) -> &'a str {
        let content: &'a str = self.content;
        content[self.byte_range(i, i)]
            .trim_end_matches('\n')
            .trim_end_matches('\r')
    }

    /// Byte range covering lines `start..=end`, including the final newline.
    pub fn byte_range(&self, start: usize, end: usize) -> Range<usize> {
        let from = self.starts[start];
        let to = self
            .starts
            .get(end + 1)
            .copied()
            .unwrap_or(self.content.len());
        from..to
    }

    /// Text of lines `start..=end` without the final newline.
    pub fn text(&self, start: usize, end: usize) -> &'a str {
        let content: &'a str = self.content;
        content[self.byte_range(start, end)]
            .trim_end_matches('\n')
            .trim_end_matches('\r')
    }
}

fn indent_of(line: &str) -> usize {
    line.len() - line.trim_start().len()
}

// ---------------------------------------------------------------------------
// Bracket scanner
// ---------------------------------------------------------------------------

/// Tracks bracket depth across lines while skipping strings and comments.
#[derive(Debug, Default)]
pub(crate) struct BracketScanner {
    depth: i32,
    curly_seen: bool,
    string: Option<(char, bool)>,
    block_comment: bool,
}

impl BracketScanner {
    /// Still inside brackets, a multi-line string, or a block comment.
    pub fn is_open(&self) -> bool {
        self.depth > 0 || self.block_comment || matches!(self.string, Some((_, true)))
    }

    pub fn curly_seen(&self) -> bool {
        self.curly_seen
    }

    /// Net bracket depth; negative after an unmatched closer.
    pub fn depth(&self) -> i32 {
        self.depth
    }

    pub fn feed(&mut self, line: &str, lang: Language) {
        let chars: Vec<char> = line.chars().collect();
        let mut i = 0;
        while i < chars.len() {
            let c = chars[i];
            let next = chars.get(i + 1).copied();

            if self.block_comment {
                if c == '*' && next == Some('/') {
                    self.block_comment = false;
                    i += 2;
                } else {
                    i += 1;
                }
                continue;
            }

            if let Some((quote, multiline)) = self.string {
                if c == '\\' {
                    i += 2;
                    continue;
                }
                let triple = lang == Language::Python
                    && multiline
                    && chars.get(i + 1) == Some(&quote)
                    && chars.get(i + 2) == Some(&quote);
                if c == quote && (!multiline || lang != Language::Python || triple) {
                    self.string = None;
                    i += if triple { 3 } else { 1 };
                    continue;
                }
                i += 1;
                continue;
            }

            match c {
                '/' if lang.uses_braces() && next == Some('/') => break,
                '/' if lang.uses_braces() && next == Some('*') => {
                    self.block_comment = true;
                    i += 2;
                    continue;
                }
                '#' if lang == Language::Python => break,
                '"' | '\'' | '`' => {
                    if lang == Language::Python
                        && chars.get(i + 1) == Some(&c)
                        && chars.get(i + 2) == Some(&c)
                    {
                        self.string = Some((c, true));
                        i += 3;
                        continue;
                    }
                    if c == '\'' && lang == Language::Rust && !is_rust_char_literal(&chars, i) {
                        // Lifetime, not a literal.
                        i += 1;
                        continue;
                    }
                    if c == '`' && !matches!(lang, Language::TypeScript | Language::JavaScript | Language::Go) {
                        i += 1;
                        continue;
                    }
                    let multiline = c == '`' || (c == '"' && lang == Language::Rust);
                    self.string = Some((c, multiline));
                }
                '{' => {
                    self.depth += 1;
                    self.curly_seen = true;
                }
                '(' | '[' => self.depth += 1,
                '}' | ')' | ']' => self.depth -= 1,
                _ => {}
            }
            i += 1;
        }

        // Single-line string literals never carry over.
        if let Some((_, false)) = self.string {
            self.string = None;
        }
    }
}

fn is_rust_char_literal(chars: &[char], i: usize) -> bool {
    match chars.get(i + 1) {
        Some('\\') => true,
        Some(_) => chars.get(i + 2) == Some(&'\''),
        None => false,
    }
}

fn ends_with_continuation(line: &str) -> bool {
    const TAILS: &[&str] = &[
        "=", "=>", ",", "(", "[", "{", "+", "-", "*", "/", "?", ":", "&&", "||", "|", ".", "->",
        "\\",
    ];
    let t = line.trim_end();
    TAILS.iter().any(|tail| t.ends_with(tail))
}

fn starts_with_continuation(line: &str) -> bool {
    const HEADS: &[&str] = &[
        "where", "->", ".", "?", ":", "|", "&&", "||", "+", "{", ")", "]", "extends",
        "implements",
    ];
    let t = line.trim_start();
    HEADS.iter().any(|head| t.starts_with(head))
}

/// Last line of a multi-line statement (imports, exports) starting at
/// `start`.
pub(crate) fn statement_end(lines: &SourceLines<'_>, start: usize, lang: Language) -> usize {
    let mut scanner = BracketScanner::default();
    let mut j = start;
    loop {
        let line = lines.line(j);
        scanner.feed(line, lang);
        let t = line.trim_end();
        if !scanner.is_open() && !t.ends_with('\\') && !t.ends_with(',') {
            return j;
        }
        if j + 1 >= lines.len() {
            return j;
        }
        j += 1;
    }
}

/// Last line of the declaration block whose header is at `start`.
pub(crate) fn block_end(lines: &SourceLines<'_>, start: usize, lang: Language) -> usize {
    let n = lines.len();
    let mut scanner = BracketScanner::default();
    scanner.feed(lines.line(start), lang);

    if !lang.uses_braces() {
        let mut end = start;
        let mut j = start + 1;
        while j < n {
            let line = lines.line(j);
            if scanner.is_open() || indent_of(line) > 0 {
                scanner.feed(line, lang);
                if !line.trim().is_empty() {
                    end = j;
                }
                j += 1;
                continue;
            }
            if line.trim().is_empty() {
                j += 1;
                continue;
            }
            break;
        }
        return end;
    }

    let mut j = start;
    loop {
        if !scanner.is_open() {
            if scanner.curly_seen() {
                return j;
            }
            let t = lines.line(j).trim_end();
            if t.ends_with(';') {
                return j;
            }
            if !ends_with_continuation(t) {
                let next = (j + 1..n).find(|&k| !lines.line(k).trim().is_empty());
                match next {
                    None => return j,
                    Some(k) => {
                        let nl = lines.line(k);
                        if indent_of(nl) == 0 && !starts_with_continuation(nl) {
                            return j;
                        }
                    }
                }
            }
        }
        if j + 1 >= n {
            return j;
        }
        j += 1;
        scanner.feed(lines.line(j), lang);
    }
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Collapse a statement to a whitespace/quote-insensitive key.
pub(crate) fn normalize_statement(raw: &str) -> String {
    let s = raw.replace('\'', "\"");
    let s = s.trim().trim_end_matches(';').trim();
    let mut out = String::with_capacity(s.len());
    let mut pending_space = false;
    let mut after_punct = true;
    for c in s.chars() {
        if c.is_whitespace() {
            pending_space = !after_punct;
            continue;
        }
        let punct = matches!(c, '{' | '}' | '(' | ')' | '[' | ']' | ',');
        if pending_space && !punct {
            out.push(' ');
        }
        pending_space = false;
        out.push(c);
        after_punct = punct;
    }
    out.replace(",}", "}").replace(",)", ")").replace(",]", "]")
}

pub(crate) fn collapse_ws(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn unquote(s: &str) -> String {
    s.trim()
        .trim_end_matches(';')
        .trim()
        .trim_matches(|c| c == '"' || c == '\'' || c == '`')
        .to_string()
}

// ---------------------------------------------------------------------------
// Imports
// ---------------------------------------------------------------------------

/// One import statement (for Go, one import spec).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ImportStmt {
    /// Statement text as written (Go specs are rewritten to `import <spec>`).
    pub raw: String,
    pub normalized: String,
    pub source: String,
    pub bindings: Vec<ImportBinding>,
    /// Physical line span; Go specs share their block's span.
    pub start: usize,
    pub end: usize,
}

pub(crate) fn extract_imports(content: &str, lang: Language) -> Vec<ImportStmt> {
    let lines = SourceLines::new(content);
    let table = lang.table();
    let mut out = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines.line(i);
        if !table.is_import_start(line) || table.is_export_start(line) {
            i += 1;
            continue;
        }
        let end = statement_end(&lines, i, lang);
        if lang == Language::Go {
            let block = lines.text(i, end);
            for spec in go_specs(block) {
                let raw = format!("import {}", spec);
                let (source, bindings) = parse_import(lang, &raw);
                out.push(ImportStmt {
                    normalized: normalize_statement(&raw),
                    raw,
                    source,
                    bindings,
                    start: i,
                    end,
                });
            }
        } else {
            let raw = lines.text(i, end).to_string();
            let (source, bindings) = parse_import(lang, &raw);
            out.push(ImportStmt {
                normalized: normalize_statement(&raw),
                raw,
                source,
                bindings,
                start: i,
                end,
            });
        }
        i = end + 1;
    }
    out
}

fn go_specs(block: &str) -> Vec<String> {
    let body = block.trim().trim_start_matches("import").trim();
    let body = body
        .strip_prefix('(')
        .and_then(|b| b.strip_suffix(')'))
        .unwrap_or(body);
    body.lines()
        .map(|l| l.split("//").next().unwrap_or("").trim())
        .filter(|l| !l.is_empty())
        .map(collapse_ws)
        .collect()
}

/// Extract `(source, bindings)` from one import statement.
pub(crate) fn parse_import(lang: Language, raw: &str) -> (String, Vec<ImportBinding>) {
    let flat = collapse_ws(raw);
    let flat = flat.trim().trim_end_matches(';').trim();
    match lang {
        Language::TypeScript | Language::JavaScript => parse_ecmascript_import(flat),
        Language::Python => parse_python_import(flat),
        Language::Rust => parse_rust_use(flat),
        Language::Go => parse_go_import(flat),
    }
}

fn binding(imported: String, local: &str) -> ImportBinding {
    ImportBinding {
        imported,
        local: local.trim().to_string(),
    }
}

fn parse_ecmascript_import(flat: &str) -> (String, Vec<ImportBinding>) {
    let rest = flat.trim_start_matches("import").trim();
    let rest = rest.strip_prefix("type ").unwrap_or(rest).trim();
    if rest.starts_with('"') || rest.starts_with('\'') {
        return (unquote(rest), Vec::new());
    }
    let (clause, source) = match rest.rfind(" from ") {
        Some(idx) => (&rest[..idx], unquote(&rest[idx + 6..])),
        None => (rest, String::new()),
    };
    let mut bindings = Vec::new();
    let (prefix, named) = match (clause.find('{'), clause.rfind('}')) {
        (Some(open), Some(close)) if close > open => {
            (&clause[..open], Some(&clause[open + 1..close]))
        }
        _ => (clause, None),
    };
    for item in prefix.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if let Some(ns) = item.strip_prefix("* as ") {
            bindings.push(binding(format!("{}:*", source), ns));
        } else {
            bindings.push(binding(format!("{}:default", source), item));
        }
    }
    if let Some(named) = named {
        for item in named.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let item = item.strip_prefix("type ").unwrap_or(item);
            match item.split_once(" as ") {
                Some((imported, local)) => {
                    bindings.push(binding(format!("{}:{}", source, imported.trim()), local))
                }
                None => bindings.push(binding(format!("{}:{}", source, item), item)),
            }
        }
    }
    (source, bindings)
}

fn parse_python_import(flat: &str) -> (String, Vec<ImportBinding>) {
    if let Some(rest) = flat.strip_prefix("from ") {
        let (source, names) = match rest.split_once(" import ") {
            Some((s, n)) => (s.trim().to_string(), n),
            None => (rest.trim().to_string(), ""),
        };
        let names = names.trim().trim_start_matches('(').trim_end_matches(')');
        let bindings = names
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|item| match item.split_once(" as ") {
                Some((imported, local)) => {
                    binding(format!("{}:{}", source, imported.trim()), local)
                }
                None => binding(format!("{}:{}", source, item), item),
            })
            .collect();
        return (source, bindings);
    }
    let rest = flat.trim_start_matches("import").trim();
    let mut source = String::new();
    let mut bindings = Vec::new();
    for item in rest.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        if source.is_empty() {
            source = item.split(" as ").next().unwrap_or(item).trim().to_string();
        }
        match item.split_once(" as ") {
            Some((module, local)) => bindings.push(binding(module.trim().to_string(), local)),
            None => {
                // `import a.b` binds the top-level package `a`.
                let top = item.split('.').next().unwrap_or(item);
                bindings.push(binding(top.to_string(), top));
            }
        }
    }
    (source, bindings)
}

fn split_top_level(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut depth = 0i32;
    let mut last = 0;
    for (idx, c) in s.char_indices() {
        match c {
            '{' => depth += 1,
            '}' => depth -= 1,
            c if c == sep && depth == 0 => {
                parts.push(&s[last..idx]);
                last = idx + c.len_utf8();
            }
            _ => {}
        }
    }
    parts.push(&s[last..]);
    parts
}

fn expand_use_tree(prefix: &str, tree: &str, out: &mut Vec<ImportBinding>) {
    let tree = tree.trim();
    if tree.is_empty() {
        return;
    }
    if let (Some(open), Some(close)) = (tree.find('{'), tree.rfind('}')) {
        let head = &tree[..open];
        let inner = &tree[open + 1..close];
        let next_prefix = format!("{}{}", prefix, head);
        for item in split_top_level(inner, ',') {
            expand_use_tree(&next_prefix, item, out);
        }
        return;
    }
    let (path, alias) = match tree.split_once(" as ") {
        Some((p, a)) => (p.trim(), Some(a.trim())),
        None => (tree, None),
    };
    let full = format!("{}{}", prefix, path);
    let full = full.trim_end_matches("::self").to_string();
    let local = alias
        .map(str::to_string)
        .unwrap_or_else(|| full.rsplit("::").next().unwrap_or(&full).to_string());
    out.push(binding(full, &local));
}

fn parse_rust_use(flat: &str) -> (String, Vec<ImportBinding>) {
    let tree = flat.trim_start_matches("use").trim();
    let mut bindings = Vec::new();
    expand_use_tree("", tree, &mut bindings);
    let source = match tree.find('{') {
        Some(open) => tree[..open].trim_end_matches("::").to_string(),
        None => {
            let path = tree.split(" as ").next().unwrap_or(tree);
            match path.rsplit_once("::") {
                Some((module, _)) => module.to_string(),
                None => path.to_string(),
            }
        }
    };
    (source, bindings)
}

fn parse_go_import(flat: &str) -> (String, Vec<ImportBinding>) {
    let spec = flat.trim_start_matches("import").trim();
    let (alias, path) = match spec.split_once(' ') {
        Some((alias, path)) if !alias.starts_with('"') => (Some(alias.trim()), unquote(path)),
        _ => (None, unquote(spec)),
    };
    let local = alias
        .map(str::to_string)
        .unwrap_or_else(|| path.rsplit('/').next().unwrap_or(&path).to_string());
    let bindings = vec![binding(path.clone(), &local)];
    (path, bindings)
}

/// Render an import block from statement texts (no trailing newline).
pub(crate) fn render_import_block(lang: Language, statements: &[String]) -> String {
    if lang == Language::Go && statements.len() > 1 {
        let mut out = String::from("import (\n");
        for stmt in statements {
            out.push('\t');
            out.push_str(stmt.trim_start_matches("import").trim());
            out.push('\n');
        }
        out.push(')');
        return out;
    }
    statements.join("\n")
}

/// First line after the file header (shebang, leading comments, module
/// docstring, directives, Go `package` clause) where imports belong.
pub(crate) fn header_end(lines: &SourceLines<'_>, lang: Language) -> usize {
    let mut i = 0;
    let mut in_block_comment = false;
    let mut in_docstring: Option<&str> = None;
    while i < lines.len() {
        let t = lines.line(i).trim();
        if in_block_comment {
            if t.contains("*/") {
                in_block_comment = false;
            }
            i += 1;
            continue;
        }
        if let Some(delim) = in_docstring {
            if t.contains(delim) {
                in_docstring = None;
            }
            i += 1;
            continue;
        }
        let is_header = t.is_empty()
            || t.starts_with("#!")
            || (lang.uses_braces() && t.starts_with("//"))
            || (lang == Language::Python && t.starts_with('#'))
            || (lang == Language::Rust && t.starts_with("#!["))
            || (lang == Language::Go && t.starts_with("package "))
            || (lang.supports_jsx()
                && (t.starts_with("\"use ") || t.starts_with("'use ")));
        if is_header {
            i += 1;
            continue;
        }
        if lang.uses_braces() && t.starts_with("/*") {
            in_block_comment = !t.contains("*/");
            i += 1;
            continue;
        }
        if lang == Language::Python && (t.starts_with("\"\"\"") || t.starts_with("'''")) {
            let delim = &t[..3];
            if t.len() < 6 || !t[3..].contains(delim) {
                in_docstring = Some(if delim == "\"\"\"" { "\"\"\"" } else { "'''" });
            }
            i += 1;
            continue;
        }
        break;
    }
    // Do not swallow the blank line(s) right before the first real line.
    while i > 0 && lines.line(i - 1).trim().is_empty() {
        i -= 1;
    }
    i
}

// ---------------------------------------------------------------------------
// Exports
// ---------------------------------------------------------------------------

/// A non-declaration export statement (`export { a }`, `pub use x;`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ExportStmt {
    pub raw: String,
    pub normalized: String,
    pub start: usize,
    pub end: usize,
}

pub(crate) fn extract_exports(content: &str, lang: Language) -> Vec<ExportStmt> {
    let lines = SourceLines::new(content);
    let table = lang.table();
    let mut out = Vec::new();
    let mut i = 0;
    while i < lines.len() {
        let line = lines.line(i);
        if !table.is_export_start(line) {
            i += 1;
            continue;
        }
        let end = statement_end(&lines, i, lang);
        let raw = lines.text(i, end).to_string();
        out.push(ExportStmt {
            normalized: normalize_statement(&raw),
            raw,
            start: i,
            end,
        });
        i = end + 1;
    }
    out
}

// ---------------------------------------------------------------------------
// Declarations
// ---------------------------------------------------------------------------

/// One top-level declaration block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Declaration {
    pub kind: DeclarationKind,
    /// Name, suffixed `#n` for the n-th non-adjacent redefinition.
    pub name: String,
    pub location: String,
    /// The matched declaration line, trimmed.
    pub header: String,
    /// Line span, including leading attributes/decorators.
    pub start: usize,
    pub end: usize,
    pub text: String,
}

fn is_attribute_line(line: &str, lang: Language) -> bool {
    lang.attribute_prefixes()
        .iter()
        .any(|prefix| line.starts_with(prefix))
}

pub(crate) fn extract_declarations(content: &str, lang: Language) -> Vec<Declaration> {
    let lines = SourceLines::new(content);
    let table = lang.table();
    let mut out: Vec<Declaration> = Vec::new();
    let mut seen: HashMap<String, usize> = HashMap::new();
    let mut consumed = 0;
    let mut i = 0;

    while i < lines.len() {
        let line = lines.line(i);
        if table.is_import_start(line) || table.is_export_start(line) {
            let end = statement_end(&lines, i, lang);
            i = end + 1;
            consumed = i;
            continue;
        }
        let Some((kind, name)) = table.match_declaration(line) else {
            i += 1;
            continue;
        };

        let mut start = i;
        while start > consumed && is_attribute_line(lines.line(start - 1), lang) {
            start -= 1;
        }
        let end = block_end(&lines, i, lang);

        // Adjacent same-name declarations (overload signatures) form one block.
        if let Some(prev) = out.last_mut() {
            let base = prev.name.split('#').next().unwrap_or(&prev.name);
            if prev.kind == kind && base == name && prev.end + 1 == start {
                prev.end = end;
                prev.text = lines.text(prev.start, end).to_string();
                i = end + 1;
                consumed = i;
                continue;
            }
        }

        let base_location = declaration_location(kind, &name);
        let count = seen.entry(base_location).or_insert(0);
        *count += 1;
        let name = if *count == 1 {
            name
        } else {
            format!("{}#{}", name, count)
        };

        out.push(Declaration {
            kind,
            location: declaration_location(kind, &name),
            name,
            header: line.trim().to_string(),
            start,
            end,
            text: lines.text(start, end).to_string(),
        });
        i = end + 1;
        consumed = i;
    }
    out
}
