//! Per-language pattern tables.
//!
//! Each supported language has two pattern families: "import-like" lines
//! (imports and re-exports) and "declaration-like" lines (top-level
//! functions, classes, variables, and types). Patterns are anchored at column
//! zero so only top-level constructs match.

use std::sync::OnceLock;

use regex_lite::Regex;

use crate::models::DeclarationKind;

/// Languages the analyzer understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Language {
    TypeScript,
    JavaScript,
    Python,
    Rust,
    Go,
}

impl Language {
    /// Resolve a file extension (with or without the leading dot).
    pub fn from_extension(ext: &str) -> Option<Self> {
        let ext = ext.trim_start_matches('.').to_ascii_lowercase();
        match ext.as_str() {
            "ts" | "tsx" | "mts" | "cts" => Some(Self::TypeScript),
            "js" | "jsx" | "mjs" | "cjs" => Some(Self::JavaScript),
            "py" | "pyi" => Some(Self::Python),
            "rs" => Some(Self::Rust),
            "go" => Some(Self::Go),
            _ => None,
        }
    }

    /// Resolve a language from a path's extension.
    pub fn from_path(path: &str) -> Option<Self> {
        let ext = std::path::Path::new(path).extension()?.to_str()?;
        Self::from_extension(ext)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::TypeScript => "typescript",
            Self::JavaScript => "javascript",
            Self::Python => "python",
            Self::Rust => "rust",
            Self::Go => "go",
        }
    }

    /// Info strings accepted on a fenced code block for this language.
    pub fn fence_tags(self) -> &'static [&'static str] {
        match self {
            Self::TypeScript => &["typescript", "ts", "tsx"],
            Self::JavaScript => &["javascript", "js", "jsx", "mjs"],
            Self::Python => &["python", "py", "python3"],
            Self::Rust => &["rust", "rs"],
            Self::Go => &["go", "golang"],
        }
    }

    /// Tokens at least one of which must appear in code for this language.
    pub fn keywords(self) -> &'static [&'static str] {
        match self {
            Self::TypeScript | Self::JavaScript => &[
                "import", "export", "function", "const", "let", "var", "class", "return", "=>",
                "interface", "type", "<",
            ],
            Self::Python => &[
                "def ", "class ", "import ", "return", "=", "from ", "@", "pass",
            ],
            Self::Rust => &[
                "fn ", "use ", "struct ", "enum ", "impl", "let ", "const ", "static ", "trait ",
                "mod ", "type ",
            ],
            Self::Go => &[
                "func ", "import", "type ", "var ", "const ", "package ", "return",
            ],
        }
    }

    pub fn supports_jsx(self) -> bool {
        matches!(self, Self::TypeScript | Self::JavaScript)
    }

    /// Whether blocks are delimited by braces rather than indentation.
    pub fn uses_braces(self) -> bool {
        !matches!(self, Self::Python)
    }

    /// Prefix of lines that attach to the following declaration
    /// (decorators, attributes, doc comments).
    pub(crate) fn attribute_prefixes(self) -> &'static [&'static str] {
        match self {
            Self::TypeScript | Self::JavaScript | Self::Python => &["@"],
            Self::Rust => &["#[", "///"],
            Self::Go => &[],
        }
    }

    pub(crate) fn table(self) -> &'static PatternTable {
        static TS: OnceLock<PatternTable> = OnceLock::new();
        static PY: OnceLock<PatternTable> = OnceLock::new();
        static RS: OnceLock<PatternTable> = OnceLock::new();
        static GO: OnceLock<PatternTable> = OnceLock::new();
        match self {
            Self::TypeScript | Self::JavaScript => TS.get_or_init(PatternTable::ecmascript),
            Self::Python => PY.get_or_init(PatternTable::python),
            Self::Rust => RS.get_or_init(PatternTable::rust),
            Self::Go => GO.get_or_init(PatternTable::go),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

// ---------------------------------------------------------------------------
// Pattern tables
// ---------------------------------------------------------------------------

/// Compiled patterns for one language family.
pub(crate) struct PatternTable {
    /// First line of an import statement.
    pub import_start: Regex,
    /// First line of an export/re-export statement that is not itself a
    /// declaration.
    pub export_start: Option<Regex>,
    /// Declaration patterns in priority order; each has a `name` group.
    pub declarations: Vec<(DeclarationKind, Regex)>,
}

fn re(pattern: &str) -> Regex {
    // Patterns are static literals covered by unit tests.
    Regex::new(pattern).unwrap_or_else(|e| panic!("invalid analyzer pattern {pattern:?}: {e}"))
}

impl PatternTable {
    fn ecmascript() -> Self {
        Self {
            import_start: re(r#"^import(\s|\{|\*|"|')"#),
            export_start: Some(re(
                r"^export\s*(\{|\*|default\s+[A-Za-z_$][\w$.]*\s*;?\s*$)",
            )),
            declarations: vec![
                (
                    DeclarationKind::Function,
                    re(r"^(export\s+)?(default\s+)?(declare\s+)?(async\s+)?function\s*\*?\s*(?P<name>[A-Za-z_$][\w$]*)"),
                ),
                (
                    DeclarationKind::Function,
                    re(r"^(export\s+)?(const|let|var)\s+(?P<name>[A-Za-z_$][\w$]*)\s*(:[^=]*)?=\s*(async\s+)?(function\b|\([^)]*\)\s*(:[^=]*)?=>|[A-Za-z_$][\w$]*\s*=>)"),
                ),
                (
                    DeclarationKind::Class,
                    re(r"^(export\s+)?(default\s+)?(declare\s+)?(abstract\s+)?class\s+(?P<name>[A-Za-z_$][\w$]*)"),
                ),
                (
                    DeclarationKind::Type,
                    re(r"^(export\s+)?(declare\s+)?(interface|type|enum|const\s+enum)\s+(?P<name>[A-Za-z_$][\w$]*)"),
                ),
                (
                    DeclarationKind::Variable,
                    re(r"^(export\s+)?(declare\s+)?(const|let|var)\s+(?P<name>[A-Za-z_$][\w$]*)"),
                ),
            ],
        }
    }

    fn python() -> Self {
        Self {
            import_start: re(r"^(import\s+\S|from\s+\S+\s+import\b)"),
            export_start: None,
            declarations: vec![
                (
                    DeclarationKind::Function,
                    re(r"^(async\s+)?def\s+(?P<name>\w+)"),
                ),
                (DeclarationKind::Class, re(r"^class\s+(?P<name>\w+)")),
                (DeclarationKind::Type, re(r"^type\s+(?P<name>\w+)\s*(\[[^\]]*\])?\s*=")),
                (
                    DeclarationKind::Variable,
                    re(r"^(?P<name>[A-Za-z_]\w*)\s*(:[^=]*)?=[^=]"),
                ),
            ],
        }
    }

    fn rust() -> Self {
        Self {
            import_start: re(r"^use\s"),
            export_start: Some(re(r"^pub(\([^)]*\))?\s+use\s")),
            declarations: vec![
                (
                    DeclarationKind::Function,
                    re(r#"^(pub(\([^)]*\))?\s+)?(default\s+)?(const\s+)?(async\s+)?(unsafe\s+)?(extern\s+"[^"]*"\s+)?fn\s+(?P<name>\w+)"#),
                ),
                (
                    DeclarationKind::Class,
                    re(r"^(unsafe\s+)?impl(<[^>]*>)?\s+(?P<name>[^{]+?)\s*(where\b.*)?\{?\s*$"),
                ),
                (
                    DeclarationKind::Type,
                    re(r"^(pub(\([^)]*\))?\s+)?(unsafe\s+)?(struct|enum|trait|type|union)\s+(?P<name>\w+)"),
                ),
                (
                    DeclarationKind::Variable,
                    re(r"^(pub(\([^)]*\))?\s+)?(const|static)\s+(mut\s+)?(?P<name>\w+)"),
                ),
            ],
        }
    }

    fn go() -> Self {
        Self {
            import_start: re(r"^import\b"),
            export_start: None,
            declarations: vec![
                (
                    DeclarationKind::Function,
                    re(r"^func\s+(\(\s*(\w+\s+)?\*?(?P<recv>\w+)[^)]*\)\s*)?(?P<name>\w+)"),
                ),
                (DeclarationKind::Type, re(r"^type\s+(?P<name>\w+)")),
                (DeclarationKind::Variable, re(r"^(var|const)\s+(?P<name>\w+)")),
            ],
        }
    }

    /// Match a line against the declaration patterns.
    pub fn match_declaration(&self, line: &str) -> Option<(DeclarationKind, String)> {
        for (kind, pattern) in &self.declarations {
            if let Some(caps) = pattern.captures(line) {
                let name = caps.name("name")?.as_str();
                let name = name.split_whitespace().collect::<Vec<_>>().join(" ");
                let name = match caps.name("recv") {
                    Some(recv) => format!("{}.{}", recv.as_str(), name),
                    None => name,
                };
                return Some((*kind, name));
            }
        }
        None
    }

    pub fn is_import_start(&self, line: &str) -> bool {
        self.import_start.is_match(line)
    }

    pub fn is_export_start(&self, line: &str) -> bool {
        self.export_start
            .as_ref()
            .map(|r| r.is_match(line))
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extension_lookup() {
        assert_eq!(Language::from_extension("tsx"), Some(Language::TypeScript));
        assert_eq!(Language::from_extension(".PY"), Some(Language::Python));
        assert_eq!(Language::from_extension("rs"), Some(Language::Rust));
        assert_eq!(Language::from_extension("md"), None);
        assert_eq!(Language::from_path("src/app/main.go"), Some(Language::Go));
        assert_eq!(Language::from_path("Makefile"), None);
    }

    #[test]
    fn test_all_tables_compile() {
        for lang in [
            Language::TypeScript,
            Language::Python,
            Language::Rust,
            Language::Go,
        ] {
            let table = lang.table();
            assert!(!table.declarations.is_empty());
        }
    }

    #[test]
    fn test_ecmascript_declarations() {
        let t = Language::TypeScript.table();
        assert_eq!(
            t.match_declaration("export default function App() {"),
            Some((DeclarationKind::Function, "App".into()))
        );
        assert_eq!(
            t.match_declaration("export const Button = ({ label }: Props) => {"),
            Some((DeclarationKind::Function, "Button".into()))
        );
        assert_eq!(
            t.match_declaration("const LIMIT = 10;"),
            Some((DeclarationKind::Variable, "LIMIT".into()))
        );
        assert_eq!(
            t.match_declaration("export interface Props {"),
            Some((DeclarationKind::Type, "Props".into()))
        );
        assert_eq!(
            t.match_declaration("class Store extends Base {"),
            Some((DeclarationKind::Class, "Store".into()))
        );
        assert_eq!(t.match_declaration("  return x;"), None);
        assert!(t.is_import_start("import { useState } from \"react\";"));
        assert!(!t.is_import_start("important();"));
        assert!(t.is_export_start("export { a, b };"));
        assert!(t.is_export_start("export default App;"));
        assert!(!t.is_export_start("export default function App() {"));
    }

    #[test]
    fn test_python_declarations() {
        let t = Language::Python.table();
        assert_eq!(
            t.match_declaration("async def fetch(url):"),
            Some((DeclarationKind::Function, "fetch".into()))
        );
        assert_eq!(
            t.match_declaration("MAX_RETRIES = 3"),
            Some((DeclarationKind::Variable, "MAX_RETRIES".into()))
        );
        assert_eq!(t.match_declaration("x == 3"), None);
        assert!(t.is_import_start("from os import path"));
        assert!(t.is_import_start("import json"));
    }

    #[test]
    fn test_rust_and_go_declarations() {
        let t = Language::Rust.table();
        assert_eq!(
            t.match_declaration("pub async fn run(&self) -> Result<()> {"),
            Some((DeclarationKind::Function, "run".into()))
        );
        assert_eq!(
            t.match_declaration("impl Display for Widget {"),
            Some((DeclarationKind::Class, "Display for Widget".into()))
        );
        assert_eq!(
            t.match_declaration("pub(crate) struct Engine {"),
            Some((DeclarationKind::Type, "Engine".into()))
        );
        assert!(t.is_export_start("pub use crate::models::Thing;"));

        let g = Language::Go.table();
        assert_eq!(
            g.match_declaration("func (s *Server) Start() error {"),
            Some((DeclarationKind::Function, "Server.Start".into()))
        );
        assert_eq!(
            g.match_declaration("func main() {"),
            Some((DeclarationKind::Function, "main".into()))
        );
    }
}
