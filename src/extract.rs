//! Pluggable dependency extraction.
//!
//! An extractor looks at a file's content and returns the raw references it
//! finds there: include paths, import specifiers, module names. Extraction is
//! best effort. References that do not resolve to a scanned file are dropped
//! later by the graph builder, so extractors may freely over-report.

use std::collections::BTreeSet;
use std::sync::LazyLock;

use camino::Utf8Path;
use regex::Regex;

pub trait DependencyExtractor: Send + Sync {
    fn extract(&self, content: &str, path: &Utf8Path) -> BTreeSet<String>;
}

impl<F> DependencyExtractor for F
where
    F: Fn(&str, &Utf8Path) -> BTreeSet<String> + Send + Sync,
{
    fn extract(&self, content: &str, path: &Utf8Path) -> BTreeSet<String> {
        self(content, path)
    }
}

/// A single extraction rule, applied to files with one of the listed
/// extensions. Every capture group that participates in a match yields one
/// reference.
#[derive(Debug, Clone)]
pub struct Rule {
    extensions: Vec<String>,
    regex: Regex,
    /// Rewrites dotted module names (`pkg.mod`) into paths (`pkg/mod`).
    dotted: bool,
}

impl Rule {
    pub fn new<I, S>(extensions: I, pattern: &str) -> Result<Self, regex::Error>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Ok(Self {
            extensions: extensions.into_iter().map(Into::into).collect(),
            regex: Regex::new(pattern)?,
            dotted: false,
        })
    }

    pub fn dotted(mut self) -> Self {
        self.dotted = true;
        self
    }

    fn applies_to(&self, path: &Utf8Path) -> bool {
        match path.extension() {
            Some(ext) => self.extensions.iter().any(|e| e.eq_ignore_ascii_case(ext)),
            None => false,
        }
    }
}

static BUILTIN_RULES: LazyLock<Vec<Rule>> = LazyLock::new(|| {
    const C_LIKE: &[&str] = &["c", "h", "cc", "cpp", "cxx", "hpp", "hh", "m", "mm"];
    const JS_LIKE: &[&str] = &["js", "jsx", "mjs", "cjs", "ts", "tsx", "mts", "cts", "svelte", "vue"];
    const STYLES: &[&str] = &["css", "scss", "sass", "less"];
    const DOCS: &[&str] = &["md", "markdown", "html", "htm"];

    let rules = [
        Rule::new(C_LIKE.iter().copied(), r#"(?m)^\s*#\s*(?:include|import)\s*"([^"]+)""#),
        Rule::new(
            JS_LIKE.iter().copied(),
            r#"(?m)(?:^|[\s;])(?:import|export)\s[^'";]*?\bfrom\s*['"]([^'"]+)['"]"#,
        ),
        Rule::new(JS_LIKE.iter().copied(), r#"(?m)^\s*import\s*['"]([^'"]+)['"]"#),
        Rule::new(
            JS_LIKE.iter().copied(),
            r#"(?:\bimport|\brequire)\s*\(\s*['"]([^'"]+)['"]\s*\)"#,
        ),
        Rule::new(
            ["py", "pyi"],
            r"(?m)^\s*(?:from\s+([\w.]+)\s+import\b|import\s+([\w.]+))",
        )
        .map(Rule::dotted),
        Rule::new(["rs"], r"(?m)^\s*(?:pub(?:\([^)]*\))?\s+)?mod\s+(\w+)\s*;"),
        Rule::new(STYLES.iter().copied(), r#"@(?:import|use|forward)\s+['"]([^'"]+)['"]"#),
        Rule::new(STYLES.iter().copied(), r#"url\(\s*['"]?([^'")\s]+)['"]?\s*\)"#),
        Rule::new(DOCS.iter().copied(), r"\]\(\s*<?([^)>#\s]+)"),
        Rule::new(DOCS.iter().copied(), r#"(?:src|href)\s*=\s*["']([^"'#]+)["']"#),
    ];

    rules
        .into_iter()
        .collect::<Result<Vec<_>, _>>()
        .expect("Error compiling builtin extraction rules")
});

/// Pattern based extractor, the default implementation.
///
/// Out of the box it understands C-like includes, JS/TS imports, Python
/// imports, Rust `mod` declarations, stylesheet imports and document links.
#[derive(Debug, Clone)]
pub struct RegexExtractor {
    rules: Vec<Rule>,
}

impl RegexExtractor {
    /// An extractor with no rules at all.
    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }
}

impl Default for RegexExtractor {
    fn default() -> Self {
        Self {
            rules: BUILTIN_RULES.clone(),
        }
    }
}

impl DependencyExtractor for RegexExtractor {
    fn extract(&self, content: &str, path: &Utf8Path) -> BTreeSet<String> {
        let mut found = BTreeSet::new();

        for rule in self.rules.iter().filter(|r| r.applies_to(path)) {
            for captures in rule.regex.captures_iter(content) {
                for group in captures.iter().skip(1).flatten() {
                    let reference = group.as_str().trim();
                    if reference.is_empty() || is_external(reference) {
                        continue;
                    }

                    if rule.dotted {
                        found.insert(dotted_to_path(reference));
                    } else {
                        found.insert(reference.to_string());
                    }
                }
            }
        }

        found
    }
}

/// URLs never name project files.
fn is_external(reference: &str) -> bool {
    reference.contains("://") || reference.starts_with("data:") || reference.starts_with("mailto:")
}

/// `.sibling` -> `./sibling`, `..pkg.mod` -> `../pkg/mod`, `pkg.mod` -> `pkg/mod`
fn dotted_to_path(module: &str) -> String {
    let leading = module.chars().take_while(|&c| c == '.').count();
    let rest = module[leading..].replace('.', "/");

    let prefix = match leading {
        0 => String::new(),
        1 => "./".to_string(),
        n => "../".repeat(n - 1),
    };

    format!("{prefix}{rest}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(path: &str, content: &str) -> Vec<String> {
        RegexExtractor::default()
            .extract(content, Utf8Path::new(path))
            .into_iter()
            .collect()
    }

    #[test]
    fn test_c_includes() {
        let refs = extract(
            "src/main.c",
            "#include \"util.h\"\n#include <stdio.h>\n  # include \"net/sock.h\"\n",
        );
        assert_eq!(refs, vec!["net/sock.h", "util.h"]);
    }

    #[test]
    fn test_js_imports() {
        let refs = extract(
            "web/app.ts",
            r#"
import { a } from './a';
import b from "../lib/b.js";
import './side-effect.css';
export * from './reexport';
const c = require('./c');
const d = await import('./d');
import fetch from 'https://cdn.example.com/fetch.js';
"#,
        );
        assert_eq!(
            refs,
            vec![
                "../lib/b.js",
                "./a",
                "./c",
                "./d",
                "./reexport",
                "./side-effect.css"
            ]
        );
    }

    #[test]
    fn test_python_imports() {
        let refs = extract(
            "pkg/main.py",
            "import os\nfrom pkg.util import helper\nfrom . import sibling\nfrom ..core import x\n",
        );
        assert_eq!(refs, vec!["../core", "./", "os", "pkg/util"]);
    }

    #[test]
    fn test_rust_modules() {
        let refs = extract("src/lib.rs", "mod graph;\npub mod scan;\npub(crate) mod util;\nmod inline {}\n");
        assert_eq!(refs, vec!["graph", "scan", "util"]);
    }

    #[test]
    fn test_docs_links() {
        let refs = extract(
            "docs/index.md",
            "See [guide](guide.md#intro) and ![logo](../assets/logo.png) or [site](https://example.com).",
        );
        assert_eq!(refs, vec!["../assets/logo.png", "guide.md"]);
    }

    #[test]
    fn test_unknown_extension_yields_nothing() {
        assert!(extract("data.bin", "#include \"x.h\"").is_empty());
        assert!(extract("Makefile", "import './a'").is_empty());
    }

    #[test]
    fn test_custom_rule_and_closure() {
        let extractor = RegexExtractor::empty()
            .with_rule(Rule::new(["txt"], r"see:(\S+)").unwrap());
        let refs = extractor.extract("see:a.txt and see:b.txt", Utf8Path::new("x.txt"));
        assert_eq!(refs.len(), 2);

        let closure = |content: &str, _: &Utf8Path| -> BTreeSet<String> {
            content.lines().map(str::to_string).collect()
        };
        assert_eq!(closure.extract("a\nb", Utf8Path::new("x")).len(), 2);
    }
}
