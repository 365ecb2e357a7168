//! Language detection and tree-sitter grammar registry.

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Language of a source file. Only some have a grammar; the rest are always
/// chunked by line windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Lang {
    Rust,
    Python,
    JavaScript,
    TypeScript,
    Go,
    Java,
    Bash,
    Toml,
    Json,
    Yaml,
    Markdown,
}

/// Role of a cross-reference node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum XrefRole {
    Import,
    Export,
}

impl Lang {
    /// Identifier stored with embeddings and used in config.
    #[must_use]
    pub fn id(self) -> &'static str {
        match self {
            Self::Rust => "rust",
            Self::Python => "python",
            Self::JavaScript => "javascript",
            Self::TypeScript => "typescript",
            Self::Go => "go",
            Self::Java => "java",
            Self::Bash => "bash",
            Self::Toml => "toml",
            Self::Json => "json",
            Self::Yaml => "yaml",
            Self::Markdown => "markdown",
        }
    }

    /// Get the tree-sitter grammar. Returns `None` if the language has no
    /// grammar or the corresponding feature is not enabled.
    #[must_use]
    pub fn grammar(self) -> Option<tree_sitter::Language> {
        match self {
            #[cfg(feature = "lang-rust")]
            Self::Rust => Some(tree_sitter_rust::LANGUAGE.into()),
            #[cfg(feature = "lang-python")]
            Self::Python => Some(tree_sitter_python::LANGUAGE.into()),
            #[cfg(feature = "lang-js")]
            Self::JavaScript => Some(tree_sitter_javascript::LANGUAGE.into()),
            #[cfg(feature = "lang-js")]
            Self::TypeScript => Some(tree_sitter_typescript::LANGUAGE_TYPESCRIPT.into()),
            #[cfg(feature = "lang-go")]
            Self::Go => Some(tree_sitter_go::LANGUAGE.into()),
            #[cfg(feature = "lang-java")]
            Self::Java => Some(tree_sitter_java::LANGUAGE.into()),
            #[allow(unreachable_patterns)]
            _ => None,
        }
    }

    /// Node kinds that become chunks and symbols.
    #[must_use]
    pub fn chunkable_kinds(self) -> &'static [&'static str] {
        match self {
            Self::Rust => &[
                "function_item",
                "struct_item",
                "enum_item",
                "trait_item",
                "impl_item",
                "type_item",
                "mod_item",
                "macro_definition",
            ],
            Self::Python => &[
                "function_definition",
                "class_definition",
                "decorated_definition",
            ],
            Self::JavaScript => &[
                "function_declaration",
                "generator_function_declaration",
                "class_declaration",
                "method_definition",
            ],
            Self::TypeScript => &[
                "function_declaration",
                "generator_function_declaration",
                "class_declaration",
                "abstract_class_declaration",
                "method_definition",
                "interface_declaration",
                "type_alias_declaration",
                "enum_declaration",
            ],
            Self::Go => &[
                "function_declaration",
                "method_declaration",
                "type_declaration",
            ],
            Self::Java => &[
                "class_declaration",
                "interface_declaration",
                "enum_declaration",
                "record_declaration",
                "method_declaration",
                "constructor_declaration",
            ],
            _ => &[],
        }
    }

    /// Top-level node kinds that carry imports or exports.
    pub(crate) fn xref_kinds(self) -> &'static [(&'static str, XrefRole)] {
        match self {
            Self::Rust => &[("use_declaration", XrefRole::Import)],
            Self::Python => &[
                ("import_statement", XrefRole::Import),
                ("import_from_statement", XrefRole::Import),
            ],
            Self::JavaScript | Self::TypeScript => &[
                ("import_statement", XrefRole::Import),
                ("export_statement", XrefRole::Export),
            ],
            Self::Go => &[("import_declaration", XrefRole::Import)],
            Self::Java => &[("import_declaration", XrefRole::Import)],
            _ => &[],
        }
    }
}

impl std::fmt::Display for Lang {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.id())
    }
}

/// Detect language from file extension.
#[must_use]
pub fn detect_language(path: &Path) -> Option<Lang> {
    let ext = path.extension()?.to_str()?.to_ascii_lowercase();
    match ext.as_str() {
        "rs" => Some(Lang::Rust),
        "py" | "pyi" => Some(Lang::Python),
        "js" | "jsx" | "mjs" | "cjs" => Some(Lang::JavaScript),
        "ts" | "tsx" | "mts" | "cts" => Some(Lang::TypeScript),
        "go" => Some(Lang::Go),
        "java" => Some(Lang::Java),
        "sh" | "bash" | "zsh" => Some(Lang::Bash),
        "toml" => Some(Lang::Toml),
        "json" | "jsonc" => Some(Lang::Json),
        "yaml" | "yml" => Some(Lang::Yaml),
        "md" | "markdown" => Some(Lang::Markdown),
        _ => None,
    }
}

/// Whether a file has a known language and is therefore worth indexing.
#[must_use]
pub fn is_indexable(path: &Path) -> bool {
    detect_language(path).is_some()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detect_language_rs() {
        assert_eq!(detect_language(Path::new("src/main.rs")), Some(Lang::Rust));
    }

    #[test]
    fn detect_language_java_and_uppercase() {
        assert_eq!(detect_language(Path::new("App.java")), Some(Lang::Java));
        assert_eq!(detect_language(Path::new("README.MD")), Some(Lang::Markdown));
    }

    #[test]
    fn detect_language_ts_variants() {
        for ext in &["ts", "tsx", "mts", "cts"] {
            let path = format!("file.{ext}");
            assert_eq!(
                detect_language(Path::new(&path)),
                Some(Lang::TypeScript),
                "failed for .{ext}"
            );
        }
    }

    #[test]
    fn detect_language_unknown_ext_returns_none() {
        assert_eq!(detect_language(Path::new("file.xyz")), None);
        assert_eq!(detect_language(Path::new("file")), None);
        assert!(!is_indexable(Path::new("image.png")));
    }

    #[test]
    fn chunkable_kinds_cover_declarations() {
        assert!(Lang::Rust.chunkable_kinds().contains(&"impl_item"));
        assert!(Lang::Python.chunkable_kinds().contains(&"decorated_definition"));
        assert!(Lang::TypeScript.chunkable_kinds().contains(&"interface_declaration"));
        assert!(Lang::Java.chunkable_kinds().contains(&"method_declaration"));
        assert!(Lang::Toml.chunkable_kinds().is_empty());
    }

    #[test]
    fn markup_languages_have_no_grammar() {
        for lang in [Lang::Bash, Lang::Toml, Lang::Json, Lang::Yaml, Lang::Markdown] {
            assert!(lang.grammar().is_none());
        }
    }

    #[test]
    fn grammar_returns_some_for_enabled_features() {
        #[cfg(feature = "lang-rust")]
        assert!(Lang::Rust.grammar().is_some());
        #[cfg(feature = "lang-python")]
        assert!(Lang::Python.grammar().is_some());
        #[cfg(feature = "lang-js")]
        {
            assert!(Lang::JavaScript.grammar().is_some());
            assert!(Lang::TypeScript.grammar().is_some());
        }
        #[cfg(feature = "lang-go")]
        assert!(Lang::Go.grammar().is_some());
        #[cfg(feature = "lang-java")]
        assert!(Lang::Java.grammar().is_some());
    }

    #[test]
    fn display_matches_id() {
        for lang in [
            Lang::Rust,
            Lang::Python,
            Lang::JavaScript,
            Lang::TypeScript,
            Lang::Go,
            Lang::Java,
            Lang::Bash,
            Lang::Toml,
            Lang::Json,
            Lang::Yaml,
            Lang::Markdown,
        ] {
            assert_eq!(lang.to_string(), lang.id());
        }
    }
}
