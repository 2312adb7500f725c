
use tree_sitter::{Node, Parser};

use super::{Language, LineSpan, StructuralParser};
use crate::{Result, WeaveError};

/// Structural parser built on the bundled tree-sitter grammars.
///
/// A fresh `tree_sitter::Parser` is created per call since parsers are not `Sync`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TreeSitterParser;

impl TreeSitterParser {
    fn grammar(language: Language) -> Option<tree_sitter::Language> {
        let grammar = match language {
            Language::Rust => tree_sitter_rust::LANGUAGE,
            Language::Python => tree_sitter_python::LANGUAGE,
            Language::TypeScript => tree_sitter_typescript::LANGUAGE_TYPESCRIPT,
            Language::Tsx => tree_sitter_typescript::LANGUAGE_TSX,
            Language::JavaScript => tree_sitter_javascript::LANGUAGE,
            Language::Go => tree_sitter_go::LANGUAGE,
            Language::Java => tree_sitter_java::LANGUAGE,
            Language::Unknown => return None,
        };
        Some(grammar.into())
    }

    /// Node kinds kept together as one unit when they appear at the top level
    fn definition_kinds(language: Language) -> &'static [&'static str] {
        match language {
            Language::Rust => &[
                "function_item",
                "struct_item",
                "enum_item",
                "impl_item",
                "trait_item",
                "mod_item",
                "macro_definition",
            ],
            Language::Python => &[
                "function_definition",
                "class_definition",
                "decorated_definition",
            ],
            Language::TypeScript | Language::Tsx => &[
                "function_declaration",
                "class_declaration",
                "interface_declaration",
                "type_alias_declaration",
                "enum_declaration",
                "export_statement",
            ],
            Language::JavaScript => &[
                "function_declaration",
                "class_declaration",
                "export_statement",
            ],
            Language::Go => &[
                "function_declaration",
                "method_declaration",
                "type_declaration",
            ],
            Language::Java => &[
                "class_declaration",
                "interface_declaration",
                "enum_declaration",
                "record_declaration",
            ],
            Language::Unknown => &[],
        }
    }
}

impl StructuralParser for TreeSitterParser {
    #[inline]
    fn supports(&self, language: Language) -> bool {
        language != Language::Unknown
    }

    #[inline]
    fn top_level_spans(&self, text: &str, language: Language) -> Result<Vec<LineSpan>> {
        let grammar = Self::grammar(language).ok_or_else(|| {
            WeaveError::Chunking(format!("No grammar bundled for {}", language.as_str()))
        })?;

        let mut parser = Parser::new();
        parser.set_language(&grammar).map_err(|e| {
            WeaveError::Chunking(format!(
                "Failed to load {} grammar: {}",
                language.as_str(),
                e
            ))
        })?;

        let tree = parser.parse(text, None).ok_or_else(|| {
            WeaveError::Chunking(format!("{} parser produced no tree", language.as_str()))
        })?;

        let root = tree.root_node();
        if root.has_error() {
            return Err(WeaveError::Chunking(format!(
                "{} source contains syntax errors",
                language.as_str()
            )));
        }

        let kinds = Self::definition_kinds(language);
        let mut cursor = root.walk();
        let spans = root
            .named_children(&mut cursor)
            .filter(|node| kinds.contains(&node.kind()))
            .map(|node| node_span(&node))
            .collect();

        Ok(spans)
    }
}

fn node_span(node: &Node<'_>) -> LineSpan {
    let start = node.start_position();
    let end = node.end_position();

    // A node ending at column 0 stops before that row's first character
    let end_row = if end.column == 0 && end.row > start.row {
        end.row - 1
    } else {
        end.row
    };

    LineSpan::new(start.row + 1, end_row + 1)
}
