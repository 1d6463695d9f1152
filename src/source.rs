//! Structural queries over Python source, backed by tree-sitter.

use std::ops::Range;

use thiserror::Error;
use tree_sitter::{Node, Parser, Tree};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SourceError {
    #[error("python grammar could not be loaded: {0}")]
    Grammar(String),

    #[error("source could not be parsed")]
    Unparseable,

    #[error("no top-level function named '{0}'")]
    NotFound(String),

    #[error("{count} top-level functions named '{name}'")]
    Ambiguous { name: String, count: usize },
}

/// A top-level function definition and where it sits in the file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSpan {
    pub name: String,
    /// Byte range of the `def` itself; decorators stay outside the span.
    pub span: Range<usize>,
}

fn parse(source: &str) -> Result<Tree, SourceError> {
    let mut parser = Parser::new();
    parser
        .set_language(&tree_sitter_python::LANGUAGE.into())
        .map_err(|e| SourceError::Grammar(e.to_string()))?;
    parser.parse(source, None).ok_or(SourceError::Unparseable)
}

/// True when the source parses without syntax errors.
pub fn parses_cleanly(source: &str) -> bool {
    parse(source).is_ok_and(|tree| !tree.root_node().has_error())
}

/// All top-level function definitions, in file order.
pub fn top_level_functions(source: &str) -> Result<Vec<FunctionSpan>, SourceError> {
    let tree = parse(source)?;
    let root = tree.root_node();
    let bytes = source.as_bytes();

    let mut functions = Vec::new();
    let mut cursor = root.walk();
    for child in root.children(&mut cursor) {
        let Some(def) = function_node(child) else {
            continue;
        };
        let Some(name) = def
            .child_by_field_name("name")
            .and_then(|n| n.utf8_text(bytes).ok())
        else {
            continue;
        };
        functions.push(FunctionSpan {
            name: name.to_string(),
            span: def.start_byte()..def.end_byte(),
        });
    }
    Ok(functions)
}

fn function_node(node: Node<'_>) -> Option<Node<'_>> {
    match node.kind() {
        "function_definition" => Some(node),
        "decorated_definition" => node
            .child_by_field_name("definition")
            .filter(|def| def.kind() == "function_definition"),
        _ => None,
    }
}

/// Locate the unique top-level function called `name`.
pub fn locate_function(source: &str, name: &str) -> Result<FunctionSpan, SourceError> {
    let mut matches: Vec<FunctionSpan> = top_level_functions(source)?
        .into_iter()
        .filter(|f| f.name == name)
        .collect();

    match matches.len() {
        0 => Err(SourceError::NotFound(name.to_string())),
        1 => Ok(matches.remove(0)),
        count => Err(SourceError::Ambiguous {
            name: name.to_string(),
            count,
        }),
    }
}

/// Source text of a top-level function, decorators excluded.
pub fn function_source<'a>(source: &'a str, name: &str) -> Result<&'a str, SourceError> {
    let found = locate_function(source, name)?;
    Ok(&source[found.span])
}

/// Module-level import statements, one per line, in file order.
pub fn module_imports(source: &str) -> Result<String, SourceError> {
    let tree = parse(source)?;
    let root = tree.root_node();

    let mut out = String::new();
    let mut cursor = root.walk();
    for child in root.children(&mut cursor) {
        if matches!(
            child.kind(),
            "import_statement" | "import_from_statement" | "future_import_statement"
        ) {
            out.push_str(&source[child.start_byte()..child.end_byte()]);
            out.push('\n');
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const APP: &str = r#"import requests
from bs4 import BeautifulSoup as bs

BASE = "https://help.example.com"


@cache
def get_top_5_links(query):
    soup = bs(requests.get(BASE, params={"q": query}).text, "html.parser")
    return [a["href"] for a in soup.find_all("a")][:5]


def extract(url):
    def inner():
        return 1
    return inner()


class Page:
    def extract(self):
        return None
"#;

    #[test]
    fn finds_top_level_functions_in_order() {
        let names: Vec<String> = top_level_functions(APP)
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["get_top_5_links", "extract"]);
    }

    #[test]
    fn span_excludes_decorator() {
        let text = function_source(APP, "get_top_5_links").unwrap();
        assert!(text.starts_with("def get_top_5_links(query):"));
        assert!(text.trim_end().ends_with("[:5]"));
    }

    #[test]
    fn methods_and_nested_functions_are_ignored() {
        // `extract` exists as a method and a top-level function; only the latter counts.
        let found = locate_function(APP, "extract").unwrap();
        assert!(APP[found.span].starts_with("def extract(url):"));
        assert!(matches!(
            locate_function(APP, "inner"),
            Err(SourceError::NotFound(_))
        ));
    }

    #[test]
    fn duplicate_definitions_are_ambiguous() {
        let src = "def f():\n    return 1\n\n\ndef f():\n    return 2\n";
        assert_eq!(
            locate_function(src, "f"),
            Err(SourceError::Ambiguous {
                name: "f".to_string(),
                count: 2
            })
        );
    }

    #[test]
    fn async_definitions_are_found() {
        let src = "async def fetch(url):\n    return url\n";
        let found = locate_function(src, "fetch").unwrap();
        assert_eq!(found.span.start, 0);
    }

    #[test]
    fn imports_are_collected() {
        let imports = module_imports(APP).unwrap();
        assert_eq!(
            imports,
            "import requests\nfrom bs4 import BeautifulSoup as bs\n"
        );
    }

    #[test]
    fn clean_parse_detection() {
        assert!(parses_cleanly(APP));
        assert!(!parses_cleanly("def broken(:\n    return\n"));
    }

    #[test]
    fn no_functions_in_plain_statements() {
        assert!(top_level_functions("x = 1\n").unwrap().is_empty());
    }
}
