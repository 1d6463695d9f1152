//! Turning a collaborator reply into a single candidate function.

use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::source;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Validation {
    Untested,
    Valid,
    Invalid,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PatchCandidate {
    pub raw: String,
    pub name: String,
    pub body: String,
    pub validation: Validation,
}

impl PatchCandidate {
    pub fn mark(&mut self, valid: bool) {
        self.validation = if valid {
            Validation::Valid
        } else {
            Validation::Invalid
        };
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SynthesisError {
    #[error("reply contains no function definition")]
    NoDefinition,

    #[error("extracted text is not a recognizable function definition")]
    Unparseable,

    #[error("reply defines {0} top-level functions, expected exactly one")]
    Ambiguous(usize),
}

static DEF_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::expect_used)]
    Regex::new(r"^(async\s+)?def\s+[A-Za-z_][A-Za-z0-9_]*\s*\(").expect("static regex")
});

/// Extract the candidate function from a raw reply.
///
/// Everything before the first `def` header is discarded, as is the reply's
/// final line (collaborators close the code with a fence or a remark). What
/// remains must define exactly one top-level function.
pub fn extract_function(raw: &str) -> Result<PatchCandidate, SynthesisError> {
    let lines: Vec<&str> = raw.trim_end().lines().collect();
    let start = lines
        .iter()
        .position(|line| DEF_HEADER.is_match(line.trim_start()))
        .ok_or(SynthesisError::NoDefinition)?;

    let mut kept = &lines[start..];
    kept = &kept[..kept.len() - 1];
    let body = dedent(kept);

    let mut functions =
        source::top_level_functions(&body).map_err(|_| SynthesisError::Unparseable)?;
    let name = match functions.len() {
        0 => return Err(SynthesisError::Unparseable),
        1 => functions.remove(0).name,
        count => return Err(SynthesisError::Ambiguous(count)),
    };

    debug!(function = %name, lines = kept.len(), "extracted candidate");
    Ok(PatchCandidate {
        raw: raw.to_string(),
        name,
        body,
        validation: Validation::Untested,
    })
}

fn dedent(lines: &[&str]) -> String {
    let indent = lines
        .iter()
        .filter(|line| !line.trim().is_empty())
        .map(|line| line.len() - line.trim_start().len())
        .min()
        .unwrap_or(0);

    lines
        .iter()
        .map(|line| {
            if line.trim().is_empty() {
                ""
            } else {
                line.get(indent..).unwrap_or_else(|| line.trim_start())
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
        .trim_end()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_preamble_and_final_line() {
        let raw = "Here is the fixed function:\n```python\ndef get_top_5_links(query):\n    return [query]\n```";
        let candidate = extract_function(raw).unwrap();
        assert_eq!(candidate.name, "get_top_5_links");
        assert_eq!(candidate.body, "def get_top_5_links(query):\n    return [query]");
        assert_eq!(candidate.validation, Validation::Untested);
        assert_eq!(candidate.raw, raw);
    }

    #[test]
    fn reply_with_a_helper_definition_is_rejected() {
        let raw = "```python\ndef get_top_5_links(q):\n    return other(q)\n\ndef other(x):\n    return 'new'\n```";
        assert_eq!(extract_function(raw), Err(SynthesisError::Ambiguous(2)));
    }

    #[test]
    fn nested_helpers_still_count_as_one_function() {
        let raw = "def outer(x):\n    def inner(y):\n        return y\n    return inner(x)\n```";
        let candidate = extract_function(raw).unwrap();
        assert_eq!(candidate.name, "outer");
        assert!(candidate.body.contains("def inner(y):"));
    }

    #[test]
    fn decorator_in_reply_is_left_out_of_the_body() {
        let raw = "```python\n@cache\ndef get_top_5_links(q):\n    return [q]\n```";
        let candidate = extract_function(raw).unwrap();
        assert_eq!(candidate.body, "def get_top_5_links(q):\n    return [q]");
    }

    #[test]
    fn no_header_is_an_error() {
        assert_eq!(
            extract_function("I could not find the problem.\nSorry."),
            Err(SynthesisError::NoDefinition)
        );
        // `define` is not a header.
        assert_eq!(
            extract_function("define the scope\nok"),
            Err(SynthesisError::NoDefinition)
        );
    }

    #[test]
    fn header_on_last_line_leaves_nothing() {
        assert_eq!(
            extract_function("text\ndef f(x): return x"),
            Err(SynthesisError::Unparseable)
        );
    }

    #[test]
    fn indented_reply_is_dedented() {
        let raw = "    def extract(url):\n        return url\n    \n    # end";
        let candidate = extract_function(raw).unwrap();
        assert_eq!(candidate.body, "def extract(url):\n    return url");
    }

    #[test]
    fn async_header_is_recognized() {
        let candidate = extract_function("async def fetch(u):\n    return u\n```").unwrap();
        assert_eq!(candidate.name, "fetch");
    }

    #[test]
    fn mark_updates_validation() {
        let mut candidate = extract_function("def f(x):\n    return x\n```").unwrap();
        candidate.mark(true);
        assert_eq!(candidate.validation, Validation::Valid);
        candidate.mark(false);
        assert_eq!(candidate.validation, Validation::Invalid);
    }
}
