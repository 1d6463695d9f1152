//! Message composition for judgment and diagnosis conversations.

use serde_json::Value;

use crate::config::JudgeInput;

/// Render a routine result the way a reader would write it down: strings
/// verbatim, tuple positions on their own labeled lines, anything else as JSON.
pub fn render_value(value: &Value, labels: &[String]) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Array(items) if !labels.is_empty() && items.len() == labels.len() => labels
            .iter()
            .zip(items)
            .map(|(label, item)| format!("{label}: {}", render_value(item, &[])))
            .collect::<Vec<_>>()
            .join("\n"),
        other => other.to_string(),
    }
}

/// The two turns of a judgment conversation.
///
/// `Page` judgments pair the live page with the produced output; `Reference`
/// judgments pair the recorded reference with it.
pub fn judgment_messages(
    judge: JudgeInput,
    page: Option<&str>,
    reference: &Value,
    actual: &Value,
    labels: &[String],
) -> Vec<String> {
    match judge {
        JudgeInput::Page => vec![
            page.unwrap_or_default().to_string(),
            render_value(actual, labels),
        ],
        JudgeInput::Reference => vec![
            format!(
                "Expected output:\n{}\n\nDo not call any function.",
                render_value(reference, labels)
            ),
            format!("Actual output:\n{}", render_value(actual, labels)),
        ],
    }
}

/// What the diagnosis conversation needs to know about the broken routine.
pub struct DiagnosisContext<'a> {
    pub routine: &'a str,
    pub description: Option<&'a str>,
    pub routine_source: &'a str,
    pub actual: Option<&'a Value>,
    pub failure: Option<&'a str>,
    pub labels: &'a [String],
}

/// Page turns (one per chunk) followed by the repair instruction.
pub fn diagnosis_messages(ctx: &DiagnosisContext<'_>, page_chunks: &[String]) -> Vec<String> {
    let target = ctx
        .description
        .unwrap_or("the data the function is meant to extract");
    let mut messages = Vec::with_capacity(page_chunks.len() + 1);

    let total = page_chunks.len();
    for (index, chunk) in page_chunks.iter().enumerate() {
        let part = index + 1;
        let mut msg = if total == 1 {
            format!("This is the HTML page the function extracts from: {chunk}\n\n")
        } else {
            format!("This is part {part} of {total} of the HTML page the function extracts from: {chunk}\n\n")
        };
        if part < total {
            msg.push_str("I will send the next part next. Do not call any function.");
        } else {
            msg.push_str(&format!(
                "Review the entire HTML and identify the specific elements (e.g. <div>, <p>, <span>) \
                 that contain {target}. Identify the elements without making any function calls."
            ));
        }
        messages.push(msg);
    }

    let mut instruction = String::new();
    instruction.push_str(&format!(
        "I have a Python function `{}` that extracts {target} by targeting specific HTML elements. \
         Carefully examine every line where it locates elements (find, find_all, select, XPath) and \
         check that the tag, class and attributes it targets match the page's actual structure.\n\n",
        ctx.routine
    ));

    instruction.push_str("## Function\n\n");
    instruction.push_str(ctx.routine_source.trim_end());
    instruction.push_str("\n\n");

    if let Some(actual) = ctx.actual {
        instruction.push_str("## It currently returns\n\n");
        instruction.push_str(&render_value(actual, ctx.labels));
        instruction.push_str("\n\n");
    }
    if let Some(failure) = ctx.failure {
        instruction.push_str("## Problem observed\n\n");
        instruction.push_str(failure);
        instruction.push_str("\n\n");
    }

    instruction.push_str(
        "Take exactly one of the following actions:\n\
         1. If the function needs no changes, call the `passed_test` function.\n\
         2. Otherwise respond with only the modified function, without explanations, comments \
         or additional text. Do not call `passed_test`.",
    );
    messages.push(instruction);
    messages
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn labels(names: &[&str]) -> Vec<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn page_judgment_is_page_then_actual() {
        let messages = judgment_messages(
            JudgeInput::Page,
            Some("<html>results</html>"),
            &json!(["a"]),
            &json!(["Error: no results"]),
            &[],
        );
        assert_eq!(messages, vec!["<html>results</html>", "[\"Error: no results\"]"]);
    }

    #[test]
    fn reference_judgment_labels_tuple_positions() {
        let names = labels(&["Original question", "Accepted solutions"]);
        let messages = judgment_messages(
            JudgeInput::Reference,
            None,
            &json!(["Curve table?", ["Use labels"]]),
            &json!(["Curve table?", []]),
            &names,
        );
        assert_eq!(messages.len(), 2);
        assert!(messages[0].starts_with("Expected output:\nOriginal question: Curve table?\nAccepted solutions: [\"Use labels\"]"));
        assert_eq!(
            messages[1],
            "Actual output:\nOriginal question: Curve table?\nAccepted solutions: []"
        );
    }

    #[test]
    fn render_ignores_labels_on_arity_mismatch() {
        assert_eq!(render_value(&json!([1, 2]), &labels(&["only"])), "[1,2]");
        assert_eq!(render_value(&json!("plain"), &labels(&["x"])), "plain");
    }

    #[test]
    fn diagnosis_sends_chunks_then_instruction() {
        let ctx = DiagnosisContext {
            routine: "extract_forum_info",
            description: Some("the original question and accepted solutions"),
            routine_source: "def extract_forum_info(url):\n    return ('', [])\n",
            actual: Some(&json!(["", []])),
            failure: Some("position 0: expected \"Curve table?\", got \"\""),
            labels: &[],
        };
        let chunks = vec!["<html>part one".to_string(), "part two</html>".to_string()];
        let messages = diagnosis_messages(&ctx, &chunks);

        assert_eq!(messages.len(), 3);
        assert!(messages[0].contains("part 1 of 2"));
        assert!(messages[0].contains("I will send the next part next"));
        assert!(messages[1].contains("part 2 of 2"));
        assert!(messages[1].contains("the original question and accepted solutions"));
        assert!(messages[2].contains("def extract_forum_info(url):"));
        assert!(messages[2].contains("Problem observed"));
        assert!(messages[2].contains("`passed_test`"));
    }

    #[test]
    fn diagnosis_without_page_is_instruction_only() {
        let ctx = DiagnosisContext {
            routine: "f",
            description: None,
            routine_source: "def f(x):\n    return x",
            actual: None,
            failure: None,
            labels: &[],
        };
        let messages = diagnosis_messages(&ctx, &[]);
        assert_eq!(messages.len(), 1);
        assert!(!messages[0].contains("It currently returns"));
        assert!(messages[0].contains("the data the function is meant to extract"));
    }
}
