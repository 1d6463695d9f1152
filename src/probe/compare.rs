//! Literal comparison of routine output against a reference.
//!
//! One policy applies everywhere: scalars and strings compare exactly, lists
//! compare as multisets (reordering is fine, missing/extra/duplicated items
//! are not). Tuple-shaped results can give each position its own rule.

use serde::Deserialize;
use serde_json::Value;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Rule {
    /// `unordered` for lists, `exact` for everything else.
    #[default]
    Auto,
    Exact,
    Unordered,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum Comparison {
    Rule(Rule),
    /// One comparison per position of a list-encoded tuple.
    Positional(Vec<Comparison>),
}

impl Default for Comparison {
    fn default() -> Self {
        Comparison::Rule(Rule::Auto)
    }
}

impl Comparison {
    /// Check `actual` against `reference`, describing the first difference.
    pub fn check(&self, actual: &Value, reference: &Value) -> Result<(), String> {
        match self {
            Comparison::Rule(Rule::Exact) => exact(actual, reference),
            Comparison::Rule(Rule::Unordered) => unordered(actual, reference),
            Comparison::Rule(Rule::Auto) => match reference {
                Value::Array(_) => unordered(actual, reference),
                _ => exact(actual, reference),
            },
            Comparison::Positional(rules) => positional(rules, actual, reference),
        }
    }

    pub fn matches(&self, actual: &Value, reference: &Value) -> bool {
        self.check(actual, reference).is_ok()
    }
}

fn exact(actual: &Value, reference: &Value) -> Result<(), String> {
    if actual == reference {
        Ok(())
    } else {
        Err(format!(
            "expected {}, got {}",
            preview(reference),
            preview(actual)
        ))
    }
}

fn unordered(actual: &Value, reference: &Value) -> Result<(), String> {
    let (Value::Array(actual), Value::Array(reference)) = (actual, reference) else {
        return Err(format!(
            "expected a list, got {}",
            preview(actual)
        ));
    };

    if actual.len() != reference.len() {
        return Err(format!(
            "expected {} items, got {}",
            reference.len(),
            actual.len()
        ));
    }

    let mut used = vec![false; reference.len()];
    for item in actual {
        let slot = reference
            .iter()
            .enumerate()
            .position(|(i, candidate)| !used[i] && candidate == item);
        match slot {
            Some(i) => used[i] = true,
            None => {
                return Err(format!(
                    "item {} not found in reference",
                    preview(item)
                ));
            }
        }
    }
    Ok(())
}

fn positional(rules: &[Comparison], actual: &Value, reference: &Value) -> Result<(), String> {
    let (Value::Array(actual), Value::Array(reference)) = (actual, reference) else {
        return Err(format!(
            "expected a {}-tuple, got {}",
            rules.len(),
            preview(actual)
        ));
    };

    if actual.len() != rules.len() || reference.len() != rules.len() {
        return Err(format!(
            "expected a {}-tuple, got {} values",
            rules.len(),
            actual.len()
        ));
    }

    for (index, rule) in rules.iter().enumerate() {
        rule.check(&actual[index], &reference[index])
            .map_err(|e| format!("position {index}: {e}"))?;
    }
    Ok(())
}

fn preview(value: &Value) -> String {
    let text = value.to_string();
    if text.chars().count() > 120 {
        let head: String = text.chars().take(117).collect();
        format!("{head}...")
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn exact_strings() {
        let rule = Comparison::default();
        assert!(rule.matches(&json!("Issue: rotated"), &json!("Issue: rotated")));
        assert!(!rule.matches(&json!("Issue: rotated "), &json!("Issue: rotated")));
    }

    #[test]
    fn reordered_links_pass() {
        let reference = json!(["a", "b", "c", "d", "e"]);
        let actual = json!(["c", "a", "e", "b", "d"]);
        assert!(Comparison::default().matches(&actual, &reference));
    }

    #[test]
    fn count_mismatch_fails() {
        let reference = json!(["a", "b", "c"]);
        let err = Comparison::default()
            .check(&json!(["a", "b"]), &reference)
            .unwrap_err();
        assert!(err.contains("expected 3 items, got 2"));
    }

    #[test]
    fn duplicate_cannot_stand_in_for_missing_item() {
        let reference = json!(["a", "b"]);
        let err = Comparison::default()
            .check(&json!(["a", "a"]), &reference)
            .unwrap_err();
        assert!(err.contains("not found in reference"));
    }

    #[test]
    fn error_sentinel_fails_list_check() {
        let reference = json!(["a", "b", "c", "d", "e"]);
        let sentinel = json!(["Error: search results container not found"]);
        assert!(!Comparison::default().matches(&sentinel, &reference));
    }

    #[test]
    fn exact_rule_is_order_sensitive() {
        let rule = Comparison::Rule(Rule::Exact);
        assert!(!rule.matches(&json!(["b", "a"]), &json!(["a", "b"])));
    }

    #[test]
    fn unordered_rejects_non_lists() {
        let rule = Comparison::Rule(Rule::Unordered);
        assert!(rule.check(&json!("a"), &json!(["a"])).is_err());
    }

    #[test]
    fn positional_applies_rule_per_slot() {
        let rule = Comparison::Positional(vec![
            Comparison::Rule(Rule::Exact),
            Comparison::Rule(Rule::Unordered),
            Comparison::Rule(Rule::Exact),
        ]);
        let reference = json!(["text", ["img/1", "img/2"], []]);
        assert!(rule.matches(&json!(["text", ["img/2", "img/1"], []]), &reference));

        let err = rule
            .check(&json!(["other", ["img/1", "img/2"], []]), &reference)
            .unwrap_err();
        assert!(err.starts_with("position 0"));

        let err = rule.check(&json!(["text", ["img/1"]]), &reference).unwrap_err();
        assert!(err.contains("3-tuple"));
    }

    #[test]
    fn deserializes_rules_and_positional_lists() {
        #[derive(Deserialize)]
        struct Wrapper {
            compare: Comparison,
        }

        let w: Wrapper = toml::from_str(r#"compare = "unordered""#).unwrap();
        assert_eq!(w.compare, Comparison::Rule(Rule::Unordered));

        let w: Wrapper = toml::from_str(r#"compare = ["exact", "auto"]"#).unwrap();
        assert_eq!(
            w.compare,
            Comparison::Positional(vec![
                Comparison::Rule(Rule::Exact),
                Comparison::Rule(Rule::Auto)
            ])
        );
    }

    #[test]
    fn long_values_are_truncated_in_messages() {
        let long = "x".repeat(500);
        let err = Comparison::default()
            .check(&json!(long), &json!("y"))
            .unwrap_err();
        assert!(err.len() < 300);
        assert!(err.contains("..."));
    }

    proptest! {
        #[test]
        fn any_permutation_of_reference_matches(
            items in proptest::collection::vec("[a-z]{1,6}", 0..8),
            seed in any::<u64>(),
        ) {
            let reference: Vec<Value> = items.iter().map(|s| json!(s)).collect();
            let mut shuffled = reference.clone();
            let len = shuffled.len();
            if len > 1 {
                let mut state = seed;
                for i in (1..len).rev() {
                    state = state.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                    let j = (state >> 33) as usize % (i + 1);
                    shuffled.swap(i, j);
                }
            }
            prop_assert!(Comparison::default().matches(&Value::Array(shuffled), &Value::Array(reference)));
        }

        #[test]
        fn dropping_an_item_never_matches(
            items in proptest::collection::vec("[a-z]{1,6}", 1..8),
        ) {
            let reference: Vec<Value> = items.iter().map(|s| json!(s)).collect();
            let shorter = reference[1..].to_vec();
            prop_assert!(!Comparison::default().matches(&Value::Array(shorter), &Value::Array(reference)));
        }
    }
}
