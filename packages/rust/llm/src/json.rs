//! Pulling JSON out of model answers.

use serde_json::Value;

use html2doc_shared::{Html2DocError, Result};

/// Parse a model answer as JSON, tolerating a surrounding code fence.
pub fn extract_json(text: &str) -> Result<Value> {
    let cleaned = strip_code_fence(text);
    serde_json::from_str(cleaned).map_err(|e| {
        Html2DocError::malformed(format!("answer is not valid JSON: {e}: {}", excerpt(cleaned)))
    })
}

/// Parse a model answer expected to hold a list of objects.
///
/// Accepts a bare array, an object wrapping the array under `key`, or a
/// single object carrying one of `item_fields` (treated as a one-element
/// list). Any other object is malformed. A blank answer is an empty list.
pub fn extract_items(text: &str, key: &str, item_fields: &[&str]) -> Result<Vec<Value>> {
    if strip_code_fence(text).is_empty() {
        return Ok(Vec::new());
    }
    match extract_json(text)? {
        Value::Array(items) => Ok(items),
        Value::Object(mut map) => match map.remove(key) {
            Some(Value::Array(items)) => Ok(items),
            Some(other) => Err(Html2DocError::malformed(format!(
                "`{key}` should be an array, got {}",
                kind_of(&other)
            ))),
            None if item_fields.iter().any(|f| map.contains_key(*f)) => {
                Ok(vec![Value::Object(map)])
            }
            None => Err(Html2DocError::malformed(format!(
                "answer has no `{key}` array: {}",
                excerpt(&Value::Object(map).to_string())
            ))),
        },
        other => Err(Html2DocError::malformed(format!(
            "expected a JSON array or object, got {}",
            kind_of(&other)
        ))),
    }
}

fn strip_code_fence(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed;
    };
    let rest = rest
        .strip_prefix("json")
        .or_else(|| rest.strip_prefix("JSON"))
        .unwrap_or(rest);
    rest.trim_end()
        .strip_suffix("```")
        .unwrap_or(rest)
        .trim()
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

fn excerpt(text: &str) -> String {
    const MAX: usize = 120;
    match text.char_indices().nth(MAX) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_json_fence() {
        let value = extract_json("```json\n{\"a\": 1}\n```").unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn plain_json_passes_through() {
        assert_eq!(extract_json(" [1, 2] ").unwrap(), json!([1, 2]));
    }

    #[test]
    fn invalid_json_is_malformed() {
        let err = extract_json("Sure! Here are the units:").unwrap_err();
        assert!(!err.is_fatal());
    }

    #[test]
    fn items_from_wrapped_array() {
        let items =
            extract_items(r#"{"units": [{"title": "A"}, {"title": "B"}]}"#, "units", &["title"])
                .unwrap();
        assert_eq!(items.len(), 2);
    }

    #[test]
    fn single_object_is_one_item() {
        let items = extract_items(r#"{"title": "Only"}"#, "units", &["title"]).unwrap();
        assert_eq!(items, vec![json!({"title": "Only"})]);
    }

    #[test]
    fn object_without_key_or_item_fields_is_malformed() {
        let err = extract_items(r#"{"result": "none"}"#, "units", &["title", "name"]).unwrap_err();
        assert!(!err.is_fatal());
        assert!(err.to_string().contains("units"));
    }

    #[test]
    fn blank_answer_is_no_items() {
        assert!(extract_items("  ", "units", &["title"]).unwrap().is_empty());
        assert!(extract_items("```json\n```", "units", &["title"]).unwrap().is_empty());
    }

    #[test]
    fn wrong_shape_is_malformed() {
        assert!(extract_items("42", "units", &["title"]).is_err());
        assert!(extract_items(r#"{"units": "none"}"#, "units", &["title"]).is_err());
    }
}
