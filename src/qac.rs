//! Reply model of the QAC completion API.

use crate::EntityIndex;
use crate::mentions::wikify_completion;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Completion entries are kept as raw objects so fields this front-end does
/// not interpret (`matched_alias`, scores, ...) reach the browser untouched.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct QacResponse {
    #[serde(alias = "completions")]
    pub results: Vec<Map<String, Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QacPayload {
    pub results: Vec<Map<String, Value>>,
    pub timestamp: Option<String>,
}

fn completion_of(entry: &Map<String, Value>) -> &str {
    entry
        .get("completion")
        .and_then(Value::as_str)
        .unwrap_or_default()
}

fn qids_of(entry: &Map<String, Value>) -> Vec<String> {
    match entry.get("qids") {
        Some(Value::Array(items)) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => s.clone(),
                Value::Null => String::new(),
                other => other.to_string(),
            })
            .collect(),
        Some(Value::String(joined)) => joined.split(',').map(str::to_string).collect(),
        _ => Vec::new(),
    }
}

/// Adds `wikified_completion` and `urls` to every completion entry.
pub fn augment_results(index: &EntityIndex, response: QacResponse) -> Vec<Map<String, Value>> {
    response
        .results
        .into_iter()
        .map(|mut entry| {
            let qids = qids_of(&entry);
            let wikified = wikify_completion(index, completion_of(&entry), &qids);
            entry.insert(
                "wikified_completion".to_string(),
                Value::String(wikified.text),
            );
            entry.insert(
                "urls".to_string(),
                Value::Array(wikified.urls.into_iter().map(Value::String).collect()),
            );
            entry
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::WikiInfo;
    use serde_json::json;

    fn index() -> EntityIndex {
        EntityIndex::new(
            vec![("Q1".to_string(), WikiInfo::new("Bar Film", "", ""))],
            Vec::new(),
        )
    }

    #[test]
    fn accepts_results_and_completions_keys() {
        let current: QacResponse =
            serde_json::from_value(json!({"results": [{"completion": "a"}]})).unwrap();
        let legacy: QacResponse =
            serde_json::from_value(json!({"completions": [{"completion": "b"}]})).unwrap();
        assert_eq!(current.results.len(), 1);
        assert_eq!(legacy.results[0]["completion"], "b");
    }

    #[test]
    fn entries_gain_wikified_completion_and_urls() {
        let response: QacResponse = serde_json::from_value(json!({
            "results": [
                {"completion": "who directed [Q1] ", "qids": ["Q1"], "matched_alias": ""},
                {"completion": "who wrote [Q2] ", "qids": ["Q2"]}
            ]
        }))
        .unwrap();
        let results = augment_results(&index(), response);
        assert_eq!(
            results[0]["wikified_completion"],
            "who directed [Bar Film] "
        );
        assert_eq!(
            results[0]["urls"],
            json!(["https://en.wikipedia.org/wiki/Bar_Film"])
        );
        assert_eq!(results[0]["matched_alias"], "");
        assert_eq!(results[1]["wikified_completion"], "who wrote [Q2] ");
        assert_eq!(results[1]["urls"], json!([]));
    }

    #[test]
    fn entry_without_qids_is_passed_through() {
        let response: QacResponse =
            serde_json::from_value(json!({"results": [{"completion": "how many"}]})).unwrap();
        let results = augment_results(&index(), response);
        assert_eq!(results[0]["completion"], "how many");
        assert_eq!(results[0]["wikified_completion"], "how many");
    }

    #[test]
    fn comma_joined_qids_are_accepted() {
        let response: QacResponse = serde_json::from_value(json!({
            "results": [{"completion": "[x] and [y]", "qids": "Q9,Q1"}]
        }))
        .unwrap();
        let results = augment_results(&index(), response);
        assert_eq!(results[0]["wikified_completion"], "[x] and [Bar Film]");
    }
}
