//! Offline judge for smoke runs and tests.
//!
//! Answers every template with a deterministic, schema-valid canned judgment
//! so the full pipeline can run without network access. Prompts are still
//! rendered, so round records look the same as in live runs.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::client::{Oracle, OracleResponse};
use crate::prompts::PromptLibrary;

/// Canned cluster name emitted by the offline judge.
const MOCK_CLUSTER: &str = "General Failure";

/// Deterministic offline implementation of [`Oracle`].
pub struct MockOracle {
    model: String,
    prompts: PromptLibrary,
    calls: AtomicU64,
}

impl MockOracle {
    pub fn new() -> Self {
        Self {
            model: "offline-judge".into(),
            prompts: PromptLibrary::new(),
            calls: AtomicU64::new(0),
        }
    }

    /// Canned judgment text per template.
    fn canned_content(&self, template_name: &str, vars: &Value) -> String {
        match template_name {
            "single_error_analysis" => {
                let output = vars
                    .get("output_text")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                json!({
                    "final_answer": {
                        "error_title": format!("Incorrect answer: {}", head(output, 6)),
                        "error_summary": format!(
                            "The model produced \"{}\", which does not satisfy the task.",
                            head(output, 20)
                        ),
                    }
                })
                .to_string()
            }
            "taxonomy_generation" | "taxonomy_update" | "taxonomy_review" => json!({
                "clusters": [{
                    "name": MOCK_CLUSTER,
                    "description": "All failures, grouped by the offline judge",
                }]
            })
            .to_string(),
            "classify_errors" => {
                let category = vars
                    .pointer("/taxonomy/clusters/0/name")
                    .and_then(Value::as_str)
                    .unwrap_or("Other");
                let classified: Vec<Value> = vars
                    .get("data")
                    .and_then(Value::as_array)
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(Value::as_str)
                            .map(|text| json!({"error_text": text, "category": category}))
                            .collect()
                    })
                    .unwrap_or_default();
                json!({ "classified_errors": classified }).to_string()
            }
            _ => json!({}).to_string(),
        }
    }
}

impl Default for MockOracle {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Oracle for MockOracle {
    async fn infer(
        &self,
        template_name: &str,
        vars: &Value,
        _schema_name: Option<&str>,
    ) -> OracleResponse {
        self.calls.fetch_add(1, Ordering::Relaxed);
        let prompt = self
            .prompts
            .render(template_name, vars)
            .unwrap_or_default();

        OracleResponse {
            model: self.model.clone(),
            prompt,
            template: template_name.to_string(),
            success: true,
            content: Some(self.canned_content(template_name, vars)),
            full_response: None,
            error: None,
        }
    }

    fn model_name(&self) -> &str {
        &self.model
    }

    fn calls(&self) -> u64 {
        self.calls.load(Ordering::Relaxed)
    }
}

/// First `n` whitespace-separated words of `text`.
fn head(text: &str, n: usize) -> String {
    text.split_whitespace().take(n).collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn analysis_judgment_is_deterministic() {
        let oracle = MockOracle::new();
        let vars = json!({"input_text": "2+2?", "output_text": "5", "correct_answer": "4"});
        let first = oracle
            .infer("single_error_analysis", &vars, Some("single_error"))
            .await;
        let second = oracle
            .infer("single_error_analysis", &vars, Some("single_error"))
            .await;

        assert!(first.success);
        assert_eq!(first.content, second.content);
        assert_eq!(oracle.calls(), 2);

        let parsed: Value = serde_json::from_str(first.content.as_deref().unwrap()).unwrap();
        assert!(
            parsed
                .pointer("/final_answer/error_title")
                .unwrap()
                .as_str()
                .unwrap()
                .contains('5')
        );
    }

    #[tokio::test]
    async fn generation_emits_parseable_clusters() {
        let oracle = MockOracle::new();
        let vars = json!({"data_type": "error_title", "data": [["x", 1]],
            "max_num_clusters": 5, "cluster_name_length": 5, "cluster_description_length": 30});
        let response = oracle
            .infer("taxonomy_generation", &vars, Some("generate_taxonomy"))
            .await;

        let parsed: Value = serde_json::from_str(response.content.as_deref().unwrap()).unwrap();
        assert_eq!(
            parsed.pointer("/clusters/0/name").unwrap().as_str().unwrap(),
            MOCK_CLUSTER
        );
    }

    #[tokio::test]
    async fn classification_assigns_first_cluster() {
        let oracle = MockOracle::new();
        let vars = json!({
            "data_type": "error_title",
            "data": ["Slip A", "Slip B"],
            "taxonomy": {"clusters": [{"name": "Math", "description": "d"}]},
        });
        let response = oracle
            .infer("classify_errors", &vars, Some("classify_errors"))
            .await;

        let parsed: Value = serde_json::from_str(response.content.as_deref().unwrap()).unwrap();
        let classified = parsed["classified_errors"].as_array().unwrap();
        assert_eq!(classified.len(), 2);
        assert!(classified.iter().all(|c| c["category"] == "Math"));
    }
}
