//! Classifier: assigns each distinct error description to one known category.
//!
//! Distinct descriptions are batched and every batch goes to the oracle
//! concurrently — batches are independent, so there is no ordering
//! dependency between them. The global worker gate inside the oracle client
//! is the only throttle.

use std::collections::HashSet;

use futures::future::join_all;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::info;

use errata_oracle::Oracle;
use errata_shared::Record;

use crate::construct::extract_description;

/// One recorded classification batch.
#[derive(Debug, Clone, Serialize)]
pub struct ClassifyRound {
    pub prompt: String,
    pub judge_model: String,
    /// Raw judgment text; expected shape
    /// `{"classified_errors": [{"error_text", "category"}]}`.
    pub judge_response: Option<String>,
    pub template_used: String,
    pub inference_success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Classify the records' distinct descriptions against `taxonomy`.
///
/// Returns one round per batch. A failed batch produces a round with
/// `inference_success == false`; its descriptions simply stay unmapped and
/// fall back to "Other" at population time.
pub async fn classify_errors(
    records: &[Record],
    taxonomy: &Value,
    oracle: &dyn Oracle,
    batch_size: usize,
    field: &str,
) -> Vec<ClassifyRound> {
    info!(records = records.len(), "classifying errors against taxonomy");

    // Distinct descriptions, first-occurrence order.
    let mut seen = HashSet::new();
    let descriptions: Vec<String> = records
        .iter()
        .filter_map(|record| extract_description(record, field))
        .filter(|description| seen.insert(description.clone()))
        .collect();

    let batch_size = batch_size.max(1);
    let futures = descriptions.chunks(batch_size).map(|batch| async move {
        let vars = json!({
            "data_type": field,
            "data": batch,
            "taxonomy": taxonomy,
        });
        let response = oracle
            .infer("classify_errors", &vars, Some("classify_errors"))
            .await;
        ClassifyRound {
            prompt: response.prompt,
            judge_model: response.model,
            judge_response: response.content,
            template_used: response.template,
            inference_success: response.success,
            error: response.error,
        }
    });

    join_all(futures).await
}
