//! Single-error analysis: one oracle judgment per failing record.
//!
//! Successful outputs for the same (dataset, example) are collected as
//! reference answers; each failing record is then analyzed concurrently,
//! throttled only by the oracle's global worker gate. A failed judgment is
//! recorded on the record (`inference_success == false`) — nothing here is
//! fatal.

use std::collections::HashMap;
use std::sync::Arc;

use futures::future::join_all;
use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde_json::json;
use tracing::{info, instrument};

use errata_oracle::Oracle;
use errata_shared::Record;

/// Analyze every failing record and return the enriched copies.
///
/// When `use_correct_refs` is set, each failing record's prompt also carries
/// one seeded-sampled correct output from another model on the same example.
#[instrument(skip_all, fields(records = records.len()))]
pub async fn analyze_single_errors(
    records: &[Record],
    oracle: Arc<dyn Oracle>,
    use_correct_refs: bool,
    seed: u64,
) -> Vec<Record> {
    // Reference outputs: everything that scored as a success.
    let mut success_outputs: HashMap<(&str, &str), Vec<&str>> = HashMap::new();
    for record in records.iter().filter(|record| !record.error) {
        success_outputs
            .entry((record.dataset.as_str(), record.example_id.as_str()))
            .or_default()
            .push(record.output_text.as_str());
    }

    let failures: Vec<&Record> = records.iter().filter(|record| record.error).collect();
    if failures.is_empty() {
        info!("no error records found");
        return Vec::new();
    }
    info!(errors = failures.len(), "analyzing error records");

    // Pick references up front so the sampling stays deterministic
    // regardless of task completion order.
    let mut rng = StdRng::seed_from_u64(seed);
    let references: Vec<Option<String>> = failures
        .iter()
        .map(|record| {
            if !use_correct_refs {
                return None;
            }
            success_outputs
                .get(&(record.dataset.as_str(), record.example_id.as_str()))
                .and_then(|outputs| outputs.choose(&mut rng))
                .map(|output| output.to_string())
        })
        .collect();

    let futures = failures
        .iter()
        .zip(references)
        .map(|(record, reference)| {
            let oracle = oracle.clone();
            async move {
                let vars = json!({
                    "input_text": record.input_text,
                    "output_text": record.output_text,
                    "correct_answer": record.correct_answer,
                    "correct_outputs": reference.map(|output| vec![output]),
                });
                let response = oracle
                    .infer("single_error_analysis", &vars, Some("single_error"))
                    .await;

                let mut analyzed = (*record).clone();
                analyzed.prompt = Some(response.prompt);
                analyzed.judge_model = Some(response.model);
                analyzed.judge_response = response.content;
                analyzed.template_used = Some(response.template);
                analyzed.inference_success = Some(response.success);
                analyzed
            }
        });

    join_all(futures).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use errata_oracle::MockOracle;
    use serde_json::Value;

    fn record(example_id: &str, model: &str, score: f64, error: bool) -> Record {
        Record {
            dataset: "bench".into(),
            example_id: example_id.into(),
            model: model.into(),
            input_text: "what is 2+2".into(),
            output_text: format!("answer from {model}"),
            score,
            error,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn analyzes_only_failures_and_keeps_order() {
        let oracle = Arc::new(MockOracle::new());
        let records = vec![
            record("e1", "m1", 0.0, true),
            record("e1", "m2", 1.0, false),
            record("e2", "m1", 0.0, true),
        ];

        let analyzed = analyze_single_errors(&records, oracle.clone(), true, 3).await;

        assert_eq!(analyzed.len(), 2);
        assert_eq!(analyzed[0].example_id, "e1");
        assert_eq!(analyzed[1].example_id, "e2");
        assert_eq!(oracle.calls(), 2);

        for record in &analyzed {
            assert_eq!(record.inference_success, Some(true));
            let judgment: Value =
                serde_json::from_str(record.judge_response.as_deref().unwrap()).unwrap();
            assert!(judgment.pointer("/final_answer/error_title").is_some());
        }
    }

    #[tokio::test]
    async fn failing_record_prompt_carries_a_reference_output() {
        let oracle = Arc::new(MockOracle::new());
        let records = vec![
            record("e1", "m1", 0.0, true),
            record("e1", "m2", 1.0, false),
        ];

        let analyzed = analyze_single_errors(&records, oracle, true, 3).await;
        assert!(
            analyzed[0]
                .prompt
                .as_deref()
                .unwrap()
                .contains("answer from m2")
        );
    }

    #[tokio::test]
    async fn no_failures_issues_no_calls() {
        let oracle = Arc::new(MockOracle::new());
        let records = vec![record("e1", "m1", 1.0, false)];

        let analyzed = analyze_single_errors(&records, oracle.clone(), true, 3).await;

        assert!(analyzed.is_empty());
        assert_eq!(oracle.calls(), 0);
    }
}
