//! Cluster constructor: builds a category set from a batch of error
//! descriptions through iterative generate/update/review oracle rounds.
//!
//! Every oracle interaction is recorded as a [`ConstructRound`]; consumers
//! pick the effective taxonomy with [`last_parseable_taxonomy`], which scans
//! the rounds from newest to oldest and uses the first judgment that parses
//! as a cluster list. The scan is a deliberate fallback for flaky judges: a
//! malformed review round degrades to the last good update round instead of
//! failing the sub-problem outright.

use std::collections::HashMap;

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use serde::Serialize;
use serde_json::{Value, json};
use tracing::{debug, info, warn};

use errata_oracle::{Oracle, OracleResponse};
use errata_shared::{Category, Record, TaxonomyParams};

/// One recorded oracle round during cluster construction.
#[derive(Debug, Clone, Serialize)]
pub struct ConstructRound {
    /// Number of descriptions in this round's batch (absent for review).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_errors: Option<usize>,
    /// The (description, frequency) batch sent (absent for review).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_batch: Option<Vec<(String, usize)>>,
    pub judge_model: String,
    pub judge_response: Option<String>,
    /// Which record field the descriptions came from.
    pub field: String,
    pub prompt: String,
    pub template_used: String,
    pub inference_success: bool,
    /// Effective params for this construction pass.
    pub params: TaxonomyParams,
}

/// Pull a description field out of a record's judgment.
///
/// The analysis stage stores raw judgment text on the record; the useful
/// fields live under `final_answer`. Unparseable or empty judgments yield
/// `None` and the record simply contributes nothing.
pub fn extract_description(record: &Record, field: &str) -> Option<String> {
    let raw = record.judge_response.as_deref()?;
    let parsed: Value = serde_json::from_str(raw).ok()?;
    let text = parsed.pointer(&format!("/final_answer/{field}"))?.as_str()?;
    if text.is_empty() {
        None
    } else {
        Some(text.to_string())
    }
}

/// Deduplicate descriptions into (text, frequency) pairs, preserving
/// first-occurrence order.
fn description_counts(descriptions: Vec<String>) -> Vec<(String, usize)> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut counts: Vec<(String, usize)> = Vec::new();
    for description in descriptions {
        match index.get(&description) {
            Some(&i) => counts[i].1 += 1,
            None => {
                index.insert(description.clone(), counts.len());
                counts.push((description, 1));
            }
        }
    }
    counts
}

/// Base template variables shared by every construction round.
fn base_vars(params: &TaxonomyParams, field: &str) -> Value {
    let mut vars = serde_json::to_value(params).unwrap_or_else(|_| json!({}));
    vars["data_type"] = json!(field);
    vars
}

/// Run the iterative generate/update/review loop over the records'
/// description field and record every round.
///
/// Returns an empty list when no record carries a parseable description.
/// Oracle failures are recorded in the rounds (`inference_success == false`),
/// not raised — whether the accumulated rounds are usable is decided by the
/// consumer via [`last_parseable_taxonomy`].
pub async fn construct_taxonomy(
    records: &[Record],
    oracle: &dyn Oracle,
    params: &TaxonomyParams,
    field: &str,
    seed: u64,
) -> Vec<ConstructRound> {
    info!(records = records.len(), field, "constructing taxonomy");

    let mut rng = StdRng::seed_from_u64(seed);

    // Shuffle before batching so each batch sees a varied slice of the data.
    let mut shuffled: Vec<&Record> = records.iter().collect();
    shuffled.shuffle(&mut rng);

    let descriptions: Vec<String> = shuffled
        .iter()
        .filter_map(|record| extract_description(record, field))
        .collect();
    let counts = description_counts(descriptions);

    if counts.is_empty() {
        info!(field, "no descriptions found, nothing to cluster");
        return Vec::new();
    }

    let batch_size = params.batch_size.max(1);
    let batches: Vec<Vec<(String, usize)>> = if params.update_repeat > 0 {
        // Re-sample the pool repeatedly instead of one sequential pass.
        (0..=params.update_repeat)
            .map(|_| {
                counts
                    .choose_multiple(&mut rng, batch_size.min(counts.len()))
                    .cloned()
                    .collect()
            })
            .collect()
    } else {
        counts.chunks(batch_size).map(<[_]>::to_vec).collect()
    };

    let mut rounds: Vec<ConstructRound> = Vec::new();
    let mut last: Option<OracleResponse> = None;

    for (i, batch) in batches.iter().enumerate() {
        let response = if i == 0 {
            let mut vars = base_vars(params, field);
            vars["data"] = json!(batch);
            oracle
                .infer("taxonomy_generation", &vars, Some("generate_taxonomy"))
                .await
        } else {
            match last.as_ref().and_then(|response| response.content.clone()) {
                Some(cluster_list) if !cluster_list.is_empty() => {
                    let mut vars = base_vars(params, field);
                    vars["data"] = json!(batch);
                    vars["cluster_list"] = json!(cluster_list);
                    oracle
                        .infer("taxonomy_update", &vars, Some("update_taxonomy"))
                        .await
                }
                // The previous round yielded nothing to update; carry it
                // forward so the failure stays visible in the round log.
                _ => last.clone().expect("previous round exists after i > 0"),
            }
        };

        debug!(round = i, success = response.success, "construction round");
        rounds.push(ConstructRound {
            num_errors: Some(batch.len()),
            error_batch: Some(batch.clone()),
            judge_model: response.model.clone(),
            judge_response: response.content.clone(),
            field: field.to_string(),
            prompt: response.prompt.clone(),
            template_used: response.template.clone(),
            inference_success: response.success,
            params: params.clone(),
        });
        last = Some(response);
    }

    // Final review pass condenses the accumulated list into the taxonomy
    // used downstream.
    let mut vars = base_vars(params, field);
    vars["cluster_list"] = json!(
        last.as_ref()
            .and_then(|response| response.content.clone())
            .unwrap_or_default()
    );
    let response = oracle
        .infer("taxonomy_review", &vars, Some("review_taxonomy"))
        .await;

    rounds.push(ConstructRound {
        num_errors: None,
        error_batch: None,
        judge_model: response.model,
        judge_response: response.content,
        field: field.to_string(),
        prompt: response.prompt,
        template_used: response.template,
        inference_success: response.success,
        params: params.clone(),
    });

    rounds
}

/// Backward scan: newest round whose judgment parses as a cluster list.
///
/// Returns the parsed taxonomy and the index of the round it came from.
/// Falling back past the review round is logged — it usually means the
/// final condensation was malformed and an earlier, rougher cluster list is
/// being used instead.
pub fn last_parseable_taxonomy(rounds: &[ConstructRound]) -> Option<(Value, usize)> {
    for (i, round) in rounds.iter().enumerate().rev() {
        let Some(raw) = round.judge_response.as_deref() else {
            continue;
        };
        let Ok(value) = serde_json::from_str::<Value>(raw) else {
            continue;
        };
        if value.get("clusters").is_some_and(Value::is_array) {
            if i + 1 == rounds.len() {
                debug!(round = i, "using reviewed taxonomy");
            } else {
                warn!(
                    round = i,
                    total = rounds.len(),
                    "reviewed taxonomy unparseable, falling back to an earlier round"
                );
            }
            return Some((value, i));
        }
    }
    None
}

/// The categories named by a parsed taxonomy. Entries missing a name or
/// description are skipped.
pub fn categories_from_taxonomy(taxonomy: &Value) -> Vec<Category> {
    taxonomy
        .get("clusters")
        .and_then(Value::as_array)
        .map(|clusters| {
            clusters
                .iter()
                .filter_map(|cluster| {
                    let name = cluster.get("name")?.as_str()?;
                    let description = cluster.get("description")?.as_str()?;
                    Some(Category::new(name, description))
                })
                .collect()
        })
        .unwrap_or_default()
}
