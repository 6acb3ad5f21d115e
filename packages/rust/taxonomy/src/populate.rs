//! Populator: merges classification judgments back onto the records.
//!
//! Resolves the authoritative category set from the construction rounds,
//! builds a description → category map from the classification rounds, and
//! annotates every record with its category. Anything the judgments fail to
//! cover degrades to the "Other" category with a warning — only a fully
//! unparseable construction history is fatal to the sub-problem.

use std::collections::HashMap;

use serde_json::Value;
use tracing::{info, warn};

use errata_shared::{Category, ErrataError, Record, Result};

use crate::classify::ClassifyRound;
use crate::construct::{
    ConstructRound, categories_from_taxonomy, extract_description, last_parseable_taxonomy,
};

/// Case/whitespace-insensitive normalization used for category matching.
fn norm(text: &str) -> String {
    text.trim().to_lowercase()
}

/// The authoritative category set for these rounds: the newest parseable
/// cluster list, with the implicit "Other" fallback appended (its
/// description is always empty, even if the oracle proposed its own).
fn resolve_categories(rounds: &[ConstructRound]) -> Result<Vec<Category>> {
    let (taxonomy, _) = last_parseable_taxonomy(rounds).ok_or_else(|| {
        ErrataError::data("no oracle judgment produced a parseable cluster list")
    })?;
    let mut categories = categories_from_taxonomy(&taxonomy);
    match categories.iter_mut().find(|c| c.name == "Other") {
        Some(other) => other.description.clear(),
        None => categories.push(Category::other()),
    }
    Ok(categories)
}

/// Build the description → category map from all classification rounds.
///
/// Last write wins on duplicate descriptions. Category names are matched
/// case/whitespace-insensitively against the known set; an unrecognized
/// name is redirected to "Other".
fn map_descriptions(rounds: &[ClassifyRound], categories: &[Category]) -> HashMap<String, String> {
    let known: HashMap<String, &str> = categories
        .iter()
        .map(|category| (norm(&category.name), category.name.as_str()))
        .collect();

    let mut mapping = HashMap::new();
    for round in rounds {
        let Some(raw) = round.judge_response.as_deref() else {
            continue;
        };
        let parsed: Value = match serde_json::from_str(raw) {
            Ok(parsed) => parsed,
            Err(e) => {
                warn!(error = %e, "failed to parse classification judgment, skipping round");
                continue;
            }
        };
        let Some(entries) = parsed.get("classified_errors").and_then(Value::as_array) else {
            warn!("classification judgment has no classified_errors, skipping round");
            continue;
        };

        for entry in entries {
            let text = entry
                .get("error_text")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            let category = entry
                .get("category")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or_default();
            if text.is_empty() || category.is_empty() {
                warn!(?entry, "classification entry missing error_text or category");
                continue;
            }

            let canonical = match known.get(&norm(category)) {
                Some(name) => name,
                None => {
                    warn!(
                        category,
                        error_text = text,
                        "category not in taxonomy, redirecting to 'Other'"
                    );
                    "Other"
                }
            };
            mapping.insert(text.to_string(), canonical.to_string());
        }
    }
    mapping
}

/// Rewrite categories whose record share falls below `rare_freq` to "Other"
/// with a cleared description. A threshold of 0 disables the collapse.
pub fn collapse_rare_categories(records: Vec<Record>, rare_freq: f64) -> Vec<Record> {
    if rare_freq <= 0.0 {
        return records;
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for record in &records {
        if let Some(category) = record.error_category.as_deref() {
            *counts.entry(category).or_default() += 1;
        }
    }
    let total: usize = counts.values().sum();
    if total == 0 {
        return records;
    }

    let rare: Vec<String> = counts
        .iter()
        .filter(|&(_, &count)| (count as f64 / total as f64) < rare_freq)
        .map(|(&category, _)| category.to_string())
        .collect();
    let collapsed = records
        .iter()
        .filter(|record| {
            record
                .error_category
                .as_deref()
                .is_some_and(|category| rare.iter().any(|r| r.as_str() == category))
        })
        .count();
    info!(
        rare_categories = rare.len(),
        records = collapsed,
        "collapsing rare categories into 'Other'"
    );

    records
        .into_iter()
        .map(|mut record| {
            if record
                .error_category
                .as_deref()
                .is_some_and(|category| rare.iter().any(|r| r.as_str() == category))
            {
                record.error_category = Some("Other".to_string());
                record.category_description = Some(String::new());
            }
            record
        })
        .collect()
}

/// Annotate every record with its error title, summary, and category.
///
/// Fatal only when the construction rounds contain no parseable cluster
/// list; everything else degrades to "Other".
pub fn populate_taxonomy(
    records: &[Record],
    construct_rounds: &[ConstructRound],
    classify_rounds: &[ClassifyRound],
    rare_freq: f64,
) -> Result<Vec<Record>> {
    info!("populating taxonomy onto records");

    let categories = resolve_categories(construct_rounds)?;
    let descriptions: HashMap<&str, &str> = categories
        .iter()
        .map(|category| (category.name.as_str(), category.description.as_str()))
        .collect();
    let mapping = map_descriptions(classify_rounds, &categories);

    let field = construct_rounds
        .first()
        .map_or("error_title", |round| round.field.as_str());

    let populated = records
        .iter()
        .map(|record| {
            let mut enriched = record.clone();
            enriched.error_title = extract_description(record, field);
            enriched.error_summary = extract_description(record, "error_summary");

            if let Some(title) = enriched.error_title.as_deref() {
                let category = match mapping.get(title) {
                    Some(category) => category.as_str(),
                    None => {
                        warn!(
                            error_title = title,
                            "no category assigned, falling back to 'Other'"
                        );
                        "Other"
                    }
                };
                enriched.error_category = Some(category.to_string());
                enriched.category_description =
                    Some(descriptions.get(category).copied().unwrap_or("").to_string());
            }
            enriched
        })
        .collect();

    Ok(collapse_rare_categories(populated, rare_freq))
}

#[cfg(test)]
mod tests {
    use super::*;
    use errata_shared::TaxonomyParams;
    use serde_json::json;

    fn analyzed_record(example_id: &str, title: &str) -> Record {
        Record {
            dataset: "gpqa".into(),
            example_id: example_id.into(),
            model: "m1".into(),
            score: 0.0,
            error: true,
            judge_response: Some(
                json!({"final_answer": {"error_title": title, "error_summary": format!("{title} summary")}})
                    .to_string(),
            ),
            ..Default::default()
        }
    }

    fn construct_round(judge_response: &str) -> ConstructRound {
        ConstructRound {
            num_errors: None,
            error_batch: None,
            judge_model: "judge".into(),
            judge_response: Some(judge_response.into()),
            field: "error_title".into(),
            prompt: String::new(),
            template_used: "taxonomy_review".into(),
            inference_success: true,
            params: TaxonomyParams::default(),
        }
    }

    fn classify_round(judge_response: &str) -> ClassifyRound {
        ClassifyRound {
            prompt: String::new(),
            judge_model: "judge".into(),
            judge_response: Some(judge_response.into()),
            template_used: "classify_errors".into(),
            inference_success: true,
            error: None,
        }
    }

    fn two_cluster_rounds() -> Vec<ConstructRound> {
        vec![construct_round(
            r#"{"clusters": [
                {"name": "Math", "description": "calculation mistakes"},
                {"name": "Logic", "description": "flawed reasoning"}
            ]}"#,
        )]
    }

    #[test]
    fn assigns_categories_from_classification() {
        let records = vec![analyzed_record("e1", "off by one"), analyzed_record("e2", "bad premise")];
        let classify = vec![classify_round(
            r#"{"classified_errors": [
                {"error_text": "off by one", "category": "Math"},
                {"error_text": "bad premise", "category": "Logic"}
            ]}"#,
        )];

        let populated =
            populate_taxonomy(&records, &two_cluster_rounds(), &classify, 0.0).unwrap();

        assert_eq!(populated[0].error_category.as_deref(), Some("Math"));
        assert_eq!(
            populated[0].category_description.as_deref(),
            Some("calculation mistakes")
        );
        assert_eq!(populated[0].error_title.as_deref(), Some("off by one"));
        assert_eq!(
            populated[0].error_summary.as_deref(),
            Some("off by one summary")
        );
        assert_eq!(populated[1].error_category.as_deref(), Some("Logic"));
    }

    #[test]
    fn category_matching_ignores_case_and_whitespace() {
        let records = vec![analyzed_record("e1", "off by one")];
        let classify = vec![classify_round(
            r#"{"classified_errors": [{"error_text": "off by one", "category": "  MATH "}]}"#,
        )];

        let populated =
            populate_taxonomy(&records, &two_cluster_rounds(), &classify, 0.0).unwrap();
        assert_eq!(populated[0].error_category.as_deref(), Some("Math"));
    }

    #[test]
    fn unknown_category_redirects_to_other() {
        let records = vec![analyzed_record("e1", "off by one")];
        let classify = vec![classify_round(
            r#"{"classified_errors": [{"error_text": "off by one", "category": "Hallucination"}]}"#,
        )];

        let populated =
            populate_taxonomy(&records, &two_cluster_rounds(), &classify, 0.0).unwrap();
        assert_eq!(populated[0].error_category.as_deref(), Some("Other"));
        assert_eq!(populated[0].category_description.as_deref(), Some(""));
    }

    #[test]
    fn unmapped_description_redirects_to_other() {
        let records = vec![analyzed_record("e1", "never classified")];
        let classify = vec![classify_round(r#"{"classified_errors": []}"#)];

        let populated =
            populate_taxonomy(&records, &two_cluster_rounds(), &classify, 0.0).unwrap();
        assert_eq!(populated[0].error_category.as_deref(), Some("Other"));
    }

    #[test]
    fn record_without_judgment_gets_no_category() {
        let mut record = analyzed_record("e1", "t");
        record.judge_response = None;
        let classify = vec![classify_round(r#"{"classified_errors": []}"#)];

        let populated =
            populate_taxonomy(&[record], &two_cluster_rounds(), &classify, 0.0).unwrap();
        assert!(populated[0].error_title.is_none());
        assert!(populated[0].error_category.is_none());
    }

    #[test]
    fn last_write_wins_on_duplicate_descriptions() {
        let records = vec![analyzed_record("e1", "off by one")];
        let classify = vec![
            classify_round(
                r#"{"classified_errors": [{"error_text": "off by one", "category": "Math"}]}"#,
            ),
            classify_round(
                r#"{"classified_errors": [{"error_text": "off by one", "category": "Logic"}]}"#,
            ),
        ];

        let populated =
            populate_taxonomy(&records, &two_cluster_rounds(), &classify, 0.0).unwrap();
        assert_eq!(populated[0].error_category.as_deref(), Some("Logic"));
    }

    #[test]
    fn unparseable_construction_history_is_fatal() {
        let records = vec![analyzed_record("e1", "t")];
        let rounds = vec![construct_round("mangled {{")];
        let classify = vec![classify_round(r#"{"classified_errors": []}"#)];

        let err = populate_taxonomy(&records, &rounds, &classify, 0.0).unwrap_err();
        assert!(err.to_string().contains("parseable"));
    }

    fn categorized(category: &str, n: usize) -> Vec<Record> {
        (0..n)
            .map(|i| Record {
                dataset: "d".into(),
                example_id: format!("{category}-{i}"),
                model: "m1".into(),
                error_category: Some(category.into()),
                category_description: Some(format!("{category} description")),
                ..Default::default()
            })
            .collect()
    }

    #[test]
    fn rare_collapse_renames_exactly_the_rare_categories() {
        let mut records = categorized("Common", 9);
        records.extend(categorized("Rare", 1));

        let collapsed = collapse_rare_categories(records, 0.2);

        let common = collapsed
            .iter()
            .filter(|r| r.error_category.as_deref() == Some("Common"))
            .count();
        let other: Vec<&Record> = collapsed
            .iter()
            .filter(|r| r.error_category.as_deref() == Some("Other"))
            .collect();
        assert_eq!(common, 9);
        assert_eq!(other.len(), 1);
        assert_eq!(other[0].category_description.as_deref(), Some(""));
        // The survivor keeps its description.
        assert!(
            collapsed
                .iter()
                .filter(|r| r.error_category.as_deref() == Some("Common"))
                .all(|r| r.category_description.as_deref() == Some("Common description"))
        );
    }

    #[test]
    fn rare_collapse_threshold_zero_is_a_no_op() {
        let mut records = categorized("Common", 99);
        records.extend(categorized("Tiny", 1));

        let collapsed = collapse_rare_categories(records.clone(), 0.0);
        let tiny = collapsed
            .iter()
            .filter(|r| r.error_category.as_deref() == Some("Tiny"))
            .count();
        assert_eq!(tiny, 1);
    }

    #[test]
    fn rare_collapse_boundary_share_survives() {
        // Exactly at the threshold is not "below" it.
        let mut records = categorized("Big", 8);
        records.extend(categorized("Edge", 2));

        let collapsed = collapse_rare_categories(records, 0.2);
        assert!(
            collapsed
                .iter()
                .any(|r| r.error_category.as_deref() == Some("Edge"))
        );
    }
}
