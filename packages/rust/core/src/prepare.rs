//! Data preparation: dataset ingestion, error flagging, and failure sampling.
//!
//! Loads one CSV per dataset, decides per record whether it counts as an
//! error (score below the dataset's success threshold), and samples a
//! fraction of the failures per (model, dataset) group for analysis.
//! Successes are kept in full — later stages use them as reference outputs.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use rand::SeedableRng;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use tokio::task::spawn_blocking;
use tracing::{info, instrument, warn};

use errata_shared::{AppConfig, ErrataError, Record, Result};

/// Columns every dataset file must provide.
const REQUIRED_COLUMNS: &[&str] = &["example_id", "model", "input_text", "output_text", "score"];

/// Pinned cache column order for the prepared table; downstream consumers
/// rely on this layout.
pub const PREPARE_COLUMNS: &[&str] = &[
    "example_id",
    "model",
    "input_text",
    "output_text",
    "score",
    "correct_answer",
    "candidate_answers",
    "dataset",
    "error",
];

/// When a dataset has no configured threshold, a success is anything scoring
/// at least this fraction of the dataset's mean score.
const DEFAULT_THRESHOLD_FRACTION: f64 = 0.7;

/// Load, flag, filter, and sample the configured datasets.
///
/// `models`, when given, limits whose failures are analyzed — failing
/// records from other models are dropped, their successes kept.
#[instrument(skip_all, fields(ratio = ratio, seed = seed))]
pub async fn prepare_data(
    config: &AppConfig,
    datasets: &[String],
    models: Option<&[String]>,
    ratio: f64,
    seed: u64,
) -> Result<Vec<Record>> {
    let data_dir = PathBuf::from(&config.defaults.data_dir);
    let datasets = resolve_datasets(&data_dir, datasets)?;
    info!(datasets = datasets.len(), "loading data");

    let mut records: Vec<Record> = Vec::new();
    for dataset in &datasets {
        let path = data_dir.join(format!("{dataset}.csv"));
        let dataset = dataset.clone();
        let loaded = spawn_blocking(move || load_dataset(&path, &dataset))
            .await
            .map_err(|e| ErrataError::data(format!("dataset load task failed: {e}")))??;
        records.extend(loaded);
    }

    // Data-driven default threshold per dataset, overridable from config.
    let thresholds = derive_thresholds(config, &records);

    for record in &mut records {
        let threshold = thresholds.get(&record.dataset).copied().unwrap_or(0.7);
        record.error = record.score < threshold;
    }

    // Keep every success; keep failures only for the models under analysis.
    if let Some(models) = models {
        records.retain(|record| !record.error || models.iter().any(|m| *m == record.model));
    }

    let (failures, successes): (Vec<Record>, Vec<Record>) =
        records.into_iter().partition(|record| record.error);

    let sampled = sample_failures(failures, ratio, seed);
    info!(
        sampled = sampled.len(),
        successes = successes.len(),
        ratio,
        "sampled failures for analysis"
    );

    let mut prepared = sampled;
    prepared.extend(successes);
    Ok(prepared)
}

/// Explicit dataset list, or every `*.csv` under the data directory.
fn resolve_datasets(data_dir: &Path, datasets: &[String]) -> Result<Vec<String>> {
    if !datasets.is_empty() {
        return Ok(datasets.to_vec());
    }

    let entries =
        std::fs::read_dir(data_dir).map_err(|e| ErrataError::io(data_dir, e))?;
    let mut discovered: Vec<String> = entries
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| {
            let path = entry.path();
            if path.extension().is_some_and(|ext| ext == "csv") {
                path.file_stem().map(|stem| stem.to_string_lossy().into_owned())
            } else {
                None
            }
        })
        .collect();
    discovered.sort();

    if discovered.is_empty() {
        return Err(ErrataError::data(format!(
            "no dataset files found under {}",
            data_dir.display()
        )));
    }
    Ok(discovered)
}

/// Read one dataset CSV into records. A missing file is skipped with a
/// warning; a malformed file is an error.
fn load_dataset(path: &Path, dataset: &str) -> Result<Vec<Record>> {
    if !path.exists() {
        warn!(dataset, ?path, "dataset file not found, skipping");
        return Ok(Vec::new());
    }

    let mut reader = csv::Reader::from_path(path)
        .map_err(|e| ErrataError::data(format!("{dataset}: {e}")))?;
    let headers = reader
        .headers()
        .map_err(|e| ErrataError::data(format!("{dataset}: {e}")))?
        .clone();

    let missing: Vec<&str> = REQUIRED_COLUMNS
        .iter()
        .copied()
        .filter(|column| !headers.iter().any(|header| header == *column))
        .collect();
    if !missing.is_empty() {
        return Err(ErrataError::data(format!(
            "dataset '{dataset}.csv' is missing required columns: {missing:?}"
        )));
    }

    let column =
        |name: &str| -> usize { headers.iter().position(|header| header == name).unwrap_or(0) };
    let example_id_col = column("example_id");
    let model_col = column("model");
    let input_col = column("input_text");
    let output_col = column("output_text");
    let score_col = column("score");
    let correct_col = headers.iter().position(|header| header == "correct_answer");

    let mut records = Vec::new();
    for (i, result) in reader.records().enumerate() {
        let row = result.map_err(|e| ErrataError::data(format!("{dataset} row {i}: {e}")))?;
        let cell = |index: usize| row.get(index).unwrap_or_default().to_string();

        let score: f64 = cell(score_col).trim().parse().map_err(|_| {
            ErrataError::data(format!(
                "dataset '{dataset}.csv' row {i}: non-numeric score '{}'",
                cell(score_col)
            ))
        })?;

        let mut record = Record {
            dataset: dataset.to_string(),
            example_id: cell(example_id_col),
            model: cell(model_col),
            input_text: cell(input_col),
            output_text: cell(output_col),
            score,
            correct_answer: correct_col.map(cell),
            ..Default::default()
        };

        // Unmapped columns ride along for the final leaf export.
        for (j, header) in headers.iter().enumerate() {
            let known = REQUIRED_COLUMNS.contains(&header) || header == "correct_answer";
            if !known {
                record
                    .extra
                    .insert(header.to_string(), serde_json::Value::String(cell(j)));
            }
        }
        records.push(record);
    }

    info!(dataset, records = records.len(), "loaded dataset");
    Ok(records)
}

/// Per-dataset success thresholds: configured value, else a fraction of the
/// dataset's mean score (rounded to two decimals).
fn derive_thresholds(config: &AppConfig, records: &[Record]) -> HashMap<String, f64> {
    let mut sums: HashMap<String, (f64, usize)> = HashMap::new();
    for record in records {
        let entry = sums.entry(record.dataset.clone()).or_insert((0.0, 0));
        entry.0 += record.score;
        entry.1 += 1;
    }

    sums.into_iter()
        .map(|(dataset, (sum, count))| {
            let threshold = config.success_threshold(&dataset).unwrap_or_else(|| {
                let mean = sum / count.max(1) as f64;
                (mean * DEFAULT_THRESHOLD_FRACTION * 100.0).round() / 100.0
            });
            (dataset, threshold)
        })
        .collect()
}

/// Sample failures per (model, dataset) group at `ratio`, seeded.
fn sample_failures(failures: Vec<Record>, ratio: f64, seed: u64) -> Vec<Record> {
    if failures.is_empty() {
        return failures;
    }

    let mut groups: BTreeMap<(String, String), Vec<Record>> = BTreeMap::new();
    for record in failures {
        groups
            .entry((record.model.clone(), record.dataset.clone()))
            .or_default()
            .push(record);
    }

    let mut rng = StdRng::seed_from_u64(seed);
    let mut sampled = Vec::new();
    for (_, mut group) in groups {
        let take = ((group.len() as f64) * ratio).round() as usize;
        group.shuffle(&mut rng);
        sampled.extend(group.into_iter().take(take));
    }
    sampled
}
