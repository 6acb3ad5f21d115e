//! End-to-end analysis pipeline: prepare → analyze → build taxonomy.
//!
//! The three top-level stages are individually cached by experiment id, with
//! the cache wired in explicitly here — stages themselves know nothing about
//! caching. Inner recursive sub-problems are never cached; a taxonomy cache
//! hit replays the whole recursive computation from its persisted leaf table.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{info, instrument, warn};

use errata_oracle::Oracle;
use errata_shared::{AppConfig, ErrataError, ExperimentId, Record, Result, Row};
use errata_taxonomy::TaxonomyBuilder;

use crate::cache::StageCache;
use crate::prepare::{PREPARE_COLUMNS, prepare_data};
use crate::progress::Progress;
use crate::single_error::analyze_single_errors;

/// Stage names used as cache keys and artifact prefixes.
const STAGE_PREPARE: &str = "data_preparation";
const STAGE_SINGLE_ERROR: &str = "single_error";
const STAGE_TAXONOMY: &str = "build_taxonomy";

/// Per-run options, merged from config defaults and CLI flags.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub exp_id: ExperimentId,
    /// Datasets to analyze; empty means every CSV under the data directory.
    pub datasets: Vec<String>,
    /// When set, only these models' failures are analyzed.
    pub models: Option<Vec<String>>,
    /// Fraction of failures sampled for analysis.
    pub ratio: f64,
    pub seed: u64,
    pub max_depth: usize,
    pub rare_freq: f64,
    /// Extra input columns to carry into the leaf export.
    pub extra_columns: Vec<String>,
    /// Include a correct output from another model in analysis prompts.
    pub use_correct_refs: bool,
}

impl RunOptions {
    /// Options seeded from config defaults, with a fresh experiment id.
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            exp_id: ExperimentId::generate(),
            datasets: Vec::new(),
            models: None,
            ratio: config.defaults.ratio,
            seed: config.defaults.seed,
            max_depth: config.defaults.max_depth,
            rare_freq: config.defaults.rare_freq,
            extra_columns: Vec::new(),
            use_correct_refs: true,
        }
    }
}

/// Result of one completed run.
#[derive(Debug)]
pub struct RunOutcome {
    pub exp_id: ExperimentId,
    pub total_records: usize,
    pub error_records: usize,
    pub completed_at: DateTime<Utc>,
    /// Flattened leaf rows of the final taxonomy.
    pub leaves: Vec<Row>,
}

/// The pipeline runner.
pub struct Errata {
    config: AppConfig,
    options: RunOptions,
    oracle: Arc<dyn Oracle>,
    cache: StageCache,
    output_dir: PathBuf,
}

impl Errata {
    /// Wire up a run: create the output directory, persist the run
    /// parameters, and attach the stage cache.
    pub fn new(config: AppConfig, options: RunOptions, oracle: Arc<dyn Oracle>) -> Result<Self> {
        let output_dir = PathBuf::from(&config.defaults.output_dir);
        std::fs::create_dir_all(&output_dir).map_err(|e| ErrataError::io(&output_dir, e))?;

        let runner = Self {
            cache: StageCache::new(&output_dir),
            output_dir,
            config,
            options,
            oracle,
        };
        runner.write_run_params()?;
        Ok(runner)
    }

    /// Run the full pipeline.
    #[instrument(skip_all, fields(exp_id = %self.options.exp_id))]
    pub async fn run(&self, progress: &dyn Progress) -> Result<RunOutcome> {
        info!(exp_id = %self.options.exp_id, "running error analysis");

        // --- Stage 1: data preparation ---
        progress.phase("Preparing data");
        let data = match self.load_cached_records(STAGE_PREPARE) {
            Some(records) => records,
            None => {
                let records = prepare_data(
                    &self.config,
                    &self.options.datasets,
                    self.options.models.as_deref(),
                    self.options.ratio,
                    self.options.seed,
                )
                .await?;
                self.store_records(STAGE_PREPARE, &records, PREPARE_COLUMNS);
                records
            }
        };
        info!(records = data.len(), "prepared records");

        // --- Stage 2: single-error analysis ---
        let error_count = data.iter().filter(|record| record.error).count();
        let analyzed = if error_count == 0 {
            info!("no errors to analyze");
            Vec::new()
        } else {
            progress.phase("Analyzing errors");
            match self.load_cached_records(STAGE_SINGLE_ERROR) {
                Some(records) => records,
                None => {
                    let records = analyze_single_errors(
                        &data,
                        self.oracle.clone(),
                        self.options.use_correct_refs,
                        self.options.seed,
                    )
                    .await;
                    self.store_records(STAGE_SINGLE_ERROR, &records, &[]);
                    records
                }
            }
        };

        // --- Stage 3: recursive taxonomy build ---
        let leaves = if analyzed.is_empty() {
            info!("no errors to build taxonomy");
            Vec::new()
        } else {
            progress.phase("Building taxonomy");
            match self.cache.load(STAGE_TAXONOMY, &self.options.exp_id) {
                Some(rows) => rows,
                None => {
                    let builder = Arc::new(TaxonomyBuilder::new(
                        self.oracle.clone(),
                        self.config.taxonomy.clone(),
                        self.options.seed,
                        self.options.max_depth,
                        self.options.rare_freq,
                        self.options.extra_columns.clone(),
                    ));
                    let output = builder.build(analyzed.clone()).await;
                    self.write_tree(&output.tree);
                    self.cache
                        .store(STAGE_TAXONOMY, &self.options.exp_id, &output.leaves, &[]);
                    output.leaves
                }
            }
        };

        let outcome = RunOutcome {
            exp_id: self.options.exp_id.clone(),
            total_records: data.len(),
            error_records: analyzed.len(),
            completed_at: Utc::now(),
            leaves,
        };
        progress.done(&outcome);
        info!(
            total = outcome.total_records,
            errors = outcome.error_records,
            "run complete"
        );
        Ok(outcome)
    }

    /// Cached stage table as records; any unconvertible row voids the hit.
    fn load_cached_records(&self, stage: &str) -> Option<Vec<Record>> {
        let rows = self.cache.load(stage, &self.options.exp_id)?;
        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            match Record::from_row(row) {
                Ok(record) => records.push(record),
                Err(e) => {
                    warn!(stage, error = %e, "cached row unusable, regenerating stage");
                    return None;
                }
            }
        }
        Some(records)
    }

    fn store_records(&self, stage: &str, records: &[Record], preferred_columns: &[&str]) {
        let rows: Vec<Row> = records.iter().map(Record::to_row).collect();
        self.cache
            .store(stage, &self.options.exp_id, &rows, preferred_columns);
    }

    /// Persist the full tree document next to the stage tables. Best effort.
    fn write_tree(&self, tree: &serde_json::Value) {
        let path = self.output_dir.join(format!(
            "exp_name={STAGE_TAXONOMY}__exp_id={}.json",
            self.options.exp_id
        ));
        let rendered = match serde_json::to_string_pretty(tree) {
            Ok(rendered) => rendered,
            Err(e) => {
                warn!(error = %e, "failed to serialize taxonomy tree");
                return;
            }
        };
        if let Err(e) = std::fs::write(&path, rendered) {
            warn!(?path, error = %e, "failed to write taxonomy tree");
        }
    }

    /// Record the run parameters for reproducibility.
    fn write_run_params(&self) -> Result<()> {
        let params = json!({
            "exp_id": self.options.exp_id,
            "data_dir": self.config.defaults.data_dir,
            "output_dir": self.config.defaults.output_dir,
            "datasets": self.options.datasets,
            "models": self.options.models,
            "ratio": self.options.ratio,
            "seed": self.options.seed,
            "max_depth": self.options.max_depth,
            "rare_freq": self.options.rare_freq,
            "judge": self.oracle.model_name(),
            "max_workers": self.config.oracle.max_workers,
            "use_correct_refs": self.options.use_correct_refs,
        });
        let path = self
            .output_dir
            .join(format!("config__exp_id={}.json", self.options.exp_id));
        let rendered = serde_json::to_string_pretty(&params)
            .map_err(|e| ErrataError::config(e.to_string()))?;
        std::fs::write(&path, rendered).map_err(|e| ErrataError::io(&path, e))
    }
}
