//! Core domain types for Errata experiments.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{ErrataError, Result};

/// A flat JSON object row — the interchange shape between stages, the stage
/// cache, and the taxonomy tree.
pub type Row = serde_json::Map<String, Value>;

// ---------------------------------------------------------------------------
// ExperimentId
// ---------------------------------------------------------------------------

/// Identifier for one analysis run. User-supplied or generated (UUID v7,
/// time-sortable). All cached stage outputs and artifacts are keyed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ExperimentId(pub String);

impl ExperimentId {
    /// Wrap a user-supplied experiment id.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a fresh time-sortable experiment id.
    pub fn generate() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ExperimentId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Record
// ---------------------------------------------------------------------------

/// One evaluated model output, progressively enriched by the pipeline.
///
/// The base fields come from the input dataset; the optional fields are
/// filled in by the analysis and population stages. Stages never mutate a
/// record in place — each returns enriched copies. Columns the pipeline does
/// not know about ride along in `extra`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Record {
    pub dataset: String,
    pub example_id: String,
    pub model: String,
    pub input_text: String,
    pub output_text: String,
    pub score: f64,
    #[serde(default)]
    pub error: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub correct_answer: Option<String>,

    // Filled by single-error analysis.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prompt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge_model: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub judge_response: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub template_used: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inference_success: Option<bool>,

    // Filled by taxonomy population.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category_description: Option<String>,

    /// Pass-through columns from the input data.
    #[serde(flatten)]
    pub extra: Row,
}

impl Record {
    /// Flatten into a JSON object row for the stage cache or the tree.
    pub fn to_row(&self) -> Row {
        match serde_json::to_value(self) {
            Ok(Value::Object(map)) => map,
            _ => Row::new(),
        }
    }

    /// Rebuild a record from a flat row, coercing scalar cell types.
    ///
    /// Cache files round-trip through CSV, which erases types — an
    /// `example_id` of `"12"` comes back as a number. Known string fields
    /// accept any scalar; `score` accepts numbers or numeric strings.
    pub fn from_row(mut row: Row) -> Result<Self> {
        let required = |field: &str, value: Option<String>| {
            value.ok_or_else(|| {
                ErrataError::data(format!("record row is missing required field '{field}'"))
            })
        };

        let dataset = required("dataset", take_string(&mut row, "dataset"))?;
        let example_id = required("example_id", take_string(&mut row, "example_id"))?;
        let model = required("model", take_string(&mut row, "model"))?;
        let input_text = take_string(&mut row, "input_text").unwrap_or_default();
        let output_text = take_string(&mut row, "output_text").unwrap_or_default();
        let score = take_f64(&mut row, "score").ok_or_else(|| {
            ErrataError::data(format!(
                "record {dataset}/{example_id} has a missing or non-numeric score"
            ))
        })?;
        let error = take_bool(&mut row, "error").unwrap_or(false);

        Ok(Self {
            dataset,
            example_id,
            model,
            input_text,
            output_text,
            score,
            error,
            correct_answer: take_string(&mut row, "correct_answer"),
            prompt: take_string(&mut row, "prompt"),
            judge_model: take_string(&mut row, "judge_model"),
            judge_response: take_string(&mut row, "judge_response"),
            template_used: take_string(&mut row, "template_used"),
            inference_success: take_bool(&mut row, "inference_success"),
            error_title: take_string(&mut row, "error_title"),
            error_summary: take_string(&mut row, "error_summary"),
            error_category: take_string(&mut row, "error_category"),
            category_description: take_string(&mut row, "category_description"),
            extra: row,
        })
    }
}

/// Remove `key` from the row and coerce it to a string, if present.
fn take_string(row: &mut Row, key: &str) -> Option<String> {
    match row.remove(key)? {
        Value::String(s) => Some(s),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null => None,
        other => Some(other.to_string()),
    }
}

/// Remove `key` from the row and coerce it to an f64, if present.
fn take_f64(row: &mut Row, key: &str) -> Option<f64> {
    match row.remove(key)? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Remove `key` from the row and coerce it to a bool, if present.
fn take_bool(row: &mut Row, key: &str) -> Option<bool> {
    match row.remove(key)? {
        Value::Bool(b) => Some(b),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" => Some(true),
            "false" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Category
// ---------------------------------------------------------------------------

/// A taxonomy category produced by the cluster constructor. The fallback
/// category "Other" always exists implicitly with an empty description.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Category {
    pub name: String,
    #[serde(default)]
    pub description: String,
}

impl Category {
    pub fn new(name: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
        }
    }

    /// The implicit fallback category.
    pub fn other() -> Self {
        Self::new("Other", "")
    }
}

// ---------------------------------------------------------------------------
// TaxonomyParams
// ---------------------------------------------------------------------------

/// Tunables for one cluster-construction pass. Rendered into the oracle
/// prompts verbatim; the recursive orchestrator overrides `max_num_clusters`
/// per sub-problem and threads `parent_category` for context.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaxonomyParams {
    /// Size of minibatches for cluster construction.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Size of minibatches for description classification.
    #[serde(default = "default_classify_batch_size")]
    pub classify_batch_size: usize,

    /// Maximum word length for taxonomy suggestions.
    #[serde(default = "default_suggestion_length")]
    pub suggestion_length: usize,

    /// Maximum word length for cluster names.
    #[serde(default = "default_cluster_name_length")]
    pub cluster_name_length: usize,

    /// Maximum word length for cluster descriptions.
    #[serde(default = "default_cluster_description_length")]
    pub cluster_description_length: usize,

    /// Maximum word length for judgment explanations.
    #[serde(default = "default_explanation_length")]
    pub explanation_length: usize,

    /// Maximum number of clusters the oracle may propose.
    #[serde(default = "default_max_num_clusters")]
    pub max_num_clusters: usize,

    /// When non-zero, run this many update rounds over random re-samples of
    /// the description pool instead of one pass over sequential batches.
    #[serde(default)]
    pub update_repeat: usize,

    /// Name of the enclosing category, for nested sub-problems.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_category: Option<String>,
}

impl Default for TaxonomyParams {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            classify_batch_size: default_classify_batch_size(),
            suggestion_length: default_suggestion_length(),
            cluster_name_length: default_cluster_name_length(),
            cluster_description_length: default_cluster_description_length(),
            explanation_length: default_explanation_length(),
            max_num_clusters: default_max_num_clusters(),
            update_repeat: 0,
            parent_category: None,
        }
    }
}

fn default_batch_size() -> usize {
    500
}
fn default_classify_batch_size() -> usize {
    50
}
fn default_suggestion_length() -> usize {
    30
}
fn default_cluster_name_length() -> usize {
    5
}
fn default_cluster_description_length() -> usize {
    30
}
fn default_explanation_length() -> usize {
    20
}
fn default_max_num_clusters() -> usize {
    25
}
