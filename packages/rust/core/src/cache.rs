//! Read-through/write-through stage cache.
//!
//! Each top-level stage persists its output as one CSV table keyed by
//! (stage name, experiment id). A rerun with the same experiment id replays
//! the table instead of recomputing — for the taxonomy build that means
//! zero oracle calls. Avoiding collisions between different configurations
//! sharing an experiment id is the caller's responsibility.
//!
//! Cache problems are never fatal: a failed read falls through to
//! recomputation, a failed write is logged and swallowed.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use serde_json::Value;
use tracing::{info, warn};

use errata_shared::{ExperimentId, Row};

/// Filesystem-backed cache of tabular stage outputs.
#[derive(Debug, Clone)]
pub struct StageCache {
    output_dir: PathBuf,
}

impl StageCache {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }

    /// File path for one (stage, experiment) table.
    pub fn path(&self, stage: &str, exp_id: &ExperimentId) -> PathBuf {
        self.output_dir
            .join(format!("exp_name={stage}__exp_id={exp_id}.csv"))
    }

    /// Load a cached stage table, or `None` on miss or unreadable file.
    pub fn load(&self, stage: &str, exp_id: &ExperimentId) -> Option<Vec<Row>> {
        let path = self.path(stage, exp_id);
        if !path.exists() {
            return None;
        }

        match read_table(&path) {
            Ok(rows) => {
                info!(stage, records = rows.len(), "using cached stage results");
                Some(rows)
            }
            Err(e) => {
                warn!(stage, ?path, error = %e, "failed to load cache, regenerating");
                None
            }
        }
    }

    /// Persist a stage table. `preferred_columns` come first, in order, for
    /// stages whose consumers depend on a fixed column layout; remaining
    /// columns follow sorted.
    pub fn store(&self, stage: &str, exp_id: &ExperimentId, rows: &[Row], preferred_columns: &[&str]) {
        let path = self.path(stage, exp_id);
        match write_table(&path, rows, preferred_columns) {
            Ok(()) => info!(stage, records = rows.len(), "cached stage results"),
            Err(e) => warn!(stage, ?path, error = %e, "failed to cache stage results"),
        }
    }
}

fn read_table(path: &Path) -> Result<Vec<Row>, csv::Error> {
    let mut reader = csv::Reader::from_path(path)?;
    let headers = reader.headers()?.clone();

    let mut rows = Vec::new();
    for result in reader.records() {
        let record = result?;
        let mut row = Row::new();
        for (header, cell) in headers.iter().zip(record.iter()) {
            if let Some(value) = parse_cell(cell) {
                row.insert(header.to_string(), value);
            }
        }
        rows.push(row);
    }
    Ok(rows)
}

fn write_table(path: &Path, rows: &[Row], preferred_columns: &[&str]) -> Result<(), csv::Error> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let present: BTreeSet<&str> = rows
        .iter()
        .flat_map(|row| row.keys().map(String::as_str))
        .collect();
    let mut columns: Vec<&str> = preferred_columns
        .iter()
        .copied()
        .filter(|column| present.contains(column))
        .collect();
    columns.extend(
        present
            .iter()
            .copied()
            .filter(|column| !preferred_columns.contains(column)),
    );

    let mut writer = csv::Writer::from_path(path)?;
    writer.write_record(&columns)?;
    for row in rows {
        let cells: Vec<String> = columns
            .iter()
            .map(|column| row.get(*column).map(cell_to_string).unwrap_or_default())
            .collect();
        writer.write_record(&cells)?;
    }
    writer.flush()?;
    Ok(())
}

/// CSV erases types; recover the scalars the pipeline cares about.
/// Empty cells mean "absent".
fn parse_cell(cell: &str) -> Option<Value> {
    if cell.is_empty() {
        return None;
    }
    match cell {
        "true" => return Some(Value::Bool(true)),
        "false" => return Some(Value::Bool(false)),
        _ => {}
    }
    if let Ok(int) = cell.parse::<i64>() {
        return Some(Value::Number(int.into()));
    }
    if let Ok(float) = cell.parse::<f64>() {
        if let Some(number) = serde_json::Number::from_f64(float) {
            return Some(Value::Number(number));
        }
    }
    Some(Value::String(cell.to_string()))
}

fn cell_to_string(value: &Value) -> String {
    match value {
        Value::Null => String::new(),
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => serde_json::to_string(other).unwrap_or_default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_cache() -> (StageCache, PathBuf) {
        let dir =
            std::env::temp_dir().join(format!("errata_cache_test_{}", uuid::Uuid::now_v7()));
        (StageCache::new(&dir), dir)
    }

    fn sample_rows() -> Vec<Row> {
        let mut first = Row::new();
        first.insert("dataset".into(), json!("gpqa"));
        first.insert("example_id".into(), json!("e1"));
        first.insert("score".into(), json!(0.5));
        first.insert("error".into(), json!(true));
        first.insert(
            "judge_response".into(),
            json!(r#"{"final_answer":{"error_title":"t"}}"#),
        );

        let mut second = Row::new();
        second.insert("dataset".into(), json!("gpqa"));
        second.insert("example_id".into(), json!("e2"));
        second.insert("score".into(), json!(1.0));
        second.insert("error".into(), json!(false));

        vec![first, second]
    }

    #[test]
    fn miss_then_roundtrip() {
        let (cache, dir) = temp_cache();
        let exp_id = ExperimentId::new("roundtrip");

        assert!(cache.load("data_preparation", &exp_id).is_none());

        cache.store("data_preparation", &exp_id, &sample_rows(), &[]);
        let loaded = cache.load("data_preparation", &exp_id).expect("cache hit");

        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0].get("score"), Some(&json!(0.5)));
        assert_eq!(loaded[0].get("error"), Some(&json!(true)));
        assert_eq!(loaded[1].get("error"), Some(&json!(false)));
        // Judgment text survives as a string.
        assert!(
            loaded[0]
                .get("judge_response")
                .unwrap()
                .as_str()
                .unwrap()
                .contains("error_title")
        );
        // Absent cell means absent key.
        assert!(!loaded[1].contains_key("judge_response"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn preferred_columns_lead_the_header() {
        let (cache, dir) = temp_cache();
        let exp_id = ExperimentId::new("ordered");
        cache.store(
            "data_preparation",
            &exp_id,
            &sample_rows(),
            &["example_id", "score", "dataset"],
        );

        let content =
            std::fs::read_to_string(cache.path("data_preparation", &exp_id)).expect("read");
        let header = content.lines().next().unwrap();
        assert!(header.starts_with("example_id,score,dataset"));
        // The rest are present, after the pinned prefix.
        assert!(header.contains("error"));
        assert!(header.contains("judge_response"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn unreadable_file_falls_through_to_recompute() {
        let (cache, dir) = temp_cache();
        let exp_id = ExperimentId::new("corrupt");
        let path = cache.path("data_preparation", &exp_id);
        std::fs::create_dir_all(&dir).unwrap();
        // Ragged rows make the reader error out.
        std::fs::write(&path, "a,b\n1,2,3,4\n").unwrap();

        assert!(cache.load("data_preparation", &exp_id).is_none());

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn write_failure_is_swallowed() {
        // Output dir path occupied by a file: the write fails, nothing panics.
        let dir = std::env::temp_dir()
            .join(format!("errata_cache_blocked_{}", uuid::Uuid::now_v7()));
        std::fs::write(&dir, "not a directory").unwrap();
        let cache = StageCache::new(&dir);
        cache.store("data_preparation", &ExperimentId::new("x"), &sample_rows(), &[]);
        let _ = std::fs::remove_file(&dir);
    }
}
