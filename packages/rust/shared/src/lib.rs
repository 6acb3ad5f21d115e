//! Shared types, error model, and configuration for Errata.
//!
//! This crate is the foundation depended on by all other Errata crates.
//! It provides:
//! - [`ErrataError`] — the unified error type
//! - Domain types ([`Record`], [`Category`], [`ExperimentId`], [`TaxonomyParams`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, DatasetEntry, DefaultsConfig, OracleSettings, config_dir, config_file_path,
    init_config, load_config, load_config_from, validate_api_key,
};
pub use error::{ErrataError, Result};
pub use types::{Category, ExperimentId, Record, Row, TaxonomyParams};
