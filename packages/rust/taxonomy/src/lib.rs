//! Recursive taxonomy construction for Errata.
//!
//! Builds a hierarchical categorization of error descriptions by repeatedly
//! querying the judgment oracle: a cluster constructor proposes categories
//! over batches of descriptions, a classifier assigns each description to a
//! category, a populator reconciles the judgments back onto the records, and
//! a recursive orchestrator composes the three into a tree, subdividing
//! categories until the data runs thin or the depth bound is reached.

pub mod classify;
pub mod construct;
pub mod populate;
pub mod recurse;
pub mod tree;

pub use classify::{ClassifyRound, classify_errors};
pub use construct::{
    ConstructRound, categories_from_taxonomy, construct_taxonomy, extract_description,
    last_parseable_taxonomy,
};
pub use populate::{collapse_rare_categories, populate_taxonomy};
pub use recurse::{TaxonomyBuilder, TaxonomyOutput, dynamic_cluster_cap};
pub use tree::{TaxonomyNode, TaxonomyTree, node_id};
