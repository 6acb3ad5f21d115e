//! Recursive orchestrator: composes constructor, classifier, and populator
//! into a depth-bounded taxonomy tree.
//!
//! Each sub-problem is (records, parent node, depth). Categories that still
//! look subdividable spawn independent tasks at depth+1; siblings at one
//! level run concurrently and are joined before the level returns. The tree
//! is the only shared mutable state — its id-checked, append-only insertion
//! makes the interleaved writes safe.
//!
//! Termination does not depend on oracle behavior: the depth bound, the
//! record-count-driven cluster cap, and the distinct-title floor each shrink
//! monotonically along any branch.

use std::collections::HashSet;
use std::sync::Arc;

use futures::FutureExt;
use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use errata_oracle::Oracle;
use errata_shared::{Category, ErrataError, Record, Result, Row, TaxonomyParams};

use crate::classify::classify_errors;
use crate::construct::{construct_taxonomy, last_parseable_taxonomy};
use crate::populate::populate_taxonomy;
use crate::tree::{TaxonomyNode, TaxonomyTree, node_id};

/// Name of the taxonomy root node.
pub const ROOT_NAME: &str = "LLM Errors";

/// Record field the taxonomy is clustered over.
const DESCRIPTION_FIELD: &str = "error_title";

/// Distinct-title floor below which a category is never subdivided.
const MIN_TITLES_TO_SPLIT: usize = 5;

/// Cluster budget for a sub-problem: a tenth of its item count, bounded by
/// the configured maximum.
pub fn dynamic_cluster_cap(fixed_max: usize, item_count: usize) -> usize {
    fixed_max.min(item_count.div_ceil(10))
}

/// The completed build: the exported tree and the flattened leaf rows.
#[derive(Debug)]
pub struct TaxonomyOutput {
    /// Nested tree document (the `export` shape).
    pub tree: Value,
    /// One row per leaf, with full ancestry columns.
    pub leaves: Vec<Row>,
}

/// Children to attach under a node: either leaf records or category nodes.
enum AttachItems {
    Records(Vec<Record>),
    Categories(Vec<Category>),
}

/// Driver for one recursive taxonomy build.
pub struct TaxonomyBuilder {
    oracle: Arc<dyn Oracle>,
    params: TaxonomyParams,
    seed: u64,
    max_depth: usize,
    rare_freq: f64,
    extra_columns: Vec<String>,
}

impl TaxonomyBuilder {
    pub fn new(
        oracle: Arc<dyn Oracle>,
        params: TaxonomyParams,
        seed: u64,
        max_depth: usize,
        rare_freq: f64,
        extra_columns: Vec<String>,
    ) -> Self {
        Self {
            oracle,
            params,
            seed,
            max_depth,
            rare_freq,
            extra_columns,
        }
    }

    /// Build the full taxonomy over `records` and flatten it.
    pub async fn build(self: Arc<Self>, records: Vec<Record>) -> TaxonomyOutput {
        let tree = Arc::new(Mutex::new(TaxonomyTree::new(ROOT_NAME)));
        let root_id = { tree.lock().await.root_id().to_string() };

        self.clone()
            .subdivide(records, root_id, 0, tree.clone())
            .await;

        let guard = tree.lock().await;
        TaxonomyOutput {
            tree: guard.export(),
            leaves: guard.leaf_rows(&self.extra_columns),
        }
    }

    /// Solve one sub-problem: cluster, classify, populate, then either stop
    /// at leaves or spawn child sub-problems per category.
    fn subdivide(
        self: Arc<Self>,
        records: Vec<Record>,
        parent_id: String,
        depth: usize,
        tree: Arc<Mutex<TaxonomyTree>>,
    ) -> BoxFuture<'static, ()> {
        async move {
            debug!(depth, records = records.len(), "taxonomy sub-problem");

            // The root's name is display-only; it never goes into prompts.
            let parent_name = if depth > 0 {
                let guard = tree.lock().await;
                guard
                    .get(&parent_id)
                    .map(|node| node.name.clone())
                    .filter(|name| !name.is_empty())
            } else {
                None
            };

            let populated = match self.run_stages(&records, parent_name.as_deref()).await {
                Ok(Some(populated)) => populated,
                Ok(None) => {
                    info!(depth, "no taxonomy for this sub-problem");
                    return;
                }
                Err(e) => {
                    let parent = parent_name.unwrap_or_else(|| ROOT_NAME.to_string());
                    let e = ErrataError::taxonomy(depth, parent, e);
                    error!(error = %e, "sub-problem failed, collapsing this branch only");
                    return;
                }
            };

            let categories = category_set(&populated);

            // A single category adds no information — attach the records
            // directly instead of inserting a one-child level.
            if categories.len() <= 1 {
                attach_children(&tree, &parent_id, AttachItems::Records(records), depth).await;
                return;
            }

            attach_children(
                &tree,
                &parent_id,
                AttachItems::Categories(categories.clone()),
                depth,
            )
            .await;

            let mut branches = JoinSet::new();
            for category in categories {
                let members: Vec<Record> = populated
                    .iter()
                    .filter(|record| record.error_category.as_deref() == Some(&category.name))
                    .cloned()
                    .collect();
                let titles: HashSet<&str> = members
                    .iter()
                    .filter_map(|record| record.error_title.as_deref())
                    .collect();

                if titles.is_empty() {
                    warn!(category = %category.name, "category has no members");
                    continue;
                }

                let category_node_id = node_id(Some(&parent_id), &category.name, depth);
                let subset_cap = dynamic_cluster_cap(self.params.max_num_clusters, titles.len());

                if titles.len() <= MIN_TITLES_TO_SPLIT
                    || subset_cap <= 1
                    || depth + 1 > self.max_depth
                {
                    attach_children(
                        &tree,
                        &category_node_id,
                        AttachItems::Records(members),
                        depth,
                    )
                    .await;
                } else {
                    branches.spawn(self.clone().subdivide(
                        members,
                        category_node_id,
                        depth + 1,
                        tree.clone(),
                    ));
                }
            }

            // Sibling barrier: the level is done only when every spawned
            // sub-problem has finished writing into the tree.
            while branches.join_next().await.is_some() {}
        }
        .boxed()
    }

    /// Constructor → classifier → populator for one sub-problem.
    ///
    /// `Ok(None)` means there was nothing to build (empty input or no
    /// descriptions); `Err` means the oracle rounds were unusable.
    async fn run_stages(
        &self,
        records: &[Record],
        parent_category: Option<&str>,
    ) -> Result<Option<Vec<Record>>> {
        if records.is_empty() {
            return Ok(None);
        }

        let mut params = self.params.clone();
        params.max_num_clusters =
            dynamic_cluster_cap(self.params.max_num_clusters, records.len());
        params.parent_category = parent_category.map(str::to_string);

        let rounds = construct_taxonomy(
            records,
            self.oracle.as_ref(),
            &params,
            DESCRIPTION_FIELD,
            self.seed,
        )
        .await;
        if rounds.is_empty() {
            return Ok(None);
        }

        let (taxonomy, _) = last_parseable_taxonomy(&rounds).ok_or_else(|| {
            ErrataError::data("no oracle judgment produced a parseable cluster list")
        })?;

        let classification = classify_errors(
            records,
            &taxonomy,
            self.oracle.as_ref(),
            params.classify_batch_size,
            DESCRIPTION_FIELD,
        )
        .await;
        if classification.is_empty() {
            return Ok(None);
        }

        populate_taxonomy(records, &rounds, &classification, self.rare_freq).map(Some)
    }
}

/// The categories present on populated records, first-occurrence order.
fn category_set(populated: &[Record]) -> Vec<Category> {
    let mut seen = HashSet::new();
    let mut categories = Vec::new();
    for record in populated {
        let Some(name) = record.error_category.as_deref() else {
            continue;
        };
        if name.is_empty() || !seen.insert(name.to_string()) {
            continue;
        }
        categories.push(Category::new(
            name,
            record.category_description.clone().unwrap_or_default(),
        ));
    }
    categories
}

/// Insert children under `parent_id`: category nodes carry their
/// description; record leaves carry the full record row. Record-leaf ids get
/// an ordinal suffix so identically-titled siblings never collide.
async fn attach_children(
    tree: &Mutex<TaxonomyTree>,
    parent_id: &str,
    items: AttachItems,
    depth: usize,
) {
    let mut guard = tree.lock().await;
    match items {
        AttachItems::Records(records) => {
            for (i, record) in records.into_iter().enumerate() {
                let name = record
                    .error_title
                    .clone()
                    .unwrap_or_else(|| "Unknown".to_string());
                let id = format!("{}#{i}", node_id(Some(parent_id), &name, depth));
                guard.add_node(parent_id, TaxonomyNode::new(id, name, record.to_row()));
            }
        }
        AttachItems::Categories(categories) => {
            for category in categories {
                if category.name.is_empty() {
                    continue;
                }
                let id = node_id(Some(parent_id), &category.name, depth);
                let mut info = Row::new();
                info.insert("description".into(), Value::String(category.description));
                guard.add_node(parent_id, TaxonomyNode::new(id, category.name, info));
            }
        }
    }
    if let Some(parent) = guard.get(parent_id) {
        debug!(parent = %parent.name, children = parent.children().len(), "attached children");
    }
}
