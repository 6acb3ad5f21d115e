//! In-memory taxonomy tree.
//!
//! The tree exclusively owns its nodes in an id-indexed arena; parent links
//! are non-owning ids resolved through the index, so the parent/child cycle
//! never shows up in the ownership graph. Insertion is append-only and
//! id-checked, which is what makes concurrent sibling branches (behind one
//! mutex) safe to interleave.

use std::collections::HashMap;

use serde_json::{Value, json};
use tracing::warn;

use errata_shared::Row;

/// Info keys preserved when exporting the full tree.
const EXPORT_INFO_FIELDS: &[&str] = &[
    "description",
    "prompt",
    "model",
    "dataset",
    "example_id",
    "input_text",
    "candidate_answers",
    "output_text",
    "score",
    "judge_model",
    "judge_response",
    "error_summary",
    "error_title",
];

/// Leaf fields included in flattened leaf rows.
const LEAF_FIELDS: &[&str] = &[
    "dataset",
    "example_id",
    "model",
    "input_text",
    "output_text",
    "score",
    "judge_model",
    "judge_response",
    "error_title",
    "error_summary",
    "prompt",
];

/// Derive a node id from its placement.
///
/// The parent id is a prefix, so an id encodes the node's full ancestor path:
/// two categories that happen to share a display name under different parents
/// can never collide.
pub fn node_id(parent_id: Option<&str>, name: &str, depth: usize) -> String {
    match parent_id {
        Some(parent) => format!("{parent}/{name}@{depth}"),
        None => format!("{name}@{depth}"),
    }
}

/// One node: a category, or a leaf record.
#[derive(Debug, Clone)]
pub struct TaxonomyNode {
    pub id: String,
    pub name: String,
    /// Free-form payload; filtered to a fixed allow-list at export time.
    pub info: Row,
    /// Non-owning back-reference, resolved through the tree index.
    pub parent: Option<String>,
    children: Vec<String>,
}

impl TaxonomyNode {
    pub fn new(id: impl Into<String>, name: impl Into<String>, info: Row) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            info,
            parent: None,
            children: Vec::new(),
        }
    }

    /// Child ids in insertion order.
    pub fn children(&self) -> &[String] {
        &self.children
    }

    fn is_leaf(&self) -> bool {
        self.children.is_empty()
    }

    /// Info filtered to the export allow-list.
    fn export_info(&self) -> Row {
        self.info
            .iter()
            .filter(|(key, _)| EXPORT_INFO_FIELDS.contains(&key.as_str()))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect()
    }
}

/// The taxonomy tree: a root plus an id → node index owning every node.
#[derive(Debug)]
pub struct TaxonomyTree {
    root_id: String,
    nodes: HashMap<String, TaxonomyNode>,
}

impl TaxonomyTree {
    /// Create a tree with a fresh root node.
    pub fn new(root_name: &str) -> Self {
        let root = TaxonomyNode::new(node_id(None, root_name, 0), root_name, Row::new());
        let root_id = root.id.clone();
        let mut nodes = HashMap::new();
        nodes.insert(root_id.clone(), root);
        Self { root_id, nodes }
    }

    pub fn root_id(&self) -> &str {
        &self.root_id
    }

    /// Insert `child` under `parent_id`. Returns false — and leaves the tree
    /// untouched — when the child's id is already present. Duplicate
    /// insertion is therefore a no-op, never a duplicate sibling.
    pub fn add_node(&mut self, parent_id: &str, mut child: TaxonomyNode) -> bool {
        if self.nodes.contains_key(&child.id) {
            return false;
        }
        let Some(parent) = self.nodes.get_mut(parent_id) else {
            warn!(parent_id, child_id = %child.id, "parent node not found, dropping child");
            return false;
        };
        parent.children.push(child.id.clone());
        child.parent = Some(parent_id.to_string());
        self.nodes.insert(child.id.clone(), child);
        true
    }

    pub fn get(&self, id: &str) -> Option<&TaxonomyNode> {
        self.nodes.get(id)
    }

    /// Export the full tree as a nested JSON document.
    pub fn export(&self) -> Value {
        self.export_node(&self.root_id)
    }

    fn export_node(&self, id: &str) -> Value {
        let Some(node) = self.nodes.get(id) else {
            return Value::Null;
        };
        let children: Vec<Value> = node
            .children
            .iter()
            .map(|child_id| self.export_node(child_id))
            .collect();
        json!({
            "id": node.id,
            "name": node.name,
            "info": node.export_info(),
            "children": children,
            "parent": node.parent.as_deref().unwrap_or(""),
        })
    }

    /// Flatten every leaf into a row carrying its full ancestry.
    ///
    /// Depth-first, children in insertion order. Each leaf row holds the
    /// allow-listed leaf fields (plus any `extra_columns` present on that
    /// leaf) and one `category_depth_{i}` key per non-leaf ancestor, where
    /// `i` is 0 at the root and the value is the ancestor's info plus its
    /// name, serialized as a JSON string.
    pub fn leaf_rows(&self, extra_columns: &[String]) -> Vec<Row> {
        let mut rows = Vec::new();
        let mut path = Vec::new();
        self.collect_leaves(&self.root_id, &mut path, extra_columns, &mut rows);
        rows
    }

    fn collect_leaves(
        &self,
        id: &str,
        path: &mut Vec<String>,
        extra_columns: &[String],
        rows: &mut Vec<Row>,
    ) {
        let Some(node) = self.nodes.get(id) else {
            return;
        };

        if node.is_leaf() {
            let mut row = Row::new();
            for field in LEAF_FIELDS
                .iter()
                .copied()
                .chain(extra_columns.iter().map(String::as_str))
            {
                if let Some(value) = node.info.get(field) {
                    row.insert(field.to_string(), value.clone());
                }
            }
            for (i, ancestor_id) in path.iter().enumerate() {
                if let Some(ancestor) = self.nodes.get(ancestor_id) {
                    let mut category_info = ancestor.info.clone();
                    category_info.insert("name".to_string(), json!(ancestor.name));
                    let serialized = serde_json::to_string(&category_info).unwrap_or_default();
                    row.insert(format!("category_depth_{i}"), json!(serialized));
                }
            }
            rows.push(row);
            return;
        }

        path.push(id.to_string());
        for child_id in node.children.clone() {
            self.collect_leaves(&child_id, path, extra_columns, rows);
        }
        path.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(pairs: &[(&str, Value)]) -> Row {
        pairs
            .iter()
            .map(|(key, value)| (key.to_string(), value.clone()))
            .collect()
    }

    fn record_info(dataset: &str, example_id: &str, title: &str) -> Row {
        info(&[
            ("dataset", json!(dataset)),
            ("example_id", json!(example_id)),
            ("model", json!("m1")),
            ("score", json!(0.0)),
            ("error_title", json!(title)),
        ])
    }

    #[test]
    fn add_node_is_idempotent() {
        let mut tree = TaxonomyTree::new("LLM Errors");
        let root = tree.root_id().to_string();
        let id = node_id(Some(&root), "Reasoning", 0);

        assert!(tree.add_node(&root, TaxonomyNode::new(&id, "Reasoning", Row::new())));
        assert!(!tree.add_node(&root, TaxonomyNode::new(&id, "Reasoning", Row::new())));

        let root_node = tree.get(&root).unwrap();
        assert_eq!(root_node.children().len(), 1);
    }

    #[test]
    fn add_node_requires_known_parent() {
        let mut tree = TaxonomyTree::new("LLM Errors");
        let orphan = TaxonomyNode::new("nowhere/child@1", "child", Row::new());
        assert!(!tree.add_node("nowhere@0", orphan));
        assert!(tree.get("nowhere/child@1").is_none());
    }

    #[test]
    fn same_name_under_different_parents_does_not_collide() {
        let mut tree = TaxonomyTree::new("LLM Errors");
        let root = tree.root_id().to_string();
        for parent_name in ["Math", "Logic"] {
            let parent_id = node_id(Some(&root), parent_name, 0);
            tree.add_node(&root, TaxonomyNode::new(&parent_id, parent_name, Row::new()));
            let child_id = node_id(Some(&parent_id), "Off By One", 1);
            assert!(tree.add_node(
                &parent_id,
                TaxonomyNode::new(&child_id, "Off By One", Row::new())
            ));
        }
    }

    #[test]
    fn export_filters_info_and_links_parent() {
        let mut tree = TaxonomyTree::new("LLM Errors");
        let root = tree.root_id().to_string();
        let id = node_id(Some(&root), "Math", 0);
        let node_info = info(&[
            ("description", json!("calculation mistakes")),
            ("internal_note", json!("should not be exported")),
        ]);
        tree.add_node(&root, TaxonomyNode::new(&id, "Math", node_info));

        let exported = tree.export();
        assert_eq!(exported["parent"], json!(""));
        let child = &exported["children"][0];
        assert_eq!(child["parent"], json!(root));
        assert_eq!(child["info"]["description"], json!("calculation mistakes"));
        assert!(child["info"].get("internal_note").is_none());
    }

    #[test]
    fn leaf_rows_count_matches_leaves_and_carries_ancestry() {
        let mut tree = TaxonomyTree::new("LLM Errors");
        let root = tree.root_id().to_string();

        let math_id = node_id(Some(&root), "Math", 0);
        tree.add_node(
            &root,
            TaxonomyNode::new(&math_id, "Math", info(&[("description", json!("math"))])),
        );
        let logic_id = node_id(Some(&root), "Logic", 0);
        tree.add_node(
            &root,
            TaxonomyNode::new(&logic_id, "Logic", info(&[("description", json!("logic"))])),
        );

        for (i, parent) in [&math_id, &math_id, &logic_id].iter().enumerate() {
            let title = format!("t{i}");
            let leaf_id = format!("{}#{i}", node_id(Some(parent), &title, 1));
            tree.add_node(
                parent,
                TaxonomyNode::new(&leaf_id, &title, record_info("gpqa", &format!("e{i}"), &title)),
            );
        }

        let rows = tree.leaf_rows(&[]);
        assert_eq!(rows.len(), 3);

        let first = &rows[0];
        assert_eq!(first.get("dataset"), Some(&json!("gpqa")));
        // Ancestry: root at depth 0, category at depth 1.
        let root_blob = first.get("category_depth_0").unwrap().as_str().unwrap();
        assert!(root_blob.contains("LLM Errors"));
        let cat_blob = first.get("category_depth_1").unwrap().as_str().unwrap();
        assert!(cat_blob.contains("Math"));
        assert!(first.get("category_depth_2").is_none());
    }

    #[test]
    fn leaf_rows_keeps_requested_extra_columns() {
        let mut tree = TaxonomyTree::new("LLM Errors");
        let root = tree.root_id().to_string();
        let mut leaf_info = record_info("gpqa", "e1", "t1");
        leaf_info.insert("difficulty".into(), json!("hard"));
        leaf_info.insert("split".into(), json!("test"));
        let leaf_id = format!("{}#0", node_id(Some(&root), "t1", 0));
        tree.add_node(&root, TaxonomyNode::new(&leaf_id, "t1", leaf_info));

        let rows = tree.leaf_rows(&["difficulty".to_string()]);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("difficulty"), Some(&json!("hard")));
        // Not requested, not included.
        assert!(rows[0].get("split").is_none());
    }

    #[test]
    fn children_visited_in_insertion_order() {
        let mut tree = TaxonomyTree::new("LLM Errors");
        let root = tree.root_id().to_string();
        for name in ["z-last", "a-first", "m-middle"] {
            let leaf_id = format!("{}#0", node_id(Some(&root), name, 0));
            tree.add_node(
                &root,
                TaxonomyNode::new(&leaf_id, name, record_info("d", name, name)),
            );
        }

        let rows = tree.leaf_rows(&[]);
        let order: Vec<&str> = rows
            .iter()
            .map(|row| row.get("example_id").unwrap().as_str().unwrap())
            .collect();
        assert_eq!(order, vec!["z-last", "a-first", "m-middle"]);
    }
}
