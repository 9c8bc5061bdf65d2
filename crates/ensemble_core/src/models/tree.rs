//! Decision tree structures shared by the tree families
//!
//! Nodes are stored in a flat vector with node 0 as the root. Numeric splits
//! send a row left when `value <= threshold`; missing values always go right.
//! Categorical splits send a row left when its category key is in the node's
//! sorted category set.

use crate::frame::category_key;
use serde::{Deserialize, Serialize};

/// A decision tree node (internal or leaf)
///
/// For internal nodes:
/// - `feature_idx >= 0`: index into the row, in model column order
/// - `left` and `right` point to child node indices
/// - `categories` is empty for numeric splits
/// - `leaf` is `None`
///
/// For leaf nodes:
/// - `feature_idx == -1`
/// - `leaf` contains the raw score contribution
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Node {
    pub id: i32,
    pub left: i32,
    pub right: i32,
    pub feature_idx: i32,
    pub threshold: f64,
    pub categories: Vec<i64>,
    pub leaf: Option<f64>,
}

impl Node {
    /// Numeric split node
    pub fn internal(id: i32, feature_idx: i32, threshold: f64, left: i32, right: i32) -> Self {
        Self {
            id,
            left,
            right,
            feature_idx,
            threshold,
            categories: Vec::new(),
            leaf: None,
        }
    }

    /// Categorical split node; `categories` is sorted before storing
    pub fn categorical(id: i32, feature_idx: i32, mut categories: Vec<i64>, left: i32, right: i32) -> Self {
        categories.sort_unstable();
        categories.dedup();
        Self {
            id,
            left,
            right,
            feature_idx,
            threshold: 0.0,
            categories,
            leaf: None,
        }
    }

    pub fn leaf(id: i32, value: f64) -> Self {
        Self {
            id,
            left: -1,
            right: -1,
            feature_idx: -1,
            threshold: 0.0,
            categories: Vec::new(),
            leaf: Some(value),
        }
    }

    pub fn is_leaf(&self) -> bool {
        self.feature_idx == -1 || self.leaf.is_some()
    }

    pub fn is_categorical(&self) -> bool {
        !self.categories.is_empty()
    }

    /// Whether `value` follows the left branch
    pub fn goes_left(&self, value: f64) -> bool {
        if self.is_categorical() {
            self.categories.binary_search(&category_key(value)).is_ok()
        } else {
            value <= self.threshold
        }
    }
}

/// A single regression tree
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Tree {
    pub nodes: Vec<Node>,
}

impl Tree {
    pub fn new(nodes: Vec<Node>) -> Self {
        Self { nodes }
    }

    /// Score contribution of this tree for one row
    pub fn evaluate(&self, row: &[f64]) -> f64 {
        let mut idx = 0usize;

        loop {
            let Some(node) = self.nodes.get(idx) else {
                return 0.0;
            };
            if node.is_leaf() {
                return node.leaf.unwrap_or(0.0);
            }

            let value = row.get(node.feature_idx as usize).copied().unwrap_or(f64::NAN);
            let next = if node.goes_left(value) { node.left } else { node.right };
            if next < 0 {
                return 0.0;
            }
            idx = next as usize;
        }
    }

    pub fn leaf_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_leaf()).count()
    }

    pub fn depth(&self) -> usize {
        fn walk(nodes: &[Node], idx: usize, depth: usize) -> usize {
            match nodes.get(idx) {
                Some(node) if !node.is_leaf() => walk(nodes, node.left as usize, depth + 1)
                    .max(walk(nodes, node.right as usize, depth + 1)),
                _ => depth,
            }
        }
        walk(&self.nodes, 0, 0)
    }

    /// All leaf values and thresholds, for finiteness checks
    pub fn values(&self) -> impl Iterator<Item = f64> + '_ {
        self.nodes
            .iter()
            .flat_map(|n| [n.threshold, n.leaf.unwrap_or(0.0)])
    }

    /// Validate tree structure against `n_features` input columns
    pub fn validate(&self, n_features: usize) -> Result<(), String> {
        if self.nodes.is_empty() {
            return Err("Tree has no nodes".to_string());
        }

        for (i, node) in self.nodes.iter().enumerate() {
            if node.is_leaf() {
                if node.leaf.is_none() {
                    return Err(format!("Leaf node {i} has no leaf value"));
                }
                continue;
            }
            // children always follow their parent, which also rules out cycles
            for child in [node.left, node.right] {
                if child <= i as i32 || child as usize >= self.nodes.len() {
                    return Err(format!("Node {i} has invalid child: {child}"));
                }
            }
            if node.feature_idx < 0 || node.feature_idx as usize >= n_features {
                return Err(format!(
                    "Internal node {} has invalid feature index: {}",
                    i, node.feature_idx
                ));
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stump() -> Tree {
        Tree::new(vec![
            Node::internal(0, 0, 50.0, 1, 2),
            Node::leaf(1, -1.0),
            Node::leaf(2, 1.0),
        ])
    }

    #[test]
    fn test_node_creation() {
        let internal = Node::internal(0, 3, 1.5, 1, 2);
        assert_eq!(internal.feature_idx, 3);
        assert!(!internal.is_leaf());
        assert!(!internal.is_categorical());

        let leaf = Node::leaf(1, -0.25);
        assert_eq!(leaf.feature_idx, -1);
        assert!(leaf.is_leaf());
        assert_eq!(leaf.leaf, Some(-0.25));

        let cat = Node::categorical(0, 1, vec![5, 2, 5], 1, 2);
        assert_eq!(cat.categories, vec![2, 5]);
    }

    #[test]
    fn test_tree_evaluation() {
        let tree = stump();
        assert_eq!(tree.evaluate(&[30.0]), -1.0);
        assert_eq!(tree.evaluate(&[50.0]), -1.0); // equal goes left
        assert_eq!(tree.evaluate(&[60.0]), 1.0);
        assert_eq!(tree.evaluate(&[f64::NAN]), 1.0); // missing goes right
    }

    #[test]
    fn test_categorical_evaluation() {
        let tree = Tree::new(vec![
            Node::categorical(0, 0, vec![1, 3], 1, 2),
            Node::leaf(1, 10.0),
            Node::leaf(2, 20.0),
        ]);
        assert_eq!(tree.evaluate(&[1.0]), 10.0);
        assert_eq!(tree.evaluate(&[3.0]), 10.0);
        assert_eq!(tree.evaluate(&[2.0]), 20.0);
        assert_eq!(tree.evaluate(&[f64::NAN]), 20.0);
    }

    #[test]
    fn test_tree_validation() {
        assert!(stump().validate(1).is_ok());
        assert!(stump().validate(0).is_err());

        let invalid = Tree::new(vec![
            Node::internal(0, 0, 50.0, 5, 2),
            Node::leaf(1, 1.0),
            Node::leaf(2, 2.0),
        ]);
        assert!(invalid.validate(1).is_err());

        let cyclic = Tree::new(vec![Node::internal(0, 0, 1.0, 0, 0)]);
        assert!(cyclic.validate(1).is_err());
    }

    #[test]
    fn test_shape_helpers() {
        let tree = stump();
        assert_eq!(tree.leaf_count(), 2);
        assert_eq!(tree.depth(), 1);
        assert_eq!(Tree::new(vec![Node::leaf(0, 0.0)]).depth(), 0);
    }
}
