use serde::{Deserialize, Serialize};

/// A call-site hierarchy parsed out of a newick upload (or a newick block
/// embedded in a combined log). Stored verbatim and served back by the tree
/// endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TreeNode {
    pub name: String,
    pub children: Vec<TreeNode>,
}

impl TreeNode {
    pub fn leaf(name: impl Into<String>) -> TreeNode {
        TreeNode {
            name: name.into(),
            children: Vec::new(),
        }
    }
}
