use crate::client_log::ClientLog;
use crate::models::TreeNode;

use super::primitives::{add_primitive_child, process_primitive};
use super::{Dataset, StoreError};

// ── Newick tree ingest ──
//
// Call-site hierarchies arrive as newick text, e.g. `(B,(D,E)C)A;`. Children
// come first inside parentheses, then the node's own label; branch lengths
// after `:` are tolerated and discarded. Every node registers a primitive and
// every edge a primitive link, then the parsed tree is stored for the tree
// endpoint.

#[derive(Debug, Clone, Copy, Default)]
pub struct NewickCounts {
    pub new_primitives: u64,
    pub seen_primitives: u64,
    pub new_links: u64,
    pub seen_links: u64,
}

pub async fn process_newick_tree(
    dataset: &mut Dataset,
    text: &str,
    debug: bool,
    log: &ClientLog,
) -> Result<NewickCounts, StoreError> {
    let tree = parse_newick(text)?;
    let mut counts = NewickCounts::default();
    register(dataset, &tree, debug, &mut counts);
    dataset.trees.insert("newick".to_string(), tree);
    log.log("Finished parsing newick tree").await;
    log.log(format!(
        "New primitives: {}, Observed existing primitives: {}",
        counts.new_primitives, counts.seen_primitives
    ))
    .await;
    log.log(format!(
        "New links: {}, Observed existing links: {}",
        counts.new_links, counts.seen_links
    ))
    .await;
    Ok(counts)
}

fn register(dataset: &mut Dataset, node: &TreeNode, debug: bool, counts: &mut NewickCounts) {
    let (_, is_new) =
        process_primitive(&mut dataset.primitives, &node.name, Some("newick"), debug);
    if is_new {
        counts.new_primitives += 1;
    } else {
        counts.seen_primitives += 1;
    }
    for child in &node.children {
        register(dataset, child, debug, counts);
        let new_link = add_primitive_child(
            &mut dataset.primitives,
            &mut dataset.primitive_links,
            &node.name,
            &child.name,
            Some("newick"),
            debug,
        );
        if new_link {
            counts.new_links += 1;
        } else {
            counts.seen_links += 1;
        }
    }
}

/// Parse the first tree in a newick document.
pub fn parse_newick(text: &str) -> Result<TreeNode, StoreError> {
    let mut parser = NewickParser {
        chars: text.chars().collect(),
        pos: 0,
    };
    parser.skip_whitespace();
    let node = parser.parse_node()?;
    Ok(node)
}

struct NewickParser {
    chars: Vec<char>,
    pos: usize,
}

impl NewickParser {
    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek();
        if c.is_some() {
            self.pos += 1;
        }
        c
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(c) if c.is_whitespace()) {
            self.pos += 1;
        }
    }

    fn parse_node(&mut self) -> Result<TreeNode, StoreError> {
        self.skip_whitespace();
        let mut children = Vec::new();
        if self.peek() == Some('(') {
            self.bump();
            loop {
                children.push(self.parse_node()?);
                self.skip_whitespace();
                match self.bump() {
                    Some(',') => continue,
                    Some(')') => break,
                    other => {
                        return Err(StoreError::Malformed(format!(
                            "newick: expected ',' or ')', found {other:?}"
                        )));
                    }
                }
            }
        }
        let name = self.parse_label();
        Ok(TreeNode { name, children })
    }

    fn parse_label(&mut self) -> String {
        self.skip_whitespace();
        let mut label = String::new();
        while let Some(c) = self.peek() {
            if matches!(c, ',' | '(' | ')' | ';' | ':') {
                break;
            }
            label.push(c);
            self.pos += 1;
        }
        // Branch lengths are metadata we do not keep.
        if self.peek() == Some(':') {
            self.bump();
            while let Some(c) = self.peek() {
                if matches!(c, ',' | '(' | ')' | ';') {
                    break;
                }
                self.pos += 1;
            }
        }
        label.trim().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_nested_tree() {
        let tree = parse_newick("(B,(D,E)C)A;").unwrap();
        assert_eq!(tree.name, "A");
        assert_eq!(tree.children.len(), 2);
        assert_eq!(tree.children[0].name, "B");
        let c = &tree.children[1];
        assert_eq!(c.name, "C");
        assert_eq!(c.children[0].name, "D");
        assert_eq!(c.children[1].name, "E");
    }

    #[test]
    fn tolerates_branch_lengths_and_whitespace() {
        let tree = parse_newick("( B:0.1 , C:0.2 ) A:1.5;").unwrap();
        assert_eq!(tree.name, "A");
        assert_eq!(tree.children[0].name, "B");
        assert_eq!(tree.children[1].name, "C");
    }

    #[test]
    fn unbalanced_parens_fail() {
        assert!(parse_newick("(B,(C)A;").is_err());
    }

    #[tokio::test]
    async fn registers_primitives_and_links() {
        let mut dataset = Dataset::new("x".to_string());
        let counts = process_newick_tree(
            &mut dataset,
            "(multiply$0$2$4,add$0$3$4)run$0$1$1;",
            false,
            &ClientLog::console(),
        )
        .await
        .unwrap();
        assert_eq!(counts.new_primitives, 3);
        assert_eq!(counts.new_links, 2);
        assert!(dataset.primitives.contains_key("run$0$1$1"));
        assert!(dataset.primitive_links.contains_key("run$0$1$1_multiply$0$2$4"));
        assert_eq!(dataset.trees.get("newick").unwrap().children.len(), 2);
    }
}
