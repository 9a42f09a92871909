use serde::{Deserialize, Serialize};

use crate::models::Interval;

/// Static augmented interval tree over `[enter, leave + 1)` keys.
///
/// The arena is immutable once ingest finishes, so the tree is an implicit
/// balanced BST over a sorted array with a per-subtree max-end augmentation:
/// no pointers, trivially serializable, O(log n + k) overlap queries. The `+1`
/// on the upper bound makes zero-length intervals queryable, since upper
/// bounds are exclusive.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IntervalTree {
    /// Sorted by `(begin, end, id)`.
    nodes: Vec<TreeEntry>,
    /// `max_end[i]` = greatest `end` in the implicit subtree rooted at `i`.
    max_end: Vec<i64>,
    /// Interval ids sorted by leave time ascending.
    end_order: Vec<usize>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
struct TreeEntry {
    begin: i64,
    end: i64,
    id: usize,
}

impl IntervalTree {
    pub fn build(intervals: &[Interval]) -> IntervalTree {
        let mut nodes: Vec<TreeEntry> = intervals
            .iter()
            .map(|iv| TreeEntry {
                begin: iv.enter.timestamp,
                end: iv.leave.timestamp + 1,
                id: iv.id,
            })
            .collect();
        nodes.sort_by_key(|n| (n.begin, n.end, n.id));

        let mut max_end = vec![i64::MIN; nodes.len()];
        fill_max_end(&nodes, &mut max_end, 0, nodes.len());

        let mut end_order: Vec<usize> = (0..intervals.len()).collect();
        end_order.sort_by_key(|&i| {
            (
                intervals[i].leave.timestamp,
                intervals[i].enter.timestamp,
                intervals[i].id,
            )
        });
        end_order = end_order.into_iter().map(|i| intervals[i].id).collect();

        IntervalTree {
            nodes,
            max_end,
            end_order,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Ids of every interval whose key overlaps the closed range `[lo, hi]`,
    /// in ascending `(begin, end, id)` order.
    pub fn iter_overlap(&self, lo: i64, hi: i64) -> OverlapIter<'_> {
        let mut stack = Vec::new();
        if !self.nodes.is_empty() {
            stack.push(Frame::Descend(0, self.nodes.len()));
        }
        OverlapIter {
            tree: self,
            lo,
            hi,
            stack,
        }
    }

    /// Interval ids ordered by leave time ascending (ties by enter, then id) —
    /// the traversal order the guid linker depends on.
    pub fn iter_end_order(&self) -> impl Iterator<Item = usize> + '_ {
        self.end_order.iter().copied()
    }
}

fn fill_max_end(nodes: &[TreeEntry], max_end: &mut [i64], lo: usize, hi: usize) -> i64 {
    if lo >= hi {
        return i64::MIN;
    }
    let mid = lo + (hi - lo) / 2;
    let left = fill_max_end(nodes, max_end, lo, mid);
    let right = fill_max_end(nodes, max_end, mid + 1, hi);
    max_end[mid] = nodes[mid].end.max(left).max(right);
    max_end[mid]
}

enum Frame {
    Descend(usize, usize),
    Visit(usize),
}

pub struct OverlapIter<'a> {
    tree: &'a IntervalTree,
    lo: i64,
    hi: i64,
    stack: Vec<Frame>,
}

impl Iterator for OverlapIter<'_> {
    type Item = usize;

    fn next(&mut self) -> Option<usize> {
        while let Some(frame) = self.stack.pop() {
            match frame {
                Frame::Descend(lo_idx, hi_idx) => {
                    if lo_idx >= hi_idx {
                        continue;
                    }
                    let mid = lo_idx + (hi_idx - lo_idx) / 2;
                    // Nothing in this subtree can reach past `lo`.
                    if self.tree.max_end[mid] <= self.lo {
                        continue;
                    }
                    // In-order: left, node, right. Right subtree only matters
                    // when this node's begin hasn't already passed `hi`.
                    if self.tree.nodes[mid].begin <= self.hi {
                        self.stack.push(Frame::Descend(mid + 1, hi_idx));
                    }
                    self.stack.push(Frame::Visit(mid));
                    self.stack.push(Frame::Descend(lo_idx, mid));
                }
                Frame::Visit(idx) => {
                    let node = self.tree.nodes[idx];
                    if node.begin <= self.hi && node.end > self.lo {
                        return Some(node.id);
                    }
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::IntervalSide;
    use std::collections::BTreeMap;

    fn interval(id: usize, enter: i64, leave: i64) -> Interval {
        Interval {
            id,
            location: "1".to_string(),
            primitive: format!("p{id}"),
            enter: IntervalSide {
                timestamp: enter,
                metrics: BTreeMap::new(),
                attrs: BTreeMap::new(),
            },
            leave: IntervalSide {
                timestamp: leave,
                metrics: BTreeMap::new(),
                attrs: BTreeMap::new(),
            },
            parent: None,
            children: Vec::new(),
            shared: BTreeMap::new(),
        }
    }

    #[test]
    fn overlap_finds_covering_and_contained() {
        let intervals = vec![
            interval(0, 100, 400),
            interval(1, 150, 200),
            interval(2, 500, 600),
        ];
        let tree = IntervalTree::build(&intervals);
        let hits: Vec<usize> = tree.iter_overlap(180, 220).collect();
        assert_eq!(hits, vec![0, 1]);
        let hits: Vec<usize> = tree.iter_overlap(450, 700).collect();
        assert_eq!(hits, vec![2]);
    }

    #[test]
    fn full_domain_yields_every_interval_once() {
        let intervals = vec![
            interval(0, 100, 400),
            interval(1, 150, 200),
            interval(2, 500, 600),
            interval(3, 100, 100),
        ];
        let tree = IntervalTree::build(&intervals);
        let mut hits: Vec<usize> = tree.iter_overlap(100, 600).collect();
        hits.sort();
        assert_eq!(hits, vec![0, 1, 2, 3]);
    }

    #[test]
    fn zero_length_interval_is_queryable() {
        let intervals = vec![interval(0, 250, 250)];
        let tree = IntervalTree::build(&intervals);
        assert_eq!(tree.iter_overlap(200, 300).count(), 1);
        assert_eq!(tree.iter_overlap(250, 250).count(), 1);
        assert_eq!(tree.iter_overlap(300, 400).count(), 0);
    }

    #[test]
    fn interval_ending_at_query_start_still_matches() {
        // Closed query bounds: leave == lo means the key [enter, leave+1)
        // still overlaps.
        let intervals = vec![interval(0, 100, 200)];
        let tree = IntervalTree::build(&intervals);
        assert_eq!(tree.iter_overlap(200, 300).count(), 1);
        assert_eq!(tree.iter_overlap(201, 300).count(), 0);
    }

    #[test]
    fn end_order_sorts_by_leave_ascending() {
        let intervals = vec![
            interval(0, 100, 400),
            interval(1, 150, 200),
            interval(2, 50, 300),
        ];
        let tree = IntervalTree::build(&intervals);
        let order: Vec<usize> = tree.iter_end_order().collect();
        assert_eq!(order, vec![1, 2, 0]);
    }

    #[test]
    fn overlap_order_is_ascending_by_begin() {
        let intervals = vec![
            interval(0, 300, 350),
            interval(1, 100, 400),
            interval(2, 200, 250),
        ];
        let tree = IntervalTree::build(&intervals);
        let hits: Vec<usize> = tree.iter_overlap(0, 1000).collect();
        assert_eq!(hits, vec![1, 2, 0]);
    }
}
