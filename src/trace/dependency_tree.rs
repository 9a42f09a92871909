use std::collections::{BTreeMap, BTreeSet, HashMap};

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::client_log::ClientLog;
use crate::models::Interval;

use super::sul::{CriticalPoint, Sul, SulMode};

// ═══════════════════════════════════════════════════════════════════
// Dependency tree: hierarchical rollup of intervals by primitive name
// ═══════════════════════════════════════════════════════════════════

/// Which interval roots are admitted into the tree. The trace format has two
/// generations of naming conventions, so the filter is configurable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DependencyFilter {
    /// Admit everything except the APEX MAIN wrapper.
    #[default]
    ExcludeApexMain,
    /// Admit only names carrying `$`-encoded source positions.
    RequireDollar,
}

impl DependencyFilter {
    pub fn includes(&self, primitive: &str) -> bool {
        match self {
            DependencyFilter::ExcludeApexMain => !primitive.contains("APEX MAIN"),
            DependencyFilter::RequireDollar => primitive.contains('$'),
        }
    }
}

/// One contiguous run of time representing a logical occurrence of a
/// primitive across its sub-tree: the interval's own span, extended rightward
/// over the latest child block, with the children's utilization folded in.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AggregatedBlock {
    pub start_time: i64,
    pub end_time: i64,
    pub first_primitive_name: String,
    pub utilization: Sul,
    pub all_locations: Vec<String>,
    #[serde(default)]
    is_finalized: bool,
}

impl AggregatedBlock {
    fn new(start_time: i64, end_time: i64) -> AggregatedBlock {
        AggregatedBlock {
            start_time,
            end_time,
            first_primitive_name: String::new(),
            utilization: Sul::new(SulMode::Counter),
            all_locations: Vec::new(),
            is_finalized: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DependencyTreeNode {
    pub node_id: String,
    pub name: String,
    pub prefix_list: Vec<String>,
    pub children: Vec<DependencyTreeNode>,
    /// `(enter, leave)` spans of this node's own intervals.
    pub interval_list: Vec<(i64, i64)>,
    pub aggregated_block_list: Vec<AggregatedBlock>,
    /// Lane-compacted occurrence map: per dummy location, the occupying
    /// block's index + 1 (0 means the lane is empty).
    pub aggregated_util: Sul,
}

/// Split `/app$0/fn$0$x/rest…` into the prefix through the second `/` and the
/// remainder; names without two slashes keep everything and get no prefix.
fn split_prefix(primitive: &str) -> (String, String) {
    let mut slashes = primitive.match_indices('/');
    let _ = slashes.next();
    match slashes.next() {
        Some((i, _)) => (primitive[..=i].to_string(), primitive[i + 1..].to_string()),
        None => (String::new(), primitive.to_string()),
    }
}

impl DependencyTreeNode {
    pub fn new() -> DependencyTreeNode {
        DependencyTreeNode {
            node_id: uuid::Uuid::new_v4().to_string(),
            name: "root".to_string(),
            prefix_list: Vec::new(),
            children: Vec::new(),
            interval_list: Vec::new(),
            aggregated_block_list: Vec::new(),
            aggregated_util: Sul::new(SulMode::Rate),
        }
    }

    pub fn set_name(&mut self, primitive: &str) {
        let (prefix, name) = split_prefix(primitive);
        self.name = name;
        self.prefix_list.push(prefix);
    }

    /// Add a child, merging with an existing child of the same name: children
    /// merge recursively, prefixes union, block and interval lists concatenate.
    pub fn add_child(&mut self, child: DependencyTreeNode) {
        if let Some(mine) = self.children.iter_mut().find(|c| c.name == child.name) {
            for sub in child.children {
                mine.add_child(sub);
            }
            for prefix in child.prefix_list {
                if !mine.prefix_list.contains(&prefix) {
                    mine.prefix_list.push(prefix);
                }
            }
            mine.aggregated_block_list.extend(child.aggregated_block_list);
            mine.interval_list.extend(child.interval_list);
        } else {
            self.children.push(child);
        }
    }

    /// Create this node's aggregated block for one of its intervals: spans at
    /// least `[enter, leave]`, extends to the latest end of any child block,
    /// and starts from a deep copy of every child block's utilization points.
    pub fn add_interval_to_aggregated_list(&mut self, interval: &Interval) {
        let start_time = interval.enter.timestamp;
        let end_time = interval.leave.timestamp;
        let location = interval.location.as_str();
        let mut all_locations: BTreeSet<String> = BTreeSet::new();
        all_locations.insert(location.to_string());
        let mut block = AggregatedBlock::new(start_time, end_time);

        self.interval_list.push((start_time, end_time));

        let mut max_time = end_time;
        for child in &self.children {
            let mut agg_max = end_time;
            for child_block in &child.aggregated_block_list {
                if child_block.end_time > agg_max {
                    agg_max = child_block.end_time;
                }
                for (loc, points) in child_block.utilization.iter_locations() {
                    block.utilization.extend_location(loc, points);
                    all_locations.insert(loc.clone());
                }
            }
            max_time = max_time.max(agg_max);
        }

        block.end_time = max_time;
        block.first_primitive_name = interval.primitive.clone();
        block
            .utilization
            .add_interval(location, start_time, end_time, Some(&interval.primitive));
        block.all_locations = all_locations.into_iter().collect();
        self.aggregated_block_list.push(block);
    }

    /// Post-order finalization: sort blocks, greedily pack them onto lanes
    /// (a lane is reused when its last block ended before the next begins),
    /// and encode lane occupancy into `aggregated_util` where the value is
    /// the occupying block's index + 1.
    pub fn finalize_tree_node(&mut self) {
        if !self.aggregated_block_list.is_empty() {
            self.aggregated_block_list.sort_by_key(|b| b.start_time);

            let mut lane_end_time: BTreeMap<u32, i64> = BTreeMap::new();
            let mut next_lane: u32 = 1;
            // Sentinel forces the first block onto a fresh lane.
            let mut min_among: (i64, u32) =
                (self.aggregated_block_list[0].start_time + 1, next_lane);
            let mut all_lanes: Vec<u32> = Vec::new();

            for ind in 0..self.aggregated_block_list.len() {
                let (start, end) = {
                    let block = &mut self.aggregated_block_list[ind];
                    if !block.is_finalized {
                        let locations = block.all_locations.clone();
                        block.utilization.finalize(locations, false);
                        block.is_finalized = true;
                    }
                    (block.start_time, block.end_time)
                };

                let lane = if min_among.0 < start {
                    min_among.1
                } else {
                    let lane = next_lane;
                    all_lanes.push(lane);
                    next_lane += 1;
                    lane
                };
                let key = lane.to_string();
                for index in [start, end] {
                    self.aggregated_util.add_point(
                        &key,
                        CriticalPoint {
                            index,
                            counter: 0,
                            util: (ind + 1) as f64,
                            primitive: None,
                            enter: None,
                        },
                    );
                }
                lane_end_time.insert(lane, end);
                min_among = earliest_free_lane(&lane_end_time).unwrap_or(min_among);
            }

            let lanes: Vec<String> = all_lanes.iter().map(|l| l.to_string()).collect();
            self.aggregated_util.finalize(lanes, false);
        }

        for child in &mut self.children {
            child.finalize_tree_node();
        }
    }

    /// The serialized shape of the tree endpoint: ids, names, prefixes and
    /// per-node total busy time.
    pub fn tree_summary(&self) -> serde_json::Value {
        let total_util: i64 = self.interval_list.iter().map(|(e, l)| l - e).sum();
        json!({
            "nodeId": self.node_id,
            "name": self.name,
            "prefixList": self.prefix_list,
            "totalUtil": total_util,
            "children": self.children.iter().map(|c| c.tree_summary()).collect::<Vec<_>>(),
        })
    }

    pub fn find_node(&self, node_id: &str) -> Option<&DependencyTreeNode> {
        if self.node_id == node_id {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_node(node_id))
    }
}

impl Default for DependencyTreeNode {
    fn default() -> Self {
        Self::new()
    }
}

/// The lane whose last block ends earliest; the lowest-numbered lane wins
/// ties, matching the order lanes were created in.
fn earliest_free_lane(lane_end_time: &BTreeMap<u32, i64>) -> Option<(i64, u32)> {
    let mut best: Option<(i64, u32)> = None;
    for (&lane, &end) in lane_end_time {
        match best {
            Some((best_end, _)) if end >= best_end => {}
            _ => best = Some((end, lane)),
        }
    }
    best
}

/// Build the tree from interval roots, grouped by primitive in first-seen
/// order, merging same-named siblings level by level.
pub async fn build_dependency_tree(
    intervals: &[Interval],
    filter: DependencyFilter,
    log: &ClientLog,
) -> Option<DependencyTreeNode> {
    log.log("Building dependency tree").await;

    let mut groups: Vec<(String, Vec<usize>)> = Vec::new();
    let mut group_index: HashMap<String, usize> = HashMap::new();
    for interval in intervals {
        if interval.parent.is_none() && filter.includes(&interval.primitive) {
            let slot = *group_index
                .entry(interval.primitive.clone())
                .or_insert_with(|| {
                    groups.push((interval.primitive.clone(), Vec::new()));
                    groups.len() - 1
                });
            groups[slot].1.push(interval.id);
        }
    }

    let mut result: Option<DependencyTreeNode> = None;
    let mut count = 0u64;
    for (_, root_ids) in groups {
        for root_id in root_ids {
            let mut wrapper = DependencyTreeNode::new();
            let child = build_node(intervals, root_id, filter);
            let blocks = child.aggregated_block_list.clone();
            let spans = child.interval_list.clone();
            wrapper.add_child(child);
            wrapper.aggregated_block_list.extend(blocks);
            wrapper.interval_list.extend(spans);

            match result.as_mut() {
                None => result = Some(wrapper),
                Some(tree) => merge_trees(tree, wrapper),
            }
            count += 1;
            log.progress(count, "primitives").await;
            if count % 2_500 == 0 {
                tokio::task::yield_now().await;
            }
        }
    }

    if let Some(tree) = result.as_mut() {
        tree.finalize_tree_node();
    }
    result
}

fn build_node(intervals: &[Interval], id: usize, filter: DependencyFilter) -> DependencyTreeNode {
    let mut node = DependencyTreeNode::new();
    node.set_name(&intervals[id].primitive);
    for &child_id in &intervals[id].children {
        if filter.includes(&intervals[child_id].primitive) {
            node.add_child(build_node(intervals, child_id, filter));
        }
    }
    node.add_interval_to_aggregated_list(&intervals[id]);
    node
}

fn merge_trees(tree: &mut DependencyTreeNode, other: DependencyTreeNode) {
    if tree.name != other.name {
        return;
    }
    for child in other.children {
        tree.add_child(child);
    }
    tree.interval_list.extend(other.interval_list);
    tree.aggregated_block_list.extend(other.aggregated_block_list);
}
