use std::collections::BTreeMap;

use crate::client_log::ClientLog;
use crate::models::{Interval, Primitive, PrimitiveLink};
use crate::store::primitives::add_primitive_child;

use super::interval_tree::IntervalTree;

#[derive(Debug, Clone, Copy, Default)]
pub struct LinkStats {
    pub linked: u64,
    pub missing: u64,
    pub new_links: u64,
    pub seen_links: u64,
}

/// Connect intervals into a causal forest via their `GUID` / `Parent GUID`
/// attributes.
///
/// GUIDs register in leave-time ascending order, so within one GUID's id list
/// "most recent" means latest-finishing. Linking scans a parent GUID's list
/// most-recent-first and takes the first candidate with `enter ≤ child.enter`:
/// the latest invocation that was already running when the child began, even
/// when that parent outlives the child on another location.
pub async fn connect_intervals(
    intervals: &mut [Interval],
    index: &IntervalTree,
    primitives: &mut BTreeMap<String, Primitive>,
    primitive_links: &mut BTreeMap<String, PrimitiveLink>,
    debug: bool,
    log: &ClientLog,
) -> (BTreeMap<String, Vec<usize>>, LinkStats) {
    log.log("Connecting intervals with the same GUID (.=2500 intervals)")
        .await;

    let mut guids: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    let mut stats = LinkStats::default();

    for id in index.iter_end_order() {
        if let Some(guid) = intervals[id].guid() {
            guids.entry(guid).or_default().push(id);
        }
    }

    for id in index.iter_end_order() {
        let parent_guid = intervals[id].parent_guid();
        let mut found_prior = false;
        if let Some(candidates) = parent_guid.as_ref().and_then(|g| guids.get(g)) {
            let child_enter = intervals[id].enter.timestamp;
            let parent_id = candidates
                .iter()
                .rev()
                .copied()
                .find(|&p| p != id && intervals[p].enter.timestamp <= child_enter);
            if let Some(parent_id) = parent_id {
                found_prior = true;
                stats.linked += 1;
                intervals[id].parent = Some(parent_id);
                intervals[parent_id].children.push(id);

                // Note the parent→child edge in the primitive graph as well.
                let child_prim = intervals[id].primitive.clone();
                let parent_prim = intervals[parent_id].primitive.clone();
                let new = add_primitive_child(
                    primitives,
                    primitive_links,
                    &parent_prim,
                    &child_prim,
                    Some("otf2"),
                    debug,
                );
                if new {
                    stats.new_links += 1;
                } else {
                    stats.seen_links += 1;
                }
            }
        }
        if !found_prior {
            stats.missing += 1;
        }

        let processed = stats.linked + stats.missing;
        log.progress(processed, "intervals").await;
        if processed % 2_500 == 0 {
            tokio::task::yield_now().await;
        }
    }

    log.log("Finished connecting intervals").await;
    log.log(format!(
        "Interval links created: {}, Intervals without prior parent GUIDs: {}",
        stats.linked, stats.missing
    ))
    .await;
    log.log(format!(
        "New primitive links based on GUIDs: {}, Observed existing links: {}",
        stats.new_links, stats.seen_links
    ))
    .await;

    (guids, stats)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client_log::ClientLog;
    use crate::models::{AttrValue, IntervalSide};

    fn interval(id: usize, location: &str, primitive: &str, enter: i64, leave: i64) -> Interval {
        Interval {
            id,
            location: location.to_string(),
            primitive: primitive.to_string(),
            enter: IntervalSide {
                timestamp: enter,
                ..Default::default()
            },
            leave: IntervalSide {
                timestamp: leave,
                ..Default::default()
            },
            parent: None,
            children: Vec::new(),
            shared: BTreeMap::new(),
        }
    }

    fn with_guids(mut iv: Interval, guid: i64, parent_guid: i64) -> Interval {
        iv.shared
            .insert("GUID".to_string(), AttrValue::Int(guid));
        iv.shared
            .insert("Parent GUID".to_string(), AttrValue::Int(parent_guid));
        iv
    }

    #[tokio::test]
    async fn links_child_to_parent_across_locations() {
        let mut intervals = vec![
            with_guids(interval(0, "1", "P", 100, 400), 1, 0),
            with_guids(interval(1, "2", "C", 200, 300), 2, 1),
        ];
        let index = IntervalTree::build(&intervals);
        let mut primitives = BTreeMap::new();
        let mut links = BTreeMap::new();
        let (guids, stats) = connect_intervals(
            &mut intervals,
            &index,
            &mut primitives,
            &mut links,
            false,
            &ClientLog::console(),
        )
        .await;

        assert_eq!(intervals[1].parent, Some(0));
        assert_eq!(intervals[0].children, vec![1]);
        assert_eq!(stats.linked, 1);
        // P has ParentGUID 0, which never registered → it stays a root.
        assert_eq!(intervals[0].parent, None);
        assert_eq!(stats.missing, 1);
        assert!(links.contains_key("P_C"));
        assert_eq!(primitives.get("P").unwrap().children, vec!["C".to_string()]);
        assert_eq!(primitives.get("C").unwrap().parents, vec!["P".to_string()]);
        assert_eq!(guids.get("1"), Some(&vec![0usize]));
    }

    #[tokio::test]
    async fn picks_most_recent_parent_not_entering_later() {
        // Two invocations share a GUID; the child must attach to the one that
        // entered at or before its own enter.
        let mut intervals = vec![
            with_guids(interval(0, "1", "P", 100, 150), 1, 0),
            with_guids(interval(1, "1", "P", 300, 500), 1, 0),
            with_guids(interval(2, "2", "C", 200, 250), 2, 1),
        ];
        let index = IntervalTree::build(&intervals);
        let mut primitives = BTreeMap::new();
        let mut links = BTreeMap::new();
        connect_intervals(
            &mut intervals,
            &index,
            &mut primitives,
            &mut links,
            false,
            &ClientLog::console(),
        )
        .await;

        // P2 registered later but entered after C, so the scan settles on P1.
        assert_eq!(intervals[2].parent, Some(0));
        assert_eq!(intervals[0].children, vec![2]);
        assert!(intervals[1].children.is_empty());
    }

    #[tokio::test]
    async fn parent_entering_after_child_is_rejected() {
        let mut intervals = vec![
            with_guids(interval(0, "1", "P", 300, 400), 1, 0),
            with_guids(interval(1, "2", "C", 100, 200), 2, 1),
        ];
        let index = IntervalTree::build(&intervals);
        let mut primitives = BTreeMap::new();
        let mut links = BTreeMap::new();
        let (_, stats) = connect_intervals(
            &mut intervals,
            &index,
            &mut primitives,
            &mut links,
            false,
            &ClientLog::console(),
        )
        .await;
        assert_eq!(intervals[1].parent, None);
        assert_eq!(stats.linked, 0);
    }
}
