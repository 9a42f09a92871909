use std::collections::BTreeMap;

use crate::client_log::ClientLog;
use crate::models::{AttrValue, Interval, IntervalSide};

use super::parse::{Event, EventKind};

const MISSING_PRIMITIVE: &str = "(primitive name missing)";

#[derive(Debug, Clone, Copy, Default)]
pub struct CombineStats {
    pub intervals: u64,
    pub missing_primitives: u64,
    pub mismatched_intervals: u64,
    pub leaves_without_enter: u64,
    pub trailing_enters: u64,
    pub location_mismatches: u64,
}

pub struct CombineOutput {
    pub intervals: Vec<Interval>,
    /// `[minEnter, maxLeave]` over every emitted interval.
    pub domain: Option<(i64, i64)>,
    pub stats: CombineStats,
}

/// Pair each location's sorted ENTER/LEAVE events into intervals.
///
/// Nesting is flattened into non-overlapping per-location runs: an ENTER on a
/// non-empty stack synthesizes a LEAVE for the open event one tick earlier,
/// and when a nested interval closes, the suspended ENTER is moved one tick
/// after the close so the parent's next run resumes at a strictly later time.
pub async fn combine_intervals(
    events_by_location: BTreeMap<String, Vec<(i64, Event)>>,
    log: &ClientLog,
) -> CombineOutput {
    log.log("Combining enter / leave events into intervals (.=2500 intervals)")
        .await;

    let mut intervals: Vec<Interval> = Vec::new();
    let mut stats = CombineStats::default();
    let mut domain: Option<(i64, i64)> = None;

    for (_location, events) in events_by_location {
        let mut stack: Vec<Event> = Vec::new();
        for (_, event) in events {
            let mut current: Option<Interval> = None;
            let interval_id = intervals.len();
            match event.kind {
                EventKind::Enter => {
                    if let Some(open) = stack.last() {
                        // Close the open run just before the nested one starts,
                        // carrying the incoming event's metric samples.
                        let mut dummy = open.clone();
                        dummy.kind = EventKind::Leave;
                        dummy.timestamp = event.timestamp - 1;
                        dummy.metrics = event.metrics.clone();
                        current = Some(build_interval(open, &dummy, interval_id, &mut stats));
                    }
                    stack.push(event);
                }
                EventKind::Leave => match stack.pop() {
                    None => {
                        let name = event
                            .attrs
                            .get("Primitive")
                            .map(AttrValue::as_key)
                            .unwrap_or_default();
                        tracing::warn!(
                            "omitting LEAVE event without a prior ENTER event ({name})"
                        );
                        log.log(format!(
                            "WARNING: omitting LEAVE event without a prior ENTER event ({name})"
                        ))
                        .await;
                        stats.leaves_without_enter += 1;
                        continue;
                    }
                    Some(enter) => {
                        current = Some(build_interval(&enter, &event, interval_id, &mut stats));
                        if let Some(suspended) = stack.last_mut() {
                            suspended.timestamp = event.timestamp + 1;
                        }
                    }
                },
            }

            if let Some(interval) = current {
                let (lo, hi) = domain.unwrap_or((i64::MAX, i64::MIN));
                domain = Some((
                    lo.min(interval.enter.timestamp),
                    hi.max(interval.leave.timestamp),
                ));
                intervals.push(interval);
                stats.intervals += 1;
                log.progress(stats.intervals, "intervals").await;
                if stats.intervals % 2_500 == 0 {
                    tokio::task::yield_now().await;
                }
            }
        }

        if let Some(open) = stack.last() {
            let name = open
                .attrs
                .get("Primitive")
                .map(AttrValue::as_key)
                .unwrap_or_default();
            tracing::warn!("omitting trailing ENTER event ({name})");
            log.log(format!("WARNING: omitting trailing ENTER event ({name})"))
                .await;
            stats.trailing_enters += 1;
        }
    }

    log.log(format!(
        "Finished creating {} intervals; {} had no primitive name; {} had mismatching primitives (ENTER primitive used)",
        stats.intervals, stats.missing_primitives, stats.mismatched_intervals
    ))
    .await;

    CombineOutput {
        intervals,
        domain,
        stats,
    }
}

/// Merge an ENTER/LEAVE pair into one interval. Attributes present on both
/// sides with equal values lift to the interval root; anything else stays in
/// the corresponding side object.
fn build_interval(
    enter: &Event,
    leave: &Event,
    id: usize,
    stats: &mut CombineStats,
) -> Interval {
    if enter.location != leave.location {
        tracing::warn!(
            "ENTER and LEAVE have different locations ({} vs {})",
            enter.location,
            leave.location
        );
        stats.location_mismatches += 1;
    }

    let mut shared = BTreeMap::new();
    let mut enter_side = IntervalSide {
        timestamp: enter.timestamp,
        metrics: enter.metrics.clone(),
        attrs: BTreeMap::new(),
    };
    let mut leave_side = IntervalSide {
        timestamp: leave.timestamp,
        metrics: leave.metrics.clone(),
        attrs: BTreeMap::new(),
    };

    let keys: std::collections::BTreeSet<&String> =
        enter.attrs.keys().chain(leave.attrs.keys()).collect();
    for key in keys {
        match (enter.attrs.get(key), leave.attrs.get(key)) {
            (Some(ev), None) => {
                enter_side.attrs.insert(key.clone(), ev.clone());
            }
            (None, Some(lv)) => {
                leave_side.attrs.insert(key.clone(), lv.clone());
            }
            (Some(ev), Some(lv)) if ev == lv => {
                shared.insert(key.clone(), ev.clone());
            }
            (Some(ev), Some(lv)) => {
                enter_side.attrs.insert(key.clone(), ev.clone());
                leave_side.attrs.insert(key.clone(), lv.clone());
            }
            (None, None) => unreachable!(),
        }
    }

    // Primitive coherence: lifted name wins; on disagreement, trust ENTER.
    let primitive = match shared.remove("Primitive") {
        Some(value) => value.as_key(),
        None => {
            let enter_prim = enter_side.attrs.get("Primitive");
            let leave_prim = leave_side.attrs.get("Primitive");
            match (enter_prim, leave_prim) {
                (Some(ep), Some(_)) => {
                    stats.mismatched_intervals += 1;
                    ep.as_key()
                }
                _ => {
                    stats.missing_primitives += 1;
                    MISSING_PRIMITIVE.to_string()
                }
            }
        }
    };

    Interval {
        id,
        location: enter.location.clone(),
        primitive,
        enter: enter_side,
        leave: leave_side,
        parent: None,
        children: Vec::new(),
        shared,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trace::parse::EventParser;

    pub(crate) async fn combine_lines(lines: &[&str]) -> CombineOutput {
        let mut parser = EventParser::new();
        let mut by_location: BTreeMap<String, Vec<(i64, Event)>> = BTreeMap::new();
        let mut route = |event: Event, map: &mut BTreeMap<String, Vec<(i64, Event)>>| {
            map.entry(event.location.clone())
                .or_default()
                .push((event.timestamp, event));
        };
        for line in lines {
            if let Some(event) = parser.feed_line(line) {
                route(event, &mut by_location);
            }
        }
        if let Some(event) = parser.finish() {
            route(event, &mut by_location);
        }
        for events in by_location.values_mut() {
            events.sort_by_key(|(ts, _)| *ts);
        }
        combine_intervals(by_location, &ClientLog::console()).await
    }

    #[tokio::test]
    async fn nested_intervals_are_flattened() {
        let out = combine_lines(&[
            "ENTER 1 100 Region: \"A\"",
            "ENTER 1 150 Region: \"B\"",
            "LEAVE 1 200 Region: \"B\"",
            "LEAVE 1 300 Region: \"A\"",
        ])
        .await;
        assert_eq!(out.intervals.len(), 3);
        assert_eq!(out.domain, Some((100, 300)));

        // A's first run ends one tick before B starts; its second resumes one
        // tick after B leaves.
        let a1 = &out.intervals[0];
        assert_eq!((a1.enter.timestamp, a1.leave.timestamp), (100, 149));
        assert_eq!(a1.primitive, "A");
        let b = &out.intervals[1];
        assert_eq!((b.enter.timestamp, b.leave.timestamp), (150, 200));
        assert_eq!(b.primitive, "B");
        let a2 = &out.intervals[2];
        assert_eq!((a2.enter.timestamp, a2.leave.timestamp), (201, 300));
        assert_eq!(a2.primitive, "A");
    }

    #[tokio::test]
    async fn leave_without_enter_is_skipped_with_warning() {
        let out = combine_lines(&[
            "LEAVE 1 100 Region: \"X\"",
            "ENTER 1 200 Region: \"Y\"",
            "LEAVE 1 300 Region: \"Y\"",
        ])
        .await;
        assert_eq!(out.intervals.len(), 1);
        assert_eq!(out.intervals[0].primitive, "Y");
        assert_eq!(out.stats.leaves_without_enter, 1);
        assert_eq!(out.domain, Some((200, 300)));
    }

    #[tokio::test]
    async fn trailing_enter_is_dropped_with_warning() {
        let out = combine_lines(&[
            "ENTER 1 100 Region: \"A\"",
            "LEAVE 1 200 Region: \"A\"",
            "ENTER 1 300 Region: \"B\"",
        ])
        .await;
        assert_eq!(out.intervals.len(), 1);
        assert_eq!(out.stats.trailing_enters, 1);
    }

    #[tokio::test]
    async fn equal_attributes_lift_to_the_root() {
        let out = combine_lines(&[
            "ENTER 1 100 Region: \"A\"",
            "  ADDITIONAL ATTRIBUTES: (\"GUID\" <0>; UINT64; 9), (\"tag\" <0>; STRING; hot)",
            "LEAVE 1 200 Region: \"A\"",
            "  ADDITIONAL ATTRIBUTES: (\"GUID\" <0>; UINT64; 9), (\"tag\" <0>; STRING; cold)",
        ])
        .await;
        let interval = &out.intervals[0];
        assert_eq!(interval.shared.get("GUID"), Some(&AttrValue::Int(9)));
        assert_eq!(
            interval.enter.attrs.get("tag"),
            Some(&AttrValue::Str("hot".to_string()))
        );
        assert_eq!(
            interval.leave.attrs.get("tag"),
            Some(&AttrValue::Str("cold".to_string()))
        );
        assert!(!interval.shared.contains_key("tag"));
    }

    #[tokio::test]
    async fn mismatched_primitive_uses_enter_name() {
        let out = combine_lines(&[
            "ENTER 1 100 Region: \"A\"",
            "LEAVE 1 200 Region: \"B\"",
        ])
        .await;
        let interval = &out.intervals[0];
        assert_eq!(interval.primitive, "A");
        assert_eq!(out.stats.mismatched_intervals, 1);
        // Both sides keep their own names when they disagree.
        assert_eq!(
            interval.enter.attrs.get("Primitive"),
            Some(&AttrValue::Str("A".to_string()))
        );
        assert_eq!(
            interval.leave.attrs.get("Primitive"),
            Some(&AttrValue::Str("B".to_string()))
        );
    }

    #[tokio::test]
    async fn interval_ids_are_dense() {
        let out = combine_lines(&[
            "ENTER 1 100 Region: \"A\"",
            "LEAVE 1 200 Region: \"A\"",
            "ENTER 2 150 Region: \"C\"",
            "LEAVE 2 250 Region: \"C\"",
        ])
        .await;
        let ids: Vec<usize> = out.intervals.iter().map(|i| i.id).collect();
        assert_eq!(ids, vec![0, 1]);
    }
}
