pub mod dependency_tree;
pub mod guids;
pub mod interval_tree;
pub mod intervals;
pub mod parse;
pub mod sul;

use std::collections::BTreeMap;

use futures_util::{Stream, StreamExt};

use crate::client_log::ClientLog;
use crate::models::AttrValue;
use crate::store::{DatasetHandle, StoreError};
use crate::store::primitives::process_primitive;

use dependency_tree::{DependencyFilter, build_dependency_tree};
use guids::connect_intervals;
use interval_tree::IntervalTree;
use intervals::combine_intervals;
use parse::{Event, EventParser, natural_cmp};
use sul::build_suls;

// ═══════════════════════════════════════════════════════════════════
// Trace ingest pipeline
// ═══════════════════════════════════════════════════════════════════
//
// parse → combine intervals → interval index → guid links → utilization
// lists → dependency tree, as one strict sequence. Every stage computes into
// locals; the dataset is updated under a single short write lock at the end,
// so a client that observes the source file finish loading sees fully-built
// indexes and queries keep running against the previous state meanwhile.

/// Ingest one event dump into the dataset. The caller marks the source file
/// finished and saves afterwards; any error here means the caller should
/// purge the dataset.
pub async fn process_trace<S>(
    handle: &DatasetHandle,
    filter: DependencyFilter,
    debug: bool,
    mut lines: S,
    log: &ClientLog,
) -> Result<(), StoreError>
where
    S: Stream<Item = Result<String, StoreError>> + Unpin,
{
    log.log("Parsing trace events (.=2500 events)").await;

    let (mut primitives, mut links) = {
        let dataset = handle.data.read().await;
        (dataset.primitives.clone(), dataset.primitive_links.clone())
    };

    let mut parser = EventParser::new();
    let mut by_location: BTreeMap<String, Vec<(i64, Event)>> = BTreeMap::new();
    let mut new_primitives = 0u64;
    let mut seen_primitives = 0u64;

    while let Some(line) = lines.next().await {
        let line = line?;
        if let Some(event) = parser.feed_line(&line) {
            route_event(
                event,
                &mut by_location,
                &mut primitives,
                debug,
                &mut new_primitives,
                &mut seen_primitives,
            );
            log.progress(parser.stats.events, "events").await;
            if parser.stats.events % 2_500 == 0 {
                tokio::task::yield_now().await;
            }
        }
    }
    if let Some(event) = parser.finish() {
        route_event(
            event,
            &mut by_location,
            &mut primitives,
            debug,
            &mut new_primitives,
            &mut seen_primitives,
        );
    }

    let stats = parser.stats;
    log.log(format!("Finished processing {} events", stats.events))
        .await;
    log.log(format!(
        "New primitives: {new_primitives}, References to existing primitives: {seen_primitives}"
    ))
    .await;
    log.log(format!(
        "Metrics included: {}; skipped for no prior ENTER: {}; skipped for mismatch: {}",
        stats.included_metrics,
        stats.skipped_metrics_missing_prior,
        stats.skipped_metrics_mismatch
    ))
    .await;
    log.log(format!(
        "Additional attribute lines skipped: {}",
        stats.bad_attr_lines
    ))
    .await;
    log.log(format!(
        "Lines skipped because they are not yet supported: {}",
        stats.unsupported_skipped_lines
    ))
    .await;

    let mut location_names: Vec<String> = by_location.keys().cloned().collect();
    location_names.sort_by(|a, b| natural_cmp(a, b));

    // Stable per-location order: primary timestamp, insertion order on ties.
    for events in by_location.values_mut() {
        events.sort_by_key(|(ts, _)| *ts);
    }

    let combined = combine_intervals(by_location, log).await;
    let mut intervals = combined.intervals;

    log.log("Building interval tree index").await;
    let index = IntervalTree::build(&intervals);
    log.log(format!("Finished indexing {} intervals", index.len()))
        .await;

    let (guids, _) = connect_intervals(
        &mut intervals,
        &index,
        &mut primitives,
        &mut links,
        debug,
        log,
    )
    .await;

    let sul_output = build_suls(&intervals, log).await;

    let tree = build_dependency_tree(&intervals, filter, log).await;

    let proc_metrics = parser.proc_metrics;
    let metric_names = parser.metric_names;
    {
        let mut dataset = handle.data.write().await;
        dataset.primitives = primitives;
        dataset.primitive_links = links;
        for (name, samples) in proc_metrics {
            dataset.proc_metrics.entry(name).or_default().extend(samples);
        }
        for name in metric_names {
            if !dataset.info.proc_metric_list.contains(&name) {
                dataset.info.proc_metric_list.push(name);
            }
        }
        dataset.info.location_names = location_names;
        dataset.info.interval_domain = combined.domain;
        dataset.info.interval_duration_domain = sul_output.duration_domains;
        dataset.intervals = intervals;
        dataset.guids = guids;
        dataset.interval_index = Some(index);
        dataset.suls = Some(sul_output.suls);
        dataset.dependency_tree = tree;
    }
    Ok(())
}

fn route_event(
    event: Event,
    by_location: &mut BTreeMap<String, Vec<(i64, Event)>>,
    primitives: &mut BTreeMap<String, crate::models::Primitive>,
    debug: bool,
    new_primitives: &mut u64,
    seen_primitives: &mut u64,
) {
    if let Some(AttrValue::Str(name)) = event.attrs.get("Primitive") {
        let name = name.clone();
        let (primitive, is_new) = process_primitive(primitives, &name, Some("otf2"), debug);
        if is_new {
            *new_primitives += 1;
        } else {
            *seen_primitives += 1;
        }
        if debug {
            *primitive.event_count.get_or_insert(0) += 1;
        }
    }
    by_location
        .entry(event.location.clone())
        .or_default()
        .push((event.timestamp, event));
}
