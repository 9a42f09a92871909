use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use crate::AppState;
use crate::models::Interval;

use super::{stream_json, validate_dataset};

// ── /datasets/{id}/intervals — streamed, filtered listing ──

#[derive(Debug, Deserialize)]
pub struct IntervalQueryParams {
    pub begin: Option<i64>,
    pub end: Option<i64>,
    #[serde(rename = "minDuration")]
    pub min_duration: Option<i64>,
    #[serde(rename = "maxDuration")]
    pub max_duration: Option<i64>,
    pub location: Option<String>,
    pub guid: Option<String>,
    pub primitive: Option<String>,
}

impl IntervalQueryParams {
    fn admits(&self, interval: &Interval) -> bool {
        if let Some(location) = &self.location {
            if &interval.location != location {
                return false;
            }
        }
        if let Some(primitive) = &self.primitive {
            if &interval.primitive != primitive {
                return false;
            }
        }
        if let Some(guid) = &self.guid {
            if interval.guid().as_deref() != Some(guid.as_str()) {
                return false;
            }
        }
        if self.min_duration.is_some() || self.max_duration.is_some() {
            let length = interval.duration();
            if let Some(min) = self.min_duration {
                if length < min {
                    return false;
                }
            }
            if let Some(max) = self.max_duration {
                if length > max {
                    return false;
                }
            }
        }
        true
    }
}

pub async fn get_intervals(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    Query(params): Query<IntervalQueryParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &["otf2"], &["otf2"], false).await?;

    let (tx, rx) = tokio::sync::mpsc::channel::<String>(64);
    tokio::spawn(async move {
        let dataset = handle.data.read().await;
        let (default_begin, default_end) = dataset.domain();
        let begin = params.begin.unwrap_or(default_begin);
        let end = params.end.unwrap_or(default_end);

        if tx.send("[".to_string()).await.is_err() {
            return;
        }
        let mut first = true;
        if let Some(index) = &dataset.interval_index {
            for id in index.iter_overlap(begin, end) {
                let interval = &dataset.intervals[id];
                if !params.admits(interval) {
                    continue;
                }
                let mut chunk = if first { String::new() } else { ",".to_string() };
                first = false;
                match serde_json::to_string(interval) {
                    Ok(body) => chunk.push_str(&body),
                    Err(err) => {
                        tracing::error!("failed to serialize interval {id}: {err}");
                        continue;
                    }
                }
                if tx.send(chunk).await.is_err() {
                    return; // client went away; stop streaming
                }
            }
        }
        let _ = tx.send("]".to_string()).await;
    });

    Ok(stream_json(rx))
}

// ── /datasets/{id}/intervals/{intervalId} ──

pub async fn get_interval(
    State(state): State<AppState>,
    Path((dataset_id, interval_id)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &["otf2"], &["otf2"], false).await?;
    let dataset = handle.data.read().await;
    let interval = interval_id
        .parse::<usize>()
        .ok()
        .and_then(|id| dataset.intervals.get(id))
        .cloned();
    Ok(Json(interval))
}

// ── /datasets/{id}/intervals/{intervalId}/trace ──

#[derive(Debug, Deserialize)]
pub struct TraceParams {
    pub begin: Option<i64>,
    pub end: Option<i64>,
}

fn trace_entry(interval: &Interval, child_id: Option<usize>) -> String {
    let mut body = json!({
        "enter": interval.enter.timestamp,
        "leave": interval.leave.timestamp,
        "location": interval.location,
    });
    match child_id {
        Some(child) => body["child"] = json!(child.to_string()),
        None => body["parent"] = json!(interval.parent.map(|p| p.to_string())),
    }
    format!("\"{}\":{}", interval.id, body)
}

/// Stream `{ancestors, descendants}` around one interval, clipped to the
/// queried window. Ancestors walk parent links backward, keeping one
/// offscreen node on each side so clients can draw lines out of the window;
/// descendants BFS the children, descending only through intervals that end
/// inside the window.
pub async fn interval_trace(
    State(state): State<AppState>,
    Path((dataset_id, interval_id)): Path<(String, String)>,
    Query(params): Query<TraceParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &["otf2"], &["otf2"], false).await?;
    {
        let dataset = handle.data.read().await;
        let valid = interval_id
            .parse::<usize>()
            .ok()
            .map(|id| id < dataset.intervals.len())
            .unwrap_or(false);
        if !valid {
            return Err((StatusCode::NOT_FOUND, "Interval not found".to_string()));
        }
    }
    let target: usize = interval_id.parse().unwrap_or(0);

    let (tx, rx) = tokio::sync::mpsc::channel::<String>(64);
    tokio::spawn(async move {
        let dataset = handle.data.read().await;
        let (default_begin, default_end) = dataset.domain();
        let begin = params.begin.unwrap_or(default_begin);
        let end = params.end.unwrap_or(default_end);
        let intervals = &dataset.intervals;

        if tx.send("{\"ancestors\":{".to_string()).await.is_err() {
            return;
        }
        let mut chunks: Vec<String> = Vec::new();

        // Phase 1: rewind past ancestors that start beyond the window.
        let mut last: Option<usize> = None;
        let mut current = target;
        while intervals[current].parent.is_some() && intervals[current].enter.timestamp > end {
            last = Some(current);
            current = intervals[current].parent.unwrap_or(current);
        }
        // Phase 2: if we rewound, keep the last skipped interval so a line can
        // be drawn offscreen to the right.
        if current != target {
            if let Some(last) = last {
                chunks.push(trace_entry(&intervals[last], None));
            }
        }
        // Phase 3: walk upward while ancestors still reach into the window.
        let mut cursor = Some(current);
        while let Some(id) = cursor {
            if intervals[id].leave.timestamp < begin {
                break;
            }
            chunks.push(trace_entry(&intervals[id], last));
            last = Some(id);
            cursor = intervals[id].parent;
        }
        // Phase 4: one offscreen-left ancestor, for the same reason.
        if let Some(id) = cursor {
            chunks.push(trace_entry(&intervals[id], last));
        }

        if tx.send(chunks.join(",")).await.is_err() {
            return;
        }
        if tx.send("},\"descendants\":{".to_string()).await.is_err() {
            return;
        }

        // Descendants: BFS, emitting nodes that reach into the window (or
        // whose direct child does), descending while the interval ends before
        // the window does.
        let mut chunks: Vec<String> = Vec::new();
        let mut queue: std::collections::VecDeque<usize> = std::collections::VecDeque::new();
        let mut seen: std::collections::BTreeSet<usize> = std::collections::BTreeSet::new();
        queue.push_back(target);
        seen.insert(target);
        while let Some(id) = queue.pop_front() {
            let interval = &intervals[id];
            let mut emit = interval.leave.timestamp >= begin;
            if !emit {
                emit = interval
                    .children
                    .iter()
                    .any(|&c| intervals[c].enter.timestamp >= begin);
            }
            if emit {
                let body = json!({
                    "enter": interval.enter.timestamp,
                    "leave": interval.leave.timestamp,
                    "location": interval.location,
                    "parent": interval.parent.map(|p| p.to_string()),
                });
                chunks.push(format!("\"{}\":{}", interval.id, body));
            }
            if interval.leave.timestamp <= end {
                for &child in &interval.children {
                    if seen.insert(child) {
                        queue.push_back(child);
                    }
                }
            }
        }
        if tx.send(chunks.join(",")).await.is_err() {
            return;
        }
        let _ = tx.send("}}".to_string()).await;
    });

    Ok(stream_json(rx))
}

// ── /datasets/{id}/primitives/primitiveTraceForward ──

#[derive(Debug, Deserialize)]
pub struct TraceForwardParams {
    #[serde(rename = "nodeId")]
    pub node_id: String,
    #[serde(default = "default_bins")]
    pub bins: usize,
    pub begin: Option<i64>,
    pub end: Option<i64>,
    /// Comma-separated lane ids; all lanes when omitted.
    pub locations: Option<String>,
}

fn default_bins() -> usize {
    100
}

/// Coarse forward view from a dependency-tree node: for each lane in the
/// node's occurrence map, every block visible in the window becomes one
/// record with a sub-histogram from the block's own utilization.
pub async fn primitive_trace_forward(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    Query(params): Query<TraceForwardParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &["otf2"], &["otf2"], false).await?;
    let dataset = handle.data.read().await;
    let tree = dataset.dependency_tree.as_ref().ok_or((
        StatusCode::NOT_FOUND,
        "Dataset does not contain a dependency tree".to_string(),
    ))?;
    let node = tree.find_node(&params.node_id).ok_or((
        StatusCode::NOT_FOUND,
        format!("No dependency tree node: {}", params.node_id),
    ))?;

    let (default_begin, default_end) = dataset.domain();
    let begin = params.begin.unwrap_or(default_begin);
    let end = params.end.unwrap_or(default_end);
    let bins = params.bins.max(1);
    let lane_filter: Option<Vec<String>> = params
        .locations
        .as_ref()
        .map(|l| l.split(',').map(str::to_string).collect());

    let mut records = Vec::new();
    for lane in node.aggregated_util.locations() {
        if let Some(filter) = &lane_filter {
            if !filter.contains(lane) {
                continue;
            }
        }
        let values = node
            .aggregated_util
            .utilization_for_location(bins, begin, end, lane)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

        // One record per distinct non-zero run of the lane's block index.
        let mut run_start = 0usize;
        let mut run_value = 0.0f64;
        let flush = |value: f64, from: usize, to: usize, out: &mut Vec<serde_json::Value>| {
            if value <= 0.0 {
                return;
            }
            let block_index = value as usize - 1;
            let Some(block) = node.aggregated_block_list.get(block_index) else {
                return;
            };
            let start_time = block.start_time.max(begin);
            let end_time = block.end_time.min(end);
            if end_time <= start_time {
                return;
            }
            let sub_bins = (to - from).max(1);
            let util = block
                .utilization
                .utilization_histogram(sub_bins, start_time, end_time);
            out.push(json!({
                "startTime": start_time,
                "endTime": end_time,
                "name": block.first_primitive_name,
                "location": lane,
                "util": util,
            }));
        };
        for (i, &value) in values.iter().enumerate() {
            if value != run_value {
                flush(run_value, run_start, i, &mut records);
                run_value = value;
                run_start = i;
            }
        }
        flush(run_value, run_start, values.len(), &mut records);
    }

    Ok(Json(json!({
        "data": records,
        "metadata": { "begin": begin, "end": end, "bins": bins },
    })))
}

// ── /datasets/{id}/getDependencyTree ──

pub async fn get_dependency_tree(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &["otf2"], &["otf2"], false).await?;
    let dataset = handle.data.read().await;
    match &dataset.dependency_tree {
        Some(tree) => Ok(Json(tree.tree_summary())),
        None => Err((
            StatusCode::NOT_FOUND,
            "Dataset does not contain a dependency tree".to_string(),
        )),
    }
}
