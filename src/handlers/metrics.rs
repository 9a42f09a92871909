use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use crate::AppState;
use crate::trace::sul::SulMode;

use super::{stream_json, validate_dataset};

// ── /datasets/{id}/metrics — metric names seen in the trace ──

pub async fn get_metric_list(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &["otf2"], &[], false).await?;
    let dataset = handle.data.read().await;
    Ok(Json(dataset.info.proc_metric_list.clone()))
}

// ── /datasets/{id}/metrics/{metric} — raw non-PAPI samples ──

#[derive(Debug, Deserialize)]
pub struct RangeParams {
    pub begin: Option<i64>,
    pub end: Option<i64>,
}

pub async fn get_metric_values(
    State(state): State<AppState>,
    Path((dataset_id, metric)): Path<(String, String)>,
    Query(params): Query<RangeParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &["otf2"], &["otf2"], false).await?;
    {
        let dataset = handle.data.read().await;
        if !dataset.proc_metrics.contains_key(&metric) {
            return Err((
                StatusCode::NOT_FOUND,
                format!("No sampled data for metric: {metric}"),
            ));
        }
    }

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
        if let Some(samples) = dataset.proc_metrics.get(&metric) {
            for sample in samples.range(begin..=end).map(|(_, s)| s) {
                let mut chunk = if first { String::new() } else { ",".to_string() };
                first = false;
                match serde_json::to_string(sample) {
                    Ok(body) => chunk.push_str(&body),
                    Err(_) => continue,
                }
                if tx.send(chunk).await.is_err() {
                    return;
                }
            }
        }
        let _ = tx.send("]".to_string()).await;
    });

    Ok(stream_json(rx))
}

// ── /datasets/{id}/metrics/{metric}/summary — binned rate summary ──

#[derive(Debug, Deserialize)]
pub struct SummaryParams {
    #[serde(default = "default_bins")]
    pub bins: usize,
    pub begin: Option<i64>,
    pub end: Option<i64>,
    pub location: Option<String>,
}

fn default_bins() -> usize {
    100
}

pub async fn metric_summary(
    State(state): State<AppState>,
    Path((dataset_id, metric)): Path<(String, String)>,
    Query(params): Query<SummaryParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &["otf2"], &["otf2"], false).await?;
    let dataset = handle.data.read().await;
    let suls = dataset.suls.as_ref().ok_or((
        StatusCode::NOT_FOUND,
        "Dataset does not contain utilization data".to_string(),
    ))?;
    let sul = suls.metrics.get(&metric).ok_or((
        StatusCode::NOT_FOUND,
        format!("No utilization data for metric: {metric}"),
    ))?;

    let (default_begin, default_end) = dataset.domain();
    let begin = params.begin.unwrap_or(default_begin);
    let end = params.end.unwrap_or(default_end);
    let bins = params.bins.max(1);

    let data = sul
        .metric_histogram(bins, begin, end, params.location.as_deref())
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;
    Ok(Json(json!({
        "data": data,
        "metadata": { "begin": begin, "end": end, "bins": bins },
    })))
}

// ── /datasets/{id}/utilizationHistogram ──

#[derive(Debug, Deserialize)]
pub struct HistogramParams {
    #[serde(default = "default_bins")]
    pub bins: usize,
    pub begin: Option<i64>,
    pub end: Option<i64>,
    /// One location, or a comma-separated union via `locations`.
    pub location: Option<String>,
    pub locations: Option<String>,
    pub primitive: Option<String>,
}

pub async fn utilization_histogram(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    Query(params): Query<HistogramParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &["otf2"], &["otf2"], false).await?;
    let dataset = handle.data.read().await;
    let suls = dataset.suls.as_ref().ok_or((
        StatusCode::NOT_FOUND,
        "Dataset does not contain utilization data".to_string(),
    ))?;

    let (default_begin, default_end) = dataset.domain();
    let begin = params.begin.unwrap_or(default_begin);
    let end = params.end.unwrap_or(default_end);
    let bins = params.bins.max(1);

    let locations: Option<Vec<String>> = params
        .locations
        .as_ref()
        .map(|l| l.split(',').map(str::to_string).collect())
        .or_else(|| params.location.as_ref().map(|l| vec![l.clone()]));

    if locations.is_some() && params.primitive.is_some() {
        return Err((
            StatusCode::NOT_IMPLEMENTED,
            "Utilization histograms for both locations and primitives not yet supported"
                .to_string(),
        ));
    }

    let data: Vec<f64> = if let Some(primitive) = &params.primitive {
        let sul = suls.primitives.get(primitive).ok_or((
            StatusCode::NOT_FOUND,
            format!("No utilization data for primitive: {primitive}"),
        ))?;
        sul.utilization_histogram(bins, begin, end)
    } else if let Some(locations) = &locations {
        debug_assert_eq!(suls.intervals.mode(), SulMode::Counter);
        let mut totals = vec![0.0; bins];
        for location in locations {
            let values = suls
                .intervals
                .utilization_for_location(bins, begin, end, location)
                .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;
            for (total, v) in totals.iter_mut().zip(values) {
                *total += v;
            }
        }
        totals
    } else {
        suls.intervals.utilization_histogram(bins, begin, end)
    };

    Ok(Json(json!({
        "data": data,
        "metadata": { "begin": begin, "end": end, "bins": bins },
    })))
}
