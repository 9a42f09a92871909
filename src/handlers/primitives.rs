use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use crate::AppState;
use crate::trace::sul::HISTOGRAM_LOCATION;

use super::validate_dataset;

// ── /datasets/{id}/primitives ──

pub async fn get_primitives(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &[], &[], false).await?;
    let dataset = handle.data.read().await;
    Ok(Json(dataset.primitives.clone()))
}

pub async fn get_primitive(
    State(state): State<AppState>,
    Path((dataset_id, primitive)): Path<(String, String)>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &[], &[], false).await?;
    let dataset = handle.data.read().await;
    match dataset.primitives.get(&primitive) {
        Some(record) => Ok(Json(record.clone())),
        None => Err((
            StatusCode::NOT_FOUND,
            format!("No such primitive: {primitive}"),
        )),
    }
}

// ── /datasets/{id}/primitives/{primitive}/utilization ──
//
// The 2D view: per time bin, busy time bucketed by interval duration against
// the primitive's observed duration domain.

#[derive(Debug, Deserialize)]
pub struct PrimitiveUtilizationParams {
    #[serde(default = "default_bins")]
    pub bins: usize,
    pub begin: Option<i64>,
    pub end: Option<i64>,
    #[serde(default = "default_bins", rename = "duration_bins")]
    pub duration_bins: usize,
}

fn default_bins() -> usize {
    100
}

pub async fn primitive_utilization(
    State(state): State<AppState>,
    Path((dataset_id, primitive)): Path<(String, String)>,
    Query(params): Query<PrimitiveUtilizationParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &["otf2"], &["otf2"], false).await?;
    let dataset = handle.data.read().await;
    let suls = dataset.suls.as_ref().ok_or((
        StatusCode::NOT_FOUND,
        "Dataset does not contain utilization data".to_string(),
    ))?;
    let &(duration_begin, duration_end) = dataset
        .info
        .interval_duration_domain
        .get(&primitive)
        .ok_or((
            StatusCode::NOT_FOUND,
            format!("No duration domain for primitive: {primitive}"),
        ))?;

    let (default_begin, default_end) = dataset.domain();
    let begin = params.begin.unwrap_or(default_begin);
    let end = params.end.unwrap_or(default_end);
    let bins = params.bins.max(1);
    let duration_bins = params.duration_bins.max(1);

    let matrix = suls
        .intervals
        .utilization_for_primitive(
            bins,
            begin,
            end,
            &primitive,
            duration_begin,
            duration_end,
            duration_bins,
        )
        .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(json!({
        "data": matrix,
        "metadata": {
            "begin": begin,
            "end": end,
            "bins": bins,
            "durationDomain": [duration_begin, duration_end],
            "durationBins": duration_bins,
        },
    })))
}

// ── /datasets/{id}/primitives/{primitive}/intervalHistogram ──
//
// Cumulative count of invocations by duration; `all_primitives` rolls every
// primitive together.

#[derive(Debug, Deserialize)]
pub struct IntervalHistogramParams {
    #[serde(default = "default_bins")]
    pub bins: usize,
    pub begin: Option<i64>,
    pub end: Option<i64>,
}

pub async fn interval_histogram(
    State(state): State<AppState>,
    Path((dataset_id, primitive)): Path<(String, String)>,
    Query(params): Query<IntervalHistogramParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &["otf2"], &["otf2"], false).await?;
    let dataset = handle.data.read().await;
    let suls = dataset.suls.as_ref().ok_or((
        StatusCode::NOT_FOUND,
        "Dataset does not contain utilization data".to_string(),
    ))?;
    let sul = suls.interval_histograms.get(&primitive).ok_or((
        StatusCode::NOT_FOUND,
        format!("No interval histogram for primitive: {primitive}"),
    ))?;
    let &(duration_begin, duration_end) = dataset
        .info
        .interval_duration_domain
        .get(&primitive)
        .ok_or((
            StatusCode::NOT_FOUND,
            format!("No duration domain for primitive: {primitive}"),
        ))?;

    let begin = params.begin.unwrap_or(duration_begin);
    let end = params.end.unwrap_or(duration_end);
    let bins = params.bins.max(1);

    let data = sul
        .utilization_for_location(bins, begin, end, HISTOGRAM_LOCATION)
        .map_err(|e| (StatusCode::NOT_FOUND, e.to_string()))?;
    Ok(Json(json!({
        "data": data,
        "metadata": { "begin": begin, "end": end, "bins": bins },
    })))
}
