pub mod datasets;
pub mod health;
pub mod intervals;
pub mod metrics;
pub mod primitives;
pub mod sources;

use std::collections::BTreeSet;

use axum::body::{Body, Bytes};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

use crate::store::{DataStore, DatasetHandle};

/// Resolve a dataset by id or label and enforce the endpoint's readiness
/// preconditions: 404 when the dataset (or a required source type) is absent,
/// 503 while required source types are still loading.
pub async fn validate_dataset(
    store: &DataStore,
    dataset_id: &str,
    required_files: &[&str],
    files_must_be_ready: &[&str],
    all_files_must_be_ready: bool,
) -> Result<DatasetHandle, (StatusCode, String)> {
    let handle = store
        .lookup(dataset_id)
        .await
        .ok_or((StatusCode::NOT_FOUND, "Dataset not found".to_string()))?;

    let dataset = handle.data.read().await;
    let mut required: BTreeSet<&str> = required_files.iter().copied().collect();
    let mut must_be_ready: BTreeSet<&str> = files_must_be_ready.iter().copied().collect();
    let mut all_ready = true;
    for file in &dataset.info.source_files {
        required.remove(file.file_type.as_str());
        if file.still_loading {
            all_ready = false;
        } else {
            must_be_ready.remove(file.file_type.as_str());
        }
    }
    if !required.is_empty() {
        let missing: Vec<&str> = required.into_iter().collect();
        return Err((
            StatusCode::NOT_FOUND,
            format!(
                "Dataset does not contain required data: {}",
                missing.join(", ")
            ),
        ));
    }
    if all_files_must_be_ready && !all_ready {
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            "Dataset is not finished loading; this request requires all data to have finished loading"
                .to_string(),
        ));
    }
    if !must_be_ready.is_empty() {
        let unready: Vec<&str> = must_be_ready.into_iter().collect();
        return Err((
            StatusCode::SERVICE_UNAVAILABLE,
            format!("Required data still loading: {}", unready.join(", ")),
        ));
    }
    drop(dataset);
    Ok(handle)
}

/// Stream channel chunks out as an `application/json` body. Dropping the
/// response aborts the producer at its next send.
pub fn stream_json(rx: tokio::sync::mpsc::Receiver<String>) -> Response {
    let stream =
        ReceiverStream::new(rx).map(|chunk| Ok::<_, std::convert::Infallible>(Bytes::from(chunk)));
    (
        [(header::CONTENT_TYPE, "application/json")],
        Body::from_stream(stream),
    )
        .into_response()
}

/// Stream channel chunks out as a plain-text body (live ingest logs).
pub fn stream_text(rx: tokio::sync::mpsc::Receiver<String>) -> Response {
    let stream =
        ReceiverStream::new(rx).map(|chunk| Ok::<_, std::convert::Infallible>(Bytes::from(chunk)));
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        Body::from_stream(stream),
    )
        .into_response()
}
