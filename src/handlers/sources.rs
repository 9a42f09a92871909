use axum::{
    extract::{Path, Request, State},
    http::StatusCode,
    response::IntoResponse,
};
use futures_util::{Stream, StreamExt};
use serde_json::json;

use crate::AppState;
use crate::client_log::ClientLog;
use crate::store::{StoreError, csv, dot, newick, phylanx_log};
use crate::trace::process_trace;

use super::{stream_text, validate_dataset};

const MAX_INLINE_BODY: usize = 512 * 1024 * 1024;

/// Split a stream of body chunks into lines, trailing partial line included.
/// The trace parser consumes this directly, so a dump streams through without
/// ever being held in memory whole.
fn byte_lines<S>(stream: S) -> impl Stream<Item = Result<String, StoreError>> + Unpin
where
    S: Stream<Item = Result<axum::body::Bytes, axum::Error>> + Send + 'static,
{
    futures_util::stream::unfold(
        (Box::pin(stream), Vec::<u8>::new(), false),
        |(mut stream, mut buf, mut eof)| async move {
            loop {
                if let Some(pos) = buf.iter().position(|&b| b == b'\n') {
                    let mut line: Vec<u8> = buf.drain(..=pos).collect();
                    line.pop();
                    if line.last() == Some(&b'\r') {
                        line.pop();
                    }
                    let line = String::from_utf8_lossy(&line).to_string();
                    return Some((Ok(line), (stream, buf, eof)));
                }
                if eof {
                    if buf.is_empty() {
                        return None;
                    }
                    let line = String::from_utf8_lossy(&buf).to_string();
                    buf.clear();
                    return Some((Ok(line), (stream, buf, eof)));
                }
                match stream.next().await {
                    Some(Ok(chunk)) => buf.extend_from_slice(&chunk),
                    Some(Err(err)) => {
                        return Some((
                            Err(StoreError::Malformed(format!("body read failed: {err}"))),
                            (stream, buf, true),
                        ));
                    }
                    None => eof = true,
                }
            }
        },
    )
    .boxed()
}

async fn read_body_string(request: Request) -> Result<String, (StatusCode, String)> {
    let bytes = axum::body::to_bytes(request.into_body(), MAX_INLINE_BODY)
        .await
        .map_err(|e| (StatusCode::BAD_REQUEST, format!("body read failed: {e}")))?;
    String::from_utf8(bytes.to_vec())
        .map_err(|_| (StatusCode::BAD_REQUEST, "body is not valid UTF-8".to_string()))
}

/// Wrap one ingest: mark the source file, run it, finish + save on success,
/// purge the dataset on error, and stream the log either way.
async fn finish_ingest(
    state: &AppState,
    dataset_id: &str,
    file_name: &str,
    log: &ClientLog,
    result: Result<(), StoreError>,
) {
    let finished: Result<(), StoreError> = match result {
        Ok(()) => async {
            if let Some(handle) = state.store.lookup(dataset_id).await {
                handle.data.write().await.finish_loading_source_file(file_name)?;
            }
            state.store.save(dataset_id).await
        }
        .await,
        Err(err) => Err(err),
    };
    match finished {
        Ok(()) => log.finish(json!({ "datasetId": dataset_id })).await,
        Err(err) => {
            tracing::error!("ingest failed for {dataset_id}: {err}");
            log.log(format!("ERROR: {err}")).await;
            state.store.purge(dataset_id).await;
            log.finish(json!({ "error": err.to_string() })).await;
        }
    }
}

// ── Trace (event dump) upload ──

pub async fn add_otf2_trace(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    request: Request,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &[], &[], false).await?;
    let (log, rx) = ClientLog::channel(true);
    let lines = byte_lines(request.into_body().into_data_stream());
    let filter = state.engine.dependency_tree.filter;

    tokio::spawn(async move {
        let file_name = "APEX.otf2";
        handle.data.write().await.add_source_file(file_name, "otf2");
        let result = process_trace(&handle, filter, state.store.debug, lines, &log).await;
        finish_ingest(&state, &handle.id, file_name, &log, result).await;
    });

    Ok(stream_text(rx))
}

// ── Small text uploads (newick / csv / dot / log / code) ──

#[derive(Clone, Copy)]
enum TextKind {
    Newick,
    Csv,
    Dot,
    Log,
}

impl TextKind {
    fn file_type(self) -> &'static str {
        match self {
            TextKind::Newick => "newick",
            TextKind::Csv => "csv",
            TextKind::Dot => "dot",
            TextKind::Log => "log",
        }
    }
}

async fn add_text_source(
    state: AppState,
    dataset_id: String,
    kind: TextKind,
    request: Request,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &[], &[], false).await?;
    let text = read_body_string(request).await?;
    let (log, rx) = ClientLog::channel(true);

    tokio::spawn(async move {
        let file_type = kind.file_type();
        let file_name = format!("upload.{file_type}");
        let debug = state.store.debug;
        let result: Result<(), StoreError> = async {
            let mut dataset = handle.data.write().await;
            dataset.add_source_file(&file_name, file_type);
            match kind {
                TextKind::Newick => {
                    newick::process_newick_tree(&mut dataset, &text, debug, &log).await?;
                }
                TextKind::Csv => {
                    csv::process_csv(&mut dataset, text.lines(), debug, &log).await?;
                }
                TextKind::Dot => {
                    dot::process_dot(&mut dataset, text.lines(), debug, &log).await?;
                }
                TextKind::Log => {
                    phylanx_log::process_log(&mut dataset, text.lines(), debug, &log).await?;
                }
            }
            Ok(())
        }
        .await;
        finish_ingest(&state, &handle.id, &file_name, &log, result).await;
    });

    Ok(stream_text(rx))
}

pub async fn add_newick_tree(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    request: Request,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    add_text_source(state, dataset_id, TextKind::Newick, request).await
}

pub async fn add_performance_csv(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    request: Request,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    add_text_source(state, dataset_id, TextKind::Csv, request).await
}

pub async fn add_dot_graph(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    request: Request,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    add_text_source(state, dataset_id, TextKind::Dot, request).await
}

pub async fn add_full_log(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    request: Request,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    add_text_source(state, dataset_id, TextKind::Log, request).await
}

async fn add_code(
    state: AppState,
    dataset_id: String,
    code_type: &'static str,
    request: Request,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &[], &[], false).await?;
    let text = read_body_string(request).await?;
    let file_name = format!("upload.{code_type}");
    {
        let mut dataset = handle.data.write().await;
        dataset.process_code(&file_name, &text, code_type);
        dataset
            .finish_loading_source_file(&file_name)
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    }
    state.store.save(&handle.id).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to save dataset: {e}"),
        )
    })?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn add_physl(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    request: Request,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    add_code(state, dataset_id, "physl", request).await
}

pub async fn add_python(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    request: Request,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    add_code(state, dataset_id, "python", request).await
}

pub async fn add_cpp(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    request: Request,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    add_code(state, dataset_id, "cpp", request).await
}
