use axum::{
    Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use serde::Deserialize;
use serde_json::json;

use crate::AppState;
use crate::client_log::ClientLog;
use crate::models::DatasetInfo;
use crate::store::{csv, dot, newick};

use super::{stream_text, validate_dataset};

pub async fn list_datasets(State(state): State<AppState>) -> Json<Vec<DatasetInfo>> {
    let mut infos = Vec::new();
    for handle in state.store.handles().await {
        infos.push(handle.data.read().await.info.clone());
    }
    Json(infos)
}

pub async fn get_dataset(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &[], &[], false).await?;
    let info = handle.data.read().await.info.clone();
    Ok(Json(info))
}

/// Inline dataset creation: a label, tags, and optional pre-read source
/// strings for the small file kinds.
#[derive(Debug, Default, Deserialize)]
pub struct BasicDataset {
    pub label: Option<String>,
    pub tags: Option<Vec<String>>,
    pub newick: Option<String>,
    pub csv: Option<String>,
    pub dot: Option<String>,
    pub physl: Option<String>,
    pub python: Option<String>,
    pub cpp: Option<String>,
}

pub async fn create_dataset(
    State(state): State<AppState>,
    body: axum::body::Bytes,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let upload: BasicDataset = if body.is_empty() {
        BasicDataset::default()
    } else {
        serde_json::from_slice(&body)
            .map_err(|e| (StatusCode::BAD_REQUEST, format!("invalid JSON body: {e}")))?
    };
    let store = state.store.clone();
    let handle = store.create_dataset().await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to create dataset: {e}"),
        )
    })?;

    let (log, rx) = ClientLog::channel(true);
    tokio::spawn(async move {
        let dataset_id = handle.id.clone();
        let label = upload
            .label
            .clone()
            .unwrap_or_else(|| crate::models::DEFAULT_LABEL.to_string());
        let result: Result<(), crate::store::StoreError> = async {
            {
                let mut dataset = handle.data.write().await;
                if let Some(label) = &upload.label {
                    dataset.rename(label);
                }
                if let Some(tags) = &upload.tags {
                    dataset.info.tags.extend(tags.iter().cloned());
                }
            }
            if let Some(text) = &upload.newick {
                let file_name = format!("{label}.newick");
                let mut dataset = handle.data.write().await;
                dataset.add_source_file(&file_name, "newick");
                newick::process_newick_tree(&mut dataset, text, store.debug, &log).await?;
                dataset.finish_loading_source_file(&file_name)?;
            }
            if let Some(text) = &upload.csv {
                let file_name = format!("{label}.csv");
                let mut dataset = handle.data.write().await;
                dataset.add_source_file(&file_name, "csv");
                csv::process_csv(&mut dataset, text.lines(), store.debug, &log).await?;
                dataset.finish_loading_source_file(&file_name)?;
            }
            if let Some(text) = &upload.dot {
                let file_name = format!("{label}.dot");
                let mut dataset = handle.data.write().await;
                dataset.add_source_file(&file_name, "dot");
                dot::process_dot(&mut dataset, text.lines(), store.debug, &log).await?;
                dataset.finish_loading_source_file(&file_name)?;
            }
            for (text, code_type, suffix) in [
                (&upload.physl, "physl", "physl"),
                (&upload.python, "python", "py"),
                (&upload.cpp, "cpp", "cpp"),
            ] {
                if let Some(text) = text {
                    let mut dataset = handle.data.write().await;
                    let file_name = format!("{label}.{suffix}");
                    dataset.process_code(&file_name, text, code_type);
                    dataset.finish_loading_source_file(&file_name)?;
                    log.log(format!("Loaded {code_type} code")).await;
                }
            }
            store.save(&dataset_id).await
        }
        .await;

        match result {
            Ok(()) => log.finish(json!({ "datasetId": dataset_id })).await,
            Err(err) => {
                log.log(format!("ERROR: {err}")).await;
                store.purge(&dataset_id).await;
                log.finish(json!({ "error": err.to_string() })).await;
            }
        }
    });

    Ok((StatusCode::CREATED, stream_text(rx)))
}

pub async fn delete_dataset(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &[], &[], true).await?;
    state.store.delete(&handle.id).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to delete dataset: {e}"),
        )
    })?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct UpdateInfoParams {
    pub label: Option<String>,
    /// Comma-separated; an empty string clears the tag set.
    pub tags: Option<String>,
}

pub async fn update_info(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    Query(params): Query<UpdateInfoParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &[], &[], false).await?;
    {
        let mut dataset = handle.data.write().await;
        if let Some(label) = &params.label {
            dataset.rename(label);
        }
        if let Some(tags) = &params.tags {
            dataset.info.tags = tags
                .split(',')
                .filter(|t| !t.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
    state.store.save(&handle.id).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to save dataset: {e}"),
        )
    })?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn add_tag_to_all(
    State(state): State<AppState>,
    Path(tag): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    state.store.add_tag_to_all(&tag).await.map_err(|e| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("failed to tag datasets: {e}"),
        )
    })?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Debug, Deserialize)]
pub struct TreeParams {
    #[serde(default = "default_tree_source")]
    pub source: String,
}

fn default_tree_source() -> String {
    "newick".to_string()
}

pub async fn get_tree(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
    Query(params): Query<TreeParams>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle = validate_dataset(&state.store, &dataset_id, &[], &[], false).await?;
    let dataset = handle.data.read().await;
    match dataset.trees.get(&params.source) {
        Some(tree) => Ok(Json(tree.clone())),
        None => Err((
            StatusCode::NOT_FOUND,
            format!("Dataset does not contain {} tree data", params.source),
        )),
    }
}

async fn get_code(
    state: AppState,
    dataset_id: String,
    code_type: &'static str,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    let handle =
        validate_dataset(&state.store, &dataset_id, &[code_type], &[code_type], false).await?;
    let dataset = handle.data.read().await;
    let text = dataset.code.get(code_type).cloned().ok_or((
        StatusCode::NOT_FOUND,
        format!("Dataset does not contain {code_type} source"),
    ))?;
    Ok(text)
}

pub async fn get_physl(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    get_code(state, dataset_id, "physl").await
}

pub async fn get_python(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    get_code(state, dataset_id, "python").await
}

pub async fn get_cpp(
    State(state): State<AppState>,
    Path(dataset_id): Path<String>,
) -> Result<impl IntoResponse, (StatusCode, String)> {
    get_code(state, dataset_id, "cpp").await
}
