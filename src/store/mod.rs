pub mod csv;
pub mod dot;
pub mod newick;
pub mod persist;
pub mod phylanx_log;
pub mod primitives;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::client_log::ClientLog;
use crate::models::{DEFAULT_LABEL, DatasetInfo, Interval, MetricPoint, Primitive, PrimitiveLink, SourceFile, TreeNode};
use crate::trace::dependency_tree::DependencyTreeNode;
use crate::trace::interval_tree::IntervalTree;
use crate::trace::sul::SulCollection;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("dataset not found")]
    NotFound,
    #[error("required data is missing: {0}")]
    MissingData(String),
    #[error("malformed input: {0}")]
    Malformed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("encoding error: {0}")]
    Encode(String),
}

/// Everything known about one dataset, held in memory. The derived indexes
/// (`interval_index`, `suls`, `dependency_tree`) are `None` until a trace has
/// been ingested and are immutable afterwards.
pub struct Dataset {
    pub info: DatasetInfo,
    pub primitives: BTreeMap<String, Primitive>,
    pub primitive_links: BTreeMap<String, PrimitiveLink>,
    pub intervals: Vec<Interval>,
    pub guids: BTreeMap<String, Vec<usize>>,
    /// Raw event store; kept for layout compatibility, not populated.
    pub events: BTreeMap<String, serde_json::Value>,
    pub proc_metrics: BTreeMap<String, BTreeMap<i64, MetricPoint>>,
    pub trees: BTreeMap<String, TreeNode>,
    /// Raw source text per language (`physl` / `python` / `cpp`).
    pub code: BTreeMap<String, String>,
    pub interval_index: Option<IntervalTree>,
    pub suls: Option<SulCollection>,
    pub dependency_tree: Option<DependencyTreeNode>,
}

impl Dataset {
    pub fn new(dataset_id: String) -> Dataset {
        Dataset {
            info: DatasetInfo::new(dataset_id),
            primitives: BTreeMap::new(),
            primitive_links: BTreeMap::new(),
            intervals: Vec::new(),
            guids: BTreeMap::new(),
            events: BTreeMap::new(),
            proc_metrics: BTreeMap::new(),
            trees: BTreeMap::new(),
            code: BTreeMap::new(),
            interval_index: None,
            suls: None,
            dependency_tree: None,
        }
    }

    pub fn add_source_file(&mut self, file_name: &str, file_type: &str) {
        self.info.source_files.push(SourceFile {
            file_name: file_name.to_string(),
            file_type: file_type.to_string(),
            still_loading: true,
        });
    }

    pub fn finish_loading_source_file(&mut self, file_name: &str) -> Result<(), StoreError> {
        match self
            .info
            .source_files
            .iter_mut()
            .find(|f| f.file_name == file_name)
        {
            Some(file) => {
                file.still_loading = false;
                Ok(())
            }
            None => Err(StoreError::MissingData(format!(
                "can't finish unknown source file: {file_name}"
            ))),
        }
    }

    /// Rename, trimming stray slashes and whitespace; empty labels fall back
    /// to the default.
    pub fn rename(&mut self, new_label: &str) {
        let trimmed = new_label.trim_matches(|c| c == '/' || c == ' ');
        self.info.label = if trimmed.is_empty() {
            DEFAULT_LABEL.to_string()
        } else {
            trimmed.to_string()
        };
    }

    /// The trace's `[minEnter, maxLeave]`, or a degenerate domain when no
    /// intervals exist yet.
    pub fn domain(&self) -> (i64, i64) {
        self.info.interval_domain.unwrap_or((0, 0))
    }

    pub fn process_code(&mut self, file_name: &str, content: &str, code_type: &str) {
        self.add_source_file(file_name, code_type);
        self.code.insert(code_type.to_string(), content.to_string());
    }
}

/// One dataset as shared between the router and ingest tasks. The `Arc` lets
/// streaming queries hold the data without pinning the store's own lock.
#[derive(Clone)]
pub struct DatasetHandle {
    pub id: String,
    pub data: Arc<RwLock<Dataset>>,
}

/// The collection of datasets plus their on-disk homes. Insertion order is
/// preserved so label lookups resolve collisions deterministically.
pub struct DataStore {
    db_dir: PathBuf,
    pub debug: bool,
    datasets: RwLock<Vec<DatasetHandle>>,
}

impl DataStore {
    pub fn new(db_dir: impl Into<PathBuf>, debug: bool) -> Result<DataStore, StoreError> {
        let db_dir = db_dir.into();
        std::fs::create_dir_all(&db_dir)?;
        Ok(DataStore {
            db_dir,
            debug,
            datasets: RwLock::new(Vec::new()),
        })
    }

    pub fn db_dir(&self) -> &Path {
        &self.db_dir
    }

    /// Load every dataset directory found under `db_dir`. A dataset that
    /// fails to load is purged from disk and the failure propagates, so the
    /// next start comes up clean.
    pub async fn load(&self, log: &ClientLog) -> Result<(), StoreError> {
        let ids = persist::dataset_ids(&self.db_dir)?;
        for dataset_id in ids {
            log.log(format!("Loading {dataset_id}...")).await;
            match persist::load_dataset(&self.db_dir, &dataset_id) {
                Ok(dataset) => {
                    log.log(format!(
                        "Finished loading {dataset_id} ({})",
                        dataset.info.label
                    ))
                    .await;
                    self.datasets.write().await.push(DatasetHandle {
                        id: dataset_id,
                        data: Arc::new(RwLock::new(dataset)),
                    });
                }
                Err(err) => {
                    tracing::error!("failed to load dataset {dataset_id}: {err}");
                    self.purge_dir(&dataset_id);
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    pub async fn create_dataset(&self) -> Result<DatasetHandle, StoreError> {
        let dataset_id = uuid::Uuid::new_v4().to_string();
        let dataset = Dataset::new(dataset_id.clone());
        persist::save_dataset(&self.db_dir, &dataset)?;
        let handle = DatasetHandle {
            id: dataset_id,
            data: Arc::new(RwLock::new(dataset)),
        };
        self.datasets.write().await.push(handle.clone());
        Ok(handle)
    }

    pub async fn handles(&self) -> Vec<DatasetHandle> {
        self.datasets.read().await.clone()
    }

    /// Find a dataset by id, falling back to a label scan in insertion order
    /// (first match wins on duplicate labels).
    pub async fn lookup(&self, id_or_label: &str) -> Option<DatasetHandle> {
        let handles = self.handles().await;
        if let Some(handle) = handles.iter().find(|h| h.id == id_or_label) {
            return Some(handle.clone());
        }
        for handle in &handles {
            if handle.data.read().await.info.label == id_or_label {
                return Some(handle.clone());
            }
        }
        None
    }

    /// Drop a dataset from memory and disk.
    pub async fn delete(&self, dataset_id: &str) -> Result<(), StoreError> {
        let mut datasets = self.datasets.write().await;
        let position = datasets
            .iter()
            .position(|h| h.id == dataset_id)
            .ok_or(StoreError::NotFound)?;
        datasets.remove(position);
        drop(datasets);
        self.purge_dir(dataset_id);
        Ok(())
    }

    /// Abort path: an ingest error purges the partially-populated dataset.
    pub async fn purge(&self, dataset_id: &str) {
        let mut datasets = self.datasets.write().await;
        datasets.retain(|h| h.id != dataset_id);
        drop(datasets);
        self.purge_dir(dataset_id);
    }

    fn purge_dir(&self, dataset_id: &str) {
        let dir = self.db_dir.join(dataset_id);
        if dir.exists() {
            if let Err(err) = std::fs::remove_dir_all(&dir) {
                tracing::error!("failed to purge {}: {err}", dir.display());
            }
        }
    }

    pub async fn save(&self, dataset_id: &str) -> Result<(), StoreError> {
        let handle = self.lookup(dataset_id).await.ok_or(StoreError::NotFound)?;
        let dataset = handle.data.read().await;
        persist::save_dataset(&self.db_dir, &dataset)
    }

    pub async fn add_tag_to_all(&self, tag: &str) -> Result<(), StoreError> {
        for handle in self.handles().await {
            handle
                .data
                .write()
                .await
                .info
                .tags
                .insert(tag.to_string());
            self.save(&handle.id).await?;
        }
        Ok(())
    }
}
