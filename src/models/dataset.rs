use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

pub const DEFAULT_LABEL: &str = "Untitled dataset";

/// One uploaded source file and whether its ingest has finished. Endpoints
/// gate on `still_loading` so a dataset stays queryable for the data that is
/// already in place while later files load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceFile {
    pub file_name: String,
    pub file_type: String,
    pub still_loading: bool,
}

/// The `info` record persisted per dataset. Trace-derived fields stay at their
/// defaults until an event dump has been ingested.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetInfo {
    pub dataset_id: String,
    pub label: String,
    #[serde(default)]
    pub tags: BTreeSet<String>,
    #[serde(default)]
    pub source_files: Vec<SourceFile>,
    #[serde(default)]
    pub location_names: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval_domain: Option<(i64, i64)>,
    /// Per-primitive `[minDuration, maxDuration]`, including the
    /// `all_primitives` roll-up key.
    #[serde(default)]
    pub interval_duration_domain: BTreeMap<String, (i64, i64)>,
    #[serde(default)]
    pub proc_metric_list: Vec<String>,
}

impl DatasetInfo {
    pub fn new(dataset_id: String) -> DatasetInfo {
        DatasetInfo {
            dataset_id,
            label: DEFAULT_LABEL.to_string(),
            tags: BTreeSet::new(),
            source_files: Vec::new(),
            location_names: Vec::new(),
            interval_domain: None,
            interval_duration_domain: BTreeMap::new(),
            proc_metric_list: Vec::new(),
        }
    }
}

/// A non-PAPI metric sample (meminfo / status / io counters).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    #[serde(rename = "Timestamp")]
    pub timestamp: i64,
    #[serde(rename = "Value")]
    pub value: f64,
}
