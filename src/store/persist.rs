use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use rusqlite::{Connection, params};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::models::{DatasetInfo, Interval, MetricPoint, Primitive, PrimitiveLink, TreeNode};

use super::{Dataset, StoreError};

// ── Persisted layout ──
//
// Per dataset directory:
//   stores.db   — keyed stores as (store, key) → JSON blob rows
//   <name>.bin  — one msgpack blob per large derived structure
//
// Keyed stores mirror the queryable records (info, primitives, intervals, …);
// blob files hold the structures that only make sense whole (trees, the
// utilization lists, the interval index, the dependency tree, source text).
// Missing keyed stores load as empty; a missing required blob fails the load.

const KEYED_STORES: &[&str] = &[
    "info",
    "primitives",
    "primitiveLinks",
    "intervals",
    "guids",
    "events",
    "procMetrics",
];

const CODE_TYPES: &[&str] = &["physl", "python", "cpp"];

fn stores_db_path(dir: &Path) -> PathBuf {
    dir.join("stores.db")
}

fn blob_path(dir: &Path, name: &str) -> PathBuf {
    dir.join(format!("{name}.bin"))
}

fn open_stores(dir: &Path) -> Result<Connection, StoreError> {
    let conn = Connection::open(stores_db_path(dir))?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         CREATE TABLE IF NOT EXISTS kv (
             store TEXT NOT NULL,
             key   TEXT NOT NULL,
             value BLOB NOT NULL,
             PRIMARY KEY (store, key)
         );",
    )?;
    Ok(conn)
}

fn encode_json<T: Serialize>(value: &T) -> Result<Vec<u8>, StoreError> {
    serde_json::to_vec(value).map_err(|e| StoreError::Encode(e.to_string()))
}

fn decode_json<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, StoreError> {
    serde_json::from_slice(bytes).map_err(|e| StoreError::Encode(e.to_string()))
}

fn write_blob<T: Serialize>(dir: &Path, name: &str, value: &T) -> Result<(), StoreError> {
    let bytes = rmp_serde::to_vec_named(value).map_err(|e| StoreError::Encode(e.to_string()))?;
    let tmp = dir.join(format!("{name}.bin.tmp"));
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, blob_path(dir, name))?;
    Ok(())
}

fn read_blob<T: DeserializeOwned>(dir: &Path, name: &str) -> Result<Option<T>, StoreError> {
    let path = blob_path(dir, name);
    if !path.exists() {
        return Ok(None);
    }
    let bytes = std::fs::read(path)?;
    rmp_serde::from_slice(&bytes)
        .map(Some)
        .map_err(|e| StoreError::Encode(e.to_string()))
}

/// Dataset ids present on disk, in name order (load order defines the
/// insertion order labels resolve against after a restart).
pub fn dataset_ids(db_dir: &Path) -> Result<Vec<String>, StoreError> {
    let mut ids = Vec::new();
    if !db_dir.exists() {
        return Ok(ids);
    }
    for entry in std::fs::read_dir(db_dir)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            ids.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    ids.sort();
    Ok(ids)
}

/// Rewrite one dataset's persisted form. Keyed rows are replaced in a single
/// transaction; blobs are written through a temp-file rename.
pub fn save_dataset(db_dir: &Path, dataset: &Dataset) -> Result<(), StoreError> {
    let dir = db_dir.join(&dataset.info.dataset_id);
    std::fs::create_dir_all(&dir)?;

    let mut conn = open_stores(&dir)?;
    let tx = conn.transaction()?;
    for store in KEYED_STORES {
        tx.execute("DELETE FROM kv WHERE store = ?1", params![store])?;
    }
    {
        let mut insert =
            tx.prepare("INSERT INTO kv (store, key, value) VALUES (?1, ?2, ?3)")?;
        insert.execute(params!["info", "info", encode_json(&dataset.info)?])?;
        for (name, primitive) in &dataset.primitives {
            insert.execute(params!["primitives", name, encode_json(primitive)?])?;
        }
        for (link_id, link) in &dataset.primitive_links {
            insert.execute(params!["primitiveLinks", link_id, encode_json(link)?])?;
        }
        for interval in &dataset.intervals {
            insert.execute(params![
                "intervals",
                interval.id.to_string(),
                encode_json(interval)?
            ])?;
        }
        for (guid, ids) in &dataset.guids {
            insert.execute(params!["guids", guid, encode_json(ids)?])?;
        }
        for (key, event) in &dataset.events {
            insert.execute(params!["events", key, encode_json(event)?])?;
        }
        for (metric, samples) in &dataset.proc_metrics {
            insert.execute(params!["procMetrics", metric, encode_json(samples)?])?;
        }
    }
    tx.commit()?;

    write_blob(&dir, "trees", &dataset.trees)?;
    for code_type in CODE_TYPES {
        if let Some(text) = dataset.code.get(*code_type) {
            write_blob(&dir, code_type, text)?;
        }
    }
    if let Some(suls) = &dataset.suls {
        write_blob(&dir, "sparseUtilizationList", suls)?;
    }
    if let Some(index) = &dataset.interval_index {
        write_blob(&dir, "intervalIndex", index)?;
    }
    if let Some(tree) = &dataset.dependency_tree {
        write_blob(&dir, "dependencyTree", tree)?;
    }
    Ok(())
}

/// Load one dataset directory back into memory. Required keyed stores that
/// are missing come back empty; the `trees` blob is required and its absence
/// is a fatal load error for the dataset.
pub fn load_dataset(db_dir: &Path, dataset_id: &str) -> Result<Dataset, StoreError> {
    let dir = db_dir.join(dataset_id);
    let conn = open_stores(&dir)?;
    let mut dataset = Dataset::new(dataset_id.to_string());

    let mut rows: BTreeMap<String, Vec<(String, Vec<u8>)>> = BTreeMap::new();
    {
        let mut stmt = conn.prepare("SELECT store, key, value FROM kv")?;
        let mut query = stmt.query([])?;
        while let Some(row) = query.next()? {
            let store: String = row.get(0)?;
            let key: String = row.get(1)?;
            let value: Vec<u8> = row.get(2)?;
            rows.entry(store).or_default().push((key, value));
        }
    }

    if let Some(info_rows) = rows.get("info") {
        if let Some((_, bytes)) = info_rows.iter().find(|(k, _)| k == "info") {
            let mut info: DatasetInfo = decode_json(bytes)?;
            info.dataset_id = dataset_id.to_string();
            dataset.info = info;
        }
    }
    for (key, bytes) in rows.remove("primitives").unwrap_or_default() {
        dataset
            .primitives
            .insert(key, decode_json::<Primitive>(&bytes)?);
    }
    for (key, bytes) in rows.remove("primitiveLinks").unwrap_or_default() {
        dataset
            .primitive_links
            .insert(key, decode_json::<PrimitiveLink>(&bytes)?);
    }
    let mut intervals: Vec<Interval> = Vec::new();
    for (_, bytes) in rows.remove("intervals").unwrap_or_default() {
        intervals.push(decode_json(&bytes)?);
    }
    intervals.sort_by_key(|iv| iv.id);
    dataset.intervals = intervals;
    for (key, bytes) in rows.remove("guids").unwrap_or_default() {
        dataset.guids.insert(key, decode_json::<Vec<usize>>(&bytes)?);
    }
    for (key, bytes) in rows.remove("events").unwrap_or_default() {
        dataset
            .events
            .insert(key, decode_json::<serde_json::Value>(&bytes)?);
    }
    for (key, bytes) in rows.remove("procMetrics").unwrap_or_default() {
        dataset
            .proc_metrics
            .insert(key, decode_json::<BTreeMap<i64, MetricPoint>>(&bytes)?);
    }

    dataset.trees = read_blob::<BTreeMap<String, TreeNode>>(&dir, "trees")?
        .ok_or_else(|| StoreError::MissingData(format!("{dataset_id}: trees blob missing")))?;
    for code_type in CODE_TYPES {
        if let Some(text) = read_blob::<String>(&dir, code_type)? {
            dataset.code.insert(code_type.to_string(), text);
        }
    }
    dataset.suls = read_blob(&dir, "sparseUtilizationList")?;
    dataset.interval_index = read_blob(&dir, "intervalIndex")?;
    dataset.dependency_tree = read_blob(&dir, "dependencyTree")?;

    Ok(dataset)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::AttrValue;
    use crate::models::IntervalSide;

    fn sample_dataset() -> Dataset {
        let mut dataset = Dataset::new("test-id".to_string());
        dataset.info.label = "roundtrip".to_string();
        dataset.info.tags.insert("demo".to_string());
        dataset.add_source_file("trace.otf2", "otf2");
        dataset.finish_loading_source_file("trace.otf2").unwrap();
        dataset.info.location_names = vec!["1".to_string()];
        dataset.info.interval_domain = Some((100, 300));

        let mut shared = BTreeMap::new();
        shared.insert("GUID".to_string(), AttrValue::Int(1));
        dataset.intervals.push(Interval {
            id: 0,
            location: "1".to_string(),
            primitive: "A".to_string(),
            enter: IntervalSide {
                timestamp: 100,
                ..Default::default()
            },
            leave: IntervalSide {
                timestamp: 300,
                ..Default::default()
            },
            parent: None,
            children: Vec::new(),
            shared,
        });
        dataset
            .guids
            .insert("1".to_string(), vec![0]);
        dataset.primitives.insert(
            "A".to_string(),
            crate::models::Primitive::from_key("A"),
        );
        dataset.trees.insert(
            "newick".to_string(),
            TreeNode {
                name: "A".to_string(),
                children: vec![TreeNode::leaf("B")],
            },
        );
        dataset.code.insert("python".to_string(), "print(1)\n".to_string());
        dataset.proc_metrics.entry("meminfo:MemFree".to_string()).or_default().insert(
            50,
            MetricPoint {
                timestamp: 50,
                value: 12.0,
            },
        );
        dataset
    }

    #[test]
    fn save_then_load_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = sample_dataset();
        save_dataset(dir.path(), &dataset).unwrap();

        let loaded = load_dataset(dir.path(), "test-id").unwrap();
        assert_eq!(loaded.info.label, "roundtrip");
        assert!(loaded.info.tags.contains("demo"));
        assert_eq!(loaded.info.interval_domain, Some((100, 300)));
        assert_eq!(loaded.intervals.len(), 1);
        assert_eq!(loaded.intervals[0].guid().as_deref(), Some("1"));
        assert_eq!(loaded.guids.get("1"), Some(&vec![0usize]));
        assert_eq!(loaded.trees.get("newick").unwrap().children[0].name, "B");
        assert_eq!(loaded.code.get("python").unwrap(), "print(1)\n");
        assert_eq!(
            loaded
                .proc_metrics
                .get("meminfo:MemFree")
                .unwrap()
                .get(&50)
                .unwrap()
                .value,
            12.0
        );
        assert!(!loaded.info.source_files[0].still_loading);
    }

    #[test]
    fn missing_trees_blob_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = sample_dataset();
        save_dataset(dir.path(), &dataset).unwrap();
        std::fs::remove_file(dir.path().join("test-id/trees.bin")).unwrap();
        assert!(load_dataset(dir.path(), "test-id").is_err());
    }

    #[test]
    fn missing_keyed_rows_load_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let dataset = Dataset::new("empty".to_string());
        save_dataset(dir.path(), &dataset).unwrap();
        let loaded = load_dataset(dir.path(), "empty").unwrap();
        assert!(loaded.primitives.is_empty());
        assert!(loaded.intervals.is_empty());
        assert!(loaded.suls.is_none());
    }
}
