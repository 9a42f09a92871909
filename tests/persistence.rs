use traverse_api::client_log::ClientLog;
use traverse_api::store::{DataStore, StoreError, persist};
use traverse_api::trace::dependency_tree::DependencyFilter;
use traverse_api::trace::process_trace;

async fn ingest_sample(store: &DataStore) -> String {
    let handle = store.create_dataset().await.unwrap();
    handle.data.write().await.rename("persisted run");
    handle
        .data
        .write()
        .await
        .add_source_file("test.otf2", "otf2");
    let lines = vec![
        "ENTER 1 100 Region: \"/app$0/work$0$1$1\"",
        "  ADDITIONAL ATTRIBUTES: (\"GUID\" <0>; UINT64; 1), (\"Parent GUID\" <0>; UINT64; 0)",
        "ENTER 1 150 Region: \"/app$0/leaf$0$2$1\"",
        "LEAVE 1 200 Region: \"/app$0/leaf$0$2$1\"",
        "LEAVE 1 300 Region: \"/app$0/work$0$1$1\"",
        "  ADDITIONAL ATTRIBUTES: (\"GUID\" <0>; UINT64; 1), (\"Parent GUID\" <0>; UINT64; 0)",
        "METRIC 1 300 Metric: 0, 1 Values: (\"meminfo:MemFree\" <0>; UINT64; 4096)",
    ];
    let stream = futures_util::stream::iter(
        lines
            .into_iter()
            .map(|l| Ok::<String, StoreError>(l.to_string()))
            .collect::<Vec<_>>(),
    );
    process_trace(
        &handle,
        DependencyFilter::ExcludeApexMain,
        false,
        stream,
        &ClientLog::console(),
    )
    .await
    .unwrap();
    handle
        .data
        .write()
        .await
        .finish_loading_source_file("test.otf2")
        .unwrap();
    store.save(&handle.id).await.unwrap();
    handle.id.clone()
}

#[tokio::test]
async fn save_then_reload_preserves_data_and_queries() {
    let dir = tempfile::tempdir().unwrap();
    let store = DataStore::new(dir.path(), false).unwrap();
    let dataset_id = ingest_sample(&store).await;

    let original = store.lookup(&dataset_id).await.unwrap();
    let original = original.data.read().await;

    let reloaded = persist::load_dataset(dir.path(), &dataset_id).unwrap();

    // Info fields survive byte-for-byte.
    assert_eq!(
        serde_json::to_value(&original.info).unwrap(),
        serde_json::to_value(&reloaded.info).unwrap()
    );
    // Every interval round-trips through the keyed store.
    assert_eq!(original.intervals.len(), reloaded.intervals.len());
    for (a, b) in original.intervals.iter().zip(reloaded.intervals.iter()) {
        assert_eq!(
            serde_json::to_value(a).unwrap(),
            serde_json::to_value(b).unwrap()
        );
    }
    assert_eq!(original.guids, reloaded.guids);
    assert_eq!(
        original.proc_metrics.get("meminfo:MemFree").unwrap().len(),
        reloaded.proc_metrics.get("meminfo:MemFree").unwrap().len()
    );

    // Derived indexes answer identically after a reload.
    let (begin, end) = original.domain();
    let before: Vec<usize> = original
        .interval_index
        .as_ref()
        .unwrap()
        .iter_overlap(begin, end)
        .collect();
    let after: Vec<usize> = reloaded
        .interval_index
        .as_ref()
        .unwrap()
        .iter_overlap(begin, end)
        .collect();
    assert_eq!(before, after);

    let histogram_before = original
        .suls
        .as_ref()
        .unwrap()
        .intervals
        .utilization_histogram(4, begin, end);
    let histogram_after = reloaded
        .suls
        .as_ref()
        .unwrap()
        .intervals
        .utilization_histogram(4, begin, end);
    assert_eq!(histogram_before, histogram_after);

    let tree_before = original.dependency_tree.as_ref().unwrap().tree_summary();
    let tree_after = reloaded.dependency_tree.as_ref().unwrap().tree_summary();
    assert_eq!(tree_before, tree_after);
}

#[tokio::test]
async fn store_load_restores_saved_datasets() {
    let dir = tempfile::tempdir().unwrap();
    let dataset_id = {
        let store = DataStore::new(dir.path(), false).unwrap();
        ingest_sample(&store).await
    };

    let store = DataStore::new(dir.path(), false).unwrap();
    store.load(&ClientLog::console()).await.unwrap();
    let handle = store
        .lookup("persisted run")
        .await
        .expect("label lookup failed after reload");
    assert_eq!(handle.id, dataset_id);
}
