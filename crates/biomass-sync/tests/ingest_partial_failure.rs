use std::sync::Arc;

use async_trait::async_trait;
use biomass_core::StorageRow;
use biomass_storage::{MemoryRowStore, RowStore, StoreError};
use biomass_sync::{IngestionPipeline, RowFailure};

/// Rejects any row whose village is listed, delegating the rest to memory.
struct RejectingStore {
    inner: MemoryRowStore,
    reject_villages: Vec<&'static str>,
}

#[async_trait]
impl RowStore for RejectingStore {
    async fn insert_row(&self, table: &str, row: &StorageRow) -> Result<(), StoreError> {
        if let Some(village) = row.village.as_deref() {
            if self.reject_villages.iter().any(|v| *v == village) {
                return Err(StoreError::Rejected(format!("village {village} failed validation")));
            }
        }
        self.inner.insert_row(table, row).await
    }

    async fn query_all(&self, table: &str) -> Result<Vec<StorageRow>, StoreError> {
        self.inner.query_all(table).await
    }
}

fn ten_rows() -> String {
    let mut csv = String::from("Date,Village,Taluka,District,Juliflora(count)\n");
    for i in 0..10 {
        csv.push_str(&format!("2025-11-0{},V{i},Bhuj,Kutch,{}\n", i % 9 + 1, i * 3));
    }
    csv
}

#[tokio::test]
async fn failed_row_is_recorded_and_the_batch_continues() {
    let store = Arc::new(RejectingStore {
        inner: MemoryRowStore::new(),
        reject_villages: vec!["V4"],
    });
    let pipeline = IngestionPipeline::new(store.clone(), "uploaded_csv");

    let report = pipeline.ingest_csv("batch.csv", &ten_rows()).await.unwrap();

    assert_eq!(report.inserted_count, 9);
    assert_eq!(
        report.failures,
        vec![RowFailure {
            row_index: 4,
            reason: "row rejected: village V4 failed validation".to_string(),
        }]
    );

    let stored = store.query_all("uploaded_csv").await.unwrap();
    assert_eq!(stored.len(), 9);
    assert!(stored.iter().all(|r| r.village.as_deref() != Some("V4")));
    assert_eq!(stored[5].village.as_deref(), Some("V6"));
    assert_eq!(stored[5].juliflora_count, 18.0);
}

#[tokio::test]
async fn every_row_failing_still_returns_a_report() {
    let store = Arc::new(RejectingStore {
        inner: MemoryRowStore::new(),
        reject_villages: vec!["V0", "V1"],
    });
    let pipeline = IngestionPipeline::new(store, "uploaded_csv");
    let report = pipeline
        .ingest_csv("two.csv", "Village\nV0\nV1\n")
        .await
        .unwrap();
    assert_eq!(report.inserted_count, 0);
    let indices: Vec<usize> = report.failures.iter().map(|f| f.row_index).collect();
    assert_eq!(indices, vec![0, 1]);
}
