use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use moka::ops::compute::Op;
use moka::sync::Cache;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::value::FunctionId;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CostStoreError {
    #[error("no cost record for {function_id} in {configuration_name}")]
    NotFound {
        configuration_name: String,
        function_id: FunctionId,
    },
    #[error("cost store unavailable: {0}")]
    Transport(String),
}

/// Historical per-invocation cost of a function within a calculation
/// configuration. All costs are means per invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCostRecord {
    pub configuration_name: String,
    pub function_id: FunctionId,
    pub invocation_nanos: f64,
    pub data_input_bytes: f64,
    pub data_output_bytes: f64,
    pub version: DateTime<Utc>,
}

impl FunctionCostRecord {
    pub fn new(
        configuration_name: impl Into<String>,
        function_id: impl Into<FunctionId>,
        invocation_nanos: f64,
        data_input_bytes: f64,
        data_output_bytes: f64,
    ) -> Self {
        Self {
            configuration_name: configuration_name.into(),
            function_id: function_id.into(),
            invocation_nanos,
            data_input_bytes,
            data_output_bytes,
            version: Utc::now(),
        }
    }

    pub fn key(&self) -> CostKey {
        CostKey::new(&self.configuration_name, &self.function_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CostKey {
    pub configuration_name: String,
    pub function_id: FunctionId,
}

impl CostKey {
    pub fn new(configuration_name: &str, function_id: &str) -> Self {
        Self {
            configuration_name: configuration_name.to_string(),
            function_id: function_id.to_string(),
        }
    }
}

#[async_trait]
pub trait FunctionCostStore: Send + Sync {
    /// Latest record for the key, or the latest one versioned at or before
    /// `as_of`.
    async fn load(
        &self,
        configuration_name: &str,
        function_id: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Option<FunctionCostRecord>, CostStoreError>;

    /// Replaces the record for its key and returns it stamped with its new version.
    async fn store(&self, record: FunctionCostRecord) -> Result<FunctionCostRecord, CostStoreError>;
}

/// Last-write-wins store keeping only the current record per key.
///
/// Writers to different keys never contend; writers to the same key are
/// ordered by the key's entry lock, and each write is versioned strictly after
/// the one it replaces.
#[derive(Debug, Default)]
pub struct InMemoryFunctionCostStore {
    records: DashMap<CostKey, FunctionCostRecord>,
}

impl InMemoryFunctionCostStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[async_trait]
impl FunctionCostStore for InMemoryFunctionCostStore {
    async fn load(
        &self,
        configuration_name: &str,
        function_id: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Option<FunctionCostRecord>, CostStoreError> {
        let key = CostKey::new(configuration_name, function_id);
        Ok(self
            .records
            .get(&key)
            .map(|record| record.clone())
            .filter(|record| as_of.map_or(true, |as_of| record.version <= as_of)))
    }

    async fn store(&self, mut record: FunctionCostRecord) -> Result<FunctionCostRecord, CostStoreError> {
        let now = Utc::now();
        match self.records.entry(record.key()) {
            Entry::Occupied(mut occupied) => {
                let previous = occupied.get().version;
                record.version = if previous >= now {
                    previous + chrono::Duration::nanoseconds(1)
                } else {
                    now
                };
                occupied.insert(record.clone());
            }
            Entry::Vacant(vacant) => {
                record.version = now;
                vacant.insert(record.clone());
            }
        }
        debug!(
            "Stored cost of {} in {}: {:.0}ns/invocation",
            record.function_id, record.configuration_name, record.invocation_nanos
        );
        Ok(record)
    }
}

/// Transport to a cost store living on the other side of a network boundary.
#[async_trait]
pub trait RemoteCostClient: Send + Sync {
    /// Fails with [`CostStoreError::NotFound`] when the remote has no record.
    async fn fetch(
        &self,
        configuration_name: &str,
        function_id: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<FunctionCostRecord, CostStoreError>;

    async fn put(&self, record: FunctionCostRecord) -> Result<FunctionCostRecord, CostStoreError>;
}

/// Adapts a [`RemoteCostClient`] to [`FunctionCostStore`], caching latest
/// records locally so dispatch decisions rarely cross the network.
pub struct RemoteFunctionCostStore<C> {
    client: C,
    latest: Cache<CostKey, FunctionCostRecord>,
}

impl<C: RemoteCostClient> RemoteFunctionCostStore<C> {
    pub fn new(client: C, max_capacity: u64, time_to_live: Duration) -> Self {
        Self {
            client,
            latest: Cache::builder()
                .max_capacity(max_capacity)
                .time_to_live(time_to_live)
                .build(),
        }
    }

    pub fn client(&self) -> &C {
        &self.client
    }

    /// Caches `record` unless a newer version is already cached.
    fn remember(&self, record: FunctionCostRecord) {
        self.latest.entry(record.key()).and_compute_with(|cached| match cached {
            Some(cached) if cached.value().version >= record.version => Op::Nop,
            _ => Op::Put(record),
        });
    }
}

#[async_trait]
impl<C: RemoteCostClient> FunctionCostStore for RemoteFunctionCostStore<C> {
    async fn load(
        &self,
        configuration_name: &str,
        function_id: &str,
        as_of: Option<DateTime<Utc>>,
    ) -> Result<Option<FunctionCostRecord>, CostStoreError> {
        let key = CostKey::new(configuration_name, function_id);
        if as_of.is_none() {
            if let Some(record) = self.latest.get(&key) {
                return Ok(Some(record));
            }
        }

        match self.client.fetch(configuration_name, function_id, as_of).await {
            Ok(record) => {
                if as_of.is_none() {
                    self.remember(record.clone());
                }
                Ok(Some(record))
            }
            Err(CostStoreError::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn store(&self, record: FunctionCostRecord) -> Result<FunctionCostRecord, CostStoreError> {
        let stored = self.client.put(record).await?;
        self.remember(stored.clone());
        Ok(stored)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn store_then_load_latest() {
        let store = InMemoryFunctionCostStore::new();
        let before = Utc::now();
        let stored = store
            .store(FunctionCostRecord::new("Default", "Discounting", 1500.0, 64.0, 8.0))
            .await
            .expect("stored");

        let loaded = store
            .load("Default", "Discounting", None)
            .await
            .expect("loaded")
            .expect("present");
        assert_eq!(loaded.invocation_nanos, 1500.0);
        assert_eq!(loaded.data_input_bytes, 64.0);
        assert_eq!(loaded.data_output_bytes, 8.0);
        assert!(loaded.version >= before);
        assert_eq!(loaded, stored);
        assert!(store.load("Default", "Other", None).await.expect("loaded").is_none());
    }

    #[tokio::test]
    async fn last_write_wins_with_increasing_versions() {
        let store = InMemoryFunctionCostStore::new();
        let first = store
            .store(FunctionCostRecord::new("Default", "Discounting", 1.0, 1.0, 1.0))
            .await
            .expect("stored");
        let second = store
            .store(FunctionCostRecord::new("Default", "Discounting", 2.0, 2.0, 2.0))
            .await
            .expect("stored");

        assert!(second.version > first.version);
        let loaded = store.load("Default", "Discounting", None).await.expect("loaded");
        assert_eq!(loaded.map(|r| r.invocation_nanos), Some(2.0));

        let before_first = first.version - chrono::Duration::seconds(1);
        assert!(store
            .load("Default", "Discounting", Some(before_first))
            .await
            .expect("loaded")
            .is_none());
        assert_eq!(store.len(), 1);
    }

    #[tokio::test]
    async fn concurrent_writers_to_distinct_keys() {
        let store = Arc::new(InMemoryFunctionCostStore::new());
        let mut handles = Vec::new();
        for i in 0..16 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                for n in 0..10 {
                    store
                        .store(FunctionCostRecord::new("Default", format!("f{i}"), f64::from(n), 0.0, 0.0))
                        .await
                        .expect("stored");
                }
            }));
        }
        for handle in handles {
            handle.await.expect("writer finished");
        }

        assert_eq!(store.len(), 16);
        for i in 0..16 {
            let record = store
                .load("Default", &format!("f{i}"), None)
                .await
                .expect("loaded")
                .expect("present");
            assert_eq!(record.invocation_nanos, 9.0);
        }
    }

    #[derive(Default)]
    struct FlakyRemote {
        fetches: AtomicUsize,
        records: DashMap<CostKey, FunctionCostRecord>,
        offline: AtomicBool,
    }

    #[async_trait]
    impl RemoteCostClient for FlakyRemote {
        async fn fetch(
            &self,
            configuration_name: &str,
            function_id: &str,
            _as_of: Option<DateTime<Utc>>,
        ) -> Result<FunctionCostRecord, CostStoreError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.offline.load(Ordering::SeqCst) {
                return Err(CostStoreError::Transport("connection refused".to_string()));
            }
            self.records
                .get(&CostKey::new(configuration_name, function_id))
                .map(|r| r.clone())
                .ok_or_else(|| CostStoreError::NotFound {
                    configuration_name: configuration_name.to_string(),
                    function_id: function_id.to_string(),
                })
        }

        async fn put(&self, mut record: FunctionCostRecord) -> Result<FunctionCostRecord, CostStoreError> {
            record.version = Utc::now();
            self.records.insert(record.key(), record.clone());
            Ok(record)
        }
    }

    #[tokio::test]
    async fn remote_store_distinguishes_not_found_from_transport_faults() {
        let store = RemoteFunctionCostStore::new(FlakyRemote::default(), 100, Duration::from_secs(60));

        assert_eq!(store.load("Default", "Discounting", None).await, Ok(None));

        store
            .store(FunctionCostRecord::new("Default", "Discounting", 10.0, 0.0, 0.0))
            .await
            .expect("stored");
        let fetches = store.client().fetches.load(Ordering::SeqCst);
        let cached = store.load("Default", "Discounting", None).await.expect("loaded");
        assert_eq!(cached.map(|r| r.invocation_nanos), Some(10.0));
        assert_eq!(store.client().fetches.load(Ordering::SeqCst), fetches);

        store.client().offline.store(true, Ordering::SeqCst);
        let result = store.load("Default", "Uncached", None).await;
        assert!(matches!(result, Err(CostStoreError::Transport(_))));
    }

    /// Answers every fetch late with a record older than anything written since.
    struct LaggingRemote;

    #[async_trait]
    impl RemoteCostClient for LaggingRemote {
        async fn fetch(
            &self,
            configuration_name: &str,
            function_id: &str,
            _as_of: Option<DateTime<Utc>>,
        ) -> Result<FunctionCostRecord, CostStoreError> {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut record = FunctionCostRecord::new(configuration_name, function_id, 1.0, 0.0, 0.0);
            record.version = Utc::now() - chrono::Duration::hours(1);
            Ok(record)
        }

        async fn put(&self, mut record: FunctionCostRecord) -> Result<FunctionCostRecord, CostStoreError> {
            record.version = Utc::now();
            Ok(record)
        }
    }

    #[tokio::test]
    async fn late_fetch_does_not_replace_a_newer_cached_write() {
        let store = RemoteFunctionCostStore::new(LaggingRemote, 100, Duration::from_secs(60));

        let (fetched, stored) = tokio::join!(store.load("Default", "Discounting", None), async {
            tokio::time::sleep(Duration::from_millis(10)).await;
            store
                .store(FunctionCostRecord::new("Default", "Discounting", 2.0, 0.0, 0.0))
                .await
        });
        assert_eq!(fetched.expect("loaded").map(|r| r.invocation_nanos), Some(1.0));
        assert!(stored.is_ok());

        let cached = store.load("Default", "Discounting", None).await.expect("loaded");
        assert_eq!(cached.map(|r| r.invocation_nanos), Some(2.0));
    }
}
