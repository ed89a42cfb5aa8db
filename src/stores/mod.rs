//! Persistence collaborators consumed by the worker.
//!
//! The worker only depends on the narrow contracts below; backend
//! internals live elsewhere in the cluster. The in-memory implementations
//! back the tests and the standalone binary.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::StorageConfig;
use crate::error::{Result, WorkerError};
use crate::slice::{Slice, SliceAnalytics};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SliceStatus {
    Start,
    Completed,
    Error,
}

impl std::fmt::Display for SliceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SliceStatus::Start => write!(f, "start"),
            SliceStatus::Completed => write!(f, "completed"),
            SliceStatus::Error => write!(f, "error"),
        }
    }
}

/// Execution-state record for one slice. The worker writes these but the
/// state store owns their lifetime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SliceState {
    pub execution_id: String,
    pub slice: Slice,
    pub status: SliceStatus,
    pub timestamp: DateTime<Utc>,
    pub error: Option<String>,
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Create the record for a slice that is starting execution.
    async fn create_state(
        &self,
        execution_id: &str,
        slice: &Slice,
        status: SliceStatus,
    ) -> Result<SliceState>;

    /// Update an existing record to its terminal status.
    async fn update_state(
        &self,
        execution_id: &str,
        slice_id: Uuid,
        status: SliceStatus,
        error: Option<&str>,
    ) -> Result<()>;

    async fn shutdown(&self, force: bool) -> Result<()>;
}

#[async_trait]
pub trait AnalyticsStore: Send + Sync {
    async fn record(
        &self,
        execution_id: &str,
        worker_id: &str,
        analytics: &SliceAnalytics,
    ) -> Result<()>;

    async fn shutdown(&self, force: bool) -> Result<()>;
}

#[async_trait]
pub trait AssetStore: Send + Sync {
    /// Persist a zipped asset bundle, returning its asset id. Only used
    /// during asset distribution, never on the slice-processing hot path.
    async fn save(&self, bundle: Vec<u8>) -> Result<String>;

    async fn shutdown(&self, force: bool) -> Result<()>;
}

/// The store handles a worker holds for its lifetime.
#[derive(Clone)]
pub struct Stores {
    pub state: Arc<dyn StateStore>,
    pub analytics: Arc<dyn AnalyticsStore>,
}

/// Open store handles for the configured backend.
pub fn open_stores(config: &StorageConfig) -> Result<Stores> {
    match config.backend.as_str() {
        "memory" => Ok(Stores {
            state: Arc::new(MemoryStateStore::default()),
            analytics: Arc::new(MemoryAnalyticsStore::default()),
        }),
        other => Err(WorkerError::Config(format!(
            "unknown storage backend: {other}"
        ))),
    }
}

#[derive(Default)]
pub struct MemoryStateStore {
    records: Mutex<HashMap<Uuid, SliceState>>,
}

impl MemoryStateStore {
    pub async fn get(&self, slice_id: Uuid) -> Option<SliceState> {
        self.records.lock().await.get(&slice_id).cloned()
    }
}

#[async_trait]
impl StateStore for MemoryStateStore {
    async fn create_state(
        &self,
        execution_id: &str,
        slice: &Slice,
        status: SliceStatus,
    ) -> Result<SliceState> {
        let record = SliceState {
            execution_id: execution_id.to_string(),
            slice: slice.clone(),
            status,
            timestamp: Utc::now(),
            error: None,
        };
        self.records
            .lock()
            .await
            .insert(slice.slice_id, record.clone());
        Ok(record)
    }

    async fn update_state(
        &self,
        _execution_id: &str,
        slice_id: Uuid,
        status: SliceStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(&slice_id).ok_or_else(|| {
            WorkerError::Store(format!("no state record for slice {slice_id}"))
        })?;
        record.status = status;
        record.timestamp = Utc::now();
        record.error = error.map(str::to_string);
        Ok(())
    }

    async fn shutdown(&self, force: bool) -> Result<()> {
        tracing::debug!(force, "state store shutdown");
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAnalyticsStore {
    entries: Mutex<Vec<(String, String, SliceAnalytics)>>,
}

impl MemoryAnalyticsStore {
    pub async fn entries(&self) -> Vec<(String, String, SliceAnalytics)> {
        self.entries.lock().await.clone()
    }
}

#[async_trait]
impl AnalyticsStore for MemoryAnalyticsStore {
    async fn record(
        &self,
        execution_id: &str,
        worker_id: &str,
        analytics: &SliceAnalytics,
    ) -> Result<()> {
        self.entries.lock().await.push((
            execution_id.to_string(),
            worker_id.to_string(),
            analytics.clone(),
        ));
        Ok(())
    }

    async fn shutdown(&self, force: bool) -> Result<()> {
        tracing::debug!(force, "analytics store shutdown");
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAssetStore {
    bundles: Mutex<HashMap<String, Vec<u8>>>,
}

#[async_trait]
impl AssetStore for MemoryAssetStore {
    async fn save(&self, bundle: Vec<u8>) -> Result<String> {
        if bundle.is_empty() {
            return Err(WorkerError::Store("asset bundle is empty".into()));
        }
        let asset_id = Uuid::new_v4().to_string();
        self.bundles.lock().await.insert(asset_id.clone(), bundle);
        Ok(asset_id)
    }

    async fn shutdown(&self, force: bool) -> Result<()> {
        tracing::debug!(force, "asset store shutdown");
        Ok(())
    }
}
