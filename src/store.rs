//! Persistence boundary for the running-call set.
//!
//! The engine persists every tracked call so that a restart re-validates
//! instead of forgetting. The storage engine is external; this module defines
//! the trait plus a memory store (tests, ephemeral setups) and a JSON file
//! store as a reference backend.

use crate::types::{CallId, GroupCallDescription};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;
use tokio::fs;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("serialization/deserialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Key-value-like store of running calls, keyed by call id.
#[async_trait]
pub trait GroupCallStore: Send + Sync {
    /// Insert or overwrite the row for this call.
    async fn create_or_update(&self, call: &GroupCallDescription) -> Result<()>;

    /// Delete the row for this call. Deleting a missing row is a no-op.
    async fn delete(&self, call: &GroupCallDescription) -> Result<()>;

    /// All persisted calls.
    async fn all(&self) -> Result<Vec<GroupCallDescription>>;
}

/// In-memory store; nothing survives a restart.
#[derive(Default)]
pub struct MemoryCallStore {
    calls: Mutex<HashMap<CallId, GroupCallDescription>>,
}

impl MemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GroupCallStore for MemoryCallStore {
    async fn create_or_update(&self, call: &GroupCallDescription) -> Result<()> {
        self.calls.lock().unwrap().insert(call.call_id, call.clone());
        Ok(())
    }

    async fn delete(&self, call: &GroupCallDescription) -> Result<()> {
        self.calls.lock().unwrap().remove(&call.call_id);
        Ok(())
    }

    async fn all(&self) -> Result<Vec<GroupCallDescription>> {
        Ok(self.calls.lock().unwrap().values().cloned().collect())
    }
}

/// File-backed store: one JSON file per call under `base_path`.
pub struct FileCallStore {
    base_path: PathBuf,
}

impl FileCallStore {
    pub async fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let base_path = path.into();
        fs::create_dir_all(&base_path).await?;
        Ok(Self { base_path })
    }

    fn path_for(&self, call_id: &CallId) -> PathBuf {
        self.base_path.join(format!("{call_id}.json"))
    }
}

#[async_trait]
impl GroupCallStore for FileCallStore {
    async fn create_or_update(&self, call: &GroupCallDescription) -> Result<()> {
        let data = serde_json::to_vec_pretty(call)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        fs::write(self.path_for(&call.call_id), data).await?;
        Ok(())
    }

    async fn delete(&self, call: &GroupCallDescription) -> Result<()> {
        match fs::remove_file(self.path_for(&call.call_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::Io(e)),
        }
    }

    async fn all(&self) -> Result<Vec<GroupCallDescription>> {
        let mut calls = Vec::new();
        let mut entries = fs::read_dir(&self.base_path).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().extension().is_none_or(|ext| ext != "json") {
                continue;
            }
            let data = fs::read(entry.path()).await?;
            let call = serde_json::from_slice(&data)
                .map_err(|e| StoreError::Serialization(e.to_string()))?;
            calls.push(call);
        }
        Ok(calls)
    }
}
