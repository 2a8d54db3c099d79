//! Durable log of backend mutations issued while offline.

use crate::{
    backend_client::HttpMethod,
    storage::{JsonStore, PENDING_OPERATIONS_KEY},
};
use anyhow::{Context, Result, bail};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    sync::{Mutex, MutexGuard},
    time::{SystemTime, UNIX_EPOCH},
};
use uuid::Uuid;

#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
pub struct PendingOperation {
    pub id: String,
    pub endpoint: String,
    pub method: HttpMethod,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Milliseconds since the Unix epoch
    pub timestamp: u64,
}

impl PendingOperation {
    pub fn new(endpoint: &str, method: HttpMethod, data: Option<Value>) -> Result<Self> {
        let timestamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .context("failed to read system time")?
            .as_millis() as u64;
        let suffix = Uuid::new_v4().simple().to_string();

        Ok(Self {
            id: format!("{timestamp}-{}", &suffix[..9]),
            endpoint: endpoint.to_string(),
            method,
            data: data.filter(|_| method.carries_body()),
            timestamp,
        })
    }
}

/// Pending operations persisted under one store key.
///
/// Every change reads, modifies and rewrites the whole list while holding an
/// in-process lock. Two processes sharing the data directory can still lose
/// each other's writes.
pub struct OfflineQueue {
    store: JsonStore,
    lock: Mutex<()>,
}

impl OfflineQueue {
    pub fn new(store: JsonStore) -> Self {
        Self {
            store,
            lock: Mutex::new(()),
        }
    }

    fn guard(&self) -> Result<MutexGuard<'_, ()>> {
        self.lock
            .lock()
            .map_err(|_| anyhow::anyhow!("failed to lock offline queue"))
    }

    fn load(&self) -> Result<Vec<PendingOperation>> {
        self.store
            .load(PENDING_OPERATIONS_KEY)
            .context("failed to load pending operations")
    }

    fn save(&self, operations: &[PendingOperation]) -> Result<()> {
        self.store
            .save(PENDING_OPERATIONS_KEY, operations)
            .context("failed to save pending operations")
    }

    /// Persist a new operation and return its id
    pub fn enqueue(&self, endpoint: &str, method: HttpMethod, data: Option<Value>) -> Result<String> {
        let operation = PendingOperation::new(endpoint, method, data)?;
        let id = operation.id.clone();

        self.insert(operation)?;
        info!("queued {method} {endpoint} as {id}");

        Ok(id)
    }

    /// Persist an already built operation. Ids must be unique.
    pub fn insert(&self, operation: PendingOperation) -> Result<()> {
        let _guard = self.guard()?;
        let mut operations = self.load()?;

        if operations.iter().any(|op| op.id == operation.id) {
            bail!("failed to queue operation: duplicate id {}", operation.id);
        }

        operations.push(operation);
        self.save(&operations)
    }

    /// All pending operations in storage order, which need not be replay order
    pub fn list(&self) -> Result<Vec<PendingOperation>> {
        let _guard = self.guard()?;
        self.load()
    }

    /// Drop the operation with `id`, if it is still queued
    pub fn remove(&self, id: &str) -> Result<()> {
        let _guard = self.guard()?;
        let mut operations = self.load()?;
        let before = operations.len();

        operations.retain(|op| op.id != id);

        if operations.len() == before {
            debug!("operation {id} already removed");
            return Ok(());
        }

        self.save(&operations)
    }

    pub fn has_pending(&self) -> Result<bool> {
        Ok(self.pending_count()? > 0)
    }

    pub fn pending_count(&self) -> Result<usize> {
        Ok(self.list()?.len())
    }
}
