//! Status records and the store they are published to
//!
//! The store is keyed by scope, link kind and link name. Interfaces and
//! routers live in separate tables so an interface and a router may share a
//! name within a scope.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{RelayError, RelayResult};
use crate::types::{ConnectionState, Counters, MicroserviceKind};

/// Externally visible projection of a link's identity, state and counters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusRecord {
    pub name: String,
    pub state: ConnectionState,
    pub num_clients: u64,
    pub tx_queue_size: u64,
    pub rx_queue_size: u64,
    pub bytes_written: u64,
    pub bytes_read: u64,
    pub write_count: u64,
    pub read_count: u64,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

impl StatusRecord {
    pub fn new(name: impl Into<String>, state: ConnectionState) -> Self {
        Self::from_counters(name, state, &Counters::new())
    }

    pub fn from_counters(name: impl Into<String>, state: ConnectionState, counters: &Counters) -> Self {
        Self {
            name: name.into(),
            state,
            num_clients: counters.num_clients,
            tx_queue_size: counters.tx_queue_size,
            rx_queue_size: counters.rx_queue_size,
            bytes_written: counters.bytes_written,
            bytes_read: counters.bytes_read,
            write_count: counters.write_count,
            read_count: counters.read_count,
            updated_at: None,
        }
    }

    pub fn with_timestamp(mut self) -> Self {
        self.updated_at = Some(Utc::now());
        self
    }
}

/// Lifecycle state of the microservice process itself
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MicroserviceState {
    Initialized,
    Running,
    Finished,
    DiedError,
}

/// Heartbeat record of a microservice
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MicroserviceStatus {
    /// Composite `SCOPE__KIND__NAME`
    pub name: String,
    pub state: MicroserviceState,
    /// Packets handled by the connection loop
    pub count: u64,
    pub error: Option<String>,
    #[serde(default)]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Shared store of status records. Written by the engine, read by anyone.
pub trait StatusStore: Send + Sync {
    /// Create or replace the status record of a link
    fn set_link_status(&self, scope: &str, kind: MicroserviceKind, record: &StatusRecord) -> RelayResult<()>;

    /// Get the status record of a link
    fn link_status(&self, scope: &str, kind: MicroserviceKind, name: &str) -> RelayResult<Option<StatusRecord>>;

    /// Create or replace the heartbeat record of a microservice
    fn set_microservice_status(&self, scope: &str, status: &MicroserviceStatus) -> RelayResult<()>;

    /// Get the heartbeat record of a microservice by composite name
    fn microservice_status(&self, scope: &str, name: &str) -> RelayResult<Option<MicroserviceStatus>>;
}

type LinkKey = (String, MicroserviceKind, String);

/// In-process status store
#[derive(Default)]
pub struct MemoryStatusStore {
    links: Mutex<HashMap<LinkKey, StatusRecord>>,
    microservices: Mutex<HashMap<(String, String), MicroserviceStatus>>,
}

impl MemoryStatusStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Dump every link record as JSON, keyed `SCOPE__KIND__NAME`
    pub fn to_json(&self) -> RelayResult<serde_json::Value> {
        let links = self.links.lock().map_err(|_| poisoned())?;
        let map: BTreeMap<String, &StatusRecord> = links
            .iter()
            .map(|((scope, kind, name), record)| (format!("{}__{}__{}", scope, kind, name), record))
            .collect();
        Ok(serde_json::to_value(map)?)
    }
}

fn poisoned() -> RelayError {
    RelayError::Store("Lock poisoned".to_string())
}

impl StatusStore for MemoryStatusStore {
    fn set_link_status(&self, scope: &str, kind: MicroserviceKind, record: &StatusRecord) -> RelayResult<()> {
        let mut links = self.links.lock().map_err(|_| poisoned())?;
        links.insert((scope.to_string(), kind, record.name.clone()), record.clone());
        Ok(())
    }

    fn link_status(&self, scope: &str, kind: MicroserviceKind, name: &str) -> RelayResult<Option<StatusRecord>> {
        let links = self.links.lock().map_err(|_| poisoned())?;
        Ok(links.get(&(scope.to_string(), kind, name.to_string())).cloned())
    }

    fn set_microservice_status(&self, scope: &str, status: &MicroserviceStatus) -> RelayResult<()> {
        let mut microservices = self.microservices.lock().map_err(|_| poisoned())?;
        microservices.insert((scope.to_string(), status.name.clone()), status.clone());
        Ok(())
    }

    fn microservice_status(&self, scope: &str, name: &str) -> RelayResult<Option<MicroserviceStatus>> {
        let microservices = self.microservices.lock().map_err(|_| poisoned())?;
        Ok(microservices.get(&(scope.to_string(), name.to_string())).cloned())
    }
}
