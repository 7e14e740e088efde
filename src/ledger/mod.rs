// Ledger capability: change notifications, queries, readings posting

mod memory;
mod nats;

pub use memory::MemoryLedger;
pub use nats::{LedgerConfig, LedgerMode, NatsLedger};

use crate::model::{Asset, DeviceModel, DeviceUpdateRequest, EventKind, MetricReadingsRecord, Requirements};
use anyhow::{Context, Result};
use async_trait::async_trait;
use futures::stream::BoxStream;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Entity class with its own change-notification stream
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Topic {
    Assets,
    Devices,
    Requirements,
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Topic::Assets => write!(f, "assets"),
            Topic::Devices => write!(f, "devices"),
            Topic::Requirements => write!(f, "requirements"),
        }
    }
}

/// Change notification emitted by the ledger
///
/// Wire format: `{"kind": "inserted" | "updated" | "removed", "entity": {...}}`
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: EventKind,
    pub entity: Value,
}

impl ChangeEvent {
    pub fn new<T: Serialize>(kind: EventKind, entity: &T) -> Result<Self> {
        Ok(Self {
            kind,
            entity: serde_json::to_value(entity).context("Failed to serialize entity")?,
        })
    }

    /// Decodes the entity into its typed model.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_value(self.entity.clone()).context("Failed to decode change event entity")
    }
}

/// Stream of change notifications for one topic
pub type ChangeStream = BoxStream<'static, ChangeEvent>;

/// Ledger interface consumed by the agent core.
///
/// The ledger is the source of truth for device identity, nearby assets and
/// monitoring requirements. Transport details live in the implementations.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Subscribes to change notifications for `topic`.
    async fn subscribe(&self, topic: Topic) -> Result<ChangeStream>;

    async fn post_readings(&self, record: &MetricReadingsRecord) -> Result<()>;

    async fn update_device(&self, device_id: &str, patch: &DeviceUpdateRequest) -> Result<()>;

    async fn query_device(&self, device_id: &str) -> Result<Option<DeviceModel>>;

    async fn query_assets(&self) -> Result<Vec<Asset>>;

    /// Requirements declared for any of `asset_ids`.
    async fn query_requirements(&self, asset_ids: &[String]) -> Result<Vec<Requirements>>;

    /// Releases the ledger connection.
    async fn close(&self) -> Result<()>;
}
