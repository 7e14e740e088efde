use super::{Location, Metric, MetricReadings};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Ledger change notification kind
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Inserted,
    Updated,
    Removed,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Inserted => write!(f, "inserted"),
            EventKind::Updated => write!(f, "updated"),
            EventKind::Removed => write!(f, "removed"),
        }
    }
}

/// Tracked physical asset
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub sku: Option<String>,
    pub location: Location,
}

/// Ledger record describing this agent
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceModel {
    pub id: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub hostname: String,
    pub location: Location,
    /// Metrics the device currently reports
    #[serde(default)]
    pub supports: Vec<Metric>,
}

/// Monitoring requirements declared on the ledger for one asset
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Requirements {
    pub id: String,
    pub asset_id: String,
    pub metrics: Vec<Metric>,
    /// Reading period in seconds; 0 requests a single reading
    #[serde(default)]
    pub period: u64,
}

impl Requirements {
    pub fn period(&self) -> Duration {
        Duration::from_secs(self.period)
    }
}

/// Partial device update pushed to the ledger
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceUpdateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub supports: Option<Vec<Metric>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<Location>,
}

/// Readings record posted to the ledger after a harvest cycle
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MetricReadingsRecord {
    /// UUIDv7 identifier (time-ordered)
    pub record_id: String,
    /// Requirements record the readings were taken for
    pub requirements_id: String,
    pub asset_id: String,
    pub device_id: String,
    pub timestamp: DateTime<Utc>,
    pub values: MetricReadings,
}

impl MetricReadingsRecord {
    pub fn new(requirements_id: &str, asset_id: &str, device_id: &str, values: MetricReadings) -> Self {
        Self {
            record_id: uuid::Uuid::now_v7().to_string(),
            requirements_id: requirements_id.to_string(),
            asset_id: asset_id.to_string(),
            device_id: device_id.to_string(),
            timestamp: Utc::now(),
            values,
        }
    }
}
