// Ledger entities and reading values

mod entities;
mod location;

pub use entities::{
    Asset, DeviceModel, DeviceUpdateRequest, EventKind, MetricReadingsRecord, Requirements,
};
pub use location::Location;

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Metric names a physical quantity (e.g. "temperature", "vibration").
///
/// Compared by exact string match; used as a map key throughout.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metric(String);

impl Metric {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Metric {
    fn from(name: &str) -> Self {
        Self(name.to_string())
    }
}

impl From<String> for Metric {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// Well-known metric names reported by the bundled sensors.
pub mod metrics {
    pub const TEMPERATURE: &str = "temperature";
    pub const HUMIDITY: &str = "humidity";
    pub const LUMINOSITY: &str = "luminosity";
    pub const VIBRATION: &str = "vibration";
    pub const MAGNETISM: &str = "magnetism";
    pub const AIR_CO2: &str = "air_co2";
    pub const AIR_TVOC: &str = "air_tvoc";
    pub const HEART_RATE: &str = "heart_rate";
    pub const BLOOD_OXYGEN: &str = "blood_oxygen";
    pub const CURRENT: &str = "current";
}

/// One reduced value per metric, the unit delivered to handlers and posted to the ledger.
pub type MetricReadings = HashMap<Metric, f64>;
