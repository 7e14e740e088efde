use super::{Sensor, SensorsRegister};
use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;

/// Detects sensors attached to the peripheral buses.
///
/// Implemented by the bus scanners; the device applies the result to its
/// dynamic sensor partition.
#[async_trait]
pub trait SensorDiscovery: Send + Sync {
    /// Scans all buses and returns freshly built (not yet initialised) sensors.
    async fn scan(&self) -> Result<Vec<Arc<dyn Sensor>>>;
}

/// Splits a scan result into sensors new to `current` and ids no longer present.
pub fn diff_register(
    current: &SensorsRegister,
    found: Vec<Arc<dyn Sensor>>,
) -> (Vec<Arc<dyn Sensor>>, Vec<String>) {
    let found_ids: HashSet<String> = found.iter().map(|s| s.id().to_string()).collect();

    let removed = current
        .ids()
        .filter(|id| !found_ids.contains(*id))
        .map(str::to_string)
        .collect();

    let added = found
        .into_iter()
        .filter(|s| !current.exists(s.id()))
        .collect();

    (added, removed)
}
