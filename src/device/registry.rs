// Sensor registry side of the device: static and discovered partitions

use super::{Device, DeviceState};
use crate::model::Metric;
use crate::sensor::{diff_register, Sensor, SensorDiscovery};
use anyhow::{Context, Result};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Initialises `sensors`, dropping the ones that fail.
async fn init_sensors(sensors: Vec<Arc<dyn Sensor>>) -> Vec<Arc<dyn Sensor>> {
    let mut ready = Vec::with_capacity(sensors.len());

    for sensor in sensors {
        match sensor.init().await {
            Ok(()) => ready.push(sensor),
            Err(e) => warn!(sensor = %sensor.id(), error = %e, "Failed to init sensor, skipping"),
        }
    }

    ready
}

impl Device {
    /// Adds discovered sensors.
    pub async fn register_sensors(&self, sensors: Vec<Arc<dyn Sensor>>) {
        self.update_sensors_register(sensors, Vec::new()).await;
    }

    pub async fn unregister_sensor(&self, id: &str) {
        self.update_sensors_register(Vec::new(), vec![id.to_string()]).await;
    }

    /// Applies a discovery diff to the dynamic partition.
    pub async fn update_sensors_register(&self, added: Vec<Arc<dyn Sensor>>, removed: Vec<String>) {
        if self.warn_closed("update_sensors_register") {
            return;
        }

        let added = init_sensors(added).await;

        {
            let mut register = self.sensors.write().unwrap_or_else(|e| e.into_inner());

            for id in &removed {
                register.remove(id);
            }

            for sensor in &added {
                register.insert(Arc::clone(sensor));
            }
        }

        self.sync_reader();

        if !added.is_empty() || !removed.is_empty() {
            info!(added = added.len(), removed = removed.len(), "Sensors register updated");
        }

        self.update_supported_metrics().await;
    }

    /// Adds statically declared sensors.
    pub async fn register_static_sensors(&self, sensors: Vec<Arc<dyn Sensor>>) {
        if self.warn_closed("register_static_sensors") {
            return;
        }

        let sensors = init_sensors(sensors).await;
        {
            let mut register = self.static_sensors.write().unwrap_or_else(|e| e.into_inner());
            for sensor in &sensors {
                register.insert(Arc::clone(sensor));
            }
        }

        self.sync_reader();

        info!(count = sensors.len(), "Static sensors registered");
        self.update_supported_metrics().await;
    }

    /// Rebuilds the reader pool from the merged partitions while operating.
    ///
    /// Static sensors win over discovered ones sharing their id.
    pub(crate) fn sync_reader(&self) {
        let _guard = self.reader_sync.lock().unwrap_or_else(|e| e.into_inner());
        if self.state() != DeviceState::Operating {
            return;
        }

        let sensors = self.supported_sensors();
        debug!(sensors = sensors.len(), "Reader sensors synced");
        self.reader.replace_sensors(sensors);
    }

    /// Scans the buses and applies the result to the discovered partition.
    ///
    /// Returns how many sensors were added and removed.
    pub async fn discover(&self, discovery: &dyn SensorDiscovery) -> Result<(usize, usize)> {
        let timeout = self.config.reader.bus_scan_timeout();

        let found = tokio::time::timeout(timeout, discovery.scan())
            .await
            .with_context(|| format!("Sensor bus scan timed out after {:?}", timeout))?
            .context("Sensor bus scan failed")?;

        let (added, removed) = {
            let register = self.sensors.read().unwrap_or_else(|e| e.into_inner());
            diff_register(&register, found)
        };

        let counts = (added.len(), removed.len());
        if counts != (0, 0) {
            self.update_sensors_register(added, removed).await;
        }

        Ok(counts)
    }

    /// Static and discovered sensors, static first.
    pub fn supported_sensors(&self) -> Vec<Arc<dyn Sensor>> {
        let static_sensors = self.static_sensors.read().unwrap_or_else(|e| e.into_inner());
        let sensors = self.sensors.read().unwrap_or_else(|e| e.into_inner());

        static_sensors
            .sensors()
            .chain(sensors.sensors().filter(|s| !static_sensors.exists(s.id())))
            .cloned()
            .collect()
    }

    pub fn supported_metrics(&self) -> BTreeSet<Metric> {
        self.supported_sensors()
            .iter()
            .flat_map(|sensor| sensor.metrics())
            .collect()
    }
}
