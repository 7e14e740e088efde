use super::Sensor;
use crate::model::Metric;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// Sensors keyed by identity
#[derive(Clone, Default)]
pub struct SensorsRegister {
    sensors: HashMap<String, Arc<dyn Sensor>>,
}

impl SensorsRegister {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `sensor`, replacing any sensor with the same id.
    pub fn insert(&mut self, sensor: Arc<dyn Sensor>) -> Option<Arc<dyn Sensor>> {
        self.sensors.insert(sensor.id().to_string(), sensor)
    }

    pub fn remove(&mut self, id: &str) -> Option<Arc<dyn Sensor>> {
        self.sensors.remove(id)
    }

    pub fn exists(&self, id: &str) -> bool {
        self.sensors.contains_key(id)
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.sensors.keys().map(String::as_str)
    }

    pub fn sensors(&self) -> impl Iterator<Item = &Arc<dyn Sensor>> {
        self.sensors.values()
    }

    pub fn len(&self) -> usize {
        self.sensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sensors.is_empty()
    }

    pub fn clear(&mut self) {
        self.sensors.clear();
    }

    /// Union of metrics produced by the registered sensors.
    pub fn supported_metrics(&self) -> BTreeSet<Metric> {
        self.sensors.values().flat_map(|s| s.metrics()).collect()
    }
}
