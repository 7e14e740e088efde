use super::{HarvestContext, Sensor};
use crate::model::{metrics, Metric};
use anyhow::Result;
use async_trait::async_trait;
use rand::Rng;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// Statically declared sensor reporting fixed values.
///
/// Registered in debug environments where no physical bus is available.
pub struct StaticSensorMock {
    id: String,
    values: BTreeMap<Metric, f64>,
    /// Uniform noise amplitude added to each value
    jitter: f64,
    active: AtomicBool,
    harvests: AtomicU64,
}

impl StaticSensorMock {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            values: BTreeMap::new(),
            jitter: 0.0,
            active: AtomicBool::new(true),
            harvests: AtomicU64::new(0),
        }
    }

    /// Mock used when `mocks.debug_env` is enabled.
    pub fn debug(jitter: f64) -> Self {
        Self::new("STATIC_MOCK")
            .with_value(metrics::TEMPERATURE, 21.0)
            .with_value(metrics::HUMIDITY, 45.0)
            .with_value(metrics::LUMINOSITY, 300.0)
            .with_jitter(jitter)
    }

    pub fn with_value(mut self, metric: &str, value: f64) -> Self {
        self.values.insert(Metric::from(metric), value);
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.abs();
        self
    }

    /// Number of harvests served so far.
    pub fn harvest_count(&self) -> u64 {
        self.harvests.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Sensor for StaticSensorMock {
    fn id(&self) -> &str {
        &self.id
    }

    fn metrics(&self) -> Vec<Metric> {
        self.values.keys().cloned().collect()
    }

    async fn init(&self) -> Result<()> {
        self.active.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn harvest(&self, ctx: &HarvestContext) {
        self.harvests.fetch_add(1, Ordering::SeqCst);

        for (metric, value) in &self.values {
            let noise = if self.jitter > 0.0 && self.jitter.is_finite() {
                rand::thread_rng().gen_range(-self.jitter..=self.jitter)
            } else {
                0.0
            };
            ctx.for_metric(metric.as_str()).write(value + noise);
        }
    }

    fn active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.active.store(false, Ordering::SeqCst);
        Ok(())
    }
}
