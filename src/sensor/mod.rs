// Sensor capability contract and per-cycle delivery surface

mod discovery;
mod mock;
mod pipe;
mod register;

pub use discovery::{diff_register, SensorDiscovery};
pub use mock::StaticSensorMock;
pub use pipe::{HarvestContext, HarvestError, MetricWriter, ReadingResult, ReadingsPipe};
pub use register::SensorsRegister;

use crate::model::Metric;
use anyhow::Result;
use async_trait::async_trait;

/// Sensor interface for physical measurement devices.
///
/// Concrete drivers differ only in their register protocol; the reading engine
/// sees every sensor through this contract. Sensors are shared between
/// concurrent harvest cycles, so all methods take `&self`.
///
/// # Lifecycle
/// 1. Device calls `init()` once after discovery or static declaration
/// 2. Reading engine calls `harvest(ctx)` for each cycle requesting one of `metrics()`
/// 3. Device calls `close()` on shutdown
#[async_trait]
pub trait Sensor: Send + Sync {
    /// Unique identifier, stable for the process lifetime.
    fn id(&self) -> &str;

    /// Metrics this sensor produces.
    fn metrics(&self) -> Vec<Metric>;

    /// Prepares the underlying device for reading.
    async fn init(&self) -> Result<()>;

    /// Reads the device and writes zero or more results into `ctx`.
    ///
    /// Errors are reported through the context writers and never abort the cycle.
    async fn harvest(&self, ctx: &HarvestContext);

    /// Whether the device is currently connected and usable.
    fn active(&self) -> bool;

    /// Releases the underlying device.
    async fn close(&self) -> Result<()>;

    /// True if this sensor produces at least one of `requested`.
    fn supports_any(&self, requested: &[Metric]) -> bool {
        self.metrics().iter().any(|m| requested.contains(m))
    }
}
