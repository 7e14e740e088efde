// Pluggable device behaviours started alongside the reading engine

mod events_observer;

pub use events_observer::{EventsObserver, StartState};

use crate::cache::AssetsCache;
use crate::device::DeviceIdentity;
use crate::events::EventBus;
use crate::ledger::Ledger;
use crate::requirements::RequirementsManager;
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// Shared handles a module is built from
#[derive(Clone)]
pub struct ModuleContext {
    pub ledger: Arc<dyn Ledger>,
    pub bus: EventBus,
    pub identity: Arc<DeviceIdentity>,
    pub assets: Arc<AssetsCache>,
    pub requirements: Arc<RequirementsManager>,
    /// Geofence threshold in metres
    pub assets_locate_distance: f64,
}

/// Unit of device behaviour with its own lifecycle.
///
/// # Lifecycle
/// 1. Device builds the module from a [`ModuleContext`]
/// 2. Device calls `start()` during init; the module may defer its work
/// 3. Device calls `stop()` on close, whether or not the module ever ran
#[async_trait]
pub trait Module: Send + Sync {
    /// Module identifier used in logs.
    fn mid(&self) -> &str;

    async fn start(self: Arc<Self>) -> Result<()>;

    /// Stops all module tasks. Must be idempotent.
    async fn stop(&self);
}
