//! Device orchestrator - owns the sensors, the reading engine, the caches and
//! the modules, and drives them through `init`, `operate`, `reset` and `close`.

mod identity;
mod registry;

pub use identity::DeviceIdentity;

use crate::cache::{AssetsCache, RequirementsCache};
use crate::config::AgentConfig;
use crate::events::{DomainEvent, DomainEventKind, EventBus};
use crate::ledger::Ledger;
use crate::model::{DeviceModel, DeviceUpdateRequest, Location};
use crate::modules::{EventsObserver, Module, ModuleContext};
use crate::reader::SensorsReader;
use crate::requirements::RequirementsManager;
use crate::sensor::SensorsRegister;
use anyhow::{bail, Context, Result};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, error, info, warn};


/// Orchestrator lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceState {
    Uninitialized,
    Initialized,
    Operating,
    Closed,
}

pub struct Device {
    config: AgentConfig,
    identity: Arc<DeviceIdentity>,
    ledger: Arc<dyn Ledger>,
    bus: EventBus,
    reader: Arc<SensorsReader>,

    /// Sensors found by bus discovery
    sensors: RwLock<SensorsRegister>,
    /// Sensors declared at startup (mocks, fixed wiring)
    static_sensors: RwLock<SensorsRegister>,

    assets: Arc<AssetsCache>,
    requirements: Arc<RequirementsCache>,
    manager: Arc<RequirementsManager>,
    modules: Vec<Arc<dyn Module>>,

    state: Mutex<DeviceState>,
    /// Serialises reader pool rebuilds
    reader_sync: Mutex<()>,
}

impl Device {
    pub fn new(config: AgentConfig, ledger: Arc<dyn Ledger>) -> Arc<Self> {
        let identity = Arc::new(DeviceIdentity::new(config.device.id.clone()));
        let bus = EventBus::new();
        let reader = Arc::new(SensorsReader::new(config.reader.reader_config()));
        let assets = Arc::new(AssetsCache::new());
        let requirements = Arc::new(RequirementsCache::new());

        let manager = Arc::new(RequirementsManager::new(
            Arc::clone(&reader),
            Arc::clone(&requirements),
            Arc::clone(&assets),
            Arc::clone(&ledger),
            config.device.id.clone(),
        ));

        let ctx = ModuleContext {
            ledger: Arc::clone(&ledger),
            bus: bus.clone(),
            identity: Arc::clone(&identity),
            assets: Arc::clone(&assets),
            requirements: Arc::clone(&manager),
            assets_locate_distance: config.geofence.assets_locate_distance,
        };

        let modules: Vec<Arc<dyn Module>> = vec![Arc::new(EventsObserver::new(ctx))];

        Arc::new(Self {
            config,
            identity,
            ledger,
            bus,
            reader,
            sensors: RwLock::new(SensorsRegister::new()),
            static_sensors: RwLock::new(SensorsRegister::new()),
            assets,
            requirements,
            manager,
            modules,
            state: Mutex::new(DeviceState::Uninitialized),
            reader_sync: Mutex::new(()),
        })
    }

    pub fn id(&self) -> &str {
        self.identity.id()
    }

    pub fn state(&self) -> DeviceState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn reader(&self) -> &Arc<SensorsReader> {
        &self.reader
    }

    pub fn assets(&self) -> &Arc<AssetsCache> {
        &self.assets
    }

    pub fn requirements(&self) -> &Arc<RequirementsCache> {
        &self.requirements
    }

    pub fn model(&self) -> Option<DeviceModel> {
        self.identity.model()
    }

    pub fn location(&self) -> Option<Location> {
        self.identity.location()
    }

    pub fn is_logged_to_network(&self) -> bool {
        self.identity.is_logged_in()
    }

    /// Moves `from` to `to`, failing when the device is elsewhere.
    fn transition(&self, from: DeviceState, to: DeviceState) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state != from {
            bail!("Device is {:?}, expected {:?}", *state, from);
        }
        *state = to;
        Ok(())
    }

    /// Wires the device to the ledger and starts its modules.
    ///
    /// Any failure here is fatal; there is no partially started device.
    pub async fn init(self: &Arc<Self>) -> Result<()> {
        {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state != DeviceState::Uninitialized {
                bail!("Device is already initialized");
            }
        }

        self.install_removal_handler();

        let known = self
            .ledger
            .query_device(self.id())
            .await
            .context("Failed to query device from ledger")?;

        match known {
            Some(model) => self.login(model).await?,
            None => info!(
                device_id = %self.id(),
                "Device unknown to the ledger, waiting for network pairing"
            ),
        }

        for module in &self.modules {
            Arc::clone(module)
                .start()
                .await
                .with_context(|| format!("Failed to start module {}", module.mid()))?;
            debug!(module = %module.mid(), "Module started");
        }

        self.transition(DeviceState::Uninitialized, DeviceState::Initialized)?;
        info!(device_id = %self.id(), "Device initialized");
        Ok(())
    }

    /// Resets and closes the device once the ledger drops it.
    fn install_removal_handler(self: &Arc<Self>) {
        let device = Arc::downgrade(self);
        self.bus
            .once(DomainEventKind::DeviceRemovedFromNetwork, move |_| async move {
                if let Some(device) = device.upgrade() {
                    device.reset();
                    device.close().await;
                }
            });
    }

    /// Confirms the device identity on the network.
    ///
    /// Adopts `model`, announces the login, pushes supported metrics and warms
    /// the caches from the ledger.
    pub async fn login(&self, model: DeviceModel) -> Result<()> {
        if model.id != self.id() {
            bail!("Device model {} does not match device id {}", model.id, self.id());
        }

        self.identity.adopt(model);
        info!(device_id = %self.id(), "Device logged on network");
        self.bus.emit(DomainEvent::DeviceLoggedOnNetwork);

        self.update_supported_metrics().await;
        self.warm_caches().await?;

        if self.state() == DeviceState::Operating {
            self.manager.replay_pending();
        }

        Ok(())
    }

    /// Caches nearby assets and their requirements without subscribing them.
    async fn warm_caches(&self) -> Result<()> {
        let Some(origin) = self.location() else {
            return Ok(());
        };

        let assets = self
            .ledger
            .query_assets()
            .await
            .context("Failed to query assets from ledger")?;

        let threshold = self.config.geofence.assets_locate_distance;
        for asset in assets {
            self.assets.put_near_by(asset, &origin, threshold);
        }

        let asset_ids = self.assets.ids();
        if asset_ids.is_empty() {
            info!("No assets nearby");
            return Ok(());
        }

        let requirements = self
            .ledger
            .query_requirements(&asset_ids)
            .await
            .context("Failed to query requirements from ledger")?;

        let stored = requirements
            .iter()
            .filter(|req| self.manager.store_pending(req))
            .count();

        info!(assets = asset_ids.len(), requirements = stored, "Cached ledger state");
        Ok(())
    }

    /// Registers sensors, drives the reading engine and blocks until shutdown.
    pub async fn operate(&self) -> Result<()> {
        self.transition(DeviceState::Initialized, DeviceState::Operating)?;

        self.sync_reader();
        info!(sensors = self.reader.sensors_count(), "Device operating");

        self.manager.replay_pending();

        self.reader.process().await
    }

    /// Clears the local identity and the caches.
    pub fn reset(&self) {
        self.manager.clear();
        let assets = self.assets.drain().len();
        self.identity.clear();
        info!(assets = assets, "Device reset");
    }

    /// Cancels subscriptions, stops modules and the reader, closes sensors.
    ///
    /// Safe to call more than once.
    pub async fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if *state == DeviceState::Closed {
                return;
            }
            *state = DeviceState::Closed;
        }

        let cancelled = self.manager.cancel_all();
        debug!(subscriptions = cancelled, "Cancelled reading subscriptions");

        for module in &self.modules {
            module.stop().await;
        }

        self.reader.shutdown();

        for sensor in self.supported_sensors() {
            if let Err(e) = sensor.close().await {
                error!(sensor = %sensor.id(), error = %e, "Failed to close sensor");
            }
        }

        info!(device_id = %self.id(), "Device closed");
    }

    /// Pushes the aggregated supported metrics when logged on the network.
    pub async fn update_supported_metrics(&self) {
        let Some(mut model) = self.identity.model() else {
            return;
        };

        let supports: Vec<_> = self.supported_metrics().into_iter().collect();
        let patch = DeviceUpdateRequest {
            supports: Some(supports.clone()),
            location: None,
        };

        if let Err(e) = self.ledger.update_device(self.id(), &patch).await {
            error!(device_id = %self.id(), error = %e, "Failed to update supported metrics");
            return;
        }

        model.supports = supports;
        self.identity.adopt(model);
        debug!(device_id = %self.id(), "Supported metrics updated");
    }

    pub(crate) fn warn_closed(&self, operation: &str) -> bool {
        if self.state() == DeviceState::Closed {
            warn!(operation = %operation, "Device is closed");
            return true;
        }
        false
    }
}
