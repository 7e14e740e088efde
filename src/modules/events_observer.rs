use super::{Module, ModuleContext};
use crate::events::{DomainEvent, DomainEventKind};
use crate::ledger::{ChangeEvent, Topic};
use crate::model::{Asset, DeviceModel, EventKind, Requirements};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Deserialize;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Startup gating of the ledger listeners
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StartState {
    NotStarted,
    /// Resumption registered on the next network login
    AwaitingNetworkLogin,
    /// Listeners running; terminal for the session
    Running,
}

/// Removed events only need the entity id
#[derive(Deserialize)]
struct EntityRef {
    id: String,
}

/// Watches ledger changes for assets, this device and requirements.
///
/// Listeners only start once the device is logged on the network. Each one
/// runs on its own task and applies events to the caches; cross-cutting
/// effects are published on the event bus.
pub struct EventsObserver {
    ctx: ModuleContext,
    state: Mutex<StartState>,
    resumption: Mutex<Option<JoinHandle<()>>>,
    listeners: Mutex<Vec<JoinHandle<()>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl EventsObserver {
    pub const MID: &'static str = "events_observer";

    pub fn new(ctx: ModuleContext) -> Self {
        Self {
            ctx,
            state: Mutex::new(StartState::NotStarted),
            resumption: Mutex::new(None),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn state(&self) -> StartState {
        *lock(&self.state)
    }

    /// Starts the listeners, or defers them until network login.
    ///
    /// Calls while awaiting login or already running are no-ops.
    fn begin(self: &Arc<Self>) {
        let mut state = lock(&self.state);

        if *state != StartState::NotStarted {
            debug!(state = ?*state, "Events observer already started");
            return;
        }

        if !self.ctx.identity.is_logged_in() {
            let this = Arc::clone(self);
            let handle = self
                .ctx
                .bus
                .once(DomainEventKind::DeviceLoggedOnNetwork, move |_| async move {
                    this.resume();
                });

            // Login may have landed between the check and the registration
            if !self.ctx.identity.is_logged_in() {
                *state = StartState::AwaitingNetworkLogin;
                *lock(&self.resumption) = Some(handle);
                info!("Device not logged on network, events observer waiting for login");
                return;
            }

            handle.abort();
        }

        *state = StartState::Running;
        drop(state);
        self.spawn_listeners();
    }

    fn resume(self: &Arc<Self>) {
        let mut state = lock(&self.state);
        if *state != StartState::AwaitingNetworkLogin {
            return;
        }

        *state = StartState::Running;
        drop(state);

        info!("Device logged on network, resuming events observer");
        self.spawn_listeners();
    }

    fn spawn_listeners(&self) {
        let mut listeners = lock(&self.listeners);

        for topic in [Topic::Assets, Topic::Devices, Topic::Requirements] {
            let ctx = self.ctx.clone();
            listeners.push(tokio::spawn(async move { listen(ctx, topic).await }));
        }

        info!(listeners = listeners.len(), "Events observer running");
    }
}

#[async_trait]
impl Module for EventsObserver {
    fn mid(&self) -> &str {
        Self::MID
    }

    async fn start(self: Arc<Self>) -> Result<()> {
        self.begin();
        Ok(())
    }

    async fn stop(&self) {
        if let Some(handle) = lock(&self.resumption).take() {
            handle.abort();
        }

        let listeners: Vec<JoinHandle<()>> = lock(&self.listeners).drain(..).collect();
        for handle in &listeners {
            handle.abort();
        }

        if !listeners.is_empty() {
            info!(listeners = listeners.len(), "Events observer stopped");
        }
    }
}

/// Listener task: applies every change event of `topic` until the stream ends.
async fn listen(ctx: ModuleContext, topic: Topic) {
    let mut changes = match ctx.ledger.subscribe(topic).await {
        Ok(changes) => changes,
        Err(e) => {
            error!(topic = %topic, error = %e, "Failed to subscribe to ledger changes");
            return;
        }
    };

    debug!(topic = %topic, "Listening to ledger changes");

    while let Some(event) = changes.next().await {
        let applied = match topic {
            Topic::Assets => on_asset_event(&ctx, &event),
            Topic::Devices => on_device_event(&ctx, &event),
            Topic::Requirements => on_requirements_event(&ctx, &event),
        };

        if let Err(e) = applied {
            warn!(topic = %topic, kind = %event.kind, error = %e, "Failed to handle ledger change");
        }
    }

    debug!(topic = %topic, "Ledger change stream ended");
}

fn on_asset_event(ctx: &ModuleContext, event: &ChangeEvent) -> Result<()> {
    match event.kind {
        EventKind::Inserted | EventKind::Updated => {
            let asset: Asset = event.decode()?;
            let Some(origin) = ctx.identity.location() else {
                ctx.assets.remove(&asset.id);
                return Ok(());
            };

            let asset_id = asset.id.clone();
            let cached = ctx
                .assets
                .put_near_by(asset, &origin, ctx.assets_locate_distance);
            debug!(asset_id = %asset_id, cached = cached, "Asset {}", event.kind);
        }
        EventKind::Removed => {
            let asset: EntityRef = event.decode()?;
            ctx.assets.remove(&asset.id);
            debug!(asset_id = %asset.id, "Asset removed");
        }
    }

    Ok(())
}

fn on_device_event(ctx: &ModuleContext, event: &ChangeEvent) -> Result<()> {
    if event.kind == EventKind::Removed {
        let device: EntityRef = event.decode()?;
        if device.id == ctx.identity.id() {
            warn!(device_id = %device.id, "Device removed from network");
            ctx.bus.emit(DomainEvent::DeviceRemovedFromNetwork);
        }
        return Ok(());
    }

    let device: DeviceModel = event.decode()?;
    if device.id != ctx.identity.id() {
        return Ok(());
    }

    let new = device.location;
    let previous = ctx.identity.adopt(device);
    debug!(device_id = %ctx.identity.id(), "Device model {}", event.kind);

    if event.kind == EventKind::Updated {
        if let Some(old) = previous.map(|m| m.location) {
            if !old.is_near_by(&new, ctx.assets_locate_distance) {
                info!(
                    distance = old.distance(&new),
                    "Device location changed"
                );
                ctx.bus.emit(DomainEvent::DeviceLocationChanged { old, new });
            }
        }
    }

    Ok(())
}

fn on_requirements_event(ctx: &ModuleContext, event: &ChangeEvent) -> Result<()> {
    match event.kind {
        EventKind::Inserted | EventKind::Updated => {
            let requirements: Requirements = event.decode()?;
            if let Some(request) = ctx.requirements.submit(&requirements) {
                info!(
                    requirements_id = %request.id,
                    asset_id = %request.asset_id,
                    period_secs = request.period.as_secs(),
                    "Requirements subscribed to reading sensors"
                );
                ctx.bus.emit(DomainEvent::RequirementsSubmitted {
                    requests: vec![request],
                });
            }
        }
        EventKind::Removed => {
            let requirements: EntityRef = event.decode()?;
            ctx.requirements.withdraw(&requirements.id);
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{AssetsCache, RequirementsCache};
    use crate::device::DeviceIdentity;
    use crate::events::EventBus;
    use crate::ledger::{ChangeStream, Ledger, MemoryLedger};
    use crate::model::{DeviceUpdateRequest, Location, Metric, MetricReadingsRecord};
    use crate::reader::{ReaderConfig, SensorsReader};
    use crate::requirements::RequirementsManager;
    use std::time::Duration;

    const THRESHOLD: f64 = 100.0;

    struct Fixture {
        observer: Arc<EventsObserver>,
        ledger: Arc<MemoryLedger>,
        bus: EventBus,
        identity: Arc<DeviceIdentity>,
        assets: Arc<AssetsCache>,
        requirements: Arc<RequirementsCache>,
        reader: Arc<SensorsReader>,
    }

    fn fixture() -> Fixture {
        fixture_with(|ledger| ledger)
    }

    /// Builds the fixture with the observer reading through `wrap(ledger)`
    fn fixture_with<F>(wrap: F) -> Fixture
    where
        F: FnOnce(Arc<MemoryLedger>) -> Arc<dyn Ledger>,
    {
        let ledger = Arc::new(MemoryLedger::new());
        let bus = EventBus::new();
        let identity = Arc::new(DeviceIdentity::new("dev-1"));
        let assets = Arc::new(AssetsCache::new());
        let requirements = Arc::new(RequirementsCache::new());
        let reader = Arc::new(SensorsReader::new(ReaderConfig::default()));

        let manager = Arc::new(RequirementsManager::new(
            Arc::clone(&reader),
            Arc::clone(&requirements),
            Arc::clone(&assets),
            ledger.clone(),
            "dev-1".to_string(),
        ));

        let observer = Arc::new(EventsObserver::new(ModuleContext {
            ledger: wrap(ledger.clone()),
            bus: bus.clone(),
            identity: Arc::clone(&identity),
            assets: Arc::clone(&assets),
            requirements: manager,
            assets_locate_distance: THRESHOLD,
        }));

        Fixture {
            observer,
            ledger,
            bus,
            identity,
            assets,
            requirements,
            reader,
        }
    }

    /// Memory ledger whose asset change stream cannot be opened
    struct NoAssetsLedger(Arc<MemoryLedger>);

    #[async_trait]
    impl Ledger for NoAssetsLedger {
        async fn subscribe(&self, topic: Topic) -> Result<ChangeStream> {
            if topic == Topic::Assets {
                anyhow::bail!("assets stream unavailable");
            }
            self.0.subscribe(topic).await
        }

        async fn post_readings(&self, record: &MetricReadingsRecord) -> Result<()> {
            self.0.post_readings(record).await
        }

        async fn update_device(&self, device_id: &str, patch: &DeviceUpdateRequest) -> Result<()> {
            self.0.update_device(device_id, patch).await
        }

        async fn query_device(&self, device_id: &str) -> Result<Option<DeviceModel>> {
            self.0.query_device(device_id).await
        }

        async fn query_assets(&self) -> Result<Vec<Asset>> {
            self.0.query_assets().await
        }

        async fn query_requirements(&self, asset_ids: &[String]) -> Result<Vec<Requirements>> {
            self.0.query_requirements(asset_ids).await
        }

        async fn close(&self) -> Result<()> {
            self.0.close().await
        }
    }

    fn device_at(latitude: f64, longitude: f64) -> DeviceModel {
        DeviceModel {
            id: "dev-1".to_string(),
            name: "agent".to_string(),
            hostname: String::new(),
            location: Location::new(latitude, longitude),
            supports: vec![],
        }
    }

    fn asset_at(id: &str, latitude: f64, longitude: f64) -> Asset {
        Asset {
            id: id.to_string(),
            name: String::new(),
            sku: None,
            location: Location::new(latitude, longitude),
        }
    }

    /// Logs the device in the way the device orchestrator does
    fn login(f: &Fixture) {
        f.identity.adopt(device_at(0.0, 0.0));
        f.bus.emit(DomainEvent::DeviceLoggedOnNetwork);
    }

    /// Lets spawned listeners subscribe and drain pending events
    async fn settle() {
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
    }

    async fn wait_until<F: Fn() -> bool>(condition: F) {
        tokio::time::timeout(Duration::from_secs(1), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached in time");
    }

    #[tokio::test]
    async fn test_start_before_login_registers_single_resumption() {
        let f = fixture();
        let receivers = f.bus.receiver_count();

        for _ in 0..3 {
            Arc::clone(&f.observer).start().await.unwrap();
        }

        assert_eq!(f.observer.state(), StartState::AwaitingNetworkLogin);
        assert_eq!(f.bus.receiver_count(), receivers + 1);
        assert_eq!(f.ledger.subscribe_calls(Topic::Assets), 0);

        login(&f);
        wait_until(|| f.ledger.subscribe_calls(Topic::Requirements) == 1).await;
        settle().await;

        assert_eq!(f.observer.state(), StartState::Running);
        assert_eq!(f.ledger.subscribe_calls(Topic::Assets), 1);
        assert_eq!(f.ledger.subscribe_calls(Topic::Devices), 1);
        assert_eq!(f.ledger.subscribe_calls(Topic::Requirements), 1);

        // Running is terminal
        Arc::clone(&f.observer).start().await.unwrap();
        login(&f);
        settle().await;
        assert_eq!(f.ledger.subscribe_calls(Topic::Assets), 1);
    }

    #[tokio::test]
    async fn test_start_when_logged_in_runs_immediately() {
        let f = fixture();
        f.identity.adopt(device_at(0.0, 0.0));

        Arc::clone(&f.observer).start().await.unwrap();

        assert_eq!(f.observer.state(), StartState::Running);
        wait_until(|| f.ledger.subscribe_calls(Topic::Devices) == 1).await;
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let f = fixture();
        f.observer.stop().await;
        f.observer.stop().await;
        assert_eq!(f.observer.state(), StartState::NotStarted);
    }

    #[tokio::test]
    async fn test_assets_pass_through_geofence() {
        let f = fixture();
        login(&f);
        Arc::clone(&f.observer).start().await.unwrap();
        wait_until(|| f.ledger.subscribe_calls(Topic::Assets) == 1).await;

        f.ledger.put_asset(asset_at("near", 0.0, 0.0005));
        f.ledger.put_asset(asset_at("far", 1.0, 1.0));
        wait_until(|| f.assets.exists("near")).await;
        settle().await;
        assert!(!f.assets.exists("far"));

        // Moving away evicts
        f.ledger.put_asset(asset_at("near", 2.0, 2.0));
        wait_until(|| !f.assets.exists("near")).await;

        f.ledger.put_asset(asset_at("back", 0.0, 0.0));
        wait_until(|| f.assets.exists("back")).await;
        f.ledger.remove_asset("back");
        wait_until(|| !f.assets.exists("back")).await;
    }

    #[tokio::test]
    async fn test_device_location_change_is_published() {
        let f = fixture();
        login(&f);
        Arc::clone(&f.observer).start().await.unwrap();
        wait_until(|| f.ledger.subscribe_calls(Topic::Devices) == 1).await;

        let mut events = f.bus.subscribe();

        f.ledger.put_device(device_at(0.0, 0.0));
        // Small move stays within the threshold
        f.ledger.put_device(device_at(0.0, 0.0001));
        f.ledger.put_device(device_at(0.5, 0.5));

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();

        match event {
            DomainEvent::DeviceLocationChanged { old, new } => {
                assert_eq!(old, Location::new(0.0, 0.0001));
                assert_eq!(new, Location::new(0.5, 0.5));
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(f.identity.location(), Some(Location::new(0.5, 0.5)));
    }

    #[tokio::test]
    async fn test_other_devices_are_ignored() {
        let f = fixture();
        login(&f);
        Arc::clone(&f.observer).start().await.unwrap();
        wait_until(|| f.ledger.subscribe_calls(Topic::Devices) == 1).await;

        let mut stranger = device_at(5.0, 5.0);
        stranger.id = "dev-2".to_string();
        f.ledger.put_device(stranger);
        f.ledger.remove_device("dev-2");
        settle().await;

        assert_eq!(f.identity.location(), Some(Location::new(0.0, 0.0)));
    }

    #[tokio::test]
    async fn test_device_removal_is_published() {
        let f = fixture();
        login(&f);
        Arc::clone(&f.observer).start().await.unwrap();
        wait_until(|| f.ledger.subscribe_calls(Topic::Devices) == 1).await;

        let mut events = f.bus.subscribe();
        f.ledger.put_device(device_at(0.0, 0.0));
        f.ledger.remove_device("dev-1");

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event.kind(), DomainEventKind::DeviceRemovedFromNetwork);
    }

    #[tokio::test]
    async fn test_requirements_lifecycle() {
        let f = fixture();
        login(&f);
        Arc::clone(&f.observer).start().await.unwrap();
        wait_until(|| f.ledger.subscribe_calls(Topic::Requirements) == 1).await;
        wait_until(|| f.ledger.subscribe_calls(Topic::Assets) == 1).await;

        {
            let reader = Arc::clone(&f.reader);
            tokio::spawn(async move { reader.process().await });
        }

        let mut events = f.bus.subscribe();

        f.ledger.put_asset(asset_at("a1", 0.0, 0.0));
        wait_until(|| f.assets.exists("a1")).await;

        // Unknown asset: ignored
        f.ledger.put_requirements(Requirements {
            id: "r0".to_string(),
            asset_id: "elsewhere".to_string(),
            metrics: vec![Metric::from("humidity")],
            period: 5,
        });

        f.ledger.put_requirements(Requirements {
            id: "r1".to_string(),
            asset_id: "a1".to_string(),
            metrics: vec![Metric::from("humidity")],
            period: 5,
        });

        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            DomainEvent::RequirementsSubmitted { requests } => {
                assert_eq!(requests.len(), 1);
                assert_eq!(requests[0].id, "r1");
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert!(!f.requirements.exists("r0"));
        assert_eq!(f.reader.active_subscriptions(), 1);

        f.ledger.put_requirements(Requirements {
            id: "r1".to_string(),
            asset_id: "a1".to_string(),
            metrics: vec![Metric::from("humidity")],
            period: 10,
        });
        wait_until(|| {
            f.requirements
                .get("r1")
                .map(|r| r.period == Duration::from_secs(10))
                .unwrap_or(false)
        })
        .await;
        assert_eq!(f.reader.active_subscriptions(), 1);

        f.ledger.remove_requirements("r1");
        wait_until(|| !f.requirements.exists("r1")).await;
        assert_eq!(f.reader.active_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_malformed_change_keeps_listener_alive() {
        let f = fixture();
        login(&f);
        Arc::clone(&f.observer).start().await.unwrap();
        wait_until(|| f.ledger.subscribe_calls(Topic::Assets) == 1).await;

        f.ledger.publish(
            Topic::Assets,
            ChangeEvent {
                kind: EventKind::Inserted,
                entity: serde_json::json!({"bogus": 1}),
            },
        );
        f.ledger.put_asset(asset_at("a1", 0.0, 0.0));

        wait_until(|| f.assets.exists("a1")).await;
        assert_eq!(f.assets.ids(), vec!["a1".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_subscribe_ends_only_that_listener() {
        let f = fixture_with(|ledger| Arc::new(NoAssetsLedger(ledger)) as Arc<dyn Ledger>);
        login(&f);
        Arc::clone(&f.observer).start().await.unwrap();
        wait_until(|| f.ledger.subscribe_calls(Topic::Devices) == 1).await;
        wait_until(|| f.ledger.subscribe_calls(Topic::Requirements) == 1).await;
        assert_eq!(f.observer.state(), StartState::Running);

        // No asset listener: published assets never reach the cache
        f.ledger.put_asset(asset_at("ignored", 0.0, 0.0));
        settle().await;
        assert!(!f.assets.exists("ignored"));

        f.ledger.put_device(device_at(0.0, 0.0002));
        wait_until(|| f.identity.location() == Some(Location::new(0.0, 0.0002))).await;

        f.assets
            .put_near_by(asset_at("a1", 0.0, 0.0), &Location::new(0.0, 0.0), THRESHOLD);
        f.ledger.put_requirements(Requirements {
            id: "r1".to_string(),
            asset_id: "a1".to_string(),
            metrics: vec![Metric::from("humidity")],
            period: 5,
        });
        wait_until(|| f.requirements.exists("r1")).await;
    }

    #[tokio::test]
    async fn test_stop_aborts_listeners() {
        let f = fixture();
        login(&f);
        Arc::clone(&f.observer).start().await.unwrap();
        wait_until(|| f.ledger.subscribe_calls(Topic::Assets) == 1).await;

        f.observer.stop().await;
        settle().await;

        f.ledger.put_asset(asset_at("late", 0.0, 0.0));
        settle().await;
        assert!(!f.assets.exists("late"));
    }
}
