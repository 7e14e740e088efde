use super::{run_cycle, CancelHandle, ReductionPolicy};
use crate::model::{Metric, MetricReadings};
use crate::sensor::{HarvestError, Sensor, SensorsRegister};
use anyhow::{bail, Context, Result};
use dashmap::DashMap;
use futures::future::BoxFuture;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Receives the reduced readings of one harvest cycle
pub type ReadingsHandler = Arc<dyn Fn(MetricReadings) -> BoxFuture<'static, ()> + Send + Sync>;

/// Wraps an async closure into a [`ReadingsHandler`].
pub fn readings_handler<F, Fut>(f: F) -> ReadingsHandler
where
    F: Fn(MetricReadings) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    Arc::new(move |readings| Box::pin(f(readings)))
}

/// Reading engine configuration
#[derive(Clone, Copy, Debug)]
pub struct ReaderConfig {
    /// Deadline of a single harvest cycle
    pub harvest_timeout: Duration,
    pub reduction: ReductionPolicy,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            harvest_timeout: Duration::from_secs(1),
            reduction: ReductionPolicy::Mean,
        }
    }
}

/// Pending work for the drive loop
enum Dispatch {
    Once {
        handler: ReadingsHandler,
        metrics: Vec<Metric>,
    },
    Periodic {
        id: u64,
        handler: ReadingsHandler,
        metrics: Vec<Metric>,
        period: Duration,
        cancel: CancelHandle,
    },
}

/// Everything a spawned cycle needs, detached from the reader itself
#[derive(Clone)]
struct CycleRunner {
    sensors: Arc<RwLock<SensorsRegister>>,
    config: ReaderConfig,
    errors_tx: broadcast::Sender<HarvestError>,
    cycles: Arc<AtomicU64>,
}

impl CycleRunner {
    async fn run(&self, metrics: &[Metric]) -> MetricReadings {
        let eligible: Vec<Arc<dyn Sensor>> = {
            let sensors = self.sensors.read().unwrap_or_else(|e| e.into_inner());
            sensors
                .sensors()
                .filter(|s| s.supports_any(metrics))
                .filter(|s| {
                    let active = s.active();
                    if !active {
                        debug!(sensor = %s.id(), "Skipping inactive sensor");
                    }
                    active
                })
                .cloned()
                .collect()
        };

        if eligible.is_empty() {
            debug!(metrics = ?metrics, "No sensor supports requested metrics");
        }

        let outcome = run_cycle(eligible, metrics, self.config.harvest_timeout, self.config.reduction).await;

        for err in outcome.errors {
            warn!(sensor = %err.source, error = %err, "Sensor harvest error");
            // No subscribers is fine
            let _ = self.errors_tx.send(err);
        }

        self.cycles.fetch_add(1, Ordering::Relaxed);

        debug!(
            dispatched = outcome.dispatched,
            reported = outcome.readings.len(),
            timed_out = outcome.timed_out,
            "Harvest cycle complete"
        );

        outcome.readings
    }
}

/// Sensors reader: schedules harvest cycles and delivers reduced readings.
///
/// Requests are queued by [`send_once`](Self::send_once) and
/// [`subscribe`](Self::subscribe) and dispatched by the drive loop in
/// [`process`](Self::process). Each one-shot request runs one cycle in its own
/// task; each subscription owns one task that ticks every period until its
/// [`CancelHandle`] is cancelled.
pub struct SensorsReader {
    runner: CycleRunner,

    requests_tx: mpsc::UnboundedSender<Dispatch>,
    requests_rx: Mutex<Option<mpsc::UnboundedReceiver<Dispatch>>>,

    /// Live periodic subscriptions
    subscriptions: Arc<DashMap<u64, CancelHandle>>,
    next_subscription_id: AtomicU64,

    shutdown_tx: watch::Sender<bool>,
}

impl SensorsReader {
    pub fn new(config: ReaderConfig) -> Self {
        let (requests_tx, requests_rx) = mpsc::unbounded_channel();
        let (errors_tx, _) = broadcast::channel(256);
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            runner: CycleRunner {
                sensors: Arc::new(RwLock::new(SensorsRegister::new())),
                config,
                errors_tx,
                cycles: Arc::new(AtomicU64::new(0)),
            },
            requests_tx,
            requests_rx: Mutex::new(Some(requests_rx)),
            subscriptions: Arc::new(DashMap::new()),
            next_subscription_id: AtomicU64::new(1),
            shutdown_tx,
        }
    }

    /// Adds sensors to the reading pool, replacing any with the same id.
    pub fn register_sensors(&self, sensors: Vec<Arc<dyn Sensor>>) {
        let mut register = self.runner.sensors.write().unwrap_or_else(|e| e.into_inner());
        for sensor in sensors {
            register.insert(sensor);
        }
    }

    /// Swaps the whole reading pool for `sensors` under one lock.
    pub fn replace_sensors(&self, sensors: Vec<Arc<dyn Sensor>>) {
        let mut register = self.runner.sensors.write().unwrap_or_else(|e| e.into_inner());
        register.clear();
        for sensor in sensors {
            register.insert(sensor);
        }
    }

    pub fn sensors_count(&self) -> usize {
        self.runner.sensors.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn supported_metrics(&self) -> BTreeSet<Metric> {
        self.runner
            .sensors
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .supported_metrics()
    }

    /// Queues a single harvest cycle for `metrics`.
    ///
    /// Returns as soon as the request is queued; `handler` is invoked exactly
    /// once with the (possibly empty) reduced readings.
    pub fn send_once(&self, handler: ReadingsHandler, metrics: Vec<Metric>) {
        if self.requests_tx.send(Dispatch::Once { handler, metrics }).is_err() {
            warn!("Reader is closed, dropping one-shot reading request");
        }
    }

    /// Queues a periodic subscription for `metrics`.
    ///
    /// The first cycle fires one `period` after dispatch, not immediately.
    pub fn subscribe(
        &self,
        handler: ReadingsHandler,
        period: Duration,
        metrics: Vec<Metric>,
    ) -> Result<CancelHandle> {
        if period.is_zero() {
            bail!("Subscription period must be positive");
        }

        let id = self.next_subscription_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancelHandle::new();
        self.subscriptions.insert(id, cancel.clone());

        let dispatch = Dispatch::Periodic {
            id,
            handler,
            metrics,
            period,
            cancel: cancel.clone(),
        };

        if self.requests_tx.send(dispatch).is_err() {
            self.subscriptions.remove(&id);
            cancel.cancel();
            bail!("Reader is closed");
        }

        Ok(cancel)
    }

    /// Number of periodic subscriptions not yet cancelled.
    pub fn active_subscriptions(&self) -> usize {
        self.subscriptions
            .iter()
            .filter(|entry| !entry.value().is_cancelled())
            .count()
    }

    /// Total harvest cycles completed.
    pub fn completed_cycles(&self) -> u64 {
        self.runner.cycles.load(Ordering::Relaxed)
    }

    /// Subscribe to sensor errors reported during harvests
    pub fn subscribe_errors(&self) -> broadcast::Receiver<HarvestError> {
        self.runner.errors_tx.subscribe()
    }

    /// Stops the drive loop and cancels every subscription.
    ///
    /// Safe to call before `process` or more than once.
    pub fn shutdown(&self) {
        self.shutdown_tx.send_replace(true);
        self.cancel_all();
    }

    fn cancel_all(&self) {
        for entry in self.subscriptions.iter() {
            entry.value().cancel();
        }
        self.subscriptions.clear();
    }

    /// Drive loop: dispatches queued one-shot and periodic requests until
    /// [`shutdown`](Self::shutdown) is called.
    pub async fn process(&self) -> Result<()> {
        let mut requests = self
            .requests_rx
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
            .context("Reader is already processing or has been closed")?;

        let mut shutdown = self.shutdown_tx.subscribe();

        info!(sensors = self.sensors_count(), "Sensors reader processing");

        loop {
            tokio::select! {
                _ = shutdown.wait_for(|stop| *stop) => break,
                request = requests.recv() => match request {
                    Some(request) => self.dispatch(request),
                    None => break,
                },
            }
        }

        self.cancel_all();
        info!(cycles = self.completed_cycles(), "Sensors reader stopped");
        Ok(())
    }

    fn dispatch(&self, request: Dispatch) {
        match request {
            Dispatch::Once { handler, metrics } => {
                let runner = self.runner.clone();
                tokio::spawn(async move {
                    let readings = runner.run(&metrics).await;
                    handler(readings).await;
                });
            }
            Dispatch::Periodic {
                id,
                handler,
                metrics,
                period,
                cancel,
            } => {
                if cancel.is_cancelled() {
                    self.subscriptions.remove(&id);
                    return;
                }

                let runner = self.runner.clone();
                let subscriptions = Arc::clone(&self.subscriptions);

                tokio::spawn(async move {
                    debug!(subscription = id, period_ms = period.as_millis() as u64, "Subscription started");

                    let mut ticker = interval_at(Instant::now() + period, period);
                    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

                    loop {
                        tokio::select! {
                            biased;
                            _ = cancel.cancelled() => break,
                            _ = ticker.tick() => {}
                        }

                        let readings = runner.run(&metrics).await;
                        handler(readings).await;

                        if cancel.is_cancelled() {
                            break;
                        }
                    }

                    subscriptions.remove(&id);
                    debug!(subscription = id, "Subscription stopped");
                });
            }
        }
    }
}

impl Default for SensorsReader {
    fn default() -> Self {
        Self::new(ReaderConfig::default())
    }
}
