//! Requirements manager - turns cached requirements into reading subscriptions.
//!
//! Every requirement accepted for a cached asset gets exactly one reading
//! subscription: a single `send_once` cycle when its period is zero, a
//! periodic subscription otherwise. Replacing or dropping a requirement always
//! cancels the previous subscription first, so no periodic task outlives the
//! requirement that authorised it.

use crate::cache::{AssetsCache, ReadingsRequest, RequirementsCache, Subscription};
use crate::ledger::Ledger;
use crate::model::{MetricReadings, MetricReadingsRecord, Requirements};
use crate::reader::{readings_handler, ReadingsHandler, SensorsReader};
use std::sync::{Arc, Mutex};
use tracing::{debug, error, info};


pub struct RequirementsManager {
    reader: Arc<SensorsReader>,
    requirements: Arc<RequirementsCache>,
    assets: Arc<AssetsCache>,
    ledger: Arc<dyn Ledger>,
    device_id: String,
    /// Serializes subscription changes across listeners and replay
    ops: Mutex<()>,
}

impl RequirementsManager {
    pub fn new(
        reader: Arc<SensorsReader>,
        requirements: Arc<RequirementsCache>,
        assets: Arc<AssetsCache>,
        ledger: Arc<dyn Ledger>,
        device_id: String,
    ) -> Self {
        Self {
            reader,
            requirements,
            assets,
            ledger,
            device_id,
            ops: Mutex::new(()),
        }
    }

    /// Accepts inserted or updated requirements.
    ///
    /// Any subscription already held for `req.id` is cancelled first. The
    /// requirement is then subscribed and cached only if its asset is cached;
    /// returns the new request when accepted.
    pub fn submit(&self, req: &Requirements) -> Option<ReadingsRequest> {
        let _guard = self.ops.lock().unwrap_or_else(|e| e.into_inner());

        if let Some(previous) = self.requirements.remove(&req.id) {
            previous.cancel();
            debug!(requirements_id = %req.id, "Cancelled previous subscription");
        }

        if !self.assets.exists(&req.asset_id) {
            debug!(
                requirements_id = %req.id,
                asset_id = %req.asset_id,
                "Asset is not cached, ignoring requirements"
            );
            return None;
        }

        let mut request = ReadingsRequest::from(req);
        self.activate(&mut request);
        self.requirements.put(request.clone());

        Some(request)
    }

    /// Cancels and drops the requirement `id`. Returns whether it was cached.
    pub fn withdraw(&self, id: &str) -> bool {
        let _guard = self.ops.lock().unwrap_or_else(|e| e.into_inner());

        match self.requirements.remove(id) {
            Some(request) => {
                request.cancel();
                debug!(
                    requirements_id = %id,
                    "Requirements removed and unsubscribed from reading sensors"
                );
                true
            }
            None => false,
        }
    }

    /// Caches requirements without subscribing them (startup warm-up).
    ///
    /// Skipped when the asset is not cached or the id is already known.
    pub fn store_pending(&self, req: &Requirements) -> bool {
        let _guard = self.ops.lock().unwrap_or_else(|e| e.into_inner());

        if !self.assets.exists(&req.asset_id) || self.requirements.exists(&req.id) {
            return false;
        }

        self.requirements.put(ReadingsRequest::from(req));
        true
    }

    /// Subscribes every cached requirement still pending. Returns how many.
    pub fn replay_pending(&self) -> usize {
        let _guard = self.ops.lock().unwrap_or_else(|e| e.into_inner());

        let pending = self.requirements.pending();
        let count = pending.len();

        for mut request in pending {
            self.activate(&mut request);
            self.requirements.put(request);
        }

        if count > 0 {
            info!(count = count, "Replayed cached requirements");
        }

        count
    }

    /// Cancels every subscription, keeping the cache entries.
    pub fn cancel_all(&self) -> usize {
        let _guard = self.ops.lock().unwrap_or_else(|e| e.into_inner());

        let mut cancelled = 0;
        for request in self.requirements.values() {
            if request.is_subscribed() {
                cancelled += 1;
            }
            request.cancel();
        }

        cancelled
    }

    /// Cancels every subscription and empties the cache.
    pub fn clear(&self) {
        let _guard = self.ops.lock().unwrap_or_else(|e| e.into_inner());

        for request in self.requirements.drain() {
            request.cancel();
        }
    }

    fn activate(&self, request: &mut ReadingsRequest) {
        let handler = self.handler(request);

        if request.period.is_zero() {
            self.reader.send_once(handler, request.metrics.clone());
            request.subscription = Subscription::OneShot;
            return;
        }

        match self
            .reader
            .subscribe(handler, request.period, request.metrics.clone())
        {
            Ok(cancel) => request.subscription = Subscription::Periodic(cancel),
            Err(e) => {
                error!(
                    requirements_id = %request.id,
                    error = %e,
                    "Failed to subscribe requirements to reader"
                );
                request.subscription = Subscription::Pending;
            }
        }
    }

    fn handler(&self, request: &ReadingsRequest) -> ReadingsHandler {
        let ledger = Arc::clone(&self.ledger);
        let requirements_id = request.id.clone();
        let asset_id = request.asset_id.clone();
        let device_id = self.device_id.clone();

        readings_handler(move |readings| {
            let ledger = Arc::clone(&ledger);
            let requirements_id = requirements_id.clone();
            let asset_id = asset_id.clone();
            let device_id = device_id.clone();
            async move {
                post_readings(
                    ledger.as_ref(),
                    &requirements_id,
                    &asset_id,
                    &device_id,
                    readings,
                )
                .await;
            }
        })
    }
}

/// Posts one cycle's readings; failures are logged and dropped.
async fn post_readings(
    ledger: &dyn Ledger,
    requirements_id: &str,
    asset_id: &str,
    device_id: &str,
    readings: MetricReadings,
) {
    if readings.is_empty() {
        debug!(requirements_id = %requirements_id, "No readings harvested, nothing to post");
        return;
    }

    let record = MetricReadingsRecord::new(requirements_id, asset_id, device_id, readings);

    if let Err(e) = ledger.post_readings(&record).await {
        error!(
            requirements_id = %requirements_id,
            asset_id = %asset_id,
            error = %e,
            "Failed to post readings"
        );
    }
}
