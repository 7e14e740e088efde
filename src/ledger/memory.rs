use super::{ChangeEvent, ChangeStream, Ledger, Topic};
use crate::model::{
    Asset, DeviceModel, DeviceUpdateRequest, EventKind, MetricReadingsRecord, Requirements,
};
use anyhow::Result;
use async_trait::async_trait;
use futures::StreamExt;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// In-process ledger.
///
/// Holds assets, devices and requirements in memory and fans every mutation
/// out to subscribers as a [`ChangeEvent`]. Posted readings and device
/// updates are recorded for inspection.
#[derive(Default)]
pub struct MemoryLedger {
    assets: Mutex<HashMap<String, Asset>>,
    devices: Mutex<HashMap<String, DeviceModel>>,
    requirements: Mutex<HashMap<String, Requirements>>,

    subscribers: Mutex<HashMap<Topic, Vec<mpsc::UnboundedSender<ChangeEvent>>>>,
    subscribe_calls: Mutex<HashMap<Topic, usize>>,

    posted: Mutex<Vec<MetricReadingsRecord>>,
    device_updates: Mutex<Vec<(String, DeviceUpdateRequest)>>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    fn emit<T: Serialize>(&self, topic: Topic, kind: EventKind, entity: &T) {
        let event = match ChangeEvent::new(kind, entity) {
            Ok(event) => event,
            Err(e) => {
                debug!(topic = %topic, error = %e, "Dropping unserializable change event");
                return;
            }
        };

        self.publish(topic, event);
    }

    /// Fans `event` out to the `topic` subscribers as is, without touching the store.
    pub fn publish(&self, topic: Topic, event: ChangeEvent) {
        let mut subscribers = lock(&self.subscribers);
        if let Some(senders) = subscribers.get_mut(&topic) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
    }

    fn upsert_kind(exists: bool) -> EventKind {
        if exists {
            EventKind::Updated
        } else {
            EventKind::Inserted
        }
    }

    pub fn put_asset(&self, asset: Asset) {
        let existed = lock(&self.assets).insert(asset.id.clone(), asset.clone()).is_some();
        self.emit(Topic::Assets, Self::upsert_kind(existed), &asset);
    }

    pub fn remove_asset(&self, id: &str) {
        let removed = lock(&self.assets).remove(id);
        if let Some(asset) = removed {
            self.emit(Topic::Assets, EventKind::Removed, &asset);
        }
    }

    pub fn put_device(&self, device: DeviceModel) {
        let existed = lock(&self.devices)
            .insert(device.id.clone(), device.clone())
            .is_some();
        self.emit(Topic::Devices, Self::upsert_kind(existed), &device);
    }

    pub fn remove_device(&self, id: &str) {
        let removed = lock(&self.devices).remove(id);
        if let Some(device) = removed {
            self.emit(Topic::Devices, EventKind::Removed, &device);
        }
    }

    pub fn put_requirements(&self, requirements: Requirements) {
        let existed = lock(&self.requirements)
            .insert(requirements.id.clone(), requirements.clone())
            .is_some();
        self.emit(Topic::Requirements, Self::upsert_kind(existed), &requirements);
    }

    pub fn remove_requirements(&self, id: &str) {
        let removed = lock(&self.requirements).remove(id);
        if let Some(requirements) = removed {
            self.emit(Topic::Requirements, EventKind::Removed, &requirements);
        }
    }

    /// Readings posted so far
    pub fn posted_readings(&self) -> Vec<MetricReadingsRecord> {
        lock(&self.posted).clone()
    }

    /// Device updates received so far
    pub fn device_updates(&self) -> Vec<(String, DeviceUpdateRequest)> {
        lock(&self.device_updates).clone()
    }

    /// How many times `subscribe(topic)` was called
    pub fn subscribe_calls(&self, topic: Topic) -> usize {
        lock(&self.subscribe_calls).get(&topic).copied().unwrap_or(0)
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn subscribe(&self, topic: Topic) -> Result<ChangeStream> {
        let (tx, rx) = mpsc::unbounded_channel();

        lock(&self.subscribers).entry(topic).or_default().push(tx);
        *lock(&self.subscribe_calls).entry(topic).or_default() += 1;

        Ok(UnboundedReceiverStream::new(rx).boxed())
    }

    async fn post_readings(&self, record: &MetricReadingsRecord) -> Result<()> {
        lock(&self.posted).push(record.clone());
        Ok(())
    }

    async fn update_device(&self, device_id: &str, patch: &DeviceUpdateRequest) -> Result<()> {
        lock(&self.device_updates).push((device_id.to_string(), patch.clone()));

        let mut devices = lock(&self.devices);
        if let Some(device) = devices.get_mut(device_id) {
            if let Some(supports) = &patch.supports {
                device.supports = supports.clone();
            }
            if let Some(location) = patch.location {
                device.location = location;
            }
        }

        Ok(())
    }

    async fn query_device(&self, device_id: &str) -> Result<Option<DeviceModel>> {
        Ok(lock(&self.devices).get(device_id).cloned())
    }

    async fn query_assets(&self) -> Result<Vec<Asset>> {
        Ok(lock(&self.assets).values().cloned().collect())
    }

    async fn query_requirements(&self, asset_ids: &[String]) -> Result<Vec<Requirements>> {
        Ok(lock(&self.requirements)
            .values()
            .filter(|r| asset_ids.contains(&r.asset_id))
            .cloned()
            .collect())
    }

    async fn close(&self) -> Result<()> {
        lock(&self.subscribers).clear();
        Ok(())
    }
}
