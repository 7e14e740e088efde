use crate::model::{DeviceModel, Location};
use std::sync::RwLock;

/// Local identity of the device on the ledger network.
///
/// Holds the device model once the ledger has confirmed this id; `None`
/// means the device is not logged on the network.
pub struct DeviceIdentity {
    id: String,
    model: RwLock<Option<DeviceModel>>,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            model: RwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Replaces the device model wholesale, returning the previous one.
    pub fn adopt(&self, model: DeviceModel) -> Option<DeviceModel> {
        self.model
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .replace(model)
    }

    pub fn clear(&self) -> Option<DeviceModel> {
        self.model.write().unwrap_or_else(|e| e.into_inner()).take()
    }

    pub fn model(&self) -> Option<DeviceModel> {
        self.model.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn location(&self) -> Option<Location> {
        self.model
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .map(|m| m.location)
    }

    pub fn is_logged_in(&self) -> bool {
        self.model.read().unwrap_or_else(|e| e.into_inner()).is_some()
    }
}
