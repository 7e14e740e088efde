use super::EntityCache;
use crate::model::{Asset, Location};
use std::ops::Deref;

/// Assets currently relevant to this device.
///
/// Presence means "nearby": entries are admitted through the geofence.
#[derive(Default)]
pub struct AssetsCache {
    inner: EntityCache<Asset>,
}

impl AssetsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `asset` if it lies within `threshold` metres of `origin`,
    /// otherwise drops any cached entry for it.
    ///
    /// An asset that moved away is treated exactly like a deleted one.
    /// Returns whether the asset is cached afterwards.
    pub fn put_near_by(&self, asset: Asset, origin: &Location, threshold: f64) -> bool {
        let mut data = self.inner.lock();

        if asset.location.is_near_by(origin, threshold) {
            data.insert(asset.id.clone(), asset);
            true
        } else {
            data.remove(&asset.id);
            false
        }
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.lock().keys().cloned().collect()
    }
}

impl Deref for AssetsCache {
    type Target = EntityCache<Asset>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
