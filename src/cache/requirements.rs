use super::{CacheEntity, EntityCache};
use crate::model::{Metric, Requirements};
use crate::reader::CancelHandle;
use std::ops::Deref;
use std::time::Duration;

/// Reading subscription state of a cached requirement
#[derive(Clone, Debug, Default)]
pub enum Subscription {
    /// Not yet handed to the reading engine
    #[default]
    Pending,
    /// Single reading already requested
    OneShot,
    /// Live periodic subscription
    Periodic(CancelHandle),
}

/// Cached requirement together with its reading subscription.
///
/// Holds at most one subscription at a time; only the requirements manager
/// creates or cancels it.
#[derive(Clone, Debug)]
pub struct ReadingsRequest {
    pub id: String,
    pub asset_id: String,
    pub metrics: Vec<Metric>,
    /// Zero requests a single reading
    pub period: Duration,
    pub(crate) subscription: Subscription,
}

impl ReadingsRequest {
    pub fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.subscription, Subscription::Pending)
    }

    /// True while a periodic subscription is live.
    pub fn is_subscribed(&self) -> bool {
        matches!(&self.subscription, Subscription::Periodic(cancel) if !cancel.is_cancelled())
    }

    /// Cancels the periodic subscription, if any.
    pub(crate) fn cancel(&self) {
        if let Subscription::Periodic(cancel) = &self.subscription {
            cancel.cancel();
        }
    }
}

impl From<&Requirements> for ReadingsRequest {
    fn from(req: &Requirements) -> Self {
        Self {
            id: req.id.clone(),
            asset_id: req.asset_id.clone(),
            metrics: req.metrics.clone(),
            period: req.period(),
            subscription: Subscription::Pending,
        }
    }
}

impl CacheEntity for ReadingsRequest {
    fn cache_id(&self) -> &str {
        &self.id
    }
}

/// Requirements accepted for cached assets
#[derive(Default)]
pub struct RequirementsCache {
    inner: EntityCache<ReadingsRequest>,
}

impl RequirementsCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entries still waiting for a subscription.
    pub fn pending(&self) -> Vec<ReadingsRequest> {
        self.inner
            .lock()
            .values()
            .filter(|r| r.is_pending())
            .cloned()
            .collect()
    }
}

impl Deref for RequirementsCache {
    type Target = EntityCache<ReadingsRequest>;

    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}
