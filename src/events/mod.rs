// Internal domain events decoupling ledger watchers from their consumers

use crate::cache::ReadingsRequest;
use crate::model::Location;
use std::future::Future;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::warn;

/// Event published on the internal bus
#[derive(Clone, Debug)]
pub enum DomainEvent {
    /// The device identity has been confirmed by the ledger
    DeviceLoggedOnNetwork,
    DeviceLocationChanged { old: Location, new: Location },
    DeviceRemovedFromNetwork,
    /// Requirements accepted and turned into reading requests
    RequirementsSubmitted { requests: Vec<ReadingsRequest> },
}

/// Discriminant of [`DomainEvent`], used to select handlers
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DomainEventKind {
    DeviceLoggedOnNetwork,
    DeviceLocationChanged,
    DeviceRemovedFromNetwork,
    RequirementsSubmitted,
}

impl DomainEvent {
    pub fn kind(&self) -> DomainEventKind {
        match self {
            DomainEvent::DeviceLoggedOnNetwork => DomainEventKind::DeviceLoggedOnNetwork,
            DomainEvent::DeviceLocationChanged { .. } => DomainEventKind::DeviceLocationChanged,
            DomainEvent::DeviceRemovedFromNetwork => DomainEventKind::DeviceRemovedFromNetwork,
            DomainEvent::RequirementsSubmitted { .. } => DomainEventKind::RequirementsSubmitted,
        }
    }
}

/// Broadcast bus for [`DomainEvent`]s.
///
/// Publishers never know who listens; handlers run on their own tasks.
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<DomainEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    /// Publishes `event`. Having no listeners is fine.
    pub fn emit(&self, event: DomainEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DomainEvent> {
        self.tx.subscribe()
    }

    /// Number of live receivers, handlers included.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Runs `handler` on the next event of `kind`, then stops.
    ///
    /// The subscription is taken before returning, so events emitted after
    /// this call are never missed.
    pub fn once<F, Fut>(&self, kind: DomainEventKind, handler: F) -> JoinHandle<()>
    where
        F: FnOnce(DomainEvent) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let mut rx = self.tx.subscribe();
        tokio::spawn(async move {
            if let Some(event) = next_of_kind(&mut rx, kind).await {
                handler(event).await;
            }
        })
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

async fn next_of_kind(
    rx: &mut broadcast::Receiver<DomainEvent>,
    kind: DomainEventKind,
) -> Option<DomainEvent> {
    loop {
        match rx.recv().await {
            Ok(event) if event.kind() == kind => return Some(event),
            Ok(_) => continue,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped = skipped, kind = ?kind, "Event handler lagged, skipped events");
            }
            Err(broadcast::error::RecvError::Closed) => return None,
        }
    }
}
