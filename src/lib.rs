// Ledger entities and reading values
pub mod model;

// Sensor contract, delivery surface and registry
pub mod sensor;

// Reading engine: harvest cycles, one-shot and periodic subscriptions
pub mod reader;

// Ledger adapters (NATS and in-memory)
pub mod ledger;

// Internal domain event bus
pub mod events;

// Asset and requirements caches
pub mod cache;

// Requirements to reading subscriptions
pub mod requirements;

// Device modules (ledger events observer)
pub mod modules;

// Device orchestrator
pub mod device;

// Agent configuration
pub mod config;
