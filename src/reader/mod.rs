// Reading engine: harvest scheduling, fan-in reduction, delivery

mod cancel;
mod cycle;
mod engine;
mod reduce;

pub use cancel::CancelHandle;
pub use cycle::{run_cycle, CycleOutcome};
pub use engine::{readings_handler, ReaderConfig, ReadingsHandler, SensorsReader};
pub use reduce::ReductionPolicy;
