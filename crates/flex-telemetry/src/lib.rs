pub mod event_bus;
pub mod logging;
pub mod telemetry;

pub use event_bus::*;
pub use logging::*;
pub use telemetry::*;
