//! Host-facing wiring for the Tabula engine: subscriber setup, the event
//! layer, and bootstrap from configuration.

pub mod bootstrap;
pub mod logging;
pub mod tracing_layer;

pub use bootstrap::{BootstrapOptions, ExtractionEngine, assemble, bootstrap};
pub use logging::{LogFormat, init_tracing};
pub use tracing_layer::{ExtractionEvent, ExtractionEventLayer};
