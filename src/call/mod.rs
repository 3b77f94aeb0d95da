pub mod orchestrator;
pub mod params;
pub mod registry;
pub mod state;

pub use orchestrator::{CallOrchestrator, CleanupReport};
pub use params::CallParams;
pub use registry::CallRegistry;
pub use state::{CallRecord, CallState, CallStatus};
