// Public modules
pub mod equip;
pub mod error;
pub mod interrupt;
pub mod lock;
pub mod provision;
pub mod routine;
pub mod spec;
pub mod state;
pub mod transport;
pub mod workflow;

// Internal modules - not part of public API
pub(crate) mod paths;

// Re-export common types for convenience
pub use error::{Error, Result};
pub use spec::Spec;
pub use state::{NodeSlot, RunState};
