//! Utility modules for the backup engine.

pub mod errors;
pub mod logger;
pub mod shutdown;
pub mod status;

pub use errors::{EngineError, Result};
pub use status::{Failure, RunStatus};
