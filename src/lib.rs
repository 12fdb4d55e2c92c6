//! Parent communication cadence for tutoring lessons: lesson records come in,
//! deficit patterns are tracked, and follow-up messages are scheduled,
//! rendered and handed to the tutor to share.

pub mod cadence;
pub mod clock;
pub mod config;
pub mod deficit;
pub mod dispatch;
pub mod error;
pub mod import;
pub mod locks;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod ports;
pub mod render;
pub mod scheduler;
pub mod store;

#[cfg(test)]
mod testing;

pub use config::CadenceConfig;
pub use error::{CadenceError, Result};
pub use pipeline::{IngestOutcome, Pipeline};
pub use scheduler::SweepOutcome;
