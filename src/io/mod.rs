//! Persistence.
//!
//! - results table (`results`)
//! - fit job queue (`queue`)
//! - fitted-model JSON export (`export`)

pub mod export;
pub mod queue;
pub mod results;

pub use export::*;
pub use queue::*;
pub use results::*;
