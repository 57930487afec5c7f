//! Domain types used throughout the pipeline.
//!
//! This module defines:
//!
//! - signal addressing (`Field`) and response layouts (`ResponseLayout`)
//! - optimizer selection (`FitterKind`)
//! - the run configuration derived from CLI flags (`FitConfig`)

pub mod types;

pub use types::*;
