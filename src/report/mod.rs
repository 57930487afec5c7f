//! Terminal reports for fits, result listings and queue runs.

pub mod format;

pub use format::*;
