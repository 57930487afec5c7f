//! Parameter fitting.
//!
//! Responsibilities:
//!
//! - minimize a stack's objective metric with a local optimizer (`fitter`)
//! - repeat the fit per cross-validation fold and score the stitched
//!   held-out predictions (`nested`)

pub mod fitter;
pub mod nested;

pub use fitter::*;
pub use nested::*;
