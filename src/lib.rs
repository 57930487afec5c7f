//! `neurofit` library crate.
//!
//! The binary (`neurofit`) is a thin wrapper around this library so that:
//!
//! - stacks, fitters and metrics are testable without spawning processes
//! - the fit pipeline can be driven by other front-ends (queue daemons, notebooks)
//! - code stays easy to navigate as the project grows

pub mod app;
pub mod cli;
pub mod data;
pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod math;
pub mod models;
pub mod modules;
pub mod report;
pub mod stack;
