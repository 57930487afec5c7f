//! Model names and the stacks they describe.
//!
//! A model name is parsed into keywords (`keywords`), which are turned into
//! stack modules, fit, and scored (`builder`).

pub mod builder;
pub mod keywords;

pub use builder::*;
pub use keywords::*;
