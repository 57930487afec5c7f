//! Recording data: the in-memory container, the on-disk recording format,
//! and a synthetic recording generator.

pub mod container;
pub mod recording;
pub mod synthetic;

pub use container::{DataContainer, concat_trials, gather};
pub use recording::{RecordingFile, RecordingTags, load_recording, read_recording, write_recording};
pub use synthetic::{SyntheticSpec, generate_recording};
