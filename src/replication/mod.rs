pub mod engine;
pub mod settings;
pub mod tracking;

pub use engine::replicate_controller;
pub use settings::{ControllerSettings, OffsetDirection};
pub use tracking::{CopyRecord, CopyStatus, CopyTracker, TrackKey};
