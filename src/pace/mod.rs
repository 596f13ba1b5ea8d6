pub mod converter;
pub mod options;

pub use converter::{pace_label, pace_to_speed, speed_to_pace, PaceSpec};
pub use options::PaceOptions;
