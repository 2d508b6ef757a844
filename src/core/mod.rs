//! Core data types shared across actors.

pub mod params;
pub mod transition;

pub use params::{ModelParameters, VersionCounter};
pub use transition::Transition;
