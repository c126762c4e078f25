//! Shared domain types for the Aperture camera appliance.

pub mod config;
pub mod frame;
pub mod link;
pub mod status;

mod errors;

pub use errors::{ApertureError, Result};
