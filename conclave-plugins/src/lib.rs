//! # conclave-plugins
//!
//! The built-in collaboration protocols that ride on the base transport:
//! shared input devices (`"devices"`) and shared annotation curves
//! (`"sketch"`). Each module provides the server- and client-side plugin
//! halves bound to each other by the protocol name.

pub mod devices;
pub mod sketch;

pub use devices::{DevicesClient, DevicesServer};
pub use sketch::{SketchClient, SketchServer};
