//! # conclave-types
//!
//! Shared type definitions for the Conclave collaboration hub.
//! This crate contains the geometric primitives that travel on the wire,
//! the per-client session state, and the coordinate projection helpers
//! used to place remote participants in the local navigational space.

pub mod geometry;
pub mod projection;
mod client_state;

pub use client_state::{mask, ClientState};
pub use geometry::{OrthoTransform, Plane, Point, RigidTransform, Rotation, Scalar, Vector};
pub use projection::remote_to_local;

/// Unique identifier for a client connected to a session.
///
/// Assigned by the server in ascending order of connection; 0 is never
/// assigned and is reserved as a terminator/sentinel on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ClientId(u32);

impl ClientId {
    /// Create a ClientId. Panics if id == 0.
    pub fn new(id: u32) -> Self {
        assert!(id > 0, "ClientId cannot be zero");
        Self(id)
    }

    /// Extract the raw u32 value.
    pub fn get(self) -> u32 {
        self.0
    }

    /// Construct from a raw wire value, rejecting the reserved 0.
    pub fn from_wire(id: u32) -> Option<Self> {
        if id == 0 {
            None
        } else {
            Some(Self(id))
        }
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}
