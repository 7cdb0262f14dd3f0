//! Per-client session state and its delta update mask.

use crate::geometry::{OrthoTransform, Plane, Point, RigidTransform, Scalar, Vector};

/// Bits of [`ClientState::update_mask`] naming which fields changed since
/// the state was last transmitted. Absent fields keep their previous value.
pub mod mask {
    pub const NO_CHANGE: u8 = 0x00;
    /// Any part of the physical-space environment definition changed.
    pub const ENVIRONMENT: u8 = 0x01;
    /// The client's display name changed.
    pub const CLIENT_NAME: u8 = 0x02;
    /// The number of viewers changed.
    pub const NUM_VIEWERS: u8 = 0x04;
    /// Any viewer changed position and/or orientation.
    pub const VIEWER: u8 = 0x08;
    /// The navigation transform changed.
    pub const NAV_TRANSFORM: u8 = 0x10;
    /// All fields; used for the initial transmission.
    pub const FULL_UPDATE: u8 = 0x1f;
}

/// State of a client's environment, synchronized between the server and all
/// connected peers.
///
/// The physical environment fields are expressed in the client's own
/// physical coordinate system; `nav_transform` maps that space into the
/// shared navigational space.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientState {
    /// Cumulative update mask of this state (bits from [`mask`]).
    pub update_mask: u8,
    /// Length of one inch in the client's physical coordinate units.
    pub inch_factor: Scalar,
    /// Center point of the client's environment.
    pub display_center: Point,
    /// Size of the client's environment.
    pub display_size: Scalar,
    /// Forward direction of the client's environment.
    pub forward: Vector,
    /// Up direction of the client's environment.
    pub up: Vector,
    /// Floor plane of the client's environment.
    pub floor_plane: Plane,
    /// The client's display name.
    pub client_name: String,
    /// Positions and orientations of the client's viewers.
    pub viewer_states: Vec<RigidTransform>,
    /// The client's current navigation transform.
    pub nav_transform: OrthoTransform,
}

impl ClientState {
    /// Resize the viewer array, marking [`mask::NUM_VIEWERS`] if the count
    /// changed. Returns true on a change.
    pub fn resize_viewers(&mut self, count: usize) -> bool {
        if count != self.viewer_states.len() {
            self.viewer_states.resize(count, RigidTransform::IDENTITY);
            self.update_mask |= mask::NUM_VIEWERS;
            true
        } else {
            false
        }
    }

    /// Clear the cumulative update mask after a transmission.
    pub fn clear_mask(&mut self) {
        self.update_mask = mask::NO_CHANGE;
    }
}

impl Default for ClientState {
    fn default() -> Self {
        ClientState {
            update_mask: mask::NO_CHANGE,
            inch_factor: 1.0,
            display_center: Point::ORIGIN,
            display_size: 1.0,
            forward: Vector::new(0.0, 1.0, 0.0),
            up: Vector::new(0.0, 0.0, 1.0),
            floor_plane: Plane::default(),
            client_name: String::new(),
            viewer_states: Vec::new(),
            nav_transform: OrthoTransform::IDENTITY,
        }
    }
}
