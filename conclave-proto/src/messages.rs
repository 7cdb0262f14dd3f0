//! The fixed base message set and the client-state delta codec.

use std::io;

use conclave_types::{mask, ClientState};

use crate::pipe::{PipeReader, PipeWriter};

/// Network type for protocol message ids.
pub type MessageId = u16;

/// Request to connect to the server.
pub const CONNECT_REQUEST: MessageId = 0;
/// Positive connect reply.
pub const CONNECT_REPLY: MessageId = 1;
/// Negative connect reply.
pub const CONNECT_REJECT: MessageId = 2;
/// Polite request to disconnect from the server.
pub const DISCONNECT_REQUEST: MessageId = 3;
/// Disconnect reply from the server, letting receive loops shut down cleanly.
pub const DISCONNECT_REPLY: MessageId = 4;
/// Updates the sending client's state on the server.
pub const CLIENT_UPDATE: MessageId = 5;
/// Notifies connected clients that a new client joined.
pub const CLIENT_CONNECT: MessageId = 6;
/// Notifies connected clients that another client left.
pub const CLIENT_DISCONNECT: MessageId = 7;
/// Carries the current state of all other clients to one client.
pub const SERVER_UPDATE: MessageId = 8;
/// First message id available to protocol plugins.
pub const MESSAGES_END: MessageId = 9;

/// Read a client-state delta: a leading mask byte, then only the fields the
/// mask names. The received mask is ORed into the state's cumulative mask.
pub fn read_client_state(state: &mut ClientState, pipe: &mut PipeReader) -> io::Result<()> {
    let update = pipe.read_u8()?;

    if update & mask::ENVIRONMENT != 0 {
        state.inch_factor = pipe.read_f32()?;
        state.display_center = pipe.read_point()?;
        state.display_size = pipe.read_f32()?;
        state.forward = pipe.read_vector()?;
        state.up = pipe.read_vector()?;
        state.floor_plane = pipe.read_plane()?;
    }

    if update & mask::CLIENT_NAME != 0 {
        state.client_name = pipe.read_string()?;
    }

    if update & mask::NUM_VIEWERS != 0 {
        // The viewer count precedes the viewer array it resizes.
        let count = pipe.read_u32()?;
        state.resize_viewers(count as usize);
    }

    if update & mask::VIEWER != 0 {
        for viewer in state.viewer_states.iter_mut() {
            *viewer = pipe.read_rigid()?;
        }
    }

    if update & mask::NAV_TRANSFORM != 0 {
        state.nav_transform = pipe.read_ortho()?;
    }

    state.update_mask |= update;
    Ok(())
}

/// Write a client-state delta under the given mask.
pub fn write_client_state(
    update: u8,
    state: &ClientState,
    pipe: &mut PipeWriter,
) -> io::Result<()> {
    pipe.write_u8(update)?;

    if update & mask::ENVIRONMENT != 0 {
        pipe.write_f32(state.inch_factor)?;
        pipe.write_point(state.display_center)?;
        pipe.write_f32(state.display_size)?;
        pipe.write_vector(state.forward)?;
        pipe.write_vector(state.up)?;
        pipe.write_plane(state.floor_plane)?;
    }

    if update & mask::CLIENT_NAME != 0 {
        pipe.write_string(&state.client_name)?;
    }

    if update & mask::NUM_VIEWERS != 0 {
        pipe.write_u32(state.viewer_states.len() as u32)?;
    }

    if update & mask::VIEWER != 0 {
        for viewer in &state.viewer_states {
            pipe.write_rigid(*viewer)?;
        }
    }

    if update & mask::NAV_TRANSFORM != 0 {
        pipe.write_ortho(state.nav_transform)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use conclave_types::{OrthoTransform, Point, RigidTransform, Rotation, Vector};
    use std::io::Cursor;

    fn sample_state() -> ClientState {
        let mut state = ClientState::default();
        state.client_name = "station-a".into();
        state.inch_factor = 0.0254;
        state.display_center = Point::new(0.0, 0.0, 1.2);
        state.display_size = 3.0;
        state.resize_viewers(2);
        state.viewer_states[1] = RigidTransform::new(
            Vector::new(0.0, 0.5, 1.8),
            Rotation::from_axis_angle(Vector::new(0.0, 0.0, 1.0), 0.3),
        );
        state.nav_transform = OrthoTransform::new(
            Vector::new(5.0, -2.0, 0.0),
            Rotation::IDENTITY,
            0.5,
        );
        state
    }

    fn roundtrip(update: u8, source: &ClientState, dest: &mut ClientState) {
        let mut buf = Vec::new();
        write_client_state(update, source, &mut PipeWriter::new(&mut buf)).unwrap();
        let mut cur = Cursor::new(buf);
        read_client_state(dest, &mut PipeReader::new(&mut cur, false)).unwrap();
    }

    #[test]
    fn full_update_reconstructs_the_state() {
        let source = sample_state();
        let mut dest = ClientState::default();
        roundtrip(mask::FULL_UPDATE, &source, &mut dest);
        dest.clear_mask();
        let mut expected = source.clone();
        expected.clear_mask();
        assert_eq!(dest, expected);
    }

    #[test]
    fn empty_mask_is_idempotent() {
        let source = sample_state();
        let mut dest = ClientState::default();
        let before = dest.clone();
        roundtrip(mask::NO_CHANGE, &source, &mut dest);
        assert_eq!(dest, before);
    }

    /// Regression vector for the nav-transform mask: a delta whose mask does
    /// not name NAV_TRANSFORM must neither encode nor decode it, even when
    /// the source's transform differs from the destination's.
    #[test]
    fn nav_transform_is_gated_by_its_mask_bit() {
        let source = sample_state();
        let mut dest = ClientState::default();
        let dest_nav = dest.nav_transform;

        let mut buf = Vec::new();
        write_client_state(mask::CLIENT_NAME, &source, &mut PipeWriter::new(&mut buf)).unwrap();
        // Mask byte + <u32 len> + name; no trailing transform bytes.
        assert_eq!(buf.len(), 1 + 4 + source.client_name.len());

        let mut cur = Cursor::new(buf);
        read_client_state(&mut dest, &mut PipeReader::new(&mut cur, false)).unwrap();
        assert_eq!(dest.client_name, "station-a");
        assert_eq!(dest.nav_transform, dest_nav);
        assert_eq!(dest.update_mask, mask::CLIENT_NAME);
    }

    #[test]
    fn nav_only_delta_is_compact() {
        let source = sample_state();
        let mut buf = Vec::new();
        write_client_state(mask::NAV_TRANSFORM, &source, &mut PipeWriter::new(&mut buf)).unwrap();
        // Mask byte + ortho transform (8 floats).
        assert_eq!(buf.len(), 1 + 8 * 4);
    }

    #[test]
    fn viewer_resize_precedes_viewer_states() {
        let source = sample_state();
        let mut dest = ClientState::default();
        roundtrip(mask::NUM_VIEWERS | mask::VIEWER, &source, &mut dest);
        assert_eq!(dest.viewer_states.len(), 2);
        assert_eq!(dest.viewer_states[1], source.viewer_states[1]);
    }

    #[test]
    fn received_masks_accumulate() {
        let source = sample_state();
        let mut dest = ClientState::default();
        roundtrip(mask::CLIENT_NAME, &source, &mut dest);
        roundtrip(mask::NAV_TRANSFORM, &source, &mut dest);
        assert_eq!(dest.update_mask, mask::CLIENT_NAME | mask::NAV_TRANSFORM);
    }
}
