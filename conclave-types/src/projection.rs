//! Projection of remote-client geometry into the local rendering frame.
//!
//! Each client maps its own physical space into the shared navigational
//! space with its navigation transform. Geometry a remote client publishes
//! in its physical frame (viewer poses, device poses, its video panel)
//! reaches the local physical frame by going up through the remote's
//! navigation transform and back down through the inverse of the local one.
//! Geometry published directly in the shared navigational frame (annotation
//! curves) only needs the way down.

use crate::geometry::{OrthoTransform, Point};

/// Transform mapping geometry in the remote client's physical frame into
/// the local client's physical frame, via the shared navigational space.
pub fn remote_to_local(local_nav: OrthoTransform, remote_nav: OrthoTransform) -> OrthoTransform {
    local_nav.inverse().concat(remote_nav)
}

/// Transform mapping shared-navigational-frame geometry into the local
/// client's physical frame.
pub fn shared_to_local(local_nav: OrthoTransform) -> OrthoTransform {
    local_nav.inverse()
}

/// Project a point published in the remote's physical frame into the local
/// physical frame.
pub fn project_point(local_nav: OrthoTransform, remote_nav: OrthoTransform, p: Point) -> Point {
    remote_to_local(local_nav, remote_nav).apply(p)
}
