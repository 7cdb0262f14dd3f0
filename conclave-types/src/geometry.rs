//! Geometric primitives shared between the wire protocol and the renderers.
//!
//! All transmitted geometry is single-precision: positions and directions are
//! triplets of `f32`, orientations are unit quaternions, and the navigation
//! transform adds a uniform scale. The math here is deliberately small —
//! just what the protocol and the state projection need.

use serde::{Deserialize, Serialize};

/// Scalar type for all transmitted geometric data.
pub type Scalar = f32;

/// A position in 3-space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Point(pub [Scalar; 3]);

/// A direction or displacement in 3-space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Vector(pub [Scalar; 3]);

impl Point {
    pub const ORIGIN: Point = Point([0.0, 0.0, 0.0]);

    pub fn new(x: Scalar, y: Scalar, z: Scalar) -> Self {
        Point([x, y, z])
    }

    /// Displacement from `other` to `self`.
    pub fn sub(self, other: Point) -> Vector {
        Vector([
            self.0[0] - other.0[0],
            self.0[1] - other.0[1],
            self.0[2] - other.0[2],
        ])
    }

    pub fn offset(self, v: Vector) -> Point {
        Point([self.0[0] + v.0[0], self.0[1] + v.0[1], self.0[2] + v.0[2]])
    }
}

impl Vector {
    pub const ZERO: Vector = Vector([0.0, 0.0, 0.0]);

    pub fn new(x: Scalar, y: Scalar, z: Scalar) -> Self {
        Vector([x, y, z])
    }

    pub fn add(self, other: Vector) -> Vector {
        Vector([
            self.0[0] + other.0[0],
            self.0[1] + other.0[1],
            self.0[2] + other.0[2],
        ])
    }

    pub fn scale(self, s: Scalar) -> Vector {
        Vector([self.0[0] * s, self.0[1] * s, self.0[2] * s])
    }

    pub fn dot(self, other: Vector) -> Scalar {
        self.0[0] * other.0[0] + self.0[1] * other.0[1] + self.0[2] * other.0[2]
    }

    pub fn cross(self, other: Vector) -> Vector {
        Vector([
            self.0[1] * other.0[2] - self.0[2] * other.0[1],
            self.0[2] * other.0[0] - self.0[0] * other.0[2],
            self.0[0] * other.0[1] - self.0[1] * other.0[0],
        ])
    }

    pub fn magnitude(self) -> Scalar {
        self.dot(self).sqrt()
    }

    /// Unit vector in the same direction; zero vectors are returned unchanged.
    pub fn normalized(self) -> Vector {
        let m = self.magnitude();
        if m > 0.0 {
            self.scale(1.0 / m)
        } else {
            self
        }
    }
}

impl Default for Point {
    fn default() -> Self {
        Point::ORIGIN
    }
}

impl Default for Vector {
    fn default() -> Self {
        Vector::ZERO
    }
}

/// A rotation in 3-space, stored as a unit quaternion `[x, y, z, w]`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Rotation(pub [Scalar; 4]);

impl Rotation {
    pub const IDENTITY: Rotation = Rotation([0.0, 0.0, 0.0, 1.0]);

    /// Rotation by `angle` radians about the given axis (need not be unit length).
    pub fn from_axis_angle(axis: Vector, angle: Scalar) -> Self {
        let a = axis.normalized();
        let (s, c) = (angle * 0.5).sin_cos();
        Rotation([a.0[0] * s, a.0[1] * s, a.0[2] * s, c])
    }

    fn vector_part(self) -> Vector {
        Vector([self.0[0], self.0[1], self.0[2]])
    }

    /// Hamilton product; `self` is applied after `other` when rotating.
    pub fn mul(self, other: Rotation) -> Rotation {
        let (v1, w1) = (self.vector_part(), self.0[3]);
        let (v2, w2) = (other.vector_part(), other.0[3]);
        let v = v1.scale(w2).add(v2.scale(w1)).add(v1.cross(v2));
        Rotation([v.0[0], v.0[1], v.0[2], w1 * w2 - v1.dot(v2)])
    }

    /// Inverse rotation. Assumes a unit quaternion, so this is the conjugate.
    pub fn inverse(self) -> Rotation {
        Rotation([-self.0[0], -self.0[1], -self.0[2], self.0[3]])
    }

    /// Rotate a vector.
    pub fn apply(self, v: Vector) -> Vector {
        // v' = v + 2w(q x v) + 2 q x (q x v) with q the vector part
        let q = self.vector_part();
        let t = q.cross(v).scale(2.0);
        v.add(t.scale(self.0[3])).add(q.cross(t))
    }

    /// Renormalize to counter drift from accumulated products.
    pub fn normalized(self) -> Rotation {
        let m = (self.0[0] * self.0[0]
            + self.0[1] * self.0[1]
            + self.0[2] * self.0[2]
            + self.0[3] * self.0[3])
            .sqrt();
        if m > 0.0 {
            Rotation([self.0[0] / m, self.0[1] / m, self.0[2] / m, self.0[3] / m])
        } else {
            Rotation::IDENTITY
        }
    }
}

impl Default for Rotation {
    fn default() -> Self {
        Rotation::IDENTITY
    }
}

/// A rigid-body transform: rotation followed by translation.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct RigidTransform {
    pub translation: Vector,
    pub rotation: Rotation,
}

impl RigidTransform {
    pub const IDENTITY: RigidTransform = RigidTransform {
        translation: Vector([0.0, 0.0, 0.0]),
        rotation: Rotation([0.0, 0.0, 0.0, 1.0]),
    };

    pub fn new(translation: Vector, rotation: Rotation) -> Self {
        RigidTransform {
            translation,
            rotation,
        }
    }

    pub fn apply(self, p: Point) -> Point {
        Point::ORIGIN.offset(
            self.rotation
                .apply(p.sub(Point::ORIGIN))
                .add(self.translation),
        )
    }

    pub fn apply_vector(self, v: Vector) -> Vector {
        self.rotation.apply(v)
    }

    /// `self` applied after `other`.
    pub fn concat(self, other: RigidTransform) -> RigidTransform {
        RigidTransform {
            translation: self.rotation.apply(other.translation).add(self.translation),
            rotation: self.rotation.mul(other.rotation),
        }
    }

    pub fn inverse(self) -> RigidTransform {
        let inv_rot = self.rotation.inverse();
        RigidTransform {
            translation: inv_rot.apply(self.translation).scale(-1.0),
            rotation: inv_rot,
        }
    }
}

/// A rigid-body transform with uniform scaling; used for navigation
/// transforms that map a client's physical space into the shared
/// navigational space.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OrthoTransform {
    pub translation: Vector,
    pub rotation: Rotation,
    pub scale: Scalar,
}

impl OrthoTransform {
    pub const IDENTITY: OrthoTransform = OrthoTransform {
        translation: Vector([0.0, 0.0, 0.0]),
        rotation: Rotation([0.0, 0.0, 0.0, 1.0]),
        scale: 1.0,
    };

    pub fn new(translation: Vector, rotation: Rotation, scale: Scalar) -> Self {
        OrthoTransform {
            translation,
            rotation,
            scale,
        }
    }

    pub fn from_rigid(t: RigidTransform) -> Self {
        OrthoTransform {
            translation: t.translation,
            rotation: t.rotation,
            scale: 1.0,
        }
    }

    pub fn apply(self, p: Point) -> Point {
        Point::ORIGIN.offset(
            self.rotation
                .apply(p.sub(Point::ORIGIN).scale(self.scale))
                .add(self.translation),
        )
    }

    pub fn apply_vector(self, v: Vector) -> Vector {
        self.rotation.apply(v.scale(self.scale))
    }

    /// `self` applied after `other`.
    pub fn concat(self, other: OrthoTransform) -> OrthoTransform {
        OrthoTransform {
            translation: self
                .rotation
                .apply(other.translation.scale(self.scale))
                .add(self.translation),
            rotation: self.rotation.mul(other.rotation),
            scale: self.scale * other.scale,
        }
    }

    pub fn inverse(self) -> OrthoTransform {
        let inv_scale = 1.0 / self.scale;
        let inv_rot = self.rotation.inverse();
        OrthoTransform {
            translation: inv_rot.apply(self.translation).scale(-inv_scale),
            rotation: inv_rot,
            scale: inv_scale,
        }
    }
}

impl Default for OrthoTransform {
    fn default() -> Self {
        OrthoTransform::IDENTITY
    }
}

/// A plane in 3-space, `normal . x == offset`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Plane {
    pub normal: Vector,
    pub offset: Scalar,
}

impl Plane {
    pub fn new(normal: Vector, offset: Scalar) -> Self {
        Plane { normal, offset }
    }
}

impl Default for Plane {
    fn default() -> Self {
        // Horizontal floor through the origin
        Plane {
            normal: Vector([0.0, 0.0, 1.0]),
            offset: 0.0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_close(a: Scalar, b: Scalar) {
        assert!((a - b).abs() < 1e-4, "{} != {}", a, b);
    }

    fn assert_points_close(a: Point, b: Point) {
        for i in 0..3 {
            assert_close(a.0[i], b.0[i]);
        }
    }

    #[test]
    fn rotation_quarter_turn_about_z() {
        let r = Rotation::from_axis_angle(Vector::new(0.0, 0.0, 1.0), std::f32::consts::FRAC_PI_2);
        let v = r.apply(Vector::new(1.0, 0.0, 0.0));
        assert_close(v.0[0], 0.0);
        assert_close(v.0[1], 1.0);
        assert_close(v.0[2], 0.0);
    }

    #[test]
    fn rotation_inverse_cancels() {
        let r = Rotation::from_axis_angle(Vector::new(1.0, 2.0, 3.0), 0.7);
        let v = Vector::new(0.3, -1.2, 4.5);
        let back = r.inverse().apply(r.apply(v));
        for i in 0..3 {
            assert_close(back.0[i], v.0[i]);
        }
    }

    #[test]
    fn rigid_inverse_roundtrip() {
        let t = RigidTransform::new(
            Vector::new(1.0, -2.0, 0.5),
            Rotation::from_axis_angle(Vector::new(0.0, 1.0, 0.0), 1.1),
        );
        let p = Point::new(3.0, 4.0, 5.0);
        assert_points_close(t.inverse().apply(t.apply(p)), p);
    }

    #[test]
    fn ortho_concat_matches_sequential_application() {
        let a = OrthoTransform::new(
            Vector::new(1.0, 0.0, 0.0),
            Rotation::from_axis_angle(Vector::new(0.0, 0.0, 1.0), 0.4),
            2.0,
        );
        let b = OrthoTransform::new(
            Vector::new(0.0, -1.0, 2.0),
            Rotation::from_axis_angle(Vector::new(1.0, 0.0, 0.0), -0.9),
            0.5,
        );
        let p = Point::new(0.7, 0.8, 0.9);
        assert_points_close(a.concat(b).apply(p), a.apply(b.apply(p)));
    }

    #[test]
    fn ortho_inverse_roundtrip_with_scale() {
        let t = OrthoTransform::new(
            Vector::new(-4.0, 2.0, 1.0),
            Rotation::from_axis_angle(Vector::new(1.0, 1.0, 0.0), 2.2),
            3.5,
        );
        let p = Point::new(1.0, -1.0, 0.25);
        assert_points_close(t.inverse().apply(t.apply(p)), p);
        assert_close(t.concat(t.inverse()).scale, 1.0);
    }
}
