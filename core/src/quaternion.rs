//! Unit-quaternion rotation representation.
//!
//! This module provides [`RotationQuaternion`], the orientation type used by the nominal
//! state. The type enforces two invariants through its single validated constructor:
//!
//! 1. **Unit norm**: the components are renormalized on construction, so every value
//!    represents a proper rotation.
//! 2. **Canonical sign**: the real part is non-negative. A unit quaternion and its negation
//!    encode the same rotation (the double cover of SO(3)); flipping the sign when the real
//!    part is negative makes the representation unique, which keeps comparison and
//!    interpolation well defined.
//!
//! Values are immutable once constructed; composition produces a new instance. The fields are
//! private so an invalid quaternion cannot be built directly.

use nalgebra::{Matrix3, Quaternion, UnitQuaternion, Vector3};
use std::fmt::{self, Display};

/// Threshold below which a rotation vector is treated with the small-angle limit.
const SMALL_ANGLE: f64 = 1e-10;

/// A rotation represented as a unit quaternion with a non-negative real part.
///
/// Stored as `{real, vec}` (w, xyz in scalar-first order). Use [`RotationQuaternion::new`]
/// or one of the `from_*` factories to construct a value; all of them renormalize and
/// canonicalize the sign.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RotationQuaternion {
    real: f64,
    vec: Vector3<f64>,
}

impl Default for RotationQuaternion {
    fn default() -> Self {
        Self::identity()
    }
}

impl Display for RotationQuaternion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "RotationQuaternion {{ real: {:.6}, vec: [{:.6}, {:.6}, {:.6}] }}",
            self.real, self.vec[0], self.vec[1], self.vec[2]
        )
    }
}

impl RotationQuaternion {
    /// Create a rotation quaternion from a real (scalar) part and a vector part.
    ///
    /// This is the single validated construction path: the components are divided by their
    /// joint norm, and if the resulting real part is negative both components are negated so
    /// the canonical-sign invariant holds.
    ///
    /// # Arguments
    /// * `real` - The scalar (w) component.
    /// * `vec` - The vector (x, y, z) components.
    ///
    /// # Returns
    /// * A unit-norm, sign-canonicalized rotation quaternion.
    ///
    /// # Example
    /// ```rust
    /// use eskf::quaternion::RotationQuaternion;
    /// use nalgebra::Vector3;
    /// // Not unit norm and with a negative real part: both get fixed up.
    /// let q = RotationQuaternion::new(-2.0, Vector3::new(0.0, 0.0, -2.0));
    /// assert!(q.real() > 0.0);
    /// assert!((q.real().powi(2) + q.vec().norm_squared() - 1.0).abs() < 1e-12);
    /// ```
    pub fn new(real: f64, vec: Vector3<f64>) -> Self {
        let norm = (real * real + vec.norm_squared()).sqrt();
        debug_assert!(norm > 0.0, "cannot normalize a zero quaternion");
        let mut real = real / norm;
        let mut vec = vec / norm;
        if real < 0.0 {
            real = -real;
            vec = -vec;
        }
        RotationQuaternion { real, vec }
    }

    /// The identity rotation.
    pub fn identity() -> Self {
        RotationQuaternion {
            real: 1.0,
            vec: Vector3::zeros(),
        }
    }

    /// The scalar (w) component. Always non-negative.
    pub fn real(&self) -> f64 {
        self.real
    }

    /// The vector (x, y, z) components.
    pub fn vec(&self) -> Vector3<f64> {
        self.vec
    }

    /// Compose two rotations: `self.multiply(&other)` rotates first by `other`, then by
    /// `self` (the usual quaternion product order).
    ///
    /// The product is
    ///
    /// $$
    /// q \otimes p = \begin{bmatrix} q_w p_w - q_v^T p_v \\\\
    /// q_w p_v + p_w q_v + q_v \times p_v \end{bmatrix}
    /// $$
    ///
    /// and the result goes through the canonicalizing constructor, so rounding drift in the
    /// norm does not accumulate over long integration runs.
    pub fn multiply(&self, other: &RotationQuaternion) -> RotationQuaternion {
        let real = self.real * other.real - self.vec.dot(&other.vec);
        let vec = self.real * other.vec + other.real * self.vec + self.vec.cross(&other.vec);
        RotationQuaternion::new(real, vec)
    }

    /// The conjugate (inverse rotation).
    pub fn conjugate(&self) -> RotationQuaternion {
        RotationQuaternion {
            real: self.real,
            vec: -self.vec,
        }
    }

    /// The rotation matrix representation of `self`.
    ///
    /// # Example
    /// ```rust
    /// use eskf::quaternion::RotationQuaternion;
    /// use nalgebra::Vector3;
    /// use std::f64::consts::FRAC_PI_2;
    /// // 90 degrees about z maps x onto y.
    /// let q = RotationQuaternion::from_avec(Vector3::new(0.0, 0.0, FRAC_PI_2));
    /// let y = q.as_rotmat() * Vector3::x();
    /// assert!((y - Vector3::y()).norm() < 1e-12);
    /// ```
    pub fn as_rotmat(&self) -> Matrix3<f64> {
        self.as_unit_quaternion()
            .to_rotation_matrix()
            .into_inner()
    }

    /// The extrinsic x-y-z Euler angle representation of `self` (roll, pitch, yaw), radians.
    pub fn as_euler(&self) -> Vector3<f64> {
        let (roll, pitch, yaw) = self.as_unit_quaternion().euler_angles();
        Vector3::new(roll, pitch, yaw)
    }

    /// The rotation-vector (angle-axis) representation of `self`, radians.
    pub fn as_avec(&self) -> Vector3<f64> {
        self.as_unit_quaternion().scaled_axis()
    }

    /// Create a rotation quaternion from extrinsic x-y-z Euler angles (roll, pitch, yaw).
    ///
    /// # Arguments
    /// * `euler` - Euler angles in radians, in the order roll, pitch, yaw.
    pub fn from_euler(euler: Vector3<f64>) -> Self {
        let q = UnitQuaternion::from_euler_angles(euler[0], euler[1], euler[2]);
        RotationQuaternion::new(q.w, q.imag())
    }

    /// Create a rotation quaternion from a rotation vector `k` (angle `|k|` about `k/|k|`).
    ///
    /// The components are `cos(|k|/2)` and `k/|k| * sin(|k|/2)`. Near `|k| = 0` the division
    /// by the norm is replaced by the exact limit `sin(|k|/2)/|k| -> 1/2`, so a zero or
    /// near-zero angular increment produces the identity rotation instead of a division by a
    /// vanishing norm.
    ///
    /// # Arguments
    /// * `avec` - Rotation vector in radians.
    pub fn from_avec(avec: Vector3<f64>) -> Self {
        let angle = avec.norm();
        if angle < SMALL_ANGLE {
            RotationQuaternion::new(1.0, 0.5 * avec)
        } else {
            RotationQuaternion::new((0.5 * angle).cos(), avec * ((0.5 * angle).sin() / angle))
        }
    }

    /// The squared deviation of the quaternion norm from unity.
    ///
    /// Zero up to floating-point error for every constructed value; exposed for strict
    /// invariant checking in diagnostics and tests.
    pub fn norm_error(&self) -> f64 {
        (self.real * self.real + self.vec.norm_squared() - 1.0).abs()
    }

    /// Rotate a vector by `self` without forming the full rotation matrix.
    pub fn rotate(&self, v: &Vector3<f64>) -> Vector3<f64> {
        // R v = v + 2 w (q_v × v) + 2 q_v × (q_v × v), cheaper than forming the full matrix
        let t = 2.0 * self.vec.cross(v);
        v + self.real * t + self.vec.cross(&t)
    }

    fn as_unit_quaternion(&self) -> UnitQuaternion<f64> {
        UnitQuaternion::new_unchecked(Quaternion::from_parts(self.real, self.vec))
    }
}
