//! Math utilities and helpers.

use glam::Mat4;

/// Convert a column-major engine matrix into the row-major 3x4 layout used by
/// ray tracing instance data (`VkTransformMatrixKHR`).
///
/// The bottom row of the 4x4 matrix is dropped; instance transforms are affine.
#[inline]
pub fn to_row_major_3x4(matrix: &Mat4) -> [f32; 12] {
    let mut out = [0.0; 12];
    for row in 0..3 {
        for col in 0..4 {
            out[row * 4 + col] = matrix.col(col)[row];
        }
    }
    out
}

/// Align `value` up to a power-of-two `alignment`.
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    debug_assert!(alignment.is_power_of_two());
    (value + alignment - 1) & !(alignment - 1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::{Quat, Vec3};

    #[test]
    fn identity_converts_to_identity_3x4() {
        let m = to_row_major_3x4(&Mat4::IDENTITY);
        assert_eq!(
            m,
            [
                1.0, 0.0, 0.0, 0.0, //
                0.0, 1.0, 0.0, 0.0, //
                0.0, 0.0, 1.0, 0.0,
            ]
        );
    }

    #[test]
    fn translation_lands_in_last_column() {
        let m = to_row_major_3x4(&Mat4::from_translation(Vec3::new(1.0, 2.0, 3.0)));
        assert_eq!(m[3], 1.0);
        assert_eq!(m[7], 2.0);
        assert_eq!(m[11], 3.0);
    }

    #[test]
    fn rotation_is_transposed_into_rows() {
        let rot = Mat4::from_quat(Quat::from_rotation_z(std::f32::consts::FRAC_PI_2));
        let m = to_row_major_3x4(&rot);
        // Row 0 of a +90deg Z rotation is (cos, -sin, 0).
        assert_relative_eq!(m[0], 0.0, epsilon = 1e-6);
        assert_relative_eq!(m[1], -1.0, epsilon = 1e-6);
        assert_relative_eq!(m[4], 1.0, epsilon = 1e-6);
        assert_relative_eq!(m[5], 0.0, epsilon = 1e-6);
    }

    #[test]
    fn align_up_test() {
        assert_eq!(align_up(32, 64), 64);
        assert_eq!(align_up(64, 64), 64);
        assert_eq!(align_up(65, 64), 128);
        assert_eq!(align_up(0, 16), 0);
    }
}
