//! Camera and view management.

use glam::{Mat4, Vec3};

/// Pinhole camera. Ray generation reconstructs rays from the inverse matrices.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    /// Vertical field of view in radians.
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 0.0, 5.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

/// Push constant block read by the ray generation shader (128 bytes).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, bytemuck::Pod, bytemuck::Zeroable)]
pub struct CameraPushConstants {
    pub inverse_view: Mat4,
    pub inverse_projection: Mat4,
}

impl Camera {
    pub fn looking_at(position: Vec3, target: Vec3, aspect: f32) -> Self {
        Self {
            position,
            direction: (target - position).normalize(),
            aspect,
            ..Self::default()
        }
    }

    pub fn look_at(&mut self, target: Vec3) {
        self.direction = (target - self.position).normalize();
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    /// Right-handed projection with Vulkan's flipped Y.
    pub fn projection_matrix(&self) -> Mat4 {
        let mut projection = Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far);
        projection.y_axis.y *= -1.0;
        projection
    }

    pub fn push_constants(&self) -> CameraPushConstants {
        CameraPushConstants {
            inverse_view: self.view_matrix().inverse(),
            inverse_projection: self.projection_matrix().inverse(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use glam::Vec4;

    #[test]
    fn push_constants_fit_guaranteed_limit() {
        assert_eq!(std::mem::size_of::<CameraPushConstants>(), 128);
    }

    #[test]
    fn center_ray_points_along_direction() {
        let camera = Camera::looking_at(Vec3::new(0.0, 2.0, 5.0), Vec3::new(0.0, 2.0, 0.0), 1.5);
        let push = camera.push_constants();

        let origin = push.inverse_view.transform_point3(Vec3::ZERO);
        assert_relative_eq!(origin.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(origin.y, 2.0, epsilon = 1e-5);
        assert_relative_eq!(origin.z, 5.0, epsilon = 1e-5);

        let target = push.inverse_projection * Vec4::new(0.0, 0.0, 1.0, 1.0);
        let direction = push
            .inverse_view
            .transform_vector3(target.truncate().normalize());
        assert_relative_eq!(direction.z, -1.0, epsilon = 1e-5);
    }

    #[test]
    fn projection_flips_y() {
        let camera = Camera::default();
        let clip = camera.projection_matrix() * Vec4::new(0.0, 1.0, -1.0, 1.0);
        assert!(clip.y < 0.0);
    }
}
