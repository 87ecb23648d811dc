//! Camera and view management.

use glam::{Mat4, Vec3};
use umbra_core::math::Frustum;

/// Perspective camera for the main view.
#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    pub direction: Vec3,
    pub up: Vec3,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 4.0, 12.0),
            direction: Vec3::NEG_Z,
            up: Vec3::Y,
            fov: std::f32::consts::FRAC_PI_4,
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 1000.0,
        }
    }
}

impl Camera {
    /// Camera at `position` looking at `target`.
    pub fn looking_at(position: Vec3, target: Vec3, aspect: f32) -> Self {
        Self {
            position,
            direction: (target - position).try_normalize().unwrap_or(Vec3::NEG_Z),
            aspect,
            ..Self::default()
        }
    }

    pub fn set_aspect(&mut self, aspect: f32) {
        self.aspect = aspect;
    }

    /// Point the camera along yaw/pitch angles in radians.
    pub fn set_orientation(&mut self, yaw: f32, pitch: f32) {
        self.direction = Vec3::new(
            yaw.cos() * pitch.cos(),
            pitch.sin(),
            yaw.sin() * pitch.cos(),
        )
        .normalize();
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.direction, self.up)
    }

    /// Perspective projection with `[0, 1]` depth and Y pointing down in
    /// clip space, matching Vulkan's framebuffer orientation.
    pub fn projection_matrix(&self) -> Mat4 {
        let mut proj = Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far);
        proj.y_axis.y = -proj.y_axis.y;
        proj
    }

    /// Get the view-projection matrix.
    pub fn view_projection_matrix(&self) -> Mat4 {
        self.projection_matrix() * self.view_matrix()
    }

    /// Extract frustum planes from the current camera state.
    pub fn frustum(&self) -> Frustum {
        Frustum::from_view_projection(self.view_projection_matrix())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn projection_flips_y() {
        let camera = Camera::default();
        let above = camera.position + camera.direction * 10.0 + Vec3::Y;
        let clip = camera.view_projection_matrix() * above.extend(1.0);
        assert!(clip.y / clip.w < 0.0, "points above the view axis land in the upper half");
    }

    #[test]
    fn orientation_matches_yaw_pitch() {
        let mut camera = Camera::default();
        camera.set_orientation(0.0, 0.0);
        assert_relative_eq!(camera.direction.x, 1.0, epsilon = 1e-6);
        camera.set_orientation(std::f32::consts::FRAC_PI_2, 0.0);
        assert_relative_eq!(camera.direction.z, 1.0, epsilon = 1e-6);
    }

    #[test]
    fn looking_at_target_contains_target() {
        let camera = Camera::looking_at(Vec3::new(0.0, 5.0, 10.0), Vec3::ZERO, 1.5);
        assert!(camera.frustum().contains_point(Vec3::ZERO));
    }
}
