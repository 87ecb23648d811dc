//! Per-level orthographic views that follow the main camera.

use super::VsmSettings;
use crate::view::GpuView;
use glam::{Mat4, Vec3};
use umbra_core::constants::vsm::SHADOW_DEPTH_HALF_RANGE;

/// Light-space view of one clipmap level.
#[derive(Debug, Clone, Copy)]
pub struct ShadowView {
    pub level: u32,
    /// Half of the world-space width the level covers.
    pub half_width: f32,
    pub eye: Vec3,
    pub proj: Mat4,
    pub view: Mat4,
    pub proj_view: Mat4,
}

impl ShadowView {
    /// View of `level` centred on `camera_position`.
    ///
    /// `sun_direction` points from the scene towards the sun. Each level
    /// covers twice the width of the one before it.
    pub fn derive(level: u32, first_width: f32, camera_position: Vec3, sun_direction: Vec3) -> Self {
        let half_width = first_width * 2_f32.powi(level as i32) / 2.0;
        let proj = Mat4::orthographic_rh(
            -half_width,
            half_width,
            -half_width,
            half_width,
            -SHADOW_DEPTH_HALF_RANGE,
            SHADOW_DEPTH_HALF_RANGE,
        );
        let sun = sun_direction.try_normalize().unwrap_or(Vec3::Y);
        let eye = camera_position + sun;
        let view = Mat4::look_at_rh(eye, camera_position, light_up(sun));
        Self {
            level,
            half_width,
            eye,
            proj,
            view,
            proj_view: proj * view,
        }
    }

    /// Views of every level for this frame.
    pub fn derive_all(
        settings: &VsmSettings,
        levels: u32,
        camera_position: Vec3,
        sun_direction: Vec3,
    ) -> Vec<Self> {
        (0..levels)
            .map(|level| Self::derive(level, settings.first_width, camera_position, sun_direction))
            .collect()
    }

    /// Light clip-space position of `world`; depth in `[0, 1]`.
    pub fn clip(&self, world: Vec3) -> Vec3 {
        self.proj_view.project_point3(world)
    }

    /// Whether `world` lies inside the level's square footprint.
    pub fn covers(&self, world: Vec3) -> bool {
        let clip = self.clip(world);
        clip.x.abs() <= 1.0 && clip.y.abs() <= 1.0
    }

    pub fn to_gpu(&self, virtual_size: u32) -> GpuView {
        GpuView::new(self.proj, self.view, self.eye, [virtual_size, virtual_size])
    }
}

/// World up unless the sun is almost straight above or below.
fn light_up(sun: Vec3) -> Vec3 {
    if sun.dot(Vec3::Y).abs() > 0.99 {
        Vec3::Z
    } else {
        Vec3::Y
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn width_doubles_per_level() {
        let views = ShadowView::derive_all(&VsmSettings::default(), 4, Vec3::ZERO, Vec3::ONE);
        let widths: Vec<f32> = views.iter().map(|v| v.half_width).collect();
        assert_eq!(widths, vec![2.0, 4.0, 8.0, 16.0]);
    }

    #[test]
    fn camera_projects_to_the_centre() {
        let camera = Vec3::new(10.0, 3.0, -7.0);
        let view = ShadowView::derive(3, 4.0, camera, Vec3::new(0.3, 1.0, 0.2));
        let clip = view.clip(camera);
        assert_relative_eq!(clip.x, 0.0, epsilon = 1e-5);
        assert_relative_eq!(clip.y, 0.0, epsilon = 1e-5);
        assert!((0.0..=1.0).contains(&clip.z));
    }

    #[test]
    fn nearer_the_sun_is_shallower() {
        let sun = Vec3::new(0.2, 1.0, 0.1).normalize();
        let view = ShadowView::derive(0, 4.0, Vec3::ZERO, sun);
        let high = view.clip(sun * 5.0);
        let low = view.clip(-sun * 5.0);
        assert!(high.z < low.z);
    }

    #[test]
    fn overhead_sun_uses_fallback_up() {
        let view = ShadowView::derive(0, 4.0, Vec3::ZERO, Vec3::Y);
        assert!(view.proj_view.is_finite());
        assert!(view.covers(Vec3::new(1.9, -20.0, 1.9)));
        assert!(!view.covers(Vec3::new(2.1, 0.0, 0.0)));
    }

    #[test]
    fn gpu_view_has_virtual_resolution() {
        let view = ShadowView::derive(1, 4.0, Vec3::ZERO, Vec3::ONE).to_gpu(16384);
        assert_eq!(view.resolution[0], 16384.0);
        assert_eq!(view.resolution[1], 16384.0);
    }
}
