//! Level selection and page projection.
//!
//! CPU mirror of `select_level` / `virtual_page` in `common.glsl`. The
//! classifier and resolve shaders must agree with these functions, and the
//! tests here pin down their behaviour.

use super::shadow_view::ShadowView;
use super::{VsmLayout, VsmSettings};
use crate::camera::Camera;
use glam::{UVec2, Vec2, Vec3};

/// What the level choice needs to know about the main view.
#[derive(Debug, Clone, Copy)]
pub struct MainViewInfo {
    pub eye: Vec3,
    /// `proj[1][1]` of the perspective projection.
    pub proj_11: f32,
    /// Render height in pixels.
    pub height: f32,
}

impl MainViewInfo {
    pub fn new(camera: &Camera, height: u32) -> Self {
        Self {
            eye: camera.position,
            proj_11: camera.projection_matrix().y_axis.y,
            height: height.max(1) as f32,
        }
    }
}

/// World size of one screen pixel at `distance` from the eye.
pub fn pixel_world_size(distance: f32, proj_11: f32, height: f32) -> f32 {
    distance * 2.0 / (proj_11.abs() * height)
}

/// Level whose texels match a pixel of `pixel_world` size, before the
/// footprint check.
pub fn base_level(pixel_world: f32, settings: &VsmSettings, layout: &VsmLayout) -> u32 {
    let texel0 = settings.first_width / layout.virtual_size() as f32;
    let ratio = pixel_world.max(1e-8) / texel0;
    let level = (ratio.log2() + settings.lod_bias).floor();
    level.clamp(0.0, layout.levels.saturating_sub(1) as f32) as u32
}

/// Finest level that is dense enough for the pixel and contains `world`.
pub fn select_level(
    world: Vec3,
    main: &MainViewInfo,
    shadows: &[ShadowView],
    settings: &VsmSettings,
    layout: &VsmLayout,
) -> u32 {
    let levels = (shadows.len() as u32).min(layout.levels);
    let pixel = pixel_world_size(world.distance(main.eye), main.proj_11, main.height);
    let mut level = base_level(pixel, settings, layout).min(levels.saturating_sub(1));
    while level + 1 < levels && !shadows[level as usize].covers(world) {
        level += 1;
    }
    level
}

/// Page of a level's grid containing light clip-space `clip_xy`.
pub fn virtual_page(clip_xy: Vec2, pages_per_row: u32) -> UVec2 {
    let uv = clip_xy * 0.5 + 0.5;
    let max = pages_per_row.saturating_sub(1) as f32;
    (uv * pages_per_row as f32).floor().clamp(Vec2::ZERO, Vec2::splat(max)).as_uvec2()
}

/// A virtual page some shaded point needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageRequest {
    pub level: u32,
    pub page: UVec2,
}

impl PageRequest {
    /// Byte of the page mask that stands for this page.
    pub fn mask_index(&self, layout: &VsmLayout) -> usize {
        (self.level * layout.virtual_pages + self.page.y * layout.pages_per_row + self.page.x)
            as usize
    }
}

/// Page the classifier marks for a visible world position.
pub fn classify_point(
    world: Vec3,
    main: &MainViewInfo,
    shadows: &[ShadowView],
    settings: &VsmSettings,
    layout: &VsmLayout,
) -> PageRequest {
    let level = select_level(world, main, shadows, settings, layout);
    let clip = shadows[level as usize].clip(world);
    PageRequest {
        level,
        page: virtual_page(clip.truncate(), layout.pages_per_row),
    }
}

/// Reference implementation of the classifier pass over a depth buffer.
pub fn classify_depth(
    depth: &[f32],
    resolution: [u32; 2],
    camera: &Camera,
    shadows: &[ShadowView],
    settings: &VsmSettings,
    layout: &VsmLayout,
) -> Vec<u8> {
    let [width, height] = resolution;
    let main = MainViewInfo::new(camera, height);
    let inv_proj_view = camera.view_projection_matrix().inverse();
    let mut mask = vec![0_u8; layout.mask_len()];

    for (index, &d) in depth.iter().enumerate() {
        if d >= 1.0 {
            continue;
        }
        let pixel = Vec2::new((index as u32 % width) as f32, (index as u32 / width) as f32);
        let uv = (pixel + 0.5) / Vec2::new(width as f32, height as f32);
        let ndc = uv * 2.0 - 1.0;
        let world = inv_proj_view.project_point3(ndc.extend(d));
        let request = classify_point(world, &main, shadows, settings, layout);
        mask[request.mask_index(layout)] = 1;
    }
    mask
}

#[cfg(test)]
mod tests {
    use super::*;
    use umbra_core::constants::vsm::PAGES_PER_ROW;

    fn overhead_views(settings: &VsmSettings, camera_position: Vec3) -> Vec<ShadowView> {
        ShadowView::derive_all(settings, VsmLayout::STANDARD.levels, camera_position, Vec3::Y)
    }

    #[test]
    fn coarser_pixels_never_pick_finer_levels() {
        let settings = VsmSettings::default();
        let layout = VsmLayout::STANDARD;
        let mut previous = 0;
        for step in 0..200 {
            let pixel = 1e-5 * 1.1_f32.powi(step);
            let level = base_level(pixel, &settings, &layout);
            assert!(level >= previous);
            assert!(level < layout.levels);
            previous = level;
        }
        assert_eq!(base_level(0.0, &settings, &layout), 0);
        assert_eq!(base_level(1e9, &settings, &layout), layout.levels - 1);
    }

    #[test]
    fn farther_points_never_pick_finer_levels() {
        let settings = VsmSettings::default();
        let layout = VsmLayout::STANDARD;
        let camera = Camera::looking_at(Vec3::new(0.0, 2.0, 0.0), Vec3::new(0.0, 0.0, -10.0), 1.5);
        let main = MainViewInfo::new(&camera, 720);
        let shadows =
            ShadowView::derive_all(&settings, layout.levels, camera.position, Vec3::new(0.4, 1.0, 0.3));

        let mut previous = 0;
        for step in 1..400 {
            let world = Vec3::new(0.3, 0.0, -0.5 * step as f32);
            let level = select_level(world, &main, &shadows, &settings, &layout);
            assert!(level >= previous, "level dropped at distance {}", world.z);
            previous = level;
        }
        assert!(previous > 0);
    }

    #[test]
    fn known_point_marks_expected_page() {
        // A very negative bias forces the finest level that covers the point
        let settings = VsmSettings {
            first_width: 4.0,
            lod_bias: -100.0,
        };
        let camera = Camera::looking_at(Vec3::new(0.0, 5.0, 0.0), Vec3::new(0.0, 0.0, -1.0), 1.0);
        let main = MainViewInfo::new(&camera, 720);
        let shadows = overhead_views(&settings, camera.position);
        let layout = VsmLayout::STANDARD;

        let centre = classify_point(camera.position, &main, &shadows, &settings, &layout);
        assert_eq!(centre, PageRequest { level: 0, page: UVec2::splat(PAGES_PER_ROW / 2) });

        // Looking down -Y with +Z up, world +X maps to light-space -X
        let near = classify_point(camera.position + Vec3::X, &main, &shadows, &settings, &layout);
        assert_eq!(near, PageRequest { level: 0, page: UVec2::new(32, 64) });

        // Outside level 0 (half width 2) the next level takes over
        let far = classify_point(camera.position + Vec3::X * 3.0, &main, &shadows, &settings, &layout);
        assert_eq!(far, PageRequest { level: 1, page: UVec2::new(16, 64) });
        assert_eq!(far.mask_index(&layout), (layout.virtual_pages + 64 * PAGES_PER_ROW + 16) as usize);
    }

    #[test]
    fn texel_size_follows_the_layout() {
        let settings = VsmSettings {
            first_width: 4.0,
            lod_bias: 0.0,
        };
        let standard = VsmLayout::STANDARD;
        let half = VsmLayout::new(PAGES_PER_ROW / 2, 64, 1, standard.levels);
        let pixel = settings.first_width / standard.virtual_size() as f32 * 2_f32.powf(5.5);

        assert_eq!(base_level(pixel, &settings, &standard), 5);
        // Half the virtual texels per level makes every texel twice as large
        assert_eq!(base_level(pixel, &settings, &half), 4);
    }

    #[test]
    fn small_layout_mask_uses_its_own_stride() {
        let settings = VsmSettings {
            first_width: 4.0,
            lod_bias: -100.0,
        };
        let layout = VsmLayout::new(8, 16, 1, 3);
        let camera = Camera::looking_at(Vec3::new(0.0, 5.0, 0.0), Vec3::new(0.0, 0.0, -1.0), 1.0);
        let main = MainViewInfo::new(&camera, 720);
        let shadows = ShadowView::derive_all(&settings, layout.levels, camera.position, Vec3::Y);

        let far = classify_point(camera.position + Vec3::X * 3.0, &main, &shadows, &settings, &layout);
        assert_eq!(far, PageRequest { level: 1, page: UVec2::new(1, 4) });
        assert_eq!(far.mask_index(&layout), 64 + 4 * 8 + 1);
        assert!(far.mask_index(&layout) < layout.mask_len());
    }

    #[test]
    fn page_coordinates_are_clamped() {
        assert_eq!(virtual_page(Vec2::new(-1.0, 1.0), 128), UVec2::new(0, 127));
        assert_eq!(virtual_page(Vec2::new(5.0, -5.0), 128), UVec2::new(127, 0));
    }

    #[test]
    fn reference_classifier_marks_ground_pages() {
        let settings = VsmSettings::default();
        let layout = VsmLayout::STANDARD;
        let camera = Camera::looking_at(Vec3::new(0.0, 3.0, 6.0), Vec3::ZERO, 1.0);
        let shadows = ShadowView::derive_all(&settings, layout.levels, camera.position, Vec3::new(0.5, 1.0, 0.2));
        let resolution = [16, 16];

        let sky = vec![1.0_f32; 256];
        assert!(classify_depth(&sky, resolution, &camera, &shadows, &settings, &layout)
            .iter()
            .all(|&b| b == 0));

        // Depth of the ground plane y = 0 for every pixel
        let inv = camera.view_projection_matrix().inverse();
        let pv = camera.view_projection_matrix();
        let ground: Vec<f32> = (0..256)
            .map(|i| {
                let uv = (Vec2::new((i % 16) as f32, (i / 16) as f32) + 0.5) / 16.0;
                let ndc = uv * 2.0 - 1.0;
                let near = inv.project_point3(ndc.extend(0.0));
                let far = inv.project_point3(ndc.extend(1.0));
                let dir = far - near;
                if dir.y.abs() < 1e-6 || near.y * far.y > 0.0 {
                    return 1.0;
                }
                let hit = near + dir * (-near.y / dir.y);
                pv.project_point3(hit).z
            })
            .collect();

        let mask = classify_depth(&ground, resolution, &camera, &shadows, &settings, &layout);
        assert_eq!(mask.len(), layout.mask_len());
        let marked = mask.iter().filter(|&&b| b != 0).count();
        assert!(marked > 0);
        assert!(marked <= 256);
    }
}
