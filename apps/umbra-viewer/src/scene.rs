//! Procedural demo scene and sun animation.

use glam::{Mat4, Quat, Vec3};
use umbra_core::Result;
use umbra_render::{Mesh, MeshId, SceneBuilder};

/// Edge length of the ground plane.
const GROUND_SIZE: f32 = 400.0;

/// Sun elevation above the horizon in radians.
const SUN_ELEVATION: f32 = 0.75;

/// Meshes shared by every placed object.
#[derive(Debug, Clone, Copy)]
pub struct DemoMeshes {
    pub cube: MeshId,
    pub sphere: MeshId,
    pub ground: MeshId,
}

/// Build the starting scene: a ground plane with rows of pillars, scattered
/// boxes and spheres.
pub fn build_demo_scene() -> Result<(SceneBuilder, DemoMeshes)> {
    let mut scene = SceneBuilder::new();
    let meshes = DemoMeshes {
        cube: scene.add_mesh(&Mesh::cube())?,
        sphere: scene.add_mesh(&Mesh::sphere(1.0, 16, 32))?,
        ground: scene.add_mesh(&Mesh::plane(GROUND_SIZE, 32))?,
    };

    scene.add_instance(meshes.ground, Mat4::IDENTITY, Vec3::new(0.55, 0.55, 0.5))?;

    // Pillars along two avenues, tall enough to cast shadows across levels
    for i in -8..=8 {
        for side in [-1.0_f32, 1.0] {
            let height = 3.0 + (i as f32 * 1.7).sin().abs() * 9.0;
            let position = Vec3::new(side * 6.0, height * 0.5, i as f32 * 7.0);
            scene.add_instance(
                meshes.cube,
                Mat4::from_scale_rotation_translation(
                    Vec3::new(1.2, height, 1.2),
                    Quat::IDENTITY,
                    position,
                ),
                Vec3::new(0.8, 0.75, 0.7),
            )?;
        }
    }

    // Deterministic scatter of rotated boxes and spheres
    for n in 0..64_u32 {
        let angle = n as f32 * 2.399_963;
        let radius = 12.0 + (n as f32).sqrt() * 9.0;
        let ground = Vec3::new(angle.cos() * radius, 0.0, angle.sin() * radius);
        let size = 0.6 + (n % 5) as f32 * 0.5;
        let tint = Vec3::new(
            0.4 + (n % 3) as f32 * 0.2,
            0.5 + (n % 4) as f32 * 0.1,
            0.6 - (n % 2) as f32 * 0.2,
        );
        if n % 3 == 0 {
            scene.add_instance(
                meshes.sphere,
                Mat4::from_scale_rotation_translation(
                    Vec3::splat(size),
                    Quat::IDENTITY,
                    ground + Vec3::Y * size,
                ),
                tint,
            )?;
        } else {
            scene.add_instance(
                meshes.cube,
                Mat4::from_scale_rotation_translation(
                    Vec3::splat(size * 2.0),
                    Quat::from_rotation_y(angle),
                    ground + Vec3::Y * size,
                ),
                tint,
            )?;
        }
    }

    Ok((scene, meshes))
}

/// Drop a unit cube of edge `size` onto the ground at `ground`.
pub fn spawn_cube(
    scene: &mut SceneBuilder,
    meshes: &DemoMeshes,
    ground: Vec3,
    size: f32,
    seed: u32,
) -> Result<()> {
    let hue = (seed as f32 * 0.618_034).fract();
    let tint = Vec3::new(0.3 + hue * 0.6, 0.9 - hue * 0.5, 0.4 + (1.0 - hue) * 0.3);
    scene.add_instance(
        meshes.cube,
        Mat4::from_scale_rotation_translation(
            Vec3::splat(size),
            Quat::from_rotation_y(seed as f32 * 0.7),
            Vec3::new(ground.x, size * 0.5, ground.z),
        ),
        tint,
    )
}

/// Direction from the scene towards the sun at `azimuth` radians.
pub fn sun_direction(azimuth: f32) -> Vec3 {
    Vec3::new(
        azimuth.cos() * SUN_ELEVATION.cos(),
        SUN_ELEVATION.sin(),
        azimuth.sin() * SUN_ELEVATION.cos(),
    )
}

/// Where a ray from `origin` along `direction` meets the ground plane.
pub fn ground_hit(origin: Vec3, direction: Vec3) -> Option<Vec3> {
    if direction.y >= -1e-4 || origin.y <= 0.0 {
        return None;
    }
    let t = -origin.y / direction.y;
    Some(origin + direction * t)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn demo_scene_is_populated() {
        let (scene, _) = build_demo_scene().unwrap();
        // Ground, 34 pillars and 64 scattered objects
        assert_eq!(scene.transforms().len(), 1 + 34 + 64);
        assert!(scene.instance_count() as usize >= scene.transforms().len());
        assert!(scene.bounds().max.y > 10.0);
    }

    #[test]
    fn spawned_cube_rests_on_ground() {
        let (mut scene, meshes) = build_demo_scene().unwrap();
        let before = scene.transforms().len();
        spawn_cube(&mut scene, &meshes, Vec3::new(3.0, 7.0, -2.0), 2.0, 5).unwrap();
        assert_eq!(scene.transforms().len(), before + 1);
        let model = Mat4::from_cols_array_2d(&scene.transforms()[before].model);
        assert_relative_eq!(model.w_axis.y, 1.0);
    }

    #[test]
    fn sun_stays_above_horizon() {
        for step in 0..16 {
            let sun = sun_direction(step as f32 * 0.4);
            assert_relative_eq!(sun.length(), 1.0, epsilon = 1e-5);
            assert!(sun.y > 0.5);
        }
    }

    #[test]
    fn ground_hit_under_looking_down() {
        let hit = ground_hit(Vec3::new(1.0, 4.0, 0.0), Vec3::new(0.0, -1.0, -1.0).normalize());
        let hit = hit.unwrap();
        assert_relative_eq!(hit.y, 0.0, epsilon = 1e-5);
        assert_relative_eq!(hit.z, -4.0, epsilon = 1e-4);
        assert!(ground_hit(Vec3::new(0.0, 4.0, 0.0), Vec3::Z).is_none());
    }
}
