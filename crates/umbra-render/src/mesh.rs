//! Indexed triangle meshes and a few procedural primitives.
//!
//! Triangles are wound counter-clockwise when seen from outside.

use bytemuck::{Pod, Zeroable};
use glam::{Vec2, Vec3};
use umbra_core::Aabb;

/// Vertex as stored in the scene's vertex buffer.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
}

impl Vertex {
    pub fn new(position: Vec3, normal: Vec3) -> Self {
        Self {
            position: position.to_array(),
            normal: normal.to_array(),
        }
    }
}

/// An indexed triangle list.
#[derive(Clone, Debug, Default)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl Mesh {
    pub fn triangle_count(&self) -> usize {
        self.indices.len() / 3
    }

    pub fn bounds(&self) -> Aabb {
        Aabb::from_points(self.vertices.iter().map(|v| Vec3::from(v.position)))
    }

    /// Axis-aligned box centered on the origin with flat-shaded faces.
    pub fn cuboid(half_extents: Vec3) -> Self {
        let faces = [
            (Vec3::X, Vec3::Y),
            (Vec3::NEG_X, Vec3::Y),
            (Vec3::Y, Vec3::NEG_Z),
            (Vec3::NEG_Y, Vec3::Z),
            (Vec3::Z, Vec3::Y),
            (Vec3::NEG_Z, Vec3::Y),
        ];

        let mut mesh = Self::default();
        for (normal, up) in faces {
            let right = up.cross(normal);
            let base = mesh.vertices.len() as u32;
            for corner in [
                Vec2::new(-1.0, -1.0),
                Vec2::new(1.0, -1.0),
                Vec2::new(1.0, 1.0),
                Vec2::new(-1.0, 1.0),
            ] {
                let position = (normal + right * corner.x + up * corner.y) * half_extents;
                mesh.vertices.push(Vertex::new(position, normal));
            }
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }
        mesh
    }

    /// Unit cube spanning `[-0.5, 0.5]³`.
    pub fn cube() -> Self {
        Self::cuboid(Vec3::splat(0.5))
    }

    /// Square in the XZ plane facing +Y, split into `subdivisions²` quads.
    pub fn plane(size: f32, subdivisions: u32) -> Self {
        let n = subdivisions.max(1);
        let step = size / n as f32;
        let origin = -size * 0.5;

        let mut mesh = Self::default();
        for z in 0..=n {
            for x in 0..=n {
                let position = Vec3::new(origin + x as f32 * step, 0.0, origin + z as f32 * step);
                mesh.vertices.push(Vertex::new(position, Vec3::Y));
            }
        }
        let row = n + 1;
        for z in 0..n {
            for x in 0..n {
                let i = z * row + x;
                mesh.indices
                    .extend_from_slice(&[i, i + row, i + 1, i + 1, i + row, i + row + 1]);
            }
        }
        mesh
    }

    /// Latitude/longitude sphere.
    pub fn sphere(radius: f32, rings: u32, sectors: u32) -> Self {
        let rings = rings.max(2);
        let sectors = sectors.max(3);

        let mut mesh = Self::default();
        for ring in 0..=rings {
            let phi = std::f32::consts::PI * ring as f32 / rings as f32;
            for sector in 0..=sectors {
                let theta = std::f32::consts::TAU * sector as f32 / sectors as f32;
                let normal = Vec3::new(phi.sin() * theta.cos(), phi.cos(), phi.sin() * theta.sin());
                mesh.vertices.push(Vertex::new(normal * radius, normal));
            }
        }
        let row = sectors + 1;
        for ring in 0..rings {
            for sector in 0..sectors {
                let i = ring * row + sector;
                if ring != 0 {
                    mesh.indices.extend_from_slice(&[i, i + 1, i + row]);
                }
                if ring != rings - 1 {
                    mesh.indices.extend_from_slice(&[i + 1, i + row + 1, i + row]);
                }
            }
        }
        mesh
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_outward(mesh: &Mesh) {
        let center = mesh.bounds().center();
        for tri in mesh.indices.chunks_exact(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| Vec3::from(mesh.vertices[i as usize].position));
            let normal = (b - a).cross(c - a);
            let centroid = (a + b + c) / 3.0;
            assert!(
                normal.dot(centroid - center) > 0.0,
                "triangle {tri:?} faces inwards"
            );
        }
    }

    #[test]
    fn cube_faces_point_outwards() {
        let cube = Mesh::cube();
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.triangle_count(), 12);
        assert_outward(&cube);
    }

    #[test]
    fn sphere_faces_point_outwards() {
        let sphere = Mesh::sphere(2.0, 8, 12);
        assert_outward(&sphere);
        for v in &sphere.vertices {
            assert!((Vec3::from(v.position).length() - 2.0).abs() < 1e-4);
        }
    }

    #[test]
    fn plane_faces_up() {
        let plane = Mesh::plane(10.0, 4);
        assert_eq!(plane.triangle_count(), 32);
        for tri in plane.indices.chunks_exact(3) {
            let [a, b, c] = [tri[0], tri[1], tri[2]].map(|i| Vec3::from(plane.vertices[i as usize].position));
            assert!((b - a).cross(c - a).y > 0.0);
        }
    }

    #[test]
    fn vertex_is_tightly_packed() {
        assert_eq!(std::mem::size_of::<Vertex>(), 24);
    }
}
