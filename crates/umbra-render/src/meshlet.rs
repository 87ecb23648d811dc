//! Splitting triangle lists into meshlets.
//!
//! A meshlet references up to [`MAX_MESHLET_VERTICES`] vertices through a
//! local index table and stores its triangles as byte-sized indices into that
//! table, which is what one mesh shader workgroup emits.

use crate::mesh::Mesh;
use bytemuck::{Pod, Zeroable};
use hashbrown::HashMap;
use umbra_core::{Error, Result};

/// Vertex limit of a meshlet, matching the mesh shader's `max_vertices`.
pub const MAX_MESHLET_VERTICES: usize = 64;
/// Triangle limit of a meshlet, matching the mesh shader's `max_primitives`.
pub const MAX_MESHLET_PRIMITIVES: usize = 124;

/// One meshlet as seen by the mesh shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct Meshlet {
    /// First entry in the vertex index table.
    pub vertex_offset: u32,
    /// First byte in the primitive index table.
    pub primitive_offset: u32,
    pub vertex_count: u32,
    pub primitive_count: u32,
}

/// Meshlets of one or more meshes sharing index tables.
#[derive(Clone, Debug, Default)]
pub struct MeshletData {
    pub meshlets: Vec<Meshlet>,
    /// Global vertex indices referenced by meshlets.
    pub vertex_indices: Vec<u32>,
    /// Three local indices per triangle.
    pub primitive_indices: Vec<u8>,
}

impl MeshletData {
    /// Append the meshlets of `mesh`, whose vertices start at `base_vertex`
    /// in the shared vertex buffer.
    ///
    /// Triangles are packed greedily in index order. Returns the range of
    /// the new meshlets.
    pub fn append(&mut self, mesh: &Mesh, base_vertex: u32) -> Result<std::ops::Range<u32>> {
        if mesh.indices.len() % 3 != 0 {
            return Err(Error::Meshlet(format!(
                "index count {} is not a multiple of three",
                mesh.indices.len()
            )));
        }
        if let Some(&bad) = mesh
            .indices
            .iter()
            .find(|&&i| i as usize >= mesh.vertices.len())
        {
            return Err(Error::Meshlet(format!(
                "index {bad} out of range for {} vertices",
                mesh.vertices.len()
            )));
        }

        let first = self.meshlets.len() as u32;
        let mut builder = Builder::new(self);
        for triangle in mesh.indices.chunks_exact(3) {
            let triangle = [triangle[0], triangle[1], triangle[2]].map(|i| i + base_vertex);
            if !builder.fits(&triangle) {
                builder.flush();
            }
            builder.push(triangle);
        }
        builder.flush();

        Ok(first..self.meshlets.len() as u32)
    }
}

struct Builder<'a> {
    out: &'a mut MeshletData,
    local: HashMap<u32, u8>,
    vertices: Vec<u32>,
    primitives: Vec<u8>,
}

impl<'a> Builder<'a> {
    fn new(out: &'a mut MeshletData) -> Self {
        Self {
            out,
            local: HashMap::with_capacity(MAX_MESHLET_VERTICES),
            vertices: Vec::with_capacity(MAX_MESHLET_VERTICES),
            primitives: Vec::with_capacity(MAX_MESHLET_PRIMITIVES * 3),
        }
    }

    fn fits(&self, triangle: &[u32; 3]) -> bool {
        let new_vertices = triangle
            .iter()
            .enumerate()
            .filter(|&(n, i)| !self.local.contains_key(i) && !triangle[..n].contains(i))
            .count();
        self.primitives.len() / 3 < MAX_MESHLET_PRIMITIVES
            && self.vertices.len() + new_vertices <= MAX_MESHLET_VERTICES
    }

    fn push(&mut self, triangle: [u32; 3]) {
        for vertex in triangle {
            let next = self.vertices.len() as u8;
            let local = *self.local.entry(vertex).or_insert_with(|| {
                self.vertices.push(vertex);
                next
            });
            self.primitives.push(local);
        }
    }

    fn flush(&mut self) {
        if self.primitives.is_empty() {
            return;
        }
        self.out.meshlets.push(Meshlet {
            vertex_offset: self.out.vertex_indices.len() as u32,
            primitive_offset: self.out.primitive_indices.len() as u32,
            vertex_count: self.vertices.len() as u32,
            primitive_count: (self.primitives.len() / 3) as u32,
        });
        self.out.vertex_indices.append(&mut self.vertices);
        self.out.primitive_indices.append(&mut self.primitives);
        self.local.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Mesh;
    use proptest::prelude::*;

    /// Rebuild the global triangle list from meshlets.
    fn expand(data: &MeshletData, range: std::ops::Range<u32>) -> Vec<u32> {
        let mut out = Vec::new();
        for meshlet in &data.meshlets[range.start as usize..range.end as usize] {
            let prims = meshlet.primitive_offset as usize;
            for &local in &data.primitive_indices[prims..prims + meshlet.primitive_count as usize * 3] {
                assert!(u32::from(local) < meshlet.vertex_count);
                out.push(data.vertex_indices[meshlet.vertex_offset as usize + local as usize]);
            }
        }
        out
    }

    #[test]
    fn cube_fits_one_meshlet() {
        let mut data = MeshletData::default();
        let range = data.append(&Mesh::cube(), 0).unwrap();
        assert_eq!(range, 0..1);
        assert_eq!(data.meshlets[0].vertex_count, 24);
        assert_eq!(data.meshlets[0].primitive_count, 12);
        assert_eq!(expand(&data, range), Mesh::cube().indices);
    }

    #[test]
    fn large_mesh_respects_limits() {
        let mesh = Mesh::sphere(1.0, 32, 48);
        let mut data = MeshletData::default();
        let range = data.append(&mesh, 0).unwrap();
        assert!(range.len() > 1);
        for meshlet in &data.meshlets {
            assert!(meshlet.vertex_count as usize <= MAX_MESHLET_VERTICES);
            assert!(meshlet.primitive_count as usize <= MAX_MESHLET_PRIMITIVES);
            assert!(meshlet.primitive_count > 0);
        }
        assert_eq!(expand(&data, range), mesh.indices);
    }

    #[test]
    fn base_vertex_offsets_indices() {
        let mut data = MeshletData::default();
        data.append(&Mesh::cube(), 0).unwrap();
        let range = data.append(&Mesh::cube(), 24).unwrap();
        assert_eq!(range, 1..2);
        let expected: Vec<u32> = Mesh::cube().indices.iter().map(|i| i + 24).collect();
        assert_eq!(expand(&data, range), expected);
    }

    #[test]
    fn rejects_bad_indices() {
        let mut mesh = Mesh::cube();
        mesh.indices.push(0);
        assert!(MeshletData::default().append(&mesh, 0).is_err());

        let mut mesh = Mesh::cube();
        mesh.indices[0] = 1000;
        assert!(MeshletData::default().append(&mesh, 0).is_err());
    }

    #[test]
    fn empty_mesh_has_no_meshlets() {
        let mut data = MeshletData::default();
        let range = data.append(&Mesh::default(), 0).unwrap();
        assert!(range.is_empty());
    }

    proptest! {
        #[test]
        fn arbitrary_triangles_survive_packing(
            indices in prop::collection::vec(0u32..200, 0..600)
                .prop_map(|mut v| { v.truncate(v.len() / 3 * 3); v })
        ) {
            let mesh = Mesh {
                vertices: vec![crate::mesh::Vertex::new(glam::Vec3::ZERO, glam::Vec3::Y); 200],
                indices,
            };
            let mut data = MeshletData::default();
            let range = data.append(&mesh, 0).unwrap();
            for meshlet in &data.meshlets {
                prop_assert!(meshlet.vertex_count as usize <= MAX_MESHLET_VERTICES);
                prop_assert!(meshlet.primitive_count as usize <= MAX_MESHLET_PRIMITIVES);
            }
            prop_assert_eq!(expand(&data, range), mesh.indices);
        }
    }
}
