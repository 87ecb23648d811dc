//! Scene description and its GPU mirror.
//!
//! Meshes are split into meshlets once when added. Every placed instance of a
//! mesh contributes one [`MeshletInstance`] per meshlet, and the mesh shader
//! runs one workgroup per meshlet instance.

use crate::mesh::{Mesh, Vertex};
use crate::meshlet::{Meshlet, MeshletData, MAX_MESHLET_PRIMITIVES};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use gpu_allocator::MemoryLocation;
use umbra_core::{Aabb, Error, Result as CoreResult};
use umbra_gpu::{DeferredDeletionQueue, DynamicBuffer, GpuAllocator, GpuError, Result};

/// Bits of a visibility ID holding the primitive within its meshlet.
pub const PRIMITIVE_BITS: u32 = 7;
/// Visibility ID of pixels no triangle covered.
pub const INVALID_ID: u32 = u32::MAX;
/// Most meshlet instances a scene may hold.
pub const MAX_MESHLET_INSTANCES: usize = 65535;

const _: () = assert!(MAX_MESHLET_PRIMITIVES <= 1 << PRIMITIVE_BITS);

/// Handle of a mesh added to a [`SceneBuilder`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct MeshId(u32);

#[derive(Clone, Debug)]
struct MeshEntry {
    meshlets: std::ops::Range<u32>,
    bounds: Aabb,
}

/// Model matrix and color of one placed mesh.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct Transform {
    pub model: [[f32; 4]; 4],
    pub tint: [f32; 4],
}

impl Transform {
    pub fn new(model: Mat4, tint: Vec3) -> Self {
        Self {
            model: model.to_cols_array_2d(),
            tint: tint.extend(1.0).to_array(),
        }
    }
}

/// One meshlet drawn with one transform.
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Pod, Zeroable)]
pub struct MeshletInstance {
    pub meshlet: u32,
    pub transform: u32,
}

/// Pack an instance index and a primitive index into a visibility ID.
pub const fn visibility_id(instance: u32, primitive: u32) -> u32 {
    (instance << PRIMITIVE_BITS) | primitive
}

/// Split a visibility ID into instance and primitive.
pub const fn unpack_visibility_id(id: u32) -> (u32, u32) {
    (id >> PRIMITIVE_BITS, id & ((1 << PRIMITIVE_BITS) - 1))
}

/// CPU-side scene: geometry, meshlets and placed instances.
#[derive(Clone, Debug, Default)]
pub struct SceneBuilder {
    vertices: Vec<Vertex>,
    meshlets: MeshletData,
    meshes: Vec<MeshEntry>,
    transforms: Vec<Transform>,
    instances: Vec<MeshletInstance>,
    bounds: Aabb,
}

impl SceneBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add geometry that can then be placed any number of times.
    pub fn add_mesh(&mut self, mesh: &Mesh) -> CoreResult<MeshId> {
        let base_vertex = self.vertices.len() as u32;
        let meshlets = self.meshlets.append(mesh, base_vertex)?;
        tracing::trace!(
            triangles = mesh.triangle_count(),
            meshlets = meshlets.len(),
            "Added mesh"
        );
        self.vertices.extend_from_slice(&mesh.vertices);
        self.meshes.push(MeshEntry {
            meshlets,
            bounds: mesh.bounds(),
        });
        Ok(MeshId(self.meshes.len() as u32 - 1))
    }

    /// Place `mesh` with `model` and color `tint`.
    pub fn add_instance(&mut self, mesh: MeshId, model: Mat4, tint: Vec3) -> CoreResult<()> {
        let entry = self
            .meshes
            .get(mesh.0 as usize)
            .ok_or_else(|| Error::OutOfBounds(format!("unknown mesh {mesh:?}")))?;
        let added = entry.meshlets.len();
        if self.instances.len() + added > MAX_MESHLET_INSTANCES {
            return Err(Error::OutOfBounds(format!(
                "scene would hold {} meshlet instances, limit is {MAX_MESHLET_INSTANCES}",
                self.instances.len() + added
            )));
        }

        let transform = self.transforms.len() as u32;
        self.transforms.push(Transform::new(model, tint));
        self.instances.extend(
            entry
                .meshlets
                .clone()
                .map(|meshlet| MeshletInstance { meshlet, transform }),
        );

        if !entry.bounds.is_empty() {
            let world = entry.bounds.transformed(model);
            self.bounds.expand_to_include(world.min);
            self.bounds.expand_to_include(world.max);
        }
        Ok(())
    }

    pub fn vertices(&self) -> &[Vertex] {
        &self.vertices
    }

    pub fn meshlets(&self) -> &[Meshlet] {
        &self.meshlets.meshlets
    }

    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    pub fn instances(&self) -> &[MeshletInstance] {
        &self.instances
    }

    pub fn instance_count(&self) -> u32 {
        self.instances.len() as u32
    }

    /// World bounds of all placed instances.
    pub const fn bounds(&self) -> &Aabb {
        &self.bounds
    }
}

/// Buffer addresses the shaders reach the scene through.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct SceneHeader {
    pub meshlets: vk::DeviceAddress,
    pub transforms: vk::DeviceAddress,
    pub vertices: vk::DeviceAddress,
    pub vertex_indices: vk::DeviceAddress,
    pub primitive_indices: vk::DeviceAddress,
    pub instance_count: u32,
    pub _pad: u32,
}

/// Push constants of the meshlet mesh shader.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct MeshPushConstants {
    pub views: vk::DeviceAddress,
    pub scene: vk::DeviceAddress,
    pub instances: vk::DeviceAddress,
    pub view_index: u32,
    pub instance_count: u32,
}

impl MeshPushConstants {
    pub const SIZE: u32 = std::mem::size_of::<Self>() as u32;
}

/// Scene data resident in device-addressable buffers.
pub struct GpuScene {
    meshlets: DynamicBuffer,
    transforms: DynamicBuffer,
    vertices: DynamicBuffer,
    vertex_indices: DynamicBuffer,
    primitive_indices: DynamicBuffer,
    instances: DynamicBuffer,
    header: DynamicBuffer,
    instance_count: u32,
}

impl GpuScene {
    pub fn new(allocator: &mut GpuAllocator) -> Result<Self> {
        let storage = |allocator: &mut GpuAllocator, name: &str| {
            DynamicBuffer::new(
                allocator,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::CpuToGpu,
                name,
            )
        };
        Ok(Self {
            meshlets: storage(allocator, "scene_meshlets")?,
            transforms: storage(allocator, "scene_transforms")?,
            vertices: storage(allocator, "scene_vertices")?,
            vertex_indices: storage(allocator, "scene_vertex_indices")?,
            primitive_indices: storage(allocator, "scene_primitive_indices")?,
            instances: storage(allocator, "scene_instances")?,
            header: storage(allocator, "scene_header")?,
            instance_count: 0,
        })
    }

    /// Replace the GPU copy with `scene`.
    ///
    /// The buffers are written in place, so no frame that reads them may be
    /// in flight. Outgrown buffers are retired to `deletion`.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn upload(
        &mut self,
        allocator: &mut GpuAllocator,
        device: &ash::Device,
        deletion: &mut DeferredDeletionQueue,
        frame: u64,
        scene: &SceneBuilder,
    ) -> Result<()> {
        if scene.instances.len() > MAX_MESHLET_INSTANCES {
            return Err(GpuError::InvalidState(format!(
                "{} meshlet instances exceed the limit of {MAX_MESHLET_INSTANCES}",
                scene.instances.len()
            )));
        }

        self.meshlets
            .upload(allocator, deletion, frame, &scene.meshlets.meshlets)?;
        self.transforms
            .upload(allocator, deletion, frame, &scene.transforms)?;
        self.vertices
            .upload(allocator, deletion, frame, &scene.vertices)?;
        self.vertex_indices
            .upload(allocator, deletion, frame, &scene.meshlets.vertex_indices)?;
        self.primitive_indices
            .upload(allocator, deletion, frame, &scene.meshlets.primitive_indices)?;
        self.instances
            .upload(allocator, deletion, frame, &scene.instances)?;

        self.instance_count = scene.instance_count();
        let header = SceneHeader {
            meshlets: self.meshlets.device_address(device),
            transforms: self.transforms.device_address(device),
            vertices: self.vertices.device_address(device),
            vertex_indices: self.vertex_indices.device_address(device),
            primitive_indices: self.primitive_indices.device_address(device),
            instance_count: self.instance_count,
            _pad: 0,
        };
        self.header
            .upload(allocator, deletion, frame, std::slice::from_ref(&header))?;

        tracing::debug!(
            meshlets = scene.meshlets().len(),
            instances = self.instance_count,
            vertices = scene.vertices.len(),
            "Uploaded scene"
        );
        Ok(())
    }

    pub const fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn header_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        self.header.device_address(device)
    }

    pub fn instances_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        self.instances.device_address(device)
    }

    /// Push constants drawing every instance into view `view_index`.
    pub fn push_constants(
        &self,
        device: &ash::Device,
        views: vk::DeviceAddress,
        view_index: u32,
    ) -> MeshPushConstants {
        MeshPushConstants {
            views,
            scene: self.header_address(device),
            instances: self.instances_address(device),
            view_index,
            instance_count: self.instance_count,
        }
    }

    /// Free all buffers. The device must be idle.
    pub fn destroy(self, allocator: &mut GpuAllocator) -> Result<()> {
        for buffer in [
            self.meshlets,
            self.transforms,
            self.vertices,
            self.vertex_indices,
            self.primitive_indices,
            self.instances,
            self.header,
        ] {
            buffer.destroy(allocator)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gpu_struct_sizes_match_shaders() {
        assert_eq!(std::mem::size_of::<Meshlet>(), 16);
        assert_eq!(std::mem::size_of::<MeshletInstance>(), 8);
        assert_eq!(std::mem::size_of::<Transform>(), 80);
        assert_eq!(std::mem::size_of::<SceneHeader>(), 48);
        assert_eq!(MeshPushConstants::SIZE, 32);
    }

    #[test]
    fn visibility_id_round_trips_limits() {
        let id = visibility_id(MAX_MESHLET_INSTANCES as u32 - 1, MAX_MESHLET_PRIMITIVES as u32 - 1);
        assert_ne!(id, INVALID_ID);
        assert_eq!(
            unpack_visibility_id(id),
            (MAX_MESHLET_INSTANCES as u32 - 1, MAX_MESHLET_PRIMITIVES as u32 - 1)
        );
    }

    #[test]
    fn instances_reference_their_meshlets() {
        let mut scene = SceneBuilder::new();
        let cube = scene.add_mesh(&Mesh::cube()).unwrap();
        let sphere = scene.add_mesh(&Mesh::sphere(1.0, 16, 24)).unwrap();
        scene
            .add_instance(cube, Mat4::from_translation(Vec3::X * 5.0), Vec3::ONE)
            .unwrap();
        scene.add_instance(sphere, Mat4::IDENTITY, Vec3::ONE).unwrap();

        let sphere_meshlets = scene.meshlets().len() as u32 - 1;
        assert_eq!(scene.instance_count(), 1 + sphere_meshlets);
        assert_eq!(scene.instances()[0], MeshletInstance { meshlet: 0, transform: 0 });
        assert!(scene.instances()[1..]
            .iter()
            .all(|i| i.transform == 1 && i.meshlet >= 1));
        assert_eq!(scene.transforms().len(), 2);
    }

    #[test]
    fn bounds_cover_transformed_instances() {
        let mut scene = SceneBuilder::new();
        let cube = scene.add_mesh(&Mesh::cube()).unwrap();
        scene
            .add_instance(cube, Mat4::from_translation(Vec3::new(10.0, 0.0, 0.0)), Vec3::ONE)
            .unwrap();
        scene
            .add_instance(cube, Mat4::from_translation(Vec3::new(-10.0, 0.0, 0.0)), Vec3::ONE)
            .unwrap();
        let bounds = scene.bounds();
        assert!(bounds.contains_point(Vec3::new(10.4, 0.0, 0.0)));
        assert!(bounds.contains_point(Vec3::new(-10.4, 0.0, 0.0)));
        assert!(!bounds.contains_point(Vec3::new(0.0, 1.0, 0.0)));
    }

    #[test]
    fn unknown_mesh_is_rejected() {
        let mut scene = SceneBuilder::new();
        assert!(scene
            .add_instance(MeshId(3), Mat4::IDENTITY, Vec3::ONE)
            .is_err());
    }

    #[test]
    fn instance_limit_is_enforced() {
        let mut scene = SceneBuilder::new();
        let cube = scene.add_mesh(&Mesh::cube()).unwrap();
        for _ in 0..MAX_MESHLET_INSTANCES {
            scene.add_instance(cube, Mat4::IDENTITY, Vec3::ONE).unwrap();
        }
        assert!(scene.add_instance(cube, Mat4::IDENTITY, Vec3::ONE).is_err());
        assert_eq!(scene.instances().len(), MAX_MESHLET_INSTANCES);
    }
}
