//! GPU view structs and the per-slot view buffer.
//!
//! Every pass reads its matrices from one array of [`GpuView`]s addressed by
//! buffer device address: the main camera at `MAIN_VIEW` and clipmap level
//! `ℓ` at `SHADOW_VIEW_START + ℓ`.

use crate::camera::Camera;
use ash::vk;
use glam::{Mat4, Vec3};
use gpu_allocator::MemoryLocation;
use umbra_core::constants::vsm::VIEW_COUNT;
use umbra_core::math::Frustum;
use umbra_gpu::{GpuAllocator, GpuBuffer, Result};

/// One view as laid out in GPU memory.
#[repr(C)]
#[derive(Clone, Copy, Debug, bytemuck::Pod, bytemuck::Zeroable)]
pub struct GpuView {
    pub proj: [[f32; 4]; 4],
    pub inv_proj: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
    pub inv_view: [[f32; 4]; 4],
    pub proj_view: [[f32; 4]; 4],
    pub inv_proj_view: [[f32; 4]; 4],
    pub eye: [f32; 4],
    pub planes: [[f32; 4]; 6],
    /// Width, height and their reciprocals.
    pub resolution: [f32; 4],
}

impl GpuView {
    pub fn new(proj: Mat4, view: Mat4, eye: Vec3, resolution: [u32; 2]) -> Self {
        let proj_view = proj * view;
        let [width, height] = resolution.map(|r| r.max(1) as f32);
        Self {
            proj: proj.to_cols_array_2d(),
            inv_proj: proj.inverse().to_cols_array_2d(),
            view: view.to_cols_array_2d(),
            inv_view: view.inverse().to_cols_array_2d(),
            proj_view: proj_view.to_cols_array_2d(),
            inv_proj_view: proj_view.inverse().to_cols_array_2d(),
            eye: eye.extend(1.0).to_array(),
            planes: Frustum::from_view_projection(proj_view).to_arrays(),
            resolution: [width, height, 1.0 / width, 1.0 / height],
        }
    }

    /// Main view of `camera` rendered at `resolution`.
    pub fn from_camera(camera: &Camera, resolution: [u32; 2]) -> Self {
        Self::new(
            camera.projection_matrix(),
            camera.view_matrix(),
            camera.position,
            resolution,
        )
    }
}

/// Host-visible view arrays, one per frame slot.
pub struct ViewBuffers {
    buffers: Vec<GpuBuffer>,
}

impl ViewBuffers {
    pub fn new(allocator: &mut GpuAllocator, frames_in_flight: usize) -> Result<Self> {
        let size = u64::from(VIEW_COUNT) * std::mem::size_of::<GpuView>() as u64;
        let buffers = (0..frames_in_flight)
            .map(|slot| {
                allocator.create_buffer(
                    size,
                    vk::BufferUsageFlags::STORAGE_BUFFER
                        | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS,
                    MemoryLocation::CpuToGpu,
                    &format!("views_{slot}"),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { buffers })
    }

    /// Write `views` starting at index 0 of the slot's array.
    pub fn write(&self, slot: usize, views: &[GpuView]) -> Result<()> {
        debug_assert!(views.len() <= VIEW_COUNT as usize);
        self.buffers[slot].write(views)
    }

    pub fn device_address(&self, device: &ash::Device, slot: usize) -> vk::DeviceAddress {
        self.buffers[slot].device_address(device)
    }

    pub fn destroy(mut self, allocator: &mut GpuAllocator) -> Result<()> {
        for buffer in &mut self.buffers {
            allocator.free_buffer(buffer)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn gpu_view_is_512_bytes() {
        assert_eq!(std::mem::size_of::<GpuView>(), 512);
    }

    #[test]
    fn inverse_round_trips_a_point() {
        let camera = Camera::default();
        let view = GpuView::from_camera(&camera, [1280, 720]);
        let pv = Mat4::from_cols_array_2d(&view.proj_view);
        let inv = Mat4::from_cols_array_2d(&view.inv_proj_view);
        let world = Vec3::new(1.0, 2.0, -3.0);
        let back = inv.project_point3(pv.project_point3(world));
        assert_relative_eq!(back.x, world.x, epsilon = 1e-3);
        assert_relative_eq!(back.y, world.y, epsilon = 1e-3);
        assert_relative_eq!(back.z, world.z, epsilon = 1e-3);
        assert_relative_eq!(view.resolution[2], 1.0 / 1280.0);
    }
}
