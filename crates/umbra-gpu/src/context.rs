//! GPU context management.

use crate::capabilities::GpuCapabilities;
use crate::error::{GpuError, Result};
use crate::instance::{create_instance, select_physical_device};
use crate::memory::GpuAllocator;
use ash::vk;
use parking_lot::Mutex;
use std::ffi::CStr;
use std::sync::Arc;

/// Main GPU context holding Vulkan resources.
pub struct GpuContext {
    // Entry must be kept alive for the lifetime of the context
    #[allow(dead_code)]
    pub(crate) entry: ash::Entry,
    pub(crate) instance: ash::Instance,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) device: Arc<ash::Device>,
    pub(crate) capabilities: GpuCapabilities,
    pub(crate) allocator: Mutex<GpuAllocator>,
    pub(crate) mesh_shader: ash::ext::mesh_shader::Device,

    // Queue families and queues
    pub(crate) queue_families: QueueFamilyIndices,
    pub(crate) graphics_queue: vk::Queue,
    pub(crate) compute_queue: vk::Queue,
    pub(crate) transfer_queue: vk::Queue,
    pub(crate) sparse_queue: vk::Queue,
}

impl GpuContext {
    /// Get the Vulkan device handle.
    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    /// Get the physical device handle.
    pub const fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    /// Get GPU capabilities.
    pub const fn capabilities(&self) -> &GpuCapabilities {
        &self.capabilities
    }

    /// Get the Vulkan instance handle.
    pub const fn instance(&self) -> &ash::Instance {
        &self.instance
    }

    /// Get access to the GPU allocator.
    pub const fn allocator(&self) -> &Mutex<GpuAllocator> {
        &self.allocator
    }

    /// `VK_EXT_mesh_shader` device functions.
    pub const fn mesh_shader(&self) -> &ash::ext::mesh_shader::Device {
        &self.mesh_shader
    }

    /// Get the graphics queue.
    pub const fn graphics_queue(&self) -> vk::Queue {
        self.graphics_queue
    }

    /// Get the compute queue.
    pub const fn compute_queue(&self) -> vk::Queue {
        self.compute_queue
    }

    /// Get the transfer queue.
    pub const fn transfer_queue(&self) -> vk::Queue {
        self.transfer_queue
    }

    /// Queue used for sparse binding operations.
    ///
    /// This is the compute queue when its family supports sparse binding,
    /// otherwise the graphics queue.
    pub const fn sparse_queue(&self) -> vk::Queue {
        self.sparse_queue
    }

    /// Get the graphics queue family index.
    pub const fn graphics_queue_family(&self) -> u32 {
        self.queue_families.graphics
    }

    /// Get the compute queue family index.
    pub const fn compute_queue_family(&self) -> u32 {
        self.queue_families.compute
    }

    /// Get the transfer queue family index.
    pub const fn transfer_queue_family(&self) -> u32 {
        self.queue_families.transfer
    }

    /// Get the sparse-binding queue family index.
    pub const fn sparse_queue_family(&self) -> u32 {
        self.queue_families.sparse
    }

    /// Wait for device to be idle.
    #[cfg_attr(
        feature = "profiling-tracy",
        tracing::instrument(level = "trace", skip_all)
    )]
    pub fn wait_idle(&self) -> Result<()> {
        unsafe {
            self.device.device_wait_idle()?;
        }
        Ok(())
    }
}

impl Drop for GpuContext {
    fn drop(&mut self) {
        unsafe {
            let _ = self.device.device_wait_idle();

            // Shutdown allocator BEFORE destroying device
            // This frees all VkDeviceMemory allocations
            self.allocator.lock().shutdown();

            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }
    }
}

/// Builder for creating a GPU context.
pub struct GpuContextBuilder {
    app_name: String,
    enable_validation: bool,
}

impl Default for GpuContextBuilder {
    fn default() -> Self {
        Self {
            app_name: "Umbra".to_string(),
            enable_validation: cfg!(debug_assertions),
        }
    }
}

impl GpuContextBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the application name.
    #[must_use]
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = name.into();
        self
    }

    /// Enable or disable validation layers.
    #[must_use]
    pub const fn validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }

    /// Build the GPU context.
    ///
    /// Fails when no device offers sparse residency, mesh shading and a
    /// sparse-binding queue.
    pub fn build(self) -> Result<GpuContext> {
        let entry = unsafe { ash::Entry::load() }.map_err(|e| GpuError::Loading(e.to_string()))?;

        let instance = unsafe { create_instance(&entry, &self.app_name, self.enable_validation) }?;

        let (physical_device, capabilities) = unsafe { select_physical_device(&instance) }?;

        tracing::info!("Selected GPU: {}", capabilities.summary());

        let queue_families = unsafe { find_queue_families(&instance, physical_device) }?;
        tracing::debug!(
            graphics = queue_families.graphics,
            compute = queue_families.compute,
            transfer = queue_families.transfer,
            sparse = queue_families.sparse,
            "Queue families selected"
        );

        let (device, queues) =
            unsafe { create_device(&instance, physical_device, &queue_families)? };

        let device = Arc::new(device);
        let mesh_shader = ash::ext::mesh_shader::Device::new(&instance, &device);

        let allocator = unsafe { GpuAllocator::new(&instance, device.clone(), physical_device) }?;

        Ok(GpuContext {
            entry,
            instance,
            physical_device,
            device,
            capabilities,
            allocator: Mutex::new(allocator),
            mesh_shader,
            queue_families,
            graphics_queue: queues[0],
            compute_queue: queues[1],
            transfer_queue: queues[2],
            sparse_queue: queues[3],
        })
    }
}

/// Queue family indices.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct QueueFamilyIndices {
    graphics: u32,
    compute: u32,
    transfer: u32,
    sparse: u32,
}

/// Find queue families for graphics, compute, transfer and sparse binding.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn find_queue_families(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
) -> Result<QueueFamilyIndices> {
    let families: Vec<vk::QueueFlags> = instance
        .get_physical_device_queue_family_properties(physical_device)
        .iter()
        .map(|family| family.queue_flags)
        .collect();
    pick_queue_families(&families)
}

/// Queue family selection over the raw family flags.
pub(crate) fn pick_queue_families(families: &[vk::QueueFlags]) -> Result<QueueFamilyIndices> {
    let find = |pred: &dyn Fn(vk::QueueFlags) -> bool| {
        families
            .iter()
            .position(|&flags| pred(flags))
            .map(|i| i as u32)
    };

    // Graphics queue is required
    let graphics =
        find(&|f| f.contains(vk::QueueFlags::GRAPHICS)).ok_or(GpuError::NoSuitableDevice)?;

    // Prefer a dedicated compute queue (no graphics)
    let compute = find(&|f| {
        f.contains(vk::QueueFlags::COMPUTE) && !f.contains(vk::QueueFlags::GRAPHICS)
    })
    .unwrap_or(graphics);

    // Prefer a dedicated transfer queue (no graphics or compute)
    let transfer = find(&|f| {
        f.contains(vk::QueueFlags::TRANSFER)
            && !f.intersects(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE)
    })
    .unwrap_or(compute);

    // Sparse binding runs on the compute family when it can, graphics otherwise
    let sparse = [compute, graphics]
        .into_iter()
        .find(|&i| families[i as usize].contains(vk::QueueFlags::SPARSE_BINDING))
        .ok_or(GpuError::SparseQueueUnavailable)?;

    Ok(QueueFamilyIndices {
        graphics,
        compute,
        transfer,
        sparse,
    })
}

/// Required device extensions.
fn required_device_extensions() -> Vec<&'static CStr> {
    vec![ash::khr::swapchain::NAME, ash::ext::mesh_shader::NAME]
}

/// Create the logical device and retrieve the graphics, compute, transfer
/// and sparse queues, in that order.
///
/// # Safety
/// The instance and physical device must be valid.
unsafe fn create_device(
    instance: &ash::Instance,
    physical_device: vk::PhysicalDevice,
    queue_families: &QueueFamilyIndices,
) -> Result<(ash::Device, [vk::Queue; 4])> {
    let mut unique_families = vec![
        queue_families.graphics,
        queue_families.compute,
        queue_families.transfer,
        queue_families.sparse,
    ];
    unique_families.sort_unstable();
    unique_families.dedup();

    let queue_priority = 1.0_f32;
    let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
        .iter()
        .map(|&family| {
            vk::DeviceQueueCreateInfo::default()
                .queue_family_index(family)
                .queue_priorities(std::slice::from_ref(&queue_priority))
        })
        .collect();

    let extension_names: Vec<*const i8> = required_device_extensions()
        .iter()
        .map(|ext| ext.as_ptr())
        .collect();

    let mut mesh_shader_features = vk::PhysicalDeviceMeshShaderFeaturesEXT::default()
        .mesh_shader(true)
        .task_shader(false);

    let mut vulkan_1_3_features = vk::PhysicalDeviceVulkan13Features::default()
        .dynamic_rendering(true)
        .synchronization2(true)
        .maintenance4(true);

    let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default()
        .buffer_device_address(true)
        .descriptor_indexing(true)
        .scalar_block_layout(true)
        .timeline_semaphore(true)
        .storage_buffer8_bit_access(true)
        .shader_int8(true)
        .runtime_descriptor_array(true)
        .shader_sampled_image_array_non_uniform_indexing(true);

    let features = vk::PhysicalDeviceFeatures::default()
        .shader_int64(true)
        .depth_clamp(true)
        .sparse_binding(true)
        .sparse_residency_image2_d(true)
        .shader_resource_residency(true);

    let mut features2 = vk::PhysicalDeviceFeatures2::default()
        .features(features)
        .push_next(&mut vulkan_1_3_features)
        .push_next(&mut vulkan_1_2_features)
        .push_next(&mut mesh_shader_features);

    let device_create_info = vk::DeviceCreateInfo::default()
        .queue_create_infos(&queue_create_infos)
        .enabled_extension_names(&extension_names)
        .push_next(&mut features2);

    let device = instance
        .create_device(physical_device, &device_create_info, None)
        .map_err(GpuError::from)?;

    let queues = [
        queue_families.graphics,
        queue_families.compute,
        queue_families.transfer,
        queue_families.sparse,
    ]
    .map(|family| device.get_device_queue(family, 0));

    Ok((device, queues))
}

#[cfg(test)]
mod tests {
    use super::*;

    const GFX: vk::QueueFlags = vk::QueueFlags::from_raw(
        vk::QueueFlags::GRAPHICS.as_raw()
            | vk::QueueFlags::COMPUTE.as_raw()
            | vk::QueueFlags::TRANSFER.as_raw(),
    );

    #[test]
    fn sparse_prefers_compute_family() {
        let families = [
            GFX | vk::QueueFlags::SPARSE_BINDING,
            vk::QueueFlags::COMPUTE | vk::QueueFlags::TRANSFER | vk::QueueFlags::SPARSE_BINDING,
            vk::QueueFlags::TRANSFER,
        ];
        let picked = pick_queue_families(&families).unwrap();
        assert_eq!(picked.graphics, 0);
        assert_eq!(picked.compute, 1);
        assert_eq!(picked.transfer, 2);
        assert_eq!(picked.sparse, 1);
    }

    #[test]
    fn sparse_falls_back_to_graphics() {
        let families = [
            GFX | vk::QueueFlags::SPARSE_BINDING,
            vk::QueueFlags::COMPUTE,
        ];
        let picked = pick_queue_families(&families).unwrap();
        assert_eq!(picked.compute, 1);
        assert_eq!(picked.transfer, 1);
        assert_eq!(picked.sparse, 0);
    }

    #[test]
    fn missing_sparse_queue_is_fatal() {
        let families = [GFX, vk::QueueFlags::COMPUTE];
        assert!(matches!(
            pick_queue_families(&families),
            Err(GpuError::SparseQueueUnavailable)
        ));
    }
}
