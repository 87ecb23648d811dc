//! GPU capability detection.

use crate::error::GpuError;
use ash::vk;
use hashbrown::HashSet;
use std::ffi::CStr;

/// GPU vendor identification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Other(u32),
}

impl GpuVendor {
    /// Identify vendor from PCI vendor ID.
    pub const fn from_vendor_id(id: u32) -> Self {
        match id {
            0x10DE => Self::Nvidia,
            0x1002 => Self::Amd,
            0x8086 => Self::Intel,
            0x106B => Self::Apple,
            other => Self::Other(other),
        }
    }
}

/// Detected GPU capabilities.
#[derive(Debug, Clone)]
pub struct GpuCapabilities {
    /// GPU vendor
    pub vendor: GpuVendor,
    /// Device name
    pub device_name: String,
    /// Vulkan API version
    pub api_version: u32,

    /// Sparse binding of resources
    pub supports_sparse_binding: bool,
    /// Sparse residency of 2D single-sample images
    pub supports_sparse_residency_image_2d: bool,
    /// Residency queries from shaders (`sparseTexelsResidentARB`)
    pub supports_shader_resource_residency: bool,
    /// Depth clamping during rasterization
    pub supports_depth_clamp: bool,
    /// Timeline semaphores (VK 1.2 core)
    pub supports_timeline_semaphore: bool,
    /// 8-bit storage buffer access (VK 1.2 core)
    pub supports_storage_buffer_8bit: bool,
    /// `VK_EXT_mesh_shader` with mesh stage support
    pub supports_mesh_shader: bool,

    /// Device-local memory in MB
    pub device_local_memory_mb: u64,
    /// Mesh shader output limits
    pub max_mesh_output_vertices: u32,
    /// Mesh shader output limits
    pub max_mesh_output_primitives: u32,
    /// Largest mesh workgroup count along X
    pub max_mesh_work_group_count_x: u32,

    // Available extensions
    pub available_extensions: HashSet<String>,
}

impl GpuCapabilities {
    /// Query capabilities from a physical device.
    ///
    /// # Safety
    /// The instance and physical device must be valid.
    pub unsafe fn query(instance: &ash::Instance, physical_device: vk::PhysicalDevice) -> Self {
        let extensions = instance
            .enumerate_device_extension_properties(physical_device)
            .unwrap_or_default();

        let available_extensions: HashSet<String> = extensions
            .iter()
            .filter_map(|ext| {
                CStr::from_ptr(ext.extension_name.as_ptr())
                    .to_str()
                    .ok()
                    .map(String::from)
            })
            .collect();

        let has_mesh_extension = available_extensions
            .contains(ash::ext::mesh_shader::NAME.to_str().unwrap_or_default());

        // Chained feature query; the mesh shader struct is only linked in when the extension exists
        let mut mesh_features = vk::PhysicalDeviceMeshShaderFeaturesEXT::default();
        let mut vulkan_1_2_features = vk::PhysicalDeviceVulkan12Features::default();
        let mut features2 =
            vk::PhysicalDeviceFeatures2::default().push_next(&mut vulkan_1_2_features);
        if has_mesh_extension {
            features2 = features2.push_next(&mut mesh_features);
        }
        instance.get_physical_device_features2(physical_device, &mut features2);
        let features = features2.features;

        let mut mesh_properties = vk::PhysicalDeviceMeshShaderPropertiesEXT::default();
        let mut properties2 = vk::PhysicalDeviceProperties2::default();
        if has_mesh_extension {
            properties2 = properties2.push_next(&mut mesh_properties);
        }
        instance.get_physical_device_properties2(physical_device, &mut properties2);
        let properties = properties2.properties;

        let memory_properties = instance.get_physical_device_memory_properties(physical_device);
        let device_local_memory_mb: u64 = memory_properties
            .memory_heaps
            .iter()
            .take(memory_properties.memory_heap_count as usize)
            .filter(|heap| heap.flags.contains(vk::MemoryHeapFlags::DEVICE_LOCAL))
            .map(|heap| heap.size / (1024 * 1024))
            .sum();

        let device_name = CStr::from_ptr(properties.device_name.as_ptr())
            .to_string_lossy()
            .into_owned();

        Self {
            vendor: GpuVendor::from_vendor_id(properties.vendor_id),
            device_name,
            api_version: properties.api_version,

            supports_sparse_binding: features.sparse_binding == vk::TRUE,
            supports_sparse_residency_image_2d: features.sparse_residency_image2_d == vk::TRUE,
            supports_shader_resource_residency: features.shader_resource_residency == vk::TRUE,
            supports_depth_clamp: features.depth_clamp == vk::TRUE,
            supports_timeline_semaphore: vulkan_1_2_features.timeline_semaphore == vk::TRUE,
            supports_storage_buffer_8bit: vulkan_1_2_features.storage_buffer8_bit_access
                == vk::TRUE,
            supports_mesh_shader: has_mesh_extension && mesh_features.mesh_shader == vk::TRUE,

            device_local_memory_mb,
            max_mesh_output_vertices: mesh_properties.max_mesh_output_vertices,
            max_mesh_output_primitives: mesh_properties.max_mesh_output_primitives,
            max_mesh_work_group_count_x: mesh_properties.max_mesh_work_group_count[0],

            available_extensions,
        }
    }

    /// First missing requirement of the renderer, if any.
    pub fn check_requirements(&self) -> Result<(), GpuError> {
        let api_major = vk::api_version_major(self.api_version);
        let api_minor = vk::api_version_minor(self.api_version);
        if api_major < 1 || (api_major == 1 && api_minor < 3) {
            return Err(GpuError::FeatureNotSupported("Vulkan 1.3"));
        }

        let required = [
            (self.supports_sparse_binding, "sparseBinding"),
            (self.supports_sparse_residency_image_2d, "sparseResidencyImage2D"),
            (self.supports_shader_resource_residency, "shaderResourceResidency"),
            (self.supports_depth_clamp, "depthClamp"),
            (self.supports_timeline_semaphore, "timelineSemaphore"),
            (self.supports_storage_buffer_8bit, "storageBuffer8BitAccess"),
            (self.supports_mesh_shader, "VK_EXT_mesh_shader"),
        ];

        match required.iter().find(|(supported, _)| !supported) {
            Some(&(_, name)) => Err(GpuError::FeatureNotSupported(name)),
            None => Ok(()),
        }
    }

    /// Get a human-readable summary of capabilities.
    pub fn summary(&self) -> String {
        format!(
            "{} ({:?}) - Vulkan {}.{}.{} - {} MB VRAM",
            self.device_name,
            self.vendor,
            vk::api_version_major(self.api_version),
            vk::api_version_minor(self.api_version),
            vk::api_version_patch(self.api_version),
            self.device_local_memory_mb,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn capable() -> GpuCapabilities {
        GpuCapabilities {
            vendor: GpuVendor::Amd,
            device_name: "test".to_string(),
            api_version: vk::make_api_version(0, 1, 3, 250),
            supports_sparse_binding: true,
            supports_sparse_residency_image_2d: true,
            supports_shader_resource_residency: true,
            supports_depth_clamp: true,
            supports_timeline_semaphore: true,
            supports_storage_buffer_8bit: true,
            supports_mesh_shader: true,
            device_local_memory_mb: 8192,
            max_mesh_output_vertices: 256,
            max_mesh_output_primitives: 256,
            max_mesh_work_group_count_x: 65535,
            available_extensions: HashSet::new(),
        }
    }

    #[test]
    fn vendor_identification() {
        assert_eq!(GpuVendor::from_vendor_id(0x10DE), GpuVendor::Nvidia);
        assert_eq!(GpuVendor::from_vendor_id(0x1002), GpuVendor::Amd);
        assert_eq!(GpuVendor::from_vendor_id(0x8086), GpuVendor::Intel);
    }

    #[test]
    fn requirements_met() {
        assert!(capable().check_requirements().is_ok());
    }

    #[test]
    fn missing_sparse_residency_is_reported() {
        let caps = GpuCapabilities {
            supports_sparse_residency_image_2d: false,
            ..capable()
        };
        assert!(matches!(
            caps.check_requirements(),
            Err(GpuError::FeatureNotSupported("sparseResidencyImage2D"))
        ));
    }

    #[test]
    fn old_api_is_rejected() {
        let caps = GpuCapabilities {
            api_version: vk::make_api_version(0, 1, 2, 0),
            ..capable()
        };
        assert!(caps.check_requirements().is_err());
    }
}
