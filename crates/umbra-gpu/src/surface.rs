//! Window surface creation.

use crate::context::GpuContext;
use crate::error::{GpuError, Result};
use crate::swapchain::{calculate_extent, select_present_mode, select_surface_format, Swapchain};
use ash::vk;
use raw_window_handle::{HasDisplayHandle, HasWindowHandle};

/// A window surface and the loaders needed to present to it.
pub struct SurfaceContext {
    pub surface: vk::SurfaceKHR,
    pub surface_loader: ash::khr::surface::Instance,
    pub swapchain_loader: ash::khr::swapchain::Device,
}

impl SurfaceContext {
    /// Create a surface for `window`.
    ///
    /// # Safety
    /// The GPU context must be valid and outlive the surface.
    pub unsafe fn from_window<W>(gpu: &GpuContext, window: &W) -> Result<Self>
    where
        W: HasDisplayHandle + HasWindowHandle,
    {
        let display = window
            .display_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("display handle: {e}")))?;
        let window_handle = window
            .window_handle()
            .map_err(|e| GpuError::SurfaceCreation(format!("window handle: {e}")))?;

        let surface = ash_window::create_surface(
            &gpu.entry,
            gpu.instance(),
            display.as_raw(),
            window_handle.as_raw(),
            None,
        )
        .map_err(|e| GpuError::SurfaceCreation(e.to_string()))?;

        let surface_loader = ash::khr::surface::Instance::new(&gpu.entry, gpu.instance());
        let swapchain_loader = ash::khr::swapchain::Device::new(gpu.instance(), gpu.device());

        // Presentation happens on the graphics queue
        let supported = surface_loader.get_physical_device_surface_support(
            gpu.physical_device(),
            gpu.graphics_queue_family(),
            surface,
        )?;
        if !supported {
            surface_loader.destroy_surface(surface, None);
            return Err(GpuError::SurfaceCreation(
                "graphics queue family cannot present to this surface".to_string(),
            ));
        }

        Ok(Self {
            surface,
            surface_loader,
            swapchain_loader,
        })
    }

    /// Create a swapchain, retiring `old` if given.
    ///
    /// # Safety
    /// `old` must not be in use; it is destroyed after the new swapchain exists.
    pub unsafe fn create_swapchain(
        &self,
        gpu: &GpuContext,
        width: u32,
        height: u32,
        vsync: bool,
        old: Option<Swapchain>,
    ) -> Result<Swapchain> {
        let pd = gpu.physical_device();
        let capabilities = self
            .surface_loader
            .get_physical_device_surface_capabilities(pd, self.surface)?;
        let formats = self
            .surface_loader
            .get_physical_device_surface_formats(pd, self.surface)?;
        let present_modes = self
            .surface_loader
            .get_physical_device_surface_present_modes(pd, self.surface)?;

        let surface_format = select_surface_format(&formats).ok_or_else(|| {
            GpuError::SwapchainCreation("surface reports no formats".to_string())
        })?;
        let present_mode = select_present_mode(&present_modes, vsync);
        let extent = calculate_extent(&capabilities, width, height);

        let old_handle = old.as_ref().map(|s| s.swapchain);
        let swapchain = Swapchain::new(
            gpu.device(),
            &self.swapchain_loader,
            self.surface,
            &capabilities,
            surface_format,
            present_mode,
            extent,
            old_handle,
        );
        if let Some(old) = old {
            old.destroy(gpu.device(), &self.swapchain_loader);
        }
        swapchain
    }

    /// Destroy the surface.
    ///
    /// # Safety
    /// Every swapchain created on it must already be destroyed.
    pub unsafe fn destroy(&self) {
        self.surface_loader.destroy_surface(self.surface, None);
    }
}
