//! Per-frame context for rendering.

use ash::vk;
use umbra_gpu::SparseImageUpdate;

/// Context for the frame being recorded.
///
/// A frame is recorded into two command buffers. Work in `prepass_cmd`
/// runs first; `sparse_updates` are then bound on the sparse queue and
/// `command_buffer` runs after the binds complete.
pub struct FrameContext {
    /// Frame slot index, in `0..frames_in_flight`.
    pub slot: usize,
    /// Current frame number.
    pub frame_number: u64,
    /// Delta time since last frame in seconds.
    pub dt: f32,
    /// Index of the acquired swapchain image.
    pub image_index: u32,
    pub swapchain_image: vk::Image,
    pub swapchain_view: vk::ImageView,
    pub extent: vk::Extent2D,
    /// Recorded work submitted before the sparse binds.
    pub prepass_cmd: vk::CommandBuffer,
    /// Recorded work submitted after the sparse binds.
    pub command_buffer: vk::CommandBuffer,
    /// Sparse binds to apply between the two submissions.
    pub sparse_updates: Vec<SparseImageUpdate>,
}

impl FrameContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        slot: usize,
        frame_number: u64,
        dt: f32,
        image_index: u32,
        swapchain_image: vk::Image,
        swapchain_view: vk::ImageView,
        extent: vk::Extent2D,
        prepass_cmd: vk::CommandBuffer,
        command_buffer: vk::CommandBuffer,
    ) -> Self {
        Self {
            slot,
            frame_number,
            dt,
            image_index,
            swapchain_image,
            swapchain_view,
            extent,
            prepass_cmd,
            command_buffer,
            sparse_updates: Vec::new(),
        }
    }

    /// Whether the frame needs a sparse bind submission.
    pub fn has_sparse_updates(&self) -> bool {
        self.sparse_updates.iter().any(|update| !update.binds.is_empty())
    }
}
