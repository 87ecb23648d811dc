//! Vulkan abstraction layer for Umbra.
//!
//! This crate provides:
//! - Vulkan instance and device management with sparse and mesh-shading checks
//! - Memory allocation via gpu-allocator, including raw memory blocks
//! - Sparse image creation and sparse binding submission
//! - Command submission with timeline semaphores
//! - Pipelines, descriptor caching and swapchain handling

pub mod buffer;
pub mod capabilities;
pub mod command;
pub mod context;
pub mod deferred;
pub mod descriptors;
pub mod error;
pub mod instance;
pub mod memory;
pub mod pipeline;
pub mod sparse;
pub mod surface;
pub mod swapchain;
pub mod sync;

pub use buffer::{grown_capacity, DynamicBuffer};
pub use capabilities::{GpuCapabilities, GpuVendor};
pub use command::{
    begin_command_buffer, end_command_buffer, execute_single_time_commands, pipeline_barrier,
    submit, CommandPool, ImageTransition, SemaphoreOp,
};
pub use context::{GpuContext, GpuContextBuilder};
pub use deferred::{DeferredDeletionQueue, Retired};
pub use descriptors::{
    write_descriptor_set, DescriptorCache, DescriptorKey, DescriptorPool, DescriptorResource,
    DescriptorSetLayoutBuilder, DescriptorSets,
};
pub use error::{GpuError, Result};
pub use memory::{create_image_view, GpuAllocator, GpuBuffer, GpuImage, MemoryBlock};
pub use pipeline::{Pipeline, PipelineDesc, RasterState};
pub use sparse::{bind_sparse, check_sparse_format, create_sparse_image, SparseImageUpdate, SparsePageBind};
pub use surface::SurfaceContext;
pub use swapchain::Swapchain;
pub use sync::{create_fence, create_semaphore, reset_fence, wait_for_fence, TimelineSemaphore};
