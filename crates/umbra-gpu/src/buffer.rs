//! Growable device buffers.

use crate::deferred::{DeferredDeletionQueue, Retired};
use crate::error::Result;
use crate::memory::{GpuAllocator, GpuBuffer};
use ash::vk;
use gpu_allocator::MemoryLocation;

const MIN_CAPACITY: u64 = 256;

/// Capacity to reallocate to when `required` bytes no longer fit in `current`.
///
/// Grows geometrically so repeated small appends reallocate rarely.
pub fn grown_capacity(current: u64, required: u64) -> u64 {
    if required <= current {
        return current;
    }
    required
        .max(current.saturating_mul(2))
        .max(MIN_CAPACITY)
        .checked_next_power_of_two()
        .unwrap_or(required)
}

/// A buffer whose capacity follows the size of the data written to it.
///
/// A superseded buffer is retired through the deletion queue since
/// in-flight frames may still read it by device address.
pub struct DynamicBuffer {
    buffer: GpuBuffer,
    len: u64,
    usage: vk::BufferUsageFlags,
    location: MemoryLocation,
    name: String,
}

impl DynamicBuffer {
    pub fn new(
        allocator: &mut GpuAllocator,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
        name: impl Into<String>,
    ) -> Result<Self> {
        let name = name.into();
        let usage = usage | vk::BufferUsageFlags::SHADER_DEVICE_ADDRESS;
        let buffer = allocator.create_buffer(MIN_CAPACITY, usage, location, &name)?;
        Ok(Self {
            buffer,
            len: 0,
            usage,
            location,
            name,
        })
    }

    /// Replace the contents with `data`, growing when needed.
    ///
    /// Returns `true` when the underlying buffer changed.
    pub fn upload<T: bytemuck::Pod>(
        &mut self,
        allocator: &mut GpuAllocator,
        deletion: &mut DeferredDeletionQueue,
        frame: u64,
        data: &[T],
    ) -> Result<bool> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let required = bytes.len() as u64;
        let reallocated = required > self.buffer.size;
        if reallocated {
            let capacity = grown_capacity(self.buffer.size, required);
            let replacement =
                allocator.create_buffer(capacity, self.usage, self.location, &self.name)?;
            let old = std::mem::replace(&mut self.buffer, replacement);
            deletion.retire(Retired::Buffer(old), frame);
            tracing::debug!(name = %self.name, capacity, "Grew dynamic buffer");
        }
        self.buffer.write_bytes(0, bytes)?;
        self.len = required;
        Ok(reallocated)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer.buffer
    }

    pub fn device_address(&self, device: &ash::Device) -> vk::DeviceAddress {
        self.buffer.device_address(device)
    }

    /// Bytes written by the last upload.
    pub const fn len(&self) -> u64 {
        self.len
    }

    pub const fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub const fn capacity(&self) -> u64 {
        self.buffer.size
    }

    /// Free the buffer immediately. The device must be idle.
    pub fn destroy(mut self, allocator: &mut GpuAllocator) -> Result<()> {
        allocator.free_buffer(&mut self.buffer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fits_without_growth() {
        assert_eq!(grown_capacity(1024, 1024), 1024);
        assert_eq!(grown_capacity(1024, 10), 1024);
    }

    #[test]
    fn grows_at_least_geometrically() {
        assert_eq!(grown_capacity(256, 257), 512);
        assert_eq!(grown_capacity(1024, 1500), 2048);
        assert_eq!(grown_capacity(1024, 5000), 8192);
        assert_eq!(grown_capacity(0, 1), MIN_CAPACITY);
    }

    #[test]
    fn growth_always_fits_request() {
        for current in [0_u64, 256, 777, 4096] {
            for required in [1_u64, 300, 4097, 1 << 20] {
                assert!(grown_capacity(current, required) >= required);
            }
        }
    }
}
