//! Deferred release of GPU resources.
//!
//! A resource replaced while earlier frames may still read it is parked here
//! together with the frame it was retired on, and released once every frame
//! that could reference it has completed.

use crate::error::Result;
use crate::memory::{GpuAllocator, GpuBuffer, GpuImage};
use ash::vk;
use std::collections::VecDeque;

/// A resource that is no longer referenced by new work.
pub enum Retired {
    Buffer(GpuBuffer),
    /// Image plus the views created on it.
    Image {
        image: GpuImage,
        views: Vec<vk::ImageView>,
    },
}

struct Pending {
    resource: Retired,
    retired_on: u64,
}

/// FIFO of retired resources ordered by frame number.
pub struct DeferredDeletionQueue {
    pending: VecDeque<Pending>,
    frames_in_flight: u64,
}

impl DeferredDeletionQueue {
    pub fn new(frames_in_flight: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            frames_in_flight: frames_in_flight as u64,
        }
    }

    /// Park a resource retired during `frame`.
    pub fn retire(&mut self, resource: Retired, frame: u64) {
        self.pending.push_back(Pending {
            resource,
            retired_on: frame,
        });
    }

    /// Number of resources releasable at `frame`.
    fn releasable(&self, frame: u64) -> usize {
        let cutoff = frame.saturating_sub(self.frames_in_flight);
        self.pending
            .iter()
            .take_while(|p| p.retired_on < cutoff)
            .count()
    }

    /// Release everything retired more than `frames_in_flight` frames ago.
    ///
    /// Call once per frame after the slot fence has been waited on.
    pub fn process(
        &mut self,
        device: &ash::Device,
        allocator: &mut GpuAllocator,
        frame: u64,
    ) -> Result<()> {
        let count = self.releasable(frame);
        if count > 0 {
            let remaining = self.pending_count() - count;
            tracing::trace!(count, remaining, "Releasing retired resources");
        }
        for pending in self.pending.drain(..count) {
            release(device, allocator, pending.resource)?;
        }
        Ok(())
    }

    /// Release everything immediately. The device must be idle.
    pub fn flush(&mut self, device: &ash::Device, allocator: &mut GpuAllocator) -> Result<()> {
        for pending in self.pending.drain(..) {
            release(device, allocator, pending.resource)?;
        }
        Ok(())
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }
}

fn release(device: &ash::Device, allocator: &mut GpuAllocator, resource: Retired) -> Result<()> {
    match resource {
        Retired::Buffer(mut buffer) => allocator.free_buffer(&mut buffer),
        Retired::Image { mut image, views } => {
            for view in views {
                unsafe { device.destroy_image_view(view, None) };
            }
            allocator.free_image(&mut image)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn buffer(raw: u64) -> Retired {
        Retired::Buffer(GpuBuffer {
            buffer: vk::Buffer::from_raw(raw),
            allocation: None,
            size: 0,
        })
    }

    #[test]
    fn resources_wait_out_frames_in_flight() {
        let mut queue = DeferredDeletionQueue::new(2);
        queue.retire(buffer(1), 10);
        queue.retire(buffer(2), 11);

        assert_eq!(queue.releasable(10), 0);
        assert_eq!(queue.releasable(12), 0);
        assert_eq!(queue.releasable(13), 1);
        assert_eq!(queue.releasable(20), 2);
        assert_eq!(queue.pending_count(), 2);
    }
}
