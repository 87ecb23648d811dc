//! Descriptor set management.
//!
//! Besides the layout builder and pool, this module provides a small
//! structural cache: a descriptor set is identified by the exact resources
//! bound to it, so passes ask for "the set holding these views" every frame
//! and only pay for allocation and writes when something actually changed.

use crate::error::Result;
use ash::vk;
use hashbrown::HashMap;
use std::hash::Hash;

/// Descriptor set layout builder.
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl<'a> DescriptorSetLayoutBuilder<'a> {
    /// Create a new builder.
    pub fn new() -> Self {
        Self {
            bindings: Vec::new(),
        }
    }

    /// Add a binding.
    pub fn binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(count)
                .stage_flags(stage_flags),
        );
        self
    }

    /// Add a storage buffer binding.
    pub fn storage_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_BUFFER, 1, stage_flags)
    }

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Add a storage image binding.
    pub fn storage_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::STORAGE_IMAGE, 1, stage_flags)
    }

    /// Add a sampled image binding.
    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.sampled_image_array(binding, 1, stage_flags)
    }

    /// Add an array of combined image samplers.
    pub fn sampled_image_array(
        self,
        binding: u32,
        count: u32,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            count,
            stage_flags,
        )
    }

    /// Build the descriptor set layout.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn build(self, device: &ash::Device) -> Result<vk::DescriptorSetLayout> {
        let layout_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(&self.bindings);

        let layout = device.create_descriptor_set_layout(&layout_info, None)?;
        Ok(layout)
    }
}

impl Default for DescriptorSetLayoutBuilder<'_> {
    fn default() -> Self {
        Self::new()
    }
}

/// Descriptor pool for allocating descriptor sets.
pub struct DescriptorPool {
    pool: vk::DescriptorPool,
}

impl DescriptorPool {
    /// Create a new descriptor pool whose sets can be freed individually.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<Self> {
        let create_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(max_sets)
            .pool_sizes(pool_sizes)
            .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);

        let pool = device.create_descriptor_pool(&create_info, None)?;
        Ok(Self { pool })
    }

    /// Get the raw pool handle.
    pub fn handle(&self) -> vk::DescriptorPool {
        self.pool
    }

    /// Allocate a single descriptor set.
    ///
    /// # Safety
    /// The device must be valid.
    pub unsafe fn allocate(
        &self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
    ) -> Result<vk::DescriptorSet> {
        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = device.allocate_descriptor_sets(&alloc_info)?;
        Ok(sets[0])
    }

    /// Return descriptor sets to the pool.
    ///
    /// # Safety
    /// The sets must not be referenced by pending command buffers.
    pub unsafe fn free(&self, device: &ash::Device, sets: &[vk::DescriptorSet]) -> Result<()> {
        if !sets.is_empty() {
            device.free_descriptor_sets(self.pool, sets)?;
        }
        Ok(())
    }

    /// Destroy the pool.
    ///
    /// # Safety
    /// The device must be valid and the pool must not be in use.
    pub unsafe fn destroy(&self, device: &ash::Device) {
        device.destroy_descriptor_pool(self.pool, None);
    }
}

/// A resource bound at one descriptor binding.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum DescriptorResource {
    UniformBuffer(vk::Buffer),
    StorageBuffer(vk::Buffer),
    /// Storage image, always accessed in `GENERAL` layout.
    StorageImage(vk::ImageView),
    SampledImage {
        view: vk::ImageView,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
    /// All elements share the sampler and layout.
    SampledImageArray {
        views: Vec<vk::ImageView>,
        sampler: vk::Sampler,
        layout: vk::ImageLayout,
    },
}

impl DescriptorResource {
    /// Descriptor type written for this resource.
    pub const fn descriptor_type(&self) -> vk::DescriptorType {
        match self {
            Self::UniformBuffer(_) => vk::DescriptorType::UNIFORM_BUFFER,
            Self::StorageBuffer(_) => vk::DescriptorType::STORAGE_BUFFER,
            Self::StorageImage(_) => vk::DescriptorType::STORAGE_IMAGE,
            Self::SampledImage { .. } | Self::SampledImageArray { .. } => {
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER
            }
        }
    }
}

/// Structural identity of a descriptor set: its layout plus every bound resource.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct DescriptorKey {
    pub layout: vk::DescriptorSetLayout,
    pub bindings: Vec<(u32, DescriptorResource)>,
}

impl DescriptorKey {
    pub fn new(layout: vk::DescriptorSetLayout) -> Self {
        Self {
            layout,
            bindings: Vec::new(),
        }
    }

    /// Append a binding.
    #[must_use]
    pub fn with(mut self, binding: u32, resource: DescriptorResource) -> Self {
        self.bindings.push((binding, resource));
        self
    }
}

/// Write every binding of `key` into `set`.
///
/// # Safety
/// The device, set and all referenced resources must be valid.
pub unsafe fn write_descriptor_set(
    device: &ash::Device,
    set: vk::DescriptorSet,
    key: &DescriptorKey,
) {
    // Infos are gathered first so the writes can borrow stable slices
    let mut buffer_infos = Vec::new();
    let mut image_infos = Vec::new();
    let mut ranges = Vec::with_capacity(key.bindings.len());

    for (_, resource) in &key.bindings {
        match resource {
            DescriptorResource::UniformBuffer(buffer) | DescriptorResource::StorageBuffer(buffer) => {
                ranges.push(buffer_infos.len()..buffer_infos.len() + 1);
                buffer_infos.push(
                    vk::DescriptorBufferInfo::default()
                        .buffer(*buffer)
                        .offset(0)
                        .range(vk::WHOLE_SIZE),
                );
            }
            DescriptorResource::StorageImage(view) => {
                ranges.push(image_infos.len()..image_infos.len() + 1);
                image_infos.push(
                    vk::DescriptorImageInfo::default()
                        .image_view(*view)
                        .image_layout(vk::ImageLayout::GENERAL),
                );
            }
            DescriptorResource::SampledImage {
                view,
                sampler,
                layout,
            } => {
                ranges.push(image_infos.len()..image_infos.len() + 1);
                image_infos.push(
                    vk::DescriptorImageInfo::default()
                        .image_view(*view)
                        .sampler(*sampler)
                        .image_layout(*layout),
                );
            }
            DescriptorResource::SampledImageArray {
                views,
                sampler,
                layout,
            } => {
                ranges.push(image_infos.len()..image_infos.len() + views.len());
                image_infos.extend(views.iter().map(|view| {
                    vk::DescriptorImageInfo::default()
                        .image_view(*view)
                        .sampler(*sampler)
                        .image_layout(*layout)
                }));
            }
        }
    }

    let writes: Vec<_> = key
        .bindings
        .iter()
        .zip(ranges)
        .map(|((binding, resource), range)| {
            let write = vk::WriteDescriptorSet::default()
                .dst_set(set)
                .dst_binding(*binding)
                .descriptor_type(resource.descriptor_type());
            match resource {
                DescriptorResource::UniformBuffer(_) | DescriptorResource::StorageBuffer(_) => {
                    write.buffer_info(&buffer_infos[range])
                }
                _ => write.image_info(&image_infos[range]),
            }
        })
        .collect();

    device.update_descriptor_sets(&writes, &[]);
}

struct CacheEntry<V> {
    value: V,
    last_used: u64,
}

/// Frame-aged cache keyed by structural identity.
///
/// Entries untouched for more than `ttl` frames are handed back by
/// [`evict`](Self::evict) so the caller can release them.
pub struct DescriptorCache<K, V> {
    entries: HashMap<K, CacheEntry<V>>,
    ttl: u64,
}

impl<K: Eq + Hash + Clone, V> DescriptorCache<K, V> {
    /// `ttl` must cover the frames in flight so evicted values are idle.
    pub fn new(ttl: u64) -> Self {
        Self {
            entries: HashMap::new(),
            ttl,
        }
    }

    /// Look up `key`, creating the value with `create` on a miss.
    pub fn get_or_insert_with<F>(&mut self, key: K, frame: u64, create: F) -> Result<&V>
    where
        F: FnOnce(&K) -> Result<V>,
    {
        let entry = match self.entries.entry(key) {
            hashbrown::hash_map::Entry::Occupied(entry) => entry.into_mut(),
            hashbrown::hash_map::Entry::Vacant(entry) => {
                let value = create(entry.key())?;
                entry.insert(CacheEntry {
                    value,
                    last_used: frame,
                })
            }
        };
        entry.last_used = frame;
        Ok(&entry.value)
    }

    /// Remove and return entries last used before `frame - ttl`.
    pub fn evict(&mut self, frame: u64) -> Vec<V> {
        let ttl = self.ttl;
        let stale: Vec<K> = self
            .entries
            .iter()
            .filter(|(_, entry)| entry.last_used.saturating_add(ttl) < frame)
            .map(|(key, _)| key.clone())
            .collect();
        stale
            .into_iter()
            .filter_map(|key| self.entries.remove(&key))
            .map(|entry| entry.value)
            .collect()
    }

    /// Remove every entry.
    pub fn drain(&mut self) -> Vec<V> {
        self.entries.drain().map(|(_, entry)| entry.value).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Descriptor sets allocated on demand and reused while their resources stay the same.
pub struct DescriptorSets {
    pool: DescriptorPool,
    cache: DescriptorCache<DescriptorKey, vk::DescriptorSet>,
}

impl DescriptorSets {
    /// # Safety
    /// The device must be valid.
    pub unsafe fn new(
        device: &ash::Device,
        max_sets: u32,
        pool_sizes: &[vk::DescriptorPoolSize],
        ttl: u64,
    ) -> Result<Self> {
        Ok(Self {
            pool: DescriptorPool::new(device, max_sets, pool_sizes)?,
            cache: DescriptorCache::new(ttl),
        })
    }

    /// Set holding exactly the resources of `key`, written on first use.
    ///
    /// # Safety
    /// The device and all resources in `key` must be valid.
    pub unsafe fn get(
        &mut self,
        device: &ash::Device,
        key: DescriptorKey,
        frame: u64,
    ) -> Result<vk::DescriptorSet> {
        let pool = &self.pool;
        self.cache
            .get_or_insert_with(key, frame, |key| {
                let set = pool.allocate(device, key.layout)?;
                write_descriptor_set(device, set, key);
                Ok(set)
            })
            .copied()
    }

    /// Free sets that went unused for longer than the TTL.
    ///
    /// # Safety
    /// The TTL must cover every frame still in flight.
    pub unsafe fn collect(&mut self, device: &ash::Device, frame: u64) -> Result<()> {
        let stale = self.cache.evict(frame);
        if !stale.is_empty() {
            tracing::trace!(count = stale.len(), "Freeing stale descriptor sets");
        }
        self.pool.free(device, &stale)
    }

    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    /// # Safety
    /// No set may still be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.cache.drain();
        self.pool.destroy(device);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn cache_hit_does_not_recreate() {
        let mut cache = DescriptorCache::new(2);
        let mut created = 0;
        for frame in 0..5 {
            cache
                .get_or_insert_with("set", frame, |_| {
                    created += 1;
                    Ok(7_u32)
                })
                .unwrap();
        }
        assert_eq!(created, 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn stale_entries_are_evicted_after_ttl() {
        let mut cache = DescriptorCache::new(2);
        cache.get_or_insert_with(1, 0, |_| Ok("a")).unwrap();
        cache.get_or_insert_with(2, 0, |_| Ok("b")).unwrap();
        cache.get_or_insert_with(2, 3, |_| Ok("unused")).unwrap();

        assert!(cache.evict(2).is_empty());
        assert_eq!(cache.evict(3), vec!["a"]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.drain(), vec!["b"]);
        assert!(cache.is_empty());
    }

    #[test]
    fn failed_creation_leaves_no_entry() {
        let mut cache: DescriptorCache<u32, u32> = DescriptorCache::new(1);
        let result = cache.get_or_insert_with(9, 0, |_| {
            Err(crate::GpuError::InvalidState("pool exhausted".into()))
        });
        assert!(result.is_err());
        assert!(cache.is_empty());
    }

    #[test]
    fn keys_differ_by_bound_view() {
        let layout = vk::DescriptorSetLayout::from_raw(1);
        let a = DescriptorKey::new(layout).with(0, DescriptorResource::StorageImage(vk::ImageView::from_raw(10)));
        let b = DescriptorKey::new(layout).with(0, DescriptorResource::StorageImage(vk::ImageView::from_raw(11)));
        assert_ne!(a, b);
        assert_eq!(a.clone(), a);
        assert_eq!(
            a.bindings[0].1.descriptor_type(),
            vk::DescriptorType::STORAGE_IMAGE
        );
    }
}
