//! Descriptor set layouts, growable pool sets and descriptor writes.

use crate::error::{GpuError, Result};
use ash::vk;

/// Descriptor set layout builder.
pub struct DescriptorSetLayoutBuilder<'a> {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'a>>,
}

impl<'a> DescriptorSetLayoutBuilder<'a> {
    pub const fn new() -> Self {
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

    /// Add a uniform buffer binding.
    pub fn uniform_buffer(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(binding, vk::DescriptorType::UNIFORM_BUFFER, 1, stage_flags)
    }

    /// Add a combined image sampler binding.
    pub fn sampled_image(self, binding: u32, stage_flags: vk::ShaderStageFlags) -> Self {
        self.binding(
            binding,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            1,
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

/// Default number of sets per descriptor pool.
pub const DEFAULT_POOL_CHUNK: u32 = 1024;

/// A descriptor set together with the pool that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorSetHandle {
    pub pool_set: u32,
    pub pool_index: usize,
    pub set: vk::DescriptorSet,
}

#[derive(Debug)]
struct PoolSlot<P> {
    pool: P,
    capacity: u32,
    used: u32,
}

/// A growable list of descriptor pools of one descriptor type.
///
/// Pools are only ever added. Allocation fills existing pools first and
/// opens a new one of `max(chunk, remaining)` sets when they are full. The
/// pool type is generic so the bookkeeping can be exercised without a device.
#[derive(Debug)]
pub struct DescriptorPoolSet<P = vk::DescriptorPool> {
    id: u32,
    descriptor_type: vk::DescriptorType,
    descriptors_per_set: u32,
    chunk: u32,
    pools: Vec<PoolSlot<P>>,
}

impl<P> DescriptorPoolSet<P> {
    pub const fn new(id: u32, descriptor_type: vk::DescriptorType, chunk: u32) -> Self {
        Self {
            id,
            descriptor_type,
            descriptors_per_set: 1,
            chunk,
            pools: Vec::new(),
        }
    }

    /// Size pools for layouts with more than one binding of the pool's type.
    #[must_use]
    pub const fn with_descriptors_per_set(mut self, count: u32) -> Self {
        self.descriptors_per_set = count;
        self
    }

    pub const fn id(&self) -> u32 {
        self.id
    }

    pub fn pool_count(&self) -> usize {
        self.pools.len()
    }

    /// Sets currently handed out from pool `index`.
    pub fn used(&self, index: usize) -> Option<u32> {
        self.pools.get(index).map(|p| p.used)
    }

    /// Reserve `count` sets and return `(pool index, sets to take)` pairs.
    ///
    /// `create` is called with the capacity of every new pool.
    pub fn reserve(
        &mut self,
        count: u32,
        mut create: impl FnMut(u32) -> Result<P>,
    ) -> Result<Vec<(usize, u32)>> {
        let mut plan = Vec::new();
        let mut remaining = count;

        for (index, slot) in self.pools.iter_mut().enumerate() {
            if remaining == 0 {
                break;
            }
            let free = slot.capacity - slot.used;
            if free == 0 {
                continue;
            }
            let take = free.min(remaining);
            slot.used += take;
            remaining -= take;
            plan.push((index, take));
        }

        if remaining > 0 {
            let capacity = self.chunk.max(remaining);
            let pool = create(capacity)?;
            self.pools.push(PoolSlot {
                pool,
                capacity,
                used: remaining,
            });
            plan.push((self.pools.len() - 1, remaining));
        }

        Ok(plan)
    }

    /// Undo a reservation of `count` sets from pool `index`.
    pub fn unreserve(&mut self, index: usize, count: u32) {
        if let Some(slot) = self.pools.get_mut(index) {
            slot.used = slot.used.saturating_sub(count);
        }
    }

    pub fn pool(&self, index: usize) -> Option<&P> {
        self.pools.get(index).map(|p| &p.pool)
    }

    /// Give one set back to its pool's count.
    pub fn release_slot(&mut self, handle: &DescriptorSetHandle) -> Result<&P> {
        if handle.pool_set != self.id {
            return Err(GpuError::InvalidState(format!(
                "descriptor set of pool set {} released into pool set {}",
                handle.pool_set, self.id
            )));
        }
        let slot = self.pools.get_mut(handle.pool_index).ok_or_else(|| {
            GpuError::ResourceNotFound(format!("descriptor pool {}", handle.pool_index))
        })?;
        slot.used = slot.used.saturating_sub(1);
        Ok(&slot.pool)
    }

    /// Remove every pool, passing each to `destroy`.
    pub fn drain(&mut self, mut destroy: impl FnMut(P)) {
        for slot in self.pools.drain(..) {
            destroy(slot.pool);
        }
    }
}

impl DescriptorPoolSet<vk::DescriptorPool> {
    /// Allocate `count` sets of `layout`, growing the pool list when needed.
    ///
    /// # Safety
    /// The device and layout must be valid.
    pub unsafe fn allocate(
        &mut self,
        device: &ash::Device,
        layout: vk::DescriptorSetLayout,
        count: u32,
    ) -> Result<Vec<DescriptorSetHandle>> {
        let descriptor_type = self.descriptor_type;
        let per_set = self.descriptors_per_set;
        let plan = self.reserve(count, |capacity| {
            let sizes = [vk::DescriptorPoolSize {
                ty: descriptor_type,
                descriptor_count: capacity * per_set,
            }];
            let create_info = vk::DescriptorPoolCreateInfo::default()
                .max_sets(capacity)
                .pool_sizes(&sizes)
                .flags(vk::DescriptorPoolCreateFlags::FREE_DESCRIPTOR_SET);
            Ok(device.create_descriptor_pool(&create_info, None)?)
        })?;

        let mut handles = Vec::with_capacity(count as usize);
        for (position, &(index, take)) in plan.iter().enumerate() {
            let layouts = vec![layout; take as usize];
            let pool = self.pools[index].pool;
            let alloc_info = vk::DescriptorSetAllocateInfo::default()
                .descriptor_pool(pool)
                .set_layouts(&layouts);
            match device.allocate_descriptor_sets(&alloc_info) {
                Ok(sets) => handles.extend(sets.into_iter().map(|set| DescriptorSetHandle {
                    pool_set: self.id,
                    pool_index: index,
                    set,
                })),
                Err(err) => {
                    for &(index, take) in &plan[position..] {
                        self.unreserve(index, take);
                    }
                    for handle in &handles {
                        self.free(device, handle);
                    }
                    return Err(err.into());
                }
            }
        }
        Ok(handles)
    }

    /// Free a set back into its pool.
    ///
    /// # Safety
    /// The set must not be in use by the GPU.
    pub unsafe fn free(&mut self, device: &ash::Device, handle: &DescriptorSetHandle) {
        match self.release_slot(handle) {
            Ok(&pool) => {
                if let Err(err) = device.free_descriptor_sets(pool, &[handle.set]) {
                    tracing::warn!("freeing descriptor set failed: {err}");
                }
            }
            Err(err) => tracing::warn!("{err}"),
        }
    }

    /// Destroy every pool.
    ///
    /// # Safety
    /// No set from these pools may be in use.
    pub unsafe fn destroy(&mut self, device: &ash::Device) {
        self.drain(|pool| device.destroy_descriptor_pool(pool, None));
    }
}

/// Write a uniform buffer descriptor.
///
/// # Safety
/// Device and buffer must be valid.
pub unsafe fn write_uniform_buffer(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    buffer: vk::Buffer,
    offset: u64,
    range: u64,
) {
    let buffer_info = vk::DescriptorBufferInfo::default()
        .buffer(buffer)
        .offset(offset)
        .range(range);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
        .buffer_info(std::slice::from_ref(&buffer_info));

    device.update_descriptor_sets(&[write], &[]);
}

/// Write a combined image sampler descriptor.
///
/// # Safety
/// Device, view and sampler must be valid.
pub unsafe fn write_combined_image_sampler(
    device: &ash::Device,
    dst_set: vk::DescriptorSet,
    binding: u32,
    image_view: vk::ImageView,
    sampler: vk::Sampler,
) {
    let image_info = vk::DescriptorImageInfo::default()
        .image_view(image_view)
        .sampler(sampler)
        .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);

    let write = vk::WriteDescriptorSet::default()
        .dst_set(dst_set)
        .dst_binding(binding)
        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
        .image_info(std::slice::from_ref(&image_info));

    device.update_descriptor_sets(&[write], &[]);
}

#[cfg(test)]
mod tests {
    use super::*;

    fn counting_create(created: &mut Vec<u32>) -> impl FnMut(u32) -> Result<u32> + '_ {
        move |capacity| {
            created.push(capacity);
            Ok(capacity)
        }
    }

    #[test]
    fn first_allocation_opens_a_chunk_sized_pool() {
        let mut pools = DescriptorPoolSet::<u32>::new(0, vk::DescriptorType::UNIFORM_BUFFER, 8);
        let mut created = Vec::new();
        let plan = pools.reserve(3, counting_create(&mut created)).unwrap();
        assert_eq!(plan, vec![(0, 3)]);
        assert_eq!(created, vec![8]);
        assert_eq!(pools.used(0), Some(3));
    }

    #[test]
    fn requests_spill_over_into_new_pools() {
        let mut pools = DescriptorPoolSet::<u32>::new(0, vk::DescriptorType::UNIFORM_BUFFER, 8);
        let mut created = Vec::new();
        pools.reserve(6, counting_create(&mut created)).unwrap();
        let plan = pools.reserve(5, counting_create(&mut created)).unwrap();
        assert_eq!(plan, vec![(0, 2), (1, 3)]);
        assert_eq!(pools.pool_count(), 2);
        assert_eq!(pools.used(0), Some(8));
    }

    #[test]
    fn large_requests_get_a_larger_pool() {
        let mut pools = DescriptorPoolSet::<u32>::new(0, vk::DescriptorType::UNIFORM_BUFFER, 8);
        let mut created = Vec::new();
        let plan = pools.reserve(20, counting_create(&mut created)).unwrap();
        assert_eq!(plan, vec![(0, 20)]);
        assert_eq!(created, vec![20]);
    }

    #[test]
    fn release_decrements_only_the_owning_pool() {
        let mut pools = DescriptorPoolSet::<u32>::new(4, vk::DescriptorType::UNIFORM_BUFFER, 2);
        let mut created = Vec::new();
        pools.reserve(2, counting_create(&mut created)).unwrap();
        pools.reserve(2, counting_create(&mut created)).unwrap();
        let handle = DescriptorSetHandle {
            pool_set: 4,
            pool_index: 1,
            set: vk::DescriptorSet::null(),
        };
        pools.release_slot(&handle).unwrap();
        assert_eq!(pools.used(0), Some(2));
        assert_eq!(pools.used(1), Some(1));

        // The freed slot is reused before any new pool is opened.
        let plan = pools.reserve(1, counting_create(&mut created)).unwrap();
        assert_eq!(plan, vec![(1, 1)]);
        assert_eq!(created.len(), 2);
    }

    #[test]
    fn release_into_foreign_pool_set_is_rejected() {
        let mut pools = DescriptorPoolSet::<u32>::new(1, vk::DescriptorType::UNIFORM_BUFFER, 2);
        let handle = DescriptorSetHandle {
            pool_set: 2,
            pool_index: 0,
            set: vk::DescriptorSet::null(),
        };
        assert!(pools.release_slot(&handle).is_err());
    }
}
