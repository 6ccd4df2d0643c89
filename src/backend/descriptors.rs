// Bindless descriptor arena
//
// One descriptor set per frame in flight, holding two runtime-sized tables
// (storage buffers, sampled images) plus an immutable sampler. Allocation
// hands out dense slot indices; the index is the only handle draw code ever
// sees - it travels to the shader through push constants.

use super::VulkanDevice;
use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

pub const BINDING_BUFFERS: u32 = 0;
pub const BINDING_TEXTURES: u32 = 1;
pub const BINDING_SAMPLER: u32 = 2;

/// Dense index allocation for a capacity-bound descriptor table.
///
/// Indices are assigned in allocation order starting at 0 and stay valid
/// until `reset`, which restarts at 0 without touching the old descriptor
/// memory. Exceeding capacity is a sizing bug and panics.
#[derive(Debug)]
pub struct SlotArena {
    count: u32,
    capacity: u32,
}

impl SlotArena {
    pub fn new(capacity: u32) -> Self {
        Self { count: 0, capacity }
    }

    pub fn allocate(&mut self) -> u32 {
        assert!(
            self.count < self.capacity,
            "descriptor table full: capacity {}",
            self.capacity
        );
        let slot = self.count;
        self.count += 1;
        slot
    }

    pub fn reset(&mut self) {
        self.count = 0;
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn capacity(&self) -> u32 {
        self.capacity
    }
}

/// Set layout + immutable sampler shared by every per-frame arena.
pub struct BindlessLayout {
    device: Arc<VulkanDevice>,
    pub set_layout: vk::DescriptorSetLayout,
    sampler: vk::Sampler,
    pub capacity: u32,
}

impl BindlessLayout {
    pub fn new(device: &Arc<VulkanDevice>, capacity: u32) -> Result<Self> {
        let sampler_info = vk::SamplerCreateInfo::builder()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .max_lod(vk::LOD_CLAMP_NONE);

        let sampler = unsafe { device.device.create_sampler(&sampler_info, None) }
            .context("Failed to create bindless sampler")?;

        let immutable_samplers = [sampler];
        let bindings = [
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_BUFFERS)
                .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
                .descriptor_count(capacity)
                .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_TEXTURES)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(capacity)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_SAMPLER)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT)
                .immutable_samplers(&immutable_samplers)
                .build(),
        ];

        // Tables are sparsely written; shaders only touch slots named by the
        // indices pushed for the current draw.
        let table_flags = vk::DescriptorBindingFlags::PARTIALLY_BOUND
            | vk::DescriptorBindingFlags::UPDATE_AFTER_BIND;
        let binding_flags = [table_flags, table_flags, vk::DescriptorBindingFlags::empty()];
        let mut flags_info = vk::DescriptorSetLayoutBindingFlagsCreateInfo::builder()
            .binding_flags(&binding_flags);

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder()
            .bindings(&bindings)
            .flags(vk::DescriptorSetLayoutCreateFlags::UPDATE_AFTER_BIND_POOL)
            .push_next(&mut flags_info);

        let set_layout = unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
            .context("Failed to create bindless set layout")?;

        Ok(Self {
            device: device.clone(),
            set_layout,
            sampler,
            capacity,
        })
    }
}

impl Drop for BindlessLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .device
                .destroy_descriptor_set_layout(self.set_layout, None);
            self.device.device.destroy_sampler(self.sampler, None);
        }
    }
}

/// Per-frame-slot descriptor heap.
///
/// Same lifetime and reclaim rule as the slot's upload heap: reset only
/// after the fence token of the frame that last used it has completed.
pub struct DescriptorArena {
    device: Arc<VulkanDevice>,
    pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
    buffers: SlotArena,
    textures: SlotArena,
}

impl DescriptorArena {
    pub fn new(device: &Arc<VulkanDevice>, layout: &BindlessLayout) -> Result<Self> {
        let pool_sizes = [
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::STORAGE_BUFFER,
                descriptor_count: layout.capacity,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLED_IMAGE,
                descriptor_count: layout.capacity,
            },
            vk::DescriptorPoolSize {
                ty: vk::DescriptorType::SAMPLER,
                descriptor_count: 1,
            },
        ];

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .flags(vk::DescriptorPoolCreateFlags::UPDATE_AFTER_BIND)
            .max_sets(1)
            .pool_sizes(&pool_sizes);

        let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .context("Failed to create descriptor pool")?;

        let set_layouts = [layout.set_layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(pool)
            .set_layouts(&set_layouts);

        let set = unsafe { device.device.allocate_descriptor_sets(&alloc_info) }
            .context("Failed to allocate bindless descriptor set")?[0];

        Ok(Self {
            device: device.clone(),
            pool,
            set,
            buffers: SlotArena::new(layout.capacity),
            textures: SlotArena::new(layout.capacity),
        })
    }

    /// Write a storage-buffer view into the next slot of the buffer table
    /// and return its bindless index.
    pub fn allocate_buffer(&mut self, buffer: vk::Buffer) -> u32 {
        let slot = self.buffers.allocate();

        let buffer_info = [vk::DescriptorBufferInfo {
            buffer,
            offset: 0,
            range: vk::WHOLE_SIZE,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(BINDING_BUFFERS)
            .dst_array_element(slot)
            .descriptor_type(vk::DescriptorType::STORAGE_BUFFER)
            .buffer_info(&buffer_info)
            .build();

        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
        slot
    }

    /// Write a sampled-image view into the next slot of the texture table
    /// and return its bindless index.
    pub fn allocate_texture(&mut self, view: vk::ImageView) -> u32 {
        let slot = self.textures.allocate();

        let image_info = [vk::DescriptorImageInfo {
            sampler: vk::Sampler::null(),
            image_view: view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::builder()
            .dst_set(self.set)
            .dst_binding(BINDING_TEXTURES)
            .dst_array_element(slot)
            .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
            .image_info(&image_info)
            .build();

        unsafe { self.device.device.update_descriptor_sets(&[write], &[]) };
        slot
    }

    /// Invalidate all indices handed out for the retiring frame. Descriptor
    /// memory is left in place - stale slots are unreachable because no live
    /// index names them.
    pub fn reset(&mut self) {
        self.buffers.reset();
        self.textures.reset();
    }
}

impl Drop for DescriptorArena {
    fn drop(&mut self) {
        unsafe {
            self.device.device.destroy_descriptor_pool(self.pool, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::SlotArena;

    #[test]
    fn indices_are_dense_and_ordered() {
        let mut arena = SlotArena::new(64);
        let indices: Vec<u32> = (0..64).map(|_| arena.allocate()).collect();
        let expected: Vec<u32> = (0..64).collect();
        assert_eq!(indices, expected);
        assert_eq!(arena.count(), arena.capacity());
    }

    #[test]
    fn reset_restarts_at_zero() {
        let mut arena = SlotArena::new(8);
        for _ in 0..5 {
            arena.allocate();
        }
        arena.reset();
        assert_eq!(arena.count(), 0);
        assert_eq!(arena.allocate(), 0);
        assert_eq!(arena.allocate(), 1);
    }

    #[test]
    #[should_panic(expected = "descriptor table full")]
    fn exceeding_capacity_panics() {
        let mut arena = SlotArena::new(2);
        arena.allocate();
        arena.allocate();
        arena.allocate();
    }
}
