// GPU resource registry
//
// Device-local buffers and textures for static data. Each resource carries
// an explicit usage state; transitions are validated against the allowed
// machine (Common -> CopyDst -> consumption state) instead of trusting the
// call sites, so a bad barrier is a loud panic rather than quiet corruption.
//
// Resources are created once per asset batch, filled through the staged
// upload protocol, and never mutated again in steady state.

use super::upload::UploadHeap;
use super::VulkanDevice;
use crate::snapshot::{ByteView, ImageView, PixelFormat};
use anyhow::{Context, Result};
use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;
use std::sync::Arc;

/// Usage state of a device-local resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceState {
    /// Freshly created, contents undefined.
    Common,
    /// Copy destination during a staged upload.
    CopyDst,
    /// Read as a storage/sampled resource by shaders.
    ShaderResource,
    /// Bound through the index-buffer binding point.
    IndexBuffer,
    /// Bound through the vertex-input binding point.
    VertexBuffer,
    /// Written as a depth attachment.
    DepthWrite,
}

impl ResourceState {
    /// Legal edges of the state machine. Uploads go Common -> CopyDst ->
    /// consumption state; the depth target goes straight to DepthWrite.
    pub fn can_transition_to(self, to: ResourceState) -> bool {
        use ResourceState::*;
        matches!(
            (self, to),
            (Common, CopyDst)
                | (Common, DepthWrite)
                | (CopyDst, ShaderResource)
                | (CopyDst, IndexBuffer)
                | (CopyDst, VertexBuffer)
        )
    }

    fn access_mask(self) -> vk::AccessFlags {
        match self {
            ResourceState::Common => vk::AccessFlags::empty(),
            ResourceState::CopyDst => vk::AccessFlags::TRANSFER_WRITE,
            ResourceState::ShaderResource => vk::AccessFlags::SHADER_READ,
            ResourceState::IndexBuffer => vk::AccessFlags::INDEX_READ,
            ResourceState::VertexBuffer => vk::AccessFlags::VERTEX_ATTRIBUTE_READ,
            ResourceState::DepthWrite => {
                vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                    | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE
            }
        }
    }

    fn stage_mask(self) -> vk::PipelineStageFlags {
        match self {
            ResourceState::Common => vk::PipelineStageFlags::TOP_OF_PIPE,
            ResourceState::CopyDst => vk::PipelineStageFlags::TRANSFER,
            ResourceState::ShaderResource => {
                vk::PipelineStageFlags::VERTEX_SHADER | vk::PipelineStageFlags::FRAGMENT_SHADER
            }
            ResourceState::IndexBuffer | ResourceState::VertexBuffer => {
                vk::PipelineStageFlags::VERTEX_INPUT
            }
            ResourceState::DepthWrite => {
                vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS
                    | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS
            }
        }
    }

    fn image_layout(self) -> vk::ImageLayout {
        match self {
            ResourceState::Common => vk::ImageLayout::UNDEFINED,
            ResourceState::CopyDst => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            ResourceState::ShaderResource => vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            ResourceState::DepthWrite => vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            ResourceState::IndexBuffer | ResourceState::VertexBuffer => {
                unreachable!("buffer-only state has no image layout")
            }
        }
    }
}

pub fn vk_format(format: PixelFormat) -> vk::Format {
    match format {
        PixelFormat::Rgba8Unorm => vk::Format::R8G8B8A8_UNORM,
        PixelFormat::Rgba8Srgb => vk::Format::R8G8B8A8_SRGB,
    }
}

/// Device-local buffer with tracked usage state.
pub struct GpuBuffer {
    device: Arc<VulkanDevice>,
    pub buffer: vk::Buffer,
    allocation: Option<Allocation>,
    pub state: ResourceState,
    pub size: u64,
}

impl GpuBuffer {
    /// Create a device-local buffer in the Common state, sized from the
    /// source view it will later receive.
    pub fn create(
        device: &Arc<VulkanDevice>,
        name: &'static str,
        size: u64,
        usage: vk::BufferUsageFlags,
    ) -> Result<Self> {
        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage | vk::BufferUsageFlags::TRANSFER_DST)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .with_context(|| format!("Failed to create buffer '{}'", name))?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };
        let allocation = device
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: true,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for buffer '{}'", name))?;

        unsafe {
            device
                .device
                .bind_buffer_memory(buffer, allocation.memory(), allocation.offset())
        }
        .context("Failed to bind buffer memory")?;

        Ok(Self {
            device: device.clone(),
            buffer,
            allocation: Some(allocation),
            state: ResourceState::Common,
            size,
        })
    }

    /// Record a validated state transition barrier.
    pub fn transition(&mut self, cmd: vk::CommandBuffer, to: ResourceState) {
        assert!(
            self.state.can_transition_to(to),
            "invalid buffer transition {:?} -> {:?}",
            self.state,
            to
        );

        let barrier = vk::BufferMemoryBarrier::builder()
            .src_access_mask(self.state.access_mask())
            .dst_access_mask(to.access_mask())
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .buffer(self.buffer)
            .offset(0)
            .size(vk::WHOLE_SIZE)
            .build();

        unsafe {
            self.device.device.cmd_pipeline_barrier(
                cmd,
                self.state.stage_mask(),
                to.stage_mask(),
                vk::DependencyFlags::empty(),
                &[],
                &[barrier],
                &[],
            );
        }
        self.state = to;
    }

    /// Staged upload: stage the view's bytes in the upload heap, record the
    /// copy, and transition into `target` for consumption. The copy region
    /// is sized from the source view, never from the destination buffer.
    pub fn upload(
        &mut self,
        cmd: vk::CommandBuffer,
        staging: &mut UploadHeap,
        data: ByteView,
        target: ResourceState,
    ) {
        assert!(
            data.len() <= self.size,
            "upload of {} bytes into {}-byte buffer",
            data.len(),
            self.size
        );

        let src_offset = staging.push_bytes(data.bytes);

        self.transition(cmd, ResourceState::CopyDst);
        let region = vk::BufferCopy {
            src_offset,
            dst_offset: 0,
            size: data.len(),
        };
        unsafe {
            self.device
                .device
                .cmd_copy_buffer(cmd, staging.buffer(), self.buffer, &[region]);
        }
        self.transition(cmd, target);
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            let _ = self.device.allocator.lock().free(allocation);
        }
        unsafe {
            self.device.device.destroy_buffer(self.buffer, None);
        }
    }
}

/// Device-local 2D texture with tracked usage state.
pub struct GpuTexture {
    device: Arc<VulkanDevice>,
    pub image: vk::Image,
    pub view: vk::ImageView,
    allocation: Option<Allocation>,
    pub state: ResourceState,
    pub format: vk::Format,
    pub width: u32,
    pub height: u32,
    pub mip_count: u32,
}

impl GpuTexture {
    pub fn create(
        device: &Arc<VulkanDevice>,
        name: &'static str,
        width: u32,
        height: u32,
        mip_count: u32,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        aspect: vk::ImageAspectFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width,
                height,
                depth: 1,
            })
            .mip_levels(mip_count)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .with_context(|| format!("Failed to create image '{}'", name))?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };
        let allocation = device
            .allocator
            .lock()
            .allocate(&AllocationCreateDesc {
                name,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::GpuAllocatorManaged,
            })
            .with_context(|| format!("Failed to allocate memory for image '{}'", name))?;

        unsafe {
            device
                .device
                .bind_image_memory(image, allocation.memory(), allocation.offset())
        }
        .context("Failed to bind image memory")?;

        let view_info = vk::ImageViewCreateInfo::builder()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: mip_count,
                base_array_layer: 0,
                layer_count: 1,
            });

        let view = unsafe { device.device.create_image_view(&view_info, None) }
            .with_context(|| format!("Failed to create image view '{}'", name))?;

        Ok(Self {
            device: device.clone(),
            image,
            view,
            allocation: Some(allocation),
            state: ResourceState::Common,
            format,
            width,
            height,
            mip_count,
        })
    }

    /// Record a validated layout transition covering every mip level.
    pub fn transition(&mut self, cmd: vk::CommandBuffer, to: ResourceState) {
        assert!(
            self.state.can_transition_to(to),
            "invalid texture transition {:?} -> {:?}",
            self.state,
            to
        );

        let aspect = if to == ResourceState::DepthWrite {
            vk::ImageAspectFlags::DEPTH
        } else {
            vk::ImageAspectFlags::COLOR
        };
        let barrier = vk::ImageMemoryBarrier::builder()
            .src_access_mask(self.state.access_mask())
            .dst_access_mask(to.access_mask())
            .old_layout(self.state.image_layout())
            .new_layout(to.image_layout())
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                base_mip_level: 0,
                level_count: self.mip_count,
                base_array_layer: 0,
                layer_count: 1,
            })
            .build();

        unsafe {
            self.device.device.cmd_pipeline_barrier(
                cmd,
                self.state.stage_mask(),
                to.stage_mask(),
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[barrier],
            );
        }
        self.state = to;
    }

    /// Staged upload of a tightly packed mip chain: one row-padded copy
    /// region per mip, then transition to shader-readable.
    pub fn upload(&mut self, cmd: vk::CommandBuffer, staging: &mut UploadHeap, image: &ImageView) {
        assert_eq!(
            (image.width, image.height, image.mip_count),
            (self.width, self.height, self.mip_count),
            "image view does not match texture dimensions"
        );
        assert_eq!(
            vk_format(image.format),
            self.format,
            "image view format does not match texture"
        );

        let bpp = image.format.bytes_per_pixel() as u64;
        let (base, footprints) = staging.stage_image(image);

        self.transition(cmd, ResourceState::CopyDst);
        for footprint in &footprints {
            // buffer_row_length is in texels; the padded pitch must stay a
            // whole texel count for the formats we accept.
            assert_eq!(footprint.row_pitch % bpp, 0);
            let region = vk::BufferImageCopy {
                buffer_offset: base + footprint.offset,
                buffer_row_length: (footprint.row_pitch / bpp) as u32,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: footprint.mip,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D::default(),
                image_extent: vk::Extent3D {
                    width: footprint.width,
                    height: footprint.height,
                    depth: 1,
                },
            };
            unsafe {
                self.device.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer(),
                    self.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
        }
        self.transition(cmd, ResourceState::ShaderResource);
    }
}

impl Drop for GpuTexture {
    fn drop(&mut self) {
        if let Some(allocation) = self.allocation.take() {
            let _ = self.device.allocator.lock().free(allocation);
        }
        unsafe {
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::ResourceState::*;

    #[test]
    fn upload_path_transitions_are_legal() {
        assert!(Common.can_transition_to(CopyDst));
        assert!(CopyDst.can_transition_to(ShaderResource));
        assert!(CopyDst.can_transition_to(IndexBuffer));
        assert!(CopyDst.can_transition_to(VertexBuffer));
        assert!(Common.can_transition_to(DepthWrite));
    }

    #[test]
    fn shortcut_and_backward_transitions_are_rejected() {
        // Skipping the staging state or reusing a consumed resource as a
        // copy target must be caught, not silently encoded.
        assert!(!Common.can_transition_to(ShaderResource));
        assert!(!ShaderResource.can_transition_to(CopyDst));
        assert!(!IndexBuffer.can_transition_to(ShaderResource));
        assert!(!CopyDst.can_transition_to(Common));
        assert!(!DepthWrite.can_transition_to(CopyDst));
        assert!(!Common.can_transition_to(Common));
    }
}
