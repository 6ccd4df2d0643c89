// Renderer - the frame driver
//
// Owns the device, swapchain, per-frame slots and the fence, and runs one
// rendering iteration per call: acquire, retire-gate the slot, recycle its
// heaps, record, submit, present, signal. All state lives in this context
// object; there are no globals.
//
// Any native failure here is fatal and propagates to main - a half-recorded
// GPU command stream cannot be meaningfully continued.

use crate::backend::frame::{FramePacer, FrameSlot};
use crate::backend::pipeline::{self, PipelineLayouts};
use crate::backend::resource::{vk_format, GpuBuffer, GpuTexture, ResourceState};
use crate::backend::shader;
use crate::backend::sync::{FenceValue, FrameSync, GpuFence};
use crate::backend::{Swapchain, VulkanDevice};
use crate::config::Config;
use crate::snapshot::{DrawIds, RenderSnapshot, StaticScene};
use anyhow::{Context, Result};
use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};
use std::sync::Arc;

const DEPTH_FORMAT: vk::Format = vk::Format::D32_SFLOAT;

/// Device-local geometry and textures for the current asset set. Immutable
/// after upload; replaced wholesale on a "new level" snapshot.
struct StaticData {
    positions: GpuBuffer,
    attributes: GpuBuffer,
    indices: GpuBuffer,
    index_count: u32,
    textures: Vec<GpuTexture>,
}

pub struct Renderer {
    device: Arc<VulkanDevice>,
    surface_loader: ash::extensions::khr::Surface,
    surface: vk::SurfaceKHR,

    swapchain: Option<Swapchain>,
    depth: Option<GpuTexture>,

    layouts: PipelineLayouts,
    pipeline: vk::Pipeline,

    /// One slot per swapchain image, indexed by the image index the
    /// presentation engine reports.
    slots: Vec<FrameSlot>,
    /// Binary semaphore pairs, used round-robin.
    sync: Vec<FrameSync>,
    /// Fence token of the frame that last used each semaphore pair.
    sync_tokens: Vec<FenceValue>,
    sync_index: usize,

    fence: GpuFence,
    pacer: FramePacer,

    static_data: Option<StaticData>,

    width: u32,
    height: u32,
    needs_resize: bool,

    clear_color: [f32; 4],
    vsync: bool,
    frames_in_flight: u32,
    upload_heap_size: u64,
}

impl Renderer {
    pub fn new(
        config: &Config,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
        width: u32,
        height: u32,
    ) -> Result<Self> {
        let enable_validation = cfg!(debug_assertions) && config.debug.validation_layers;
        let device = VulkanDevice::new(&config.window.title, display_handle, enable_validation)?;

        let entry = unsafe { ash::Entry::load() }?;
        let surface_loader = ash::extensions::khr::Surface::new(&entry, &device.instance);
        let surface = unsafe {
            ash_window::create_surface(&entry, &device.instance, display_handle, window_handle, None)
        }
        .context("Failed to create window surface")?;

        // Verify the GPU supports presenting to this surface
        let surface_support = unsafe {
            surface_loader.get_physical_device_surface_support(
                device.physical_device,
                device.graphics_queue_family,
                surface,
            )?
        };
        if !surface_support {
            anyhow::bail!("GPU doesn't support presenting to this surface");
        }

        let swapchain = Swapchain::new(
            device.clone(),
            surface,
            &surface_loader,
            width,
            height,
            config.graphics.frames_in_flight,
            config.graphics.vsync,
        )?;

        let layouts = PipelineLayouts::new(&device, config.graphics.descriptor_capacity)?;

        // Shader artifacts are opaque inputs; modules are only needed while
        // the pipeline is built.
        let vert_module = shader::load_shader_module(&device, &config.shaders.vertex)?;
        let frag_module = shader::load_shader_module(&device, &config.shaders.fragment)?;
        let pipeline = pipeline::create_graphics_pipeline(
            &device,
            &layouts,
            swapchain.format,
            DEPTH_FORMAT,
            vert_module,
            frag_module,
        )?;
        unsafe {
            device.device.destroy_shader_module(vert_module, None);
            device.device.destroy_shader_module(frag_module, None);
        }

        let upload_heap_size = config.upload_heap_bytes();
        let slot_count = swapchain.images.len();
        let slots = (0..slot_count)
            .map(|_| FrameSlot::new(&device, &layouts, upload_heap_size))
            .collect::<Result<Vec<_>>>()?;
        let sync = (0..slot_count)
            .map(|_| FrameSync::new(&device))
            .collect::<Result<Vec<_>>>()?;

        let depth = GpuTexture::create(
            &device,
            "depth-target",
            swapchain.extent.width,
            swapchain.extent.height,
            1,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )?;

        let fence = GpuFence::new(&device)?;

        log::info!("Renderer initialized with {} frame slots", slot_count);

        Ok(Self {
            device,
            surface_loader,
            surface,
            swapchain: Some(swapchain),
            depth: Some(depth),
            layouts,
            pipeline,
            slots,
            sync,
            sync_tokens: vec![FenceValue(0); slot_count],
            sync_index: 0,
            fence,
            pacer: FramePacer::new(slot_count),
            static_data: None,
            width,
            height,
            needs_resize: false,
            clear_color: config.graphics.clear_color,
            vsync: config.graphics.vsync,
            frames_in_flight: config.graphics.frames_in_flight,
            upload_heap_size,
        })
    }

    /// Run one rendering iteration. Returns false when nothing was
    /// presented (minimized window, swapchain rebuild in progress).
    pub fn render_frame(
        &mut self,
        snapshot: &RenderSnapshot,
        width: u32,
        height: u32,
    ) -> Result<bool> {
        // New static data is uploaded and fully flushed before any frame
        // references it.
        if let Some(scene) = &snapshot.scene {
            self.upload_static_scene(scene)?;
        }

        if width != self.width
            || height != self.height
            || self.needs_resize
            || self.swapchain.is_none()
        {
            self.recreate_targets(width, height)?;
        }
        if self.swapchain.is_none() {
            return Ok(false);
        }

        // Guard reuse of this frame's binary semaphores.
        let sync_index = self.sync_index;
        self.fence.wait(self.sync_tokens[sync_index])?;

        // Acquire first; the presentation engine picks the slot.
        let swapchain = self.swapchain.as_ref().unwrap();
        let acquire_result =
            swapchain.acquire_next_image(u64::MAX, self.sync[sync_index].image_available);
        let image_index = match acquire_result {
            Ok((index, suboptimal)) => {
                if suboptimal {
                    self.needs_resize = true;
                }
                index
            }
            Err(e) => {
                if e.to_string().contains("out of date") {
                    self.needs_resize = true;
                    return Ok(false);
                }
                return Err(e);
            }
        };
        let slot_index = image_index as usize;

        // Retire gate: the slot's previous occupant must be complete before
        // its command pool, upload heap and descriptor arena are recycled.
        self.fence.wait(self.pacer.reuse_gate(slot_index))?;
        self.slots[slot_index].recycle()?;

        let cmd = self.slots[slot_index].begin_commands()?;

        // Depth target enters its attachment state on first use after
        // (re)creation.
        if let Some(depth) = &mut self.depth {
            if depth.state == ResourceState::Common {
                depth.transition(cmd, ResourceState::DepthWrite);
            }
        }

        // Push per-frame and per-draw constants through the slot's upload
        // heap; the offsets come back as dynamic uniform offsets.
        let slot = &mut self.slots[slot_index];
        let frame_offset = slot.upload.push(&snapshot.frame);
        let draw_offset = slot.upload.push(&snapshot.draw);

        // Bindless views for everything this frame dereferences. Indices
        // are only valid for this slot's lifetime, so they are re-allocated
        // every frame.
        let draw_ids = self.static_data.as_ref().map(|data| {
            let pos_id = slot.descriptors.allocate_buffer(data.positions.buffer);
            let attr_id = slot.descriptors.allocate_buffer(data.attributes.buffer);
            let tex_ids: Vec<u32> = data
                .textures
                .iter()
                .map(|texture| slot.descriptors.allocate_texture(texture.view))
                .collect();
            // Missing material slots fall back to the first texture.
            let tex = |i: usize| tex_ids.get(i).or_else(|| tex_ids.first()).copied().unwrap_or(0);
            DrawIds {
                pos_id,
                attr_id,
                albedo_id: tex(0),
                normal_id: tex(1),
                rough_id: tex(2),
                ao_id: tex(3),
                env_id: tex(4),
                env_irr_id: tex(5),
            }
        });

        let swapchain = self.swapchain.as_ref().unwrap();
        let extent = swapchain.extent;
        let device = &self.device.device;

        // Backbuffer to renderable. Swapchain images are owned by the
        // presentation engine, so they get a plain barrier instead of the
        // registry's tracked transition; contents are cleared anyway.
        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };
        let to_render_target = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::empty())
            .dst_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .old_layout(vk::ImageLayout::UNDEFINED)
            .new_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(swapchain.images[slot_index])
            .subresource_range(subresource_range)
            .build();
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_render_target],
            );
        }

        // Clear + draw under dynamic rendering
        let color_attachments = [vk::RenderingAttachmentInfo::builder()
            .image_view(swapchain.image_views[slot_index])
            .image_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::STORE)
            .clear_value(vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: self.clear_color,
                },
            })
            .build()];
        let depth_attachment = vk::RenderingAttachmentInfo::builder()
            .image_view(self.depth.as_ref().unwrap().view)
            .image_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL)
            .load_op(vk::AttachmentLoadOp::CLEAR)
            .store_op(vk::AttachmentStoreOp::DONT_CARE)
            .clear_value(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        let rendering_info = vk::RenderingInfo::builder()
            .render_area(vk::Rect2D {
                offset: vk::Offset2D::default(),
                extent,
            })
            .layer_count(1)
            .color_attachments(&color_attachments)
            .depth_attachment(&depth_attachment);

        unsafe {
            device.cmd_begin_rendering(cmd, &rendering_info);

            // Flipped viewport keeps the right-handed CCW convention the
            // geometry is authored in.
            device.cmd_set_viewport(
                cmd,
                0,
                &[vk::Viewport {
                    x: 0.0,
                    y: extent.height as f32,
                    width: extent.width as f32,
                    height: -(extent.height as f32),
                    min_depth: 0.0,
                    max_depth: 1.0,
                }],
            );
            device.cmd_set_scissor(
                cmd,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D::default(),
                    extent,
                }],
            );

            if let (Some(data), Some(draw_ids)) = (&self.static_data, &draw_ids) {
                device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::GRAPHICS, self.pipeline);

                let sets = [
                    self.slots[slot_index].descriptors.set,
                    self.slots[slot_index].constants_set,
                ];
                let dynamic_offsets = [frame_offset, draw_offset];
                device.cmd_bind_descriptor_sets(
                    cmd,
                    vk::PipelineBindPoint::GRAPHICS,
                    self.layouts.pipeline_layout,
                    0,
                    &sets,
                    &dynamic_offsets,
                );
                device.cmd_push_constants(
                    cmd,
                    self.layouts.pipeline_layout,
                    vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT,
                    0,
                    bytemuck::bytes_of(draw_ids),
                );

                device.cmd_bind_index_buffer(cmd, data.indices.buffer, 0, vk::IndexType::UINT16);
                device.cmd_draw_indexed(cmd, data.index_count, 1, 0, 0, 0);
            }

            device.cmd_end_rendering(cmd);
        }

        // Backbuffer to presentable
        let to_present = vk::ImageMemoryBarrier::builder()
            .src_access_mask(vk::AccessFlags::COLOR_ATTACHMENT_WRITE)
            .dst_access_mask(vk::AccessFlags::empty())
            .old_layout(vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL)
            .new_layout(vk::ImageLayout::PRESENT_SRC_KHR)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(swapchain.images[slot_index])
            .subresource_range(subresource_range)
            .build();
        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                vk::PipelineStageFlags::BOTTOM_OF_PIPE,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_present],
            );
            device
                .end_command_buffer(cmd)
                .context("Failed to end frame command buffer")?;
        }

        // Submit, signaling both the present semaphore and the fence token
        // this slot's reuse will be gated on.
        let token = self.fence.reserve_signal();
        let wait_semaphores = [self.sync[sync_index].image_available];
        let wait_stages = [vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT];
        let wait_values = [0];
        let signal_semaphores = [
            self.sync[sync_index].render_finished,
            self.fence.semaphore(),
        ];
        let signal_values = [0, token.0];
        let mut timeline_info = vk::TimelineSemaphoreSubmitInfo::builder()
            .wait_semaphore_values(&wait_values)
            .signal_semaphore_values(&signal_values);
        let command_buffers = [cmd];
        let submit = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores)
            .push_next(&mut timeline_info)
            .build();

        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit],
                vk::Fence::null(),
            )
        }
        .context("Failed to submit frame")?;

        // Present, then advance. The next iteration waits on the token of
        // whichever slot the presentation engine hands out next.
        let present_result = swapchain.present(
            self.device.graphics_queue,
            image_index,
            &[self.sync[sync_index].render_finished],
        );
        match present_result {
            Ok(suboptimal) => {
                if suboptimal {
                    self.needs_resize = true;
                }
            }
            Err(_) => {
                self.needs_resize = true;
            }
        }

        self.pacer.record_signal(slot_index, token);
        self.sync_tokens[sync_index] = token;
        self.sync_index = (sync_index + 1) % self.sync.len();

        Ok(true)
    }

    /// Upload a new static asset set. The old set is released, and the new
    /// one usable, only across full fence flushes.
    fn upload_static_scene(&mut self, scene: &StaticScene) -> Result<()> {
        log::info!(
            "Uploading static scene: {} vertices, {} indices, {} textures",
            scene.positions.element_count(),
            scene.indices.element_count(),
            scene.textures.len()
        );

        // Nothing in flight may reference the outgoing resources.
        let token = self.fence.flush(self.device.graphics_queue)?;
        self.pacer.rebase(token);
        self.static_data = None;

        let device = &self.device;
        let mut positions = GpuBuffer::create(
            device,
            "static-positions",
            scene.positions.len(),
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;
        let mut attributes = GpuBuffer::create(
            device,
            "static-attributes",
            scene.attributes.len(),
            vk::BufferUsageFlags::STORAGE_BUFFER,
        )?;
        let mut indices = GpuBuffer::create(
            device,
            "static-indices",
            scene.indices.len(),
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;
        let mut textures = scene
            .textures
            .iter()
            .map(|image| {
                GpuTexture::create(
                    device,
                    "static-texture",
                    image.width,
                    image.height,
                    image.mip_count,
                    vk_format(image.format),
                    vk::ImageUsageFlags::SAMPLED | vk::ImageUsageFlags::TRANSFER_DST,
                    vk::ImageAspectFlags::COLOR,
                )
            })
            .collect::<Result<Vec<_>>>()?;

        // Stage through slot 0, idle after the flush above.
        let slot = &mut self.slots[0];
        slot.recycle()?;
        let cmd = slot.begin_commands()?;

        positions.upload(cmd, &mut slot.upload, scene.positions, ResourceState::ShaderResource);
        attributes.upload(cmd, &mut slot.upload, scene.attributes, ResourceState::ShaderResource);
        indices.upload(cmd, &mut slot.upload, scene.indices, ResourceState::IndexBuffer);
        for (texture, image) in textures.iter_mut().zip(&scene.textures) {
            texture.upload(cmd, &mut slot.upload, image);
        }
        log::debug!(
            "Upload heap: {} bytes free after staging",
            slot.upload.remaining()
        );

        unsafe { self.device.device.end_command_buffer(cmd) }
            .context("Failed to end upload command buffer")?;

        let command_buffers = [cmd];
        let submit = vk::SubmitInfo::builder()
            .command_buffers(&command_buffers)
            .build();
        unsafe {
            self.device.device.queue_submit(
                self.device.graphics_queue,
                &[submit],
                vk::Fence::null(),
            )
        }
        .context("Failed to submit static upload")?;

        // Fully flush before first use.
        let token = self.fence.flush(self.device.graphics_queue)?;
        self.pacer.rebase(token);

        self.static_data = Some(StaticData {
            positions,
            attributes,
            indices,
            index_count: scene.indices.element_count(),
            textures,
        });
        Ok(())
    }

    /// Tear down and rebuild everything derived from the presentation
    /// surface. No frame is rendered mid-resize.
    fn recreate_targets(&mut self, width: u32, height: u32) -> Result<()> {
        log::info!("Recreating render targets: {}x{}", width, height);

        let token = self.fence.flush(self.device.graphics_queue)?;
        self.pacer.rebase(token);

        self.width = width;
        self.height = height;
        self.depth = None;
        // The surface can only have one swapchain at a time.
        self.swapchain = None;

        if width == 0 || height == 0 {
            log::debug!("Window minimized; presentation suspended");
            return Ok(());
        }

        let swapchain = Swapchain::new(
            self.device.clone(),
            self.surface,
            &self.surface_loader,
            width,
            height,
            self.frames_in_flight,
            self.vsync,
        )?;

        // The presentation engine may grant a different image count after a
        // resize; slots are keyed by image index and must track it.
        if swapchain.images.len() != self.slots.len() {
            log::info!(
                "Swapchain image count changed: {} -> {}",
                self.slots.len(),
                swapchain.images.len()
            );
            let slot_count = swapchain.images.len();
            self.slots = (0..slot_count)
                .map(|_| FrameSlot::new(&self.device, &self.layouts, self.upload_heap_size))
                .collect::<Result<Vec<_>>>()?;
            for sync in &self.sync {
                sync.destroy(&self.device.device);
            }
            self.sync = (0..slot_count)
                .map(|_| FrameSync::new(&self.device))
                .collect::<Result<Vec<_>>>()?;
            self.sync_tokens = vec![token; slot_count];
            self.sync_index = 0;
            self.pacer = FramePacer::new(slot_count);
            self.pacer.rebase(token);
        }

        self.depth = Some(GpuTexture::create(
            &self.device,
            "depth-target",
            swapchain.extent.width,
            swapchain.extent.height,
            1,
            DEPTH_FORMAT,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::ImageAspectFlags::DEPTH,
        )?);
        self.swapchain = Some(swapchain);
        self.needs_resize = false;

        Ok(())
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        log::info!("Shutting down renderer...");

        // Nothing may be released while the GPU might still reference it.
        let _ = self.fence.flush(self.device.graphics_queue);
        let _ = self.device.wait_idle();

        self.static_data = None;
        self.depth = None;
        self.swapchain = None;
        self.slots.clear();

        unsafe {
            for sync in &self.sync {
                sync.destroy(&self.device.device);
            }
            self.device.device.destroy_pipeline(self.pipeline, None);
            self.surface_loader.destroy_surface(self.surface, None);
        }
    }
}
