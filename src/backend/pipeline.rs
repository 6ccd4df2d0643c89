// Graphics pipeline creation and management
//
// The pipeline layout is the shader calling convention: set 0 is the
// bindless tables, set 1 the two dynamic-offset constant buffers (frame,
// draw) living in the current upload heap, and a push-constant block
// carries the per-draw bindless indices. Vertex data is pulled from
// storage buffers, so there is no fixed-function vertex input.

use super::descriptors::BindlessLayout;
use super::VulkanDevice;
use crate::snapshot::{DrawConstants, DrawIds, FrameConstants};
use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

pub const BINDING_FRAME_CONSTANTS: u32 = 0;
pub const BINDING_DRAW_CONSTANTS: u32 = 1;

/// Set layouts + pipeline layout shared by every pipeline and frame slot.
pub struct PipelineLayouts {
    device: Arc<VulkanDevice>,
    pub bindless: BindlessLayout,
    pub constants_layout: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
}

impl PipelineLayouts {
    pub fn new(device: &Arc<VulkanDevice>, descriptor_capacity: u32) -> Result<Self> {
        let bindless = BindlessLayout::new(device, descriptor_capacity)?;

        let bindings = [
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_FRAME_CONSTANTS)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
                .build(),
            vk::DescriptorSetLayoutBinding::builder()
                .binding(BINDING_DRAW_CONSTANTS)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER_DYNAMIC)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
                .build(),
        ];
        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&bindings);

        let constants_layout =
            unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
                .context("Failed to create constants set layout")?;

        let push_constant_range = vk::PushConstantRange::builder()
            .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT)
            .offset(0)
            .size(std::mem::size_of::<DrawIds>() as u32)
            .build();

        let set_layouts = [bindless.set_layout, constants_layout];
        let push_constant_ranges = [push_constant_range];
        let layout_info = vk::PipelineLayoutCreateInfo::builder()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&push_constant_ranges);

        let pipeline_layout = unsafe { device.device.create_pipeline_layout(&layout_info, None) }
            .context("Failed to create pipeline layout")?;

        Ok(Self {
            device: device.clone(),
            bindless,
            constants_layout,
            pipeline_layout,
        })
    }

    /// Byte window a frame-constants dynamic binding exposes.
    pub fn frame_constants_range() -> u64 {
        std::mem::size_of::<FrameConstants>() as u64
    }

    /// Byte window a draw-constants dynamic binding exposes.
    pub fn draw_constants_range() -> u64 {
        std::mem::size_of::<DrawConstants>() as u64
    }
}

impl Drop for PipelineLayouts {
    fn drop(&mut self) {
        unsafe {
            self.device
                .device
                .destroy_pipeline_layout(self.pipeline_layout, None);
            self.device
                .device
                .destroy_descriptor_set_layout(self.constants_layout, None);
        }
    }
}

/// Create the graphics pipeline for the static geometry path.
///
/// Dynamic rendering (no render pass), dynamic viewport/scissor so resizes
/// never rebuild the pipeline, vertex pulling (no input bindings), depth
/// LESS against a D32 attachment, opaque blending, CCW front faces for the
/// right-handed coordinate system.
pub fn create_graphics_pipeline(
    device: &VulkanDevice,
    layouts: &PipelineLayouts,
    color_format: vk::Format,
    depth_format: vk::Format,
    vert_shader: vk::ShaderModule,
    frag_shader: vk::ShaderModule,
) -> Result<vk::Pipeline> {
    // Shader stages
    let entry_point = std::ffi::CString::new("main").unwrap();

    let vert_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::VERTEX)
        .module(vert_shader)
        .name(&entry_point)
        .build();

    let frag_stage = vk::PipelineShaderStageCreateInfo::builder()
        .stage(vk::ShaderStageFlags::FRAGMENT)
        .module(frag_shader)
        .name(&entry_point)
        .build();

    let shader_stages = &[vert_stage, frag_stage];

    // Vertex pulling: positions and attributes come from bindless storage
    // buffers, so the input state stays empty.
    let vertex_input_info = vk::PipelineVertexInputStateCreateInfo::builder();

    // Input assembly
    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::builder()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    // Viewport and scissor are dynamic; only the counts are baked in
    let viewport_state = vk::PipelineViewportStateCreateInfo::builder()
        .viewport_count(1)
        .scissor_count(1);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::builder().dynamic_states(&dynamic_states);

    // Rasterization
    let rasterizer = vk::PipelineRasterizationStateCreateInfo::builder()
        .depth_clamp_enable(false)
        .rasterizer_discard_enable(false)
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE)
        .depth_bias_enable(false);

    // Multisampling (disabled)
    let multisampling = vk::PipelineMultisampleStateCreateInfo::builder()
        .sample_shading_enable(false)
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    // Depth testing
    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::builder()
        .depth_test_enable(true)
        .depth_write_enable(true)
        .depth_compare_op(vk::CompareOp::LESS)
        .depth_bounds_test_enable(false)
        .stencil_test_enable(false);

    // Color blending (no blending, opaque)
    let color_blend_attachment = vk::PipelineColorBlendAttachmentState::builder()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)
        .build();

    let color_blend_attachments = &[color_blend_attachment];
    let color_blending = vk::PipelineColorBlendStateCreateInfo::builder()
        .logic_op_enable(false)
        .attachments(color_blend_attachments);

    // Dynamic rendering: attachment formats instead of a render pass
    let color_formats = [color_format];
    let mut rendering_info = vk::PipelineRenderingCreateInfo::builder()
        .color_attachment_formats(&color_formats)
        .depth_attachment_format(depth_format);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::builder()
        .stages(shader_stages)
        .vertex_input_state(&vertex_input_info)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .dynamic_state(&dynamic_state)
        .rasterization_state(&rasterizer)
        .multisample_state(&multisampling)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blending)
        .layout(layouts.pipeline_layout)
        .push_next(&mut rendering_info)
        .build();

    let pipelines = unsafe {
        device
            .device
            .create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
            .map_err(|(_, e)| e)
            .context("Failed to create graphics pipeline")?
    };

    Ok(pipelines[0])
}
