//! Pipeline layouts, pipeline caches and pipelines.
//!
//! # Key Types
//!
//! - [`PipelineLayout`]: the descriptor set layouts and push constant ranges a
//!   pipeline is built against.
//! - [`PipelineCache`]: compiled pipeline data reused across creations.
//! - [`ComputePipeline`]: built from a compute [`ShaderProgram`].
//! - [`GraphicsPipeline`]: built from a graphics [`ShaderProgram`], a
//!   [`RenderPass`] subpass and a plain [`GraphicsPipelineState`] record.
//!
//! Every handle a creation record refers to must be owned by the creating
//! device. The referenced objects are not kept alive by the pipeline; the
//! device tears pipelines down before their layouts and programs.

use std::fmt::Debug;

use ash::vk;
use smallvec::SmallVec;

use crate::{
    Device,
    descriptor::DescriptorSetLayout,
    driver::{Driver, NativeInfo},
    error::{Error, ResourceKind, Result},
    handle::Handle,
    render_pass::RenderPass,
    shader::{ProgramKind, ShaderProgram},
    store::{Managed, Resource},
    utils::AsVkHandle,
};

#[derive(Debug, Clone, Default)]
pub struct PipelineLayoutCreateInfo {
    pub set_layouts: Vec<Handle<DescriptorSetLayout>>,
    pub push_constant_ranges: Vec<vk::PushConstantRange>,
}

/// Defines the interface between shaders and descriptor sets.
pub struct PipelineLayout {
    handle: vk::PipelineLayout,
    set_layouts: Vec<Handle<DescriptorSetLayout>>,
    push_constant_ranges: Vec<vk::PushConstantRange>,
}

impl Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.handle.fmt(f)
    }
}

impl PipelineLayout {
    pub fn set_layouts(&self) -> &[Handle<DescriptorSetLayout>] {
        &self.set_layouts
    }

    pub fn push_constant_ranges(&self) -> &[vk::PushConstantRange] {
        &self.push_constant_ranges
    }
}

impl AsVkHandle for PipelineLayout {
    type Handle = vk::PipelineLayout;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for PipelineLayout {
    type CreateInfo = PipelineLayoutCreateInfo;
    const KIND: ResourceKind = ResourceKind::PipelineLayout;
}

impl Managed for PipelineLayout {
    fn validate(device: &Device, info: &PipelineLayoutCreateInfo) -> Result<()> {
        for layout in &info.set_layouts {
            device.get(*layout)?;
        }
        let limits = device.physical_device().limits();
        let invalid = |reason: String| Err(Error::invalid(ResourceKind::PipelineLayout, reason));
        if info.set_layouts.len() as u64 > u64::from(limits.max_bound_descriptor_sets) {
            return invalid(format!(
                "{} set layouts exceed max_bound_descriptor_sets ({})",
                info.set_layouts.len(),
                limits.max_bound_descriptor_sets
            ));
        }
        let mut stages = vk::ShaderStageFlags::empty();
        for range in &info.push_constant_ranges {
            let end = u64::from(range.offset) + u64::from(range.size);
            if range.size == 0 || range.offset % 4 != 0 || range.size % 4 != 0 {
                return invalid(format!(
                    "push constant range {}+{} is empty or not 4-byte aligned",
                    range.offset, range.size
                ));
            }
            if end > u64::from(limits.max_push_constants_size) {
                return invalid(format!(
                    "push constant range ends at {end}, past max_push_constants_size ({})",
                    limits.max_push_constants_size
                ));
            }
            if range.stage_flags.is_empty() || stages.intersects(range.stage_flags) {
                return invalid(format!(
                    "push constant stages {:?} are empty or already covered",
                    range.stage_flags
                ));
            }
            stages |= range.stage_flags;
        }
        Ok(())
    }

    fn create(device: &Device, info: PipelineLayoutCreateInfo) -> Result<Self> {
        let set_layouts = info
            .set_layouts
            .iter()
            .map(|layout| device.get(*layout).map(AsVkHandle::vk_handle))
            .collect::<Result<SmallVec<[vk::DescriptorSetLayout; 4]>>>()?;
        let raw = vk::PipelineLayoutCreateInfo::default()
            .set_layouts(&set_layouts)
            .push_constant_ranges(&info.push_constant_ranges);
        let handle = device
            .driver()?
            .create(NativeInfo::PipelineLayout(&raw))
            .map_err(Error::creation(ResourceKind::PipelineLayout))?;
        Ok(Self {
            handle,
            set_layouts: info.set_layouts,
            push_constant_ranges: info.push_constant_ranges,
        })
    }

    fn destroy(self, driver: &dyn Driver) {
        driver.destroy(self.handle);
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PipelineCacheCreateInfo {
    /// Data previously retrieved from a cache. May be empty.
    pub initial_data: Vec<u8>,
}

/// Caches compiled pipeline data for faster subsequent creations.
pub struct PipelineCache {
    handle: vk::PipelineCache,
}

impl Debug for PipelineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.handle.fmt(f)
    }
}

impl AsVkHandle for PipelineCache {
    type Handle = vk::PipelineCache;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for PipelineCache {
    type CreateInfo = PipelineCacheCreateInfo;
    const KIND: ResourceKind = ResourceKind::PipelineCache;
}

impl Managed for PipelineCache {
    fn validate(_: &Device, _: &PipelineCacheCreateInfo) -> Result<()> {
        Ok(())
    }

    fn create(device: &Device, info: PipelineCacheCreateInfo) -> Result<Self> {
        let raw = vk::PipelineCacheCreateInfo::default().initial_data(&info.initial_data);
        let handle = device
            .driver()?
            .create(NativeInfo::PipelineCache(&raw))
            .map_err(Error::creation(ResourceKind::PipelineCache))?;
        Ok(Self { handle })
    }

    fn destroy(self, driver: &dyn Driver) {
        driver.destroy(self.handle);
    }
}

fn resolve_cache(
    device: &Device,
    cache: Option<Handle<PipelineCache>>,
) -> Result<vk::PipelineCache> {
    cache.map_or(Ok(vk::PipelineCache::null()), |cache| {
        device.get(cache).map(AsVkHandle::vk_handle)
    })
}

fn program_of_kind(
    device: &Device,
    program: Handle<ShaderProgram>,
    expected: ProgramKind,
    kind: ResourceKind,
) -> Result<&ShaderProgram> {
    let program = device.get(program)?;
    if program.kind() != expected {
        return Err(Error::invalid(
            kind,
            format!("a {:?} program cannot build a {kind}", program.kind()),
        ));
    }
    Ok(program)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputePipelineCreateInfo {
    pub program: Handle<ShaderProgram>,
    pub layout: Handle<PipelineLayout>,
    pub cache: Option<Handle<PipelineCache>>,
}

/// A compiled compute pipeline.
pub struct ComputePipeline {
    handle: vk::Pipeline,
    layout: Handle<PipelineLayout>,
}

impl Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.handle.fmt(f)
    }
}

impl ComputePipeline {
    pub fn layout(&self) -> Handle<PipelineLayout> {
        self.layout
    }
}

impl AsVkHandle for ComputePipeline {
    type Handle = vk::Pipeline;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for ComputePipeline {
    type CreateInfo = ComputePipelineCreateInfo;
    const KIND: ResourceKind = ResourceKind::ComputePipeline;
}

impl Managed for ComputePipeline {
    fn validate(device: &Device, info: &ComputePipelineCreateInfo) -> Result<()> {
        program_of_kind(
            device,
            info.program,
            ProgramKind::Compute,
            ResourceKind::ComputePipeline,
        )?;
        device.get(info.layout)?;
        resolve_cache(device, info.cache)?;
        Ok(())
    }

    fn create(device: &Device, info: ComputePipelineCreateInfo) -> Result<Self> {
        let program = program_of_kind(
            device,
            info.program,
            ProgramKind::Compute,
            ResourceKind::ComputePipeline,
        )?;
        let layout = device.get(info.layout)?.vk_handle();
        let cache = resolve_cache(device, info.cache)?;
        let stages = program.stage_infos();
        let stage = stages.first().copied().ok_or_else(|| {
            Error::invalid(ResourceKind::ComputePipeline, "program has no compute stage")
        })?;
        let raw = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);
        let handle = device
            .driver()?
            .create(NativeInfo::ComputePipeline(cache, &raw))
            .map_err(Error::creation(ResourceKind::ComputePipeline))?;
        Ok(Self {
            handle,
            layout: info.layout,
        })
    }

    fn destroy(self, driver: &dyn Driver) {
        driver.destroy(self.handle);
    }
}

/// Fixed-function state of a graphics pipeline.
///
/// Viewport and scissor are always dynamic. Blending, when enabled, applies
/// standard alpha blending to every color attachment of the subpass.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphicsPipelineState {
    pub topology: vk::PrimitiveTopology,
    pub polygon_mode: vk::PolygonMode,
    pub cull_mode: vk::CullModeFlags,
    pub front_face: vk::FrontFace,
    pub line_width: f32,
    pub samples: vk::SampleCountFlags,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare_op: vk::CompareOp,
    pub blend: bool,
}

impl Default for GraphicsPipelineState {
    fn default() -> Self {
        Self {
            topology: vk::PrimitiveTopology::TRIANGLE_LIST,
            polygon_mode: vk::PolygonMode::FILL,
            cull_mode: vk::CullModeFlags::BACK,
            front_face: vk::FrontFace::COUNTER_CLOCKWISE,
            line_width: 1.0,
            samples: vk::SampleCountFlags::TYPE_1,
            depth_test: false,
            depth_write: false,
            depth_compare_op: vk::CompareOp::LESS_OR_EQUAL,
            blend: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GraphicsPipelineCreateInfo {
    pub program: Handle<ShaderProgram>,
    pub layout: Handle<PipelineLayout>,
    pub render_pass: Handle<RenderPass>,
    pub subpass: u32,
    pub cache: Option<Handle<PipelineCache>>,
    pub state: GraphicsPipelineState,
}

/// A compiled graphics pipeline.
pub struct GraphicsPipeline {
    handle: vk::Pipeline,
    layout: Handle<PipelineLayout>,
    render_pass: Handle<RenderPass>,
    subpass: u32,
    state: GraphicsPipelineState,
}

impl Debug for GraphicsPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.handle.fmt(f)
    }
}

impl GraphicsPipeline {
    pub fn layout(&self) -> Handle<PipelineLayout> {
        self.layout
    }

    pub fn render_pass(&self) -> Handle<RenderPass> {
        self.render_pass
    }

    pub fn subpass(&self) -> u32 {
        self.subpass
    }

    pub fn state(&self) -> &GraphicsPipelineState {
        &self.state
    }
}

impl AsVkHandle for GraphicsPipeline {
    type Handle = vk::Pipeline;
    fn vk_handle(&self) -> Self::Handle {
        self.handle
    }
}

impl Resource for GraphicsPipeline {
    type CreateInfo = GraphicsPipelineCreateInfo;
    const KIND: ResourceKind = ResourceKind::GraphicsPipeline;
}

impl Managed for GraphicsPipeline {
    fn validate(device: &Device, info: &GraphicsPipelineCreateInfo) -> Result<()> {
        program_of_kind(
            device,
            info.program,
            ProgramKind::Graphics,
            ResourceKind::GraphicsPipeline,
        )?;
        device.get(info.layout)?;
        resolve_cache(device, info.cache)?;
        let render_pass = device.get(info.render_pass)?;
        if render_pass.color_attachment_count(info.subpass).is_none() {
            return Err(Error::invalid(
                ResourceKind::GraphicsPipeline,
                format!(
                    "subpass {} out of range for a render pass with {} subpasses",
                    info.subpass,
                    render_pass.subpass_count()
                ),
            ));
        }
        if info.state.line_width <= 0.0 {
            return Err(Error::invalid(
                ResourceKind::GraphicsPipeline,
                "line width must be positive",
            ));
        }
        Ok(())
    }

    fn create(device: &Device, info: GraphicsPipelineCreateInfo) -> Result<Self> {
        let program = program_of_kind(
            device,
            info.program,
            ProgramKind::Graphics,
            ResourceKind::GraphicsPipeline,
        )?;
        let layout = device.get(info.layout)?.vk_handle();
        let cache = resolve_cache(device, info.cache)?;
        let render_pass = device.get(info.render_pass)?;
        let color_attachments = render_pass
            .color_attachment_count(info.subpass)
            .unwrap_or(0);
        let state = info.state;

        let stages = program.stage_infos();
        let vertex_input = vk::PipelineVertexInputStateCreateInfo::default();
        let input_assembly =
            vk::PipelineInputAssemblyStateCreateInfo::default().topology(state.topology);
        let viewport = vk::PipelineViewportStateCreateInfo::default()
            .viewport_count(1)
            .scissor_count(1);
        let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
            .polygon_mode(state.polygon_mode)
            .cull_mode(state.cull_mode)
            .front_face(state.front_face)
            .line_width(state.line_width);
        let multisample =
            vk::PipelineMultisampleStateCreateInfo::default().rasterization_samples(state.samples);
        let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
            .depth_test_enable(state.depth_test)
            .depth_write_enable(state.depth_write)
            .depth_compare_op(state.depth_compare_op);
        let blend_attachment = vk::PipelineColorBlendAttachmentState {
            blend_enable: state.blend.into(),
            src_color_blend_factor: vk::BlendFactor::SRC_ALPHA,
            dst_color_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            color_blend_op: vk::BlendOp::ADD,
            src_alpha_blend_factor: vk::BlendFactor::ONE,
            dst_alpha_blend_factor: vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            alpha_blend_op: vk::BlendOp::ADD,
            color_write_mask: vk::ColorComponentFlags::RGBA,
        };
        let blend_attachments: SmallVec<[vk::PipelineColorBlendAttachmentState; 4]> =
            (0..color_attachments).map(|_| blend_attachment).collect();
        let color_blend =
            vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);
        let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
        let dynamic = vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

        let raw = vk::GraphicsPipelineCreateInfo::default()
            .stages(&stages)
            .vertex_input_state(&vertex_input)
            .input_assembly_state(&input_assembly)
            .viewport_state(&viewport)
            .rasterization_state(&rasterization)
            .multisample_state(&multisample)
            .depth_stencil_state(&depth_stencil)
            .color_blend_state(&color_blend)
            .dynamic_state(&dynamic)
            .layout(layout)
            .render_pass(render_pass.vk_handle())
            .subpass(info.subpass);
        let handle = device
            .driver()?
            .create(NativeInfo::GraphicsPipeline(cache, &raw))
            .map_err(Error::creation(ResourceKind::GraphicsPipeline))?;
        Ok(Self {
            handle,
            layout: info.layout,
            render_pass: info.render_pass,
            subpass: info.subpass,
            state,
        })
    }

    fn destroy(self, driver: &dyn Driver) {
        driver.destroy(self.handle);
    }
}
