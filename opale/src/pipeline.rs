//! Pipeline layouts and pipeline objects.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;

use crate::bind_set::{vk_shader_stage_flags, BindSetLayout};
use crate::deleter::PipelineHandle;
use crate::device::DeviceShared;
use crate::error::{validation_error, Error};
use crate::format::TextureFormat;
use crate::sampler::vk_compare_op;
use crate::shader::ShaderModule;
use crate::texture::vk_sample_count;
use crate::types::{CompareFunction, QueueType, ShaderStages};

pub(crate) const MAX_BIND_SETS: usize = 8;

/// A single push-constant range starting at offset zero.
#[derive(Copy, Clone, Debug)]
pub struct PushConstantRange {
    pub visibility: ShaderStages,
    pub size: u32,
}

#[derive(Clone, Debug)]
pub struct PipelineLayoutDesc<'a> {
    pub label: &'a str,
    /// Sparse list of bind set layouts; empty slots are backed by the
    /// device's empty layout.
    pub bind_set_layouts: &'a [Option<&'a Arc<BindSetLayout>>],
    pub push_constant_range: Option<PushConstantRange>,
}

/// An ordered array of bind set layouts plus an optional push-constant range.
pub struct PipelineLayout {
    device: Arc<DeviceShared>,
    label: String,
    handle: vk::PipelineLayout,
    bind_set_layouts: Vec<Arc<BindSetLayout>>,
    push_constant_range: Option<PushConstantRange>,
}

impl PipelineLayout {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        empty_layout: &Arc<BindSetLayout>,
        desc: &PipelineLayoutDesc,
    ) -> Result<Arc<PipelineLayout>, Error> {
        device.check_not_lost()?;
        if desc.bind_set_layouts.len() > MAX_BIND_SETS {
            return Err(validation_error!(
                "pipeline layout `{}`: at most {} bind sets are supported",
                desc.label,
                MAX_BIND_SETS
            ));
        }

        // Unused slots below the highest used index are replaced by the empty
        // layout so set indices keep their meaning.
        let bind_set_layouts: Vec<Arc<BindSetLayout>> = desc
            .bind_set_layouts
            .iter()
            .map(|slot| slot.cloned().unwrap_or_else(|| empty_layout.clone()))
            .collect();
        let vk_layouts: Vec<vk::DescriptorSetLayout> =
            bind_set_layouts.iter().map(|l| l.handle()).collect();

        let mut create_info = vk::PipelineLayoutCreateInfo {
            set_layout_count: vk_layouts.len() as u32,
            p_set_layouts: vk_layouts.as_ptr(),
            ..Default::default()
        };
        let vk_push_constant_range;
        if let Some(range) = &desc.push_constant_range {
            if range.size == 0 {
                return Err(validation_error!(
                    "pipeline layout `{}`: push constant range must not be empty",
                    desc.label
                ));
            }
            vk_push_constant_range = vk::PushConstantRange {
                stage_flags: vk_shader_stage_flags(range.visibility),
                offset: 0,
                size: range.size,
            };
            create_info.push_constant_range_count = 1;
            create_info.p_push_constant_ranges = &vk_push_constant_range;
        }

        let handle = unsafe { device.raw.create_pipeline_layout(&create_info, None)? };
        device.set_debug_name(
            vk::ObjectType::PIPELINE_LAYOUT,
            vk::Handle::as_raw(handle),
            desc.label,
        );

        Ok(Arc::new(PipelineLayout {
            device: device.clone(),
            label: desc.label.to_string(),
            handle,
            bind_set_layouts,
            push_constant_range: desc.push_constant_range,
        }))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn bind_set_layouts(&self) -> &[Arc<BindSetLayout>] {
        &self.bind_set_layouts
    }

    pub(crate) fn handle(&self) -> vk::PipelineLayout {
        self.handle
    }

    pub(crate) fn push_constant_range(&self) -> Option<&PushConstantRange> {
        self.push_constant_range.as_ref()
    }
}

impl Drop for PipelineLayout {
    fn drop(&mut self) {
        if let Some(queue) = self.device.queue_shared(QueueType::Graphics) {
            queue
                .deleter
                .lock()
                .unwrap()
                .delete_pipeline_layout_when_unused(queue.pending_submit_serial(), self.handle);
        }
    }
}

impl std::fmt::Debug for PipelineLayout {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("PipelineLayout")
            .field("label", &self.label)
            .finish()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    LineStrip,
    TriangleList,
    TriangleStrip,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrontFace {
    Ccw,
    Cw,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CullMode {
    None,
    Front,
    Back,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PolygonMode {
    Fill,
    Line,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VertexStepMode {
    Vertex,
    Instance,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum VertexFormat {
    Float32,
    Float32x2,
    Float32x3,
    Float32x4,
    Uint32,
    Sint32,
    Unorm8x4,
    Uint8x4,
}

impl VertexFormat {
    fn to_vk(self) -> vk::Format {
        match self {
            VertexFormat::Float32 => vk::Format::R32_SFLOAT,
            VertexFormat::Float32x2 => vk::Format::R32G32_SFLOAT,
            VertexFormat::Float32x3 => vk::Format::R32G32B32_SFLOAT,
            VertexFormat::Float32x4 => vk::Format::R32G32B32A32_SFLOAT,
            VertexFormat::Uint32 => vk::Format::R32_UINT,
            VertexFormat::Sint32 => vk::Format::R32_SINT,
            VertexFormat::Unorm8x4 => vk::Format::R8G8B8A8_UNORM,
            VertexFormat::Uint8x4 => vk::Format::R8G8B8A8_UINT,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct VertexAttribute {
    pub format: VertexFormat,
    pub offset: u32,
    pub shader_location: u32,
}

#[derive(Clone, Debug)]
pub struct VertexBufferLayout<'a> {
    pub array_stride: u64,
    pub step_mode: VertexStepMode,
    pub attributes: &'a [VertexAttribute],
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlendFactor {
    Zero,
    One,
    Src,
    OneMinusSrc,
    SrcAlpha,
    OneMinusSrcAlpha,
    Dst,
    OneMinusDst,
    DstAlpha,
    OneMinusDstAlpha,
    ConstantColor,
}

impl BlendFactor {
    fn to_vk(self) -> vk::BlendFactor {
        match self {
            BlendFactor::Zero => vk::BlendFactor::ZERO,
            BlendFactor::One => vk::BlendFactor::ONE,
            BlendFactor::Src => vk::BlendFactor::SRC_COLOR,
            BlendFactor::OneMinusSrc => vk::BlendFactor::ONE_MINUS_SRC_COLOR,
            BlendFactor::SrcAlpha => vk::BlendFactor::SRC_ALPHA,
            BlendFactor::OneMinusSrcAlpha => vk::BlendFactor::ONE_MINUS_SRC_ALPHA,
            BlendFactor::Dst => vk::BlendFactor::DST_COLOR,
            BlendFactor::OneMinusDst => vk::BlendFactor::ONE_MINUS_DST_COLOR,
            BlendFactor::DstAlpha => vk::BlendFactor::DST_ALPHA,
            BlendFactor::OneMinusDstAlpha => vk::BlendFactor::ONE_MINUS_DST_ALPHA,
            BlendFactor::ConstantColor => vk::BlendFactor::CONSTANT_COLOR,
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum BlendOperation {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

impl BlendOperation {
    fn to_vk(self) -> vk::BlendOp {
        match self {
            BlendOperation::Add => vk::BlendOp::ADD,
            BlendOperation::Subtract => vk::BlendOp::SUBTRACT,
            BlendOperation::ReverseSubtract => vk::BlendOp::REVERSE_SUBTRACT,
            BlendOperation::Min => vk::BlendOp::MIN,
            BlendOperation::Max => vk::BlendOp::MAX,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct BlendComponent {
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub operation: BlendOperation,
}

impl BlendComponent {
    pub const REPLACE: BlendComponent = BlendComponent {
        src_factor: BlendFactor::One,
        dst_factor: BlendFactor::Zero,
        operation: BlendOperation::Add,
    };
}

#[derive(Copy, Clone, Debug)]
pub struct BlendState {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

impl BlendState {
    pub const ALPHA_BLENDING: BlendState = BlendState {
        color: BlendComponent {
            src_factor: BlendFactor::SrcAlpha,
            dst_factor: BlendFactor::OneMinusSrcAlpha,
            operation: BlendOperation::Add,
        },
        alpha: BlendComponent {
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::OneMinusSrcAlpha,
            operation: BlendOperation::Add,
        },
    };
}

#[derive(Copy, Clone, Debug)]
pub struct ColorTargetState {
    pub format: TextureFormat,
    pub blend: Option<BlendState>,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StencilOperation {
    Keep,
    Zero,
    Replace,
    Invert,
    IncrementClamp,
    DecrementClamp,
    IncrementWrap,
    DecrementWrap,
}

impl StencilOperation {
    fn to_vk(self) -> vk::StencilOp {
        match self {
            StencilOperation::Keep => vk::StencilOp::KEEP,
            StencilOperation::Zero => vk::StencilOp::ZERO,
            StencilOperation::Replace => vk::StencilOp::REPLACE,
            StencilOperation::Invert => vk::StencilOp::INVERT,
            StencilOperation::IncrementClamp => vk::StencilOp::INCREMENT_AND_CLAMP,
            StencilOperation::DecrementClamp => vk::StencilOp::DECREMENT_AND_CLAMP,
            StencilOperation::IncrementWrap => vk::StencilOp::INCREMENT_AND_WRAP,
            StencilOperation::DecrementWrap => vk::StencilOp::DECREMENT_AND_WRAP,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct StencilFaceState {
    pub compare: CompareFunction,
    pub fail_op: StencilOperation,
    pub depth_fail_op: StencilOperation,
    pub pass_op: StencilOperation,
}

impl StencilFaceState {
    pub const IGNORE: StencilFaceState = StencilFaceState {
        compare: CompareFunction::Always,
        fail_op: StencilOperation::Keep,
        depth_fail_op: StencilOperation::Keep,
        pass_op: StencilOperation::Keep,
    };

    fn to_vk(self, read_mask: u32, write_mask: u32) -> vk::StencilOpState {
        vk::StencilOpState {
            fail_op: self.fail_op.to_vk(),
            pass_op: self.pass_op.to_vk(),
            depth_fail_op: self.depth_fail_op.to_vk(),
            compare_op: vk_compare_op(self.compare),
            compare_mask: read_mask,
            write_mask,
            // Set dynamically.
            reference: 0,
        }
    }
}

#[derive(Copy, Clone, Debug)]
pub struct DepthStencilState {
    pub format: TextureFormat,
    pub depth_write_enabled: bool,
    pub depth_compare: CompareFunction,
    pub stencil_front: StencilFaceState,
    pub stencil_back: StencilFaceState,
    pub stencil_read_mask: u32,
    pub stencil_write_mask: u32,
}

#[derive(Clone, Debug)]
pub struct RenderPipelineDesc<'a> {
    pub label: &'a str,
    pub layout: &'a Arc<PipelineLayout>,
    pub vertex_shader: &'a Arc<ShaderModule>,
    pub vertex_buffers: &'a [VertexBufferLayout<'a>],
    pub fragment_shader: Option<&'a Arc<ShaderModule>>,
    pub topology: PrimitiveTopology,
    pub front_face: FrontFace,
    pub cull_mode: CullMode,
    pub polygon_mode: PolygonMode,
    pub color_targets: &'a [ColorTargetState],
    pub depth_stencil: Option<DepthStencilState>,
    pub sample_count: u32,
}

/// A graphics pipeline built for dynamic rendering; viewport, scissor, blend
/// constants and stencil reference are dynamic state.
pub struct RenderPipeline {
    device: Arc<DeviceShared>,
    label: String,
    handle: vk::Pipeline,
    layout: Arc<PipelineLayout>,
}

impl RenderPipeline {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        desc: &RenderPipelineDesc,
    ) -> Result<Arc<RenderPipeline>, Error> {
        device.check_not_lost()?;
        if desc.color_targets.is_empty() && desc.depth_stencil.is_none() {
            return Err(validation_error!(
                "render pipeline `{}`: needs at least one color target or a depth attachment",
                desc.label
            ));
        }

        let mut stages = Vec::with_capacity(2);
        stages.push(vk::PipelineShaderStageCreateInfo {
            stage: vk::ShaderStageFlags::VERTEX,
            module: desc.vertex_shader.handle(),
            p_name: desc.vertex_shader.entry_point().as_ptr(),
            ..Default::default()
        });
        if let Some(fragment) = desc.fragment_shader {
            stages.push(vk::PipelineShaderStageCreateInfo {
                stage: vk::ShaderStageFlags::FRAGMENT,
                module: fragment.handle(),
                p_name: fragment.entry_point().as_ptr(),
                ..Default::default()
            });
        }

        let mut vertex_bindings = Vec::with_capacity(desc.vertex_buffers.len());
        let mut vertex_attributes = Vec::new();
        for (slot, layout) in desc.vertex_buffers.iter().enumerate() {
            vertex_bindings.push(vk::VertexInputBindingDescription {
                binding: slot as u32,
                stride: layout.array_stride as u32,
                input_rate: match layout.step_mode {
                    VertexStepMode::Vertex => vk::VertexInputRate::VERTEX,
                    VertexStepMode::Instance => vk::VertexInputRate::INSTANCE,
                },
            });
            for attribute in layout.attributes {
                vertex_attributes.push(vk::VertexInputAttributeDescription {
                    location: attribute.shader_location,
                    binding: slot as u32,
                    format: attribute.format.to_vk(),
                    offset: attribute.offset,
                });
            }
        }
        let vertex_input = vk::PipelineVertexInputStateCreateInfo {
            vertex_binding_description_count: vertex_bindings.len() as u32,
            p_vertex_binding_descriptions: vertex_bindings.as_ptr(),
            vertex_attribute_description_count: vertex_attributes.len() as u32,
            p_vertex_attribute_descriptions: vertex_attributes.as_ptr(),
            ..Default::default()
        };

        let input_assembly = vk::PipelineInputAssemblyStateCreateInfo {
            topology: match desc.topology {
                PrimitiveTopology::PointList => vk::PrimitiveTopology::POINT_LIST,
                PrimitiveTopology::LineList => vk::PrimitiveTopology::LINE_LIST,
                PrimitiveTopology::LineStrip => vk::PrimitiveTopology::LINE_STRIP,
                PrimitiveTopology::TriangleList => vk::PrimitiveTopology::TRIANGLE_LIST,
                PrimitiveTopology::TriangleStrip => vk::PrimitiveTopology::TRIANGLE_STRIP,
            },
            primitive_restart_enable: vk::FALSE,
            ..Default::default()
        };

        // Viewport and scissor are dynamic; only the counts matter here.
        let viewport_state = vk::PipelineViewportStateCreateInfo {
            viewport_count: 1,
            scissor_count: 1,
            ..Default::default()
        };

        let rasterization = vk::PipelineRasterizationStateCreateInfo {
            polygon_mode: match desc.polygon_mode {
                PolygonMode::Fill => vk::PolygonMode::FILL,
                PolygonMode::Line => vk::PolygonMode::LINE,
            },
            cull_mode: match desc.cull_mode {
                CullMode::None => vk::CullModeFlags::NONE,
                CullMode::Front => vk::CullModeFlags::FRONT,
                CullMode::Back => vk::CullModeFlags::BACK,
            },
            front_face: match desc.front_face {
                FrontFace::Ccw => vk::FrontFace::COUNTER_CLOCKWISE,
                FrontFace::Cw => vk::FrontFace::CLOCKWISE,
            },
            line_width: 1.0,
            ..Default::default()
        };

        let multisample = vk::PipelineMultisampleStateCreateInfo {
            rasterization_samples: vk_sample_count(desc.sample_count),
            ..Default::default()
        };

        let depth_stencil = match &desc.depth_stencil {
            Some(ds) => vk::PipelineDepthStencilStateCreateInfo {
                depth_test_enable: vk::TRUE,
                depth_write_enable: ds.depth_write_enabled as u32,
                depth_compare_op: vk_compare_op(ds.depth_compare),
                stencil_test_enable: (ds.stencil_front.compare != CompareFunction::Always
                    || ds.stencil_back.compare != CompareFunction::Always
                    || ds.stencil_front.pass_op != StencilOperation::Keep
                    || ds.stencil_back.pass_op != StencilOperation::Keep)
                    as u32,
                front: ds
                    .stencil_front
                    .to_vk(ds.stencil_read_mask, ds.stencil_write_mask),
                back: ds
                    .stencil_back
                    .to_vk(ds.stencil_read_mask, ds.stencil_write_mask),
                ..Default::default()
            },
            None => Default::default(),
        };

        let blend_attachments: Vec<vk::PipelineColorBlendAttachmentState> = desc
            .color_targets
            .iter()
            .map(|target| match &target.blend {
                Some(blend) => vk::PipelineColorBlendAttachmentState {
                    blend_enable: vk::TRUE,
                    src_color_blend_factor: blend.color.src_factor.to_vk(),
                    dst_color_blend_factor: blend.color.dst_factor.to_vk(),
                    color_blend_op: blend.color.operation.to_vk(),
                    src_alpha_blend_factor: blend.alpha.src_factor.to_vk(),
                    dst_alpha_blend_factor: blend.alpha.dst_factor.to_vk(),
                    alpha_blend_op: blend.alpha.operation.to_vk(),
                    color_write_mask: vk::ColorComponentFlags::RGBA,
                },
                None => vk::PipelineColorBlendAttachmentState {
                    blend_enable: vk::FALSE,
                    color_write_mask: vk::ColorComponentFlags::RGBA,
                    ..Default::default()
                },
            })
            .collect();
        let color_blend = vk::PipelineColorBlendStateCreateInfo {
            attachment_count: blend_attachments.len() as u32,
            p_attachments: blend_attachments.as_ptr(),
            ..Default::default()
        };

        let dynamic_states = [
            vk::DynamicState::VIEWPORT,
            vk::DynamicState::SCISSOR,
            vk::DynamicState::BLEND_CONSTANTS,
            vk::DynamicState::STENCIL_REFERENCE,
        ];
        let dynamic_state = vk::PipelineDynamicStateCreateInfo {
            dynamic_state_count: dynamic_states.len() as u32,
            p_dynamic_states: dynamic_states.as_ptr(),
            ..Default::default()
        };

        let color_formats: Vec<vk::Format> = desc
            .color_targets
            .iter()
            .map(|t| t.format.to_vk())
            .collect();
        let (depth_format, stencil_format) = match &desc.depth_stencil {
            Some(ds) => {
                let info = ds.format.info();
                (
                    if info.has_depth() {
                        ds.format.to_vk()
                    } else {
                        vk::Format::UNDEFINED
                    },
                    if info.has_stencil() {
                        ds.format.to_vk()
                    } else {
                        vk::Format::UNDEFINED
                    },
                )
            }
            None => (vk::Format::UNDEFINED, vk::Format::UNDEFINED),
        };
        let mut rendering_info = vk::PipelineRenderingCreateInfo {
            color_attachment_count: color_formats.len() as u32,
            p_color_attachment_formats: color_formats.as_ptr(),
            depth_attachment_format: depth_format,
            stencil_attachment_format: stencil_format,
            ..Default::default()
        };

        let create_info = vk::GraphicsPipelineCreateInfo {
            p_next: &mut rendering_info as *mut _ as *const std::ffi::c_void,
            stage_count: stages.len() as u32,
            p_stages: stages.as_ptr(),
            p_vertex_input_state: &vertex_input,
            p_input_assembly_state: &input_assembly,
            p_viewport_state: &viewport_state,
            p_rasterization_state: &rasterization,
            p_multisample_state: &multisample,
            p_depth_stencil_state: &depth_stencil,
            p_color_blend_state: &color_blend,
            p_dynamic_state: &dynamic_state,
            layout: desc.layout.handle(),
            ..Default::default()
        };

        let handle = unsafe {
            device
                .raw
                .create_graphics_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, err)| Error::from(err))?[0]
        };
        device.set_debug_name(
            vk::ObjectType::PIPELINE,
            vk::Handle::as_raw(handle),
            desc.label,
        );

        Ok(Arc::new(RenderPipeline {
            device: device.clone(),
            label: desc.label.to_string(),
            handle,
            layout: desc.layout.clone(),
        }))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    pub(crate) fn handle(&self) -> vk::Pipeline {
        self.handle
    }
}

impl Drop for RenderPipeline {
    fn drop(&mut self) {
        // Render pipelines only ever execute on the graphics queue.
        if let Some(queue) = self.device.queue_shared(QueueType::Graphics) {
            queue
                .deleter
                .lock()
                .unwrap()
                .delete_pipeline_when_unused(queue.pending_submit_serial(), self.handle);
        }
    }
}

impl std::fmt::Debug for RenderPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("RenderPipeline")
            .field("label", &self.label)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub struct ComputePipelineDesc<'a> {
    pub label: &'a str,
    pub layout: &'a Arc<PipelineLayout>,
    pub shader: &'a Arc<ShaderModule>,
}

/// A compute pipeline. Dispatches may run on the graphics or the compute
/// queue, so destruction is refcounted across the queues that executed it.
pub struct ComputePipeline {
    device: Arc<DeviceShared>,
    label: String,
    handle: vk::Pipeline,
    layout: Arc<PipelineLayout>,
    used_in_queues: [AtomicBool; 2],
    retired: Mutex<bool>,
}

impl ComputePipeline {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        desc: &ComputePipelineDesc,
    ) -> Result<Arc<ComputePipeline>, Error> {
        device.check_not_lost()?;

        let stage = vk::PipelineShaderStageCreateInfo {
            stage: vk::ShaderStageFlags::COMPUTE,
            module: desc.shader.handle(),
            p_name: desc.shader.entry_point().as_ptr(),
            ..Default::default()
        };
        let create_info = vk::ComputePipelineCreateInfo {
            stage,
            layout: desc.layout.handle(),
            ..Default::default()
        };
        let handle = unsafe {
            device
                .raw
                .create_compute_pipelines(vk::PipelineCache::null(), &[create_info], None)
                .map_err(|(_, err)| Error::from(err))?[0]
        };
        device.set_debug_name(
            vk::ObjectType::PIPELINE,
            vk::Handle::as_raw(handle),
            desc.label,
        );

        Ok(Arc::new(ComputePipeline {
            device: device.clone(),
            label: desc.label.to_string(),
            handle,
            layout: desc.layout.clone(),
            used_in_queues: Default::default(),
            retired: Mutex::new(false),
        }))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn layout(&self) -> &Arc<PipelineLayout> {
        &self.layout
    }

    pub(crate) fn handle(&self) -> vk::Pipeline {
        self.handle
    }

    pub(crate) fn mark_used_in_queue(&self, queue_type: QueueType) {
        if queue_type.index() < 2 {
            self.used_in_queues[queue_type.index()].store(true, Ordering::Relaxed);
        }
    }
}

impl Drop for ComputePipeline {
    fn drop(&mut self) {
        let mut retired = self.retired.lock().unwrap();
        if *retired {
            return;
        }
        *retired = true;

        let entry = Arc::new(PipelineHandle {
            handle: self.handle,
        });
        let mut enqueued = false;
        for queue_type in [QueueType::Graphics, QueueType::Compute] {
            if !self.used_in_queues[queue_type.index()].load(Ordering::Relaxed) {
                continue;
            }
            if let Some(queue) = self.device.queue_shared(queue_type) {
                queue
                    .deleter
                    .lock()
                    .unwrap()
                    .delete_shared_pipeline_when_unused(queue.pending_submit_serial(), entry.clone());
                enqueued = true;
            }
        }
        if !enqueued {
            if let Some(queue) = self.device.queue_shared(QueueType::Graphics) {
                queue
                    .deleter
                    .lock()
                    .unwrap()
                    .delete_shared_pipeline_when_unused(queue.pending_submit_serial(), entry);
            }
        }
    }
}

impl std::fmt::Debug for ComputePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ComputePipeline")
            .field("label", &self.label)
            .finish()
    }
}
