//! Command encoding and replay.
//!
//! An encoder records commands into an in-memory stream; nothing touches the
//! GPU until the list is submitted. On submit each command is replayed
//! against the target queue's record context: it first transitions every
//! referenced resource into the usage the command implies, flushes the
//! resulting barriers, and only then emits the actual GPU command. Dynamic
//! rendering must be suspended around barriers, so the replayer ends the
//! rendering scope before flushing and lazily re-begins it at the next draw.

use std::ffi::CString;
use std::sync::Arc;

use ash::vk;

use crate::bind_set::BindSet;
use crate::buffer::Buffer;
use crate::device::DeviceShared;
use crate::error::{validation_error, Error};
use crate::format::vk_aspect_flags;
use crate::pipeline::{ComputePipeline, RenderPipeline, MAX_BIND_SETS};
use crate::queue::{QueueInner, QueueShared};
use crate::texture::{TextureSlice, TextureView};
use crate::types::{
    BufferUsage, Extent3d, IndexFormat, QueueType, Rect, ShaderStages, TextureDataLayout,
    TextureDimension, TextureUsage, Viewport,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum LoadOp {
    Load,
    Clear,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StoreOp {
    Store,
    Discard,
}

#[derive(Clone, Debug)]
pub struct RenderPassColorAttachment {
    pub view: Arc<TextureView>,
    pub load_op: LoadOp,
    pub store_op: StoreOp,
    pub clear_color: [f32; 4],
}

#[derive(Clone, Debug)]
pub struct RenderPassDepthStencilAttachment {
    pub view: Arc<TextureView>,
    pub depth_load_op: LoadOp,
    pub depth_store_op: StoreOp,
    pub clear_depth: f32,
    pub stencil_load_op: LoadOp,
    pub stencil_store_op: StoreOp,
    pub clear_stencil: u32,
}

#[derive(Clone, Debug, Default)]
pub struct RenderPassDesc {
    pub color_attachments: Vec<RenderPassColorAttachment>,
    pub depth_stencil_attachment: Option<RenderPassDepthStencilAttachment>,
}

#[derive(Clone, Debug)]
pub(crate) enum Command {
    CopyBufferToBuffer {
        src: Arc<Buffer>,
        src_offset: u64,
        dst: Arc<Buffer>,
        dst_offset: u64,
        size: u64,
    },
    CopyBufferToTexture {
        src: Arc<Buffer>,
        layout: TextureDataLayout,
        dst: TextureSlice,
    },
    CopyTextureToBuffer {
        src: TextureSlice,
        dst: Arc<Buffer>,
        layout: TextureDataLayout,
    },
    CopyTextureToTexture {
        src: TextureSlice,
        dst: TextureSlice,
    },
    ClearBuffer {
        buffer: Arc<Buffer>,
        value: u32,
        offset: u64,
        size: u64,
    },
    BeginRenderPass {
        desc: RenderPassDesc,
    },
    EndRenderPass,
    BeginComputePass,
    EndComputePass,
    SetRenderPipeline {
        pipeline: Arc<RenderPipeline>,
    },
    SetComputePipeline {
        pipeline: Arc<ComputePipeline>,
    },
    SetBindSet {
        index: u32,
        set: Arc<BindSet>,
        dynamic_offsets: Vec<u32>,
    },
    SetVertexBuffers {
        first_slot: u32,
        buffers: Vec<(Arc<Buffer>, u64)>,
    },
    SetIndexBuffer {
        buffer: Arc<Buffer>,
        format: IndexFormat,
        offset: u64,
    },
    SetViewport {
        viewport: Viewport,
    },
    SetScissor {
        rect: Rect,
    },
    SetStencilReference {
        reference: u32,
    },
    SetBlendConstant {
        color: [f32; 4],
    },
    SetPushConstant {
        stages: ShaderStages,
        offset: u32,
        data: Vec<u8>,
    },
    Draw {
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    },
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    },
    DrawIndirect {
        buffer: Arc<Buffer>,
        offset: u64,
    },
    DrawIndexedIndirect {
        buffer: Arc<Buffer>,
        offset: u64,
    },
    MultiDrawIndirect {
        buffer: Arc<Buffer>,
        offset: u64,
        max_draw_count: u32,
        count_buffer: Option<Arc<Buffer>>,
        count_offset: u64,
    },
    MultiDrawIndexedIndirect {
        buffer: Arc<Buffer>,
        offset: u64,
        max_draw_count: u32,
        count_buffer: Option<Arc<Buffer>>,
        count_offset: u64,
    },
    Dispatch {
        group_count_x: u32,
        group_count_y: u32,
        group_count_z: u32,
    },
    DispatchIndirect {
        buffer: Arc<Buffer>,
        offset: u64,
    },
    BeginDebugLabel {
        label: String,
        color: [f32; 4],
    },
    EndDebugLabel,
}

/// Records a stream of commands for later replay on a queue.
///
/// Recording itself never fails; invalid streams surface as errors at submit
/// or from the validation layer.
pub struct CommandEncoder {
    commands: Vec<Command>,
    inside_render_pass: bool,
    inside_compute_pass: bool,
}

impl CommandEncoder {
    pub(crate) fn new() -> CommandEncoder {
        CommandEncoder {
            commands: Vec::new(),
            inside_render_pass: false,
            inside_compute_pass: false,
        }
    }

    pub fn copy_buffer_to_buffer(
        &mut self,
        src: &Arc<Buffer>,
        src_offset: u64,
        dst: &Arc<Buffer>,
        dst_offset: u64,
        size: u64,
    ) {
        debug_assert!(!self.inside_render_pass && !self.inside_compute_pass);
        self.commands.push(Command::CopyBufferToBuffer {
            src: src.clone(),
            src_offset,
            dst: dst.clone(),
            dst_offset,
            size,
        });
    }

    pub fn copy_buffer_to_texture(
        &mut self,
        src: &Arc<Buffer>,
        layout: &TextureDataLayout,
        dst: &TextureSlice,
    ) {
        debug_assert!(!self.inside_render_pass && !self.inside_compute_pass);
        self.commands.push(Command::CopyBufferToTexture {
            src: src.clone(),
            layout: *layout,
            dst: dst.clone(),
        });
    }

    pub fn copy_texture_to_buffer(
        &mut self,
        src: &TextureSlice,
        dst: &Arc<Buffer>,
        layout: &TextureDataLayout,
    ) {
        debug_assert!(!self.inside_render_pass && !self.inside_compute_pass);
        self.commands.push(Command::CopyTextureToBuffer {
            src: src.clone(),
            dst: dst.clone(),
            layout: *layout,
        });
    }

    pub fn copy_texture_to_texture(&mut self, src: &TextureSlice, dst: &TextureSlice) {
        debug_assert!(!self.inside_render_pass && !self.inside_compute_pass);
        self.commands.push(Command::CopyTextureToTexture {
            src: src.clone(),
            dst: dst.clone(),
        });
    }

    pub fn clear_buffer(&mut self, buffer: &Arc<Buffer>, value: u32, offset: u64, size: u64) {
        debug_assert!(!self.inside_render_pass && !self.inside_compute_pass);
        self.commands.push(Command::ClearBuffer {
            buffer: buffer.clone(),
            value,
            offset,
            size,
        });
    }

    pub fn begin_render_pass(&mut self, desc: RenderPassDesc) {
        debug_assert!(!self.inside_render_pass && !self.inside_compute_pass);
        self.inside_render_pass = true;
        self.commands.push(Command::BeginRenderPass { desc });
    }

    pub fn end_render_pass(&mut self) {
        debug_assert!(self.inside_render_pass);
        self.inside_render_pass = false;
        self.commands.push(Command::EndRenderPass);
    }

    pub fn begin_compute_pass(&mut self) {
        debug_assert!(!self.inside_render_pass && !self.inside_compute_pass);
        self.inside_compute_pass = true;
        self.commands.push(Command::BeginComputePass);
    }

    pub fn end_compute_pass(&mut self) {
        debug_assert!(self.inside_compute_pass);
        self.inside_compute_pass = false;
        self.commands.push(Command::EndComputePass);
    }

    pub fn set_render_pipeline(&mut self, pipeline: &Arc<RenderPipeline>) {
        self.commands.push(Command::SetRenderPipeline {
            pipeline: pipeline.clone(),
        });
    }

    pub fn set_compute_pipeline(&mut self, pipeline: &Arc<ComputePipeline>) {
        self.commands.push(Command::SetComputePipeline {
            pipeline: pipeline.clone(),
        });
    }

    pub fn set_bind_set(&mut self, index: u32, set: &Arc<BindSet>, dynamic_offsets: &[u32]) {
        self.commands.push(Command::SetBindSet {
            index,
            set: set.clone(),
            dynamic_offsets: dynamic_offsets.to_vec(),
        });
    }

    pub fn set_vertex_buffers(&mut self, first_slot: u32, buffers: &[(Arc<Buffer>, u64)]) {
        self.commands.push(Command::SetVertexBuffers {
            first_slot,
            buffers: buffers.to_vec(),
        });
    }

    pub fn set_index_buffer(&mut self, buffer: &Arc<Buffer>, format: IndexFormat, offset: u64) {
        self.commands.push(Command::SetIndexBuffer {
            buffer: buffer.clone(),
            format,
            offset,
        });
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.commands.push(Command::SetViewport { viewport });
    }

    pub fn set_scissor(&mut self, rect: Rect) {
        self.commands.push(Command::SetScissor { rect });
    }

    pub fn set_stencil_reference(&mut self, reference: u32) {
        self.commands.push(Command::SetStencilReference { reference });
    }

    pub fn set_blend_constant(&mut self, color: [f32; 4]) {
        self.commands.push(Command::SetBlendConstant { color });
    }

    pub fn set_push_constant(&mut self, stages: ShaderStages, offset: u32, data: &[u8]) {
        self.commands.push(Command::SetPushConstant {
            stages,
            offset,
            data: data.to_vec(),
        });
    }

    pub fn draw(
        &mut self,
        vertex_count: u32,
        instance_count: u32,
        first_vertex: u32,
        first_instance: u32,
    ) {
        debug_assert!(self.inside_render_pass);
        self.commands.push(Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        });
    }

    pub fn draw_indexed(
        &mut self,
        index_count: u32,
        instance_count: u32,
        first_index: u32,
        base_vertex: i32,
        first_instance: u32,
    ) {
        debug_assert!(self.inside_render_pass);
        self.commands.push(Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            base_vertex,
            first_instance,
        });
    }

    pub fn draw_indirect(&mut self, buffer: &Arc<Buffer>, offset: u64) {
        debug_assert!(self.inside_render_pass);
        self.commands.push(Command::DrawIndirect {
            buffer: buffer.clone(),
            offset,
        });
    }

    pub fn draw_indexed_indirect(&mut self, buffer: &Arc<Buffer>, offset: u64) {
        debug_assert!(self.inside_render_pass);
        self.commands.push(Command::DrawIndexedIndirect {
            buffer: buffer.clone(),
            offset,
        });
    }

    pub fn multi_draw_indirect(
        &mut self,
        buffer: &Arc<Buffer>,
        offset: u64,
        max_draw_count: u32,
        count_buffer: Option<&Arc<Buffer>>,
        count_offset: u64,
    ) {
        debug_assert!(self.inside_render_pass);
        self.commands.push(Command::MultiDrawIndirect {
            buffer: buffer.clone(),
            offset,
            max_draw_count,
            count_buffer: count_buffer.cloned(),
            count_offset,
        });
    }

    pub fn multi_draw_indexed_indirect(
        &mut self,
        buffer: &Arc<Buffer>,
        offset: u64,
        max_draw_count: u32,
        count_buffer: Option<&Arc<Buffer>>,
        count_offset: u64,
    ) {
        debug_assert!(self.inside_render_pass);
        self.commands.push(Command::MultiDrawIndexedIndirect {
            buffer: buffer.clone(),
            offset,
            max_draw_count,
            count_buffer: count_buffer.cloned(),
            count_offset,
        });
    }

    pub fn dispatch(&mut self, group_count_x: u32, group_count_y: u32, group_count_z: u32) {
        debug_assert!(self.inside_compute_pass);
        self.commands.push(Command::Dispatch {
            group_count_x,
            group_count_y,
            group_count_z,
        });
    }

    pub fn dispatch_indirect(&mut self, buffer: &Arc<Buffer>, offset: u64) {
        debug_assert!(self.inside_compute_pass);
        self.commands.push(Command::DispatchIndirect {
            buffer: buffer.clone(),
            offset,
        });
    }

    pub fn begin_debug_label(&mut self, label: &str, color: [f32; 4]) {
        self.commands.push(Command::BeginDebugLabel {
            label: label.to_string(),
            color,
        });
    }

    pub fn end_debug_label(&mut self) {
        self.commands.push(Command::EndDebugLabel);
    }

    /// Converts the recorded stream into an immutable, replayable list.
    pub fn finish(mut self) -> CommandList {
        debug_assert!(
            !self.inside_render_pass && !self.inside_compute_pass,
            "finish() called with an open pass"
        );
        self.commands.shrink_to_fit();
        CommandList {
            commands: self.commands,
        }
    }

    #[cfg(test)]
    pub(crate) fn command_count(&self) -> usize {
        self.commands.len()
    }
}

/// An immutable recorded command stream. Replayable: every submission acts as
/// a fresh use of the referenced resources.
pub struct CommandList {
    pub(crate) commands: Vec<Command>,
}

impl CommandList {
    pub fn command_count(&self) -> usize {
        self.commands.len()
    }
}

impl std::fmt::Debug for CommandList {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("CommandList")
            .field("commands", &self.commands.len())
            .finish()
    }
}

#[derive(Default)]
struct BoundVertexBuffers {
    first_slot: u32,
    buffers: Vec<(Arc<Buffer>, u64)>,
}

/// Mutable state of one replay walk.
struct ReplayState<'a> {
    render_pass: Option<&'a RenderPassDesc>,
    rendering_started: bool,
    /// Whether the current pass already loaded/cleared its attachments once;
    /// re-begins after a mid-pass barrier must preserve contents.
    pass_began_once: bool,
    pipeline: Option<&'a Arc<RenderPipeline>>,
    pipeline_dirty: bool,
    compute_pipeline: Option<&'a Arc<ComputePipeline>>,
    compute_pipeline_dirty: bool,
    bind_sets: [Option<(&'a Arc<BindSet>, &'a [u32])>; MAX_BIND_SETS],
    bind_sets_dirty: u32,
    vertex_buffers: Option<BoundVertexBuffers>,
    vertex_buffers_dirty: bool,
    index_buffer: Option<(&'a Arc<Buffer>, IndexFormat, u64)>,
    index_buffer_dirty: bool,
}

impl<'a> ReplayState<'a> {
    fn new() -> ReplayState<'a> {
        ReplayState {
            render_pass: None,
            rendering_started: false,
            pass_began_once: false,
            pipeline: None,
            pipeline_dirty: false,
            compute_pipeline: None,
            compute_pipeline_dirty: false,
            bind_sets: Default::default(),
            bind_sets_dirty: 0,
            vertex_buffers: None,
            vertex_buffers_dirty: false,
            index_buffer: None,
            index_buffer_dirty: false,
        }
    }

    fn reset_bindings(&mut self) {
        self.pipeline = None;
        self.pipeline_dirty = false;
        self.compute_pipeline = None;
        self.compute_pipeline_dirty = false;
        self.bind_sets = Default::default();
        self.bind_sets_dirty = 0;
        self.vertex_buffers = None;
        self.vertex_buffers_dirty = false;
        self.index_buffer = None;
        self.index_buffer_dirty = false;
    }
}

fn vk_load_op(op: LoadOp) -> vk::AttachmentLoadOp {
    match op {
        LoadOp::Load => vk::AttachmentLoadOp::LOAD,
        LoadOp::Clear => vk::AttachmentLoadOp::CLEAR,
    }
}

fn vk_store_op(op: StoreOp) -> vk::AttachmentStoreOp {
    match op {
        StoreOp::Store => vk::AttachmentStoreOp::STORE,
        StoreOp::Discard => vk::AttachmentStoreOp::DONT_CARE,
    }
}

fn buffer_image_copy(
    slice: &TextureSlice,
    layout: &TextureDataLayout,
) -> vk::BufferImageCopy {
    let info = slice.texture.format().info();
    let (base_array_layer, layer_count) = slice.layers();
    let is_3d = slice.texture.dimension() == TextureDimension::D3;
    vk::BufferImageCopy {
        buffer_offset: layout.offset,
        // Vulkan wants texels, not bytes; zero keeps the tightly packed
        // interpretation.
        buffer_row_length: if layout.bytes_per_row == 0 {
            0
        } else {
            layout.bytes_per_row / info.bytes_per_block * info.block_size
        },
        buffer_image_height: if layout.rows_per_image == 0 {
            0
        } else {
            layout.rows_per_image * info.block_size
        },
        image_subresource: vk::ImageSubresourceLayers {
            aspect_mask: vk_aspect_flags(slice.aspects()),
            mip_level: slice.mip_level,
            base_array_layer,
            layer_count,
        },
        image_offset: vk::Offset3D {
            x: slice.origin.x as i32,
            y: slice.origin.y as i32,
            z: if is_3d { slice.origin.z as i32 } else { 0 },
        },
        image_extent: vk::Extent3D {
            width: slice.size.width,
            height: slice.size.height,
            depth: if is_3d {
                slice.size.depth_or_array_layers
            } else {
                1
            },
        },
    }
}

fn attachment_extent(view: &TextureView) -> Extent3d {
    let mip = view.subresource_range().base_mip_level;
    Extent3d {
        width: (view.texture().width() >> mip).max(1),
        height: (view.texture().height() >> mip).max(1),
        depth_or_array_layers: view.subresource_range().layer_count,
    }
}

/// Replays a command list onto `queue`'s pending record context.
pub(crate) fn replay(
    list: &CommandList,
    device: &Arc<DeviceShared>,
    queue: &QueueShared,
    inner: &mut QueueInner,
) -> Result<(), Error> {
    let queue_type = queue.queue_type;
    let mut state = ReplayState::new();

    if !list.commands.is_empty() {
        inner.record.needs_submit = true;
    }

    for command in &list.commands {
        replay_command(command, device, queue_type, inner, &mut state)?;
    }

    debug_assert!(!state.rendering_started);
    Ok(())
}

fn end_rendering(device: &DeviceShared, inner: &mut QueueInner, state: &mut ReplayState) {
    if state.rendering_started {
        unsafe {
            device.raw.cmd_end_rendering(inner.record.command_buffer);
        }
        state.rendering_started = false;
    }
}

/// Flushes pending barriers; dynamic rendering is suspended first since
/// barriers must not be recorded inside a rendering scope.
fn flush_barriers(device: &DeviceShared, inner: &mut QueueInner, state: &mut ReplayState) {
    if inner.record.buffer_barriers.is_empty() && inner.record.image_barriers.is_empty() {
        return;
    }
    end_rendering(device, inner, state);
    inner.record.emit_barriers(&device.raw);
}

fn begin_rendering_if_needed(
    device: &DeviceShared,
    inner: &mut QueueInner,
    state: &mut ReplayState,
) {
    if state.rendering_started {
        return;
    }
    let desc = state
        .render_pass
        .expect("draw recorded outside a render pass");

    // After the first begin of this pass, attachment contents must survive
    // the suspension, whatever the original load op said.
    let reload = state.pass_began_once;

    let mut color_attachments = Vec::with_capacity(desc.color_attachments.len());
    for attachment in &desc.color_attachments {
        color_attachments.push(vk::RenderingAttachmentInfo {
            image_view: attachment.view.handle(),
            image_layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
            load_op: if reload {
                vk::AttachmentLoadOp::LOAD
            } else {
                vk_load_op(attachment.load_op)
            },
            store_op: vk_store_op(attachment.store_op),
            clear_value: vk::ClearValue {
                color: vk::ClearColorValue {
                    float32: attachment.clear_color,
                },
            },
            ..Default::default()
        });
    }

    let depth_attachment;
    let stencil_attachment;
    let mut p_depth: *const vk::RenderingAttachmentInfo = std::ptr::null();
    let mut p_stencil: *const vk::RenderingAttachmentInfo = std::ptr::null();
    if let Some(ds) = &desc.depth_stencil_attachment {
        let format_info = ds.view.format().info();
        if format_info.has_depth() {
            depth_attachment = vk::RenderingAttachmentInfo {
                image_view: ds.view.handle(),
                image_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                load_op: if reload {
                    vk::AttachmentLoadOp::LOAD
                } else {
                    vk_load_op(ds.depth_load_op)
                },
                store_op: vk_store_op(ds.depth_store_op),
                clear_value: vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: ds.clear_depth,
                        stencil: ds.clear_stencil,
                    },
                },
                ..Default::default()
            };
            p_depth = &depth_attachment;
        }
        if format_info.has_stencil() {
            stencil_attachment = vk::RenderingAttachmentInfo {
                image_view: ds.view.handle(),
                image_layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
                load_op: if reload {
                    vk::AttachmentLoadOp::LOAD
                } else {
                    vk_load_op(ds.stencil_load_op)
                },
                store_op: vk_store_op(ds.stencil_store_op),
                clear_value: vk::ClearValue {
                    depth_stencil: vk::ClearDepthStencilValue {
                        depth: ds.clear_depth,
                        stencil: ds.clear_stencil,
                    },
                },
                ..Default::default()
            };
            p_stencil = &stencil_attachment;
        }
    }

    let extent = desc
        .color_attachments
        .first()
        .map(|a| attachment_extent(&a.view))
        .or_else(|| {
            desc.depth_stencil_attachment
                .as_ref()
                .map(|ds| attachment_extent(&ds.view))
        })
        .expect("render pass with no attachments");

    let rendering_info = vk::RenderingInfo {
        render_area: vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent: vk::Extent2D {
                width: extent.width,
                height: extent.height,
            },
        },
        layer_count: extent.depth_or_array_layers,
        color_attachment_count: color_attachments.len() as u32,
        p_color_attachments: color_attachments.as_ptr(),
        p_depth_attachment: p_depth,
        p_stencil_attachment: p_stencil,
        ..Default::default()
    };
    unsafe {
        device
            .raw
            .cmd_begin_rendering(inner.record.command_buffer, &rendering_info);
    }
    state.rendering_started = true;
    state.pass_began_once = true;
}

/// Transitions everything a draw consumes and re-binds whatever changed since
/// the last draw.
fn prepare_draw(
    device: &DeviceShared,
    queue_type: QueueType,
    inner: &mut QueueInner,
    state: &mut ReplayState,
    indirect_buffer: Option<&Arc<Buffer>>,
    needs_index_buffer: bool,
) -> Result<(), Error> {
    let pipeline = *state
        .pipeline
        .as_ref()
        .ok_or_else(|| validation_error!("draw without a bound render pipeline"))?;
    if needs_index_buffer && state.index_buffer.is_none() {
        return Err(validation_error!("indexed draw without an index buffer"));
    }

    // Resource transitions for everything newly bound.
    let mut dirty = state.bind_sets_dirty;
    while dirty != 0 {
        let index = dirty.trailing_zeros() as usize;
        dirty &= dirty - 1;
        if let Some((set, _)) = state.bind_sets[index] {
            set.track_resources(queue_type, &mut inner.record);
        }
    }
    if state.vertex_buffers_dirty {
        if let Some(bound) = &state.vertex_buffers {
            for (buffer, _) in &bound.buffers {
                buffer.track_usage(
                    queue_type,
                    &mut inner.record,
                    BufferUsage::VERTEX,
                    ShaderStages::empty(),
                );
            }
        }
    }
    if state.index_buffer_dirty {
        if let Some((buffer, _, _)) = state.index_buffer {
            buffer.track_usage(
                queue_type,
                &mut inner.record,
                BufferUsage::INDEX,
                ShaderStages::empty(),
            );
        }
    }
    if let Some(buffer) = indirect_buffer {
        buffer.track_usage(
            queue_type,
            &mut inner.record,
            BufferUsage::INDIRECT,
            ShaderStages::empty(),
        );
    }

    flush_barriers(device, inner, state);
    begin_rendering_if_needed(device, inner, state);

    let command_buffer = inner.record.command_buffer;
    unsafe {
        if state.pipeline_dirty {
            device.raw.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline.handle(),
            );
            state.pipeline_dirty = false;
        }
        let mut dirty = state.bind_sets_dirty;
        while dirty != 0 {
            let index = dirty.trailing_zeros() as usize;
            dirty &= dirty - 1;
            if let Some((set, dynamic_offsets)) = state.bind_sets[index] {
                set.mark_used_in_queue(queue_type);
                device.raw.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::GRAPHICS,
                    pipeline.layout().handle(),
                    index as u32,
                    &[set.handle()],
                    dynamic_offsets,
                );
            }
        }
        state.bind_sets_dirty = 0;
        if state.vertex_buffers_dirty {
            if let Some(bound) = &state.vertex_buffers {
                let handles: Vec<vk::Buffer> =
                    bound.buffers.iter().map(|(b, _)| b.handle()).collect();
                let offsets: Vec<u64> = bound.buffers.iter().map(|&(_, o)| o).collect();
                device.raw.cmd_bind_vertex_buffers(
                    command_buffer,
                    bound.first_slot,
                    &handles,
                    &offsets,
                );
            }
            state.vertex_buffers_dirty = false;
        }
        if state.index_buffer_dirty {
            if let Some((buffer, format, offset)) = state.index_buffer {
                device.raw.cmd_bind_index_buffer(
                    command_buffer,
                    buffer.handle(),
                    offset,
                    match format {
                        IndexFormat::Uint16 => vk::IndexType::UINT16,
                        IndexFormat::Uint32 => vk::IndexType::UINT32,
                    },
                );
            }
            state.index_buffer_dirty = false;
        }
    }
    Ok(())
}

/// Transitions bound bind sets and re-binds compute state before a dispatch.
fn prepare_dispatch(
    device: &DeviceShared,
    queue_type: QueueType,
    inner: &mut QueueInner,
    state: &mut ReplayState,
    indirect_buffer: Option<&Arc<Buffer>>,
) -> Result<(), Error> {
    let pipeline = *state
        .compute_pipeline
        .as_ref()
        .ok_or_else(|| validation_error!("dispatch without a bound compute pipeline"))?;

    let mut dirty = state.bind_sets_dirty;
    while dirty != 0 {
        let index = dirty.trailing_zeros() as usize;
        dirty &= dirty - 1;
        if let Some((set, _)) = state.bind_sets[index] {
            set.track_resources(queue_type, &mut inner.record);
        }
    }
    if let Some(buffer) = indirect_buffer {
        buffer.track_usage(
            queue_type,
            &mut inner.record,
            BufferUsage::INDIRECT,
            ShaderStages::empty(),
        );
    }
    inner.record.emit_barriers(&device.raw);

    let command_buffer = inner.record.command_buffer;
    unsafe {
        if state.compute_pipeline_dirty {
            device.raw.cmd_bind_pipeline(
                command_buffer,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.handle(),
            );
            pipeline.mark_used_in_queue(queue_type);
            state.compute_pipeline_dirty = false;
        }
        let mut dirty = state.bind_sets_dirty;
        while dirty != 0 {
            let index = dirty.trailing_zeros() as usize;
            dirty &= dirty - 1;
            if let Some((set, dynamic_offsets)) = state.bind_sets[index] {
                set.mark_used_in_queue(queue_type);
                device.raw.cmd_bind_descriptor_sets(
                    command_buffer,
                    vk::PipelineBindPoint::COMPUTE,
                    pipeline.layout().handle(),
                    index as u32,
                    &[set.handle()],
                    dynamic_offsets,
                );
            }
        }
        state.bind_sets_dirty = 0;
    }
    Ok(())
}

fn replay_command<'a>(
    command: &'a Command,
    device: &Arc<DeviceShared>,
    queue_type: QueueType,
    inner: &mut QueueInner,
    state: &mut ReplayState<'a>,
) -> Result<(), Error> {
    match command {
        Command::CopyBufferToBuffer {
            src,
            src_offset,
            dst,
            dst_offset,
            size,
        } => {
            src.track_usage(
                queue_type,
                &mut inner.record,
                BufferUsage::COPY_SRC,
                ShaderStages::empty(),
            );
            dst.track_usage(
                queue_type,
                &mut inner.record,
                BufferUsage::COPY_DST,
                ShaderStages::empty(),
            );
            inner.record.emit_barriers(&device.raw);
            let region = vk::BufferCopy {
                src_offset: *src_offset,
                dst_offset: *dst_offset,
                size: *size,
            };
            unsafe {
                device.raw.cmd_copy_buffer(
                    inner.record.command_buffer,
                    src.handle(),
                    dst.handle(),
                    &[region],
                );
            }
        }
        Command::CopyBufferToTexture { src, layout, dst } => {
            src.track_usage(
                queue_type,
                &mut inner.record,
                BufferUsage::COPY_SRC,
                ShaderStages::empty(),
            );
            dst.texture.track_usage(
                queue_type,
                &mut inner.record,
                TextureUsage::COPY_DST,
                ShaderStages::empty(),
                &dst.subresource_range(),
            );
            inner.record.emit_barriers(&device.raw);
            let region = buffer_image_copy(dst, layout);
            unsafe {
                device.raw.cmd_copy_buffer_to_image(
                    inner.record.command_buffer,
                    src.handle(),
                    dst.texture.handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
        }
        Command::CopyTextureToBuffer { src, dst, layout } => {
            src.texture.track_usage(
                queue_type,
                &mut inner.record,
                TextureUsage::COPY_SRC,
                ShaderStages::empty(),
                &src.subresource_range(),
            );
            dst.track_usage(
                queue_type,
                &mut inner.record,
                BufferUsage::COPY_DST,
                ShaderStages::empty(),
            );
            inner.record.emit_barriers(&device.raw);
            let region = buffer_image_copy(src, layout);
            unsafe {
                device.raw.cmd_copy_image_to_buffer(
                    inner.record.command_buffer,
                    src.texture.handle(),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst.handle(),
                    &[region],
                );
            }
        }
        Command::CopyTextureToTexture { src, dst } => {
            src.texture.track_usage(
                queue_type,
                &mut inner.record,
                TextureUsage::COPY_SRC,
                ShaderStages::empty(),
                &src.subresource_range(),
            );
            dst.texture.track_usage(
                queue_type,
                &mut inner.record,
                TextureUsage::COPY_DST,
                ShaderStages::empty(),
                &dst.subresource_range(),
            );
            inner.record.emit_barriers(&device.raw);
            let (src_base_layer, src_layer_count) = src.layers();
            let (dst_base_layer, _) = dst.layers();
            let src_is_3d = src.texture.dimension() == TextureDimension::D3;
            let dst_is_3d = dst.texture.dimension() == TextureDimension::D3;
            let region = vk::ImageCopy {
                src_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk_aspect_flags(src.aspects()),
                    mip_level: src.mip_level,
                    base_array_layer: src_base_layer,
                    layer_count: src_layer_count,
                },
                src_offset: vk::Offset3D {
                    x: src.origin.x as i32,
                    y: src.origin.y as i32,
                    z: if src_is_3d { src.origin.z as i32 } else { 0 },
                },
                dst_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk_aspect_flags(dst.aspects()),
                    mip_level: dst.mip_level,
                    base_array_layer: dst_base_layer,
                    layer_count: src_layer_count,
                },
                dst_offset: vk::Offset3D {
                    x: dst.origin.x as i32,
                    y: dst.origin.y as i32,
                    z: if dst_is_3d { dst.origin.z as i32 } else { 0 },
                },
                extent: vk::Extent3D {
                    width: src.size.width,
                    height: src.size.height,
                    depth: if src_is_3d {
                        src.size.depth_or_array_layers
                    } else {
                        1
                    },
                },
            };
            unsafe {
                device.raw.cmd_copy_image(
                    inner.record.command_buffer,
                    src.texture.handle(),
                    vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
                    dst.texture.handle(),
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }
        }
        Command::ClearBuffer {
            buffer,
            value,
            offset,
            size,
        } => {
            buffer.track_usage(
                queue_type,
                &mut inner.record,
                BufferUsage::COPY_DST,
                ShaderStages::empty(),
            );
            inner.record.emit_barriers(&device.raw);
            unsafe {
                device.raw.cmd_fill_buffer(
                    inner.record.command_buffer,
                    buffer.handle(),
                    *offset,
                    *size,
                    *value,
                );
            }
        }
        Command::BeginRenderPass { desc } => {
            if queue_type != QueueType::Graphics {
                return Err(validation_error!(
                    "render passes may only run on the graphics queue"
                ));
            }
            state.reset_bindings();
            state.render_pass = Some(desc);
            state.pass_began_once = false;

            // Fuse the pass's attachment demands per texture, then transition
            // each texture with a single merge over its subresources.
            let mut demands: Vec<(
                Arc<crate::texture::Texture>,
                crate::subresource::SubresourceStorage<crate::texture::TextureSyncInfo>,
            )> = Vec::new();
            {
                let mut demand = |view: &Arc<TextureView>| {
                    let texture = view.texture();
                    let index = match demands.iter().position(|(t, _)| Arc::ptr_eq(t, texture)) {
                        Some(index) => index,
                        None => {
                            demands.push((
                                texture.clone(),
                                crate::subresource::SubresourceStorage::new(
                                    texture.format().info().aspects,
                                    texture.array_layer_count(),
                                    texture.mip_level_count(),
                                    crate::texture::TextureSyncInfo::UNUSED,
                                ),
                            ));
                            demands.len() - 1
                        }
                    };
                    demands[index].1.update(&view.subresource_range(), |_, info| {
                        *info = crate::texture::TextureSyncInfo {
                            usage: TextureUsage::RENDER_ATTACHMENT,
                            shader_stages: ShaderStages::empty(),
                            queue: None,
                        };
                    });
                };
                for attachment in &desc.color_attachments {
                    demand(&attachment.view);
                }
                if let Some(ds) = &desc.depth_stencil_attachment {
                    demand(&ds.view);
                }
            }
            for (texture, demand) in &demands {
                texture.transition_for_multi_range(queue_type, &mut inner.record, demand);
            }
            inner.record.emit_barriers(&device.raw);
        }
        Command::EndRenderPass => {
            // An empty pass must still load/clear its attachments.
            begin_rendering_if_needed(device, inner, state);
            end_rendering(device, inner, state);
            state.render_pass = None;
            state.reset_bindings();
        }
        Command::BeginComputePass => {
            if queue_type == QueueType::Transfer {
                return Err(validation_error!(
                    "compute passes may not run on the transfer queue"
                ));
            }
            state.reset_bindings();
        }
        Command::EndComputePass => {
            state.reset_bindings();
        }
        Command::SetRenderPipeline { pipeline } => {
            state.pipeline = Some(pipeline);
            state.pipeline_dirty = true;
        }
        Command::SetComputePipeline { pipeline } => {
            state.compute_pipeline = Some(pipeline);
            state.compute_pipeline_dirty = true;
        }
        Command::SetBindSet {
            index,
            set,
            dynamic_offsets,
        } => {
            let index = *index as usize;
            if index >= MAX_BIND_SETS {
                return Err(validation_error!("bind set index {} out of range", index));
            }
            state.bind_sets[index] = Some((set, dynamic_offsets.as_slice()));
            state.bind_sets_dirty |= 1 << index;
        }
        Command::SetVertexBuffers {
            first_slot,
            buffers,
        } => {
            state.vertex_buffers = Some(BoundVertexBuffers {
                first_slot: *first_slot,
                buffers: buffers.clone(),
            });
            state.vertex_buffers_dirty = true;
        }
        Command::SetIndexBuffer {
            buffer,
            format,
            offset,
        } => {
            state.index_buffer = Some((buffer, *format, *offset));
            state.index_buffer_dirty = true;
        }
        Command::SetViewport { viewport } => unsafe {
            device.raw.cmd_set_viewport(
                inner.record.command_buffer,
                0,
                &[vk::Viewport {
                    x: viewport.x,
                    y: viewport.y,
                    width: viewport.width,
                    height: viewport.height,
                    min_depth: viewport.min_depth,
                    max_depth: viewport.max_depth,
                }],
            );
        },
        Command::SetScissor { rect } => unsafe {
            device.raw.cmd_set_scissor(
                inner.record.command_buffer,
                0,
                &[vk::Rect2D {
                    offset: vk::Offset2D {
                        x: rect.x,
                        y: rect.y,
                    },
                    extent: vk::Extent2D {
                        width: rect.width,
                        height: rect.height,
                    },
                }],
            );
        },
        Command::SetStencilReference { reference } => unsafe {
            device.raw.cmd_set_stencil_reference(
                inner.record.command_buffer,
                vk::StencilFaceFlags::FRONT_AND_BACK,
                *reference,
            );
        },
        Command::SetBlendConstant { color } => unsafe {
            device
                .raw
                .cmd_set_blend_constants(inner.record.command_buffer, color);
        },
        Command::SetPushConstant {
            stages,
            offset,
            data,
        } => {
            let layout = if let Some(pipeline) = state.pipeline {
                pipeline.layout().handle()
            } else if let Some(pipeline) = state.compute_pipeline {
                pipeline.layout().handle()
            } else {
                return Err(validation_error!(
                    "push constants require a bound pipeline"
                ));
            };
            unsafe {
                device.raw.cmd_push_constants(
                    inner.record.command_buffer,
                    layout,
                    crate::bind_set::vk_shader_stage_flags(*stages),
                    *offset,
                    data,
                );
            }
        }
        Command::Draw {
            vertex_count,
            instance_count,
            first_vertex,
            first_instance,
        } => {
            prepare_draw(device, queue_type, inner, state, None, false)?;
            unsafe {
                device.raw.cmd_draw(
                    inner.record.command_buffer,
                    *vertex_count,
                    *instance_count,
                    *first_vertex,
                    *first_instance,
                );
            }
        }
        Command::DrawIndexed {
            index_count,
            instance_count,
            first_index,
            base_vertex,
            first_instance,
        } => {
            prepare_draw(device, queue_type, inner, state, None, true)?;
            unsafe {
                device.raw.cmd_draw_indexed(
                    inner.record.command_buffer,
                    *index_count,
                    *instance_count,
                    *first_index,
                    *base_vertex,
                    *first_instance,
                );
            }
        }
        Command::DrawIndirect { buffer, offset } => {
            prepare_draw(device, queue_type, inner, state, Some(buffer), false)?;
            unsafe {
                device.raw.cmd_draw_indirect(
                    inner.record.command_buffer,
                    buffer.handle(),
                    *offset,
                    1,
                    std::mem::size_of::<vk::DrawIndirectCommand>() as u32,
                );
            }
        }
        Command::DrawIndexedIndirect { buffer, offset } => {
            prepare_draw(device, queue_type, inner, state, Some(buffer), true)?;
            unsafe {
                device.raw.cmd_draw_indexed_indirect(
                    inner.record.command_buffer,
                    buffer.handle(),
                    *offset,
                    1,
                    std::mem::size_of::<vk::DrawIndexedIndirectCommand>() as u32,
                );
            }
        }
        Command::MultiDrawIndirect {
            buffer,
            offset,
            max_draw_count,
            count_buffer,
            count_offset,
        } => {
            if let Some(count_buffer) = count_buffer {
                count_buffer.track_usage(
                    queue_type,
                    &mut inner.record,
                    BufferUsage::INDIRECT,
                    ShaderStages::empty(),
                );
            }
            prepare_draw(device, queue_type, inner, state, Some(buffer), false)?;
            unsafe {
                match count_buffer {
                    Some(count_buffer) => device.raw.cmd_draw_indirect_count(
                        inner.record.command_buffer,
                        buffer.handle(),
                        *offset,
                        count_buffer.handle(),
                        *count_offset,
                        *max_draw_count,
                        std::mem::size_of::<vk::DrawIndirectCommand>() as u32,
                    ),
                    None => device.raw.cmd_draw_indirect(
                        inner.record.command_buffer,
                        buffer.handle(),
                        *offset,
                        *max_draw_count,
                        std::mem::size_of::<vk::DrawIndirectCommand>() as u32,
                    ),
                }
            }
        }
        Command::MultiDrawIndexedIndirect {
            buffer,
            offset,
            max_draw_count,
            count_buffer,
            count_offset,
        } => {
            if let Some(count_buffer) = count_buffer {
                count_buffer.track_usage(
                    queue_type,
                    &mut inner.record,
                    BufferUsage::INDIRECT,
                    ShaderStages::empty(),
                );
            }
            prepare_draw(device, queue_type, inner, state, Some(buffer), true)?;
            unsafe {
                match count_buffer {
                    Some(count_buffer) => device.raw.cmd_draw_indexed_indirect_count(
                        inner.record.command_buffer,
                        buffer.handle(),
                        *offset,
                        count_buffer.handle(),
                        *count_offset,
                        *max_draw_count,
                        std::mem::size_of::<vk::DrawIndexedIndirectCommand>() as u32,
                    ),
                    None => device.raw.cmd_draw_indexed_indirect(
                        inner.record.command_buffer,
                        buffer.handle(),
                        *offset,
                        *max_draw_count,
                        std::mem::size_of::<vk::DrawIndexedIndirectCommand>() as u32,
                    ),
                }
            }
        }
        Command::Dispatch {
            group_count_x,
            group_count_y,
            group_count_z,
        } => {
            prepare_dispatch(device, queue_type, inner, state, None)?;
            unsafe {
                device.raw.cmd_dispatch(
                    inner.record.command_buffer,
                    *group_count_x,
                    *group_count_y,
                    *group_count_z,
                );
            }
        }
        Command::DispatchIndirect { buffer, offset } => {
            prepare_dispatch(device, queue_type, inner, state, Some(buffer))?;
            unsafe {
                device.raw.cmd_dispatch_indirect(
                    inner.record.command_buffer,
                    buffer.handle(),
                    *offset,
                );
            }
        }
        Command::BeginDebugLabel { label, color } => {
            if let Ok(name) = CString::new(label.as_str()) {
                let label_info = vk::DebugUtilsLabelEXT {
                    p_label_name: name.as_ptr(),
                    color: *color,
                    ..Default::default()
                };
                unsafe {
                    device
                        .instance
                        .debug_utils()
                        .cmd_begin_debug_utils_label(inner.record.command_buffer, &label_info);
                }
            }
        }
        Command::EndDebugLabel => unsafe {
            device
                .instance
                .debug_utils()
                .cmd_end_debug_utils_label(inner.record.command_buffer);
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encoder_records_pass_structure() {
        let mut encoder = CommandEncoder::new();
        encoder.begin_compute_pass();
        encoder.dispatch(1, 1, 1);
        encoder.end_compute_pass();
        let list = encoder.finish();
        assert_eq!(list.command_count(), 3);
    }

    #[test]
    #[should_panic]
    fn finish_with_open_pass_panics_in_debug() {
        let mut encoder = CommandEncoder::new();
        encoder.begin_compute_pass();
        let _ = encoder.finish();
    }
}
