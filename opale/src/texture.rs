//! Textures, texture views and per-subresource usage tracking.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::vulkan::{AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use crate::buffer::shader_pipeline_stages;
use crate::deleter::ImageAllocation;
use crate::device::DeviceShared;
use crate::error::{validation_error, Error};
use crate::format::{vk_aspect_flags, TextureFormat};
use crate::queue::CommandRecordContext;
use crate::subresource::{Aspects, SubresourceRange, SubresourceStorage};
use crate::types::{
    Extent3d, Origin3d, QueueType, ShaderStages, TextureAspect, TextureDesc, TextureDimension,
    TextureUsage, TextureViewDesc, READ_ONLY_TEXTURE_USAGES, SHADER_TEXTURE_USAGES,
};

/// Synchronization state of one subresource.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct TextureSyncInfo {
    pub usage: TextureUsage,
    pub shader_stages: ShaderStages,
    /// Queue family owning the subresource; `None` until first use.
    pub queue: Option<QueueType>,
}

impl TextureSyncInfo {
    pub(crate) const UNUSED: TextureSyncInfo = TextureSyncInfo {
        usage: TextureUsage::empty(),
        shader_stages: ShaderStages::empty(),
        queue: None,
    };
}

pub(crate) fn image_usage_flags(usage: TextureUsage, format: TextureFormat) -> vk::ImageUsageFlags {
    let info = format.info();
    let mut flags = vk::ImageUsageFlags::empty();
    if usage.contains(TextureUsage::COPY_SRC) {
        flags |= vk::ImageUsageFlags::TRANSFER_SRC;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        flags |= vk::ImageUsageFlags::TRANSFER_DST;
    }
    if usage.contains(TextureUsage::SAMPLED_BINDING) {
        flags |= vk::ImageUsageFlags::SAMPLED;
    }
    if usage.intersects(TextureUsage::STORAGE_BINDING | TextureUsage::READ_ONLY_STORAGE) {
        flags |= vk::ImageUsageFlags::STORAGE;
    }
    if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
        if info.is_depth_stencil() {
            flags |= vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT;
        } else {
            flags |= vk::ImageUsageFlags::COLOR_ATTACHMENT;
        }
    }
    flags
}

pub(crate) fn texture_pipeline_stages(
    usage: TextureUsage,
    shader_stages: ShaderStages,
    format: TextureFormat,
) -> vk::PipelineStageFlags2 {
    if usage.is_empty() {
        return vk::PipelineStageFlags2::TOP_OF_PIPE;
    }

    let mut flags = vk::PipelineStageFlags2::empty();
    if usage.intersects(TextureUsage::COPY_SRC | TextureUsage::COPY_DST) {
        flags |= vk::PipelineStageFlags2::TRANSFER;
    }
    if usage.intersects(SHADER_TEXTURE_USAGES) {
        flags |= shader_pipeline_stages(shader_stages);
    }
    if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
        if format.info().is_depth_stencil() {
            flags |= vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS
                | vk::PipelineStageFlags2::LATE_FRAGMENT_TESTS;
        } else {
            flags |= vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;
        }
    }
    if usage.contains(TextureUsage::SWAPCHAIN_ACQUIRE) {
        // Only ever used alone, by the swapchain.
        debug_assert_eq!(usage, TextureUsage::SWAPCHAIN_ACQUIRE);
        flags |= vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT;
    }
    if usage.contains(TextureUsage::SWAPCHAIN_PRESENT) {
        debug_assert_eq!(usage, TextureUsage::SWAPCHAIN_PRESENT);
        flags |= vk::PipelineStageFlags2::BOTTOM_OF_PIPE;
    }
    flags
}

pub(crate) fn texture_access_flags(usage: TextureUsage, format: TextureFormat) -> vk::AccessFlags2 {
    let mut flags = vk::AccessFlags2::empty();
    if usage.contains(TextureUsage::COPY_SRC) {
        flags |= vk::AccessFlags2::TRANSFER_READ;
    }
    if usage.contains(TextureUsage::COPY_DST) {
        flags |= vk::AccessFlags2::TRANSFER_WRITE;
    }
    if usage.intersects(TextureUsage::SAMPLED_BINDING | TextureUsage::READ_ONLY_STORAGE) {
        flags |= vk::AccessFlags2::SHADER_READ;
    }
    if usage.contains(TextureUsage::STORAGE_BINDING) {
        flags |= vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE;
    }
    if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
        if format.info().is_depth_stencil() {
            flags |= vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags2::DEPTH_STENCIL_ATTACHMENT_WRITE;
        } else {
            flags |= vk::AccessFlags2::COLOR_ATTACHMENT_READ
                | vk::AccessFlags2::COLOR_ATTACHMENT_WRITE;
        }
    }
    // The swapchain pseudo-usages need no memory access.
    flags
}

/// One layout per usage bit; `usage` must hold at most one bit.
pub(crate) fn image_layout(usage: TextureUsage, format: TextureFormat) -> vk::ImageLayout {
    if usage.is_empty() {
        return vk::ImageLayout::UNDEFINED;
    }
    debug_assert_eq!(usage.bits().count_ones(), 1, "layout needs a single usage");
    match usage {
        TextureUsage::COPY_SRC => vk::ImageLayout::TRANSFER_SRC_OPTIMAL,
        TextureUsage::COPY_DST => vk::ImageLayout::TRANSFER_DST_OPTIMAL,
        TextureUsage::SAMPLED_BINDING => {
            if format.info().is_depth_stencil() {
                vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
            } else {
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
            }
        }
        TextureUsage::STORAGE_BINDING | TextureUsage::READ_ONLY_STORAGE => vk::ImageLayout::GENERAL,
        TextureUsage::RENDER_ATTACHMENT => {
            if format.info().is_depth_stencil() {
                vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
            } else {
                vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
            }
        }
        TextureUsage::SWAPCHAIN_ACQUIRE => vk::ImageLayout::UNDEFINED,
        TextureUsage::SWAPCHAIN_PRESENT => vk::ImageLayout::PRESENT_SRC_KHR,
        _ => unreachable!("invalid texture usage for layout"),
    }
}

/// Whether a use can piggyback on the previous synchronization: read-only,
/// same usage (so same layout), and the stages already waited.
pub(crate) fn can_reuse_without_barrier(
    last_usage: TextureUsage,
    usage: TextureUsage,
    last_stages: ShaderStages,
    stages: ShaderStages,
) -> bool {
    let last_read_only = READ_ONLY_TEXTURE_USAGES.contains(last_usage) && !last_usage.is_empty();
    last_read_only && last_usage == usage && last_stages.contains(stages)
}

pub(crate) fn vk_image_type(dimension: TextureDimension) -> vk::ImageType {
    match dimension {
        TextureDimension::D1 => vk::ImageType::TYPE_1D,
        TextureDimension::D2
        | TextureDimension::D2Array
        | TextureDimension::Cube
        | TextureDimension::CubeArray => vk::ImageType::TYPE_2D,
        TextureDimension::D3 => vk::ImageType::TYPE_3D,
    }
}

pub(crate) fn vk_image_view_type(dimension: TextureDimension) -> vk::ImageViewType {
    match dimension {
        TextureDimension::D1 => vk::ImageViewType::TYPE_1D,
        TextureDimension::D2 => vk::ImageViewType::TYPE_2D,
        TextureDimension::D2Array => vk::ImageViewType::TYPE_2D_ARRAY,
        TextureDimension::Cube => vk::ImageViewType::CUBE,
        TextureDimension::CubeArray => vk::ImageViewType::CUBE_ARRAY,
        TextureDimension::D3 => vk::ImageViewType::TYPE_3D,
    }
}

pub(crate) fn vk_sample_count(count: u32) -> vk::SampleCountFlags {
    match count {
        0 | 1 => vk::SampleCountFlags::TYPE_1,
        2 => vk::SampleCountFlags::TYPE_2,
        4 => vk::SampleCountFlags::TYPE_4,
        8 => vk::SampleCountFlags::TYPE_8,
        16 => vk::SampleCountFlags::TYPE_16,
        _ => panic!("unsupported sample count"),
    }
}

/// A GPU image with per-subresource synchronization state.
pub struct Texture {
    device: Arc<DeviceShared>,
    id: u64,
    label: String,
    dimension: TextureDimension,
    width: u32,
    height: u32,
    depth_or_array_layers: u32,
    mip_level_count: u32,
    sample_count: u32,
    format: TextureFormat,
    usage: TextureUsage,
    handle: vk::Image,
    allocation: Mutex<Option<gpu_allocator::vulkan::Allocation>>,
    /// Swapchain images are owned by the swapchain, not the texture.
    swapchain_owned: bool,
    destroyed: AtomicBool,
    pub(crate) sync: Mutex<SubresourceStorage<TextureSyncInfo>>,
}

impl Texture {
    pub(crate) fn create(shared: &Arc<DeviceShared>, desc: &TextureDesc) -> Result<Arc<Texture>, Error> {
        shared.check_not_lost()?;

        let info = desc.format.info();
        if desc.width == 0 || desc.height == 0 || desc.depth_or_array_layers == 0 {
            return Err(validation_error!(
                "texture `{}`: extent must be non-zero",
                desc.label
            ));
        }
        if desc.mip_level_count == 0 {
            return Err(validation_error!(
                "texture `{}`: mip level count must be non-zero",
                desc.label
            ));
        }
        if info.is_depth_stencil() && desc.usage.contains(TextureUsage::STORAGE_BINDING) {
            return Err(validation_error!(
                "texture `{}`: depth/stencil formats cannot be storage bindings",
                desc.label
            ));
        }

        // Images that may be cleared need TRANSFER_DST unconditionally.
        let internal_usage = desc.usage | TextureUsage::COPY_DST;

        let (extent, array_layers) = match desc.dimension {
            TextureDimension::D3 => (
                vk::Extent3D {
                    width: desc.width,
                    height: desc.height,
                    depth: desc.depth_or_array_layers,
                },
                1,
            ),
            _ => (
                vk::Extent3D {
                    width: desc.width,
                    height: desc.height,
                    depth: 1,
                },
                desc.depth_or_array_layers,
            ),
        };

        let mut flags = vk::ImageCreateFlags::empty();
        if vk_image_type(desc.dimension) == vk::ImageType::TYPE_2D
            && array_layers >= 6
            && desc.width == desc.height
        {
            flags |= vk::ImageCreateFlags::CUBE_COMPATIBLE;
        }
        let usage_flags = image_usage_flags(internal_usage, desc.format);
        if vk_image_type(desc.dimension) == vk::ImageType::TYPE_3D
            && usage_flags.contains(vk::ImageUsageFlags::COLOR_ATTACHMENT)
        {
            flags |= vk::ImageCreateFlags::TYPE_2D_ARRAY_COMPATIBLE;
        }

        let create_info = vk::ImageCreateInfo {
            flags,
            image_type: vk_image_type(desc.dimension),
            format: desc.format.to_vk(),
            extent,
            mip_levels: desc.mip_level_count,
            array_layers,
            samples: vk_sample_count(desc.sample_count),
            tiling: vk::ImageTiling::OPTIMAL,
            usage: usage_flags,
            sharing_mode: vk::SharingMode::EXCLUSIVE,
            initial_layout: vk::ImageLayout::UNDEFINED,
            ..Default::default()
        };
        let handle = unsafe { shared.raw.create_image(&create_info, None)? };

        let requirements = unsafe { shared.raw.get_image_memory_requirements(handle) };
        let allocation = {
            let mut allocator = shared.allocator.lock().unwrap();
            match allocator.allocate(&AllocationCreateDesc {
                name: desc.label,
                requirements,
                location: MemoryLocation::GpuOnly,
                linear: false,
                allocation_scheme: AllocationScheme::DedicatedImage(handle),
            }) {
                Ok(allocation) => allocation,
                Err(err) => {
                    unsafe { shared.raw.destroy_image(handle, None) };
                    return Err(err.into());
                }
            }
        };
        if let Err(err) = unsafe {
            shared
                .raw
                .bind_image_memory(handle, allocation.memory(), allocation.offset())
        } {
            unsafe { shared.raw.destroy_image(handle, None) };
            let _ = shared.allocator.lock().unwrap().free(allocation);
            return Err(err.into());
        }

        shared.set_debug_name(vk::ObjectType::IMAGE, vk::Handle::as_raw(handle), desc.label);

        Ok(Arc::new(Texture {
            device: shared.clone(),
            id: shared.allocate_resource_id(),
            label: desc.label.to_string(),
            dimension: desc.dimension,
            width: desc.width,
            height: desc.height,
            depth_or_array_layers: desc.depth_or_array_layers,
            mip_level_count: desc.mip_level_count,
            sample_count: desc.sample_count,
            format: desc.format,
            usage: desc.usage,
            handle,
            allocation: Mutex::new(Some(allocation)),
            swapchain_owned: false,
            destroyed: AtomicBool::new(false),
            sync: Mutex::new(SubresourceStorage::new(
                info.aspects,
                array_layers,
                desc.mip_level_count,
                TextureSyncInfo::UNUSED,
            )),
        }))
    }

    /// Wraps a native swapchain image. Its subresources are seeded as freshly
    /// acquired (layout UNDEFINED), and the image itself is destroyed with the
    /// swapchain rather than with this texture.
    pub(crate) fn for_swapchain_image(
        device: &Arc<DeviceShared>,
        label: &str,
        width: u32,
        height: u32,
        format: TextureFormat,
        image: vk::Image,
    ) -> Arc<Texture> {
        let sync = SubresourceStorage::new(
            format.info().aspects,
            1,
            1,
            TextureSyncInfo {
                usage: TextureUsage::SWAPCHAIN_ACQUIRE,
                shader_stages: ShaderStages::empty(),
                queue: None,
            },
        );
        device.set_debug_name(vk::ObjectType::IMAGE, vk::Handle::as_raw(image), label);
        Arc::new(Texture {
            device: device.clone(),
            id: device.allocate_resource_id(),
            label: label.to_string(),
            dimension: TextureDimension::D2,
            width,
            height,
            depth_or_array_layers: 1,
            mip_level_count: 1,
            sample_count: 1,
            format,
            usage: TextureUsage::RENDER_ATTACHMENT,
            handle: image,
            allocation: Mutex::new(None),
            swapchain_owned: true,
            destroyed: AtomicBool::new(false),
            sync: Mutex::new(sync),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn dimension(&self) -> TextureDimension {
        self.dimension
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn depth_or_array_layers(&self) -> u32 {
        self.depth_or_array_layers
    }

    pub fn mip_level_count(&self) -> u32 {
        self.mip_level_count
    }

    pub fn sample_count(&self) -> u32 {
        self.sample_count
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn usage(&self) -> TextureUsage {
        self.usage
    }

    pub(crate) fn handle(&self) -> vk::Image {
        self.handle
    }

    pub(crate) fn array_layer_count(&self) -> u32 {
        match self.dimension {
            TextureDimension::D3 => 1,
            _ => self.depth_or_array_layers,
        }
    }

    /// The range covering every subresource of this texture.
    pub fn all_subresources(&self) -> SubresourceRange {
        SubresourceRange::whole(
            self.format.info().aspects,
            self.array_layer_count(),
            self.mip_level_count,
        )
    }

    pub fn create_view(
        self: &Arc<Self>,
        desc: &TextureViewDesc,
    ) -> Result<Arc<TextureView>, Error> {
        TextureView::create(self, desc)
    }

    /// Transitions `range` into `usage` on `queue`, appending the required
    /// image barriers to the record context. Barriers are scoped to the
    /// maximal sub-ranges whose previous state is uniform.
    pub(crate) fn track_usage(
        &self,
        queue: QueueType,
        ctx: &mut CommandRecordContext,
        mut usage: TextureUsage,
        shader_stages: ShaderStages,
        range: &SubresourceRange,
    ) {
        if shader_stages.is_empty() {
            // Not visible to any shader stage: ignore shader usages, e.g. a
            // texture binding that is never actually sampled.
            usage &= !SHADER_TEXTURE_USAGES;
        }
        if usage.is_empty() {
            return;
        }

        let queue_family = self
            .device
            .queue_shared(queue)
            .expect("texture used on a queue the device does not have")
            .family;
        let format = self.format;
        let handle = self.handle;

        // Release barriers to record on previous owners, grouped afterwards.
        let mut releases: Vec<(QueueType, vk::ImageMemoryBarrier2)> = Vec::new();

        let mut sync = self.sync.lock().unwrap();
        sync.update(range, |sub_range, last| {
            let need_transfer_ownership = last.queue.map_or(false, |q| q != queue);

            if !need_transfer_ownership
                && can_reuse_without_barrier(last.usage, usage, last.shader_stages, shader_stages)
            {
                return;
            }

            let old_layout = image_layout(last.usage, format);
            let new_layout = image_layout(usage, format);
            let vk_range = vk::ImageSubresourceRange {
                aspect_mask: vk_aspect_flags(sub_range.aspects),
                base_mip_level: sub_range.base_mip_level,
                level_count: sub_range.level_count,
                base_array_layer: sub_range.base_array_layer,
                layer_count: sub_range.layer_count,
            };

            let mut barrier = vk::ImageMemoryBarrier2 {
                src_access_mask: texture_access_flags(last.usage, format),
                src_stage_mask: texture_pipeline_stages(last.usage, last.shader_stages, format),
                dst_access_mask: texture_access_flags(usage, format),
                dst_stage_mask: texture_pipeline_stages(usage, shader_stages, format),
                old_layout,
                new_layout,
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                image: handle,
                subresource_range: vk_range,
                ..Default::default()
            };

            if need_transfer_ownership {
                let from = last.queue.unwrap();
                let from_family = self
                    .device
                    .queue_shared(from)
                    .map_or(vk::QUEUE_FAMILY_IGNORED, |q| q.family);
                if from_family != queue_family {
                    // Release on the old owner makes the writes available; the
                    // acquire side carries empty source masks.
                    let release = vk::ImageMemoryBarrier2 {
                        dst_access_mask: vk::AccessFlags2::empty(),
                        dst_stage_mask: vk::PipelineStageFlags2::empty(),
                        src_queue_family_index: from_family,
                        dst_queue_family_index: queue_family,
                        ..barrier
                    };
                    releases.push((from, release));

                    barrier.src_access_mask = vk::AccessFlags2::empty();
                    barrier.src_stage_mask = vk::PipelineStageFlags2::empty();
                    barrier.src_queue_family_index = from_family;
                    barrier.dst_queue_family_index = queue_family;
                }
            }

            ctx.image_barriers.push(barrier);

            if last.usage == usage && READ_ONLY_TEXTURE_USAGES.contains(usage) {
                // Read-only and no layout transition: keep previous shader
                // stages so future uses in those stages don't barrier again.
                last.shader_stages |= shader_stages;
            } else {
                // Altered by a write or layout transition: only the new
                // stages have synchronized.
                last.shader_stages = shader_stages;
            }
            last.usage = usage;
            last.queue = Some(queue);
        });
        drop(sync);

        self.record_releases(queue, ctx, releases);
    }

    /// Fuses a whole pass's subresource demands in one merge over the stored
    /// state.
    pub(crate) fn transition_for_multi_range(
        &self,
        queue: QueueType,
        ctx: &mut CommandRecordContext,
        demands: &SubresourceStorage<TextureSyncInfo>,
    ) {
        let queue_family = self
            .device
            .queue_shared(queue)
            .expect("texture used on a queue the device does not have")
            .family;
        let format = self.format;
        let handle = self.handle;
        let mut releases: Vec<(QueueType, vk::ImageMemoryBarrier2)> = Vec::new();

        let mut sync = self.sync.lock().unwrap();
        sync.merge(demands, |sub_range, last, demand| {
            let mut new_usage = demand.usage;
            if demand.shader_stages.is_empty() {
                new_usage &= !SHADER_TEXTURE_USAGES;
            }

            let need_transfer_ownership = last.queue.map_or(false, |q| q != queue);
            if new_usage.is_empty()
                || (!need_transfer_ownership
                    && can_reuse_without_barrier(
                        last.usage,
                        new_usage,
                        last.shader_stages,
                        demand.shader_stages,
                    ))
            {
                return;
            }

            let vk_range = vk::ImageSubresourceRange {
                aspect_mask: vk_aspect_flags(sub_range.aspects),
                base_mip_level: sub_range.base_mip_level,
                level_count: sub_range.level_count,
                base_array_layer: sub_range.base_array_layer,
                layer_count: sub_range.layer_count,
            };
            let mut barrier = vk::ImageMemoryBarrier2 {
                src_access_mask: texture_access_flags(last.usage, format),
                src_stage_mask: texture_pipeline_stages(last.usage, last.shader_stages, format),
                dst_access_mask: texture_access_flags(new_usage, format),
                dst_stage_mask: texture_pipeline_stages(new_usage, demand.shader_stages, format),
                old_layout: image_layout(last.usage, format),
                new_layout: image_layout(new_usage, format),
                src_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                dst_queue_family_index: vk::QUEUE_FAMILY_IGNORED,
                image: handle,
                subresource_range: vk_range,
                ..Default::default()
            };

            if need_transfer_ownership {
                let from = last.queue.unwrap();
                let from_family = self
                    .device
                    .queue_shared(from)
                    .map_or(vk::QUEUE_FAMILY_IGNORED, |q| q.family);
                if from_family != queue_family {
                    let release = vk::ImageMemoryBarrier2 {
                        dst_access_mask: vk::AccessFlags2::empty(),
                        dst_stage_mask: vk::PipelineStageFlags2::empty(),
                        src_queue_family_index: from_family,
                        dst_queue_family_index: queue_family,
                        ..barrier
                    };
                    releases.push((from, release));
                    barrier.src_access_mask = vk::AccessFlags2::empty();
                    barrier.src_stage_mask = vk::PipelineStageFlags2::empty();
                    barrier.src_queue_family_index = from_family;
                    barrier.dst_queue_family_index = queue_family;
                }
            }

            ctx.image_barriers.push(barrier);

            if last.usage == new_usage && READ_ONLY_TEXTURE_USAGES.contains(new_usage) {
                last.shader_stages |= demand.shader_stages;
            } else {
                last.shader_stages = demand.shader_stages;
            }
            last.usage = new_usage;
            last.queue = Some(queue);
        });
        drop(sync);

        self.record_releases(queue, ctx, releases);
    }

    fn record_releases(
        &self,
        _queue: QueueType,
        ctx: &mut CommandRecordContext,
        releases: Vec<(QueueType, vk::ImageMemoryBarrier2)>,
    ) {
        for (from, barrier) in releases {
            if let Some(from_queue) = self.device.queue_shared(from) {
                let release_serial = from_queue.record_release_image_barrier(barrier);
                ctx.wait_semaphores.push(vk::SemaphoreSubmitInfo {
                    semaphore: from_queue.timeline,
                    value: release_serial,
                    stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
                    ..Default::default()
                });
            }
        }
    }

    /// Hands the image and its memory to the deleters of every queue that
    /// touched it; the last one to drain performs the destruction.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.swapchain_owned {
            return;
        }

        let mut used_queues = [false; crate::MAX_QUEUES];
        {
            let sync = self.sync.lock().unwrap();
            sync.iterate(|_, info| {
                if let Some(queue) = info.queue {
                    used_queues[queue.index()] = true;
                }
            });
        }

        let allocation = self.allocation.lock().unwrap().take();
        let entry = Arc::new(ImageAllocation {
            handle: self.handle,
            allocation,
        });

        let mut enqueued = false;
        for queue_type in QueueType::ALL {
            if !used_queues[queue_type.index()] {
                continue;
            }
            if let Some(queue) = self.device.queue_shared(queue_type) {
                queue
                    .deleter
                    .lock()
                    .unwrap()
                    .delete_shared_image_when_unused(queue.pending_submit_serial(), entry.clone());
                enqueued = true;
            }
        }
        if !enqueued {
            if let Some(queue) = self.device.queue_shared(QueueType::Graphics) {
                queue
                    .deleter
                    .lock()
                    .unwrap()
                    .delete_shared_image_when_unused(queue.pending_submit_serial(), entry);
            }
        }
    }
}

impl Drop for Texture {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Texture {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Texture")
            .field("label", &self.label)
            .field("format", &self.format)
            .field("usage", &self.usage)
            .finish()
    }
}

/// A view over a subresource range of a texture.
pub struct TextureView {
    texture: Arc<Texture>,
    label: String,
    handle: vk::ImageView,
    dimension: TextureDimension,
    format: TextureFormat,
    range: SubresourceRange,
}

impl TextureView {
    fn create(texture: &Arc<Texture>, desc: &TextureViewDesc) -> Result<Arc<TextureView>, Error> {
        let device = &texture.device;
        device.check_not_lost()?;

        if texture.destroyed.load(Ordering::Acquire) {
            return Err(validation_error!(
                "texture view `{}`: parent texture was destroyed",
                desc.label
            ));
        }

        let internal_usage = texture.usage | TextureUsage::COPY_DST;
        if (internal_usage & !(TextureUsage::COPY_SRC | TextureUsage::COPY_DST)).is_empty() {
            // A view with no usage beyond copies can never be bound or
            // attached; creating the vkImageView would only trip validation.
            return Err(validation_error!(
                "texture view `{}`: texture is only usable in copies",
                desc.label
            ));
        }

        let dimension = desc.dimension.unwrap_or(texture.dimension);
        let format = desc.format.unwrap_or(texture.format);
        let layer_count = desc
            .array_layer_count
            .unwrap_or(texture.array_layer_count() - desc.base_array_layer);
        let level_count = desc
            .mip_level_count
            .unwrap_or(texture.mip_level_count - desc.base_mip_level);
        if desc.base_array_layer + layer_count > texture.array_layer_count()
            || desc.base_mip_level + level_count > texture.mip_level_count
        {
            return Err(validation_error!(
                "texture view `{}`: subresource range out of bounds",
                desc.label
            ));
        }
        let range = SubresourceRange {
            aspects: format.info().aspects,
            base_array_layer: desc.base_array_layer,
            layer_count,
            base_mip_level: desc.base_mip_level,
            level_count,
        };

        let usage_info = vk::ImageViewUsageCreateInfo {
            usage: image_usage_flags(internal_usage, format),
            ..Default::default()
        };
        let create_info = vk::ImageViewCreateInfo {
            p_next: &usage_info as *const _ as *const std::ffi::c_void,
            image: texture.handle,
            view_type: vk_image_view_type(dimension),
            format: format.to_vk(),
            components: vk::ComponentMapping {
                r: vk::ComponentSwizzle::R,
                g: vk::ComponentSwizzle::G,
                b: vk::ComponentSwizzle::B,
                a: vk::ComponentSwizzle::A,
            },
            subresource_range: vk::ImageSubresourceRange {
                aspect_mask: vk_aspect_flags(range.aspects),
                base_mip_level: range.base_mip_level,
                level_count: range.level_count,
                base_array_layer: range.base_array_layer,
                layer_count: range.layer_count,
            },
            ..Default::default()
        };
        let handle = unsafe { device.raw.create_image_view(&create_info, None)? };
        device.set_debug_name(
            vk::ObjectType::IMAGE_VIEW,
            vk::Handle::as_raw(handle),
            desc.label,
        );

        Ok(Arc::new(TextureView {
            texture: texture.clone(),
            label: desc.label.to_string(),
            handle,
            dimension,
            format,
            range,
        }))
    }

    pub fn texture(&self) -> &Arc<Texture> {
        &self.texture
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn dimension(&self) -> TextureDimension {
        self.dimension
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn subresource_range(&self) -> SubresourceRange {
        self.range
    }

    pub(crate) fn handle(&self) -> vk::ImageView {
        self.handle
    }
}

impl Drop for TextureView {
    fn drop(&mut self) {
        // Defer destruction on the queue that last owned the viewed
        // subresources; they cannot be in flight on more than one.
        let device = &self.texture.device;
        let queue_type = {
            let sync = self.texture.sync.lock().unwrap();
            let mut queue = None;
            for aspect in self.range.aspects.iter_bits() {
                queue = sync
                    .get(aspect, self.range.base_array_layer, self.range.base_mip_level)
                    .queue;
                break;
            }
            queue.unwrap_or(QueueType::Graphics)
        };
        if let Some(queue) = device
            .queue_shared(queue_type)
            .or_else(|| device.queue_shared(QueueType::Graphics))
        {
            queue
                .deleter
                .lock()
                .unwrap()
                .delete_image_view_when_unused(queue.pending_submit_serial(), self.handle);
        }
    }
}

impl std::fmt::Debug for TextureView {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("TextureView")
            .field("label", &self.label)
            .field("format", &self.format)
            .finish()
    }
}

/// A region of one mip level of a texture, addressed by a copy operation.
#[derive(Clone, Debug)]
pub struct TextureSlice {
    pub texture: Arc<Texture>,
    pub mip_level: u32,
    pub origin: Origin3d,
    pub size: Extent3d,
    pub aspect: TextureAspect,
}

impl TextureSlice {
    /// The whole of `texture`'s first mip.
    pub fn whole(texture: &Arc<Texture>) -> TextureSlice {
        TextureSlice {
            texture: texture.clone(),
            mip_level: 0,
            origin: Origin3d::default(),
            size: Extent3d {
                width: texture.width(),
                height: texture.height(),
                depth_or_array_layers: texture.depth_or_array_layers(),
            },
            aspect: TextureAspect::All,
        }
    }

    pub(crate) fn aspects(&self) -> Aspects {
        let format_aspects = self.texture.format().info().aspects;
        match self.aspect {
            TextureAspect::All => format_aspects,
            TextureAspect::DepthOnly => format_aspects & Aspects::DEPTH,
            TextureAspect::StencilOnly => format_aspects & Aspects::STENCIL,
        }
    }

    /// Base layer and layer count addressed by this slice.
    pub(crate) fn layers(&self) -> (u32, u32) {
        match self.texture.dimension() {
            TextureDimension::D3 => (0, 1),
            _ => (self.origin.z, self.size.depth_or_array_layers),
        }
    }

    pub(crate) fn subresource_range(&self) -> SubresourceRange {
        let (base_array_layer, layer_count) = self.layers();
        SubresourceRange {
            aspects: self.aspects(),
            base_array_layer,
            layer_count,
            base_mip_level: self.mip_level,
            level_count: 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_to_layout_table() {
        let color = TextureFormat::Rgba8Unorm;
        let depth = TextureFormat::Depth24UnormStencil8;
        assert_eq!(
            image_layout(TextureUsage::empty(), color),
            vk::ImageLayout::UNDEFINED
        );
        assert_eq!(
            image_layout(TextureUsage::COPY_SRC, color),
            vk::ImageLayout::TRANSFER_SRC_OPTIMAL
        );
        assert_eq!(
            image_layout(TextureUsage::COPY_DST, color),
            vk::ImageLayout::TRANSFER_DST_OPTIMAL
        );
        assert_eq!(
            image_layout(TextureUsage::SAMPLED_BINDING, color),
            vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            image_layout(TextureUsage::SAMPLED_BINDING, depth),
            vk::ImageLayout::DEPTH_STENCIL_READ_ONLY_OPTIMAL
        );
        assert_eq!(
            image_layout(TextureUsage::STORAGE_BINDING, color),
            vk::ImageLayout::GENERAL
        );
        assert_eq!(
            image_layout(TextureUsage::RENDER_ATTACHMENT, color),
            vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            image_layout(TextureUsage::RENDER_ATTACHMENT, depth),
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL
        );
        assert_eq!(
            image_layout(TextureUsage::SWAPCHAIN_ACQUIRE, color),
            vk::ImageLayout::UNDEFINED
        );
        assert_eq!(
            image_layout(TextureUsage::SWAPCHAIN_PRESENT, color),
            vk::ImageLayout::PRESENT_SRC_KHR
        );
    }

    #[test]
    fn reuse_requires_read_only_same_usage_and_covered_stages() {
        assert!(can_reuse_without_barrier(
            TextureUsage::SAMPLED_BINDING,
            TextureUsage::SAMPLED_BINDING,
            ShaderStages::FRAGMENT,
            ShaderStages::FRAGMENT,
        ));
        // New stage not waited yet.
        assert!(!can_reuse_without_barrier(
            TextureUsage::SAMPLED_BINDING,
            TextureUsage::SAMPLED_BINDING,
            ShaderStages::FRAGMENT,
            ShaderStages::VERTEX,
        ));
        // Writes can never be reused.
        assert!(!can_reuse_without_barrier(
            TextureUsage::STORAGE_BINDING,
            TextureUsage::STORAGE_BINDING,
            ShaderStages::COMPUTE,
            ShaderStages::COMPUTE,
        ));
        // Layout changes force a barrier.
        assert!(!can_reuse_without_barrier(
            TextureUsage::COPY_SRC,
            TextureUsage::SAMPLED_BINDING,
            ShaderStages::empty(),
            ShaderStages::FRAGMENT,
        ));
        // Nothing to reuse on first use.
        assert!(!can_reuse_without_barrier(
            TextureUsage::empty(),
            TextureUsage::SAMPLED_BINDING,
            ShaderStages::empty(),
            ShaderStages::FRAGMENT,
        ));
    }

    #[test]
    fn render_attachment_stages_depend_on_format() {
        let stages = texture_pipeline_stages(
            TextureUsage::RENDER_ATTACHMENT,
            ShaderStages::empty(),
            TextureFormat::Depth32Float,
        );
        assert!(stages.contains(vk::PipelineStageFlags2::EARLY_FRAGMENT_TESTS));
        let stages = texture_pipeline_stages(
            TextureUsage::RENDER_ATTACHMENT,
            ShaderStages::empty(),
            TextureFormat::Rgba8Unorm,
        );
        assert!(stages.contains(vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT));
    }
}
