//! Buffers, their per-queue usage tracking and barrier synthesis.

use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::vulkan::{Allocation, AllocationCreateDesc, AllocationScheme};
use gpu_allocator::MemoryLocation;

use crate::deleter::BufferAllocation;
use crate::device::DeviceShared;
use crate::error::{validation_error, Error};
use crate::queue::CommandRecordContext;
use crate::types::{
    BufferDesc, BufferUsage, QueueType, ShaderStages, ShareMode, MAPPABLE_BUFFER_USAGES,
    READ_ONLY_BUFFER_USAGES, SHADER_BUFFER_USAGES,
};
use crate::MAX_QUEUES;

// Buffers smaller than this share memory blocks; everything else gets a
// dedicated allocation.
const DEDICATED_ALLOCATION_THRESHOLD: u64 = 4 * 1024 * 1024;

pub(crate) fn buffer_usage_to_vk(usage: BufferUsage) -> vk::BufferUsageFlags {
    let mut flags = vk::BufferUsageFlags::empty();
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::BufferUsageFlags::VERTEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::BufferUsageFlags::INDEX_BUFFER;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        flags |= vk::BufferUsageFlags::INDIRECT_BUFFER;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::BufferUsageFlags::UNIFORM_BUFFER;
    }
    if usage.intersects(BufferUsage::STORAGE | BufferUsage::READ_ONLY_STORAGE) {
        flags |= vk::BufferUsageFlags::STORAGE_BUFFER;
    }
    if usage.contains(BufferUsage::COPY_SRC) {
        flags |= vk::BufferUsageFlags::TRANSFER_SRC;
    }
    if usage.intersects(BufferUsage::COPY_DST | BufferUsage::QUERY_RESOLVE) {
        flags |= vk::BufferUsageFlags::TRANSFER_DST;
    }
    flags
}

pub(crate) fn buffer_access_flags(usage: BufferUsage) -> vk::AccessFlags2 {
    let mut flags = vk::AccessFlags2::empty();
    if usage.contains(BufferUsage::MAP_READ) {
        flags |= vk::AccessFlags2::HOST_READ;
    }
    if usage.contains(BufferUsage::MAP_WRITE) {
        flags |= vk::AccessFlags2::HOST_WRITE;
    }
    if usage.contains(BufferUsage::COPY_SRC) {
        flags |= vk::AccessFlags2::TRANSFER_READ;
    }
    if usage.intersects(BufferUsage::COPY_DST | BufferUsage::QUERY_RESOLVE) {
        flags |= vk::AccessFlags2::TRANSFER_WRITE;
    }
    if usage.contains(BufferUsage::INDEX) {
        flags |= vk::AccessFlags2::INDEX_READ;
    }
    if usage.contains(BufferUsage::VERTEX) {
        flags |= vk::AccessFlags2::VERTEX_ATTRIBUTE_READ;
    }
    if usage.contains(BufferUsage::UNIFORM) {
        flags |= vk::AccessFlags2::UNIFORM_READ;
    }
    if usage.contains(BufferUsage::STORAGE) {
        flags |= vk::AccessFlags2::SHADER_READ | vk::AccessFlags2::SHADER_WRITE;
    }
    if usage.contains(BufferUsage::READ_ONLY_STORAGE) {
        flags |= vk::AccessFlags2::SHADER_READ;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        flags |= vk::AccessFlags2::INDIRECT_COMMAND_READ;
    }
    flags
}

pub(crate) fn buffer_pipeline_stages(
    usage: BufferUsage,
    shader_stages: ShaderStages,
) -> vk::PipelineStageFlags2 {
    let mut flags = vk::PipelineStageFlags2::empty();
    if usage.intersects(MAPPABLE_BUFFER_USAGES) {
        flags |= vk::PipelineStageFlags2::HOST;
    }
    if usage.intersects(BufferUsage::COPY_SRC | BufferUsage::COPY_DST | BufferUsage::QUERY_RESOLVE)
    {
        flags |= vk::PipelineStageFlags2::TRANSFER;
    }
    if usage.intersects(BufferUsage::INDEX | BufferUsage::VERTEX) {
        flags |= vk::PipelineStageFlags2::VERTEX_INPUT;
    }
    if usage.contains(BufferUsage::INDIRECT) {
        flags |= vk::PipelineStageFlags2::DRAW_INDIRECT;
    }
    if usage.intersects(SHADER_BUFFER_USAGES) {
        flags |= shader_pipeline_stages(shader_stages);
    }
    flags
}

pub(crate) fn shader_pipeline_stages(stages: ShaderStages) -> vk::PipelineStageFlags2 {
    let mut flags = vk::PipelineStageFlags2::empty();
    if stages.contains(ShaderStages::VERTEX) {
        flags |= vk::PipelineStageFlags2::VERTEX_SHADER;
    }
    if stages.contains(ShaderStages::TESSELLATION_CONTROL) {
        flags |= vk::PipelineStageFlags2::TESSELLATION_CONTROL_SHADER;
    }
    if stages.contains(ShaderStages::TESSELLATION_EVALUATION) {
        flags |= vk::PipelineStageFlags2::TESSELLATION_EVALUATION_SHADER;
    }
    if stages.contains(ShaderStages::GEOMETRY) {
        flags |= vk::PipelineStageFlags2::GEOMETRY_SHADER;
    }
    if stages.contains(ShaderStages::FRAGMENT) {
        flags |= vk::PipelineStageFlags2::FRAGMENT_SHADER;
    }
    if stages.contains(ShaderStages::COMPUTE) {
        flags |= vk::PipelineStageFlags2::COMPUTE_SHADER;
    }
    flags
}

/// Per-queue usage record: reads accumulated since the last write, plus the
/// last write itself.
#[derive(Copy, Clone, Debug)]
pub(crate) struct QueueUsageTrack {
    pub last_usage_serial: u64,
    pub last_write_usage: BufferUsage,
    pub last_write_stages: ShaderStages,
    pub read_usage: BufferUsage,
    pub read_stages: ShaderStages,
}

impl Default for QueueUsageTrack {
    fn default() -> Self {
        QueueUsageTrack {
            last_usage_serial: 0,
            last_write_usage: BufferUsage::empty(),
            last_write_stages: ShaderStages::empty(),
            read_usage: BufferUsage::empty(),
            read_stages: ShaderStages::empty(),
        }
    }
}

/// The source half of a synthesized buffer barrier, in usage terms.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct BufferBarrier {
    pub src_usage: BufferUsage,
    pub src_stages: ShaderStages,
    pub dst_usage: BufferUsage,
    pub dst_stages: ShaderStages,
    /// Queue the resource is being acquired from, when ownership moves.
    pub transfer_from: Option<QueueType>,
}

#[derive(Debug, Default)]
pub(crate) struct BufferTracking {
    pub per_queue: [QueueUsageTrack; MAX_QUEUES],
    pub last_used_queue: Option<QueueType>,
}

impl BufferTracking {
    /// Applies one use of the buffer on `queue` and decides whether a barrier
    /// is required. Updates the per-queue record either way.
    pub(crate) fn transition(
        &mut self,
        queue: QueueType,
        pending_serial: u64,
        share_mode: ShareMode,
        mut usage: BufferUsage,
        shader_stages: ShaderStages,
    ) -> Option<BufferBarrier> {
        let need_transfer_ownership = share_mode != ShareMode::Concurrent
            && self.last_used_queue.map_or(false, |q| q != queue);

        if shader_stages.is_empty() {
            // Not visible to any shader stage: ignore shader usages, e.g. a
            // uniform buffer bound but never actually read in a shader.
            usage &= !SHADER_BUFFER_USAGES;
        }

        let is_map_usage = usage.intersects(MAPPABLE_BUFFER_USAGES);
        if !is_map_usage {
            self.mark_used(queue, pending_serial);
        }

        let read_only = READ_ONLY_BUFFER_USAGES.contains(usage);
        let track = &mut self.per_queue[queue.index()];

        let (src_usage, src_stages);
        if read_only {
            if shader_stages.contains(ShaderStages::FRAGMENT)
                && track.read_stages.contains(ShaderStages::VERTEX)
            {
                // There is an implicit vertex->fragment dependency, so if the
                // vertex stage has already waited there is no need for
                // fragment to wait. Record the fragment usage so we know to
                // wait for it before the next write.
                track.read_stages |= ShaderStages::FRAGMENT;
            }

            if track.read_usage.contains(usage)
                && track.read_stages.contains(shader_stages)
                && !need_transfer_ownership
            {
                // This usage and shader stage already waited for the last
                // write.
                return None;
            }

            track.read_usage |= usage;
            track.read_stages |= shader_stages;

            if track.last_write_usage.is_empty() && !need_transfer_ownership {
                // Read dependency with no prior writes.
                return None;
            }
            // Write -> read barrier.
            src_usage = track.last_write_usage;
            src_stages = track.last_write_stages;
        } else {
            // vkQueueSubmit does an implicit domain and visibility operation,
            // so host reads on coherent memory need no barrier before a write.
            // Pretend the last host read didn't happen.
            track.read_usage &= !BufferUsage::MAP_READ;

            let mut skip_barrier = false;
            if (track.last_write_usage.is_empty()
                && track.read_usage.is_empty()
                && !need_transfer_ownership)
                || MAPPABLE_BUFFER_USAGES.contains(usage | track.last_write_usage | track.read_usage)
            {
                // Never used before, or a map->map dependency.
                skip_barrier = true;
                src_usage = BufferUsage::empty();
                src_stages = ShaderStages::empty();
            } else if track.read_usage.is_empty() {
                // No reads since the last write: write -> write barrier.
                src_usage = track.last_write_usage;
                src_stages = track.last_write_stages;
            } else {
                // Read -> write barrier.
                src_usage = track.read_usage;
                src_stages = track.read_stages;
            }

            track.last_write_usage = usage;
            track.last_write_stages = shader_stages;
            track.read_usage = BufferUsage::empty();
            track.read_stages = ShaderStages::empty();

            if skip_barrier {
                return None;
            }
        }

        if is_map_usage {
            // CPU usage that still needs a pipeline barrier: the buffer is
            // referenced by the pending commands after all.
            self.mark_used(queue, pending_serial);
        }

        let transfer_from = if need_transfer_ownership {
            self.last_used_queue
        } else {
            None
        };
        self.last_used_queue = Some(queue);

        Some(BufferBarrier {
            src_usage,
            src_stages,
            dst_usage: usage,
            dst_stages: shader_stages,
            transfer_from,
        })
    }

    /// Builds the release half of a queue-ownership transfer and clears the
    /// releasing queue's record.
    pub(crate) fn release_ownership(&mut self, from: QueueType) -> (BufferUsage, ShaderStages) {
        let track = &mut self.per_queue[from.index()];
        let released = (track.last_write_usage, track.last_write_stages);
        track.last_write_usage = BufferUsage::empty();
        track.last_write_stages = ShaderStages::empty();
        track.read_usage = BufferUsage::empty();
        track.read_stages = ShaderStages::empty();
        released
    }

    pub(crate) fn mark_used(&mut self, queue: QueueType, pending_serial: u64) {
        let track = &mut self.per_queue[queue.index()];
        debug_assert!(pending_serial >= track.last_usage_serial);
        track.last_usage_serial = pending_serial;
    }
}

/// A GPU buffer.
///
/// Destruction is deferred: dropping or destroying the buffer hands the
/// underlying allocation to the deleter(s) of the queue(s) that used it, and
/// the memory is released only once those queues' completed serials pass the
/// last use.
pub struct Buffer {
    device: Arc<DeviceShared>,
    id: u64,
    label: String,
    size: u64,
    usage: BufferUsage,
    share_mode: ShareMode,
    handle: vk::Buffer,
    allocation: Mutex<Option<Allocation>>,
    mapped_ptr: Option<NonNull<std::ffi::c_void>>,
    destroyed: AtomicBool,
    pub(crate) tracking: Mutex<BufferTracking>,
}

// The mapped pointer refers to host-coherent memory owned by the allocation
// and is never aliased mutably by this crate.
unsafe impl Send for Buffer {}
unsafe impl Sync for Buffer {}

impl Buffer {
    pub(crate) fn create(shared: &Arc<DeviceShared>, desc: &BufferDesc) -> Result<Arc<Buffer>, Error> {
        shared.check_not_lost()?;

        const MAP_WRITE_ALLOWED_USAGES: BufferUsage = BufferUsage::from_bits_truncate(
            BufferUsage::MAP_WRITE.bits() | BufferUsage::COPY_SRC.bits(),
        );
        const MAP_READ_ALLOWED_USAGES: BufferUsage = BufferUsage::from_bits_truncate(
            BufferUsage::MAP_READ.bits() | BufferUsage::COPY_DST.bits(),
        );
        if desc.usage.contains(BufferUsage::MAP_WRITE)
            && !MAP_WRITE_ALLOWED_USAGES.contains(desc.usage)
        {
            return Err(validation_error!(
                "buffer `{}`: MAP_WRITE is only compatible with COPY_SRC",
                desc.label
            ));
        }
        if desc.usage.contains(BufferUsage::MAP_READ)
            && !MAP_READ_ALLOWED_USAGES.contains(desc.usage)
        {
            return Err(validation_error!(
                "buffer `{}`: MAP_READ is only compatible with COPY_DST",
                desc.label
            ));
        }
        if desc.usage.is_empty() {
            return Err(validation_error!(
                "buffer `{}`: usage must not be empty",
                desc.label
            ));
        }

        // Vulkan requires a non-zero size.
        let allocated_size = desc.size.max(4);
        assert!(
            allocated_size & (3 << 62) == 0,
            "buffer size is huge and could cause overflows"
        );

        let internal_usage = desc.usage | BufferUsage::COPY_DST;

        let queue_families = shared.unique_queue_families();
        let use_concurrent = desc.share_mode == ShareMode::Concurrent && queue_families.len() > 1;
        let create_info = vk::BufferCreateInfo {
            size: allocated_size,
            usage: buffer_usage_to_vk(internal_usage),
            sharing_mode: if use_concurrent {
                vk::SharingMode::CONCURRENT
            } else {
                vk::SharingMode::EXCLUSIVE
            },
            queue_family_index_count: if use_concurrent {
                queue_families.len() as u32
            } else {
                0
            },
            p_queue_family_indices: queue_families.as_ptr(),
            ..Default::default()
        };
        let handle = unsafe { shared.raw.create_buffer(&create_info, None)? };

        let requirements = unsafe { shared.raw.get_buffer_memory_requirements(handle) };
        let location = if desc.usage.contains(BufferUsage::MAP_READ) {
            MemoryLocation::GpuToCpu
        } else if desc.usage.contains(BufferUsage::MAP_WRITE) {
            MemoryLocation::CpuToGpu
        } else {
            MemoryLocation::GpuOnly
        };
        let allocation_scheme = if location == MemoryLocation::GpuOnly
            && allocated_size >= DEDICATED_ALLOCATION_THRESHOLD
        {
            AllocationScheme::DedicatedBuffer(handle)
        } else {
            AllocationScheme::GpuAllocatorManaged
        };

        let allocation = {
            let mut allocator = shared.allocator.lock().unwrap();
            match allocator.allocate(&AllocationCreateDesc {
                name: desc.label,
                requirements,
                location,
                linear: true,
                allocation_scheme,
            }) {
                Ok(allocation) => allocation,
                Err(err) => {
                    unsafe { shared.raw.destroy_buffer(handle, None) };
                    return Err(err.into());
                }
            }
        };

        if let Err(err) = unsafe {
            shared
                .raw
                .bind_buffer_memory(handle, allocation.memory(), allocation.offset())
        } {
            unsafe { shared.raw.destroy_buffer(handle, None) };
            let _ = shared.allocator.lock().unwrap().free(allocation);
            return Err(err.into());
        }

        let mapped_ptr = allocation.mapped_ptr();
        shared.set_debug_name(vk::ObjectType::BUFFER, vk::Handle::as_raw(handle), desc.label);

        Ok(Arc::new(Buffer {
            device: shared.clone(),
            id: shared.allocate_resource_id(),
            label: desc.label.to_string(),
            size: desc.size,
            usage: desc.usage,
            share_mode: desc.share_mode,
            handle,
            allocation: Mutex::new(Some(allocation)),
            mapped_ptr,
            destroyed: AtomicBool::new(false),
            tracking: Mutex::new(BufferTracking::default()),
        }))
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn share_mode(&self) -> ShareMode {
        self.share_mode
    }

    /// Pointer to the persistently mapped memory of a host-visible buffer.
    ///
    /// Returns `None` for device-local buffers and after [`Buffer::destroy`].
    /// The caller must not read data written by the GPU before the submit
    /// serial of that write has completed.
    pub fn mapped_pointer(&self) -> Option<NonNull<std::ffi::c_void>> {
        if self.destroyed.load(Ordering::Acquire) {
            return None;
        }
        self.mapped_ptr
    }

    pub(crate) fn handle(&self) -> vk::Buffer {
        self.handle
    }

    /// Hands the underlying allocation to the deleter(s). The handle stays
    /// logically alive until all references drop, but the memory is released
    /// as soon as every involved queue passes its last-use serial.
    pub fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        let allocation = self.allocation.lock().unwrap().take();
        let tracking = self.tracking.lock().unwrap();

        if self.share_mode == ShareMode::Exclusive {
            // When no barrier ever claimed ownership, fall back to the queue
            // with the most recent use.
            let queue_type = tracking.last_used_queue.unwrap_or_else(|| {
                QueueType::ALL
                    .into_iter()
                    .max_by_key(|q| tracking.per_queue[q.index()].last_usage_serial)
                    .unwrap_or(QueueType::Graphics)
            });
            if let Some(queue) = self
                .device
                .queue_shared(queue_type)
                .or_else(|| self.device.queue_shared(QueueType::Graphics))
            {
                queue.deleter.lock().unwrap().delete_buffer_when_unused(
                    queue.pending_submit_serial(),
                    BufferAllocation {
                        handle: self.handle,
                        allocation,
                    },
                );
            }
        } else {
            // Concurrent buffers may be in flight on several queues and there
            // is no way to tell which one was last; refcount the allocation
            // across every queue that touched it.
            let entry = Arc::new(BufferAllocation {
                handle: self.handle,
                allocation,
            });
            let mut enqueued = false;
            for queue_type in QueueType::ALL {
                let used = tracking.per_queue[queue_type.index()].last_usage_serial > 0;
                if !used {
                    continue;
                }
                if let Some(queue) = self.device.queue_shared(queue_type) {
                    queue
                        .deleter
                        .lock()
                        .unwrap()
                        .delete_shared_buffer_when_unused(
                            queue.pending_submit_serial(),
                            entry.clone(),
                        );
                    enqueued = true;
                }
            }
            if !enqueued {
                if let Some(queue) = self.device.queue_shared(QueueType::Graphics) {
                    queue
                        .deleter
                        .lock()
                        .unwrap()
                        .delete_shared_buffer_when_unused(queue.pending_submit_serial(), entry);
                }
            }
        }
    }

    /// Transitions the buffer into `usage` on `queue`, appending at most one
    /// barrier to the record context. When an Exclusive-mode buffer moves
    /// between queues, the matching release barrier is recorded on the old
    /// queue's pending commands.
    pub(crate) fn track_usage(
        &self,
        queue: QueueType,
        ctx: &mut CommandRecordContext,
        usage: BufferUsage,
        shader_stages: ShaderStages,
    ) {
        let pending_serial = self
            .device
            .queue_shared(queue)
            .expect("buffer used on a queue the device does not have")
            .pending_submit_serial();

        let (barrier, release) = {
            let mut tracking = self.tracking.lock().unwrap();
            let release_from = {
                let need_transfer = self.share_mode != ShareMode::Concurrent
                    && tracking.last_used_queue.map_or(false, |q| q != queue);
                if need_transfer {
                    tracking.last_used_queue
                } else {
                    None
                }
            };
            let release = release_from.map(|from| {
                let (released_usage, released_stages) = tracking.release_ownership(from);
                (from, released_usage, released_stages)
            });
            let barrier =
                tracking.transition(queue, pending_serial, self.share_mode, usage, shader_stages);
            (barrier, release)
        };

        if let Some((from, released_usage, released_stages)) = release {
            self.record_release_barrier(from, queue, released_usage, released_stages, ctx);
        }

        if let Some(barrier) = barrier {
            let queue_shared = self.device.queue_shared(queue).unwrap();
            let (src_family, dst_family, src_access, src_stage) = match barrier.transfer_from {
                Some(from) => {
                    let from_family = self
                        .device
                        .queue_shared(from)
                        .map_or(vk::QUEUE_FAMILY_IGNORED, |q| q.family);
                    // Acquire half of the transfer: source masks are zero, the
                    // release already made the writes available.
                    (
                        from_family,
                        queue_shared.family,
                        vk::AccessFlags2::empty(),
                        vk::PipelineStageFlags2::empty(),
                    )
                }
                None => (
                    vk::QUEUE_FAMILY_IGNORED,
                    vk::QUEUE_FAMILY_IGNORED,
                    buffer_access_flags(barrier.src_usage),
                    buffer_pipeline_stages(barrier.src_usage, barrier.src_stages),
                ),
            };
            ctx.buffer_barriers.push(vk::BufferMemoryBarrier2 {
                src_access_mask: src_access,
                src_stage_mask: src_stage,
                dst_access_mask: buffer_access_flags(barrier.dst_usage),
                dst_stage_mask: buffer_pipeline_stages(barrier.dst_usage, barrier.dst_stages),
                src_queue_family_index: src_family,
                dst_queue_family_index: dst_family,
                buffer: self.handle,
                offset: 0,
                size: vk::WHOLE_SIZE,
                ..Default::default()
            });
        }
    }

    /// Records the release half of a queue-ownership transfer on the old
    /// queue's pending commands and makes the acquiring submission wait for
    /// them (timeline semaphores allow wait-before-signal submission order).
    fn record_release_barrier(
        &self,
        from: QueueType,
        to: QueueType,
        released_usage: BufferUsage,
        released_stages: ShaderStages,
        ctx: &mut CommandRecordContext,
    ) {
        let (from_queue, to_queue) = match (
            self.device.queue_shared(from),
            self.device.queue_shared(to),
        ) {
            (Some(f), Some(t)) => (f, t),
            _ => return,
        };
        if from_queue.family == to_queue.family {
            // Same family: no ownership transfer is required.
            return;
        }
        let barrier = vk::BufferMemoryBarrier2 {
            src_access_mask: buffer_access_flags(released_usage),
            src_stage_mask: buffer_pipeline_stages(released_usage, released_stages),
            dst_access_mask: vk::AccessFlags2::empty(),
            dst_stage_mask: vk::PipelineStageFlags2::empty(),
            src_queue_family_index: from_queue.family,
            dst_queue_family_index: to_queue.family,
            buffer: self.handle,
            offset: 0,
            size: vk::WHOLE_SIZE,
            ..Default::default()
        };
        let release_serial = from_queue.record_release_buffer_barrier(barrier);
        ctx.wait_semaphores.push(vk::SemaphoreSubmitInfo {
            semaphore: from_queue.timeline,
            value: release_serial,
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            ..Default::default()
        });
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("label", &self.label)
            .field("size", &self.size)
            .field("usage", &self.usage)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PENDING: u64 = 5;

    fn fresh() -> BufferTracking {
        BufferTracking::default()
    }

    #[test]
    fn first_write_needs_no_barrier() {
        let mut t = fresh();
        let barrier = t.transition(
            QueueType::Graphics,
            PENDING,
            ShareMode::Exclusive,
            BufferUsage::COPY_DST,
            ShaderStages::empty(),
        );
        assert_eq!(barrier, None);
        let track = &t.per_queue[QueueType::Graphics.index()];
        assert_eq!(track.last_write_usage, BufferUsage::COPY_DST);
        assert_eq!(track.last_usage_serial, PENDING);
    }

    #[test]
    fn write_then_read_emits_one_barrier() {
        let mut t = fresh();
        t.transition(
            QueueType::Graphics,
            PENDING,
            ShareMode::Exclusive,
            BufferUsage::COPY_DST,
            ShaderStages::empty(),
        );
        let barrier = t
            .transition(
                QueueType::Graphics,
                PENDING,
                ShareMode::Exclusive,
                BufferUsage::UNIFORM,
                ShaderStages::COMPUTE,
            )
            .expect("write->read needs a barrier");
        assert_eq!(barrier.src_usage, BufferUsage::COPY_DST);
        assert_eq!(barrier.dst_usage, BufferUsage::UNIFORM);
        assert_eq!(barrier.dst_stages, ShaderStages::COMPUTE);
        assert_eq!(barrier.transfer_from, None);
    }

    #[test]
    fn repeated_reads_are_absorbed() {
        let mut t = fresh();
        t.transition(
            QueueType::Graphics,
            PENDING,
            ShareMode::Exclusive,
            BufferUsage::COPY_DST,
            ShaderStages::empty(),
        );
        assert!(t
            .transition(
                QueueType::Graphics,
                PENDING,
                ShareMode::Exclusive,
                BufferUsage::UNIFORM,
                ShaderStages::FRAGMENT,
            )
            .is_some());
        // Same usage and stage again: already waited for the write.
        assert_eq!(
            t.transition(
                QueueType::Graphics,
                PENDING,
                ShareMode::Exclusive,
                BufferUsage::UNIFORM,
                ShaderStages::FRAGMENT,
            ),
            None
        );
        // A different read usage still needs its own barrier.
        assert!(t
            .transition(
                QueueType::Graphics,
                PENDING,
                ShareMode::Exclusive,
                BufferUsage::VERTEX,
                ShaderStages::empty(),
            )
            .is_some());
    }

    #[test]
    fn fragment_read_is_covered_by_vertex_wait() {
        let mut t = fresh();
        t.transition(
            QueueType::Graphics,
            PENDING,
            ShareMode::Exclusive,
            BufferUsage::COPY_DST,
            ShaderStages::empty(),
        );
        assert!(t
            .transition(
                QueueType::Graphics,
                PENDING,
                ShareMode::Exclusive,
                BufferUsage::READ_ONLY_STORAGE,
                ShaderStages::VERTEX,
            )
            .is_some());
        // The implicit vertex->fragment ordering subsumes the fragment read.
        assert_eq!(
            t.transition(
                QueueType::Graphics,
                PENDING,
                ShareMode::Exclusive,
                BufferUsage::READ_ONLY_STORAGE,
                ShaderStages::FRAGMENT,
            ),
            None
        );
        // The fragment stage was still recorded for the next write's source.
        assert!(t.per_queue[QueueType::Graphics.index()]
            .read_stages
            .contains(ShaderStages::FRAGMENT));
    }

    #[test]
    fn read_then_write_uses_reads_as_source() {
        let mut t = fresh();
        t.transition(
            QueueType::Graphics,
            PENDING,
            ShareMode::Exclusive,
            BufferUsage::COPY_DST,
            ShaderStages::empty(),
        );
        t.transition(
            QueueType::Graphics,
            PENDING,
            ShareMode::Exclusive,
            BufferUsage::VERTEX,
            ShaderStages::empty(),
        );
        let barrier = t
            .transition(
                QueueType::Graphics,
                PENDING,
                ShareMode::Exclusive,
                BufferUsage::COPY_DST,
                ShaderStages::empty(),
            )
            .expect("read->write needs a barrier");
        assert_eq!(barrier.src_usage, BufferUsage::VERTEX);
        // Reads reset after the write.
        assert!(t.per_queue[QueueType::Graphics.index()]
            .read_usage
            .is_empty());
    }

    #[test]
    fn map_transitions_are_elided() {
        let mut t = fresh();
        // map-write -> map-write never needs a barrier.
        assert_eq!(
            t.transition(
                QueueType::Graphics,
                PENDING,
                ShareMode::Exclusive,
                BufferUsage::MAP_WRITE,
                ShaderStages::empty(),
            ),
            None
        );
        assert_eq!(
            t.transition(
                QueueType::Graphics,
                PENDING,
                ShareMode::Exclusive,
                BufferUsage::MAP_WRITE,
                ShaderStages::empty(),
            ),
            None
        );
        // Pure map usage does not count as a pending-command use.
        assert_eq!(
            t.per_queue[QueueType::Graphics.index()].last_usage_serial,
            0
        );
    }

    #[test]
    fn exclusive_cross_queue_use_acquires_ownership() {
        let mut t = fresh();
        // Establish ownership on the compute queue with a write+read pair.
        t.transition(
            QueueType::Compute,
            PENDING,
            ShareMode::Exclusive,
            BufferUsage::STORAGE,
            ShaderStages::COMPUTE,
        );
        t.transition(
            QueueType::Compute,
            PENDING,
            ShareMode::Exclusive,
            BufferUsage::COPY_SRC,
            ShaderStages::empty(),
        );
        assert_eq!(t.last_used_queue, Some(QueueType::Compute));

        let barrier = t
            .transition(
                QueueType::Graphics,
                PENDING,
                ShareMode::Exclusive,
                BufferUsage::READ_ONLY_STORAGE,
                ShaderStages::FRAGMENT,
            )
            .expect("cross-queue use must emit an acquire barrier");
        assert_eq!(barrier.transfer_from, Some(QueueType::Compute));
        assert_eq!(t.last_used_queue, Some(QueueType::Graphics));

        // Subsequent reads on the new owner are barrier-free again.
        assert_eq!(
            t.transition(
                QueueType::Graphics,
                PENDING,
                ShareMode::Exclusive,
                BufferUsage::READ_ONLY_STORAGE,
                ShaderStages::FRAGMENT,
            ),
            None
        );
    }

    #[test]
    fn concurrent_mode_never_transfers() {
        let mut t = fresh();
        t.transition(
            QueueType::Compute,
            PENDING,
            ShareMode::Concurrent,
            BufferUsage::STORAGE,
            ShaderStages::COMPUTE,
        );
        t.transition(
            QueueType::Compute,
            PENDING,
            ShareMode::Concurrent,
            BufferUsage::COPY_SRC,
            ShaderStages::empty(),
        );
        let barrier = t.transition(
            QueueType::Graphics,
            PENDING,
            ShareMode::Concurrent,
            BufferUsage::VERTEX,
            ShaderStages::empty(),
        );
        // Fresh track on the graphics queue, no writes there: no barrier.
        assert_eq!(barrier, None);
    }
}
