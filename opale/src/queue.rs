//! Queues: command recording contexts, submission and serial bookkeeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;
use tracing::trace_span;

use crate::buffer::Buffer;
use crate::deleter::ResourceDeleter;
use crate::descriptor::DescriptorSetAllocator;
use crate::device::DeviceShared;
use crate::encoder::CommandList;
use crate::error::{validation_error, Error};
use crate::format::compute_texture_copy_layout;
use crate::serial_queue::SerialQueue;
use crate::texture::TextureSlice;
use crate::types::{
    BufferDesc, BufferUsage, QueueType, ShaderStages, ShareMode, TextureDataLayout, TextureUsage,
};

#[derive(Copy, Clone, Debug, Default)]
pub(crate) struct CommandPoolAndBuffer {
    pub pool: vk::CommandPool,
    pub buffer: vk::CommandBuffer,
}

/// State accumulated for the submission currently being recorded on a queue.
#[derive(Default)]
pub(crate) struct CommandRecordContext {
    pub command_buffer: vk::CommandBuffer,
    pub command_pool: vk::CommandPool,
    pub needs_submit: bool,
    pub wait_semaphores: Vec<vk::SemaphoreSubmitInfo>,
    pub signal_semaphores: Vec<vk::SemaphoreSubmitInfo>,
    pub buffer_barriers: Vec<vk::BufferMemoryBarrier2>,
    pub image_barriers: Vec<vk::ImageMemoryBarrier2>,
}

impl CommandRecordContext {
    /// Flushes the accumulated barriers with one `vkCmdPipelineBarrier2`.
    pub(crate) fn emit_barriers(&mut self, device: &ash::Device) {
        if self.buffer_barriers.is_empty() && self.image_barriers.is_empty() {
            return;
        }
        let dependency_info = vk::DependencyInfo {
            buffer_memory_barrier_count: self.buffer_barriers.len() as u32,
            p_buffer_memory_barriers: self.buffer_barriers.as_ptr(),
            image_memory_barrier_count: self.image_barriers.len() as u32,
            p_image_memory_barriers: self.image_barriers.as_ptr(),
            ..Default::default()
        };
        unsafe {
            device.cmd_pipeline_barrier2(self.command_buffer, &dependency_info);
        }
        self.buffer_barriers.clear();
        self.image_barriers.clear();
    }

    fn reset(&mut self) {
        self.command_buffer = vk::CommandBuffer::null();
        self.command_pool = vk::CommandPool::null();
        self.needs_submit = false;
        self.wait_semaphores.clear();
        self.signal_semaphores.clear();
        self.buffer_barriers.clear();
        self.image_barriers.clear();
    }
}

pub(crate) struct QueueInner {
    pub record: CommandRecordContext,
    unused_command_buffers: Vec<CommandPoolAndBuffer>,
    command_buffers_in_flight: SerialQueue<CommandPoolAndBuffer>,
}

// The p_next chains of the stored barrier and semaphore structs are always
// null; nothing in them is tied to the current thread.
unsafe impl Send for QueueInner {}

/// Queue-ownership release barriers recorded by *other* queues' replays.
///
/// This is a separate mailbox, not part of [`QueueInner`]: the recording
/// thread holds its own queue's `inner` lock at that point, and taking a
/// second `QueueInner` mutex would have no fixed ordering between queues.
/// The mailbox is folded into the next submission of this queue.
#[derive(Default)]
struct PendingReleases {
    buffer_barriers: Vec<vk::BufferMemoryBarrier2>,
    image_barriers: Vec<vk::ImageMemoryBarrier2>,
}

// Same as QueueInner: stored p_next chains are always null.
unsafe impl Send for PendingReleases {}

impl PendingReleases {
    fn drain_into(&mut self, record: &mut CommandRecordContext) -> bool {
        if self.buffer_barriers.is_empty() && self.image_barriers.is_empty() {
            return false;
        }
        record.buffer_barriers.append(&mut self.buffer_barriers);
        record.image_barriers.append(&mut self.image_barriers);
        true
    }
}

/// Internal per-queue state, owned by the device.
pub(crate) struct QueueShared {
    pub(crate) queue_type: QueueType,
    pub(crate) family: u32,
    pub(crate) handle: vk::Queue,
    /// Timeline semaphore signalled with each submission's serial.
    pub(crate) timeline: vk::Semaphore,
    last_submitted_serial: AtomicU64,
    pub(crate) inner: Mutex<QueueInner>,
    pub(crate) deleter: Mutex<ResourceDeleter>,
    pending_deallocations: Mutex<SerialQueue<Arc<DescriptorSetAllocator>>>,
    pending_releases: Mutex<PendingReleases>,
}

impl QueueShared {
    pub(crate) fn new(
        device: &ash::Device,
        family: u32,
        queue_type: QueueType,
    ) -> Result<QueueShared, Error> {
        let handle = unsafe { device.get_device_queue(family, 0) };

        let mut timeline_type_info = vk::SemaphoreTypeCreateInfo {
            semaphore_type: vk::SemaphoreType::TIMELINE,
            initial_value: 0,
            ..Default::default()
        };
        let semaphore_create_info = vk::SemaphoreCreateInfo {
            p_next: &mut timeline_type_info as *mut _ as *const std::ffi::c_void,
            ..Default::default()
        };
        let timeline = unsafe { device.create_semaphore(&semaphore_create_info, None)? };

        let queue = QueueShared {
            queue_type,
            family,
            handle,
            timeline,
            last_submitted_serial: AtomicU64::new(0),
            inner: Mutex::new(QueueInner {
                record: CommandRecordContext::default(),
                unused_command_buffers: Vec::new(),
                command_buffers_in_flight: SerialQueue::new(),
            }),
            deleter: Mutex::new(ResourceDeleter::default()),
            pending_deallocations: Mutex::new(SerialQueue::new()),
            pending_releases: Mutex::new(PendingReleases::default()),
        };
        {
            let mut inner = queue.inner.lock().unwrap();
            queue.next_recording_context(device, &mut inner)?;
        }
        Ok(queue)
    }

    pub(crate) fn last_submitted_serial(&self) -> u64 {
        self.last_submitted_serial.load(Ordering::Acquire)
    }

    /// Serial the next submission will signal.
    pub(crate) fn pending_submit_serial(&self) -> u64 {
        self.last_submitted_serial() + 1
    }

    fn get_or_create_command_pool_and_buffer(
        &self,
        device: &ash::Device,
        inner: &mut QueueInner,
    ) -> Result<CommandPoolAndBuffer, Error> {
        if let Some(entry) = inner.unused_command_buffers.pop() {
            unsafe {
                device.reset_command_pool(entry.pool, vk::CommandPoolResetFlags::empty())?;
            }
            return Ok(entry);
        }

        let create_info = vk::CommandPoolCreateInfo {
            flags: vk::CommandPoolCreateFlags::TRANSIENT,
            queue_family_index: self.family,
            ..Default::default()
        };
        let pool = unsafe { device.create_command_pool(&create_info, None)? };
        let allocate_info = vk::CommandBufferAllocateInfo {
            command_pool: pool,
            level: vk::CommandBufferLevel::PRIMARY,
            command_buffer_count: 1,
            ..Default::default()
        };
        let buffers = unsafe { device.allocate_command_buffers(&allocate_info)? };
        Ok(CommandPoolAndBuffer {
            pool,
            buffer: buffers[0],
        })
    }

    /// Acquires a reset command buffer and starts recording into it.
    fn next_recording_context(
        &self,
        device: &ash::Device,
        inner: &mut QueueInner,
    ) -> Result<(), Error> {
        debug_assert!(!inner.record.needs_submit);
        debug_assert!(inner.record.command_buffer == vk::CommandBuffer::null());

        let entry = self.get_or_create_command_pool_and_buffer(device, inner)?;
        let begin_info = vk::CommandBufferBeginInfo {
            flags: vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT,
            ..Default::default()
        };
        unsafe {
            device.begin_command_buffer(entry.buffer, &begin_info)?;
        }
        inner.record.command_buffer = entry.buffer;
        inner.record.command_pool = entry.pool;
        Ok(())
    }

    /// Submits the in-progress command buffer, if any work was recorded.
    ///
    /// The submission signals the queue timeline at the pending serial and
    /// carries every wait/signal accumulated in the record context.
    pub(crate) fn submit_pending_locked(
        &self,
        device: &DeviceShared,
        inner: &mut QueueInner,
    ) -> Result<(), Error> {
        // Fold in ownership releases recorded by other queues. The mailbox
        // guard is held until the serial is bumped, so a concurrent release
        // push either lands in this submission or reads the next pending
        // serial; the serial it waits on always covers it.
        let mut pending_releases = self.pending_releases.lock().unwrap();
        let drained_releases = pending_releases.drain_into(&mut inner.record);
        if !inner.record.needs_submit && !drained_releases {
            return Ok(());
        }
        let _span = trace_span!("submit", queue = ?self.queue_type).entered();

        // Barriers recorded after the last command still need to land in the
        // buffer.
        inner.record.emit_barriers(&device.raw);

        let command_buffer = inner.record.command_buffer;
        unsafe {
            device.raw.end_command_buffer(command_buffer)?;
        }

        let pending_serial = self.pending_submit_serial();
        inner.record.signal_semaphores.push(vk::SemaphoreSubmitInfo {
            semaphore: self.timeline,
            value: pending_serial,
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            ..Default::default()
        });

        let command_buffer_info = vk::CommandBufferSubmitInfo {
            command_buffer,
            ..Default::default()
        };
        let submit_info = vk::SubmitInfo2 {
            wait_semaphore_info_count: inner.record.wait_semaphores.len() as u32,
            p_wait_semaphore_infos: inner.record.wait_semaphores.as_ptr(),
            command_buffer_info_count: 1,
            p_command_buffer_infos: &command_buffer_info,
            signal_semaphore_info_count: inner.record.signal_semaphores.len() as u32,
            p_signal_semaphore_infos: inner.record.signal_semaphores.as_ptr(),
            ..Default::default()
        };
        let result =
            unsafe { device.raw.queue_submit2(self.handle, &[submit_info], vk::Fence::null()) };
        if let Err(err) = result {
            if err == vk::Result::ERROR_DEVICE_LOST {
                device.mark_lost();
            }
            return Err(err.into());
        }

        self.last_submitted_serial.fetch_add(1, Ordering::Release);
        drop(pending_releases);

        let used = CommandPoolAndBuffer {
            pool: inner.record.command_pool,
            buffer: inner.record.command_buffer,
        };
        inner.command_buffers_in_flight.push(pending_serial, used);

        inner.record.reset();
        self.next_recording_context(&device.raw, inner)
    }

    /// Reads the timeline semaphore. After device loss, every in-flight
    /// serial is treated as completed so reclamation can run.
    pub(crate) fn query_completed_serial(&self, device: &DeviceShared) -> u64 {
        if device.is_lost() {
            return u64::MAX;
        }
        match unsafe { device.raw.get_semaphore_counter_value(self.timeline) } {
            Ok(value) => value,
            Err(err) => {
                if err == vk::Result::ERROR_DEVICE_LOST {
                    device.mark_lost();
                }
                u64::MAX
            }
        }
    }

    /// Runs all serial-keyed reclamation up to `completed_serial`.
    pub(crate) fn tick(&self, device: &DeviceShared, completed_serial: u64) {
        self.deleter.lock().unwrap().tick(device, completed_serial);

        let allocators = self
            .pending_deallocations
            .lock()
            .unwrap()
            .drain_up_to(completed_serial);
        for allocator in allocators {
            allocator.finish_deallocation(self.queue_type, completed_serial);
        }

        let mut inner = self.inner.lock().unwrap();
        let recycled = inner.command_buffers_in_flight.drain_up_to(completed_serial);
        inner.unused_command_buffers.extend(recycled);
    }

    pub(crate) fn enqueue_deferred_deallocation(&self, allocator: Arc<DescriptorSetAllocator>) {
        self.pending_deallocations
            .lock()
            .unwrap()
            .push(self.pending_submit_serial(), allocator);
    }

    /// Parks a buffer queue-ownership release for this queue's next
    /// submission and returns the serial that will signal once it executed.
    ///
    /// Callers hold their own queue's `inner` lock; only the release mailbox
    /// is taken here, never this queue's `inner`.
    pub(crate) fn record_release_buffer_barrier(&self, barrier: vk::BufferMemoryBarrier2) -> u64 {
        let mut pending = self.pending_releases.lock().unwrap();
        pending.buffer_barriers.push(barrier);
        self.pending_submit_serial()
    }

    /// Image flavor of [`QueueShared::record_release_buffer_barrier`].
    pub(crate) fn record_release_image_barrier(&self, barrier: vk::ImageMemoryBarrier2) -> u64 {
        let mut pending = self.pending_releases.lock().unwrap();
        pending.image_barriers.push(barrier);
        self.pending_submit_serial()
    }

    /// Drains everything and destroys the owned Vulkan objects. The caller
    /// must have waited for the queue to go idle.
    pub(crate) fn destroy(&self, device: &DeviceShared) {
        self.tick(device, u64::MAX);

        let mut inner = self.inner.lock().unwrap();
        debug_assert!(inner.command_buffers_in_flight.is_empty());
        unsafe {
            if inner.record.command_pool != vk::CommandPool::null() {
                device.raw.destroy_command_pool(inner.record.command_pool, None);
                inner.record.reset();
            }
            for entry in inner.unused_command_buffers.drain(..) {
                device.raw.destroy_command_pool(entry.pool, None);
            }
            device.raw.destroy_semaphore(self.timeline, None);
        }
    }
}

/// A handle to one of the device's queues.
///
/// Recording onto a single queue must be externally serialized; ticking and
/// submissions on other queues may proceed concurrently.
#[derive(Clone)]
pub struct Queue {
    pub(crate) device: Arc<DeviceShared>,
    pub(crate) queue_type: QueueType,
}

impl Queue {
    pub(crate) fn shared(&self) -> &QueueShared {
        self.device
            .queue_shared(self.queue_type)
            .expect("queue handle for a queue the device does not have")
    }

    pub fn queue_type(&self) -> QueueType {
        self.queue_type
    }

    pub fn family_index(&self) -> u32 {
        self.shared().family
    }

    /// Serial signalled by the most recent submission.
    pub fn last_submitted_serial(&self) -> u64 {
        self.shared().last_submitted_serial()
    }

    /// Serial the next submission will signal.
    pub fn pending_submit_serial(&self) -> u64 {
        self.shared().pending_submit_serial()
    }

    /// Current value of the queue's timeline semaphore.
    pub fn completed_serial(&self) -> u64 {
        self.shared().query_completed_serial(&self.device)
    }

    /// Replays `lists` onto this queue and submits the resulting command
    /// buffer. Returns the serial of the submission.
    pub fn submit(&self, lists: &[&CommandList]) -> Result<u64, Error> {
        self.device.check_not_lost()?;
        let shared = self.shared();
        let mut inner = shared.inner.lock().unwrap();
        for list in lists {
            crate::encoder::replay(list, &self.device, shared, &mut inner)?;
        }
        shared.submit_pending_locked(&self.device, &mut inner)?;
        Ok(shared.last_submitted_serial())
    }

    /// Blocks until the timeline reaches `serial` or the timeout elapses.
    /// Returns `false` on timeout.
    pub fn wait(&self, serial: u64, timeout_ns: u64) -> Result<bool, Error> {
        if self.device.is_lost() {
            return Ok(true);
        }
        let semaphores = [self.shared().timeline];
        let values = [serial];
        let wait_info = vk::SemaphoreWaitInfo {
            semaphore_count: 1,
            p_semaphores: semaphores.as_ptr(),
            p_values: values.as_ptr(),
            ..Default::default()
        };
        match unsafe { self.device.raw.wait_semaphores(&wait_info, timeout_ns) } {
            Ok(()) => Ok(true),
            Err(vk::Result::TIMEOUT) => Ok(false),
            Err(err) => {
                if err == vk::Result::ERROR_DEVICE_LOST {
                    self.device.mark_lost();
                }
                Err(err.into())
            }
        }
    }

    /// Makes this queue's next submission wait for `other` to reach `serial`.
    ///
    /// `serial` must identify a submission that `other` has already begun
    /// recording past, i.e. `serial < other.pending_submit_serial()`.
    pub fn wait_queue(&self, other: &Queue, serial: u64) -> Result<(), Error> {
        if serial >= other.pending_submit_serial() {
            return Err(validation_error!(
                "wait_queue: serial {} has not been submitted on the waited queue",
                serial
            ));
        }
        let shared = self.shared();
        let mut inner = shared.inner.lock().unwrap();
        inner.record.wait_semaphores.push(vk::SemaphoreSubmitInfo {
            semaphore: other.shared().timeline,
            value: serial,
            stage_mask: vk::PipelineStageFlags2::ALL_COMMANDS,
            ..Default::default()
        });
        inner.record.needs_submit = true;
        Ok(())
    }

    /// Copies `data` into `buffer` at `offset` through a staging allocation
    /// recorded on this queue's pending commands.
    pub fn write_buffer(&self, buffer: &Arc<Buffer>, data: &[u8], offset: u64) -> Result<(), Error> {
        self.device.check_not_lost()?;
        if data.is_empty() {
            return Ok(());
        }
        if offset + data.len() as u64 > buffer.size() {
            return Err(validation_error!(
                "write_buffer: range {}..{} out of bounds of buffer `{}` ({} bytes)",
                offset,
                offset + data.len() as u64,
                buffer.label(),
                buffer.size()
            ));
        }

        let staging = self.create_staging_buffer(data.len() as u64)?;
        unsafe {
            let dst = staging
                .mapped_pointer()
                .expect("staging buffer is always mapped")
                .as_ptr() as *mut u8;
            std::ptr::copy_nonoverlapping(data.as_ptr(), dst, data.len());
        }

        let shared = self.shared();
        let mut inner = shared.inner.lock().unwrap();
        inner.record.needs_submit = true;

        // No barrier is needed to make the host writes visible to the copy:
        // vkQueueSubmit performs an implicit domain operation for them.
        staging.track_usage(
            self.queue_type,
            &mut inner.record,
            BufferUsage::COPY_SRC,
            ShaderStages::empty(),
        );
        buffer.track_usage(
            self.queue_type,
            &mut inner.record,
            BufferUsage::COPY_DST,
            ShaderStages::empty(),
        );
        inner.record.emit_barriers(&self.device.raw);

        let region = vk::BufferCopy {
            src_offset: 0,
            dst_offset: offset,
            size: data.len() as u64,
        };
        unsafe {
            self.device.raw.cmd_copy_buffer(
                inner.record.command_buffer,
                staging.handle(),
                buffer.handle(),
                &[region],
            );
        }
        Ok(())
    }

    /// Copies texel data into a texture slice through a staging buffer.
    pub fn write_texture(
        &self,
        dst: &TextureSlice,
        data: &[u8],
        data_layout: &TextureDataLayout,
    ) -> Result<(), Error> {
        self.device.check_not_lost()?;

        let format = dst.texture.format();
        let info = format.info();
        let alignment = self
            .device
            .properties
            .limits
            .optimal_buffer_copy_row_pitch_alignment
            .max(info.bytes_per_block as u64)
            .next_power_of_two();
        let copy = compute_texture_copy_layout(
            format,
            dst.size.width,
            dst.size.height,
            dst.size.depth_or_array_layers,
            alignment,
        );

        let src_bytes_per_row = if data_layout.bytes_per_row != 0 {
            data_layout.bytes_per_row
        } else {
            copy.row_bytes
        };
        let src_rows_per_image = if data_layout.rows_per_image != 0 {
            data_layout.rows_per_image
        } else {
            copy.row_count
        };
        if src_bytes_per_row < copy.row_bytes {
            return Err(validation_error!(
                "write_texture: bytes_per_row {} smaller than one row of data ({})",
                src_bytes_per_row,
                copy.row_bytes
            ));
        }
        let required = data_layout.offset
            + (dst.size.depth_or_array_layers as u64 - 1)
                * src_rows_per_image as u64
                * src_bytes_per_row as u64
            + (copy.row_count as u64 - 1) * src_bytes_per_row as u64
            + copy.row_bytes as u64;
        if (data.len() as u64) < required {
            return Err(validation_error!(
                "write_texture: {} bytes supplied, {} required",
                data.len(),
                required
            ));
        }

        let staging = self.create_staging_buffer(copy.total_bytes)?;
        unsafe {
            let base = staging
                .mapped_pointer()
                .expect("staging buffer is always mapped")
                .as_ptr() as *mut u8;
            for slice in 0..dst.size.depth_or_array_layers as u64 {
                for row in 0..copy.row_count as u64 {
                    let src_offset = data_layout.offset
                        + slice * src_rows_per_image as u64 * src_bytes_per_row as u64
                        + row * src_bytes_per_row as u64;
                    let dst_offset = slice * copy.depth_stride as u64 + row * copy.row_stride as u64;
                    std::ptr::copy_nonoverlapping(
                        data.as_ptr().add(src_offset as usize),
                        base.add(dst_offset as usize),
                        copy.row_bytes as usize,
                    );
                }
            }
        }

        let shared = self.shared();
        let mut inner = shared.inner.lock().unwrap();
        inner.record.needs_submit = true;

        staging.track_usage(
            self.queue_type,
            &mut inner.record,
            BufferUsage::COPY_SRC,
            ShaderStages::empty(),
        );
        dst.texture.track_usage(
            self.queue_type,
            &mut inner.record,
            TextureUsage::COPY_DST,
            ShaderStages::empty(),
            &dst.subresource_range(),
        );
        inner.record.emit_barriers(&self.device.raw);

        let (base_array_layer, layer_count) = dst.layers();
        let region = vk::BufferImageCopy {
            buffer_offset: 0,
            buffer_row_length: copy.row_stride / info.bytes_per_block * info.block_size,
            buffer_image_height: copy.row_count * info.block_size,
            image_subresource: vk::ImageSubresourceLayers {
                aspect_mask: crate::format::vk_aspect_flags(dst.aspects()),
                mip_level: dst.mip_level,
                base_array_layer,
                layer_count,
            },
            image_offset: vk::Offset3D {
                x: dst.origin.x as i32,
                y: dst.origin.y as i32,
                z: if dst.texture.dimension() == crate::types::TextureDimension::D3 {
                    dst.origin.z as i32
                } else {
                    0
                },
            },
            image_extent: vk::Extent3D {
                width: dst.size.width,
                height: dst.size.height,
                depth: if dst.texture.dimension() == crate::types::TextureDimension::D3 {
                    dst.size.depth_or_array_layers
                } else {
                    1
                },
            },
        };
        unsafe {
            self.device.raw.cmd_copy_buffer_to_image(
                inner.record.command_buffer,
                staging.handle(),
                dst.texture.handle(),
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );
        }
        Ok(())
    }

    fn create_staging_buffer(&self, size: u64) -> Result<Arc<Buffer>, Error> {
        Buffer::create(
            &self.device,
            &BufferDesc {
                label: "staging",
                size,
                usage: BufferUsage::MAP_WRITE | BufferUsage::COPY_SRC,
                share_mode: ShareMode::Exclusive,
            },
        )
    }
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("queue_type", &self.queue_type)
            .finish()
    }
}
