//! Per-queue deferred destruction of GPU-visible handles.
//!
//! Every entry is keyed on the queue's pending submit serial at enqueue time
//! and destroyed once the queue timeline has reached that serial.

use std::sync::Arc;

use ash::vk;
use gpu_allocator::vulkan::Allocation;
use tracing::trace;

use crate::device::DeviceShared;
use crate::serial_queue::SerialQueue;

/// A buffer handle together with its device memory.
#[derive(Debug)]
pub(crate) struct BufferAllocation {
    pub handle: vk::Buffer,
    pub allocation: Option<Allocation>,
}

/// An image handle together with its device memory. Swapchain images carry no
/// allocation of their own.
#[derive(Debug)]
pub(crate) struct ImageAllocation {
    pub handle: vk::Image,
    pub allocation: Option<Allocation>,
}

/// Serial-keyed free lists for every destructible handle kind.
#[derive(Default)]
pub(crate) struct ResourceDeleter {
    buffers: SerialQueue<BufferAllocation>,
    images: SerialQueue<ImageAllocation>,
    image_views: SerialQueue<vk::ImageView>,
    pipelines: SerialQueue<vk::Pipeline>,
    pipeline_layouts: SerialQueue<vk::PipelineLayout>,
    samplers: SerialQueue<vk::Sampler>,
    shader_modules: SerialQueue<vk::ShaderModule>,
    semaphores: SerialQueue<vk::Semaphore>,
    fences: SerialQueue<vk::Fence>,
    surface_swapchains: SerialQueue<(vk::SurfaceKHR, vk::SwapchainKHR)>,
    // Allocations shared between queues; the queue that drops the last
    // reference performs the actual destruction.
    shared_buffers: SerialQueue<Arc<BufferAllocation>>,
    shared_images: SerialQueue<Arc<ImageAllocation>>,
    shared_pipelines: SerialQueue<Arc<PipelineHandle>>,
    shared_descriptor_pools: SerialQueue<Arc<DescriptorPoolHandle>>,
}

/// A pipeline that may still be referenced by submissions on several queues.
#[derive(Debug)]
pub(crate) struct PipelineHandle {
    pub handle: vk::Pipeline,
}

/// A retired descriptor pool whose sets may still be in flight on several
/// queues.
#[derive(Debug)]
pub(crate) struct DescriptorPoolHandle {
    pub handle: vk::DescriptorPool,
}

impl ResourceDeleter {
    pub(crate) fn delete_buffer_when_unused(&mut self, serial: u64, entry: BufferAllocation) {
        self.buffers.push(serial, entry);
    }

    pub(crate) fn delete_image_when_unused(&mut self, serial: u64, entry: ImageAllocation) {
        self.images.push(serial, entry);
    }

    pub(crate) fn delete_image_view_when_unused(&mut self, serial: u64, view: vk::ImageView) {
        self.image_views.push(serial, view);
    }

    pub(crate) fn delete_pipeline_when_unused(&mut self, serial: u64, pipeline: vk::Pipeline) {
        self.pipelines.push(serial, pipeline);
    }

    pub(crate) fn delete_pipeline_layout_when_unused(
        &mut self,
        serial: u64,
        layout: vk::PipelineLayout,
    ) {
        self.pipeline_layouts.push(serial, layout);
    }

    pub(crate) fn delete_sampler_when_unused(&mut self, serial: u64, sampler: vk::Sampler) {
        self.samplers.push(serial, sampler);
    }

    pub(crate) fn delete_shader_module_when_unused(
        &mut self,
        serial: u64,
        module: vk::ShaderModule,
    ) {
        self.shader_modules.push(serial, module);
    }

    pub(crate) fn delete_semaphore_when_unused(&mut self, serial: u64, semaphore: vk::Semaphore) {
        self.semaphores.push(serial, semaphore);
    }

    pub(crate) fn delete_fence_when_unused(&mut self, serial: u64, fence: vk::Fence) {
        self.fences.push(serial, fence);
    }

    /// Surface and swapchain are deferred as a pair so the swapchain is
    /// destroyed before its surface.
    pub(crate) fn delete_surface_swapchain_when_unused(
        &mut self,
        serial: u64,
        surface: vk::SurfaceKHR,
        swapchain: vk::SwapchainKHR,
    ) {
        self.surface_swapchains.push(serial, (surface, swapchain));
    }

    pub(crate) fn delete_shared_buffer_when_unused(
        &mut self,
        serial: u64,
        entry: Arc<BufferAllocation>,
    ) {
        self.shared_buffers.push(serial, entry);
    }

    pub(crate) fn delete_shared_image_when_unused(
        &mut self,
        serial: u64,
        entry: Arc<ImageAllocation>,
    ) {
        self.shared_images.push(serial, entry);
    }

    pub(crate) fn delete_shared_pipeline_when_unused(
        &mut self,
        serial: u64,
        entry: Arc<PipelineHandle>,
    ) {
        self.shared_pipelines.push(serial, entry);
    }

    pub(crate) fn delete_shared_descriptor_pool_when_unused(
        &mut self,
        serial: u64,
        entry: Arc<DescriptorPoolHandle>,
    ) {
        self.shared_descriptor_pools.push(serial, entry);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.buffers.is_empty()
            && self.images.is_empty()
            && self.image_views.is_empty()
            && self.pipelines.is_empty()
            && self.pipeline_layouts.is_empty()
            && self.samplers.is_empty()
            && self.shader_modules.is_empty()
            && self.semaphores.is_empty()
            && self.fences.is_empty()
            && self.surface_swapchains.is_empty()
            && self.shared_buffers.is_empty()
            && self.shared_images.is_empty()
            && self.shared_pipelines.is_empty()
            && self.shared_descriptor_pools.is_empty()
    }

    /// Destroys everything enqueued at a serial <= `completed_serial`.
    ///
    /// Buckets are drained in a dependency-respecting order: memory-backed
    /// objects first, then views, pools and pipeline state, then sync
    /// primitives, and the surface/swapchain pair last.
    pub(crate) fn tick(&mut self, device: &DeviceShared, completed_serial: u64) {
        for entry in self.shared_buffers.drain_up_to(completed_serial) {
            if let Ok(entry) = Arc::try_unwrap(entry) {
                destroy_buffer_allocation(device, entry);
            }
        }
        for entry in self.shared_images.drain_up_to(completed_serial) {
            if let Ok(entry) = Arc::try_unwrap(entry) {
                destroy_image_allocation(device, entry);
            }
        }
        for entry in self.shared_pipelines.drain_up_to(completed_serial) {
            if let Ok(entry) = Arc::try_unwrap(entry) {
                unsafe { device.raw.destroy_pipeline(entry.handle, None) };
            }
        }
        for entry in self.shared_descriptor_pools.drain_up_to(completed_serial) {
            if let Ok(entry) = Arc::try_unwrap(entry) {
                unsafe { device.raw.destroy_descriptor_pool(entry.handle, None) };
            }
        }

        for entry in self.buffers.drain_up_to(completed_serial) {
            destroy_buffer_allocation(device, entry);
        }
        for entry in self.images.drain_up_to(completed_serial) {
            destroy_image_allocation(device, entry);
        }

        unsafe {
            for view in self.image_views.drain_up_to(completed_serial) {
                device.raw.destroy_image_view(view, None);
            }
            for layout in self.pipeline_layouts.drain_up_to(completed_serial) {
                device.raw.destroy_pipeline_layout(layout, None);
            }
            for pipeline in self.pipelines.drain_up_to(completed_serial) {
                device.raw.destroy_pipeline(pipeline, None);
            }
            for sampler in self.samplers.drain_up_to(completed_serial) {
                device.raw.destroy_sampler(sampler, None);
            }
            for module in self.shader_modules.drain_up_to(completed_serial) {
                device.raw.destroy_shader_module(module, None);
            }
            for semaphore in self.semaphores.drain_up_to(completed_serial) {
                device.raw.destroy_semaphore(semaphore, None);
            }
            for fence in self.fences.drain_up_to(completed_serial) {
                device.raw.destroy_fence(fence, None);
            }
            for (surface, swapchain) in self.surface_swapchains.drain_up_to(completed_serial) {
                if swapchain != vk::SwapchainKHR::null() {
                    device.vk_khr_swapchain.destroy_swapchain(swapchain, None);
                }
                if surface != vk::SurfaceKHR::null() {
                    device
                        .instance
                        .vk_khr_surface
                        .destroy_surface(surface, None);
                }
            }
        }
    }
}

fn destroy_buffer_allocation(device: &DeviceShared, entry: BufferAllocation) {
    trace!(handle = ?entry.handle, "destroy buffer");
    unsafe {
        device.raw.destroy_buffer(entry.handle, None);
    }
    if let Some(allocation) = entry.allocation {
        let _ = device.allocator.lock().unwrap().free(allocation);
    }
}

fn destroy_image_allocation(device: &DeviceShared, entry: ImageAllocation) {
    trace!(handle = ?entry.handle, "destroy image");
    unsafe {
        device.raw.destroy_image(entry.handle, None);
    }
    if let Some(allocation) = entry.allocation {
        let _ = device.allocator.lock().unwrap().free(allocation);
    }
}
