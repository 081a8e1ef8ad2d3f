//! Device creation, queue selection and resource factories.

use std::ffi::CStr;
use std::mem::ManuallyDrop;
use std::os::raw::c_char;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use ash::vk;
use gpu_allocator::vulkan::{Allocator, AllocatorCreateDesc};
use tracing::info;

use crate::bind_set::{BindSet, BindSetDesc, BindSetLayout, BindSetLayoutDesc};
use crate::buffer::Buffer;
use crate::encoder::CommandEncoder;
use crate::error::Error;
use crate::instance::Instance;
use crate::pipeline::{
    ComputePipeline, ComputePipelineDesc, PipelineLayout, PipelineLayoutDesc, RenderPipeline,
    RenderPipelineDesc,
};
use crate::queue::{Queue, QueueShared};
use crate::sampler::Sampler;
use crate::shader::ShaderModule;
use crate::swapchain::{Swapchain, SwapchainDesc};
use crate::texture::Texture;
use crate::types::{
    BufferDesc, QueueType, SamplerDesc, ShaderModuleDesc, TextureDesc,
};
use crate::MAX_QUEUES;

const DEVICE_EXTENSIONS: [*const c_char; 1] =
    [b"VK_KHR_swapchain\0".as_ptr() as *const c_char];

/// Device state shared between queues, resources and the public handle.
pub(crate) struct DeviceShared {
    pub(crate) raw: ash::Device,
    pub(crate) instance: Arc<Instance>,
    pub(crate) physical_device: vk::PhysicalDevice,
    pub(crate) properties: vk::PhysicalDeviceProperties,
    pub(crate) vk_khr_swapchain: ash::extensions::khr::Swapchain,
    // Dropped explicitly before the device; it frees device memory.
    pub(crate) allocator: Mutex<ManuallyDrop<Allocator>>,
    queues: [Option<QueueShared>; MAX_QUEUES],
    lost: AtomicBool,
    next_resource_id: AtomicU64,
}

impl DeviceShared {
    pub(crate) fn queue_shared(&self, queue_type: QueueType) -> Option<&QueueShared> {
        self.queues[queue_type.index()].as_ref()
    }

    /// Distinct queue family indices of the created queues, graphics first.
    pub(crate) fn unique_queue_families(&self) -> Vec<u32> {
        let mut families = Vec::with_capacity(MAX_QUEUES);
        for queue in self.queues.iter().flatten() {
            if !families.contains(&queue.family) {
                families.push(queue.family);
            }
        }
        families
    }

    pub(crate) fn is_lost(&self) -> bool {
        self.lost.load(Ordering::Acquire)
    }

    /// Latches device loss; every subsequent fallible operation reports it.
    pub(crate) fn mark_lost(&self) {
        if !self.lost.swap(true, Ordering::AcqRel) {
            tracing::error!("device lost");
        }
    }

    pub(crate) fn check_not_lost(&self) -> Result<(), Error> {
        if self.is_lost() {
            Err(Error::DeviceLost)
        } else {
            Ok(())
        }
    }

    pub(crate) fn allocate_resource_id(&self) -> u64 {
        self.next_resource_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn set_debug_name(&self, object_type: vk::ObjectType, handle: u64, name: &str) {
        if name.is_empty() {
            return;
        }
        let name = match std::ffi::CString::new(name) {
            Ok(name) => name,
            Err(_) => return,
        };
        let name_info = vk::DebugUtilsObjectNameInfoEXT {
            object_type,
            object_handle: handle,
            p_object_name: name.as_ptr(),
            ..Default::default()
        };
        unsafe {
            let _ = self
                .instance
                .debug_utils()
                .set_debug_utils_object_name(self.raw.handle(), &name_info);
        }
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        unsafe {
            let _ = self.raw.device_wait_idle();
        }
        for queue in self.queues.iter().flatten() {
            queue.destroy(self);
        }
        unsafe {
            ManuallyDrop::drop(&mut *self.allocator.lock().unwrap());
            self.raw.destroy_device(None);
        }
    }
}

struct PhysicalDeviceSelection {
    physical_device: vk::PhysicalDevice,
    properties: vk::PhysicalDeviceProperties,
}

unsafe fn select_physical_device(
    instance: &ash::Instance,
) -> Result<PhysicalDeviceSelection, Error> {
    let physical_devices = instance.enumerate_physical_devices()?;
    if physical_devices.is_empty() {
        return Err(Error::Validation("no device with vulkan support".to_string()));
    }

    let mut selected = None;
    for &physical_device in &physical_devices {
        let properties = instance.get_physical_device_properties(physical_device);
        let is_discrete = properties.device_type == vk::PhysicalDeviceType::DISCRETE_GPU;
        match &selected {
            None => selected = Some((physical_device, properties, is_discrete)),
            Some((_, _, false)) if is_discrete => {
                selected = Some((physical_device, properties, true))
            }
            _ => {}
        }
    }
    let (physical_device, properties, _) = selected.unwrap();
    Ok(PhysicalDeviceSelection {
        physical_device,
        properties,
    })
}

/// Finds the queue family matching `flags`; when several match, the most
/// specialized one (fewest extra capability bits) wins.
unsafe fn find_queue_family(
    instance: &ash::Instance,
    vk_khr_surface: &ash::extensions::khr::Surface,
    physical_device: vk::PhysicalDevice,
    queue_families: &[vk::QueueFamilyProperties],
    flags: vk::QueueFlags,
    present_surface: Option<vk::SurfaceKHR>,
) -> Option<u32> {
    let _ = instance;
    let mut best: Option<(u32, u32)> = None;
    for (index, family) in queue_families.iter().enumerate() {
        if !family.queue_flags.contains(flags) {
            continue;
        }
        if let Some(surface) = present_surface {
            let supported = vk_khr_surface
                .get_physical_device_surface_support(physical_device, index as u32, surface)
                .unwrap_or(false);
            if !supported {
                continue;
            }
        }
        let bits = family.queue_flags.as_raw().count_ones();
        match best {
            Some((_, best_bits)) if bits >= best_bits => {}
            _ => best = Some((index as u32, bits)),
        }
    }
    best.map(|(index, _)| index)
}

/// The GPU device. Cheap to clone; the underlying state is shared.
#[derive(Clone)]
pub struct Device {
    pub(crate) shared: Arc<DeviceShared>,
    empty_bind_set_layout: Arc<BindSetLayout>,
}

impl Device {
    /// Creates a device on the best available adapter. When
    /// `present_surface` is given, the graphics queue is guaranteed to be
    /// able to present to it.
    pub fn new(
        instance: &Arc<Instance>,
        present_surface: Option<vk::SurfaceKHR>,
    ) -> Result<Device, Error> {
        unsafe {
            let selection = select_physical_device(&instance.raw)?;
            let physical_device = selection.physical_device;
            info!(
                "selected physical device: {:?}",
                CStr::from_ptr(selection.properties.device_name.as_ptr())
            );

            let queue_families = instance
                .raw
                .get_physical_device_queue_family_properties(physical_device);

            let graphics_family = find_queue_family(
                &instance.raw,
                &instance.vk_khr_surface,
                physical_device,
                &queue_families,
                vk::QueueFlags::GRAPHICS,
                present_surface,
            )
            .ok_or_else(|| Error::Validation("no graphics queue family".to_string()))?;
            let compute_family = find_queue_family(
                &instance.raw,
                &instance.vk_khr_surface,
                physical_device,
                &queue_families,
                vk::QueueFlags::COMPUTE,
                None,
            )
            .filter(|&family| family != graphics_family);
            let transfer_family = find_queue_family(
                &instance.raw,
                &instance.vk_khr_surface,
                physical_device,
                &queue_families,
                vk::QueueFlags::TRANSFER,
                None,
            )
            .filter(|&family| family != graphics_family && Some(family) != compute_family);

            let mut unique_families = vec![graphics_family];
            unique_families.extend(compute_family);
            unique_families.extend(transfer_family);

            let queue_priorities = [1.0f32];
            let queue_create_infos: Vec<vk::DeviceQueueCreateInfo> = unique_families
                .iter()
                .map(|&family| vk::DeviceQueueCreateInfo {
                    queue_family_index: family,
                    queue_count: 1,
                    p_queue_priorities: queue_priorities.as_ptr(),
                    ..Default::default()
                })
                .collect();

            let mut features13 = vk::PhysicalDeviceVulkan13Features {
                synchronization2: vk::TRUE,
                dynamic_rendering: vk::TRUE,
                ..Default::default()
            };
            let mut features12 = vk::PhysicalDeviceVulkan12Features {
                p_next: &mut features13 as *mut _ as *mut std::ffi::c_void,
                timeline_semaphore: vk::TRUE,
                draw_indirect_count: vk::TRUE,
                ..Default::default()
            };
            let features2 = vk::PhysicalDeviceFeatures2 {
                p_next: &mut features12 as *mut _ as *mut std::ffi::c_void,
                ..Default::default()
            };

            let create_info = vk::DeviceCreateInfo {
                p_next: &features2 as *const _ as *const std::ffi::c_void,
                queue_create_info_count: queue_create_infos.len() as u32,
                p_queue_create_infos: queue_create_infos.as_ptr(),
                enabled_extension_count: DEVICE_EXTENSIONS.len() as u32,
                pp_enabled_extension_names: DEVICE_EXTENSIONS.as_ptr(),
                ..Default::default()
            };
            let raw = instance
                .raw
                .create_device(physical_device, &create_info, None)?;

            let vk_khr_swapchain = ash::extensions::khr::Swapchain::new(&instance.raw, &raw);

            let allocator = Allocator::new(&AllocatorCreateDesc {
                instance: instance.raw.clone(),
                device: raw.clone(),
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })
            .map_err(Error::from)?;

            let mut queues: [Option<QueueShared>; MAX_QUEUES] = Default::default();
            queues[QueueType::Graphics.index()] =
                Some(QueueShared::new(&raw, graphics_family, QueueType::Graphics)?);
            if let Some(family) = compute_family {
                queues[QueueType::Compute.index()] =
                    Some(QueueShared::new(&raw, family, QueueType::Compute)?);
            }
            if let Some(family) = transfer_family {
                queues[QueueType::Transfer.index()] =
                    Some(QueueShared::new(&raw, family, QueueType::Transfer)?);
            }

            let shared = Arc::new(DeviceShared {
                raw,
                instance: instance.clone(),
                physical_device,
                properties: selection.properties,
                vk_khr_swapchain,
                allocator: Mutex::new(ManuallyDrop::new(allocator)),
                queues,
                lost: AtomicBool::new(false),
                next_resource_id: AtomicU64::new(1),
            });

            // Empty layout backing unused pipeline-layout slots.
            let empty_bind_set_layout = BindSetLayout::create(
                &shared,
                &BindSetLayoutDesc {
                    label: "empty bind set layout",
                    entries: &[],
                },
            )?;

            Ok(Device {
                shared,
                empty_bind_set_layout,
            })
        }
    }

    /// Returns a handle to the queue of the given type, if the device has
    /// one. The graphics queue always exists.
    pub fn queue(&self, queue_type: QueueType) -> Option<Queue> {
        self.shared.queue_shared(queue_type).map(|_| Queue {
            device: self.shared.clone(),
            queue_type,
        })
    }

    pub fn graphics_queue(&self) -> Queue {
        self.queue(QueueType::Graphics)
            .expect("the graphics queue always exists")
    }

    /// Polls every queue's timeline and runs the serial-keyed reclamation:
    /// deferred frees, descriptor deallocations and command-buffer recycling.
    pub fn tick(&self) {
        for queue_type in QueueType::ALL {
            if let Some(queue) = self.shared.queue_shared(queue_type) {
                let completed = queue.query_completed_serial(&self.shared);
                queue.tick(&self.shared, completed);
            }
        }
    }

    /// Blocks until the GPU is idle, then reclaims everything.
    pub fn wait_idle(&self) -> Result<(), Error> {
        let result = unsafe { self.shared.raw.device_wait_idle() };
        if let Err(err) = result {
            if err == vk::Result::ERROR_DEVICE_LOST {
                self.shared.mark_lost();
            } else {
                return Err(err.into());
            }
        }
        self.tick();
        Ok(())
    }

    pub fn is_lost(&self) -> bool {
        self.shared.is_lost()
    }

    pub fn limits(&self) -> &vk::PhysicalDeviceLimits {
        &self.shared.properties.limits
    }

    pub fn create_buffer(&self, desc: &BufferDesc) -> Result<Arc<Buffer>, Error> {
        Buffer::create(&self.shared, desc)
    }

    pub fn create_texture(&self, desc: &TextureDesc) -> Result<Arc<Texture>, Error> {
        Texture::create(&self.shared, desc)
    }

    pub fn create_sampler(&self, desc: &SamplerDesc) -> Result<Arc<Sampler>, Error> {
        Sampler::create(&self.shared, desc)
    }

    pub fn create_shader_module(&self, desc: &ShaderModuleDesc) -> Result<Arc<ShaderModule>, Error> {
        ShaderModule::create(&self.shared, desc)
    }

    pub fn create_bind_set_layout(
        &self,
        desc: &BindSetLayoutDesc,
    ) -> Result<Arc<BindSetLayout>, Error> {
        BindSetLayout::create(&self.shared, desc)
    }

    pub fn create_bind_set(&self, desc: &BindSetDesc) -> Result<Arc<BindSet>, Error> {
        BindSet::create(&self.shared, desc)
    }

    pub fn create_pipeline_layout(
        &self,
        desc: &PipelineLayoutDesc,
    ) -> Result<Arc<PipelineLayout>, Error> {
        PipelineLayout::create(&self.shared, &self.empty_bind_set_layout, desc)
    }

    pub fn create_render_pipeline(
        &self,
        desc: &RenderPipelineDesc,
    ) -> Result<Arc<RenderPipeline>, Error> {
        RenderPipeline::create(&self.shared, desc)
    }

    pub fn create_compute_pipeline(
        &self,
        desc: &ComputePipelineDesc,
    ) -> Result<Arc<ComputePipeline>, Error> {
        ComputePipeline::create(&self.shared, desc)
    }

    pub fn create_command_encoder(&self) -> CommandEncoder {
        CommandEncoder::new()
    }

    /// Wraps `surface` in a swapchain bound to the graphics queue. The
    /// swapchain takes ownership of the surface.
    pub fn create_swapchain(
        &self,
        surface: vk::SurfaceKHR,
        desc: &SwapchainDesc,
    ) -> Result<Swapchain, Error> {
        Swapchain::create(&self.shared, surface, desc)
    }

    pub fn empty_bind_set_layout(&self) -> &Arc<BindSetLayout> {
        &self.empty_bind_set_layout
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Device").finish()
    }
}
