//! Swapchain: image acquisition, presentation and their semaphores.

use std::sync::Arc;

use ash::vk;
use tracing::warn;

use crate::device::DeviceShared;
use crate::error::{validation_error, Error};
use crate::format::TextureFormat;
use crate::texture::{Texture, TextureView};
use crate::types::{QueueType, ShaderStages, TextureUsage, TextureViewDesc};

/// Presentation modes, in the vocabulary of the surface.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum PresentMode {
    Immediate,
    Mailbox,
    Fifo,
    FifoRelaxed,
}

pub(crate) fn vk_present_mode(mode: PresentMode) -> vk::PresentModeKHR {
    match mode {
        PresentMode::Immediate => vk::PresentModeKHR::IMMEDIATE,
        PresentMode::Mailbox => vk::PresentModeKHR::MAILBOX,
        PresentMode::Fifo => vk::PresentModeKHR::FIFO,
        PresentMode::FifoRelaxed => vk::PresentModeKHR::FIFO_RELAXED,
    }
}

fn present_mode_from_vk(mode: vk::PresentModeKHR) -> PresentMode {
    match mode {
        vk::PresentModeKHR::IMMEDIATE => PresentMode::Immediate,
        vk::PresentModeKHR::MAILBOX => PresentMode::Mailbox,
        vk::PresentModeKHR::FIFO_RELAXED => PresentMode::FifoRelaxed,
        _ => PresentMode::Fifo,
    }
}

/// Minimum number of swapchain images that lets a present mode run without
/// stalling.
pub(crate) fn min_image_count_for_present_mode(mode: vk::PresentModeKHR) -> u32 {
    match mode {
        vk::PresentModeKHR::MAILBOX => 3,
        _ => 2,
    }
}

/// Picks the present mode: the requested one when supported, otherwise the
/// first supported fallback. FIFO is the only guaranteed mode so it ends the
/// chain; IMMEDIATE tears, so it must not serve as fallback for MAILBOX.
pub(crate) fn choose_present_mode(
    supported: &[vk::PresentModeKHR],
    requested: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    const FALLBACKS: [vk::PresentModeKHR; 4] = [
        vk::PresentModeKHR::IMMEDIATE,
        vk::PresentModeKHR::MAILBOX,
        vk::PresentModeKHR::FIFO_RELAXED,
        vk::PresentModeKHR::FIFO,
    ];
    let mut index = FALLBACKS
        .iter()
        .position(|&m| m == requested)
        .unwrap_or(FALLBACKS.len() - 1);
    while !supported.contains(&FALLBACKS[index]) {
        index += 1;
        assert!(index < FALLBACKS.len(), "FIFO must be supported");
    }
    FALLBACKS[index]
}

/// Outcome of [`Swapchain::acquire_next_texture`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AcquireStatus {
    Success,
    /// The surface is gone (or could not be recreated); the swapchain is
    /// unusable.
    SurfaceLost,
}

#[derive(Clone, Debug)]
pub struct SwapchainDesc {
    pub width: u32,
    pub height: u32,
    pub format: TextureFormat,
    pub present_mode: PresentMode,
}

struct PerImage {
    texture: Arc<Texture>,
    view: Arc<TextureView>,
    /// Binary semaphore signalled by the submission that renders to this
    /// image and waited on by the present.
    rendering_done_semaphore: vk::Semaphore,
}

struct PerFrameInFlight {
    acquire_semaphore: vk::Semaphore,
    fence: vk::Fence,
}

/// A window-system swapchain bound to the graphics queue.
pub struct Swapchain {
    device: Arc<DeviceShared>,
    surface: vk::SurfaceKHR,
    handle: vk::SwapchainKHR,
    format: TextureFormat,
    present_mode: PresentMode,
    width: u32,
    height: u32,
    images: Vec<PerImage>,
    frames: Vec<PerFrameInFlight>,
    frame_index: usize,
    image_index: u32,
}

impl Swapchain {
    /// Wraps `surface` in a swapchain. Takes ownership of the surface; it is
    /// destroyed together with the swapchain.
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        surface: vk::SurfaceKHR,
        desc: &SwapchainDesc,
    ) -> Result<Swapchain, Error> {
        device.check_not_lost()?;
        if surface == vk::SurfaceKHR::null() {
            return Err(validation_error!("swapchain: surface handle is null"));
        }
        let mut swapchain = Swapchain {
            device: device.clone(),
            surface,
            handle: vk::SwapchainKHR::null(),
            format: desc.format,
            present_mode: desc.present_mode,
            width: desc.width,
            height: desc.height,
            images: Vec::new(),
            frames: Vec::new(),
            frame_index: 0,
            image_index: 0,
        };
        swapchain.recreate()?;
        Ok(swapchain)
    }

    /// (Re)creates the native swapchain, reusing the current handle as
    /// `oldSwapchain`.
    fn recreate(&mut self) -> Result<(), Error> {
        let device = self.device.clone();
        let instance = &device.instance;
        let physical_device = device.physical_device;

        let surface_formats = unsafe {
            instance
                .vk_khr_surface
                .get_physical_device_surface_formats(physical_device, self.surface)?
        };
        assert!(!surface_formats.is_empty());

        // Requested format first, then the common fallbacks.
        let preferred = [
            self.format.to_vk(),
            vk::Format::R8G8B8A8_SRGB,
            vk::Format::B8G8R8A8_UNORM,
            vk::Format::R8G8B8A8_UNORM,
        ];
        let mut selected = surface_formats[0];
        'outer: for &wanted in &preferred {
            for candidate in &surface_formats {
                if candidate.format == wanted {
                    selected = *candidate;
                    break 'outer;
                }
            }
        }
        if selected.format != self.format.to_vk() {
            warn!(
                "requested surface format {:?} not supported, using {:?}",
                self.format, selected.format
            );
            self.format = TextureFormat::from_vk(selected.format).ok_or_else(|| {
                validation_error!("surface reports no usable format")
            })?;
        }

        let capabilities = unsafe {
            instance
                .vk_khr_surface
                .get_physical_device_surface_capabilities(physical_device, self.surface)?
        };
        let present_modes = unsafe {
            instance
                .vk_khr_surface
                .get_physical_device_surface_present_modes(physical_device, self.surface)?
        };
        let present_mode = choose_present_mode(&present_modes, vk_present_mode(self.present_mode));
        if present_mode != vk_present_mode(self.present_mode) {
            warn!(
                "requested present mode {:?} not supported, using {:?}",
                self.present_mode, present_mode
            );
            self.present_mode = present_mode_from_vk(present_mode);
        }

        let extent = if capabilities.current_extent.width != u32::MAX {
            capabilities.current_extent
        } else {
            vk::Extent2D {
                width: self.width.clamp(
                    capabilities.min_image_extent.width,
                    capabilities.max_image_extent.width,
                ),
                height: self.height.clamp(
                    capabilities.min_image_extent.height,
                    capabilities.max_image_extent.height,
                ),
            }
        };
        self.width = extent.width;
        self.height = extent.height;

        let mut image_count = capabilities
            .min_image_count
            .max(min_image_count_for_present_mode(present_mode));
        if capabilities.max_image_count > 0 {
            image_count = image_count.min(capabilities.max_image_count);
        }

        let pre_transform = if capabilities
            .supported_transforms
            .contains(vk::SurfaceTransformFlagsKHR::IDENTITY)
        {
            vk::SurfaceTransformFlagsKHR::IDENTITY
        } else {
            capabilities.current_transform
        };

        // First supported composite alpha mode wins.
        let composite_alpha = [
            vk::CompositeAlphaFlagsKHR::OPAQUE,
            vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
            vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
            vk::CompositeAlphaFlagsKHR::INHERIT,
        ]
        .into_iter()
        .find(|&mode| capabilities.supported_composite_alpha.contains(mode))
        .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE);

        let mut image_usage = vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::SAMPLED;
        if capabilities
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::TRANSFER_SRC)
        {
            image_usage |= vk::ImageUsageFlags::TRANSFER_SRC;
        }
        if capabilities
            .supported_usage_flags
            .contains(vk::ImageUsageFlags::TRANSFER_DST)
        {
            image_usage |= vk::ImageUsageFlags::TRANSFER_DST;
        }

        let old_swapchain = self.handle;
        let create_info = vk::SwapchainCreateInfoKHR {
            surface: self.surface,
            min_image_count: image_count,
            image_format: selected.format,
            image_color_space: selected.color_space,
            image_extent: extent,
            image_array_layers: 1,
            image_usage,
            image_sharing_mode: vk::SharingMode::EXCLUSIVE,
            pre_transform,
            composite_alpha,
            present_mode,
            clipped: vk::TRUE,
            old_swapchain,
            ..Default::default()
        };
        let handle = unsafe { device.vk_khr_swapchain.create_swapchain(&create_info, None)? };
        self.handle = handle;

        if old_swapchain != vk::SwapchainKHR::null() {
            // The previous images may still be in flight; their semaphores and
            // fences go through the deleter. The swapchain handle itself can
            // die now, creation with `oldSwapchain` retired it.
            self.retire_sync_objects();
            unsafe {
                device.vk_khr_swapchain.destroy_swapchain(old_swapchain, None);
            }
        }

        let images = unsafe { device.vk_khr_swapchain.get_swapchain_images(handle)? };
        self.images = Vec::with_capacity(images.len());
        self.frames = Vec::with_capacity(images.len());
        for (i, &image) in images.iter().enumerate() {
            let texture = Texture::for_swapchain_image(
                &device,
                &format!("swapchain image {}", i),
                extent.width,
                extent.height,
                self.format,
                image,
            );
            let view = texture.create_view(&TextureViewDesc {
                label: "swapchain image view",
                ..Default::default()
            })?;

            let semaphore_create_info = vk::SemaphoreCreateInfo::default();
            let rendering_done_semaphore =
                unsafe { device.raw.create_semaphore(&semaphore_create_info, None)? };
            let acquire_semaphore =
                unsafe { device.raw.create_semaphore(&semaphore_create_info, None)? };
            let fence_create_info = vk::FenceCreateInfo {
                flags: vk::FenceCreateFlags::SIGNALED,
                ..Default::default()
            };
            let fence = unsafe { device.raw.create_fence(&fence_create_info, None)? };

            self.images.push(PerImage {
                texture,
                view,
                rendering_done_semaphore,
            });
            self.frames.push(PerFrameInFlight {
                acquire_semaphore,
                fence,
            });
        }
        self.frame_index = 0;
        self.image_index = 0;
        Ok(())
    }

    fn retire_sync_objects(&mut self) {
        if let Some(queue) = self.device.queue_shared(QueueType::Graphics) {
            let serial = queue.pending_submit_serial();
            let mut deleter = queue.deleter.lock().unwrap();
            for image in self.images.drain(..) {
                deleter.delete_semaphore_when_unused(serial, image.rendering_done_semaphore);
            }
            for frame in self.frames.drain(..) {
                deleter.delete_semaphore_when_unused(serial, frame.acquire_semaphore);
                deleter.delete_fence_when_unused(serial, frame.fence);
            }
        }
    }

    /// Applies a new configuration (size, format, present mode) and rebuilds
    /// the native swapchain.
    pub fn configure(&mut self, desc: &SwapchainDesc) -> Result<(), Error> {
        self.width = desc.width;
        self.height = desc.height;
        self.format = desc.format;
        self.present_mode = desc.present_mode;
        self.recreate()
    }

    /// Releases the native swapchain while keeping the surface, so a later
    /// [`Swapchain::configure`] can rebuild it.
    pub fn unconfigure(&mut self) {
        self.retire_sync_objects();
        if self.handle != vk::SwapchainKHR::null() {
            if let Some(queue) = self.device.queue_shared(QueueType::Graphics) {
                queue
                    .deleter
                    .lock()
                    .unwrap()
                    .delete_surface_swapchain_when_unused(
                        queue.pending_submit_serial(),
                        vk::SurfaceKHR::null(),
                        self.handle,
                    );
            }
            self.handle = vk::SwapchainKHR::null();
        }
    }

    pub fn format(&self) -> TextureFormat {
        self.format
    }

    pub fn present_mode(&self) -> PresentMode {
        self.present_mode
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    /// The texture acquired by the last successful
    /// [`Swapchain::acquire_next_texture`].
    pub fn current_texture(&self) -> &Arc<Texture> {
        &self.images[self.image_index as usize].texture
    }

    pub fn current_texture_view(&self) -> &Arc<TextureView> {
        &self.images[self.image_index as usize].view
    }

    /// Acquires the next image, waiting on the per-frame fence so at most
    /// `image count` frames are in flight. On an outdated surface the
    /// swapchain is recreated and the acquire retried once.
    pub fn acquire_next_texture(&mut self) -> Result<AcquireStatus, Error> {
        self.acquire_next_texture_impl(false)
    }

    fn acquire_next_texture_impl(&mut self, is_retry: bool) -> Result<AcquireStatus, Error> {
        self.device.check_not_lost()?;
        let device = self.device.clone();
        let frame = &self.frames[self.frame_index];
        let acquire_semaphore = frame.acquire_semaphore;
        let fence = frame.fence;

        unsafe {
            device.raw.wait_for_fences(&[fence], true, u64::MAX)?;
            device.raw.reset_fences(&[fence])?;
        }

        let result = unsafe {
            device
                .vk_khr_swapchain
                .acquire_next_image(self.handle, u64::MAX, acquire_semaphore, fence)
        };
        let image_index = match result {
            Ok((index, false)) => index,
            Ok((_, true)) | Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                if is_retry {
                    return Ok(AcquireStatus::SurfaceLost);
                }
                self.recreate()?;
                return self.acquire_next_texture_impl(true);
            }
            Err(vk::Result::ERROR_SURFACE_LOST_KHR) => {
                return Ok(AcquireStatus::SurfaceLost);
            }
            Err(err) => return Err(err.into()),
        };
        self.image_index = image_index;

        // A fresh acquire hands the image back with undefined contents; reset
        // the sync state so the first use transitions from UNDEFINED.
        {
            let texture = &self.images[image_index as usize].texture;
            let mut sync = texture.sync.lock().unwrap();
            sync.fill(crate::texture::TextureSyncInfo {
                usage: TextureUsage::SWAPCHAIN_ACQUIRE,
                shader_stages: ShaderStages::empty(),
                queue: None,
            });
        }

        // The first submission touching the image must wait for the
        // presentation engine to release it.
        let queue = device
            .queue_shared(QueueType::Graphics)
            .expect("device has no graphics queue");
        let mut inner = queue.inner.lock().unwrap();
        inner.record.wait_semaphores.push(vk::SemaphoreSubmitInfo {
            semaphore: acquire_semaphore,
            value: 0,
            stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
            ..Default::default()
        });
        inner.record.needs_submit = true;

        Ok(AcquireStatus::Success)
    }

    /// Transitions the current image for presentation, submits the pending
    /// graphics commands, and presents.
    pub fn present(&mut self) -> Result<(), Error> {
        self.device.check_not_lost()?;
        let device = self.device.clone();
        let queue = device
            .queue_shared(QueueType::Graphics)
            .expect("device has no graphics queue");

        let image = &self.images[self.image_index as usize];
        let rendering_done_semaphore = image.rendering_done_semaphore;

        let present_result = {
            let mut inner = queue.inner.lock().unwrap();
            inner.record.signal_semaphores.push(vk::SemaphoreSubmitInfo {
                semaphore: rendering_done_semaphore,
                value: 0,
                stage_mask: vk::PipelineStageFlags2::COLOR_ATTACHMENT_OUTPUT,
                ..Default::default()
            });
            inner.record.needs_submit = true;

            image.texture.track_usage(
                QueueType::Graphics,
                &mut inner.record,
                TextureUsage::SWAPCHAIN_PRESENT,
                ShaderStages::empty(),
                &image.texture.all_subresources(),
            );
            inner.record.emit_barriers(&device.raw);

            queue.submit_pending_locked(&device, &mut inner)?;

            let present_info = vk::PresentInfoKHR {
                wait_semaphore_count: 1,
                p_wait_semaphores: &rendering_done_semaphore,
                swapchain_count: 1,
                p_swapchains: &self.handle,
                p_image_indices: &self.image_index,
                ..Default::default()
            };
            // Still under the queue lock: presentation accesses the VkQueue.
            unsafe {
                device
                    .vk_khr_swapchain
                    .queue_present(queue.handle, &present_info)
            }
        };

        match present_result {
            Ok(_suboptimal) => {}
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => {
                self.recreate()?;
            }
            Err(err) => {
                if err == vk::Result::ERROR_DEVICE_LOST {
                    device.mark_lost();
                }
                return Err(err.into());
            }
        }

        self.frame_index = (self.frame_index + 1) % self.images.len();
        Ok(())
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.retire_sync_objects();
        // The pair is deferred together so the swapchain dies before its
        // surface, after any in-flight work.
        if let Some(queue) = self.device.queue_shared(QueueType::Graphics) {
            queue
                .deleter
                .lock()
                .unwrap()
                .delete_surface_swapchain_when_unused(
                    queue.pending_submit_serial(),
                    self.surface,
                    self.handle,
                );
        }
    }
}

impl std::fmt::Debug for Swapchain {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Swapchain")
            .field("format", &self.format)
            .field("present_mode", &self.present_mode)
            .field("extent", &(self.width, self.height))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn image_count_per_present_mode() {
        assert_eq!(
            min_image_count_for_present_mode(vk::PresentModeKHR::FIFO),
            2
        );
        assert_eq!(
            min_image_count_for_present_mode(vk::PresentModeKHR::IMMEDIATE),
            2
        );
        assert_eq!(
            min_image_count_for_present_mode(vk::PresentModeKHR::MAILBOX),
            3
        );
    }

    #[test]
    fn present_mode_fallback_chain() {
        let all = [
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
            vk::PresentModeKHR::FIFO_RELAXED,
            vk::PresentModeKHR::FIFO,
        ];
        // Requested mode is available.
        assert_eq!(
            choose_present_mode(&all, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::MAILBOX
        );
        // Mailbox missing: falls through to FIFO_RELAXED, never IMMEDIATE.
        let no_mailbox = [vk::PresentModeKHR::FIFO_RELAXED, vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&no_mailbox, vk::PresentModeKHR::MAILBOX),
            vk::PresentModeKHR::FIFO_RELAXED
        );
        // Only FIFO available.
        let fifo_only = [vk::PresentModeKHR::FIFO];
        assert_eq!(
            choose_present_mode(&fifo_only, vk::PresentModeKHR::IMMEDIATE),
            vk::PresentModeKHR::FIFO
        );
    }
}
