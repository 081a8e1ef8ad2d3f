//! Sampler objects.

use std::sync::Arc;

use ash::vk;

use crate::device::DeviceShared;
use crate::error::Error;
use crate::types::{AddressMode, BorderColor, CompareFunction, FilterMode, QueueType, SamplerDesc};

fn vk_filter(filter: FilterMode) -> vk::Filter {
    match filter {
        FilterMode::Nearest => vk::Filter::NEAREST,
        FilterMode::Linear => vk::Filter::LINEAR,
    }
}

fn vk_mipmap_mode(filter: FilterMode) -> vk::SamplerMipmapMode {
    match filter {
        FilterMode::Nearest => vk::SamplerMipmapMode::NEAREST,
        FilterMode::Linear => vk::SamplerMipmapMode::LINEAR,
    }
}

fn vk_address_mode(mode: AddressMode) -> vk::SamplerAddressMode {
    match mode {
        AddressMode::ClampToEdge => vk::SamplerAddressMode::CLAMP_TO_EDGE,
        AddressMode::Repeat => vk::SamplerAddressMode::REPEAT,
        AddressMode::MirrorRepeat => vk::SamplerAddressMode::MIRRORED_REPEAT,
        AddressMode::ClampToBorder => vk::SamplerAddressMode::CLAMP_TO_BORDER,
    }
}

pub(crate) fn vk_compare_op(compare: CompareFunction) -> vk::CompareOp {
    match compare {
        CompareFunction::Never => vk::CompareOp::NEVER,
        CompareFunction::Less => vk::CompareOp::LESS,
        CompareFunction::Equal => vk::CompareOp::EQUAL,
        CompareFunction::LessEqual => vk::CompareOp::LESS_OR_EQUAL,
        CompareFunction::Greater => vk::CompareOp::GREATER,
        CompareFunction::NotEqual => vk::CompareOp::NOT_EQUAL,
        CompareFunction::GreaterEqual => vk::CompareOp::GREATER_OR_EQUAL,
        CompareFunction::Always => vk::CompareOp::ALWAYS,
    }
}

fn vk_border_color(color: BorderColor) -> vk::BorderColor {
    match color {
        BorderColor::TransparentBlack => vk::BorderColor::FLOAT_TRANSPARENT_BLACK,
        BorderColor::OpaqueBlack => vk::BorderColor::FLOAT_OPAQUE_BLACK,
        BorderColor::OpaqueWhite => vk::BorderColor::FLOAT_OPAQUE_WHITE,
    }
}

pub struct Sampler {
    device: Arc<DeviceShared>,
    label: String,
    handle: vk::Sampler,
}

impl Sampler {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        desc: &SamplerDesc,
    ) -> Result<Arc<Sampler>, Error> {
        device.check_not_lost()?;

        let anisotropy_enable = desc.max_anisotropy > 1.0;
        let create_info = vk::SamplerCreateInfo {
            mag_filter: vk_filter(desc.mag_filter),
            min_filter: vk_filter(desc.min_filter),
            mipmap_mode: vk_mipmap_mode(desc.mipmap_filter),
            address_mode_u: vk_address_mode(desc.address_mode_u),
            address_mode_v: vk_address_mode(desc.address_mode_v),
            address_mode_w: vk_address_mode(desc.address_mode_w),
            mip_lod_bias: 0.0,
            anisotropy_enable: anisotropy_enable as u32,
            max_anisotropy: desc.max_anisotropy,
            compare_enable: desc.compare.is_some() as u32,
            compare_op: desc
                .compare
                .map(vk_compare_op)
                .unwrap_or(vk::CompareOp::NEVER),
            min_lod: desc.lod_min_clamp,
            max_lod: desc.lod_max_clamp,
            border_color: vk_border_color(desc.border_color),
            unnormalized_coordinates: vk::FALSE,
            ..Default::default()
        };
        let handle = unsafe { device.raw.create_sampler(&create_info, None)? };
        device.set_debug_name(
            vk::ObjectType::SAMPLER,
            vk::Handle::as_raw(handle),
            desc.label,
        );

        Ok(Arc::new(Sampler {
            device: device.clone(),
            label: desc.label.to_string(),
            handle,
        }))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn handle(&self) -> vk::Sampler {
        self.handle
    }
}

impl Drop for Sampler {
    fn drop(&mut self) {
        if let Some(queue) = self.device.queue_shared(QueueType::Graphics) {
            queue
                .deleter
                .lock()
                .unwrap()
                .delete_sampler_when_unused(queue.pending_submit_serial(), self.handle);
        }
    }
}

impl std::fmt::Debug for Sampler {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Sampler").field("label", &self.label).finish()
    }
}
