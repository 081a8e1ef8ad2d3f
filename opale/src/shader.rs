//! Shader modules.

use std::ffi::CString;
use std::sync::Arc;

use ash::vk;

use crate::device::DeviceShared;
use crate::error::{validation_error, Error};
use crate::types::{QueueType, ShaderModuleDesc};

/// A compiled SPIR-V module together with its entry point name.
pub struct ShaderModule {
    device: Arc<DeviceShared>,
    label: String,
    handle: vk::ShaderModule,
    entry_point: CString,
}

impl ShaderModule {
    pub(crate) fn create(
        device: &Arc<DeviceShared>,
        desc: &ShaderModuleDesc,
    ) -> Result<Arc<ShaderModule>, Error> {
        device.check_not_lost()?;
        if desc.spirv.is_empty() {
            return Err(validation_error!(
                "shader module `{}`: SPIR-V source is empty",
                desc.label
            ));
        }

        let create_info = vk::ShaderModuleCreateInfo {
            code_size: desc.spirv.len() * 4,
            p_code: desc.spirv.as_ptr(),
            ..Default::default()
        };
        let handle = unsafe { device.raw.create_shader_module(&create_info, None)? };
        device.set_debug_name(
            vk::ObjectType::SHADER_MODULE,
            vk::Handle::as_raw(handle),
            desc.label,
        );

        let entry_point = CString::new(desc.entry_point).map_err(|_| {
            validation_error!("shader module `{}`: invalid entry point name", desc.label)
        })?;

        Ok(Arc::new(ShaderModule {
            device: device.clone(),
            label: desc.label.to_string(),
            handle,
            entry_point,
        }))
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub(crate) fn handle(&self) -> vk::ShaderModule {
        self.handle
    }

    pub(crate) fn entry_point(&self) -> &CString {
        &self.entry_point
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        if let Some(queue) = self.device.queue_shared(QueueType::Graphics) {
            queue
                .deleter
                .lock()
                .unwrap()
                .delete_shader_module_when_unused(queue.pending_submit_serial(), self.handle);
        }
    }
}

impl std::fmt::Debug for ShaderModule {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("ShaderModule")
            .field("label", &self.label)
            .finish()
    }
}
