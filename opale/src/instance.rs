//! Vulkan entry points, instance creation and the debug messenger.

use std::ffi::CStr;
use std::os::raw::{c_char, c_void};
use std::sync::Arc;

use ash::vk;
use raw_window_handle::{RawDisplayHandle, RawWindowHandle};

use crate::error::Error;

/// List of validation layers to enable.
const VALIDATION_LAYERS: [*const c_char; 1] =
    [b"VK_LAYER_KHRONOS_validation\0".as_ptr() as *const c_char];

/// Options for [`Instance::new`].
#[derive(Clone, Debug)]
pub struct InstanceDesc {
    /// Enables `VK_LAYER_KHRONOS_validation` when the layer is present.
    pub enable_validation: bool,
}

impl Default for InstanceDesc {
    fn default() -> Self {
        InstanceDesc {
            enable_validation: cfg!(debug_assertions),
        }
    }
}

/// Owns the Vulkan entry points, the instance, and the debug messenger that
/// forwards driver and validation messages into `tracing`.
pub struct Instance {
    pub(crate) entry: ash::Entry,
    pub(crate) raw: ash::Instance,
    pub(crate) vk_khr_surface: ash::extensions::khr::Surface,
    vk_ext_debug_utils: ash::extensions::ext::DebugUtils,
    debug_messenger: vk::DebugUtilsMessengerEXT,
}

impl Instance {
    /// Loads the Vulkan library and creates an instance.
    pub fn new(desc: &InstanceDesc) -> Result<Arc<Instance>, Error> {
        unsafe {
            let entry = ash::Entry::load().map_err(|e| {
                tracing::error!("failed to load the vulkan library: {}", e);
                Error::Validation("vulkan library not available".to_string())
            })?;

            let validation_available =
                desc.enable_validation && check_validation_layer_support(&entry);
            if desc.enable_validation && !validation_available {
                tracing::warn!("validation layer requested but not available");
            }

            let mut instance_extensions: Vec<*const c_char> = vec![
                b"VK_KHR_surface\0".as_ptr() as *const c_char,
                b"VK_EXT_debug_utils\0".as_ptr() as *const c_char,
            ];
            // Window-system extensions vary per platform and loader; request
            // only the ones actually present.
            let available = entry
                .enumerate_instance_extension_properties(None)
                .unwrap_or_default();
            let supports = |name: &[u8]| {
                available.iter().any(|ext| {
                    CStr::from_ptr(ext.extension_name.as_ptr())
                        == CStr::from_bytes_with_nul(name).unwrap()
                })
            };
            for name in [
                &b"VK_KHR_win32_surface\0"[..],
                b"VK_KHR_xlib_surface\0",
                b"VK_KHR_xcb_surface\0",
                b"VK_KHR_wayland_surface\0",
            ] {
                if supports(name) {
                    instance_extensions.push(name.as_ptr() as *const c_char);
                }
            }

            let application_info = vk::ApplicationInfo {
                p_application_name: b"OPALE\0".as_ptr() as *const c_char,
                application_version: 0,
                p_engine_name: b"OPALE\0".as_ptr() as *const c_char,
                engine_version: 0,
                api_version: vk::API_VERSION_1_3,
                ..Default::default()
            };

            let mut create_info = vk::InstanceCreateInfo {
                p_application_info: &application_info,
                enabled_extension_count: instance_extensions.len() as u32,
                pp_enabled_extension_names: instance_extensions.as_ptr(),
                ..Default::default()
            };
            if validation_available {
                create_info.enabled_layer_count = VALIDATION_LAYERS.len() as u32;
                create_info.pp_enabled_layer_names = VALIDATION_LAYERS.as_ptr();
            }

            let raw = entry
                .create_instance(&create_info, None)
                .map_err(Error::from)?;

            let vk_khr_surface = ash::extensions::khr::Surface::new(&entry, &raw);
            let vk_ext_debug_utils = ash::extensions::ext::DebugUtils::new(&entry, &raw);

            let messenger_create_info = vk::DebugUtilsMessengerCreateInfoEXT {
                message_severity: vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE
                    | vk::DebugUtilsMessageSeverityFlagsEXT::INFO
                    | vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
                message_type: vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
                pfn_user_callback: Some(debug_utils_message_callback),
                ..Default::default()
            };
            let debug_messenger = vk_ext_debug_utils
                .create_debug_utils_messenger(&messenger_create_info, None)
                .map_err(Error::from)?;

            Ok(Arc::new(Instance {
                entry,
                raw,
                vk_khr_surface,
                vk_ext_debug_utils,
                debug_messenger,
            }))
        }
    }

    /// Creates a presentation surface for the given window.
    ///
    /// # Safety
    ///
    /// The window and display handles must outlive the returned surface.
    pub unsafe fn create_surface(
        &self,
        display_handle: RawDisplayHandle,
        window_handle: RawWindowHandle,
    ) -> Result<vk::SurfaceKHR, Error> {
        ash_window::create_surface(&self.entry, &self.raw, display_handle, window_handle, None)
            .map_err(Error::from)
    }

    pub(crate) fn debug_utils(&self) -> &ash::extensions::ext::DebugUtils {
        &self.vk_ext_debug_utils
    }
}

impl Drop for Instance {
    fn drop(&mut self) {
        unsafe {
            if self.debug_messenger != vk::DebugUtilsMessengerEXT::null() {
                self.vk_ext_debug_utils
                    .destroy_debug_utils_messenger(self.debug_messenger, None);
            }
            self.raw.destroy_instance(None);
        }
    }
}

impl std::fmt::Debug for Instance {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Instance").finish()
    }
}

/// Checks if all validation layers are supported.
unsafe fn check_validation_layer_support(entry: &ash::Entry) -> bool {
    let available_layers = match entry.enumerate_instance_layer_properties() {
        Ok(layers) => layers,
        Err(_) => return false,
    };
    VALIDATION_LAYERS.iter().all(|&required_layer| {
        available_layers.iter().any(|layer| {
            CStr::from_ptr(layer.layer_name.as_ptr()) == CStr::from_ptr(required_layer)
        })
    })
}

// Vulkan message callback: translate message severity into tracing's levels.
unsafe extern "system" fn debug_utils_message_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_types: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message)
        .to_str()
        .unwrap_or("<invalid utf-8 in message>");

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::VERBOSE => {
            tracing::event!(tracing::Level::TRACE, "{}", message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::INFO => {
            tracing::event!(tracing::Level::INFO, "{}", message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            tracing::event!(tracing::Level::WARN, "{}", message);
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            tracing::event!(tracing::Level::ERROR, "{}", message);
        }
        _ => {}
    }

    vk::FALSE
}
