use ash::vk;

/// Errors surfaced by fallible operations.
///
/// Creation functions return `Err` instead of a handle; the object is never
/// left in a half-initialized state. Device loss is latched: once observed,
/// every subsequent fallible operation reports [`Error::DeviceLost`].
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The caller passed invalid arguments.
    #[error("validation error: {0}")]
    Validation(String),
    /// The device or host allocator is out of memory.
    #[error("out of memory")]
    OutOfMemory,
    /// The underlying device is gone; all future operations fail.
    #[error("device lost")]
    DeviceLost,
    /// Any other error reported by the driver.
    #[error("vulkan error: {0}")]
    Vulkan(vk::Result),
}

impl From<vk::Result> for Error {
    fn from(result: vk::Result) -> Error {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                Error::OutOfMemory
            }
            vk::Result::ERROR_DEVICE_LOST => Error::DeviceLost,
            other => Error::Vulkan(other),
        }
    }
}

impl From<gpu_allocator::AllocationError> for Error {
    fn from(err: gpu_allocator::AllocationError) -> Error {
        match err {
            gpu_allocator::AllocationError::OutOfMemory => Error::OutOfMemory,
            other => {
                tracing::error!("allocation failed: {}", other);
                Error::OutOfMemory
            }
        }
    }
}

/// Logs a validation failure and builds the corresponding error value.
macro_rules! validation_error {
    ($($arg:tt)*) => {{
        let message = format!($($arg)*);
        tracing::error!("{}", message);
        $crate::error::Error::Validation(message)
    }};
}

pub(crate) use validation_error;
