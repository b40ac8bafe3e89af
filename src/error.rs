//! Error reporting for device API calls
//!
//! Every driver call returns an OpenCL status code. Those codes are funneled
//! through [`check_errors`] (usually via the [`check_err!`] macro), which turns
//! a failing status into a [`NnClError::DeviceOperation`] carrying the source
//! location and the literal failing expression.

/// Raw status code returned by the device API
pub type Status = i32;

/// OpenCL status codes used by the drivers in this crate
pub mod status {
    use super::Status;

    pub const CL_SUCCESS: Status = 0;
    pub const CL_DEVICE_NOT_FOUND: Status = -1;
    pub const CL_MEM_OBJECT_ALLOCATION_FAILURE: Status = -4;
    pub const CL_PROFILING_INFO_NOT_AVAILABLE: Status = -7;
    pub const CL_BUILD_PROGRAM_FAILURE: Status = -11;
    pub const CL_INVALID_VALUE: Status = -30;
    pub const CL_INVALID_PLATFORM: Status = -32;
    pub const CL_INVALID_DEVICE: Status = -33;
    pub const CL_INVALID_CONTEXT: Status = -34;
    pub const CL_INVALID_COMMAND_QUEUE: Status = -36;
    pub const CL_INVALID_MEM_OBJECT: Status = -38;
    pub const CL_INVALID_BUILD_OPTIONS: Status = -43;
    pub const CL_INVALID_PROGRAM_EXECUTABLE: Status = -45;
    pub const CL_INVALID_KERNEL_NAME: Status = -46;
    pub const CL_INVALID_ARG_VALUE: Status = -50;
    pub const CL_INVALID_KERNEL_ARGS: Status = -52;
    pub const CL_INVALID_WORK_GROUP_SIZE: Status = -54;
    pub const CL_INVALID_EVENT: Status = -58;
    pub const CL_INVALID_BUFFER_SIZE: Status = -61;
    pub const CL_INVALID_GLOBAL_WORK_SIZE: Status = -63;
}

/// Errors surfaced by the compute backend
#[derive(Debug, thiserror::Error)]
pub enum NnClError {
    /// Invalid device selection or dimensions that do not match the tuning
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Kernel source failed to build; `log` holds the device build log
    #[error("failed to compile program '{name}':\n{log}")]
    Compile { name: String, log: String },

    /// A device API call returned a non-success status
    #[error("{file}:{line}: `{expr}` failed with {message} ({code})")]
    DeviceOperation {
        code: Status,
        message: &'static str,
        file: &'static str,
        expr: &'static str,
        line: u32,
    },

    /// `find_which_gpu` was asked for a device that is not in use
    #[error("device {gpu_idx} is not among the selected devices {selected:?}")]
    NotFound { gpu_idx: usize, selected: Vec<usize> },
}

impl NnClError {
    /// Status code of a failed device call, if this is one
    pub fn status(&self) -> Option<Status> {
        match self {
            NnClError::DeviceOperation { code, .. } => Some(*code),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, NnClError>;

/// Map a status code to the name of the OpenCL constant it represents
pub fn get_error_message(code: Status) -> &'static str {
    match code {
        0 => "CL_SUCCESS",
        -1 => "CL_DEVICE_NOT_FOUND",
        -2 => "CL_DEVICE_NOT_AVAILABLE",
        -3 => "CL_COMPILER_NOT_AVAILABLE",
        -4 => "CL_MEM_OBJECT_ALLOCATION_FAILURE",
        -5 => "CL_OUT_OF_RESOURCES",
        -6 => "CL_OUT_OF_HOST_MEMORY",
        -7 => "CL_PROFILING_INFO_NOT_AVAILABLE",
        -8 => "CL_MEM_COPY_OVERLAP",
        -9 => "CL_IMAGE_FORMAT_MISMATCH",
        -10 => "CL_IMAGE_FORMAT_NOT_SUPPORTED",
        -11 => "CL_BUILD_PROGRAM_FAILURE",
        -12 => "CL_MAP_FAILURE",
        -13 => "CL_MISALIGNED_SUB_BUFFER_OFFSET",
        -14 => "CL_EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST",
        -15 => "CL_COMPILE_PROGRAM_FAILURE",
        -16 => "CL_LINKER_NOT_AVAILABLE",
        -17 => "CL_LINK_PROGRAM_FAILURE",
        -18 => "CL_DEVICE_PARTITION_FAILED",
        -19 => "CL_KERNEL_ARG_INFO_NOT_AVAILABLE",
        -30 => "CL_INVALID_VALUE",
        -31 => "CL_INVALID_DEVICE_TYPE",
        -32 => "CL_INVALID_PLATFORM",
        -33 => "CL_INVALID_DEVICE",
        -34 => "CL_INVALID_CONTEXT",
        -35 => "CL_INVALID_QUEUE_PROPERTIES",
        -36 => "CL_INVALID_COMMAND_QUEUE",
        -37 => "CL_INVALID_HOST_PTR",
        -38 => "CL_INVALID_MEM_OBJECT",
        -39 => "CL_INVALID_IMAGE_FORMAT_DESCRIPTOR",
        -40 => "CL_INVALID_IMAGE_SIZE",
        -41 => "CL_INVALID_SAMPLER",
        -42 => "CL_INVALID_BINARY",
        -43 => "CL_INVALID_BUILD_OPTIONS",
        -44 => "CL_INVALID_PROGRAM",
        -45 => "CL_INVALID_PROGRAM_EXECUTABLE",
        -46 => "CL_INVALID_KERNEL_NAME",
        -47 => "CL_INVALID_KERNEL_DEFINITION",
        -48 => "CL_INVALID_KERNEL",
        -49 => "CL_INVALID_ARG_INDEX",
        -50 => "CL_INVALID_ARG_VALUE",
        -51 => "CL_INVALID_ARG_SIZE",
        -52 => "CL_INVALID_KERNEL_ARGS",
        -53 => "CL_INVALID_WORK_DIMENSION",
        -54 => "CL_INVALID_WORK_GROUP_SIZE",
        -55 => "CL_INVALID_WORK_ITEM_SIZE",
        -56 => "CL_INVALID_GLOBAL_OFFSET",
        -57 => "CL_INVALID_EVENT_WAIT_LIST",
        -58 => "CL_INVALID_EVENT",
        -59 => "CL_INVALID_OPERATION",
        -60 => "CL_INVALID_GL_OBJECT",
        -61 => "CL_INVALID_BUFFER_SIZE",
        -62 => "CL_INVALID_MIP_LEVEL",
        -63 => "CL_INVALID_GLOBAL_WORK_SIZE",
        -64 => "CL_INVALID_PROPERTY",
        -65 => "CL_INVALID_IMAGE_DESCRIPTOR",
        -66 => "CL_INVALID_COMPILER_OPTIONS",
        -67 => "CL_INVALID_LINKER_OPTIONS",
        -68 => "CL_INVALID_DEVICE_PARTITION_COUNT",
        -69 => "CL_INVALID_PIPE_SIZE",
        -70 => "CL_INVALID_DEVICE_QUEUE",
        -71 => "CL_INVALID_SPEC_ID",
        -72 => "CL_MAX_SIZE_RESTRICTION_EXCEEDED",
        -1000 => "CL_INVALID_GL_SHAREGROUP_REFERENCE_KHR",
        -1001 => "CL_PLATFORM_NOT_FOUND_KHR",
        -1002 => "CL_INVALID_D3D10_DEVICE_KHR",
        -1003 => "CL_INVALID_D3D10_RESOURCE_KHR",
        -1004 => "CL_D3D10_RESOURCE_ALREADY_ACQUIRED_KHR",
        -1005 => "CL_D3D10_RESOURCE_NOT_ACQUIRED_KHR",
        _ => "UNKNOWN_ERROR",
    }
}

/// Turn a status code into a `Result`, recording where the call was made
pub fn check_errors(code: Status, file: &'static str, expr: &'static str, line: u32) -> Result<()> {
    if code == status::CL_SUCCESS {
        return Ok(());
    }
    Err(device_error(code, file, expr, line))
}

/// Build the error for a failed device call
pub fn device_error(code: Status, file: &'static str, expr: &'static str, line: u32) -> NnClError {
    let message = get_error_message(code);
    tracing::error!(code, message, file, expr, line, "device call failed");
    NnClError::DeviceOperation {
        code,
        message,
        file,
        expr,
        line,
    }
}

/// Unwrap a driver call, converting a failed status into `NnClError`.
///
/// Accepts either a bare [`Status`] or a `Result<T, Status>` and evaluates to
/// `()` or `T` respectively, returning early from the enclosing function on
/// failure.
#[macro_export]
macro_rules! check_err {
    ($call:expr) => {
        match $crate::error::IntoStatusResult::into_status_result($call) {
            Ok(value) => value,
            Err(code) => {
                return Err($crate::error::device_error(
                    code,
                    file!(),
                    stringify!($call),
                    line!(),
                ))
            }
        }
    };
}

/// Conversion used by [`check_err!`] so it accepts raw statuses and results alike
pub trait IntoStatusResult {
    type Value;
    fn into_status_result(self) -> std::result::Result<Self::Value, Status>;
}

impl IntoStatusResult for Status {
    type Value = ();

    fn into_status_result(self) -> std::result::Result<(), Status> {
        if self == status::CL_SUCCESS {
            Ok(())
        } else {
            Err(self)
        }
    }
}

impl<T> IntoStatusResult for std::result::Result<T, Status> {
    type Value = T;

    fn into_status_result(self) -> std::result::Result<T, Status> {
        // A driver reporting Err(CL_SUCCESS) is still a failure to produce a value
        self.map_err(|code| {
            if code == status::CL_SUCCESS {
                status::CL_INVALID_VALUE
            } else {
                code
            }
        })
    }
}
