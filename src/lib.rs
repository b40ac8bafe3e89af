//! OpenCL compute backend for convolutional network evaluation
//!
//! This library owns the device side of network inference: it enumerates
//! compute devices, keeps one context and one command queue per selected
//! device, allocates float buffers, compiles kernel programs with tuned
//! constants and dispatches batched GEMM and Winograd 3x3 convolution
//! kernels.
//!
//! Device access goes through the [`device::Driver`] trait. The
//! [`device::host::HostDriver`] reference device is always available; real
//! OpenCL devices are supported with the `opencl` feature.

pub mod buffers;
pub mod config;
pub mod device;
pub mod error;
pub mod ops;
pub mod program;
pub mod size;
pub mod tune;

// Re-export commonly used types for convenience
pub use buffers::{
    blocking_read_buffer, create_read_only_buffer, create_read_write_buffer,
    create_read_write_buffer_sized, DeviceBuffer,
};
pub use config::DeviceConfig;
pub use device::{CommandQueue, DeviceContext, DeviceInfo, Driver, Event};
pub use error::{check_errors, get_error_message, NnClError, Result};
pub use ops::{
    do_batched_xgemm_km_kn_mn, do_batched_xgemm_mk_nk_mn, do_strided_batched_xgemm_km_kn_mn,
    do_winograd_transform, do_winograd_untransform, transform_filter_3x3, Launch,
    WinogradGeometry,
};
pub use program::{compile_program, Kernel, Program};
pub use size::{power_of_2ify, round_up_to_multiple};
pub use tune::{Conv3x3Params, TuneParams, XGemmDirectParams, XGemmParams};
