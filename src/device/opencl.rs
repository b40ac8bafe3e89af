//! Real OpenCL devices through `opencl3`
//!
//! Every `opencl3` error carries the raw status code, which is passed back
//! unchanged so [`crate::error::check_errors`] can decode it.

use std::ffi::c_void;
use std::ptr;

use opencl3::command_queue::{CommandQueue, CL_QUEUE_PROFILING_ENABLE};
use opencl3::context::Context;
use opencl3::device::{Device, CL_DEVICE_TYPE_ALL};
use opencl3::error_codes::ClError;
use opencl3::event::Event;
use opencl3::kernel::{ExecuteKernel, Kernel};
use opencl3::memory::{Buffer, CL_MEM_COPY_HOST_PTR, CL_MEM_READ_ONLY, CL_MEM_READ_WRITE};
use opencl3::platform::{get_platforms, Platform};
use opencl3::program::Program;
use opencl3::types::{cl_device_id, cl_float, cl_int, CL_BLOCKING};
use tracing::debug;

use super::{BufferAccess, BufferInit, BuildFailure, Driver, KernelArg, NdRange};
use crate::error::{status, Status};

/// Device id that can be shared between threads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClDevice(pub cl_device_id);

// Device ids are immutable runtime handles
unsafe impl Send for ClDevice {}
unsafe impl Sync for ClDevice {}

fn code(err: ClError) -> Status {
    err.0
}

/// Driver for the system OpenCL runtime
#[derive(Debug, Default)]
pub struct OpenClDriver;

impl OpenClDriver {
    pub fn new() -> Self {
        Self
    }
}

impl Driver for OpenClDriver {
    type Platform = Platform;
    type Device = ClDevice;
    type Context = Context;
    type Queue = CommandQueue;
    type Buffer = Buffer<cl_float>;
    type Program = Program;
    type Kernel = Kernel;
    type Event = Event;

    fn name(&self) -> &'static str {
        "opencl"
    }

    fn platforms(&self) -> Result<Vec<Platform>, Status> {
        get_platforms().map_err(code)
    }

    fn devices(&self, platform: Platform) -> Result<Vec<ClDevice>, Status> {
        let ids = platform.get_devices(CL_DEVICE_TYPE_ALL).map_err(code)?;
        Ok(ids.into_iter().map(ClDevice).collect())
    }

    fn device_name(&self, device: ClDevice) -> Result<String, Status> {
        Device::new(device.0).name().map_err(code)
    }

    fn device_vendor(&self, device: ClDevice) -> Result<String, Status> {
        Device::new(device.0).vendor().map_err(code)
    }

    fn create_context(&self, devices: &[ClDevice]) -> Result<Context, Status> {
        let ids: Vec<cl_device_id> = devices.iter().map(|d| d.0).collect();
        Context::from_devices(&ids, &[], None, ptr::null_mut()).map_err(code)
    }

    #[allow(unused_unsafe)]
    fn create_queue(
        &self,
        context: &Context,
        device: ClDevice,
        enable_profiling: bool,
    ) -> Result<CommandQueue, Status> {
        let properties = if enable_profiling {
            CL_QUEUE_PROFILING_ENABLE
        } else {
            0
        };
        unsafe { CommandQueue::create_with_properties(context, device.0, properties, 0) }
            .map_err(code)
    }

    fn release_queue(&self, queue: CommandQueue) -> Status {
        drop(queue);
        status::CL_SUCCESS
    }

    fn release_context(&self, context: Context) -> Status {
        drop(context);
        status::CL_SUCCESS
    }

    #[allow(unused_unsafe)]
    fn create_buffer(
        &self,
        context: &Context,
        access: BufferAccess,
        init: BufferInit<'_>,
    ) -> Result<Buffer<cl_float>, Status> {
        let access_flags = match access {
            BufferAccess::ReadOnly => CL_MEM_READ_ONLY,
            BufferAccess::ReadWrite => CL_MEM_READ_WRITE,
        };
        match init {
            BufferInit::CopyFrom(data) => unsafe {
                // COPY_HOST_PTR only reads from the pointer
                Buffer::<cl_float>::create(
                    context,
                    access_flags | CL_MEM_COPY_HOST_PTR,
                    data.len(),
                    data.as_ptr() as *mut c_void,
                )
            },
            BufferInit::Uninit(n) => unsafe {
                Buffer::<cl_float>::create(context, access_flags, n, ptr::null_mut())
            },
        }
        .map_err(code)
    }

    #[allow(unused_unsafe)]
    fn read_buffer_blocking(
        &self,
        queue: &CommandQueue,
        buffer: &Buffer<cl_float>,
        out: &mut [f32],
    ) -> Status {
        match unsafe { queue.enqueue_read_buffer(buffer, CL_BLOCKING, 0, out, &[]) } {
            Ok(_) => status::CL_SUCCESS,
            Err(e) => code(e),
        }
    }

    fn build_program(
        &self,
        context: &Context,
        _devices: &[ClDevice],
        source: &str,
        options: &str,
    ) -> Result<Program, BuildFailure> {
        // The context holds exactly the selected devices
        Program::create_and_build_from_source(context, source, options).map_err(|log| {
            BuildFailure {
                status: status::CL_BUILD_PROGRAM_FAILURE,
                log,
            }
        })
    }

    fn create_kernel(&self, program: &Program, name: &str) -> Result<Kernel, Status> {
        Kernel::create(program, name).map_err(code)
    }

    #[allow(unused_unsafe)]
    fn enqueue_kernel(
        &self,
        queue: &CommandQueue,
        kernel: &Kernel,
        args: &[KernelArg<'_, Buffer<cl_float>>],
        range: &NdRange,
        wait_for: &[&Event],
    ) -> Result<Event, Status> {
        let mut exec = ExecuteKernel::new(kernel);
        for arg in args {
            match arg {
                KernelArg::Int(v) => unsafe {
                    exec.set_arg(&(*v as cl_int));
                },
                KernelArg::Buffer(b) => unsafe {
                    exec.set_arg(*b);
                },
            }
        }
        exec.set_global_work_sizes(&range.global)
            .set_local_work_sizes(&range.local);
        for event in wait_for {
            exec.set_wait_event(event);
        }
        debug!(kernel = ?kernel.function_name(), %range, "enqueue");
        unsafe { exec.enqueue_nd_range(queue) }.map_err(code)
    }

    fn wait_for_event(&self, event: &Event) -> Status {
        match event.wait() {
            Ok(()) => status::CL_SUCCESS,
            Err(e) => code(e),
        }
    }

    fn event_profile(&self, event: &Event) -> Result<(u64, u64), Status> {
        let start = event.profiling_command_start().map_err(code)?;
        let end = event.profiling_command_end().map_err(code)?;
        Ok((start, end))
    }

    fn finish(&self, queue: &CommandQueue) -> Status {
        match queue.finish() {
            Ok(()) => status::CL_SUCCESS,
            Err(e) => code(e),
        }
    }
}
