//! Device API abstraction
//!
//! This module defines the [`Driver`] seam between the backend and a concrete
//! compute API. Two drivers are provided:
//!
//! 1. [`host::HostDriver`] - an in-process reference device that executes the
//!    kernel contracts on the CPU (always available)
//! 2. `opencl::OpenClDriver` - real OpenCL devices through `opencl3`
//!    (requires the `opencl` feature)
//!
//! Driver methods mirror the raw device API: they return a [`Status`] (or a
//! `Result<T, Status>`) and leave diagnosis to [`crate::error::check_errors`].

use std::fmt;

use crate::error::Status;

pub mod context;
pub mod host;
#[cfg(feature = "opencl")]
pub mod opencl;
pub mod queue;

pub use context::{DeviceContext, DeviceInfo};
pub use queue::{CommandQueue, Event};

/// Access mode of a device buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferAccess {
    ReadOnly,
    ReadWrite,
}

/// How a new buffer is populated
#[derive(Debug, Clone, Copy)]
pub enum BufferInit<'a> {
    /// Copy these floats into the buffer at creation
    CopyFrom(&'a [f32]),
    /// Allocate this many floats, contents unspecified
    Uninit(usize),
}

impl BufferInit<'_> {
    /// Number of floats the buffer will hold
    pub fn len(&self) -> usize {
        match self {
            BufferInit::CopyFrom(data) => data.len(),
            BufferInit::Uninit(n) => *n,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One kernel argument, in kernel parameter order
#[derive(Debug)]
pub enum KernelArg<'a, B> {
    Int(i32),
    Buffer(&'a B),
}

// Manual impls so `B` itself need not be Clone/Copy
impl<B> Clone for KernelArg<'_, B> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<B> Copy for KernelArg<'_, B> {}

/// Three-dimensional launch geometry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NdRange {
    pub global: [usize; 3],
    pub local: [usize; 3],
}

impl fmt::Display for NdRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "global={}x{}x{} local={}x{}x{}",
            self.global[0],
            self.global[1],
            self.global[2],
            self.local[0],
            self.local[1],
            self.local[2]
        )
    }
}

/// Result of a failed program build
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildFailure {
    pub status: Status,
    /// Device build log (compiler diagnostics)
    pub log: String,
}

/// A compute API able to enumerate devices, allocate memory and launch kernels
///
/// Handles are owned values; dropping or releasing them frees the underlying
/// device object. Queue and context release go through explicit methods so
/// [`DeviceContext`] can enforce teardown order.
pub trait Driver {
    type Platform: Copy + fmt::Debug;
    type Device: Copy + PartialEq + fmt::Debug;
    type Context;
    type Queue;
    type Buffer;
    type Program;
    type Kernel;
    type Event;

    /// Human-readable driver name for logging
    fn name(&self) -> &'static str;

    fn platforms(&self) -> Result<Vec<Self::Platform>, Status>;
    fn devices(&self, platform: Self::Platform) -> Result<Vec<Self::Device>, Status>;
    fn device_name(&self, device: Self::Device) -> Result<String, Status>;
    fn device_vendor(&self, device: Self::Device) -> Result<String, Status>;

    fn create_context(&self, devices: &[Self::Device]) -> Result<Self::Context, Status>;
    fn create_queue(
        &self,
        context: &Self::Context,
        device: Self::Device,
        enable_profiling: bool,
    ) -> Result<Self::Queue, Status>;
    fn release_queue(&self, queue: Self::Queue) -> Status;
    fn release_context(&self, context: Self::Context) -> Status;

    fn create_buffer(
        &self,
        context: &Self::Context,
        access: BufferAccess,
        init: BufferInit<'_>,
    ) -> Result<Self::Buffer, Status>;
    /// Copy `out.len()` floats from the start of `buffer`, blocking until done
    fn read_buffer_blocking(
        &self,
        queue: &Self::Queue,
        buffer: &Self::Buffer,
        out: &mut [f32],
    ) -> Status;

    fn build_program(
        &self,
        context: &Self::Context,
        devices: &[Self::Device],
        source: &str,
        options: &str,
    ) -> Result<Self::Program, BuildFailure>;
    fn create_kernel(&self, program: &Self::Program, name: &str) -> Result<Self::Kernel, Status>;

    /// Set `args` on `kernel` and enqueue it over `range` after `wait_for`
    fn enqueue_kernel(
        &self,
        queue: &Self::Queue,
        kernel: &Self::Kernel,
        args: &[KernelArg<'_, Self::Buffer>],
        range: &NdRange,
        wait_for: &[&Self::Event],
    ) -> Result<Self::Event, Status>;

    fn wait_for_event(&self, event: &Self::Event) -> Status;
    /// Start and end timestamps in nanoseconds; needs a profiling queue
    fn event_profile(&self, event: &Self::Event) -> Result<(u64, u64), Status>;
    fn finish(&self, queue: &Self::Queue) -> Status;
}
