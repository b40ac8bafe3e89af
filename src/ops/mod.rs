//! Kernel dispatch: batched GEMM and the Winograd 3x3 convolution stages
//!
//! Every dispatch function validates its dimensions against the tuning
//! parameters, enqueues exactly one launch and returns its [`Event`].

pub mod cpu_ref;
pub mod gemm;
pub mod winograd;

pub use gemm::{
    do_batched_xgemm_km_kn_mn, do_batched_xgemm_mk_nk_mn, do_strided_batched_xgemm_km_kn_mn,
};
pub use winograd::{
    do_winograd_transform, do_winograd_untransform, transform_filter_3x3, WinogradGeometry,
};

use crate::buffers::DeviceBuffer;
use crate::device::{CommandQueue, Driver, Event, KernelArg};
use crate::error::{NnClError, Result};
use crate::program::Kernel;

/// Entry point names the dispatch functions expect in compiled programs
pub mod kernel_names {
    /// `[M, N, K, A, B, C]`, A is `[k][m]`, B is `[k][n]`
    pub const XGEMM_BATCHED: &str = "XgemmBatched";
    /// `[M, N, K, aStride, bStride, cStride, A, B, C]`
    pub const XGEMM_STRIDED_BATCHED: &str = "XgemmStridedBatched";
    /// `[M, N, K, A, B, C]`, A is `[m][k]`, B is `[n][k]`
    pub const XGEMM_DIRECT_BATCHED_NT: &str = "XgemmDirectBatchedNT";
    /// `[input, workspace, batch, nnX, nnY, ntX, ntY, C]`
    pub const WINOGRAD_TRANSFORM: &str = "transform";
    /// `[workspace, output, batch, nnX, nnY, ntX, ntY, C]`
    pub const WINOGRAD_UNTRANSFORM: &str = "untransform";
}

/// Where a dispatch is enqueued and which events it must wait for
///
/// A plain queue converts into a launch with no dependencies:
///
/// ```ignore
/// let ev = do_winograd_transform(&transform, &queue, ...)?;
/// let ev = do_batched_xgemm_km_kn_mn(&gemm, Launch::on(&other).after(&[&ev]), ...)?;
/// ```
pub struct Launch<'e, 'ctx: 'e, D: Driver> {
    queue: CommandQueue<'ctx, D>,
    wait_for: &'e [&'e Event<'ctx, D>],
}

impl<'e, 'ctx: 'e, D: Driver> Launch<'e, 'ctx, D> {
    pub fn on(queue: &CommandQueue<'ctx, D>) -> Self {
        Self {
            queue: *queue,
            wait_for: &[],
        }
    }

    /// Start only after every event in `events` has completed
    pub fn after(mut self, events: &'e [&'e Event<'ctx, D>]) -> Self {
        self.wait_for = events;
        self
    }

    pub fn queue(&self) -> &CommandQueue<'ctx, D> {
        &self.queue
    }
}

impl<'ctx, D: Driver> From<&CommandQueue<'ctx, D>> for Launch<'_, 'ctx, D> {
    fn from(queue: &CommandQueue<'ctx, D>) -> Self {
        Launch::on(queue)
    }
}

impl<'ctx, D: Driver> From<CommandQueue<'ctx, D>> for Launch<'_, 'ctx, D> {
    fn from(queue: CommandQueue<'ctx, D>) -> Self {
        Launch::on(&queue)
    }
}

/// Convert a dimension to the `int` kernel argument type
fn int_arg<'a, B>(what: &str, value: usize) -> Result<KernelArg<'a, B>> {
    i32::try_from(value)
        .map(KernelArg::Int)
        .map_err(|_| {
            NnClError::Configuration(format!(
                "{} = {} does not fit in a kernel int",
                what, value
            ))
        })
}

fn require_capacity<D: Driver>(
    what: &str,
    buffer: &DeviceBuffer<'_, D>,
    floats: usize,
) -> Result<()> {
    if buffer.len() < floats {
        return Err(NnClError::Configuration(format!(
            "{} holds {} floats but {} are required",
            what,
            buffer.len(),
            floats
        )));
    }
    Ok(())
}

fn require_writable<D: Driver>(what: &str, buffer: &DeviceBuffer<'_, D>) -> Result<()> {
    match buffer.access() {
        crate::device::BufferAccess::ReadWrite => Ok(()),
        crate::device::BufferAccess::ReadOnly => Err(NnClError::Configuration(format!(
            "{} is written by the kernel but was created read-only",
            what
        ))),
    }
}

/// Kernel, buffers and queue must all come from the same context
fn require_same_context<D: Driver>(
    kernel: &Kernel<'_, D>,
    launch: &Launch<'_, '_, D>,
    buffers: &[(&str, &DeviceBuffer<'_, D>)],
) -> Result<()> {
    let ctx = launch.queue.context();
    if !std::ptr::eq(kernel.context(), ctx) {
        return Err(NnClError::Configuration(format!(
            "kernel '{}' was compiled in a different context than the queue",
            kernel.name()
        )));
    }
    for (what, buffer) in buffers {
        if !std::ptr::eq(buffer.context(), ctx) {
            return Err(NnClError::Configuration(format!(
                "{} was created in a different context than the queue",
                what
            )));
        }
    }
    Ok(())
}

fn require_positive(dims: &[(&str, usize)]) -> Result<()> {
    for (name, value) in dims {
        if *value == 0 {
            return Err(NnClError::Configuration(format!("{} must be positive", name)));
        }
    }
    Ok(())
}
