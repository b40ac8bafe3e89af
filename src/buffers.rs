//! Device buffer creation and blocking readback

use std::fmt;

use tracing::instrument;

use crate::check_err;
use crate::device::{BufferAccess, BufferInit, CommandQueue, DeviceContext, Driver};
use crate::error::{NnClError, Result};

/// A float buffer allocated in a [`DeviceContext`]
///
/// The buffer is freed when dropped and cannot outlive its context.
pub struct DeviceBuffer<'ctx, D: Driver> {
    ctx: &'ctx DeviceContext<D>,
    raw: D::Buffer,
    len: usize,
    access: BufferAccess,
}

impl<D: Driver> fmt::Debug for DeviceBuffer<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("len", &self.len)
            .field("access", &self.access)
            .finish()
    }
}

impl<'ctx, D: Driver> DeviceBuffer<'ctx, D> {
    /// Capacity in floats
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn access(&self) -> BufferAccess {
        self.access
    }

    pub fn context(&self) -> &'ctx DeviceContext<D> {
        self.ctx
    }

    pub fn raw(&self) -> &D::Buffer {
        &self.raw
    }
}

fn create_buffer<'ctx, D: Driver>(
    ctx: &'ctx DeviceContext<D>,
    access: BufferAccess,
    init: BufferInit<'_>,
) -> Result<DeviceBuffer<'ctx, D>> {
    let context = ctx.raw_context()?;
    let len = init.len();
    let raw = check_err!(ctx.driver().create_buffer(context, access, init));
    Ok(DeviceBuffer {
        ctx,
        raw,
        len,
        access,
    })
}

/// Read-only buffer initialized with a copy of `host`
#[instrument(skip_all, fields(floats = host.len()))]
pub fn create_read_only_buffer<'ctx, D: Driver>(
    ctx: &'ctx DeviceContext<D>,
    host: &[f32],
) -> Result<DeviceBuffer<'ctx, D>> {
    create_buffer(ctx, BufferAccess::ReadOnly, BufferInit::CopyFrom(host))
}

/// Read-write buffer initialized with a copy of `host`
#[instrument(skip_all, fields(floats = host.len()))]
pub fn create_read_write_buffer<'ctx, D: Driver>(
    ctx: &'ctx DeviceContext<D>,
    host: &[f32],
) -> Result<DeviceBuffer<'ctx, D>> {
    create_buffer(ctx, BufferAccess::ReadWrite, BufferInit::CopyFrom(host))
}

/// Read-write buffer of `num_floats` floats with unspecified contents
#[instrument(skip(ctx))]
pub fn create_read_write_buffer_sized<'ctx, D: Driver>(
    ctx: &'ctx DeviceContext<D>,
    num_floats: usize,
) -> Result<DeviceBuffer<'ctx, D>> {
    create_buffer(ctx, BufferAccess::ReadWrite, BufferInit::Uninit(num_floats))
}

/// Copy the first `num_floats` floats of `buffer` into `host_out`, blocking
/// until the copy completes. `host_out` is resized to `num_floats`.
#[instrument(skip(queue, buffer, host_out), fields(gpu_idx = queue.gpu_idx()))]
pub fn blocking_read_buffer<D: Driver>(
    queue: &CommandQueue<'_, D>,
    buffer: &DeviceBuffer<'_, D>,
    num_floats: usize,
    host_out: &mut Vec<f32>,
) -> Result<()> {
    if num_floats > buffer.len() {
        return Err(NnClError::Configuration(format!(
            "cannot read {} floats from a buffer of {}",
            num_floats,
            buffer.len()
        )));
    }
    host_out.resize(num_floats, 0.0);
    if num_floats == 0 {
        return Ok(());
    }
    let raw_queue = queue.raw()?;
    check_err!(queue
        .context()
        .driver()
        .read_buffer_blocking(raw_queue, &buffer.raw, host_out));
    Ok(())
}
