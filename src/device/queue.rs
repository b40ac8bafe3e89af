//! Borrowed queue handles and completion events

use std::fmt;

use tracing::instrument;

use super::context::{DeviceContext, DeviceInfo};
use super::{Driver, KernelArg, NdRange};
use crate::check_err;
use crate::error::Result;

/// The command queue of one selected device
///
/// Work enqueued on the same queue runs in enqueue order. Ordering against
/// other queues must be established with [`Event`]s.
pub struct CommandQueue<'ctx, D: Driver> {
    ctx: &'ctx DeviceContext<D>,
    which: usize,
}

impl<D: Driver> Clone for CommandQueue<'_, D> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<D: Driver> Copy for CommandQueue<'_, D> {}

impl<D: Driver> fmt::Debug for CommandQueue<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandQueue")
            .field("which", &self.which)
            .field("gpu_idx", &self.gpu_idx())
            .finish()
    }
}

impl<'ctx, D: Driver> CommandQueue<'ctx, D> {
    pub(crate) fn new(ctx: &'ctx DeviceContext<D>, which: usize) -> Self {
        Self { ctx, which }
    }

    pub fn context(&self) -> &'ctx DeviceContext<D> {
        self.ctx
    }

    /// Position of this queue's device within the selected devices
    pub fn which(&self) -> usize {
        self.which
    }

    /// System-wide index of this queue's device
    pub fn gpu_idx(&self) -> usize {
        self.ctx.gpu_idxs_to_use()[self.which]
    }

    pub fn device_info(&self) -> &'ctx DeviceInfo<D::Device> {
        &self.ctx.devices()[self.gpu_idx()]
    }

    pub fn raw(&self) -> Result<&'ctx D::Queue> {
        self.ctx.raw_queue(self.which)
    }

    /// Block until all work enqueued so far has completed
    #[instrument(skip(self), fields(gpu_idx = self.gpu_idx()))]
    pub fn finish(&self) -> Result<()> {
        let queue = self.raw()?;
        check_err!(self.ctx.driver().finish(queue));
        Ok(())
    }

    /// Enqueue one kernel launch after the events in `wait_for`
    pub(crate) fn enqueue(
        &self,
        kernel: &D::Kernel,
        args: &[KernelArg<'_, D::Buffer>],
        range: &NdRange,
        wait_for: &[&Event<'ctx, D>],
    ) -> Result<Event<'ctx, D>> {
        let queue = self.raw()?;
        let raw_waits: Vec<&D::Event> = wait_for.iter().map(|e| &e.raw).collect();
        let raw = check_err!(self
            .ctx
            .driver()
            .enqueue_kernel(queue, kernel, args, range, &raw_waits));
        Ok(Event { ctx: self.ctx, raw })
    }
}

/// Completion token of an enqueued operation
pub struct Event<'ctx, D: Driver> {
    ctx: &'ctx DeviceContext<D>,
    raw: D::Event,
}

impl<D: Driver> fmt::Debug for Event<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event").finish_non_exhaustive()
    }
}

impl<'ctx, D: Driver> Event<'ctx, D> {
    /// Block until the operation has completed
    pub fn wait(&self) -> Result<()> {
        check_err!(self.ctx.driver().wait_for_event(&self.raw));
        Ok(())
    }

    /// Device execution time in nanoseconds (profiling queues only)
    pub fn profile_nanos(&self) -> Result<u64> {
        let (start, end) = check_err!(self.ctx.driver().event_profile(&self.raw));
        Ok(end.saturating_sub(start))
    }

    pub fn raw(&self) -> &D::Event {
        &self.raw
    }
}
