//! Device enumeration and the shared context/queue owner

use tracing::{debug, info, instrument, warn};

use super::queue::CommandQueue;
use super::Driver;
use crate::check_err;
use crate::config::DeviceConfig;
use crate::error::{check_errors, status, NnClError, Result};

/// A device discovered during enumeration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo<Dev> {
    /// Process-wide index, assigned in discovery order
    pub gpu_idx: usize,
    /// Index of the platform the device belongs to
    pub platform_idx: usize,
    pub device: Dev,
    pub name: String,
    pub vendor: String,
}

/// Owns the compute context and one command queue per selected device
///
/// Everything allocated from a context (buffers, programs, kernels, queue
/// handles, events) borrows it, so it cannot outlive the context. Teardown
/// releases the queues first, then the context.
pub struct DeviceContext<D: Driver> {
    driver: D,
    context: Option<D::Context>,
    platforms: Vec<D::Platform>,
    devices: Vec<DeviceInfo<D::Device>>,

    // Parallel vectors: entry i of each describes the same selected device
    gpu_idxs_to_use: Vec<usize>,
    device_ids_to_use: Vec<D::Device>,
    command_queues: Vec<D::Queue>,

    profiling_enabled: bool,
}

impl<D: Driver> DeviceContext<D> {
    /// Enumerate devices, select `gpu_idxs` (all when empty) and create the
    /// context and queues
    #[instrument(skip(driver), fields(driver = driver.name()))]
    pub fn new(driver: D, gpu_idxs: &[usize], enable_profiling: bool) -> Result<Self> {
        let (platforms, devices) = enumerate(&driver)?;
        let gpu_idxs_to_use = select_devices(&devices, gpu_idxs)?;
        let device_ids_to_use: Vec<D::Device> = gpu_idxs_to_use
            .iter()
            .map(|&idx| devices[idx].device)
            .collect();

        for &idx in &gpu_idxs_to_use {
            let info = &devices[idx];
            info!(
                gpu_idx = info.gpu_idx,
                name = %info.name,
                vendor = %info.vendor,
                "using device"
            );
        }

        let context = check_err!(driver.create_context(&device_ids_to_use));

        // Built before the queues so a failed queue still releases what exists
        let mut ctx = DeviceContext {
            driver,
            context: Some(context),
            platforms,
            devices,
            gpu_idxs_to_use,
            device_ids_to_use,
            command_queues: Vec::new(),
            profiling_enabled: enable_profiling,
        };

        for i in 0..ctx.device_ids_to_use.len() {
            let device = ctx.device_ids_to_use[i];
            let queue = {
                let context = ctx.raw_context()?;
                check_err!(ctx.driver.create_queue(context, device, enable_profiling))
            };
            ctx.command_queues.push(queue);
        }

        debug!(
            num_queues = ctx.command_queues.len(),
            profiling = enable_profiling,
            "created device context"
        );
        Ok(ctx)
    }

    /// Build a context from a [`DeviceConfig`]
    pub fn from_config(driver: D, config: &DeviceConfig) -> Result<Self> {
        Self::new(driver, &config.gpu_idxs, config.enable_profiling)
    }

    /// Build a context from [`DeviceConfig::from_env`]
    pub fn from_env(driver: D) -> Result<Self> {
        Self::from_config(driver, &DeviceConfig::from_env()?)
    }

    /// Position of system device `gpu_idx` within the selected devices
    pub fn find_which_gpu(&self, gpu_idx: usize) -> Result<usize> {
        self.gpu_idxs_to_use
            .iter()
            .position(|&idx| idx == gpu_idx)
            .ok_or_else(|| NnClError::NotFound {
                gpu_idx,
                selected: self.gpu_idxs_to_use.clone(),
            })
    }

    /// Command queue of the `which`-th selected device
    pub fn queue(&self, which: usize) -> Result<CommandQueue<'_, D>> {
        if which >= self.command_queues.len() {
            check_errors(
                status::CL_INVALID_COMMAND_QUEUE,
                file!(),
                "DeviceContext::queue(which)",
                line!(),
            )?;
        }
        Ok(CommandQueue::new(self, which))
    }

    /// Command queue bound to system device `gpu_idx`
    pub fn queue_for_gpu(&self, gpu_idx: usize) -> Result<CommandQueue<'_, D>> {
        let which = self.find_which_gpu(gpu_idx)?;
        self.queue(which)
    }

    /// Release all queues, then the context. Calling again is a no-op.
    ///
    /// Every handle is released even if an earlier release fails; the first
    /// failure is returned.
    #[instrument(skip(self), fields(num_queues = self.command_queues.len()))]
    pub fn release(&mut self) -> Result<()> {
        let mut first_err = None;

        for queue in self.command_queues.drain(..) {
            let code = self.driver.release_queue(queue);
            if let Err(e) = check_errors(code, file!(), "release_queue(queue)", line!()) {
                first_err.get_or_insert(e);
            }
        }

        if let Some(context) = self.context.take() {
            let code = self.driver.release_context(context);
            if let Err(e) = check_errors(code, file!(), "release_context(context)", line!()) {
                first_err.get_or_insert(e);
            }
        }

        first_err.map_or(Ok(()), Err)
    }

    pub fn is_released(&self) -> bool {
        self.context.is_none()
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    /// Every device found during enumeration, indexed by `gpu_idx`
    pub fn devices(&self) -> &[DeviceInfo<D::Device>] {
        &self.devices
    }

    pub fn num_platforms(&self) -> usize {
        self.platforms.len()
    }

    /// System indices of the selected devices, in queue order
    pub fn gpu_idxs_to_use(&self) -> &[usize] {
        &self.gpu_idxs_to_use
    }

    /// Selected devices, in queue order
    pub fn selected(&self) -> impl Iterator<Item = &DeviceInfo<D::Device>> + '_ {
        self.gpu_idxs_to_use.iter().map(move |&idx| &self.devices[idx])
    }

    pub fn device_ids_to_use(&self) -> &[D::Device] {
        &self.device_ids_to_use
    }

    pub fn num_selected(&self) -> usize {
        self.gpu_idxs_to_use.len()
    }

    pub fn profiling_enabled(&self) -> bool {
        self.profiling_enabled
    }

    pub(crate) fn raw_context(&self) -> Result<&D::Context> {
        match &self.context {
            Some(context) => Ok(context),
            None => Err(crate::error::device_error(
                status::CL_INVALID_CONTEXT,
                file!(),
                "DeviceContext::raw_context()",
                line!(),
            )),
        }
    }

    pub(crate) fn raw_queue(&self, which: usize) -> Result<&D::Queue> {
        match self.command_queues.get(which) {
            Some(queue) => Ok(queue),
            None => Err(crate::error::device_error(
                status::CL_INVALID_COMMAND_QUEUE,
                file!(),
                "DeviceContext::raw_queue(which)",
                line!(),
            )),
        }
    }
}

impl<D: Driver> Drop for DeviceContext<D> {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "failed to release device context cleanly");
        }
    }
}

type Enumerated<D> = (
    Vec<<D as Driver>::Platform>,
    Vec<DeviceInfo<<D as Driver>::Device>>,
);

/// Discover every platform and device, assigning global indices in order
fn enumerate<D: Driver>(driver: &D) -> Result<Enumerated<D>> {
    let platforms = check_err!(driver.platforms());
    let mut devices = Vec::new();

    for (platform_idx, &platform) in platforms.iter().enumerate() {
        let platform_devices = match driver.devices(platform) {
            // A platform without devices is not an error
            Err(status::CL_DEVICE_NOT_FOUND) => Vec::new(),
            other => check_err!(other),
        };
        for device in platform_devices {
            let name = check_err!(driver.device_name(device));
            let vendor = check_err!(driver.device_vendor(device));
            debug!(gpu_idx = devices.len(), platform_idx, %name, %vendor, "found device");
            devices.push(DeviceInfo {
                gpu_idx: devices.len(),
                platform_idx,
                device,
                name,
                vendor,
            });
        }
    }

    Ok((platforms, devices))
}

/// Validate requested indices against what was discovered
fn select_devices<Dev>(devices: &[DeviceInfo<Dev>], requested: &[usize]) -> Result<Vec<usize>> {
    if devices.is_empty() {
        return Err(NnClError::Configuration(
            "no compute devices were found".to_string(),
        ));
    }
    if requested.is_empty() {
        return Ok((0..devices.len()).collect());
    }

    let valid: Vec<usize> = devices.iter().map(|d| d.gpu_idx).collect();
    let mut selected = Vec::with_capacity(requested.len());
    for &idx in requested {
        if idx >= devices.len() {
            return Err(NnClError::Configuration(format!(
                "requested device {} but valid device indices are {:?}",
                idx, valid
            )));
        }
        if selected.contains(&idx) {
            return Err(NnClError::Configuration(format!(
                "device {} was requested more than once",
                idx
            )));
        }
        selected.push(idx);
    }
    Ok(selected)
}
