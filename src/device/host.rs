//! In-process reference device
//!
//! `HostDriver` behaves like an OpenCL runtime with a configurable set of
//! platforms and devices, but executes the kernel contracts from
//! [`crate::ops::cpu_ref`] on the calling thread. Programs are "compiled" by
//! scanning the source for `__kernel` declarations and reading `-D` defines
//! from the build options, so a program built for the host device uses the
//! same tuning constants a real device build would.
//!
//! Every lifecycle call is recorded in a [`HostCallLog`], which lets tests
//! observe ordering (for example that queues are released before their
//! context).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, debug_span, instrument};

use super::{BufferAccess, BufferInit, BuildFailure, Driver, KernelArg, NdRange};
use crate::error::{status, Status};
use crate::ops::cpu_ref::{self, BatchShape, GemmLayout, WinogradDims, WinogradMatrices};
use crate::ops::kernel_names;

/// A simulated device
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostDeviceSpec {
    pub name: String,
    pub vendor: String,
    /// Largest single allocation the device accepts, in floats
    pub max_alloc_floats: usize,
}

impl HostDeviceSpec {
    pub fn new(name: &str, vendor: &str) -> Self {
        Self {
            name: name.to_string(),
            vendor: vendor.to_string(),
            max_alloc_floats: usize::MAX,
        }
    }

    pub fn with_max_alloc(mut self, floats: usize) -> Self {
        self.max_alloc_floats = floats;
        self
    }
}

/// A simulated platform and its devices
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostPlatformSpec {
    pub name: String,
    pub devices: Vec<HostDeviceSpec>,
}

impl HostPlatformSpec {
    pub fn new(name: &str, devices: Vec<HostDeviceSpec>) -> Self {
        Self {
            name: name.to_string(),
            devices,
        }
    }
}

/// Identity of a simulated device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HostDeviceId {
    pub platform: usize,
    pub device: usize,
}

/// One recorded driver call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HostCall {
    CreateContext { devices: Vec<HostDeviceId> },
    CreateQueue { device: HostDeviceId, profiling: bool },
    ReleaseQueue { device: HostDeviceId },
    ReleaseContext { num_devices: usize },
    CreateBuffer { access: BufferAccess, floats: usize },
    BuildProgram { kernels: Vec<String> },
    EnqueueKernel { kernel: String, device: HostDeviceId, range: NdRange },
    ReadBuffer { device: HostDeviceId, floats: usize },
    Finish { device: HostDeviceId },
}

/// Shared record of driver calls; clones observe the same log
#[derive(Debug, Clone, Default)]
pub struct HostCallLog {
    calls: Arc<Mutex<Vec<HostCall>>>,
}

impl HostCallLog {
    fn record(&self, call: HostCall) {
        self.calls.lock().push(call);
    }

    pub fn snapshot(&self) -> Vec<HostCall> {
        self.calls.lock().clone()
    }

    pub fn clear(&self) {
        self.calls.lock().clear();
    }
}

pub struct HostContext {
    devices: Vec<HostDeviceId>,
    max_alloc_floats: usize,
}

pub struct HostQueue {
    device: HostDeviceId,
    profiling: bool,
}

#[derive(Debug)]
pub struct HostBuffer {
    data: Arc<RwLock<Vec<f32>>>,
    access: BufferAccess,
}

impl HostBuffer {
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<f32> {
        self.data.read().clone()
    }
}

/// Tiling constants a GEMM kernel was compiled with
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct GemmTiling {
    mwg: usize,
    nwg: usize,
    kwg: usize,
    mdimc: usize,
    ndimc: usize,
}

#[derive(Debug, Clone, Copy)]
enum HostEntry {
    XgemmBatched(GemmTiling),
    XgemmStridedBatched(GemmTiling),
    XgemmDirectBatchedNT(GemmTiling),
    WinogradTransform(WinogradMatrices),
    WinogradUntransform(WinogradMatrices),
}

pub struct HostProgram {
    kernels: Vec<(String, HostEntry)>,
}

pub struct HostKernel {
    name: String,
    entry: HostEntry,
}

#[derive(Debug, Clone, Copy)]
pub struct HostEvent {
    start_ns: u64,
    end_ns: u64,
    profiled: bool,
}

/// Reference driver that runs kernels on the host CPU
pub struct HostDriver {
    platforms: Vec<HostPlatformSpec>,
    log: HostCallLog,
    epoch: Instant,
}

impl Default for HostDriver {
    /// One platform with a single reference device
    fn default() -> Self {
        Self::new(vec![HostPlatformSpec::new(
            "Host Reference Platform",
            vec![HostDeviceSpec::new("Host Reference Device", "nn_opencl")],
        )])
    }
}

impl HostDriver {
    pub fn new(platforms: Vec<HostPlatformSpec>) -> Self {
        Self {
            platforms,
            log: HostCallLog::default(),
            epoch: Instant::now(),
        }
    }

    /// Handle to the call log that stays valid after the driver is dropped
    pub fn call_log(&self) -> HostCallLog {
        self.log.clone()
    }

    fn spec(&self, device: HostDeviceId) -> Result<&HostDeviceSpec, Status> {
        self.platforms
            .get(device.platform)
            .and_then(|p| p.devices.get(device.device))
            .ok_or(status::CL_INVALID_DEVICE)
    }

    fn now_ns(&self) -> u64 {
        self.epoch.elapsed().as_nanos() as u64
    }
}

impl Driver for HostDriver {
    type Platform = usize;
    type Device = HostDeviceId;
    type Context = HostContext;
    type Queue = HostQueue;
    type Buffer = HostBuffer;
    type Program = HostProgram;
    type Kernel = HostKernel;
    type Event = HostEvent;

    fn name(&self) -> &'static str {
        "host"
    }

    fn platforms(&self) -> Result<Vec<usize>, Status> {
        Ok((0..self.platforms.len()).collect())
    }

    fn devices(&self, platform: usize) -> Result<Vec<HostDeviceId>, Status> {
        let spec = self.platforms.get(platform).ok_or(status::CL_INVALID_PLATFORM)?;
        if spec.devices.is_empty() {
            return Err(status::CL_DEVICE_NOT_FOUND);
        }
        Ok((0..spec.devices.len())
            .map(|device| HostDeviceId { platform, device })
            .collect())
    }

    fn device_name(&self, device: HostDeviceId) -> Result<String, Status> {
        Ok(self.spec(device)?.name.clone())
    }

    fn device_vendor(&self, device: HostDeviceId) -> Result<String, Status> {
        Ok(self.spec(device)?.vendor.clone())
    }

    fn create_context(&self, devices: &[HostDeviceId]) -> Result<HostContext, Status> {
        if devices.is_empty() {
            return Err(status::CL_INVALID_VALUE);
        }
        let mut max_alloc_floats = usize::MAX;
        for &device in devices {
            max_alloc_floats = max_alloc_floats.min(self.spec(device)?.max_alloc_floats);
        }
        self.log.record(HostCall::CreateContext {
            devices: devices.to_vec(),
        });
        Ok(HostContext {
            devices: devices.to_vec(),
            max_alloc_floats,
        })
    }

    fn create_queue(
        &self,
        context: &HostContext,
        device: HostDeviceId,
        enable_profiling: bool,
    ) -> Result<HostQueue, Status> {
        if !context.devices.contains(&device) {
            return Err(status::CL_INVALID_DEVICE);
        }
        self.log.record(HostCall::CreateQueue {
            device,
            profiling: enable_profiling,
        });
        Ok(HostQueue {
            device,
            profiling: enable_profiling,
        })
    }

    fn release_queue(&self, queue: HostQueue) -> Status {
        self.log.record(HostCall::ReleaseQueue {
            device: queue.device,
        });
        status::CL_SUCCESS
    }

    fn release_context(&self, context: HostContext) -> Status {
        self.log.record(HostCall::ReleaseContext {
            num_devices: context.devices.len(),
        });
        status::CL_SUCCESS
    }

    fn create_buffer(
        &self,
        context: &HostContext,
        access: BufferAccess,
        init: BufferInit<'_>,
    ) -> Result<HostBuffer, Status> {
        let floats = init.len();
        if floats == 0 {
            return Err(status::CL_INVALID_BUFFER_SIZE);
        }
        if floats > context.max_alloc_floats {
            return Err(status::CL_MEM_OBJECT_ALLOCATION_FAILURE);
        }
        let data = match init {
            BufferInit::CopyFrom(src) => src.to_vec(),
            // Real devices leave this uninitialized; NaN makes stale reads obvious
            BufferInit::Uninit(n) => vec![f32::NAN; n],
        };
        self.log.record(HostCall::CreateBuffer { access, floats });
        Ok(HostBuffer {
            data: Arc::new(RwLock::new(data)),
            access,
        })
    }

    fn read_buffer_blocking(
        &self,
        queue: &HostQueue,
        buffer: &HostBuffer,
        out: &mut [f32],
    ) -> Status {
        let data = buffer.data.read();
        if out.len() > data.len() {
            return status::CL_INVALID_VALUE;
        }
        out.copy_from_slice(&data[..out.len()]);
        self.log.record(HostCall::ReadBuffer {
            device: queue.device,
            floats: out.len(),
        });
        status::CL_SUCCESS
    }

    #[instrument(skip(self, _context, source), fields(source_len = source.len()))]
    fn build_program(
        &self,
        _context: &HostContext,
        devices: &[HostDeviceId],
        source: &str,
        options: &str,
    ) -> Result<HostProgram, BuildFailure> {
        let defines = parse_options(options)?;
        let names = declared_kernels(source);
        if names.is_empty() {
            return Err(BuildFailure {
                status: status::CL_BUILD_PROGRAM_FAILURE,
                log: "error: program source declares no __kernel functions".to_string(),
            });
        }

        let mut kernels = Vec::with_capacity(names.len());
        let mut log = Vec::new();
        for name in &names {
            match resolve_entry(name, &defines) {
                Ok(entry) => kernels.push((name.clone(), entry)),
                Err(msg) => log.push(format!("kernel '{}': error: {}", name, msg)),
            }
        }
        if !log.is_empty() {
            let mut full = String::new();
            for &device in devices {
                let device_name = self
                    .spec(device)
                    .map(|s| s.name.as_str())
                    .unwrap_or("<unknown>");
                full.push_str(&format!("Build log for device {}:\n", device_name));
                for line in &log {
                    full.push_str(line);
                    full.push('\n');
                }
            }
            return Err(BuildFailure {
                status: status::CL_BUILD_PROGRAM_FAILURE,
                log: full,
            });
        }

        debug!(kernels = ?names, "built host program");
        self.log.record(HostCall::BuildProgram { kernels: names });
        Ok(HostProgram { kernels })
    }

    fn create_kernel(&self, program: &HostProgram, name: &str) -> Result<HostKernel, Status> {
        program
            .kernels
            .iter()
            .find(|(n, _)| n == name)
            .map(|(n, entry)| HostKernel {
                name: n.clone(),
                entry: *entry,
            })
            .ok_or(status::CL_INVALID_KERNEL_NAME)
    }

    fn enqueue_kernel(
        &self,
        queue: &HostQueue,
        kernel: &HostKernel,
        args: &[KernelArg<'_, HostBuffer>],
        range: &NdRange,
        _wait_for: &[&HostEvent],
    ) -> Result<HostEvent, Status> {
        // Host events complete at enqueue, so every wait list is already satisfied
        check_range(range)?;
        let start_ns = self.now_ns();
        debug_span!("HostKernel", kernel = %kernel.name, %range)
            .in_scope(|| execute(kernel.entry, args, range))?;
        let end_ns = self.now_ns();

        self.log.record(HostCall::EnqueueKernel {
            kernel: kernel.name.clone(),
            device: queue.device,
            range: *range,
        });
        Ok(HostEvent {
            start_ns,
            end_ns,
            profiled: queue.profiling,
        })
    }

    fn wait_for_event(&self, _event: &HostEvent) -> Status {
        status::CL_SUCCESS
    }

    fn event_profile(&self, event: &HostEvent) -> Result<(u64, u64), Status> {
        if !event.profiled {
            return Err(status::CL_PROFILING_INFO_NOT_AVAILABLE);
        }
        Ok((event.start_ns, event.end_ns))
    }

    fn finish(&self, queue: &HostQueue) -> Status {
        self.log.record(HostCall::Finish {
            device: queue.device,
        });
        status::CL_SUCCESS
    }
}

/// Names following each `__kernel` keyword, in source order
fn declared_kernels(source: &str) -> Vec<String> {
    source
        .split("__kernel")
        .skip(1)
        .filter_map(|rest| {
            let rest = rest.trim_start();
            let rest = rest.strip_prefix("void").unwrap_or(rest).trim_start();
            let name: String = rest
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            (!name.is_empty()).then_some(name)
        })
        .collect()
}

/// Collect `-DNAME=VALUE` defines; other `-cl-*` style flags are accepted
fn parse_options(options: &str) -> Result<HashMap<String, String>, BuildFailure> {
    let mut defines = HashMap::new();
    for token in options.split_whitespace() {
        if let Some(define) = token.strip_prefix("-D") {
            let (name, value) = define.split_once('=').unwrap_or((define, "1"));
            defines.insert(name.to_string(), value.to_string());
        } else if !(token.starts_with("-cl-") || token == "-w" || token == "-Werror") {
            return Err(BuildFailure {
                status: status::CL_INVALID_BUILD_OPTIONS,
                log: format!("error: unrecognized build option '{}'", token),
            });
        }
    }
    Ok(defines)
}

fn define(defines: &HashMap<String, String>, name: &str) -> Result<usize, String> {
    let value = defines
        .get(name)
        .ok_or_else(|| format!("use of undeclared identifier '{}'", name))?;
    match value.parse::<usize>() {
        Ok(v) if v > 0 => Ok(v),
        _ => Err(format!("{} must be a positive integer, got '{}'", name, value)),
    }
}

fn resolve_entry(name: &str, defines: &HashMap<String, String>) -> Result<HostEntry, String> {
    let xgemm_tiling = || -> Result<GemmTiling, String> {
        Ok(GemmTiling {
            mwg: define(defines, "MWG")?,
            nwg: define(defines, "NWG")?,
            kwg: define(defines, "KWG")?,
            mdimc: define(defines, "MDIMC")?,
            ndimc: define(defines, "NDIMC")?,
        })
    };
    let winograd = || -> Result<WinogradMatrices, String> {
        let x = define(defines, "OUTTILE_XSIZE")?;
        let y = define(defines, "OUTTILE_YSIZE")?;
        let in_x = define(defines, "INTILE_XSIZE")?;
        if x != y {
            return Err(format!("non-square output tiles {}x{} are not supported", x, y));
        }
        let mats = WinogradMatrices::for_out_tile(x)
            .ok_or_else(|| format!("no Winograd transform for output tile size {}", x))?;
        if mats.in_tile != in_x {
            return Err(format!(
                "INTILE_XSIZE={} does not match OUTTILE_XSIZE={}",
                in_x, x
            ));
        }
        Ok(mats)
    };

    match name {
        kernel_names::XGEMM_BATCHED => Ok(HostEntry::XgemmBatched(xgemm_tiling()?)),
        kernel_names::XGEMM_STRIDED_BATCHED => Ok(HostEntry::XgemmStridedBatched(xgemm_tiling()?)),
        kernel_names::XGEMM_DIRECT_BATCHED_NT => {
            let wgd = define(defines, "WGD")?;
            Ok(HostEntry::XgemmDirectBatchedNT(GemmTiling {
                mwg: wgd,
                nwg: wgd,
                kwg: define(defines, "KWID")?,
                mdimc: define(defines, "MDIMCD")?,
                ndimc: define(defines, "NDIMCD")?,
            }))
        }
        kernel_names::WINOGRAD_TRANSFORM => Ok(HostEntry::WinogradTransform(winograd()?)),
        kernel_names::WINOGRAD_UNTRANSFORM => Ok(HostEntry::WinogradUntransform(winograd()?)),
        other => Err(format!("no host implementation for kernel '{}'", other)),
    }
}

fn check_range(range: &NdRange) -> Result<(), Status> {
    for d in 0..3 {
        if range.global[d] == 0 {
            return Err(status::CL_INVALID_GLOBAL_WORK_SIZE);
        }
        if range.local[d] == 0 || range.global[d] % range.local[d] != 0 {
            return Err(status::CL_INVALID_WORK_GROUP_SIZE);
        }
    }
    Ok(())
}

fn int_arg(args: &[KernelArg<'_, HostBuffer>], i: usize) -> Result<usize, Status> {
    match args.get(i) {
        Some(KernelArg::Int(v)) if *v >= 0 => Ok(*v as usize),
        Some(KernelArg::Int(_)) => Err(status::CL_INVALID_ARG_VALUE),
        _ => Err(status::CL_INVALID_KERNEL_ARGS),
    }
}

fn buf_arg<'a>(args: &[KernelArg<'a, HostBuffer>], i: usize) -> Result<&'a HostBuffer, Status> {
    match args.get(i) {
        Some(KernelArg::Buffer(b)) => Ok(*b),
        _ => Err(status::CL_INVALID_KERNEL_ARGS),
    }
}

fn expect_arg_count(args: &[KernelArg<'_, HostBuffer>], n: usize) -> Result<(), Status> {
    if args.len() == n {
        Ok(())
    } else {
        Err(status::CL_INVALID_KERNEL_ARGS)
    }
}

fn writable(buffer: &HostBuffer) -> Result<(), Status> {
    match buffer.access {
        BufferAccess::ReadWrite => Ok(()),
        BufferAccess::ReadOnly => Err(status::CL_INVALID_MEM_OBJECT),
    }
}

fn fits(buffer: &HostBuffer, floats: usize) -> Result<(), Status> {
    if buffer.len() >= floats {
        Ok(())
    } else {
        Err(status::CL_INVALID_ARG_VALUE)
    }
}

fn run_gemm(
    layout: GemmLayout,
    tiling: GemmTiling,
    shape: BatchShape,
    range: &NdRange,
    a: &HostBuffer,
    b: &HostBuffer,
    c: &HostBuffer,
) -> Result<(), Status> {
    let GemmTiling {
        mwg,
        nwg,
        kwg,
        mdimc,
        ndimc,
    } = tiling;
    if shape.m % mwg != 0 || shape.n % nwg != 0 || shape.k % kwg != 0 {
        return Err(status::CL_INVALID_ARG_VALUE);
    }
    let expected = NdRange {
        global: [shape.m * mdimc / mwg, shape.n * ndimc / nwg, range.global[2]],
        local: [mdimc, ndimc, 1],
    };
    if range.local != expected.local {
        return Err(status::CL_INVALID_WORK_GROUP_SIZE);
    }
    if range.global != expected.global {
        return Err(status::CL_INVALID_GLOBAL_WORK_SIZE);
    }

    let shape = BatchShape {
        batch: range.global[2],
        ..shape
    };
    let (a_len, b_len, c_len) = shape.extents();
    fits(a, a_len)?;
    fits(b, b_len)?;
    fits(c, c_len)?;
    writable(c)?;

    let a_data = a.snapshot();
    let b_data = b.snapshot();
    let mut c_data = c.data.write();
    cpu_ref::batched_gemm(layout, shape, &a_data, &b_data, &mut c_data);
    Ok(())
}

fn winograd_dims(args: &[KernelArg<'_, HostBuffer>]) -> Result<WinogradDims, Status> {
    Ok(WinogradDims {
        batch: int_arg(args, 2)?,
        nn_x_len: int_arg(args, 3)?,
        nn_y_len: int_arg(args, 4)?,
        num_tiles_x: int_arg(args, 5)?,
        num_tiles_y: int_arg(args, 6)?,
        channels: int_arg(args, 7)?,
    })
}

fn check_winograd_dims(
    mats: &WinogradMatrices,
    dims: &WinogradDims,
    range: &NdRange,
) -> Result<(), Status> {
    if dims.num_tiles_x != dims.nn_x_len.div_ceil(mats.out_tile)
        || dims.num_tiles_y != dims.nn_y_len.div_ceil(mats.out_tile)
    {
        return Err(status::CL_INVALID_ARG_VALUE);
    }
    if range.global[0] < dims.num_tiles_x
        || range.global[1] < dims.num_tiles_y
        || range.global[2] < dims.batch * dims.channels
    {
        return Err(status::CL_INVALID_GLOBAL_WORK_SIZE);
    }
    Ok(())
}

fn execute(
    entry: HostEntry,
    args: &[KernelArg<'_, HostBuffer>],
    range: &NdRange,
) -> Result<(), Status> {
    match entry {
        HostEntry::XgemmBatched(tiling) => {
            expect_arg_count(args, 6)?;
            let (m, n, k) = (int_arg(args, 0)?, int_arg(args, 1)?, int_arg(args, 2)?);
            let shape = BatchShape::contiguous(m, n, k, range.global[2]);
            run_gemm(
                GemmLayout::KmKn,
                tiling,
                shape,
                range,
                buf_arg(args, 3)?,
                buf_arg(args, 4)?,
                buf_arg(args, 5)?,
            )
        }
        HostEntry::XgemmStridedBatched(tiling) => {
            expect_arg_count(args, 9)?;
            let shape = BatchShape {
                m: int_arg(args, 0)?,
                n: int_arg(args, 1)?,
                k: int_arg(args, 2)?,
                batch: range.global[2],
                a_stride: int_arg(args, 3)?,
                b_stride: int_arg(args, 4)?,
                c_stride: int_arg(args, 5)?,
            };
            run_gemm(
                GemmLayout::KmKn,
                tiling,
                shape,
                range,
                buf_arg(args, 6)?,
                buf_arg(args, 7)?,
                buf_arg(args, 8)?,
            )
        }
        HostEntry::XgemmDirectBatchedNT(tiling) => {
            expect_arg_count(args, 6)?;
            let (m, n, k) = (int_arg(args, 0)?, int_arg(args, 1)?, int_arg(args, 2)?);
            let shape = BatchShape::contiguous(m, n, k, range.global[2]);
            run_gemm(
                GemmLayout::MkNk,
                tiling,
                shape,
                range,
                buf_arg(args, 3)?,
                buf_arg(args, 4)?,
                buf_arg(args, 5)?,
            )
        }
        HostEntry::WinogradTransform(mats) => {
            expect_arg_count(args, 8)?;
            let (input, workspace) = (buf_arg(args, 0)?, buf_arg(args, 1)?);
            let dims = winograd_dims(args)?;
            check_winograd_dims(&mats, &dims, range)?;
            fits(input, dims.spatial_len())?;
            fits(workspace, dims.workspace_len(&mats))?;
            writable(workspace)?;

            let input_data = input.snapshot();
            let mut ws = workspace.data.write();
            cpu_ref::winograd_transform(&mats, dims, &input_data, &mut ws);
            Ok(())
        }
        HostEntry::WinogradUntransform(mats) => {
            expect_arg_count(args, 8)?;
            let (workspace, output) = (buf_arg(args, 0)?, buf_arg(args, 1)?);
            let dims = winograd_dims(args)?;
            check_winograd_dims(&mats, &dims, range)?;
            fits(workspace, dims.workspace_len(&mats))?;
            fits(output, dims.spatial_len())?;
            writable(output)?;

            let ws = workspace.snapshot();
            let mut out = output.data.write();
            cpu_ref::winograd_untransform(&mats, dims, &ws, &mut out);
            Ok(())
        }
    }
}
