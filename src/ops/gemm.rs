//! Batched GEMM dispatch
//!
//! Three kernel families are supported:
//! - `XgemmBatched`: A is `[k][m]`, B is `[k][n]`, batches packed back to back
//! - `XgemmStridedBatched`: same operand layout with explicit batch strides
//! - `XgemmDirectBatchedNT`: A is `[m][k]`, B is `[n][k]`
//!
//! In every case C is `[m][n]` and is overwritten.

use tracing::{debug_span, instrument};

use super::cpu_ref::BatchShape;
use super::{
    int_arg, require_capacity, require_positive, require_same_context, require_writable, Launch,
};
use crate::buffers::DeviceBuffer;
use crate::device::{Driver, Event, KernelArg, NdRange};
use crate::error::{NnClError, Result};
use crate::program::Kernel;
use crate::tune::TuneParams;

/// Work-group tiling that M, N and K must be multiples of
#[derive(Debug, Clone, Copy)]
struct Tiling {
    m_tile: usize,
    n_tile: usize,
    k_tile: usize,
    m_threads: usize,
    n_threads: usize,
}

impl Tiling {
    fn xgemm(tune: &TuneParams) -> Self {
        let p = &tune.xgemm;
        Self {
            m_tile: p.mwg,
            n_tile: p.nwg,
            k_tile: p.kwg,
            m_threads: p.mdimc,
            n_threads: p.ndimc,
        }
    }

    fn direct(tune: &TuneParams) -> Self {
        let p = &tune.xgemm_direct;
        Self {
            m_tile: p.wgd,
            n_tile: p.wgd,
            k_tile: p.kwid,
            m_threads: p.mdimcd,
            n_threads: p.ndimcd,
        }
    }

    /// Launch range for an evenly tiled problem; uneven sizes are rejected
    fn range(&self, m: usize, n: usize, k: usize, batch: usize) -> Result<NdRange> {
        let sizes = [self.m_tile, self.n_tile, self.k_tile, self.m_threads, self.n_threads];
        if sizes.contains(&0) {
            return Err(NnClError::Configuration(format!(
                "gemm tiling {:?} has a zero size",
                self
            )));
        }
        if m % self.m_tile != 0 || n % self.n_tile != 0 || k % self.k_tile != 0 {
            return Err(NnClError::Configuration(format!(
                "gemm size {}x{}x{} is not a multiple of the {}x{}x{} tiling",
                m, n, k, self.m_tile, self.n_tile, self.k_tile
            )));
        }
        Ok(NdRange {
            global: [
                m * self.m_threads / self.m_tile,
                n * self.n_threads / self.n_tile,
                batch,
            ],
            local: [self.m_threads, self.n_threads, 1],
        })
    }
}

fn check_operands<D: Driver>(
    shape: &BatchShape,
    a: &DeviceBuffer<'_, D>,
    b: &DeviceBuffer<'_, D>,
    c: &DeviceBuffer<'_, D>,
) -> Result<()> {
    require_positive(&[
        ("M", shape.m),
        ("N", shape.n),
        ("K", shape.k),
        ("batch size", shape.batch),
    ])?;
    let (a_len, b_len, c_len) = shape.extents();
    require_capacity("A", a, a_len)?;
    require_capacity("B", b, b_len)?;
    require_capacity("C", c, c_len)?;
    require_writable("C", c)
}

/// Batched `C[m][n] = sum_k A[k][m] * B[k][n]` with contiguous batches
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(m = m, n = n, k = k, batch = batch_size))]
pub fn do_batched_xgemm_km_kn_mn<'e, 'ctx: 'e, D: Driver>(
    kernel: &Kernel<'ctx, D>,
    launch: impl Into<Launch<'e, 'ctx, D>>,
    tune: &TuneParams,
    m: usize,
    n: usize,
    k: usize,
    a: &DeviceBuffer<'ctx, D>,
    b: &DeviceBuffer<'ctx, D>,
    c: &DeviceBuffer<'ctx, D>,
    batch_size: usize,
) -> Result<Event<'ctx, D>> {
    let launch = launch.into();
    require_same_context(kernel, &launch, &[("A", a), ("B", b), ("C", c)])?;
    let shape = BatchShape::contiguous(m, n, k, batch_size);
    check_operands(&shape, a, b, c)?;
    let range = Tiling::xgemm(tune).range(m, n, k, batch_size)?;

    let args = [
        int_arg("M", m)?,
        int_arg("N", n)?,
        int_arg("K", k)?,
        KernelArg::Buffer(a.raw()),
        KernelArg::Buffer(b.raw()),
        KernelArg::Buffer(c.raw()),
    ];
    debug_span!("enqueue", kernel = kernel.name(), %range)
        .in_scope(|| launch.queue().enqueue(kernel.raw(), &args, &range, launch.wait_for))
}

/// Batched KM x KN -> MN GEMM with explicit batch strides (in floats)
///
/// `a_stride` and `b_stride` may be 0 to reuse one operand for every batch
/// element; `c_stride` must be at least `m * n` so outputs do not overlap.
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(
    m = m,
    n = n,
    k = k,
    a_stride = a_stride,
    b_stride = b_stride,
    c_stride = c_stride,
    batch = batch_size
))]
pub fn do_strided_batched_xgemm_km_kn_mn<'e, 'ctx: 'e, D: Driver>(
    kernel: &Kernel<'ctx, D>,
    launch: impl Into<Launch<'e, 'ctx, D>>,
    tune: &TuneParams,
    m: usize,
    n: usize,
    k: usize,
    a: &DeviceBuffer<'ctx, D>,
    a_stride: usize,
    b: &DeviceBuffer<'ctx, D>,
    b_stride: usize,
    c: &DeviceBuffer<'ctx, D>,
    c_stride: usize,
    batch_size: usize,
) -> Result<Event<'ctx, D>> {
    let launch = launch.into();
    require_same_context(kernel, &launch, &[("A", a), ("B", b), ("C", c)])?;
    if c_stride < m * n {
        return Err(NnClError::Configuration(format!(
            "c_stride {} would overlap {}x{} outputs",
            c_stride, m, n
        )));
    }
    let shape = BatchShape {
        m,
        n,
        k,
        batch: batch_size,
        a_stride,
        b_stride,
        c_stride,
    };
    check_operands(&shape, a, b, c)?;
    let range = Tiling::xgemm(tune).range(m, n, k, batch_size)?;

    let args = [
        int_arg("M", m)?,
        int_arg("N", n)?,
        int_arg("K", k)?,
        int_arg("a_stride", a_stride)?,
        int_arg("b_stride", b_stride)?,
        int_arg("c_stride", c_stride)?,
        KernelArg::Buffer(a.raw()),
        KernelArg::Buffer(b.raw()),
        KernelArg::Buffer(c.raw()),
    ];
    debug_span!("enqueue", kernel = kernel.name(), %range)
        .in_scope(|| launch.queue().enqueue(kernel.raw(), &args, &range, launch.wait_for))
}

/// Batched `C[m][n] = sum_k A[m][k] * B[n][k]` with contiguous batches
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(m = m, n = n, k = k, batch = batch_size))]
pub fn do_batched_xgemm_mk_nk_mn<'e, 'ctx: 'e, D: Driver>(
    kernel: &Kernel<'ctx, D>,
    launch: impl Into<Launch<'e, 'ctx, D>>,
    tune: &TuneParams,
    m: usize,
    n: usize,
    k: usize,
    a: &DeviceBuffer<'ctx, D>,
    b: &DeviceBuffer<'ctx, D>,
    c: &DeviceBuffer<'ctx, D>,
    batch_size: usize,
) -> Result<Event<'ctx, D>> {
    let launch = launch.into();
    require_same_context(kernel, &launch, &[("A", a), ("B", b), ("C", c)])?;
    let shape = BatchShape::contiguous(m, n, k, batch_size);
    check_operands(&shape, a, b, c)?;
    let range = Tiling::direct(tune).range(m, n, k, batch_size)?;

    let args = [
        int_arg("M", m)?,
        int_arg("N", n)?,
        int_arg("K", k)?,
        KernelArg::Buffer(a.raw()),
        KernelArg::Buffer(b.raw()),
        KernelArg::Buffer(c.raw()),
    ];
    debug_span!("enqueue", kernel = kernel.name(), %range)
        .in_scope(|| launch.queue().enqueue(kernel.raw(), &args, &range, launch.wait_for))
}
