//! Winograd 3x3 convolution stages
//!
//! A 3x3 "same" convolution is computed in three launches:
//! 1. `transform`: NHWC input -> workspace `[xi*T + nu][ic][tile]`
//! 2. batched KM x KN -> MN GEMM with the filter-transformed weights
//!    `[xi*T + nu][ic][oc]` as A, giving `[xi*T + nu][oc][tile]`
//! 3. `untransform`: workspace -> NHWC output
//!
//! `T` is the input tile size (output tile + 2) and
//! `tile = (n * num_tiles_y + ty) * num_tiles_x + tx`. Tiles that overhang
//! the image read zeros on transform and are clipped on untransform.

use tracing::{debug_span, instrument};

use super::cpu_ref::{self, WinogradMatrices};
use super::{
    int_arg, require_capacity, require_positive, require_same_context, require_writable, Launch,
};
use crate::buffers::DeviceBuffer;
use crate::device::{Driver, Event, KernelArg, NdRange};
use crate::error::{NnClError, Result};
use crate::program::Kernel;
use crate::size::round_up_to_multiple;
use crate::tune::{Conv3x3Params, TuneParams, CONV_SIZE};

/// Tile counts and workspace sizes for one image size
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WinogradGeometry {
    pub nn_x_len: usize,
    pub nn_y_len: usize,
    pub num_tiles_x: usize,
    pub num_tiles_y: usize,
    /// Winograd-domain positions per tile, also the GEMM batch count
    pub tile_area: usize,
}

impl WinogradGeometry {
    /// # Panics
    /// * If either output tile size is zero; dispatch validates the tuning first
    pub fn new(tune: &TuneParams, nn_x_len: usize, nn_y_len: usize) -> Self {
        let conv = &tune.conv3x3;
        Self {
            nn_x_len,
            nn_y_len,
            num_tiles_x: nn_x_len.div_ceil(conv.out_tile_x_size),
            num_tiles_y: nn_y_len.div_ceil(conv.out_tile_y_size),
            tile_area: conv.tile_area(),
        }
    }

    /// Tiles across the whole batch (the GEMM N dimension)
    pub fn num_tiles(&self, batch: usize) -> usize {
        batch * self.num_tiles_x * self.num_tiles_y
    }

    /// Floats in a workspace holding `channels` channels for `batch` images
    pub fn workspace_floats(&self, batch: usize, channels: usize) -> usize {
        self.tile_area * channels * self.num_tiles(batch)
    }

    /// Floats in an NHWC tensor of this image size
    pub fn spatial_floats(&self, batch: usize, channels: usize) -> usize {
        batch * self.nn_y_len * self.nn_x_len * channels
    }
}

/// Shared argument checking for both stages
#[allow(clippy::too_many_arguments)]
fn checked_geometry(
    tune: &TuneParams,
    batch_size: usize,
    nn_x_len: usize,
    nn_y_len: usize,
    num_tiles_x: usize,
    num_tiles_y: usize,
    channels: usize,
) -> Result<WinogradGeometry> {
    require_positive(&[
        ("batch size", batch_size),
        ("nn_x_len", nn_x_len),
        ("nn_y_len", nn_y_len),
        ("channels", channels),
    ])?;
    tune.conv3x3.validate()?;
    let geom = WinogradGeometry::new(tune, nn_x_len, nn_y_len);
    if geom.num_tiles_x != num_tiles_x || geom.num_tiles_y != num_tiles_y {
        return Err(NnClError::Configuration(format!(
            "{}x{} tiles given for a {}x{} image, expected {}x{} with {}x{} output tiles",
            num_tiles_x,
            num_tiles_y,
            nn_x_len,
            nn_y_len,
            geom.num_tiles_x,
            geom.num_tiles_y,
            tune.conv3x3.out_tile_x_size,
            tune.conv3x3.out_tile_y_size
        )));
    }
    Ok(geom)
}

fn launch_range(
    local: [usize; 3],
    num_tiles_x: usize,
    num_tiles_y: usize,
    planes: usize,
) -> Result<NdRange> {
    if local.contains(&0) {
        return Err(NnClError::Configuration(format!(
            "work-group size {:?} has a zero dimension",
            local
        )));
    }
    Ok(NdRange {
        global: [
            round_up_to_multiple(num_tiles_x, local[0]),
            round_up_to_multiple(num_tiles_y, local[1]),
            round_up_to_multiple(planes, local[2]),
        ],
        local,
    })
}

/// Transform NHWC `input` into Winograd-domain tiles in `workspace`
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(
    batch = batch_size,
    nn_x_len = nn_x_len,
    nn_y_len = nn_y_len,
    channels = in_channels
))]
pub fn do_winograd_transform<'e, 'ctx: 'e, D: Driver>(
    kernel: &Kernel<'ctx, D>,
    launch: impl Into<Launch<'e, 'ctx, D>>,
    tune: &TuneParams,
    input: &DeviceBuffer<'ctx, D>,
    workspace: &DeviceBuffer<'ctx, D>,
    batch_size: usize,
    nn_x_len: usize,
    nn_y_len: usize,
    num_tiles_x: usize,
    num_tiles_y: usize,
    in_channels: usize,
) -> Result<Event<'ctx, D>> {
    let launch = launch.into();
    require_same_context(kernel, &launch, &[("input", input), ("workspace", workspace)])?;
    let geom = checked_geometry(
        tune,
        batch_size,
        nn_x_len,
        nn_y_len,
        num_tiles_x,
        num_tiles_y,
        in_channels,
    )?;
    require_capacity("input", input, geom.spatial_floats(batch_size, in_channels))?;
    require_capacity(
        "workspace",
        workspace,
        geom.workspace_floats(batch_size, in_channels),
    )?;
    require_writable("workspace", workspace)?;

    let range = launch_range(
        tune.conv3x3.trans_local_sizes(),
        num_tiles_x,
        num_tiles_y,
        batch_size * in_channels,
    )?;
    let args = [
        KernelArg::Buffer(input.raw()),
        KernelArg::Buffer(workspace.raw()),
        int_arg("batch size", batch_size)?,
        int_arg("nn_x_len", nn_x_len)?,
        int_arg("nn_y_len", nn_y_len)?,
        int_arg("num_tiles_x", num_tiles_x)?,
        int_arg("num_tiles_y", num_tiles_y)?,
        int_arg("in_channels", in_channels)?,
    ];
    debug_span!("enqueue", kernel = kernel.name(), %range)
        .in_scope(|| launch.queue().enqueue(kernel.raw(), &args, &range, launch.wait_for))
}

/// Transform Winograd-domain tiles in `workspace` back into NHWC `output`
#[allow(clippy::too_many_arguments)]
#[instrument(skip_all, fields(
    batch = batch_size,
    nn_x_len = nn_x_len,
    nn_y_len = nn_y_len,
    channels = out_channels
))]
pub fn do_winograd_untransform<'e, 'ctx: 'e, D: Driver>(
    kernel: &Kernel<'ctx, D>,
    launch: impl Into<Launch<'e, 'ctx, D>>,
    tune: &TuneParams,
    workspace: &DeviceBuffer<'ctx, D>,
    output: &DeviceBuffer<'ctx, D>,
    batch_size: usize,
    nn_x_len: usize,
    nn_y_len: usize,
    num_tiles_x: usize,
    num_tiles_y: usize,
    out_channels: usize,
) -> Result<Event<'ctx, D>> {
    let launch = launch.into();
    require_same_context(kernel, &launch, &[("workspace", workspace), ("output", output)])?;
    let geom = checked_geometry(
        tune,
        batch_size,
        nn_x_len,
        nn_y_len,
        num_tiles_x,
        num_tiles_y,
        out_channels,
    )?;
    require_capacity(
        "workspace",
        workspace,
        geom.workspace_floats(batch_size, out_channels),
    )?;
    require_capacity("output", output, geom.spatial_floats(batch_size, out_channels))?;
    require_writable("output", output)?;

    let range = launch_range(
        tune.conv3x3.untrans_local_sizes(),
        num_tiles_x,
        num_tiles_y,
        batch_size * out_channels,
    )?;
    let args = [
        KernelArg::Buffer(workspace.raw()),
        KernelArg::Buffer(output.raw()),
        int_arg("batch size", batch_size)?,
        int_arg("nn_x_len", nn_x_len)?,
        int_arg("nn_y_len", nn_y_len)?,
        int_arg("num_tiles_x", num_tiles_x)?,
        int_arg("num_tiles_y", num_tiles_y)?,
        int_arg("out_channels", out_channels)?,
    ];
    debug_span!("enqueue", kernel = kernel.name(), %range)
        .in_scope(|| launch.queue().enqueue(kernel.raw(), &args, &range, launch.wait_for))
}

/// Winograd-transform 3x3 filters `[oc][ic][3][3]` on the host
///
/// The result is laid out `[xi*T + nu][ic][oc]`, ready to upload as the A
/// operand of the GEMM stage.
#[instrument(skip(weights), fields(num_weights = weights.len()))]
pub fn transform_filter_3x3(
    weights: &[f32],
    in_channels: usize,
    out_channels: usize,
    conv: &Conv3x3Params,
) -> Result<Vec<f32>> {
    if conv.out_tile_x_size != conv.out_tile_y_size {
        return Err(NnClError::Configuration(format!(
            "filter transform needs square output tiles, got {}x{}",
            conv.out_tile_x_size, conv.out_tile_y_size
        )));
    }
    let mats = WinogradMatrices::for_out_tile(conv.out_tile_x_size).ok_or_else(|| {
        NnClError::Configuration(format!(
            "no Winograd transform for output tile size {}",
            conv.out_tile_x_size
        ))
    })?;
    let expected = out_channels * in_channels * CONV_SIZE * CONV_SIZE;
    if weights.len() != expected {
        return Err(NnClError::Configuration(format!(
            "expected {} weights for {}x{} 3x3 filters, got {}",
            expected,
            out_channels,
            in_channels,
            weights.len()
        )));
    }
    Ok(cpu_ref::winograd_filter_transform(
        &mats,
        weights,
        in_channels,
        out_channels,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffers::{
        blocking_read_buffer, create_read_only_buffer, create_read_write_buffer,
        create_read_write_buffer_sized,
    };
    use crate::device::host::HostDriver;
    use crate::device::DeviceContext;
    use crate::ops::{do_batched_xgemm_km_kn_mn, kernel_names};
    use crate::program::compile_program;
    use crate::tune::XGemmParams;

    const SOURCE: &str = "\
__kernel void transform() {}
__kernel void untransform() {}
__kernel void XgemmBatched() {}
";

    fn approx_eq(a: &[f32], b: &[f32], epsilon: f32) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < epsilon)
    }

    fn tune_for(out_tile: usize) -> TuneParams {
        TuneParams {
            xgemm: XGemmParams {
                mwg: 1,
                nwg: 1,
                kwg: 1,
                ..Default::default()
            },
            conv3x3: Conv3x3Params {
                trans_local_size0: 2,
                untrans_local_size1: 2,
                ..Conv3x3Params::with_out_tile(out_tile)
            },
            ..Default::default()
        }
    }

    fn options(tune: &TuneParams) -> String {
        format!(
            "{}{}",
            tune.xgemm.compile_options(),
            tune.conv3x3.compile_options()
        )
    }

    #[test]
    fn test_geometry() {
        let geom = WinogradGeometry::new(&tune_for(4), 19, 19);
        assert_eq!((geom.num_tiles_x, geom.num_tiles_y), (5, 5));
        assert_eq!(geom.tile_area, 36);
        assert_eq!(geom.num_tiles(2), 50);
        assert_eq!(geom.workspace_floats(2, 3), 36 * 3 * 50);

        let geom = WinogradGeometry::new(&tune_for(2), 8, 7);
        assert_eq!((geom.num_tiles_x, geom.num_tiles_y), (4, 4));
    }

    #[test]
    fn test_identity_filter_round_trip() {
        // A center-tap filter per channel reproduces the input exactly
        for out_tile in [2, 4] {
            let ctx = DeviceContext::new(HostDriver::default(), &[], false).unwrap();
            let queue = ctx.queue(0).unwrap();
            let tune = tune_for(out_tile);
            let program = compile_program("winograd", &ctx, SOURCE, &options(&tune)).unwrap();
            let transform = program.create_kernel(kernel_names::WINOGRAD_TRANSFORM).unwrap();
            let gemm = program.create_kernel(kernel_names::XGEMM_BATCHED).unwrap();
            let untransform = program
                .create_kernel(kernel_names::WINOGRAD_UNTRANSFORM)
                .unwrap();

            let (batch, nx, ny, c) = (1, 5, 3, 2);
            let geom = WinogradGeometry::new(&tune, nx, ny);
            let input_host: Vec<f32> = (0..geom.spatial_floats(batch, c))
                .map(|i| i as f32 * 0.25 - 1.0)
                .collect();
            let mut weights = vec![0.0; c * c * 9];
            for ch in 0..c {
                weights[(ch * c + ch) * 9 + 4] = 1.0;
            }
            let u = transform_filter_3x3(&weights, c, c, &tune.conv3x3).unwrap();

            let input = create_read_only_buffer(&ctx, &input_host).unwrap();
            let filters = create_read_only_buffer(&ctx, &u).unwrap();
            let ws_floats = geom.workspace_floats(batch, c);
            let ws = create_read_write_buffer_sized(&ctx, ws_floats).unwrap();
            let ws2 = create_read_write_buffer_sized(&ctx, ws_floats).unwrap();
            let output =
                create_read_write_buffer_sized(&ctx, geom.spatial_floats(batch, c)).unwrap();

            let (ntx, nty) = (geom.num_tiles_x, geom.num_tiles_y);
            do_winograd_transform(
                &transform, &queue, &tune, &input, &ws, batch, nx, ny, ntx, nty, c,
            )
            .unwrap();
            do_batched_xgemm_km_kn_mn(
                &gemm,
                &queue,
                &tune,
                c,
                geom.num_tiles(batch),
                c,
                &filters,
                &ws,
                &ws2,
                geom.tile_area,
            )
            .unwrap();
            do_winograd_untransform(
                &untransform, &queue, &tune, &ws2, &output, batch, nx, ny, ntx, nty, c,
            )
            .unwrap();

            let mut out = Vec::new();
            blocking_read_buffer(&queue, &output, input_host.len(), &mut out).unwrap();
            assert!(approx_eq(&out, &input_host, 1e-4), "tile {}: {:?}", out_tile, out);
        }
    }

    #[test]
    fn test_tile_count_mismatch_is_rejected() {
        let ctx = DeviceContext::new(HostDriver::default(), &[], false).unwrap();
        let queue = ctx.queue(0).unwrap();
        let tune = tune_for(2);
        let program = compile_program("winograd", &ctx, SOURCE, &options(&tune)).unwrap();
        let transform = program.create_kernel(kernel_names::WINOGRAD_TRANSFORM).unwrap();

        let input = create_read_only_buffer(&ctx, &[0.0; 25]).unwrap();
        let ws = create_read_write_buffer_sized(&ctx, 16 * 9).unwrap();
        // 5 columns need 3 tiles of width 2
        let err =
            do_winograd_transform(&transform, &queue, &tune, &input, &ws, 1, 5, 5, 2, 3, 1)
                .unwrap_err();
        assert!(matches!(err, NnClError::Configuration(_)), "{}", err);
        let ok = do_winograd_transform(&transform, &queue, &tune, &input, &ws, 1, 5, 5, 3, 3, 1);
        assert!(ok.is_ok());
    }

    #[test]
    fn test_read_only_output_is_rejected() {
        let ctx = DeviceContext::new(HostDriver::default(), &[], false).unwrap();
        let queue = ctx.queue(0).unwrap();
        let tune = tune_for(2);
        let program = compile_program("winograd", &ctx, SOURCE, &options(&tune)).unwrap();
        let untransform = program
            .create_kernel(kernel_names::WINOGRAD_UNTRANSFORM)
            .unwrap();

        let ws = create_read_write_buffer(&ctx, &[0.0; 16 * 4]).unwrap();
        let output = create_read_only_buffer(&ctx, &[0.0; 16]).unwrap();
        let err =
            do_winograd_untransform(&untransform, &queue, &tune, &ws, &output, 1, 4, 4, 2, 2, 1)
                .unwrap_err();
        assert!(err.to_string().contains("read-only"), "{}", err);
    }

    #[test]
    fn test_filter_transform_validates_input() {
        let conv = Conv3x3Params::with_out_tile(2);
        assert!(transform_filter_3x3(&[0.0; 17], 2, 1, &conv).is_err());
        assert_eq!(transform_filter_3x3(&[0.0; 18], 2, 1, &conv).unwrap().len(), 16 * 2);

        let odd = Conv3x3Params::with_out_tile(3);
        assert!(transform_filter_3x3(&[0.0; 9], 1, 1, &odd).is_err());
    }

    #[test]
    fn test_zero_output_tile_is_rejected() {
        let ctx = DeviceContext::new(HostDriver::default(), &[], false).unwrap();
        let queue = ctx.queue(0).unwrap();
        let tune = tune_for(2);
        let program = compile_program("winograd", &ctx, SOURCE, &options(&tune)).unwrap();
        let transform = program.create_kernel(kernel_names::WINOGRAD_TRANSFORM).unwrap();
        let untransform = program
            .create_kernel(kernel_names::WINOGRAD_UNTRANSFORM)
            .unwrap();
        let input = create_read_only_buffer(&ctx, &[0.0; 16]).unwrap();
        let ws = create_read_write_buffer_sized(&ctx, 16 * 4).unwrap();
        let output = create_read_write_buffer_sized(&ctx, 16).unwrap();

        for (x, y) in [(0, 2), (2, 0)] {
            let bad = TuneParams {
                conv3x3: Conv3x3Params {
                    out_tile_x_size: x,
                    out_tile_y_size: y,
                    ..tune.conv3x3
                },
                ..tune
            };
            let err =
                do_winograd_transform(&transform, &queue, &bad, &input, &ws, 1, 4, 4, 2, 2, 1)
                    .unwrap_err();
            assert!(matches!(err, NnClError::Configuration(_)), "{}", err);
            let err =
                do_winograd_untransform(&untransform, &queue, &bad, &ws, &output, 1, 4, 4, 2, 2, 1)
                    .unwrap_err();
            assert!(matches!(err, NnClError::Configuration(_)), "{}", err);
        }
    }

    #[test]
    fn test_buffer_from_other_context_is_rejected() {
        let tune = tune_for(2);
        let ctx = DeviceContext::new(HostDriver::default(), &[], false).unwrap();
        let other = DeviceContext::new(HostDriver::default(), &[], false).unwrap();
        let queue = ctx.queue(0).unwrap();
        let program = compile_program("winograd", &ctx, SOURCE, &options(&tune)).unwrap();
        let transform = program.create_kernel(kernel_names::WINOGRAD_TRANSFORM).unwrap();

        let input = create_read_only_buffer(&ctx, &[1.0; 16]).unwrap();
        let ws = create_read_write_buffer_sized(&ctx, 16 * 4).unwrap();
        let foreign_input = create_read_only_buffer(&other, &[1.0; 16]).unwrap();
        let foreign_ws = create_read_write_buffer_sized(&other, 16 * 4).unwrap();

        let err = do_winograd_transform(
            &transform, &queue, &tune, &foreign_input, &ws, 1, 4, 4, 2, 2, 1,
        )
        .unwrap_err();
        assert!(err.to_string().contains("input"), "{}", err);
        let err = do_winograd_transform(
            &transform, &queue, &tune, &input, &foreign_ws, 1, 4, 4, 2, 2, 1,
        )
        .unwrap_err();
        assert!(err.to_string().contains("workspace"), "{}", err);
        assert!(
            do_winograd_transform(&transform, &queue, &tune, &input, &ws, 1, 4, 4, 2, 2, 1)
                .is_ok()
        );
    }
}
