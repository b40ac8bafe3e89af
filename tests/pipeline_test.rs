//! End-to-end tests running the dispatch layer against the host reference device

use nn_opencl::device::host::{HostCall, HostDeviceSpec, HostDriver, HostPlatformSpec};
use nn_opencl::error::status;
use nn_opencl::ops::cpu_ref::conv3x3_direct;
use nn_opencl::ops::kernel_names;
use nn_opencl::{
    blocking_read_buffer, compile_program, create_read_only_buffer, create_read_write_buffer_sized,
    do_batched_xgemm_km_kn_mn, do_winograd_transform, do_winograd_untransform,
    transform_filter_3x3, Conv3x3Params, DeviceConfig, DeviceContext, Launch, NnClError,
    TuneParams, WinogradGeometry, XGemmParams,
};
use rand::Rng;

const SOURCE: &str = "\
__kernel void transform(__global const float* in, __global float* out) {}
__kernel void untransform(__global const float* in, __global float* out) {}
__kernel void XgemmBatched(const int M, const int N, const int K) {}
";

fn approx_eq(a: &[f32], b: &[f32], epsilon: f32) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < epsilon)
}

fn random_vec(len: usize) -> Vec<f32> {
    let mut rng = rand::thread_rng();
    (0..len).map(|_| rng.gen_range(-1.0..1.0)).collect()
}

fn two_device_driver() -> HostDriver {
    HostDriver::new(vec![
        HostPlatformSpec::new("Platform A", vec![HostDeviceSpec::new("Device A0", "Vendor A")]),
        HostPlatformSpec::new("Platform B", vec![HostDeviceSpec::new("Device B0", "Vendor B")]),
    ])
}

fn tune(out_tile: usize) -> TuneParams {
    TuneParams {
        xgemm: XGemmParams {
            mwg: 2,
            nwg: 1,
            kwg: 1,
            ..Default::default()
        },
        conv3x3: Conv3x3Params {
            trans_local_size0: 2,
            trans_local_size2: 4,
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

/// Run transform -> GEMM -> untransform on one queue and return the output
fn winograd_conv(
    ctx: &DeviceContext<HostDriver>,
    which: usize,
    tune: &TuneParams,
    input: &[f32],
    weights: &[f32],
    dims: (usize, usize, usize, usize, usize),
) -> nn_opencl::Result<Vec<f32>> {
    let (batch, nx, ny, ic, oc) = dims;
    let queue = ctx.queue(which)?;
    let program = compile_program("winograd", ctx, SOURCE, &options(tune))?;
    let transform = program.create_kernel(kernel_names::WINOGRAD_TRANSFORM)?;
    let gemm = program.create_kernel(kernel_names::XGEMM_BATCHED)?;
    let untransform = program.create_kernel(kernel_names::WINOGRAD_UNTRANSFORM)?;

    let geom = WinogradGeometry::new(tune, nx, ny);
    let filters = transform_filter_3x3(weights, ic, oc, &tune.conv3x3)?;
    let input_buf = create_read_only_buffer(ctx, input)?;
    let filter_buf = create_read_only_buffer(ctx, &filters)?;
    let ws = create_read_write_buffer_sized(ctx, geom.workspace_floats(batch, ic))?;
    let ws2 = create_read_write_buffer_sized(ctx, geom.workspace_floats(batch, oc))?;
    let output = create_read_write_buffer_sized(ctx, geom.spatial_floats(batch, oc))?;

    let (ntx, nty) = (geom.num_tiles_x, geom.num_tiles_y);
    do_winograd_transform(
        &transform, &queue, tune, &input_buf, &ws, batch, nx, ny, ntx, nty, ic,
    )?;
    do_batched_xgemm_km_kn_mn(
        &gemm,
        &queue,
        tune,
        oc,
        geom.num_tiles(batch),
        ic,
        &filter_buf,
        &ws,
        &ws2,
        geom.tile_area,
    )?;
    let done = do_winograd_untransform(
        &untransform, &queue, tune, &ws2, &output, batch, nx, ny, ntx, nty, oc,
    )?;
    done.wait()?;

    let mut out = Vec::new();
    blocking_read_buffer(&queue, &output, geom.spatial_floats(batch, oc), &mut out)?;
    Ok(out)
}

#[test]
fn test_winograd_convolution_matches_direct() {
    let ctx = DeviceContext::new(HostDriver::default(), &[], false).unwrap();
    for out_tile in [2, 4] {
        let tune = tune(out_tile);
        tune.validate().unwrap();
        let dims = (2, 9, 7, 3, 4);
        let (batch, nx, ny, ic, oc) = dims;
        let input = random_vec(batch * nx * ny * ic);
        let weights = random_vec(oc * ic * 9);

        let out = winograd_conv(&ctx, 0, &tune, &input, &weights, dims).unwrap();
        let expected = conv3x3_direct(&input, &weights, batch, nx, ny, ic, oc);
        assert!(approx_eq(&out, &expected, 1e-3), "tile {}", out_tile);
    }
}

#[test]
fn test_threads_share_context_with_own_queues() {
    let ctx =
        DeviceContext::from_config(two_device_driver(), &DeviceConfig::all_devices()).unwrap();
    assert_eq!(ctx.num_selected(), 2);
    let tune = tune(2);
    let dims = (1, 4, 4, 2, 2);
    let input = random_vec(32);
    let weights = random_vec(36);
    let expected = conv3x3_direct(&input, &weights, 1, 4, 4, 2, 2);

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..ctx.num_selected())
            .map(|which| {
                let (ctx, tune, input, weights) = (&ctx, &tune, &input, &weights);
                s.spawn(move || winograd_conv(ctx, which, tune, input, weights, dims))
            })
            .collect();
        for handle in handles {
            let out = handle.join().unwrap().unwrap();
            assert!(approx_eq(&out, &expected, 1e-3));
        }
    });
}

#[test]
fn test_events_order_work_across_queues() {
    let driver = two_device_driver();
    let log = driver.call_log();
    let ctx = DeviceContext::new(driver, &[1, 0], false).unwrap();
    let tune = tune(2);
    let program = compile_program("winograd", &ctx, SOURCE, &options(&tune)).unwrap();
    let transform = program.create_kernel(kernel_names::WINOGRAD_TRANSFORM).unwrap();
    let gemm = program.create_kernel(kernel_names::XGEMM_BATCHED).unwrap();

    let (q0, q1) = (ctx.queue(0).unwrap(), ctx.queue(1).unwrap());
    assert_eq!(q0.gpu_idx(), 1);
    assert_eq!(q1.gpu_idx(), 0);

    let geom = WinogradGeometry::new(&tune, 4, 4);
    let input = create_read_only_buffer(&ctx, &random_vec(16)).unwrap();
    let filters = create_read_only_buffer(&ctx, &random_vec(16 * 2)).unwrap();
    let ws = create_read_write_buffer_sized(&ctx, geom.workspace_floats(1, 1)).unwrap();
    let ws2 = create_read_write_buffer_sized(&ctx, geom.workspace_floats(1, 2)).unwrap();

    let transformed =
        do_winograd_transform(&transform, &q0, &tune, &input, &ws, 1, 4, 4, 2, 2, 1).unwrap();
    let multiplied = do_batched_xgemm_km_kn_mn(
        &gemm,
        Launch::on(&q1).after(&[&transformed]),
        &tune,
        2,
        geom.num_tiles(1),
        1,
        &filters,
        &ws,
        &ws2,
        geom.tile_area,
    )
    .unwrap();
    multiplied.wait().unwrap();
    q0.finish().unwrap();
    q1.finish().unwrap();

    let devices: Vec<_> = log
        .snapshot()
        .into_iter()
        .filter_map(|c| match c {
            HostCall::EnqueueKernel { kernel, device, .. } => Some((kernel, device)),
            _ => None,
        })
        .collect();
    let ids = ctx.device_ids_to_use();
    assert_eq!(
        devices,
        vec![
            ("transform".to_string(), ids[0]),
            ("XgemmBatched".to_string(), ids[1]),
        ]
    );
}

#[test]
fn test_profiling_follows_context_flag() {
    let tune = tune(2);
    for profiling in [true, false] {
        let config = DeviceConfig::with_devices(vec![0]).profiling(profiling);
        let ctx = DeviceContext::from_config(HostDriver::default(), &config).unwrap();
        let queue = ctx.queue(0).unwrap();
        let program = compile_program("winograd", &ctx, SOURCE, &options(&tune)).unwrap();
        let transform = program.create_kernel(kernel_names::WINOGRAD_TRANSFORM).unwrap();
        let input = create_read_only_buffer(&ctx, &[1.0; 4]).unwrap();
        let ws = create_read_write_buffer_sized(&ctx, 16).unwrap();

        let event =
            do_winograd_transform(&transform, &queue, &tune, &input, &ws, 1, 2, 2, 1, 1, 1)
                .unwrap();
        match event.profile_nanos() {
            Ok(_) => assert!(profiling),
            Err(e) => {
                assert!(!profiling);
                assert_eq!(e.status(), Some(status::CL_PROFILING_INFO_NOT_AVAILABLE));
            }
        }
    }
}

#[test]
fn test_kernel_from_other_context_is_rejected() {
    let tune = tune(2);
    let ctx_a = DeviceContext::new(HostDriver::default(), &[], false).unwrap();
    let ctx_b = DeviceContext::new(HostDriver::default(), &[], false).unwrap();
    let program = compile_program("winograd", &ctx_a, SOURCE, &options(&tune)).unwrap();
    let transform = program.create_kernel(kernel_names::WINOGRAD_TRANSFORM).unwrap();
    let input = create_read_only_buffer(&ctx_a, &[1.0; 4]).unwrap();
    let ws = create_read_write_buffer_sized(&ctx_a, 16).unwrap();

    let queue_b = ctx_b.queue(0).unwrap();
    let err = do_winograd_transform(&transform, &queue_b, &tune, &input, &ws, 1, 2, 2, 1, 1, 1)
        .unwrap_err();
    assert!(matches!(err, NnClError::Configuration(_)), "{}", err);
}
