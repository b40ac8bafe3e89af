//! Host reference implementations of the kernel contracts
//!
//! These compute exactly what the compiled device kernels are expected to
//! compute, using the same buffer layouts. The host driver runs them, and the
//! tests use them as the ground truth.

/// Core GEMM operation using explicit strides
/// Computes: C = A @ B
///
/// # Arguments
/// * `a_data` - Flattened data of matrix A
/// * `m` - Number of rows in the result (and rows in A)
/// * `k` - Inner dimension (cols in A, rows in B)
/// * `a_row_stride` - Stride between consecutive rows of A
/// * `a_col_stride` - Stride between consecutive cols of A
/// * `b_data` - Flattened data of matrix B
/// * `n` - Number of cols in the result (and cols in B)
/// * `b_row_stride` - Stride between consecutive rows of B
/// * `b_col_stride` - Stride between consecutive cols of B
/// * `c_data` - Output buffer to overwrite (shape: [m, n])
pub(crate) struct GemmParams<'a> {
    pub a_data: &'a [f32],
    pub m: usize,
    pub k: usize,
    pub a_row_stride: usize,
    pub a_col_stride: usize,
    pub b_data: &'a [f32],
    pub n: usize,
    pub b_row_stride: usize,
    pub b_col_stride: usize,
    pub c_data: &'a mut [f32],
}

pub(crate) fn gemm_core(params: GemmParams) {
    let GemmParams {
        a_data,
        m,
        k,
        a_row_stride,
        a_col_stride,
        b_data,
        n,
        b_row_stride,
        b_col_stride,
        c_data,
    } = params;

    assert_eq!(c_data.len(), m * n, "Output buffer size mismatch");

    for i in 0..m {
        for j in 0..n {
            let mut sum = 0.0;
            for p in 0..k {
                let a_idx = i * a_row_stride + p * a_col_stride;
                let b_idx = p * b_row_stride + j * b_col_stride;
                sum += a_data[a_idx] * b_data[b_idx];
            }
            c_data[i * n + j] = sum;
        }
    }
}

/// Operand layout of a batched GEMM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum GemmLayout {
    /// A is [k][m], B is [k][n]
    KmKn,
    /// A is [m][k], B is [n][k]
    MkNk,
}

/// Shape and batch strides of a batched GEMM, in floats
#[derive(Debug, Clone, Copy)]
pub(crate) struct BatchShape {
    pub m: usize,
    pub n: usize,
    pub k: usize,
    pub batch: usize,
    pub a_stride: usize,
    pub b_stride: usize,
    pub c_stride: usize,
}

impl BatchShape {
    pub fn contiguous(m: usize, n: usize, k: usize, batch: usize) -> Self {
        Self {
            m,
            n,
            k,
            batch,
            a_stride: m * k,
            b_stride: n * k,
            c_stride: m * n,
        }
    }

    /// Floats of A, B and C touched by the whole batch
    pub fn extents(&self) -> (usize, usize, usize) {
        let extent = |stride: usize, size: usize| {
            if self.batch == 0 {
                0
            } else {
                (self.batch - 1) * stride + size
            }
        };
        (
            extent(self.a_stride, self.m * self.k),
            extent(self.b_stride, self.n * self.k),
            extent(self.c_stride, self.m * self.n),
        )
    }
}

/// `C_b[m][n] = sum_k op(A_b) op(B_b)` for every batch element `b`
pub(crate) fn batched_gemm(
    layout: GemmLayout,
    shape: BatchShape,
    a: &[f32],
    b: &[f32],
    c: &mut [f32],
) {
    let BatchShape { m, n, k, .. } = shape;
    let (a_row_stride, a_col_stride, b_row_stride, b_col_stride) = match layout {
        GemmLayout::KmKn => (1, m, n, 1),
        GemmLayout::MkNk => (k, 1, 1, k),
    };

    for batch in 0..shape.batch {
        let a_off = batch * shape.a_stride;
        let b_off = batch * shape.b_stride;
        let c_off = batch * shape.c_stride;
        gemm_core(GemmParams {
            a_data: &a[a_off..a_off + m * k],
            m,
            k,
            a_row_stride,
            a_col_stride,
            b_data: &b[b_off..b_off + n * k],
            n,
            b_row_stride,
            b_col_stride,
            c_data: &mut c[c_off..c_off + m * n],
        });
    }
}

/// Winograd F(m x m, 3 x 3) matrices for one output tile size
#[derive(Debug, Clone, Copy)]
pub struct WinogradMatrices {
    /// Output tile size `m`
    pub out_tile: usize,
    /// Input tile size `m + 2`
    pub in_tile: usize,
    bt: &'static [f32],
    at: &'static [f32],
    g: &'static [f32],
}

// F(2x2, 3x3)
const BT_2: [f32; 16] = [
    1.0, 0.0, -1.0, 0.0, //
    0.0, 1.0, 1.0, 0.0, //
    0.0, -1.0, 1.0, 0.0, //
    0.0, 1.0, 0.0, -1.0,
];
const AT_2: [f32; 8] = [
    1.0, 1.0, 1.0, 0.0, //
    0.0, 1.0, -1.0, -1.0,
];
const G_2: [f32; 12] = [
    1.0, 0.0, 0.0, //
    0.5, 0.5, 0.5, //
    0.5, -0.5, 0.5, //
    0.0, 0.0, 1.0,
];

// F(4x4, 3x3)
const BT_4: [f32; 36] = [
    4.0, 0.0, -5.0, 0.0, 1.0, 0.0, //
    0.0, -4.0, -4.0, 1.0, 1.0, 0.0, //
    0.0, 4.0, -4.0, -1.0, 1.0, 0.0, //
    0.0, -2.0, -1.0, 2.0, 1.0, 0.0, //
    0.0, 2.0, -1.0, -2.0, 1.0, 0.0, //
    0.0, 4.0, 0.0, -5.0, 0.0, 1.0,
];
const AT_4: [f32; 24] = [
    1.0, 1.0, 1.0, 1.0, 1.0, 0.0, //
    0.0, 1.0, -1.0, 2.0, -2.0, 0.0, //
    0.0, 1.0, 1.0, 4.0, 4.0, 0.0, //
    0.0, 1.0, -1.0, 8.0, -8.0, 1.0,
];
const G_4: [f32; 18] = [
    1.0 / 4.0, 0.0, 0.0, //
    -1.0 / 6.0, -1.0 / 6.0, -1.0 / 6.0, //
    -1.0 / 6.0, 1.0 / 6.0, -1.0 / 6.0, //
    1.0 / 24.0, 1.0 / 12.0, 1.0 / 6.0, //
    1.0 / 24.0, -1.0 / 12.0, 1.0 / 6.0, //
    0.0, 0.0, 1.0,
];

impl WinogradMatrices {
    /// Matrices for output tile size 2 or 4
    pub fn for_out_tile(out_tile: usize) -> Option<Self> {
        match out_tile {
            2 => Some(Self {
                out_tile: 2,
                in_tile: 4,
                bt: &BT_2,
                at: &AT_2,
                g: &G_2,
            }),
            4 => Some(Self {
                out_tile: 4,
                in_tile: 6,
                bt: &BT_4,
                at: &AT_4,
                g: &G_4,
            }),
            _ => None,
        }
    }

    fn bt(&self, row: usize, col: usize) -> f32 {
        self.bt[row * self.in_tile + col]
    }

    fn at(&self, row: usize, col: usize) -> f32 {
        self.at[row * self.in_tile + col]
    }

    fn g(&self, row: usize, col: usize) -> f32 {
        self.g[row * 3 + col]
    }

    /// `out = X d Y^T` where `x` is `rows_x` x `t` and `y` is `rows_y` x `t`
    fn sandwich(
        &self,
        d: &[f32],
        t: usize,
        rows_x: usize,
        x: impl Fn(usize, usize) -> f32,
        rows_y: usize,
        y: impl Fn(usize, usize) -> f32,
        out: &mut [f32],
    ) {
        for i in 0..rows_x {
            for j in 0..rows_y {
                let mut sum = 0.0;
                for a in 0..t {
                    let xa = x(i, a);
                    if xa == 0.0 {
                        continue;
                    }
                    for b in 0..t {
                        sum += xa * d[a * t + b] * y(j, b);
                    }
                }
                out[i * rows_y + j] = sum;
            }
        }
    }
}

/// Tile geometry shared by the transform and untransform kernels
#[derive(Debug, Clone, Copy)]
pub(crate) struct WinogradDims {
    pub batch: usize,
    pub nn_x_len: usize,
    pub nn_y_len: usize,
    pub num_tiles_x: usize,
    pub num_tiles_y: usize,
    pub channels: usize,
}

impl WinogradDims {
    pub fn num_tiles(&self) -> usize {
        self.batch * self.num_tiles_x * self.num_tiles_y
    }

    pub fn spatial_len(&self) -> usize {
        self.batch * self.nn_y_len * self.nn_x_len * self.channels
    }

    pub fn workspace_len(&self, mats: &WinogradMatrices) -> usize {
        mats.in_tile * mats.in_tile * self.channels * self.num_tiles()
    }
}

/// NHWC input -> workspace `[xi*T + nu][c][tile]`, zero padding outside the image
pub(crate) fn winograd_transform(
    mats: &WinogradMatrices,
    dims: WinogradDims,
    input: &[f32],
    workspace: &mut [f32],
) {
    let t = mats.in_tile;
    let m = mats.out_tile;
    let num_tiles = dims.num_tiles();
    let pad = 1isize;
    let mut d = vec![0.0f32; t * t];
    let mut v = vec![0.0f32; t * t];

    for n in 0..dims.batch {
        for ty in 0..dims.num_tiles_y {
            for tx in 0..dims.num_tiles_x {
                let tile = (n * dims.num_tiles_y + ty) * dims.num_tiles_x + tx;
                for c in 0..dims.channels {
                    for a in 0..t {
                        for b in 0..t {
                            let y = (ty * m + a) as isize - pad;
                            let x = (tx * m + b) as isize - pad;
                            let inside = y >= 0
                                && x >= 0
                                && (y as usize) < dims.nn_y_len
                                && (x as usize) < dims.nn_x_len;
                            d[a * t + b] = if inside {
                                let (y, x) = (y as usize, x as usize);
                                input[((n * dims.nn_y_len + y) * dims.nn_x_len + x) * dims.channels
                                    + c]
                            } else {
                                0.0
                            };
                        }
                    }
                    mats.sandwich(&d, t, t, |i, a| mats.bt(i, a), t, |j, b| mats.bt(j, b), &mut v);
                    for xi_nu in 0..t * t {
                        workspace[(xi_nu * dims.channels + c) * num_tiles + tile] = v[xi_nu];
                    }
                }
            }
        }
    }
}

/// Workspace `[xi*T + nu][c][tile]` -> NHWC output, clipped to the image
pub(crate) fn winograd_untransform(
    mats: &WinogradMatrices,
    dims: WinogradDims,
    workspace: &[f32],
    output: &mut [f32],
) {
    let t = mats.in_tile;
    let m = mats.out_tile;
    let num_tiles = dims.num_tiles();
    let mut acc = vec![0.0f32; t * t];
    let mut y_tile = vec![0.0f32; m * m];

    for n in 0..dims.batch {
        for ty in 0..dims.num_tiles_y {
            for tx in 0..dims.num_tiles_x {
                let tile = (n * dims.num_tiles_y + ty) * dims.num_tiles_x + tx;
                for c in 0..dims.channels {
                    for xi_nu in 0..t * t {
                        acc[xi_nu] = workspace[(xi_nu * dims.channels + c) * num_tiles + tile];
                    }
                    let at = |p: usize, i: usize| mats.at(p, i);
                    mats.sandwich(&acc, t, m, at, m, at, &mut y_tile);
                    for p in 0..m {
                        let y = ty * m + p;
                        if y >= dims.nn_y_len {
                            break;
                        }
                        for q in 0..m {
                            let x = tx * m + q;
                            if x >= dims.nn_x_len {
                                break;
                            }
                            let pixel = (n * dims.nn_y_len + y) * dims.nn_x_len + x;
                            output[pixel * dims.channels + c] = y_tile[p * m + q];
                        }
                    }
                }
            }
        }
    }
}

/// `G g G^T` for 3x3 filters `[oc][ic][3][3]` -> `[xi*T + nu][ic][oc]`
pub(crate) fn winograd_filter_transform(
    mats: &WinogradMatrices,
    weights: &[f32],
    in_channels: usize,
    out_channels: usize,
) -> Vec<f32> {
    let t = mats.in_tile;
    let mut out = vec![0.0f32; t * t * in_channels * out_channels];
    let mut u = vec![0.0f32; t * t];

    for oc in 0..out_channels {
        for ic in 0..in_channels {
            let g = &weights[(oc * in_channels + ic) * 9..(oc * in_channels + ic + 1) * 9];
            mats.sandwich(g, 3, t, |i, a| mats.g(i, a), t, |j, b| mats.g(j, b), &mut u);
            for xi_nu in 0..t * t {
                out[(xi_nu * in_channels + ic) * out_channels + oc] = u[xi_nu];
            }
        }
    }
    out
}

/// Direct 3x3 "same" convolution, NHWC in and out, weights `[oc][ic][3][3]`
pub fn conv3x3_direct(
    input: &[f32],
    weights: &[f32],
    batch: usize,
    nn_x_len: usize,
    nn_y_len: usize,
    in_channels: usize,
    out_channels: usize,
) -> Vec<f32> {
    let mut out = vec![0.0f32; batch * nn_y_len * nn_x_len * out_channels];
    for n in 0..batch {
        for y in 0..nn_y_len {
            for x in 0..nn_x_len {
                for oc in 0..out_channels {
                    let mut sum = 0.0;
                    for ic in 0..in_channels {
                        for dy in 0..3 {
                            for dx in 0..3 {
                                let sy = y as isize + dy as isize - 1;
                                let sx = x as isize + dx as isize - 1;
                                if sy < 0
                                    || sx < 0
                                    || sy as usize >= nn_y_len
                                    || sx as usize >= nn_x_len
                                {
                                    continue;
                                }
                                let iv = input[((n * nn_y_len + sy as usize) * nn_x_len
                                    + sx as usize)
                                    * in_channels
                                    + ic];
                                let wv = weights[((oc * in_channels + ic) * 3 + dy) * 3 + dx];
                                sum += iv * wv;
                            }
                        }
                    }
                    out[((n * nn_y_len + y) * nn_x_len + x) * out_channels + oc] = sum;
                }
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx_eq(a: &[f32], b: &[f32], epsilon: f32) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < epsilon)
    }

    #[test]
    fn test_gemm_km_kn() {
        // A stored [k][m] = [[1, 2], [3, 4], [5, 6]] (k=3, m=2), B stored [k][n] (n=1)
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = vec![1.0, 1.0, 1.0];
        let mut c = vec![0.0; 2];
        batched_gemm(
            GemmLayout::KmKn,
            BatchShape::contiguous(2, 1, 3, 1),
            &a,
            &b,
            &mut c,
        );
        assert_eq!(c, vec![9.0, 12.0]);
    }

    #[test]
    fn test_gemm_mk_nk() {
        // A stored [m][k] = [[1, 2, 3], [4, 5, 6]], B stored [n][k] = [[1, 0, 1], [0, 1, 0]]
        let a = vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = vec![1.0, 0.0, 1.0, 0.0, 1.0, 0.0];
        let mut c = vec![0.0; 4];
        batched_gemm(
            GemmLayout::MkNk,
            BatchShape::contiguous(2, 2, 3, 1),
            &a,
            &b,
            &mut c,
        );
        assert_eq!(c, vec![4.0, 2.0, 10.0, 5.0]);
    }

    #[test]
    fn test_gemm_overwrites_output() {
        let a = vec![2.0];
        let b = vec![3.0];
        let mut c = vec![100.0];
        batched_gemm(GemmLayout::KmKn, BatchShape::contiguous(1, 1, 1, 1), &a, &b, &mut c);
        assert_eq!(c, vec![6.0]);
    }

    #[test]
    fn test_batch_extents() {
        let shape = BatchShape {
            m: 2,
            n: 3,
            k: 4,
            batch: 3,
            a_stride: 8,
            b_stride: 0,
            c_stride: 10,
        };
        assert_eq!(shape.extents(), (24, 12, 26));
    }

    #[test]
    fn test_winograd_matches_direct_convolution() {
        for out_tile in [2, 4] {
            let mats = WinogradMatrices::for_out_tile(out_tile).unwrap();
            let (batch, nx, ny, ic, oc): (usize, usize, usize, usize, usize) = (2, 5, 3, 2, 3);
            let input: Vec<f32> = (0..batch * nx * ny * ic)
                .map(|i| ((i * 7) % 11) as f32 / 11.0 - 0.5)
                .collect();
            let weights: Vec<f32> = (0..oc * ic * 9)
                .map(|i| ((i * 5) % 13) as f32 / 13.0 - 0.5)
                .collect();

            let tx = nx.div_ceil(out_tile);
            let ty = ny.div_ceil(out_tile);
            let in_dims = WinogradDims {
                batch,
                nn_x_len: nx,
                nn_y_len: ny,
                num_tiles_x: tx,
                num_tiles_y: ty,
                channels: ic,
            };
            let out_dims = WinogradDims {
                channels: oc,
                ..in_dims
            };
            let mut ws = vec![0.0; in_dims.workspace_len(&mats)];
            winograd_transform(&mats, in_dims, &input, &mut ws);

            let tiles = in_dims.num_tiles();
            let area = mats.in_tile * mats.in_tile;
            let u = winograd_filter_transform(&mats, &weights, ic, oc);
            let mut ws2 = vec![0.0; out_dims.workspace_len(&mats)];
            batched_gemm(
                GemmLayout::KmKn,
                BatchShape::contiguous(oc, tiles, ic, area),
                &u,
                &ws,
                &mut ws2,
            );

            let mut out = vec![f32::NAN; out_dims.spatial_len()];
            winograd_untransform(&mats, out_dims, &ws2, &mut out);

            let expected = conv3x3_direct(&input, &weights, batch, nx, ny, ic, oc);
            assert!(
                approx_eq(&out, &expected, 1e-4),
                "tile {}: {:?} vs {:?}",
                out_tile,
                out,
                expected
            );
        }
    }

    #[test]
    fn test_unsupported_tile_size() {
        assert!(WinogradMatrices::for_out_tile(3).is_none());
    }
}
