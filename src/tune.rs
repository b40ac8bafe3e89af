//! Per-device tuning parameters
//!
//! These are produced by an external tuner and treated here as immutable
//! configuration. Each group renders the `-D` defines its kernels are compiled
//! with, so the dispatch geometry and the compiled kernel always agree.

use std::fmt::Write as _;

use crate::error::{NnClError, Result};

/// Tiling of the batched KM x KN -> MN GEMM kernels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XGemmParams {
    /// Tile size in M per work group
    pub mwg: usize,
    /// Tile size in N per work group
    pub nwg: usize,
    /// Tile size in K per loop iteration
    pub kwg: usize,
    /// Work-group size in M
    pub mdimc: usize,
    /// Work-group size in N
    pub ndimc: usize,
    pub mdima: usize,
    pub ndimb: usize,
    /// K loop unroll factor
    pub kwi: usize,
    /// Vector width in M
    pub vwm: usize,
    /// Vector width in N
    pub vwn: usize,
    pub strm: usize,
    pub strn: usize,
    /// Cache A tiles in local memory
    pub sa: usize,
    /// Cache B tiles in local memory
    pub sb: usize,
}

impl Default for XGemmParams {
    fn default() -> Self {
        Self {
            mwg: 8,
            nwg: 8,
            kwg: 8,
            mdimc: 1,
            ndimc: 1,
            mdima: 1,
            ndimb: 1,
            kwi: 1,
            vwm: 1,
            vwn: 1,
            strm: 0,
            strn: 0,
            sa: 0,
            sb: 0,
        }
    }
}

impl XGemmParams {
    fn fields(&self) -> [(&'static str, usize); 14] {
        [
            ("MWG", self.mwg),
            ("NWG", self.nwg),
            ("KWG", self.kwg),
            ("MDIMC", self.mdimc),
            ("NDIMC", self.ndimc),
            ("MDIMA", self.mdima),
            ("NDIMB", self.ndimb),
            ("KWI", self.kwi),
            ("VWM", self.vwm),
            ("VWN", self.vwn),
            ("STRM", self.strm),
            ("STRN", self.strn),
            ("SA", self.sa),
            ("SB", self.sb),
        ]
    }

    pub fn desc(&self) -> String {
        describe(&self.fields())
    }

    pub fn compile_options(&self) -> String {
        defines(&self.fields())
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            self.mwg, self.nwg, self.kwg, self.mdimc, self.ndimc, self.mdima, self.ndimb, self.kwi,
            self.vwm, self.vwn,
        ];
        if positive.contains(&0) {
            return Err(invalid("xgemm", self.desc(), "tile sizes must be positive"));
        }
        let threads = self.mdimc * self.ndimc;
        let ok = self.mwg % (self.mdimc * self.vwm) == 0
            && self.nwg % (self.ndimc * self.vwn) == 0
            && self.mwg % (self.mdima * self.vwm) == 0
            && self.nwg % (self.ndimb * self.vwn) == 0
            && self.kwg % self.kwi == 0
            && threads % self.mdima == 0
            && threads % self.ndimb == 0
            && self.kwg % (threads / self.mdima) == 0
            && self.kwg % (threads / self.ndimb) == 0;
        if !ok {
            return Err(invalid("xgemm", self.desc(), "tiles do not divide evenly"));
        }
        Ok(())
    }
}

/// Tiling of the direct MK x NK -> MN GEMM kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XGemmDirectParams {
    /// Tile size in M and N per work group
    pub wgd: usize,
    pub mdimcd: usize,
    pub ndimcd: usize,
    pub mdimad: usize,
    pub ndimbd: usize,
    pub kwid: usize,
    pub vwmd: usize,
    pub vwnd: usize,
    pub pada: usize,
    pub padb: usize,
}

impl Default for XGemmDirectParams {
    fn default() -> Self {
        Self {
            wgd: 8,
            mdimcd: 1,
            ndimcd: 1,
            mdimad: 1,
            ndimbd: 1,
            kwid: 1,
            vwmd: 1,
            vwnd: 1,
            pada: 1,
            padb: 1,
        }
    }
}

impl XGemmDirectParams {
    fn fields(&self) -> [(&'static str, usize); 10] {
        [
            ("WGD", self.wgd),
            ("MDIMCD", self.mdimcd),
            ("NDIMCD", self.ndimcd),
            ("MDIMAD", self.mdimad),
            ("NDIMBD", self.ndimbd),
            ("KWID", self.kwid),
            ("VWMD", self.vwmd),
            ("VWND", self.vwnd),
            ("PADA", self.pada),
            ("PADB", self.padb),
        ]
    }

    pub fn desc(&self) -> String {
        describe(&self.fields())
    }

    pub fn compile_options(&self) -> String {
        defines(&self.fields())
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            self.wgd, self.mdimcd, self.ndimcd, self.mdimad, self.ndimbd, self.kwid, self.vwmd,
            self.vwnd,
        ];
        if positive.contains(&0) {
            return Err(invalid("xgemm direct", self.desc(), "tile sizes must be positive"));
        }
        let threads = self.mdimcd * self.ndimcd;
        let ok = self.wgd % (self.mdimcd * self.vwmd) == 0
            && self.wgd % (self.ndimcd * self.vwnd) == 0
            && self.wgd % (self.mdimad * self.vwmd) == 0
            && self.wgd % (self.ndimbd * self.vwnd) == 0
            && self.wgd % self.kwid == 0
            && threads % self.mdimad == 0
            && threads % self.ndimbd == 0
            && self.wgd % (threads / self.mdimad) == 0
            && self.wgd % (threads / self.ndimbd) == 0;
        if !ok {
            return Err(invalid("xgemm direct", self.desc(), "tiles do not divide evenly"));
        }
        Ok(())
    }
}

/// Winograd 3x3 convolution tile geometry and launch sizes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv3x3Params {
    pub in_tile_x_size: usize,
    pub in_tile_y_size: usize,
    pub out_tile_x_size: usize,
    pub out_tile_y_size: usize,
    pub trans_local_size0: usize,
    pub trans_local_size1: usize,
    pub trans_local_size2: usize,
    pub untrans_local_size0: usize,
    pub untrans_local_size1: usize,
    pub untrans_local_size2: usize,
}

/// Spatial extent of the convolution filter the Winograd tiles are built for
pub const CONV_SIZE: usize = 3;

impl Default for Conv3x3Params {
    fn default() -> Self {
        Self {
            in_tile_x_size: 4,
            in_tile_y_size: 4,
            out_tile_x_size: 2,
            out_tile_y_size: 2,
            trans_local_size0: 1,
            trans_local_size1: 1,
            trans_local_size2: 1,
            untrans_local_size0: 1,
            untrans_local_size1: 1,
            untrans_local_size2: 1,
        }
    }
}

impl Conv3x3Params {
    /// Square F(out x out, 3 x 3) tiling with unit local sizes
    pub fn with_out_tile(out_tile: usize) -> Self {
        Self {
            in_tile_x_size: out_tile + CONV_SIZE - 1,
            in_tile_y_size: out_tile + CONV_SIZE - 1,
            out_tile_x_size: out_tile,
            out_tile_y_size: out_tile,
            ..Default::default()
        }
    }

    fn fields(&self) -> [(&'static str, usize); 6] {
        [
            ("INTILE_XSIZE", self.in_tile_x_size),
            ("INTILE_YSIZE", self.in_tile_y_size),
            ("OUTTILE_XSIZE", self.out_tile_x_size),
            ("OUTTILE_YSIZE", self.out_tile_y_size),
            ("CONV_XSIZE", CONV_SIZE),
            ("CONV_YSIZE", CONV_SIZE),
        ]
    }

    pub fn desc(&self) -> String {
        format!(
            "{} transLocalSize={}x{}x{} untransLocalSize={}x{}x{}",
            describe(&self.fields()),
            self.trans_local_size0,
            self.trans_local_size1,
            self.trans_local_size2,
            self.untrans_local_size0,
            self.untrans_local_size1,
            self.untrans_local_size2
        )
    }

    pub fn compile_options(&self) -> String {
        defines(&self.fields())
    }

    /// Number of Winograd-domain positions per tile (the GEMM batch count)
    pub fn tile_area(&self) -> usize {
        self.in_tile_x_size * self.in_tile_y_size
    }

    pub fn trans_local_sizes(&self) -> [usize; 3] {
        [
            self.trans_local_size0,
            self.trans_local_size1,
            self.trans_local_size2,
        ]
    }

    pub fn untrans_local_sizes(&self) -> [usize; 3] {
        [
            self.untrans_local_size0,
            self.untrans_local_size1,
            self.untrans_local_size2,
        ]
    }

    pub fn validate(&self) -> Result<()> {
        if self.out_tile_x_size == 0 || self.out_tile_y_size == 0 {
            return Err(invalid("conv3x3", self.desc(), "output tiles must be positive"));
        }
        if self.in_tile_x_size != self.out_tile_x_size + CONV_SIZE - 1
            || self.in_tile_y_size != self.out_tile_y_size + CONV_SIZE - 1
        {
            return Err(invalid(
                "conv3x3",
                self.desc(),
                "input tile must be output tile + 2",
            ));
        }
        if self.trans_local_sizes().contains(&0) || self.untrans_local_sizes().contains(&0) {
            return Err(invalid("conv3x3", self.desc(), "local sizes must be positive"));
        }
        Ok(())
    }
}

/// Complete tuning for one device
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TuneParams {
    pub xgemm: XGemmParams,
    pub xgemm_direct: XGemmDirectParams,
    pub conv3x3: Conv3x3Params,
}

impl TuneParams {
    pub fn validate(&self) -> Result<()> {
        self.xgemm.validate()?;
        self.xgemm_direct.validate()?;
        self.conv3x3.validate()
    }
}

fn describe(fields: &[(&'static str, usize)]) -> String {
    fields
        .iter()
        .map(|(name, value)| format!("{}={}", name, value))
        .collect::<Vec<_>>()
        .join(" ")
}

fn defines(fields: &[(&'static str, usize)]) -> String {
    let mut out = String::new();
    for (name, value) in fields {
        // Writing into a String cannot fail
        let _ = write!(out, " -D{}={}", name, value);
    }
    out
}

fn invalid(group: &str, desc: String, reason: &str) -> NnClError {
    NnClError::Configuration(format!("invalid {} tuning ({}): {}", group, desc, reason))
}
