//! Program compilation and kernel lookup

use std::fmt;

use tracing::{error, info, instrument};

use crate::check_err;
use crate::device::{DeviceContext, Driver};
use crate::error::{NnClError, Result};

/// A program built for every selected device of a context
pub struct Program<'ctx, D: Driver> {
    ctx: &'ctx DeviceContext<D>,
    name: String,
    raw: D::Program,
}

impl<D: Driver> fmt::Debug for Program<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Program").field("name", &self.name).finish()
    }
}

impl<'ctx, D: Driver> Program<'ctx, D> {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Look up the entry point `kernel_name`
    pub fn create_kernel(&self, kernel_name: &str) -> Result<Kernel<'ctx, D>> {
        let raw = check_err!(self.ctx.driver().create_kernel(&self.raw, kernel_name));
        Ok(Kernel {
            ctx: self.ctx,
            name: kernel_name.to_string(),
            raw,
        })
    }
}

/// A compiled kernel entry point
pub struct Kernel<'ctx, D: Driver> {
    ctx: &'ctx DeviceContext<D>,
    name: String,
    raw: D::Kernel,
}

impl<D: Driver> fmt::Debug for Kernel<'_, D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Kernel").field("name", &self.name).finish()
    }
}

impl<'ctx, D: Driver> Kernel<'ctx, D> {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn context(&self) -> &'ctx DeviceContext<D> {
        self.ctx
    }

    pub fn raw(&self) -> &D::Kernel {
        &self.raw
    }
}

/// Build `source` with `options` for the context's selected devices
///
/// A failed build returns [`NnClError::Compile`] carrying the device build log.
#[instrument(skip(ctx, source), fields(source_len = source.len()))]
pub fn compile_program<'ctx, D: Driver>(
    name: &str,
    ctx: &'ctx DeviceContext<D>,
    source: &str,
    options: &str,
) -> Result<Program<'ctx, D>> {
    let context = ctx.raw_context()?;
    match ctx
        .driver()
        .build_program(context, ctx.device_ids_to_use(), source, options)
    {
        Ok(raw) => {
            info!(program = name, "compiled program");
            Ok(Program {
                ctx,
                name: name.to_string(),
                raw,
            })
        }
        Err(failure) => {
            error!(program = name, status = failure.status, "program build failed");
            Err(NnClError::Compile {
                name: name.to_string(),
                log: failure.log,
            })
        }
    }
}
