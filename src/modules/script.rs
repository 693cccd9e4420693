//! Lua scripting module.
//!
//! Loads one Lua file, then calls its global `tick(dt)` every tick interval
//! until stopped. Scripts see two tables:
//!
//! ```lua
//! log.debug("message")
//! log.error("message")
//!
//! -- kind: "head" | "body" | "projection"; mode: "set" | "multiply"
//! vr.update_matrix("body", "set", { 1,0,0,0, 0,1,0,0, 0,0,1,0, 0,0,0,1 })
//! local head = vr.matrix("head")   -- 16 numbers, column-major
//! ```
//!
//! A script error in `tick` is logged and stops the module.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use mlua::{Function, Lua};

use super::{Module, ModuleContext};
use crate::protocol::{Matrix, MatrixKind, UpdateMode};

/// Lua script module.
#[derive(Debug)]
pub struct Script {
    path: PathBuf,
    tick: Duration,
}

impl Script {
    /// Run `path`, calling `tick(dt)` every `tick`.
    pub fn new(path: PathBuf, tick: Duration) -> Self {
        Self { path, tick }
    }

    fn load(&self, ctx: &ModuleContext) -> Result<Lua> {
        let source = std::fs::read_to_string(&self.path)
            .with_context(|| format!("Failed to read script: {}", self.path.display()))?;
        let lua = Lua::new();
        register(&lua, ctx)?;
        lua.load(source.as_str())
            .set_name(self.path.display().to_string())
            .exec()
            .map_err(|e| anyhow!("Script failed to load: {e}"))?;
        Ok(lua)
    }
}

impl Module for Script {
    fn name(&self) -> &str {
        "script"
    }

    fn run(self: Box<Self>, ctx: ModuleContext) {
        let lua = match self.load(&ctx) {
            Ok(lua) => lua,
            Err(e) => {
                ctx.error(format!("{e:#}"));
                return;
            }
        };
        ctx.info(format!("loaded {}", self.path.display()));

        let tick: Option<Function> = match lua.globals().get("tick") {
            Ok(f) => f,
            Err(e) => {
                ctx.error(format!("global `tick` is not a function: {e}"));
                return;
            }
        };
        let Some(tick) = tick else {
            ctx.debug("no tick function; script ran once");
            return;
        };

        let mut last = Instant::now();
        while ctx.wait(self.tick) {
            let now = Instant::now();
            let dt = now.duration_since(last).as_secs_f64();
            last = now;
            if let Err(e) = tick.call::<()>(dt) {
                ctx.error(format!("tick failed, stopping: {e}"));
                return;
            }
        }
    }
}

/// Install the `log` and `vr` tables bound to `ctx`.
pub fn register(lua: &Lua, ctx: &ModuleContext) -> Result<()> {
    let log_table = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create log table: {e}"))?;

    let c = ctx.clone();
    let debug_fn = lua
        .create_function(move |_, msg: String| {
            c.debug(msg);
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create log.debug function: {e}"))?;
    log_table
        .set("debug", debug_fn)
        .map_err(|e| anyhow!("Failed to set log.debug: {e}"))?;

    let c = ctx.clone();
    let error_fn = lua
        .create_function(move |_, msg: String| {
            c.error(msg);
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create log.error function: {e}"))?;
    log_table
        .set("error", error_fn)
        .map_err(|e| anyhow!("Failed to set log.error: {e}"))?;

    let vr = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create vr table: {e}"))?;

    // vr.update_matrix(kind, mode, values)
    let c = ctx.clone();
    let update_fn = lua
        .create_function(move |_, (kind, mode, values): (String, String, Vec<f32>)| {
            let kind = parse_kind(&kind)?;
            let mode = UpdateMode::from_name(&mode)
                .ok_or_else(|| mlua::Error::RuntimeError(format!("unknown update mode {mode:?}")))?;
            let Ok(matrix) = Matrix::try_from(values.as_slice()) else {
                return Err(mlua::Error::RuntimeError(format!(
                    "expected 16 numbers, got {}",
                    values.len()
                )));
            };
            c.update_system_matrix_module(kind, mode, matrix);
            Ok(())
        })
        .map_err(|e| anyhow!("Failed to create vr.update_matrix function: {e}"))?;
    vr.set("update_matrix", update_fn)
        .map_err(|e| anyhow!("Failed to set vr.update_matrix: {e}"))?;

    // vr.matrix(kind) -> { 16 numbers }
    let c = ctx.clone();
    let matrix_fn = lua
        .create_function(move |_, kind: String| {
            let kind = parse_kind(&kind)?;
            Ok(c.system_matrix(kind).to_vec())
        })
        .map_err(|e| anyhow!("Failed to create vr.matrix function: {e}"))?;
    vr.set("matrix", matrix_fn)
        .map_err(|e| anyhow!("Failed to set vr.matrix: {e}"))?;

    lua.globals()
        .set("log", log_table)
        .map_err(|e| anyhow!("Failed to register log table globally: {e}"))?;
    lua.globals()
        .set("vr", vr)
        .map_err(|e| anyhow!("Failed to register vr table globally: {e}"))?;

    Ok(())
}

fn parse_kind(name: &str) -> mlua::Result<MatrixKind> {
    MatrixKind::from_name(name)
        .ok_or_else(|| mlua::Error::RuntimeError(format!("unknown matrix kind {name:?}")))
}
