//! Codegen CLI driver.
//!
//! Thin orchestrator around the backend pipeline: parse IL, compile, then
//! either write assembly (`-S`), assemble and link an executable (`-o`), or
//! run the produced binary and forward its exit code (`--run-native`).

use std::path::{Path, PathBuf};
use std::process::Command;

use eyre::{bail, eyre, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::debug;

use viper_backend::{compile_module, CodegenOptions, Target};
use viper_core::il::parse::parse_module;

/// One driver invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DriverOptions {
    pub input: PathBuf,
    /// Write assembly to this path.
    pub emit_asm: Option<PathBuf>,
    /// Assemble and link an executable at this path.
    pub output: Option<PathBuf>,
    /// Assemble, link, and execute; the child's exit code becomes ours.
    pub run_native: bool,
    pub dump_mir_before_ra: bool,
    pub dump_mir_after_ra: bool,
}

/// Run the driver; returns the process exit code.
pub fn run(options: &DriverOptions) -> Result<i32> {
    let source = std::fs::read_to_string(&options.input)
        .wrap_err_with(|| format!("reading {}", options.input.display()))?;
    let module = parse_module(&source).map_err(|e| eyre!("{}: {e}", options.input.display()))?;

    let codegen_options = CodegenOptions {
        target: Target::host(),
        dump_mir_before_ra: options.dump_mir_before_ra,
        dump_mir_after_ra: options.dump_mir_after_ra,
    };
    let mut diagnostics = String::new();
    let asm = compile_module(&module, &codegen_options, &mut diagnostics)?;
    if !diagnostics.is_empty() {
        eprint!("{diagnostics}");
    }

    if let Some(path) = &options.emit_asm {
        std::fs::write(path, &asm).wrap_err_with(|| format!("writing {}", path.display()))?;
        debug!(path = %path.display(), "wrote assembly");
    }

    if options.run_native {
        let dir = tempfile::tempdir().wrap_err("creating temporary build directory")?;
        let exe = dir.path().join("a.out");
        assemble_and_link(&asm, &exe)?;
        let status = Command::new(&exe)
            .status()
            .wrap_err_with(|| format!("running {}", exe.display()))?;
        return Ok(status.code().unwrap_or(1));
    }

    if let Some(output) = &options.output {
        assemble_and_link(&asm, output)?;
    }

    Ok(0)
}

/// Assemble and link through the host `cc`, located via `PATH`.
fn assemble_and_link(asm: &str, output: &Path) -> Result<()> {
    let dir = tempfile::tempdir().wrap_err("creating temporary build directory")?;
    let asm_path = dir.path().join("out.s");
    std::fs::write(&asm_path, asm)?;
    let status = Command::new("cc")
        .arg("-o")
        .arg(output)
        .arg(&asm_path)
        .status()
        .wrap_err("invoking the host toolchain (`cc`)")?;
    if !status.success() {
        bail!("toolchain failed with {status}");
    }
    debug!(output = %output.display(), "linked executable");
    Ok(())
}
