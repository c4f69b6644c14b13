//! AArch64 code generator for the Viper IL.
//!
//! Pipeline: instruction selection ([`lower`]) produces MIR with virtual
//! registers, the linear-scan allocator ([`regalloc`]) rewrites them to
//! physical registers, the peephole pass ([`peephole`]) cleans up, and the
//! frame planner ([`frame`]) fixes the stack layout before the emitter
//! ([`emit`]) serializes textual assembly.

pub mod emit;
pub mod frame;
pub mod liveness;
pub mod lower;
pub mod peephole;
pub mod regalloc;

use thiserror::Error;
use viper_core::il;
use viper_core::mir::pretty::dump_function;

/// Platforms the emitter can target. Symbol mangling and section directives
/// differ; everything else is shared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// `aarch64-apple-darwin`: leading underscore on exported symbols.
    MacOs,
    /// `aarch64-unknown-linux-gnu`.
    Linux,
}

impl Target {
    pub fn host() -> Target {
        if cfg!(target_os = "macos") {
            Target::MacOs
        } else {
            Target::Linux
        }
    }
}

/// Errors surfaced by the codegen pipeline. All are fatal to the current
/// compilation; no partial output is written.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("unsupported opcode {0}")]
    UnsupportedOpcode(String),
    #[error("unsupported type {ty} for {what}")]
    UnsupportedType { what: String, ty: il::Type },
    #[error("operand too large: {0}")]
    OperandTooLarge(i64),
    #[error("register allocation failed: {0}")]
    OutOfRegisters(String),
    #[error("invalid module: {0}")]
    InvalidModule(#[from] il::verify::VerifyError),
    #[error("internal invariant violated: {0}")]
    InternalInvariant(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, CodegenError>;

/// Options controlling a compilation run.
#[derive(Debug, Clone)]
pub struct CodegenOptions {
    pub target: Target,
    pub dump_mir_before_ra: bool,
    pub dump_mir_after_ra: bool,
}

impl Default for CodegenOptions {
    fn default() -> Self {
        Self {
            target: Target::host(),
            dump_mir_before_ra: false,
            dump_mir_after_ra: false,
        }
    }
}

/// Compile a verified IL module to textual assembly.
///
/// MIR dumps requested in `options` are appended to `diagnostics` (the CLI
/// routes that to stderr). Emission is deterministic: identical input and
/// target produce identical bytes.
pub fn compile_module(
    module: &il::Module,
    options: &CodegenOptions,
    diagnostics: &mut String,
) -> Result<String> {
    il::verify::check_module(module)?;

    let mut lowered = lower::lower_module(module)?;

    if options.dump_mir_before_ra {
        diagnostics.push_str("=== MIR before RA:\n");
        for mf in &lowered.functions {
            diagnostics.push_str(&dump_function(mf));
        }
    }

    for mf in &mut lowered.functions {
        regalloc::allocate(mf)?;
    }

    if options.dump_mir_after_ra {
        diagnostics.push_str("=== MIR after RA:\n");
        for mf in &lowered.functions {
            diagnostics.push_str(&dump_function(mf));
        }
    }

    for mf in &mut lowered.functions {
        peephole::run(mf);
        frame::plan(mf)?;
    }

    Ok(emit::emit_module(&lowered, options.target))
}
