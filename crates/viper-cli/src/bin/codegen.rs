//! `codegen` binary.
//!
//! ```bash
//! # Emit assembly
//! codegen arm64 input.il -S out.s
//!
//! # Build an executable via the host toolchain
//! codegen arm64 input.il -o out
//!
//! # Build and run, forwarding the child's exit code
//! codegen arm64 input.il --run-native
//! ```

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, ValueEnum};
use viper_cli::{run, DriverOptions};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Arch {
    Arm64,
}

#[derive(Parser)]
#[command(
    name = "codegen",
    about = "Viper IL to native code generator",
    version
)]
struct Cli {
    /// Target architecture.
    #[arg(value_enum)]
    arch: Arch,

    /// Input IL file.
    input: PathBuf,

    /// Write assembly to this file.
    #[arg(short = 'S', value_name = "output.s")]
    emit_asm: Option<PathBuf>,

    /// Assemble and link an executable.
    #[arg(short = 'o', value_name = "output")]
    output: Option<PathBuf>,

    /// Assemble, link, and execute; exit with the child's exit code.
    #[arg(long)]
    run_native: bool,

    /// Dump MIR after instruction selection, before register allocation.
    #[arg(long)]
    dump_mir_before_ra: bool,

    /// Dump MIR after register allocation.
    #[arg(long)]
    dump_mir_after_ra: bool,

    /// Dump MIR at both observation points.
    #[arg(long)]
    dump_mir_full: bool,

    /// Increase log verbosity (repeatable).
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let filter = match cli.verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_writer(std::io::stderr)
        .init();

    let options = DriverOptions {
        input: cli.input,
        emit_asm: cli.emit_asm,
        output: cli.output,
        run_native: cli.run_native,
        dump_mir_before_ra: cli.dump_mir_before_ra || cli.dump_mir_full,
        dump_mir_after_ra: cli.dump_mir_after_ra || cli.dump_mir_full,
    };

    match run(&options) {
        Ok(code) => ExitCode::from(code.clamp(0, 255) as u8),
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}
