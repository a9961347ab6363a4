//! fxvisor worker executable.
//!
//! Speaks the framed protocol on stdin/stdout and logs to stderr.

use std::path::PathBuf;

use clap::Parser;
use env_logger::{Env, Target};

use fxvisor::engine::EnginePolicy;
use fxvisor::worker;

#[derive(Debug, Parser)]
#[command(name = "fxvisor-worker", version, about = "Isolated audio engine worker")]
struct Args {
    /// Engine selection: auto, native or fallback
    #[arg(long, env = "FXVISOR_ENGINE", default_value = "auto")]
    engine: EnginePolicy,

    /// Shared library implementing the native engine
    #[arg(long, env = "FXVISOR_NATIVE_LIBRARY")]
    native_library: Option<PathBuf>,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .target(Target::Stderr)
        .init();

    let args = Args::parse();
    log::info!(
        "fxvisor-worker {} starting (pid {}, engine policy {})",
        fxvisor::VERSION,
        std::process::id(),
        args.engine
    );

    let code = worker::run_stdio(args.engine, args.native_library.as_deref());
    std::process::exit(code);
}
