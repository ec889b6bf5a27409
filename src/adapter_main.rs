//! cortex-adapter — per-run process that hosts one kernel.
//!
//! Speaks the adapter side of the wire protocol over the configured
//! transport. With `local://` (the default) the transport is the process's
//! own stdin/stdout, inherited from the spawning harness — which is why all
//! logging goes to stderr.

use clap::Parser;
use cortex_rt::adapter::{self, AdapterOptions};
use cortex_rt::transport::{self, Side};
use cortex_rt::Registry;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[clap(
    name = "cortex-adapter",
    version,
    about = "Kernel adapter for cortex-bench\n\nHosts one kernel per run and exchanges windows and results with the harness over the framed wire protocol.",
    long_about = None
)]
struct Cli {
    /// Transport URI: local://, tcp://:PORT, serial:///dev/...?baud=N, shm://NAME
    /// (defaults to $CORTEX_TRANSPORT, then local://)
    #[clap(long)]
    transport: Option<String>,

    /// Adapter identifier reported in HELLO
    #[clap(long, default_value = "posix")]
    name: String,

    /// Outer timeout for one full window transfer, in milliseconds
    #[clap(long, default_value = "10000")]
    window_timeout_ms: u64,
}

fn main() {
    // stdout belongs to the wire protocol under local://; logs go to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env().add_directive("info".parse().expect("valid directive")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let uri = cli
        .transport
        .or_else(|| std::env::var("CORTEX_TRANSPORT").ok())
        .unwrap_or_else(|| "local://".to_string());

    let transport = match transport::open(&uri, Side::Adapter) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("configuration error: {e:#}");
            std::process::exit(2);
        }
    };

    let registry = Registry::builtin();
    let opts = AdapterOptions {
        name: cli.name,
        window_timeout_ms: cli.window_timeout_ms,
        ..AdapterOptions::default()
    };
    match adapter::run(transport, &registry, &opts) {
        Ok(()) => {}
        Err(e) => {
            eprintln!("adapter error: {e:#}");
            std::process::exit(1);
        }
    }
}
