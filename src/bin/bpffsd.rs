//! Daemon entry point: wires the kernel boundary, registry, dispatcher, and
//! both socket services together.

use std::fs;
use std::io;
use std::path::PathBuf;
use std::process::exit;
use std::sync::Arc;

use clap::Parser;

use bpffsd::fs::Dispatcher;
use bpffsd::handoff::HandoffServer;
use bpffsd::kernel::SimKernel;
use bpffsd::loader::Loader;
use bpffsd::registry::Registry;
use bpffsd::service::ControlServer;
use bpffsd::{DEFAULT_CONTROL_SOCKET, DEFAULT_HANDOFF_SOCKET};

/// Build-and-load service for kernel-resident trace programs.
#[derive(Parser, Debug)]
#[command(name = "bpffsd", version, about)]
struct Args {
    /// Control-plane socket path.
    #[arg(long, default_value = DEFAULT_CONTROL_SOCKET)]
    control: PathBuf,

    /// Handle-handoff socket path.
    #[arg(long, default_value = DEFAULT_HANDOFF_SOCKET)]
    handoff: PathBuf,
}

fn run(args: Args) -> io::Result<()> {
    for socket in [&args.control, &args.handoff] {
        if let Some(parent) = socket.parent() {
            fs::create_dir_all(parent)?;
        }
    }

    let registry = Arc::new(Registry::new());
    let loader = Loader::new(Arc::new(SimKernel::new()));
    let dispatcher = Arc::new(Dispatcher::new(registry.clone(), loader));

    let handoff = HandoffServer::bind(&args.handoff, registry)?;
    let control = ControlServer::bind(&args.control, dispatcher)?;

    handoff.spawn();
    control.run()
}

fn main() {
    env_logger::init();
    let args = Args::parse();
    if let Err(e) = run(args) {
        log::error!("fatal: {}", e);
        exit(1);
    }
}
