//! bpffsd — build-and-load service for kernel-resident trace programs.
//!
//! The service exposes a synthetic directory tree as its control surface:
//! clients write program source to `<object>/source`, trigger a synchronous
//! compile+load by writing an attach-type keyword to
//! `<object>/functions/<fn>/type`, and read diagnostics from
//! `<object>/functions/<fn>/error`. The resulting live kernel handle is
//! delivered to independent processes over a unix-socket handoff channel
//! using descriptor passing, named by `<object>/functions/<fn>/fd`.
//!
//! # Components
//!
//! - [`compiler`] - build pipeline: source text to a loadable [`compiler::Artifact`]
//! - [`kernel`] - typed kernel boundary: verifier, fd-backed program handles
//! - [`loader`] - attach-type enumeration, load/activate/deactivate
//! - [`registry`] - per-function compile/load state and build leases
//! - [`fs`] - path-keyed dispatcher mapping file operations onto the above
//! - [`service`] - control-plane socket server and client
//! - [`handoff`] - handle handoff channel (SCM_RIGHTS transfer)
//! - [`client`] - wraps a received handle as a usable program reference
//!
//! # Quick start
//!
//! ```ignore
//! use std::sync::Arc;
//! use bpffsd::{fs::Dispatcher, kernel::SimKernel, loader::Loader, registry::Registry};
//!
//! let registry = Arc::new(Registry::new());
//! let loader = Loader::new(Arc::new(SimKernel::new()));
//! let fs = Dispatcher::new(registry.clone(), loader);
//!
//! fs.mkdir("/foo")?;
//! fs.write("/foo/source", b"int hello(void *ctx) { return 0; }")?;
//! fs.write("/foo/functions/hello/type", b"kprobe")?;
//! # Ok::<(), axerrno::AxError>(())
//! ```

pub mod client;
pub mod compiler;
pub mod fs;
pub mod handoff;
pub mod kernel;
pub mod loader;
pub mod registry;
pub mod service;

// Re-export key types for convenience
pub use client::{HandoffError, Program};
pub use compiler::{Artifact, CompileError, Insn, compile};
pub use fs::Dispatcher;
pub use handoff::HandoffServer;
pub use kernel::{AttachType, KernelError, KernelOps, ProgHandle, SimKernel};
pub use loader::{LoadError, Loader};
pub use registry::Registry;
pub use service::{ControlClient, ControlError, ControlServer};

/// Default control-plane socket path.
pub const DEFAULT_CONTROL_SOCKET: &str = "/run/bpffsd/ctl.sock";

/// Default handle-handoff socket path.
pub const DEFAULT_HANDOFF_SOCKET: &str = "/run/bpffsd/handoff.sock";
