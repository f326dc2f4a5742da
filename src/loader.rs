//! Loader: submits compiled artifacts to the kernel and manages activation.
//!
//! Sits between the build pipeline and the [`KernelOps`](crate::kernel::KernelOps)
//! boundary: resolves the requested entry point in an artifact, loads it with
//! the requested attach type, and issues activate/deactivate requests for
//! handles wherever they ended up (including handles a client received over
//! the handoff channel).

use std::fmt;
use std::sync::Arc;

use crate::compiler::Artifact;
use crate::kernel::{KernelError, KernelOps, ProgHandle};

pub use crate::kernel::AttachType;

/// Error types for load and activation operations.
#[derive(Debug)]
pub enum LoadError {
    /// The attach-type keyword is not in the supported enumeration.
    /// Rejected before the kernel is invoked.
    UnsupportedType(String),
    /// The artifact defines no entry point with this name.
    NoSuchFunction(String),
    /// The kernel refused the operation.
    Kernel(KernelError),
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnsupportedType(kw) => write!(f, "unsupported attach type '{}'", kw),
            Self::NoSuchFunction(name) => write!(f, "function '{}' not defined in source", name),
            Self::Kernel(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for LoadError {}

impl From<KernelError> for LoadError {
    fn from(e: KernelError) -> Self {
        Self::Kernel(e)
    }
}

/// Program loader over a shared kernel boundary.
#[derive(Clone)]
pub struct Loader {
    kernel: Arc<dyn KernelOps>,
}

impl Loader {
    pub fn new(kernel: Arc<dyn KernelOps>) -> Self {
        Self { kernel }
    }

    /// The kernel boundary this loader submits to.
    pub fn kernel(&self) -> Arc<dyn KernelOps> {
        self.kernel.clone()
    }

    /// Parse an attach-type keyword, failing fast on unsupported values.
    pub fn parse_attach_type(keyword: &str) -> Result<AttachType, LoadError> {
        AttachType::from_keyword(keyword)
            .ok_or_else(|| LoadError::UnsupportedType(keyword.to_string()))
    }

    /// Load one entry point of an artifact.
    ///
    /// # Returns
    /// A live handle that remains valid independent of the requesting
    /// process's lifetime until closed or detached.
    pub fn load(
        &self,
        artifact: &Artifact,
        function: &str,
        attach_type: AttachType,
    ) -> Result<ProgHandle, LoadError> {
        let insns = artifact
            .function(function)
            .ok_or_else(|| LoadError::NoSuchFunction(function.to_string()))?;
        let handle = self.kernel.prog_load(insns, attach_type)?;
        log::info!(
            "loaded '{}' as program {} ({})",
            function,
            handle.id(),
            attach_type.keyword()
        );
        Ok(handle)
    }

    /// Bind a loaded program to fire when the kernel reaches `symbol`.
    pub fn activate(&self, handle: &ProgHandle, symbol: &str) -> Result<(), LoadError> {
        self.kernel.attach_kprobe(handle, symbol)?;
        Ok(())
    }

    /// Reverse [`Loader::activate`]. Idempotent.
    pub fn deactivate(&self, handle: &ProgHandle) -> Result<(), LoadError> {
        self.kernel.detach(handle)?;
        Ok(())
    }
}
