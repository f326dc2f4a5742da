//! Client side of the handoff channel.
//!
//! Connects to the daemon's handoff socket, names a function, and receives
//! the program descriptor over SCM_RIGHTS. The received [`Program`] owns its
//! descriptor outright: the daemon may rebuild or forget the function
//! afterwards without invalidating it.

use std::fmt;
use std::io::{self, IoSliceMut, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::UnixStream;
use std::path::Path;

use nix::cmsg_space;
use nix::sys::socket::{ControlMessageOwned, MsgFlags, recvmsg};

use crate::handoff::{STATUS_BUILD_FAILED, STATUS_NOT_READY, STATUS_OK, STATUS_UNKNOWN_FUNCTION};
use crate::kernel::{KernelError, ProgHandle};
use crate::loader::{LoadError, Loader};

/// Error types for handoff requests.
#[derive(Debug)]
pub enum HandoffError {
    /// The daemon does not know the named object or function.
    UnknownFunction,
    /// The function's most recent build failed; read its error file for the
    /// diagnostic.
    BuildFailed,
    /// No build has been requested for the function.
    NotReady,
    /// The reply did not follow the wire protocol.
    Protocol(String),
    /// Transport failure.
    Io(io::Error),
}

impl fmt::Display for HandoffError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownFunction => write!(f, "no such function"),
            Self::BuildFailed => write!(f, "function failed to build"),
            Self::NotReady => write!(f, "function has not been built"),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for HandoffError {}

impl From<io::Error> for HandoffError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

// A transferred descriptor that fails receipt-time validation means the
// peer did not speak the handoff protocol.
impl From<KernelError> for HandoffError {
    fn from(e: KernelError) -> Self {
        Self::Protocol(format!("received descriptor rejected: {}", e))
    }
}

/// Receive the descriptor for `target` from the handoff socket at `path`.
///
/// Blocks while the function is mid-build; returns once the daemon has a
/// committed outcome to report.
pub fn recv_fd<P: AsRef<Path>>(path: P, target: &str) -> Result<OwnedFd, HandoffError> {
    let mut stream = UnixStream::connect(path)?;
    stream.write_all(&(target.len() as u32).to_le_bytes())?;
    stream.write_all(target.as_bytes())?;

    let mut status = [0u8; 1];
    let mut iov = [IoSliceMut::new(&mut status)];
    let mut cmsg_buf = cmsg_space!([RawFd; 1]);
    let msg = recvmsg::<()>(
        stream.as_raw_fd(),
        &mut iov,
        Some(&mut cmsg_buf),
        MsgFlags::empty(),
    )
    .map_err(io::Error::from)?;
    if msg.bytes != 1 {
        return Err(HandoffError::Protocol(format!(
            "expected 1 status byte, got {}",
            msg.bytes
        )));
    }

    // take ownership of every received descriptor before inspecting the
    // status, so nothing leaks on an unexpected reply
    let mut received: Vec<OwnedFd> = Vec::new();
    let cmsgs = msg
        .cmsgs()
        .map_err(|e| HandoffError::Protocol(format!("bad control message: {}", e)))?;
    for cmsg in cmsgs {
        if let ControlMessageOwned::ScmRights(fds) = cmsg {
            for fd in fds {
                // received via SCM_RIGHTS, so the fd is open and unowned
                received.push(unsafe { OwnedFd::from_raw_fd(fd) });
            }
        }
    }

    match status[0] {
        STATUS_OK => received
            .pop()
            .ok_or_else(|| HandoffError::Protocol("ok reply carried no descriptor".to_string())),
        STATUS_UNKNOWN_FUNCTION => Err(HandoffError::UnknownFunction),
        STATUS_BUILD_FAILED => Err(HandoffError::BuildFailed),
        STATUS_NOT_READY => Err(HandoffError::NotReady),
        other => Err(HandoffError::Protocol(format!("unknown status {}", other))),
    }
}

/// A program received over the handoff channel.
#[derive(Debug)]
pub struct Program {
    handle: ProgHandle,
}

impl Program {
    /// Request `target` from the handoff socket at `path`.
    pub fn receive<P: AsRef<Path>>(path: P, target: &str) -> Result<Self, HandoffError> {
        let fd = recv_fd(path, target)?;
        let handle = ProgHandle::from_received_fd(fd)?;
        Ok(Self { handle })
    }

    pub fn handle(&self) -> &ProgHandle {
        &self.handle
    }

    /// Bind the program to fire when the kernel reaches `symbol`.
    pub fn attach_kprobe(&self, loader: &Loader, symbol: &str) -> Result<(), LoadError> {
        loader.activate(&self.handle, symbol)
    }

    /// Detach and release the program. The kernel-side program unloads once
    /// the last open descriptor closes.
    pub fn close(self, loader: &Loader) -> Result<(), LoadError> {
        loader.deactivate(&self.handle)
    }
}
