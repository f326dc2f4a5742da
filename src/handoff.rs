//! Handoff channel: delivers program descriptors to client processes.
//!
//! A client connects, sends the path of a function (`<object>/<function>`),
//! and receives a one-byte status. On success the status byte rides with an
//! SCM_RIGHTS control message carrying a duplicated program descriptor, so
//! the client owns the program independent of this daemon's registry.
//!
//! A request for a function that is mid-build blocks until the build
//! resolves. There is no polling and no success reply for an unfinished
//! build; the reply always reflects a committed outcome.

use std::fs;
use std::io::{self, IoSlice, Read, Write};
use std::os::fd::AsRawFd;
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use nix::sys::socket::{ControlMessage, MsgFlags, sendmsg};

use crate::registry::{Registry, Resolution};

/// Request accepted; an SCM_RIGHTS descriptor accompanies this byte.
pub const STATUS_OK: u8 = 0;
/// The named object or function does not exist.
pub const STATUS_UNKNOWN_FUNCTION: u8 = 1;
/// The most recent build of the function failed.
pub const STATUS_BUILD_FAILED: u8 = 2;
/// The function exists but no build has been requested.
pub const STATUS_NOT_READY: u8 = 3;

const MAX_TARGET_LEN: usize = 4096;

/// Accept loop for the handoff socket.
pub struct HandoffServer {
    listener: UnixListener,
    registry: Arc<Registry>,
    path: PathBuf,
}

impl HandoffServer {
    /// Bind the handoff socket, replacing any stale socket file.
    pub fn bind<P: AsRef<Path>>(path: P, registry: Arc<Registry>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let _ = fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        log::info!("handoff service listening on {}", path.display());
        Ok(Self {
            listener,
            registry,
            path,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Run the accept loop on a background thread.
    pub fn spawn(self) -> thread::JoinHandle<io::Result<()>> {
        thread::spawn(move || self.run())
    }

    /// Serve connections until the listener fails. One thread per
    /// connection; a request blocked on an in-flight build parks only its
    /// own thread.
    pub fn run(&self) -> io::Result<()> {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let registry = self.registry.clone();
                    thread::spawn(move || {
                        if let Err(e) = serve_connection(stream, &registry) {
                            log::warn!("handoff connection closed: {}", e);
                        }
                    });
                }
                Err(e) => {
                    log::error!("handoff accept failed: {}", e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

fn serve_connection(mut stream: UnixStream, registry: &Registry) -> io::Result<()> {
    let mut len = [0u8; 4];
    match stream.read_exact(&mut len) {
        Ok(()) => {}
        // client connected and went away without asking for anything
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len) as usize;
    if len > MAX_TARGET_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "handoff target too long",
        ));
    }
    let mut target = vec![0u8; len];
    stream.read_exact(&mut target)?;
    let target = String::from_utf8(target)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "handoff target not utf-8"))?;

    let Some((object, function)) = parse_target(&target) else {
        log::debug!("handoff: malformed target '{}'", target);
        return stream.write_all(&[STATUS_UNKNOWN_FUNCTION]);
    };

    let Some(record) = registry.function(object, function) else {
        log::debug!("handoff: no such function '{}/{}'", object, function);
        return stream.write_all(&[STATUS_UNKNOWN_FUNCTION]);
    };

    // blocks while a build is in flight
    match record.wait_resolved()? {
        Resolution::Loaded(handle) => {
            log::info!("handoff: sending program {} for {}", handle.id(), record.path());
            let status = [STATUS_OK];
            let iov = [IoSlice::new(&status)];
            let fds = [handle.as_raw_fd()];
            let cmsg = [ControlMessage::ScmRights(&fds)];
            // MSG_NOSIGNAL: a client that disconnected while blocked must
            // surface as EPIPE here, not a signal
            sendmsg::<()>(
                stream.as_raw_fd(),
                &iov,
                &cmsg,
                MsgFlags::MSG_NOSIGNAL,
                None,
            )
            .map_err(io::Error::from)?;
            // the duplicate drops here; the client's copy is theirs
            Ok(())
        }
        Resolution::Failed(_) => stream.write_all(&[STATUS_BUILD_FAILED]),
        Resolution::NotBuilt => stream.write_all(&[STATUS_NOT_READY]),
    }
}

/// Extract `(object, function)` from a handoff target. Accepts the short
/// `<object>/<function>` form and the full control-surface paths
/// `<object>/functions/<function>` and `<object>/functions/<function>/fd`,
/// with or without a leading slash.
fn parse_target(target: &str) -> Option<(&str, &str)> {
    let segs: Vec<&str> = target.trim_matches('/').split('/').collect();
    let (object, function) = match segs.as_slice() {
        &[object, function] => (object, function),
        &[object, "functions", function] => (object, function),
        &[object, "functions", function, "fd"] => (object, function),
        _ => return None,
    };
    if object.is_empty() || function.is_empty() || function == "functions" {
        return None;
    }
    Some((object, function))
}
