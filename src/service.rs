//! Control service: the dispatcher exposed over a unix domain socket.
//!
//! One stream connection carries a sequence of framed requests; each frame
//! names an operation, a control-surface path, and optional data:
//!
//! ```text
//! request:  op u8 | path_len u16 LE | path bytes | data_len u32 LE | data
//! reply:    status u8 | payload_len u32 LE | payload
//! ```
//!
//! Status 0 is success; any other value is an errno number describing the
//! failure. Replies to `readdir` carry newline-joined entry names, replies
//! to `lookup` a kind byte followed by the size as u64 LE.
//!
//! The server is thread-per-connection. A malformed frame poisons only its
//! own connection; the listener and other connections keep running.

use std::fmt;
use std::fs;
use std::io::{self, Read, Write};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread;

use axerrno::AxError;

use crate::fs::{Attr, Dispatcher, NodeKind};

const OP_MKDIR: u8 = 1;
const OP_REMOVE: u8 = 2;
const OP_WRITE: u8 = 3;
const OP_READ: u8 = 4;
const OP_READDIR: u8 = 5;
const OP_LOOKUP: u8 = 6;

const MAX_PATH_LEN: usize = 4096;
const MAX_DATA_LEN: usize = 1 << 20;

const KIND_DIR: u8 = 0;
const KIND_FILE: u8 = 1;
const KIND_SOCKET: u8 = 2;

// =============================================================================
// errno mapping
// =============================================================================

// Status bytes on the wire are Linux errno numbers. The mapping is pinned
// here so both halves of the protocol agree independent of any crate's
// internal numbering.
fn errno_of(e: AxError) -> u8 {
    match e {
        AxError::NotFound => 2,          // ENOENT
        AxError::Io => 5,                // EIO
        AxError::PermissionDenied => 13, // EACCES
        AxError::ResourceBusy => 16,     // EBUSY
        AxError::AlreadyExists => 17,    // EEXIST
        AxError::NotADirectory => 20,    // ENOTDIR
        AxError::IsADirectory => 21,     // EISDIR
        AxError::InvalidInput => 22,     // EINVAL
        AxError::Unsupported => 95,      // EOPNOTSUPP
        _ => 5,
    }
}

fn error_of(code: u8) -> AxError {
    match code {
        2 => AxError::NotFound,
        13 => AxError::PermissionDenied,
        16 => AxError::ResourceBusy,
        17 => AxError::AlreadyExists,
        20 => AxError::NotADirectory,
        21 => AxError::IsADirectory,
        22 => AxError::InvalidInput,
        95 => AxError::Unsupported,
        _ => AxError::Io,
    }
}

// =============================================================================
// ControlError
// =============================================================================

/// Client-side error for control operations.
#[derive(Debug)]
pub enum ControlError {
    /// The service refused the operation with an errno-style code.
    Errno(AxError),
    /// The reply did not follow the wire protocol.
    Protocol(String),
    /// Transport failure.
    Io(io::Error),
}

impl fmt::Display for ControlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Errno(e) => write!(f, "service error: {:?}", e),
            Self::Protocol(msg) => write!(f, "protocol error: {}", msg),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for ControlError {}

impl From<io::Error> for ControlError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

// =============================================================================
// ControlServer
// =============================================================================

/// Accept loop for the control socket.
pub struct ControlServer {
    listener: UnixListener,
    dispatcher: Arc<Dispatcher>,
    path: PathBuf,
}

impl ControlServer {
    /// Bind the control socket, replacing any stale socket file.
    pub fn bind<P: AsRef<Path>>(path: P, dispatcher: Arc<Dispatcher>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let _ = fs::remove_file(&path);
        let listener = UnixListener::bind(&path)?;
        log::info!("control service listening on {}", path.display());
        Ok(Self {
            listener,
            dispatcher,
            path,
        })
    }

    pub fn socket_path(&self) -> &Path {
        &self.path
    }

    /// Serve connections until the listener fails. Each connection gets its
    /// own thread so a blocking type-write stalls nobody else.
    pub fn run(&self) -> io::Result<()> {
        for stream in self.listener.incoming() {
            match stream {
                Ok(stream) => {
                    let dispatcher = self.dispatcher.clone();
                    thread::spawn(move || {
                        if let Err(e) = serve_connection(stream, &dispatcher) {
                            log::warn!("control connection closed: {}", e);
                        }
                    });
                }
                Err(e) => {
                    log::error!("accept failed: {}", e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

fn serve_connection(mut stream: UnixStream, dispatcher: &Dispatcher) -> io::Result<()> {
    loop {
        let mut op = [0u8; 1];
        match stream.read_exact(&mut op) {
            Ok(()) => {}
            // clean close between frames
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(()),
            Err(e) => return Err(e),
        }

        let path_len = read_u16(&mut stream)? as usize;
        if path_len > MAX_PATH_LEN {
            return Err(protocol_violation("path too long"));
        }
        let mut path = vec![0u8; path_len];
        stream.read_exact(&mut path)?;
        let path = String::from_utf8(path).map_err(|_| protocol_violation("path not utf-8"))?;

        let data_len = read_u32(&mut stream)? as usize;
        if data_len > MAX_DATA_LEN {
            return Err(protocol_violation("data too long"));
        }
        let mut data = vec![0u8; data_len];
        stream.read_exact(&mut data)?;

        let result = match op[0] {
            OP_MKDIR => dispatcher.mkdir(&path).map(|_| Vec::new()),
            OP_REMOVE => dispatcher.remove(&path).map(|_| Vec::new()),
            OP_WRITE => dispatcher.write(&path, &data).map(|_| Vec::new()),
            OP_READ => dispatcher.read(&path),
            OP_READDIR => dispatcher
                .readdir(&path)
                .map(|names| names.join("\n").into_bytes()),
            OP_LOOKUP => dispatcher.lookup(&path).map(encode_attr),
            other => return Err(protocol_violation(&format!("unknown op {}", other))),
        };

        match result {
            Ok(payload) => write_reply(&mut stream, 0, &payload)?,
            Err(e) => write_reply(&mut stream, errno_of(e), &[])?,
        }
    }
}

fn encode_attr(attr: Attr) -> Vec<u8> {
    let kind = match attr.kind {
        NodeKind::Dir => KIND_DIR,
        NodeKind::File => KIND_FILE,
        NodeKind::Socket => KIND_SOCKET,
    };
    let mut payload = vec![kind];
    payload.extend_from_slice(&attr.size.to_le_bytes());
    payload
}

fn write_reply(stream: &mut UnixStream, status: u8, payload: &[u8]) -> io::Result<()> {
    stream.write_all(&[status])?;
    stream.write_all(&(payload.len() as u32).to_le_bytes())?;
    stream.write_all(payload)
}

fn read_u16(stream: &mut UnixStream) -> io::Result<u16> {
    let mut buf = [0u8; 2];
    stream.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

fn read_u32(stream: &mut UnixStream) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn protocol_violation(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.to_string())
}

// =============================================================================
// ControlClient
// =============================================================================

/// Blocking client for the control socket.
pub struct ControlClient {
    stream: UnixStream,
}

impl ControlClient {
    pub fn connect<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        Ok(Self {
            stream: UnixStream::connect(path)?,
        })
    }

    pub fn mkdir(&mut self, path: &str) -> Result<(), ControlError> {
        self.request(OP_MKDIR, path, &[]).map(|_| ())
    }

    pub fn remove(&mut self, path: &str) -> Result<(), ControlError> {
        self.request(OP_REMOVE, path, &[]).map(|_| ())
    }

    pub fn write(&mut self, path: &str, data: &[u8]) -> Result<(), ControlError> {
        self.request(OP_WRITE, path, data).map(|_| ())
    }

    pub fn read(&mut self, path: &str) -> Result<Vec<u8>, ControlError> {
        self.request(OP_READ, path, &[])
    }

    pub fn readdir(&mut self, path: &str) -> Result<Vec<String>, ControlError> {
        let payload = self.request(OP_READDIR, path, &[])?;
        let text = String::from_utf8(payload)
            .map_err(|_| ControlError::Protocol("readdir payload not utf-8".to_string()))?;
        if text.is_empty() {
            return Ok(Vec::new());
        }
        Ok(text.split('\n').map(str::to_string).collect())
    }

    pub fn lookup(&mut self, path: &str) -> Result<Attr, ControlError> {
        let payload = self.request(OP_LOOKUP, path, &[])?;
        if payload.len() != 9 {
            return Err(ControlError::Protocol(format!(
                "lookup payload has {} bytes, expected 9",
                payload.len()
            )));
        }
        let kind = match payload[0] {
            KIND_DIR => NodeKind::Dir,
            KIND_FILE => NodeKind::File,
            KIND_SOCKET => NodeKind::Socket,
            other => {
                return Err(ControlError::Protocol(format!(
                    "unknown node kind {}",
                    other
                )));
            }
        };
        let mut size = [0u8; 8];
        size.copy_from_slice(&payload[1..]);
        Ok(Attr {
            kind,
            size: u64::from_le_bytes(size),
        })
    }

    fn request(&mut self, op: u8, path: &str, data: &[u8]) -> Result<Vec<u8>, ControlError> {
        if path.len() > MAX_PATH_LEN {
            return Err(ControlError::Protocol("path too long".to_string()));
        }
        if data.len() > MAX_DATA_LEN {
            return Err(ControlError::Protocol("data too long".to_string()));
        }
        self.stream.write_all(&[op])?;
        self.stream.write_all(&(path.len() as u16).to_le_bytes())?;
        self.stream.write_all(path.as_bytes())?;
        self.stream.write_all(&(data.len() as u32).to_le_bytes())?;
        self.stream.write_all(data)?;

        let mut status = [0u8; 1];
        self.stream.read_exact(&mut status)?;
        let mut len = [0u8; 4];
        self.stream.read_exact(&mut len)?;
        let len = u32::from_le_bytes(len) as usize;
        if len > MAX_DATA_LEN {
            return Err(ControlError::Protocol("oversized reply".to_string()));
        }
        let mut payload = vec![0u8; len];
        self.stream.read_exact(&mut payload)?;

        if status[0] == 0 {
            Ok(payload)
        } else {
            Err(ControlError::Errno(error_of(status[0])))
        }
    }
}
