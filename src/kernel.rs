//! Kernel boundary: program load, verification, probe attachment.
//!
//! Everything the service asks of the kernel goes through the [`KernelOps`]
//! trait, so the rest of the crate never touches raw syscalls directly. The
//! in-tree implementation is [`SimKernel`], which runs the same verifier
//! discipline a real kernel would (no back-edges, bounded size, known
//! helpers) and mints genuinely fd-backed handles from anonymous memory
//! files, so descriptor passing and fd-bound program lifetime behave exactly
//! as they do against the real thing.

use std::collections::{BTreeMap, HashSet};
use std::ffi::CString;
use std::fmt;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::sync::atomic::{AtomicU64, Ordering};

use nix::sys::memfd::{MemFdCreateFlag, memfd_create};
use nix::sys::stat::stat;
use nix::sys::uio::pread;
use nix::unistd::write as fd_write;
use parking_lot::Mutex;

use crate::compiler::{Insn, SUPPORTED_HELPERS};

/// Upper bound on program length, mirroring the classic verifier limit.
pub const PROG_MAX_INSNS: usize = 4096;

/// Maximum number of simultaneously loaded programs.
pub const MAX_PROGRAMS: usize = 64;

/// Magic prefix written into every handle's backing file.
const HANDLE_MAGIC: &[u8; 8] = b"bpffsd\0\0";

/// How a loaded program becomes active, mirroring the kernel's program
/// type enumeration. Parsed from the keyword written to a function's
/// `type` file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachType {
    /// Fires on entry to a named kernel function.
    Kprobe,
    /// Socket filter program.
    SocketFilter,
    /// Traffic classifier.
    SchedCls,
    /// Traffic action.
    SchedAct,
}

impl AttachType {
    /// Parse the keyword used on the control surface. Returns `None` for
    /// unsupported values, so callers can fail before the kernel is ever
    /// invoked.
    pub fn from_keyword(s: &str) -> Option<Self> {
        match s {
            "kprobe" => Some(Self::Kprobe),
            "filter" => Some(Self::SocketFilter),
            "sched_cls" => Some(Self::SchedCls),
            "sched_act" => Some(Self::SchedAct),
            _ => None,
        }
    }

    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Kprobe => "kprobe",
            Self::SocketFilter => "filter",
            Self::SchedCls => "sched_cls",
            Self::SchedAct => "sched_act",
        }
    }
}

/// Error types for kernel-boundary operations.
#[derive(Debug)]
pub enum KernelError {
    /// The verifier rejected the program; payload is the verifier log.
    Verifier(String),
    /// Too many programs loaded.
    ProgramLimit,
    /// The descriptor does not refer to a live program.
    BadHandle,
    /// Operation not valid for the program's type.
    WrongProgramType(AttachType),
    /// Program is already attached to a symbol.
    AlreadyAttached(String),
    /// Target symbol is not a valid kernel symbol name.
    UnknownSymbol(String),
    /// Underlying OS failure.
    Os(nix::Error),
}

impl fmt::Display for KernelError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Verifier(log) => write!(f, "verifier rejected program:\n{}", log),
            Self::ProgramLimit => write!(f, "program limit reached"),
            Self::BadHandle => write!(f, "descriptor is not a live program handle"),
            Self::WrongProgramType(t) => {
                write!(f, "operation not valid for {} program", t.keyword())
            }
            Self::AlreadyAttached(sym) => write!(f, "program already attached to '{}'", sym),
            Self::UnknownSymbol(sym) => write!(f, "unknown kernel symbol '{}'", sym),
            Self::Os(e) => write!(f, "os error: {}", e),
        }
    }
}

impl std::error::Error for KernelError {}

impl From<nix::Error> for KernelError {
    fn from(e: nix::Error) -> Self {
        Self::Os(e)
    }
}

// =============================================================================
// ProgHandle
// =============================================================================

/// A live, process-independent reference to a loaded program.
///
/// Move-only by construction: the descriptor is owned exactly once and
/// closed exactly once when the handle drops. Transfers across the handoff
/// channel duplicate the descriptor ([`ProgHandle::try_clone`]) and move the
/// duplicate wholesale; receivers re-capture ownership with
/// [`ProgHandle::from_received_fd`].
#[derive(Debug)]
pub struct ProgHandle {
    fd: OwnedFd,
    id: u64,
}

impl ProgHandle {
    /// Kernel-assigned program id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Duplicate the descriptor for an ownership-moving transfer.
    pub fn try_clone(&self) -> io::Result<ProgHandle> {
        Ok(ProgHandle {
            fd: self.fd.try_clone()?,
            id: self.id,
        })
    }

    /// Capture ownership of a descriptor received over the handoff channel.
    ///
    /// Validates that the descriptor is a program handle (magic header) and
    /// recovers the program id from it. This is the receipt-time boundary:
    /// from here on the descriptor has exactly one owner and closes itself
    /// exactly once.
    pub fn from_received_fd(fd: OwnedFd) -> Result<ProgHandle, KernelError> {
        let id = read_handle_id(fd.as_fd())?;
        Ok(ProgHandle { fd, id })
    }

    /// Give up the handle, yielding the raw descriptor ownership.
    pub fn into_fd(self) -> OwnedFd {
        self.fd
    }
}

impl AsFd for ProgHandle {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.fd.as_fd()
    }
}

impl AsRawFd for ProgHandle {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

fn read_handle_id(fd: BorrowedFd<'_>) -> Result<u64, KernelError> {
    let mut buf = [0u8; 16];
    let n = pread(fd, &mut buf, 0).map_err(KernelError::Os)?;
    if n != buf.len() || &buf[..8] != HANDLE_MAGIC {
        return Err(KernelError::BadHandle);
    }
    Ok(u64::from_le_bytes(buf[8..16].try_into().unwrap()))
}

// =============================================================================
// KernelOps
// =============================================================================

/// The foreign-call boundary to the kernel.
pub trait KernelOps: Send + Sync {
    /// Submit a verified program, obtaining a live handle.
    fn prog_load(&self, insns: &[Insn], prog_type: AttachType)
    -> Result<ProgHandle, KernelError>;

    /// Bind a loaded kprobe program to fire on entry to `symbol`.
    fn attach_kprobe(&self, prog: &ProgHandle, symbol: &str) -> Result<(), KernelError>;

    /// Unbind a program from its symbol. Idempotent: detaching an
    /// unattached program succeeds.
    fn detach(&self, prog: &ProgHandle) -> Result<(), KernelError>;
}

// =============================================================================
// Verifier
// =============================================================================

/// Check a lowered program the way the kernel verifier would.
///
/// # Returns
/// `Ok(())` if the program provably terminates, otherwise the full verifier
/// log (one line per processed instruction plus the violation).
pub fn verify(insns: &[Insn]) -> Result<(), String> {
    let mut log = Vec::with_capacity(insns.len() + 2);

    if insns.is_empty() {
        return Err("program is empty".to_string());
    }
    if insns.len() > PROG_MAX_INSNS {
        return Err(format!(
            "program too large: {} insns (max {})",
            insns.len(),
            PROG_MAX_INSNS
        ));
    }

    for (idx, insn) in insns.iter().enumerate() {
        match insn {
            Insn::MovImm(v) => log.push(format!("{}: (b7) r0 = {}", idx, v)),
            Insn::Call(name) => {
                log.push(format!("{}: (85) call {}", idx, name));
                if !SUPPORTED_HELPERS.contains(&name.as_str()) {
                    log.push(format!("unknown func {}", name));
                    return Err(log.join("\n"));
                }
            }
            Insn::Jump(target) => {
                log.push(format!("{}: (05) goto insn {}", idx, target));
                if *target <= idx {
                    log.push(format!("back-edge from insn {} to insn {}", idx, target));
                    return Err(log.join("\n"));
                }
                if *target >= insns.len() {
                    log.push(format!("jump out of range from insn {} to {}", idx, target));
                    return Err(log.join("\n"));
                }
            }
            Insn::Exit => log.push(format!("{}: (95) exit", idx)),
        }
    }

    if insns.last() != Some(&Insn::Exit) {
        log.push("fell off the end of the program".to_string());
        return Err(log.join("\n"));
    }
    Ok(())
}

// =============================================================================
// SimKernel
// =============================================================================

struct ProgRecord {
    prog_type: AttachType,
    insn_count: usize,
    attached: Option<String>,
    // (st_dev, st_ino) of the backing file, for liveness checks
    backing: (u64, u64),
}

/// In-process stand-in for the kernel side of the boundary.
///
/// Handles are backed by anonymous memory files carrying a magic header and
/// the program id, so a transferred duplicate still identifies its program
/// and the kernel object lives exactly as long as some descriptor does.
/// Program records are reclaimed once no open descriptor for the backing
/// file remains; SimKernel serves exactly one process, so /proc/self/fd is
/// the full set of places a duplicate could live.
pub struct SimKernel {
    programs: Mutex<BTreeMap<u64, ProgRecord>>,
    next_id: AtomicU64,
}

impl SimKernel {
    pub fn new() -> Self {
        Self {
            programs: Mutex::new(BTreeMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Number of loaded programs whose descriptors are still open.
    pub fn program_count(&self) -> usize {
        let mut programs = self.programs.lock();
        reclaim_released(&mut programs);
        programs.len()
    }

    /// Symbol a program is currently attached to, if any.
    pub fn attachment(&self, prog_id: u64) -> Option<String> {
        self.programs.lock().get(&prog_id)?.attached.clone()
    }

    /// Number of programs currently attached to a symbol.
    pub fn attachment_count(&self) -> usize {
        self.programs
            .lock()
            .values()
            .filter(|p| p.attached.is_some())
            .count()
    }

    fn mint_handle(&self, id: u64) -> Result<(ProgHandle, (u64, u64)), KernelError> {
        let name = CString::new(format!("bpf_prog_{}", id)).expect("no NUL in name");
        let fd = memfd_create(&name, MemFdCreateFlag::MFD_CLOEXEC)?;
        let mut header = [0u8; 16];
        header[..8].copy_from_slice(HANDLE_MAGIC);
        header[8..].copy_from_slice(&id.to_le_bytes());
        let n = fd_write(&fd, &header)?;
        if n != header.len() {
            return Err(KernelError::BadHandle);
        }
        let st = stat(format!("/proc/self/fd/{}", fd.as_raw_fd()).as_str())?;
        Ok((ProgHandle { fd, id }, (st.st_dev, st.st_ino)))
    }
}

/// Backing files of every descriptor currently open in this process.
fn open_backing_files() -> HashSet<(u64, u64)> {
    let mut open = HashSet::new();
    if let Ok(entries) = std::fs::read_dir("/proc/self/fd") {
        for entry in entries.flatten() {
            if let Ok(st) = stat(&entry.path()) {
                open.insert((st.st_dev, st.st_ino));
            }
        }
    }
    open
}

/// Unload programs with no remaining open descriptor, mirroring the
/// fd-bound lifetime of real kernel programs. Any attachment goes with the
/// record.
fn reclaim_released(programs: &mut BTreeMap<u64, ProgRecord>) {
    let open = open_backing_files();
    programs.retain(|id, record| {
        let alive = open.contains(&record.backing);
        if !alive {
            log::debug!("unloaded program {} (last descriptor closed)", id);
        }
        alive
    });
}

impl Default for SimKernel {
    fn default() -> Self {
        Self::new()
    }
}

fn is_symbol_name(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|c| c.is_ascii_alphanumeric() || c == b'_' || c == b'.')
}

impl KernelOps for SimKernel {
    fn prog_load(
        &self,
        insns: &[Insn],
        prog_type: AttachType,
    ) -> Result<ProgHandle, KernelError> {
        verify(insns).map_err(KernelError::Verifier)?;

        let mut programs = self.programs.lock();
        if programs.len() >= MAX_PROGRAMS {
            // released programs are reclaimed lazily, at the capacity check
            reclaim_released(&mut programs);
            if programs.len() >= MAX_PROGRAMS {
                return Err(KernelError::ProgramLimit);
            }
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (handle, backing) = self.mint_handle(id)?;
        programs.insert(
            id,
            ProgRecord {
                prog_type,
                insn_count: insns.len(),
                attached: None,
                backing,
            },
        );
        log::debug!(
            "loaded program {} ({} insns, type {})",
            id,
            insns.len(),
            prog_type.keyword()
        );
        Ok(handle)
    }

    fn attach_kprobe(&self, prog: &ProgHandle, symbol: &str) -> Result<(), KernelError> {
        if !is_symbol_name(symbol) {
            return Err(KernelError::UnknownSymbol(symbol.to_string()));
        }
        let mut programs = self.programs.lock();
        let record = programs.get_mut(&prog.id()).ok_or(KernelError::BadHandle)?;
        if record.prog_type != AttachType::Kprobe {
            return Err(KernelError::WrongProgramType(record.prog_type));
        }
        if let Some(existing) = &record.attached {
            return Err(KernelError::AlreadyAttached(existing.clone()));
        }
        record.attached = Some(symbol.to_string());
        log::debug!(
            "attached program {} ({} insns) to {}",
            prog.id(),
            record.insn_count,
            symbol
        );
        Ok(())
    }

    fn detach(&self, prog: &ProgHandle) -> Result<(), KernelError> {
        let mut programs = self.programs.lock();
        let record = programs.get_mut(&prog.id()).ok_or(KernelError::BadHandle)?;
        if let Some(symbol) = record.attached.take() {
            log::debug!("detached program {} from {}", prog.id(), symbol);
        }
        Ok(())
    }
}
