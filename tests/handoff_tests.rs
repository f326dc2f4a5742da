//! Integration tests for the handoff channel.
//!
//! Exercises descriptor passing end to end: build a program through the
//! dispatcher, receive its descriptor in "another process" (another thread
//! with its own socket connection), and drive it from there.

use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::MetadataExt;
use std::os::unix::net::UnixStream;
use std::sync::Arc;
use std::thread;

use tempfile::TempDir;

use bpffsd::client::{self, HandoffError, Program};
use bpffsd::fs::Dispatcher;
use bpffsd::handoff::HandoffServer;
use bpffsd::kernel::SimKernel;
use bpffsd::loader::Loader;
use bpffsd::registry::Registry;

const SRC_HELLO: &str = r#"
int hello(void *ctx) {
    bpf_trace_printk("Hello, World!\n");
    return 0;
}
"#;

const SRC_HELLO_LOOP: &str = r#"
int hello(void *ctx) {
    for (;;) {
        bpf_trace_printk("Hello, World!\n");
    }
    return 0;
}
"#;

struct TestService {
    _dir: TempDir,
    kernel: Arc<SimKernel>,
    fs: Arc<Dispatcher>,
    loader: Loader,
    socket: std::path::PathBuf,
}

fn start_service() -> TestService {
    let dir = tempfile::tempdir().unwrap();
    let socket = dir.path().join("handoff.sock");

    let kernel = Arc::new(SimKernel::new());
    let registry = Arc::new(Registry::new());
    let loader = Loader::new(kernel.clone());
    let fs = Arc::new(Dispatcher::new(registry.clone(), loader.clone()));

    HandoffServer::bind(&socket, registry).unwrap().spawn();

    TestService {
        _dir: dir,
        kernel,
        fs,
        loader,
        socket,
    }
}

fn build_hello(service: &TestService, source: &str) -> Result<(), axerrno::AxError> {
    service.fs.mkdir("hello")?;
    service.fs.write("hello/source", source.as_bytes())?;
    service.fs.write("hello/functions/hello/type", b"kprobe")
}

// =============================================================================
// Descriptor Transfer Tests
// =============================================================================

#[test]
fn test_handoff_delivers_program() {
    let service = start_service();
    build_hello(&service, SRC_HELLO).unwrap();

    let program = Program::receive(&service.socket, "hello/hello").unwrap();
    assert!(program.handle().as_raw_fd() >= 0);

    // the received descriptor is usable: attach, observe, detach
    program.attach_kprobe(&service.loader, "schedule").unwrap();
    assert_eq!(
        service.kernel.attachment(program.handle().id()),
        Some("schedule".to_string())
    );
    program.close(&service.loader).unwrap();
    assert_eq!(service.kernel.attachment_count(), 0);
}

#[test]
fn test_handoff_accepts_full_paths() {
    let service = start_service();
    build_hello(&service, SRC_HELLO).unwrap();

    let id = service
        .fs
        .registry()
        .function("hello", "hello")
        .unwrap()
        .loaded_id()
        .unwrap();
    for target in [
        "hello/hello",
        "/hello/hello",
        "hello/functions/hello",
        "/hello/functions/hello/fd",
    ] {
        let program = Program::receive(&service.socket, target).unwrap();
        assert_eq!(program.handle().id(), id);
    }
}

#[test]
fn test_handoff_survives_rebuild() {
    let service = start_service();
    build_hello(&service, SRC_HELLO).unwrap();
    let old = Program::receive(&service.socket, "hello/hello").unwrap();
    let old_id = old.handle().id();

    // rebuild replaces the registry's handle; ours lives on
    service
        .fs
        .write("hello/source", SRC_HELLO.as_bytes())
        .unwrap();
    service
        .fs
        .write("hello/functions/hello/type", b"kprobe")
        .unwrap();

    let new = Program::receive(&service.socket, "hello/hello").unwrap();
    assert_ne!(new.handle().id(), old_id);
    old.attach_kprobe(&service.loader, "schedule").unwrap();
}

// =============================================================================
// Status Reply Tests
// =============================================================================

#[test]
fn test_handoff_unknown_function() {
    let service = start_service();
    assert!(matches!(
        client::recv_fd(&service.socket, "absent/nothing"),
        Err(HandoffError::UnknownFunction)
    ));
    assert!(matches!(
        client::recv_fd(&service.socket, "garbage"),
        Err(HandoffError::UnknownFunction)
    ));
}

#[test]
fn test_handoff_build_failed() {
    let service = start_service();
    assert!(build_hello(&service, SRC_HELLO_LOOP).is_err());
    assert!(matches!(
        client::recv_fd(&service.socket, "hello/hello"),
        Err(HandoffError::BuildFailed)
    ));
}

#[test]
fn test_handoff_not_ready() {
    let service = start_service();
    build_hello(&service, SRC_HELLO).unwrap();
    // a source rewrite returns the function to the unbuilt state
    service
        .fs
        .write("hello/source", SRC_HELLO.as_bytes())
        .unwrap();
    assert!(matches!(
        client::recv_fd(&service.socket, "hello/hello"),
        Err(HandoffError::NotReady)
    ));
}

// =============================================================================
// Synchronization Tests
// =============================================================================

#[test]
fn test_handoff_blocks_during_build() {
    let service = start_service();
    build_hello(&service, SRC_HELLO).unwrap();

    // take the function back into the building state by hand
    let record = service
        .fs
        .registry()
        .function("hello", "hello")
        .unwrap();
    let lease = record.begin_build().unwrap();

    let requests: Vec<_> = (0..3)
        .map(|_| {
            let socket = service.socket.clone();
            thread::spawn(move || Program::receive(&socket, "hello/hello"))
        })
        .collect();

    // resolve the build; every blocked request must see this exact program
    let artifact = bpffsd::compiler::compile(SRC_HELLO).unwrap();
    let handle = service
        .loader
        .load(&artifact, "hello", bpffsd::kernel::AttachType::Kprobe)
        .unwrap();
    let id = handle.id();
    lease.commit_loaded(handle);

    for request in requests {
        let program = request.join().unwrap().unwrap();
        assert_eq!(program.handle().id(), id);
    }
}

#[test]
fn test_handoff_survives_early_disconnect() {
    let service = start_service();
    build_hello(&service, SRC_HELLO).unwrap();

    // connect and walk away without sending a request
    drop(UnixStream::connect(&service.socket).unwrap());

    let program = Program::receive(&service.socket, "hello/hello").unwrap();
    assert!(program.handle().as_raw_fd() >= 0);
}

/// Backing file of a descriptor, as a (device, inode) pair.
fn backing_of(fd: i32) -> (u64, u64) {
    let meta = std::fs::metadata(format!("/proc/self/fd/{}", fd)).unwrap();
    (meta.dev(), meta.ino())
}

/// Open descriptors in this process that refer to the given backing file.
fn descriptors_for(backing: (u64, u64)) -> usize {
    std::fs::read_dir("/proc/self/fd")
        .unwrap()
        .flatten()
        .filter_map(|entry| std::fs::metadata(entry.path()).ok())
        .filter(|meta| (meta.dev(), meta.ino()) == backing)
        .count()
}

#[test]
fn test_disconnect_while_blocked_leaks_no_handle() {
    let service = start_service();
    build_hello(&service, SRC_HELLO).unwrap();

    // put the function back into the building state so requests block
    let record = service.fs.registry().function("hello", "hello").unwrap();
    let lease = record.begin_build().unwrap();

    // a client asks for the function and vanishes before any reply; the
    // request bytes stay buffered, so the server reads them, blocks on the
    // build, and its reply hits a closed peer
    {
        let mut doomed = UnixStream::connect(&service.socket).unwrap();
        let target = b"hello/hello";
        doomed
            .write_all(&(target.len() as u32).to_le_bytes())
            .unwrap();
        doomed.write_all(target).unwrap();
    }

    let artifact = bpffsd::compiler::compile(SRC_HELLO).unwrap();
    let handle = service
        .loader
        .load(&artifact, "hello", bpffsd::kernel::AttachType::Kprobe)
        .unwrap();
    let backing = backing_of(handle.as_raw_fd());
    lease.commit_loaded(handle);

    // the server is still serving, and the committed program is intact
    let program = Program::receive(&service.socket, "hello/hello").unwrap();
    program.close(&service.loader).unwrap();

    // the duplicate minted for the doomed client must be released; once it
    // is, the registry's descriptor is the only one left
    let mut spins = 0u32;
    while descriptors_for(backing) > 1 {
        spins += 1;
        assert!(spins < 1_000_000, "server kept a duplicate descriptor");
        thread::yield_now();
    }
    assert_eq!(service.kernel.program_count(), 1);
}
