//! Integration tests for the control-surface dispatcher.
//!
//! Tests the directory grammar and the synchronous type-write pipeline.

use std::sync::Arc;

use axerrno::AxError;

use bpffsd::fs::{Dispatcher, NodeKind};
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

fn service() -> (Arc<SimKernel>, Dispatcher) {
    let kernel = Arc::new(SimKernel::new());
    let registry = Arc::new(Registry::new());
    let loader = Loader::new(kernel.clone());
    (kernel, Dispatcher::new(registry, loader))
}

// =============================================================================
// Directory Grammar Tests
// =============================================================================

#[test]
fn test_mkdir_and_readdir() {
    let (_, fs) = service();
    fs.mkdir("/hello").unwrap();
    assert_eq!(fs.readdir("/").unwrap(), vec!["hello".to_string()]);
    assert_eq!(
        fs.readdir("/hello").unwrap(),
        vec![
            "functions".to_string(),
            "maps".to_string(),
            "source".to_string(),
            "valid".to_string()
        ]
    );
    assert!(fs.readdir("/hello/functions").unwrap().is_empty());
    assert!(fs.readdir("/hello/maps").unwrap().is_empty());
}

#[test]
fn test_mkdir_exists() {
    let (_, fs) = service();
    fs.mkdir("hello").unwrap();
    assert_eq!(fs.mkdir("hello"), Err(AxError::AlreadyExists));
    assert_eq!(fs.mkdir("/"), Err(AxError::AlreadyExists));
}

#[test]
fn test_mkdir_only_at_root() {
    let (_, fs) = service();
    fs.mkdir("hello").unwrap();
    assert_eq!(
        fs.mkdir("hello/functions/probe"),
        Err(AxError::PermissionDenied)
    );
    assert_eq!(fs.mkdir("hello/extra"), Err(AxError::NotFound));
}

#[test]
fn test_bad_path_rejected() {
    let (_, fs) = service();
    assert_eq!(fs.mkdir("../escape"), Err(AxError::InvalidInput));
    assert_eq!(fs.lookup("hello world"), Err(AxError::InvalidInput));
}

#[test]
fn test_lookup_attrs() {
    let (_, fs) = service();
    fs.mkdir("hello").unwrap();
    fs.write("hello/source", SRC_HELLO.as_bytes()).unwrap();

    assert_eq!(fs.lookup("/").unwrap().kind, NodeKind::Dir);
    assert_eq!(fs.lookup("hello").unwrap().kind, NodeKind::Dir);
    let source = fs.lookup("hello/source").unwrap();
    assert_eq!(source.kind, NodeKind::File);
    assert_eq!(source.size, SRC_HELLO.len() as u64);
    assert_eq!(fs.lookup("hello/valid").unwrap().size, 2);
    assert_eq!(fs.lookup("absent"), Err(AxError::NotFound));
}

#[test]
fn test_remove_object() {
    let (_, fs) = service();
    fs.mkdir("hello").unwrap();
    fs.remove("hello").unwrap();
    assert!(fs.readdir("/").unwrap().is_empty());
    assert_eq!(fs.remove("hello"), Err(AxError::NotFound));
    assert_eq!(fs.remove("/"), Err(AxError::PermissionDenied));
}

// =============================================================================
// Build Pipeline Tests
// =============================================================================

#[test]
fn test_type_write_loads_program() {
    let (kernel, fs) = service();
    fs.mkdir("hello").unwrap();
    fs.write("hello/source", SRC_HELLO.as_bytes()).unwrap();
    fs.write("hello/functions/hello/type", b"kprobe").unwrap();

    assert_eq!(kernel.program_count(), 1);
    assert_eq!(fs.read("hello/valid").unwrap(), b"1\n");
    assert_eq!(
        fs.lookup("hello/functions/hello/fd").unwrap().kind,
        NodeKind::Socket
    );
    assert_eq!(
        fs.readdir("hello/functions/hello").unwrap(),
        vec!["fd".to_string(), "type".to_string()]
    );
}

#[test]
fn test_type_write_with_activation() {
    let (kernel, fs) = service();
    fs.mkdir("hello").unwrap();
    fs.write("hello/source", SRC_HELLO.as_bytes()).unwrap();
    fs.write("hello/functions/hello/type", b"kprobe:schedule\n")
        .unwrap();

    let id = fs
        .registry()
        .function("hello", "hello")
        .unwrap()
        .loaded_id()
        .unwrap();
    assert_eq!(kernel.attachment(id), Some("schedule".to_string()));
}

#[test]
fn test_verifier_failure_reports_error() {
    let (kernel, fs) = service();
    fs.mkdir("hello").unwrap();
    fs.write("hello/source", SRC_HELLO_LOOP.as_bytes()).unwrap();

    assert_eq!(
        fs.write("hello/functions/hello/type", b"kprobe"),
        Err(AxError::Io)
    );
    assert_eq!(kernel.program_count(), 0);
    assert_eq!(fs.read("hello/valid").unwrap(), b"0\n");

    // the verifier log is preserved verbatim in the error file
    let diag = String::from_utf8(fs.read("hello/functions/hello/error").unwrap()).unwrap();
    assert!(diag.contains("back-edge"), "diagnostic: {}", diag);
    assert_eq!(
        fs.readdir("hello/functions/hello").unwrap(),
        vec!["error".to_string(), "type".to_string()]
    );
    assert_eq!(
        fs.lookup("hello/functions/hello/fd"),
        Err(AxError::NotFound)
    );
}

#[test]
fn test_rebuild_after_fix() {
    let (kernel, fs) = service();
    fs.mkdir("hello").unwrap();
    fs.write("hello/source", SRC_HELLO_LOOP.as_bytes()).unwrap();
    assert!(fs.write("hello/functions/hello/type", b"kprobe").is_err());

    fs.write("hello/source", SRC_HELLO.as_bytes()).unwrap();
    fs.write("hello/functions/hello/type", b"kprobe").unwrap();

    assert_eq!(kernel.program_count(), 1);
    assert_eq!(fs.read("hello/valid").unwrap(), b"1\n");
    // the error file disappears with the Error state
    assert_eq!(
        fs.read("hello/functions/hello/error"),
        Err(AxError::NotFound)
    );
}

#[test]
fn test_type_write_unknown_keyword() {
    let (_, fs) = service();
    fs.mkdir("hello").unwrap();
    fs.write("hello/source", SRC_HELLO.as_bytes()).unwrap();
    assert_eq!(
        fs.write("hello/functions/hello/type", b"uprobe"),
        Err(AxError::InvalidInput)
    );
    // rejected before any state was touched
    assert_eq!(fs.lookup("hello/functions/hello"), Err(AxError::NotFound));
}

#[test]
fn test_type_write_empty_source() {
    let (_, fs) = service();
    fs.mkdir("hello").unwrap();
    assert_eq!(
        fs.write("hello/functions/hello/type", b"kprobe"),
        Err(AxError::Io)
    );
    let diag = String::from_utf8(fs.read("hello/functions/hello/error").unwrap()).unwrap();
    assert!(diag.contains("empty source"), "diagnostic: {}", diag);
}

#[test]
fn test_type_write_missing_function() {
    let (_, fs) = service();
    fs.mkdir("hello").unwrap();
    fs.write("hello/source", SRC_HELLO.as_bytes()).unwrap();
    assert_eq!(
        fs.write("hello/functions/goodbye/type", b"kprobe"),
        Err(AxError::Io)
    );
    let diag = String::from_utf8(fs.read("hello/functions/goodbye/error").unwrap()).unwrap();
    assert!(diag.contains("goodbye"), "diagnostic: {}", diag);
}

#[test]
fn test_type_write_busy() {
    let (_, fs) = service();
    fs.mkdir("hello").unwrap();
    fs.write("hello/source", SRC_HELLO.as_bytes()).unwrap();

    let record = fs
        .registry()
        .object("hello")
        .unwrap()
        .get_or_create_function("hello");
    let lease = record.begin_build().unwrap();

    assert_eq!(
        fs.write("hello/functions/hello/type", b"kprobe"),
        Err(AxError::ResourceBusy)
    );
    drop(lease);
    fs.write("hello/functions/hello/type", b"kprobe").unwrap();
}

#[test]
fn test_maps_reflect_table_declarations() {
    let (_, fs) = service();
    let src = r#"
        BPF_TABLE("hash", u32, u64, counts, 1024);
        BPF_TABLE("array", u32, u64, totals, 64);
        int counter(void *ctx) { return 0; }
    "#;
    fs.mkdir("hello").unwrap();
    fs.write("hello/source", src.as_bytes()).unwrap();
    fs.write("hello/functions/counter/type", b"kprobe").unwrap();

    assert_eq!(
        fs.readdir("hello/maps").unwrap(),
        vec!["counts".to_string(), "totals".to_string()]
    );
    assert_eq!(fs.lookup("hello/maps").unwrap().kind, NodeKind::Dir);
    assert_eq!(fs.lookup("hello/maps/counts").unwrap().kind, NodeKind::Dir);
    assert!(fs.readdir("hello/maps/counts").unwrap().is_empty());
    assert_eq!(fs.lookup("hello/maps/absent"), Err(AxError::NotFound));

    // superseding the source drops its table declarations
    fs.write("hello/source", SRC_HELLO.as_bytes()).unwrap();
    assert!(fs.readdir("hello/maps").unwrap().is_empty());
    assert_eq!(fs.lookup("hello/maps/counts"), Err(AxError::NotFound));
}

#[test]
fn test_source_rewrite_invalidates_load() {
    let (_, fs) = service();
    fs.mkdir("hello").unwrap();
    fs.write("hello/source", SRC_HELLO.as_bytes()).unwrap();
    fs.write("hello/functions/hello/type", b"kprobe").unwrap();
    assert_eq!(fs.read("hello/valid").unwrap(), b"1\n");

    fs.write("hello/source", SRC_HELLO.as_bytes()).unwrap();
    assert_eq!(fs.read("hello/valid").unwrap(), b"0\n");
    assert_eq!(
        fs.lookup("hello/functions/hello/fd"),
        Err(AxError::NotFound)
    );
}

// =============================================================================
// Access Mode Tests
// =============================================================================

#[test]
fn test_source_is_write_only() {
    let (_, fs) = service();
    fs.mkdir("hello").unwrap();
    fs.write("hello/source", SRC_HELLO.as_bytes()).unwrap();
    assert_eq!(fs.read("hello/source"), Err(AxError::PermissionDenied));
}

#[test]
fn test_read_only_files_reject_writes() {
    let (_, fs) = service();
    fs.mkdir("hello").unwrap();
    assert_eq!(
        fs.write("hello/valid", b"1"),
        Err(AxError::PermissionDenied)
    );
}

#[test]
fn test_fd_is_not_readable() {
    let (_, fs) = service();
    fs.mkdir("hello").unwrap();
    fs.write("hello/source", SRC_HELLO.as_bytes()).unwrap();
    fs.write("hello/functions/hello/type", b"kprobe").unwrap();
    assert_eq!(
        fs.read("hello/functions/hello/fd"),
        Err(AxError::Unsupported)
    );
}

#[test]
fn test_read_directory_rejected() {
    let (_, fs) = service();
    fs.mkdir("hello").unwrap();
    assert_eq!(fs.read("hello"), Err(AxError::IsADirectory));
    assert_eq!(fs.readdir("hello/valid"), Err(AxError::NotADirectory));
}
