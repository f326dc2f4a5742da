//! Integration tests for the build pipeline.
//!
//! Tests source parsing, lowering, and structured compile errors.

use bpffsd::compiler::{self, CompileError, Insn};

/// The classic hello tracer: one call, one return.
const SRC_HELLO: &str = r#"
#include <linux/sched.h>
int hello(void *ctx) {
    bpf_trace_printk("Hello, World!\n");
    return 0;
}
"#;

/// Same program with an unbounded loop in the body.
const SRC_HELLO_LOOP: &str = r#"
int hello(void *ctx) {
    for (;;) {
        bpf_trace_printk("Hello, World!\n");
    }
    return 0;
}
"#;

// =============================================================================
// Basic Compilation Tests
// =============================================================================

#[test]
fn test_compile_hello() {
    let artifact = compiler::compile(SRC_HELLO).unwrap();
    assert_eq!(artifact.function_count(), 1);
    assert_eq!(artifact.function_names(), vec!["hello"]);
}

#[test]
fn test_compile_hello_lowering() {
    let artifact = compiler::compile(SRC_HELLO).unwrap();
    let insns = artifact.function("hello").unwrap();
    assert_eq!(
        insns,
        &[
            Insn::Call("bpf_trace_printk".to_string()),
            Insn::MovImm(0),
            Insn::Exit,
        ][..]
    );
}

#[test]
fn test_compile_multiple_functions() {
    let src = r#"
        int first(void *ctx) { return 1; }
        int second(void *ctx) { return 2; }
    "#;
    let artifact = compiler::compile(src).unwrap();
    assert_eq!(artifact.function_names(), vec!["first", "second"]);
    assert_eq!(
        artifact.function("second").unwrap(),
        &[Insn::MovImm(2), Insn::Exit][..]
    );
}

#[test]
fn test_compile_implicit_return() {
    // a body without a trailing return still ends in exit
    let src = "int quiet(void *ctx) { bpf_ktime_get_ns(); }";
    let artifact = compiler::compile(src).unwrap();
    let insns = artifact.function("quiet").unwrap();
    assert_eq!(insns.last(), Some(&Insn::Exit));
}

#[test]
fn test_compile_loop_emits_back_edge() {
    let artifact = compiler::compile(SRC_HELLO_LOOP).unwrap();
    let insns = artifact.function("hello").unwrap();
    let has_back_edge = insns
        .iter()
        .enumerate()
        .any(|(idx, insn)| matches!(insn, Insn::Jump(target) if *target <= idx));
    assert!(has_back_edge, "loop should lower to a back-edge: {:?}", insns);
}

#[test]
fn test_compile_if_else() {
    let src = r#"
        int branchy(void *ctx) {
            if (ctx)
                bpf_trace_printk("yes\n");
            else
                bpf_trace_printk("no\n");
            return 0;
        }
    "#;
    let artifact = compiler::compile(src).unwrap();
    let insns = artifact.function("branchy").unwrap();
    let calls = insns
        .iter()
        .filter(|i| matches!(i, Insn::Call(_)))
        .count();
    assert_eq!(calls, 2);
}

#[test]
fn test_compile_comments_and_preprocessor() {
    let src = r#"
        // single line
        #include <uapi/linux/ptrace.h>
        /* block
           comment */
        int noisy(void *ctx) {
            return 7; // trailing
        }
    "#;
    let artifact = compiler::compile(src).unwrap();
    assert_eq!(
        artifact.function("noisy").unwrap(),
        &[Insn::MovImm(7), Insn::Exit][..]
    );
}

#[test]
fn test_compile_bpf_table() {
    let src = r#"
        BPF_TABLE("hash", u32, u64, counts, 1024);
        int counter(void *ctx) { return 0; }
    "#;
    let artifact = compiler::compile(src).unwrap();
    assert_eq!(artifact.tables(), &["counts".to_string()][..]);
    assert_eq!(artifact.function_count(), 1);
}

#[test]
fn test_compile_struct_declaration() {
    let src = r#"
        struct event { int pid; };
        int emitter(void *ctx) { return 0; }
    "#;
    let artifact = compiler::compile(src).unwrap();
    assert_eq!(artifact.function_count(), 1);
}

// =============================================================================
// Error Tests
// =============================================================================

#[test]
fn test_compile_empty_source() {
    assert_eq!(compiler::compile(""), Err(CompileError::EmptySource));
    assert_eq!(compiler::compile("  \n\t"), Err(CompileError::EmptySource));
}

#[test]
fn test_compile_no_functions() {
    let src = "#include <linux/sched.h>\n";
    assert_eq!(compiler::compile(src), Err(CompileError::NoFunctions));
}

#[test]
fn test_compile_unbalanced_brace() {
    let src = "int broken(void *ctx) { return 0;";
    assert!(matches!(
        compiler::compile(src),
        Err(CompileError::Syntax { .. })
    ));
}

#[test]
fn test_compile_unknown_helper() {
    let src = r#"
        int prober(void *ctx) {
            bpf_probe_read_fancy(ctx);
            return 0;
        }
    "#;
    match compiler::compile(src) {
        Err(CompileError::UnknownHelper { line, name }) => {
            assert_eq!(name, "bpf_probe_read_fancy");
            assert_eq!(line, 3);
        }
        other => panic!("expected UnknownHelper, got {:?}", other),
    }
}

#[test]
fn test_compile_duplicate_function() {
    let src = r#"
        int twice(void *ctx) { return 0; }
        int twice(void *ctx) { return 1; }
    "#;
    assert!(matches!(
        compiler::compile(src),
        Err(CompileError::DuplicateFunction { .. })
    ));
}

#[test]
fn test_compile_deterministic() {
    let a = compiler::compile(SRC_HELLO).unwrap();
    let b = compiler::compile(SRC_HELLO).unwrap();
    assert_eq!(a.function("hello"), b.function("hello"));
}
