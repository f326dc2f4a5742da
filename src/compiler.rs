//! Trace program build pipeline.
//!
//! Compiles submitted source text into a loadable [`Artifact`] or reports a
//! structured [`CompileError`]. The front end accepts a restricted C-like
//! dialect (the probe snippets clients actually write) and lowers each
//! function body to a small symbolic instruction set; producing real machine
//! code is the kernel toolchain's job, not this service's.
//!
//! Compilation is deterministic for a fixed source text and never mutates
//! registry state; the caller records the outcome.

use std::collections::BTreeMap;
use std::fmt;
use std::str;

/// Helper functions a trace program may call.
pub const SUPPORTED_HELPERS: &[&str] = &[
    "bpf_trace_printk",
    "bpf_ktime_get_ns",
    "bpf_get_current_pid_tgid",
    "bpf_get_current_uid_gid",
    "bpf_get_current_comm",
    "bpf_get_smp_processor_id",
];

/// A single lowered instruction.
///
/// Symbolic stand-in for the fixed-width encoding a real toolchain would
/// emit; rich enough for the verifier to reason about control flow.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Insn {
    /// Load an immediate into the return register.
    MovImm(i64),
    /// Call a helper function by name.
    Call(String),
    /// Unconditional jump to an instruction index.
    Jump(usize),
    /// Leave the program, yielding the return register.
    Exit,
}

/// Compiled output of one source text: named entry points plus any table
/// declarations. Owned exclusively by the function record that requested the
/// build; superseded wholesale by the next successful compile.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Artifact {
    functions: BTreeMap<String, Vec<Insn>>,
    tables: Vec<String>,
}

impl Artifact {
    /// Instructions of a named entry point, if the source defined it.
    pub fn function(&self, name: &str) -> Option<&[Insn]> {
        self.functions.get(name).map(Vec::as_slice)
    }

    /// Names of all entry points, in sorted order.
    pub fn function_names(&self) -> Vec<&str> {
        self.functions.keys().map(String::as_str).collect()
    }

    /// Names of declared tables (`BPF_TABLE(...)`), in declaration order.
    pub fn tables(&self) -> &[String] {
        &self.tables
    }

    pub fn function_count(&self) -> usize {
        self.functions.len()
    }
}

/// Error types for the build pipeline.
///
/// These are syntax/semantic rejections; kernel-verifier rejection is
/// reported separately at load time so its log text survives verbatim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompileError {
    /// Source text is empty or whitespace only.
    EmptySource,
    /// Source does not parse.
    Syntax { line: usize, message: String },
    /// Call to an undeclared `bpf_*` helper.
    UnknownHelper { line: usize, name: String },
    /// The same entry point is defined twice.
    DuplicateFunction { name: String },
    /// Source parsed but defines no entry points.
    NoFunctions,
}

impl fmt::Display for CompileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptySource => write!(f, "empty source"),
            Self::Syntax { line, message } => {
                write!(f, "syntax error at line {}: {}", line, message)
            }
            Self::UnknownHelper { line, name } => {
                write!(f, "line {}: unknown helper function '{}'", line, name)
            }
            Self::DuplicateFunction { name } => {
                write!(f, "redefinition of function '{}'", name)
            }
            Self::NoFunctions => write!(f, "source defines no functions"),
        }
    }
}

impl std::error::Error for CompileError {}

/// Compile source text into an [`Artifact`].
///
/// # Arguments
/// * `source` - program text in the restricted C dialect.
///
/// # Returns
/// The artifact with one instruction stream per defined function, or the
/// first error encountered.
pub fn compile(source: &str) -> Result<Artifact, CompileError> {
    if source.trim().is_empty() {
        return Err(CompileError::EmptySource);
    }

    let mut parser = Parser::new(source);
    let mut functions: BTreeMap<String, Vec<Insn>> = BTreeMap::new();
    let mut tables: Vec<String> = Vec::new();

    loop {
        parser.skip_ws();
        let Some(c) = parser.peek() else { break };

        // preprocessor lines are accepted and ignored
        if c == b'#' {
            parser.skip_line();
            continue;
        }
        if !is_ident_start(c) {
            return Err(CompileError::Syntax {
                line: parser.line,
                message: format!("unexpected '{}'", c as char),
            });
        }

        let ident = parser.read_ident();
        match ident {
            "BPF_TABLE" => {
                let line = parser.line;
                parser.skip_ws();
                if parser.peek() != Some(b'(') {
                    return Err(CompileError::Syntax {
                        line: parser.line,
                        message: "expected '(' after BPF_TABLE".into(),
                    });
                }
                let args = parser.consume_balanced(b'(', b')')?;
                parser.skip_ws();
                if parser.peek() == Some(b';') {
                    parser.bump();
                }
                let name = args
                    .split(',')
                    .nth(3)
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .ok_or(CompileError::Syntax {
                        line,
                        message: "BPF_TABLE requires (kind, key, leaf, name, size)".into(),
                    })?;
                tables.push(name.to_string());
            }
            "struct" | "union" | "enum" => {
                // type declaration, no code
                parser.skip_ws();
                if parser.at_ident_start() {
                    parser.read_ident();
                }
                parser.skip_ws();
                if parser.peek() == Some(b'{') {
                    parser.consume_balanced(b'{', b'}')?;
                    parser.skip_ws();
                    if parser.peek() == Some(b';') {
                        parser.bump();
                    }
                } else {
                    parser.consume_to_semicolon()?;
                }
            }
            ret_type => {
                // function definition: <ret> <name>(<args>) { <body> }
                parser.skip_ws();
                while parser.peek() == Some(b'*') {
                    parser.bump();
                    parser.skip_ws();
                }
                if !parser.at_ident_start() {
                    return Err(CompileError::Syntax {
                        line: parser.line,
                        message: format!("expected function name after '{}'", ret_type),
                    });
                }
                let name = parser.read_ident().to_string();
                parser.skip_ws();
                if parser.peek() != Some(b'(') {
                    return Err(CompileError::Syntax {
                        line: parser.line,
                        message: format!("expected '(' after '{}'", name),
                    });
                }
                parser.consume_balanced(b'(', b')')?;
                parser.skip_ws();
                if parser.peek() != Some(b'{') {
                    return Err(CompileError::Syntax {
                        line: parser.line,
                        message: format!("expected '{{' to open body of '{}'", name),
                    });
                }
                parser.bump();
                let mut insns = Vec::new();
                parser.lower_block(&mut insns)?;
                if insns.last() != Some(&Insn::Exit) {
                    insns.push(Insn::MovImm(0));
                    insns.push(Insn::Exit);
                }
                if functions.insert(name.clone(), insns).is_some() {
                    return Err(CompileError::DuplicateFunction { name });
                }
            }
        }
    }

    if functions.is_empty() {
        return Err(CompileError::NoFunctions);
    }

    log::debug!(
        "compiled {} function(s), {} table(s)",
        functions.len(),
        tables.len()
    );
    Ok(Artifact { functions, tables })
}

// =============================================================================
// Parser
// =============================================================================

fn is_ident_start(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_'
}

fn is_ident_char(c: u8) -> bool {
    c.is_ascii_alphanumeric() || c == b'_'
}

fn parse_int(s: &str) -> Option<i64> {
    let t = s.trim();
    if let Some(hex) = t.strip_prefix("0x").or_else(|| t.strip_prefix("0X")) {
        i64::from_str_radix(hex, 16).ok()
    } else {
        t.parse().ok()
    }
}

struct Parser<'a> {
    src: &'a [u8],
    pos: usize,
    line: usize,
}

impl<'a> Parser<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            src: source.as_bytes(),
            pos: 0,
            line: 1,
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
        }
        Some(c)
    }

    fn at_ident_start(&self) -> bool {
        matches!(self.peek(), Some(c) if is_ident_start(c))
    }

    fn span(&self, start: usize, end: usize) -> &'a str {
        str::from_utf8(&self.src[start..end]).unwrap_or("")
    }

    /// Skip whitespace and `//` / `/* */` comments.
    fn skip_ws(&mut self) {
        loop {
            while matches!(self.peek(), Some(c) if c.is_ascii_whitespace()) {
                self.bump();
            }
            if self.src[self.pos..].starts_with(b"//") {
                self.skip_line();
            } else if self.src[self.pos..].starts_with(b"/*") {
                self.bump();
                self.bump();
                while self.peek().is_some() && !self.src[self.pos..].starts_with(b"*/") {
                    self.bump();
                }
                self.bump();
                self.bump();
            } else {
                return;
            }
        }
    }

    fn skip_line(&mut self) {
        while let Some(c) = self.bump() {
            if c == b'\n' {
                return;
            }
        }
    }

    fn read_ident(&mut self) -> &'a str {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if is_ident_char(c)) {
            self.bump();
        }
        self.span(start, self.pos)
    }

    /// Consume a `"..."` or `'...'` literal, honoring backslash escapes.
    fn skip_literal(&mut self, quote: u8) -> Result<(), CompileError> {
        let line = self.line;
        self.bump();
        while let Some(c) = self.bump() {
            if c == b'\\' {
                self.bump();
            } else if c == quote {
                return Ok(());
            }
        }
        Err(CompileError::Syntax {
            line,
            message: "unterminated literal".into(),
        })
    }

    /// Consume a balanced `open`...`close` group; returns the inner text.
    /// The cursor must sit on `open`.
    fn consume_balanced(&mut self, open: u8, close: u8) -> Result<&'a str, CompileError> {
        let open_line = self.line;
        self.bump();
        let start = self.pos;
        let mut depth = 1usize;
        while let Some(c) = self.peek() {
            if c == b'"' || c == b'\'' {
                self.skip_literal(c)?;
                continue;
            }
            if c == open {
                depth += 1;
            } else if c == close {
                depth -= 1;
                if depth == 0 {
                    let inner = self.span(start, self.pos);
                    self.bump();
                    return Ok(inner);
                }
            }
            self.bump();
        }
        Err(CompileError::Syntax {
            line: open_line,
            message: format!("unmatched '{}'", open as char),
        })
    }

    /// Consume through the next `;` at nesting depth zero; returns the text
    /// before it. Used to swallow statements the lowering has no use for.
    fn consume_to_semicolon(&mut self) -> Result<&'a str, CompileError> {
        let start = self.pos;
        let start_line = self.line;
        let mut depth = 0usize;
        while let Some(c) = self.peek() {
            match c {
                b'"' | b'\'' => self.skip_literal(c)?,
                b'(' | b'[' | b'{' => {
                    depth += 1;
                    self.bump();
                }
                b')' | b']' | b'}' => {
                    if depth == 0 {
                        return Err(CompileError::Syntax {
                            line: self.line,
                            message: format!("unexpected '{}'", c as char),
                        });
                    }
                    depth -= 1;
                    self.bump();
                }
                b';' if depth == 0 => {
                    let text = self.span(start, self.pos);
                    self.bump();
                    return Ok(text);
                }
                _ => {
                    self.bump();
                }
            }
        }
        Err(CompileError::Syntax {
            line: start_line,
            message: "expected ';'".into(),
        })
    }

    /// Lower statements until the matching `}` of an already-opened block.
    fn lower_block(&mut self, insns: &mut Vec<Insn>) -> Result<(), CompileError> {
        loop {
            self.skip_ws();
            match self.peek() {
                None => {
                    return Err(CompileError::Syntax {
                        line: self.line,
                        message: "unexpected end of source, expected '}'".into(),
                    });
                }
                Some(b'}') => {
                    self.bump();
                    return Ok(());
                }
                Some(_) => self.lower_stmt(insns)?,
            }
        }
    }

    fn lower_stmt(&mut self, insns: &mut Vec<Insn>) -> Result<(), CompileError> {
        self.skip_ws();
        match self.peek() {
            Some(b'{') => {
                self.bump();
                self.lower_block(insns)
            }
            Some(b';') => {
                self.bump();
                Ok(())
            }
            Some(c) if is_ident_start(c) => {
                let line = self.line;
                let ident = self.read_ident();
                match ident {
                    "return" => {
                        let expr = self.consume_to_semicolon()?;
                        insns.push(Insn::MovImm(parse_int(expr).unwrap_or(0)));
                        insns.push(Insn::Exit);
                        Ok(())
                    }
                    "for" | "while" => {
                        self.skip_ws();
                        if self.peek() != Some(b'(') {
                            return Err(CompileError::Syntax {
                                line: self.line,
                                message: format!("expected '(' after '{}'", ident),
                            });
                        }
                        self.consume_balanced(b'(', b')')?;
                        let start = insns.len();
                        self.lower_stmt(insns)?;
                        // loops lower with an explicit back-edge; whether one
                        // is acceptable is the verifier's call, not ours
                        insns.push(Insn::Jump(start));
                        Ok(())
                    }
                    "if" => {
                        self.skip_ws();
                        if self.peek() != Some(b'(') {
                            return Err(CompileError::Syntax {
                                line: self.line,
                                message: "expected '(' after 'if'".into(),
                            });
                        }
                        self.consume_balanced(b'(', b')')?;
                        self.lower_stmt(insns)?;
                        let save = (self.pos, self.line);
                        self.skip_ws();
                        if self.at_ident_start() {
                            let kw_pos = (self.pos, self.line);
                            if self.read_ident() == "else" {
                                self.lower_stmt(insns)?;
                            } else {
                                (self.pos, self.line) = kw_pos;
                            }
                        } else {
                            (self.pos, self.line) = save;
                        }
                        Ok(())
                    }
                    name => {
                        self.skip_ws();
                        if self.peek() == Some(b'(') {
                            self.consume_balanced(b'(', b')')?;
                            self.consume_to_semicolon()?;
                            if name.starts_with("bpf_") {
                                if !SUPPORTED_HELPERS.contains(&name) {
                                    return Err(CompileError::UnknownHelper {
                                        line,
                                        name: name.to_string(),
                                    });
                                }
                                insns.push(Insn::Call(name.to_string()));
                            }
                            Ok(())
                        } else {
                            // declaration or expression statement
                            self.consume_to_semicolon()?;
                            Ok(())
                        }
                    }
                }
            }
            _ => {
                self.consume_to_semicolon()?;
                Ok(())
            }
        }
    }
}
