//! Virtual filesystem dispatcher: the path-keyed control surface.
//!
//! Maps directory-tree operations onto the registry, build pipeline, and
//! loader. The synthetic hierarchy:
//!
//! ```text
//! <root>/<object>/source                  write-only program text
//! <root>/<object>/valid                   read-only, "1\n" while loaded
//! <root>/<object>/maps/<table>            table declarations of the last
//!                                         successful compile
//! <root>/<object>/functions/<fn>/type     write attach-type keyword; the
//!                                         write blocks through compile+load
//! <root>/<object>/functions/<fn>/error    read-only, present iff Error
//! <root>/<object>/functions/<fn>/fd       addressable handoff name, not a
//!                                         readable file
//! ```
//!
//! Failures use errno-style [`AxError`] codes so the surface can sit behind
//! either the socket service or a real filesystem front end unchanged.

use std::sync::Arc;

use axerrno::{AxError, AxResult, ax_err};

use crate::compiler;
use crate::kernel::KernelError;
use crate::loader::{LoadError, Loader};
use crate::registry::Registry;

/// What a path resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    Dir,
    File,
    Socket,
}

/// Minimal attributes, enough for a stat-like front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Attr {
    pub kind: NodeKind,
    pub size: u64,
}

/// Parsed form of a control-surface path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodePath<'a> {
    Root,
    Object(&'a str),
    Source(&'a str),
    Valid(&'a str),
    Maps(&'a str),
    MapDir(&'a str, &'a str),
    Functions(&'a str),
    Function(&'a str, &'a str),
    TypeFile(&'a str, &'a str),
    ErrorFile(&'a str, &'a str),
    FdSocket(&'a str, &'a str),
}

fn valid_name(s: &str) -> bool {
    !s.is_empty()
        && s != "."
        && s != ".."
        && s.bytes()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, b'_' | b'-' | b'.'))
}

fn parse_path(path: &str) -> AxResult<NodePath<'_>> {
    let trimmed = path.trim_matches('/');
    if trimmed.is_empty() {
        return Ok(NodePath::Root);
    }
    let segs: Vec<&str> = trimmed.split('/').collect();
    if !segs.iter().all(|s| valid_name(s)) {
        return ax_err!(InvalidInput, format!("bad path '{}'", path));
    }
    match segs.as_slice() {
        &[object] => Ok(NodePath::Object(object)),
        &[object, "source"] => Ok(NodePath::Source(object)),
        &[object, "valid"] => Ok(NodePath::Valid(object)),
        &[object, "maps"] => Ok(NodePath::Maps(object)),
        &[object, "maps", table] => Ok(NodePath::MapDir(object, table)),
        &[object, "functions"] => Ok(NodePath::Functions(object)),
        &[object, "functions", function] => Ok(NodePath::Function(object, function)),
        &[object, "functions", function, "type"] => Ok(NodePath::TypeFile(object, function)),
        &[object, "functions", function, "error"] => Ok(NodePath::ErrorFile(object, function)),
        &[object, "functions", function, "fd"] => Ok(NodePath::FdSocket(object, function)),
        _ => Err(AxError::NotFound),
    }
}

// =============================================================================
// Dispatcher
// =============================================================================

/// The control-surface dispatcher.
pub struct Dispatcher {
    registry: Arc<Registry>,
    loader: Loader,
}

impl Dispatcher {
    pub fn new(registry: Arc<Registry>, loader: Loader) -> Self {
        Self { registry, loader }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Create an object directory.
    pub fn mkdir(&self, path: &str) -> AxResult<()> {
        log::debug!("mkdir: {}", path);
        match parse_path(path)? {
            NodePath::Root => Err(AxError::AlreadyExists),
            NodePath::Object(name) => {
                let (_, created) = self.registry.get_or_create_object(name);
                if created {
                    Ok(())
                } else {
                    Err(AxError::AlreadyExists)
                }
            }
            _ => Err(AxError::PermissionDenied),
        }
    }

    /// Remove an object directory and everything under it. Handles held by
    /// the removed records close; transferred duplicates are unaffected.
    pub fn remove(&self, path: &str) -> AxResult<()> {
        log::debug!("remove: {}", path);
        match parse_path(path)? {
            NodePath::Object(name) => match self.registry.remove_object(name) {
                Some(_) => Ok(()),
                None => Err(AxError::NotFound),
            },
            _ => Err(AxError::PermissionDenied),
        }
    }

    /// List directory entries.
    pub fn readdir(&self, path: &str) -> AxResult<Vec<String>> {
        log::debug!("readdir: {}", path);
        match parse_path(path)? {
            NodePath::Root => Ok(self.registry.object_names()),
            NodePath::Object(name) => {
                self.object(name)?;
                Ok(vec![
                    "functions".to_string(),
                    "maps".to_string(),
                    "source".to_string(),
                    "valid".to_string(),
                ])
            }
            NodePath::Maps(name) => Ok(self.object(name)?.tables()),
            NodePath::MapDir(object, table) => {
                self.map_dir(object, table)?;
                Ok(Vec::new())
            }
            NodePath::Functions(name) => Ok(self.object(name)?.function_names()),
            NodePath::Function(object, function) => {
                let record = self
                    .registry
                    .function(object, function)
                    .ok_or(AxError::NotFound)?;
                // error and fd entries come and go with the state
                let mut entries = vec!["type".to_string()];
                if record.diagnostic().is_some() {
                    entries.insert(0, "error".to_string());
                }
                if record.loaded_id().is_some() {
                    entries.insert(entries.len() - 1, "fd".to_string());
                }
                Ok(entries)
            }
            _ => Err(AxError::NotADirectory),
        }
    }

    /// Resolve a path to its kind and size.
    pub fn lookup(&self, path: &str) -> AxResult<Attr> {
        log::debug!("lookup: {}", path);
        let dir = Attr {
            kind: NodeKind::Dir,
            size: 0,
        };
        let file = |size: u64| Attr {
            kind: NodeKind::File,
            size,
        };
        match parse_path(path)? {
            NodePath::Root => Ok(dir),
            NodePath::Object(name) | NodePath::Functions(name) | NodePath::Maps(name) => {
                self.object(name)?;
                Ok(dir)
            }
            NodePath::MapDir(object, table) => {
                self.map_dir(object, table)?;
                Ok(dir)
            }
            NodePath::Source(name) => Ok(file(self.object(name)?.source().len() as u64)),
            NodePath::Valid(name) => {
                self.object(name)?;
                Ok(file(2))
            }
            NodePath::Function(object, function) => {
                self.function(object, function)?;
                Ok(dir)
            }
            NodePath::TypeFile(object, function) => {
                self.function(object, function)?;
                Ok(file(0))
            }
            NodePath::ErrorFile(object, function) => {
                let diag = self
                    .function(object, function)?
                    .diagnostic()
                    .ok_or(AxError::NotFound)?;
                Ok(file(diag.len() as u64))
            }
            NodePath::FdSocket(object, function) => {
                self.function(object, function)?
                    .loaded_id()
                    .ok_or(AxError::NotFound)?;
                Ok(Attr {
                    kind: NodeKind::Socket,
                    size: 0,
                })
            }
        }
    }

    /// Read a file's contents.
    pub fn read(&self, path: &str) -> AxResult<Vec<u8>> {
        log::debug!("read: {}", path);
        match parse_path(path)? {
            NodePath::Valid(name) => {
                let object = self.object(name)?;
                Ok(if object.any_loaded() { b"1\n" } else { b"0\n" }.to_vec())
            }
            NodePath::ErrorFile(object, function) => {
                let record = self.function(object, function)?;
                match record.diagnostic() {
                    Some(diag) => Ok(diag.into_bytes()),
                    // absent unless the function is in the Error state
                    None => Err(AxError::NotFound),
                }
            }
            NodePath::Source(_) | NodePath::TypeFile(_, _) => Err(AxError::PermissionDenied),
            NodePath::FdSocket(_, _) => ax_err!(
                Unsupported,
                "fd is a handoff target, request it over the handoff channel"
            ),
            _ => Err(AxError::IsADirectory),
        }
    }

    /// Write to a file.
    ///
    /// A write to a `type` file is the synchronization point of the whole
    /// service: it does not return until compile, load, and any requested
    /// activation have definitively succeeded or failed.
    pub fn write(&self, path: &str, data: &[u8]) -> AxResult<()> {
        log::debug!("write: {} ({} bytes)", path, data.len());
        match parse_path(path)? {
            NodePath::Source(name) => {
                let object = self.object(name)?;
                let text = str::from_utf8(data)
                    .map_err(|_| AxError::InvalidInput)?
                    .to_string();
                object.set_source(text);
                Ok(())
            }
            NodePath::TypeFile(object, function) => self.build_and_load(object, function, data),
            NodePath::Valid(_) | NodePath::ErrorFile(_, _) | NodePath::FdSocket(_, _) => {
                Err(AxError::PermissionDenied)
            }
            _ => Err(AxError::IsADirectory),
        }
    }

    fn object(&self, name: &str) -> AxResult<Arc<crate::registry::ObjectRecord>> {
        self.registry.object(name).ok_or(AxError::NotFound)
    }

    fn function(
        &self,
        object: &str,
        function: &str,
    ) -> AxResult<Arc<crate::registry::FunctionRecord>> {
        self.registry
            .function(object, function)
            .ok_or(AxError::NotFound)
    }

    /// A map directory exists iff its table was declared by the object's
    /// most recent successful compile.
    fn map_dir(&self, object: &str, table: &str) -> AxResult<()> {
        if self.object(object)?.tables().iter().any(|t| t == table) {
            Ok(())
        } else {
            Err(AxError::NotFound)
        }
    }

    /// The type-write pipeline: lease, compile, load, activate, commit.
    fn build_and_load(&self, object: &str, function: &str, data: &[u8]) -> AxResult<()> {
        let object = self.object(object)?;
        let text = str::from_utf8(data).map_err(|_| AxError::InvalidInput)?;
        let request = text.trim();

        // "kprobe" or "kprobe:<symbol>" when activation is requested inline
        let (keyword, target) = match request.split_once(':') {
            Some((kw, sym)) => (kw, Some(sym)),
            None => (request, None),
        };
        // unsupported keywords fail here, before any state changes
        let attach_type = match Loader::parse_attach_type(keyword) {
            Ok(t) => t,
            Err(e) => return ax_err!(InvalidInput, e.to_string()),
        };

        let record = object.get_or_create_function(function);
        let lease = record.begin_build().map_err(|_| AxError::ResourceBusy)?;
        let source = object.source();

        let artifact = match compiler::compile(&source) {
            Ok(artifact) => artifact,
            Err(e) => {
                lease.commit_error(e.to_string());
                return ax_err!(Io, format!("{}: compile failed", record.path()));
            }
        };
        // table declarations surface under <object>/maps once the source
        // compiles
        object.set_tables(artifact.tables().to_vec());

        let handle = match self.loader.load(&artifact, function, attach_type) {
            Ok(handle) => handle,
            Err(e) => {
                lease.commit_error(diagnostic_of(&e));
                return ax_err!(Io, format!("{}: load failed", record.path()));
            }
        };

        if let Some(symbol) = target {
            if let Err(e) = self.loader.activate(&handle, symbol) {
                lease.commit_error(diagnostic_of(&e));
                return ax_err!(Io, format!("{}: activation failed", record.path()));
            }
        }

        lease.commit_loaded(handle);
        Ok(())
    }
}

/// Diagnostic text recorded for a failed load. Verifier rejections keep the
/// kernel's log text verbatim so a human can diagnose the violation.
fn diagnostic_of(e: &LoadError) -> String {
    match e {
        LoadError::Kernel(KernelError::Verifier(log)) => log.clone(),
        other => other.to_string(),
    }
}
