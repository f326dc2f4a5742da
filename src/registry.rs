//! Program registry: per-object, per-function compile/load state.
//!
//! The registry is an arena of independent function records, each guarded by
//! its own lock and condition variable; builds on unrelated functions never
//! contend. A build runs under an exclusive [`BuildLease`]: entering
//! Compiling is serialized, a second writer fails fast with [`BuildBusy`],
//! and [`BuildLease::commit_loaded`]/[`BuildLease::commit_error`] publish the
//! outcome atomically and wake every blocked handoff waiter.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::kernel::ProgHandle;

/// A function's compile/load state.
///
/// The diagnostic lives only inside `Error` and the handle only inside
/// `Loaded`, so a half-updated state (Loaded without a handle, Error with no
/// diagnostic) cannot be represented, let alone observed.
#[derive(Debug)]
enum FunctionState {
    Empty,
    Compiling,
    Error(String),
    Loaded(ProgHandle),
}

/// Observable state kind, for status queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateKind {
    Empty,
    Compiling,
    Error,
    Loaded,
}

/// A build is already in flight for this function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BuildBusy;

impl fmt::Display for BuildBusy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "build already in progress")
    }
}

impl std::error::Error for BuildBusy {}

/// Outcome of waiting for a function to leave the Compiling state.
#[derive(Debug)]
pub enum Resolution {
    /// Function is loaded; carries a duplicated handle for transfer.
    Loaded(ProgHandle),
    /// Most recent build failed; carries the diagnostic.
    Failed(String),
    /// No build has been requested for this function.
    NotBuilt,
}

// =============================================================================
// FunctionRecord
// =============================================================================

/// One named function within an object.
pub struct FunctionRecord {
    object: String,
    name: String,
    state: Mutex<FunctionState>,
    resolved: Condvar,
}

impl FunctionRecord {
    fn new(object: &str, name: &str) -> Self {
        Self {
            object: object.to_string(),
            name: name.to_string(),
            state: Mutex::new(FunctionState::Empty),
            resolved: Condvar::new(),
        }
    }

    pub fn object(&self) -> &str {
        &self.object
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `<object>/<name>`, the path clients use to address this function.
    pub fn path(&self) -> String {
        format!("{}/{}", self.object, self.name)
    }

    pub fn state_kind(&self) -> StateKind {
        match *self.state.lock() {
            FunctionState::Empty => StateKind::Empty,
            FunctionState::Compiling => StateKind::Compiling,
            FunctionState::Error(_) => StateKind::Error,
            FunctionState::Loaded(_) => StateKind::Loaded,
        }
    }

    /// Diagnostic text; present iff the function is in the Error state.
    pub fn diagnostic(&self) -> Option<String> {
        match &*self.state.lock() {
            FunctionState::Error(diag) => Some(diag.clone()),
            _ => None,
        }
    }

    /// Id of the currently loaded program, if any.
    pub fn loaded_id(&self) -> Option<u64> {
        match &*self.state.lock() {
            FunctionState::Loaded(handle) => Some(handle.id()),
            _ => None,
        }
    }

    /// Take the exclusive build lease, entering the Compiling state.
    ///
    /// Permitted from Empty, Error, and Loaded (a type re-write supersedes
    /// the previous handle at commit). Fails fast with [`BuildBusy`] while
    /// another build is in flight; requests are never queued silently.
    pub fn begin_build(&self) -> Result<BuildLease<'_>, BuildBusy> {
        let mut state = self.state.lock();
        if matches!(*state, FunctionState::Compiling) {
            return Err(BuildBusy);
        }
        // the old handle (if any) drops here; the kernel-side program
        // survives while transferred duplicates remain open
        *state = FunctionState::Compiling;
        log::debug!("{}: build started", self.path());
        Ok(BuildLease {
            record: self,
            committed: false,
        })
    }

    /// Return the function to Empty, closing the registry's handle record.
    /// Used when new source is written. An in-flight build is left alone;
    /// it commits the outcome of the snapshot it took.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        if !matches!(*state, FunctionState::Compiling) {
            *state = FunctionState::Empty;
        }
    }

    /// Block until the function is not Compiling, then report the outcome.
    ///
    /// The handle inside [`Resolution::Loaded`] is duplicated under the
    /// state lock, so concurrent waiters all observe the same committed
    /// handle or the same failure.
    pub fn wait_resolved(&self) -> io::Result<Resolution> {
        let mut state = self.state.lock();
        while matches!(*state, FunctionState::Compiling) {
            self.resolved.wait(&mut state);
        }
        match &*state {
            FunctionState::Loaded(handle) => Ok(Resolution::Loaded(handle.try_clone()?)),
            FunctionState::Error(diag) => Ok(Resolution::Failed(diag.clone())),
            FunctionState::Empty => Ok(Resolution::NotBuilt),
            FunctionState::Compiling => unreachable!("woken while still compiling"),
        }
    }
}

/// Exclusive right to run one build for one function.
///
/// Dropping an uncommitted lease (a panicking build path) reverts the
/// function to Empty so it stays retryable.
pub struct BuildLease<'a> {
    record: &'a FunctionRecord,
    committed: bool,
}

impl BuildLease<'_> {
    pub fn record(&self) -> &FunctionRecord {
        self.record
    }

    /// Publish a successful build: state becomes Loaded, waiters wake.
    pub fn commit_loaded(mut self, handle: ProgHandle) {
        self.committed = true;
        let mut state = self.record.state.lock();
        log::info!("{}: loaded as program {}", self.record.path(), handle.id());
        *state = FunctionState::Loaded(handle);
        drop(state);
        self.record.resolved.notify_all();
    }

    /// Publish a failed build: state becomes Error with the diagnostic,
    /// waiters wake. The function remains retryable via a new source write.
    pub fn commit_error(mut self, diagnostic: String) {
        self.committed = true;
        let mut state = self.record.state.lock();
        log::info!("{}: build failed", self.record.path());
        *state = FunctionState::Error(diagnostic);
        drop(state);
        self.record.resolved.notify_all();
    }
}

impl Drop for BuildLease<'_> {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let mut state = self.record.state.lock();
        if matches!(*state, FunctionState::Compiling) {
            *state = FunctionState::Empty;
        }
        drop(state);
        self.record.resolved.notify_all();
        log::warn!("{}: build abandoned without commit", self.record.path());
    }
}

// =============================================================================
// ObjectRecord
// =============================================================================

/// A namespace grouping functions, with one pending source text.
pub struct ObjectRecord {
    name: String,
    source: Mutex<String>,
    functions: Mutex<BTreeMap<String, Arc<FunctionRecord>>>,
    tables: Mutex<Vec<String>>,
}

impl ObjectRecord {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            source: Mutex::new(String::new()),
            functions: Mutex::new(BTreeMap::new()),
            tables: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current pending source text.
    pub fn source(&self) -> String {
        self.source.lock().clone()
    }

    /// Replace the pending source. Every function that is not mid-build
    /// returns to Empty: its previous build was made from text that no
    /// longer exists, and its registry handle record is invalidated. Table
    /// declarations from the superseded source go with it.
    pub fn set_source(&self, text: String) {
        *self.source.lock() = text;
        self.tables.lock().clear();
        for function in self.functions.lock().values() {
            function.reset();
        }
    }

    /// Table names declared by the most recent successful compile.
    pub fn tables(&self) -> Vec<String> {
        self.tables.lock().clone()
    }

    /// Record the table declarations of a successful compile.
    pub fn set_tables(&self, tables: Vec<String>) {
        *self.tables.lock() = tables;
    }

    pub fn function(&self, name: &str) -> Option<Arc<FunctionRecord>> {
        self.functions.lock().get(name).cloned()
    }

    /// Fetch or create the record for a named function.
    pub fn get_or_create_function(&self, name: &str) -> Arc<FunctionRecord> {
        self.functions
            .lock()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(FunctionRecord::new(&self.name, name)))
            .clone()
    }

    pub fn function_names(&self) -> Vec<String> {
        self.functions.lock().keys().cloned().collect()
    }

    /// Whether any function of this object currently holds a loaded program.
    pub fn any_loaded(&self) -> bool {
        self.functions
            .lock()
            .values()
            .any(|f| f.state_kind() == StateKind::Loaded)
    }
}

// =============================================================================
// Registry
// =============================================================================

/// Root of the registry: object name to record.
///
/// The map lock is held only for lookup and insert; all build and wait
/// traffic goes through the per-function locks.
pub struct Registry {
    objects: Mutex<BTreeMap<String, Arc<ObjectRecord>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(BTreeMap::new()),
        }
    }

    /// Fetch or create an object record. The boolean is true when the
    /// object was created by this call.
    pub fn get_or_create_object(&self, name: &str) -> (Arc<ObjectRecord>, bool) {
        let mut objects = self.objects.lock();
        if let Some(existing) = objects.get(name) {
            return (existing.clone(), false);
        }
        let record = Arc::new(ObjectRecord::new(name));
        objects.insert(name.to_string(), record.clone());
        log::debug!("created object '{}'", name);
        (record, true)
    }

    pub fn object(&self, name: &str) -> Option<Arc<ObjectRecord>> {
        self.objects.lock().get(name).cloned()
    }

    /// Explicit teardown. Handles held by removed records are closed;
    /// transferred duplicates stay alive with their owners.
    pub fn remove_object(&self, name: &str) -> Option<Arc<ObjectRecord>> {
        let removed = self.objects.lock().remove(name);
        if removed.is_some() {
            log::debug!("removed object '{}'", name);
        }
        removed
    }

    pub fn object_names(&self) -> Vec<String> {
        self.objects.lock().keys().cloned().collect()
    }

    /// Look up a function record without creating it.
    pub fn function(&self, object: &str, name: &str) -> Option<Arc<FunctionRecord>> {
        self.object(object)?.function(name)
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
