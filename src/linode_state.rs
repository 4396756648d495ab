//! Resource handles and persisted state.
//!
//! Unique responsibility: track which remote entity each local declaration is
//! bound to, and persist that binding between runs.
//!
//! Non-goals:
//! - Call the Linode API (done by `linode_reconciler.rs`).
//! - Persist attributes. Only the identifier survives a run; everything else is
//!   re-read from the API.
//!
//! Invariants:
//! - A bound handle refers to exactly one remote entity.
//! - No two recorded handles refer to the same remote identifier.
//! - A handle whose create did not finish (`Creating { partial: true }`) is
//!   persisted as tainted and only a delete clears it.
//!
//! Expected integration:
//! 1) Load state (`JsonFileStateStore`)
//! 2) `state.handle(name, descriptor)` => `ResourceHandle`
//! 3) Drive the handle with a `Reconciler`
//! 4) `state.record(name, &handle, now_ms)` then save

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use thiserror::Error;

use crate::linode_descriptor::{Attributes, ResourceDescriptor};

/// State file format version.
const STATE_FORMAT_VERSION: u32 = 1;

/// Newtype for remote identifiers (avoids confusion with arbitrary strings).
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(String);

impl ResourceId {
    /// Create a new `ResourceId` from a string.
    #[must_use]
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Get the string representation of the `ResourceId`.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ResourceId").field(&self.0).finish()
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle phase of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlePhase {
    /// Not bound to any remote entity.
    Absent,
    /// Create in progress. `partial` is true once the remote entity exists but
    /// its readiness has not been confirmed.
    Creating {
        /// Whether a remote entity was provisioned.
        partial: bool,
    },
    /// Bound and confirmed.
    Ready,
    /// Update in progress.
    Updating,
    /// Delete in progress.
    Deleting,
}

impl fmt::Display for HandlePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Absent => write!(f, "absent"),
            Self::Creating { partial: false } => write!(f, "creating"),
            Self::Creating { partial: true } => write!(f, "creating (partial)"),
            Self::Ready => write!(f, "ready"),
            Self::Updating => write!(f, "updating"),
            Self::Deleting => write!(f, "deleting"),
        }
    }
}

/// A remote entity as last observed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteResource {
    /// Remote identifier.
    pub id: ResourceId,
    /// Attributes last read from the API (empty until the first read).
    pub attributes: Attributes,
}

/// Binds one local declaration to at most one remote entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    kind: &'static str,
    remote: Option<RemoteResource>,
    phase: HandlePhase,
}

impl ResourceHandle {
    /// A handle that is not yet created.
    #[must_use]
    pub const fn absent(kind: &'static str) -> Self {
        Self {
            kind,
            remote: None,
            phase: HandlePhase::Absent,
        }
    }

    /// A handle bound to an existing remote entity.
    #[must_use]
    pub fn bound(kind: &'static str, id: ResourceId) -> Self {
        Self {
            kind,
            remote: Some(RemoteResource {
                id,
                attributes: Attributes::new(),
            }),
            phase: HandlePhase::Ready,
        }
    }

    /// A handle whose remote entity exists but never became ready.
    #[must_use]
    pub fn tainted(kind: &'static str, id: ResourceId) -> Self {
        Self {
            phase: HandlePhase::Creating { partial: true },
            ..Self::bound(kind, id)
        }
    }

    /// Resource kind this handle belongs to.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        self.kind
    }

    /// Remote identifier, if bound.
    #[must_use]
    pub fn id(&self) -> Option<&ResourceId> {
        self.remote.as_ref().map(|r| &r.id)
    }

    /// Last observed attributes, if bound.
    #[must_use]
    pub fn observed(&self) -> Option<&Attributes> {
        self.remote.as_ref().map(|r| &r.attributes)
    }

    /// Remote entity, if bound.
    #[must_use]
    pub const fn remote(&self) -> Option<&RemoteResource> {
        self.remote.as_ref()
    }

    /// Current lifecycle phase.
    #[must_use]
    pub const fn phase(&self) -> HandlePhase {
        self.phase
    }

    /// Whether the handle is unbound.
    #[must_use]
    pub const fn is_absent(&self) -> bool {
        self.remote.is_none()
    }

    /// Whether a remote entity exists whose create never completed.
    #[must_use]
    pub const fn is_tainted(&self) -> bool {
        matches!(self.phase, HandlePhase::Creating { partial: true })
    }

    pub(crate) const fn set_phase(&mut self, phase: HandlePhase) {
        self.phase = phase;
    }

    /// Bind a freshly created remote entity. The handle stays in
    /// `Creating { partial: true }` until readiness is confirmed.
    pub(crate) fn bind(&mut self, id: ResourceId) {
        self.remote = Some(RemoteResource {
            id,
            attributes: Attributes::new(),
        });
        self.phase = HandlePhase::Creating { partial: true };
    }

    pub(crate) fn observe(&mut self, attributes: Attributes) {
        if let Some(remote) = self.remote.as_mut() {
            remote.attributes = attributes;
        }
    }

    pub(crate) fn clear(&mut self) {
        self.remote = None;
        self.phase = HandlePhase::Absent;
    }
}

/// Persisted binding of one declaration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedHandle {
    /// Resource kind.
    pub kind: String,
    /// Remote identifier.
    pub id: ResourceId,
    /// Create never completed; the entity must be deleted before re-creation.
    #[serde(default)]
    pub tainted: bool,
}

/// Persistent state of every managed resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderState {
    /// Format version for state serialization.
    pub format_version: u32,
    /// Bindings keyed by logical resource name.
    pub resources: BTreeMap<String, PersistedHandle>,
    /// Last local update timestamp (ms).
    pub last_updated_ms: u64,
}

impl Default for ProviderState {
    fn default() -> Self {
        Self::new(0)
    }
}

impl ProviderState {
    /// Create a new empty state.
    #[must_use]
    pub const fn new(now_ms: u64) -> Self {
        Self {
            format_version: STATE_FORMAT_VERSION,
            resources: BTreeMap::new(),
            last_updated_ms: now_ms,
        }
    }

    /// Rebuild the handle recorded under `name`.
    ///
    /// # Errors
    ///
    /// Returns `KindMismatch` if `name` was recorded for another resource kind.
    pub fn handle(
        &self,
        name: &str,
        descriptor: &ResourceDescriptor,
    ) -> Result<ResourceHandle, StateStoreError> {
        let kind = descriptor.kind();
        let Some(persisted) = self.resources.get(name) else {
            return Ok(ResourceHandle::absent(kind));
        };
        if persisted.kind != kind {
            return Err(StateStoreError::KindMismatch {
                name: name.to_string(),
                recorded: persisted.kind.clone(),
                requested: kind,
            });
        }
        let id = persisted.id.clone();
        Ok(if persisted.tainted {
            ResourceHandle::tainted(kind, id)
        } else {
            ResourceHandle::bound(kind, id)
        })
    }

    /// Record the current binding of `handle` under `name`.
    ///
    /// An absent handle removes the record.
    ///
    /// # Errors
    ///
    /// Returns `DuplicateId` if another name already holds the same remote entity.
    pub fn record(
        &mut self,
        name: &str,
        handle: &ResourceHandle,
        now_ms: u64,
    ) -> Result<(), StateStoreError> {
        self.last_updated_ms = now_ms;

        let Some(id) = handle.id() else {
            self.resources.remove(name);
            return Ok(());
        };

        if let Some((other, _)) = self
            .resources
            .iter()
            .find(|(other, p)| other.as_str() != name && p.kind == handle.kind() && &p.id == id)
        {
            return Err(StateStoreError::DuplicateId {
                id: id.clone(),
                existing: other.clone(),
                requested: name.to_string(),
            });
        }

        self.resources.insert(
            name.to_string(),
            PersistedHandle {
                kind: handle.kind().to_string(),
                id: id.clone(),
                tainted: handle.is_tainted(),
            },
        );
        Ok(())
    }
}

/// Errors for state store operations.
#[derive(Debug, Error)]
pub enum StateStoreError {
    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// Serialization error.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// Invalid state.
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
    /// Two names would share one remote entity.
    #[error("{id} is already bound to {existing:?}, cannot bind it to {requested:?}")]
    DuplicateId {
        /// The contested identifier.
        id: ResourceId,
        /// Name already holding it.
        existing: String,
        /// Name that asked for it.
        requested: String,
    },
    /// Name was recorded for another resource kind.
    #[error("{name:?} is recorded as {recorded}, not {requested}")]
    KindMismatch {
        /// Logical name.
        name: String,
        /// Kind found in the state file.
        recorded: String,
        /// Kind asked for.
        requested: &'static str,
    },
}

/// Trait for persisting provider state.
pub trait StateStore {
    /// Load the state from storage.
    ///
    /// # Errors
    ///
    /// Returns an error if loading fails (I/O, parsing, or validation).
    fn load(&self) -> Result<Option<ProviderState>, StateStoreError>;
    /// Save the state to storage.
    ///
    /// # Errors
    ///
    /// Returns an error if saving fails (I/O, serialization, or validation).
    fn save(&self, state: &ProviderState) -> Result<(), StateStoreError>;
}

/// File-based JSON state store with safe atomic writes.
#[derive(Debug, Clone)]
pub struct JsonFileStateStore {
    path: PathBuf,
}

impl JsonFileStateStore {
    /// Create a new JSON file state store.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Get the path to the state file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Get the default path from environment or fallback.
    ///
    /// Env: `LINODE_STATE_PATH` (default: `.linode_state.json`)
    #[must_use]
    pub fn default_path() -> PathBuf {
        if let Some(p) = std::env::var_os("LINODE_STATE_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from(".linode_state.json")
    }

    fn ensure_parent_dir(&self) -> Result<(), io::Error> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        Ok(())
    }
}

impl StateStore for JsonFileStateStore {
    fn load(&self) -> Result<Option<ProviderState>, StateStoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let bytes = fs::read(&self.path)?;
        let state: ProviderState = serde_json::from_slice(&bytes)?;
        if state.format_version != STATE_FORMAT_VERSION {
            return Err(StateStoreError::InvalidState(
                "unsupported state format version",
            ));
        }
        if state.resources.values().any(|p| p.id.as_str().is_empty()) {
            return Err(StateStoreError::InvalidState("empty resource id"));
        }
        tracing::debug!(path = %self.path.display(), resources = state.resources.len(), "loaded state");
        Ok(Some(state))
    }

    fn save(&self, state: &ProviderState) -> Result<(), StateStoreError> {
        if state.format_version != STATE_FORMAT_VERSION {
            return Err(StateStoreError::InvalidState("wrong state format version"));
        }

        self.ensure_parent_dir()?;

        // Write to temp file in same directory for atomic rename.
        let mut tmp = self.path.clone();
        let tmp_name = format!(
            ".{}.tmp",
            self.path
                .file_name()
                .and_then(|s| s.to_str())
                .unwrap_or("linode_state")
        );
        tmp.set_file_name(tmp_name);

        let json = serde_json::to_vec_pretty(state)?;

        {
            let mut f = fs::File::create(&tmp)?;
            f.write_all(&json)?;
            f.sync_all()?;
        }

        replace_file(&tmp, &self.path)?;

        tracing::debug!(path = %self.path.display(), resources = state.resources.len(), "saved state");
        Ok(())
    }
}

/// Move `tmp` over `path`. The previous file stays in place until the rename.
#[cfg(not(windows))]
fn replace_file(tmp: &Path, path: &Path) -> io::Result<()> {
    fs::rename(tmp, path)
}

/// Windows refuses to rename over an existing file, so the old one goes first.
#[cfg(windows)]
fn replace_file(tmp: &Path, path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }
    fs::rename(tmp, path)
}

/// Utility: current timestamp in milliseconds since UNIX epoch.
#[must_use]
pub fn now_unix_ms() -> u64 {
    let Ok(dur) = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) else {
        return 0;
    };
    u64::try_from(dur.as_millis()).unwrap_or(u64::MAX)
}
