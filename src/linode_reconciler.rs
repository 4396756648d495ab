//! Reconciler.
//!
//! Unique responsibility: drive one `ResourceHandle` through
//! Create / Read / Update / Delete / Import for a single resource kind, using the
//! descriptor to validate, the diff engine to decide, and the poller to wait.
//!
//! Handle state machine:
//! `Absent -> Creating -> Ready -> Updating -> Ready -> Deleting -> Absent`.
//! A replacement goes `Ready -> Deleting -> Absent -> Creating`. A create that
//! fails after the remote entity exists leaves the handle in
//! `Creating { partial: true }`; only a delete clears it.
//!
//! Operations on one handle must be serialized by the caller. Distinct handles
//! may be reconciled concurrently with the same client.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::Instrument;

use crate::linode_client::LinodeApi;
use crate::linode_config::ReconcilerConfig;
use crate::linode_descriptor::{Attributes, ValidationError};
use crate::linode_diff::{ChangeSet, diff};
use crate::linode_poller::{Clock, PollRequest, Poller, Retryable, WaitOutcome};
use crate::linode_resources::{Readiness, ResourceError, ResourceKind};
use crate::linode_state::{HandlePhase, ResourceHandle, ResourceId};

// ============================================================================
// Error types
// ============================================================================

/// Lifecycle operation, attached to errors for diagnosis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Create.
    Create,
    /// Read.
    Read,
    /// Update.
    Update,
    /// Delete.
    Delete,
    /// Import.
    Import,
    /// Readiness wait.
    Wait,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Create => write!(f, "create"),
            Self::Read => write!(f, "read"),
            Self::Update => write!(f, "update"),
            Self::Delete => write!(f, "delete"),
            Self::Import => write!(f, "import"),
            Self::Wait => write!(f, "wait"),
        }
    }
}

/// What a caller can branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Rejected locally before any remote call.
    Validation,
    /// Remote entity absent.
    NotFound,
    /// Remote failure that may clear up on retry.
    Transient,
    /// Readiness condition unmet within the deadline.
    Timeout,
    /// Cancellation requested.
    Canceled,
    /// Change needs delete-then-create.
    ReplaceRequired,
    /// Remote entity exists but its create did not complete.
    PartialFailure,
    /// Anything else.
    Fatal,
}

/// Error returned by reconciler operations.
#[derive(Debug, Error)]
pub enum ReconcileError {
    /// Desired state or identifier rejected locally.
    #[error("{kind}: invalid desired state")]
    Validation {
        /// Resource kind.
        kind: &'static str,
        /// What was wrong.
        #[source]
        source: ValidationError,
    },
    /// Handle belongs to another resource kind.
    #[error("handle of kind {found} passed to the {expected} reconciler")]
    KindMismatch {
        /// Kind the reconciler manages.
        expected: &'static str,
        /// Kind of the handle.
        found: &'static str,
    },
    /// Create called on a handle that is already bound.
    #[error("{kind} {id}: handle is already bound")]
    HandleInUse {
        /// Resource kind.
        kind: &'static str,
        /// Bound identifier.
        id: ResourceId,
    },
    /// Operation needs a bound handle.
    #[error("{kind}: cannot {operation} an absent handle")]
    HandleAbsent {
        /// Resource kind.
        kind: &'static str,
        /// Attempted operation.
        operation: Operation,
    },
    /// Handle holds a partially created entity that must be deleted first.
    #[error("{kind} {id}: create never completed, delete it first")]
    Tainted {
        /// Resource kind.
        kind: &'static str,
        /// Identifier of the partial entity.
        id: ResourceId,
    },
    /// Remote entity is gone.
    #[error("{kind} {id}: not found during {operation}")]
    NotFound {
        /// Resource kind.
        kind: &'static str,
        /// Identifier looked up.
        id: ResourceId,
        /// Operation in progress.
        operation: Operation,
    },
    /// Import target does not exist.
    #[error("{kind} {id}: nothing to import")]
    ImportNotFound {
        /// Resource kind.
        kind: &'static str,
        /// External identifier.
        id: ResourceId,
    },
    /// Force-new attributes changed.
    #[error("{kind} {id}: changing {attributes:?} requires replacement")]
    ReplaceRequired {
        /// Resource kind.
        kind: &'static str,
        /// Identifier of the entity to replace.
        id: ResourceId,
        /// Changed force-new attributes.
        attributes: Vec<String>,
    },
    /// Readiness condition not met in time.
    #[error("{kind} {}: gave up waiting for {condition} after {waited:?}", show(.id))]
    Timeout {
        /// Resource kind.
        kind: &'static str,
        /// Identifier, if the entity exists yet.
        id: Option<ResourceId>,
        /// Condition waited on.
        condition: String,
        /// Time spent waiting.
        waited: Duration,
    },
    /// Wait canceled.
    #[error("{kind} {}: canceled while waiting for {condition} after {waited:?}", show(.id))]
    Canceled {
        /// Resource kind.
        kind: &'static str,
        /// Identifier, if the entity exists yet.
        id: Option<ResourceId>,
        /// Condition waited on.
        condition: String,
        /// Time spent waiting.
        waited: Duration,
    },
    /// Remote call failed.
    #[error("{kind} {}: {operation} failed", show(.id))]
    Api {
        /// Resource kind.
        kind: &'static str,
        /// Identifier, if known.
        id: Option<ResourceId>,
        /// Operation in progress.
        operation: Operation,
        /// Underlying failure.
        #[source]
        source: ResourceError,
    },
    /// Create did not complete.
    #[error("{kind} {}: create failed (partial: {partial})", show(.id))]
    CreateFailed {
        /// Resource kind.
        kind: &'static str,
        /// Identifier of the remote entity, if one was provisioned.
        id: Option<ResourceId>,
        /// Whether a remote entity exists and must be cleaned up.
        partial: bool,
        /// Stage that failed.
        #[source]
        source: Box<ReconcileError>,
    },
}

fn show(id: &Option<ResourceId>) -> &str {
    id.as_ref().map_or("<unbound>", ResourceId::as_str)
}

impl ReconcileError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Validation { .. }
            | Self::KindMismatch { .. }
            | Self::HandleInUse { .. }
            | Self::HandleAbsent { .. } => ErrorKind::Validation,
            Self::Tainted { .. } | Self::CreateFailed { partial: true, .. } => {
                ErrorKind::PartialFailure
            }
            Self::CreateFailed { source, .. } => source.kind(),
            Self::NotFound { .. } | Self::ImportNotFound { .. } => ErrorKind::NotFound,
            Self::ReplaceRequired { .. } => ErrorKind::ReplaceRequired,
            Self::Timeout { .. } => ErrorKind::Timeout,
            Self::Canceled { .. } => ErrorKind::Canceled,
            Self::Api { source, .. } => match source {
                ResourceError::Validation(_) => ErrorKind::Validation,
                ResourceError::Api(e) if e.is_not_found() => ErrorKind::NotFound,
                ResourceError::Api(e) if e.is_transient() => ErrorKind::Transient,
                ResourceError::Api(_) => ErrorKind::Fatal,
            },
        }
    }

    /// Remote identifier involved, if any.
    #[must_use]
    pub const fn id(&self) -> Option<&ResourceId> {
        match self {
            Self::HandleInUse { id, .. }
            | Self::Tainted { id, .. }
            | Self::NotFound { id, .. }
            | Self::ImportNotFound { id, .. }
            | Self::ReplaceRequired { id, .. } => Some(id),
            Self::Timeout { id, .. }
            | Self::Canceled { id, .. }
            | Self::Api { id, .. }
            | Self::CreateFailed { id, .. } => id.as_ref(),
            Self::Validation { .. } | Self::KindMismatch { .. } | Self::HandleAbsent { .. } => {
                None
            }
        }
    }
}

// ============================================================================
// Results
// ============================================================================

/// Result of a `read`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum ReadOutcome {
    /// Entity exists; the handle holds its fresh attributes.
    Found,
    /// Entity was removed out-of-band; the handle was cleared.
    Gone,
}

/// What `apply` did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyAction {
    /// A new entity was created.
    Created,
    /// The entity was updated in place.
    Updated,
    /// The entity was deleted and created again.
    Replaced,
    /// Nothing to do.
    Unchanged,
}

impl fmt::Display for ApplyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Updated => write!(f, "updated"),
            Self::Replaced => write!(f, "replaced"),
            Self::Unchanged => write!(f, "unchanged"),
        }
    }
}

// ============================================================================
// Reconciler
// ============================================================================

/// Lifecycle driver for one resource kind.
pub struct Reconciler<K> {
    api: Arc<dyn LinodeApi>,
    kind: K,
    poller: Poller,
    cfg: ReconcilerConfig,
    cancel: Option<watch::Receiver<bool>>,
}

impl<K: ResourceKind> Reconciler<K> {
    /// Create a reconciler on the given client.
    #[must_use]
    pub fn new(api: Arc<dyn LinodeApi>, kind: K, cfg: ReconcilerConfig) -> Self {
        Self {
            api,
            kind,
            poller: Poller::default(),
            cfg,
            cancel: None,
        }
    }

    /// Use `clock` for readiness waits.
    #[must_use]
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.poller = Poller::new(clock);
        self
    }

    /// Stop readiness waits once `cancel` holds `true`.
    #[must_use]
    pub fn with_cancellation(mut self, cancel: watch::Receiver<bool>) -> Self {
        self.cancel = Some(cancel);
        self
    }

    /// The managed resource kind.
    #[must_use]
    pub const fn resource(&self) -> &K {
        &self.kind
    }

    /// Reconciler configuration.
    #[must_use]
    pub const fn config(&self) -> &ReconcilerConfig {
        &self.cfg
    }

    fn kind_name(&self) -> &'static str {
        self.kind.descriptor().kind()
    }

    fn check_handle(&self, handle: &ResourceHandle) -> Result<(), ReconcileError> {
        let expected = self.kind_name();
        if handle.kind() != expected {
            return Err(ReconcileError::KindMismatch {
                expected,
                found: handle.kind(),
            });
        }
        Ok(())
    }

    fn validate(&self, desired: &Attributes) -> Result<(), ReconcileError> {
        self.kind
            .descriptor()
            .validate(desired)
            .map_err(|source| self.invalid(source))
    }

    fn invalid(&self, source: ValidationError) -> ReconcileError {
        ReconcileError::Validation {
            kind: self.kind.descriptor().kind(),
            source,
        }
    }

    fn lift(&self, operation: Operation, id: Option<&ResourceId>, err: ResourceError) -> ReconcileError {
        let kind = self.kind_name();
        match (err, id) {
            (ResourceError::Validation(source), _) => ReconcileError::Validation { kind, source },
            (err, Some(id)) if err.is_not_found() => ReconcileError::NotFound {
                kind,
                id: id.clone(),
                operation,
            },
            (source, id) => ReconcileError::Api {
                kind,
                id: id.cloned(),
                operation,
                source,
            },
        }
    }

    /// Wait until `readiness` holds, bounded by the create timeout.
    async fn await_ready(
        &self,
        readiness: &Readiness,
        id: Option<&ResourceId>,
    ) -> Result<(), ReconcileError> {
        let kind = self.kind_name();
        let mut request = PollRequest::new(self.cfg.poll_interval(), self.cfg.create_timeout());
        if let Some(cancel) = &self.cancel {
            request = request.with_cancel(cancel.clone());
        }

        let api = self.api.as_ref();
        let span = tracing::info_span!("wait", kind, condition = %readiness);
        let outcome = self
            .poller
            .wait(
                &request,
                || readiness.observe(api),
                |status| readiness.is_met(*status),
            )
            .instrument(span)
            .await;

        match outcome {
            WaitOutcome::Satisfied(_) => Ok(()),
            WaitOutcome::TimedOut { waited } => Err(ReconcileError::Timeout {
                kind,
                id: id.cloned(),
                condition: readiness.to_string(),
                waited,
            }),
            WaitOutcome::Canceled { waited } => Err(ReconcileError::Canceled {
                kind,
                id: id.cloned(),
                condition: readiness.to_string(),
                waited,
            }),
            WaitOutcome::Fatal(e) => Err(self.lift(Operation::Wait, id, e.into())),
        }
    }

    /// Create the remote entity for an absent handle.
    ///
    /// The identifier is bound to `handle` as soon as the create call returns,
    /// before any post-create wait.
    ///
    /// # Errors
    ///
    /// `HandleInUse` if the handle is bound. Any later failure is returned as
    /// `CreateFailed`; with `partial: true` the handle keeps the identifier and
    /// stays tainted until deleted.
    pub async fn create(
        &self,
        handle: &mut ResourceHandle,
        desired: &Attributes,
    ) -> Result<(), ReconcileError> {
        self.check_handle(handle)?;
        let kind = self.kind_name();
        if let Some(id) = handle.id() {
            return Err(ReconcileError::HandleInUse {
                kind,
                id: id.clone(),
            });
        }

        handle.set_phase(HandlePhase::Creating { partial: false });
        match self.create_steps(handle, desired).await {
            Ok(()) => Ok(()),
            Err(source) => {
                let id = handle.id().cloned();
                let partial = id.is_some();
                if partial {
                    tracing::warn!(kind, id = show(&id), error = %source, "create left a partial entity");
                } else {
                    handle.clear();
                    tracing::warn!(kind, error = %source, "create failed");
                }
                Err(ReconcileError::CreateFailed {
                    kind,
                    id,
                    partial,
                    source: Box::new(source),
                })
            }
        }
    }

    async fn create_steps(
        &self,
        handle: &mut ResourceHandle,
        desired: &Attributes,
    ) -> Result<(), ReconcileError> {
        let kind = self.kind_name();
        let descriptor = self.kind.descriptor();
        self.validate(desired)?;

        if let Some(readiness) = self.kind.prerequisite(desired).map_err(|e| self.invalid(e))? {
            tracing::info!(kind, condition = %readiness, "waiting on prerequisite");
            self.await_ready(&readiness, None).await?;
        }

        let id = self
            .kind
            .create(self.api.as_ref(), desired)
            .await
            .map(ResourceId::new)
            .map_err(|e| self.lift(Operation::Create, None, e))?;
        handle.bind(id.clone());
        tracing::info!(kind, id = %id, "remote entity created");

        if let Some(readiness) = self
            .kind
            .post_create(desired, id.as_str())
            .map_err(|e| self.invalid(e))?
        {
            tracing::info!(kind, id = %id, condition = %readiness, "waiting for new entity");
            self.await_ready(&readiness, Some(&id)).await?;
        }

        let fetched = self
            .kind
            .fetch(self.api.as_ref(), id.as_str())
            .await
            .map_err(|e| self.lift(Operation::Read, Some(&id), e))?;
        handle.observe(descriptor.normalize(Some(desired), fetched));
        handle.set_phase(HandlePhase::Ready);
        tracing::info!(kind, id = %id, "create complete");
        Ok(())
    }

    /// Refresh the handle from the API.
    ///
    /// An entity removed out-of-band is not an error: the handle is cleared and
    /// `ReadOutcome::Gone` is returned.
    ///
    /// # Errors
    ///
    /// `HandleAbsent` for an unbound handle, otherwise the failed API call.
    pub async fn read(&self, handle: &mut ResourceHandle) -> Result<ReadOutcome, ReconcileError> {
        self.check_handle(handle)?;
        let kind = self.kind_name();
        let Some(id) = handle.id().cloned() else {
            return Err(ReconcileError::HandleAbsent {
                kind,
                operation: Operation::Read,
            });
        };

        match self.kind.fetch(self.api.as_ref(), id.as_str()).await {
            Ok(fetched) => {
                let merged = self.kind.descriptor().normalize(handle.observed(), fetched);
                handle.observe(merged);
                Ok(ReadOutcome::Found)
            }
            Err(e) if e.is_not_found() => {
                tracing::warn!(kind, id = %id, "remote entity gone, clearing handle");
                handle.clear();
                Ok(ReadOutcome::Gone)
            }
            Err(e) => Err(self.lift(Operation::Read, Some(&id), e)),
        }
    }

    /// Apply the difference between `desired` and `previous` in place.
    ///
    /// Only changed updatable attributes are sent, in a single call. An empty
    /// change set issues no remote call.
    ///
    /// # Errors
    ///
    /// `ReplaceRequired` if a force-new attribute changed (nothing is sent),
    /// `NotFound` if the entity is gone (the handle is cleared), `Tainted` for a
    /// partially created handle.
    pub async fn update(
        &self,
        handle: &mut ResourceHandle,
        desired: &Attributes,
        previous: &Attributes,
    ) -> Result<ChangeSet, ReconcileError> {
        self.check_handle(handle)?;
        let kind = self.kind_name();
        let descriptor = self.kind.descriptor();
        let Some(id) = handle.id().cloned() else {
            return Err(ReconcileError::HandleAbsent {
                kind,
                operation: Operation::Update,
            });
        };
        if handle.is_tainted() {
            return Err(ReconcileError::Tainted { kind, id });
        }
        self.validate(desired)?;

        let changes = diff(descriptor, desired, previous).map_err(|e| self.invalid(e))?;
        if changes.needs_replace() {
            return Err(ReconcileError::ReplaceRequired {
                kind,
                id,
                attributes: changes.requires_replace().iter().cloned().collect(),
            });
        }
        if changes.is_empty() {
            tracing::debug!(kind, id = %id, "no changes");
            return Ok(changes);
        }

        let payload = changes.payload(descriptor, desired);
        tracing::info!(kind, id = %id, changed = ?changes.changed(), "updating");
        handle.set_phase(HandlePhase::Updating);

        let api = self.api.as_ref();
        let refreshed = match self.kind.update(api, id.as_str(), &payload).await {
            Ok(()) => self
                .kind
                .fetch(api, id.as_str())
                .await
                .map_err(|e| (Operation::Read, e)),
            Err(e) => Err((Operation::Update, e)),
        };

        match refreshed {
            Ok(fetched) => {
                handle.observe(descriptor.normalize(Some(desired), fetched));
                handle.set_phase(HandlePhase::Ready);
                Ok(changes)
            }
            Err((operation, e)) => {
                if e.is_not_found() {
                    tracing::warn!(kind, id = %id, "remote entity gone, clearing handle");
                    handle.clear();
                } else {
                    handle.set_phase(HandlePhase::Ready);
                }
                Err(self.lift(operation, Some(&id), e))
            }
        }
    }

    /// Delete the remote entity and clear the handle.
    ///
    /// Deleting an absent handle, or an entity already removed out-of-band,
    /// succeeds.
    ///
    /// # Errors
    ///
    /// The failed API call; the handle keeps its identifier and phase.
    pub async fn delete(&self, handle: &mut ResourceHandle) -> Result<(), ReconcileError> {
        self.check_handle(handle)?;
        let kind = self.kind_name();
        let Some(id) = handle.id().cloned() else {
            tracing::debug!(kind, "nothing to delete");
            return Ok(());
        };

        let previous = handle.phase();
        handle.set_phase(HandlePhase::Deleting);
        match self.kind.delete(self.api.as_ref(), id.as_str()).await {
            Ok(()) => {
                handle.clear();
                tracing::info!(kind, id = %id, "deleted");
                Ok(())
            }
            Err(e) if e.is_not_found() => {
                handle.clear();
                tracing::info!(kind, id = %id, "already deleted");
                Ok(())
            }
            Err(e) => {
                handle.set_phase(previous);
                Err(self.lift(Operation::Delete, Some(&id), e))
            }
        }
    }

    /// Adopt an existing remote entity.
    ///
    /// # Errors
    ///
    /// `ImportNotFound` if no entity has this identifier, `Validation` if the
    /// identifier is malformed for this kind.
    pub async fn import(&self, external_id: &str) -> Result<ResourceHandle, ReconcileError> {
        let kind = self.kind_name();
        let raw = external_id.trim();
        if raw.is_empty() {
            return Err(self.invalid(ValidationError::MalformedId {
                kind,
                id: external_id.to_string(),
                reason: "identifier is empty",
            }));
        }

        let id = ResourceId::new(raw);
        let mut handle = ResourceHandle::bound(kind, id.clone());
        match self.read(&mut handle).await {
            Ok(ReadOutcome::Found) => {
                tracing::info!(kind, id = %id, "imported");
                Ok(handle)
            }
            Ok(ReadOutcome::Gone) => Err(ReconcileError::ImportNotFound { kind, id }),
            Err(ReconcileError::Api {
                id: failed, source, ..
            }) => Err(ReconcileError::Api {
                kind,
                id: failed,
                operation: Operation::Import,
                source,
            }),
            Err(e) => Err(e),
        }
    }

    /// Converge `handle` on `desired`.
    ///
    /// Creates absent handles (and handles whose entity vanished), replaces
    /// tainted handles and force-new changes, and updates everything else in
    /// place. Settable attributes the API never returns are assumed unchanged.
    ///
    /// # Errors
    ///
    /// The first failing step.
    pub async fn apply(
        &self,
        handle: &mut ResourceHandle,
        desired: &Attributes,
    ) -> Result<ApplyAction, ReconcileError> {
        self.check_handle(handle)?;
        self.validate(desired)?;
        let kind = self.kind_name();

        if handle.is_tainted() {
            tracing::info!(kind, id = ?handle.id(), "replacing partially created entity");
            return self.replace(handle, desired).await;
        }
        if handle.is_absent() {
            self.create(handle, desired).await?;
            return Ok(ApplyAction::Created);
        }
        if self.read(handle).await? == ReadOutcome::Gone {
            self.create(handle, desired).await?;
            return Ok(ApplyAction::Created);
        }

        let observed = handle.observed().cloned().unwrap_or_default();
        let previous = self.kind.descriptor().normalize(Some(desired), observed);
        match self.update(handle, desired, &previous).await {
            Ok(changes) if changes.is_empty() => Ok(ApplyAction::Unchanged),
            Ok(_) => Ok(ApplyAction::Updated),
            Err(ReconcileError::ReplaceRequired { id, attributes, .. }) => {
                tracing::info!(kind, id = %id, ?attributes, "replacing");
                self.replace(handle, desired).await
            }
            Err(e) => Err(e),
        }
    }

    async fn replace(
        &self,
        handle: &mut ResourceHandle,
        desired: &Attributes,
    ) -> Result<ApplyAction, ReconcileError> {
        self.delete(handle).await?;
        self.create(handle, desired).await?;
        Ok(ApplyAction::Replaced)
    }
}
