//! Linode Lifecycle - resource reconciliation library.
//!
//! A library for driving Linode resources (images, SSH keys, templates) from a
//! declared desired state:
//! - **Descriptors**: Typed attribute declarations and validation
//! - **Diffing**: Split changes into in-place updates and replacements
//! - **Readiness**: Bounded, cancellable waits on remote status
//! - **Reconciliation**: Create/Read/Update/Delete/Import for one handle
//! - **State**: Persist the remote identifier of every managed resource
//!
//! ## Quick Start
//!
//! All configuration is loaded from environment variables. Create a `.env` file:
//!
//! ```text
//! LINODE_TOKEN=your_api_token_here
//! LINODE_POLL_INTERVAL_MS=3000
//! LINODE_CREATE_TIMEOUT_MS=1200000
//! ```
//!
//! Then reconcile a resource:
//!
//! ```ignore
//! use std::sync::Arc;
//! use linode_lifecycle::{
//!     Attributes, LinodeClient, LinodeClientConfig, Reconciler, ReconcilerConfig,
//!     ResourceHandle, ResourceKind, SshKeyResource,
//! };
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let api = Arc::new(LinodeClient::new(LinodeClientConfig::from_env()?)?);
//!     let reconciler = Reconciler::new(api, SshKeyResource, ReconcilerConfig::from_env()?);
//!
//!     let desired = Attributes::new()
//!         .with("label", "laptop")
//!         .with("ssh_key", "ssh-ed25519 AAAA... me@laptop");
//!
//!     let mut handle = ResourceHandle::absent(SshKeyResource.descriptor().kind());
//!     let action = reconciler.apply(&mut handle, &desired).await?;
//!     println!("{action}: {:?}", handle.id());
//!
//!     Ok(())
//! }
//! ```

// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy for strict discipline
#![deny(clippy::all)]                 // All standard Clippy lints
#![deny(clippy::pedantic)]            // Very strict Clippy lints
#![deny(clippy::nursery)]             // Experimental lints
#![deny(clippy::unwrap_used)]         // unwrap() is forbidden
#![deny(clippy::expect_used)]         // expect() is forbidden
#![deny(clippy::panic)]               // panic!() is forbidden
#![deny(clippy::print_stdout)]        // println!() is forbidden in production
#![deny(clippy::todo)]                // TODO is forbidden
#![deny(clippy::unimplemented)]       // unimplemented!() is forbidden
#![deny(clippy::missing_const_for_fn)] // Force const when possible
#![deny(clippy::unwrap_in_result)]    // unwrap() in Result is forbidden
#![deny(clippy::module_inception)]    // Module with same name as crate is forbidden
#![deny(clippy::redundant_clone)]     // Useless clones are forbidden
#![deny(clippy::shadow_unrelated)]    // Shadowing unrelated variables is forbidden
#![deny(clippy::too_many_arguments)]  // Limit function arguments
#![deny(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Modules
// ============================================================================

/// Environment-driven configuration for the client and the reconciler.
pub mod linode_config;

/// Typed attribute declarations for a resource kind.
///
/// Use this module to declare attributes and validate desired state.
pub mod linode_descriptor;

/// Change detection between desired and observed attributes.
pub mod linode_diff;

/// Bounded readiness waits with an injectable clock.
///
/// Use this module to poll a remote condition until it holds, times out or is canceled.
pub mod linode_poller;

/// Linode API v4 client adapter.
///
/// Use this module for raw entity calls or to substitute a test double.
pub mod linode_client;

/// Concrete resource kinds: images, SSH keys and templates.
pub mod linode_resources;

/// Resource handles and persisted identifier state.
///
/// Use this module to track which remote entity each declaration is bound to.
pub mod linode_state;

/// Create/Read/Update/Delete/Import orchestration for one handle.
pub mod linode_reconciler;

// ============================================================================
// Re-exports for convenience
// ============================================================================

pub use linode_client::{ApiError, ApiErrorKind, LinodeApi, LinodeClient};
pub use linode_config::{ConfigError, LinodeClientConfig, ReconcilerConfig};
pub use linode_descriptor::{
    AttrValue, AttributeSpec, Attributes, ResourceDescriptor, ValidationError, ValueType,
};
pub use linode_diff::{ChangeSet, diff};
pub use linode_poller::{Clock, ManualClock, PollRequest, Poller, TokioClock, WaitOutcome};
pub use linode_reconciler::{
    ApplyAction, ErrorKind, Operation, ReadOutcome, ReconcileError, Reconciler,
};
pub use linode_resources::{
    ImageResource, Readiness, ResourceError, ResourceKind, SshKeyResource, TemplateResource,
};
pub use linode_state::{
    HandlePhase, JsonFileStateStore, ProviderState, RemoteResource, ResourceHandle, ResourceId,
    StateStore, StateStoreError,
};
