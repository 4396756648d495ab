//! Example binary demonstrating the linode_lifecycle library.
//!
//! Reconciles one SSH key on the current profile and records its id in the
//! state file, so running it twice reuses the same key.
//!
//! ## Usage
//!
//! 1. Create a `.env` file with `LINODE_TOKEN`, `LINODE_SSH_KEY_LABEL` and
//!    `LINODE_SSH_PUBLIC_KEY`
//! 2. Run: `cargo run`
//! 3. Clean up: `LINODE_DESTROY=1 cargo run`

#![allow(clippy::print_stdout)] // Allow println! in the binary example

use std::env;
use std::sync::Arc;

use linode_lifecycle::linode_state::now_unix_ms;
use linode_lifecycle::{
    Attributes, ConfigError, JsonFileStateStore, LinodeApi, LinodeClient, LinodeClientConfig,
    ProviderState, Reconciler, ReconcilerConfig, ResourceKind, SshKeyResource, StateStore,
};
use tracing_subscriber::EnvFilter;

/// Logical name of the managed key in the state file.
const KEY_NAME: &str = "demo_sshkey";

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    // Load configuration from environment
    let client_cfg = LinodeClientConfig::from_env()?;
    let cfg = ReconcilerConfig::from_env()?;
    println!("Configuration loaded:");
    println!("  API: {}", client_cfg.api_url);
    println!("  Poll interval: {} ms", cfg.poll_interval_ms);
    println!("  Create timeout: {} ms", cfg.create_timeout_ms);

    let api: Arc<dyn LinodeApi> = Arc::new(LinodeClient::new(client_cfg)?);
    let reconciler = Reconciler::new(api, SshKeyResource, cfg);

    let store = JsonFileStateStore::new(JsonFileStateStore::default_path());
    let mut state = store
        .load()?
        .unwrap_or_else(|| ProviderState::new(now_unix_ms()));
    let mut handle = state.handle(KEY_NAME, SshKeyResource.descriptor())?;

    let destroy = env::var("LINODE_DESTROY")
        .is_ok_and(|v| matches!(v.trim(), "1" | "true" | "yes"));

    let result = if destroy {
        println!("\nDeleting {KEY_NAME}...");
        reconciler.delete(&mut handle).await.map(|()| None)
    } else {
        let desired = Attributes::new()
            .with("label", required_env("LINODE_SSH_KEY_LABEL")?)
            .with("ssh_key", required_env("LINODE_SSH_PUBLIC_KEY")?);
        println!("\nReconciling {KEY_NAME}...");
        reconciler.apply(&mut handle, &desired).await.map(Some)
    };

    // Recorded even on failure: a partially created key must stay tracked.
    state.record(KEY_NAME, &handle, now_unix_ms())?;
    store.save(&state)?;

    match result? {
        Some(action) => {
            println!("\nSSH key {action}!");
            println!("  ID: {}", handle.id().map_or("-", |id| id.as_str()));
            println!("  Phase: {}", handle.phase());
            if let Some(observed) = handle.observed() {
                for (name, value) in observed.iter() {
                    println!("  {name}: {value}");
                }
            }
        }
        None => println!("\nSSH key deleted."),
    }
    println!("\nState saved to {}", store.path().display());

    Ok(())
}

fn required_env(key: &'static str) -> Result<String, ConfigError> {
    env::var(key)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .ok_or(ConfigError::MissingEnv(key))
}
