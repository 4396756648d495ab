mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{Call, DiskStep, FakeLinode};
use linode_lifecycle::linode_client::{
    DiskStatus, ImageCreateOptions, ImageUpdateOptions, TemplateUpdateOptions,
};
use linode_lifecycle::{
    ApplyAction, Attributes, Clock, ErrorKind, HandlePhase, ImageResource, ManualClock,
    ReadOutcome, ReconcileError, Reconciler, ReconcilerConfig, ResourceHandle, ResourceId,
    ResourceKind, SshKeyResource, TemplateResource,
};
use tokio::sync::watch;

const PUBLIC_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIB0 me@laptop";
const OTHER_KEY: &str = "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIC1 me@desktop";

fn config() -> ReconcilerConfig {
    ReconcilerConfig {
        poll_interval_ms: 1_000,
        create_timeout_ms: 1_200_000,
    }
}

fn reconciler<K: ResourceKind>(
    api: &Arc<FakeLinode>,
    kind: K,
    cfg: ReconcilerConfig,
) -> (Arc<ManualClock>, Reconciler<K>) {
    let clock = Arc::new(ManualClock::new());
    let reconciler = Reconciler::new(api.clone(), kind, cfg).with_clock(clock.clone());
    (clock, reconciler)
}

fn image(label: &str) -> Attributes {
    Attributes::new()
        .with("label", label)
        .with("disk_id", 100_i64)
        .with("linode_id", 10_i64)
}

fn ssh_key(label: &str, key: &str) -> Attributes {
    Attributes::new().with("label", label).with("ssh_key", key)
}

fn id_of(handle: &ResourceHandle) -> Option<&str> {
    handle.id().map(ResourceId::as_str)
}

// ============================================================================
// Create
// ============================================================================

#[tokio::test]
async fn create_waits_for_source_disk_then_creates_once() {
    let api = Arc::new(FakeLinode::new());
    api.script_disk(
        10,
        100,
        [
            DiskStep::Status(DiskStatus::NotReady),
            DiskStep::Status(DiskStatus::NotReady),
            DiskStep::Status(DiskStatus::Ready),
        ],
    );
    let (clock, images) = reconciler(&api, ImageResource, config());
    let mut handle = ResourceHandle::absent("linode_image");

    images.create(&mut handle, &image("web-1")).await.unwrap();

    assert_eq!(id_of(&handle), Some("9001"));
    assert_eq!(handle.phase(), HandlePhase::Ready);
    assert_eq!(clock.elapsed(), Duration::from_secs(2));

    let calls = api.calls();
    let create_at = calls
        .iter()
        .position(|c| matches!(c, Call::CreateImage(_)))
        .unwrap();
    assert_eq!(
        calls[create_at],
        Call::CreateImage(ImageCreateOptions {
            disk_id: 100,
            label: "web-1".to_string(),
            description: None,
        })
    );
    assert_eq!(
        calls[..create_at]
            .iter()
            .filter(|c| **c == Call::GetDisk(10, 100))
            .count(),
        3
    );
    assert_eq!(api.count(|c| matches!(c, Call::CreateImage(_))), 1);

    assert_eq!(images.read(&mut handle).await.unwrap(), ReadOutcome::Found);
    let observed = handle.observed().unwrap();
    assert_eq!(observed.get_str("label"), Some("web-1"));
    assert_eq!(observed.get_int("disk_id"), Some(100));
    assert_eq!(observed.get_str("type"), Some("manual"));
}

#[tokio::test]
async fn transient_errors_during_prerequisite_are_absorbed() {
    let api = Arc::new(FakeLinode::new());
    api.script_disk(
        10,
        100,
        [
            DiskStep::Unavailable,
            DiskStep::Unavailable,
            DiskStep::Status(DiskStatus::Ready),
        ],
    );
    let (clock, images) = reconciler(&api, ImageResource, config());
    let mut handle = ResourceHandle::absent("linode_image");

    images.create(&mut handle, &image("web-1")).await.unwrap();

    assert_eq!(id_of(&handle), Some("9001"));
    assert_eq!(clock.elapsed(), Duration::from_secs(2));
}

#[tokio::test]
async fn missing_source_disk_fails_before_create() {
    let api = Arc::new(FakeLinode::new());
    api.script_disk(10, 100, [DiskStep::Gone]);
    let (_, images) = reconciler(&api, ImageResource, config());
    let mut handle = ResourceHandle::absent("linode_image");

    let err = images.create(&mut handle, &image("web-1")).await.unwrap_err();

    assert!(matches!(err, ReconcileError::CreateFailed { partial: false, .. }));
    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(handle.is_absent());
    assert_eq!(api.count(|c| matches!(c, Call::CreateImage(_))), 0);
    assert_eq!(api.count(|c| matches!(c, Call::GetDisk(..))), 1);
}

#[tokio::test]
async fn post_create_timeout_keeps_partial_entity() {
    let api = Arc::new(FakeLinode::new());
    api.script_disk(
        10,
        100,
        [
            DiskStep::Status(DiskStatus::Ready),
            DiskStep::Status(DiskStatus::NotReady),
        ],
    );
    let cfg = ReconcilerConfig {
        poll_interval_ms: 1_000,
        create_timeout_ms: 5_000,
    };
    let (clock, images) = reconciler(&api, ImageResource, cfg);
    let mut handle = ResourceHandle::absent("linode_image");

    let err = images.create(&mut handle, &image("web-1")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::PartialFailure);
    assert_eq!(err.id().map(ResourceId::as_str), Some("9001"));
    let ReconcileError::CreateFailed { partial, source, .. } = &err else {
        panic!("expected CreateFailed, got {err:?}");
    };
    assert!(*partial);
    assert_eq!(source.kind(), ErrorKind::Timeout);

    assert_eq!(id_of(&handle), Some("9001"));
    assert!(handle.is_tainted());
    assert!(api.image("9001").is_some());

    let waited = clock.elapsed();
    assert!(waited >= Duration::from_secs(5) && waited < Duration::from_secs(6));
}

#[tokio::test]
async fn cancellation_stops_prerequisite_wait() {
    let api = Arc::new(FakeLinode::new());
    let (tx, rx) = watch::channel(false);
    let (_, images) = reconciler(&api, ImageResource, config());
    let images = images.with_cancellation(rx);
    tx.send(true).unwrap();
    let mut handle = ResourceHandle::absent("linode_image");

    let err = images.create(&mut handle, &image("web-1")).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Canceled);
    assert!(handle.is_absent());
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn invalid_desired_state_never_reaches_the_api() {
    let api = Arc::new(FakeLinode::new());
    let (_, images) = reconciler(&api, ImageResource, config());
    let mut handle = ResourceHandle::absent("linode_image");

    let missing_disk = Attributes::new()
        .with("label", "web-1")
        .with("linode_id", 10_i64);
    let err = images.create(&mut handle, &missing_disk).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let computed = image("web-1").with("size", 2500_i64);
    let err = images.apply(&mut handle, &computed).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    let wrong_type = image("web-1").with("description", 7_i64);
    let err = images.apply(&mut handle, &wrong_type).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Validation);

    assert!(handle.is_absent());
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn create_refuses_bound_handle() {
    let api = Arc::new(FakeLinode::new());
    let (_, keys) = reconciler(&api, SshKeyResource, config());
    let mut handle = ResourceHandle::bound("linode_sshkey", ResourceId::new("100"));

    let err = keys
        .create(&mut handle, &ssh_key("laptop", PUBLIC_KEY))
        .await
        .unwrap_err();

    assert!(matches!(err, ReconcileError::HandleInUse { .. }));
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn handle_of_another_kind_is_rejected() {
    let api = Arc::new(FakeLinode::new());
    let (_, keys) = reconciler(&api, SshKeyResource, config());
    let mut handle = ResourceHandle::absent("linode_image");

    let err = keys.delete(&mut handle).await.unwrap_err();

    assert!(matches!(err, ReconcileError::KindMismatch { .. }));
}

// ============================================================================
// Update
// ============================================================================

#[tokio::test]
async fn update_sends_only_changed_label() {
    let api = Arc::new(FakeLinode::new());
    let (_, templates) = reconciler(&api, TemplateResource, config());
    let mut handle = ResourceHandle::absent("linode_template");
    templates
        .create(&mut handle, &Attributes::new().with("label", "web-1"))
        .await
        .unwrap();
    let id: i64 = id_of(&handle).unwrap().parse().unwrap();

    let changes = templates
        .update(
            &mut handle,
            &Attributes::new().with("label", "web-2"),
            &Attributes::new().with("label", "web-1"),
        )
        .await
        .unwrap();

    assert_eq!(changes.changed(), vec!["label".to_string()]);
    let updates: Vec<Call> = api
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::UpdateTemplate(..)))
        .collect();
    assert_eq!(
        updates,
        vec![Call::UpdateTemplate(
            id,
            TemplateUpdateOptions {
                label: Some("web-2".to_string()),
            }
        )]
    );
    assert_eq!(handle.phase(), HandlePhase::Ready);
    assert_eq!(handle.observed().unwrap().get_str("label"), Some("web-2"));
}

#[tokio::test]
async fn image_update_leaves_other_fields_alone() {
    let api = Arc::new(FakeLinode::new());
    let (_, images) = reconciler(&api, ImageResource, config());
    let mut handle = ResourceHandle::absent("linode_image");
    images.create(&mut handle, &image("web-1")).await.unwrap();
    let previous = handle.observed().cloned().unwrap();

    images
        .update(&mut handle, &image("web-2"), &previous)
        .await
        .unwrap();

    let updates: Vec<Call> = api
        .calls()
        .into_iter()
        .filter(|c| matches!(c, Call::UpdateImage(..)))
        .collect();
    assert_eq!(
        updates,
        vec![Call::UpdateImage(
            "9001".to_string(),
            ImageUpdateOptions {
                label: Some("web-2".to_string()),
                description: None,
            }
        )]
    );
}

#[tokio::test]
async fn unchanged_state_issues_no_update() {
    let api = Arc::new(FakeLinode::new());
    let (_, keys) = reconciler(&api, SshKeyResource, config());
    let mut handle = ResourceHandle::absent("linode_sshkey");
    let desired = ssh_key("laptop", PUBLIC_KEY);
    keys.create(&mut handle, &desired).await.unwrap();
    let before = api.calls().len();

    let changes = keys.update(&mut handle, &desired, &desired).await.unwrap();

    assert!(changes.is_empty());
    assert_eq!(api.calls().len(), before);
}

#[tokio::test]
async fn changing_immutable_attribute_requires_replace() {
    let api = Arc::new(FakeLinode::new());
    let (_, keys) = reconciler(&api, SshKeyResource, config());
    let mut handle = ResourceHandle::absent("linode_sshkey");
    let previous = ssh_key("laptop", PUBLIC_KEY);
    keys.create(&mut handle, &previous).await.unwrap();

    let err = keys
        .update(&mut handle, &ssh_key("laptop-2", OTHER_KEY), &previous)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::ReplaceRequired);
    let ReconcileError::ReplaceRequired { attributes, .. } = &err else {
        panic!("expected ReplaceRequired, got {err:?}");
    };
    assert_eq!(attributes, &vec!["ssh_key".to_string()]);
    assert_eq!(api.count(|c| matches!(c, Call::UpdateSshKey(..))), 0);
    assert_eq!(id_of(&handle), Some("100"));
}

#[tokio::test]
async fn update_of_vanished_entity_clears_handle() {
    let api = Arc::new(FakeLinode::new());
    let (_, keys) = reconciler(&api, SshKeyResource, config());
    let mut handle = ResourceHandle::absent("linode_sshkey");
    let previous = ssh_key("laptop", PUBLIC_KEY);
    keys.create(&mut handle, &previous).await.unwrap();
    api.remove_ssh_key(100);

    let err = keys
        .update(&mut handle, &ssh_key("laptop-2", PUBLIC_KEY), &previous)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::NotFound);
    assert!(handle.is_absent());
}

#[tokio::test]
async fn tainted_handle_cannot_be_updated() {
    let api = Arc::new(FakeLinode::new());
    let (_, keys) = reconciler(&api, SshKeyResource, config());
    let mut handle = ResourceHandle::tainted("linode_sshkey", ResourceId::new("100"));
    let desired = ssh_key("laptop", PUBLIC_KEY);

    let err = keys.update(&mut handle, &desired, &desired).await.unwrap_err();

    assert!(matches!(err, ReconcileError::Tainted { .. }));
    assert_eq!(err.kind(), ErrorKind::PartialFailure);
    assert!(api.calls().is_empty());
}

// ============================================================================
// Read / Delete / Import
// ============================================================================

#[tokio::test]
async fn read_of_vanished_entity_clears_handle() {
    let api = Arc::new(FakeLinode::new());
    let (_, templates) = reconciler(&api, TemplateResource, config());
    let mut handle = ResourceHandle::absent("linode_template");
    templates
        .create(&mut handle, &Attributes::new())
        .await
        .unwrap();
    api.remove_template(1);

    assert_eq!(templates.read(&mut handle).await.unwrap(), ReadOutcome::Gone);
    assert!(handle.is_absent());
}

#[tokio::test]
async fn delete_after_out_of_band_removal_succeeds() {
    let api = Arc::new(FakeLinode::new());
    let (_, images) = reconciler(&api, ImageResource, config());
    let mut handle = ResourceHandle::absent("linode_image");
    images.create(&mut handle, &image("web-1")).await.unwrap();
    api.remove_image("9001");

    images.delete(&mut handle).await.unwrap();

    assert!(handle.is_absent());
    assert_eq!(handle.phase(), HandlePhase::Absent);
    assert_eq!(api.count(|c| *c == Call::DeleteImage("9001".to_string())), 1);
}

#[tokio::test]
async fn delete_of_absent_handle_succeeds_without_calls() {
    let api = Arc::new(FakeLinode::new());
    let (_, keys) = reconciler(&api, SshKeyResource, config());
    let mut handle = ResourceHandle::absent("linode_sshkey");

    keys.delete(&mut handle).await.unwrap();
    keys.delete(&mut handle).await.unwrap();

    assert!(handle.is_absent());
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn failed_delete_keeps_handle_bound() {
    let api = Arc::new(FakeLinode::new());
    let (_, keys) = reconciler(&api, SshKeyResource, config());
    let mut handle = ResourceHandle::absent("linode_sshkey");
    keys.create(&mut handle, &ssh_key("laptop", PUBLIC_KEY))
        .await
        .unwrap();
    api.fail_deletes(503);

    let err = keys.delete(&mut handle).await.unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Transient);
    assert_eq!(id_of(&handle), Some("100"));
    assert_eq!(handle.phase(), HandlePhase::Ready);
}

#[tokio::test]
async fn import_adopts_existing_entity() {
    let api = Arc::new(FakeLinode::new());
    let id = api.seed_ssh_key("laptop", PUBLIC_KEY);
    let (_, keys) = reconciler(&api, SshKeyResource, config());

    let handle = keys.import(&id.to_string()).await.unwrap();

    assert_eq!(id_of(&handle), Some("100"));
    assert_eq!(handle.phase(), HandlePhase::Ready);
    assert_eq!(handle.observed().unwrap().get_str("ssh_key"), Some(PUBLIC_KEY));
}

#[tokio::test]
async fn import_of_unknown_id_fails() {
    let api = Arc::new(FakeLinode::new());
    let (_, templates) = reconciler(&api, TemplateResource, config());

    let err = templates.import("42").await.unwrap_err();

    assert!(matches!(err, ReconcileError::ImportNotFound { .. }));
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn import_rejects_malformed_ids_locally() {
    let api = Arc::new(FakeLinode::new());
    let (_, keys) = reconciler(&api, SshKeyResource, config());

    assert_eq!(keys.import("abc").await.unwrap_err().kind(), ErrorKind::Validation);
    assert_eq!(keys.import("  ").await.unwrap_err().kind(), ErrorKind::Validation);
    assert!(api.calls().is_empty());
}

#[tokio::test]
async fn image_lookup_reads_without_a_handle() {
    let api = Arc::new(FakeLinode::new());
    let (_, images) = reconciler(&api, ImageResource, config());
    let mut handle = ResourceHandle::absent("linode_image");
    images.create(&mut handle, &image("web-1")).await.unwrap();

    let found = ImageResource::lookup(api.as_ref(), "9001").await.unwrap();
    assert_eq!(found.get_str("label"), Some("web-1"));
    assert_eq!(found.get_str("status"), Some("available"));

    let missing = ImageResource::lookup(api.as_ref(), "linode/none").await.unwrap_err();
    assert!(missing.is_not_found());
}

// ============================================================================
// Apply
// ============================================================================

#[tokio::test]
async fn apply_converges_and_is_idempotent() {
    let api = Arc::new(FakeLinode::new());
    let (_, keys) = reconciler(&api, SshKeyResource, config());
    let mut handle = ResourceHandle::absent("linode_sshkey");

    let desired = ssh_key("laptop", PUBLIC_KEY);
    assert_eq!(keys.apply(&mut handle, &desired).await.unwrap(), ApplyAction::Created);
    assert_eq!(keys.apply(&mut handle, &desired).await.unwrap(), ApplyAction::Unchanged);

    let relabeled = ssh_key("work laptop", PUBLIC_KEY);
    assert_eq!(keys.apply(&mut handle, &relabeled).await.unwrap(), ApplyAction::Updated);

    assert_eq!(id_of(&handle), Some("100"));
    assert_eq!(api.count(|c| matches!(c, Call::CreateSshKey(_))), 1);
    assert_eq!(api.count(|c| matches!(c, Call::UpdateSshKey(..))), 1);
}

#[tokio::test]
async fn apply_replaces_on_immutable_change() {
    let api = Arc::new(FakeLinode::new());
    let (_, keys) = reconciler(&api, SshKeyResource, config());
    let mut handle = ResourceHandle::absent("linode_sshkey");
    keys.apply(&mut handle, &ssh_key("laptop", PUBLIC_KEY))
        .await
        .unwrap();

    let action = keys
        .apply(&mut handle, &ssh_key("laptop", OTHER_KEY))
        .await
        .unwrap();

    assert_eq!(action, ApplyAction::Replaced);
    assert_eq!(id_of(&handle), Some("101"));
    assert_eq!(api.count(|c| *c == Call::DeleteSshKey(100)), 1);
    assert_eq!(api.ssh_key_count(), 1);
}

#[tokio::test]
async fn apply_replaces_tainted_handle() {
    let api = Arc::new(FakeLinode::new());
    api.script_disk(
        10,
        100,
        [
            DiskStep::Status(DiskStatus::Ready),
            DiskStep::Status(DiskStatus::NotReady),
        ],
    );
    let cfg = ReconcilerConfig {
        poll_interval_ms: 1_000,
        create_timeout_ms: 3_000,
    };
    let (_, images) = reconciler(&api, ImageResource, cfg);
    let mut handle = ResourceHandle::absent("linode_image");
    images.create(&mut handle, &image("web-1")).await.unwrap_err();
    assert!(handle.is_tainted());

    api.script_disk(10, 100, [DiskStep::Status(DiskStatus::Ready)]);
    let action = images.apply(&mut handle, &image("web-1")).await.unwrap();

    assert_eq!(action, ApplyAction::Replaced);
    assert_eq!(id_of(&handle), Some("9002"));
    assert_eq!(handle.phase(), HandlePhase::Ready);
    assert!(api.image("9001").is_none());
}

#[tokio::test]
async fn apply_recreates_vanished_entity() {
    let api = Arc::new(FakeLinode::new());
    let (_, keys) = reconciler(&api, SshKeyResource, config());
    let mut handle = ResourceHandle::bound("linode_sshkey", ResourceId::new("100"));

    let action = keys
        .apply(&mut handle, &ssh_key("laptop", PUBLIC_KEY))
        .await
        .unwrap();

    assert_eq!(action, ApplyAction::Created);
    assert_eq!(id_of(&handle), Some("100"));
    assert_eq!(api.count(|c| matches!(c, Call::GetSshKey(100))), 2);
}

#[tokio::test]
async fn apply_on_reloaded_image_handle_is_unchanged() {
    let api = Arc::new(FakeLinode::new());
    let (_, images) = reconciler(&api, ImageResource, config());
    let mut first = ResourceHandle::absent("linode_image");
    images.create(&mut first, &image("web-1")).await.unwrap();

    // Only the id survives a restart; disk_id and linode_id are never returned.
    let mut reloaded = ResourceHandle::bound("linode_image", ResourceId::new("9001"));
    let action = images.apply(&mut reloaded, &image("web-1")).await.unwrap();

    assert_eq!(action, ApplyAction::Unchanged);
    assert_eq!(api.count(|c| matches!(c, Call::CreateImage(_))), 1);
}

// ============================================================================
// Concurrency
// ============================================================================

#[tokio::test]
async fn distinct_handles_reconcile_concurrently() {
    let api = Arc::new(FakeLinode::new());
    api.script_disk(
        10,
        100,
        [
            DiskStep::Status(DiskStatus::NotReady),
            DiskStep::Status(DiskStatus::Ready),
        ],
    );
    api.script_disk(
        11,
        200,
        [
            DiskStep::Unavailable,
            DiskStep::Status(DiskStatus::NotReady),
            DiskStep::Status(DiskStatus::Ready),
        ],
    );
    // Both image waits sleep on one ManualClock; the 20 min budget covers both.
    let (_, images) = reconciler(&api, ImageResource, config());
    let (_, keys) = reconciler(&api, SshKeyResource, config());

    let mut web = ResourceHandle::absent("linode_image");
    let mut db = ResourceHandle::absent("linode_image");
    let mut key = ResourceHandle::absent("linode_sshkey");
    let db_image = Attributes::new()
        .with("label", "db-1")
        .with("disk_id", 200_i64)
        .with("linode_id", 11_i64);
    let web_image = image("web-1");
    let laptop = ssh_key("laptop", PUBLIC_KEY);

    let (a, b, c) = tokio::join!(
        images.apply(&mut web, &web_image),
        images.apply(&mut db, &db_image),
        keys.apply(&mut key, &laptop),
    );

    assert_eq!(a.unwrap(), ApplyAction::Created);
    assert_eq!(b.unwrap(), ApplyAction::Created);
    assert_eq!(c.unwrap(), ApplyAction::Created);
    assert_ne!(web.id(), db.id());
    assert_eq!(api.count(|c| matches!(c, Call::CreateImage(_))), 2);
    assert_eq!(id_of(&key), Some("100"));
}
