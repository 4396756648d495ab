//! In-memory `LinodeApi` double shared by the integration tests.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use linode_lifecycle::linode_client::{
    DiskStatus, Image, ImageCreateOptions, ImageUpdateOptions, InstanceDisk, SshKey,
    SshKeyCreateOptions, SshKeyUpdateOptions, Template, TemplateCreateOptions,
    TemplateUpdateOptions,
};
use linode_lifecycle::{ApiError, LinodeApi};

/// One recorded API call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    GetImage(String),
    CreateImage(ImageCreateOptions),
    UpdateImage(String, ImageUpdateOptions),
    DeleteImage(String),
    GetDisk(i64, i64),
    GetSshKey(i64),
    CreateSshKey(SshKeyCreateOptions),
    UpdateSshKey(i64, SshKeyUpdateOptions),
    DeleteSshKey(i64),
    GetTemplate(i64),
    CreateTemplate(TemplateCreateOptions),
    UpdateTemplate(i64, TemplateUpdateOptions),
    DeleteTemplate(i64),
}

/// Scripted answer to a disk status poll.
#[derive(Debug, Clone, Copy)]
pub enum DiskStep {
    Status(DiskStatus),
    /// HTTP 503.
    Unavailable,
    /// HTTP 404.
    Gone,
}

#[derive(Default)]
struct Inner {
    images: BTreeMap<String, Image>,
    ssh_keys: BTreeMap<i64, SshKey>,
    templates: BTreeMap<i64, Template>,
    disks: HashMap<(i64, i64), VecDeque<DiskStep>>,
    next_image: i64,
    next_ssh_key: i64,
    next_template: i64,
    delete_failure: Option<u16>,
    calls: Vec<Call>,
}

/// Fake Linode control plane.
///
/// Image ids start at `9001`, SSH key ids at `100`, template ids at `1`.
/// Unscripted disks are always `ready`; a scripted disk answers its steps in
/// order and then repeats the last one.
pub struct FakeLinode {
    inner: Mutex<Inner>,
}

impl FakeLinode {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                next_image: 9001,
                next_ssh_key: 100,
                next_template: 1,
                ..Inner::default()
            }),
        }
    }

    pub fn script_disk(&self, linode_id: i64, disk_id: i64, steps: impl IntoIterator<Item = DiskStep>) {
        self.inner
            .lock()
            .unwrap()
            .disks
            .insert((linode_id, disk_id), steps.into_iter().collect());
    }

    /// Make every delete fail with `status`.
    pub fn fail_deletes(&self, status: u16) {
        self.inner.lock().unwrap().delete_failure = Some(status);
    }

    pub fn seed_ssh_key(&self, label: &str, ssh_key: &str) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_ssh_key;
        inner.next_ssh_key += 1;
        inner.ssh_keys.insert(
            id,
            SshKey {
                id,
                label: label.to_string(),
                ssh_key: ssh_key.to_string(),
                created: None,
            },
        );
        id
    }

    /// Remove entities behind the reconciler's back.
    pub fn remove_image(&self, id: &str) {
        self.inner.lock().unwrap().images.remove(id);
    }

    pub fn remove_ssh_key(&self, id: i64) {
        self.inner.lock().unwrap().ssh_keys.remove(&id);
    }

    pub fn remove_template(&self, id: i64) {
        self.inner.lock().unwrap().templates.remove(&id);
    }

    pub fn image(&self, id: &str) -> Option<Image> {
        self.inner.lock().unwrap().images.get(id).cloned()
    }

    pub fn ssh_key_count(&self) -> usize {
        self.inner.lock().unwrap().ssh_keys.len()
    }

    pub fn calls(&self) -> Vec<Call> {
        self.inner.lock().unwrap().calls.clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.inner.lock().unwrap().calls.iter().filter(|c| pred(c)).count()
    }

    fn record(&self, call: Call) -> std::sync::MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(call);
        inner
    }
}

fn not_found(path: String) -> ApiError {
    ApiError::NotFound { path }
}

fn failure(status: u16) -> ApiError {
    ApiError::Status {
        status,
        body: r#"{"errors":[{"reason":"scripted failure"}]}"#.to_string(),
    }
}

#[async_trait]
impl LinodeApi for FakeLinode {
    async fn get_image(&self, id: &str) -> Result<Image, ApiError> {
        let inner = self.record(Call::GetImage(id.to_string()));
        inner
            .images
            .get(id)
            .cloned()
            .ok_or_else(|| not_found(format!("images/{id}")))
    }

    async fn create_image(&self, opts: &ImageCreateOptions) -> Result<Image, ApiError> {
        let mut inner = self.record(Call::CreateImage(opts.clone()));
        let id = inner.next_image.to_string();
        inner.next_image += 1;
        let image = Image {
            id: id.clone(),
            label: opts.label.clone(),
            description: opts.description.clone(),
            created: None,
            created_by: Some("tester".to_string()),
            deprecated: false,
            is_public: false,
            size: 2500,
            image_type: "manual".to_string(),
            expiry: None,
            vendor: None,
            status: Some("available".to_string()),
        };
        inner.images.insert(id, image.clone());
        Ok(image)
    }

    async fn update_image(&self, id: &str, opts: &ImageUpdateOptions) -> Result<Image, ApiError> {
        let mut inner = self.record(Call::UpdateImage(id.to_string(), opts.clone()));
        let image = inner
            .images
            .get_mut(id)
            .ok_or_else(|| not_found(format!("images/{id}")))?;
        if let Some(label) = &opts.label {
            image.label.clone_from(label);
        }
        if let Some(description) = &opts.description {
            image.description = Some(description.clone());
        }
        Ok(image.clone())
    }

    async fn delete_image(&self, id: &str) -> Result<(), ApiError> {
        let mut inner = self.record(Call::DeleteImage(id.to_string()));
        if let Some(code) = inner.delete_failure {
            return Err(failure(code));
        }
        inner
            .images
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| not_found(format!("images/{id}")))
    }

    async fn get_instance_disk(&self, linode_id: i64, disk_id: i64) -> Result<InstanceDisk, ApiError> {
        let mut inner = self.record(Call::GetDisk(linode_id, disk_id));
        let step = match inner.disks.get_mut(&(linode_id, disk_id)) {
            None => DiskStep::Status(DiskStatus::Ready),
            Some(steps) if steps.len() > 1 => steps.pop_front().unwrap(),
            Some(steps) => *steps.front().unwrap(),
        };
        match step {
            DiskStep::Status(status) => Ok(InstanceDisk {
                id: disk_id,
                label: "boot".to_string(),
                status,
                size: 25_600,
            }),
            DiskStep::Unavailable => Err(failure(503)),
            DiskStep::Gone => Err(not_found(format!("linode/instances/{linode_id}/disks/{disk_id}"))),
        }
    }

    async fn get_ssh_key(&self, id: i64) -> Result<SshKey, ApiError> {
        let inner = self.record(Call::GetSshKey(id));
        inner
            .ssh_keys
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(format!("profile/sshkeys/{id}")))
    }

    async fn create_ssh_key(&self, opts: &SshKeyCreateOptions) -> Result<SshKey, ApiError> {
        let mut inner = self.record(Call::CreateSshKey(opts.clone()));
        let id = inner.next_ssh_key;
        inner.next_ssh_key += 1;
        let key = SshKey {
            id,
            label: opts.label.clone(),
            ssh_key: opts.ssh_key.clone(),
            created: None,
        };
        inner.ssh_keys.insert(id, key.clone());
        Ok(key)
    }

    async fn update_ssh_key(&self, id: i64, opts: &SshKeyUpdateOptions) -> Result<SshKey, ApiError> {
        let mut inner = self.record(Call::UpdateSshKey(id, opts.clone()));
        let key = inner
            .ssh_keys
            .get_mut(&id)
            .ok_or_else(|| not_found(format!("profile/sshkeys/{id}")))?;
        if let Some(label) = &opts.label {
            key.label.clone_from(label);
        }
        Ok(key.clone())
    }

    async fn delete_ssh_key(&self, id: i64) -> Result<(), ApiError> {
        let mut inner = self.record(Call::DeleteSshKey(id));
        if let Some(code) = inner.delete_failure {
            return Err(failure(code));
        }
        inner
            .ssh_keys
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found(format!("profile/sshkeys/{id}")))
    }

    async fn get_template(&self, id: i64) -> Result<Template, ApiError> {
        let inner = self.record(Call::GetTemplate(id));
        inner
            .templates
            .get(&id)
            .cloned()
            .ok_or_else(|| not_found(format!("templates/{id}")))
    }

    async fn create_template(&self, opts: &TemplateCreateOptions) -> Result<Template, ApiError> {
        let mut inner = self.record(Call::CreateTemplate(opts.clone()));
        let id = inner.next_template;
        inner.next_template += 1;
        let template = Template {
            id,
            label: opts.label.clone().unwrap_or_default(),
            status: 1,
        };
        inner.templates.insert(id, template.clone());
        Ok(template)
    }

    async fn update_template(&self, id: i64, opts: &TemplateUpdateOptions) -> Result<Template, ApiError> {
        let mut inner = self.record(Call::UpdateTemplate(id, opts.clone()));
        let template = inner
            .templates
            .get_mut(&id)
            .ok_or_else(|| not_found(format!("templates/{id}")))?;
        if let Some(label) = &opts.label {
            template.label.clone_from(label);
        }
        Ok(template.clone())
    }

    async fn delete_template(&self, id: i64) -> Result<(), ApiError> {
        let mut inner = self.record(Call::DeleteTemplate(id));
        if let Some(code) = inner.delete_failure {
            return Err(failure(code));
        }
        inner
            .templates
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| not_found(format!("templates/{id}")))
    }
}
