//! Concrete Linode resource kinds.
//!
//! Each kind pairs a `ResourceDescriptor` with the `LinodeApi` calls that read,
//! create, update and delete it, plus the readiness conditions its create must
//! wait on. The reconciler drives every kind the same way.

use std::fmt;

use async_trait::async_trait;
use thiserror::Error;

use crate::linode_client::{
    ApiError, DiskStatus, Image, ImageCreateOptions, ImageUpdateOptions, LinodeApi,
    SshKeyCreateOptions, SshKeyUpdateOptions, TemplateCreateOptions, TemplateUpdateOptions,
};
use crate::linode_descriptor::{
    AttributeSpec, Attributes, ResourceDescriptor, ValidationError, ValueType,
};
use crate::linode_poller::Retryable;

/// A remote condition that gates a lifecycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Readiness {
    /// An instance disk must reach `target`.
    Disk {
        /// Owning Linode instance.
        linode_id: i64,
        /// Disk to watch.
        disk_id: i64,
        /// Status to wait for.
        target: DiskStatus,
    },
}

impl Readiness {
    /// Fetch the current status of the watched entity.
    ///
    /// # Errors
    ///
    /// Returns the API error unchanged so the poller can classify it.
    pub async fn observe(&self, api: &dyn LinodeApi) -> Result<DiskStatus, ApiError> {
        match *self {
            Self::Disk {
                linode_id, disk_id, ..
            } => api
                .get_instance_disk(linode_id, disk_id)
                .await
                .map(|disk| disk.status),
        }
    }

    /// Whether `observed` satisfies the condition.
    #[must_use]
    pub fn is_met(&self, observed: DiskStatus) -> bool {
        match self {
            Self::Disk { target, .. } => observed == *target,
        }
    }
}

impl fmt::Display for Readiness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disk {
                linode_id,
                disk_id,
                target,
            } => write!(f, "disk {disk_id} of linode {linode_id} is {target}"),
        }
    }
}

/// Error raised by a resource kind.
#[derive(Debug, Error)]
pub enum ResourceError {
    /// Desired state or identifier rejected locally.
    #[error(transparent)]
    Validation(#[from] ValidationError),
    /// The API call failed.
    #[error(transparent)]
    Api(#[from] ApiError),
}

impl ResourceError {
    /// Whether the remote entity does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Api(e) if e.is_not_found())
    }
}

impl Retryable for ResourceError {
    fn is_transient(&self) -> bool {
        matches!(self, Self::Api(e) if e.is_transient())
    }
}

/// Lifecycle calls of one resource kind.
///
/// `desired` is always validated against `descriptor()` before it reaches these
/// methods, so required attributes may be read with `require_*`.
#[async_trait]
pub trait ResourceKind: Send + Sync {
    /// Attribute declarations of this kind.
    fn descriptor(&self) -> &ResourceDescriptor;

    /// Condition that must hold before the create call.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `desired` lacks what the condition needs.
    fn prerequisite(&self, _desired: &Attributes) -> Result<Option<Readiness>, ValidationError> {
        Ok(None)
    }

    /// Condition the new entity must reach before the create is complete.
    ///
    /// # Errors
    ///
    /// Returns a validation error if `desired` lacks what the condition needs.
    fn post_create(
        &self,
        _desired: &Attributes,
        _id: &str,
    ) -> Result<Option<Readiness>, ValidationError> {
        Ok(None)
    }

    /// Read the entity and map it onto the descriptor's attribute names.
    async fn fetch(&self, api: &dyn LinodeApi, id: &str) -> Result<Attributes, ResourceError>;

    /// Create the entity and return its identifier.
    async fn create(&self, api: &dyn LinodeApi, desired: &Attributes)
    -> Result<String, ResourceError>;

    /// Send `changes` (updatable attributes only) in one update call.
    async fn update(
        &self,
        api: &dyn LinodeApi,
        id: &str,
        changes: &Attributes,
    ) -> Result<(), ResourceError>;

    /// Delete the entity.
    async fn delete(&self, api: &dyn LinodeApi, id: &str) -> Result<(), ResourceError>;
}

fn numeric_id(kind: &'static str, id: &str) -> Result<i64, ValidationError> {
    id.trim()
        .parse::<i64>()
        .map_err(|_| ValidationError::MalformedId {
            kind,
            id: id.to_string(),
            reason: "expected a numeric id",
        })
}

// ============================================================================
// linode_image
// ============================================================================

const IMAGE_KIND: &str = "linode_image";

const IMAGE_ATTRIBUTES: &[AttributeSpec] = &[
    AttributeSpec::required("label", ValueType::String),
    AttributeSpec::required("disk_id", ValueType::Int).force_new(),
    AttributeSpec::required("linode_id", ValueType::Int).force_new(),
    AttributeSpec::optional("description", ValueType::String),
    AttributeSpec::computed("created", ValueType::Timestamp),
    AttributeSpec::computed("created_by", ValueType::String),
    AttributeSpec::computed("deprecated", ValueType::Bool),
    AttributeSpec::computed("is_public", ValueType::Bool),
    AttributeSpec::computed("size", ValueType::Int),
    AttributeSpec::computed("type", ValueType::String),
    AttributeSpec::computed("expiry", ValueType::Timestamp),
    AttributeSpec::computed("vendor", ValueType::String),
    AttributeSpec::computed("status", ValueType::String),
];

static IMAGE_DESCRIPTOR: ResourceDescriptor =
    ResourceDescriptor::new(IMAGE_KIND, IMAGE_ATTRIBUTES);

/// Private image taken from an instance disk.
///
/// The disk must be `ready` before the image is taken, and is busy again until
/// the image has been written.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageResource;

impl ImageResource {
    /// Look up any image (public or private) without managing it.
    ///
    /// # Errors
    ///
    /// Returns a not-found API error if no image has this id.
    pub async fn lookup(api: &dyn LinodeApi, id: &str) -> Result<Attributes, ResourceError> {
        let image = api.get_image(image_id(id)?).await?;
        tracing::debug!(kind = IMAGE_KIND, id, public = image.is_public, "image looked up");
        Ok(image_attributes(&image))
    }

    fn disk_ready(desired: &Attributes) -> Result<Readiness, ValidationError> {
        Ok(Readiness::Disk {
            linode_id: desired.require_int(IMAGE_KIND, "linode_id")?,
            disk_id: desired.require_int(IMAGE_KIND, "disk_id")?,
            target: DiskStatus::Ready,
        })
    }
}

fn image_id(id: &str) -> Result<&str, ValidationError> {
    if id.trim().is_empty() {
        return Err(ValidationError::MalformedId {
            kind: IMAGE_KIND,
            id: id.to_string(),
            reason: "image id is empty",
        });
    }
    Ok(id)
}

fn image_attributes(image: &Image) -> Attributes {
    let mut attrs = Attributes::new()
        .with("label", image.label.as_str())
        .with("description", image.description.clone().unwrap_or_default())
        .with("deprecated", image.deprecated)
        .with("is_public", image.is_public)
        .with("size", image.size)
        .with("type", image.image_type.as_str());
    if let Some(created) = image.created {
        attrs.insert("created", created);
    }
    if let Some(created_by) = &image.created_by {
        attrs.insert("created_by", created_by.as_str());
    }
    if let Some(expiry) = image.expiry {
        attrs.insert("expiry", expiry);
    }
    if let Some(vendor) = &image.vendor {
        attrs.insert("vendor", vendor.as_str());
    }
    if let Some(status) = &image.status {
        attrs.insert("status", status.as_str());
    }
    attrs
}

#[async_trait]
impl ResourceKind for ImageResource {
    fn descriptor(&self) -> &ResourceDescriptor {
        &IMAGE_DESCRIPTOR
    }

    fn prerequisite(&self, desired: &Attributes) -> Result<Option<Readiness>, ValidationError> {
        Self::disk_ready(desired).map(Some)
    }

    fn post_create(
        &self,
        desired: &Attributes,
        _id: &str,
    ) -> Result<Option<Readiness>, ValidationError> {
        Self::disk_ready(desired).map(Some)
    }

    async fn fetch(&self, api: &dyn LinodeApi, id: &str) -> Result<Attributes, ResourceError> {
        let image = api.get_image(image_id(id)?).await?;
        Ok(image_attributes(&image))
    }

    async fn create(
        &self,
        api: &dyn LinodeApi,
        desired: &Attributes,
    ) -> Result<String, ResourceError> {
        let opts = ImageCreateOptions {
            disk_id: desired.require_int(IMAGE_KIND, "disk_id")?,
            label: desired.require_str(IMAGE_KIND, "label")?.to_string(),
            description: desired
                .get_str("description")
                .filter(|d| !d.is_empty())
                .map(str::to_string),
        };
        let image = api.create_image(&opts).await?;
        Ok(image.id)
    }

    async fn update(
        &self,
        api: &dyn LinodeApi,
        id: &str,
        changes: &Attributes,
    ) -> Result<(), ResourceError> {
        let opts = ImageUpdateOptions {
            label: changes.get_str("label").map(str::to_string),
            description: changes.get_str("description").map(str::to_string),
        };
        api.update_image(image_id(id)?, &opts).await?;
        Ok(())
    }

    async fn delete(&self, api: &dyn LinodeApi, id: &str) -> Result<(), ResourceError> {
        api.delete_image(image_id(id)?).await?;
        Ok(())
    }
}

// ============================================================================
// linode_sshkey
// ============================================================================

const SSH_KEY_KIND: &str = "linode_sshkey";

const SSH_KEY_ATTRIBUTES: &[AttributeSpec] = &[
    AttributeSpec::required("label", ValueType::String),
    AttributeSpec::required("ssh_key", ValueType::String).force_new(),
    AttributeSpec::computed("created", ValueType::Timestamp),
];

static SSH_KEY_DESCRIPTOR: ResourceDescriptor =
    ResourceDescriptor::new(SSH_KEY_KIND, SSH_KEY_ATTRIBUTES);

/// Public key attached to the current profile.
#[derive(Debug, Clone, Copy, Default)]
pub struct SshKeyResource;

#[async_trait]
impl ResourceKind for SshKeyResource {
    fn descriptor(&self) -> &ResourceDescriptor {
        &SSH_KEY_DESCRIPTOR
    }

    async fn fetch(&self, api: &dyn LinodeApi, id: &str) -> Result<Attributes, ResourceError> {
        let key = api.get_ssh_key(numeric_id(SSH_KEY_KIND, id)?).await?;
        let mut attrs = Attributes::new()
            .with("label", key.label)
            .with("ssh_key", key.ssh_key);
        if let Some(created) = key.created {
            attrs.insert("created", created);
        }
        Ok(attrs)
    }

    async fn create(
        &self,
        api: &dyn LinodeApi,
        desired: &Attributes,
    ) -> Result<String, ResourceError> {
        let opts = SshKeyCreateOptions {
            label: desired.require_str(SSH_KEY_KIND, "label")?.to_string(),
            ssh_key: desired.require_str(SSH_KEY_KIND, "ssh_key")?.to_string(),
        };
        let key = api.create_ssh_key(&opts).await?;
        Ok(key.id.to_string())
    }

    async fn update(
        &self,
        api: &dyn LinodeApi,
        id: &str,
        changes: &Attributes,
    ) -> Result<(), ResourceError> {
        let opts = SshKeyUpdateOptions {
            label: changes.get_str("label").map(str::to_string),
        };
        api.update_ssh_key(numeric_id(SSH_KEY_KIND, id)?, &opts)
            .await?;
        Ok(())
    }

    async fn delete(&self, api: &dyn LinodeApi, id: &str) -> Result<(), ResourceError> {
        api.delete_ssh_key(numeric_id(SSH_KEY_KIND, id)?).await?;
        Ok(())
    }
}

// ============================================================================
// linode_template
// ============================================================================

const TEMPLATE_KIND: &str = "linode_template";

const TEMPLATE_ATTRIBUTES: &[AttributeSpec] = &[
    AttributeSpec::optional("label", ValueType::String),
    AttributeSpec::computed("status", ValueType::Int),
];

static TEMPLATE_DESCRIPTOR: ResourceDescriptor =
    ResourceDescriptor::new(TEMPLATE_KIND, TEMPLATE_ATTRIBUTES);

/// Minimal resource with a single optional label.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateResource;

#[async_trait]
impl ResourceKind for TemplateResource {
    fn descriptor(&self) -> &ResourceDescriptor {
        &TEMPLATE_DESCRIPTOR
    }

    async fn fetch(&self, api: &dyn LinodeApi, id: &str) -> Result<Attributes, ResourceError> {
        let template = api.get_template(numeric_id(TEMPLATE_KIND, id)?).await?;
        Ok(Attributes::new()
            .with("label", template.label)
            .with("status", template.status))
    }

    async fn create(
        &self,
        api: &dyn LinodeApi,
        desired: &Attributes,
    ) -> Result<String, ResourceError> {
        let opts = TemplateCreateOptions {
            label: desired.get_str("label").map(str::to_string),
        };
        let template = api.create_template(&opts).await?;
        Ok(template.id.to_string())
    }

    async fn update(
        &self,
        api: &dyn LinodeApi,
        id: &str,
        changes: &Attributes,
    ) -> Result<(), ResourceError> {
        let opts = TemplateUpdateOptions {
            label: changes.get_str("label").map(str::to_string),
        };
        api.update_template(numeric_id(TEMPLATE_KIND, id)?, &opts)
            .await?;
        Ok(())
    }

    async fn delete(&self, api: &dyn LinodeApi, id: &str) -> Result<(), ResourceError> {
        api.delete_template(numeric_id(TEMPLATE_KIND, id)?).await?;
        Ok(())
    }
}
