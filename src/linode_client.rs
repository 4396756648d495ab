//! Linode API v4 client.
//!
//! Unique responsibility: expose the entity calls the reconciler needs behind the
//! `LinodeApi` trait, and implement them over the Linode REST API.
//!
//! REST endpoints used:
//! - GET/PUT/DELETE <https://api.linode.com/v4/images/{id}>, POST /images
//! - GET/PUT/DELETE /profile/sshkeys/{id}, POST /profile/sshkeys
//! - GET/PUT/DELETE /templates/{id}, POST /templates
//! - GET /linode/instances/{linodeId}/disks/{diskId}
//! - Header: Authorization: Bearer <token>
//!
//! Non-goals:
//! - Retry or backoff. A failed call is classified (not found / transient /
//!   fatal) and returned; only the readiness poller retries.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::linode_config::LinodeClientConfig;
use crate::linode_poller::Retryable;

/// Entity calls against the Linode control plane.
///
/// Implementations must be safe for concurrent use by several reconcilers.
#[async_trait]
pub trait LinodeApi: Send + Sync {
    /// Fetch an image.
    async fn get_image(&self, id: &str) -> Result<Image, ApiError>;
    /// Create an image from a disk.
    async fn create_image(&self, opts: &ImageCreateOptions) -> Result<Image, ApiError>;
    /// Update an image; only `Some` fields are sent.
    async fn update_image(&self, id: &str, opts: &ImageUpdateOptions) -> Result<Image, ApiError>;
    /// Delete an image.
    async fn delete_image(&self, id: &str) -> Result<(), ApiError>;

    /// Fetch a disk of a Linode instance.
    async fn get_instance_disk(&self, linode_id: i64, disk_id: i64) -> Result<InstanceDisk, ApiError>;

    /// Fetch an SSH key of the current profile.
    async fn get_ssh_key(&self, id: i64) -> Result<SshKey, ApiError>;
    /// Add an SSH key to the current profile.
    async fn create_ssh_key(&self, opts: &SshKeyCreateOptions) -> Result<SshKey, ApiError>;
    /// Update an SSH key; only `Some` fields are sent.
    async fn update_ssh_key(&self, id: i64, opts: &SshKeyUpdateOptions) -> Result<SshKey, ApiError>;
    /// Remove an SSH key.
    async fn delete_ssh_key(&self, id: i64) -> Result<(), ApiError>;

    /// Fetch a template.
    async fn get_template(&self, id: i64) -> Result<Template, ApiError>;
    /// Create a template.
    async fn create_template(&self, opts: &TemplateCreateOptions) -> Result<Template, ApiError>;
    /// Update a template; only `Some` fields are sent.
    async fn update_template(&self, id: i64, opts: &TemplateUpdateOptions) -> Result<Template, ApiError>;
    /// Delete a template.
    async fn delete_template(&self, id: i64) -> Result<(), ApiError>;
}

/// REST implementation of `LinodeApi`.
pub struct LinodeClient {
    cfg: LinodeClientConfig,
    http: reqwest::Client,
}

impl LinodeClient {
    /// Create a new Linode client from the given configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(cfg: LinodeClientConfig) -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_millis(cfg.timeout_ms))
            .user_agent(cfg.user_agent.clone())
            .build()
            .map_err(ApiError::Http)?;

        Ok(Self { cfg, http })
    }

    /// Get a reference to the current configuration.
    #[must_use]
    pub const fn config(&self) -> &LinodeClientConfig {
        &self.cfg
    }

    #[inline]
    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.cfg.api_url.trim_end_matches('/'), path)
    }

    /// Send one request and return the raw response body.
    async fn execute(
        &self,
        method: Method,
        path: &str,
        body: Option<serde_json::Value>,
    ) -> Result<String, ApiError> {
        let mut req = self
            .http
            .request(method.clone(), self.url(path))
            .bearer_auth(&self.cfg.token);
        if let Some(body) = &body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(ApiError::Http)?;
        let status = resp.status();

        tracing::debug!(%method, path, status = status.as_u16(), "linode api call");

        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(ApiError::NotFound {
                path: path.to_string(),
            });
        }
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            return Err(ApiError::Status {
                status: status.as_u16(),
                body: text,
            });
        }

        resp.text().await.map_err(ApiError::Http)
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let body = self.execute(Method::GET, path, None).await?;
        decode(body)
    }

    async fn send<B: Serialize + Sync, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        payload: &B,
    ) -> Result<T, ApiError> {
        let value = serde_json::to_value(payload).map_err(|source| ApiError::Json {
            source,
            body: String::new(),
        })?;
        let body = self.execute(method, path, Some(value)).await?;
        decode(body)
    }

    async fn remove(&self, path: &str) -> Result<(), ApiError> {
        self.execute(Method::DELETE, path, None).await.map(|_| ())
    }
}

#[async_trait]
impl LinodeApi for LinodeClient {
    async fn get_image(&self, id: &str) -> Result<Image, ApiError> {
        self.get(&format!("images/{id}")).await
    }

    async fn create_image(&self, opts: &ImageCreateOptions) -> Result<Image, ApiError> {
        self.send(Method::POST, "images", opts).await
    }

    async fn update_image(&self, id: &str, opts: &ImageUpdateOptions) -> Result<Image, ApiError> {
        self.send(Method::PUT, &format!("images/{id}"), opts).await
    }

    async fn delete_image(&self, id: &str) -> Result<(), ApiError> {
        self.remove(&format!("images/{id}")).await
    }

    async fn get_instance_disk(&self, linode_id: i64, disk_id: i64) -> Result<InstanceDisk, ApiError> {
        self.get(&format!("linode/instances/{linode_id}/disks/{disk_id}"))
            .await
    }

    async fn get_ssh_key(&self, id: i64) -> Result<SshKey, ApiError> {
        self.get(&format!("profile/sshkeys/{id}")).await
    }

    async fn create_ssh_key(&self, opts: &SshKeyCreateOptions) -> Result<SshKey, ApiError> {
        self.send(Method::POST, "profile/sshkeys", opts).await
    }

    async fn update_ssh_key(&self, id: i64, opts: &SshKeyUpdateOptions) -> Result<SshKey, ApiError> {
        self.send(Method::PUT, &format!("profile/sshkeys/{id}"), opts)
            .await
    }

    async fn delete_ssh_key(&self, id: i64) -> Result<(), ApiError> {
        self.remove(&format!("profile/sshkeys/{id}")).await
    }

    async fn get_template(&self, id: i64) -> Result<Template, ApiError> {
        self.get(&format!("templates/{id}")).await
    }

    async fn create_template(&self, opts: &TemplateCreateOptions) -> Result<Template, ApiError> {
        self.send(Method::POST, "templates", opts).await
    }

    async fn update_template(&self, id: i64, opts: &TemplateUpdateOptions) -> Result<Template, ApiError> {
        self.send(Method::PUT, &format!("templates/{id}"), opts).await
    }

    async fn delete_template(&self, id: i64) -> Result<(), ApiError> {
        self.remove(&format!("templates/{id}")).await
    }
}

fn decode<T: DeserializeOwned>(body: String) -> Result<T, ApiError> {
    serde_json::from_str(&body).map_err(|source| ApiError::Json { source, body })
}

// ============================================================================
// Entities
// ============================================================================

/// A Linode image (private or public).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Image {
    /// Image ID, e.g. `private/9001` or `linode/debian12`.
    pub id: String,
    /// Short label.
    #[serde(default)]
    pub label: String,
    /// Detailed description.
    #[serde(default)]
    pub description: Option<String>,
    /// Creation time.
    #[serde(default, deserialize_with = "linode_time::deserialize")]
    pub created: Option<DateTime<Utc>>,
    /// User who created the image.
    #[serde(default)]
    pub created_by: Option<String>,
    /// Whether the image is deprecated.
    #[serde(default)]
    pub deprecated: bool,
    /// Whether the image is public.
    #[serde(default)]
    pub is_public: bool,
    /// Minimum deploy size in MB.
    #[serde(default)]
    pub size: i64,
    /// "manual" or "automatic".
    #[serde(default, rename = "type")]
    pub image_type: String,
    /// Expiry of automatic images.
    #[serde(default, deserialize_with = "linode_time::deserialize")]
    pub expiry: Option<DateTime<Utc>>,
    /// Upstream distribution vendor; none for private images.
    #[serde(default)]
    pub vendor: Option<String>,
    /// Current status, e.g. "creating" or "available".
    #[serde(default)]
    pub status: Option<String>,
}

/// Status of an instance disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum DiskStatus {
    /// Disk is idle and usable.
    #[serde(rename = "ready")]
    Ready,
    /// Disk is busy (resizing, imaging, ...).
    #[serde(rename = "not ready")]
    NotReady,
    /// Disk is being deleted.
    #[serde(rename = "deleting")]
    Deleting,
    /// Status this client does not know about.
    #[serde(other)]
    Unknown,
}

impl std::fmt::Display for DiskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ready => write!(f, "ready"),
            Self::NotReady => write!(f, "not ready"),
            Self::Deleting => write!(f, "deleting"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A disk attached to a Linode instance.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct InstanceDisk {
    /// Disk ID.
    pub id: i64,
    /// Disk label.
    #[serde(default)]
    pub label: String,
    /// Current status.
    pub status: DiskStatus,
    /// Size in MB.
    #[serde(default)]
    pub size: i64,
}

/// An SSH key of the current profile.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SshKey {
    /// Key ID.
    pub id: i64,
    /// Key label.
    #[serde(default)]
    pub label: String,
    /// Public key.
    #[serde(default)]
    pub ssh_key: String,
    /// When the key was added.
    #[serde(default, deserialize_with = "linode_time::deserialize")]
    pub created: Option<DateTime<Utc>>,
}

/// A template resource.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Template {
    /// Template ID.
    pub id: i64,
    /// Template label.
    #[serde(default)]
    pub label: String,
    /// Readiness status code.
    #[serde(default)]
    pub status: i64,
}

// ============================================================================
// Request options
// ============================================================================

/// Body of `POST /images`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageCreateOptions {
    /// Disk to image.
    pub disk_id: i64,
    /// Image label.
    pub label: String,
    /// Image description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Body of `PUT /images/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ImageUpdateOptions {
    /// New label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    /// New description.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// Body of `POST /profile/sshkeys`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SshKeyCreateOptions {
    /// Key label.
    pub label: String,
    /// Public key.
    pub ssh_key: String,
}

/// Body of `PUT /profile/sshkeys/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SshKeyUpdateOptions {
    /// New label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Body of `POST /templates`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TemplateCreateOptions {
    /// Template label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

/// Body of `PUT /templates/{id}`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TemplateUpdateOptions {
    /// New label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

// ============================================================================
// Error type
// ============================================================================

/// Classification of an API failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiErrorKind {
    /// The entity does not exist.
    NotFound,
    /// Worth retrying later (throttling, 5xx, network).
    Transient,
    /// Retrying will not help.
    Fatal,
}

/// Error type for Linode API calls.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The entity does not exist (HTTP 404).
    #[error("not found: {path}")]
    NotFound {
        /// Request path.
        path: String,
    },
    /// Non-success HTTP status.
    #[error("linode api error: status={status}, body={body}")]
    Status {
        /// HTTP status code.
        status: u16,
        /// Response body.
        body: String,
    },
    /// HTTP client error.
    #[error("http error: {0}")]
    Http(#[source] reqwest::Error),
    /// JSON encoding or decoding error.
    #[error("json error: {source}")]
    Json {
        /// The JSON error.
        #[source]
        source: serde_json::Error,
        /// The offending body.
        body: String,
    },
}

impl ApiError {
    /// Classify this error.
    #[must_use]
    pub fn kind(&self) -> ApiErrorKind {
        match self {
            Self::NotFound { .. } => ApiErrorKind::NotFound,
            Self::Status { status, .. } if is_retryable_status(*status) => ApiErrorKind::Transient,
            Self::Http(e) if is_retryable_reqwest(e) => ApiErrorKind::Transient,
            Self::Status { .. } | Self::Http(_) | Self::Json { .. } => ApiErrorKind::Fatal,
        }
    }

    /// Whether the entity does not exist.
    #[must_use]
    pub fn is_not_found(&self) -> bool {
        self.kind() == ApiErrorKind::NotFound
    }
}

impl Retryable for ApiError {
    fn is_transient(&self) -> bool {
        self.kind() == ApiErrorKind::Transient
    }
}

#[inline]
const fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 409 | 425 | 429 | 500 | 502 | 503 | 504)
}

#[inline]
fn is_retryable_reqwest(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect()
}

/// Linode timestamps: `2018-01-01T00:01:01` (UTC, no offset) or RFC 3339.
mod linode_time {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer};

    const FORMAT: &str = "%Y-%m-%dT%H:%M:%S";

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.filter(|s| !s.trim().is_empty())
            .map(|s| parse(&s).map_err(serde::de::Error::custom))
            .transpose()
    }

    fn parse(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
        DateTime::parse_from_rfc3339(raw)
            .map(|t| t.with_timezone(&Utc))
            .or_else(|_| NaiveDateTime::parse_from_str(raw, FORMAT).map(|n| n.and_utc()))
    }
}
