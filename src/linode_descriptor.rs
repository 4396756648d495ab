//! Resource descriptors.
//!
//! Unique responsibility: declare the attributes of one resource kind (name, value
//! type, required / computed / immutable) and validate a desired state against them.
//!
//! Non-goals:
//! - Call the Linode API (done by `linode_resources.rs`).
//! - Decide what to do with a change (done by `linode_diff.rs` / `linode_reconciler.rs`).
//!
//! Desired state is checked once, here, at the boundary. Everything downstream
//! works with `AttrValue`s whose types already match their declaration.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use thiserror::Error;

/// Declared type of an attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValueType {
    /// UTF-8 string.
    String,
    /// Signed integer.
    Int,
    /// Boolean.
    Bool,
    /// UTC timestamp.
    Timestamp,
}

impl ValueType {
    /// Zero value used when an optional attribute is left unset.
    ///
    /// Timestamps have no zero value.
    #[must_use]
    pub fn zero(self) -> Option<AttrValue> {
        match self {
            Self::String => Some(AttrValue::String(String::new())),
            Self::Int => Some(AttrValue::Int(0)),
            Self::Bool => Some(AttrValue::Bool(false)),
            Self::Timestamp => None,
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String => write!(f, "string"),
            Self::Int => write!(f, "int"),
            Self::Bool => write!(f, "bool"),
            Self::Timestamp => write!(f, "timestamp"),
        }
    }
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttrValue {
    /// String value.
    String(String),
    /// Integer value.
    Int(i64),
    /// Boolean value.
    Bool(bool),
    /// Timestamp value.
    Timestamp(DateTime<Utc>),
}

impl AttrValue {
    /// The type tag of this value.
    #[must_use]
    pub const fn value_type(&self) -> ValueType {
        match self {
            Self::String(_) => ValueType::String,
            Self::Int(_) => ValueType::Int,
            Self::Bool(_) => ValueType::Bool,
            Self::Timestamp(_) => ValueType::Timestamp,
        }
    }

    /// Whether this is the zero value of its type.
    #[must_use]
    pub fn is_zero(&self) -> bool {
        match self {
            Self::String(s) => s.is_empty(),
            Self::Int(i) => *i == 0,
            Self::Bool(b) => !*b,
            Self::Timestamp(_) => false,
        }
    }
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::String(s) => write!(f, "{s:?}"),
            Self::Int(i) => write!(f, "{i}"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Timestamp(t) => write!(f, "{}", t.to_rfc3339()),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

impl From<i64> for AttrValue {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<bool> for AttrValue {
    fn from(value: bool) -> Self {
        Self::Bool(value)
    }
}

impl From<DateTime<Utc>> for AttrValue {
    fn from(value: DateTime<Utc>) -> Self {
        Self::Timestamp(value)
    }
}

/// Attribute name to value mapping (desired or observed state).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attributes(BTreeMap<String, AttrValue>);

impl Attributes {
    /// Create an empty attribute set.
    #[must_use]
    pub const fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Builder-style insert.
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.0.insert(name.into(), value.into());
        self
    }

    /// Insert a value, returning the previous one.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<AttrValue>) -> Option<AttrValue> {
        self.0.insert(name.into(), value.into())
    }

    /// Get a value by name.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&AttrValue> {
        self.0.get(name)
    }

    /// Whether the attribute is set.
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.0.contains_key(name)
    }

    /// Get a string attribute.
    #[must_use]
    pub fn get_str(&self, name: &str) -> Option<&str> {
        match self.0.get(name) {
            Some(AttrValue::String(s)) => Some(s),
            _ => None,
        }
    }

    /// Get an integer attribute.
    #[must_use]
    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.0.get(name) {
            Some(AttrValue::Int(i)) => Some(*i),
            _ => None,
        }
    }

    /// Get a boolean attribute.
    #[must_use]
    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.0.get(name) {
            Some(AttrValue::Bool(b)) => Some(*b),
            _ => None,
        }
    }

    /// Get a timestamp attribute.
    #[must_use]
    pub fn get_timestamp(&self, name: &str) -> Option<DateTime<Utc>> {
        match self.0.get(name) {
            Some(AttrValue::Timestamp(t)) => Some(*t),
            _ => None,
        }
    }

    /// Get a required string attribute of `kind`.
    ///
    /// # Errors
    ///
    /// Returns `MissingRequired` or `TypeMismatch`.
    pub fn require_str(&self, kind: &'static str, name: &'static str) -> Result<&str, ValidationError> {
        match self.0.get(name) {
            Some(AttrValue::String(s)) => Ok(s),
            Some(other) => Err(ValidationError::TypeMismatch {
                kind,
                name: name.to_string(),
                expected: ValueType::String,
                found: other.value_type(),
            }),
            None => Err(ValidationError::MissingRequired { kind, name }),
        }
    }

    /// Get a required integer attribute of `kind`.
    ///
    /// # Errors
    ///
    /// Returns `MissingRequired` or `TypeMismatch`.
    pub fn require_int(&self, kind: &'static str, name: &'static str) -> Result<i64, ValidationError> {
        match self.0.get(name) {
            Some(AttrValue::Int(i)) => Ok(*i),
            Some(other) => Err(ValidationError::TypeMismatch {
                kind,
                name: name.to_string(),
                expected: ValueType::Int,
                found: other.value_type(),
            }),
            None => Err(ValidationError::MissingRequired { kind, name }),
        }
    }

    /// Number of attributes set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Whether no attribute is set.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Iterate attributes in name order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &AttrValue)> {
        self.0.iter()
    }
}

impl FromIterator<(String, AttrValue)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (String, AttrValue)>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Declaration of one attribute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttributeSpec {
    /// Attribute name.
    pub name: &'static str,
    /// Declared value type.
    pub value_type: ValueType,
    /// Must be present in every desired state.
    pub required: bool,
    /// Assigned by the server; never part of desired state.
    pub computed: bool,
    /// A change forces replacement instead of an in-place update.
    pub immutable: bool,
}

impl AttributeSpec {
    /// A required, updatable attribute.
    #[must_use]
    pub const fn required(name: &'static str, value_type: ValueType) -> Self {
        Self {
            name,
            value_type,
            required: true,
            computed: false,
            immutable: false,
        }
    }

    /// An optional, updatable attribute.
    #[must_use]
    pub const fn optional(name: &'static str, value_type: ValueType) -> Self {
        Self {
            name,
            value_type,
            required: false,
            computed: false,
            immutable: false,
        }
    }

    /// A server-assigned attribute.
    #[must_use]
    pub const fn computed(name: &'static str, value_type: ValueType) -> Self {
        Self {
            name,
            value_type,
            required: false,
            computed: true,
            immutable: false,
        }
    }

    /// Mark the attribute as force-new.
    #[must_use]
    pub const fn force_new(mut self) -> Self {
        self.immutable = true;
        self
    }

    /// Whether a change can be applied in place.
    #[must_use]
    pub const fn is_updatable(&self) -> bool {
        !self.computed && !self.immutable
    }
}

/// Attribute declarations of one resource kind.
#[derive(Debug, Clone, Copy)]
pub struct ResourceDescriptor {
    kind: &'static str,
    attributes: &'static [AttributeSpec],
}

impl ResourceDescriptor {
    /// Create a descriptor.
    #[must_use]
    pub const fn new(kind: &'static str, attributes: &'static [AttributeSpec]) -> Self {
        Self { kind, attributes }
    }

    /// Resource kind name, e.g. `linode_image`.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        self.kind
    }

    /// All declared attributes.
    #[must_use]
    pub const fn attributes(&self) -> &'static [AttributeSpec] {
        self.attributes
    }

    /// Look up the declaration of `name`.
    ///
    /// # Errors
    ///
    /// Returns `UnknownAttribute` for names this kind does not declare.
    pub fn attribute_spec(&self, name: &str) -> Result<&'static AttributeSpec, ValidationError> {
        self.attributes
            .iter()
            .find(|spec| spec.name == name)
            .ok_or_else(|| ValidationError::UnknownAttribute {
                kind: self.kind,
                name: name.to_string(),
            })
    }

    /// Validate a desired state.
    ///
    /// Every supplied attribute must be declared, settable and of its declared
    /// type, and every required attribute must be present.
    ///
    /// # Errors
    ///
    /// Returns the first violation found.
    pub fn validate(&self, desired: &Attributes) -> Result<(), ValidationError> {
        for (name, value) in desired.iter() {
            let spec = self.attribute_spec(name)?;
            if spec.computed {
                return Err(ValidationError::ComputedAttribute {
                    kind: self.kind,
                    name: name.clone(),
                });
            }
            if value.value_type() != spec.value_type {
                return Err(ValidationError::TypeMismatch {
                    kind: self.kind,
                    name: name.clone(),
                    expected: spec.value_type,
                    found: value.value_type(),
                });
            }
        }

        if let Some(missing) = self
            .attributes
            .iter()
            .find(|spec| spec.required && !desired.contains(spec.name))
        {
            return Err(ValidationError::MissingRequired {
                kind: self.kind,
                name: missing.name,
            });
        }

        Ok(())
    }

    /// Merge a fresh remote observation with the prior one.
    ///
    /// Settable attributes the API does not echo back (e.g. the disk an image
    /// was taken from) are carried over from `prior`. Computed attributes always
    /// come from `fetched` alone.
    #[must_use]
    pub fn normalize(&self, prior: Option<&Attributes>, fetched: Attributes) -> Attributes {
        let Some(prior) = prior else {
            return fetched;
        };

        let mut merged = fetched;
        for spec in self.attributes.iter().filter(|spec| !spec.computed) {
            if !merged.contains(spec.name)
                && let Some(value) = prior.get(spec.name)
            {
                merged.insert(spec.name, value.clone());
            }
        }
        merged
    }
}

/// Errors raised while validating desired state.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    /// Attribute is not declared by the resource kind.
    #[error("{kind}: unknown attribute {name:?}")]
    UnknownAttribute {
        /// Resource kind.
        kind: &'static str,
        /// Attribute name.
        name: String,
    },
    /// Required attribute is absent.
    #[error("{kind}: missing required attribute {name:?}")]
    MissingRequired {
        /// Resource kind.
        kind: &'static str,
        /// Attribute name.
        name: &'static str,
    },
    /// Value does not match the declared type.
    #[error("{kind}: attribute {name:?} expects {expected}, got {found}")]
    TypeMismatch {
        /// Resource kind.
        kind: &'static str,
        /// Attribute name.
        name: String,
        /// Declared type.
        expected: ValueType,
        /// Supplied type.
        found: ValueType,
    },
    /// Computed attributes cannot be supplied.
    #[error("{kind}: attribute {name:?} is computed by the server and cannot be set")]
    ComputedAttribute {
        /// Resource kind.
        kind: &'static str,
        /// Attribute name.
        name: String,
    },
    /// Identifier cannot be used with this resource kind.
    #[error("{kind}: malformed identifier {id:?}: {reason}")]
    MalformedId {
        /// Resource kind.
        kind: &'static str,
        /// The rejected identifier.
        id: String,
        /// The reason for rejection.
        reason: &'static str,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    const ATTRS: &[AttributeSpec] = &[
        AttributeSpec::required("label", ValueType::String),
        AttributeSpec::required("disk_id", ValueType::Int).force_new(),
        AttributeSpec::optional("description", ValueType::String),
        AttributeSpec::computed("size", ValueType::Int),
    ];
    const DESCRIPTOR: ResourceDescriptor = ResourceDescriptor::new("test_image", ATTRS);

    fn desired() -> Attributes {
        Attributes::new().with("label", "web-1").with("disk_id", 100_i64)
    }

    #[test]
    fn attribute_spec_reports_flags() {
        let spec = DESCRIPTOR.attribute_spec("disk_id").unwrap();
        assert!(spec.required);
        assert!(spec.immutable);
        assert!(!spec.is_updatable());
        assert!(DESCRIPTOR.attribute_spec("label").unwrap().is_updatable());
    }

    #[test]
    fn attribute_spec_rejects_unknown_names() {
        assert_eq!(
            DESCRIPTOR.attribute_spec("colour"),
            Err(ValidationError::UnknownAttribute {
                kind: "test_image",
                name: "colour".to_string(),
            })
        );
    }

    #[test]
    fn validate_accepts_complete_state() {
        assert_eq!(DESCRIPTOR.validate(&desired()), Ok(()));
        assert_eq!(
            DESCRIPTOR.validate(&desired().with("description", "nightly")),
            Ok(())
        );
    }

    #[test]
    fn validate_requires_required_attributes() {
        let partial = Attributes::new().with("label", "web-1");
        assert_eq!(
            DESCRIPTOR.validate(&partial),
            Err(ValidationError::MissingRequired {
                kind: "test_image",
                name: "disk_id",
            })
        );
    }

    #[test]
    fn validate_rejects_wrong_types() {
        let wrong = desired().with("disk_id", "100");
        assert!(matches!(
            DESCRIPTOR.validate(&wrong),
            Err(ValidationError::TypeMismatch {
                expected: ValueType::Int,
                found: ValueType::String,
                ..
            })
        ));
    }

    #[test]
    fn validate_rejects_computed_attributes() {
        let with_size = desired().with("size", 2048_i64);
        assert!(matches!(
            DESCRIPTOR.validate(&with_size),
            Err(ValidationError::ComputedAttribute { .. })
        ));
    }

    #[test]
    fn normalize_carries_write_only_attributes() {
        let prior = desired().with("size", 1_i64);
        let fetched = Attributes::new().with("label", "web-2").with("size", 2048_i64);

        let merged = DESCRIPTOR.normalize(Some(&prior), fetched);

        assert_eq!(merged.get_str("label"), Some("web-2"));
        assert_eq!(merged.get_int("disk_id"), Some(100));
        assert_eq!(merged.get_int("size"), Some(2048));
    }

    #[test]
    fn normalize_drops_stale_computed_attributes() {
        let prior = desired().with("size", 1_i64);
        let merged = DESCRIPTOR.normalize(Some(&prior), Attributes::new().with("label", "web-1"));
        assert!(!merged.contains("size"));
    }

    #[test]
    fn require_helpers_report_type_errors() {
        let attrs = desired();
        assert_eq!(attrs.require_str("test_image", "label"), Ok("web-1"));
        assert_eq!(attrs.require_int("test_image", "disk_id"), Ok(100));
        assert!(matches!(
            attrs.require_int("test_image", "label"),
            Err(ValidationError::TypeMismatch { .. })
        ));
        assert!(matches!(
            attrs.require_str("test_image", "description"),
            Err(ValidationError::MissingRequired { .. })
        ));
    }
}
