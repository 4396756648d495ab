//! Change detection between desired and previously observed attributes.
//!
//! Computed attributes are never compared. An optional attribute left out of the
//! desired state is compared as the zero value of its type, so an empty
//! description read back from the API does not show up as drift.

use std::collections::BTreeSet;

use crate::linode_descriptor::{AttrValue, Attributes, ResourceDescriptor, ValidationError};

/// Attribute names that differ between desired and observed state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    updatable: BTreeSet<String>,
    requires_replace: BTreeSet<String>,
}

impl ChangeSet {
    /// Whether nothing changed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.updatable.is_empty() && self.requires_replace.is_empty()
    }

    /// Changed attributes that can be updated in place.
    #[must_use]
    pub const fn updatable(&self) -> &BTreeSet<String> {
        &self.updatable
    }

    /// Changed attributes that force a replacement.
    #[must_use]
    pub const fn requires_replace(&self) -> &BTreeSet<String> {
        &self.requires_replace
    }

    /// Whether the change can only be applied by delete-then-create.
    #[must_use]
    pub fn needs_replace(&self) -> bool {
        !self.requires_replace.is_empty()
    }

    /// All changed attribute names, in order.
    #[must_use]
    pub fn changed(&self) -> Vec<String> {
        self.updatable
            .union(&self.requires_replace)
            .cloned()
            .collect()
    }

    /// Build the update payload: the desired value of every updatable change.
    ///
    /// An optional attribute removed from the desired state is sent as its
    /// zero value so the server clears it.
    #[must_use]
    pub fn payload(&self, descriptor: &ResourceDescriptor, desired: &Attributes) -> Attributes {
        self.updatable
            .iter()
            .filter_map(|name| {
                let value = desired.get(name).cloned().or_else(|| {
                    descriptor
                        .attribute_spec(name)
                        .ok()
                        .and_then(|spec| spec.value_type.zero())
                })?;
                Some((name.clone(), value))
            })
            .collect()
    }
}

/// Compare `desired` against `previous` for one resource kind.
///
/// # Errors
///
/// Returns `UnknownAttribute` if `desired` holds an undeclared name.
pub fn diff(
    descriptor: &ResourceDescriptor,
    desired: &Attributes,
    previous: &Attributes,
) -> Result<ChangeSet, ValidationError> {
    for (name, _) in desired.iter() {
        descriptor.attribute_spec(name)?;
    }

    let mut changes = ChangeSet::default();
    for spec in descriptor.attributes().iter().filter(|spec| !spec.computed) {
        if effective(desired.get(spec.name)) == effective(previous.get(spec.name)) {
            continue;
        }
        let name = spec.name.to_string();
        if spec.immutable {
            changes.requires_replace.insert(name);
        } else {
            changes.updatable.insert(name);
        }
    }

    Ok(changes)
}

fn effective(value: Option<&AttrValue>) -> Option<&AttrValue> {
    value.filter(|v| !v.is_zero())
}
