//! The closure of state and methods reachable from a method.

use std::{collections::BTreeSet, fmt};

use serde::{Deserialize, Serialize};

use crate::ir::MethodKey;

/// Identity of a field or property: declaring type plus member name.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MemberId {
    /// Full name of the declaring type
    pub type_name: String,
    /// Member name
    pub name: String,
}

impl MemberId {
    /// Creates a member identity.
    #[must_use]
    pub fn new(type_name: impl Into<String>, name: impl Into<String>) -> Self {
        MemberId {
            type_name: type_name.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}::{}", self.type_name, self.name)
    }
}

/// Everything a method may touch, transitively.
///
/// Built once per method by the [`crate::analysis::ReferenceDiscoverer`] and recorded on
/// the rewritten method, so the execution client knows which non-local state to ship and
/// the server knows which state to hand back.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReachableMembers {
    /// Fields of the declaring type
    pub fields: BTreeSet<MemberId>,
    /// Properties of the declaring type
    pub properties: BTreeSet<MemberId>,
    /// Methods called directly or indirectly, accessors included
    pub methods: BTreeSet<MethodKey>,
    /// Other code modules the closure depends on
    pub modules: BTreeSet<String>,
}

impl ReachableMembers {
    /// Merges another closure into this one.
    pub fn merge(&mut self, other: &ReachableMembers) {
        self.fields.extend(other.fields.iter().cloned());
        self.properties.extend(other.properties.iter().cloned());
        self.methods.extend(other.methods.iter().cloned());
        self.modules.extend(other.modules.iter().cloned());
    }

    /// Returns `true` if the closure touches no fields or properties.
    #[must_use]
    pub fn is_stateless(&self) -> bool {
        self.fields.is_empty() && self.properties.is_empty()
    }

    /// Checks whether the closure contains the field `type_name::name`.
    #[must_use]
    pub fn has_field(&self, type_name: &str, name: &str) -> bool {
        self.fields.contains(&MemberId::new(type_name, name))
    }

    /// Checks whether the closure contains the property `type_name::name`.
    #[must_use]
    pub fn has_property(&self, type_name: &str, name: &str) -> bool {
        self.properties.contains(&MemberId::new(type_name, name))
    }

    /// Checks whether the closure contains a method named `name` on `type_name`.
    #[must_use]
    pub fn has_method(&self, type_name: &str, name: &str) -> bool {
        self.methods
            .iter()
            .any(|key| key.type_name == type_name && key.name == name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_merge_is_a_union() {
        let mut a = ReachableMembers::default();
        a.fields.insert(MemberId::new("Shop.Cart", "total"));
        a.modules.insert("Billing.nmod".to_string());

        let mut b = ReachableMembers::default();
        b.fields.insert(MemberId::new("Shop.Cart", "total"));
        b.properties.insert(MemberId::new("Shop.Cart", "Count"));

        a.merge(&b);
        assert_eq!(a.fields.len(), 1);
        assert!(a.has_property("Shop.Cart", "Count"));
        assert!(!a.is_stateless());
        assert!(ReachableMembers::default().is_stateless());
    }
}
