//! The policy instances registered for an executor

use keystone_config::{ConfigResult, PolicyTableConfig, Validatable};
use keystone_core::{NamedPolicy, PolicyDefinition};

use crate::catalog::PolicyCatalog;

/// Registered policies, looked up by declared name
#[derive(Debug, Clone, Default)]
pub struct PolicySet {
    policies: Vec<NamedPolicy>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a policy; a later registration under the same name replaces
    /// the earlier one
    pub fn push(&mut self, policy: impl Into<NamedPolicy>) -> &mut Self {
        let policy = policy.into();
        self.policies.retain(|p| !p.answers_to(&policy.name));
        self.policies.push(policy);
        self
    }

    /// Builder form of [`push`](Self::push)
    pub fn with(mut self, policy: impl Into<NamedPolicy>) -> Self {
        self.push(policy);
        self
    }

    /// Policies declared in the catalog's table
    pub fn from_catalog(catalog: &PolicyCatalog) -> Self {
        catalog.declared_policies().iter().cloned().collect()
    }

    /// Policies declared in a table document, validated
    pub fn from_config(table: &PolicyTableConfig) -> ConfigResult<Self> {
        table.validate()?;
        Ok(table.policies.iter().cloned().collect())
    }

    pub fn is_empty(&self) -> bool {
        self.policies.is_empty()
    }

    pub fn len(&self) -> usize {
        self.policies.len()
    }

    pub fn find(&self, name: &str) -> Option<&NamedPolicy> {
        self.policies.iter().find(|p| p.answers_to(name))
    }

    pub fn iter(&self) -> impl Iterator<Item = &NamedPolicy> {
        self.policies.iter()
    }
}

impl FromIterator<NamedPolicy> for PolicySet {
    fn from_iter<I: IntoIterator<Item = NamedPolicy>>(iter: I) -> Self {
        let mut set = PolicySet::new();
        for policy in iter {
            set.push(policy);
        }
        set
    }
}

impl FromIterator<PolicyDefinition> for PolicySet {
    fn from_iter<I: IntoIterator<Item = PolicyDefinition>>(iter: I) -> Self {
        iter.into_iter().map(NamedPolicy::from).collect()
    }
}
