//! Policy composition
//!
//! Selects the registered policies the catalog lists for a failure, binds the
//! compensating action to the fallback, and hands the result to
//! [`PolicyChain`], which nests them in stage order.

use keystone_core::{Failure, FailureKind, NamedPolicy};
use keystone_logging::Logger;
use std::sync::Arc;

use crate::catalog::PolicyCatalog;
use crate::chain::PolicyChain;
use crate::classifier::{Classification, ExceptionClassifier};
use crate::policy_set::PolicySet;
use crate::work::Compensation;

/// A composed chain and whatever could not be bound into it
#[derive(Debug)]
pub struct Composition {
    pub chain: PolicyChain,
    /// The compensating action when no fallback took it
    pub unbound: Option<Compensation>,
    /// Catalog names with no registered policy
    pub missing: Vec<String>,
}

impl Composition {
    /// Whether the chain's fallback took the compensating action
    pub fn compensation_consumed(&self) -> bool {
        self.chain.has_bound_fallback()
    }
}

pub struct PolicyComposer {
    classifier: ExceptionClassifier,
    logger: Arc<dyn Logger>,
}

impl PolicyComposer {
    pub fn new(catalog: Arc<PolicyCatalog>, logger: Arc<dyn Logger>) -> Self {
        Self {
            classifier: ExceptionClassifier::new(catalog),
            logger,
        }
    }

    pub fn classifier(&self) -> &ExceptionClassifier {
        &self.classifier
    }

    /// Compose the chain for one failure occurrence
    ///
    /// Names the catalog lists but `injected` lacks are logged and skipped.
    /// Only the first fallback is kept, and fallbacks are dropped entirely
    /// when there is no compensating action to bind.
    pub fn compose(
        &self,
        failure: &Failure,
        injected: &PolicySet,
        compensation: Option<Compensation>,
    ) -> Composition {
        let selected_kind = match self.classifier.classify(failure, !injected.is_empty()) {
            Classification::Transient { matched, .. } => Some(matched),
            Classification::Miss { .. } => None,
        };
        let names = selected_kind
            .map(|kind| self.classifier.catalog().rules_for(kind))
            .unwrap_or(&[]);

        let mut selected: Vec<NamedPolicy> = Vec::with_capacity(names.len());
        let mut missing = Vec::new();
        for name in names {
            match injected.find(name) {
                Some(policy) => selected.push(policy.clone()),
                None => missing.push(name.clone()),
            }
        }

        if !missing.is_empty() {
            self.warn_missing(selected_kind, &missing);
        }

        let mut fallback_seen = false;
        selected.retain(|policy| {
            if !policy.definition.is_fallback() {
                return true;
            }
            let keep = compensation.is_some() && !fallback_seen;
            fallback_seen = true;
            keep
        });

        let mut chain = PolicyChain::new(selected, self.classifier.clone(), self.logger.clone());
        let unbound = match compensation {
            Some(compensation) => chain.bind(compensation).err(),
            None => None,
        };

        self.logger.debug(&format!(
            "Composed policy chain [{}] for {}",
            chain.names().join(", "),
            failure.kind()
        ));

        Composition {
            chain,
            unbound,
            missing,
        }
    }

    fn warn_missing(&self, kind: Option<FailureKind>, missing: &[String]) {
        let kind = kind.map(FailureKind::identifier).unwrap_or("unknown failure");
        self.logger.warn(&format!(
            "Policies listed for {} but not registered: {}",
            kind,
            missing.join(", ")
        ));
    }
}

impl std::fmt::Debug for PolicyComposer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyComposer")
            .field("classifier", &self.classifier)
            .finish()
    }
}
