//! Transient-failure classification

use keystone_core::{Failure, FailureKind};
use std::collections::HashSet;
use std::error::Error as StdError;
use std::sync::Arc;

use crate::catalog::PolicyCatalog;

/// Cause chains deeper than this are cut off
const MAX_CHAIN_DEPTH: usize = 64;

/// Outcome of classifying one failure occurrence
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// Eligible for the policy pipeline; `matched` is the kind whose rule applies
    Transient {
        kinds: Vec<FailureKind>,
        matched: FailureKind,
    },
    /// Not eligible: either no kind in the chain is transient or no policy is registered
    Miss { kinds: Vec<FailureKind> },
}

impl Classification {
    pub fn is_transient(&self) -> bool {
        matches!(self, Classification::Transient { .. })
    }

    /// Kinds found in the cause chain, outermost first
    pub fn kinds(&self) -> &[FailureKind] {
        match self {
            Classification::Transient { kinds, .. } | Classification::Miss { kinds } => kinds,
        }
    }
}

/// Tests raised failures against the transient-failure catalog
#[derive(Debug, Clone)]
pub struct ExceptionClassifier {
    catalog: Arc<PolicyCatalog>,
}

impl ExceptionClassifier {
    pub fn new(catalog: Arc<PolicyCatalog>) -> Self {
        Self { catalog }
    }

    pub fn catalog(&self) -> &Arc<PolicyCatalog> {
        &self.catalog
    }

    /// Kinds found along the cause chain of `error`, outermost first,
    /// without duplicates
    ///
    /// Errors that carry no known kind are skipped. The walk stops when the
    /// chain ends, revisits an error it has already seen, or gets too deep.
    pub fn flatten(error: &(dyn StdError + 'static)) -> Vec<FailureKind> {
        let mut kinds = Vec::new();
        let mut seen: HashSet<*const ()> = HashSet::new();
        let mut current = Some(error);

        while let Some(err) = current {
            let address = err as *const dyn StdError as *const ();
            if !seen.insert(address) || seen.len() > MAX_CHAIN_DEPTH {
                break;
            }
            if let Some(kind) = FailureKind::of_error(err) {
                if !kinds.contains(&kind) {
                    kinds.push(kind);
                }
            }
            current = err.source();
        }

        kinds
    }

    /// Classify a failure; nothing is transient when no policy is registered
    pub fn classify(&self, failure: &Failure, policies_registered: bool) -> Classification {
        let kinds = Self::flatten(failure);
        if !policies_registered {
            return Classification::Miss { kinds };
        }

        match kinds.iter().copied().find(|kind| self.catalog.is_transient(*kind)) {
            Some(matched) => Classification::Transient { kinds, matched },
            None => Classification::Miss { kinds },
        }
    }

    pub fn is_transient(&self, failure: &Failure, policies_registered: bool) -> bool {
        self.classify(failure, policies_registered).is_transient()
    }

    /// Whether policies inside a chain should act on `failure`
    ///
    /// Failures the chain produces itself (an open circuit, a cancelled
    /// call) are never handled.
    pub fn is_handled(&self, failure: &Failure) -> bool {
        match failure.kind() {
            FailureKind::CircuitOpen | FailureKind::Cancelled => false,
            _ => Self::flatten(failure)
                .into_iter()
                .any(|kind| self.catalog.is_transient(kind)),
        }
    }
}
