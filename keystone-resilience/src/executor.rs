//! Resilient execution of units of work
//!
//! The unit of work is invoked once directly. Only when that fails is the
//! failure classified; transient failures are retried through a composed
//! [`PolicyChain`](crate::chain::PolicyChain), everything else goes straight
//! to the compensating action and the throw decision.

use keystone_core::Failure;
use keystone_logging::Logger;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::catalog::LazyPolicyCatalog;
use crate::chain::ChainOutcome;
use crate::composer::{Composition, PolicyComposer};
use crate::error::{ResilienceError, ResilienceResult};
use crate::policy_set::PolicySet;
use crate::work::{Compensation, Deferred, Work};

/// What to do with a failed first invocation
enum Plan {
    /// Re-run through a composed chain
    Recover(Composition),
    /// Not transient: no policies apply
    Direct(Option<Compensation>),
    /// The catalog could not be built
    Misconfigured(ResilienceError, Option<Compensation>),
}

/// Wraps units of work in classification, policy execution and compensation
///
/// Stateless apart from its collaborators; one executor may serve many
/// concurrent callers.
pub struct ResilientExecutor {
    catalog: Arc<LazyPolicyCatalog>,
    policies: PolicySet,
    logger: Arc<dyn Logger>,
    throw_on_failure: bool,
}

impl ResilientExecutor {
    /// Executor that returns an error for unrecovered failures
    pub fn new(catalog: Arc<LazyPolicyCatalog>, policies: PolicySet, logger: Arc<dyn Logger>) -> Self {
        Self {
            catalog,
            policies,
            logger,
            throw_on_failure: true,
        }
    }

    /// With `false`, unrecovered failures are logged and yield `Ok(None)`
    pub fn with_throw_on_failure(mut self, throw_on_failure: bool) -> Self {
        self.throw_on_failure = throw_on_failure;
        self
    }

    pub fn throws_on_failure(&self) -> bool {
        self.throw_on_failure
    }

    pub fn policies(&self) -> &PolicySet {
        &self.policies
    }

    /// Execute a unit of work
    ///
    /// Returns `Ok(Some(value))` when the first invocation or a policy-driven
    /// re-invocation succeeds, `Ok(None)` when the failure was absorbed by a
    /// fallback or throwing is disabled.
    pub async fn execute<T: Send + 'static>(
        &self,
        mut work: Work<T>,
        token: CancellationToken,
        compensation: Option<Compensation>,
    ) -> ResilienceResult<Option<T>> {
        let failure = match work.invoke(token.clone()).await {
            Ok(value) => return Ok(Some(value)),
            Err(failure) => failure,
        };
        self.log_original(&failure);

        match self.plan(&failure, compensation) {
            Plan::Recover(Composition { mut chain, unbound, .. }) => {
                match chain.execute(&mut work, token.clone()).await {
                    ChainOutcome::Completed(value) => {
                        self.logger.info(&format!("Recovered from {} through the policy chain", failure.kind()));
                        Ok(Some(value))
                    }
                    ChainOutcome::Compensated { .. } => Ok(None),
                    ChainOutcome::Failed {
                        failure: secondary,
                        compensation: compensation_failure,
                    } => {
                        self.log_secondary(&secondary);
                        let compensation_failure = match unbound {
                            Some(action) => self.compensated(action.run(token).await),
                            None => compensation_failure,
                        };
                        self.unrecovered(failure, Some(secondary), compensation_failure)
                    }
                }
            }
            Plan::Direct(compensation) => {
                let compensation_failure = match compensation {
                    Some(action) => self.compensated(action.run(token).await),
                    None => None,
                };
                self.unrecovered(failure, None, compensation_failure)
            }
            Plan::Misconfigured(error, compensation) => {
                if let Some(action) = compensation {
                    self.compensated(action.run(token).await);
                }
                Err(error.with_cause(failure))
            }
        }
    }

    /// Execute a unit of work whose result may hold a second future
    ///
    /// Failures raised while awaiting the inner layer are handled like
    /// failures of the outer call.
    pub async fn execute_flatten<T: Send + 'static>(
        &self,
        work: Work<Deferred<T>>,
        token: CancellationToken,
        compensation: Option<Compensation>,
    ) -> ResilienceResult<Option<T>> {
        self.execute(work.flatten(), token, compensation).await
    }

    /// Execute a blocking closure on the calling thread
    ///
    /// Asynchronous compensating actions cannot run here; they are reported
    /// as compensation failures.
    pub fn execute_blocking<T, F>(&self, mut work: F, compensation: Option<Compensation>) -> ResilienceResult<Option<T>>
    where
        F: FnMut() -> Result<T, Failure>,
    {
        let failure = match work() {
            Ok(value) => return Ok(Some(value)),
            Err(failure) => failure,
        };
        self.log_original(&failure);

        match self.plan(&failure, compensation) {
            Plan::Recover(Composition { mut chain, unbound, .. }) => match chain.execute_blocking(&mut work) {
                ChainOutcome::Completed(value) => {
                    self.logger.info(&format!("Recovered from {} through the policy chain", failure.kind()));
                    Ok(Some(value))
                }
                ChainOutcome::Compensated { .. } => Ok(None),
                ChainOutcome::Failed {
                    failure: secondary,
                    compensation: compensation_failure,
                } => {
                    self.log_secondary(&secondary);
                    let compensation_failure = match unbound {
                        Some(action) => self.compensated(action.run_blocking()),
                        None => compensation_failure,
                    };
                    self.unrecovered(failure, Some(secondary), compensation_failure)
                }
            },
            Plan::Direct(compensation) => {
                let compensation_failure = compensation.and_then(|action| self.compensated(action.run_blocking()));
                self.unrecovered(failure, None, compensation_failure)
            }
            Plan::Misconfigured(error, compensation) => {
                if let Some(action) = compensation {
                    self.compensated(action.run_blocking());
                }
                Err(error.with_cause(failure))
            }
        }
    }

    fn plan(&self, failure: &Failure, compensation: Option<Compensation>) -> Plan {
        let catalog = match self.catalog.get() {
            Ok(catalog) => catalog,
            Err(error) => return Plan::Misconfigured(error, compensation),
        };

        let composer = PolicyComposer::new(catalog, self.logger.clone());
        if !composer.classifier().is_transient(failure, !self.policies.is_empty()) {
            self.logger.debug(&format!(
                "{} is not transient, skipping the policy chain",
                failure.kind()
            ));
            return Plan::Direct(compensation);
        }

        let composition = composer.compose(failure, &self.policies, compensation);
        if composition.chain.policies().is_empty() {
            self.logger.debug(&format!(
                "No registered policy applies to {}, skipping the policy chain",
                failure.kind()
            ));
            return Plan::Direct(composition.unbound);
        }
        Plan::Recover(composition)
    }

    fn unrecovered<T>(
        &self,
        cause: Failure,
        secondary: Option<Failure>,
        compensation: Option<Failure>,
    ) -> ResilienceResult<Option<T>> {
        if self.throw_on_failure {
            Err(ResilienceError::Execution {
                cause,
                secondary,
                compensation,
            })
        } else {
            Ok(None)
        }
    }

    /// Log a failed compensating action and hand its failure back
    fn compensated(&self, result: Result<(), Failure>) -> Option<Failure> {
        match result {
            Ok(()) => None,
            Err(failure) => {
                self.logger.error(Some(&failure), "Compensating action failed");
                Some(failure)
            }
        }
    }

    fn log_original(&self, failure: &Failure) {
        self.logger.error(Some(failure), failure.message());
    }

    fn log_secondary(&self, failure: &Failure) {
        self.logger.error(Some(failure), "Policy chain did not recover the unit of work");
    }
}

impl std::fmt::Debug for ResilientExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientExecutor")
            .field("catalog", &self.catalog)
            .field("policies", &self.policies)
            .field("throw_on_failure", &self.throw_on_failure)
            .finish()
    }
}
