//! Composed policy chains
//!
//! A [`PolicyChain`] nests its policies outermost first:
//!
//! ```text
//! Fallback( Timeout( Retry( CircuitBreaker( unit of work ))))
//! ```
//!
//! so a failure first passes the breaker guard, is then retried, is
//! time-bounded as a whole, and finally reaches the fallback. The fallback is
//! handled by the chain itself; the remaining stages form the pipeline.

use futures::future::{BoxFuture, FutureExt};
use keystone_core::{Failure, NamedPolicy, PolicyDefinition, PolicyStage, TimeoutStrategy};
use keystone_logging::Logger;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::backoff::BackoffCalculator;
use crate::circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use crate::classifier::ExceptionClassifier;
use crate::work::{Compensation, Work};

/// Result of running a unit of work through a chain
#[derive(Debug)]
pub enum ChainOutcome<T> {
    /// The unit of work eventually succeeded
    Completed(T),
    /// The fallback ran the compensating action successfully
    Compensated { failure: Failure },
    /// Nothing recovered the failure
    Failed {
        failure: Failure,
        /// Failure of the compensating action, when the fallback ran it
        compensation: Option<Failure>,
    },
}

impl<T> ChainOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, ChainOutcome::Completed(_))
    }
}

enum Layer {
    Timeout {
        name: String,
        timeout: Duration,
        strategy: TimeoutStrategy,
    },
    Retry {
        name: String,
        count: u32,
        backoff: BackoffCalculator,
    },
    Breaker {
        breaker: CircuitBreaker,
    },
}

impl Layer {
    fn build(policy: &NamedPolicy, logger: &Arc<dyn Logger>) -> Option<Self> {
        let definition = &policy.definition;
        match definition.stage() {
            PolicyStage::Fallback => None,
            PolicyStage::Timeout => match definition {
                PolicyDefinition::Timeout { timeout, strategy } => Some(Layer::Timeout {
                    name: policy.name.clone(),
                    timeout: *timeout,
                    strategy: *strategy,
                }),
                _ => None,
            },
            PolicyStage::Retry => {
                BackoffCalculator::for_policy(definition).map(|(count, backoff)| Layer::Retry {
                    name: policy.name.clone(),
                    count,
                    backoff,
                })
            }
            PolicyStage::CircuitBreaker => {
                CircuitBreakerConfig::for_policy(definition).map(|config| Layer::Breaker {
                    breaker: CircuitBreaker::new(policy.name.clone(), config, logger.clone()),
                })
            }
        }
    }
}

/// Timeout, retry and breaker stages, outermost first
struct Pipeline {
    layers: Vec<Layer>,
    classifier: ExceptionClassifier,
    logger: Arc<dyn Logger>,
    retries: AtomicU32,
}

impl Pipeline {
    fn run<'a, T: Send + 'static>(
        &'a self,
        depth: usize,
        work: &'a mut Work<T>,
        token: CancellationToken,
    ) -> BoxFuture<'a, Result<T, Failure>> {
        async move {
            let Some(layer) = self.layers.get(depth) else {
                if token.is_cancelled() {
                    return Err(Failure::cancelled("unit of work cancelled before it started"));
                }
                return work.invoke(token).await;
            };

            match layer {
                Layer::Timeout {
                    name,
                    timeout,
                    strategy,
                } => self.run_timeout(depth, work, token, name, *timeout, *strategy).await,
                Layer::Retry {
                    name,
                    count,
                    backoff,
                } => {
                    let mut attempt = 0;
                    loop {
                        let failure = match self.run(depth + 1, &mut *work, token.clone()).await {
                            Ok(value) => return Ok(value),
                            Err(failure) => failure,
                        };
                        if attempt >= *count || token.is_cancelled() || !self.classifier.is_handled(&failure) {
                            return Err(failure);
                        }
                        attempt += 1;
                        self.note_retry(name, attempt, *count, &failure);

                        let delay = backoff.calculate_delay(attempt);
                        if !delay.is_zero() {
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = token.cancelled() => {
                                    return Err(Failure::cancelled("retry wait cancelled").with_source(failure));
                                }
                            }
                        }
                    }
                }
                Layer::Breaker { breaker } => {
                    breaker.try_acquire()?;
                    let result = self.run(depth + 1, work, token).await;
                    self.record(breaker, &result);
                    result
                }
            }
        }
        .boxed()
    }

    async fn run_timeout<T: Send + 'static>(
        &self,
        depth: usize,
        work: &mut Work<T>,
        token: CancellationToken,
        name: &str,
        timeout: Duration,
        strategy: TimeoutStrategy,
    ) -> Result<T, Failure> {
        let started = tokio::time::Instant::now();
        match strategy {
            TimeoutStrategy::Pessimistic => {
                match tokio::time::timeout(timeout, self.run(depth + 1, work, token)).await {
                    Ok(result) => result,
                    Err(elapsed) => {
                        self.note_timeout(name, started.elapsed());
                        Err(Failure::timeout(format!("'{}' abandoned the call", name)).with_source(elapsed))
                    }
                }
            }
            TimeoutStrategy::Optimistic => {
                let child = token.child_token();
                let inner = self.run(depth + 1, work, child.clone());
                tokio::pin!(inner);

                tokio::select! {
                    result = &mut inner => result,
                    _ = tokio::time::sleep(timeout) => {
                        child.cancel();
                        let late = inner.await;
                        self.note_timeout(name, started.elapsed());
                        match late {
                            Ok(value) => Ok(value),
                            Err(failure) => Err(Failure::timeout(format!("'{}' cancelled the call", name)).with_source(failure)),
                        }
                    }
                }
            }
        }
    }

    fn run_blocking<T, F>(&self, depth: usize, work: &mut F) -> Result<T, Failure>
    where
        F: FnMut() -> Result<T, Failure>,
    {
        let Some(layer) = self.layers.get(depth) else {
            return work();
        };

        match layer {
            Layer::Timeout { name, timeout, .. } => {
                let started = std::time::Instant::now();
                let result = self.run_blocking(depth + 1, work);
                let elapsed = started.elapsed();
                if elapsed <= *timeout {
                    return result;
                }
                self.note_timeout(name, elapsed);
                let failure = Failure::timeout(format!("'{}' exceeded {} ms", name, timeout.as_millis()));
                Err(match result {
                    Ok(_) => failure,
                    Err(inner) => failure.with_source(inner),
                })
            }
            Layer::Retry {
                name,
                count,
                backoff,
            } => {
                let mut attempt = 0;
                loop {
                    let failure = match self.run_blocking(depth + 1, work) {
                        Ok(value) => return Ok(value),
                        Err(failure) => failure,
                    };
                    if attempt >= *count || !self.classifier.is_handled(&failure) {
                        return Err(failure);
                    }
                    attempt += 1;
                    self.note_retry(name, attempt, *count, &failure);

                    let delay = backoff.calculate_delay(attempt);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                }
            }
            Layer::Breaker { breaker } => {
                breaker.try_acquire()?;
                let result = self.run_blocking(depth + 1, work);
                self.record(breaker, &result);
                result
            }
        }
    }

    fn record<T>(&self, breaker: &CircuitBreaker, result: &Result<T, Failure>) {
        match result {
            Ok(_) => breaker.record_success(),
            Err(failure) if self.classifier.is_handled(failure) => breaker.record_failure(failure),
            Err(_) => {}
        }
    }

    fn note_retry(&self, name: &str, attempt: u32, count: u32, failure: &Failure) {
        self.retries.fetch_add(1, Ordering::SeqCst);
        self.logger.error(
            Some(failure),
            &format!("Retry '{}': attempt {} of {}", name, attempt, count),
        );
    }

    fn note_timeout(&self, name: &str, elapsed: Duration) {
        self.logger.info(&format!(
            "Timeout '{}': gave up after {} ms",
            name,
            elapsed.as_millis()
        ));
    }
}

/// Policies selected for one failure occurrence
///
/// Policies are ordered by [`PolicyStage`] on construction; policies of the
/// same stage keep their relative order. Breaker state lives as long as the
/// chain does.
pub struct PolicyChain {
    policies: Vec<NamedPolicy>,
    pipeline: Pipeline,
    compensation: Option<Compensation>,
    logger: Arc<dyn Logger>,
}

impl PolicyChain {
    pub fn new(mut policies: Vec<NamedPolicy>, classifier: ExceptionClassifier, logger: Arc<dyn Logger>) -> Self {
        policies.sort_by_key(|p| p.definition.stage());
        let layers = policies
            .iter()
            .filter_map(|policy| Layer::build(policy, &logger))
            .collect();

        Self {
            policies,
            pipeline: Pipeline {
                layers,
                classifier,
                logger: logger.clone(),
                retries: AtomicU32::new(0),
            },
            compensation: None,
            logger,
        }
    }

    /// Bind the compensating action to the chain's fallback
    ///
    /// Hands the action back when the chain has no fallback policy.
    pub fn bind(&mut self, compensation: Compensation) -> Result<(), Compensation> {
        if self.fallback_name().is_some() {
            self.compensation = Some(compensation);
            Ok(())
        } else {
            Err(compensation)
        }
    }

    pub fn has_bound_fallback(&self) -> bool {
        self.compensation.is_some()
    }

    pub fn policies(&self) -> &[NamedPolicy] {
        &self.policies
    }

    pub fn names(&self) -> Vec<&str> {
        self.policies.iter().map(|p| p.name.as_str()).collect()
    }

    pub fn stages(&self) -> Vec<PolicyStage> {
        self.policies.iter().map(|p| p.definition.stage()).collect()
    }

    /// Retries performed so far
    pub fn retry_attempts(&self) -> u32 {
        self.pipeline.retries.load(Ordering::SeqCst)
    }

    /// State of every breaker in the chain, by policy name
    pub fn breaker_states(&self) -> Vec<(String, CircuitState)> {
        self.pipeline
            .layers
            .iter()
            .filter_map(|layer| match layer {
                Layer::Breaker { breaker } => Some((breaker.name().to_string(), breaker.state())),
                _ => None,
            })
            .collect()
    }

    fn fallback_name(&self) -> Option<&str> {
        self.policies
            .iter()
            .find(|p| p.definition.is_fallback())
            .map(|p| p.name.as_str())
    }

    /// Run `work` through the chain
    pub async fn execute<T: Send + 'static>(&mut self, work: &mut Work<T>, token: CancellationToken) -> ChainOutcome<T> {
        match self.pipeline.run(0, work, token.clone()).await {
            Ok(value) => ChainOutcome::Completed(value),
            Err(failure) => match self.take_fallback(&failure) {
                Some(compensation) => settle(failure, compensation.run(token).await),
                None => ChainOutcome::Failed {
                    failure,
                    compensation: None,
                },
            },
        }
    }

    /// Run a blocking closure through the chain
    pub fn execute_blocking<T, F>(&mut self, work: &mut F) -> ChainOutcome<T>
    where
        F: FnMut() -> Result<T, Failure>,
    {
        match self.pipeline.run_blocking(0, work) {
            Ok(value) => ChainOutcome::Completed(value),
            Err(failure) => match self.take_fallback(&failure) {
                Some(compensation) => settle(failure, compensation.run_blocking()),
                None => ChainOutcome::Failed {
                    failure,
                    compensation: None,
                },
            },
        }
    }

    fn take_fallback(&mut self, failure: &Failure) -> Option<Compensation> {
        let compensation = self.compensation.take()?;
        self.logger.error(
            Some(failure),
            &format!(
                "Fallback '{}': running the compensating action",
                self.fallback_name().unwrap_or("Fallback")
            ),
        );
        Some(compensation)
    }
}

fn settle<T>(failure: Failure, compensated: Result<(), Failure>) -> ChainOutcome<T> {
    match compensated {
        Ok(()) => ChainOutcome::Compensated { failure },
        Err(error) => ChainOutcome::Failed {
            failure,
            compensation: Some(error),
        },
    }
}

impl std::fmt::Debug for PolicyChain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyChain")
            .field("policies", &self.names())
            .field("bound_fallback", &self.has_bound_fallback())
            .finish()
    }
}
