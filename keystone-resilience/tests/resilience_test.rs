//! Integration tests for keystone-resilience

use keystone_core::{Failure, FailureKind, PolicyDefinition, PolicyStage, TimeoutStrategy};
use keystone_logging::{LogLevel, MemoryLogger};
use keystone_resilience::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const TABLE: &str = r#"
transient_failures:
  - source: io
    failures: IOFailure
    policies: Retry, CircuitBreaker
  - source: net
    failures: Timeout, Connection
    policies: Fallback, Timeout, RetryWithWait, CircuitBreaker
"#;

fn catalog(logger: Arc<MemoryLogger>) -> Arc<LazyPolicyCatalog> {
    Arc::new(LazyPolicyCatalog::new(CatalogSource::Yaml(TABLE.to_string()), logger))
}

fn breaker() -> PolicyDefinition {
    PolicyDefinition::CircuitBreaker {
        failures_allowed: 2,
        break_duration: Duration::from_millis(5000),
    }
}

fn all_policies() -> Vec<PolicyDefinition> {
    vec![
        PolicyDefinition::Fallback,
        PolicyDefinition::Timeout {
            timeout: Duration::from_secs(30),
            strategy: TimeoutStrategy::Optimistic,
        },
        PolicyDefinition::RetryWithWait {
            count: 2,
            wait: Duration::from_millis(10),
        },
        breaker(),
    ]
}

fn counting(counter: &Arc<AtomicUsize>) -> Compensation {
    let counter = counter.clone();
    Compensation::sync(move || {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    })
}

#[test]
fn test_composition_order_ignores_injection_order() {
    let logger = Arc::new(MemoryLogger::new());
    let composer = PolicyComposer::new(catalog(logger.clone()).get().unwrap(), logger);
    let expected = vec![
        PolicyStage::Fallback,
        PolicyStage::Timeout,
        PolicyStage::Retry,
        PolicyStage::CircuitBreaker,
    ];

    // every rotation and the reversal of the declared order
    let base = all_policies();
    let mut orders: Vec<Vec<PolicyDefinition>> = (0..base.len())
        .map(|shift| {
            let mut order = base.clone();
            order.rotate_left(shift);
            order
        })
        .collect();
    orders.push(base.iter().rev().cloned().collect());

    for order in orders {
        let injected: PolicySet = order.into_iter().collect();
        let composition = composer.compose(
            &Failure::timeout("slow"),
            &injected,
            Some(Compensation::sync(|| Ok(()))),
        );
        assert_eq!(composition.chain.stages(), expected);
    }
}

#[test]
fn test_retry_and_breaker_scenario() {
    let logger = Arc::new(MemoryLogger::new());
    let composer = PolicyComposer::new(catalog(logger.clone()).get().unwrap(), logger.clone());
    let injected: PolicySet = vec![PolicyDefinition::Retry { count: 3 }, breaker()]
        .into_iter()
        .collect();

    let mut composition = composer.compose(&Failure::io("disk"), &injected, None);
    assert_eq!(composition.chain.names(), vec!["Retry", "CircuitBreaker"]);

    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    let mut work = move || {
        let attempt = counter.fetch_add(1, Ordering::SeqCst) + 1;
        if attempt <= 2 {
            Err(Failure::io(format!("attempt {}", attempt)))
        } else {
            Ok(42)
        }
    };

    match composition.chain.execute_blocking(&mut work) {
        ChainOutcome::Completed(value) => assert_eq!(value, 42),
        other => panic!("expected success, got {:?}", other),
    }
    assert_eq!(composition.chain.retry_attempts(), 2);
    assert_eq!(
        composition.chain.breaker_states(),
        vec![("CircuitBreaker".to_string(), CircuitState::Closed)]
    );
    assert!(!logger.contains(LogLevel::Error, "breaking the circuit"));
}

#[test]
fn test_non_transient_failure_skips_composition() {
    let logger = Arc::new(MemoryLogger::new());
    let injected: PolicySet = all_policies().into_iter().collect();
    let executor = ResilientExecutor::new(catalog(logger.clone()), injected, logger.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let err = executor
        .execute_blocking(
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(Failure::new(FailureKind::NotFound, "no such order"))
            },
            None,
        )
        .unwrap_err();

    assert_eq!(err.cause().map(Failure::kind), Some(FailureKind::NotFound));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!logger.contains(LogLevel::Debug, "Composed policy chain"));
    assert!(logger.contains(LogLevel::Error, "no such order"));
}

#[tokio::test(start_paused = true)]
async fn test_compensation_runs_once_when_fallback_consumes_it() {
    let logger = Arc::new(MemoryLogger::new());
    let injected: PolicySet = all_policies().into_iter().collect();
    let executor = ResilientExecutor::new(catalog(logger.clone()), injected, logger);
    let compensations = Arc::new(AtomicUsize::new(0));

    let work = Work::from_async(|_token| async { Err::<(), _>(Failure::new(FailureKind::Connection, "refused")) });
    let result = executor
        .execute(work, CancellationToken::new(), Some(counting(&compensations)))
        .await;

    assert_eq!(result.unwrap(), None);
    assert_eq!(compensations.load(Ordering::SeqCst), 1);
}

#[tokio::test(start_paused = true)]
async fn test_compensation_runs_once_without_fallback() {
    let logger = Arc::new(MemoryLogger::new());
    let injected: PolicySet = vec![PolicyDefinition::Retry { count: 2 }].into_iter().collect();
    let executor = ResilientExecutor::new(catalog(logger.clone()), injected, logger);
    let compensations = Arc::new(AtomicUsize::new(0));

    let work = Work::sync(|| Err::<(), _>(Failure::io("disk full")));
    let err = executor
        .execute(work, CancellationToken::new(), Some(counting(&compensations)))
        .await
        .unwrap_err();

    match err {
        ResilienceError::Execution {
            cause,
            secondary,
            compensation,
        } => {
            assert_eq!(cause.message(), "disk full");
            assert_eq!(secondary.map(|f| f.kind()), Some(FailureKind::Io));
            assert!(compensation.is_none());
        }
        other => panic!("expected execution error, got {:?}", other),
    }
    assert_eq!(compensations.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_recovered_failure_does_not_compensate() {
    let logger = Arc::new(MemoryLogger::new());
    let injected: PolicySet = vec![PolicyDefinition::Retry { count: 1 }].into_iter().collect();
    let executor = ResilientExecutor::new(catalog(logger.clone()), injected, logger);
    let compensations = Arc::new(AtomicUsize::new(0));
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();

    let work = Work::sync(move || {
        if counter.fetch_add(1, Ordering::SeqCst) == 0 {
            Err(Failure::io("once"))
        } else {
            Ok("stored")
        }
    });
    let result = executor
        .execute(work, CancellationToken::new(), Some(counting(&compensations)))
        .await;

    assert_eq!(result.unwrap(), Some("stored"));
    assert_eq!(compensations.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_missing_policies_degrade_with_warning() {
    let logger = Arc::new(MemoryLogger::new());
    let injected: PolicySet = vec![PolicyDefinition::Retry { count: 1 }].into_iter().collect();
    let executor = ResilientExecutor::new(catalog(logger.clone()), injected, logger.clone())
        .with_throw_on_failure(false);

    let work = Work::sync(|| Err::<(), _>(Failure::io("disk")));
    let result = executor.execute(work, CancellationToken::new(), None).await;

    assert_eq!(result.unwrap(), None);
    assert!(logger.contains(LogLevel::Warn, "not registered: CircuitBreaker"));
    assert!(logger.contains(LogLevel::Error, "Retry 'Retry': attempt 1 of 1"));
}

#[test]
fn test_catalog_is_shared_between_executors() {
    let logger = Arc::new(MemoryLogger::new());
    let catalog = catalog(logger.clone());
    let first = ResilientExecutor::new(catalog.clone(), PolicySet::new(), logger.clone())
        .with_throw_on_failure(false);
    let second = ResilientExecutor::new(catalog.clone(), PolicySet::new(), logger);

    assert!(first.execute_blocking(|| Err::<(), _>(Failure::io("a")), None).is_ok());
    assert!(second.execute_blocking(|| Err::<(), _>(Failure::io("b")), None).is_err());
    assert_eq!(catalog.build_count(), 1);
}
