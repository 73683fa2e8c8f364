//! Policy tables loaded from files and the environment

use keystone_config::PolicyTableLoader;
use keystone_core::{Failure, FailureKind, PolicyDefinition};
use keystone_logging::{LogLevel, MemoryLogger};
use keystone_resilience::{CatalogSource, LazyPolicyCatalog, PolicySet, ResilientExecutor};
use std::io::Write;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use temp_env::with_var;
use tempfile::NamedTempFile;
use tokio_test::assert_err;

const TABLE: &str = r#"
transient_failures:
  - source: domain
    failures: NotFound
    policies: Retry
policies:
  - name: Retry
    type: retry
    count: 2
  - name: Breaker
    type: advanced_circuit_breaker
    failure_threshold: 0.5
    sampling: 10s
    min_throughput: 4
    break_duration: 30s
"#;

fn table_file(content: &str) -> anyhow::Result<NamedTempFile> {
    let mut file = NamedTempFile::new()?;
    file.write_all(content.as_bytes())?;
    Ok(file)
}

#[test]
fn test_table_file_drives_the_executor() -> anyhow::Result<()> {
    let file = table_file(TABLE)?;
    let logger = Arc::new(MemoryLogger::new());
    let catalog = Arc::new(LazyPolicyCatalog::new(
        CatalogSource::File(file.path().to_path_buf()),
        logger.clone(),
    ));
    let resolved = catalog.get()?;
    let policies = PolicySet::from_catalog(&resolved);
    assert_eq!(policies.len(), 2);
    assert!(matches!(
        policies.find("breaker").map(|p| &p.definition),
        Some(PolicyDefinition::AdvancedCircuitBreaker { sampling, .. }) if *sampling == Duration::from_secs(10)
    ));

    let executor = ResilientExecutor::new(catalog, policies, logger.clone());
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let found = executor.execute_blocking(
        move || {
            if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                Err(Failure::new(FailureKind::NotFound, "replica lagging"))
            } else {
                Ok("order")
            }
        },
        None,
    )?;

    assert_eq!(found, Some("order"));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(logger.contains(LogLevel::Error, "Retry 'Retry': attempt 1 of 2"));
    Ok(())
}

#[test]
fn test_environment_overrides_embedded_table() -> anyhow::Result<()> {
    let file = table_file(TABLE)?;
    let path = file.path().to_string_lossy().to_string();

    with_var("KEYSTONE_POLICY_TABLE", Some(path.as_str()), || -> anyhow::Result<()> {
        let catalog = LazyPolicyCatalog::new(CatalogSource::Environment, Arc::new(MemoryLogger::new()));
        let catalog = catalog.get()?;
        assert!(catalog.is_transient(FailureKind::NotFound));
        assert!(!catalog.is_transient(FailureKind::Io));
        Ok(())
    })?;

    with_var("KEYSTONE_POLICY_TABLE", None::<&str>, || -> anyhow::Result<()> {
        let catalog = LazyPolicyCatalog::new(CatalogSource::Environment, Arc::new(MemoryLogger::new()));
        assert!(catalog.get()?.is_transient(FailureKind::Io));
        Ok(())
    })
}

#[test]
fn test_custom_prefix() -> anyhow::Result<()> {
    let file = table_file(TABLE)?;
    let path = file.path().to_string_lossy().to_string();

    with_var("ORDERS_POLICY_TABLE", Some(path.as_str()), || -> anyhow::Result<()> {
        let catalog = LazyPolicyCatalog::with_loader(
            CatalogSource::Environment,
            PolicyTableLoader::with_prefix("ORDERS"),
            Arc::new(MemoryLogger::new()),
        );
        assert!(catalog.get()?.is_transient(FailureKind::NotFound));
        Ok(())
    })
}

#[test]
fn test_unresolvable_pattern_is_fatal_at_first_use() -> anyhow::Result<()> {
    let file = table_file(
        r#"
transient_failures:
  - source: storage
    failures: IOFailure
    policies: Retry
"#,
    )?;
    let logger = Arc::new(MemoryLogger::new());
    let catalog = Arc::new(LazyPolicyCatalog::new(
        CatalogSource::File(file.path().to_path_buf()),
        logger.clone(),
    ));
    let executor = ResilientExecutor::new(catalog.clone(), PolicySet::new(), logger.clone());

    assert_eq!(executor.execute_blocking(|| Ok::<_, Failure>(1), None)?, Some(1));
    assert!(!catalog.is_initialized());

    let err = assert_err!(executor.execute_blocking(|| Err::<u8, _>(Failure::io("disk")), None));
    assert!(err.is_configuration());
    assert_eq!(err.cause().map(Failure::kind), Some(FailureKind::Io));
    assert!(logger.contains(LogLevel::Error, "Failed to build the policy catalog"));
    Ok(())
}
