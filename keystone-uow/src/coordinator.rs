//! Transaction coordinator
//!
//! Queues operations and applies them, strictly in FIFO order, inside one
//! ambient transactional scope. A coordinator is single-use: one queue, one
//! commit, one scope release.

use futures::future::{BoxFuture, FutureExt};
use keystone_core::Failure;
use keystone_logging::Logger;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::error::{TransactionError, TransactionResult};
use crate::scope::{AmbientScope, IsolationLevel, ScopeOption, TransactionalResource};

/// A queued operation
pub enum Operation {
    Sync(Box<dyn FnOnce() -> Result<(), Failure> + Send>),
    Async(Box<dyn FnOnce(CancellationToken) -> BoxFuture<'static, Result<(), Failure>> + Send>),
}

impl Operation {
    pub fn is_async(&self) -> bool {
        matches!(self, Operation::Async(_))
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Sync(_) => f.write_str("Operation::Sync"),
            Operation::Async(_) => f.write_str("Operation::Async"),
        }
    }
}

/// Lifecycle of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Building,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    Failed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Building => "building",
            SessionState::Committing => "committing",
            SessionState::Committed => "committed",
            SessionState::RollingBack => "rolling back",
            SessionState::RolledBack => "rolled back",
            SessionState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Unit of work over an ambient transactional resource
///
/// Not meant for concurrent use: one call chain populates and commits it.
pub struct TransactionCoordinator {
    resource: Arc<dyn TransactionalResource>,
    isolation: IsolationLevel,
    scope_option: ScopeOption,
    queue: VecDeque<Operation>,
    scope: Option<Box<dyn AmbientScope>>,
    state: SessionState,
    logger: Arc<dyn Logger>,
}

impl TransactionCoordinator {
    /// Coordinator using read-committed isolation in a new transaction
    pub fn new(resource: Arc<dyn TransactionalResource>, logger: Arc<dyn Logger>) -> Self {
        Self {
            resource,
            isolation: IsolationLevel::default(),
            scope_option: ScopeOption::default(),
            queue: VecDeque::new(),
            scope: None,
            state: SessionState::Building,
            logger,
        }
    }

    pub fn with_isolation_level(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_scope_option(mut self, scope_option: ScopeOption) -> Self {
        self.scope_option = scope_option;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn pending_operations(&self) -> usize {
        self.queue.len()
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation
    }

    pub fn scope_option(&self) -> ScopeOption {
        self.scope_option
    }

    /// Queue a blocking operation
    pub fn add_operation<F>(&mut self, operation: F) -> TransactionResult<()>
    where
        F: FnOnce() -> Result<(), Failure> + Send + 'static,
    {
        self.enqueue(Operation::Sync(Box::new(operation)))
    }

    /// Queue an asynchronous operation; it receives the commit's token
    pub fn add_operation_async<F, Fut>(&mut self, operation: F) -> TransactionResult<()>
    where
        F: FnOnce(CancellationToken) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), Failure>> + Send + 'static,
    {
        self.enqueue(Operation::Async(Box::new(move |token| operation(token).boxed())))
    }

    fn enqueue(&mut self, operation: Operation) -> TransactionResult<()> {
        if self.state != SessionState::Building {
            return Err(TransactionError::usage(format!(
                "operations cannot be added to a session that is {}",
                self.state
            )));
        }
        self.queue.push_back(operation);
        Ok(())
    }

    /// Run every queued operation inside one scope and commit
    ///
    /// The queue must be non-empty and hold blocking operations only.
    pub fn commit(&mut self, auto_rollback: bool, throw_on_failure: bool) -> TransactionResult<()> {
        self.check_commit()?;
        if self.queue.iter().any(Operation::is_async) {
            return Err(TransactionError::usage(
                "asynchronous operations are not supported by commit, use commit_async instead",
            ));
        }

        if let Err(failure) = self.open_scope(false) {
            return self.abort(failure, auto_rollback, throw_on_failure);
        }

        while let Some(operation) = self.queue.pop_front() {
            let result = match operation {
                Operation::Sync(run) => run(),
                Operation::Async(_) => Err(Failure::internal("asynchronous operation in a blocking commit")),
            };
            if let Err(failure) = result {
                return self.abort(failure, auto_rollback, throw_on_failure);
            }
        }

        self.complete_scope(auto_rollback, throw_on_failure)
    }

    /// Run every queued operation inside one async-capable scope and commit
    ///
    /// The queue must be non-empty and hold at least one asynchronous
    /// operation; blocking operations run inline. Cancelling `token` aborts
    /// the remaining operations and rolls back.
    pub async fn commit_async(
        &mut self,
        token: CancellationToken,
        auto_rollback: bool,
        throw_on_failure: bool,
    ) -> TransactionResult<()> {
        self.check_commit()?;
        if !self.queue.iter().any(Operation::is_async) {
            return Err(TransactionError::usage(
                "commit_async needs at least one asynchronous operation, use commit instead",
            ));
        }

        if let Err(failure) = self.open_scope(true) {
            return self.abort(failure, auto_rollback, throw_on_failure);
        }

        while let Some(operation) = self.queue.pop_front() {
            if token.is_cancelled() {
                return self.abort(cancelled(), auto_rollback, throw_on_failure);
            }
            let result = match operation {
                Operation::Sync(run) => run(),
                Operation::Async(run) => {
                    tokio::select! {
                        result = run(token.clone()) => result,
                        _ = token.cancelled() => Err(cancelled()),
                    }
                }
            };
            if let Err(failure) = result {
                return self.abort(failure, auto_rollback, throw_on_failure);
            }
        }

        self.complete_scope(auto_rollback, throw_on_failure)
    }

    /// Release the open scope without completing it
    ///
    /// `commit_failure` is the failure that prompted the rollback, if any;
    /// when releasing fails too, both are reported together.
    pub fn rollback(&mut self, commit_failure: Option<Failure>, throw_on_failure: bool) -> TransactionResult<()> {
        if self.state == SessionState::Committed {
            return Err(TransactionError::usage("the session is already committed"));
        }

        self.queue.clear();
        self.state = SessionState::RollingBack;
        match self.release_scope() {
            Ok(()) => {
                self.state = SessionState::RolledBack;
                Ok(())
            }
            Err(rollback) => {
                self.state = SessionState::Failed;
                let error = match commit_failure {
                    Some(commit) => TransactionError::Aggregate { commit, rollback },
                    None => TransactionError::Rollback { cause: rollback },
                };
                self.surface(error, throw_on_failure)
            }
        }
    }

    fn check_commit(&self) -> TransactionResult<()> {
        if self.state != SessionState::Building {
            return Err(TransactionError::usage(format!(
                "a session can only be committed once, this one is {}",
                self.state
            )));
        }
        if self.queue.is_empty() {
            return Err(TransactionError::usage(
                "at least one operation must be queued before committing",
            ));
        }
        Ok(())
    }

    fn open_scope(&mut self, async_flow: bool) -> Result<(), Failure> {
        self.state = SessionState::Committing;
        let scope = self.resource.begin(self.isolation, self.scope_option, async_flow)?;
        self.scope = Some(scope);
        self.logger.debug(&format!(
            "Opened {} scope for {} operations",
            self.isolation,
            self.queue.len()
        ));
        Ok(())
    }

    fn complete_scope(&mut self, auto_rollback: bool, throw_on_failure: bool) -> TransactionResult<()> {
        let Some(mut scope) = self.scope.take() else {
            return self.abort(Failure::internal("no open transaction scope"), auto_rollback, throw_on_failure);
        };

        if let Err(failure) = scope.complete() {
            self.scope = Some(scope);
            return self.abort(failure, auto_rollback, throw_on_failure);
        }

        match scope.dispose() {
            Ok(()) => {
                self.state = SessionState::Committed;
                self.logger.info("Transaction committed");
                Ok(())
            }
            Err(failure) => {
                self.state = SessionState::Failed;
                self.logger.error(Some(&failure), "Commit failed while releasing the completed scope");
                self.surface(TransactionError::Commit { cause: failure }, throw_on_failure)
            }
        }
    }

    /// Stop the session after `failure`, rolling back when asked to
    fn abort(&mut self, failure: Failure, auto_rollback: bool, throw_on_failure: bool) -> TransactionResult<()> {
        let skipped = self.queue.len();
        self.queue.clear();
        self.logger.error(
            Some(&failure),
            &format!("Unit of work failed, {} queued operations skipped", skipped),
        );

        if !auto_rollback {
            self.state = SessionState::Failed;
            return self.surface(TransactionError::Commit { cause: failure }, throw_on_failure);
        }

        self.state = SessionState::RollingBack;
        match self.release_scope() {
            Ok(()) => {
                self.state = SessionState::RolledBack;
                self.surface(TransactionError::Commit { cause: failure }, throw_on_failure)
            }
            Err(rollback) => {
                self.state = SessionState::Failed;
                self.surface(
                    TransactionError::Aggregate {
                        commit: failure,
                        rollback,
                    },
                    throw_on_failure,
                )
            }
        }
    }

    fn release_scope(&mut self) -> Result<(), Failure> {
        match self.scope.take() {
            Some(mut scope) => scope.dispose(),
            None => Ok(()),
        }
    }

    fn surface(&self, error: TransactionError, throw_on_failure: bool) -> TransactionResult<()> {
        if let TransactionError::Aggregate { .. } | TransactionError::Rollback { .. } = &error {
            self.logger.error(Some(&error), "Rollback failed");
        }
        if throw_on_failure {
            Err(error)
        } else {
            Ok(())
        }
    }
}

fn cancelled() -> Failure {
    Failure::cancelled("commit cancelled, remaining operations skipped")
}

impl Drop for TransactionCoordinator {
    fn drop(&mut self) {
        if self.scope.is_some() {
            self.logger.warn("Releasing a transaction scope that was never committed or rolled back");
            if let Err(failure) = self.release_scope() {
                self.logger.error(Some(&failure), "Releasing the abandoned scope failed");
            }
        }
    }
}

impl fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("isolation", &self.isolation)
            .field("scope_option", &self.scope_option)
            .field("pending", &self.queue.len())
            .field("state", &self.state)
            .field("scope_open", &self.scope.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FailurePlan, MockResource, MockScope, RecordingResource, ScopeEvent};
    use keystone_core::FailureKind;
    use keystone_logging::{LogLevel, MemoryLogger};
    use parking_lot::Mutex;
    use std::time::Duration;

    fn coordinator(resource: &RecordingResource) -> TransactionCoordinator {
        TransactionCoordinator::new(Arc::new(resource.clone()), Arc::new(MemoryLogger::new()))
    }

    #[test]
    fn test_empty_queue_is_a_usage_error_before_any_scope() {
        let mut resource = MockResource::new();
        resource.expect_begin().never();
        let mut uow = TransactionCoordinator::new(Arc::new(resource), Arc::new(MemoryLogger::new()));

        assert!(uow.commit(true, true).unwrap_err().is_usage());
        assert_eq!(uow.state(), SessionState::Building);
    }

    #[tokio::test]
    async fn test_queue_shape_must_match_commit_flavour() {
        let resource = RecordingResource::new();

        let mut uow = coordinator(&resource);
        uow.add_operation(resource.operation("sync")).unwrap();
        uow.add_operation_async(|_token| async { Ok(()) }).unwrap();
        assert!(uow.commit(true, true).unwrap_err().is_usage());

        let mut uow = coordinator(&resource);
        uow.add_operation(resource.operation("sync")).unwrap();
        let err = uow
            .commit_async(CancellationToken::new(), true, true)
            .await
            .unwrap_err();
        assert!(err.is_usage());

        assert!(resource.journal().is_empty());
    }

    #[test]
    fn test_operations_run_in_fifo_order_then_commit() {
        let resource = RecordingResource::new();
        let mut uow = coordinator(&resource).with_isolation_level(IsolationLevel::Serializable);
        uow.add_operation(resource.operation("a")).unwrap();
        uow.add_operation(resource.operation("b")).unwrap();
        assert_eq!(uow.pending_operations(), 2);

        uow.commit(true, true).unwrap();

        assert_eq!(
            resource.journal(),
            vec![
                ScopeEvent::Begin {
                    isolation: IsolationLevel::Serializable,
                    option: ScopeOption::RequiresNew,
                    async_flow: false,
                },
                ScopeEvent::Operation("a".to_string()),
                ScopeEvent::Operation("b".to_string()),
                ScopeEvent::Complete,
                ScopeEvent::Dispose { completed: true },
            ]
        );
        assert_eq!(uow.state(), SessionState::Committed);
        assert!(uow.add_operation(resource.operation("late")).unwrap_err().is_usage());
        assert!(uow.commit(true, true).unwrap_err().is_usage());
    }

    #[test]
    fn test_failing_operation_stops_queue_and_rolls_back() {
        let resource = RecordingResource::new();
        let mut uow = coordinator(&resource);
        uow.add_operation(resource.operation("1")).unwrap();
        uow.add_operation(resource.failing_operation("2", FailureKind::Database)).unwrap();
        uow.add_operation(resource.operation("3")).unwrap();

        let err = uow.commit(true, true).unwrap_err();

        assert_eq!(err.commit_failure().map(Failure::kind), Some(FailureKind::Database));
        assert_eq!(resource.operations(), vec!["1", "2"]);
        assert!(!resource.journal().contains(&ScopeEvent::Complete));
        assert!(resource.rolled_back());
        assert_eq!(uow.state(), SessionState::RolledBack);
    }

    #[test]
    fn test_commit_and_release_failures_are_aggregated() {
        let resource = RecordingResource::failing(FailurePlan {
            dispose: true,
            ..FailurePlan::default()
        });
        let mut uow = coordinator(&resource);
        uow.add_operation(resource.failing_operation("write", FailureKind::Deadlock)).unwrap();

        match uow.commit(true, true).unwrap_err() {
            TransactionError::Aggregate { commit, rollback } => {
                assert_eq!(commit.kind(), FailureKind::Deadlock);
                assert_eq!(rollback.message(), "scope could not be released");
            }
            other => panic!("expected aggregate failure, got {:?}", other),
        }
        assert_eq!(uow.state(), SessionState::Failed);
    }

    #[test]
    fn test_no_throw_logs_instead() {
        let logger = Arc::new(MemoryLogger::new());
        let resource = RecordingResource::new();
        let mut uow = TransactionCoordinator::new(Arc::new(resource.clone()), logger.clone());
        uow.add_operation(resource.failing_operation("write", FailureKind::Io)).unwrap();

        assert!(uow.commit(true, false).is_ok());
        assert_eq!(uow.state(), SessionState::RolledBack);
        assert!(logger.contains(LogLevel::Error, "queued operations skipped"));
    }

    #[test]
    fn test_without_auto_rollback_scope_stays_open_until_rollback() {
        let resource = RecordingResource::new();
        let mut uow = coordinator(&resource);
        uow.add_operation(resource.failing_operation("write", FailureKind::Io)).unwrap();

        assert!(uow.commit(false, true).is_err());
        assert_eq!(uow.state(), SessionState::Failed);
        assert!(!resource.rolled_back());

        uow.rollback(None, true).unwrap();
        assert!(resource.rolled_back());
        assert_eq!(uow.state(), SessionState::RolledBack);
    }

    #[test]
    fn test_rollback_release_failure_without_commit_failure() {
        let mut scope = MockScope::new();
        scope.expect_complete().never();
        scope
            .expect_dispose()
            .times(1)
            .returning(|| Err(Failure::new(FailureKind::Database, "release failed")));
        let scope = Mutex::new(Some(scope));

        let mut resource = MockResource::new();
        resource.expect_begin().times(1).returning(move |_, _, _| {
            let scope = scope.lock().take().ok_or_else(|| Failure::internal("scope already handed out"))?;
            Ok(Box::new(scope) as Box<dyn AmbientScope>)
        });

        let mut uow = TransactionCoordinator::new(Arc::new(resource), Arc::new(MemoryLogger::new()));
        uow.add_operation(|| Err(Failure::io("disk"))).unwrap();

        assert!(uow.commit(false, true).is_err());
        match uow.rollback(None, true).unwrap_err() {
            TransactionError::Rollback { cause } => assert_eq!(cause.message(), "release failed"),
            other => panic!("expected rollback failure, got {:?}", other),
        }
    }

    #[test]
    fn test_dropping_an_open_session_releases_the_scope() {
        let resource = RecordingResource::new();
        {
            let mut uow = coordinator(&resource);
            uow.add_operation(resource.failing_operation("write", FailureKind::Io)).unwrap();
            assert!(uow.commit(false, false).is_ok());
            assert!(!resource.rolled_back());
        }
        assert!(resource.rolled_back());
    }

    #[tokio::test]
    async fn test_commit_async_runs_mixed_queue_in_order() {
        let resource = RecordingResource::new();
        let mut uow = coordinator(&resource);
        uow.add_operation(resource.operation("sync-1")).unwrap();
        let record = resource.operation("async-2");
        uow.add_operation_async(move |_token| async move {
            tokio::task::yield_now().await;
            record()
        })
        .unwrap();
        uow.add_operation(resource.operation("sync-3")).unwrap();

        uow.commit_async(CancellationToken::new(), true, true).await.unwrap();

        assert_eq!(resource.operations(), vec!["sync-1", "async-2", "sync-3"]);
        assert!(resource.journal().contains(&ScopeEvent::Begin {
            isolation: IsolationLevel::ReadCommitted,
            option: ScopeOption::RequiresNew,
            async_flow: true,
        }));
        assert!(resource.committed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancellation_mid_queue_rolls_back() {
        let resource = RecordingResource::new();
        let token = CancellationToken::new();
        let mut uow = coordinator(&resource);

        let canceller = token.clone();
        uow.add_operation_async(move |_token| async move {
            canceller.cancel();
            Ok(())
        })
        .unwrap();
        uow.add_operation_async(|_token| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        })
        .unwrap();
        uow.add_operation(resource.operation("never")).unwrap();

        let err = uow.commit_async(token, true, true).await.unwrap_err();

        assert_eq!(err.commit_failure().map(Failure::kind), Some(FailureKind::Cancelled));
        assert!(resource.operations().is_empty());
        assert!(resource.rolled_back());
        assert_eq!(uow.state(), SessionState::RolledBack);
    }

    #[tokio::test]
    async fn test_async_operation_failure_rolls_back() {
        let resource = RecordingResource::new();
        let mut uow = coordinator(&resource);
        uow.add_operation_async(|_token| async { Err(Failure::new(FailureKind::Concurrency, "stale row")) })
            .unwrap();
        uow.add_operation(resource.operation("after")).unwrap();

        let err = uow
            .commit_async(CancellationToken::new(), true, true)
            .await
            .unwrap_err();
        assert_eq!(err.commit_failure().map(Failure::kind), Some(FailureKind::Concurrency));
        assert!(resource.operations().is_empty());
    }
}
