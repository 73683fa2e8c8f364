//! Testing utilities for keystone-uow
//!
//! [`RecordingResource`] keeps a journal of everything that happens to its
//! scopes, including operations that report into it, and can be told to fail
//! at any step. The `mockall` mocks cover tests that want call expectations
//! instead.

use keystone_core::{Failure, FailureKind};
use mockall::mock;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::scope::{AmbientScope, IsolationLevel, ScopeOption, TransactionalResource};

mock! {
    pub Resource {}

    impl TransactionalResource for Resource {
        fn begin(
            &self,
            isolation: IsolationLevel,
            option: ScopeOption,
            async_flow: bool,
        ) -> Result<Box<dyn AmbientScope>, Failure>;
    }
}

mock! {
    pub Scope {}

    impl AmbientScope for Scope {
        fn complete(&mut self) -> Result<(), Failure>;
        fn dispose(&mut self) -> Result<(), Failure>;
    }
}

/// One journal entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeEvent {
    Begin {
        isolation: IsolationLevel,
        option: ScopeOption,
        async_flow: bool,
    },
    Operation(String),
    Complete,
    /// `completed` tells a commit from a rollback
    Dispose { completed: bool },
}

/// Which step should fail
#[derive(Debug, Clone, Copy, Default)]
pub struct FailurePlan {
    pub begin: bool,
    pub complete: bool,
    pub dispose: bool,
}

#[derive(Debug, Default)]
struct Shared {
    journal: Vec<ScopeEvent>,
    plan: FailurePlan,
}

/// Resource recording begin, complete and dispose calls
#[derive(Debug, Clone, Default)]
pub struct RecordingResource {
    shared: Arc<Mutex<Shared>>,
}

impl RecordingResource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resource that fails the steps selected in `plan`
    pub fn failing(plan: FailurePlan) -> Self {
        let resource = Self::new();
        resource.shared.lock().plan = plan;
        resource
    }

    pub fn journal(&self) -> Vec<ScopeEvent> {
        self.shared.lock().journal.clone()
    }

    /// Labels of the operations recorded so far, in order
    pub fn operations(&self) -> Vec<String> {
        self.shared
            .lock()
            .journal
            .iter()
            .filter_map(|event| match event {
                ScopeEvent::Operation(label) => Some(label.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn committed(&self) -> bool {
        self.journal().contains(&ScopeEvent::Dispose { completed: true })
    }

    pub fn rolled_back(&self) -> bool {
        self.journal().contains(&ScopeEvent::Dispose { completed: false })
    }

    /// Operation that records `label` and succeeds
    pub fn operation(&self, label: impl Into<String>) -> impl FnOnce() -> Result<(), Failure> + Send + 'static {
        let shared = self.shared.clone();
        let label = label.into();
        move || {
            shared.lock().journal.push(ScopeEvent::Operation(label));
            Ok(())
        }
    }

    /// Operation that records `label` and fails with `kind`
    pub fn failing_operation(
        &self,
        label: impl Into<String>,
        kind: FailureKind,
    ) -> impl FnOnce() -> Result<(), Failure> + Send + 'static {
        let shared = self.shared.clone();
        let label = label.into();
        move || {
            let failure = Failure::new(kind, format!("operation '{}' failed", label));
            shared.lock().journal.push(ScopeEvent::Operation(label));
            Err(failure)
        }
    }
}

impl TransactionalResource for RecordingResource {
    fn begin(
        &self,
        isolation: IsolationLevel,
        option: ScopeOption,
        async_flow: bool,
    ) -> Result<Box<dyn AmbientScope>, Failure> {
        let mut shared = self.shared.lock();
        if shared.plan.begin {
            return Err(Failure::new(FailureKind::Connection, "could not open a transaction scope"));
        }
        shared.journal.push(ScopeEvent::Begin {
            isolation,
            option,
            async_flow,
        });
        Ok(Box::new(RecordingScope {
            shared: self.shared.clone(),
            completed: false,
        }))
    }
}

struct RecordingScope {
    shared: Arc<Mutex<Shared>>,
    completed: bool,
}

impl AmbientScope for RecordingScope {
    fn complete(&mut self) -> Result<(), Failure> {
        let mut shared = self.shared.lock();
        if shared.plan.complete {
            return Err(Failure::new(FailureKind::Database, "scope could not be completed"));
        }
        shared.journal.push(ScopeEvent::Complete);
        self.completed = true;
        Ok(())
    }

    fn dispose(&mut self) -> Result<(), Failure> {
        let mut shared = self.shared.lock();
        if shared.plan.dispose {
            return Err(Failure::new(FailureKind::Database, "scope could not be released"));
        }
        shared.journal.push(ScopeEvent::Dispose {
            completed: self.completed,
        });
        Ok(())
    }
}
