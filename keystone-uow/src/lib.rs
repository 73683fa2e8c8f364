//! Unit of work for Keystone
//!
//! [`TransactionCoordinator`] queues blocking and asynchronous operations and
//! applies them in order inside one scope opened on a
//! [`TransactionalResource`]. Everything commits together or nothing does;
//! the resource decides what that means for durability.

pub mod coordinator;
pub mod error;
pub mod scope;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use coordinator::{Operation, SessionState, TransactionCoordinator};
pub use error::{TransactionError, TransactionResult};
pub use scope::{AmbientScope, IsolationLevel, ScopeOption, TransactionalResource};
