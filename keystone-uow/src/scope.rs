//! Ambient transactional resource collaborator

use keystone_core::Failure;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Isolation level requested when a scope is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    Serializable,
    RepeatableRead,
    #[default]
    ReadCommitted,
    ReadUncommitted,
    Snapshot,
    Unspecified,
}

/// How a new scope relates to one that is already ambient
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScopeOption {
    /// Join the ambient transaction, or start one
    Required,
    /// Always start a new transaction
    #[default]
    RequiresNew,
    /// Run outside any ambient transaction
    Suppress,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            IsolationLevel::Serializable => "serializable",
            IsolationLevel::RepeatableRead => "repeatable read",
            IsolationLevel::ReadCommitted => "read committed",
            IsolationLevel::ReadUncommitted => "read uncommitted",
            IsolationLevel::Snapshot => "snapshot",
            IsolationLevel::Unspecified => "unspecified",
        };
        f.write_str(name)
    }
}

/// Opens ambient transactional scopes
///
/// Durability is the resource's business; the coordinator only sequences
/// work inside the scope and releases it.
pub trait TransactionalResource: Send + Sync {
    /// Open a scope. `async_flow` asks for a scope that survives suspension
    /// points.
    fn begin(
        &self,
        isolation: IsolationLevel,
        option: ScopeOption,
        async_flow: bool,
    ) -> Result<Box<dyn AmbientScope>, Failure>;
}

/// An open transactional scope
pub trait AmbientScope: Send {
    /// Mark the work inside the scope as done; nothing is durable yet
    fn complete(&mut self) -> Result<(), Failure>;

    /// Release the scope. A completed scope commits, any other rolls back.
    /// Called exactly once.
    fn dispose(&mut self) -> Result<(), Failure>;
}
