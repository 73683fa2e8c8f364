//! Core domain types for Keystone
//!
//! This crate holds the failure taxonomy every other crate classifies against
//! and the declarative policy definitions that the resilience layer composes.

pub mod failure;
pub mod policy;

pub use failure::{Failure, FailureKind, Result};
pub use policy::{NamedPolicy, PolicyDefinition, PolicyStage, TimeoutStrategy};
