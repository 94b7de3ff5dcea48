//! Custom Resource Definitions for the stack operator
//!
//! This module defines the `Stack` CRD and the Compose service types it carries.

mod stack;
pub mod types;


pub use stack::{stack_key, Stack, StackOwner, StackPhase, StackSpec, StackStatus};
pub use types::*;
