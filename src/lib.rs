//! stack-operator: reconciles Compose-style Stacks into Kubernetes workloads
//!
//! This crate provides the `Stack` custom resource, the pure conversion from a
//! Stack to its desired children, the diff against observed children and the
//! controller loop applying it.

pub mod controller;
pub mod convert;
pub mod crd;
pub mod error;
pub mod retry;
pub mod stackresources;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
