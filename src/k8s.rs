//! Kubernetes operations module.

pub mod autoscaler;
pub mod client;
pub mod drain;
pub mod node;
