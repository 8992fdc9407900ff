//! Cluster upgrade: discovery, version checks and the VM replacement workflow.

pub mod cluster;
pub mod health;
pub mod template;
pub mod topology;
pub mod versions;
pub mod workflow;
