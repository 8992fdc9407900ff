//! Azure Resource Manager operations module.

pub mod arm;
pub mod client;
pub mod naming;
pub mod scaledown;
pub mod types;
pub mod vm;
