//! # tgis-core
//!
//! Shared building blocks for keeping a client connected to a TGIS
//! inference server.
//!
//! This crate provides:
//! - Statically declared service method tables ([`ServiceDescriptor`])
//! - The [`ServiceContract`] trait that binds a client type to a channel
//! - Classification of failed RPCs into cancelled, recoverable and
//!   unexpected faults

pub mod contract;
pub mod fault;

// Re-export commonly used types at the crate root
pub use contract::{GenerationChannel, ServiceContract, ServiceDescriptor, GENERATION_SERVICE};
pub use fault::{FaultClass, RECOVERABLE_CODES};
