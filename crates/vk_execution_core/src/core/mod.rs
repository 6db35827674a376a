//! Core crate infrastructure
//!
//! Houses the engine configuration consumed by the device and its contexts.

pub mod config;

pub use config::{DescriptorPoolSize, EngineVkConfig, QueryPoolSizes};
