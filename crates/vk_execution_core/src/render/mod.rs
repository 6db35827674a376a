//! # Rendering
//!
//! The crate only ships the Vulkan backend.

pub mod vulkan;
