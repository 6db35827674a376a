//! Foundation module - Core utilities and types
//!
//! This module provides fundamental utilities used throughout the crate:
//! - Logging utilities
//! - Alignment helpers shared by the transient memory managers

pub mod logging;
pub mod align;
