//! Arena Common Library
//!
//! This crate provides shared constants, object naming and configuration
//! loading utilities for all arena workspace crates.
//!
//! # Module Structure
//!
//! - [`consts`] - Numeric limits, sentinels and default names
//! - [`names`] - Deterministic shared-memory object names
//! - [`config`] - User configuration block and its TOML persistence
//! - [`severity`] - Error severity bitmask shared by every error type
//! - [`prelude`] - Common re-exports for convenience
//!
//! # Usage
//!
//! Add to your `Cargo.toml` with alias for shorter imports:
//! ```toml
//! [dependencies]
//! arena = { package = "arena_common", path = "../arena_common" }
//! ```
//!
//! Then import:
//! ```rust
//! use arena_common::consts::*;
//! use arena_common::config::{ConfigLoader, UserConfig};
//! ```

pub mod config;
pub mod consts;
pub mod names;
pub mod prelude;
pub mod severity;
