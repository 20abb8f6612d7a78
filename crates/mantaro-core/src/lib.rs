//! # mantaro-core
//!
//! Core crate for the Mantaro API. Contains the `api.json` configuration
//! schema and its first-run bootstrap, the cache pool tuning schema,
//! and the unified error system.
//!
//! This crate has **no** internal dependencies on other Mantaro crates.

pub mod config;
pub mod error;
pub mod result;

pub use crate::config::{Config, load_config};
pub use crate::error::{AppError, ErrorKind};
pub use crate::result::AppResult;
