//! # Unveil Core
//!
//! Configuration, error taxonomy, domain model and the trait seams shared by
//! the dispatch crates.

pub mod config;
pub mod error;
pub mod traits;
pub mod types;

pub use config::UnveilConfig;
pub use error::{Result, UnveilError};
