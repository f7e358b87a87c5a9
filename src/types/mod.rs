//! Shared types for the addon runtime

pub mod error;

pub use error::{Result, RuinousError};
