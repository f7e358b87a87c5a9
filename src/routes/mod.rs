//! HTTP routes for Ruinous

pub mod api;
pub mod health;

pub use api::{list_addons, overlay_record};
pub use health::health_check;
