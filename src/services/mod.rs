//! Services layer
//!
//! Business logic that coordinates the addon catalog, the record store and
//! the chat presence controller.
//!
//! ## Services
//!
//! - **AddonService**: install, uninstall, config read and validated config
//!   write; also resolves overlay ids for overlay channels

pub mod addons;

pub use addons::{AddonService, InstallationView};
