//! Ruinous - addon runtime for streaming channels
//!
//! Users install addons on their channel. An addon may keep the shared chat
//! bot in the user's chat, may render a browser overlay, and carries a
//! per-user configuration checked against the addon's schema.
//!
//! ## Services
//!
//! - **Addons**: catalog of addon definitions and their compiled config
//!   validators
//! - **Overlay**: WebSocket channels per overlay addon, with a registry of
//!   identified overlay connections
//! - **Chat**: presence controller that keeps the bot in the right chats and
//!   its OAuth token fresh
//! - **Services**: install, uninstall and config read/write

pub mod addons;
pub mod chat;
pub mod config;
pub mod crypto;
pub mod db;
pub mod logging;
pub mod overlay;
pub mod routes;
pub mod server;
pub mod services;
pub mod types;

pub use config::Args;
pub use server::{run, AppState};
pub use types::{Result, RuinousError};
