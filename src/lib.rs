//! Memo application persistence and sync library
//!
//! This library provides local-first storage for memos and their attachments,
//! replies, notifications and users, with an optional remote document store
//! mirror and a sync coordinator for UI code.

mod app;
mod backup;
mod config;
mod errors;
mod helper;
mod indexed_store;
mod kv_store;
mod logging;
mod models;
mod note;
mod remote_store;
mod services;
mod status;
mod sync;
mod types;
pub mod validation;

// Re-export key components
pub use app::*;
pub use backup::*;
pub use config::*;
pub use errors::*;
pub use helper::*;
pub use indexed_store::*;
pub use kv_store::*;
pub use logging::*;
pub use models::*;
pub use note::*;
pub use remote_store::*;
pub use services::*;
pub use status::*;
pub use sync::*;
pub use types::*;
