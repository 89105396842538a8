pub mod config;
pub mod runtime;
pub mod telegram;
pub mod web;
pub mod webhook;

pub use relaygram_app::assets;
pub use relaygram_app::logging;
pub use relaygram_channels::chat_api;
pub use relaygram_channels::dispatch;
pub use relaygram_channels::registration;
pub use relaygram_core::error;
pub use relaygram_core::token;
pub use relaygram_storage::db;
