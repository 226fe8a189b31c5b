//! `tether-store` — SQLite persistence for conversation messages.
//!
//! Messages are stored one row per message with the content block list
//! JSON-encoded. Loading returns the most recent N rows in ascending time
//! order, optionally truncating text bodies.

pub mod db;
pub mod error;
pub mod store;

pub use error::{Result, StoreError};
pub use store::MessageStore;
