//! SQLite persistence for the caremon agent.
//!
//! This crate keeps the durable offline request queue and a small response
//! cache on disk so both survive restarts.
//!
//! # Features
//!
//! - Request queue stored wholesale as one JSON array under a stable key
//! - Expiring key/value response cache
//!
//! # Example
//!
//! ```no_run
//! use caremon_store::Store;
//! use caremon_types::{HttpMethod, QueuedRequest};
//!
//! let store = Store::open_default()?;
//! store.append_request(&QueuedRequest::new(HttpMethod::Post, "https://example.com/v1/telemetry", None))?;
//! println!("{} request(s) waiting", store.load_queue()?.len());
//! # Ok::<(), caremon_store::Error>(())
//! ```

mod error;
mod schema;
mod store;

pub use error::{Error, Result};
pub use store::{DEFAULT_CACHE_TTL, QUEUE_KEY, Store};

/// Default database path following platform conventions.
///
/// - Linux: `~/.local/share/caremon/agent.db`
/// - macOS: `~/Library/Application Support/caremon/agent.db`
/// - Windows: `C:\Users\<user>\AppData\Local\caremon\agent.db`
pub fn default_db_path() -> std::path::PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| std::path::PathBuf::from("."))
        .join("caremon")
        .join("agent.db")
}
