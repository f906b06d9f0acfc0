//! vget library crate.
//!
//! Media download orchestration: a bounded job queue drained by a worker
//! pool, a yt-dlp process adapter, an encrypted TTL credential vault, a
//! session registry, and SQLite download history.

pub mod config;
pub mod error;
pub mod fetcher;
pub mod history;
pub mod logging;
pub mod maintenance;
pub mod panic_hook;
pub mod queue;
pub mod service;
pub mod session;
pub mod vault;

pub use error::{Error, Result};
