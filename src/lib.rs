//! Mnemo - Conversational Memory Service
//!
//! A per-user memory pipeline colocated with an LLM gateway: observes chat
//! message streams, audits threads on a cadence, stores durable memories
//! with tiered retention, and answers deadline-bounded hybrid recall.

pub mod api;
pub mod audit;
pub mod cadence;
pub mod embedding;
pub mod engine;
pub mod error;
pub mod jobs;
pub mod profile;
pub mod providers;
pub mod query;
pub mod recall;
pub mod redaction;
pub mod retention;
pub mod scoring;
pub mod storage;
pub mod types;

pub use error::{MnemoError, Result};
pub use storage::Storage;
pub use types::*;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
