//! # Drive Collector
//!
//! Execution core of a distributed media-transfer bot: a leader-elected,
//! webhook-driven pipeline that ingests media references from a chat
//! protocol stream, downloads the bytes through a supervised client, and
//! uploads them to the user's cloud drive.
//!
//! ## Architecture
//!
//! - `kv`: multi-tier cache facade (in-process LRU + remote primary/backup)
//! - `queue`: durable-queue publisher and webhook signatures
//! - `coordinator`: instance registry, leader election, per-task locks
//! - `protocol`: chat client supervision (classifier, breaker, watchdog)
//! - `repository`: durable stores (tasks, drives, settings, sessions)
//! - `dispatcher`: inbound event routing, guards, group aggregation
//! - `pipeline`: download/upload state machine and worker pools
//! - `server`: webhook HTTP router
//! - `limits`: priority-tiered rate limiting and retry policies
//! - `drive`: cloud drive provider seam and factory

#![warn(clippy::all)]

pub mod clock;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod drive;
pub mod kv;
pub mod limits;
pub mod models;
pub mod pipeline;
pub mod protocol;
pub mod queue;
pub mod repository;
pub mod server;

// Re-export the types nearly every consumer touches.
pub use config::AppConfig;
pub use models::{Drive, DriveType, Task, TaskStatus};

/// Crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name.
pub const NAME: &str = env!("CARGO_PKG_NAME");
