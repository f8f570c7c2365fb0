//! HQ Sync Engine
//!
//! Bidirectional file synchronization between a local working directory
//! (the "HQ root") and an object store under a per-user prefix.
//!
//! Local changes flow watcher -> coalescing queue -> daemon -> uploader;
//! remote changes flow change detector -> downloader, driven by the
//! download manager's poll loop. Both directions share the ignore
//! engine and the persisted sync state, coordinate through the conflict
//! subsystem, and publish into the status aggregator.

pub mod config;
pub mod conflict;
pub mod daemon;
pub mod detector;
pub mod download_manager;
pub mod downloader;
pub mod events;
pub mod fsutil;
pub mod hasher;
pub mod ignore;
pub mod path;
pub mod queue;
pub mod state;
pub mod status;
pub mod storage;
pub mod uploader;
pub mod watcher;

mod error;
pub use error::{Result, SyncError};

/// Version tagged into upload metadata as `sync-agent-version`.
pub const SYNC_AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");
