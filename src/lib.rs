// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! torrentctl - concurrent torrent download control
//!
//! Many transfers, one consumer, no stalls.
//!
//! Each download gets its own cancellable polling worker that reads the
//! transfer engine and publishes progress snapshots. A category registry
//! tracks which downloads are Downloading, Queued, or Stopped, and a
//! coalescing event bus hands the freshest snapshots to a single consumer.
//!
//! # Core Modules
//!
//! - [`download`] - Control API, per-download workers, registry, event bus
//! - [`engine`] - Transfer engine seam and the in-memory simulated engine
//! - [`config`] - Manager and CLI configuration
//! - [`error`] - Error types and user-facing error formatting
//! - [`locks`] - Poison-tolerant lock helpers
//! - [`logging`] - tracing subscriber setup

pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod locks;
pub mod logging;

// Re-export the control surface
pub use config::{AppConfig, ManagerConfig};
pub use download::{
    format_eta, BusStats, Category, CategoryCounts, DownloadManager, DownloadTask, EventBus,
    RegistryLayout, Snapshot, Subscription, TaskId,
};
pub use engine::{
    AddTorrentParams, EngineError, EngineHandle, EngineStatus, SimulatedEngine, StorageMode,
    StatusGate, TransferEngine, TransferProfile,
};
pub use error::{format_download_error, format_error, DownloadError};
