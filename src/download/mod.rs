// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Concurrent download control for torrentctl
//!
//! This module runs many transfers at once with:
//! - One cancellable polling worker per live download
//! - A Downloading / Queued / Stopped category state machine
//! - Freshest-wins snapshot delivery to a single consumer
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐
//! │ DownloadManager │────▶│ DownloadTask    │──┐ per-task lock
//! │ (control API)   │     │ + poller (tokio)│  │
//! └────────┬────────┘     └────────┬────────┘  ▼
//!          │                       │       ┌─────────────────┐
//!          ▼                       │       │ TransferEngine  │
//! ┌─────────────────┐              │       │ (handle owner)  │
//! │ Registry        │◀─────────────┤       └─────────────────┘
//! │ (categories)    │              ▼
//! └─────────────────┘     ┌─────────────────┐     ┌──────────────┐
//!                         │ EventBus        │────▶│ Subscription │
//!                         │ (coalescing)    │     │ (consumer)   │
//!                         └─────────────────┘     └──────────────┘
//! ```
//!
//! Lock order is always task lock, then registry or bus lock. The registry
//! and the bus never call out while holding their own lock.
//!
//! # Usage
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use torrentctl::config::ManagerConfig;
//! use torrentctl::download::DownloadManager;
//! use torrentctl::engine::SimulatedEngine;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let engine = Arc::new(SimulatedEngine::default());
//! let manager = DownloadManager::new(engine, ManagerConfig::default())?;
//! let events = manager.subscribe()?;
//!
//! let id = manager.add("magnet:?xt=urn:btih:c9e15763f722f23e98a29decdfae341b98d53056", "/tmp")?;
//! manager.pause(&id)?;
//! manager.resume(&id)?;
//!
//! while let Some(snapshot) = events.recv().await {
//!     println!("{}: {}", snapshot.task_id(), snapshot);
//!     if snapshot.is_terminal() {
//!         break;
//!     }
//! }
//! # Ok(())
//! # }
//! ```

pub mod events;
pub mod manager;
pub mod registry;
pub mod task;
pub mod types;

// Re-export commonly used items
pub use events::{BusStats, EventBus, Subscription};
pub use manager::DownloadManager;
pub use registry::{Registry, RegistryLayout};
pub use task::DownloadTask;
pub use types::{format_eta, Category, CategoryCounts, Snapshot, TaskId};
