// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Transfer engine seam.
//!
//! The actual data transfer (peers, pieces, disk I/O) belongs to an external
//! engine. This module defines the narrow surface the download core needs from
//! it: register a source, read status, pause, resume, and remove.
//!
//! Handles are deliberately not `Clone`: whoever holds an [`EngineHandle`] is
//! the only party allowed to drive that transfer, and `remove_torrent` consumes
//! it so a released handle cannot be used again.

pub mod simulated;

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use simulated::{SimulatedEngine, StatusGate, TransferProfile};

/// How the engine allocates the payload on disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    /// Files are created sparse and filled as pieces arrive
    #[default]
    Sparse,
    /// Full size is allocated up front
    Allocate,
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageMode::Sparse => write!(f, "sparse"),
            StorageMode::Allocate => write!(f, "allocate"),
        }
    }
}

/// Parameters for registering a new transfer.
#[derive(Debug, Clone)]
pub struct AddTorrentParams {
    pub url: String,
    pub save_path: PathBuf,
    pub storage_mode: StorageMode,
}

impl AddTorrentParams {
    /// Parameters for adding `url` under `save_path`.
    pub fn new(url: impl Into<String>, save_path: impl AsRef<Path>, storage_mode: StorageMode) -> Self {
        Self {
            url: url.into(),
            save_path: save_path.as_ref().to_path_buf(),
            storage_mode,
        }
    }
}

/// Opaque reference to one transfer inside the engine.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct EngineHandle(u64);

impl EngineHandle {
    /// Wrap an engine-specific identifier. Only engine implementations should call this.
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    /// Engine-side id of the transfer.
    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Raw status as reported by the engine for one transfer.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct EngineStatus {
    /// Payload download rate in bytes per second
    pub download_rate: u64,
    /// Bytes of wanted payload already on disk
    pub total_done: u64,
    /// Bytes of payload selected for download
    pub total_wanted: u64,
    /// Fraction complete in `[0.0, 1.0]`
    pub progress: f64,
    /// True once every wanted piece is present
    pub is_seed: bool,
}

/// Errors raised by a transfer engine.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum EngineError {
    #[error("invalid source: {0}")]
    InvalidSource(String),

    #[error("save path {} is not usable: {reason}", path.display())]
    InvalidSavePath { path: PathBuf, reason: String },

    #[error("unknown transfer handle {0}")]
    UnknownHandle(u64),

    #[error("engine unavailable: {0}")]
    Unavailable(String),
}

/// The operations the download core consumes from a transfer engine.
///
/// Implementations must be callable from any thread. The core guarantees that
/// calls for the same handle never overlap.
pub trait TransferEngine: Send + Sync {
    /// Register a source and return the handle that now owns the transfer.
    fn add_torrent(&self, params: &AddTorrentParams) -> Result<EngineHandle, EngineError>;

    /// Read the current status of a transfer.
    fn status(&self, handle: &EngineHandle) -> Result<EngineStatus, EngineError>;

    fn pause(&self, handle: &EngineHandle) -> Result<(), EngineError>;

    fn resume(&self, handle: &EngineHandle) -> Result<(), EngineError>;

    /// Stop the transfer and release every resource tied to it.
    fn remove_torrent(&self, handle: EngineHandle) -> Result<(), EngineError>;
}
