// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! In-memory transfer engine.
//!
//! Behaves like a real engine from the core's point of view: it validates
//! sources and save directories, advances each transfer with wall-clock time at
//! a configured rate, honours pause/resume, and reports seed completion. It
//! also exposes fault injection (status outages, forced completion) and call
//! accounting keyed by source URL, which the demo CLI and the tests rely on.

use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::debug;

use super::{AddTorrentParams, EngineError, EngineHandle, EngineStatus, StorageMode, TransferEngine};
use crate::locks::resilient_lock;

const MIB: u64 = 1024 * 1024;

/// Rate and size applied to newly added transfers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferProfile {
    /// Simulated download rate in bytes per second
    pub rate_bps: u64,
    /// Payload size used when the source does not carry an exact length (`xl=`)
    pub default_size: u64,
}

impl Default for TransferProfile {
    fn default() -> Self {
        Self {
            rate_bps: 2 * MIB,
            default_size: 256 * MIB,
        }
    }
}

#[derive(Debug)]
struct SimTransfer {
    url: String,
    storage_mode: StorageMode,
    total_wanted: u64,
    total_done: u64,
    rate_bps: u64,
    paused: bool,
    last_advance: Instant,
    pending_failures: u32,
    offline: bool,
}

impl SimTransfer {
    fn advance(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_advance).as_secs_f64();
        self.last_advance = now;
        if self.paused || self.total_done >= self.total_wanted {
            return;
        }
        let delta = (self.rate_bps as f64 * elapsed) as u64;
        self.total_done = self.total_done.saturating_add(delta).min(self.total_wanted);
    }

    fn status(&self) -> EngineStatus {
        let is_seed = self.total_done >= self.total_wanted;
        let progress = if self.total_wanted == 0 {
            1.0
        } else {
            self.total_done as f64 / self.total_wanted as f64
        };
        EngineStatus {
            download_rate: if self.paused || is_seed { 0 } else { self.rate_bps },
            total_done: self.total_done,
            total_wanted: self.total_wanted,
            progress,
            is_seed,
        }
    }
}

#[derive(Debug, Default)]
struct SimState {
    next_id: u64,
    transfers: HashMap<u64, SimTransfer>,
    removed: u64,
    status_calls: u64,
}

impl SimState {
    fn find_mut(&mut self, url: &str) -> Option<&mut SimTransfer> {
        self.transfers.values_mut().find(|t| t.url == url)
    }
}

#[derive(Debug, Default)]
struct GateState {
    waiting: usize,
    open: bool,
}

/// Holds status reads for one source until opened.
///
/// Lets a caller freeze a poller in the middle of a tick and act while the
/// read is in flight.
#[derive(Debug, Default)]
pub struct StatusGate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl StatusGate {
    /// Park the calling status read until the gate opens.
    fn pass(&self) {
        let mut state = resilient_lock(&self.state);
        state.waiting += 1;
        self.changed.notify_all();
        while !state.open {
            state = self.changed.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
        state.waiting -= 1;
    }

    /// Block until a status read is parked here. Returns false on timeout.
    pub fn wait_for_reader(&self, timeout: Duration) -> bool {
        let state = resilient_lock(&self.state);
        let (state, _) = self
            .changed
            .wait_timeout_while(state, timeout, |s| s.waiting == 0 && !s.open)
            .unwrap_or_else(PoisonError::into_inner);
        state.waiting > 0
    }

    /// Release parked reads and let every later read through.
    pub fn open(&self) {
        resilient_lock(&self.state).open = true;
        self.changed.notify_all();
    }
}

/// Engine that simulates transfers in memory.
#[derive(Debug, Default)]
pub struct SimulatedEngine {
    profile: TransferProfile,
    state: Mutex<SimState>,
    gates: Mutex<HashMap<String, Arc<StatusGate>>>,
}

impl SimulatedEngine {
    /// Engine that applies `profile` to every new transfer.
    pub fn new(profile: TransferProfile) -> Self {
        Self {
            profile,
            state: Mutex::new(SimState::default()),
            gates: Mutex::new(HashMap::new()),
        }
    }

    /// Gate status reads for `url`. Works before the transfer is added.
    pub fn gate_status(&self, url: &str) -> Arc<StatusGate> {
        let mut gates = resilient_lock(&self.gates);
        Arc::clone(gates.entry(url.to_string()).or_default())
    }

    /// Make the next `count` status reads for `url` fail.
    pub fn fail_status(&self, url: &str, count: u32) -> bool {
        let mut state = resilient_lock(&self.state);
        match state.find_mut(url) {
            Some(transfer) => {
                transfer.pending_failures = transfer.pending_failures.saturating_add(count);
                true
            }
            None => false,
        }
    }

    /// Make every status read for `url` fail until switched back.
    pub fn set_offline(&self, url: &str, offline: bool) -> bool {
        let mut state = resilient_lock(&self.state);
        match state.find_mut(url) {
            Some(transfer) => {
                transfer.offline = offline;
                true
            }
            None => false,
        }
    }

    /// Jump a transfer straight to seed-complete.
    pub fn complete(&self, url: &str) -> bool {
        let mut state = resilient_lock(&self.state);
        match state.find_mut(url) {
            Some(transfer) => {
                transfer.total_done = transfer.total_wanted;
                true
            }
            None => false,
        }
    }

    /// Change the rate of the transfer for `url` from now on.
    pub fn set_rate(&self, url: &str, rate_bps: u64) -> bool {
        let mut state = resilient_lock(&self.state);
        match state.find_mut(url) {
            Some(transfer) => {
                transfer.advance(Instant::now());
                transfer.rate_bps = rate_bps;
                true
            }
            None => false,
        }
    }

    /// `Some(paused)` while the transfer for `url` is registered.
    pub fn is_paused(&self, url: &str) -> Option<bool> {
        let mut state = resilient_lock(&self.state);
        state.find_mut(url).map(|t| t.paused)
    }

    /// Storage mode the transfer for `url` was added with.
    pub fn storage_mode(&self, url: &str) -> Option<StorageMode> {
        let mut state = resilient_lock(&self.state);
        state.find_mut(url).map(|t| t.storage_mode)
    }

    /// Whether a transfer for `url` is registered.
    pub fn contains(&self, url: &str) -> bool {
        let mut state = resilient_lock(&self.state);
        state.find_mut(url).is_some()
    }

    /// Number of transfers currently registered.
    pub fn active_transfers(&self) -> usize {
        resilient_lock(&self.state).transfers.len()
    }

    /// Number of successful `remove_torrent` calls so far.
    pub fn removed_count(&self) -> u64 {
        resilient_lock(&self.state).removed
    }

    /// Number of status reads so far, failed ones included.
    pub fn status_calls(&self) -> u64 {
        resilient_lock(&self.state).status_calls
    }

    fn payload_size(&self, url: &str) -> u64 {
        exact_length(url).unwrap_or(self.profile.default_size)
    }
}

/// Validate the source URL the way a real engine would before accepting it.
fn validate_source(url: &str) -> Result<(), EngineError> {
    let url = url.trim();
    if url.is_empty() {
        return Err(EngineError::InvalidSource("empty source".to_string()));
    }

    if let Some(query) = url.strip_prefix("magnet:?") {
        let has_info_hash = query
            .split('&')
            .any(|param| param.starts_with("xt=urn:btih:") && param.len() > "xt=urn:btih:".len());
        if !has_info_hash {
            return Err(EngineError::InvalidSource(format!(
                "magnet link without an info hash: {}",
                url
            )));
        }
        return Ok(());
    }

    for scheme in ["http://", "https://", "file://"] {
        if let Some(rest) = url.strip_prefix(scheme) {
            if rest.is_empty() {
                return Err(EngineError::InvalidSource(format!("missing location in {}", url)));
            }
            return Ok(());
        }
    }

    Err(EngineError::InvalidSource(format!("unsupported source: {}", url)))
}

fn validate_save_path(path: &Path) -> Result<(), EngineError> {
    let invalid = |reason: &str| EngineError::InvalidSavePath {
        path: path.to_path_buf(),
        reason: reason.to_string(),
    };

    let metadata = fs::metadata(path).map_err(|_| invalid("does not exist"))?;
    if !metadata.is_dir() {
        return Err(invalid("not a directory"));
    }
    if metadata.permissions().readonly() {
        return Err(invalid("read-only"));
    }
    Ok(())
}

/// Exact payload length from a magnet link's `xl=` parameter.
fn exact_length(url: &str) -> Option<u64> {
    url.strip_prefix("magnet:?")?
        .split('&')
        .find_map(|param| param.strip_prefix("xl="))
        .and_then(|value| value.parse().ok())
}

impl TransferEngine for SimulatedEngine {
    fn add_torrent(&self, params: &AddTorrentParams) -> Result<EngineHandle, EngineError> {
        validate_source(&params.url)?;
        validate_save_path(&params.save_path)?;

        let total_wanted = self.payload_size(&params.url);
        let mut state = resilient_lock(&self.state);
        state.next_id += 1;
        let id = state.next_id;
        state.transfers.insert(
            id,
            SimTransfer {
                url: params.url.clone(),
                storage_mode: params.storage_mode,
                total_wanted,
                total_done: 0,
                rate_bps: self.profile.rate_bps,
                paused: false,
                last_advance: Instant::now(),
                pending_failures: 0,
                offline: false,
            },
        );
        debug!(handle = id, url = %params.url, total_wanted, "simulated transfer added");
        Ok(EngineHandle::new(id))
    }

    fn status(&self, handle: &EngineHandle) -> Result<EngineStatus, EngineError> {
        let gate = {
            let mut state = resilient_lock(&self.state);
            state.status_calls += 1;
            let transfer = state
                .transfers
                .get(&handle.raw())
                .ok_or(EngineError::UnknownHandle(handle.raw()))?;
            let gate = resilient_lock(&self.gates).get(&transfer.url).cloned();
            gate
        };
        if let Some(gate) = gate {
            gate.pass();
        }

        let mut state = resilient_lock(&self.state);
        let transfer = state
            .transfers
            .get_mut(&handle.raw())
            .ok_or(EngineError::UnknownHandle(handle.raw()))?;

        if transfer.offline {
            return Err(EngineError::Unavailable("simulated outage".to_string()));
        }
        if transfer.pending_failures > 0 {
            transfer.pending_failures -= 1;
            return Err(EngineError::Unavailable("simulated status failure".to_string()));
        }

        transfer.advance(Instant::now());
        Ok(transfer.status())
    }

    fn pause(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        let mut state = resilient_lock(&self.state);
        let transfer = state
            .transfers
            .get_mut(&handle.raw())
            .ok_or(EngineError::UnknownHandle(handle.raw()))?;
        transfer.advance(Instant::now());
        transfer.paused = true;
        Ok(())
    }

    fn resume(&self, handle: &EngineHandle) -> Result<(), EngineError> {
        let mut state = resilient_lock(&self.state);
        let transfer = state
            .transfers
            .get_mut(&handle.raw())
            .ok_or(EngineError::UnknownHandle(handle.raw()))?;
        transfer.advance(Instant::now());
        transfer.paused = false;
        Ok(())
    }

    fn remove_torrent(&self, handle: EngineHandle) -> Result<(), EngineError> {
        let mut state = resilient_lock(&self.state);
        match state.transfers.remove(&handle.raw()) {
            Some(transfer) => {
                state.removed += 1;
                debug!(handle = handle.raw(), url = %transfer.url, "simulated transfer removed");
                Ok(())
            }
            None => Err(EngineError::UnknownHandle(handle.raw())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    const MAGNET: &str = "magnet:?xt=urn:btih:c9e15763f722f23e98a29decdfae341b98d53056&dn=ubuntu&xl=4096";

    fn engine() -> SimulatedEngine {
        SimulatedEngine::new(TransferProfile {
            rate_bps: 1024,
            default_size: 8192,
        })
    }

    #[test]
    fn test_validate_source_accepts_known_schemes() {
        assert!(validate_source(MAGNET).is_ok());
        assert!(validate_source("https://example.org/debian.torrent").is_ok());
        assert!(validate_source("file:///tmp/a.torrent").is_ok());
    }

    #[test]
    fn test_validate_source_rejects_malformed() {
        assert!(matches!(validate_source("   "), Err(EngineError::InvalidSource(_))));
        assert!(matches!(validate_source("magnet:?dn=nohash"), Err(EngineError::InvalidSource(_))));
        assert!(matches!(validate_source("ftp://host/file"), Err(EngineError::InvalidSource(_))));
        assert!(matches!(validate_source("https://"), Err(EngineError::InvalidSource(_))));
    }

    #[test]
    fn test_exact_length_from_magnet() {
        assert_eq!(exact_length(MAGNET), Some(4096));
        assert_eq!(exact_length("https://example.org/a.torrent"), None);
    }

    #[test]
    fn test_add_rejects_missing_save_path() {
        let engine = engine();
        let dir = TempDir::new().expect("temp dir");
        let missing = dir.path().join("nope");
        let err = engine
            .add_torrent(&AddTorrentParams::new(MAGNET, &missing, StorageMode::Sparse))
            .unwrap_err();
        assert!(matches!(err, EngineError::InvalidSavePath { .. }));
        assert_eq!(engine.active_transfers(), 0);
    }

    #[test]
    fn test_status_reports_size_and_pause() {
        let engine = engine();
        let dir = TempDir::new().expect("temp dir");
        let handle = engine
            .add_torrent(&AddTorrentParams::new(MAGNET, dir.path(), StorageMode::Allocate))
            .expect("add");
        assert_eq!(engine.storage_mode(MAGNET), Some(StorageMode::Allocate));

        let status = engine.status(&handle).expect("status");
        assert_eq!(status.total_wanted, 4096);
        assert!(!status.is_seed);

        engine.pause(&handle).expect("pause");
        assert_eq!(engine.is_paused(MAGNET), Some(true));
        assert_eq!(engine.status(&handle).expect("status").download_rate, 0);

        engine.resume(&handle).expect("resume");
        assert_eq!(engine.status(&handle).expect("status").download_rate, 1024);
    }

    #[test]
    fn test_injected_failures_then_recovery() {
        let engine = engine();
        let dir = TempDir::new().expect("temp dir");
        let handle = engine
            .add_torrent(&AddTorrentParams::new(MAGNET, dir.path(), StorageMode::Sparse))
            .expect("add");

        assert!(engine.fail_status(MAGNET, 2));
        assert!(matches!(engine.status(&handle), Err(EngineError::Unavailable(_))));
        assert!(matches!(engine.status(&handle), Err(EngineError::Unavailable(_))));
        assert!(engine.status(&handle).is_ok());
    }

    #[test]
    fn test_complete_and_remove() {
        let engine = engine();
        let dir = TempDir::new().expect("temp dir");
        let handle = engine
            .add_torrent(&AddTorrentParams::new(MAGNET, dir.path(), StorageMode::Sparse))
            .expect("add");

        assert!(engine.complete(MAGNET));
        let status = engine.status(&handle).expect("status");
        assert!(status.is_seed);
        assert_eq!(status.progress, 1.0);
        assert_eq!(status.download_rate, 0);

        let raw = handle.raw();
        engine.remove_torrent(handle).expect("remove");
        assert_eq!(engine.removed_count(), 1);
        assert!(!engine.contains(MAGNET));
        assert_eq!(
            engine.remove_torrent(EngineHandle::new(raw)),
            Err(EngineError::UnknownHandle(raw))
        );
    }

    #[test]
    fn test_status_gate_holds_read_until_opened() {
        let engine = Arc::new(engine());
        let dir = TempDir::new().expect("temp dir");
        let gate = engine.gate_status(MAGNET);
        let handle = engine
            .add_torrent(&AddTorrentParams::new(MAGNET, dir.path(), StorageMode::Sparse))
            .expect("add");

        let reader = {
            let engine = Arc::clone(&engine);
            std::thread::spawn(move || engine.status(&handle).map(|s| s.total_wanted))
        };
        assert!(gate.wait_for_reader(Duration::from_secs(5)));
        assert!(!reader.is_finished());
        // The engine stays usable while a read is parked.
        assert_eq!(engine.is_paused(MAGNET), Some(false));

        gate.open();
        assert_eq!(reader.join().expect("reader panicked"), Ok(4096));
        assert!(!gate.wait_for_reader(Duration::from_millis(10)));
    }
}
