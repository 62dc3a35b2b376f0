// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Download types: task ids, categories, and progress snapshots.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::engine::EngineStatus;

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

static TASK_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Unique identifier of a managed download.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskId(String);

impl TaskId {
    /// Generate a fresh id: `dl_<millis>_<counter>_<random>`.
    pub fn generate() -> Self {
        let counter = TASK_COUNTER.fetch_add(1, Ordering::SeqCst);
        let timestamp = Utc::now().timestamp_millis();
        let random: u32 = rand::random();
        Self(format!("dl_{}_{}_{:08x}", timestamp, counter, random))
    }

    /// The id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TaskId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Mutually exclusive classification of a download.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Transfer running (or just added)
    Downloading,
    /// Paused by the user
    Queued,
    /// Stopped, completed, or failed; terminal
    Stopped,
}

impl Category {
    pub const ALL: [Category; 3] = [Category::Downloading, Category::Queued, Category::Stopped];

    pub(crate) fn index(self) -> usize {
        match self {
            Category::Downloading => 0,
            Category::Queued => 1,
            Category::Stopped => 2,
        }
    }

    /// True for Stopped, which has no way out.
    pub fn is_terminal(self) -> bool {
        self == Category::Stopped
    }

    /// Whether the state machine allows moving from `self` to `target`.
    pub fn can_move_to(self, target: Category) -> bool {
        match (self, target) {
            (Category::Stopped, _) => false,
            (from, to) if from == to => true,
            (Category::Downloading, Category::Queued)
            | (Category::Queued, Category::Downloading)
            | (_, Category::Stopped) => true,
            _ => false,
        }
    }

    /// Display label.
    pub fn label(self) -> &'static str {
        match self {
            Category::Downloading => "Downloading",
            Category::Queued => "Queued",
            Category::Stopped => "Stopped",
        }
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "downloading" | "active" => Ok(Category::Downloading),
            "queued" | "paused" => Ok(Category::Queued),
            "stopped" | "done" => Ok(Category::Stopped),
            other => Err(format!("unknown category: {}", other)),
        }
    }
}

/// Number of downloads per category.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CategoryCounts {
    pub downloading: usize,
    pub queued: usize,
    pub stopped: usize,
}

impl CategoryCounts {
    /// Sum over all categories.
    pub fn total(&self) -> usize {
        self.downloading + self.queued + self.stopped
    }
}

/// Immutable point-in-time progress record for one download.
///
/// Built once per poll tick from the engine status and never modified after it
/// is published; consumers always receive their own copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    task_id: TaskId,
    download_rate_kbs: f64,
    total_downloaded_mb: f64,
    total_size_mb: f64,
    progress_percent: u8,
    eta_seconds: Option<f64>,
    finished: bool,
    error: Option<String>,
    captured_at: DateTime<Utc>,
}

impl Snapshot {
    /// Derive a running snapshot from raw engine status.
    pub fn from_status(task_id: TaskId, status: &EngineStatus) -> Self {
        let eta_seconds = if status.download_rate > 0 {
            let remaining = status.total_wanted.saturating_sub(status.total_done);
            Some(remaining as f64 / status.download_rate as f64)
        } else {
            None
        };

        Self {
            task_id,
            download_rate_kbs: status.download_rate as f64 / 1000.0,
            total_downloaded_mb: status.total_done as f64 / BYTES_PER_MB,
            total_size_mb: status.total_wanted as f64 / BYTES_PER_MB,
            progress_percent: percent(status.progress),
            eta_seconds,
            finished: false,
            error: None,
            captured_at: Utc::now(),
        }
    }

    /// The single terminal snapshot emitted when the engine reports seed-complete.
    pub fn completed(task_id: TaskId, status: &EngineStatus) -> Self {
        Self {
            download_rate_kbs: 0.0,
            eta_seconds: None,
            finished: true,
            ..Self::from_status(task_id, status)
        }
    }

    /// Terminal snapshot for a download that stopped itself after repeated engine failures.
    ///
    /// Carries the last known totals forward so the consumer keeps showing them.
    pub fn failed(task_id: TaskId, last: Option<&Snapshot>, error: impl Into<String>) -> Self {
        Self {
            task_id,
            download_rate_kbs: 0.0,
            total_downloaded_mb: last.map_or(0.0, |s| s.total_downloaded_mb),
            total_size_mb: last.map_or(0.0, |s| s.total_size_mb),
            progress_percent: last.map_or(0, |s| s.progress_percent),
            eta_seconds: None,
            finished: false,
            error: Some(error.into()),
            captured_at: Utc::now(),
        }
    }

    /// Download this snapshot belongs to.
    pub fn task_id(&self) -> &TaskId {
        &self.task_id
    }

    /// Download rate in kB/s (1 kB = 1000 bytes).
    pub fn download_rate_kbs(&self) -> f64 {
        self.download_rate_kbs
    }

    /// Downloaded payload in MiB.
    pub fn total_downloaded_mb(&self) -> f64 {
        self.total_downloaded_mb
    }

    /// Wanted payload in MiB.
    pub fn total_size_mb(&self) -> f64 {
        self.total_size_mb
    }

    /// Progress as a whole percentage, 0 to 100.
    pub fn progress_percent(&self) -> u8 {
        self.progress_percent
    }

    /// Seconds remaining, or `None` when the rate is zero.
    pub fn eta_seconds(&self) -> Option<f64> {
        self.eta_seconds
    }

    /// True on the completion snapshot.
    pub fn finished(&self) -> bool {
        self.finished
    }

    /// Failure reason on a terminal error snapshot.
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// When the snapshot was taken.
    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    /// True for the last snapshot a download will ever publish.
    pub fn is_terminal(&self) -> bool {
        self.finished || self.error.is_some()
    }

    /// Human-readable ETA, `N/A` when unavailable.
    pub fn eta_string(&self) -> String {
        match self.eta_seconds {
            Some(secs) if secs > 0.0 => format_eta(secs),
            _ => "N/A".to_string(),
        }
    }
}

impl fmt::Display for Snapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:.2} MB / {:.2} MB",
            self.total_downloaded_mb, self.total_size_mb
        )?;
        if self.finished {
            return write!(f, " - Download Complete");
        }
        if let Some(error) = &self.error {
            return write!(f, " - Failed: {}", error);
        }
        write!(f, " @ {:.2} kB/s - {}", self.download_rate_kbs, self.eta_string())
    }
}

fn percent(progress: f64) -> u8 {
    if !progress.is_finite() {
        return 0;
    }
    (progress * 100.0).floor().clamp(0.0, 100.0) as u8
}

/// Format a duration in seconds as `1h 2m 3s`, `2m 3s`, or `3s`.
pub fn format_eta(seconds: f64) -> String {
    let total = seconds.max(0.0) as u64;
    let (hours, rest) = (total / 3600, total % 3600);
    let (minutes, secs) = (rest / 60, rest % 60);
    if hours > 0 {
        format!("{}h {}m {}s", hours, minutes, secs)
    } else if minutes > 0 {
        format!("{}m {}s", minutes, secs)
    } else {
        format!("{}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn status(rate: u64, done: u64, wanted: u64) -> EngineStatus {
        EngineStatus {
            download_rate: rate,
            total_done: done,
            total_wanted: wanted,
            progress: if wanted == 0 { 0.0 } else { done as f64 / wanted as f64 },
            is_seed: false,
        }
    }

    #[test]
    fn test_eta_from_remaining_and_rate() {
        let snap = Snapshot::from_status(TaskId::from("a"), &status(10 * MB, 40 * MB, 100 * MB));
        assert_eq!(snap.eta_seconds(), Some(6.0));
        assert_eq!(snap.total_downloaded_mb(), 40.0);
        assert_eq!(snap.total_size_mb(), 100.0);
    }

    #[test]
    fn test_eta_unavailable_at_zero_rate() {
        let snap = Snapshot::from_status(TaskId::from("a"), &status(0, 40 * MB, 100 * MB));
        assert_eq!(snap.eta_seconds(), None);
        assert_eq!(snap.eta_string(), "N/A");
        assert_eq!(snap.download_rate_kbs(), 0.0);
    }

    #[test]
    fn test_progress_percent_floors() {
        let snap = Snapshot::from_status(TaskId::from("a"), &status(1, 50, 200));
        assert_eq!(snap.progress_percent(), 25);

        let mut raw = status(1, 0, 100);
        raw.progress = 0.999;
        assert_eq!(Snapshot::from_status(TaskId::from("a"), &raw).progress_percent(), 99);

        raw.progress = 1.7;
        assert_eq!(Snapshot::from_status(TaskId::from("a"), &raw).progress_percent(), 100);

        raw.progress = f64::NAN;
        assert_eq!(Snapshot::from_status(TaskId::from("a"), &raw).progress_percent(), 0);
    }

    #[test]
    fn test_rate_in_kilobytes() {
        let snap = Snapshot::from_status(TaskId::from("a"), &status(150_000, 0, 10));
        assert_eq!(snap.download_rate_kbs(), 150.0);
    }

    #[test]
    fn test_completed_snapshot_is_terminal() {
        let mut raw = status(5 * MB, 100 * MB, 100 * MB);
        raw.progress = 1.0;
        raw.is_seed = true;
        let snap = Snapshot::completed(TaskId::from("a"), &raw);
        assert!(snap.finished());
        assert!(snap.is_terminal());
        assert_eq!(snap.eta_seconds(), None);
        assert_eq!(snap.download_rate_kbs(), 0.0);
        assert_eq!(snap.progress_percent(), 100);
        assert_eq!(snap.to_string(), "100.00 MB / 100.00 MB - Download Complete");
    }

    #[test]
    fn test_failed_snapshot_keeps_totals() {
        let last = Snapshot::from_status(TaskId::from("a"), &status(MB, 50 * MB, 200 * MB));
        let snap = Snapshot::failed(TaskId::from("a"), Some(&last), "engine unavailable");
        assert!(!snap.finished());
        assert!(snap.is_terminal());
        assert_eq!(snap.error(), Some("engine unavailable"));
        assert_eq!(snap.progress_percent(), 25);
        assert_eq!(snap.total_size_mb(), 200.0);
    }

    #[test]
    fn test_snapshot_display_line() {
        let snap = Snapshot::from_status(TaskId::from("a"), &status(150_000, 12 * MB, 100 * MB));
        let line = snap.to_string();
        assert!(line.starts_with("12.00 MB / 100.00 MB @ 150.00 kB/s - "));
        assert!(line.ends_with("10m 15s"));
    }

    #[test]
    fn test_format_eta() {
        assert_eq!(format_eta(3.9), "3s");
        assert_eq!(format_eta(123.0), "2m 3s");
        assert_eq!(format_eta(3723.0), "1h 2m 3s");
    }

    #[test]
    fn test_category_transitions() {
        assert!(Category::Downloading.can_move_to(Category::Queued));
        assert!(Category::Queued.can_move_to(Category::Downloading));
        assert!(Category::Queued.can_move_to(Category::Stopped));
        assert!(!Category::Stopped.can_move_to(Category::Downloading));
        assert!(!Category::Stopped.can_move_to(Category::Stopped));
    }

    #[test]
    fn test_category_from_str() {
        assert_eq!("Queued".parse::<Category>(), Ok(Category::Queued));
        assert_eq!("paused".parse::<Category>(), Ok(Category::Queued));
        assert!("archived".parse::<Category>().is_err());
    }

    #[test]
    fn test_task_ids_are_unique() {
        let a = TaskId::generate();
        let b = TaskId::generate();
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("dl_"));
    }
}
