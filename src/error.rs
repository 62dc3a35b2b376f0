// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Error types for the download core, plus the formatting used when the CLI
//! reports one of them to a person.

use thiserror::Error;

use crate::download::types::{Category, TaskId};

/// Errors surfaced by the control API.
///
/// A control call on a task that is already stopped is not an error: it is
/// logged and reported as success.
#[derive(Debug, Error)]
pub enum DownloadError {
    /// The engine rejected the source or save path; no worker was spawned.
    #[error("failed to add {url}: {reason}")]
    AddFailed { url: String, reason: String },

    #[error("no download with id {0}")]
    NotFound(TaskId),

    /// The engine could not carry out a control call on a live transfer.
    #[error("engine unavailable for {id}: {reason}")]
    EngineUnavailable { id: TaskId, reason: String },

    #[error("download {id} cannot move from {from} to {to}")]
    InvalidTransition { id: TaskId, from: Category, to: Category },

    #[error("download {0} is already registered")]
    DuplicateTask(TaskId),

    #[error("the snapshot stream already has a subscriber")]
    AlreadySubscribed,

    #[error("no tokio runtime available: {0}")]
    NoRuntime(String),
}

impl DownloadError {
    /// Likely causes and fixes, for [`format_error`].
    pub fn hints(&self) -> (Vec<&'static str>, Vec<&'static str>) {
        match self {
            DownloadError::AddFailed { .. } => (
                vec![
                    "The source is not a magnet link or http(s)/file URL",
                    "The magnet link has no xt=urn:btih: info hash",
                    "The save directory does not exist or is read-only",
                ],
                vec![
                    "Check the link: magnet:?xt=urn:btih:<hash>",
                    "Pick an existing, writable directory with --save-path",
                ],
            ),
            DownloadError::NotFound(_) => (
                vec!["The row number or id does not match any download"],
                vec!["List downloads: list"],
            ),
            DownloadError::AlreadySubscribed => (
                vec!["Another consumer is already draining snapshots"],
                vec!["Drop the existing subscription before subscribing again"],
            ),
            DownloadError::NoRuntime(_) => (
                vec!["The manager was created outside a tokio runtime"],
                vec!["Create it inside #[tokio::main] or pass a runtime handle"],
            ),
            _ => (Vec::new(), Vec::new()),
        }
    }
}

/// Format an error with a title, possible causes, and suggested fixes.
///
/// ```
/// use torrentctl::error::format_error;
///
/// let text = format_error(
///     "Failed to add download",
///     &["Save directory is read-only"],
///     &["Pick another directory with --save-path"],
/// );
/// assert!(text.starts_with("[✗] Failed to add download"));
/// assert!(text.contains("  1. Pick another directory"));
/// ```
pub fn format_error(title: &str, causes: &[&str], fixes: &[&str]) -> String {
    let mut output = format!("[✗] {}\n", title);

    if !causes.is_empty() {
        output.push_str("\nPossible causes:\n");
        for cause in causes {
            output.push_str(&format!("  - {}\n", cause));
        }
    }

    if !fixes.is_empty() {
        output.push_str("\nTry these fixes:\n");
        for (i, fix) in fixes.iter().enumerate() {
            output.push_str(&format!("  {}. {}\n", i + 1, fix));
        }
    }

    output
}

/// Format a [`DownloadError`] with its own hints.
pub fn format_download_error(err: &DownloadError) -> String {
    let (causes, fixes) = err.hints();
    format_error(&err.to_string(), &causes, &fixes)
}
