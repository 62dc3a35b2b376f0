// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! One managed download: the engine handle it owns and its polling worker.
//!
//! Every engine call on the handle (status reads from the worker, pause,
//! resume, stop from the control API) happens under the task's own mutex, so
//! calls on the same handle never overlap while different downloads never
//! contend with each other. Category moves are made while that mutex is held,
//! which keeps the registry in step with the engine state.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use super::events::EventBus;
use super::registry::Registry;
use super::types::{Category, Snapshot, TaskId};
use crate::engine::{AddTorrentParams, EngineHandle, StorageMode, TransferEngine};
use crate::error::DownloadError;
use crate::locks::{resilient_lock, resilient_read, resilient_write};

/// Everything a polling worker needs besides the task itself.
#[derive(Debug, Clone)]
pub(crate) struct PollContext {
    pub bus: EventBus,
    pub registry: Arc<Registry>,
    pub tick_interval: Duration,
    pub max_consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TickOutcome {
    Continue,
    Done,
}

#[derive(Debug)]
struct TaskControl {
    /// `None` once the task is stopped; the handle is never handed out.
    handle: Option<EngineHandle>,
    paused: bool,
    consecutive_failures: u32,
}

/// A download driven by the transfer engine.
pub struct DownloadTask {
    id: TaskId,
    source_url: String,
    save_path: PathBuf,
    created_at: DateTime<Utc>,
    engine: Arc<dyn TransferEngine>,
    control: Mutex<TaskControl>,
    cancel_tx: watch::Sender<bool>,
    latest: RwLock<Option<Snapshot>>,
}

impl fmt::Debug for DownloadTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DownloadTask")
            .field("id", &self.id)
            .field("source_url", &self.source_url)
            .field("save_path", &self.save_path)
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

impl DownloadTask {
    /// Register the source with the engine.
    ///
    /// Fails with [`DownloadError::AddFailed`] before any worker exists if the
    /// engine rejects the URL or save path.
    pub fn start(
        engine: Arc<dyn TransferEngine>,
        url: &str,
        save_path: &Path,
        storage_mode: StorageMode,
    ) -> Result<Arc<Self>, DownloadError> {
        let url = url.trim();
        if url.is_empty() {
            return Err(DownloadError::AddFailed {
                url: url.to_string(),
                reason: "empty source".to_string(),
            });
        }

        let params = AddTorrentParams::new(url, save_path, storage_mode);
        let handle = engine.add_torrent(&params).map_err(|e| DownloadError::AddFailed {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        let id = TaskId::generate();
        info!(task = %id, url, save_path = %save_path.display(), %storage_mode, "download added");

        let (cancel_tx, _) = watch::channel(false);
        Ok(Arc::new(Self {
            id,
            source_url: url.to_string(),
            save_path: save_path.to_path_buf(),
            created_at: Utc::now(),
            engine,
            control: Mutex::new(TaskControl {
                handle: Some(handle),
                paused: false,
                consecutive_failures: 0,
            }),
            cancel_tx,
            latest: RwLock::new(None),
        }))
    }

    /// Unique id assigned at add time.
    pub fn id(&self) -> &TaskId {
        &self.id
    }

    /// URL or magnet link the download was added from.
    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// Directory the engine writes into.
    pub fn save_path(&self) -> &Path {
        &self.save_path
    }

    /// When the download was added.
    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    /// The last snapshot this task published, if any.
    pub fn latest_snapshot(&self) -> Option<Snapshot> {
        resilient_read(&self.latest).clone()
    }

    /// True once the engine handle has been released.
    pub fn is_stopped(&self) -> bool {
        resilient_lock(&self.control).handle.is_none()
    }

    /// True while the transfer is paused in the engine.
    pub fn is_paused(&self) -> bool {
        resilient_lock(&self.control).paused
    }

    /// True once the poller has been told to exit.
    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.borrow()
    }

    /// Pause the transfer and move the task to Queued.
    ///
    /// Returns `Ok(false)` when there was nothing to do (stopped or already paused).
    pub(crate) fn pause(&self, registry: &Registry) -> Result<bool, DownloadError> {
        let mut control = resilient_lock(&self.control);
        let Some(handle) = control.handle.as_ref() else {
            debug!(task = %self.id, "pause ignored: already stopped");
            return Ok(false);
        };
        if control.paused {
            return Ok(false);
        }

        self.engine.pause(handle).map_err(|e| self.engine_error(e))?;
        if let Err(err) = registry.move_to(&self.id, Category::Queued) {
            if let Err(rollback) = self.engine.resume(handle) {
                warn!(task = %self.id, error = %rollback, "could not undo engine pause");
            }
            return Err(err);
        }
        control.paused = true;
        info!(task = %self.id, "download paused");
        Ok(true)
    }

    /// Resume the transfer and move the task back to Downloading.
    pub(crate) fn resume(&self, registry: &Registry) -> Result<bool, DownloadError> {
        let mut control = resilient_lock(&self.control);
        let Some(handle) = control.handle.as_ref() else {
            debug!(task = %self.id, "resume ignored: already stopped");
            return Ok(false);
        };
        if !control.paused {
            return Ok(false);
        }

        self.engine.resume(handle).map_err(|e| self.engine_error(e))?;
        if let Err(err) = registry.move_to(&self.id, Category::Downloading) {
            if let Err(rollback) = self.engine.pause(handle) {
                warn!(task = %self.id, error = %rollback, "could not undo engine resume");
            }
            return Err(err);
        }
        control.paused = false;
        info!(task = %self.id, "download resumed");
        Ok(true)
    }

    /// Cancel the worker, release the engine transfer, and move the task to Stopped.
    ///
    /// Idempotent: a second call returns `Ok(false)` and touches nothing.
    pub(crate) fn stop(&self, registry: &Registry) -> Result<bool, DownloadError> {
        let mut control = resilient_lock(&self.control);
        if control.handle.is_none() {
            debug!(task = %self.id, "stop ignored: already stopped");
            return Ok(false);
        }
        self.release_locked(&mut control, registry);
        info!(task = %self.id, "download stopped");
        Ok(true)
    }

    /// Spawn the polling worker on `runtime`.
    pub(crate) fn spawn_poller(self: &Arc<Self>, runtime: &Handle, ctx: PollContext) -> JoinHandle<()> {
        let task = Arc::clone(self);
        runtime.spawn(async move { task.poll_loop(ctx).await })
    }

    async fn poll_loop(self: Arc<Self>, ctx: PollContext) {
        let mut cancel_rx = self.cancel_tx.subscribe();
        debug!(task = %self.id, interval_ms = ctx.tick_interval.as_millis() as u64, "poller started");

        loop {
            if self.tick(&ctx) == TickOutcome::Done {
                break;
            }
            tokio::select! {
                biased;
                _ = cancel_rx.wait_for(|cancelled| *cancelled) => break,
                _ = tokio::time::sleep(ctx.tick_interval) => {}
            }
        }

        debug!(task = %self.id, "poller exited");
    }

    /// Read engine status once and publish the resulting snapshot.
    pub(crate) fn tick(&self, ctx: &PollContext) -> TickOutcome {
        let mut control = resilient_lock(&self.control);
        let Some(handle) = control.handle.as_ref() else {
            return TickOutcome::Done;
        };

        match self.engine.status(handle) {
            Ok(status) if status.is_seed => {
                let snapshot = Snapshot::completed(self.id.clone(), &status);
                self.release_locked(&mut control, &ctx.registry);
                info!(task = %self.id, size_mb = snapshot.total_size_mb(), "download complete");
                self.publish(ctx, snapshot);
                TickOutcome::Done
            }
            Ok(status) => {
                control.consecutive_failures = 0;
                let snapshot = Snapshot::from_status(self.id.clone(), &status);
                trace!(task = %self.id, percent = snapshot.progress_percent(), "tick");
                self.publish(ctx, snapshot);
                TickOutcome::Continue
            }
            Err(err) => {
                control.consecutive_failures += 1;
                let failures = control.consecutive_failures;
                if failures < ctx.max_consecutive_failures {
                    warn!(task = %self.id, failures, error = %err, "status read failed, retrying next tick");
                    return TickOutcome::Continue;
                }

                error!(task = %self.id, failures, error = %err, "engine unavailable, stopping download");
                let last = self.latest_snapshot();
                let snapshot = Snapshot::failed(
                    self.id.clone(),
                    last.as_ref(),
                    format!("engine unavailable after {} attempts: {}", failures, err),
                );
                self.release_locked(&mut control, &ctx.registry);
                self.publish(ctx, snapshot);
                TickOutcome::Done
            }
        }
    }

    fn publish(&self, ctx: &PollContext, snapshot: Snapshot) {
        *resilient_write(&self.latest) = Some(snapshot.clone());
        ctx.bus.publish(snapshot);
    }

    /// Terminal transition. Caller holds the control lock.
    fn release_locked(&self, control: &mut TaskControl, registry: &Registry) {
        self.cancel_tx.send_replace(true);
        control.paused = false;
        if let Some(handle) = control.handle.take() {
            if let Err(err) = self.engine.remove_torrent(handle) {
                warn!(task = %self.id, error = %err, "engine failed to release transfer");
            }
        }
        if let Err(err) = registry.move_to(&self.id, Category::Stopped) {
            warn!(task = %self.id, error = %err, "could not move download to Stopped");
        }
    }

    fn engine_error(&self, err: crate::engine::EngineError) -> DownloadError {
        DownloadError::EngineUnavailable {
            id: self.id.clone(),
            reason: err.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{SimulatedEngine, TransferProfile};
    use tempfile::TempDir;

    const URL: &str = "magnet:?xt=urn:btih:0123456789abcdef0123456789abcdef01234567&xl=1048576";

    struct Fixture {
        engine: Arc<SimulatedEngine>,
        registry: Arc<Registry>,
        bus: EventBus,
        dir: TempDir,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                engine: Arc::new(SimulatedEngine::new(TransferProfile {
                    rate_bps: 1024,
                    default_size: 1 << 20,
                })),
                registry: Arc::new(Registry::new()),
                bus: EventBus::new(16),
                dir: TempDir::new().expect("temp dir"),
            }
        }

        fn ctx(&self, max_failures: u32) -> PollContext {
            PollContext {
                bus: self.bus.clone(),
                registry: Arc::clone(&self.registry),
                tick_interval: Duration::from_millis(10),
                max_consecutive_failures: max_failures,
            }
        }

        fn add(&self) -> Arc<DownloadTask> {
            let task = DownloadTask::start(self.engine.clone(), URL, self.dir.path(), StorageMode::Sparse)
                .expect("start");
            self.registry.insert(Arc::clone(&task)).expect("insert");
            task
        }
    }

    #[test]
    fn test_start_rejects_blank_url_without_engine_call() {
        let fx = Fixture::new();
        let err = DownloadTask::start(fx.engine.clone(), "  ", fx.dir.path(), StorageMode::Sparse).unwrap_err();
        assert!(matches!(err, DownloadError::AddFailed { .. }));
        assert_eq!(fx.engine.active_transfers(), 0);
    }

    #[test]
    fn test_start_surfaces_engine_rejection() {
        let fx = Fixture::new();
        let err = DownloadTask::start(fx.engine.clone(), "gopher://x", fx.dir.path(), StorageMode::Sparse)
            .unwrap_err();
        match err {
            DownloadError::AddFailed { url, reason } => {
                assert_eq!(url, "gopher://x");
                assert!(reason.contains("unsupported source"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_tick_publishes_attributed_snapshot() {
        let fx = Fixture::new();
        let sub = fx.bus.subscribe().expect("subscribe");
        let task = fx.add();

        assert_eq!(task.tick(&fx.ctx(3)), TickOutcome::Continue);
        let snaps = sub.drain();
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].task_id(), task.id());
        assert!(!snaps[0].finished());
        assert_eq!(snaps[0].total_size_mb(), 1.0);
        assert_eq!(task.latest_snapshot().as_ref(), snaps.first());
    }

    #[test]
    fn test_pause_resume_forward_and_move() {
        let fx = Fixture::new();
        let task = fx.add();

        assert!(task.pause(&fx.registry).expect("pause"));
        assert_eq!(fx.engine.is_paused(URL), Some(true));
        assert_eq!(fx.registry.category_of(task.id()), Some(Category::Queued));
        assert!(!task.pause(&fx.registry).expect("second pause"));

        // A paused task keeps reporting.
        assert_eq!(task.tick(&fx.ctx(3)), TickOutcome::Continue);

        assert!(task.resume(&fx.registry).expect("resume"));
        assert_eq!(fx.engine.is_paused(URL), Some(false));
        assert_eq!(fx.registry.category_of(task.id()), Some(Category::Downloading));
        assert!(!task.resume(&fx.registry).expect("second resume"));
    }

    #[test]
    fn test_failed_move_undoes_engine_pause() {
        let fx = Fixture::new();
        let task = fx.add();
        let elsewhere = Registry::new();

        let err = task.pause(&elsewhere).unwrap_err();
        assert!(matches!(err, DownloadError::NotFound(_)));
        assert_eq!(fx.engine.is_paused(URL), Some(false));
        assert!(!task.is_paused());
        assert_eq!(fx.registry.category_of(task.id()), Some(Category::Downloading));
    }

    #[test]
    fn test_failed_move_undoes_engine_resume() {
        let fx = Fixture::new();
        let task = fx.add();
        task.pause(&fx.registry).expect("pause");
        let elsewhere = Registry::new();

        let err = task.resume(&elsewhere).unwrap_err();
        assert!(matches!(err, DownloadError::NotFound(_)));
        assert_eq!(fx.engine.is_paused(URL), Some(true));
        assert!(task.is_paused());
        assert_eq!(fx.registry.category_of(task.id()), Some(Category::Queued));
    }

    #[test]
    fn test_stop_is_idempotent_and_terminal() {
        let fx = Fixture::new();
        let sub = fx.bus.subscribe().expect("subscribe");
        let task = fx.add();

        assert!(task.stop(&fx.registry).expect("stop"));
        assert!(!task.stop(&fx.registry).expect("second stop"));
        assert_eq!(fx.engine.removed_count(), 1);
        assert!(task.is_stopped());
        assert!(task.is_cancelled());
        assert_eq!(fx.registry.category_of(task.id()), Some(Category::Stopped));

        assert!(!task.pause(&fx.registry).expect("pause after stop"));
        assert!(!task.resume(&fx.registry).expect("resume after stop"));
        assert_eq!(task.tick(&fx.ctx(3)), TickOutcome::Done);
        assert!(sub.drain().is_empty());
    }

    #[test]
    fn test_completion_emits_one_terminal_snapshot() {
        let fx = Fixture::new();
        let sub = fx.bus.subscribe().expect("subscribe");
        let task = fx.add();

        fx.engine.complete(URL);
        assert_eq!(task.tick(&fx.ctx(3)), TickOutcome::Done);
        assert_eq!(task.tick(&fx.ctx(3)), TickOutcome::Done);

        let snaps = sub.drain();
        assert_eq!(snaps.len(), 1);
        assert!(snaps[0].finished());
        assert_eq!(snaps[0].eta_seconds(), None);
        assert_eq!(snaps[0].download_rate_kbs(), 0.0);
        assert_eq!(snaps[0].progress_percent(), 100);
        assert_eq!(fx.registry.category_of(task.id()), Some(Category::Stopped));
        assert_eq!(fx.engine.removed_count(), 1);
    }

    #[test]
    fn test_transient_failures_are_retried() {
        let fx = Fixture::new();
        let sub = fx.bus.subscribe().expect("subscribe");
        let task = fx.add();
        let ctx = fx.ctx(3);

        fx.engine.fail_status(URL, 2);
        assert_eq!(task.tick(&ctx), TickOutcome::Continue);
        assert_eq!(task.tick(&ctx), TickOutcome::Continue);
        assert!(sub.drain().is_empty());

        assert_eq!(task.tick(&ctx), TickOutcome::Continue);
        assert_eq!(sub.drain().len(), 1);
        assert_eq!(fx.registry.category_of(task.id()), Some(Category::Downloading));
    }

    #[test]
    fn test_persistent_failures_stop_the_task() {
        let fx = Fixture::new();
        let sub = fx.bus.subscribe().expect("subscribe");
        let task = fx.add();
        let ctx = fx.ctx(3);

        assert_eq!(task.tick(&ctx), TickOutcome::Continue);
        fx.engine.set_offline(URL, true);
        assert_eq!(task.tick(&ctx), TickOutcome::Continue);
        assert_eq!(task.tick(&ctx), TickOutcome::Continue);
        assert_eq!(task.tick(&ctx), TickOutcome::Done);

        let snaps = sub.drain();
        assert_eq!(snaps.len(), 2);
        let terminal = &snaps[1];
        assert!(terminal.is_terminal());
        assert!(!terminal.finished());
        assert!(terminal.error().unwrap_or_default().contains("after 3 attempts"));
        assert_eq!(fx.registry.category_of(task.id()), Some(Category::Stopped));
        assert!(task.is_stopped());
    }

    #[tokio::test]
    async fn test_stop_interrupts_sleeping_poller() {
        let fx = Fixture::new();
        let task = fx.add();
        let mut ctx = fx.ctx(3);
        ctx.tick_interval = Duration::from_secs(30);

        let worker = task.spawn_poller(&Handle::current(), ctx);
        tokio::time::sleep(Duration::from_millis(50)).await;
        task.stop(&fx.registry).expect("stop");

        tokio::time::timeout(Duration::from_secs(2), worker)
            .await
            .expect("poller did not exit promptly")
            .expect("poller panicked");
    }
}
