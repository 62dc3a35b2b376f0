// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Control API for downloads.
//!
//! [`DownloadManager`] turns add/pause/resume/stop calls into task and registry
//! operations and owns one polling worker per live download.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use super::events::{BusStats, EventBus, Subscription};
use super::registry::{Registry, RegistryLayout};
use super::task::{DownloadTask, PollContext};
use super::types::{Category, CategoryCounts, TaskId};
use crate::config::ManagerConfig;
use crate::engine::TransferEngine;
use crate::error::DownloadError;
use crate::locks::resilient_lock;

/// Manager for concurrent downloads.
///
/// Every call is safe from any thread while workers run; calls on one download
/// never wait on another download.
pub struct DownloadManager {
    engine: Arc<dyn TransferEngine>,
    registry: Arc<Registry>,
    bus: EventBus,
    config: ManagerConfig,
    runtime: Handle,
    workers: Mutex<HashMap<TaskId, JoinHandle<()>>>,
    shut_down: AtomicBool,
}

impl std::fmt::Debug for DownloadManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadManager")
            .field("counts", &self.counts())
            .field("config", &self.config)
            .finish()
    }
}

impl DownloadManager {
    /// Create a manager whose workers run on the current tokio runtime.
    pub fn new(engine: Arc<dyn TransferEngine>, config: ManagerConfig) -> Result<Self, DownloadError> {
        let runtime = Handle::try_current().map_err(|e| DownloadError::NoRuntime(e.to_string()))?;
        Ok(Self::with_runtime(engine, config, runtime))
    }

    /// Create a manager whose workers run on `runtime`.
    pub fn with_runtime(engine: Arc<dyn TransferEngine>, config: ManagerConfig, runtime: Handle) -> Self {
        let config = config.normalized();
        info!(
            tick_ms = config.tick_interval_ms,
            max_failures = config.max_consecutive_failures,
            coalesce_depth = config.coalesce_depth,
            storage_mode = %config.storage_mode,
            "download manager started"
        );
        Self {
            engine,
            registry: Arc::new(Registry::new()),
            bus: EventBus::new(config.coalesce_depth),
            config,
            runtime,
            workers: Mutex::new(HashMap::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Add a download and start polling it. The new task lands in Downloading.
    ///
    /// Serialized with [`shutdown`](Self::shutdown) through the worker table,
    /// so a download is either seen and stopped by shutdown or rejected here.
    pub fn add(&self, url: &str, save_path: impl AsRef<Path>) -> Result<TaskId, DownloadError> {
        let mut workers = resilient_lock(&self.workers);
        if self.shut_down.load(Ordering::SeqCst) {
            return Err(DownloadError::AddFailed {
                url: url.to_string(),
                reason: "manager is shut down".to_string(),
            });
        }

        let task = DownloadTask::start(
            Arc::clone(&self.engine),
            url,
            save_path.as_ref(),
            self.config.storage_mode,
        )?;
        let id = task.id().clone();
        self.registry.insert(Arc::clone(&task))?;

        let worker = task.spawn_poller(&self.runtime, self.poll_context());
        workers.retain(|_, handle| !handle.is_finished());
        workers.insert(id.clone(), worker);
        Ok(id)
    }

    /// Pause a download and move it to Queued. No-op if already paused or stopped.
    pub fn pause(&self, id: &TaskId) -> Result<(), DownloadError> {
        self.lookup(id)?.pause(&self.registry).map(|_| ())
    }

    /// Resume a download and move it to Downloading. No-op unless paused.
    pub fn resume(&self, id: &TaskId) -> Result<(), DownloadError> {
        self.lookup(id)?.resume(&self.registry).map(|_| ())
    }

    /// Stop a download for good. Idempotent.
    pub fn stop(&self, id: &TaskId) -> Result<(), DownloadError> {
        self.lookup(id)?.stop(&self.registry).map(|_| ())
    }

    /// Claim the snapshot stream. Only one subscriber at a time.
    pub fn subscribe(&self) -> Result<Subscription, DownloadError> {
        self.bus.subscribe()
    }

    /// The download with `id`, in any category.
    pub fn task(&self, id: &TaskId) -> Option<Arc<DownloadTask>> {
        self.registry.get(id)
    }

    /// Current category of `id`, or `None` if unknown.
    pub fn category_of(&self, id: &TaskId) -> Option<Category> {
        self.registry.category_of(id)
    }

    /// Downloads in `category`, in the order they entered it.
    pub fn list_category(&self, category: Category) -> Vec<Arc<DownloadTask>> {
        self.registry.list(category)
    }

    /// All three categories captured at one instant.
    pub fn layout(&self) -> RegistryLayout {
        self.registry.layout()
    }

    /// Number of downloads per category.
    pub fn counts(&self) -> CategoryCounts {
        self.registry.counts()
    }

    /// Workers still running. Equals the number of non-stopped downloads once
    /// stopped workers have observed their cancellation.
    pub fn active_workers(&self) -> usize {
        resilient_lock(&self.workers)
            .values()
            .filter(|handle| !handle.is_finished())
            .count()
    }

    /// Snapshot delivery counters.
    pub fn bus_stats(&self) -> BusStats {
        self.bus.stats()
    }

    /// Effective configuration, after clamping.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Stop every live download and close the snapshot stream.
    ///
    /// Terminal snapshots already queued stay available to the subscriber.
    pub fn shutdown(&self) {
        let live: Vec<Arc<DownloadTask>> = {
            let _workers = resilient_lock(&self.workers);
            if self.shut_down.swap(true, Ordering::SeqCst) {
                return;
            }
            [Category::Downloading, Category::Queued]
                .into_iter()
                .flat_map(|category| self.registry.list(category))
                .collect()
        };
        for task in &live {
            // Stop on a live task only fails if it vanished from the registry.
            if let Err(err) = task.stop(&self.registry) {
                debug!(task = %task.id(), error = %err, "stop during shutdown");
            }
        }
        self.bus.close();
        info!(stopped = live.len(), "download manager shut down");
    }

    /// Wait for every worker spawned so far to exit.
    pub async fn join_workers(&self) {
        let handles: Vec<JoinHandle<()>> = resilient_lock(&self.workers).drain().map(|(_, h)| h).collect();
        for handle in handles {
            if let Err(err) = handle.await {
                debug!(error = %err, "download worker ended abnormally");
            }
        }
    }

    fn lookup(&self, id: &TaskId) -> Result<Arc<DownloadTask>, DownloadError> {
        self.registry.get(id).ok_or_else(|| DownloadError::NotFound(id.clone()))
    }

    fn poll_context(&self) -> PollContext {
        PollContext {
            bus: self.bus.clone(),
            registry: Arc::clone(&self.registry),
            tick_interval: self.config.tick_interval(),
            max_consecutive_failures: self.config.max_consecutive_failures,
        }
    }
}

impl Drop for DownloadManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}
