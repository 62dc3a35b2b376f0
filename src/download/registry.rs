// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Category registry: which downloads are Downloading, Queued, or Stopped.
//!
//! Each category is an insertion-ordered sequence; a move removes the task
//! from its current sequence and appends it to the target one under a single
//! write lock, so readers never see a task in two categories or in none.
//! The registry never calls into tasks or the engine.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use indexmap::IndexMap;
use tracing::debug;

use super::task::DownloadTask;
use super::types::{Category, CategoryCounts, TaskId};
use crate::error::DownloadError;
use crate::locks::{resilient_read, resilient_write};

#[derive(Debug, Default)]
struct RegistryInner {
    categories: [IndexMap<TaskId, Arc<DownloadTask>>; 3],
    index: HashMap<TaskId, Category>,
}

/// Thread-safe mapping from category to its ordered downloads.
#[derive(Debug, Default)]
pub struct Registry {
    inner: RwLock<RegistryInner>,
}

/// Consistent view of all three categories, captured under one lock.
#[derive(Debug, Clone, Default)]
pub struct RegistryLayout {
    pub downloading: Vec<TaskId>,
    pub queued: Vec<TaskId>,
    pub stopped: Vec<TaskId>,
}

impl RegistryLayout {
    /// Ids in `category`, in order.
    pub fn category(&self, category: Category) -> &[TaskId] {
        match category {
            Category::Downloading => &self.downloading,
            Category::Queued => &self.queued,
            Category::Stopped => &self.stopped,
        }
    }

    /// Every id in category order: Downloading, then Queued, then Stopped.
    pub fn all(&self) -> impl Iterator<Item = &TaskId> {
        self.downloading.iter().chain(&self.queued).chain(&self.stopped)
    }
}

impl Registry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a newly added task to Downloading.
    pub fn insert(&self, task: Arc<DownloadTask>) -> Result<(), DownloadError> {
        let mut inner = resilient_write(&self.inner);
        let id = task.id().clone();
        if inner.index.contains_key(&id) {
            return Err(DownloadError::DuplicateTask(id));
        }
        inner.index.insert(id.clone(), Category::Downloading);
        inner.categories[Category::Downloading.index()].insert(id, task);
        Ok(())
    }

    /// Move a task to `target`, appending it at the end of that sequence.
    ///
    /// Returns the category it was in. Moving to the current category leaves
    /// the order untouched.
    pub fn move_to(&self, id: &TaskId, target: Category) -> Result<Category, DownloadError> {
        let mut inner = resilient_write(&self.inner);
        let current = *inner
            .index
            .get(id)
            .ok_or_else(|| DownloadError::NotFound(id.clone()))?;

        if current == target {
            return Ok(current);
        }
        if !current.can_move_to(target) {
            return Err(DownloadError::InvalidTransition {
                id: id.clone(),
                from: current,
                to: target,
            });
        }

        let Some(task) = inner.categories[current.index()].shift_remove(id) else {
            return Err(DownloadError::NotFound(id.clone()));
        };
        inner.categories[target.index()].insert(id.clone(), task);
        inner.index.insert(id.clone(), target);
        debug!(task = %id, from = %current, to = %target, "category moved");
        Ok(current)
    }

    /// The task with `id`, whatever its category.
    pub fn get(&self, id: &TaskId) -> Option<Arc<DownloadTask>> {
        let inner = resilient_read(&self.inner);
        let category = inner.index.get(id)?;
        inner.categories[category.index()].get(id).cloned()
    }

    /// Category `id` is currently in.
    pub fn category_of(&self, id: &TaskId) -> Option<Category> {
        resilient_read(&self.inner).index.get(id).copied()
    }

    /// Tasks in `category`, in insertion order.
    pub fn list(&self, category: Category) -> Vec<Arc<DownloadTask>> {
        resilient_read(&self.inner).categories[category.index()]
            .values()
            .cloned()
            .collect()
    }

    /// All three sequences, read under one lock.
    pub fn layout(&self) -> RegistryLayout {
        let inner = resilient_read(&self.inner);
        let ids = |category: Category| -> Vec<TaskId> {
            inner.categories[category.index()].keys().cloned().collect()
        };
        RegistryLayout {
            downloading: ids(Category::Downloading),
            queued: ids(Category::Queued),
            stopped: ids(Category::Stopped),
        }
    }

    /// Size of each category, read under one lock.
    pub fn counts(&self) -> CategoryCounts {
        let inner = resilient_read(&self.inner);
        CategoryCounts {
            downloading: inner.categories[Category::Downloading.index()].len(),
            queued: inner.categories[Category::Queued.index()].len(),
            stopped: inner.categories[Category::Stopped.index()].len(),
        }
    }

    /// Total number of registered tasks.
    pub fn len(&self) -> usize {
        resilient_read(&self.inner).index.len()
    }

    /// True when no task is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
