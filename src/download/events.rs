// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Snapshot delivery from download workers to a single consumer.
//!
//! Workers call [`EventBus::publish`] from their own contexts; exactly one
//! [`Subscription`] drains the queue on the consumer side. Publishing never
//! blocks on the consumer and never touches consumer-owned state.
//!
//! # Backpressure
//!
//! The bus keeps at most `coalesce_depth` undelivered snapshots per download.
//! When a worker publishes past that limit, the oldest undelivered snapshot of
//! that same download is discarded, so a slow consumer always sees the freshest
//! state instead of a growing backlog. Per-download order is preserved; the
//! discards are counted in [`BusStats::coalesced`]. A terminal snapshot is the
//! last one a download publishes, so it is never the one discarded.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use futures_util::stream::{self, Stream};
use serde::Serialize;
use tokio::sync::Notify;
use tracing::trace;

use super::types::{Snapshot, TaskId};
use crate::error::DownloadError;
use crate::locks::resilient_lock;

/// Counters describing the bus since it was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BusStats {
    /// Snapshots accepted from workers
    pub published: u64,
    /// Snapshots handed to the consumer
    pub delivered: u64,
    /// Snapshots discarded by freshest-wins coalescing
    pub coalesced: u64,
    /// Snapshots currently waiting for the consumer
    pub pending: usize,
}

#[derive(Debug, Default)]
struct BusState {
    queue: VecDeque<Snapshot>,
    pending_per_task: HashMap<TaskId, usize>,
    stats: BusStats,
    subscribed: bool,
    closed: bool,
}

impl BusState {
    fn pop(&mut self) -> Option<Snapshot> {
        let snapshot = self.queue.pop_front()?;
        if let Some(count) = self.pending_per_task.get_mut(snapshot.task_id()) {
            *count -= 1;
            if *count == 0 {
                self.pending_per_task.remove(snapshot.task_id());
            }
        }
        self.stats.delivered += 1;
        Some(snapshot)
    }
}

#[derive(Debug)]
struct BusShared {
    state: Mutex<BusState>,
    notify: Notify,
    coalesce_depth: usize,
}

/// Thread-safe snapshot channel with freshest-wins coalescing.
#[derive(Debug, Clone)]
pub struct EventBus {
    shared: Arc<BusShared>,
}

impl EventBus {
    /// Create a bus retaining at most `coalesce_depth` undelivered snapshots per download.
    pub fn new(coalesce_depth: usize) -> Self {
        Self {
            shared: Arc::new(BusShared {
                state: Mutex::new(BusState::default()),
                notify: Notify::new(),
                coalesce_depth: coalesce_depth.max(1),
            }),
        }
    }

    /// Enqueue a snapshot. Returns `false` once the bus is closed.
    pub fn publish(&self, snapshot: Snapshot) -> bool {
        {
            let mut state = resilient_lock(&self.shared.state);
            if state.closed {
                return false;
            }

            let task_id = snapshot.task_id().clone();
            let pending = state.pending_per_task.get(&task_id).copied().unwrap_or(0);
            if pending >= self.shared.coalesce_depth {
                if let Some(pos) = state.queue.iter().position(|s| s.task_id() == &task_id) {
                    state.queue.remove(pos);
                    state.stats.coalesced += 1;
                    trace!(task = %task_id, "coalesced stale snapshot");
                }
            } else {
                *state.pending_per_task.entry(task_id).or_insert(0) += 1;
            }

            state.queue.push_back(snapshot);
            state.stats.published += 1;
        }
        self.shared.notify.notify_one();
        true
    }

    /// Claim the consumer side of the bus.
    ///
    /// Only one subscription may exist at a time; dropping it frees the slot.
    pub fn subscribe(&self) -> Result<Subscription, DownloadError> {
        let mut state = resilient_lock(&self.shared.state);
        if state.subscribed {
            return Err(DownloadError::AlreadySubscribed);
        }
        state.subscribed = true;
        Ok(Subscription { bus: self.clone() })
    }

    /// Stop accepting snapshots. Already queued snapshots can still be drained.
    pub fn close(&self) {
        resilient_lock(&self.shared.state).closed = true;
        self.shared.notify.notify_one();
    }

    /// True once the bus has been closed.
    pub fn is_closed(&self) -> bool {
        resilient_lock(&self.shared.state).closed
    }

    /// Delivery counters so far.
    pub fn stats(&self) -> BusStats {
        let state = resilient_lock(&self.shared.state);
        BusStats {
            pending: state.queue.len(),
            ..state.stats
        }
    }
}

/// The consumer side of an [`EventBus`].
#[derive(Debug)]
pub struct Subscription {
    bus: EventBus,
}

impl Subscription {
    /// Take the next snapshot without waiting.
    pub fn try_recv(&self) -> Option<Snapshot> {
        resilient_lock(&self.bus.shared.state).pop()
    }

    /// Take every snapshot currently queued, in delivery order.
    pub fn drain(&self) -> Vec<Snapshot> {
        let mut state = resilient_lock(&self.bus.shared.state);
        let mut out = Vec::with_capacity(state.queue.len());
        while let Some(snapshot) = state.pop() {
            out.push(snapshot);
        }
        out
    }

    /// Wait for the next snapshot. Returns `None` once the bus is closed and empty.
    pub async fn recv(&self) -> Option<Snapshot> {
        loop {
            {
                let mut state = resilient_lock(&self.bus.shared.state);
                if let Some(snapshot) = state.pop() {
                    return Some(snapshot);
                }
                if state.closed {
                    return None;
                }
            }
            // A publish between the check above and this await leaves a stored
            // permit, so the wakeup is not lost.
            self.bus.shared.notify.notified().await;
        }
    }

    /// Turn the subscription into a stream of snapshots.
    pub fn into_stream(self) -> impl Stream<Item = Snapshot> + Send + 'static {
        stream::unfold(self, |sub| async move {
            let next = sub.recv().await?;
            Some((next, sub))
        })
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        resilient_lock(&self.bus.shared.state).subscribed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::EngineStatus;
    use futures_util::StreamExt;
    use std::time::Duration;

    fn snap(task: &str, done: u64) -> Snapshot {
        Snapshot::from_status(
            TaskId::from(task),
            &EngineStatus {
                download_rate: 1000,
                total_done: done,
                total_wanted: 1000,
                progress: done as f64 / 1000.0,
                is_seed: false,
            },
        )
    }

    fn done_values(snaps: &[Snapshot]) -> Vec<u8> {
        snaps.iter().map(|s| s.progress_percent()).collect()
    }

    #[test]
    fn test_single_subscriber() {
        let bus = EventBus::new(1);
        let sub = bus.subscribe().expect("first subscribe");
        assert!(matches!(bus.subscribe(), Err(DownloadError::AlreadySubscribed)));
        drop(sub);
        assert!(bus.subscribe().is_ok());
    }

    #[test]
    fn test_freshest_wins_per_task() {
        let bus = EventBus::new(1);
        let sub = bus.subscribe().expect("subscribe");

        bus.publish(snap("a", 100));
        bus.publish(snap("b", 100));
        bus.publish(snap("a", 200));
        bus.publish(snap("a", 300));

        let drained = sub.drain();
        let ids: Vec<&str> = drained.iter().map(|s| s.task_id().as_str()).collect();
        assert_eq!(ids, vec!["b", "a"]);
        assert_eq!(drained[1].progress_percent(), 30);

        let stats = bus.stats();
        assert_eq!(stats.published, 4);
        assert_eq!(stats.coalesced, 2);
        assert_eq!(stats.delivered, 2);
        assert_eq!(stats.pending, 0);
    }

    #[test]
    fn test_deeper_queue_keeps_fifo_order() {
        let bus = EventBus::new(3);
        let sub = bus.subscribe().expect("subscribe");
        for done in [100, 200, 300, 400, 500] {
            bus.publish(snap("a", done));
        }
        assert_eq!(done_values(&sub.drain()), vec![30, 40, 50]);
    }

    #[test]
    fn test_publishing_without_subscriber_is_bounded() {
        let bus = EventBus::new(1);
        for done in 0..100 {
            bus.publish(snap("a", done));
            bus.publish(snap("b", done));
        }
        assert_eq!(bus.stats().pending, 2);
    }

    #[test]
    fn test_closed_bus_rejects_publish_but_drains() {
        let bus = EventBus::new(2);
        let sub = bus.subscribe().expect("subscribe");
        assert!(bus.publish(snap("a", 100)));
        bus.close();
        assert!(!bus.publish(snap("a", 200)));
        assert_eq!(done_values(&sub.drain()), vec![10]);
        assert!(sub.try_recv().is_none());
    }

    #[tokio::test]
    async fn test_recv_wakes_on_publish_from_other_thread() {
        let bus = EventBus::new(1);
        let sub = bus.subscribe().expect("subscribe");

        let producer = bus.clone();
        let handle = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            producer.publish(snap("a", 500));
        });

        let received = tokio::time::timeout(Duration::from_secs(2), sub.recv())
            .await
            .expect("recv timed out")
            .expect("bus closed");
        assert_eq!(received.progress_percent(), 50);
        handle.join().expect("producer panicked");
    }

    #[tokio::test]
    async fn test_stream_ends_after_close() {
        let bus = EventBus::new(4);
        let sub = bus.subscribe().expect("subscribe");
        bus.publish(snap("a", 100));
        bus.publish(snap("a", 200));
        bus.close();

        let collected: Vec<Snapshot> = sub.into_stream().collect().await;
        assert_eq!(done_values(&collected), vec![10, 20]);
    }
}
