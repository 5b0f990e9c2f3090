// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Contract between neighbouring links.
//!
//! A consumer never reaches into its producer's queues. It asks the producer
//! for full buffers through [`LinkOutput::get_full_buffers`] when told
//! `NEW_DATA`, and gives them back through
//! [`LinkOutput::put_empty_buffers`] once done. The producer decides what
//! "giving back" means: a plain link puts the buffer on its empty queue, a
//! DupLink counts the release, an IPC link sends it back across the core
//! boundary.

use crate::{
    buffer::Buffer,
    bufque::BufQue,
    cmd,
    mbx::Mailbox,
    msg::Msg,
    que::Rejected,
    runtime::Registry,
    status::{Status, Timeout},
    task::{Task, TaskCtx},
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};
use tracing::{info, trace, warn};

/// Time a wakeup waits for a free message before it is counted as lost.
pub const NOTIFY_WAIT: Duration = Duration::from_millis(10);

/// Buffer exchange a link offers to the links downstream of it.
pub trait LinkOutput: Send + Sync {
    /// Takes up to `max` full buffers from output queue `que_id`.
    fn get_full_buffers(&self, que_id: usize, max: usize) -> Vec<Buffer>;

    /// Returns buffers previously taken from output queue `que_id`.
    fn put_empty_buffers(
        &self,
        que_id: usize,
        bufs: Vec<Buffer>,
    ) -> Result<(), Rejected<Vec<Buffer>>>;
}

impl LinkOutput for BufQue {
    fn get_full_buffers(&self, _que_id: usize, max: usize) -> Vec<Buffer> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.get_full(Timeout::NoWait) {
                Ok(b) => out.push(b),
                Err(_) => break,
            }
        }
        out
    }

    fn put_empty_buffers(
        &self,
        _que_id: usize,
        bufs: Vec<Buffer>,
    ) -> Result<(), Rejected<Vec<Buffer>>> {
        self.put_empty_list(bufs)
    }
}

/// A link object driven by a task: the task hands every message to
/// [`LinkObj::handle`].
pub trait LinkObj: Send + Sync + 'static {
    fn handle(&self, ctx: &TaskCtx, msg: &mut Msg) -> Result<(), Status>;
}

/// Per-link counters. Updated lock-free from any thread.
#[derive(Debug, Default)]
pub struct LinkStats {
    new_data: AtomicU64,
    recv: AtomicU64,
    forwarded: AtomicU64,
    released: AtomicU64,
    dropped: AtomicU64,
    notify_lost: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub new_data: u64,
    pub recv: u64,
    pub forwarded: u64,
    pub released: u64,
    pub dropped: u64,
    pub notify_lost: u64,
}

impl LinkStats {
    pub fn new_data(&self) {
        self.new_data.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_recv(&self, n: u64) {
        self.recv.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_forwarded(&self, n: u64) {
        self.forwarded.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_released(&self, n: u64) {
        self.released.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_dropped(&self, n: u64) {
        self.dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn add_notify_lost(&self, n: u64) {
        self.notify_lost.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            new_data: self.new_data.load(Ordering::Relaxed),
            recv: self.recv.load(Ordering::Relaxed),
            forwarded: self.forwarded.load(Ordering::Relaxed),
            released: self.released.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            notify_lost: self.notify_lost.load(Ordering::Relaxed),
        }
    }

    pub fn reset(&self) {
        for c in [
            &self.new_data,
            &self.recv,
            &self.forwarded,
            &self.released,
            &self.dropped,
            &self.notify_lost,
        ] {
            c.store(0, Ordering::Relaxed);
        }
    }

    pub fn print(&self, name: &str) {
        let s = self.snapshot();
        info!(
            "[{}] new_data: {} recv: {} forwarded: {} released: {} dropped: {} notify_lost: {}",
            name, s.new_data, s.recv, s.forwarded, s.released, s.dropped, s.notify_lost
        );
    }
}

/// Mailbox of the link consuming an output, told `NEW_DATA` when buffers
/// are published.
///
/// A wakeup that cannot be queued is counted and remembered; the owner
/// calls [`NextLink::retry`] whenever it runs until one gets through.
#[derive(Default)]
pub struct NextLink {
    mbx: Mutex<Option<Arc<Mailbox>>>,
    pending: AtomicBool,
}

impl NextLink {
    pub fn set(&self, mbx: Arc<Mailbox>) {
        *self.mbx.lock().unwrap_or_else(PoisonError::into_inner) = Some(mbx);
    }

    pub fn clear(&self) {
        *self.mbx.lock().unwrap_or_else(PoisonError::into_inner) = None;
        self.pending.store(false, Ordering::Release);
    }

    /// True while a failed wakeup has not been delivered.
    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }

    /// Sends `NEW_DATA`, waiting up to [`NOTIFY_WAIT`] for a free message.
    /// Returns false, and counts the loss in `stats`, if it was not queued.
    pub fn notify(&self, stats: &LinkStats) -> bool {
        let mbx = self.mbx.lock().unwrap_or_else(PoisonError::into_inner).clone();
        let Some(mbx) = mbx else {
            return true;
        };
        match mbx.post(cmd::NEW_DATA, Timeout::After(NOTIFY_WAIT)) {
            Ok(()) => {
                self.pending.store(false, Ordering::Release);
                true
            }
            Err(Status::Fail) => {
                // consumer is gone
                trace!("NEW_DATA to closed {}", mbx.name());
                stats.add_notify_lost(1);
                self.pending.store(false, Ordering::Release);
                false
            }
            Err(e) => {
                stats.add_notify_lost(1);
                if !self.pending.swap(true, Ordering::AcqRel) {
                    warn!("NEW_DATA to {} lost: {}", mbx.name(), e);
                }
                false
            }
        }
    }

    /// Re-sends a wakeup that failed earlier, if any.
    pub fn retry(&self, stats: &LinkStats) -> bool {
        !self.is_pending() || self.notify(stats)
    }
}

/// A running link: its object, its task and its registry entry.
///
/// Dropping the link stops the task and removes the registry entry.
pub struct Link<T: LinkObj> {
    id: u32,
    obj: Arc<T>,
    mbx: Arc<Mailbox>,
    task: Option<Task>,
    registry: Arc<Registry>,
}

impl<T: LinkObj> Link<T> {
    pub(crate) fn new(id: u32, obj: Arc<T>, task: Task, registry: Arc<Registry>) -> Self {
        Self {
            id,
            obj,
            mbx: task.mbx().clone(),
            task: Some(task),
            registry,
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn obj(&self) -> &Arc<T> {
        &self.obj
    }

    pub fn mbx(&self) -> Arc<Mailbox> {
        self.mbx.clone()
    }

    pub fn task(&self) -> Option<&Task> {
        self.task.as_ref()
    }

    pub fn destroy(self) {
        drop(self);
    }
}

impl<T: LinkObj + LinkOutput> Link<T> {
    /// The link as the upstream of another link.
    pub fn output(&self) -> Arc<dyn LinkOutput> {
        self.obj.clone()
    }
}

impl<T: LinkObj> Drop for Link<T> {
    fn drop(&mut self) {
        self.registry.remove(self.id);
        if let Some(task) = self.task.take() {
            task.destroy();
        }
    }
}
