// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Reference-counted fan-out.
//!
//! A [`DupLink`] takes each full buffer from its upstream and queues a
//! duplicate handle on every active output. The original stays tracked
//! here, together with the set of outputs it is still pending on, until the
//! last of those outputs releases its duplicate; only then does the
//! original go back upstream, exactly once. Outputs whose queue is full are
//! skipped for that buffer and the drop is counted against the output.

use crate::{
    buffer::{Buffer, BufferId},
    cmd::{self, Control},
    config::RuntimeConfig,
    link::{LinkObj, LinkOutput, LinkStats, NextLink},
    mbx::Mailbox,
    msg::Msg,
    que::{Que, QueFlags, Rejected},
    status::{Status, Timeout},
    task::TaskCtx,
};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};
use tracing::{debug, error, info, warn};

/// [`Control`] id enabling or disabling an output; payload `(usize, bool)`.
pub const CTRL_SET_OUTPUT_ACTIVE: u32 = cmd::LINK_PRIVATE_BASE;

struct Tracked {
    buf: Buffer,
    pending: Vec<bool>,
}

struct DupState {
    active: Vec<bool>,
    tracked: HashMap<BufferId, Tracked>,
}

pub struct DupLink {
    name: String,
    upstream: Arc<dyn LinkOutput>,
    up_que: usize,
    outputs: Vec<Que<Buffer>>,
    next: Vec<NextLink>,
    state: Mutex<DupState>,
    max_tracked: usize,
    max_list: usize,
    stats: LinkStats,
    out_stats: Vec<LinkStats>,
}

impl DupLink {
    /// Creates a fan-out to `num_outputs` outputs, all active.
    ///
    /// # Errors
    ///
    /// [`Status::InvalidArgument`] if `num_outputs` is zero or above
    /// `cfg.max_out_que`.
    pub fn new(
        name: &str,
        upstream: Arc<dyn LinkOutput>,
        up_que: usize,
        num_outputs: usize,
        cfg: &RuntimeConfig,
    ) -> Result<Self, Status> {
        if num_outputs == 0 || num_outputs > cfg.max_out_que {
            warn!(
                "{}: {} outputs requested, 1..={} supported",
                name, num_outputs, cfg.max_out_que
            );
            return Err(Status::InvalidArgument);
        }
        debug!("{}: {} outputs", name, num_outputs);
        Ok(Self {
            name: name.to_owned(),
            upstream,
            up_que,
            outputs: (0..num_outputs)
                .map(|_| Que::new(cfg.buf_que_len, QueFlags::NO_BLOCK))
                .collect(),
            next: (0..num_outputs).map(|_| NextLink::default()).collect(),
            state: Mutex::new(DupState {
                active: vec![true; num_outputs],
                tracked: HashMap::new(),
            }),
            max_tracked: cfg.dup_max_tracked,
            max_list: cfg.max_buffers_in_list,
            stats: LinkStats::default(),
            out_stats: (0..num_outputs).map(|_| LinkStats::default()).collect(),
        })
    }

    pub fn num_outputs(&self) -> usize {
        self.outputs.len()
    }

    /// Mailbox told `NEW_DATA` when output `out` receives buffers.
    pub fn set_next(&self, out: usize, mbx: Arc<Mailbox>) -> Result<(), Status> {
        self.next.get(out).ok_or(Status::InvalidArgument)?.set(mbx);
        Ok(())
    }

    /// Includes or excludes an output from later fan-outs. Buffers already
    /// sent to it still need its release.
    pub fn set_output_active(&self, out: usize, active: bool) -> Result<(), Status> {
        let mut st = self.lock();
        let slot = st.active.get_mut(out).ok_or(Status::InvalidArgument)?;
        *slot = active;
        debug!("{}: output {} active={}", self.name, out, active);
        Ok(())
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn output_stats(&self, out: usize) -> Option<&LinkStats> {
        self.out_stats.get(out)
    }

    /// Originals waiting for at least one release.
    pub fn tracked(&self) -> usize {
        self.lock().tracked.len()
    }

    fn lock(&self) -> MutexGuard<'_, DupState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fans out every full buffer the upstream has.
    pub fn process_new_data(&self) -> usize {
        let bufs = self.upstream.get_full_buffers(self.up_que, self.max_list);
        if bufs.is_empty() {
            return 0;
        }
        let n = bufs.len();
        self.stats.add_recv(n as u64);

        let mut back = Vec::new();
        let mut notify = vec![false; self.outputs.len()];
        {
            let mut st = self.lock();
            for mut buf in bufs {
                if st.tracked.len() >= self.max_tracked {
                    warn!("{}: tracking table full, dropping {}", self.name, buf.id());
                    self.stats.add_dropped(1);
                    back.push(buf);
                    continue;
                }
                let mut pending = vec![false; self.outputs.len()];
                for (i, out) in self.outputs.iter().enumerate() {
                    if !st.active[i] {
                        continue;
                    }
                    match out.put(buf.duplicate(), Timeout::NoWait) {
                        Ok(()) => {
                            pending[i] = true;
                            notify[i] = true;
                            self.out_stats[i].add_forwarded(1);
                        }
                        Err(r) => {
                            debug!("{}: output {} refused {}: {}", self.name, i, buf.id(), r.status);
                            self.out_stats[i].add_dropped(1);
                        }
                    }
                }
                let count = pending.iter().filter(|&&p| p).count() as u32;
                if count == 0 {
                    self.stats.add_dropped(1);
                    back.push(buf);
                    continue;
                }
                buf.set_dup_ref_count(count);
                self.stats.add_forwarded(1);
                let id = buf.id();
                let prev = st.tracked.insert(id, Tracked { buf, pending });
                assert!(prev.is_none(), "{}: {} received while still tracked", self.name, id);
            }
        }

        for (i, next) in self.next.iter().enumerate() {
            if notify[i] {
                next.notify(&self.out_stats[i]);
            }
        }
        if !back.is_empty() {
            self.return_upstream(back);
        }
        n
    }

    /// Counts releases from output `out`; originals whose last release
    /// this is go back upstream.
    ///
    /// # Panics
    ///
    /// Panics on a buffer this link is not tracking, or one that output
    /// `out` was never sent or has already released.
    pub fn release(&self, out: usize, bufs: Vec<Buffer>) {
        let mut done = Vec::new();
        {
            let mut st = self.lock();
            for dup in bufs {
                let id = dup.original().unwrap_or(dup.id());
                let Some(t) = st.tracked.get_mut(&id) else {
                    panic!("{}: release of untracked {}", self.name, id);
                };
                assert!(
                    t.pending.get(out).copied().unwrap_or(false),
                    "{}: output {} does not hold {}",
                    self.name,
                    out,
                    id
                );
                t.pending[out] = false;
                self.out_stats[out].add_released(1);
                let left = t.buf.dup_ref_count() - 1;
                t.buf.set_dup_ref_count(left);
                if left == 0 {
                    if let Some(t) = st.tracked.remove(&id) {
                        done.push(t.buf);
                    }
                }
            }
        }
        if !done.is_empty() {
            self.stats.add_released(done.len() as u64);
            self.return_upstream(done);
        }
        self.retry_notify();
    }

    /// Re-sends wakeups that failed earlier.
    fn retry_notify(&self) {
        for (next, stats) in self.next.iter().zip(&self.out_stats) {
            next.retry(stats);
        }
    }

    fn return_upstream(&self, bufs: Vec<Buffer>) {
        if let Err(r) = self.upstream.put_empty_buffers(self.up_que, bufs) {
            error!(
                "{}: upstream refused {} buffer(s): {}",
                self.name,
                r.item.len(),
                r.status
            );
        }
    }

    pub fn print_statistics(&self) {
        self.stats.print(&self.name);
        for (i, s) in self.out_stats.iter().enumerate() {
            s.print(&format!("{}.out{}", self.name, i));
        }
        info!("[{}] tracked: {}", self.name, self.tracked());
    }

    fn control(&self, ctl: &Control) -> Result<(), Status> {
        match ctl.id {
            CTRL_SET_OUTPUT_ACTIVE => {
                let &(out, active) = ctl
                    .payload
                    .as_ref()
                    .and_then(|p| p.downcast_ref::<(usize, bool)>())
                    .ok_or(Status::InvalidArgument)?;
                self.set_output_active(out, active)
            }
            _ => Err(Status::InvalidArgument),
        }
    }
}

impl LinkOutput for DupLink {
    fn get_full_buffers(&self, que_id: usize, max: usize) -> Vec<Buffer> {
        let Some(que) = self.outputs.get(que_id) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        while out.len() < max {
            match que.get(Timeout::NoWait) {
                Ok(b) => out.push(b),
                Err(_) => break,
            }
        }
        out
    }

    fn put_empty_buffers(
        &self,
        que_id: usize,
        bufs: Vec<Buffer>,
    ) -> Result<(), Rejected<Vec<Buffer>>> {
        if que_id >= self.outputs.len() {
            return Err(Rejected {
                item: bufs,
                status: Status::InvalidArgument,
            });
        }
        self.release(que_id, bufs);
        Ok(())
    }
}

impl LinkObj for DupLink {
    fn handle(&self, _ctx: &TaskCtx, msg: &mut Msg) -> Result<(), Status> {
        self.retry_notify();
        match msg.cmd() {
            cmd::NEW_DATA => {
                self.stats.new_data();
                self.process_new_data();
            }
            cmd::CONTROL => {
                let ctl = msg.prm::<Control>().ok_or(Status::InvalidArgument)?;
                return self.control(ctl);
            }
            cmd::PRINT_STATISTICS => self.print_statistics(),
            cmd::PRINT_BUFFER_STATISTICS => {
                for (i, q) in self.outputs.iter().enumerate() {
                    info!("[{}] out{}: {}", self.name, i, q.status());
                }
            }
            cmd::CREATE | cmd::START | cmd::STOP | cmd::DELETE => {}
            other => {
                warn!("{}: unexpected {}", self.name, cmd::name(other));
                return Err(Status::InvalidArgument);
            }
        }
        Ok(())
    }
}
