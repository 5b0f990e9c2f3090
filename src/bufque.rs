// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Empty/full buffer exchange between a producer and its consumer.
//!
//! A producer takes an empty buffer with [`BufQue::get_empty`], fills it and
//! publishes it with [`BufQue::put_full`]. The consumer takes it with
//! [`BufQue::get_full`] and eventually returns it with
//! [`BufQue::put_empty`]. A link may own several empty queues, one per
//! allocation pool, all feeding the same full queue; returned buffers are
//! routed back to their own pool by `pool_id` so differently sized buffers
//! never mix.

use crate::{
    buffer::Buffer,
    config::RuntimeConfig,
    que::{Que, QueFlags, QueStatus, Rejected},
    status::{Status, Timeout},
};
use tracing::{error, info};

pub struct BufQue {
    empty: Vec<Que<Buffer>>,
    full: Que<Buffer>,
    max_list: usize,
}

impl BufQue {
    /// Creates the exchange with `num_pools` empty queues of `capacity`
    /// slots each.
    ///
    /// # Panics
    ///
    /// Panics if `num_pools` or `capacity` is zero.
    pub fn new(
        num_pools: usize,
        capacity: usize,
        block_get: bool,
        block_put: bool,
        max_list: usize,
    ) -> Self {
        assert!(num_pools > 0, "at least one allocation pool is required");
        let flags = QueFlags {
            block_get,
            block_put,
        };
        Self {
            empty: (0..num_pools).map(|_| Que::new(capacity, flags)).collect(),
            full: Que::new(capacity, flags),
            max_list: max_list.max(1),
        }
    }

    pub fn from_config(
        cfg: &RuntimeConfig,
        num_pools: usize,
        block_get: bool,
        block_put: bool,
    ) -> Self {
        Self::new(
            num_pools,
            cfg.buf_que_len,
            block_get,
            block_put,
            cfg.max_buffers_in_list,
        )
    }

    pub fn num_pools(&self) -> usize {
        self.empty.len()
    }

    fn pool(&self, pool_id: u16) -> Result<&Que<Buffer>, Status> {
        self.empty
            .get(usize::from(pool_id))
            .ok_or(Status::InvalidArgument)
    }

    fn put_timeout(que: &Que<Buffer>) -> Timeout {
        if que.flags().block_put {
            Timeout::Forever
        } else {
            Timeout::NoWait
        }
    }

    /// Takes one empty buffer from `pool_id`.
    pub fn get_empty(&self, pool_id: u16, timeout: Timeout) -> Result<Buffer, Status> {
        let mut buf = self.pool(pool_id)?.get(timeout)?;
        buf.pool_id = pool_id;
        Ok(buf)
    }

    /// Takes up to `max` empty buffers from `pool_id`, stopping at the first
    /// failure. With [`Timeout::NoWait`] the batch limit is used instead of
    /// `max`.
    pub fn get_empty_list(&self, pool_id: u16, max: usize, timeout: Timeout) -> Vec<Buffer> {
        let Ok(que) = self.pool(pool_id) else {
            return Vec::new();
        };
        let mut out = take_list(que, self.list_len(max, timeout), timeout);
        for b in out.iter_mut() {
            b.pool_id = pool_id;
        }
        out
    }

    /// Returns an empty buffer to the pool it was allocated from.
    pub fn put_empty(&self, buf: Buffer) -> Result<(), Rejected<Buffer>> {
        let que = match self.pool(buf.pool_id) {
            Ok(q) => q,
            Err(status) => return Err(Rejected { item: buf, status }),
        };
        que.put(buf, Self::put_timeout(que))
    }

    /// Returns a batch of empty buffers. On failure the refused buffer and
    /// every buffer after it are handed back.
    pub fn put_empty_list(&self, bufs: Vec<Buffer>) -> Result<(), Rejected<Vec<Buffer>>> {
        let mut iter = bufs.into_iter();
        while let Some(buf) = iter.next() {
            if let Err(r) = self.put_empty(buf) {
                let mut rest = vec![r.item];
                rest.extend(iter);
                return Err(Rejected {
                    item: rest,
                    status: r.status,
                });
            }
        }
        Ok(())
    }

    /// Takes one full buffer.
    pub fn get_full(&self, timeout: Timeout) -> Result<Buffer, Status> {
        self.full.get(timeout)
    }

    /// Takes up to `max` full buffers, see [`BufQue::get_empty_list`].
    pub fn get_full_list(&self, max: usize, timeout: Timeout) -> Vec<Buffer> {
        take_list(&self.full, self.list_len(max, timeout), timeout)
    }

    /// Publishes a filled buffer to the consumer.
    pub fn put_full(&self, buf: Buffer) -> Result<(), Rejected<Buffer>> {
        let res = self.full.put(buf, Self::put_timeout(&self.full));
        if let Err(ref r) = res {
            error!("put_full rejected {}: {}", r.item, r.status);
        }
        res
    }

    pub fn put_full_list(&self, bufs: Vec<Buffer>) -> Result<(), Rejected<Vec<Buffer>>> {
        let mut iter = bufs.into_iter();
        while let Some(buf) = iter.next() {
            if let Err(r) = self.put_full(buf) {
                let mut rest = vec![r.item];
                rest.extend(iter);
                return Err(Rejected {
                    item: rest,
                    status: r.status,
                });
            }
        }
        Ok(())
    }

    /// Inspects the oldest full buffer without taking it.
    pub fn peek_full<R>(&self, f: impl FnOnce(&Buffer) -> R) -> Option<R> {
        self.full.peek(f)
    }

    pub fn peek_empty<R>(&self, pool_id: u16, f: impl FnOnce(&Buffer) -> R) -> Option<R> {
        self.pool(pool_id).ok()?.peek(f)
    }

    pub fn empty_count(&self, pool_id: u16) -> usize {
        self.pool(pool_id).map(|q| q.len()).unwrap_or(0)
    }

    pub fn full_count(&self) -> usize {
        self.full.len()
    }

    pub fn full_status(&self) -> QueStatus {
        self.full.status()
    }

    pub fn empty_status(&self, pool_id: u16) -> Option<QueStatus> {
        self.pool(pool_id).ok().map(|q| q.status())
    }

    /// Wakes every caller blocked on any of the queues.
    pub fn unblock(&self) {
        self.full.unblock();
        for q in &self.empty {
            q.unblock();
        }
    }

    /// Takes every buffer out of every queue, full queue first.
    pub fn drain(&self) -> Vec<Buffer> {
        let mut out = self.full.drain();
        for q in &self.empty {
            out.extend(q.drain());
        }
        out
    }

    pub fn print_status(&self, name: &str) {
        info!("[{}] buffer queue status", name);
        for (i, q) in self.empty.iter().enumerate() {
            info!("  empty[{}]: {}", i, q.status());
        }
        info!("  full    : {}", self.full.status());
    }

    fn list_len(&self, max: usize, timeout: Timeout) -> usize {
        if timeout.is_no_wait() {
            self.max_list
        } else {
            max.min(self.max_list)
        }
    }
}

fn take_list(que: &Que<Buffer>, max: usize, timeout: Timeout) -> Vec<Buffer> {
    let mut out = Vec::new();
    while out.len() < max {
        match que.get(timeout) {
            Ok(b) => out.push(b),
            Err(_) => break,
        }
    }
    out
}
