// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Buffers across cores.
//!
//! An [`IpcOut`] on the source core and an [`IpcIn`] on the destination
//! core share one ring pair. `IpcOut` takes full buffers from its upstream
//! link, parks each in a slot of its in-flight table and pushes a
//! [`BufferDescriptor`] carrying the slot index. `IpcIn` rebuilds a local
//! [`Buffer`] from the descriptor and offers it to its own downstream link.
//! When that link releases it, `IpcIn` pushes the slot back on the reverse
//! ring and `IpcOut` returns the parked buffer to its upstream.
//!
//! In-flight buffers are bounded by the ring capacity, so the reverse ring
//! can never overflow.

use super::{
    notify::Doorbell,
    ring::{RetryPolicy, RingConsumer, RingProducer},
    RingPair,
};
use crate::{
    buffer::{Buffer, BufferDescriptor, BufferId},
    cmd,
    link::{LinkObj, LinkOutput, LinkStats, NextLink},
    mbx::Mailbox,
    msg::Msg,
    que::{Que, QueFlags, Rejected},
    status::{Status, Timeout},
    task::TaskCtx,
};
use serde::{Deserialize, Serialize};
use std::{
    collections::HashMap,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{error, info, trace, warn};

/// Ring element size for buffer descriptors and releases.
pub const DESCRIPTOR_SIZE: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct Release {
    slot: u32,
    id: u32,
}

pub struct IpcOut {
    name: String,
    core_id: u16,
    upstream: Arc<dyn LinkOutput>,
    up_que: usize,
    tx: Mutex<RingProducer>,
    rel: Mutex<RingConsumer>,
    inflight: Mutex<Vec<Option<Buffer>>>,
    free_slots: Que<u32>,
    bell: Doorbell,
    peer_link: u32,
    max_list: usize,
    stats: LinkStats,
}

impl IpcOut {
    /// `bell` and `peer_link` address the [`IpcIn`] on the other core.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        name: &str,
        core_id: u16,
        upstream: Arc<dyn LinkOutput>,
        up_que: usize,
        pair: &RingPair,
        bell: Doorbell,
        peer_link: u32,
        max_list: usize,
    ) -> Result<Self, Status> {
        let slots = pair.fwd.capacity();
        let free_slots = Que::new(slots as usize, QueFlags::NO_BLOCK);
        for slot in 0..slots {
            free_slots.put(slot, Timeout::NoWait)?;
        }
        Ok(Self {
            name: name.to_owned(),
            core_id,
            upstream,
            up_que,
            tx: Mutex::new(pair.fwd.producer()?),
            rel: Mutex::new(pair.rev.consumer()?),
            inflight: Mutex::new((0..slots).map(|_| None).collect()),
            free_slots,
            bell,
            peer_link,
            max_list: max_list.max(1),
            stats: LinkStats::default(),
        })
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Buffers sent to the peer and not yet released.
    pub fn in_flight(&self) -> usize {
        self.free_slots.capacity() - self.free_slots.len()
    }

    /// Sends every full buffer the upstream has. Buffers that find no slot
    /// or no room in the ring go straight back upstream as drops.
    fn forward(&self) -> usize {
        let bufs = self.upstream.get_full_buffers(self.up_que, self.max_list);
        if bufs.is_empty() {
            return 0;
        }
        self.stats.add_recv(bufs.len() as u64);

        let mut sent = 0;
        let mut rejected = Vec::new();
        {
            let mut tx = self.tx.lock().unwrap_or_else(PoisonError::into_inner);
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            for buf in bufs {
                let Ok(slot) = self.free_slots.get(Timeout::NoWait) else {
                    rejected.push(buf);
                    continue;
                };
                let desc = buf.descriptor(slot);
                inflight[slot as usize] = Some(buf);
                match tx.push(&desc) {
                    Ok(()) => sent += 1,
                    Err(e) => {
                        trace!("{}: {} not sent: {}", self.name, BufferId(desc.id), e);
                        let _ = self.free_slots.put(slot, Timeout::NoWait);
                        if let Some(buf) = inflight[slot as usize].take() {
                            rejected.push(buf);
                        }
                    }
                }
            }
        }

        if sent > 0 {
            self.stats.add_forwarded(sent as u64);
            if let Err(e) = self.bell.ring(self.core_id, self.peer_link) {
                warn!("{}: peer not notified: {}", self.name, e);
            }
        }
        if !rejected.is_empty() {
            warn!("{}: dropped {} buffer(s)", self.name, rejected.len());
            self.stats.add_dropped(rejected.len() as u64);
            self.return_upstream(rejected);
        }
        sent
    }

    /// Returns every buffer the peer has released.
    fn reclaim(&self) -> usize {
        let mut done = Vec::new();
        {
            let mut rel = self.rel.lock().unwrap_or_else(PoisonError::into_inner);
            let mut inflight = self.inflight.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                let r = match rel.pop::<Release>() {
                    Ok(r) => r,
                    Err(Status::RingEmpty) => break,
                    Err(e) => {
                        error!("{}: bad release: {}", self.name, e);
                        break;
                    }
                };
                let Some(buf) = inflight.get_mut(r.slot as usize).and_then(Option::take) else {
                    panic!("{}: release for idle slot {}", self.name, r.slot);
                };
                assert_eq!(
                    buf.id().0,
                    r.id,
                    "{}: slot {} holds {}",
                    self.name,
                    r.slot,
                    buf.id()
                );
                let _ = self.free_slots.put(r.slot, Timeout::NoWait);
                done.push(buf);
            }
        }
        let n = done.len();
        if n > 0 {
            self.stats.add_released(n as u64);
            self.return_upstream(done);
        }
        n
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
}

impl LinkObj for IpcOut {
    fn handle(&self, _ctx: &TaskCtx, msg: &mut Msg) -> Result<(), Status> {
        match msg.cmd() {
            // either wakeup may stand in for a lost one of the other kind
            cmd::NEW_DATA => {
                self.stats.new_data();
                self.reclaim();
                self.forward();
            }
            cmd::NOTIFY => {
                self.reclaim();
                self.forward();
            }
            cmd::PRINT_STATISTICS => {
                self.stats.print(&self.name);
                info!("[{}] in flight: {}", self.name, self.in_flight());
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

pub struct IpcIn {
    name: String,
    core_id: u16,
    rx: Mutex<RingConsumer>,
    rel: Mutex<RingProducer>,
    full: Que<Buffer>,
    slots: Mutex<HashMap<BufferId, u32>>,
    bell: Doorbell,
    peer_link: u32,
    next: NextLink,
    retry: RetryPolicy,
    stats: LinkStats,
}

impl IpcIn {
    /// `bell` and `peer_link` address the [`IpcOut`] on the other core.
    pub fn new(
        name: &str,
        core_id: u16,
        pair: &RingPair,
        bell: Doorbell,
        peer_link: u32,
    ) -> Result<Self, Status> {
        Ok(Self {
            name: name.to_owned(),
            core_id,
            rx: Mutex::new(pair.fwd.consumer()?),
            rel: Mutex::new(pair.rev.producer()?),
            full: Que::new(pair.fwd.capacity() as usize, QueFlags::NO_BLOCK),
            slots: Mutex::new(HashMap::new()),
            bell,
            peer_link,
            next: NextLink::default(),
            retry: RetryPolicy::default(),
            stats: LinkStats::default(),
        })
    }

    /// Mailbox told `NEW_DATA` when buffers arrive.
    pub fn set_next(&self, mbx: Arc<Mailbox>) {
        self.next.set(mbx);
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Buffers received and not yet released.
    pub fn held(&self) -> usize {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn receive(&self) -> usize {
        let mut bounced = Vec::new();
        let mut n = 0;
        {
            let mut rx = self.rx.lock().unwrap_or_else(PoisonError::into_inner);
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            loop {
                let desc = match rx.pop::<BufferDescriptor>() {
                    Ok(d) => d,
                    Err(Status::RingEmpty) => break,
                    Err(e) => {
                        error!("{}: bad descriptor: {}", self.name, e);
                        break;
                    }
                };
                let buf = Buffer::from_descriptor(&desc);
                let prev = slots.insert(buf.id(), desc.slot);
                assert!(prev.is_none(), "{}: {} received twice", self.name, buf.id());
                if let Err(r) = self.full.put(buf, Timeout::NoWait) {
                    bounced.push(r.item);
                    continue;
                }
                n += 1;
            }
        }
        if n > 0 {
            self.stats.add_recv(n as u64);
            self.stats.add_forwarded(n as u64);
            self.next.notify(&self.stats);
        }
        if !bounced.is_empty() {
            self.stats.add_dropped(bounced.len() as u64);
            if let Err(r) = self.send_release(bounced) {
                error!("{}: cannot bounce {} buffer(s)", self.name, r.item.len());
            }
        }
        n
    }

    fn send_release(&self, bufs: Vec<Buffer>) -> Result<(), Rejected<Vec<Buffer>>> {
        let mut released = 0;
        let res = {
            let mut rel = self.rel.lock().unwrap_or_else(PoisonError::into_inner);
            let mut slots = self.slots.lock().unwrap_or_else(PoisonError::into_inner);
            let mut iter = bufs.into_iter();
            let mut res = Ok(());
            while let Some(buf) = iter.next() {
                let Some(slot) = slots.remove(&buf.id()) else {
                    panic!("{}: release of untracked {}", self.name, buf.id());
                };
                let r = Release {
                    slot,
                    id: buf.id().0,
                };
                if let Err(status) = rel.push_retry(&r, &self.retry) {
                    slots.insert(buf.id(), slot);
                    let mut rest = vec![buf];
                    rest.extend(iter);
                    res = Err(Rejected { item: rest, status });
                    break;
                }
                released += 1;
            }
            res
        };
        if released > 0 {
            self.stats.add_released(released);
            if let Err(e) = self.bell.ring(self.core_id, self.peer_link) {
                warn!("{}: peer not notified: {}", self.name, e);
            }
        }
        res
    }
}

impl LinkOutput for IpcIn {
    fn get_full_buffers(&self, _que_id: usize, max: usize) -> Vec<Buffer> {
        let mut out = Vec::new();
        while out.len() < max {
            match self.full.get(Timeout::NoWait) {
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
        self.send_release(bufs)
    }
}

impl LinkObj for IpcIn {
    fn handle(&self, _ctx: &TaskCtx, msg: &mut Msg) -> Result<(), Status> {
        self.next.retry(&self.stats);
        match msg.cmd() {
            cmd::NOTIFY => {
                self.receive();
            }
            cmd::PRINT_STATISTICS => {
                self.stats.print(&self.name);
                info!("[{}] held: {}", self.name, self.held());
            }
            cmd::PRINT_BUFFER_STATISTICS => {
                info!("[{}] full: {}", self.name, self.full.status());
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        buffer::alloc_pool,
        bufque::BufQue,
        ipc::{
            notify::doorbell,
            ring::{Coherent, IpcRing},
            shm::{RegionAllocator, SharedRegion},
        },
    };

    fn pair(max: u32) -> (RegionAllocator, RingPair) {
        let alloc = RegionAllocator::new(SharedRegion::anonymous(64 * 1024).unwrap());
        let size = IpcRing::required_size(DESCRIPTOR_SIZE, max);
        let fwd = IpcRing::create(
            alloc.reserve(size).unwrap(),
            DESCRIPTOR_SIZE,
            max,
            Arc::new(Coherent),
        )
        .unwrap();
        let rev = IpcRing::create(
            alloc.reserve(size).unwrap(),
            DESCRIPTOR_SIZE,
            max,
            Arc::new(Coherent),
        )
        .unwrap();
        (alloc, RingPair { fwd, rev })
    }

    #[test]
    fn buffers_cross_and_come_back() {
        let (_alloc, pair) = pair(4);
        let (bell_a, rx_a) = doorbell(0, 16);
        let (bell_b, rx_b) = doorbell(1, 16);
        let src = Arc::new(BufQue::new(1, 8, false, false, 8));
        for mut b in alloc_pool(100, 0, 6, 0x8000, 256) {
            b.filled = 200;
            src.put_full(b).unwrap();
        }
        let out = IpcOut::new("out", 0, src.clone(), 0, &pair, bell_b, 2, 8).unwrap();
        let inn = IpcIn::new("in", 1, &pair, bell_a, 1).unwrap();

        // only four ring slots: two buffers bounce straight back
        assert_eq!(out.forward(), 4);
        assert_eq!(out.stats().snapshot().dropped, 2);
        assert_eq!(src.empty_count(0), 2);
        assert_eq!(rx_b.recv().unwrap().link_id, 2);

        assert_eq!(inn.receive(), 4);
        let got = inn.get_full_buffers(0, 8);
        assert_eq!(
            got.iter().map(|b| b.id().0).collect::<Vec<_>>(),
            vec![100, 101, 102, 103]
        );
        assert!(got.iter().all(|b| b.filled == 200 && b.size == 256));
        assert_eq!(inn.held(), 4);

        inn.put_empty_buffers(0, got).unwrap();
        assert_eq!(rx_a.recv().unwrap().link_id, 1);
        assert_eq!(out.in_flight(), 4);
        assert_eq!(out.reclaim(), 4);
        assert_eq!(out.in_flight(), 0);
        assert_eq!(src.empty_count(0), 6);
    }

    #[test]
    #[should_panic(expected = "untracked")]
    fn release_of_unknown_buffer_is_fatal() {
        let (_alloc, pair) = pair(2);
        let (bell_a, _rx_a) = doorbell(0, 4);
        let inn = IpcIn::new("in", 1, &pair, bell_a, 1).unwrap();
        let _ = inn.put_empty_buffers(0, alloc_pool(7, 0, 1, 0, 16));
    }
}
