// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Single-producer single-consumer ring in shared memory.
//!
//! Layout of a ring inside its [`RegionSlice`]:
//!
//! ```text
//! 0x00  read index   (written by the consumer only)
//! 0x40  write index  (written by the producer only)
//! 0x80  magic, element size, max elements, producer/consumer claims
//! 0xC0  max_elements slots, each element size rounded up to a cache line
//! ```
//!
//! The two indices live on separate cache lines so that writing one back
//! from a non-coherent cache can never clobber the other. Indices count
//! modulo `2 * max_elements`; the ring is empty when they are equal and
//! full when they are `max_elements` apart.
//!
//! Publishing and acquiring an element are explicit two-step operations
//! through [`CacheOps`]: the producer writes the slot, writes it back, then
//! advances the write index; the consumer invalidates the slot, reads it,
//! then advances the read index. With coherent memory [`Coherent`] reduces
//! both steps to fences.

use super::shm::{align_up, RegionSlice, CACHE_LINE};
use crate::status::Status;
use cdr::{Bounded, CdrLe};
use serde::{de::DeserializeOwned, Serialize};
use std::{
    fmt, ptr, slice,
    sync::{
        atomic::{self, AtomicU32, Ordering},
        Arc,
    },
    thread,
    time::Duration,
};
use tracing::{debug, error, warn};

const RD_OFFSET: usize = 0;
const WR_OFFSET: usize = CACHE_LINE;
const META_OFFSET: usize = 2 * CACHE_LINE;
pub const HEADER_SIZE: usize = 3 * CACHE_LINE;

const MAGIC: u32 = 0x4C4E_4B52;
const META_MAGIC: usize = 0;
const META_ELEMENT_SIZE: usize = 1;
const META_MAX: usize = 2;
const META_PRODUCER: usize = 3;
const META_CONSUMER: usize = 4;

/// Cache maintenance around shared slots.
pub trait CacheOps: Send + Sync {
    /// Makes `len` bytes at `ptr` written by this core visible to the peer.
    fn writeback(&self, ptr: *const u8, len: usize);
    /// Drops any stale local copy of `len` bytes at `ptr` before reading.
    fn invalidate(&self, ptr: *const u8, len: usize);
}

/// Cache-coherent memory: ordering only.
#[derive(Debug, Default, Clone, Copy)]
pub struct Coherent;

impl CacheOps for Coherent {
    fn writeback(&self, _ptr: *const u8, _len: usize) {
        atomic::fence(Ordering::Release);
    }

    fn invalidate(&self, _ptr: *const u8, _len: usize) {
        atomic::fence(Ordering::Acquire);
    }
}

/// Retry with exponential backoff on `RingFull`/`RingEmpty`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub backoff: Duration,
    pub max_backoff: Duration,
}

impl RetryPolicy {
    /// Fail immediately.
    pub const NONE: RetryPolicy = RetryPolicy {
        attempts: 0,
        backoff: Duration::ZERO,
        max_backoff: Duration::ZERO,
    };

    /// Backoff after `delay`, doubled and capped.
    pub fn next_delay(&self, delay: Duration) -> Duration {
        delay.saturating_mul(2).min(self.max_backoff)
    }

    pub fn run<R>(&self, mut op: impl FnMut() -> Result<R, Status>) -> Result<R, Status> {
        let mut delay = self.backoff;
        let mut attempt = 0;
        loop {
            match op() {
                Err(e)
                    if matches!(e, Status::RingFull | Status::RingEmpty)
                        && attempt < self.attempts =>
                {
                    attempt += 1;
                    thread::sleep(delay);
                    delay = self.next_delay(delay);
                }
                res => return res,
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff: Duration::from_micros(100),
            max_backoff: Duration::from_millis(10),
        }
    }
}

struct RingInner {
    mem: RegionSlice,
    element_size: usize,
    max: u32,
    stride: usize,
    cache: Arc<dyn CacheOps>,
}

impl RingInner {
    fn word(&self, offset: usize) -> &AtomicU32 {
        // offset is 4-byte aligned and inside the header reserved in `check`
        unsafe { &*(self.mem.as_ptr().add(offset) as *const AtomicU32) }
    }

    fn rd(&self) -> &AtomicU32 {
        self.word(RD_OFFSET)
    }

    fn wr(&self) -> &AtomicU32 {
        self.word(WR_OFFSET)
    }

    fn meta(&self, index: usize) -> &AtomicU32 {
        self.word(META_OFFSET + index * 4)
    }

    fn line(&self, offset: usize) -> *const u8 {
        unsafe { self.mem.as_ptr().add(offset) }
    }

    fn slot(&self, index: u32) -> *mut u8 {
        let slot = (index % self.max) as usize;
        unsafe { self.mem.as_ptr().add(HEADER_SIZE + slot * self.stride) }
    }

    fn distance(&self, rd: u32, wr: u32) -> u32 {
        let span = 2 * u64::from(self.max);
        ((u64::from(wr) + span - u64::from(rd)) % span) as u32
    }

    fn advance(&self, index: u32) -> u32 {
        ((u64::from(index) + 1) % (2 * u64::from(self.max))) as u32
    }
}

/// Shared handle on a ring. Element access goes through the single
/// [`RingProducer`] and single [`RingConsumer`] claimed from it.
#[derive(Clone)]
pub struct IpcRing {
    inner: Arc<RingInner>,
}

impl IpcRing {
    /// Bytes a ring of `max_elements` elements of `element_size` needs.
    pub fn required_size(element_size: usize, max_elements: u32) -> usize {
        HEADER_SIZE + align_up(element_size) * max_elements as usize
    }

    fn check(mem: &RegionSlice, element_size: usize, max: u32) -> Result<(), Status> {
        if element_size == 0 || max == 0 || max > u32::MAX / 2 || element_size > u32::MAX as usize
        {
            return Err(Status::InvalidArgument);
        }
        if mem.len() < Self::required_size(element_size, max) {
            error!(
                "ring of {}x{} does not fit {} bytes",
                max,
                element_size,
                mem.len()
            );
            return Err(Status::InvalidArgument);
        }
        Ok(())
    }

    fn build(
        mem: RegionSlice,
        element_size: usize,
        max: u32,
        cache: Arc<dyn CacheOps>,
    ) -> Self {
        Self {
            inner: Arc::new(RingInner {
                mem,
                element_size,
                max,
                stride: align_up(element_size),
                cache,
            }),
        }
    }

    /// Initialises an empty ring in `mem`.
    pub fn create(
        mem: RegionSlice,
        element_size: usize,
        max_elements: u32,
        cache: Arc<dyn CacheOps>,
    ) -> Result<Self, Status> {
        Self::check(&mem, element_size, max_elements)?;
        let ring = Self::build(mem, element_size, max_elements, cache);
        let inner = &ring.inner;
        inner.rd().store(0, Ordering::Relaxed);
        inner.wr().store(0, Ordering::Relaxed);
        inner
            .meta(META_ELEMENT_SIZE)
            .store(element_size as u32, Ordering::Relaxed);
        inner.meta(META_MAX).store(max_elements, Ordering::Relaxed);
        inner.meta(META_PRODUCER).store(0, Ordering::Relaxed);
        inner.meta(META_CONSUMER).store(0, Ordering::Relaxed);
        inner.meta(META_MAGIC).store(MAGIC, Ordering::Release);
        inner.cache.writeback(inner.line(0), HEADER_SIZE);
        debug!(
            "ring created at {:#x}: {} x {} bytes",
            inner.mem.offset(),
            max_elements,
            element_size
        );
        Ok(ring)
    }

    /// Opens a ring created by the peer, checking its geometry.
    pub fn attach(
        mem: RegionSlice,
        element_size: usize,
        max_elements: u32,
        cache: Arc<dyn CacheOps>,
    ) -> Result<Self, Status> {
        Self::check(&mem, element_size, max_elements)?;
        let ring = Self::build(mem, element_size, max_elements, cache);
        let inner = &ring.inner;
        inner.cache.invalidate(inner.line(META_OFFSET), CACHE_LINE);
        if inner.meta(META_MAGIC).load(Ordering::Acquire) != MAGIC {
            warn!("no ring at {:#x}", inner.mem.offset());
            return Err(Status::InvalidArgument);
        }
        let size = inner.meta(META_ELEMENT_SIZE).load(Ordering::Relaxed);
        let max = inner.meta(META_MAX).load(Ordering::Relaxed);
        if size as usize != element_size || max != max_elements {
            warn!(
                "ring at {:#x} is {}x{}, expected {}x{}",
                inner.mem.offset(),
                max,
                size,
                max_elements,
                element_size
            );
            return Err(Status::InvalidArgument);
        }
        Ok(ring)
    }

    /// Zeroes the selected indices.
    pub fn reset(&self, reset_rd: bool, reset_wr: bool) {
        let inner = &self.inner;
        if reset_rd {
            inner.rd().store(0, Ordering::Release);
            inner.cache.writeback(inner.line(RD_OFFSET), CACHE_LINE);
        }
        if reset_wr {
            inner.wr().store(0, Ordering::Release);
            inner.cache.writeback(inner.line(WR_OFFSET), CACHE_LINE);
        }
    }

    /// Invalidates the ring header so later attaches fail.
    pub fn delete(self) {
        let inner = &self.inner;
        unsafe { ptr::write_bytes(inner.mem.as_ptr(), 0, HEADER_SIZE) };
        inner.cache.writeback(inner.line(0), HEADER_SIZE);
        debug!("ring at {:#x} deleted", inner.mem.offset());
    }

    pub fn element_size(&self) -> usize {
        self.inner.element_size
    }

    pub fn capacity(&self) -> u32 {
        self.inner.max
    }

    /// Elements published and not yet consumed.
    pub fn len(&self) -> u32 {
        let inner = &self.inner;
        inner.cache.invalidate(inner.line(0), 2 * CACHE_LINE);
        inner.distance(
            inner.rd().load(Ordering::Acquire),
            inner.wr().load(Ordering::Acquire),
        )
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.inner.max
    }

    fn claim(&self, index: usize, role: &str) -> Result<(), Status> {
        let word = self.inner.meta(index);
        if word
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!("ring at {:#x} already has a {}", self.inner.mem.offset(), role);
            return Err(Status::Fail);
        }
        Ok(())
    }

    /// Claims the write side. Only one producer may exist per ring.
    pub fn producer(&self) -> Result<RingProducer, Status> {
        self.claim(META_PRODUCER, "producer")?;
        Ok(RingProducer { ring: self.clone() })
    }

    /// Claims the read side. Only one consumer may exist per ring.
    pub fn consumer(&self) -> Result<RingConsumer, Status> {
        self.claim(META_CONSUMER, "consumer")?;
        Ok(RingConsumer { ring: self.clone() })
    }
}

impl fmt::Debug for IpcRing {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("IpcRing")
            .field("offset", &self.inner.mem.offset())
            .field("element_size", &self.inner.element_size)
            .field("max_elements", &self.inner.max)
            .finish()
    }
}

pub struct RingProducer {
    ring: IpcRing,
}

impl RingProducer {
    pub fn ring(&self) -> &IpcRing {
        &self.ring
    }

    /// Publishes one element, zero padded to the element size.
    pub fn push_bytes(&mut self, elem: &[u8]) -> Result<(), Status> {
        let inner = &self.ring.inner;
        if elem.len() > inner.element_size {
            return Err(Status::InvalidArgument);
        }
        let wr = inner.wr().load(Ordering::Relaxed);
        inner.cache.invalidate(inner.line(RD_OFFSET), CACHE_LINE);
        let rd = inner.rd().load(Ordering::Acquire);
        if inner.distance(rd, wr) >= inner.max {
            return Err(Status::RingFull);
        }
        let slot = inner.slot(wr);
        unsafe {
            ptr::copy_nonoverlapping(elem.as_ptr(), slot, elem.len());
            ptr::write_bytes(slot.add(elem.len()), 0, inner.element_size - elem.len());
        }
        inner.cache.writeback(slot, inner.stride);
        inner.wr().store(inner.advance(wr), Ordering::Release);
        inner.cache.writeback(inner.line(WR_OFFSET), CACHE_LINE);
        Ok(())
    }

    /// Serializes `value` as CDR into the next slot.
    pub fn push<T: Serialize>(&mut self, value: &T) -> Result<(), Status> {
        let limit = Bounded(self.ring.element_size() as u64);
        let bytes = cdr::serialize::<_, _, CdrLe>(value, limit).map_err(|e| {
            error!("element does not fit ring slot: {}", e);
            Status::InvalidArgument
        })?;
        self.push_bytes(&bytes)
    }

    pub fn push_retry<T: Serialize>(
        &mut self,
        value: &T,
        policy: &RetryPolicy,
    ) -> Result<(), Status> {
        policy.run(|| self.push(value))
    }
}

impl Drop for RingProducer {
    fn drop(&mut self) {
        self.ring.inner.meta(META_PRODUCER).store(0, Ordering::Release);
    }
}

pub struct RingConsumer {
    ring: IpcRing,
}

impl RingConsumer {
    pub fn ring(&self) -> &IpcRing {
        &self.ring
    }

    fn acquire<R>(&mut self, read: impl FnOnce(&[u8]) -> R) -> Result<R, Status> {
        let inner = &self.ring.inner;
        let rd = inner.rd().load(Ordering::Relaxed);
        inner.cache.invalidate(inner.line(WR_OFFSET), CACHE_LINE);
        let wr = inner.wr().load(Ordering::Acquire);
        if rd == wr {
            return Err(Status::RingEmpty);
        }
        let slot = inner.slot(rd);
        inner.cache.invalidate(slot, inner.stride);
        let out = read(unsafe { slice::from_raw_parts(slot, inner.element_size) });
        inner.rd().store(inner.advance(rd), Ordering::Release);
        inner.cache.writeback(inner.line(RD_OFFSET), CACHE_LINE);
        Ok(out)
    }

    /// Takes the oldest element as raw bytes, padding included.
    pub fn pop_bytes(&mut self) -> Result<Vec<u8>, Status> {
        self.acquire(|bytes| bytes.to_vec())
    }

    /// Takes the oldest element and decodes it from CDR.
    pub fn pop<T: DeserializeOwned>(&mut self) -> Result<T, Status> {
        self.acquire(|bytes| cdr::deserialize::<T>(bytes))?
            .map_err(|e| {
                error!("corrupt ring element: {}", e);
                Status::InvalidArgument
            })
    }

    pub fn pop_retry<T: DeserializeOwned>(&mut self, policy: &RetryPolicy) -> Result<T, Status> {
        policy.run(|| self.pop())
    }
}

impl Drop for RingConsumer {
    fn drop(&mut self) {
        self.ring.inner.meta(META_CONSUMER).store(0, Ordering::Release);
    }
}
