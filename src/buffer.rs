// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Buffer handles circulated between links.
//!
//! The runtime never looks at buffer contents. A [`Buffer`] carries an
//! opaque payload reference (a DMA file descriptor, a physical address or an
//! offset into shared memory) plus the bookkeeping the runtime needs to
//! route it back to where it came from.
//!
//! `Buffer` is intentionally neither `Clone` nor `Copy`: a handle lives in
//! exactly one queue or one task at a time, and moving it is the only way to
//! hand it over. The only place that creates a second handle for the same
//! payload is the DupLink.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a buffer within the runtime that allocated it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BufferId(pub u32);

impl fmt::Display for BufferId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "buf#{}", self.0)
    }
}

/// Data buffer handle plus its side record.
#[derive(Debug, PartialEq, Eq)]
pub struct Buffer {
    id: BufferId,
    /// Empty queue this buffer must return to
    pub pool_id: u16,
    /// Logical channel the buffer belongs to
    pub channel: u16,
    /// Opaque payload reference
    pub addr: u64,
    /// Payload capacity in bytes
    pub size: u32,
    /// Bytes filled by the producer
    pub filled: u32,
    /// Capture time in microseconds
    pub timestamp: u64,
    /// Set by a producer that could not fill the buffer
    pub invalid: bool,
    dup_ref_count: u32,
    original: Option<BufferId>,
}

impl Buffer {
    pub fn new(id: BufferId, pool_id: u16, addr: u64, size: u32) -> Self {
        Self {
            id,
            pool_id,
            channel: 0,
            addr,
            size,
            filled: 0,
            timestamp: 0,
            invalid: false,
            dup_ref_count: 0,
            original: None,
        }
    }

    pub fn id(&self) -> BufferId {
        self.id
    }

    /// Outstanding duplicate references while the buffer is held by a
    /// DupLink.
    pub fn dup_ref_count(&self) -> u32 {
        self.dup_ref_count
    }

    /// The buffer this handle duplicates, if it is a duplicate.
    pub fn original(&self) -> Option<BufferId> {
        self.original
    }

    pub fn is_dup(&self) -> bool {
        self.original.is_some()
    }

    /// Creates a reference to the same payload for one fan-out output.
    pub(crate) fn duplicate(&self) -> Buffer {
        Buffer {
            id: self.id,
            pool_id: self.pool_id,
            channel: self.channel,
            addr: self.addr,
            size: self.size,
            filled: self.filled,
            timestamp: self.timestamp,
            invalid: self.invalid,
            dup_ref_count: 0,
            original: Some(self.id),
        }
    }

    pub(crate) fn set_dup_ref_count(&mut self, count: u32) {
        self.dup_ref_count = count;
    }

    /// Serialized form used to carry the handle across a core boundary.
    pub fn descriptor(&self, slot: u32) -> BufferDescriptor {
        BufferDescriptor {
            slot,
            id: self.id.0,
            pool_id: self.pool_id,
            channel: self.channel,
            addr: self.addr,
            size: self.size,
            filled: self.filled,
            timestamp: self.timestamp,
            invalid: self.invalid,
        }
    }

    /// Rebuilds a local handle on the receiving core.
    pub fn from_descriptor(desc: &BufferDescriptor) -> Buffer {
        Buffer {
            id: BufferId(desc.id),
            pool_id: desc.pool_id,
            channel: desc.channel,
            addr: desc.addr,
            size: desc.size,
            filled: desc.filled,
            timestamp: desc.timestamp,
            invalid: desc.invalid,
            dup_ref_count: 0,
            original: None,
        }
    }
}

impl fmt::Display for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{} pool:{} ch:{} addr:{:#x} {}/{}B",
            self.id, self.pool_id, self.channel, self.addr, self.filled, self.size
        )?;
        if let Some(org) = self.original {
            write!(f, " dup-of:{}", org)?;
        }
        Ok(())
    }
}

/// Fixed-shape buffer record placed in a cross-core ring slot.
///
/// `slot` indexes the sender's in-flight table so the receiver can hand the
/// buffer back without the sender searching for it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BufferDescriptor {
    pub slot: u32,
    pub id: u32,
    pub pool_id: u16,
    pub channel: u16,
    pub addr: u64,
    pub size: u32,
    pub filled: u32,
    pub timestamp: u64,
    pub invalid: bool,
}

/// Allocates `count` buffer handles for one pool.
///
/// Payload references are laid out back to back starting at `base`, each
/// `size` bytes long. Ids start at `first_id` so several pools of one link
/// never collide.
pub fn alloc_pool(first_id: u32, pool_id: u16, count: u32, base: u64, size: u32) -> Vec<Buffer> {
    (0..count)
        .map(|i| {
            Buffer::new(
                BufferId(first_id + i),
                pool_id,
                base + u64::from(i) * u64::from(size),
                size,
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_points_at_original() {
        let b = Buffer::new(BufferId(3), 1, 0x1000, 64);
        let d = b.duplicate();
        assert_eq!(d.id(), b.id());
        assert_eq!(d.original(), Some(BufferId(3)));
        assert!(!b.is_dup());
        assert!(d.is_dup());
    }

    #[test]
    fn descriptor_rebuilds_handle() {
        let mut b = Buffer::new(BufferId(9), 2, 0xdead_0000, 4096);
        b.channel = 5;
        b.filled = 100;
        b.timestamp = 42;
        let desc = b.descriptor(7);
        assert_eq!(desc.slot, 7);
        assert_eq!(Buffer::from_descriptor(&desc), b);
    }

    #[test]
    fn pool_ids_and_addresses() {
        let pool = alloc_pool(10, 1, 3, 0x10_0000, 0x100);
        let ids: Vec<u32> = pool.iter().map(|b| b.id().0).collect();
        assert_eq!(ids, vec![10, 11, 12]);
        assert_eq!(pool[2].addr, 0x10_0200);
        assert!(pool.iter().all(|b| b.pool_id == 1));
    }
}
