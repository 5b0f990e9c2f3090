// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Cross-core transport.
//!
//! Cores exchange data through pairs of unidirectional [`ring::IpcRing`]s
//! placed in a [`shm::SharedRegion`] and wake each other with
//! [`notify::Doorbell`]s. [`IpcFabric`] owns the region and hands out ring
//! pairs by [`ChannelId`]. On top of it, [`msg`] carries commands with
//! optional acknowledgement and [`link`] carries buffers.

pub mod link;
pub mod msg;
pub mod notify;
pub mod ring;
pub mod shm;

use crate::status::Status;
use notify::{Doorbell, NotifyEvent};
use ring::{CacheOps, IpcRing};
use shm::{align_up, RegionAllocator, SharedRegion};
use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, Mutex, PoisonError},
};
use tracing::{debug, warn};

/// Doorbell events buffered per core.
pub const DOORBELL_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChannelId {
    pub src_core: u16,
    pub dst_core: u16,
    pub channel: u16,
}

impl ChannelId {
    pub fn new(src_core: u16, dst_core: u16, channel: u16) -> Self {
        Self {
            src_core,
            dst_core,
            channel,
        }
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}->{}#{}", self.src_core, self.dst_core, self.channel)
    }
}

/// Request ring (source to destination) and reverse ring.
#[derive(Debug, Clone)]
pub struct RingPair {
    pub fwd: IpcRing,
    pub rev: IpcRing,
}

/// Bytes one ring pair takes in a region.
pub fn ring_pair_size(element_size: usize, max_elements: u32) -> usize {
    2 * align_up(IpcRing::required_size(element_size, max_elements))
}

pub struct IpcFabric {
    alloc: RegionAllocator,
    cache: Arc<dyn CacheOps>,
    channels: Mutex<HashMap<ChannelId, RingPair>>,
    doorbells: Mutex<HashMap<u16, Doorbell>>,
}

impl IpcFabric {
    pub fn new(region: SharedRegion, cache: Arc<dyn CacheOps>) -> Self {
        Self {
            alloc: RegionAllocator::new(region),
            cache,
            channels: Mutex::new(HashMap::new()),
            doorbells: Mutex::new(HashMap::new()),
        }
    }

    /// Creates the doorbell of `core_id`; the receiver goes to that core's
    /// runtime.
    pub fn add_core(&self, core_id: u16) -> Result<kanal::Receiver<NotifyEvent>, Status> {
        let mut doorbells = self.doorbells.lock().unwrap_or_else(PoisonError::into_inner);
        if doorbells.contains_key(&core_id) {
            return Err(Status::InvalidArgument);
        }
        let (bell, rx) = notify::doorbell(core_id, DOORBELL_DEPTH);
        doorbells.insert(core_id, bell);
        Ok(rx)
    }

    pub fn doorbell(&self, core_id: u16) -> Result<Doorbell, Status> {
        self.doorbells
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&core_id)
            .cloned()
            .ok_or_else(|| {
                warn!("core {} has no doorbell", core_id);
                Status::InvalidArgument
            })
    }

    /// Ring pair of `id`, created on first use. Later calls must ask for
    /// the same geometry.
    pub fn channel(
        &self,
        id: ChannelId,
        element_size: usize,
        max_elements: u32,
    ) -> Result<RingPair, Status> {
        let mut channels = self.channels.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(pair) = channels.get(&id) {
            if pair.fwd.element_size() != element_size || pair.fwd.capacity() != max_elements {
                warn!("channel {} reopened with a different geometry", id);
                return Err(Status::InvalidArgument);
            }
            return Ok(pair.clone());
        }
        let size = IpcRing::required_size(element_size, max_elements);
        let fwd = IpcRing::create(
            self.alloc.reserve(size)?,
            element_size,
            max_elements,
            self.cache.clone(),
        )?;
        let rev = IpcRing::create(
            self.alloc.reserve(size)?,
            element_size,
            max_elements,
            self.cache.clone(),
        )?;
        debug!(
            "channel {}: {} x {} bytes each way",
            id, max_elements, element_size
        );
        let pair = RingPair { fwd, rev };
        channels.insert(id, pair.clone());
        Ok(pair)
    }

    pub fn available(&self) -> usize {
        self.alloc.available()
    }
}
