// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Command messages and the fixed-size pool they are allocated from.
//!
//! A [`Msg`] owns one slot of its [`MsgPool`] for as long as it exists and
//! gives the slot back when dropped. Since a `Msg` can only be moved, it is
//! held by exactly one queue (or one task) at any instant, and a slot is
//! returned exactly once no matter which path the message takes.

use crate::{
    que::{Que, QueFlags},
    status::{Status, Timeout},
};
use std::{any::Any, fmt, sync::Arc};
use tracing::error;

/// Opaque command parameter.
pub type Prm = Box<dyn Any + Send>;

/// Per-message delivery flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MsgFlags {
    /// Sender blocks until the receiver acknowledges
    pub wait_ack: bool,
}

impl MsgFlags {
    pub const NONE: MsgFlags = MsgFlags { wait_ack: false };
    pub const WAIT_ACK: MsgFlags = MsgFlags { wait_ack: true };
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SlotToken {
    index: u32,
    generation: u32,
}

/// Fixed-capacity message allocator.
///
/// Slots circulate through a free queue; each allocation bumps the slot's
/// generation so a stale reply can never be mistaken for the current one.
pub struct MsgPool {
    free: Que<SlotToken>,
    capacity: usize,
}

impl MsgPool {
    pub fn new(capacity: usize) -> Arc<Self> {
        let free = Que::new(capacity, QueFlags::BLOCK_GET);
        for index in 0..capacity as u32 {
            // the queue was sized for every slot
            let _ = free.put(
                SlotToken {
                    index,
                    generation: 0,
                },
                Timeout::NoWait,
            );
        }
        Arc::new(Self { free, capacity })
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Messages currently available for allocation.
    pub fn free_count(&self) -> usize {
        self.free.len()
    }

    /// Allocates a message, waiting up to `timeout` for a slot.
    pub fn alloc(
        self: &Arc<Self>,
        cmd: u32,
        prm: Option<Prm>,
        flags: MsgFlags,
        timeout: Timeout,
    ) -> Result<Msg, Status> {
        let mut token = self.free.get(timeout).map_err(|e| match e {
            Status::QueueEmpty | Status::Timeout => Status::NoMessages,
            other => other,
        })?;
        token.generation = token.generation.wrapping_add(1);
        Ok(Msg {
            cmd,
            flags,
            prm,
            result: Ok(()),
            ack: None,
            token,
            pool: self.clone(),
        })
    }

    fn release(&self, token: SlotToken) {
        if let Err(r) = self.free.put(token, Timeout::NoWait) {
            error!("message slot {} lost: {}", token.index, r.status);
        }
    }
}

/// Identity of one allocation of one message slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MsgKey {
    pub slot: u32,
    pub generation: u32,
}

pub struct Msg {
    cmd: u32,
    flags: MsgFlags,
    prm: Option<Prm>,
    result: Result<(), Status>,
    pub(crate) ack: Option<Arc<Que<Msg>>>,
    token: SlotToken,
    pool: Arc<MsgPool>,
}

impl Msg {
    pub fn cmd(&self) -> u32 {
        self.cmd
    }

    pub fn flags(&self) -> MsgFlags {
        self.flags
    }

    pub fn key(&self) -> MsgKey {
        MsgKey {
            slot: self.token.index,
            generation: self.token.generation,
        }
    }

    /// Borrows the parameter as `T`.
    pub fn prm<T: Any>(&self) -> Option<&T> {
        self.prm.as_ref()?.downcast_ref::<T>()
    }

    pub fn prm_mut<T: Any>(&mut self) -> Option<&mut T> {
        self.prm.as_mut()?.downcast_mut::<T>()
    }

    pub fn take_prm(&mut self) -> Option<Prm> {
        self.prm.take()
    }

    pub fn set_prm(&mut self, prm: Option<Prm>) {
        self.prm = prm;
    }

    pub fn result(&self) -> Result<(), Status> {
        self.result
    }

    /// Completes the message: replies to a waiting sender, or returns the
    /// slot to the pool when nobody waits.
    ///
    /// # Panics
    ///
    /// Panics when the message asks for an ack but carries no reply route,
    /// which means the sender broke the mailbox contract.
    pub fn ack_or_free(mut self, result: Result<(), Status>) -> Result<(), Status> {
        if !self.flags.wait_ack {
            drop(self);
            return Ok(());
        }
        self.result = result;
        let que = match self.ack.take() {
            Some(q) => q,
            None => panic!("ack requested for cmd {:#x} without a sender", self.cmd),
        };
        que.put(self, Timeout::Forever).map_err(Status::from)
    }

    /// Splits a received reply into its result and parameter, freeing the
    /// slot.
    pub(crate) fn into_reply(mut self) -> Result<Option<Prm>, Status> {
        let prm = self.prm.take();
        self.result.map(|_| prm)
    }
}

impl Drop for Msg {
    fn drop(&mut self) {
        self.pool.release(self.token);
    }
}

impl fmt::Debug for Msg {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Msg")
            .field("cmd", &format_args!("{:#x}", self.cmd))
            .field("flags", &self.flags)
            .field("slot", &self.token.index)
            .field("generation", &self.token.generation)
            .field("result", &self.result)
            .finish()
    }
}
