// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Task mailboxes.
//!
//! A [`Mailbox`] is a bounded receive queue plus a handful of private ack
//! slots. A sender that wants to wait for completion borrows one of *its
//! own* ack slots for the duration of the call, so several concurrent
//! send-and-wait callers never see each other's replies even while
//! unrelated fire-and-forget messages keep flowing through the same
//! receive queue.

use crate::{
    config::RuntimeConfig,
    msg::{Msg, MsgFlags, MsgPool, Prm},
    que::{Que, QueFlags},
    status::{Status, Timeout},
};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use tracing::{debug, trace, warn};

struct AckSlot {
    in_use: AtomicBool,
    que: Arc<Que<Msg>>,
}

/// Holds an ack slot and frees it when the send completes.
struct AckGuard<'a> {
    slot: &'a AckSlot,
}

impl Drop for AckGuard<'_> {
    fn drop(&mut self) {
        let was = self.slot.in_use.swap(false, Ordering::AcqRel);
        assert!(was, "ack slot released while not in use");
    }
}

pub struct Mailbox {
    name: String,
    recv: Que<Msg>,
    acks: Vec<AckSlot>,
    pool: Arc<MsgPool>,
    closed: AtomicBool,
}

impl Mailbox {
    pub fn new(name: &str, pool: Arc<MsgPool>, cfg: &RuntimeConfig) -> Self {
        let acks = (0..cfg.ack_slots)
            .map(|_| AckSlot {
                in_use: AtomicBool::new(false),
                que: Arc::new(Que::new(cfg.ack_que_len, QueFlags::BLOCK)),
            })
            .collect();
        Self {
            name: name.to_owned(),
            recv: Que::new(cfg.recv_que_len, QueFlags::BLOCK_GET),
            acks,
            pool,
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn pool(&self) -> &Arc<MsgPool> {
        &self.pool
    }

    /// Messages waiting in the receive queue.
    pub fn pending(&self) -> usize {
        self.recv.len()
    }

    /// True once the owning task has exited; sends are refused from then on.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn claim_ack_slot(&self) -> Option<AckGuard<'_>> {
        self.acks.iter().find_map(|slot| {
            slot.in_use
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .ok()
                .map(|_| AckGuard { slot })
        })
    }

    /// Sends `cmd` to `to`.
    ///
    /// Without [`MsgFlags::WAIT_ACK`] the call returns as soon as the message
    /// is queued. With it, the caller blocks on one of `from`'s ack slots
    /// until the receiver acknowledges, and gets back the receiver's result
    /// together with the (possibly updated) parameter.
    ///
    /// # Errors
    ///
    /// - [`Status::Fail`] if `to` is closed
    /// - [`Status::InvalidArgument`] if an ack is requested without `from`
    /// - [`Status::Fail`] if every ack slot of `from` is busy
    /// - [`Status::NoMessages`] if the message pool is exhausted
    /// - [`Status::QueueFull`] if the receive queue of `to` is full
    /// - the receiver's own error when it acknowledges with one
    pub fn send(
        from: Option<&Mailbox>,
        to: &Mailbox,
        cmd: u32,
        prm: Option<Prm>,
        flags: MsgFlags,
    ) -> Result<Option<Prm>, Status> {
        Mailbox::send_timeout(from, to, cmd, prm, flags, Timeout::NoWait)
    }

    /// [`Mailbox::send`], waiting up to `alloc_timeout` for a free message
    /// when the pool is exhausted.
    pub fn send_timeout(
        from: Option<&Mailbox>,
        to: &Mailbox,
        cmd: u32,
        prm: Option<Prm>,
        flags: MsgFlags,
        alloc_timeout: Timeout,
    ) -> Result<Option<Prm>, Status> {
        if to.is_closed() {
            debug!("{}: closed, cmd {:#x} refused", to.name, cmd);
            return Err(Status::Fail);
        }
        let guard = if flags.wait_ack {
            let from = from.ok_or(Status::InvalidArgument)?;
            match from.claim_ack_slot() {
                Some(g) => Some(g),
                None => {
                    warn!("{}: no free ack slot for cmd {:#x}", from.name, cmd);
                    return Err(Status::Fail);
                }
            }
        } else {
            None
        };

        let mut msg = to.pool.alloc(cmd, prm, flags, alloc_timeout)?;
        if let Some(ref g) = guard {
            msg.ack = Some(g.slot.que.clone());
        }
        let key = msg.key();
        trace!("{} -> {}: cmd {:#x}", from.map_or("-", |m| m.name()), to.name, cmd);
        to.recv.put(msg, Timeout::NoWait).map_err(Status::from)?;
        if to.is_closed() {
            // raced with close: whatever the final drain missed is failed here
            to.drain(Err(Status::Fail));
        }

        let Some(guard) = guard else {
            return Ok(None);
        };
        let reply = guard.slot.que.get(Timeout::Forever)?;
        assert_eq!(
            reply.key(),
            key,
            "unexpected ack on {}: cmd {:#x}",
            to.name,
            reply.cmd()
        );
        reply.into_reply()
    }

    /// Fire-and-forget command with no sender.
    pub fn send_cmd(&self, cmd: u32, prm: Option<Prm>) -> Result<(), Status> {
        Mailbox::send(None, self, cmd, prm, MsgFlags::NONE).map(|_| ())
    }

    /// Fire-and-forget command that waits up to `timeout` for a free message.
    pub fn post(&self, cmd: u32, timeout: Timeout) -> Result<(), Status> {
        Mailbox::send_timeout(None, self, cmd, None, MsgFlags::NONE, timeout).map(|_| ())
    }

    /// Waits for the next message.
    pub fn recv(&self, timeout: Timeout) -> Result<Msg, Status> {
        self.recv.get(timeout)
    }

    /// Returns the command id at the head of the receive queue.
    pub fn peek_cmd(&self) -> Option<u32> {
        self.recv.peek(|m| m.cmd())
    }

    /// Receives and acknowledges messages until `cmd` arrives, which is
    /// returned un-acknowledged.
    pub fn wait_cmd(&self, cmd: u32) -> Result<Msg, Status> {
        loop {
            let msg = self.recv(Timeout::Forever)?;
            if msg.cmd() == cmd {
                return Ok(msg);
            }
            msg.ack_or_free(Ok(()))?;
        }
    }

    /// Acknowledges and discards queued messages from the head of the queue
    /// as long as their command is one of `cmds`.
    pub fn flush(&self, cmds: &[u32]) -> usize {
        let mut flushed = 0;
        while self.peek_cmd().is_some_and(|c| cmds.contains(&c)) {
            match self.recv(Timeout::NoWait) {
                Ok(msg) => {
                    let _ = msg.ack_or_free(Ok(()));
                    flushed += 1;
                }
                Err(_) => break,
            }
        }
        flushed
    }

    /// Refuses further sends. Messages already queued stay until drained.
    pub(crate) fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    /// Completes every queued message with `result`; used at teardown so no
    /// sender stays blocked.
    pub(crate) fn drain(&self, result: Result<(), Status>) -> usize {
        let msgs = self.recv.drain();
        let n = msgs.len();
        for m in msgs {
            let _ = m.ack_or_free(result);
        }
        n
    }
}
