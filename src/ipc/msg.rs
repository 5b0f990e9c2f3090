// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Commands across cores.
//!
//! [`IpcMsgClient`] writes requests into the forward ring of a channel and
//! rings the destination core. The destination runs an [`IpcMsgServer`]
//! link that hands each request to the addressed local link through its
//! runtime and, when the sender asked for it, writes the result back on the
//! reverse ring and rings the sender's core. There the client's ack mailbox,
//! registered with the sender's runtime, is told `NOTIFY` and the waiting
//! caller wakes up. Parameters travel as bytes: the local handler sees a
//! `Vec<u8>` parameter and may replace it with a `Vec<u8>` reply.

use super::{
    notify::Doorbell,
    ring::{RetryPolicy, RingConsumer, RingProducer},
    RingPair,
};
use crate::{
    cmd,
    link::LinkObj,
    mbx::Mailbox,
    msg::Msg,
    runtime::LinkRuntime,
    status::{result_code, Status, Timeout},
    task::TaskCtx,
};
use serde::{Deserialize, Serialize};
use std::{
    sync::{Arc, Mutex, PoisonError},
    time::{Duration, Instant},
};
use tracing::{debug, error, warn};

/// Link id the server registers under on its core.
pub const IPC_MSG_LINK_ID: u32 = 0xFFFF_0000;

/// Default link id of a client's ack mailbox on the sending core.
pub const IPC_ACK_LINK_ID: u32 = 0xFFFF_0001;

/// Default time a client waits for an acknowledgement.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Serialize, Deserialize)]
struct Request {
    seq: u32,
    ack_link: u32,
    link_id: u32,
    cmd: u32,
    wait_ack: bool,
    payload: Vec<u8>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Reply {
    seq: u32,
    result: i32,
    payload: Vec<u8>,
}

struct ClientState {
    tx: RingProducer,
    rx: RingConsumer,
    seq: u32,
}

/// Sending side of a command channel. Callers are serialized, so one
/// request is in flight at a time.
pub struct IpcMsgClient {
    rt: Arc<LinkRuntime>,
    ack_link: u32,
    ack: Arc<Mailbox>,
    bell: Doorbell,
    state: Mutex<ClientState>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl IpcMsgClient {
    /// Takes the producer of `pair.fwd` and the consumer of `pair.rev`;
    /// `bell` is the destination core's doorbell. The ack mailbox is
    /// registered with `rt` under `ack_link` until the client is dropped.
    pub fn new(
        rt: Arc<LinkRuntime>,
        ack_link: u32,
        pair: &RingPair,
        bell: Doorbell,
    ) -> Result<Self, Status> {
        let state = ClientState {
            tx: pair.fwd.producer()?,
            rx: pair.rev.consumer()?,
            seq: 0,
        };
        let ack = rt.create_mailbox("ipc_ack");
        rt.register(ack_link, ack.clone())?;
        Ok(Self {
            rt,
            ack_link,
            ack,
            bell,
            state: Mutex::new(state),
            retry: RetryPolicy::default(),
            timeout: DEFAULT_ACK_TIMEOUT,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Sends `cmd` to `link_id` on the destination core.
    ///
    /// With `wait` the call returns the handler's result and reply payload,
    /// or [`Status::Timeout`] if no acknowledgement arrives in time.
    /// Without it the payload returned is empty. A request ring that stays
    /// full through the retry policy yields [`Status::RingFull`].
    pub fn send(
        &self,
        link_id: u32,
        cmd: u32,
        payload: &[u8],
        wait: bool,
    ) -> Result<Vec<u8>, Status> {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        st.seq = st.seq.wrapping_add(1);
        let seq = st.seq;
        let req = Request {
            seq,
            ack_link: self.ack_link,
            link_id,
            cmd,
            wait_ack: wait,
            payload: payload.to_vec(),
        };
        st.tx.push_retry(&req, &self.retry)?;
        self.bell.ring(self.rt.core_id(), IPC_MSG_LINK_ID)?;
        if !wait {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + self.timeout;
        loop {
            match st.rx.pop::<Reply>() {
                Ok(reply) if reply.seq == seq => {
                    Status::from_code(reply.result)?;
                    return Ok(reply.payload);
                }
                Ok(reply) => {
                    assert!(
                        seq.wrapping_sub(reply.seq) < 0x8000_0000,
                        "ack for seq {} while waiting for {}",
                        reply.seq,
                        seq
                    );
                    warn!("discarding late ack for seq {}", reply.seq);
                }
                Err(Status::RingEmpty) => {
                    let left = deadline.saturating_duration_since(Instant::now());
                    if left.is_zero() {
                        warn!(
                            "no ack for cmd {:#x} to link {} (seq {})",
                            cmd, link_id, seq
                        );
                        return Err(Status::Timeout);
                    }
                    match self.ack.recv(Timeout::After(left)) {
                        Ok(bell) => {
                            let _ = bell.ack_or_free(Ok(()));
                        }
                        Err(Status::Timeout) => {}
                        Err(e) => return Err(e),
                    }
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl Drop for IpcMsgClient {
    fn drop(&mut self) {
        self.rt.unregister(self.ack_link);
        self.ack.close();
        self.ack.drain(Ok(()));
    }
}

struct ServerState {
    rx: RingConsumer,
    tx: RingProducer,
}

/// Receiving side of a command channel, run as a link on the destination
/// core under [`IPC_MSG_LINK_ID`].
pub struct IpcMsgServer {
    rt: Arc<LinkRuntime>,
    reply_bell: Doorbell,
    state: Mutex<ServerState>,
    retry: RetryPolicy,
}

impl IpcMsgServer {
    /// Takes the consumer of `pair.fwd` and the producer of `pair.rev`;
    /// `reply_bell` is the sending core's doorbell.
    pub fn new(rt: Arc<LinkRuntime>, pair: &RingPair, reply_bell: Doorbell) -> Result<Self, Status> {
        Ok(Self {
            rt,
            reply_bell,
            state: Mutex::new(ServerState {
                rx: pair.fwd.consumer()?,
                tx: pair.rev.producer()?,
            }),
            retry: RetryPolicy::default(),
        })
    }

    /// Serves every queued request. Returns how many were handled.
    fn serve(&self) -> usize {
        let mut st = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let mut served = 0;
        loop {
            let req = match st.rx.pop::<Request>() {
                Ok(r) => r,
                Err(Status::RingEmpty) => break,
                Err(e) => {
                    error!("dropping request: {}", e);
                    continue;
                }
            };
            served += 1;
            debug!(
                "core {}: {} for link {} (seq {})",
                self.rt.core_id(),
                cmd::name(req.cmd),
                req.link_id,
                req.seq
            );
            let res = self
                .rt
                .link_control(req.link_id, req.cmd, Some(Box::new(req.payload)), req.wait_ack);
            if !req.wait_ack {
                if let Err(e) = res {
                    warn!("cmd {:#x} to link {} failed: {}", req.cmd, req.link_id, e);
                }
                continue;
            }
            let reply = match res {
                Ok(prm) => Reply {
                    seq: req.seq,
                    result: result_code(Ok(())),
                    payload: prm
                        .and_then(|p| p.downcast::<Vec<u8>>().ok())
                        .map(|p| *p)
                        .unwrap_or_default(),
                },
                Err(e) => Reply {
                    seq: req.seq,
                    result: e.code(),
                    payload: Vec::new(),
                },
            };
            if let Err(e) = st.tx.push_retry(&reply, &self.retry) {
                error!("ack for seq {} lost: {}", req.seq, e);
                continue;
            }
            if let Err(e) = self.reply_bell.ring(self.rt.core_id(), req.ack_link) {
                warn!("ack for seq {} not signalled: {}", req.seq, e);
            }
        }
        served
    }
}

impl LinkObj for IpcMsgServer {
    fn handle(&self, _ctx: &TaskCtx, msg: &mut Msg) -> Result<(), Status> {
        match msg.cmd() {
            cmd::NOTIFY => {
                self.serve();
                Ok(())
            }
            other => {
                warn!("ipc server ignores {}", cmd::name(other));
                Err(Status::InvalidArgument)
            }
        }
    }
}
