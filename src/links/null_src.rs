// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Frame source for pipelines without a capture driver.
//!
//! A [`NullSrc`] owns a pool of buffers and, once started, publishes one of
//! them per tick at the configured rate. A tick that finds every buffer
//! still downstream is counted as a drop, which makes the source a simple
//! backpressure probe for the links behind it.

use crate::{
    buffer::{alloc_pool, Buffer},
    bufque::BufQue,
    cmd,
    config::RuntimeConfig,
    link::{LinkObj, LinkOutput, LinkStats, NextLink},
    mbx::Mailbox,
    msg::Msg,
    que::Rejected,
    status::{Status, Timeout},
    task::TaskCtx,
};
use std::{
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, Mutex, PoisonError, Weak,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tracing::{debug, error, info, trace, warn};

/// Private command sent by the ticker thread.
pub const CMD_TICK: u32 = cmd::LINK_PRIVATE_BASE;

/// Base of the fake payload addresses handed out by the source.
const PAYLOAD_BASE: u64 = 0x1000_0000;

#[derive(Debug, Clone, PartialEq)]
pub struct NullSrcParams {
    pub num_buffers: u32,
    pub buffer_size: u32,
    pub fps: u32,
    /// Stop after this many frames, 0 for no limit
    pub max_frames: u64,
    pub channel: u16,
    pub first_id: u32,
}

impl Default for NullSrcParams {
    fn default() -> Self {
        Self {
            num_buffers: 8,
            buffer_size: 1920 * 1080 * 2,
            fps: 30,
            max_frames: 0,
            channel: 0,
            first_id: 0,
        }
    }
}

struct Ticker {
    stop: Arc<AtomicBool>,
    thread: JoinHandle<()>,
}

pub struct NullSrc {
    name: String,
    params: NullSrcParams,
    bufs: BufQue,
    next: NextLink,
    frames: AtomicU64,
    epoch: Instant,
    ticker: Mutex<Option<Ticker>>,
    stats: LinkStats,
}

impl NullSrc {
    /// # Errors
    ///
    /// [`Status::InvalidArgument`] if the pool does not fit the configured
    /// buffer queue length.
    pub fn new(name: &str, params: NullSrcParams, cfg: &RuntimeConfig) -> Result<Self, Status> {
        let bufs = BufQue::from_config(cfg, 1, false, false);
        if params.num_buffers as usize > cfg.buf_que_len || params.fps == 0 {
            return Err(Status::InvalidArgument);
        }
        bufs.put_empty_list(alloc_pool(
            params.first_id,
            0,
            params.num_buffers,
            PAYLOAD_BASE,
            params.buffer_size,
        ))
        .map_err(|r| r.status)?;
        Ok(Self {
            name: name.to_owned(),
            params,
            bufs,
            next: NextLink::default(),
            frames: AtomicU64::new(0),
            epoch: Instant::now(),
            ticker: Mutex::new(None),
            stats: LinkStats::default(),
        })
    }

    pub fn set_next(&self, mbx: Arc<Mailbox>) {
        self.next.set(mbx);
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    pub fn frames(&self) -> u64 {
        self.frames.load(Ordering::Relaxed)
    }

    /// Buffers currently back in the pool.
    pub fn idle(&self) -> usize {
        self.bufs.empty_count(0)
    }

    pub fn is_done(&self) -> bool {
        self.params.max_frames > 0 && self.frames() >= self.params.max_frames
    }

    /// Starts ticking into `mbx`. The ticker ends on its own once the
    /// mailbox is gone.
    pub fn start(&self, mbx: &Arc<Mailbox>) -> Result<(), Status> {
        let mut ticker = self.ticker.lock().unwrap_or_else(PoisonError::into_inner);
        if ticker.as_ref().is_some_and(|t| !t.thread.is_finished()) {
            return Ok(());
        }
        let stop = Arc::new(AtomicBool::new(false));
        let period = Duration::from_secs_f64(1.0 / f64::from(self.params.fps));
        let mbx = Arc::downgrade(mbx);
        let thread_stop = stop.clone();
        let thread = thread::Builder::new()
            .name(format!("{}-tick", self.name))
            .spawn(move || tick(mbx, period, thread_stop))
            .map_err(|e| {
                error!("{}: cannot start ticker: {}", self.name, e);
                Status::Fail
            })?;
        debug!("{}: ticking every {:?}", self.name, period);
        *ticker = Some(Ticker { stop, thread });
        Ok(())
    }

    pub fn stop(&self) {
        let ticker = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(t) = ticker {
            t.stop.store(true, Ordering::Release);
            if t.thread.join().is_err() {
                error!("{}: ticker panicked", self.name);
            }
        }
    }

    fn signal_stop(&self) {
        if let Some(t) = self
            .ticker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
        {
            t.stop.store(true, Ordering::Release);
        }
    }

    /// Publishes one frame if a buffer is free.
    pub fn generate(&self) -> Result<(), Status> {
        if self.is_done() {
            self.signal_stop();
            return Ok(());
        }
        let mut buf = match self.bufs.get_empty(0, Timeout::NoWait) {
            Ok(b) => b,
            Err(_) => {
                trace!("{}: no free buffer", self.name);
                self.stats.add_dropped(1);
                // consumers may be sitting on buffers after a lost wakeup
                self.next.notify(&self.stats);
                return Ok(());
            }
        };
        buf.channel = self.params.channel;
        buf.filled = buf.size;
        buf.timestamp = self.epoch.elapsed().as_micros() as u64;
        buf.invalid = false;
        if let Err(r) = self.bufs.put_full(buf) {
            self.stats.add_dropped(1);
            let _ = self.bufs.put_empty(r.item);
            return Err(r.status);
        }
        self.frames.fetch_add(1, Ordering::Relaxed);
        self.stats.add_forwarded(1);
        self.next.notify(&self.stats);
        Ok(())
    }
}

impl Drop for NullSrc {
    fn drop(&mut self) {
        self.stop();
    }
}

fn tick(mbx: Weak<Mailbox>, period: Duration, stop: Arc<AtomicBool>) {
    while !stop.load(Ordering::Acquire) {
        thread::sleep(period);
        let Some(mbx) = mbx.upgrade() else {
            break;
        };
        if stop.load(Ordering::Acquire) {
            break;
        }
        if let Err(e) = mbx.send_cmd(CMD_TICK, None) {
            trace!("tick to {} lost: {}", mbx.name(), e);
        }
    }
}

impl LinkOutput for NullSrc {
    fn get_full_buffers(&self, que_id: usize, max: usize) -> Vec<Buffer> {
        self.bufs.get_full_buffers(que_id, max)
    }

    fn put_empty_buffers(
        &self,
        que_id: usize,
        bufs: Vec<Buffer>,
    ) -> Result<(), Rejected<Vec<Buffer>>> {
        let n = bufs.len() as u64;
        self.bufs.put_empty_buffers(que_id, bufs)?;
        self.stats.add_released(n);
        Ok(())
    }
}

impl LinkObj for NullSrc {
    fn handle(&self, ctx: &TaskCtx, msg: &mut Msg) -> Result<(), Status> {
        self.next.retry(&self.stats);
        match msg.cmd() {
            CMD_TICK => self.generate(),
            cmd::START => self.start(ctx.mbx()),
            cmd::STOP => {
                self.stop();
                Ok(())
            }
            cmd::PRINT_STATISTICS => {
                self.stats.print(&self.name);
                info!("[{}] frames: {} idle: {}", self.name, self.frames(), self.idle());
                Ok(())
            }
            cmd::PRINT_BUFFER_STATISTICS => {
                self.bufs.print_status(&self.name);
                Ok(())
            }
            cmd::CREATE | cmd::DELETE => Ok(()),
            other => {
                warn!("{}: unexpected {}", self.name, cmd::name(other));
                Err(Status::InvalidArgument)
            }
        }
    }
}
