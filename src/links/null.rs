// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use crate::{
    buffer::{Buffer, BufferId},
    cmd,
    link::{LinkObj, LinkOutput, LinkStats},
    msg::Msg,
    status::Status,
    task::TaskCtx,
};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{info, warn};

/// Sink link: takes every full buffer offered and releases it at once.
///
/// Buffers the upstream refuses to take back are kept and offered again
/// on the next `NEW_DATA`.
pub struct NullLink {
    name: String,
    upstream: Arc<dyn LinkOutput>,
    up_que: usize,
    max_list: usize,
    last: Mutex<Option<(BufferId, u64)>>,
    refused: Mutex<Vec<Buffer>>,
    stats: LinkStats,
}

impl NullLink {
    pub fn new(name: &str, upstream: Arc<dyn LinkOutput>, up_que: usize, max_list: usize) -> Self {
        Self {
            name: name.to_owned(),
            upstream,
            up_que,
            max_list: max_list.max(1),
            last: Mutex::new(None),
            refused: Mutex::new(Vec::new()),
            stats: LinkStats::default(),
        }
    }

    pub fn stats(&self) -> &LinkStats {
        &self.stats
    }

    /// Id and timestamp of the most recent buffer consumed.
    pub fn last(&self) -> Option<(BufferId, u64)> {
        *self.last.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Buffers held back because the upstream refused them.
    pub fn refused(&self) -> usize {
        self.refused.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn consume(&self) -> usize {
        let mut refused = self.refused.lock().unwrap_or_else(PoisonError::into_inner);
        let bufs = self.upstream.get_full_buffers(self.up_que, self.max_list);
        let n = bufs.len();
        if n > 0 {
            self.stats.add_recv(n as u64);
            if let Some(b) = bufs.last() {
                *self.last.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some((b.id(), b.timestamp));
            }
        }
        let mut back = std::mem::take(&mut *refused);
        back.extend(bufs);
        if back.is_empty() {
            return 0;
        }
        let total = back.len();
        match self.upstream.put_empty_buffers(self.up_que, back) {
            Ok(()) => self.stats.add_released(total as u64),
            Err(r) => {
                warn!(
                    "{}: upstream refused {} buffer(s): {}",
                    self.name,
                    r.item.len(),
                    r.status
                );
                self.stats.add_released((total - r.item.len()) as u64);
                *refused = r.item;
            }
        }
        n
    }
}

impl Drop for NullLink {
    fn drop(&mut self) {
        let left = self.refused();
        if left > 0 {
            warn!("{}: {} refused buffer(s) never returned", self.name, left);
        }
    }
}

impl LinkObj for NullLink {
    fn handle(&self, _ctx: &TaskCtx, msg: &mut Msg) -> Result<(), Status> {
        match msg.cmd() {
            cmd::NEW_DATA => {
                self.stats.new_data();
                self.consume();
            }
            cmd::PRINT_STATISTICS => {
                self.stats.print(&self.name);
                if let Some((id, ts)) = self.last() {
                    info!("[{}] last: {} @ {}us", self.name, id, ts);
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
