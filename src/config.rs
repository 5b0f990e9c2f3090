// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use serde::Deserialize;
use std::{error::Error, fs::File, path::Path};

/// Capacities of the fixed-size runtime containers.
///
/// Every container in the runtime is sized once at build time from this
/// structure and never grows. The defaults match the sizing used on the
/// reference platform.
///
/// # Example
///
/// ```no_run
/// use edgefirst_link::config::RuntimeConfig;
///
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let cfg = RuntimeConfig::from_file("link.json")?;
/// assert!(cfg.msg_pool_size > 0);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Messages in the per-runtime message pool
    pub msg_pool_size: usize,
    /// Depth of every mailbox receive queue
    pub recv_que_len: usize,
    /// Ack slots per mailbox (concurrent send-and-wait callers)
    pub ack_slots: usize,
    /// Depth of each ack slot
    pub ack_que_len: usize,
    /// Depth of each empty/full buffer queue
    pub buf_que_len: usize,
    /// Upper bound for a single batch get
    pub max_buffers_in_list: usize,
    /// Maximum output queues per link
    pub max_out_que: usize,
    /// Buffers a DupLink can have in flight at once
    pub dup_max_tracked: usize,
    /// Elements per cross-core ring
    pub ipc_ring_elements: u32,
    /// Maximum payload of a cross-core command message
    pub ipc_msg_size: usize,
    /// Stack size of task threads in bytes
    pub task_stack_size: usize,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            msg_pool_size: 1024,
            recv_que_len: 1024,
            ack_slots: 4,
            ack_que_len: 2,
            buf_que_len: 384,
            max_buffers_in_list: 64,
            max_out_que: 6,
            dup_max_tracked: 384,
            ipc_ring_elements: 10,
            ipc_msg_size: 4096,
            task_stack_size: 256 * 1024,
        }
    }
}

impl RuntimeConfig {
    /// Loads a configuration from a JSON file. Missing keys take their
    /// default value.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn Error>> {
        let file = File::open(path)?;
        let cfg: RuntimeConfig = serde_json::from_reader(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), Box<dyn Error>> {
        if self.msg_pool_size == 0
            || self.recv_que_len == 0
            || self.ack_slots == 0
            || self.ack_que_len == 0
            || self.buf_que_len == 0
            || self.max_buffers_in_list == 0
            || self.max_out_que == 0
            || self.dup_max_tracked == 0
            || self.ipc_ring_elements == 0
            || self.ipc_msg_size == 0
        {
            return Err(Box::from("runtime capacities must be non-zero"));
        }
        Ok(())
    }
}
