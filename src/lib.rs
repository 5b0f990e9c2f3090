// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! # EdgeFirst Link Runtime
//!
//! This library provides the message and buffer plumbing that media pipeline
//! links run on. Each link is a task driven by its mailbox; neighbouring
//! links exchange buffer handles through empty/full queues, a DupLink fans
//! one stream out to several consumers with per-buffer reference counting,
//! and IPC links carry buffers and commands to links running on another
//! core through shared-memory rings.
//!
//! ## Features
//!
//! - **Mailboxes and Tasks**: Fixed-size message pool, bounded receive
//!   queues, and send-and-wait with per-sender ack slots.
//! - **Buffer Queues**: Empty/full handle exchange with multiple allocation
//!   pools and batch operations.
//! - **DupLink**: Zero-copy fan-out that returns a buffer upstream exactly
//!   once, after every output has released it.
//! - **Cross-core IPC**: Single-producer single-consumer rings with explicit
//!   cache maintenance, doorbells, and command/ack channels.
//!
//! ## Example
//!
//! ```no_run
//! use edgefirst_link::{
//!     cmd,
//!     config::RuntimeConfig,
//!     links::{DupLink, NullLink, NullSrc, NullSrcParams},
//!     runtime::LinkRuntime,
//!     task::DEFAULT_PRIORITY,
//! };
//! use std::sync::Arc;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let cfg = RuntimeConfig::default();
//! let rt = LinkRuntime::new(0, cfg.clone());
//!
//! // Source -> DupLink -> two sinks
//! let src = Arc::new(NullSrc::new("src", NullSrcParams::default(), &cfg)?);
//! let dup = Arc::new(DupLink::new("dup", src.clone(), 0, 2, &cfg)?);
//! let sink0 = rt.spawn_link(3, "sink0", DEFAULT_PRIORITY,
//!     Arc::new(NullLink::new("sink0", dup.clone(), 0, 16)))?;
//! let sink1 = rt.spawn_link(4, "sink1", DEFAULT_PRIORITY,
//!     Arc::new(NullLink::new("sink1", dup.clone(), 1, 16)))?;
//! let dup = rt.spawn_link(2, "dup", DEFAULT_PRIORITY, dup)?;
//! let src = rt.spawn_link(1, "src", DEFAULT_PRIORITY, src)?;
//!
//! dup.obj().set_next(0, sink0.mbx())?;
//! dup.obj().set_next(1, sink1.mbx())?;
//! src.obj().set_next(dup.mbx());
//! rt.link_control(1, cmd::START, None, true)?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Platform Requirements
//!
//! - **Linux**: Task priorities map to thread nice values and shared
//!   regions use `mmap`. Other Unix targets run with priorities recorded
//!   only.
//!
//! ## Safety
//!
//! This library uses `unsafe` code to map shared memory and to access ring
//! slots and indices inside it. All unsafe operations are isolated to the
//! [`ipc::shm`] and [`ipc::ring`] modules and wrapped with safe APIs.

pub mod buffer;
pub mod bufque;
pub mod cmd;
pub mod config;
pub mod ipc;
pub mod link;
pub mod links;
pub mod mbx;
pub mod msg;
pub mod que;
pub mod runtime;
pub mod status;
pub mod task;

pub use status::{Status, Timeout};
