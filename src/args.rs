// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use clap::Parser;
use edgefirst_link::config::RuntimeConfig;
use std::{error::Error, path::PathBuf};

/// Command-line arguments for the EdgeFirst Link demo pipeline.
///
/// The demo runs two cores in one process. Core 0 hosts a frame source and
/// a DupLink; one DupLink output is consumed locally, the other is carried
/// over a shared-memory ring to a consumer on core 1. Arguments can be
/// specified via command line or environment variables.
///
/// # Example
///
/// ```bash
/// # Via command line
/// edgefirst-link --frames 300 --fps 60 --outputs 3
///
/// # Via environment variables
/// export FRAMES=300
/// export SHM=/dev/shm/edgefirst-link
/// edgefirst-link
/// ```
#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Frames to generate before shutting down
    #[arg(short, long, env = "FRAMES", default_value = "120")]
    pub frames: u64,

    /// Source frame rate
    #[arg(long, env = "FPS", default_value = "30")]
    pub fps: u32,

    /// Buffers in the source pool
    #[arg(short, long, env = "BUFFERS", default_value = "8")]
    pub buffers: u32,

    /// Source buffer size in bytes
    #[arg(long, env = "BUFFER_SIZE", default_value = "4147200")]
    pub buffer_size: u32,

    /// DupLink outputs; output 0 crosses to core 1, the others stay local
    #[arg(short, long, env = "OUTPUTS", default_value = "2")]
    pub outputs: usize,

    /// Elements per cross-core ring, overrides the configuration file
    #[arg(long, env = "RING_ELEMENTS")]
    pub ring_elements: Option<u32>,

    /// Back the shared region with this file instead of anonymous memory
    #[arg(long, env = "SHM")]
    pub shm: Option<PathBuf>,

    /// Runtime capacities as JSON (see `RuntimeConfig`)
    #[arg(short, long, env = "CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, env = "VERBOSE")]
    pub verbose: bool,

    /// Enable Tracy profiler for performance analysis
    #[arg(long, env = "TRACY")]
    pub tracy: bool,
}

impl Args {
    /// Runtime configuration from `--config` with command-line overrides.
    pub fn runtime_config(&self) -> Result<RuntimeConfig, Box<dyn Error>> {
        let mut cfg = match self.config {
            Some(ref path) => RuntimeConfig::from_file(path)?,
            None => RuntimeConfig::default(),
        };
        if let Some(n) = self.ring_elements {
            cfg.ipc_ring_elements = n;
        }
        cfg.validate()?;
        Ok(cfg)
    }
}
