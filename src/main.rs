// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

mod args;

use args::Args;
use clap::Parser;
use edgefirst_link::{
    cmd,
    ipc::{
        link::{IpcIn, IpcOut, DESCRIPTOR_SIZE},
        msg::{IpcMsgClient, IpcMsgServer, IPC_ACK_LINK_ID, IPC_MSG_LINK_ID},
        ring::Coherent,
        ring_pair_size,
        shm::SharedRegion,
        ChannelId, IpcFabric,
    },
    links::{DupLink, NullLink, NullSrc, NullSrcParams},
    runtime::LinkRuntime,
    task::DEFAULT_PRIORITY,
};
use std::{
    error::Error,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, Layer, Registry};

const SRC_ID: u32 = 1;
const DUP_ID: u32 = 2;
const IPC_OUT_ID: u32 = 3;
const SINK_BASE_ID: u32 = 16;
const IPC_IN_ID: u32 = 0x100;
const REMOTE_SINK_ID: u32 = 0x101;

/// Installs the global subscriber. The returned Tracy client must be kept
/// alive for the profiler to stay connected.
fn init_tracing(args: &Args) -> Result<Option<tracy_client::Client>, Box<dyn Error>> {
    let level = if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    let stdout_log = tracing_subscriber::fmt::layer().with_filter(level);
    let journald = tracing_journald::layer()
        .ok()
        .map(|layer| layer.with_filter(level));
    let client = args.tracy.then(tracy_client::Client::start);
    let tracy = client
        .as_ref()
        .map(|_| tracing_tracy::TracyLayer::default().with_filter(level));

    let subscriber = Registry::default()
        .with(stdout_log)
        .with(journald)
        .with(tracy);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;
    Ok(client)
}

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
    true
}

fn main() -> Result<(), Box<dyn Error>> {
    let args = Args::parse();
    let _tracy = init_tracing(&args)?;
    let cfg = args.runtime_config()?;
    if args.outputs == 0 || args.fps == 0 {
        return Err(Box::from("at least one output and a non-zero frame rate are required"));
    }

    let elements = cfg.ipc_ring_elements;
    let size = ring_pair_size(DESCRIPTOR_SIZE, elements) + ring_pair_size(cfg.ipc_msg_size, elements);
    let region = match args.shm {
        Some(ref path) => SharedRegion::open(path, size)?,
        None => SharedRegion::anonymous(size)?,
    };
    let fabric = IpcFabric::new(region, Arc::new(Coherent));

    let core0 = LinkRuntime::new(0, cfg.clone());
    let core1 = LinkRuntime::new(1, cfg.clone());
    core0.start_notify(fabric.add_core(0)?)?;
    core1.start_notify(fabric.add_core(1)?)?;
    let buf_ch = fabric.channel(ChannelId::new(0, 1, 0), DESCRIPTOR_SIZE, elements)?;
    let msg_ch = fabric.channel(ChannelId::new(0, 1, 1), cfg.ipc_msg_size, elements)?;

    // core 1: ipc_in -> remote_sink, plus the command server
    let ipc_in = Arc::new(IpcIn::new(
        "ipc_in",
        1,
        &buf_ch,
        fabric.doorbell(0)?,
        IPC_OUT_ID,
    )?);
    let remote_sink = core1.spawn_link(
        REMOTE_SINK_ID,
        "remote_sink",
        DEFAULT_PRIORITY,
        Arc::new(NullLink::new(
            "remote_sink",
            ipc_in.clone(),
            0,
            cfg.max_buffers_in_list,
        )),
    )?;
    ipc_in.set_next(remote_sink.mbx());
    let ipc_in = core1.spawn_link(IPC_IN_ID, "ipc_in", DEFAULT_PRIORITY + 1, ipc_in)?;
    let server = core1.spawn_link(
        IPC_MSG_LINK_ID,
        "ipc_msg",
        DEFAULT_PRIORITY,
        Arc::new(IpcMsgServer::new(
            core1.clone(),
            &msg_ch,
            fabric.doorbell(0)?,
        )?),
    )?;

    // core 0: src -> dup -> { ipc_out, sink1.. }
    let params = NullSrcParams {
        num_buffers: args.buffers,
        buffer_size: args.buffer_size,
        fps: args.fps,
        max_frames: args.frames,
        ..Default::default()
    };
    let src = Arc::new(NullSrc::new("src", params, &cfg)?);
    let dup = Arc::new(DupLink::new("dup", src.clone(), 0, args.outputs, &cfg)?);
    let ipc_out = core0.spawn_link(
        IPC_OUT_ID,
        "ipc_out",
        DEFAULT_PRIORITY + 1,
        Arc::new(IpcOut::new(
            "ipc_out",
            0,
            dup.clone(),
            0,
            &buf_ch,
            fabric.doorbell(1)?,
            IPC_IN_ID,
            cfg.max_buffers_in_list,
        )?),
    )?;
    dup.set_next(0, ipc_out.mbx())?;
    let mut sinks = Vec::new();
    for i in 1..args.outputs {
        let name = format!("sink{}", i);
        let sink = core0.spawn_link(
            SINK_BASE_ID + i as u32,
            &name,
            DEFAULT_PRIORITY,
            Arc::new(NullLink::new(&name, dup.clone(), i, cfg.max_buffers_in_list)),
        )?;
        dup.set_next(i, sink.mbx())?;
        sinks.push(sink);
    }
    let dup = core0.spawn_link(DUP_ID, "dup", DEFAULT_PRIORITY + 2, dup)?;
    let src = core0.spawn_link(SRC_ID, "src", DEFAULT_PRIORITY + 3, src)?;
    src.obj().set_next(dup.mbx());

    let client = IpcMsgClient::new(core0.clone(), IPC_ACK_LINK_ID, &msg_ch, fabric.doorbell(1)?)?;

    info!(
        "running {} frames at {} fps through {} outputs",
        args.frames, args.fps, args.outputs
    );
    core0.link_control(SRC_ID, cmd::START, None, true)?;
    let budget = Duration::from_secs(args.frames / u64::from(args.fps) + 5);
    if !wait_until(budget, || src.obj().is_done()) {
        warn!("source stalled after {} frames", src.obj().frames());
    }
    core0.link_control(SRC_ID, cmd::STOP, None, true)?;

    let pool = args.buffers as usize;
    if !wait_until(Duration::from_secs(2), || src.obj().idle() == pool) {
        warn!(
            "{} buffer(s) still in the pipeline",
            pool.saturating_sub(src.obj().idle())
        );
    }

    for id in [SRC_ID, DUP_ID, IPC_OUT_ID] {
        core0.link_control(id, cmd::PRINT_STATISTICS, None, true)?;
    }
    for sink in &sinks {
        core0.link_control(sink.id(), cmd::PRINT_STATISTICS, None, true)?;
    }
    for id in [IPC_IN_ID, REMOTE_SINK_ID] {
        client.send(id, cmd::PRINT_STATISTICS, &[], true)?;
    }
    let remote = remote_sink.obj().stats().snapshot();
    info!(
        "core 1 consumed {} of {} frames",
        remote.recv,
        src.obj().frames()
    );

    drop(client);
    src.destroy();
    dup.destroy();
    for sink in sinks {
        sink.destroy();
    }
    ipc_out.destroy();
    server.destroy();
    ipc_in.destroy();
    remote_sink.destroy();
    core0.shutdown();
    core1.shutdown();
    info!(
        "messages free: core0 {} core1 {}",
        core0.free_msg_count(),
        core1.free_msg_count()
    );
    Ok(())
}
