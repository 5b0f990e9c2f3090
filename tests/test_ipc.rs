// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_link::{
    cmd,
    config::RuntimeConfig,
    ipc::{
        link::{IpcIn, IpcOut, DESCRIPTOR_SIZE},
        msg::{IpcMsgClient, IpcMsgServer, IPC_ACK_LINK_ID, IPC_MSG_LINK_ID},
        ring::{Coherent, RetryPolicy},
        ring_pair_size,
        shm::SharedRegion,
        ChannelId, IpcFabric, RingPair,
    },
    links::{NullLink, NullSrc, NullSrcParams},
    msg::Msg,
    runtime::LinkRuntime,
    task::{Task, TaskCtx, DEFAULT_PRIORITY},
    Status,
};
use serial_test::serial;
use std::{
    error::Error,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

const SRC_ID: u32 = 1;
const IPC_OUT_ID: u32 = 3;
const IPC_IN_ID: u32 = 0x100;
const SINK_ID: u32 = 0x101;
const ECHO_ID: u32 = 0x200;
const CMD_DOUBLE: u32 = cmd::LINK_PRIVATE_BASE;
const CMD_REFUSE: u32 = cmd::LINK_PRIVATE_BASE + 1;
const CMD_SLOW: u32 = cmd::LINK_PRIVATE_BASE + 2;

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

fn fabric(cfg: &RuntimeConfig) -> Result<IpcFabric, Box<dyn Error>> {
    let n = cfg.ipc_ring_elements;
    let size = ring_pair_size(DESCRIPTOR_SIZE, n) + 2 * ring_pair_size(cfg.ipc_msg_size, n);
    Ok(IpcFabric::new(SharedRegion::anonymous(size)?, Arc::new(Coherent)))
}

#[test]
#[serial]
fn test_buffers_cross_cores_and_return() -> Result<(), Box<dyn Error>> {
    let cfg = RuntimeConfig {
        ipc_ring_elements: 2,
        ..Default::default()
    };
    let fabric = fabric(&cfg)?;
    let core0 = LinkRuntime::new(0, cfg.clone());
    let core1 = LinkRuntime::new(1, cfg.clone());
    core0.start_notify(fabric.add_core(0)?)?;
    core1.start_notify(fabric.add_core(1)?)?;
    let ch = fabric.channel(ChannelId::new(0, 1, 0), DESCRIPTOR_SIZE, cfg.ipc_ring_elements)?;

    let ipc_in = Arc::new(IpcIn::new("ipc_in", 1, &ch, fabric.doorbell(0)?, IPC_OUT_ID)?);
    let sink = core1.spawn_link(
        SINK_ID,
        "sink",
        DEFAULT_PRIORITY,
        Arc::new(NullLink::new("sink", ipc_in.clone(), 0, 16)),
    )?;
    ipc_in.set_next(sink.mbx());
    let ipc_in = core1.spawn_link(IPC_IN_ID, "ipc_in", DEFAULT_PRIORITY, ipc_in)?;

    let params = NullSrcParams {
        num_buffers: 4,
        buffer_size: 4096,
        fps: 300,
        max_frames: 60,
        ..Default::default()
    };
    let src = Arc::new(NullSrc::new("src", params, &cfg)?);
    let ipc_out = core0.spawn_link(
        IPC_OUT_ID,
        "ipc_out",
        DEFAULT_PRIORITY,
        Arc::new(IpcOut::new(
            "ipc_out",
            0,
            src.clone(),
            0,
            &ch,
            fabric.doorbell(1)?,
            IPC_IN_ID,
            16,
        )?),
    )?;
    let src = core0.spawn_link(SRC_ID, "src", DEFAULT_PRIORITY, src)?;
    src.obj().set_next(ipc_out.mbx());

    core0.link_control(SRC_ID, cmd::START, None, true)?;
    assert!(wait_until(Duration::from_secs(10), || src.obj().is_done()));
    core0.link_control(SRC_ID, cmd::STOP, None, true)?;
    assert!(wait_until(Duration::from_secs(5), || src.obj().idle() == 4));

    let out = ipc_out.obj().stats().snapshot();
    let remote = sink.obj().stats().snapshot();
    println!("ipc_out: {:?}", out);
    println!("sink: {:?}", remote);
    assert_eq!(out.recv, src.obj().frames());
    assert_eq!(out.forwarded + out.dropped, out.recv);
    assert_eq!(out.released, out.forwarded);
    assert_eq!(remote.recv, out.forwarded);
    assert!(remote.recv > 0);
    assert_eq!(ipc_out.obj().in_flight(), 0);
    assert_eq!(ipc_in.obj().held(), 0);
    assert!(ch.fwd.is_empty());
    assert!(ch.rev.is_empty());

    src.destroy();
    ipc_out.destroy();
    ipc_in.destroy();
    sink.destroy();
    core0.shutdown();
    core1.shutdown();
    Ok(())
}

/// Two cores with running dispatchers and the command channel between them.
fn command_cores(
    fabric: &IpcFabric,
    cfg: &RuntimeConfig,
) -> Result<(Arc<LinkRuntime>, Arc<LinkRuntime>, RingPair), Box<dyn Error>> {
    let core0 = LinkRuntime::new(0, cfg.clone());
    let core1 = LinkRuntime::new(1, cfg.clone());
    core0.start_notify(fabric.add_core(0)?)?;
    core1.start_notify(fabric.add_core(1)?)?;
    let ch = fabric.channel(ChannelId::new(0, 1, 1), cfg.ipc_msg_size, cfg.ipc_ring_elements)?;
    Ok((core0, core1, ch))
}

fn echo_task(core1: &LinkRuntime) -> Result<Task, Status> {
    core1.create_task(
        "echo",
        |_: &TaskCtx, msg: &mut Msg| -> Result<(), Status> {
            match msg.cmd() {
                CMD_DOUBLE => {
                    let data = msg.prm_mut::<Vec<u8>>().ok_or(Status::InvalidArgument)?;
                    data.iter_mut().for_each(|b| *b = b.wrapping_mul(2));
                    Ok(())
                }
                CMD_REFUSE => Err(Status::QueueFull),
                CMD_SLOW => {
                    thread::sleep(Duration::from_millis(300));
                    Ok(())
                }
                _ => Ok(()),
            }
        },
        DEFAULT_PRIORITY,
    )
}

#[test]
#[serial]
fn test_remote_command_with_ack() -> Result<(), Box<dyn Error>> {
    let cfg = RuntimeConfig::default();
    let fabric = fabric(&cfg)?;
    let (core0, core1, ch) = command_cores(&fabric, &cfg)?;
    let echo = echo_task(&core1)?;
    core1.register(ECHO_ID, echo.mbx().clone())?;
    let server = core1.spawn_link(
        IPC_MSG_LINK_ID,
        "ipc_msg",
        DEFAULT_PRIORITY,
        Arc::new(IpcMsgServer::new(core1.clone(), &ch, fabric.doorbell(0)?)?),
    )?;
    let client = IpcMsgClient::new(core0.clone(), IPC_ACK_LINK_ID, &ch, fabric.doorbell(1)?)?;
    assert!(core0.mailbox(IPC_ACK_LINK_ID).is_some());

    let reply = client.send(ECHO_ID, CMD_DOUBLE, &[1, 2, 3, 100], true)?;
    assert_eq!(reply, vec![2, 4, 6, 200]);
    assert_eq!(
        client.send(ECHO_ID, CMD_REFUSE, &[], true).err(),
        Some(Status::QueueFull)
    );
    assert_eq!(
        client.send(0xDEAD, CMD_DOUBLE, &[], true).err(),
        Some(Status::InvalidArgument)
    );

    // fire-and-forget requests return at once and leave no ack behind
    for _ in 0..3 {
        assert!(client.send(ECHO_ID, CMD_DOUBLE, &[7], false)?.is_empty());
    }
    assert_eq!(client.send(ECHO_ID, CMD_DOUBLE, &[9], true)?, vec![18]);
    assert!(ch.rev.is_empty());

    drop(client);
    assert!(core0.mailbox(IPC_ACK_LINK_ID).is_none());
    server.destroy();
    core1.unregister(ECHO_ID);
    echo.destroy();
    core0.shutdown();
    core1.shutdown();
    assert_eq!(core0.free_msg_count(), cfg.msg_pool_size);
    Ok(())
}

#[test]
#[serial]
fn test_ack_rings_sending_core() -> Result<(), Box<dyn Error>> {
    let cfg = RuntimeConfig::default();
    let fabric = fabric(&cfg)?;
    // core 0 has no dispatcher, so its doorbell events stay visible here
    let bell0 = fabric.add_core(0)?;
    let core0 = LinkRuntime::new(0, cfg.clone());
    let core1 = LinkRuntime::new(1, cfg.clone());
    core1.start_notify(fabric.add_core(1)?)?;
    let ch = fabric.channel(ChannelId::new(0, 1, 1), cfg.ipc_msg_size, cfg.ipc_ring_elements)?;
    let echo = echo_task(&core1)?;
    core1.register(ECHO_ID, echo.mbx().clone())?;
    let server = core1.spawn_link(
        IPC_MSG_LINK_ID,
        "ipc_msg",
        DEFAULT_PRIORITY,
        Arc::new(IpcMsgServer::new(core1.clone(), &ch, fabric.doorbell(0)?)?),
    )?;
    let client = IpcMsgClient::new(core0.clone(), 0x300, &ch, fabric.doorbell(1)?)?
        .with_timeout(Duration::from_millis(100));

    // without a wakeup the reply is only found once the wait runs out
    let start = Instant::now();
    assert_eq!(client.send(ECHO_ID, CMD_DOUBLE, &[3], true)?, vec![6]);
    assert!(start.elapsed() >= Duration::from_millis(100));
    let ev = bell0.try_recv()?;
    println!("ack doorbell: {:?}", ev);
    assert_eq!(ev.map(|e| (e.src_core, e.link_id)), Some((1, 0x300)));

    // fire-and-forget requests are never acknowledged
    client.send(ECHO_ID, CMD_DOUBLE, &[3], false)?;
    assert_eq!(client.send(ECHO_ID, CMD_DOUBLE, &[4], true)?, vec![8]);
    assert!(bell0.try_recv()?.is_some());
    assert_eq!(bell0.try_recv()?, None);

    drop(client);
    server.destroy();
    core1.unregister(ECHO_ID);
    echo.destroy();
    core1.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_late_ack_is_discarded() -> Result<(), Box<dyn Error>> {
    let cfg = RuntimeConfig::default();
    let fabric = fabric(&cfg)?;
    let (core0, core1, ch) = command_cores(&fabric, &cfg)?;
    let echo = echo_task(&core1)?;
    core1.register(ECHO_ID, echo.mbx().clone())?;
    let server = core1.spawn_link(
        IPC_MSG_LINK_ID,
        "ipc_msg",
        DEFAULT_PRIORITY,
        Arc::new(IpcMsgServer::new(core1.clone(), &ch, fabric.doorbell(0)?)?),
    )?;
    let client = IpcMsgClient::new(core0.clone(), IPC_ACK_LINK_ID, &ch, fabric.doorbell(1)?)?
        .with_timeout(Duration::from_millis(100));

    assert_eq!(
        client.send(ECHO_ID, CMD_SLOW, &[], true).err(),
        Some(Status::Timeout)
    );
    // the reply to the abandoned request lands after the caller gave up
    assert!(wait_until(Duration::from_secs(5), || ch.rev.len() == 1));
    assert_eq!(client.send(ECHO_ID, CMD_DOUBLE, &[21], true)?, vec![42]);
    assert!(ch.rev.is_empty());

    drop(client);
    server.destroy();
    core1.unregister(ECHO_ID);
    echo.destroy();
    core0.shutdown();
    core1.shutdown();
    Ok(())
}

#[test]
#[serial]
fn test_remote_command_times_out() -> Result<(), Box<dyn Error>> {
    let cfg = RuntimeConfig::default();
    let fabric = fabric(&cfg)?;
    let core0 = LinkRuntime::new(0, cfg.clone());
    // core 1 has a doorbell but nothing serving it
    let _core1_bell = fabric.add_core(1)?;
    let ch = fabric.channel(ChannelId::new(0, 1, 1), cfg.ipc_msg_size, cfg.ipc_ring_elements)?;
    let client = IpcMsgClient::new(core0.clone(), IPC_ACK_LINK_ID, &ch, fabric.doorbell(1)?)?
        .with_retry(RetryPolicy::NONE)
        .with_timeout(Duration::from_millis(50));

    let start = Instant::now();
    assert_eq!(
        client.send(ECHO_ID, cmd::START, &[], true).err(),
        Some(Status::Timeout)
    );
    assert!(start.elapsed() >= Duration::from_millis(50));

    // the unserved request still occupies the ring
    assert_eq!(ch.fwd.len(), 1);
    for _ in 1..cfg.ipc_ring_elements {
        client.send(ECHO_ID, cmd::START, &[], false)?;
    }
    assert_eq!(
        client.send(ECHO_ID, cmd::START, &[], false).err(),
        Some(Status::RingFull)
    );
    Ok(())
}
