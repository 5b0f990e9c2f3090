// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_link::{
    cmd::{self, Control},
    config::RuntimeConfig,
    links::{dup::CTRL_SET_OUTPUT_ACTIVE, DupLink, NullLink, NullSrc, NullSrcParams},
    runtime::LinkRuntime,
    task::DEFAULT_PRIORITY,
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
const DUP_ID: u32 = 2;
const SINK_BASE_ID: u32 = 10;
const FRAMES: u64 = 40;
const POOL: u32 = 4;

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

/// Runs src -> dup -> one sink per entry of `active` and returns what each
/// sink consumed.
fn run_fanout(active: &[bool]) -> Result<Vec<u64>, Box<dyn Error>> {
    let cfg = RuntimeConfig::default();
    let rt = LinkRuntime::new(0, cfg.clone());
    let baseline = rt.free_msg_count();

    let params = NullSrcParams {
        num_buffers: POOL,
        buffer_size: 64 * 1024,
        fps: 400,
        max_frames: FRAMES,
        ..Default::default()
    };
    let src = Arc::new(NullSrc::new("src", params, &cfg)?);
    let dup = Arc::new(DupLink::new("dup", src.clone(), 0, active.len(), &cfg)?);
    let mut sinks = Vec::new();
    for i in 0..active.len() {
        let name = format!("sink{}", i);
        let sink = rt.spawn_link(
            SINK_BASE_ID + i as u32,
            &name,
            DEFAULT_PRIORITY,
            Arc::new(NullLink::new(&name, dup.clone(), i, cfg.max_buffers_in_list)),
        )?;
        dup.set_next(i, sink.mbx())?;
        sinks.push(sink);
    }
    let dup = rt.spawn_link(DUP_ID, "dup", DEFAULT_PRIORITY + 1, dup)?;
    let src = rt.spawn_link(SRC_ID, "src", DEFAULT_PRIORITY + 2, src)?;
    src.obj().set_next(dup.mbx());
    assert_eq!(rt.num_links(), active.len() + 2);

    for (i, &on) in active.iter().enumerate() {
        if !on {
            let ctl = Control::new(CTRL_SET_OUTPUT_ACTIVE, Some(Box::new((i, false))));
            rt.link_control(DUP_ID, cmd::CONTROL, Some(Box::new(ctl)), true)?;
        }
    }
    let bad = Control::new(CTRL_SET_OUTPUT_ACTIVE, Some(Box::new((active.len(), false))));
    assert_eq!(
        rt.link_control(DUP_ID, cmd::CONTROL, Some(Box::new(bad)), true)
            .err(),
        Some(Status::InvalidArgument)
    );

    rt.link_control(SRC_ID, cmd::START, None, true)?;
    assert!(wait_until(Duration::from_secs(10), || src.obj().is_done()));
    rt.link_control(SRC_ID, cmd::STOP, None, true)?;
    assert!(wait_until(Duration::from_secs(5), || src.obj().idle()
        == POOL as usize));

    let frames = src.obj().frames();
    assert_eq!(frames, FRAMES);
    assert_eq!(dup.obj().tracked(), 0);
    let d = dup.obj().stats().snapshot();
    println!("dup: {:?}", d);
    assert_eq!(d.recv, frames);
    assert_eq!(d.forwarded + d.dropped, d.recv);
    assert_eq!(d.released, d.forwarded);

    let consumed: Vec<u64> = sinks
        .iter()
        .map(|s| s.obj().stats().snapshot().recv)
        .collect();
    for s in &sinks {
        rt.link_control(s.id(), cmd::PRINT_STATISTICS, None, true)?;
    }

    src.destroy();
    dup.destroy();
    for s in sinks {
        s.destroy();
    }
    assert_eq!(rt.num_links(), 0);
    assert_eq!(rt.free_msg_count(), baseline);
    rt.shutdown();
    Ok(consumed)
}

#[test]
#[serial]
fn test_fanout_every_output_sees_every_frame() -> Result<(), Box<dyn Error>> {
    let consumed = run_fanout(&[true, true, true])?;
    println!("consumed: {:?}", consumed);
    assert_eq!(consumed, vec![FRAMES; 3]);
    Ok(())
}

#[test]
#[serial]
fn test_fanout_inactive_output_is_skipped() -> Result<(), Box<dyn Error>> {
    let consumed = run_fanout(&[true, false, true])?;
    println!("consumed: {:?}", consumed);
    assert_eq!(consumed, vec![FRAMES, 0, FRAMES]);
    Ok(())
}

#[test]
#[serial]
fn test_control_of_unknown_link() -> Result<(), Box<dyn Error>> {
    let rt = LinkRuntime::new(0, RuntimeConfig::default());
    assert_eq!(
        rt.link_control(99, cmd::START, None, true).err(),
        Some(Status::InvalidArgument)
    );
    let cfg = rt.config().clone();
    let src = Arc::new(NullSrc::new("src", NullSrcParams::default(), &cfg)?);
    let link = rt.spawn_link(SRC_ID, "src", DEFAULT_PRIORITY, src.clone())?;
    assert_eq!(
        rt.spawn_link(SRC_ID, "again", DEFAULT_PRIORITY, src).err(),
        Some(Status::InvalidArgument)
    );
    assert_eq!(rt.num_links(), 1);
    link.destroy();
    assert!(rt.mailbox(SRC_ID).is_none());
    Ok(())
}
