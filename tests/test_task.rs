// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_link::{
    config::RuntimeConfig,
    mbx::Mailbox,
    msg::{Msg, MsgFlags},
    runtime::LinkRuntime,
    task::{TaskCtx, DEFAULT_PRIORITY},
    Status,
};
use serial_test::serial;
use std::{
    error::Error,
    sync::{Arc, Barrier},
    thread,
    time::{Duration, Instant},
};

const CMD_BLOCK: u32 = 0x1000;
const CMD_DOUBLE: u32 = 0x1001;

fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while !cond() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

#[test]
#[serial]
fn test_destroy_fails_late_senders() -> Result<(), Box<dyn Error>> {
    let rt = LinkRuntime::new(0, RuntimeConfig::default());
    let baseline = rt.free_msg_count();

    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let (e, r) = (entered.clone(), release.clone());
    let task = rt.create_task(
        "blocked",
        move |_: &TaskCtx, msg: &mut Msg| -> Result<(), Status> {
            if msg.cmd() == CMD_BLOCK {
                e.wait();
                r.wait();
            }
            Ok(())
        },
        DEFAULT_PRIORITY,
    )?;
    let mbx = task.mbx().clone();
    mbx.send_cmd(CMD_BLOCK, None)?;
    entered.wait();

    let result = thread::scope(|s| {
        let destroyer = s.spawn(move || task.destroy());
        assert!(wait_until(Duration::from_secs(5), || mbx.pending() == 1));

        let waiter = s.spawn(|| {
            let from = rt.create_mailbox("waiter");
            Mailbox::send(Some(&*from), &mbx, CMD_DOUBLE, None, MsgFlags::WAIT_ACK)
        });
        assert!(wait_until(Duration::from_secs(5), || mbx.pending() == 2));
        release.wait();

        let _ = destroyer.join();
        waiter.join().map(|r| r.err())
    });
    println!("late sender got {:?}", result);
    assert_eq!(result.ok().flatten(), Some(Status::Fail));
    assert_eq!(rt.free_msg_count(), baseline);
    Ok(())
}

#[test]
#[serial]
fn test_concurrent_senders_get_their_own_ack() -> Result<(), Box<dyn Error>> {
    let rt = LinkRuntime::new(0, RuntimeConfig::default());
    let baseline = rt.free_msg_count();
    let task = rt.create_task(
        "double",
        |_: &TaskCtx, msg: &mut Msg| -> Result<(), Status> {
            let v = msg.prm_mut::<u32>().ok_or(Status::InvalidArgument)?;
            *v *= 2;
            Ok(())
        },
        DEFAULT_PRIORITY,
    )?;

    thread::scope(|s| {
        for sender in 0..4u32 {
            let rt = &rt;
            let to = task.mbx().clone();
            s.spawn(move || {
                let from = rt.create_mailbox(&format!("sender{}", sender));
                for i in 0..200u32 {
                    let v = sender * 1000 + i;
                    let reply = Mailbox::send(
                        Some(&*from),
                        &to,
                        CMD_DOUBLE,
                        Some(Box::new(v)),
                        MsgFlags::WAIT_ACK,
                    )
                    .expect("ack");
                    let got = reply.and_then(|p| p.downcast::<u32>().ok()).map(|b| *b);
                    assert_eq!(got, Some(v * 2));
                }
            });
        }
    });

    // a parameter of the wrong type comes back as the handler's error
    let err = Mailbox::send(
        Some(rt.host()),
        task.mbx(),
        CMD_DOUBLE,
        Some(Box::new("text")),
        MsgFlags::WAIT_ACK,
    )
    .err();
    assert_eq!(err, Some(Status::InvalidArgument));

    task.destroy();
    assert_eq!(rt.free_msg_count(), baseline);
    Ok(())
}

#[test]
#[serial]
fn test_pool_exhaustion() -> Result<(), Box<dyn Error>> {
    let cfg = RuntimeConfig {
        msg_pool_size: 2,
        ..Default::default()
    };
    let rt = LinkRuntime::new(0, cfg);
    let entered = Arc::new(Barrier::new(2));
    let release = Arc::new(Barrier::new(2));
    let (e, r) = (entered.clone(), release.clone());
    let task = rt.create_task(
        "slow",
        move |_: &TaskCtx, msg: &mut Msg| -> Result<(), Status> {
            if msg.cmd() == CMD_BLOCK {
                e.wait();
                r.wait();
            }
            Ok(())
        },
        DEFAULT_PRIORITY,
    )?;

    task.mbx().send_cmd(CMD_BLOCK, None)?;
    entered.wait();
    task.mbx().send_cmd(CMD_DOUBLE, None)?;
    assert_eq!(rt.free_msg_count(), 0);
    assert_eq!(
        task.mbx().send_cmd(CMD_DOUBLE, None).err(),
        Some(Status::NoMessages)
    );

    release.wait();
    assert!(wait_until(Duration::from_secs(5), || rt.free_msg_count() == 2));
    rt.destroy_task(task);
    assert_eq!(rt.free_msg_count(), 2);
    Ok(())
}

#[test]
#[serial]
fn test_destroyed_task_refuses_new_messages() -> Result<(), Box<dyn Error>> {
    let rt = LinkRuntime::new(0, RuntimeConfig::default());
    let baseline = rt.free_msg_count();
    let task = rt.create_task(
        "gone",
        |_: &TaskCtx, _: &mut Msg| -> Result<(), Status> { Ok(()) },
        DEFAULT_PRIORITY,
    )?;
    // a neighbour still holding the mailbox after teardown
    let mbx = task.mbx().clone();
    task.destroy();
    assert!(mbx.is_closed());

    assert_eq!(mbx.send_cmd(CMD_DOUBLE, None).err(), Some(Status::Fail));
    assert_eq!(rt.free_msg_count(), baseline);

    let start = Instant::now();
    let waiter = thread::spawn({
        let rt = rt.clone();
        let mbx = mbx.clone();
        move || {
            let from = rt.create_mailbox("waiter");
            Mailbox::send(Some(&*from), &mbx, CMD_DOUBLE, None, MsgFlags::WAIT_ACK).err()
        }
    });
    let result = waiter.join().map_err(|_| "waiter panicked")?;
    println!("send to destroyed task: {:?} after {:?}", result, start.elapsed());
    assert_eq!(result, Some(Status::Fail));
    assert!(start.elapsed() < Duration::from_secs(1));
    assert_eq!(mbx.pending(), 0);
    assert_eq!(rt.free_msg_count(), baseline);
    Ok(())
}
