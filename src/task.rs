// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Message-driven tasks.
//!
//! Every [`Task`] is one OS thread bound to one [`Mailbox`]. The thread
//! blocks in `recv`, runs the handler for the message to completion and
//! then acknowledges it, so two handlers of the same task never run
//! concurrently. Teardown goes through the mailbox as well: [`Task::destroy`]
//! queues the reserved [`cmd::EXIT`] command behind whatever is already
//! pending, waits for the thread to finish, closes the mailbox and fails
//! any message that arrived too late so no sender is left waiting.

use crate::{
    cmd,
    mbx::Mailbox,
    msg::{Msg, MsgFlags, Prm},
    status::{Status, Timeout},
};
use std::{
    io,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info_span, warn};

/// Default task priority. Higher values are more urgent.
pub const DEFAULT_PRIORITY: i32 = 8;

/// Work performed for each message delivered to a task.
pub trait TaskHandler: Send + 'static {
    fn handle(&mut self, ctx: &TaskCtx, msg: &mut Msg) -> Result<(), Status>;
}

impl<F> TaskHandler for F
where
    F: FnMut(&TaskCtx, &mut Msg) -> Result<(), Status> + Send + 'static,
{
    fn handle(&mut self, ctx: &TaskCtx, msg: &mut Msg) -> Result<(), Status> {
        self(ctx, msg)
    }
}

/// State shared between a task's thread and its owner.
pub struct TaskCtx {
    name: String,
    mbx: Arc<Mailbox>,
    priority: AtomicI32,
    tid: AtomicI32,
}

impl TaskCtx {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn mbx(&self) -> &Arc<Mailbox> {
        &self.mbx
    }

    pub fn priority(&self) -> i32 {
        self.priority.load(Ordering::Relaxed)
    }

    /// Sends from this task's mailbox, so `WAIT_ACK` uses its ack slots.
    pub fn send(
        &self,
        to: &Mailbox,
        cmd: u32,
        prm: Option<Prm>,
        flags: MsgFlags,
    ) -> Result<Option<Prm>, Status> {
        Mailbox::send(Some(&*self.mbx), to, cmd, prm, flags)
    }
}

pub struct Task {
    ctx: Arc<TaskCtx>,
    thread: Option<JoinHandle<()>>,
}

impl Task {
    /// Spawns the task thread.
    ///
    /// # Errors
    ///
    /// Returns an error if the OS refuses to create the thread.
    pub fn create<H: TaskHandler>(
        name: &str,
        mbx: Arc<Mailbox>,
        handler: H,
        priority: i32,
        stack_size: usize,
    ) -> io::Result<Task> {
        let ctx = Arc::new(TaskCtx {
            name: name.to_owned(),
            mbx,
            priority: AtomicI32::new(priority),
            tid: AtomicI32::new(0),
        });
        let thread_ctx = ctx.clone();
        let thread = thread::Builder::new()
            .name(name.to_owned())
            .stack_size(stack_size)
            .spawn(move || dispatch(thread_ctx, handler))?;
        debug!("task {} created (priority {})", name, priority);
        Ok(Task {
            ctx,
            thread: Some(thread),
        })
    }

    pub fn ctx(&self) -> &Arc<TaskCtx> {
        &self.ctx
    }

    pub fn name(&self) -> &str {
        &self.ctx.name
    }

    pub fn mbx(&self) -> &Arc<Mailbox> {
        &self.ctx.mbx
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Changes the task priority. Takes effect immediately when the OS
    /// allows it; otherwise the value is recorded and a warning logged.
    pub fn set_priority(&self, priority: i32) -> Result<(), Status> {
        if !self.is_running() {
            return Err(Status::Fail);
        }
        self.ctx.priority.store(priority, Ordering::Relaxed);
        let tid = self.ctx.tid.load(Ordering::Acquire);
        if tid != 0 {
            apply_priority(&self.ctx.name, tid, priority);
        }
        Ok(())
    }

    /// Stops the task through its mailbox and reclaims the thread.
    ///
    /// Must not be called from the task's own thread.
    pub fn destroy(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        let Some(thread) = self.thread.take() else {
            return;
        };
        let mut warned = false;
        loop {
            match self.ctx.mbx.send_cmd(cmd::EXIT, None) {
                Ok(()) => break,
                Err(e) if thread.is_finished() => {
                    debug!("{}: thread already gone ({})", self.ctx.name, e);
                    break;
                }
                Err(e) => {
                    if !warned {
                        warn!("{}: EXIT delayed: {}", self.ctx.name, e);
                        warned = true;
                    }
                    thread::sleep(Duration::from_millis(1));
                }
            }
        }
        if thread.join().is_err() {
            error!("{}: handler panicked", self.ctx.name);
        }
        self.ctx.mbx.close();
        let late = self.ctx.mbx.drain(Err(Status::Fail));
        if late > 0 {
            warn!("{}: failed {} message(s) queued after EXIT", self.ctx.name, late);
        }
        debug!("task {} deleted", self.ctx.name);
    }
}

impl Drop for Task {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn dispatch<H: TaskHandler>(ctx: Arc<TaskCtx>, mut handler: H) {
    let span = info_span!("task", name = %ctx.name);
    let _guard = span.enter();

    let tid = current_tid();
    ctx.tid.store(tid, Ordering::Release);
    let priority = ctx.priority();
    if priority != DEFAULT_PRIORITY {
        apply_priority(&ctx.name, tid, priority);
    }

    loop {
        let mut msg = match ctx.mbx.recv(Timeout::Forever) {
            Ok(m) => m,
            Err(e) => {
                error!("recv failed: {}", e);
                break;
            }
        };
        if msg.cmd() == cmd::EXIT {
            let _ = msg.ack_or_free(Ok(()));
            break;
        }
        let res = handler.handle(&ctx, &mut msg);
        if let Err(e) = msg.ack_or_free(res) {
            warn!("ack failed: {}", e);
        }
    }
    debug!("dispatch loop exited");
}

#[cfg(target_os = "linux")]
fn current_tid() -> i32 {
    unsafe { libc::syscall(libc::SYS_gettid) as i32 }
}

#[cfg(not(target_os = "linux"))]
fn current_tid() -> i32 {
    0
}

/// Maps a task priority onto the thread's nice value.
fn nice_for(priority: i32) -> i32 {
    (DEFAULT_PRIORITY - priority).clamp(-20, 19)
}

#[cfg(target_os = "linux")]
fn apply_priority(name: &str, tid: i32, priority: i32) {
    let nice = nice_for(priority);
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, nice) };
    if ret != 0 {
        warn!(
            "{}: cannot set nice {}: {}",
            name,
            nice,
            io::Error::last_os_error()
        );
    }
}

#[cfg(not(target_os = "linux"))]
fn apply_priority(name: &str, _tid: i32, priority: i32) {
    debug!("{}: priority {} recorded only", name, nice_for(priority));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{config::RuntimeConfig, msg::MsgPool};
    use std::sync::Mutex;

    fn mailbox(pool: &Arc<MsgPool>, name: &str) -> Arc<Mailbox> {
        Arc::new(Mailbox::new(name, pool.clone(), &RuntimeConfig::default()))
    }

    #[test]
    fn handler_sees_messages_in_order() {
        let pool = MsgPool::new(16);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = seen.clone();
        let task = Task::create(
            "order",
            mailbox(&pool, "order"),
            move |_: &TaskCtx, msg: &mut Msg| -> Result<(), Status> {
                seen2.lock().unwrap().push(msg.cmd());
                Ok(())
            },
            DEFAULT_PRIORITY,
            64 * 1024,
        )
        .unwrap();
        for c in 1..=5 {
            task.mbx().send_cmd(c, None).unwrap();
        }
        task.destroy();
        assert_eq!(*seen.lock().unwrap(), vec![1, 2, 3, 4, 5]);
        assert_eq!(pool.free_count(), 16);
    }

    #[test]
    fn handler_result_reaches_waiting_sender() {
        let pool = MsgPool::new(8);
        let task = Task::create(
            "echo",
            mailbox(&pool, "echo"),
            |_: &TaskCtx, msg: &mut Msg| -> Result<(), Status> {
                match msg.cmd() {
                    1 => Ok(()),
                    _ => Err(Status::InvalidArgument),
                }
            },
            DEFAULT_PRIORITY,
            64 * 1024,
        )
        .unwrap();
        let host = mailbox(&pool, "host");
        assert!(Mailbox::send(Some(&*host), task.mbx(), 1, None, MsgFlags::WAIT_ACK).is_ok());
        assert_eq!(
            Mailbox::send(Some(&*host), task.mbx(), 2, None, MsgFlags::WAIT_ACK).unwrap_err(),
            Status::InvalidArgument
        );
        drop(task);
        assert_eq!(pool.free_count(), 8);
    }

    #[test]
    fn nice_mapping_is_clamped() {
        assert_eq!(nice_for(DEFAULT_PRIORITY), 0);
        assert_eq!(nice_for(DEFAULT_PRIORITY - 3), 3);
        assert_eq!(nice_for(-100), 19);
        assert_eq!(nice_for(100), -20);
    }
}
