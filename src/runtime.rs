// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

//! Per-core runtime context.
//!
//! A [`LinkRuntime`] owns everything a core's links share: the message
//! pool, the registry mapping link ids to mailboxes, a host mailbox used
//! for send-and-wait calls made from outside any task, and the thread that
//! turns cross-core doorbells into `NOTIFY` commands. Pipelines hold an
//! `Arc<LinkRuntime>` and tear it down explicitly with
//! [`LinkRuntime::shutdown`] (or by dropping the last reference).

use crate::{
    cmd,
    config::RuntimeConfig,
    ipc::notify::NotifyEvent,
    link::{Link, LinkObj},
    mbx::Mailbox,
    msg::{Msg, MsgFlags, MsgPool, Prm},
    status::Status,
    task::{Task, TaskCtx, TaskHandler},
};
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
    thread::{self, JoinHandle},
    time::Duration,
};
use tracing::{debug, error, info_span, trace, warn};

/// Interval at which the dispatcher retries a `NOTIFY` that was not queued.
const NOTIFY_RETRY: Duration = Duration::from_millis(1);

/// Link id to mailbox table.
#[derive(Default)]
pub struct Registry {
    links: Mutex<HashMap<u32, Arc<Mailbox>>>,
}

impl Registry {
    fn insert(&self, link_id: u32, mbx: Arc<Mailbox>) -> Result<(), Status> {
        let mut links = self.links.lock().unwrap_or_else(PoisonError::into_inner);
        if links.contains_key(&link_id) {
            warn!("link {} already registered", link_id);
            return Err(Status::InvalidArgument);
        }
        links.insert(link_id, mbx);
        Ok(())
    }

    pub(crate) fn remove(&self, link_id: u32) -> Option<Arc<Mailbox>> {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&link_id)
    }

    fn get(&self, link_id: u32) -> Option<Arc<Mailbox>> {
        self.links
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&link_id)
            .cloned()
    }

    fn len(&self) -> usize {
        self.links.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

struct NotifyDispatch {
    rx: kanal::Receiver<NotifyEvent>,
    thread: JoinHandle<()>,
}

pub struct LinkRuntime {
    core_id: u16,
    cfg: RuntimeConfig,
    pool: Arc<MsgPool>,
    host: Mailbox,
    registry: Arc<Registry>,
    notify: Mutex<Option<NotifyDispatch>>,
    notify_deferred: Arc<AtomicU64>,
}

impl LinkRuntime {
    pub fn new(core_id: u16, cfg: RuntimeConfig) -> Arc<Self> {
        let pool = MsgPool::new(cfg.msg_pool_size);
        let host = Mailbox::new(&format!("host{}", core_id), pool.clone(), &cfg);
        debug!(
            "core {}: runtime up, {} messages",
            core_id, cfg.msg_pool_size
        );
        Arc::new(Self {
            core_id,
            cfg,
            pool,
            host,
            registry: Arc::new(Registry::default()),
            notify: Mutex::new(None),
            notify_deferred: Arc::new(AtomicU64::new(0)),
        })
    }

    pub fn core_id(&self) -> u16 {
        self.core_id
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.cfg
    }

    pub fn msg_pool(&self) -> &Arc<MsgPool> {
        &self.pool
    }

    pub fn free_msg_count(&self) -> usize {
        self.pool.free_count()
    }

    /// Mailbox for callers that are not tasks themselves.
    pub fn host(&self) -> &Mailbox {
        &self.host
    }

    pub fn create_mailbox(&self, name: &str) -> Arc<Mailbox> {
        Arc::new(Mailbox::new(name, self.pool.clone(), &self.cfg))
    }

    /// Creates a task with its own mailbox and the configured stack size.
    pub fn create_task<H: TaskHandler>(
        &self,
        name: &str,
        handler: H,
        priority: i32,
    ) -> Result<Task, Status> {
        self.create_task_with_stack(name, handler, priority, self.cfg.task_stack_size)
    }

    pub fn create_task_with_stack<H: TaskHandler>(
        &self,
        name: &str,
        handler: H,
        priority: i32,
        stack_size: usize,
    ) -> Result<Task, Status> {
        Task::create(name, self.create_mailbox(name), handler, priority, stack_size).map_err(|e| {
            error!("core {}: cannot create task {}: {}", self.core_id, name, e);
            Status::Fail
        })
    }

    pub fn destroy_task(&self, task: Task) {
        task.destroy();
    }

    pub fn register(&self, link_id: u32, mbx: Arc<Mailbox>) -> Result<(), Status> {
        self.registry.insert(link_id, mbx)
    }

    pub fn unregister(&self, link_id: u32) -> Option<Arc<Mailbox>> {
        self.registry.remove(link_id)
    }

    pub fn mailbox(&self, link_id: u32) -> Option<Arc<Mailbox>> {
        self.registry.get(link_id)
    }

    pub fn num_links(&self) -> usize {
        self.registry.len()
    }

    /// Doorbells whose `NOTIFY` could not be queued at once and was retried.
    pub fn notify_deferred(&self) -> u64 {
        self.notify_deferred.load(Ordering::Relaxed)
    }

    /// Sends `cmd` to a registered link, optionally waiting for its result.
    pub fn link_control(
        &self,
        link_id: u32,
        cmd: u32,
        prm: Option<Prm>,
        wait: bool,
    ) -> Result<Option<Prm>, Status> {
        let Some(to) = self.registry.get(link_id) else {
            warn!("core {}: no link {}", self.core_id, link_id);
            return Err(Status::InvalidArgument);
        };
        let flags = if wait {
            MsgFlags::WAIT_ACK
        } else {
            MsgFlags::NONE
        };
        Mailbox::send(Some(&self.host), &to, cmd, prm, flags)
    }

    /// Starts a task running `obj` and registers it under `link_id`.
    pub fn spawn_link<T: LinkObj>(
        &self,
        link_id: u32,
        name: &str,
        priority: i32,
        obj: Arc<T>,
    ) -> Result<Link<T>, Status> {
        let handler_obj = obj.clone();
        let task = self.create_task(
            name,
            move |ctx: &TaskCtx, msg: &mut Msg| -> Result<(), Status> {
                handler_obj.handle(ctx, msg)
            },
            priority,
        )?;
        if let Err(e) = self.register(link_id, task.mbx().clone()) {
            task.destroy();
            return Err(e);
        }
        Ok(Link::new(link_id, obj, task, self.registry.clone()))
    }

    /// Starts delivering doorbells from `rx` as `NOTIFY` to the addressed
    /// local link.
    pub fn start_notify(&self, rx: kanal::Receiver<NotifyEvent>) -> Result<(), Status> {
        let mut notify = self.notify.lock().unwrap_or_else(PoisonError::into_inner);
        if notify.is_some() {
            return Err(Status::InvalidArgument);
        }
        let registry = self.registry.clone();
        let deferred = self.notify_deferred.clone();
        let core_id = self.core_id;
        let thread_rx = rx.clone();
        let thread = thread::Builder::new()
            .name(format!("notify{}", core_id))
            .spawn(move || notify_loop(core_id, registry, thread_rx, deferred))
            .map_err(|e| {
                error!("core {}: cannot start notify thread: {}", core_id, e);
                Status::Fail
            })?;
        *notify = Some(NotifyDispatch { rx, thread });
        Ok(())
    }

    /// Stops the notify dispatcher. Links are torn down by their owners.
    pub fn shutdown(&self) {
        let dispatch = self
            .notify
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(d) = dispatch {
            let _ = d.rx.close();
            if d.thread.join().is_err() {
                error!("core {}: notify thread panicked", self.core_id);
            }
        }
        let left = self.registry.len();
        if left > 0 {
            warn!("core {}: {} link(s) still registered", self.core_id, left);
        }
        debug!("core {}: runtime down", self.core_id);
    }
}

impl Drop for LinkRuntime {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn notify_loop(
    core_id: u16,
    registry: Arc<Registry>,
    rx: kanal::Receiver<NotifyEvent>,
    deferred: Arc<AtomicU64>,
) {
    let span = info_span!("notify", core = core_id);
    let _guard = span.enter();
    // links whose NOTIFY is still owed
    let mut owed: Vec<u32> = Vec::new();
    loop {
        let ev = if owed.is_empty() {
            match rx.recv() {
                Ok(ev) => Some(ev),
                Err(_) => break,
            }
        } else {
            match rx.recv_timeout(NOTIFY_RETRY) {
                Ok(ev) => Some(ev),
                Err(kanal::ReceiveErrorTimeout::Timeout) => None,
                Err(_) => break,
            }
        };
        if let Some(ev) = ev {
            if !owed.contains(&ev.link_id) && !deliver(&registry, ev) {
                deferred.fetch_add(1, Ordering::Relaxed);
                owed.push(ev.link_id);
            }
        }
        owed.retain(|&link_id| {
            !deliver(
                &registry,
                NotifyEvent {
                    src_core: core_id,
                    link_id,
                },
            )
        });
    }
    if !owed.is_empty() {
        warn!("{} NOTIFY(s) undelivered at exit", owed.len());
    }
    debug!("notify dispatcher exited");
}

/// Queues `NOTIFY` for the addressed link. False if it should be retried.
fn deliver(registry: &Registry, ev: NotifyEvent) -> bool {
    let Some(mbx) = registry.get(ev.link_id) else {
        warn!("doorbell from core {} for unknown link {}", ev.src_core, ev.link_id);
        return true;
    };
    match mbx.send_cmd(cmd::NOTIFY, None) {
        Ok(()) => true,
        Err(e @ (Status::NoMessages | Status::QueueFull)) => {
            trace!("NOTIFY to {} deferred: {}", mbx.name(), e);
            false
        }
        Err(e) => {
            debug!("NOTIFY to {} dropped: {}", mbx.name(), e);
            true
        }
    }
}
