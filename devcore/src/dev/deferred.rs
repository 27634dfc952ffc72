//! Deferred probing.
//!
//! A device whose probe reports [DriverProbeError::Deferred](crate::dev::DriverProbeError)
//! waits on the pending list. Every successful bind triggers a sweep: the whole pending list is
//! spliced onto the active list under one lock and the single worker thread retries the active
//! devices one at a time. A device is on the pending list, the active list or neither.
//!
//! The mechanism stays disabled until [DeviceCore::deferred_probe_initcall] starts the worker,
//! runs the first sweep and waits for it to drain.
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::{
    collections::VecDeque,
    sync::{
        Weak,
        mpsc::{self, Receiver, Sender, SyncSender},
    },
    thread::{self, JoinHandle, ThreadId},
};

use log::{debug, info, warn};
use spin::Mutex;

use crate::{
    debug_ex,
    dev::{Device, DeviceCore},
    error::DevError,
    kobj::Handle,
};

enum WorkMsg {
    Run,
    Flush(SyncSender<()>),
    Exit,
}

struct Worker {
    tx: Sender<WorkMsg>,
    thread: Option<JoinHandle<()>>,
    id: ThreadId,
}

#[derive(Default)]
struct DeferredLists {
    pending: VecDeque<Handle<Device>>,
    active: VecDeque<Handle<Device>>,
}

fn position(list: &VecDeque<Handle<Device>>, dev: &Handle<Device>) -> Option<usize> {
    list.iter().position(|d| Handle::ptr_eq(d, dev))
}

#[derive(Default)]
pub struct DeferredProbe {
    lists: Mutex<DeferredLists>,
    /// Number of sweeps so far. Diagnostics only.
    trigger_count: AtomicUsize,
    enabled: AtomicBool,
    queued: AtomicBool,
    worker: Mutex<Option<Worker>>,
}

impl DeferredProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `dev` on the pending list unless it already waits on either list.
    pub fn add(&self, dev: &Handle<Device>) -> bool {
        let mut lists = self.lists.lock();
        if position(&lists.pending, dev).is_some() || position(&lists.active, dev).is_some() {
            return false;
        }
        debug!("Added {} to deferred list", dev.name());
        lists.pending.push_back(dev.clone());
        true
    }

    /// Take `dev` off whichever list holds it.
    pub fn remove(&self, dev: &Handle<Device>) -> bool {
        let mut lists = self.lists.lock();
        let removed = match position(&lists.pending, dev) {
            Some(pos) => lists.pending.remove(pos),
            None => position(&lists.active, dev).and_then(|pos| lists.active.remove(pos)),
        };
        if removed.is_some() {
            debug!("Removed {} from deferred list", dev.name());
        }
        removed.is_some()
    }

    pub fn contains(&self, dev: &Handle<Device>) -> bool {
        let lists = self.lists.lock();
        position(&lists.pending, dev).is_some() || position(&lists.active, dev).is_some()
    }

    pub fn pending_len(&self) -> usize {
        self.lists.lock().pending.len()
    }

    pub fn active_len(&self) -> usize {
        self.lists.lock().active.len()
    }

    pub fn trigger_count(&self) -> usize {
        self.trigger_count.load(Ordering::Relaxed)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    pub(crate) fn enable(&self) {
        self.enabled.store(true, Ordering::Release);
    }

    /// Move everything pending onto the active list. Returns `false` while disabled.
    fn splice(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        self.trigger_count.fetch_add(1, Ordering::Relaxed);
        let mut lists = self.lists.lock();
        let DeferredLists { pending, active } = &mut *lists;
        active.extend(pending.drain(..));
        true
    }

    /// Splice and schedule the worker.
    pub fn trigger(&self) {
        if self.splice() {
            self.queue_work();
        }
    }

    fn queue_work(&self) {
        if self.queued.swap(true, Ordering::AcqRel) {
            return;
        }
        let sent = self
            .worker
            .lock()
            .as_ref()
            .is_some_and(|worker| worker.tx.send(WorkMsg::Run).is_ok());
        if !sent {
            self.queued.store(false, Ordering::Release);
        }
    }

    fn pop_active(&self) -> Option<Handle<Device>> {
        self.lists.lock().active.pop_front()
    }

    fn on_worker(&self) -> bool {
        let current = thread::current().id();
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|worker| worker.id == current)
    }

    /// Block until all work queued so far has run. A no-op on the worker itself.
    pub fn flush(&self) {
        if self.on_worker() {
            return;
        }
        let (ack_tx, ack_rx) = mpsc::sync_channel(1);
        let sent = self
            .worker
            .lock()
            .as_ref()
            .is_some_and(|worker| worker.tx.send(WorkMsg::Flush(ack_tx)).is_ok());
        if sent && ack_rx.recv().is_err() {
            warn!("deferred probe worker exited during flush");
        }
    }

    fn start(&self, core: Weak<DeviceCore>, name: &str) -> Result<(), DevError> {
        let mut worker = self.worker.lock();
        if worker.is_some() {
            return Ok(());
        }
        let (tx, rx) = mpsc::channel();
        let thread = thread::Builder::new()
            .name(String::from(name))
            .spawn(move || worker_main(core, rx))
            .map_err(DevError::Worker)?;
        *worker = Some(Worker {
            tx,
            id: thread.thread().id(),
            thread: Some(thread),
        });
        info!("deferred probe worker '{}' started", name);
        Ok(())
    }

    /// Stop the worker. Joins it unless called from the worker itself.
    pub(crate) fn shutdown(&self) {
        self.enabled.store(false, Ordering::Release);
        let Some(mut worker) = self.worker.lock().take() else {
            return;
        };
        let _ = worker.tx.send(WorkMsg::Exit);
        if worker.id == thread::current().id() {
            return;
        }
        if let Some(thread) = worker.thread.take() {
            if thread.join().is_err() {
                warn!("deferred probe worker panicked");
            }
        }
    }
}

fn worker_main(core: Weak<DeviceCore>, rx: Receiver<WorkMsg>) {
    for msg in rx {
        match msg {
            WorkMsg::Run => {
                let Some(core) = core.upgrade() else {
                    break;
                };
                core.deferred.queued.store(false, Ordering::Release);
                core.deferred_probe_work();
            }
            WorkMsg::Flush(ack) => {
                let _ = ack.send(());
            }
            WorkMsg::Exit => break,
        }
    }
    debug_ex!("deferred probe worker exiting");
}

impl DeviceCore {
    /// Retry every device on the active list, one at a time.
    pub(crate) fn deferred_probe_work(&self) {
        while let Some(dev) = self.deferred.pop_active() {
            debug!("deferred_probe_work: probing {}", dev.name());
            self.bus_probe_device(&dev);
        }
    }

    pub fn driver_deferred_probe_add(&self, dev: &Handle<Device>) {
        self.deferred.add(dev);
    }

    pub fn driver_deferred_probe_del(&self, dev: &Handle<Device>) {
        self.deferred.remove(dev);
    }

    /// Start a sweep of every deferred device.
    pub fn driver_deferred_probe_trigger(&self) {
        self.deferred.trigger();
    }

    /// Enable deferred probing, run one sweep and wait for it to drain.
    pub fn deferred_probe_initcall(&self) -> Result<(), DevError> {
        self.deferred
            .start(self.me.clone(), &self.config().deferred_worker_name)?;
        self.deferred.enable();
        self.deferred.trigger();
        self.deferred.flush();
        Ok(())
    }

    pub fn deferred(&self) -> &DeferredProbe {
        &self.deferred
    }
}
