//! The helper task: one loop multiplexing every watched port.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Exactly one helper runs at a time. It owns a local array of watched
//! ports (one strong reference each) and blocks in [`multi_wait`] over
//! their handles plus a wakeup event in slot 0. Registry changes reach it
//! in one of two ways: another task sets the wakeup event, or a dirty
//! flag is set when the registry call happened *on* the helper task
//! itself (say, admitting a client it just accepted), since the helper
//! must not wait on its own wakeup. Either way the watched set is
//! reconciled before the next wait.
//!
//! At process exit the helper can be handed the process: as long as any
//! watched port carries `KEEPALIVE` it keeps serving, and when the last
//! one goes away it finalizes and fires the shutdown hook.

use crate::callback::CallbackTable;
use crate::pal::{multi_wait, PalEvent, PalHandle, Waitable};
use crate::port::{IpcPort, RoleMask};
use crate::receive::{receive_on_port, ReceiveEnv};
use crate::registry::PortRegistry;
use crate::{errno, Dupe};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Lifecycle of the helper task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum HelperState {
    /// Before `init_helper`; restart requests park in `Delayed`.
    Uninitialized = 0,
    /// A restart was requested before init; creation happens at init.
    Delayed = 1,
    /// No helper task exists.
    NotAlive = 2,
    /// The helper loop is running.
    Alive = 3,
    /// The process wants to exit but keepalive ports remain; the helper
    /// runs on and finalizes the process itself.
    HandedOver = 4,
}

impl HelperState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Uninitialized,
            1 => Self::Delayed,
            2 => Self::NotAlive,
            3 => Self::Alive,
            4 => Self::HandedOver,
            _ => unreachable!("invalid helper state"),
        }
    }
}

/// What the helper needs from the rest of the fabric. The registry link is
/// weak: the registry itself points back here for restart requests.
#[derive(Clone)]
pub(crate) struct HelperContext {
    pub(crate) self_id: u32,
    pub(crate) registry: Weak<PortRegistry>,
    pub(crate) handlers: Arc<CallbackTable>,
}

/// State shared between the helper task, the registry, and the manager.
pub(crate) struct HelperShared {
    state: AtomicU8,
    /// Slot 0 of the helper's wait set.
    pub(crate) wakeup: PalEvent,
    /// Self-notification: set instead of the event when the caller *is*
    /// the helper, which must not wait on its own wakeup.
    dirty: AtomicBool,
    /// Serializes state transitions, in particular creation races.
    state_lock: Mutex<()>,
    task_id: Mutex<Option<tokio::task::Id>>,
    /// Liveness token of the current helper run. Cleared on terminate, so
    /// a draining helper cannot confuse itself with a successor spawned
    /// right after.
    run_alive: Mutex<Option<Arc<AtomicBool>>>,
    join: Mutex<Option<JoinHandle<()>>>,
    ctx: Mutex<Option<HelperContext>>,
    shutdown_hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl std::fmt::Debug for HelperShared {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HelperShared")
            .field("state", &self.state())
            .field("dirty", &self.dirty.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl HelperShared {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(HelperState::Uninitialized as u8),
            wakeup: PalEvent::new(),
            dirty: AtomicBool::new(false),
            state_lock: Mutex::new(()),
            task_id: Mutex::new(None),
            run_alive: Mutex::new(None),
            join: Mutex::new(None),
            ctx: Mutex::new(None),
            shutdown_hook: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> HelperState {
        HelperState::from_u8(self.state.load(Ordering::Relaxed))
    }

    fn set_state(&self, state: HelperState) {
        self.state.store(state as u8, Ordering::Relaxed);
    }

    pub(crate) fn install_context(&self, ctx: HelperContext) {
        *self.ctx.lock() = Some(ctx);
    }

    pub(crate) fn set_shutdown_hook(&self, hook: Box<dyn FnOnce() + Send>) {
        *self.shutdown_hook.lock() = Some(hook);
    }

    fn is_helper_task(&self) -> bool {
        let current = tokio::task::try_id();
        current.is_some() && current == *self.task_id.lock()
    }

    fn take_dirty(&self) -> bool {
        self.dirty.swap(false, Ordering::Relaxed)
    }

    /// The registry's notification hook: the watched set needs to change.
    pub(crate) fn request_restart(self: &Arc<Self>, need_create: bool) {
        let _transition = self.state_lock.lock();
        match self.state() {
            HelperState::Uninitialized => self.set_state(HelperState::Delayed),
            HelperState::Delayed => {}
            HelperState::NotAlive => {
                if need_create {
                    self.spawn_locked();
                }
            }
            HelperState::Alive => {
                if self.is_helper_task() {
                    self.dirty.store(true, Ordering::Relaxed);
                } else {
                    self.wakeup.set();
                }
            }
            HelperState::HandedOver => self.dirty.store(true, Ordering::Relaxed),
        }
    }

    /// Honor a deferred creation request, or just arm the state machine.
    pub(crate) fn init(self: &Arc<Self>) {
        let _transition = self.state_lock.lock();
        match self.state() {
            HelperState::Uninitialized => self.set_state(HelperState::NotAlive),
            HelperState::Delayed => {
                self.set_state(HelperState::NotAlive);
                self.spawn_locked();
            }
            _ => {}
        }
    }

    /// Hand the process over to the helper. Returns whether the handover
    /// actually happened (the helper must be alive).
    pub(crate) fn begin_handover(&self) -> bool {
        let _transition = self.state_lock.lock();
        if self.state() == HelperState::Alive {
            self.set_state(HelperState::HandedOver);
            self.wakeup.set();
            true
        } else {
            false
        }
    }

    /// Force the helper down. The returned join handle, if any, completes
    /// once the task has released its watched ports.
    pub(crate) fn terminate(&self) -> Option<JoinHandle<()>> {
        let _transition = self.state_lock.lock();
        let state = self.state();
        self.set_state(HelperState::NotAlive);
        if let Some(run) = self.run_alive.lock().take() {
            run.store(false, Ordering::Relaxed);
        }
        if matches!(state, HelperState::Alive | HelperState::HandedOver) {
            self.wakeup.set();
        }
        if self.is_helper_task() {
            None
        } else {
            self.join.lock().take()
        }
    }

    fn spawn_locked(self: &Arc<Self>) {
        let ctx = self.ctx.lock().clone();
        let Some(ctx) = ctx else {
            warn!("helper requested before the fabric was wired up");
            return;
        };
        let Some(registry) = ctx.registry.upgrade() else {
            return;
        };
        self.set_state(HelperState::Alive);
        // Start dirty: the first loop iteration adopts whatever the
        // registry already holds.
        self.dirty.store(true, Ordering::Relaxed);
        self.wakeup.clear();
        let alive = Arc::new(AtomicBool::new(true));
        *self.run_alive.lock() = Some(alive.dupe());
        let shared = self.dupe();
        let handle = tokio::spawn(helper_main(
            shared,
            registry,
            ctx.handlers,
            ctx.self_id,
            alive,
        ));
        *self.join.lock() = Some(handle);
    }

    fn finalize(&self, alive: &Arc<AtomicBool>, handed_over: bool) {
        {
            let _transition = self.state_lock.lock();
            let is_current = self
                .run_alive
                .lock()
                .as_ref()
                .is_some_and(|run| Arc::ptr_eq(run, alive));
            // A terminated run must not clobber the state of a successor
            // spawned after its termination.
            if is_current {
                *self.run_alive.lock() = None;
                self.set_state(HelperState::NotAlive);
                *self.task_id.lock() = None;
            }
        }
        if handed_over {
            if let Some(hook) = self.shutdown_hook.lock().take() {
                debug!("helper invoking process shutdown");
                hook();
            }
        }
    }
}

/// One slot of the helper's local array: a strong reference plus the view
/// of the port the helper last observed under the registry lock.
struct WatchedPort {
    port: Arc<IpcPort>,
    handle: PalHandle,
    roles: RoleMask,
    peer_id: u32,
}

/// Reconcile the watched array with the registry, under the registry
/// lock: drop deregistered ports, refresh dirty views, adopt recent
/// `IFPOLL` ports from the head of the insertion list.
fn reconfigure(registry: &PortRegistry, watched: &mut Vec<WatchedPort>, keepalive: &mut usize) {
    let inner = registry.lock_inner();
    watched.retain_mut(|entry| {
        if !entry.port.in_list() {
            trace!(peer_id = entry.peer_id, "releasing watched port");
            if entry.roles.contains(RoleMask::KEEPALIVE) {
                *keepalive -= 1;
            }
            return false;
        }
        if entry.port.take_dirty() {
            let had_keepalive = entry.roles.contains(RoleMask::KEEPALIVE);
            entry.roles = entry.port.roles();
            entry.peer_id = entry.port.peer_id();
            let has_keepalive = entry.roles.contains(RoleMask::KEEPALIVE);
            if had_keepalive && !has_keepalive {
                *keepalive -= 1;
            } else if !had_keepalive && has_keepalive {
                *keepalive += 1;
            }
            if !entry.roles.contains(RoleMask::IFPOLL) {
                // No longer ours to watch.
                if has_keepalive {
                    *keepalive -= 1;
                }
                return false;
            }
        }
        true
    });
    // Recent ports cluster at the head; stop at the first settled one.
    for port in inner.list.iter() {
        if !port.is_recent() {
            break;
        }
        port.set_recent(false);
        let roles = port.roles();
        if !roles.contains(RoleMask::IFPOLL) {
            continue;
        }
        if watched.iter().any(|entry| Arc::ptr_eq(&entry.port, port)) {
            continue;
        }
        let Ok(handle) = port.handle() else {
            continue;
        };
        port.take_dirty();
        if roles.contains(RoleMask::KEEPALIVE) {
            *keepalive += 1;
        }
        trace!(peer_id = port.peer_id(), ?roles, "watching port");
        watched.push(WatchedPort {
            port: port.dupe(),
            handle,
            roles,
            peer_id: port.peer_id(),
        });
    }
}

async fn helper_main(
    shared: Arc<HelperShared>,
    registry: Arc<PortRegistry>,
    handlers: Arc<CallbackTable>,
    self_id: u32,
    alive: Arc<AtomicBool>,
) {
    *shared.task_id.lock() = tokio::task::try_id();
    debug!("IPC helper running");
    let mut watched: Vec<WatchedPort> = Vec::new();
    let mut keepalive = 0usize;
    let mut handed_over = false;
    loop {
        // Reconcile before waiting again, whichever way the change was
        // signaled.
        if shared.take_dirty() {
            reconfigure(&registry, &mut watched, &mut keepalive);
        }
        if !alive.load(Ordering::Relaxed) {
            break;
        }
        if shared.state() == HelperState::HandedOver && keepalive == 0 {
            handed_over = true;
            break;
        }

        let slot = {
            let mut set: Vec<&dyn Waitable> = Vec::with_capacity(watched.len() + 1);
            set.push(&shared.wakeup);
            for entry in &watched {
                set.push(&entry.handle);
            }
            match multi_wait(&set, None).await {
                Ok(slot) => slot,
                Err(_) => continue,
            }
        };

        if slot == 0 {
            shared.wakeup.clear();
            if !alive.load(Ordering::Relaxed) {
                break;
            }
            reconfigure(&registry, &mut watched, &mut keepalive);
            continue;
        }

        let entry = &watched[slot - 1];
        if entry.roles.contains(RoleMask::SERVER) {
            match entry.handle.accept().await {
                Ok(client) => {
                    debug!(peer_id = entry.peer_id, "accepted connection");
                    // Admission marks us dirty; the loop top reconfigures
                    // before the next wait.
                    if let Err(e) = registry.admit_handle(
                        entry.peer_id,
                        client,
                        RoleMask::LISTEN | RoleMask::IFPOLL,
                        None,
                    ) {
                        warn!("failed to admit accepted client: {e}");
                    }
                }
                Err(e) => {
                    warn!(peer_id = entry.peer_id, "accept failed: {e}");
                    registry.delete_port(&entry.port, errno::ECHILD);
                }
            }
            continue;
        }

        match entry.handle.attrs() {
            Err(e) => {
                registry.delete_port(&entry.port, e.errno());
                // The eviction may have been a no-op (port already gone);
                // force a reconcile anyway so a dead handle cannot keep
                // signaling its stale slot.
                shared.dirty.store(true, Ordering::Relaxed);
            }
            Ok(attrs) if attrs.readable => {
                let env = ReceiveEnv {
                    self_id,
                    registry: &registry,
                    handlers: &handlers,
                    from_helper: true,
                };
                if let Err(e) = receive_on_port(&env, &entry.port, 0).await {
                    trace!(peer_id = entry.peer_id, "dispatch ended: {e}");
                    shared.dirty.store(true, Ordering::Relaxed);
                }
            }
            Ok(attrs) if attrs.disconnected => {
                registry.delete_port(&entry.port, errno::ECONNRESET);
                shared.dirty.store(true, Ordering::Relaxed);
            }
            Ok(_) => {}
        }
    }
    debug!(handed_over, "IPC helper exiting");
    // Every watched reference goes away before the state flips, so a
    // subsequent helper starts from the registry alone.
    watched.clear();
    shared.finalize(&alive, handed_over);
}
