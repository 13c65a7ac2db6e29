//! The set of live ports.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Two collections over the same ports, both guarded by one lock: a
//! fixed-size hash index keyed by peer id, and an insertion-order list.
//! New `IFPOLL` ports go to the head of the list and are flagged `recent`,
//! so the helper's reconfiguration scan can stop at the first non-recent
//! port instead of walking everything.
//!
//! Each membership owns one strong reference to the port; releasing the
//! membership drops it. That is the whole cycle-avoidance story: no weak
//! pointers, just counted memberships.

use crate::config::PEER_BUCKETS;
use crate::helper::HelperShared;
use crate::port::{FiniCallback, IpcPort, RoleMask};
use crate::{Dupe, Error, Result};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::{debug, trace, warn};

fn bucket_of(peer_id: u32) -> usize {
    peer_id as usize & (PEER_BUCKETS - 1)
}

#[derive(Debug, Default)]
pub(crate) struct RegistryInner {
    buckets: Vec<Vec<Arc<IpcPort>>>,
    pub(crate) list: VecDeque<Arc<IpcPort>>,
}

/// Registry of live ports, indexed by peer id and by insertion order.
#[derive(Debug)]
pub struct PortRegistry {
    inner: Mutex<RegistryInner>,
    helper: Arc<HelperShared>,
    broadcast: Mutex<Option<Arc<IpcPort>>>,
}

impl PortRegistry {
    pub(crate) fn new(helper: Arc<HelperShared>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                buckets: (0..PEER_BUCKETS).map(|_| Vec::new()).collect(),
                list: VecDeque::new(),
            }),
            helper,
            broadcast: Mutex::new(None),
        }
    }

    pub(crate) fn lock_inner(&self) -> MutexGuard<'_, RegistryInner> {
        self.inner.lock()
    }

    /// Admit a stream under `peer_id` with the given roles, reusing an
    /// existing port for the same peer/handle if there is one.
    ///
    /// # Errors
    /// Currently infallible in itself; kept fallible for parity with
    /// URI-based admission paths layered on top.
    pub fn admit_handle(
        &self,
        peer_id: u32,
        handle: crate::pal::PalHandle,
        roles: RoleMask,
        fini: Option<FiniCallback>,
    ) -> Result<Arc<IpcPort>> {
        let (port, fresh) = {
            let mut inner = self.inner.lock();
            let existing = if peer_id != 0 {
                inner.buckets[bucket_of(peer_id)]
                    .iter()
                    .find(|port| port.peer_id() == peer_id && port.shares_handle(&handle))
                    .map(Dupe::dupe)
            } else {
                None
            };
            let existing = existing.or_else(|| {
                inner
                    .list
                    .iter()
                    .find(|port| port.shares_handle(&handle))
                    .map(Dupe::dupe)
            });
            let port = existing.unwrap_or_else(|| {
                trace!(peer_id, ?roles, "allocating port");
                IpcPort::new(handle)
            });
            let fresh = self.admit_locked(&mut inner, &port, peer_id, roles, fini);
            (port, fresh)
        };
        self.notify_role_change(fresh, true);
        Ok(port)
    }

    /// Admit (or re-admit) an existing port; same contract as
    /// [`admit_handle`](Self::admit_handle).
    pub fn admit_port(
        &self,
        port: &Arc<IpcPort>,
        peer_id: u32,
        roles: RoleMask,
        fini: Option<FiniCallback>,
    ) {
        let fresh = {
            let mut inner = self.inner.lock();
            self.admit_locked(&mut inner, port, peer_id, roles, fini)
        };
        self.notify_role_change(fresh, true);
    }

    fn admit_locked(
        &self,
        inner: &mut RegistryInner,
        port: &Arc<IpcPort>,
        peer_id: u32,
        roles: RoleMask,
        fini: Option<FiniCallback>,
    ) -> RoleMask {
        if peer_id != 0 && !port.in_index() {
            port.set_peer_id(peer_id);
            inner.buckets[bucket_of(peer_id)].push(port.dupe());
            port.set_in_index(true);
        }
        let fresh = port.or_roles(roles);
        if !fresh.is_empty() {
            port.mark_dirty();
        }
        if fresh.contains(RoleMask::IFPOLL) {
            // Head of the list: the helper adopts recent ports front to
            // back and stops at the first non-recent one.
            if port.in_list() {
                if let Some(pos) = inner.list.iter().position(|p| Arc::ptr_eq(p, port)) {
                    if let Some(moved) = inner.list.remove(pos) {
                        inner.list.push_front(moved);
                    }
                }
            } else {
                inner.list.push_front(port.dupe());
                port.set_in_list(true);
            }
            port.set_recent(true);
        } else if !port.in_list() {
            inner.list.push_back(port.dupe());
            port.set_in_list(true);
            port.set_recent(false);
        }
        if let Some(cb) = fini {
            if let Err(e) = port.install_fini(cb) {
                warn!(peer_id = port.peer_id(), "dropping on-close hook: {e}");
            }
        }
        fresh
    }

    /// Tell the helper its watched set diverged. Only admissions may
    /// create a helper; evictions merely update a live one.
    fn notify_role_change(&self, changed: RoleMask, admission: bool) {
        if changed.intersects(RoleMask::IFPOLL | RoleMask::KEEPALIVE) {
            self.helper
                .request_restart(admission && changed.contains(RoleMask::IFPOLL));
        }
    }

    /// Strip `roles` from the port (all roles when empty); once nothing
    /// but `IFPOLL`/`KEEPALIVE` would remain, the port loses both
    /// registry memberships.
    pub fn evict_port(&self, port: &Arc<IpcPort>, roles: RoleMask) {
        let cleared = {
            let mut inner = self.inner.lock();
            self.evict_locked(&mut inner, port, roles)
        };
        self.notify_role_change(cleared, false);
    }

    fn evict_locked(
        &self,
        inner: &mut RegistryInner,
        port: &Arc<IpcPort>,
        roles: RoleMask,
    ) -> RoleMask {
        let current = port.roles();
        let cleared = if roles.is_empty() {
            current
        } else {
            roles & current
        };
        let remaining = current - cleared;
        if !(remaining - (RoleMask::IFPOLL | RoleMask::KEEPALIVE)).is_empty() {
            port.clear_roles(cleared);
            port.mark_dirty();
            return cleared;
        }
        // Only poll/keepalive duty would be left; the port's life in the
        // registry is over.
        debug!(peer_id = port.peer_id(), ?cleared, "deregistering port");
        port.clear_roles(current);
        port.mark_dirty();
        if port.in_index() {
            let bucket = &mut inner.buckets[bucket_of(port.peer_id())];
            if let Some(pos) = bucket.iter().position(|p| Arc::ptr_eq(p, port)) {
                bucket.swap_remove(pos);
            }
            port.set_in_index(false);
        }
        if port.in_list() {
            if let Some(pos) = inner.list.iter().position(|p| Arc::ptr_eq(p, port)) {
                inner.list.remove(pos);
            }
            port.set_in_list(false);
        }
        cleared | current
    }

    /// Evict every port registered for `peer_id` carrying any of `roles`.
    pub fn evict_peer(&self, peer_id: u32, roles: RoleMask) {
        let cleared = {
            let mut inner = self.inner.lock();
            let matches: Vec<Arc<IpcPort>> = inner.buckets[bucket_of(peer_id)]
                .iter()
                .filter(|port| port.peer_id() == peer_id)
                .map(Dupe::dupe)
                .collect();
            let mut cleared = RoleMask::empty();
            for port in &matches {
                cleared |= self.evict_locked(&mut inner, port, roles);
            }
            cleared
        };
        self.notify_role_change(cleared, false);
    }

    /// Evict `roles` from every admitted port.
    pub fn evict_all(&self, roles: RoleMask) {
        let cleared = {
            let mut inner = self.inner.lock();
            let snapshot: Vec<Arc<IpcPort>> = inner.list.iter().map(Dupe::dupe).collect();
            let mut cleared = RoleMask::empty();
            for port in &snapshot {
                cleared |= self.evict_locked(&mut inner, port, roles);
            }
            cleared
        };
        self.notify_role_change(cleared, false);
    }

    /// Full teardown: deregister everywhere, fail outstanding requests,
    /// run on-close hooks, close the stream.
    pub fn delete_port(&self, port: &Arc<IpcPort>, exit_code: i32) {
        {
            let mut broadcast = self.broadcast.lock();
            if broadcast
                .as_ref()
                .is_some_and(|b| Arc::ptr_eq(b, port))
            {
                broadcast.take();
            }
        }
        let cleared = {
            let mut inner = self.inner.lock();
            self.evict_locked(&mut inner, port, RoleMask::empty())
        };
        port.teardown(exit_code);
        self.notify_role_change(cleared, false);
    }

    /// First port for `peer_id` whose roles intersect `roles` (any port
    /// when `roles` is empty), with one extra reference for the caller.
    ///
    /// # Errors
    /// [`Error::NoSuchProcess`] when nothing matches.
    pub fn lookup(&self, peer_id: u32, roles: RoleMask) -> Result<Arc<IpcPort>> {
        let inner = self.inner.lock();
        inner.buckets[bucket_of(peer_id)]
            .iter()
            .find(|port| {
                port.peer_id() == peer_id
                    && (roles.is_empty() || port.roles().intersects(roles))
            })
            .map(Dupe::dupe)
            .ok_or(Error::NoSuchProcess)
    }

    /// Snapshot of every admitted port matching `target` roles, skipping
    /// `exclude`. The snapshot is taken under the lock; visiting it is the
    /// caller's business.
    #[must_use]
    pub fn collect_matching(
        &self,
        target: RoleMask,
        exclude: &[Arc<IpcPort>],
    ) -> Vec<Arc<IpcPort>> {
        let inner = self.inner.lock();
        inner
            .list
            .iter()
            .filter(|port| port.roles().intersects(target))
            .filter(|port| !exclude.iter().any(|ex| Arc::ptr_eq(ex, port)))
            .map(Dupe::dupe)
            .collect()
    }

    /// Visit every admitted port matching `target`, skipping `exclude`.
    pub fn for_each(
        &self,
        target: RoleMask,
        exclude: &[Arc<IpcPort>],
        mut visitor: impl FnMut(&Arc<IpcPort>),
    ) {
        for port in self.collect_matching(target, exclude) {
            visitor(&port);
        }
    }

    /// Whether any admitted port still keeps the process alive.
    #[must_use]
    pub fn has_keepalive(&self) -> bool {
        let inner = self.inner.lock();
        inner
            .list
            .iter()
            .any(|port| port.roles().contains(RoleMask::KEEPALIVE))
    }

    pub(crate) fn set_broadcast(&self, port: Option<Arc<IpcPort>>) {
        *self.broadcast.lock() = port;
    }

    pub(crate) fn broadcast_port(&self) -> Option<Arc<IpcPort>> {
        self.broadcast.lock().clone()
    }
}
