//! Reference-counted IPC port.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! A port binds exactly one stream handle for its lifetime and carries the
//! routing metadata the registry and the helper need: the peer id, a role
//! bitset, a bounded list of on-close hooks, and the outstanding duplex
//! requests awaiting replies.
//!
//! Locking: the role mask, peer id and view flags are only mutated while
//! the registry lock is held; they are atomics so the helper can snapshot
//! them without blocking. The pending list has its own lock and nothing
//! else. The two async mutexes serialize frame-level I/O per handle and
//! are the only locks in the crate held across a suspension point.

use crate::config::{MAX_FINI, RECV_BUF};
use crate::pal::PalHandle;
use crate::{errno, Error, Result};
use bitflags::bitflags;
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;
use tracing::trace;

bitflags! {
    /// What a port is for. A port accumulates roles as subsystems claim it.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RoleMask: u32 {
        /// Our own listening endpoint; the helper accepts on it.
        const SERVER = 1 << 0;
        /// An accepted or connected peer whose messages we dispatch.
        const LISTEN = 1 << 1;
        /// Direct connection to a child process.
        const DIRCLD = 1 << 2;
        /// Direct connection to the parent process.
        const DIRPRT = 1 << 3;
        /// Connection to the PID-namespace leader.
        const PIDLDR = 1 << 4;
        /// Connection to the SysV-namespace leader.
        const SYSVLDR = 1 << 5;
        /// The helper loop watches this port.
        const IFPOLL = 1 << 6;
        /// The port keeps the process alive through handover.
        const KEEPALIVE = 1 << 7;
    }
}

/// On-close hook: `(port, peer_id, exit_code)`.
pub type FiniCallback = Arc<dyn Fn(&Arc<IpcPort>, u32, i32) + Send + Sync>;

/// An outstanding duplex request parked on a port.
///
/// The oneshot sender is both the result slot and the waiter handle; its
/// move semantics are what makes "completed exactly once" structural.
#[derive(Debug)]
pub(crate) struct PendingRequest {
    pub(crate) seq: u64,
    pub(crate) waiter: oneshot::Sender<i32>,
}

/// A reference-counted record wrapping one stream plus routing metadata.
///
/// Strong references (`Arc` clones) are held by: the peer index, the
/// insertion-order list, the helper's watched array, and any caller that
/// looked the port up. Dropping the last one destroys the port.
pub struct IpcPort {
    handle: Mutex<Option<PalHandle>>,
    peer_id: AtomicU32,
    roles: AtomicU32,
    /// The live (role, peer) fields diverged from the helper's snapshot.
    view_dirty: AtomicBool,
    /// Freshly moved to the head of the insertion list with `IFPOLL` set;
    /// the helper clears this when it adopts the port.
    recent: AtomicBool,
    in_index: AtomicBool,
    in_list: AtomicBool,
    fini: Mutex<Vec<FiniCallback>>,
    pending: Mutex<Vec<PendingRequest>>,
    torn_down: AtomicBool,
    /// Serializes frame writes so concurrent senders cannot interleave.
    pub(crate) send_exclusion: tokio::sync::Mutex<()>,
    /// Serializes framed reads (reentrant across handles, never
    /// concurrent on one) and carries bytes pulled off the stream past
    /// the last consumed frame, so a receive call that returns early
    /// cannot lose what it read ahead.
    pub(crate) recv_carry: tokio::sync::Mutex<BytesMut>,
}

impl std::fmt::Debug for IpcPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IpcPort")
            .field("peer_id", &self.peer_id())
            .field("roles", &self.roles())
            .field("pending", &self.pending.lock().len())
            .finish_non_exhaustive()
    }
}

impl IpcPort {
    /// Wrap a stream handle in a fresh, unregistered port.
    pub(crate) fn new(handle: PalHandle) -> Arc<Self> {
        Arc::new(Self {
            handle: Mutex::new(Some(handle)),
            peer_id: AtomicU32::new(0),
            roles: AtomicU32::new(0),
            view_dirty: AtomicBool::new(false),
            recent: AtomicBool::new(false),
            in_index: AtomicBool::new(false),
            in_list: AtomicBool::new(false),
            fini: Mutex::new(Vec::new()),
            pending: Mutex::new(Vec::new()),
            torn_down: AtomicBool::new(false),
            send_exclusion: tokio::sync::Mutex::new(()),
            recv_carry: tokio::sync::Mutex::new(BytesMut::with_capacity(RECV_BUF)),
        })
    }

    /// The peer process this port talks to; zero if unknown.
    #[must_use]
    pub fn peer_id(&self) -> u32 {
        self.peer_id.load(Ordering::Relaxed)
    }

    pub(crate) fn set_peer_id(&self, peer_id: u32) {
        self.peer_id.store(peer_id, Ordering::Relaxed);
    }

    /// The port's current roles.
    #[must_use]
    pub fn roles(&self) -> RoleMask {
        RoleMask::from_bits_truncate(self.roles.load(Ordering::Relaxed))
    }

    /// OR `mask` into the roles; returns the bits that are actually new.
    pub(crate) fn or_roles(&self, mask: RoleMask) -> RoleMask {
        let old = self.roles.fetch_or(mask.bits(), Ordering::Relaxed);
        mask - RoleMask::from_bits_truncate(old)
    }

    pub(crate) fn clear_roles(&self, mask: RoleMask) {
        self.roles.fetch_and(!mask.bits(), Ordering::Relaxed);
    }

    /// The underlying stream, if the port has not been shut yet.
    ///
    /// # Errors
    /// [`Error::BadHandle`] after teardown.
    pub fn handle(&self) -> Result<PalHandle> {
        self.handle.lock().clone().ok_or(Error::BadHandle)
    }

    /// Whether the shared handle is the same stream as `other`'s.
    pub(crate) fn shares_handle(&self, other: &PalHandle) -> bool {
        self.handle
            .lock()
            .as_ref()
            .is_some_and(|own| Arc::ptr_eq(own, other))
    }

    pub(crate) fn mark_dirty(&self) {
        self.view_dirty.store(true, Ordering::Relaxed);
    }

    pub(crate) fn take_dirty(&self) -> bool {
        self.view_dirty.swap(false, Ordering::Relaxed)
    }

    pub(crate) fn set_recent(&self, recent: bool) {
        self.recent.store(recent, Ordering::Relaxed);
    }

    pub(crate) fn is_recent(&self) -> bool {
        self.recent.load(Ordering::Relaxed)
    }

    pub(crate) fn set_in_index(&self, present: bool) {
        self.in_index.store(present, Ordering::Relaxed);
    }

    pub(crate) fn in_index(&self) -> bool {
        self.in_index.load(Ordering::Relaxed)
    }

    pub(crate) fn set_in_list(&self, present: bool) {
        self.in_list.store(present, Ordering::Relaxed);
    }

    pub(crate) fn in_list(&self) -> bool {
        self.in_list.load(Ordering::Relaxed)
    }

    /// Register an on-close hook. Registering the same hook twice is a
    /// no-op.
    ///
    /// # Errors
    /// [`Error::NoMemory`] once the port carries [`MAX_FINI`] hooks.
    pub fn install_fini(&self, cb: FiniCallback) -> Result<()> {
        let mut fini = self.fini.lock();
        if fini
            .iter()
            .any(|existing| std::ptr::eq(Arc::as_ptr(existing).cast::<u8>(), Arc::as_ptr(&cb).cast::<u8>()))
        {
            return Ok(());
        }
        if fini.len() >= MAX_FINI {
            return Err(Error::NoMemory);
        }
        fini.push(cb);
        Ok(())
    }

    /// Park a duplex request until its response (or teardown) arrives.
    pub(crate) fn attach_pending(&self, seq: u64, waiter: oneshot::Sender<i32>) {
        self.pending.lock().push(PendingRequest { seq, waiter });
    }

    /// Remove and return the request registered under `seq`.
    pub(crate) fn detach_pending(&self, seq: u64) -> Option<PendingRequest> {
        let mut pending = self.pending.lock();
        let index = pending.iter().position(|req| req.seq == seq)?;
        Some(pending.swap_remove(index))
    }

    /// Number of requests still awaiting replies.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }

    fn complete_all_pending(&self, retval: i32) {
        let drained: Vec<PendingRequest> = std::mem::take(&mut *self.pending.lock());
        for req in drained {
            trace!(seq = req.seq, retval, "completing stranded request");
            // The requester may have given up already; that is fine.
            req.waiter.send(retval).ok();
        }
    }

    /// Final shutdown of the port: run the on-close hooks once, fail every
    /// outstanding request with a connection reset, and close the stream.
    ///
    /// Safe to call more than once; later calls are no-ops.
    pub(crate) fn teardown(self: &Arc<Self>, exit_code: i32) {
        if self.torn_down.swap(true, Ordering::Relaxed) {
            return;
        }
        let peer_id = self.peer_id();
        trace!(peer_id, exit_code, "tearing down port");
        let hooks: Vec<FiniCallback> = std::mem::take(&mut *self.fini.lock());
        for hook in hooks {
            hook(self, peer_id, exit_code);
        }
        self.complete_all_pending(-errno::ECONNRESET);
        if let Some(handle) = self.handle.lock().take() {
            handle.close();
        }
    }
}

impl Drop for IpcPort {
    fn drop(&mut self) {
        // Backstop for ports that never went through `teardown`: the
        // handle must still be closed exactly once and waiters unblocked.
        if !self.torn_down.swap(true, Ordering::Relaxed) {
            self.complete_all_pending(-errno::ECONNRESET);
            if let Some(handle) = self.handle.lock().take() {
                handle.close();
            }
        }
    }
}
