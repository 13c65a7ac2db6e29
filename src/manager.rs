//! The process-wide IPC surface.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! [`IpcManager`] ties the pieces together: the registry, the callback
//! table, the helper, and sequence allocation for duplex requests. It is
//! a bundle of shared handles, so every subsystem of the process can hold
//! its own copy.

use crate::callback::{CallbackTable, Handler};
use crate::frame::{code, Message};
use crate::helper::{HelperContext, HelperShared, HelperState};
use crate::pal::{self, PalHandle};
use crate::port::{FiniCallback, IpcPort, RoleMask};
use crate::receive::{receive_on_port, send_on_port, ReceiveEnv};
use crate::registry::PortRegistry;
use crate::{Dupe, Error, Result};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Bootstrap description for [`IpcManager::init_ports`]: where this
/// process listens and which processes it is born connected to.
#[derive(Debug, Clone, Default)]
pub struct IpcConfig {
    /// URI to listen on for incoming connections.
    pub server_uri: Option<String>,
    /// Peer id and URI of the parent process.
    pub parent: Option<(u32, String)>,
    /// Peer id and URI of the PID-namespace leader.
    pub pid_leader: Option<(u32, String)>,
    /// Peer id and URI of the SysV-namespace leader.
    pub sysv_leader: Option<(u32, String)>,
    /// URI of the shared broadcast stream, when the platform provides one.
    pub broadcast_uri: Option<String>,
}

/// Shared entry point to the IPC fabric of one process.
#[derive(Debug)]
pub struct IpcManager {
    self_id: u32,
    registry: Arc<PortRegistry>,
    handlers: Arc<CallbackTable>,
    helper: Arc<HelperShared>,
    next_seq: Arc<AtomicU64>,
}

impl Dupe for IpcManager {
    #[inline]
    fn dupe(&self) -> Self {
        Self {
            self_id: self.self_id,
            registry: self.registry.dupe(),
            handlers: self.handlers.dupe(),
            helper: self.helper.dupe(),
            next_seq: self.next_seq.dupe(),
        }
    }
}

impl IpcManager {
    /// Build the fabric for a process known to its peers as `self_id`.
    #[must_use]
    pub fn new(self_id: u32) -> Self {
        let helper = Arc::new(HelperShared::new());
        let registry = Arc::new(PortRegistry::new(helper.dupe()));
        let handlers = Arc::new(CallbackTable::new());
        // Sequence numbers start at a random point so they are unique per
        // process and unpredictable across restarts; zero is reserved for
        // one-way messages.
        let mut seed: u64 = rand::random();
        if seed == 0 {
            seed = 1;
        }
        let manager = Self {
            self_id,
            registry,
            handlers,
            helper,
            next_seq: Arc::new(AtomicU64::new(seed)),
        };
        manager.helper.install_context(HelperContext {
            self_id,
            registry: Arc::downgrade(&manager.registry),
            handlers: manager.handlers.dupe(),
        });
        manager.register_resp_handler();
        manager
    }

    fn register_resp_handler(&self) {
        let handler: Handler = Arc::new(|msg, port| {
            Box::pin(async move {
                match msg.retval() {
                    Ok(value) => {
                        if let Some(request) = port.detach_pending(msg.seq) {
                            request.waiter.send(value).ok();
                        } else {
                            debug!(seq = msg.seq, "response with no matching request");
                        }
                        0
                    }
                    Err(e) => e.retval(),
                }
            })
        });
        // The table is freshly allocated; RESP is always in range.
        self.handlers
            .register(code::RESP, handler)
            .unwrap_or_else(|_| unreachable!("RESP outside the callback table"));
    }

    /// The peer id this process goes by.
    #[must_use]
    pub fn self_id(&self) -> u32 {
        self.self_id
    }

    /// The port registry.
    #[must_use]
    pub fn registry(&self) -> &Arc<PortRegistry> {
        &self.registry
    }

    /// Current helper lifecycle state.
    #[must_use]
    pub fn helper_state(&self) -> HelperState {
        self.helper.state()
    }

    /// Install `handler` for `message_code`.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] for codes outside the table.
    pub fn register_callback(&self, message_code: u16, handler: Handler) -> Result<()> {
        self.handlers.register(message_code, handler)
    }

    /// Install the hook invoked when a handed-over helper finalizes.
    pub fn on_shutdown(&self, hook: impl FnOnce() + Send + 'static) {
        self.helper.set_shutdown_hook(Box::new(hook));
    }

    /// Admit a stream for `peer_id`; see
    /// [`PortRegistry::admit_handle`].
    ///
    /// # Errors
    /// Propagated from the registry.
    pub fn admit_handle(
        &self,
        peer_id: u32,
        handle: PalHandle,
        roles: RoleMask,
        fini: Option<FiniCallback>,
    ) -> Result<Arc<IpcPort>> {
        self.registry.admit_handle(peer_id, handle, roles, fini)
    }

    /// Open `uri` and admit the resulting stream for `peer_id`.
    ///
    /// # Errors
    /// Stream-open failures, plus whatever admission reports.
    pub async fn admit_uri(
        &self,
        peer_id: u32,
        uri: &str,
        roles: RoleMask,
        fini: Option<FiniCallback>,
    ) -> Result<Arc<IpcPort>> {
        let handle = pal::open(uri).await?;
        self.registry.admit_handle(peer_id, handle, roles, fini)
    }

    /// Install the dedicated broadcast stream used by the
    /// [`broadcast`](Self::broadcast) fast path.
    ///
    /// # Errors
    /// Propagated from admission.
    pub fn set_broadcast_handle(&self, handle: PalHandle) -> Result<Arc<IpcPort>> {
        let port =
            self.registry
                .admit_handle(0, handle, RoleMask::LISTEN | RoleMask::IFPOLL, None)?;
        self.registry.set_broadcast(Some(port.dupe()));
        Ok(port)
    }

    /// Send a one-way message on `port`.
    ///
    /// # Errors
    /// Stream errors from the write.
    pub async fn send_message(&self, port: &Arc<IpcPort>, msg: &Message) -> Result<()> {
        let mut msg = msg.clone();
        msg.src = self.self_id;
        send_on_port(port, &msg).await
    }

    /// Send a request on `port` and suspend until the peer's response (or
    /// the port's teardown, which answers with `-ECONNRESET`).
    ///
    /// # Errors
    /// Send failures; [`Error::ConnectionReset`] if the waiter is dropped
    /// without an answer.
    pub async fn send_request(&self, port: &Arc<IpcPort>, msg: &Message) -> Result<i32> {
        let mut msg = msg.clone();
        msg.src = self.self_id;
        msg.seq = self.alloc_seq();
        let (tx, rx) = tokio::sync::oneshot::channel();
        port.attach_pending(msg.seq, tx);
        if let Err(e) = send_on_port(port, &msg).await {
            port.detach_pending(msg.seq);
            return Err(e);
        }
        rx.await.map_err(|_| Error::ConnectionReset)
    }

    /// Read frames on `port` until the one carrying `seq` arrives,
    /// dispatching everything else on the way. For callers that must wait
    /// for a specific answer without the helper's involvement.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] for `seq == 0`; stream errors otherwise.
    pub async fn recv_response(&self, port: &Arc<IpcPort>, seq: u64) -> Result<Message> {
        if seq == 0 {
            return Err(Error::InvalidArgument);
        }
        let env = ReceiveEnv {
            self_id: self.self_id,
            registry: &self.registry,
            handlers: &self.handlers,
            from_helper: false,
        };
        match receive_on_port(&env, port, seq).await? {
            Some(msg) => Ok(msg),
            None => Err(Error::ConnectionReset),
        }
    }

    /// Deliver `msg` to every port matching `target_roles`, except those
    /// in `exclude`. With an empty `target_roles`, the dedicated
    /// broadcast stream is used instead when one is installed.
    ///
    /// Per-recipient failures are logged and skipped; the broadcast keeps
    /// going.
    ///
    /// # Errors
    /// Only the dedicated-stream fast path propagates its send error.
    pub async fn broadcast(
        &self,
        msg: &Message,
        exclude: &[Arc<IpcPort>],
        target_roles: RoleMask,
    ) -> Result<()> {
        if target_roles.is_empty() {
            if let Some(port) = self.registry.broadcast_port() {
                if !exclude.iter().any(|ex| Arc::ptr_eq(ex, &port)) {
                    let mut msg = msg.clone();
                    msg.src = self.self_id;
                    return send_on_port(&port, &msg).await;
                }
            }
        }
        for port in self.registry.collect_matching(target_roles, exclude) {
            let mut msg = msg.clone();
            msg.src = self.self_id;
            msg.dst = port.peer_id();
            if let Err(e) = send_on_port(&port, &msg).await {
                warn!(peer_id = port.peer_id(), "broadcast delivery failed: {e}");
            }
        }
        Ok(())
    }

    /// Seed the registry with the process's standing connections: its own
    /// server port, the parent link, the namespace leaders, and the
    /// broadcast stream.
    ///
    /// # Errors
    /// The first stream that fails to open aborts the bootstrap.
    pub async fn init_ports(&self, config: &IpcConfig) -> Result<()> {
        if let Some(uri) = &config.server_uri {
            let handle = pal::open(uri).await?;
            self.registry.admit_handle(
                0,
                handle,
                RoleMask::SERVER | RoleMask::IFPOLL,
                None,
            )?;
        }
        if let Some((peer_id, uri)) = &config.parent {
            let handle = pal::open(uri).await?;
            self.registry.admit_handle(
                *peer_id,
                handle,
                RoleMask::DIRPRT | RoleMask::LISTEN | RoleMask::KEEPALIVE | RoleMask::IFPOLL,
                None,
            )?;
        }
        if let Some((peer_id, uri)) = &config.pid_leader {
            let handle = pal::open(uri).await?;
            self.registry.admit_handle(
                *peer_id,
                handle,
                RoleMask::PIDLDR | RoleMask::LISTEN | RoleMask::IFPOLL,
                None,
            )?;
        }
        if let Some((peer_id, uri)) = &config.sysv_leader {
            let handle = pal::open(uri).await?;
            self.registry.admit_handle(
                *peer_id,
                handle,
                RoleMask::SYSVLDR | RoleMask::LISTEN | RoleMask::IFPOLL,
                None,
            )?;
        }
        if let Some(uri) = &config.broadcast_uri {
            let handle = pal::open(uri).await?;
            self.set_broadcast_handle(handle)?;
        }
        Ok(())
    }

    /// Start the helper, honoring any restart request that arrived while
    /// the fabric was still coming up.
    pub fn init_helper(&self) {
        self.helper.init();
    }

    /// Begin process exit. With `handover` and at least one `KEEPALIVE`
    /// port still admitted, the helper takes over and `true` is returned;
    /// otherwise the helper is terminated and `false` is returned.
    pub async fn exit_with_helper(&self, handover: bool) -> bool {
        if handover && self.registry.has_keepalive() && self.helper.begin_handover() {
            debug!("process handed over to the IPC helper");
            return true;
        }
        self.terminate_helper().await;
        false
    }

    /// Force the helper down and wait until it has released its ports.
    pub async fn terminate_helper(&self) {
        if let Some(join) = self.helper.terminate() {
            join.await.ok();
        }
    }

    fn alloc_seq(&self) -> u64 {
        loop {
            let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);
            if seq != 0 {
                return seq;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pal::pipe;
    use bytes::Bytes;

    #[test]
    fn sequence_numbers_are_nonzero_and_distinct() {
        let manager = IpcManager::new(1);
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1000 {
            let seq = manager.alloc_seq();
            assert_ne!(seq, 0);
            assert!(seen.insert(seq));
        }
    }

    #[tokio::test]
    async fn init_ports_seeds_the_standing_connections() {
        let parent_srv = pipe::listen("mgr-parent").unwrap();
        let pid_srv = pipe::listen("mgr-pidldr").unwrap();

        let manager = IpcManager::new(7);
        manager
            .init_ports(&IpcConfig {
                server_uri: Some("pipe.srv:mgr-self".into()),
                parent: Some((1, "pipe:mgr-parent".into())),
                pid_leader: Some((2, "pipe:mgr-pidldr".into())),
                ..IpcConfig::default()
            })
            .await
            .unwrap();

        let parent = manager.registry().lookup(1, RoleMask::DIRPRT).unwrap();
        assert!(parent.roles().contains(RoleMask::KEEPALIVE));
        let leader = manager.registry().lookup(2, RoleMask::PIDLDR).unwrap();
        assert!(leader.roles().contains(RoleMask::IFPOLL));
        assert!(manager.registry().has_keepalive());

        parent_srv.close();
        pid_srv.close();
    }

    #[tokio::test]
    async fn one_way_sends_carry_our_id() {
        let manager = IpcManager::new(7);
        let (near, far) = pipe::pair();
        let port = manager
            .admit_handle(9, near, RoleMask::LISTEN, None)
            .unwrap();

        let msg = Message::new(code::TELLURI, 0, 9, Bytes::from_static(b"uri"));
        manager.send_message(&port, &msg).await.unwrap();

        let mut buf = vec![0u8; 128];
        let n = far.read(&mut buf).await.unwrap();
        let seen = Message::try_from(Bytes::copy_from_slice(&buf[..n])).unwrap();
        assert_eq!(seen.src, 7);
        assert_eq!(seen.dst, 9);
        assert_eq!(seen.seq, 0);
    }
}
