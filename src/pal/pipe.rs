//! In-memory byte-stream provider.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Streams here are channel-backed: each endpoint owns the sending half of
//! one unbounded channel and the receiving half of the other. Listeners
//! are named in a process-wide table, so several in-process "processes"
//! can find each other by URI exactly the way they would on a host
//! transport.
//!
//! Locks are only ever taken inside a single poll, never across a
//! suspension point.

use super::{PalHandle, PalStream, StreamAttrs};
use crate::{Error, Result};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::task::AtomicWaker;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::poll_fn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;

/// Listener table shared by every stream in the process. Models the host
/// namespace that URI-based open would consult on a real platform.
static LISTENERS: Lazy<Mutex<HashMap<String, mpsc::UnboundedSender<PalHandle>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

#[derive(Debug)]
struct RxState {
    chan: mpsc::UnboundedReceiver<Bytes>,
    buf: BytesMut,
    eof: bool,
}

impl RxState {
    /// Pull everything already queued into the local buffer without
    /// suspending.
    fn drain(&mut self) {
        loop {
            match self.chan.try_recv() {
                Ok(chunk) => self.buf.extend_from_slice(&chunk),
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    self.eof = true;
                    break;
                }
            }
        }
    }
}

/// One endpoint of a connected in-memory stream pair.
#[derive(Debug)]
pub struct PipeStream {
    tx: Mutex<Option<mpsc::UnboundedSender<Bytes>>>,
    rx: Mutex<RxState>,
    closed: AtomicBool,
    /// Wakes readers parked on the channel when the *local* end closes.
    close_waker: AtomicWaker,
}

impl PipeStream {
    fn new(tx: mpsc::UnboundedSender<Bytes>, rx: mpsc::UnboundedReceiver<Bytes>) -> Self {
        Self {
            tx: Mutex::new(Some(tx)),
            rx: Mutex::new(RxState {
                chan: rx,
                buf: BytesMut::new(),
                eof: false,
            }),
            closed: AtomicBool::new(false),
            close_waker: AtomicWaker::new(),
        }
    }

    fn is_closed(&self) -> bool {
        // Atomic ordering: the flag is the whole state, `Relaxed` suffices.
        self.closed.load(Ordering::Relaxed)
    }
}

/// Create a connected pair of in-memory streams.
#[must_use]
pub fn pair() -> (PalHandle, PalHandle) {
    let (near_tx, far_rx) = mpsc::unbounded_channel();
    let (far_tx, near_rx) = mpsc::unbounded_channel();
    (
        Arc::new(PipeStream::new(near_tx, near_rx)),
        Arc::new(PipeStream::new(far_tx, far_rx)),
    )
}

#[async_trait]
impl PalStream for PipeStream {
    async fn read(&self, buf: &mut [u8]) -> Result<usize> {
        poll_fn(|cx| {
            if self.is_closed() {
                return Poll::Ready(Err(Error::BadHandle));
            }
            self.close_waker.register(cx.waker());
            let mut rx = self.rx.lock();
            rx.drain();
            if !rx.buf.is_empty() {
                let n = buf.len().min(rx.buf.len());
                buf[..n].copy_from_slice(&rx.buf.split_to(n));
                return Poll::Ready(Ok(n));
            }
            if rx.eof {
                return Poll::Ready(Ok(0));
            }
            match rx.chan.poll_recv(cx) {
                Poll::Ready(Some(chunk)) => {
                    rx.buf.extend_from_slice(&chunk);
                    let n = buf.len().min(rx.buf.len());
                    buf[..n].copy_from_slice(&rx.buf.split_to(n));
                    Poll::Ready(Ok(n))
                }
                Poll::Ready(None) => {
                    rx.eof = true;
                    Poll::Ready(Ok(0))
                }
                Poll::Pending => Poll::Pending,
            }
        })
        .await
    }

    async fn write(&self, buf: &[u8]) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::BadHandle);
        }
        let guard = self.tx.lock();
        match guard.as_ref() {
            Some(tx) => tx
                .send(Bytes::copy_from_slice(buf))
                .map(|()| buf.len())
                .map_err(|_| Error::ConnectionReset),
            None => Err(Error::BadHandle),
        }
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        // Dropping the sender is what the peer observes as EOF.
        self.tx.lock().take();
        self.close_waker.wake();
    }

    fn attrs(&self) -> Result<StreamAttrs> {
        if self.is_closed() {
            return Err(Error::BadHandle);
        }
        let mut rx = self.rx.lock();
        rx.drain();
        let writable = self
            .tx
            .lock()
            .as_ref()
            .is_some_and(|tx| !tx.is_closed());
        // `readable` is buffered data only. A quiet peer close shows up
        // as `disconnected` alone, so the owner can tell "there is
        // something to dispatch" from "the peer is gone".
        Ok(StreamAttrs {
            readable: !rx.buf.is_empty(),
            writable,
            disconnected: rx.eof,
            pending_size: rx.buf.len(),
        })
    }

    fn poll_signaled(&self, cx: &mut Context<'_>) -> Poll<()> {
        // A closed handle signals immediately so its watcher notices and
        // releases it.
        if self.is_closed() {
            return Poll::Ready(());
        }
        self.close_waker.register(cx.waker());
        let mut rx = self.rx.lock();
        rx.drain();
        if !rx.buf.is_empty() || rx.eof {
            return Poll::Ready(());
        }
        match rx.chan.poll_recv(cx) {
            Poll::Ready(Some(chunk)) => {
                rx.buf.extend_from_slice(&chunk);
                Poll::Ready(())
            }
            Poll::Ready(None) => {
                rx.eof = true;
                Poll::Ready(())
            }
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PipeStream {
    fn drop(&mut self) {
        self.close();
    }
}

#[derive(Debug)]
struct Backlog {
    chan: mpsc::UnboundedReceiver<PalHandle>,
    stash: Option<PalHandle>,
}

/// A named in-memory listener; `accept` yields the server end of each
/// connecting pair.
#[derive(Debug)]
pub struct PipeListener {
    name: String,
    backlog: Mutex<Backlog>,
    closed: AtomicBool,
    close_waker: AtomicWaker,
}

/// Create a listener registered under `name`.
///
/// # Errors
/// [`Error::Denied`] if the name is already taken.
pub fn listen(name: &str) -> Result<PalHandle> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut listeners = LISTENERS.lock();
    if listeners.contains_key(name) {
        return Err(Error::Denied);
    }
    listeners.insert(name.to_owned(), tx);
    Ok(Arc::new(PipeListener {
        name: name.to_owned(),
        backlog: Mutex::new(Backlog {
            chan: rx,
            stash: None,
        }),
        closed: AtomicBool::new(false),
        close_waker: AtomicWaker::new(),
    }))
}

/// Connect to the listener registered under `name` and return the client
/// end.
///
/// # Errors
/// [`Error::NotConnection`] if nobody is listening.
pub fn connect(name: &str) -> Result<PalHandle> {
    let mut listeners = LISTENERS.lock();
    let Some(tx) = listeners.get(name) else {
        return Err(Error::NotConnection);
    };
    let (server_end, client_end) = pair();
    if tx.send(server_end).is_err() {
        // The listener was dropped without deregistering; clean up after it.
        listeners.remove(name);
        return Err(Error::NotConnection);
    }
    Ok(client_end)
}

#[async_trait]
impl PalStream for PipeListener {
    async fn read(&self, _buf: &mut [u8]) -> Result<usize> {
        Err(Error::NotConnection)
    }

    async fn write(&self, _buf: &[u8]) -> Result<usize> {
        Err(Error::NotConnection)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::Relaxed) {
            return;
        }
        LISTENERS.lock().remove(&self.name);
        self.close_waker.wake();
    }

    fn attrs(&self) -> Result<StreamAttrs> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(Error::BadHandle);
        }
        let backlog = self.backlog.lock();
        Ok(StreamAttrs {
            readable: backlog.stash.is_some(),
            writable: false,
            disconnected: false,
            pending_size: 0,
        })
    }

    async fn accept(&self) -> Result<PalHandle> {
        poll_fn(|cx| {
            if self.closed.load(Ordering::Relaxed) {
                return Poll::Ready(Err(Error::BadHandle));
            }
            self.close_waker.register(cx.waker());
            let mut backlog = self.backlog.lock();
            if let Some(client) = backlog.stash.take() {
                return Poll::Ready(Ok(client));
            }
            match backlog.chan.poll_recv(cx) {
                Poll::Ready(Some(client)) => Poll::Ready(Ok(client)),
                // The table holds our sender until `close`, so the channel
                // only closes when the listener is being torn down.
                Poll::Ready(None) => Poll::Ready(Err(Error::BadHandle)),
                Poll::Pending => Poll::Pending,
            }
        })
        .await
    }

    fn poll_signaled(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.closed.load(Ordering::Relaxed) {
            return Poll::Ready(());
        }
        self.close_waker.register(cx.waker());
        let mut backlog = self.backlog.lock();
        if backlog.stash.is_some() {
            return Poll::Ready(());
        }
        match backlog.chan.poll_recv(cx) {
            Poll::Ready(Some(client)) => {
                backlog.stash = Some(client);
                Poll::Ready(())
            }
            Poll::Ready(None) => Poll::Ready(()),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl Drop for PipeListener {
    fn drop(&mut self) {
        self.close();
    }
}
