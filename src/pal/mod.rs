//! Platform abstraction for byte streams.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! The fabric never touches host descriptors directly; everything it reads
//! or writes goes through a [`PalStream`] handle. The trait is object-safe
//! so ports can hold streams of different providers behind one `Arc`.
//!
//! This crate ships one provider, [`pipe`]: in-memory channel-backed
//! streams with named listeners, enough to wire several in-process
//! "processes" together. A platform backend (host sockets, enclave TLS
//! streams) implements the same trait.

pub mod event;
pub mod pipe;
pub mod wait;

pub use event::PalEvent;
pub use wait::{multi_wait, Waitable};

use crate::{Error, Result};
use async_trait::async_trait;
use std::sync::Arc;
use std::task::{Context, Poll};

/// Point-in-time attributes of a stream, as reported by the provider.
#[derive(Debug, Clone, Copy, Default)]
pub struct StreamAttrs {
    /// Bytes are buffered; a read would return data without suspending.
    /// Not asserted for a bare end-of-stream, which is reported through
    /// `disconnected` instead.
    pub readable: bool,
    /// A write currently has somewhere to go.
    pub writable: bool,
    /// The peer is gone.
    pub disconnected: bool,
    /// Bytes buffered and immediately readable.
    pub pending_size: usize,
}

/// A bidirectional byte stream supplied by the platform.
///
/// `close` is idempotent; every operation on a closed handle fails with
/// [`Error::BadHandle`]. Only `read` and `accept` may suspend.
#[async_trait]
pub trait PalStream: Send + Sync + std::fmt::Debug {
    /// Read up to `buf.len()` bytes. `Ok(0)` means end of stream.
    async fn read(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf`, returning how many bytes were taken.
    async fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Release the stream. Further operations fail with
    /// [`Error::BadHandle`]; closing twice is a no-op.
    fn close(&self);

    /// Query the stream's current attributes.
    fn attrs(&self) -> Result<StreamAttrs>;

    /// Accept a pending client on a server stream.
    async fn accept(&self) -> Result<PalHandle> {
        Err(Error::NotConnection)
    }

    /// Readiness for [`multi_wait`]: resolves once the stream has
    /// something for its owner to look at (readable data, a pending
    /// accept, a disconnect, or local closure).
    fn poll_signaled(&self, cx: &mut Context<'_>) -> Poll<()>;
}

/// Shared owning reference to a platform stream.
pub type PalHandle = Arc<dyn PalStream>;

/// Open a stream by URI.
///
/// Recognized schemes: `pipe:<name>` connects to a named listener,
/// `pipe.srv:<name>` creates one.
///
/// # Errors
/// [`Error::NotSupported`] for unknown schemes, plus whatever the provider
/// reports.
pub async fn open(uri: &str) -> Result<PalHandle> {
    match uri.split_once(':') {
        Some(("pipe", name)) => pipe::connect(name),
        Some(("pipe.srv", name)) => pipe::listen(name),
        _ => Err(Error::NotSupported),
    }
}
