//! Inter-process communication fabric for an enclave library OS.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! Each process runs in its own enclave and talks to its parent, its
//! children, and its namespace leaders over bidirectional byte streams
//! provided by the platform layer ([`pal`]). This crate owns the set of
//! active streams: it wraps each one in a reference-counted [`IpcPort`],
//! indexes the ports by peer id in a [`PortRegistry`], multiplexes reads
//! through a single helper task, dispatches framed messages to registered
//! callbacks, and correlates request/response pairs by sequence number.
//!
//! The entry point is [`IpcManager`]. A typical bootstrap:
//!
//! ```no_run
//! # async fn bootstrap() -> shim_ipc::Result<()> {
//! use shim_ipc::{IpcConfig, IpcManager};
//!
//! let manager = IpcManager::new(7);
//! manager.init_ports(&IpcConfig {
//!     server_uri: Some("pipe.srv:proc7".into()),
//!     parent: Some((1, "pipe:proc1".into())),
//!     ..IpcConfig::default()
//! }).await?;
//! manager.init_helper();
//! # Ok(()) }
//! ```
#![warn(missing_docs, missing_debug_implementations)]
#![forbid(unsafe_code)]

mod callback;
pub mod config;
mod dupe;
pub mod frame;
mod helper;
mod manager;
pub mod pal;
mod port;
mod registry;
mod receive;
#[cfg(test)]
mod test;

pub use callback::{Handler, RESPONSE_REQUESTED};
pub use dupe::Dupe;
pub use frame::{Header, Message};
pub use helper::HelperState;
pub use manager::{IpcConfig, IpcManager};
pub use port::{FiniCallback, IpcPort, RoleMask};
pub use registry::PortRegistry;

use thiserror::Error as ThisError;

/// Errno-like codes used where errors cross the wire as response values.
///
/// The fabric does not depend on libc; the numbers match the common Linux
/// assignments so upper layers can pass them through unchanged.
pub mod errno {
    /// No such process.
    pub const ESRCH: i32 = 3;
    /// Interrupted.
    pub const EINTR: i32 = 4;
    /// Bad handle.
    pub const EBADF: i32 = 9;
    /// No child processes.
    pub const ECHILD: i32 = 10;
    /// Try again.
    pub const EAGAIN: i32 = 11;
    /// Out of memory.
    pub const ENOMEM: i32 = 12;
    /// Permission denied.
    pub const EACCES: i32 = 13;
    /// Invalid argument.
    pub const EINVAL: i32 = 22;
    /// Operation not supported.
    pub const EOPNOTSUPP: i32 = 95;
    /// Connection reset by peer.
    pub const ECONNRESET: i32 = 104;
    /// The handle is not connected.
    pub const ENOTCONN: i32 = 107;
}

/// Errors surfaced by the IPC fabric.
#[derive(Debug, ThisError)]
pub enum Error {
    /// A caller-supplied argument was out of range or malformed.
    #[error("invalid argument")]
    InvalidArgument,
    /// An allocation or capacity limit was hit.
    #[error("out of memory")]
    NoMemory,
    /// No data yet on a non-blocking handle, or a wait timed out.
    #[error("try again")]
    Again,
    /// A signal-like wakeup interrupted the operation.
    #[error("interrupted")]
    Interrupted,
    /// The platform refused the operation.
    #[error("permission denied")]
    Denied,
    /// The stream handle was already closed.
    #[error("bad handle")]
    BadHandle,
    /// The operation needs a connected (or connectable) stream.
    #[error("not a connection")]
    NotConnection,
    /// The handle does not support the operation.
    #[error("not supported")]
    NotSupported,
    /// The peer went away.
    #[error("connection reset")]
    ConnectionReset,
    /// No port is registered for the requested peer.
    #[error("no such process")]
    NoSuchProcess,
    /// Generic stream I/O failure with an errno-like code.
    #[error("I/O error (errno {0})")]
    Io(i32),
}

impl Error {
    /// The errno-like code for this error, as a positive number.
    #[must_use]
    pub fn errno(&self) -> i32 {
        match self {
            Self::InvalidArgument => errno::EINVAL,
            Self::NoMemory => errno::ENOMEM,
            Self::Again => errno::EAGAIN,
            Self::Interrupted => errno::EINTR,
            Self::Denied => errno::EACCES,
            Self::BadHandle => errno::EBADF,
            Self::NotConnection => errno::ENOTCONN,
            Self::NotSupported => errno::EOPNOTSUPP,
            Self::ConnectionReset => errno::ECONNRESET,
            Self::NoSuchProcess => errno::ESRCH,
            Self::Io(code) => *code,
        }
    }

    /// The wire representation: a small negative return value.
    #[must_use]
    pub fn retval(&self) -> i32 {
        -self.errno()
    }

    /// Whether a read hitting this error should simply be retried.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Again | Self::Interrupted)
    }
}

/// Crate-wide result type.
pub type Result<T> = std::result::Result<T, Error>;
