//! Compile-time tunables for the IPC fabric.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

/// Number of buckets in the peer-id index. Must be a power of two: ports
/// are bucketed by the low bits of the peer id.
pub const PEER_BUCKETS: usize = 64;

/// Cap on the number of on-close callbacks one port will carry.
pub const MAX_FINI: usize = 3;

/// Extra bytes requested past the frame currently being read, so that a
/// burst of small messages usually needs a single stream read.
pub const READ_AHEAD: usize = 96;

/// Floor for the receive buffer: one full header plus the read-ahead
/// window.
pub const RECV_BUF: usize = crate::frame::HEADER_LEN + READ_AHEAD;

/// Upper bound on a single frame. A header announcing more than this is
/// treated as stream corruption.
pub const MAX_FRAME_SIZE: u32 = 1 << 20;
