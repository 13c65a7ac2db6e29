//! Framed stream I/O: the receive loop and frame-atomic sends.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! The receive routine is shared by two callers with different needs. The
//! helper calls it with `match_seq = 0` after a port polled readable, and
//! it dispatches every complete frame to the callback table until the
//! stream has nothing buffered. A requester calls it with its own
//! sequence number and gets the matching frame back, while every other
//! frame encountered on the way is dispatched as usual. Per-handle
//! exclusion lives on the port, so the two callers never parse the same
//! byte stream concurrently.
//!
//! The working buffer also lives on the port, inside that exclusion
//! mutex. Reads deliberately ask for more than the current frame, and a
//! sequence-match caller returns as soon as its frame surfaces, so
//! whatever was read past that point must survive the return; the next
//! call on the port picks it up before touching the stream again.

use crate::callback::{CallbackTable, RESPONSE_REQUESTED};
use crate::config::READ_AHEAD;
use crate::frame::{Header, Message, HEADER_LEN};
use crate::port::IpcPort;
use crate::registry::PortRegistry;
use crate::{errno, Dupe, Error, Result};
use std::sync::Arc;
use tracing::{trace, warn};

/// Everything the receive path needs from its surroundings.
pub(crate) struct ReceiveEnv<'a> {
    pub(crate) self_id: u32,
    pub(crate) registry: &'a PortRegistry,
    pub(crate) handlers: &'a CallbackTable,
    /// Replies to request frames are only ever written by the helper.
    pub(crate) from_helper: bool,
}

/// Write one message as a single uninterleaved frame.
pub(crate) async fn send_on_port(port: &Arc<IpcPort>, msg: &Message) -> Result<()> {
    let handle = port.handle()?;
    let frame = msg.encode();
    let _exclusive = port.send_exclusion.lock().await;
    let mut written = 0;
    while written < frame.len() {
        let n = handle.write(&frame[written..]).await?;
        if n == 0 {
            return Err(Error::ConnectionReset);
        }
        written += n;
    }
    trace!(
        code = msg.code,
        seq = msg.seq,
        dst = msg.dst,
        len = frame.len(),
        "sent frame"
    );
    Ok(())
}

/// Read and process frames on `port`.
///
/// With `match_seq != 0`, returns the frame carrying that sequence number.
/// With `match_seq = 0` (helper mode), dispatches until the stream drains
/// and returns `None`.
///
/// On a dead stream the port is torn down with the appropriate exit code
/// and the error is returned; callers need not clean up.
pub(crate) async fn receive_on_port(
    env: &ReceiveEnv<'_>,
    port: &Arc<IpcPort>,
    match_seq: u64,
) -> Result<Option<Message>> {
    // The guard is both the read exclusion and the buffer: an early
    // return leaves read-ahead bytes in place for the next call.
    let mut buf = port.recv_carry.lock().await;
    let handle = port.handle()?;
    // How much of the frame currently at the front we know we still need.
    let mut expected = HEADER_LEN;
    loop {
        while buf.len() >= HEADER_LEN {
            let header = match Header::parse(&buf) {
                Ok(header) => header,
                Err(e) => {
                    // A header announcing an impossible size means the
                    // byte stream itself is no longer trustworthy.
                    warn!(peer_id = port.peer_id(), "corrupt frame header: {e}");
                    env.registry.delete_port(port, e.errno());
                    return Err(e);
                }
            };
            let size = header.size as usize;
            if buf.len() < size {
                expected = size;
                break;
            }
            let msg = Message::from_frame(&header, buf.split_to(size).freeze());
            expected = HEADER_LEN;
            trace!(
                code = msg.code,
                seq = msg.seq,
                src = msg.src,
                "received frame"
            );
            if match_seq != 0 && msg.seq == match_seq {
                return Ok(Some(msg));
            }
            if msg.src == env.self_id {
                // Our own broadcast coming back around.
                trace!("dropping echoed frame");
                continue;
            }
            dispatch(env, port, msg).await;
        }

        if match_seq == 0 && buf.is_empty() {
            // Helper mode: once nothing is buffered on either side there
            // is nothing left to dispatch this round.
            let attrs = handle.attrs()?;
            if !attrs.readable {
                return Ok(None);
            }
        }

        let want = expected.saturating_sub(buf.len()) + READ_AHEAD;
        let start = buf.len();
        buf.resize(start + want, 0);
        let n = loop {
            match handle.read(&mut buf[start..]).await {
                Ok(n) => break n,
                Err(e) if e.is_transient() => continue,
                Err(e) => {
                    env.registry.delete_port(port, e.errno());
                    return Err(e);
                }
            }
        };
        buf.truncate(start + n);
        if n == 0 {
            trace!(peer_id = port.peer_id(), "stream ended");
            env.registry.delete_port(port, errno::ECONNRESET);
            return Err(Error::ConnectionReset);
        }
    }
}

async fn dispatch(env: &ReceiveEnv<'_>, port: &Arc<IpcPort>, msg: Message) {
    let (message_code, seq, src) = (msg.code, msg.seq, msg.src);
    let verdict = match env.handlers.get(message_code) {
        Some(handler) => handler(msg, port.dupe()).await,
        None => {
            warn!(code = message_code, "no handler for message");
            -errno::EOPNOTSUPP
        }
    };
    // Responses are never themselves answered, whatever their verdict.
    if message_code == crate::frame::code::RESP {
        return;
    }
    if env.from_helper && seq != 0 && (verdict < 0 || verdict == RESPONSE_REQUESTED) {
        let retval = if verdict == RESPONSE_REQUESTED { 0 } else { verdict };
        let reply = Message::response(env.self_id, src, seq, retval);
        if let Err(e) = send_on_port(port, &reply).await {
            warn!(seq, "failed to answer request: {e}");
        }
    }
}
