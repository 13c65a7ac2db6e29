//! Message-code dispatch table.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use crate::frame::{code, Message};
use crate::port::IpcPort;
use crate::{Error, Result};
use futures_util::future::BoxFuture;
use parking_lot::RwLock;
use std::sync::Arc;

/// Verdict a handler returns to have the helper answer the request with a
/// zero return value. Any negative verdict is sent back as-is.
pub const RESPONSE_REQUESTED: i32 = i32::MAX;

/// A registered message handler.
///
/// Return `>= 0` for "handled"; return a negative errno or
/// [`RESPONSE_REQUESTED`] to make the helper send an `IPC_RESP` back to
/// the sender of a request (seq != 0) frame.
pub type Handler =
    Arc<dyn Fn(Message, Arc<IpcPort>) -> BoxFuture<'static, i32> + Send + Sync>;

/// Fixed-size table mapping message codes to handlers.
pub struct CallbackTable {
    slots: RwLock<Vec<Option<Handler>>>,
}

impl std::fmt::Debug for CallbackTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registered: Vec<usize> = self
            .slots
            .read()
            .iter()
            .enumerate()
            .filter_map(|(code, slot)| slot.as_ref().map(|_| code))
            .collect();
        f.debug_struct("CallbackTable")
            .field("registered", &registered)
            .finish()
    }
}

impl CallbackTable {
    pub(crate) fn new() -> Self {
        Self {
            slots: RwLock::new(vec![None; code::NUM_CODES]),
        }
    }

    /// Install `handler` for `code`, replacing any previous one.
    ///
    /// # Errors
    /// [`Error::InvalidArgument`] for codes outside the table.
    pub fn register(&self, message_code: u16, handler: Handler) -> Result<()> {
        let mut slots = self.slots.write();
        let slot = slots
            .get_mut(message_code as usize)
            .ok_or(Error::InvalidArgument)?;
        *slot = Some(handler);
        Ok(())
    }

    /// The handler for `code`, cloned out so callers never hold the table
    /// lock across the call.
    pub(crate) fn get(&self, message_code: u16) -> Option<Handler> {
        self.slots
            .read()
            .get(message_code as usize)
            .and_then(Clone::clone)
    }
}
