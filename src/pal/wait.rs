//! Waiting on several handles at once.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use super::{PalEvent, PalHandle};
use crate::{Error, Result};
use std::future::poll_fn;
use std::task::{Context, Poll};
use std::time::Duration;

/// Anything [`multi_wait`] can park on. `Sync` so a wait set can live
/// across the suspension inside a spawned task.
pub trait Waitable: Sync {
    /// Readiness of the object, registering the caller for wakeup.
    fn poll_signaled(&self, cx: &mut Context<'_>) -> Poll<()>;
}

impl Waitable for PalEvent {
    fn poll_signaled(&self, cx: &mut Context<'_>) -> Poll<()> {
        Self::poll_signaled(self, cx)
    }
}

impl Waitable for PalHandle {
    fn poll_signaled(&self, cx: &mut Context<'_>) -> Poll<()> {
        (**self).poll_signaled(cx)
    }
}

/// Wait until one member of `set` is signaled and return its index.
///
/// Members are polled in order, so earlier slots win ties; callers that
/// reserve slot 0 for a control event get to observe it first.
///
/// # Errors
/// [`Error::Again`] when `timeout` elapses first. A zero timeout turns the
/// call into a non-suspending poll of the whole set.
pub async fn multi_wait(set: &[&dyn Waitable], timeout: Option<Duration>) -> Result<usize> {
    let any_signaled = poll_fn(|cx| {
        for (index, member) in set.iter().enumerate() {
            if member.poll_signaled(cx).is_ready() {
                return Poll::Ready(index);
            }
        }
        Poll::Pending
    });
    match timeout {
        None => Ok(any_signaled.await),
        Some(limit) => tokio::time::timeout(limit, any_signaled)
            .await
            .map_err(|_| Error::Again),
    }
}
