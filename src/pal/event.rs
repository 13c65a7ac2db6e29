//! Manual-reset wakeup event.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later

use futures_util::task::AtomicWaker;
use std::future::poll_fn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

/// An event object with `set`/`clear`/`wait` semantics.
///
/// Once set, the event stays signaled until [`clear`](Self::clear) is
/// called, so a `set` issued while nobody is waiting is not lost.
// Atomic ordering: the flag does not protect any other memory, it *is* the
// whole state, so `Relaxed` is enough everywhere.
#[derive(Debug, Default)]
pub struct PalEvent {
    set: AtomicBool,
    waker: AtomicWaker,
}

impl PalEvent {
    /// A new, unsignaled event.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal the event and wake any waiter.
    pub fn set(&self) {
        self.set.store(true, Ordering::Relaxed);
        self.waker.wake();
    }

    /// Reset the event to unsignaled.
    pub fn clear(&self) {
        self.set.store(false, Ordering::Relaxed);
    }

    /// Whether the event is currently signaled.
    #[must_use]
    pub fn is_set(&self) -> bool {
        self.set.load(Ordering::Relaxed)
    }

    /// Readiness of the event, registering the caller for wakeup.
    pub fn poll_signaled(&self, cx: &mut Context<'_>) -> Poll<()> {
        if self.set.load(Ordering::Relaxed) {
            return Poll::Ready(());
        }
        self.waker.register(cx.waker());
        // A `set` may have slipped in between the check and the register.
        if self.set.load(Ordering::Relaxed) {
            Poll::Ready(())
        } else {
            Poll::Pending
        }
    }

    /// Suspend until the event is signaled.
    pub async fn wait(&self) {
        poll_fn(|cx| self.poll_signaled(cx)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn set_before_wait_is_not_lost() {
        let event = PalEvent::new();
        event.set();
        event.wait().await;
        assert!(event.is_set());
        event.clear();
        assert!(!event.is_set());
    }

    #[tokio::test]
    async fn set_wakes_a_parked_waiter() {
        let event = Arc::new(PalEvent::new());
        let waiter = {
            let event = Arc::clone(&event);
            tokio::spawn(async move { event.wait().await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        event.set();
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should wake")
            .unwrap();
    }
}
