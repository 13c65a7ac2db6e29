//! A trait for cheap clones.
//! SPDX-License-Identifier: Apache-2.0 OR GPL-3.0-or-later
//!
//! `Clone` does not say how expensive the copy is. Types here implement
//! [`Dupe`] only when duplication is a reference-count bump or a pointer
//! copy, so a `.dupe()` in the middle of a hot path is known to be fine.

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// A cheap-to-duplicate value.
pub trait Dupe {
    /// A cheap clone of `self`.
    #[must_use]
    fn dupe(&self) -> Self;
}

impl<T: ?Sized> Dupe for Arc<T> {
    #[inline]
    fn dupe(&self) -> Self {
        Self::clone(self)
    }
}

impl<T> Dupe for mpsc::Sender<T> {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}

impl<T> Dupe for mpsc::UnboundedSender<T> {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}

impl Dupe for Bytes {
    #[inline]
    fn dupe(&self) -> Self {
        self.clone()
    }
}
