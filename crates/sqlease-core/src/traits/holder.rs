// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Lease holder trait.

use tokio_util::sync::CancellationToken;

/// Caller-side collaborator that can be asked to give up its lease.
///
/// `request_release` is a signal, not a revocation: it must return without
/// blocking, and the holder decides when to actually release.
pub trait LeaseHolder: Send + Sync + 'static {
    /// Ask the holder to wind down its in-flight work and release.
    fn request_release(&self);
}

/// A holder that ignores release requests.
///
/// Used for short single-statement leases that finish on their own.
#[derive(Debug, Clone, Copy, Default)]
pub struct DetachedHolder;

impl LeaseHolder for DetachedHolder {
    fn request_release(&self) {}
}

/// A cancellation token is the natural holder for task-scoped work: the task
/// selects on `cancelled()` and releases when asked.
impl LeaseHolder for CancellationToken {
    fn request_release(&self) {
        self.cancel();
    }
}
