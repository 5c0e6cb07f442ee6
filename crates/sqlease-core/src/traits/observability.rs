// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Observability sink trait for invariant violations and timeout diagnostics.

use std::time::Duration;

use crate::types::OwnerId;

/// A structured event reported by a lease owner.
#[derive(Debug, Clone, PartialEq)]
pub enum SinkEvent {
    /// Lease bookkeeping disagreed with a release request.
    InvariantViolated { owner: OwnerId, message: String },
    /// An acquirer gave up waiting for a lease.
    AcquireTimeout {
        owner: OwnerId,
        resource: &'static str,
        waited: Duration,
    },
    /// Shutdown gave up waiting for holders and revoked their leases.
    ForcedShutdown {
        owner: OwnerId,
        resource: &'static str,
        outstanding: usize,
    },
}

/// Structured error-reporting channel.
///
/// `report` is synchronous and infallible. Implementations must hand the event
/// off without blocking; the core never waits on a sink.
pub trait ObservabilitySink: Send + Sync + 'static {
    /// Records one event.
    fn report(&self, event: SinkEvent);
}
