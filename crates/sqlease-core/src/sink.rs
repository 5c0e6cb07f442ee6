// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Default observability sink that writes events to `tracing`.

use tracing::{error, warn};

use crate::traits::{ObservabilitySink, SinkEvent};

/// Sink that forwards every event to the tracing subscriber.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl ObservabilitySink for TracingSink {
    fn report(&self, event: SinkEvent) {
        match event {
            SinkEvent::InvariantViolated { owner, message } => {
                error!(%owner, detail = %message, "lease invariant violated");
            }
            SinkEvent::AcquireTimeout {
                owner,
                resource,
                waited,
            } => {
                warn!(%owner, resource, waited_ms = waited.as_millis() as u64, "lease acquire timed out");
            }
            SinkEvent::ForcedShutdown {
                owner,
                resource,
                outstanding,
            } => {
                warn!(%owner, resource, outstanding, "shutdown revoked outstanding leases");
            }
        }
    }
}
