// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::{Mutex, PoisonError};

use sqlease_core::{ObservabilitySink, SinkEvent};

/// Observability sink that keeps every reported event in memory.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<SinkEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<SinkEvent> {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn timeouts(&self) -> usize {
        self.count(|e| matches!(e, SinkEvent::AcquireTimeout { .. }))
    }

    pub fn invariant_violations(&self) -> usize {
        self.count(|e| matches!(e, SinkEvent::InvariantViolated { .. }))
    }

    pub fn forced_shutdowns(&self) -> usize {
        self.count(|e| matches!(e, SinkEvent::ForcedShutdown { .. }))
    }

    fn count(&self, pred: impl Fn(&SinkEvent) -> bool) -> usize {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|e| pred(e))
            .count()
    }
}

impl ObservabilitySink for RecordingSink {
    fn report(&self, event: SinkEvent) {
        self.events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(event);
    }
}
