// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

use std::sync::atomic::{AtomicUsize, Ordering};

use sqlease_core::LeaseHolder;
use tokio_util::sync::CancellationToken;

/// Lease holder that counts release requests.
///
/// Each request also cancels [`RecordingHolder::token`], so a test task can
/// comply by awaiting `token().cancelled()` and then releasing its lease.
#[derive(Debug, Default)]
pub struct RecordingHolder {
    requests: AtomicUsize,
    token: CancellationToken,
}

impl RecordingHolder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl LeaseHolder for RecordingHolder {
    fn request_release(&self) {
        self.requests.fetch_add(1, Ordering::SeqCst);
        self.token.cancel();
    }
}
