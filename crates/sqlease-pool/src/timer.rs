// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Cancelable deadline used to bound every blocking wait.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// How a [`TimeoutTimer`] wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deadline {
    /// The deadline passed.
    Elapsed,
    /// [`TimeoutTimer::clear`] was called first.
    Cleared,
}

/// Returned by [`TimeoutTimer::race`] when the deadline wins. Carries the
/// time since the timer started, which can overshoot the configured duration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("deadline of {0:?} elapsed")]
pub struct Elapsed(pub Duration);

/// A started deadline that can be awaited, raced against a future, or cleared.
///
/// Clones share the same deadline and the same clear signal.
#[derive(Debug, Clone)]
pub struct TimeoutTimer {
    duration: Duration,
    started: Instant,
    deadline: Instant,
    cleared: CancellationToken,
}

impl TimeoutTimer {
    /// Start a deadline `duration` from now.
    pub fn start(duration: Duration) -> Self {
        let started = Instant::now();
        Self {
            duration,
            started,
            deadline: started + duration,
            cleared: CancellationToken::new(),
        }
    }

    /// The duration the timer was started with.
    pub fn duration(&self) -> Duration {
        self.duration
    }

    /// Time since [`start`](Self::start).
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Time left before the deadline; zero once it has passed.
    pub fn remaining(&self) -> Duration {
        self.deadline.saturating_duration_since(Instant::now())
    }

    /// Cancel the deadline. Pending and future waits resolve as [`Deadline::Cleared`].
    pub fn clear(&self) {
        self.cleared.cancel();
    }

    /// Whether [`clear`](Self::clear) has been called.
    pub fn is_cleared(&self) -> bool {
        self.cleared.is_cancelled()
    }

    /// Wait until the deadline passes or the timer is cleared.
    pub async fn wait(&self) -> Deadline {
        tokio::select! {
            biased;
            _ = self.cleared.cancelled() => Deadline::Cleared,
            _ = sleep_until(self.deadline) => Deadline::Elapsed,
        }
    }

    /// Drive `fut` until it completes or the deadline passes.
    ///
    /// A future that is ready at the same instant the deadline passes wins.
    /// Clearing the timer mid-race lets `fut` run to completion unbounded.
    /// The losing future is dropped, which removes it from any wait queue.
    pub async fn race<F: Future>(&self, fut: F) -> Result<F::Output, Elapsed> {
        tokio::pin!(fut);
        tokio::select! {
            biased;
            out = &mut fut => return Ok(out),
            deadline = self.wait() => {
                if deadline == Deadline::Elapsed {
                    return Err(Elapsed(self.elapsed()));
                }
            }
        }
        Ok(fut.await)
    }
}
