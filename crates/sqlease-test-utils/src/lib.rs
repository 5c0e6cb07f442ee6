// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Test utilities for sqlease integration tests.
//!
//! Deterministic stand-ins for the collaborators the lease core consumes, so
//! pool and write-slot behavior can be tested without a database file.
//!
//! # Components
//!
//! - [`MockEngine`] - engine binding with generation-marked connections and fault injection
//! - [`RecordingHolder`] - lease holder that counts release requests
//! - [`RecordingSink`] - observability sink that keeps every event

pub mod mock_engine;
pub mod mock_holder;
pub mod recording_sink;

pub use mock_engine::{MockConnection, MockEngine};
pub use mock_holder::RecordingHolder;
pub use recording_sink::RecordingSink;
