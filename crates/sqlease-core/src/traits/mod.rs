// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Collaborator traits consumed by the lease core.
//!
//! The core never implements these; the engine binding, the caller-side lease
//! holders, and the observability sink are all supplied from outside.

pub mod engine;
pub mod holder;
pub mod observability;

pub use engine::EngineBinding;
pub use holder::{DetachedHolder, LeaseHolder};
pub use observability::{ObservabilitySink, SinkEvent};
