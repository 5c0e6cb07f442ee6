// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connection-lease core for a single-file database with one writer and many readers.
//!
//! - [`ReadonlyConnectionPool`] hands out up to `pool_size` interchangeable
//!   reader connections, created lazily.
//! - [`WriteConnection`] guards the single writer behind a FIFO lock bounded by
//!   the acquire timeout, and connects eagerly so journal setup happens before
//!   readers attach.
//! - [`ConnectionLease`] binds one physical connection to its owner and holder,
//!   and returns it to the owner exactly once.
//! - [`Driver`] owns one of each and routes callers.
//!
//! Every wait is bounded by [`TimeoutTimer`]; shutdown asks holders to release,
//! waits up to the destroy timeout, then revokes what is left.

pub mod driver;
pub mod lease;
pub mod readonly_pool;
pub mod recording;
pub mod timer;
pub mod write_connection;

pub use driver::{Driver, DriverStats, Session};
pub use lease::{ConnectionGuard, ConnectionLease, LeaseOwner, LeaseTicket, PhysicalConnection};
pub use readonly_pool::{PoolStats, ReadonlyConnectionPool};
pub use timer::{Deadline, Elapsed, TimeoutTimer};
pub use write_connection::{WriteConnection, WriteSlotState, WriteStats};

pub use sqlease_config::LeaseTimeouts;
