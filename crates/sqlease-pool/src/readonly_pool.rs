// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Bounded pool of interchangeable reader connections.
//!
//! Per-slot lifecycle:
//!
//! ```text
//! Unallocated --create--> Leased --release--> Idle --acquire--> Leased
//! Leased --release(invalid or closed)--> Destroying --destroyed--> Unallocated
//! Leased --release after forced close--> Unallocated
//! ```
//!
//! Capacity is a FIFO semaphore with one permit per slot. A lease carries its
//! permit, so a waiter is only woken once the released slot is already back
//! in `Idle` or `Unallocated`.

use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Instant;

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlease_config::{LeaseTimeouts, PoolConfig};
use sqlease_core::{
    EngineBinding, LeaseHolder, LeaseId, ObservabilitySink, OpenMode, OwnerId, SinkEvent,
    SqleaseError,
};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

use crate::lease::{
    run_scoped, share, take_connection, ConnectionLease, LeaseOwner, LeaseTicket,
    PhysicalConnection, SharedConnection,
};
use crate::recording;
use crate::timer::{Elapsed, TimeoutTimer};

const OWNER: &str = "reader";
const RESOURCE: &str = "reader pool";

/// Point-in-time view of a reader pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Configured `pool_size`.
    pub max_size: usize,
    /// Slots holding or creating a connection.
    pub allocated: usize,
    pub idle: usize,
    pub leased: usize,
    pub created_total: u64,
    pub destroyed_total: u64,
    pub timeouts_total: u64,
    pub closed: bool,
}

enum Slot<C> {
    Unallocated,
    Creating,
    Idle(PhysicalConnection<C>),
    Leased(Arc<LeaseTicket>, SharedConnection<C>),
    /// Invalidated or shut down; never handed out again.
    Destroying,
}

struct PoolState<C> {
    slots: Vec<Slot<C>>,
    closed: bool,
}

impl<C> PoolState<C> {
    fn leased(&self) -> impl Iterator<Item = (&Arc<LeaseTicket>, &SharedConnection<C>)> {
        self.slots.iter().filter_map(|slot| match slot {
            Slot::Leased(ticket, cell) => Some((ticket, cell)),
            _ => None,
        })
    }

    fn position_of(&self, lease: LeaseId) -> Option<usize> {
        self.slots
            .iter()
            .position(|slot| matches!(slot, Slot::Leased(t, _) if t.id() == lease))
    }

    /// Reserve a slot for a caller that already holds a permit.
    fn claim(&mut self) -> Claim<C> {
        if let Some(index) = self.slots.iter().position(|s| matches!(s, Slot::Idle(_))) {
            if let Slot::Idle(conn) = mem::replace(&mut self.slots[index], Slot::Creating) {
                return Claim::Reuse(index, conn);
            }
        }
        match self.slots.iter().position(|s| matches!(s, Slot::Unallocated)) {
            Some(index) => {
                self.slots[index] = Slot::Creating;
                Claim::Create(index)
            }
            None => Claim::Exhausted,
        }
    }
}

enum Claim<C> {
    Reuse(usize, PhysicalConnection<C>),
    Create(usize),
    Exhausted,
}

fn lock<C>(state: &Mutex<PoolState<C>>) -> MutexGuard<'_, PoolState<C>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Resets a slot to `Unallocated` when dropped, unless disarmed.
///
/// Covers engine failures and cancelled futures during create and destroy.
struct SlotReset<'p, C> {
    state: &'p Mutex<PoolState<C>>,
    index: usize,
    armed: bool,
}

impl<'p, C> SlotReset<'p, C> {
    fn new(state: &'p Mutex<PoolState<C>>, index: usize) -> Self {
        Self {
            state,
            index,
            armed: true,
        }
    }

    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<C> Drop for SlotReset<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.state).slots[self.index] = Slot::Unallocated;
        }
    }
}

struct PoolInner<E: EngineBinding> {
    id: OwnerId,
    engine: Arc<E>,
    sink: Arc<dyn ObservabilitySink>,
    timeouts: LeaseTimeouts,
    max_size: usize,
    permits: Arc<Semaphore>,
    state: Mutex<PoolState<E::Connection>>,
    leased: watch::Sender<usize>,
    created: AtomicU64,
    destroyed: AtomicU64,
    timeouts_total: AtomicU64,
}

/// Reader connection pool. Cheap to clone; clones share the same slots.
pub struct ReadonlyConnectionPool<E: EngineBinding> {
    inner: Arc<PoolInner<E>>,
}

impl<E: EngineBinding> Clone for ReadonlyConnectionPool<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: EngineBinding> ReadonlyConnectionPool<E> {
    /// Create a pool of `config.pool_size` slots. No connection is opened yet.
    pub fn new(engine: Arc<E>, config: &PoolConfig, sink: Arc<dyn ObservabilitySink>) -> Self {
        let max_size = config.pool_size.max(1);
        let slots = (0..max_size).map(|_| Slot::Unallocated).collect();
        Self {
            inner: Arc::new(PoolInner {
                id: OwnerId::next(),
                engine,
                sink,
                timeouts: config.timeouts(),
                max_size,
                permits: Arc::new(Semaphore::new(max_size)),
                state: Mutex::new(PoolState {
                    slots,
                    closed: false,
                }),
                leased: watch::Sender::new(0),
                created: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
                timeouts_total: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> OwnerId {
        self.inner.id
    }

    pub fn max_size(&self) -> usize {
        self.inner.max_size
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    /// Readers connect lazily on first acquisition, so this only logs.
    pub async fn connect(&self) -> Result<(), SqleaseError> {
        debug!(owner = %self.inner.id, max_size = self.inner.max_size, "reader pool ready (lazy)");
        Ok(())
    }

    /// Acquire a lease, run `f` with it, and release it on every exit path.
    ///
    /// `f`'s error is returned after the lease has been released.
    pub async fn run_exclusive<T, F>(
        &self,
        holder: Arc<dyn LeaseHolder>,
        f: F,
    ) -> Result<T, SqleaseError>
    where
        F: for<'a> FnOnce(
            &'a ConnectionLease<E::Connection>,
        ) -> BoxFuture<'a, Result<T, SqleaseError>>,
    {
        let lease = self.inner.acquire(holder).await?;
        run_scoped(lease, f).await
    }

    /// Acquire a lease that the caller releases manually.
    pub async fn lease_connection(
        &self,
        holder: Arc<dyn LeaseHolder>,
    ) -> Result<ConnectionLease<E::Connection>, SqleaseError> {
        self.inner.acquire(holder).await
    }

    /// Mark the lease's connection as unusable so release destroys it.
    pub fn invalidate_connection(&self, lease: &ConnectionLease<E::Connection>) {
        if lease.owner_id() != self.inner.id {
            self.inner.report_foreign(lease, "invalidated");
            return;
        }
        lease.mark_as_invalid();
    }

    /// Return the lease's connection: back to idle, or destroyed when invalid.
    ///
    /// Releasing an already-released lease does nothing. A lease issued by a
    /// different owner is reported to the sink and left untouched.
    pub async fn release_connection(&self, lease: &mut ConnectionLease<E::Connection>) {
        if lease.is_released() {
            return;
        }
        if lease.owner_id() != self.inner.id {
            self.inner.report_foreign(lease, "released");
            return;
        }
        lease.release().await;
    }

    /// Shut the pool down.
    ///
    /// Waiters and later acquirers fail immediately. Holders are asked to
    /// release; whatever is still out after the destroy timeout is revoked
    /// and its connection destroyed, unless a statement is still running on
    /// it, in which case the late release destroys it. Idle connections are
    /// destroyed too. Calling `close` again does nothing.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    pub fn stats(&self) -> PoolStats {
        let inner = &self.inner;
        let state = lock(&inner.state);
        let mut stats = PoolStats {
            max_size: inner.max_size,
            created_total: inner.created.load(Ordering::Relaxed),
            destroyed_total: inner.destroyed.load(Ordering::Relaxed),
            timeouts_total: inner.timeouts_total.load(Ordering::Relaxed),
            closed: state.closed,
            ..PoolStats::default()
        };
        for slot in &state.slots {
            match slot {
                Slot::Unallocated => continue,
                Slot::Idle(_) => stats.idle += 1,
                Slot::Leased(..) => stats.leased += 1,
                Slot::Creating | Slot::Destroying => {}
            }
            stats.allocated += 1;
        }
        stats
    }
}

impl<E: EngineBinding> PoolInner<E> {
    fn closed_error() -> SqleaseError {
        SqleaseError::DriverAlreadyReleased {
            resource: RESOURCE.to_string(),
        }
    }

    fn report_foreign(&self, lease: &ConnectionLease<E::Connection>, action: &str) {
        self.sink.report(SinkEvent::InvariantViolated {
            owner: self.id,
            message: format!(
                "{} from {} was {action} through reader pool {}",
                lease.id(),
                lease.owner_id(),
                self.id
            ),
        });
    }

    async fn acquire(
        self: &Arc<Self>,
        holder: Arc<dyn LeaseHolder>,
    ) -> Result<ConnectionLease<E::Connection>, SqleaseError> {
        if lock(&self.state).closed {
            return Err(Self::closed_error());
        }

        let started = Instant::now();
        let timer = TimeoutTimer::start(self.timeouts.acquire);
        let permit = match timer.race(Arc::clone(&self.permits).acquire_owned()).await {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(Self::closed_error()),
            Err(Elapsed(waited)) => {
                self.timeouts_total.fetch_add(1, Ordering::Relaxed);
                recording::record_timeout(OWNER);
                self.sink.report(SinkEvent::AcquireTimeout {
                    owner: self.id,
                    resource: RESOURCE,
                    waited,
                });
                return Err(SqleaseError::PoolAcquireTimeout { duration: waited });
            }
        };
        timer.clear();

        let claim = {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(Self::closed_error());
            }
            state.claim()
        };

        let (index, conn) = match claim {
            Claim::Reuse(index, conn) => (index, conn),
            Claim::Create(index) => {
                let reset = SlotReset::new(&self.state, index);
                let raw = self.engine.create_connection(OpenMode::ReadOnly).await?;
                reset.disarm();
                let conn = PhysicalConnection::new(OpenMode::ReadOnly, raw);
                self.created.fetch_add(1, Ordering::Relaxed);
                recording::record_created(OWNER);
                debug!(owner = %self.id, connection = %conn.id(), slot = index, "reader connection created");
                (index, conn)
            }
            Claim::Exhausted => {
                let message = format!("reader pool {} had no free slot for a permit holder", self.id);
                self.sink.report(SinkEvent::InvariantViolated {
                    owner: self.id,
                    message: message.clone(),
                });
                return Err(SqleaseError::Internal(message));
            }
        };

        let ticket = LeaseTicket::new(self.id, conn.id(), holder);
        let connection = conn.id();
        let rejected = {
            let mut state = lock(&self.state);
            if state.closed {
                state.slots[index] = Slot::Unallocated;
                Err(conn)
            } else {
                let cell = share(conn);
                state.slots[index] = Slot::Leased(Arc::clone(&ticket), Arc::clone(&cell));
                Ok(cell)
            }
        };
        let cell = match rejected {
            Ok(cell) => cell,
            Err(conn) => {
                self.destroy(conn, false).await;
                return Err(Self::closed_error());
            }
        };

        self.leased.send_modify(|n| *n += 1);
        recording::set_active_leases(OWNER, *self.leased.borrow());
        recording::record_lease_acquired(OWNER, started.elapsed());
        debug!(owner = %self.id, lease = %ticket.id(), %connection, "reader lease issued");

        let owner: Arc<dyn LeaseOwner<E::Connection>> = Arc::clone(self) as _;
        Ok(ConnectionLease::new(ticket, cell, owner, permit))
    }

    async fn destroy(&self, conn: PhysicalConnection<E::Connection>, invalidated: bool) {
        let id = conn.id();
        self.engine.destroy_connection(conn.into_inner()).await;
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        recording::record_destroyed(OWNER, invalidated);
        debug!(owner = %self.id, connection = %id, invalidated, "reader connection destroyed");
    }

    fn finish_release(&self, ticket: &LeaseTicket) {
        self.leased.send_modify(|n| *n = n.saturating_sub(1));
        recording::set_active_leases(OWNER, *self.leased.borrow());
        debug!(owner = %self.id, lease = %ticket.id(), held_ms = ticket.held_for().as_millis() as u64, "reader lease released");
    }

    async fn close(&self) {
        let outstanding: Vec<Arc<LeaseTicket>> = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.leased().map(|(ticket, _)| Arc::clone(ticket)).collect()
        };
        self.permits.close();
        info!(owner = %self.id, outstanding = outstanding.len(), "closing reader pool");

        for ticket in &outstanding {
            ticket.request_release();
        }

        let timer = TimeoutTimer::start(self.timeouts.destroy);
        let mut leased = self.leased.subscribe();
        let drained = timer
            .race(async move {
                let _ = leased.wait_for(|n| *n == 0).await;
            })
            .await;
        timer.clear();

        if drained.is_err() {
            let stragglers: Vec<(Arc<LeaseTicket>, SharedConnection<E::Connection>)> = lock(&self.state)
                .leased()
                .map(|(ticket, cell)| (Arc::clone(ticket), Arc::clone(cell)))
                .collect();
            for (ticket, _) in &stragglers {
                ticket.revoke();
            }
            warn!(
                owner = %self.id,
                revoked = stragglers.len(),
                timeout_ms = self.timeouts.destroy.as_millis() as u64,
                "reader holders did not release before the destroy timeout"
            );
            self.sink.report(SinkEvent::ForcedShutdown {
                owner: self.id,
                resource: RESOURCE,
                outstanding: stragglers.len(),
            });
            for (ticket, cell) in stragglers {
                match take_connection(&cell) {
                    Ok(Some(conn)) => self.destroy(conn, false).await,
                    Ok(None) => {}
                    Err(_) => warn!(
                        owner = %self.id,
                        lease = %ticket.id(),
                        "revoked reader still running a statement; destroyed on release"
                    ),
                }
            }
        }

        let idle: Vec<(usize, PhysicalConnection<E::Connection>)> = {
            let mut state = lock(&self.state);
            state
                .slots
                .iter_mut()
                .enumerate()
                .filter_map(|(index, slot)| match mem::replace(slot, Slot::Destroying) {
                    Slot::Idle(conn) => Some((index, conn)),
                    other => {
                        *slot = other;
                        None
                    }
                })
                .collect()
        };
        for (index, conn) in idle {
            let _reset = SlotReset::new(&self.state, index);
            self.destroy(conn, false).await;
        }
        info!(owner = %self.id, "reader pool closed");
    }
}

#[async_trait]
impl<E: EngineBinding> LeaseOwner<E::Connection> for PoolInner<E> {
    async fn reclaim(&self, ticket: &LeaseTicket, conn: Option<PhysicalConnection<E::Connection>>) {
        let invalid = ticket.is_invalid();
        let (index, conn) = {
            let mut state = lock(&self.state);
            match (state.position_of(ticket.id()), conn) {
                (Some(index), Some(conn)) if !invalid && !state.closed => {
                    state.slots[index] = Slot::Idle(conn);
                    drop(state);
                    self.finish_release(ticket);
                    return;
                }
                (Some(index), Some(conn)) => {
                    state.slots[index] = Slot::Destroying;
                    (Some(index), Some(conn))
                }
                // Shutdown already destroyed this connection.
                (Some(index), None) => {
                    state.slots[index] = Slot::Unallocated;
                    (Some(index), None)
                }
                (None, conn) => (None, conn),
            }
        };

        if index.is_none() {
            self.sink.report(SinkEvent::InvariantViolated {
                owner: self.id,
                message: format!("{} returned a connection reader pool {} does not track", ticket.id(), self.id),
            });
        }

        if let Some(conn) = conn {
            let reset = index.map(|index| SlotReset::new(&self.state, index));
            self.destroy(conn, invalid).await;
            drop(reset);
        }

        if index.is_some() {
            self.finish_release(ticket);
        }
    }

    fn abandon(&self, ticket: &LeaseTicket) {
        let tracked = {
            let mut state = lock(&self.state);
            match state.position_of(ticket.id()) {
                Some(index) => {
                    state.slots[index] = Slot::Unallocated;
                    true
                }
                None => false,
            }
        };
        if tracked {
            self.finish_release(ticket);
        }
    }
}
