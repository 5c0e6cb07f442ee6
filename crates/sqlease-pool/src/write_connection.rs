// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! The single writer connection behind a fair lock.
//!
//! At most one write lease exists at a time. Waiters queue on a one-permit
//! FIFO semaphore, so the write lock is granted in request order and every
//! wait is bounded by the acquire timeout. The permit travels inside the
//! lease and is dropped only after the connection is back in the slot.

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
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tracing::{debug, info, warn};

use crate::lease::{
    run_scoped, share, take_connection, ConnectionLease, LeaseOwner, LeaseTicket,
    PhysicalConnection, SharedConnection,
};
use crate::recording;
use crate::timer::{Elapsed, TimeoutTimer};

const OWNER: &str = "writer";
const RESOURCE: &str = "write connection";

/// Coarse state of the write slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteSlotState {
    Absent,
    Connecting,
    Idle,
    Leased,
}

/// Point-in-time view of the write slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteStats {
    pub state: WriteSlotState,
    pub active_lease: Option<LeaseId>,
    pub created_total: u64,
    pub destroyed_total: u64,
    pub timeouts_total: u64,
    pub closed: bool,
}

enum WriteSlot<C> {
    Absent,
    Connecting,
    Idle(PhysicalConnection<C>),
    Leased(Arc<LeaseTicket>, SharedConnection<C>),
}

struct WriteState<C> {
    slot: WriteSlot<C>,
    closed: bool,
}

impl<C> WriteState<C> {
    fn active(&self) -> Option<&Arc<LeaseTicket>> {
        match &self.slot {
            WriteSlot::Leased(ticket, _) => Some(ticket),
            _ => None,
        }
    }
}

fn lock<C>(state: &Mutex<WriteState<C>>) -> MutexGuard<'_, WriteState<C>> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Puts the slot back to `Absent` if connection setup fails or is cancelled.
struct ConnectingGuard<'w, C> {
    state: &'w Mutex<WriteState<C>>,
    armed: bool,
}

impl<C> ConnectingGuard<'_, C> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl<C> Drop for ConnectingGuard<'_, C> {
    fn drop(&mut self) {
        if self.armed {
            lock(self.state).slot = WriteSlot::Absent;
        }
    }
}

struct WriteInner<E: EngineBinding> {
    id: OwnerId,
    engine: Arc<E>,
    sink: Arc<dyn ObservabilitySink>,
    timeouts: LeaseTimeouts,
    write_lock: Arc<Semaphore>,
    state: Mutex<WriteState<E::Connection>>,
    active: watch::Sender<bool>,
    created: AtomicU64,
    destroyed: AtomicU64,
    timeouts_total: AtomicU64,
}

/// Owner of the single read-write connection. Cheap to clone.
pub struct WriteConnection<E: EngineBinding> {
    inner: Arc<WriteInner<E>>,
}

impl<E: EngineBinding> Clone for WriteConnection<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: EngineBinding> WriteConnection<E> {
    pub fn new(engine: Arc<E>, config: &PoolConfig, sink: Arc<dyn ObservabilitySink>) -> Self {
        Self {
            inner: Arc::new(WriteInner {
                id: OwnerId::next(),
                engine,
                sink,
                timeouts: config.timeouts(),
                write_lock: Arc::new(Semaphore::new(1)),
                state: Mutex::new(WriteState {
                    slot: WriteSlot::Absent,
                    closed: false,
                }),
                active: watch::Sender::new(false),
                created: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
                timeouts_total: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> OwnerId {
        self.inner.id
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.inner.state).closed
    }

    /// Open the writer now instead of on first use.
    ///
    /// Journal and pragma setup runs on the writer, so connecting it before
    /// any reader keeps readers from racing that setup.
    pub async fn connect(&self) -> Result<(), SqleaseError> {
        let inner = &self.inner;
        let _permit = inner.lock_writer().await?;
        let conn = inner.take_or_create().await?;
        let rejected = {
            let mut state = lock(&inner.state);
            if state.closed {
                state.slot = WriteSlot::Absent;
                Some(conn)
            } else {
                state.slot = WriteSlot::Idle(conn);
                None
            }
        };
        match rejected {
            Some(conn) => {
                inner.destroy(conn, false).await;
                Err(WriteInner::<E>::closed_error())
            }
            None => Ok(()),
        }
    }

    /// Take the write lock, run `f` on the writer, then release on every path.
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

    /// Take the write lock and hand the lease to the caller.
    ///
    /// The lock is held until the lease is released or dropped.
    pub async fn lease_connection(
        &self,
        holder: Arc<dyn LeaseHolder>,
    ) -> Result<ConnectionLease<E::Connection>, SqleaseError> {
        self.inner.acquire(holder).await
    }

    /// Mark the writer as unusable so release destroys it.
    pub fn invalidate_connection(&self, lease: &ConnectionLease<E::Connection>) {
        if lease.owner_id() != self.inner.id {
            self.inner.report_foreign(lease, "invalidated");
            return;
        }
        lease.mark_as_invalid();
    }

    /// Return the writer and hand the lock to the next waiter.
    ///
    /// Releasing twice does nothing; a lease from another owner is reported
    /// to the sink and left untouched.
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

    /// Shut the write slot down.
    ///
    /// Queued waiters fail at once. The active holder is asked to release. If
    /// it has not done so within the destroy timeout, its lease is revoked
    /// and the writer destroyed, or destroyed on the late release when a
    /// statement is still running on it.
    pub async fn close(&self) {
        self.inner.close().await;
    }

    pub fn stats(&self) -> WriteStats {
        let inner = &self.inner;
        let state = lock(&inner.state);
        let slot = match &state.slot {
            WriteSlot::Absent => WriteSlotState::Absent,
            WriteSlot::Connecting => WriteSlotState::Connecting,
            WriteSlot::Idle(_) => WriteSlotState::Idle,
            WriteSlot::Leased(..) => WriteSlotState::Leased,
        };
        WriteStats {
            state: slot,
            active_lease: state.active().map(|t| t.id()),
            created_total: inner.created.load(Ordering::Relaxed),
            destroyed_total: inner.destroyed.load(Ordering::Relaxed),
            timeouts_total: inner.timeouts_total.load(Ordering::Relaxed),
            closed: state.closed,
        }
    }
}

impl<E: EngineBinding> WriteInner<E> {
    fn closed_error() -> SqleaseError {
        SqleaseError::DriverAlreadyReleased {
            resource: RESOURCE.to_string(),
        }
    }

    fn report_foreign(&self, lease: &ConnectionLease<E::Connection>, action: &str) {
        self.sink.report(SinkEvent::InvariantViolated {
            owner: self.id,
            message: format!(
                "{} from {} was {action} through write connection {}",
                lease.id(),
                lease.owner_id(),
                self.id
            ),
        });
    }

    async fn lock_writer(&self) -> Result<OwnedSemaphorePermit, SqleaseError> {
        if lock(&self.state).closed {
            return Err(Self::closed_error());
        }
        let timer = TimeoutTimer::start(self.timeouts.acquire);
        let result = timer.race(Arc::clone(&self.write_lock).acquire_owned()).await;
        timer.clear();
        match result {
            Ok(Ok(permit)) => Ok(permit),
            Ok(Err(_)) => Err(Self::closed_error()),
            Err(Elapsed(waited)) => {
                self.timeouts_total.fetch_add(1, Ordering::Relaxed);
                recording::record_timeout(OWNER);
                self.sink.report(SinkEvent::AcquireTimeout {
                    owner: self.id,
                    resource: RESOURCE,
                    waited,
                });
                Err(SqleaseError::LockAcquireTimeout { duration: waited })
            }
        }
    }

    /// Take the idle writer or open a new one. The caller holds the lock and
    /// must put the slot into `Idle` or `Leased` afterwards.
    async fn take_or_create(&self) -> Result<PhysicalConnection<E::Connection>, SqleaseError> {
        {
            let mut state = lock(&self.state);
            if state.closed {
                return Err(Self::closed_error());
            }
            match mem::replace(&mut state.slot, WriteSlot::Connecting) {
                WriteSlot::Idle(conn) => return Ok(conn),
                WriteSlot::Absent => {}
                other => {
                    state.slot = other;
                    drop(state);
                    let message = format!("write lock granted while write connection {} was busy", self.id);
                    self.sink.report(SinkEvent::InvariantViolated {
                        owner: self.id,
                        message: message.clone(),
                    });
                    return Err(SqleaseError::Internal(message));
                }
            }
        }

        let guard = ConnectingGuard {
            state: &self.state,
            armed: true,
        };
        let raw = self.engine.create_connection(OpenMode::ReadWrite).await?;
        guard.disarm();
        let conn = PhysicalConnection::new(OpenMode::ReadWrite, raw);
        self.created.fetch_add(1, Ordering::Relaxed);
        recording::record_created(OWNER);
        info!(owner = %self.id, connection = %conn.id(), "write connection opened");
        Ok(conn)
    }

    async fn acquire(
        self: &Arc<Self>,
        holder: Arc<dyn LeaseHolder>,
    ) -> Result<ConnectionLease<E::Connection>, SqleaseError> {
        let started = Instant::now();
        let permit = self.lock_writer().await?;
        let conn = self.take_or_create().await?;

        let ticket = LeaseTicket::new(self.id, conn.id(), holder);
        let rejected = {
            let mut state = lock(&self.state);
            if state.closed {
                state.slot = WriteSlot::Absent;
                Err(conn)
            } else {
                let cell = share(conn);
                state.slot = WriteSlot::Leased(Arc::clone(&ticket), Arc::clone(&cell));
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

        self.active.send_replace(true);
        recording::set_active_leases(OWNER, 1);
        recording::record_lease_acquired(OWNER, started.elapsed());
        debug!(owner = %self.id, lease = %ticket.id(), waited_ms = started.elapsed().as_millis() as u64, "write lock granted");

        let owner: Arc<dyn LeaseOwner<E::Connection>> = Arc::clone(self) as _;
        Ok(ConnectionLease::new(ticket, cell, owner, permit))
    }

    async fn destroy(&self, conn: PhysicalConnection<E::Connection>, invalidated: bool) {
        let id = conn.id();
        self.engine.destroy_connection(conn.into_inner()).await;
        self.destroyed.fetch_add(1, Ordering::Relaxed);
        recording::record_destroyed(OWNER, invalidated);
        info!(owner = %self.id, connection = %id, invalidated, "write connection closed");
    }

    fn finish_release(&self, ticket: &LeaseTicket) {
        self.active.send_replace(false);
        recording::set_active_leases(OWNER, 0);
        debug!(owner = %self.id, lease = %ticket.id(), held_ms = ticket.held_for().as_millis() as u64, "write lock released");
    }

    async fn close(&self) {
        let active = {
            let mut state = lock(&self.state);
            if state.closed {
                return;
            }
            state.closed = true;
            state.active().cloned()
        };
        self.write_lock.close();
        info!(owner = %self.id, active = active.is_some(), "closing write connection");

        if let Some(ticket) = &active {
            ticket.request_release();

            let timer = TimeoutTimer::start(self.timeouts.destroy);
            let mut leased = self.active.subscribe();
            let drained = timer
                .race(async move {
                    let _ = leased.wait_for(|active| !*active).await;
                })
                .await;
            timer.clear();

            if drained.is_err() {
                let straggler = match &lock(&self.state).slot {
                    WriteSlot::Leased(ticket, cell) => Some((Arc::clone(ticket), Arc::clone(cell))),
                    _ => None,
                };
                if let Some((ticket, cell)) = straggler {
                    ticket.revoke();
                    warn!(
                        owner = %self.id,
                        lease = %ticket.id(),
                        timeout_ms = self.timeouts.destroy.as_millis() as u64,
                        "write holder did not release before the destroy timeout"
                    );
                    self.sink.report(SinkEvent::ForcedShutdown {
                        owner: self.id,
                        resource: RESOURCE,
                        outstanding: 1,
                    });
                    match take_connection(&cell) {
                        Ok(Some(conn)) => self.destroy(conn, false).await,
                        Ok(None) => {}
                        Err(_) => warn!(
                            owner = %self.id,
                            lease = %ticket.id(),
                            "revoked writer still running a statement; destroyed on release"
                        ),
                    }
                }
            }
        }

        let idle = {
            let mut state = lock(&self.state);
            match mem::replace(&mut state.slot, WriteSlot::Absent) {
                WriteSlot::Idle(conn) => Some(conn),
                other => {
                    state.slot = other;
                    None
                }
            }
        };
        if let Some(conn) = idle {
            self.destroy(conn, false).await;
        }
        info!(owner = %self.id, "write connection shut down");
    }
}

#[async_trait]
impl<E: EngineBinding> LeaseOwner<E::Connection> for WriteInner<E> {
    async fn reclaim(&self, ticket: &LeaseTicket, conn: Option<PhysicalConnection<E::Connection>>) {
        let invalid = ticket.is_invalid();
        let (tracked, conn) = {
            let mut state = lock(&self.state);
            let tracked = state.active().is_some_and(|active| active.id() == ticket.id());
            match conn {
                Some(conn) if tracked && !invalid && !state.closed => {
                    state.slot = WriteSlot::Idle(conn);
                    drop(state);
                    self.finish_release(ticket);
                    return;
                }
                conn => {
                    if tracked {
                        state.slot = WriteSlot::Absent;
                    }
                    (tracked, conn)
                }
            }
        };

        if !tracked {
            self.sink.report(SinkEvent::InvariantViolated {
                owner: self.id,
                message: format!("{} is not the active lease of write connection {}", ticket.id(), self.id),
            });
        }
        if let Some(conn) = conn {
            self.destroy(conn, invalid).await;
        }
        if tracked {
            self.finish_release(ticket);
        }
    }

    fn abandon(&self, ticket: &LeaseTicket) {
        let tracked = {
            let mut state = lock(&self.state);
            let tracked = state.active().is_some_and(|active| active.id() == ticket.id());
            if tracked {
                state.slot = WriteSlot::Absent;
            }
            tracked
        };
        if tracked {
            self.finish_release(ticket);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlease_core::{DetachedHolder, ErrorKind};
    use sqlease_test_utils::{MockEngine, RecordingSink};
    use std::time::Duration;
    use tracing_test::traced_test;

    fn writer(acquire_ms: u64) -> (Arc<MockEngine>, Arc<RecordingSink>, WriteConnection<MockEngine>) {
        let engine = Arc::new(MockEngine::new());
        let sink = Arc::new(RecordingSink::new());
        let config = PoolConfig {
            pool_size: 1,
            acquire_timeout_ms: acquire_ms,
            destroy_timeout_ms: 50,
        };
        let writer = WriteConnection::new(Arc::clone(&engine), &config, sink.clone());
        (engine, sink, writer)
    }

    fn holder() -> Arc<dyn LeaseHolder> {
        Arc::new(DetachedHolder)
    }

    #[tokio::test]
    async fn connect_is_eager_and_idempotent() {
        let (engine, _sink, writer) = writer(100);
        writer.connect().await.unwrap();
        writer.connect().await.unwrap();
        assert_eq!(engine.created(), 1);
        assert_eq!(writer.stats().state, WriteSlotState::Idle);
    }

    #[tokio::test]
    async fn writer_opens_read_write() {
        let (_engine, _sink, writer) = writer(100);
        let lease = writer.lease_connection(holder()).await.unwrap();
        assert_eq!(lease.connection().unwrap().mode(), OpenMode::ReadWrite);
        assert_eq!(writer.stats().active_lease, Some(lease.id()));
    }

    #[tokio::test]
    async fn release_keeps_the_connection() {
        let (engine, _sink, writer) = writer(100);
        let mut lease = writer.lease_connection(holder()).await.unwrap();
        let first = lease.connection().unwrap().id();
        writer.release_connection(&mut lease).await;
        writer.release_connection(&mut lease).await;

        let lease = writer.lease_connection(holder()).await.unwrap();
        assert_eq!(lease.connection().unwrap().id(), first);
        assert_eq!(engine.created(), 1);
    }

    #[tokio::test]
    async fn invalidated_writer_is_replaced() {
        let (engine, _sink, writer) = writer(100);
        let mut lease = writer.lease_connection(holder()).await.unwrap();
        let first = lease.connection().unwrap().id();
        writer.invalidate_connection(&lease);
        writer.release_connection(&mut lease).await;
        assert_eq!(writer.stats().state, WriteSlotState::Absent);
        assert_eq!(engine.destroyed(), 1);

        let lease = writer.lease_connection(holder()).await.unwrap();
        assert_ne!(lease.connection().unwrap().id(), first);
    }

    #[tokio::test]
    async fn failed_open_leaves_slot_absent() {
        let (engine, _sink, writer) = writer(100);
        engine.fail_next_creates(1);
        assert!(writer.connect().await.is_err());
        assert_eq!(writer.stats().state, WriteSlotState::Absent);
        writer.connect().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn second_writer_times_out() {
        let (_engine, sink, writer) = writer(5);
        let _held = writer.lease_connection(holder()).await.unwrap();
        let err = writer.lease_connection(holder()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::LockAcquireTimeout);
        assert_eq!(sink.timeouts(), 1);
        assert_eq!(writer.stats().timeouts_total, 1);
    }

    #[tokio::test]
    async fn close_destroys_idle_writer_once() {
        let (engine, _sink, writer) = writer(100);
        writer.connect().await.unwrap();
        writer.close().await;
        writer.close().await;
        assert_eq!(engine.destroyed(), 1);
        assert!(writer.stats().closed);
        let err = writer.lease_connection(holder()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::DriverAlreadyReleased);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn unresponsive_holder_is_revoked_on_close() {
        let (engine, sink, writer) = writer(100);
        let mut lease = writer.lease_connection(holder()).await.unwrap();
        writer.close().await;

        assert!(logs_contain("write holder did not release before the destroy timeout"));
        assert_eq!(sink.forced_shutdowns(), 1);
        assert_eq!(
            lease.connection().unwrap_err().kind(),
            ErrorKind::LeaseAlreadyReleased
        );
        assert_eq!(engine.live(), 0);
        assert_eq!(writer.stats().destroyed_total, 1);

        lease.release().await;
        assert_eq!(engine.destroyed(), 1);
        assert_eq!(writer.stats().state, WriteSlotState::Absent);
        assert_eq!(sink.invariant_violations(), 0);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn writer_running_a_statement_is_destroyed_on_late_release() {
        let (engine, _sink, writer) = writer(100);
        let mut lease = writer.lease_connection(holder()).await.unwrap();

        {
            let _in_use = lease.connection().unwrap();
            writer.close().await;
            assert!(logs_contain("revoked writer still running a statement"));
            assert_eq!(engine.live(), 1);
        }

        lease.release().await;
        assert_eq!(engine.live(), 0);
        assert_eq!(writer.stats().state, WriteSlotState::Absent);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_release_clears_the_active_lease() {
        let (engine, sink, writer) = writer(100);
        engine.set_destroy_delay(Duration::from_millis(40));
        let mut lease = writer.lease_connection(holder()).await.unwrap();
        writer.invalidate_connection(&lease);

        let cut_short = tokio::time::timeout(Duration::from_millis(5), lease.release()).await;
        assert!(cut_short.is_err());
        tokio::time::sleep(Duration::from_millis(60)).await;

        let stats = writer.stats();
        assert_eq!(stats.active_lease, None);
        assert_eq!(stats.destroyed_total, 1);

        let started = tokio::time::Instant::now();
        writer.close().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
        assert_eq!(sink.forced_shutdowns(), 0);
    }

    #[test]
    fn writer_dropped_outside_runtime_unlocks_the_slot() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_time()
            .build()
            .unwrap();
        let (engine, sink, writer) = writer(100);

        let lease = runtime.block_on(writer.lease_connection(holder())).unwrap();
        drop(lease);
        assert_eq!(writer.stats().state, WriteSlotState::Absent);
        assert_eq!(writer.stats().active_lease, None);

        let again = runtime.block_on(writer.lease_connection(holder()));
        assert!(again.is_ok());
        assert_eq!(engine.created(), 2);
        assert_eq!(sink.invariant_violations(), 0);
        runtime.block_on(async move { drop(again) });
    }
}
