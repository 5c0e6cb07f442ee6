// SPDX-FileCopyrightText: 2026 Sqlease Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Connection leases.
//!
//! A [`ConnectionLease`] gives its holder the physical connection for as long
//! as it is live. Releasing it hands the connection back to its
//! [`LeaseOwner`] exactly once; the owner then recycles or destroys it.
//!
//! The connection sits in a cell shared with the owner. Statements borrow it
//! through a read guard, and shutdown takes it out of the cell after revoking
//! a lease whose holder never released.

use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use futures::future::BoxFuture;
use sqlease_core::{ConnectionId, LeaseHolder, LeaseId, OpenMode, OwnerId, SqleaseError};
use tokio::sync::{OwnedSemaphorePermit, RwLock, RwLockReadGuard, TryLockError};
use tracing::{debug, warn};

/// Borrow of a leased connection, held for the length of one statement.
pub type ConnectionGuard<'a, C> = RwLockReadGuard<'a, PhysicalConnection<C>>;

/// Connection storage shared by a lease and the owner's slot record.
pub(crate) type SharedConnection<C> = Arc<RwLock<Option<PhysicalConnection<C>>>>;

pub(crate) fn share<C>(conn: PhysicalConnection<C>) -> SharedConnection<C> {
    Arc::new(RwLock::new(Some(conn)))
}

/// Take the connection out of a lease cell.
///
/// Fails while a statement still borrows it. `Ok(None)` means someone else
/// took it first.
pub(crate) fn take_connection<C>(
    cell: &SharedConnection<C>,
) -> Result<Option<PhysicalConnection<C>>, TryLockError> {
    cell.try_write().map(|mut slot| slot.take())
}

/// One open engine connection tagged with its generation marker.
pub struct PhysicalConnection<C> {
    id: ConnectionId,
    mode: OpenMode,
    created_at: Instant,
    inner: C,
}

impl<C> PhysicalConnection<C> {
    /// Wrap a freshly created engine connection.
    pub fn new(mode: OpenMode, inner: C) -> Self {
        Self {
            id: ConnectionId::next(),
            mode,
            created_at: Instant::now(),
            inner,
        }
    }

    /// Generation marker; never reused by a replacement connection.
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    /// Time since the engine opened this connection.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn inner(&self) -> &C {
        &self.inner
    }

    pub fn into_inner(self) -> C {
        self.inner
    }
}

impl<C> Deref for PhysicalConnection<C> {
    type Target = C;

    fn deref(&self) -> &C {
        &self.inner
    }
}

impl<C> fmt::Debug for PhysicalConnection<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalConnection")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

/// Lease state shared between a lease and its owner.
pub struct LeaseTicket {
    id: LeaseId,
    owner: OwnerId,
    connection: ConnectionId,
    holder: Arc<dyn LeaseHolder>,
    released: AtomicBool,
    invalid: AtomicBool,
    revoked: AtomicBool,
    issued_at: Instant,
}

impl LeaseTicket {
    pub(crate) fn new(
        owner: OwnerId,
        connection: ConnectionId,
        holder: Arc<dyn LeaseHolder>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: LeaseId::next(),
            owner,
            connection,
            holder,
            released: AtomicBool::new(false),
            invalid: AtomicBool::new(false),
            revoked: AtomicBool::new(false),
            issued_at: Instant::now(),
        })
    }

    pub fn id(&self) -> LeaseId {
        self.id
    }

    pub fn owner(&self) -> OwnerId {
        self.owner
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection
    }

    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::Acquire)
    }

    pub fn is_invalid(&self) -> bool {
        self.invalid.load(Ordering::Acquire)
    }

    /// Set when shutdown gave up waiting; the connection is no longer reachable.
    pub fn is_revoked(&self) -> bool {
        self.revoked.load(Ordering::Acquire)
    }

    /// How long the lease has been out.
    pub fn held_for(&self) -> Duration {
        self.issued_at.elapsed()
    }

    /// Forward a cooperative release request to the holder.
    pub fn request_release(&self) {
        debug!(lease = %self.id, owner = %self.owner, "requesting release from holder");
        self.holder.request_release();
    }

    pub(crate) fn mark_invalid(&self) {
        self.invalid.store(true, Ordering::Release);
    }

    pub(crate) fn revoke(&self) {
        self.revoked.store(true, Ordering::Release);
    }

    /// True for the first caller only.
    fn mark_released(&self) -> bool {
        !self.released.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for LeaseTicket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LeaseTicket")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("connection", &self.connection)
            .field("released", &self.is_released())
            .field("invalid", &self.is_invalid())
            .field("revoked", &self.is_revoked())
            .finish()
    }
}

/// The pool or write slot a lease returns its connection to.
#[async_trait]
pub trait LeaseOwner<C: Send + Sync + 'static>: Send + Sync + 'static {
    /// Take back the connection of a lease that is being released.
    ///
    /// Called exactly once per lease. The owner recycles the connection, or
    /// destroys it when the ticket is invalid or the owner is closed. `None`
    /// means shutdown already took and destroyed the connection.
    async fn reclaim(&self, ticket: &LeaseTicket, conn: Option<PhysicalConnection<C>>);

    /// Forget a lease whose connection was dropped outside any runtime.
    ///
    /// Runs synchronously, before the lease's permit is returned.
    fn abandon(&self, ticket: &LeaseTicket);
}

/// A revocable right to use one physical connection.
///
/// Dropping a live lease releases it on a background task, so a cancelled or
/// panicking caller still hands the connection back.
pub struct ConnectionLease<C: Send + Sync + 'static> {
    ticket: Arc<LeaseTicket>,
    cell: SharedConnection<C>,
    owner: Arc<dyn LeaseOwner<C>>,
    // Dropped only after `reclaim` finishes, so the next acquirer never sees
    // half-updated owner state.
    permit: Option<OwnedSemaphorePermit>,
}

impl<C: Send + Sync + 'static> ConnectionLease<C> {
    pub(crate) fn new(
        ticket: Arc<LeaseTicket>,
        cell: SharedConnection<C>,
        owner: Arc<dyn LeaseOwner<C>>,
        permit: OwnedSemaphorePermit,
    ) -> Self {
        Self {
            ticket,
            cell,
            owner,
            permit: Some(permit),
        }
    }

    pub fn id(&self) -> LeaseId {
        self.ticket.id
    }

    pub fn owner_id(&self) -> OwnerId {
        self.ticket.owner
    }

    pub fn ticket(&self) -> &Arc<LeaseTicket> {
        &self.ticket
    }

    /// The leased connection.
    ///
    /// Fails with [`SqleaseError::LeaseAlreadyReleased`] after release or
    /// after shutdown revoked the lease.
    pub fn connection(&self) -> Result<ConnectionGuard<'_, C>, SqleaseError> {
        let gone = || SqleaseError::LeaseAlreadyReleased {
            lease: self.ticket.id,
        };
        if self.ticket.is_released() || self.ticket.is_revoked() {
            return Err(gone());
        }
        let slot = self.cell.try_read().map_err(|_| gone())?;
        RwLockReadGuard::try_map(slot, Option::as_ref).map_err(|_| gone())
    }

    /// Tell the owner to destroy the connection instead of recycling it.
    pub fn mark_as_invalid(&self) {
        if !self.ticket.is_invalid() {
            debug!(lease = %self.ticket.id, connection = %self.ticket.connection, "lease marked invalid");
        }
        self.ticket.mark_invalid();
    }

    pub fn is_invalid(&self) -> bool {
        self.ticket.is_invalid()
    }

    pub fn is_released(&self) -> bool {
        self.ticket.is_released()
    }

    /// Hand the connection back to the owner. A second call does nothing.
    ///
    /// The owner reclaims on its own task, so cancelling this future does
    /// not interrupt the cleanup.
    pub async fn release(&mut self) {
        if !self.ticket.mark_released() {
            return;
        }
        let conn = take_connection(&self.cell).ok().flatten();
        let owner = Arc::clone(&self.owner);
        let ticket = Arc::clone(&self.ticket);
        let permit = self.permit.take();
        let reclaim = tokio::spawn(async move {
            owner.reclaim(&ticket, conn).await;
            drop(permit);
        });
        if let Err(err) = reclaim.await {
            warn!(lease = %self.ticket.id, error = %err, "lease reclaim task failed");
        }
    }

    /// Ask the holder, not the owner, to wind down and release.
    pub fn request_release(&self) {
        self.ticket.request_release();
    }
}

impl<C: Send + Sync + 'static> Drop for ConnectionLease<C> {
    fn drop(&mut self) {
        if !self.ticket.mark_released() {
            return;
        }
        let conn = take_connection(&self.cell).ok().flatten();
        let owner = Arc::clone(&self.owner);
        let ticket = Arc::clone(&self.ticket);
        let permit = self.permit.take();
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(lease = %ticket.id, "lease dropped while live; releasing in background");
                handle.spawn(async move {
                    owner.reclaim(&ticket, conn).await;
                    drop(permit);
                });
            }
            Err(_) => {
                warn!(
                    lease = %ticket.id,
                    "runtime unavailable while dropping a live lease; connection dropped without destroy"
                );
                owner.abandon(&ticket);
                drop(conn);
                drop(permit);
            }
        }
    }
}

impl<C: Send + Sync + 'static> fmt::Debug for ConnectionLease<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionLease")
            .field("ticket", &self.ticket)
            .finish_non_exhaustive()
    }
}

/// Run `f` with `lease`, then release it whatever `f` returned.
pub(crate) async fn run_scoped<C, T, F>(
    mut lease: ConnectionLease<C>,
    f: F,
) -> Result<T, SqleaseError>
where
    C: Send + Sync + 'static,
    F: for<'a> FnOnce(&'a ConnectionLease<C>) -> BoxFuture<'a, Result<T, SqleaseError>>,
{
    let result = f(&lease).await;
    lease.release().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlease_core::DetachedHolder;
    use std::sync::Mutex;
    use tokio::sync::Semaphore;

    #[derive(Default)]
    struct CountingOwner {
        reclaimed: Mutex<Vec<(LeaseId, bool, bool)>>,
        abandoned: Mutex<Vec<LeaseId>>,
        delay: Duration,
    }

    #[async_trait]
    impl LeaseOwner<u32> for CountingOwner {
        async fn reclaim(&self, ticket: &LeaseTicket, conn: Option<PhysicalConnection<u32>>) {
            tokio::time::sleep(self.delay).await;
            self.reclaimed
                .lock()
                .unwrap()
                .push((ticket.id(), ticket.is_invalid(), conn.is_some()));
        }

        fn abandon(&self, ticket: &LeaseTicket) {
            self.abandoned.lock().unwrap().push(ticket.id());
        }
    }

    fn lease_with_cell(
        owner: &Arc<CountingOwner>,
        permits: &Arc<Semaphore>,
    ) -> (ConnectionLease<u32>, SharedConnection<u32>) {
        let conn = PhysicalConnection::new(OpenMode::ReadOnly, 7_u32);
        let ticket = LeaseTicket::new(OwnerId(1), conn.id(), Arc::new(DetachedHolder));
        let permit = Arc::clone(permits).try_acquire_owned().unwrap();
        let cell = share(conn);
        let lease = ConnectionLease::new(
            ticket,
            Arc::clone(&cell),
            Arc::clone(owner) as Arc<dyn LeaseOwner<u32>>,
            permit,
        );
        (lease, cell)
    }

    fn lease(owner: &Arc<CountingOwner>, permits: &Arc<Semaphore>) -> ConnectionLease<u32> {
        lease_with_cell(owner, permits).0
    }

    #[tokio::test]
    async fn release_is_idempotent() {
        let owner = Arc::new(CountingOwner::default());
        let permits = Arc::new(Semaphore::new(1));
        let mut lease = lease(&owner, &permits);

        lease.release().await;
        lease.release().await;

        assert_eq!(owner.reclaimed.lock().unwrap().len(), 1);
        assert!(lease.is_released());
        assert_eq!(permits.available_permits(), 1);
    }

    #[tokio::test]
    async fn connection_fails_after_release() {
        let owner = Arc::new(CountingOwner::default());
        let permits = Arc::new(Semaphore::new(1));
        let mut lease = lease(&owner, &permits);
        assert_eq!(**lease.connection().unwrap(), 7);

        lease.release().await;
        let err = lease.connection().unwrap_err();
        assert_eq!(err.kind(), sqlease_core::ErrorKind::LeaseAlreadyReleased);
    }

    #[tokio::test]
    async fn revoked_lease_denies_access() {
        let owner = Arc::new(CountingOwner::default());
        let permits = Arc::new(Semaphore::new(1));
        let lease = lease(&owner, &permits);
        lease.ticket().revoke();
        assert!(lease.connection().is_err());
    }

    #[tokio::test]
    async fn invalid_flag_reaches_owner() {
        let owner = Arc::new(CountingOwner::default());
        let permits = Arc::new(Semaphore::new(1));
        let mut lease = lease(&owner, &permits);
        lease.mark_as_invalid();
        lease.release().await;
        assert!(owner.reclaimed.lock().unwrap()[0].1);
    }

    #[tokio::test]
    async fn connection_cannot_be_taken_while_borrowed() {
        let owner = Arc::new(CountingOwner::default());
        let permits = Arc::new(Semaphore::new(1));
        let (mut lease, cell) = lease_with_cell(&owner, &permits);

        {
            let _borrowed = lease.connection().unwrap();
            assert!(take_connection(&cell).is_err());
        }
        let taken = take_connection(&cell).unwrap();
        assert_eq!(taken.map(PhysicalConnection::into_inner), Some(7));
        assert!(lease.connection().is_err());

        lease.release().await;
        assert!(!owner.reclaimed.lock().unwrap()[0].2);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_release_still_reclaims() {
        let owner = Arc::new(CountingOwner {
            delay: Duration::from_millis(50),
            ..CountingOwner::default()
        });
        let permits = Arc::new(Semaphore::new(1));
        let mut lease = lease(&owner, &permits);

        let cut_short = tokio::time::timeout(Duration::from_millis(5), lease.release()).await;
        assert!(cut_short.is_err());
        assert!(lease.is_released());

        let _permit = permits.acquire().await.unwrap();
        assert_eq!(owner.reclaimed.lock().unwrap().len(), 1);
        lease.release().await;
        assert_eq!(owner.reclaimed.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn dropping_live_lease_reclaims_in_background() {
        let owner = Arc::new(CountingOwner::default());
        let permits = Arc::new(Semaphore::new(1));
        drop(lease(&owner, &permits));

        let _permit = permits.acquire().await.unwrap();
        assert_eq!(owner.reclaimed.lock().unwrap().len(), 1);
    }

    #[test]
    fn dropping_outside_runtime_abandons_before_returning_permit() {
        let owner = Arc::new(CountingOwner::default());
        let permits = Arc::new(Semaphore::new(1));
        let lease = lease(&owner, &permits);
        let id = lease.id();

        drop(lease);

        assert_eq!(*owner.abandoned.lock().unwrap(), vec![id]);
        assert!(owner.reclaimed.lock().unwrap().is_empty());
        assert_eq!(permits.available_permits(), 1);
    }
}
