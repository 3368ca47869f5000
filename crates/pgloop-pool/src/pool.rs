//! Connection pool implementation.
//!
//! The pool owns a fixed array of slots, each holding at most one physical
//! connection. A single mutex guards the slots and the FIFO wait queue; it
//! is never held across driver I/O or a call into application code.

use std::collections::VecDeque;
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use pgloop_driver::{ConnStatus, Connection, Driver, DriverError, QueryResult};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{AcquireTimeout, PoolConfig};
use crate::error::PoolError;
use crate::lifecycle::{self, ConnectionMetadata, HealthCheckResult};

/// A fixed-size pool of database connections.
///
/// Connections are opened eagerly when the pool is created and handed out
/// one holder at a time. Returning a connection while requesters are queued
/// hands it straight to the oldest one.
///
/// # Example
///
/// ```rust,ignore
/// use pgloop_pool::{AcquireTimeout, Pool};
/// use std::time::Duration;
///
/// let pool = Pool::builder()
///     .driver(driver)
///     .size(8)
///     .acquire_timeout(AcquireTimeout::After(Duration::from_secs(2)))
///     .build()?;
///
/// let conn = pool.acquire().await?;
/// // Use connection...
/// // Connection automatically returned to pool on drop
/// ```
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

pub(crate) struct PoolInner {
    /// Pool configuration.
    config: PoolConfig,

    /// Rendered conninfo string passed to the driver.
    conninfo: String,

    /// Connection factory.
    driver: Arc<dyn Driver>,

    /// Slots and waiters.
    state: Mutex<PoolState>,

    /// Cancelled when the pool shuts down.
    shutdown: CancellationToken,

    /// Counter for generating waiter IDs.
    next_waiter_id: AtomicU64,

    /// When the pool was created.
    created_at: Instant,

    /// Pool metrics.
    metrics: Mutex<PoolMetricsInner>,
}

struct PoolState {
    slots: Vec<Slot>,
    waiters: VecDeque<Waiter>,
    destroyed: bool,
}

struct Slot {
    conn: Option<Box<dyn Connection>>,
    in_use: bool,
    meta: ConnectionMetadata,
}

impl Slot {
    fn is_ready(&self) -> bool {
        !self.in_use && self.conn.as_ref().is_some_and(|c| c.is_ok())
    }
}

struct Waiter {
    id: u64,
    tx: oneshot::Sender<Result<PooledConnection, PoolError>>,
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct PoolMetricsInner {
    connections_created: u64,
    connections_closed: u64,
    checkouts_successful: u64,
    checkouts_failed: u64,
    repairs_performed: u64,
    repairs_failed: u64,
    handoffs: u64,
    timeouts: u64,
}

/// Result of looking for a connection under the lock.
enum Claim {
    /// A healthy connection was checked out.
    Ready(PooledConnection),
    /// A free slot needs a reset or a new connection first.
    Repair(Reservation),
    /// Queued behind other requesters.
    Wait(Queued),
    /// Nothing free and queueing is disabled.
    Exhausted,
}

impl Pool {
    /// Create a new pool builder.
    #[must_use]
    pub fn builder() -> PoolBuilder {
        PoolBuilder::new()
    }

    /// Create a pool, opening every connection up front.
    ///
    /// Connections are opened in blocking mode and then switched to
    /// non-blocking mode. Creation fails only if not a single connection
    /// could be opened; a partially filled pool repairs its empty slots on
    /// demand.
    pub fn new(config: PoolConfig, driver: impl Driver + 'static) -> Result<Self, PoolError> {
        Self::with_driver(config, Arc::new(driver))
    }

    /// Create a pool from a shared driver.
    pub fn with_driver(config: PoolConfig, driver: Arc<dyn Driver>) -> Result<Self, PoolError> {
        config.validate()?;

        let conninfo = config.connection.to_conninfo();
        let mut slots = Vec::with_capacity(config.size);
        let mut last_error = None;
        let mut created = 0;

        for slot in 0..config.size {
            let conn = match lifecycle::open(driver.as_ref(), &conninfo) {
                Ok(conn) => {
                    created += 1;
                    Some(conn)
                }
                Err(e) => {
                    tracing::warn!(slot, error = %e, "failed to open pooled connection");
                    last_error = Some(e);
                    None
                }
            };
            slots.push(Slot {
                conn,
                in_use: false,
                meta: ConnectionMetadata::new(slot),
            });
        }

        if created == 0 {
            return Err(PoolError::NoConnections {
                attempted: config.size,
                last_error: last_error
                    .unwrap_or_else(|| DriverError::Connect("no connection attempted".into())),
            });
        }
        if created < config.size {
            tracing::info!(
                created,
                size = config.size,
                "connection pool partially filled; empty slots reconnect on demand"
            );
        }

        tracing::info!(
            size = config.size,
            host = %config.connection.host,
            dbname = %config.connection.dbname,
            "connection pool created"
        );

        let inner = Arc::new(PoolInner {
            config,
            conninfo,
            driver,
            state: Mutex::new(PoolState {
                slots,
                waiters: VecDeque::new(),
                destroyed: false,
            }),
            shutdown: CancellationToken::new(),
            next_waiter_id: AtomicU64::new(1),
            created_at: Instant::now(),
            metrics: Mutex::new(PoolMetricsInner {
                connections_created: created as u64,
                ..PoolMetricsInner::default()
            }),
        });

        Ok(Self { inner })
    }

    /// Take a free connection without waiting.
    ///
    /// A free but broken connection is repaired on the calling thread, so
    /// this may block. It is meant for one-time setup work before the
    /// service takes traffic. Returns `None` when every connection is in
    /// use.
    pub fn try_get(&self) -> Result<Option<PooledConnection>, PoolError> {
        let result = self.inner.try_get();
        self.inner.record_checkout(result.as_ref().map(Option::is_some));
        result
    }

    /// Request a connection, invoking `callback` with the outcome.
    ///
    /// Never blocks. When a healthy connection is free, or the request
    /// fails outright, `callback` runs before this method returns.
    /// Otherwise it runs later on a Tokio task, once a repaired or returned
    /// connection is delivered or the request times out.
    pub fn request<F>(&self, callback: F)
    where
        F: FnOnce(Result<PooledConnection, PoolError>) + Send + 'static,
    {
        let claim = match self.inner.claim(&[], self.inner.config.acquire_timeout) {
            Ok(claim) => claim,
            Err(e) => return self.inner.finish_request(Err(e), callback),
        };

        match claim {
            Claim::Ready(conn) => self.inner.finish_request(Ok(conn), callback),
            Claim::Exhausted => self.inner.finish_request(Err(PoolError::Exhausted), callback),
            claim => match Handle::try_current() {
                Ok(handle) => {
                    let inner = Arc::clone(&self.inner);
                    handle.spawn(async move {
                        let result = inner.resolve(claim).await;
                        inner.finish_request(result, callback);
                    });
                }
                Err(_) => {
                    // Dropping the claim leaves the queue or frees the slot.
                    drop(claim);
                    self.inner.finish_request(Err(PoolError::NoRuntime), callback);
                }
            },
        }
    }

    /// Acquire a connection, waiting in the queue if necessary.
    pub async fn acquire(&self) -> Result<PooledConnection, PoolError> {
        tracing::trace!("acquiring connection from pool");

        let result = match self.inner.claim(&[], self.inner.config.acquire_timeout) {
            Ok(claim) => self.inner.resolve(claim).await,
            Err(e) => Err(e),
        };
        self.inner.record_checkout(result.as_ref().map(|_| true));
        result
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        let mut status = PoolStatus {
            available: 0,
            in_use: 0,
            total: 0,
            max: state.slots.len(),
            waiting: state.waiters.len(),
        };
        for slot in &state.slots {
            if slot.in_use {
                status.in_use += 1;
                status.total += 1;
            } else if slot.conn.is_some() {
                status.available += 1;
                status.total += 1;
            }
        }
        status
    }

    /// Per-slot bookkeeping, indexed by slot.
    #[must_use]
    pub fn slot_metadata(&self) -> Vec<ConnectionMetadata> {
        self.inner.state.lock().slots.iter().map(|s| s.meta).collect()
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.lock();
        PoolMetrics {
            connections_created: inner.connections_created,
            connections_closed: inner.connections_closed,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            repairs_performed: inner.repairs_performed,
            repairs_failed: inner.repairs_failed,
            handoffs: inner.handoffs,
            timeouts: inner.timeouts,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Close free connections idle for longer than `max_idle`.
    ///
    /// Closed slots are reopened lazily by the next borrower. Returns the
    /// number of connections closed.
    pub fn cleanup_idle(&self, max_idle: Duration) -> usize {
        let closed: Vec<Box<dyn Connection>> = {
            let mut state = self.inner.state.lock();
            state
                .slots
                .iter_mut()
                .filter(|s| !s.in_use && s.meta.idle_time() > max_idle)
                .filter_map(|s| s.conn.take())
                .collect()
        };

        let count = closed.len();
        drop(closed);
        if count > 0 {
            self.inner.metrics.lock().connections_closed += count as u64;
            tracing::debug!(count, ?max_idle, "closed idle connections");
        }
        count
    }

    /// Start a background task that closes idle connections.
    ///
    /// Runs every half idle timeout until the pool shuts down. Returns
    /// `None` when no idle timeout is configured or no runtime is running.
    pub fn spawn_idle_reaper(&self) -> Option<JoinHandle<()>> {
        let max_idle = self.inner.config.idle_timeout?;
        let handle = Handle::try_current().ok()?;
        let weak: Weak<PoolInner> = Arc::downgrade(&self.inner);
        let shutdown = self.inner.shutdown.clone();
        let period = (max_idle / 2).max(Duration::from_millis(1));

        Some(handle.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.tick().await;
            loop {
                tokio::select! {
                    () = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(inner) = weak.upgrade() else { break };
                Pool { inner }.cleanup_idle(max_idle);
            }
            tracing::trace!("idle reaper stopped");
        }))
    }

    /// Signal that the runtime is stopping.
    ///
    /// Pipelines running on this pool abort at their next readiness point.
    /// Connections stay open until [`Pool::close`].
    pub fn shutdown(&self) {
        if !self.inner.shutdown.is_cancelled() {
            tracing::info!("connection pool shutting down");
        }
        self.inner.shutdown.cancel();
    }

    /// A token cancelled by [`Pool::shutdown`] and [`Pool::close`].
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.inner.shutdown.clone()
    }

    /// Close the pool.
    ///
    /// Every queued requester fails with [`PoolError::PoolClosed`], idle
    /// connections are closed immediately and checked-out connections are
    /// closed when their holders return them.
    pub fn close(&self) {
        let (waiters, idle) = {
            let mut state = self.inner.state.lock();
            if state.destroyed {
                return;
            }
            state.destroyed = true;
            let waiters: Vec<Waiter> = state.waiters.drain(..).collect();
            let idle: Vec<Box<dyn Connection>> = state
                .slots
                .iter_mut()
                .filter(|s| !s.in_use)
                .filter_map(|s| s.conn.take())
                .collect();
            (waiters, idle)
        };

        let woken = waiters.len();
        for waiter in waiters {
            let _ = waiter.tx.send(Err(PoolError::PoolClosed));
        }
        let count = idle.len();
        drop(idle);
        self.inner.metrics.lock().connections_closed += count as u64;
        self.inner.shutdown.cancel();

        tracing::info!(woken, closed = count, "connection pool closed");
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().destroyed
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }
}

impl fmt::Debug for Pool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pool")
            .field("config", &self.inner.config)
            .field("status", &self.status())
            .finish()
    }
}

impl PoolInner {
    /// Find a connection for a requester under the lock.
    ///
    /// Slots listed in `tried` already failed a repair for this requester
    /// and are not reserved again.
    fn claim(self: &Arc<Self>, tried: &[usize], timeout: AcquireTimeout) -> Result<Claim, PoolError> {
        let mut state = self.state.lock();
        if state.destroyed {
            return Err(PoolError::PoolClosed);
        }

        for (index, slot) in state.slots.iter_mut().enumerate() {
            if !slot.is_ready() {
                continue;
            }
            if let Some(conn) = slot.conn.take() {
                slot.in_use = true;
                slot.meta.checkouts += 1;
                return Ok(Claim::Ready(PooledConnection::new(
                    index,
                    conn,
                    Arc::clone(self),
                )));
            }
        }

        // Prefer a connection that may only need a reset over an empty slot.
        let repairable = |(i, s): &(usize, &Slot)| !s.in_use && !tried.contains(i);
        let candidate = state
            .slots
            .iter()
            .enumerate()
            .filter(repairable)
            .find(|(_, s)| s.conn.is_some())
            .or_else(|| state.slots.iter().enumerate().find(repairable))
            .map(|(i, _)| i);

        if let Some(index) = candidate {
            if let Some(slot) = state.slots.get_mut(index) {
                slot.in_use = true;
                slot.meta.checkouts += 1;
                let conn = slot.conn.take();
                return Ok(Claim::Repair(Reservation {
                    slot: index,
                    conn,
                    pool: Arc::clone(self),
                    done: false,
                }));
            }
        }

        if !timeout.allows_waiting() {
            return Ok(Claim::Exhausted);
        }

        let id = self.next_waiter_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        state.waiters.push_back(Waiter { id, tx });
        tracing::trace!(waiter = id, queued = state.waiters.len(), "queued for connection");
        Ok(Claim::Wait(Queued {
            id,
            rx,
            pool: Arc::clone(self),
        }))
    }

    /// Drive a claim to a connection or an error.
    async fn resolve(self: &Arc<Self>, claim: Claim) -> Result<PooledConnection, PoolError> {
        let mut claim = claim;
        let mut tried = Vec::new();
        let mut last_error = None;

        loop {
            match claim {
                Claim::Ready(conn) => return Ok(conn),
                Claim::Exhausted => {
                    return Err(last_error.map_or(PoolError::Exhausted, PoolError::Driver));
                }
                Claim::Wait(queued) => return self.wait(queued).await,
                Claim::Repair(mut reservation) => {
                    let conn = reservation.conn.take();
                    match self.repair_blocking(conn).await {
                        Ok(conn) => return self.complete(reservation, conn),
                        Err(e) => {
                            tried.push(reservation.slot);
                            drop(reservation);
                            last_error = Some(e);
                        }
                    }
                }
            }
            // After a failed repair, take any other free slot but do not
            // queue: the driver error is the answer.
            claim = self.claim(&tried, AcquireTimeout::NoWait)?;
        }
    }

    fn try_get(self: &Arc<Self>) -> Result<Option<PooledConnection>, PoolError> {
        let mut tried = Vec::new();
        let mut last_error = None;

        loop {
            match self.claim(&tried, AcquireTimeout::NoWait)? {
                Claim::Ready(conn) => return Ok(Some(conn)),
                Claim::Repair(mut reservation) => {
                    let conn = reservation.conn.take();
                    match self.repair_now(conn) {
                        Ok(conn) => return self.complete(reservation, conn).map(Some),
                        Err(e) => {
                            tried.push(reservation.slot);
                            drop(reservation);
                            last_error = Some(e);
                        }
                    }
                }
                Claim::Wait(_) => return Ok(None),
                Claim::Exhausted => {
                    return match last_error {
                        Some(e) => Err(PoolError::Driver(e)),
                        None => Ok(None),
                    };
                }
            }
        }
    }

    /// Wait for a hand-off, honouring the acquire timeout.
    async fn wait(&self, mut queued: Queued) -> Result<PooledConnection, PoolError> {
        let id = queued.id;
        let rx = &mut queued.rx;
        let delivered = match self.config.acquire_timeout {
            AcquireTimeout::After(limit) => match tokio::time::timeout(limit, &mut *rx).await {
                Ok(delivered) => delivered,
                Err(_) => {
                    if self.remove_waiter(id) {
                        self.metrics.lock().timeouts += 1;
                        tracing::warn!(waiter = id, ?limit, "timed out waiting for connection");
                        return Err(PoolError::Timeout(limit));
                    }
                    // Already popped by a returning holder; the value is on its way.
                    rx.await
                }
            },
            AcquireTimeout::Infinite | AcquireTimeout::NoWait => rx.await,
        };

        delivered.unwrap_or(Err(PoolError::PoolClosed))
    }

    /// Remove a waiter from the queue. Returns false if it was already
    /// resolved.
    fn remove_waiter(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        match state.waiters.iter().position(|w| w.id == id) {
            Some(index) => {
                state.waiters.remove(index);
                true
            }
            None => false,
        }
    }

    /// Turn a repaired reservation into a checked-out connection.
    fn complete(
        self: &Arc<Self>,
        mut reservation: Reservation,
        conn: Box<dyn Connection>,
    ) -> Result<PooledConnection, PoolError> {
        reservation.done = true;
        let slot = reservation.slot;

        let destroyed = {
            let mut state = self.state.lock();
            if state.destroyed {
                if let Some(s) = state.slots.get_mut(slot) {
                    s.in_use = false;
                }
            } else if let Some(s) = state.slots.get_mut(slot) {
                s.meta.created_at = Instant::now();
            }
            state.destroyed
        };

        if destroyed {
            drop(conn);
            self.metrics.lock().connections_closed += 1;
            return Err(PoolError::PoolClosed);
        }
        Ok(PooledConnection::new(slot, conn, Arc::clone(self)))
    }

    async fn repair_blocking(
        self: &Arc<Self>,
        conn: Option<Box<dyn Connection>>,
    ) -> Result<Box<dyn Connection>, DriverError> {
        let inner = Arc::clone(self);
        tokio::task::spawn_blocking(move || inner.repair_now(conn))
            .await
            .unwrap_or_else(|e| Err(DriverError::Connect(format!("repair task failed: {e}"))))
    }

    fn repair_now(&self, conn: Option<Box<dyn Connection>>) -> Result<Box<dyn Connection>, DriverError> {
        let had_connection = conn.is_some();
        match lifecycle::repair(self.driver.as_ref(), &self.conninfo, conn) {
            Ok((conn, how)) => {
                let mut metrics = self.metrics.lock();
                metrics.repairs_performed += 1;
                if how == HealthCheckResult::Reconnected {
                    metrics.connections_created += 1;
                    if had_connection {
                        metrics.connections_closed += 1;
                    }
                }
                drop(metrics);
                tracing::warn!(?how, "connection repaired");
                Ok(conn)
            }
            Err(e) => {
                let mut metrics = self.metrics.lock();
                metrics.repairs_failed += 1;
                if had_connection {
                    metrics.connections_closed += 1;
                }
                drop(metrics);
                tracing::warn!(error = %e, "connection repair failed");
                Err(e)
            }
        }
    }

    /// Return a connection to its slot, handing it to the oldest waiter if
    /// there is one.
    fn checkin(self: &Arc<Self>, slot: usize, conn: Box<dyn Connection>) {
        let mut conn = conn;
        let mut state = self.state.lock();

        if state.destroyed {
            if let Some(s) = state.slots.get_mut(slot) {
                s.in_use = false;
            }
            drop(state);
            drop(conn);
            self.metrics.lock().connections_closed += 1;
            return;
        }

        if !state.waiters.is_empty() && conn.status() == ConnStatus::Bad {
            drop(state);
            self.repair_for_waiter(slot, Some(conn));
            return;
        }

        while let Some(waiter) = state.waiters.pop_front() {
            let handed = PooledConnection::new(slot, conn, Arc::clone(self));
            match waiter.tx.send(Ok(handed)) {
                Ok(()) => {
                    if let Some(s) = state.slots.get_mut(slot) {
                        s.meta.checkouts += 1;
                    }
                    drop(state);
                    self.metrics.lock().handoffs += 1;
                    tracing::trace!(slot, waiter = waiter.id, "handed connection to waiter");
                    return;
                }
                Err(returned) => match returned {
                    Ok(mut handed) => conn = handed.take(),
                    Err(_) => return,
                },
            }
        }

        if let Some(s) = state.slots.get_mut(slot) {
            s.conn = Some(conn);
            s.in_use = false;
            s.meta.last_used = Instant::now();
        }
    }

    /// Empty a slot whose connection is gone.
    ///
    /// With `wake` set and requesters queued, the slot stays reserved and a
    /// new connection is opened for the oldest requester.
    fn vacate(self: &Arc<Self>, slot: usize, wake: bool) {
        let mut state = self.state.lock();
        let reopen = wake && !state.destroyed && !state.waiters.is_empty();
        if let Some(s) = state.slots.get_mut(slot) {
            s.conn = None;
            if !reopen {
                s.in_use = false;
            }
        }
        drop(state);

        if reopen {
            self.repair_for_waiter(slot, None);
        }
    }

    /// Repair a reserved slot on a blocking worker, then hand it to the
    /// queue. Without a runtime the slot is left free for the next borrower.
    fn repair_for_waiter(self: &Arc<Self>, slot: usize, conn: Option<Box<dyn Connection>>) {
        let Ok(handle) = Handle::try_current() else {
            let mut state = self.state.lock();
            if let Some(s) = state.slots.get_mut(slot) {
                s.conn = conn;
                s.in_use = false;
            }
            return;
        };

        let inner = Arc::clone(self);
        handle.spawn(async move {
            match inner.repair_blocking(conn).await {
                Ok(conn) => inner.checkin(slot, conn),
                Err(e) => inner.fail_waiter(slot, e),
            }
        });
    }

    /// Answer the oldest waiter with a failed repair.
    ///
    /// The slot stays reserved and is repaired again for the next waiter,
    /// so it is never left free while requesters are queued.
    fn fail_waiter(self: &Arc<Self>, slot: usize, error: DriverError) {
        let mut state = self.state.lock();
        let mut waiter = None;
        while let Some(w) = state.waiters.pop_front() {
            if !w.tx.is_closed() {
                waiter = Some(w);
                break;
            }
        }
        let retry = !state.destroyed && !state.waiters.is_empty();
        if let Some(s) = state.slots.get_mut(slot) {
            s.conn = None;
            if !retry {
                s.in_use = false;
            }
        }
        drop(state);

        if let Some(waiter) = waiter {
            tracing::warn!(slot, waiter = waiter.id, error = %error, "failing queued request");
            let _ = waiter.tx.send(Err(PoolError::Driver(error)));
        }
        if retry {
            self.repair_for_waiter(slot, None);
        }
    }

    fn finish_request<F>(&self, result: Result<PooledConnection, PoolError>, callback: F)
    where
        F: FnOnce(Result<PooledConnection, PoolError>),
    {
        self.record_checkout(result.as_ref().map(|_| true));
        callback(result);
    }

    fn record_checkout(&self, outcome: Result<bool, &PoolError>) {
        let mut metrics = self.metrics.lock();
        match outcome {
            Ok(true) => metrics.checkouts_successful += 1,
            Ok(false) => {}
            Err(_) => metrics.checkouts_failed += 1,
        }
    }
}

/// A slot reserved for repair. Dropping it without completing empties the
/// slot and passes it on to the wait queue.
struct Reservation {
    slot: usize,
    conn: Option<Box<dyn Connection>>,
    pool: Arc<PoolInner>,
    done: bool,
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if !self.done {
            drop(self.conn.take());
            self.pool.vacate(self.slot, true);
        }
    }
}

/// A place in the wait queue. Dropping it leaves the queue, so an
/// abandoned `acquire` does not linger as a waiter.
struct Queued {
    id: u64,
    rx: oneshot::Receiver<Result<PooledConnection, PoolError>>,
    pool: Arc<PoolInner>,
}

impl Drop for Queued {
    fn drop(&mut self) {
        self.pool.remove_waiter(self.id);
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = Pool::builder()
///     .driver(driver)
///     .connection(ConnInfo::from_env()?)
///     .size(4)
///     .build()?;
/// ```
pub struct PoolBuilder {
    pool_config: PoolConfig,
    driver: Option<Arc<dyn Driver>>,
}

impl PoolBuilder {
    /// Create a new pool builder with default settings.
    pub fn new() -> Self {
        Self {
            pool_config: PoolConfig::default(),
            driver: None,
        }
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the driver used to open connections.
    #[must_use]
    pub fn driver(mut self, driver: impl Driver + 'static) -> Self {
        self.driver = Some(Arc::new(driver));
        self
    }

    /// Set the connection parameters.
    #[must_use]
    pub fn connection(mut self, connection: pgloop_driver::ConnInfo) -> Self {
        self.pool_config.connection = connection;
        self
    }

    /// Set the number of connections.
    #[must_use]
    pub fn size(mut self, size: usize) -> Self {
        self.pool_config.size = size;
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn acquire_timeout(mut self, timeout: AcquireTimeout) -> Self {
        self.pool_config.acquire_timeout = timeout;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.idle_timeout = Some(timeout);
        self
    }

    /// Set the fallback readiness poll interval.
    #[must_use]
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.pool_config.poll_interval = interval;
        self
    }

    /// Build the pool.
    pub fn build(self) -> Result<Pool, PoolError> {
        let driver = self
            .driver
            .ok_or_else(|| PoolError::InvalidConfig("no driver configured".into()))?;
        Pool::with_driver(self.pool_config, driver)
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: usize,
    /// Number of connections currently in use.
    pub in_use: usize,
    /// Total number of connections, open or checked out.
    pub total: usize,
    /// Number of slots.
    pub max: usize,
    /// Number of requesters queued for a connection.
    pub waiting: usize,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (self.in_use as f64 / self.max as f64) * 100.0
    }

    /// Check if every slot is checked out.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.in_use >= self.max
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total connections opened since pool start.
    pub connections_created: u64,
    /// Total connections closed since pool start.
    pub connections_closed: u64,
    /// Successful connection checkouts.
    pub checkouts_successful: u64,
    /// Failed connection checkouts (timeouts, pool closed, etc.).
    pub checkouts_failed: u64,
    /// Repairs that brought a slot back into service.
    pub repairs_performed: u64,
    /// Repairs that failed.
    pub repairs_failed: u64,
    /// Connections handed directly from a returning holder to a waiter.
    pub handoffs: u64,
    /// Requests that timed out in the wait queue.
    pub timeouts: u64,
    /// Time since the pool was created.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate the checkout success rate.
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }

    /// Calculate the repair success rate.
    #[must_use]
    pub fn repair_success_rate(&self) -> f64 {
        let total = self.repairs_performed + self.repairs_failed;
        if total == 0 {
            return 1.0;
        }
        self.repairs_performed as f64 / total as f64
    }
}

/// A connection checked out of the pool.
///
/// Dereferences to the underlying [`Connection`]. Dropping it returns the
/// connection to the pool.
pub struct PooledConnection {
    slot: usize,
    conn: Box<dyn Connection>,
    pool: Arc<PoolInner>,
    returned: bool,
}

impl PooledConnection {
    fn new(slot: usize, conn: Box<dyn Connection>, pool: Arc<PoolInner>) -> Self {
        Self {
            slot,
            conn,
            pool,
            returned: false,
        }
    }

    /// Index of the pool slot this connection occupies.
    #[must_use]
    pub fn slot(&self) -> usize {
        self.slot
    }

    /// The pool this connection belongs to.
    #[must_use]
    pub fn pool(&self) -> Pool {
        Pool {
            inner: Arc::clone(&self.pool),
        }
    }

    /// Detach the connection from the pool.
    ///
    /// The slot is left empty and reopened by a later borrower.
    pub fn detach(mut self) -> Box<dyn Connection> {
        let conn = self.take();
        self.pool.vacate(self.slot, true);
        conn
    }

    /// Close the connection instead of returning it.
    ///
    /// Used for connections left in an unknown protocol state.
    pub fn discard(mut self) {
        let conn = self.take();
        drop(conn);
        self.pool.metrics.lock().connections_closed += 1;
        self.pool.vacate(self.slot, true);
        tracing::debug!(slot = self.slot, "discarded pooled connection");
    }

    fn take(&mut self) -> Box<dyn Connection> {
        self.returned = true;
        std::mem::replace(&mut self.conn, Box::new(Vacant))
    }
}

impl Deref for PooledConnection {
    type Target = dyn Connection;

    fn deref(&self) -> &Self::Target {
        &*self.conn
    }
}

impl DerefMut for PooledConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut *self.conn
    }
}

impl fmt::Debug for PooledConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledConnection")
            .field("slot", &self.slot)
            .field("status", &self.conn.status())
            .finish()
    }
}

impl Drop for PooledConnection {
    fn drop(&mut self) {
        if self.returned {
            return;
        }
        tracing::trace!(slot = self.slot, "returning connection to pool");
        let conn = self.take();
        self.pool.checkin(self.slot, conn);
    }
}

/// Placeholder left behind once a connection has been taken out of its
/// wrapper.
struct Vacant;

impl Connection for Vacant {
    fn status(&self) -> ConnStatus {
        ConnStatus::Bad
    }

    fn error_message(&self) -> String {
        "connection detached".to_string()
    }

    fn set_nonblocking(&mut self, _nonblocking: bool) -> Result<(), DriverError> {
        Err(DriverError::BlockingMode("connection detached".into()))
    }

    fn send_query(&mut self, _sql: &str, _params: &[Option<&str>]) -> Result<(), DriverError> {
        Err(DriverError::Send("connection detached".into()))
    }

    fn consume_input(&mut self) -> Result<(), DriverError> {
        Err(DriverError::Io("connection detached".into()))
    }

    fn is_busy(&self) -> bool {
        false
    }

    fn next_result(&mut self) -> Option<QueryResult> {
        None
    }

    fn cancel(&mut self) -> Result<(), DriverError> {
        Ok(())
    }

    fn reset(&mut self) -> Result<(), DriverError> {
        Err(DriverError::Connect("connection detached".into()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use pgloop_testing::MockDriver;

    fn pool_of(size: usize, timeout: AcquireTimeout) -> (Pool, MockDriver) {
        let driver = MockDriver::new();
        let pool = Pool::builder()
            .driver(driver.clone())
            .size(size)
            .acquire_timeout(timeout)
            .build()
            .unwrap();
        (pool, driver)
    }

    #[test]
    fn test_pool_status_utilization() {
        let status = PoolStatus {
            available: 5,
            in_use: 5,
            total: 10,
            max: 20,
            waiting: 0,
        };
        assert!((status.utilization() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_status_at_capacity() {
        let status = PoolStatus {
            available: 0,
            in_use: 10,
            total: 10,
            max: 10,
            waiting: 3,
        };
        assert!(status.is_at_capacity());

        let status2 = PoolStatus {
            available: 5,
            in_use: 5,
            total: 10,
            max: 20,
            waiting: 0,
        };
        assert!(!status2.is_at_capacity());
    }

    #[test]
    fn test_pool_metrics_success_rates() {
        let metrics = PoolMetrics {
            connections_created: 10,
            connections_closed: 2,
            checkouts_successful: 90,
            checkouts_failed: 10,
            repairs_performed: 19,
            repairs_failed: 1,
            handoffs: 40,
            timeouts: 10,
            uptime: Duration::from_secs(3600),
        };

        assert!((metrics.checkout_success_rate() - 0.9).abs() < f64::EPSILON);
        assert!((metrics.repair_success_rate() - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn test_builder_fluent() {
        let builder = Pool::builder()
            .size(5)
            .acquire_timeout(AcquireTimeout::NoWait)
            .idle_timeout(Duration::from_secs(60));

        assert_eq!(builder.pool_config.size, 5);
        assert_eq!(builder.pool_config.acquire_timeout, AcquireTimeout::NoWait);
        assert_eq!(
            builder.pool_config.idle_timeout,
            Some(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_builder_requires_driver() {
        let err = Pool::builder().size(1).build().unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
    }

    #[test]
    fn test_create_opens_all_connections() {
        let (pool, driver) = pool_of(3, AcquireTimeout::NoWait);
        assert_eq!(driver.live_connections(), 3);
        assert_eq!(
            pool.status(),
            PoolStatus {
                available: 3,
                in_use: 0,
                total: 3,
                max: 3,
                waiting: 0,
            }
        );
        assert_eq!(pool.metrics().connections_created, 3);
    }

    #[test]
    fn test_create_rejects_invalid_size() {
        let err = Pool::new(PoolConfig::new().size(0), MockDriver::new()).unwrap_err();
        assert!(matches!(err, PoolError::InvalidConfig(_)));
    }

    #[test]
    fn test_create_fails_when_no_connection_opens() {
        let driver = MockDriver::new();
        driver.refuse_connects(true);
        let err = Pool::new(PoolConfig::new().size(2), driver).unwrap_err();
        assert!(matches!(err, PoolError::NoConnections { attempted: 2, .. }));
    }

    #[test]
    fn test_create_accepts_partial_pool() {
        let driver = MockDriver::new();
        driver.fail_next_connects(2);
        let pool = Pool::new(PoolConfig::new().size(3), driver.clone()).unwrap();
        let status = pool.status();
        assert_eq!(status.total, 1);
        assert_eq!(status.max, 3);

        // Empty slots are reopened on demand.
        let a = pool.try_get().unwrap().unwrap();
        let b = pool.try_get().unwrap().unwrap();
        let c = pool.try_get().unwrap().unwrap();
        assert!(pool.try_get().unwrap().is_none());
        assert_eq!(driver.live_connections(), 3);
        drop((a, b, c));
    }

    #[test]
    fn test_try_get_and_return() {
        let (pool, _driver) = pool_of(2, AcquireTimeout::NoWait);

        let a = pool.try_get().unwrap().unwrap();
        let b = pool.try_get().unwrap().unwrap();
        assert_ne!(a.slot(), b.slot());
        assert!(pool.slot_metadata().iter().all(|m| m.checkouts == 1));
        assert!(pool.try_get().unwrap().is_none());
        assert_eq!(pool.status().in_use, 2);

        drop(a);
        assert_eq!(pool.status().in_use, 1);
        assert!(pool.try_get().unwrap().is_some());
    }

    #[test]
    fn test_try_get_repairs_broken_connection() {
        let (pool, driver) = pool_of(1, AcquireTimeout::NoWait);
        driver.break_all();

        let conn = pool.try_get().unwrap().unwrap();
        assert!(conn.is_ok());
        assert_eq!(driver.resets(), 1);
        assert_eq!(pool.metrics().repairs_performed, 1);
    }

    #[test]
    fn test_try_get_reports_failed_repair() {
        let (pool, driver) = pool_of(1, AcquireTimeout::NoWait);
        driver.break_all();
        driver.fail_resets(true);
        driver.refuse_connects(true);

        let err = pool.try_get().unwrap_err();
        assert!(matches!(err, PoolError::Driver(_)));
        assert_eq!(pool.status().in_use, 0);
        assert_eq!(pool.status().total, 0);
    }

    #[test]
    fn test_detach_empties_slot() {
        let (pool, driver) = pool_of(1, AcquireTimeout::NoWait);
        let conn = pool.try_get().unwrap().unwrap();
        let raw = conn.detach();
        assert!(raw.is_ok());
        assert_eq!(pool.status().total, 0);
        drop(raw);
        assert_eq!(driver.live_connections(), 0);

        let again = pool.try_get().unwrap().unwrap();
        assert!(again.is_ok());
        assert_eq!(driver.connect_attempts(), 2);
    }

    #[test]
    fn test_cleanup_idle() {
        let (pool, driver) = pool_of(3, AcquireTimeout::NoWait);
        let held = pool.try_get().unwrap().unwrap();

        std::thread::sleep(Duration::from_millis(20));
        let closed = pool.cleanup_idle(Duration::from_millis(5));
        assert_eq!(closed, 2);
        assert_eq!(driver.live_connections(), 1);
        assert_eq!(pool.status().total, 1);

        drop(held);
        assert_eq!(pool.cleanup_idle(Duration::from_secs(60)), 0);
        assert_eq!(pool.metrics().connections_closed, 2);
    }

    #[test]
    fn test_close_is_idempotent() {
        let (pool, driver) = pool_of(2, AcquireTimeout::NoWait);
        let held = pool.try_get().unwrap().unwrap();

        pool.close();
        pool.close();
        assert!(pool.is_closed());
        assert!(pool.shutdown_token().is_cancelled());
        assert_eq!(driver.live_connections(), 1);
        assert!(matches!(pool.try_get(), Err(PoolError::PoolClosed)));

        drop(held);
        assert_eq!(driver.live_connections(), 0);
    }

    #[test]
    fn test_request_without_runtime() {
        let (pool, _driver) = pool_of(1, AcquireTimeout::Infinite);
        let _held = pool.try_get().unwrap().unwrap();

        let (tx, rx) = std::sync::mpsc::channel();
        pool.request(move |result| {
            let _ = tx.send(result.map(|c| c.slot()));
        });
        assert_eq!(rx.try_recv().unwrap(), Err(PoolError::NoRuntime));
        assert_eq!(pool.status().waiting, 0);
    }

    #[tokio::test]
    async fn test_acquire_hands_off_fifo() {
        let (pool, _driver) = pool_of(1, AcquireTimeout::Infinite);
        let held = pool.acquire().await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for i in 0..3 {
            let tx = tx.clone();
            pool.request(move |result| {
                let conn = result.unwrap();
                let _ = tx.send((i, conn));
            });
        }
        tokio::task::yield_now().await;
        assert_eq!(pool.status().waiting, 3);

        drop(held);
        for expected in 0..3 {
            let (i, conn) = rx.recv().await.unwrap();
            assert_eq!(i, expected);
            drop(conn);
        }
        assert_eq!(pool.metrics().handoffs, 3);
        assert_eq!(pool.status().available, 1);
    }

    #[tokio::test]
    async fn test_acquire_times_out() {
        let (pool, _driver) = pool_of(1, AcquireTimeout::After(Duration::from_millis(20)));
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert_eq!(err, PoolError::Timeout(Duration::from_millis(20)));
        assert_eq!(pool.status().waiting, 0);
        assert_eq!(pool.metrics().timeouts, 1);
    }

    #[tokio::test]
    async fn test_acquire_repairs_on_blocking_worker() {
        let (pool, driver) = pool_of(1, AcquireTimeout::NoWait);
        driver.break_all();
        driver.fail_resets(true);

        let conn = pool.acquire().await.unwrap();
        assert!(conn.is_ok());
        assert_eq!(driver.connect_attempts(), 2);
        assert_eq!(pool.metrics().repairs_performed, 1);
    }

    #[tokio::test]
    async fn test_discard_reopens_for_waiter() {
        let (pool, driver) = pool_of(1, AcquireTimeout::After(Duration::from_secs(5)));
        let held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.acquire().await })
        };
        while pool.status().waiting == 0 {
            tokio::task::yield_now().await;
        }

        held.discard();
        let conn = waiter.await.unwrap().unwrap();
        assert!(conn.is_ok());
        assert_eq!(driver.connect_attempts(), 2);
        assert_eq!(driver.live_connections(), 1);
    }

    #[tokio::test]
    async fn test_idle_reaper_runs_until_shutdown() {
        let driver = MockDriver::new();
        let pool = Pool::builder()
            .driver(driver.clone())
            .size(2)
            .idle_timeout(Duration::from_millis(10))
            .build()
            .unwrap();

        let reaper = pool.spawn_idle_reaper().unwrap();
        while driver.live_connections() > 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        pool.shutdown();
        reaper.await.unwrap();
        assert!(!pool.is_closed());
    }
}
