//! Bounded backend connection pool.
//!
//! Capacity is a fixed bound N; the semaphore's N permits are the slot
//! accounting, so permits held by waiters plus leases outstanding always
//! equals N. `tokio::sync::Semaphore` queues waiters in arrival order,
//! which gives acquisition FIFO fairness, and a waiter that abandons the
//! wait at its deadline leaves the queue without disturbing the others.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_queue::ArrayQueue;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::config::BackendOpts;
use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::value::{QueryRequest, ResultSet};

/// Replacement attempts after a broken connection is discarded. Capacity
/// is also restored lazily by `acquire` opening on demand, so exhausting
/// these only delays recovery.
const REPLACE_ATTEMPTS: u32 = 3;
const REPLACE_BACKOFF: Duration = Duration::from_millis(500);

struct PoolInner {
    opts: BackendOpts,
    capacity: usize,
    idle_staleness: Duration,
    idle: ArrayQueue<Conn>,
    slots: Arc<Semaphore>,
    in_flight: AtomicUsize,
}

/// Bounded pool of backend connections.
#[derive(Clone)]
pub struct Pool {
    inner: Arc<PoolInner>,
}

impl Pool {
    /// Create a pool with fixed capacity. No connections are opened until
    /// `warm` or the first `acquire`.
    pub fn new(opts: BackendOpts, capacity: usize, idle_staleness: Duration) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                opts,
                capacity,
                idle_staleness,
                idle: ArrayQueue::new(capacity.max(1)),
                slots: Arc::new(Semaphore::new(capacity.max(1))),
                in_flight: AtomicUsize::new(0),
            }),
        }
    }

    /// Pool capacity N.
    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    /// Number of idle connections currently pooled.
    pub fn idle_count(&self) -> usize {
        self.inner.idle.len()
    }

    /// Number of leases currently outstanding.
    pub fn in_flight(&self) -> usize {
        self.inner.in_flight.load(Ordering::Acquire)
    }

    /// Pre-open up to capacity connections, tolerating partial failure.
    /// Returns the number opened; fails if fewer than `min` could open.
    pub async fn warm(&self, min: usize) -> Result<usize> {
        let mut opened = 0;
        for _ in 0..self.inner.capacity {
            match Conn::open(&self.inner.opts).await {
                Ok(conn) => {
                    opened += 1;
                    if self.inner.idle.push(conn).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(error = %e, "warm-up connection failed");
                }
            }
        }
        if opened < min {
            return Err(Error::Unavailable("backend warm-up below minimum"));
        }
        Ok(opened)
    }

    /// Acquire an exclusive lease on one connection, waiting in FIFO order
    /// for a free slot until `deadline`.
    ///
    /// Fails with `PoolTimeout` when the deadline elapses first, and with
    /// `Unavailable` when a slot freed up but no backend connection could
    /// be established — connect-level detail is logged here, never
    /// surfaced to clients.
    pub async fn acquire(&self, deadline: Instant) -> Result<Lease> {
        let slots = Arc::clone(&self.inner.slots);
        let permit = tokio::time::timeout_at(deadline.into(), slots.acquire_owned())
            .await
            .map_err(|_| Error::PoolTimeout)?
            .map_err(|_| Error::Unavailable("pool is closed"))?;

        let conn = self.checkout(deadline).await?;

        self.inner.in_flight.fetch_add(1, Ordering::AcqRel);
        Ok(Lease {
            conn: Some(conn),
            pool: Arc::clone(&self.inner),
            _permit: Some(permit),
        })
    }

    /// Take a live idle connection, validating stale ones, or open a new
    /// connection for this slot.
    async fn checkout(&self, deadline: Instant) -> Result<Conn> {
        loop {
            let Some(mut conn) = self.inner.idle.pop() else {
                return self.open_for_slot(deadline).await;
            };

            if conn.idle_for() < self.inner.idle_staleness {
                return Ok(conn);
            }

            // Stale: validate before leasing it out.
            match conn.ping(deadline).await {
                Ok(()) => return Ok(conn),
                Err(e) => {
                    tracing::warn!(
                        backend_pid = conn.backend_pid(),
                        error = %e,
                        "stale connection failed validation, replacing"
                    );
                    // Loop: try the next idle connection or open fresh.
                }
            }
        }
    }

    async fn open_for_slot(&self, deadline: Instant) -> Result<Conn> {
        match tokio::time::timeout_at(deadline.into(), Conn::open(&self.inner.opts)).await {
            Ok(Ok(conn)) => Ok(conn),
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "failed to open backend connection");
                Err(Error::Unavailable("no backend connection available"))
            }
            Err(_) => Err(Error::PoolTimeout),
        }
    }

    /// Gracefully close all idle connections (drain phase).
    pub async fn close_idle(&self) {
        while let Some(conn) = self.inner.idle.pop() {
            if let Err(e) = conn.close().await {
                tracing::debug!(error = %e, "error closing idle connection");
            }
        }
    }
}

impl PoolInner {
    /// Restore capacity after a broken connection was discarded. Runs
    /// detached so the releasing caller never blocks on a reconnect.
    async fn replace(self: Arc<Self>) {
        for attempt in 1..=REPLACE_ATTEMPTS {
            match Conn::open(&self.opts).await {
                Ok(conn) => {
                    if self.idle.push(conn).is_err() {
                        // Queue already full: capacity is restored.
                        return;
                    }
                    tracing::debug!("replaced broken backend connection");
                    return;
                }
                Err(e) => {
                    tracing::warn!(attempt, error = %e, "replacement connection failed");
                    tokio::time::sleep(REPLACE_BACKOFF * attempt).await;
                }
            }
        }
        // Give up; the next acquire opens on demand.
    }
}

/// Exclusive temporary handle to one pooled connection, granted to exactly
/// one in-flight request. Dropping it is the single point that makes the
/// slot available again: healthy connections return to the idle set,
/// broken ones are discarded and replaced.
pub struct Lease {
    conn: Option<Conn>,
    pool: Arc<PoolInner>,
    _permit: Option<OwnedSemaphorePermit>,
}

impl Lease {
    /// Execute a query on the leased connection.
    pub async fn execute(&mut self, request: &QueryRequest, deadline: Instant) -> Result<ResultSet> {
        let conn = self
            .conn
            .as_mut()
            .ok_or(Error::ConnectionBroken)?;
        conn.execute(request, deadline).await
    }

    /// Backend process ID of the leased connection.
    pub fn backend_pid(&self) -> u32 {
        self.conn.as_ref().map_or(0, Conn::backend_pid)
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        self.pool.in_flight.fetch_sub(1, Ordering::AcqRel);

        let Some(conn) = self.conn.take() else {
            return;
        };

        if conn.is_broken() {
            tracing::warn!(
                backend_pid = conn.backend_pid(),
                "discarding broken connection"
            );
            let pool = Arc::clone(&self.pool);
            // Leases normally drop inside the runtime; when they don't
            // (process teardown), the next acquire opens on demand instead.
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(pool.replace());
            }
        } else {
            // Push can only fail when a replacement already refilled the
            // queue; the surplus connection just closes.
            let _ = self.pool.idle.push(conn);
        }
        // The slot permit drops here, waking the next FIFO waiter.
    }
}
