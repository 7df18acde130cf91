//! Per-template pools of test database instances.
//!
//! Each template hash owns a bounded pool: a FIFO queue of ready instance
//! ids, the set of checked-out instances, and a monotonic id counter.
//! Arrivals to the ready queue are signaled through a semaphore whose
//! permit count always mirrors the queue length, so a blocked getter can
//! never miss a return. New instances are registered *checked out*: they
//! serve the caller that triggered their creation directly instead of
//! racing other waiters through the queue.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::{Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::db::{ConnectionParams, Database, TestDatabase};
use crate::error::{Error, Result};

/// Bookkeeping for one tracked instance.
struct PooledEntry {
    db: TestDatabase,
    /// Set on every client return; a dirty instance is recreated from its
    /// template before the next handout.
    dirty: bool,
    checked_out: bool,
}

/// Mutable state of one template's pool. Never locked across I/O.
struct PoolState {
    ready: VecDeque<usize>,
    entries: HashMap<usize, PooledEntry>,
    /// Next ordinal to assign; monotonic, never rewound.
    next_id: usize,
    /// Live instances including slots reserved for in-flight creations.
    total: usize,
    /// Set under the lock when eviction detaches this structure from the
    /// map, so an in-flight `add` does not register into an unreachable
    /// pool.
    removed: bool,
}

struct TemplatePool {
    hash: String,
    max: usize,
    state: Mutex<PoolState>,
    /// One permit per entry in `ready`. Closed on eviction so blocked
    /// getters fail over to the creation path.
    arrivals: Semaphore,
}

impl TemplatePool {
    fn new(hash: &str, max: usize) -> Self {
        Self {
            hash: hash.to_string(),
            max,
            state: Mutex::new(PoolState {
                ready: VecDeque::new(),
                entries: HashMap::new(),
                next_id: 0,
                total: 0,
                removed: false,
            }),
            arrivals: Semaphore::new(0),
        }
    }

    /// Pop the ready head after a permit was obtained (and forgotten).
    fn take_ready(&self) -> Result<(TestDatabase, bool)> {
        let mut state = self.state.lock();
        let id = state.ready.pop_front().ok_or_else(|| Error::NoDbReady {
            hash: self.hash.clone(),
        })?;
        let entry = state.entries.get_mut(&id).ok_or_else(|| Error::NoDbReady {
            hash: self.hash.clone(),
        })?;
        entry.checked_out = true;
        Ok((entry.db.clone(), entry.dirty))
    }
}

/// All per-template pools, keyed by template hash.
pub struct DbPool {
    pools: DashMap<String, Arc<TemplatePool>>,
    max: usize,
}

impl DbPool {
    /// Create a pool set with the given per-template capacity.
    /// `max == 0` disables the bound: every acquisition reports
    /// [`Error::NoDbReady`] and creations are never rejected.
    #[must_use]
    pub fn new(max: usize) -> Self {
        Self {
            pools: DashMap::new(),
            max,
        }
    }

    fn entry(&self, hash: &str) -> Arc<TemplatePool> {
        self.pools
            .entry(hash.to_string())
            .or_insert_with(|| Arc::new(TemplatePool::new(hash, self.max)))
            .clone()
    }

    /// Acquire a ready instance for `hash`.
    ///
    /// Fast path pops the FIFO head. With no ready instance and capacity
    /// remaining (or pooling disabled), fails with the internal
    /// [`Error::NoDbReady`] so the coordinator creates a fresh instance.
    /// At capacity, blocks until a return arrives or `cancel` fires.
    ///
    /// The returned flag reports whether the instance is dirty and must be
    /// recreated from its template before handout.
    pub async fn get(
        &self,
        hash: &str,
        cancel: &CancellationToken,
    ) -> Result<(TestDatabase, bool)> {
        let pool = match self.pools.get(hash) {
            Some(entry) => Arc::clone(&entry),
            None => {
                return Err(Error::NoDbReady {
                    hash: hash.to_string(),
                })
            }
        };

        match pool.arrivals.try_acquire() {
            Ok(permit) => {
                permit.forget();
                return pool.take_ready();
            }
            Err(TryAcquireError::Closed) => {
                return Err(Error::NoDbReady {
                    hash: hash.to_string(),
                })
            }
            Err(TryAcquireError::NoPermits) => {}
        }

        {
            let state = pool.state.lock();
            if pool.max == 0 || state.total < pool.max {
                return Err(Error::NoDbReady {
                    hash: hash.to_string(),
                });
            }
        }

        // At capacity: wait for a return. Permits are stored, so a return
        // racing this suspension is not lost.
        tokio::select! {
            acquired = pool.arrivals.acquire() => match acquired {
                Ok(permit) => {
                    permit.forget();
                    pool.take_ready()
                }
                // Pool evicted while waiting; let the caller re-evaluate.
                Err(_) => Err(Error::NoDbReady {
                    hash: hash.to_string(),
                }),
            },
            () = cancel.cancelled() => Err(Error::Cancelled),
        }
    }

    /// Create and register a new instance for `hash`.
    ///
    /// Reserves the next ordinal and a capacity slot under the lock, then
    /// runs `create` with no lock held. On success the instance is
    /// registered as checked out and returned to the caller; on failure
    /// the slot is released. The ordinal is never reused: the physical
    /// database may exist in an unknown state until a purge reclaims it.
    ///
    /// If eviction detaches the pool while `create` is in flight, the
    /// instance is handed to `drop_db` instead of being registered, and
    /// the internal [`Error::NoDbReady`] tells the caller to re-evaluate
    /// against the replacement structure.
    pub async fn add<F, Fut, D, DFut>(
        &self,
        hash: &str,
        params: ConnectionParams,
        db_name_prefix: &str,
        create: F,
        drop_db: D,
    ) -> Result<TestDatabase>
    where
        F: FnOnce(TestDatabase) -> Fut,
        Fut: Future<Output = Result<()>>,
        D: FnOnce(TestDatabase) -> DFut,
        DFut: Future<Output = Result<()>>,
    {
        let (pool, test_db) = loop {
            let pool = self.entry(hash);
            let mut state = pool.state.lock();
            // Raced an eviction between the map lookup and this lock; the
            // map holds a replacement structure by now.
            if state.removed {
                drop(state);
                continue;
            }
            if pool.max > 0 && state.total >= pool.max {
                return Err(Error::PoolFull {
                    hash: hash.to_string(),
                    max: pool.max,
                });
            }
            let id = state.next_id;
            state.next_id += 1;
            state.total += 1;
            let test_db = TestDatabase {
                database: Database {
                    template_hash: hash.to_string(),
                    params: params.for_database(format!("{db_name_prefix}{id:04}")),
                },
                id,
            };
            drop(state);
            break (pool, test_db);
        };

        if let Err(err) = create(test_db.clone()).await {
            // Saturating: an eviction may have zeroed the counter already.
            let mut state = pool.state.lock();
            state.total = state.total.saturating_sub(1);
            return Err(err);
        }

        {
            let mut state = pool.state.lock();
            if !state.removed {
                state.entries.insert(
                    test_db.id,
                    PooledEntry {
                        db: test_db.clone(),
                        dirty: false,
                        checked_out: true,
                    },
                );
                return Ok(test_db);
            }
        }

        // Eviction won the race: registering now would leak the instance
        // into an unreachable structure, so drop it instead.
        let name = test_db.name().to_string();
        if let Err(err) = drop_db(test_db).await {
            warn!(database = %name, error = %err, "failed to drop instance created during eviction");
        }
        Err(Error::NoDbReady {
            hash: hash.to_string(),
        })
    }

    /// Return a checked-out instance, marking it dirty. It joins the tail
    /// of the ready queue and will be recreated before its next handout.
    pub fn return_test_database(&self, hash: &str, id: usize) -> Result<()> {
        self.release(hash, id, true)
    }

    /// Return a freshly created instance without marking it dirty. Used by
    /// background replenishment, whose instances are pristine clones of the
    /// template; a client return always goes through the dirty path.
    pub fn return_clean(&self, hash: &str, id: usize) -> Result<()> {
        self.release(hash, id, false)
    }

    fn release(&self, hash: &str, id: usize, dirty: bool) -> Result<()> {
        let pool = match self.pools.get(hash) {
            Some(entry) => Arc::clone(&entry),
            None => {
                return Err(Error::UnknownTestDatabase {
                    hash: hash.to_string(),
                    id,
                })
            }
        };
        {
            let mut state = pool.state.lock();
            match state.entries.get_mut(&id) {
                Some(entry) if entry.checked_out => {
                    entry.checked_out = false;
                    entry.dirty = dirty;
                }
                _ => {
                    return Err(Error::UnknownTestDatabase {
                        hash: hash.to_string(),
                        id,
                    })
                }
            }
            state.ready.push_back(id);
        }
        pool.arrivals.add_permits(1);
        Ok(())
    }

    /// Evict every tracked instance for `hash`, calling `drop_db` for each
    /// with no lock held. The per-template structure is removed entirely;
    /// the first drop failure is reported after the sweep completes.
    pub async fn remove_all_with_hash<F, Fut>(&self, hash: &str, drop_db: F) -> Result<()>
    where
        F: Fn(TestDatabase) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let Some((_, pool)) = self.pools.remove(hash) else {
            return Ok(());
        };
        Self::evict(&pool, drop_db).await
    }

    /// Evict every tracked instance for every template.
    pub async fn remove_all<F, Fut>(&self, drop_db: F) -> Result<()>
    where
        F: Fn(TestDatabase) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let pools: Vec<Arc<TemplatePool>> = {
            let hashes: Vec<String> = self.pools.iter().map(|e| e.key().clone()).collect();
            hashes
                .into_iter()
                .filter_map(|hash| self.pools.remove(&hash).map(|(_, pool)| pool))
                .collect()
        };
        let mut first_err = None;
        for pool in pools {
            if let Err(err) = Self::evict(&pool, &drop_db).await {
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    async fn evict<F, Fut>(pool: &TemplatePool, drop_db: F) -> Result<()>
    where
        F: Fn(TestDatabase) -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        // Fail blocked getters over to the creation path before dropping.
        pool.arrivals.close();
        let evicted: Vec<TestDatabase> = {
            let mut state = pool.state.lock();
            state.removed = true;
            state.ready.clear();
            state.total = 0;
            state.entries.drain().map(|(_, entry)| entry.db).collect()
        };

        let mut first_err = None;
        for db in evicted {
            let name = db.name().to_string();
            if let Err(err) = drop_db(db).await {
                warn!(database = %name, error = %err, "failed to drop evicted test database");
                first_err.get_or_insert(err);
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Number of live instances tracked for `hash` (including reserved
    /// in-flight creations).
    pub fn live_count(&self, hash: &str) -> usize {
        self.pools
            .get(hash)
            .map(|pool| pool.state.lock().total)
            .unwrap_or(0)
    }

    /// Number of instances currently waiting in the ready queue for `hash`.
    pub fn ready_count(&self, hash: &str) -> usize {
        self.pools
            .get(hash)
            .map(|pool| pool.state.lock().ready.len())
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for DbPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbPool")
            .field("templates", &self.pools.len())
            .field("max", &self.max)
            .finish()
    }
}
