//! The coordinator facade: template lifecycle, test-database checkout and
//! return, startup purge, and shutdown.
//!
//! The manager owns the template registry and the per-template pools and
//! drives all physical work through the [`Gateway`]. No lock is held
//! across gateway I/O, with one deliberate exception: the per-template
//! init lock taken by [`Manager::initialize_template`], which is the
//! serialization point for duplicate initialization requests.

use std::future::Future;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::db::{Database, TestDatabase};
use crate::error::{Error, Result};
use crate::gateway::{Connector, Gateway};
use crate::naming;
use crate::pool::DbPool;
use crate::templates::{Template, TemplateCollection, TemplateState};

/// Per-connection runtime: gateway handle, broadcast shutdown signal, and
/// the tracker for background workers. Recreated on every (re)connect.
struct Connected<G> {
    gateway: Arc<G>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Cloned-out view of [`Connected`] used by operations after the ready
/// check, so no lock outlives the check itself.
struct Runtime<G> {
    gateway: Arc<G>,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

/// Coordinator for templates and pooled test databases.
pub struct Manager<C: Connector> {
    config: Arc<ManagerConfig>,
    connector: C,
    templates: Arc<TemplateCollection>,
    pool: Arc<DbPool>,
    conn: RwLock<Option<Connected<C::Gateway>>>,
}

impl<C: Connector> Manager<C> {
    /// Create a disconnected manager. The configuration is normalized and
    /// validated here; credential inheritance and pool-size capping happen
    /// once, not per operation.
    pub fn new(config: ManagerConfig, connector: C) -> Result<Self> {
        let config = config.normalized();
        config.validate()?;
        let max = config.test_database_max_pool_size;
        Ok(Self {
            config: Arc::new(config),
            connector,
            templates: Arc::new(TemplateCollection::new()),
            pool: Arc::new(DbPool::new(max)),
            conn: RwLock::new(None),
        })
    }

    /// The manager's configuration after normalization.
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Whether the manager is connected and not shutting down.
    pub fn ready(&self) -> bool {
        matches!(&*self.conn.read(), Some(c) if !c.shutdown.is_cancelled())
    }

    /// Open the gateway and verify connectivity.
    pub async fn connect(&self, cancel: &CancellationToken) -> Result<()> {
        if self.conn.read().is_some() {
            return Err(Error::configuration("manager is already connected"));
        }

        let gateway = with_cancel(cancel, self.connector.open(&self.config.manager_params)).await?;
        with_cancel(cancel, gateway.ping()).await?;

        let mut connected = Some(Connected {
            gateway: Arc::new(gateway),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        });
        {
            let mut slot = self.conn.write();
            if slot.is_none() {
                *slot = connected.take();
            }
        }
        match connected {
            None => {
                info!(host = %self.config.manager_params.host, "manager connected");
                Ok(())
            }
            Some(raced) => {
                // Lost a connect race; close the extra gateway quietly.
                let _ = raced.gateway.close().await;
                Err(Error::configuration("manager is already connected"))
            }
        }
    }

    /// Signal shutdown, wait (bounded by `cancel`) for background workers,
    /// and close the gateway. Public calls made after the shutdown signal
    /// fail with [`Error::NotReady`].
    pub async fn disconnect(
        &self,
        cancel: &CancellationToken,
        ignore_close_error: bool,
    ) -> Result<()> {
        let connected = self
            .conn
            .write()
            .take()
            .ok_or_else(|| Error::configuration("manager is not connected"))?;

        connected.shutdown.cancel();
        connected.tasks.close();
        tokio::select! {
            () = connected.tasks.wait() => {}
            () = cancel.cancelled() => {
                warn!("shutdown wait cancelled with background workers still running");
            }
        }

        if let Err(err) = connected.gateway.close().await {
            if !ignore_close_error {
                return Err(err);
            }
            warn!(error = %err, "ignoring gateway close error");
        }
        info!("manager disconnected");
        Ok(())
    }

    /// Disconnect (optionally ignoring errors) and connect again.
    pub async fn reconnect(
        &self,
        cancel: &CancellationToken,
        ignore_disconnect_error: bool,
    ) -> Result<()> {
        if let Err(err) = self.disconnect(cancel, ignore_disconnect_error).await {
            if !ignore_disconnect_error {
                return Err(err);
            }
        }
        self.connect(cancel).await
    }

    /// Connect if necessary, then purge every managed database left behind
    /// by a previous run: everything under the template prefix and the
    /// test prefix. This is the sole reconciliation between the empty
    /// in-memory state and stale physical state.
    pub async fn initialize(&self, cancel: &CancellationToken) -> Result<()> {
        if !self.ready() {
            self.connect(cancel).await?;
        }
        let rt = self.runtime()?;

        for prefix in [
            self.config.managed_template_prefix(),
            self.config.managed_test_prefix(),
        ] {
            let names = with_cancel(cancel, rt.gateway.list_databases(&prefix)).await?;
            for name in names {
                with_cancel(cancel, rt.gateway.drop_database(&name)).await?;
                debug!(database = %name, "purged stale managed database");
            }
        }
        Ok(())
    }

    /// Register a template for `hash` and create its database.
    ///
    /// Exactly one of any set of concurrent calls for the same hash wins;
    /// the others fail with [`Error::AlreadyInitialized`] without touching
    /// the server. The physical drop-and-create runs inside the
    /// per-template critical section; on failure the registration is
    /// rolled back so the caller may retry.
    pub async fn initialize_template(
        &self,
        hash: &str,
        cancel: &CancellationToken,
    ) -> Result<Database> {
        let rt = self.runtime()?;
        ensure_safe_hash(hash)?;

        let name = self.config.template_database_name(hash);
        let database = Database {
            template_hash: hash.to_string(),
            params: self.config.manager_params.for_database(name.clone()),
        };

        let (added, guard) = self.templates.push(hash, database.clone());
        if !added {
            return Err(Error::AlreadyInitialized {
                hash: hash.to_string(),
            });
        }
        // Held across the physical creation: concurrent operations on this
        // hash observe a consistent state.
        let _guard = guard;

        match drop_and_create(
            rt.gateway.as_ref(),
            cancel,
            &name,
            &self.config.manager_params.username,
            &self.config.template_database_template,
        )
        .await
        {
            Ok(()) => {
                debug!(template = %hash, database = %name, "template database initialized");
                Ok(database)
            }
            Err(err) => {
                self.templates.remove_unsafe(hash);
                Err(err)
            }
        }
    }

    /// Declare the template populated and eligible to back test databases.
    ///
    /// Idempotent: a template already `Ready` returns its descriptor again
    /// and spawns no additional replenishment worker. A discarded template
    /// fails with [`Error::TemplateDiscarded`].
    pub async fn finalize_template(
        &self,
        hash: &str,
        _cancel: &CancellationToken,
    ) -> Result<Database> {
        let rt = self.runtime()?;
        let template = self.get_template(hash)?;

        if !template.transition(TemplateState::Initializing, TemplateState::Ready) {
            return match template.state() {
                TemplateState::Ready => Ok(template.database().clone()),
                _ => Err(Error::TemplateDiscarded {
                    hash: hash.to_string(),
                }),
            };
        }

        let count = self.config.test_database_initial_pool_size;
        if count > 0 {
            self.spawn_replenishment(&rt, Arc::clone(&template), count);
        }
        debug!(template = %hash, prewarm = count, "template finalized");
        Ok(template.database().clone())
    }

    /// Remove the template and drop its database. A hash that is not
    /// tracked but whose derived database still exists (left over from a
    /// previous run) is dropped as well.
    pub async fn discard_template(&self, hash: &str, cancel: &CancellationToken) -> Result<()> {
        let rt = self.runtime()?;
        ensure_safe_hash(hash)?;

        let name = match self.templates.pop(hash) {
            Some(template) => {
                template.discard();
                template.database().params.database.clone()
            }
            None => {
                let name = self.config.template_database_name(hash);
                let exists = with_cancel(cancel, rt.gateway.database_exists(&name)).await?;
                if !exists {
                    return Err(Error::TemplateNotFound {
                        hash: hash.to_string(),
                    });
                }
                name
            }
        };
        with_cancel(cancel, rt.gateway.drop_database(&name)).await?;
        debug!(template = %hash, database = %name, "template discarded");
        Ok(())
    }

    /// Check out a test database for `hash`.
    ///
    /// Waits (bounded) for the template to become ready, then takes a
    /// pooled instance (recreating it from the template first if it came
    /// back dirty) or creates a fresh one within the capacity limit.
    pub async fn get_test_database(
        &self,
        hash: &str,
        cancel: &CancellationToken,
    ) -> Result<TestDatabase> {
        let rt = self.runtime()?;
        let template = self.get_template(hash)?;
        self.await_ready(&template, cancel).await?;

        loop {
            match self.pool.get(hash, cancel).await {
                Ok((db, dirty)) => {
                    if dirty {
                        drop_and_create(
                            rt.gateway.as_ref(),
                            cancel,
                            db.name(),
                            &self.config.test_database_owner,
                            &template.database().params.database,
                        )
                        .await?;
                    }
                    return Ok(db);
                }
                Err(err) if err.is_no_db_ready() => {
                    match create_instance(&self.config, &self.pool, &rt.gateway, &template, cancel)
                        .await
                    {
                        // An eviction raced the creation; re-evaluate
                        // against the replacement pool.
                        Err(err) if err.is_no_db_ready() => continue,
                        result => return result,
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// Return a checked-out test database to its template's pool. The
    /// instance is marked dirty and will be recreated before reuse.
    pub async fn return_test_database(
        &self,
        hash: &str,
        id: usize,
        cancel: &CancellationToken,
    ) -> Result<()> {
        self.runtime()?;
        let template = self.get_template(hash)?;
        self.await_ready(&template, cancel).await?;
        self.pool.return_test_database(hash, id)
    }

    /// Drop every tracked test database for `hash`; the template itself
    /// stays registered.
    pub async fn clear_tracked_test_databases(
        &self,
        hash: &str,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let rt = self.runtime()?;
        let gateway = Arc::clone(&rt.gateway);
        let cancel = cancel.clone();
        self.pool
            .remove_all_with_hash(hash, move |db| {
                let gateway = Arc::clone(&gateway);
                let cancel = cancel.clone();
                async move {
                    with_cancel(&cancel, gateway.drop_database(db.name())).await
                }
            })
            .await
    }

    /// Discard every template and drop every tracked database, template
    /// databases included. The first error is reported after the sweep.
    pub async fn reset_all_tracking(&self, cancel: &CancellationToken) -> Result<()> {
        let rt = self.runtime()?;

        // Templates go first so no new test database creation can start.
        let mut first_err = None;
        for template in self.templates.remove_all() {
            let name = template.database().params.database.clone();
            if let Err(err) = with_cancel(cancel, rt.gateway.drop_database(&name)).await {
                warn!(database = %name, error = %err, "failed to drop template database");
                first_err.get_or_insert(err);
            }
        }

        let gateway = Arc::clone(&rt.gateway);
        let drop_cancel = cancel.clone();
        let pool_result = self
            .pool
            .remove_all(move |db| {
                let gateway = Arc::clone(&gateway);
                let cancel = drop_cancel.clone();
                async move {
                    with_cancel(&cancel, gateway.drop_database(db.name())).await
                }
            })
            .await;

        match (first_err, pool_result) {
            (Some(err), _) => Err(err),
            (None, result) => result,
        }
    }

    fn runtime(&self) -> Result<Runtime<C::Gateway>> {
        match &*self.conn.read() {
            Some(c) if !c.shutdown.is_cancelled() => Ok(Runtime {
                gateway: Arc::clone(&c.gateway),
                shutdown: c.shutdown.clone(),
                tasks: c.tasks.clone(),
            }),
            _ => Err(Error::NotReady),
        }
    }

    fn get_template(&self, hash: &str) -> Result<Arc<Template>> {
        self.templates.get(hash).ok_or_else(|| Error::TemplateNotFound {
            hash: hash.to_string(),
        })
    }

    /// Wait for the template to be ready; any other outcome is an
    /// [`Error::InvalidTemplateState`].
    async fn await_ready(&self, template: &Template, cancel: &CancellationToken) -> Result<()> {
        let state = template
            .wait_until_ready(self.config.test_database_wait_timeout, cancel)
            .await?;
        if state != TemplateState::Ready {
            return Err(Error::InvalidTemplateState {
                hash: template.hash().to_string(),
                state,
            });
        }
        Ok(())
    }

    /// Spawn the fire-and-forget replenishment worker for a freshly
    /// finalized template. Creation errors are logged and counted, never
    /// propagated; the worker exits early on the shutdown signal.
    fn spawn_replenishment(&self, rt: &Runtime<C::Gateway>, template: Arc<Template>, count: usize) {
        let config = Arc::clone(&self.config);
        let pool = Arc::clone(&self.pool);
        let gateway = Arc::clone(&rt.gateway);
        let shutdown = rt.shutdown.clone();

        rt.tasks.spawn(async move {
            let hash = template.hash().to_string();
            let mut created = 0usize;
            let mut failed = 0usize;

            for _ in 0..count {
                if shutdown.is_cancelled() {
                    break;
                }
                match create_instance(&config, &pool, &gateway, &template, &shutdown).await {
                    Ok(db) => {
                        created += 1;
                        // Fresh clone of the template: goes into the ready
                        // queue clean, no recreation needed on handout.
                        if let Err(err) = pool.return_clean(&hash, db.id) {
                            warn!(template = %hash, id = db.id, error = %err,
                                "failed to park replenished instance");
                        }
                    }
                    Err(err) if err.is_cancelled() => break,
                    Err(err) => {
                        failed += 1;
                        warn!(template = %hash, error = %err, "replenishment creation failed");
                    }
                }
            }
            debug!(template = %hash, created, failed, "replenishment worker finished");
        });
    }
}

#[cfg(feature = "postgres")]
impl Manager<crate::pg::PgConnector> {
    /// Postgres-backed manager configured from `TESTPOOL_*` environment
    /// variables.
    pub fn from_env() -> Result<Self> {
        Self::new(ManagerConfig::from_env(), crate::pg::PgConnector::default())
    }
}

impl<C: Connector> std::fmt::Debug for Manager<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Manager")
            .field("ready", &self.ready())
            .field("templates", &self.templates.len())
            .finish()
    }
}

fn ensure_safe_hash(hash: &str) -> Result<()> {
    if !naming::is_safe_identifier(hash) {
        return Err(Error::InvalidIdentifier {
            value: hash.to_string(),
        });
    }
    Ok(())
}

/// Run `fut` unless `cancel` fires first. An already-fired token wins even
/// against a future that would complete immediately.
async fn with_cancel<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        () = cancel.cancelled() => Err(Error::Cancelled),
        result = fut => result,
    }
}

async fn drop_and_create<G: Gateway>(
    gateway: &G,
    cancel: &CancellationToken,
    name: &str,
    owner: &str,
    template: &str,
) -> Result<()> {
    with_cancel(cancel, gateway.drop_database(name)).await?;
    with_cancel(cancel, gateway.create_database(name, owner, template)).await
}

/// Create a new test database instance for `template` and register it as
/// checked out, serving the caller directly. Shared between the checkout
/// path (on `NoDbReady`) and the replenishment worker.
async fn create_instance<G: Gateway>(
    config: &ManagerConfig,
    pool: &DbPool,
    gateway: &Arc<G>,
    template: &Arc<Template>,
    cancel: &CancellationToken,
) -> Result<TestDatabase> {
    let state = template
        .wait_until_ready(config.test_database_wait_timeout, cancel)
        .await?;
    if state != TemplateState::Ready {
        return Err(Error::InvalidTemplateState {
            hash: template.hash().to_string(),
            state,
        });
    }

    let hash = template.hash();
    let params = config.manager_params.with_credentials(
        config.test_database_owner.clone(),
        config.test_database_owner_password.clone(),
    );
    let prefix = config.test_database_prefix_for(hash);
    let template_db = template.database().params.database.clone();
    let owner = config.test_database_owner.clone();
    let gateway = Arc::clone(gateway);
    let drop_gateway = Arc::clone(&gateway);
    let cancel = cancel.clone();

    pool.add(
        hash,
        params,
        &prefix,
        move |db| async move {
            drop_and_create(gateway.as_ref(), &cancel, db.name(), &owner, &template_db).await
        },
        // Cleanup when an eviction races the creation; not cancellable,
        // the instance would otherwise leak until the next purge.
        move |db| async move { drop_gateway.drop_database(db.name()).await },
    )
    .await
}
