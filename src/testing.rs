//! Testing utilities: an in-memory gateway with recorded call history.
//!
//! [`InMemoryGateway`] simulates the server's database namespace so test
//! suites can drive the coordinator without a running server, inject
//! failures, and assert on the exact gateway traffic.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::db::ConnectionParams;
use crate::error::{Error, Result};
use crate::gateway::{Connector, Gateway};

/// Record of one gateway call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayCall {
    /// `create_database(name, owner, template)`
    Create {
        /// Database created
        name: String,
        /// Owning role
        owner: String,
        /// Source template database
        template: String,
    },
    /// `drop_database(name)`
    Drop {
        /// Database dropped
        name: String,
    },
    /// `database_exists(name)`
    Exists {
        /// Database probed
        name: String,
    },
    /// `list_databases(prefix)`
    List {
        /// Prefix listed
        prefix: String,
    },
}

#[derive(Default)]
struct GatewayState {
    databases: BTreeSet<String>,
    calls: Vec<GatewayCall>,
    /// Countdown of injected create failures.
    failing_creates: usize,
    /// Countdown of injected drop failures.
    failing_drops: usize,
    latency: Option<Duration>,
    closed: bool,
}

/// In-memory [`Gateway`] with a shared, inspectable namespace.
#[derive(Clone, Default)]
pub struct InMemoryGateway {
    state: Arc<Mutex<GatewayState>>,
}

impl InMemoryGateway {
    /// Fresh gateway with an empty namespace.
    pub fn new() -> Self {
        Self::default()
    }

    fn latency(&self) -> Option<Duration> {
        self.state.lock().latency
    }

    fn ensure_open(&self) -> Result<()> {
        if self.state.lock().closed {
            return Err(Error::gateway("gateway is closed"));
        }
        Ok(())
    }

    /// Add an artificial delay to every namespace operation.
    pub fn set_latency(&self, latency: Duration) {
        self.state.lock().latency = Some(latency);
    }

    /// Make the next `n` create calls fail.
    pub fn fail_next_creates(&self, n: usize) {
        self.state.lock().failing_creates = n;
    }

    /// Make the next `n` drop calls fail.
    pub fn fail_next_drops(&self, n: usize) {
        self.state.lock().failing_drops = n;
    }

    /// Create a database out-of-band (e.g. stale state for purge tests).
    pub fn seed(&self, name: impl Into<String>) {
        self.state.lock().databases.insert(name.into());
    }

    /// Whether `name` currently exists, without recording a call.
    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().databases.contains(name)
    }

    /// Snapshot of all existing database names.
    pub fn database_names(&self) -> Vec<String> {
        self.state.lock().databases.iter().cloned().collect()
    }

    /// Full recorded call history, in order.
    pub fn calls(&self) -> Vec<GatewayCall> {
        self.state.lock().calls.clone()
    }

    /// Number of recorded create calls for `name`.
    pub fn create_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, GatewayCall::Create { name: n, .. } if n == name))
            .count()
    }

    /// Number of recorded drop calls for `name`.
    pub fn drop_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|call| matches!(call, GatewayCall::Drop { name: n } if n == name))
            .count()
    }

    /// Clear the recorded call history (the namespace is kept).
    pub fn clear_calls(&self) {
        self.state.lock().calls.clear();
    }
}

impl std::fmt::Debug for InMemoryGateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryGateway")
            .field("databases", &state.databases.len())
            .field("calls", &state.calls.len())
            .field("closed", &state.closed)
            .finish()
    }
}

#[async_trait]
impl Gateway for InMemoryGateway {
    async fn create_database(&self, name: &str, owner: &str, template: &str) -> Result<()> {
        self.ensure_open()?;
        if let Some(latency) = self.latency() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock();
        state.calls.push(GatewayCall::Create {
            name: name.to_string(),
            owner: owner.to_string(),
            template: template.to_string(),
        });
        if state.failing_creates > 0 {
            state.failing_creates -= 1;
            return Err(Error::gateway(format!("injected create failure for '{name}'")));
        }
        if !state.databases.insert(name.to_string()) {
            return Err(Error::gateway(format!("database '{name}' already exists")));
        }
        Ok(())
    }

    async fn drop_database(&self, name: &str) -> Result<()> {
        self.ensure_open()?;
        if let Some(latency) = self.latency() {
            tokio::time::sleep(latency).await;
        }
        let mut state = self.state.lock();
        state.calls.push(GatewayCall::Drop {
            name: name.to_string(),
        });
        if state.failing_drops > 0 {
            state.failing_drops -= 1;
            return Err(Error::gateway(format!("injected drop failure for '{name}'")));
        }
        state.databases.remove(name);
        Ok(())
    }

    async fn database_exists(&self, name: &str) -> Result<bool> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.calls.push(GatewayCall::Exists {
            name: name.to_string(),
        });
        Ok(state.databases.contains(name))
    }

    async fn list_databases(&self, prefix: &str) -> Result<Vec<String>> {
        self.ensure_open()?;
        let mut state = self.state.lock();
        state.calls.push(GatewayCall::List {
            prefix: prefix.to_string(),
        });
        Ok(state
            .databases
            .iter()
            .filter(|name| name.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn ping(&self) -> Result<()> {
        self.ensure_open()
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().closed = true;
        Ok(())
    }
}

/// [`Connector`] producing gateways that all share one namespace, so tests
/// keep a handle for assertions while the manager owns its own.
#[derive(Clone, Default)]
pub struct InMemoryConnector {
    state: Arc<Mutex<GatewayState>>,
}

impl InMemoryConnector {
    /// Fresh connector with an empty shared namespace.
    pub fn new() -> Self {
        Self::default()
    }

    /// A gateway handle over the shared namespace, for test assertions.
    pub fn handle(&self) -> InMemoryGateway {
        InMemoryGateway {
            state: Arc::clone(&self.state),
        }
    }
}

#[async_trait]
impl Connector for InMemoryConnector {
    type Gateway = InMemoryGateway;

    async fn open(&self, _params: &ConnectionParams) -> Result<InMemoryGateway> {
        // Reopening after close restores service (reconnect support).
        self.state.lock().closed = false;
        Ok(InMemoryGateway {
            state: Arc::clone(&self.state),
        })
    }
}
