//! The seam to the physical database server.
//!
//! The coordinator consumes exactly this surface; everything it knows about
//! the server goes through a [`Gateway`]. Implementations must be safe for
//! concurrent use. [`Connector`] opens gateways so the manager can own the
//! connect/disconnect/reconnect lifecycle and tests can inject fakes.

use async_trait::async_trait;

use crate::db::ConnectionParams;
use crate::error::Result;

/// Database-lifecycle primitives against the managed server.
///
/// All four namespace operations are idempotent from the coordinator's
/// perspective: it never relies on an error to learn about prior state.
#[async_trait]
pub trait Gateway: Send + Sync + 'static {
    /// Create `name` owned by `owner`, cloned from `template`.
    async fn create_database(&self, name: &str, owner: &str, template: &str) -> Result<()>;

    /// Drop `name` if it exists.
    async fn drop_database(&self, name: &str) -> Result<()>;

    /// Whether `name` exists on the server.
    async fn database_exists(&self, name: &str) -> Result<bool>;

    /// Names of all databases starting with `prefix`.
    async fn list_databases(&self, prefix: &str) -> Result<Vec<String>>;

    /// Round-trip connectivity check.
    async fn ping(&self) -> Result<()>;

    /// Release the underlying connection resources. Subsequent calls fail.
    async fn close(&self) -> Result<()>;
}

/// Opens a [`Gateway`] from connection parameters.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// The gateway type this connector produces.
    type Gateway: Gateway;

    /// Open a gateway to the server described by `params`.
    async fn open(&self, params: &ConnectionParams) -> Result<Self::Gateway>;
}
