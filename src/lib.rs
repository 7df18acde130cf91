//! # testdb-pool
//!
//! Coordinator for pooled, template-cloned integration-test databases.
//!
//! A client registers a *template* under a content hash (typically a hash of
//! migrations plus fixtures), populates it out-of-band, and finalizes it.
//! From then on the [`Manager`] hands out independent *test databases*
//! cloned from that template, recycling returned instances by recreating
//! them from the template before the next handout.
//!
//! ## Core types
//!
//! - [`Manager`]: the public facade for template lifecycle, test-database
//!   checkout/return, startup purge, and shutdown.
//! - [`Gateway`] / [`Connector`]: the seam to the physical database server;
//!   [`pg::PgGateway`] is the Postgres implementation.
//! - [`ManagerConfig`]: prefixes, pool sizing, credentials.
//! - [`testing::InMemoryGateway`]: a recording gateway for test suites.

pub mod config;
pub mod credentials;
pub mod db;
pub mod error;
pub mod gateway;
pub mod manager;
pub mod naming;
pub mod pool;
pub mod templates;
pub mod testing;

#[cfg(feature = "postgres")]
pub mod pg;

pub use config::ManagerConfig;
pub use credentials::SecureString;
pub use db::{ConnectionParams, Database, TestDatabase};
pub use error::{Error, Result};
pub use gateway::{Connector, Gateway};
pub use manager::Manager;
pub use templates::TemplateState;

#[cfg(feature = "postgres")]
pub use pg::{PgConnector, PgGateway};
