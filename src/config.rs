//! Manager configuration.

use std::time::Duration;

use serde::Deserialize;

use crate::credentials::SecureString;
use crate::db::ConnectionParams;
use crate::error::{Error, Result};
use crate::naming;

/// Configuration for the coordinator.
///
/// Construct with [`ManagerConfig::from_env`] or build one and pass it
/// through [`ManagerConfig::normalized`]; normalization applies the
/// credential-inheritance and pool-size capping rules once, at
/// construction time.
#[derive(Debug, Clone, Deserialize)]
pub struct ManagerConfig {
    /// Connection parameters for the manager role (must be allowed to
    /// CREATE/DROP databases on the server).
    pub manager_params: ConnectionParams,
    /// Namespace prefix shared by every managed database.
    pub database_prefix: String,
    /// Second-level prefix for template databases.
    pub template_database_prefix: String,
    /// Second-level prefix for test databases.
    pub test_database_prefix: String,
    /// Name of the database used as `TEMPLATE` when creating template
    /// databases (typically `template0` or a project baseline).
    pub template_database_template: String,
    /// Role owning handed-out test databases; empty inherits the manager
    /// username during normalization.
    pub test_database_owner: String,
    /// Password for the test owner role; empty inherits the manager
    /// password during normalization.
    pub test_database_owner_password: SecureString,
    /// How many instances the background worker pre-creates per finalized
    /// template; capped to `test_database_max_pool_size` when that is
    /// non-zero.
    pub test_database_initial_pool_size: usize,
    /// Per-template capacity limit; `0` disables pooling entirely.
    pub test_database_max_pool_size: usize,
    /// Upper bound on waiting for a template to become ready.
    pub test_database_wait_timeout: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            manager_params: ConnectionParams {
                host: "127.0.0.1".into(),
                port: 5432,
                username: "postgres".into(),
                password: SecureString::default(),
                database: "postgres".into(),
            },
            database_prefix: "testpool".into(),
            template_database_prefix: "template".into(),
            test_database_prefix: "test".into(),
            template_database_template: "template0".into(),
            test_database_owner: String::new(),
            test_database_owner_password: SecureString::default(),
            test_database_initial_pool_size: 10,
            test_database_max_pool_size: 500,
            test_database_wait_timeout: Duration::from_millis(2000),
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse::<T>().ok())
        .unwrap_or(default)
}

impl ManagerConfig {
    /// Load configuration from `TESTPOOL_*` environment variables, falling
    /// back to the defaults, and normalize it.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            manager_params: ConnectionParams {
                host: env_string("TESTPOOL_PGHOST", &defaults.manager_params.host),
                port: env_parse("TESTPOOL_PGPORT", defaults.manager_params.port),
                username: env_string("TESTPOOL_PGUSER", &defaults.manager_params.username),
                password: SecureString::new(env_string("TESTPOOL_PGPASSWORD", "")),
                database: env_string("TESTPOOL_PGDATABASE", &defaults.manager_params.database),
            },
            database_prefix: env_string("TESTPOOL_DB_PREFIX", &defaults.database_prefix),
            template_database_prefix: env_string(
                "TESTPOOL_TEMPLATE_PREFIX",
                &defaults.template_database_prefix,
            ),
            test_database_prefix: env_string(
                "TESTPOOL_TEST_PREFIX",
                &defaults.test_database_prefix,
            ),
            template_database_template: env_string(
                "TESTPOOL_TEMPLATE_TEMPLATE",
                &defaults.template_database_template,
            ),
            test_database_owner: env_string("TESTPOOL_TEST_OWNER", ""),
            test_database_owner_password: SecureString::new(env_string(
                "TESTPOOL_TEST_OWNER_PASSWORD",
                "",
            )),
            test_database_initial_pool_size: env_parse(
                "TESTPOOL_INITIAL_POOL_SIZE",
                defaults.test_database_initial_pool_size,
            ),
            test_database_max_pool_size: env_parse(
                "TESTPOOL_MAX_POOL_SIZE",
                defaults.test_database_max_pool_size,
            ),
            test_database_wait_timeout: Duration::from_millis(env_parse(
                "TESTPOOL_WAIT_TIMEOUT_MS",
                defaults.test_database_wait_timeout.as_millis() as u64,
            )),
        }
        .normalized()
    }

    /// Apply construction-time defaulting: empty test-owner credentials
    /// inherit the manager credentials, and the initial pool size is capped
    /// to the maximum when a maximum is configured.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.test_database_owner.is_empty() {
            self.test_database_owner = self.manager_params.username.clone();
        }
        if self.test_database_owner_password.is_empty() {
            self.test_database_owner_password = self.manager_params.password.clone();
        }
        if self.test_database_max_pool_size > 0
            && self.test_database_initial_pool_size > self.test_database_max_pool_size
        {
            self.test_database_initial_pool_size = self.test_database_max_pool_size;
        }
        self
    }

    /// Validate prefixes and timing, returning an error if unusable.
    pub fn validate(&self) -> Result<()> {
        for value in [
            &self.database_prefix,
            &self.template_database_prefix,
            &self.test_database_prefix,
            &self.template_database_template,
        ] {
            if !naming::is_safe_identifier(value) {
                return Err(Error::InvalidIdentifier {
                    value: value.clone(),
                });
            }
        }
        if self.test_database_wait_timeout.is_zero() {
            return Err(Error::configuration(
                "test_database_wait_timeout must be greater than zero",
            ));
        }
        Ok(())
    }

    /// The catalog listing prefix for template databases.
    pub fn managed_template_prefix(&self) -> String {
        naming::managed_template_prefix(&self.database_prefix, &self.template_database_prefix)
    }

    /// The catalog listing prefix for test databases.
    pub fn managed_test_prefix(&self) -> String {
        naming::managed_test_prefix(&self.database_prefix, &self.test_database_prefix)
    }

    /// The template database name for `hash`.
    pub fn template_database_name(&self, hash: &str) -> String {
        naming::template_database_name(&self.database_prefix, &self.template_database_prefix, hash)
    }

    /// The test database name prefix for `hash` (ordinal appended by the
    /// pool).
    pub fn test_database_prefix_for(&self, hash: &str) -> String {
        naming::test_database_prefix(&self.database_prefix, &self.test_database_prefix, hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_validates() {
        assert!(ManagerConfig::default().normalized().validate().is_ok());
    }

    #[test]
    fn normalization_inherits_manager_credentials() {
        let mut config = ManagerConfig::default();
        config.manager_params.username = "admin".into();
        config.manager_params.password = SecureString::new("adminpw");
        let config = config.normalized();
        assert_eq!(config.test_database_owner, "admin");
        assert_eq!(config.test_database_owner_password.expose(), "adminpw");
    }

    #[test]
    fn normalization_keeps_explicit_owner() {
        let mut config = ManagerConfig::default();
        config.test_database_owner = "tester".into();
        config.test_database_owner_password = SecureString::new("pw");
        let config = config.normalized();
        assert_eq!(config.test_database_owner, "tester");
        assert_eq!(config.test_database_owner_password.expose(), "pw");
    }

    #[test]
    fn normalization_caps_initial_pool_size() {
        let mut config = ManagerConfig::default();
        config.test_database_initial_pool_size = 100;
        config.test_database_max_pool_size = 4;
        assert_eq!(config.normalized().test_database_initial_pool_size, 4);
    }

    #[test]
    fn zero_max_does_not_cap_initial_size() {
        let mut config = ManagerConfig::default();
        config.test_database_initial_pool_size = 100;
        config.test_database_max_pool_size = 0;
        assert_eq!(config.normalized().test_database_initial_pool_size, 100);
    }

    #[test]
    fn validate_rejects_unsafe_prefix() {
        let mut config = ManagerConfig::default().normalized();
        config.database_prefix = "bad-prefix".into();
        assert!(matches!(
            config.validate(),
            Err(Error::InvalidIdentifier { .. })
        ));
    }

    #[test]
    fn derived_names() {
        let config = ManagerConfig::default().normalized();
        assert_eq!(config.template_database_name("abc"), "testpool_template_abc");
        assert_eq!(config.managed_template_prefix(), "testpool_template_");
        assert_eq!(config.test_database_prefix_for("abc"), "testpool_test_abc_");
    }
}
