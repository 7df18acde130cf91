//! Namespace reconciliation: the startup purge and full tracking reset.

use std::sync::Arc;

use testdb_pool::testing::{InMemoryConnector, InMemoryGateway};
use testdb_pool::{Error, Manager, ManagerConfig};
use tokio_util::sync::CancellationToken;

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

fn manager_with(
    initial: usize,
    max: usize,
) -> (Arc<Manager<InMemoryConnector>>, InMemoryGateway) {
    let connector = InMemoryConnector::new();
    let handle = connector.handle();
    let config = ManagerConfig {
        test_database_initial_pool_size: initial,
        test_database_max_pool_size: max,
        ..ManagerConfig::default()
    };
    (Arc::new(Manager::new(config, connector).unwrap()), handle)
}

fn token() -> CancellationToken {
    CancellationToken::new()
}

// ---------------------------------------------------------------------------
// Startup purge
// ---------------------------------------------------------------------------

#[tokio::test]
async fn initialize_purges_managed_databases_only() {
    let (manager, gateway) = manager_with(0, 4);
    // Stale state left behind by a previous (crashed) run, plus an
    // unrelated database that happens to share the outer prefix.
    gateway.seed("testpool_template_x");
    gateway.seed("testpool_test_x_0001");
    gateway.seed("testpool_other");

    manager.initialize(&token()).await.unwrap();

    assert!(!gateway.contains("testpool_template_x"));
    assert!(!gateway.contains("testpool_test_x_0001"));
    assert!(gateway.contains("testpool_other"));
    assert_eq!(gateway.drop_count("testpool_template_x"), 1);
    assert_eq!(gateway.drop_count("testpool_test_x_0001"), 1);
    assert_eq!(gateway.drop_count("testpool_other"), 0);
}

#[tokio::test]
async fn initialize_connects_when_needed() {
    let (manager, _) = manager_with(0, 4);
    assert!(!manager.ready());
    manager.initialize(&token()).await.unwrap();
    assert!(manager.ready());
}

#[tokio::test]
async fn initialize_on_clean_server_is_a_no_op() {
    let (manager, gateway) = manager_with(0, 4);
    manager.initialize(&token()).await.unwrap();
    assert!(gateway
        .calls()
        .iter()
        .all(|call| !matches!(call, testdb_pool::testing::GatewayCall::Drop { .. })));
}

// ---------------------------------------------------------------------------
// Clear tracked instances for one template
// ---------------------------------------------------------------------------

#[tokio::test]
async fn clear_tracked_drops_instances_but_keeps_template() {
    let (manager, gateway) = manager_with(0, 4);
    manager.connect(&token()).await.unwrap();
    manager.initialize_template("h", &token()).await.unwrap();
    manager.finalize_template("h", &token()).await.unwrap();

    let a = manager.get_test_database("h", &token()).await.unwrap();
    let b = manager.get_test_database("h", &token()).await.unwrap();
    manager
        .return_test_database("h", a.id, &token())
        .await
        .unwrap();

    gateway.clear_calls();
    manager
        .clear_tracked_test_databases("h", &token())
        .await
        .unwrap();

    // Ready and checked-out instances alike are dropped exactly once.
    assert_eq!(gateway.drop_count(a.name()), 1);
    assert_eq!(gateway.drop_count(b.name()), 1);
    assert!(gateway.contains("testpool_template_h"));

    // The template still serves; ordinals restart with the new pool.
    let fresh = manager.get_test_database("h", &token()).await.unwrap();
    assert_eq!(fresh.id, 0);
}

// ---------------------------------------------------------------------------
// Full reset
// ---------------------------------------------------------------------------

#[tokio::test]
async fn reset_drops_every_tracked_database_exactly_once() {
    let (manager, gateway) = manager_with(0, 4);
    manager.connect(&token()).await.unwrap();

    manager.initialize_template("one", &token()).await.unwrap();
    manager.finalize_template("one", &token()).await.unwrap();
    let a = manager.get_test_database("one", &token()).await.unwrap();
    let b = manager.get_test_database("one", &token()).await.unwrap();
    manager
        .return_test_database("one", a.id, &token())
        .await
        .unwrap();

    // A second template that never got finalized.
    manager.initialize_template("two", &token()).await.unwrap();

    gateway.clear_calls();
    manager.reset_all_tracking(&token()).await.unwrap();

    assert_eq!(gateway.drop_count("testpool_template_one"), 1);
    assert_eq!(gateway.drop_count("testpool_template_two"), 1);
    assert_eq!(gateway.drop_count(a.name()), 1);
    assert_eq!(gateway.drop_count(b.name()), 1);

    // Nothing managed survives on the server.
    assert!(gateway
        .database_names()
        .iter()
        .all(|name| !name.starts_with("testpool_")));

    // All tracking is gone.
    let err = manager.get_test_database("one", &token()).await.unwrap_err();
    assert!(matches!(err, Error::TemplateNotFound { .. }));
    let err = manager.get_test_database("two", &token()).await.unwrap_err();
    assert!(matches!(err, Error::TemplateNotFound { .. }));
}

#[tokio::test]
async fn reset_reports_first_drop_failure_but_sweeps_everything() {
    let (manager, gateway) = manager_with(0, 4);
    manager.connect(&token()).await.unwrap();
    manager.initialize_template("one", &token()).await.unwrap();
    manager.finalize_template("one", &token()).await.unwrap();
    let a = manager.get_test_database("one", &token()).await.unwrap();

    gateway.clear_calls();
    gateway.fail_next_drops(1);
    let err = manager.reset_all_tracking(&token()).await.unwrap_err();
    assert!(matches!(err, Error::Gateway { .. }));

    // The failed drop was the template's; the test instance was still
    // attempted afterwards.
    assert_eq!(gateway.drop_count("testpool_template_one"), 1);
    assert_eq!(gateway.drop_count(a.name()), 1);
}
