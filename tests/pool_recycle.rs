//! Recycling: returned instances are dirty, recreated exactly once before
//! the next handout, and served in FIFO order.

use std::sync::Arc;
use std::time::Duration;

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

async fn ready_template(manager: &Manager<InMemoryConnector>, hash: &str) {
    manager.connect(&token()).await.unwrap();
    manager.initialize_template(hash, &token()).await.unwrap();
    manager.finalize_template(hash, &token()).await.unwrap();
}

// ---------------------------------------------------------------------------
// Dirty recycle (scenario: get, return, get)
// ---------------------------------------------------------------------------

#[tokio::test]
async fn returned_instance_is_recreated_before_next_handout() {
    let (manager, gateway) = manager_with(0, 4);
    ready_template(&manager, "abc").await;

    let first = manager.get_test_database("abc", &token()).await.unwrap();
    assert_eq!(gateway.create_count("testpool_test_abc_0000"), 1);
    assert_eq!(gateway.drop_count("testpool_test_abc_0000"), 1);

    manager
        .return_test_database("abc", first.id, &token())
        .await
        .unwrap();
    // Returning alone does no physical work; recycling is deferred to
    // handout time.
    assert_eq!(gateway.create_count("testpool_test_abc_0000"), 1);

    let second = manager.get_test_database("abc", &token()).await.unwrap();
    assert_eq!(second.id, first.id);
    // Exactly one drop-and-create happened between the two handouts.
    assert_eq!(gateway.create_count("testpool_test_abc_0000"), 2);
    assert_eq!(gateway.drop_count("testpool_test_abc_0000"), 2);
}

#[tokio::test]
async fn recycle_clones_from_the_template_database() {
    let (manager, gateway) = manager_with(0, 4);
    ready_template(&manager, "abc").await;

    let db = manager.get_test_database("abc", &token()).await.unwrap();
    manager
        .return_test_database("abc", db.id, &token())
        .await
        .unwrap();
    manager.get_test_database("abc", &token()).await.unwrap();

    let recreate = gateway
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            testdb_pool::testing::GatewayCall::Create { name, template, .. }
                if name == "testpool_test_abc_0000" =>
            {
                Some(template)
            }
            _ => None,
        })
        .last()
        .unwrap();
    assert_eq!(recreate, "testpool_template_abc");
}

// ---------------------------------------------------------------------------
// FIFO ordering of returns
// ---------------------------------------------------------------------------

#[tokio::test]
async fn returns_are_served_in_fifo_order() {
    let (manager, _) = manager_with(0, 4);
    ready_template(&manager, "abc").await;

    let a = manager.get_test_database("abc", &token()).await.unwrap();
    let b = manager.get_test_database("abc", &token()).await.unwrap();
    let c = manager.get_test_database("abc", &token()).await.unwrap();

    // Return out of creation order: b, c, a.
    for db in [&b, &c, &a] {
        manager
            .return_test_database("abc", db.id, &token())
            .await
            .unwrap();
    }

    let first = manager.get_test_database("abc", &token()).await.unwrap();
    let second = manager.get_test_database("abc", &token()).await.unwrap();
    let third = manager.get_test_database("abc", &token()).await.unwrap();
    assert_eq!(first.id, b.id);
    assert_eq!(second.id, c.id);
    assert_eq!(third.id, a.id);
}

// ---------------------------------------------------------------------------
// Return validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn returning_an_unknown_id_fails() {
    let (manager, _) = manager_with(0, 4);
    ready_template(&manager, "abc").await;

    let err = manager
        .return_test_database("abc", 7, &token())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownTestDatabase { id: 7, .. }));
}

#[tokio::test]
async fn returning_twice_fails() {
    let (manager, _) = manager_with(0, 4);
    ready_template(&manager, "abc").await;

    let db = manager.get_test_database("abc", &token()).await.unwrap();
    manager
        .return_test_database("abc", db.id, &token())
        .await
        .unwrap();
    let err = manager
        .return_test_database("abc", db.id, &token())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::UnknownTestDatabase { .. }));
}

#[tokio::test]
async fn returning_to_an_unknown_template_fails() {
    let (manager, _) = manager_with(0, 4);
    manager.connect(&token()).await.unwrap();

    let err = manager
        .return_test_database("abc", 0, &token())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::TemplateNotFound { .. }));
}

// ---------------------------------------------------------------------------
// Failed recreation leaves the instance reclaimable
// ---------------------------------------------------------------------------

#[tokio::test]
async fn failed_recreation_surfaces_and_instance_stays_tracked() {
    let (manager, gateway) = manager_with(0, 4);
    ready_template(&manager, "abc").await;

    let db = manager.get_test_database("abc", &token()).await.unwrap();
    manager
        .return_test_database("abc", db.id, &token())
        .await
        .unwrap();

    gateway.fail_next_creates(1);
    let err = manager.get_test_database("abc", &token()).await.unwrap_err();
    assert!(matches!(err, Error::Gateway { .. }));

    // A sweep still reclaims the instance.
    tokio::time::sleep(Duration::from_millis(10)).await;
    gateway.clear_calls();
    manager
        .clear_tracked_test_databases("abc", &token())
        .await
        .unwrap();
    assert_eq!(gateway.drop_count("testpool_test_abc_0000"), 1);
}
