//! Registry properties driven through the in-process coordinator:
//! single-winner name races, crash cleanup via lease expiry, and
//! keepalive-sustained liveness.

use std::sync::Arc;
use std::time::Duration;

use gridmesh::{Coordinator, GridError, Kind, MemoryCoordinator, Registry, RegistrySession};
use tokio_util::sync::CancellationToken;

const TTL: Duration = Duration::from_millis(300);

fn registry(namespace: &str) -> Registry {
    let coordinator: Arc<dyn Coordinator> = Arc::new(MemoryCoordinator::new());
    Registry::new(coordinator, namespace).expect("registry")
}

async fn session(registry: &Registry, owner: &str) -> RegistrySession {
    RegistrySession::start(registry.clone(), owner, "127.0.0.1:4500", TTL, TTL / 3)
        .await
        .expect("session start")
}

#[tokio::test]
async fn racing_registrations_have_exactly_one_winner() {
    let registry = registry("race");

    let mut handles = Vec::new();
    for i in 0..8 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let session = RegistrySession::start(
                registry,
                format!("peer-{i}"),
                format!("127.0.0.1:{}", 4500 + i),
                TTL,
                TTL / 3,
            )
            .await
            .expect("session start");
            let result = session.register(Kind::Actor, "leader").await;
            // Keep the session (and its lease) alive past the assertion.
            (session, result)
        }));
    }

    let mut winners = 0;
    let mut losers = 0;
    let mut sessions = Vec::new();
    for handle in handles {
        let (session, result) = handle.await.expect("task");
        match result {
            Ok(_) => winners += 1,
            Err(GridError::AlreadyRegistered { .. }) => losers += 1,
            Err(other) => panic!("unexpected error: {other}"),
        }
        sessions.push(session);
    }
    assert_eq!(winners, 1);
    assert_eq!(losers, 7);

    let found = registry.find(Kind::Actor, "leader").await.expect("find");
    assert!(found.owner_peer.starts_with("peer-"));
}

#[tokio::test]
async fn crashed_owner_registrations_expire() {
    let registry = registry("crash");
    let session = session(&registry, "peer-a").await;
    session.register(Kind::Peer, "peer-a").await.expect("peer");
    session
        .register(Kind::Actor, "worker-1")
        .await
        .expect("actor");
    session
        .register(Kind::Mailbox, "worker-1")
        .await
        .expect("mailbox");

    // A crashed owner never refreshes its lease.
    tokio::time::sleep(TTL * 3).await;

    for (kind, name) in [
        (Kind::Peer, "peer-a"),
        (Kind::Actor, "worker-1"),
        (Kind::Mailbox, "worker-1"),
    ] {
        let result = registry.find(kind, name).await;
        assert!(
            matches!(result, Err(GridError::NotFound { .. })),
            "{kind} {name} should have expired"
        );
    }
}

#[tokio::test]
async fn keepalive_sustains_registrations() {
    let registry = registry("alive");
    let session = Arc::new(session(&registry, "peer-a").await);
    session.register(Kind::Peer, "peer-a").await.expect("peer");

    let shutdown = CancellationToken::new();
    let keepalive = {
        let session = session.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { session.keep_alive_loop(shutdown).await })
    };

    tokio::time::sleep(TTL * 3).await;
    registry
        .find(Kind::Peer, "peer-a")
        .await
        .expect("still registered");

    shutdown.cancel();
    keepalive.await.expect("join").expect("clean exit");

    session.revoke().await.expect("revoke");
    let result = registry.find(Kind::Peer, "peer-a").await;
    assert!(matches!(result, Err(GridError::NotFound { .. })));
}

#[tokio::test]
async fn released_name_is_reusable_by_another_owner() {
    let registry = registry("reuse");
    let a = session(&registry, "peer-a").await;
    let b = session(&registry, "peer-b").await;

    let handle = a.register(Kind::Mailbox, "worker-1").await.expect("a");
    assert!(matches!(
        b.register(Kind::Mailbox, "worker-1").await,
        Err(GridError::AlreadyRegistered { .. })
    ));

    a.deregister(&handle).await.expect("deregister");
    let taken = b.register(Kind::Mailbox, "worker-1").await.expect("b");
    assert_eq!(taken.name, "worker-1");
}
