//! Connection pool behaviour against the in-memory connector

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use xengate_proto::ServerProfile;
use xengate_transport::mock::MockConnector;
use xengate_tunnel::{BackoffConfig, ConnectionPool, PoolError, PoolSettings, TunnelSettings};

fn settings(monitor_interval: Duration) -> PoolSettings {
    let backoff = BackoffConfig {
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        multiplier: 1.5,
    };
    PoolSettings {
        monitor_interval,
        connect_backoff: backoff.clone(),
        tunnel: TunnelSettings {
            keepalive_interval: Duration::from_secs(3600),
            health_interval: Duration::from_secs(3600),
            reconnect_backoff: backoff,
            ..TunnelSettings::default()
        },
    }
}

fn profile(connections: usize, max_retries: usize) -> ServerProfile {
    let mut profile = ServerProfile::new("eu", "198.51.100.20", 22, "root", "secret");
    profile.connections = connections;
    profile.max_retries = max_retries;
    profile
}

fn pool(
    connector: &Arc<MockConnector>,
    profile: ServerProfile,
    settings: PoolSettings,
) -> Arc<ConnectionPool> {
    Arc::new(ConnectionPool::new(
        profile,
        connector.clone(),
        settings,
        &CancellationToken::new(),
    ))
}

#[tokio::test]
async fn test_round_robin_visits_every_connected_tunnel() {
    let connector = Arc::new(MockConnector::new());
    let pool = pool(&connector, profile(3, 3), settings(Duration::from_secs(3600)));
    pool.start().await.unwrap();

    let mut picked = Vec::new();
    for _ in 0..3 {
        picked.push(pool.get_tunnel().await.unwrap().id().to_string());
    }
    assert_eq!(picked, vec!["eu-1", "eu-2", "eu-3"]);

    // The rotation continues where it left off
    assert_eq!(pool.get_tunnel().await.unwrap().id(), "eu-1");

    pool.stop().await;
}

#[tokio::test]
async fn test_round_robin_skips_disconnected_tunnels() {
    let connector = Arc::new(MockConnector::new());
    let pool = pool(&connector, profile(3, 3), settings(Duration::from_secs(3600)));
    pool.start().await.unwrap();

    for session in connector.sessions() {
        if session.tunnel_id() == "eu-2" {
            session.kill();
        }
    }

    let mut seen = HashSet::new();
    for _ in 0..6 {
        let tunnel = pool.get_tunnel().await.unwrap();
        assert!(tunnel.is_connected());
        seen.insert(tunnel.id().to_string());
    }
    assert_eq!(
        seen,
        HashSet::from(["eu-1".to_string(), "eu-3".to_string()])
    );

    pool.stop().await;
}

#[tokio::test]
async fn test_no_connected_tunnel_returns_none() {
    let connector = Arc::new(MockConnector::new());
    let pool = pool(&connector, profile(2, 1), settings(Duration::from_secs(3600)));
    pool.start().await.unwrap();

    for session in connector.sessions() {
        session.kill();
    }

    assert!(pool.get_tunnel().await.is_none());
    assert!(!pool.has_connected_tunnel().await);

    let target = "example.com:80".parse().unwrap();
    let result = pool.open_channel(&target).await;
    assert!(matches!(result, Err(PoolError::NoTunnels(_))));

    pool.stop().await;
}

#[tokio::test]
async fn test_start_retries_failed_attempts() {
    let connector = Arc::new(MockConnector::failing_first(2));
    let pool = pool(&connector, profile(3, 3), settings(Duration::from_secs(3600)));

    pool.start().await.unwrap();

    let stats = pool.stats().await;
    assert_eq!(stats.total_tunnels, 3);
    assert_eq!(stats.connected_tunnels, 3);
    for id in ["eu-1", "eu-2", "eu-3"] {
        assert_eq!(connector.attempts(id), 3, "attempts for {}", id);
    }

    pool.stop().await;
}

#[tokio::test]
async fn test_start_fails_when_any_tunnel_exhausts_retries() {
    let connector = Arc::new(MockConnector::new());
    connector.set_unreachable(true);
    let pool = pool(&connector, profile(2, 2), settings(Duration::from_secs(3600)));

    let result = pool.start().await;
    match result {
        Err(PoolError::StartFailed { failed, total, .. }) => {
            assert_eq!(failed, 2);
            assert_eq!(total, 2);
        }
        other => panic!("unexpected start result: {:?}", other),
    }
    assert_eq!(connector.attempts("eu-1"), 2);
    assert!(!pool.has_connected_tunnel().await);
}

#[tokio::test]
async fn test_monitor_restores_dropped_tunnel() {
    let connector = Arc::new(MockConnector::new());
    let pool = pool(&connector, profile(2, 3), settings(Duration::from_millis(30)));
    pool.start().await.unwrap();

    connector.sessions()[0].kill();
    assert_eq!(pool.stats().await.connected_tunnels, 1);

    let mut restored = false;
    for _ in 0..200 {
        if pool.stats().await.connected_tunnels == 2 {
            restored = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(restored, "monitor did not restore the tunnel");
    assert_eq!(connector.sessions().len(), 3);

    pool.stop().await;
}

#[tokio::test]
async fn test_forward_through_pool_updates_stats() {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let connector = Arc::new(MockConnector::new());
    let pool = pool(&connector, profile(1, 1), settings(Duration::from_secs(3600)));
    pool.start().await.unwrap();

    let (local, mut client) = tokio::io::duplex(1024);
    let target = "db.internal:5432".parse().unwrap();
    let forward = {
        let pool = Arc::clone(&pool);
        tokio::spawn(async move { pool.forward(local, &target).await })
    };

    client.write_all(b"ping").await.unwrap();
    client.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    client.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"ping");

    let summary = forward.await.unwrap().unwrap();
    assert_eq!(summary.tunnel_id, "eu-1");

    let stats = pool.stats().await;
    assert_eq!(stats.total_requests, 1);
    assert_eq!(stats.total_bytes, 8);
    assert_eq!(stats.active_connections, 0);

    pool.stop().await;
}
