//! Manager registry and forward dispatch against the in-memory connector

use chrono::{Duration as ChronoDuration, Utc};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use xengate_access::{AccessControl, IpBlocklist, NewRule};
use xengate_proto::{
    AppConfig, ConfigError, ConfigStore, MemoryConfigStore, ServerProfile, TargetAddr,
};
use xengate_transport::mock::MockConnector;
use xengate_tunnel::{
    BackoffConfig, Manager, ManagerError, ManagerSettings, PoolSettings, TunnelSettings,
};

fn settings(forward_timeout: Duration) -> ManagerSettings {
    let backoff = BackoffConfig {
        initial_backoff: Duration::from_millis(1),
        max_backoff: Duration::from_millis(5),
        multiplier: 1.5,
    };
    ManagerSettings {
        forward_timeout,
        pool: PoolSettings {
            monitor_interval: Duration::from_secs(3600),
            connect_backoff: backoff.clone(),
            tunnel: TunnelSettings {
                keepalive_interval: Duration::from_secs(3600),
                health_interval: Duration::from_secs(3600),
                reconnect_backoff: backoff,
                ..TunnelSettings::default()
            },
        },
    }
}

fn manager(connector: &Arc<MockConnector>) -> Arc<Manager> {
    Arc::new(
        Manager::new(connector.clone(), Arc::new(AccessControl::new()))
            .with_settings(settings(Duration::from_secs(5))),
    )
}

fn profile(name: &str, connections: usize) -> ServerProfile {
    let mut profile = ServerProfile::new(name, "198.51.100.20", 22, "root", "secret");
    profile.connections = connections;
    profile
}

fn client(ip: &str) -> SocketAddr {
    SocketAddr::new(ip.parse().unwrap(), 50000)
}

fn target() -> TargetAddr {
    "example.com:443".parse().unwrap()
}

async fn wait_for<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    false
}

#[tokio::test]
async fn test_forward_echoes_through_pool() {
    let connector = Arc::new(MockConnector::new());
    let manager = manager(&connector);
    manager
        .start(profile("eu", 2), CancellationToken::new())
        .await
        .unwrap();

    let (local, mut remote_end) = tokio::io::duplex(1024);
    let forward = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.forward(local, client("203.0.113.7"), &target()).await })
    };

    remote_end.write_all(b"hello tunnel").await.unwrap();
    remote_end.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    remote_end.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"hello tunnel");

    let summary = forward.await.unwrap().unwrap();
    assert!(summary.tunnel_id.starts_with("eu-"));
    assert_eq!(summary.bytes_up, 12);
    assert_eq!(summary.bytes_down, 12);

    let targets: Vec<String> = connector
        .sessions()
        .iter()
        .flat_map(|session| session.targets())
        .collect();
    assert_eq!(targets, vec!["example.com:443".to_string()]);

    manager.stop_all().await;
}

#[tokio::test]
async fn test_forward_without_pools() {
    let connector = Arc::new(MockConnector::new());
    let manager = manager(&connector);

    let (local, _remote_end) = tokio::io::duplex(64);
    let result = manager.forward(local, client("203.0.113.7"), &target()).await;
    assert!(matches!(result, Err(ManagerError::NoPools)));
}

#[tokio::test]
async fn test_forward_without_connected_tunnels() {
    let connector = Arc::new(MockConnector::new());
    let manager = manager(&connector);
    manager
        .start(profile("eu", 2), CancellationToken::new())
        .await
        .unwrap();

    for session in connector.sessions() {
        session.kill();
    }

    let (local, _remote_end) = tokio::io::duplex(64);
    let result = manager.forward(local, client("203.0.113.7"), &target()).await;
    assert!(matches!(result, Err(ManagerError::NoTunnels)));

    manager.stop_all().await;
}

#[tokio::test]
async fn test_blocked_ip_is_rejected_and_connection_dropped() {
    let connector = Arc::new(MockConnector::new());
    let manager = manager(&connector);
    manager
        .start(profile("eu", 1), CancellationToken::new())
        .await
        .unwrap();

    let ip: IpAddr = "203.0.113.66".parse().unwrap();
    assert!(manager.block_ip(ip).await.unwrap());
    assert!(!manager.block_ip(ip).await.unwrap());

    let (local, mut remote_end) = tokio::io::duplex(64);
    let result = manager.forward(local, client("203.0.113.66"), &target()).await;
    assert!(matches!(result, Err(ManagerError::Blocked(blocked)) if blocked == ip));

    let mut buf = [0u8; 8];
    assert_eq!(remote_end.read(&mut buf).await.unwrap(), 0);
    assert_eq!(connector.sessions()[0].streams_opened(), 0);

    manager.stop_all().await;
}

#[tokio::test]
async fn test_master_ip_bypasses_blocklist() {
    let connector = Arc::new(MockConnector::new());
    let access = Arc::new(AccessControl::new());
    let ip: IpAddr = "192.0.2.10".parse().unwrap();
    access
        .add_rule(NewRule {
            title: "office".to_string(),
            ip,
            is_master: true,
            daily_limit: Duration::from_secs(60),
            description: String::new(),
        })
        .await
        .unwrap();

    let manager = Arc::new(
        Manager::new(connector.clone(), access)
            .with_settings(settings(Duration::from_secs(5)))
            .with_blocklist(IpBlocklist::new()),
    );
    manager.block_ip(ip).await.unwrap();
    manager
        .start(profile("eu", 1), CancellationToken::new())
        .await
        .unwrap();

    let (local, remote_end) = tokio::io::duplex(64);
    drop(remote_end);
    let result = manager.forward(local, client("192.0.2.10"), &target()).await;
    assert!(result.is_ok(), "master forward failed: {:?}", result.err());

    manager.stop_all().await;
}

#[tokio::test]
async fn test_exhausted_quota_is_denied() {
    let connector = Arc::new(MockConnector::new());
    let access = Arc::new(AccessControl::new());
    let ip: IpAddr = "203.0.113.9".parse().unwrap();
    access
        .add_rule(NewRule {
            title: "guest".to_string(),
            ip,
            is_master: false,
            daily_limit: Duration::from_secs(60),
            description: String::new(),
        })
        .await
        .unwrap();

    let now = Utc::now();
    assert!(access.start_session_at(ip, now - ChronoDuration::minutes(2)).await);
    access.end_session_at(ip, now).await;

    let manager = Arc::new(
        Manager::new(connector.clone(), Arc::clone(&access))
            .with_settings(settings(Duration::from_secs(5))),
    );
    manager
        .start(profile("eu", 1), CancellationToken::new())
        .await
        .unwrap();

    let (local, _remote_end) = tokio::io::duplex(64);
    let result = manager.forward(local, client("203.0.113.9"), &target()).await;
    assert!(matches!(result, Err(ManagerError::AccessDenied(denied)) if denied == ip));

    manager.stop_all().await;
}

#[tokio::test]
async fn test_session_closed_after_forward() {
    let connector = Arc::new(MockConnector::new());
    let access = Arc::new(AccessControl::new());
    let ip: IpAddr = "203.0.113.9".parse().unwrap();
    let rule = access
        .add_rule(NewRule {
            title: "guest".to_string(),
            ip,
            is_master: false,
            daily_limit: Duration::from_secs(3600),
            description: String::new(),
        })
        .await
        .unwrap();

    let manager = Arc::new(
        Manager::new(connector.clone(), Arc::clone(&access))
            .with_settings(settings(Duration::from_secs(5))),
    );
    manager
        .start(profile("eu", 1), CancellationToken::new())
        .await
        .unwrap();

    let (local, remote_end) = tokio::io::duplex(64);
    drop(remote_end);
    manager
        .forward(local, client("203.0.113.9"), &target())
        .await
        .unwrap();

    let (_, status) = access.get_rule(&rule.id).await.unwrap();
    assert_eq!(status.active_sessions, 0);
    assert!(status.active_since.is_none());
    assert!(status.last_access.is_some());
    assert!(!status.blocked);

    manager.stop_all().await;
}

#[tokio::test]
async fn test_forward_prefers_least_loaded_pool() {
    let connector = Arc::new(MockConnector::new());
    let manager = manager(&connector);
    manager
        .start(profile("alpha", 1), CancellationToken::new())
        .await
        .unwrap();
    manager
        .start(profile("beta", 1), CancellationToken::new())
        .await
        .unwrap();

    // Two forwards in flight on alpha
    let alpha = manager.get_pool("alpha").await.unwrap();
    let _busy_one = alpha.open_channel(&target()).await.unwrap();
    let _busy_two = alpha.open_channel(&target()).await.unwrap();

    let (local, remote_end) = tokio::io::duplex(64);
    drop(remote_end);
    let summary = manager
        .forward(local, client("203.0.113.7"), &target())
        .await
        .unwrap();
    assert_eq!(summary.tunnel_id, "beta-1");

    manager.stop_all().await;
}

#[tokio::test]
async fn test_forward_times_out_opening_stream() {
    let connector = Arc::new(MockConnector::new());
    connector.set_open_delay(Duration::from_secs(2));
    let manager = Arc::new(
        Manager::new(connector.clone(), Arc::new(AccessControl::new()))
            .with_settings(settings(Duration::from_millis(50))),
    );
    manager
        .start(profile("eu", 1), CancellationToken::new())
        .await
        .unwrap();

    let (local, _remote_end) = tokio::io::duplex(64);
    let result = manager.forward(local, client("203.0.113.7"), &target()).await;
    match result {
        Err(ManagerError::Timeout { target, timeout }) => {
            assert_eq!(target, "example.com:443");
            assert_eq!(timeout, Duration::from_millis(50));
        }
        other => panic!("unexpected forward result: {:?}", other),
    }

    manager.stop_all().await;
}

#[tokio::test]
async fn test_duplicate_start_is_rejected() {
    let connector = Arc::new(MockConnector::new());
    let manager = manager(&connector);
    manager
        .start(profile("eu", 1), CancellationToken::new())
        .await
        .unwrap();

    let result = manager.start(profile("eu", 1), CancellationToken::new()).await;
    assert!(matches!(result, Err(ManagerError::PoolExists(name)) if name == "eu"));
    assert_eq!(manager.pool_names().await, vec!["eu".to_string()]);

    manager.stop_all().await;
}

#[tokio::test]
async fn test_failed_start_leaves_no_pool() {
    let connector = Arc::new(MockConnector::new());
    connector.set_unreachable(true);
    let manager = manager(&connector);

    let mut failing = profile("eu", 2);
    failing.max_retries = 1;
    let result = manager.start(failing, CancellationToken::new()).await;
    assert!(matches!(result, Err(ManagerError::Pool(_))));
    assert!(!manager.has_pool("eu").await);
}

#[tokio::test]
async fn test_stop_removes_pool_and_closes_sessions() {
    let connector = Arc::new(MockConnector::new());
    let manager = manager(&connector);
    manager
        .start(profile("eu", 2), CancellationToken::new())
        .await
        .unwrap();

    manager.stop("eu").await.unwrap();
    assert!(!manager.has_pool("eu").await);
    assert!(matches!(
        manager.stop("eu").await,
        Err(ManagerError::PoolNotFound(_))
    ));

    let sessions = connector.sessions();
    assert!(
        wait_for(|| {
            let sessions = sessions.clone();
            async move {
                use xengate_transport::Session;
                sessions.iter().all(|s| s.is_closed())
            }
        })
        .await
    );
}

#[tokio::test]
async fn test_cancelled_scope_removes_pool() {
    let connector = Arc::new(MockConnector::new());
    let manager = manager(&connector);
    let scope = CancellationToken::new();
    manager.start(profile("eu", 1), scope.clone()).await.unwrap();
    assert!(manager.has_pool("eu").await);

    scope.cancel();
    let removed = wait_for(|| {
        let manager = Arc::clone(&manager);
        async move { !manager.has_pool("eu").await }
    })
    .await;
    assert!(removed);

    // The name is free again
    manager
        .start(profile("eu", 1), CancellationToken::new())
        .await
        .unwrap();
    manager.stop_all().await;
}

#[tokio::test]
async fn test_blocklist_changes_are_persisted() {
    let connector = Arc::new(MockConnector::new());
    let store = Arc::new(MemoryConfigStore::default());
    let manager = Manager::new(connector, Arc::new(AccessControl::new())).with_store(store.clone());

    let ip: IpAddr = "198.51.100.99".parse().unwrap();
    manager.block_ip(ip).await.unwrap();
    let saved = store.load().unwrap();
    assert_eq!(saved.blocked_list.len(), 1);
    assert_eq!(saved.blocked_list[0].ip, ip);
    assert!(manager.is_ip_blocked(ip).await);

    assert!(manager.unblock_ip(ip).await.unwrap());
    assert!(store.load().unwrap().blocked_list.is_empty());
    assert!(!manager.unblock_ip(ip).await.unwrap());
}

#[tokio::test]
async fn test_cancelled_forward_still_ends_session() {
    let connector = Arc::new(MockConnector::new());
    let access = Arc::new(AccessControl::new());
    let ip: IpAddr = "203.0.113.9".parse().unwrap();
    let rule = access
        .add_rule(NewRule {
            title: "guest".to_string(),
            ip,
            is_master: false,
            daily_limit: Duration::from_secs(3600),
            description: String::new(),
        })
        .await
        .unwrap();

    let manager = Arc::new(
        Manager::new(connector.clone(), Arc::clone(&access))
            .with_settings(settings(Duration::from_secs(5))),
    );
    manager
        .start(profile("eu", 1), CancellationToken::new())
        .await
        .unwrap();

    // The client end stays open, so the relay never finishes on its own
    let (local, _remote_end) = tokio::io::duplex(64);
    let forward = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.forward(local, client("203.0.113.9"), &target()).await })
    };
    assert!(
        wait_for(|| {
            let access = Arc::clone(&access);
            let id = rule.id.clone();
            async move { access.get_rule(&id).await.unwrap().1.active_sessions == 1 }
        })
        .await
    );

    forward.abort();
    assert!(forward.await.unwrap_err().is_cancelled());
    assert!(
        wait_for(|| {
            let access = Arc::clone(&access);
            let id = rule.id.clone();
            async move {
                let (_, status) = access.get_rule(&id).await.unwrap();
                status.active_sessions == 0 && status.active_since.is_none()
            }
        })
        .await,
        "aborted forward left its session open"
    );

    // The quota is enforced again for the next sessions
    let now = Utc::now();
    assert!(access.start_session_at(ip, now - ChronoDuration::hours(2)).await);
    access.end_session_at(ip, now).await;
    assert!(access.get_rule(&rule.id).await.unwrap().1.blocked);

    manager.stop_all().await;
}

#[tokio::test]
async fn test_concurrent_start_registers_one_pool() {
    let connector = Arc::new(MockConnector::new());
    connector.set_connect_delay(Duration::from_millis(50));
    let manager = manager(&connector);

    let (first, second) = tokio::join!(
        manager.start(profile("eu", 1), CancellationToken::new()),
        manager.start(profile("eu", 1), CancellationToken::new()),
    );
    let results = [first, second];

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(results.iter().any(|r| matches!(
        r,
        Err(ManagerError::PoolExists(_)) | Err(ManagerError::CreatedConcurrently(_))
    )));
    assert_eq!(manager.pool_names().await, vec!["eu".to_string()]);

    // The losing pool's tunnel was torn down
    let sessions = connector.sessions();
    assert!(
        wait_for(|| {
            let sessions = sessions.clone();
            async move {
                use xengate_transport::Session;
                sessions.iter().filter(|s| s.is_closed()).count() == sessions.len() - 1
            }
        })
        .await
    );

    manager.stop_all().await;
}

/// Memory store whose updates take a while, to widen overlap windows
#[derive(Default)]
struct SlowStore {
    inner: MemoryConfigStore,
}

impl ConfigStore for SlowStore {
    fn load(&self) -> Result<AppConfig, ConfigError> {
        std::thread::sleep(Duration::from_millis(100));
        self.inner.load()
    }

    fn save(&self, config: &AppConfig) -> Result<(), ConfigError> {
        self.inner.save(config)
    }

    fn update(&self, change: &mut dyn FnMut(&mut AppConfig)) -> Result<(), ConfigError> {
        self.inner.update(&mut |config| {
            std::thread::sleep(Duration::from_millis(100));
            change(config)
        })
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_rule_and_block_writes_are_both_saved() {
    let store = Arc::new(SlowStore::default());
    let access = Arc::new(AccessControl::with_store(store.clone()).unwrap());
    let manager = Arc::new(
        Manager::new(Arc::new(MockConnector::new()), Arc::clone(&access))
            .with_store(store.clone()),
    );

    let add_rule = {
        let access = Arc::clone(&access);
        tokio::spawn(async move {
            access
                .add_rule(NewRule {
                    title: "office".to_string(),
                    ip: "192.0.2.10".parse().unwrap(),
                    is_master: false,
                    daily_limit: Duration::from_secs(3600),
                    description: String::new(),
                })
                .await
        })
    };
    let block = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.block_ip("198.51.100.7".parse().unwrap()).await })
    };
    let more_blocks = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.block_ip("198.51.100.8".parse().unwrap()).await })
    };

    add_rule.await.unwrap().unwrap();
    assert!(block.await.unwrap().unwrap());
    assert!(more_blocks.await.unwrap().unwrap());

    let saved = store.load().unwrap();
    assert_eq!(saved.rules.len(), 1);
    assert_eq!(saved.blocked_list.len(), 2);
}

#[tokio::test]
async fn test_stats_serialize_for_reporting() {
    let connector = Arc::new(MockConnector::new());
    let manager = manager(&connector);
    manager
        .start(profile("eu", 2), CancellationToken::new())
        .await
        .unwrap();

    let json = serde_json::to_value(manager.stats().await).unwrap();
    let pool = &json[0];
    assert_eq!(pool["server_name"], "eu");
    assert_eq!(pool["total_tunnels"], 2);
    assert_eq!(pool["connected_tunnels"], 2);
    assert_eq!(pool["tunnels"][0]["state"], "connected");
    assert!(pool["tunnels"][0]["last_error"].is_null());

    manager.stop_all().await;
}
