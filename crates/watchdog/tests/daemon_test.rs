//! End-to-end wiring over loopback: a node heartbeating to itself.

use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use heartbeat::{HeartbeatChannel, HeartbeatTime, LifeCheckRegistry};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower::ServiceExt;
use vip::{CommandRunner, ProcessRunner, TrustedServerProbe};
use watchdog::{AppState, Config, LifeCheck, MetricsRegistry, MetricsServer, WatchdogServer};

fn free_udp_port() -> u16 {
    std::net::UdpSocket::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

fn loopback_config(port: u16) -> Config {
    let yaml = format!(
        r#"
node:
  hostname: node-a
  pgpool_port: 9999

peers:
  - hostname: node-a
    pgpool_port: 9999

heartbeat:
  bind_port: {port}
  keepalive: 50ms
  deadtime: 5s
  auth_key: secret
  destinations:
    - hostname: 127.0.0.1
      port: {port}

monitoring:
  link_events: false
"#
    );
    Config::from_yaml(&yaml).unwrap()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_self_heartbeat_reported_alive() {
    let config = loopback_config(free_udp_port());

    let registry = Arc::new(LifeCheckRegistry::from_peers(
        config.peer_nodes(),
        config.heartbeat.life_point,
    ));
    let channel = HeartbeatChannel::new(config.heartbeat_config(), Arc::clone(&registry)).unwrap();

    let cancel = CancellationToken::new();
    let _handles = channel.spawn(&cancel);

    tokio::time::timeout(Duration::from_secs(5), async {
        while !registry.snapshot(0).unwrap().send_time.is_set() {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("no heartbeat recorded");

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);
    let metrics = Arc::new(MetricsRegistry::new());
    let lifecheck = LifeCheck::new(
        Arc::clone(&registry),
        config.heartbeat.deadtime,
        config.heartbeat.lifecheck_interval,
        config.trusted_servers(),
        TrustedServerProbe::new(config.probe_config(), runner),
    )
    .with_metrics(Arc::clone(&metrics));

    let summary = lifecheck.check_peers(HeartbeatTime::now()).await;
    assert_eq!(summary.alive, 1);

    let app = MetricsServer::router(AppState {
        metrics,
        registry,
        heartbeat_stats: Arc::new(channel.stats().to_vec()),
    });

    let response = app
        .clone()
        .oneshot(Request::builder().uri("/peers").body(Body::empty()).unwrap())
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let peers: serde_json::Value = serde_json::from_slice(&body).unwrap();
    assert_eq!(peers[0]["state"], "ALIVE");

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();
    let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(body.to_vec()).unwrap();
    assert!(text.contains(r#"outcome="applied""#));
    assert!(text.contains(r#"watchdog_peer_state{peer="node-a:9999"} 2"#));

    cancel.cancel();
}

#[tokio::test]
async fn test_daemon_exits_when_heartbeat_worker_fails() {
    // hold the port without SO_REUSEADDR so the receiver cannot bind it
    let holder = std::net::UdpSocket::bind("0.0.0.0:0").unwrap();
    let port = holder.local_addr().unwrap().port();

    let server = WatchdogServer::new(loopback_config(port));
    let result = tokio::time::timeout(
        Duration::from_secs(20),
        server.run_until(std::future::pending()),
    )
    .await
    .expect("daemon kept running without a heartbeat receiver");

    let err = result.unwrap_err();
    assert!(err.to_string().contains("heartbeat worker failed"), "{err}");
    drop(holder);
}

#[test]
fn test_config_conversions() {
    let config = loopback_config(9694);
    let hb = config.heartbeat_config();

    assert_eq!(hb.hostname, "node-a");
    assert_eq!(hb.keepalive, Duration::from_millis(50));
    assert_eq!(hb.interfaces.len(), 1);
    assert_eq!(config.peer_nodes()[0].name(), "node-a:9999");
    assert!(!config.monitoring.link_events);
    assert!(!config.vip_config().has_delegate_ip());
}
