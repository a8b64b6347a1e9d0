//! Interface monitoring integration tests
//!
//! Changing interface state needs CAP_NET_ADMIN and the `ip` tool.
//! Run with: sudo -E NETMON_TEST_ENABLED=1 cargo test --test integration_test

use netmon::{LinkEvent, LinkEventMonitor};
use std::env;
use std::process::Command;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::timeout;

/// Check if integration tests are enabled
fn integration_tests_enabled() -> bool {
    env::var("NETMON_TEST_ENABLED").is_ok()
}

#[tokio::test(flavor = "multi_thread")]
async fn test_address_add_and_remove_reported() {
    if !integration_tests_enabled() {
        println!("Skipping integration test (set NETMON_TEST_ENABLED=1 to run)");
        return;
    }

    let monitor = match LinkEventMonitor::new() {
        Ok(m) => m,
        Err(e) => {
            eprintln!("Failed to create monitoring socket: {}", e);
            return;
        }
    };

    let (tx, mut rx) = mpsc::channel(16);
    let _handle = monitor.spawn(tx).unwrap();

    let status = Command::new("ip")
        .args(["addr", "add", "127.0.9.9/32", "dev", "lo"])
        .status()
        .unwrap();
    assert!(status.success(), "ip addr add failed (need CAP_NET_ADMIN)");

    let added = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(added, Some(LinkEvent::address(false)));

    let status = Command::new("ip")
        .args(["addr", "del", "127.0.9.9/32", "dev", "lo"])
        .status()
        .unwrap();
    assert!(status.success());

    let removed = timeout(Duration::from_secs(2), rx.recv()).await.unwrap();
    assert_eq!(removed, Some(LinkEvent::address(true)));
}

#[test]
fn test_local_interface_queries() {
    let addrs = netmon::local_ipv4_addresses().unwrap();
    assert!(addrs.iter().all(|a| !a.is_loopback()));

    // monitoring disabled
    assert!(netmon::any_interface_up(&[]).unwrap());
}
