//! Controller lifecycle: startup, port reconciliation on reload, pool
//! cutover and fatal startup conditions.

mod common;

use common::query;
use postguard::config::Config;
use postguard::controller::MainController;

/// An ephemeral port that is free right now. The listener is dropped
/// before the daemon binds, so there is a small race we accept in tests.
fn free_port() -> u16 {
    std::net::TcpListener::bind("127.0.0.1:0")
        .expect("probe bind")
        .local_addr()
        .expect("probe addr")
        .port()
}

fn base_config(ports: &str) -> Config {
    let mut config = Config::new();
    config.set("main", "plugins", "static");
    config.set("main", "incomingport", ports);
    config.set("StaticResponse", "action", "reject");
    config.set("StaticResponse", "message", "go away");
    config.set("performance", "minthreads", "2");
    config.set("performance", "maxthreads", "4");
    config
}

#[tokio::test]
async fn startup_serves_configured_chain() {
    let port = free_port();
    let mut controller = MainController::new(base_config(&port.to_string()), None);
    controller.startup().await.expect("startup");

    let addr = controller.servers()[0].local_addr();
    let response = query(addr, "sender=a@b\nrecipient=c@d\n\n").await;
    assert_eq!(response, "action=reject go away\n\n");

    controller.shutdown().await;
}

#[tokio::test]
async fn reload_reconciles_ports_and_keeps_unchanged_listener() {
    let (p1, p2, p3) = (free_port(), free_port(), free_port());
    let mut controller = MainController::new(base_config(&format!("{p1} {p2}")), None);
    controller.startup().await.expect("startup");

    let mut running: Vec<u16> = controller.servers().iter().map(|s| s.port()).collect();
    running.sort_unstable();
    let mut expected = vec![p1, p2];
    expected.sort_unstable();
    assert_eq!(running, expected);
    let kept_id = controller
        .servers()
        .iter()
        .find(|s| s.port() == p2)
        .map(|s| s.id())
        .expect("listener on p2");

    controller.reload(base_config(&format!("{p2} {p3}"))).await;

    let mut running: Vec<u16> = controller.servers().iter().map(|s| s.port()).collect();
    running.sort_unstable();
    let mut expected = vec![p2, p3];
    expected.sort_unstable();
    assert_eq!(running, expected);
    // the unchanged port keeps its original listener instance
    let id_after = controller
        .servers()
        .iter()
        .find(|s| s.port() == p2)
        .map(|s| s.id())
        .expect("listener on p2 after reload");
    assert_eq!(kept_id, id_after);

    // old port refuses, both configured ports answer
    assert!(tokio::net::TcpStream::connect(("127.0.0.1", p1))
        .await
        .is_err());
    for port in [p2, p3] {
        let addr = controller
            .servers()
            .iter()
            .find(|s| s.port() == port)
            .map(|s| s.local_addr())
            .expect("server addr");
        let response = query(addr, "sender=a@b\n\n").await;
        assert_eq!(response, "action=reject go away\n\n");
    }

    controller.shutdown().await;
}

#[tokio::test]
async fn reload_replaces_thread_pool_only_when_limits_change() {
    let port = free_port();
    let mut controller = MainController::new(base_config(&port.to_string()), None);
    controller.startup().await.expect("startup");
    assert_eq!(
        controller.active_pool().thread_limits().await,
        Some((2, 4))
    );

    // unchanged limits keep the pool
    controller.reload(base_config(&port.to_string())).await;
    assert_eq!(
        controller.active_pool().thread_limits().await,
        Some((2, 4))
    );

    // changed limits build a new pool
    let mut changed = base_config(&port.to_string());
    changed.set("performance", "maxthreads", "8");
    controller.reload(changed).await;
    assert_eq!(
        controller.active_pool().thread_limits().await,
        Some((2, 8))
    );

    controller.shutdown().await;
}

#[tokio::test]
async fn startup_fails_on_invalid_backend() {
    let mut config = base_config(&free_port().to_string());
    config.set("performance", "backend", "fibers");
    let mut controller = MainController::new(config, None);
    let err = controller.startup().await.expect_err("invalid backend");
    assert!(err.to_string().contains("backend"));
}

#[tokio::test]
async fn startup_fails_when_a_plugin_does_not_load() {
    let mut config = base_config(&free_port().to_string());
    config.set("main", "plugins", "static,no.such.Plugin");
    let mut controller = MainController::new(config, None);
    assert!(controller.startup().await.is_err());
}

#[tokio::test]
async fn test_run_uses_port_specific_chain() {
    let mut config = base_config("9998 9999:static(PortChain)");
    config.set("PortChain", "action", "hold");
    let mut controller = MainController::new(config, None);

    let mut values = indexmap::IndexMap::new();
    values.insert("sender".to_string(), "a@b".to_string());

    let verdict = controller
        .test_run(values.clone(), None)
        .await
        .expect("default chain");
    assert_eq!(verdict.to_string(), "reject go away");

    let verdict = controller
        .test_run(values.clone(), Some(9999))
        .await
        .expect("port chain");
    assert_eq!(verdict.to_string(), "hold");

    let err = controller
        .test_run(values, Some(12345))
        .await
        .expect_err("unknown port");
    assert!(err.to_string().contains("port"));
}
