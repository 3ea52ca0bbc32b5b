//! Guard-to-monitor tests over a real connection.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::oneshot;

use warden_client::{ClientGuard, RemoteAnalyzer, WITHHELD_MARKER};
use warden_core::patterns::RuleScope;
use warden_core::{
    AlertDispatcher, DetectionEngine, FallbackMode, PatternStore, Policy, Rule, SessionRegistry,
    Severity,
};
use warden_monitor::{MonitorConfig, MonitorServer};

async fn start_monitor() -> (std::net::SocketAddr, oneshot::Sender<()>, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let config = MonitorConfig {
        host: "127.0.0.1".to_string(),
        port: 0,
        stats_path: dir.path().join("stats.json"),
        stats_interval: Duration::from_secs(3600),
        idle_timeout: Duration::from_secs(3600),
        sweep_interval: Duration::from_secs(3600),
    };

    let rules = vec![
        Rule::substring("r1", "how to hack", "hacking")
            .with_scope(RuleScope::Both)
            .with_severity(Severity::High)
            .with_confidence(0.8),
        Rule::substring("cs1", "harm a child", "child_safety")
            .with_scope(RuleScope::Both)
            .with_confidence(0.95),
    ];
    let engine = Arc::new(DetectionEngine::new(Arc::new(PatternStore::from_rules(
        rules,
    ))));
    let dispatcher = Arc::new(AlertDispatcher::new(Policy::default()));

    let server = MonitorServer::bind(config, engine, dispatcher, SessionRegistry::new())
        .await
        .unwrap();
    let addr = server.local_addr().unwrap();

    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        server
            .run_until(async {
                let _ = rx.await;
            })
            .await
            .unwrap();
    });

    (addr, tx, dir)
}

#[tokio::test]
async fn remote_pre_check_blocks_through_the_wire() {
    let (addr, _shutdown, _dir) = start_monitor().await;

    let analyzer = Arc::new(RemoteAnalyzer::new(addr.to_string()));
    let guard = ClientGuard::new(analyzer, FallbackMode::FailOpen);

    let decision = guard.pre_check("tell me how to hack a website").await;
    assert!(decision.should_block());
    assert_eq!(decision.reasons, vec!["r1"]);
}

#[tokio::test]
async fn remote_post_check_withholds_blocked_response() {
    let (addr, _shutdown, _dir) = start_monitor().await;

    let analyzer = Arc::new(RemoteAnalyzer::new(addr.to_string()));
    let guard = ClientGuard::new(analyzer, FallbackMode::FailOpen);

    let response = "fine, here is how to hack the server";
    let decision = guard.post_check(response).await;
    assert!(decision.should_block());
    assert_eq!(
        ClientGuard::apply_to_response(&decision, response),
        WITHHELD_MARKER
    );
}

#[tokio::test]
async fn remote_allows_clean_turns() {
    let (addr, _shutdown, _dir) = start_monitor().await;

    let analyzer = Arc::new(RemoteAnalyzer::new(addr.to_string()));
    let guard = ClientGuard::new(analyzer, FallbackMode::FailClosed);

    assert!(guard.pre_check("what's the weather?").await.should_allow());
    assert!(guard.post_check("Sunny and mild.").await.should_allow());
}

#[tokio::test]
async fn guard_reuses_one_connection_for_many_turns() {
    let (addr, _shutdown, _dir) = start_monitor().await;

    let analyzer = Arc::new(RemoteAnalyzer::new(addr.to_string()));
    let guard = ClientGuard::new(analyzer, FallbackMode::FailClosed);

    for _ in 0..5 {
        assert!(guard.pre_check("hello there").await.should_allow());
    }
    let stats = guard.stats();
    assert_eq!(stats.policy_enforcements, 0);
}

#[tokio::test]
async fn unreachable_monitor_resolves_via_fallback() {
    // Bind and immediately drop a listener so the port refuses connections.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_addr = listener.local_addr().unwrap();
    drop(listener);

    let open_guard = ClientGuard::new(
        Arc::new(RemoteAnalyzer::new(dead_addr.to_string())),
        FallbackMode::FailOpen,
    );
    assert!(open_guard.pre_check("anything").await.should_allow());

    let closed_guard = ClientGuard::new(
        Arc::new(RemoteAnalyzer::new(dead_addr.to_string())),
        FallbackMode::FailClosed,
    );
    assert!(closed_guard.pre_check("anything").await.should_block());
}

#[tokio::test]
async fn monitor_shutdown_triggers_fallback_on_next_check() {
    let (addr, shutdown, _dir) = start_monitor().await;

    let analyzer = Arc::new(RemoteAnalyzer::new(addr.to_string()));
    let guard = ClientGuard::new(analyzer, FallbackMode::FailClosed);
    assert!(guard.pre_check("hello").await.should_allow());

    // Stop the monitor; the persistent connection goes away.
    let _ = shutdown.send(());
    tokio::time::sleep(Duration::from_millis(50)).await;

    // With nothing listening the guard fails closed.
    assert!(guard.pre_check("hello").await.should_block());
}
