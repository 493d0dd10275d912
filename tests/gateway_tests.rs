//! End-to-end tests driving the gateway with scripted probes.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ledgergate::config::LoadBalanceStrategy;
use ledgergate::event::Notification;
use ledgergate::gateway::Gateway;
use ledgergate::testkit;
use ledgergate::testkit::probe::{ProbeOutcome, ScriptedProbe};
use ledgergate::Error;

const RPC_A: &str = "https://rpc-a.example.com";
const RPC_B: &str = "https://rpc-b.example.com";

fn gateway_over(urls: &[&str], probe: Arc<ScriptedProbe>) -> Gateway {
    let config = testkit::config::with_endpoints(urls);
    Gateway::new(config, probe).unwrap()
}

// -- Startup & selection ----------------------------------------------------

#[tokio::test(start_paused = true)]
async fn startup_fills_the_pool_and_round_robin_cycles_all_handles() {
    let probe = Arc::new(ScriptedProbe::always_ok());
    let mut config = testkit::config::with_endpoints(&[RPC_A, RPC_B]);
    config.pool.size = 4;
    config.pool.strategy = LoadBalanceStrategy::RoundRobin;
    let gateway = Gateway::new(config, probe).unwrap();
    gateway.start().await;

    let mut seen = Vec::new();
    for _ in 0..4 {
        let handle = gateway.get_connection().unwrap();
        seen.push(handle.id());
        gateway.release(&handle);
    }
    // Four distinct handles, visited once each...
    let mut unique = seen.clone();
    unique.sort();
    unique.dedup();
    assert_eq!(unique.len(), 4);

    // ...and the fifth call wraps around to the first handle.
    assert_eq!(gateway.get_connection().unwrap().id(), seen[0]);

    gateway.stop().await;
}

#[tokio::test(start_paused = true)]
async fn operations_route_through_pool_handles() {
    let probe = Arc::new(ScriptedProbe::always_ok());
    let gateway = gateway_over(&[RPC_A], probe);
    gateway.start().await;

    let pool = gateway.pool();
    let host = gateway
        .submit("account-query", 1, 3, move || {
            let pool = pool.clone();
            async move {
                let handle = pool.get_connection()?;
                let host = handle
                    .endpoint()
                    .url()
                    .host_str()
                    .unwrap_or_default()
                    .to_string();
                pool.release(&handle);
                Ok(host)
            }
        })
        .await
        .unwrap();

    assert_eq!(host, "rpc-a.example.com");
    gateway.stop().await;
}

// -- Retry behavior ---------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn throttled_operation_succeeds_after_three_backoffs() {
    let probe = Arc::new(ScriptedProbe::always_ok());
    let gateway = gateway_over(&[RPC_A], probe);
    gateway.start().await;
    let mut events = gateway.events();

    let attempts = Arc::new(AtomicU32::new(0));
    let op_attempts = attempts.clone();
    let started = tokio::time::Instant::now();
    let result = gateway
        .submit("token-lookup", 1, 4, move || {
            let attempts = op_attempts.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(Error::throttled())
                } else {
                    Ok("payload".to_string())
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "payload");
    assert_eq!(attempts.load(Ordering::SeqCst), 4);
    assert!(started.elapsed() >= Duration::from_secs(210));

    // The throttle penalty surfaced as a backoff on the operation's scope.
    let mut saw_backoff = false;
    while let Ok(event) = events.try_recv() {
        if let Notification::BackoffApplied { scope, duration } = event {
            assert_eq!(scope, "token-lookup");
            assert!(duration >= Duration::from_secs(30));
            saw_backoff = true;
        }
    }
    assert!(saw_backoff);

    gateway.stop().await;
}

// -- Health & pruning -------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn timed_out_endpoint_is_pruned_until_it_recovers() {
    let probe = Arc::new(ScriptedProbe::always_ok());
    let mut config = testkit::config::with_endpoints(&[RPC_A, RPC_B]);
    config.pool.size = 4;
    // One bad probe against a short history must flip the endpoint.
    config.health.max_error_rate = 0.4;
    let gateway = Gateway::new(config, probe.clone()).unwrap();
    gateway.start().await;
    assert_eq!(gateway.status().pool_utilization, 1.0);

    // B stops answering; the next health cycle (t=30s) times it out after
    // the 10s probe timeout and prunes every handle bound to it.
    probe.set(&format!("{RPC_B}/"), ProbeOutcome::Hang);
    tokio::time::sleep(Duration::from_secs(45)).await;

    let status = gateway.status();
    let b = status
        .endpoints
        .iter()
        .find(|e| e.address.contains("rpc-b"))
        .unwrap();
    assert!(!b.healthy);

    for _ in 0..4 {
        let handle = gateway.get_connection().unwrap();
        assert_eq!(handle.endpoint().url().host_str().unwrap(), "rpc-a.example.com");
        gateway.release(&handle);
    }

    // B answers again; after enough clean probes it recovers and new
    // handles can bind to it.
    probe.set(&format!("{RPC_B}/"), ProbeOutcome::Succeed);
    tokio::time::sleep(Duration::from_secs(91)).await;
    let status = gateway.status();
    let b = status
        .endpoints
        .iter()
        .find(|e| e.address.contains("rpc-b"))
        .unwrap();
    assert!(b.healthy);

    gateway.scale_up(2).await;
    let bound_hosts: Vec<String> = (0..6)
        .map(|_| {
            let handle = gateway.get_connection().unwrap();
            let host = handle.endpoint().url().host_str().unwrap().to_string();
            gateway.release(&handle);
            host
        })
        .collect();
    assert!(bound_hosts.iter().any(|h| h == "rpc-b.example.com"));

    gateway.stop().await;
}

// -- Lifecycle & observability ----------------------------------------------

#[tokio::test(start_paused = true)]
async fn start_emits_probe_scale_and_started_events_in_order() {
    let probe = Arc::new(ScriptedProbe::always_ok());
    let gateway = gateway_over(&[RPC_A, RPC_B], probe);
    let mut events = gateway.events();

    gateway.start().await;
    assert_eq!(
        events.recv().await.unwrap(),
        Notification::HealthCheckComplete {
            total_endpoints: 2,
            healthy_endpoints: 2,
        }
    );
    assert_eq!(
        events.recv().await.unwrap(),
        Notification::ScaledUp {
            previous_size: 0,
            current_size: 5,
        }
    );
    assert_eq!(events.recv().await.unwrap(), Notification::Started);

    gateway.stop().await;
    assert_eq!(events.recv().await.unwrap(), Notification::Stopped);
}

#[tokio::test(start_paused = true)]
async fn status_and_stats_reflect_activity() {
    let probe = Arc::new(ScriptedProbe::always_ok());
    let gateway = gateway_over(&[RPC_A, RPC_B], probe);
    gateway.start().await;

    let handle = gateway.get_connection().unwrap();
    gateway.release(&handle);
    gateway
        .submit("status-query", 1, 0, || async { Ok::<_, Error>(()) })
        .await
        .unwrap();

    let status = gateway.status();
    assert_eq!(status.pool_utilization, 1.0);
    assert_eq!(status.endpoints.len(), 2);
    assert!(status.endpoints.iter().all(|e| e.healthy));
    assert_eq!(status.strategy, "round-robin");
    assert_eq!(status.active_requests, 0);

    let stats = gateway.stats();
    assert!(stats.started_at.is_some());
    assert_eq!(stats.submitted, 1);
    assert_eq!(stats.succeeded, 1);
    assert_eq!(stats.rejected, 0);
    assert_eq!(stats.handles_created, 5);
    assert_eq!(stats.leases, 1);
    assert!(stats.probe_rounds >= 1);

    // Snapshots serialize for operator tooling.
    let json = serde_json::to_value(&status).unwrap();
    assert_eq!(json["strategy"], "round-robin");
    assert!(json["endpoints"].as_array().unwrap().len() == 2);

    gateway.stop().await;
}

#[tokio::test(start_paused = true)]
async fn scale_down_keeps_the_requested_handle_count() {
    let probe = Arc::new(ScriptedProbe::always_ok());
    let mut config = testkit::config::with_endpoints(&[RPC_A, RPC_B]);
    config.pool.size = 6;
    let gateway = Gateway::new(config, probe).unwrap();
    gateway.start().await;

    gateway.scale_down(2);
    let status = gateway.status();
    assert!((status.pool_utilization - 2.0 / 6.0).abs() < 1e-9);

    gateway.stop().await;
}
