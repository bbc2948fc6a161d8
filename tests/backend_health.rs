mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{MockTransport, config, runtime};
use vclcore::interpreter::compile_source;
use chrono::Utc;
use vclcore::runtime::cache::{ManualClock, MemoryObjectCache, ObjectCache};
use vclcore::runtime::context::{CacheObject, InboundRequest};
use vclcore::runtime::scheduler::{HealthMonitor, probe_all};
use vclcore::runtime::state::BackendState;

const POLICY: &str = r#"
probe quick { .url = "/ping"; .interval = 100ms; .window = 4; .threshold = 2; .initial = 1; }
backend primary { .host = "10.0.0.1"; .probe = quick; }
backend secondary { .host = "10.0.0.2"; .probe = quick; }
sub vcl_recv { set req.backend_hint = secondary; }
"#;

#[tokio::test]
async fn probe_all_records_one_outcome_per_backend() {
    let program = compile_source("health.vcl", POLICY).unwrap();
    let transport = MockTransport::default()
        .probe_status("primary", 200)
        .probe_status("secondary", 503);
    let backends: Vec<_> = program.backends.iter().map(|(_, b)| b.clone()).collect();

    let outcomes = probe_all(&backends, &transport).await;
    assert_eq!(outcomes, [true, false]);
    assert_eq!(backends[0].probe().history(), [true, true]);
    assert!(backends[0].is_healthy());
    assert!(!backends[1].is_healthy());
    assert!(backends[1].probe().last_probed().is_some());
}

#[tokio::test]
async fn unreachable_probes_count_as_failures() {
    let program = compile_source("health.vcl", POLICY).unwrap();
    let transport = MockTransport::default();
    let backend = program.backend("primary").unwrap().clone();

    backend.probe().record(true);
    assert!(backend.is_healthy());
    for _ in 0..4 {
        assert!(!backend.probe().execute(&backend, &transport).await);
    }
    assert_eq!(backend.probe().history(), [false; 4]);
    assert!(!backend.is_healthy());
}

#[tokio::test]
async fn monitor_probes_periodically_until_shutdown() {
    let program = compile_source("health.vcl", POLICY).unwrap();
    let transport = Arc::new(MockTransport::default().probe_status("primary", 200));
    let backends: Vec<_> = program.backends.iter().map(|(_, b)| b.clone()).collect();

    let mut monitor = HealthMonitor::start(&backends, transport.clone());
    assert_eq!(monitor.len(), 2);
    assert_eq!(monitor.backends().collect::<Vec<_>>(), ["primary", "secondary"]);

    tokio::time::sleep(Duration::from_millis(350)).await;
    monitor.shutdown();
    assert!(monitor.is_empty());

    let probed = transport.probes.lock().len();
    assert!(probed >= 4, "expected repeated probes, saw {probed}");
    assert!(backends[0].is_healthy());
    assert!(!backends[1].is_healthy());
    assert_eq!(backends[0].probe().history().len(), 4);

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(transport.probes.lock().len(), probed);
}

#[tokio::test]
async fn unhealthy_hint_falls_back_to_a_healthy_backend() {
    let transport = Arc::new(MockTransport::responding(200));
    let runtime = runtime(POLICY, config(5, 3), Arc::new(MemoryObjectCache::new()), transport.clone());
    let primary = runtime.program().backend("primary").unwrap().clone();

    // nothing healthy yet: the hint wins
    runtime.simulate(InboundRequest::new("GET", "/a")).await.unwrap();
    primary.probe().record(true);
    runtime.simulate(InboundRequest::new("GET", "/b")).await.unwrap();

    assert_eq!(transport.fetched_backends(), ["secondary", "primary"]);
}

#[tokio::test]
async fn connection_failures_exhaust_the_retry_budget() {
    let transport = Arc::new(MockTransport::unreachable());
    let runtime = runtime(POLICY, config(0, 2), Arc::new(MemoryObjectCache::new()), transport.clone());

    let (response, outcome) = runtime.simulate(InboundRequest::new("GET", "/")).await.unwrap();
    assert_eq!(transport.fetch_count(), 2);
    assert_eq!(outcome.backend_trace.last(), Some(&BackendState::Abandon));
    assert_eq!(response.status, 500);
}

#[tokio::test]
async fn backend_response_hook_can_set_the_ttl() {
    let source = format!(
        "{POLICY} sub vcl_backend_response {{ if (beresp.status == 200) {{ set beresp.ttl = 5m; }} }}"
    );
    let cache = Arc::new(MemoryObjectCache::new());
    let transport = Arc::new(MockTransport::responding(200));
    let runtime = runtime(&source, config(5, 3), cache.clone(), transport.clone());

    runtime.simulate(InboundRequest::new("GET", "/ttl")).await.unwrap();
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.stats().stores, 1);

    let (_, outcome) = runtime.simulate(InboundRequest::new("GET", "/ttl")).await.unwrap();
    assert!(outcome.backend_trace.is_empty());
    assert_eq!(transport.fetch_count(), 1);
}

#[tokio::test]
async fn runtime_start_honours_health_check_flag() {
    let transport = Arc::new(MockTransport::default().probe_status("primary", 200));
    let mut runtime = runtime(POLICY, config(5, 3), Arc::new(MemoryObjectCache::new()), transport.clone());
    runtime.start();
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(transport.probes.lock().is_empty());
    runtime.shutdown().unwrap();

    let mut enabled = config(5, 3);
    enabled.health_checks = true;
    let mut runtime = common::runtime(POLICY, enabled, Arc::new(MemoryObjectCache::new()), transport.clone());
    runtime.start();
    tokio::time::sleep(Duration::from_millis(150)).await;
    runtime.shutdown().unwrap();
    assert!(!transport.probes.lock().is_empty());
}

#[tokio::test]
async fn runtime_start_sweeps_expired_objects() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let cache = Arc::new(MemoryObjectCache::with_clock(clock.clone()));
    let mut config = config(5, 3);
    config.cache_sweep_ms = 20;
    let mut runtime = runtime(POLICY, config, cache.clone(), Arc::new(MockTransport::default()));

    let object = CacheObject::from_backend(&Default::default(), Utc::now());
    cache.set("stale", object, chrono::Duration::seconds(1));
    clock.advance(chrono::Duration::seconds(2));
    assert_eq!(cache.len(), 1);

    runtime.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    runtime.shutdown().unwrap();
    assert!(cache.is_empty());
    assert_eq!(cache.stats().expired, 1);
}

#[tokio::test]
async fn acl_hosts_match_against_the_resolved_snapshot() {
    let source = format!(
        r#"{POLICY}
        acl trusted {{ "gateway.invalid"; }}
        sub vcl_recv {{
            if (client.ip ~ trusted) {{ return (synth(200, "Trusted")); }}
            return (synth(403, "Denied"));
        }}"#
    );
    let runtime = runtime(&source, config(5, 3), Arc::new(MemoryObjectCache::new()), Arc::new(MockTransport::default()));
    assert_eq!(runtime.program().acl_hosts(), ["gateway.invalid"]);
    let request = || InboundRequest::new("GET", "/").with_remote("192.0.2.10:40000".parse().unwrap());

    // unresolved include entries fail open
    let (response, _) = runtime.simulate(request()).await.unwrap();
    assert_eq!(response.status, 200);

    let dns = runtime.program().dns.clone().unwrap();
    dns.insert("gateway.invalid", vec!["10.9.9.9".parse().unwrap()]);
    let (response, _) = runtime.simulate(request()).await.unwrap();
    assert_eq!((response.status, response.reason.as_str()), (403, "Denied"));
}
