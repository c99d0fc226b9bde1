//! End-to-end tests: a real daemon on a temp socket, driven over IPC

use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

use cortex_common::alert::{AlertCategory, AlertFilter, AlertSeverity};
use cortex_common::protocol::{decode_response, encode_request, ErrorCode, Request, Response};
use cortexd::alert_store::AlertStore;
use cortexd::config::Config;
use cortexd::inference::FakeInferenceClient;
use cortexd::monitor::sampler::FixedSampler;
use cortexd::{Daemon, DaemonOptions};
use serde_json::{json, Value};

fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.server.socket_path = dir.join("cortex.sock").display().to_string();
    config.alerts.db_path = dir.join("alerts.db").display().to_string();
    config.monitor.interval_secs = 3600;
    config
}

fn quiet_daemon(dir: &Path) -> Daemon {
    Daemon::start(
        DaemonOptions::from_config(config(dir))
            .with_sampler(Box::new(FixedSampler::new(5.0, 10.0, 20.0))),
    )
    .unwrap()
}

fn call(socket: &Path, request: Request) -> Response {
    let mut stream = UnixStream::connect(socket).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(&encode_request(&request)).unwrap();
    stream.shutdown(std::net::Shutdown::Write).unwrap();
    let mut buf = Vec::new();
    stream.read_to_end(&mut buf).unwrap();
    decode_response(&buf).unwrap()
}

fn result(socket: &Path, request: Request) -> Value {
    let resp = call(socket, request);
    assert!(resp.is_success(), "unexpected error: {:?}", resp.error_body());
    resp.result().cloned().unwrap()
}

fn wait_for(timeout: Duration, mut done: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if done() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(20));
    }
    done()
}

#[test]
fn test_ping_and_version() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = quiet_daemon(dir.path());

    let resp = call(daemon.socket_path(), Request::new("ping").with_id("req-1"));
    assert!(resp.is_success());
    assert_eq!(resp.result().unwrap()["pong"], true);
    assert_eq!(resp.id.as_deref(), Some("req-1"));

    let version = result(daemon.socket_path(), Request::new("version"));
    assert_eq!(version["name"], "cortexd");
    assert_eq!(version["version"], env!("CARGO_PKG_VERSION"));
}

#[test]
fn test_unknown_method() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = quiet_daemon(dir.path());

    let resp = call(daemon.socket_path(), Request::new("reboot"));
    assert!(!resp.is_success());
    let err = resp.error_body().unwrap();
    assert_eq!(err.error_code(), Some(ErrorCode::MethodNotFound));
    assert!(err.message.contains("reboot"));
}

#[test]
fn test_zero_cpu_threshold_raises_critical_alert() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.thresholds.cpu_warning = 0.0;
    cfg.thresholds.cpu_critical = 0.0;
    let daemon = Daemon::start(
        DaemonOptions::from_config(cfg).with_sampler(Box::new(FixedSampler::new(5.0, 10.0, 20.0))),
    )
    .unwrap();
    let socket = daemon.socket_path().to_path_buf();

    let filter = json!({"category": "cpu"});
    assert!(wait_for(Duration::from_secs(5), || {
        result(&socket, Request::new("alerts").with_params(filter.clone()))["count"] == 1
    }));

    let listed = result(&socket, Request::new("alerts").with_params(filter));
    let alert = &listed["alerts"][0];
    assert_eq!(alert["severity"], "critical");
    assert_eq!(alert["source"], "system_monitor");
    assert_eq!(alert["status"], "active");

    assert!(wait_for(Duration::from_secs(5), || {
        result(&socket, Request::new("health"))["cpu_cores"] == 4
    }));
    let health = result(&socket, Request::new("health"));
    assert!(health["critical_alerts"].as_u64().unwrap() >= 1);

    // A forced check does not duplicate the open alert
    result(&socket, Request::new("health.check"));
    std::thread::sleep(Duration::from_millis(300));
    let listed = result(&socket, Request::new("alerts").with_params(json!({"category": "cpu"})));
    assert_eq!(listed["count"], 1);
}

#[test]
fn test_acknowledge_and_dismiss_all() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.thresholds.cpu_warning = 0.0;
    cfg.thresholds.cpu_critical = 0.0;
    cfg.thresholds.memory_warning = 0.0;
    cfg.thresholds.memory_critical = 0.0;
    cfg.thresholds.disk_warning = 0.0;
    cfg.thresholds.disk_critical = 0.0;
    let daemon = Daemon::start(
        DaemonOptions::from_config(cfg).with_sampler(Box::new(FixedSampler::new(5.0, 10.0, 20.0))),
    )
    .unwrap();
    let socket = daemon.socket_path().to_path_buf();

    assert!(wait_for(Duration::from_secs(5), || {
        result(&socket, Request::new("alerts"))["count"] == 3
    }));
    let listed = result(&socket, Request::new("alerts"));
    let id = listed["alerts"][0]["id"].as_str().unwrap().to_string();

    let acked = result(
        &socket,
        Request::new("alerts.acknowledge").with_params(json!({"id": id})),
    );
    assert_eq!(acked["acknowledged"], true);

    let missing = result(
        &socket,
        Request::new("alerts.acknowledge").with_params(json!({"id": "no-such-alert"})),
    );
    assert_eq!(missing["acknowledged"], false);

    let counts = result(&socket, Request::new("alerts.counts"));
    assert_eq!(counts["critical"], 3);
    assert_eq!(counts["total"], 3);
    assert_eq!(counts["acknowledged"], 1);
    assert_eq!(counts["active"], 2);

    let bad = call(&socket, Request::new("alerts.dismiss"));
    assert_eq!(
        bad.error_body().unwrap().error_code(),
        Some(ErrorCode::InvalidParams)
    );

    let dismissed = result(
        &socket,
        Request::new("alerts.dismiss").with_params(json!({"all": true})),
    );
    assert_eq!(dismissed["dismissed"], 3);

    assert_eq!(result(&socket, Request::new("alerts"))["count"], 0);
    let with_dismissed = result(
        &socket,
        Request::new("alerts").with_params(json!({"include_dismissed": true})),
    );
    assert_eq!(with_dismissed["count"], 3);
    assert!(with_dismissed["alerts"]
        .as_array()
        .unwrap()
        .iter()
        .all(|a| a["status"] == "dismissed"));
}

#[test]
fn test_invalid_filter_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = quiet_daemon(dir.path());

    let resp = call(
        daemon.socket_path(),
        Request::new("alerts").with_params(json!({"severity": "severe"})),
    );
    assert_eq!(
        resp.error_body().unwrap().error_code(),
        Some(ErrorCode::InvalidParams)
    );
}

#[test]
fn test_rate_limit_rejects_excess_requests() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.server.max_requests_per_sec = 3;
    let daemon = Daemon::start(
        DaemonOptions::from_config(cfg).with_sampler(Box::new(FixedSampler::new(5.0, 10.0, 20.0))),
    )
    .unwrap();

    let responses: Vec<Response> = (0..8)
        .map(|_| call(daemon.socket_path(), Request::new("ping")))
        .collect();

    let limited = responses
        .iter()
        .filter(|r| {
            r.error_body().and_then(|e| e.error_code()) == Some(ErrorCode::RateLimited)
        })
        .count();
    assert!(limited >= 2, "only {} of 8 requests were limited", limited);
    assert!(responses.iter().all(|r| r.is_success()
        || r.error_body().and_then(|e| e.error_code()) == Some(ErrorCode::RateLimited)));
}

#[test]
fn test_shutdown_over_ipc_sets_signal() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = quiet_daemon(dir.path());
    let signal = daemon.shutdown_signal();

    let resp = result(daemon.socket_path(), Request::new("shutdown"));
    assert_eq!(resp["shutdown"], "initiated");
    assert!(signal.is_requested());

    daemon.shutdown();
    assert!(!dir.path().join("cortex.sock").exists());
}

#[test]
fn test_enrichment_links_analysis_to_alert() {
    let dir = tempfile::tempdir().unwrap();
    let mut cfg = config(dir.path());
    cfg.thresholds.disk_warning = 0.0;
    cfg.thresholds.disk_critical = 0.0;
    let fake = Arc::new(FakeInferenceClient::always_ok("Find large files with `du -xh /`."));
    let daemon = Daemon::start(
        DaemonOptions::from_config(cfg)
            .with_sampler(Box::new(FixedSampler::new(5.0, 10.0, 20.0)))
            .with_inference(fake.clone()),
    )
    .unwrap();
    let socket = daemon.socket_path().to_path_buf();

    let filter = json!({"category": "ai-analysis"});
    assert!(wait_for(Duration::from_secs(5), || {
        result(&socket, Request::new("alerts").with_params(filter.clone()))["count"] == 1
    }));

    let analysis = &result(&socket, Request::new("alerts").with_params(filter))["alerts"][0];
    assert_eq!(analysis["metadata"]["ai_enhanced"], "true");
    let parent_id = analysis["metadata"]["parent_alert_id"].as_str().unwrap();

    let disk = result(&socket, Request::new("alerts").with_params(json!({"category": "disk"})));
    assert_eq!(disk["alerts"][0]["id"], parent_id);
    assert_eq!(fake.call_count(), 1);
}

#[test]
fn test_shutdown_discards_inflight_enrichment() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("alerts.db");
    let mut cfg = config(dir.path());
    cfg.thresholds.cpu_warning = 0.0;
    cfg.thresholds.cpu_critical = 0.0;
    let fake = Arc::new(
        FakeInferenceClient::always_ok("too late").with_delay(Duration::from_millis(800)),
    );
    let daemon = Daemon::start(
        DaemonOptions::from_config(cfg)
            .with_sampler(Box::new(FixedSampler::new(5.0, 10.0, 20.0)))
            .with_inference(fake.clone()),
    )
    .unwrap();

    let monitor = daemon.context().monitor.clone();
    assert!(wait_for(Duration::from_secs(5), || monitor.pending_enrichments() > 0));

    daemon.shutdown();
    drop(daemon);
    assert_eq!(monitor.pending_enrichments(), 0);
    drop(monitor);

    let store = AlertStore::open(&db_path).unwrap();
    let analyses = store
        .list(&AlertFilter {
            category: Some(AlertCategory::AiAnalysis),
            include_dismissed: true,
            ..AlertFilter::default()
        })
        .unwrap();
    assert!(analyses.is_empty());

    let cpu = store
        .list(&AlertFilter {
            category: Some(AlertCategory::Cpu),
            ..AlertFilter::default()
        })
        .unwrap();
    assert_eq!(cpu.len(), 1);
    assert_eq!(cpu[0].severity, AlertSeverity::Critical);
}
