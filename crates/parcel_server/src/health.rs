//! Minimal admin HTTP server.
//!
//! Serves JSON on:
//! - `GET /health`, `/healthz`, `/live`: liveness (200 while the process is up)
//! - `GET /ready`, `/readyz`: readiness (503 once shutdown begins)
//! - `GET /status`: item counts, gate status, background task health
//! - `GET /memory`: admission gate and tracked byte usage
//! - `GET /audit?page=&page_size=&action=&level=&actor=&code=&window=`
//!
//! Uses raw TCP + tokio to avoid adding HTTP framework dependencies.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use percent_encoding::percent_decode_str;
use serde_json::json;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

use parcel_common::audit::AuditQuery;
use parcel_common::bg_supervisor::{BgTaskSupervisor, NodeHealth};
use parcel_common::error::{ParcelError, ParcelResult};
use parcel_store::memory::MemoryTracker;
use parcel_store::service::ParcelService;

/// Shared state for admin responses.
pub struct HealthState {
    start_time: Instant,
    /// Cleared at the start of graceful shutdown so probes drain traffic.
    ready: AtomicBool,
    service: Arc<ParcelService>,
    supervisor: Arc<BgTaskSupervisor>,
    tracker: Arc<MemoryTracker>,
}

impl HealthState {
    pub fn new(
        service: Arc<ParcelService>,
        supervisor: Arc<BgTaskSupervisor>,
        tracker: Arc<MemoryTracker>,
    ) -> Self {
        Self {
            start_time: Instant::now(),
            ready: AtomicBool::new(true),
            service,
            supervisor,
            tracker,
        }
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::Relaxed);
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Relaxed)
    }

    fn uptime_secs(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    fn backend(&self) -> &'static str {
        self.service.store().backend_name()
    }
}

/// Run the admin HTTP server until `shutdown` resolves.
pub async fn run_health_server(
    addr: &str,
    state: Arc<HealthState>,
    shutdown: impl std::future::Future<Output = ()>,
) {
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => {
            tracing::info!("Admin server listening on {}", addr);
            l
        }
        Err(e) => {
            tracing::error!("Failed to bind admin server on {}: {}", addr, e);
            return;
        }
    };

    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _)) => {
                        let state = state.clone();
                        tokio::spawn(async move {
                            if let Err(e) = handle_health_request(stream, &state).await {
                                tracing::debug!("Admin request error: {}", e);
                            }
                        });
                    }
                    Err(e) => {
                        tracing::debug!("Admin accept error: {}", e);
                    }
                }
            }
            _ = &mut shutdown => {
                tracing::info!("Admin server shutting down");
                break;
            }
        }
    }
}

async fn handle_health_request(
    mut stream: tokio::net::TcpStream,
    state: &HealthState,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut buf = [0u8; 2048];
    let n = stream.read(&mut buf).await?;
    if n == 0 {
        return Ok(());
    }

    let request = String::from_utf8_lossy(&buf[..n]);

    // "GET /path?query HTTP/1.x"
    let target = request
        .lines()
        .next()
        .and_then(|line| line.split_whitespace().nth(1))
        .unwrap_or("/");
    let (path, query) = target.split_once('?').unwrap_or((target, ""));

    let (status, body) = route(state, path, query);

    let response = format!(
        "HTTP/1.1 {}\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        body.len(),
        body
    );

    stream.write_all(response.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}

fn route(state: &HealthState, path: &str, query: &str) -> (&'static str, String) {
    match path {
        "/live" | "/healthz" | "/health" => {
            let body = json!({
                "status": "ok",
                "uptime_secs": state.uptime_secs(),
                "backend": state.backend(),
            });
            ("200 OK", body.to_string())
        }
        "/ready" | "/readyz" => {
            let gate = state.service.memory_status();
            if state.is_ready() {
                let body = json!({
                    "ready": true,
                    "writes_disabled": gate.disabled,
                    "uptime_secs": state.uptime_secs(),
                });
                ("200 OK", body.to_string())
            } else {
                let body = json!({
                    "ready": false,
                    "reason": "shutting down",
                });
                ("503 Service Unavailable", body.to_string())
            }
        }
        "/status" => {
            let background = state.supervisor.snapshot();
            let memory = state.service.memory_status();
            match state.service.stats() {
                Ok(items) => {
                    let label = match background.node_health {
                        NodeHealth::Degraded => "degraded",
                        NodeHealth::Healthy => "ok",
                    };
                    let body = json!({
                        "status": label,
                        "uptime_secs": state.uptime_secs(),
                        "ready": state.is_ready(),
                        "backend": state.backend(),
                        "items": items,
                        "memory": memory,
                        "audit_records": state.service.audit().len(),
                        "background": background,
                    });
                    ("200 OK", body.to_string())
                }
                Err(e) => {
                    tracing::warn!(error = %e, "status: item store unavailable");
                    let body = json!({
                        "status": "unavailable",
                        "error": e.to_string(),
                        "memory": memory,
                        "background": background,
                    });
                    ("503 Service Unavailable", body.to_string())
                }
            }
        }
        "/memory" => {
            let tracked = state.tracker.snapshot();
            parcel_observability::record_memory_bytes(tracked.item_bytes, tracked.audit_bytes);
            let body = json!({
                "gate": state.service.memory_status(),
                "tracked": tracked,
            });
            ("200 OK", body.to_string())
        }
        "/audit" => match parse_audit_query(query) {
            Ok(q) => match serde_json::to_string(&state.service.audit_page(&q)) {
                Ok(body) => ("200 OK", body),
                Err(e) => ("500 Internal Server Error", json!({ "error": e.to_string() }).to_string()),
            },
            Err(e) => ("400 Bad Request", json!({ "error": e.to_string() }).to_string()),
        },
        _ => ("404 Not Found", r#"{"error":"not found"}"#.to_string()),
    }
}

/// Parse `k=v&k=v` audit filters. Values are percent-decoded (`+` is a
/// space). Unknown keys are ignored; empty values leave the filter unset.
fn parse_audit_query(query: &str) -> ParcelResult<AuditQuery> {
    let mut q = AuditQuery::default();
    for pair in query.split('&').filter(|p| !p.is_empty()) {
        let (key, raw) = pair.split_once('=').unwrap_or((pair, ""));
        let value = decode_component(key, raw)?;
        let value = value.as_str();
        if value.is_empty() {
            continue;
        }
        match key {
            "page" => q.page = parse_int(key, value)?,
            "page_size" => q.page_size = parse_int(key, value)?,
            "action" => q.action = Some(value.parse()?),
            "level" => q.level = Some(value.parse()?),
            "actor" => q.actor = Some(value.to_string()),
            "code" => q.code = Some(value.to_string()),
            "window" => q.window = value.parse()?,
            _ => {}
        }
    }
    Ok(q)
}

fn decode_component(key: &str, raw: &str) -> ParcelResult<String> {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced)
        .decode_utf8()
        .map(|v| v.into_owned())
        .map_err(|_| ParcelError::validation(format!("{key} is not valid UTF-8 once decoded")))
}

fn parse_int(key: &str, value: &str) -> ParcelResult<i64> {
    value
        .parse()
        .map_err(|_| ParcelError::validation(format!("{key} must be an integer, got '{value}'")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use parcel_common::audit::{AuditAction, AuditLevel, ClientMeta, TimeWindow};
    use parcel_common::bg_supervisor::TaskCriticality;
    use parcel_common::clock::SystemClock;
    use parcel_common::config::{AdmissionConfig, AuditConfig, ItemConfig};
    use parcel_store::admission::{AdmissionController, TrackedUsage};
    use parcel_store::audit::InMemoryAuditLog;
    use parcel_store::codegen::CodeGenerator;
    use parcel_store::memstore::InMemoryItemStore;
    use parcel_store::service::ShareRequest;

    fn make_state() -> Arc<HealthState> {
        let clock = Arc::new(SystemClock);
        let tracker = Arc::new(MemoryTracker::new());
        let store = Arc::new(InMemoryItemStore::new(clock.clone(), tracker.clone()));
        let audit = Arc::new(InMemoryAuditLog::new(
            AuditConfig::default(),
            clock.clone(),
            tracker.clone(),
        ));
        let admission = Arc::new(AdmissionController::new(
            AdmissionConfig::default(),
            Arc::new(TrackedUsage::new(tracker.clone())),
        ));
        let service = Arc::new(ParcelService::new(
            store,
            audit,
            admission,
            Arc::new(CodeGenerator::default()),
            clock,
            ItemConfig::default(),
        ));
        Arc::new(HealthState::new(
            service,
            Arc::new(BgTaskSupervisor::new()),
            tracker,
        ))
    }

    fn share(state: &HealthState, owner: &str) {
        let req = ShareRequest {
            name: "Lantern".into(),
            type_id: 4,
            quantity: 1,
            owner_id: owner.into(),
            ..ShareRequest::default()
        };
        state
            .service
            .share(req, &ClientMeta::new("127.0.0.1", "test"))
            .unwrap();
    }

    #[test]
    fn test_health_state_defaults_ready() {
        let state = make_state();
        assert!(state.is_ready());
        assert!(state.uptime_secs() < 5);
    }

    #[test]
    fn test_parse_audit_query() {
        let q = parse_audit_query("page=2&page_size=5&action=duplicate_code&level=alert&actor=bo&window=24h&x=1")
            .unwrap();
        assert_eq!(q.page, 2);
        assert_eq!(q.page_size, 5);
        assert_eq!(q.action, Some(AuditAction::DuplicateCode));
        assert_eq!(q.level, Some(AuditLevel::Alert));
        assert_eq!(q.actor.as_deref(), Some("bo"));
        assert_eq!(q.window, TimeWindow::LastDay);

        assert_eq!(parse_audit_query("").unwrap(), AuditQuery::default());
        assert!(parse_audit_query("page=abc").is_err());
        assert!(parse_audit_query("action=bogus").is_err());
    }

    #[test]
    fn test_parse_audit_query_decodes_values() {
        let q = parse_audit_query("actor=Old%20Timer&code=12%2034&action=%64uplicate_code").unwrap();
        assert_eq!(q.actor.as_deref(), Some("Old Timer"));
        assert_eq!(q.code.as_deref(), Some("12 34"));
        assert_eq!(q.action, Some(AuditAction::DuplicateCode));

        let q = parse_audit_query("actor=Old+Timer").unwrap();
        assert_eq!(q.actor.as_deref(), Some("Old Timer"));
        assert!(parse_audit_query("level=%20").is_err());
        assert!(parse_audit_query("actor=%FF").is_err());
    }

    #[tokio::test]
    async fn test_http_live_endpoint_returns_200() {
        let state = make_state();
        let response = make_http_request(&state, "GET /live HTTP/1.1\r\nHost: localhost\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"), "got: {}", &response[..50.min(response.len())]);
        assert!(response.contains("\"status\":\"ok\""));
        assert!(response.contains("\"backend\":\"memory\""));

        // Liveness stays up while readiness drains.
        state.set_ready(false);
        let response = make_http_request(&state, "GET /healthz HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
    }

    #[tokio::test]
    async fn test_http_ready_returns_503_during_shutdown() {
        let state = make_state();
        let response = make_http_request(&state, "GET /readyz HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("\"ready\":true"));

        state.set_ready(false);
        let response = make_http_request(&state, "GET /ready HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 503"));
        assert!(response.contains("shutting down"));
    }

    #[tokio::test]
    async fn test_http_status_reports_items_and_tasks() {
        let state = make_state();
        share(&state, "A");
        state
            .supervisor
            .register("expiry-sweeper", "expiration", TaskCriticality::Critical);
        state.supervisor.report_running("expiry-sweeper");

        let response = make_http_request(&state, "GET /status HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("\"status\":\"ok\""));
        assert!(response.contains("\"total\":1"));
        assert!(response.contains("\"audit_records\":1"));
        assert!(response.contains("\"expiry-sweeper\""));

        state.supervisor.report_failed("expiry-sweeper", "disk full");
        let response = make_http_request(&state, "GET /status HTTP/1.1\r\n\r\n").await;
        assert!(response.contains("\"status\":\"degraded\""));
    }

    #[tokio::test]
    async fn test_http_memory_reports_gate() {
        let state = make_state();
        share(&state, "A");
        let response = make_http_request(&state, "GET /memory HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("\"disabled\":false"));
        assert!(response.contains("\"item_bytes\":"));
    }

    #[tokio::test]
    async fn test_http_audit_pages_and_rejects_bad_filters() {
        let state = make_state();
        for owner in ["A", "B", "C"] {
            share(&state, owner);
        }
        let response =
            make_http_request(&state, "GET /audit?page=1&page_size=2 HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("\"total\":3"));
        assert!(response.contains("\"total_pages\":2"));

        let response = make_http_request(&state, "GET /audit?level=loud HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 400"));

        let response =
            make_http_request(&state, "GET /audit?actor=%42&action=share HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.contains("\"total\":1"));
    }

    #[tokio::test]
    async fn test_http_unknown_path_returns_404() {
        let state = make_state();
        let response = make_http_request(&state, "GET /unknown HTTP/1.1\r\n\r\n").await;
        assert!(response.starts_with("HTTP/1.1 404"));
        assert!(response.contains("\"error\":\"not found\""));
    }

    /// Pipe one request through `handle_health_request` over loopback.
    async fn make_http_request(state: &Arc<HealthState>, request: &str) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let state = state.clone();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            handle_health_request(stream, &state).await.unwrap();
        });

        let mut client = tokio::net::TcpStream::connect(addr).await.unwrap();
        client.write_all(request.as_bytes()).await.unwrap();
        client.flush().await.unwrap();

        let mut response = Vec::new();
        let _ = client.read_to_end(&mut response).await;

        let _ = server.await;
        String::from_utf8_lossy(&response).into_owned()
    }
}
