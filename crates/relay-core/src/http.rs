//! HTTP ingestion and metrics endpoint.
//!
//! Routes:
//! - `POST /telem_data`: one flat telemetry record, relayed to viewers
//! - `POST /metric_data`: `{timestamp, metric_type, val}`, relayed to viewers
//! - `GET /metrics`: Prometheus text
//!
//! tiny_http serves on its own thread; each request is handled by blocking
//! on the async [`IngestEndpoint::handle`] through a runtime handle.

use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::io::Read;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread::JoinHandle;
use thiserror::Error;
use tiny_http::{Header, Response, Server};
use tokio::runtime::Handle;
use tracing::{debug, info, warn};

use relay_common::{MetricRecord, PipelineRecord, StreamKind, TelemetryRecord};
use relay_telemetry::load::check_row;
use relay_telemetry::{metric_table, LoadError, Row};

use crate::broadcast::LiveBroadcaster;
use crate::metrics::RelayMetrics;

/// Errors from the HTTP endpoint.
#[derive(Debug, Error)]
pub enum HttpError {
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    #[error("invalid request body: {0}")]
    Body(#[from] serde_json::Error),

    #[error("invalid record: {0}")]
    Invalid(#[from] LoadError),

    #[error("pipeline {0} is not running")]
    NoPipeline(StreamKind),

    #[error("no route for {method} {path}")]
    NotFound { method: String, path: String },

    #[error("metrics encoding failed: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("http server I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl HttpError {
    pub fn status(&self) -> u16 {
        match self {
            HttpError::Body(_) => 400,
            HttpError::NoPipeline(_) | HttpError::NotFound { .. } => 404,
            HttpError::Invalid(_) => 422,
            HttpError::Bind { .. } | HttpError::Metrics(_) | HttpError::Io(_) => 500,
        }
    }
}

/// A rendered response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpResponse {
    pub status: u16,
    pub content_type: &'static str,
    pub body: String,
}

impl HttpResponse {
    fn json(status: u16, body: &Value) -> Self {
        Self {
            status,
            content_type: "application/json",
            body: body.to_string(),
        }
    }

    fn error(e: &HttpError) -> Self {
        Self::json(e.status(), &json!({ "error": e.to_string() }))
    }
}

/// Request handling, independent of the HTTP server.
pub struct IngestEndpoint {
    broadcasters: BTreeMap<StreamKind, Arc<LiveBroadcaster>>,
    metrics: Arc<RelayMetrics>,
}

impl IngestEndpoint {
    pub fn new(metrics: Arc<RelayMetrics>) -> Self {
        Self {
            broadcasters: BTreeMap::new(),
            metrics,
        }
    }

    pub fn add_pipeline(&mut self, kind: StreamKind, broadcaster: Arc<LiveBroadcaster>) {
        self.broadcasters.insert(kind, broadcaster);
    }

    pub async fn handle(&self, method: &str, path: &str, body: &str) -> HttpResponse {
        let path = path.split('?').next().unwrap_or(path);
        let result = match (method, path) {
            ("POST", "/telem_data") => self.telem_data(body).await,
            ("POST", "/metric_data") => self.metric_data(body).await,
            ("GET", "/metrics") => {
                return match self.metrics.encode_text() {
                    Ok(text) => HttpResponse {
                        status: 200,
                        content_type: "text/plain; version=0.0.4",
                        body: text,
                    },
                    Err(e) => HttpResponse::error(&HttpError::from(e)),
                };
            }
            _ => Err(HttpError::NotFound {
                method: method.to_string(),
                path: path.to_string(),
            }),
        };
        match result {
            Ok(ack) => HttpResponse::json(200, &ack),
            Err(e) => {
                debug!(method, path, error = %e, "Rejected HTTP request");
                HttpResponse::error(&e)
            }
        }
    }

    async fn telem_data(&self, body: &str) -> Result<Value, HttpError> {
        let record: TelemetryRecord = serde_json::from_str(body)?;
        let ack = json!({
            "msg": "telemetry data received",
            "telemetry_type": record.telemetry_type(),
            "sensor_id": record.sensor_id.clone(),
        });
        self.relay(StreamKind::Telemetry, PipelineRecord::Telemetry(record))
            .await?;
        Ok(ack)
    }

    async fn metric_data(&self, body: &str) -> Result<Value, HttpError> {
        let record: MetricRecord = serde_json::from_str(body)?;
        let kind = record.metric_type;
        if !kind.is_metric() {
            return Err(HttpError::Invalid(LoadError::Rejected(format!(
                "{} is not a metric kind",
                kind
            ))));
        }
        check_row(&metric_table(kind), &Row::from(&record))?;
        let ack = json!({
            "msg": "metric data received",
            "metric_type": kind,
            "val": record.val.clone(),
        });
        self.relay(kind, PipelineRecord::Metric(record)).await?;
        Ok(ack)
    }

    async fn relay(&self, kind: StreamKind, record: PipelineRecord) -> Result<(), HttpError> {
        let broadcaster = self
            .broadcasters
            .get(&kind)
            .ok_or(HttpError::NoPipeline(kind))?;
        let frame = record
            .encode()
            .map_err(|e| HttpError::Invalid(LoadError::Rejected(e.to_string())))?;
        broadcaster.broadcast(&frame).await;
        Ok(())
    }
}

/// The running HTTP server.
pub struct HttpServer {
    server: Arc<Server>,
    addr: Option<SocketAddr>,
    thread: Option<JoinHandle<()>>,
}

impl HttpServer {
    /// Bind `bind` and start serving on a dedicated thread.
    pub fn start(
        bind: &str,
        endpoint: Arc<IngestEndpoint>,
        runtime: Handle,
    ) -> Result<Self, HttpError> {
        let server = Server::http(bind).map_err(|e| HttpError::Bind {
            addr: bind.to_string(),
            reason: e.to_string(),
        })?;
        let server = Arc::new(server);
        let addr = server.server_addr().to_ip();
        info!(addr = ?addr, "HTTP endpoint listening");

        let worker = Arc::clone(&server);
        let thread = std::thread::Builder::new()
            .name("relay-http".to_string())
            .spawn(move || serve_requests(&worker, &endpoint, &runtime))?;

        Ok(Self {
            server,
            addr,
            thread: Some(thread),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.addr
    }

    /// Stop accepting requests and join the server thread.
    pub fn shutdown(mut self) {
        self.server.unblock();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("HTTP server thread panicked");
            }
        }
        info!("HTTP endpoint stopped");
    }
}

fn serve_requests(server: &Server, endpoint: &IngestEndpoint, runtime: &Handle) {
    for mut request in server.incoming_requests() {
        let method = request.method().as_str().to_string();
        let path = request.url().to_string();

        let mut body = String::new();
        let response = match request.as_reader().read_to_string(&mut body) {
            Ok(_) => runtime.block_on(endpoint.handle(&method, &path, &body)),
            Err(e) => HttpResponse::error(&HttpError::Io(e)),
        };

        let mut reply = Response::from_string(response.body).with_status_code(response.status);
        if let Ok(header) = Header::from_bytes(&b"Content-Type"[..], response.content_type.as_bytes()) {
            reply = reply.with_header(header);
        }
        if let Err(e) = request.respond(reply) {
            warn!(method = %method, path = %path, error = %e, "Failed to send HTTP response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_common::PipelineName;
    use std::io::Write;
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn endpoint() -> (IngestEndpoint, Arc<LiveBroadcaster>) {
        let metrics = Arc::new(RelayMetrics::new().expect("metrics"));
        let mut endpoint = IngestEndpoint::new(metrics);
        let telemetry = Arc::new(LiveBroadcaster::new(
            PipelineName::for_kind(StreamKind::Telemetry),
            Duration::from_secs(1),
        ));
        endpoint.add_pipeline(StreamKind::Telemetry, Arc::clone(&telemetry));
        endpoint.add_pipeline(
            StreamKind::Kpm,
            Arc::new(LiveBroadcaster::new(
                PipelineName::for_kind(StreamKind::Kpm),
                Duration::from_secs(1),
            )),
        );
        (endpoint, telemetry)
    }

    #[tokio::test]
    async fn test_telem_data_acks_and_relays() {
        let (endpoint, telemetry) = endpoint();
        let (tx, mut rx) = mpsc::channel(4);
        telemetry.connect(relay_common::SessionId::new("dash"), tx);

        let body = r#"{"reading_timestamp":"2026-01-15T14:30:22.000001Z","telemetry_type":"PRESSURE",
            "sensor_id":"PRESS_ENG_001","pressure":201.5,"pressure_unit":"bar"}"#;
        let response = endpoint.handle("POST", "/telem_data", body).await;
        assert_eq!(response.status, 200, "{}", response.body);

        let ack: Value = serde_json::from_str(&response.body).expect("json");
        assert_eq!(ack["telemetry_type"], "PRESSURE");
        assert_eq!(ack["sensor_id"], "PRESS_ENG_001");
        assert!(ack["msg"].is_string());

        let relayed: Value = serde_json::from_str(&rx.recv().await.expect("frame")).expect("json");
        assert_eq!(relayed["pressure"], 201.5);
        assert!(relayed["temperature"].is_null());
    }

    #[tokio::test]
    async fn test_metric_data_acks_and_validates() {
        let (endpoint, _) = endpoint();
        let ok = endpoint
            .handle(
                "POST",
                "/metric_data",
                r#"{"timestamp":"2026-01-15T14:30:22Z","metric_type":"kpm","val":88}"#,
            )
            .await;
        assert_eq!(ok.status, 200, "{}", ok.body);
        let ack: Value = serde_json::from_str(&ok.body).expect("json");
        assert_eq!(ack["metric_type"], "kpm");
        assert_eq!(ack["val"], 88);

        let wrong_type = endpoint
            .handle(
                "POST",
                "/metric_data",
                r#"{"timestamp":"2026-01-15T14:30:22Z","metric_type":"kpm","val":"fast"}"#,
            )
            .await;
        assert_eq!(wrong_type.status, 422);

        let not_running = endpoint
            .handle(
                "POST",
                "/metric_data",
                r#"{"timestamp":"2026-01-15T14:30:22Z","metric_type":"cpm","val":3}"#,
            )
            .await;
        assert_eq!(not_running.status, 404);
    }

    #[tokio::test]
    async fn test_bad_body_and_unknown_route() {
        let (endpoint, _) = endpoint();
        assert_eq!(endpoint.handle("POST", "/telem_data", "{").await.status, 400);
        assert_eq!(endpoint.handle("GET", "/nope", "").await.status, 404);
        let metrics = endpoint.handle("GET", "/metrics?x=1", "").await;
        assert_eq!(metrics.status, 200);
        assert!(metrics.content_type.starts_with("text/plain"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_server_answers_over_tcp() {
        let (endpoint, _) = endpoint();
        let server = HttpServer::start("127.0.0.1:0", Arc::new(endpoint), Handle::current())
            .expect("start");
        let addr = server.local_addr().expect("addr");

        let reply = tokio::task::spawn_blocking(move || {
            let mut stream = std::net::TcpStream::connect(addr).expect("connect");
            stream
                .write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                .expect("write");
            let mut reply = String::new();
            stream.read_to_string(&mut reply).expect("read");
            reply
        })
        .await
        .expect("join");
        assert!(reply.contains(" 200 "), "{reply}");

        tokio::task::spawn_blocking(move || server.shutdown())
            .await
            .expect("join");
    }
}
