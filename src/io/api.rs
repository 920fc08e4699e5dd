//! Location API HTTP endpoint
//!
//! Receives location samples from the mobile app and exposes presence state,
//! health and Prometheus metrics. Uses hyper for the HTTP server.

use crate::domain::types::{LocationUpdate, PresenceStatus, UserId};
use crate::infra::metrics::Metrics;
use crate::io::prometheus::format_prometheus_metrics;
use crate::services::presence::PresenceTracker;
use bytes::Bytes;
use http_body_util::{BodyExt, Full, Limited};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde_json::{json, Value};
use std::convert::Infallible;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 16 * 1024;

/// Everything a request handler needs
#[derive(Clone)]
pub struct ApiState {
    pub tracker: PresenceTracker,
    pub metrics: Arc<Metrics>,
    pub site_id: Arc<str>,
}

fn json_response(status: StatusCode, body: &Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("Access-Control-Allow-Origin", "*")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response should not fail")
}

fn error_body(message: impl std::fmt::Display) -> Value {
    json!({ "error": message.to_string() })
}

/// Decode and apply a `POST /location` body
pub fn handle_location_body(tracker: &PresenceTracker, body: &[u8]) -> (StatusCode, Value) {
    let update: LocationUpdate = if body.iter().all(u8::is_ascii_whitespace) {
        LocationUpdate::default()
    } else {
        match serde_json::from_slice(body) {
            Ok(update) => update,
            Err(e) => {
                debug!(error = %e, "location_body_invalid");
                return (StatusCode::BAD_REQUEST, error_body(format!("Invalid JSON body: {e}")));
            }
        }
    };

    match tracker.update_location(&update) {
        Ok(outcome) => {
            let inside = update.validate().is_ok_and(|sample| tracker.contains(sample.position));
            (StatusCode::OK, json!({ "status": outcome.as_str(), "inside": inside }))
        }
        Err(e) => (StatusCode::BAD_REQUEST, error_body(e)),
    }
}

/// Render `GET /presence/{userId}`
pub fn handle_presence(tracker: &PresenceTracker, raw_id: &str) -> (StatusCode, Value) {
    let user_id: UserId = match raw_id.parse() {
        Ok(id) => id,
        Err(_) => {
            return (StatusCode::BAD_REQUEST, error_body(format!("invalid userId: {raw_id}")));
        }
    };

    let status = tracker.status(user_id);
    let mut body = json!({ "userId": user_id, "state": status.as_str() });
    if let PresenceStatus::OutsidePending { remaining } = status {
        body["remaining_ms"] = json!(remaining.as_millis() as u64);
    }
    (StatusCode::OK, body)
}

/// Route a request whose body has already been read
pub fn route(state: &ApiState, method: &Method, path: &str, body: &[u8]) -> Response<Full<Bytes>> {
    match (method, path) {
        (&Method::POST, "/location") => {
            let (status, body) = handle_location_body(&state.tracker, body);
            json_response(status, &body)
        }
        (&Method::GET, "/metrics") => {
            let body = format_prometheus_metrics(&state.metrics, &state.site_id);
            Response::builder()
                .status(StatusCode::OK)
                .header("Content-Type", "text/plain; version=0.0.4; charset=utf-8")
                .body(Full::new(Bytes::from(body)))
                .expect("static response should not fail")
        }
        (&Method::GET, "/health") => Response::builder()
            .status(StatusCode::OK)
            .body(Full::new(Bytes::from("ok")))
            .expect("static response should not fail"),
        (&Method::GET, p) if p.starts_with("/presence/") => {
            let raw_id = &p["/presence/".len()..];
            let (status, body) = handle_presence(&state.tracker, raw_id);
            json_response(status, &body)
        }
        // CORS preflight
        (&Method::OPTIONS, _) => Response::builder()
            .status(StatusCode::NO_CONTENT)
            .header("Access-Control-Allow-Origin", "*")
            .header("Access-Control-Allow-Methods", "GET, POST, OPTIONS")
            .header("Access-Control-Allow-Headers", "Content-Type")
            .body(Full::new(Bytes::new()))
            .expect("static response should not fail"),
        _ => Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail"),
    }
}

/// Handle HTTP requests
async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: ApiState,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();

    let body = match Limited::new(body, MAX_BODY_BYTES).collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(error = %e, path = %parts.uri.path(), "api_body_read_failed");
            return Ok(json_response(
                StatusCode::PAYLOAD_TOO_LARGE,
                &error_body("request body too large or unreadable"),
            ));
        }
    };

    Ok(route(&state, &parts.method, parts.uri.path(), &body))
}

/// Start the location API HTTP server
pub async fn start_api_server(
    bind_address: &str,
    port: u16,
    state: ApiState,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let listener = TcpListener::bind((bind_address, port)).await?;

    info!(bind = %bind_address, port = %port, site = %state.site_id, "api_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let state = state.clone();
                                async move { handle_request(req, state).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "api_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "api_accept_error");
                    }
                }
            }
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    info!("api_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
