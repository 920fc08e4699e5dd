//! Mock ParkITESO checkout service
//!
//! Stands in for the checkout service during local runs of the geofence.
//!
//! Behavior of `POST /checkout` with `{"userId": 1, "type": "automatic"}`:
//! - missing userId -> 400 `{"error":"userId is required"}`
//! - user listed in `--disabled-users` and type automatic -> 403
//! - user already checked out since the mock started -> 400
//! - otherwise 200 with the checkout time
//!
//! `--fail-status` forces every call to return that status instead.
//!
//! Usage:
//!   cargo run --bin mock_checkout -- --port 4000 --disabled-users 3,4

use bytes::Bytes;
use clap::Parser;
use http_body_util::{BodyExt, Full};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use serde::Deserialize;
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::net::TcpListener;

#[derive(Parser, Debug)]
#[command(name = "mock_checkout")]
#[command(about = "Mock ParkITESO checkout service for local simulation")]
struct Args {
    /// TCP port to listen on
    #[arg(short, long, default_value = "4000")]
    port: u16,

    /// Users with automatic checkout disabled (comma separated)
    #[arg(long, value_delimiter = ',')]
    disabled_users: Vec<i64>,

    /// Answer every call with this status
    #[arg(long)]
    fail_status: Option<u16>,

    /// Artificial processing delay (ms)
    #[arg(long, default_value = "0")]
    latency_ms: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CheckoutBody {
    user_id: Option<i64>,
    #[serde(rename = "type", default = "default_type")]
    checkout_type: String,
}

fn default_type() -> String {
    "automatic".to_string()
}

struct MockState {
    disabled: FxHashSet<i64>,
    checked_out: Mutex<FxHashSet<i64>>,
    fail_status: Option<StatusCode>,
    latency: Duration,
}

fn json_response(status: StatusCode, body: serde_json::Value) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(body.to_string())))
        .expect("static response should not fail")
}

fn checkout(state: &MockState, body: &[u8]) -> Response<Full<Bytes>> {
    let parsed: CheckoutBody = match serde_json::from_slice(body) {
        Ok(b) => b,
        Err(e) => {
            eprintln!("[MOCK] Invalid body: {}", e);
            return json_response(StatusCode::BAD_REQUEST, json!({"error": "invalid JSON body"}));
        }
    };

    let Some(user_id) = parsed.user_id else {
        return json_response(StatusCode::BAD_REQUEST, json!({"error": "userId is required"}));
    };

    if let Some(status) = state.fail_status {
        println!("[MOCK] Checkout user={} -> forced {}", user_id, status.as_u16());
        return json_response(status, json!({"error": "forced failure"}));
    }

    if parsed.checkout_type == "automatic" && state.disabled.contains(&user_id) {
        println!("[MOCK] Checkout user={} -> auto checkout disabled", user_id);
        return json_response(
            StatusCode::FORBIDDEN,
            json!({"message": "El usuario tiene desactivado el checkout automático"}),
        );
    }

    if !state.checked_out.lock().insert(user_id) {
        println!("[MOCK] Checkout user={} -> already checked out", user_id);
        return json_response(
            StatusCode::BAD_REQUEST,
            json!({"message": "El usuario ya hizo checkout previamente"}),
        );
    }

    let checkout_time = OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default();
    println!("[MOCK] ========================================");
    println!("[MOCK] CHECKOUT user={} type={} at {}", user_id, parsed.checkout_type, checkout_time);
    println!("[MOCK] ========================================");

    json_response(
        StatusCode::OK,
        json!({
            "message": format!("Checkout {} registrado con éxito", parsed.checkout_type),
            "data": {
                "userId": user_id,
                "checkoutTime": checkout_time,
                "type": parsed.checkout_type,
            }
        }),
    )
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<MockState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = body.collect().await.map(|c| c.to_bytes()).unwrap_or_default();

    match (&parts.method, parts.uri.path()) {
        (&Method::POST, "/checkout") => {
            if !state.latency.is_zero() {
                tokio::time::sleep(state.latency).await;
            }
            Ok(checkout(&state, &body))
        }
        _ => Ok(Response::builder()
            .status(StatusCode::NOT_FOUND)
            .body(Full::new(Bytes::from("Not Found")))
            .expect("static response should not fail")),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let fail_status = args.fail_status.map(StatusCode::from_u16).transpose()?;
    let state = Arc::new(MockState {
        disabled: args.disabled_users.iter().copied().collect(),
        checked_out: Mutex::new(FxHashSet::default()),
        fail_status,
        latency: Duration::from_millis(args.latency_ms),
    });

    let listener = TcpListener::bind(("0.0.0.0", args.port)).await?;
    println!("[MOCK] Checkout service listening on port {}", args.port);
    if !args.disabled_users.is_empty() {
        println!("[MOCK] Auto checkout disabled for {:?}", args.disabled_users);
    }

    loop {
        let (stream, peer) = match listener.accept().await {
            Ok(conn) => conn,
            Err(e) => {
                eprintln!("[MOCK] Accept failed: {}", e);
                continue;
            }
        };

        let state = state.clone();
        tokio::spawn(async move {
            let service = service_fn(move |req| handle_request(req, state.clone()));
            if let Err(e) = http1::Builder::new().serve_connection(TokioIo::new(stream), service).await {
                eprintln!("[MOCK] Connection from {} failed: {}", peer, e);
            }
        });
    }
}
