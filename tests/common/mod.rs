//! Shared fixtures: ephemeral-port HTTP stand-ins for the upstream services
//! and key-material helpers.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::{Form, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use base64::Engine;
use russh::keys::ssh_key::rand_core::OsRng;
use russh::keys::ssh_key::{Algorithm, LineEnding};
use russh::keys::PrivateKey;
use serde_json::{json, Value};
use tokio::net::TcpListener;

pub fn generate_key() -> PrivateKey {
    PrivateKey::random(&mut OsRng, Algorithm::Ed25519).unwrap()
}

pub fn openssh_encode(key: &PrivateKey) -> String {
    key.to_openssh(LineEnding::LF).unwrap().to_string()
}

async fn serve(app: Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{addr}")
}

#[derive(Clone)]
struct StateServiceState {
    desired_body: Value,
    actual_body: Value,
    requests: Arc<AtomicUsize>,
}

async fn desired_handler(State(state): State<StateServiceState>) -> Json<Value> {
    state.requests.fetch_add(1, Ordering::SeqCst);
    Json(state.desired_body.clone())
}

async fn actual_handler(State(state): State<StateServiceState>) -> Json<Value> {
    state.requests.fetch_add(1, Ordering::SeqCst);
    Json(state.actual_body.clone())
}

async fn not_found_handler(State(state): State<StateServiceState>) -> StatusCode {
    state.requests.fetch_add(1, Ordering::SeqCst);
    StatusCode::NOT_FOUND
}

/// Cluster state stand-in answering desired/actual lookups for one process
/// guid; every other path counts and returns 404.
pub async fn start_state_service(
    process_guid: &str,
    ssh_route: Value,
    instance: Value,
) -> (String, Arc<AtomicUsize>) {
    let requests = Arc::new(AtomicUsize::new(0));
    let state = StateServiceState {
        desired_body: json!({
            "process_guid": process_guid,
            "instances": 1,
            "routes": { "diego-ssh": ssh_route },
        }),
        actual_body: instance,
        requests: requests.clone(),
    };

    let app = Router::new()
        .route(
            &format!("/v1/desired_lrps/{process_guid}"),
            get(desired_handler),
        )
        .route(
            &format!("/v1/actual_lrps/{process_guid}/index/0"),
            get(actual_handler),
        )
        .fallback(not_found_handler)
        .with_state(state);

    (serve(app).await, requests)
}

/// The canonical instance record used across tests: one instance at
/// 127.0.0.1 with a single container-port mapping.
pub fn instance_record(process_guid: &str, container_port: u16, host_port: u16) -> Value {
    json!({
        "process_guid": process_guid,
        "index": 0,
        "instance_guid": "some-instance-guid",
        "address": "127.0.0.1",
        "ports": [ { "container_port": container_port, "host_port": host_port } ],
    })
}

#[derive(Clone)]
struct AppServiceState {
    expected_authorization: String,
    response: Option<Value>,
    requests: Arc<AtomicUsize>,
}

async fn ssh_access_handler(
    State(state): State<AppServiceState>,
    headers: HeaderMap,
) -> (StatusCode, Json<Value>) {
    state.requests.fetch_add(1, Ordering::SeqCst);

    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if authorization != state.expected_authorization {
        return (StatusCode::UNAUTHORIZED, Json(Value::Null));
    }

    match &state.response {
        Some(body) => (StatusCode::OK, Json(body.clone())),
        None => (StatusCode::NOT_FOUND, Json(Value::Null)),
    }
}

/// App authorization stand-in for one app guid. `process_guid: None` makes
/// the app unknown (404); a wrong Authorization header yields 401.
pub async fn start_app_service(
    app_guid: &str,
    expected_authorization: &str,
    process_guid: Option<&str>,
) -> (String, Arc<AtomicUsize>) {
    let requests = Arc::new(AtomicUsize::new(0));
    let state = AppServiceState {
        expected_authorization: expected_authorization.to_string(),
        response: process_guid.map(|guid| json!({ "process_guid": guid })),
        requests: requests.clone(),
    };

    let app = Router::new()
        .route(
            &format!("/internal/apps/{app_guid}/ssh_access"),
            get(ssh_access_handler),
        )
        .with_state(state);

    (serve(app).await, requests)
}

#[derive(Clone)]
struct TokenServiceState {
    expected_basic: String,
    username: String,
    password: String,
    requests: Arc<AtomicUsize>,
}

async fn oauth_token_handler(
    State(state): State<TokenServiceState>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, Json<Value>) {
    state.requests.fetch_add(1, Ordering::SeqCst);

    let authorization = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();

    let credentials_ok = authorization == state.expected_basic
        && form.get("grant_type").map(String::as_str) == Some("password")
        && form.get("username") == Some(&state.username)
        && form.get("password") == Some(&state.password);

    if credentials_ok {
        (
            StatusCode::OK,
            Json(json!({ "access_token": "access-token", "token_type": "bearer" })),
        )
    } else {
        (StatusCode::UNAUTHORIZED, Json(Value::Null))
    }
}

/// Token exchange stand-in honoring one (client, user) credential pair with
/// the fixed token `bearer access-token`.
pub async fn start_token_service(
    client_id: &str,
    client_secret: &str,
    username: &str,
    password: &str,
) -> (String, Arc<AtomicUsize>) {
    let requests = Arc::new(AtomicUsize::new(0));
    let encoded =
        base64::engine::general_purpose::STANDARD.encode(format!("{client_id}:{client_secret}"));
    let state = TokenServiceState {
        expected_basic: format!("Basic {encoded}"),
        username: username.to_string(),
        password: password.to_string(),
        requests: requests.clone(),
    };

    let app = Router::new()
        .route("/oauth/token", post(oauth_token_handler))
        .with_state(state);

    (serve(app).await, requests)
}
