use crate::state::AppState;
use axum::{
    extract::ws::{Message, WebSocket, WebSocketUpgrade},
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{delete, get, post},
    Json, Router,
};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, warn};
use viewer_core::{AccountKey, AccountRecord, AccountStatus};
use viewer_store::StoreError;
use viewer_terminal::{StartError, StopError};

pub fn api_routes() -> Router<Arc<AppState>> {
    Router::new()
        // Health
        .route("/health", get(health_check))
        // Accounts
        .route("/accounts", get(list_accounts))
        .route("/accounts", post(add_account))
        .route("/accounts/{platform}/{login}", delete(remove_account))
        .route("/accounts/{platform}/{login}/start", post(start_account))
        .route("/accounts/{platform}/{login}/stop", post(stop_account))
        // Running terminals
        .route("/terminals", get(list_terminals))
        // Inbound data relay (terminals post telemetry here)
        .route("/data", post(relay_data))
        .route("/data/ws", get(relay_stream))
}

// ---------------------------------------------------------------------------
// Health
// ---------------------------------------------------------------------------

async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ---------------------------------------------------------------------------
// Accounts
// ---------------------------------------------------------------------------

fn parse_key(platform: &str, login: String) -> Result<AccountKey, (StatusCode, Json<Value>)> {
    let platform = platform.parse().map_err(|err| {
        (
            StatusCode::BAD_REQUEST,
            Json(json!({"error": format!("{err}")})),
        )
    })?;
    Ok(AccountKey::new(platform, login))
}

fn store_failure(err: StoreError) -> (StatusCode, Json<Value>) {
    warn!(%err, "account store failure");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"error": format!("{err}")})),
    )
}

/// List persisted accounts with their status reconciled against the live
/// registry: an instance that died on its own may have a stale persisted
/// `running` flag, and the list is where the UI learns the truth.
async fn list_accounts(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let accounts = {
        let store = state.store.lock().await;
        match store.load() {
            Ok(accounts) => accounts,
            Err(err) => return store_failure(err).into_response(),
        }
    };

    let mut reconciled = Vec::with_capacity(accounts.len());
    for mut account in accounts {
        account.status = if state.supervisor.is_running(&account.key()).await {
            AccountStatus::Running
        } else {
            AccountStatus::Stopped
        };
        reconciled.push(account);
    }
    Json(reconciled).into_response()
}

async fn add_account(
    State(state): State<Arc<AppState>>,
    Json(record): Json<AccountRecord>,
) -> impl IntoResponse {
    let store = state.store.lock().await;
    match store.upsert(record) {
        Ok(accounts) => (StatusCode::CREATED, Json(accounts)).into_response(),
        Err(err) => store_failure(err).into_response(),
    }
}

/// Remove an account, stopping its terminal first if one is running.
async fn remove_account(
    State(state): State<Arc<AppState>>,
    Path((platform, login)): Path<(String, String)>,
) -> impl IntoResponse {
    let key = match parse_key(&platform, login) {
        Ok(key) => key,
        Err(rejection) => return rejection.into_response(),
    };

    if let Err(StopError::NotRunning(_)) = state.supervisor.stop(&key).await {
        debug!(%key, "no running terminal to stop before removal");
    }

    let store = state.store.lock().await;
    match store.remove(&key) {
        Ok(accounts) => Json(accounts).into_response(),
        Err(err) => store_failure(err).into_response(),
    }
}

async fn start_account(
    State(state): State<Arc<AppState>>,
    Path((platform, login)): Path<(String, String)>,
) -> impl IntoResponse {
    let key = match parse_key(&platform, login) {
        Ok(key) => key,
        Err(rejection) => return rejection.into_response(),
    };

    let store = state.store.lock().await;
    let record = match store.find(&key) {
        Ok(Some(record)) => record,
        Ok(None) => {
            return (
                StatusCode::NOT_FOUND,
                Json(json!({"error": format!("no account for {key}")})),
            )
                .into_response()
        }
        Err(err) => return store_failure(err).into_response(),
    };

    match state.supervisor.start(&record).await {
        Ok(launch_id) => {
            if let Err(err) = store.set_status(&key, AccountStatus::Running) {
                warn!(%key, %err, "failed to persist running status");
            }
            (
                StatusCode::OK,
                Json(json!({"status": "started", "key": key, "launch_id": launch_id})),
            )
                .into_response()
        }
        Err(err @ StartError::AlreadyRunning(_)) => (
            StatusCode::CONFLICT,
            Json(json!({"error": format!("{err}")})),
        )
            .into_response(),
        Err(err) => {
            // A failed start leaves the persisted status untouched.
            warn!(%key, %err, "terminal start failed");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": format!("{err}")})),
            )
                .into_response()
        }
    }
}

async fn stop_account(
    State(state): State<Arc<AppState>>,
    Path((platform, login)): Path<(String, String)>,
) -> impl IntoResponse {
    let key = match parse_key(&platform, login) {
        Ok(key) => key,
        Err(rejection) => return rejection.into_response(),
    };

    match state.supervisor.stop(&key).await {
        Ok(()) => {
            let store = state.store.lock().await;
            if let Err(err) = store.set_status(&key, AccountStatus::Stopped) {
                warn!(%key, %err, "failed to persist stopped status");
            }
            (
                StatusCode::OK,
                Json(json!({"status": "stopped", "key": key})),
            )
                .into_response()
        }
        Err(err @ StopError::NotRunning(_)) => (
            StatusCode::CONFLICT,
            Json(json!({"error": format!("{err}")})),
        )
            .into_response(),
    }
}

async fn list_terminals(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.supervisor.running().await)
}

// ---------------------------------------------------------------------------
// Inbound data relay
// ---------------------------------------------------------------------------

/// Terminals push telemetry here. The payload is forwarded untouched to
/// whoever is subscribed; it is never validated or inspected, and the
/// response is 200 regardless (the agent retries nothing).
async fn relay_data(State(state): State<Arc<AppState>>, Json(payload): Json<Value>) -> StatusCode {
    debug!("received terminal data");
    // No subscribers is fine; the payload is simply dropped.
    let _ = state.relay_tx.send(payload);
    StatusCode::OK
}

/// Stream relayed payloads to a presentation-layer subscriber.
async fn relay_stream(
    State(state): State<Arc<AppState>>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let rx = state.relay_tx.subscribe();
    ws.on_upgrade(move |socket| forward_relay(socket, rx))
}

async fn forward_relay(mut socket: WebSocket, mut rx: broadcast::Receiver<Value>) {
    loop {
        match rx.recv().await {
            Ok(payload) => {
                let Ok(text) = serde_json::to_string(&payload) else {
                    continue;
                };
                if socket.send(Message::Text(text.into())).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "relay subscriber lagging, payloads dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build_router;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use std::os::unix::fs::PermissionsExt;
    use std::path::PathBuf;
    use tempfile::TempDir;
    use tower::ServiceExt;
    use viewer_core::Platform;
    use viewer_store::AccountStore;
    use viewer_terminal::{Supervisor, WorkspaceBuilder};

    fn test_state(tmp: &TempDir) -> Arc<AppState> {
        let builder = WorkspaceBuilder::new(tmp.path().join("resources"), 3001)
            .with_temp_root(tmp.path().join("work"));
        let supervisor = Supervisor::new(builder);
        let store = AccountStore::new(tmp.path().join("accounts.json"));
        Arc::new(AppState::new(store, supervisor))
    }

    fn write_script(tmp: &TempDir) -> PathBuf {
        let path = tmp.path().join("terminal.sh");
        std::fs::write(&path, "#!/bin/sh\nsleep 30\n").unwrap();
        let mut perms = std::fs::metadata(&path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn json_request(method: &str, uri: &str, body: Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn empty_request(method: &str, uri: &str) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn account_json(login: &str, terminal_path: &std::path::Path) -> Value {
        json!({
            "platform": "mt4",
            "login": login,
            "password": "p",
            "server": "Broker-Demo",
            "terminal_path": terminal_path,
        })
    }

    #[tokio::test]
    async fn health_reports_ok() {
        let tmp = TempDir::new().unwrap();
        let app = build_router(test_state(&tmp));

        let response = app.oneshot(empty_request("GET", "/api/health")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["status"], "ok");
    }

    #[tokio::test]
    async fn relay_accepts_arbitrary_json_and_broadcasts_it() {
        let tmp = TempDir::new().unwrap();
        let state = test_state(&tmp);
        let mut rx = state.relay_tx.subscribe();
        let app = build_router(Arc::clone(&state));

        let payload = json!({"balance": 10000.5, "anything": ["goes", null]});
        let response = app
            .oneshot(json_request("POST", "/api/data", payload.clone()))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(rx.try_recv().unwrap(), payload);
    }

    #[tokio::test]
    async fn add_and_list_accounts() {
        let tmp = TempDir::new().unwrap();
        let state = test_state(&tmp);

        let response = build_router(Arc::clone(&state))
            .oneshot(json_request(
                "POST",
                "/api/accounts",
                account_json("123", &PathBuf::from("/opt/mt4/terminal.exe")),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = build_router(state)
            .oneshot(empty_request("GET", "/api/accounts"))
            .await
            .unwrap();
        let accounts = body_json(response).await;
        assert_eq!(accounts.as_array().unwrap().len(), 1);
        assert_eq!(accounts[0]["login"], "123");
        assert_eq!(accounts[0]["status"], "stopped");
    }

    #[tokio::test]
    async fn start_unknown_account_is_not_found() {
        let tmp = TempDir::new().unwrap();
        let app = build_router(test_state(&tmp));

        let response = app
            .oneshot(empty_request("POST", "/api/accounts/mt4/404/start"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn bad_platform_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let app = build_router(test_state(&tmp));

        let response = app
            .oneshot(empty_request("POST", "/api/accounts/mt9/1/start"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn stop_without_running_terminal_conflicts() {
        let tmp = TempDir::new().unwrap();
        let app = build_router(test_state(&tmp));

        let response = app
            .oneshot(empty_request("POST", "/api/accounts/mt4/1/stop"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn full_lifecycle_over_http() {
        let tmp = TempDir::new().unwrap();
        let state = test_state(&tmp);
        let script = write_script(&tmp);
        let key = AccountKey::new(Platform::Mt4, "55");

        let response = build_router(Arc::clone(&state))
            .oneshot(json_request("POST", "/api/accounts", account_json("55", &script)))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CREATED);

        let response = build_router(Arc::clone(&state))
            .oneshot(empty_request("POST", "/api/accounts/mt4/55/start"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(state.supervisor.is_running(&key).await);

        // Second start conflicts while the first is alive.
        let response = build_router(Arc::clone(&state))
            .oneshot(empty_request("POST", "/api/accounts/mt4/55/start"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);

        let response = build_router(Arc::clone(&state))
            .oneshot(empty_request("GET", "/api/terminals"))
            .await
            .unwrap();
        assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

        // Removal stops the terminal first.
        let response = build_router(Arc::clone(&state))
            .oneshot(empty_request("DELETE", "/api/accounts/mt4/55"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert!(!state.supervisor.is_running(&key).await);
        assert!(state.store.lock().await.load().unwrap().is_empty());
    }
}
