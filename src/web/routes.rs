//! HTTP route handlers for the session gateway.
//!
//! Thin layer over `SessionManager`: request validation and status mapping
//! live here, all lifecycle logic stays in the core.

use std::sync::Arc;

use axum::{
    extract::{Extension, Json, Path},
    http::StatusCode,
    middleware,
    response::IntoResponse,
    routing::{get, post},
    Router,
};
use serde_json::json;
use tracing::info;

use crate::session::SessionError;
use crate::AppState;

/// Build the API router with all endpoints.
pub fn api_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/sessions/:user_id/start", post(start_session))
        .route("/sessions/:user_id/qr", get(get_qr))
        .route("/sessions/:user_id/status", get(get_status))
        .route("/sessions/:user_id/send", post(send_message))
        .route("/sessions/:user_id/logout", post(logout_session))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            super::auth::api_key_middleware,
        ))
        .layer(Extension(state))
}

async fn start_session(
    Extension(state): Extension<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    info!("[Web] start requested for {}", user_id);
    let snapshot = state.manager.start(&user_id).await;
    Json(json!({ "ok": true, "status": snapshot.status }))
}

async fn get_qr(
    Extension(state): Extension<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    state.manager.registry().touch(&user_id);
    let snapshot = state.manager.registry().snapshot(&user_id).await;
    Json(json!({
        "ok": true,
        "status": snapshot.status,
        "qr": snapshot.qr,
        "identity": snapshot.identity,
        "error": snapshot.error,
    }))
}

async fn get_status(
    Extension(state): Extension<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    state.manager.registry().touch(&user_id);
    let snapshot = state.manager.registry().snapshot(&user_id).await;
    Json(json!({
        "ok": true,
        "status": snapshot.status,
        "identity": snapshot.identity,
        "error": snapshot.error,
    }))
}

#[derive(serde::Deserialize, Default)]
struct SendRequest {
    to: Option<String>,
    message: Option<String>,
}

async fn send_message(
    Extension(state): Extension<Arc<AppState>>,
    Path(user_id): Path<String>,
    Json(req): Json<SendRequest>,
) -> impl IntoResponse {
    let to = req.to.filter(|s| !s.is_empty());
    let message = req.message.filter(|s| !s.is_empty());
    let (to, message) = match (to, message) {
        (Some(to), Some(message)) => (to, message),
        _ => {
            return (
                StatusCode::UNPROCESSABLE_ENTITY,
                Json(json!({ "ok": false, "error": "`to` and `message` are required" })),
            )
                .into_response()
        }
    };

    match state.manager.send(&user_id, &to, &message).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(SessionError::NotConnected { status }) => (
            StatusCode::CONFLICT,
            Json(json!({
                "ok": false,
                "error": format!("session not connected (status: {status})"),
                "status": status,
            })),
        )
            .into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "ok": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

async fn logout_session(
    Extension(state): Extension<Arc<AppState>>,
    Path(user_id): Path<String>,
) -> impl IntoResponse {
    info!("[Web] logout requested for {}", user_id);
    match state.manager.logout(&user_id).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "ok": false, "error": e.to_string() })),
        )
            .into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mock::MockFactory;
    use crate::protocol::ProtocolEvent;
    use crate::supervisor::recovery::ProfileRecovery;
    use crate::AppConfig;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::Request;
    use std::time::Duration;
    use tower::ServiceExt;

    struct NoopRecovery;

    #[async_trait]
    impl ProfileRecovery for NoopRecovery {
        async fn recover_locked_storage(&self, _path: &std::path::Path) {}
    }

    struct TestApp {
        router: Router,
        state: Arc<AppState>,
        factory: Arc<MockFactory>,
        _storage: tempfile::TempDir,
    }

    fn test_app(api_key: &str) -> TestApp {
        let storage = tempfile::tempdir().unwrap();
        let mut config = AppConfig::for_tests(storage.path());
        config.api_key = api_key.to_string();
        let factory = Arc::new(MockFactory::new());
        let state = Arc::new(AppState::new(
            config,
            factory.clone(),
            Arc::new(NoopRecovery),
        ));
        TestApp {
            router: api_router(state.clone()),
            state,
            factory,
            _storage: storage,
        }
    }

    async fn call(
        app: &TestApp,
        method: &str,
        uri: &str,
        key: Option<&str>,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, serde_json::Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(key) = key {
            builder = builder.header(super::super::auth::API_KEY_HEADER, key);
        }
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            serde_json::Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null)
        };
        (status, value)
    }

    async fn wait_for_connect(factory: &Arc<MockFactory>) {
        for _ in 0..200 {
            if factory.connect_count() >= 1 {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("client never constructed");
    }

    #[tokio::test]
    async fn requests_without_key_are_rejected() {
        let app = test_app("secret");
        let (status, _) = call(&app, "GET", "/sessions/u1/status", None, None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        let (status, _) = call(&app, "GET", "/sessions/u1/status", Some("wrong"), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn empty_configured_key_fails_closed() {
        let app = test_app("");
        let (status, _) = call(&app, "GET", "/sessions/u1/status", Some(""), None).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn start_then_qr_roundtrip() {
        let app = test_app("secret");
        let (status, body) =
            call(&app, "POST", "/sessions/u1/start", Some("secret"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["status"], "starting");

        wait_for_connect(&app.factory).await;
        app.factory
            .last_sender()
            .send(ProtocolEvent::Qr("2@challenge".to_string()))
            .await
            .unwrap();
        for _ in 0..200 {
            if app.state.manager.registry().snapshot("u1").await.qr.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (status, body) = call(&app, "GET", "/sessions/u1/qr", Some("secret"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["ok"], true);
        assert_eq!(body["status"], "awaiting_scan");
        assert!(body["qr"].is_string());
        assert!(body["identity"].is_null());
        assert!(body["error"].is_null());
    }

    #[tokio::test]
    async fn send_on_ready_session_normalizes_recipient() {
        let app = test_app("secret");
        app.state.manager.ensure_client("u1").await.unwrap();
        app.factory
            .last_sender()
            .send(ProtocolEvent::Ready {
                self_id: "14155550100:1@c.us".to_string(),
            })
            .await
            .unwrap();
        for _ in 0..200 {
            let snap = app.state.manager.registry().snapshot("u1").await;
            if snap.status == crate::session::SessionStatus::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let (status, body) = call(
            &app,
            "POST",
            "/sessions/u1/send",
            Some("secret"),
            Some(json!({ "to": "555-1234", "message": "hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));

        let sent = app.factory.last_client().sent.lock().unwrap().clone();
        assert_eq!(sent, vec![("5551234@c.us".to_string(), "hi".to_string())]);
    }

    #[tokio::test]
    async fn send_while_idle_conflicts_with_status() {
        let app = test_app("secret");
        let (status, body) = call(
            &app,
            "POST",
            "/sessions/u1/send",
            Some("secret"),
            Some(json!({ "to": "555", "message": "hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["ok"], false);
        assert_eq!(body["status"], "idle");
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn send_with_missing_fields_is_unprocessable() {
        let app = test_app("secret");
        let (status, body) = call(
            &app,
            "POST",
            "/sessions/u1/send",
            Some("secret"),
            Some(json!({ "to": "555" })),
        )
        .await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(body["ok"], false);
    }

    #[tokio::test]
    async fn send_failure_maps_to_internal_error() {
        let app = test_app("secret");
        app.state.manager.ensure_client("u1").await.unwrap();
        app.factory
            .last_sender()
            .send(ProtocolEvent::Ready {
                self_id: "1:1@c.us".to_string(),
            })
            .await
            .unwrap();
        for _ in 0..200 {
            let snap = app.state.manager.registry().snapshot("u1").await;
            if snap.status == crate::session::SessionStatus::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        app.factory
            .last_client()
            .fail_send
            .store(true, std::sync::atomic::Ordering::Relaxed);

        let (status, body) = call(
            &app,
            "POST",
            "/sessions/u1/send",
            Some("secret"),
            Some(json!({ "to": "555", "message": "hi" })),
        )
        .await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body["ok"], false);
        assert!(body["error"].is_string());
    }

    #[tokio::test]
    async fn logout_roundtrip_is_ok_and_idempotent() {
        let app = test_app("secret");
        app.state.manager.ensure_client("u1").await.unwrap();

        let (status, body) =
            call(&app, "POST", "/sessions/u1/logout", Some("secret"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));

        let (status, body) =
            call(&app, "POST", "/sessions/u1/logout", Some("secret"), None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({ "ok": true }));

        let (_, body) = call(&app, "GET", "/sessions/u1/status", Some("secret"), None).await;
        assert_eq!(body["status"], "idle");
    }
}
