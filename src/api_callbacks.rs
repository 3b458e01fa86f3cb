//! Notification endpoints for the RTMP media server.
//!
//! nginx-rtmp (`on_connect`, `on_publish`, ...) posts a form-encoded body
//! with at least `app`, `name` and `addr`. The stream name doubles as the
//! camera id. Every callback answers 200: any other status makes the media
//! server drop the client.

use std::convert::Infallible;

use axum::async_trait;
use axum::body::Bytes;
use axum::extract::{FromRequest, Request, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use tracing::{error, info, warn};

use crate::errors::Result;
use crate::handlers::ApiResponse;
use crate::utils::parse_stream_name;
use crate::AppState;

#[derive(Debug, Default, Clone, PartialEq, utoipa::ToSchema)]
pub struct CallbackPayload {
    pub app: String,
    pub name: String,
    pub addr: String,
}

impl CallbackPayload {
    fn set(&mut self, key: &str, value: String) {
        match key {
            "app" => self.app = value,
            "name" => self.name = value,
            "addr" => self.addr = value,
            _ => {}
        }
    }

    fn from_form(body: &[u8]) -> Self {
        let mut payload = Self::default();
        for (key, value) in url::form_urlencoded::parse(body) {
            payload.set(&key, value.into_owned());
        }
        payload
    }

    fn from_json(body: &[u8]) -> Self {
        let mut payload = Self::default();
        let Ok(serde_json::Value::Object(map)) = serde_json::from_slice::<serde_json::Value>(body) else {
            return payload;
        };
        for (key, value) in map {
            let value = match value {
                serde_json::Value::String(s) => s,
                serde_json::Value::Null => continue,
                other => other.to_string(),
            };
            payload.set(&key, value);
        }
        payload
    }
}

#[async_trait]
impl<S> FromRequest<S> for CallbackPayload
where
    S: Send + Sync,
{
    type Rejection = Infallible;

    async fn from_request(req: Request, state: &S) -> std::result::Result<Self, Self::Rejection> {
        let is_json = req
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .map(|value| value.starts_with("application/json"))
            .unwrap_or(false);

        let body = match Bytes::from_request(req, state).await {
            Ok(body) => body,
            Err(e) => {
                warn!("Unreadable callback body: {}", e);
                return Ok(Self::default());
            }
        };

        Ok(if is_json {
            Self::from_json(&body)
        } else {
            Self::from_form(&body)
        })
    }
}

fn reply(result: Result<()>, callback: &str) -> Response {
    match result {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::status("OK"))).into_response(),
        Err(e) => {
            error!("Error in {} callback: {}", callback, e);
            (StatusCode::OK, Json(ApiResponse::status("Error"))).into_response()
        }
    }
}

/// Record the publish state carried by a callback. Unknown or non-numeric
/// stream names are not errors.
async fn set_published(state: &AppState, stream_name: &str, active: bool) -> Result<()> {
    let Some(camera_id) = parse_stream_name(stream_name) else {
        warn!("Non-numeric stream name: {}", stream_name);
        return Ok(());
    };

    match state.database.set_active(camera_id, active).await {
        Ok(()) => {
            info!(camera_id, "Camera {} marked as {}", camera_id, if active { "active" } else { "inactive" });
            Ok(())
        }
        Err(e) if e.is_not_found() => {
            warn!(camera_id, "Camera with ID {} not found", camera_id);
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Client connected
#[utoipa::path(
    post,
    path = "/stream/on_connect",
    tag = "stream callbacks",
    request_body(content = CallbackPayload, content_type = "application/x-www-form-urlencoded"),
    responses((status = 200, description = "Acknowledged", body = ApiResponse,
        example = json!({"status": "OK"})))
)]
pub async fn on_connect(payload: CallbackPayload) -> Response {
    info!("RTMP connect - app: {}, name: {}, addr: {}", payload.app, payload.name, payload.addr);
    reply(Ok(()), "on_connect")
}

/// Publishing started; a numeric stream name marks that camera active
#[utoipa::path(
    post,
    path = "/stream/on_publish",
    tag = "stream callbacks",
    request_body(content = CallbackPayload, content_type = "application/x-www-form-urlencoded"),
    responses((status = 200, description = "Always 200; `Error` when the update failed", body = ApiResponse,
        example = json!({"status": "OK"})))
)]
pub async fn on_publish(State(state): State<AppState>, payload: CallbackPayload) -> Response {
    info!("Stream publish started - app: {}, name: {}, addr: {}", payload.app, payload.name, payload.addr);
    reply(set_published(&state, &payload.name, true).await, "on_publish")
}

/// Publishing ended; a numeric stream name marks that camera inactive
#[utoipa::path(
    post,
    path = "/stream/on_publish_done",
    tag = "stream callbacks",
    request_body(content = CallbackPayload, content_type = "application/x-www-form-urlencoded"),
    responses((status = 200, description = "Always 200; `Error` when the update failed", body = ApiResponse,
        example = json!({"status": "OK"})))
)]
pub async fn on_publish_done(State(state): State<AppState>, payload: CallbackPayload) -> Response {
    info!("Stream publish ended - app: {}, name: {}, addr: {}", payload.app, payload.name, payload.addr);
    reply(set_published(&state, &payload.name, false).await, "on_publish_done")
}

/// Playback started
#[utoipa::path(
    post,
    path = "/stream/on_play",
    tag = "stream callbacks",
    request_body(content = CallbackPayload, content_type = "application/x-www-form-urlencoded"),
    responses((status = 200, description = "Acknowledged", body = ApiResponse,
        example = json!({"status": "OK"})))
)]
pub async fn on_play(payload: CallbackPayload) -> Response {
    info!("Stream play started - app: {}, name: {}, addr: {}", payload.app, payload.name, payload.addr);
    reply(Ok(()), "on_play")
}

/// Client finished
#[utoipa::path(
    post,
    path = "/stream/on_done",
    tag = "stream callbacks",
    request_body(content = CallbackPayload, content_type = "application/x-www-form-urlencoded"),
    responses((status = 200, description = "Acknowledged", body = ApiResponse,
        example = json!({"status": "OK"})))
)]
pub async fn on_done(payload: CallbackPayload) -> Response {
    info!("Stream done - app: {}, name: {}, addr: {}", payload.app, payload.name, payload.addr);
    reply(Ok(()), "on_done")
}

#[cfg(test)]
mod tests {
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use serde_json::json;

    use std::sync::Arc;

    use super::CallbackPayload;
    use crate::camera::CameraFields;
    use crate::config::{Config, StreamingConfig};
    use crate::database::{DatabaseProvider, SqliteDatabase};
    use crate::handlers::build_router;
    use crate::handlers::test_support::*;
    use crate::stream_manager::StreamManager;
    use crate::AppState;

    fn form_request(uri: &str, body: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    #[test]
    fn parses_form_and_json_bodies() {
        let form = CallbackPayload::from_form(b"call=publish&app=live&name=12&addr=10.0.0.9&tcurl=rtmp%3A%2F%2Fx");
        assert_eq!(form, CallbackPayload {
            app: "live".to_string(),
            name: "12".to_string(),
            addr: "10.0.0.9".to_string(),
        });

        let json = CallbackPayload::from_json(br#"{"app": "live", "name": 12, "addr": null}"#);
        assert_eq!(json.name, "12");
        assert_eq!(json.addr, "");

        assert_eq!(CallbackPayload::from_json(b"not json"), CallbackPayload::default());
    }

    #[tokio::test]
    async fn publish_and_publish_done_toggle_active() {
        let app = test_app().await;
        let camera = app.state.database
            .create_camera(&CameraFields::new("Porch", "10.0.0.2"))
            .await
            .unwrap();

        let body = format!("app=live&name={}&addr=10.0.0.2", camera.id);
        let (status, reply) = send(&app.router, form_request("/api/stream/on_publish", &body)).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(reply, json!({"status": "OK"}));
        assert!(app.state.database.get_camera(camera.id).await.unwrap().is_active());

        let (status, _) = send(&app.router, json_request(
            "POST",
            "/api/stream/on_publish_done/",
            json!({"app": "live", "name": camera.id.to_string()}),
        )).await;
        assert_eq!(status, StatusCode::OK);
        assert!(!app.state.database.get_camera(camera.id).await.unwrap().is_active());
    }

    #[tokio::test]
    async fn unknown_and_non_numeric_streams_still_succeed() {
        let app = test_app().await;

        for body in ["app=live&name=4242", "app=live&name=stream1", ""] {
            let (status, reply) = send(&app.router, form_request("/api/stream/on_publish", body)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(reply, json!({"status": "OK"}));
        }
    }

    #[tokio::test]
    async fn database_failure_replies_error_with_200() {
        // No schema: every camera update fails inside sqlx
        let db = SqliteDatabase::in_memory().await.unwrap();
        let database: Arc<dyn DatabaseProvider> = Arc::new(db);
        let stream_manager = Arc::new(StreamManager::new(database.clone(), StreamingConfig::default()).unwrap());
        let router = build_router(AppState { database, stream_manager }, &Config::default());

        for uri in ["/api/stream/on_publish", "/api/stream/on_publish_done/"] {
            let (status, reply) = send(&router, form_request(uri, "app=live&name=1&addr=10.0.0.2")).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
            assert_eq!(reply, json!({"status": "Error"}));
        }
    }

    #[tokio::test]
    async fn informational_callbacks_reply_ok() {
        let app = test_app().await;
        for uri in ["/api/stream/on_connect", "/api/stream/on_play", "/api/stream/on_done/"] {
            let (status, reply) = send(&app.router, form_request(uri, "app=live&name=1&addr=1.2.3.4")).await;
            assert_eq!(status, StatusCode::OK, "{uri}");
            assert_eq!(reply, json!({"status": "OK"}));
        }
    }
}
