//! HTTP Surface: `/json/version`, `/json/list`,
//! `/json/attach/<id>`, and the `/extension` / `/cdp` WebSocket upgrades.
//! An `axum::Router` with one `State<Arc<Instance>>` extractor per route,
//! fanning out into the registry/hub/extension-link split instead of one
//! shared lock.

use std::sync::Arc;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};

use crate::error::{RelayError, Result};
use crate::instance::Instance;
use crate::protocol::CdpClientFrame;

pub fn build_router(instance: Arc<Instance>) -> Router {
    Router::new()
        .route("/json/version", get(json_version))
        .route("/json/list", get(json_list))
        .route("/json/attach/:id", post(json_attach))
        .route("/extension", get(extension_upgrade))
        .route("/cdp", get(cdp_upgrade))
        .with_state(instance)
}

fn check_http_auth(instance: &Instance, headers: &HeaderMap) -> Result<()> {
    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    if instance.token.matches_header(header) {
        Ok(())
    } else {
        Err(RelayError::Unauthorized)
    }
}

/// `/json/version` response shape. `web_socket_debugger_url` is omitted
/// entirely (not emitted as `null`) when no extension is connected.
#[derive(serde::Serialize)]
struct VersionResponse {
    #[serde(rename = "Browser")]
    browser: &'static str,
    #[serde(rename = "Protocol-Version")]
    protocol_version: &'static str,
    #[serde(rename = "webSocketDebuggerUrl", skip_serializing_if = "Option::is_none")]
    web_socket_debugger_url: Option<String>,
}

async fn json_version(
    State(instance): State<Arc<Instance>>,
    headers: HeaderMap,
) -> std::result::Result<Json<serde_json::Value>, RelayError> {
    check_http_auth(&instance, &headers)?;

    let ws_url = instance.extension.is_connected().then(|| instance.cdp_ws_url());
    Ok(Json(serde_json::to_value(VersionResponse {
        browser: "CDP-Relay/1.0.0",
        protocol_version: "1.3",
        web_socket_debugger_url: ws_url,
    })?))
}

async fn json_list(
    State(instance): State<Arc<Instance>>,
    headers: HeaderMap,
) -> std::result::Result<Json<serde_json::Value>, RelayError> {
    check_http_auth(&instance, &headers)?;

    let ws_url = instance.cdp_ws_url();
    let entries = instance.registry.list(|_session_id| Some(ws_url.clone()));
    Ok(Json(serde_json::to_value(entries)?))
}

async fn json_attach(
    State(instance): State<Arc<Instance>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> std::result::Result<Json<serde_json::Value>, RelayError> {
    check_http_auth(&instance, &headers)?;

    if instance.is_shutting_down() {
        return Err(RelayError::Shutdown);
    }

    let Some(tab_id_str) = id.strip_prefix("dtab-") else {
        return Err(RelayError::bad_request(format!(
            "attach id must start with 'dtab-': {id}"
        )));
    };
    let tab_id: u64 = tab_id_str
        .parse()
        .map_err(|_| RelayError::bad_request(format!("invalid tab id in {id}")))?;

    if !instance.extension.is_connected() {
        return Err(RelayError::ExtensionUnavailable);
    }

    info!(tab_id, "driver requested attach of discovered tab");

    let attach_timeout = instance.config.attach_timeout;

    // PendingAttach: the RPC result and the corresponding
    // `Target.attachedToTarget` event can arrive in either order; whichever
    // comes first is remembered, the second completes the request. Both legs
    // together are bounded by `attach_timeout`, not just the second one.
    let attach = async {
        let call_result = instance
            .extension
            .call("attachDiscoveredTab", json!({ "tabId": tab_id }))
            .await?;

        let target_id = call_result
            .get("targetId")
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                RelayError::ExtensionProtocol("attachDiscoveredTab reply missing targetId".into())
            })?
            .to_string();

        instance
            .registry
            .wait_for_attach(&target_id, attach_timeout)
            .await
    };

    let attached = match tokio::time::timeout(attach_timeout, attach).await {
        Ok(result) => result?,
        Err(_) => {
            return Err(RelayError::Timeout {
                timeout_ms: attach_timeout.as_millis() as u64,
            })
        }
    };

    Ok(Json(json!({
        "targetId": attached.target_id,
        "sessionId": attached.session_id,
    })))
}

async fn extension_upgrade(
    State(instance): State<Arc<Instance>>,
    ws: WebSocketUpgrade,
) -> Response {
    if instance.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "relay shutting down").into_response();
    }
    // Not token-gated: the extension has no channel to receive
    // the token through, and is protected by loopback binding instead.
    ws.on_upgrade(move |socket| async move {
        instance.extension.clone().accept(socket).await;
    })
}

#[derive(Debug, Deserialize)]
struct CdpUpgradeQuery {
    token: Option<String>,
}

async fn cdp_upgrade(
    State(instance): State<Arc<Instance>>,
    headers: HeaderMap,
    Query(query): Query<CdpUpgradeQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    if instance.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "relay shutting down").into_response();
    }

    let header = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok());
    let authorized =
        instance.token.matches_header(header) || instance.token.matches_query(query.token.as_deref());
    if !authorized {
        return (StatusCode::UNAUTHORIZED, "missing or invalid bearer token").into_response();
    }

    ws.on_upgrade(move |socket| handle_cdp_client(instance, socket))
}

async fn handle_cdp_client(instance: Arc<Instance>, socket: WebSocket) {
    let registration = instance.hub.register(instance.config.write_queue_cap);
    let socket_id = registration.socket_id;
    let mut rx = registration.rx;
    let force_close = registration.force_close;

    let (mut sink, mut stream) = socket.split();

    let writer_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = force_close.notified() => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: 1013,
                            reason: "write queue overflow".into(),
                        })))
                        .await;
                    break;
                }
                msg = rx.recv() => {
                    match msg {
                        Some(m) => {
                            if sink.send(m).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
            }
        }
    });

    info!(%socket_id, "CDP client connected");
    instance.router.replay_attached_to(socket_id);

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                // Each frame is dispatched on its own task: a bug or panic
                // handling one client's frame must not affect another.
                let instance = instance.clone();
                tokio::spawn(async move {
                    dispatch_frame(instance, socket_id, &text).await;
                });
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, %socket_id, "CDP client websocket error");
                break;
            }
        }
    }

    instance.hub.unregister(socket_id);
    writer_task.abort();
    info!(%socket_id, "CDP client disconnected");
}

async fn dispatch_frame(instance: Arc<Instance>, socket_id: crate::hub::SocketId, text: &str) {
    match serde_json::from_str::<CdpClientFrame>(text) {
        Ok(frame) => instance.router.handle_frame(socket_id, frame).await,
        Err(e) => {
            warn!(error = %e, frame = %text, "malformed CDP client frame, dropping");
            // No `id` could be parsed out, so there is nothing to reply to;
            // log-and-drop
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RelayConfig;

    fn test_instance() -> Arc<Instance> {
        Arc::new(Instance::new(RelayConfig::from_cdp_url("http://127.0.0.1:0").unwrap()))
    }

    #[test]
    fn auth_rejects_missing_header() {
        let instance = test_instance();
        let headers = HeaderMap::new();
        assert!(matches!(
            check_http_auth(&instance, &headers),
            Err(RelayError::Unauthorized)
        ));
    }

    #[test]
    fn auth_accepts_matching_bearer_header() {
        let instance = test_instance();
        let mut headers = HeaderMap::new();
        headers.insert(
            axum::http::header::AUTHORIZATION,
            format!("Bearer {}", instance.token).parse().unwrap(),
        );
        assert!(check_http_auth(&instance, &headers).is_ok());
    }
}
