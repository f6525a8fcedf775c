//! Extension Link: the single WebSocket to the
//! extension. Owns outbound RPC id allocation, the pending-reply table, the
//! liveness ping, and demuxing of inbound extension messages into registry
//! mutations / CDP broadcasts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::hub::CdpSessionHub;
use crate::protocol::{self, ExtensionInbound, ForwardedCdpEvent, TabRemovedParams, TabUpdatedParams, TargetInfo};
use crate::registry::{DiscoveredTab, RegistryEvent, TargetRegistry};

type ReplyResult = std::result::Result<Value, (i32, String)>;

struct ExtensionHandle {
    outbound: mpsc::Sender<Message>,
    pending: Mutex<HashMap<u64, oneshot::Sender<ReplyResult>>>,
    next_id: AtomicU64,
    missed_pongs: AtomicU32,
    generation: u64,
}

/// Close code used to reject a second concurrent extension connection.
pub const ALREADY_CONNECTED_CLOSE_CODE: u16 = 4001;

pub struct ExtensionLink {
    registry: Arc<TargetRegistry>,
    hub: Arc<CdpSessionHub>,
    config: RelayConfig,
    slot: Mutex<Option<Arc<ExtensionHandle>>>,
    generation_counter: AtomicU64,
}

impl ExtensionLink {
    pub fn new(registry: Arc<TargetRegistry>, hub: Arc<CdpSessionHub>, config: RelayConfig) -> Self {
        Self {
            registry,
            hub,
            config,
            slot: Mutex::new(None),
            generation_counter: AtomicU64::new(0),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.slot.lock().unwrap().is_some()
    }

    /// Issue an outbound RPC to the extension and await its reply, subject
    /// to the configured timeout.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value> {
        let handle = self
            .slot
            .lock()
            .unwrap()
            .clone()
            .ok_or(RelayError::ExtensionUnavailable)?;

        let id = handle.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        handle.pending.lock().unwrap().insert(id, tx);

        let frame = serde_json::json!({ "id": id, "method": method, "params": params });
        let text = serde_json::to_string(&frame)?;
        if handle.outbound.send(Message::Text(text)).await.is_err() {
            handle.pending.lock().unwrap().remove(&id);
            return Err(RelayError::ExtensionUnavailable);
        }

        match tokio::time::timeout(self.config.extension_call_timeout, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err((code, message)))) => Err(RelayError::ExtensionProtocol(format!(
                "extension call {method} failed ({code}): {message}"
            ))),
            Ok(Err(_)) => Err(RelayError::ExtensionUnavailable),
            Err(_) => {
                handle.pending.lock().unwrap().remove(&id);
                Err(RelayError::Timeout {
                    timeout_ms: self.config.extension_call_timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Accept a newly upgraded `/extension` WebSocket. Runs until the
    /// connection closes; does not return early except to reject a second
    /// concurrent extension.
    pub async fn accept(self: Arc<Self>, socket: WebSocket) {
        let generation = self.generation_counter.fetch_add(1, Ordering::SeqCst) + 1;

        let (mut sink, mut stream) = socket.split();
        let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(self.config.write_queue_cap);

        let handle = Arc::new(ExtensionHandle {
            outbound: outbound_tx,
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            missed_pongs: AtomicU32::new(0),
            generation,
        });

        let previous = self.slot.lock().unwrap().replace(handle.clone());
        if previous.is_some() {
            warn!("rejecting second extension connection: one is already live");
            let _ = sink
                .send(Message::Close(Some(CloseFrame {
                    code: ALREADY_CONNECTED_CLOSE_CODE,
                    reason: "extension already connected".into(),
                })))
                .await;
            // Restore the previous connection's ownership of the slot.
            *self.slot.lock().unwrap() = previous;
            return;
        }

        info!("extension connected");

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if sink.send(msg).await.is_err() {
                    break;
                }
            }
        });

        let ping_task = {
            let this = self.clone();
            let handle = handle.clone();
            tokio::spawn(async move { this.ping_loop(handle).await })
        };

        while let Some(msg) = stream.next().await {
            match msg {
                Ok(Message::Text(text)) => self.dispatch(&handle, &text).await,
                Ok(Message::Close(_)) => {
                    info!("extension closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "extension websocket error, closing link");
                    break;
                }
            }
        }

        ping_task.abort();
        writer_task.abort();
        self.on_disconnect(generation);
    }

    fn on_disconnect(&self, generation: u64) {
        let mut slot = self.slot.lock().unwrap();
        let still_current = slot.as_ref().is_some_and(|h| h.generation == generation);
        if still_current {
            if let Some(handle) = slot.take() {
                handle.pending.lock().unwrap().clear();
            }
            drop(slot);
            self.registry.on_extension_disconnected();
            info!("extension disconnected, registry cleared");
        }
    }

    async fn ping_loop(&self, handle: Arc<ExtensionHandle>) {
        let mut ticker = tokio::time::interval(self.config.ping_interval);
        loop {
            ticker.tick().await;
            let missed = handle.missed_pongs.fetch_add(1, Ordering::SeqCst) + 1;
            if missed > self.config.ping_miss_limit {
                warn!(missed, "extension missed too many pongs, closing link");
                let _ = handle
                    .outbound
                    .send(Message::Close(Some(CloseFrame {
                        code: 1001,
                        reason: "ping timeout".into(),
                    })))
                    .await;
                return;
            }
            if handle
                .outbound
                .send(Message::Text(r#"{"method":"ping"}"#.to_string()))
                .await
                .is_err()
            {
                return;
            }
        }
    }

    async fn dispatch(&self, handle: &Arc<ExtensionHandle>, text: &str) {
        let parsed: std::result::Result<ExtensionInbound, _> = serde_json::from_str(text);
        match parsed {
            Ok(ExtensionInbound::Reply { id, result, error }) => {
                let sender = handle.pending.lock().unwrap().remove(&id);
                let Some(sender) = sender else {
                    warn!(id, "extension reply for unknown pending call id, dropping");
                    return;
                };
                let outcome = match error {
                    Some(err) => Err((err.code.unwrap_or(-32000), err.message)),
                    None => Ok(result.unwrap_or(Value::Null)),
                };
                let _ = sender.send(outcome);
            }
            Ok(ExtensionInbound::Event { method, params }) => {
                self.handle_event(handle, &method, params).await;
            }
            Err(e) => {
                warn!(error = %e, frame = %text, "malformed extension frame, dropping");
            }
        }
    }

    async fn handle_event(&self, handle: &Arc<ExtensionHandle>, method: &str, params: Value) {
        match method {
            "pong" => {
                handle.missed_pongs.store(0, Ordering::SeqCst);
            }
            "forwardCDPEvent" => match serde_json::from_value::<ForwardedCdpEvent>(params) {
                Ok(event) => self.handle_forwarded_cdp_event(event),
                Err(e) => warn!(error = %e, "malformed forwardCDPEvent params"),
            },
            "tabsDiscovered" => self.handle_tabs_discovered(params),
            "tabUpdated" => match serde_json::from_value::<TabUpdatedParams>(params) {
                Ok(p) => self
                    .registry
                    .on_tab_updated(p.tab_id, p.title, p.url, p.active),
                Err(e) => warn!(error = %e, "malformed tabUpdated params"),
            },
            "tabRemoved" => match serde_json::from_value::<TabRemovedParams>(params) {
                Ok(p) => self.registry.on_tab_removed(p.tab_id),
                Err(e) => warn!(error = %e, "malformed tabRemoved params"),
            },
            other => debug!(method = other, "unrecognized extension event, ignoring"),
        }
    }

    fn handle_tabs_discovered(&self, params: Value) {
        // Accept either `{tabs:[...]}` or a bare array, since discovery
        // payload shape is not load-bearing beyond the tab list itself.
        let tabs_value = params.get("tabs").cloned().unwrap_or(params);
        match serde_json::from_value::<Vec<crate::protocol::DiscoveredTabInfo>>(tabs_value) {
            Ok(tabs) => {
                let tabs = tabs
                    .into_iter()
                    .map(|t| DiscoveredTab {
                        tab_id: t.tab_id,
                        title: t.title,
                        url: t.url,
                        active: t.active,
                    })
                    .collect();
                self.registry.on_tabs_discovered(tabs);
            }
            Err(e) => warn!(error = %e, "malformed tabsDiscovered params"),
        }
    }

    fn handle_forwarded_cdp_event(&self, event: ForwardedCdpEvent) {
        // The incoming event is always rebroadcast verbatim below; only
        // synthetic events the registry derives on top of it (e.g. the
        // detach implied by a reused sessionId) need an extra broadcast
        // here, or a client would see the attach/detach/info-change twice.
        let extra_events: Vec<RegistryEvent> = match event.method.as_str() {
            "Target.attachedToTarget" => {
                let target_info: std::result::Result<TargetInfo, _> =
                    serde_json::from_value(event.params.get("targetInfo").cloned().unwrap_or(Value::Null));
                let session_id = event
                    .params
                    .get("sessionId")
                    .and_then(|v| v.as_str())
                    .map(|s| s.to_string());
                let waiting = event
                    .params
                    .get("waitingForDebugger")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false);
                match (target_info, session_id) {
                    (Ok(info), Some(sid)) => self
                        .registry
                        .on_attached_to_target(sid, info, waiting)
                        .into_iter()
                        .filter(|e| matches!(e, RegistryEvent::Detached { .. }))
                        .collect(),
                    _ => {
                        warn!("malformed Target.attachedToTarget event, dropping");
                        Vec::new()
                    }
                }
            }
            "Target.detachedFromTarget" => {
                let session_id = event.params.get("sessionId").and_then(|v| v.as_str());
                match session_id {
                    Some(sid) => {
                        self.registry.on_detached_from_target(sid);
                    }
                    None => warn!("malformed Target.detachedFromTarget event, dropping"),
                }
                Vec::new()
            }
            "Target.targetInfoChanged" => {
                let target_info: std::result::Result<TargetInfo, _> =
                    serde_json::from_value(event.params.get("targetInfo").cloned().unwrap_or(Value::Null));
                match target_info {
                    Ok(info) => {
                        self.registry.on_target_info_changed(info);
                    }
                    Err(_) => warn!("malformed Target.targetInfoChanged event, dropping"),
                }
                Vec::new()
            }
            _ => Vec::new(),
        };

        for re in extra_events {
            self.hub.broadcast(re.into_cdp_frame());
        }

        self.hub.broadcast(protocol::cdp_event(
            &event.method,
            event.params,
            event.session_id.as_deref(),
        ));
    }
}
