//! CDP Router: handles inbound CDP client frames,
//! synthesizing replies for a small `Target.*` subset and forwarding
//! everything else to the Extension Link with session rewriting.

use std::sync::Arc;

use serde_json::Value;
use tracing::warn;

use crate::extension_link::ExtensionLink;
use crate::hub::{CdpSessionHub, SocketId};
use crate::protocol::{self, CdpClientFrame};
use crate::registry::TargetRegistry;

pub struct CdpRouter {
    registry: Arc<TargetRegistry>,
    extension: Arc<ExtensionLink>,
    hub: Arc<CdpSessionHub>,
}

impl CdpRouter {
    pub fn new(
        registry: Arc<TargetRegistry>,
        extension: Arc<ExtensionLink>,
        hub: Arc<CdpSessionHub>,
    ) -> Self {
        Self {
            registry,
            extension,
            hub,
        }
    }

    /// Replay the current attached-target set as synthetic
    /// `Target.attachedToTarget` events to one client only (used both on
    /// new-client accept by the hub's caller, and by `Target.setDiscoverTargets`).
    pub fn replay_attached_to(&self, socket_id: SocketId) {
        for target in self.registry.attached_snapshot() {
            let params = serde_json::json!({
                "sessionId": target.session_id,
                "targetInfo": target.to_target_info_json(),
                "waitingForDebugger": target.waiting_for_debugger,
            });
            self.hub.send(
                socket_id,
                protocol::cdp_event("Target.attachedToTarget", params, None),
            );
        }
    }

    /// Handle one inbound CDP client frame. Intended to be spawned as its
    /// own task per frame so a bug handling one frame can't take down
    /// another client's in-flight work.
    pub async fn handle_frame(&self, socket_id: SocketId, frame: CdpClientFrame) {
        match frame.method.as_str() {
            "Target.setDiscoverTargets" => {
                self.replay_attached_to(socket_id);
                self.hub
                    .send(socket_id, protocol::cdp_result(frame.id, serde_json::json!({})));
            }
            "Target.setAutoAttach" => {
                self.hub
                    .send(socket_id, protocol::cdp_result(frame.id, serde_json::json!({})));
            }
            "Target.getTargets" => {
                let infos: Vec<Value> = self
                    .registry
                    .attached_snapshot()
                    .iter()
                    .map(|t| t.to_target_info_json())
                    .collect();
                self.hub.send(
                    socket_id,
                    protocol::cdp_result(frame.id, serde_json::json!({ "targetInfos": infos })),
                );
            }
            "Target.attachToTarget" => self.handle_attach_to_target(socket_id, &frame),
            _ => self.forward(socket_id, frame).await,
        }
    }

    fn handle_attach_to_target(&self, socket_id: SocketId, frame: &CdpClientFrame) {
        let Some(target_id) = frame.params.get("targetId").and_then(|v| v.as_str()) else {
            self.hub.send(
                socket_id,
                protocol::cdp_error(frame.id, -32602, "missing targetId"),
            );
            return;
        };

        match self.registry.find_by_target_id(target_id) {
            Some(target) => {
                self.hub.send(
                    socket_id,
                    protocol::cdp_result(
                        frame.id,
                        serde_json::json!({ "sessionId": target.session_id }),
                    ),
                );
                let params = serde_json::json!({
                    "sessionId": target.session_id,
                    "targetInfo": target.to_target_info_json(),
                    "waitingForDebugger": target.waiting_for_debugger,
                });
                self.hub.send(
                    socket_id,
                    protocol::cdp_event("Target.attachedToTarget", params, None),
                );
            }
            None => {
                self.hub.send(
                    socket_id,
                    protocol::cdp_error(frame.id, -32602, "No such target"),
                );
            }
        }
    }

    async fn forward(&self, socket_id: SocketId, frame: CdpClientFrame) {
        if let Some(session_id) = &frame.session_id {
            if self.registry.find_by_session_id(session_id).is_none() {
                self.hub.send(
                    socket_id,
                    protocol::cdp_error(
                        frame.id,
                        -32001,
                        format!("Session not found: {session_id}"),
                    ),
                );
                return;
            }
        }

        let params = serde_json::json!({
            "sessionId": frame.session_id,
            "method": frame.method,
            "params": frame.params,
        });

        match self.extension.call("forwardCDPCommand", params).await {
            Ok(result) => self.hub.send(socket_id, protocol::cdp_result(frame.id, result)),
            Err(e) => {
                warn!(error = %e, method = %frame.method, "forwarded CDP command failed");
                self.hub
                    .send(socket_id, protocol::cdp_error(frame.id, e.cdp_code(), e.to_string()));
            }
        }
    }
}
