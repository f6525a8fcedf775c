//! Target Registry: the authoritative view of
//! attached targets and discovered tabs, with URL-based dedup and the
//! detach-before-reattach invariant on `sessionId` reuse.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{RelayError, Result};
use crate::protocol::{self, TargetInfo};

#[derive(Debug, Clone, Serialize)]
pub struct AttachedTarget {
    pub target_id: String,
    pub session_id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    pub title: String,
    pub url: String,
    pub waiting_for_debugger: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredTab {
    pub tab_id: u64,
    pub title: String,
    pub url: String,
    pub active: bool,
}

impl DiscoveredTab {
    pub fn synthetic_target_id(&self) -> String {
        format!("dtab-{}", self.tab_id)
    }
}

impl AttachedTarget {
    /// CDP `TargetInfo` JSON shape, as used in `Target.getTargets` replies
    /// and synthesized attach events.
    pub fn to_target_info_json(&self) -> serde_json::Value {
        serde_json::json!({
            "targetId": self.target_id,
            "type": self.target_type,
            "title": self.title,
            "url": self.url,
            "attached": true,
        })
    }
}

/// A row as rendered by `/json/list`.
#[derive(Debug, Clone, Serialize)]
pub struct TargetEntry {
    pub id: String,
    #[serde(rename = "type")]
    pub target_type: String,
    pub title: String,
    pub url: String,
    #[serde(rename = "webSocketDebuggerUrl", skip_serializing_if = "Option::is_none")]
    pub web_socket_debugger_url: Option<String>,
}

/// An event the registry wants rebroadcast to all CDP clients, or replayed
/// to a single newly-connected one.
#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Attached(AttachedTarget),
    Detached { session_id: String },
    InfoChanged(AttachedTarget),
}

impl RegistryEvent {
    pub fn into_cdp_frame(self) -> serde_json::Value {
        match self {
            RegistryEvent::Attached(t) | RegistryEvent::InfoChanged(t) => {
                protocol::cdp_event("Target.attachedToTarget", attached_event_params(&t), None)
            }
            RegistryEvent::Detached { session_id } => protocol::cdp_event(
                "Target.detachedFromTarget",
                serde_json::json!({ "sessionId": session_id }),
                None,
            ),
        }
    }
}

fn attached_event_params(t: &AttachedTarget) -> serde_json::Value {
    serde_json::json!({
        "sessionId": t.session_id,
        "targetInfo": {
            "targetId": t.target_id,
            "type": t.target_type,
            "title": t.title,
            "url": t.url,
            "attached": true,
        },
        "waitingForDebugger": t.waiting_for_debugger,
    })
}

/// Normalize a URL for dedup purposes: parse and re-stringify, keep the
/// fragment, trim surrounding whitespace.
pub fn normalize_url(raw: &str) -> String {
    let trimmed = raw.trim();
    match url::Url::parse(trimmed) {
        Ok(u) => u.to_string(),
        Err(_) => trimmed.to_string(),
    }
}

struct State {
    /// sessionId -> AttachedTarget. Invariant: each live sessionId maps to
    /// exactly one target.
    attached: HashMap<String, AttachedTarget>,
    /// tabId -> DiscoveredTab.
    discovered: HashMap<u64, DiscoveredTab>,
    /// targetId -> waiters for `Target.attachedToTarget` on that target,
    /// used by `/json/attach/<id>`.
    attach_waiters: HashMap<String, Vec<oneshot::Sender<AttachedTarget>>>,
}

/// The Target Registry. Mutations are serialized behind a single mutex.
pub struct TargetRegistry {
    state: Mutex<State>,
}

impl Default for TargetRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TargetRegistry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                attached: HashMap::new(),
                discovered: HashMap::new(),
                attach_waiters: HashMap::new(),
            }),
        }
    }

    /// `onAttachedToTarget` — returns the events that must be rebroadcast,
    /// in order.
    pub fn on_attached_to_target(
        &self,
        session_id: String,
        info: TargetInfo,
        waiting_for_debugger: bool,
    ) -> Vec<RegistryEvent> {
        let mut state = self.state.lock().unwrap();
        let mut events = Vec::new();

        if let Some(existing) = state.attached.get(&session_id) {
            if existing.target_id != info.target_id {
                events.push(RegistryEvent::Detached {
                    session_id: session_id.clone(),
                });
                state.attached.remove(&session_id);
            }
        }

        let target = AttachedTarget {
            target_id: info.target_id.clone(),
            session_id: session_id.clone(),
            target_type: if info.target_type.is_empty() {
                "page".to_string()
            } else {
                info.target_type
            },
            title: info.title,
            url: info.url,
            waiting_for_debugger,
        };

        state.attached.insert(session_id, target.clone());
        events.push(RegistryEvent::Attached(target.clone()));

        if let Some(waiters) = state.attach_waiters.remove(&target.target_id) {
            for waiter in waiters {
                let _ = waiter.send(target.clone());
            }
        }

        events
    }

    /// `onDetachedFromTarget` — returns the rebroadcast event, if the
    /// session was actually known.
    pub fn on_detached_from_target(&self, session_id: &str) -> Option<RegistryEvent> {
        let mut state = self.state.lock().unwrap();
        state.attached.remove(session_id)?;
        Some(RegistryEvent::Detached {
            session_id: session_id.to_string(),
        })
    }

    /// `onTargetInfoChanged` — updates title/url by targetId, returns the
    /// rebroadcast event if the target was known.
    pub fn on_target_info_changed(&self, info: TargetInfo) -> Option<RegistryEvent> {
        let mut state = self.state.lock().unwrap();
        let session_id = state
            .attached
            .iter()
            .find(|(_, t)| t.target_id == info.target_id)
            .map(|(sid, _)| sid.clone())?;

        let target = state.attached.get_mut(&session_id)?;
        target.title = info.title;
        target.url = info.url;
        Some(RegistryEvent::InfoChanged(target.clone()))
    }

    /// `onTabsDiscovered` — full replace of the discovered-tab set.
    pub fn on_tabs_discovered(&self, tabs: Vec<DiscoveredTab>) {
        let mut state = self.state.lock().unwrap();
        state.discovered = tabs.into_iter().map(|t| (t.tab_id, t)).collect();
    }

    /// `onTabUpdated` — upsert; creates the tab if absent.
    pub fn on_tab_updated(
        &self,
        tab_id: u64,
        title: Option<String>,
        url: Option<String>,
        active: Option<bool>,
    ) {
        let mut state = self.state.lock().unwrap();
        let tab = state.discovered.entry(tab_id).or_insert_with(|| DiscoveredTab {
            tab_id,
            title: String::new(),
            url: String::new(),
            active: false,
        });
        if let Some(title) = title {
            tab.title = title;
        }
        if let Some(url) = url {
            tab.url = url;
        }
        if let Some(active) = active {
            tab.active = active;
        }
    }

    /// `onTabRemoved` — no-op if absent.
    pub fn on_tab_removed(&self, tab_id: u64) {
        self.state.lock().unwrap().discovered.remove(&tab_id);
    }

    /// `list()` — the union used by `/json/list`, attached targets first,
    /// then discovered tabs not shadowed by an attached target's URL.
    pub fn list(&self, ws_debugger_url_for: impl Fn(&str) -> Option<String>) -> Vec<TargetEntry> {
        let state = self.state.lock().unwrap();

        let attached_urls: std::collections::HashSet<String> = state
            .attached
            .values()
            .map(|t| normalize_url(&t.url))
            .collect();

        let mut entries: Vec<TargetEntry> = state
            .attached
            .values()
            .map(|t| TargetEntry {
                id: t.target_id.clone(),
                target_type: t.target_type.clone(),
                title: t.title.clone(),
                url: t.url.clone(),
                web_socket_debugger_url: ws_debugger_url_for(&t.session_id),
            })
            .collect();

        entries.extend(state.discovered.values().filter_map(|tab| {
            if attached_urls.contains(&normalize_url(&tab.url)) {
                return None;
            }
            Some(TargetEntry {
                id: tab.synthetic_target_id(),
                target_type: "page".to_string(),
                title: tab.title.clone(),
                url: tab.url.clone(),
                web_socket_debugger_url: None,
            })
        }));

        entries
    }

    /// Snapshot of attached targets only, for `Target.getTargets` and the
    /// replay-on-connect behavior of the CDP Session Hub.
    pub fn attached_snapshot(&self) -> Vec<AttachedTarget> {
        self.state.lock().unwrap().attached.values().cloned().collect()
    }

    pub fn find_by_target_id(&self, target_id: &str) -> Option<AttachedTarget> {
        self.state
            .lock()
            .unwrap()
            .attached
            .values()
            .find(|t| t.target_id == target_id)
            .cloned()
    }

    pub fn find_by_session_id(&self, session_id: &str) -> Option<AttachedTarget> {
        self.state.lock().unwrap().attached.get(session_id).cloned()
    }

    /// `onExtensionDisconnected` — clear both sets; fail all pending
    /// attachments with a disconnect error.
    pub fn on_extension_disconnected(&self) {
        let mut state = self.state.lock().unwrap();
        state.attached.clear();
        state.discovered.clear();
        for (target_id, waiters) in state.attach_waiters.drain() {
            debug!(%target_id, "failing pending attach: extension disconnected");
            drop(waiters); // dropping the senders fails the receivers
        }
    }

    /// Wait until `target_id` shows up as attached, or until it already is.
    /// Used by `/json/attach/<id>` once the extension RPC has told us which
    /// `targetId` to expect.
    pub async fn wait_for_attach(
        &self,
        target_id: &str,
        timeout: Duration,
    ) -> Result<AttachedTarget> {
        if let Some(existing) = self.find_by_target_id(target_id) {
            return Ok(existing);
        }

        let rx = {
            let mut state = self.state.lock().unwrap();
            if let Some(existing) = state
                .attached
                .values()
                .find(|t| t.target_id == target_id)
                .cloned()
            {
                return Ok(existing);
            }
            let (tx, rx) = oneshot::channel();
            state
                .attach_waiters
                .entry(target_id.to_string())
                .or_default()
                .push(tx);
            rx
        };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(target)) => Ok(target),
            Ok(Err(_)) => {
                warn!(%target_id, "attach waiter dropped without being resolved");
                Err(RelayError::ExtensionUnavailable)
            }
            Err(_) => Err(RelayError::Timeout {
                timeout_ms: timeout.as_millis() as u64,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(target_id: &str, url: &str) -> TargetInfo {
        TargetInfo {
            target_id: target_id.to_string(),
            target_type: "page".to_string(),
            title: "Example".to_string(),
            url: url.to_string(),
            attached: true,
        }
    }

    #[test]
    fn attach_then_list_contains_target() {
        let reg = TargetRegistry::new();
        reg.on_attached_to_target("s1".into(), info("t1", "https://example.com"), false);
        let list = reg.list(|_| None);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "t1");
        assert_eq!(list[0].url, "https://example.com");
    }

    #[test]
    fn reattaching_same_session_same_target_is_a_refresh() {
        let reg = TargetRegistry::new();
        let events = reg.on_attached_to_target("s1".into(), info("t1", "https://a.com"), false);
        assert_eq!(events.len(), 1);
        let events = reg.on_attached_to_target("s1".into(), info("t1", "https://a.com"), false);
        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], RegistryEvent::Attached(_)));
    }

    #[test]
    fn session_id_reuse_with_new_target_detaches_old_first() {
        let reg = TargetRegistry::new();
        reg.on_attached_to_target("shared".into(), info("t1", "https://a.com"), false);
        let events = reg.on_attached_to_target("shared".into(), info("t2", "https://b.com"), false);

        assert_eq!(events.len(), 2);
        match &events[0] {
            RegistryEvent::Detached { session_id } => assert_eq!(session_id, "shared"),
            other => panic!("expected Detached first, got {other:?}"),
        }
        match &events[1] {
            RegistryEvent::Attached(t) => assert_eq!(t.target_id, "t2"),
            other => panic!("expected Attached second, got {other:?}"),
        }

        let list = reg.list(|_| None);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "t2");
    }

    #[test]
    fn dedup_suppresses_discovered_tab_with_same_url() {
        let reg = TargetRegistry::new();
        reg.on_tabs_discovered(vec![DiscoveredTab {
            tab_id: 300,
            title: "Example".into(),
            url: "https://example.com".into(),
            active: true,
        }]);
        reg.on_attached_to_target(
            "s1".into(),
            info("real-t1", "https://example.com"),
            false,
        );

        let list = reg.list(|_| None);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, "real-t1");
    }

    #[test]
    fn tabs_discovered_is_a_full_replace() {
        let reg = TargetRegistry::new();
        reg.on_tabs_discovered(vec![
            DiscoveredTab {
                tab_id: 1,
                title: "A".into(),
                url: "https://a.com".into(),
                active: false,
            },
            DiscoveredTab {
                tab_id: 2,
                title: "B".into(),
                url: "https://b.com".into(),
                active: false,
            },
        ]);
        reg.on_tabs_discovered(vec![
            DiscoveredTab {
                tab_id: 2,
                title: "B".into(),
                url: "https://b.com".into(),
                active: false,
            },
            DiscoveredTab {
                tab_id: 3,
                title: "C".into(),
                url: "https://c.com".into(),
                active: false,
            },
        ]);

        let mut ids: Vec<String> = reg.list(|_| None).into_iter().map(|e| e.id).collect();
        ids.sort();
        assert_eq!(ids, vec!["dtab-2", "dtab-3"]);
    }

    #[test]
    fn extension_disconnect_clears_discovery() {
        let reg = TargetRegistry::new();
        reg.on_tabs_discovered(vec![DiscoveredTab {
            tab_id: 500,
            title: "X".into(),
            url: "https://x.com".into(),
            active: true,
        }]);
        reg.on_extension_disconnected();
        assert!(reg.list(|_| None).is_empty());
    }

    #[tokio::test]
    async fn wait_for_attach_resolves_once_event_observed() {
        let reg = std::sync::Arc::new(TargetRegistry::new());
        let reg2 = reg.clone();
        let handle = tokio::spawn(async move {
            reg2.wait_for_attach("real-target-400", Duration::from_secs(1))
                .await
        });

        tokio::time::sleep(Duration::from_millis(10)).await;
        reg.on_attached_to_target(
            "cb-tab-10".into(),
            info("real-target-400", "https://target.com"),
            false,
        );

        let target = handle.await.unwrap().unwrap();
        assert_eq!(target.session_id, "cb-tab-10");
    }

    #[tokio::test]
    async fn wait_for_attach_times_out() {
        let reg = TargetRegistry::new();
        let result = reg
            .wait_for_attach("never-comes", Duration::from_millis(20))
            .await;
        assert!(matches!(result, Err(RelayError::Timeout { .. })));
    }
}
