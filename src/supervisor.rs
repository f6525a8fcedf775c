//! Relay Supervisor: `ensureRelay(cdpUrl)` /
//! `stopRelay(cdpUrl)` lifecycle keyed by URL, binding, and token minting.
//!
//! A private singleton guarded by a mutex, constructed lazily on first use
//! rather than as hidden module-load-time state.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::http::build_router;
use crate::instance::Instance;

struct RunningInstance {
    instance: Arc<Instance>,
    server_handle: tokio::task::JoinHandle<()>,
}

/// Process-wide `cdpUrl -> Instance` map. A private singleton
/// guarded by a mutex, constructed lazily on first use rather than at
/// module load time.
#[derive(Default)]
pub struct RelaySupervisor {
    instances: Mutex<HashMap<String, RunningInstance>>,
}

fn global() -> &'static RelaySupervisor {
    static SUPERVISOR: OnceLock<RelaySupervisor> = OnceLock::new();
    SUPERVISOR.get_or_init(RelaySupervisor::default)
}

impl RelaySupervisor {
    /// Return the running instance for `cdp_url`, starting one if none
    /// exists yet. Idempotent: a second call with the same URL reuses the
    /// existing, already-bound instance.
    pub async fn ensure_relay(&self, cdp_url: &str) -> Result<Arc<Instance>> {
        let mut instances = self.instances.lock().await;
        if let Some(running) = instances.get(cdp_url) {
            return Ok(running.instance.clone());
        }

        let config = RelayConfig::from_cdp_url(cdp_url)?;
        let instance = Arc::new(Instance::new(config.clone()));

        let listener = TcpListener::bind(config.bind_addr())
            .await
            .map_err(RelayError::Io)?;
        let bound_port = listener
            .local_addr()
            .map_err(RelayError::Io)?
            .port();
        instance.set_bound_port(bound_port);

        let app = build_router(instance.clone());
        let shutdown = instance.shutting_down.clone();
        let server_handle = tokio::spawn(async move {
            let server = axum::serve(listener, app.into_make_service()).with_graceful_shutdown(
                async move { shutdown.notified().await },
            );
            if let Err(e) = server.await {
                tracing::error!(error = %e, "relay HTTP server exited with error");
            }
        });

        info!(cdp_url, host = %config.host, port = bound_port, "relay instance started");

        instances.insert(
            cdp_url.to_string(),
            RunningInstance {
                instance: instance.clone(),
                server_handle,
            },
        );

        Ok(instance)
    }

    /// Tear down the instance for `cdp_url`, if any: cancels the listener,
    /// closes all sockets, fails pending work with `Shutdown`.
    /// No-op if nothing is running for that URL.
    pub async fn stop_relay(&self, cdp_url: &str) {
        let running = self.instances.lock().await.remove(cdp_url);
        let Some(running) = running else {
            return;
        };

        running.instance.begin_shutdown();
        running.instance.hub.close_all();
        running.server_handle.abort();
        info!(cdp_url, "relay instance stopped");
    }

    /// Headers an in-process caller should send to talk to the relay for
    /// `cdp_url`.
    pub async fn auth_headers(&self, cdp_url: &str) -> Option<HashMap<String, String>> {
        let instances = self.instances.lock().await;
        let running = instances.get(cdp_url)?;
        let mut headers = HashMap::new();
        headers.insert(
            "Authorization".to_string(),
            format!("Bearer {}", running.instance.token),
        );
        Some(headers)
    }

    pub async fn is_running(&self, cdp_url: &str) -> bool {
        self.instances.lock().await.contains_key(cdp_url)
    }
}

/// `ensureRelay(cdpUrl)` — returns the running instance for `cdpUrl`,
/// creating one if needed.
pub async fn ensure_relay(cdp_url: &str) -> Result<Arc<Instance>> {
    global().ensure_relay(cdp_url).await
}

/// `stopRelay(cdpUrl)` — tears down the instance for `cdpUrl`, if any.
pub async fn stop_relay(cdp_url: &str) {
    global().stop_relay(cdp_url).await
}

/// `getRelayAuthHeaders(cdpUrl)` — headers for in-process callers to reach
/// an already-running relay.
pub async fn get_relay_auth_headers(cdp_url: &str) -> Option<HashMap<String, String>> {
    global().auth_headers(cdp_url).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn ensure_relay_is_idempotent_per_url() {
        let supervisor = RelaySupervisor::default();
        let a = supervisor.ensure_relay("http://127.0.0.1:0").await.unwrap();
        let b = supervisor.ensure_relay("http://127.0.0.1:0").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        supervisor.stop_relay("http://127.0.0.1:0").await;
    }

    #[tokio::test]
    async fn stop_relay_removes_the_instance() {
        let supervisor = RelaySupervisor::default();
        supervisor.ensure_relay("http://127.0.0.1:0").await.unwrap();
        assert!(supervisor.is_running("http://127.0.0.1:0").await);
        supervisor.stop_relay("http://127.0.0.1:0").await;
        assert!(!supervisor.is_running("http://127.0.0.1:0").await);
    }

    #[tokio::test]
    async fn stop_relay_on_unknown_url_is_a_no_op() {
        let supervisor = RelaySupervisor::default();
        supervisor.stop_relay("http://127.0.0.1:9999").await;
    }
}
