//! A single relay `Instance`: the bundle of per-`cdpUrl` state that
//! the HTTP surface and the Relay Supervisor operate on. Owns the auth
//! token, the target registry, the CDP session hub, and the extension link,
//! and exposes the bind address the supervisor listens on.

use std::sync::Arc;

use tokio::sync::Notify;

use crate::auth::AuthToken;
use crate::config::RelayConfig;
use crate::extension_link::ExtensionLink;
use crate::hub::CdpSessionHub;
use crate::registry::TargetRegistry;
use crate::router::CdpRouter;

/// Everything one bound relay needs: host/port, bearer token, extension
/// slot, CDP session hub, and target registry.
pub struct Instance {
    pub config: RelayConfig,
    pub token: AuthToken,
    pub registry: Arc<TargetRegistry>,
    pub hub: Arc<CdpSessionHub>,
    pub extension: Arc<ExtensionLink>,
    pub router: Arc<CdpRouter>,
    /// Flipped by `stopRelay` before sockets are torn down, so in-flight
    /// HTTP handlers can observe a clean shutdown rather than a dropped
    /// connection.
    pub shutting_down: Arc<Notify>,
    shutdown_flag: std::sync::atomic::AtomicBool,
    /// The port actually bound by the listener. Usually equal to
    /// `config.port`, except in tests that request an ephemeral port (0) and
    /// then record whatever the OS handed back.
    bound_port: std::sync::atomic::AtomicU16,
}

impl Instance {
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(TargetRegistry::new());
        let hub = Arc::new(CdpSessionHub::new());
        let extension = Arc::new(ExtensionLink::new(registry.clone(), hub.clone(), config.clone()));
        let router = Arc::new(CdpRouter::new(registry.clone(), extension.clone(), hub.clone()));

        let bound_port = config.port;
        Self {
            config,
            token: AuthToken::generate(),
            registry,
            hub,
            extension,
            router,
            shutting_down: Arc::new(Notify::new()),
            shutdown_flag: std::sync::atomic::AtomicBool::new(false),
            bound_port: std::sync::atomic::AtomicU16::new(bound_port),
        }
    }

    /// Record the port the listener actually bound to. Only differs from `config.port` when the caller requested an
    /// ephemeral port for testing.
    pub fn set_bound_port(&self, port: u16) {
        self.bound_port.store(port, std::sync::atomic::Ordering::SeqCst);
    }

    pub fn bound_port(&self) -> u16 {
        self.bound_port.load(std::sync::atomic::Ordering::SeqCst)
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown_flag.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// Mark this instance as shutting down and wake anything waiting on it.
    /// Idempotent.
    pub fn begin_shutdown(&self) {
        self.shutdown_flag.store(true, std::sync::atomic::Ordering::SeqCst);
        self.shutting_down.notify_waiters();
        self.registry.on_extension_disconnected();
    }

    /// `ws://host:port/cdp?token=...`, used by `/json/version` and
    /// `/json/list`.
    pub fn cdp_ws_url(&self) -> String {
        format!(
            "ws://{}:{}/cdp?token={}",
            self.config.host,
            self.bound_port(),
            self.token
        )
    }
}
