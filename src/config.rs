use std::time::Duration;

use crate::error::{RelayError, Result};

/// Per-instance configuration, derived from the `cdpUrl` passed to `ensureRelay`
/// plus sane runtime defaults for timeouts and queue sizes.
#[derive(Debug, Clone)]
pub struct RelayConfig {
    pub host: String,
    pub port: u16,
    /// Interval between liveness pings sent to the extension.
    pub ping_interval: Duration,
    /// Number of consecutive missed pongs before the extension link is closed.
    pub ping_miss_limit: u32,
    /// Timeout for a single outbound extension RPC (`call`).
    pub extension_call_timeout: Duration,
    /// Timeout for `/json/attach/<id>` end to end.
    pub attach_timeout: Duration,
    /// Max queued frames per CDP client write queue before it is closed (1013).
    pub write_queue_cap: usize,
}

impl RelayConfig {
    /// Parse `host:port` out of a `cdpUrl` like `http://127.0.0.1:9223`.
    pub fn from_cdp_url(cdp_url: &str) -> Result<Self> {
        let parsed = url::Url::parse(cdp_url)?;
        let host = parsed
            .host_str()
            .ok_or_else(|| RelayError::bad_request(format!("cdpUrl has no host: {cdp_url}")))?
            .to_string();
        let port = parsed
            .port_or_known_default()
            .ok_or_else(|| RelayError::bad_request(format!("cdpUrl has no port: {cdp_url}")))?;

        Ok(Self {
            host,
            port,
            ..Self::defaults()
        })
    }

    fn defaults() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 0,
            ping_interval: Duration::from_secs(10),
            ping_miss_limit: 3,
            extension_call_timeout: Duration::from_secs(30),
            attach_timeout: Duration::from_secs(10),
            write_queue_cap: 256,
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_host_and_port() {
        let cfg = RelayConfig::from_cdp_url("http://127.0.0.1:9223").unwrap();
        assert_eq!(cfg.host, "127.0.0.1");
        assert_eq!(cfg.port, 9223);
    }

    #[test]
    fn rejects_unparseable_url() {
        assert!(RelayConfig::from_cdp_url("not a url").is_err());
    }

    #[test]
    fn defaults_are_sane() {
        let cfg = RelayConfig::from_cdp_url("http://127.0.0.1:9223").unwrap();
        assert_eq!(cfg.ping_miss_limit, 3);
        assert_eq!(cfg.attach_timeout, Duration::from_secs(10));
    }
}
