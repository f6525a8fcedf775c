use rand::RngCore;

/// Per-instance bearer token, minted once at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthToken(String);

impl AuthToken {
    /// 128 bits of OS-backed randomness, hex-encoded.
    pub fn generate() -> Self {
        let mut bytes = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut bytes);
        Self(bytes.iter().map(|b| format!("{b:02x}")).collect())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Check an `Authorization: Bearer <token>` header value.
    pub fn matches_header(&self, header: Option<&str>) -> bool {
        match header.and_then(|h| h.strip_prefix("Bearer ")) {
            Some(candidate) => candidate == self.0,
            None => false,
        }
    }

    /// Check a `?token=` query parameter, the fallback for clients that can't
    /// set headers on the WS upgrade.
    pub fn matches_query(&self, token: Option<&str>) -> bool {
        token.is_some_and(|t| t == self.0)
    }
}

impl std::fmt::Display for AuthToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generates_distinct_tokens() {
        let a = AuthToken::generate();
        let b = AuthToken::generate();
        assert_ne!(a.as_str(), b.as_str());
        assert_eq!(a.as_str().len(), 32);
    }

    #[test]
    fn header_must_carry_bearer_prefix() {
        let token = AuthToken::generate();
        let header = format!("Bearer {}", token.as_str());
        assert!(token.matches_header(Some(&header)));
        assert!(!token.matches_header(Some(token.as_str())));
        assert!(!token.matches_header(None));
    }

    #[test]
    fn query_fallback_requires_exact_match() {
        let token = AuthToken::generate();
        assert!(token.matches_query(Some(token.as_str())));
        assert!(!token.matches_query(Some("wrong")));
        assert!(!token.matches_query(None));
    }
}
