//! Identity of a rate-limited principal.

use std::fmt;

use crate::policy::Algorithm;

/// Composite identity used to scope a limit: client, endpoint class, optional tier.
///
/// Immutable once built; every piece of limiter state is addressed through it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClientKey {
    client_id: String,
    endpoint: String,
    tier: Option<String>,
}

impl ClientKey {
    /// Build a key for `client_id` calling `endpoint`.
    pub fn new(client_id: impl Into<String>, endpoint: impl Into<String>) -> Self {
        Self { client_id: client_id.into(), endpoint: endpoint.into(), tier: None }
    }

    /// Attach a tier.
    pub fn with_tier(mut self, tier: impl Into<String>) -> Self {
        self.tier = Some(tier.into());
        self
    }

    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn tier(&self) -> Option<&str> {
        self.tier.as_deref()
    }

    /// Store key for `algorithm`'s state. Components are escaped so that a
    /// `:` inside a client id cannot collide with another key, and a missing
    /// tier renders as a bare `-` that no escaped tier can produce.
    pub fn storage_key(&self, algorithm: Algorithm) -> String {
        format!(
            "rl:{}:{}:{}:{}",
            algorithm.as_str(),
            escape(&self.client_id),
            escape(&self.endpoint),
            self.tier.as_deref().map(escape).unwrap_or_else(|| "-".to_string()),
        )
    }
}

impl fmt::Display for ClientKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tier {
            Some(tier) => write!(f, "{}@{}[{}]", self.client_id, self.endpoint, tier),
            None => write!(f, "{}@{}", self.client_id, self.endpoint),
        }
    }
}

fn escape(part: &str) -> String {
    part.replace('%', "%25").replace(':', "%3A").replace('-', "%2D")
}
