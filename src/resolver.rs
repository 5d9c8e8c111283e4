//! Policy resolver: maps (client, endpoint, tier) to the most specific policy.
//!
//! Precedence is client+endpoint over tier+endpoint over endpoint over the
//! global default (see [`MatchCriteria::specificity`]); among equally
//! specific matches the rule declared first wins. Rules are compiled into an
//! immutable table held in a [`SnapshotCell`], so a reload swaps the whole
//! table at once and a request resolves against exactly one version.

use std::path::Path;
use std::sync::Arc;

use crate::key::ClientKey;
use crate::policy::{LimitPolicy, MatchCriteria, PolicyConfig};
use crate::snapshot::SnapshotCell;
use crate::telemetry::{emit_best_effort, LimiterEvent, NullSink, TelemetrySink};
use crate::LimitError;

#[derive(Debug)]
struct CompiledRule {
    criteria: MatchCriteria,
    policy: Arc<LimitPolicy>,
}

/// Validated rules, most specific first.
#[derive(Debug)]
pub struct PolicyTable {
    rules: Vec<CompiledRule>,
    default: Arc<LimitPolicy>,
}

impl PolicyTable {
    /// Validate every rule and require a default.
    pub fn compile(config: &PolicyConfig) -> Result<Self, LimitError> {
        let mut rules = config
            .rules
            .iter()
            .enumerate()
            .map(|(index, rule)| {
                let policy = rule.to_policy().map_err(|e| match e {
                    LimitError::InvalidPolicy(msg) => {
                        LimitError::InvalidPolicy(format!("rule {index}: {msg}"))
                    }
                    other => other,
                })?;
                Ok(CompiledRule { criteria: rule.criteria.clone(), policy: Arc::new(policy) })
            })
            .collect::<Result<Vec<_>, LimitError>>()?;

        let default = rules
            .iter()
            .find(|r| r.criteria.is_default())
            .map(|r| Arc::clone(&r.policy))
            .ok_or_else(|| LimitError::NoPolicyFound {
                client_id: "*".to_string(),
                endpoint: "*".to_string(),
            })?;

        // Stable: equal specificity keeps declaration order.
        rules.sort_by_key(|r| std::cmp::Reverse(r.criteria.specificity()));
        Ok(Self { rules, default })
    }

    pub fn resolve(&self, client_id: &str, endpoint: &str, tier: Option<&str>) -> Arc<LimitPolicy> {
        self.rules
            .iter()
            .find(|r| r.criteria.matches(client_id, endpoint, tier))
            .map(|r| Arc::clone(&r.policy))
            .unwrap_or_else(|| Arc::clone(&self.default))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Hot-reloadable resolver. Clones share the same table.
#[derive(Debug, Clone)]
pub struct PolicyResolver<Sink = NullSink> {
    table: SnapshotCell<PolicyTable>,
    sink: Sink,
}

impl PolicyResolver<NullSink> {
    /// Compile `config`. Fails with [`LimitError::InvalidPolicy`] on a bad rule
    /// and [`LimitError::NoPolicyFound`] when no default rule exists; both are
    /// startup errors.
    pub fn new(config: &PolicyConfig) -> Result<Self, LimitError> {
        let table = PolicyTable::compile(config)?;
        tracing::info!(rules = table.len(), version = 1, "policy table loaded");
        Ok(Self { table: SnapshotCell::new(table), sink: NullSink })
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LimitError> {
        Self::new(&PolicyConfig::from_path(path)?)
    }
}

impl<Sink> PolicyResolver<Sink>
where
    Sink: TelemetrySink,
    <Sink as tower::Service<LimiterEvent>>::Future: Send + 'static,
{
    /// Report reloads to `sink`.
    pub fn with_sink<NewSink: TelemetrySink>(self, sink: NewSink) -> PolicyResolver<NewSink> {
        PolicyResolver { table: self.table, sink }
    }

    /// The most specific policy for this request. Never fails: a resolver
    /// always holds a default.
    pub fn resolve(&self, client_id: &str, endpoint: &str, tier: Option<&str>) -> Arc<LimitPolicy> {
        self.table.load().resolve(client_id, endpoint, tier)
    }

    pub fn resolve_key(&self, key: &ClientKey) -> Arc<LimitPolicy> {
        self.resolve(key.client_id(), key.endpoint(), key.tier())
    }

    /// Version of the table currently served.
    pub fn version(&self) -> u64 {
        self.table.version()
    }

    /// Validate `config` and swap it in. On error the current table stays.
    pub async fn reload(&self, config: &PolicyConfig) -> Result<u64, LimitError> {
        let table = match PolicyTable::compile(config) {
            Ok(table) => table,
            Err(e) => {
                tracing::warn!(error = %e, version = self.version(), "policy reload rejected");
                return Err(e);
            }
        };
        let rules = table.len();
        let version = self.table.publish(table);
        tracing::info!(rules, version, "policy table reloaded");
        emit_best_effort(self.sink.clone(), LimiterEvent::PolicyReloaded { version, rules }).await;
        Ok(version)
    }

    pub async fn reload_from_path(&self, path: impl AsRef<Path>) -> Result<u64, LimitError> {
        let config = PolicyConfig::from_path(path)?;
        self.reload(&config).await
    }
}
