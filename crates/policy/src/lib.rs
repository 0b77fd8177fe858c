//! Policy scoping for the read side.
//!
//! A policy contributes three things to a catalog query: a segment query
//! (ANDed with the client filter), a field-mask list hidden from responses,
//! and a bounded connector override list. Policies are resolved cache-aside:
//! the in-memory TTL cache answers first, the authoritative `trib_policies`
//! table on a miss; cache trouble never blocks a query.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use sqlx::{PgPool, Row};
use tokio::sync::RwLock;

use tributary_contracts::BrokerError;

#[derive(Debug, Clone, PartialEq, Default)]
pub struct PolicyScope {
    pub segment_query: Option<serde_json::Value>,
    pub field_masks: Vec<String>,
    pub connector_override: Vec<String>,
}

/// In-memory TTL cache keyed by policy id. Disabled entirely when either the
/// entry budget or the TTL is zero.
#[derive(Clone)]
pub struct PolicyCache {
    cache: Arc<RwLock<HashMap<String, CachedScope>>>,
    max_entries: usize,
    ttl: Duration,
}

#[derive(Clone)]
struct CachedScope {
    scope: PolicyScope,
    expires_at: Instant,
}

impl PolicyCache {
    pub fn new(max_entries: usize, ttl: Duration) -> Self {
        Self {
            cache: Arc::new(RwLock::new(HashMap::new())),
            max_entries,
            ttl,
        }
    }

    pub fn enabled(&self) -> bool {
        self.max_entries > 0 && self.ttl > Duration::ZERO
    }

    pub async fn get(&self, policy_id: &str) -> Option<PolicyScope> {
        if !self.enabled() {
            return None;
        }

        let now = Instant::now();
        let cache = self.cache.read().await;
        cache
            .get(policy_id)
            .and_then(|entry| (entry.expires_at > now).then(|| entry.scope.clone()))
    }

    pub async fn set(&self, policy_id: &str, scope: PolicyScope) {
        if !self.enabled() {
            return;
        }

        let now = Instant::now();
        let mut cache = self.cache.write().await;

        cache.retain(|_, entry| entry.expires_at > now);
        cache.insert(
            policy_id.to_string(),
            CachedScope {
                scope,
                expires_at: now + self.ttl,
            },
        );

        if cache.len() <= self.max_entries {
            return;
        }

        let mut overflow = cache.len() - self.max_entries;
        let keys = cache.keys().cloned().collect::<Vec<_>>();
        for key in keys {
            if overflow == 0 {
                break;
            }
            if cache.remove(&key).is_some() {
                overflow -= 1;
            }
        }
    }

    pub async fn invalidate(&self, policy_id: &str) {
        let mut cache = self.cache.write().await;
        cache.remove(policy_id);
    }
}

#[derive(Clone)]
pub struct PolicyProvider {
    pool: PgPool,
    cache: PolicyCache,
}

impl PolicyProvider {
    pub fn new(pool: PgPool, cache: PolicyCache) -> Self {
        Self { pool, cache }
    }

    /// Cache-aside lookup. `Ok(None)` means the policy id is unknown.
    pub async fn resolve(&self, policy_id: &str) -> Result<Option<PolicyScope>, BrokerError> {
        if let Some(scope) = self.cache.get(policy_id).await {
            return Ok(Some(scope));
        }

        let row = sqlx::query(
            "SELECT segment_query, field_masks, connector_override \
             FROM trib_policies WHERE policy_id = $1",
        )
        .bind(policy_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|err| BrokerError::internal(format!("policy storage error: {}", err)))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let segment_query: Option<serde_json::Value> = row
            .try_get("segment_query")
            .map_err(|err| BrokerError::internal(format!("policy row error: {}", err)))?;
        let field_masks: serde_json::Value = row
            .try_get("field_masks")
            .map_err(|err| BrokerError::internal(format!("policy row error: {}", err)))?;
        let connector_override: serde_json::Value = row
            .try_get("connector_override")
            .map_err(|err| BrokerError::internal(format!("policy row error: {}", err)))?;

        let scope = PolicyScope {
            segment_query,
            field_masks: sorted_string_list(&field_masks),
            connector_override: string_list(&connector_override),
        };

        self.cache.set(policy_id, scope.clone()).await;
        Ok(Some(scope))
    }

    pub async fn invalidate(&self, policy_id: &str) {
        self.cache.invalidate(policy_id).await;
    }

    /// Seeding/ops hook; policy CRUD proper is out of scope.
    pub async fn upsert_policy(
        &self,
        policy_id: &str,
        scope: &PolicyScope,
    ) -> Result<(), BrokerError> {
        sqlx::query(
            "INSERT INTO trib_policies (policy_id, segment_query, field_masks, connector_override, updated_at) \
             VALUES ($1, $2, $3, $4, now()) \
             ON CONFLICT (policy_id) DO UPDATE \
             SET segment_query = EXCLUDED.segment_query, \
                 field_masks = EXCLUDED.field_masks, \
                 connector_override = EXCLUDED.connector_override, \
                 updated_at = now()",
        )
        .bind(policy_id)
        .bind(&scope.segment_query)
        .bind(serde_json::json!(scope.field_masks))
        .bind(serde_json::json!(scope.connector_override))
        .execute(&self.pool)
        .await
        .map_err(|err| BrokerError::internal(format!("policy storage error: {}", err)))?;

        self.cache.invalidate(policy_id).await;
        Ok(())
    }
}

/// Dotted-path field mask applied to response documents before they leave
/// the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldMask {
    paths: Vec<Vec<String>>,
}

impl FieldMask {
    pub fn new(fields: &[String]) -> Self {
        let mut paths = fields
            .iter()
            .map(|field| {
                field
                    .split('.')
                    .filter(|s| !s.is_empty())
                    .map(str::to_string)
                    .collect::<Vec<_>>()
            })
            .filter(|path| !path.is_empty())
            .collect::<Vec<_>>();
        paths.sort();
        paths.dedup();
        Self { paths }
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    pub fn apply(&self, document: &mut serde_json::Value) {
        for path in &self.paths {
            remove_path(document, path);
        }
    }
}

fn remove_path(value: &mut serde_json::Value, path: &[String]) {
    let Some((head, rest)) = path.split_first() else {
        return;
    };
    let Some(map) = value.as_object_mut() else {
        return;
    };
    if rest.is_empty() {
        map.remove(head);
    } else if let Some(child) = map.get_mut(head) {
        remove_path(child, rest);
    }
}

fn string_list(value: &serde_json::Value) -> Vec<String> {
    match value.as_array() {
        Some(items) => items
            .iter()
            .filter_map(|item| item.as_str())
            .map(|s| s.trim())
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect(),
        None => Vec::new(),
    }
}

fn sorted_string_list(value: &serde_json::Value) -> Vec<String> {
    let mut out = string_list(value);
    out.sort();
    out.dedup();
    out
}
