//! Short-lived read cache in front of the queue processor.
//!
//! One process-wide map, keyed by `(namespace, tenant, service[, extra])`.
//! Entries past `expires_at` are treated as absent and removed by the
//! periodic sweep.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use serde_json::Value;
use tokio::sync::RwLock;
use tokio::time::Instant;

use crate::config::ConfigCenter;
use crate::model::Scope;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Namespace {
    QueueData,
    QueueStatus,
    Stats,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub namespace: Namespace,
    pub scope: Scope,
    pub extra: Option<String>,
}

impl CacheKey {
    pub fn new(namespace: Namespace, scope: &Scope) -> Self {
        Self {
            namespace,
            scope: scope.clone(),
            extra: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub data: Value,
    pub expires_at: Instant,
}

/// Generation of a scope observed before an upstream read.
///
/// A read that started before an invalidation must not write its result
/// back afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchTicket(u64);

#[derive(Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    generations: HashMap<Scope, u64>,
}

#[derive(Default)]
pub struct QueueCache {
    state: RwLock<CacheState>,
}

impl QueueCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Live entry for `key`, if any.
    pub async fn get(&self, key: &CacheKey) -> Option<Value> {
        let state = self.state.read().await;
        let entry = state.entries.get(key)?;
        if Instant::now() > entry.expires_at {
            return None;
        }
        Some(entry.data.clone())
    }

    pub async fn ticket(&self, scope: &Scope) -> FetchTicket {
        let state = self.state.read().await;
        FetchTicket(state.generations.get(scope).copied().unwrap_or(0))
    }

    /// Store `data` unless the scope was invalidated after `ticket` was taken.
    /// Returns whether the entry was written.
    pub async fn store(&self, key: CacheKey, data: Value, ttl: Duration, ticket: FetchTicket) -> bool {
        let mut state = self.state.write().await;
        let current = state.generations.get(&key.scope).copied().unwrap_or(0);
        if current != ticket.0 {
            debug!("[cache] drop stale write for {:?} {}", key.namespace, key.scope);
            return false;
        }
        let entry = CacheEntry {
            key: key.clone(),
            data,
            expires_at: Instant::now() + ttl,
        };
        state.entries.insert(key, entry);
        true
    }

    /// Drop every entry of the given namespaces for `scope`, all `extra`
    /// variants included.
    pub async fn invalidate(&self, scope: &Scope, namespaces: &[Namespace]) {
        let mut state = self.state.write().await;
        *state.generations.entry(scope.clone()).or_insert(0) += 1;
        state
            .entries
            .retain(|k, _| !(k.scope == *scope && namespaces.contains(&k.namespace)));
        debug!("[cache] invalidated {:?} for {}", namespaces, scope);
    }

    /// Remove expired entries. Returns how many were dropped.
    pub async fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut state = self.state.write().await;
        let before = state.entries.len();
        state.entries.retain(|_, e| now <= e.expires_at);
        before - state.entries.len()
    }

    pub async fn len(&self) -> usize {
        self.state.read().await.entries.len()
    }
}

/// 启动周期清理任务
pub fn spawn_sweeper(cache: Arc<QueueCache>, cc: ConfigCenter) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let interval = cc.config().await.cache_sweep_interval_secs.max(1);
            tokio::time::sleep(Duration::from_secs(interval)).await;
            let removed = cache.sweep().await;
            if removed > 0 {
                debug!("[cache] swept {} expired entries", removed);
            }
        }
    })
}
