//! LRU cache for directive results of fields with a `maxAge` cache hint.
//!
//! One cache is shared by every directive of a registry. Entries expire after
//! the field's `maxAge` seconds; when the cache is full the least recently
//! used entry is evicted.

use crate::error::DirectiveError;
use indexmap::IndexMap;
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use std::future::Future;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use subkit_runtime::{CacheScope, Context, ResolverArgs, ResolverInfo};
use tracing::debug;

/// Entries kept by [`ResponseCache::default`].
pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug)]
struct Entry {
    value: Value,
    expires: Instant,
}

/// Where one directive call is cached, if anywhere.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheSlot {
    key: String,
    ttl: Duration,
}

impl CacheSlot {
    /// The slot of a call to `target` from the field `info` resolves, or
    /// `None` when the field has no positive `maxAge`. Private fields are
    /// cached per user.
    pub fn for_call(
        info: &ResolverInfo,
        ctx: &Context,
        args: &ResolverArgs,
        target: &str,
    ) -> Option<Self> {
        let hint = info.cache_hint();
        let ttl = hint
            .max_age
            .filter(|seconds| *seconds > 0)
            .map(|seconds| Duration::from_secs(u64::from(seconds)))?;
        let user = match hint.scope {
            Some(CacheScope::Private) => ctx.user().cloned().unwrap_or(Value::Null),
            _ => Value::Null,
        };
        let key = json!({
            "field": format!("{}.{}", info.parent_type, info.field_name),
            "scope": hint.scope,
            "user": user,
            "args": args.to_json(),
            "target": target,
        })
        .to_string();
        Some(Self { key, ttl })
    }

    /// The slot of one part of the call, such as a response path or a batch
    /// key.
    pub fn part(&self, part: &str) -> Self {
        Self {
            key: format!("{}#{part}", self.key),
            ttl: self.ttl,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }
}

/// Process-wide response cache.
#[derive(Debug)]
pub struct ResponseCache {
    capacity: usize,
    entries: Mutex<IndexMap<String, Entry>>,
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ResponseCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Mutex::new(IndexMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, IndexMap<String, Entry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// The live value under `key`, marked as most recently used.
    pub fn get(&self, key: &str) -> Option<Value> {
        let mut entries = self.entries();
        let (key, entry) = entries.shift_remove_entry(key)?;
        if entry.expires <= Instant::now() {
            return None;
        }
        let value = entry.value.clone();
        entries.insert(key, entry);
        Some(value)
    }

    /// Stores `value` for `ttl`, evicting the least recently used entries
    /// past capacity.
    pub fn insert(&self, key: String, value: Value, ttl: Duration) {
        if self.capacity == 0 || ttl.is_zero() {
            return;
        }
        let mut entries = self.entries();
        entries.shift_remove(&key);
        while entries.len() >= self.capacity {
            entries.shift_remove_index(0);
        }
        entries.insert(
            key,
            Entry {
                value,
                expires: Instant::now() + ttl,
            },
        );
    }

    /// Answers from `slot` when it holds a live value, otherwise runs
    /// `produce` and caches its result.
    pub(crate) async fn through<F>(
        &self,
        slot: Option<CacheSlot>,
        produce: F,
    ) -> Result<Value, DirectiveError>
    where
        F: Future<Output = Result<Value, DirectiveError>>,
    {
        let Some(slot) = slot else {
            return produce.await;
        };
        if let Some(hit) = self.get(&slot.key) {
            debug!(key = %slot.key, "response cache hit");
            return Ok(hit);
        }
        let value = produce.await?;
        self.insert(slot.key, value.clone(), slot.ttl);
        Ok(value)
    }

    /// Answers the batch keys cached under `slot` and loads the rest with
    /// `load`, caching what it returns.
    pub(crate) async fn through_batch<F, Fut>(
        &self,
        slot: Option<&CacheSlot>,
        keys: Vec<String>,
        load: F,
    ) -> Result<FxHashMap<String, Value>, DirectiveError>
    where
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = Result<FxHashMap<String, Value>, DirectiveError>>,
    {
        let Some(slot) = slot else {
            return load(keys).await;
        };

        let mut found = FxHashMap::default();
        let mut missing = Vec::new();
        for key in keys {
            match self.get(&slot.part(&key).key) {
                Some(value) => {
                    found.insert(key, value);
                }
                None => missing.push(key),
            }
        }
        debug!(hits = found.len(), misses = missing.len(), "batched response cache lookup");

        if !missing.is_empty() {
            for (key, value) in load(missing).await? {
                self.insert(slot.part(&key).key, value.clone(), slot.ttl);
                found.insert(key, value);
            }
        }
        Ok(found)
    }
}
