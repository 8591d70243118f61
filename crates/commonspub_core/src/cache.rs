use std::collections::BTreeMap;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

pub const DEFAULT_TTL: Duration = Duration::from_secs(24 * 60 * 60);

/// Single namespaced key the whole snapshot is stored under.
pub const CACHE_STORE_KEY: &str = "commonspub:lookup-cache";

pub type CacheStore = Connection;

const CACHE_SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS cache_store (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);
"#;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
struct StoredEntry {
    data: Value,
    timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    Set { kind: String, id: String },
    Invalidated { kind: String, id: Option<String> },
    Cleared,
}

#[derive(Debug, Clone, Serialize, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub total_entries: usize,
    pub by_kind: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Listener = Box<dyn Fn(&CacheEvent)>;

/// TTL lookup cache keyed by case-folded `(kind, identifier)`.
///
/// All writers run on the single sequential publish worker; the cache itself
/// performs no locking. Entries expire passively after the TTL and are
/// evicted on read; mutating external state invalidates the matching entries
/// eagerly so the next resolution goes back to the wiki.
pub struct LookupCache {
    entries: BTreeMap<String, StoredEntry>,
    ttl: Duration,
    listeners: Vec<(SubscriptionId, Listener)>,
    next_subscription: u64,
}

impl LookupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: BTreeMap::new(),
            ttl,
            listeners: Vec::new(),
            next_subscription: 0,
        }
    }

    pub fn with_default_ttl() -> Self {
        Self::new(DEFAULT_TTL)
    }

    /// Returns the cached value, or None on miss or expiry. Expired entries
    /// are evicted as a side effect of the read.
    pub fn get(&mut self, kind: &str, id: &str) -> Option<Value> {
        let key = cache_key(kind, id);
        let now = now_unix();
        let expired = match self.entries.get(&key) {
            Some(entry) => age_secs(entry.timestamp, now) > self.ttl.as_secs(),
            None => return None,
        };
        if expired {
            self.entries.remove(&key);
            return None;
        }
        self.entries.get(&key).map(|entry| entry.data.clone())
    }

    pub fn set(&mut self, kind: &str, id: &str, data: Value) {
        let key = cache_key(kind, id);
        self.entries.insert(
            key,
            StoredEntry {
                data,
                timestamp: now_unix(),
            },
        );
        self.notify(&CacheEvent::Set {
            kind: kind.to_string(),
            id: id.to_string(),
        });
    }

    /// Removes one entry; notifies only if it was present.
    pub fn invalidate(&mut self, kind: &str, id: &str) {
        let key = cache_key(kind, id);
        if self.entries.remove(&key).is_some() {
            self.notify(&CacheEvent::Invalidated {
                kind: kind.to_string(),
                id: Some(id.to_string()),
            });
        }
    }

    /// Removes every entry of one kind; notifies only if anything matched.
    pub fn invalidate_kind(&mut self, kind: &str) {
        let prefix = format!("{}:", fold(kind));
        let before = self.entries.len();
        self.entries.retain(|key, _| !key.starts_with(&prefix));
        if self.entries.len() != before {
            self.notify(&CacheEvent::Invalidated {
                kind: kind.to_string(),
                id: None,
            });
        }
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.notify(&CacheEvent::Cleared);
    }

    pub fn subscribe(&mut self, listener: impl Fn(&CacheEvent) + 'static) -> SubscriptionId {
        self.next_subscription += 1;
        let id = SubscriptionId(self.next_subscription);
        self.listeners.push((id, Box::new(listener)));
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) {
        self.listeners.retain(|(listener_id, _)| *listener_id != id);
    }

    pub fn stats(&self) -> CacheStats {
        let mut by_kind: BTreeMap<String, usize> = BTreeMap::new();
        for key in self.entries.keys() {
            let kind = key.split(':').next().unwrap_or("").to_string();
            *by_kind.entry(kind).or_default() += 1;
        }
        CacheStats {
            total_entries: self.entries.len(),
            by_kind,
        }
    }

    /// Snapshot the cache into the key/value store. Best-effort at the call
    /// sites: callers log and continue when this fails.
    pub fn persist(&self, connection: &Connection) -> Result<()> {
        let mut snapshot = serde_json::Map::new();
        for (key, entry) in &self.entries {
            snapshot.insert(
                key.clone(),
                serde_json::to_value(entry).context("failed to encode cache entry")?,
            );
        }
        let payload =
            serde_json::to_string(&Value::Object(snapshot)).context("failed to encode cache")?;
        connection
            .execute(
                "INSERT INTO cache_store (key, value) VALUES (?1, ?2)
                ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                rusqlite::params![CACHE_STORE_KEY, payload],
            )
            .context("failed to write cache snapshot")?;
        Ok(())
    }

    pub fn persist_best_effort(&self, connection: &Connection) {
        if let Err(error) = self.persist(connection) {
            warn!(error = %error, "cache persistence failed; continuing in memory");
        }
    }

    /// Load a snapshot back. Unknown or malformed entries are skipped rather
    /// than failing the load.
    pub fn load(&mut self, connection: &Connection) -> Result<usize> {
        let payload: Option<String> = connection
            .query_row(
                "SELECT value FROM cache_store WHERE key = ?1 LIMIT 1",
                [CACHE_STORE_KEY],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|error| match error {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })
            .context("failed to read cache snapshot")?;
        let Some(payload) = payload else {
            return Ok(0);
        };
        let parsed: Value =
            serde_json::from_str(&payload).context("failed to decode cache snapshot")?;
        let Some(object) = parsed.as_object() else {
            return Ok(0);
        };
        let mut loaded = 0usize;
        for (key, value) in object {
            match serde_json::from_value::<StoredEntry>(value.clone()) {
                Ok(entry) => {
                    self.entries.insert(key.clone(), entry);
                    loaded += 1;
                }
                Err(error) => {
                    warn!(key = %key, error = %error, "skipping malformed cache entry");
                }
            }
        }
        Ok(loaded)
    }

    fn notify(&self, event: &CacheEvent) {
        for (id, listener) in &self.listeners {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                warn!(subscription = id.0, "cache listener panicked; ignoring");
            }
        }
    }

    #[cfg(test)]
    fn backdate(&mut self, kind: &str, id: &str, age: Duration) {
        let key = cache_key(kind, id);
        if let Some(entry) = self.entries.get_mut(&key) {
            entry.timestamp = entry.timestamp.saturating_sub(age.as_secs());
        }
    }
}

pub fn open_cache_store(db_path: &Path) -> Result<Connection> {
    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let connection = Connection::open(db_path)
        .with_context(|| format!("failed to open {}", db_path.display()))?;
    connection
        .busy_timeout(Duration::from_secs(5))
        .context("failed to set sqlite busy timeout")?;
    connection
        .pragma_update(None, "journal_mode", "WAL")
        .context("failed to enable WAL journal mode")?;
    connection
        .execute_batch(CACHE_SCHEMA_SQL)
        .context("failed to initialize cache schema")?;
    Ok(connection)
}

fn cache_key(kind: &str, id: &str) -> String {
    format!("{}:{}", fold(kind), fold(id))
}

fn fold(value: &str) -> String {
    value.trim().to_lowercase()
}

fn age_secs(timestamp: u64, now: u64) -> u64 {
    now.saturating_sub(timestamp)
}

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}
