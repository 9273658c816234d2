//! # Cache Store
//!
//! Encrypted, priority-tiered local key/value store with TTL and checksum
//! validation. Used both as a read cache and as the durable backing store
//! for operation payloads.
//!
//! ## Read Path
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                         get(key)                                        │
//! │                                                                         │
//! │  SELECT row ──► expired? ──► yes ──► delete, count miss                │
//! │       │                                                                 │
//! │       ▼ no                                                              │
//! │  encrypted? ──► open sealed blob ──► failure ──► QUARANTINE            │
//! │       │                                              │                  │
//! │       ▼                                              ▼                  │
//! │  verify SHA-256 checksum ──► mismatch ──────► QUARANTINE               │
//! │       │                                              │                  │
//! │       ▼ ok                                           ▼                  │
//! │  bump recency, count hit                    entry leaves the readable  │
//! │  return plaintext                           set, lands in              │
//! │                                             cache_quarantine,          │
//! │                                             CorruptionDetected event   │
//! │                                                                         │
//! │  Corrupted bytes are NEVER returned to the caller.                     │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Eviction
//! Tiered: `Critical`-priority and `pinned` entries are never placed in the
//! recency index, so `compact()` cannot select them under any pressure.
//! Among the rest, expired entries are reclaimed first, then
//! least-recently-used until the byte budget is met.
//!
//! ## Eviction vs. Reads
//! `compact()` may run concurrently with reads: a read copies the value out
//! of SQLite before any bookkeeping, so eviction can only ever reclaim the
//! row, never the bytes a reader already holds (snapshot isolation).

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use lru::LruCache;
use sqlx::SqlitePool;
use tokio::sync::{broadcast, RwLock};
use tracing::{debug, info, warn};

use caravan_core::integrity::{checksum_hex, verify_checksum};
use caravan_core::types::{CacheEntry, CacheStats, Priority, RemoteChange};

use crate::crypto::CacheCipher;
use crate::error::{StoreError, StoreResult};

// =============================================================================
// Events
// =============================================================================

/// Diagnostics emitted by the durability layer. The orchestrator forwards
/// these onto the host-facing event stream.
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// A cache entry failed checksum validation or decryption and was
    /// quarantined.
    CorruptionDetected { key: String, reason: String },
}

// =============================================================================
// Configuration
// =============================================================================

/// Cache Store configuration.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Byte budget `compact()` shrinks towards.
    /// Default: 64 MiB
    pub max_bytes: u64,

    /// Default TTL applied when `SetOptions::ttl` is absent.
    /// `None` means entries do not expire by default.
    pub default_ttl: Option<Duration>,

    /// Kinds whose remotely-merged values are stored sealed.
    /// Requires a cipher; merging such a kind without one fails the batch.
    pub encrypted_kinds: BTreeSet<String>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        CacheConfig {
            max_bytes: 64 * 1024 * 1024,
            default_ttl: None,
            encrypted_kinds: BTreeSet::new(),
        }
    }
}

/// Per-write options for [`CacheStore::set`].
#[derive(Debug, Clone)]
pub struct SetOptions {
    /// Priority tier (Critical entries are eviction-exempt).
    pub priority: Priority,

    /// Time-to-live; falls back to the config default when absent.
    pub ttl: Option<Duration>,

    /// Pinned entries are never evicted automatically.
    pub pinned: bool,

    /// Store the value as a sealed blob.
    pub encrypt: bool,
}

impl Default for SetOptions {
    fn default() -> Self {
        SetOptions {
            priority: Priority::Medium,
            ttl: None,
            pinned: false,
            encrypt: false,
        }
    }
}

/// What one `compact()` pass reclaimed.
#[derive(Debug, Clone, Default)]
pub struct CompactReport {
    /// Keys removed because their TTL elapsed.
    pub expired: Vec<String>,

    /// Keys evicted coldest-first to meet the byte budget.
    pub evicted: Vec<String>,

    /// Total bytes reclaimed.
    pub bytes_reclaimed: u64,
}

// =============================================================================
// Row Type
// =============================================================================

#[derive(Debug, sqlx::FromRow)]
struct CacheRow {
    key: String,
    value: Vec<u8>,
    priority: i64,
    encrypted: bool,
    pinned: bool,
    checksum: String,
    size_bytes: i64,
    expires_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    last_access_at: DateTime<Utc>,
}

impl CacheRow {
    fn priority(&self) -> Priority {
        Priority::from_rank(self.priority as u8).unwrap_or(Priority::Medium)
    }

    fn is_evictable(&self) -> bool {
        !self.pinned && self.priority() != Priority::Critical
    }

    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map(|t| t <= now).unwrap_or(false)
    }

    fn meta(&self) -> CacheEntry {
        CacheEntry {
            key: self.key.clone(),
            priority: self.priority(),
            pinned: self.pinned,
            encrypted: self.encrypted,
            checksum: self.checksum.clone(),
            size_bytes: self.size_bytes as u64,
            expires_at: self.expires_at,
            created_at: self.created_at,
            updated_at: self.updated_at,
            last_access_at: self.last_access_at,
        }
    }
}

// =============================================================================
// In-Memory Bookkeeping
// =============================================================================

/// Recency index plus counters. Only evictable entries live in the index -
/// that structural choice is what makes the pinned/critical exemption a
/// property rather than a filter.
struct CacheIndex {
    recency: LruCache<String, u64>,
    hits: u64,
    misses: u64,
    expired: u64,
    evictions: u64,
    quarantined: u64,
}

impl CacheIndex {
    fn new() -> Self {
        CacheIndex {
            // Capacity is enforced in bytes by compact(), not in entries.
            recency: LruCache::unbounded(),
            hits: 0,
            misses: 0,
            expired: 0,
            evictions: 0,
            quarantined: 0,
        }
    }
}

// =============================================================================
// Cache Store
// =============================================================================

/// The encrypted, priority-tiered cache.
#[derive(Clone)]
pub struct CacheStore {
    pool: SqlitePool,
    cipher: Option<CacheCipher>,
    config: CacheConfig,
    index: Arc<RwLock<CacheIndex>>,
    events: broadcast::Sender<StoreEvent>,
}

impl CacheStore {
    /// Opens the cache over an existing pool, rebuilding the recency index
    /// from persisted access times (oldest first, so LRU order survives a
    /// restart).
    pub async fn open(
        pool: SqlitePool,
        config: CacheConfig,
        cipher: Option<CacheCipher>,
    ) -> StoreResult<Self> {
        let rows = sqlx::query_as::<_, CacheRow>(
            "SELECT key, value, priority, encrypted, pinned, checksum, size_bytes, \
             expires_at, created_at, updated_at, last_access_at \
             FROM cache_entries ORDER BY last_access_at ASC",
        )
        .fetch_all(&pool)
        .await?;

        let mut index = CacheIndex::new();
        let total = rows.len();
        for row in &rows {
            if row.is_evictable() {
                index.recency.put(row.key.clone(), row.size_bytes as u64);
            }
        }

        info!(entries = total, "Cache store opened");

        let (events, _) = broadcast::channel(64);
        Ok(CacheStore {
            pool,
            cipher,
            config,
            index: Arc::new(RwLock::new(index)),
            events,
        })
    }

    /// Subscribes to store diagnostics (corruption events).
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    // =========================================================================
    // Writes
    // =========================================================================

    /// Writes an entry. Encryption and checksum handling are transparent:
    /// the checksum always covers the plaintext.
    pub async fn set(&self, key: &str, value: &[u8], opts: SetOptions) -> StoreResult<()> {
        let sealed;
        let stored: &[u8] = if opts.encrypt {
            let cipher = self.cipher.as_ref().ok_or_else(|| {
                StoreError::SealFailed("no cache cipher configured".to_string())
            })?;
            sealed = cipher.seal(value, key.as_bytes())?;
            &sealed
        } else {
            value
        };

        let now = Utc::now();
        let expires_at = opts
            .ttl
            .or(self.config.default_ttl)
            .map(|ttl| now + chrono::Duration::from_std(ttl).unwrap_or_else(|_| chrono::Duration::zero()));
        let checksum = checksum_hex(value);
        let size = stored.len() as i64;

        let mut index = self.index.write().await;

        sqlx::query(
            "INSERT INTO cache_entries \
             (key, value, priority, encrypted, pinned, checksum, size_bytes, \
              expires_at, created_at, updated_at, last_access_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?9, ?9) \
             ON CONFLICT(key) DO UPDATE SET \
               value = excluded.value, \
               priority = excluded.priority, \
               encrypted = excluded.encrypted, \
               pinned = excluded.pinned, \
               checksum = excluded.checksum, \
               size_bytes = excluded.size_bytes, \
               expires_at = excluded.expires_at, \
               updated_at = excluded.updated_at, \
               last_access_at = excluded.last_access_at",
        )
        .bind(key)
        .bind(stored)
        .bind(opts.priority.rank() as i64)
        .bind(opts.encrypt)
        .bind(opts.pinned)
        .bind(&checksum)
        .bind(size)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        let evictable = !opts.pinned && opts.priority != Priority::Critical;
        if evictable {
            index.recency.put(key.to_string(), size as u64);
        } else {
            // Priority upgrades pull an entry out of the eviction pool.
            index.recency.pop(key);
        }

        debug!(key = %key, priority = %opts.priority, encrypted = opts.encrypt, "Cache set");
        Ok(())
    }

    /// Removes an entry. Returns true when something was removed.
    pub async fn invalidate(&self, key: &str) -> StoreResult<bool> {
        let mut index = self.index.write().await;

        let result = sqlx::query("DELETE FROM cache_entries WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        index.recency.pop(key);

        Ok(result.rows_affected() > 0)
    }

    // =========================================================================
    // Reads
    // =========================================================================

    /// Reads an entry. Expired, corrupted, or undecryptable entries read as
    /// misses; corruption additionally quarantines the entry and raises a
    /// `CorruptionDetected` event.
    pub async fn get(&self, key: &str) -> StoreResult<Option<Vec<u8>>> {
        // Value is copied out of SQLite before any bookkeeping: a
        // concurrent compact() can reclaim the row but never these bytes.
        let row = sqlx::query_as::<_, CacheRow>(
            "SELECT key, value, priority, encrypted, pinned, checksum, size_bytes, \
             expires_at, created_at, updated_at, last_access_at \
             FROM cache_entries WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        let now = Utc::now();
        let mut index = self.index.write().await;

        let row = match row {
            Some(row) => row,
            None => {
                index.misses += 1;
                return Ok(None);
            }
        };

        if row.is_expired(now) {
            sqlx::query("DELETE FROM cache_entries WHERE key = ?1")
                .bind(key)
                .execute(&self.pool)
                .await?;
            index.recency.pop(key);
            index.expired += 1;
            index.misses += 1;
            return Ok(None);
        }

        // Decryption failure is treated identically to checksum failure.
        let plaintext = if row.encrypted {
            let opened = self
                .cipher
                .as_ref()
                .ok_or_else(|| StoreError::DecryptFailed {
                    key: key.to_string(),
                })
                .and_then(|c| c.open(&row.value, key.as_bytes(), key));
            match opened {
                Ok(bytes) => bytes,
                Err(_) => {
                    self.quarantine(&mut index, &row, "decryption failed").await?;
                    return Ok(None);
                }
            }
        } else {
            row.value.clone()
        };

        if !verify_checksum(&plaintext, &row.checksum) {
            self.quarantine(&mut index, &row, "checksum mismatch").await?;
            return Ok(None);
        }

        sqlx::query("UPDATE cache_entries SET last_access_at = ?2 WHERE key = ?1")
            .bind(key)
            .bind(now)
            .execute(&self.pool)
            .await?;
        if row.is_evictable() {
            index.recency.put(key.to_string(), row.size_bytes as u64);
        }
        index.hits += 1;

        Ok(Some(plaintext))
    }

    /// Metadata for one entry, without touching recency.
    pub async fn entry(&self, key: &str) -> StoreResult<Option<CacheEntry>> {
        let row = sqlx::query_as::<_, CacheRow>(
            "SELECT key, value, priority, encrypted, pinned, checksum, size_bytes, \
             expires_at, created_at, updated_at, last_access_at \
             FROM cache_entries WHERE key = ?1",
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|r| r.meta()))
    }

    // =========================================================================
    // Compaction
    // =========================================================================

    /// Reclaims expired entries first, then the coldest evictable entries
    /// until the store fits the configured byte budget.
    ///
    /// Pinned and `Critical` entries are never in the recency index, so
    /// they cannot be selected here - even under maximum pressure.
    pub async fn compact(&self) -> StoreResult<CompactReport> {
        let now = Utc::now();
        let mut index = self.index.write().await;
        let mut report = CompactReport::default();

        // Pass 1: TTL expiry.
        let expired = sqlx::query_as::<_, (String, i64)>(
            "SELECT key, size_bytes FROM cache_entries \
             WHERE expires_at IS NOT NULL AND expires_at <= ?1",
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        for (key, size) in expired {
            sqlx::query("DELETE FROM cache_entries WHERE key = ?1")
                .bind(&key)
                .execute(&self.pool)
                .await?;
            index.recency.pop(&key);
            index.expired += 1;
            report.bytes_reclaimed += size as u64;
            report.expired.push(key);
        }

        // Pass 2: coldest-first until under budget.
        let mut total: i64 =
            sqlx::query_scalar("SELECT COALESCE(SUM(size_bytes), 0) FROM cache_entries")
                .fetch_one(&self.pool)
                .await?;

        while total as u64 > self.config.max_bytes {
            let Some((key, size)) = index.recency.pop_lru() else {
                // Everything left is pinned or critical; the budget cannot
                // be met without violating the exemption, so stop.
                warn!(
                    total_bytes = total,
                    budget = self.config.max_bytes,
                    "Compaction exhausted evictable entries above budget"
                );
                break;
            };

            sqlx::query("DELETE FROM cache_entries WHERE key = ?1")
                .bind(&key)
                .execute(&self.pool)
                .await?;
            total -= size as i64;
            index.evictions += 1;
            report.bytes_reclaimed += size;
            report.evicted.push(key);
        }

        info!(
            expired = report.expired.len(),
            evicted = report.evicted.len(),
            bytes = report.bytes_reclaimed,
            "Cache compacted"
        );
        Ok(report)
    }

    // =========================================================================
    // Remote Merge
    // =========================================================================

    /// Applies a pulled delta batch and advances the cursor in a single
    /// transaction. A crash cannot advance the cursor without the merge,
    /// which is what prevents lost updates.
    ///
    /// Existing entries keep their priority/pinned/encryption flags; new
    /// entries default to `Medium`, unpinned, sealed when the kind is
    /// configured as encrypted.
    pub async fn merge_remote(
        &self,
        changes: &[RemoteChange],
        new_cursor: &str,
    ) -> StoreResult<usize> {
        let now = Utc::now();
        let mut index = self.index.write().await;
        let mut touched: Vec<(String, u64, bool)> = Vec::with_capacity(changes.len());

        let mut tx = self.pool.begin().await?;

        for change in changes {
            let existing = sqlx::query_as::<_, (i64, bool, bool)>(
                "SELECT priority, encrypted, pinned FROM cache_entries WHERE key = ?1",
            )
            .bind(&change.entity_key)
            .fetch_optional(&mut *tx)
            .await?;

            let (priority, encrypt, pinned) = match existing {
                Some((rank, encrypted, pinned)) => (
                    Priority::from_rank(rank as u8).unwrap_or(Priority::Medium),
                    encrypted,
                    pinned,
                ),
                None => (
                    Priority::Medium,
                    self.config.encrypted_kinds.contains(&change.kind),
                    false,
                ),
            };

            let plaintext = change.value.as_bytes();
            let checksum = checksum_hex(plaintext);
            let stored = if encrypt {
                let cipher = self.cipher.as_ref().ok_or_else(|| {
                    StoreError::SealFailed("no cache cipher configured".to_string())
                })?;
                cipher.seal(plaintext, change.entity_key.as_bytes())?
            } else {
                plaintext.to_vec()
            };
            let size = stored.len() as i64;

            sqlx::query(
                "INSERT INTO cache_entries \
                 (key, value, priority, encrypted, pinned, checksum, size_bytes, \
                  expires_at, created_at, updated_at, last_access_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, NULL, ?8, ?8, ?8) \
                 ON CONFLICT(key) DO UPDATE SET \
                   value = excluded.value, \
                   checksum = excluded.checksum, \
                   size_bytes = excluded.size_bytes, \
                   updated_at = excluded.updated_at, \
                   last_access_at = excluded.last_access_at",
            )
            .bind(&change.entity_key)
            .bind(&stored)
            .bind(priority.rank() as i64)
            .bind(encrypt)
            .bind(pinned)
            .bind(&checksum)
            .bind(size)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            let evictable = !pinned && priority != Priority::Critical;
            touched.push((change.entity_key.clone(), size as u64, evictable));
        }

        sqlx::query("UPDATE sync_state SET cursor = ?1, updated_at = ?2 WHERE id = 1")
            .bind(new_cursor)
            .bind(now)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;

        for (key, size, evictable) in touched {
            if evictable {
                index.recency.put(key, size);
            }
        }

        debug!(count = changes.len(), cursor = %new_cursor, "Remote batch merged");
        Ok(changes.len())
    }

    /// The delta cursor from the last successfully merged pull.
    pub async fn cursor(&self) -> StoreResult<Option<String>> {
        let cursor: Option<String> =
            sqlx::query_scalar("SELECT cursor FROM sync_state WHERE id = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(cursor)
    }

    // =========================================================================
    // Statistics
    // =========================================================================

    /// Aggregate statistics: persisted totals plus in-process counters.
    pub async fn stats(&self) -> StoreResult<CacheStats> {
        let (entries, total_bytes): (i64, i64) = sqlx::query_as(
            "SELECT COUNT(*), COALESCE(SUM(size_bytes), 0) FROM cache_entries",
        )
        .fetch_one(&self.pool)
        .await?;

        let index = self.index.read().await;
        Ok(CacheStats {
            entries: entries as u64,
            total_bytes: total_bytes as u64,
            hits: index.hits,
            misses: index.misses,
            expired: index.expired,
            evictions: index.evictions,
            quarantined: index.quarantined,
        })
    }

    /// Keys currently held in the diagnostic quarantine area.
    pub async fn quarantined_keys(&self) -> StoreResult<Vec<String>> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT key FROM cache_quarantine ORDER BY quarantined_at ASC")
                .fetch_all(&self.pool)
                .await?;
        Ok(keys)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Moves a corrupted entry out of the readable set into the diagnostic
    /// area and raises the corruption event. Idempotent under races: only
    /// the caller that actually removes the row records the quarantine.
    async fn quarantine(
        &self,
        index: &mut CacheIndex,
        row: &CacheRow,
        reason: &str,
    ) -> StoreResult<()> {
        let removed = sqlx::query("DELETE FROM cache_entries WHERE key = ?1")
            .bind(&row.key)
            .execute(&self.pool)
            .await?;

        index.recency.pop(&row.key);
        index.misses += 1;

        if removed.rows_affected() == 0 {
            return Ok(());
        }

        sqlx::query(
            "INSERT INTO cache_quarantine (key, value, expected, reason, quarantined_at) \
             VALUES (?1, ?2, ?3, ?4, ?5)",
        )
        .bind(&row.key)
        .bind(&row.value)
        .bind(&row.checksum)
        .bind(reason)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        index.quarantined += 1;
        warn!(key = %row.key, reason = %reason, "Cache entry quarantined");

        let _ = self.events.send(StoreEvent::CorruptionDetected {
            key: row.key.clone(),
            reason: reason.to_string(),
        });
        Ok(())
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Store, StoreConfig};
    use chrono::TimeZone;

    async fn fresh_cache(config: CacheConfig, cipher: Option<CacheCipher>) -> (Store, CacheStore) {
        let store = Store::new(StoreConfig::in_memory()).await.unwrap();
        let cache = CacheStore::open(store.pool().clone(), config, cipher)
            .await
            .unwrap();
        (store, cache)
    }

    fn remote_change(key: &str, kind: &str, value: &str) -> RemoteChange {
        RemoteChange {
            entity_key: key.into(),
            kind: kind.into(),
            value: value.into(),
            changed_at: Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap(),
            role: None,
            checksum: Some(checksum_hex(value.as_bytes())),
        }
    }

    #[tokio::test]
    async fn test_set_get_roundtrip() {
        let (_store, cache) = fresh_cache(CacheConfig::default(), None).await;

        cache
            .set("progress/u1", b"{\"lesson\":3}", SetOptions::default())
            .await
            .unwrap();

        let value = cache.get("progress/u1").await.unwrap().unwrap();
        assert_eq!(value, b"{\"lesson\":3}");

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.entries, 1);
    }

    #[tokio::test]
    async fn test_encrypted_roundtrip_is_transparent() {
        let cipher = CacheCipher::from_key([9u8; 32]);
        let (store, cache) = fresh_cache(CacheConfig::default(), Some(cipher)).await;

        let opts = SetOptions {
            encrypt: true,
            ..SetOptions::default()
        };
        cache.set("secret/1", b"sensitive", opts).await.unwrap();

        // The stored blob must not contain the plaintext.
        let raw: Vec<u8> =
            sqlx::query_scalar("SELECT value FROM cache_entries WHERE key = 'secret/1'")
                .fetch_one(store.pool())
                .await
                .unwrap();
        assert_ne!(raw, b"sensitive");

        let value = cache.get("secret/1").await.unwrap().unwrap();
        assert_eq!(value, b"sensitive");
    }

    #[tokio::test]
    async fn test_corrupted_checksum_quarantines_and_signals() {
        let (store, cache) = fresh_cache(CacheConfig::default(), None).await;
        let mut events = cache.subscribe();

        cache
            .set("progress/u1", b"good bytes", SetOptions::default())
            .await
            .unwrap();

        // Corrupt the stored value behind the cache's back.
        sqlx::query("UPDATE cache_entries SET value = ?1 WHERE key = 'progress/u1'")
            .bind(b"bad bytes".as_slice())
            .execute(store.pool())
            .await
            .unwrap();

        // The corrupted bytes are never returned.
        assert!(cache.get("progress/u1").await.unwrap().is_none());

        match events.try_recv().unwrap() {
            StoreEvent::CorruptionDetected { key, reason } => {
                assert_eq!(key, "progress/u1");
                assert_eq!(reason, "checksum mismatch");
            }
        }

        // Out of the readable set, into the diagnostic area.
        assert!(cache.get("progress/u1").await.unwrap().is_none());
        assert_eq!(cache.quarantined_keys().await.unwrap(), vec!["progress/u1"]);

        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.quarantined, 1);
        assert_eq!(stats.hits, 0);
    }

    #[tokio::test]
    async fn test_undecryptable_entry_treated_as_corruption() {
        let cipher = CacheCipher::from_key([1u8; 32]);
        let (store, cache) = fresh_cache(CacheConfig::default(), Some(cipher)).await;

        let opts = SetOptions {
            encrypt: true,
            ..SetOptions::default()
        };
        cache.set("secret/1", b"sensitive", opts).await.unwrap();

        // Truncate the sealed blob so authentication fails.
        sqlx::query("UPDATE cache_entries SET value = ?1 WHERE key = 'secret/1'")
            .bind([0u8; 4].as_slice())
            .execute(store.pool())
            .await
            .unwrap();

        assert!(cache.get("secret/1").await.unwrap().is_none());
        assert_eq!(cache.quarantined_keys().await.unwrap(), vec!["secret/1"]);
    }

    #[tokio::test]
    async fn test_expired_entry_reads_as_miss() {
        let (_store, cache) = fresh_cache(CacheConfig::default(), None).await;

        let opts = SetOptions {
            ttl: Some(Duration::ZERO),
            ..SetOptions::default()
        };
        cache.set("ephemeral", b"gone soon", opts).await.unwrap();

        assert!(cache.get("ephemeral").await.unwrap().is_none());
        let stats = cache.stats().await.unwrap();
        assert_eq!(stats.expired, 1);
        assert_eq!(stats.entries, 0);
    }

    #[tokio::test]
    async fn test_compact_never_touches_pinned_or_critical() {
        // A budget of zero bytes is maximum pressure: everything evictable
        // must go, everything exempt must stay.
        let config = CacheConfig {
            max_bytes: 0,
            ..CacheConfig::default()
        };
        let (_store, cache) = fresh_cache(config, None).await;

        cache
            .set(
                "pinned",
                b"pinned-value",
                SetOptions {
                    pinned: true,
                    priority: Priority::Low,
                    ..SetOptions::default()
                },
            )
            .await
            .unwrap();
        cache
            .set(
                "critical",
                b"critical-value",
                SetOptions {
                    priority: Priority::Critical,
                    ..SetOptions::default()
                },
            )
            .await
            .unwrap();
        cache
            .set("plain-1", b"v1", SetOptions::default())
            .await
            .unwrap();
        cache
            .set("plain-2", b"v2", SetOptions::default())
            .await
            .unwrap();

        let report = cache.compact().await.unwrap();

        assert_eq!(report.evicted.len(), 2);
        assert!(!report.evicted.contains(&"pinned".to_string()));
        assert!(!report.evicted.contains(&"critical".to_string()));

        assert!(cache.get("pinned").await.unwrap().is_some());
        assert!(cache.get("critical").await.unwrap().is_some());
        assert!(cache.get("plain-1").await.unwrap().is_none());
        assert!(cache.get("plain-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_compact_evicts_coldest_first() {
        let config = CacheConfig {
            // Room for roughly two of the three entries.
            max_bytes: 8,
            ..CacheConfig::default()
        };
        let (_store, cache) = fresh_cache(config, None).await;

        cache.set("a", b"aaaa", SetOptions::default()).await.unwrap();
        cache.set("b", b"bbbb", SetOptions::default()).await.unwrap();
        cache.set("c", b"cccc", SetOptions::default()).await.unwrap();

        // Touch "a" so "b" becomes the coldest.
        cache.get("a").await.unwrap();

        let report = cache.compact().await.unwrap();
        assert_eq!(report.evicted, vec!["b".to_string()]);
    }

    #[tokio::test]
    async fn test_merge_remote_is_atomic_with_cursor() {
        let (_store, cache) = fresh_cache(CacheConfig::default(), None).await;
        assert_eq!(cache.cursor().await.unwrap(), None);

        let changes = vec![
            remote_change("lesson/1", "update-lesson", "first"),
            remote_change("lesson/2", "update-lesson", "second"),
        ];
        let merged = cache.merge_remote(&changes, "cursor-7").await.unwrap();
        assert_eq!(merged, 2);

        assert_eq!(cache.cursor().await.unwrap().as_deref(), Some("cursor-7"));
        assert_eq!(cache.get("lesson/1").await.unwrap().unwrap(), b"first");
        assert_eq!(cache.get("lesson/2").await.unwrap().unwrap(), b"second");
    }

    #[tokio::test]
    async fn test_merge_remote_failure_leaves_cursor_unchanged() {
        // An encrypted kind with no cipher configured must fail the whole
        // batch: no rows, no cursor advancement.
        let config = CacheConfig {
            encrypted_kinds: ["update-secret".to_string()].into(),
            ..CacheConfig::default()
        };
        let (_store, cache) = fresh_cache(config, None).await;

        let changes = vec![
            remote_change("plain/1", "update-lesson", "ok"),
            remote_change("secret/1", "update-secret", "needs cipher"),
        ];
        let err = cache.merge_remote(&changes, "cursor-8").await.unwrap_err();
        assert!(matches!(err, StoreError::SealFailed(_)));

        assert_eq!(cache.cursor().await.unwrap(), None);
        assert!(cache.get("plain/1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_merge_remote_preserves_existing_flags() {
        let (_store, cache) = fresh_cache(CacheConfig::default(), None).await;

        cache
            .set(
                "pinned/1",
                b"local",
                SetOptions {
                    pinned: true,
                    priority: Priority::High,
                    ..SetOptions::default()
                },
            )
            .await
            .unwrap();

        cache
            .merge_remote(
                &[remote_change("pinned/1", "update-lesson", "remote")],
                "cursor-9",
            )
            .await
            .unwrap();

        let meta = cache.entry("pinned/1").await.unwrap().unwrap();
        assert!(meta.pinned);
        assert_eq!(meta.priority, Priority::High);
        assert_eq!(cache.get("pinned/1").await.unwrap().unwrap(), b"remote");
    }
}
