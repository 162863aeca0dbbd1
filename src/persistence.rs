//! Durable record of concealed identities and the user's thresholds.
//!
//! Every write is a per-key read-merge-write on the store, so two pipelines
//! sharing one store never drop each other's identities or increments.

use crate::decision::{valid_unit, Identity, Policy};
use crate::errors::{SafeLock, VeilError, VeilResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast;
use tracing::{debug, info};

pub const KEY_AI_THRESHOLD: &str = "aiGeneratedThreshold";
pub const KEY_MISINFO_THRESHOLD: &str = "newsThreshold";
pub const KEY_TOTAL_COUNT: &str = "totalRemovedCount";
pub const KEY_REMOVED_URLS: &str = "removedPostUrls";
pub const KEY_LAST_REMOVED_AT: &str = "lastRemovedAt";

const CHANGE_CAPACITY: usize = 64;

/// A key written or removed in the store. `value` is `None` on removal.
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub key: String,
    pub value: Option<Value>,
}

impl StoreChange {
    pub fn is_policy(&self) -> bool {
        self.key == KEY_AI_THRESHOLD || self.key == KEY_MISINFO_THRESHOLD
    }
}

/// Merge function applied to the current value of one key.
pub type Merge<'a> = &'a (dyn Fn(Option<Value>) -> Option<Value> + Send + Sync);

#[async_trait]
pub trait KeyValueStore: Send + Sync {
    async fn get(&self, key: &str) -> VeilResult<Option<Value>>;

    async fn set(&self, key: &str, value: Value) -> VeilResult<()>;

    /// Atomically replace the value of `key` with `merge(current)` and return
    /// the stored result. `merge` may be called more than once under contention.
    async fn update(&self, key: &str, merge: Merge<'_>) -> VeilResult<Option<Value>>;

    async fn remove(&self, key: &str) -> VeilResult<()>;

    fn subscribe(&self) -> broadcast::Receiver<StoreChange>;
}

/// Sled-backed store. Clones share the database and the change channel.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    tree: sled::Tree,
    changes: broadcast::Sender<StoreChange>,
}

impl SledStore {
    pub fn open<P: AsRef<Path>>(path: P) -> VeilResult<Self> {
        let path = path.as_ref();
        let db = sled::open(path)
            .map_err(|e| VeilError::database(format!("opening store at {}", path.display()), e))?;
        let tree = db.open_tree("settings")?;
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Ok(Self { db, tree, changes })
    }

    fn decode(bytes: Option<&[u8]>) -> Option<Value> {
        bytes.and_then(|b| serde_json::from_slice(b).ok())
    }

    fn notify(&self, key: &str, value: Option<Value>) {
        // No receivers is fine.
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
            value,
        });
    }
}

#[async_trait]
impl KeyValueStore for SledStore {
    async fn get(&self, key: &str) -> VeilResult<Option<Value>> {
        Ok(Self::decode(self.tree.get(key)?.as_deref()))
    }

    async fn set(&self, key: &str, value: Value) -> VeilResult<()> {
        self.tree.insert(key, value.to_string().into_bytes())?;
        self.db.flush()?;
        self.notify(key, Some(value));
        Ok(())
    }

    async fn update(&self, key: &str, merge: Merge<'_>) -> VeilResult<Option<Value>> {
        let stored = self.tree.update_and_fetch(key, |old| {
            merge(Self::decode(old)).map(|v| v.to_string().into_bytes())
        })?;
        self.db.flush()?;
        let value = Self::decode(stored.as_deref());
        self.notify(key, value.clone());
        Ok(value)
    }

    async fn remove(&self, key: &str) -> VeilResult<()> {
        self.tree.remove(key)?;
        self.db.flush()?;
        self.notify(key, None);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

/// In-process store for tests and embedding.
#[derive(Clone)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Value>>>,
    changes: broadcast::Sender<StoreChange>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CAPACITY);
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            changes,
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn notify(&self, key: &str, value: Option<Value>) {
        let _ = self.changes.send(StoreChange {
            key: key.to_string(),
            value,
        });
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> VeilResult<Option<Value>> {
        Ok(self.entries.safe_lock()?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> VeilResult<()> {
        self.entries.safe_lock()?.insert(key.to_string(), value.clone());
        self.notify(key, Some(value));
        Ok(())
    }

    async fn update(&self, key: &str, merge: Merge<'_>) -> VeilResult<Option<Value>> {
        let value = {
            let mut entries = self.entries.safe_lock()?;
            let next = merge(entries.get(key).cloned());
            match &next {
                Some(v) => entries.insert(key.to_string(), v.clone()),
                None => entries.remove(key),
            };
            next
        };
        self.notify(key, value.clone());
        Ok(value)
    }

    async fn remove(&self, key: &str) -> VeilResult<()> {
        self.entries.safe_lock()?.remove(key);
        self.notify(key, None);
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.changes.subscribe()
    }
}

/// In-memory view of concealed identities. `unsaved` holds first-time
/// insertions not yet merged into the store; only those the store has never
/// seen add to the stored counter.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConcealmentRecord {
    identities: BTreeSet<Identity>,
    total_concealed_count: u64,
    unsaved: BTreeSet<Identity>,
    last_concealed_at: Option<DateTime<Utc>>,
}

impl ConcealmentRecord {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns true, and bumps the counter, only on first insertion.
    pub fn insert(&mut self, identity: &Identity) -> bool {
        if !self.identities.insert(identity.clone()) {
            return false;
        }
        self.total_concealed_count += 1;
        self.unsaved.insert(identity.clone());
        self.last_concealed_at = Some(Utc::now());
        true
    }

    pub fn contains(&self, identity: &Identity) -> bool {
        self.identities.contains(identity)
    }

    pub fn identities(&self) -> impl Iterator<Item = &Identity> {
        self.identities.iter()
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn total_concealed_count(&self) -> u64 {
        self.total_concealed_count
    }

    pub fn unsaved_delta(&self) -> u64 {
        self.unsaved.len() as u64
    }

    pub fn last_concealed_at(&self) -> Option<DateTime<Utc>> {
        self.last_concealed_at
    }

    pub fn has_unsaved(&self) -> bool {
        !self.unsaved.is_empty()
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    fn absorb(&mut self, stored_urls: &[String], stored_count: u64, stored_at: Option<DateTime<Utc>>) {
        let saved = self.total_concealed_count - self.unsaved_delta();
        for identity in stored_urls.iter().filter_map(|url| Identity::new(url)) {
            // Already counted by whoever stored it.
            self.unsaved.remove(&identity);
            self.identities.insert(identity);
        }
        self.total_concealed_count = saved.max(stored_count) + self.unsaved_delta();
        self.last_concealed_at = match (self.last_concealed_at, stored_at) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        };
    }
}

/// Snapshot for the settings surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordStats {
    pub total_removed_count: u64,
    pub removed_post_count: usize,
    pub last_removed_at: Option<DateTime<Utc>>,
}

fn as_urls(value: Option<&Value>) -> Vec<String> {
    value
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

fn as_count(value: Option<&Value>) -> u64 {
    value.and_then(Value::as_u64).unwrap_or(0)
}

fn as_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value
        .and_then(Value::as_str)
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn as_threshold(value: Option<&Value>) -> Option<f64> {
    value.and_then(Value::as_f64).filter(|v| valid_unit(*v))
}

#[derive(Clone)]
pub struct PersistenceBridge {
    store: Arc<dyn KeyValueStore>,
    default_policy: Policy,
}

impl PersistenceBridge {
    pub fn new(store: Arc<dyn KeyValueStore>, default_policy: Policy) -> Self {
        Self {
            store,
            default_policy,
        }
    }

    pub fn store(&self) -> Arc<dyn KeyValueStore> {
        Arc::clone(&self.store)
    }

    /// Stored thresholds, falling back per key to the configured defaults when
    /// absent or out of range.
    pub async fn load_policy(&self) -> VeilResult<Policy> {
        let ai = self.store.get(KEY_AI_THRESHOLD).await?;
        let misinfo = self.store.get(KEY_MISINFO_THRESHOLD).await?;
        Ok(Policy::new(
            as_threshold(ai.as_ref()).unwrap_or(self.default_policy.ai_threshold),
            as_threshold(misinfo.as_ref()).unwrap_or(self.default_policy.misinfo_threshold),
        ))
    }

    /// Union the stored record into `record` and return the stored policy.
    pub async fn load_policy_and_record(&self, record: &mut ConcealmentRecord) -> VeilResult<Policy> {
        let urls = self.store.get(KEY_REMOVED_URLS).await?;
        let count = self.store.get(KEY_TOTAL_COUNT).await?;
        let at = self.store.get(KEY_LAST_REMOVED_AT).await?;
        record.absorb(
            &as_urls(urls.as_ref()),
            as_count(count.as_ref()),
            as_timestamp(at.as_ref()),
        );
        debug!(identities = record.len(), total = record.total_concealed_count(), "record loaded");
        self.load_policy().await
    }

    /// Merge `record` into the store and write the merged state back into it.
    pub async fn save_record(&self, record: &mut ConcealmentRecord) -> VeilResult<()> {
        let local: Vec<String> = record.identities().map(|id| id.as_str().to_string()).collect();
        let unsaved: Vec<String> = record.unsaved.iter().map(|id| id.as_str().to_string()).collect();
        // The merge may run more than once under contention; the last run wins.
        let fresh = AtomicU64::new(0);
        let merge_urls = |current: Option<Value>| {
            let mut merged: BTreeSet<String> = as_urls(current.as_ref()).into_iter().collect();
            let unseen = unsaved.iter().filter(|url| !merged.contains(*url)).count();
            fresh.store(unseen as u64, Ordering::SeqCst);
            merged.extend(local.iter().cloned());
            Some(Value::from(merged.into_iter().collect::<Vec<_>>()))
        };
        let urls = self.store.update(KEY_REMOVED_URLS, &merge_urls).await?;

        let delta = fresh.load(Ordering::SeqCst);
        let floor = record.total_concealed_count() - record.unsaved_delta();
        let merge_count = |current: Option<Value>| {
            let stored = as_count(current.as_ref()).max(floor);
            Some(Value::from(stored + delta))
        };
        let count = self.store.update(KEY_TOTAL_COUNT, &merge_count).await?;

        if let Some(at) = record.last_concealed_at() {
            if delta > 0 {
                self.store
                    .set(KEY_LAST_REMOVED_AT, Value::from(at.to_rfc3339()))
                    .await?;
            }
        }

        let stored_count = as_count(count.as_ref());
        record.unsaved.clear();
        record.total_concealed_count = stored_count;
        record.absorb(&as_urls(urls.as_ref()), stored_count, None);
        debug!(identities = record.len(), total = stored_count, "record saved");
        Ok(())
    }

    pub async fn save_policy(&self, policy: &Policy) -> VeilResult<()> {
        if !valid_unit(policy.ai_threshold) {
            return Err(VeilError::validation(KEY_AI_THRESHOLD, "must be within 0..=1"));
        }
        if !valid_unit(policy.misinfo_threshold) {
            return Err(VeilError::validation(KEY_MISINFO_THRESHOLD, "must be within 0..=1"));
        }
        self.store
            .set(KEY_AI_THRESHOLD, Value::from(policy.ai_threshold))
            .await?;
        self.store
            .set(KEY_MISINFO_THRESHOLD, Value::from(policy.misinfo_threshold))
            .await?;
        info!(
            ai_threshold = policy.ai_threshold,
            misinfo_threshold = policy.misinfo_threshold,
            "policy saved"
        );
        Ok(())
    }

    /// Explicit clearing: the only way identities leave the record.
    pub async fn clear_record(&self) -> VeilResult<()> {
        self.store.remove(KEY_REMOVED_URLS).await?;
        self.store.set(KEY_TOTAL_COUNT, Value::from(0u64)).await?;
        self.store.remove(KEY_LAST_REMOVED_AT).await?;
        info!("concealment record cleared");
        Ok(())
    }

    pub async fn stats(&self) -> VeilResult<RecordStats> {
        let urls = self.store.get(KEY_REMOVED_URLS).await?;
        let count = self.store.get(KEY_TOTAL_COUNT).await?;
        let at = self.store.get(KEY_LAST_REMOVED_AT).await?;
        Ok(RecordStats {
            total_removed_count: as_count(count.as_ref()),
            removed_post_count: as_urls(urls.as_ref()).len(),
            last_removed_at: as_timestamp(at.as_ref()),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreChange> {
        self.store.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn id(s: &str) -> Identity {
        Identity::new(s).unwrap()
    }

    fn bridge(store: &MemoryStore) -> PersistenceBridge {
        PersistenceBridge::new(Arc::new(store.clone()), Policy::default())
    }

    #[test]
    fn record_counts_first_insertions_only() {
        let mut record = ConcealmentRecord::new();
        assert!(record.insert(&id("a")));
        assert!(!record.insert(&id("a")));
        assert!(record.insert(&id("b")));
        assert_eq!(record.total_concealed_count(), 2);
        assert_eq!(record.unsaved_delta(), 2);
        assert!(record.last_concealed_at().is_some());
    }

    #[tokio::test]
    async fn concurrent_writers_merge_instead_of_clobbering() {
        let store = MemoryStore::new();
        let first = bridge(&store);
        let second = bridge(&store);

        let mut a = ConcealmentRecord::new();
        let mut b = ConcealmentRecord::new();
        first.load_policy_and_record(&mut a).await.unwrap();
        second.load_policy_and_record(&mut b).await.unwrap();

        a.insert(&id("https://cdn/a.jpg"));
        b.insert(&id("https://cdn/b.jpg"));
        b.insert(&id("https://cdn/c.jpg"));
        first.save_record(&mut a).await.unwrap();
        second.save_record(&mut b).await.unwrap();

        let stats = first.stats().await.unwrap();
        assert_eq!(stats.removed_post_count, 3);
        assert_eq!(stats.total_removed_count, 3);
        assert_eq!(b.len(), 3);
        assert!(!b.has_unsaved());
    }

    #[tokio::test]
    async fn same_identity_concealed_by_two_writers_counts_once() {
        let store = MemoryStore::new();
        let first = bridge(&store);
        let second = bridge(&store);

        let mut a = ConcealmentRecord::new();
        let mut b = ConcealmentRecord::new();
        first.load_policy_and_record(&mut a).await.unwrap();
        second.load_policy_and_record(&mut b).await.unwrap();

        a.insert(&id("https://cdn/x.jpg"));
        b.insert(&id("https://cdn/x.jpg"));
        first.save_record(&mut a).await.unwrap();
        second.save_record(&mut b).await.unwrap();

        let stats = first.stats().await.unwrap();
        assert_eq!(stats.removed_post_count, 1);
        assert_eq!(stats.total_removed_count, 1);
        assert_eq!(b.total_concealed_count(), 1);

        // A later load sees the identity as already counted.
        let mut c = ConcealmentRecord::new();
        c.insert(&id("https://cdn/x.jpg"));
        first.load_policy_and_record(&mut c).await.unwrap();
        assert!(!c.has_unsaved());
        assert_eq!(c.total_concealed_count(), 1);
    }

    #[tokio::test]
    async fn resaving_without_changes_keeps_the_count() {
        let store = MemoryStore::new();
        let bridge = bridge(&store);
        let mut record = ConcealmentRecord::new();
        record.insert(&id("a"));
        bridge.save_record(&mut record).await.unwrap();
        bridge.save_record(&mut record).await.unwrap();
        assert_eq!(bridge.stats().await.unwrap().total_removed_count, 1);
    }

    #[tokio::test]
    async fn load_unions_with_local_state() {
        let store = MemoryStore::new();
        store
            .set(KEY_REMOVED_URLS, serde_json::json!(["x", "y"]))
            .await
            .unwrap();
        store.set(KEY_TOTAL_COUNT, Value::from(5u64)).await.unwrap();
        store.set(KEY_AI_THRESHOLD, Value::from(0.4)).await.unwrap();

        let mut record = ConcealmentRecord::new();
        record.insert(&id("z"));
        let policy = bridge(&store).load_policy_and_record(&mut record).await.unwrap();

        assert_eq!(record.len(), 3);
        assert_eq!(record.total_concealed_count(), 6);
        assert_eq!(policy, Policy::new(0.4, 0.5));
    }

    #[tokio::test]
    async fn invalid_stored_threshold_falls_back() {
        let store = MemoryStore::new();
        store.set(KEY_MISINFO_THRESHOLD, Value::from(3.0)).await.unwrap();
        let policy = bridge(&store).load_policy().await.unwrap();
        assert_eq!(policy, Policy::default());
    }

    #[tokio::test]
    async fn save_policy_notifies_subscribers() {
        let store = MemoryStore::new();
        let bridge = bridge(&store);
        let mut rx = bridge.subscribe();
        bridge.save_policy(&Policy::new(0.9, 0.9)).await.unwrap();

        let change = rx.recv().await.unwrap();
        assert!(change.is_policy());
        assert_eq!(bridge.load_policy().await.unwrap(), Policy::new(0.9, 0.9));
        assert!(bridge.save_policy(&Policy::new(-0.1, 0.5)).await.is_err());
    }

    #[tokio::test]
    async fn clear_resets_everything() {
        let store = MemoryStore::new();
        let bridge = bridge(&store);
        let mut record = ConcealmentRecord::new();
        record.insert(&id("a"));
        bridge.save_record(&mut record).await.unwrap();
        bridge.clear_record().await.unwrap();

        let stats = bridge.stats().await.unwrap();
        assert_eq!(stats.total_removed_count, 0);
        assert_eq!(stats.removed_post_count, 0);
        assert_eq!(stats.last_removed_at, None);
    }
}
