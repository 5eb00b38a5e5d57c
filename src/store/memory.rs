use super::{
    diff_entry, PersistentStore, StoreChange, StoreError, StoreMap, UpdateFn, CHANGE_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

/// In-process store for tests and embedding.
///
/// Every operation yields once before touching the map so that concurrent
/// callers interleave the way they would against a real async backend.
pub struct MemoryStore {
    data: Mutex<StoreMap>,
    changes: broadcast::Sender<Vec<StoreChange>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            data: Mutex::new(StoreMap::new()),
            changes,
            fail_reads: AtomicBool::new(false),
            fail_writes: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    pub fn with_data(data: StoreMap) -> Self {
        let store = Self::new();
        if let Ok(mut guard) = store.data.lock() {
            *guard = data;
        }
        store
    }

    /// Все последующие get() завершаются ошибкой
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Все последующие set()/remove() завершаются ошибкой
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Number of successful set/remove calls
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    pub fn snapshot(&self) -> StoreMap {
        self.data.lock().map(|d| d.clone()).unwrap_or_default()
    }

    fn lock_data(&self) -> Result<std::sync::MutexGuard<'_, StoreMap>, StoreError> {
        self.data
            .lock()
            .map_err(|e| StoreError::Backend(format!("Mutex poisoned: {}", e)))
    }

    fn publish(&self, batch: Vec<StoreChange>) {
        if !batch.is_empty() {
            // Нет подписчиков: не ошибка
            let _ = self.changes.send(batch);
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PersistentStore for MemoryStore {
    async fn get(&self, keys: &[&str]) -> Result<StoreMap, StoreError> {
        tokio::task::yield_now().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("Injected read failure".to_string()));
        }
        let data = self.lock_data()?;
        Ok(keys
            .iter()
            .filter_map(|k| data.get(*k).map(|v| (k.to_string(), v.clone())))
            .collect())
    }

    async fn set(&self, items: StoreMap) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("Injected write failure".to_string()));
        }
        let batch = {
            let mut data = self.lock_data()?;
            let mut batch = Vec::new();
            for (key, value) in items {
                if let Some(change) = diff_entry(&key, data.get(&key), Some(&value)) {
                    batch.push(change);
                }
                data.insert(key, value);
            }
            batch
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.publish(batch);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        tokio::task::yield_now().await;
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("Injected write failure".to_string()));
        }
        let change = {
            let mut data = self.lock_data()?;
            let old = data.remove(key);
            diff_entry(key, old.as_ref(), None)
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.publish(change.into_iter().collect());
        Ok(())
    }

    async fn update(&self, keys: &[&str], apply: UpdateFn) -> Result<StoreMap, StoreError> {
        tokio::task::yield_now().await;
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Backend("Injected read failure".to_string()));
        }
        let (written, batch) = {
            let mut data = self.lock_data()?;
            let current: StoreMap = keys
                .iter()
                .filter_map(|k| data.get(*k).map(|v| (k.to_string(), v.clone())))
                .collect();
            let written = apply(&current)?;
            if written.is_empty() {
                return Ok(written);
            }
            if self.fail_writes.load(Ordering::SeqCst) {
                return Err(StoreError::Backend("Injected write failure".to_string()));
            }
            let mut batch = Vec::new();
            for (key, value) in &written {
                let new = if value.is_null() { None } else { Some(value) };
                if let Some(change) = diff_entry(key, data.get(key), new) {
                    batch.push(change);
                }
                match new {
                    Some(value) => {
                        data.insert(key.clone(), value.clone());
                    }
                    None => {
                        data.remove(key);
                    }
                }
            }
            (written, batch)
        };
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.publish(batch);
        Ok(written)
    }

    fn subscribe(&self) -> broadcast::Receiver<Vec<StoreChange>> {
        self.changes.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_set_get_remove() {
        let store = MemoryStore::new();
        let mut items = StoreMap::new();
        items.insert("a".into(), json!(1));
        items.insert("b".into(), json!({"x": true}));
        store.set(items).await.unwrap();

        let got = store.get(&["a", "b", "missing"]).await.unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got["a"], json!(1));

        store.remove("a").await.unwrap();
        assert!(store.get(&["a"]).await.unwrap().is_empty());
        assert_eq!(store.write_count(), 2);
    }

    #[tokio::test]
    async fn test_update_reads_and_writes_in_one_step() {
        let mut data = StoreMap::new();
        data.insert("n".into(), json!(4));
        let store = MemoryStore::with_data(data);

        let written = store
            .update(
                &["n"],
                Box::new(|current: &StoreMap| {
                    let n = current.get("n").and_then(|v| v.as_u64()).unwrap_or(0);
                    let mut items = StoreMap::new();
                    items.insert("n".into(), json!(n + 1));
                    Ok(items)
                }),
            )
            .await
            .unwrap();
        assert_eq!(written["n"], json!(5));
        assert_eq!(store.snapshot()["n"], json!(5));

        // Пустой результат и ошибка шага ничего не пишут
        let writes = store.write_count();
        store
            .update(&["n"], Box::new(|_: &StoreMap| Ok(StoreMap::new())))
            .await
            .unwrap();
        let failed = store
            .update(
                &["n"],
                Box::new(|_: &StoreMap| Err(StoreError::Backend("nope".to_string()))),
            )
            .await;
        assert!(failed.is_err());
        assert_eq!(store.write_count(), writes);
        assert_eq!(store.snapshot()["n"], json!(5));
    }

    #[tokio::test]
    async fn test_update_null_removes_key() {
        let mut data = StoreMap::new();
        data.insert("sessionStartTime".into(), json!(1_000));
        let store = MemoryStore::with_data(data);
        let mut rx = store.subscribe();

        store
            .update(
                &["sessionStartTime"],
                Box::new(|_: &StoreMap| {
                    let mut items = StoreMap::new();
                    items.insert("sessionStartTime".into(), serde_json::Value::Null);
                    Ok(items)
                }),
            )
            .await
            .unwrap();
        assert!(store.snapshot().is_empty());
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch[0].old_value, Some(json!(1_000)));
        assert_eq!(batch[0].new_value, None);
    }

    #[tokio::test]
    async fn test_change_notifications_only_for_changed_keys() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();

        let mut items = StoreMap::new();
        items.insert("a".into(), json!(1));
        store.set(items.clone()).await.unwrap();
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].key, "a");

        // Та же запись без изменений, уведомления нет
        store.set(items).await.unwrap();
        store.remove("a").await.unwrap();
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch[0].new_value, None);
        assert_eq!(batch[0].old_value, Some(json!(1)));
    }

    #[tokio::test]
    async fn test_injected_failures() {
        let store = MemoryStore::new();
        store.set_fail_reads(true);
        assert!(store.get(&["a"]).await.is_err());
        store.set_fail_writes(true);
        assert!(store.set(StoreMap::new()).await.is_err());
        assert!(store.remove("a").await.is_err());
        assert_eq!(store.write_count(), 0);
    }
}
