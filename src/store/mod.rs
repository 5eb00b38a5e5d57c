use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use tokio::sync::broadcast;

mod memory;
pub use memory::MemoryStore;

/// Ключ → JSON значение
pub type StoreMap = serde_json::Map<String, Value>;

/// Ёмкость канала уведомлений об изменениях
pub(crate) const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Ошибки хранилища
#[derive(Debug, Clone, PartialEq)]
pub enum StoreError {
    /// Сбой бэкенда (SQLite, I/O, блокировка)
    Backend(String),
    /// Значение по ключу есть, но не декодируется в ожидаемый тип
    Corrupt { key: String, message: String },
    /// Фоновая задача хранилища недоступна
    Unavailable(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::Backend(s) => write!(f, "Store backend: {}", s),
            StoreError::Corrupt { key, message } => {
                write!(f, "Corrupt value for '{}': {}", key, message)
            }
            StoreError::Unavailable(s) => write!(f, "Store unavailable: {}", s),
        }
    }
}

impl std::error::Error for StoreError {}

/// Одно изменение ключа (old → new, None = ключ отсутствует)
#[derive(Debug, Clone, PartialEq)]
pub struct StoreChange {
    pub key: String,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
}

/// Шаг атомарного обновления: текущие значения запрошенных ключей → ключи
/// для записи. Пустая карта означает "ничего не писать", `null` удаляет ключ.
pub type UpdateFn = Box<dyn FnOnce(&StoreMap) -> Result<StoreMap, StoreError> + Send>;

/// Durable async key-value store shared by the background process and panels.
///
/// A single `set` is atomic across all of its keys; there is no ordering
/// guarantee between separate calls. `update` is the only read-modify-write
/// primitive: no other writer of the same backing store, in this process or
/// another, can commit between its read and its write. Subscribers receive
/// one batch per committed call that actually changed something.
#[async_trait]
pub trait PersistentStore: Send + Sync {
    /// Missing keys are simply absent from the result
    async fn get(&self, keys: &[&str]) -> Result<StoreMap, StoreError>;

    async fn set(&self, items: StoreMap) -> Result<(), StoreError>;

    async fn remove(&self, key: &str) -> Result<(), StoreError>;

    /// Returns the items written. An `apply` error aborts without writing.
    async fn update(&self, keys: &[&str], apply: UpdateFn) -> Result<StoreMap, StoreError>;

    fn subscribe(&self) -> broadcast::Receiver<Vec<StoreChange>>;
}

/// Decode `key` from a `get` result; absent → `Ok(None)`
pub fn decode<T: DeserializeOwned>(map: &StoreMap, key: &str) -> Result<Option<T>, StoreError> {
    match map.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value(value.clone())
            .map(Some)
            .map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                message: e.to_string(),
            }),
    }
}

pub fn encode<T: Serialize>(key: &str, value: &T) -> Result<Value, StoreError> {
    serde_json::to_value(value).map_err(|e| StoreError::Corrupt {
        key: key.to_string(),
        message: e.to_string(),
    })
}

/// Diff helper shared by the store implementations
pub(crate) fn diff_entry(key: &str, old: Option<&Value>, new: Option<&Value>) -> Option<StoreChange> {
    if old == new {
        return None;
    }
    Some(StoreChange {
        key: key.to_string(),
        old_value: old.cloned(),
        new_value: new.cloned(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DailyStats;
    use serde_json::json;

    #[test]
    fn test_decode_absent_and_null() {
        let mut map = StoreMap::new();
        map.insert("a".into(), Value::Null);
        assert_eq!(decode::<DailyStats>(&map, "a").unwrap(), None);
        assert_eq!(decode::<DailyStats>(&map, "b").unwrap(), None);
    }

    #[test]
    fn test_decode_corrupt_value() {
        let mut map = StoreMap::new();
        map.insert("dailyStats".into(), json!("garbage"));
        match decode::<DailyStats>(&map, "dailyStats") {
            Err(StoreError::Corrupt { key, .. }) => assert_eq!(key, "dailyStats"),
            other => panic!("Expected Corrupt, got {:?}", other),
        }
    }

    #[test]
    fn test_diff_entry_skips_unchanged() {
        assert!(diff_entry("k", Some(&json!(1)), Some(&json!(1))).is_none());
        let change = diff_entry("k", None, Some(&json!(2))).unwrap();
        assert_eq!(change.old_value, None);
        assert_eq!(change.new_value, Some(json!(2)));
    }
}
