use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqliteResult};
use scopeguard::{guard, ScopeGuard};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::store::{
    diff_entry, PersistentStore, StoreChange, StoreError, StoreMap, UpdateFn,
    CHANGE_CHANNEL_CAPACITY,
};
use async_trait::async_trait;
use chrono::Utc;
use rusqlite::Error::InvalidParameterName;

/// Log IO-related DB errors for easier diagnosis (disk full, permission denied).
/// Does not change error propagation: caller still returns Err.
fn log_io_error_if_any(context: &str, e: &rusqlite::Error) {
    use rusqlite::ffi::ErrorCode;
    if let rusqlite::Error::SqliteFailure(ffi_err, _) = e {
        match ffi_err.code {
            ErrorCode::DiskFull => {
                error!(
                    "[DB] {}: Disk full. Free space on drive or check data directory.",
                    context
                );
            }
            ErrorCode::ReadOnly | ErrorCode::CannotOpen => {
                error!(
                    "[DB] {}: Permission denied or read-only. Check data directory is writable.",
                    context
                );
            }
            ErrorCode::SystemIoFailure => {
                error!("[DB] {}: I/O error. Check disk and permissions.", context);
            }
            ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked => {
                warn!("[DB] {}: Database busy (another process holds the lock).", context);
            }
            _ => {}
        }
    }
}

fn parse_value(raw: &str) -> SqliteResult<serde_json::Value> {
    serde_json::from_str(raw)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))
}

fn begin_immediate(conn: &Connection, context: &str) -> SqliteResult<()> {
    conn.execute_batch("BEGIN IMMEDIATE TRANSACTION").map_err(|e| {
        log_io_error_if_any(context, &e);
        e
    })
}

fn commit(conn: &Connection, context: &str) -> SqliteResult<()> {
    conn.execute_batch("COMMIT").map_err(|e| {
        log_io_error_if_any(context, &e);
        e
    })
}

fn read_values(conn: &Connection, keys: &[String]) -> SqliteResult<StoreMap> {
    let mut stmt = conn.prepare_cached("SELECT value FROM storage WHERE key = ?1")?;
    let mut result = StoreMap::new();
    for key in keys {
        let raw: Option<String> = stmt.query_row(params![key], |r| r.get(0)).optional()?;
        if let Some(raw) = raw {
            result.insert(key.clone(), parse_value(&raw)?);
        }
    }
    Ok(result)
}

/// Upsert внутри уже открытой транзакции; возвращает реально изменённые ключи.
/// `null` удаляет ключ.
fn write_items(conn: &Connection, items: &StoreMap) -> SqliteResult<Vec<StoreChange>> {
    let now = Utc::now().timestamp();
    let mut batch = Vec::new();
    for (key, value) in items {
        let old: Option<serde_json::Value> = conn
            .query_row(
                "SELECT value FROM storage WHERE key = ?1",
                params![key],
                |r| r.get::<_, String>(0),
            )
            .optional()?
            // Старое значение нечитаемо, всё равно перезаписываем
            .and_then(|raw| serde_json::from_str(&raw).ok());
        if value.is_null() {
            conn.execute("DELETE FROM storage WHERE key = ?1", params![key])?;
            if let Some(change) = diff_entry(key, old.as_ref(), None) {
                batch.push(change);
            }
            continue;
        }
        let encoded = serde_json::to_string(value)
            .map_err(|e| InvalidParameterName(format!("Failed to encode '{}': {}", key, e)))?;
        conn.execute(
            "INSERT INTO storage (key, value, updated_at) VALUES (?1, ?2, ?3)
             ON CONFLICT(key) DO UPDATE SET value = ?2, updated_at = ?3",
            params![key, encoded, now],
        )?;
        if let Some(change) = diff_entry(key, old.as_ref(), Some(value)) {
            batch.push(change);
        }
    }
    Ok(batch)
}

/// SQLite-backed PersistentStore.
/// Файл БД общий для фонового процесса и панелей; изменения других процессов
/// обнаруживаются через `PRAGMA data_version` (см. spawn_change_watcher).
#[derive(Clone)]
pub struct Database {
    pub(crate) conn: Arc<Mutex<Connection>>,
    changes: broadcast::Sender<Vec<StoreChange>>,
}

impl Database {
    /// Безопасная блокировка соединения с обработкой poisoned mutex
    fn lock_conn(&self) -> Result<std::sync::MutexGuard<'_, Connection>, rusqlite::Error> {
        self.conn.lock().map_err(|e| {
            InvalidParameterName(format!(
                "Database mutex poisoned: {}. A panic occurred while holding the lock. \
                 Please restart the application to recover.",
                e
            ))
        })
    }

    pub fn new(db_path: &str) -> SqliteResult<Self> {
        let conn = Connection::open(db_path)?;

        // GUARD: Integrity check on startup: detect corruption before init
        let integrity: String = conn
            .query_row("PRAGMA integrity_check", [], |r| r.get(0))
            .map_err(|e| InvalidParameterName(format!("Integrity check failed: {}", e)))?;
        if integrity.to_lowercase() != "ok" {
            return Err(InvalidParameterName(format!(
                "Database corruption detected: {}",
                integrity
            )));
        }

        // WAL: панели читают, пока фоновый процесс пишет
        conn.pragma_update(None, "journal_mode", "WAL")
            .map_err(|e| {
                warn!(
                    "[DB] Failed to enable WAL mode: {}. Continuing with default journal mode.",
                    e
                );
            })
            .ok();
        let _ = conn.pragma_update(None, "synchronous", "NORMAL");
        // Короткие конфликты между процессами ждём, а не падаем сразу
        let _ = conn.busy_timeout(Duration::from_secs(5));

        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
            changes,
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Current schema version (PRAGMA user_version). Bump when adding migrations.
    const SCHEMA_VERSION: i32 = 1;

    fn run_migrations(&self) -> SqliteResult<()> {
        let conn = self.lock_conn()?;
        let current: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;

        if current < 1 {
            conn.execute(
                "CREATE TABLE IF NOT EXISTS storage (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at INTEGER NOT NULL
            )",
                [],
            )?;
        }

        conn.pragma_update(None, "user_version", Self::SCHEMA_VERSION)?;
        Ok(())
    }

    /// Прочитать значения по ключам (отсутствующие ключи пропускаются)
    pub fn get_values(&self, keys: &[String]) -> SqliteResult<StoreMap> {
        let conn = self.lock_conn()?;
        read_values(&conn, keys)
    }

    /// Записать все ключи одной транзакцией
    /// GUARD: либо все ключи записаны, либо ни один (ROLLBACK через scopeguard)
    pub fn set_values(&self, items: StoreMap) -> SqliteResult<Vec<StoreChange>> {
        let conn = self.lock_conn()?;
        begin_immediate(&conn, "set_values")?;
        let tx = guard(&*conn, |c| {
            warn!("[DB] Rolling back storage transaction");
            let _ = c.execute_batch("ROLLBACK");
        });

        let batch = write_items(&tx, &items)?;

        commit(&tx, "set_values")?;
        ScopeGuard::into_inner(tx);
        Ok(batch)
    }

    /// Read-modify-write под одной IMMEDIATE транзакцией.
    /// RESERVED lock берётся до чтения, поэтому другой процесс на том же файле
    /// не может закоммитить между чтением и записью (ждёт busy_timeout).
    /// Внешний Result - ошибка SQLite, внутренний - ошибка шага `apply`.
    pub fn update_values(
        &self,
        keys: &[String],
        apply: UpdateFn,
    ) -> SqliteResult<Result<(StoreMap, Vec<StoreChange>), StoreError>> {
        let conn = self.lock_conn()?;
        begin_immediate(&conn, "update_values")?;
        let tx = guard(&*conn, |c| {
            warn!("[DB] Rolling back storage transaction");
            let _ = c.execute_batch("ROLLBACK");
        });

        let current = read_values(&tx, keys)?;
        let items = match apply(&current) {
            Ok(items) => items,
            // guard откатит транзакцию
            Err(e) => return Ok(Err(e)),
        };
        let batch = write_items(&tx, &items)?;

        commit(&tx, "update_values")?;
        ScopeGuard::into_inner(tx);
        Ok(Ok((items, batch)))
    }

    pub fn remove_value(&self, key: &str) -> SqliteResult<Option<StoreChange>> {
        let conn = self.lock_conn()?;
        let old: Option<String> = conn
            .query_row(
                "SELECT value FROM storage WHERE key = ?1",
                params![key],
                |r| r.get(0),
            )
            .optional()?;
        conn.execute("DELETE FROM storage WHERE key = ?1", params![key])?;
        let old = old.and_then(|raw| serde_json::from_str::<serde_json::Value>(&raw).ok());
        Ok(diff_entry(key, old.as_ref(), None))
    }

    /// Все ключи (для diff при внешних изменениях)
    pub fn load_all(&self) -> SqliteResult<StoreMap> {
        let conn = self.lock_conn()?;
        let mut stmt = conn.prepare("SELECT key, value FROM storage")?;
        let rows = stmt.query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?)))?;
        let mut result = StoreMap::new();
        for row in rows {
            let (key, raw) = row?;
            match serde_json::from_str(&raw) {
                Ok(value) => {
                    result.insert(key, value);
                }
                Err(e) => warn!("[DB] Skipping unreadable value for '{}': {}", key, e),
            }
        }
        Ok(result)
    }

    /// Меняется только при коммитах ДРУГИХ соединений
    fn data_version(&self) -> SqliteResult<i64> {
        let conn = self.lock_conn()?;
        conn.query_row("PRAGMA data_version", [], |r| r.get(0))
    }

    fn publish(&self, batch: Vec<StoreChange>) {
        if !batch.is_empty() {
            let _ = self.changes.send(batch);
        }
    }

    /// Poll for commits made by other processes and re-publish them as change
    /// batches. Own writes are already published by set/remove.
    pub fn spawn_change_watcher(&self, interval: Duration) -> JoinHandle<()> {
        let db = self.clone();
        let mut own_changes = self.changes.subscribe();
        tokio::spawn(async move {
            let initial = {
                let db = db.clone();
                tokio::task::spawn_blocking(move || -> SqliteResult<(i64, StoreMap)> {
                    Ok((db.data_version()?, db.load_all()?))
                })
                .await
            };
            let (mut version, mut snapshot) = match initial {
                Ok(Ok(v)) => v,
                Ok(Err(e)) => {
                    error!("[DB] Change watcher failed to start: {}", e);
                    return;
                }
                Err(e) => {
                    error!("[DB] Change watcher failed to start: {}", e);
                    return;
                }
            };

            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    own = own_changes.recv() => match own {
                        Ok(batch) => apply_changes(&mut snapshot, &batch),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!("[DB] Change watcher lagged by {} batches", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => return,
                    },
                    _ = ticker.tick() => {
                        let polled = {
                            let db = db.clone();
                            tokio::task::spawn_blocking(move || -> SqliteResult<Option<(i64, StoreMap)>> {
                                let current = db.data_version()?;
                                if current == version {
                                    return Ok(None);
                                }
                                Ok(Some((current, db.load_all()?)))
                            })
                            .await
                        };
                        match polled {
                            Ok(Ok(Some((current, fresh)))) => {
                                let batch = diff_maps(&snapshot, &fresh);
                                version = current;
                                snapshot = fresh;
                                if !batch.is_empty() {
                                    debug!("[DB] {} key(s) changed by another process", batch.len());
                                    db.publish(batch);
                                }
                            }
                            Ok(Ok(None)) => {}
                            Ok(Err(e)) => warn!("[DB] Change watcher poll failed: {}", e),
                            Err(e) => warn!("[DB] Change watcher poll failed: {}", e),
                        }
                    }
                }
            }
        })
    }
}

fn apply_changes(snapshot: &mut StoreMap, batch: &[StoreChange]) {
    for change in batch {
        match &change.new_value {
            Some(value) => {
                snapshot.insert(change.key.clone(), value.clone());
            }
            None => {
                snapshot.remove(&change.key);
            }
        }
    }
}

fn diff_maps(old: &StoreMap, new: &StoreMap) -> Vec<StoreChange> {
    let mut batch: Vec<StoreChange> = new
        .iter()
        .filter_map(|(key, value)| diff_entry(key, old.get(key), Some(value)))
        .collect();
    batch.extend(
        old.iter()
            .filter(|(key, _)| !new.contains_key(*key))
            .filter_map(|(key, value)| diff_entry(key, Some(value), None)),
    );
    batch
}

/// Выполнить синхронную операцию SQLite вне async-потока
async fn run_blocking<T, F>(context: &'static str, f: F) -> Result<T, StoreError>
where
    F: FnOnce() -> SqliteResult<T> + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => {
            log_io_error_if_any(context, &e);
            error!("[DB] {} failed: {}", context, e);
            Err(StoreError::Backend(e.to_string()))
        }
        Err(e) => Err(StoreError::Unavailable(format!("{} task failed: {}", context, e))),
    }
}

#[async_trait]
impl PersistentStore for Database {
    async fn get(&self, keys: &[&str]) -> Result<StoreMap, StoreError> {
        let db = self.clone();
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        run_blocking("get", move || db.get_values(&keys)).await
    }

    async fn set(&self, items: StoreMap) -> Result<(), StoreError> {
        let db = self.clone();
        let batch = run_blocking("set", move || db.set_values(items)).await?;
        self.publish(batch);
        Ok(())
    }

    async fn remove(&self, key: &str) -> Result<(), StoreError> {
        let db = self.clone();
        let key = key.to_string();
        let change = run_blocking("remove", move || db.remove_value(&key)).await?;
        self.publish(change.into_iter().collect());
        Ok(())
    }

    async fn update(&self, keys: &[&str], apply: UpdateFn) -> Result<StoreMap, StoreError> {
        let db = self.clone();
        let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
        let (written, batch) = run_blocking("update", move || db.update_values(&keys, apply)).await??;
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
    use tempfile::TempDir;

    fn open(dir: &TempDir) -> Database {
        let path = dir.path().join("tasktally.db");
        Database::new(path.to_str().unwrap()).expect("Failed to open database")
    }

    fn map(pairs: &[(&str, serde_json::Value)]) -> StoreMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_set_and_get_values() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);

        let changes = db
            .set_values(map(&[
                ("dailyStats", json!({"timeSpentSeconds": 5, "tasksCompleted": 1})),
                ("trackedUrl", json!("https://example.com/*")),
            ]))
            .unwrap();
        assert_eq!(changes.len(), 2);

        let values = db
            .get_values(&["dailyStats".to_string(), "missing".to_string()])
            .unwrap();
        assert_eq!(values.len(), 1);
        assert_eq!(values["dailyStats"]["tasksCompleted"], 1);
    }

    #[test]
    fn test_unchanged_write_produces_no_change() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.set_values(map(&[("a", json!(1))])).unwrap();
        assert!(db.set_values(map(&[("a", json!(1))])).unwrap().is_empty());
    }

    #[test]
    fn test_remove_value() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.set_values(map(&[("sessionStartTime", json!(1_700_000_000_000i64))]))
            .unwrap();
        let change = db.remove_value("sessionStartTime").unwrap().unwrap();
        assert_eq!(change.new_value, None);
        assert!(db.remove_value("sessionStartTime").unwrap().is_none());
        assert!(db.load_all().unwrap().is_empty());
    }

    #[test]
    fn test_update_values_is_one_transaction() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        db.set_values(map(&[("n", json!(1)), ("gone", json!(true))]))
            .unwrap();

        let keys = vec!["n".to_string(), "gone".to_string()];
        let (written, changes) = db
            .update_values(
                &keys,
                Box::new(|current: &StoreMap| {
                    let n = current["n"].as_i64().unwrap_or(0);
                    Ok(map(&[("n", json!(n + 1)), ("gone", serde_json::Value::Null)]))
                }),
            )
            .unwrap()
            .unwrap();
        assert_eq!(written["n"], json!(2));
        assert_eq!(changes.len(), 2);
        assert_eq!(db.load_all().unwrap(), map(&[("n", json!(2))]));

        // Ошибка шага откатывает транзакцию, соединение остаётся рабочим
        let failed = db
            .update_values(
                &keys,
                Box::new(|_: &StoreMap| Err(StoreError::Backend("rejected".to_string()))),
            )
            .unwrap();
        assert!(failed.is_err());
        db.set_values(map(&[("n", json!(3))])).unwrap();
        assert_eq!(db.load_all().unwrap()["n"], json!(3));
    }

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let db = open(&dir);
            db.set_values(map(&[("last5Days", json!([]))])).unwrap();
        }
        let db = open(&dir);
        assert_eq!(db.load_all().unwrap()["last5Days"], json!([]));
    }

    #[test]
    fn test_migrations_set_user_version() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let conn = db.conn.lock().unwrap();
        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, Database::SCHEMA_VERSION);
    }

    #[test]
    fn test_corrupt_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("broken.db");
        std::fs::write(&path, vec![b'x'; 4096]).unwrap();
        assert!(Database::new(path.to_str().unwrap()).is_err());
    }

    #[tokio::test]
    async fn test_store_trait_publishes_changes() {
        let dir = TempDir::new().unwrap();
        let db = open(&dir);
        let mut rx = db.subscribe();

        db.set(map(&[("trackedUrl", json!("https://a.example/*"))]))
            .await
            .unwrap();
        let batch = rx.recv().await.unwrap();
        assert_eq!(batch[0].key, "trackedUrl");

        let got = db.get(&["trackedUrl"]).await.unwrap();
        assert_eq!(got["trackedUrl"], json!("https://a.example/*"));
    }

    #[tokio::test]
    async fn test_change_watcher_sees_other_connection() {
        let dir = TempDir::new().unwrap();
        let background = open(&dir);
        let panel = open(&dir);

        let mut rx = panel.subscribe();
        let watcher = panel.spawn_change_watcher(Duration::from_millis(20));
        // Даём watcher'у снять исходный снимок
        tokio::time::sleep(Duration::from_millis(100)).await;

        background
            .set(map(&[("dailyStats", json!({"timeSpentSeconds": 0, "tasksCompleted": 4}))]))
            .await
            .unwrap();

        let batch = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("watcher did not report external change")
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].key, "dailyStats");
        assert_eq!(batch[0].old_value, None);
        watcher.abort();
    }
}
