use crate::engine::SessionTimer;
use crate::ipc::keys;
use crate::store::{decode, StoreError, StoreMap};
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::warn;

/// GUARD: нечисловое значение считаем отсутствующим, а не ошибкой
fn stored_start(data: &StoreMap) -> Option<i64> {
    match decode::<i64>(data, keys::SESSION_START) {
        Ok(start) => start,
        Err(e) => {
            warn!("[SESSION] Ignoring unreadable session start: {}", e);
            None
        }
    }
}

impl SessionTimer {
    /// Загрузить сохранённое начало сессии (epoch ms)
    pub(crate) async fn load_start(&self) -> Result<Option<i64>, StoreError> {
        let data = self.store.get(&[keys::SESSION_START]).await?;
        Ok(stored_start(&data))
    }

    /// Set-if-absent: записать `now_ms`, только если старта ещё нет.
    /// Возвращает старт, который теперь в хранилище, и был ли он уже там.
    /// Две панели, стартующие одновременно, получают одно и то же значение.
    pub(crate) async fn claim_start(&self, now_ms: i64) -> Result<(i64, bool), StoreError> {
        let (tx, rx) = oneshot::channel();
        self.store
            .update(
                &[keys::SESSION_START],
                Box::new(move |data: &StoreMap| {
                    let mut items = StoreMap::new();
                    let claimed = match stored_start(data) {
                        Some(existing) => (existing, true),
                        None => {
                            items.insert(keys::SESSION_START.to_string(), Value::from(now_ms));
                            (now_ms, false)
                        }
                    };
                    let _ = tx.send(claimed);
                    Ok(items)
                }),
            )
            .await?;
        rx.await
            .map_err(|_| StoreError::Unavailable("session start update was not applied".to_string()))
    }

    /// Take-and-clear: удалить старт и вернуть его.
    /// Только один из конкурирующих вызовов получает Some, поэтому сессия
    /// коммитится ровно один раз.
    pub(crate) async fn take_start(&self) -> Result<Option<i64>, StoreError> {
        let (tx, rx) = oneshot::channel();
        self.store
            .update(
                &[keys::SESSION_START],
                Box::new(move |data: &StoreMap| {
                    let mut items = StoreMap::new();
                    if data.contains_key(keys::SESSION_START) {
                        // Нечитаемое значение тоже удаляем
                        items.insert(keys::SESSION_START.to_string(), Value::Null);
                    }
                    let _ = tx.send(stored_start(data));
                    Ok(items)
                }),
            )
            .await?;
        rx.await
            .map_err(|_| StoreError::Unavailable("session start update was not applied".to_string()))
    }
}
