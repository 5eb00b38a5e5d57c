use crate::ipc::keys;
use crate::models::resolve_tracked_url;
use crate::store::{decode, encode, PersistentStore, StoreMap};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info, warn};

/// Identity of the single page-content observer
pub const OBSERVER_ID: &str = "task-observer";
pub const RUN_AT_DOCUMENT_IDLE: &str = "document_idle";

/// Регистрация наблюдателя за страницей
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObserverRegistration {
    pub id: String,
    pub matches: Vec<String>,
    pub run_at: String,
}

impl ObserverRegistration {
    pub fn for_target(target: &str) -> Self {
        Self {
            id: OBSERVER_ID.to_string(),
            matches: vec![target.to_string()],
            run_at: RUN_AT_DOCUMENT_IDLE.to_string(),
        }
    }
}

/// Host facility that injects the page-content detector.
#[async_trait]
pub trait ObserverHost: Send + Sync {
    async fn registered(&self) -> Result<Vec<ObserverRegistration>, String>;
    async fn unregister(&self, ids: &[String]) -> Result<(), String>;
    /// Fails if a registration with the same id already exists
    async fn register(&self, registration: ObserverRegistration) -> Result<(), String>;
}

/// Default host: keeps registrations in the store under `observerRegistrations`
/// so an external detector bridge can pick them up.
pub struct StoreObserverHost {
    store: Arc<dyn PersistentStore>,
}

impl StoreObserverHost {
    pub fn new(store: Arc<dyn PersistentStore>) -> Self {
        Self { store }
    }

    async fn write(&self, registrations: &[ObserverRegistration]) -> Result<(), String> {
        let mut items = StoreMap::new();
        let value = encode(keys::OBSERVERS, &registrations).map_err(|e| e.to_string())?;
        items.insert(keys::OBSERVERS.to_string(), value);
        self.store.set(items).await.map_err(|e| e.to_string())
    }
}

#[async_trait]
impl ObserverHost for StoreObserverHost {
    async fn registered(&self) -> Result<Vec<ObserverRegistration>, String> {
        let data = self
            .store
            .get(&[keys::OBSERVERS])
            .await
            .map_err(|e| e.to_string())?;
        Ok(decode(&data, keys::OBSERVERS)
            .map_err(|e| e.to_string())?
            .unwrap_or_default())
    }

    async fn unregister(&self, ids: &[String]) -> Result<(), String> {
        let mut current = self.registered().await?;
        current.retain(|r| !ids.contains(&r.id));
        self.write(&current).await
    }

    async fn register(&self, registration: ObserverRegistration) -> Result<(), String> {
        let mut current = self.registered().await?;
        if current.iter().any(|r| r.id == registration.id) {
            return Err(format!("Duplicate script ID '{}'", registration.id));
        }
        current.push(registration);
        self.write(&current).await
    }
}

/// Keeps exactly one observer registration matching the tracked URL.
pub struct ObserverRegistrar {
    host: Arc<dyn ObserverHost>,
    store: Arc<dyn PersistentStore>,
    default_url: String,
    /// Сериализует refresh(): иначе два параллельных вызова могут оба
    /// удалить старое и оба зарегистрировать новое
    refresh_lock: tokio::sync::Mutex<()>,
}

impl ObserverRegistrar {
    pub fn new(
        host: Arc<dyn ObserverHost>,
        store: Arc<dyn PersistentStore>,
        default_url: impl Into<String>,
    ) -> Self {
        Self {
            host,
            store,
            default_url: default_url.into(),
            refresh_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Снять все прежние регистрации и поставить одну для текущего URL.
    /// Ошибки хоста только логируются; возвращает установленную регистрацию.
    pub async fn refresh(&self) -> Option<ObserverRegistration> {
        let _guard = self.refresh_lock.lock().await;

        match self.host.registered().await {
            Ok(old) if !old.is_empty() => {
                let ids: Vec<String> = old.into_iter().map(|r| r.id).collect();
                if let Err(e) = self.host.unregister(&ids).await {
                    error!("[OBSERVER] Error unregistering observers {:?}: {}", ids, e);
                }
            }
            Ok(_) => {}
            Err(e) => error!("[OBSERVER] Error listing registered observers: {}", e),
        }

        let target = self.tracked_url().await;
        let registration = ObserverRegistration::for_target(&target);
        match self.host.register(registration.clone()).await {
            Ok(()) => {
                info!("[OBSERVER] Observer registered for: {}", target);
                Some(registration)
            }
            Err(e) => {
                error!("[OBSERVER] Error registering observer for {}: {}", target, e);
                None
            }
        }
    }

    async fn tracked_url(&self) -> String {
        let stored = match self.store.get(&[keys::TRACKED_URL]).await {
            Ok(data) => decode::<String>(&data, keys::TRACKED_URL).unwrap_or_else(|e| {
                warn!("[OBSERVER] Ignoring unreadable tracked URL: {}", e);
                None
            }),
            Err(e) => {
                warn!("[OBSERVER] Failed to read tracked URL, using default: {}", e);
                None
            }
        };
        resolve_tracked_url(stored.as_deref(), &self.default_url)
    }
}
