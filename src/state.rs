//! Application state management

use std::sync::Arc;

use sqlx::SqlitePool;

use crate::config::Config;
use crate::db::SqliteSessionStore;
use crate::twin::TwinStore;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    config: Config,
    store: TwinStore,
    sessions: SqliteSessionStore,
    db: SqlitePool,
}

impl AppState {
    pub fn new(config: Config, store: TwinStore, db: SqlitePool) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                config,
                store,
                sessions: SqliteSessionStore::new(db.clone()),
                db,
            }),
        }
    }

    /// Get the configuration
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Get the twin store
    pub fn store(&self) -> &TwinStore {
        &self.inner.store
    }

    /// Persisted device session watermarks
    pub fn sessions(&self) -> &SqliteSessionStore {
        &self.inner.sessions
    }

    /// Get the database pool
    pub fn db(&self) -> &SqlitePool {
        &self.inner.db
    }
}
