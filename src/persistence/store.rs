//! SQLite-based document store
//!
//! The connection pool and each collection's table are ladder levels in one
//! shared cache, so collections share a single pool and a pool that starts
//! failing is reopened on the next access after the retry delay.

use crate::persistence::{assign_id, id_field, matches, Document, DocumentStore};
use crate::resource::{
    ConnectionLadder, Declared, LadderConfig, Level, Lifecycle, LifecycleListener, ListenerGuard,
    Listeners, Resource, ResourceCache, ResourceError, Rungs, SharedResource,
};
use anyhow::{Context, Result};
use serde_json::Value;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

const POOL_KEY: &str = "pool";

/// Ladder resource owning the SQLite pool
pub struct PoolHandle {
    pool: SqlitePool,
    listeners: Listeners,
    guard: ListenerGuard,
}

impl PoolHandle {
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Report a connection-level failure so the ladder reopens the pool
    fn check(&self, error: &sqlx::Error) {
        if matches!(
            error,
            sqlx::Error::Io(_) | sqlx::Error::PoolClosed | sqlx::Error::PoolTimedOut
        ) {
            self.listeners.emit(Lifecycle::Failed(error.to_string()));
        }
    }
}

impl Resource for PoolHandle {
    fn subscribe(&self, listener: LifecycleListener) {
        self.listeners.subscribe(listener)
    }

    fn listener_guard(&self) -> &ListenerGuard {
        &self.guard
    }
}

/// Collection names become table names, so only identifier characters are allowed
fn table_name(collection: &str) -> Result<String> {
    let valid = !collection.is_empty()
        && collection
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_');
    if !valid {
        anyhow::bail!("Invalid collection name: {:?}", collection);
    }
    Ok(format!("doc_{}", collection))
}

/// SQLite document store
pub struct SqliteDocumentStore {
    url: String,
    cache: ResourceCache<SharedResource>,
    config: LadderConfig,
    ladders: Mutex<HashMap<String, ConnectionLadder>>,
    pools_opened: Arc<AtomicUsize>,
}

impl SqliteDocumentStore {
    /// Create a new SQLite store; the pool is opened on first use
    pub fn new(db_path: &str, config: LadderConfig) -> Self {
        Self::with_cache(db_path, ResourceCache::new(), config)
    }

    /// Create a store whose levels live in an existing cache
    pub fn with_cache(db_path: &str, cache: ResourceCache<SharedResource>, config: LadderConfig) -> Self {
        let url = if db_path.starts_with("sqlite:") {
            db_path.to_string()
        } else {
            format!("sqlite:{}", db_path)
        };
        Self {
            url,
            cache,
            config,
            ladders: Mutex::new(HashMap::new()),
            pools_opened: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Create store with default path
    pub fn with_default_path(config: LadderConfig) -> Result<Self> {
        let data_dir = dirs::data_local_dir().unwrap_or_else(|| std::path::PathBuf::from("."));
        let db_dir = data_dir.join("stepline");
        std::fs::create_dir_all(&db_dir).context("Failed to create data directory")?;

        let db_path = db_dir.join("documents.db");
        Ok(Self::new(&db_path.to_string_lossy(), config))
    }

    /// Number of times the pool level was created
    pub fn pools_opened(&self) -> usize {
        self.pools_opened.load(Ordering::SeqCst)
    }

    fn pool_level(&self) -> Level {
        let url = self.url.clone();
        let opened = self.pools_opened.clone();
        Level::from_fn(POOL_KEY, move |_| {
            let url = url.clone();
            let opened = opened.clone();
            async move {
                let options = SqliteConnectOptions::from_str(&url)
                    .map_err(ResourceError::failed)?
                    .create_if_missing(true);
                // every connection to an in-memory database is a separate database
                let max_connections = if url.contains(":memory:") { 1 } else { 5 };
                let pool = SqlitePoolOptions::new()
                    .max_connections(max_connections)
                    .connect_with(options)
                    .await
                    .map_err(ResourceError::failed)?;
                opened.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(%url, "Opened document pool");
                Ok(Arc::new(PoolHandle {
                    pool,
                    listeners: Listeners::default(),
                    guard: ListenerGuard::default(),
                }) as SharedResource)
            }
        })
    }

    fn table_level(table: String) -> Level {
        Level::from_fn(format!("table={}", table), move |rungs: Rungs| {
            let table = table.clone();
            async move {
                let handle = rungs.require::<PoolHandle>(POOL_KEY)?;
                let statement = format!(
                    "CREATE TABLE IF NOT EXISTS {} (id TEXT PRIMARY KEY, body TEXT NOT NULL)",
                    table
                );
                sqlx::query(&statement)
                    .execute(handle.pool())
                    .await
                    .map_err(ResourceError::failed)?;
                Ok(Declared::new(table) as SharedResource)
            }
        })
    }

    fn ladder(&self, collection: &str) -> Result<(ConnectionLadder, String)> {
        let table = table_name(collection)?;
        let mut ladders = self
            .ladders
            .lock()
            .map_err(|_| anyhow::anyhow!("Document ladders poisoned"))?;
        if let Some(ladder) = ladders.get(collection) {
            return Ok((ladder.clone(), table));
        }

        let ladder = ConnectionLadder::new(
            format!("sqlite:{}", collection),
            self.cache.clone(),
            vec![self.pool_level().then(Self::table_level(table.clone()))],
            self.config.clone(),
        )?;
        ladders.insert(collection.to_string(), ladder.clone());
        Ok((ladder, table))
    }

    async fn pool(&self, collection: &str) -> Result<(Arc<PoolHandle>, String)> {
        let (ladder, table) = self.ladder(collection)?;
        let rungs = ladder
            .ready()
            .await
            .context("Failed to prepare document table")?;
        let handle = rungs.require::<PoolHandle>(POOL_KEY)?;
        Ok((handle, table))
    }

    async fn load_all(&self, handle: &PoolHandle, table: &str) -> Result<Vec<(String, Document)>> {
        let rows = sqlx::query(&format!("SELECT id, body FROM {} ORDER BY rowid", table))
            .fetch_all(handle.pool())
            .await
            .map_err(|e| {
                handle.check(&e);
                e
            })
            .context("Failed to load documents")?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                let body: String = row.get("body");
                let document: Document =
                    serde_json::from_str(&body).context("Failed to decode document")?;
                Ok((id, document))
            })
            .collect()
    }
}

#[async_trait::async_trait]
impl DocumentStore for SqliteDocumentStore {
    async fn insert(&self, collection: &str, mut document: Document) -> Result<Document> {
        let (handle, table) = self.pool(collection).await?;
        let id = assign_id(collection, &mut document);

        let existing = sqlx::query(&format!("SELECT body FROM {} WHERE id = ?1", table))
            .bind(&id)
            .fetch_optional(handle.pool())
            .await
            .map_err(|e| {
                handle.check(&e);
                e
            })
            .context("Failed to load document")?;

        let stored = match existing {
            Some(row) => {
                let body: String = row.get("body");
                let mut stored: Document =
                    serde_json::from_str(&body).context("Failed to decode document")?;
                stored.extend(document);
                stored
            }
            None => document,
        };

        sqlx::query(&format!(
            "INSERT OR REPLACE INTO {} (id, body) VALUES (?1, ?2)",
            table
        ))
        .bind(&id)
        .bind(serde_json::to_string(&stored)?)
        .execute(handle.pool())
        .await
        .map_err(|e| {
            handle.check(&e);
            e
        })
        .context("Failed to save document")?;

        Ok(stored)
    }

    async fn find(&self, collection: &str, criteria: &Document) -> Result<Vec<Document>> {
        let (handle, table) = self.pool(collection).await?;
        let field = id_field(collection);

        // lookups by id go straight to the primary key
        if let Some(Value::String(id)) = criteria.get(&field) {
            let row = sqlx::query(&format!("SELECT body FROM {} WHERE id = ?1", table))
                .bind(id)
                .fetch_optional(handle.pool())
                .await
                .map_err(|e| {
                    handle.check(&e);
                    e
                })
                .context("Failed to load document")?;
            let Some(row) = row else {
                return Ok(Vec::new());
            };
            let body: String = row.get("body");
            let document: Document = serde_json::from_str(&body).context("Failed to decode document")?;
            return Ok(if matches(&document, criteria) {
                vec![document]
            } else {
                Vec::new()
            });
        }

        Ok(self
            .load_all(&handle, &table)
            .await?
            .into_iter()
            .map(|(_, document)| document)
            .filter(|document| matches(document, criteria))
            .collect())
    }

    async fn count(&self, collection: &str, criteria: &Document) -> Result<usize> {
        Ok(self.find(collection, criteria).await?.len())
    }

    async fn remove(&self, collection: &str, criteria: &Document) -> Result<usize> {
        let (handle, table) = self.pool(collection).await?;
        let ids: Vec<String> = self
            .load_all(&handle, &table)
            .await?
            .into_iter()
            .filter(|(_, document)| matches(document, criteria))
            .map(|(id, _)| id)
            .collect();

        for id in &ids {
            sqlx::query(&format!("DELETE FROM {} WHERE id = ?1", table))
                .bind(id)
                .execute(handle.pool())
                .await
                .map_err(|e| {
                    handle.check(&e);
                    e
                })
                .context("Failed to delete document")?;
        }
        Ok(ids.len())
    }
}
