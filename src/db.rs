use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use sqlx::postgres::PgPoolOptions;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder, Row};
use tracing::info;

use crate::error::Result;

pub mod collections {
    pub const CLEANED_DATA: &str = "cleaned_data";
    pub const ENGINEERED_DATASET: &str = "engineered_dataset";
    pub const ENGINEERED_FEATURES_METADATA: &str = "engineered_features_metadata";
    pub const MODEL_EVALUATION: &str = "model_evaluation";
    pub const PIPELINE_STATUS: &str = "pipeline_status";
    pub const PREDICTIONS: &str = "predictions";
}

/// Bind parameters per insert stay well under the Postgres limit of 65535.
const MAX_ROWS_PER_INSERT: usize = 10_000;

/// A store of JSON documents grouped into named collections.
///
/// Keyed documents (`put`/`get`) hold singletons such as the pipeline status;
/// unkeyed documents are appended by `insert_many` and read back in insertion
/// order. Nothing here is transactional across calls.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn delete_all(&self, collection: &str) -> Result<u64>;

    async fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<usize>;

    /// Oldest first.
    async fn find(&self, collection: &str, limit: Option<usize>) -> Result<Vec<Value>>;

    /// Newest first.
    async fn find_recent(&self, collection: &str, limit: usize) -> Result<Vec<Value>>;

    async fn put(&self, collection: &str, key: &str, doc: Value) -> Result<()>;

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>>;
}

/// Full overwrite: delete everything, then insert in batches of `batch_size`.
///
/// A concurrent reader can observe the collection empty between the two steps.
pub async fn replace_all(
    store: &dyn DocumentStore,
    collection: &str,
    docs: Vec<Value>,
    batch_size: usize,
) -> Result<usize> {
    store.delete_all(collection).await?;
    let mut inserted = 0usize;
    let mut docs = docs.into_iter().peekable();
    while docs.peek().is_some() {
        let batch: Vec<Value> = docs.by_ref().take(batch_size.max(1)).collect();
        inserted += store.insert_many(collection, batch).await?;
    }
    Ok(inserted)
}

pub struct PgDocumentStore {
    pool: PgPool,
}

impl PgDocumentStore {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        info!("connected to Postgres");
        Ok(Self { pool })
    }

    pub async fn init_db(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl DocumentStore for PgDocumentStore {
    async fn delete_all(&self, collection: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM appointment_predictor.documents WHERE collection = $1")
            .bind(collection)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<usize> {
        let mut inserted = 0usize;
        for chunk in docs.chunks(MAX_ROWS_PER_INSERT) {
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(
                "INSERT INTO appointment_predictor.documents (collection, body) ",
            );
            builder.push_values(chunk, |mut row, doc| {
                row.push_bind(collection.to_string())
                    .push_bind(Json(doc.clone()));
            });
            let result = builder.build().execute(&self.pool).await?;
            inserted += result.rows_affected() as usize;
        }
        Ok(inserted)
    }

    async fn find(&self, collection: &str, limit: Option<usize>) -> Result<Vec<Value>> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM appointment_predictor.documents
            WHERE collection = $1
            ORDER BY id
            LIMIT $2
            "#,
        )
        .bind(collection)
        .bind(limit.map(|l| l as i64))
        .fetch_all(&self.pool)
        .await?;

        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            docs.push(row.try_get::<Value, _>("body")?);
        }
        Ok(docs)
    }

    async fn find_recent(&self, collection: &str, limit: usize) -> Result<Vec<Value>> {
        let rows = sqlx::query(
            r#"
            SELECT body FROM appointment_predictor.documents
            WHERE collection = $1
            ORDER BY id DESC
            LIMIT $2
            "#,
        )
        .bind(collection)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            docs.push(row.try_get::<Value, _>("body")?);
        }
        Ok(docs)
    }

    async fn put(&self, collection: &str, key: &str, doc: Value) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO appointment_predictor.documents (collection, doc_key, body)
            VALUES ($1, $2, $3)
            ON CONFLICT (collection, doc_key) WHERE doc_key IS NOT NULL DO UPDATE
            SET body = EXCLUDED.body, created_at = now()
            "#,
        )
        .bind(collection)
        .bind(key)
        .bind(Json(doc))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let row = sqlx::query(
            "SELECT body FROM appointment_predictor.documents WHERE collection = $1 AND doc_key = $2",
        )
        .bind(collection)
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => Ok(Some(row.try_get::<Value, _>("body")?)),
            None => Ok(None),
        }
    }
}

/// Process-local store, used when no database is configured and in tests.
#[derive(Default)]
pub struct MemoryStore {
    collections: Mutex<HashMap<String, Vec<(Option<String>, Value)>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count(&self, collection: &str) -> usize {
        self.collections
            .lock()
            .get(collection)
            .map_or(0, |docs| docs.len())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn delete_all(&self, collection: &str) -> Result<u64> {
        let removed = self.collections.lock().remove(collection);
        Ok(removed.map_or(0, |docs| docs.len() as u64))
    }

    async fn insert_many(&self, collection: &str, docs: Vec<Value>) -> Result<usize> {
        let count = docs.len();
        let mut collections = self.collections.lock();
        let entry = collections.entry(collection.to_string()).or_default();
        entry.extend(docs.into_iter().map(|doc| (None, doc)));
        Ok(count)
    }

    async fn find(&self, collection: &str, limit: Option<usize>) -> Result<Vec<Value>> {
        let collections = self.collections.lock();
        let docs = collections.get(collection).map_or_else(Vec::new, |docs| {
            docs.iter()
                .take(limit.unwrap_or(usize::MAX))
                .map(|(_, doc)| doc.clone())
                .collect()
        });
        Ok(docs)
    }

    async fn find_recent(&self, collection: &str, limit: usize) -> Result<Vec<Value>> {
        let collections = self.collections.lock();
        let docs = collections.get(collection).map_or_else(Vec::new, |docs| {
            docs.iter().rev().take(limit).map(|(_, doc)| doc.clone()).collect()
        });
        Ok(docs)
    }

    async fn put(&self, collection: &str, key: &str, doc: Value) -> Result<()> {
        let mut collections = self.collections.lock();
        let entry = collections.entry(collection.to_string()).or_default();
        match entry.iter_mut().find(|(k, _)| k.as_deref() == Some(key)) {
            Some((_, existing)) => *existing = doc,
            None => entry.push((Some(key.to_string()), doc)),
        }
        Ok(())
    }

    async fn get(&self, collection: &str, key: &str) -> Result<Option<Value>> {
        let collections = self.collections.lock();
        Ok(collections.get(collection).and_then(|docs| {
            docs.iter()
                .find(|(k, _)| k.as_deref() == Some(key))
                .map(|(_, doc)| doc.clone())
        }))
    }
}
