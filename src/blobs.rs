//! Content-addressed blob storage.
//!
//! Closures, arguments and results are never inlined into journal events;
//! they live here and are referenced by [`BlobRef`]. The store is
//! many-reader, many-writer and needs no coordination beyond its own
//! implementation.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use sqlx::{PgPool, Row};
use thiserror::Error;
use uuid::Uuid;

use crate::model::BlobRef;

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("blob {0} not found")]
    NotFound(Uuid),
    #[error("blob store backend error: {0}")]
    Backend(#[from] anyhow::Error),
}

/// Byte storage for closures, arguments and results.
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `bytes` and return a reference to them.
    async fn create(&self, content_type: &str, bytes: Vec<u8>) -> Result<BlobRef, BlobError>;

    /// Fetch the bytes behind a reference.
    async fn read(&self, blob: &BlobRef) -> Result<Vec<u8>, BlobError>;
}

/// Process-local store, the default for tests and single-node use.
#[derive(Default)]
pub struct InMemoryBlobStore {
    blobs: RwLock<HashMap<Uuid, (String, Vec<u8>)>>,
}

impl InMemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BlobStore for InMemoryBlobStore {
    async fn create(&self, content_type: &str, bytes: Vec<u8>) -> Result<BlobRef, BlobError> {
        let id = Uuid::new_v4();
        let length = bytes.len() as u64;
        self.blobs
            .write()
            .expect("blob store lock poisoned")
            .insert(id, (content_type.to_string(), bytes));
        Ok(BlobRef {
            id,
            content_type: content_type.to_string(),
            length,
        })
    }

    async fn read(&self, blob: &BlobRef) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .read()
            .expect("blob store lock poisoned")
            .get(&blob.id)
            .map(|(_, bytes)| bytes.clone())
            .ok_or(BlobError::NotFound(blob.id))
    }
}

/// Postgres-backed store.
pub struct SqlBlobStore {
    pool: PgPool,
}

impl SqlBlobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Initialize the blob table.
    pub async fn init_schema(&self) -> Result<(), BlobError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS flow_blobs (
                blob_id UUID PRIMARY KEY,
                content_type TEXT NOT NULL,
                blob_data BYTEA NOT NULL,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| BlobError::Backend(e.into()))?;
        Ok(())
    }
}

#[async_trait]
impl BlobStore for SqlBlobStore {
    async fn create(&self, content_type: &str, bytes: Vec<u8>) -> Result<BlobRef, BlobError> {
        let id = Uuid::new_v4();
        let length = bytes.len() as u64;
        sqlx::query("INSERT INTO flow_blobs (blob_id, content_type, blob_data) VALUES ($1, $2, $3)")
            .bind(id)
            .bind(content_type)
            .bind(&bytes)
            .execute(&self.pool)
            .await
            .map_err(|e| BlobError::Backend(e.into()))?;
        Ok(BlobRef {
            id,
            content_type: content_type.to_string(),
            length,
        })
    }

    async fn read(&self, blob: &BlobRef) -> Result<Vec<u8>, BlobError> {
        let row = sqlx::query("SELECT blob_data FROM flow_blobs WHERE blob_id = $1")
            .bind(blob.id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| BlobError::Backend(e.into()))?;
        match row {
            Some(row) => Ok(row.get("blob_data")),
            None => Err(BlobError::NotFound(blob.id)),
        }
    }
}
