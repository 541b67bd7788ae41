//! Content-addressed blob storage seam.
//!
//! The kernel stores artifact *manifests*; the bytes live in an external
//! blob provider addressed by an opaque [`StoragePointer`]. The pointer is
//! never interpreted by the kernel — retrieval (signed URLs, streaming) is
//! the provider's business.

use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::events::Scope;

/// Errors from a blob provider.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum BlobError {
    /// The pointer does not resolve to stored content.
    #[error("blob not found: {key}")]
    NotFound {
        /// The pointer key that failed to resolve.
        key: String,
    },

    /// Provider-specific failure.
    #[error("blob provider error: {0}")]
    Provider(String),
}

/// An opaque pointer into a blob provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoragePointer {
    /// Provider discriminator (`"memory"`, `"s3"`, `"r2"`, ...).
    pub provider: String,
    /// Provider-specific object key.
    pub key: String,
    /// Bucket, for providers that have one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
}

/// A content-addressed blob provider.
pub trait BlobStore: Send + Sync {
    /// Stores `bytes` under the given content hash, returning the pointer.
    ///
    /// Storing the same content twice is permitted and must return an
    /// equivalent pointer (content addressing makes the write idempotent).
    ///
    /// # Errors
    ///
    /// Returns a provider error when the write fails.
    fn put(
        &self,
        scope: &Scope,
        content_sha256: &str,
        bytes: &[u8],
    ) -> Result<StoragePointer, BlobError>;

    /// Fetches the bytes behind a pointer.
    ///
    /// # Errors
    ///
    /// [`BlobError::NotFound`] when the pointer does not resolve.
    fn get(&self, pointer: &StoragePointer) -> Result<Vec<u8>, BlobError>;
}

/// An in-memory blob store for tests and embedded use.
#[derive(Debug, Default)]
pub struct InMemoryBlobStore {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl InMemoryBlobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn key(scope: &Scope, content_sha256: &str) -> String {
        format!(
            "{}/{}/{}",
            scope.tenant_id, scope.project_id, content_sha256
        )
    }
}

impl BlobStore for InMemoryBlobStore {
    fn put(
        &self,
        scope: &Scope,
        content_sha256: &str,
        bytes: &[u8],
    ) -> Result<StoragePointer, BlobError> {
        let key = Self::key(scope, content_sha256);
        self.blobs
            .lock()
            .expect("blob store mutex poisoned")
            .insert(key.clone(), bytes.to_vec());
        Ok(StoragePointer {
            provider: "memory".to_string(),
            key,
            bucket: None,
        })
    }

    fn get(&self, pointer: &StoragePointer) -> Result<Vec<u8>, BlobError> {
        self.blobs
            .lock()
            .expect("blob store mutex poisoned")
            .get(&pointer.key)
            .cloned()
            .ok_or_else(|| BlobError::NotFound {
                key: pointer.key.clone(),
            })
    }
}
