//! Resource datastore abstraction.
//!
//! The datastore is the system of record for hosts and addresses. Every write
//! is conditional on the version token the caller last saw, which is the only
//! thing standing between two coordinators racing for the same idle host.

pub mod eve;
pub mod memory;

use async_trait::async_trait;
use thiserror::Error;
use tracing::debug;

use crate::resources::{Record, Resource};
use crate::tags::{self, Tags};

/// Attempts [`ResourceStore::modify`] makes before giving up on a conflict.
pub const MODIFY_ATTEMPTS: u32 = 5;

/// Errors that can occur during datastore operations.
#[derive(Error, Debug)]
pub enum StoreError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// API returned an error response.
    #[error("API error: {status} - {message}")]
    Api { status: u16, message: String },

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// The version token no longer matches; someone else wrote first.
    #[error("Resource {0} was modified concurrently")]
    Conflict(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),
}

impl StoreError {
    /// Whether the error is a lost optimistic-concurrency race.
    #[must_use]
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

/// Typed query/update access to one collection of resources.
#[async_trait]
pub trait ResourceStore<R: Resource>: Send + Sync {
    /// Find resources whose `field` equals `value`.
    async fn find(&self, field: &str, value: &str) -> Result<Vec<Record<R>>, StoreError>;

    /// Find resources whose `field` equals `value` and whose tags satisfy
    /// `tags`.
    async fn find_tagged(
        &self,
        field: &str,
        value: &str,
        tags: &Tags,
    ) -> Result<Vec<Record<R>>, StoreError> {
        let records = self.find(field, value).await?;
        Ok(records
            .into_iter()
            .filter(|record| tags::matches(record.resource.tags(), tags))
            .collect())
    }

    /// Find resources nobody owns, including documents with no `owner`
    /// field at all.
    async fn find_unowned(&self) -> Result<Vec<Record<R>>, StoreError> {
        self.find("owner", "").await
    }

    /// Fetch a resource by its identity key.
    async fn get(&self, key: &str) -> Result<Record<R>, StoreError>;

    /// List every resource in the collection.
    async fn list(&self) -> Result<Vec<Record<R>>, StoreError>;

    /// Add a resource.
    async fn create(&self, resource: &R) -> Result<(), StoreError>;

    /// Write `record` back if its version token is still current.
    ///
    /// Returns the record with its new token, or [`StoreError::Conflict`].
    async fn update(&self, record: &Record<R>) -> Result<Record<R>, StoreError>;

    /// Remove a resource.
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Fetch the current version, apply `change`, and write it back,
    /// retrying when another writer gets in between.
    ///
    /// `change` returns `false` when the current document needs no write; the
    /// fetched record is returned untouched in that case.
    async fn modify(
        &self,
        key: &str,
        change: &(dyn for<'r> Fn(&'r mut R) -> bool + Send + Sync),
    ) -> Result<Record<R>, StoreError> {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut record = self.get(key).await?;
            if !change(&mut record.resource) {
                return Ok(record);
            }
            match self.update(&record).await {
                Err(e) if e.is_conflict() && attempt < MODIFY_ATTEMPTS => {
                    debug!(key = %key, attempt, "Conflicting write, refetching");
                }
                other => return other,
            }
        }
    }
}
