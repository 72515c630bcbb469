//! REST client for the Eve-based resource manager API.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tracing::{debug, info, warn};
use url::Url;

use super::{ResourceStore, StoreError};
use crate::config::StoreConfig;
use crate::resources::{AddressResource, HostResource, Record, Resource};

/// Collection holding hosts.
pub const MACHINES: &str = "machines";

/// Collection holding public addresses.
pub const PUBLIC_ADDRESSES: &str = "public-addresses";

/// Collection holding private addresses.
pub const PRIVATE_ADDRESSES: &str = "private-addresses";

/// Upper bound on pages followed by a single listing.
const MAX_PAGES: u32 = 1000;

/// One page of a collection listing.
#[derive(Debug, Deserialize)]
#[serde(bound = "R: DeserializeOwned")]
struct ListResponse<R> {
    #[serde(rename = "_items", default)]
    items: Vec<Record<R>>,
    #[serde(rename = "_links", default)]
    links: Option<Links>,
}

#[derive(Debug, Deserialize)]
struct Links {
    next: Option<serde_json::Value>,
}

/// Response to a PATCH.
#[derive(Debug, Deserialize)]
struct WriteResponse {
    #[serde(rename = "_etag")]
    etag: String,
}

/// Client for one collection of the resource manager.
pub struct EveStore<R> {
    /// HTTP client.
    client: Client,
    /// `{endpoint}/{collection}`.
    collection_url: Url,
    /// Username for basic auth.
    username: String,
    /// Password for basic auth.
    password: String,
    _resource: PhantomData<fn() -> R>,
}

impl<R> Clone for EveStore<R> {
    fn clone(&self) -> Self {
        Self {
            client: self.client.clone(),
            collection_url: self.collection_url.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            _resource: PhantomData,
        }
    }
}

impl EveStore<HostResource> {
    /// Client for the `machines` collection.
    ///
    /// # Errors
    /// Returns error if the endpoint is invalid or the HTTP client cannot be
    /// created.
    pub fn machines(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::new(config, MACHINES)
    }
}

impl EveStore<AddressResource> {
    /// Client for the `public-addresses` collection.
    ///
    /// # Errors
    /// Returns error if the endpoint is invalid or the HTTP client cannot be
    /// created.
    pub fn public_addresses(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::new(config, PUBLIC_ADDRESSES)
    }

    /// Client for the `private-addresses` collection.
    ///
    /// # Errors
    /// Returns error if the endpoint is invalid or the HTTP client cannot be
    /// created.
    pub fn private_addresses(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::new(config, PRIVATE_ADDRESSES)
    }
}

impl<R: Resource> EveStore<R> {
    /// Create a client for an arbitrary collection.
    ///
    /// # Errors
    /// Returns error if the endpoint is invalid or the HTTP client cannot be
    /// created.
    pub fn new(config: &StoreConfig, collection: &str) -> Result<Self, StoreError> {
        let mut collection_url = Url::parse(&config.endpoint)
            .map_err(|e| StoreError::Config(format!("Invalid store endpoint: {e}")))?;
        collection_url
            .path_segments_mut()
            .map_err(|()| StoreError::Config("Store endpoint cannot be a base URL".into()))?
            .pop_if_empty()
            .push(collection);

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            collection_url,
            username: config.username.clone(),
            password: config.password.clone(),
            _resource: PhantomData,
        })
    }

    /// URL of the collection.
    #[must_use]
    pub fn collection_url(&self) -> &Url {
        &self.collection_url
    }

    fn item_url(&self, segment: &str) -> Url {
        let mut url = self.collection_url.clone();
        // The collection URL was built from path segments, so it has a base.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.push(segment);
        }
        url
    }

    fn authed(&self, builder: RequestBuilder) -> RequestBuilder {
        builder.basic_auth(&self.username, Some(&self.password))
    }

    /// Fetch one listing page, optionally filtered by a `where` clause.
    async fn list_page(
        &self,
        filter: Option<&str>,
        page: u32,
    ) -> Result<ListResponse<R>, StoreError> {
        let mut request = self
            .authed(self.client.get(self.collection_url.clone()))
            .query(&[("page", page.to_string())]);
        if let Some(filter) = filter {
            request = request.query(&[("where", filter)]);
        }
        debug!(url = %self.collection_url, page, filter = ?filter, "GET request");

        let response = request.send().await?;
        Self::handle_response(response).await
    }

    /// Follow `_links.next` until the listing is exhausted.
    async fn list_all(&self, filter: Option<&str>) -> Result<Vec<Record<R>>, StoreError> {
        let mut records = Vec::new();
        for page in 1..=MAX_PAGES {
            let response = self.list_page(filter, page).await?;
            records.extend(response.items);
            if response.links.and_then(|l| l.next).is_none() {
                return Ok(records);
            }
        }
        warn!(url = %self.collection_url, "Listing truncated after {MAX_PAGES} pages");
        Ok(records)
    }

    /// Handle API response, parsing JSON or error.
    async fn handle_response<T: DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, StoreError> {
        let status = response.status();
        let text = response.text().await?;

        if status.is_success() {
            serde_json::from_str(&text).map_err(|e| {
                warn!(error = %e, body = %text, "Failed to parse response");
                StoreError::Serialization(e)
            })
        } else {
            Err(Self::status_error(status, text))
        }
    }

    fn status_error(status: StatusCode, text: String) -> StoreError {
        match status {
            StatusCode::NOT_FOUND => StoreError::NotFound(text),
            StatusCode::PRECONDITION_FAILED => StoreError::Conflict(text),
            _ => StoreError::Api {
                status: status.as_u16(),
                message: text,
            },
        }
    }
}

#[async_trait]
impl<R: Resource> ResourceStore<R> for EveStore<R> {
    async fn find(&self, field: &str, value: &str) -> Result<Vec<Record<R>>, StoreError> {
        let mut filter = serde_json::Map::new();
        filter.insert(field.to_string(), serde_json::Value::from(value));
        let filter = serde_json::Value::Object(filter).to_string();
        self.list_all(Some(&filter)).await
    }

    async fn find_unowned(&self) -> Result<Vec<Record<R>>, StoreError> {
        // Equality on "" does not match documents seeded without the field.
        let filter = serde_json::json!({
            "$or": [{"owner": ""}, {"owner": {"$exists": false}}]
        })
        .to_string();
        self.list_all(Some(&filter)).await
    }

    async fn get(&self, key: &str) -> Result<Record<R>, StoreError> {
        let url = self.item_url(key);
        debug!(url = %url, "GET request");

        let response = self.authed(self.client.get(url)).send().await?;
        match Self::handle_response(response).await {
            Err(StoreError::NotFound(_)) => Err(StoreError::NotFound(key.to_string())),
            other => other,
        }
    }

    async fn list(&self) -> Result<Vec<Record<R>>, StoreError> {
        self.list_all(None).await
    }

    async fn create(&self, resource: &R) -> Result<(), StoreError> {
        info!(key = %resource.key(), url = %self.collection_url, "Creating resource");

        let response = self
            .authed(self.client.post(self.collection_url.clone()))
            .json(resource)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::CREATED {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(Self::status_error(status, text))
        }
    }

    async fn update(&self, record: &Record<R>) -> Result<Record<R>, StoreError> {
        let url = self.item_url(&record.id);
        debug!(url = %url, key = %record.resource.key(), etag = %record.etag, "PATCH request");

        let response = self
            .authed(self.client.patch(url))
            .header("If-Match", &record.etag)
            .json(&record.resource.patch())
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::PRECONDITION_FAILED {
            return Err(StoreError::Conflict(record.resource.key().to_string()));
        }
        let written: WriteResponse = Self::handle_response(response).await?;

        Ok(Record {
            id: record.id.clone(),
            etag: written.etag,
            resource: record.resource.clone(),
        })
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let current = self.get(key).await?;
        let url = self.item_url(&current.id);
        info!(key = %key, url = %url, "Deleting resource");

        let response = self
            .authed(self.client.delete(url))
            .header("If-Match", &current.etag)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let text = response.text().await.unwrap_or_default();
            Err(Self::status_error(status, text))
        }
    }
}
