//! Remote document store abstraction.
//!
//! Alerts are appended to named collections of a remote document store. The
//! alert id doubles as the document id, so writing the same alert twice is a
//! no-op on the remote side.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde_json::Value;
use thiserror::Error;

/// Errors returned by a [`RemoteStore`].
#[derive(Debug, Error)]
pub enum RemoteError {
    /// No remote store is reachable or configured.
    #[error("remote store unavailable: {0}")]
    Unavailable(String),

    /// The request could not be sent or the connection failed.
    #[error("network error: {0}")]
    Network(String),

    /// The store did not answer in time.
    #[error("write to '{collection}' timed out")]
    Timeout {
        /// Collection that was being written.
        collection: String,
    },

    /// The store refused access to the collection.
    #[error("permission denied for collection '{collection}'")]
    PermissionDenied {
        /// Collection that was refused.
        collection: String,
    },

    /// The store answered with an unexpected status.
    #[error("collection '{collection}' rejected the request with status {status}")]
    Rejected {
        /// Collection the request targeted.
        collection: String,
        /// HTTP status code.
        status: u16,
    },

    /// The store answered with a body that could not be read.
    #[error("unreadable response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Check if the store refused access, as opposed to failing transiently.
    #[must_use]
    pub fn is_permission_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }
}

/// A store of JSON documents grouped in named collections.
#[async_trait]
pub trait RemoteStore: Send + Sync + Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Append `document` to `collection` under `document_id`.
    ///
    /// Writing a document id that already exists succeeds without changing
    /// the stored document. Returns the id the store recorded.
    async fn append(
        &self,
        collection: &str,
        document_id: &str,
        document: &Value,
    ) -> Result<String, RemoteError>;

    /// List up to `limit` documents from `collection`.
    async fn list(&self, _collection: &str, _limit: usize) -> Result<Vec<Value>, RemoteError> {
        Ok(Vec::new())
    }
}

/// A [`RemoteStore`] speaking a small JSON-over-HTTP document API.
///
/// * `POST {endpoint}/{collection}?documentId={id}` stores a document.
///   `409 Conflict` means the id already exists and counts as success.
/// * `GET {endpoint}/{collection}?limit={n}` returns a JSON array, or an
///   object with a `documents` array.
#[derive(Debug, Clone)]
pub struct HttpDocumentStore {
    client: Client,
    endpoint: String,
}

impl HttpDocumentStore {
    /// Create a store for the given base endpoint.
    ///
    /// `request_timeout` bounds each HTTP request at the client level.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(endpoint: &str, request_timeout: Duration) -> Result<Self, RemoteError> {
        let client = Client::builder()
            .timeout(request_timeout)
            .user_agent(concat!("rescuelink/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| RemoteError::Network(e.to_string()))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
        })
    }

    /// The base endpoint, without a trailing slash.
    #[must_use]
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn collection_url(&self, collection: &str) -> String {
        format!("{}/{collection}", self.endpoint)
    }

    fn classify(collection: &str, status: StatusCode) -> RemoteError {
        match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => RemoteError::PermissionDenied {
                collection: collection.to_string(),
            },
            StatusCode::SERVICE_UNAVAILABLE => {
                RemoteError::Unavailable(format!("{collection}: {status}"))
            }
            _ => RemoteError::Rejected {
                collection: collection.to_string(),
                status: status.as_u16(),
            },
        }
    }

    fn request_error(collection: &str, err: &reqwest::Error) -> RemoteError {
        if err.is_timeout() {
            RemoteError::Timeout {
                collection: collection.to_string(),
            }
        } else {
            RemoteError::Network(err.to_string())
        }
    }
}

#[async_trait]
impl RemoteStore for HttpDocumentStore {
    fn name(&self) -> &'static str {
        "http"
    }

    async fn append(
        &self,
        collection: &str,
        document_id: &str,
        document: &Value,
    ) -> Result<String, RemoteError> {
        let response = self
            .client
            .post(self.collection_url(collection))
            .query(&[("documentId", document_id)])
            .json(document)
            .send()
            .await
            .map_err(|e| Self::request_error(collection, &e))?;

        let status = response.status();
        if status.is_success() {
            tracing::debug!(collection, document_id, "document stored");
            Ok(document_id.to_string())
        } else if status == StatusCode::CONFLICT {
            tracing::debug!(collection, document_id, "document already stored");
            Ok(document_id.to_string())
        } else {
            Err(Self::classify(collection, status))
        }
    }

    async fn list(&self, collection: &str, limit: usize) -> Result<Vec<Value>, RemoteError> {
        let response = self
            .client
            .get(self.collection_url(collection))
            .query(&[("limit", limit)])
            .send()
            .await
            .map_err(|e| Self::request_error(collection, &e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(Self::classify(collection, status));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| RemoteError::Decode(e.to_string()))?;

        let documents = match body {
            Value::Array(items) => items,
            Value::Object(mut map) => match map.remove("documents") {
                Some(Value::Array(items)) => items,
                _ => return Err(RemoteError::Decode("missing 'documents' array".to_string())),
            },
            _ => return Err(RemoteError::Decode("expected a JSON array".to_string())),
        };

        Ok(documents.into_iter().take(limit).collect())
    }
}

/// A [`RemoteStore`] used when no endpoint is configured.
///
/// Every write fails as unavailable, so alerts land in the local queue.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineStore;

#[async_trait]
impl RemoteStore for OfflineStore {
    fn name(&self) -> &'static str {
        "offline"
    }

    async fn append(
        &self,
        _collection: &str,
        _document_id: &str,
        _document: &Value,
    ) -> Result<String, RemoteError> {
        Err(RemoteError::Unavailable(
            "no remote endpoint configured".to_string(),
        ))
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scriptable in-memory store for tests.

    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;

    use super::{RemoteError, RemoteStore};

    #[derive(Debug, Default)]
    pub struct ScriptedStore {
        pub denied: Mutex<HashSet<String>>,
        pub failing: Mutex<HashSet<String>>,
        pub delay: Mutex<Option<Duration>>,
        pub documents: Mutex<HashMap<String, Vec<(String, Value)>>>,
        pub attempts: Mutex<Vec<String>>,
    }

    impl ScriptedStore {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn deny(&self, collection: &str) {
            self.denied.lock().unwrap().insert(collection.to_string());
        }

        pub fn fail(&self, collection: &str) {
            self.failing.lock().unwrap().insert(collection.to_string());
        }

        pub fn heal(&self) {
            self.denied.lock().unwrap().clear();
            self.failing.lock().unwrap().clear();
            *self.delay.lock().unwrap() = None;
        }

        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap() = Some(delay);
        }

        pub fn attempts(&self) -> Vec<String> {
            self.attempts.lock().unwrap().clone()
        }

        pub fn stored(&self, collection: &str) -> Vec<(String, Value)> {
            self.documents
                .lock()
                .unwrap()
                .get(collection)
                .cloned()
                .unwrap_or_default()
        }

        pub fn total_stored(&self) -> usize {
            self.documents.lock().unwrap().values().map(Vec::len).sum()
        }
    }

    #[async_trait]
    impl RemoteStore for ScriptedStore {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn append(
            &self,
            collection: &str,
            document_id: &str,
            document: &Value,
        ) -> Result<String, RemoteError> {
            self.attempts.lock().unwrap().push(collection.to_string());

            let delay = *self.delay.lock().unwrap();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            if self.denied.lock().unwrap().contains(collection) {
                return Err(RemoteError::PermissionDenied {
                    collection: collection.to_string(),
                });
            }
            if self.failing.lock().unwrap().contains(collection) {
                return Err(RemoteError::Network("connection reset".to_string()));
            }

            let mut documents = self.documents.lock().unwrap();
            let entries = documents.entry(collection.to_string()).or_default();
            if !entries.iter().any(|(id, _)| id == document_id) {
                entries.push((document_id.to_string(), document.clone()));
            }
            Ok(document_id.to_string())
        }

        async fn list(&self, collection: &str, limit: usize) -> Result<Vec<Value>, RemoteError> {
            if self.failing.lock().unwrap().contains(collection) {
                return Err(RemoteError::Network("connection reset".to_string()));
            }
            Ok(self
                .stored(collection)
                .into_iter()
                .rev()
                .take(limit)
                .map(|(_, doc)| doc)
                .collect())
        }
    }
}
