// ============================================================================
// rustodm Library
// ============================================================================

pub mod collection;
pub mod config;
pub mod core;
pub mod document;
pub mod query;
pub mod session;
pub mod store;
pub mod tracking;

// Re-export main types for convenience
pub use collection::Collection;
pub use config::ClientConfig;
pub use crate::core::{FieldDef, FieldType, OdmError, Result, Schema};
pub use document::{Document, OpOptions, SessionSpec};
pub use query::{Filter, FindOptions, Query, QueryExecution};
pub use session::{ReadIsolation, Session, SessionId, TransactionState};
pub use store::{DocumentStore, MemoryStore, StoreStats, UpdateOutcome};
pub use tracking::{Operator, UpdateBatch};

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use futures::future::BoxFuture;

// ============================================================================
// High-level Client API
// ============================================================================

pub(crate) struct ClientInner {
    pub(crate) store: Arc<dyn DocumentStore>,
    pub(crate) config: ClientConfig,
    models: RwLock<HashMap<String, Arc<Schema>>>,
}

impl ClientInner {
    pub(crate) fn collection(self: &Arc<Self>, name: &str) -> Result<Collection> {
        let models = self.models.read().unwrap_or_else(|e| e.into_inner());
        let schema = models
            .get(name)
            .cloned()
            .ok_or_else(|| OdmError::MissingSchema(name.to_string()))?;
        Ok(Collection::new(name.to_string(), schema, Arc::clone(self)))
    }
}

/// Entry point to the persistence engine.
///
/// Registers models, hands out collections, and owns session lifecycles.
///
/// # Examples
///
/// ```
/// use rustodm::{Client, Schema, FieldDef, FieldType, Filter};
/// use serde_json::json;
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> rustodm::Result<()> {
/// let client = Client::in_memory();
/// let users = client.model(
///     "users",
///     Schema::new().field(FieldDef::new("name", FieldType::String).required()),
/// );
///
/// let user = users.create(json!({"name": "Alice"})).await?;
/// user.set("name", "Alicia")?;
/// user.save().await?;
///
/// let found = users.find(Filter::new().eq("name", "Alicia")).await?;
/// assert_eq!(found.len(), 1);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    /// Client over the built-in in-memory store.
    pub fn in_memory() -> Self {
        Self::with_store(Arc::new(MemoryStore::new()))
    }

    /// Client over any storage backend.
    pub fn with_store(store: Arc<dyn DocumentStore>) -> Self {
        Self::with_store_and_config(store, ClientConfig::default())
    }

    pub fn with_store_and_config(store: Arc<dyn DocumentStore>, config: ClientConfig) -> Self {
        Client {
            inner: Arc::new(ClientInner {
                store,
                config,
                models: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Register a model and get its collection handle. Re-registering a
    /// name replaces its schema.
    pub fn model(&self, name: &str, schema: Schema) -> Collection {
        let schema = Arc::new(schema);
        self.inner
            .models
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(name.to_string(), Arc::clone(&schema));
        Collection::new(name.to_string(), schema, Arc::clone(&self.inner))
    }

    /// Look up a registered model's collection.
    ///
    /// # Errors
    /// Fails with `MissingSchema` for unregistered names.
    pub fn collection(&self, name: &str) -> Result<Collection> {
        self.inner.collection(name)
    }

    /// Start a new session with default read isolation.
    pub fn start_session(&self) -> Session {
        self.start_session_with_isolation(ReadIsolation::default())
    }

    pub fn start_session_with_isolation(&self, isolation: ReadIsolation) -> Session {
        Session::create(
            Arc::clone(&self.inner.store),
            isolation,
            self.inner.config.max_transaction_retries,
        )
    }

    /// Run `f` inside a transaction on a fresh session, then end the
    /// session regardless of outcome.
    ///
    /// Delegates commit/abort/retry semantics to
    /// [`Session::with_transaction`].
    pub async fn transaction<T, F>(&self, f: F) -> Result<T>
    where
        F: for<'a> FnMut(&'a Session) -> BoxFuture<'a, Result<T>>,
    {
        let session = self.start_session();
        let result = session.with_transaction(f).await;
        if let Err(err) = session.end_session().await {
            tracing::warn!(session = %session.id(), error = %err, "failed to end session");
        }
        result
    }
}
