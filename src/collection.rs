//! Typed entry points for one model's documents.
//!
//! A `Collection` couples a collection name with its schema and the shared
//! client state. It constructs document handles, builds queries, and runs
//! the session-scoped operations the storage collaborator exposes.

use std::panic::Location;
use std::sync::Arc;

use serde_json::Value;
use uuid::Uuid;

use crate::core::path::FieldMap;
use crate::core::types::{is_reserved, FieldType, ID_FIELD};
use crate::core::{OdmError, Result, Schema};
use crate::document::{Document, OpOptions, SessionSpec};
use crate::query::filter::{Filter, FindOptions};
use crate::query::Query;
use crate::session::Session;
use crate::store::backend::{DocumentStore, UpdateOutcome};
use crate::tracking::UpdateBatch;
use crate::{ClientConfig, ClientInner};

struct CollectionInner {
    name: String,
    schema: Arc<Schema>,
    client: Arc<ClientInner>,
}

#[derive(Clone)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

impl Collection {
    pub(crate) fn new(name: String, schema: Arc<Schema>, client: Arc<ClientInner>) -> Self {
        Collection {
            inner: Arc::new(CollectionInner {
                name,
                schema,
                client,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn schema(&self) -> &Schema {
        &self.inner.schema
    }

    pub(crate) fn store(&self) -> Arc<dyn DocumentStore> {
        Arc::clone(&self.inner.client.store)
    }

    pub(crate) fn config(&self) -> &ClientConfig {
        &self.inner.client.config
    }

    /// Another registered collection on the same client, for reference
    /// lookups.
    pub(crate) fn sibling(&self, name: &str) -> Result<Collection> {
        self.inner.client.collection(name)
    }

    /// Construct an unsaved document from raw values, casting every field
    /// through the schema.
    ///
    /// A provided `_id` is cast and kept; otherwise one is generated.
    /// Engine-managed fields other than `_id` are ignored.
    #[track_caller]
    pub fn new_document(&self, value: Value) -> Result<Document> {
        let origin = Location::caller();
        let Value::Object(fields) = value else {
            return Err(OdmError::Validation(format!(
                "document for model \"{}\" must be an object",
                self.name()
            )));
        };

        let mut id = None;
        let mut state = FieldMap::new();
        for (key, field_value) in fields {
            if key == ID_FIELD {
                let casted = FieldType::Id.cast(field_value.clone()).map_err(|failure| {
                    OdmError::cast_at(failure.expected, &field_value, ID_FIELD, self.name(), origin)
                })?;
                if let Some(raw) = casted.as_str() {
                    id = Some(Uuid::parse_str(raw).map_err(|_| {
                        OdmError::cast_at("Id", raw, ID_FIELD, self.name(), origin)
                    })?);
                }
                continue;
            }
            if is_reserved(&key)
                || key == crate::core::types::CREATED_AT
                || key == crate::core::types::UPDATED_AT
            {
                continue;
            }
            let casted = self
                .schema()
                .cast_path(&key, field_value, self.name(), origin)?;
            state.insert(key, casted);
        }

        Ok(Document::create(
            self.clone(),
            id.unwrap_or_else(Uuid::new_v4),
            state,
            true,
            None,
        ))
    }

    /// Construct and immediately persist a document.
    pub async fn create(&self, value: Value) -> Result<Document> {
        self.create_with(value, OpOptions::new()).await
    }

    /// Construct and persist a document; with a session in `options` the
    /// document comes back bound to it.
    pub async fn create_with(&self, value: Value, options: OpOptions) -> Result<Document> {
        let doc = self.new_document(value)?;
        if let Some(session) = resolve_collection_session(&options.session) {
            doc.set_session(Some(&session));
        }
        doc.save().await?;
        Ok(doc)
    }

    /// Construct and persist several documents, bound to the session in
    /// `options` when one is given.
    pub async fn insert_many(
        &self,
        values: Vec<Value>,
        options: OpOptions,
    ) -> Result<Vec<Document>> {
        let session = resolve_collection_session(&options.session);
        let mut docs = Vec::with_capacity(values.len());
        for value in values {
            let doc = self.new_document(value)?;
            if let Some(session) = &session {
                doc.set_session(Some(session));
            }
            doc.save().await?;
            docs.push(doc);
        }
        Ok(docs)
    }

    /// Deferred query for every matching document.
    pub fn find(&self, filter: Filter) -> Query<Vec<Document>> {
        Query::new(self.clone(), Ok(filter))
    }

    /// Deferred query for the first matching document.
    pub fn find_one(&self, filter: Filter) -> Query<Option<Document>> {
        Query::new(self.clone(), Ok(filter))
    }

    /// Deferred query by identity. A malformed id does not fail here; it
    /// fails the query's own execution with a cast error anchored at this
    /// call site.
    #[track_caller]
    pub fn find_by_id(&self, id: impl AsRef<str>) -> Query<Option<Document>> {
        let origin = Location::caller();
        let raw = id.as_ref();
        let filter = Uuid::parse_str(raw)
            .map(|id| Filter::by_id(id.hyphenated()))
            .map_err(|_| OdmError::cast_at("Id", raw, ID_FIELD, self.name(), origin));
        Query::new(self.clone(), filter)
    }

    pub async fn count_documents(&self, filter: Filter) -> Result<u64> {
        self.count_documents_with(filter, OpOptions::new()).await
    }

    pub async fn count_documents_with(&self, filter: Filter, options: OpOptions) -> Result<u64> {
        let session = resolve_collection_session(&options.session);
        let raw = self
            .find_raw(&filter, &FindOptions::new(), session.as_ref())
            .await?;
        Ok(raw.len() as u64)
    }

    pub async fn update_one(
        &self,
        filter: Filter,
        update: &UpdateBatch,
        options: OpOptions,
    ) -> Result<UpdateOutcome> {
        let session = resolve_collection_session(&options.session);
        let token = session.as_ref().and_then(Session::token);
        self.store()
            .update_one(self.name(), &filter, update, token)
            .await
    }

    pub async fn update_many(
        &self,
        filter: Filter,
        update: &UpdateBatch,
        options: OpOptions,
    ) -> Result<UpdateOutcome> {
        let session = resolve_collection_session(&options.session);
        let token = session.as_ref().and_then(Session::token);
        self.store()
            .update_many(self.name(), &filter, update, token)
            .await
    }

    pub async fn delete_one(&self, filter: Filter, options: OpOptions) -> Result<u64> {
        let session = resolve_collection_session(&options.session);
        let token = session.as_ref().and_then(Session::token);
        self.store().delete_one(self.name(), &filter, token).await
    }

    pub async fn delete_many(&self, filter: Filter, options: OpOptions) -> Result<u64> {
        let session = resolve_collection_session(&options.session);
        let token = session.as_ref().and_then(Session::token);
        self.store().delete_many(self.name(), &filter, token).await
    }

    /// Raw session-scoped read, used by query execution and populate.
    pub(crate) async fn find_raw(
        &self,
        filter: &Filter,
        options: &FindOptions,
        session: Option<&Session>,
    ) -> Result<Vec<FieldMap>> {
        let token = session.and_then(Session::token);
        self.store().find(self.name(), filter, options, token).await
    }

    /// Wrap a stored document into a handle bound to `session`.
    pub(crate) fn hydrate(&self, map: FieldMap, session: Option<&Session>) -> Result<Document> {
        let id = map
            .get(ID_FIELD)
            .and_then(Value::as_str)
            .and_then(|raw| Uuid::parse_str(raw).ok())
            .ok_or_else(|| {
                OdmError::Store(format!(
                    "stored document in '{}' has no valid _id",
                    self.name()
                ))
            })?;
        Ok(Document::create(self.clone(), id, map, false, session))
    }

    /// Execute a materialized query: fetch, hydrate, then populate.
    ///
    /// Documents fetched under a session come back bound to it, so the
    /// populate lookups inherit that session unless overridden later.
    pub(crate) async fn run_query(
        &self,
        filter: Filter,
        options: FindOptions,
        session: Option<Session>,
        populate: Vec<String>,
    ) -> Result<Vec<Document>> {
        let raw = self.find_raw(&filter, &options, session.as_ref()).await?;
        let mut docs = Vec::with_capacity(raw.len());
        for map in raw {
            docs.push(self.hydrate(map, session.as_ref())?);
        }
        for field_path in &populate {
            for doc in &docs {
                doc.populate(field_path).await?;
            }
        }
        Ok(docs)
    }
}

/// Collection-level operations have no bound session to inherit; `Inherit`
/// simply means session-less here. Ended sessions degrade the same way.
pub(crate) fn resolve_collection_session(spec: &SessionSpec) -> Option<Session> {
    match spec {
        SessionSpec::Inherit | SessionSpec::None => None,
        SessionSpec::Use(session) => {
            Some(session.clone()).filter(|s| !s.transaction_state().is_ended())
        }
    }
}

impl std::fmt::Debug for Collection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.inner.name)
            .finish()
    }
}
