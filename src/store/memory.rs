//! In-memory document store with transaction staging.
//!
//! Committed collections live in plain maps; each in-progress transaction
//! stages its writes in a per-session buffer. Reads on the writing session
//! overlay the buffer; reads elsewhere see only committed state. Commit
//! applies the buffer in order, abort discards it. A write that touches a
//! document already staged by another in-progress transaction fails with a
//! write conflict, which is the store's transient error class.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use serde_json::Value;

use super::backend::{DocumentStore, UpdateOutcome};
use crate::core::path::{self, FieldMap};
use crate::core::types::ID_FIELD;
use crate::core::{OdmError, Result};
use crate::query::filter::{Filter, FindOptions};
use crate::session::{ReadIsolation, SessionId, SessionToken};
use crate::tracking::{Operator, UpdateBatch};

#[derive(Debug, Clone)]
enum StagedOp {
    Insert { collection: String, doc: FieldMap },
    Update {
        collection: String,
        id: String,
        update: UpdateBatch,
    },
    Delete { collection: String, id: String },
}

#[derive(Debug, Default)]
struct TxnBuffer {
    ops: Vec<StagedOp>,
    /// (collection, _id) pairs written by this transaction, for conflict
    /// detection against other in-progress transactions.
    touched: HashSet<(String, String)>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    collections: HashMap<String, Vec<FieldMap>>,
    txns: HashMap<SessionId, TxnBuffer>,
}

/// Operation counters, in the spirit of pool statistics: cheap to read,
/// handy for asserting that a no-op save issued no write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub inserts: u64,
    pub updates: u64,
    pub deletes: u64,
    pub finds: u64,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryInner>,
    inserts: AtomicU64,
    updates: AtomicU64,
    deletes: AtomicU64,
    finds: AtomicU64,
}

fn doc_id(doc: &FieldMap) -> Option<&str> {
    doc.get(ID_FIELD).and_then(Value::as_str)
}

/// Apply a compiled operator batch to a materialized document.
fn apply_batch(doc: &mut FieldMap, update: &UpdateBatch) {
    for op in update.operators() {
        for (target, payload) in update.entries(op) {
            match op {
                Operator::Set => path::set_value(doc, target, payload.clone()),
                Operator::Unset => {
                    path::remove_value(doc, target);
                }
                Operator::Push => {
                    let each = payload
                        .get("$each")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default();
                    match path::get_value(doc, target).cloned() {
                        Some(Value::Array(mut items)) => {
                            items.extend(each);
                            path::set_value(doc, target, Value::Array(items));
                        }
                        _ => path::set_value(doc, target, Value::Array(each)),
                    }
                }
                Operator::PullAll => {
                    let removals = payload.as_array().cloned().unwrap_or_default();
                    if let Some(Value::Array(items)) = path::get_value(doc, target).cloned() {
                        let kept: Vec<Value> = items
                            .into_iter()
                            .filter(|item| !removals.contains(item))
                            .collect();
                        path::set_value(doc, target, Value::Array(kept));
                    }
                }
                Operator::Inc => {
                    let delta = payload.as_f64().unwrap_or(0.0);
                    let current = path::get_value(doc, target)
                        .and_then(Value::as_f64)
                        .unwrap_or(0.0);
                    let sum = current + delta;
                    let next = if sum.fract() == 0.0
                        && payload.is_i64()
                        && path::get_value(doc, target)
                            .map(|v| v.is_i64() || v.is_null())
                            .unwrap_or(true)
                    {
                        Value::from(sum as i64)
                    } else {
                        Value::from(sum)
                    };
                    path::set_value(doc, target, next);
                }
            }
        }
    }
}

impl MemoryInner {
    /// Materialize what `token` is allowed to see of `collection`.
    fn view(&self, collection: &str, token: Option<SessionToken>) -> Vec<FieldMap> {
        let mut docs = self
            .collections
            .get(collection)
            .cloned()
            .unwrap_or_default();

        let Some(token) = token else { return docs };
        if token.txn.is_none() || token.isolation == ReadIsolation::CommittedOnly {
            return docs;
        }
        let Some(buffer) = self.txns.get(&token.id) else {
            return docs;
        };

        for op in &buffer.ops {
            match op {
                StagedOp::Insert { collection: c, doc } if c == collection => {
                    docs.push(doc.clone());
                }
                StagedOp::Update {
                    collection: c,
                    id,
                    update,
                } if c == collection => {
                    if let Some(doc) =
                        docs.iter_mut().find(|d| doc_id(d) == Some(id.as_str()))
                    {
                        apply_batch(doc, update);
                    }
                }
                StagedOp::Delete { collection: c, id } if c == collection => {
                    docs.retain(|d| doc_id(d) != Some(id.as_str()));
                }
                _ => {}
            }
        }
        docs
    }

    /// Write-write conflict: the key is already staged by a different
    /// in-progress transaction.
    fn conflicts(&self, writer: Option<SessionToken>, key: &(String, String)) -> bool {
        let writer_id = writer.and_then(|t| t.txn.map(|_| t.id));
        self.txns
            .iter()
            .any(|(id, buffer)| Some(*id) != writer_id && buffer.touched.contains(key))
    }

    fn in_txn(token: Option<SessionToken>) -> Option<SessionId> {
        token.and_then(|t| t.txn.map(|_| t.id))
    }

    fn stage(&mut self, session: SessionId, key: (String, String), op: StagedOp) {
        let buffer = self.txns.entry(session).or_default();
        buffer.touched.insert(key);
        buffer.ops.push(op);
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            inserts: self.inserts.load(Ordering::SeqCst),
            updates: self.updates.load(Ordering::SeqCst),
            deletes: self.deletes.load(Ordering::SeqCst),
            finds: self.finds.load(Ordering::SeqCst),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, MemoryInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, MemoryInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<FieldMap>,
        session: Option<SessionToken>,
    ) -> Result<()> {
        self.inserts.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.write();

        for doc in &docs {
            let id = doc_id(doc)
                .ok_or_else(|| OdmError::Store("insert without _id".into()))?
                .to_string();
            let key = (collection.to_string(), id.clone());
            if inner.conflicts(session, &key) {
                return Err(OdmError::WriteConflict(format!(
                    "document {} in '{}' is being written by another transaction",
                    id, collection
                )));
            }
            let visible = inner.view(collection, session);
            if visible.iter().any(|d| doc_id(d) == Some(id.as_str())) {
                return Err(OdmError::DuplicateKey {
                    collection: collection.to_string(),
                    id,
                });
            }
        }

        match MemoryInner::in_txn(session) {
            Some(session_id) => {
                for doc in docs {
                    let id = doc_id(&doc).unwrap_or_default().to_string();
                    inner.stage(
                        session_id,
                        (collection.to_string(), id),
                        StagedOp::Insert {
                            collection: collection.to_string(),
                            doc,
                        },
                    );
                }
            }
            None => {
                inner
                    .collections
                    .entry(collection.to_string())
                    .or_default()
                    .extend(docs);
            }
        }
        Ok(())
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
        session: Option<SessionToken>,
    ) -> Result<Vec<FieldMap>> {
        self.finds.fetch_add(1, Ordering::SeqCst);
        let inner = self.read();

        let mut results: Vec<FieldMap> = inner
            .view(collection, session)
            .into_iter()
            .filter(|doc| filter.matches(doc))
            .collect();

        if let Some(limit) = options.limit {
            results.truncate(limit);
        }
        if let Some(fields) = &options.projection {
            for doc in &mut results {
                doc.retain(|key, _| key == ID_FIELD || fields.iter().any(|f| f == key));
            }
        }
        Ok(results)
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateBatch,
        session: Option<SessionToken>,
    ) -> Result<UpdateOutcome> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.write();

        let target = inner
            .view(collection, session)
            .into_iter()
            .find(|doc| filter.matches(doc));
        let Some(target) = target else {
            return Ok(UpdateOutcome::default());
        };
        let id = doc_id(&target).unwrap_or_default().to_string();
        let key = (collection.to_string(), id.clone());

        if inner.conflicts(session, &key) {
            return Err(OdmError::WriteConflict(format!(
                "document {} in '{}' is being written by another transaction",
                id, collection
            )));
        }

        match MemoryInner::in_txn(session) {
            Some(session_id) => inner.stage(
                session_id,
                key,
                StagedOp::Update {
                    collection: collection.to_string(),
                    id,
                    update: update.clone(),
                },
            ),
            None => {
                if let Some(doc) = inner
                    .collections
                    .entry(collection.to_string())
                    .or_default()
                    .iter_mut()
                    .find(|d| doc_id(d) == Some(id.as_str()))
                {
                    apply_batch(doc, update);
                }
            }
        }
        Ok(UpdateOutcome {
            matched: 1,
            modified: 1,
        })
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateBatch,
        session: Option<SessionToken>,
    ) -> Result<UpdateOutcome> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.write();

        let ids: Vec<String> = inner
            .view(collection, session)
            .into_iter()
            .filter(|doc| filter.matches(doc))
            .filter_map(|doc| doc_id(&doc).map(str::to_string))
            .collect();

        for id in &ids {
            let key = (collection.to_string(), id.clone());
            if inner.conflicts(session, &key) {
                return Err(OdmError::WriteConflict(format!(
                    "document {} in '{}' is being written by another transaction",
                    id, collection
                )));
            }
        }

        for id in &ids {
            let key = (collection.to_string(), id.clone());
            match MemoryInner::in_txn(session) {
                Some(session_id) => inner.stage(
                    session_id,
                    key,
                    StagedOp::Update {
                        collection: collection.to_string(),
                        id: id.clone(),
                        update: update.clone(),
                    },
                ),
                None => {
                    if let Some(doc) = inner
                        .collections
                        .entry(collection.to_string())
                        .or_default()
                        .iter_mut()
                        .find(|d| doc_id(d) == Some(id.as_str()))
                    {
                        apply_batch(doc, update);
                    }
                }
            }
        }
        Ok(UpdateOutcome {
            matched: ids.len() as u64,
            modified: ids.len() as u64,
        })
    }

    async fn delete_one(
        &self,
        collection: &str,
        filter: &Filter,
        session: Option<SessionToken>,
    ) -> Result<u64> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.delete(collection, filter, session, Some(1))
    }

    async fn delete_many(
        &self,
        collection: &str,
        filter: &Filter,
        session: Option<SessionToken>,
    ) -> Result<u64> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        self.delete(collection, filter, session, None)
    }

    async fn commit_transaction(&self, session: SessionToken) -> Result<()> {
        let mut inner = self.write();
        let Some(buffer) = inner.txns.remove(&session.id) else {
            return Ok(());
        };

        // Validate before applying anything; a commit either lands whole or
        // not at all.
        for op in &buffer.ops {
            if let StagedOp::Insert { collection, doc } = op {
                let dup = doc_id(doc).is_some_and(|id| {
                    inner
                        .collections
                        .get(collection)
                        .map(|committed| committed.iter().any(|d| doc_id(d) == Some(id)))
                        .unwrap_or(false)
                });
                if dup {
                    return Err(OdmError::WriteConflict(format!(
                        "document {} in '{}' was committed concurrently",
                        doc_id(doc).unwrap_or_default(),
                        collection
                    )));
                }
            }
        }

        for op in buffer.ops {
            match op {
                StagedOp::Insert { collection, doc } => {
                    inner
                        .collections
                        .entry(collection)
                        .or_default()
                        .push(doc);
                }
                StagedOp::Update {
                    collection,
                    id,
                    update,
                } => {
                    if let Some(doc) = inner
                        .collections
                        .entry(collection)
                        .or_default()
                        .iter_mut()
                        .find(|d| doc_id(d) == Some(id.as_str()))
                    {
                        apply_batch(doc, &update);
                    }
                }
                StagedOp::Delete { collection, id } => {
                    inner
                        .collections
                        .entry(collection)
                        .or_default()
                        .retain(|d| doc_id(d) != Some(id.as_str()));
                }
            }
        }
        Ok(())
    }

    async fn abort_transaction(&self, session: SessionToken) -> Result<()> {
        self.write().txns.remove(&session.id);
        Ok(())
    }

    async fn end_session(&self, session: SessionId) -> Result<()> {
        self.write().txns.remove(&session);
        Ok(())
    }
}

impl MemoryStore {
    fn delete(
        &self,
        collection: &str,
        filter: &Filter,
        session: Option<SessionToken>,
        limit: Option<usize>,
    ) -> Result<u64> {
        let mut inner = self.write();

        let mut ids: Vec<String> = inner
            .view(collection, session)
            .into_iter()
            .filter(|doc| filter.matches(doc))
            .filter_map(|doc| doc_id(&doc).map(str::to_string))
            .collect();
        if let Some(limit) = limit {
            ids.truncate(limit);
        }

        for id in &ids {
            let key = (collection.to_string(), id.clone());
            if inner.conflicts(session, &key) {
                return Err(OdmError::WriteConflict(format!(
                    "document {} in '{}' is being written by another transaction",
                    id, collection
                )));
            }
        }

        for id in &ids {
            match MemoryInner::in_txn(session) {
                Some(session_id) => inner.stage(
                    session_id,
                    (collection.to_string(), id.clone()),
                    StagedOp::Delete {
                        collection: collection.to_string(),
                        id: id.clone(),
                    },
                ),
                None => {
                    inner
                        .collections
                        .entry(collection.to_string())
                        .or_default()
                        .retain(|d| doc_id(d) != Some(id.as_str()));
                }
            }
        }
        Ok(ids.len() as u64)
    }
}
