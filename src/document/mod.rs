// ============================================================================
// Document Handle
// ============================================================================
//
// Wraps a loaded (or newly constructed) document: mutable current state,
// the original snapshot as loaded, and the path tracker recording every
// mutation in between. Mutations route through the schema's cast layer
// before they are recorded, so tracked payloads are always store-ready.
//
// A handle holds only a weak association to its session; the session's
// lifecycle belongs to whoever started it. Saving inside an in-progress
// transaction captures a pre-transaction checkpoint, and the session
// notifies the handle on commit (checkpoint dropped) or abort (state,
// snapshot, is_new and tracker restored).
//
// ============================================================================

use std::panic::Location;
use std::sync::{Arc, RwLock, Weak};

use serde_json::{Number, Value};
use uuid::Uuid;

use crate::collection::Collection;
use crate::core::path::{self, FieldMap};
use crate::core::types::{is_reserved, FieldType, CREATED_AT, ID_FIELD, UPDATED_AT, VERSION_FIELD};
use crate::core::{OdmError, Result};
use crate::query::filter::Filter;
use crate::session::{Session, SessionInner, TxnId, TxnParticipant};
use crate::tracking::{change, compile, Operator, PathTracker, UpdateBatch};

/// Session selection for a single operation.
///
/// `Inherit` uses the document's bound session (or none, for collection
/// operations); `Use` overrides it; `None` explicitly runs session-less
/// even when a session is bound.
#[derive(Clone, Default)]
pub enum SessionSpec {
    #[default]
    Inherit,
    Use(Session),
    None,
}

/// Per-operation options.
#[derive(Clone, Default)]
pub struct OpOptions {
    pub session: SessionSpec,
}

impl OpOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_session(session: &Session) -> Self {
        Self {
            session: SessionSpec::Use(session.clone()),
        }
    }

    pub fn sessionless() -> Self {
        Self {
            session: SessionSpec::None,
        }
    }
}

/// State captured the first time a handle is written inside a transaction.
struct Checkpoint {
    txn: TxnId,
    state: FieldMap,
    original: FieldMap,
    is_new: bool,
    tracker: PathTracker,
}

struct DocumentInner {
    id: Uuid,
    state: FieldMap,
    original: FieldMap,
    is_new: bool,
    tracker: PathTracker,
    session: Option<Weak<SessionInner>>,
    checkpoint: Option<Checkpoint>,
}

/// Shared mutable core of a document handle; the piece a session holds a
/// weak reference to for rollback notification.
pub(crate) struct DocumentCell {
    inner: RwLock<DocumentInner>,
}

impl DocumentCell {
    fn read(&self) -> std::sync::RwLockReadGuard<'_, DocumentInner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, DocumentInner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    fn capture_checkpoint(self: &Arc<Self>, txn: TxnId, session: &Session) {
        let mut inner = self.write();
        if inner
            .checkpoint
            .as_ref()
            .map(|c| c.txn == txn)
            .unwrap_or(false)
        {
            return;
        }
        inner.checkpoint = Some(Checkpoint {
            txn,
            state: inner.state.clone(),
            original: inner.original.clone(),
            is_new: inner.is_new,
            tracker: inner.tracker.clone(),
        });
        drop(inner);
        let arc: Arc<dyn TxnParticipant> = self.clone();
        let participant: Weak<dyn TxnParticipant> = Arc::downgrade(&arc);
        session.inner().register_participant(participant);
    }
}

impl TxnParticipant for DocumentCell {
    fn on_commit(&self, txn: TxnId) {
        let mut inner = self.write();
        if inner
            .checkpoint
            .as_ref()
            .map(|c| c.txn == txn)
            .unwrap_or(false)
        {
            inner.checkpoint = None;
        }
    }

    fn on_abort(&self, txn: TxnId) {
        let mut inner = self.write();
        let checkpoint = match inner.checkpoint.take() {
            Some(checkpoint) if checkpoint.txn == txn => checkpoint,
            other => {
                inner.checkpoint = other;
                return;
            }
        };
        inner.state = checkpoint.state;
        inner.original = checkpoint.original;
        inner.is_new = checkpoint.is_new;
        inner.tracker = checkpoint.tracker;
        tracing::debug!(txn = ?txn, "document rolled back to pre-transaction state");
    }
}

/// Handle to a single document.
///
/// Cloning shares the underlying state; all clones observe the same
/// mutations and rollbacks. Overlapping unawaited mutating operations on
/// one handle are a caller error: awaited sequentially, successive saves
/// observe each other's effects in submission order.
#[derive(Clone)]
pub struct Document {
    cell: Arc<DocumentCell>,
    collection: Collection,
}

impl Document {
    pub(crate) fn create(
        collection: Collection,
        id: Uuid,
        state: FieldMap,
        is_new: bool,
        session: Option<&Session>,
    ) -> Self {
        let inner = DocumentInner {
            id,
            original: if is_new { FieldMap::new() } else { state.clone() },
            state,
            is_new,
            tracker: PathTracker::new(),
            session: session.map(|s| Arc::downgrade(s.inner())),
            checkpoint: None,
        };
        Document {
            cell: Arc::new(DocumentCell {
                inner: RwLock::new(inner),
            }),
            collection,
        }
    }

    pub fn id(&self) -> Uuid {
        self.cell.read().id
    }

    pub fn collection(&self) -> &Collection {
        &self.collection
    }

    /// True until the first successful insert; reverts to true when the
    /// inserting transaction aborts, or after a successful `remove`.
    pub fn is_new(&self) -> bool {
        self.cell.read().is_new
    }

    pub fn get(&self, field_path: &str) -> Option<Value> {
        path::get_value(&self.cell.read().state, field_path).cloned()
    }

    pub fn to_value(&self) -> Value {
        Value::Object(self.cell.read().state.clone())
    }

    pub fn modified_paths(&self) -> Vec<String> {
        self.cell
            .read()
            .tracker
            .modified_paths()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    pub fn is_modified(&self, field_path: &str) -> bool {
        self.cell.read().tracker.is_dirty(field_path)
    }

    /// Compile pending changes into the operator batch a save would send.
    /// Pure read: tracker state is untouched.
    pub fn changes(&self) -> UpdateBatch {
        compile(&self.cell.read().tracker.snapshot())
    }

    /// The currently bound session, if its owner still holds it.
    pub fn session(&self) -> Option<Session> {
        self.cell
            .read()
            .session
            .as_ref()?
            .upgrade()
            .map(Session::from_inner)
    }

    /// Rebind (or clear) the session association. Does not affect
    /// operations already issued.
    pub fn set_session(&self, session: Option<&Session>) {
        self.cell.write().session = session.map(|s| Arc::downgrade(s.inner()));
    }

    /// Assign `value` at `path`, casting through the schema.
    #[track_caller]
    pub fn set(&self, field_path: &str, value: impl Into<Value>) -> Result<()> {
        let origin = Location::caller();
        if is_reserved(field_path) {
            return Err(OdmError::Validation(format!(
                "field \"{}\" is engine-managed",
                field_path
            )));
        }
        let casted = self.collection.schema().cast_path(
            field_path,
            value.into(),
            self.collection.name(),
            origin,
        )?;

        let mut inner = self.cell.write();
        path::set_value(&mut inner.state, field_path, casted.clone());
        if !Self::refresh_covering_ancestor(&mut inner, field_path) {
            inner.tracker.record_set(field_path, casted);
        }
        Ok(())
    }

    /// Remove the value at `path`.
    pub fn unset(&self, field_path: &str) -> Result<()> {
        if is_reserved(field_path) {
            return Err(OdmError::Validation(format!(
                "field \"{}\" is engine-managed",
                field_path
            )));
        }
        let mut inner = self.cell.write();
        path::remove_value(&mut inner.state, field_path);
        if !Self::refresh_covering_ancestor(&mut inner, field_path) {
            inner.tracker.record_unset(field_path);
        }
        Ok(())
    }

    /// Append `value` to the array at `path`.
    #[track_caller]
    pub fn push(&self, field_path: &str, value: impl Into<Value>) -> Result<()> {
        self.push_each(field_path, vec![value.into()])
    }

    /// Append several values to the array at `path`.
    #[track_caller]
    pub fn push_each(&self, field_path: &str, values: Vec<Value>) -> Result<()> {
        let origin = Location::caller();
        let casted = self.cast_elements(field_path, values, origin)?;

        let mut inner = self.cell.write();
        let mut items = match path::get_value(&inner.state, field_path).cloned() {
            Some(Value::Array(items)) => items,
            Some(Value::Null) | None => Vec::new(),
            Some(other) => {
                return Err(OdmError::Validation(format!(
                    "cannot push to non-array value {} at \"{}\"",
                    other, field_path
                )))
            }
        };
        items.extend(casted.clone());
        path::set_value(&mut inner.state, field_path, Value::Array(items));

        if !Self::refresh_covering_ancestor(&mut inner, field_path) {
            if Self::refresh_covering_self(&mut inner, field_path) {
                return Ok(());
            }
            inner.tracker.record_array_push(field_path, casted);
        }
        Ok(())
    }

    /// Remove every element equal to `value` from the array at `path`.
    #[track_caller]
    pub fn pull(&self, field_path: &str, value: impl Into<Value>) -> Result<()> {
        let origin = Location::caller();
        let casted = self.cast_elements(field_path, vec![value.into()], origin)?;

        let mut inner = self.cell.write();
        if let Some(Value::Array(items)) = path::get_value(&inner.state, field_path).cloned() {
            let kept: Vec<Value> = items
                .into_iter()
                .filter(|item| !casted.contains(item))
                .collect();
            path::set_value(&mut inner.state, field_path, Value::Array(kept));
        }

        if !Self::refresh_covering_ancestor(&mut inner, field_path) {
            if Self::refresh_covering_self(&mut inner, field_path) {
                return Ok(());
            }
            inner.tracker.record_array_pull(field_path, casted);
        }
        Ok(())
    }

    /// Add `amount` to the numeric value at `path` (missing counts as zero).
    pub fn inc(&self, field_path: &str, amount: impl Into<Number>) -> Result<()> {
        if is_reserved(field_path) {
            return Err(OdmError::Validation(format!(
                "field \"{}\" is engine-managed",
                field_path
            )));
        }
        let amount = amount.into();
        let mut inner = self.cell.write();
        let current = match path::get_value(&inner.state, field_path) {
            Some(Value::Number(n)) => n.clone(),
            Some(Value::Null) | None => Number::from(0),
            Some(other) => {
                return Err(OdmError::Validation(format!(
                    "cannot increment non-numeric value {} at \"{}\"",
                    other, field_path
                )))
            }
        };
        let next = change::add_numbers(&current, &amount);
        path::set_value(&mut inner.state, field_path, Value::Number(next));

        if !Self::refresh_covering_ancestor(&mut inner, field_path) {
            if Self::refresh_covering_self(&mut inner, field_path) {
                return Ok(());
            }
            inner.tracker.record_increment(field_path, amount);
        }
        Ok(())
    }

    /// Persist pending changes under the bound session.
    pub async fn save(&self) -> Result<()> {
        self.save_with(OpOptions::new()).await
    }

    /// Persist pending changes.
    ///
    /// New documents insert their full state; saved documents send the
    /// compiled operator batch, or nothing at all when no changes are
    /// pending. A failed save leaves the tracker untouched so the call can
    /// be retried.
    pub async fn save_with(&self, options: OpOptions) -> Result<()> {
        let session = self.resolve_session(&options.session);
        if let Some(s) = &session {
            if let Some(txn) = s.inner().current_txn() {
                self.cell.capture_checkpoint(txn, s);
            }
        }
        let token = session.as_ref().and_then(Session::token);

        let schema = self.collection.schema();
        let model = self.collection.name().to_string();
        let store = self.collection.store();

        enum Plan {
            Noop,
            Insert(FieldMap),
            Update { filter: Filter, batch: UpdateBatch },
        }

        let plan = {
            let mut inner = self.cell.write();
            if self.collection.config().validate_on_save {
                schema.validate(&inner.state, &model)?;
            }

            if inner.is_new {
                let id = inner.id.hyphenated().to_string();
                inner.state.insert(ID_FIELD.into(), Value::String(id));
                if schema.is_versioned() {
                    inner.state.insert(VERSION_FIELD.into(), Value::from(0));
                }
                if schema.has_timestamps() {
                    let now = Value::String(chrono::Utc::now().to_rfc3339());
                    inner.state.insert(CREATED_AT.into(), now.clone());
                    inner.state.insert(UPDATED_AT.into(), now);
                }
                Plan::Insert(inner.state.clone())
            } else {
                let mut batch = compile(&inner.tracker.snapshot());
                if batch.is_empty() {
                    Plan::Noop
                } else {
                    if schema.has_timestamps() {
                        let now = Value::String(chrono::Utc::now().to_rfc3339());
                        inner.state.insert(UPDATED_AT.into(), now.clone());
                        batch.insert(Operator::Set, UPDATED_AT, now);
                    }
                    let mut filter = Filter::by_id(inner.id.hyphenated());
                    if schema.is_versioned() {
                        if let Some(version) = inner.original.get(VERSION_FIELD) {
                            filter = filter.eq(VERSION_FIELD, version.clone());
                        }
                        batch.insert(Operator::Inc, VERSION_FIELD, Value::from(1));
                    }
                    Plan::Update { filter, batch }
                }
            }
        };

        match plan {
            Plan::Noop => Ok(()),
            Plan::Insert(doc) => {
                store.insert_many(&model, vec![doc], token).await?;
                let mut inner = self.cell.write();
                inner.is_new = false;
                inner.tracker.clear();
                inner.original = inner.state.clone();
                tracing::debug!(model = %model, id = %inner.id, "document inserted");
                Ok(())
            }
            Plan::Update { filter, batch } => {
                let outcome = store.update_one(&model, &filter, &batch, token).await?;
                if outcome.matched == 0 {
                    return Err(OdmError::not_found(
                        model,
                        self.cell.read().id.hyphenated(),
                        "save",
                    ));
                }
                let mut inner = self.cell.write();
                if schema.is_versioned() {
                    let next = inner
                        .state
                        .get(VERSION_FIELD)
                        .and_then(Value::as_i64)
                        .unwrap_or(0)
                        + 1;
                    inner.state.insert(VERSION_FIELD.into(), Value::from(next));
                }
                inner.tracker.clear();
                inner.original = inner.state.clone();
                tracing::debug!(model = %model, id = %inner.id, "document updated");
                Ok(())
            }
        }
    }

    /// Delete the document's row under the bound session.
    pub async fn remove(&self) -> Result<()> {
        self.remove_with(OpOptions::new()).await
    }

    /// Delete the document's row.
    ///
    /// In-memory state stays readable; a later `save` re-inserts the
    /// document.
    pub async fn remove_with(&self, options: OpOptions) -> Result<()> {
        let session = self.resolve_session(&options.session);
        if let Some(s) = &session {
            if let Some(txn) = s.inner().current_txn() {
                self.cell.capture_checkpoint(txn, s);
            }
        }
        let token = session.as_ref().and_then(Session::token);

        let model = self.collection.name().to_string();
        let id = self.cell.read().id;
        let deleted = self
            .collection
            .store()
            .delete_one(&model, &Filter::by_id(id.hyphenated()), token)
            .await?;
        if deleted == 0 {
            return Err(OdmError::not_found(model, id.hyphenated(), "remove"));
        }
        self.cell.write().is_new = true;
        tracing::debug!(model = %model, id = %id, "document removed");
        Ok(())
    }

    /// Replace the referenced id at `path` with the referenced document's
    /// value, looked up under the document's bound session.
    pub async fn populate(&self, field_path: &str) -> Result<()> {
        self.populate_with(field_path, SessionSpec::Inherit).await
    }

    /// Populate with an explicit session choice. `SessionSpec::None`
    /// forces a session-less lookup even when a session is bound.
    pub async fn populate_with(&self, field_path: &str, session: SessionSpec) -> Result<()> {
        let target = match self.collection.schema().type_at(field_path) {
            Some(FieldType::Ref(collection)) => collection.clone(),
            _ => {
                return Err(OdmError::Validation(format!(
                    "path \"{}\" on model \"{}\" is not a reference",
                    field_path,
                    self.collection.name()
                )))
            }
        };
        let Some(ref_id) = self
            .get(field_path)
            .and_then(|v| v.as_str().map(str::to_string))
        else {
            return Ok(());
        };

        let session = self.resolve_session(&session);
        let referenced = self
            .collection
            .sibling(&target)?
            .find_raw(
                &Filter::by_id(&ref_id),
                &crate::query::filter::FindOptions::new().limit(1),
                session.as_ref(),
            )
            .await?
            .into_iter()
            .next();

        // Populated values are a read-side convenience: they replace the
        // reference in memory without dirtying the tracker.
        let mut inner = self.cell.write();
        match referenced {
            Some(map) => path::set_value(&mut inner.state, field_path, Value::Object(map)),
            None => path::set_value(&mut inner.state, field_path, Value::Null),
        }
        Ok(())
    }

    pub(crate) fn resolve_session(&self, spec: &SessionSpec) -> Option<Session> {
        let candidate = match spec {
            SessionSpec::Inherit => self.session(),
            SessionSpec::Use(session) => Some(session.clone()),
            SessionSpec::None => None,
        };
        // An ended session degrades to session-less execution.
        candidate.filter(|s| !s.transaction_state().is_ended())
    }

    fn cast_elements(
        &self,
        field_path: &str,
        values: Vec<Value>,
        origin: &'static Location<'static>,
    ) -> Result<Vec<Value>> {
        if is_reserved(field_path) {
            return Err(OdmError::Validation(format!(
                "field \"{}\" is engine-managed",
                field_path
            )));
        }
        let schema = self.collection.schema();
        let model = self.collection.name();
        match schema.type_at(field_path) {
            Some(FieldType::Array(element)) => values
                .into_iter()
                .map(|value| {
                    element.cast(value.clone()).map_err(|failure| {
                        OdmError::cast_at(failure.expected, &value, field_path, model, origin)
                    })
                })
                .collect(),
            Some(FieldType::Any) => Ok(values),
            Some(other) => Err(OdmError::Validation(format!(
                "path \"{}\" on model \"{}\" is {}, not an array",
                field_path,
                model,
                other.type_name()
            ))),
            None if schema.is_strict() => Err(OdmError::Validation(format!(
                "path \"{}\" is not declared on model \"{}\"",
                field_path, model
            ))),
            None => Ok(values),
        }
    }

    /// A pending Set/Unset on a strict ancestor already materializes this
    /// write; refresh that ancestor's payload instead of recording a new op.
    fn refresh_covering_ancestor(inner: &mut DocumentInner, field_path: &str) -> bool {
        let owner = match inner.tracker.exclusive_covering(field_path) {
            Some(owner) if owner != field_path => owner.to_string(),
            _ => return false,
        };
        if let Some(materialized) = path::get_value(&inner.state, &owner).cloned() {
            inner.tracker.record_set(&owner, materialized);
        }
        true
    }

    /// A pending Set/Unset on the exact path supersedes array and increment
    /// ops; re-record it with the materialized value.
    fn refresh_covering_self(inner: &mut DocumentInner, field_path: &str) -> bool {
        if inner.tracker.exclusive_covering(field_path) != Some(field_path) {
            return false;
        }
        let materialized = path::get_value(&inner.state, field_path)
            .cloned()
            .unwrap_or(Value::Null);
        inner.tracker.record_set(field_path, materialized);
        true
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.cell.read();
        f.debug_struct("Document")
            .field("collection", &self.collection.name())
            .field("id", &inner.id)
            .field("is_new", &inner.is_new)
            .field("modified", &inner.tracker.modified_paths())
            .finish()
    }
}
