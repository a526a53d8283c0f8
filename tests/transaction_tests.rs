/// Transaction tests
///
/// Session-scoped isolation, commit/abort lifecycle, document rollback on
/// abort, with_transaction retry semantics and ended-session degradation.
/// Run with: cargo test --test transaction_tests
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use rustodm::{
    Client, Document, DocumentStore, FieldDef, FieldType, Filter, FindOptions, MemoryStore,
    OdmError, OpOptions, Operator, Result, Schema, SessionId, TransactionState, UpdateBatch,
    UpdateOutcome,
};
use rustodm::core::path::FieldMap;
use rustodm::session::SessionToken;
use serde_json::json;

fn customer_schema() -> Schema {
    Schema::new()
        .field(FieldDef::new("name", FieldType::String))
        .field(FieldDef::new("house", FieldType::String))
        .field(FieldDef::new(
            "arr",
            FieldType::Array(Box::new(FieldType::String)),
        ))
        .field(FieldDef::new(
            "arr2",
            FieldType::Array(Box::new(FieldType::String)),
        ))
}

#[tokio::test]
async fn test_basic_session_isolation() {
    let client = Client::in_memory();
    let customers = client.model("customers", customer_schema());

    let session = client.start_session();
    session.start_transaction().unwrap();

    customers
        .create_with(json!({"name": "Test"}), OpOptions::with_session(&session))
        .await
        .unwrap();

    // Transactions execute in isolation: without the session the write is
    // invisible until commit.
    let outside = customers
        .find_one(Filter::new().eq("name", "Test"))
        .await
        .unwrap();
    assert!(outside.is_none());

    let inside = customers
        .find_one(Filter::new().eq("name", "Test"))
        .session(&session)
        .await
        .unwrap();
    assert!(inside.is_some());

    session.commit_transaction().await.unwrap();
    let committed = customers
        .find_one(Filter::new().eq("name", "Test"))
        .await
        .unwrap();
    assert!(committed.is_some());

    session.end_session().await.unwrap();
}

#[tokio::test]
async fn test_abort_discards_transaction_writes() {
    let client = Client::in_memory();
    let customers = client.model("customers", customer_schema());

    let session = client.start_session();
    session.start_transaction().unwrap();

    let first = customers
        .create_with(json!({"name": "Test"}), OpOptions::with_session(&session))
        .await
        .unwrap();
    customers
        .create_with(json!({"name": "Test2"}), OpOptions::with_session(&session))
        .await
        .unwrap();
    assert!(!first.is_new());

    session.abort_transaction().await.unwrap();
    assert_eq!(session.transaction_state(), TransactionState::Aborted);

    assert_eq!(
        customers.count_documents(Filter::new()).await.unwrap(),
        0
    );
    // The handle knows its insert never became durable.
    assert!(first.is_new());

    session.end_session().await.unwrap();
}

#[tokio::test]
async fn test_save_rides_documents_bound_session() {
    let client = Client::in_memory();
    let users = client.model("users", customer_schema());

    let session = client.start_session();
    session
        .with_transaction(|session| {
            let users = users.clone();
            Box::pin(async move {
                users
                    .create_with(json!({"name": "foo"}), OpOptions::with_session(session))
                    .await?;

                let user = users
                    .find_one(Filter::new().eq("name", "foo"))
                    .session(session)
                    .await?
                    .expect("visible inside transaction");
                // Documents fetched under a session come back bound to it.
                assert!(user.session().is_some());

                user.set("name", "bar")?;
                // No explicit session: save uses the bound one.
                user.save().await?;

                let outside = users.find_one(Filter::new().eq("name", "bar")).await?;
                assert!(outside.is_none());
                Ok(())
            })
        })
        .await
        .unwrap();
    session.end_session().await.unwrap();

    let committed = users
        .find_one(Filter::new().eq("name", "bar"))
        .await
        .unwrap();
    assert!(committed.is_some());
}

#[tokio::test]
async fn test_is_new_reverts_after_aborted_transaction() {
    let client = Client::in_memory();
    let tests = client.model("tests", customer_schema());

    let doc = tests.new_document(json!({"name": "foo"})).unwrap();
    let err = client
        .transaction::<(), _>(|session| {
            let doc = doc.clone();
            Box::pin(async move {
                doc.save_with(OpOptions::with_session(session)).await?;
                assert!(!doc.is_new());
                Err(OdmError::External(anyhow::anyhow!("Oops")))
            })
        })
        .await
        .unwrap_err();

    assert!(err.to_string().contains("Oops"));
    assert!(doc.is_new());
    assert!(tests
        .find_by_id(doc.id().to_string())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_changes_survive_abort_and_resave_applies_them() {
    let client = Client::in_memory();
    let tests = client.model("tests", customer_schema());

    tests
        .create(json!({"name": "foo", "arr": ["bar"], "arr2": ["foo"]}))
        .await
        .unwrap();
    let doc = tests
        .find_one(Filter::new().eq("name", "foo"))
        .await
        .unwrap()
        .unwrap();

    let err = client
        .transaction::<(), _>(|session| {
            let doc = doc.clone();
            Box::pin(async move {
                doc.pull("arr", "bar")?;
                doc.push("arr2", "bar")?;
                doc.set("name", "baz")?;
                doc.save_with(OpOptions::with_session(session)).await?;
                Err(OdmError::External(anyhow::anyhow!("Oops")))
            })
        })
        .await
        .unwrap_err();
    assert!(err.to_string().contains("Oops"));

    // The aborted save's changes are pending again.
    let changes = doc.changes();
    assert_eq!(changes.get(Operator::Set, "name"), Some(&json!("baz")));
    assert_eq!(
        changes.get(Operator::PullAll, "arr"),
        Some(&json!(["bar"]))
    );
    assert_eq!(
        changes.get(Operator::Push, "arr2"),
        Some(&json!({"$each": ["bar"]}))
    );
    assert!(changes.get(Operator::Set, "arr2").is_none());

    // Re-saving outside any transaction applies them for real.
    doc.save_with(OpOptions::sessionless()).await.unwrap();

    let fresh = tests
        .find_by_id(doc.id().to_string())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(fresh.get("name"), Some(json!("baz")));
    assert_eq!(fresh.get("arr"), Some(json!([])));
    assert_eq!(fresh.get("arr2"), Some(json!(["foo", "bar"])));
}

#[tokio::test]
async fn test_save_after_ended_session_degrades_gracefully() {
    let client = Client::in_memory();
    let tests = client.model("tests", customer_schema());

    let doc = tests.new_document(json!({"arr": ["foo"]})).unwrap();
    let session = client.start_session();
    doc.set_session(Some(&session));
    session.end_session().await.unwrap();

    // No error: the save falls back to session-less execution.
    doc.save().await.unwrap();
    assert!(!doc.is_new());
    assert_eq!(tests.count_documents(Filter::new()).await.unwrap(), 1);
}

#[tokio::test]
async fn test_delete_under_transaction_stages_until_commit() {
    let client = Client::in_memory();
    let characters = client.model("characters", customer_schema());

    let session = client.start_session();
    session.start_transaction().unwrap();

    characters
        .insert_many(
            vec![
                json!({"name": "Tyrion", "house": "Lannister"}),
                json!({"name": "Cersei", "house": "Lannister"}),
                json!({"name": "Jon", "house": "Stark"}),
                json!({"name": "Daenerys", "house": "Targaryen"}),
            ],
            OpOptions::with_session(&session),
        )
        .await
        .unwrap();

    characters
        .delete_many(
            Filter::new().eq("house", "Lannister"),
            OpOptions::with_session(&session),
        )
        .await
        .unwrap();
    characters
        .delete_one(
            Filter::new().eq("name", "Jon"),
            OpOptions::with_session(&session),
        )
        .await
        .unwrap();

    let remaining = characters
        .find(Filter::new())
        .session(&session)
        .await
        .unwrap();
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].get("name"), Some(json!("Daenerys")));

    session.commit_transaction().await.unwrap();
    session.end_session().await.unwrap();

    assert_eq!(
        characters.count_documents(Filter::new()).await.unwrap(),
        1
    );
}

#[tokio::test]
async fn test_write_conflict_between_sessions_is_transient() {
    let client = Client::in_memory();
    let users = client.model("users", customer_schema());
    let user = users.create(json!({"name": "a"})).await.unwrap();
    let id = user.id().to_string();

    let s1 = client.start_session();
    let s2 = client.start_session();
    s1.start_transaction().unwrap();
    s2.start_transaction().unwrap();

    let first = users.find_by_id(&id).session(&s1).await.unwrap().unwrap();
    first.set("name", "from s1").unwrap();
    first.save().await.unwrap();

    let second = users.find_by_id(&id).session(&s2).await.unwrap().unwrap();
    second.set("name", "from s2").unwrap();
    let err = second.save().await.unwrap_err();
    assert!(err.is_transient());
    // Failed save keeps the changes pending.
    assert!(second.is_modified("name"));

    // Once the first writer aborts, the second can proceed.
    s1.abort_transaction().await.unwrap();
    second.save().await.unwrap();

    s2.commit_transaction().await.unwrap();
    s1.end_session().await.unwrap();
    s2.end_session().await.unwrap();

    let fresh = users.find_by_id(&id).await.unwrap().unwrap();
    assert_eq!(fresh.get("name"), Some(json!("from s2")));
}

// ============================================================================
// with_transaction retry semantics, driven by a failure-injecting store
// ============================================================================

/// Store wrapper that fails the first N update operations with a write
/// conflict, then delegates.
struct FlakyStore {
    inner: MemoryStore,
    failures_left: AtomicU32,
}

impl FlakyStore {
    fn new(failures: u32) -> Self {
        Self {
            inner: MemoryStore::new(),
            failures_left: AtomicU32::new(failures),
        }
    }
}

#[async_trait]
impl DocumentStore for FlakyStore {
    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<FieldMap>,
        session: Option<SessionToken>,
    ) -> Result<()> {
        self.inner.insert_many(collection, docs, session).await
    }

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
        session: Option<SessionToken>,
    ) -> Result<Vec<FieldMap>> {
        self.inner.find(collection, filter, options, session).await
    }

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateBatch,
        session: Option<SessionToken>,
    ) -> Result<UpdateOutcome> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(OdmError::WriteConflict("injected conflict".into()));
        }
        self.inner
            .update_one(collection, filter, update, session)
            .await
    }

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateBatch,
        session: Option<SessionToken>,
    ) -> Result<UpdateOutcome> {
        self.inner
            .update_many(collection, filter, update, session)
            .await
    }

    async fn delete_one(
        &self,
        collection: &str,
        filter: &Filter,
        session: Option<SessionToken>,
    ) -> Result<u64> {
        self.inner.delete_one(collection, filter, session).await
    }

    async fn delete_many(
        &self,
        collection: &str,
        filter: &Filter,
        session: Option<SessionToken>,
    ) -> Result<u64> {
        self.inner.delete_many(collection, filter, session).await
    }

    async fn commit_transaction(&self, session: SessionToken) -> Result<()> {
        self.inner.commit_transaction(session).await
    }

    async fn abort_transaction(&self, session: SessionToken) -> Result<()> {
        self.inner.abort_transaction(session).await
    }

    async fn end_session(&self, session: SessionId) -> Result<()> {
        self.inner.end_session(session).await
    }
}

#[tokio::test]
async fn test_with_transaction_retries_transient_errors() {
    let client = Client::with_store(Arc::new(FlakyStore::new(2)));
    let users = client.model("users", customer_schema());
    let user = users.create(json!({"name": "a"})).await.unwrap();

    let attempts = Arc::new(AtomicU32::new(0));
    let result: Document = client
        .transaction(|session| {
            let user = user.clone();
            let attempts = attempts.clone();
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                user.set("name", "b")?;
                user.save_with(OpOptions::with_session(session)).await?;
                Ok(user)
            })
        })
        .await
        .unwrap();

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(result.get("name"), Some(json!("b")));
    assert_eq!(
        users
            .find_by_id(user.id().to_string())
            .await
            .unwrap()
            .unwrap()
            .get("name"),
        Some(json!("b"))
    );
}

#[tokio::test]
async fn test_with_transaction_does_not_retry_validation_errors() {
    let client = Client::in_memory();
    let _users = client.model("users", customer_schema());

    let attempts = Arc::new(AtomicU32::new(0));
    let err = client
        .transaction::<(), _>(|_session| {
            let attempts = attempts.clone();
            Box::pin(async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(OdmError::Validation("bad input".into()))
            })
        })
        .await
        .unwrap_err();

    assert!(matches!(err, OdmError::Validation(_)));
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_with_transaction_gives_up_after_bounded_retries() {
    // More injected conflicts than the retry bound allows.
    let client = Client::with_store(Arc::new(FlakyStore::new(10)));
    let users = client.model("users", customer_schema());
    let user = users.create(json!({"name": "a"})).await.unwrap();

    let err = client
        .transaction::<(), _>(|session| {
            let user = user.clone();
            Box::pin(async move {
                user.set("name", "b")?;
                user.save_with(OpOptions::with_session(session)).await?;
                Ok(())
            })
        })
        .await
        .unwrap_err();

    assert!(err.is_transient());
}
