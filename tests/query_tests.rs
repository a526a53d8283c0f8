/// Query executor tests
///
/// Deferred execution, the exec()/await dual contract, cast diagnostics on
/// malformed identifiers, session chaining and populate inheritance.
/// Run with: cargo test --test query_tests
use std::future::Future;
use std::sync::Arc;

use rustodm::{
    Client, Document, FieldDef, FieldType, Filter, MemoryStore, OdmError, OpOptions, Query,
    QueryExecution, Schema, SessionSpec,
};
use serde_json::json;

fn author_schema() -> Schema {
    Schema::new().field(FieldDef::new("name", FieldType::String))
}

fn article_schema() -> Schema {
    Schema::new()
        .field(FieldDef::new("title", FieldType::String))
        .field(FieldDef::new("author", FieldType::Ref("authors".into())))
}

fn client() -> (Client, Arc<MemoryStore>) {
    let store = Arc::new(MemoryStore::new());
    (Client::with_store(store.clone()), store)
}

#[tokio::test]
async fn test_query_builder_defers_io_until_awaited() {
    let (client, store) = client();
    let authors = client.model("authors", author_schema());
    authors.create(json!({"name": "Val"})).await.unwrap();
    let finds_before = store.stats().finds;

    let query = authors
        .find(Filter::new().eq("name", "Val"))
        .limit(10)
        .projection(["name"]);
    assert_eq!(store.stats().finds, finds_before);

    let found = query.await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(store.stats().finds, finds_before + 1);
}

#[tokio::test]
async fn test_exec_and_direct_await_are_distinct_kinds() {
    fn assert_is_future<F: Future>(future: F) -> F {
        future
    }

    let (client, _) = client();
    let authors = client.model("authors", author_schema());
    authors.create(json!({"name": "Val"})).await.unwrap();

    // exec() hands back the first-class awaitable type.
    let execution: QueryExecution<Vec<Document>> =
        authors.find(Filter::new()).exec();
    let via_exec = assert_is_future(execution).await.unwrap();

    // The query itself is only *convertible* into that type; holding it
    // does nothing until the conversion happens.
    let query: Query<Vec<Document>> = authors.find(Filter::new());
    let via_await = query.await.unwrap();

    assert_eq!(via_exec.len(), via_await.len());
}

#[tokio::test]
async fn test_malformed_id_fails_in_the_async_chain_with_cast_error() {
    let (client, store) = client();
    let authors = client.model("authors", author_schema());

    // Building the query does not fail and does not touch the store.
    let query = authors.find_by_id("not-a-valid-id");
    assert_eq!(store.stats().finds, 0);

    let err = query.await.unwrap_err();
    match err {
        OdmError::Cast {
            expected,
            value,
            path,
            model,
            origin,
        } => {
            assert_eq!(expected, "Id");
            assert_eq!(value, "not-a-valid-id");
            assert_eq!(path, "_id");
            assert_eq!(model, "authors");
            // Diagnostics are anchored where the bad value was supplied.
            assert!(origin.contains("query_tests.rs"));
        }
        other => panic!("expected Cast error, got {other:?}"),
    }
    assert_eq!(store.stats().finds, 0);
}

#[tokio::test]
async fn test_session_must_be_bound_before_execution() {
    let (client, _) = client();
    let authors = client.model("authors", author_schema());

    let session = client.start_session();
    session.start_transaction().unwrap();
    authors
        .create_with(json!({"name": "Val"}), OpOptions::with_session(&session))
        .await
        .unwrap();

    // Chained before execution, the session scopes the read.
    let seen = authors
        .find(Filter::new())
        .session(&session)
        .await
        .unwrap();
    assert_eq!(seen.len(), 1);

    // A builder without the session cannot observe the staged write, and
    // once exec() has been called there is no late binding: the builder is
    // consumed.
    let unseen = authors.find(Filter::new()).await.unwrap();
    assert!(unseen.is_empty());

    session.abort_transaction().await.unwrap();
    session.end_session().await.unwrap();
}

#[tokio::test]
async fn test_populate_uses_query_session() {
    let (client, _) = client();
    let authors = client.model("authors", author_schema());
    let articles = client.model("articles", article_schema());

    let session = client.start_session();
    session.start_transaction().unwrap();

    let author = authors
        .create_with(json!({"name": "Val"}), OpOptions::with_session(&session))
        .await
        .unwrap();
    let article = articles
        .create_with(
            json!({"title": "T", "author": author.id().to_string()}),
            OpOptions::with_session(&session),
        )
        .await
        .unwrap();

    let populated = articles
        .find_by_id(article.id().to_string())
        .session(&session)
        .populate("author")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(
        populated.get("author.name"),
        Some(json!("Val"))
    );

    session.commit_transaction().await.unwrap();
    session.end_session().await.unwrap();
}

#[tokio::test]
async fn test_document_populate_inherits_bound_session() {
    let (client, _) = client();
    let authors = client.model("authors", author_schema());
    let articles = client.model("articles", article_schema());

    let session = client.start_session();
    session.start_transaction().unwrap();

    let author = authors
        .create_with(json!({"name": "Val"}), OpOptions::with_session(&session))
        .await
        .unwrap();
    let article = articles
        .create_with(
            json!({"title": "T", "author": author.id().to_string()}),
            OpOptions::with_session(&session),
        )
        .await
        .unwrap();

    let fetched = articles
        .find_by_id(article.id().to_string())
        .session(&session)
        .await
        .unwrap()
        .unwrap();
    assert!(fetched.session().is_some());

    // By default the secondary lookup rides the document's session.
    fetched.populate("author").await.unwrap();
    assert_eq!(fetched.get("author.name"), Some(json!("Val")));

    session.commit_transaction().await.unwrap();
    session.end_session().await.unwrap();
}

#[tokio::test]
async fn test_populate_explicit_no_session_overrides_inheritance() {
    let (client, _) = client();
    let authors = client.model("authors", author_schema());
    let articles = client.model("articles", article_schema());

    let session = client.start_session();
    session.start_transaction().unwrap();

    let author = authors
        .create_with(json!({"name": "Val"}), OpOptions::with_session(&session))
        .await
        .unwrap();
    let article = articles
        .create_with(
            json!({"title": "T", "author": author.id().to_string()}),
            OpOptions::with_session(&session),
        )
        .await
        .unwrap();

    let fetched = articles
        .find_by_id(article.id().to_string())
        .session(&session)
        .await
        .unwrap()
        .unwrap();

    // The author only exists inside the transaction; a forced session-less
    // lookup cannot see it.
    fetched
        .populate_with("author", SessionSpec::None)
        .await
        .unwrap();
    assert_eq!(fetched.get("author"), Some(json!(null)));

    session.abort_transaction().await.unwrap();
    session.end_session().await.unwrap();
}

#[tokio::test]
async fn test_populate_rejects_non_reference_paths() {
    let (client, _) = client();
    let articles = client.model("articles", article_schema());
    let doc = articles.new_document(json!({"title": "T"})).unwrap();

    assert!(matches!(
        doc.populate("title").await,
        Err(OdmError::Validation(_))
    ));
}

#[tokio::test]
async fn test_projection_strips_fields_but_keeps_id() {
    let (client, _) = client();
    let authors = client.model(
        "authors",
        Schema::new()
            .field(FieldDef::new("name", FieldType::String))
            .field(FieldDef::new("bio", FieldType::String)),
    );
    authors
        .create(json!({"name": "Val", "bio": "long text"}))
        .await
        .unwrap();

    let found = authors
        .find(Filter::new())
        .projection(["name"])
        .await
        .unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].get("name"), Some(json!("Val")));
    assert_eq!(found[0].get("bio"), None);
    assert!(found[0].get("_id").is_some());
}

#[tokio::test]
async fn test_limit_bounds_result_set() {
    let (client, _) = client();
    let authors = client.model("authors", author_schema());
    for name in ["a", "b", "c", "d"] {
        authors.create(json!({"name": name})).await.unwrap();
    }

    let found = authors.find(Filter::new()).limit(2).await.unwrap();
    assert_eq!(found.len(), 2);
}
