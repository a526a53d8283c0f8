//! Deferred query builder with a dual execution contract.
//!
//! A [`Query`] performs no I/O while it is being built. There are two ways
//! to run it:
//!
//! - [`Query::exec`] returns a [`QueryExecution`], a first-class future.
//! - Awaiting the query directly goes through its [`IntoFuture`]
//!   conversion, which triggers `exec()` internally.
//!
//! The two are deliberately not the same thing: `Query` is only
//! convertible into a future (a thenable), never pollable itself, so APIs
//! that require a genuine future take `exec()`'s return value. Failures
//! from malformed filter values are deferred into the execution's failure
//! channel and carry the source location of the call that supplied the
//! value.

pub mod filter;

use std::future::{Future, IntoFuture};
use std::marker::PhantomData;
use std::pin::Pin;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use futures::FutureExt;

use crate::collection::{resolve_collection_session, Collection};
use crate::core::Result;
use crate::document::{Document, SessionSpec};
use crate::session::Session;

pub use filter::{Filter, FindOptions};

/// Shape a query execution materializes into.
pub trait QueryOutput: Send + Sized + 'static {
    /// Implicit limit this shape imposes on the fetch.
    fn limit_hint() -> Option<usize> {
        None
    }

    fn from_documents(docs: Vec<Document>) -> Self;
}

impl QueryOutput for Vec<Document> {
    fn from_documents(docs: Vec<Document>) -> Self {
        docs
    }
}

impl QueryOutput for Option<Document> {
    fn limit_hint() -> Option<usize> {
        Some(1)
    }

    fn from_documents(docs: Vec<Document>) -> Self {
        docs.into_iter().next()
    }
}

/// Deferred find operation against one collection.
#[must_use = "a query does nothing until exec() is called or it is awaited"]
pub struct Query<T = Vec<Document>> {
    collection: Collection,
    filter: Result<Filter>,
    options: FindOptions,
    session: SessionSpec,
    populate: Vec<String>,
    _output: PhantomData<fn() -> T>,
}

impl<T: QueryOutput> Query<T> {
    pub(crate) fn new(collection: Collection, filter: Result<Filter>) -> Self {
        Query {
            collection,
            filter,
            options: FindOptions::new(),
            session: SessionSpec::Inherit,
            populate: Vec::new(),
            _output: PhantomData,
        }
    }

    /// Bind a session; the read observes that session's transaction.
    ///
    /// Must be called before execution starts. Binding has no effect on an
    /// operation already in flight.
    pub fn session(mut self, session: &Session) -> Self {
        self.session = SessionSpec::Use(session.clone());
        self
    }

    /// Force session-less execution.
    pub fn no_session(mut self) -> Self {
        self.session = SessionSpec::None;
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.options.limit = Some(limit);
        self
    }

    pub fn projection<I, S>(mut self, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.options.projection = Some(fields.into_iter().map(Into::into).collect());
        self
    }

    /// Populate a referenced path on every returned document. The lookup
    /// runs under the returned documents' bound session, which is this
    /// query's session.
    pub fn populate(mut self, field_path: impl Into<String>) -> Self {
        self.populate.push(field_path.into());
        self
    }

    /// Start execution and hand back a first-class awaitable.
    pub fn exec(self) -> QueryExecution<T> {
        let Query {
            collection,
            filter,
            mut options,
            session,
            populate,
            ..
        } = self;

        if let Some(hint) = T::limit_hint() {
            options.limit = Some(options.limit.map_or(hint, |l| l.min(hint)));
        }

        let future = async move {
            let filter = filter?;
            let session = resolve_collection_session(&session);
            let docs = collection
                .run_query(filter, options, session, populate)
                .await?;
            Ok(T::from_documents(docs))
        }
        .boxed();

        QueryExecution { future }
    }
}

impl<T: QueryOutput> IntoFuture for Query<T> {
    type Output = Result<T>;
    type IntoFuture = QueryExecution<T>;

    /// The continuation-registration half of the dual contract: awaiting a
    /// query converts it by triggering `exec()`.
    fn into_future(self) -> QueryExecution<T> {
        self.exec()
    }
}

/// An in-flight query: the execution-independent awaitable returned by
/// [`Query::exec`].
#[must_use = "futures do nothing unless awaited"]
pub struct QueryExecution<T> {
    future: BoxFuture<'static, Result<T>>,
}

impl<T> Future for QueryExecution<T> {
    type Output = Result<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.get_mut().future.as_mut().poll(cx)
    }
}
