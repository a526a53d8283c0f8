//! Storage collaborator seam.
//!
//! The engine never talks to a concrete database; it talks to this trait.
//! A production backend would adapt a driver's wire protocol; the crate
//! ships [`MemoryStore`](super::memory::MemoryStore) for embedded use and
//! for exercising session semantics in tests.

use async_trait::async_trait;

use crate::core::path::FieldMap;
use crate::core::Result;
use crate::query::filter::{Filter, FindOptions};
use crate::session::{SessionId, SessionToken};
use crate::tracking::UpdateBatch;

/// Result of an update operation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateOutcome {
    /// Documents matched by the filter.
    pub matched: u64,
    /// Documents actually modified.
    pub modified: u64,
}

/// Operation set consumed from the storage/transport collaborator.
///
/// Every operation is parameterized by an optional [`SessionToken`]; a
/// token with an active transaction scopes the operation's visibility to
/// that transaction.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    async fn insert_many(
        &self,
        collection: &str,
        docs: Vec<FieldMap>,
        session: Option<SessionToken>,
    ) -> Result<()>;

    async fn find(
        &self,
        collection: &str,
        filter: &Filter,
        options: &FindOptions,
        session: Option<SessionToken>,
    ) -> Result<Vec<FieldMap>>;

    async fn update_one(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateBatch,
        session: Option<SessionToken>,
    ) -> Result<UpdateOutcome>;

    async fn update_many(
        &self,
        collection: &str,
        filter: &Filter,
        update: &UpdateBatch,
        session: Option<SessionToken>,
    ) -> Result<UpdateOutcome>;

    async fn delete_one(
        &self,
        collection: &str,
        filter: &Filter,
        session: Option<SessionToken>,
    ) -> Result<u64>;

    async fn delete_many(
        &self,
        collection: &str,
        filter: &Filter,
        session: Option<SessionToken>,
    ) -> Result<u64>;

    /// Make the transaction staged under `session` durable.
    async fn commit_transaction(&self, session: SessionToken) -> Result<()>;

    /// Discard the transaction staged under `session`.
    async fn abort_transaction(&self, session: SessionToken) -> Result<()>;

    /// Release any server-side state held for `session`.
    async fn end_session(&self, session: SessionId) -> Result<()>;
}
