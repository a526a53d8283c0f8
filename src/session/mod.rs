// ============================================================================
// Session and Transaction Lifecycle
// ============================================================================
//
// Implements the State Pattern for the session's transaction lifecycle:
//
//   NoTransaction ──start──> InProgress ──commit──> Committed
//                                │
//                                └──abort──> Aborted
//   (any state) ──end──> Ended
//
// Committed and Aborted allow a fresh start_transaction on the same
// session; Ended is terminal. Documents and queries hold non-owning
// references to a session and degrade to session-less execution once it
// has ended.
//
// ============================================================================

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use futures::future::BoxFuture;

use crate::core::{OdmError, Result};
use crate::store::backend::DocumentStore;

/// Global session ID counter.
static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque session handle identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(pub u64);

impl SessionId {
    fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "session_{}", self.0)
    }
}

/// Identity of one transaction attempt within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TxnId {
    pub session: SessionId,
    pub seq: u64,
}

/// Visibility of uncommitted writes from this session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReadIsolation {
    /// Writes staged in this session's transaction are visible to reads on
    /// the same session and invisible to other sessions until commit.
    #[default]
    SessionLocal,
    /// Reads observe only committed state, even on the writing session.
    CommittedOnly,
}

/// What an operation hands to the store to ride a session.
#[derive(Debug, Clone, Copy)]
pub struct SessionToken {
    pub id: SessionId,
    /// Present while a transaction is in progress; its value is the
    /// transaction sequence number within the session.
    pub txn: Option<u64>,
    pub isolation: ReadIsolation,
}

/// Transaction state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    NoTransaction,
    InProgress,
    Committed,
    Aborted,
    Ended,
}

impl TransactionState {
    pub fn is_in_progress(&self) -> bool {
        matches!(self, TransactionState::InProgress)
    }

    pub fn is_ended(&self) -> bool {
        matches!(self, TransactionState::Ended)
    }

    /// States from which a new transaction may start.
    pub fn can_start(&self) -> bool {
        matches!(
            self,
            TransactionState::NoTransaction
                | TransactionState::Committed
                | TransactionState::Aborted
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::NoTransaction => write!(f, "NO_TRANSACTION"),
            TransactionState::InProgress => write!(f, "IN_PROGRESS"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
            TransactionState::Ended => write!(f, "ENDED"),
        }
    }
}

/// Observer registered by a document that checkpointed itself for the
/// session's current transaction.
pub(crate) trait TxnParticipant: Send + Sync {
    /// The transaction became durable; the checkpoint is obsolete.
    fn on_commit(&self, txn: TxnId);
    /// The transaction rolled back; restore the checkpointed state.
    fn on_abort(&self, txn: TxnId);
}

pub(crate) struct SessionInner {
    id: SessionId,
    store: Arc<dyn DocumentStore>,
    state: Mutex<TransactionState>,
    txn_seq: AtomicU64,
    participants: Mutex<Vec<Weak<dyn TxnParticipant>>>,
    isolation: ReadIsolation,
    max_retries: u32,
}

impl SessionInner {
    pub(crate) fn state(&self) -> TransactionState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Token for an operation riding this session, or `None` once the
    /// session has ended (session-less fallback, never an error).
    pub(crate) fn token(&self) -> Option<SessionToken> {
        let state = self.state();
        if state.is_ended() {
            return None;
        }
        Some(SessionToken {
            id: self.id,
            txn: state
                .is_in_progress()
                .then(|| self.txn_seq.load(Ordering::SeqCst)),
            isolation: self.isolation,
        })
    }

    pub(crate) fn current_txn(&self) -> Option<TxnId> {
        self.state().is_in_progress().then(|| TxnId {
            session: self.id,
            seq: self.txn_seq.load(Ordering::SeqCst),
        })
    }

    pub(crate) fn register_participant(&self, participant: Weak<dyn TxnParticipant>) {
        self.participants
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(participant);
    }

    fn drain_participants(&self) -> Vec<Weak<dyn TxnParticipant>> {
        std::mem::take(&mut *self.participants.lock().unwrap_or_else(|e| e.into_inner()))
    }
}

/// Handle to a transaction session.
///
/// Cloning shares the underlying session. The session is owned by the
/// client that started it; documents and queries keep weak references and
/// never drive the lifecycle themselves.
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl Session {
    pub(crate) fn create(
        store: Arc<dyn DocumentStore>,
        isolation: ReadIsolation,
        max_retries: u32,
    ) -> Self {
        Session {
            inner: Arc::new(SessionInner {
                id: SessionId::next(),
                store,
                state: Mutex::new(TransactionState::NoTransaction),
                txn_seq: AtomicU64::new(0),
                participants: Mutex::new(Vec::new()),
                isolation,
                max_retries,
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<SessionInner>) -> Self {
        Session { inner }
    }

    pub fn id(&self) -> SessionId {
        self.inner.id
    }

    pub fn transaction_state(&self) -> TransactionState {
        self.inner.state()
    }

    pub fn read_isolation(&self) -> ReadIsolation {
        self.inner.isolation
    }

    pub(crate) fn inner(&self) -> &Arc<SessionInner> {
        &self.inner
    }

    pub(crate) fn token(&self) -> Option<SessionToken> {
        self.inner.token()
    }

    /// Begin a transaction on this session.
    ///
    /// # Errors
    /// Fails if a transaction is already in progress or the session ended.
    pub fn start_transaction(&self) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap_or_else(|e| e.into_inner());
        if !state.can_start() {
            return Err(OdmError::Transaction(format!(
                "cannot start transaction: {} is {}",
                self.inner.id, *state
            )));
        }
        self.inner.txn_seq.fetch_add(1, Ordering::SeqCst);
        *state = TransactionState::InProgress;
        Ok(())
    }

    /// Commit the in-progress transaction.
    ///
    /// Store failures propagate as-is and leave the transaction in
    /// progress, so the caller may retry the commit or abort.
    pub async fn commit_transaction(&self) -> Result<()> {
        let token = self.require_in_progress("commit")?;
        self.inner.store.commit_transaction(token).await?;

        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) =
            TransactionState::Committed;
        let txn = TxnId {
            session: self.inner.id,
            seq: token.txn.unwrap_or_default(),
        };
        for participant in self.inner.drain_participants() {
            if let Some(participant) = participant.upgrade() {
                participant.on_commit(txn);
            }
        }
        tracing::debug!(session = %self.inner.id, "transaction committed");
        Ok(())
    }

    /// Abort the in-progress transaction and roll back every checkpointed
    /// document to its pre-transaction state.
    ///
    /// A store-side abort failure is logged and does not prevent the local
    /// rollback; the local state must not stay dirty.
    pub async fn abort_transaction(&self) -> Result<()> {
        let token = self.require_in_progress("abort")?;
        if let Err(err) = self.inner.store.abort_transaction(token).await {
            tracing::warn!(session = %self.inner.id, error = %err, "store abort failed");
        }

        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) =
            TransactionState::Aborted;
        let txn = TxnId {
            session: self.inner.id,
            seq: token.txn.unwrap_or_default(),
        };
        for participant in self.inner.drain_participants() {
            if let Some(participant) = participant.upgrade() {
                participant.on_abort(txn);
            }
        }
        tracing::debug!(session = %self.inner.id, "transaction aborted");
        Ok(())
    }

    /// End the session. An in-progress transaction is aborted first.
    ///
    /// After this, operations on documents and queries still bound to the
    /// session silently run session-less.
    pub async fn end_session(&self) -> Result<()> {
        if self.inner.state().is_in_progress() {
            self.abort_transaction().await?;
        }
        *self.inner.state.lock().unwrap_or_else(|e| e.into_inner()) = TransactionState::Ended;
        if let Err(err) = self.inner.store.end_session(self.inner.id).await {
            tracing::warn!(session = %self.inner.id, error = %err, "store end_session failed");
        }
        Ok(())
    }

    /// Run `f` inside a transaction: commit on success, abort and rethrow
    /// on failure.
    ///
    /// Errors the store classifies as transient (write conflicts) restart
    /// the whole transaction a bounded number of times; everything else
    /// propagates immediately. The error from `f` stays primary even when
    /// the rollback itself fails; a commit failure surfaces only when `f`
    /// succeeded.
    pub async fn with_transaction<T, F>(&self, mut f: F) -> Result<T>
    where
        F: for<'a> FnMut(&'a Session) -> BoxFuture<'a, Result<T>>,
    {
        let max_retries = self.inner.max_retries;
        let mut attempt: u32 = 0;
        loop {
            attempt += 1;
            self.start_transaction()?;

            match f(self).await {
                Ok(value) => match self.commit_transaction().await {
                    Ok(()) => return Ok(value),
                    Err(err) if err.is_transient() && attempt <= max_retries => {
                        tracing::debug!(
                            session = %self.inner.id,
                            attempt,
                            error = %err,
                            "transient commit failure, retrying transaction"
                        );
                        let _ = self.abort_transaction().await;
                    }
                    Err(err) => {
                        let _ = self.abort_transaction().await;
                        return Err(err);
                    }
                },
                Err(err) => {
                    if let Err(abort_err) = self.abort_transaction().await {
                        tracing::warn!(
                            session = %self.inner.id,
                            error = %abort_err,
                            "rollback after failed transaction callback also failed"
                        );
                    }
                    if err.is_transient() && attempt <= max_retries {
                        tracing::debug!(
                            session = %self.inner.id,
                            attempt,
                            error = %err,
                            "transient transaction error, retrying"
                        );
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }

    fn require_in_progress(&self, operation: &str) -> Result<SessionToken> {
        let state = self.inner.state();
        if !state.is_in_progress() {
            return Err(OdmError::Transaction(format!(
                "cannot {} transaction: {} is {}",
                operation, self.inner.id, state
            )));
        }
        self.inner.token().ok_or_else(|| {
            OdmError::Transaction(format!("{} has ended", self.inner.id))
        })
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("state", &self.inner.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;

    fn session() -> Session {
        Session::create(Arc::new(MemoryStore::new()), ReadIsolation::default(), 3)
    }

    #[test]
    fn test_session_ids_are_unique() {
        let a = session();
        let b = session();
        assert_ne!(a.id(), b.id());
    }

    #[test]
    fn test_cannot_start_twice() {
        let s = session();
        s.start_transaction().unwrap();
        assert!(s.start_transaction().is_err());
    }

    #[tokio::test]
    async fn test_lifecycle_transitions() {
        let s = session();
        assert_eq!(s.transaction_state(), TransactionState::NoTransaction);

        s.start_transaction().unwrap();
        assert_eq!(s.transaction_state(), TransactionState::InProgress);

        s.commit_transaction().await.unwrap();
        assert_eq!(s.transaction_state(), TransactionState::Committed);

        // A committed session may start again.
        s.start_transaction().unwrap();
        s.abort_transaction().await.unwrap();
        assert_eq!(s.transaction_state(), TransactionState::Aborted);

        s.end_session().await.unwrap();
        assert_eq!(s.transaction_state(), TransactionState::Ended);
        assert!(s.start_transaction().is_err());
    }

    #[tokio::test]
    async fn test_commit_without_transaction_fails() {
        let s = session();
        assert!(s.commit_transaction().await.is_err());
        assert!(s.abort_transaction().await.is_err());
    }

    #[tokio::test]
    async fn test_token_degrades_after_end() {
        let s = session();
        s.start_transaction().unwrap();
        assert!(s.token().and_then(|t| t.txn).is_some());

        s.end_session().await.unwrap();
        assert!(s.token().is_none());
    }
}
