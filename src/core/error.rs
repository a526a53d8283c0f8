use std::panic::Location;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OdmError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Cast to {expected} failed for value `{value}` at path \"{path}\" on model \"{model}\" ({origin})")]
    Cast {
        expected: String,
        value: String,
        path: String,
        model: String,
        origin: String,
    },

    #[error("No document found for {operation} on \"{model}\" matching _id {id}")]
    NotFound {
        model: String,
        id: String,
        operation: &'static str,
    },

    #[error("Write conflict: {0}")]
    WriteConflict(String),

    #[error("Duplicate _id '{id}' in collection '{collection}'")]
    DuplicateKey { collection: String, id: String },

    #[error("No model registered for collection '{0}'")]
    MissingSchema(String),

    #[error("Transaction error: {0}")]
    Transaction(String),

    #[error("Store error: {0}")]
    Store(String),

    #[error(transparent)]
    External(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, OdmError>;

impl OdmError {
    /// Build a cast error anchored at the caller that supplied the value.
    ///
    /// The captured location is the one a user needs to see: where the
    /// offending value entered the builder, not where the future was polled.
    #[track_caller]
    pub fn cast(
        expected: impl Into<String>,
        value: impl std::fmt::Display,
        path: impl Into<String>,
        model: impl Into<String>,
    ) -> Self {
        Self::cast_at(expected, value, path, model, Location::caller())
    }

    /// Like [`OdmError::cast`] with an explicitly captured caller location,
    /// for builders that forward their own `#[track_caller]` anchor.
    pub fn cast_at(
        expected: impl Into<String>,
        value: impl std::fmt::Display,
        path: impl Into<String>,
        model: impl Into<String>,
        origin: &'static Location<'static>,
    ) -> Self {
        OdmError::Cast {
            expected: expected.into(),
            value: value.to_string(),
            path: path.into(),
            model: model.into(),
            origin: format!("{}:{}", origin.file(), origin.line()),
        }
    }

    pub fn not_found(
        model: impl Into<String>,
        id: impl std::fmt::Display,
        operation: &'static str,
    ) -> Self {
        OdmError::NotFound {
            model: model.into(),
            id: id.to_string(),
            operation,
        }
    }

    /// Whether the store classified this error as transient.
    ///
    /// Only transient errors are retried by `with_transaction`; everything
    /// else propagates to the caller immediately.
    pub fn is_transient(&self) -> bool {
        matches!(self, OdmError::WriteConflict(_))
    }
}
