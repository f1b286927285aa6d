// ---------------------------------------------------------------------------
// Error types
// ---------------------------------------------------------------------------

/// Every failure a transact batch or a query can surface.
///
/// Callers match on the variant. A content-address miss while parsing a
/// query pattern is deliberately absent: such a query simply has no results.
#[derive(Debug, thiserror::Error)]
pub enum FactlineError {
    #[error("storage error: {0}")]
    Storage(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    /// A pattern that is not a list, a binding that is not a flat map of
    /// literals, an empty batch, an out-of-range snapshot request.
    #[error("malformed input: {0}")]
    MalformedInput(String),
    /// A transact batch referenced an attribute the catalog does not define.
    #[error("Attribute not found: {0}")]
    AttributeNotFound(String),
    #[error("value {value} is not a valid {type_name}")]
    InvalidValueType { type_name: String, value: String },
    #[error("value in this query tuple is of an unknown type: {0}")]
    UnknownValueType(String),
    /// A value hash could not be tied to a single registered type.
    #[error("value type is ambiguous: {0}")]
    AmbiguousValueType(String),
    #[error("element {position} in tuple has invalid type: {reason}")]
    InvalidTupleElement { position: usize, reason: String },
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<redb::DatabaseError> for FactlineError {
    fn from(e: redb::DatabaseError) -> Self {
        FactlineError::Storage(e.to_string())
    }
}
impl From<redb::TransactionError> for FactlineError {
    fn from(e: redb::TransactionError) -> Self {
        FactlineError::Storage(e.to_string())
    }
}
impl From<redb::TableError> for FactlineError {
    fn from(e: redb::TableError) -> Self {
        FactlineError::Storage(e.to_string())
    }
}
impl From<redb::StorageError> for FactlineError {
    fn from(e: redb::StorageError) -> Self {
        FactlineError::Storage(e.to_string())
    }
}
impl From<redb::CommitError> for FactlineError {
    fn from(e: redb::CommitError) -> Self {
        FactlineError::Storage(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, FactlineError>;
