use thiserror::Error;

/// The error taxonomy for the query execution core.
///
/// Every variant here is terminal: the `Query` that produced it
/// transitions to `Failed` and must still be `finalize()`d by the caller
/// (see `status::Status`). Buffer overflow is not an error at all -- it is
/// the one recoverable condition, and is surfaced as a `CopyResult`
/// (`sparse_read::CopyResult`) driving a transition to `Incomplete`
/// instead of an `Err`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("Subarray error: {0}")]
    Subarray(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Fragment metadata is inconsistent: {0}")]
    Consistency(String),

    #[error("Internal invariant breach: {0}")]
    Internal(String),

    #[error("Schema error: {0}")]
    Schema(#[from] tiledb_common::schema::Error),

    #[error("Layout error: {0}")]
    Layout(#[from] tiledb_common::layout::LayoutError),
}

pub type Result<T> = std::result::Result<T, Error>;
