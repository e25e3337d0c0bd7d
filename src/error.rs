use thiserror::Error;

use crate::common::{PageId, PageNo};
use crate::concurrency::TransactionId;

/// Failures a caller may want to tell apart. They are carried inside
/// `anyhow::Error`, so use `downcast_ref` (or the helpers below) to inspect them.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum DbError {
    #[error("Transaction {0} aborted to break a deadlock")]
    TransactionAborted(TransactionId),

    #[error("Page {page_id} does not exist, the table has only {num_pages} pages")]
    InvalidPage { page_id: PageId, num_pages: PageNo },

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Tuple does not match schema: {0}")]
    SchemaMismatch(String),

    #[error("All {0} buffers are either referenced or dirty")]
    BufferPoolFull(usize),
}

impl DbError {
    /// Returns true if the error, or any error it wraps, is a deadlock abort.
    pub fn is_transaction_aborted(error: &anyhow::Error) -> bool {
        matches!(
            error.downcast_ref::<DbError>(),
            Some(DbError::TransactionAborted(_))
        )
    }
}
