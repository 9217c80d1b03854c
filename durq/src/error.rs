use deadpool_sqlite::InteractError;

use crate::JobId;

/// A [std::result::Result] whose error type defaults to [Error].
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can be returned from the queue.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An enqueue request had an empty job type.
    #[error("Job type must not be empty")]
    EmptyJobType,
    /// An enqueue request had a job type longer than the configured limit.
    #[error("Job type is {len} bytes, limit is {limit}")]
    JobTypeTooLong {
        /// The length of the rejected job type.
        len: usize,
        /// The configured limit.
        limit: usize,
    },
    /// An enqueue request had a payload larger than the configured limit.
    #[error("Payload is {size} bytes, limit is {limit}")]
    PayloadTooLarge {
        /// The size of the rejected payload.
        size: usize,
        /// The configured limit.
        limit: usize,
    },
    /// An error occurred while updating the database to a new schema version.
    #[error("Migration error: {0}")]
    Migration(#[from] rusqlite_migration::Error),
    /// An error occurred while opening the database.
    #[error("Error opening database: {0}")]
    OpenDatabase(eyre::Report),
    /// Failed to acquire a database connection for reading.
    #[error("Error acquiring database connection: {0}")]
    PoolError(#[from] deadpool_sqlite::PoolError),
    /// Encountered an error communicating with the database.
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),
    /// A batch of writes failed to commit, so none of its operations took effect.
    #[error("Failed to commit transaction: {0}")]
    CommitFailed(String),
    /// The database contained invalid data.
    #[error("Unexpected value type for {1}: {0}")]
    ColumnType(#[source] rusqlite::Error, &'static str),
    /// An internal task panicked.
    #[error("Internal error: {0}")]
    Panic(#[from] tokio::task::JoinError),
    /// An internal error occurred while reading the database.
    #[error("Internal error: {0}")]
    DbInteract(String),
    /// The job does not exist, or is not in the state the operation requires.
    #[error("Job not found")]
    NotFound,
    /// A job was not held by the given worker when it tried to finish it.
    #[error("Job {job_id} is not in progress under worker {worker_id}")]
    NotClaimed {
        /// The job the worker tried to finish.
        job_id: JobId,
        /// The worker that tried to finish it.
        worker_id: String,
    },
    /// A job had an unknown state value
    #[error("Invalid job state {0}")]
    InvalidJobState(String),
    /// Failed to serialize or deserialize a job payload
    #[error("Error processing payload: {0}")]
    PayloadError(serde_json::Error),
    /// Invalid value for a job timestamp
    #[error("Timestamp {0} out of range")]
    TimestampOutOfRange(&'static str),
    /// A job type was requested that has no registered handler.
    #[error("No handler registered for job type {0}")]
    UnregisteredJobType(String),
    /// Required configuration was missing at startup.
    #[error("Missing configuration: {0}")]
    MissingConfiguration(&'static str),
    /// The operation timed out. This is mostly used when the queue or a worker pool fails to shut
    /// down in a timely fashion.
    #[error("Timed out")]
    Timeout,
    /// Indicates that the queue has closed, and so the attempted operation could not be completed.
    #[error("Queue closed unexpectedly")]
    QueueClosed,
}

/// The broad category of an [Error], for callers that need to decide how to react to a failure
/// without matching on every variant.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ErrorKind {
    /// The request was malformed and never reached the store.
    Validation,
    /// The durable store could not be reached or written.
    StoreUnavailable,
    /// A job did not exist or was not in the state the operation expected.
    NotFound,
    /// Required configuration was missing, or a job type has no handler.
    Configuration,
    /// Corrupt data or a failure inside the queue itself.
    Internal,
}

impl Error {
    pub(crate) fn open_database(err: impl Into<eyre::Report>) -> Self {
        Error::OpenDatabase(err.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::EmptyJobType | Error::JobTypeTooLong { .. } | Error::PayloadTooLarge { .. } => {
                ErrorKind::Validation
            }
            Error::Migration(_)
            | Error::OpenDatabase(_)
            | Error::PoolError(_)
            | Error::Database(_)
            | Error::CommitFailed(_)
            | Error::DbInteract(_)
            | Error::QueueClosed => ErrorKind::StoreUnavailable,
            Error::NotFound | Error::NotClaimed { .. } => ErrorKind::NotFound,
            Error::UnregisteredJobType(_) | Error::MissingConfiguration(_) => {
                ErrorKind::Configuration
            }
            Error::ColumnType(..)
            | Error::Panic(_)
            | Error::InvalidJobState(_)
            | Error::PayloadError(_)
            | Error::TimestampOutOfRange(_)
            | Error::Timeout => ErrorKind::Internal,
        }
    }

    /// Returns true if the error came from the store being unreachable or unwritable.
    pub fn is_store_unavailable(&self) -> bool {
        self.kind() == ErrorKind::StoreUnavailable
    }
}

impl From<InteractError> for Error {
    fn from(e: InteractError) -> Self {
        Error::DbInteract(e.to_string())
    }
}
