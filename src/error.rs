use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum ImportError {
    /// The job store no longer knows this job. Never reported as a failure.
    #[error("Job vanished: {0}")]
    JobVanished(Uuid),

    #[error("Job store error: {0}")]
    JobStore(String),

    #[error("Blob store error: {0}")]
    BlobStore(String),

    #[error("Invalid machine transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Series {series_id} has status {status} with no job mapping")]
    UnmappedSeriesStatus { series_id: u64, status: String },

    #[error("Series {0} appears more than once")]
    DuplicateSeries(u64),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("gRPC error: {0}")]
    GrpcError(#[from] tonic::Status),

    #[error("Transport error: {0}")]
    TransportError(#[from] tonic::transport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ImportError {
    pub fn is_vanished(&self) -> bool {
        matches!(self, ImportError::JobVanished(_))
    }
}

pub type Result<T> = std::result::Result<T, ImportError>;
