//! Contracts for the external services a worker machine talks to.
//!
//! - [`JobStore`]: the service of record for job assignment, heartbeats and
//!   completion. A job-scoped call on a job the store no longer knows fails
//!   with [`ImportError::JobVanished`](crate::error::ImportError::JobVanished).
//! - [`BlobStore`]: where finished run logs are uploaded.

pub mod blob;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;
use crate::worker::outcome::ResultKind;

pub use blob::FsBlobStore;

/// Everything the worker needs to run one import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportArguments {
    /// VCS connection arguments, opaque to the supervisor
    pub arguments: Vec<String>,
    pub destination_ref: String,
    pub log_file_name: String,
}

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Claim the next ready job for `hostname`, if any.
    async fn get_job_for_machine(&self, hostname: &str, worker_limit: usize)
        -> Result<Option<Uuid>>;

    async fn get_import_data(&self, job_id: Uuid) -> Result<ImportArguments>;

    async fn update_heartbeat(&self, job_id: Uuid, tail: &str) -> Result<()>;

    async fn finish_job(&self, job_id: Uuid, result: ResultKind, log_url: &str) -> Result<()>;
}

#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Store `content` under `name` and return a URL for it.
    async fn upload(
        &self,
        name: &str,
        size: usize,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<String>;
}
