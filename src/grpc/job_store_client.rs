use async_trait::async_trait;
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};
use uuid::Uuid;

use crate::error::{ImportError, Result};
use crate::proto::job_store_service_client::JobStoreServiceClient;
use crate::proto::{
    FinishJobRequest, GetImportDataRequest, GetJobForMachineRequest, UpdateHeartbeatRequest,
};
use crate::store::{ImportArguments, JobStore};
use crate::worker::outcome::ResultKind;

/// [`JobStore`] backed by the remote job store's gRPC service.
#[derive(Debug, Clone)]
pub struct GrpcJobStore {
    client: JobStoreServiceClient<Channel>,
}

impl GrpcJobStore {
    pub fn new(channel: Channel) -> Self {
        Self {
            client: JobStoreServiceClient::new(channel),
        }
    }

    pub async fn connect(addr: &str) -> Result<Self> {
        let endpoint = Endpoint::from_shared(addr.to_string())
            .map_err(|e| ImportError::JobStore(format!("Invalid endpoint {addr}: {e}")))?;
        let channel = endpoint.connect().await?;
        tracing::info!(addr, "Connected to job store");
        Ok(Self::new(channel))
    }
}

/// NOT_FOUND on a job-scoped call means the job vanished.
fn job_error(job_id: Uuid, status: Status) -> ImportError {
    if status.code() == Code::NotFound {
        ImportError::JobVanished(job_id)
    } else {
        ImportError::GrpcError(status)
    }
}

#[async_trait]
impl JobStore for GrpcJobStore {
    async fn get_job_for_machine(
        &self,
        hostname: &str,
        worker_limit: usize,
    ) -> Result<Option<Uuid>> {
        let mut client = self.client.clone();
        let response = client
            .get_job_for_machine(GetJobForMachineRequest {
                hostname: hostname.to_string(),
                worker_limit: u32::try_from(worker_limit).unwrap_or(u32::MAX),
            })
            .await?
            .into_inner();

        if response.job_id.is_empty() {
            return Ok(None);
        }
        let job_id = Uuid::parse_str(&response.job_id).map_err(|_| {
            ImportError::JobStore(format!("Invalid job ID from job store: {}", response.job_id))
        })?;
        Ok(Some(job_id))
    }

    async fn get_import_data(&self, job_id: Uuid) -> Result<ImportArguments> {
        let mut client = self.client.clone();
        let response = client
            .get_import_data_for_job_id(GetImportDataRequest {
                job_id: job_id.to_string(),
            })
            .await
            .map_err(|s| job_error(job_id, s))?
            .into_inner();

        Ok(ImportArguments {
            arguments: response.arguments,
            destination_ref: response.destination_ref,
            log_file_name: response.log_file_name,
        })
    }

    async fn update_heartbeat(&self, job_id: Uuid, tail: &str) -> Result<()> {
        let mut client = self.client.clone();
        client
            .update_heartbeat(UpdateHeartbeatRequest {
                job_id: job_id.to_string(),
                tail: tail.to_string(),
            })
            .await
            .map_err(|s| job_error(job_id, s))?;
        Ok(())
    }

    async fn finish_job(&self, job_id: Uuid, result: ResultKind, log_url: &str) -> Result<()> {
        let mut client = self.client.clone();
        client
            .finish_job_id(FinishJobRequest {
                job_id: job_id.to_string(),
                result_kind: result.as_str().to_string(),
                log_url: log_url.to_string(),
            })
            .await
            .map_err(|s| job_error(job_id, s))?;
        Ok(())
    }
}
