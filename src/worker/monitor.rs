use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::process::Command;
use uuid::Uuid;

use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::store::{BlobStore, ImportArguments, JobStore};
use crate::worker::outcome::{classify, ResultKind, Termination};
use crate::worker::protocol::{HeartbeatSink, SupervisorProtocol};

/// Log name used when the job store never told us one.
pub const DEFAULT_LOG_FILE_NAME: &str = "no-name-set.txt";

const LOG_CONTENT_TYPE: &str = "text/plain";

/// Record of one completed run, as reported to the job store.
#[derive(Debug, Clone, Serialize)]
pub struct ImportResult {
    pub job_id: Uuid,
    pub kind: ResultKind,
    pub exit_code: Option<i32>,
    /// Empty when there was no log or the upload failed
    pub log_url: String,
    pub date_started: DateTime<Utc>,
    pub date_finished: DateTime<Utc>,
}

#[derive(Debug)]
pub enum RunOutcome {
    Finished(ImportResult),
    /// The job store forgot the job mid-run; nothing was reported.
    Vanished,
}

/// Relays supervisor heartbeats to the job store.
struct JobHeartbeat {
    job_id: Uuid,
    job_store: Arc<dyn JobStore>,
}

#[async_trait]
impl HeartbeatSink for JobHeartbeat {
    async fn beat(&self, tail: String) -> Result<()> {
        self.job_store.update_heartbeat(self.job_id, &tail).await
    }
}

/// Runs exactly one import job from start to finish:
/// fetch arguments, launch and supervise the worker, upload the log, and
/// report the result.
pub struct WorkerMonitor {
    job_id: Uuid,
    config: SupervisorConfig,
    job_store: Arc<dyn JobStore>,
    blob_store: Arc<dyn BlobStore>,
}

impl WorkerMonitor {
    pub fn new(
        job_id: Uuid,
        config: SupervisorConfig,
        job_store: Arc<dyn JobStore>,
        blob_store: Arc<dyn BlobStore>,
    ) -> Self {
        Self {
            job_id,
            config,
            job_store,
            blob_store,
        }
    }

    pub fn job_id(&self) -> Uuid {
        self.job_id
    }

    /// Worker argv: configured fixed args, the destination, then the
    /// connection arguments exactly as the job store sent them.
    pub fn build_command(&self, args: &ImportArguments) -> Command {
        let mut command = Command::new(&self.config.worker_executable);
        command
            .args(&self.config.worker_args)
            .arg(&args.destination_ref)
            .args(&args.arguments);
        command
    }

    /// # Errors
    ///
    /// Returns an error only if the final report to the job store fails for
    /// a reason other than the job having vanished.
    pub async fn run(self) -> Result<RunOutcome> {
        let date_started = Utc::now();
        tracing::info!(job_id = %self.job_id, "Starting import job");

        let (termination, mut log, log_file_name) =
            match self.job_store.get_import_data(self.job_id).await {
                Ok(args) => {
                    let heartbeat = Arc::new(JobHeartbeat {
                        job_id: self.job_id,
                        job_store: Arc::clone(&self.job_store),
                    });
                    let protocol = SupervisorProtocol::from_config(&self.config, heartbeat);
                    tracing::info!(
                        job_id = %self.job_id,
                        destination = %args.destination_ref,
                        executable = %self.config.worker_executable.display(),
                        "Launching import worker"
                    );
                    match protocol.run(self.build_command(&args)).await {
                        Ok(run) => (run.termination, run.log, args.log_file_name),
                        Err(e) if e.is_vanished() => return Ok(self.vanished("heartbeat")),
                        Err(e) => (Termination::Aborted(e.to_string()), Vec::new(), args.log_file_name),
                    }
                }
                Err(e) if e.is_vanished() => return Ok(self.vanished("fetching arguments")),
                Err(e) => {
                    tracing::error!(job_id = %self.job_id, error = %e, "Failed to fetch import arguments");
                    (
                        Termination::Aborted(format!("failed to fetch import arguments: {e}")),
                        Vec::new(),
                        DEFAULT_LOG_FILE_NAME.to_string(),
                    )
                }
            };

        let kind = classify(&termination);
        if kind == ResultKind::Failure {
            if !log.is_empty() && !log.ends_with(b"\n") {
                log.push(b'\n');
            }
            log.extend_from_slice(format!("Import failed: worker {termination}\n").as_bytes());
        }

        let log_url = self.upload_log(&log_file_name, log).await;

        match self.job_store.finish_job(self.job_id, kind, &log_url).await {
            Ok(()) => {}
            Err(e) if e.is_vanished() => return Ok(self.vanished("finishing")),
            Err(e) => {
                tracing::error!(job_id = %self.job_id, error = %e, "Failed to report job result");
                return Err(e);
            }
        }

        tracing::info!(
            job_id = %self.job_id,
            result = %kind,
            termination = %termination,
            log_url = %log_url,
            "Import job finished"
        );

        Ok(RunOutcome::Finished(ImportResult {
            job_id: self.job_id,
            kind,
            exit_code: termination.exit_code(),
            log_url,
            date_started,
            date_finished: Utc::now(),
        }))
    }

    /// Upload the log, returning its URL or an empty string. Upload failures
    /// never block the finish report.
    async fn upload_log(&self, name: &str, log: Vec<u8>) -> String {
        if log.is_empty() {
            return String::new();
        }
        let size = log.len();
        match self
            .blob_store
            .upload(name, size, log, LOG_CONTENT_TYPE)
            .await
        {
            Ok(url) => url,
            Err(e) => {
                tracing::error!(
                    job_id = %self.job_id,
                    log_file_name = name,
                    size,
                    error = %e,
                    "Failed to upload job log"
                );
                String::new()
            }
        }
    }

    fn vanished(&self, stage: &str) -> RunOutcome {
        tracing::info!(job_id = %self.job_id, stage, "Job vanished, exiting quietly");
        RunOutcome::Vanished
    }
}
