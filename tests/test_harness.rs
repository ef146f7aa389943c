//! Shared fakes for the job store and blob store.
//!
//! Each integration test file pulls this in with `mod test_harness;`, so not
//! every helper is used by every file.
#![allow(dead_code)]

use std::collections::VecDeque;
use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use codeimport_worker::error::{ImportError, Result};
use codeimport_worker::store::{BlobStore, ImportArguments, JobStore};
use codeimport_worker::worker::ResultKind;

/// How the fake answers a fetch of import arguments.
#[derive(Debug, Clone)]
pub enum ImportData {
    Ready(ImportArguments),
    Vanished,
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FinishCall {
    pub job_id: Uuid,
    pub result: ResultKind,
    pub log_url: String,
}

/// In-process job store. Jobs handed out by `get_job_for_machine` come from
/// a queue; every job shares the same import data.
pub struct FakeJobStore {
    pub ready: Mutex<VecDeque<Uuid>>,
    pub import_data: ImportData,
    /// Heartbeats fail with JobVanished after this many succeed
    pub vanish_after_heartbeats: Option<usize>,
    pub vanish_on_finish: bool,
    pub heartbeats: Mutex<Vec<(Uuid, String)>>,
    pub finished: Mutex<Vec<FinishCall>>,
    pub claims: Mutex<Vec<(String, usize)>>,
}

impl FakeJobStore {
    pub fn new(import_data: ImportData) -> Self {
        Self {
            ready: Mutex::new(VecDeque::new()),
            import_data,
            vanish_after_heartbeats: None,
            vanish_on_finish: false,
            heartbeats: Mutex::new(Vec::new()),
            finished: Mutex::new(Vec::new()),
            claims: Mutex::new(Vec::new()),
        }
    }

    pub fn with_ready_jobs(self, jobs: impl IntoIterator<Item = Uuid>) -> Self {
        self.ready.lock().unwrap().extend(jobs);
        self
    }

    pub fn finished(&self) -> Vec<FinishCall> {
        self.finished.lock().unwrap().clone()
    }

    pub fn heartbeat_count(&self) -> usize {
        self.heartbeats.lock().unwrap().len()
    }
}

#[async_trait]
impl JobStore for FakeJobStore {
    async fn get_job_for_machine(
        &self,
        hostname: &str,
        worker_limit: usize,
    ) -> Result<Option<Uuid>> {
        self.claims
            .lock()
            .unwrap()
            .push((hostname.to_string(), worker_limit));
        Ok(self.ready.lock().unwrap().pop_front())
    }

    async fn get_import_data(&self, job_id: Uuid) -> Result<ImportArguments> {
        match &self.import_data {
            ImportData::Ready(args) => Ok(args.clone()),
            ImportData::Vanished => Err(ImportError::JobVanished(job_id)),
            ImportData::Unavailable => Err(ImportError::JobStore("store is down".to_string())),
        }
    }

    async fn update_heartbeat(&self, job_id: Uuid, tail: &str) -> Result<()> {
        let mut heartbeats = self.heartbeats.lock().unwrap();
        if let Some(limit) = self.vanish_after_heartbeats {
            if heartbeats.len() >= limit {
                return Err(ImportError::JobVanished(job_id));
            }
        }
        heartbeats.push((job_id, tail.to_string()));
        Ok(())
    }

    async fn finish_job(&self, job_id: Uuid, result: ResultKind, log_url: &str) -> Result<()> {
        if self.vanish_on_finish {
            return Err(ImportError::JobVanished(job_id));
        }
        self.finished.lock().unwrap().push(FinishCall {
            job_id,
            result,
            log_url: log_url.to_string(),
        });
        Ok(())
    }
}

#[derive(Debug, Clone)]
pub struct Upload {
    pub name: String,
    pub size: usize,
    pub content: Vec<u8>,
    pub content_type: String,
}

#[derive(Default)]
pub struct FakeBlobStore {
    pub fail: bool,
    pub uploads: Mutex<Vec<Upload>>,
}

impl FakeBlobStore {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn uploads(&self) -> Vec<Upload> {
        self.uploads.lock().unwrap().clone()
    }
}

#[async_trait]
impl BlobStore for FakeBlobStore {
    async fn upload(
        &self,
        name: &str,
        size: usize,
        content: Vec<u8>,
        content_type: &str,
    ) -> Result<String> {
        if self.fail {
            return Err(ImportError::BlobStore("bucket unavailable".to_string()));
        }
        self.uploads.lock().unwrap().push(Upload {
            name: name.to_string(),
            size,
            content,
            content_type: content_type.to_string(),
        });
        Ok(format!("https://logs.example.com/{name}"))
    }
}

/// Import arguments whose worker is `sh -c <script>`.
pub fn shell_job(script: &str, log_file_name: &str) -> ImportArguments {
    ImportArguments {
        arguments: vec![script.to_string()],
        destination_ref: "-c".to_string(),
        log_file_name: log_file_name.to_string(),
    }
}

/// Poll `condition` until it holds or `timeout_duration` passes.
pub async fn wait_for<F, Fut>(
    condition: F,
    timeout_duration: Duration,
    poll_interval: Duration,
) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout_duration {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}

/// Assert a condition eventually becomes true
pub async fn assert_eventually<F, Fut>(condition: F, timeout_duration: Duration, message: &str)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let result = wait_for(condition, timeout_duration, Duration::from_millis(20)).await;
    assert!(result, "{}", message);
}
