use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::error::{ImportError, Result};
use crate::sync::{ImportJob, Series};

/// Storage for series (read-only) and import jobs.
#[async_trait]
pub trait ImportRepository: Send + Sync {
    /// Series whose status may own a job.
    async fn eligible_series(&self) -> Result<Vec<Series>>;

    async fn jobs(&self) -> Result<Vec<ImportJob>>;

    async fn create_job(&self, job: ImportJob) -> Result<()>;

    async fn update_job(&self, job: &ImportJob) -> Result<()>;

    async fn delete_job(&self, job_id: Uuid) -> Result<()>;
}

/// Serialized form of a repository, as read and written by the `sync` command.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SyncSnapshot {
    pub series: Vec<Series>,
    #[serde(default)]
    pub jobs: Vec<ImportJob>,
}

impl SyncSnapshot {
    pub async fn load(path: &Path) -> Result<Self> {
        let data = tokio::fs::read(path).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        let data = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(path, data).await?;
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryRepository {
    series: RwLock<Vec<Series>>,
    jobs: RwLock<HashMap<Uuid, ImportJob>>,
    writes: AtomicUsize,
}

impl InMemoryRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_snapshot(snapshot: SyncSnapshot) -> Self {
        Self {
            series: RwLock::new(snapshot.series),
            jobs: RwLock::new(snapshot.jobs.into_iter().map(|j| (j.id, j)).collect()),
            writes: AtomicUsize::new(0),
        }
    }

    pub async fn snapshot(&self) -> SyncSnapshot {
        let mut jobs: Vec<ImportJob> = self.jobs.read().await.values().cloned().collect();
        jobs.sort_by_key(|j| j.series_id);
        SyncSnapshot {
            series: self.series.read().await.clone(),
            jobs,
        }
    }

    /// Insert or replace a series.
    pub async fn put_series(&self, series: Series) {
        let mut all = self.series.write().await;
        match all.iter_mut().find(|s| s.id == series.id) {
            Some(existing) => *existing = series,
            None => all.push(series),
        }
    }

    /// Insert a job directly, bypassing the write counter.
    pub async fn seed_job(&self, job: ImportJob) {
        self.jobs.write().await.insert(job.id, job);
    }

    pub async fn job_for_series(&self, series_id: u64) -> Option<ImportJob> {
        self.jobs
            .read()
            .await
            .values()
            .find(|j| j.series_id == series_id)
            .cloned()
    }

    pub async fn job_count(&self) -> usize {
        self.jobs.read().await.len()
    }

    /// Number of create/update/delete calls seen so far.
    pub fn writes(&self) -> usize {
        self.writes.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ImportRepository for InMemoryRepository {
    async fn eligible_series(&self) -> Result<Vec<Series>> {
        Ok(self
            .series
            .read()
            .await
            .iter()
            .filter(|s| s.import_status.is_eligible())
            .cloned()
            .collect())
    }

    async fn jobs(&self) -> Result<Vec<ImportJob>> {
        Ok(self.jobs.read().await.values().cloned().collect())
    }

    async fn create_job(&self, job: ImportJob) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.jobs.write().await.insert(job.id, job);
        Ok(())
    }

    async fn update_job(&self, job: &ImportJob) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        match self.jobs.write().await.get_mut(&job.id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(())
            }
            None => Err(ImportError::Internal(format!("job {} does not exist", job.id))),
        }
    }

    async fn delete_job(&self, job_id: Uuid) -> Result<()> {
        self.writes.fetch_add(1, Ordering::Relaxed);
        self.jobs.write().await.remove(&job_id);
        Ok(())
    }
}
