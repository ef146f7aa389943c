//! Keeps the import job table in agreement with series import status.
//!
//! Each series carries a legacy `import_status`. Every eligible series owns
//! exactly one [`ImportJob`] whose review status is derived from that legacy
//! status by [`map_series_status`]; nothing else creates or deletes jobs.
//! Storage sits behind [`ImportRepository`] so the two status enumerations can
//! later be collapsed without touching the worker side.

pub mod repository;

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ImportError, Result};

pub use repository::{ImportRepository, InMemoryRepository, SyncSnapshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SeriesStatus {
    #[serde(rename = "TESTING")]
    Testing,
    #[serde(rename = "AUTOTESTED")]
    Autotested,
    #[serde(rename = "PROCESSING")]
    Processing,
    #[serde(rename = "SYNCING")]
    Syncing,
    #[serde(rename = "STOPPED")]
    Stopped,
    #[serde(rename = "DONTSYNC")]
    DontSync,
    #[serde(rename = "TESTFAILED")]
    TestFailed,
}

impl SeriesStatus {
    pub fn is_eligible(&self) -> bool {
        !matches!(self, SeriesStatus::DontSync | SeriesStatus::TestFailed)
    }
}

impl std::fmt::Display for SeriesStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SeriesStatus::Testing => write!(f, "TESTING"),
            SeriesStatus::Autotested => write!(f, "AUTOTESTED"),
            SeriesStatus::Processing => write!(f, "PROCESSING"),
            SeriesStatus::Syncing => write!(f, "SYNCING"),
            SeriesStatus::Stopped => write!(f, "STOPPED"),
            SeriesStatus::DontSync => write!(f, "DONTSYNC"),
            SeriesStatus::TestFailed => write!(f, "TESTFAILED"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ReviewStatus {
    New,
    Reviewed,
    Suspended,
}

impl std::fmt::Display for ReviewStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ReviewStatus::New => write!(f, "NEW"),
            ReviewStatus::Reviewed => write!(f, "REVIEWED"),
            ReviewStatus::Suspended => write!(f, "SUSPENDED"),
        }
    }
}

/// VCS connection parameters. Opaque here; passed through to the worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VcsConnection {
    pub kind: String,
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Series {
    pub id: u64,
    pub destination_ref: String,
    pub connection: VcsConnection,
    pub import_status: SeriesStatus,
    pub last_synced: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportJob {
    pub id: Uuid,
    pub series_id: u64,
    pub destination_ref: String,
    pub connection: VcsConnection,
    pub review_status: ReviewStatus,
    pub date_last_successful: Option<DateTime<Utc>>,
}

/// Job fields derived from a series' legacy status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobStatusMapping {
    pub review_status: ReviewStatus,
    pub date_last_successful: Option<DateTime<Utc>>,
}

/// Derive job state from a series. Statuses that never produce a job are an
/// error, not a default.
pub fn map_series_status(series: &Series) -> Result<JobStatusMapping> {
    let (review_status, date_last_successful) = match series.import_status {
        SeriesStatus::Testing | SeriesStatus::Autotested => (ReviewStatus::New, None),
        SeriesStatus::Processing => (ReviewStatus::Reviewed, None),
        SeriesStatus::Syncing => (ReviewStatus::Reviewed, series.last_synced),
        SeriesStatus::Stopped => (ReviewStatus::Suspended, series.last_synced),
        SeriesStatus::DontSync | SeriesStatus::TestFailed => {
            return Err(ImportError::UnmappedSeriesStatus {
                series_id: series.id,
                status: series.import_status.to_string(),
            })
        }
    };
    Ok(JobStatusMapping {
        review_status,
        date_last_successful,
    })
}

impl ImportJob {
    pub fn for_series(series: &Series, mapping: JobStatusMapping) -> Self {
        Self {
            id: Uuid::new_v4(),
            series_id: series.id,
            destination_ref: series.destination_ref.clone(),
            connection: series.connection.clone(),
            review_status: mapping.review_status,
            date_last_successful: mapping.date_last_successful,
        }
    }

    fn matches(&self, mapping: &JobStatusMapping) -> bool {
        self.review_status == mapping.review_status
            && self.date_last_successful == mapping.date_last_successful
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
    pub unchanged: usize,
    /// Destinations of deleted jobs, left behind for manual cleanup
    pub orphaned_destinations: Vec<String>,
}

impl SyncReport {
    pub fn writes(&self) -> usize {
        self.created + self.updated + self.deleted
    }
}

pub struct JobSynchronizer<R> {
    repository: R,
}

impl<R: ImportRepository> JobSynchronizer<R> {
    pub fn new(repository: R) -> Self {
        Self { repository }
    }

    pub fn repository(&self) -> &R {
        &self.repository
    }

    /// Create, update and delete jobs until they mirror the eligible series.
    ///
    /// Every series is mapped before anything is written, so a series with an
    /// unmapped status or a repeated id aborts the run without partial changes.
    pub async fn sync(&self) -> Result<SyncReport> {
        let series = self.repository.eligible_series().await?;
        let mut seen = HashSet::new();
        let planned = series
            .iter()
            .map(|s| {
                if !seen.insert(s.id) {
                    return Err(ImportError::DuplicateSeries(s.id));
                }
                map_series_status(s).map(|mapping| (s, mapping))
            })
            .collect::<Result<Vec<_>>>()?;

        let mut jobs_by_series: HashMap<u64, ImportJob> = HashMap::new();
        let mut duplicates = Vec::new();
        for job in self.repository.jobs().await? {
            if jobs_by_series.contains_key(&job.series_id) {
                duplicates.push(job);
            } else {
                jobs_by_series.insert(job.series_id, job);
            }
        }

        let mut report = SyncReport::default();
        for (series, mapping) in planned {
            match jobs_by_series.remove(&series.id) {
                None => {
                    let job = ImportJob::for_series(series, mapping);
                    tracing::debug!(
                        series_id = series.id,
                        job_id = %job.id,
                        review_status = %job.review_status,
                        "Creating import job"
                    );
                    self.repository.create_job(job).await?;
                    report.created += 1;
                }
                Some(job) if job.matches(&mapping) => report.unchanged += 1,
                Some(mut job) => {
                    job.review_status = mapping.review_status;
                    job.date_last_successful = mapping.date_last_successful;
                    self.repository.update_job(&job).await?;
                    report.updated += 1;
                }
            }
        }

        for job in jobs_by_series.into_values().chain(duplicates) {
            tracing::warn!(
                job_id = %job.id,
                series_id = job.series_id,
                destination = %job.destination_ref,
                "Deleting orphaned import job; destination needs manual cleanup"
            );
            self.repository.delete_job(job.id).await?;
            report.deleted += 1;
            report.orphaned_destinations.push(job.destination_ref);
        }

        tracing::info!(
            created = report.created,
            updated = report.updated,
            deleted = report.deleted,
            unchanged = report.unchanged,
            "Import job sync complete"
        );
        Ok(report)
    }
}
