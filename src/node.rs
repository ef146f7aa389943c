use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::WorkerConfig;
use crate::dashboard::{run_dashboard, DashboardState};
use crate::error::Result;
use crate::grpc::GrpcServer;
use crate::machine::{Machine, OfflineReason};
use crate::store::{BlobStore, JobStore};
use crate::worker::{RunOutcome, WorkerMonitor};

/// Jobs currently supervised on this machine, with their start times.
pub type ActiveJobs = Arc<RwLock<HashMap<Uuid, DateTime<Utc>>>>;

/// Worker machine: owns the availability state and runs one
/// [`WorkerMonitor`] task per claimed job.
pub struct WorkerNode {
    config: WorkerConfig,
    machine: Arc<RwLock<Machine>>,
    job_store: Arc<dyn JobStore>,
    blob_store: Arc<dyn BlobStore>,
    active: ActiveJobs,
}

impl WorkerNode {
    pub fn new(
        config: WorkerConfig,
        job_store: Arc<dyn JobStore>,
        blob_store: Arc<dyn BlobStore>,
    ) -> Self {
        let mut machine = Machine::new(config.hostname.clone(), config.max_jobs);
        // The watchdog may tick before the first dispatcher tick.
        machine.record_heartbeat(Utc::now());
        if config.start_online {
            machine.set_online();
        }
        Self {
            config,
            machine: Arc::new(RwLock::new(machine)),
            job_store,
            blob_store,
            active: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn machine(&self) -> Arc<RwLock<Machine>> {
        self.machine.clone()
    }

    pub fn active_jobs(&self) -> ActiveJobs {
        self.active.clone()
    }

    /// Run the node until `shutdown` is cancelled.
    ///
    /// 1. Spawns the machine admin gRPC server
    /// 2. Optionally spawns the status dashboard
    /// 3. Spawns the heartbeat watchdog
    /// 4. Runs the dispatch loop, which drains running jobs on shutdown
    ///
    /// # Errors
    ///
    /// Returns an error if the gRPC server fails.
    pub async fn run(self, shutdown: CancellationToken) -> std::result::Result<(), Box<dyn std::error::Error>> {
        let server = GrpcServer::new(self.config.listen_addr, self.machine.clone());
        let server_shutdown = shutdown.clone();
        let server_handle = tokio::spawn(async move { server.run(server_shutdown).await });

        if let Some(dashboard_addr) = self.config.dashboard_addr {
            let dashboard_state = DashboardState {
                machine: self.machine.clone(),
                active_jobs: self.active.clone(),
            };
            tokio::spawn(async move {
                run_dashboard(dashboard_addr, dashboard_state).await;
            });
        }

        let watchdog_machine = self.machine.clone();
        let watchdog_timeout = self.config.watchdog_timeout();
        let watchdog_shutdown = shutdown.clone();
        tokio::spawn(async move {
            watchdog_loop(watchdog_machine, watchdog_timeout, watchdog_shutdown).await;
        });

        self.dispatch_loop(shutdown).await;

        server_handle.await??;
        Ok(())
    }

    /// Claim jobs while the machine accepts them and supervise each in its own
    /// task. On shutdown, stop claiming, wait for running jobs, go offline.
    pub async fn dispatch_loop(&self, shutdown: CancellationToken) {
        let mut tasks: JoinSet<(Uuid, Result<RunOutcome>)> = JoinSet::new();
        let mut task_jobs: HashMap<tokio::task::Id, Uuid> = HashMap::new();
        let mut interval = tokio::time::interval(self.config.poll_interval());

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    self.dispatch_ready_jobs(&mut tasks, &mut task_jobs).await;
                }
                Some(joined) = tasks.join_next_with_id() => {
                    self.reap(joined, &mut task_jobs).await;
                }
            }
        }

        tracing::info!(running = tasks.len(), "Dispatcher stopping, waiting for running jobs");
        while let Some(joined) = tasks.join_next_with_id().await {
            self.reap(joined, &mut task_jobs).await;
        }
        self.machine.write().await.set_offline(OfflineReason::Stopped);
    }

    /// One dispatcher tick: stamp the heartbeat, finish a drain if one is due,
    /// then claim jobs until the machine is full or the store has none.
    async fn dispatch_ready_jobs(
        &self,
        tasks: &mut JoinSet<(Uuid, Result<RunOutcome>)>,
        task_jobs: &mut HashMap<tokio::task::Id, Uuid>,
    ) {
        {
            let mut machine = self.machine.write().await;
            machine.record_heartbeat(Utc::now());
            machine.complete_drain();
        }

        loop {
            if !self.machine.write().await.reserve_slot() {
                return;
            }

            let claimed = self
                .job_store
                .get_job_for_machine(&self.config.hostname, self.config.max_jobs)
                .await;
            let job_id = match claimed {
                Ok(Some(job_id)) => job_id,
                Ok(None) => {
                    self.machine.write().await.release_slot();
                    return;
                }
                Err(e) => {
                    self.machine.write().await.release_slot();
                    tracing::error!(error = %e, "Failed to claim job from job store");
                    return;
                }
            };

            self.active.write().await.insert(job_id, Utc::now());
            let monitor = WorkerMonitor::new(
                job_id,
                self.config.supervisor.clone(),
                self.job_store.clone(),
                self.blob_store.clone(),
            );
            let handle = tasks.spawn(async move { (job_id, monitor.run().await) });
            task_jobs.insert(handle.id(), job_id);
            tracing::info!(job_id = %job_id, "Dispatched import job");
        }
    }

    async fn reap(
        &self,
        joined: std::result::Result<(tokio::task::Id, (Uuid, Result<RunOutcome>)), tokio::task::JoinError>,
        task_jobs: &mut HashMap<tokio::task::Id, Uuid>,
    ) {
        let job_id = match joined {
            Ok((task_id, (job_id, outcome))) => {
                task_jobs.remove(&task_id);
                match outcome {
                    Ok(RunOutcome::Finished(result)) => {
                        tracing::debug!(job_id = %job_id, result = %result.kind, "Monitor finished");
                    }
                    Ok(RunOutcome::Vanished) => {
                        tracing::debug!(job_id = %job_id, "Monitor ended for vanished job");
                    }
                    Err(e) => {
                        tracing::error!(job_id = %job_id, error = %e, "Monitor failed");
                    }
                }
                Some(job_id)
            }
            Err(e) => {
                let job_id = task_jobs.remove(&e.id());
                tracing::error!(job_id = ?job_id, error = %e, "Monitor task panicked");
                job_id
            }
        };

        if let Some(job_id) = job_id {
            self.active.write().await.remove(&job_id);
        }
        let mut machine = self.machine.write().await;
        machine.release_slot();
        machine.complete_drain();
    }
}

/// Take the machine offline if the dispatcher stops stamping its heartbeat.
pub async fn watchdog_loop(
    machine: Arc<RwLock<Machine>>,
    timeout: Duration,
    shutdown: CancellationToken,
) {
    let mut interval = tokio::time::interval((timeout / 2).max(Duration::from_millis(1)));
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {
                let mut machine = machine.write().await;
                if machine.expire_if_stale(Utc::now(), timeout) {
                    tracing::warn!(
                        hostname = %machine.hostname,
                        timeout_ms = timeout.as_millis() as u64,
                        "Machine heartbeat went stale"
                    );
                }
            }
        }
    }
}
