use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{ImportError, Result};

/// Settings handed to every WorkerMonitor for a single import run.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    /// Path to the import worker executable
    pub worker_executable: PathBuf,
    /// Fixed arguments placed before the per-job arguments
    pub worker_args: Vec<String>,
    /// Kill the subprocess after this long without any output
    pub inactivity_timeout_ms: u64,
    /// How often the log tail is reported to the job store
    pub heartbeat_interval_ms: u64,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            worker_executable: PathBuf::from("/usr/bin/codeimport-vcs-worker"),
            worker_args: Vec::new(),
            inactivity_timeout_ms: 20 * 60 * 1000,
            heartbeat_interval_ms: 30 * 1000,
        }
    }
}

impl SupervisorConfig {
    pub fn inactivity_timeout(&self) -> Duration {
        Duration::from_millis(self.inactivity_timeout_ms)
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }
}

/// Where completed run logs are written and how they are addressed.
#[derive(Debug, Clone)]
pub struct LogStoreConfig {
    pub log_dir: PathBuf,
    /// Prefix for the URL returned to the job store, e.g. "https://logs.example.com"
    pub log_base_url: String,
}

impl Default for LogStoreConfig {
    fn default() -> Self {
        Self {
            log_dir: PathBuf::from("/var/lib/codeimport/logs"),
            log_base_url: "file:///var/lib/codeimport/logs".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub hostname: String,
    /// Address for the machine administration gRPC service
    pub listen_addr: SocketAddr,
    /// Job store endpoint, e.g. "http://jobs.internal:50060"
    pub job_store_addr: String,
    pub dashboard_addr: Option<SocketAddr>,
    /// Per-machine job capacity
    pub max_jobs: usize,
    pub poll_interval_ms: u64,
    pub watchdog_timeout_ms: u64,
    /// Bring the machine online at startup instead of waiting for an operator
    pub start_online: bool,
    pub supervisor: SupervisorConfig,
    pub logs: LogStoreConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            hostname: "localhost".to_string(),
            // SAFETY: This is a hardcoded valid address that will always parse
            listen_addr: "127.0.0.1:50071"
                .parse()
                .expect("default listen address is valid"),
            job_store_addr: "http://127.0.0.1:50060".to_string(),
            dashboard_addr: None,
            max_jobs: 10,
            poll_interval_ms: 10 * 1000,
            watchdog_timeout_ms: 5 * 60 * 1000,
            start_online: false,
            supervisor: SupervisorConfig::default(),
            logs: LogStoreConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(hostname: impl Into<String>, listen_addr: SocketAddr) -> Self {
        Self {
            hostname: hostname.into(),
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_max_jobs(mut self, max_jobs: usize) -> Self {
        self.max_jobs = max_jobs;
        self
    }

    pub fn with_supervisor(mut self, supervisor: SupervisorConfig) -> Self {
        self.supervisor = supervisor;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn watchdog_timeout(&self) -> Duration {
        Duration::from_millis(self.watchdog_timeout_ms)
    }

    /// Reject settings the node cannot run with. The dispatcher stamps the
    /// heartbeat once per poll, so polling must be faster than the watchdog.
    pub fn validate(&self) -> Result<()> {
        if self.poll_interval_ms == 0 {
            return Err(ImportError::InvalidConfig(
                "poll interval must be positive".to_string(),
            ));
        }
        if self.poll_interval_ms >= self.watchdog_timeout_ms {
            return Err(ImportError::InvalidConfig(format!(
                "poll interval ({} ms) must be shorter than the watchdog timeout ({} ms)",
                self.poll_interval_ms, self.watchdog_timeout_ms
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn supervisor_config_default() {
        let cfg = SupervisorConfig::default();
        assert_eq!(cfg.inactivity_timeout(), Duration::from_secs(1200));
        assert_eq!(cfg.heartbeat_interval(), Duration::from_secs(30));
        assert!(cfg.worker_args.is_empty());
    }

    #[test]
    fn worker_config_default() {
        let cfg = WorkerConfig::default();
        assert_eq!(cfg.hostname, "localhost");
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:50071");
        assert_eq!(cfg.max_jobs, 10);
        assert!(cfg.dashboard_addr.is_none());
        assert!(!cfg.start_online);
        assert_eq!(cfg.poll_interval(), Duration::from_secs(10));
        assert_eq!(cfg.watchdog_timeout(), Duration::from_secs(300));
    }

    #[test]
    fn worker_config_builders() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let supervisor = SupervisorConfig {
            inactivity_timeout_ms: 500,
            ..SupervisorConfig::default()
        };
        let cfg = WorkerConfig::new("importer-3", addr)
            .with_max_jobs(2)
            .with_supervisor(supervisor);
        assert_eq!(cfg.hostname, "importer-3");
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(cfg.max_jobs, 2);
        assert_eq!(cfg.supervisor.inactivity_timeout_ms, 500);
    }

    #[test]
    fn default_config_is_valid() {
        assert!(WorkerConfig::default().validate().is_ok());
    }

    #[test]
    fn poll_slower_than_watchdog_is_rejected() {
        let cfg = WorkerConfig {
            poll_interval_ms: 60_000,
            watchdog_timeout_ms: 30_000,
            ..WorkerConfig::default()
        };
        assert!(matches!(cfg.validate(), Err(ImportError::InvalidConfig(_))));

        let equal = WorkerConfig {
            poll_interval_ms: 30_000,
            watchdog_timeout_ms: 30_000,
            ..WorkerConfig::default()
        };
        assert!(equal.validate().is_err());

        let zero = WorkerConfig {
            poll_interval_ms: 0,
            ..WorkerConfig::default()
        };
        assert!(zero.validate().is_err());
    }
}
