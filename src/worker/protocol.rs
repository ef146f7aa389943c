use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tokio::time::{Instant, MissedTickBehavior};

use crate::config::SupervisorConfig;
use crate::error::Result;
use crate::worker::outcome::Termination;

/// Number of trailing output lines reported with each heartbeat.
pub const TAIL_LINES: usize = 5;

const READ_BUFFER_SIZE: usize = 8 * 1024;
const MAX_PARTIAL_LINE: usize = 4 * 1024;

/// Receives the log tail on every heartbeat tick.
#[async_trait]
pub trait HeartbeatSink: Send + Sync {
    async fn beat(&self, tail: String) -> Result<()>;
}

/// Rolling window over the last [`TAIL_LINES`] lines of output.
///
/// An unterminated trailing line counts as a line.
#[derive(Debug, Default, Clone)]
pub struct LogTail {
    lines: VecDeque<String>,
    partial: Vec<u8>,
}

impl LogTail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, mut bytes: &[u8]) {
        while let Some(pos) = bytes.iter().position(|b| *b == b'\n') {
            self.partial.extend_from_slice(&bytes[..pos]);
            let line = String::from_utf8_lossy(&self.partial).into_owned();
            self.partial.clear();
            if self.lines.len() == TAIL_LINES {
                self.lines.pop_front();
            }
            self.lines.push_back(line);
            bytes = &bytes[pos + 1..];
        }
        self.partial.extend_from_slice(bytes);
        if self.partial.len() > MAX_PARTIAL_LINE {
            let excess = self.partial.len() - MAX_PARTIAL_LINE;
            self.partial.drain(..excess);
        }
    }

    pub fn lines(&self) -> Vec<String> {
        let mut lines: Vec<String> = self.lines.iter().cloned().collect();
        if !self.partial.is_empty() {
            lines.push(String::from_utf8_lossy(&self.partial).into_owned());
        }
        let skip = lines.len().saturating_sub(TAIL_LINES);
        lines.split_off(skip)
    }

    pub fn render(&self) -> String {
        self.lines().join("\n")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// Outcome of supervising one subprocess.
#[derive(Debug)]
pub struct SupervisedRun {
    pub termination: Termination,
    /// Everything the process wrote, both streams interleaved in arrival order
    pub log: Vec<u8>,
    pub tail: String,
}

type HeartbeatFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

/// Owns all interaction with a single worker subprocess.
///
/// Output on either stream resets the inactivity timer and is appended to the
/// log. A heartbeat tick, independent of that timer, hands the current tail to
/// the [`HeartbeatSink`]; at most one heartbeat is in flight at a time and ticks
/// that land while one is pending are skipped.
pub struct SupervisorProtocol {
    inactivity_timeout: Duration,
    heartbeat_interval: Duration,
    heartbeat: Arc<dyn HeartbeatSink>,
    log: Vec<u8>,
    tail: LogTail,
}

impl SupervisorProtocol {
    pub fn new(
        inactivity_timeout: Duration,
        heartbeat_interval: Duration,
        heartbeat: Arc<dyn HeartbeatSink>,
    ) -> Self {
        Self {
            inactivity_timeout,
            // tokio intervals panic on a zero period
            heartbeat_interval: heartbeat_interval.max(Duration::from_millis(1)),
            heartbeat,
            log: Vec::new(),
            tail: LogTail::new(),
        }
    }

    pub fn from_config(config: &SupervisorConfig, heartbeat: Arc<dyn HeartbeatSink>) -> Self {
        Self::new(
            config.inactivity_timeout(),
            config.heartbeat_interval(),
            heartbeat,
        )
    }

    /// Spawn `command` and supervise it until it exits or is killed.
    ///
    /// # Errors
    ///
    /// Only a heartbeat reporting [`JobVanished`](crate::error::ImportError::JobVanished)
    /// is returned as an error; the process is killed first. Every other
    /// problem is folded into [`SupervisedRun::termination`].
    pub async fn run(mut self, mut command: Command) -> Result<SupervisedRun> {
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = match command.spawn() {
            Ok(child) => child,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to launch worker");
                return Ok(self.into_run(Termination::LaunchFailed(e.to_string())));
            }
        };
        tracing::debug!(pid = ?child.id(), "Worker launched");

        let (tx, mut rx) = mpsc::channel(64);
        let mut pumps = Vec::with_capacity(2);
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump(stdout, OutputStream::Stdout, tx.clone())));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump(stderr, OutputStream::Stderr, tx.clone())));
        }
        drop(tx);

        let deadline = tokio::time::sleep(self.inactivity_timeout);
        tokio::pin!(deadline);
        let mut ticker = tokio::time::interval(self.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut in_flight: Option<HeartbeatFuture> = None;
        let mut exited: Option<Termination> = None;
        let mut streams_open = true;

        let mut outcome = loop {
            if !streams_open {
                if let Some(termination) = exited.take() {
                    break Ok(termination);
                }
            }

            tokio::select! {
                chunk = rx.recv(), if streams_open => match chunk {
                    Some((_stream, bytes)) => {
                        deadline.as_mut().reset(Instant::now() + self.inactivity_timeout);
                        self.record(&bytes);
                    }
                    None => streams_open = false,
                },
                status = child.wait(), if exited.is_none() => {
                    let termination = match status {
                        Ok(status) => Termination::from_status(status),
                        Err(e) => Termination::Aborted(format!("failed to wait for worker: {e}")),
                    };
                    tracing::debug!(termination = %termination, "Worker exited");
                    exited = Some(termination);
                }
                () = &mut deadline => {
                    if exited.is_some() {
                        // A descendant still holds the output pipes open.
                        streams_open = false;
                        continue;
                    }
                    tracing::warn!(
                        timeout_ms = self.inactivity_timeout.as_millis() as u64,
                        "Worker produced no output, killing it"
                    );
                    kill(&mut child).await;
                    break Ok(Termination::TimedOut);
                }
                _ = ticker.tick(), if exited.is_none() => {
                    if in_flight.is_some() {
                        tracing::debug!("Previous heartbeat still in flight, skipping tick");
                    } else {
                        in_flight = Some(self.start_heartbeat());
                    }
                }
                result = wait_in_flight(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    if let Err(e) = result {
                        kill(&mut child).await;
                        if e.is_vanished() {
                            break Err(e);
                        }
                        tracing::warn!(error = %e, "Heartbeat failed, aborting worker");
                        break Ok(Termination::Aborted(format!("heartbeat failed: {e}")));
                    }
                }
            }
        };

        // Nothing may reach the job store for this run after we return.
        if let Some(heartbeat) = in_flight.take() {
            if let Err(e) = heartbeat.await {
                if e.is_vanished() {
                    if outcome.is_ok() {
                        outcome = Err(e);
                    }
                } else {
                    tracing::warn!(error = %e, "Final heartbeat failed");
                }
            }
        }
        for pump in pumps {
            pump.abort();
        }

        outcome.map(|termination| self.into_run(termination))
    }

    fn record(&mut self, bytes: &[u8]) {
        self.log.extend_from_slice(bytes);
        self.tail.push(bytes);
    }

    fn start_heartbeat(&self) -> HeartbeatFuture {
        let sink = Arc::clone(&self.heartbeat);
        let tail = self.tail.render();
        Box::pin(async move { sink.beat(tail).await })
    }

    fn into_run(self, termination: Termination) -> SupervisedRun {
        SupervisedRun {
            termination,
            tail: self.tail.render(),
            log: self.log,
        }
    }
}

async fn wait_in_flight(slot: &mut Option<HeartbeatFuture>) -> Result<()> {
    match slot.as_mut() {
        Some(heartbeat) => heartbeat.await,
        None => std::future::pending().await,
    }
}

async fn kill(child: &mut Child) {
    if let Err(e) = child.kill().await {
        tracing::warn!(error = %e, "Failed to kill worker");
    }
}

async fn pump<R>(mut reader: R, stream: OutputStream, tx: mpsc::Sender<(OutputStream, Vec<u8>)>)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        match reader.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                if tx.send((stream, buf[..n].to_vec())).await.is_err() {
                    break;
                }
            }
            Err(e) => {
                tracing::warn!(stream = ?stream, error = %e, "Failed to read worker output");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tail_keeps_last_five_lines() {
        let mut tail = LogTail::new();
        for i in 1..=7 {
            tail.push(format!("line {i}\n").as_bytes());
        }
        assert_eq!(
            tail.lines(),
            vec!["line 3", "line 4", "line 5", "line 6", "line 7"]
        );
        assert_eq!(tail.render(), "line 3\nline 4\nline 5\nline 6\nline 7");
    }

    #[test]
    fn tail_joins_lines_split_across_chunks() {
        let mut tail = LogTail::new();
        tail.push(b"hel");
        tail.push(b"lo\nwor");
        assert_eq!(tail.lines(), vec!["hello", "wor"]);
        tail.push(b"ld\n");
        assert_eq!(tail.lines(), vec!["hello", "world"]);
    }

    #[test]
    fn tail_counts_partial_line() {
        let mut tail = LogTail::new();
        tail.push(b"a\nb\nc\nd\ne\nf");
        assert_eq!(tail.lines(), vec!["b", "c", "d", "e", "f"]);
    }

    #[test]
    fn tail_of_nothing_is_empty() {
        let tail = LogTail::new();
        assert!(tail.lines().is_empty());
        assert_eq!(tail.render(), "");
    }

    #[test]
    fn tail_keeps_blank_lines() {
        let mut tail = LogTail::new();
        tail.push(b"a\n\nb\n");
        assert_eq!(tail.lines(), vec!["a", "", "b"]);
    }

    #[test]
    fn tail_bounds_unterminated_line() {
        let mut tail = LogTail::new();
        tail.push(&vec![b'x'; MAX_PARTIAL_LINE * 3]);
        let lines = tail.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0].len(), MAX_PARTIAL_LINE);
    }
}
