//! Import job execution on a worker machine.
//!
//! - [`outcome`]: maps how the worker process ended to a [`ResultKind`]
//! - [`protocol`]: supervises one subprocess (log capture, tail, inactivity
//!   timeout, serialized heartbeats)
//! - [`monitor`]: runs one job end to end against the job and blob stores
//!
//! # Run sequence
//!
//! 1. [`WorkerMonitor::run`] fetches the job's arguments from the job store
//! 2. Launches the worker under a fresh [`SupervisorProtocol`]
//! 3. Heartbeats carry the last five output lines back to the job store
//! 4. On exit the termination is classified, the log uploaded, and the
//!    result reported
//!
//! A job the store no longer knows about ends the run quietly at any step.

pub mod monitor;
pub mod outcome;
pub mod protocol;

pub use monitor::{ImportResult, RunOutcome, WorkerMonitor};
pub use outcome::{classify, ResultKind, Termination};
pub use protocol::{HeartbeatSink, LogTail, SupervisedRun, SupervisorProtocol};
