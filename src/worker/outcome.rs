use serde::{Deserialize, Serialize};

/// Exit code the import worker uses when the source had nothing new.
pub const EXIT_SUCCESS_NOCHANGE: i32 = 2;

/// Exit code the import worker uses when only part of the history was imported.
pub const EXIT_SUCCESS_PARTIAL: i32 = 5;

/// How a supervised subprocess came to an end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Termination {
    Exited(i32),
    Signaled(i32),
    /// Killed after producing no output for the inactivity timeout
    TimedOut,
    /// The process could not be started
    LaunchFailed(String),
    /// The supervisor gave up on the process, e.g. a heartbeat failed
    Aborted(String),
}

impl Termination {
    pub fn from_status(status: std::process::ExitStatus) -> Self {
        if let Some(code) = status.code() {
            return Termination::Exited(code);
        }
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return Termination::Signaled(signal);
            }
        }
        Termination::Aborted(format!("unrecognised exit status: {status}"))
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Termination::Exited(code) => Some(*code),
            _ => None,
        }
    }
}

impl std::fmt::Display for Termination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Termination::Exited(code) => write!(f, "exited with code {code}"),
            Termination::Signaled(signal) => write!(f, "killed by signal {signal}"),
            Termination::TimedOut => write!(f, "timed out"),
            Termination::LaunchFailed(e) => write!(f, "launch failed: {e}"),
            Termination::Aborted(e) => write!(f, "aborted: {e}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResultKind {
    Success,
    SuccessNoChange,
    SuccessPartial,
    Failure,
}

impl ResultKind {
    /// Name used on the job-store wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ResultKind::Success => "SUCCESS",
            ResultKind::SuccessNoChange => "SUCCESS_NOCHANGE",
            ResultKind::SuccessPartial => "SUCCESS_PARTIAL",
            ResultKind::Failure => "FAILURE",
        }
    }

    pub fn is_success(&self) -> bool {
        !matches!(self, ResultKind::Failure)
    }
}

impl std::fmt::Display for ResultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map a termination to a result kind. Anything unrecognised is a failure.
pub fn classify(termination: &Termination) -> ResultKind {
    match termination {
        Termination::Exited(0) => ResultKind::Success,
        Termination::Exited(EXIT_SUCCESS_NOCHANGE) => ResultKind::SuccessNoChange,
        Termination::Exited(EXIT_SUCCESS_PARTIAL) => ResultKind::SuccessPartial,
        Termination::Exited(_)
        | Termination::Signaled(_)
        | Termination::TimedOut
        | Termination::LaunchFailed(_)
        | Termination::Aborted(_) => ResultKind::Failure,
    }
}
