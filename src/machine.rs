//! Machine availability state machine.
//!
//! A machine starts `Offline`. Operators bring it `Online`, and may ask it to
//! drain by moving it to `Quiescing`. Going `Offline` always records why:
//! an operator stopped it, it finished draining, or its heartbeat went stale.

use std::collections::VecDeque;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{ImportError, Result};

const MAX_EVENTS: usize = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MachineState {
    Offline,
    Online,
    Quiescing,
}

impl std::fmt::Display for MachineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MachineState::Offline => write!(f, "OFFLINE"),
            MachineState::Online => write!(f, "ONLINE"),
            MachineState::Quiescing => write!(f, "QUIESCING"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OfflineReason {
    /// An operator took the machine offline
    Stopped,
    /// The machine finished draining after quiescing
    Quiesced,
    /// The machine heartbeat went stale
    Watchdog,
}

impl std::fmt::Display for OfflineReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OfflineReason::Stopped => write!(f, "STOPPED"),
            OfflineReason::Quiesced => write!(f, "QUIESCED"),
            OfflineReason::Watchdog => write!(f, "WATCHDOG"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MachineEventKind {
    Online,
    Offline {
        reason: OfflineReason,
    },
    Quiesce {
        requested_by: String,
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineEvent {
    pub at: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: MachineEventKind,
}

#[derive(Debug, Clone)]
pub struct Machine {
    pub hostname: String,
    pub date_created: DateTime<Utc>,
    state: MachineState,
    heartbeat: Option<DateTime<Utc>>,
    capacity: usize,
    running_jobs: usize,
    events: VecDeque<MachineEvent>,
}

impl Machine {
    pub fn new(hostname: impl Into<String>, capacity: usize) -> Self {
        Self {
            hostname: hostname.into(),
            date_created: Utc::now(),
            state: MachineState::Offline,
            heartbeat: None,
            capacity,
            running_jobs: 0,
            events: VecDeque::new(),
        }
    }

    pub fn state(&self) -> MachineState {
        self.state
    }

    pub fn heartbeat(&self) -> Option<DateTime<Utc>> {
        self.heartbeat
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn running_jobs(&self) -> usize {
        self.running_jobs
    }

    /// Transition history, oldest first.
    pub fn events(&self) -> impl DoubleEndedIterator<Item = &MachineEvent> {
        self.events.iter()
    }

    pub fn set_online(&mut self) {
        if self.state == MachineState::Online {
            return;
        }
        self.transition(MachineState::Online, MachineEventKind::Online);
    }

    pub fn set_offline(&mut self, reason: OfflineReason) {
        if self.state == MachineState::Offline {
            return;
        }
        self.transition(MachineState::Offline, MachineEventKind::Offline { reason });
    }

    /// Stop taking new jobs while running ones finish. Only valid from `Online`.
    pub fn set_quiescing(&mut self, requested_by: &str, message: &str) -> Result<()> {
        if self.state != MachineState::Online {
            return Err(ImportError::InvalidTransition {
                from: self.state.to_string(),
                to: MachineState::Quiescing.to_string(),
            });
        }
        self.transition(
            MachineState::Quiescing,
            MachineEventKind::Quiesce {
                requested_by: requested_by.to_string(),
                message: message.to_string(),
            },
        );
        Ok(())
    }

    pub fn should_accept_new_job(&self) -> bool {
        self.state == MachineState::Online && self.running_jobs < self.capacity
    }

    /// Reserve a job slot. Returns false if the machine may not take new work.
    pub fn reserve_slot(&mut self) -> bool {
        if !self.should_accept_new_job() {
            return false;
        }
        self.running_jobs += 1;
        true
    }

    pub fn release_slot(&mut self) {
        self.running_jobs = self.running_jobs.saturating_sub(1);
    }

    /// Finish a drain: a quiescing machine with nothing running goes offline.
    pub fn complete_drain(&mut self) -> bool {
        if self.state == MachineState::Quiescing && self.running_jobs == 0 {
            self.set_offline(OfflineReason::Quiesced);
            return true;
        }
        false
    }

    pub fn record_heartbeat(&mut self, now: DateTime<Utc>) {
        self.heartbeat = Some(now);
    }

    pub fn is_stale(&self, now: DateTime<Utc>, max_age: Duration) -> bool {
        let Some(last) = self.heartbeat else {
            return true;
        };
        match (now - last).to_std() {
            Ok(age) => age > max_age,
            // heartbeat is in the future
            Err(_) => false,
        }
    }

    /// Take a non-offline machine offline if its heartbeat is older than `max_age`.
    pub fn expire_if_stale(&mut self, now: DateTime<Utc>, max_age: Duration) -> bool {
        if self.state == MachineState::Offline || !self.is_stale(now, max_age) {
            return false;
        }
        self.set_offline(OfflineReason::Watchdog);
        true
    }

    fn transition(&mut self, to: MachineState, kind: MachineEventKind) {
        let from = self.state;
        self.state = to;
        tracing::info!(
            hostname = %self.hostname,
            from = %from,
            to = %to,
            event = ?kind,
            "Machine state changed"
        );
        if self.events.len() == MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(MachineEvent {
            at: Utc::now(),
            kind,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn online(capacity: usize) -> Machine {
        let mut machine = Machine::new("importer-1", capacity);
        machine.set_online();
        machine
    }

    #[test]
    fn new_machine_is_offline() {
        let machine = Machine::new("importer-1", 4);
        assert_eq!(machine.state(), MachineState::Offline);
        assert!(!machine.should_accept_new_job());
        assert_eq!(machine.events().count(), 0);
    }

    #[test]
    fn set_online_records_event() {
        let machine = online(4);
        assert_eq!(machine.state(), MachineState::Online);
        let events: Vec<_> = machine.events().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, MachineEventKind::Online);
    }

    #[test]
    fn set_online_from_quiescing() {
        let mut machine = online(4);
        machine.set_quiescing("admin", "kernel upgrade").unwrap();
        machine.set_online();
        assert_eq!(machine.state(), MachineState::Online);
        assert_eq!(machine.events().count(), 3);
    }

    #[test]
    fn repeated_transition_is_noop() {
        let mut machine = online(4);
        machine.set_online();
        assert_eq!(machine.events().count(), 1);

        machine.set_offline(OfflineReason::Stopped);
        machine.set_offline(OfflineReason::Stopped);
        assert_eq!(machine.events().count(), 2);
    }

    #[test]
    fn offline_records_reason_from_any_state() {
        let mut machine = online(4);
        machine.set_offline(OfflineReason::Stopped);
        assert_eq!(machine.state(), MachineState::Offline);

        machine.set_online();
        machine.set_quiescing("admin", "").unwrap();
        machine.set_offline(OfflineReason::Watchdog);
        let last = machine.events().last().unwrap();
        assert_eq!(
            last.kind,
            MachineEventKind::Offline {
                reason: OfflineReason::Watchdog
            }
        );
    }

    #[test]
    fn quiescing_requires_online() {
        let mut machine = Machine::new("importer-1", 4);
        let err = machine.set_quiescing("admin", "drain").unwrap_err();
        assert!(matches!(err, ImportError::InvalidTransition { .. }));
        assert_eq!(machine.state(), MachineState::Offline);

        let mut machine = online(4);
        machine.set_quiescing("admin", "drain").unwrap();
        assert!(machine.set_quiescing("admin", "again").is_err());
    }

    #[test]
    fn quiescing_records_requester_and_message() {
        let mut machine = online(4);
        machine.set_quiescing("ops-alice", "disk swap").unwrap();
        let last = machine.events().last().unwrap();
        assert_eq!(
            last.kind,
            MachineEventKind::Quiesce {
                requested_by: "ops-alice".to_string(),
                message: "disk swap".to_string(),
            }
        );
    }

    #[test]
    fn quiescing_refuses_jobs_even_when_idle() {
        let mut machine = online(4);
        assert!(machine.should_accept_new_job());
        machine.set_quiescing("admin", "drain").unwrap();
        assert_eq!(machine.running_jobs(), 0);
        assert!(!machine.should_accept_new_job());
    }

    #[test]
    fn capacity_limits_slots() {
        let mut machine = online(2);
        assert!(machine.reserve_slot());
        assert!(machine.reserve_slot());
        assert!(!machine.should_accept_new_job());
        assert!(!machine.reserve_slot());

        machine.release_slot();
        assert!(machine.should_accept_new_job());
    }

    #[test]
    fn release_slot_saturates() {
        let mut machine = online(1);
        machine.release_slot();
        assert_eq!(machine.running_jobs(), 0);
    }

    #[test]
    fn drain_completes_when_last_job_finishes() {
        let mut machine = online(2);
        assert!(machine.reserve_slot());
        machine.set_quiescing("admin", "drain").unwrap();

        assert!(!machine.complete_drain());
        assert_eq!(machine.state(), MachineState::Quiescing);

        machine.release_slot();
        assert!(machine.complete_drain());
        assert_eq!(machine.state(), MachineState::Offline);
        let last = machine.events().last().unwrap();
        assert_eq!(
            last.kind,
            MachineEventKind::Offline {
                reason: OfflineReason::Quiesced
            }
        );
    }

    #[test]
    fn complete_drain_ignores_online_machine() {
        let mut machine = online(2);
        assert!(!machine.complete_drain());
        assert_eq!(machine.state(), MachineState::Online);
    }

    #[test]
    fn watchdog_expires_stale_machine() {
        let mut machine = online(2);
        let now = Utc::now();
        machine.record_heartbeat(now - chrono::Duration::seconds(600));

        assert!(machine.expire_if_stale(now, Duration::from_secs(300)));
        assert_eq!(machine.state(), MachineState::Offline);
        let last = machine.events().last().unwrap();
        assert_eq!(
            last.kind,
            MachineEventKind::Offline {
                reason: OfflineReason::Watchdog
            }
        );
    }

    #[test]
    fn watchdog_spares_fresh_or_offline_machine() {
        let mut machine = online(2);
        let now = Utc::now();
        machine.record_heartbeat(now - chrono::Duration::seconds(10));
        assert!(!machine.expire_if_stale(now, Duration::from_secs(300)));
        assert_eq!(machine.state(), MachineState::Online);

        let mut offline = Machine::new("importer-2", 2);
        assert!(offline.is_stale(now, Duration::from_secs(300)));
        assert!(!offline.expire_if_stale(now, Duration::from_secs(300)));
        assert_eq!(offline.events().count(), 0);
    }

    #[test]
    fn event_history_is_bounded() {
        let mut machine = Machine::new("importer-1", 1);
        for _ in 0..MAX_EVENTS {
            machine.set_online();
            machine.set_offline(OfflineReason::Stopped);
        }
        assert_eq!(machine.events().count(), MAX_EVENTS);
    }
}
