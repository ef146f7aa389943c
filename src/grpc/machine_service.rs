use std::sync::Arc;
use tokio::sync::RwLock;
use tonic::{Request, Response, Status};

use crate::machine::{Machine, MachineState, OfflineReason};
use crate::proto::machine_service_server::MachineService;
use crate::proto::{
    GetMachineStatusRequest, MachineState as ProtoMachineState, MachineStatusResponse,
    OfflineReason as ProtoOfflineReason, SetOfflineRequest, SetOnlineRequest,
    SetQuiescingRequest, ShouldAcceptNewJobRequest, ShouldAcceptNewJobResponse,
};

/// gRPC administration surface for this machine's availability.
pub struct MachineServiceImpl {
    machine: Arc<RwLock<Machine>>,
}

impl MachineServiceImpl {
    pub fn new(machine: Arc<RwLock<Machine>>) -> Self {
        Self { machine }
    }
}

pub fn state_to_proto(state: MachineState) -> ProtoMachineState {
    match state {
        MachineState::Offline => ProtoMachineState::Offline,
        MachineState::Online => ProtoMachineState::Online,
        MachineState::Quiescing => ProtoMachineState::Quiescing,
    }
}

pub fn offline_reason_to_proto(reason: OfflineReason) -> ProtoOfflineReason {
    match reason {
        OfflineReason::Stopped => ProtoOfflineReason::Stopped,
        OfflineReason::Quiesced => ProtoOfflineReason::Quiesced,
        OfflineReason::Watchdog => ProtoOfflineReason::Watchdog,
    }
}

pub fn offline_reason_from_proto(reason: i32) -> Option<OfflineReason> {
    match ProtoOfflineReason::try_from(reason) {
        Ok(ProtoOfflineReason::Stopped) => Some(OfflineReason::Stopped),
        Ok(ProtoOfflineReason::Quiesced) => Some(OfflineReason::Quiesced),
        Ok(ProtoOfflineReason::Watchdog) => Some(OfflineReason::Watchdog),
        _ => None,
    }
}

pub fn status_response(machine: &Machine) -> MachineStatusResponse {
    MachineStatusResponse {
        hostname: machine.hostname.clone(),
        state: state_to_proto(machine.state()) as i32,
        running_jobs: u32::try_from(machine.running_jobs()).unwrap_or(u32::MAX),
        capacity: u32::try_from(machine.capacity()).unwrap_or(u32::MAX),
        heartbeat_ms: machine
            .heartbeat()
            .map(|t| t.timestamp_millis())
            .unwrap_or(0),
        created_at_ms: machine.date_created.timestamp_millis(),
    }
}

#[tonic::async_trait]
impl MachineService for MachineServiceImpl {
    async fn get_machine_status(
        &self,
        _request: Request<GetMachineStatusRequest>,
    ) -> Result<Response<MachineStatusResponse>, Status> {
        let machine = self.machine.read().await;
        Ok(Response::new(status_response(&machine)))
    }

    async fn set_online(
        &self,
        _request: Request<SetOnlineRequest>,
    ) -> Result<Response<MachineStatusResponse>, Status> {
        let mut machine = self.machine.write().await;
        machine.set_online();
        Ok(Response::new(status_response(&machine)))
    }

    async fn set_offline(
        &self,
        request: Request<SetOfflineRequest>,
    ) -> Result<Response<MachineStatusResponse>, Status> {
        let req = request.into_inner();
        let reason = offline_reason_from_proto(req.reason)
            .ok_or_else(|| Status::invalid_argument("Offline reason is required"))?;

        let mut machine = self.machine.write().await;
        machine.set_offline(reason);
        Ok(Response::new(status_response(&machine)))
    }

    async fn set_quiescing(
        &self,
        request: Request<SetQuiescingRequest>,
    ) -> Result<Response<MachineStatusResponse>, Status> {
        let req = request.into_inner();
        if req.requested_by.trim().is_empty() {
            return Err(Status::invalid_argument("Requester cannot be empty"));
        }

        let mut machine = self.machine.write().await;
        machine
            .set_quiescing(&req.requested_by, &req.message)
            .map_err(|e| Status::failed_precondition(e.to_string()))?;
        Ok(Response::new(status_response(&machine)))
    }

    async fn should_accept_new_job(
        &self,
        _request: Request<ShouldAcceptNewJobRequest>,
    ) -> Result<Response<ShouldAcceptNewJobResponse>, Status> {
        let machine = self.machine.read().await;
        Ok(Response::new(ShouldAcceptNewJobResponse {
            accept: machine.should_accept_new_job(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_reason_round_trips_through_proto() {
        for reason in [
            OfflineReason::Stopped,
            OfflineReason::Quiesced,
            OfflineReason::Watchdog,
        ] {
            let wire = offline_reason_to_proto(reason) as i32;
            assert_eq!(offline_reason_from_proto(wire), Some(reason));
        }
    }

    #[test]
    fn unspecified_reason_is_rejected() {
        assert_eq!(
            offline_reason_from_proto(ProtoOfflineReason::Unspecified as i32),
            None
        );
        assert_eq!(offline_reason_from_proto(42), None);
    }

    #[test]
    fn status_response_reflects_machine() {
        let mut machine = Machine::new("importer-1", 3);
        machine.set_online();
        assert!(machine.reserve_slot());

        let resp = status_response(&machine);
        assert_eq!(resp.hostname, "importer-1");
        assert_eq!(resp.state, ProtoMachineState::Online as i32);
        assert_eq!(resp.running_jobs, 1);
        assert_eq!(resp.capacity, 3);
        assert_eq!(resp.heartbeat_ms, 0);
    }

    #[cfg(target_pointer_width = "64")]
    #[test]
    fn status_response_saturates_huge_capacity() {
        let machine = Machine::new("importer-big", u32::MAX as usize + 10);
        assert_eq!(status_response(&machine).capacity, u32::MAX);
    }
}
