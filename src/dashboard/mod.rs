use std::net::SocketAddr;
use std::sync::Arc;

use axum::{extract::State, response::IntoResponse, routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};

use crate::machine::{Machine, MachineEvent};
use crate::node::ActiveJobs;

const RECENT_EVENTS: usize = 20;

#[derive(Clone)]
pub struct DashboardState {
    pub machine: Arc<RwLock<Machine>>,
    pub active_jobs: ActiveJobs,
}

#[derive(Serialize)]
struct MachineResponse {
    hostname: String,
    state: String,
    accepting_jobs: bool,
    running_jobs: usize,
    capacity: usize,
    heartbeat: Option<DateTime<Utc>>,
    date_created: DateTime<Utc>,
    recent_events: Vec<MachineEvent>,
}

#[derive(Serialize)]
struct ActiveJobResponse {
    job_id: String,
    started_at: DateTime<Utc>,
}

pub fn router(state: DashboardState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/machine", get(machine_handler))
        .route("/api/jobs", get(list_jobs_handler))
        .layer(cors)
        .with_state(state)
}

pub async fn run_dashboard(addr: SocketAddr, state: DashboardState) {
    let app = router(state);

    tracing::info!(addr = %addr, "Starting dashboard server");

    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(listener) => listener,
        Err(e) => {
            tracing::error!(addr = %addr, error = %e, "Failed to bind dashboard server");
            return;
        }
    };

    if let Err(e) = axum::serve(listener, app).await {
        tracing::error!(error = %e, "Dashboard server failed");
    }
}

async fn machine_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let machine = state.machine.read().await;
    let events: Vec<MachineEvent> = machine.events().cloned().collect();
    let skip = events.len().saturating_sub(RECENT_EVENTS);

    Json(MachineResponse {
        hostname: machine.hostname.clone(),
        state: machine.state().to_string(),
        accepting_jobs: machine.should_accept_new_job(),
        running_jobs: machine.running_jobs(),
        capacity: machine.capacity(),
        heartbeat: machine.heartbeat(),
        date_created: machine.date_created,
        recent_events: events.into_iter().skip(skip).collect(),
    })
}

async fn list_jobs_handler(State(state): State<DashboardState>) -> impl IntoResponse {
    let active = state.active_jobs.read().await;
    let mut jobs: Vec<ActiveJobResponse> = active
        .iter()
        .map(|(job_id, started_at)| ActiveJobResponse {
            job_id: job_id.to_string(),
            started_at: *started_at,
        })
        .collect();
    jobs.sort_by_key(|j| j.started_at);

    Json(jobs)
}
