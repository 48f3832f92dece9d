//! HTTP status endpoint: exposes node state as JSON.

use std::net::SocketAddr;

use axum::routing::get;
use axum::{extract::State, Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;

use camlink_core::{DeviceRole, NodeIdentity};
use camlink_services::StreamStatus;

#[derive(Clone)]
pub struct StatusState {
    pub identity: NodeIdentity,
    pub role: DeviceRole,
    pub peer: Option<NodeIdentity>,
    pub collector: SocketAddr,
    pub status_rx: watch::Receiver<StreamStatus>,
}

#[derive(Serialize)]
pub struct StatusResponse {
    pub identity: NodeIdentity,
    pub role: DeviceRole,
    pub peer: Option<NodeIdentity>,
    pub collector: String,
    pub remote_port: u16,
    #[serde(flatten)]
    pub stream: StreamStatus,
}

async fn handle_status(State(state): State<StatusState>) -> Json<StatusResponse> {
    let stream = state.status_rx.borrow().clone();
    Json(StatusResponse {
        identity: state.identity,
        role: state.role,
        peer: state.peer,
        collector: state.collector.to_string(),
        remote_port: state.collector.port(),
        stream,
    })
}

pub fn router(state: StatusState) -> Router {
    Router::new()
        .route("/status", get(handle_status))
        .with_state(state)
}

pub async fn serve(state: StatusState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(format!("127.0.0.1:{}", port)).await?;
    tracing::info!(port, "status endpoint listening");
    axum::serve(listener, router(state)).await?;
    Ok(())
}
