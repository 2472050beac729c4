//! Mount Point Endpoints
//!
//! Read-only view of this member's mount points.

use super::AppState;
use crate::mount::{MountStats, MountSummary};
use crate::version::BuildInfo;
use axum::{extract::State, Json};
use fleetmount_core::MemberId;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct MountsResponse {
    pub member: MemberId,
    pub contexts: usize,
    pub stats: MountStats,
    pub mounts: Vec<MountSummary>,
}

/// GET /mounts
#[tracing::instrument(skip(state))]
pub async fn list_mounts(State(state): State<AppState>) -> Json<MountsResponse> {
    Json(MountsResponse {
        member: state.member.clone(),
        contexts: state.topology.context_count(),
        stats: state.mount_points.stats(),
        mounts: state.mount_points.list(),
    })
}

/// GET /version
pub async fn get_version() -> Json<BuildInfo> {
    Json(BuildInfo::current())
}
