use std::sync::Arc;

use axum::{extract::State, Json};
use serde::Serialize;

use crate::net::registry::ConnectionSnapshot;
use crate::net::LinkContext;
use crate::net::LinkReport;
use crate::pool::{ThreadCounts, ThreadLimits};

#[derive(Serialize)]
pub struct SystemStatus {
    pub version: &'static str,
    pub status: &'static str,
    #[serde(flatten)]
    pub report: LinkReport,
}

#[derive(Serialize)]
pub struct ThreadStatus {
    pub counts: ThreadCounts,
    pub total: usize,
    pub limits: ThreadLimits,
    pub queued: usize,
}

pub async fn get_status(State(ctx): State<Arc<LinkContext>>) -> Json<SystemStatus> {
    let status = if ctx.pool().is_shutdown() {
        "draining"
    } else {
        "operational"
    };
    Json(SystemStatus {
        version: env!("CARGO_PKG_VERSION"),
        status,
        report: ctx.report(),
    })
}

pub async fn get_threads(State(ctx): State<Arc<LinkContext>>) -> Json<ThreadStatus> {
    let launcher = ctx.launcher();
    let counts = launcher.counts();
    Json(ThreadStatus {
        counts,
        total: counts.total(),
        limits: launcher.limits(),
        queued: ctx.pool().queued(),
    })
}

pub async fn get_connections(
    State(ctx): State<Arc<LinkContext>>,
) -> Json<Vec<ConnectionSnapshot>> {
    Json(ctx.registry().snapshots())
}
