//! HTTP surface: health, readiness, converge status, metrics and the
//! values debug endpoints.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use bosun_modules::ModuleManager;
use bosun_queue::TaskQueueSet;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::converge::{converge_task_count, ConvergeState};
use crate::metrics;
use crate::releases::ReleaseMonitors;

#[derive(Clone)]
pub struct ServerState {
    pub converge: Arc<ConvergeState>,
    pub queues: Arc<TaskQueueSet>,
    pub module_manager: Arc<ModuleManager>,
    pub release_monitors: Arc<ReleaseMonitors>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ready", get(ready))
        .route("/status/converge", get(converge_status))
        .route("/metrics", get(scrape))
        .route("/global/values.json", get(global_values))
        .route("/global/config.json", get(global_config))
        .route("/module/list.json", get(module_list))
        .route("/module/resource-monitor.json", get(resource_monitors))
        .route("/module/:name/values.json", get(module_values))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: ServerState, stop: CancellationToken) -> Result<()> {
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {}", addr))?;
    info!(addr = %addr, "http server listening");
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { stop.cancelled().await })
        .await
        .context("http server")?;
    Ok(())
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ready(State(state): State<ServerState>) -> impl IntoResponse {
    if state.converge.startup_converge_done() {
        (StatusCode::OK, "Startup converge done.\n")
    } else {
        (StatusCode::INTERNAL_SERVER_ERROR, "Startup converge in progress\n")
    }
}

async fn converge_status(State(state): State<ServerState>) -> String {
    let converge_tasks = state
        .queues
        .get_main()
        .map(|q| converge_task_count(&q))
        .unwrap_or(0);

    let mut lines: Vec<String> = Vec::new();
    if state.converge.startup_converge_done() {
        lines.push("STARTUP_CONVERGE_DONE".to_string());
        if converge_tasks > 0 {
            lines.push(format!("CONVERGE_IN_PROGRESS: {} tasks", converge_tasks));
        } else {
            lines.push("CONVERGE_WAIT_TASK".to_string());
        }
    } else if state.converge.startup_converge_started() {
        if converge_tasks > 0 {
            lines.push(format!("STARTUP_CONVERGE_IN_PROGRESS: {} tasks", converge_tasks));
        } else {
            lines.push("STARTUP_CONVERGE_DONE".to_string());
        }
    } else {
        lines.push("STARTUP_CONVERGE_WAIT_TASKS".to_string());
    }
    lines.join("\n") + "\n"
}

async fn scrape() -> String {
    metrics::render()
}

async fn global_values(State(state): State<ServerState>) -> Json<serde_json::Value> {
    Json(state.module_manager.global_values().as_value())
}

async fn global_config(State(state): State<ServerState>) -> Json<serde_json::Value> {
    Json(state.module_manager.global_config_values().as_value())
}

async fn module_list(State(state): State<ServerState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "modules": state.module_manager.get_module_names_in_order(),
        "enabled": state.module_manager.enabled_modules(),
    }))
}

async fn resource_monitors(State(state): State<ServerState>) -> Json<serde_json::Value> {
    let mut dump = serde_json::Map::new();
    for module in state.module_manager.get_module_names_in_order() {
        let value = if state.release_monitors.has_monitor(&module) {
            serde_json::json!(state.release_monitors.manifest_ids(&module))
        } else {
            serde_json::Value::String("No monitor".to_string())
        };
        dump.insert(module, value);
    }
    Json(serde_json::Value::Object(dump))
}

async fn module_values(
    State(state): State<ServerState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    if !state.module_manager.get_module_names_in_order().contains(&name) {
        return (StatusCode::NOT_FOUND, "Module not found".to_string()).into_response();
    }
    Json(state.module_manager.module_values(&name).as_value()).into_response()
}
