//! Operator-facing HTTP surface: health and Prometheus metrics.
//!
//! Consumed by operators and scrapers, not by agents or clients; none
//! of this participates in the hub's protocol state machine.

use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use axum::{Json, Router, extract::State, routing::get};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use corral_protocol::types::AgentSummary;

/// Errors from the ops server.
#[derive(Debug, thiserror::Error)]
pub enum OpsError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to install metrics recorder: {0}")]
    Recorder(String),
}

/// Installs the global Prometheus recorder.
///
/// Call once at startup, before any metric macros fire.
pub fn install_metrics_recorder() -> Result<PrometheusHandle, OpsError> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| OpsError::Recorder(e.to_string()))
}

/// Installs the global recorder, or returns a detached handle when one
/// is already installed (second hub instance in the same process).
pub fn recorder_handle() -> PrometheusHandle {
    match install_metrics_recorder() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::debug!("metrics recorder already installed: {e}");
            PrometheusBuilder::new().build_recorder().handle()
        }
    }
}

/// A boxed future returned by [`HealthSource`] methods.
pub type HealthFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Live counts the health endpoint reports.
pub trait HealthSource: Send + Sync + 'static {
    fn agents(&self) -> HealthFuture<'_, Vec<AgentSummary>>;
    fn tasks_pending(&self) -> HealthFuture<'_, usize>;
    fn connections(&self) -> HealthFuture<'_, usize>;
}

/// Body of `GET /healthz`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    pub status: &'static str,
    pub agents_online: usize,
    pub tasks_pending: usize,
    pub connections: usize,
    pub agents: Vec<AgentSummary>,
}

struct AppState {
    source: Arc<dyn HealthSource>,
    prometheus: PrometheusHandle,
}

/// Builds the ops router.
pub fn app(source: Arc<dyn HealthSource>, prometheus: PrometheusHandle) -> Router {
    let state = Arc::new(AppState { source, prometheus });
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_exposition))
        .with_state(state)
}

/// Serves the ops endpoints until cancellation.
pub async fn serve(
    addr: SocketAddr,
    source: Arc<dyn HealthSource>,
    prometheus: PrometheusHandle,
    cancel: CancellationToken,
) -> Result<(), OpsError> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    let local = listener.local_addr()?;
    tracing::info!("ops surface listening on {local}");

    axum::serve(listener, app(source, prometheus))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

async fn healthz(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let agents = state.source.agents().await;
    let agents_online = agents
        .iter()
        .filter(|a| a.status != corral_protocol::types::AgentStatus::Offline)
        .count();
    Json(HealthResponse {
        status: "ok",
        agents_online,
        tasks_pending: state.source.tasks_pending().await,
        connections: state.source.connections().await,
        agents,
    })
}

async fn metrics_exposition(State(state): State<Arc<AppState>>) -> String {
    state.prometheus.render()
}

#[cfg(test)]
mod tests {
    use super::*;
    use corral_protocol::types::AgentStatus;

    struct FakeSource;

    impl HealthSource for FakeSource {
        fn agents(&self) -> HealthFuture<'_, Vec<AgentSummary>> {
            Box::pin(async {
                vec![
                    AgentSummary {
                        agent_id: "a1".into(),
                        agent_type: "worker".into(),
                        status: AgentStatus::Online,
                        capabilities: vec!["echo".into()],
                        current_load: 1,
                        weight: 1,
                    },
                    AgentSummary {
                        agent_id: "a2".into(),
                        agent_type: "worker".into(),
                        status: AgentStatus::Offline,
                        capabilities: vec![],
                        current_load: 0,
                        weight: 1,
                    },
                ]
            })
        }

        fn tasks_pending(&self) -> HealthFuture<'_, usize> {
            Box::pin(async { 3 })
        }

        fn connections(&self) -> HealthFuture<'_, usize> {
            Box::pin(async { 2 })
        }
    }

    #[tokio::test]
    async fn healthz_counts_only_live_agents() {
        let state = Arc::new(AppState {
            source: Arc::new(FakeSource),
            prometheus: PrometheusBuilder::new().build_recorder().handle(),
        });
        let Json(body) = healthz(State(state)).await;
        assert_eq!(body.status, "ok");
        assert_eq!(body.agents_online, 1);
        assert_eq!(body.tasks_pending, 3);
        assert_eq!(body.connections, 2);
        assert_eq!(body.agents.len(), 2);
    }

    #[test]
    fn health_response_serializes_camel_case() {
        let body = HealthResponse {
            status: "ok",
            agents_online: 1,
            tasks_pending: 0,
            connections: 4,
            agents: vec![],
        };
        let json = serde_json::to_string(&body).unwrap();
        assert!(json.contains("\"agentsOnline\":1"));
        assert!(json.contains("\"tasksPending\":0"));
    }
}
