use std::net::SocketAddr;

use anyhow::Context;
use axum::{
    Router,
    routing::{get, post},
};
use tokio::net::TcpListener;
use tokio::sync::watch;

use super::handlers;
use super::types::AppState;

pub struct ControlPlaneServer {
    state: AppState,
    bind_addr: SocketAddr,
}

impl ControlPlaneServer {
    pub fn new(state: AppState) -> Self {
        let bind_addr = state.config.bind_addr;
        Self { state, bind_addr }
    }

    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/tasks", get(handlers::list_tasks))
            .route("/tasks/{id}", get(handlers::get_task))
            .route("/servers", get(handlers::list_servers))
            .route("/servers/{id}", get(handlers::get_server))
            .route("/workers", get(handlers::list_workers))
            .route("/workers/{id}", get(handlers::get_worker))
            .route(
                "/workers-groups",
                get(handlers::list_groups).post(handlers::create_group),
            )
            .route(
                "/workers-groups/{id}",
                get(handlers::get_group)
                    .put(handlers::update_group)
                    .delete(handlers::delete_group),
            )
            .route(
                "/workers-groups/{id}/remove-worker",
                post(handlers::remove_group_worker),
            )
            .route(
                "/haproxy-configs",
                get(handlers::list_haproxy_configs).post(handlers::create_haproxy_config),
            )
            .route(
                "/haproxy-configs/{id}",
                get(handlers::get_haproxy_config)
                    .put(handlers::update_haproxy_config)
                    .delete(handlers::delete_haproxy_config),
            )
            .route("/worker/claimable", post(handlers::claimable))
            .route("/worker/tasks/{id}/claim", post(handlers::claim_task))
            .route("/worker/tasks/{id}/start", post(handlers::start_task))
            .route("/worker/tasks/{id}/heartbeat", post(handlers::heartbeat_task))
            .route("/worker/tasks/{id}/complete", post(handlers::complete_task))
            .route("/worker/tasks/{id}/fail", post(handlers::fail_task))
            .fallback(handlers::not_found)
            .with_state(state)
    }

    /// Serves until `shutdown` flips to `true`, then drains in-flight
    /// requests.
    pub async fn start_server(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let app = Self::router(self.state);

        let listener = TcpListener::bind(self.bind_addr)
            .await
            .with_context(|| format!("failed to bind {}", self.bind_addr))?;
        tracing::info!("Control plane listening on {}", self.bind_addr);

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown.wait_for(|stop| *stop).await;
            })
            .await
            .context("HTTP server error")?;

        tracing::info!("Control plane stopped");
        Ok(())
    }
}
