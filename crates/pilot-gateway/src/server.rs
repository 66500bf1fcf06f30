//! Router, shared state, and the per-agent registry. Every agent is
//! owned by its own spawned task; the registry map holds only the
//! client handles used to reach those tasks, never agent state.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use chrono::Utc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tracing::info;

use pilot_core::agent::{AgentClient, CoordinatorConfig, LoopCoordinator};
use pilot_core::model::ModelClient;
use pilot_core::store::{BlobStore, KvStore};

use crate::routes;

#[derive(Clone)]
pub struct AppState {
    pub kv: Arc<dyn KvStore>,
    pub blob: Arc<dyn BlobStore>,
    pub model: Arc<dyn ModelClient>,
    agents: Arc<Mutex<HashMap<String, AgentClient>>>,
}

impl AppState {
    pub fn new(
        kv: Arc<dyn KvStore>,
        blob: Arc<dyn BlobStore>,
        model: Arc<dyn ModelClient>,
    ) -> Self {
        Self {
            kv,
            blob,
            model,
            agents: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Returns the agent's client, spawning its owning task on first
    /// use. HTTP-driven agents carry no frame source; the client
    /// captures frames and executes inputs itself.
    pub async fn client(&self, agent_id: &str, model_id: &str) -> AgentClient {
        let mut agents = self.agents.lock().await;
        if let Some(client) = agents.get(agent_id) {
            return client.clone();
        }
        let (coordinator, cancel) = LoopCoordinator::new(
            agent_id,
            model_id,
            self.model.clone(),
            self.kv.clone(),
            self.blob.clone(),
            CoordinatorConfig::default(),
            Utc::now(),
        );
        let client = coordinator.spawn(cancel, None);
        agents.insert(agent_id.to_string(), client.clone());
        info!(agent_id = %agent_id, model_id = %model_id, "agent task spawned");
        client
    }

    pub async fn existing(&self, agent_id: &str) -> Option<AgentClient> {
        self.agents.lock().await.get(agent_id).cloned()
    }

    /// Registers an agent spawned elsewhere (e.g. the autonomous loop
    /// the runner attaches to an emulator) so the control and asset
    /// routes reach it.
    pub async fn register(&self, agent_id: &str, client: AgentClient) {
        self.agents
            .lock()
            .await
            .insert(agent_id.to_string(), client);
        info!(agent_id = %agent_id, "agent registered");
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route(
            "/api/agent/decide",
            post(routes::decide::post_decide).get(routes::decide::get_agent),
        )
        .route(
            "/api/agent/{id}/heartbeat",
            post(routes::control::post_heartbeat).get(routes::control::get_heartbeat),
        )
        .route(
            "/api/agent/{id}/state",
            get(routes::control::get_state)
                .post(routes::control::put_state)
                .delete(routes::control::delete_state),
        )
        .route("/api/agent/{id}/pause", post(routes::control::post_pause))
        .route("/api/agent/{id}/resume", post(routes::control::post_resume))
        .route("/api/agent/{id}/reset", post(routes::control::post_reset))
        .route(
            "/api/agent/{id}/save-state",
            post(routes::assets::post_save_state),
        )
        .route(
            "/api/agent/{id}/frames",
            get(routes::assets::get_frames).post(routes::assets::post_frames),
        )
        .route(
            "/api/agent/{id}/memstash",
            get(routes::assets::get_memstash).delete(routes::assets::delete_memstash),
        )
        .route(
            "/api/agent/{id}/parse-state",
            get(routes::assets::get_parse_state),
        )
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = TcpListener::bind(addr).await?;
    info!(addr = %addr, "gateway listening");
    axum::serve(listener, app).await?;
    Ok(())
}
