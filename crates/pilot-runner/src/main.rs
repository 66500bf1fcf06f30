use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pilot_core::agent::coordinator::spawn_heartbeat_emitter;
use pilot_core::agent::{CoordinatorConfig, LoopCoordinator};
use pilot_core::config::Config;
use pilot_core::frame::FrameSource;
use pilot_core::model::{ChatCompletionsClient, ChatCompletionsConfig};
use pilot_core::store::{MemoryBlobStore, MemoryKv};
use pilot_gateway::AppState;

mod emulator;

use emulator::RemoteFrameSource;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    // Defaults from environment variables, then `--flag value` overrides.
    let mut config = Config::from_env();
    apply_cli_overrides(std::env::args().skip(1), &mut config)?;

    if config.kv_url.is_some() {
        // The KvStore trait is the seam for a hosted backend; this
        // process ships with the in-memory store only.
        warn!("PILOT_KV_URL is set but no remote kv driver is built in; using the in-memory store");
    }
    if config.model_api_key.is_none() {
        warn!("PILOT_MODEL_API_KEY is not set; model calls will be rejected by the provider");
    }

    let kv = Arc::new(MemoryKv::new());
    let blob = Arc::new(MemoryBlobStore::new());
    let model = Arc::new(ChatCompletionsClient::new(ChatCompletionsConfig {
        endpoint: config.model_endpoint.clone(),
        api_key: config.model_api_key.clone().unwrap_or_default(),
    }));

    let state = AppState::new(kv.clone(), blob.clone(), model.clone());

    // With an emulator attached, host an autonomous loop: its task owns
    // capture, input execution, and the checkpoint cadence; the HTTP
    // routes reach it through the registry.
    if let Some(addr) = config.emulator_addr.clone() {
        let agent_id = config
            .agent_id
            .clone()
            .unwrap_or_else(|| "agent-1".to_string());
        let frames: Arc<dyn FrameSource> = Arc::new(RemoteFrameSource::connect(&addr).await?);
        let (coordinator, cancel) = LoopCoordinator::new(
            agent_id.clone(),
            config.agent_model.clone(),
            model.clone(),
            kv.clone(),
            blob.clone(),
            CoordinatorConfig::default(),
            Utc::now(),
        );
        let client = coordinator.spawn(cancel, Some(frames));
        spawn_heartbeat_emitter(kv.clone(), agent_id.clone(), client.cancel.token());
        state.register(&agent_id, client).await;
        info!(agent_id = %agent_id, emulator = %addr, model = %config.agent_model, "autonomous loop attached");
    }

    let addr: SocketAddr = config
        .listen_addr
        .parse()
        .with_context(|| format!("invalid listen address: {}", config.listen_addr))?;
    info!(addr = %addr, model_endpoint = %config.model_endpoint, "starting gateway");

    pilot_gateway::serve(addr, state).await
}

fn apply_cli_overrides(
    args: impl IntoIterator<Item = String>,
    config: &mut Config,
) -> anyhow::Result<()> {
    let mut it = args.into_iter();
    while let Some(arg) = it.next() {
        if !arg.starts_with("--") {
            eprintln!("Unexpected positional argument: {}", arg);
            continue;
        }

        let flag = arg.trim_start_matches("--");
        let Some(val) = it.next() else {
            anyhow::bail!("Expected value after flag: --{flag}");
        };

        match flag {
            "listen-addr" => config.listen_addr = val,
            "model-endpoint" => config.model_endpoint = val,
            "model-api-key" => config.model_api_key = Some(val),
            "kv-url" => config.kv_url = Some(val),
            "kv-token" => config.kv_token = Some(val),
            "blob-token" => config.blob_token = Some(val),
            "emulator-addr" => config.emulator_addr = Some(val),
            "agent-id" => config.agent_id = Some(val),
            "agent-model" => config.agent_model = val,
            _ => eprintln!("Unknown flag: --{}", flag),
        }
    }

    Ok(())
}
