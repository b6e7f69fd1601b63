//! Process entry point: loads configuration, starts the dispatcher, and
//! serves both the TCP event provider and the admin HTTP API until killed.

use std::sync::Arc;

use bangarang::config::{self, CONFIG_PATH_ENV};
use bangarang::index::{FileIndex, InMemoryIndex, SharedIndex};
use bangarang::{AppConfig, Pipeline};
use bangarang_streaming::env_vars::{
    env_string, env_string_or_default, env_u16_or_default, ADMIN_BIND_ADDR, TCP_BIND_ADDR, TCP_CODEC,
    TCP_PORT,
};
use bangarang_streaming::tcp::Codec;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = match config::configured_path() {
        Some(path) => match config::load(&path).await {
            Ok(cfg) => {
                info!(path = %path.display(), "loaded configuration");
                cfg
            }
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to load configuration at startup");
                std::process::exit(1);
            }
        },
        None => {
            warn!(env = CONFIG_PATH_ENV, "no config file configured; starting with defaults");
            AppConfig::default()
        }
    };

    let index: SharedIndex = match &config.escalations_dir {
        Some(dir) => Arc::new(
            FileIndex::open(dir.join("incidents.json"))
                .await
                .map_err(|e| format!("opening incident index: {e}"))?,
        ),
        None => Arc::new(InMemoryIndex::new()),
    };

    let (pipeline, dispatcher_handle) = Pipeline::spawn(config, index)?;

    if let Some(path) = config::configured_path() {
        let (_watcher, mut reloads) = config::watch(path)?;
        let pipeline = pipeline.clone();
        tokio::spawn(async move {
            while let Some(new_config) = reloads.recv().await {
                if let Err(e) = pipeline.refresh(new_config).await {
                    warn!(error = %e, "rejected hot-reloaded configuration");
                }
            }
        });
    }

    let tcp_bind = format!(
        "{}:{}",
        env_string_or_default(TCP_BIND_ADDR, "0.0.0.0"),
        env_u16_or_default(TCP_PORT, 5555),
    );
    let tcp_codec = Codec::parse(&env_string_or_default(TCP_CODEC, "json"));
    let tcp_pipeline = pipeline.clone();
    tokio::spawn(async move {
        if let Err(e) = bangarang_streaming::tcp::serve(&tcp_bind, tcp_codec, tcp_pipeline).await {
            error!(error = %e, "tcp provider stopped");
        }
    });

    let admin_port = pipeline.view_config().api_port;
    let admin_bind = format!(
        "{}:{}",
        env_string(ADMIN_BIND_ADDR).unwrap_or_else(|| "0.0.0.0".to_string()),
        admin_port
    );
    let admin_app = bangarang_streaming::admin::router(pipeline).layer(TraceLayer::new_for_http());
    let admin_listener = tokio::net::TcpListener::bind(&admin_bind).await?;
    info!(%admin_bind, "admin api listening");

    tokio::select! {
        result = axum::serve(admin_listener, admin_app) => {
            if let Err(e) = result {
                error!(error = %e, "admin api server stopped");
            }
        }
        _ = dispatcher_handle => {
            warn!("dispatcher task exited");
        }
    }

    Ok(())
}
