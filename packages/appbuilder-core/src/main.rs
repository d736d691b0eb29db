use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use appbuilder_core::agent::mock::ScriptedFactory;
use appbuilder_core::agent::{SubprocessFactory, TransportFactory};
use appbuilder_core::config::{RuntimeConfig, SandboxMode};
use appbuilder_core::connection::ConnectionManager;
use appbuilder_core::router::{build_router, AppState};

#[derive(Parser, Debug)]
#[command(name = "appbuilderd")]
#[command(about = "Orchestration daemon for the AI app builder", version)]
struct Cli {
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// `local` runs the reasoning model as a subprocess against the local
    /// filesystem sandbox; `mock` uses the scripted transport.
    #[arg(long, env = "SANDBOX_MODE", default_value = "local")]
    sandbox_mode: String,

    /// API key handed to the model subprocess. Required in local mode.
    #[arg(long, env = "MODEL_API_KEY")]
    model_api_key: Option<String>,

    /// Reasoning-model command line, whitespace-separated.
    #[arg(long, env = "MODEL_COMMAND")]
    model_command: Option<String>,

    /// Root directory for per-session workspaces.
    #[arg(long, env = "WORKSPACE_ROOT")]
    workspace_root: Option<PathBuf>,

    /// Project scaffold copied into every fresh workspace.
    #[arg(long)]
    scaffold_dir: Option<PathBuf>,

    /// Curated component library injected as `curated/`.
    #[arg(long)]
    curated_dir: Option<PathBuf>,

    /// Public base used to derive preview URLs.
    #[arg(long, default_value = "http://localhost")]
    preview_base: String,

    /// Dev-server command; `$PORT` is replaced with the allocated port.
    #[arg(long)]
    dev_server_command: Option<String>,

    /// KEY=VALUE pairs written to `.env.local` and exported to the sandbox.
    #[arg(long = "preview-env")]
    preview_env: Vec<String>,

    #[arg(long)]
    turn_timeout_secs: Option<u64>,

    #[arg(long)]
    cleanup_grace_secs: Option<u64>,

    /// Delete workspace directories on session teardown.
    #[arg(long)]
    remove_workspaces: bool,

    /// Include the data-platform exploration preamble in the system prompt.
    #[arg(long)]
    data_platform: bool,

    /// Origins allowed to reach the HTTP/WebSocket surface. Empty means any.
    #[arg(long = "cors-allow-origin")]
    cors_allow_origin: Vec<String>,
}

fn build_cors_layer(cli: &Cli) -> Result<tower_http::cors::CorsLayer, appbuilder_error::BuilderError> {
    use tower_http::cors::{Any, CorsLayer};

    let mut cors = CorsLayer::new()
        .allow_methods(Any)
        .allow_headers(Any);
    if cli.cors_allow_origin.is_empty() {
        cors = cors.allow_origin(Any);
    } else {
        let mut origins = Vec::new();
        for origin in &cli.cors_allow_origin {
            let value = origin
                .parse()
                .map_err(|_| appbuilder_error::BuilderError::Init {
                    message: format!("invalid cors origin: {origin}"),
                })?;
            origins.push(value);
        }
        cors = cors.allow_origin(origins);
    }
    Ok(cors)
}

fn build_config(cli: &Cli) -> Result<RuntimeConfig, appbuilder_error::BuilderError> {
    let workspace_root = cli
        .workspace_root
        .clone()
        .unwrap_or_else(|| std::env::temp_dir().join("app-builder"));
    let mut config = RuntimeConfig::new(workspace_root);
    config.sandbox_mode = cli.sandbox_mode.parse::<SandboxMode>()?;
    config.model_api_key = cli.model_api_key.clone();
    if let Some(command) = &cli.model_command {
        config.model_command = command.split_whitespace().map(str::to_string).collect();
    }
    config.scaffold_dir = cli.scaffold_dir.clone();
    config.curated_dir = cli.curated_dir.clone();
    config.preview_base = cli.preview_base.clone();
    if let Some(command) = &cli.dev_server_command {
        config.dev_server_command = command.clone();
    }
    for pair in &cli.preview_env {
        let Some((key, value)) = pair.split_once('=') else {
            return Err(appbuilder_error::BuilderError::Init {
                message: format!("invalid --preview-env entry (expected KEY=VALUE): {pair}"),
            });
        };
        config
            .preview_env
            .push((key.to_string(), value.to_string()));
    }
    if let Some(secs) = cli.turn_timeout_secs {
        config.turn_timeout = Duration::from_secs(secs);
    }
    if let Some(secs) = cli.cleanup_grace_secs {
        config.cleanup_grace = Duration::from_secs(secs);
    }
    config.remove_workspaces = cli.remove_workspaces;
    config.data_platform = cli.data_platform;
    config.validate()?;
    Ok(config)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };

    let factory: Arc<dyn TransportFactory> = match config.sandbox_mode {
        SandboxMode::Local => Arc::new(SubprocessFactory),
        SandboxMode::Mock => Arc::new(ScriptedFactory::default()),
    };
    let manager = Arc::new(ConnectionManager::new(config, factory));
    let state = AppState {
        manager: manager.clone(),
    };
    let cors = match build_cors_layer(&cli) {
        Ok(cors) => cors,
        Err(err) => {
            eprintln!("configuration error: {err}");
            std::process::exit(1);
        }
    };
    let router = build_router(state).layer(cors);

    let addr = format!("{}:{}", cli.host, cli.port);
    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            eprintln!("failed to start runtime: {err}");
            std::process::exit(1);
        }
    };

    let result = runtime.block_on(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        tracing::info!(addr = %addr, "appbuilderd listening");
        let serve = axum::serve(listener, router);
        let shutdown_manager = manager.clone();
        serve
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                tracing::info!("shutting down; tearing sessions down");
                shutdown_manager.shutdown().await;
            })
            .await
    });

    if let Err(err) = result {
        eprintln!("server error: {err}");
        std::process::exit(1);
    }
}
