//! Daemon entry point (`spec.md` §6): parses the CLI surface, bootstraps
//! the container, performs the upstream gateway handshake if configured
//! (boot-fatal on failure), and serves the TCP control surface.

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use fleetcore_sdk::gateway::{self, GatewayIdentity};
use fleetcore_sdk::{BootstrapOptions, Container, ControlSurface};

#[derive(Parser)]
#[command(name = "fleetcore-server")]
#[command(about = "Coordination daemon: agent/session store, message broker, turn manager, and control surface", long_about = None)]
#[command(version)]
struct Cli {
    /// Project root this daemon coordinates (`spec.md` §3).
    #[arg(long, env = "FLEETCORE_PROJECT_ROOT", default_value = ".")]
    project_root: PathBuf,

    /// Host:port the control surface listens on.
    #[arg(long, env = "FLEETCORE_CONTROL_ADDR", default_value = "127.0.0.1:4287")]
    control_addr: String,

    /// File holding the control surface's bearer token. Without this, an
    /// ephemeral token is generated and logged once at startup.
    #[arg(long, env = "FLEETCORE_TOKEN_FILE")]
    token_file: Option<PathBuf>,

    /// Path to the LLM-CLI binary the turn manager drives.
    #[arg(long, env = "FLEETCORE_LLM_CLI", default_value = "llm-cli")]
    llm_cli_binary: PathBuf,

    /// Upstream gateway host:port. If set, the daemon performs the
    /// challenge/nonce handshake at boot and exits non-zero on failure
    /// (`spec.md` §6).
    #[arg(long, env = "FLEETCORE_GATEWAY_ADDR")]
    gateway_addr: Option<String>,

    /// Path to this device's persisted ed25519 signing key.
    #[arg(long, env = "FLEETCORE_GATEWAY_KEY", default_value = "gateway.key")]
    gateway_key: PathBuf,

    /// Triage model HTTPS endpoint (`spec.md` §4.4 Stage 1). Omitted means
    /// triage falls back to a one-shot LLM-CLI query.
    #[arg(long, env = "FLEETCORE_TRIAGE_ENDPOINT")]
    triage_endpoint: Option<String>,

    #[arg(long, env = "FLEETCORE_TRIAGE_API_KEY")]
    triage_api_key: Option<String>,

    #[arg(long, env = "FLEETCORE_LOG", default_value = "info")]
    log_level: String,
}

fn main() {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cli.log_level.clone())).init();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build the tokio runtime");

    if let Err(e) = runtime.block_on(run(cli)) {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), Box<dyn std::error::Error>> {
    let token = match &cli.token_file {
        Some(path) => std::fs::read_to_string(path)?.trim().to_string(),
        None => {
            let generated = uuid::Uuid::new_v4().to_string();
            log::warn!("no --token-file given; generated an ephemeral control-surface token: {generated}");
            generated
        }
    };

    let options = BootstrapOptions {
        project_root: cli.project_root.clone(),
        llm_cli_binary: cli.llm_cli_binary.clone(),
        triage_endpoint: cli.triage_endpoint.clone(),
        triage_api_key: cli.triage_api_key.clone(),
        bundled_tools_dir: cli.project_root.join("bundled-tools"),
        services_dir: cli.project_root.join("services"),
    };
    let container = Container::bootstrap(options).await?;
    log::info!("bootstrapped project root {}", cli.project_root.display());

    // Kept alive for the rest of `run`: dropping it only detaches its
    // background tasks, it does not stop them, but holding it here
    // documents that the connection's lifetime is the process's lifetime.
    let _gateway_handle = match &cli.gateway_addr {
        Some(addr) => {
            let identity = GatewayIdentity {
                device_id: device_id(),
                client_id: "fleetcore-server".to_string(),
                mode: "daemon".to_string(),
                role: "agent-host".to_string(),
                scopes: vec!["route".to_string(), "session".to_string()],
            };
            Some(gateway::connect(addr, &identity, &cli.gateway_key, container.broker.clone()).await?)
        }
        None => None,
    };

    let surface = Arc::new(ControlSurface::new(container.clone(), token));
    if let Err(e) = surface.serve(&cli.control_addr).await {
        log::warn!("control surface stopped: {e}");
    }

    Ok(())
}

fn device_id() -> String {
    std::env::var("HOSTNAME").unwrap_or_else(|_| "fleetcore-host".to_string())
}
