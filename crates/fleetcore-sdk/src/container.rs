//! Bootstrap container (`SPEC_FULL.md` §9 "cyclic module references"): one
//! function building every crate's handle in dependency order — types →
//! core → store → broker → llmcli → runtime → this crate's own control
//! surface/gateway — with late-bound back-references represented as an
//! explicit, set-once cell instead of a mutable setter.

use std::path::PathBuf;
use std::sync::Arc;

use fleetcore_broker::Broker;
use fleetcore_llmcli::{CliAdapter, TriageClient};
use fleetcore_runtime::{AskUserHandle, HeartbeatScheduler, ServiceContext, ServiceSupervisor, ToolRegistry, TurnManager};
use fleetcore_store::AgentStore;
use once_cell::sync::OnceCell;

use crate::error::SdkError;

/// Bootstrap-time configuration (`spec.md` §6's CLI/env surface, concretized
/// in `fleetcore-server`).
#[derive(Debug, Clone)]
pub struct BootstrapOptions {
    pub project_root: PathBuf,
    pub llm_cli_binary: PathBuf,
    pub triage_endpoint: Option<String>,
    pub triage_api_key: Option<String>,
    pub bundled_tools_dir: PathBuf,
    pub services_dir: PathBuf,
}

/// Every long-lived handle the control surface and CLI entry point need.
/// Built once at startup; cloned as `Arc`s thereafter.
pub struct Container {
    pub project_root: PathBuf,
    pub store: AgentStore,
    pub broker: Arc<Broker>,
    /// A second handle to the same LLM-CLI binary the turn manager drives,
    /// used by the control surface's `session.start` (an interactive
    /// session the turn manager's debounce/triage pipeline never sees).
    pub adapter: CliAdapter,
    pub turn_manager: Arc<TurnManager>,
    pub heartbeats: Arc<HeartbeatScheduler>,
    pub tools: Arc<ToolRegistry>,
    pub ask_user: Arc<AskUserHandle>,
    pub services: Arc<ServiceSupervisor>,
    /// Cyclic reference cell: tool executions need a handle to the service
    /// supervisor, which is constructed after the tool registry. Set exactly
    /// once, immediately after `services` is built.
    pub services_cell: Arc<OnceCell<Arc<ServiceSupervisor>>>,
}

impl Container {
    pub async fn bootstrap(options: BootstrapOptions) -> Result<Arc<Self>, SdkError> {
        let store = AgentStore::new(&options.project_root);
        let broker = Arc::new(Broker::new(&options.project_root)?);

        let adapter = CliAdapter::new(&options.llm_cli_binary);
        let triage_client = options
            .triage_endpoint
            .map(|endpoint| TriageClient::new(endpoint, options.triage_api_key.clone()));

        let turn_manager = TurnManager::new(store.clone(), broker.clone(), adapter.clone(), triage_client);
        turn_manager.install(&broker).await;

        let heartbeats = Arc::new(HeartbeatScheduler::new(store.clone(), broker.clone()));
        heartbeats.refresh().await?;

        let tools = Arc::new(ToolRegistry::new(options.bundled_tools_dir, store.clone()));
        let ask_user = Arc::new(AskUserHandle::new(options.project_root.clone()));

        let services = Arc::new(ServiceSupervisor::new(options.services_dir));
        let service_ctx = ServiceContext {
            broker: broker.clone(),
            project_root: options.project_root.clone(),
        };
        services.start_all(&service_ctx);

        let services_cell = Arc::new(OnceCell::new());
        let _ = services_cell.set(services.clone());

        Ok(Arc::new(Self {
            project_root: options.project_root,
            store,
            broker,
            adapter,
            turn_manager,
            heartbeats,
            tools,
            ask_user,
            services,
            services_cell,
        }))
    }

    pub fn service_context(&self) -> ServiceContext {
        ServiceContext {
            broker: self.broker.clone(),
            project_root: self.project_root.clone(),
        }
    }
}
