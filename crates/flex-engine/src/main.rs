use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::info;

use flex_core::{
    CapabilityRegistry, CoordinatorConfig, EngineConfig, ExecutionEngine, FacetCatalog,
    HitlService, JsonFilePersistenceStore, PersistenceStore, PlannerValidationService,
    RunCoordinator,
};
use flex_model::{ModelRuntime, ScriptedModelRuntime};
use flex_server::{serve, AppState};
use flex_telemetry::{canonical_logs_dir_from_root, init_process_logging, EventBus, ProcessKind, TelemetryService};
use flex_types::capability::{
    AgentType, AssignmentDefaults, CapabilityKind, CapabilityRecord, CapabilityStatus,
    ContractSpec, OnDecline,
};
use flex_types::envelope::TaskEnvelope;
use flex_types::facet::{Facet, FacetDirection};

mod register;

const LOG_RETENTION_DAYS: u64 = 14;

#[derive(Parser, Debug)]
#[command(name = "flex-engine")]
#[command(about = "Headless Flex orchestration engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP/SSE gateway.
    Serve {
        #[arg(long, alias = "host", default_value = "127.0.0.1")]
        hostname: String,
        #[arg(long, default_value_t = 3000)]
        port: u16,
        #[arg(long)]
        state_dir: Option<String>,
    },
    /// Drive a single run to completion against a `TaskEnvelope` JSON file, printing the outcome.
    Run {
        envelope_path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Serve { hostname, port, state_dir } => {
            let state_dir = resolve_state_dir(state_dir);
            let _log_guard = start_logging(&state_dir)?;
            let (coordinator, registry, event_bus, config) = build_engine(&state_dir).await?;
            let addr: SocketAddr = format!("{hostname}:{port}").parse().context("invalid hostname or port")?;
            log_startup_paths(&state_dir, &addr);
            let app_state = AppState::new(coordinator, registry, event_bus, config);
            spawn_capability_self_register(app_state.config.clone(), app_state.registry.clone());
            serve(addr, app_state).await?;
        }
        Command::Run { envelope_path } => {
            let state_dir = resolve_state_dir(None);
            let _log_guard = start_logging(&state_dir)?;
            let (coordinator, _registry, _event_bus, _config) = build_engine(&state_dir).await?;
            let raw = tokio::fs::read_to_string(&envelope_path).await.context("reading envelope file")?;
            let envelope: TaskEnvelope = serde_json::from_str(&raw).context("parsing envelope JSON")?;
            let cancel = CancellationToken::new();
            let outcome = coordinator.run(envelope, None, None, &cancel).await?;
            println!("{}", serde_json::to_string_pretty(&outcome)?);
        }
    }

    Ok(())
}

/// Wires `flex-telemetry`'s structured JSON-file + console logging for
/// this process, per spec.md §2's correlation-id lifecycle logging. The
/// returned guard must stay alive for the process's lifetime or the
/// non-blocking file writer drops buffered lines on exit.
fn start_logging(state_dir: &PathBuf) -> anyhow::Result<tracing_appender::non_blocking::WorkerGuard> {
    let logs_dir = canonical_logs_dir_from_root(state_dir);
    let (guard, _info) = init_process_logging(ProcessKind::Engine, &logs_dir, LOG_RETENTION_DAYS)?;
    Ok(guard)
}

fn resolve_state_dir(flag: Option<String>) -> PathBuf {
    if let Some(dir) = flag {
        return PathBuf::from(dir);
    }
    if let Ok(dir) = std::env::var("FLEX_STATE_DIR") {
        if !dir.trim().is_empty() {
            return PathBuf::from(dir);
        }
    }
    PathBuf::from(".flex")
}

fn log_startup_paths(state_dir: &PathBuf, addr: &SocketAddr) {
    let exe = std::env::current_exe().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("<unknown>"));
    info!("starting flex-engine on http://{addr}");
    info!(
        "startup paths: exe={} cwd={} state_dir={}",
        exe.display(),
        cwd.display(),
        state_dir.display()
    );
}

type EngineParts = (Arc<RunCoordinator>, Arc<CapabilityRegistry>, Arc<EventBus>, EngineConfig);

/// Wires the full Flex dependency graph: facet catalog, capability
/// registry (seeded with a small example pair, per the "registry ships
/// example registrations, not hand-authored agent behaviors" scoping),
/// persistence, telemetry, HITL, planner, validator, execution engine,
/// coordinator. Mirrors the teacher's `build_state` shape, one engine
/// crate standing up one coordinator instead of one session runtime.
async fn build_engine(state_dir: &PathBuf) -> anyhow::Result<EngineParts> {
    let config_store = flex_core::ConfigStore::new(state_dir.join("config.json"), None).await?;
    let config = config_store.get().await;

    let store: Arc<dyn PersistenceStore> =
        Arc::new(JsonFilePersistenceStore::new(state_dir.join("runs")).await?);
    let event_bus = Arc::new(EventBus::new());
    let telemetry = Arc::new(TelemetryService::new());

    let facet_catalog = Arc::new(example_facet_catalog());
    let registry = Arc::new(CapabilityRegistry::new(facet_catalog.clone()));
    seed_example_capabilities(&registry).await?;

    let runtime: Arc<dyn ModelRuntime> = Arc::new(ScriptedModelRuntime::new());
    let hitl = Arc::new(HitlService::new(store.clone(), config.hitl_max_requests));

    let planner = Arc::new(flex_core::DefaultPlannerService::new(
        facet_catalog.clone(),
        registry.clone(),
        runtime.clone(),
        telemetry.clone(),
        config.planner_timeout(),
        config.planner_model.clone(),
    ));
    let validator = Arc::new(PlannerValidationService::new(facet_catalog.clone(), registry.clone()));

    let engine = Arc::new(ExecutionEngine::new(
        facet_catalog.clone(),
        registry.clone(),
        store.clone(),
        runtime,
        hitl,
        telemetry,
        event_bus.clone(),
    ));

    let coordinator = Arc::new(RunCoordinator::new(
        store,
        planner,
        validator,
        registry.clone(),
        facet_catalog,
        engine,
        event_bus.clone(),
        CoordinatorConfig::default(),
    ));

    Ok((coordinator, registry, event_bus, config))
}

/// A minimal example catalog so `flex-engine run`/`serve` has something
/// to plan against out of the box. Real deployments register their own
/// facets and capabilities at runtime via `POST /v1/capabilities`.
fn example_facet_catalog() -> FacetCatalog {
    FacetCatalog::new(vec![
        Facet {
            name: "objective_brief".to_string(),
            direction: FacetDirection::Input,
            schema: serde_json::json!({"type": "object"}),
            summary: "the caller's restated objective".to_string(),
            version: 1,
        },
        Facet {
            name: "final_output".to_string(),
            direction: FacetDirection::Output,
            schema: serde_json::json!({"type": "string"}),
            summary: "the run's final answer".to_string(),
            version: 1,
        },
    ])
}

async fn seed_example_capabilities(registry: &CapabilityRegistry) -> anyhow::Result<()> {
    registry
        .register(CapabilityRecord {
            capability_id: "example.finalizer@1".to_string(),
            version: 1,
            agent_type: AgentType::Ai,
            kind: CapabilityKind::Execution,
            display_name: "Example Finalizer".to_string(),
            summary: "Echoes the objective back as the final output.".to_string(),
            input_contract: ContractSpec::Facets(vec!["objective_brief".to_string()]),
            output_contract: ContractSpec::Facets(vec!["final_output".to_string()]),
            input_facets: vec!["objective_brief".to_string()],
            output_facets: vec!["final_output".to_string()],
            post_conditions: vec![],
            cost: Default::default(),
            heartbeat: None,
            instruction_templates: Default::default(),
            assignment_defaults: None,
            metadata: Default::default(),
            status: CapabilityStatus::Active,
            registered_at: chrono::Utc::now(),
            last_seen_at: chrono::Utc::now(),
        })
        .await?;
    registry
        .register(CapabilityRecord {
            capability_id: "example.human_review@1".to_string(),
            version: 1,
            agent_type: AgentType::Human,
            kind: CapabilityKind::Validation,
            display_name: "Example Human Review".to_string(),
            summary: "A human sign-off step available to the planner.".to_string(),
            input_contract: ContractSpec::Facets(vec!["final_output".to_string()]),
            output_contract: ContractSpec::Facets(vec!["final_output".to_string()]),
            input_facets: vec!["final_output".to_string()],
            output_facets: vec!["final_output".to_string()],
            post_conditions: vec![],
            cost: Default::default(),
            heartbeat: None,
            instruction_templates: Default::default(),
            assignment_defaults: Some(AssignmentDefaults {
                role: "reviewer".to_string(),
                timeout_seconds: 900,
                on_decline: OnDecline::Requeue,
                max_notifications: 1,
            }),
            metadata: Default::default(),
            status: CapabilityStatus::Active,
            registered_at: chrono::Utc::now(),
            last_seen_at: chrono::Utc::now(),
        })
        .await?;
    Ok(())
}

fn spawn_capability_self_register(config: EngineConfig, registry: Arc<CapabilityRegistry>) {
    if config.disable_capability_self_register {
        return;
    }
    let Some(url) = config.capability_register_url.clone() else {
        return;
    };
    tokio::spawn(async move {
        if let Err(err) = register::self_register(&url, config.capability_self_register_retries, &registry).await {
            tracing::warn!(target: "flex.obs", error = %err, "capability self-registration failed after retries");
        }
    });
}
