//! Operator surface for the launch gate.
//!
//! [`run_cli`] executes a parsed [`Cli`]. Every command prints a single JSON
//! document on stdout; diagnostics go to stderr through `tracing`.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use clap::{Args, Parser, Subcommand, ValueEnum};
use launch_gate_core::{
    extract_push_destination, now_utc, parse_rfc3339_utc, AttributionRecord, LaunchConfig,
    LaunchStore, PermissionOutcome, RoutingRecord,
};
use launch_gate_orchestrator::{
    DeviceIdentity, EligibilityCheck, LaunchDependencies, PendingDestination, PermissionAnswer,
    PermissionRequester, SystemClock, WorkflowOrchestrator,
};
use launch_gate_remote::HttpRemoteClient;
use launch_gate_store_sqlite::SqliteLaunchStore;
use serde_json::{json, Value};
use tokio::sync::watch;

#[derive(Debug, Parser)]
#[command(name = "launch-gate")]
#[command(about = "Launch gate state and workflow CLI")]
pub struct Cli {
    #[arg(long, default_value = "./launch_gate.sqlite3")]
    db: PathBuf,

    /// Default log filter when `RUST_LOG` is unset.
    #[arg(long, default_value = "warn", global = true)]
    pub log_level: String,

    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    State {
        #[command(subcommand)]
        command: StateCommand,
    },
    Permission {
        #[command(subcommand)]
        command: PermissionCommand,
    },
    Push {
        #[command(subcommand)]
        command: PushCommand,
    },
    /// Runs one orchestrated launch against the configured endpoints.
    Launch(LaunchArgs),
}

#[derive(Debug, Subcommand)]
pub enum StateCommand {
    Show,
    Reset,
}

#[derive(Debug, Subcommand)]
pub enum PermissionCommand {
    Check(PermissionCheckArgs),
    Record(PermissionRecordArgs),
}

#[derive(Debug, Args)]
pub struct PermissionCheckArgs {
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Args)]
pub struct PermissionRecordArgs {
    #[arg(long)]
    answer: AnswerArg,
    /// System-level result when the user chose `allow`.
    #[arg(long)]
    granted: bool,
    #[arg(long)]
    now: Option<String>,
}

#[derive(Debug, Subcommand)]
pub enum PushCommand {
    Extract(PushExtractArgs),
}

#[derive(Debug, Args)]
pub struct PushExtractArgs {
    #[arg(long)]
    payload: String,
}

#[derive(Debug, Args)]
pub struct LaunchArgs {
    /// Attribution record as a JSON object.
    #[arg(long, conflicts_with = "attribution_error")]
    attribution: Option<String>,
    /// Deliver a provider failure instead of attribution data.
    #[arg(long)]
    attribution_error: Option<String>,
    /// Routing record as a JSON object.
    #[arg(long)]
    routing: Option<String>,
    #[arg(long, conflicts_with = "ineligible")]
    eligible: bool,
    #[arg(long)]
    ineligible: bool,
    #[arg(long)]
    device_id: Option<String>,
    /// Start with the reachability feed reporting no connectivity.
    #[arg(long)]
    offline: bool,
    /// Answer given if the permission prompt is shown.
    #[arg(long)]
    answer: Option<AnswerArg>,
    #[arg(long)]
    granted: bool,
    /// Push payload that may carry a pending destination.
    #[arg(long)]
    push_payload: Option<String>,
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    attribution_url: Option<String>,
    #[arg(long)]
    destination_url: Option<String>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum AnswerArg {
    Allow,
    Skip,
}

impl From<AnswerArg> for PermissionAnswer {
    fn from(value: AnswerArg) -> Self {
        match value {
            AnswerArg::Allow => Self::Allow,
            AnswerArg::Skip => Self::Skip,
        }
    }
}

/// Executes the parsed top-level command.
///
/// # Errors
/// Returns an error when argument decoding, store access, or configuration
/// loading fails. Launch outcomes themselves are never errors.
pub async fn run_cli(cli: Cli) -> Result<()> {
    let mut store = open_store(&cli.db)?;
    match cli.command {
        Command::State { command } => run_state(command, &mut store),
        Command::Permission { command } => run_permission(command, &mut store),
        Command::Push { command } => run_push(&command),
        Command::Launch(args) => run_launch(args, store).await,
    }
}

fn open_store(path: &Path) -> Result<SqliteLaunchStore> {
    let mut store = SqliteLaunchStore::open(path)?;
    store.migrate()?;
    tracing::debug!(db = %path.display(), "launch state store ready");
    Ok(store)
}

fn run_state(command: StateCommand, store: &mut SqliteLaunchStore) -> Result<()> {
    match command {
        StateCommand::Show => print_json(&store.snapshot()?),
        StateCommand::Reset => {
            store.reset()?;
            print_json(&json!({"reset": true, "state": store.snapshot()?}))
        }
    }
}

fn run_permission(command: PermissionCommand, store: &mut SqliteLaunchStore) -> Result<()> {
    match command {
        PermissionCommand::Check(args) => {
            let now = parse_optional_utc(args.now.as_deref())?;
            let state = store.permission_state()?;
            print_json(&json!({
                "should_prompt": state.should_prompt(now),
                "state": state,
            }))
        }
        PermissionCommand::Record(args) => {
            let now = parse_optional_utc(args.now.as_deref())?;
            let outcome = match (args.answer, args.granted) {
                (AnswerArg::Allow, true) => PermissionOutcome::Granted,
                (AnswerArg::Allow, false) => PermissionOutcome::Denied,
                (AnswerArg::Skip, _) => PermissionOutcome::Deferred,
            };
            let next = store.permission_state()?.record(outcome, now);
            store.put_permission_state(&next)?;
            print_json(&json!({"outcome": outcome, "state": next}))
        }
    }
}

fn run_push(command: &PushCommand) -> Result<()> {
    match command {
        PushCommand::Extract(args) => {
            let payload = parse_json_arg("payload", &args.payload)?;
            print_json(&json!({"destination": extract_push_destination(&payload)}))
        }
    }
}

async fn run_launch(args: LaunchArgs, store: SqliteLaunchStore) -> Result<()> {
    let config = load_config(&args)?;
    let remote = HttpRemoteClient::new(&config).map_err(|err| anyhow!(err))?;

    let attribution = match (&args.attribution, &args.attribution_error) {
        (Some(raw), _) => Some(
            AttributionRecord::from_json_object(&parse_json_arg("attribution", raw)?)
                .map_err(|err| anyhow!(err))?,
        ),
        (None, Some(message)) => Some(AttributionRecord::failure(message)),
        (None, None) => None,
    };
    let routing = args
        .routing
        .as_deref()
        .map(|raw| {
            RoutingRecord::from_json_object(&parse_json_arg("routing", raw)?)
                .map_err(|err| anyhow!(err))
        })
        .transpose()?;

    let pending = PendingDestination::new();
    if let Some(raw) = args.push_payload.as_deref() {
        let _ = pending.set_from_push(&parse_json_arg("push_payload", raw)?);
    }

    let (reachability_tx, reachability_rx) = watch::channel(!args.offline);
    let deps = LaunchDependencies {
        store: Box::new(store),
        remote: Arc::new(remote),
        eligibility: Arc::new(StaticEligibility(args.eligible || !args.ineligible)),
        permission: Arc::new(StaticPermission(args.granted)),
        device: Arc::new(StaticDevice(args.device_id.clone())),
        clock: Arc::new(SystemClock),
    };
    let (orchestrator, handle, signals) =
        WorkflowOrchestrator::new(config, deps, reachability_rx, pending);
    let offline_shown = *signals.show_offline_overlay.borrow();

    if let Some(record) = routing {
        handle.routing(record);
    }
    if let Some(record) = attribution {
        handle.attribution(record);
    }

    if let Some(answer) = args.answer {
        let mut prompt = signals.show_permission_prompt.clone();
        tokio::spawn(async move {
            if prompt.wait_for(|shown| *shown).await.is_ok() {
                handle.permission_answer(answer.into());
            }
        });
    } else {
        drop(handle);
    }

    let summary = orchestrator.run().await;
    drop(reachability_tx);
    print_json(&json!({
        "summary": summary,
        "offline_overlay_shown": offline_shown,
    }))
}

fn load_config(args: &LaunchArgs) -> Result<LaunchConfig> {
    let mut config = match args.config.as_deref() {
        Some(path) => {
            let raw = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            let value: Value = serde_json::from_str(&raw)
                .with_context(|| format!("config file {} is not valid JSON", path.display()))?;
            LaunchConfig::from_json(&value).map_err(|err| anyhow!(err))?
        }
        None => LaunchConfig::default(),
    };

    if let Some(url) = &args.attribution_url {
        config.attribution_url.clone_from(url);
    }
    if let Some(url) = &args.destination_url {
        config.destination_url.clone_from(url);
    }
    config.validate().map_err(|err| anyhow!(err))?;
    Ok(config)
}

struct StaticEligibility(bool);

#[async_trait]
impl EligibilityCheck for StaticEligibility {
    async fn run_check(&self) -> Result<bool> {
        Ok(self.0)
    }
}

struct StaticPermission(bool);

#[async_trait]
impl PermissionRequester for StaticPermission {
    async fn request_notification_permission(&self) -> bool {
        self.0
    }
}

struct StaticDevice(Option<String>);

impl DeviceIdentity for StaticDevice {
    fn device_id(&self) -> Option<String> {
        self.0.clone()
    }
}

fn parse_json_arg(name: &str, raw: &str) -> Result<Value> {
    serde_json::from_str(raw).with_context(|| format!("{name} must be valid JSON: {raw}"))
}

fn parse_optional_utc(raw: Option<&str>) -> Result<time::OffsetDateTime> {
    match raw {
        Some(value) => parse_rfc3339_utc(value).map_err(|err| anyhow!("invalid timestamp: {err}")),
        None => Ok(now_utc()),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
