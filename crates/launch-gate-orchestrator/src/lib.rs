//! Launch-time workflow: coalesces attribution with routing, verifies
//! eligibility, resolves a destination and emits exactly one navigation
//! decision per session.
//!
//! All state lives in [`WorkflowOrchestrator`] and is mutated only inside
//! [`WorkflowOrchestrator::run`]. Eligibility checks, re-attribution and
//! destination fetches run as spawned tasks that report back over an
//! internal channel, so their effects are applied one at a time.

use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use launch_gate_core::{
    extract_push_destination, merge_records, now_utc, AttributionRecord, LaunchConfig,
    LaunchStore, MergedRecord, Navigation, PermissionOutcome, PermissionPromptState,
    RoutingRecord, SetupState, WorkflowState, SETUP_STATUS_ACTIVE,
};
use launch_gate_remote::{RemoteClient, RemoteError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, Instant};

mod coalescer;

pub use coalescer::{AttributionCoalescer, CoalescerEmission};

#[async_trait]
pub trait EligibilityCheck: Send + Sync {
    /// `Ok(false)` and `Err(_)` are both treated as "not eligible".
    async fn run_check(&self) -> anyhow::Result<bool>;
}

#[async_trait]
pub trait PermissionRequester: Send + Sync {
    async fn request_notification_permission(&self) -> bool;
}

/// Device identifier accessor of the attribution provider.
pub trait DeviceIdentity: Send + Sync {
    fn device_id(&self) -> Option<String>;
}

pub trait Clock: Send + Sync {
    fn now(&self) -> OffsetDateTime;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> OffsetDateTime {
        now_utc()
    }
}

/// Transient destination delivered out-of-band (push payload). Consumed at
/// most once by the resolution pipeline; never persisted.
#[derive(Debug, Clone, Default)]
pub struct PendingDestination {
    slot: Arc<Mutex<Option<String>>>,
}

impl PendingDestination {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, url: impl Into<String>) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(url.into());
    }

    /// Stores the destination carried by a push payload, if it has one.
    pub fn set_from_push(&self, payload: &Value) -> Option<String> {
        let url = extract_push_destination(payload)?;
        self.set(url.clone());
        Some(url)
    }

    #[must_use]
    pub fn take(&self) -> Option<String> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner).take()
    }
}

pub struct LaunchDependencies {
    pub store: Box<dyn LaunchStore>,
    pub remote: Arc<dyn RemoteClient>,
    pub eligibility: Arc<dyn EligibilityCheck>,
    pub permission: Arc<dyn PermissionRequester>,
    pub device: Arc<dyn DeviceIdentity>,
    pub clock: Arc<dyn Clock>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum PermissionAnswer {
    Allow,
    Skip,
}

impl PermissionAnswer {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Allow => "allow",
            Self::Skip => "skip",
        }
    }

    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "allow" => Some(Self::Allow),
            "skip" => Some(Self::Skip),
            _ => None,
        }
    }
}

/// How the destination of this session was (or was not) obtained.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq)]
#[serde(rename_all = "snake_case")]
pub enum FetchOutcome {
    NotAttempted,
    Fetched,
    PendingDestination,
    CacheFallback,
    Failed,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LaunchSummary {
    pub final_state: WorkflowState,
    pub navigation: Navigation,
    pub deadline_fired: bool,
    pub fetch: FetchOutcome,
    pub permission: Option<PermissionOutcome>,
}

#[derive(Debug)]
enum LaunchEvent {
    Attribution(AttributionRecord),
    Routing(RoutingRecord),
    PermissionAnswer(PermissionAnswer),
}

/// Input side of a running launch. Cheap to clone; every method returns
/// `false` once the orchestrator has finished.
#[derive(Debug, Clone)]
pub struct LaunchHandle {
    events: mpsc::UnboundedSender<LaunchEvent>,
}

impl LaunchHandle {
    pub fn attribution(&self, record: AttributionRecord) -> bool {
        self.events.send(LaunchEvent::Attribution(record)).is_ok()
    }

    /// Provider reported a failure instead of data.
    pub fn attribution_failed(&self, message: &str) -> bool {
        self.attribution(AttributionRecord::failure(message))
    }

    pub fn routing(&self, record: RoutingRecord) -> bool {
        self.events.send(LaunchEvent::Routing(record)).is_ok()
    }

    pub fn permission_answer(&self, answer: PermissionAnswer) -> bool {
        self.events.send(LaunchEvent::PermissionAnswer(answer)).is_ok()
    }
}

/// Output side of a running launch, for the UI shell.
#[derive(Debug, Clone)]
pub struct LaunchSignals {
    pub state: watch::Receiver<WorkflowState>,
    pub show_permission_prompt: watch::Receiver<bool>,
    pub show_offline_overlay: watch::Receiver<bool>,
    /// `None` until the single navigation decision is made.
    pub navigation: watch::Receiver<Option<Navigation>>,
}

struct SignalSenders {
    state: watch::Sender<WorkflowState>,
    show_permission_prompt: watch::Sender<bool>,
    show_offline_overlay: watch::Sender<bool>,
    navigation: watch::Sender<Option<Navigation>>,
}

#[derive(Debug)]
enum TaskResult {
    Eligibility(anyhow::Result<bool>),
    Reattribution(Result<AttributionRecord, RemoteError>),
    Destination(Result<String, RemoteError>),
}

enum Wake {
    Event(Option<LaunchEvent>),
    Task(Option<TaskResult>),
    Reachability(Option<bool>),
    CoalescingWindow,
    Deadline,
}

enum Decision {
    Active(String),
    Standby,
}

pub struct WorkflowOrchestrator {
    config: LaunchConfig,
    store: Box<dyn LaunchStore>,
    remote: Arc<dyn RemoteClient>,
    eligibility: Arc<dyn EligibilityCheck>,
    permission: Arc<dyn PermissionRequester>,
    device: Arc<dyn DeviceIdentity>,
    clock: Arc<dyn Clock>,
    pending: PendingDestination,

    events: mpsc::UnboundedReceiver<LaunchEvent>,
    events_open: bool,
    task_tx: mpsc::UnboundedSender<TaskResult>,
    task_rx: mpsc::UnboundedReceiver<TaskResult>,
    tasks: Vec<JoinHandle<()>>,
    reachability: watch::Receiver<bool>,
    reachability_open: bool,
    signals: SignalSenders,

    coalescer: AttributionCoalescer,
    setup: SetupState,
    state: WorkflowState,
    deadline: Instant,
    latest_merged: Option<MergedRecord>,
    decided: bool,
    deadline_fired: bool,
    fetch: FetchOutcome,
    awaiting_permission: Option<String>,
    permission_outcome: Option<PermissionOutcome>,
    navigation: Option<Navigation>,
}

impl WorkflowOrchestrator {
    /// Restores persisted state, arms the deadline and enters `Processing`.
    ///
    /// Unreadable persisted values are logged and replaced by first-run
    /// defaults; a broken store never blocks the launch.
    #[must_use]
    pub fn new(
        config: LaunchConfig,
        deps: LaunchDependencies,
        reachability: watch::Receiver<bool>,
        pending: PendingDestination,
    ) -> (Self, LaunchHandle, LaunchSignals) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (task_tx, task_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(WorkflowState::Initializing);
        let (prompt_tx, prompt_rx) = watch::channel(false);
        let (offline_tx, offline_rx) = watch::channel(false);
        let (navigation_tx, navigation_rx) = watch::channel(None);

        let deadline = Instant::now() + config.deadline();
        let setup = deps.store.setup_state().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to restore setup state; assuming first run");
            SetupState::default()
        });
        let coalescer = restore_coalescer(deps.store.as_ref(), &config);

        let mut orchestrator = Self {
            config,
            store: deps.store,
            remote: deps.remote,
            eligibility: deps.eligibility,
            permission: deps.permission,
            device: deps.device,
            clock: deps.clock,
            pending,
            events: event_rx,
            events_open: true,
            task_tx,
            task_rx,
            tasks: Vec::new(),
            reachability,
            reachability_open: true,
            signals: SignalSenders {
                state: state_tx,
                show_permission_prompt: prompt_tx,
                show_offline_overlay: offline_tx,
                navigation: navigation_tx,
            },
            coalescer,
            setup,
            state: WorkflowState::Initializing,
            deadline,
            latest_merged: None,
            decided: false,
            deadline_fired: false,
            fetch: FetchOutcome::NotAttempted,
            awaiting_permission: None,
            permission_outcome: None,
            navigation: None,
        };

        let online = *orchestrator.reachability.borrow_and_update();
        orchestrator.apply_reachability(online);
        orchestrator.set_state(WorkflowState::Processing);

        let handle = LaunchHandle { events: event_tx };
        let signals = LaunchSignals {
            state: state_rx,
            show_permission_prompt: prompt_rx,
            show_offline_overlay: offline_rx,
            navigation: navigation_rx,
        };
        (orchestrator, handle, signals)
    }

    /// Drives the workflow until the navigation decision has been emitted.
    pub async fn run(mut self) -> LaunchSummary {
        while self.navigation.is_none() {
            let coalesce_at = self.coalescer.deadline();
            let decided = self.decided;

            let wake = tokio::select! {
                event = self.events.recv(), if self.events_open => Wake::Event(event),
                result = self.task_rx.recv() => Wake::Task(result),
                changed = self.reachability.changed(), if self.reachability_open => {
                    Wake::Reachability(changed.ok().map(|()| *self.reachability.borrow_and_update()))
                }
                () = sleep_until(coalesce_at.unwrap_or(self.deadline)), if coalesce_at.is_some() => {
                    Wake::CoalescingWindow
                }
                () = sleep_until(self.deadline), if !decided => Wake::Deadline,
            };

            match wake {
                Wake::Event(Some(event)) => self.on_event(event).await,
                Wake::Event(None) => self.on_events_closed(),
                Wake::Task(Some(result)) => self.on_task_result(result),
                Wake::Task(None) => {}
                Wake::Reachability(Some(online)) => self.apply_reachability(online),
                Wake::Reachability(None) => {
                    tracing::debug!("reachability feed closed");
                    self.reachability_open = false;
                }
                Wake::CoalescingWindow => {
                    let emissions = self.coalescer.on_timer();
                    self.apply_emissions(emissions);
                }
                Wake::Deadline => self.on_deadline(),
            }
        }

        self.abort_tasks();
        let navigation = self.navigation.clone().unwrap_or(Navigation::NativeContent);
        tracing::info!(
            state = %self.state,
            deadline_fired = self.deadline_fired,
            fetch = ?self.fetch,
            "launch workflow finished"
        );
        LaunchSummary {
            final_state: self.state,
            navigation,
            deadline_fired: self.deadline_fired,
            fetch: self.fetch,
            permission: self.permission_outcome,
        }
    }

    async fn on_event(&mut self, event: LaunchEvent) {
        match event {
            LaunchEvent::Attribution(record) => {
                tracing::info!(
                    keys = record.len(),
                    failure = record.is_failure(),
                    "attribution delivered"
                );
                log_persist_failure("attribution_record", self.store.put_attribution_record(&record));
                let emissions = self.coalescer.on_attribution(record, Instant::now());
                self.apply_emissions(emissions);
            }
            LaunchEvent::Routing(record) => {
                let emissions = self.coalescer.on_routing(record);
                self.apply_emissions(emissions);
            }
            LaunchEvent::PermissionAnswer(answer) => self.on_permission_answer(answer).await,
        }
    }

    fn on_events_closed(&mut self) {
        self.events_open = false;
        if let Some(url) = self.awaiting_permission.take() {
            tracing::warn!("launch handle dropped while prompting; continuing to destination");
            self.signals.show_permission_prompt.send_replace(false);
            self.navigate(Navigation::Destination(url));
        }
    }

    fn apply_emissions(&mut self, emissions: Vec<CoalescerEmission>) {
        for emission in emissions {
            match emission {
                CoalescerEmission::Routing(record) => {
                    tracing::info!(keys = record.len(), "routing delivered");
                    log_persist_failure("routing_record", self.store.put_routing_record(&record));
                    log_persist_failure(
                        "routing_finalized",
                        self.store.set_routing_finalized(true),
                    );
                }
                CoalescerEmission::Merged(merged) => self.on_merged(merged),
            }
        }
    }

    fn on_merged(&mut self, merged: MergedRecord) {
        tracing::debug!(keys = merged.len(), "merged attribution record emitted");
        self.latest_merged = Some(merged);

        if self.decided || self.state != WorkflowState::Processing {
            tracing::debug!(state = %self.state, "keeping latest merged record for in-flight pipeline");
            return;
        }

        self.set_state(WorkflowState::Verifying);
        let check = Arc::clone(&self.eligibility);
        let tx = self.task_tx.clone();
        self.tasks.push(tokio::spawn(async move {
            let result = check.run_check().await;
            let _ = tx.send(TaskResult::Eligibility(result));
        }));
    }

    fn on_task_result(&mut self, result: TaskResult) {
        if self.decided {
            tracing::debug!(?result, "ignoring task result after decision");
            return;
        }
        match result {
            TaskResult::Eligibility(outcome) => self.on_eligibility(outcome),
            TaskResult::Reattribution(outcome) => self.on_reattribution(outcome),
            TaskResult::Destination(outcome) => self.on_destination(outcome),
        }
    }

    fn on_eligibility(&mut self, outcome: anyhow::Result<bool>) {
        match outcome {
            Ok(true) => {
                self.set_state(WorkflowState::Verified);
                self.begin_resolution();
            }
            Ok(false) => {
                tracing::info!("eligibility check declined; using native content");
                self.decide(Decision::Standby);
            }
            Err(err) => {
                tracing::warn!(error = %err, "eligibility check failed; using native content");
                self.decide(Decision::Standby);
            }
        }
    }

    fn begin_resolution(&mut self) {
        let merged = self.latest_merged.clone().unwrap_or_default();
        if merged.is_empty() {
            self.fall_back("attribution record is empty", FetchOutcome::NotAttempted);
            return;
        }

        if let Some(url) = self.pending.take() {
            tracing::info!(%url, "using pending destination from push payload");
            self.fetch = FetchOutcome::PendingDestination;
            self.decide(Decision::Active(url));
            return;
        }

        if self.setup.is_first_run && merged.is_organic() {
            if let Some(device_id) = self.device.device_id() {
                self.spawn_reattribution(device_id);
                return;
            }
            tracing::warn!("organic first run without device id; skipping re-attribution");
        }

        self.spawn_fetch(merged);
    }

    fn spawn_reattribution(&mut self, device_id: String) {
        let grace = self.config.reattribution_grace();
        let remote = Arc::clone(&self.remote);
        let tx = self.task_tx.clone();
        tracing::info!(grace_ms = self.config.reattribution_grace_ms, "organic first run; waiting for late attribution");
        self.tasks.push(tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            let result = remote.pull_attribution(&device_id).await;
            let _ = tx.send(TaskResult::Reattribution(result));
        }));
    }

    fn on_reattribution(&mut self, outcome: Result<AttributionRecord, RemoteError>) {
        let merged = match outcome {
            Ok(fresh) => {
                tracing::info!(keys = fresh.len(), organic = fresh.is_organic(), "re-attribution snapshot received");
                log_persist_failure("attribution_record", self.store.put_attribution_record(&fresh));
                let merged = merge_records(&fresh, self.coalescer.routing());
                self.latest_merged = Some(merged.clone());
                merged
            }
            Err(err) => {
                tracing::warn!(error = %err, "re-attribution failed; keeping original record");
                self.latest_merged.clone().unwrap_or_default()
            }
        };
        self.spawn_fetch(merged);
    }

    fn spawn_fetch(&mut self, merged: MergedRecord) {
        let remote = Arc::clone(&self.remote);
        let tx = self.task_tx.clone();
        tracing::info!(keys = merged.len(), "fetching destination");
        self.tasks.push(tokio::spawn(async move {
            let result = remote.pull_destination(&merged).await;
            let _ = tx.send(TaskResult::Destination(result));
        }));
    }

    fn on_destination(&mut self, outcome: Result<String, RemoteError>) {
        match outcome {
            Ok(url) => {
                log_persist_failure("resolved_destination_url", self.store.put_resolved_destination(&url));
                log_persist_failure("setup_status", self.store.put_setup_status(SETUP_STATUS_ACTIVE));
                log_persist_failure("first_run", self.store.set_first_run(false));
                self.setup = SetupState {
                    is_first_run: false,
                    last_resolved_destination: Some(url.clone()),
                    last_resolved_status: Some(SETUP_STATUS_ACTIVE.to_string()),
                };
                self.fetch = FetchOutcome::Fetched;
                self.decide(Decision::Active(url));
            }
            Err(err) => {
                tracing::warn!(error = %err, "destination fetch failed");
                self.fall_back("destination fetch failed", FetchOutcome::Failed);
            }
        }
    }

    /// Cached destination if one exists, otherwise native content with
    /// `uncached` as the reported fetch outcome.
    fn fall_back(&mut self, reason: &'static str, uncached: FetchOutcome) {
        let cached = self.store.resolved_destination().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to read cached destination");
            None
        });
        if let Some(url) = cached {
            tracing::info!(reason, %url, "falling back to cached destination");
            self.fetch = FetchOutcome::CacheFallback;
            self.decide(Decision::Active(url));
        } else {
            tracing::info!(reason, "no cached destination; using native content");
            self.fetch = uncached;
            self.decide(Decision::Standby);
        }
    }

    fn on_deadline(&mut self) {
        if self.decided {
            return;
        }
        tracing::warn!(state = %self.state, deadline_ms = self.config.deadline_ms, "launch deadline elapsed");
        self.deadline_fired = true;
        self.decide(Decision::Standby);
    }

    /// Single arbitration point for the terminal decision.
    fn decide(&mut self, decision: Decision) {
        if self.decided {
            tracing::debug!("terminal decision already made; ignoring competitor");
            return;
        }
        self.decided = true;
        self.abort_tasks();
        self.signals.show_offline_overlay.send_replace(false);

        match decision {
            Decision::Active(url) => {
                self.set_state(WorkflowState::Active);
                if self.prompt_policy().should_prompt(self.clock.now()) {
                    tracing::info!("showing notification permission prompt");
                    self.awaiting_permission = Some(url);
                    self.signals.show_permission_prompt.send_replace(true);
                    if !self.events_open {
                        self.on_events_closed();
                    }
                } else {
                    self.navigate(Navigation::Destination(url));
                }
            }
            Decision::Standby => {
                self.set_state(WorkflowState::Standby);
                self.navigate(Navigation::NativeContent);
            }
        }
    }

    async fn on_permission_answer(&mut self, answer: PermissionAnswer) {
        let Some(url) = self.awaiting_permission.take() else {
            tracing::debug!(answer = answer.as_str(), "permission answer without open prompt");
            return;
        };

        let outcome = match answer {
            PermissionAnswer::Allow => {
                let requester = Arc::clone(&self.permission);
                if requester.request_notification_permission().await {
                    PermissionOutcome::Granted
                } else {
                    PermissionOutcome::Denied
                }
            }
            PermissionAnswer::Skip => PermissionOutcome::Deferred,
        };

        let next = self.prompt_policy().record(outcome, self.clock.now());
        log_persist_failure("permission_state", self.store.put_permission_state(&next));
        tracing::info!(answer = answer.as_str(), ?outcome, "permission prompt answered");

        self.permission_outcome = Some(outcome);
        self.signals.show_permission_prompt.send_replace(false);
        self.navigate(Navigation::Destination(url));
    }

    fn prompt_policy(&self) -> PermissionPromptState {
        self.store.permission_state().unwrap_or_else(|err| {
            tracing::warn!(error = %err, "failed to read permission state; treating as unanswered");
            PermissionPromptState::default()
        })
    }

    fn apply_reachability(&mut self, online: bool) {
        if self.decided {
            tracing::debug!(online, "reachability change after decision suppressed");
            return;
        }
        tracing::info!(online, displayed = %self.state.displayed(online), "reachability changed");
        self.signals.show_offline_overlay.send_replace(!online);
    }

    fn navigate(&mut self, navigation: Navigation) {
        if self.navigation.is_some() {
            return;
        }
        tracing::info!(?navigation, "navigation decided");
        self.signals.navigation.send_replace(Some(navigation.clone()));
        self.navigation = Some(navigation);
    }

    fn set_state(&mut self, next: WorkflowState) {
        if self.state == next {
            return;
        }
        tracing::info!(from = %self.state, to = %next, "workflow state transition");
        self.state = next;
        self.signals.state.send_replace(next);
    }

    fn abort_tasks(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

fn restore_coalescer(store: &dyn LaunchStore, config: &LaunchConfig) -> AttributionCoalescer {
    let finalized = store.routing_finalized().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "failed to read routing_finalized; treating as unset");
        false
    });
    if !finalized {
        return AttributionCoalescer::new(config.coalescing_window());
    }
    let routing = store.routing_record().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "failed to restore routing record");
        None
    });
    AttributionCoalescer::restored(config.coalescing_window(), routing)
}

fn log_persist_failure(what: &'static str, result: anyhow::Result<()>) {
    if let Err(err) = result {
        tracing::error!(key = what, error = %err, "failed to persist launch state");
    }
}
