//! Run coordination.
//!
//! At most one run (plan, then optionally execute) is in progress at any time.
//! The [`Orchestrator`] owns the run token; triggers that arrive while a run
//! is in progress are coalesced into a single follow-up run, whether the
//! current run was triggered or started with [`Orchestrator::run_now`].
//! Progress is published through a [`watch`] channel.
//!
//! Every run gets its own cancellation token, armed before the run is
//! reported as started, so [`Orchestrator::cancel_current`] reaches a run
//! that is still planning.

use crate::Context;
use crate::error::Result as LibraryResult;
use crate::materialize::{Progress, RunReport, execute};
use crate::plan::{Plan, UpdatePolicy, plan};
use crate::scan::Classifier;
use gloom_storage::Signature;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// How often sources are checked for changes between interval runs.
const CHANGE_POLL: Duration = Duration::from_secs(20);

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum RunStatus {
    #[default]
    Idle,
    Scanning {
        dry_run: bool,
        completed: usize,
        total: usize,
    },
    /// The last run failed. Transient: the status returns to idle right after.
    Failed {
        message: String,
    },
}

impl RunStatus {
    pub fn is_running(&self) -> bool {
        matches!(self, Self::Scanning { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunRequest {
    /// Plan only.
    DryRun,
    /// Plan and execute. `force` rewrites gallery outputs even when unchanged.
    Execute { force: bool },
}

impl RunRequest {
    pub fn is_dry_run(&self) -> bool {
        matches!(self, Self::DryRun)
    }
}

/// Immediate answer to a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ack {
    Started,
    /// A run is in progress; this request runs right after it.
    Queued,
    /// A follow-up is already queued; this request replaced it.
    AlreadyQueued,
}

#[derive(Debug, Clone)]
pub enum RunOutcome {
    Planned(Arc<Plan>),
    Executed(Arc<RunReport>),
}

struct Shared {
    ctx: Context,
    token: Arc<Mutex<()>>,
    queued: Mutex<Option<RunRequest>>,
    status: watch::Sender<RunStatus>,
    cancel: Mutex<CancellationToken>,
    last_plan: RwLock<Option<Arc<Plan>>>,
    last_report: RwLock<Option<Arc<RunReport>>>,
    last_error: RwLock<Option<String>>,
}

/// Entry point for on-demand, interval and change-triggered runs.
#[derive(Clone)]
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    pub fn new(ctx: Context) -> Self {
        let (status, _) = watch::channel(RunStatus::Idle);
        Self {
            shared: Arc::new(Shared {
                ctx,
                token: Arc::new(Mutex::new(())),
                queued: Mutex::new(None),
                status,
                cancel: Mutex::new(CancellationToken::new()),
                last_plan: RwLock::new(None),
                last_report: RwLock::new(None),
                last_error: RwLock::new(None),
            }),
        }
    }

    pub fn context(&self) -> &Context {
        &self.shared.ctx
    }

    pub fn subscribe(&self) -> watch::Receiver<RunStatus> {
        self.shared.status.subscribe()
    }

    pub fn status(&self) -> RunStatus {
        self.shared.status.borrow().clone()
    }

    pub async fn last_plan(&self) -> Option<Arc<Plan>> {
        self.shared.last_plan.read().await.clone()
    }

    pub async fn last_report(&self) -> Option<Arc<RunReport>> {
        self.shared.last_report.read().await.clone()
    }

    pub async fn last_error(&self) -> Option<String> {
        self.shared.last_error.read().await.clone()
    }

    /// Start a run in the background, or queue it behind the current one.
    /// Completion is observed through [`subscribe`](Self::subscribe).
    #[tracing::instrument(level = "debug", skip(self))]
    pub async fn trigger(&self, request: RunRequest) -> Ack {
        let mut queued = self.shared.queued.lock().await;
        match self.shared.token.clone().try_lock_owned() {
            Ok(token) => {
                // Anything still queued belongs to a runner that is gone.
                *queued = None;
                let cancel = begin(&self.shared, request).await;
                let shared = self.shared.clone();
                tokio::spawn(async move { run_loop(shared, token, request, cancel).await });
                Ack::Started
            },
            Err(_) => {
                let ack = if queued.is_some() { Ack::AlreadyQueued } else { Ack::Queued };
                *queued = Some(request);
                tracing::debug!(?ack, "run in progress");
                ack
            },
        }
    }

    /// Run in the foreground once the current run, if any, has finished.
    ///
    /// A trigger queued meanwhile is handed the run token and continues in
    /// the background after this returns.
    pub async fn run_now(&self, request: RunRequest) -> LibraryResult<RunOutcome> {
        let token = self.shared.token.clone().lock_owned().await;
        let cancel = begin(&self.shared, request).await;
        let result = run_once(&self.shared, &token, request, &cancel).await;
        let mut queued = self.shared.queued.lock().await;
        match queued.take() {
            Some(next) => {
                tracing::debug!(?next, "running queued request");
                let cancel = begin(&self.shared, next).await;
                let shared = self.shared.clone();
                tokio::spawn(async move { run_loop(shared, token, next, cancel).await });
            },
            None => {
                self.shared.status.send_replace(RunStatus::Idle);
                drop(token);
            },
        }
        drop(queued);
        result
    }

    /// Ask the current run to stop. A run still planning executes nothing;
    /// an execute stops after its in-flight item.
    pub async fn cancel_current(&self) {
        self.shared.cancel.lock().await.cancel();
    }

    /// Run periodically and whenever a source changes, until `shutdown`.
    /// Returns `None` when automatic scans are disabled.
    pub fn spawn_auto_scan(&self, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let settings = &self.shared.ctx.config.settings;
        if !settings.auto_scan_enabled {
            return None;
        }
        let period = Duration::from_secs(u64::from(settings.auto_scan_interval_minutes.max(1)) * 60);
        let this = self.clone();
        Some(tokio::spawn(async move { this.auto_scan(period, shutdown).await }))
    }

    async fn auto_scan(self, period: Duration, shutdown: CancellationToken) {
        tracing::info!(interval = ?period, "automatic scans enabled");
        let mut interval = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut poll = tokio::time::interval_at(tokio::time::Instant::now() + CHANGE_POLL, CHANGE_POLL);
        poll.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let mut snapshots = self.snapshots().await;
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => self.auto_trigger("interval").await,
                _ = poll.tick() => {
                    let current = self.snapshots().await;
                    if current != snapshots {
                        snapshots = current;
                        self.auto_trigger("source change").await;
                    }
                },
            }
        }
        self.cancel_current().await;
        tracing::info!("automatic scans stopped");
    }

    async fn auto_trigger(&self, reason: &'static str) {
        if self.status().is_running() {
            tracing::debug!(reason, "run in progress, skipping automatic scan");
            return;
        }
        let ack = self.trigger(RunRequest::Execute { force: false }).await;
        tracing::info!(reason, ?ack, "automatic scan triggered");
    }

    /// Cheap signatures of every enabled source, keyed by source id.
    async fn snapshots(&self) -> BTreeMap<u32, Signature> {
        let config = self.shared.ctx.config.as_ref();
        let mut snapshots = BTreeMap::new();
        for source in config.enabled_sources() {
            match Classifier::new(config, source).snapshot().await {
                Ok(signature) => {
                    snapshots.insert(source.id, signature);
                },
                Err(e) => tracing::debug!(source = source.id, error = ?e, "unable to snapshot source"),
            }
        }
        snapshots
    }
}

fn scanning(request: RunRequest) -> RunStatus {
    RunStatus::Scanning { dry_run: request.is_dry_run(), completed: 0, total: 0 }
}

/// Arm a fresh cancellation token for `request`, then mark it as running.
async fn begin(shared: &Shared, request: RunRequest) -> CancellationToken {
    let cancel = CancellationToken::new();
    *shared.cancel.lock().await = cancel.clone();
    shared.status.send_replace(scanning(request));
    cancel
}

/// Resets the status if a run unwinds while still marked as scanning.
struct StatusGuard(Arc<Shared>);

impl Drop for StatusGuard {
    fn drop(&mut self) {
        self.0.status.send_if_modified(|status| {
            let running = status.is_running();
            if running {
                *status = RunStatus::Idle;
            }
            running
        });
    }
}

async fn run_loop(
    shared: Arc<Shared>,
    token: OwnedMutexGuard<()>,
    mut request: RunRequest,
    mut cancel: CancellationToken,
) {
    let _guard = StatusGuard(shared.clone());
    loop {
        // Failures are logged and kept as the last error.
        let _ = run_once(&shared, &token, request, &cancel).await;
        let mut queued = shared.queued.lock().await;
        match queued.take() {
            Some(next) => {
                cancel = begin(&shared, next).await;
                request = next;
            },
            None => {
                shared.status.send_replace(RunStatus::Idle);
                // The token is released while the queue is still locked, so a
                // trigger either sees the token free or gets picked up here.
                drop(token);
                drop(queued);
                break;
            },
        }
    }
}

/// One plan, and one execute unless dry running. Requires the run token.
#[tracing::instrument(level = "info", skip(shared, _token, cancel))]
async fn run_once(
    shared: &Shared,
    _token: &OwnedMutexGuard<()>,
    request: RunRequest,
    cancel: &CancellationToken,
) -> LibraryResult<RunOutcome> {
    let result = plan_and_execute(shared, request, cancel).await;
    match &result {
        Ok(_) => *shared.last_error.write().await = None,
        Err(e) => {
            tracing::error!(error = ?e, "run failed");
            let message = (**e).to_string();
            *shared.last_error.write().await = Some(message.clone());
            shared.status.send_replace(RunStatus::Failed { message });
        },
    }
    result
}

async fn plan_and_execute(shared: &Shared, request: RunRequest, cancel: &CancellationToken) -> LibraryResult<RunOutcome> {
    let ctx = &shared.ctx;
    let force = matches!(request, RunRequest::Execute { force: true });
    let policy = UpdatePolicy::new(ctx.config.settings.update_gallery_zips, force);
    let plan = Arc::new(plan(ctx, policy).await?);
    if request.is_dry_run() {
        *shared.last_plan.write().await = Some(plan.clone());
        return Ok(RunOutcome::Planned(plan));
    }

    if cancel.is_cancelled() {
        // Execute reports the run as cancelled without touching any item.
        tracing::warn!(items = plan.items.len(), "cancelled while planning");
    }
    shared.status.send_replace(RunStatus::Scanning { dry_run: false, completed: 0, total: plan.items.len() });
    let report = execute(ctx, &plan, cancel, |Progress { completed, total }| {
        shared.status.send_replace(RunStatus::Scanning { dry_run: false, completed, total });
    })
    .await?;
    let report = Arc::new(report);
    *shared.last_report.write().await = Some(report.clone());
    Ok(RunOutcome::Executed(report))
}
