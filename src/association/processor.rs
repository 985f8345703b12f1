//! Processor: drives the fetch, parse, execute, report and archive cycle.
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::AbortOnDropHandle;
use tracing::{Instrument, debug, error, info, warn};

use super::locks::KeyedLocks;
use super::model::{AgentInfo, AssociationRawData, AssociationStatus};
use super::parser::{DocumentParser, ParseError};
use super::service::{AssociationServiceType, ServiceError};
use super::stop_policy::StopPolicy;
use crate::command::{CommandKey, CommandState, DocumentStatus};
use crate::engine::{PluginExecution, PluginRegistry};
use crate::retry::{RetryPolicy, retry_with_backoff};
use crate::store::{CommandStateStore, Folder, StoreError, load_command_state, persist_command_state};

/// Target of the one-line-per-association outcome events.
pub const OUTCOME_TARGET: &str = "association";

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("control plane call failed: {0}")]
    Service(#[from] ServiceError),

    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error("state store failure: {0}")]
    Store(#[from] StoreError),

    #[error("task did not finish: {0}")]
    Task(String),
}

#[derive(Debug, Clone)]
pub struct ProcessorSettings {
    pub instance_ids: Vec<String>,
    pub poll_interval: Duration,
    pub tick_timeout: Duration,
    pub shutdown_grace: Duration,
    pub max_concurrent_associations: usize,
    pub completed_retention: Duration,
    pub persist_retry: RetryPolicy,
    pub agent_info: AgentInfo,
}

impl Default for ProcessorSettings {
    fn default() -> Self {
        Self {
            instance_ids: Vec::new(),
            poll_interval: Duration::from_secs(300),
            tick_timeout: Duration::from_secs(900),
            shutdown_grace: Duration::from_secs(10),
            max_concurrent_associations: 4,
            completed_retention: Duration::from_secs(72 * 3600),
            persist_retry: RetryPolicy::default(),
            agent_info: AgentInfo::default(),
        }
    }
}

#[derive(Debug)]
pub enum AssociationOutcome {
    /// Ran to a terminal status and was archived.
    Finished { status: DocumentStatus, reported: bool },
    /// A completed record already existed; nothing ran.
    AlreadyCompleted { reported: bool },
    /// Stopped by cancellation; the record stays in `Current`.
    Cancelled,
    Failed(ProcessError),
}

impl AssociationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            AssociationOutcome::Finished { .. } => "finished",
            AssociationOutcome::AlreadyCompleted { .. } => "already_completed",
            AssociationOutcome::Cancelled => "cancelled",
            AssociationOutcome::Failed(_) => "failed",
        }
    }
}

#[derive(Debug)]
pub struct AssociationResult {
    pub instance_id: String,
    pub association_id: String,
    pub association_name: String,
    pub command_id: String,
    pub outcome: AssociationOutcome,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SweepStats {
    pub reported: usize,
    pub removed: usize,
    pub corrupt: usize,
}

#[derive(Debug, Default)]
pub struct InstanceReport {
    pub instance_id: String,
    pub sweep: SweepStats,
    pub associations: Vec<AssociationResult>,
    /// Instance level failures: listing, sweep or aborted work.
    pub errors: Vec<ProcessError>,
}

#[derive(Debug, Default)]
pub struct TickReport {
    pub instances: Vec<InstanceReport>,
    pub timed_out: bool,
}

impl TickReport {
    pub fn results(&self) -> impl Iterator<Item = &AssociationResult> {
        self.instances.iter().flat_map(|i| i.associations.iter())
    }

    pub fn instance(&self, instance_id: &str) -> Option<&InstanceReport> {
        self.instances.iter().find(|i| i.instance_id == instance_id)
    }

    pub fn count(&self, label: &str) -> usize {
        self.results().filter(|r| r.outcome.label() == label).count()
    }

    fn log_summary(&self) {
        let errors: usize = self.instances.iter().map(|i| i.errors.len()).sum();
        info!(
            instances = self.instances.len(),
            finished = self.count("finished"),
            failed = self.count("failed"),
            cancelled = self.count("cancelled"),
            skipped = self.count("already_completed"),
            errors,
            timed_out = self.timed_out,
            "tick complete"
        );
    }
}

pub struct Processor {
    service: Arc<dyn AssociationServiceType>,
    parser: Arc<dyn DocumentParser>,
    engine: Arc<dyn PluginExecution>,
    store: Arc<dyn CommandStateStore>,
    registry: Arc<PluginRegistry>,
    stop_policy: Arc<StopPolicy>,
    settings: ProcessorSettings,
    locks: KeyedLocks,
}

impl fmt::Debug for Processor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Processor")
            .field("parser", &self.parser)
            .field("engine", &self.engine)
            .field("store", &self.store)
            .field("registry", &self.registry)
            .field("stop_policy", &self.stop_policy.name())
            .field("settings", &self.settings)
            .finish()
    }
}

impl Processor {
    pub fn new(
        service: Arc<dyn AssociationServiceType>,
        parser: Arc<dyn DocumentParser>,
        engine: Arc<dyn PluginExecution>,
        store: Arc<dyn CommandStateStore>,
        registry: Arc<PluginRegistry>,
        stop_policy: Arc<StopPolicy>,
        settings: ProcessorSettings,
    ) -> Arc<Self> {
        Arc::new(Self {
            service,
            parser,
            engine,
            store,
            registry,
            stop_policy,
            settings,
            locks: KeyedLocks::new(),
        })
    }

    pub fn settings(&self) -> &ProcessorSettings {
        &self.settings
    }

    /// Polls until `shutdown` is cancelled.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.settings.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            instances = ?self.settings.instance_ids,
            interval = ?self.settings.poll_interval,
            "association processor started"
        );
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("shutdown requested, stopping poll loop");
                    break;
                }
                _ = interval.tick() => {
                    self.tick(&shutdown).await;
                }
            }
        }
    }

    /// One poll cycle over every configured instance.
    ///
    /// Past the tick timeout no new plugins start; after a further grace
    /// period the remaining work is aborted.
    #[tracing::instrument(name = "tick", skip(self, shutdown))]
    pub async fn tick(self: &Arc<Self>, shutdown: &CancellationToken) -> TickReport {
        let tick_token = shutdown.child_token();
        let mut report = TickReport::default();
        let mut pending: HashSet<String> = HashSet::new();
        let mut set = JoinSet::new();

        for instance_id in &self.settings.instance_ids {
            if !pending.insert(instance_id.clone()) {
                continue;
            }
            let this = Arc::clone(self);
            let token = tick_token.clone();
            let instance_id = instance_id.clone();
            set.spawn(async move { this.process_instance(&instance_id, &token).await });
        }

        let deadline = tokio::time::sleep(self.settings.tick_timeout);
        tokio::pin!(deadline);
        let mut aborted = false;
        loop {
            tokio::select! {
                joined = set.join_next() => match joined {
                    None => break,
                    Some(Ok(instance)) => {
                        pending.remove(&instance.instance_id);
                        report.instances.push(instance);
                    }
                    Some(Err(e)) if e.is_panic() => error!("instance task panicked: {e}"),
                    Some(Err(_)) => {}
                },
                _ = &mut deadline, if !aborted => {
                    if !report.timed_out {
                        warn!(timeout = ?self.settings.tick_timeout, "tick timed out, cancelling");
                        report.timed_out = true;
                        tick_token.cancel();
                        deadline.as_mut().reset(Instant::now() + self.settings.shutdown_grace);
                    } else {
                        warn!("grace period over, aborting remaining work");
                        aborted = true;
                        set.abort_all();
                    }
                }
            }
        }

        for instance_id in pending {
            report.instances.push(InstanceReport {
                instance_id,
                errors: vec![ProcessError::Task("instance cycle aborted or panicked".into())],
                ..Default::default()
            });
        }
        self.locks.prune();
        report.log_summary();
        report
    }

    /// Sweeps completed records, then processes every listed association.
    #[tracing::instrument(name = "process_instance", skip(self, cancel))]
    pub async fn process_instance(self: Arc<Self>, instance_id: &str, cancel: &CancellationToken) -> InstanceReport {
        let mut report = InstanceReport {
            instance_id: instance_id.to_string(),
            ..Default::default()
        };

        match self.sweep_completed(instance_id).await {
            Ok(stats) => report.sweep = stats,
            Err(e) => {
                error!(error = %e, "completed sweep failed");
                report.errors.push(e);
            }
        }

        let associations = match self.service.list_associations(instance_id).await {
            Ok(list) => list,
            Err(e) => {
                warn!(error = %e, "could not list associations");
                report.errors.push(ProcessError::Service(e));
                return report;
            }
        };
        info!(count = associations.len(), "listed associations");

        let semaphore = Arc::new(Semaphore::new(self.settings.max_concurrent_associations.max(1)));
        let mut set = JoinSet::new();
        let mut pending = Vec::new();
        for raw in associations {
            pending.push((raw.association_id.clone(), raw.name.clone(), raw.command_id()));
            let this = Arc::clone(&self);
            let semaphore = Arc::clone(&semaphore);
            let cancel = cancel.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.ok();
                this.process_association(raw, &cancel).await
            });
        }

        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(result) => {
                    pending.retain(|(id, _, _)| *id != result.association_id);
                    report.associations.push(result);
                }
                Err(e) => error!("association task did not finish: {e}"),
            }
        }
        for (association_id, association_name, command_id) in pending {
            report.associations.push(AssociationResult {
                instance_id: instance_id.to_string(),
                association_id,
                association_name,
                command_id,
                outcome: AssociationOutcome::Failed(ProcessError::Task("association task panicked".into())),
            });
        }
        report
    }

    /// Processes one association and logs its outcome.
    pub async fn process_association(&self, raw: AssociationRawData, cancel: &CancellationToken) -> AssociationResult {
        let instance_id = raw.instance_id.clone();
        let association_id = raw.association_id.clone();
        let association_name = raw.name.clone();
        let command_id = raw.command_id();

        let outcome = self.run_association(raw, cancel).await;

        match &outcome {
            AssociationOutcome::Finished { status, reported } => info!(
                target: OUTCOME_TARGET,
                %instance_id, %association_id, %association_name, %command_id,
                outcome = outcome.label(), status = %status, reported = *reported,
                "association processed"
            ),
            AssociationOutcome::AlreadyCompleted { reported } => info!(
                target: OUTCOME_TARGET,
                %instance_id, %association_id, %association_name, %command_id,
                outcome = outcome.label(), reported = *reported,
                "association processed"
            ),
            AssociationOutcome::Cancelled => info!(
                target: OUTCOME_TARGET,
                %instance_id, %association_id, %association_name, %command_id,
                outcome = outcome.label(),
                "association processed"
            ),
            AssociationOutcome::Failed(e) => error!(
                target: OUTCOME_TARGET,
                %instance_id, %association_id, %association_name, %command_id,
                outcome = outcome.label(), error = %e,
                "association processed"
            ),
        }

        AssociationResult {
            instance_id,
            association_id,
            association_name,
            command_id,
            outcome,
        }
    }

    async fn run_association(&self, mut raw: AssociationRawData, cancel: &CancellationToken) -> AssociationOutcome {
        if let Err(e) = self.service.load_association_detail(&mut raw).await {
            return AssociationOutcome::Failed(ProcessError::Service(e));
        }

        let key = CommandKey::new(&raw.instance_id, raw.command_id());
        let _guard = self.locks.lock(&key).await;

        let state = match self.existing_state(&key).await {
            Ok(Existing::Completed { reported }) => {
                let reported = if reported { true } else { self.report_completed(&key).await };
                return AssociationOutcome::AlreadyCompleted { reported };
            }
            Ok(Existing::Current(state)) => {
                info!(%key, executed = state.executed_count(), "resuming command");
                state
            }
            Ok(Existing::None) => match self.initialize(&raw).await {
                Ok(state) => state,
                Err(e) => return AssociationOutcome::Failed(e),
            },
            Err(e) => return AssociationOutcome::Failed(ProcessError::Store(e)),
        };

        match self.execute(state, cancel).await {
            Ok(outcome) => outcome,
            Err(e) => AssociationOutcome::Failed(e),
        }
    }

    /// Looks for a record left by an earlier tick. Undecodable `Current`
    /// records are quarantined and treated as absent.
    async fn existing_state(&self, key: &CommandKey) -> Result<Existing, StoreError> {
        if self.store.load_data(key, Folder::Completed).await?.is_some() {
            let info = self.store.get_document_info(key, Folder::Completed).await?;
            return Ok(Existing::Completed { reported: info.reported });
        }
        match load_command_state(self.store.as_ref(), key, Folder::Current).await {
            Ok(Some(state)) => Ok(Existing::Current(state)),
            Ok(None) => Ok(Existing::None),
            Err(StoreError::Serialization { source, .. }) => {
                warn!(%key, error = %source, "undecodable record, moving to corrupt");
                self.move_record(key, Folder::Current, Folder::Corrupt).await?;
                Ok(Existing::None)
            }
            Err(e) => Err(e),
        }
    }

    async fn initialize(&self, raw: &AssociationRawData) -> Result<CommandState, ProcessError> {
        let payload = match self.parser.parse_document_with_params(raw) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(association_id = %raw.association_id, error = %e, "document rejected");
                self.report(&raw.instance_id, &raw.name, AssociationStatus::Failed, &e.to_string())
                    .await;
                return Err(ProcessError::Parse(e));
            }
        };
        let state = self.parser.initialize_command_state(&payload, raw);
        self.persist(&state, Folder::Current).await?;
        debug!(key = %state.key(), plugins = state.plugins.len(), "command initialized");
        Ok(state)
    }

    async fn execute(&self, mut state: CommandState, cancel: &CancellationToken) -> Result<AssociationOutcome, ProcessError> {
        let key = state.key();
        let total = state.plugins.len();

        if state.all_executed() && state.document_info.reported {
            // An earlier tick reported the terminal status but failed to archive.
            info!(%key, status = %state.document_info.status, "status already reported, archiving");
            self.move_record(&key, Folder::Current, Folder::Completed).await?;
            return Ok(AssociationOutcome::Finished {
                status: state.document_info.status,
                reported: true,
            });
        }

        if state.all_executed() {
            debug!(%key, "every plugin already executed, skipping engine");
        } else {
            state.document_info.status = DocumentStatus::InProgress;
            self.persist(&state, Folder::Current).await?;
            self.report(
                &key.instance_id,
                &state.document_info.association_name,
                AssociationStatus::InProgress,
                &format!("{} of {total} plugins executed", state.executed_count()),
            )
            .await;

            // Plugins keep running while a checkpoint waits on the control
            // plane. Dropping the handle aborts the engine.
            let (tx, mut rx) = mpsc::unbounded_channel();
            let run = {
                let engine = Arc::clone(&self.engine);
                let registry = Arc::clone(&self.registry);
                let plugins = state.plugins.clone();
                let command_id = key.command_id.clone();
                let cancel = cancel.clone();
                AbortOnDropHandle::new(tokio::spawn(
                    async move {
                        engine
                            .run_plugins(&command_id, &plugins, &registry, Some(tx), &cancel)
                            .await
                    }
                    .in_current_span(),
                ))
            };

            while let Some(reply) = rx.recv().await {
                if state.apply_result(reply.result) {
                    self.checkpoint(&mut state, total).await;
                }
            }
            let results = run
                .await
                .map_err(|e| ProcessError::Task(format!("plugin engine for {key}: {e}")))?;
            state.apply_results(results);
        }

        let cancelled = cancel.is_cancelled() && !state.all_executed();
        let status = state.finish(cancelled);
        self.persist(&state, Folder::Current).await?;

        if status == DocumentStatus::Cancelled {
            info!(%key, executed = state.executed_count(), total, "run cancelled, record kept for resumption");
            return Ok(AssociationOutcome::Cancelled);
        }

        let reported = self
            .report(
                &key.instance_id,
                &state.document_info.association_name,
                AssociationStatus::from_document(status),
                &state.document_info.message,
            )
            .await;
        if reported {
            state.document_info.reported = true;
            self.persist(&state, Folder::Current).await?;
        }
        self.move_record(&key, Folder::Current, Folder::Completed).await?;
        Ok(AssociationOutcome::Finished { status, reported })
    }

    /// Persists a streamed result and reports progress. Failures here are
    /// logged; the final persist decides the outcome.
    async fn checkpoint(&self, state: &mut CommandState, total: usize) {
        if let Err(e) = self.persist(state, Folder::Current).await {
            error!(key = %state.key(), error = %e, "could not persist plugin result");
        }
        self.report(
            &state.document_info.instance_id,
            &state.document_info.association_name,
            AssociationStatus::InProgress,
            &format!("{} of {total} plugins executed", state.executed_count()),
        )
        .await;
    }

    /// Sends a status. Returns whether the control plane received it.
    async fn report(&self, instance_id: &str, association_name: &str, status: AssociationStatus, message: &str) -> bool {
        match self
            .service
            .update_association_status(
                instance_id,
                association_name,
                status,
                message,
                &self.settings.agent_info,
                &self.stop_policy,
            )
            .await
        {
            Ok(_) => true,
            // Delivered and refused; repeating it would be refused again.
            Err(ServiceError::Rejected { .. }) => true,
            Err(ServiceError::CircuitOpen(_)) => false,
            Err(e) => {
                debug!(%association_name, error = %e, "status not delivered");
                false
            }
        }
    }

    /// Retries the final report of an archived record.
    async fn report_completed(&self, key: &CommandKey) -> bool {
        let mut info = match self.store.get_document_info(key, Folder::Completed).await {
            Ok(info) => info,
            Err(e) => {
                error!(%key, error = %e, "could not read completed record");
                return false;
            }
        };
        let delivered = self
            .report(
                &info.instance_id,
                &info.association_name,
                AssociationStatus::from_document(info.status),
                &info.message,
            )
            .await;
        if !delivered {
            return false;
        }
        info.reported = true;
        let store = self.store.as_ref();
        let info_ref = &info;
        let saved = retry_with_backoff(&self.settings.persist_retry, "persist document info", move || {
            store.persist_document_info(key, Folder::Completed, info_ref)
        })
        .await;
        match saved {
            Ok(()) => true,
            Err(e) => {
                error!(%key, error = %e, "reported, but could not record it");
                false
            }
        }
    }

    /// Re-reports unreported completed records and removes reported ones past
    /// retention.
    #[tracing::instrument(name = "sweep_completed", skip(self))]
    pub async fn sweep_completed(&self, instance_id: &str) -> Result<SweepStats, ProcessError> {
        let mut stats = SweepStats::default();
        let retention = self.settings.completed_retention;
        let now = chrono::Utc::now();

        for command_id in self.store.list_commands(instance_id, Folder::Completed).await? {
            let key = CommandKey::new(instance_id, command_id);
            let _guard = self.locks.lock(&key).await;

            let info = match self.store.get_document_info(&key, Folder::Completed).await {
                Ok(info) => info,
                Err(StoreError::Serialization { source, .. }) => {
                    warn!(%key, error = %source, "undecodable completed record, moving to corrupt");
                    self.move_record(&key, Folder::Completed, Folder::Corrupt).await?;
                    stats.corrupt += 1;
                    continue;
                }
                // Removed since it was listed.
                Err(StoreError::RecordNotFound { .. }) => continue,
                Err(e) => return Err(e.into()),
            };

            if !info.reported {
                if self.report_completed(&key).await {
                    stats.reported += 1;
                }
                continue;
            }

            let finished = info.finished_at.unwrap_or(info.created_at);
            let expired = (now - finished).to_std().map(|age| age >= retention).unwrap_or(false);
            if expired {
                let store = self.store.as_ref();
                let key_ref = &key;
                retry_with_backoff(&self.settings.persist_retry, "remove completed record", move || {
                    store.remove_data(key_ref, Folder::Completed)
                })
                .await?;
                debug!(%key, "removed expired completed record");
                stats.removed += 1;
            }
        }
        if stats != SweepStats::default() {
            info!(?stats, "completed sweep");
        }
        Ok(stats)
    }

    async fn persist(&self, state: &CommandState, folder: Folder) -> Result<(), StoreError> {
        let store = self.store.as_ref();
        retry_with_backoff(&self.settings.persist_retry, "persist command state", move || {
            persist_command_state(store, state, folder)
        })
        .await
        .inspect_err(|e| {
            if matches!(e, StoreError::RecordNotFound { .. }) {
                error!(key = %state.key(), "record vanished while persisting");
            }
        })
    }

    async fn move_record(&self, key: &CommandKey, src: Folder, dst: Folder) -> Result<(), StoreError> {
        let store = self.store.as_ref();
        retry_with_backoff(&self.settings.persist_retry, "move command state", move || {
            store.move_command_state(key, src, dst)
        })
        .await
        .inspect_err(|e| {
            if matches!(e, StoreError::RecordNotFound { .. }) {
                error!(%key, %src, %dst, "record missing from source folder");
            }
        })
    }
}

enum Existing {
    None,
    Current(CommandState),
    Completed { reported: bool },
}
