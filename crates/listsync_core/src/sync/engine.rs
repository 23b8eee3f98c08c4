//! Reconciliation cycle orchestration.
//!
//! # Responsibility
//! - Drive one cycle through Fetch, Detect, Link, Resolve, Apply, Persist
//!   and Audit.
//! - Isolate per-item remote failures and keep them out of the commit.
//! - Track consecutive failed cycles for the external scheduler.
//! - Keep every read and write inside the configured list pair, so several
//!   engines can share one store.
//!
//! # Invariants
//! - At most one cycle runs at a time; a second caller gets
//!   `SyncError::CycleInProgress` instead of waiting.
//! - A fetch failure on either side aborts before any remote mutation.
//! - The store only records remote state that was actually reached: a step
//!   that failed or was skipped leaves its items out of the commit, so the
//!   next cycle detects them again.
//! - Dry-run issues no mutating remote call and writes nothing.
//! - Apply order is removals, then creations, then updates.
//! - An unlinked item is copied across when it is new this cycle or has
//!   never been part of a link; an item whose link was dropped stays put.

use crate::config::{ConfigError, RemovalFallback, SyncConfig};
use crate::model::audit::{AuditKind, AuditPayload, AuditRecord};
use crate::model::item::{RemoteItem, Side, SourceItem};
use crate::model::link::{Link, LinkId};
use crate::repo::cycle_repo::CycleRecord;
use crate::repo::item_repo::{RepoError, SourceItemRepository, SqliteSourceItemRepository};
use crate::repo::link_repo::{LinkRepository, SqliteLinkRepository};
use crate::repo::store::{commit_cycle, CycleWrites};
use crate::sync::clock::{Clock, SystemClock};
use crate::sync::detector::{ChangeDetector, ChangeKind, SnapshotDiff};
use crate::sync::linker::{ItemLinker, LinkingSummary};
use crate::sync::report::{CycleError, CycleErrorKind, CycleReport, PlannedMutation, SyncStatus};
use crate::sync::resolver::{ConflictResolver, DivergenceContext, Resolution, ResolutionClass};
use crate::sync::retry::{thread_sleeper, with_retry, CallGate, Idempotency, RetryPolicy, Sleeper};
use crate::sync::source::{
    DeleteCapability, DeleteOutcome, SourceCollaborator, SourceError, SourceErrorKind,
    SourceResult,
};
use log::{debug, error, info, warn};
use rusqlite::Connection;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::Instant;
use uuid::Uuid;

/// Cycle-level failure. Per-item failures are reported in
/// `CycleReport::errors` instead.
#[derive(Debug)]
pub enum SyncError {
    /// Another cycle holds the run-lock.
    CycleInProgress,
    Config(ConfigError),
    /// Snapshot fetch failed after retries; nothing was mutated.
    Fetch { side: Side, error: SourceError },
    /// Credentials rejected during fetch; re-auth needed before the next run.
    Authentication { side: Side, error: SourceError },
    /// Store I/O failed; the cycle committed nothing.
    Store(RepoError),
    /// Persisted state violates model invariants.
    DataIntegrity(String),
}

impl Display for SyncError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CycleInProgress => write!(f, "a sync cycle is already running"),
            Self::Config(err) => write!(f, "{err}"),
            Self::Fetch { side, error } => write!(f, "fetch failed on side {side}: {error}"),
            Self::Authentication { side, error } => {
                write!(f, "authentication failed on side {side}: {error}")
            }
            Self::Store(err) => write!(f, "store failure: {err}"),
            Self::DataIntegrity(message) => write!(f, "data integrity violation: {message}"),
        }
    }
}

impl Error for SyncError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Config(err) => Some(err),
            Self::Fetch { error, .. } | Self::Authentication { error, .. } => Some(error),
            Self::Store(err) => Some(err),
            Self::CycleInProgress | Self::DataIntegrity(_) => None,
        }
    }
}

impl From<RepoError> for SyncError {
    fn from(value: RepoError) -> Self {
        match value {
            RepoError::InvalidData(message) => Self::DataIntegrity(message),
            other => Self::Store(other),
        }
    }
}

impl From<ConfigError> for SyncError {
    fn from(value: ConfigError) -> Self {
        Self::Config(value)
    }
}

/// Cooperative cancellation flag, honored between Apply steps.
///
/// A request applies to the cycle running now, or to the next one if none
/// is running; it is cleared when that cycle finishes.
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    requested: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn request_stop(&self) {
        self.requested.store(true, Ordering::SeqCst);
    }

    pub fn is_stop_requested(&self) -> bool {
        self.requested.load(Ordering::SeqCst)
    }

    fn clear(&self) {
        self.requested.store(false, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
struct FailureState {
    consecutive_failures: u32,
    next_retry_at: Option<i64>,
}

/// Store connection shared by the engines of one deployment.
pub type SharedStore = Arc<Mutex<Connection>>;

/// Owns both collaborators of one reconciled list pair and its view of the
/// store.
pub struct SyncEngine {
    config: SyncConfig,
    store: SharedStore,
    source_a: Arc<dyn SourceCollaborator>,
    source_b: Arc<dyn SourceCollaborator>,
    clock: Arc<dyn Clock>,
    sleeper: Sleeper,
    policy: RetryPolicy,
    linker: ItemLinker,
    resolver: ConflictResolver,
    run_lock: Mutex<()>,
    stop: StopHandle,
    failures: Mutex<FailureState>,
    gates: BySide<CallGate>,
}

impl SyncEngine {
    /// Builds an engine over an opened store.
    ///
    /// # Errors
    /// - `SyncError::Config` when the config is invalid or a collaborator's
    ///   `source_id` does not match its configured side.
    pub fn new(
        config: SyncConfig,
        store: Connection,
        source_a: Arc<dyn SourceCollaborator>,
        source_b: Arc<dyn SourceCollaborator>,
    ) -> Result<Self, SyncError> {
        Self::with_shared_store(config, Arc::new(Mutex::new(store)), source_a, source_b)
    }

    /// Builds an engine over a store other pairs may use as well; its rows
    /// are scoped by `config.pair_id`.
    pub fn with_shared_store(
        config: SyncConfig,
        store: SharedStore,
        source_a: Arc<dyn SourceCollaborator>,
        source_b: Arc<dyn SourceCollaborator>,
    ) -> Result<Self, SyncError> {
        config.validate()?;
        for (side, source) in [(Side::A, &source_a), (Side::B, &source_b)] {
            let expected = config.side(side).source_id.as_str();
            if source.source_id() != expected {
                return Err(SyncError::Config(ConfigError::Invalid(format!(
                    "side {side} expects source `{expected}`, got `{}`",
                    source.source_id()
                ))));
            }
        }

        Ok(Self {
            policy: RetryPolicy::from_config(&config.retry),
            linker: ItemLinker::new(config.linking.clone()),
            resolver: ConflictResolver::new(config.conflict),
            config,
            store,
            source_a,
            source_b,
            clock: Arc::new(SystemClock),
            sleeper: thread_sleeper(),
            run_lock: Mutex::new(()),
            stop: StopHandle::default(),
            failures: Mutex::new(FailureState::default()),
            gates: BySide {
                a: CallGate::default(),
                b: CallGate::default(),
            },
        })
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_sleeper(mut self, sleeper: Sleeper) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn pair_id(&self) -> &str {
        &self.config.pair_id
    }

    pub(crate) fn shares_store(&self, store: &SharedStore) -> bool {
        Arc::ptr_eq(&self.store, store)
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Locks the store for direct reads.
    pub fn store(&self) -> MutexGuard<'_, Connection> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Runs one full cycle, or plans one when `dry_run` is set.
    ///
    /// # Errors
    /// - `CycleInProgress` when another cycle holds the run-lock.
    /// - `Fetch` / `Authentication` when a snapshot cannot be fetched.
    /// - `Store` / `DataIntegrity` when the store cannot be read or committed.
    pub fn run_cycle(&self, dry_run: bool) -> Result<CycleReport, SyncError> {
        let _guard = match self.run_lock.try_lock() {
            Ok(guard) => guard,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            Err(TryLockError::WouldBlock) => {
                warn!("event=sync_cycle module=sync status=skip reason=cycle_in_progress");
                return Err(SyncError::CycleInProgress);
            }
        };

        let started = Instant::now();
        let cycle_id = Uuid::new_v4().to_string();
        let pair_id = self.pair_id();
        info!(
            "event=sync_cycle module=sync status=start pair_id={pair_id} cycle_id={cycle_id} dry_run={dry_run}"
        );

        let result = self.execute_cycle(&cycle_id, dry_run);
        self.stop.clear();

        match &result {
            Ok(report) => {
                if !dry_run {
                    self.record_success();
                }
                info!(
                    "event=sync_cycle module=sync status=ok pair_id={pair_id} cycle_id={cycle_id} dry_run={dry_run} added={} updated={} conflicts_resolved={} removed={} links_created={} ambiguous={} errors={} skipped={} cancelled={} aborted={} duration_ms={}",
                    report.added,
                    report.updated,
                    report.conflicts_resolved,
                    report.removed,
                    report.links_created,
                    report.ambiguous,
                    report.errors.len(),
                    report.skipped,
                    report.cancelled,
                    report.aborted,
                    started.elapsed().as_millis()
                );
            }
            Err(err) => {
                if !dry_run {
                    self.record_failure(err);
                }
                error!(
                    "event=sync_cycle module=sync status=error pair_id={pair_id} cycle_id={cycle_id} dry_run={dry_run} duration_ms={} error={err}",
                    started.elapsed().as_millis()
                );
            }
        }
        result
    }

    /// Persisted status plus in-process failure tracking.
    pub fn status(&self) -> Result<SyncStatus, SyncError> {
        let mut status = {
            let conn = self.store();
            SyncStatus::load(&conn, self.pair_id())?
        };
        let failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        status.consecutive_failures = failures.consecutive_failures;
        status.next_retry_at = failures.next_retry_at;
        Ok(status)
    }

    /// Unlinked counts and duplicate-name groups from the store.
    pub fn linking_summary(&self) -> Result<LinkingSummary, SyncError> {
        let conn = self.store();
        let items = SqliteSourceItemRepository::for_pair(&conn, self.pair_id());
        let unlinked_a = items.list_unlinked_items(Side::A)?;
        let unlinked_b = items.list_unlinked_items(Side::B)?;
        Ok(self.linker.summary(&unlinked_a, &unlinked_b))
    }

    fn execute_cycle(&self, cycle_id: &str, dry_run: bool) -> Result<CycleReport, SyncError> {
        let started_at = self.clock.now_ms();

        let fetched_a = self.fetch(Side::A)?;
        let fetched_b = self.fetch(Side::B)?;

        let now = self.clock.now_ms();
        let (stored_a, stored_b, links) = {
            let conn = self.store();
            let items = SqliteSourceItemRepository::for_pair(&conn, self.pair_id());
            let stored_a = items.list_source_items(Side::A, true)?;
            let stored_b = items.list_source_items(Side::B, true)?;
            let links = SqliteLinkRepository::for_pair(&conn, self.pair_id()).list_links()?;
            (stored_a, stored_b, links)
        };
        let diffs = BySide {
            a: self.detect(Side::A, &stored_a, &fetched_a, now),
            b: self.detect(Side::B, &stored_b, &fetched_b, now),
        };

        let mut plan = self.plan(cycle_id, now, &diffs, &links);
        let mut report = CycleReport {
            cycle_id: cycle_id.to_string(),
            pair_id: self.pair_id().to_string(),
            dry_run,
            started_at,
            links_created: plan.links_created,
            ambiguous: plan.ambiguous,
            planned: plan.steps.iter().map(ApplyStep::mutation).collect(),
            ..CycleReport::default()
        };
        for side in [Side::A, Side::B] {
            let source_id = self.source(side).source_id();
            report.errors.extend(
                diffs
                    .get(side)
                    .rejected
                    .iter()
                    .map(|item| CycleError::malformed(side, source_id, item)),
            );
        }

        if dry_run {
            for step in &plan.steps {
                step.count_success(&mut report);
            }
            report.finished_at = self.clock.now_ms();
            return Ok(report);
        }

        self.apply(cycle_id, now, &mut plan, &mut report);

        report.finished_at = self.clock.now_ms();
        let writes = plan.into_writes(&report);
        let mut conn = self.store();
        commit_cycle(&mut conn, self.pair_id(), &writes)?;
        Ok(report)
    }

    fn fetch(&self, side: Side) -> Result<Vec<RemoteItem>, SyncError> {
        let started = Instant::now();
        let list_ref = self.config.side(side).list_ref.clone();
        let listed = self.remote(side, "list_items", Idempotency::Idempotent, move |source| {
            source.list_items(&list_ref)
        });
        match listed {
            Ok(items) => {
                info!(
                    "event=fetch_snapshot module=sync status=ok side={side} source_id={} items={} duration_ms={}",
                    self.source(side).source_id(),
                    items.len(),
                    started.elapsed().as_millis()
                );
                Ok(items)
            }
            Err(error) => {
                error!(
                    "event=fetch_snapshot module=sync status=error side={side} source_id={} error_kind={} duration_ms={}",
                    error.source_id,
                    error.kind.as_str(),
                    started.elapsed().as_millis()
                );
                if error.kind == SourceErrorKind::Authentication {
                    Err(SyncError::Authentication { side, error })
                } else {
                    Err(SyncError::Fetch { side, error })
                }
            }
        }
    }

    fn detect(
        &self,
        side: Side,
        stored: &[SourceItem],
        fetched: &[RemoteItem],
        now: i64,
    ) -> SnapshotDiff {
        let diff = ChangeDetector::new(side, self.config.side(side).list_ref.as_str())
            .detect(stored, fetched, now);
        info!(
            "event=detect_changes module=sync status=ok side={side} added={} changed={} removed={} unchanged={} dormant={} rejected={}",
            diff.added.len(),
            diff.changed.len(),
            diff.removed.len(),
            diff.unchanged.len(),
            diff.dormant.len(),
            diff.rejected.len()
        );
        diff
    }

    /// Link and Resolve: pure planning over this cycle's observations.
    fn plan(
        &self,
        cycle_id: &str,
        now: i64,
        diffs: &BySide<SnapshotDiff>,
        links: &[Link],
    ) -> CyclePlan {
        let mut plan = CyclePlan::default();
        let observed = BySide {
            a: index_observed(&diffs.a),
            b: index_observed(&diffs.b),
        };
        for diff in [&diffs.a, &diffs.b] {
            for item in diff.observed().chain(diff.dormant.iter()) {
                plan.upserts.insert(item_key(item), item.clone());
            }
        }

        let links_by_item = BySide {
            a: links
                .iter()
                .map(|link| (link.a_item_id.as_str(), link))
                .collect::<HashMap<_, _>>(),
            b: links
                .iter()
                .map(|link| (link.b_item_id.as_str(), link))
                .collect::<HashMap<_, _>>(),
        };

        // Removals.
        let mut retiring: BTreeSet<LinkId> = BTreeSet::new();
        let mut removal_steps = Vec::new();
        for side in [Side::A, Side::B] {
            let counterpart_side = side.other();
            for removed in &diffs.get(side).removed {
                let link = links_by_item
                    .get(side)
                    .get(removed.source_local_id.as_str())
                    .copied();
                let Some(link) = link else {
                    plan.deletions.push((side, removed.source_local_id.clone()));
                    continue;
                };
                let first_visit = retiring.insert(link.link_id.clone());
                let counterpart_id = link.item_id(counterpart_side);
                match observed.get(counterpart_side).get(counterpart_id) {
                    Some(counterpart) => removal_steps.push(ApplyStep::Removal(RemovalStep {
                        removed: removed.clone(),
                        link: link.clone(),
                        counterpart: counterpart.clone(),
                        action: self.removal_action(counterpart_side),
                    })),
                    None => {
                        // Counterpart is gone as well; nothing to propagate.
                        plan.deletions.push((side, removed.source_local_id.clone()));
                        if first_visit {
                            plan.dropped_links.push(link.link_id.clone());
                        }
                        plan.audit.push(removal_audit(cycle_id, now, removed, link, counterpart_id));
                    }
                }
            }
        }

        // Link.
        let linked: BySide<BTreeSet<&str>> = BySide {
            a: links.iter().map(|link| link.a_item_id.as_str()).collect(),
            b: links.iter().map(|link| link.b_item_id.as_str()).collect(),
        };
        let unlinked_a: Vec<SourceItem> = observed
            .a
            .values()
            .filter(|item| !linked.a.contains(item.source_local_id.as_str()))
            .cloned()
            .collect();
        let unlinked_b: Vec<SourceItem> = observed
            .b
            .values()
            .filter(|item| !linked.b.contains(item.source_local_id.as_str()))
            .cloned()
            .collect();
        let outcome = self.linker.link(&unlinked_a, &unlinked_b);

        let mut new_links = Vec::new();
        for proposed in &outcome.links {
            let link = Link::new(
                proposed.a_item_id.as_str(),
                proposed.b_item_id.as_str(),
                proposed.confidence,
                now,
            );
            debug!(
                "event=link_created module=sync status=ok link_id={} a_item_id={} b_item_id={} reason={} confidence={:.3}",
                link.link_id,
                link.a_item_id,
                link.b_item_id,
                proposed.reason.as_str(),
                link.confidence
            );
            plan.audit.push(
                AuditRecord::new(cycle_id, AuditKind::Linked, now)
                    .for_item(Side::A, link.a_item_id.as_str())
                    .with_counterpart(link.b_item_id.as_str())
                    .with_link(link.link_id.as_str()),
            );
            plan.links_created += 1;
            new_links.push(link);
        }

        for ambiguous in &outcome.ambiguous {
            let touched = diffs.a.touched(&ambiguous.a_item_id)
                || ambiguous
                    .candidate_ids
                    .iter()
                    .any(|candidate| diffs.b.touched(candidate));
            if !touched {
                continue;
            }
            warn!(
                "event=ambiguous_match module=sync status=warn a_item_id={} candidates={} reason={}",
                ambiguous.a_item_id,
                ambiguous.candidate_ids.len(),
                ambiguous.reason.as_str()
            );
            plan.audit.push(
                AuditRecord::new(cycle_id, AuditKind::AmbiguousMatch, now)
                    .for_item(Side::A, ambiguous.a_item_id.as_str())
                    .with_after(AuditPayload::Candidates {
                        candidate_ids: ambiguous.candidate_ids.clone(),
                        score: ambiguous.score,
                    }),
            );
            plan.ambiguous += 1;
        }

        for link in links.iter().chain(new_links.iter()) {
            plan.mark_linked(Side::A, &link.a_item_id);
            plan.mark_linked(Side::B, &link.b_item_id);
        }

        // New items, and items deferred earlier that never got a link.
        let mut creation_steps = Vec::new();
        for (side, orphans) in [(Side::A, &outcome.orphans_a), (Side::B, &outcome.orphans_b)] {
            for orphan_id in orphans {
                let Some(origin) = observed.get(side).get(orphan_id.as_str()) else {
                    continue;
                };
                let is_new = diffs.get(side).kind_of(orphan_id) == Some(ChangeKind::Added);
                if !is_new && origin.ever_linked {
                    continue;
                }
                creation_steps.push(ApplyStep::Creation(CreationStep {
                    origin: origin.clone(),
                    target: side.other(),
                }));
            }
        }

        // Resolve.
        let mut update_steps = Vec::new();
        let existing = links
            .iter()
            .filter(|link| !retiring.contains(&link.link_id))
            .map(|link| (link, false));
        let fresh = new_links.iter().map(|link| (link, true));
        for (link, new_link) in existing.chain(fresh) {
            let (Some(a), Some(b)) = (
                observed.a.get(link.a_item_id.as_str()),
                observed.b.get(link.b_item_id.as_str()),
            ) else {
                continue;
            };
            let context = DivergenceContext {
                a_changed: diffs.a.touched(&a.source_local_id),
                b_changed: diffs.b.touched(&b.source_local_id),
                new_link,
            };
            if let Some(resolution) = self.resolver.resolve(link, a, b, context) {
                let loser = match resolution.loser {
                    Side::A => a.clone(),
                    Side::B => b.clone(),
                };
                update_steps.push(ApplyStep::Update(UpdateStep { resolution, loser }));
            }
        }
        update_steps.sort_by(|left, right| left.sort_key().cmp(&right.sort_key()));

        plan.new_links = new_links;
        plan.steps = removal_steps;
        plan.steps.extend(creation_steps);
        plan.steps.extend(update_steps);
        plan
    }

    fn removal_action(&self, counterpart_side: Side) -> RemovalAction {
        match self.source(counterpart_side).delete_capability() {
            DeleteCapability::HardDelete => RemovalAction::HardDelete,
            DeleteCapability::Unsupported => self.removal_fallback(),
        }
    }

    fn removal_fallback(&self) -> RemovalAction {
        match self.config.removal.fallback {
            RemovalFallback::Complete => RemovalAction::Complete,
            RemovalFallback::Ignore => RemovalAction::DropLinkOnly,
        }
    }

    fn apply(&self, cycle_id: &str, now: i64, plan: &mut CyclePlan, report: &mut CycleReport) {
        let steps = std::mem::take(&mut plan.steps);
        for (position, step) in steps.iter().enumerate() {
            if self.stop.is_stop_requested() {
                report.cancelled = true;
                info!(
                    "event=sync_cancel module=sync status=ok cycle_id={cycle_id} skipped={}",
                    steps.len() - position
                );
                skip_remaining(&steps[position..], plan, report);
                break;
            }

            let result = match step {
                ApplyStep::Removal(removal) => self.apply_removal(cycle_id, now, removal, plan, report),
                ApplyStep::Creation(creation) => {
                    self.apply_creation(cycle_id, now, creation, plan, report)
                }
                ApplyStep::Update(update) => self.apply_update(cycle_id, now, update, plan, report),
            };

            if let Err(failure) = result {
                plan.release(step);
                let is_auth = failure.kind == CycleErrorKind::Authentication;
                report.errors.push(failure);
                if is_auth {
                    report.aborted = true;
                    warn!(
                        "event=sync_abort module=sync status=warn cycle_id={cycle_id} reason=authentication skipped={}",
                        steps.len() - position - 1
                    );
                    skip_remaining(&steps[position + 1..], plan, report);
                    break;
                }
            }
        }
    }

    fn apply_removal(
        &self,
        cycle_id: &str,
        now: i64,
        step: &RemovalStep,
        plan: &mut CyclePlan,
        report: &mut CycleReport,
    ) -> Result<(), CycleError> {
        let counterpart = &step.counterpart;
        let target = counterpart.side;

        let action = match step.action {
            RemovalAction::HardDelete => {
                let item_id = counterpart.source_local_id.clone();
                let outcome = self
                    .remote(target, "delete_item", Idempotency::Idempotent, move |source| {
                        source.delete_item(&item_id)
                    })
                    .map_err(|err| self.step_error(target, "delete_item", counterpart, &err))?;
                match outcome {
                    DeleteOutcome::Deleted => RemovalAction::HardDelete,
                    DeleteOutcome::Unsupported => {
                        info!(
                            "event=delete_fallback module=sync status=ok side={target} source_local_id={}",
                            counterpart.source_local_id
                        );
                        self.removal_fallback()
                    }
                }
            }
            other => other,
        };
        if action == RemovalAction::Complete {
            let item_id = counterpart.source_local_id.clone();
            self.remote(target, "complete_item", Idempotency::Idempotent, move |source| {
                source.complete_item(&item_id)
            })
            .map_err(|err| self.step_error(target, "complete_item", counterpart, &err))?;
        }

        if action != RemovalAction::DropLinkOnly {
            let mut gone = counterpart.clone();
            gone.deleted = true;
            gone.checked = gone.checked || action == RemovalAction::Complete;
            gone.synthetic_modified_at = now;
            gone.last_seen_at = now;
            plan.upserts.insert(item_key(&gone), gone);
        }
        plan.deletions
            .push((step.removed.side, step.removed.source_local_id.clone()));
        plan.dropped_links.push(step.link.link_id.clone());
        plan.audit.push(removal_audit(
            cycle_id,
            now,
            &step.removed,
            &step.link,
            &counterpart.source_local_id,
        ));
        report.removed += 1;
        debug!(
            "event=apply_step module=sync status=ok op=removal side={target} source_local_id={} action={}",
            counterpart.source_local_id,
            action.as_str()
        );
        Ok(())
    }

    fn apply_creation(
        &self,
        cycle_id: &str,
        now: i64,
        step: &CreationStep,
        plan: &mut CyclePlan,
        report: &mut CycleReport,
    ) -> Result<(), CycleError> {
        let origin = &step.origin;
        let target = step.target;
        let list_ref = self.config.side(target).list_ref.clone();

        let call_list_ref = list_ref.clone();
        let display_name = origin.display_name.clone();
        let checked = origin.checked;
        let created_id = self
            .remote(target, "create_item", Idempotency::NotIdempotent, move |source| {
                source.create_item(&call_list_ref, &display_name, checked)
            })
            .and_then(|created_id| {
                if created_id.trim().is_empty() {
                    Err(SourceError::new(
                        self.source(target).source_id(),
                        SourceErrorKind::Rejected,
                        "create_item returned an empty id",
                    ))
                } else {
                    Ok(created_id)
                }
            })
            .map_err(|err| {
                warn!(
                    "event=apply_step module=sync status=error op=create_item side={target} origin_item_id={} error_kind={}",
                    origin.source_local_id,
                    err.kind.as_str()
                );
                CycleError::from_source(
                    target,
                    "create_item",
                    None,
                    Some(origin.display_name.as_str()),
                    &err,
                )
            })?;

        let mut created = SourceItem::observed(
            target,
            list_ref,
            &RemoteItem::new(created_id.as_str(), origin.display_name.as_str(), origin.checked),
            now,
        );
        created.ever_linked = true;
        let link = match target {
            Side::B => Link::new(origin.source_local_id.as_str(), created_id.as_str(), 1.0, now),
            Side::A => Link::new(created_id.as_str(), origin.source_local_id.as_str(), 1.0, now),
        };
        plan.audit.push(
            AuditRecord::new(cycle_id, AuditKind::Added, now)
                .for_item(target, created_id.as_str())
                .with_counterpart(origin.source_local_id.as_str())
                .with_link(link.link_id.as_str())
                .with_after(AuditPayload::Item(origin.state())),
        );
        plan.upserts.insert(item_key(&created), created);
        plan.mark_linked(origin.side, &origin.source_local_id);
        plan.new_links.push(link);
        report.added += 1;
        report.links_created += 1;
        debug!(
            "event=apply_step module=sync status=ok op=create_item side={target} source_local_id={created_id} origin_item_id={}",
            origin.source_local_id
        );
        Ok(())
    }

    fn apply_update(
        &self,
        cycle_id: &str,
        now: i64,
        step: &UpdateStep,
        plan: &mut CyclePlan,
        report: &mut CycleReport,
    ) -> Result<(), CycleError> {
        let resolution = &step.resolution;
        let target = resolution.loser;
        let item_id = resolution.loser_item_id.clone();
        let patch = resolution.patch.clone();
        self.remote(target, "update_item", Idempotency::Idempotent, move |source| {
            source.update_item(&item_id, &patch)
        })
        .map_err(|err| self.step_error(target, "update_item", &step.loser, &err))?;

        let state = resolution.resulting_state();
        let mut updated = step.loser.clone();
        updated.display_name = state.display_name;
        updated.checked = state.checked;
        updated.synthetic_modified_at = now;
        updated.last_seen_at = now;
        plan.upserts.insert(item_key(&updated), updated);
        plan.audit.push(resolution.audit_record(cycle_id, now));
        match resolution.class {
            ResolutionClass::Updated => report.updated += 1,
            ResolutionClass::ConflictResolved => report.conflicts_resolved += 1,
        }
        debug!(
            "event=apply_step module=sync status=ok op=update_item side={target} source_local_id={} winner={}",
            resolution.loser_item_id,
            resolution.winner
        );
        Ok(())
    }

    fn step_error(
        &self,
        side: Side,
        operation: &'static str,
        item: &SourceItem,
        err: &SourceError,
    ) -> CycleError {
        warn!(
            "event=apply_step module=sync status=error op={operation} side={side} source_local_id={} error_kind={}",
            item.source_local_id,
            err.kind.as_str()
        );
        CycleError::from_source(
            side,
            operation,
            Some(item.source_local_id.as_str()),
            Some(item.display_name.as_str()),
            err,
        )
    }

    /// Issues one remote call through the side's gate, with timeout and
    /// retries.
    fn remote<T, F>(
        &self,
        side: Side,
        label: &str,
        idempotency: Idempotency,
        op: F,
    ) -> SourceResult<T>
    where
        T: Send + 'static,
        F: Fn(&dyn SourceCollaborator) -> SourceResult<T> + Send + Sync + 'static,
    {
        let source = Arc::clone(self.source(side));
        let source_id = source.source_id().to_string();
        let gate = self.gates.get(side);
        let op = Arc::new(op);
        with_retry(&self.policy, &self.sleeper, label, idempotency, || {
            let source = Arc::clone(&source);
            let op = Arc::clone(&op);
            gate.call(&source_id, self.policy.call_timeout, move || (*op)(&*source))
        })
    }

    fn source(&self, side: Side) -> &Arc<dyn SourceCollaborator> {
        match side {
            Side::A => &self.source_a,
            Side::B => &self.source_b,
        }
    }

    fn record_success(&self) {
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        *failures = FailureState::default();
    }

    fn record_failure(&self, err: &SyncError) {
        let now = self.clock.now_ms();
        let mut failures = self.failures.lock().unwrap_or_else(PoisonError::into_inner);
        failures.consecutive_failures = failures.consecutive_failures.saturating_add(1);
        failures.next_retry_at = match err {
            SyncError::Fetch { .. } | SyncError::Store(_) => {
                let delay = self.policy.backoff_for(failures.consecutive_failures);
                let delay_ms = i64::try_from(delay.as_millis()).unwrap_or(i64::MAX);
                Some(now.saturating_add(delay_ms))
            }
            // Needs an operator before another attempt makes sense.
            SyncError::Authentication { .. }
            | SyncError::DataIntegrity(_)
            | SyncError::Config(_)
            | SyncError::CycleInProgress => None,
        };
    }
}

/// Pair of per-side values.
struct BySide<T> {
    a: T,
    b: T,
}

impl<T> BySide<T> {
    fn get(&self, side: Side) -> &T {
        match side {
            Side::A => &self.a,
            Side::B => &self.b,
        }
    }
}

type ItemKey = (Side, String);

fn item_key(item: &SourceItem) -> ItemKey {
    (item.side, item.source_local_id.clone())
}

fn index_observed(diff: &SnapshotDiff) -> BTreeMap<String, SourceItem> {
    diff.observed()
        .map(|item| (item.source_local_id.clone(), item.clone()))
        .collect()
}

fn removal_audit(
    cycle_id: &str,
    now: i64,
    removed: &SourceItem,
    link: &Link,
    counterpart_id: &str,
) -> AuditRecord {
    AuditRecord::new(cycle_id, AuditKind::Removed, now)
        .for_item(removed.side, removed.source_local_id.as_str())
        .with_counterpart(counterpart_id)
        .with_link(link.link_id.as_str())
        .with_before(AuditPayload::Item(removed.state()))
}

fn skip_remaining(steps: &[ApplyStep], plan: &mut CyclePlan, report: &mut CycleReport) {
    for step in steps {
        plan.release(step);
        report.skipped += 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RemovalAction {
    HardDelete,
    Complete,
    DropLinkOnly,
}

impl RemovalAction {
    fn as_str(self) -> &'static str {
        match self {
            Self::HardDelete => "hard_delete",
            Self::Complete => "complete",
            Self::DropLinkOnly => "drop_link_only",
        }
    }
}

#[derive(Debug, Clone)]
struct RemovalStep {
    /// Removed item, as last stored.
    removed: SourceItem,
    link: Link,
    counterpart: SourceItem,
    action: RemovalAction,
}

#[derive(Debug, Clone)]
struct CreationStep {
    origin: SourceItem,
    target: Side,
}

#[derive(Debug, Clone)]
struct UpdateStep {
    resolution: Resolution,
    loser: SourceItem,
}

#[derive(Debug, Clone)]
enum ApplyStep {
    Removal(RemovalStep),
    Creation(CreationStep),
    Update(UpdateStep),
}

impl ApplyStep {
    fn mutation(&self) -> PlannedMutation {
        match self {
            Self::Removal(step) => {
                let target = step.counterpart.side;
                let item_id = step.counterpart.source_local_id.clone();
                match step.action {
                    RemovalAction::HardDelete => PlannedMutation::Delete { target, item_id },
                    RemovalAction::Complete => PlannedMutation::Complete { target, item_id },
                    RemovalAction::DropLinkOnly => PlannedMutation::DropLinkOnly {
                        removed_side: step.removed.side,
                        removed_item_id: step.removed.source_local_id.clone(),
                        counterpart_item_id: item_id,
                    },
                }
            }
            Self::Creation(step) => PlannedMutation::Create {
                target: step.target,
                origin_item_id: step.origin.source_local_id.clone(),
                display_name: step.origin.display_name.clone(),
                checked: step.origin.checked,
            },
            Self::Update(step) => PlannedMutation::Update {
                target: step.resolution.loser,
                item_id: step.resolution.loser_item_id.clone(),
                patch: step.resolution.patch.clone(),
                class: step.resolution.class,
            },
        }
    }

    /// Counts this step as if it succeeded.
    fn count_success(&self, report: &mut CycleReport) {
        match self {
            Self::Removal(_) => report.removed += 1,
            Self::Creation(_) => {
                report.added += 1;
                report.links_created += 1;
            }
            Self::Update(step) => match step.resolution.class {
                ResolutionClass::Updated => report.updated += 1,
                ResolutionClass::ConflictResolved => report.conflicts_resolved += 1,
            },
        }
    }

    fn sort_key(&self) -> (String, String) {
        match self {
            Self::Update(step) => {
                let (a_id, b_id) = match step.resolution.winner {
                    Side::A => (&step.resolution.winner_item_id, &step.resolution.loser_item_id),
                    Side::B => (&step.resolution.loser_item_id, &step.resolution.winner_item_id),
                };
                (a_id.clone(), b_id.clone())
            }
            Self::Removal(step) => (
                step.removed.source_local_id.clone(),
                step.counterpart.source_local_id.clone(),
            ),
            Self::Creation(step) => (step.origin.source_local_id.clone(), String::new()),
        }
    }
}

/// Store writes and remote steps staged for one cycle.
#[derive(Debug, Default)]
struct CyclePlan {
    upserts: BTreeMap<ItemKey, SourceItem>,
    deletions: Vec<(Side, String)>,
    dropped_links: Vec<LinkId>,
    new_links: Vec<Link>,
    audit: Vec<AuditRecord>,
    steps: Vec<ApplyStep>,
    links_created: u32,
    ambiguous: u32,
}

impl CyclePlan {
    /// Records that a staged item belongs to a link.
    fn mark_linked(&mut self, side: Side, item_id: &str) {
        if let Some(item) = self.upserts.get_mut(&(side, item_id.to_string())) {
            item.ever_linked = true;
        }
    }

    /// Withholds the items of a step that did not land remotely.
    fn release(&mut self, step: &ApplyStep) {
        match step {
            // The counterpart is still as observed; the removed item stays
            // active in the store and is detected as removed again.
            ApplyStep::Removal(_) => {}
            ApplyStep::Creation(step) => {
                self.upserts.remove(&item_key(&step.origin));
            }
            ApplyStep::Update(step) => {
                let resolution = &step.resolution;
                self.upserts
                    .remove(&(resolution.winner, resolution.winner_item_id.clone()));
                self.upserts
                    .remove(&(resolution.loser, resolution.loser_item_id.clone()));
            }
        }
    }

    fn into_writes(self, report: &CycleReport) -> CycleWrites {
        CycleWrites {
            upserts: self.upserts.into_values().collect(),
            deletions: self.deletions,
            dropped_links: self.dropped_links,
            new_links: self.new_links,
            audit: self.audit,
            cycle: Some(CycleRecord {
                cycle_id: report.cycle_id.clone(),
                started_at: report.started_at,
                finished_at: report.finished_at,
                added: report.added,
                updated: report.updated,
                conflicts_resolved: report.conflicts_resolved,
                removed: report.removed,
                error_count: report.error_count(),
                cancelled: report.cancelled,
            }),
        }
    }
}
