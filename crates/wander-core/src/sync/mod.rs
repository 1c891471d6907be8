//! Sync engine: reconciles the local store with the remote backend.
//!
//! A round pushes dirty trips and visits, retries unconfirmed deletes, then
//! pulls both families. Rounds never overlap; a request that arrives while
//! one is running is folded into a single follow-up round.

mod cursor;
mod deletion;
mod ledger;
mod merge;
mod photos;
mod pull;
mod push;
mod reachability;
#[cfg(test)]
mod testing;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

use crate::auth::SessionProvider;
use crate::config::SyncConfig;
use crate::db::{LocalStore, RecordFilter, RecordStore, StatusChange, WriteBatch};
use crate::error::Result;
use crate::kv::KeyValueStore;
use crate::models::{EntityKind, Place, SyncStatus, Trip, Visit};
use crate::remote::RemoteBackend;
use crate::state::{SyncSnapshot, SyncState};
use crate::util::now_utc;

pub use cursor::CursorStore;
pub use deletion::DeletionReport;
pub use ledger::PendingDeletionLedger;
pub use merge::MergeOutcome;
pub use pull::PullReport;
pub use push::PushReport;
pub use reachability::{Reachability, Transition};

/// Collaborators shared by the pipelines
pub(crate) struct SyncContext {
    pub(crate) store: Arc<dyn LocalStore>,
    pub(crate) remote: Arc<dyn RemoteBackend>,
    pub(crate) cursors: CursorStore,
    pub(crate) ledger: PendingDeletionLedger,
    pub(crate) config: SyncConfig,
}

impl SyncContext {
    pub(crate) fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteBackend>,
        kv: Arc<dyn KeyValueStore>,
        config: SyncConfig,
    ) -> Self {
        Self {
            store,
            remote,
            cursors: CursorStore::new(kv.clone()),
            ledger: PendingDeletionLedger::new(kv),
            config,
        }
    }

    /// Dirty records plus deletes the server has not confirmed
    async fn pending_count(&self) -> Result<usize> {
        let dirty = self.store.count_dirty().await?;
        let mut unconfirmed = 0;
        for kind in [EntityKind::Trip, EntityKind::Visit] {
            unconfirmed += self.ledger.entries(kind)?.len();
        }
        Ok(dirty + unconfirmed)
    }
}

/// Push and pull results for one entity family. `None` means the phase failed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FamilyReport {
    pub push: Option<PushReport>,
    pub pull: Option<PullReport>,
}

/// Summary of one sync round
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SyncReport {
    pub trips: FamilyReport,
    pub visits: FamilyReport,
    pub deletions: Option<DeletionReport>,
    /// One message per failed phase
    pub errors: Vec<String>,
}

impl SyncReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }

    fn record<T>(&mut self, phase: &str, result: Result<T>) -> Option<T> {
        match result {
            Ok(value) => Some(value),
            Err(e) => {
                tracing::error!(phase, retryable = e.is_retryable(), "Sync phase failed: {e}");
                self.errors.push(format!("{phase}: {e}"));
                None
            }
        }
    }
}

/// What a call to [`SyncEngine::sync_now`] ended up doing
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    /// A round ran; the report is for the last round when follow-ups ran
    Completed(SyncReport),
    /// Another round was already running and will run once more afterwards
    Coalesced,
    /// Believed offline; only the pending count was refreshed
    Offline,
    /// Nobody is signed in
    NoSession,
}

/// Records whose last push failed
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StuckItems {
    pub visits: Vec<Visit>,
    pub trips: Vec<Trip>,
}

impl StuckItems {
    pub fn len(&self) -> usize {
        self.visits.len() + self.trips.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct PeriodicTask {
    cancel: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

struct Inner {
    ctx: SyncContext,
    session: Arc<dyn SessionProvider>,
    reachability: Reachability,
    busy: AtomicBool,
    needs_resync: AtomicBool,
    rounds_completed: AtomicU64,
    snapshot: watch::Sender<SyncSnapshot>,
    periodic: Mutex<Option<PeriodicTask>>,
}

/// Offline-first sync orchestrator.
///
/// Cheap to clone; all clones drive the same engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<Inner>,
}

impl SyncEngine {
    /// Build an engine that assumes connectivity until told otherwise.
    pub fn new(
        store: Arc<dyn LocalStore>,
        remote: Arc<dyn RemoteBackend>,
        kv: Arc<dyn KeyValueStore>,
        session: Arc<dyn SessionProvider>,
        config: SyncConfig,
    ) -> Self {
        let (snapshot, _) = watch::channel(SyncSnapshot {
            is_online: true,
            ..SyncSnapshot::default()
        });
        Self {
            inner: Arc::new(Inner {
                ctx: SyncContext::new(store, remote, kv, config),
                session,
                reachability: Reachability::new(true),
                busy: AtomicBool::new(false),
                needs_resync: AtomicBool::new(false),
                rounds_completed: AtomicU64::new(0),
                snapshot,
                periodic: Mutex::new(None),
            }),
        }
    }

    pub fn snapshot(&self) -> SyncSnapshot {
        self.inner.snapshot.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SyncSnapshot> {
        self.inner.snapshot.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.inner.reachability.is_online()
    }

    pub fn config(&self) -> &SyncConfig {
        &self.inner.ctx.config
    }

    /// Run a sync round now.
    ///
    /// Safe to call from any number of tasks at once: only one round runs at
    /// a time, and calls made during a round collapse into one follow-up.
    pub async fn sync_now(&self) -> SyncOutcome {
        let mut outcome = self.sync_once().await;
        while matches!(outcome, SyncOutcome::Completed(_))
            && self.inner.needs_resync.swap(false, Ordering::SeqCst)
        {
            tracing::debug!("Running queued follow-up sync round");
            outcome = self.sync_once().await;
        }
        outcome
    }

    /// Forget both cursors and run a full round
    pub async fn force_sync_now(&self) -> SyncOutcome {
        for kind in [EntityKind::Trip, EntityKind::Visit] {
            if let Err(e) = self.inner.ctx.cursors.reset(kind) {
                tracing::warn!(kind = %kind, "Failed to reset sync cursor: {e}");
            }
        }
        self.inner.busy.store(false, Ordering::SeqCst);
        tracing::info!("Forcing full sync");
        self.sync_now().await
    }

    /// Leave a follow-up request for the running round.
    ///
    /// Returns false when no round is running any more, in which case the
    /// request may have landed after the round's final check and the caller
    /// has to run the round itself.
    fn queue_follow_up(&self) -> bool {
        self.inner.needs_resync.store(true, Ordering::SeqCst);
        self.inner.busy.load(Ordering::SeqCst)
    }

    async fn sync_once(&self) -> SyncOutcome {
        let inner = &self.inner;
        loop {
            if inner.busy.load(Ordering::SeqCst) {
                if self.queue_follow_up() {
                    return SyncOutcome::Coalesced;
                }
                continue;
            }
            if !inner.reachability.is_online() {
                self.refresh_pending_count().await;
                return SyncOutcome::Offline;
            }
            if inner.session.current_session().await.is_none() {
                tracing::debug!("No session, skipping sync");
                return SyncOutcome::NoSession;
            }
            if inner
                .busy
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
            {
                break;
            }
            if self.queue_follow_up() {
                return SyncOutcome::Coalesced;
            }
        }
        // This round covers every request made before it started
        inner.needs_resync.store(false, Ordering::SeqCst);
        self.publish(|snapshot| snapshot.is_syncing = true);

        let report = run_round(&inner.ctx).await;
        let pending = match inner.ctx.pending_count().await {
            Ok(count) => Some(count),
            Err(e) => {
                tracing::warn!("Failed to count pending changes: {e}");
                None
            }
        };
        let rounds = inner.rounds_completed.fetch_add(1, Ordering::AcqRel) + 1;
        let finished_at = now_utc();
        let clean = report.is_clean();
        self.publish(|snapshot| {
            snapshot.is_syncing = false;
            snapshot.last_sync_at = Some(finished_at);
            snapshot.rounds_completed = rounds;
            snapshot.state = if clean { SyncState::Synced } else { SyncState::Error };
            if let Some(pending) = pending {
                snapshot.pending_count = pending;
            }
        });
        inner.busy.store(false, Ordering::SeqCst);

        SyncOutcome::Completed(report)
    }

    /// Feed a platform connectivity report. Coming back online syncs right away.
    pub async fn on_connectivity_change(&self, online: bool) -> Option<SyncOutcome> {
        let transition = self.set_online(online)?;
        match transition {
            Transition::CameOnline => Some(self.sync_now().await),
            Transition::WentOffline => None,
        }
    }

    fn set_online(&self, online: bool) -> Option<Transition> {
        let transition = self.inner.reachability.update(online)?;
        tracing::info!(online, "Connectivity changed");
        self.publish(|snapshot| snapshot.is_online = online);
        Some(transition)
    }

    /// Ask the backend directly, for when a connectivity callback never fired
    pub async fn probe_connectivity(&self) -> bool {
        let online = match self.inner.ctx.remote.probe().await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Connectivity probe failed: {e}");
                false
            }
        };
        self.set_online(online);
        online
    }

    /// Start the periodic loop: sync now, then once per interval.
    ///
    /// Does nothing if the loop is already running.
    pub async fn resume_periodic_sync(&self) {
        let mut guard = self.inner.periodic.lock().await;
        if let Some(task) = guard.as_ref() {
            if !task.handle.is_finished() {
                return;
            }
            guard.take();
        }

        let (cancel, cancel_rx) = watch::channel(false);
        let engine = Arc::downgrade(&self.inner);
        let interval = self.inner.ctx.config.periodic_interval;
        let handle = tokio::spawn(run_periodic(engine, interval, cancel_rx));
        *guard = Some(PeriodicTask { cancel, handle });
        tracing::info!(interval_secs = interval.as_secs(), "Periodic sync started");
    }

    /// Stop scheduling rounds. A round already running is left to finish.
    pub async fn pause_periodic_sync(&self) {
        if let Some(task) = self.inner.periodic.lock().await.take() {
            let _ = task.cancel.send(true);
            tracing::info!("Periodic sync paused");
        }
    }

    pub async fn is_periodic_sync_running(&self) -> bool {
        self.inner
            .periodic
            .lock()
            .await
            .as_ref()
            .is_some_and(|task| !task.handle.is_finished())
    }

    /// Store a visit edit; it is pushed on the next round.
    pub async fn save_visit(&self, mut visit: Visit) -> Result<Visit> {
        visit.sync_status = SyncStatus::Pending;
        visit.updated_at = now_utc();
        let mut batch = WriteBatch::default();
        batch.upsert(visit.clone());
        self.inner.ctx.store.apply(batch).await?;
        self.refresh_pending_count().await;
        Ok(visit)
    }

    /// Store a trip edit; it is pushed on the next round.
    pub async fn save_trip(&self, mut trip: Trip) -> Result<Trip> {
        trip.sync_status = SyncStatus::Pending;
        trip.updated_at = now_utc();
        let mut batch = WriteBatch::default();
        batch.upsert(trip.clone());
        self.inner.ctx.store.apply(batch).await?;
        self.refresh_pending_count().await;
        Ok(trip)
    }

    pub async fn save_place(&self, place: Place) -> Result<()> {
        let mut batch = WriteBatch::default();
        batch.places.push(place);
        self.inner.ctx.store.apply(batch).await
    }

    /// Delete a visit locally and try the server.
    ///
    /// Returns whether the server confirmed; an unconfirmed delete is
    /// retried every round and never undone by a pull.
    pub async fn delete_visit(&self, id: &str) -> Result<bool> {
        self.delete_visits(&[id.to_string()]).await
    }

    pub async fn delete_visits(&self, ids: &[String]) -> Result<bool> {
        let confirmed =
            deletion::delete_records::<Visit>(&self.inner.ctx, ids, self.is_online()).await?;
        self.refresh_pending_count().await;
        Ok(confirmed)
    }

    pub async fn delete_trip(&self, id: &str) -> Result<bool> {
        self.delete_trips(&[id.to_string()]).await
    }

    pub async fn delete_trips(&self, ids: &[String]) -> Result<bool> {
        let confirmed =
            deletion::delete_records::<Trip>(&self.inner.ctx, ids, self.is_online()).await?;
        self.refresh_pending_count().await;
        Ok(confirmed)
    }

    /// Records stuck in `failed`
    pub async fn stuck_items(&self) -> Result<StuckItems> {
        let store = self.inner.ctx.store.as_ref();
        let failed = RecordFilter::Status(SyncStatus::Failed);
        Ok(StuckItems {
            visits: RecordStore::<Visit>::fetch(store, &failed).await?,
            trips: RecordStore::<Trip>::fetch(store, &failed).await?,
        })
    }

    /// Mark every stuck record `synced`, giving up on pushing it.
    ///
    /// The local edits stay on this device but are never uploaded.
    pub async fn dismiss_stuck_items(&self) -> Result<usize> {
        let stuck = self.stuck_items().await?;
        if stuck.is_empty() {
            return Ok(0);
        }

        let mut batch = WriteBatch::default();
        for visit in &stuck.visits {
            batch.set_status(StatusChange::set(EntityKind::Visit, &visit.id, SyncStatus::Synced));
        }
        for trip in &stuck.trips {
            batch.set_status(StatusChange::set(EntityKind::Trip, &trip.id, SyncStatus::Synced));
        }
        self.inner.ctx.store.apply(batch).await?;
        tracing::warn!(count = stuck.len(), "Dismissed stuck records");
        self.refresh_pending_count().await;
        Ok(stuck.len())
    }

    /// Photo-upload completion: rewrite placeholder tokens and queue a resync.
    pub async fn apply_photo_uploads(
        &self,
        visit_id: &str,
        uploads: &HashMap<String, String>,
    ) -> Result<bool> {
        let changed = photos::apply_photo_uploads(&self.inner.ctx, visit_id, uploads).await?;
        if changed {
            self.inner.needs_resync.store(true, Ordering::SeqCst);
            self.refresh_pending_count().await;
        }
        Ok(changed)
    }

    /// Recount pending changes and publish the result
    pub async fn refresh_pending_count(&self) -> Option<usize> {
        match self.inner.ctx.pending_count().await {
            Ok(count) => {
                self.publish(|snapshot| snapshot.pending_count = count);
                Some(count)
            }
            Err(e) => {
                tracing::warn!("Failed to count pending changes: {e}");
                None
            }
        }
    }

    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        self.inner.snapshot.borrow().last_sync_at
    }

    fn publish(&self, update: impl FnOnce(&mut SyncSnapshot)) {
        self.inner.snapshot.send_modify(|snapshot| {
            update(snapshot);
            if !snapshot.is_online {
                snapshot.state = SyncState::Offline;
            } else if snapshot.is_syncing {
                snapshot.state = SyncState::Syncing;
            } else if matches!(snapshot.state, SyncState::Offline | SyncState::Syncing) {
                snapshot.state = SyncState::Synced;
            }
        });
    }
}

async fn run_round(ctx: &SyncContext) -> SyncReport {
    let mut report = SyncReport::default();

    report.trips.push = report.record("push trips", push::push_trips(ctx).await);
    report.visits.push = report.record("push visits", push::push_visits(ctx).await);
    report.deletions = report.record(
        "retry deletions",
        deletion::retry_pending_deletions(ctx).await,
    );
    report.trips.pull = report.record("pull trips", pull::pull_trips(ctx).await);
    report.visits.pull = report.record("pull visits", pull::pull_visits(ctx).await);

    let pushed = [report.trips.push, report.visits.push]
        .iter()
        .flatten()
        .map(|push| push.pushed)
        .sum::<usize>();
    let pulled = [report.trips.pull, report.visits.pull]
        .iter()
        .flatten()
        .map(|pull| pull.merge.changed())
        .sum::<usize>();
    tracing::info!(
        pushed,
        pulled,
        deletions_confirmed = report.deletions.map_or(0, |d| d.confirmed),
        errors = report.errors.len(),
        "Sync round finished"
    );
    report
}

async fn run_periodic(
    engine: Weak<Inner>,
    interval: std::time::Duration,
    mut cancel: watch::Receiver<bool>,
) {
    loop {
        if *cancel.borrow() {
            break;
        }
        let Some(inner) = engine.upgrade() else {
            break;
        };
        let engine_handle = SyncEngine { inner };
        if !engine_handle.is_online() {
            engine_handle.probe_connectivity().await;
        }
        engine_handle.sync_now().await;
        drop(engine_handle);

        tokio::select! {
            () = tokio::time::sleep(interval) => {}
            _ = cancel.changed() => break,
        }
    }
    tracing::debug!("Periodic sync loop stopped");
}
