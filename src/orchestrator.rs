//! Public entry point: start, advance, finish, progress and reset.
//!
//! Each mutating call holds the user's lock for its whole duration and runs
//! its storage work as one IMMEDIATE transaction on the blocking pool. A
//! transaction that overruns its deadline, or whose caller dropped the call,
//! is rolled back, never committed.

use crate::NarrativeError;
use crate::config::{EngineConfig, NarrativeConfig};
use crate::db::{self, DbHandle};
use crate::events::{NarrativeEvent, grant_events};
use crate::fragment::{ClueCode, Fragment, FragmentId, FragmentKind};
use crate::fragment_store::{FragmentStore, GraphReport};
use crate::gate::{Access, AccessGate, DenyReason};
use crate::metrics;
use crate::progress::{UserProgressState, UserProgressTracker};
use crate::rewards::{CollaboratorError, GrantResult, RewardGrantEngine};
use log::{info, log, warn};
use rusqlite::{Connection, Transaction, TransactionBehavior};
use serde::Serialize;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::OwnedMutexGuard;

#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub lock_timeout: Duration,
    pub transition_timeout: Duration,
    pub retry_on_conflict: bool,
}

impl Default for EngineSettings {
    fn default() -> Self {
        EngineSettings::from(&EngineConfig::default())
    }
}

impl From<&EngineConfig> for EngineSettings {
    fn from(config: &EngineConfig) -> Self {
        Self {
            lock_timeout: config.lock_timeout(),
            transition_timeout: config.transition_timeout(),
            retry_on_conflict: config.retry_on_conflict,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum NarrativeState {
    NotStarted,
    AtFragment { fragment_id: FragmentId },
    Terminal { fragment_id: FragmentId },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChoiceView {
    pub index: usize,
    pub text: String,
    pub available: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub missing_clues: Vec<ClueCode>,
}

/// A fragment as seen by one user, with each choice marked open or locked.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FragmentView {
    pub id: FragmentId,
    pub title: String,
    pub body: String,
    pub kind: FragmentKind,
    pub terminal: bool,
    pub choices: Vec<ChoiceView>,
}

impl FragmentView {
    pub fn new(fragment: &Fragment, progress: &UserProgressState, gate: &AccessGate) -> Self {
        let choices = fragment
            .choices
            .iter()
            .enumerate()
            .map(|(index, choice)| {
                let missing_clues = match gate.can_choose(progress, fragment, index) {
                    Access::Denied(DenyReason::MissingClues(missing)) => missing,
                    _ => Vec::new(),
                };
                ChoiceView {
                    index,
                    text: choice.text.clone(),
                    available: missing_clues.is_empty(),
                    missing_clues,
                }
            })
            .collect();
        Self {
            id: fragment.id.clone(),
            title: fragment.title.clone(),
            body: fragment.body.clone(),
            kind: fragment.kind,
            terminal: fragment.is_terminal(),
            choices,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Transition {
    pub fragment: FragmentView,
    pub grant: GrantResult,
    pub events: Vec<NarrativeEvent>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProgressSummary {
    pub user_id: String,
    pub state: NarrativeState,
    pub current_fragment_id: Option<FragmentId>,
    pub percentage: f64,
    pub visited: usize,
    pub completed: usize,
    pub unlocked_clues: Vec<ClueCode>,
}

/// Commit gate for one transition attempt. Past `at`, or once the caller
/// has dropped the transition future, the transaction rolls back.
struct Deadline {
    at: Instant,
    budget: Duration,
    abandoned: Arc<AtomicBool>,
}

impl Deadline {
    fn starting_now(budget: Duration, abandoned: Arc<AtomicBool>) -> Self {
        Self {
            at: Instant::now() + budget,
            budget,
            abandoned,
        }
    }

    fn commit(&self, tx: Transaction<'_>) -> Result<(), NarrativeError> {
        if self.abandoned.load(Ordering::Acquire) {
            tx.rollback()?;
            return Err(NarrativeError::Cancelled);
        }
        if Instant::now() >= self.at {
            tx.rollback()?;
            return Err(NarrativeError::Timeout(self.budget));
        }
        tx.commit()?;
        Ok(())
    }
}

/// Flags the blocking half of a transition when its async caller goes away.
struct AbandonOnDrop(Arc<AtomicBool>);

impl Drop for AbandonOnDrop {
    fn drop(&mut self) {
        self.0.store(true, Ordering::Release);
    }
}

#[derive(Default)]
struct UserLocks {
    slots: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

struct UserLockGuard<'a> {
    locks: &'a UserLocks,
    user_id: String,
    guard: Option<OwnedMutexGuard<()>>,
}

impl Drop for UserLockGuard<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut slots = self.locks.slots.lock().unwrap_or_else(|e| e.into_inner());
        let idle = slots
            .get(&self.user_id)
            .is_some_and(|slot| Arc::strong_count(slot) == 1);
        if idle {
            slots.remove(&self.user_id);
        }
    }
}

impl UserLocks {
    async fn acquire(&self, user_id: &str, wait: Duration) -> Result<UserLockGuard<'_>, NarrativeError> {
        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            Arc::clone(slots.entry(user_id.to_string()).or_default())
        };
        match tokio::time::timeout(wait, slot.lock_owned()).await {
            Ok(guard) => Ok(UserLockGuard {
                locks: self,
                user_id: user_id.to_string(),
                guard: Some(guard),
            }),
            Err(_) => Err(NarrativeError::ConcurrencyConflict(format!(
                "another transition for {user_id} is still running"
            ))),
        }
    }
}

struct Engine {
    db: DbHandle,
    fragments: Arc<FragmentStore>,
    tracker: Arc<UserProgressTracker>,
    gate: AccessGate,
    rewards: Arc<RewardGrantEngine>,
}

fn begin(conn: &mut Connection) -> Result<Transaction<'_>, NarrativeError> {
    Ok(conn.transaction_with_behavior(TransactionBehavior::Immediate)?)
}

fn collaborator_error(e: CollaboratorError) -> NarrativeError {
    match e {
        CollaboratorError::Database(e) => e.into(),
        CollaboratorError::Rejected(msg) => NarrativeError::Internal(msg),
    }
}

impl Engine {
    fn start_tx(
        &self,
        conn: &mut Connection,
        user_id: &str,
        entry: &str,
        deadline: &Deadline,
    ) -> Result<Transition, NarrativeError> {
        let tx = begin(conn)?;
        let progress = self.tracker.get_or_create(&tx, user_id)?;
        let fragment = self.fragments.get(entry)?;

        match progress.current_fragment.as_deref() {
            Some(current) if current == entry => {
                // Replayed start: nothing to change.
                return Ok(Transition {
                    fragment: FragmentView::new(&fragment, &progress, &self.gate),
                    grant: GrantResult::default(),
                    events: Vec::new(),
                });
            }
            Some(current) => {
                return Err(NarrativeError::InvalidTransition(format!(
                    "{user_id} already started at {current}"
                )));
            }
            None => {}
        }

        self.gate.can_enter(&progress, &fragment).into_result(&fragment)?;
        self.tracker.set_current_fragment(&tx, user_id, entry)?;
        let after = self.tracker.get_or_create(&tx, user_id)?;
        let view = FragmentView::new(&fragment, &after, &self.gate);
        deadline.commit(tx)?;

        info!("{user_id} started at {entry}");
        Ok(Transition {
            fragment: view,
            grant: GrantResult::default(),
            events: vec![NarrativeEvent::FragmentEntered {
                fragment_id: entry.to_string(),
            }],
        })
    }

    fn advance_tx(
        &self,
        conn: &mut Connection,
        user_id: &str,
        index: usize,
        deadline: &Deadline,
    ) -> Result<Transition, NarrativeError> {
        let tx = begin(conn)?;
        let progress = self.tracker.get_or_create(&tx, user_id)?;
        let current_id = progress
            .current_fragment
            .clone()
            .ok_or_else(|| NarrativeError::NoActiveFragment(user_id.to_string()))?;
        let current = self.fragments.get(&current_id)?;

        let Some(choice) = current.choices.get(index) else {
            return Err(NarrativeError::InvalidChoice {
                fragment_id: current.id.clone(),
                index,
                available: current.choices.len(),
            });
        };
        self.gate
            .can_choose(&progress, &current, index)
            .into_result(&current)?;

        let target = self.fragments.get(&choice.target)?;
        // Entry is judged on the state before this fragment's triggers fire.
        self.gate.can_enter(&progress, &target).into_result(&target)?;

        let grant = self.rewards.apply_triggers(&tx, user_id, &current)?;
        self.tracker.set_current_fragment(&tx, user_id, &target.id)?;

        let after = self.tracker.get_or_create(&tx, user_id)?;
        debug_assert!(after.completed.is_subset(&after.visited));
        let view = FragmentView::new(&target, &after, &self.gate);
        deadline.commit(tx)?;

        info!("{user_id} advanced {} -> {} via choice {index}", current.id, target.id);
        let mut events = grant_events(&current.id, &grant);
        events.push(NarrativeEvent::FragmentEntered {
            fragment_id: target.id.clone(),
        });
        Ok(Transition {
            fragment: view,
            grant,
            events,
        })
    }

    fn finish_tx(
        &self,
        conn: &mut Connection,
        user_id: &str,
        deadline: &Deadline,
    ) -> Result<Transition, NarrativeError> {
        let tx = begin(conn)?;
        let progress = self.tracker.get_or_create(&tx, user_id)?;
        let current_id = progress
            .current_fragment
            .clone()
            .ok_or_else(|| NarrativeError::NoActiveFragment(user_id.to_string()))?;
        let current = self.fragments.get(&current_id)?;
        if !current.is_terminal() {
            return Err(NarrativeError::InvalidTransition(format!(
                "{current_id} still has choices; advance instead"
            )));
        }

        let grant = self.rewards.apply_triggers(&tx, user_id, &current)?;
        let after = self.tracker.get_or_create(&tx, user_id)?;
        let view = FragmentView::new(&current, &after, &self.gate);
        deadline.commit(tx)?;

        info!("{user_id} finished {current_id}");
        Ok(Transition {
            events: grant_events(&current.id, &grant),
            fragment: view,
            grant,
        })
    }

    fn reset_tx(&self, conn: &mut Connection, user_id: &str, deadline: &Deadline) -> Result<(), NarrativeError> {
        let tx = begin(conn)?;
        self.tracker.reset(&tx, user_id)?;
        deadline.commit(tx)?;
        info!("{user_id} progress reset");
        Ok(())
    }

    fn summary(&self, conn: &Connection, user_id: &str) -> Result<ProgressSummary, NarrativeError> {
        let progress = self
            .tracker
            .get(conn, user_id)?
            .unwrap_or_else(|| UserProgressState::new(user_id));
        let state = match progress.current_fragment.as_ref() {
            None => NarrativeState::NotStarted,
            Some(id) => match self.fragments.resolve(id) {
                Some(f) if f.is_terminal() => NarrativeState::Terminal {
                    fragment_id: id.clone(),
                },
                _ => NarrativeState::AtFragment {
                    fragment_id: id.clone(),
                },
            },
        };
        Ok(ProgressSummary {
            user_id: user_id.to_string(),
            state,
            current_fragment_id: progress.current_fragment.clone(),
            percentage: progress.percentage(&self.fragments.active_ids()),
            visited: progress.visited.len(),
            completed: progress.completed.len(),
            unlocked_clues: progress.unlocked_clues.iter().cloned().collect(),
        })
    }

    fn view_of_current(&self, conn: &Connection, user_id: &str) -> Result<FragmentView, NarrativeError> {
        let progress = self
            .tracker
            .get(conn, user_id)?
            .ok_or_else(|| NarrativeError::NoActiveFragment(user_id.to_string()))?;
        let current_id = progress
            .current_fragment
            .as_deref()
            .ok_or_else(|| NarrativeError::NoActiveFragment(user_id.to_string()))?;
        let fragment = self.fragments.get(current_id)?;
        Ok(FragmentView::new(&fragment, &progress, &self.gate))
    }
}

/// Cheap to clone; clones share the engine and the per-user locks.
#[derive(Clone)]
pub struct NarrativeOrchestrator {
    engine: Arc<Engine>,
    locks: Arc<UserLocks>,
    settings: EngineSettings,
}

impl NarrativeOrchestrator {
    pub fn new(
        db: DbHandle,
        fragments: Arc<FragmentStore>,
        tracker: Arc<UserProgressTracker>,
        gate: AccessGate,
        rewards: Arc<RewardGrantEngine>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            engine: Arc::new(Engine {
                db,
                fragments,
                tracker,
                gate,
                rewards,
            }),
            locks: Arc::new(UserLocks::default()),
            settings,
        }
    }

    /// Wire the default components over an already-migrated connection.
    pub fn from_connection(conn: Connection, settings: EngineSettings) -> Result<Self, NarrativeError> {
        let fragments = Arc::new(FragmentStore::load(&conn)?);
        let tracker = Arc::new(UserProgressTracker::new(Arc::clone(&fragments)));
        let rewards = Arc::new(RewardGrantEngine::with_sqlite_ledgers(Arc::clone(&tracker)));
        Ok(Self::new(
            db::into_handle(conn),
            fragments,
            tracker,
            AccessGate::new(),
            rewards,
            settings,
        ))
    }

    pub fn open(db_path: &Path, config: &NarrativeConfig) -> Result<Self, NarrativeError> {
        let conn = db::open_db_with_timeout(db_path, config.database.busy_timeout_ms)?;
        Self::from_connection(conn, EngineSettings::from(&config.engine))
    }

    pub fn in_memory(settings: EngineSettings) -> Result<Self, NarrativeError> {
        Self::from_connection(db::open_memory_db()?, settings)
    }

    pub fn fragments(&self) -> &FragmentStore {
        &self.engine.fragments
    }

    async fn run_blocking<T, F>(&self, f: F) -> Result<T, NarrativeError>
    where
        F: FnOnce(&Engine, &mut Connection) -> Result<T, NarrativeError> + Send + 'static,
        T: Send + 'static,
    {
        let engine = Arc::clone(&self.engine);
        tokio::task::spawn_blocking(move || {
            let mut conn = engine
                .db
                .lock()
                .map_err(|_| NarrativeError::Internal("database mutex poisoned".into()))?;
            f(&engine, &mut conn)
        })
        .await
        .map_err(|e| NarrativeError::Internal(format!("storage task failed: {e}")))?
    }

    /// Wait for the user's lock, retrying the wait once on timeout.
    async fn lock_user(&self, user_id: &str) -> Result<UserLockGuard<'_>, NarrativeError> {
        match self.locks.acquire(user_id, self.settings.lock_timeout).await {
            Err(NarrativeError::ConcurrencyConflict(msg)) if self.settings.retry_on_conflict => {
                warn!("lock wait for {user_id} timed out, retrying once: {msg}");
                self.locks.acquire(user_id, self.settings.lock_timeout).await
            }
            other => other,
        }
    }

    /// Run one transition, retrying once on a storage conflict.
    async fn transact<T, F>(&self, f: F) -> Result<T, NarrativeError>
    where
        F: Fn(&Engine, &mut Connection, &Deadline) -> Result<T, NarrativeError> + Send + Sync + 'static,
        T: Send + 'static,
    {
        let f = Arc::new(f);
        let abandoned = Arc::new(AtomicBool::new(false));
        // Set on every exit; by then a finished attempt no longer reads it.
        let _abandon = AbandonOnDrop(Arc::clone(&abandoned));
        let mut retried = false;
        loop {
            let deadline = Deadline::starting_now(self.settings.transition_timeout, Arc::clone(&abandoned));
            let step = Arc::clone(&f);
            let res = self
                .run_blocking(move |engine, conn| step(engine, conn, &deadline))
                .await;
            match res {
                Err(NarrativeError::ConcurrencyConflict(msg))
                    if self.settings.retry_on_conflict && !retried =>
                {
                    warn!("storage conflict, retrying once: {msg}");
                    retried = true;
                }
                other => return other,
            }
        }
    }

    fn observe<T>(
        &self,
        op: &'static str,
        user_id: &str,
        started: Instant,
        res: Result<T, NarrativeError>,
    ) -> Result<T, NarrativeError> {
        match &res {
            Ok(_) => metrics::record_transition(op, "ok", started),
            Err(e) => {
                log!(e.severity(), "{op} for {user_id} failed: {e}");
                metrics::record_transition(op, e.kind(), started);
            }
        }
        res
    }

    /// Enter the story at `entry`. Only valid from the not-started state.
    pub async fn start(&self, user_id: &str, entry: &str) -> Result<Transition, NarrativeError> {
        let started = Instant::now();
        let res = async {
            let _lock = self.lock_user(user_id).await?;
            let user = user_id.to_string();
            let entry = entry.to_string();
            self.transact(move |engine, conn, deadline| engine.start_tx(conn, &user, &entry, deadline))
                .await
        }
        .await;
        self.observe("start", user_id, started, res)
    }

    /// Take choice `index` from the user's current fragment.
    pub async fn advance(&self, user_id: &str, index: usize) -> Result<Transition, NarrativeError> {
        let started = Instant::now();
        let res = async {
            let _lock = self.lock_user(user_id).await?;
            let user = user_id.to_string();
            self.transact(move |engine, conn, deadline| engine.advance_tx(conn, &user, index, deadline))
                .await
        }
        .await;
        self.observe("advance", user_id, started, res)
    }

    /// Complete a terminal fragment so its triggers fire without moving on.
    pub async fn finish(&self, user_id: &str) -> Result<Transition, NarrativeError> {
        let started = Instant::now();
        let res = async {
            let _lock = self.lock_user(user_id).await?;
            let user = user_id.to_string();
            self.transact(move |engine, conn, deadline| engine.finish_tx(conn, &user, deadline))
                .await
        }
        .await;
        self.observe("finish", user_id, started, res)
    }

    pub async fn reset(&self, user_id: &str) -> Result<(), NarrativeError> {
        let started = Instant::now();
        let res = async {
            let _lock = self.lock_user(user_id).await?;
            let user = user_id.to_string();
            self.transact(move |engine, conn, deadline| engine.reset_tx(conn, &user, deadline))
                .await
        }
        .await;
        self.observe("reset", user_id, started, res)
    }

    pub async fn get_progress(&self, user_id: &str) -> Result<ProgressSummary, NarrativeError> {
        let user = user_id.to_string();
        self.run_blocking(move |engine, conn| engine.summary(conn, &user))
            .await
    }

    pub async fn current_view(&self, user_id: &str) -> Result<FragmentView, NarrativeError> {
        let user = user_id.to_string();
        self.run_blocking(move |engine, conn| engine.view_of_current(conn, &user))
            .await
    }

    pub async fn points_balance(&self, user_id: &str) -> Result<i64, NarrativeError> {
        let user = user_id.to_string();
        self.run_blocking(move |engine, conn| {
            engine
                .rewards
                .points()
                .balance(conn, &user)
                .map_err(collaborator_error)
        })
        .await
    }

    pub async fn import_fragments(&self, batch: Vec<Fragment>) -> Result<usize, NarrativeError> {
        self.run_blocking(move |engine, conn| engine.fragments.import(conn, batch))
            .await
    }

    pub async fn deactivate_fragment(&self, id: &str) -> Result<(), NarrativeError> {
        let id = id.to_string();
        self.run_blocking(move |engine, conn| engine.fragments.deactivate(conn, &id))
            .await
    }

    pub fn validate_graph(&self) -> GraphReport {
        self.engine.fragments.validate_graph()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fragment::{Choice, TriggerPayload};

    fn story() -> Vec<Fragment> {
        vec![
            Fragment::new("F1", FragmentKind::Decision, "Crossroads")
                .with_choice(Choice::new("North", "F2").requiring(["KEY1"]))
                .with_choice(Choice::new("South", "F3")),
            Fragment::new("F2", FragmentKind::Story, "Vault"),
            Fragment::new("F3", FragmentKind::Story, "Garden").with_triggers(TriggerPayload {
                points: Some(5),
                ..Default::default()
            }),
        ]
    }

    async fn engine() -> NarrativeOrchestrator {
        let orch = NarrativeOrchestrator::in_memory(EngineSettings::default()).unwrap();
        orch.import_fragments(story()).await.unwrap();
        orch
    }

    #[tokio::test]
    async fn view_marks_locked_choices() {
        let orch = engine().await;
        let t = orch.start("u1", "F1").await.unwrap();
        assert_eq!(t.fragment.choices.len(), 2);
        assert!(!t.fragment.choices[0].available);
        assert_eq!(t.fragment.choices[0].missing_clues, vec!["KEY1".to_string()]);
        assert!(t.fragment.choices[1].available);
        assert!(!t.fragment.terminal);
    }

    #[tokio::test]
    async fn replayed_start_is_harmless() {
        let orch = engine().await;
        orch.start("u1", "F1").await.unwrap();
        let again = orch.start("u1", "F1").await.unwrap();
        assert!(again.events.is_empty());
        assert_eq!(again.fragment.id, "F1");
    }

    #[tokio::test]
    async fn start_elsewhere_after_starting_is_rejected() {
        let orch = engine().await;
        orch.start("u1", "F1").await.unwrap();
        let err = orch.start("u1", "F3").await.unwrap_err();
        assert!(matches!(err, NarrativeError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn start_unknown_fragment_is_not_found() {
        let orch = engine().await;
        let err = orch.start("u1", "F404").await.unwrap_err();
        assert!(matches!(err, NarrativeError::NotFound(_)));
        assert_eq!(err.user_message(), "This content is currently unavailable.");
    }

    #[tokio::test]
    async fn advance_before_start() {
        let orch = engine().await;
        let err = orch.advance("u1", 0).await.unwrap_err();
        assert!(matches!(err, NarrativeError::NoActiveFragment(_)));
        // Failed first touch leaves no row behind
        let summary = orch.get_progress("u1").await.unwrap();
        assert_eq!(summary.state, NarrativeState::NotStarted);
    }

    #[tokio::test]
    async fn advance_out_of_range() {
        let orch = engine().await;
        orch.start("u1", "F1").await.unwrap();
        let err = orch.advance("u1", 9).await.unwrap_err();
        assert!(matches!(
            err,
            NarrativeError::InvalidChoice {
                index: 9,
                available: 2,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn deactivated_target_is_content_unavailable() {
        let orch = engine().await;
        orch.start("u1", "F1").await.unwrap();
        orch.deactivate_fragment("F3").await.unwrap();
        let err = orch.advance("u1", 1).await.unwrap_err();
        assert!(matches!(err, NarrativeError::NotFound(ref id) if id == "F3"));

        let summary = orch.get_progress("u1").await.unwrap();
        assert_eq!(summary.current_fragment_id.as_deref(), Some("F1"));
        assert_eq!(summary.completed, 0);
    }

    #[tokio::test]
    async fn finish_requires_terminal() {
        let orch = engine().await;
        orch.start("u1", "F1").await.unwrap();
        assert!(matches!(
            orch.finish("u1").await,
            Err(NarrativeError::InvalidTransition(_))
        ));

        orch.advance("u1", 1).await.unwrap();
        let done = orch.finish("u1").await.unwrap();
        assert_eq!(done.grant.points_awarded, 5);
        assert_eq!(orch.points_balance("u1").await.unwrap(), 5);

        let summary = orch.get_progress("u1").await.unwrap();
        assert_eq!(
            summary.state,
            NarrativeState::Terminal {
                fragment_id: "F3".into()
            }
        );
        // F1 and F3 of three active fragments
        assert!((summary.percentage - 200.0 / 3.0).abs() < 1e-9);

        let again = orch.finish("u1").await.unwrap();
        assert!(again.grant.already_completed);
        assert_eq!(orch.points_balance("u1").await.unwrap(), 5);
    }

    #[tokio::test]
    async fn current_view_follows_position() {
        let orch = engine().await;
        assert!(matches!(
            orch.current_view("u1").await,
            Err(NarrativeError::NoActiveFragment(_))
        ));
        orch.start("u1", "F1").await.unwrap();
        orch.advance("u1", 1).await.unwrap();
        let view = orch.current_view("u1").await.unwrap();
        assert_eq!(view.id, "F3");
        assert!(view.terminal);
    }

    #[tokio::test]
    async fn lock_timeout_reports_conflict() {
        let orch = engine().await;
        let held = orch
            .locks
            .acquire("u1", Duration::from_millis(50))
            .await
            .unwrap();
        let err = orch
            .locks
            .acquire("u1", Duration::from_millis(20))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, NarrativeError::ConcurrencyConflict(_)));
        drop(held);
        assert!(orch.locks.acquire("u1", Duration::from_millis(20)).await.is_ok());
    }

    #[tokio::test]
    async fn lock_slots_are_pruned() {
        let orch = engine().await;
        orch.start("u1", "F1").await.unwrap();
        orch.start("u2", "F1").await.unwrap();
        let slots = orch.locks.slots.lock().unwrap();
        assert!(slots.is_empty());
    }

    fn settings_with(lock_timeout: Duration, retry_on_conflict: bool) -> EngineSettings {
        EngineSettings {
            lock_timeout,
            retry_on_conflict,
            ..EngineSettings::default()
        }
    }

    #[tokio::test]
    async fn lock_wait_is_retried_once() {
        let orch = NarrativeOrchestrator::in_memory(settings_with(Duration::from_millis(200), true)).unwrap();
        orch.import_fragments(story()).await.unwrap();
        orch.start("u1", "F1").await.unwrap();

        let held = orch.locks.acquire("u1", Duration::from_millis(50)).await.unwrap();
        let release = async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(held);
        };
        let (_, res) = tokio::join!(release, orch.advance("u1", 1));
        assert_eq!(res.unwrap().fragment.id, "F3");
    }

    #[tokio::test]
    async fn lock_wait_without_retry_conflicts() {
        let orch = NarrativeOrchestrator::in_memory(settings_with(Duration::from_millis(200), false)).unwrap();
        orch.import_fragments(story()).await.unwrap();
        orch.start("u1", "F1").await.unwrap();

        let held = orch.locks.acquire("u1", Duration::from_millis(50)).await.unwrap();
        let release = async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            drop(held);
        };
        let (_, res) = tokio::join!(release, orch.advance("u1", 1));
        assert!(matches!(res, Err(NarrativeError::ConcurrencyConflict(_))));

        let summary = orch.get_progress("u1").await.unwrap();
        assert_eq!(summary.current_fragment_id.as_deref(), Some("F1"));
    }

    #[test]
    fn abandoned_attempt_rolls_back() {
        let mut conn = db::open_memory_db().unwrap();
        let abandoned = Arc::new(AtomicBool::new(false));
        drop(AbandonOnDrop(Arc::clone(&abandoned)));
        assert!(abandoned.load(Ordering::Acquire));

        let tx = begin(&mut conn).unwrap();
        tx.execute(
            "INSERT INTO points_ledger (user_id, amount, reason) VALUES ('u1', 5, 'test')",
            [],
        )
        .unwrap();
        let deadline = Deadline::starting_now(Duration::from_secs(60), abandoned);
        assert!(matches!(deadline.commit(tx), Err(NarrativeError::Cancelled)));

        let rows: i64 = conn
            .query_row("SELECT COUNT(*) FROM points_ledger", [], |r| r.get(0))
            .unwrap();
        assert_eq!(rows, 0);
    }

    #[tokio::test]
    async fn dropped_advance_commits_nothing() {
        let orch = engine().await;
        orch.start("u1", "F1").await.unwrap();

        // Park the storage task on the connection, then give up on the call.
        let held = orch.engine.db.lock().unwrap();
        let res = tokio::time::timeout(Duration::from_millis(50), orch.advance("u1", 1)).await;
        assert!(res.is_err());
        drop(held);
        tokio::time::sleep(Duration::from_millis(200)).await;

        let summary = orch.get_progress("u1").await.unwrap();
        assert_eq!(summary.current_fragment_id.as_deref(), Some("F1"));
        assert_eq!(summary.completed, 0);
    }
}
