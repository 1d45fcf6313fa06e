//! Trigger application on fragment completion.
//!
//! All collaborator calls receive the caller's transaction so that points,
//! clues, achievements, mission progress and the completion mark commit or
//! roll back together.

use crate::NarrativeError;
use crate::fragment::{AchievementCode, ClueCode, Fragment, MissionCode};
use crate::progress::UserProgressTracker;
use log::{debug, error};
use rusqlite::{Connection, params};
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CollaboratorError {
    #[error("database: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("rejected: {0}")]
    Rejected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RewardCategory {
    Points,
    Clues,
    Achievements,
    Missions,
}

impl fmt::Display for RewardCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RewardCategory::Points => "points",
            RewardCategory::Clues => "clues",
            RewardCategory::Achievements => "achievements",
            RewardCategory::Missions => "missions",
        })
    }
}

pub trait PointsService: Send + Sync {
    /// Credit `amount` and return the new balance.
    fn award(&self, tx: &Connection, user_id: &str, amount: u32, reason: &str) -> Result<i64, CollaboratorError>;

    fn balance(&self, conn: &Connection, user_id: &str) -> Result<i64, CollaboratorError>;
}

pub trait AchievementService: Send + Sync {
    /// Returns false when the user already held the achievement.
    fn grant(&self, tx: &Connection, user_id: &str, code: &str) -> Result<bool, CollaboratorError>;
}

pub trait MissionService: Send + Sync {
    /// Apply `delta` and return the mission's new progress value.
    fn advance(&self, tx: &Connection, user_id: &str, mission: &str, delta: i64) -> Result<i64, CollaboratorError>;
}

/// Points kept as an append-only ledger in the engine database.
#[derive(Debug, Default)]
pub struct LedgerPoints;

impl PointsService for LedgerPoints {
    fn award(&self, tx: &Connection, user_id: &str, amount: u32, reason: &str) -> Result<i64, CollaboratorError> {
        tx.execute(
            "INSERT INTO points_ledger (user_id, amount, reason) VALUES (?1, ?2, ?3)",
            params![user_id, amount as i64, reason],
        )?;
        self.balance(tx, user_id)
    }

    fn balance(&self, conn: &Connection, user_id: &str) -> Result<i64, CollaboratorError> {
        Ok(conn.query_row(
            "SELECT COALESCE(SUM(amount), 0) FROM points_ledger WHERE user_id = ?1",
            params![user_id],
            |r| r.get(0),
        )?)
    }
}

#[derive(Debug, Default)]
pub struct SqliteAchievements;

impl AchievementService for SqliteAchievements {
    fn grant(&self, tx: &Connection, user_id: &str, code: &str) -> Result<bool, CollaboratorError> {
        let inserted = tx.execute(
            "INSERT OR IGNORE INTO user_achievements (user_id, code) VALUES (?1, ?2)",
            params![user_id, code],
        )?;
        Ok(inserted > 0)
    }
}

#[derive(Debug, Default)]
pub struct SqliteMissions;

impl MissionService for SqliteMissions {
    fn advance(&self, tx: &Connection, user_id: &str, mission: &str, delta: i64) -> Result<i64, CollaboratorError> {
        Ok(tx.query_row(
            "INSERT INTO mission_progress (user_id, mission, progress) VALUES (?1, ?2, ?3)
             ON CONFLICT(user_id, mission) DO UPDATE SET
                progress = progress + excluded.progress,
                updated_at = unixepoch('now')
             RETURNING progress",
            params![user_id, mission, delta],
            |r| r.get(0),
        )?)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GrantResult {
    pub points_awarded: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub new_balance: Option<i64>,
    pub clues_unlocked: Vec<ClueCode>,
    pub achievements_granted: Vec<AchievementCode>,
    pub missions_advanced: Vec<(MissionCode, i64)>,
    /// The fragment was already completed; nothing was granted.
    pub already_completed: bool,
}

impl GrantResult {
    pub fn is_empty(&self) -> bool {
        self.points_awarded == 0
            && self.clues_unlocked.is_empty()
            && self.achievements_granted.is_empty()
            && self.missions_advanced.is_empty()
    }
}

fn partial_failure(category: RewardCategory, fragment_id: &str, e: impl fmt::Display) -> NarrativeError {
    error!("reward grant for {fragment_id} failed in {category} collaborator: {e}");
    NarrativeError::GrantPartialFailure {
        category,
        message: e.to_string(),
    }
}

/// Lock contention stays a retryable conflict; anything else fails the grant.
fn grant_failure(category: RewardCategory, fragment_id: &str, e: NarrativeError) -> NarrativeError {
    match e {
        NarrativeError::ConcurrencyConflict(_) => e,
        other => partial_failure(category, fragment_id, other),
    }
}

fn collaborator_failure(category: RewardCategory, fragment_id: &str, e: CollaboratorError) -> NarrativeError {
    match e {
        CollaboratorError::Database(err) => grant_failure(category, fragment_id, err.into()),
        rejected => partial_failure(category, fragment_id, rejected),
    }
}

pub struct RewardGrantEngine {
    tracker: Arc<UserProgressTracker>,
    points: Arc<dyn PointsService>,
    achievements: Arc<dyn AchievementService>,
    missions: Arc<dyn MissionService>,
}

impl RewardGrantEngine {
    pub fn new(
        tracker: Arc<UserProgressTracker>,
        points: Arc<dyn PointsService>,
        achievements: Arc<dyn AchievementService>,
        missions: Arc<dyn MissionService>,
    ) -> Self {
        Self {
            tracker,
            points,
            achievements,
            missions,
        }
    }

    /// Engine backed by the ledgers in the engine's own database.
    pub fn with_sqlite_ledgers(tracker: Arc<UserProgressTracker>) -> Self {
        Self::new(
            tracker,
            Arc::new(LedgerPoints),
            Arc::new(SqliteAchievements),
            Arc::new(SqliteMissions),
        )
    }

    pub fn points(&self) -> &dyn PointsService {
        self.points.as_ref()
    }

    /// Grant `fragment`'s triggers and mark it completed.
    ///
    /// Must run inside a transaction: on `Err` the caller drops it and every
    /// effect, including the completion mark, is rolled back. A fragment that
    /// is already completed yields an empty result with `already_completed`.
    pub fn apply_triggers(&self, tx: &Connection, user_id: &str, fragment: &Fragment) -> Result<GrantResult, NarrativeError> {
        let state = self.tracker.get_or_create(tx, user_id)?;
        if state.completed.contains(&fragment.id) {
            debug!("{user_id} already completed {}, skipping triggers", fragment.id);
            return Ok(GrantResult {
                already_completed: true,
                ..Default::default()
            });
        }

        let triggers = &fragment.triggers;
        let mut result = GrantResult::default();

        if let Some(amount) = triggers.points
            && amount > 0
        {
            let reason = format!("fragment:{}", fragment.id);
            let balance = self
                .points
                .award(tx, user_id, amount, &reason)
                .map_err(|e| collaborator_failure(RewardCategory::Points, &fragment.id, e))?;
            result.points_awarded = amount;
            result.new_balance = Some(balance);
        }

        for clue in &triggers.clues {
            let fresh = self
                .tracker
                .unlock_clue(tx, user_id, clue)
                .map_err(|e| grant_failure(RewardCategory::Clues, &fragment.id, e))?;
            if fresh {
                result.clues_unlocked.push(clue.clone());
            }
        }

        for code in &triggers.achievements {
            let granted = self
                .achievements
                .grant(tx, user_id, code)
                .map_err(|e| collaborator_failure(RewardCategory::Achievements, &fragment.id, e))?;
            if granted {
                result.achievements_granted.push(code.clone());
            }
        }

        for (mission, delta) in &triggers.missions {
            let progress = self
                .missions
                .advance(tx, user_id, mission, *delta)
                .map_err(|e| collaborator_failure(RewardCategory::Missions, &fragment.id, e))?;
            result.missions_advanced.push((mission.clone(), progress));
        }

        self.tracker.record_completion(tx, user_id, &fragment.id)?;
        debug!(
            "{user_id} completed {}: +{} points, {} clues, {} achievements",
            fragment.id,
            result.points_awarded,
            result.clues_unlocked.len(),
            result.achievements_granted.len()
        );
        Ok(result)
    }
}
