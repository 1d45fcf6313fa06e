//! Per-user narrative position.
//!
//! Every operation runs against a caller-supplied connection, normally the
//! transaction the orchestrator holds for the whole transition.

use crate::NarrativeError;
use crate::fragment::{ClueCode, FragmentId};
use crate::fragment_store::FragmentStore;
use log::debug;
use rusqlite::{Connection, OptionalExtension, params};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UserProgressState {
    pub user_id: String,
    pub current_fragment: Option<FragmentId>,
    pub visited: BTreeSet<FragmentId>,
    pub completed: BTreeSet<FragmentId>,
    pub unlocked_clues: BTreeSet<ClueCode>,
}

impl UserProgressState {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            ..Default::default()
        }
    }

    pub fn has_clue(&self, clue: &str) -> bool {
        self.unlocked_clues.contains(clue)
    }

    /// Clues from `required` this user does not hold, in sorted order.
    pub fn missing_clues<'a, I>(&self, required: I) -> Vec<ClueCode>
    where
        I: IntoIterator<Item = &'a ClueCode>,
    {
        required
            .into_iter()
            .filter(|c| !self.unlocked_clues.contains(*c))
            .cloned()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    /// Share of active fragments completed, 0..=100.
    pub fn percentage(&self, active: &BTreeSet<FragmentId>) -> f64 {
        if active.is_empty() {
            return 0.0;
        }
        let done = self.completed.intersection(active).count();
        done as f64 * 100.0 / active.len() as f64
    }
}

fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn parse_set(raw: &str) -> Result<BTreeSet<String>, NarrativeError> {
    Ok(serde_json::from_str(raw)?)
}

pub struct UserProgressTracker {
    fragments: Arc<FragmentStore>,
}

impl UserProgressTracker {
    pub fn new(fragments: Arc<FragmentStore>) -> Self {
        Self { fragments }
    }

    /// Load without creating.
    pub fn get(&self, conn: &Connection, user_id: &str) -> Result<Option<UserProgressState>, NarrativeError> {
        let raw: Option<(Option<String>, String, String, String)> = conn
            .query_row(
                "SELECT current_fragment_id, visited, completed, unlocked_clues
                 FROM user_progress WHERE user_id = ?1",
                params![user_id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()?;

        match raw {
            None => Ok(None),
            Some((current, visited, completed, clues)) => Ok(Some(UserProgressState {
                user_id: user_id.to_string(),
                current_fragment: current,
                visited: parse_set(&visited)?,
                completed: parse_set(&completed)?,
                unlocked_clues: parse_set(&clues)?,
            })),
        }
    }

    /// Idempotent; concurrent first touches collapse onto the primary key.
    pub fn get_or_create(&self, conn: &Connection, user_id: &str) -> Result<UserProgressState, NarrativeError> {
        let inserted = conn.execute(
            "INSERT INTO user_progress (user_id) VALUES (?1) ON CONFLICT(user_id) DO NOTHING",
            params![user_id],
        )?;
        if inserted > 0 {
            debug!("created progress record for {user_id}");
        }
        self.get(conn, user_id)?
            .ok_or_else(|| NarrativeError::Internal(format!("progress row vanished for {user_id}")))
    }

    fn save(&self, conn: &Connection, state: &UserProgressState) -> Result<(), NarrativeError> {
        conn.execute(
            "UPDATE user_progress
             SET current_fragment_id = ?2, visited = ?3, completed = ?4, unlocked_clues = ?5, updated_at = ?6
             WHERE user_id = ?1",
            params![
                state.user_id,
                state.current_fragment,
                serde_json::to_string(&state.visited)?,
                serde_json::to_string(&state.completed)?,
                serde_json::to_string(&state.unlocked_clues)?,
                now_ts(),
            ],
        )?;
        Ok(())
    }

    fn ensure_known(&self, fragment_id: &str) -> Result<(), NarrativeError> {
        if self.fragments.contains(fragment_id) {
            Ok(())
        } else {
            Err(NarrativeError::NotFound(fragment_id.to_string()))
        }
    }

    pub fn record_visit(&self, conn: &Connection, user_id: &str, fragment_id: &str) -> Result<bool, NarrativeError> {
        self.ensure_known(fragment_id)?;
        let mut state = self.get_or_create(conn, user_id)?;
        if !state.visited.insert(fragment_id.to_string()) {
            return Ok(false);
        }
        self.save(conn, &state)?;
        Ok(true)
    }

    /// Returns false when the fragment was already completed.
    pub fn record_completion(&self, conn: &Connection, user_id: &str, fragment_id: &str) -> Result<bool, NarrativeError> {
        let mut state = self.get_or_create(conn, user_id)?;
        if !state.visited.contains(fragment_id) {
            return Err(NarrativeError::InvalidTransition(format!(
                "{user_id} cannot complete {fragment_id} without visiting it"
            )));
        }
        if !state.completed.insert(fragment_id.to_string()) {
            return Ok(false);
        }
        self.save(conn, &state)?;
        Ok(true)
    }

    /// Returns true only for a clue the user did not already hold.
    pub fn unlock_clue(&self, conn: &Connection, user_id: &str, clue: &str) -> Result<bool, NarrativeError> {
        let mut state = self.get_or_create(conn, user_id)?;
        if !state.unlocked_clues.insert(clue.to_string()) {
            return Ok(false);
        }
        self.save(conn, &state)?;
        Ok(true)
    }

    pub fn set_current_fragment(&self, conn: &Connection, user_id: &str, fragment_id: &str) -> Result<(), NarrativeError> {
        self.ensure_known(fragment_id)?;
        let mut state = self.get_or_create(conn, user_id)?;
        state.current_fragment = Some(fragment_id.to_string());
        state.visited.insert(fragment_id.to_string());
        self.save(conn, &state)
    }

    /// Clears position and all three sets. Reward ledgers are not touched.
    pub fn reset(&self, conn: &Connection, user_id: &str) -> Result<(), NarrativeError> {
        let state = UserProgressState::new(user_id);
        if self.get(conn, user_id)?.is_none() {
            return Ok(());
        }
        self.save(conn, &state)
    }
}
