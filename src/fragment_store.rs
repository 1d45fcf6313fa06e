//! Read-mostly store of the story graph.
//!
//! Fragments are parsed once when loaded from SQLite and cached behind an
//! `RwLock`; traversal reads never touch the database. Writes come from the
//! admin import path and refresh the cache after commit.

use crate::NarrativeError;
use crate::fragment::{Fragment, FragmentId, FragmentKind};
use log::{debug, info};
use rusqlite::{Connection, params};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::{SystemTime, UNIX_EPOCH};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "issue", rename_all = "snake_case")]
pub enum GraphIssue {
    DanglingChoice {
        fragment_id: FragmentId,
        choice_index: usize,
        target: FragmentId,
    },
    SelfLoopOnly {
        fragment_id: FragmentId,
    },
    DeadEndDecision {
        fragment_id: FragmentId,
    },
    InactiveTarget {
        fragment_id: FragmentId,
        choice_index: usize,
        target: FragmentId,
    },
}

impl fmt::Display for GraphIssue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GraphIssue::DanglingChoice {
                fragment_id,
                choice_index,
                target,
            } => write!(f, "{fragment_id}: choice {choice_index} targets unknown fragment {target}"),
            GraphIssue::SelfLoopOnly { fragment_id } => {
                write!(f, "{fragment_id}: only choice points back to itself")
            }
            GraphIssue::DeadEndDecision { fragment_id } => {
                write!(f, "{fragment_id}: decision fragment has no choices")
            }
            GraphIssue::InactiveTarget {
                fragment_id,
                choice_index,
                target,
            } => write!(f, "{fragment_id}: choice {choice_index} targets inactive fragment {target}"),
        }
    }
}

#[derive(Debug, Default, Serialize)]
pub struct GraphReport {
    pub fragments: usize,
    pub errors: Vec<GraphIssue>,
    pub warnings: Vec<GraphIssue>,
}

impl GraphReport {
    pub fn is_ok(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Default)]
pub struct FragmentStore {
    fragments: RwLock<HashMap<FragmentId, Arc<Fragment>>>,
}

struct RawFragment {
    id: String,
    title: String,
    body: String,
    kind: String,
    active: bool,
    choices: String,
    triggers: String,
    required_clues: String,
}

impl RawFragment {
    fn parse(self) -> Result<Fragment, NarrativeError> {
        let kind: FragmentKind = self
            .kind
            .parse()
            .map_err(|e: String| NarrativeError::Integrity(format!("{}: {e}", self.id)))?;
        Ok(Fragment {
            choices: serde_json::from_str(&self.choices)?,
            triggers: serde_json::from_str(&self.triggers)?,
            required_clues: serde_json::from_str(&self.required_clues)?,
            id: self.id,
            title: self.title,
            body: self.body,
            kind,
            active: self.active,
        })
    }
}

fn now_ts() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn read_all(conn: &Connection) -> Result<Vec<Fragment>, NarrativeError> {
    let mut stmt = conn.prepare(
        "SELECT id, title, body, kind, active, choices, triggers, required_clues FROM fragments",
    )?;
    let raw: Vec<RawFragment> = stmt
        .query_map([], |r| {
            Ok(RawFragment {
                id: r.get(0)?,
                title: r.get(1)?,
                body: r.get(2)?,
                kind: r.get(3)?,
                active: r.get(4)?,
                choices: r.get(5)?,
                triggers: r.get(6)?,
                required_clues: r.get(7)?,
            })
        })?
        .collect::<Result<_, _>>()?;
    raw.into_iter().map(RawFragment::parse).collect()
}

impl FragmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn load(conn: &Connection) -> Result<Self, NarrativeError> {
        let store = Self::new();
        store.reload(conn)?;
        Ok(store)
    }

    /// Replace the cache with what is currently committed. Returns the fragment count.
    pub fn reload(&self, conn: &Connection) -> Result<usize, NarrativeError> {
        let loaded: HashMap<FragmentId, Arc<Fragment>> = read_all(conn)?
            .into_iter()
            .map(|f| (f.id.clone(), Arc::new(f)))
            .collect();
        let count = loaded.len();
        *self.write() = loaded;
        debug!("loaded {count} fragments");
        Ok(count)
    }

    fn read(&self) -> RwLockReadGuard<'_, HashMap<FragmentId, Arc<Fragment>>> {
        self.fragments.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<FragmentId, Arc<Fragment>>> {
        self.fragments.write().unwrap_or_else(|e| e.into_inner())
    }

    /// Active fragment by id. Inactive fragments are invisible to traversal.
    pub fn get(&self, id: &str) -> Result<Arc<Fragment>, NarrativeError> {
        match self.read().get(id) {
            Some(f) if f.active => Ok(Arc::clone(f)),
            _ => Err(NarrativeError::NotFound(id.to_string())),
        }
    }

    /// Any fragment, active or not, for historical lookups.
    pub fn resolve(&self, id: &str) -> Option<Arc<Fragment>> {
        self.read().get(id).cloned()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.read().contains_key(id)
    }

    pub fn active_ids(&self) -> BTreeSet<FragmentId> {
        self.read()
            .values()
            .filter(|f| f.active)
            .map(|f| f.id.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }

    /// Upsert a batch of fragments in one transaction.
    ///
    /// Every choice target must exist either in the database or in the batch;
    /// otherwise nothing is written.
    pub fn import(&self, conn: &Connection, batch: Vec<Fragment>) -> Result<usize, NarrativeError> {
        let mut batch_ids = HashSet::new();
        for f in &batch {
            if f.id.trim().is_empty() {
                return Err(NarrativeError::Integrity("fragment with empty id".into()));
            }
            if !batch_ids.insert(f.id.as_str()) {
                return Err(NarrativeError::Integrity(format!(
                    "duplicate fragment id in batch: {}",
                    f.id
                )));
            }
        }

        let tx = conn.unchecked_transaction()?;

        let existing: HashSet<String> = tx
            .prepare("SELECT id FROM fragments")?
            .query_map([], |r| r.get(0))?
            .collect::<Result<_, _>>()?;

        let mut dangling = Vec::new();
        for f in &batch {
            for (i, choice) in f.choices.iter().enumerate() {
                if !batch_ids.contains(choice.target.as_str()) && !existing.contains(&choice.target) {
                    dangling.push(
                        GraphIssue::DanglingChoice {
                            fragment_id: f.id.clone(),
                            choice_index: i,
                            target: choice.target.clone(),
                        }
                        .to_string(),
                    );
                }
            }
        }
        if !dangling.is_empty() {
            return Err(NarrativeError::Integrity(dangling.join("; ")));
        }

        let ts = now_ts();
        for f in &batch {
            tx.execute(
                "INSERT INTO fragments (id, title, body, kind, active, choices, triggers, required_clues, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                 ON CONFLICT(id) DO UPDATE SET
                    title = excluded.title,
                    body = excluded.body,
                    kind = excluded.kind,
                    active = excluded.active,
                    choices = excluded.choices,
                    triggers = excluded.triggers,
                    required_clues = excluded.required_clues,
                    updated_at = excluded.updated_at",
                params![
                    f.id,
                    f.title,
                    f.body,
                    f.kind.as_str(),
                    f.active,
                    serde_json::to_string(&f.choices)?,
                    serde_json::to_string(&f.triggers)?,
                    serde_json::to_string(&f.required_clues)?,
                    ts,
                ],
            )?;
        }
        tx.commit()?;

        let count = batch.len();
        let mut cache = self.write();
        for f in batch {
            cache.insert(f.id.clone(), Arc::new(f));
        }
        info!("imported {count} fragments");
        Ok(count)
    }

    /// Logical delete. Progress that references the fragment stays resolvable.
    pub fn deactivate(&self, conn: &Connection, id: &str) -> Result<(), NarrativeError> {
        let updated = conn.execute(
            "UPDATE fragments SET active = 0, updated_at = ?2 WHERE id = ?1",
            params![id, now_ts()],
        )?;
        if updated == 0 {
            return Err(NarrativeError::NotFound(id.to_string()));
        }

        let mut cache = self.write();
        if let Some(f) = cache.get(id) {
            let mut f = Fragment::clone(f);
            f.active = false;
            cache.insert(id.to_string(), Arc::new(f));
        }
        info!("deactivated fragment {id}");
        Ok(())
    }

    /// Offline integrity check over the cached graph.
    pub fn validate_graph(&self) -> GraphReport {
        let cache = self.read();
        let mut ids: Vec<&FragmentId> = cache.keys().collect();
        ids.sort();

        let mut report = GraphReport {
            fragments: ids.len(),
            ..Default::default()
        };

        for id in ids {
            let f = &cache[id];
            for (i, choice) in f.choices.iter().enumerate() {
                match cache.get(&choice.target) {
                    None => report.errors.push(GraphIssue::DanglingChoice {
                        fragment_id: f.id.clone(),
                        choice_index: i,
                        target: choice.target.clone(),
                    }),
                    Some(target) if f.active && !target.active => {
                        report.warnings.push(GraphIssue::InactiveTarget {
                            fragment_id: f.id.clone(),
                            choice_index: i,
                            target: choice.target.clone(),
                        })
                    }
                    Some(_) => {}
                }
            }

            if f.choices.len() == 1 && f.choices[0].target == f.id {
                report.errors.push(GraphIssue::SelfLoopOnly {
                    fragment_id: f.id.clone(),
                });
            }

            if f.active && f.kind == FragmentKind::Decision && f.choices.is_empty() {
                report.warnings.push(GraphIssue::DeadEndDecision {
                    fragment_id: f.id.clone(),
                });
            }
        }

        report
    }
}
