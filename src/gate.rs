use crate::NarrativeError;
use crate::fragment::{ClueCode, Fragment};
use crate::progress::UserProgressState;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", content = "detail", rename_all = "snake_case")]
pub enum DenyReason {
    MissingClues(Vec<ClueCode>),
    FragmentInactive,
    UnknownChoice(usize),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Access {
    Allowed,
    Denied(DenyReason),
}

impl Access {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Access::Allowed)
    }

    /// Turn a denial into the matching error for `fragment`.
    pub fn into_result(self, fragment: &Fragment) -> Result<(), NarrativeError> {
        match self {
            Access::Allowed => Ok(()),
            Access::Denied(DenyReason::MissingClues(missing_clues)) => {
                Err(NarrativeError::AccessDenied { missing_clues })
            }
            Access::Denied(DenyReason::FragmentInactive) => {
                Err(NarrativeError::NotFound(fragment.id.clone()))
            }
            Access::Denied(DenyReason::UnknownChoice(index)) => Err(NarrativeError::InvalidChoice {
                fragment_id: fragment.id.clone(),
                index,
                available: fragment.choices.len(),
            }),
        }
    }
}

/// Pure prerequisite checks. Never touches storage.
#[derive(Debug, Clone, Copy, Default)]
pub struct AccessGate;

impl AccessGate {
    pub fn new() -> Self {
        Self
    }

    pub fn can_enter(&self, progress: &UserProgressState, fragment: &Fragment) -> Access {
        if !fragment.active {
            return Access::Denied(DenyReason::FragmentInactive);
        }
        let missing = progress.missing_clues(&fragment.required_clues);
        if missing.is_empty() {
            Access::Allowed
        } else {
            Access::Denied(DenyReason::MissingClues(missing))
        }
    }

    /// Fragment-level and choice-level requirements must both hold; the
    /// denial reports the union of what is missing from either.
    pub fn can_choose(&self, progress: &UserProgressState, fragment: &Fragment, index: usize) -> Access {
        if !fragment.active {
            return Access::Denied(DenyReason::FragmentInactive);
        }
        let Some(choice) = fragment.choices.get(index) else {
            return Access::Denied(DenyReason::UnknownChoice(index));
        };
        let missing = progress.missing_clues(fragment.required_clues.iter().chain(&choice.required_clues));
        if missing.is_empty() {
            Access::Allowed
        } else {
            Access::Denied(DenyReason::MissingClues(missing))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::open_memory_db;
    use crate::fragment::{Choice, FragmentKind};
    use crate::fragment_store::FragmentStore;
    use crate::progress::UserProgressTracker;
    use std::sync::Arc;

    fn crossroads() -> Fragment {
        Fragment::new("F1", FragmentKind::Decision, "Crossroads")
            .requiring(["LANTERN"])
            .with_choice(Choice::new("North", "F2").requiring(["KEY1"]))
            .with_choice(Choice::new("South", "F3"))
    }

    #[test]
    fn enter_without_requirements() {
        let gate = AccessGate::new();
        let progress = UserProgressState::new("u1");
        let f = Fragment::new("F3", FragmentKind::Story, "Garden");
        assert_eq!(gate.can_enter(&progress, &f), Access::Allowed);
    }

    #[test]
    fn enter_denied_lists_missing() {
        let gate = AccessGate::new();
        let progress = UserProgressState::new("u1");
        let f = Fragment::new("F2", FragmentKind::Story, "Vault").requiring(["KEY1", "KEY2"]);
        assert_eq!(
            gate.can_enter(&progress, &f),
            Access::Denied(DenyReason::MissingClues(vec!["KEY1".into(), "KEY2".into()]))
        );
    }

    #[test]
    fn inactive_is_denied() {
        let gate = AccessGate::new();
        let progress = UserProgressState::new("u1");
        let f = Fragment::new("F2", FragmentKind::Story, "Vault").inactive();
        assert_eq!(
            gate.can_enter(&progress, &f),
            Access::Denied(DenyReason::FragmentInactive)
        );
        assert!(matches!(
            gate.can_enter(&progress, &f).into_result(&f),
            Err(NarrativeError::NotFound(_))
        ));
    }

    #[test]
    fn choose_reports_union_of_missing() {
        let gate = AccessGate::new();
        let progress = UserProgressState::new("u1");
        assert_eq!(
            gate.can_choose(&progress, &crossroads(), 0),
            Access::Denied(DenyReason::MissingClues(vec!["KEY1".into(), "LANTERN".into()]))
        );
        assert_eq!(
            gate.can_choose(&progress, &crossroads(), 1),
            Access::Denied(DenyReason::MissingClues(vec!["LANTERN".into()]))
        );
    }

    #[test]
    fn choose_allowed_when_both_levels_met() {
        let gate = AccessGate::new();
        let mut progress = UserProgressState::new("u1");
        progress.unlocked_clues.insert("LANTERN".into());
        assert!(gate.can_choose(&progress, &crossroads(), 1).is_allowed());
        assert!(!gate.can_choose(&progress, &crossroads(), 0).is_allowed());
        progress.unlocked_clues.insert("KEY1".into());
        assert!(gate.can_choose(&progress, &crossroads(), 0).is_allowed());
    }

    #[test]
    fn choose_out_of_range() {
        let gate = AccessGate::new();
        let progress = UserProgressState::new("u1");
        let f = crossroads();
        let access = gate.can_choose(&progress, &f, 7);
        assert_eq!(access, Access::Denied(DenyReason::UnknownChoice(7)));
        assert!(matches!(
            access.into_result(&f),
            Err(NarrativeError::InvalidChoice { index: 7, available: 2, .. })
        ));
    }

    #[test]
    fn unlocking_missing_clue_grants_entry() {
        let gate = AccessGate::new();
        let mut progress = UserProgressState::new("u1");
        let f = Fragment::new("F2", FragmentKind::Story, "Vault").requiring(["X"]);
        let Access::Denied(DenyReason::MissingClues(missing)) = gate.can_enter(&progress, &f) else {
            panic!("expected denial");
        };
        for clue in missing {
            progress.unlocked_clues.insert(clue);
        }
        assert_eq!(gate.can_enter(&progress, &f), Access::Allowed);
    }

    #[test]
    fn unlocking_through_tracker_grants_entry() {
        let conn = open_memory_db().unwrap();
        let vault = Fragment::new("F2", FragmentKind::Story, "Vault").requiring(["X", "Y"]);
        let store = Arc::new(FragmentStore::new());
        store.import(&conn, vec![vault.clone()]).unwrap();
        let tracker = UserProgressTracker::new(store);
        let gate = AccessGate::new();

        let progress = tracker.get_or_create(&conn, "u1").unwrap();
        let Access::Denied(DenyReason::MissingClues(missing)) = gate.can_enter(&progress, &vault) else {
            panic!("expected denial");
        };
        assert_eq!(missing, vec!["X".to_string(), "Y".to_string()]);

        for clue in &missing {
            assert!(tracker.unlock_clue(&conn, "u1", clue).unwrap());
        }
        let progress = tracker.get(&conn, "u1").unwrap().unwrap();
        assert_eq!(gate.can_enter(&progress, &vault), Access::Allowed);
    }
}
