use crate::fragment::{AchievementCode, ClueCode, FragmentId, MissionCode};
use crate::rewards::GrantResult;
use log::info;
use serde::Serialize;

/// Something that happened during a transition. Returned to the caller,
/// which decides whether and how to publish it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum NarrativeEvent {
    FragmentEntered { fragment_id: FragmentId },
    FragmentCompleted { fragment_id: FragmentId },
    PointsAwarded { amount: u32, new_balance: Option<i64> },
    ClueUnlocked { clue: ClueCode },
    AchievementGranted { achievement: AchievementCode },
    MissionAdvanced { mission: MissionCode, progress: i64 },
    ProgressReset,
}

/// Expand a grant into the events it produced, in grant order.
pub fn grant_events(fragment_id: &str, grant: &GrantResult) -> Vec<NarrativeEvent> {
    if grant.already_completed {
        return Vec::new();
    }
    let mut events = vec![NarrativeEvent::FragmentCompleted {
        fragment_id: fragment_id.to_string(),
    }];
    if grant.points_awarded > 0 {
        events.push(NarrativeEvent::PointsAwarded {
            amount: grant.points_awarded,
            new_balance: grant.new_balance,
        });
    }
    events.extend(
        grant
            .clues_unlocked
            .iter()
            .map(|c| NarrativeEvent::ClueUnlocked { clue: c.clone() }),
    );
    events.extend(
        grant
            .achievements_granted
            .iter()
            .map(|a| NarrativeEvent::AchievementGranted { achievement: a.clone() }),
    );
    events.extend(
        grant
            .missions_advanced
            .iter()
            .map(|(m, p)| NarrativeEvent::MissionAdvanced {
                mission: m.clone(),
                progress: *p,
            }),
    );
    events
}

/// Presentation side of notifications. This crate never formats user text.
pub trait NotificationSink: Send + Sync {
    fn publish(&self, user_id: &str, events: &[NarrativeEvent]);
}

/// Writes each event to the log at info level.
#[derive(Debug, Default)]
pub struct LogSink;

impl NotificationSink for LogSink {
    fn publish(&self, user_id: &str, events: &[NarrativeEvent]) {
        for event in events {
            match serde_json::to_string(event) {
                Ok(json) => info!("event user={user_id} {json}"),
                Err(_) => info!("event user={user_id} {event:?}"),
            }
        }
    }
}
