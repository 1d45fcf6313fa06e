//! Story graph model: fragments, the choices linking them, and the
//! trigger payload applied when a fragment is completed.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

pub type FragmentId = String;
pub type ClueCode = String;
pub type AchievementCode = String;
pub type MissionCode = String;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FragmentKind {
    Story,
    Decision,
    Info,
}

impl FragmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FragmentKind::Story => "story",
            FragmentKind::Decision => "decision",
            FragmentKind::Info => "info",
        }
    }
}

impl fmt::Display for FragmentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FragmentKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "story" => Ok(FragmentKind::Story),
            "decision" => Ok(FragmentKind::Decision),
            "info" => Ok(FragmentKind::Info),
            other => Err(format!("unknown fragment kind: {other}")),
        }
    }
}

/// An edge of the story graph, optionally gated by clues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Choice {
    pub text: String,
    pub target: FragmentId,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub required_clues: BTreeSet<ClueCode>,
}

impl Choice {
    pub fn new(text: impl Into<String>, target: impl Into<FragmentId>) -> Self {
        Self {
            text: text.into(),
            target: target.into(),
            required_clues: BTreeSet::new(),
        }
    }

    pub fn requiring<I, S>(mut self, clues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ClueCode>,
    {
        self.required_clues.extend(clues.into_iter().map(Into::into));
        self
    }
}

/// Side effects applied once when a fragment is completed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub points: Option<u32>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub clues: BTreeSet<ClueCode>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub achievements: BTreeSet<AchievementCode>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub missions: BTreeMap<MissionCode, i64>,
}

impl TriggerPayload {
    pub fn is_empty(&self) -> bool {
        self.points.unwrap_or(0) == 0
            && self.clues.is_empty()
            && self.achievements.is_empty()
            && self.missions.is_empty()
    }
}

fn default_active() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Fragment {
    pub id: FragmentId,
    pub title: String,
    #[serde(default)]
    pub body: String,
    pub kind: FragmentKind,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default)]
    pub choices: Vec<Choice>,
    #[serde(default)]
    pub triggers: TriggerPayload,
    #[serde(default)]
    pub required_clues: BTreeSet<ClueCode>,
}

impl Fragment {
    pub fn new(id: impl Into<FragmentId>, kind: FragmentKind, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: String::new(),
            kind,
            active: true,
            choices: Vec::new(),
            triggers: TriggerPayload::default(),
            required_clues: BTreeSet::new(),
        }
    }

    pub fn with_body(mut self, body: impl Into<String>) -> Self {
        self.body = body.into();
        self
    }

    pub fn with_choice(mut self, choice: Choice) -> Self {
        self.choices.push(choice);
        self
    }

    pub fn with_triggers(mut self, triggers: TriggerPayload) -> Self {
        self.triggers = triggers;
        self
    }

    pub fn requiring<I, S>(mut self, clues: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<ClueCode>,
    {
        self.required_clues.extend(clues.into_iter().map(Into::into));
        self
    }

    pub fn inactive(mut self) -> Self {
        self.active = false;
        self
    }

    pub fn is_terminal(&self) -> bool {
        self.choices.is_empty()
    }
}

/// Admin import file: `{ "fragments": [...] }` in JSON or TOML.
#[derive(Debug, Deserialize)]
pub struct FragmentFile {
    #[serde(default)]
    pub fragments: Vec<Fragment>,
}
