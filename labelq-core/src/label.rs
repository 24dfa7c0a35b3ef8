//! Completion outcomes and the label rows they produce.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::item::{CallerId, ItemId, ItemStatus};

/// A rating on the 0..=10 scale.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(transparent)]
pub struct Score(u8);

impl Score {
    pub const MAX: u8 = 10;

    pub fn new(value: u8) -> Result<Self, InvalidScore> {
        if value <= Self::MAX {
            Ok(Self(value))
        } else {
            Err(InvalidScore(i64::from(value)))
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<i64> for Score {
    type Error = InvalidScore;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u8::try_from(value)
            .map_err(|_| InvalidScore(value))
            .and_then(Score::new)
    }
}

impl<'de> Deserialize<'de> for Score {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = i64::deserialize(deserializer)?;
        Score::try_from(raw).map_err(serde::de::Error::custom)
    }
}

impl fmt::Display for Score {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("score {0} is outside 0..={max}", max = Score::MAX)]
pub struct InvalidScore(pub i64);

/// What a caller reports when finishing an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Rated(Score),
    Skipped,
}

impl Outcome {
    pub fn rated(score: u8) -> Result<Self, InvalidScore> {
        Score::new(score).map(Outcome::Rated)
    }

    pub fn action(&self) -> LabelAction {
        match self {
            Outcome::Rated(_) => LabelAction::Rated,
            Outcome::Skipped => LabelAction::Skipped,
        }
    }

    pub fn score(&self) -> Option<Score> {
        match self {
            Outcome::Rated(score) => Some(*score),
            Outcome::Skipped => None,
        }
    }

    /// Status the item takes when this outcome is recorded.
    pub fn terminal_status(&self) -> ItemStatus {
        match self {
            Outcome::Rated(_) => ItemStatus::Labeled,
            Outcome::Skipped => ItemStatus::Skipped,
        }
    }
}

/// Stored form of an [`Outcome`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LabelAction {
    Rated,
    Skipped,
}

impl LabelAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LabelAction::Rated => "rated",
            LabelAction::Skipped => "skipped",
        }
    }
}

impl fmt::Display for LabelAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a stored action string is not `rated` or `skipped`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown label action: {0:?}")]
pub struct UnknownAction(pub String);

impl FromStr for LabelAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "rated" => Ok(LabelAction::Rated),
            "skipped" => Ok(LabelAction::Skipped),
            other => Err(UnknownAction(other.to_string())),
        }
    }
}

/// One caller's recorded outcome for one item. Written once, never updated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Label {
    pub item_id: ItemId,
    pub user_id: CallerId,
    pub score: Option<Score>,
    pub action: LabelAction,
    pub created_at: DateTime<Utc>,
}

impl Label {
    pub fn new(
        item_id: ItemId,
        user_id: CallerId,
        outcome: Outcome,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            item_id,
            user_id,
            score: outcome.score(),
            action: outcome.action(),
            created_at,
        }
    }
}
