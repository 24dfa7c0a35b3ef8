//! Items and the item status state machine.
//!
//! An item moves `pending -> locked -> {labeled, skipped}`. The only way back
//! out of `locked` without a completion is `locked -> pending`, which is
//! reserved for the reconciliation sweeper when the item's lease has expired.
//! Terminal states have no outgoing transitions.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Newtype for an item's database id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ItemId(pub i64);

impl fmt::Display for ItemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ItemId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

/// Newtype for the id of an annotator, as supplied by the authorization layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerId(pub i64);

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for CallerId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl FromStr for CallerId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<i64>().map(Self)
    }
}

/// Opaque reference to the prompt a transport rendered for a caller
/// (for example a chat message id). Stored so a resumed task can be
/// re-rendered in place of the original.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PromptHandle(pub String);

impl fmt::Display for PromptHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PromptHandle {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for PromptHandle {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Durable status of an item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    /// Claimable.
    Pending,
    /// Claimed by exactly one caller, backed by a lease.
    Locked,
    /// Completed with a score.
    Labeled,
    /// Completed without a score.
    Skipped,
}

impl ItemStatus {
    pub const ALL: [ItemStatus; 4] = [
        ItemStatus::Pending,
        ItemStatus::Locked,
        ItemStatus::Labeled,
        ItemStatus::Skipped,
    ];

    /// Column value used by the relational store.
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemStatus::Pending => "pending",
            ItemStatus::Locked => "locked",
            ItemStatus::Labeled => "labeled",
            ItemStatus::Skipped => "skipped",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ItemStatus::Labeled | ItemStatus::Skipped)
    }

    /// Whether `self -> next` is an edge of the state machine.
    pub fn can_transition_to(self, next: ItemStatus) -> bool {
        use ItemStatus::*;
        matches!(
            (self, next),
            (Pending, Locked) | (Locked, Labeled) | (Locked, Skipped) | (Locked, Pending)
        )
    }
}

impl fmt::Display for ItemStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a stored status string is not one of the known states.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown item status: {0:?}")]
pub struct UnknownStatus(pub String);

impl FromStr for ItemStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ItemStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// A unit of work handed to annotators.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    pub id: ItemId,
    pub text: String,
    /// Content-addressed deduplication key, see [`text_hash`].
    pub text_hash: String,
    pub status: ItemStatus,
    pub created_at: DateTime<Utc>,
}

/// Deduplication key for an item's text: lowercase hex SHA-256 of the UTF-8 bytes.
pub fn text_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_status_round_trips_through_column_value() {
        for status in ItemStatus::ALL {
            assert_eq!(status.as_str().parse::<ItemStatus>(), Ok(status));
        }
        let err = "claimed".parse::<ItemStatus>().unwrap_err();
        assert_eq!(err, UnknownStatus("claimed".to_string()));
        assert_eq!(err.to_string(), "unknown item status: \"claimed\"");
    }

    #[test]
    fn test_only_documented_edges_are_allowed() {
        use ItemStatus::*;
        assert!(Pending.can_transition_to(Locked));
        assert!(Locked.can_transition_to(Labeled));
        assert!(Locked.can_transition_to(Skipped));
        assert!(Locked.can_transition_to(Pending));

        assert!(!Pending.can_transition_to(Labeled));
        assert!(!Pending.can_transition_to(Skipped));
        assert!(!Pending.can_transition_to(Pending));
        assert!(!Locked.can_transition_to(Locked));
    }

    #[test]
    fn test_status_serializes_lowercase() {
        let json = serde_json::to_string(&ItemStatus::Labeled).unwrap();
        assert_eq!(json, "\"labeled\"");
    }

    #[test]
    fn test_text_hash_is_stable_and_distinguishes_texts() {
        assert_eq!(text_hash("foo"), text_hash("foo"));
        assert_ne!(text_hash("foo"), text_hash("foo "));
        assert_eq!(
            text_hash("foo"),
            "2c26b46b68ffc68ff99b453c1d30413413422d706483bfa0f98a5e886266e7ae"
        );
    }

    #[test]
    fn test_caller_id_parses_with_surrounding_whitespace() {
        assert_eq!(" 42 ".parse::<CallerId>(), Ok(CallerId(42)));
        assert!("abc".parse::<CallerId>().is_err());
    }

    fn arb_status() -> impl Strategy<Value = ItemStatus> {
        prop::sample::select(ItemStatus::ALL.to_vec())
    }

    proptest! {
        /// Terminal states never have an outgoing edge.
        #[test]
        fn terminal_states_are_absorbing(from in arb_status(), to in arb_status()) {
            if from.is_terminal() {
                prop_assert!(!from.can_transition_to(to));
            }
        }

        /// Every edge into a terminal state starts from `locked`.
        #[test]
        fn terminal_states_are_only_reached_from_locked(from in arb_status(), to in arb_status()) {
            if to.is_terminal() && from.can_transition_to(to) {
                prop_assert_eq!(from, ItemStatus::Locked);
            }
        }
    }
}
