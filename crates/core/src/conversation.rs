//! Conversation state store - 对话组到外部会话 ID 的映射
//!
//! Holds, for one run, the external session id of every conversation
//! group together with its ordered turn history. Pure in-memory, single
//! writer (the processing loop).

use crate::case::TurnRecord;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversationError {
    #[error("conversation '{group}' expected turn {expected}, got {got}")]
    TurnOutOfOrder { group: String, expected: u32, got: u32 },
}

/// 对话组
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversationGroup {
    /// Caller-chosen group key
    pub key: String,

    /// Session id returned by the remote API, absent until the first successful call
    pub external_id: Option<String>,

    pub created_at: DateTime<Utc>,

    /// Ordered turn history
    pub turns: Vec<TurnRecord>,
}

impl ConversationGroup {
    fn new(key: &str) -> Self {
        Self {
            key: key.to_string(),
            external_id: None,
            created_at: Utc::now(),
            turns: Vec::new(),
        }
    }
}

/// Per-group summary returned by [`ConversationStore::conversations`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConversationSummary {
    pub key: String,
    pub external_id: Option<String>,
    pub turn_count: usize,
    pub created_at: DateTime<Utc>,
    pub last_turn: Option<u32>,
}

/// Aggregate statistics over all groups
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ConversationStatistics {
    pub conversation_count: usize,
    pub turn_count: usize,
    pub average_turns_per_conversation: f64,
    pub successful_turns: usize,
    pub failed_turns: usize,
    /// Percentage, rounded to 2 decimals
    pub success_rate: f64,
}

/// Rounds to 2 decimal places.
pub(crate) fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

#[derive(Debug, Default)]
pub struct ConversationStore {
    groups: HashMap<String, ConversationGroup>,
    /// Group keys in creation order
    order: Vec<String>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn group_mut(&mut self, key: &str) -> &mut ConversationGroup {
        let order = &mut self.order;
        self.groups.entry(key.to_string()).or_insert_with(|| {
            order.push(key.to_string());
            ConversationGroup::new(key)
        })
    }

    /// External session id previously stored for `key`.
    pub fn external_id(&self, key: &str) -> Option<&str> {
        self.groups
            .get(key)
            .and_then(|group| group.external_id.as_deref())
    }

    pub fn is_new_conversation(&self, key: &str) -> bool {
        self.external_id(key).is_none()
    }

    /// Store or update the mapping. Empty ids never replace a stored one.
    pub fn set_external_id(&mut self, key: &str, external_id: &str) {
        let external_id = external_id.trim();
        if external_id.is_empty() {
            warn!(group = key, "Ignoring empty external conversation id");
            return;
        }
        let group = self.group_mut(key);
        match group.external_id.as_deref() {
            None => {
                group.external_id = Some(external_id.to_string());
                info!(group = key, external_id, "Created new conversation");
            }
            Some(current) if current != external_id => {
                debug!(
                    group = key,
                    previous = current,
                    external_id,
                    "External conversation id changed"
                );
                group.external_id = Some(external_id.to_string());
            }
            Some(_) => {}
        }
    }

    /// Next acceptable turn number for `key`.
    pub fn next_turn(&self, key: &str) -> u32 {
        self.turn_count(key) as u32 + 1
    }

    /// `Ok` when `turn` is exactly the next turn of `key`.
    pub fn validate_turn_sequence(&self, key: &str, turn: u32) -> Result<(), ConversationError> {
        let expected = self.next_turn(key);
        if turn == expected {
            Ok(())
        } else {
            Err(ConversationError::TurnOutOfOrder {
                group: key.to_string(),
                expected,
                got: turn,
            })
        }
    }

    /// Append a turn record; out-of-order turns are rejected.
    pub fn append_turn(&mut self, key: &str, record: TurnRecord) -> Result<(), ConversationError> {
        self.validate_turn_sequence(key, record.turn)?;
        let turn = record.turn;
        self.group_mut(key).turns.push(record);
        debug!(group = key, turn, "Appended turn");
        Ok(())
    }

    pub fn turn_count(&self, key: &str) -> usize {
        self.groups.get(key).map_or(0, |group| group.turns.len())
    }

    pub fn last_turn(&self, key: &str) -> Option<&TurnRecord> {
        self.groups.get(key).and_then(|group| group.turns.last())
    }

    pub fn turns(&self, key: &str) -> &[TurnRecord] {
        self.groups
            .get(key)
            .map_or(&[][..], |group| group.turns.as_slice())
    }

    pub fn group(&self, key: &str) -> Option<&ConversationGroup> {
        self.groups.get(key)
    }

    /// Summaries of all groups in creation order.
    pub fn conversations(&self) -> Vec<ConversationSummary> {
        self.order
            .iter()
            .filter_map(|key| self.groups.get(key))
            .map(|group| ConversationSummary {
                key: group.key.clone(),
                external_id: group.external_id.clone(),
                turn_count: group.turns.len(),
                created_at: group.created_at,
                last_turn: group.turns.last().map(|t| t.turn),
            })
            .collect()
    }

    /// Full history of one group, if known.
    pub fn export_history(&self, key: &str) -> Option<ConversationGroup> {
        self.groups.get(key).cloned()
    }

    pub fn statistics(&self) -> ConversationStatistics {
        let conversation_count = self.groups.len();
        let mut turn_count = 0;
        let mut successful_turns = 0;
        for group in self.groups.values() {
            turn_count += group.turns.len();
            successful_turns += group
                .turns
                .iter()
                .filter(|t| t.status.is_success())
                .count();
        }
        let failed_turns = turn_count - successful_turns;

        let average_turns_per_conversation = if conversation_count > 0 {
            round2(turn_count as f64 / conversation_count as f64)
        } else {
            0.0
        };
        let success_rate = if turn_count > 0 {
            round2(successful_turns as f64 / turn_count as f64 * 100.0)
        } else {
            0.0
        };

        ConversationStatistics {
            conversation_count,
            turn_count,
            average_turns_per_conversation,
            successful_turns,
            failed_turns,
            success_rate,
        }
    }

    /// Forget one group.
    pub fn clear(&mut self, key: &str) -> bool {
        let removed = self.groups.remove(key).is_some();
        if removed {
            self.order.retain(|k| k != key);
            info!(group = key, "Cleared conversation");
        }
        removed
    }

    pub fn clear_all(&mut self) {
        let count = self.groups.len();
        self.groups.clear();
        self.order.clear();
        info!(count, "Cleared all conversations");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ok(turn: u32) -> TurnRecord {
        TurnRecord::success(turn, "q", "a", Duration::from_millis(100))
    }

    fn failed(turn: u32) -> TurnRecord {
        TurnRecord::failed(turn, "q", "boom", Duration::from_millis(100))
    }

    #[test]
    fn test_new_store_is_empty() {
        let store = ConversationStore::new();
        assert!(store.is_new_conversation("g1"));
        assert_eq!(store.turn_count("g1"), 0);
        assert!(store.last_turn("g1").is_none());
        assert!(store.turns("g1").is_empty());
        assert_eq!(store.statistics(), ConversationStatistics::default());
    }

    #[test]
    fn test_turns_in_order_are_recorded() {
        let mut store = ConversationStore::new();
        for turn in 1..=3 {
            store.append_turn("g1", ok(turn)).unwrap();
        }
        assert_eq!(store.turn_count("g1"), 3);
        let turns: Vec<u32> = store.turns("g1").iter().map(|t| t.turn).collect();
        assert_eq!(turns, vec![1, 2, 3]);
        assert_eq!(store.last_turn("g1").unwrap().turn, 3);
    }

    #[test]
    fn test_out_of_order_turn_is_rejected() {
        let mut store = ConversationStore::new();
        store.append_turn("g1", ok(1)).unwrap();
        let err = store.append_turn("g1", ok(3)).unwrap_err();
        assert_eq!(
            err,
            ConversationError::TurnOutOfOrder {
                group: "g1".to_string(),
                expected: 2,
                got: 3
            }
        );
        assert_eq!(store.turn_count("g1"), 1);

        assert!(store.append_turn("g1", ok(1)).is_err());
        assert!(store.append_turn("g2", ok(2)).is_err());
    }

    #[test]
    fn test_external_id_is_never_cleared_by_empty_value() {
        let mut store = ConversationStore::new();
        store.set_external_id("g1", "conv-abc");
        assert_eq!(store.external_id("g1"), Some("conv-abc"));
        assert!(!store.is_new_conversation("g1"));

        store.set_external_id("g1", "  ");
        assert_eq!(store.external_id("g1"), Some("conv-abc"));

        store.set_external_id("g1", "conv-def");
        assert_eq!(store.external_id("g1"), Some("conv-def"));
    }

    #[test]
    fn test_statistics() {
        let mut store = ConversationStore::new();
        store.append_turn("g1", ok(1)).unwrap();
        store.append_turn("g1", failed(2)).unwrap();
        store.append_turn("g1", ok(3)).unwrap();
        store.append_turn("g2", ok(1)).unwrap();
        store.append_turn("g3", failed(1)).unwrap();

        let stats = store.statistics();
        assert_eq!(stats.conversation_count, 3);
        assert_eq!(stats.turn_count, 5);
        assert_eq!(stats.successful_turns, 3);
        assert_eq!(stats.failed_turns, 2);
        assert_eq!(stats.success_rate, 60.0);
        assert_eq!(stats.average_turns_per_conversation, 1.67);
    }

    #[test]
    fn test_conversations_keep_creation_order() {
        let mut store = ConversationStore::new();
        store.append_turn("b", ok(1)).unwrap();
        store.set_external_id("a", "conv-a");
        store.append_turn("a", ok(1)).unwrap();
        store.append_turn("a", ok(2)).unwrap();

        let summaries = store.conversations();
        assert_eq!(summaries.len(), 2);
        assert_eq!(summaries[0].key, "b");
        assert_eq!(summaries[0].external_id, None);
        assert_eq!(summaries[1].key, "a");
        assert_eq!(summaries[1].external_id.as_deref(), Some("conv-a"));
        assert_eq!(summaries[1].turn_count, 2);
        assert_eq!(summaries[1].last_turn, Some(2));
    }

    #[test]
    fn test_export_and_clear() {
        let mut store = ConversationStore::new();
        store.set_external_id("g1", "conv-1");
        store.append_turn("g1", ok(1)).unwrap();
        store.append_turn("g2", ok(1)).unwrap();

        let history = store.export_history("g1").unwrap();
        assert_eq!(history.external_id.as_deref(), Some("conv-1"));
        assert_eq!(history.turns.len(), 1);
        assert!(store.export_history("missing").is_none());

        assert!(store.clear("g1"));
        assert!(!store.clear("g1"));
        assert!(store.is_new_conversation("g1"));
        assert_eq!(store.conversations().len(), 1);

        store.clear_all();
        assert!(store.conversations().is_empty());
        assert_eq!(store.statistics().conversation_count, 0);
    }
}
