use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::executor::ActionResult;
use crate::intent::CommandIntent;

/// One processed command: what was said, what we decided it meant, the
/// context generation it was resolved against, and what happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Turn {
    pub turn_id: Uuid,
    pub session_id: String,
    pub command_text: String,
    pub intent: CommandIntent,
    pub context_id: Option<Uuid>,
    pub result: ActionResult,
    pub ts_ms: i64,
}

/// Append-only rolling history with oldest-eviction. Owned exclusively by
/// the orchestrator for its session; resolver and executor only ever see
/// borrowed slices.
#[derive(Debug)]
pub struct ConversationStore {
    capacity: usize,
    turns: VecDeque<Turn>,
}

impl ConversationStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            turns: VecDeque::new(),
        }
    }

    pub fn push(&mut self, turn: Turn) {
        if self.turns.len() == self.capacity {
            self.turns.pop_front();
        }
        self.turns.push_back(turn);
    }

    pub fn len(&self) -> usize {
        self.turns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.turns.is_empty()
    }

    /// Last `n` turns, oldest first.
    pub fn recent(&self, n: usize) -> Vec<Turn> {
        let skip = self.turns.len().saturating_sub(n);
        self.turns.iter().skip(skip).cloned().collect()
    }

    pub fn last(&self) -> Option<&Turn> {
        self.turns.back()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::executor::ActionResult;
    use crate::intent::{ActionKind, CommandIntent, IntentSourceKind};

    fn turn(n: u32) -> Turn {
        Turn {
            turn_id: Uuid::new_v4(),
            session_id: "s-1".to_string(),
            command_text: format!("command {n}"),
            intent: CommandIntent::new(ActionKind::Read, IntentSourceKind::Rules, 0.9),
            context_id: None,
            result: ActionResult {
                success: true,
                verified: true,
                description: "ok".to_string(),
                target: None,
                error: None,
                duration_ms: 1,
                post_context_id: None,
            },
            ts_ms: n as i64,
        }
    }

    #[test]
    fn store_evicts_oldest_at_capacity() {
        let mut store = ConversationStore::new(3);
        for n in 0..5 {
            store.push(turn(n));
        }
        assert_eq!(store.len(), 3);
        let recent = store.recent(10);
        assert_eq!(recent[0].command_text, "command 2");
        assert_eq!(recent[2].command_text, "command 4");
    }

    #[test]
    fn recent_returns_newest_window_oldest_first() {
        let mut store = ConversationStore::new(10);
        for n in 0..6 {
            store.push(turn(n));
        }
        let recent = store.recent(2);
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].command_text, "command 4");
        assert_eq!(recent[1].command_text, "command 5");
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let mut store = ConversationStore::new(0);
        store.push(turn(1));
        store.push(turn(2));
        assert_eq!(store.len(), 1);
        assert_eq!(store.last().unwrap().command_text, "command 2");
    }
}
