//! Sequence cursor tracker
//!
//! Per-conversation high-water mark of the last applied server sequence.
//! Lookups are synchronous (in-memory) so the dedup check never suspends;
//! the durable copy is written through the store after each accepted event.
//!
//! Besides the high-water mark, the tracker remembers the holes it has
//! observed between applied sequences. An event at or below the cursor is
//! a duplicate unless it fills one of those holes, which lets a late,
//! reordered event still land exactly once.

use dashmap::DashMap;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

use crate::error::StoreResult;
use crate::models::{ConversationId, Message};
use crate::store::DurableStore;

/// Upper bound of remembered holes per conversation; the oldest are forgotten first
const MAX_GAP_RANGES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Above the high-water mark
    Advanced,
    /// Below the high-water mark, inside a known hole
    FilledGap,
    /// Already applied (or older than anything tracked)
    Duplicate,
}

impl Admission {
    pub fn is_accepted(&self) -> bool {
        !matches!(self, Admission::Duplicate)
    }
}

#[derive(Debug, Default, Clone)]
struct CursorState {
    high_water: Option<i64>,
    /// start -> end (inclusive) of unapplied sequences below the high-water mark
    gaps: BTreeMap<i64, i64>,
}

impl CursorState {
    fn admit(&mut self, sequence: i64) -> Admission {
        match self.high_water {
            None => {
                self.high_water = Some(sequence);
                Admission::Advanced
            }
            Some(high) if sequence > high => {
                if sequence > high + 1 {
                    self.record_gap(high + 1, sequence - 1);
                }
                self.high_water = Some(sequence);
                Admission::Advanced
            }
            Some(_) => {
                if self.take_from_gap(sequence) {
                    Admission::FilledGap
                } else {
                    Admission::Duplicate
                }
            }
        }
    }

    fn raise(&mut self, sequence: i64) -> bool {
        match self.high_water {
            Some(high) if sequence <= high => false,
            _ => {
                self.high_water = Some(sequence);
                true
            }
        }
    }

    fn record_gap(&mut self, start: i64, end: i64) {
        self.gaps.insert(start, end);
        while self.gaps.len() > MAX_GAP_RANGES {
            self.gaps.pop_first();
        }
    }

    fn take_from_gap(&mut self, sequence: i64) -> bool {
        let Some((&start, &end)) = self.gaps.range(..=sequence).next_back() else {
            return false;
        };
        if sequence > end {
            return false;
        }

        self.gaps.remove(&start);
        if start < sequence {
            self.gaps.insert(start, sequence - 1);
        }
        if sequence < end {
            self.gaps.insert(sequence + 1, end);
        }
        true
    }
}

/// Cursor tracker shared by the reconciler and the session lifecycle
pub struct CursorTracker {
    states: DashMap<ConversationId, CursorState>,
    store: Arc<dyn DurableStore>,
}

impl CursorTracker {
    pub fn new(store: Arc<dyn DurableStore>) -> Self {
        Self {
            states: DashMap::new(),
            store,
        }
    }

    /// Seed cursors from the durable store at session start
    pub fn hydrate(&self, cursors: HashMap<ConversationId, i64>) {
        for (conversation_id, sequence) in cursors {
            self.states.entry(conversation_id).or_default().raise(sequence);
        }
    }

    /// Rebuild holes from a retained message window
    pub fn hydrate_gaps(&self, conversation_id: ConversationId, messages: &[Message]) {
        let mut state = self.states.entry(conversation_id).or_default();
        let mut confirmed: Vec<i64> = messages
            .iter()
            .filter(|m| !m.is_provisional())
            .map(|m| m.sequence)
            .collect();
        confirmed.sort_unstable();

        for pair in confirmed.windows(2) {
            if pair[1] > pair[0] + 1 {
                state.record_gap(pair[0] + 1, pair[1] - 1);
            }
        }
    }

    /// Highest applied sequence, if any
    pub fn get_cursor(&self, conversation_id: ConversationId) -> Option<i64> {
        self.states
            .get(&conversation_id)
            .and_then(|state| state.high_water)
    }

    /// Synchronous dedup check; records the sequence when accepted
    pub fn admit(&self, conversation_id: ConversationId, sequence: i64) -> Admission {
        let admission = self
            .states
            .entry(conversation_id)
            .or_default()
            .admit(sequence);

        if admission == Admission::Duplicate {
            debug!(
                conversation_id = %conversation_id,
                sequence = sequence,
                "Sequence at or below cursor"
            );
        }
        admission
    }

    /// Raise the cursor without recording holes. Lower or equal values are
    /// ignored. Returns whether the cursor moved.
    pub fn raise(&self, conversation_id: ConversationId, sequence: i64) -> bool {
        self.states.entry(conversation_id).or_default().raise(sequence)
    }

    /// Monotonic set, written through to the durable store
    pub async fn set_cursor(
        &self,
        conversation_id: ConversationId,
        sequence: i64,
    ) -> StoreResult<bool> {
        if !self.raise(conversation_id, sequence) {
            return Ok(false);
        }
        self.persist(conversation_id).await?;
        Ok(true)
    }

    /// Write the current high-water mark to the durable store
    pub async fn persist(&self, conversation_id: ConversationId) -> StoreResult<()> {
        match self.get_cursor(conversation_id) {
            Some(sequence) => self.store.save_cursor(conversation_id, sequence).await,
            None => Ok(()),
        }
    }

    pub fn remove(&self, conversation_id: ConversationId) {
        self.states.remove(&conversation_id);
    }

    pub fn clear(&self) {
        self.states.clear();
    }
}
