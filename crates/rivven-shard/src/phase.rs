//! Migration phases
//!
//! A migration moves through a fixed, forward-only sequence of phases. The
//! [`PhaseTracker`] refuses to skip or repeat a phase, and once a run aborts it
//! stays in [`Phase::Aborted`] for good.

use crate::error::{Result, ShardError};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Phase of a shard migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    /// Filters built and configuration validated
    Created,
    /// Engine initialized (schema discovery, connections)
    Initialized,
    /// Background bulk copy running, all filtered rows copied at least once
    Copying,
    /// Best-effort verification passed
    PreCutoverVerified,
    /// Throttle cleared and binlog streamer caught up
    ThrottleSynced,
    /// External write lock acquired
    Locked,
    /// Streaming stopped and bulk copy task joined
    Drained,
    /// Joined tables re-copied under the lock
    JoinedTablesCopied,
    /// Authoritative verification passed
    CutoverVerified,
    /// Throttling re-enabled
    Unthrottled,
    /// Primary-key tables copied
    PrimaryKeyTablesCopied,
    /// External write lock released
    Unlocked,
    /// Cutover duration recorded, migration complete
    Done,
    /// Terminal failure
    Aborted,
}

impl Phase {
    /// The successful path, in order.
    pub const SEQUENCE: [Phase; 13] = [
        Phase::Created,
        Phase::Initialized,
        Phase::Copying,
        Phase::PreCutoverVerified,
        Phase::ThrottleSynced,
        Phase::Locked,
        Phase::Drained,
        Phase::JoinedTablesCopied,
        Phase::CutoverVerified,
        Phase::Unthrottled,
        Phase::PrimaryKeyTablesCopied,
        Phase::Unlocked,
        Phase::Done,
    ];

    fn position(&self) -> Option<usize> {
        Self::SEQUENCE.iter().position(|p| p == self)
    }

    /// The phase that must follow this one, if any.
    pub fn next(&self) -> Option<Phase> {
        self.position()
            .and_then(|idx| Self::SEQUENCE.get(idx + 1))
            .copied()
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Aborted)
    }

    /// Whether the external write lock is held once this phase is reached.
    pub fn holds_lock(&self) -> bool {
        matches!(
            self,
            Phase::Locked
                | Phase::Drained
                | Phase::JoinedTablesCopied
                | Phase::CutoverVerified
                | Phase::Unthrottled
                | Phase::PrimaryKeyTablesCopied
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Created => "created",
            Phase::Initialized => "initialized",
            Phase::Copying => "copying",
            Phase::PreCutoverVerified => "pre_cutover_verified",
            Phase::ThrottleSynced => "throttle_synced",
            Phase::Locked => "locked",
            Phase::Drained => "drained",
            Phase::JoinedTablesCopied => "joined_tables_copied",
            Phase::CutoverVerified => "cutover_verified",
            Phase::Unthrottled => "unthrottled",
            Phase::PrimaryKeyTablesCopied => "primary_key_tables_copied",
            Phase::Unlocked => "unlocked",
            Phase::Done => "done",
            Phase::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug)]
struct PhaseState {
    current: Phase,
    last_completed: Phase,
}

/// Forward-only phase guard.
#[derive(Debug)]
pub struct PhaseTracker {
    state: Mutex<PhaseState>,
}

impl Default for PhaseTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(PhaseState {
                current: Phase::Created,
                last_completed: Phase::Created,
            }),
        }
    }

    pub fn current(&self) -> Phase {
        self.state.lock().current
    }

    /// Last phase reached before an abort (or the current phase otherwise).
    pub fn last_completed(&self) -> Phase {
        self.state.lock().last_completed
    }

    /// Move to `next`, which must directly follow the current phase.
    pub fn advance(&self, next: Phase) -> Result<()> {
        let mut state = self.state.lock();
        if state.current.next() != Some(next) {
            return Err(ShardError::invalid_state(format!(
                "cannot move from phase {} to {}",
                state.current, next
            )));
        }
        state.current = next;
        state.last_completed = next;
        Ok(())
    }

    /// Fail unless the tracker is exactly at `phase`.
    pub fn expect(&self, phase: Phase) -> Result<()> {
        let current = self.current();
        if current != phase {
            return Err(ShardError::invalid_state(format!(
                "expected phase {}, migration is in phase {}",
                phase, current
            )));
        }
        Ok(())
    }

    /// Enter the terminal aborted state and return the last phase reached.
    ///
    /// A finished migration stays `Done`.
    pub fn abort(&self) -> Phase {
        let mut state = self.state.lock();
        if state.current != Phase::Done {
            state.current = Phase::Aborted;
        }
        state.last_completed
    }
}
