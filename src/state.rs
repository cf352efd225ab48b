//! Agent-wide gating state.
//!
//! A single `AgentState` lives for the whole process. It decides whether a
//! command may run (frozen mode, block list, allow list), carries the
//! delimited-response flag, and mints file handles from a counter that only
//! ever goes up.
//!
//! Every mutation goes through one writer lock; readers see whole snapshots.

use std::collections::HashSet;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Commands that may still run while the guest filesystems are frozen.
pub const FROZEN_ALLOWED_COMMANDS: &[&str] = &[
    "guest-ping",
    "guest-info",
    "guest-sync",
    "guest-sync-delimited",
    "guest-fsfreeze-status",
    "guest-fsfreeze-thaw",
];

/// Starting value of the handle counter. The first handle is one above it.
pub const INITIAL_FD_COUNTER: i64 = 1000;

/// Gating mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GateMode {
    Normal,
    Frozen,
}

#[derive(Debug)]
struct StateInner {
    mode: GateMode,
    blocked_commands: HashSet<String>,
    allowed_commands: HashSet<String>,
    response_delimited: bool,
    fd_counter: i64,
}

/// Process-wide agent state, shared behind an `Arc`.
#[derive(Debug)]
pub struct AgentState {
    inner: RwLock<StateInner>,
}

impl Default for AgentState {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentState {
    /// Fresh state: normal mode, no block or allow list.
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(StateInner {
                mode: GateMode::Normal,
                blocked_commands: HashSet::new(),
                allowed_commands: HashSet::new(),
                response_delimited: false,
                fd_counter: INITIAL_FD_COUNTER,
            }),
        }
    }

    /// State with the given block and allow lists.
    pub fn with_lists<B, A>(blocked: B, allowed: A) -> Self
    where
        B: IntoIterator,
        B::Item: Into<String>,
        A: IntoIterator,
        A::Item: Into<String>,
    {
        let state = Self::new();
        {
            let mut inner = state.write();
            inner.blocked_commands = blocked.into_iter().map(Into::into).collect();
            inner.allowed_commands = allowed.into_iter().map(Into::into).collect();
        }
        state
    }

    // Nothing inside the lock can leave the state half-updated, so a poisoned
    // lock is still consistent.
    fn read(&self) -> RwLockReadGuard<'_, StateInner> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StateInner> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn mode(&self) -> GateMode {
        self.read().mode
    }

    pub fn is_frozen(&self) -> bool {
        self.mode() == GateMode::Frozen
    }

    /// Enter frozen mode. Returns `true` if the mode changed.
    pub fn freeze(&self) -> bool {
        let mut inner = self.write();
        let changed = inner.mode != GateMode::Frozen;
        inner.mode = GateMode::Frozen;
        changed
    }

    /// Leave frozen mode. Returns `true` if the mode changed.
    pub fn thaw(&self) -> bool {
        let mut inner = self.write();
        let changed = inner.mode != GateMode::Normal;
        inner.mode = GateMode::Normal;
        changed
    }

    /// Replace the block list.
    pub fn set_blocked_commands<I>(&self, names: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.write().blocked_commands = names.into_iter().map(Into::into).collect();
    }

    /// Replace the allow list. An empty list means "allow unless blocked".
    pub fn set_allowed_commands<I>(&self, names: I)
    where
        I: IntoIterator,
        I::Item: Into<String>,
    {
        self.write().allowed_commands = names.into_iter().map(Into::into).collect();
    }

    /// Decide whether `name` may run right now.
    ///
    /// Frozen mode overrides both lists. Otherwise the block list wins over
    /// the allow list, and an empty allow list admits everything.
    pub fn is_command_allowed(&self, name: &str) -> bool {
        let inner = self.read();

        if inner.mode == GateMode::Frozen {
            return FROZEN_ALLOWED_COMMANDS.contains(&name);
        }

        if inner.blocked_commands.contains(name) {
            return false;
        }

        if !inner.allowed_commands.is_empty() {
            return inner.allowed_commands.contains(name);
        }

        true
    }

    pub fn set_response_delimited(&self, delimited: bool) {
        self.write().response_delimited = delimited;
    }

    pub fn is_response_delimited(&self) -> bool {
        self.read().response_delimited
    }

    /// Read and clear the delimited-response flag.
    pub fn take_response_delimited(&self) -> bool {
        std::mem::take(&mut self.write().response_delimited)
    }

    /// Mint the next handle. Strictly increasing, never reused.
    pub fn get_fd_handle(&self) -> i64 {
        let mut inner = self.write();
        inner.fd_counter += 1;
        inner.fd_counter
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn allows_everything_by_default() {
        let state = AgentState::new();
        assert!(state.is_command_allowed("guest-ping"));
        assert!(state.is_command_allowed("guest-shutdown"));
        assert!(state.is_command_allowed("anything"));
    }

    #[test]
    fn block_list_denies() {
        let state = AgentState::with_lists(["guest-shutdown"], Vec::<String>::new());
        assert!(!state.is_command_allowed("guest-shutdown"));
        assert!(state.is_command_allowed("guest-ping"));
    }

    #[test]
    fn allow_list_restricts() {
        let state = AgentState::with_lists(Vec::<String>::new(), ["guest-ping", "guest-info"]);
        assert!(state.is_command_allowed("guest-ping"));
        assert!(!state.is_command_allowed("guest-get-time"));
    }

    #[test]
    fn block_list_beats_allow_list() {
        let state = AgentState::with_lists(["guest-ping"], ["guest-ping", "guest-info"]);
        assert!(!state.is_command_allowed("guest-ping"));
        assert!(state.is_command_allowed("guest-info"));
    }

    #[test]
    fn frozen_mode_ignores_lists() {
        let state = AgentState::with_lists(["guest-ping"], ["guest-get-time"]);
        assert!(state.freeze());

        for name in FROZEN_ALLOWED_COMMANDS {
            assert!(state.is_command_allowed(name), "{name} should run while frozen");
        }
        assert!(!state.is_command_allowed("guest-get-time"));
        assert!(!state.is_command_allowed("guest-shutdown"));
        assert!(!state.is_command_allowed("guest-fsfreeze-freeze"));
    }

    #[test]
    fn freeze_and_thaw_report_transitions() {
        let state = AgentState::new();
        assert_eq!(state.mode(), GateMode::Normal);
        assert!(state.freeze());
        assert!(!state.freeze());
        assert!(state.is_frozen());
        assert!(state.thaw());
        assert!(!state.thaw());
        assert_eq!(state.mode(), GateMode::Normal);
    }

    #[test]
    fn lists_can_be_replaced() {
        let state = AgentState::new();
        state.set_blocked_commands(["a"]);
        assert!(!state.is_command_allowed("a"));
        state.set_blocked_commands(Vec::<String>::new());
        state.set_allowed_commands(["b"]);
        assert!(state.is_command_allowed("b"));
        assert!(!state.is_command_allowed("a"));
    }

    #[test]
    fn fd_handles_start_at_1001_and_increase() {
        let state = AgentState::new();
        let handles: Vec<_> = (0..5).map(|_| state.get_fd_handle()).collect();
        assert_eq!(handles, vec![1001, 1002, 1003, 1004, 1005]);
    }

    #[test]
    fn fd_handles_are_unique_across_threads() {
        let state = Arc::new(AgentState::new());
        let workers: Vec<_> = (0..8)
            .map(|_| {
                let state = Arc::clone(&state);
                std::thread::spawn(move || (0..100).map(|_| state.get_fd_handle()).collect::<Vec<_>>())
            })
            .collect();

        let mut all: Vec<i64> = workers
            .into_iter()
            .flat_map(|w| w.join().unwrap())
            .collect();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), 800);
        assert_eq!(all.first(), Some(&1001));
        assert_eq!(all.last(), Some(&1800));
    }

    #[test]
    fn delimited_flag_is_consumed_once() {
        let state = AgentState::new();
        assert!(!state.take_response_delimited());
        state.set_response_delimited(true);
        assert!(state.is_response_delimited());
        assert!(state.take_response_delimited());
        assert!(!state.take_response_delimited());
    }
}
