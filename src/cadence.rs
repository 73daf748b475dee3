//! Audit cadence tracking per (user, thread)
//!
//! Counters are in-memory only; a restart simply starts a new window.
//! Durability here would bound event throughput without correctness gain.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;

use crate::types::{MessageEvent, Role};

/// Messages in a window that trigger an audit
pub const MSG_THRESHOLD: i64 = 6;
/// Tokens in a window that trigger an audit
pub const TOKEN_THRESHOLD: i64 = 1500;
/// Window age that triggers an audit
pub const WINDOW_MAX_SECS: i64 = 180;
/// Minimum spacing between audits of one thread
pub const DEBOUNCE_SECS: i64 = 30;
/// Idle threads are dropped after this long
pub const IDLE_EXPIRY_SECS: i64 = 24 * 60 * 60;
/// Turns buffered per window; oldest are dropped beyond this
const BUFFER_CAP: usize = 64;

/// One buffered turn awaiting audit
#[derive(Debug, Clone)]
pub struct BufferedTurn {
    pub msg_id: String,
    pub role: Role,
    pub content: String,
    pub tokens: i64,
    pub timestamp: DateTime<Utc>,
}

/// Cadence state for one (user, thread)
#[derive(Debug, Clone, Default)]
pub struct ThreadState {
    pub msg_count: i64,
    pub token_count: i64,
    pub first_msg_time: Option<DateTime<Utc>>,
    pub last_msg_time: Option<DateTime<Utc>>,
    pub last_audit_time: Option<DateTime<Utc>>,
    /// An audit has fired and not yet completed
    pub audit_pending: bool,
    buffer: Vec<BufferedTurn>,
}

impl ThreadState {
    fn thresholds_crossed(&self, now: DateTime<Utc>) -> bool {
        if self.msg_count >= MSG_THRESHOLD || self.token_count >= TOKEN_THRESHOLD {
            return true;
        }
        match self.first_msg_time {
            Some(first) => now - first >= Duration::seconds(WINDOW_MAX_SECS),
            None => false,
        }
    }

    fn debounced(&self, now: DateTime<Utc>) -> bool {
        match self.last_audit_time {
            Some(last) => now - last < Duration::seconds(DEBOUNCE_SECS),
            None => false,
        }
    }
}

/// Tracks message cadence and decides when to audit a thread
pub struct CadenceTracker {
    states: DashMap<(String, String), ThreadState>,
}

impl CadenceTracker {
    pub fn new() -> Self {
        Self {
            states: DashMap::new(),
        }
    }

    /// Record one message; returns true when an audit should fire now
    pub fn record_message(&self, event: &MessageEvent, now: DateTime<Utc>) -> bool {
        let key = (event.user_id.clone(), event.thread_id.clone());
        let mut state = self.states.entry(key).or_default();

        state.msg_count += 1;
        state.token_count += event.tokens.input + event.tokens.output;
        state.last_msg_time = Some(now);
        if state.first_msg_time.is_none() {
            state.first_msg_time = Some(now);
        }

        if state.buffer.len() >= BUFFER_CAP {
            state.buffer.remove(0);
        }
        state.buffer.push(BufferedTurn {
            msg_id: event.msg_id.clone(),
            role: event.role,
            content: event.content.clone(),
            tokens: event.tokens.input + event.tokens.output,
            timestamp: event.timestamp.unwrap_or(now),
        });

        if state.audit_pending || state.debounced(now) || !state.thresholds_crossed(now) {
            return false;
        }
        state.audit_pending = true;
        true
    }

    /// Complete an audit: drain the window, zero counters, stamp times
    pub fn mark_audit_complete(&self, user_id: &str, thread_id: &str, now: DateTime<Utc>) -> Vec<BufferedTurn> {
        let key = (user_id.to_string(), thread_id.to_string());
        match self.states.get_mut(&key) {
            Some(mut state) => {
                let window = std::mem::take(&mut state.buffer);
                state.msg_count = 0;
                state.token_count = 0;
                state.first_msg_time = Some(now);
                state.last_audit_time = Some(now);
                state.audit_pending = false;
                window
            }
            None => Vec::new(),
        }
    }

    /// Drop states idle for longer than the expiry; returns how many
    pub fn sweep_idle(&self, now: DateTime<Utc>) -> usize {
        let before = self.states.len();
        self.states.retain(|_, state| match state.last_msg_time {
            Some(last) => now - last < Duration::seconds(IDLE_EXPIRY_SECS),
            None => false,
        });
        before - self.states.len()
    }

    /// Number of tracked (user, thread) windows
    pub fn tracked(&self) -> usize {
        self.states.len()
    }

    /// Peek at a thread's state (tests and metrics)
    pub fn state(&self, user_id: &str, thread_id: &str) -> Option<ThreadState> {
        self.states
            .get(&(user_id.to_string(), thread_id.to_string()))
            .map(|s| s.clone())
    }
}

impl Default for CadenceTracker {
    fn default() -> Self {
        Self::new()
    }
}
