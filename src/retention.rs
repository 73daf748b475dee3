//! Tiered retention: TTL expiry, weekly priority decay, promotion and
//! demotion
//!
//! Runs once at start and then on a timer. A pass is idempotent modulo
//! time: decay tracks the weeks already applied since `updated_at`
//! (`decayed_weeks`), so re-running inside the same week changes nothing.
//! Decay alone never bumps `updated_at`; promotion, demotion and expiry do.

use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::watch;

use crate::error::Result;
use crate::storage::{queries, Storage};
use crate::types::{Memory, Tier};

/// Default sweep interval
pub const DEFAULT_INTERVAL_SECS: u64 = 24 * 60 * 60;
/// T3 decay stops at this priority instead of demoting
pub const T3_PRIORITY_CLAMP: f32 = 0.30;
/// T3 -> T1 promotion thresholds
const PROMOTE_THREADS: usize = 2;
const PROMOTE_REPEATS: i64 = 2;

/// Counters from one retention pass
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RetentionStats {
    pub scanned: usize,
    pub expired: usize,
    pub decayed: usize,
    pub promoted: usize,
    pub demoted: usize,
}

pub struct RetentionEngine {
    storage: Storage,
    interval: Duration,
}

impl RetentionEngine {
    pub fn new(storage: Storage, interval: Duration) -> Self {
        Self { storage, interval }
    }

    /// Timer loop; one pass immediately, then every interval
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    match self.run_once() {
                        Ok(stats) => tracing::info!(
                            scanned = stats.scanned,
                            expired = stats.expired,
                            decayed = stats.decayed,
                            promoted = stats.promoted,
                            demoted = stats.demoted,
                            "Retention pass finished"
                        ),
                        Err(e) => tracing::error!(error = %e, "Retention pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    }

    /// One full pass over all live memories
    pub fn run_once(&self) -> Result<RetentionStats> {
        let memories = self.storage.with_read(queries::all_live_memories)?;
        let now = Utc::now();
        let mut stats = RetentionStats {
            scanned: memories.len(),
            ..Default::default()
        };

        self.storage.with_transaction(|conn| {
            for mut memory in memories {
                let age_days = (now - memory.created_at).num_days();

                if age_days > memory.tier.ttl_days() {
                    queries::soft_delete_memory(conn, &memory.user_id, &memory.id, now)?;
                    queries::fts_remove(conn, &memory.id)?;
                    stats.expired += 1;
                    continue;
                }

                let mut dirty = false;

                if apply_decay(&mut memory, now) {
                    stats.decayed += 1;
                    dirty = true;
                }

                if memory.tier == Tier::T3
                    && memory.thread_set.len() >= PROMOTE_THREADS
                    && memory.repeats >= PROMOTE_REPEATS
                {
                    memory.tier = Tier::T1;
                    memory.updated_at = now;
                    memory.decayed_weeks = 0;
                    stats.promoted += 1;
                    dirty = true;
                } else if let Some(floor) = memory.tier.demotion_floor() {
                    if memory.priority < floor {
                        memory.tier = Tier::T3;
                        memory.updated_at = now;
                        memory.decayed_weeks = 0;
                        stats.demoted += 1;
                        dirty = true;
                    }
                }

                if dirty {
                    queries::update_memory(conn, &memory)?;
                }
            }
            Ok(())
        })?;

        Ok(stats)
    }
}

/// Apply the pending weeks of decay. Returns true when priority changed.
fn apply_decay(memory: &mut Memory, now: chrono::DateTime<Utc>) -> bool {
    let age_weeks = ((now - memory.updated_at).num_days() / 7).max(0);
    let pending = age_weeks - memory.decayed_weeks;
    if pending <= 0 {
        return false;
    }

    let decayed = (memory.priority - memory.tier.weekly_decay() * pending as f32).max(0.0);
    memory.priority = if memory.tier == Tier::T3 {
        // T3 never demotes; the floor only stabilizes long-lived rows
        decayed.max(T3_PRIORITY_CLAMP.min(memory.priority))
    } else {
        decayed
    };
    memory.decayed_weeks = age_weeks;
    true
}
