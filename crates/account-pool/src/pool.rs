//! Account rotation state machine
//!
//! Each pool entry is either available or cooled down. The pool is exhausted
//! when every entry is cooled down; that condition is computed, never stored.
//!
//! Rotation only happens on a 429 and always advances exactly one slot, even
//! when the next entry is itself cooled down. A pool of one never moves.
//!
//! All state sits behind one mutex. Rotation and the write of the new active
//! credential into the process state (`CredentialSink`) happen under the same
//! lock acquisition, so concurrent 429s cannot double-advance or interleave.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use common::Secret;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::source::CredentialRecord;

const RATE_LIMITED: u16 = 429;

/// Receives the active credential whenever it changes.
///
/// Called while the pool lock is held; implementations must not block.
pub trait CredentialSink: Send + Sync {
    fn set_active_credential(&self, index: usize, label: &str, secret: &Secret<String>);
}

/// The credential at the current index, captured at one instant.
#[derive(Debug, Clone)]
pub struct ActiveCredential {
    pub index: usize,
    pub label: String,
    pub secret: Secret<String>,
}

#[derive(Debug, Clone, Copy)]
struct Cooldown {
    since: SystemTime,
    reset_at: Option<SystemTime>,
}

#[derive(Debug, Default, Clone, Copy)]
struct Usage {
    requests: u64,
    rate_limit_hits: u64,
}

#[derive(Debug)]
struct Entry {
    record: CredentialRecord,
    cooldown: Option<Cooldown>,
    usage: Usage,
}

#[derive(Debug)]
struct PoolState {
    entries: Vec<Entry>,
    current_index: usize,
}

impl PoolState {
    fn active(&self) -> ActiveCredential {
        let entry = &self.entries[self.current_index];
        ActiveCredential {
            index: self.current_index,
            label: entry.record.label.clone(),
            secret: entry.record.secret.clone(),
        }
    }

    fn sync(&self, sink: &dyn CredentialSink) {
        let entry = &self.entries[self.current_index];
        sink.set_active_credential(self.current_index, &entry.record.label, &entry.record.secret);
    }

    /// Record a 429 against `index` and advance if it is still current.
    fn rotate_from(&mut self, index: usize, retry_after: Option<Duration>) -> bool {
        let now = SystemTime::now();
        let size = self.entries.len();
        let is_current = index == self.current_index;

        let entry = &mut self.entries[index];
        entry.usage.rate_limit_hits += 1;
        entry.cooldown = Some(Cooldown {
            since: now,
            reset_at: retry_after.map(|d| now + d),
        });

        if size == 1 {
            warn!(
                account = %entry.record.label,
                "single-account pool rate limited, cannot rotate"
            );
            return false;
        }
        if !is_current {
            debug!(
                account = %entry.record.label,
                "rate limit for a credential that is no longer current"
            );
            return false;
        }

        let from = entry.record.label.clone();
        self.current_index = (self.current_index + 1) % size;
        info!(
            from = %from,
            to = %self.entries[self.current_index].record.label,
            index = self.current_index,
            "rotated active credential"
        );
        metrics::counter!("gateway_account_rotations_total").increment(1);
        true
    }

    /// Indices carrying `label`, current entry first.
    fn indices_for(&self, label: &str) -> Vec<usize> {
        let mut indices: Vec<usize> = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, e)| e.record.label == label)
            .map(|(i, _)| i)
            .collect();
        if let Some(pos) = indices.iter().position(|&i| i == self.current_index) {
            indices.swap(0, pos);
        }
        indices
    }
}

/// Pool health and rotation view.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStatus {
    pub size: usize,
    pub current_index: usize,
    pub current_label: String,
    pub cooled_down: Vec<CooldownView>,
    pub all_exhausted: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct CooldownView {
    pub index: usize,
    pub label: String,
    /// Unix seconds
    pub since: u64,
    /// Unix seconds, from the backend's `retry-after`
    pub reset_at: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AccountUsage {
    pub index: usize,
    pub label: String,
    pub requests: u64,
    pub rate_limit_hits: u64,
    pub cooled_down: bool,
}

/// Ordered, non-empty pool of credentials with a current-selection pointer.
pub struct AccountPool {
    state: Mutex<PoolState>,
}

impl AccountPool {
    /// Build a pool from resolved records. An empty list is a configuration error.
    pub fn new(records: Vec<CredentialRecord>) -> Result<Self> {
        if records.is_empty() {
            return Err(Error::NoCredentials("credential pool is empty".into()));
        }
        let labels: Vec<&str> = records.iter().map(|r| r.label.as_str()).collect();
        info!(accounts = records.len(), labels = ?labels, "account pool initialized");

        let entries = records
            .into_iter()
            .map(|record| Entry {
                record,
                cooldown: None,
                usage: Usage::default(),
            })
            .collect();
        Ok(Self {
            state: Mutex::new(PoolState {
                entries,
                current_index: 0,
            }),
        })
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn current(&self) -> ActiveCredential {
        self.state.lock().await.active()
    }

    /// Rotate on a 429 from the current credential; any other status is ignored.
    ///
    /// Returns whether the pointer moved.
    pub async fn rotate_on_status(&self, status: u16) -> bool {
        if status != RATE_LIMITED {
            return false;
        }
        let mut state = self.state.lock().await;
        let index = state.current_index;
        state.rotate_from(index, None)
    }

    /// Rotate on a 429 and publish the new active credential in one step.
    pub async fn rotate_and_sync(&self, status: u16, sink: &dyn CredentialSink) -> bool {
        if status != RATE_LIMITED {
            return false;
        }
        let mut state = self.state.lock().await;
        let index = state.current_index;
        let rotated = state.rotate_from(index, None);
        if rotated {
            state.sync(sink);
        }
        rotated
    }

    /// Rotate on a 429 observed by a request dispatched on `dispatched_index`.
    ///
    /// The hit and cooldown are always recorded against the dispatched entry,
    /// but the pointer only moves if that entry is still current, so two
    /// concurrent 429s for one credential advance once.
    pub async fn rotate_if_current(
        &self,
        dispatched_index: usize,
        status: u16,
        retry_after: Option<Duration>,
        sink: &dyn CredentialSink,
    ) -> bool {
        if status != RATE_LIMITED {
            return false;
        }
        let mut state = self.state.lock().await;
        if dispatched_index >= state.entries.len() {
            return false;
        }
        let rotated = state.rotate_from(dispatched_index, retry_after);
        if rotated {
            state.sync(sink);
        }
        rotated
    }

    /// Publish the current credential into the process state.
    pub async fn sync_into_state(&self, sink: &dyn CredentialSink) {
        self.state.lock().await.sync(sink);
    }

    pub async fn mark_cooled_down(&self, label: &str) {
        let mut state = self.state.lock().await;
        let now = SystemTime::now();
        for i in state.indices_for(label) {
            let entry = &mut state.entries[i];
            if entry.cooldown.is_none() {
                entry.cooldown = Some(Cooldown {
                    since: now,
                    reset_at: None,
                });
            }
        }
    }

    pub async fn reset_cooldown(&self, label: &str) {
        let mut state = self.state.lock().await;
        for i in state.indices_for(label) {
            if state.entries[i].cooldown.take().is_some() {
                info!(account = %label, "cooldown cleared");
            }
        }
    }

    /// Clear the cooldown of the entry at `index`, if set.
    pub async fn reset_cooldown_at(&self, index: usize) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.get_mut(index)
            && entry.cooldown.take().is_some()
        {
            debug!(account = %entry.record.label, "cooldown cleared after success");
        }
    }

    /// Clear every cooldown. Returns how many were cleared.
    pub async fn reset_all(&self) -> usize {
        let mut state = self.state.lock().await;
        let mut cleared = 0;
        for entry in state.entries.iter_mut() {
            if entry.cooldown.take().is_some() {
                cleared += 1;
            }
        }
        if cleared > 0 {
            info!(cleared, "all cooldowns cleared");
        }
        cleared
    }

    pub async fn all_exhausted(&self) -> bool {
        let state = self.state.lock().await;
        state.entries.iter().all(|e| e.cooldown.is_some())
    }

    /// Count one attempted backend call against `label`.
    pub async fn record_request(&self, label: &str) {
        let mut state = self.state.lock().await;
        if let Some(&i) = state.indices_for(label).first() {
            state.entries[i].usage.requests += 1;
        }
    }

    /// Count one attempted backend call against the entry at `index`.
    pub async fn record_request_at(&self, index: usize) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.entries.get_mut(index) {
            entry.usage.requests += 1;
        }
    }

    pub async fn usage_snapshot(&self) -> Vec<AccountUsage> {
        let state = self.state.lock().await;
        state
            .entries
            .iter()
            .enumerate()
            .map(|(index, e)| AccountUsage {
                index,
                label: e.record.label.clone(),
                requests: e.usage.requests,
                rate_limit_hits: e.usage.rate_limit_hits,
                cooled_down: e.cooldown.is_some(),
            })
            .collect()
    }

    pub async fn status_snapshot(&self) -> PoolStatus {
        let state = self.state.lock().await;
        let cooled_down: Vec<CooldownView> = state
            .entries
            .iter()
            .enumerate()
            .filter_map(|(index, e)| {
                e.cooldown.map(|c| CooldownView {
                    index,
                    label: e.record.label.clone(),
                    since: unix_secs(c.since),
                    reset_at: c.reset_at.map(unix_secs),
                })
            })
            .collect();
        PoolStatus {
            size: state.entries.len(),
            current_index: state.current_index,
            current_label: state.entries[state.current_index].record.label.clone(),
            all_exhausted: cooled_down.len() == state.entries.len(),
            cooled_down,
        }
    }
}

fn unix_secs(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH).unwrap_or_default().as_secs()
}
