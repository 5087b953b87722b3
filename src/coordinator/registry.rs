//! Registry of calls considered running, kept in sync with persistence.

use crate::sfu::PeekResponseBody;
use crate::store::{self, GroupCallStore};
use crate::types::{CallId, Gck, GroupCallDescription, GroupId};
use dashmap::DashMap;
use log::debug;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;

/// Consecutive-failure counters for peeks, keyed by call id.
///
/// Incremented for every non-OK unjoined peek, reset on success; consulted
/// only for the abandonment decision.
#[derive(Default)]
pub struct PeekFailedCounter {
    counters: DashMap<CallId, u32>,
}

impl PeekFailedCounter {
    /// Increment the counter and return its new value.
    pub fn get_and_increment(&self, call_id: &CallId) -> u32 {
        let mut entry = self.counters.entry(*call_id).or_insert(0);
        *entry += 1;
        *entry
    }

    /// Reset the counter to zero and return zero.
    pub fn reset(&self, call_id: &CallId) -> u32 {
        self.counters.insert(*call_id, 0);
        0
    }

    fn remove(&self, call_id: &CallId) {
        self.counters.remove(call_id);
    }
}

/// Owns the set of calls considered running, per group, and keeps the
/// persisted copy in sync at every mutation point.
pub struct CallRegistry {
    store: Arc<dyn GroupCallStore>,
    running: Mutex<HashMap<CallId, GroupCallDescription>>,
    peek_failed: PeekFailedCounter,
}

impl CallRegistry {
    pub fn new(store: Arc<dyn GroupCallStore>) -> Self {
        Self {
            store,
            running: Mutex::new(HashMap::new()),
            peek_failed: PeekFailedCounter::default(),
        }
    }

    pub fn peek_failed(&self) -> &PeekFailedCounter {
        &self.peek_failed
    }

    /// Seed the in-memory set from persistence. Returns the distinct groups
    /// found so each can get an initial refresh cycle.
    pub async fn load_persisted(&self) -> store::Result<Vec<GroupId>> {
        let persisted = self.store.all().await?;
        let mut groups = Vec::new();
        let mut running = self.running.lock().unwrap();
        for call in persisted {
            if !groups.contains(&call.group_id) {
                groups.push(call.group_id);
            }
            running.insert(call.call_id, call);
        }
        debug!(
            "Loaded {} persisted running calls across {} groups",
            running.len(),
            groups.len()
        );
        Ok(groups)
    }

    /// Add a call to the considered-running set. Inserting an already known
    /// call id overwrites it.
    pub async fn add_running_call(&self, call: GroupCallDescription) -> store::Result<()> {
        debug!("Add running call {}", call.call_id);
        // Persist first so a store failure never leaves a tracked call
        // without a persisted row.
        self.store.create_or_update(&call).await?;
        self.running.lock().unwrap().insert(call.call_id, call);
        Ok(())
    }

    /// Remove calls from the considered-running set. Missing ids are no-ops.
    /// Returns the descriptions actually removed.
    pub async fn remove_running_calls(
        &self,
        call_ids: &HashSet<CallId>,
    ) -> store::Result<Vec<GroupCallDescription>> {
        let mut removed = Vec::new();
        for call_id in call_ids {
            let call = self.running.lock().unwrap().get(call_id).cloned();
            let Some(call) = call else {
                debug!("call removed: false, id={call_id}");
                continue;
            };
            self.store.delete(&call).await?;
            self.running.lock().unwrap().remove(call_id);
            self.peek_failed.remove(call_id);
            debug!("call removed: true, id={call_id}");
            removed.push(call);
        }
        Ok(removed)
    }

    /// Snapshot of the calls considered running for a group.
    pub fn running_calls(&self, group_id: GroupId) -> Vec<GroupCallDescription> {
        self.running
            .lock()
            .unwrap()
            .values()
            .filter(|call| call.group_id == group_id)
            .cloned()
            .collect()
    }

    pub fn get(&self, call_id: &CallId) -> Option<GroupCallDescription> {
        self.running.lock().unwrap().get(call_id).cloned()
    }

    pub fn contains(&self, call_id: &CallId) -> bool {
        self.running.lock().unwrap().contains_key(call_id)
    }

    /// Whether a call with this gck is already tracked for the group.
    pub fn has_duplicate_gck(&self, group_id: GroupId, gck: &Gck) -> bool {
        self.running
            .lock()
            .unwrap()
            .values()
            .any(|call| call.group_id == group_id && &call.gck == gck)
    }

    /// Merge peeked state into a tracked call. No-op when the call has been
    /// removed in the meantime.
    pub fn update_call_state(&self, call_id: &CallId, body: &PeekResponseBody) {
        let mut running = self.running.lock().unwrap();
        if let Some(call) = running.get_mut(call_id) {
            call.max_participants = Some(body.max_participants);
            call.started_at = body.started_at;
            call.encrypted_call_state = body.encrypted_call_state.clone();
            debug!("Update call state {call_id}");
        }
    }
}
