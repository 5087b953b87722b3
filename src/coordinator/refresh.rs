//! The periodic refresh cycle: peek every running call, prune dead ones and
//! re-derive the chosen call per group.

use super::manager::GroupCallManager;
use crate::protocol::{
    GC_PROTOCOL_VERSION, PEEK_FAILED_ABANDON_MIN_CALL_AGE, PEEK_FAILED_ABANDON_MIN_TRIES,
};
use crate::services::GroupCallStatus;
use crate::sfu::{PeekResponse, SfuError};
use crate::store;
use crate::types::{CallId, GroupCallDescription, GroupId};
use chrono::Utc;
use futures_util::{StreamExt, stream};
use log::{debug, info, warn};
use std::collections::HashSet;
use std::sync::Arc;

/// Outcome of peeking one running call.
struct PeekResult {
    call: GroupCallDescription,
    sfu_response: Option<PeekResponse>,
    is_joined: bool,
    /// The peek itself failed (network, timeout). Distinct from a completed
    /// peek with a non-OK status.
    is_peek_failed: bool,
}

impl PeekResult {
    fn is_http_ok(&self) -> bool {
        self.sfu_response.as_ref().is_some_and(|r| r.is_http_ok())
    }

    fn is_http_not_found(&self) -> bool {
        self.sfu_response
            .as_ref()
            .is_some_and(|r| r.is_http_not_found())
    }
}

impl GroupCallManager {
    /// Run a refresh cycle for the group in the background.
    pub fn trigger_refresh(self: &Arc<Self>, group_id: GroupId) {
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run_refresh_steps(group_id).await;
        });
    }

    /// Run one refresh cycle for the group and return its chosen call.
    ///
    /// Cycles for the same group are serialized; concurrent triggers queue up
    /// behind the running one.
    pub async fn run_refresh_steps(
        self: &Arc<Self>,
        group_id: GroupId,
    ) -> Option<GroupCallDescription> {
        let lock = self.refresh_lock(group_id);
        let _guard = lock.lock().await;
        debug!("Running refresh steps for group {group_id}");

        let chosen = self.derive_chosen_call(group_id).await;
        self.schedule_refresh(group_id);

        match chosen {
            Some(call) => {
                self.update_chosen_and_notify(group_id, call.call_id).await;
                self.consolidate_joined_call(group_id, &call).await;
                Some(call)
            }
            None => {
                let had_chosen = self
                    .chosen_calls
                    .lock()
                    .unwrap()
                    .remove(&group_id)
                    .is_some();
                if had_chosen {
                    debug!("Group {group_id} no longer has a chosen call");
                    self.observers.notify_group(group_id, None);
                }
                None
            }
        }
    }

    /// The call everyone in the group should converge on: of the calls still
    /// considered running, the one with the latest start; ties broken by the
    /// larger call id so all devices pick the same call.
    async fn derive_chosen_call(self: &Arc<Self>, group_id: GroupId) -> Option<GroupCallDescription> {
        self.considered_running_calls(group_id)
            .await
            .into_iter()
            .max_by(|a, b| {
                a.started_at
                    .cmp(&b.started_at)
                    .then_with(|| a.call_id.cmp(&b.call_id))
            })
    }

    /// Peek all running calls of the group, prune dead ones and return those
    /// still in the running for chosen-call derivation.
    async fn considered_running_calls(
        self: &Arc<Self>,
        group_id: GroupId,
    ) -> Vec<GroupCallDescription> {
        let snapshot = self.registry.running_calls(group_id);
        if snapshot.is_empty() {
            self.purge_refresh_timers(group_id);
            return Vec::new();
        }

        let results: Vec<PeekResult> = stream::iter(snapshot)
            .map(|call| self.peek_call(call))
            .buffer_unordered(self.config.peek_concurrency)
            .collect()
            .await;

        for result in &results {
            if let Err(e) = self.purge_running_call(result).await {
                warn!("Could not purge call {}: {e}", result.call.call_id);
            }
        }

        let mut considered = Vec::new();
        for result in results {
            if result.call.protocol_version != GC_PROTOCOL_VERSION {
                debug!(
                    "Call {} has protocol version {}, not considering it",
                    result.call.call_id, result.call.protocol_version
                );
                continue;
            }
            if !(result.is_joined || result.is_http_ok()) {
                continue;
            }
            if let Some(body) = result
                .sfu_response
                .as_ref()
                .filter(|r| r.is_http_ok())
                .and_then(|r| r.body.as_ref())
            {
                self.registry.update_call_state(&result.call.call_id, body);
            }
            // Re-fetch to pick up the merged peek state; the call may also
            // have been pruned above.
            if let Some(merged) = self.registry.get(&result.call.call_id) {
                considered.push(merged);
            }
        }

        self.purge_refresh_timers(group_id);
        considered
    }

    async fn peek_call(&self, call: GroupCallDescription) -> PeekResult {
        let is_joined = self.is_joined_call(&call.call_id);
        match self.peek_with_retry(&call).await {
            Ok(response) => PeekResult {
                is_joined,
                is_peek_failed: false,
                sfu_response: Some(response),
                call,
            },
            Err(e) => {
                warn!("Peek failed for call {}: {e}", call.call_id);
                PeekResult {
                    is_joined,
                    is_peek_failed: true,
                    sfu_response: None,
                    call,
                }
            }
        }
    }

    /// Peek the call, retrying once with a forcibly refreshed token when the
    /// SFU rejects the current one.
    async fn peek_with_retry(&self, call: &GroupCallDescription) -> Result<PeekResponse, SfuError> {
        let mut force_refresh = false;
        let mut retries = 1u32;
        loop {
            let token = self.deps.sfu.obtain_token(force_refresh).await?;
            let response = self
                .deps
                .sfu
                .peek(&token, &call.sfu_base_url, &call.call_id)
                .await?;
            if response.is_token_invalid() && retries > 0 {
                debug!("Sfu token rejected, retrying peek of {} with a fresh one", call.call_id);
                retries -= 1;
                force_refresh = true;
                continue;
            }
            return Ok(response);
        }
    }

    /// Remove the call when the SFU no longer knows it or it has been
    /// abandoned. Joined calls and transiently unreachable ones are kept.
    async fn purge_running_call(&self, result: &PeekResult) -> store::Result<()> {
        if result.is_peek_failed {
            return Ok(());
        }
        if result.is_http_ok() {
            self.registry.peek_failed().reset(&result.call.call_id);
            return Ok(());
        }
        if result.is_joined {
            return Ok(());
        }
        if result.is_http_not_found() || self.is_abandoned_call(&result.call) {
            info!("Removing dead call {}", result.call.call_id);
            let removed = self
                .registry
                .remove_running_calls(&HashSet::from([result.call.call_id]))
                .await?;
            if !removed.is_empty() {
                self.deps
                    .notifications
                    .cancel_group_call_notification(result.call.group_id);
                self.update_chosen_and_notify(result.call.group_id, result.call.call_id)
                    .await;
            }
        }
        Ok(())
    }

    /// A call is abandoned when its peeks kept coming back non-OK and it is
    /// old enough that a slow call setup cannot explain the silence. Counts
    /// this failure as a side effect.
    fn is_abandoned_call(&self, call: &GroupCallDescription) -> bool {
        let failed_count = self.registry.peek_failed().get_and_increment(&call.call_id);
        failed_count >= PEEK_FAILED_ABANDON_MIN_TRIES
            && call.age(Utc::now()) >= PEEK_FAILED_ABANDON_MIN_CALL_AGE
    }

    /// Arm the refresh timer for the group unless one is already armed or
    /// nothing is left to refresh.
    fn schedule_refresh(self: &Arc<Self>, group_id: GroupId) {
        if self.registry.running_calls(group_id).is_empty() {
            return;
        }
        let mut timers = self.refresh_timers.lock().unwrap();
        if timers.contains_key(&group_id) {
            return;
        }
        debug!("Scheduling refresh for group {group_id}");
        let manager = self.clone();
        let interval = self.config.refresh_interval;
        timers.insert(
            group_id,
            tokio::spawn(async move {
                tokio::time::sleep(interval).await;
                // Clear this timer's own entry first; the refresh below must
                // be able to arm the next one.
                manager.refresh_timers.lock().unwrap().remove(&group_id);
                manager.run_refresh_steps(group_id).await;
            }),
        );
    }

    /// Disarm the group's refresh timer when no running calls remain.
    fn purge_refresh_timers(&self, group_id: GroupId) {
        if !self.registry.running_calls(group_id).is_empty() {
            return;
        }
        if let Some(handle) = self.refresh_timers.lock().unwrap().remove(&group_id) {
            debug!("No running calls left in group {group_id}, disarming refresh timer");
            handle.abort();
        }
    }

    /// Sync the chosen-call map with the registry for this call and notify
    /// observers of the outcome.
    pub(super) async fn update_chosen_and_notify(&self, group_id: GroupId, call_id: CallId) {
        match self.registry.get(&call_id) {
            Some(call) => {
                self.chosen_calls
                    .lock()
                    .unwrap()
                    .insert(group_id, call.clone());
                self.observers.notify_group(group_id, Some(&call));
            }
            None => {
                let was_chosen = {
                    let mut chosen = self.chosen_calls.lock().unwrap();
                    if chosen
                        .get(&group_id)
                        .is_some_and(|call| call.call_id == call_id)
                    {
                        chosen.remove(&group_id);
                        true
                    } else {
                        false
                    }
                };
                if was_chosen {
                    self.observers.notify_group(group_id, None);
                }
                self.deps
                    .statuses
                    .group_call_status(GroupCallStatus::Ended { call_id });
            }
        }
    }

    /// When the joined call of this group is no longer the chosen one, move
    /// over: leave the joined call and join the chosen call, carrying the
    /// microphone state along.
    async fn consolidate_joined_call(
        self: &Arc<Self>,
        group_id: GroupId,
        chosen: &GroupCallDescription,
    ) {
        let Some(controller) = self.current_controller() else {
            return;
        };
        let joined = controller.description();
        if joined.group_id != group_id || joined.call_id == chosen.call_id {
            return;
        }
        info!(
            "Moving from joined call {} to chosen call {}",
            joined.call_id, chosen.call_id
        );
        let microphone_active = controller.microphone_active();
        controller.leave();
        let _ = controller.disposed().await;
        match self.join_and_confirm_call(chosen).await {
            Ok(new_controller) => new_controller.set_microphone_active(microphone_active),
            Err(e) => warn!("Could not move to chosen call {}: {e}", chosen.call_id),
        }
    }

    fn refresh_lock(&self, group_id: GroupId) -> Arc<tokio::sync::Mutex<()>> {
        self.refresh_locks
            .lock()
            .unwrap()
            .entry(group_id)
            .or_default()
            .clone()
    }
}
