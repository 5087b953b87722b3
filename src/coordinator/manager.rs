//! The group call coordination engine.
//!
//! [`GroupCallManager`] owns the considered-running set, derives the chosen
//! call per group, steers call sessions and fans updates out to observers.
//! It talks to the outside world exclusively through the trait objects in
//! [`GroupCallDependencies`].

use super::error::GroupCallError;
use super::observer::{GroupCallObserver, ObserverHub};
use super::pipeline::StartQueue;
use super::registry::CallRegistry;
use crate::config::GroupCallConfig;
use crate::protocol::{
    GC_PROTOCOL_VERSION, GroupCallStartData, GroupCallStartMessage, START_QUEUE_CAPACITY,
};
use crate::services::{
    ContactDirectory, ControlMessageSender, GroupCallStatus, GroupDirectory, NotificationSurface,
    StatusSink,
};
use crate::session::{CallSessionFactory, GroupCallController};
use crate::sfu::SfuConnection;
use crate::store::GroupCallStore;
use crate::types::{CallId, GroupCallDescription, GroupId, Identity};
use chrono::Utc;
use log::{debug, info, warn};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

/// Everything the engine needs from its host application.
pub struct GroupCallDependencies {
    pub sfu: Arc<dyn SfuConnection>,
    pub store: Arc<dyn GroupCallStore>,
    pub sessions: Arc<dyn CallSessionFactory>,
    pub groups: Arc<dyn GroupDirectory>,
    pub contacts: Arc<dyn ContactDirectory>,
    pub messenger: Arc<dyn ControlMessageSender>,
    pub notifications: Arc<dyn NotificationSurface>,
    pub statuses: Arc<dyn StatusSink>,
}

pub struct GroupCallManager {
    pub(super) me: Identity,
    pub(super) config: GroupCallConfig,
    pub(super) deps: GroupCallDependencies,
    pub(super) registry: CallRegistry,
    pub(super) observers: ObserverHub,
    pub(super) chosen_calls: Mutex<HashMap<GroupId, GroupCallDescription>>,
    pub(super) refresh_timers: Mutex<HashMap<GroupId, JoinHandle<()>>>,
    pub(super) refresh_locks: Mutex<HashMap<GroupId, Arc<tokio::sync::Mutex<()>>>>,
    current_session: Mutex<Option<Arc<GroupCallController>>>,
    start_queue: StartQueue,
}

impl GroupCallManager {
    pub fn new(me: Identity, config: GroupCallConfig, deps: GroupCallDependencies) -> Arc<Self> {
        Arc::new(Self {
            me,
            config,
            registry: CallRegistry::new(deps.store.clone()),
            deps,
            observers: ObserverHub::default(),
            chosen_calls: Mutex::new(HashMap::new()),
            refresh_timers: Mutex::new(HashMap::new()),
            refresh_locks: Mutex::new(HashMap::new()),
            current_session: Mutex::new(None),
            start_queue: StartQueue::new(START_QUEUE_CAPACITY),
        })
    }

    /// Load persisted running calls, kick off an initial refresh cycle per
    /// group and start the announcement consumer.
    pub async fn start(self: &Arc<Self>) -> Result<(), GroupCallError> {
        let groups = self.registry.load_persisted().await?;
        for group_id in groups {
            self.trigger_refresh(group_id);
        }
        let manager = self.clone();
        tokio::spawn(async move {
            loop {
                let message = manager.start_queue.pop().await;
                manager.process_call_start(message).await;
            }
        });
        Ok(())
    }

    /// Enqueue an inbound start announcement. Always returns `true`; the
    /// announcement is accepted even when an older queued one is dropped to
    /// make room.
    pub fn handle_call_start(&self, message: GroupCallStartMessage) -> bool {
        if self.start_queue.push(message) {
            warn!("Start announcement queue overflow, dropped the oldest pending message");
        }
        true
    }

    pub(super) async fn process_call_start(self: &Arc<Self>, message: GroupCallStartMessage) {
        let group_id = message.group.group_id;
        debug!(
            "Processing call start for group {group_id} from {}",
            message.from
        );
        if message.data.protocol_version != GC_PROTOCOL_VERSION {
            warn!(
                "Ignoring call start with unsupported protocol version {}",
                message.data.protocol_version
            );
            return;
        }
        let token = match self.deps.sfu.obtain_token(false).await {
            Ok(token) => token,
            Err(e) => {
                warn!("Cannot validate call start, sfu token unavailable: {e}");
                return;
            }
        };
        if !token.is_allowed_base_url(&message.data.sfu_base_url) {
            warn!(
                "Ignoring call start with disallowed sfu base url {}",
                message.data.sfu_base_url
            );
            return;
        }
        if self
            .registry
            .has_duplicate_gck(group_id, &message.data.gck)
        {
            debug!("Ignoring call start with already known gck for group {group_id}");
            return;
        }

        let call_id = CallId::derive(&message.group, &message.data);
        let description = GroupCallDescription {
            protocol_version: message.data.protocol_version,
            group_id,
            sfu_base_url: message.data.sfu_base_url.clone(),
            call_id,
            gck: message.data.gck.clone(),
            started_at: message.created_at.timestamp_millis().max(0) as u64,
            max_participants: None,
            encrypted_call_state: None,
        };
        if let Err(e) = self.registry.add_running_call(description).await {
            warn!("Could not track announced call {call_id}: {e}");
            return;
        }
        self.deps.statuses.group_call_status(GroupCallStatus::Started {
            call_id,
            group_id,
            caller: message.from.clone(),
            outbox: message.from == self.me,
            started_at: message.created_at,
        });
        self.notify_group_call_start(message).await;
    }

    async fn notify_group_call_start(self: &Arc<Self>, message: GroupCallStartMessage) {
        let group_id = message.group.group_id;
        let Some(chosen) = self.run_refresh_steps(group_id).await else {
            debug!("No chosen call after start announcement for group {group_id}");
            return;
        };
        if !self.config.group_calls_enabled {
            info!("Group calls are disabled, suppressing call notification");
            return;
        }
        let Some(caller) = self.deps.contacts.contact(&message.from).await else {
            warn!(
                "Unknown caller {}, suppressing call notification",
                message.from
            );
            return;
        };
        if self.is_joined_call(&chosen.call_id) {
            debug!("Already joined the chosen call, suppressing call notification");
            return;
        }
        self.deps
            .notifications
            .add_group_call_notification(group_id, &caller);
    }

    /// Join the chosen call of the group. Returns `None` when the group has
    /// no chosen call, the existing controller when the call is already
    /// joined.
    pub async fn join_call(
        self: &Arc<Self>,
        group_id: GroupId,
    ) -> Result<Option<Arc<GroupCallController>>, GroupCallError> {
        let Some(chosen) = self.chosen_call(group_id) else {
            debug!("No chosen call to join for group {group_id}");
            return Ok(None);
        };
        if let Some(controller) = self.controller_for_call(&chosen.call_id) {
            debug!("Already joined chosen call {}", chosen.call_id);
            return Ok(Some(controller));
        }
        Ok(Some(self.join_and_confirm_call(&chosen).await?))
    }

    /// Join the group's chosen call, or create a new one when there is none.
    pub async fn create_call(
        self: &Arc<Self>,
        group_id: GroupId,
    ) -> Result<Arc<GroupCallController>, GroupCallError> {
        if let Some(controller) = self.join_call(group_id).await? {
            return Ok(controller);
        }
        self.create_new_call(group_id).await
    }

    async fn create_new_call(
        self: &Arc<Self>,
        group_id: GroupId,
    ) -> Result<Arc<GroupCallController>, GroupCallError> {
        let group = self
            .deps
            .groups
            .group(group_id)
            .await
            .ok_or(GroupCallError::UnknownGroup(group_id))?;
        let token = self.deps.sfu.obtain_token(false).await?;
        let data = GroupCallStartData::generate(token.sfu_base_url.clone());
        let call_id = CallId::derive(&group, &data);
        info!("Creating new call {call_id} for group {group_id}");

        let mut description = GroupCallDescription {
            protocol_version: data.protocol_version,
            group_id,
            sfu_base_url: data.sfu_base_url.clone(),
            call_id,
            gck: data.gck.clone(),
            started_at: Utc::now().timestamp_millis() as u64,
            max_participants: None,
            encrypted_call_state: None,
        };
        let controller = self.join_session(&description).await?;
        let connected = controller.connected().await?;

        // Another member may have started a call at the same time. Give a
        // racing announcement a short window to arrive; the chosen-call rule
        // then decides which call everyone converges on.
        if let Some(racing) = self.wait_for_racing_call(group_id, &call_id).await {
            info!(
                "Call {} was started concurrently, joining it instead of {call_id}",
                racing.call_id
            );
            controller.leave();
            let _ = controller.disposed().await;
            return self.join_and_confirm_call(&racing).await;
        }

        if !connected.participants.is_empty() {
            controller.decline();
            return Err(GroupCallError::Protocol(
                "freshly created call already had participants".into(),
            ));
        }

        controller.confirm();
        description.started_at = connected.started_at;

        let recipients = self.call_start_recipients(group_id).await;
        let sent = self
            .deps
            .messenger
            .send_call_start(&group, &recipients, &data, description.started_at_date())
            .await;
        debug!("Sent call start to {sent} of {} recipients", recipients.len());

        self.registry.add_running_call(description.clone()).await?;
        self.deps.statuses.group_call_status(GroupCallStatus::Started {
            call_id,
            group_id,
            caller: self.me.clone(),
            outbox: true,
            started_at: description.started_at_date(),
        });
        self.trigger_refresh(group_id);
        Ok(controller)
    }

    /// Wait for a racing call from another member to become the chosen call.
    /// Returns it, or `None` after the wait period.
    async fn wait_for_racing_call(
        &self,
        group_id: GroupId,
        own_call_id: &CallId,
    ) -> Option<GroupCallDescription> {
        if self.config.skip_create_delay {
            return None;
        }
        let period = self.config.create_wait_period;
        if period.is_zero() {
            return None;
        }
        debug!("Waiting {period:?} for a concurrently started call");

        let (tx, mut rx) = watch::channel(None::<GroupCallDescription>);
        let observer: Arc<dyn GroupCallObserver> = Arc::new(RacingCallObserver {
            own_call_id: *own_call_id,
            tx,
        });
        self.observers
            .add_for_group(group_id, observer.clone(), self.chosen_call(group_id).as_ref());
        let cleanup_observer = observer.clone();
        let _cleanup = scopeguard::guard((), |_| {
            self.observers.remove_for_group(group_id, &cleanup_observer);
        });

        match tokio::time::timeout(period, rx.wait_for(|racing| racing.is_some())).await {
            Ok(Ok(racing)) => racing.clone(),
            _ => None,
        }
    }

    pub(super) async fn join_and_confirm_call(
        self: &Arc<Self>,
        description: &GroupCallDescription,
    ) -> Result<Arc<GroupCallController>, GroupCallError> {
        let controller = self.join_session(description).await?;
        controller.connected().await?;
        controller.confirm();
        self.deps
            .notifications
            .cancel_group_call_notification(description.group_id);
        Ok(controller)
    }

    async fn join_session(
        self: &Arc<Self>,
        description: &GroupCallDescription,
    ) -> Result<Arc<GroupCallController>, GroupCallError> {
        info!(
            "Joining call {} of group {}",
            description.call_id, description.group_id
        );
        let controller = self.deps.sessions.start_session(description).await?;
        *self.current_session.lock().unwrap() = Some(controller.clone());
        self.attach_session_watchers(controller.clone());
        self.observers.notify_general(Some(description));
        Ok(controller)
    }

    fn attach_session_watchers(self: &Arc<Self>, controller: Arc<GroupCallController>) {
        let manager = self.clone();
        let left_controller = controller.clone();
        tokio::spawn(async move {
            let _ = left_controller.left().await;
            manager.observers.notify_general(None);
        });

        let manager = self.clone();
        tokio::spawn(async move {
            let _ = controller.disposed().await;
            let call_id = controller.call_id();
            debug!("Call session disposed, id={call_id}");
            {
                let mut current = manager.current_session.lock().unwrap();
                // A replacement session may already be in place.
                if current
                    .as_ref()
                    .is_some_and(|c| Arc::ptr_eq(c, &controller))
                {
                    *current = None;
                }
            }
            if manager.registry.contains(&call_id) {
                manager.trigger_refresh(controller.description().group_id);
            }
        });
    }

    async fn call_start_recipients(&self, group_id: GroupId) -> Vec<Identity> {
        let mut recipients = Vec::new();
        for member in self.deps.groups.members(group_id).await {
            if member == self.me {
                continue;
            }
            match self.deps.contacts.contact(&member).await {
                Some(contact) if contact.can_group_calls() => recipients.push(member),
                Some(_) => debug!("Skipping {member}, no group call support"),
                None => debug!("Skipping unknown member {member}"),
            }
        }
        recipients
    }

    /// Request to leave the given call. Returns whether a matching joined
    /// session existed.
    pub fn leave_call(&self, description: &GroupCallDescription) -> bool {
        match self.controller_for_call(&description.call_id) {
            Some(controller) => {
                info!("Leaving call {}", description.call_id);
                controller.leave();
                true
            }
            None => false,
        }
    }

    /// Leave whatever call is currently joined, if any.
    pub fn abort_current_call(&self) {
        if let Some(controller) = self.current_controller() {
            warn!("Aborting current call {}", controller.call_id());
            controller.leave();
        }
    }

    /// Re-announce the chosen call of a group to members that joined the
    /// group after the call started. Returns the number of messages sent.
    pub async fn send_call_start_to_new_members(
        &self,
        group_id: GroupId,
        members: &[Identity],
    ) -> Result<usize, GroupCallError> {
        let Some(chosen) = self.chosen_call(group_id) else {
            return Ok(0);
        };
        let group = self
            .deps
            .groups
            .group(group_id)
            .await
            .ok_or(GroupCallError::UnknownGroup(group_id))?;
        let mut recipients = Vec::new();
        for member in members {
            if *member == self.me {
                continue;
            }
            match self.deps.contacts.contact(member).await {
                Some(contact) if contact.can_group_calls() => recipients.push(member.clone()),
                _ => {}
            }
        }
        if recipients.is_empty() {
            return Ok(0);
        }
        let data = GroupCallStartData {
            protocol_version: chosen.protocol_version,
            gck: chosen.gck.clone(),
            sfu_base_url: chosen.sfu_base_url.clone(),
        };
        debug!(
            "Re-announcing call {} to {} new members",
            chosen.call_id,
            recipients.len()
        );
        let sent = self
            .deps
            .messenger
            .send_call_start(&group, &recipients, &data, chosen.started_at_date())
            .await;
        Ok(sent)
    }

    /// React to a group membership change: restrict the joined call to the
    /// current members, or drop all of the group's calls when the local user
    /// is no longer a member.
    pub async fn update_allowed_call_participants(
        self: &Arc<Self>,
        group_id: GroupId,
    ) -> Result<(), GroupCallError> {
        if !self.deps.groups.is_member(group_id).await {
            info!("No longer a member of group {group_id}, dropping its calls");
            self.handle_group_left(group_id).await?;
            return Ok(());
        }
        if let Some(controller) = self.controller_for_joined_call(group_id) {
            let members: HashSet<Identity> = self
                .deps
                .groups
                .members(group_id)
                .await
                .into_iter()
                .collect();
            controller.purge_participants(members);
        }
        Ok(())
    }

    async fn handle_group_left(&self, group_id: GroupId) -> Result<(), GroupCallError> {
        let call_ids: HashSet<CallId> = self
            .registry
            .running_calls(group_id)
            .iter()
            .map(|call| call.call_id)
            .collect();
        if let Some(controller) = self.current_controller() {
            if call_ids.contains(&controller.call_id()) {
                controller.leave();
            }
        }
        self.registry.remove_running_calls(&call_ids).await?;
        if let Some(handle) = self.refresh_timers.lock().unwrap().remove(&group_id) {
            handle.abort();
        }
        let had_chosen = self.chosen_calls.lock().unwrap().remove(&group_id).is_some();
        if had_chosen {
            self.observers.notify_group(group_id, None);
        }
        self.deps
            .notifications
            .cancel_group_call_notification(group_id);
        Ok(())
    }

    // -- lookups --

    pub fn chosen_call(&self, group_id: GroupId) -> Option<GroupCallDescription> {
        self.chosen_calls.lock().unwrap().get(&group_id).cloned()
    }

    pub fn current_controller(&self) -> Option<Arc<GroupCallController>> {
        self.current_session
            .lock()
            .unwrap()
            .as_ref()
            .filter(|controller| !controller.is_disposed())
            .cloned()
    }

    pub fn joined_call_id(&self) -> Option<CallId> {
        self.current_controller().map(|controller| controller.call_id())
    }

    pub fn is_joined_call(&self, call_id: &CallId) -> bool {
        self.joined_call_id().as_ref() == Some(call_id)
    }

    pub fn has_joined_call(&self) -> bool {
        self.current_controller().is_some()
    }

    pub fn has_joined_call_in_group(&self, group_id: GroupId) -> bool {
        self.current_controller()
            .is_some_and(|controller| controller.description().group_id == group_id)
    }

    pub(super) fn controller_for_call(&self, call_id: &CallId) -> Option<Arc<GroupCallController>> {
        self.current_controller()
            .filter(|controller| controller.call_id() == *call_id)
    }

    /// The controller of the joined call, but only while that call is also
    /// the group's chosen call.
    pub fn controller_for_joined_call(
        &self,
        group_id: GroupId,
    ) -> Option<Arc<GroupCallController>> {
        let chosen = self.chosen_call(group_id)?;
        self.controller_for_call(&chosen.call_id)
    }

    // -- observers --

    /// Observe the chosen call of one group. The current value is replayed
    /// on registration.
    pub fn add_group_call_observer(
        &self,
        group_id: GroupId,
        observer: Arc<dyn GroupCallObserver>,
    ) {
        let current = self.chosen_call(group_id);
        self.observers
            .add_for_group(group_id, observer, current.as_ref());
    }

    pub fn remove_group_call_observer(
        &self,
        group_id: GroupId,
        observer: &Arc<dyn GroupCallObserver>,
    ) {
        self.observers.remove_for_group(group_id, observer);
    }

    /// Observe the joined call and all chosen-call changes. The currently
    /// joined call is replayed on registration.
    pub fn add_general_observer(&self, observer: Arc<dyn GroupCallObserver>) {
        let current = self
            .current_controller()
            .map(|controller| controller.description());
        self.observers.add_general(observer, current.as_ref());
    }

    pub fn remove_general_observer(&self, observer: &Arc<dyn GroupCallObserver>) {
        self.observers.remove_general(observer);
    }
}

/// Observer used during call creation to detect a concurrently started call
/// winning the chosen-call race.
struct RacingCallObserver {
    own_call_id: CallId,
    tx: watch::Sender<Option<GroupCallDescription>>,
}

impl GroupCallObserver for RacingCallObserver {
    fn on_group_call_update(&self, call: Option<&GroupCallDescription>) {
        let Some(call) = call else { return };
        if call.call_id == self.own_call_id {
            return;
        }
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(call.clone());
                true
            } else {
                false
            }
        });
    }
}
