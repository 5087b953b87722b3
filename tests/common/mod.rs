//! Shared mocks and harness for the coordination engine tests.

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use groupcall_rust::config::GroupCallConfig;
use groupcall_rust::coordinator::{GroupCallDependencies, GroupCallManager, GroupCallObserver};
use groupcall_rust::protocol::{GC_PROTOCOL_VERSION, GroupCallStartData, GroupCallStartMessage};
use groupcall_rust::services::{
    ContactDirectory, ControlMessageSender, GroupCallStatus, GroupDirectory, NotificationSurface,
    StatusSink,
};
use groupcall_rust::session::{
    CallDecision, CallSessionFactory, ConnectedInfo, GroupCallController, SessionError,
};
use groupcall_rust::sfu::{
    HTTP_STATUS_OK, ParticipantId, PeekResponse, PeekResponseBody, SfuConnection, SfuError,
    SfuToken,
};
use groupcall_rust::store::MemoryCallStore;
use groupcall_rust::types::{
    CallId, Contact, FEATURE_GROUP_CALLS, GCK_LENGTH, Gck, GroupCallDescription, GroupDescriptor,
    GroupId, Identity,
};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub const SFU_BASE_URL: &str = "https://sfu.test.example";

#[derive(Debug, Clone)]
pub enum PeekOutcome {
    Ok(PeekResponseBody),
    Status(u16),
    Error,
}

/// Scriptable SFU: per-call queues of peek outcomes, last one sticky, with a
/// configurable default for unscripted calls.
pub struct MockSfu {
    scripts: Mutex<HashMap<CallId, VecDeque<PeekOutcome>>>,
    default_outcome: Mutex<PeekOutcome>,
    peek_counts: Mutex<HashMap<CallId, u32>>,
    pub forced_token_refreshes: AtomicU32,
}

impl MockSfu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            scripts: Mutex::new(HashMap::new()),
            default_outcome: Mutex::new(PeekOutcome::Status(HTTP_STATUS_OK)),
            peek_counts: Mutex::new(HashMap::new()),
            forced_token_refreshes: AtomicU32::new(0),
        })
    }

    /// Make every peek of this call return the given outcome.
    pub fn set_peek(&self, call_id: CallId, outcome: PeekOutcome) {
        self.scripts
            .lock()
            .unwrap()
            .insert(call_id, VecDeque::from([outcome]));
    }

    /// Queue an outcome; queued outcomes are consumed in order, the last one
    /// repeats.
    pub fn push_peek(&self, call_id: CallId, outcome: PeekOutcome) {
        self.scripts
            .lock()
            .unwrap()
            .entry(call_id)
            .or_default()
            .push_back(outcome);
    }

    pub fn set_default(&self, outcome: PeekOutcome) {
        *self.default_outcome.lock().unwrap() = outcome;
    }

    pub fn peek_count(&self, call_id: &CallId) -> u32 {
        self.peek_counts
            .lock()
            .unwrap()
            .get(call_id)
            .copied()
            .unwrap_or(0)
    }

    fn next_outcome(&self, call_id: &CallId) -> PeekOutcome {
        let mut scripts = self.scripts.lock().unwrap();
        match scripts.get_mut(call_id) {
            Some(queue) if queue.len() > 1 => queue.pop_front().unwrap(),
            Some(queue) => queue.front().cloned().unwrap(),
            None => self.default_outcome.lock().unwrap().clone(),
        }
    }
}

#[async_trait]
impl SfuConnection for MockSfu {
    async fn obtain_token(&self, force_refresh: bool) -> Result<SfuToken, SfuError> {
        if force_refresh {
            self.forced_token_refreshes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(SfuToken {
            sfu_base_url: SFU_BASE_URL.to_string(),
            allowed_base_urls: vec![SFU_BASE_URL.to_string()],
            expires_at: Utc::now() + TimeDelta::minutes(5),
        })
    }

    async fn peek(
        &self,
        _token: &SfuToken,
        _sfu_base_url: &str,
        call_id: &CallId,
    ) -> Result<PeekResponse, SfuError> {
        *self.peek_counts.lock().unwrap().entry(*call_id).or_insert(0) += 1;
        match self.next_outcome(call_id) {
            PeekOutcome::Ok(body) => Ok(PeekResponse {
                status_code: HTTP_STATUS_OK,
                body: Some(body),
            }),
            PeekOutcome::Status(status_code) => Ok(PeekResponse {
                status_code,
                body: None,
            }),
            PeekOutcome::Error => Err(SfuError::Network("scripted failure".into())),
        }
    }
}

/// Session factory whose sessions connect immediately and tear down on a
/// leave request or a declined call.
pub struct MockSessions {
    pub connect_participants: Mutex<Vec<ParticipantId>>,
    pub controllers: Mutex<Vec<Arc<GroupCallController>>>,
}

impl MockSessions {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            connect_participants: Mutex::new(Vec::new()),
            controllers: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl CallSessionFactory for MockSessions {
    async fn start_session(
        &self,
        description: &GroupCallDescription,
    ) -> Result<Arc<GroupCallController>, SessionError> {
        let controller = GroupCallController::new(description.clone());
        controller.mark_connected(ConnectedInfo {
            started_at: description.started_at,
            participants: self.connect_participants.lock().unwrap().clone(),
        });
        let backend = controller.clone();
        tokio::spawn(async move {
            tokio::select! {
                decision = backend.decision() => {
                    if decision != Ok(CallDecision::Confirmed) {
                        backend.mark_disposed();
                        return;
                    }
                    let _ = backend.leave_requested().await;
                    backend.mark_left();
                    backend.mark_disposed();
                }
                _ = backend.leave_requested() => {
                    backend.mark_left();
                    backend.mark_disposed();
                }
            }
        });
        self.controllers.lock().unwrap().push(controller.clone());
        Ok(controller)
    }
}

/// Group and contact directory backed by plain maps.
#[derive(Default)]
pub struct MockDirectory {
    groups: Mutex<HashMap<GroupId, GroupDescriptor>>,
    members: Mutex<HashMap<GroupId, Vec<Identity>>>,
    memberships: Mutex<HashSet<GroupId>>,
    contacts: Mutex<HashMap<Identity, Contact>>,
}

impl MockDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a group with the given members; members get contacts with
    /// group call support advertised.
    pub fn add_group(&self, group_id: GroupId, creator: &str, members: &[&str]) -> GroupDescriptor {
        let descriptor = GroupDescriptor {
            group_id,
            creator: creator.into(),
            api_group_id: (group_id.0 as u64).to_le_bytes(),
        };
        self.groups.lock().unwrap().insert(group_id, descriptor.clone());
        self.members.lock().unwrap().insert(
            group_id,
            members.iter().map(|m| Identity::from(*m)).collect(),
        );
        self.memberships.lock().unwrap().insert(group_id);
        let mut contacts = self.contacts.lock().unwrap();
        for member in members {
            contacts.insert(
                Identity::from(*member),
                Contact {
                    identity: Identity::from(*member),
                    nickname: None,
                    feature_mask: FEATURE_GROUP_CALLS,
                },
            );
        }
        descriptor
    }

    pub fn set_contact(&self, contact: Contact) {
        self.contacts
            .lock()
            .unwrap()
            .insert(contact.identity.clone(), contact);
    }

    pub fn set_member(&self, group_id: GroupId, is_member: bool) {
        let mut memberships = self.memberships.lock().unwrap();
        if is_member {
            memberships.insert(group_id);
        } else {
            memberships.remove(&group_id);
        }
    }
}

#[async_trait]
impl GroupDirectory for MockDirectory {
    async fn group(&self, group_id: GroupId) -> Option<GroupDescriptor> {
        self.groups.lock().unwrap().get(&group_id).cloned()
    }

    async fn members(&self, group_id: GroupId) -> Vec<Identity> {
        self.members
            .lock()
            .unwrap()
            .get(&group_id)
            .cloned()
            .unwrap_or_default()
    }

    async fn is_member(&self, group_id: GroupId) -> bool {
        self.memberships.lock().unwrap().contains(&group_id)
    }
}

#[async_trait]
impl ContactDirectory for MockDirectory {
    async fn contact(&self, identity: &Identity) -> Option<Contact> {
        self.contacts.lock().unwrap().get(identity).cloned()
    }
}

#[derive(Default)]
pub struct MockMessenger {
    pub sent: Mutex<Vec<(GroupId, Vec<Identity>, GroupCallStartData)>>,
}

impl MockMessenger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

#[async_trait]
impl ControlMessageSender for MockMessenger {
    async fn send_call_start(
        &self,
        group: &GroupDescriptor,
        recipients: &[Identity],
        data: &GroupCallStartData,
        _started_at: DateTime<Utc>,
    ) -> usize {
        self.sent
            .lock()
            .unwrap()
            .push((group.group_id, recipients.to_vec(), data.clone()));
        recipients.len()
    }
}

#[derive(Default)]
pub struct RecordingNotifications {
    pub added: Mutex<Vec<(GroupId, Identity)>>,
    pub cancelled: Mutex<Vec<GroupId>>,
}

impl RecordingNotifications {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl NotificationSurface for RecordingNotifications {
    fn add_group_call_notification(&self, group_id: GroupId, caller: &Contact) {
        self.added
            .lock()
            .unwrap()
            .push((group_id, caller.identity.clone()));
    }

    fn cancel_group_call_notification(&self, group_id: GroupId) {
        self.cancelled.lock().unwrap().push(group_id);
    }
}

#[derive(Default)]
pub struct RecordingStatusSink {
    pub statuses: Mutex<Vec<GroupCallStatus>>,
}

impl RecordingStatusSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn started(&self) -> Vec<CallId> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter_map(|status| match status {
                GroupCallStatus::Started { call_id, .. } => Some(*call_id),
                _ => None,
            })
            .collect()
    }

    pub fn ended(&self) -> Vec<CallId> {
        self.statuses
            .lock()
            .unwrap()
            .iter()
            .filter_map(|status| match status {
                GroupCallStatus::Ended { call_id } => Some(*call_id),
                _ => None,
            })
            .collect()
    }
}

impl StatusSink for RecordingStatusSink {
    fn group_call_status(&self, status: GroupCallStatus) {
        self.statuses.lock().unwrap().push(status);
    }
}

#[derive(Default)]
pub struct RecordingObserver {
    pub updates: Mutex<Vec<Option<CallId>>>,
}

impl RecordingObserver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}

impl GroupCallObserver for RecordingObserver {
    fn on_group_call_update(&self, call: Option<&GroupCallDescription>) {
        self.updates.lock().unwrap().push(call.map(|c| c.call_id));
    }
}

pub struct Harness {
    pub manager: Arc<GroupCallManager>,
    pub sfu: Arc<MockSfu>,
    pub sessions: Arc<MockSessions>,
    pub directory: Arc<MockDirectory>,
    pub messenger: Arc<MockMessenger>,
    pub notifications: Arc<RecordingNotifications>,
    pub statuses: Arc<RecordingStatusSink>,
    pub store: Arc<MemoryCallStore>,
}

pub fn test_config() -> GroupCallConfig {
    GroupCallConfig {
        group_calls_enabled: true,
        skip_create_delay: true,
        create_wait_period: Duration::from_millis(200),
        refresh_interval: Duration::from_secs(60),
        peek_concurrency: 4,
    }
}

pub fn harness(me: &str) -> Harness {
    harness_with(me, test_config(), Arc::new(MemoryCallStore::new()))
}

pub fn harness_with(me: &str, config: GroupCallConfig, store: Arc<MemoryCallStore>) -> Harness {
    let sfu = MockSfu::new();
    let sessions = MockSessions::new();
    let directory = MockDirectory::new();
    let messenger = MockMessenger::new();
    let notifications = RecordingNotifications::new();
    let statuses = RecordingStatusSink::new();
    let manager = GroupCallManager::new(
        me.into(),
        config,
        GroupCallDependencies {
            sfu: sfu.clone(),
            store: store.clone(),
            sessions: sessions.clone(),
            groups: directory.clone(),
            contacts: directory.clone(),
            messenger: messenger.clone(),
            notifications: notifications.clone(),
            statuses: statuses.clone(),
        },
    );
    Harness {
        manager,
        sfu,
        sessions,
        directory,
        messenger,
        notifications,
        statuses,
        store,
    }
}

pub fn start_data(gck_seed: u8) -> GroupCallStartData {
    GroupCallStartData {
        protocol_version: GC_PROTOCOL_VERSION,
        gck: Gck([gck_seed; GCK_LENGTH]),
        sfu_base_url: SFU_BASE_URL.to_string(),
    }
}

pub fn start_message(
    group: &GroupDescriptor,
    from: &str,
    data: GroupCallStartData,
) -> GroupCallStartMessage {
    GroupCallStartMessage {
        from: from.into(),
        group: group.clone(),
        data,
        created_at: Utc::now(),
    }
}

pub fn description_for(
    group: &GroupDescriptor,
    data: &GroupCallStartData,
    started_at: u64,
) -> GroupCallDescription {
    GroupCallDescription {
        protocol_version: data.protocol_version,
        group_id: group.group_id,
        sfu_base_url: data.sfu_base_url.clone(),
        call_id: CallId::derive(group, data),
        gck: data.gck.clone(),
        started_at,
        max_participants: None,
        encrypted_call_state: None,
    }
}

/// Poll a condition until it holds, for at most two seconds.
pub async fn wait_until(description: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met within 2s: {description}");
}
