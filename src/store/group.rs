//! Group conversations and rosters
//!
//! Group messages are not end-to-end encrypted: the body travels as plain
//! text on the group topic. Statuses stop at `Delivered` since there are
//! no group read receipts.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::conversation::{Applied, Conversation};
use super::refresh::RefreshHandle;
use super::{InFlight, Message, MessageStatus, SendError, StoreEvent, StoreOptions};
use crate::api::{ApiResult, GroupDirectory, HistoryService};
use crate::protocol::{destinations, GroupRecord};
use crate::transport::{Delivery, Transport, TransportError};

/// Group conversations of the local user
pub struct GroupMessageStore {
    own_id: String,
    transport: Arc<Transport>,
    history: Arc<dyn HistoryService>,
    members: Arc<dyn GroupDirectory>,
    options: StoreOptions,
    conversations: RwLock<HashMap<String, Arc<Conversation>>>,
    rosters: RwLock<HashMap<String, Vec<String>>>,
    selected: RwLock<Option<String>>,
    loading: InFlight,
    refresh: Mutex<Option<RefreshHandle>>,
    events: broadcast::Sender<StoreEvent>,
}

impl GroupMessageStore {
    /// Create a store for `own_id`
    pub fn new(
        own_id: &str,
        transport: Arc<Transport>,
        history: Arc<dyn HistoryService>,
        members: Arc<dyn GroupDirectory>,
        options: StoreOptions,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(options.event_capacity.max(1));
        Arc::new(Self {
            own_id: own_id.to_string(),
            transport,
            history,
            members,
            options,
            conversations: RwLock::new(HashMap::new()),
            rosters: RwLock::new(HashMap::new()),
            selected: RwLock::new(None),
            loading: InFlight::default(),
            refresh: Mutex::new(None),
            events,
        })
    }

    /// Receive store change notifications
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }

    /// Snapshot of a group's messages
    pub fn messages_for_group(&self, group: &str) -> Vec<Message> {
        self.conversations
            .read()
            .get(group)
            .map(|c| c.messages().to_vec())
            .unwrap_or_default()
    }

    /// Last fetched member list of `group`
    pub fn roster(&self, group: &str) -> Vec<String> {
        self.rosters.read().get(group).cloned().unwrap_or_default()
    }

    /// True while a history fetch for `group` is in flight
    pub fn is_loading_history(&self, group: &str) -> bool {
        self.loading.contains(group)
    }

    /// Currently selected group
    pub fn selected_group(&self) -> Option<String> {
        self.selected.read().clone()
    }

    fn emit(&self, event: StoreEvent) {
        let _ = self.events.send(event);
    }

    fn mutate<R>(&self, group: &str, f: impl FnOnce(&mut Conversation) -> R) -> R {
        let mut conversations = self.conversations.write();
        let conversation = conversations.entry(group.to_string()).or_default();
        f(Arc::make_mut(conversation))
    }

    /// Post `text` to `group`; returns the local id
    pub async fn send(&self, group: &str, text: &str) -> Result<String, SendError> {
        if text.trim().is_empty() {
            return Err(SendError::Empty);
        }
        let message = Message::temporary(Uuid::new_v4().to_string(), &self.own_id, group, text, Utc::now());
        let local_id = message.id.clone();
        self.mutate(group, |c| c.push_temporary(message));
        self.emit(StoreEvent::MessageAdded {
            conversation: group.to_string(),
            message_id: local_id.clone(),
        });

        self.publish_temporary(group, &local_id).await?;
        Ok(local_id)
    }

    /// Retry a failed temporary message
    pub async fn resend(&self, group: &str, local_id: &str) -> Result<(), SendError> {
        let retried = self.mutate(group, |c| match c.get(local_id) {
            None => Err(SendError::UnknownMessage(local_id.to_string())),
            Some(_) => c
                .clear_failed(local_id)
                .map(|_| ())
                .ok_or_else(|| SendError::NotFailed(local_id.to_string())),
        });
        retried?;
        self.publish_temporary(group, local_id).await
    }

    async fn publish_temporary(&self, group: &str, local_id: &str) -> Result<(), SendError> {
        let message = self
            .conversations
            .read()
            .get(group)
            .and_then(|c| c.get(local_id).cloned())
            .ok_or_else(|| SendError::UnknownMessage(local_id.to_string()))?;

        let record = GroupRecord {
            id: None,
            client_id: message.client_id.clone(),
            group_id: group.to_string(),
            sender_id: self.own_id.clone(),
            content: message.plaintext.clone(),
            created_at: message.created_at,
        };
        let published = match record.to_json() {
            Ok(body) => self.transport.publish(destinations::GROUP_SEND, &body).await,
            Err(e) => Err(TransportError::InvalidData(e.to_string())),
        };

        if let Err(source) = published {
            warn!(group, local_id, error = %source, "group publish failed");
            if self.mutate(group, |c| c.mark_failed(local_id)) {
                self.emit(StoreEvent::SendFailed {
                    conversation: group.to_string(),
                    message_id: local_id.to_string(),
                });
            }
            return Err(SendError::Transport {
                local_id: local_id.to_string(),
                source,
            });
        }
        Ok(())
    }

    fn to_message(record: &GroupRecord, id: &str) -> Message {
        Message::confirmed(
            id.to_string(),
            record.client_id.clone(),
            &record.sender_id,
            &record.group_id,
            record.content.clone(),
            record.created_at,
            MessageStatus::Delivered,
            false,
        )
    }

    /// Merge a record pushed on a group topic
    pub fn on_inbound(&self, record: GroupRecord) {
        let id = match record.require_id() {
            Ok(id) => id.to_string(),
            Err(e) => {
                warn!(error = %e, "dropping group record");
                return;
            }
        };
        let group = record.group_id.clone();
        let applied = self.mutate(&group, |c| c.apply_confirmed(Self::to_message(&record, &id)));

        match applied {
            Applied::Inserted => self.emit(StoreEvent::MessageAdded {
                conversation: group,
                message_id: id,
            }),
            Applied::Reconciled { temp_id } => self.emit(StoreEvent::MessageConfirmed {
                conversation: group,
                temp_id,
                message_id: id,
            }),
            Applied::Promoted(_) | Applied::Unchanged => {}
        }
    }

    /// Transport callback for group topic deliveries
    pub fn handle_delivery(&self, delivery: &Delivery) {
        let Some(group) = destinations::group_of_topic(&delivery.destination) else {
            return;
        };
        match GroupRecord::parse(&delivery.body) {
            Ok(record) if record.group_id == group => self.on_inbound(record),
            Ok(record) => warn!(topic = group, group = %record.group_id, "group record on wrong topic"),
            Err(e) => warn!(error = %e, "dropping malformed group record"),
        }
    }

    /// Fetch and merge a group's stored messages
    pub async fn load_history(&self, group: &str) -> ApiResult<usize> {
        let selected_before = self.selected_group();
        if self.loading.start(group) {
            self.emit(StoreEvent::LoadingChanged {
                conversation: group.to_string(),
                loading: true,
            });
        }

        let fetched = self.history.group_history(group).await;

        if self.loading.finish(group) {
            self.emit(StoreEvent::LoadingChanged {
                conversation: group.to_string(),
                loading: false,
            });
        }
        let records = fetched?;

        let selected_now = self.selected_group();
        if selected_now != selected_before && selected_now.as_deref() != Some(group) {
            debug!(group, "discarding history for deselected group");
            return Ok(0);
        }

        let mut messages: Vec<Message> = records
            .iter()
            .filter(|r| r.group_id == group)
            .filter_map(|r| match r.require_id() {
                Ok(id) => Some(Self::to_message(r, id)),
                Err(e) => {
                    warn!(group, sender = %r.sender_id, error = %e, "dropping history record");
                    None
                }
            })
            .collect();
        messages.sort_by_key(|m| m.created_at);

        let changed = self.mutate(group, |c| c.merge_history(messages));
        self.emit(StoreEvent::HistoryMerged {
            conversation: group.to_string(),
            changed,
        });
        Ok(changed)
    }

    /// Re-fetch the member list of `group`
    pub async fn refresh_roster(&self, group: &str) -> ApiResult<Vec<String>> {
        let fetched = self.members.group_members(group).await?;

        let mut seen = HashSet::new();
        let roster: Vec<String> = fetched
            .into_iter()
            .filter(|member| !member.is_empty() && seen.insert(member.clone()))
            .collect();

        self.rosters.write().insert(group.to_string(), roster.clone());
        self.emit(StoreEvent::RosterUpdated {
            group: group.to_string(),
            members: roster.len(),
        });
        Ok(roster)
    }

    /// Open `group`: subscribe its topic, load roster and history, and keep
    /// the roster fresh until [`deselect`](Self::deselect)
    pub async fn select_group(self: &Arc<Self>, group: &str) -> ApiResult<()> {
        if let Some(previous) = self.selected_group() {
            if previous != group {
                self.deselect().await;
            }
        }

        *self.selected.write() = Some(group.to_string());
        self.emit(StoreEvent::SelectionChanged {
            conversation: Some(group.to_string()),
        });
        if let Err(e) = self.transport.subscribe(&destinations::group_topic(group)).await {
            warn!(group, error = %e, "group topic subscription deferred");
        }

        let weak = Arc::downgrade(self);
        let target = group.to_string();
        let handle = RefreshHandle::spawn(self.options.roster_refresh, move || {
            roster_tick(weak.clone(), target.clone())
        });
        *self.refresh.lock() = Some(handle);

        let roster = self.refresh_roster(group).await;
        let history = self.load_history(group).await;
        info!(group, "group selected");
        roster.and(history).map(|_| ())
    }

    /// Close the selected group and unsubscribe its topic
    pub async fn deselect(&self) {
        if let Some(handle) = self.refresh.lock().take() {
            handle.cancel();
        }
        let previous = self.selected.write().take();
        if let Some(group) = previous {
            if let Err(e) = self.transport.unsubscribe(&destinations::group_topic(&group)).await {
                warn!(group = %group, error = %e, "unsubscribe failed");
            }
            self.emit(StoreEvent::SelectionChanged { conversation: None });
        }
    }

    /// Deselect and drop every conversation and roster held in memory
    pub async fn clear(&self) {
        self.deselect().await;
        self.conversations.write().clear();
        self.rosters.write().clear();
        self.emit(StoreEvent::Cleared);
    }
}

async fn roster_tick(store: Weak<GroupMessageStore>, group: String) -> bool {
    let Some(store) = store.upgrade() else {
        return false;
    };
    if store.selected_group().as_deref() != Some(group.as_str()) {
        return false;
    }
    if let Err(e) = store.refresh_roster(&group).await {
        debug!(group = %group, error = %e, "roster refresh failed");
    }
    true
}
