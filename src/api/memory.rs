//! In-process directory backing all three REST traits

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{ApiError, ApiResult, GroupDirectory, HistoryService, KeyDirectory};
use crate::crypto::PublicKey;
use crate::protocol::{ChatRecord, GroupRecord};

/// Key directory, history store and rosters kept in memory
#[derive(Default)]
pub struct MemoryDirectory {
    keys: RwLock<HashMap<String, PublicKey>>,
    direct: RwLock<Vec<ChatRecord>>,
    groups: RwLock<BTreeMap<String, Vec<GroupRecord>>>,
    members: RwLock<HashMap<String, Vec<String>>>,
    unavailable: AtomicBool,
    key_fetches: AtomicUsize,
}

impl MemoryDirectory {
    /// Empty directory
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every call fail with [`ApiError::Unavailable`]
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Add a direct message to the history
    pub fn record_direct(&self, record: ChatRecord) {
        self.direct.write().push(record);
    }

    /// Add a group message to the history
    pub fn record_group(&self, record: GroupRecord) {
        self.groups
            .write()
            .entry(record.group_id.clone())
            .or_default()
            .push(record);
    }

    /// Replace a group's member list
    pub fn set_members(&self, group: &str, members: Vec<String>) {
        self.members.write().insert(group.to_string(), members);
    }

    /// Number of `fetch_public_key` calls served so far
    pub fn key_fetches(&self) -> usize {
        self.key_fetches.load(Ordering::SeqCst)
    }

    fn check(&self) -> ApiResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            Err(ApiError::Unavailable)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl KeyDirectory for MemoryDirectory {
    async fn fetch_public_key(&self, user: &str) -> ApiResult<Option<PublicKey>> {
        self.check()?;
        self.key_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.keys.read().get(user).cloned())
    }

    async fn publish_public_key(&self, user: &str, key: &PublicKey) -> ApiResult<()> {
        self.check()?;
        self.keys.write().insert(user.to_string(), key.clone());
        Ok(())
    }
}

#[async_trait]
impl HistoryService for MemoryDirectory {
    async fn direct_history(&self, own: &str, peer: &str) -> ApiResult<Vec<ChatRecord>> {
        self.check()?;
        let mut records: Vec<ChatRecord> = self
            .direct
            .read()
            .iter()
            .filter(|r| {
                (r.sender_id == own && r.receiver_id == peer) || (r.sender_id == peer && r.receiver_id == own)
            })
            .cloned()
            .collect();
        records.sort_by_key(|r| r.created_at);
        Ok(records)
    }

    async fn group_history(&self, group: &str) -> ApiResult<Vec<GroupRecord>> {
        self.check()?;
        Ok(self.groups.read().get(group).cloned().unwrap_or_default())
    }
}

#[async_trait]
impl GroupDirectory for MemoryDirectory {
    async fn group_members(&self, group: &str) -> ApiResult<Vec<String>> {
        self.check()?;
        Ok(self.members.read().get(group).cloned().unwrap_or_default())
    }
}
