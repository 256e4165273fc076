//! Presence member map for one channel.
//!
//! Holds the latest presence message per member, decides whether an incoming
//! message supersedes the stored one, and reconciles the set at the end of a
//! SYNC: members present when the SYNC began that the server never mentioned
//! again are removed and reported as synthetic LEAVEs.

use std::collections::{HashMap, HashSet};

use tokio::sync::watch;

use crate::protocol::{PresenceAction, PresenceMessage};

pub struct PresenceMap {
    members: HashMap<String, PresenceMessage>,
    /// Members entered by this client's own connection.
    internal_members: HashMap<String, PresenceMessage>,
    sync_in_progress: bool,
    sync_session_id: Option<String>,
    /// Keys present when the current SYNC began and not seen in it since.
    residual: HashSet<String>,
    connection_id: watch::Receiver<Option<String>>,
}

impl PresenceMap {
    pub fn new(connection_id: watch::Receiver<Option<String>>) -> Self {
        Self {
            members: HashMap::new(),
            internal_members: HashMap::new(),
            sync_in_progress: false,
            sync_session_id: None,
            residual: HashSet::new(),
            connection_id,
        }
    }

    pub fn members(&self) -> &HashMap<String, PresenceMessage> {
        &self.members
    }

    pub fn internal_members(&self) -> &HashMap<String, PresenceMessage> {
        &self.internal_members
    }

    pub fn get(&self, member_key: &str) -> Option<&PresenceMessage> {
        self.members.get(member_key)
    }

    pub fn sync_in_progress(&self) -> bool {
        self.sync_in_progress
    }

    pub fn sync_session_id(&self) -> Option<&str> {
        self.sync_session_id.as_deref()
    }

    pub fn len(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Apply `msg` to the map. Returns `true` when the message was newer than
    /// the stored entry and an event should be emitted for it.
    pub fn process_member(&mut self, msg: &PresenceMessage) -> bool {
        let key = msg.member_key();
        let announces_presence = matches!(
            msg.action,
            PresenceAction::Enter | PresenceAction::Present | PresenceAction::Update
        );
        if announces_presence {
            self.residual.remove(&key);
        }

        if let Some(existing) = self.members.get(&key)
            && !is_newer(msg, existing)
        {
            tracing::trace!(member = %key, action = %msg.action, "Stale presence message ignored");
            return false;
        }

        match msg.action {
            PresenceAction::Enter | PresenceAction::Present | PresenceAction::Update => {
                let mut stored = msg.clone();
                stored.action = PresenceAction::Present;
                if self.is_own_connection(msg) {
                    self.internal_members.insert(key.clone(), stored.clone());
                }
                self.members.insert(key, stored);
                true
            }
            PresenceAction::Leave => {
                if self.is_own_connection(msg) && !msg.is_synthesized() {
                    self.internal_members.remove(&key);
                }
                if self.sync_in_progress {
                    let mut tombstone = msg.clone();
                    tombstone.action = PresenceAction::Absent;
                    self.members.insert(key, tombstone);
                    true
                } else {
                    match self.members.remove(&key) {
                        Some(removed) => removed.action != PresenceAction::Absent,
                        None => true,
                    }
                }
            }
            PresenceAction::Absent => {
                tracing::debug!(member = %key, "Ignoring inbound presence message with action absent");
                false
            }
        }
    }

    /// Start or continue a SYNC. Pages of the same session keep the baseline;
    /// a different session id begins a new episode.
    pub fn begin_sync(&mut self, session_id: Option<String>) {
        if !self.sync_in_progress {
            self.start_episode(session_id);
            return;
        }
        let Some(new) = session_id else { return };
        if self.sync_session_id.is_none() {
            self.sync_session_id = Some(new);
        } else if self.sync_session_id.as_deref() != Some(new.as_str()) {
            tracing::debug!(session = %new, "New SYNC session replaces the one in progress");
            self.start_episode(Some(new));
        }
    }

    /// Begin a fresh SYNC episode regardless of any in progress.
    pub fn restart_sync(&mut self) {
        self.start_episode(None);
    }

    fn start_episode(&mut self, session_id: Option<String>) {
        self.members.retain(|_, m| m.action != PresenceAction::Absent);
        self.residual = self.members.keys().cloned().collect();
        self.sync_in_progress = true;
        self.sync_session_id = session_id;
    }

    /// Finish the SYNC. Returns a synthetic LEAVE for every member that was
    /// present when the SYNC began and was not mentioned by it.
    pub fn end_sync(&mut self) -> Vec<PresenceMessage> {
        if !self.sync_in_progress {
            return Vec::new();
        }
        self.sync_in_progress = false;
        self.sync_session_id = None;
        self.members.retain(|_, m| m.action != PresenceAction::Absent);

        let now = chrono::Utc::now().timestamp_millis();
        let mut residual: Vec<String> = std::mem::take(&mut self.residual).into_iter().collect();
        residual.sort();

        let leaves: Vec<PresenceMessage> = residual
            .into_iter()
            .filter_map(|key| self.members.remove(&key))
            .map(|member| synthetic_leave(&member, now))
            .collect();
        tracing::debug!(
            removed = leaves.len(),
            remaining = self.members.len(),
            "Presence SYNC complete"
        );
        leaves
    }

    /// Drop every member and any SYNC in progress. Emits nothing.
    pub fn clear(&mut self) {
        self.members.clear();
        self.internal_members.clear();
        self.residual.clear();
        self.sync_in_progress = false;
        self.sync_session_id = None;
    }

    fn is_own_connection(&self, msg: &PresenceMessage) -> bool {
        let own = self.connection_id.borrow();
        own.is_some() && *own == msg.connection_id
    }
}

/// A LEAVE generated locally for `member`, stamped with `now_ms`.
pub(crate) fn synthetic_leave(member: &PresenceMessage, now_ms: i64) -> PresenceMessage {
    PresenceMessage {
        action: PresenceAction::Leave,
        id: None,
        timestamp: Some(now_ms),
        ..member.clone()
    }
}

/// The action an accepted message is stored under. A LEAVE is only ever
/// stored as a tombstone.
fn stored_action(action: PresenceAction) -> PresenceAction {
    match action {
        PresenceAction::Enter | PresenceAction::Update => PresenceAction::Present,
        PresenceAction::Leave => PresenceAction::Absent,
        other => other,
    }
}

/// Whether `incoming` supersedes `existing` for the same member.
fn is_newer(incoming: &PresenceMessage, existing: &PresenceMessage) -> bool {
    // A redelivery of the message already stored.
    if incoming.id == existing.id
        && incoming.timestamp == existing.timestamp
        && stored_action(incoming.action) == existing.action
    {
        return false;
    }
    if existing.action == PresenceAction::Absent {
        return true;
    }

    let ids = incoming.parse_id().zip(existing.parse_id());
    match ids {
        Some((a, b)) if !incoming.is_synthesized() && !existing.is_synthesized() => {
            (a.msg_serial, a.index) > (b.msg_serial, b.index)
        }
        _ => match (incoming.timestamp, existing.timestamp) {
            (None, _) => false,
            (Some(_), None) => true,
            (Some(a), Some(b)) => a >= b,
        },
    }
}
