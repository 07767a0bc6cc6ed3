use std::collections::BTreeMap;
use sync_core::{Event, EventKind, NotificationItem, RelationshipState};
use sync_relationships::{Outcome, RelationshipReconciler};

/// Prefix of notices generated on this client (never stored server-side).
pub const LOCAL_NOTICE_PREFIX: &str = "notif-";

/// User-facing notices, one list per owner.
#[derive(Debug, Default)]
pub struct NotificationFeed {
    self_id: String,
    items: Vec<NotificationItem>,
}

impl NotificationFeed {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            items: Vec::new(),
        }
    }

    /// Decides whether `event` deserves a notice for the local user.
    /// `outcome` is the reconciler's result for friend-lifecycle events.
    pub fn evaluate(
        &self,
        event: &Event,
        outcome: Option<&Outcome>,
        is_new_chat: bool,
        relationships: &RelationshipReconciler,
    ) -> Option<NotificationItem> {
        let from = event.from_user_id.as_deref();
        let from_other = from.map(|f| f != self.self_id).unwrap_or(false);
        let name = || {
            from.map(|f| relationships.display_name(f))
                .unwrap_or_else(|| "Someone".to_string())
        };

        let (kind, text) = match event.kind {
            EventKind::MessagePrivate if from_other => {
                if is_new_chat {
                    ("new_chat", format!("{} started a conversation with you", name()))
                } else {
                    ("new_private_message", format!("New message from {}", name()))
                }
            }
            EventKind::MessageGroup if from_other => {
                let group = event.group_id.as_deref().unwrap_or("a group");
                ("new_group_message", format!("{} posted in {}", name(), group))
            }
            EventKind::GroupInvite if from_other && self.targets_self(event) => {
                let group = event.group_id.as_deref().unwrap_or("a group");
                ("group_invite", format!("{} invited you to {}", name(), group))
            }
            EventKind::FriendRequestSent
            | EventKind::FriendRequestReceived
            | EventKind::FriendRequestAccepted
            | EventKind::FriendRequestRejected
            | EventKind::FriendRequestCanceled
            | EventKind::FriendRemoved => {
                match outcome.filter(|o| o.is_resolved()) {
                    Some(outcome) => {
                        let counterparty = relationships.display_name(&outcome.counterparty);
                        self.friend_notice(event, outcome, &counterparty)?
                    }
                    None => self.server_friend_notice(event)?,
                }
            }
            EventKind::ProfileLiked if from_other && self.targets_self(event) => {
                ("profile_liked", format!("{} liked your profile", name()))
            }
            EventKind::ProfileUnliked if from_other && self.targets_self(event) => {
                ("profile_unliked", format!("{} no longer likes your profile", name()))
            }
            _ => return None,
        };

        let mut data = BTreeMap::new();
        if let Some(from) = from {
            data.insert("fromUserId".to_string(), from.to_string());
        }
        if let Some(group_id) = &event.group_id {
            data.insert("groupId".to_string(), group_id.clone());
        }
        if let Some(outcome) = outcome.filter(|o| o.is_resolved()) {
            data.insert("friendId".to_string(), outcome.counterparty.clone());
        }
        for key in ["chatId", "requestId"] {
            if let Some(value) = event.payload_str(key) {
                data.insert(key.to_string(), value.to_string());
            }
        }

        Some(NotificationItem {
            id: format!("{}{}", LOCAL_NOTICE_PREFIX, event.id),
            user_id: self.self_id.clone(),
            kind: kind.to_string(),
            message: event.text().map(str::to_string).unwrap_or(text),
            timestamp: event.timestamp,
            is_read: false,
            data,
        })
    }

    fn friend_notice(&self, event: &Event, outcome: &Outcome, name: &str) -> Option<(&'static str, String)> {
        if event.is_local() {
            return None;
        }
        let from_self = event.from_user_id.as_deref() == Some(self.self_id.as_str());

        match event.kind {
            EventKind::FriendRequestSent | EventKind::FriendRequestReceived => {
                let local_is_receiver = match event.from_user_id.as_deref() {
                    Some(from) => from != self.self_id,
                    None => event.kind == EventKind::FriendRequestReceived,
                };
                local_is_receiver.then(|| {
                    ("friend_request_received", format!("{} sent you a friend request", name))
                })
            }
            EventKind::FriendRequestAccepted => {
                let was_sender = outcome.previous == RelationshipState::RequestSent
                    || (from_self && outcome.previous == RelationshipState::None);
                (outcome.changed && was_sender).then(|| {
                    ("friend_request_accepted", format!("{} accepted your friend request", name))
                })
            }
            EventKind::FriendRequestRejected => {
                (outcome.changed && outcome.previous == RelationshipState::RequestSent).then(|| {
                    ("friend_request_rejected", format!("{} declined your friend request", name))
                })
            }
            EventKind::FriendRequestCanceled => {
                (outcome.changed && outcome.previous == RelationshipState::RequestReceived).then(|| {
                    ("friend_request_canceled", format!("{} canceled their friend request", name))
                })
            }
            EventKind::FriendRemoved => {
                (outcome.changed && outcome.previous == RelationshipState::Friends && !from_self).then(|| {
                    ("friend_removed", format!("{} removed you from their friends", name))
                })
            }
            _ => None,
        }
    }

    /// Notice for a friend event whose counterparty is unknown. Only the
    /// server's own text can describe it.
    fn server_friend_notice(&self, event: &Event) -> Option<(&'static str, String)> {
        if event.is_local() || event.from_user_id.as_deref() == Some(self.self_id.as_str()) {
            return None;
        }
        let text = event.text()?;
        Some((event.kind.as_str(), text.to_string()))
    }

    fn targets_self(&self, event: &Event) -> bool {
        event
            .to_user_id
            .as_deref()
            .map(|to| to == self.self_id)
            .unwrap_or(true)
    }

    /// Inserts or replaces by id. A notice already read stays read.
    pub fn add(&mut self, mut item: NotificationItem) {
        if let Some(existing) = self.items.iter_mut().find(|n| n.id == item.id) {
            item.is_read |= existing.is_read;
            *existing = item;
        } else {
            tracing::debug!("Notice {} ({}) for {}", item.id, item.kind, item.user_id);
            self.items.push(item);
        }
    }

    pub fn get(&self, id: &str) -> Option<&NotificationItem> {
        self.items.iter().find(|n| n.id == id)
    }

    pub fn mark_read(&mut self, id: &str) -> bool {
        match self.items.iter_mut().find(|n| n.id == id) {
            Some(item) if !item.is_read => {
                item.is_read = true;
                true
            }
            _ => false,
        }
    }

    pub fn mark_all_read(&mut self, user_id: &str) -> usize {
        let mut count = 0;
        for item in self.items.iter_mut().filter(|n| n.user_id == user_id && !n.is_read) {
            item.is_read = true;
            count += 1;
        }
        count
    }

    pub fn remove(&mut self, id: &str) -> Option<NotificationItem> {
        let pos = self.items.iter().position(|n| n.id == id)?;
        Some(self.items.remove(pos))
    }

    pub fn clear(&mut self, user_id: &str) -> usize {
        let before = self.items.len();
        self.items.retain(|n| n.user_id != user_id);
        before - self.items.len()
    }

    /// Replaces the owner's notices with a fetched list.
    pub fn replace_all(&mut self, user_id: &str, items: Vec<NotificationItem>) {
        self.clear(user_id);
        for mut item in items {
            if item.user_id.is_empty() {
                item.user_id = user_id.to_string();
            }
            self.add(item);
        }
    }

    /// Newest first.
    pub fn list(&self, user_id: &str) -> Vec<&NotificationItem> {
        let mut out: Vec<&NotificationItem> = self.items.iter().filter(|n| n.user_id == user_id).collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        out
    }

    pub fn unread_count(&self, user_id: &str) -> usize {
        self.items
            .iter()
            .filter(|n| n.user_id == user_id && !n.is_read)
            .count()
    }
}

/// Whether a notice exists only on this client.
pub fn is_local_only(id: &str) -> bool {
    id.starts_with(LOCAL_NOTICE_PREFIX)
}
