use chrono::{DateTime, Duration, Utc};
use serde_json::{json, Value};
use std::collections::{BTreeSet, HashMap};
use sync_core::{private_chat_id, temp_chat_id, Event, EventKind, Message, MessageTarget, TEMP_PREFIX};

/// What `append` did with a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// Same id already stored; replaced in place.
    Replaced,
    /// A provisional entry was matched and took the confirmed identity.
    Promoted { provisional_id: String },
    /// Provisional re-append of an id already stored.
    Ignored,
}

impl AppendOutcome {
    pub fn is_visible_change(&self) -> bool {
        !matches!(self, AppendOutcome::Ignored)
    }
}

/// Criteria identifying the provisional entry a confirmation belongs to.
#[derive(Debug, Clone)]
pub struct ConfirmMatch<'a> {
    pub from_user_id: &'a str,
    pub chat_id: &'a str,
    pub content: &'a str,
    pub confirmed_id: &'a str,
    pub confirmed_at: DateTime<Utc>,
}

/// Ordered, deduplicated chat messages per conversation.
pub struct MessageStore {
    self_id: String,
    match_window: Duration,
    /// Entries per chat, in arrival order.
    chats: HashMap<String, Vec<Message>>,
    /// Message id -> chat id.
    index: HashMap<String, String>,
    /// Temp chat id -> canonical chat id it was migrated to.
    migrated: HashMap<String, String>,
    groups: BTreeSet<String>,
}

impl MessageStore {
    pub fn new(self_id: impl Into<String>, match_window: Duration) -> Self {
        Self {
            self_id: self_id.into(),
            match_window,
            chats: HashMap::new(),
            index: HashMap::new(),
            migrated: HashMap::new(),
            groups: BTreeSet::new(),
        }
    }

    pub fn append(&mut self, mut message: Message) -> AppendOutcome {
        message.chat_id = self.resolve_chat_id(&message.chat_id);

        if !message.provisional {
            if let MessageTarget::User(to) = &message.target {
                let counterparty = if message.from_user_id == self.self_id {
                    to.clone()
                } else {
                    message.from_user_id.clone()
                };
                self.migrate(&temp_chat_id(&counterparty), &message.chat_id);
            }
        }

        if let Some(chat_id) = self.index.get(&message.id).cloned() {
            if message.provisional {
                return AppendOutcome::Ignored;
            }
            if let Some(existing) = self
                .chats
                .get_mut(&chat_id)
                .and_then(|entries| entries.iter_mut().find(|m| m.id == message.id))
            {
                message.chat_id = chat_id;
                *existing = message;
                return AppendOutcome::Replaced;
            }
        }

        if !message.provisional {
            let criteria = ConfirmMatch {
                from_user_id: &message.from_user_id,
                chat_id: &message.chat_id,
                content: &message.content,
                confirmed_id: &message.id,
                confirmed_at: message.timestamp,
            };
            if let Some(provisional_id) = self.mark_confirmed(&criteria) {
                return AppendOutcome::Promoted { provisional_id };
            }
        }

        tracing::debug!("Stored message {} in chat {}", message.id, message.chat_id);
        self.index.insert(message.id.clone(), message.chat_id.clone());
        self.chats
            .entry(message.chat_id.clone())
            .or_default()
            .push(message);
        AppendOutcome::Inserted
    }

    /// Promotes the earliest provisional entry matching `criteria` in place.
    /// Returns the provisional id that was replaced.
    pub fn mark_confirmed(&mut self, criteria: &ConfirmMatch<'_>) -> Option<String> {
        let window = self.match_window;
        let entries = self.chats.get_mut(criteria.chat_id)?;
        let entry = entries.iter_mut().find(|m| {
            m.provisional
                && m.from_user_id == criteria.from_user_id
                && m.content == criteria.content
                && (m.timestamp - criteria.confirmed_at).abs() <= window
        })?;

        let provisional_id = std::mem::replace(&mut entry.id, criteria.confirmed_id.to_string());
        entry.timestamp = criteria.confirmed_at;
        entry.provisional = false;

        self.index.remove(&provisional_id);
        self.index
            .insert(criteria.confirmed_id.to_string(), criteria.chat_id.to_string());
        tracing::debug!("Promoted {} to {} in chat {}", provisional_id, criteria.confirmed_id, criteria.chat_id);
        Some(provisional_id)
    }

    /// Creates and stores a provisional message from the local user.
    pub fn send_local(&mut self, target: MessageTarget, content: &str) -> Message {
        let chat_id = match &target {
            MessageTarget::Group(group_id) => group_id.clone(),
            MessageTarget::User(to) => {
                let canonical = private_chat_id(&self.self_id, to);
                if self.chats.contains_key(&canonical) {
                    canonical
                } else {
                    self.resolve_chat_id(&temp_chat_id(to))
                }
            }
        };

        let message = Message {
            id: format!("{}{}", TEMP_PREFIX, uuid::Uuid::new_v4()),
            chat_id,
            from_user_id: self.self_id.clone(),
            target,
            content: content.to_string(),
            timestamp: Utc::now(),
            provisional: true,
        };
        self.append(message.clone());
        message
    }

    fn migrate(&mut self, temp_id: &str, canonical: &str) {
        if temp_id == canonical {
            return;
        }
        let Some(entries) = self.chats.remove(temp_id) else {
            return;
        };

        let moved = entries.len();
        let target = self.chats.entry(canonical.to_string()).or_default();
        for mut entry in entries {
            entry.chat_id = canonical.to_string();
            self.index.insert(entry.id.clone(), canonical.to_string());
            target.push(entry);
        }
        self.migrated.insert(temp_id.to_string(), canonical.to_string());
        tracing::info!("Migrated {} message(s) from {} to {}", moved, temp_id, canonical);
    }

    /// Canonical id for a chat id that may have been a temp id.
    pub fn resolve_chat_id(&self, chat_id: &str) -> String {
        self.migrated
            .get(chat_id)
            .cloned()
            .unwrap_or_else(|| chat_id.to_string())
    }

    /// Display order: by timestamp, stable by arrival.
    pub fn get(&self, chat_id: &str) -> Vec<&Message> {
        let mut out: Vec<&Message> = self.arrival_order(chat_id).iter().collect();
        out.sort_by_key(|m| m.timestamp);
        out
    }

    pub fn arrival_order(&self, chat_id: &str) -> &[Message] {
        self.chats
            .get(&self.resolve_chat_id(chat_id))
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    pub fn has_chat(&self, chat_id: &str) -> bool {
        self.chats
            .get(&self.resolve_chat_id(chat_id))
            .map(|entries| !entries.is_empty())
            .unwrap_or(false)
    }

    pub fn find(&self, message_id: &str) -> Option<&Message> {
        let chat_id = self.index.get(message_id)?;
        self.chats.get(chat_id)?.iter().find(|m| m.id == message_id)
    }

    pub fn remove(&mut self, message_id: &str) -> Option<Message> {
        let chat_id = self.index.remove(message_id)?;
        let entries = self.chats.get_mut(&chat_id)?;
        let pos = entries.iter().position(|m| m.id == message_id)?;
        let removed = entries.remove(pos);
        if entries.is_empty() {
            self.chats.remove(&chat_id);
        }
        Some(removed)
    }

    /// Merges fetched history; returns how many entries were added or updated.
    pub fn merge_history(&mut self, history: Vec<Message>) -> usize {
        history
            .into_iter()
            .map(|message| self.append(message))
            .filter(AppendOutcome::is_visible_change)
            .count()
    }

    pub fn chat_ids(&self) -> Vec<&str> {
        let mut ids: Vec<&str> = self.chats.keys().map(String::as_str).collect();
        ids.sort_unstable();
        ids
    }

    pub fn add_group(&mut self, group_id: &str) -> bool {
        if group_id.is_empty() {
            return false;
        }
        self.groups.insert(group_id.to_string())
    }

    pub fn groups(&self) -> Vec<&str> {
        self.groups.iter().map(String::as_str).collect()
    }

    /// Builds the stored form of an inbound message event.
    pub fn message_from_event(&self, event: &Event) -> Option<Message> {
        let from = event.from_user_id.clone().unwrap_or_else(|| self.self_id.clone());
        let (chat_id, target) = match event.kind {
            EventKind::MessageGroup => {
                let group_id = event.group_id.clone()?;
                (group_id.clone(), MessageTarget::Group(group_id))
            }
            EventKind::MessagePrivate | EventKind::MessageEcho => {
                if let Some(group_id) = event.group_id.clone() {
                    (group_id.clone(), MessageTarget::Group(group_id))
                } else {
                    let to = match event.to_user_id.clone() {
                        Some(to) => to,
                        None if from != self.self_id => self.self_id.clone(),
                        None => {
                            tracing::warn!("Dropping echo {} without recipient", event.id);
                            return None;
                        }
                    };
                    (private_chat_id(&from, &to), MessageTarget::User(to))
                }
            }
            _ => return None,
        };

        Some(Message {
            id: event.id.clone(),
            chat_id,
            from_user_id: from,
            target,
            content: event.content().unwrap_or_default().to_string(),
            timestamp: event.timestamp,
            provisional: false,
        })
    }
}

/// Frame sent over the push channel for an outgoing message. Temp chat
/// ids go out as-is; the server substitutes its own.
pub fn outbound_frame(message: &Message) -> Value {
    match &message.target {
        MessageTarget::User(to) => json!({
            "type": "private",
            "toUserId": to,
            "chatId": message.chat_id,
            "content": message.content,
        }),
        MessageTarget::Group(group_id) => json!({
            "type": "group_message",
            "groupId": group_id,
            "chatId": message.chat_id,
            "content": message.content,
        }),
    }
}
