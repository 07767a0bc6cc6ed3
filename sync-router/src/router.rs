use std::collections::{HashSet, VecDeque};
use sync_core::{temp_chat_id, Config, Event, EventKind, ListKind, MessageTarget, NotificationItem};
use sync_messaging::{AppendOutcome, MessageStore};
use sync_notify::NotificationFeed;
use sync_relationships::{Outcome, RelationshipReconciler};

/// Something the caller may need to act on after an event was routed.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    RelationshipChanged(Outcome),
    /// Re-fetch an authoritative friend list for a user.
    Refresh(ListKind, String),
    MessageStored {
        chat_id: String,
        message_id: String,
        outcome: AppendOutcome,
    },
    GroupJoined(String),
    Notified(NotificationItem),
    /// Re-fetch a user's notifications from the server.
    RefreshNotifications(String),
    ServerError(String),
    Connected(Option<String>),
}

/// State containers of one session.
pub struct SyncState {
    pub relationships: RelationshipReconciler,
    pub messages: MessageStore,
    pub notifications: NotificationFeed,
}

impl SyncState {
    pub fn new(self_id: &str, config: &Config) -> Self {
        Self {
            relationships: RelationshipReconciler::new(self_id),
            messages: MessageStore::new(self_id, config.message_match_window()),
            notifications: NotificationFeed::new(self_id),
        }
    }
}

/// Single entry point feeding each event to the reconciler, the message
/// store and the notification feed, in that order.
pub struct DispatchRouter {
    self_id: String,
    capacity: usize,
    seen: HashSet<String>,
    seen_order: VecDeque<String>,
}

impl DispatchRouter {
    pub fn new(self_id: &str, capacity: usize) -> Self {
        Self {
            self_id: self_id.to_string(),
            capacity: capacity.max(1),
            seen: HashSet::new(),
            seen_order: VecDeque::new(),
        }
    }

    pub fn route(&mut self, event: &Event, state: &mut SyncState) -> Vec<Effect> {
        if !self.remember(&event.id) {
            tracing::debug!("Skipping re-delivered event {} ({})", event.id, event.kind);
            return Vec::new();
        }
        tracing::debug!("Routing {} event {}", event.kind, event.id);

        let mut effects = Vec::new();

        let outcome = if event.kind.is_friend_lifecycle() {
            let outcome = state.relationships.apply(event);
            if outcome.changed {
                effects.push(Effect::RelationshipChanged(outcome.clone()));
            }
            for list in &outcome.refresh {
                effects.push(Effect::Refresh(*list, self.self_id.clone()));
            }
            Some(outcome)
        } else {
            None
        };

        let mut is_new_chat = false;
        match event.kind {
            EventKind::MessagePrivate | EventKind::MessageGroup | EventKind::MessageEcho => {
                if let Some(message) = state.messages.message_from_event(event) {
                    if let MessageTarget::User(to) = &message.target {
                        let other = if message.from_user_id == self.self_id {
                            to.as_str()
                        } else {
                            message.from_user_id.as_str()
                        };
                        is_new_chat = !state.messages.has_chat(&message.chat_id)
                            && !state.messages.has_chat(&temp_chat_id(other));
                    }
                    let chat_id = message.chat_id.clone();
                    let message_id = message.id.clone();
                    let outcome = state.messages.append(message);
                    if outcome.is_visible_change() {
                        effects.push(Effect::MessageStored {
                            chat_id: state.messages.resolve_chat_id(&chat_id),
                            message_id,
                            outcome,
                        });
                    }
                }
            }
            EventKind::GroupInvite => {
                if let Some(group_id) = &event.group_id {
                    if state.messages.add_group(group_id) {
                        effects.push(Effect::GroupJoined(group_id.clone()));
                    }
                }
            }
            _ => {}
        }

        if let Some(item) = state.notifications.evaluate(event, outcome.as_ref(), is_new_chat, &state.relationships) {
            state.notifications.add(item.clone());
            effects.push(Effect::Notified(item));
        }

        match event.kind {
            EventKind::Connected => {
                let user = event.payload_str("userId").map(str::to_string);
                effects.push(Effect::Connected(user));
            }
            EventKind::ServerError => {
                let text = event
                    .error_text()
                    .or_else(|| event.text())
                    .unwrap_or("unknown server error")
                    .to_string();
                tracing::warn!("Server reported error: {}", text);
                effects.push(Effect::ServerError(text));
            }
            _ => {}
        }

        effects
    }

    /// Records `id`; false when it was already seen.
    fn remember(&mut self, id: &str) -> bool {
        if self.seen.contains(id) {
            return false;
        }
        if self.seen_order.len() >= self.capacity {
            if let Some(oldest) = self.seen_order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        self.seen.insert(id.to_string());
        self.seen_order.push_back(id.to_string());
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sync_core::{EventNormalizer, RelationshipState};

    fn setup(self_id: &str) -> (EventNormalizer, DispatchRouter, SyncState) {
        let config = Config::default();
        (
            EventNormalizer::new(self_id),
            DispatchRouter::new(self_id, 16),
            SyncState::new(self_id, &config),
        )
    }

    #[test]
    fn test_redelivery_is_a_no_op() {
        let (normalizer, mut router, mut state) = setup("bob");
        let event = normalizer
            .normalize(r#"{"type":"notification","notificationType":"friend_request_received","id":"n1","data":{"requestId":"r1","fromUserId":"alice"}}"#)
            .unwrap();

        let first = router.route(&event, &mut state);
        assert!(first.iter().any(|e| matches!(e, Effect::RelationshipChanged(_))));
        assert!(first.iter().any(|e| matches!(e, Effect::Notified(_))));
        assert!(first.contains(&Effect::Refresh(ListKind::Received, "bob".to_string())));

        assert!(router.route(&event, &mut state).is_empty());
        assert_eq!(state.notifications.list("bob").len(), 1);
    }

    #[test]
    fn test_friend_removed_resolves_sender() {
        let (normalizer, mut router, mut state) = setup("bob");
        state.relationships.apply_friends(&[sync_core::FriendSummary {
            id: "alice".to_string(),
            ..Default::default()
        }]);
        let event = normalizer
            .normalize(r#"{"type":"friend_removed","id":"e1","fromUserId":"alice"}"#)
            .unwrap();

        let effects = router.route(&event, &mut state);
        assert_eq!(state.relationships.state_of("alice"), RelationshipState::None);
        let notice = effects.iter().find_map(|e| match e {
            Effect::Notified(item) => Some(item),
            _ => None,
        });
        assert_eq!(notice.map(|n| n.kind.as_str()), Some("friend_removed"));
    }

    #[test]
    fn test_first_message_notifies_new_chat() {
        let (normalizer, mut router, mut state) = setup("bob");
        let first = normalizer
            .normalize(r#"{"type":"private","id":"m1","fromUserId":"alice","toUserId":"bob","content":"hi"}"#)
            .unwrap();
        let second = normalizer
            .normalize(r#"{"type":"private","id":"m2","fromUserId":"alice","toUserId":"bob","content":"there?"}"#)
            .unwrap();

        let effects = router.route(&first, &mut state);
        assert!(effects.iter().any(|e| matches!(e, Effect::MessageStored { outcome: AppendOutcome::Inserted, .. })));
        assert!(effects.iter().any(|e| matches!(e, Effect::Notified(n) if n.kind == "new_chat")));

        let effects = router.route(&second, &mut state);
        assert!(effects.iter().any(|e| matches!(e, Effect::Notified(n) if n.kind == "new_private_message")));
        assert_eq!(state.messages.get("alice:bob").len(), 2);
    }

    #[test]
    fn test_reply_to_pending_send_is_not_a_new_chat() {
        let (normalizer, mut router, mut state) = setup("bob");
        state
            .messages
            .send_local(MessageTarget::User("alice".to_string()), "hello?");
        let reply = normalizer
            .normalize(r#"{"type":"private","id":"m1","fromUserId":"alice","toUserId":"bob","content":"hey"}"#)
            .unwrap();

        let effects = router.route(&reply, &mut state);
        assert!(effects.iter().any(|e| matches!(e, Effect::Notified(n) if n.kind == "new_private_message")));
        assert_eq!(state.messages.get("alice:bob").len(), 2);
        assert!(!state.messages.chat_ids().contains(&"temp-alice"));
    }

    #[test]
    fn test_group_invite_joins_group() {
        let (normalizer, mut router, mut state) = setup("bob");
        let event = normalizer
            .normalize(r#"{"type":"group_invite","fromUserId":"alice","invitedUserId":"bob","groupId":"g1"}"#)
            .unwrap();

        let effects = router.route(&event, &mut state);
        assert_eq!(effects[0], Effect::GroupJoined("g1".to_string()));
        assert!(matches!(&effects[1], Effect::Notified(n) if n.kind == "group_invite"));
        assert_eq!(state.messages.groups(), vec!["g1"]);
    }

    #[test]
    fn test_server_error_and_connected() {
        let (normalizer, mut router, mut state) = setup("bob");
        let error = normalizer.normalize(r#"{"error":"Invalid message format"}"#).unwrap();
        assert_eq!(
            router.route(&error, &mut state),
            vec![Effect::ServerError("Invalid message format".to_string())]
        );

        let connected = normalizer.normalize(r#"{"type":"connected","userId":"bob"}"#).unwrap();
        assert_eq!(
            router.route(&connected, &mut state),
            vec![Effect::Connected(Some("bob".to_string()))]
        );
    }

    #[test]
    fn test_seen_memory_is_bounded() {
        let mut router = DispatchRouter::new("bob", 2);
        assert!(router.remember("a"));
        assert!(router.remember("b"));
        assert!(!router.remember("a"));
        assert!(router.remember("c"));
        assert!(router.remember("a"));
    }
}
