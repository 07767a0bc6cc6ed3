use crate::router::{DispatchRouter, Effect, SyncState};
use std::collections::HashSet;
use sync_connection::{ConnectionHandle, ConnectionManager};
use sync_core::{
    Config, Event, EventNormalizer, FriendSummary, ListKind, Message, MessageTarget, SocialApi, SyncError,
    SyncResult, TEMP_PREFIX,
};
use sync_messaging::outbound_frame;
use sync_notify::is_local_only;
use sync_relationships::{LocalAction, Outcome};

/// Where outgoing chat frames are written.
pub trait Outbox: Send + Sync {
    fn send_frame(&self, frame: String) -> SyncResult<()>;
}

impl Outbox for ConnectionManager {
    fn send_frame(&self, frame: String) -> SyncResult<()> {
        self.send(frame)
    }
}

impl Outbox for ConnectionHandle {
    fn send_frame(&self, frame: String) -> SyncResult<()> {
        self.send(frame)
    }
}

/// A failed server-side clear. Local state was cleared anyway; `retry`
/// is the single follow-up fetch the caller may run.
#[derive(Debug, Clone, PartialEq)]
pub struct ClearFailed {
    pub error: SyncError,
    pub retry: Effect,
}

/// Owned sync state of one authenticated user, created at login and
/// dropped at logout.
pub struct SyncSession {
    user_id: String,
    normalizer: EventNormalizer,
    router: DispatchRouter,
    state: SyncState,
}

impl SyncSession {
    pub fn new(user_id: &str, config: &Config) -> Self {
        tracing::info!("Starting sync session for {}", user_id);
        Self {
            user_id: user_id.to_string(),
            normalizer: EventNormalizer::new(user_id),
            router: DispatchRouter::new(user_id, config.sync.seen_event_capacity),
            state: SyncState::new(user_id, config),
        }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn state(&self) -> &SyncState {
        &self.state
    }

    /// Normalizes and routes one raw frame. Malformed frames are logged and
    /// dropped.
    pub fn handle_frame(&mut self, raw: &str) -> Vec<Effect> {
        match self.normalizer.normalize(raw) {
            Ok(event) => self.handle_event(&event),
            Err(e) => {
                tracing::warn!("Dropping frame: {}", e);
                Vec::new()
            }
        }
    }

    pub fn handle_event(&mut self, event: &Event) -> Vec<Effect> {
        self.router.route(event, &mut self.state)
    }

    /// Runs the fetches requested by `effects` and feeds the results back.
    /// Returns the relationship changes those fetches caused.
    pub async fn apply_effects(&mut self, api: &dyn SocialApi, effects: Vec<Effect>) -> Vec<Effect> {
        let mut lists: Vec<(ListKind, String)> = Vec::new();
        let mut notification_users: Vec<String> = Vec::new();

        for effect in effects {
            match effect {
                Effect::Refresh(kind, user_id) => lists.push((kind, user_id)),
                Effect::RefreshNotifications(user_id) => notification_users.push(user_id),
                Effect::Connected(_) => {
                    for kind in [ListKind::Friends, ListKind::Sent, ListKind::Received] {
                        lists.push((kind, self.user_id.clone()));
                    }
                    notification_users.push(self.user_id.clone());
                }
                _ => {}
            }
        }

        let mut follow_up = Vec::new();
        let mut done = HashSet::new();
        for (kind, user_id) in lists {
            if !done.insert((kind, user_id.clone())) {
                continue;
            }
            if user_id != self.user_id {
                tracing::debug!("Skipping {:?} refresh for foreign user {}", kind, user_id);
                continue;
            }
            match self.refresh_list(api, kind).await {
                Ok(outcomes) => follow_up.extend(outcomes.into_iter().map(Effect::RelationshipChanged)),
                Err(e) => tracing::error!("Failed to refresh {:?} list: {}", kind, e),
            }
        }

        let mut notified = HashSet::new();
        for user_id in notification_users {
            if notified.insert(user_id.clone()) {
                if let Err(e) = self.load_notifications_for(api, &user_id).await {
                    tracing::error!("Failed to fetch notifications for {}: {}", user_id, e);
                }
            }
        }

        follow_up
    }

    pub async fn refresh_list(&mut self, api: &dyn SocialApi, kind: ListKind) -> SyncResult<Vec<Outcome>> {
        let list = api.fetch_list(kind, &self.user_id).await?;
        Ok(self.state.relationships.apply_list(kind, &list))
    }

    pub async fn refresh_all(&mut self, api: &dyn SocialApi) -> SyncResult<Vec<Outcome>> {
        let mut outcomes = Vec::new();
        for kind in [ListKind::Friends, ListKind::Sent, ListKind::Received] {
            outcomes.extend(self.refresh_list(api, kind).await?);
        }
        Ok(outcomes)
    }

    async fn friend_action(
        &mut self,
        api: &dyn SocialApi,
        action: LocalAction,
        counterparty: &str,
    ) -> SyncResult<()> {
        let (pending, _) = self.state.relationships.begin(action, counterparty);
        let me = self.user_id.as_str();
        let result = match action {
            LocalAction::SendRequest => api.send_friend_request(me, counterparty).await,
            LocalAction::Accept => api.accept_friend_request(me, counterparty).await,
            LocalAction::Reject => api.reject_friend_request(me, counterparty).await,
            LocalAction::Cancel => api.cancel_friend_request(me, counterparty).await,
            LocalAction::Remove => api.remove_friend(me, counterparty).await,
        };

        if let Err(e) = &result {
            tracing::warn!("{:?} with {} failed: {}", action, counterparty, e);
        }
        self.state.relationships.settle(pending, &result);

        if result.is_ok() {
            let lists: &[ListKind] = match action {
                LocalAction::SendRequest | LocalAction::Cancel => &[ListKind::Sent],
                LocalAction::Accept => &[ListKind::Friends, ListKind::Received],
                LocalAction::Reject => &[ListKind::Received],
                LocalAction::Remove => &[ListKind::Friends],
            };
            for kind in lists {
                if let Err(e) = self.refresh_list(api, *kind).await {
                    tracing::error!("Failed to refresh {:?} list: {}", kind, e);
                }
            }
        }
        result
    }

    pub async fn send_friend_request(&mut self, api: &dyn SocialApi, receiver_id: &str) -> SyncResult<()> {
        self.friend_action(api, LocalAction::SendRequest, receiver_id).await
    }

    pub async fn accept_friend_request(&mut self, api: &dyn SocialApi, sender_id: &str) -> SyncResult<()> {
        self.friend_action(api, LocalAction::Accept, sender_id).await
    }

    pub async fn reject_friend_request(&mut self, api: &dyn SocialApi, sender_id: &str) -> SyncResult<()> {
        self.friend_action(api, LocalAction::Reject, sender_id).await
    }

    pub async fn cancel_friend_request(&mut self, api: &dyn SocialApi, receiver_id: &str) -> SyncResult<()> {
        self.friend_action(api, LocalAction::Cancel, receiver_id).await
    }

    pub async fn remove_friend(&mut self, api: &dyn SocialApi, friend_id: &str) -> SyncResult<()> {
        self.friend_action(api, LocalAction::Remove, friend_id).await
    }

    pub async fn like_profile(&self, api: &dyn SocialApi, user_id: &str) -> SyncResult<()> {
        api.like_profile(&self.user_id, user_id).await
    }

    pub async fn unlike_profile(&self, api: &dyn SocialApi, user_id: &str) -> SyncResult<()> {
        api.unlike_profile(&self.user_id, user_id).await
    }

    /// Records a profile the user looked at.
    pub fn observe_profile(&mut self, summary: FriendSummary) {
        self.state.relationships.observe(summary);
    }

    /// Stores a provisional message and writes it to the push channel. The
    /// provisional entry is dropped again if it cannot be sent.
    pub fn send_message(&mut self, outbox: &dyn Outbox, target: MessageTarget, content: &str) -> SyncResult<Message> {
        let message = self.state.messages.send_local(target, content);
        let frame = outbound_frame(&message).to_string();
        if let Err(e) = outbox.send_frame(frame) {
            tracing::warn!("Could not send message {}: {}", message.id, e);
            self.state.messages.remove(&message.id);
            return Err(e);
        }
        Ok(message)
    }

    /// Deletes a message. Provisional ids never reached the server and are
    /// removed locally only.
    pub async fn delete_message(&mut self, api: &dyn SocialApi, message_id: &str) -> SyncResult<()> {
        if !message_id.starts_with(TEMP_PREFIX) {
            api.delete_message(message_id).await?;
        }
        self.state.messages.remove(message_id);
        Ok(())
    }

    pub async fn load_private_history(&mut self, api: &dyn SocialApi, other_user_id: &str) -> SyncResult<usize> {
        let history = api.fetch_private_messages(other_user_id).await?;
        let merged = self
            .state
            .messages
            .merge_history(history.into_iter().filter_map(|m| m.into_message()).collect());
        tracing::debug!("Merged {} message(s) with {}", merged, other_user_id);
        Ok(merged)
    }

    pub async fn load_group_history(&mut self, api: &dyn SocialApi, group_id: &str) -> SyncResult<usize> {
        let history = api.fetch_group_messages(group_id).await?;
        self.state.messages.add_group(group_id);
        let merged = self
            .state
            .messages
            .merge_history(history.into_iter().filter_map(|m| m.into_message()).collect());
        tracing::debug!("Merged {} message(s) in group {}", merged, group_id);
        Ok(merged)
    }

    pub async fn load_notifications(&mut self, api: &dyn SocialApi) -> SyncResult<usize> {
        let user_id = self.user_id.clone();
        self.load_notifications_for(api, &user_id).await
    }

    async fn load_notifications_for(&mut self, api: &dyn SocialApi, user_id: &str) -> SyncResult<usize> {
        let items = api.fetch_notifications(user_id).await?;
        let count = items.len();
        self.state.notifications.replace_all(user_id, items);
        Ok(count)
    }

    /// Marks one notice read. Notices the server does not know (local-only
    /// or already gone) are marked locally.
    pub async fn mark_notification_read(&mut self, api: &dyn SocialApi, id: &str) -> SyncResult<()> {
        if !is_local_only(id) {
            match api.mark_notification_read(id).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {
                    tracing::debug!("Notification {} unknown to the server, marking locally", id);
                }
                Err(e) => return Err(e),
            }
        }
        self.state.notifications.mark_read(id);
        Ok(())
    }

    /// Marks every unread notice read; returns how many were marked. The
    /// first server failure is returned after the rest were attempted.
    pub async fn mark_all_notifications_read(&mut self, api: &dyn SocialApi) -> SyncResult<usize> {
        let unread: Vec<String> = self
            .state
            .notifications
            .list(&self.user_id)
            .into_iter()
            .filter(|n| !n.is_read)
            .map(|n| n.id.clone())
            .collect();

        let mut first_error = None;
        let mut marked = 0;
        for id in unread {
            match self.mark_notification_read(api, &id).await {
                Ok(()) => marked += 1,
                Err(e) => {
                    tracing::error!("Failed to mark notification {} read: {}", id, e);
                    first_error.get_or_insert(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(marked),
        }
    }

    /// Deletes one notice. The local copy is removed even if the server
    /// call fails.
    pub async fn delete_notification(&mut self, api: &dyn SocialApi, id: &str) -> SyncResult<()> {
        let result = if is_local_only(id) {
            Ok(())
        } else {
            api.delete_notification(&self.user_id, id).await
        };
        self.state.notifications.remove(id);
        result
    }

    /// Clears all notices. Local state is emptied regardless of the server
    /// outcome.
    pub async fn clear_notifications(&mut self, api: &dyn SocialApi) -> Result<(), ClearFailed> {
        let result = api.clear_notifications(&self.user_id).await;
        let cleared = self.state.notifications.clear(&self.user_id);
        match result {
            Ok(()) => {
                tracing::info!("Cleared {} notification(s)", cleared);
                Ok(())
            }
            Err(error) => {
                tracing::warn!("Server clear failed ({}), cleared {} locally", error, cleared);
                Err(ClearFailed {
                    error,
                    retry: Effect::RefreshNotifications(self.user_id.clone()),
                })
            }
        }
    }

    /// Ends the session, dropping all state.
    pub fn logout(self) {
        tracing::info!("Ending sync session for {}", self.user_id);
    }
}
