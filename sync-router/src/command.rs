//! Local actions sent into a running consumer loop.

use crate::router::Effect;
use crate::session::{ClearFailed, Outbox, SyncSession};
use sync_core::{FriendSummary, Message, MessageTarget, NotificationItem, SocialApi, SyncError, SyncResult};
use tokio::sync::{mpsc, oneshot};

/// Everything a caller can ask of the session owned by [`crate::run`].
#[derive(Debug)]
pub enum SessionCommand {
    SendFriendRequest {
        user_id: String,
        responder: oneshot::Sender<SyncResult<()>>,
    },
    AcceptFriendRequest {
        user_id: String,
        responder: oneshot::Sender<SyncResult<()>>,
    },
    RejectFriendRequest {
        user_id: String,
        responder: oneshot::Sender<SyncResult<()>>,
    },
    CancelFriendRequest {
        user_id: String,
        responder: oneshot::Sender<SyncResult<()>>,
    },
    RemoveFriend {
        user_id: String,
        responder: oneshot::Sender<SyncResult<()>>,
    },
    LikeProfile {
        user_id: String,
        responder: oneshot::Sender<SyncResult<()>>,
    },
    UnlikeProfile {
        user_id: String,
        responder: oneshot::Sender<SyncResult<()>>,
    },
    SendMessage {
        target: MessageTarget,
        content: String,
        responder: oneshot::Sender<SyncResult<Message>>,
    },
    DeleteMessage {
        message_id: String,
        responder: oneshot::Sender<SyncResult<()>>,
    },
    LoadPrivateHistory {
        user_id: String,
        responder: oneshot::Sender<SyncResult<usize>>,
    },
    LoadGroupHistory {
        group_id: String,
        responder: oneshot::Sender<SyncResult<usize>>,
    },
    MarkNotificationRead {
        id: String,
        responder: oneshot::Sender<SyncResult<()>>,
    },
    MarkAllNotificationsRead {
        responder: oneshot::Sender<SyncResult<usize>>,
    },
    DeleteNotification {
        id: String,
        responder: oneshot::Sender<SyncResult<()>>,
    },
    ClearNotifications {
        responder: oneshot::Sender<Result<(), ClearFailed>>,
    },
    /// Runs follow-up effects, e.g. the retry of a failed clear.
    RunEffects {
        effects: Vec<Effect>,
        responder: oneshot::Sender<Vec<Effect>>,
    },
    Friends {
        responder: oneshot::Sender<Vec<FriendSummary>>,
    },
    ReceivedRequests {
        responder: oneshot::Sender<Vec<FriendSummary>>,
    },
    SentRequests {
        responder: oneshot::Sender<Vec<FriendSummary>>,
    },
    Chat {
        chat_id: String,
        responder: oneshot::Sender<Vec<Message>>,
    },
    Notifications {
        responder: oneshot::Sender<Vec<NotificationItem>>,
    },
    /// Ends the session; the consumer loop returns afterwards.
    Logout { responder: oneshot::Sender<()> },
}

impl SessionCommand {
    /// Runs the command against `session`. Returns false once the session
    /// should end.
    pub async fn execute(self, session: &mut SyncSession, api: &dyn SocialApi, outbox: &dyn Outbox) -> bool {
        // A dropped responder only means the caller stopped waiting.
        match self {
            SessionCommand::SendFriendRequest { user_id, responder } => {
                let _ = responder.send(session.send_friend_request(api, &user_id).await);
            }
            SessionCommand::AcceptFriendRequest { user_id, responder } => {
                let _ = responder.send(session.accept_friend_request(api, &user_id).await);
            }
            SessionCommand::RejectFriendRequest { user_id, responder } => {
                let _ = responder.send(session.reject_friend_request(api, &user_id).await);
            }
            SessionCommand::CancelFriendRequest { user_id, responder } => {
                let _ = responder.send(session.cancel_friend_request(api, &user_id).await);
            }
            SessionCommand::RemoveFriend { user_id, responder } => {
                let _ = responder.send(session.remove_friend(api, &user_id).await);
            }
            SessionCommand::LikeProfile { user_id, responder } => {
                let _ = responder.send(session.like_profile(api, &user_id).await);
            }
            SessionCommand::UnlikeProfile { user_id, responder } => {
                let _ = responder.send(session.unlike_profile(api, &user_id).await);
            }
            SessionCommand::SendMessage {
                target,
                content,
                responder,
            } => {
                let _ = responder.send(session.send_message(outbox, target, &content));
            }
            SessionCommand::DeleteMessage { message_id, responder } => {
                let _ = responder.send(session.delete_message(api, &message_id).await);
            }
            SessionCommand::LoadPrivateHistory { user_id, responder } => {
                let _ = responder.send(session.load_private_history(api, &user_id).await);
            }
            SessionCommand::LoadGroupHistory { group_id, responder } => {
                let _ = responder.send(session.load_group_history(api, &group_id).await);
            }
            SessionCommand::MarkNotificationRead { id, responder } => {
                let _ = responder.send(session.mark_notification_read(api, &id).await);
            }
            SessionCommand::MarkAllNotificationsRead { responder } => {
                let _ = responder.send(session.mark_all_notifications_read(api).await);
            }
            SessionCommand::DeleteNotification { id, responder } => {
                let _ = responder.send(session.delete_notification(api, &id).await);
            }
            SessionCommand::ClearNotifications { responder } => {
                let _ = responder.send(session.clear_notifications(api).await);
            }
            SessionCommand::RunEffects { effects, responder } => {
                let _ = responder.send(session.apply_effects(api, effects).await);
            }
            SessionCommand::Friends { responder } => {
                let _ = responder.send(session.state().relationships.friends());
            }
            SessionCommand::ReceivedRequests { responder } => {
                let _ = responder.send(session.state().relationships.received_requests());
            }
            SessionCommand::SentRequests { responder } => {
                let _ = responder.send(session.state().relationships.sent_requests());
            }
            SessionCommand::Chat { chat_id, responder } => {
                let messages = session.state().messages.get(&chat_id).into_iter().cloned().collect();
                let _ = responder.send(messages);
            }
            SessionCommand::Notifications { responder } => {
                let items = session
                    .state()
                    .notifications
                    .list(session.user_id())
                    .into_iter()
                    .cloned()
                    .collect();
                let _ = responder.send(items);
            }
            SessionCommand::Logout { responder } => {
                let _ = responder.send(());
                return false;
            }
        }
        true
    }
}

/// Cloneable front end of a running session.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    tx: mpsc::Sender<SessionCommand>,
}

impl SessionHandle {
    /// Creates a handle and the receiver to pass to [`crate::run`].
    pub fn channel(buffer: usize) -> (Self, mpsc::Receiver<SessionCommand>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        (Self { tx }, rx)
    }

    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> SessionCommand) -> SyncResult<T> {
        let (responder, rx) = oneshot::channel();
        self.tx
            .send(make(responder))
            .await
            .map_err(|_| SyncError::SessionClosed)?;
        rx.await.map_err(|_| SyncError::SessionClosed)
    }

    pub async fn send_friend_request(&self, user_id: &str) -> SyncResult<()> {
        let user_id = user_id.to_string();
        self.call(|responder| SessionCommand::SendFriendRequest { user_id, responder })
            .await?
    }

    pub async fn accept_friend_request(&self, user_id: &str) -> SyncResult<()> {
        let user_id = user_id.to_string();
        self.call(|responder| SessionCommand::AcceptFriendRequest { user_id, responder })
            .await?
    }

    pub async fn reject_friend_request(&self, user_id: &str) -> SyncResult<()> {
        let user_id = user_id.to_string();
        self.call(|responder| SessionCommand::RejectFriendRequest { user_id, responder })
            .await?
    }

    pub async fn cancel_friend_request(&self, user_id: &str) -> SyncResult<()> {
        let user_id = user_id.to_string();
        self.call(|responder| SessionCommand::CancelFriendRequest { user_id, responder })
            .await?
    }

    pub async fn remove_friend(&self, user_id: &str) -> SyncResult<()> {
        let user_id = user_id.to_string();
        self.call(|responder| SessionCommand::RemoveFriend { user_id, responder })
            .await?
    }

    pub async fn like_profile(&self, user_id: &str) -> SyncResult<()> {
        let user_id = user_id.to_string();
        self.call(|responder| SessionCommand::LikeProfile { user_id, responder })
            .await?
    }

    pub async fn unlike_profile(&self, user_id: &str) -> SyncResult<()> {
        let user_id = user_id.to_string();
        self.call(|responder| SessionCommand::UnlikeProfile { user_id, responder })
            .await?
    }

    pub async fn send_message(&self, target: MessageTarget, content: &str) -> SyncResult<Message> {
        let content = content.to_string();
        self.call(|responder| SessionCommand::SendMessage {
            target,
            content,
            responder,
        })
        .await?
    }

    pub async fn delete_message(&self, message_id: &str) -> SyncResult<()> {
        let message_id = message_id.to_string();
        self.call(|responder| SessionCommand::DeleteMessage { message_id, responder })
            .await?
    }

    pub async fn load_private_history(&self, user_id: &str) -> SyncResult<usize> {
        let user_id = user_id.to_string();
        self.call(|responder| SessionCommand::LoadPrivateHistory { user_id, responder })
            .await?
    }

    pub async fn load_group_history(&self, group_id: &str) -> SyncResult<usize> {
        let group_id = group_id.to_string();
        self.call(|responder| SessionCommand::LoadGroupHistory { group_id, responder })
            .await?
    }

    pub async fn mark_notification_read(&self, id: &str) -> SyncResult<()> {
        let id = id.to_string();
        self.call(|responder| SessionCommand::MarkNotificationRead { id, responder })
            .await?
    }

    pub async fn mark_all_notifications_read(&self) -> SyncResult<usize> {
        self.call(|responder| SessionCommand::MarkAllNotificationsRead { responder })
            .await?
    }

    pub async fn delete_notification(&self, id: &str) -> SyncResult<()> {
        let id = id.to_string();
        self.call(|responder| SessionCommand::DeleteNotification { id, responder })
            .await?
    }

    /// Clears all notices. The outer error means the session is gone; the
    /// inner one carries the retry effect of a failed server clear.
    pub async fn clear_notifications(&self) -> SyncResult<Result<(), ClearFailed>> {
        self.call(|responder| SessionCommand::ClearNotifications { responder })
            .await
    }

    pub async fn run_effects(&self, effects: Vec<Effect>) -> SyncResult<Vec<Effect>> {
        self.call(|responder| SessionCommand::RunEffects { effects, responder })
            .await
    }

    pub async fn friends(&self) -> SyncResult<Vec<FriendSummary>> {
        self.call(|responder| SessionCommand::Friends { responder }).await
    }

    pub async fn received_requests(&self) -> SyncResult<Vec<FriendSummary>> {
        self.call(|responder| SessionCommand::ReceivedRequests { responder })
            .await
    }

    pub async fn sent_requests(&self) -> SyncResult<Vec<FriendSummary>> {
        self.call(|responder| SessionCommand::SentRequests { responder })
            .await
    }

    pub async fn chat(&self, chat_id: &str) -> SyncResult<Vec<Message>> {
        let chat_id = chat_id.to_string();
        self.call(|responder| SessionCommand::Chat { chat_id, responder })
            .await
    }

    pub async fn notifications(&self) -> SyncResult<Vec<NotificationItem>> {
        self.call(|responder| SessionCommand::Notifications { responder })
            .await
    }

    pub async fn logout(&self) -> SyncResult<()> {
        self.call(|responder| SessionCommand::Logout { responder }).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::tests::{FakeApi, RecordingOutbox};
    use std::sync::Arc;
    use sync_core::{Config, RelationshipState};

    fn spawn_session(
        user: &str,
        api: Arc<FakeApi>,
        outbox: Arc<RecordingOutbox>,
    ) -> (SessionHandle, tokio::task::JoinHandle<SyncSession>) {
        let (handle, mut rx) = SessionHandle::channel(8);
        let mut session = SyncSession::new(user, &Config::default());
        let task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                if !command.execute(&mut session, api.as_ref(), outbox.as_ref()).await {
                    break;
                }
            }
            session
        });
        (handle, task)
    }

    #[tokio::test]
    async fn test_handle_drives_friend_actions() {
        let api = Arc::new(FakeApi::default());
        api.sent.lock().unwrap().push(FriendSummary {
            id: "bob".to_string(),
            ..Default::default()
        });
        let (handle, task) = spawn_session("alice", api.clone(), Arc::new(RecordingOutbox::default()));

        handle.send_friend_request("bob").await.unwrap();
        let sent = handle.sent_requests().await.unwrap();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].id, "bob");

        handle.logout().await.unwrap();
        let session = task.await.unwrap();
        assert_eq!(session.state().relationships.state_of("bob"), RelationshipState::RequestSent);
        assert!(api.calls().contains(&"send_friend_request alice->bob".to_string()));
    }

    #[tokio::test]
    async fn test_handle_sends_messages_through_outbox() {
        let outbox = Arc::new(RecordingOutbox::default());
        let (handle, _task) = spawn_session("alice", Arc::new(FakeApi::default()), outbox.clone());

        let message = handle
            .send_message(MessageTarget::User("bob".to_string()), "hi")
            .await
            .unwrap();
        assert!(message.provisional);
        assert_eq!(handle.chat("temp-bob").await.unwrap().len(), 1);
        assert_eq!(outbox.frames.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_failed_clear_retry_runs_through_handle() {
        let api = Arc::new(FakeApi::default());
        api.fail("clear_notifications");
        let (handle, _task) = spawn_session("alice", api.clone(), Arc::new(RecordingOutbox::default()));

        let failed = handle.clear_notifications().await.unwrap().unwrap_err();
        assert!(handle.notifications().await.unwrap().is_empty());

        handle.run_effects(vec![failed.retry]).await.unwrap();
        assert!(api.calls().contains(&"fetch_notifications alice".to_string()));
    }

    #[tokio::test]
    async fn test_calls_after_logout_report_closed_session() {
        let (handle, task) = spawn_session(
            "alice",
            Arc::new(FakeApi::default()),
            Arc::new(RecordingOutbox::default()),
        );
        handle.logout().await.unwrap();
        task.await.unwrap();

        assert_eq!(handle.friends().await.unwrap_err(), SyncError::SessionClosed);
        assert_eq!(handle.like_profile("bob").await, Err(SyncError::SessionClosed));
    }
}
