use crate::config::ApiConfig;
use crate::error::{SyncError, SyncResult};
use crate::event::parse_timestamp;
use crate::types::{private_chat_id, FriendSummary, ListKind, Message, MessageTarget, NotificationItem};
use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Request/response operations the sync layer issues against the backend.
#[async_trait]
pub trait SocialApi: Send + Sync {
    async fn send_friend_request(&self, sender_id: &str, receiver_id: &str) -> SyncResult<()>;
    async fn accept_friend_request(&self, user_id: &str, friend_id: &str) -> SyncResult<()>;
    async fn reject_friend_request(&self, user_id: &str, friend_id: &str) -> SyncResult<()>;
    async fn cancel_friend_request(&self, sender_id: &str, receiver_id: &str) -> SyncResult<()>;
    async fn remove_friend(&self, user_id: &str, friend_id: &str) -> SyncResult<()>;

    async fn fetch_friends(&self, user_id: &str) -> SyncResult<Vec<FriendSummary>>;
    async fn fetch_sent_requests(&self, user_id: &str) -> SyncResult<Vec<FriendSummary>>;
    async fn fetch_received_requests(&self, user_id: &str) -> SyncResult<Vec<FriendSummary>>;

    async fn fetch_private_messages(&self, other_user_id: &str) -> SyncResult<Vec<WireMessage>>;
    async fn fetch_group_messages(&self, group_id: &str) -> SyncResult<Vec<WireMessage>>;
    async fn delete_message(&self, message_id: &str) -> SyncResult<()>;

    async fn fetch_notifications(&self, user_id: &str) -> SyncResult<Vec<NotificationItem>>;
    async fn mark_notification_read(&self, notification_id: &str) -> SyncResult<()>;
    async fn clear_notifications(&self, user_id: &str) -> SyncResult<()>;
    async fn delete_notification(&self, user_id: &str, notification_id: &str) -> SyncResult<()>;

    async fn like_profile(&self, liker_id: &str, liked_id: &str) -> SyncResult<()>;
    async fn unlike_profile(&self, liker_id: &str, liked_id: &str) -> SyncResult<()>;

    async fn fetch_list(&self, kind: ListKind, user_id: &str) -> SyncResult<Vec<FriendSummary>> {
        match kind {
            ListKind::Friends => self.fetch_friends(user_id).await,
            ListKind::Sent => self.fetch_sent_requests(user_id).await,
            ListKind::Received => self.fetch_received_requests(user_id).await,
        }
    }
}

/// Chat message as returned by the history endpoints.
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct WireMessage {
    #[serde(alias = "_id")]
    pub id: String,
    #[serde(default)]
    pub from_user_id: String,
    #[serde(default)]
    pub to_user_id: Option<String>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub chat_id: Option<String>,
    #[serde(default)]
    pub content: String,
    #[serde(default)]
    pub timestamp: Value,
}

impl WireMessage {
    /// Converts into a confirmed [`Message`] keyed by the local canonical
    /// chat id. Messages with neither a recipient nor a group are dropped.
    pub fn into_message(self) -> Option<Message> {
        let (chat_id, target) = match (self.group_id, self.to_user_id) {
            (Some(group_id), _) if !group_id.is_empty() => (group_id.clone(), MessageTarget::Group(group_id)),
            (_, Some(to)) if !to.is_empty() => (private_chat_id(&self.from_user_id, &to), MessageTarget::User(to)),
            _ => return None,
        };
        Some(Message {
            id: self.id,
            chat_id,
            from_user_id: self.from_user_id,
            target,
            content: self.content,
            timestamp: parse_timestamp(&self.timestamp).unwrap_or_else(Utc::now),
            provisional: false,
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireNotification {
    #[serde(alias = "_id")]
    id: String,
    #[serde(default)]
    user_id: String,
    #[serde(rename = "type", default)]
    kind: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    timestamp: Value,
    #[serde(default, alias = "read")]
    is_read: bool,
    #[serde(default)]
    data: Map<String, Value>,
}

impl From<WireNotification> for NotificationItem {
    fn from(n: WireNotification) -> Self {
        let data: BTreeMap<String, String> = n
            .data
            .into_iter()
            .filter_map(|(k, v)| match v {
                Value::String(s) => Some((k, s)),
                Value::Null => None,
                other => Some((k, other.to_string())),
            })
            .collect();
        NotificationItem {
            id: n.id,
            user_id: n.user_id,
            kind: n.kind,
            message: n.message,
            timestamp: parse_timestamp(&n.timestamp).unwrap_or_else(Utc::now),
            is_read: n.is_read,
            data,
        }
    }
}

/// [`SocialApi`] over the backend's REST endpoints.
pub struct HttpSocialApi {
    client: reqwest::Client,
    base_url: String,
    token: String,
}

impl HttpSocialApi {
    pub fn new(config: &ApiConfig, token: &str) -> SyncResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {}", e)))?;

        tracing::info!("HTTP API client initialized for {}", config.base_url);

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: token.to_string(),
        })
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, format!("{}{}", self.base_url, path))
            .header("Authorization", format!("Bearer {}", self.token))
    }

    async fn execute(&self, method: Method, path: &str) -> SyncResult<Response> {
        tracing::debug!("{} {}", method, path);
        let response = self.request(method.clone(), path).send().await.map_err(|e| {
            tracing::error!("{} {} failed: {}", method, path, e);
            SyncError::from(e)
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = rejection_message(&body)
            .unwrap_or_else(|| status.canonical_reason().unwrap_or("request failed").to_string());
        tracing::error!("{} {} returned {}: {}", method, path, status, message);
        Err(SyncError::Rejected {
            status: status.as_u16(),
            message,
        })
    }

    async fn send(&self, method: Method, path: &str) -> SyncResult<()> {
        self.execute(method, path).await.map(|_| ())
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> SyncResult<T> {
        let response = self.execute(Method::GET, path).await?;
        let body = response.text().await?;
        Ok(serde_json::from_str(&body)?)
    }
}

/// Human text out of an error body: `error`, then `message`, then the raw
/// body when it is not JSON.
fn rejection_message(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return None;
    }
    match serde_json::from_str::<Value>(trimmed) {
        Ok(Value::Object(obj)) => ["error", "message"]
            .iter()
            .filter_map(|k| obj.get(*k).and_then(Value::as_str))
            .find(|s| !s.is_empty())
            .map(str::to_string),
        Ok(Value::String(s)) => Some(s),
        _ => Some(trimmed.to_string()),
    }
}

#[async_trait]
impl SocialApi for HttpSocialApi {
    async fn send_friend_request(&self, sender_id: &str, receiver_id: &str) -> SyncResult<()> {
        self.send(Method::POST, &format!("/api/friends/request/{}/{}", sender_id, receiver_id))
            .await
    }

    async fn accept_friend_request(&self, user_id: &str, friend_id: &str) -> SyncResult<()> {
        self.send(Method::POST, &format!("/api/friends/accept/{}/{}", user_id, friend_id))
            .await
    }

    async fn reject_friend_request(&self, user_id: &str, friend_id: &str) -> SyncResult<()> {
        self.send(Method::POST, &format!("/api/friends/reject/{}/{}", user_id, friend_id))
            .await
    }

    async fn cancel_friend_request(&self, sender_id: &str, receiver_id: &str) -> SyncResult<()> {
        self.send(Method::DELETE, &format!("/api/friends/cancel/{}/{}", sender_id, receiver_id))
            .await
    }

    async fn remove_friend(&self, user_id: &str, friend_id: &str) -> SyncResult<()> {
        self.send(Method::DELETE, &format!("/api/friends/remove/{}/{}", user_id, friend_id))
            .await
    }

    async fn fetch_friends(&self, user_id: &str) -> SyncResult<Vec<FriendSummary>> {
        self.fetch(&format!("/api/friends/{}/{}", user_id, ListKind::Friends.path_segment()))
            .await
    }

    async fn fetch_sent_requests(&self, user_id: &str) -> SyncResult<Vec<FriendSummary>> {
        self.fetch(&format!("/api/friends/{}/{}", user_id, ListKind::Sent.path_segment()))
            .await
    }

    async fn fetch_received_requests(&self, user_id: &str) -> SyncResult<Vec<FriendSummary>> {
        self.fetch(&format!("/api/friends/{}/{}", user_id, ListKind::Received.path_segment()))
            .await
    }

    async fn fetch_private_messages(&self, other_user_id: &str) -> SyncResult<Vec<WireMessage>> {
        self.fetch(&format!("/api/chat/private/{}", other_user_id)).await
    }

    async fn fetch_group_messages(&self, group_id: &str) -> SyncResult<Vec<WireMessage>> {
        self.fetch(&format!("/api/chat/group/{}", group_id)).await
    }

    async fn delete_message(&self, message_id: &str) -> SyncResult<()> {
        self.send(Method::DELETE, &format!("/api/chat/{}", message_id)).await
    }

    async fn fetch_notifications(&self, user_id: &str) -> SyncResult<Vec<NotificationItem>> {
        let wire: Vec<WireNotification> = self.fetch(&format!("/api/notifications/{}", user_id)).await?;
        Ok(wire.into_iter().map(NotificationItem::from).collect())
    }

    async fn mark_notification_read(&self, notification_id: &str) -> SyncResult<()> {
        self.send(Method::PUT, &format!("/api/notifications/{}/read", notification_id))
            .await
    }

    async fn clear_notifications(&self, user_id: &str) -> SyncResult<()> {
        self.send(Method::DELETE, &format!("/api/notifications/{}", user_id)).await
    }

    async fn delete_notification(&self, user_id: &str, notification_id: &str) -> SyncResult<()> {
        self.send(Method::DELETE, &format!("/api/notifications/{}/{}", user_id, notification_id))
            .await
    }

    async fn like_profile(&self, liker_id: &str, liked_id: &str) -> SyncResult<()> {
        self.send(Method::POST, &format!("/api/users/{}/like/{}", liker_id, liked_id))
            .await
    }

    async fn unlike_profile(&self, liker_id: &str, liked_id: &str) -> SyncResult<()> {
        self.send(Method::DELETE, &format!("/api/users/{}/unlike/{}", liker_id, liked_id))
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejection_message_prefers_error_field() {
        assert_eq!(
            rejection_message(r#"{"code":"FRIEND_REQUEST_EXISTS","error":"Friend request already sent"}"#),
            Some("Friend request already sent".to_string())
        );
        assert_eq!(
            rejection_message(r#"{"message":"Utilisateur introuvable"}"#),
            Some("Utilisateur introuvable".to_string())
        );
        assert_eq!(rejection_message("Bad Gateway"), Some("Bad Gateway".to_string()));
        assert_eq!(rejection_message("  "), None);
    }

    #[test]
    fn test_wire_message_private_uses_canonical_chat_id() {
        let wire: WireMessage = serde_json::from_str(
            r#"{"id":"m1","fromUserId":"zed","toUserId":"amy","chatId":"server-chat","content":"hi","timestamp":"2024-05-01T10:00:00Z"}"#,
        )
        .unwrap();
        let message = wire.into_message().unwrap();
        assert_eq!(message.chat_id, "amy:zed");
        assert_eq!(message.target, MessageTarget::User("amy".to_string()));
        assert!(!message.provisional);
    }

    #[test]
    fn test_wire_message_group() {
        let wire: WireMessage =
            serde_json::from_str(r#"{"_id":"m2","fromUserId":"zed","groupId":"g1","content":"hey"}"#).unwrap();
        let message = wire.into_message().unwrap();
        assert_eq!(message.chat_id, "g1");
        assert_eq!(message.target, MessageTarget::Group("g1".to_string()));
    }

    #[test]
    fn test_wire_message_without_target_is_dropped() {
        let wire: WireMessage = serde_json::from_str(r#"{"id":"m3","fromUserId":"zed"}"#).unwrap();
        assert!(wire.into_message().is_none());
    }

    #[test]
    fn test_wire_notification_conversion() {
        let wire: WireNotification = serde_json::from_str(
            r#"{"id":"n1","userId":"me","type":"friend_request_received","message":"Bob wants to be friends","timestamp":1714557600000,"read":true,"data":{"requestId":"r1","count":2,"skip":null}}"#,
        )
        .unwrap();
        let item = NotificationItem::from(wire);
        assert!(item.is_read);
        assert_eq!(item.kind, "friend_request_received");
        assert_eq!(item.data.get("requestId").map(String::as_str), Some("r1"));
        assert_eq!(item.data.get("count").map(String::as_str), Some("2"));
        assert!(!item.data.contains_key("skip"));
    }
}
