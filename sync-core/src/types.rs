use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Closed set of occurrences the push channel can deliver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MessagePrivate,
    MessageGroup,
    GroupInvite,
    MessageEcho,
    FriendRequestSent,
    FriendRequestReceived,
    FriendRequestAccepted,
    FriendRequestRejected,
    FriendRequestCanceled,
    FriendRemoved,
    ProfileLiked,
    ProfileUnliked,
    Connected,
    ServerError,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::MessagePrivate => "message_private",
            EventKind::MessageGroup => "message_group",
            EventKind::GroupInvite => "group_invite",
            EventKind::MessageEcho => "message_echo",
            EventKind::FriendRequestSent => "friend_request_sent",
            EventKind::FriendRequestReceived => "friend_request_received",
            EventKind::FriendRequestAccepted => "friend_request_accepted",
            EventKind::FriendRequestRejected => "friend_request_rejected",
            EventKind::FriendRequestCanceled => "friend_request_canceled",
            EventKind::FriendRemoved => "friend_removed",
            EventKind::ProfileLiked => "profile_liked",
            EventKind::ProfileUnliked => "profile_unliked",
            EventKind::Connected => "connected",
            EventKind::ServerError => "server_error",
        }
    }

    pub fn is_friend_lifecycle(&self) -> bool {
        matches!(
            self,
            EventKind::FriendRequestSent
                | EventKind::FriendRequestReceived
                | EventKind::FriendRequestAccepted
                | EventKind::FriendRequestRejected
                | EventKind::FriendRequestCanceled
                | EventKind::FriendRemoved
        )
    }

    pub fn is_message(&self) -> bool {
        matches!(
            self,
            EventKind::MessagePrivate
                | EventKind::MessageGroup
                | EventKind::MessageEcho
                | EventKind::GroupInvite
        )
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One normalized occurrence from the push channel (or a synthetic one
/// built for a local optimistic action).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub kind: EventKind,
    pub from_user_id: Option<String>,
    pub to_user_id: Option<String>,
    pub group_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub payload: Map<String, Value>,
}

/// Prefix of ids minted for locally-initiated actions.
pub const LOCAL_ID_PREFIX: &str = "local-";

impl Event {
    /// Builds the event a local action would produce once confirmed.
    pub fn local(kind: EventKind, from_user_id: &str, to_user_id: &str) -> Self {
        Event {
            id: format!("{}{}", LOCAL_ID_PREFIX, uuid::Uuid::new_v4()),
            kind,
            from_user_id: Some(from_user_id.to_string()),
            to_user_id: Some(to_user_id.to_string()),
            group_id: None,
            timestamp: Utc::now(),
            payload: Map::new(),
        }
    }

    pub fn is_local(&self) -> bool {
        self.id.starts_with(LOCAL_ID_PREFIX)
    }

    pub fn payload_str(&self, key: &str) -> Option<&str> {
        self.payload
            .get(key)
            .and_then(|v| v.as_str())
            .filter(|s| !s.is_empty())
    }

    pub fn content(&self) -> Option<&str> {
        self.payload_str("content")
    }

    /// Human text the server attached to the event, if any.
    pub fn text(&self) -> Option<&str> {
        self.payload_str("message")
    }

    pub fn request_id(&self) -> Option<&str> {
        self.payload_str("requestId")
    }

    pub fn friend_id(&self) -> Option<&str> {
        self.payload_str("friendId")
    }

    pub fn chat_id(&self) -> Option<&str> {
        self.payload_str("chatId")
    }

    pub fn error_text(&self) -> Option<&str> {
        self.payload_str("error")
    }

    /// Profile summary carried by friend-lifecycle events, keyed to `id`.
    pub fn profile_summary(&self, id: &str) -> FriendSummary {
        FriendSummary {
            id: id.to_string(),
            first_name: self.payload_str("firstName").unwrap_or_default().to_string(),
            last_name: self.payload_str("lastName").unwrap_or_default().to_string(),
            email: self.payload_str("email").unwrap_or_default().to_string(),
            profile_picture_url: self.payload_str("profilePictureUrl").map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipState {
    #[default]
    None,
    RequestSent,
    RequestReceived,
    Friends,
}

impl RelationshipState {
    pub fn is_pending(&self) -> bool {
        matches!(self, RelationshipState::RequestSent | RelationshipState::RequestReceived)
    }
}

impl fmt::Display for RelationshipState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RelationshipState::None => "none",
            RelationshipState::RequestSent => "request_sent",
            RelationshipState::RequestReceived => "request_received",
            RelationshipState::Friends => "friends",
        };
        f.write_str(s)
    }
}

/// Friend-state between the local user and one counterparty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub counterparty_id: String,
    pub state: RelationshipState,
    pub pending_request_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Relationship {
    pub fn new(counterparty_id: &str) -> Self {
        Relationship {
            counterparty_id: counterparty_id.to_string(),
            state: RelationshipState::None,
            pending_request_id: None,
            updated_at: Utc::now(),
        }
    }
}

/// Which authoritative friend list a reconciliation fetch refreshes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListKind {
    Friends,
    Sent,
    Received,
}

impl ListKind {
    pub fn path_segment(&self) -> &'static str {
        match self {
            ListKind::Friends => "list",
            ListKind::Sent => "sent",
            ListKind::Received => "received",
        }
    }

    /// State a counterparty listed in this list is in.
    pub fn state(&self) -> RelationshipState {
        match self {
            ListKind::Friends => RelationshipState::Friends,
            ListKind::Sent => RelationshipState::RequestSent,
            ListKind::Received => RelationshipState::RequestReceived,
        }
    }
}

/// Profile summary returned by the friend list endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
pub struct FriendSummary {
    pub id: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub profile_picture_url: Option<String>,
}

impl FriendSummary {
    pub fn display_name(&self) -> String {
        let name = format!("{} {}", self.first_name, self.last_name);
        let name = name.trim();
        if name.is_empty() {
            self.id.clone()
        } else {
            name.to_string()
        }
    }

    pub fn has_details(&self) -> bool {
        !self.first_name.is_empty() || !self.last_name.is_empty() || !self.email.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "id")]
pub enum MessageTarget {
    User(String),
    Group(String),
}

/// One chat message, private or group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub chat_id: String,
    pub from_user_id: String,
    pub target: MessageTarget,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    pub provisional: bool,
}

/// Prefix of provisional message ids and provisional chat ids.
pub const TEMP_PREFIX: &str = "temp-";

/// Canonical chat id for a private conversation: the unordered pair of
/// participant ids.
pub fn private_chat_id(user1: &str, user2: &str) -> String {
    let (p1, p2) = if user1 < user2 {
        (user1, user2)
    } else {
        (user2, user1)
    };
    format!("{}:{}", p1, p2)
}

/// Chat id used before a first confirmed exchange with `counterparty`.
pub fn temp_chat_id(counterparty: &str) -> String {
    format!("{}{}", TEMP_PREFIX, counterparty)
}

/// One user-facing notice.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationItem {
    pub id: String,
    pub user_id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
    pub is_read: bool,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
}
