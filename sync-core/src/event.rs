use crate::error::NormalizeError;
use crate::types::{Event, EventKind};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

/// Turns raw push-channel frames into [`Event`]s.
#[derive(Debug, Clone)]
pub struct EventNormalizer {
    self_id: String,
}

impl EventNormalizer {
    pub fn new(self_id: impl Into<String>) -> Self {
        EventNormalizer {
            self_id: self_id.into(),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    pub fn normalize(&self, raw: &str) -> Result<Event, NormalizeError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|e| NormalizeError::InvalidJson(e.to_string()))?;
        self.normalize_value(value)
    }

    pub fn normalize_value(&self, value: Value) -> Result<Event, NormalizeError> {
        let Value::Object(frame) = value else {
            return Err(NormalizeError::NotAnObject);
        };
        let kind = resolve_kind(&frame)?;

        // `data` is merged under the top-level fields, which take precedence.
        let mut payload = match frame.get("data") {
            Some(Value::Object(data)) => data.clone(),
            _ => Map::new(),
        };
        for (key, value) in &frame {
            if key != "data" {
                payload.insert(key.clone(), value.clone());
            }
        }

        let id = resolve_id(&payload).unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
        let mut from_user_id = first_str(&payload, &["fromUserId", "likerId", "senderId"]);
        let to_user_id = first_str(&payload, &["toUserId", "invitedUserId"]);
        let group_id = first_str(&payload, &["groupId"]);

        if kind == EventKind::MessageEcho && from_user_id.is_none() {
            from_user_id = Some(self.self_id.clone());
        }

        let timestamp = match payload.get("timestamp") {
            Some(raw_ts) => parse_timestamp(raw_ts).unwrap_or_else(|| {
                tracing::debug!("Unparseable timestamp {} on {} event, using receipt time", raw_ts, kind);
                Utc::now()
            }),
            None => Utc::now(),
        };

        for key in ["id", "_id", "type", "notificationType", "timestamp"] {
            payload.remove(key);
        }

        Ok(Event {
            id,
            kind,
            from_user_id,
            to_user_id,
            group_id,
            timestamp,
            payload,
        })
    }
}

fn resolve_kind(frame: &Map<String, Value>) -> Result<EventKind, NormalizeError> {
    let frame_type = frame.get("type").and_then(Value::as_str);
    let name = match frame_type {
        Some("notification") => frame
            .get("notificationType")
            .and_then(Value::as_str)
            .unwrap_or("notification"),
        Some(t) => t,
        None => {
            if frame.contains_key("error") {
                return Ok(EventKind::ServerError);
            }
            return Err(NormalizeError::Unsupported("<missing type>".to_string()));
        }
    };

    match kind_from_wire(name) {
        Some(kind) => Ok(kind),
        None if frame.contains_key("error") => Ok(EventKind::ServerError),
        None => Err(NormalizeError::Unsupported(name.to_string())),
    }
}

/// Maps every spelling the backend uses onto the closed kind set.
pub fn kind_from_wire(name: &str) -> Option<EventKind> {
    let kind = match name {
        "private" | "message_private" => EventKind::MessagePrivate,
        "group_message" | "message_group" => EventKind::MessageGroup,
        "group_invite" => EventKind::GroupInvite,
        "message_sent" | "message_echo" => EventKind::MessageEcho,
        "connected" => EventKind::Connected,
        "friend_request_sent" => EventKind::FriendRequestSent,
        "friend_request_received" => EventKind::FriendRequestReceived,
        "friend_request_accepted" => EventKind::FriendRequestAccepted,
        "friend_request_rejected" => EventKind::FriendRequestRejected,
        "friend_request_canceled" | "friend_request_cancelled" => EventKind::FriendRequestCanceled,
        "friend_removed" | "friendship_removed" => EventKind::FriendRemoved,
        "user_like" | "profile_liked" => EventKind::ProfileLiked,
        "user_unlike" | "profile_unliked" => EventKind::ProfileUnliked,
        "error" | "server_error" => EventKind::ServerError,
        _ => return None,
    };
    Some(kind)
}

fn resolve_id(payload: &Map<String, Value>) -> Option<String> {
    for key in ["id", "_id"] {
        match payload.get(key) {
            Some(Value::String(s)) if !s.is_empty() => return Some(s.clone()),
            Some(Value::Number(n)) => return Some(n.to_string()),
            Some(Value::Object(obj)) => {
                if let Some(oid) = obj.get("$oid").and_then(Value::as_str) {
                    return Some(oid.to_string());
                }
            }
            _ => {}
        }
    }
    None
}

fn first_str(payload: &Map<String, Value>, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| payload.get(*key))
        .filter_map(Value::as_str)
        .find(|s| !s.is_empty())
        .map(str::to_string)
}

/// Accepts RFC 3339 strings, `{"$date": ...}` wrappers and epoch millis.
pub fn parse_timestamp(value: &Value) -> Option<DateTime<Utc>> {
    match value {
        Value::String(s) => DateTime::parse_from_rfc3339(s)
            .map(|dt| dt.with_timezone(&Utc))
            .ok()
            .or_else(|| {
                // Java LocalDateTime without an offset.
                chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
                    .ok()
                    .map(|naive| naive.and_utc())
            }),
        Value::Number(n) => n
            .as_i64()
            .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
        Value::Object(obj) => obj.get("$date").and_then(parse_timestamp),
        _ => None,
    }
}
