pub mod api;
pub mod config;
pub mod context;
pub mod error;
pub mod event;
pub mod types;

pub use api::{HttpSocialApi, SocialApi, WireMessage};
pub use config::{mask_token, Config, ReconnectStrategy};
pub use context::SyncContext;
pub use error::{NormalizeError, SyncError, SyncResult};
pub use event::EventNormalizer;
pub use types::{
    private_chat_id, temp_chat_id, Event, EventKind, FriendSummary, ListKind, Message,
    MessageTarget, NotificationItem, Relationship, RelationshipState, TEMP_PREFIX,
};
