pub mod feed;

pub use feed::{is_local_only, NotificationFeed, LOCAL_NOTICE_PREFIX};
