pub mod store;

pub use store::{outbound_frame, AppendOutcome, ConfirmMatch, MessageStore};
