pub mod command;
pub mod consumer;
pub mod router;
pub mod session;

pub use command::{SessionCommand, SessionHandle};
pub use consumer::run;
pub use router::{DispatchRouter, Effect, SyncState};
pub use session::{ClearFailed, Outbox, SyncSession};
