pub mod reconciler;

pub use reconciler::{LocalAction, Outcome, PendingAction, RelationshipReconciler, Role};
