use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use sync_core::{Event, EventKind, FriendSummary, ListKind, Relationship, RelationshipState, SyncResult};

/// Which side of a friend request the local user is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Sender,
    Receiver,
    Unknown,
}

/// Result of applying one friend-lifecycle event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    /// Empty when the counterparty could not be resolved.
    pub counterparty: String,
    pub kind: EventKind,
    pub previous: RelationshipState,
    pub current: RelationshipState,
    pub changed: bool,
    /// Authoritative lists of the local user to re-fetch.
    pub refresh: Vec<ListKind>,
}

impl Outcome {
    pub fn is_resolved(&self) -> bool {
        !self.counterparty.is_empty()
    }
}

/// Friend action initiated by the local user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LocalAction {
    SendRequest,
    Accept,
    Reject,
    Cancel,
    Remove,
}

impl LocalAction {
    fn event_kind(&self) -> EventKind {
        match self {
            LocalAction::SendRequest => EventKind::FriendRequestSent,
            LocalAction::Accept => EventKind::FriendRequestAccepted,
            LocalAction::Reject => EventKind::FriendRequestRejected,
            LocalAction::Cancel => EventKind::FriendRequestCanceled,
            LocalAction::Remove => EventKind::FriendRemoved,
        }
    }

    /// Whether the local user is the original request sender.
    fn local_is_sender(&self) -> bool {
        matches!(self, LocalAction::SendRequest | LocalAction::Cancel | LocalAction::Remove)
    }
}

/// Snapshot taken before an optimistic write, used to roll it back.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingAction {
    pub action: LocalAction,
    pub counterparty: String,
    snapshot: Option<Relationship>,
    optimistic: RelationshipState,
}

/// Per-counterparty friend state of the local user.
pub struct RelationshipReconciler {
    self_id: String,
    records: HashMap<String, Relationship>,
    profiles: HashMap<String, FriendSummary>,
    /// Request ids that already left the pending state, by counterparty.
    closed_requests: HashMap<String, String>,
}

impl RelationshipReconciler {
    pub fn new(self_id: impl Into<String>) -> Self {
        Self {
            self_id: self_id.into(),
            records: HashMap::new(),
            profiles: HashMap::new(),
            closed_requests: HashMap::new(),
        }
    }

    pub fn self_id(&self) -> &str {
        &self.self_id
    }

    /// Applies a friend-lifecycle event. Never fails; an unresolvable
    /// counterparty leaves state untouched but still asks for refreshes.
    pub fn apply(&mut self, event: &Event) -> Outcome {
        let counterparty = self.resolve_counterparty(event);
        if counterparty.is_empty() {
            tracing::warn!(
                "Could not resolve counterparty for {} event {}, refreshing lists only",
                event.kind,
                event.id
            );
            return Outcome {
                counterparty,
                kind: event.kind,
                previous: RelationshipState::None,
                current: RelationshipState::None,
                changed: false,
                refresh: refresh_lists(event.kind, Role::Unknown),
            };
        }

        let summary = event.profile_summary(&counterparty);
        if summary.has_details() {
            self.profiles.insert(counterparty.clone(), summary);
        }

        let previous = self.state_of(&counterparty);
        let role = self.role_for(event, previous);
        let target = transition(event.kind, role, previous);

        let record = self
            .records
            .entry(counterparty.clone())
            .or_insert_with(|| Relationship::new(&counterparty));

        let mut changed = false;
        if let Some(next) = target {
            if next != previous {
                record.state = next;
                record.updated_at = Utc::now();
                changed = true;
            }
            if next.is_pending() {
                if let Some(request_id) = event.request_id() {
                    if record.pending_request_id.as_deref() != Some(request_id) {
                        record.pending_request_id = Some(request_id.to_string());
                        changed = true;
                    }
                }
            } else if let Some(request_id) = record.pending_request_id.take() {
                self.closed_requests.insert(request_id, counterparty.clone());
            }
        } else {
            tracing::debug!(
                "Ignoring stale {} for {} in state {}",
                event.kind,
                counterparty,
                previous
            );
        }

        let current = record.state;
        if changed {
            tracing::info!("Relationship with {}: {} -> {} ({})", counterparty, previous, current, event.kind);
        } else {
            tracing::debug!("{} for {} is a no-op in state {}", event.kind, counterparty, current);
        }

        Outcome {
            counterparty,
            kind: event.kind,
            previous,
            current,
            changed,
            refresh: refresh_lists(event.kind, role),
        }
    }

    /// Resolution order: `friendId`, `toUserId`, `fromUserId` (each only
    /// when it is not the local user), then the request id, pending or
    /// already settled. A request the local user sent is announced with
    /// only its id; it is linked to the single outgoing request that has
    /// none yet.
    pub fn resolve_counterparty(&self, event: &Event) -> String {
        let candidates = [
            event.friend_id(),
            event.to_user_id.as_deref(),
            event.from_user_id.as_deref(),
        ];
        if let Some(id) = candidates
            .into_iter()
            .flatten()
            .find(|id| !id.is_empty() && *id != self.self_id)
        {
            return id.to_string();
        }

        if let Some(request_id) = event.request_id() {
            if let Some(record) = self
                .records
                .values()
                .find(|r| r.pending_request_id.as_deref() == Some(request_id))
            {
                return record.counterparty_id.clone();
            }
            if let Some(counterparty) = self.closed_requests.get(request_id) {
                return counterparty.clone();
            }
            let announces_own_request = matches!(
                event.kind,
                EventKind::FriendRequestSent | EventKind::FriendRequestReceived
            ) && event.from_user_id.as_deref() == Some(self.self_id.as_str());
            if announces_own_request {
                let mut unlinked = self
                    .records
                    .values()
                    .filter(|r| r.state == RelationshipState::RequestSent && r.pending_request_id.is_none());
                match (unlinked.next(), unlinked.next()) {
                    (Some(record), None) => return record.counterparty_id.clone(),
                    (Some(_), Some(_)) => {
                        tracing::debug!("Request {} matches several outgoing requests", request_id)
                    }
                    _ => {}
                }
            }
        }

        String::new()
    }

    fn role_for(&self, event: &Event, current: RelationshipState) -> Role {
        match event.from_user_id.as_deref() {
            Some(from) if from == self.self_id => return Role::Sender,
            Some(from) if !from.is_empty() && event.kind != EventKind::FriendRemoved => {
                return Role::Receiver
            }
            _ => {}
        }
        match (event.kind, current) {
            (EventKind::FriendRequestSent, _) => Role::Sender,
            (EventKind::FriendRequestReceived, _) => Role::Receiver,
            (_, RelationshipState::RequestSent) => Role::Sender,
            (_, RelationshipState::RequestReceived) => Role::Receiver,
            _ => Role::Unknown,
        }
    }

    /// Starts an optimistic local action.
    pub fn begin(&mut self, action: LocalAction, counterparty: &str) -> (PendingAction, Outcome) {
        let snapshot = self.records.get(counterparty).cloned();
        let (from, to) = if action.local_is_sender() {
            (self.self_id.clone(), counterparty.to_string())
        } else {
            (counterparty.to_string(), self.self_id.clone())
        };
        let event = Event::local(action.event_kind(), &from, &to);
        let outcome = self.apply(&event);

        let pending = PendingAction {
            action,
            counterparty: counterparty.to_string(),
            snapshot,
            optimistic: outcome.current,
        };
        (pending, outcome)
    }

    /// Finishes an optimistic action. On failure the snapshot is restored
    /// only if nothing else moved the relationship in the meantime.
    pub fn settle<T>(&mut self, pending: PendingAction, result: &SyncResult<T>) -> Option<Outcome> {
        if result.is_ok() {
            return None;
        }

        let current = self.state_of(&pending.counterparty);
        if current != pending.optimistic {
            tracing::debug!(
                "Not rolling back {:?} for {}: state moved to {}",
                pending.action,
                pending.counterparty,
                current
            );
            return None;
        }

        let restored = pending.snapshot.clone().unwrap_or_else(|| Relationship::new(&pending.counterparty));
        let previous_state = restored.state;
        self.records.insert(pending.counterparty.clone(), restored);
        tracing::info!(
            "Rolled back {:?} for {}: {} -> {}",
            pending.action,
            pending.counterparty,
            current,
            previous_state
        );

        Some(Outcome {
            counterparty: pending.counterparty,
            kind: pending.action.event_kind(),
            previous: current,
            current: previous_state,
            changed: current != previous_state,
            refresh: Vec::new(),
        })
    }

    pub fn apply_friends(&mut self, list: &[FriendSummary]) -> Vec<Outcome> {
        self.apply_list(ListKind::Friends, list)
    }

    pub fn apply_sent(&mut self, list: &[FriendSummary]) -> Vec<Outcome> {
        self.apply_list(ListKind::Sent, list)
    }

    pub fn apply_received(&mut self, list: &[FriendSummary]) -> Vec<Outcome> {
        self.apply_list(ListKind::Received, list)
    }

    /// Makes the records agree with an authoritative list: listed ids take
    /// the list's state, unlisted records in that state decay to `none`.
    pub fn apply_list(&mut self, kind: ListKind, list: &[FriendSummary]) -> Vec<Outcome> {
        let state = kind.state();
        let event_kind = list_event_kind(kind);
        let listed: HashSet<&str> = list.iter().map(|s| s.id.as_str()).collect();
        let mut outcomes = Vec::new();

        for summary in list {
            if summary.id.is_empty() || summary.id == self.self_id {
                continue;
            }
            self.profiles.insert(summary.id.clone(), summary.clone());
            let record = self
                .records
                .entry(summary.id.clone())
                .or_insert_with(|| Relationship::new(&summary.id));
            if record.state != state {
                let previous = record.state;
                record.state = state;
                record.updated_at = Utc::now();
                if !state.is_pending() {
                    if let Some(request_id) = record.pending_request_id.take() {
                        self.closed_requests.insert(request_id, summary.id.clone());
                    }
                }
                outcomes.push(Outcome {
                    counterparty: summary.id.clone(),
                    kind: event_kind,
                    previous,
                    current: state,
                    changed: true,
                    refresh: Vec::new(),
                });
            }
        }

        for record in self.records.values_mut() {
            if record.state == state && !listed.contains(record.counterparty_id.as_str()) {
                record.state = RelationshipState::None;
                if let Some(request_id) = record.pending_request_id.take() {
                    self.closed_requests.insert(request_id, record.counterparty_id.clone());
                }
                record.updated_at = Utc::now();
                outcomes.push(Outcome {
                    counterparty: record.counterparty_id.clone(),
                    kind: event_kind,
                    previous: state,
                    current: RelationshipState::None,
                    changed: true,
                    refresh: Vec::new(),
                });
            }
        }

        if !outcomes.is_empty() {
            tracing::info!("{:?} list reconciled {} relationship(s)", kind, outcomes.len());
        }
        outcomes
    }

    /// Registers a counterparty seen through a profile view.
    pub fn observe(&mut self, summary: FriendSummary) {
        if summary.id.is_empty() || summary.id == self.self_id {
            return;
        }
        self.records
            .entry(summary.id.clone())
            .or_insert_with(|| Relationship::new(&summary.id));
        self.profiles.insert(summary.id.clone(), summary);
    }

    pub fn get(&self, counterparty: &str) -> Option<&Relationship> {
        self.records.get(counterparty)
    }

    pub fn state_of(&self, counterparty: &str) -> RelationshipState {
        self.records
            .get(counterparty)
            .map(|r| r.state)
            .unwrap_or_default()
    }

    pub fn profile(&self, counterparty: &str) -> Option<&FriendSummary> {
        self.profiles.get(counterparty)
    }

    pub fn display_name(&self, counterparty: &str) -> String {
        self.profiles
            .get(counterparty)
            .map(FriendSummary::display_name)
            .unwrap_or_else(|| counterparty.to_string())
    }

    pub fn friends(&self) -> Vec<FriendSummary> {
        self.in_state(RelationshipState::Friends)
    }

    pub fn sent_requests(&self) -> Vec<FriendSummary> {
        self.in_state(RelationshipState::RequestSent)
    }

    pub fn received_requests(&self) -> Vec<FriendSummary> {
        self.in_state(RelationshipState::RequestReceived)
    }

    fn in_state(&self, state: RelationshipState) -> Vec<FriendSummary> {
        let mut out: Vec<FriendSummary> = self
            .records
            .values()
            .filter(|r| r.state == state)
            .map(|r| {
                self.profiles.get(&r.counterparty_id).cloned().unwrap_or_else(|| FriendSummary {
                    id: r.counterparty_id.clone(),
                    ..Default::default()
                })
            })
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }
}

/// Next state for `kind` seen from `role` while in `current`; `None`
/// means the event is stale and must be ignored.
fn transition(kind: EventKind, role: Role, current: RelationshipState) -> Option<RelationshipState> {
    match kind {
        EventKind::FriendRequestSent | EventKind::FriendRequestReceived => {
            let (own, opposite) = match role {
                Role::Receiver => (RelationshipState::RequestReceived, RelationshipState::RequestSent),
                _ => (RelationshipState::RequestSent, RelationshipState::RequestReceived),
            };
            if current == RelationshipState::None || current == own {
                Some(own)
            } else if current == opposite {
                // Mutual requests collapse to friends.
                Some(RelationshipState::Friends)
            } else {
                None
            }
        }
        EventKind::FriendRequestAccepted => Some(RelationshipState::Friends),
        EventKind::FriendRequestRejected | EventKind::FriendRequestCanceled => {
            if current == RelationshipState::Friends {
                None
            } else {
                Some(RelationshipState::None)
            }
        }
        EventKind::FriendRemoved => Some(RelationshipState::None),
        _ => None,
    }
}

fn refresh_lists(kind: EventKind, role: Role) -> Vec<ListKind> {
    let pending = match role {
        Role::Sender => vec![ListKind::Sent],
        Role::Receiver => vec![ListKind::Received],
        Role::Unknown => vec![ListKind::Sent, ListKind::Received],
    };
    match kind {
        EventKind::FriendRequestSent | EventKind::FriendRequestReceived => pending,
        EventKind::FriendRequestAccepted => {
            let mut lists = vec![ListKind::Friends];
            lists.extend(pending);
            lists
        }
        EventKind::FriendRequestRejected | EventKind::FriendRequestCanceled => pending,
        EventKind::FriendRemoved => vec![ListKind::Friends, ListKind::Sent, ListKind::Received],
        _ => Vec::new(),
    }
}

fn list_event_kind(kind: ListKind) -> EventKind {
    match kind {
        ListKind::Friends => EventKind::FriendRequestAccepted,
        ListKind::Sent => EventKind::FriendRequestSent,
        ListKind::Received => EventKind::FriendRequestReceived,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::{json, Map, Value};
    use sync_core::SyncError;

    fn event(kind: EventKind, id: &str, from: Option<&str>, to: Option<&str>, payload: Value) -> Event {
        let payload: Map<String, Value> = match payload {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        Event {
            id: id.to_string(),
            kind,
            from_user_id: from.map(str::to_string),
            to_user_id: to.map(str::to_string),
            group_id: None,
            timestamp: Utc::now(),
            payload,
        }
    }

    fn summary(id: &str) -> FriendSummary {
        FriendSummary {
            id: id.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_request_sent_from_both_sides() {
        let mut alice = RelationshipReconciler::new("alice");
        let mut bob = RelationshipReconciler::new("bob");
        let sent = event(EventKind::FriendRequestSent, "e1", Some("alice"), Some("bob"), json!({"requestId": "r1"}));
        let received = event(EventKind::FriendRequestReceived, "e2", Some("alice"), None, json!({"requestId": "r1"}));

        let outcome = alice.apply(&sent);
        assert_eq!(outcome.counterparty, "bob");
        assert_eq!(outcome.current, RelationshipState::RequestSent);
        assert_eq!(outcome.refresh, vec![ListKind::Sent]);
        assert_eq!(alice.get("bob").unwrap().pending_request_id.as_deref(), Some("r1"));

        let outcome = bob.apply(&received);
        assert_eq!(outcome.counterparty, "alice");
        assert_eq!(outcome.current, RelationshipState::RequestReceived);
        assert_eq!(outcome.refresh, vec![ListKind::Received]);
    }

    #[test]
    fn test_accept_is_idempotent() {
        let mut bob = RelationshipReconciler::new("bob");
        bob.apply(&event(EventKind::FriendRequestReceived, "e1", Some("alice"), None, json!({"requestId": "r1"})));
        let accepted = event(EventKind::FriendRequestAccepted, "e2", Some("alice"), Some("bob"), json!({"requestId": "r1"}));

        let first = bob.apply(&accepted);
        assert!(first.changed);
        assert_eq!(first.current, RelationshipState::Friends);

        let second = bob.apply(&accepted);
        assert!(!second.changed);
        assert_eq!(second.current, RelationshipState::Friends);
        assert_eq!(second.refresh, first.refresh);
        assert_eq!(bob.get("alice").unwrap().pending_request_id, None);
    }

    #[test]
    fn test_local_accept_and_server_echo_converge_in_either_order() {
        let accepted = event(EventKind::FriendRequestAccepted, "srv-9", None, None, json!({"requestId": "r1"}));
        let received = event(EventKind::FriendRequestReceived, "e1", Some("alice"), None, json!({"requestId": "r1"}));

        // Local accept settles first, then the server echo arrives.
        let mut bob = RelationshipReconciler::new("bob");
        bob.apply(&received);
        let (pending, _) = bob.begin(LocalAction::Accept, "alice");
        assert!(bob.settle(pending, &Ok::<(), SyncError>(())).is_none());
        bob.apply(&accepted);
        let first = bob.get("alice").unwrap().clone();

        // Server echo first, then the local accept settles.
        let mut bob2 = RelationshipReconciler::new("bob");
        bob2.apply(&received);
        bob2.apply(&accepted);
        let (pending, outcome) = bob2.begin(LocalAction::Accept, "alice");
        assert!(!outcome.changed);
        bob2.settle(pending, &Ok::<(), SyncError>(()));
        let second = bob2.get("alice").unwrap().clone();

        assert_eq!(first.state, RelationshipState::Friends);
        assert_eq!(second.state, RelationshipState::Friends);
        assert_eq!(first.pending_request_id, None);
        assert_eq!(second.pending_request_id, None);
    }

    #[test]
    fn test_accept_resolved_through_request_id() {
        let mut alice = RelationshipReconciler::new("alice");
        alice.apply(&event(EventKind::FriendRequestSent, "e1", Some("alice"), Some("bob"), json!({"requestId": "r1"})));

        let outcome = alice.apply(&event(EventKind::FriendRequestAccepted, "e2", None, None, json!({"requestId": "r1"})));
        assert_eq!(outcome.counterparty, "bob");
        assert_eq!(outcome.current, RelationshipState::Friends);
        assert_eq!(outcome.refresh, vec![ListKind::Friends, ListKind::Sent]);
    }

    #[test]
    fn test_own_request_linked_from_id_only_frames() {
        let mut alice = RelationshipReconciler::new("alice");
        alice.begin(LocalAction::SendRequest, "bob");
        assert_eq!(alice.get("bob").unwrap().pending_request_id, None);

        let sent = event(EventKind::FriendRequestSent, "e1", Some("alice"), None, json!({"requestId": "r1"}));
        let outcome = alice.apply(&sent);
        assert_eq!(outcome.counterparty, "bob");
        assert_eq!(outcome.current, RelationshipState::RequestSent);
        assert_eq!(alice.get("bob").unwrap().pending_request_id.as_deref(), Some("r1"));

        let accepted = event(EventKind::FriendRequestAccepted, "e2", None, None, json!({"requestId": "r1"}));
        let outcome = alice.apply(&accepted);
        assert_eq!(outcome.counterparty, "bob");
        assert_eq!(outcome.previous, RelationshipState::RequestSent);
        assert_eq!(outcome.current, RelationshipState::Friends);
        assert_eq!(alice.get("bob").unwrap().pending_request_id, None);
    }

    #[test]
    fn test_own_request_ambiguous_link_is_left_to_refresh() {
        let mut alice = RelationshipReconciler::new("alice");
        alice.begin(LocalAction::SendRequest, "bob");
        alice.begin(LocalAction::SendRequest, "carol");

        let sent = event(EventKind::FriendRequestSent, "e1", Some("alice"), None, json!({"requestId": "r1"}));
        let outcome = alice.apply(&sent);
        assert!(!outcome.is_resolved());
        assert!(outcome.refresh.contains(&ListKind::Sent));
        assert_eq!(alice.get("bob").unwrap().pending_request_id, None);
        assert_eq!(alice.get("carol").unwrap().pending_request_id, None);
    }

    #[test]
    fn test_id_only_reject_and_cancel() {
        let mut alice = RelationshipReconciler::new("alice");
        alice.begin(LocalAction::SendRequest, "bob");
        alice.apply(&event(EventKind::FriendRequestSent, "e1", Some("alice"), None, json!({"requestId": "r1"})));
        let outcome = alice.apply(&event(EventKind::FriendRequestRejected, "e2", None, None, json!({"requestId": "r1"})));
        assert_eq!(outcome.counterparty, "bob");
        assert_eq!(outcome.previous, RelationshipState::RequestSent);
        assert_eq!(alice.state_of("bob"), RelationshipState::None);

        let mut bob = RelationshipReconciler::new("bob");
        bob.apply(&event(EventKind::FriendRequestReceived, "e3", Some("carol"), None, json!({"requestId": "r2"})));
        let outcome = bob.apply(&event(EventKind::FriendRequestCanceled, "e4", None, None, json!({"requestId": "r2"})));
        assert_eq!(outcome.counterparty, "carol");
        assert_eq!(outcome.previous, RelationshipState::RequestReceived);
        assert_eq!(outcome.refresh, vec![ListKind::Received]);
        assert_eq!(bob.state_of("carol"), RelationshipState::None);
    }

    #[test]
    fn test_echo_of_settled_request_resolves_as_no_op() {
        let mut bob = RelationshipReconciler::new("bob");
        bob.apply(&event(EventKind::FriendRequestReceived, "e1", Some("alice"), None, json!({"requestId": "r1"})));
        bob.begin(LocalAction::Accept, "alice");

        let echo = event(EventKind::FriendRequestAccepted, "e2", None, None, json!({"requestId": "r1"}));
        let outcome = bob.apply(&echo);
        assert_eq!(outcome.counterparty, "alice");
        assert!(!outcome.changed);
        assert_eq!(outcome.current, RelationshipState::Friends);
    }

    #[test]
    fn test_removed_naming_only_self_is_unresolved() {
        let mut bob = RelationshipReconciler::new("bob");
        bob.apply_friends(&[summary("alice")]);

        let outcome = bob.apply(&event(EventKind::FriendRemoved, "e1", None, None, json!({"friendId": "bob"})));
        assert!(!outcome.is_resolved());
        assert_eq!(outcome.refresh, vec![ListKind::Friends, ListKind::Sent, ListKind::Received]);
        assert_eq!(bob.state_of("alice"), RelationshipState::Friends);
    }

    #[test]
    fn test_removed_falls_back_to_sender() {
        let mut bob = RelationshipReconciler::new("bob");
        bob.apply_friends(&[summary("alice")]);

        let outcome = bob.apply(&event(EventKind::FriendRemoved, "e1", Some("alice"), None, json!({})));
        assert_eq!(outcome.counterparty, "alice");
        assert_eq!(outcome.previous, RelationshipState::Friends);
        assert_eq!(outcome.current, RelationshipState::None);
        assert_eq!(outcome.refresh, vec![ListKind::Friends, ListKind::Sent, ListKind::Received]);
    }

    #[test]
    fn test_removed_prefers_friend_id() {
        let mut bob = RelationshipReconciler::new("bob");
        bob.apply_friends(&[summary("alice")]);
        let outcome = bob.apply(&event(EventKind::FriendRemoved, "e1", None, None, json!({"friendId": "alice"})));
        assert_eq!(outcome.counterparty, "alice");
        assert_eq!(bob.state_of("alice"), RelationshipState::None);
    }

    #[test]
    fn test_unresolved_counterparty_only_refreshes() {
        let mut bob = RelationshipReconciler::new("bob");
        let outcome = bob.apply(&event(EventKind::FriendRequestCanceled, "e1", Some("bob"), None, json!({"requestId": "nope"})));
        assert!(!outcome.is_resolved());
        assert!(!outcome.changed);
        assert_eq!(outcome.refresh, vec![ListKind::Sent, ListKind::Received]);
        assert!(bob.friends().is_empty());
    }

    #[test]
    fn test_mutual_requests_collapse_to_friends() {
        let mut alice = RelationshipReconciler::new("alice");
        alice.apply(&event(EventKind::FriendRequestReceived, "e1", Some("bob"), None, json!({})));
        let outcome = alice.apply(&event(EventKind::FriendRequestSent, "e2", Some("alice"), Some("bob"), json!({})));
        assert_eq!(outcome.current, RelationshipState::Friends);
    }

    #[test]
    fn test_stale_reject_does_not_unfriend() {
        let mut alice = RelationshipReconciler::new("alice");
        alice.apply_friends(&[summary("bob")]);
        let outcome = alice.apply(&event(EventKind::FriendRequestRejected, "e1", Some("alice"), Some("bob"), json!({})));
        assert!(!outcome.changed);
        assert_eq!(alice.state_of("bob"), RelationshipState::Friends);
    }

    #[test]
    fn test_failed_request_rolls_back() {
        let mut alice = RelationshipReconciler::new("alice");
        let (pending, outcome) = alice.begin(LocalAction::SendRequest, "bob");
        assert_eq!(outcome.current, RelationshipState::RequestSent);

        let failure: SyncResult<()> = Err(SyncError::Rejected {
            status: 400,
            message: "Friend request already sent".to_string(),
        });
        let rollback = alice.settle(pending, &failure).unwrap();
        assert_eq!(rollback.current, RelationshipState::None);
        assert_eq!(alice.state_of("bob"), RelationshipState::None);
    }

    #[test]
    fn test_failed_action_does_not_override_newer_event() {
        let mut alice = RelationshipReconciler::new("alice");
        let (pending, _) = alice.begin(LocalAction::SendRequest, "bob");
        alice.apply(&event(EventKind::FriendRequestAccepted, "e1", Some("alice"), Some("bob"), json!({})));

        let failure: SyncResult<()> = Err(SyncError::Transport("timeout".to_string()));
        assert!(alice.settle(pending, &failure).is_none());
        assert_eq!(alice.state_of("bob"), RelationshipState::Friends);
    }

    #[test]
    fn test_authoritative_list_decays_missing_entries() {
        let mut alice = RelationshipReconciler::new("alice");
        alice.apply_sent(&[summary("bob"), summary("carol")]);
        assert_eq!(alice.sent_requests().len(), 2);

        let outcomes = alice.apply_sent(&[summary("carol")]);
        assert_eq!(outcomes.len(), 1);
        assert_eq!(outcomes[0].counterparty, "bob");
        assert_eq!(alice.state_of("bob"), RelationshipState::None);
        assert_eq!(alice.state_of("carol"), RelationshipState::RequestSent);

        assert!(alice.apply_sent(&[summary("carol")]).is_empty());
    }

    #[test]
    fn test_profile_summary_cached_from_event() {
        let mut bob = RelationshipReconciler::new("bob");
        bob.apply(&event(
            EventKind::FriendRequestReceived,
            "e1",
            Some("alice"),
            None,
            json!({"firstName": "Alice", "lastName": "Martin"}),
        ));
        assert_eq!(bob.display_name("alice"), "Alice Martin");
        assert_eq!(bob.received_requests()[0].first_name, "Alice");
    }
}
