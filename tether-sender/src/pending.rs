//! Table of requests awaiting a server response.

use std::collections::{BTreeMap, VecDeque};

use crate::errors::InvocationError;
use crate::request::RequestState;

/// How many recently sent acknowledgement states are remembered so that a
/// `bad_server_salt` pointing at one of them can still be resent.
const LAST_ACKS: usize = 10;

/// Maps assigned message ids to their in-flight [`RequestState`].
///
/// Keys are message ids, which are monotonic, so iteration and [`drain`]
/// naturally preserve send order; reconnect re-queuing relies on that.
///
/// [`drain`]: PendingTable::drain
#[derive(Default)]
pub struct PendingTable {
    entries: BTreeMap<i64, RequestState>,
    last_acks: VecDeque<RequestState>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, state: RequestState) {
        self.purge_aborted();
        self.entries.insert(state.msg_id, state);
    }

    /// Drop entries whose caller aborted after transmission. Their response,
    /// if the server still sends one, is discarded as unmatched.
    fn purge_aborted(&mut self) {
        self.entries.retain(|_, state| {
            if state.is_aborted() {
                state.resolve(Err(InvocationError::Aborted));
                false
            } else {
                true
            }
        });
    }

    pub fn take(&mut self, msg_id: i64) -> Option<RequestState> {
        self.entries.remove(&msg_id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Remove and return every entry, oldest message id first.
    pub fn drain(&mut self) -> Vec<RequestState> {
        let entries = std::mem::take(&mut self.entries);
        entries.into_values().collect()
    }

    /// Remember a fire-and-forget acknowledgement we just sent.
    pub fn note_ack(&mut self, state: RequestState) {
        if self.last_acks.len() == LAST_ACKS {
            self.last_acks.pop_front();
        }
        self.last_acks.push_back(state);
    }

    /// Pop every request the server is pointing at with `msg_id`.
    ///
    /// Matches the id directly, then as a container id for batched sends,
    /// and finally against the recently-sent acks for fire-and-forget
    /// messages that were never tracked here.
    pub fn pop_states(&mut self, msg_id: i64) -> Vec<RequestState> {
        self.purge_aborted();
        if let Some(state) = self.entries.remove(&msg_id) {
            return vec![state];
        }

        let contained: Vec<i64> = self
            .entries
            .iter()
            .filter(|(_, s)| s.container_id == Some(msg_id))
            .map(|(id, _)| *id)
            .collect();
        if !contained.is_empty() {
            return contained
                .into_iter()
                .filter_map(|id| self.entries.remove(&id))
                .collect();
        }

        if let Some(pos) = self
            .last_acks
            .iter()
            .position(|s| s.msg_id == msg_id || s.container_id == Some(msg_id))
        {
            return vec![self.last_acks.remove(pos).unwrap()];
        }

        Vec::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(msg_id: i64, container_id: Option<i64>) -> RequestState {
        let mut s = RequestState::detached(vec![0; 4], true);
        s.msg_id = msg_id;
        s.container_id = container_id;
        s
    }

    #[test]
    fn pop_by_direct_msg_id() {
        let mut table = PendingTable::new();
        table.insert(state(10, None));
        table.insert(state(14, None));

        let popped = table.pop_states(10);
        assert_eq!(popped.len(), 1);
        assert_eq!(popped[0].msg_id, 10);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn pop_by_container_id_takes_all_members() {
        let mut table = PendingTable::new();
        table.insert(state(10, Some(100)));
        table.insert(state(14, Some(100)));
        table.insert(state(18, None));

        let mut popped = table.pop_states(100);
        popped.sort_by_key(|s| s.msg_id);
        assert_eq!(popped.iter().map(|s| s.msg_id).collect::<Vec<_>>(), [10, 14]);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn pop_falls_back_to_last_acks() {
        let mut table = PendingTable::new();
        table.note_ack(state(42, None));

        assert_eq!(table.pop_states(42).len(), 1);
        assert!(table.pop_states(42).is_empty());
    }

    #[test]
    fn last_acks_ring_is_bounded() {
        let mut table = PendingTable::new();
        for i in 0..(LAST_ACKS as i64 + 5) {
            table.note_ack(state(i, None));
        }
        assert!(table.pop_states(0).is_empty());
        assert_eq!(table.pop_states(5).len(), 1);
    }

    #[test]
    fn aborted_entry_is_purged_on_next_touch() {
        let token = tokio_util::sync::CancellationToken::new();
        let (tx, mut rx) = tokio::sync::oneshot::channel();
        let mut aborted = RequestState::new(vec![0; 4], tx, Some(token.clone()));
        aborted.msg_id = 10;

        let mut table = PendingTable::new();
        table.insert(aborted);
        token.cancel();

        table.insert(state(14, None));
        assert_eq!(table.len(), 1);
        assert!(table.take(10).is_none());
        assert!(matches!(
            rx.try_recv().unwrap(),
            Err(InvocationError::Aborted)
        ));
    }

    #[test]
    fn drain_is_ordered_by_msg_id() {
        let mut table = PendingTable::new();
        table.insert(state(30, None));
        table.insert(state(10, None));
        table.insert(state(20, None));

        let ids: Vec<i64> = table.drain().iter().map(|s| s.msg_id).collect();
        assert_eq!(ids, [10, 20, 30]);
        assert!(table.is_empty());
    }
}
