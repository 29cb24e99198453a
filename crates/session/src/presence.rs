// Presence registry: the local projection of remote awareness states.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use tokio::time::Instant;
use yrs::sync::Awareness;

use tandem_common::presence::PresenceState;

/// Presence of one remote replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceEntry {
    pub replica_id: u64,
    pub state: PresenceState,
    /// When this replica's state was last received.
    pub received_at: Instant,
}

/// Remote presence keyed by replica id. The local replica is never stored.
#[derive(Debug)]
pub struct PresenceRegistry {
    local_replica: u64,
    entries: BTreeMap<u64, PresenceEntry>,
}

impl PresenceRegistry {
    pub fn new(local_replica: u64) -> Self {
        Self { local_replica, entries: BTreeMap::new() }
    }

    /// Insert or refresh an entry. Returns whether the stored state changed.
    pub fn upsert(&mut self, replica_id: u64, state: PresenceState, now: Instant) -> bool {
        if replica_id == self.local_replica {
            return false;
        }
        match self.entries.get_mut(&replica_id) {
            Some(entry) => {
                entry.received_at = now;
                if entry.state == state {
                    return false;
                }
                entry.state = state;
                true
            }
            None => {
                self.entries.insert(replica_id, PresenceEntry { replica_id, state, received_at: now });
                true
            }
        }
    }

    pub fn remove(&mut self, replica_id: u64) -> bool {
        self.entries.remove(&replica_id).is_some()
    }

    /// Drop every entry. Returns whether anything was removed.
    pub fn clear(&mut self) -> bool {
        let had_entries = !self.entries.is_empty();
        self.entries.clear();
        had_entries
    }

    /// Remove entries not refreshed within `stale_after` of `now`.
    pub fn evict_stale(&mut self, now: Instant, stale_after: Duration) -> Vec<u64> {
        let stale: Vec<u64> = self
            .entries
            .values()
            .filter(|entry| now.saturating_duration_since(entry.received_at) > stale_after)
            .map(|entry| entry.replica_id)
            .collect();
        for replica_id in &stale {
            self.entries.remove(replica_id);
        }
        stale
    }

    /// Re-read `clients` from the awareness state. Clients whose state is
    /// null, unparsable or missing are removed.
    pub fn project(
        &mut self,
        awareness: &Awareness,
        clients: impl IntoIterator<Item = u64>,
        now: Instant,
    ) -> bool {
        let mut current: HashMap<u64, PresenceState> = awareness
            .iter()
            .filter_map(|(client_id, state)| {
                let raw = state.data?;
                Some((client_id, PresenceState::from_json(raw.as_ref())?))
            })
            .collect();

        let mut changed = false;
        for client_id in clients {
            changed |= match current.remove(&client_id) {
                Some(state) => self.upsert(client_id, state, now),
                None => self.remove(client_id),
            };
        }
        changed
    }

    pub fn get(&self, replica_id: u64) -> Option<&PresenceEntry> {
        self.entries.get(&replica_id)
    }

    /// All entries, ordered by replica id.
    pub fn snapshot(&self) -> Vec<PresenceEntry> {
        self.entries.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tandem_common::presence::{CursorRange, PresenceUser};
    use yrs::{Doc, Options};

    fn state(id: &str) -> PresenceState {
        PresenceState::new(PresenceUser { id: id.into(), name: id.to_uppercase(), color: "#fff".into() })
    }

    fn awareness_with_client_id(client_id: u64) -> Awareness {
        let options = Options { client_id, ..Default::default() };
        Awareness::new(Doc::with_options(options))
    }

    #[test]
    fn local_replica_is_never_stored() {
        let mut registry = PresenceRegistry::new(1);
        assert!(!registry.upsert(1, state("me"), Instant::now()));
        assert!(registry.is_empty());
    }

    #[test]
    fn upsert_reports_only_real_changes() {
        let mut registry = PresenceRegistry::new(1);
        let now = Instant::now();
        assert!(registry.upsert(2, state("bob"), now));
        assert!(!registry.upsert(2, state("bob"), now));

        let mut moved = state("bob");
        moved.cursor = Some(CursorRange::caret(3));
        assert!(registry.upsert(2, moved.clone(), now));
        assert_eq!(registry.get(2).map(|e| &e.state), Some(&moved));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_entries_are_evicted() {
        let mut registry = PresenceRegistry::new(1);
        registry.upsert(2, state("bob"), Instant::now());
        tokio::time::advance(Duration::from_secs(60)).await;
        registry.upsert(3, state("cat"), Instant::now());
        tokio::time::advance(Duration::from_secs(40)).await;

        let evicted = registry.evict_stale(Instant::now(), Duration::from_secs(90));
        assert_eq!(evicted, vec![2]);
        assert_eq!(registry.snapshot().iter().map(|e| e.replica_id).collect::<Vec<_>>(), vec![3]);
    }

    #[test]
    fn snapshot_is_ordered_by_replica() {
        let mut registry = PresenceRegistry::new(1);
        let now = Instant::now();
        registry.upsert(9, state("z"), now);
        registry.upsert(4, state("y"), now);
        let ids: Vec<u64> = registry.snapshot().iter().map(|e| e.replica_id).collect();
        assert_eq!(ids, vec![4, 9]);
        assert!(registry.clear());
        assert!(!registry.clear());
    }

    #[test]
    fn projection_follows_awareness_states() {
        let local = awareness_with_client_id(1);
        let remote = awareness_with_client_id(2);
        remote.set_local_state(&state("bob")).unwrap();
        local.apply_update(remote.update().unwrap()).unwrap();
        local.set_local_state(&state("me")).unwrap();

        let mut registry = PresenceRegistry::new(1);
        assert!(registry.project(&local, [1, 2], Instant::now()));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(2).map(|e| e.state.user.id.as_str()), Some("bob"));

        remote.clean_local_state();
        local.apply_update(remote.update().unwrap()).unwrap();
        assert!(registry.project(&local, [2], Instant::now()));
        assert!(registry.is_empty());
    }
}
