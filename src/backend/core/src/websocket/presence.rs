//! Per-user online status.
//!
//! A user is online while at least one of their connections is live. Only the
//! first connect and the last disconnect change the status, so a second
//! device opening or closing does not flap it.
//!
//! Transitions hand control to a callback while the tracker lock is still
//! held. Announcements made from that callback therefore reach every queue in
//! the same order as the transitions themselves. The tracker lock is always
//! taken before the registry lock, never after.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};

use crate::UserId;

/// Status of a user as seen by the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceState {
    /// Never connected
    Unknown,
    Online,
    Offline,
}

#[derive(Debug, Clone, Copy, Default)]
struct PresenceEntry {
    live_connections: usize,
    online: bool,
}

/// Tracks which users are online.
#[derive(Debug, Default)]
pub struct PresenceTracker {
    entries: Mutex<HashMap<UserId, PresenceEntry>>,
}

impl PresenceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count a new connection for `user_id`. Returns true when the user just
    /// came online, after running `on_online` with the new online count.
    ///
    /// User id 0 marks an anonymous connection and is never tracked.
    pub fn connect<F>(&self, user_id: UserId, on_online: F) -> bool
    where
        F: FnOnce(usize),
    {
        if user_id == 0 {
            return false;
        }
        let mut entries = self.entries.lock();
        entries.entry(user_id).or_default().live_connections += 1;
        Self::set_online(&mut entries, user_id, true, on_online)
    }

    /// Release a connection for `user_id`. Returns true when the user just
    /// went offline, after running `on_offline` with the new online count.
    pub fn disconnect<F>(&self, user_id: UserId, on_offline: F) -> bool
    where
        F: FnOnce(usize),
    {
        if user_id == 0 {
            return false;
        }
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(&user_id) else {
            return false;
        };
        entry.live_connections = entry.live_connections.saturating_sub(1);
        if entry.live_connections > 0 {
            return false;
        }
        Self::set_online(&mut entries, user_id, false, on_offline)
    }

    // Caller holds the lock. Runs `on_change` only when the flag flips.
    fn set_online<F>(
        entries: &mut HashMap<UserId, PresenceEntry>,
        user_id: UserId,
        online: bool,
        on_change: F,
    ) -> bool
    where
        F: FnOnce(usize),
    {
        let entry = entries.entry(user_id).or_default();
        if entry.online == online {
            return false;
        }
        entry.online = online;

        on_change(Self::count_online(entries));
        true
    }

    pub fn state(&self, user_id: UserId) -> PresenceState {
        match self.entries.lock().get(&user_id) {
            None => PresenceState::Unknown,
            Some(e) if e.online => PresenceState::Online,
            Some(_) => PresenceState::Offline,
        }
    }

    /// Whether a user is online. Unknown users are offline.
    pub fn is_online(&self, user_id: UserId) -> bool {
        self.state(user_id) == PresenceState::Online
    }

    /// Status of every user that has ever connected, keyed by id.
    pub fn snapshot(&self) -> BTreeMap<UserId, bool> {
        self.entries
            .lock()
            .iter()
            .map(|(id, e)| (*id, e.online))
            .collect()
    }

    pub fn online_count(&self) -> usize {
        Self::count_online(&self.entries.lock())
    }

    fn count_online(entries: &HashMap<UserId, PresenceEntry>) -> usize {
        entries.values().filter(|e| e.online).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn connect(presence: &PresenceTracker, user_id: UserId) -> bool {
        presence.connect(user_id, |_| {})
    }

    fn disconnect(presence: &PresenceTracker, user_id: UserId) -> bool {
        presence.disconnect(user_id, |_| {})
    }

    #[test]
    fn test_unknown_user_is_offline() {
        let presence = PresenceTracker::new();
        assert_eq!(presence.state(42), PresenceState::Unknown);
        assert!(!presence.is_online(42));
        assert!(presence.snapshot().is_empty());
        assert!(!disconnect(&presence, 42));
    }

    #[test]
    fn test_single_connection_transitions() {
        let presence = PresenceTracker::new();
        assert!(connect(&presence, 1));
        assert_eq!(presence.state(1), PresenceState::Online);

        assert!(disconnect(&presence, 1));
        assert_eq!(presence.state(1), PresenceState::Offline);

        assert!(connect(&presence, 1));
        assert!(presence.is_online(1));
    }

    #[test]
    fn test_multi_device_stays_online_until_last_disconnect() {
        let presence = PresenceTracker::new();
        assert!(connect(&presence, 5));
        assert!(!connect(&presence, 5));

        assert!(!disconnect(&presence, 5));
        assert!(presence.is_online(5));

        assert!(disconnect(&presence, 5));
        assert!(!presence.is_online(5));
        assert!(!disconnect(&presence, 5));
    }

    #[test]
    fn test_callback_runs_only_on_transition() {
        let presence = PresenceTracker::new();
        let calls = Cell::new(Vec::new());
        let record = |count: usize| {
            let mut seen = calls.take();
            seen.push(count);
            calls.set(seen);
        };

        presence.connect(1, record);
        presence.connect(1, record);
        presence.connect(2, record);
        presence.disconnect(1, record);
        presence.disconnect(1, record);

        assert_eq!(calls.take(), vec![1, 2, 1]);
    }

    #[test]
    fn test_anonymous_user_is_ignored() {
        let presence = PresenceTracker::new();
        assert!(!presence.connect(0, |_| panic!("anonymous users have no presence")));
        assert_eq!(presence.state(0), PresenceState::Unknown);
        assert!(presence.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_includes_offline_users() {
        let presence = PresenceTracker::new();
        for user_id in [9, 3, 7] {
            connect(&presence, user_id);
        }
        disconnect(&presence, 7);

        let snapshot: Vec<(UserId, bool)> = presence.snapshot().into_iter().collect();
        assert_eq!(snapshot, vec![(3, true), (7, false), (9, true)]);
        assert_eq!(presence.online_count(), 2);
    }
}
