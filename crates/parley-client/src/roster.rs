use std::collections::BTreeMap;

use parley_shared::types::{PresenceStatus, RosterEntry, UserId};
use tracing::debug;

/// Local view of the user's contacts and their presence.
#[derive(Debug, Default)]
pub struct Roster {
    entries: BTreeMap<UserId, PresenceStatus>,
}

impl Roster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the user was already present.
    pub fn add(&mut self, user: &UserId) -> bool {
        if self.entries.contains_key(user) {
            debug!(user = %user, "Roster already contains user");
            return false;
        }
        self.entries.insert(user.clone(), PresenceStatus::Unknown);
        true
    }

    /// Returns false if the user was not present.
    pub fn remove(&mut self, user: &UserId) -> bool {
        if self.entries.remove(user).is_none() {
            debug!(user = %user, "Roster does not contain user");
            return false;
        }
        true
    }

    /// Presence of users outside the roster is ignored.
    pub fn presence(&mut self, user: &UserId, status: PresenceStatus) -> bool {
        match self.entries.get_mut(user) {
            Some(current) => {
                *current = status;
                true
            }
            None => false,
        }
    }

    pub fn replace(&mut self, entries: &[RosterEntry]) {
        self.entries = entries
            .iter()
            .map(|e| (e.user.clone(), e.status))
            .collect();
    }

    pub fn status(&self, user: &UserId) -> Option<PresenceStatus> {
        self.entries.get(user).copied()
    }

    pub fn entries(&self) -> Vec<RosterEntry> {
        self.entries
            .iter()
            .map(|(user, status)| RosterEntry {
                user: user.clone(),
                status: *status,
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
