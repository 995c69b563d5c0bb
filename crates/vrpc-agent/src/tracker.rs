//! Per-client instance tracking
//!
//! Correlates instances with the clients that own or use them. Anonymous
//! instances live and die with their single creating client; named
//! instances may be used by many clients and survive them all. The two
//! maps are kept separate so "no instances of this kind" stays a cheap
//! lookup; a client counts as tracked while it appears in either map.

use std::collections::{HashMap, HashSet};

/// Client-to-instance correlation tables.
#[derive(Debug, Default)]
pub struct ClientTracker {
    anonymous: HashMap<String, HashSet<String>>,
    named: HashMap<String, HashSet<String>>,
}

impl ClientTracker {
    /// Create an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether the client appears in either map.
    pub fn is_tracked(&self, client_id: &str) -> bool {
        self.anonymous.contains_key(client_id) || self.named.contains_key(client_id)
    }

    /// Record an anonymous instance owned by `client_id`.
    ///
    /// Returns `true` when this makes the client newly tracked, i.e. its
    /// presence topic needs a subscription.
    pub fn track_anonymous(&mut self, client_id: &str, instance_id: &str) -> bool {
        let newly_tracked = !self.is_tracked(client_id);
        self.anonymous
            .entry(client_id.to_string())
            .or_default()
            .insert(instance_id.to_string());
        newly_tracked
    }

    /// Record a named instance used by `client_id`.
    ///
    /// Returns `true` when this makes the client newly tracked.
    pub fn track_named(&mut self, client_id: &str, instance_id: &str) -> bool {
        let newly_tracked = !self.is_tracked(client_id);
        self.named
            .entry(client_id.to_string())
            .or_default()
            .insert(instance_id.to_string());
        newly_tracked
    }

    /// Remove an instance from every client that maps to it.
    ///
    /// Returns the clients that are no longer tracked at all, i.e. whose
    /// presence subscriptions must be released.
    pub fn untrack_instance(&mut self, instance_id: &str) -> Vec<String> {
        let mut emptied = Vec::new();
        for map in [&mut self.anonymous, &mut self.named] {
            map.retain(|client_id, instances| {
                instances.remove(instance_id);
                if instances.is_empty() {
                    emptied.push(client_id.clone());
                    false
                } else {
                    true
                }
            });
        }
        let mut released: Vec<String> = emptied
            .into_iter()
            .filter(|client_id| !self.is_tracked(client_id))
            .collect();
        released.sort();
        released.dedup();
        released
    }

    /// Forget a client entirely.
    ///
    /// Returns its anonymous instances (in deterministic order, ready for
    /// deletion) and whether the client was tracked at all.
    pub fn remove_client(&mut self, client_id: &str) -> (Vec<String>, bool) {
        let anonymous = self.anonymous.remove(client_id);
        let had_named = self.named.remove(client_id).is_some();
        let was_tracked = anonymous.is_some() || had_named;
        let mut instances: Vec<String> = anonymous.unwrap_or_default().into_iter().collect();
        instances.sort();
        (instances, was_tracked)
    }

    /// The client owning an anonymous instance, if any.
    pub fn owner_of_anonymous(&self, instance_id: &str) -> Option<&str> {
        self.anonymous
            .iter()
            .find(|(_, instances)| instances.contains(instance_id))
            .map(|(client_id, _)| client_id.as_str())
    }

    /// Every tracked client, in deterministic order.
    pub fn tracked_clients(&self) -> Vec<&str> {
        let mut clients: Vec<&str> = self
            .anonymous
            .keys()
            .chain(self.named.keys())
            .map(String::as_str)
            .collect();
        clients.sort();
        clients.dedup();
        clients
    }
}
