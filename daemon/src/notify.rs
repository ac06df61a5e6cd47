//! The notification registry. Tracks which client subscribed to which
//! key and under which registration msgid, with a reverse mapping so
//! unregistration and client teardown stay cheap.

use buxton::key::Key;
use buxton::logging::{self, Logger};
use hashbrown::HashMap;
use indexmap::IndexSet;

/// Index of a client in the reactor's slot table.
pub type ClientSlot = usize;

pub struct NotifyRegistry {
    /// key display name -> subscribers, in registration order.
    watchers: HashMap<String, IndexSet<(ClientSlot, u64)>>,
    /// (client, msgid) -> key display name.
    owned: HashMap<(ClientSlot, u64), String>,
    log: Logger,
}

impl NotifyRegistry {
    pub fn new<'a, L: Into<Option<&'a Logger>>>(log: L) -> NotifyRegistry {
        NotifyRegistry {
            watchers: HashMap::new(),
            owned: HashMap::new(),
            log: logging::child(log),
        }
    }

    /// Register a subscription. Fails when the client already watches the
    /// key; a value need not exist yet.
    pub fn register(&mut self, key: &Key, slot: ClientSlot, msgid: u64) -> bool {
        let name = key.display_name();
        let set = self.watchers.entry(name.clone()).or_default();

        if set.iter().any(|&(owner, _)| owner == slot) {
            logging::debug!(self.log, "duplicate notification registration";
                            "context" => "register",
                            "key" => &name,
                            "client" => slot);
            return false;
        }

        set.insert((slot, msgid));
        self.owned.insert((slot, msgid), name.clone());

        logging::debug!(self.log, "notification registered";
                        "context" => "register",
                        "key" => &name,
                        "client" => slot,
                        "msgid" => msgid);

        true
    }

    /// Drop the subscription a client registered under `msgid`. The cited
    /// key must match the registration.
    pub fn unregister(&mut self, key: &Key, slot: ClientSlot, msgid: u64) -> bool {
        let name = key.display_name();

        match self.owned.get(&(slot, msgid)) {
            Some(owned_key) if *owned_key == name => (),
            _ => return false,
        }

        self.owned.remove(&(slot, msgid));
        if let Some(set) = self.watchers.get_mut(&name) {
            set.shift_remove(&(slot, msgid));
            if set.is_empty() {
                self.watchers.remove(&name);
            }
        }

        logging::debug!(self.log, "notification unregistered";
                        "context" => "unregister",
                        "key" => &name,
                        "client" => slot,
                        "msgid" => msgid);

        true
    }

    /// The subscribers of a key, in registration order.
    pub fn subscribers(&self, key: &Key) -> Vec<(ClientSlot, u64)> {
        match self.watchers.get(&key.display_name()) {
            Some(set) => set.iter().copied().collect(),
            None => Vec::new(),
        }
    }

    /// Remove every subscription a disconnecting client owned.
    pub fn drop_client(&mut self, slot: ClientSlot) {
        let stale: Vec<_> = self
            .owned
            .keys()
            .filter(|(owner, _)| *owner == slot)
            .copied()
            .collect();

        for entry in stale {
            if let Some(name) = self.owned.remove(&entry) {
                if let Some(set) = self.watchers.get_mut(&name) {
                    set.shift_remove(&entry);
                    if set.is_empty() {
                        self.watchers.remove(&name);
                    }
                }
            }
        }

        logging::debug!(self.log, "client subscriptions dropped";
                        "context" => "drop_client",
                        "client" => slot);
    }
}
