//! In-memory store fakes for unit tests that have no switch to talk to.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use dvs_common::{DvsError, Result};

use crate::asic::{HOSTIF_TABLE, PORT_TABLE, SWITCH_TABLE, VIRTUAL_ROUTER_TABLE};
use crate::client::{StoreClient, StoreConnector, StoreId};
use crate::events::{Notification, Subscription};
use crate::fields::FieldValues;

/// Glob match supporting `*` and `?`, as the store's KEYS command does.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let p: Vec<char> = pattern.chars().collect();
    let t: Vec<char> = text.chars().collect();
    let (mut pi, mut ti) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while ti < t.len() {
        if pi < p.len() && (p[pi] == '?' || p[pi] == t[ti]) {
            pi += 1;
            ti += 1;
        } else if pi < p.len() && p[pi] == '*' {
            star = Some((pi, ti));
            pi += 1;
        } else if let Some((sp, st)) = star {
            pi = sp + 1;
            ti = st + 1;
            star = Some((sp, st + 1));
        } else {
            return false;
        }
    }
    p[pi..].iter().all(|c| *c == '*')
}

/// One database held in a map.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: Mutex<BTreeMap<String, FieldValues>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert<const N: usize>(&self, key: &str, pairs: [(&str, &str); N]) {
        let mut records = self.records.lock().unwrap();
        records.entry(key.to_string()).or_default().merge(&FieldValues::from(pairs));
    }

    pub fn remove(&self, key: &str) {
        self.records.lock().unwrap().remove(key);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.records.lock().unwrap().contains_key(key)
    }
}

impl StoreClient for MemoryStore {
    fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        let records = self.records.lock().unwrap();
        Ok(records.keys().filter(|k| glob_match(pattern, k)).cloned().collect())
    }

    fn hgetall(&self, key: &str) -> Result<FieldValues> {
        Ok(self.records.lock().unwrap().get(key).cloned().unwrap_or_default())
    }

    fn hset(&self, key: &str, fields: &FieldValues) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        let entry = records.entry(key.to_string()).or_default();
        if fields.is_empty() {
            entry.insert("NULL", "NULL");
        }
        entry.merge(fields);
        Ok(())
    }

    fn hdel(&self, key: &str, fields: &[&str]) -> Result<()> {
        let mut records = self.records.lock().unwrap();
        if let Some(entry) = records.get_mut(key) {
            for f in fields {
                entry.remove(f);
            }
            if entry.is_empty() {
                records.remove(key);
            }
        }
        Ok(())
    }

    fn del(&self, key: &str) -> Result<()> {
        self.records.lock().unwrap().remove(key);
        Ok(())
    }
}

fn port_oid(i: usize) -> String {
    format!("oid:0x{:x}", 0x1000000000000u64 + i as u64 + 1)
}

/// Default objects of a freshly converged switch with `ports` front-panel
/// ports named `Ethernet0`, `Ethernet4`, ...
pub fn seed_asic_defaults(store: &MemoryStore, ports: usize) {
    store.insert(
        &format!("{SWITCH_TABLE}:oid:0x21000000000000"),
        [("SAI_SWITCH_ATTR_DEFAULT_VIRTUAL_ROUTER_ID", "oid:0x3000000000022")],
    );
    store.insert(&format!("{VIRTUAL_ROUTER_TABLE}:oid:0x3000000000022"), [("NULL", "NULL")]);
    for i in 0..ports {
        let oid = port_oid(i);
        let name = format!("Ethernet{}", i * 4);
        store.insert(&format!("{PORT_TABLE}:{oid}"), [("SAI_PORT_ATTR_ADMIN_STATE", "false")]);
        store.insert(
            &format!("{HOSTIF_TABLE}:oid:0xd00000000{:04x}", i + 1),
            [
                ("SAI_HOSTIF_ATTR_TYPE", "SAI_HOSTIF_TYPE_NETDEV"),
                ("SAI_HOSTIF_ATTR_OBJ_ID", oid.as_str()),
                ("SAI_HOSTIF_ATTR_NAME", name.as_str()),
            ],
        );
    }
}

/// Replays a fixed list of notifications; `None` entries are silent ticks.
/// Once exhausted every call is silent.
pub struct ScriptedSubscription {
    script: VecDeque<Option<Notification>>,
}

impl ScriptedSubscription {
    pub fn new(script: Vec<Option<Notification>>) -> Self {
        ScriptedSubscription { script: script.into() }
    }
}

impl Subscription for ScriptedSubscription {
    fn next(&mut self, _wait: Duration) -> Result<Option<Notification>> {
        Ok(self.script.pop_front().flatten())
    }
}

/// [`StoreConnector`] over per-database [`MemoryStore`]s.
#[derive(Default)]
pub struct MemoryConnector {
    stores: Mutex<HashMap<StoreId, Arc<MemoryStore>>>,
    scripts: Mutex<VecDeque<Vec<Option<Notification>>>>,
    connects: AtomicUsize,
    failing: AtomicBool,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// The store backing `id`, created on first use.
    pub fn store(&self, id: StoreId) -> Arc<MemoryStore> {
        self.stores.lock().unwrap().entry(id).or_default().clone()
    }

    /// Queue notifications for the next subscription opened.
    pub fn script_events(&self, script: Vec<Option<Notification>>) {
        self.scripts.lock().unwrap().push_back(script);
    }

    /// Make every later connect fail, as an unreachable socket would.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

impl StoreConnector for MemoryConnector {
    fn connect(&self, socket: &Path, store: StoreId) -> Result<Arc<dyn StoreClient>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(DvsError::Store(format!("{}: connection refused", socket.display())));
        }
        Ok(self.store(store))
    }

    fn subscribe(&self, socket: &Path, _store: StoreId, _pattern: &str) -> Result<Box<dyn Subscription>> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(DvsError::Store(format!("{}: connection refused", socket.display())));
        }
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Box::new(ScriptedSubscription::new(script)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn glob_matches_like_keys() {
        assert!(glob_match("PORT|*", "PORT|Ethernet0"));
        assert!(!glob_match("PORT|*", "PORTCHANNEL|PortChannel1"));
        assert!(glob_match("a?c*", "abcdef"));
        assert!(glob_match("*", ""));
        assert!(!glob_match("abc", "abcd"));
    }

    #[test]
    fn seeded_ports_follow_naming() {
        let store = MemoryStore::new();
        seed_asic_defaults(&store, 3);
        let ports = store.keys(&format!("{PORT_TABLE}:*")).unwrap();
        assert_eq!(ports.len(), 3);
        assert!(store.contains(&format!("{PORT_TABLE}:oid:0x1000000000003")));
    }

    #[test]
    fn hdel_of_last_field_removes_key() {
        let store = MemoryStore::new();
        store.insert("K", [("a", "1")]);
        store.hdel("K", &["a"]).unwrap();
        assert!(!store.contains("K"));
    }
}
