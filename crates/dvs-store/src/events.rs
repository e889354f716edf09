//! Keyspace-notification capture.
//!
//! The producer never signals "done", so a capture ends once no
//! notification has arrived for a whole idle window. A slow producer can
//! therefore be cut short; callers pick a window that fits the scenario
//! rather than relying on an exact figure.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use dvs_common::Result;

use crate::client::StoreConnector;
use crate::fields::FieldValues;
use crate::handle::DataStoreHandle;

/// One keyspace event: `channel` is `__keyspace@<db>__:<key>`, `data` the
/// operation tag (`hset`, `del`, ...).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub data: String,
}

impl Notification {
    pub fn new(channel: impl Into<String>, data: impl Into<String>) -> Self {
        Notification {
            channel: channel.into(),
            data: data.into(),
        }
    }

    /// The full store key the event refers to.
    pub fn key(&self) -> Option<&str> {
        self.channel.split_once(':').map(|(_, key)| key)
    }
}

pub trait Subscription: Send {
    /// Next notification, or `None` when nothing arrives within `wait`.
    fn next(&mut self, wait: Duration) -> Result<Option<Notification>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Op {
    Add,
    Delete,
}

fn classify(tag: &str) -> Option<Op> {
    match tag {
        "hset" | "hmset" | "hsetnx" | "set" => Some(Op::Add),
        "del" | "expired" => Some(Op::Delete),
        _ => None,
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapturedEvents {
    /// Added or updated records in arrival order, with their fields at the
    /// time the notification was processed.
    pub adds: Vec<(String, FieldValues)>,
    pub deletes: Vec<String>,
}

/// Drains keyspace events for one table/key-prefix of a store.
pub struct EventCapture {
    sub: Box<dyn Subscription>,
    handle: DataStoreHandle,
    table: String,
    prefix: String,
    ignore: HashSet<String>,
    tick: Duration,
}

impl EventCapture {
    /// Subscribe to events for keys of `table` beginning with `key_prefix`.
    pub fn subscribe(
        connector: &dyn StoreConnector,
        socket: &Path,
        handle: DataStoreHandle,
        table: &str,
        key_prefix: &str,
    ) -> Result<Self> {
        let store = handle.store();
        let prefix = handle.table_key(table, key_prefix);
        let pattern = format!("__keyspace@{}__:{}*", store.index(), prefix);
        let sub = connector.subscribe(socket, store, &pattern)?;
        Ok(Self::from_subscription(sub, handle, table))
    }

    pub fn from_subscription(sub: Box<dyn Subscription>, handle: DataStoreHandle, table: &str) -> Self {
        let prefix = handle.table_key(table, "");
        EventCapture {
            sub,
            handle,
            table: table.to_string(),
            prefix,
            ignore: HashSet::new(),
            tick: Duration::from_millis(100),
        }
    }

    /// Keys (without table prefix) to drop from the results.
    pub fn ignoring<I, S>(mut self, keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ignore.extend(keys.into_iter().map(Into::into));
        self
    }

    /// Granularity of the idle clock.
    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick.max(Duration::from_millis(1));
        self
    }

    /// Collect events until `idle_window` passes with no notification.
    pub fn capture(&mut self, idle_window: Duration) -> Result<CapturedEvents> {
        let mut events = CapturedEvents::default();
        let mut last_add: Option<String> = None;
        let mut idle = Duration::ZERO;

        while idle < idle_window {
            let Some(note) = self.sub.next(self.tick)? else {
                idle += self.tick;
                continue;
            };
            idle = Duration::ZERO;

            let Some(key) = note.key().and_then(|k| k.strip_prefix(&self.prefix)) else {
                tracing::trace!(channel = %note.channel, "notification outside table");
                continue;
            };
            if self.ignore.contains(key) {
                continue;
            }
            let key = key.to_string();

            match classify(&note.data) {
                Some(Op::Add) => {
                    let fields = self.handle.get_entry(&self.table, &key)?;
                    if last_add.as_deref() == Some(key.as_str()) {
                        // Field-by-field writers notify once per field.
                        if let Some(slot) = events.adds.last_mut() {
                            slot.1 = fields;
                        }
                        continue;
                    }
                    events.adds.push((key.clone(), fields));
                    last_add = Some(key);
                }
                Some(Op::Delete) => {
                    events.deletes.push(key);
                    last_add = None;
                }
                None => tracing::trace!(op = %note.data, key = %key, "ignoring notification"),
            }
        }

        tracing::debug!(
            table = %self.table,
            adds = events.adds.len(),
            deletes = events.deletes.len(),
            "event capture idle, finishing"
        );
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::StoreId;
    use crate::test_util::{MemoryStore, ScriptedSubscription};
    use std::sync::Arc;

    const CH: &str = "__keyspace@0__:ROUTE_TABLE:";

    fn capture_with(store: &Arc<MemoryStore>, script: Vec<Option<Notification>>) -> EventCapture {
        let handle = DataStoreHandle::new(StoreId::Appl, store.clone());
        EventCapture::from_subscription(Box::new(ScriptedSubscription::new(script)), handle, "ROUTE_TABLE")
            .with_tick(Duration::from_millis(1))
    }

    #[test]
    fn duplicate_writes_collapse_into_one_add() {
        let store = Arc::new(MemoryStore::new());
        store.insert("ROUTE_TABLE:10.0.0.0/24", [("nexthop", "10.0.0.1")]);
        let mut cap = capture_with(
            &store,
            vec![
                Some(Notification::new(format!("{CH}10.0.0.0/24"), "hset")),
                Some(Notification::new(format!("{CH}10.0.0.0/24"), "hset")),
            ],
        );
        let events = cap.capture(Duration::from_millis(5)).unwrap();
        assert_eq!(events.adds.len(), 1);
        assert_eq!(events.adds[0].0, "10.0.0.0/24");
        assert_eq!(events.adds[0].1.get("nexthop"), Some("10.0.0.1"));
        assert!(events.deletes.is_empty());
    }

    #[test]
    fn order_and_classification_are_preserved() {
        let store = Arc::new(MemoryStore::new());
        store.insert("ROUTE_TABLE:a", [("nexthop", "1")]);
        store.insert("ROUTE_TABLE:b", [("nexthop", "2")]);
        let mut cap = capture_with(
            &store,
            vec![
                Some(Notification::new(format!("{CH}a"), "hset")),
                None,
                Some(Notification::new(format!("{CH}b"), "hset")),
                Some(Notification::new(format!("{CH}a"), "del")),
                Some(Notification::new(format!("{CH}a"), "hset")),
                Some(Notification::new(format!("{CH}b"), "expire")),
            ],
        )
        .ignoring(["ignored"]);
        let events = cap.capture(Duration::from_millis(5)).unwrap();
        let added: Vec<&str> = events.adds.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(added, vec!["a", "b", "a"]);
        assert_eq!(events.deletes, vec!["a"]);
    }

    #[test]
    fn idle_counter_resets_on_each_message() {
        let store = Arc::new(MemoryStore::new());
        store.insert("ROUTE_TABLE:late", [("nexthop", "3")]);
        // Four silent ticks, then a message: with a 5-tick window the late
        // message is still picked up because nothing resets before it.
        let mut script = vec![None; 4];
        script.push(Some(Notification::new(format!("{CH}late"), "hset")));
        let mut cap = capture_with(&store, script);
        let events = cap.capture(Duration::from_millis(5)).unwrap();
        assert_eq!(events.adds.len(), 1);
    }

    #[test]
    fn ignore_list_drops_keys() {
        let store = Arc::new(MemoryStore::new());
        let mut cap = capture_with(
            &store,
            vec![Some(Notification::new(format!("{CH}default"), "hset"))],
        )
        .ignoring(["default"]);
        assert!(cap.capture(Duration::from_millis(3)).unwrap().adds.is_empty());
    }
}
