//! Store boundary: one connection per database index over the switch's
//! bind-mounted Redis socket.

use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use dvs_common::{DvsError, Result};

use crate::events::{Notification, Subscription};
use crate::fields::FieldValues;

/// The independently indexed databases of a virtual switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StoreId {
    /// Application state produced from configuration.
    Appl,
    /// Derived-hardware (SAI object) state.
    Asic,
    Counters,
    Config,
    Flex,
    State,
}

impl StoreId {
    pub const ALL: [StoreId; 6] = [
        StoreId::Appl,
        StoreId::Asic,
        StoreId::Counters,
        StoreId::Config,
        StoreId::Flex,
        StoreId::State,
    ];

    pub fn index(self) -> u32 {
        match self {
            StoreId::Appl => 0,
            StoreId::Asic => 1,
            StoreId::Counters => 2,
            StoreId::Config => 4,
            StoreId::Flex => 5,
            StoreId::State => 6,
        }
    }

    /// Separator between table name and key.
    pub fn separator(self) -> char {
        match self {
            StoreId::Appl | StoreId::Asic | StoreId::Counters => ':',
            StoreId::Config | StoreId::Flex | StoreId::State => '|',
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            StoreId::Appl => "APPL_DB",
            StoreId::Asic => "ASIC_DB",
            StoreId::Counters => "COUNTERS_DB",
            StoreId::Config => "CONFIG_DB",
            StoreId::Flex => "FLEX_COUNTER_DB",
            StoreId::State => "STATE_DB",
        }
    }
}

impl std::fmt::Display for StoreId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Raw hash-record access to one database.
pub trait StoreClient: Send + Sync {
    fn keys(&self, pattern: &str) -> Result<Vec<String>>;
    /// All fields of `key`; empty when the key does not exist.
    fn hgetall(&self, key: &str) -> Result<FieldValues>;
    fn hset(&self, key: &str, fields: &FieldValues) -> Result<()>;
    fn hdel(&self, key: &str, fields: &[&str]) -> Result<()>;
    fn del(&self, key: &str) -> Result<()>;
}

/// Opens clients and subscriptions for a switch's socket.
pub trait StoreConnector: Send + Sync {
    fn connect(&self, socket: &Path, store: StoreId) -> Result<Arc<dyn StoreClient>>;
    fn subscribe(&self, socket: &Path, store: StoreId, pattern: &str) -> Result<Box<dyn Subscription>>;
}

fn store_err(err: redis::RedisError) -> DvsError {
    DvsError::Store(err.to_string())
}

fn socket_url(socket: &Path, db: u32) -> String {
    format!("unix://{}?db={}", socket.display(), db)
}

/// A [`StoreClient`] backed by a synchronous Redis connection.
pub struct RedisStore {
    store: StoreId,
    conn: Mutex<redis::Connection>,
}

impl RedisStore {
    pub fn connect(socket: &Path, store: StoreId) -> Result<Self> {
        let client = redis::Client::open(socket_url(socket, store.index())).map_err(store_err)?;
        let conn = client.get_connection().map_err(store_err)?;
        tracing::debug!(store = %store, socket = %socket.display(), "connected to store");
        Ok(RedisStore {
            store,
            conn: Mutex::new(conn),
        })
    }

    pub fn store(&self) -> StoreId {
        self.store
    }

    fn query<T: redis::FromRedisValue>(&self, cmd: &redis::Cmd) -> Result<T> {
        let mut conn = self.conn.lock().unwrap_or_else(|e| e.into_inner());
        cmd.query(&mut *conn).map_err(store_err)
    }
}

impl StoreClient for RedisStore {
    fn keys(&self, pattern: &str) -> Result<Vec<String>> {
        self.query(redis::cmd("KEYS").arg(pattern))
    }

    fn hgetall(&self, key: &str) -> Result<FieldValues> {
        let flat: Vec<String> = self.query(redis::cmd("HGETALL").arg(key))?;
        Ok(flat
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect())
    }

    fn hset(&self, key: &str, fields: &FieldValues) -> Result<()> {
        let mut cmd = redis::cmd("HSET");
        cmd.arg(key);
        if fields.is_empty() {
            // Records without attributes still need one field to exist.
            cmd.arg("NULL").arg("NULL");
        }
        for (f, v) in fields.iter() {
            cmd.arg(f).arg(v);
        }
        self.query::<()>(&cmd)
    }

    fn hdel(&self, key: &str, fields: &[&str]) -> Result<()> {
        if fields.is_empty() {
            return Ok(());
        }
        self.query::<()>(redis::cmd("HDEL").arg(key).arg(fields))
    }

    fn del(&self, key: &str) -> Result<()> {
        self.query::<()>(redis::cmd("DEL").arg(key))
    }
}

/// Keyspace-notification subscription on a dedicated connection.
pub struct RedisSubscription {
    conn: redis::Connection,
}

impl RedisSubscription {
    pub fn open(socket: &Path, store: StoreId, pattern: &str) -> Result<Self> {
        let client = redis::Client::open(socket_url(socket, store.index())).map_err(store_err)?;
        let mut conn = client.get_connection().map_err(store_err)?;
        let packed = redis::cmd("PSUBSCRIBE").arg(pattern).get_packed_command();
        conn.send_packed_command(&packed).map_err(store_err)?;
        // Subscription confirmation.
        conn.recv_response().map_err(store_err)?;
        tracing::debug!(store = %store, pattern, "subscribed to keyspace events");
        Ok(RedisSubscription { conn })
    }
}

impl Subscription for RedisSubscription {
    /// Waits up to `wait` for a keyspace message. Confirmation and pong
    /// frames are skipped without ending the wait.
    fn next(&mut self, wait: Duration) -> Result<Option<Notification>> {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            self.conn
                .set_read_timeout(Some(remaining.max(Duration::from_millis(1))))
                .map_err(store_err)?;
            let value = match self.conn.recv_response() {
                Ok(value) => value,
                Err(err) if err.is_timeout() => return Ok(None),
                Err(err) => return Err(store_err(err)),
            };
            if let Some(notification) = notification_from(&value)? {
                return Ok(Some(notification));
            }
        }
    }
}

/// A pubsub frame as a notification, or `None` for control frames.
fn notification_from(value: &redis::Value) -> Result<Option<Notification>> {
    let Some(msg) = redis::Msg::from_value(value) else {
        return Ok(None);
    };
    let data: String = msg.get_payload().map_err(store_err)?;
    Ok(Some(Notification {
        channel: msg.get_channel_name().to_string(),
        data,
    }))
}

/// Production [`StoreConnector`].
#[derive(Debug, Default, Clone, Copy)]
pub struct RedisConnector;

impl StoreConnector for RedisConnector {
    fn connect(&self, socket: &Path, store: StoreId) -> Result<Arc<dyn StoreClient>> {
        Ok(Arc::new(RedisStore::connect(socket, store)?))
    }

    fn subscribe(&self, socket: &Path, store: StoreId, pattern: &str) -> Result<Box<dyn Subscription>> {
        Ok(Box::new(RedisSubscription::open(socket, store, pattern)?))
    }
}
