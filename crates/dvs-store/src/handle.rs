use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dvs_common::{poll, DvsError, PollingConfig, Result};
use once_cell::sync::OnceCell;

use crate::client::{StoreClient, StoreId};
use crate::fields::{FieldValues, TableRecord};

/// Key sets of selected tables frozen at capture time.
pub type KeySnapshot = BTreeMap<String, BTreeSet<String>>;

/// Typed accessor over one database of a virtual switch.
///
/// Cloning is cheap and shares the connection and the baseline snapshot.
#[derive(Clone)]
pub struct DataStoreHandle {
    store: StoreId,
    client: Arc<dyn StoreClient>,
    baseline: Arc<OnceCell<KeySnapshot>>,
}

impl std::fmt::Debug for DataStoreHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataStoreHandle")
            .field("store", &self.store)
            .field("baseline", &self.baseline.get().map(|b| b.len()))
            .finish()
    }
}

impl DataStoreHandle {
    pub fn new(store: StoreId, client: Arc<dyn StoreClient>) -> Self {
        DataStoreHandle {
            store,
            client,
            baseline: Arc::new(OnceCell::new()),
        }
    }

    pub fn store(&self) -> StoreId {
        self.store
    }

    pub fn client(&self) -> &dyn StoreClient {
        self.client.as_ref()
    }

    pub fn table_key(&self, table: &str, key: &str) -> String {
        format!("{table}{}{key}", self.store.separator())
    }

    /// Raw keys matching a glob pattern.
    pub fn keys_matching(&self, pattern: &str) -> Result<Vec<String>> {
        let mut keys = self.client.keys(pattern)?;
        keys.sort();
        Ok(keys)
    }

    /// Keys of `table` with the table prefix stripped, sorted.
    pub fn get_keys(&self, table: &str) -> Result<Vec<String>> {
        let prefix = format!("{table}{}", self.store.separator());
        let keys = self.keys_matching(&format!("{prefix}*"))?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(&prefix).map(str::to_string))
            .collect())
    }

    pub fn get_entry(&self, table: &str, key: &str) -> Result<FieldValues> {
        self.client.hgetall(&self.table_key(table, key))
    }

    /// Typed read of `R::TABLE`; `None` when the record is absent.
    pub fn get_record<R: TableRecord>(&self, key: &str) -> Result<Option<R>> {
        if R::STORE != self.store {
            return Err(DvsError::InvalidValue(format!(
                "{} lives in {}, not {}",
                R::TABLE,
                R::STORE,
                self.store
            )));
        }
        let fields = self.get_entry(R::TABLE, key)?;
        if fields.is_empty() {
            return Ok(None);
        }
        R::from_fields(key, &fields).map(Some)
    }

    pub fn create_entry(&self, table: &str, key: &str, fields: &FieldValues) -> Result<()> {
        self.client.hset(&self.table_key(table, key), fields)
    }

    /// Merge `fields` into an existing record. Same wire operation as
    /// create; kept separate so call sites read as intended.
    pub fn update_entry(&self, table: &str, key: &str, fields: &FieldValues) -> Result<()> {
        self.client.hset(&self.table_key(table, key), fields)
    }

    pub fn put_record<R: TableRecord>(&self, key: &str, record: &R) -> Result<()> {
        self.update_entry(R::TABLE, key, &record.to_fields())
    }

    pub fn delete_entry(&self, table: &str, key: &str) -> Result<()> {
        self.client.del(&self.table_key(table, key))
    }

    pub fn delete_field(&self, table: &str, key: &str, field: &str) -> Result<()> {
        self.client.hdel(&self.table_key(table, key), &[field])
    }

    pub fn delete_all_by_table(&self, table: &str) -> Result<()> {
        for key in self.get_keys(table)? {
            self.delete_entry(table, &key)?;
        }
        Ok(())
    }

    /// Reads inside poll predicates: a failed read counts as "not yet".
    fn observe_keys(&self, table: &str) -> Vec<String> {
        self.get_keys(table).unwrap_or_else(|err| {
            tracing::debug!(store = %self.store, table, %err, "transient read failure");
            Vec::new()
        })
    }

    fn observe_entry(&self, table: &str, key: &str) -> FieldValues {
        self.get_entry(table, key).unwrap_or_else(|err| {
            tracing::debug!(store = %self.store, table, key, %err, "transient read failure");
            FieldValues::new()
        })
    }

    /// Wait until `table` holds exactly `n` keys.
    pub fn wait_for_n_keys(&self, table: &str, n: usize, config: &PollingConfig) -> Result<Vec<String>> {
        let what = format!("{} keys in {}:{}", n, self.store, table);
        let (_, keys) = poll(&what, config, || {
            let keys = self.observe_keys(table);
            (keys.len() == n, keys)
        })?;
        Ok(keys)
    }

    pub fn wait_for_entry(&self, table: &str, key: &str, config: &PollingConfig) -> Result<FieldValues> {
        let what = format!("entry {}", self.table_key(table, key));
        let (_, fields) = poll(&what, config, || {
            let fields = self.observe_entry(table, key);
            (!fields.is_empty(), fields)
        })?;
        Ok(fields)
    }

    /// Wait until every pair in `expected` is present in the record.
    pub fn wait_for_field_match(
        &self,
        table: &str,
        key: &str,
        expected: &FieldValues,
        config: &PollingConfig,
    ) -> Result<FieldValues> {
        let what = format!("fields {:?} in {}", expected, self.table_key(table, key));
        let (_, fields) = poll(&what, config, || {
            let fields = self.observe_entry(table, key);
            (!fields.is_empty() && fields.contains_all(expected), fields)
        })?;
        Ok(fields)
    }

    /// Wait until the record holds exactly `expected`, nothing more.
    pub fn wait_for_exact_match(
        &self,
        table: &str,
        key: &str,
        expected: &FieldValues,
        config: &PollingConfig,
    ) -> Result<FieldValues> {
        let what = format!("exact {:?} in {}", expected, self.table_key(table, key));
        let (_, fields) = poll(&what, config, || {
            let fields = self.observe_entry(table, key);
            (fields.same_pairs(expected), fields)
        })?;
        Ok(fields)
    }

    pub fn wait_for_deleted_entry(&self, table: &str, key: &str, config: &PollingConfig) -> Result<FieldValues> {
        let what = format!("deletion of {}", self.table_key(table, key));
        let (_, fields) = poll(&what, config, || {
            let fields = self.observe_entry(table, key);
            (fields.is_empty(), fields)
        })?;
        Ok(fields)
    }

    /// Wait until none of `keys` remain in `table`. Returns the survivors.
    pub fn wait_for_deleted_keys(&self, table: &str, keys: &[String], config: &PollingConfig) -> Result<Vec<String>> {
        let what = format!("deletion of {} keys in {}:{}", keys.len(), self.store, table);
        let (_, remaining) = poll(&what, config, || {
            let present: BTreeSet<String> = self.observe_keys(table).into_iter().collect();
            let remaining: Vec<String> = keys.iter().filter(|k| present.contains(*k)).cloned().collect();
            (remaining.is_empty(), remaining)
        })?;
        Ok(remaining)
    }

    /// Freeze the current key sets of `tables`. Succeeds once per handle;
    /// a second capture is rejected and the first snapshot stays in force.
    pub fn capture_baseline(&self, tables: &[&str]) -> Result<&KeySnapshot> {
        let mut snapshot = KeySnapshot::new();
        for table in tables {
            snapshot.insert(table.to_string(), self.get_keys(table)?.into_iter().collect());
        }
        let captured = self.baseline.try_insert(snapshot).map_err(|_| DvsError::InvalidState {
            state: "baseline captured",
            operation: "capture_baseline",
        })?;
        tracing::debug!(store = %self.store, tables = tables.len(), "captured baseline");
        Ok(captured)
    }

    pub fn baseline(&self) -> Option<&KeySnapshot> {
        self.baseline.get()
    }

    /// Keys present now that were not in the baseline.
    pub fn keys_added_since_baseline(&self, table: &str) -> Result<Vec<String>> {
        let base = self.baseline_for(table)?;
        Ok(self.get_keys(table)?.into_iter().filter(|k| !base.contains(k)).collect())
    }

    /// Baseline keys that are gone now.
    pub fn keys_removed_since_baseline(&self, table: &str) -> Result<Vec<String>> {
        let base = self.baseline_for(table)?;
        let now: BTreeSet<String> = self.get_keys(table)?.into_iter().collect();
        Ok(base.iter().filter(|k| !now.contains(*k)).cloned().collect())
    }

    fn baseline_for(&self, table: &str) -> Result<&BTreeSet<String>> {
        self.baseline
            .get()
            .and_then(|b| b.get(table))
            .ok_or_else(|| DvsError::InvalidValue(format!("no baseline for {}:{}", self.store, table)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::{AdminStatus, ConfigPort, HostIf};
    use crate::test_util::MemoryStore;
    use std::time::Duration;

    fn config_handle() -> (Arc<MemoryStore>, DataStoreHandle) {
        let store = Arc::new(MemoryStore::new());
        (store.clone(), DataStoreHandle::new(StoreId::Config, store))
    }

    fn quick(strict: bool) -> PollingConfig {
        PollingConfig::new(Duration::from_millis(5), Duration::from_millis(60), strict)
    }

    #[test]
    fn keys_are_stripped_and_sorted() {
        let (store, db) = config_handle();
        store.insert("PORT|Ethernet4", [("admin_status", "up")]);
        store.insert("PORT|Ethernet0", [("admin_status", "down")]);
        store.insert("VLAN|Vlan10", [("vlanid", "10")]);
        assert_eq!(db.get_keys("PORT").unwrap(), vec!["Ethernet0", "Ethernet4"]);
        assert_eq!(db.keys_matching("VLAN*").unwrap(), vec!["VLAN|Vlan10"]);
    }

    #[test]
    fn typed_records_check_store() {
        let (_, db) = config_handle();
        db.put_record(
            "Ethernet8",
            &ConfigPort {
                name: "Ethernet8".into(),
                admin_status: AdminStatus::Up,
                mtu: None,
            },
        )
        .unwrap();
        let port: ConfigPort = db.get_record("Ethernet8").unwrap().unwrap();
        assert_eq!(port.admin_status, AdminStatus::Up);
        assert!(db.get_record::<ConfigPort>("Ethernet12").unwrap().is_none());
        assert!(db.get_record::<HostIf>("oid:0x1").is_err());
    }

    #[test]
    fn wait_for_n_keys_strict_and_lenient() {
        let (store, db) = config_handle();
        store.insert("VLAN|Vlan10", [("vlanid", "10")]);
        assert_eq!(db.wait_for_n_keys("VLAN", 1, &quick(true)).unwrap(), vec!["Vlan10"]);

        let err = db.wait_for_n_keys("VLAN", 2, &quick(true)).unwrap_err();
        assert!(err.is_poll_timeout());
        assert_eq!(db.wait_for_n_keys("VLAN", 2, &quick(false)).unwrap(), vec!["Vlan10"]);
    }

    #[test]
    fn field_match_and_deletion() {
        let (store, db) = config_handle();
        store.insert("PORT|Ethernet0", [("admin_status", "up"), ("mtu", "9100")]);
        let expected = FieldValues::from([("mtu", "9100")]);
        db.wait_for_field_match("PORT", "Ethernet0", &expected, &quick(true)).unwrap();
        assert!(db
            .wait_for_exact_match("PORT", "Ethernet0", &expected, &quick(true))
            .is_err());

        db.delete_entry("PORT", "Ethernet0").unwrap();
        db.wait_for_deleted_entry("PORT", "Ethernet0", &quick(true)).unwrap();
        assert!(db
            .wait_for_deleted_keys("PORT", &["Ethernet0".to_string()], &quick(true))
            .unwrap()
            .is_empty());
    }

    #[test]
    fn baseline_is_captured_once() {
        let (store, db) = config_handle();
        store.insert("ACL_TABLE|default", [("type", "L3")]);
        db.capture_baseline(&["ACL_TABLE"]).unwrap();

        store.insert("ACL_TABLE|test", [("type", "L3")]);
        store.remove("ACL_TABLE|default");
        assert_eq!(db.keys_added_since_baseline("ACL_TABLE").unwrap(), vec!["test"]);
        assert_eq!(db.keys_removed_since_baseline("ACL_TABLE").unwrap(), vec!["default"]);

        let err = db.capture_baseline(&["ACL_TABLE"]).unwrap_err();
        assert!(matches!(err, DvsError::InvalidState { .. }));
        // The original snapshot is untouched.
        assert_eq!(db.keys_added_since_baseline("ACL_TABLE").unwrap(), vec!["test"]);
        assert!(db.keys_added_since_baseline("VLAN").is_err());
    }
}
