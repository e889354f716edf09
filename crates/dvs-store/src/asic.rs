//! # Derived-hardware store
//!
//! The ASIC database holds the SAI objects the switch derived from its
//! configuration. Before tests can reason about it, the database must have
//! converged on its default objects. [`AsicDb::new`] waits for that once,
//! then freezes an [`AsicBaseline`]: the default object keys plus the
//! port-name ↔ object-id maps later assertions translate through.

use std::collections::BTreeMap;
use std::time::Duration;

use dvs_common::{poll, wait_for_result, DvsError, PollingConfig, Result};

use crate::fields::{HostIf, TableRecord};
use crate::handle::DataStoreHandle;

pub const SWITCH_TABLE: &str = "ASIC_STATE:SAI_OBJECT_TYPE_SWITCH";
pub const VIRTUAL_ROUTER_TABLE: &str = "ASIC_STATE:SAI_OBJECT_TYPE_VIRTUAL_ROUTER";
pub const PORT_TABLE: &str = "ASIC_STATE:SAI_OBJECT_TYPE_PORT";
pub const HOSTIF_TABLE: &str = "ASIC_STATE:SAI_OBJECT_TYPE_HOSTIF";
pub const ACL_TABLE_TABLE: &str = "ASIC_STATE:SAI_OBJECT_TYPE_ACL_TABLE";
pub const ACL_ENTRY_TABLE: &str = "ASIC_STATE:SAI_OBJECT_TYPE_ACL_ENTRY";
pub const TRAP_GROUP_TABLE: &str = "ASIC_STATE:SAI_OBJECT_TYPE_HOSTIF_TRAP_GROUP";

/// Tables whose default contents are frozen into the baseline.
pub const BASELINE_TABLES: &[&str] = &[
    VIRTUAL_ROUTER_TABLE,
    PORT_TABLE,
    HOSTIF_TABLE,
    ACL_TABLE_TABLE,
    ACL_ENTRY_TABLE,
    TRAP_GROUP_TABLE,
];

const DEFAULT_VR_ATTR: &str = "SAI_SWITCH_ATTR_DEFAULT_VIRTUAL_ROUTER_ID";

/// Identifier maps captured once after startup convergence.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsicBaseline {
    pub switch_oid: String,
    pub default_vr_oid: String,
    pub port_oid_to_name: BTreeMap<String, String>,
    pub port_name_to_oid: BTreeMap<String, String>,
    pub hostif_oid_to_name: BTreeMap<String, String>,
    pub hostif_name_to_oid: BTreeMap<String, String>,
}

/// [`DataStoreHandle`] over the ASIC database plus its baseline.
#[derive(Debug, Clone)]
pub struct AsicDb {
    handle: DataStoreHandle,
    baseline: AsicBaseline,
}

impl AsicDb {
    /// Wait (strictly, up to `init_timeout`) for the default switch and
    /// virtual-router objects, then capture the baseline.
    pub fn new(handle: DataStoreHandle, init_timeout: Duration) -> Result<Self> {
        let config = PollingConfig::new(Duration::from_millis(100), init_timeout, true);
        poll("ASIC database startup convergence", &config, || {
            let switches = handle.get_keys(SWITCH_TABLE).map(|k| k.len()).unwrap_or(0);
            let vrs = handle.get_keys(VIRTUAL_ROUTER_TABLE).map(|k| k.len()).unwrap_or(0);
            (switches == 1 && vrs >= 1, (switches, vrs))
        })
        .map_err(|err| DvsError::Baseline(err.to_string()))?;

        let baseline = capture(&handle)?;
        handle.capture_baseline(BASELINE_TABLES)?;
        tracing::info!(
            ports = baseline.port_name_to_oid.len(),
            switch = %baseline.switch_oid,
            "captured ASIC baseline"
        );
        Ok(AsicDb { handle, baseline })
    }

    pub fn handle(&self) -> &DataStoreHandle {
        &self.handle
    }

    pub fn baseline(&self) -> &AsicBaseline {
        &self.baseline
    }

    pub fn port_oid(&self, port: &str) -> Option<&str> {
        self.baseline.port_name_to_oid.get(port).map(String::as_str)
    }

    pub fn port_name(&self, oid: &str) -> Option<&str> {
        self.baseline.port_oid_to_name.get(oid).map(String::as_str)
    }

    /// Objects of `table` created since the baseline was taken.
    pub fn new_keys(&self, table: &str) -> Result<Vec<String>> {
        self.handle.keys_added_since_baseline(table)
    }

    /// Wait until `n` objects beyond the baseline exist in `table`.
    pub fn wait_for_n_new_keys(&self, table: &str, n: usize, config: &PollingConfig) -> Result<Vec<String>> {
        let what = format!("{n} new objects in {table}");
        let (_, keys) = wait_for_result(&what, config, || {
            let keys = self.new_keys(table).unwrap_or_default();
            (keys.len() == n, keys)
        })?;
        Ok(keys)
    }
}

fn capture(handle: &DataStoreHandle) -> Result<AsicBaseline> {
    let switch_oid = handle
        .get_keys(SWITCH_TABLE)?
        .into_iter()
        .next()
        .ok_or_else(|| DvsError::Baseline("switch object vanished".into()))?;

    let switch_fields = handle.get_entry(SWITCH_TABLE, &switch_oid)?;
    let default_vr_oid = match switch_fields.get(DEFAULT_VR_ATTR) {
        Some(oid) => oid.to_string(),
        None => handle
            .get_keys(VIRTUAL_ROUTER_TABLE)?
            .into_iter()
            .next()
            .ok_or_else(|| DvsError::Baseline("no default virtual router".into()))?,
    };

    let mut baseline = AsicBaseline {
        switch_oid,
        default_vr_oid,
        ..Default::default()
    };

    for key in handle.get_keys(HOSTIF_TABLE)? {
        let fields = handle.get_entry(HOSTIF_TABLE, &key)?;
        let hostif = HostIf::from_fields(&key, &fields)
            .map_err(|err| DvsError::Baseline(format!("malformed host interface: {err}")))?;
        baseline.port_oid_to_name.insert(hostif.port_oid.clone(), hostif.name.clone());
        baseline.port_name_to_oid.insert(hostif.name.clone(), hostif.port_oid);
        baseline.hostif_oid_to_name.insert(hostif.oid, hostif.name.clone());
        baseline.hostif_name_to_oid.insert(hostif.name, key);
    }

    Ok(baseline)
}
