//! Field/value payloads and typed table records.

use dvs_common::{DvsError, Result};

use crate::client::StoreId;

/// Ordered `(field, value)` pairs: the store's record format.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FieldValues(Vec<(String, String)>);

impl FieldValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(f, _)| f == field)
            .map(|(_, v)| v.as_str())
    }

    /// Set `field`, replacing an existing value in place.
    pub fn insert(&mut self, field: impl Into<String>, value: impl Into<String>) {
        let field = field.into();
        let value = value.into();
        match self.0.iter_mut().find(|(f, _)| *f == field) {
            Some(slot) => slot.1 = value,
            None => self.0.push((field, value)),
        }
    }

    pub fn remove(&mut self, field: &str) -> Option<String> {
        let idx = self.0.iter().position(|(f, _)| f == field)?;
        Some(self.0.remove(idx).1)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(f, v)| (f.as_str(), v.as_str()))
    }

    /// Every pair of `expected` is present here with the same value.
    pub fn contains_all(&self, expected: &FieldValues) -> bool {
        expected.iter().all(|(f, v)| self.get(f) == Some(v))
    }

    /// Same set of pairs, ignoring order.
    pub fn same_pairs(&self, other: &FieldValues) -> bool {
        self.len() == other.len() && self.contains_all(other)
    }

    /// Apply `other` on top of `self`.
    pub fn merge(&mut self, other: &FieldValues) {
        for (f, v) in other.iter() {
            self.insert(f, v);
        }
    }

    pub fn into_pairs(self) -> Vec<(String, String)> {
        self.0
    }

    /// Value of a required field, for typed record conversion.
    pub fn require(&self, key: &str, field: &str) -> Result<&str> {
        self.get(field).ok_or_else(|| {
            DvsError::Store(format!("{key}: missing field {field}"))
        })
    }
}

impl<F: Into<String>, V: Into<String>> FromIterator<(F, V)> for FieldValues {
    fn from_iter<I: IntoIterator<Item = (F, V)>>(iter: I) -> Self {
        let mut fvs = FieldValues::new();
        for (f, v) in iter {
            fvs.insert(f, v);
        }
        fvs
    }
}

impl<const N: usize> From<[(&str, &str); N]> for FieldValues {
    fn from(pairs: [(&str, &str); N]) -> Self {
        pairs.into_iter().collect()
    }
}

/// A table whose records convert to and from [`FieldValues`].
pub trait TableRecord: Sized {
    const STORE: StoreId;
    const TABLE: &'static str;

    fn from_fields(key: &str, fields: &FieldValues) -> Result<Self>;
    fn to_fields(&self) -> FieldValues;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminStatus {
    Up,
    Down,
}

impl AdminStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            AdminStatus::Up => "up",
            AdminStatus::Down => "down",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "up" => Some(AdminStatus::Up),
            "down" => Some(AdminStatus::Down),
            _ => None,
        }
    }
}

/// `ASIC_STATE:SAI_OBJECT_TYPE_HOSTIF:<oid>`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostIf {
    pub oid: String,
    pub name: String,
    pub port_oid: String,
}

impl TableRecord for HostIf {
    const STORE: StoreId = StoreId::Asic;
    const TABLE: &'static str = "ASIC_STATE:SAI_OBJECT_TYPE_HOSTIF";

    fn from_fields(key: &str, fields: &FieldValues) -> Result<Self> {
        Ok(HostIf {
            oid: key.to_string(),
            name: fields.require(key, "SAI_HOSTIF_ATTR_NAME")?.to_string(),
            port_oid: fields.require(key, "SAI_HOSTIF_ATTR_OBJ_ID")?.to_string(),
        })
    }

    fn to_fields(&self) -> FieldValues {
        FieldValues::from([
            ("SAI_HOSTIF_ATTR_TYPE", "SAI_HOSTIF_TYPE_NETDEV"),
            ("SAI_HOSTIF_ATTR_OBJ_ID", self.port_oid.as_str()),
            ("SAI_HOSTIF_ATTR_NAME", self.name.as_str()),
        ])
    }
}

/// `CONFIG_DB PORT|<name>`; only the fields the harness drives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigPort {
    pub name: String,
    pub admin_status: AdminStatus,
    pub mtu: Option<u32>,
}

impl TableRecord for ConfigPort {
    const STORE: StoreId = StoreId::Config;
    const TABLE: &'static str = "PORT";

    fn from_fields(key: &str, fields: &FieldValues) -> Result<Self> {
        let admin_status = match fields.get("admin_status") {
            None => AdminStatus::Down,
            Some(v) => AdminStatus::parse(v).ok_or_else(|| {
                DvsError::Store(format!("{key}: bad admin_status {v:?}"))
            })?,
        };
        let mtu = match fields.get("mtu") {
            None => None,
            Some(v) => Some(v.parse().map_err(|_| {
                DvsError::Store(format!("{key}: bad mtu {v:?}"))
            })?),
        };
        Ok(ConfigPort {
            name: key.to_string(),
            admin_status,
            mtu,
        })
    }

    fn to_fields(&self) -> FieldValues {
        let mut fvs = FieldValues::from([("admin_status", self.admin_status.as_str())]);
        if let Some(mtu) = self.mtu {
            fvs.insert("mtu", mtu.to_string());
        }
        fvs
    }
}

/// `APPL_DB PORT_TABLE:<name>` as seen by tests waiting on port state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppPort {
    pub name: String,
    pub admin_status: Option<AdminStatus>,
    pub oper_status: Option<AdminStatus>,
}

impl TableRecord for AppPort {
    const STORE: StoreId = StoreId::Appl;
    const TABLE: &'static str = "PORT_TABLE";

    fn from_fields(key: &str, fields: &FieldValues) -> Result<Self> {
        Ok(AppPort {
            name: key.to_string(),
            admin_status: fields.get("admin_status").and_then(AdminStatus::parse),
            oper_status: fields.get("oper_status").and_then(AdminStatus::parse),
        })
    }

    fn to_fields(&self) -> FieldValues {
        let mut fvs = FieldValues::new();
        if let Some(s) = self.admin_status {
            fvs.insert("admin_status", s.as_str());
        }
        if let Some(s) = self.oper_status {
            fvs.insert("oper_status", s.as_str());
        }
        fvs
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_replaces_in_place() {
        let mut fvs = FieldValues::from([("a", "1"), ("b", "2")]);
        fvs.insert("a", "3");
        assert_eq!(fvs.into_pairs(), vec![("a".to_string(), "3".to_string()), ("b".to_string(), "2".to_string())]);
    }

    #[test]
    fn contains_all_checks_subset() {
        let fvs = FieldValues::from([("admin_status", "up"), ("mtu", "9100")]);
        assert!(fvs.contains_all(&FieldValues::from([("mtu", "9100")])));
        assert!(!fvs.contains_all(&FieldValues::from([("mtu", "1500")])));
        assert!(!fvs.same_pairs(&FieldValues::from([("mtu", "9100")])));
    }

    #[test]
    fn hostif_requires_name_and_port() {
        let ok = FieldValues::from([
            ("SAI_HOSTIF_ATTR_NAME", "Ethernet0"),
            ("SAI_HOSTIF_ATTR_OBJ_ID", "oid:0x1000000000002"),
        ]);
        let hostif = HostIf::from_fields("oid:0xd000000000001", &ok).unwrap();
        assert_eq!(hostif.name, "Ethernet0");
        assert_eq!(hostif.port_oid, "oid:0x1000000000002");

        let missing = FieldValues::from([("SAI_HOSTIF_ATTR_NAME", "Ethernet0")]);
        assert!(HostIf::from_fields("oid:0xd", &missing).is_err());
    }

    #[test]
    fn config_port_round_trips_admin_state() {
        let port = ConfigPort {
            name: "Ethernet4".into(),
            admin_status: AdminStatus::Up,
            mtu: Some(9100),
        };
        let parsed = ConfigPort::from_fields("Ethernet4", &port.to_fields()).unwrap();
        assert_eq!(parsed, port);
        assert!(ConfigPort::from_fields("Ethernet4", &FieldValues::from([("admin_status", "sideways")])).is_err());
    }
}
