//! Fixture parameters.
//!
//! Options are read from an optional TOML file (`DVS_CONFIG`) and then
//! overlaid with `DVS_*` environment variables, so a test run can be
//! steered without editing files.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::{DvsError, Result};

pub const DEFAULT_IMAGE: &str = "docker-sonic-vs:latest";
pub const DEFAULT_NETNS_IMAGE: &str = "debian:bookworm";
pub const DEFAULT_NUM_PORTS: u32 = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BufferModel {
    #[default]
    Traditional,
    Dynamic,
}

impl std::str::FromStr for BufferModel {
    type Err = DvsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "traditional" => Ok(BufferModel::Traditional),
            "dynamic" => Ok(BufferModel::Dynamic),
            other => Err(DvsError::InvalidConfig(format!(
                "unknown buffer model {other:?}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FixtureOptionsInput {
    pub name: Option<String>,
    pub force_recreate: Option<bool>,
    pub keep_testbed: Option<bool>,
    pub image: Option<String>,
    pub netns_image: Option<String>,
    pub max_cpu: Option<u32>,
    pub buffer_model: Option<BufferModel>,
    pub topology_ns: Option<String>,
    pub topology: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub num_ports: Option<u32>,
    pub mount_root: Option<PathBuf>,
    pub netns_dir: Option<PathBuf>,
    pub sudo: Option<bool>,
    pub environment: BTreeMap<String, String>,
    pub timeouts: TimeoutsInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TimeoutsInput {
    pub supervisor_secs: Option<u64>,
    pub swss_secs: Option<u64>,
    pub asic_init_secs: Option<u64>,
}

/// Deadlines of the readiness gates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadinessTimeouts {
    pub supervisor: Duration,
    pub swss: Duration,
    pub asic_init: Duration,
}

impl Default for ReadinessTimeouts {
    fn default() -> Self {
        Self {
            supervisor: Duration::from_secs(60),
            swss: Duration::from_secs(300),
            asic_init: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FixtureOptions {
    /// Attach to this running container instead of creating one.
    pub attach_name: Option<String>,
    /// Recreate the instance between test modules.
    pub force_recreate: bool,
    /// Leave the instance running at the end of the session.
    pub keep_testbed: bool,
    pub image: String,
    pub netns_image: String,
    pub max_cpu: u32,
    pub buffer_model: BufferModel,
    /// Shared namespace for multi-node topologies.
    pub topology_ns: Option<String>,
    pub topology: Option<PathBuf>,
    pub log_path: Option<PathBuf>,
    pub num_ports: u32,
    pub mount_root: PathBuf,
    pub netns_dir: PathBuf,
    pub sudo: bool,
    pub environment: BTreeMap<String, String>,
    pub timeouts: ReadinessTimeouts,
}

impl Default for FixtureOptions {
    fn default() -> Self {
        Self {
            attach_name: None,
            force_recreate: false,
            keep_testbed: false,
            image: DEFAULT_IMAGE.to_string(),
            netns_image: DEFAULT_NETNS_IMAGE.to_string(),
            max_cpu: 2,
            buffer_model: BufferModel::Traditional,
            topology_ns: None,
            topology: None,
            log_path: None,
            num_ports: DEFAULT_NUM_PORTS,
            mount_root: PathBuf::from("/var/run/redis-vs"),
            netns_dir: PathBuf::from("/var/run/netns"),
            sudo: false,
            environment: BTreeMap::new(),
            timeouts: ReadinessTimeouts::default(),
        }
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.and_then(|v| {
        let trimmed = v.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

impl FixtureOptionsInput {
    pub fn resolve(self) -> Result<FixtureOptions> {
        let defaults = FixtureOptions::default();

        let num_ports = self.num_ports.unwrap_or(defaults.num_ports);
        if num_ports == 0 {
            return Err(DvsError::InvalidConfig("num_ports must be at least 1".into()));
        }
        let max_cpu = self.max_cpu.unwrap_or(defaults.max_cpu).max(1);

        let secs = |v: Option<u64>, d: Duration| v.map(Duration::from_secs).unwrap_or(d);
        let timeouts = ReadinessTimeouts {
            supervisor: secs(self.timeouts.supervisor_secs, defaults.timeouts.supervisor),
            swss: secs(self.timeouts.swss_secs, defaults.timeouts.swss),
            asic_init: secs(self.timeouts.asic_init_secs, defaults.timeouts.asic_init),
        };

        Ok(FixtureOptions {
            attach_name: non_empty(self.name),
            force_recreate: self.force_recreate.unwrap_or(false),
            keep_testbed: self.keep_testbed.unwrap_or(false),
            image: non_empty(self.image).unwrap_or(defaults.image),
            netns_image: non_empty(self.netns_image).unwrap_or(defaults.netns_image),
            max_cpu,
            buffer_model: self.buffer_model.unwrap_or_default(),
            topology_ns: non_empty(self.topology_ns),
            topology: self.topology,
            log_path: self.log_path,
            num_ports,
            mount_root: self.mount_root.unwrap_or(defaults.mount_root),
            netns_dir: self.netns_dir.unwrap_or(defaults.netns_dir),
            sudo: self.sudo.unwrap_or(false),
            environment: self.environment,
            timeouts,
        })
    }
}

fn parse_flag(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        other => Err(DvsError::InvalidConfig(format!("{key}: not a flag: {other:?}"))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| DvsError::InvalidConfig(format!("{key}: not a number: {value:?}")))
}

impl FixtureOptions {
    pub fn from_toml_str(input: &str) -> Result<Self> {
        if input.trim().is_empty() {
            return Ok(FixtureOptions::default());
        }
        let parsed: FixtureOptionsInput = toml::from_str(input)
            .map_err(|e| DvsError::InvalidConfig(format!("invalid fixture TOML: {e}")))?;
        parsed.resolve()
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_toml_str(&text)
    }

    /// Options from `DVS_CONFIG` (if set) overlaid with the process
    /// environment.
    pub fn from_env() -> Result<Self> {
        let base = match std::env::var_os("DVS_CONFIG") {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        base.overlay_env(std::env::vars())
    }

    /// Apply `DVS_*` variables on top of `self`. Unknown keys are ignored.
    pub fn overlay_env<I>(mut self, vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "DVS_NAME" => self.attach_name = non_empty(Some(value)),
                "DVS_FORCE_RECREATE" => self.force_recreate = parse_flag(&key, &value)?,
                "DVS_KEEP_TESTBED" => self.keep_testbed = parse_flag(&key, &value)?,
                "DVS_IMAGE" => {
                    if let Some(image) = non_empty(Some(value)) {
                        self.image = image;
                    }
                }
                "DVS_MAX_CPU" => self.max_cpu = parse_number::<u32>(&key, &value)?.max(1),
                "DVS_BUFFER_MODEL" => self.buffer_model = value.parse()?,
                "DVS_TOPO_NS" => self.topology_ns = non_empty(Some(value)),
                "DVS_TOPOLOGY" => self.topology = non_empty(Some(value)).map(PathBuf::from),
                "DVS_LOG_PATH" => self.log_path = non_empty(Some(value)).map(PathBuf::from),
                "DVS_NUM_PORTS" => {
                    let n: u32 = parse_number(&key, &value)?;
                    if n == 0 {
                        return Err(DvsError::InvalidConfig("DVS_NUM_PORTS must be at least 1".into()));
                    }
                    self.num_ports = n;
                }
                "DVS_SUDO" => self.sudo = parse_flag(&key, &value)?,
                _ => {}
            }
        }
        Ok(self)
    }

    /// Persistent mode: an existing container is reused and never removed.
    pub fn is_persistent(&self) -> bool {
        self.attach_name.is_some()
    }
}
