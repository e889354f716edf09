//! # Device instance
//!
//! One virtual switch: a bare namespace-holder container, the switch image
//! sharing its network namespace, and one [`VirtualServer`] per front-panel
//! port. The lifecycle is
//!
//! ```text
//! Absent → Creating → CheckingReadiness → Ready ⇄ (restart) → … → Destroyed
//! ```
//!
//! Readiness is a fixed sequence of gates; a later gate never runs once an
//! earlier one failed, and any failure tears the instance down before the
//! error is returned.
//!
//! A persistent instance is one we attached to by name. It is never removed,
//! only detached from.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

use dvs_common::config::{BufferModel, ReadinessTimeouts};
use dvs_common::exec::{CmdOutput, CommandRunner};
use dvs_common::{poll, DvsError, FixtureOptions, PollingConfig, Result};
use dvs_net::iface::{parse_link_names, InterfaceAllowList};
use dvs_net::link;
use dvs_net::{NetScope, VirtualServer};
use dvs_store::asic::PORT_TABLE as ASIC_PORT_TABLE;
use dvs_store::fields::AdminStatus;
use dvs_store::{AsicDb, DataStoreHandle, FieldValues, StoreConnector, StoreId};

use crate::docker::{ContainerRuntime, ContainerSpec};

/// Daemons that must be RUNNING before the switch is usable.
pub const REQUIRED_DAEMONS: &[&str] = &[
    "redis-server",
    "rsyslogd",
    "orchagent",
    "portsyncd",
    "neighsyncd",
    "vlanmgrd",
    "intfmgrd",
    "portmgrd",
    "buffermgrd",
    "vrfmgrd",
    "nbrmgrd",
    "vxlanmgrd",
    "fdbsyncd",
    "syncd",
    "fpmsyncd",
    "zebra",
    "staticd",
    "teamsyncd",
    "teammgrd",
];

/// One-shot bootstrap program; must have finished.
const START_SCRIPT: &str = "start.sh";

const REDIS_MOUNT: &str = "/var/run/redis";
const CONFIG_DB_PATH: &str = "/etc/sonic/config_db.json";

/// `orchagent    RUNNING   pid 51, uptime 0:01:02`
static STATUS_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^(\S+)\s+([A-Z]+)\b").expect("static status pattern"));

static FRONT_PANEL: Lazy<Regex> = Lazy::new(|| Regex::new(r"^eth(\d+)$").expect("static port pattern"));

/// Program name → state from `supervisorctl status`. Group prefixes
/// (`swss:orchagent`) are dropped.
pub fn parse_supervisor_status(output: &str) -> BTreeMap<String, String> {
    output
        .lines()
        .filter_map(|line| STATUS_LINE.captures(line.trim()))
        .map(|caps| {
            let program = caps[1].rsplit(':').next().unwrap_or(&caps[1]).to_string();
            (program, caps[2].to_string())
        })
        .collect()
}

/// Daemons not yet in their required state, rendered `name=STATE`.
fn pending_daemons(status: &BTreeMap<String, String>) -> Vec<String> {
    let state = |name: &str| status.get(name).map(String::as_str).unwrap_or("MISSING");
    let mut pending: Vec<String> = REQUIRED_DAEMONS
        .iter()
        .copied()
        .filter(|d| state(*d) != "RUNNING")
        .map(|d| format!("{d}={}", state(d)))
        .collect();
    if state(START_SCRIPT) != "EXITED" {
        pending.push(format!("{START_SCRIPT}={}", state(START_SCRIPT)));
    }
    pending
}

/// Front-panel `ethN` interfaces (N ≥ 1; `eth0` is management).
fn front_panel_count(names: &[String]) -> u32 {
    names
        .iter()
        .filter_map(|n| FRONT_PANEL.captures(n))
        .filter(|caps| caps[1].parse::<u32>().is_ok_and(|n| n >= 1))
        .count() as u32
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    Absent,
    Creating,
    CheckingReadiness,
    Ready,
    Destroyed,
}

impl DeviceState {
    pub fn as_str(self) -> &'static str {
        match self {
            DeviceState::Absent => "absent",
            DeviceState::Creating => "creating",
            DeviceState::CheckingReadiness => "checking readiness",
            DeviceState::Ready => "ready",
            DeviceState::Destroyed => "destroyed",
        }
    }
}

static NAME_SEQ: AtomicU32 = AtomicU32::new(0);

/// Everything needed to create or attach to one instance.
#[derive(Debug, Clone, PartialEq)]
pub struct DeviceSpec {
    pub name: String,
    /// Attach to a running container called `name` instead of creating one.
    pub attach: bool,
    pub image: String,
    pub netns_image: String,
    /// Front-panel ports the switch is configured with.
    pub num_ports: u32,
    pub max_cpu: u32,
    pub environment: BTreeMap<String, String>,
    /// Copied to the switch's configuration path before it starts.
    pub default_config: Option<PathBuf>,
    pub buffer_model: BufferModel,
    pub mount_root: PathBuf,
    pub netns_dir: PathBuf,
    pub timeouts: ReadinessTimeouts,
    pub poll_interval: Duration,
    /// Build one [`VirtualServer`] per port. Topology nodes wire their own
    /// links instead.
    pub with_servers: bool,
    pub log_path: Option<PathBuf>,
}

impl DeviceSpec {
    /// Spec for the session's instance: attached when a name is configured,
    /// otherwise a freshly named one.
    pub fn from_options(options: &FixtureOptions) -> Self {
        match &options.attach_name {
            Some(name) => {
                let mut spec = Self::named(name, options);
                spec.attach = true;
                spec
            }
            None => {
                let seq = NAME_SEQ.fetch_add(1, Ordering::Relaxed);
                let name = format!("dvs{:x}{}", std::process::id() % 0xffff, seq);
                Self::named(&name, options)
            }
        }
    }

    pub fn named(name: &str, options: &FixtureOptions) -> Self {
        DeviceSpec {
            name: name.to_string(),
            attach: false,
            image: options.image.clone(),
            netns_image: options.netns_image.clone(),
            num_ports: options.num_ports,
            max_cpu: options.max_cpu,
            environment: options.environment.clone(),
            default_config: None,
            buffer_model: options.buffer_model,
            mount_root: options.mount_root.clone(),
            netns_dir: options.netns_dir.clone(),
            timeouts: options.timeouts,
            poll_interval: Duration::from_secs(1),
            with_servers: true,
            log_path: options.log_path.clone(),
        }
    }
}

struct Stores {
    app: DataStoreHandle,
    asic: AsicDb,
    counters: DataStoreHandle,
    config: DataStoreHandle,
    flex: DataStoreHandle,
    state: DataStoreHandle,
}

pub struct DeviceInstance {
    spec: DeviceSpec,
    runtime: ContainerRuntime,
    connector: Arc<dyn StoreConnector>,
    state: DeviceState,
    /// Process holding the network namespace shared by switch and servers.
    pid: Option<u32>,
    /// Namespace-holder container, when we created one.
    netns_container: Option<String>,
    servers: Vec<VirtualServer>,
    stores: Option<Stores>,
}

impl std::fmt::Debug for DeviceInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceInstance")
            .field("name", &self.spec.name)
            .field("state", &self.state)
            .field("persistent", &self.spec.attach)
            .field("pid", &self.pid)
            .field("servers", &self.servers.len())
            .finish()
    }
}

impl DeviceInstance {
    /// Provision (or attach to) the instance described by `spec`. The
    /// instance is not usable until [`DeviceInstance::check_ready`] passes.
    pub fn create(
        spec: DeviceSpec,
        runner: Arc<dyn CommandRunner>,
        connector: Arc<dyn StoreConnector>,
    ) -> Result<Self> {
        let mut device = DeviceInstance {
            spec,
            runtime: ContainerRuntime::new(runner),
            connector,
            state: DeviceState::Absent,
            pid: None,
            netns_container: None,
            servers: Vec::new(),
            stores: None,
        };
        device.state = DeviceState::Creating;

        let provisioned = if device.spec.attach {
            device.attach()
        } else {
            device.provision()
        };
        if let Err(err) = provisioned {
            return Err(device.fail("provisioning", err));
        }
        tracing::info!(
            name = %device.spec.name,
            persistent = device.spec.attach,
            servers = device.servers.len(),
            "device instance provisioned"
        );
        Ok(device)
    }

    /// Create and wait for readiness in one step.
    pub fn start(
        spec: DeviceSpec,
        runner: Arc<dyn CommandRunner>,
        connector: Arc<dyn StoreConnector>,
    ) -> Result<Self> {
        let mut device = Self::create(spec, runner, connector)?;
        device.check_ready()?;
        Ok(device)
    }

    fn runner(&self) -> &Arc<dyn CommandRunner> {
        self.runtime.runner()
    }

    fn attach(&mut self) -> Result<()> {
        let name = self.spec.name.clone();
        if !self.runtime.is_running(&name) {
            return Err(DvsError::Provision {
                name,
                reason: "no running container to attach to".into(),
            });
        }
        let pid = self.runtime.pid(&name)?;
        self.pid = Some(pid);

        let links = NetScope::Pid(pid).ip(self.runner().as_ref(), &["-o", "link", "show"])?;
        let ports = front_panel_count(&parse_link_names(&links.stdout));
        if ports == 0 || ports > self.spec.num_ports {
            return Err(DvsError::InvalidValue(format!(
                "{name}: {ports} front-panel interfaces, expected 1..={}",
                self.spec.num_ports
            )));
        }

        if self.spec.with_servers {
            for i in 0..ports {
                let server = VirtualServer::create(self.runner().clone(), &self.spec.netns_dir, &name, pid, i)?;
                self.servers.push(server);
            }
        }
        Ok(())
    }

    fn provision(&mut self) -> Result<()> {
        let name = self.spec.name.clone();
        let ns_name = format!("{name}-ns");
        let mount = self.mount_dir().display().to_string();

        self.runner().check("mkdir", &["-p", &mount])?;

        // Registered before creation so a partial run is still removed.
        self.netns_container = Some(ns_name.clone());
        self.runtime.run(&ContainerSpec {
            name: ns_name.clone(),
            image: self.spec.netns_image.clone(),
            privileged: true,
            interactive: true,
            command: vec!["bash".to_string()],
            ..Default::default()
        })?;
        let pid = self.runtime.pid(&ns_name)?;
        self.pid = Some(pid);

        if self.spec.with_servers {
            for i in 0..self.spec.num_ports {
                let server = VirtualServer::create(self.runner().clone(), &self.spec.netns_dir, &name, pid, i)?;
                self.servers.push(server);
            }
        }

        self.runtime.create(&ContainerSpec {
            name: name.clone(),
            image: self.spec.image.clone(),
            network: Some(format!("container:{ns_name}")),
            privileged: true,
            cpus: Some(self.spec.max_cpu),
            mounts: vec![(mount, REDIS_MOUNT.to_string())],
            env: self.spec.environment.clone(),
            ..Default::default()
        })?;
        if let Some(config) = &self.spec.default_config {
            self.runtime.copy_in(config, &name, CONFIG_DB_PATH)?;
        }
        self.runtime.start(&name)
    }

    /// Run the readiness gates. A no-op once ready.
    pub fn check_ready(&mut self) -> Result<()> {
        match self.state {
            DeviceState::Ready => return Ok(()),
            DeviceState::Creating | DeviceState::CheckingReadiness => {}
            other => {
                return Err(DvsError::InvalidState {
                    state: other.as_str(),
                    operation: "check_ready",
                })
            }
        }
        self.state = DeviceState::CheckingReadiness;

        let result = self.run_gates().and_then(|stores| {
            self.apply_buffer_model(&stores)?;
            Ok(stores)
        });
        match result {
            Ok(stores) => {
                self.stores = Some(stores);
                self.state = DeviceState::Ready;
                tracing::info!(name = %self.spec.name, "device instance ready");
                Ok(())
            }
            Err(err) => Err(self.fail("readiness", err)),
        }
    }

    fn run_gates(&self) -> Result<Stores> {
        self.wait_for_supervisor()?;
        let stores = self.connect_stores()?;
        self.wait_for_ports(&stores)?;
        Ok(stores)
    }

    fn wait_for_supervisor(&self) -> Result<()> {
        let config = PollingConfig::new(self.spec.poll_interval, self.spec.timeouts.supervisor, true);
        let what = format!("{} supervisor daemons", self.spec.name);
        poll(&what, &config, || match self.runtime.exec(&self.spec.name, "supervisorctl status") {
            Ok(out) => {
                let pending = pending_daemons(&parse_supervisor_status(&out.stdout));
                (pending.is_empty(), pending)
            }
            Err(err) => (false, vec![err.to_string()]),
        })?;
        tracing::debug!(name = %self.spec.name, "supervisor gate passed");
        Ok(())
    }

    fn connect_stores(&self) -> Result<Stores> {
        let socket = self.socket_path();
        let handle = |id: StoreId| -> Result<DataStoreHandle> {
            Ok(DataStoreHandle::new(id, self.connector.connect(&socket, id)?))
        };
        let asic = AsicDb::new(handle(StoreId::Asic)?, self.spec.timeouts.asic_init)?;
        Ok(Stores {
            app: handle(StoreId::Appl)?,
            asic,
            counters: handle(StoreId::Counters)?,
            config: handle(StoreId::Config)?,
            flex: handle(StoreId::Flex)?,
            state: handle(StoreId::State)?,
        })
    }

    /// Every configured port plus the CPU port exists in hardware state and
    /// the port-init markers are published.
    fn wait_for_ports(&self, stores: &Stores) -> Result<()> {
        let expected = self.spec.num_ports as usize + 1;
        let config = PollingConfig::new(self.spec.poll_interval, self.spec.timeouts.swss, true);
        let what = format!("{} port initialization", self.spec.name);
        poll(&what, &config, || {
            let hw_ports = stores.asic.handle().get_keys(ASIC_PORT_TABLE).map(|k| k.len()).unwrap_or(0);
            let app = stores.app.get_keys("PORT_TABLE").unwrap_or_default();
            let init_done = app.iter().any(|k| k == "PortInitDone");
            let config_done = app.iter().any(|k| k == "PortConfigDone");
            (
                hw_ports == expected && init_done && config_done,
                (hw_ports, init_done, config_done),
            )
        })?;
        Ok(())
    }

    fn apply_buffer_model(&self, stores: &Stores) -> Result<()> {
        if self.spec.buffer_model != BufferModel::Dynamic {
            return Ok(());
        }
        stores.config.update_entry(
            "DEVICE_METADATA",
            "localhost",
            &FieldValues::from([("buffer_model", "dynamic")]),
        )?;
        let out = self.runtime.exec(&self.spec.name, "supervisorctl restart buffermgrd")?;
        if !out.success() {
            tracing::warn!(name = %self.spec.name, output = %out.combined(), "buffermgrd restart failed");
        }
        tracing::info!(name = %self.spec.name, "dynamic buffer model enabled");
        Ok(())
    }

    /// Log what we can, tear down, and hand the error back.
    fn fail(&mut self, stage: &str, err: DvsError) -> DvsError {
        tracing::error!(name = %self.spec.name, stage, %err, "device instance failed");
        self.capture_logs();
        if let Err(cleanup) = self.destroy() {
            tracing::warn!(name = %self.spec.name, %cleanup, "teardown after failure incomplete");
        }
        err
    }

    fn capture_logs(&self) {
        match &self.spec.log_path {
            Some(dir) => match self.get_logs(dir) {
                Ok(path) => tracing::info!(path = %path.display(), "saved instance logs"),
                Err(err) => tracing::warn!(%err, "could not save instance logs"),
            },
            None => {
                if let Ok(text) = self.runtime.logs(&self.spec.name) {
                    let lines: Vec<&str> = text.lines().collect();
                    let tail = lines[lines.len().saturating_sub(20)..].join("\n");
                    tracing::error!(name = %self.spec.name, logs = %tail, "container log tail");
                }
            }
        }
    }

    /// Restart the switch and re-run readiness. Servers are kept.
    pub fn restart(&mut self) -> Result<()> {
        if matches!(self.state, DeviceState::Absent | DeviceState::Destroyed) {
            return Err(DvsError::InvalidState {
                state: self.state.as_str(),
                operation: "restart",
            });
        }
        self.stores = None;
        self.state = DeviceState::CheckingReadiness;
        if self.spec.attach {
            let out = self.runtime.exec(&self.spec.name, "supervisorctl restart all")?;
            if !out.success() {
                return Err(DvsError::Command {
                    command: "supervisorctl restart all".into(),
                    code: out.code,
                    output: out.combined(),
                });
            }
        } else {
            self.runtime.restart(&self.spec.name)?;
        }
        self.check_ready()
    }

    /// Tear the instance down. Every step is attempted; failures are
    /// collected into [`DvsError::Cleanup`]. Servers go last, after the
    /// containers. A persistent instance keeps its container; only the
    /// server namespaces it created itself are removed.
    pub fn destroy(&mut self) -> Result<()> {
        if self.state == DeviceState::Destroyed {
            return Ok(());
        }
        self.state = DeviceState::Destroyed;
        self.stores = None;

        let mut failures = Vec::new();
        let mut record = |what: String, result: Result<()>| {
            if let Err(err) = result {
                tracing::warn!(step = %what, %err, "cleanup step failed");
                failures.push(format!("{what}: {err}"));
            }
        };

        if self.spec.attach {
            tracing::info!(name = %self.spec.name, "detached from persistent instance");
        } else {
            record(format!("remove {}", self.spec.name), self.runtime.remove(&self.spec.name));
            if let Some(ns) = &self.netns_container {
                record(format!("remove {ns}"), self.runtime.remove(ns));
            }
            let mount = self.mount_dir().display().to_string();
            record(
                format!("remove {mount}"),
                self.runtime.runner().check("rm", &["-rf", &mount]).map(|_| ()),
            );
        }
        // Adopted servers make this a no-op.
        for server in self.servers.iter_mut() {
            record(format!("destroy {}", server.netns()), server.destroy());
        }

        tracing::info!(name = %self.spec.name, failed = failures.len(), "device instance destroyed");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DvsError::Cleanup(failures))
        }
    }

    /// Stop managing the instance and leave everything running.
    pub fn detach(&mut self) {
        if self.state != DeviceState::Destroyed {
            tracing::info!(name = %self.spec.name, "leaving instance running");
            self.state = DeviceState::Destroyed;
            self.stores = None;
        }
    }

    /// Delete interfaces in the switch namespace that are not on the
    /// allow-list. Returns the names removed.
    pub fn network_cleanup(&self) -> Result<Vec<String>> {
        let pid = self.pid.ok_or(DvsError::InvalidState {
            state: self.state.as_str(),
            operation: "network_cleanup",
        })?;
        let scope = NetScope::Pid(pid);
        let runner = self.runner().as_ref();
        let out = scope.ip(runner, &["-o", "link", "show"])?;
        let leaked = InterfaceAllowList::default().leaked(&parse_link_names(&out.stdout));
        for ifname in &leaked {
            link::delete_link(runner, &scope, ifname)?;
        }
        if !leaked.is_empty() {
            tracing::info!(name = %self.spec.name, removed = ?leaked, "removed leftover interfaces");
        }
        Ok(leaked)
    }

    /// `bash -c cmd` inside the switch container.
    pub fn runcmd(&self, cmd: &str) -> Result<CmdOutput> {
        self.runtime.exec(&self.spec.name, cmd)
    }

    /// Container output as text.
    pub fn logs(&self) -> Result<String> {
        self.runtime.logs(&self.spec.name)
    }

    /// Save container output and `/var/log` under `dir/<name>/`.
    pub fn get_logs(&self, dir: &Path) -> Result<PathBuf> {
        let target = dir.join(&self.spec.name);
        std::fs::create_dir_all(&target)?;
        std::fs::write(target.join("docker.log"), self.logs()?)?;
        if let Err(err) = self.runtime.copy_out(&self.spec.name, "/var/log/.", &target.join("log")) {
            tracing::warn!(name = %self.spec.name, %err, "copying /var/log failed");
        }
        Ok(target)
    }

    /// Set a port's admin state through the configuration store.
    pub fn set_interface_admin(&self, port: &str, up: bool) -> Result<()> {
        let status = if up { AdminStatus::Up } else { AdminStatus::Down };
        self.config_db()?
            .update_entry("PORT", port, &FieldValues::from([("admin_status", status.as_str())]))
    }

    /// Give a port a router interface with `cidr` through the configuration
    /// store. Traffic to the address then crosses the switch pipeline, so
    /// the port's admin state applies to it.
    pub fn add_ip_address(&self, port: &str, cidr: &str) -> Result<()> {
        let db = self.config_db()?;
        let null = FieldValues::from([("NULL", "NULL")]);
        db.create_entry("INTERFACE", port, &null)?;
        db.create_entry("INTERFACE", &format!("{port}|{cidr}"), &null)
    }

    fn stores(&self, operation: &'static str) -> Result<&Stores> {
        self.stores.as_ref().ok_or(DvsError::InvalidState {
            state: self.state.as_str(),
            operation,
        })
    }

    pub fn app_db(&self) -> Result<&DataStoreHandle> {
        Ok(&self.stores("app_db")?.app)
    }

    pub fn asic_db(&self) -> Result<&AsicDb> {
        Ok(&self.stores("asic_db")?.asic)
    }

    pub fn counters_db(&self) -> Result<&DataStoreHandle> {
        Ok(&self.stores("counters_db")?.counters)
    }

    pub fn config_db(&self) -> Result<&DataStoreHandle> {
        Ok(&self.stores("config_db")?.config)
    }

    pub fn flex_db(&self) -> Result<&DataStoreHandle> {
        Ok(&self.stores("flex_db")?.flex)
    }

    pub fn state_db(&self) -> Result<&DataStoreHandle> {
        Ok(&self.stores("state_db")?.state)
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &DeviceSpec {
        &self.spec
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn is_persistent(&self) -> bool {
        self.spec.attach
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn servers(&self) -> &[VirtualServer] {
        &self.servers
    }

    pub fn server(&self, index: usize) -> Option<&VirtualServer> {
        self.servers.get(index)
    }

    pub fn server_mut(&mut self, index: usize) -> Option<&mut VirtualServer> {
        self.servers.get_mut(index)
    }

    pub fn mount_dir(&self) -> PathBuf {
        self.spec.mount_root.join(&self.spec.name)
    }

    pub fn socket_path(&self) -> PathBuf {
        self.mount_dir().join("redis.sock")
    }
}

impl Drop for DeviceInstance {
    fn drop(&mut self) {
        if matches!(self.state, DeviceState::Absent | DeviceState::Destroyed) {
            return;
        }
        if let Err(err) = self.destroy() {
            tracing::warn!(name = %self.spec.name, %err, "teardown on drop incomplete");
        }
    }
}
