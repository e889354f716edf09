//! # Multi-node topologies
//!
//! A topology document names switch nodes and the links between their
//! interfaces. [`TopologyController::build`] realizes it on one host:
//!
//! - a shared namespace holding a bridge
//! - one [`DeviceInstance`] per node, attached to when a container of that
//!   name is already running
//! - per link endpoint, a veth pair with one end renamed to the declared
//!   interface inside the node and the other enslaved to the bridge
//!
//! Verification never raises: every failed step lands in the
//! [`VerificationReport`].

use std::collections::HashSet;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;

use dvs_common::exec::CommandRunner;
use dvs_common::{poll, DvsError, FixtureOptions, PollingConfig, Result};
use dvs_net::link;
use dvs_net::{Namespace, NetScope, PingReport};
use dvs_store::fields::AdminStatus;
use dvs_store::{FieldValues, StoreConnector};

use crate::device::{DeviceInstance, DeviceSpec};
use crate::docker::ContainerRuntime;

pub const DEFAULT_VERIFY_ATTEMPTS: u32 = 10;

const IFNAMSIZ: usize = 15;
const BRIDGE: &str = "topobr0";

/// Log lines that mean a daemon died.
static CRASH_SIGNATURE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(segmentation fault|core dumped|terminated by signal|SIGABRT|Traceback \(most recent call last\))")
        .expect("static crash pattern")
});

// ── Document ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct TopologyInput {
    name: String,
    #[serde(default)]
    nodes: Vec<NodeInput>,
    #[serde(default)]
    links: Vec<LinkInput>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct NodeInput {
    name: String,
    #[serde(default)]
    config: Option<PathBuf>,
    #[serde(default)]
    ports: Option<u32>,
    #[serde(default)]
    admin_status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct LinkInput {
    name: String,
    a: EndpointInput,
    b: EndpointInput,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct EndpointInput {
    endpoint: String,
    #[serde(default)]
    address: Option<String>,
    /// Switch port behind the interface, for per-port admin state.
    #[serde(default)]
    port: Option<String>,
    #[serde(default)]
    admin_status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    /// Default configuration document copied into the switch.
    pub config: Option<PathBuf>,
    pub ports: Option<u32>,
    /// Initial admin state for every configured port.
    pub admin_status: Option<AdminStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub node: String,
    pub iface: String,
    /// `addr/prefix` assigned during verification: to the port's router
    /// interface when `port` is set, otherwise to the kernel interface.
    pub address: Option<String>,
    /// Switch port behind the interface. Probes leave through it.
    pub port: Option<String>,
    pub admin_status: Option<AdminStatus>,
}

impl Endpoint {
    /// Address without its prefix length, as a ping target.
    pub fn host_address(&self) -> Option<&str> {
        self.address.as_deref().map(|a| a.split('/').next().unwrap_or(a))
    }

    /// Interface probes are sent from.
    pub fn source_interface(&self) -> &str {
        self.port.as_deref().unwrap_or(&self.iface)
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.node, self.iface)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub name: String,
    pub a: Endpoint,
    pub b: Endpoint,
}

/// A validated topology document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyDescriptor {
    pub name: String,
    pub nodes: Vec<Node>,
    pub links: Vec<Link>,
}

fn invalid(msg: impl Into<String>) -> DvsError {
    DvsError::InvalidConfig(msg.into())
}

fn parse_admin(context: &str, value: Option<String>) -> Result<Option<AdminStatus>> {
    match value {
        None => Ok(None),
        Some(v) => AdminStatus::parse(&v)
            .map(Some)
            .ok_or_else(|| invalid(format!("{context}: admin_status must be up or down, got {v:?}"))),
    }
}

fn check_cidr(context: &str, cidr: &str) -> Result<()> {
    let (addr, prefix) = cidr
        .split_once('/')
        .ok_or_else(|| invalid(format!("{context}: address {cidr:?} needs a prefix length")))?;
    let addr: IpAddr = addr
        .parse()
        .map_err(|_| invalid(format!("{context}: {addr:?} is not an IP address")))?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    match prefix.parse::<u8>() {
        Ok(p) if p <= max => Ok(()),
        _ => Err(invalid(format!("{context}: bad prefix length in {cidr:?}"))),
    }
}

impl TopologyDescriptor {
    pub fn from_json(text: &str) -> Result<Self> {
        let input: TopologyInput =
            serde_json::from_str(text).map_err(|e| invalid(format!("invalid topology JSON: {e}")))?;
        Self::validate(input)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    fn validate(input: TopologyInput) -> Result<Self> {
        let mut names = HashSet::new();
        let mut nodes = Vec::with_capacity(input.nodes.len());
        for node in input.nodes {
            if node.name.is_empty() || !names.insert(node.name.clone()) {
                return Err(invalid(format!("duplicate or empty node name {:?}", node.name)));
            }
            if node.ports == Some(0) {
                return Err(invalid(format!("node {}: ports must be at least 1", node.name)));
            }
            let admin_status = parse_admin(&node.name, node.admin_status)?;
            nodes.push(Node {
                name: node.name,
                config: node.config,
                ports: node.ports,
                admin_status,
            });
        }

        let mut link_names = HashSet::new();
        let mut used = HashSet::new();
        let mut links = Vec::with_capacity(input.links.len());
        for link in input.links {
            if !link_names.insert(link.name.clone()) {
                return Err(invalid(format!("duplicate link name {:?}", link.name)));
            }
            let mut ends = Vec::with_capacity(2);
            for ep in [link.a, link.b] {
                let context = format!("link {}", link.name);
                let (node, iface) = ep
                    .endpoint
                    .split_once(':')
                    .filter(|(n, i)| !n.is_empty() && !i.is_empty())
                    .ok_or_else(|| invalid(format!("{context}: endpoint {:?} is not node:iface", ep.endpoint)))?;
                if !names.contains(node) {
                    return Err(invalid(format!("{context}: unknown node {node:?}")));
                }
                if iface.len() > IFNAMSIZ {
                    return Err(invalid(format!("{context}: interface name {iface:?} too long")));
                }
                if !used.insert(ep.endpoint.clone()) {
                    return Err(invalid(format!("{context}: endpoint {} used twice", ep.endpoint)));
                }
                if let Some(addr) = &ep.address {
                    check_cidr(&context, addr)?;
                }
                ends.push(Endpoint {
                    node: node.to_string(),
                    iface: iface.to_string(),
                    address: ep.address,
                    port: ep.port,
                    admin_status: parse_admin(&context, ep.admin_status)?,
                });
            }
            let b = ends.pop();
            let a = ends.pop();
            if let (Some(a), Some(b)) = (a, b) {
                links.push(Link { name: link.name, a, b });
            }
        }

        Ok(TopologyDescriptor {
            name: input.name,
            nodes,
            links,
        })
    }
}

/// `{prefix}{link}{side}{end}`, with the prefix shortened to fit the
/// kernel's interface-name limit.
pub fn veth_name(prefix: &str, link: usize, side: char, end: u8) -> String {
    let suffix = format!("{link}{side}{end}");
    let keep = IFNAMSIZ.saturating_sub(suffix.len());
    let prefix: String = prefix.chars().take(keep).collect();
    format!("{prefix}{suffix}")
}

fn veth_prefix(topology: &str) -> String {
    let prefix: String = topology.chars().filter(char::is_ascii_alphanumeric).take(8).collect();
    if prefix.is_empty() {
        "dvt".to_string()
    } else {
        prefix
    }
}

// ── Verification ────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeResult {
    pub link: String,
    pub from: String,
    pub to: String,
    pub report: PingReport,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerificationReport {
    pub probes: Vec<ProbeResult>,
    /// Steps that could not be carried out.
    pub errors: Vec<String>,
    /// Crash signatures found in node logs.
    pub crashes: Vec<String>,
}

impl VerificationReport {
    pub fn passed(&self) -> bool {
        self.errors.is_empty() && self.crashes.is_empty() && self.probes.iter().all(|p| p.report.all_received())
    }
}

impl std::fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for p in &self.probes {
            writeln!(f, "{:<12} {} -> {}: {}", p.link, p.from, p.to, p.report)?;
        }
        for e in &self.errors {
            writeln!(f, "error: {e}")?;
        }
        for c in &self.crashes {
            writeln!(f, "crash: {c}")?;
        }
        write!(f, "{}", if self.passed() { "PASS" } else { "FAIL" })
    }
}

// ── Controller ──────────────────────────────────────────────────────

struct WiredEndpoint {
    node: usize,
    iface: String,
    node_end: String,
    shared_end: String,
}

pub struct TopologyController {
    topology: TopologyDescriptor,
    options: FixtureOptions,
    runner: Arc<dyn CommandRunner>,
    connector: Arc<dyn StoreConnector>,
    prefix: String,
    shared_name: String,
    shared: Option<Namespace>,
    nodes: Vec<DeviceInstance>,
    wired: Vec<WiredEndpoint>,
    spec_hook: Option<Box<dyn Fn(&mut DeviceSpec) + Send>>,
    retry_interval: Duration,
    built: bool,
    torn_down: bool,
}

impl TopologyController {
    pub fn new(
        topology: TopologyDescriptor,
        options: FixtureOptions,
        runner: Arc<dyn CommandRunner>,
        connector: Arc<dyn StoreConnector>,
    ) -> Self {
        let prefix = veth_prefix(&topology.name);
        let shared_name = options
            .topology_ns
            .clone()
            .unwrap_or_else(|| format!("{}-topo", topology.name));
        TopologyController {
            topology,
            options,
            runner,
            connector,
            prefix,
            shared_name,
            shared: None,
            nodes: Vec::new(),
            wired: Vec::new(),
            spec_hook: None,
            retry_interval: Duration::from_secs(1),
            built: false,
            torn_down: false,
        }
    }

    /// Adjust every node's [`DeviceSpec`] before it is provisioned.
    pub fn with_spec_hook(mut self, hook: impl Fn(&mut DeviceSpec) + Send + 'static) -> Self {
        self.spec_hook = Some(Box::new(hook));
        self
    }

    /// Pause between verification attempts.
    pub fn with_retry_interval(mut self, interval: Duration) -> Self {
        self.retry_interval = interval;
        self
    }

    pub fn topology(&self) -> &TopologyDescriptor {
        &self.topology
    }

    pub fn shared_namespace(&self) -> &str {
        &self.shared_name
    }

    pub fn node(&self, name: &str) -> Option<&DeviceInstance> {
        self.nodes.iter().find(|n| n.name() == name)
    }

    pub fn nodes(&self) -> &[DeviceInstance] {
        &self.nodes
    }

    /// Generated veth names, node end first, per wired endpoint.
    pub fn veth_names(&self) -> Vec<(String, String)> {
        self.wired
            .iter()
            .map(|w| (w.node_end.clone(), w.shared_end.clone()))
            .collect()
    }

    /// Realize the topology. On failure whatever was built is torn down.
    pub fn build(&mut self) -> Result<()> {
        if self.built || self.torn_down {
            return Err(DvsError::InvalidState {
                state: if self.torn_down { "torn down" } else { "built" },
                operation: "build",
            });
        }
        self.built = true;
        if let Err(err) = self.build_all() {
            tracing::error!(topology = %self.topology.name, %err, "topology build failed");
            if let Err(cleanup) = self.teardown() {
                tracing::warn!(%cleanup, "teardown after failed build incomplete");
            }
            return Err(err);
        }
        tracing::info!(
            topology = %self.topology.name,
            nodes = self.nodes.len(),
            links = self.topology.links.len(),
            "topology built"
        );
        Ok(())
    }

    fn build_all(&mut self) -> Result<()> {
        let shared = Namespace::create(self.runner.clone(), &self.shared_name)?;
        self.shared = Some(shared.clone());
        shared.add_bridge(BRIDGE)?;

        let runtime = ContainerRuntime::new(self.runner.clone());
        for node in self.topology.nodes.clone() {
            let mut spec = DeviceSpec::named(&node.name, &self.options);
            spec.attach = runtime.is_running(&node.name);
            spec.with_servers = false;
            spec.default_config = node.config.clone();
            if let Some(ports) = node.ports {
                spec.num_ports = ports;
            }
            if let Some(hook) = &self.spec_hook {
                hook(&mut spec);
            }
            let device = DeviceInstance::create(spec, self.runner.clone(), self.connector.clone())?;
            self.nodes.push(device);
        }

        for (index, link) in self.topology.links.clone().iter().enumerate() {
            self.wire(index, 'a', &link.a, &shared)?;
            self.wire(index, 'b', &link.b, &shared)?;
        }

        for node in &mut self.nodes {
            node.check_ready()?;
        }
        Ok(())
    }

    fn node_pid(&self, index: usize) -> Result<u32> {
        self.nodes[index].pid().ok_or(DvsError::InvalidState {
            state: "no namespace",
            operation: "wire",
        })
    }

    fn wire(&mut self, link_index: usize, side: char, ep: &Endpoint, shared: &Namespace) -> Result<()> {
        let node = self
            .nodes
            .iter()
            .position(|n| n.name() == ep.node)
            .ok_or_else(|| invalid(format!("unknown node {}", ep.node)))?;
        let runner = self.runner.clone();
        let runner = runner.as_ref();
        let host = NetScope::Host;
        let inside = NetScope::Pid(self.node_pid(node)?);
        let bridge_side = shared.scope();
        let node_end = veth_name(&self.prefix, link_index, side, 0);
        let shared_end = veth_name(&self.prefix, link_index, side, 1);

        // Leftovers of an earlier build.
        link::delete_link(runner, &host, &node_end)?;
        link::delete_link(runner, &bridge_side, &shared_end)?;
        link::delete_link(runner, &inside, &ep.iface)?;

        link::add_veth_pair(runner, &host, &node_end, &shared_end)?;
        self.wired.push(WiredEndpoint {
            node,
            iface: ep.iface.clone(),
            node_end: node_end.clone(),
            shared_end: shared_end.clone(),
        });
        link::move_link(runner, &host, &node_end, &inside)?;
        link::move_link(runner, &host, &shared_end, &bridge_side)?;
        link::rename_link(runner, &inside, &node_end, &ep.iface)?;
        link::set_link_up(runner, &inside, &ep.iface, true)?;
        link::set_master(runner, &bridge_side, &shared_end, BRIDGE)?;
        link::set_link_up(runner, &bridge_side, &shared_end, true)?;
        tracing::debug!(endpoint = %ep, veth = %shared_end, "wired link endpoint");
        Ok(())
    }

    fn node_by_name(&self, name: &str) -> Option<(usize, &DeviceInstance)> {
        self.nodes.iter().enumerate().find(|(_, n)| n.name() == name)
    }

    /// Bring every endpoint up, apply declared admin states, address the
    /// endpoints, then probe each link in both directions and scan node logs.
    ///
    /// Endpoints naming a switch port get their address on that port's
    /// router interface and probe from it, so a port that is
    /// administratively down fails its probes.
    pub fn verify(&self, probe_count: u32) -> VerificationReport {
        let mut report = VerificationReport::default();
        let runner = self.runner.as_ref();

        for link in &self.topology.links {
            for ep in [&link.a, &link.b] {
                let Some((_, node)) = self.node_by_name(&ep.node) else {
                    report.errors.push(format!("{ep}: node not built"));
                    continue;
                };
                let Some(pid) = node.pid() else {
                    report.errors.push(format!("{ep}: node has no namespace"));
                    continue;
                };
                let scope = NetScope::Pid(pid);
                let steps = link::set_link_up(runner, &scope, &ep.iface, false)
                    .and_then(|_| link::set_link_up(runner, &scope, &ep.iface, true))
                    .and_then(|_| match (&ep.address, &ep.port) {
                        (Some(addr), None) => link::add_address(runner, &scope, &ep.iface, addr),
                        _ => Ok(()),
                    });
                if let Err(err) = steps {
                    report.errors.push(format!("{ep}: {err}"));
                }
            }
        }

        self.apply_admin_states(&mut report);

        for link in &self.topology.links {
            for ep in [&link.a, &link.b] {
                let (Some(addr), Some(port), Some((_, node))) = (&ep.address, &ep.port, self.node_by_name(&ep.node))
                else {
                    continue;
                };
                if let Err(err) = node.add_ip_address(port, addr) {
                    report.errors.push(format!("{ep}: address {addr} on {port}: {err}"));
                }
            }
        }

        for link in &self.topology.links {
            for (from, to) in [(&link.a, &link.b), (&link.b, &link.a)] {
                let Some(target) = to.host_address() else {
                    continue;
                };
                let report_for = match self.ping(from, target, probe_count) {
                    Ok(r) => r,
                    Err(err) => {
                        report.errors.push(format!("{from} -> {target}: {err}"));
                        PingReport::parse("", probe_count)
                    }
                };
                report.probes.push(ProbeResult {
                    link: link.name.clone(),
                    from: from.to_string(),
                    to: target.to_string(),
                    report: report_for,
                });
            }
        }

        for node in &self.nodes {
            match node.logs() {
                Ok(text) => report.crashes.extend(
                    text.lines()
                        .filter(|l| CRASH_SIGNATURE.is_match(l))
                        .map(|l| format!("{}: {}", node.name(), l.trim())),
                ),
                Err(err) => report.errors.push(format!("{}: reading logs: {err}", node.name())),
            }
        }

        tracing::info!(
            topology = %self.topology.name,
            probes = report.probes.len(),
            errors = report.errors.len(),
            crashes = report.crashes.len(),
            passed = report.passed(),
            "topology verification finished"
        );
        report
    }

    fn apply_admin_states(&self, report: &mut VerificationReport) {
        let mut set = |node: &DeviceInstance, port: &str, status: AdminStatus| {
            let result = node.config_db().and_then(|db| {
                db.update_entry("PORT", port, &FieldValues::from([("admin_status", status.as_str())]))
            });
            if let Err(err) = result {
                report.errors.push(format!("{}: admin {port}: {err}", node.name()));
            }
        };

        for decl in &self.topology.nodes {
            let (Some(status), Some((_, node))) = (decl.admin_status, self.node_by_name(&decl.name)) else {
                continue;
            };
            let ports = node.config_db().and_then(|db| db.get_keys("PORT")).unwrap_or_default();
            for port in ports {
                set(node, &port, status);
            }
        }
        for link in &self.topology.links {
            for ep in [&link.a, &link.b] {
                if let (Some(port), Some(status), Some((_, node))) =
                    (&ep.port, ep.admin_status, self.node_by_name(&ep.node))
                {
                    set(node, port, status);
                }
            }
        }
    }

    fn ping(&self, from: &Endpoint, target: &str, count: u32) -> Result<PingReport> {
        let (_, node) = self
            .node_by_name(&from.node)
            .ok_or_else(|| invalid(format!("unknown node {}", from.node)))?;
        let pid = node.pid().ok_or(DvsError::InvalidState {
            state: node.state().as_str(),
            operation: "ping",
        })?;
        let count_arg = count.to_string();
        let out = NetScope::Pid(pid).exec(
            self.runner.as_ref(),
            "ping",
            &["-c", &count_arg, "-i", "0.2", "-W", "1", "-I", from.source_interface(), target],
        )?;
        Ok(PingReport::parse(&out.stdout, count))
    }

    /// [`TopologyController::verify`] until it passes, at most `attempts`
    /// times. Returns the last report either way.
    pub fn verify_with_retries(&self, probe_count: u32, attempts: u32) -> Result<VerificationReport> {
        let config = PollingConfig::attempts(attempts, self.retry_interval);
        let (_, report) = poll("topology verification", &config, || {
            let report = self.verify(probe_count);
            (report.passed(), report)
        })?;
        Ok(report)
    }

    /// Unwire links, destroy nodes in reverse order, then remove the bridge
    /// and shared namespace. Best-effort and idempotent.
    pub fn teardown(&mut self) -> Result<()> {
        if self.torn_down {
            return Ok(());
        }
        self.torn_down = true;
        let mut failures = Vec::new();
        let runner = self.runner.clone();
        let runner = runner.as_ref();

        for wired in self.wired.drain(..).rev() {
            let mut steps = vec![(NetScope::Host, wired.node_end.clone())];
            if let Some(shared) = &self.shared {
                steps.push((shared.scope(), wired.shared_end.clone()));
            }
            if let Some(pid) = self.nodes.get(wired.node).and_then(DeviceInstance::pid) {
                steps.push((NetScope::Pid(pid), wired.iface.clone()));
            }
            for (scope, ifname) in steps {
                if let Err(err) = link::delete_link(runner, &scope, &ifname) {
                    failures.push(format!("delete {ifname} in {scope}: {err}"));
                }
            }
        }

        while let Some(mut node) = self.nodes.pop() {
            if let Err(err) = node.destroy() {
                failures.push(format!("destroy {}: {err}", node.name()));
            }
        }

        if let Some(shared) = self.shared.take() {
            if let Err(err) = link::delete_link(runner, &shared.scope(), BRIDGE) {
                failures.push(format!("delete {BRIDGE}: {err}"));
            }
            if let Err(err) = shared.delete() {
                failures.push(format!("delete namespace {}: {err}", shared.name()));
            }
        }

        tracing::info!(topology = %self.topology.name, failed = failures.len(), "topology torn down");
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DvsError::Cleanup(failures))
        }
    }

    /// Stop managing the topology and leave it running.
    pub fn detach(&mut self) {
        for node in &mut self.nodes {
            node.detach();
        }
        self.torn_down = true;
    }

    /// Remove a topology left running by an earlier process: node
    /// containers, their mounts and the shared namespace.
    pub fn down(
        topology: &TopologyDescriptor,
        options: &FixtureOptions,
        runner: Arc<dyn CommandRunner>,
    ) -> Result<()> {
        let runtime = ContainerRuntime::new(runner.clone());
        let mut failures = Vec::new();
        for node in topology.nodes.iter().rev() {
            let mount = options.mount_root.join(&node.name).display().to_string();
            let steps = [
                runtime.remove(&node.name),
                runtime.remove(&format!("{}-ns", node.name)),
                runner.check("rm", &["-rf", &mount]).map(|_| ()),
            ];
            failures.extend(
                steps
                    .into_iter()
                    .filter_map(|r| r.err())
                    .map(|e| format!("{}: {e}", node.name)),
            );
        }
        let shared_name = options
            .topology_ns
            .clone()
            .unwrap_or_else(|| format!("{}-topo", topology.name));
        if let Err(err) = Namespace::attach(runner, &shared_name).delete() {
            failures.push(format!("delete namespace {shared_name}: {err}"));
        }
        if failures.is_empty() {
            Ok(())
        } else {
            Err(DvsError::Cleanup(failures))
        }
    }
}

impl Drop for TopologyController {
    fn drop(&mut self) {
        if self.built && !self.torn_down {
            if let Err(err) = self.teardown() {
                tracing::warn!(topology = %self.topology.name, %err, "teardown on drop incomplete");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::tests::{converged_connector, healthy_runner};
    use dvs_common::exec::CmdOutput;
    use dvs_common::test_util::ScriptedRunner;
    use dvs_store::StoreId;

    const TWO_NODE: &str = r#"{
        "name": "pair",
        "nodes": [
            {"name": "vs1", "ports": 2, "admin_status": "up"},
            {"name": "vs2", "ports": 2}
        ],
        "links": [
            {
                "name": "l0",
                "a": {"endpoint": "vs1:eth1", "address": "10.0.0.1/30"},
                "b": {"endpoint": "vs2:eth1", "address": "10.0.0.2/30", "port": "Ethernet0", "admin_status": "down"}
            }
        ]
    }"#;

    fn runner() -> Arc<ScriptedRunner> {
        let runner = healthy_runner();
        runner.on("{{.State.Running}}", CmdOutput::ok("false\n"));
        runner.on("ping -c", CmdOutput::ok("3 packets transmitted, 3 received, 0% packet loss"));
        runner
    }

    fn controller(runner: &Arc<ScriptedRunner>) -> TopologyController {
        let dir = std::env::temp_dir();
        let options = FixtureOptions {
            netns_dir: dir.join("dvs-topology-test-netns"),
            mount_root: dir.join("dvs-topology-test-mnt"),
            ..FixtureOptions::default()
        };
        let connector = converged_connector(2);
        connector.store(StoreId::Config).insert("PORT|Ethernet0", [("admin_status", "down")]);
        connector.store(StoreId::Config).insert("PORT|Ethernet4", [("admin_status", "down")]);
        TopologyController::new(
            TopologyDescriptor::from_json(TWO_NODE).unwrap(),
            options,
            runner.clone(),
            connector,
        )
        .with_spec_hook(|spec| spec.poll_interval = Duration::from_millis(1))
        .with_retry_interval(Duration::from_millis(1))
    }

    #[test]
    fn parses_and_validates_documents() {
        let topo = TopologyDescriptor::from_json(TWO_NODE).unwrap();
        assert_eq!(topo.nodes.len(), 2);
        assert_eq!(topo.nodes[0].admin_status, Some(AdminStatus::Up));
        assert_eq!(topo.links[0].b.to_string(), "vs2:eth1");
        assert_eq!(topo.links[0].b.host_address(), Some("10.0.0.2"));

        let bad = [
            r#"{"name": "t", "nodes": [{"name": "a"}, {"name": "a"}]}"#,
            r#"{"name": "t", "nodes": [{"name": "a"}], "links": [{"name": "l", "a": {"endpoint": "a:eth1"}, "b": {"endpoint": "b:eth1"}}]}"#,
            r#"{"name": "t", "nodes": [{"name": "a"}], "links": [{"name": "l", "a": {"endpoint": "a-eth1"}, "b": {"endpoint": "a:eth2"}}]}"#,
            r#"{"name": "t", "nodes": [{"name": "a"}], "links": [{"name": "l", "a": {"endpoint": "a:eth1", "address": "10.0.0.1"}, "b": {"endpoint": "a:eth2"}}]}"#,
            r#"{"name": "t", "nodes": [{"name": "a"}], "links": [{"name": "l", "a": {"endpoint": "a:eth1"}, "b": {"endpoint": "a:eth1"}}]}"#,
            r#"{"name": "t", "nodes": [{"name": "a", "admin_status": "sideways"}]}"#,
            r#"{"name": "t", "nodes": [{"name": "a", "colour": "blue"}]}"#,
        ];
        for doc in bad {
            assert!(
                matches!(TopologyDescriptor::from_json(doc), Err(DvsError::InvalidConfig(_))),
                "accepted {doc}"
            );
        }
    }

    #[test]
    fn veth_names_fit_interface_limit() {
        assert_eq!(veth_name("pair", 0, 'a', 1), "pair0a1");
        let long = veth_name("averylongprefix", 123, 'b', 0);
        assert_eq!(long.len(), 15);
        assert!(long.ends_with("123b0"));
        assert_eq!(veth_prefix("my-topo!"), "mytopo");
    }

    #[test]
    fn build_wires_shared_bridge_then_endpoints() {
        let runner = runner();
        let mut topo = controller(&runner);
        topo.build().unwrap();

        let ns = runner.position("ip netns add pair-topo").unwrap();
        let bridge = runner.position("link add topobr0 type bridge").unwrap();
        let first_node = runner.position("docker create --name vs1-ns").unwrap();
        let veth = runner.position("ip link add pair0a0 type veth peer name pair0a1").unwrap();
        assert!(ns < bridge && bridge < first_node && first_node < veth);

        assert_eq!(runner.count("nsenter -t 4242 -n ip link set dev pair0a0 name eth1"), 1);
        assert_eq!(runner.count("ip netns exec pair-topo ip link set dev pair0b1 master topobr0"), 1);
        // Readiness runs once the links exist.
        assert!(runner.position("supervisorctl status").unwrap() > runner.last_position("master topobr0").unwrap());
        assert_eq!(topo.nodes().len(), 2);
        assert!(topo.nodes().iter().all(|n| n.servers().is_empty()));
        assert_eq!(topo.veth_names().len(), 2);
    }

    #[test]
    fn running_node_is_attached_not_recreated() {
        let runner = runner();
        runner.on("{{.State.Running}} vs2", CmdOutput::ok("true\n"));
        runner.on("ip -o link show", CmdOutput::ok("1: lo: <LOOPBACK>\n2: eth0: <UP>\n3: eth1: <UP>"));
        let mut topo = controller(&runner);
        topo.build().unwrap();
        assert!(topo.node("vs2").unwrap().is_persistent());
        assert_eq!(runner.count("docker create --name vs2"), 0);

        topo.teardown().unwrap();
        assert_eq!(runner.count("docker rm -f vs2"), 0);
        assert_eq!(runner.count("docker rm -f vs1"), 2);
    }

    #[test]
    fn teardown_removes_generated_interfaces_in_reverse() {
        let runner = runner();
        let mut topo = controller(&runner);
        topo.build().unwrap();
        let generated = topo.veth_names();
        let before = runner.calls().len();

        topo.teardown().unwrap();
        let calls = runner.calls()[before..].to_vec();
        for (node_end, shared_end) in &generated {
            assert!(calls.iter().any(|c| c.ends_with(&format!("ip link del {node_end}"))));
            assert!(calls.iter().any(|c| c.contains(&format!("pair-topo ip link del {shared_end}"))));
        }
        let pos = |needle: &str| calls.iter().position(|c| c.contains(needle)).unwrap();
        assert!(pos("docker rm -f vs2") < pos("docker rm -f vs1"));
        assert!(pos("docker rm -f vs1") < pos("ip netns del pair-topo"));
        assert!(calls.last().unwrap().contains("ip netns del pair-topo"));

        let after = runner.calls().len();
        topo.teardown().unwrap();
        assert_eq!(runner.calls().len(), after);
    }

    #[test]
    fn verify_probes_both_directions_and_applies_admin_state() {
        let runner = runner();
        let mut topo = controller(&runner);
        topo.build().unwrap();

        let report = topo.verify(3);
        assert!(report.passed(), "{report}");
        assert_eq!(report.probes.len(), 2);
        assert_eq!(report.probes[0].to, "10.0.0.2");
        assert_eq!(report.probes[1].to, "10.0.0.1");
        assert_eq!(runner.count("ip addr add 10.0.0.1/30 dev eth1"), 1);
        assert_eq!(runner.count("ip addr add 10.0.0.2/30"), 0);
        assert!(runner.position("link set dev eth1 down").unwrap() < runner.last_position("link set dev eth1 up").unwrap());
        assert_eq!(runner.count("-I eth1 10.0.0.2"), 1);
        assert_eq!(runner.count("-I Ethernet0 10.0.0.1"), 1);

        let config = topo.node("vs1").unwrap().config_db().unwrap();
        // Both nodes share one fake store: vs1 sets every port up, then
        // the vs2 endpoint puts Ethernet0 down.
        assert_eq!(config.get_entry("PORT", "Ethernet4").unwrap().get("admin_status"), Some("up"));
        assert_eq!(config.get_entry("PORT", "Ethernet0").unwrap().get("admin_status"), Some("down"));
        assert_eq!(config.get_entry("INTERFACE", "Ethernet0|10.0.0.2/30").unwrap().get("NULL"), Some("NULL"));
    }

    #[test]
    fn port_endpoint_probes_through_the_switch_port() {
        let runner = runner();
        let mut topo = controller(&runner);
        topo.build().unwrap();

        // vs2's Ethernet0 is declared down; the pipeline drops its traffic.
        runner.on("-I Ethernet0", CmdOutput::failed(1, "3 packets transmitted, 0 received, 100% packet loss"));
        let report = topo.verify(3);
        assert!(!report.passed());
        assert!(report.errors.is_empty(), "{report}");
        assert!(report.probes[0].report.all_received());
        assert_eq!(report.probes[1].from, "vs2:eth1");
        assert_eq!(report.probes[1].report.received, 0);

        let config = topo.node("vs2").unwrap().config_db().unwrap();
        assert_eq!(config.get_entry("PORT", "Ethernet0").unwrap().get("admin_status"), Some("down"));
        assert_eq!(config.get_entry("INTERFACE", "Ethernet0").unwrap().get("NULL"), Some("NULL"));
    }

    #[test]
    fn node_failure_tears_down_what_was_built() {
        let runner = runner();
        runner.on("docker create --name vs2-ns", CmdOutput::failed(125, "Conflict. The container name is already in use"));
        let mut topo = controller(&runner);

        let err = topo.build().unwrap_err();
        assert!(matches!(err, DvsError::Command { code: 125, .. }));
        assert_eq!(runner.count("type veth"), 0);
        let failed = runner.position("docker create --name vs2-ns").unwrap();
        assert!(runner.last_position("docker rm -f vs1").unwrap() > failed);
        assert_eq!(runner.count("docker rm -f vs1"), 2);
        assert!(runner.last_position("ip netns del pair-topo").unwrap() > failed);
        assert!(topo.nodes().is_empty());
        assert!(matches!(topo.build().unwrap_err(), DvsError::InvalidState { .. }));
    }

    #[test]
    fn wiring_failure_removes_wired_veths() {
        let runner = runner();
        runner.on("master topobr0", CmdOutput::failed(2, "RTNETLINK answers: Operation not supported"));
        let mut topo = controller(&runner);

        assert!(matches!(topo.build().unwrap_err(), DvsError::Command { code: 2, .. }));
        let failed = runner.position("master topobr0").unwrap();
        let calls = runner.calls()[failed..].to_vec();
        assert!(calls.iter().any(|c| c.ends_with("ip link del pair0a0")));
        assert!(calls.iter().any(|c| c.contains("pair-topo ip link del pair0a1")));
        assert!(calls.iter().any(|c| c.contains("docker rm -f vs1")));
        assert!(calls.iter().any(|c| c.contains("docker rm -f vs2")));
        assert!(calls.last().unwrap().contains("ip netns del pair-topo"));
        assert!(topo.veth_names().is_empty());
    }

    #[test]
    fn failed_probe_or_crash_fails_verification() {
        let runner = runner();
        let mut topo = controller(&runner);
        topo.build().unwrap();

        runner.on("eth1 10.0.0.2", CmdOutput::failed(1, "3 packets transmitted, 0 received, 100% packet loss"));
        let report = topo.verify(3);
        assert!(!report.passed());
        assert_eq!(report.probes[0].report.received, 0);
        assert!(report.probes[1].report.all_received());

        runner.on("eth1 10.0.0.2", CmdOutput::ok("3 packets transmitted, 3 received"));
        runner.on("docker logs vs2", CmdOutput::ok("orchagent: Segmentation fault (core dumped)"));
        let report = topo.verify(3);
        assert_eq!(report.crashes.len(), 1);
        assert!(!report.passed());
    }

    #[test]
    fn verify_with_retries_stops_on_success_or_cap() {
        let runner = runner();
        let mut topo = controller(&runner);
        topo.build().unwrap();

        runner.on_sequence(
            "ping -c",
            vec![
                CmdOutput::ok("1 packets transmitted, 0 received"),
                CmdOutput::ok("1 packets transmitted, 1 received"),
            ],
        );
        let report = topo.verify_with_retries(1, DEFAULT_VERIFY_ATTEMPTS).unwrap();
        assert!(report.passed());
        assert_eq!(runner.count("ping -c 1"), 4);

        runner.on("ping -c", CmdOutput::ok("1 packets transmitted, 0 received"));
        let report = topo.verify_with_retries(1, 3).unwrap();
        assert!(!report.passed());
        assert_eq!(runner.count("ping -c 1"), 4 + 6);
    }

    #[test]
    fn down_removes_leftover_nodes() {
        let runner = Arc::new(ScriptedRunner::new());
        let topo = TopologyDescriptor::from_json(TWO_NODE).unwrap();
        TopologyController::down(&topo, &FixtureOptions::default(), runner.clone()).unwrap();
        assert!(runner.position("docker rm -f vs2").unwrap() < runner.position("docker rm -f vs1").unwrap());
        assert_eq!(runner.count("ip netns del pair-topo"), 1);
    }
}
