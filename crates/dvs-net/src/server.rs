//! # Virtual Server
//!
//! One emulated host attached to a front-panel port of a virtual switch.
//! The server lives in its own network namespace `"{ctn}-srv{i}"`; a veth
//! pair joins its `eth0` to the switch-side `eth{i+1}` inside the switch
//! container's namespace.
//!
//! When the namespace already exists (an earlier session kept its testbed
//! around) the server adopts it as-is and never deletes it.

use std::path::Path;
use std::sync::Arc;

use dvs_common::exec::{CmdOutput, CommandRunner};
use dvs_common::Result;

use crate::link::{self, NetScope};
use crate::namespace::Namespace;
use crate::ping::PingReport;

/// How a [`VirtualServer`] came to exist. Decided once at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Provision {
    /// Namespace and veth pair built by us; torn down by us.
    Created,
    /// Namespace found already present; left in place on destroy.
    Adopted,
}

impl Provision {
    pub fn cleanup_owned(self) -> bool {
        matches!(self, Provision::Created)
    }
}

pub struct VirtualServer {
    ns: Namespace,
    index: u32,
    /// Interface inside the server namespace.
    peer_ifname: String,
    /// Interface inside the switch namespace.
    device_ifname: String,
    provision: Provision,
    processes: Vec<u32>,
    destroyed: bool,
}

impl std::fmt::Debug for VirtualServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualServer")
            .field("netns", &self.ns.name())
            .field("peer_ifname", &self.peer_ifname)
            .field("device_ifname", &self.device_ifname)
            .field("provision", &self.provision)
            .field("destroyed", &self.destroyed)
            .finish()
    }
}

pub fn server_netns_name(ctn_name: &str, index: u32) -> String {
    format!("{ctn_name}-srv{index}")
}

impl VirtualServer {
    /// Build (or adopt) server `index` for the switch whose namespace is
    /// held by process `pid`.
    pub fn create(
        runner: Arc<dyn CommandRunner>,
        netns_dir: &Path,
        ctn_name: &str,
        pid: u32,
        index: u32,
    ) -> Result<Self> {
        let nsname = server_netns_name(ctn_name, index);
        let device_ifname = format!("eth{}", index + 1);

        if Namespace::exists(netns_dir, &nsname) {
            let ns = Namespace::attach(runner, &nsname);
            let mut server = Self::new(ns, index, device_ifname, Provision::Adopted);
            // Stale traffic generators from the previous session.
            server.kill_all_processes();
            tracing::info!(netns = %nsname, "adopted existing server namespace");
            return Ok(server);
        }

        let ns = Namespace::create(runner.clone(), &nsname)?;
        let server = Self::new(ns, index, device_ifname, Provision::Created);
        if let Err(err) = server.wire(pid) {
            server.unwire(pid);
            return Err(err);
        }
        tracing::debug!(netns = %nsname, port = %server.device_ifname, "created server");
        Ok(server)
    }

    fn new(ns: Namespace, index: u32, device_ifname: String, provision: Provision) -> Self {
        VirtualServer {
            ns,
            index,
            peer_ifname: "eth0".to_string(),
            device_ifname,
            provision,
            processes: Vec::new(),
            destroyed: false,
        }
    }

    /// Transient veth names, unique per (switch pid, port) and short enough
    /// for the kernel's 15-byte limit.
    fn transient_ends(&self, pid: u32) -> (String, String) {
        (format!("dv{pid}s{}a", self.index), format!("dv{pid}s{}b", self.index))
    }

    fn wire(&self, pid: u32) -> Result<()> {
        let runner = self.ns.runner();
        let host = NetScope::Host;
        let server = self.ns.scope();
        let switch = NetScope::Pid(pid);
        let (server_end, switch_end) = self.transient_ends(pid);

        // Leftovers from a run that died between these steps.
        link::delete_link(runner, &host, &server_end)?;
        link::delete_link(runner, &switch, &self.device_ifname)?;

        link::add_veth_pair(runner, &host, &server_end, &switch_end)?;
        link::move_link(runner, &host, &server_end, &server)?;
        link::move_link(runner, &host, &switch_end, &switch)?;

        link::rename_link(runner, &server, &server_end, &self.peer_ifname)?;
        link::set_link_up(runner, &server, &self.peer_ifname, true)?;
        if let Err(err) = link::set_ipv6(runner, &server, &self.peer_ifname, false) {
            tracing::debug!(%err, netns = %self.ns.name(), "disabling IPv6 skipped");
        }
        link::rename_link(runner, &switch, &switch_end, &self.device_ifname)?;
        link::set_link_up(runner, &switch, &self.device_ifname, true)?;

        // Checksum offload on veth corrupts generated packets.
        for (scope, ifname) in [(&server, &self.peer_ifname), (&switch, &self.device_ifname)] {
            if let Err(err) = scope.check(runner, "ethtool", &["-K", ifname, "tx", "off"]) {
                tracing::debug!(%err, ifname = %ifname, "ethtool offload toggle skipped");
            }
        }
        Ok(())
    }

    /// Undo a partial [`wire`](Self::wire). Deleting either end of a veth
    /// removes its peer, and deleting the namespace takes the moved server
    /// end with it. Best-effort; the wiring error is what gets reported.
    fn unwire(&self, pid: u32) {
        let runner = self.ns.runner();
        let (server_end, _) = self.transient_ends(pid);
        if let Err(err) = link::delete_link(runner, &NetScope::Host, &server_end) {
            tracing::warn!(%err, ifname = %server_end, "removing partial veth failed");
        }
        if let Err(err) = self.ns.delete() {
            tracing::warn!(%err, netns = %self.ns.name(), "removing partial server namespace failed");
        }
    }

    pub fn netns(&self) -> &str {
        self.ns.name()
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn peer_ifname(&self) -> &str {
        &self.peer_ifname
    }

    pub fn device_ifname(&self) -> &str {
        &self.device_ifname
    }

    pub fn provision(&self) -> Provision {
        self.provision
    }

    pub fn cleanup_owned(&self) -> bool {
        self.provision.cleanup_owned()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed
    }

    /// Run `cmd` in the server namespace and wait for it.
    pub fn runcmd(&self, cmd: &str) -> Result<CmdOutput> {
        self.ns.sh(cmd)
    }

    /// Start `cmd` in the server namespace without waiting. The process is
    /// killed when the server is destroyed.
    pub fn runcmd_async(&mut self, cmd: &str) -> Result<u32> {
        let pid = self.ns.spawn_sh(cmd)?;
        self.processes.push(pid);
        Ok(pid)
    }

    /// Kill everything running in the namespace, including processes we did
    /// not start ourselves. Best-effort.
    pub fn kill_all_processes(&mut self) {
        for pid in self.processes.drain(..) {
            if let Err(err) = self.ns.runner().kill(pid) {
                tracing::warn!(pid, %err, "failed to kill server process");
            }
        }
        match self.ns.pids() {
            Ok(pids) => {
                for pid in pids {
                    let pid = pid.to_string();
                    let _ = self.ns.runner().run("kill", &["-9", &pid]);
                }
            }
            Err(err) => tracing::warn!(netns = %self.ns.name(), %err, "listing namespace pids failed"),
        }
    }

    pub fn set_ipv6(&self, enabled: bool) -> Result<()> {
        link::set_ipv6(self.ns.runner(), &self.ns.scope(), &self.peer_ifname, enabled)
    }

    pub fn set_arp(&self, enabled: bool) -> Result<()> {
        link::set_arp(self.ns.runner(), &self.ns.scope(), &self.peer_ifname, enabled)
    }

    pub fn add_address(&self, cidr: &str) -> Result<()> {
        link::add_address(self.ns.runner(), &self.ns.scope(), &self.peer_ifname, cidr)
    }

    pub fn ping(&self, addr: &str, count: u32) -> Result<PingReport> {
        let count_arg = count.to_string();
        let output = self
            .ns
            .exec("ping", &["-c", &count_arg, "-i", "0.2", "-W", "1", addr])?;
        Ok(PingReport::parse(&output.stdout, count))
    }

    /// Kill owned processes and delete the namespace. No-op for adopted
    /// servers and on repeated calls.
    pub fn destroy(&mut self) -> Result<()> {
        if self.destroyed {
            return Ok(());
        }
        self.destroyed = true;
        if !self.cleanup_owned() {
            tracing::debug!(netns = %self.ns.name(), "leaving adopted server namespace in place");
            return Ok(());
        }
        self.kill_all_processes();
        self.ns.delete()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvs_common::test_util::ScriptedRunner;
    use dvs_common::DvsError;

    fn netns_dir() -> tempfile::TempDir {
        tempfile::tempdir().unwrap()
    }

    #[test]
    fn creates_namespace_and_veth() {
        let dir = netns_dir();
        let runner = Arc::new(ScriptedRunner::new());
        let server = VirtualServer::create(runner.clone(), dir.path(), "vs", 321, 2).unwrap();

        assert_eq!(server.netns(), "vs-srv2");
        assert_eq!(server.device_ifname(), "eth3");
        assert!(server.cleanup_owned());
        assert_eq!(runner.count("ip netns add vs-srv2"), 1);
        assert_eq!(runner.count("ip link add dv321s2a type veth peer name dv321s2b"), 1);
        assert_eq!(runner.count("ip link set dv321s2b netns 321"), 1);
        assert_eq!(runner.count("nsenter -t 321 -n ip link set dev dv321s2b name eth3"), 1);
        assert!(runner.position("ip link add").unwrap() < runner.position("netns 321").unwrap());
        assert_eq!(runner.count("ip netns exec vs-srv2 sysctl -w net.ipv6.conf.eth0.disable_ipv6=1"), 1);
    }

    #[test]
    fn adopts_existing_namespace() {
        let dir = netns_dir();
        std::fs::write(dir.path().join("vs-srv0"), b"").unwrap();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("netns pids", CmdOutput::ok("99\n"));

        let mut server = VirtualServer::create(runner.clone(), dir.path(), "vs", 321, 0).unwrap();
        assert_eq!(server.provision(), Provision::Adopted);
        assert!(!server.cleanup_owned());
        assert_eq!(runner.count("type veth"), 0);
        assert_eq!(runner.count("netns add"), 0);
        assert_eq!(runner.count("kill -9 99"), 1);

        server.destroy().unwrap();
        assert_eq!(runner.count("netns del"), 0);
    }

    #[test]
    fn tolerates_vanished_device_side_interface() {
        let dir = netns_dir();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("link del eth1", CmdOutput::failed(1, "Cannot find device \"eth1\""));
        VirtualServer::create(runner, dir.path(), "vs", 5, 0).unwrap();
    }

    #[test]
    fn other_veth_errors_propagate() {
        let dir = netns_dir();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("type veth", CmdOutput::failed(2, "RTNETLINK answers: File exists"));
        let err = VirtualServer::create(runner, dir.path(), "vs", 5, 0).unwrap_err();
        assert!(matches!(err, DvsError::Command { .. }));
    }

    #[test]
    fn wiring_failure_removes_partial_server() {
        let dir = netns_dir();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("link set dv7s1b netns 7", CmdOutput::failed(2, "RTNETLINK answers: Operation not permitted"));
        let err = VirtualServer::create(runner.clone(), dir.path(), "vs", 7, 1).unwrap_err();
        assert!(matches!(err, DvsError::Command { code: 2, .. }));

        // The leftover sweep before wiring, then the rollback.
        assert_eq!(runner.count("ip link del dv7s1a"), 2);
        assert_eq!(runner.count("ip netns del vs-srv1"), 2);
        assert!(runner.last_position("ip netns del vs-srv1").unwrap() > runner.position("type veth").unwrap());
    }

    #[test]
    fn destroy_kills_processes_once() {
        let dir = netns_dir();
        let runner = Arc::new(ScriptedRunner::new());
        let mut server = VirtualServer::create(runner.clone(), dir.path(), "vs", 5, 1).unwrap();
        let pid = server.runcmd_async("tcpdump -i eth0").unwrap();

        server.destroy().unwrap();
        server.destroy().unwrap();
        assert!(server.is_destroyed());
        assert_eq!(runner.killed(), vec![pid]);
        assert_eq!(runner.count("ip netns del vs-srv1"), 2); // stale check at create + destroy
    }

    #[test]
    fn ping_reports_received_count() {
        let dir = netns_dir();
        let runner = Arc::new(ScriptedRunner::new());
        runner.on(
            "ping -c 3",
            CmdOutput::ok("3 packets transmitted, 3 received, 0% packet loss"),
        );
        let server = VirtualServer::create(runner, dir.path(), "vs", 5, 0).unwrap();
        let report = server.ping("10.0.0.1", 3).unwrap();
        assert!(report.all_received());
    }
}
