use std::path::Path;
use std::sync::Arc;

use dvs_common::exec::{CmdOutput, CommandRunner};
use dvs_common::Result;

use crate::link::{self, tolerate_missing, NetScope};

/// A Linux network namespace managed via `ip netns`.
///
/// Unlike a scoped guard, dropping a `Namespace` leaves it in place: whether
/// a namespace is removed depends on who owns it (see
/// [`crate::VirtualServer`]), so deletion is always an explicit
/// [`Namespace::delete`].
#[derive(Clone)]
pub struct Namespace {
    name: String,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for Namespace {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Namespace").field("name", &self.name).finish()
    }
}

impl Namespace {
    /// Whether `<netns_dir>/<name>` is present, i.e. `ip netns` knows it.
    pub fn exists(netns_dir: &Path, name: &str) -> bool {
        netns_dir.join(name).exists()
    }

    /// Create a fresh namespace, replacing any stale one with the same
    /// name, and bring loopback up.
    pub fn create(runner: Arc<dyn CommandRunner>, name: &str) -> Result<Self> {
        tolerate_missing(runner.check("ip", &["netns", "del", name]))?;
        runner.check("ip", &["netns", "add", name])?;

        let ns = Self::attach(runner, name);
        let _ = ns.exec("ip", &["link", "set", "lo", "up"]);
        tracing::debug!(netns = name, "created namespace");
        Ok(ns)
    }

    /// Handle to a namespace that already exists.
    pub fn attach(runner: Arc<dyn CommandRunner>, name: &str) -> Self {
        Self {
            name: name.to_string(),
            runner,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn scope(&self) -> NetScope {
        NetScope::Named(self.name.clone())
    }

    pub fn runner(&self) -> &dyn CommandRunner {
        self.runner.as_ref()
    }

    pub fn exec(&self, cmd: &str, args: &[&str]) -> Result<CmdOutput> {
        self.scope().exec(self.runner.as_ref(), cmd, args)
    }

    /// Run a shell snippet inside the namespace and wait for it.
    pub fn sh(&self, script: &str) -> Result<CmdOutput> {
        self.exec("bash", &["-c", script])
    }

    /// Start a shell snippet inside the namespace in the background.
    pub fn spawn_sh(&self, script: &str) -> Result<u32> {
        self.runner
            .spawn("ip", &["netns", "exec", &self.name, "bash", "-c", script])
    }

    /// Pids of every process living in the namespace.
    pub fn pids(&self) -> Result<Vec<u32>> {
        let output = self.runner.run("ip", &["netns", "pids", &self.name])?;
        if !output.success() {
            return Ok(Vec::new());
        }
        Ok(output
            .stdout
            .split_whitespace()
            .filter_map(|p| p.parse().ok())
            .collect())
    }

    /// Create a bridge inside the namespace and bring it up.
    pub fn add_bridge(&self, bridge: &str) -> Result<()> {
        let scope = self.scope();
        link::delete_link(self.runner(), &scope, bridge)?;
        scope.ip(self.runner(), &["link", "add", bridge, "type", "bridge"])?;
        link::set_link_up(self.runner(), &scope, bridge, true)
    }

    /// Remove the namespace. Already-gone is not an error.
    pub fn delete(&self) -> Result<()> {
        tolerate_missing(self.runner.check("ip", &["netns", "del", &self.name]))?;
        tracing::debug!(netns = %self.name, "deleted namespace");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvs_common::test_util::{check_privileges, unique_name, ScriptedRunner};
    use dvs_common::HostRunner;

    #[test]
    fn create_replaces_stale_namespace() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("netns del", CmdOutput::failed(1, "Cannot remove namespace file \"/var/run/netns/t0\": No such file or directory"));
        let ns = Namespace::create(runner.clone(), "t0").unwrap();
        assert_eq!(ns.name(), "t0");
        assert_eq!(
            runner.calls(),
            vec![
                "ip netns del t0",
                "ip netns add t0",
                "ip netns exec t0 ip link set lo up",
            ]
        );
    }

    #[test]
    fn pids_parses_listing() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("netns pids", CmdOutput::ok("101\n202\n"));
        let ns = Namespace::attach(runner, "t1");
        assert_eq!(ns.pids().unwrap(), vec![101, 202]);
    }

    #[test]
    fn exists_checks_netns_dir() {
        let dir = tempfile::tempdir().unwrap();
        assert!(!Namespace::exists(dir.path(), "vs-srv0"));
        std::fs::write(dir.path().join("vs-srv0"), b"").unwrap();
        assert!(Namespace::exists(dir.path(), "vs-srv0"));
    }

    #[test]
    fn create_real_namespace() {
        if !check_privileges() {
            eprintln!("Skipping test, insufficient privileges or missing tools");
            return;
        }

        let name = unique_name("dvsns");
        let ns = Namespace::create(Arc::new(HostRunner::new()), &name).unwrap();
        assert!(Namespace::exists(Path::new("/var/run/netns"), &name));
        let out = ns.exec("ip", &["link"]).unwrap();
        assert!(out.stdout.contains("lo"));
        ns.delete().unwrap();
        assert!(!Namespace::exists(Path::new("/var/run/netns"), &name));
    }
}
