//! veth and link manipulation across network namespaces.

use dvs_common::exec::{CmdOutput, CommandRunner};
use dvs_common::{DvsError, Result};

/// Error text emitted when a link or namespace vanished (or never existed)
/// under a concurrent create/delete. Such failures are tolerated on
/// teardown-style operations.
const MISSING_DEVICE_SIGNATURES: &[&str] = &[
    "Cannot find device",
    "does not exist",
    "No such device",
    "No such file or directory",
];

pub fn is_missing_device_race(text: &str) -> bool {
    MISSING_DEVICE_SIGNATURES.iter().any(|sig| text.contains(sig))
}

/// Swallow a failure whose output matches a known missing-device race.
pub fn tolerate_missing(result: Result<CmdOutput>) -> Result<()> {
    match result {
        Ok(_) => Ok(()),
        Err(err) if err.output_text().is_some_and(is_missing_device_race) => {
            tracing::debug!(%err, "tolerating missing-device race");
            Ok(())
        }
        Err(err) => Err(err),
    }
}

/// Where a command runs: the host, a named `ip netns`, or the network
/// namespace of a process (a container) entered with `nsenter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetScope {
    Host,
    Named(String),
    Pid(u32),
}

impl NetScope {
    /// Argument for `ip link set <dev> netns <target>`.
    pub fn netns_target(&self) -> Option<String> {
        match self {
            NetScope::Host => None,
            NetScope::Named(name) => Some(name.clone()),
            NetScope::Pid(pid) => Some(pid.to_string()),
        }
    }

    pub fn exec(&self, runner: &dyn CommandRunner, program: &str, args: &[&str]) -> Result<CmdOutput> {
        match self {
            NetScope::Host => runner.run(program, args),
            NetScope::Named(name) => {
                let mut full = vec!["netns", "exec", name.as_str(), program];
                full.extend_from_slice(args);
                runner.run("ip", &full)
            }
            NetScope::Pid(pid) => {
                let pid = pid.to_string();
                let mut full = vec!["-t", pid.as_str(), "-n", program];
                full.extend_from_slice(args);
                runner.run("nsenter", &full)
            }
        }
    }

    pub fn check(&self, runner: &dyn CommandRunner, program: &str, args: &[&str]) -> Result<CmdOutput> {
        let output = self.exec(runner, program, args)?;
        if output.success() {
            Ok(output)
        } else {
            Err(DvsError::Command {
                command: format!("[{}] {}", self, dvs_common::exec::render(program, args)),
                code: output.code,
                output: output.combined(),
            })
        }
    }

    pub fn ip(&self, runner: &dyn CommandRunner, args: &[&str]) -> Result<CmdOutput> {
        self.check(runner, "ip", args)
    }
}

impl std::fmt::Display for NetScope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NetScope::Host => write!(f, "host"),
            NetScope::Named(name) => write!(f, "netns {name}"),
            NetScope::Pid(pid) => write!(f, "pid {pid}"),
        }
    }
}

/// Create a veth pair in `scope`.
pub fn add_veth_pair(runner: &dyn CommandRunner, scope: &NetScope, a: &str, b: &str) -> Result<()> {
    scope.ip(runner, &["link", "add", a, "type", "veth", "peer", "name", b])?;
    Ok(())
}

/// Move `ifname` from `from` into the namespace `to`.
pub fn move_link(
    runner: &dyn CommandRunner,
    from: &NetScope,
    ifname: &str,
    to: &NetScope,
) -> Result<()> {
    let target = to.netns_target().unwrap_or_else(|| "1".to_string());
    from.ip(runner, &["link", "set", ifname, "netns", &target])?;
    Ok(())
}

pub fn rename_link(runner: &dyn CommandRunner, scope: &NetScope, from: &str, to: &str) -> Result<()> {
    scope.ip(runner, &["link", "set", "dev", from, "name", to])?;
    Ok(())
}

pub fn set_link_up(runner: &dyn CommandRunner, scope: &NetScope, ifname: &str, up: bool) -> Result<()> {
    let state = if up { "up" } else { "down" };
    scope.ip(runner, &["link", "set", "dev", ifname, state])?;
    Ok(())
}

pub fn add_address(runner: &dyn CommandRunner, scope: &NetScope, ifname: &str, cidr: &str) -> Result<()> {
    let output = scope.exec(runner, "ip", &["addr", "add", cidr, "dev", ifname])?;
    // Re-adding an address we already hold is fine.
    if output.success() || output.combined().contains("File exists") {
        return Ok(());
    }
    Err(DvsError::Command {
        command: format!("[{scope}] ip addr add {cidr} dev {ifname}"),
        code: output.code,
        output: output.combined(),
    })
}

/// Delete a link, tolerating it being already gone.
pub fn delete_link(runner: &dyn CommandRunner, scope: &NetScope, ifname: &str) -> Result<()> {
    tolerate_missing(scope.ip(runner, &["link", "del", ifname]))
}

pub fn set_master(runner: &dyn CommandRunner, scope: &NetScope, ifname: &str, bridge: &str) -> Result<()> {
    scope.ip(runner, &["link", "set", "dev", ifname, "master", bridge])?;
    Ok(())
}

/// Toggle IPv6 on an interface via sysctl.
pub fn set_ipv6(runner: &dyn CommandRunner, scope: &NetScope, ifname: &str, enabled: bool) -> Result<()> {
    let key = format!("net.ipv6.conf.{ifname}.disable_ipv6={}", if enabled { 0 } else { 1 });
    scope.check(runner, "sysctl", &["-w", &key])?;
    Ok(())
}

pub fn set_arp(runner: &dyn CommandRunner, scope: &NetScope, ifname: &str, enabled: bool) -> Result<()> {
    let state = if enabled { "on" } else { "off" };
    scope.ip(runner, &["link", "set", "dev", ifname, "arp", state])?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvs_common::test_util::ScriptedRunner;

    #[test]
    fn scopes_wrap_commands() {
        let runner = ScriptedRunner::new();
        NetScope::Host.exec(&runner, "ip", &["link"]).unwrap();
        NetScope::Named("vs-srv0".into()).exec(&runner, "ip", &["link"]).unwrap();
        NetScope::Pid(1234).exec(&runner, "ip", &["link"]).unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "ip link",
                "ip netns exec vs-srv0 ip link",
                "nsenter -t 1234 -n ip link",
            ]
        );
    }

    #[test]
    fn delete_tolerates_missing_device() {
        let runner = ScriptedRunner::new();
        runner.on(
            "link del eth9",
            CmdOutput::failed(1, "Cannot find device \"eth9\""),
        );
        delete_link(&runner, &NetScope::Pid(42), "eth9").unwrap();
    }

    #[test]
    fn delete_propagates_other_errors() {
        let runner = ScriptedRunner::new();
        runner.on(
            "link del eth9",
            CmdOutput::failed(2, "RTNETLINK answers: Operation not permitted"),
        );
        let err = delete_link(&runner, &NetScope::Host, "eth9").unwrap_err();
        assert!(matches!(err, DvsError::Command { code: 2, .. }));
    }

    #[test]
    fn move_to_pid_namespace() {
        let runner = ScriptedRunner::new();
        move_link(&runner, &NetScope::Host, "vs-srv01", &NetScope::Pid(77)).unwrap();
        assert_eq!(runner.calls(), vec!["ip link set vs-srv01 netns 77"]);
    }

    #[test]
    fn duplicate_address_is_ok() {
        let runner = ScriptedRunner::new();
        runner.on(
            "addr add",
            CmdOutput::failed(2, "RTNETLINK answers: File exists"),
        );
        add_address(&runner, &NetScope::Host, "eth1", "10.0.0.1/31").unwrap();
    }
}
