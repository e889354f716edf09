//! End-to-end tests against real virtual-switch containers.
//!
//! **Requirements:**
//! - Linux with `ip netns` and `nsenter`
//! - Root / passwordless sudo
//! - a docker daemon with the virtual-switch image pulled
//!
//! Run:
//! ```bash
//! sudo cargo test -p dvs-fixture --test virtual_switch -- --nocapture
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use dvs_common::test_util::{check_privileges, docker_available, unique_name};
use dvs_common::{CommandRunner, FixtureOptions, HostRunner};
use dvs_fixture::{DeviceState, FixtureManager, TopologyController, TopologyDescriptor};
use dvs_store::RedisConnector;

fn environment_ready(options: &FixtureOptions) -> bool {
    if !check_privileges() || !docker_available(&options.image) {
        eprintln!("Skipping test, insufficient privileges or missing docker image");
        return false;
    }
    true
}

fn runner() -> Arc<dyn CommandRunner> {
    Arc::new(HostRunner::new())
}

fn pair_topology(name: &str, a: &str, b: &str) -> Result<TopologyDescriptor> {
    let doc = serde_json::json!({
        "name": name,
        "nodes": [
            {"name": a, "ports": 4, "admin_status": "up"},
            {"name": b, "ports": 4}
        ],
        "links": [{
            "name": "l0",
            "a": {"endpoint": format!("{a}:eth1"), "address": "10.99.0.1/30", "port": "Ethernet0"},
            "b": {"endpoint": format!("{b}:eth1"), "address": "10.99.0.2/30", "port": "Ethernet0"}
        }]
    });
    Ok(TopologyDescriptor::from_json(&doc.to_string())?)
}

#[test]
fn fixture_instance_reaches_readiness_and_servers_answer() -> Result<()> {
    let options = FixtureOptions {
        num_ports: 4,
        ..FixtureOptions::from_env()?
    };
    if !environment_ready(&options) {
        return Ok(());
    }
    dvs_common::logging::init();

    let mut manager = FixtureManager::new(options, runner(), Arc::new(RedisConnector));
    let device = manager.acquire("virtual_switch", &BTreeMap::new())?;
    assert_eq!(device.state(), DeviceState::Ready);
    assert_eq!(device.servers().len(), 4);

    let server = device.server(0).context("server 0")?;
    server.add_address("10.98.0.2/24")?;
    let links = server.runcmd("ip -o link show")?;
    assert!(links.stdout.contains(server.peer_ifname()));

    manager.release("virtual_switch")?;
    manager.shutdown()?;
    Ok(())
}

#[test]
fn two_node_topology_fails_when_peer_port_is_admin_down() -> Result<()> {
    let options = FixtureOptions::from_env()?;
    if !environment_ready(&options) {
        return Ok(());
    }
    dvs_common::logging::init();

    let a = unique_name("dvsa");
    let b = unique_name("dvsb");
    let topology = pair_topology(&unique_name("e2e"), &a, &b)?;

    let mut controller = TopologyController::new(topology, options, runner(), Arc::new(RedisConnector));
    controller.build()?;
    let peer = controller.node(&b).context("node b")?;
    peer.set_interface_admin("Ethernet0", true)?;

    let report = controller.verify_with_retries(5, 10)?;
    assert!(report.passed(), "{report}");
    assert!(report.probes.iter().all(|p| p.report.received == 5));

    // b declares no admin state, so verification leaves the shutdown alone.
    let peer = controller.node(&b).context("node b")?;
    peer.set_interface_admin("Ethernet0", false)?;

    let failing = controller.verify_with_retries(5, 2)?;
    assert!(!failing.passed());
    assert!(failing.probes.iter().all(|p| p.report.received < 5), "{failing}");

    let generated = controller.veth_names();
    controller.teardown()?;

    let host_links = HostRunner::new().check("ip", &["-o", "link", "show"])?;
    for (node_end, shared_end) in generated {
        assert!(!host_links.stdout.contains(&node_end), "{node_end} left behind");
        assert!(!host_links.stdout.contains(&shared_end), "{shared_end} left behind");
    }
    Ok(())
}
