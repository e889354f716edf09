//! dvs-topo
//!
//! Bring a multi-switch topology up, verify it, or tear it down from the
//! command line. Options come from `DVS_CONFIG` and `DVS_*` variables.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};

use dvs_common::{CommandRunner, FixtureOptions, HostRunner};
use dvs_fixture::topology::DEFAULT_VERIFY_ATTEMPTS;
use dvs_fixture::{TopologyController, TopologyDescriptor};
use dvs_store::RedisConnector;

/// Virtual-switch topology driver.
#[derive(Parser, Debug)]
#[command(name = "dvs-topo", about = "Build and verify virtual-switch topologies")]
struct Cli {
    /// Topology document (JSON). Defaults to DVS_TOPOLOGY.
    #[arg(long, short)]
    topology: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build the topology and leave it running.
    Up,
    /// Build (attaching to running nodes), verify, and leave it running.
    Verify {
        /// Echo requests per direction and link.
        #[arg(long, default_value_t = 5)]
        probes: u32,
        #[arg(long, default_value_t = DEFAULT_VERIFY_ATTEMPTS)]
        attempts: u32,
    },
    /// Build, verify, then tear everything down.
    Check {
        #[arg(long, default_value_t = 5)]
        probes: u32,
        #[arg(long, default_value_t = DEFAULT_VERIFY_ATTEMPTS)]
        attempts: u32,
    },
    /// Remove a topology left running by `up`.
    Down,
}

fn main() -> Result<()> {
    dvs_common::logging::init();
    let cli = Cli::parse();

    let options = FixtureOptions::from_env().context("loading fixture options")?;
    let path = cli
        .topology
        .or_else(|| options.topology.clone())
        .context("no topology given (use --topology or DVS_TOPOLOGY)")?;
    let topology = TopologyDescriptor::from_file(&path)
        .with_context(|| format!("loading topology {}", path.display()))?;
    let runner: Arc<dyn CommandRunner> = Arc::new(HostRunner::new().with_sudo(options.sudo));

    tracing::info!(topology = %topology.name, path = %path.display(), "dvs-topo starting");

    let connector = Arc::new(RedisConnector);
    let (probes, attempts, keep) = match cli.command {
        Command::Down => {
            TopologyController::down(&topology, &options, runner)?;
            tracing::info!("topology removed");
            return Ok(());
        }
        Command::Up => {
            let mut controller = TopologyController::new(topology, options, runner, connector);
            controller.build().context("building topology")?;
            controller.detach();
            return Ok(());
        }
        Command::Verify { probes, attempts } => (probes, attempts, true),
        Command::Check { probes, attempts } => (probes, attempts, false),
    };

    let mut controller = TopologyController::new(topology, options, runner, connector);
    controller.build().context("building topology")?;
    let report = controller.verify_with_retries(probes, attempts)?;
    println!("{report}");
    if keep {
        controller.detach();
    } else {
        controller.teardown()?;
    }
    if !report.passed() {
        bail!("topology verification failed");
    }
    Ok(())
}
