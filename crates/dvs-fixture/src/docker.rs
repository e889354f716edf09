//! Thin wrapper over the `docker` CLI, driven through a [`CommandRunner`].

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use dvs_common::exec::{CmdOutput, CommandRunner};
use dvs_common::{DvsError, Result};

/// Error text docker prints when the container is already gone.
const NO_SUCH_CONTAINER: &str = "No such container";

/// Parameters of `docker create`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    /// `--network`, e.g. `container:<other>` or `none`.
    pub network: Option<String>,
    pub privileged: bool,
    /// Keep stdin open so a bare `bash` stays alive.
    pub interactive: bool,
    pub cpus: Option<u32>,
    /// `(host path, container path)` bind mounts.
    pub mounts: Vec<(String, String)>,
    pub env: BTreeMap<String, String>,
    pub command: Vec<String>,
}

impl ContainerSpec {
    fn create_args(&self) -> Vec<String> {
        let mut args = vec!["create".to_string(), "--name".to_string(), self.name.clone()];
        if self.privileged {
            args.push("--privileged".into());
        }
        if self.interactive {
            args.push("-i".into());
        }
        if let Some(network) = &self.network {
            args.push("--network".into());
            args.push(network.clone());
        }
        if let Some(cpus) = self.cpus {
            args.push("--cpus".into());
            args.push(cpus.to_string());
        }
        for (host, ctn) in &self.mounts {
            args.push("-v".into());
            args.push(format!("{host}:{ctn}"));
        }
        for (k, v) in &self.env {
            args.push("-e".into());
            args.push(format!("{k}={v}"));
        }
        args.push(self.image.clone());
        args.extend(self.command.iter().cloned());
        args
    }
}

#[derive(Clone)]
pub struct ContainerRuntime {
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for ContainerRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerRuntime").finish_non_exhaustive()
    }
}

impl ContainerRuntime {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        ContainerRuntime { runner }
    }

    pub fn runner(&self) -> &Arc<dyn CommandRunner> {
        &self.runner
    }

    fn docker(&self, args: &[&str]) -> Result<CmdOutput> {
        self.runner.check("docker", args)
    }

    /// Create (without starting) a container; returns its id.
    pub fn create(&self, spec: &ContainerSpec) -> Result<String> {
        let args = spec.create_args();
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let out = self.docker(&args)?;
        tracing::debug!(name = %spec.name, image = %spec.image, "created container");
        Ok(out.stdout.trim().to_string())
    }

    pub fn start(&self, name: &str) -> Result<()> {
        self.docker(&["start", name])?;
        Ok(())
    }

    /// Create and start.
    pub fn run(&self, spec: &ContainerSpec) -> Result<String> {
        let id = self.create(spec)?;
        self.start(&spec.name)?;
        Ok(id)
    }

    fn inspect(&self, name: &str, format: &str) -> Result<String> {
        let out = self.docker(&["inspect", "--format", format, name])?;
        Ok(out.stdout.trim().to_string())
    }

    /// Pid of the container's init process; its network namespace is the
    /// container's.
    pub fn pid(&self, name: &str) -> Result<u32> {
        let raw = self.inspect(name, "{{.State.Pid}}")?;
        match raw.parse::<u32>() {
            Ok(pid) if pid > 0 => Ok(pid),
            _ => Err(DvsError::Provision {
                name: name.to_string(),
                reason: format!("container has no running process (pid {raw:?})"),
            }),
        }
    }

    /// Whether a container called `name` exists and is running.
    pub fn is_running(&self, name: &str) -> bool {
        match self.runner.run("docker", &["inspect", "--format", "{{.State.Running}}", name]) {
            Ok(out) => out.success() && out.stdout.trim() == "true",
            Err(_) => false,
        }
    }

    /// `bash -c cmd` inside the container. A non-zero exit is returned, not
    /// raised.
    pub fn exec(&self, name: &str, cmd: &str) -> Result<CmdOutput> {
        self.runner.run("docker", &["exec", name, "bash", "-c", cmd])
    }

    pub fn restart(&self, name: &str) -> Result<()> {
        self.docker(&["restart", name])?;
        tracing::info!(name, "restarted container");
        Ok(())
    }

    /// Force-remove; a container that is already gone is not an error.
    pub fn remove(&self, name: &str) -> Result<()> {
        match self.docker(&["rm", "-f", name]) {
            Ok(_) => Ok(()),
            Err(err) if err.output_text().is_some_and(|t| t.contains(NO_SUCH_CONTAINER)) => Ok(()),
            Err(err) => Err(err),
        }
    }

    pub fn logs(&self, name: &str) -> Result<String> {
        Ok(self.docker(&["logs", name])?.combined())
    }

    pub fn copy_in(&self, src: &Path, name: &str, dst: &str) -> Result<()> {
        let src = src.display().to_string();
        let target = format!("{name}:{dst}");
        self.docker(&["cp", &src, &target])?;
        Ok(())
    }

    pub fn copy_out(&self, name: &str, src: &str, dst: &Path) -> Result<()> {
        let source = format!("{name}:{src}");
        let dst = dst.display().to_string();
        self.docker(&["cp", &source, &dst])?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dvs_common::test_util::ScriptedRunner;

    #[test]
    fn create_args_carry_limits_mounts_and_env() {
        let spec = ContainerSpec {
            name: "vs".into(),
            image: "docker-sonic-vs:latest".into(),
            network: Some("container:vs-ns".into()),
            privileged: true,
            cpus: Some(2),
            mounts: vec![("/var/run/redis-vs/vs".into(), "/var/run/redis".into())],
            env: BTreeMap::from([("ASIC_VENDOR".to_string(), "vs".to_string())]),
            ..Default::default()
        };
        let runner = Arc::new(ScriptedRunner::new());
        ContainerRuntime::new(runner.clone()).create(&spec).unwrap();
        assert_eq!(
            runner.calls(),
            vec![
                "docker create --name vs --privileged --network container:vs-ns --cpus 2 \
                 -v /var/run/redis-vs/vs:/var/run/redis -e ASIC_VENDOR=vs docker-sonic-vs:latest"
            ]
        );
    }

    #[test]
    fn pid_rejects_stopped_container() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("inspect", CmdOutput::ok("0\n"));
        let err = ContainerRuntime::new(runner).pid("vs").unwrap_err();
        assert!(matches!(err, DvsError::Provision { .. }));
    }

    #[test]
    fn remove_tolerates_missing_container() {
        let runner = Arc::new(ScriptedRunner::new());
        runner.on("rm -f gone", CmdOutput::failed(1, "Error: No such container: gone"));
        runner.on("rm -f stuck", CmdOutput::failed(1, "device or resource busy"));
        let rt = ContainerRuntime::new(runner);
        rt.remove("gone").unwrap();
        assert!(rt.remove("stuck").is_err());
    }
}
