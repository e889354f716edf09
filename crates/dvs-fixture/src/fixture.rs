//! Session-wide owner of the virtual switch handed to each test module.
//!
//! One instance is shared across modules. It is recreated when
//! `force_recreate` is set or a module asks for a different environment,
//! and is otherwise network-cleaned between modules. At the end of the
//! session it is destroyed unless the testbed is kept or was attached to.

use std::collections::BTreeMap;
use std::sync::Arc;

use dvs_common::exec::CommandRunner;
use dvs_common::{FixtureOptions, Result};
use dvs_store::StoreConnector;

use crate::device::{DeviceInstance, DeviceSpec};

pub struct FixtureManager {
    options: FixtureOptions,
    runner: Arc<dyn CommandRunner>,
    connector: Arc<dyn StoreConnector>,
    current: Option<DeviceInstance>,
    /// Extra environment the current instance was created with.
    current_env: BTreeMap<String, String>,
    /// Applied to every spec the manager builds.
    customize: Option<Box<dyn Fn(&mut DeviceSpec) + Send>>,
}

impl FixtureManager {
    pub fn new(
        options: FixtureOptions,
        runner: Arc<dyn CommandRunner>,
        connector: Arc<dyn StoreConnector>,
    ) -> Self {
        FixtureManager {
            options,
            runner,
            connector,
            current: None,
            current_env: BTreeMap::new(),
            customize: None,
        }
    }

    /// Adjust every [`DeviceSpec`] before it is provisioned.
    pub fn with_spec_hook(mut self, hook: impl Fn(&mut DeviceSpec) + Send + 'static) -> Self {
        self.customize = Some(Box::new(hook));
        self
    }

    pub fn options(&self) -> &FixtureOptions {
        &self.options
    }

    pub fn current(&self) -> Option<&DeviceInstance> {
        self.current.as_ref()
    }

    /// The ready instance for `module`, creating or recycling as needed.
    pub fn acquire(&mut self, module: &str, env: &BTreeMap<String, String>) -> Result<&mut DeviceInstance> {
        let recreate = match &self.current {
            None => false,
            Some(device) if device.is_persistent() => {
                if *env != self.current_env {
                    tracing::warn!(
                        module,
                        name = %device.name(),
                        "environment change ignored for persistent instance"
                    );
                }
                false
            }
            Some(_) => self.options.force_recreate || *env != self.current_env,
        };
        if recreate {
            if let Some(mut old) = self.current.take() {
                tracing::info!(module, name = %old.name(), "recreating instance");
                old.destroy()?;
            }
        }

        let device = match self.current.take() {
            Some(mut device) => {
                device.check_ready()?;
                device.network_cleanup()?;
                tracing::debug!(module, name = %device.name(), "reusing instance");
                device
            }
            None => {
                let mut spec = DeviceSpec::from_options(&self.options);
                spec.environment.extend(env.iter().map(|(k, v)| (k.clone(), v.clone())));
                if let Some(hook) = &self.customize {
                    hook(&mut spec);
                }
                let device = DeviceInstance::start(spec, self.runner.clone(), self.connector.clone())?;
                tracing::info!(module, name = %device.name(), "instance ready for module");
                self.current_env = env.clone();
                device
            }
        };
        Ok(self.current.insert(device))
    }

    /// End of a module: save logs and, under `force_recreate`, tear down now.
    pub fn release(&mut self, module: &str) -> Result<()> {
        let Some(device) = self.current.as_mut() else {
            return Ok(());
        };
        if let Some(dir) = &self.options.log_path {
            match device.get_logs(&dir.join(module)) {
                Ok(path) => tracing::info!(module, path = %path.display(), "saved module logs"),
                Err(err) => tracing::warn!(module, %err, "saving module logs failed"),
            }
        }
        if self.options.force_recreate && !device.is_persistent() {
            if let Some(mut device) = self.current.take() {
                device.destroy()?;
            }
        }
        Ok(())
    }

    /// End of the session.
    pub fn shutdown(mut self) -> Result<()> {
        let Some(mut device) = self.current.take() else {
            return Ok(());
        };
        if self.options.keep_testbed || device.is_persistent() {
            device.detach();
            Ok(())
        } else {
            device.destroy()
        }
    }
}
