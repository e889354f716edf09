//! Helpers for tests across the workspace.

use std::collections::VecDeque;
use std::process::Command;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use crate::error::Result;
use crate::exec::{render, CmdOutput, CommandRunner};

/// Monotonically increasing counter for generating unique test resource names.
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Check whether we have sufficient privileges (root/sudo) and tools (`ip`)
/// available to create network namespaces. Returns `false` if the test
/// environment cannot support namespace-based tests.
pub fn check_privileges() -> bool {
    match Command::new("ip").arg("netns").output() {
        Ok(o) => o.status.success(),
        Err(_) => false,
    }
}

/// Whether a docker daemon answers and the virtual-switch image is present.
pub fn docker_available(image: &str) -> bool {
    match Command::new("docker").args(["image", "inspect", image]).output() {
        Ok(o) => o.status.success(),
        Err(_) => false,
    }
}

/// Generates a unique name with the given prefix, truncated to 15
/// characters to respect the Linux interface name limit.
pub fn unique_name(prefix: &str) -> String {
    let seq = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
    let pid = std::process::id();
    let name = format!("{}{:x}{}", prefix, pid % 0xFFFF, seq);
    if name.len() > 15 {
        name[..15].to_string()
    } else {
        name
    }
}

struct Rule {
    needle: String,
    outputs: VecDeque<CmdOutput>,
}

/// A [`CommandRunner`] that records every command and answers from canned
/// rules instead of touching the host.
///
/// A rule matches when its needle is a substring of the rendered command
/// line. Later rules win over earlier ones. A rule with several outputs
/// hands them out in order and then repeats the last one. Unmatched
/// commands succeed with empty output.
#[derive(Default)]
pub struct ScriptedRunner {
    rules: Mutex<Vec<Rule>>,
    calls: Mutex<Vec<String>>,
    killed: Mutex<Vec<u32>>,
    next_pid: AtomicU32,
}

impl ScriptedRunner {
    pub fn new() -> Self {
        ScriptedRunner {
            next_pid: AtomicU32::new(4000),
            ..Default::default()
        }
    }

    pub fn on(&self, needle: &str, output: CmdOutput) -> &Self {
        self.on_sequence(needle, vec![output])
    }

    pub fn on_sequence(&self, needle: &str, outputs: Vec<CmdOutput>) -> &Self {
        self.rules.lock().unwrap().push(Rule {
            needle: needle.to_string(),
            outputs: outputs.into(),
        });
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, needle: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|c| c.contains(needle))
            .count()
    }

    /// Index of the first recorded command containing `needle`.
    pub fn position(&self, needle: &str) -> Option<usize> {
        self.calls.lock().unwrap().iter().position(|c| c.contains(needle))
    }

    /// Index of the last recorded command containing `needle`.
    pub fn last_position(&self, needle: &str) -> Option<usize> {
        self.calls.lock().unwrap().iter().rposition(|c| c.contains(needle))
    }

    pub fn killed(&self) -> Vec<u32> {
        self.killed.lock().unwrap().clone()
    }

    fn answer(&self, line: &str) -> CmdOutput {
        let mut rules = self.rules.lock().unwrap();
        for rule in rules.iter_mut().rev() {
            if line.contains(&rule.needle) {
                return if rule.outputs.len() > 1 {
                    rule.outputs.pop_front().unwrap_or_default()
                } else {
                    rule.outputs.front().cloned().unwrap_or_default()
                };
            }
        }
        CmdOutput::default()
    }
}

impl CommandRunner for ScriptedRunner {
    fn run(&self, program: &str, args: &[&str]) -> Result<CmdOutput> {
        let line = render(program, args);
        let output = self.answer(&line);
        self.calls.lock().unwrap().push(line);
        Ok(output)
    }

    fn spawn(&self, program: &str, args: &[&str]) -> Result<u32> {
        self.calls.lock().unwrap().push(render(program, args));
        Ok(self.next_pid.fetch_add(1, Ordering::Relaxed))
    }

    fn kill(&self, pid: u32) -> Result<()> {
        self.killed.lock().unwrap().push(pid);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unique_names_fit_interface_limit() {
        let long = unique_name("dvs-topology-ns");
        assert_eq!(long.len(), 15);
        assert_ne!(unique_name("x"), unique_name("x"));
    }

    #[test]
    fn scripted_rules_sequence_then_repeat() {
        let runner = ScriptedRunner::new();
        runner.on_sequence(
            "supervisorctl",
            vec![CmdOutput::ok("first"), CmdOutput::ok("second")],
        );
        runner.on("docker rm", CmdOutput::failed(1, "No such container"));

        let a = runner.run("docker", &["exec", "vs", "supervisorctl", "status"]).unwrap();
        let b = runner.run("docker", &["exec", "vs", "supervisorctl", "status"]).unwrap();
        let c = runner.run("docker", &["exec", "vs", "supervisorctl", "status"]).unwrap();
        assert_eq!(a.stdout, "first");
        assert_eq!(b.stdout, "second");
        assert_eq!(c.stdout, "second");

        assert!(runner.check("docker", &["rm", "-f", "vs"]).is_err());
        assert!(runner.run("true", &[]).unwrap().success());
        assert_eq!(runner.count("supervisorctl"), 3);
        assert_eq!(runner.position("docker rm"), Some(3));
    }

    #[test]
    fn later_rules_override_earlier() {
        let runner = ScriptedRunner::new();
        runner.on("ip link", CmdOutput::ok("old"));
        runner.on("ip link", CmdOutput::ok("new"));
        assert_eq!(runner.run("ip", &["link", "show"]).unwrap().stdout, "new");
    }
}
