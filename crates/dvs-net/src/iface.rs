//! Interface inventory and leaked-interface detection.

use once_cell::sync::Lazy;
use regex::Regex;

/// Interface names a freshly provisioned virtual switch is expected to
/// carry. Anything else in its namespace is leftover from an earlier run.
static DEFAULT_ALLOWED: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"^lo$",
        r"^eth\d+$",
        r"^Ethernet\d+$",
        r"^Bridge$",
        r"^dummy$",
        r"^docker0$",
        r"^Loopback\d+$",
        r"^Vlan\d+$",
        r"^PortChannel\d+$",
        r"^Vrf\w*$",
        r"^sit0$",
        r"^tunl0$",
        r"^ip6tnl0$",
        r"^erspan0$",
        r"^gre0$",
        r"^gretap0$",
        r"^Vxlan\w*$",
    ]
    .iter()
    .map(|p| Regex::new(p).expect("static interface pattern"))
    .collect()
});

/// `12: Ethernet0@eth1: <BROADCAST,...` → `Ethernet0`
static LINK_LINE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^\d+:\s+([^:@\s]+)(?:@[^:\s]+)?:").expect("static link pattern"));

/// Names from `ip -o link show` (or plain `ip link show`) output.
pub fn parse_link_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| LINK_LINE.captures(line.trim_start()))
        .map(|caps| caps[1].to_string())
        .collect()
}

/// Allow-list of interface name patterns.
#[derive(Debug, Clone)]
pub struct InterfaceAllowList {
    patterns: Vec<Regex>,
}

impl Default for InterfaceAllowList {
    fn default() -> Self {
        Self {
            patterns: DEFAULT_ALLOWED.clone(),
        }
    }
}

impl InterfaceAllowList {
    pub fn with_pattern(mut self, pattern: &str) -> Result<Self, regex::Error> {
        self.patterns.push(Regex::new(pattern)?);
        Ok(self)
    }

    pub fn allows(&self, name: &str) -> bool {
        self.patterns.iter().any(|p| p.is_match(name))
    }

    /// Names from `names` not covered by any pattern.
    pub fn leaked<'a, I>(&self, names: I) -> Vec<String>
    where
        I: IntoIterator<Item = &'a String>,
    {
        names
            .into_iter()
            .filter(|n| !self.allows(n))
            .cloned()
            .collect()
    }
}
