use once_cell::sync::Lazy;
use regex::Regex;

static SUMMARY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(\d+) packets transmitted, (\d+) (?:packets )?received").expect("static ping pattern")
});

/// Outcome of a bounded-count ping probe.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PingReport {
    pub transmitted: u32,
    pub received: u32,
}

impl PingReport {
    /// Parse the summary line of iputils or busybox `ping`. Missing summary
    /// (e.g. `connect: Network is unreachable`) counts as nothing received.
    pub fn parse(output: &str, requested: u32) -> Self {
        match SUMMARY.captures(output) {
            Some(caps) => PingReport {
                transmitted: caps[1].parse().unwrap_or(requested),
                received: caps[2].parse().unwrap_or(0),
            },
            None => PingReport {
                transmitted: requested,
                received: 0,
            },
        }
    }

    pub fn all_received(&self) -> bool {
        self.transmitted > 0 && self.received == self.transmitted
    }
}

impl std::fmt::Display for PingReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.received, self.transmitted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_iputils_summary() {
        let out = "\
PING 10.0.0.2 (10.0.0.2) 56(84) bytes of data.
64 bytes from 10.0.0.2: icmp_seq=1 ttl=64 time=0.051 ms

--- 10.0.0.2 ping statistics ---
5 packets transmitted, 5 received, 0% packet loss, time 4087ms
";
        let report = PingReport::parse(out, 5);
        assert_eq!(report, PingReport { transmitted: 5, received: 5 });
        assert!(report.all_received());
        assert_eq!(report.to_string(), "5/5");
    }

    #[test]
    fn parses_busybox_partial_loss() {
        let out = "5 packets transmitted, 2 packets received, 60% packet loss";
        let report = PingReport::parse(out, 5);
        assert_eq!(report.received, 2);
        assert!(!report.all_received());
    }

    #[test]
    fn unreachable_counts_as_zero() {
        let report = PingReport::parse("connect: Network is unreachable", 5);
        assert_eq!(report, PingReport { transmitted: 5, received: 0 });
    }
}
