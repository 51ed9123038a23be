//! ansible-playbook output parsing
//!
//! Final per-host outcomes come from the `PLAY RECAP` block. Task progress
//! lines (`ok: [web1]`, `fatal: [db1]: UNREACHABLE! => ...`) tell us which
//! hosts were touched before a run was killed. Hosts the run was expected
//! to reach but never mentioned are supplied separately, from
//! `--list-hosts` output or the artifact's selector, so a timeout marks them
//! too.

use regex::Regex;
use sdk::types::HostStatus;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

static RECAP_LINE: OnceLock<Regex> = OnceLock::new();
static PROGRESS_LINE: OnceLock<Regex> = OnceLock::new();
static HOST_COUNT_LINE: OnceLock<Regex> = OnceLock::new();

fn recap_line() -> &'static Regex {
    RECAP_LINE.get_or_init(|| {
        Regex::new(
            r"^(?P<host>\S+)\s*:\s*ok=(?P<ok>\d+)\s+changed=(?P<changed>\d+)\s+unreachable=(?P<unreachable>\d+)\s+failed=(?P<failed>\d+)",
        )
        .expect("Invalid recap pattern")
    })
}

fn progress_line() -> &'static Regex {
    PROGRESS_LINE.get_or_init(|| {
        Regex::new(
            r"^(?P<state>ok|changed|skipping|fatal|failed|unreachable|included):\s*\[(?P<host>[^\]\s]+)(?:\s*->\s*[^\]]*)?\](?::\s*(?P<flag>UNREACHABLE|FAILED)!)?",
        )
        .expect("Invalid progress pattern")
    })
}

fn host_count_line() -> &'static Regex {
    HOST_COUNT_LINE
        .get_or_init(|| Regex::new(r"^hosts \(\d+\):$").expect("Invalid host count pattern"))
}

/// Host names listed by `ansible-playbook --list-hosts`
///
/// Every play prints `hosts (N):` followed by one indented name per line.
pub fn parse_host_listing(stdout: &str) -> BTreeSet<String> {
    let mut hosts = BTreeSet::new();
    let mut block_indent: Option<usize> = None;

    for line in stdout.lines() {
        let text = line.trim();
        let indent = line.len() - line.trim_start().len();

        if let Some(parent) = block_indent {
            if !text.is_empty() && indent > parent && !text.contains(':') {
                hosts.insert(text.to_string());
                continue;
            }
            block_indent = None;
        }

        if host_count_line().is_match(text) {
            block_indent = Some(indent);
        }
    }

    hosts
}

/// Plain host names in a selector; groups like `all` and patterns are skipped
pub fn literal_hosts(selector: &str) -> BTreeSet<String> {
    selector
        .split([',', ':'])
        .map(str::trim)
        .filter(|name| !name.is_empty() && *name != "all")
        .filter(|name| !name.contains(['*', '?', '[', ']', '!', '&', '~']))
        .map(str::to_string)
        .collect()
}

/// What progress lines said about a host before the recap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Progress {
    Seen,
    Failed,
    Unreachable,
}

/// Per-host outcomes accumulated from playbook output
#[derive(Debug, Default)]
pub struct HostOutcomes {
    progress: BTreeMap<String, Progress>,
    recap: BTreeMap<String, HostStatus>,
    expected: BTreeSet<String>,
    in_recap: bool,
}

impl HostOutcomes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a complete capture
    pub fn from_output(stdout: &str) -> Self {
        let mut outcomes = Self::new();
        for line in stdout.lines() {
            outcomes.observe_line(line);
        }
        outcomes
    }

    /// Feed one line of stdout
    pub fn observe_line(&mut self, line: &str) {
        let line = line.trim_end();

        if line.starts_with("PLAY RECAP") {
            self.in_recap = true;
            return;
        }

        if self.in_recap {
            if let Some(caps) = recap_line().captures(line.trim_start()) {
                let count = |name: &str| {
                    caps.name(name)
                        .and_then(|m| m.as_str().parse::<u32>().ok())
                        .unwrap_or(0)
                };
                let status = if count("unreachable") > 0 {
                    HostStatus::Unreachable
                } else if count("failed") > 0 {
                    HostStatus::Failure
                } else {
                    HostStatus::Success
                };
                self.recap.insert(caps["host"].to_string(), status);
                return;
            }
            // A new play after the recap (multiple playbook runs in one capture)
            if line.starts_with("PLAY [") {
                self.in_recap = false;
            }
            return;
        }

        if let Some(caps) = progress_line().captures(line) {
            let host = caps["host"].to_string();
            let observed = match (&caps["state"], caps.name("flag").map(|m| m.as_str())) {
                (_, Some("UNREACHABLE")) | ("unreachable", _) => Progress::Unreachable,
                (_, Some("FAILED")) | ("fatal", _) | ("failed", _) => Progress::Failed,
                _ => Progress::Seen,
            };

            let entry = self.progress.entry(host).or_insert(Progress::Seen);
            // Failure and unreachability are sticky across later task lines
            if *entry == Progress::Seen {
                *entry = observed;
            }
        }
    }

    /// True once a recap line has been parsed
    pub fn has_recap(&self) -> bool {
        !self.recap.is_empty()
    }

    /// True once any host has been mentioned
    pub fn has_reports(&self) -> bool {
        !self.recap.is_empty() || !self.progress.is_empty()
    }

    /// Hosts the run targets, whether or not they ever print anything
    pub fn expect_hosts(&mut self, hosts: impl IntoIterator<Item = String>) {
        self.expected.extend(hosts);
    }

    /// Final status map
    ///
    /// Recap lines are authoritative. A host that only appeared in progress
    /// lines is `Timeout` if the run was killed at its deadline, otherwise the
    /// run ended without summarising it and it counts as a failure. After a
    /// timeout every expected host that never reported is `Timeout` as well;
    /// after a normal exit such hosts simply matched nothing.
    pub fn finish(self, timed_out: bool) -> BTreeMap<String, HostStatus> {
        let mut hosts = self.recap;

        for (host, progress) in self.progress {
            if hosts.contains_key(&host) {
                continue;
            }
            let status = match progress {
                Progress::Unreachable => HostStatus::Unreachable,
                Progress::Failed => HostStatus::Failure,
                Progress::Seen if timed_out => HostStatus::Timeout,
                Progress::Seen => HostStatus::Failure,
            };
            hosts.insert(host, status);
        }

        if timed_out {
            for host in self.expected {
                hosts.entry(host).or_insert(HostStatus::Timeout);
            }
        }

        hosts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIXED_RUN: &str = r#"
PLAY [web] *********************************************************************

TASK [Gathering Facts] *********************************************************
ok: [web1]
fatal: [web3]: UNREACHABLE! => {"changed": false, "msg": "Failed to connect", "unreachable": true}
ok: [web2]

TASK [check disk usage] ********************************************************
changed: [web1]
fatal: [web2]: FAILED! => {"changed": true, "cmd": "df -h /data", "rc": 1}

PLAY RECAP *********************************************************************
web1                       : ok=2    changed=1    unreachable=0    failed=0    skipped=0    rescued=0    ignored=0
web2                       : ok=1    changed=0    unreachable=0    failed=1    skipped=0    rescued=0    ignored=0
web3                       : ok=0    changed=0    unreachable=1    failed=0    skipped=0    rescued=0    ignored=0
"#;

    #[test]
    fn test_recap_determines_status() {
        let hosts = HostOutcomes::from_output(MIXED_RUN).finish(false);

        assert_eq!(hosts.len(), 3);
        assert_eq!(hosts["web1"], HostStatus::Success);
        assert_eq!(hosts["web2"], HostStatus::Failure);
        assert_eq!(hosts["web3"], HostStatus::Unreachable);
    }

    #[test]
    fn test_ignored_failure_is_success_in_recap() {
        let output = "TASK [uptime] ***\n\
                      fatal: [web1]: FAILED! => {\"rc\": 1}\n\
                      ...ignoring\n\
                      PLAY RECAP ***\n\
                      web1 : ok=2 changed=0 unreachable=0 failed=0 skipped=0 rescued=0 ignored=1\n";
        let hosts = HostOutcomes::from_output(output).finish(false);
        assert_eq!(hosts["web1"], HostStatus::Success);
    }

    #[test]
    fn test_timeout_marks_unreported_hosts() {
        let output = "TASK [Gathering Facts] ***\n\
                      ok: [web1]\n\
                      ok: [web2]\n\
                      fatal: [web3]: UNREACHABLE! => {}\n\
                      TASK [long running] ***\n\
                      fatal: [web2]: FAILED! => {}\n";
        let hosts = HostOutcomes::from_output(output).finish(true);

        assert_eq!(hosts["web1"], HostStatus::Timeout);
        assert_eq!(hosts["web2"], HostStatus::Failure);
        assert_eq!(hosts["web3"], HostStatus::Unreachable);
    }

    #[test]
    fn test_delegated_and_loop_lines() {
        let output = "ok: [web1 -> localhost]\n\
                      changed: [web2] => (item=nginx)\n\
                      failed: [web2] (item=redis) => {}\n";
        let outcomes = HostOutcomes::from_output(output);
        assert!(!outcomes.has_recap());

        let hosts = outcomes.finish(true);
        assert_eq!(hosts["web1"], HostStatus::Timeout);
        assert_eq!(hosts["web2"], HostStatus::Failure);
    }

    #[test]
    fn test_silent_expected_host_times_out() {
        let mut outcomes = HostOutcomes::from_output("TASK [Gathering Facts] ***\nok: [web1]\n");
        assert!(outcomes.has_reports());
        outcomes.expect_hosts(["web1".to_string(), "web2".to_string()]);

        let hosts = outcomes.finish(true);
        assert_eq!(hosts.len(), 2);
        assert_eq!(hosts["web1"], HostStatus::Timeout);
        assert_eq!(hosts["web2"], HostStatus::Timeout);
    }

    #[test]
    fn test_expected_hosts_ignored_after_clean_exit() {
        let mut outcomes = HostOutcomes::from_output(
            "PLAY RECAP ***\nweb1 : ok=1 changed=0 unreachable=0 failed=0\n",
        );
        outcomes.expect_hosts(["web1".to_string(), "web2".to_string()]);

        let hosts = outcomes.finish(false);
        assert_eq!(hosts.len(), 1);
        assert_eq!(hosts["web1"], HostStatus::Success);
    }

    #[test]
    fn test_host_listing() {
        let listing = "\nplaybook: /tmp/runs/a-v1.yml\n\n  \
                       play #1 (web): check disk\tTAGS: []\n    \
                       pattern: ['web']\n    \
                       hosts (2):\n      \
                       web1\n      \
                       web2\n\n  \
                       play #2 (db1): backup\tTAGS: []\n    \
                       pattern: ['db1']\n    \
                       hosts (1):\n      \
                       db1\n";
        let hosts = parse_host_listing(listing);
        assert_eq!(
            hosts.into_iter().collect::<Vec<_>>(),
            vec!["db1", "web1", "web2"]
        );
        assert!(parse_host_listing("ERROR! the playbook could not be found").is_empty());
    }

    #[test]
    fn test_literal_hosts_skip_groups_and_patterns() {
        let hosts = literal_hosts("web1, web2:all:db*:!web3");
        assert_eq!(hosts.into_iter().collect::<Vec<_>>(), vec!["web1", "web2"]);
        assert!(literal_hosts("all").is_empty());
    }

    #[test]
    fn test_no_hosts_matched() {
        let output = "[WARNING]: provided hosts list is empty, only localhost is available\n\
                      PLAY [db] ***\n\
                      skipping: no hosts matched\n\
                      PLAY RECAP ***\n";
        let hosts = HostOutcomes::from_output(output).finish(false);
        assert!(hosts.is_empty());
    }
}
