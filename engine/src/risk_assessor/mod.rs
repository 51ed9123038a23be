//! Risk assessment module
//!
//! This module classifies plan steps and generated artifacts into three risk
//! levels:
//!
//! - **Low (Read-only)**: inspection tasks such as checking disk usage
//!   - `df`, `uptime`, `command: cat ...`
//!
//! - **Medium (Mutating/Reversible)**: tasks that change state in a way that
//!   can be undone
//!   - installing packages, restarting services, editing config files
//!
//! - **High (Destructive/Irreversible)**: tasks that lose data or availability
//!   - removing files or users, reboots, formatting disks
//!
//! # Security Features
//!
//! - Destructive module arguments (`state: absent`, `rm -rf`, `mkfs`) always
//!   escalate an artifact to High, whatever the plan said
//! - Privilege escalation (`become: true`) lifts a read-only artifact to Medium
//! - All rejections are logged for audit

use sdk::errors::EngineError;
use sdk::types::RiskLevel;
use tracing::warn;

/// Verbs that make a request or step destructive
const HIGH_RISK_WORDS: &[&str] = &[
    "delete", "remove", "drop", "destroy", "wipe", "purge", "erase", "format", "reboot",
    "shutdown", "poweroff", "truncate", "kill", "uninstall", "rm",
];

/// Verbs that make a request or step mutate state
const MEDIUM_RISK_WORDS: &[&str] = &[
    "install", "update", "upgrade", "patch", "restart", "reload", "configure", "change",
    "modify", "create", "add", "write", "deploy", "start", "stop", "enable", "disable", "set",
    "copy", "move", "rename", "mount", "rotate",
];

/// Artifact fragments that are destructive regardless of the task's wording
const DESTRUCTIVE_PATTERNS: &[&str] = &[
    "state: absent",
    "rm -rf",
    "rm -fr",
    "reboot",
    "shutdown",
    "mkfs",
    "dd if=",
    "drop database",
    "drop table",
    "--force",
];

/// Modules that change the managed host
const MUTATING_MODULES: &[&str] = &[
    "apt:", "yum:", "dnf:", "package:", "pip:", "copy:", "template:", "lineinfile:",
    "blockinfile:", "service:", "systemd:", "user:", "group:", "file:", "cron:", "mount:",
    "git:", "unarchive:", "get_url:",
];

/// Risk assessor for plan steps and artifacts
///
/// # Examples
///
/// ```
/// use infrabot_engine::risk_assessor::RiskAssessor;
/// use sdk::types::RiskLevel;
///
/// let assessor = RiskAssessor::new();
///
/// assert_eq!(assessor.classify("check disk usage on web1"), RiskLevel::Low);
/// assert_eq!(assessor.classify("install nginx on web1"), RiskLevel::Medium);
/// assert_eq!(assessor.classify("delete old logs"), RiskLevel::High);
///
/// let playbook = "- hosts: web1\n  tasks:\n    - file:\n        path: /tmp/x\n        state: absent\n";
/// assert_eq!(assessor.assess_artifact(playbook), RiskLevel::High);
/// ```
#[derive(Debug, Clone, Default)]
pub struct RiskAssessor {}

impl RiskAssessor {
    /// Create a new RiskAssessor
    pub fn new() -> Self {
        Self {}
    }

    /// Classify free text (a request or a plan step description)
    pub fn classify(&self, text: &str) -> RiskLevel {
        let lowered = text.to_lowercase();
        let words: Vec<&str> = lowered
            .split(|c: char| !c.is_ascii_alphanumeric())
            .filter(|w| !w.is_empty())
            .collect();

        if words.iter().any(|w| HIGH_RISK_WORDS.contains(w)) {
            RiskLevel::High
        } else if words.iter().any(|w| MEDIUM_RISK_WORDS.contains(w)) {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        }
    }

    /// Classify a generated artifact by what it actually does
    pub fn assess_artifact(&self, content: &str) -> RiskLevel {
        let lowered = content.to_lowercase();

        if DESTRUCTIVE_PATTERNS.iter().any(|p| lowered.contains(p)) {
            return RiskLevel::High;
        }

        let mut level = if MUTATING_MODULES.iter().any(|m| contains_key(&lowered, m)) {
            RiskLevel::Medium
        } else {
            RiskLevel::Low
        };

        if has_privilege_escalation(&lowered) {
            level = level.max(RiskLevel::Medium);
        }

        level
    }

    /// Reject `level` when it exceeds `allowed`
    pub fn check_gate(&self, level: RiskLevel, allowed: RiskLevel) -> Result<(), EngineError> {
        if level > allowed {
            warn!("Risk gate rejected level {} (allowed {})", level, allowed);
            return Err(EngineError::RiskRejected {
                actual: level.to_string(),
                allowed: allowed.to_string(),
            });
        }
        Ok(())
    }
}

/// Match `key` as a YAML mapping key, with or without an FQCN prefix
fn contains_key(content: &str, key: &str) -> bool {
    content.lines().any(|line| {
        let trimmed = line.trim_start().trim_start_matches("- ");
        trimmed.starts_with(key) || trimmed.starts_with(&format!("ansible.builtin.{}", key))
    })
}

fn has_privilege_escalation(content: &str) -> bool {
    content.lines().any(|line| {
        let trimmed = line.trim_start().trim_start_matches("- ");
        matches!(
            trimmed.trim_end(),
            "become: true" | "become: yes" | "become: 'yes'" | "become: \"yes\""
        )
    })
}
