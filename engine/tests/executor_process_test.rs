//! Playbook executor against a real child process
//!
//! A small shell script stands in for ansible-playbook, so these tests cover
//! spawning, output capture, recap parsing, syntax checks, deadlines and
//! cancellation without Ansible installed.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use infrabot_engine::executor::{ArtifactExecutor, ExecutorError, PlaybookExecutor};
use sdk::types::{Artifact, HostStatus, InventoryRef};

const PLAYBOOK: &str = "- hosts: web1,web2\n  tasks:\n    - command: df -h\n";

fn fake_runner(dir: &Path, body: &str) -> PathBuf {
    let path = dir.join("fake-ansible-playbook");
    std::fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn executor(dir: &TempDir, body: &str) -> PlaybookExecutor {
    let runner = fake_runner(dir.path(), body);
    PlaybookExecutor::new(runner.display().to_string(), &dir.path().join("data"))
}

/// Shell snippet answering `--list-hosts` with web1 and web2
const LIST_HOSTS: &str = r#"case "$*" in
  *--list-hosts*)
    echo ""
    echo "playbook: $1"
    echo ""
    echo "  play #1 (web1,web2): web1,web2	TAGS: []"
    echo "    pattern: ['web1,web2']"
    echo "    hosts (2):"
    echo "      web1"
    echo "      web2"
    exit 0;;
esac"#;

fn inline_inventory() -> InventoryRef {
    InventoryRef::Path("web1,web2,".to_string())
}

#[tokio::test]
async fn test_recap_becomes_host_statuses() {
    let dir = TempDir::new().unwrap();
    let executor = executor(
        &dir,
        r#"echo "PLAY [web1,web2] ****"
echo "ok: [web1]"
echo "fatal: [web2]: FAILED! => {\"rc\": 1}"
echo ""
echo "PLAY RECAP ****"
echo "web1 : ok=1    changed=0    unreachable=0    failed=0    skipped=0"
echo "web2 : ok=0    changed=0    unreachable=0    failed=1    skipped=0"
exit 2"#,
    );
    let artifact = Artifact::new(PLAYBOOK, "web1,web2");

    let result = executor
        .execute(
            &artifact,
            &inline_inventory(),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.artifact_id, artifact.id);
    assert_eq!(result.artifact_version, 1);
    assert_eq!(result.exit_code, Some(2));
    assert!(!result.timed_out);
    assert_eq!(result.hosts.get("web1"), Some(&HostStatus::Success));
    assert_eq!(result.hosts.get("web2"), Some(&HostStatus::Failure));
    assert!(result.stdout.contains("PLAY RECAP"));
}

#[tokio::test]
async fn test_runner_receives_playbook_inventory_and_check_flag() {
    let dir = TempDir::new().unwrap();
    let executor = executor(
        &dir,
        r#"cat "$1"
echo "args: $*" >&2
echo "PLAY RECAP ****"
echo "web1 : ok=1 changed=0 unreachable=0 failed=0""#,
    )
    .with_check_mode(true);
    let artifact = Artifact::new(PLAYBOOK, "web1,web2");

    let result = executor
        .execute(
            &artifact,
            &inline_inventory(),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.stdout.contains("command: df -h"));
    assert!(result.stderr.contains("-i web1,web2,"));
    assert!(result.stderr.contains("--check"));
    assert!(result.stderr.contains(&format!("{}-v1.yml", artifact.id)));

    // The playbook file is removed once the run ends
    let written = dir
        .path()
        .join("data")
        .join("runs")
        .join(format!("{}-v1.yml", artifact.id));
    assert!(!written.exists());
}

#[tokio::test]
async fn test_deadline_kills_runner_and_marks_timeouts() {
    let dir = TempDir::new().unwrap();
    let executor = executor(
        &dir,
        &format!(
            r#"{}
echo "PLAY [web1,web2] ****"
echo "ok: [web1]"
echo "ok: [web2]"
sleep 30
echo "PLAY RECAP ****""#,
            LIST_HOSTS
        ),
    );

    let started = Instant::now();
    let result = executor
        .execute(
            &Artifact::new(PLAYBOOK, "web1,web2"),
            &inline_inventory(),
            Duration::from_millis(500),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(result.timed_out);
    assert_eq!(result.exit_code, None);
    assert_eq!(result.hosts.get("web1"), Some(&HostStatus::Timeout));
    assert_eq!(result.hosts.get("web2"), Some(&HostStatus::Timeout));
}

#[tokio::test]
async fn test_deadline_without_output_is_an_error() {
    let dir = TempDir::new().unwrap();
    let executor = executor(&dir, "sleep 30");

    let result = executor
        .execute(
            &Artifact::new(PLAYBOOK, "web1,web2"),
            &inline_inventory(),
            Duration::from_millis(300),
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(ExecutorError::Timeout(_))));
}

#[tokio::test]
async fn test_cancel_stops_runner() {
    let dir = TempDir::new().unwrap();
    let executor = executor(&dir, "echo \"ok: [web1]\"\nsleep 30");
    let cancel = CancellationToken::new();

    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let result = executor
        .execute(
            &Artifact::new(PLAYBOOK, "web1,web2"),
            &inline_inventory(),
            Duration::from_secs(60),
            &cancel,
        )
        .await;

    assert!(matches!(result, Err(ExecutorError::Cancelled)));
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_failure_without_hosts_reports_stderr() {
    let dir = TempDir::new().unwrap();
    let executor = executor(
        &dir,
        "echo 'ERROR! conflicting action statements: command, shell' >&2\nexit 4",
    );

    let result = executor
        .execute(
            &Artifact::new(PLAYBOOK, "web1,web2"),
            &inline_inventory(),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await;

    match result {
        Err(ExecutorError::Failed(msg)) => assert!(msg.contains("conflicting action statements")),
        other => panic!("expected Failed, got {:?}", other),
    }
}

#[tokio::test]
async fn test_every_host_unreachable_is_an_error() {
    let dir = TempDir::new().unwrap();
    let executor = executor(
        &dir,
        r#"echo "PLAY RECAP ****"
echo "web1 : ok=0 changed=0 unreachable=1 failed=0"
echo "web2 : ok=0 changed=0 unreachable=1 failed=0"
exit 4"#,
    );

    let result = executor
        .execute(
            &Artifact::new(PLAYBOOK, "web1,web2"),
            &inline_inventory(),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await;

    assert!(matches!(result, Err(ExecutorError::InventoryUnreachable(_))));
}

#[tokio::test]
async fn test_no_hosts_matched_is_an_empty_result() {
    let dir = TempDir::new().unwrap();
    let executor = executor(
        &dir,
        "echo '[WARNING]: Could not match supplied host pattern, ignoring: db9' >&2\nexit 0",
    );

    let result = executor
        .execute(
            &Artifact::new("- hosts: db9\n  tasks: []\n", "db9"),
            &InventoryRef::DefaultLocal,
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(result.hosts.is_empty());
    assert_eq!(result.exit_code, Some(0));
    assert!(dir
        .path()
        .join("data")
        .join("inventory")
        .join("localhost.ini")
        .exists());
}

#[tokio::test]
async fn test_version_reads_first_line() {
    let dir = TempDir::new().unwrap();
    let executor = executor(
        &dir,
        "echo 'ansible-playbook [core 2.16.3]'\necho '  config file = None'",
    );

    assert_eq!(executor.version().await.unwrap(), "ansible-playbook [core 2.16.3]");
}

#[tokio::test]
async fn test_deadline_marks_silent_listed_host_as_timeout() {
    let dir = TempDir::new().unwrap();
    let executor = executor(
        &dir,
        &format!(
            r#"{}
echo "PLAY [web1,web2] ****"
echo "ok: [web1]"
sleep 30"#,
            LIST_HOSTS
        ),
    );

    let started = Instant::now();
    let result = executor
        .execute(
            // The selector alone would not name web2
            &Artifact::new(PLAYBOOK, "webservers:&production"),
            &inline_inventory(),
            Duration::from_millis(500),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert!(started.elapsed() < Duration::from_secs(10));
    assert!(result.timed_out);
    assert_eq!(result.hosts.len(), 2);
    assert_eq!(result.hosts.get("web1"), Some(&HostStatus::Timeout));
    assert_eq!(result.hosts.get("web2"), Some(&HostStatus::Timeout));
}

#[tokio::test]
async fn test_deadline_falls_back_to_selector_hosts() {
    let dir = TempDir::new().unwrap();
    let executor = executor(
        &dir,
        r#"case "$*" in
  *--list-hosts*) echo "ERROR! inventory parse failed" >&2; exit 1;;
esac
echo "PLAY [web1,web2] ****"
echo "ok: [web1]"
sleep 30"#,
    );

    let result = executor
        .execute(
            &Artifact::new(PLAYBOOK, "web1,web2"),
            &inline_inventory(),
            Duration::from_millis(500),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.hosts.len(), 2);
    assert_eq!(result.hosts.get("web1"), Some(&HostStatus::Timeout));
    assert_eq!(result.hosts.get("web2"), Some(&HostStatus::Timeout));
}

#[tokio::test]
async fn test_recap_after_large_output_is_parsed() {
    let dir = TempDir::new().unwrap();
    let executor = executor(
        &dir,
        r#"echo "PLAY [web1,web2] ****"
yes "TASK [noise] ****************************************" | head -n 120000
echo "ok: [web1]"
echo "ok: [web2]"
echo ""
echo "PLAY RECAP ****"
echo "web1 : ok=1    changed=0    unreachable=0    failed=0    skipped=0"
echo "web2 : ok=1    changed=0    unreachable=0    failed=0    skipped=0"
exit 0"#,
    );

    let result = executor
        .execute(
            &Artifact::new(PLAYBOOK, "web1,web2"),
            &inline_inventory(),
            Duration::from_secs(30),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.hosts.get("web1"), Some(&HostStatus::Success));
    assert_eq!(result.hosts.get("web2"), Some(&HostStatus::Success));
    assert!(result.stdout.starts_with("PLAY [web1,web2]"));
    assert!(result.stdout.contains("bytes omitted"));
    assert!(result.stdout.contains("PLAY RECAP"));
    assert!(result.stdout.len() < 4 * 1024 * 1024);
}

#[tokio::test]
async fn test_syntax_check_reports_runner_error() {
    let dir = TempDir::new().unwrap();
    let executor = executor(
        &dir,
        r#"case "$*" in
  *--syntax-check*)
    echo "ERROR! 'comand' is not a valid attribute for a Task" >&2
    exit 4;;
esac
exit 0"#,
    );
    let artifact = Artifact::new(PLAYBOOK, "web1,web2");

    let rejection = executor
        .syntax_check(&artifact, &inline_inventory())
        .await
        .unwrap();

    let reason = rejection.expect("syntax error should be reported");
    assert!(reason.contains("not a valid attribute"));
    assert!(!dir
        .path()
        .join("data")
        .join("runs")
        .join(format!("{}-v1-syntax.yml", artifact.id))
        .exists());
}

#[tokio::test]
async fn test_syntax_check_passes_clean_playbook() {
    let dir = TempDir::new().unwrap();
    // Anything other than a syntax check is a failure here
    let executor = executor(
        &dir,
        r#"case "$*" in
  *"-i web1,web2, --syntax-check"*) echo "playbook: $1"; exit 0;;
esac
exit 9"#,
    );

    let rejection = executor
        .syntax_check(&Artifact::new(PLAYBOOK, "web1,web2"), &inline_inventory())
        .await
        .unwrap();
    assert_eq!(rejection, None);
}
