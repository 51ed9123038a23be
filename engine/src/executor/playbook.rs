//! ansible-playbook executor
//!
//! Writes the artifact to `<data_dir>/runs/`, spawns the playbook runner in
//! its own process group and waits for it, the deadline, or cancellation,
//! whichever comes first. On deadline or cancellation the whole group is
//! killed so that no SSH or module subprocess outlives the run.
//!
//! Stdout is parsed line by line while it streams, so the recap is seen no
//! matter how much output precedes it. Only a bounded head and tail of each
//! stream is kept as text.

use async_trait::async_trait;
use sdk::types::{Artifact, ExecutionResult, HostStatus, InventoryRef};
use std::collections::{BTreeSet, VecDeque};
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::recap::{literal_hosts, parse_host_listing, HostOutcomes};
use super::{ArtifactExecutor, ExecutorError};

/// Inventory written for requests that target the local machine
const LOCAL_INVENTORY: &str = "[local]\n\
localhost ansible_connection=local\n\
\n\
[all:vars]\n\
ansible_python_interpreter=auto_silent\n";

/// Bytes kept from the start of each stream
const HEAD_BYTES: usize = 2 * 1024 * 1024;

/// Bytes kept from the end of each stream, where the recap lives
const TAIL_BYTES: usize = 256 * 1024;

/// Longest single line handed to the host parser
const MAX_LINE_BYTES: usize = 64 * 1024;

/// Grace period for output readers after the process is gone
const READER_GRACE: Duration = Duration::from_secs(2);

/// Deadline for `--version`
const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Deadline for `--syntax-check`
const SYNTAX_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Deadline for `--list-hosts` after a run has timed out
const LIST_HOSTS_TIMEOUT: Duration = Duration::from_secs(5);

/// ansible-playbook exit code for "one or more hosts unreachable"
const EXIT_HOSTS_UNREACHABLE: i32 = 3;

/// Executes playbooks with an external runner
#[derive(Debug, Clone)]
pub struct PlaybookExecutor {
    program: String,
    runs_dir: PathBuf,
    inventory_dir: PathBuf,
    check_mode: bool,
}

/// How the wait ended
enum Outcome {
    Exited(Option<i32>),
    TimedOut,
    Cancelled,
}

/// A short helper invocation that ran to completion
struct Finished {
    code: Option<i32>,
    stdout: String,
    stderr: String,
}

impl PlaybookExecutor {
    /// Create an executor storing its files under `data_dir`
    pub fn new(program: impl Into<String>, data_dir: &Path) -> Self {
        Self {
            program: program.into(),
            runs_dir: data_dir.join("runs"),
            inventory_dir: data_dir.join("inventory"),
            check_mode: false,
        }
    }

    /// Pass `--check` so the runner only reports what it would change
    pub fn with_check_mode(mut self, check_mode: bool) -> Self {
        self.check_mode = check_mode;
        self
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Run `<program> --version` and return its first line
    pub async fn version(&self) -> Result<String, ExecutorError> {
        let done = self
            .run_bounded(&[OsString::from("--version")], VERSION_TIMEOUT)
            .await?;

        if done.code != Some(0) {
            return Err(ExecutorError::Failed(format!(
                "{} --version exited with {:?}",
                self.program, done.code
            )));
        }

        Ok(done
            .stdout
            .lines()
            .next()
            .unwrap_or_default()
            .trim()
            .to_string())
    }

    fn spawn_error(&self, e: std::io::Error) -> ExecutorError {
        if e.kind() == std::io::ErrorKind::NotFound {
            ExecutorError::Failed(format!("'{}' not found on PATH", self.program))
        } else {
            ExecutorError::Failed(format!("failed to spawn '{}': {}", self.program, e))
        }
    }

    /// Runner command in its own process group with piped output
    fn command(&self, args: &[OsString]) -> Command {
        let mut std_cmd = std::process::Command::new(&self.program);
        std_cmd
            .args(args)
            .env("ANSIBLE_NOCOLOR", "1")
            .env("ANSIBLE_FORCE_COLOR", "0")
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }
        let mut cmd = Command::from(std_cmd);
        cmd.kill_on_drop(true);
        cmd
    }

    /// Run a helper invocation to completion, killing its group at `limit`
    async fn run_bounded(
        &self,
        args: &[OsString],
        limit: Duration,
    ) -> Result<Finished, ExecutorError> {
        let mut child = self.command(args).spawn().map_err(|e| self.spawn_error(e))?;
        let stdout_reader = spawn_capture(child.stdout.take(), false);
        let stderr_reader = spawn_capture(child.stderr.take(), false);

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Outcome::Exited(status.code()),
                Err(e) => return Err(ExecutorError::Io(e)),
            },
            _ = tokio::time::sleep(limit) => Outcome::TimedOut,
        };

        let code = match outcome {
            Outcome::Exited(code) => code,
            _ => {
                terminate(&mut child).await;
                return Err(ExecutorError::Timeout(limit.as_secs()));
            }
        };

        Ok(Finished {
            code,
            stdout: join_capture(stdout_reader).await.text,
            stderr: join_capture(stderr_reader).await.text,
        })
    }

    /// Resolve the inventory argument passed with `-i`
    async fn resolve_inventory(&self, inventory: &InventoryRef) -> Result<String, ExecutorError> {
        match inventory {
            InventoryRef::DefaultLocal => {
                tokio::fs::create_dir_all(&self.inventory_dir).await?;
                let path = self.inventory_dir.join("localhost.ini");
                if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                    tokio::fs::write(&path, LOCAL_INVENTORY).await?;
                }
                Ok(path.display().to_string())
            }
            // Inline host lists ("web1,web2,") are handed through untouched
            InventoryRef::Path(spec) if spec.contains(',') => Ok(spec.clone()),
            InventoryRef::Path(path) => {
                if tokio::fs::try_exists(path).await.unwrap_or(false) {
                    Ok(path.clone())
                } else {
                    Err(ExecutorError::InventoryUnreachable(format!(
                        "inventory '{}' does not exist",
                        path
                    )))
                }
            }
        }
    }

    async fn write_artifact(
        &self,
        artifact: &Artifact,
        suffix: &str,
    ) -> Result<PathBuf, ExecutorError> {
        tokio::fs::create_dir_all(&self.runs_dir).await?;
        let path = self.runs_dir.join(format!(
            "{}-v{}{}.yml",
            artifact.id, artifact.version, suffix
        ));
        tokio::fs::write(&path, &artifact.content).await?;
        Ok(path)
    }

    /// Hosts a timed-out run was aimed at
    ///
    /// Asks the runner with `--list-hosts`; when that fails the plain host
    /// names of the artifact's selector are used.
    async fn expected_hosts(
        &self,
        playbook: &Path,
        inventory: &str,
        artifact: &Artifact,
    ) -> BTreeSet<String> {
        let args = [
            playbook.as_os_str().to_os_string(),
            OsString::from("-i"),
            OsString::from(inventory),
            OsString::from("--list-hosts"),
        ];
        match self.run_bounded(&args, LIST_HOSTS_TIMEOUT).await {
            Ok(done) if done.code == Some(0) => {
                let listed = parse_host_listing(&done.stdout);
                if !listed.is_empty() {
                    return listed;
                }
                debug!("--list-hosts named no hosts; using the selector");
            }
            Ok(done) => debug!("--list-hosts exited with {:?}; using the selector", done.code),
            Err(e) => debug!("--list-hosts failed ({}); using the selector", e),
        }
        literal_hosts(&artifact.target_selector)
    }
}

#[async_trait]
impl ArtifactExecutor for PlaybookExecutor {
    async fn execute(
        &self,
        artifact: &Artifact,
        inventory: &InventoryRef,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<ExecutionResult, ExecutorError> {
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }

        let inventory_arg = self.resolve_inventory(inventory).await?;
        let playbook_path = self.write_artifact(artifact, "").await?;

        let mut args = vec![
            playbook_path.as_os_str().to_os_string(),
            OsString::from("-i"),
            OsString::from(&inventory_arg),
        ];
        if self.check_mode {
            args.push(OsString::from("--check"));
        }

        info!(
            "Executing artifact {} v{} against {} (timeout {}s{})",
            artifact.id,
            artifact.version,
            inventory,
            timeout.as_secs(),
            if self.check_mode { ", check mode" } else { "" }
        );

        let start = Instant::now();
        let mut child = match self.command(&args).spawn() {
            Ok(child) => child,
            Err(e) => {
                remove_quietly(&playbook_path).await;
                return Err(self.spawn_error(e));
            }
        };

        let stdout_reader = spawn_capture(child.stdout.take(), true);
        let stderr_reader = spawn_capture(child.stderr.take(), false);

        let outcome = tokio::select! {
            status = child.wait() => match status {
                Ok(status) => Outcome::Exited(status.code()),
                Err(e) => {
                    warn!("Failed to wait on executor process: {}", e);
                    Outcome::Exited(None)
                }
            },
            _ = tokio::time::sleep(timeout) => Outcome::TimedOut,
            _ = cancel.cancelled() => Outcome::Cancelled,
        };

        if !matches!(outcome, Outcome::Exited(_)) {
            terminate(&mut child).await;
        }

        let stdout = join_capture(stdout_reader).await;
        let stderr = join_capture(stderr_reader).await.text;
        let duration_ms = start.elapsed().as_millis() as u64;

        let (exit_code, timed_out) = match outcome {
            Outcome::Cancelled => {
                remove_quietly(&playbook_path).await;
                info!("Execution of artifact {} cancelled", artifact.id);
                return Err(ExecutorError::Cancelled);
            }
            Outcome::TimedOut => (None, true),
            Outcome::Exited(code) => (code, false),
        };

        let mut outcomes = stdout.outcomes;
        if timed_out {
            if !outcomes.has_reports() {
                remove_quietly(&playbook_path).await;
                warn!("Execution timed out after {}s with no host output", timeout.as_secs());
                return Err(ExecutorError::Timeout(timeout.as_secs()));
            }
            let expected = self
                .expected_hosts(&playbook_path, &inventory_arg, artifact)
                .await;
            outcomes.expect_hosts(expected);
        }
        remove_quietly(&playbook_path).await;

        let hosts = outcomes.finish(timed_out);

        if !hosts.is_empty() && hosts.values().all(|s| *s == HostStatus::Unreachable) {
            return Err(ExecutorError::InventoryUnreachable(format!(
                "all {} host(s) unreachable",
                hosts.len()
            )));
        }

        if hosts.is_empty() && exit_code.unwrap_or(-1) != 0 {
            let detail = tail(&stderr, 400);
            return Err(if exit_code == Some(EXIT_HOSTS_UNREACHABLE) {
                ExecutorError::InventoryUnreachable(detail)
            } else {
                ExecutorError::Failed(format!(
                    "{} exited with {:?} and reported no hosts: {}",
                    self.program, exit_code, detail
                ))
            });
        }

        debug!(
            "Execution finished in {}ms: exit={:?}, hosts={}",
            duration_ms,
            exit_code,
            hosts.len()
        );

        Ok(ExecutionResult {
            artifact_id: artifact.id.clone(),
            artifact_version: artifact.version,
            hosts,
            stdout: stdout.text,
            stderr,
            exit_code,
            duration_ms,
            timed_out,
        })
    }

    /// `<program> <file> -i <inventory> --syntax-check`; nothing is executed
    async fn syntax_check(
        &self,
        artifact: &Artifact,
        inventory: &InventoryRef,
    ) -> Result<Option<String>, ExecutorError> {
        let inventory_arg = self.resolve_inventory(inventory).await?;
        let playbook_path = self.write_artifact(artifact, "-syntax").await?;
        let args = [
            playbook_path.as_os_str().to_os_string(),
            OsString::from("-i"),
            OsString::from(&inventory_arg),
            OsString::from("--syntax-check"),
        ];

        let result = self.run_bounded(&args, SYNTAX_CHECK_TIMEOUT).await;
        remove_quietly(&playbook_path).await;
        let done = result?;

        if done.code == Some(0) {
            debug!("Artifact {} v{} passed syntax check", artifact.id, artifact.version);
            return Ok(None);
        }

        let output = if done.stderr.trim().is_empty() {
            &done.stdout
        } else {
            &done.stderr
        };
        Ok(Some(format!(
            "syntax check failed (exit {:?}): {}",
            done.code,
            tail(output, 400)
        )))
    }
}

/// Kill the runner and everything it started
async fn terminate(child: &mut Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{killpg, Signal};
        use nix::unistd::Pid;

        if let Some(pid) = child.id() {
            if let Err(e) = killpg(Pid::from_raw(pid as i32), Signal::SIGKILL) {
                warn!("Failed to kill process group {}: {}", pid, e);
            }
        }
    }

    if let Err(e) = child.start_kill() {
        debug!("start_kill after group kill: {}", e);
    }
    if let Err(e) = child.wait().await {
        warn!("Failed to reap executor process: {}", e);
    }
}

/// One output stream, bounded, plus what its lines said about hosts
#[derive(Debug, Default)]
struct Capture {
    text: String,
    outcomes: HostOutcomes,
}

/// Head and tail of a stream; the middle of very long output is dropped
#[derive(Default)]
struct BoundedText {
    head: Vec<u8>,
    tail: VecDeque<u8>,
    omitted: usize,
}

impl BoundedText {
    fn push(&mut self, bytes: &[u8]) {
        let room = HEAD_BYTES.saturating_sub(self.head.len());
        let (head, rest) = bytes.split_at(bytes.len().min(room));
        self.head.extend_from_slice(head);
        self.tail.extend(rest);
        if self.tail.len() > TAIL_BYTES {
            let excess = self.tail.len() - TAIL_BYTES;
            self.tail.drain(..excess);
            self.omitted += excess;
        }
    }

    fn into_string(self) -> String {
        let mut text = String::from_utf8_lossy(&self.head).into_owned();
        if self.omitted > 0 {
            text.push_str(&format!("\n... [{} bytes omitted] ...\n", self.omitted));
        }
        let tail: Vec<u8> = self.tail.into_iter().collect();
        text.push_str(&String::from_utf8_lossy(&tail));
        text
    }
}

/// Splits a byte stream into lines, truncating any line past `MAX_LINE_BYTES`
#[derive(Default)]
struct LineSplitter {
    line: Vec<u8>,
}

impl LineSplitter {
    fn feed(&mut self, bytes: &[u8], mut on_line: impl FnMut(&str)) {
        for segment in bytes.split_inclusive(|b| *b == b'\n') {
            let (content, complete) = match segment.strip_suffix(b"\n") {
                Some(content) => (content, true),
                None => (segment, false),
            };
            let room = MAX_LINE_BYTES.saturating_sub(self.line.len());
            self.line
                .extend_from_slice(&content[..content.len().min(room)]);
            if complete {
                on_line(&String::from_utf8_lossy(&self.line));
                self.line.clear();
            }
        }
    }

    fn finish(self, mut on_line: impl FnMut(&str)) {
        if !self.line.is_empty() {
            on_line(&String::from_utf8_lossy(&self.line));
        }
    }
}

/// Drain `stream` to EOF, keeping a bounded copy and, when `parse_hosts`
/// is set, feeding every line to the host parser as it arrives
fn spawn_capture<R>(stream: Option<R>, parse_hosts: bool) -> Option<JoinHandle<Capture>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    stream.map(|mut stream| {
        tokio::spawn(async move {
            let mut text = BoundedText::default();
            let mut lines = LineSplitter::default();
            let mut outcomes = HostOutcomes::new();
            let mut buf = [0u8; 8192];

            loop {
                match stream.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        text.push(&buf[..n]);
                        if parse_hosts {
                            lines.feed(&buf[..n], |line| outcomes.observe_line(line));
                        }
                    }
                }
            }
            if parse_hosts {
                lines.finish(|line| outcomes.observe_line(line));
            }

            Capture {
                text: text.into_string(),
                outcomes,
            }
        })
    })
}

async fn join_capture(handle: Option<JoinHandle<Capture>>) -> Capture {
    let Some(handle) = handle else {
        return Capture::default();
    };
    match tokio::time::timeout(READER_GRACE, handle).await {
        Ok(Ok(captured)) => captured,
        Ok(Err(e)) => {
            warn!("Output reader failed: {}", e);
            Capture::default()
        }
        Err(_) => {
            warn!("Output reader did not finish within grace period");
            Capture::default()
        }
    }
}

async fn remove_quietly(path: &Path) {
    if let Err(e) = tokio::fs::remove_file(path).await {
        debug!("Could not remove {}: {}", path.display(), e);
    }
}

/// Last `max` bytes of `text`, on a char boundary
fn tail(text: &str, max: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= max {
        return trimmed.to_string();
    }
    let mut start = trimmed.len() - max;
    while !trimmed.is_char_boundary(start) {
        start += 1;
    }
    trimmed[start..].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_tail_respects_char_boundaries() {
        assert_eq!(tail("  short  ", 100), "short");
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("ééé", 3), "é");
    }

    #[test]
    fn test_bounded_text_keeps_head_and_tail() {
        let mut text = BoundedText::default();
        text.push(b"PLAY [web]\n");
        text.push(&vec![b'x'; HEAD_BYTES + TAIL_BYTES]);
        text.push(b"\nPLAY RECAP\n");

        let rendered = text.into_string();
        assert!(rendered.starts_with("PLAY [web]"));
        assert!(rendered.ends_with("PLAY RECAP\n"));
        assert!(rendered.contains("bytes omitted"));
        assert!(rendered.len() < HEAD_BYTES + TAIL_BYTES + 100);
    }

    #[test]
    fn test_line_splitter_across_chunks() {
        let mut splitter = LineSplitter::default();
        let mut seen = Vec::new();
        splitter.feed(b"ok: [we", |l| seen.push(l.to_string()));
        splitter.feed(b"b1]\nchanged: [web2]\npartial", |l| seen.push(l.to_string()));
        splitter.finish(|l| seen.push(l.to_string()));

        assert_eq!(seen, vec!["ok: [web1]", "changed: [web2]", "partial"]);
    }

    #[test]
    fn test_line_splitter_truncates_huge_lines() {
        let mut splitter = LineSplitter::default();
        let mut lengths = Vec::new();
        let mut huge = vec![b'y'; MAX_LINE_BYTES * 3];
        huge.push(b'\n');
        splitter.feed(&huge, |l| lengths.push(l.len()));
        assert_eq!(lengths, vec![MAX_LINE_BYTES]);
    }

    #[tokio::test]
    async fn test_default_local_inventory_is_written_once() {
        let dir = TempDir::new().unwrap();
        let executor = PlaybookExecutor::new("ansible-playbook", dir.path());

        let path = executor
            .resolve_inventory(&InventoryRef::DefaultLocal)
            .await
            .unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("localhost ansible_connection=local"));

        let again = executor
            .resolve_inventory(&InventoryRef::DefaultLocal)
            .await
            .unwrap();
        assert_eq!(path, again);
    }

    #[tokio::test]
    async fn test_missing_inventory_is_unreachable() {
        let dir = TempDir::new().unwrap();
        let executor = PlaybookExecutor::new("ansible-playbook", dir.path());

        let result = executor
            .resolve_inventory(&InventoryRef::Path("/nonexistent/hosts.ini".into()))
            .await;
        assert!(matches!(result, Err(ExecutorError::InventoryUnreachable(_))));

        let inline = executor
            .resolve_inventory(&InventoryRef::Path("web1,web2,".into()))
            .await
            .unwrap();
        assert_eq!(inline, "web1,web2,");
    }

    #[tokio::test]
    async fn test_missing_program_is_reported() {
        let dir = TempDir::new().unwrap();
        let executor = PlaybookExecutor::new("definitely-not-a-real-runner", dir.path());
        let artifact = Artifact::new("- hosts: localhost\n", "localhost");

        let result = executor
            .execute(
                &artifact,
                &InventoryRef::DefaultLocal,
                Duration::from_secs(5),
                &CancellationToken::new(),
            )
            .await;

        match result {
            Err(ExecutorError::Failed(msg)) => assert!(msg.contains("not found")),
            other => panic!("expected Failed, got {:?}", other),
        }
        assert!(!dir
            .path()
            .join("runs")
            .join(format!("{}-v1.yml", artifact.id))
            .exists());
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let dir = TempDir::new().unwrap();
        let executor = PlaybookExecutor::new("ansible-playbook", dir.path());
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = executor
            .execute(
                &Artifact::new("- hosts: localhost\n", "localhost"),
                &InventoryRef::DefaultLocal,
                Duration::from_secs(5),
                &cancel,
            )
            .await;
        assert!(matches!(result, Err(ExecutorError::Cancelled)));
    }
}
