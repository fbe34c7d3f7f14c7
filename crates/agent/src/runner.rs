//! Task runner: executes a job's task list on this host.
//!
//! [`AnsibleRunner`] renders the tasks and vars into a single-play
//! playbook targeting `localhost` over the local connection, writes it
//! to a temporary file, and runs `ansible-playbook` on it. A timeout is
//! applied; if the run does not finish within that window the child is
//! killed and the run is reported as an error.

use std::io::Write;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};
use tokio::process::Command;

/// Default upper bound on a single playbook run.
const DEFAULT_RUN_TIMEOUT: Duration = Duration::from_secs(3600);

/// Bytes of stdout or stderr forwarded to the log per run (1 MiB).
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;

/// Executes a declarative task list with a variable mapping.
#[async_trait]
pub trait TaskRunner: Send + Sync {
    /// Run `tasks` with `vars`. Returns whether every task succeeded.
    async fn run(
        &self,
        tasks: Option<&[Value]>,
        vars: Option<&Map<String, Value>>,
    ) -> Result<bool, RunnerError>;
}

/// Errors raised while running a task list.
#[derive(Debug, thiserror::Error)]
pub enum RunnerError {
    #[error("Failed to write playbook: {0}")]
    Playbook(#[from] serde_json::Error),

    #[error("Failed to run {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("Run timed out after {0:?}")]
    Timeout(Duration),
}

/// Build the playbook document for one run.
pub fn build_playbook(tasks: Option<&[Value]>, vars: Option<&Map<String, Value>>) -> Value {
    json!([{
        "name": "autonom job",
        "hosts": "localhost",
        "connection": "local",
        "gather_facts": false,
        "vars": vars.cloned().unwrap_or_default(),
        "tasks": tasks.map(<[Value]>::to_vec).unwrap_or_default(),
    }])
}

/// [`TaskRunner`] that shells out to `ansible-playbook`.
#[derive(Debug, Clone)]
pub struct AnsibleRunner {
    program: PathBuf,
    timeout: Duration,
}

impl Default for AnsibleRunner {
    fn default() -> Self {
        Self::new("ansible-playbook")
    }
}

impl AnsibleRunner {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            timeout: DEFAULT_RUN_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl TaskRunner for AnsibleRunner {
    async fn run(
        &self,
        tasks: Option<&[Value]>,
        vars: Option<&Map<String, Value>>,
    ) -> Result<bool, RunnerError> {
        let start = Instant::now();
        let playbook = build_playbook(tasks, vars);
        tracing::debug!(playbook = %playbook, "Rendered playbook");

        let mut file = tempfile::Builder::new()
            .prefix("autonom-play-")
            .suffix(".json")
            .tempfile()?;
        serde_json::to_writer(file.as_file_mut(), &playbook)?;
        file.flush()?;

        let program = self.program.display().to_string();
        let task_count = tasks.map_or(0, |tasks| tasks.len());
        tracing::info!(program = %program, tasks = task_count, "Running playbook");

        // `kill_on_drop` kills the child when it goes out of scope early,
        // including on timeout.
        let mut child = Command::new(&self.program)
            .arg("-i")
            .arg("localhost,")
            .arg(file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RunnerError::Spawn {
                program: program.clone(),
                source,
            })?;

        let stdout_task = tokio::spawn(forward_lines(
            child.stdout.take(),
            OutputStream::Stdout,
            MAX_OUTPUT_BYTES,
        ));
        let stderr_task = tokio::spawn(forward_lines(
            child.stderr.take(),
            OutputStream::Stderr,
            MAX_OUTPUT_BYTES,
        ));

        let status = match tokio::time::timeout(self.timeout, child.wait()).await {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => return Err(RunnerError::Io(e)),
            Err(_) => {
                tracing::error!(
                    program = %program,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "Playbook timed out",
                );
                return Err(RunnerError::Timeout(self.timeout));
            }
        };

        for task in [stdout_task, stderr_task] {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Output forwarder aborted");
            }
        }

        let elapsed_ms = start.elapsed().as_millis() as u64;
        let success = status.success();
        if success {
            tracing::info!(elapsed_ms, "Playbook succeeded");
        } else {
            tracing::error!(
                exit_code = status.code().unwrap_or(-1),
                elapsed_ms,
                "Playbook failed",
            );
        }
        Ok(success)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputStream {
    Stdout,
    Stderr,
}

/// What [`forward_lines`] saw on one stream.
#[derive(Debug, Default, PartialEq, Eq)]
struct OutputSummary {
    lines: usize,
    skipped_bytes: u64,
}

/// Log each line of a child stream as it arrives, stdout at info and
/// stderr at warn. At most `cap` bytes are logged; the remainder is
/// drained and discarded so the child never blocks on a full pipe.
async fn forward_lines<R>(stream: Option<R>, kind: OutputStream, cap: usize) -> OutputSummary
where
    R: AsyncRead + Unpin,
{
    let mut summary = OutputSummary::default();
    let Some(stream) = stream else {
        return summary;
    };

    let mut lines = BufReader::new(stream.take(cap as u64)).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        summary.lines += 1;
        match kind {
            OutputStream::Stdout => tracing::info!(target: "autonom_agent::ansible", "{line}"),
            OutputStream::Stderr => tracing::warn!(target: "autonom_agent::ansible", "{line}"),
        }
    }

    let mut rest = lines.into_inner().into_inner().into_inner();
    summary.skipped_bytes = tokio::io::copy(&mut rest, &mut tokio::io::sink())
        .await
        .unwrap_or(0);
    if summary.skipped_bytes > 0 {
        tracing::warn!(
            stream = ?kind,
            skipped_bytes = summary.skipped_bytes,
            "Playbook output exceeded the log cap",
        );
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn playbook_with_tasks_and_vars() {
        let tasks = vec![json!({"name": "say hi", "debug": {"msg": "{{ who }}"}})];
        let mut vars = Map::new();
        vars.insert("who".into(), json!("world"));

        let playbook = build_playbook(Some(tasks.as_slice()), Some(&vars));
        let play = &playbook[0];
        assert_eq!(play["hosts"], "localhost");
        assert_eq!(play["connection"], "local");
        assert_eq!(play["gather_facts"], false);
        assert_eq!(play["vars"]["who"], "world");
        assert_eq!(play["tasks"][0]["name"], "say hi");
    }

    #[test]
    fn playbook_without_tasks_or_vars() {
        let playbook = build_playbook(None, None);
        assert_eq!(playbook[0]["tasks"], json!([]));
        assert_eq!(playbook[0]["vars"], json!({}));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn exit_status_decides_outcome() {
        assert!(AnsibleRunner::new("true").run(None, None).await.unwrap());
        assert!(!AnsibleRunner::new("false").run(None, None).await.unwrap());
    }

    /// Write an executable shell script standing in for `ansible-playbook`.
    #[cfg(unix)]
    fn fake_ansible(dir: &std::path::Path, body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = dir.join("fake-ansible-playbook");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// Run, retrying while another test's fork still holds the script open
    /// for writing (ETXTBSY).
    #[cfg(unix)]
    async fn run_script(runner: &AnsibleRunner) -> Result<bool, RunnerError> {
        for _ in 0..20 {
            match runner.run(None, None).await {
                Err(RunnerError::Spawn { source, .. }) if source.raw_os_error() == Some(26) => {
                    tokio::time::sleep(Duration::from_millis(25)).await;
                }
                other => return other,
            }
        }
        runner.run(None, None).await
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn slow_run_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let runner = AnsibleRunner::new(fake_ansible(dir.path(), "sleep 30"))
            .with_timeout(Duration::from_millis(300));

        let started = Instant::now();
        assert_matches!(run_script(&runner).await, Err(RunnerError::Timeout(_)));
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn noisy_run_completes() {
        let dir = tempfile::tempdir().unwrap();
        let script = "i=0; while [ $i -lt 2000 ]; do echo \"ok: [localhost] line $i\"; echo warn $i >&2; i=$((i+1)); done; exit 0";
        let runner = AnsibleRunner::new(fake_ansible(dir.path(), script));

        assert!(run_script(&runner).await.unwrap());
    }

    #[tokio::test]
    async fn forwards_lines_up_to_cap_and_drains_the_rest() {
        let input: &[u8] = b"one\ntwo\nthree\nfour\n";

        let summary = forward_lines(Some(input), OutputStream::Stdout, 8).await;

        assert_eq!(
            summary,
            OutputSummary {
                lines: 2,
                skipped_bytes: 11,
            }
        );
    }

    #[tokio::test]
    async fn forwards_every_line_under_cap() {
        let input: &[u8] = b"PLAY [autonom job]\nTASK [ping]\nok: [localhost]";

        let summary = forward_lines(Some(input), OutputStream::Stderr, MAX_OUTPUT_BYTES).await;

        assert_eq!(summary.lines, 3);
        assert_eq!(summary.skipped_bytes, 0);
        assert_eq!(
            forward_lines(None::<&[u8]>, OutputStream::Stdout, 1).await,
            OutputSummary::default()
        );
    }

    #[tokio::test]
    async fn missing_program_is_spawn_error() {
        let runner = AnsibleRunner::new("/nonexistent/ansible-playbook");
        assert_matches!(runner.run(None, None).await, Err(RunnerError::Spawn { .. }));
    }
}
