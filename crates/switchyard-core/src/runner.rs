// ABOUTME: Streaming subprocess runner for backend commands
// ABOUTME: Yields stdout/stderr lines live under a deadline, an output cap, and cancellation

use crate::error::RunError;
use crate::types::{StreamSource, StreamedLine};
use futures::stream::BoxStream;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command as ProcessCommand};
use tokio::sync::mpsc;
use tokio::time::{sleep_until, Instant};
use tokio_util::sync::CancellationToken;

/// Lines buffered between the reader task and the consumer.
const LINE_BUFFER: usize = 100;
const READ_CHUNK: usize = 8 * 1024;
const STDERR_TAIL_LINES: usize = 20;
const STDERR_LINE_CHARS: usize = 200;
/// Stand-in deadline for timeouts too large to add to the current instant.
const FAR_FUTURE: Duration = Duration::from_secs(86_400 * 365 * 30);

/// A fully resolved command for one backend attempt.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    /// Added on top of the inherited environment
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
    pub max_output_bytes: usize,
    pub cancellation: CancellationToken,
}

/// One item of a run's output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunEvent {
    Line(StreamedLine),
    /// The process exited with status zero. Always the last item.
    Exited,
}

pub type LineStream = BoxStream<'static, Result<RunEvent, RunError>>;

/// Runs one command per call and streams its output.
///
/// A zero exit ends the stream with `RunEvent::Exited`. Spawn failure,
/// timeout, output overflow and a non-zero exit end it with exactly one
/// `Err`. Cancellation ends it with neither, so a stream that stops without
/// a terminal item was never a success. Dropping the stream kills the process.
pub struct ProcessStreamRunner;

impl ProcessStreamRunner {
    pub fn run(spec: RunSpec) -> LineStream {
        let (tx, rx) = mpsc::channel(LINE_BUFFER);

        tokio::spawn(async move {
            match drive(&spec, &tx).await {
                Ok(Ended::Exited) => {
                    let _ = tx.send(Ok(RunEvent::Exited)).await;
                }
                Ok(Ended::Stopped) => {}
                Err(e) => {
                    if e.code().is_transient() {
                        tracing::warn!(program = %spec.program, error = %e, "Backend process failed");
                    } else {
                        tracing::error!(program = %spec.program, error = %e, "Backend process aborted");
                    }
                    let _ = tx.send(Err(e)).await;
                }
            }
        });

        Box::pin(tokio_stream::wrappers::ReceiverStream::new(rx))
    }
}

type LineSender = mpsc::Sender<Result<RunEvent, RunError>>;

/// Whether the pump should keep going after handing a line over.
enum Flow {
    Continue,
    Stop,
}

/// How a run finished when it did not fail.
#[derive(Debug, PartialEq, Eq)]
enum Ended {
    /// Zero exit status
    Exited,
    /// Cancelled, or nobody is listening any more
    Stopped,
}

fn deadline_after(timeout: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(timeout).unwrap_or(now + FAR_FUTURE)
}

async fn drive(spec: &RunSpec, tx: &LineSender) -> Result<Ended, RunError> {
    if spec.cancellation.is_cancelled() {
        tracing::debug!(program = %spec.program, "Request already cancelled, not spawning");
        return Ok(Ended::Stopped);
    }

    let mut child = ChildGuard::spawn(spec)?;
    let deadline = deadline_after(spec.timeout);

    let result = Pump {
        spec,
        tx,
        deadline,
    }
    .run(&mut child)
    .await;

    // Normal exit already reaped the child; everything else still needs killing
    child.terminate().await;
    result
}

struct Pump<'a> {
    spec: &'a RunSpec,
    tx: &'a LineSender,
    deadline: Instant,
}

impl Pump<'_> {
    fn timeout(&self) -> RunError {
        RunError::Timeout {
            after: self.spec.timeout,
        }
    }

    async fn run(&self, child: &mut ChildGuard) -> Result<Ended, RunError> {
        let mut stdout = child
            .child
            .stdout
            .take()
            .ok_or_else(|| missing_pipe("stdout"))?;
        let mut stderr = child
            .child
            .stderr
            .take()
            .ok_or_else(|| missing_pipe("stderr"))?;

        let mut out_lines = LineSplitter::new(StreamSource::Stdout);
        let mut err_lines = LineSplitter::new(StreamSource::Stderr);
        let mut stderr_tail = StderrTail::default();
        let mut out_buf = vec![0u8; READ_CHUNK];
        let mut err_buf = vec![0u8; READ_CHUNK];
        let mut stdout_open = true;
        let mut stderr_open = true;
        let mut total_bytes = 0usize;

        while stdout_open || stderr_open {
            let (source, read) = tokio::select! {
                biased;
                _ = self.spec.cancellation.cancelled() => {
                    tracing::debug!(program = %self.spec.program, "Backend run cancelled");
                    return Ok(Ended::Stopped);
                }
                _ = self.tx.closed() => {
                    tracing::debug!(program = %self.spec.program, "Line consumer gone, stopping process");
                    return Ok(Ended::Stopped);
                }
                _ = sleep_until(self.deadline) => return Err(self.timeout()),
                read = stdout.read(&mut out_buf), if stdout_open => (StreamSource::Stdout, read),
                read = stderr.read(&mut err_buf), if stderr_open => (StreamSource::Stderr, read),
            };

            let n = read?;
            let (splitter, buf) = match source {
                StreamSource::Stdout => (&mut out_lines, &out_buf),
                StreamSource::Stderr => (&mut err_lines, &err_buf),
            };

            let lines = if n == 0 {
                match source {
                    StreamSource::Stdout => stdout_open = false,
                    StreamSource::Stderr => stderr_open = false,
                }
                splitter.finish().into_iter().collect()
            } else {
                total_bytes = total_bytes.saturating_add(n);
                if total_bytes > self.spec.max_output_bytes {
                    return Err(RunError::OutputTooLarge {
                        limit: self.spec.max_output_bytes,
                    });
                }
                splitter.push(&buf[..n])
            };

            for line in lines {
                if line.source == StreamSource::Stderr {
                    tracing::debug!(stderr = %truncate_for_log(&line.line), "Backend stderr");
                    stderr_tail.push(&line.line);
                }
                if let Flow::Stop = self.emit(line).await? {
                    return Ok(Ended::Stopped);
                }
            }
        }

        let status = tokio::select! {
            biased;
            _ = self.spec.cancellation.cancelled() => return Ok(Ended::Stopped),
            _ = self.tx.closed() => return Ok(Ended::Stopped),
            _ = sleep_until(self.deadline) => return Err(self.timeout()),
            status = child.wait() => status?,
        };

        if status.success() {
            tracing::debug!(program = %self.spec.program, total_bytes, "Backend process exited cleanly");
            Ok(Ended::Exited)
        } else {
            Err(RunError::ExitNonzero {
                code: status.code(),
                stderr: stderr_tail.render(),
            })
        }
    }

    /// Hand one line to the consumer without letting a slow reader push us
    /// past the deadline or ignore cancellation.
    async fn emit(&self, line: StreamedLine) -> Result<Flow, RunError> {
        tokio::select! {
            biased;
            _ = self.spec.cancellation.cancelled() => Ok(Flow::Stop),
            _ = sleep_until(self.deadline) => Err(self.timeout()),
            sent = self.tx.send(Ok(RunEvent::Line(line))) => match sent {
                Ok(()) => Ok(Flow::Continue),
                Err(_) => Ok(Flow::Stop),
            },
        }
    }
}

fn missing_pipe(name: &str) -> RunError {
    RunError::Io(std::io::Error::other(format!("failed to capture {name}")))
}

/// Owns the child process for the length of a run. The child leads its own
/// process group, so terminating it takes any descendants down too. Dropping
/// the guard without `terminate` still kills the group.
struct ChildGuard {
    child: Child,
    pid: Option<u32>,
    reaped: bool,
}

impl ChildGuard {
    fn spawn(spec: &RunSpec) -> Result<Self, RunError> {
        let mut command = ProcessCommand::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.working_dir)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        tracing::debug!(
            program = %spec.program,
            args = ?spec.args,
            cwd = %spec.working_dir.display(),
            "Spawning backend process"
        );

        let child = command.spawn().map_err(|source| RunError::Spawn {
            program: spec.program.clone(),
            source,
        })?;
        let pid = child.id();

        Ok(Self {
            child,
            pid,
            reaped: false,
        })
    }

    async fn wait(&mut self) -> std::io::Result<ExitStatus> {
        let status = self.child.wait().await?;
        self.reaped = true;
        Ok(status)
    }

    /// Kill the process group and reap the child. Safe to call more than once.
    async fn terminate(&mut self) {
        self.kill_group();
        if self.reaped {
            return;
        }
        if let Err(e) = self.child.kill().await {
            tracing::warn!(pid = ?self.pid, error = %e, "Failed to kill backend process");
        }
        self.reaped = true;
    }

    #[cfg(unix)]
    fn kill_group(&self) {
        let Some(pid) = self.pid else {
            return;
        };
        // SAFETY: killpg only sends a signal. The group id is the pid of the
        // child we spawned with process_group(0).
        let rc = unsafe { libc::killpg(pid as libc::pid_t, libc::SIGKILL) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::ESRCH) {
                tracing::debug!(pid, error = %err, "Failed to signal backend process group");
            }
        }
    }

    #[cfg(not(unix))]
    fn kill_group(&self) {}
}

impl Drop for ChildGuard {
    fn drop(&mut self) {
        if !self.reaped {
            self.kill_group();
            let _ = self.child.start_kill();
        }
    }
}

/// Splits a byte stream into lines. A trailing partial line is released by
/// `finish`.
struct LineSplitter {
    source: StreamSource,
    pending: Vec<u8>,
}

impl LineSplitter {
    fn new(source: StreamSource) -> Self {
        Self {
            source,
            pending: Vec::new(),
        }
    }

    fn push(&mut self, chunk: &[u8]) -> Vec<StreamedLine> {
        let scan_from = self.pending.len();
        self.pending.extend_from_slice(chunk);

        let mut lines = Vec::new();
        let mut start = 0;
        for (i, byte) in self.pending.iter().enumerate().skip(scan_from) {
            if *byte == b'\n' {
                lines.push(self.decode(&self.pending[start..i]));
                start = i + 1;
            }
        }
        self.pending.drain(..start);
        lines
    }

    fn finish(&mut self) -> Option<StreamedLine> {
        if self.pending.is_empty() {
            return None;
        }
        let rest = std::mem::take(&mut self.pending);
        Some(self.decode(&rest))
    }

    fn decode(&self, bytes: &[u8]) -> StreamedLine {
        let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
        StreamedLine {
            source: self.source,
            line: String::from_utf8_lossy(bytes).into_owned(),
        }
    }
}

/// Most recent stderr lines, kept for the exit-nonzero details.
#[derive(Default)]
struct StderrTail {
    lines: VecDeque<String>,
}

impl StderrTail {
    fn push(&mut self, line: &str) {
        if line.trim().is_empty() {
            return;
        }
        if self.lines.len() == STDERR_TAIL_LINES {
            self.lines.pop_front();
        }
        self.lines.push_back(truncate_for_log(line));
    }

    fn render(&self) -> String {
        self.lines.iter().map(String::as_str).collect::<Vec<_>>().join("\n")
    }
}

fn truncate_for_log(line: &str) -> String {
    if line.chars().count() > STDERR_LINE_CHARS {
        let truncated: String = line.chars().take(STDERR_LINE_CHARS).collect();
        format!("{}...[truncated]", truncated)
    } else {
        line.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;
    use futures::StreamExt;

    // ── 1. Line splitting ────────────────────────────────────────────────

    #[test]
    fn splitter_handles_chunk_boundaries() {
        let mut splitter = LineSplitter::new(StreamSource::Stdout);
        assert!(splitter.push(b"hel").is_empty());
        let lines = splitter.push(b"lo\nwor");
        assert_eq!(lines, vec![StreamedLine::stdout("hello")]);
        let lines = splitter.push(b"ld\r\n\nx");
        assert_eq!(
            lines,
            vec![StreamedLine::stdout("world"), StreamedLine::stdout("")]
        );
        assert_eq!(splitter.finish(), Some(StreamedLine::stdout("x")));
        assert_eq!(splitter.finish(), None);
    }

    #[test]
    fn splitter_decodes_invalid_utf8_lossily() {
        let mut splitter = LineSplitter::new(StreamSource::Stderr);
        let lines = splitter.push(b"a\xffb\n");
        assert_eq!(lines, vec![StreamedLine::stderr("a\u{fffd}b")]);
    }

    #[test]
    fn stderr_tail_keeps_most_recent_lines() {
        let mut tail = StderrTail::default();
        for i in 0..(STDERR_TAIL_LINES + 5) {
            tail.push(&format!("line {i}"));
        }
        tail.push("   ");
        let rendered = tail.render();
        assert!(!rendered.contains("line 4\n"));
        assert!(rendered.starts_with("line 5"));
        assert!(rendered.ends_with(&format!("line {}", STDERR_TAIL_LINES + 4)));
    }

    #[test]
    fn long_stderr_lines_are_truncated() {
        let long = "x".repeat(STDERR_LINE_CHARS + 50);
        let truncated = truncate_for_log(&long);
        assert!(truncated.ends_with("...[truncated]"));
        assert_eq!(truncated.chars().count(), STDERR_LINE_CHARS + "...[truncated]".len());
    }

    // ── 2. Process runs ──────────────────────────────────────────────────

    #[cfg(unix)]
    fn sh(script: &str) -> RunSpec {
        RunSpec {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            working_dir: std::env::temp_dir(),
            env: Vec::new(),
            timeout: Duration::from_secs(10),
            max_output_bytes: 1024 * 1024,
            cancellation: CancellationToken::new(),
        }
    }

    /// Lines, whether the run reported a clean exit, and its terminal error.
    #[cfg(unix)]
    async fn collect(spec: RunSpec) -> (Vec<StreamedLine>, bool, Option<RunError>) {
        let mut stream = ProcessStreamRunner::run(spec);
        let mut lines = Vec::new();
        let mut exited = false;
        let mut error = None;
        while let Some(item) = stream.next().await {
            assert!(!exited && error.is_none(), "nothing may follow the terminal item");
            match item {
                Ok(RunEvent::Line(line)) => lines.push(line),
                Ok(RunEvent::Exited) => exited = true,
                Err(e) => error = Some(e),
            }
        }
        (lines, exited, error)
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn streams_both_channels_and_final_partial_line() {
        let (lines, exited, error) =
            collect(sh("printf 'one\\ntwo\\n'; printf 'warn\\n' >&2; printf 'tail'")).await;
        assert!(error.is_none(), "unexpected error: {error:?}");
        assert!(exited);

        let stdout: Vec<&str> = lines
            .iter()
            .filter(|l| l.source == StreamSource::Stdout)
            .map(|l| l.line.as_str())
            .collect();
        assert_eq!(stdout, vec!["one", "two", "tail"]);
        assert!(lines.contains(&StreamedLine::stderr("warn")));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn passes_env_and_working_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut spec = sh("echo \"$SWITCHYARD_TEST_VAR\"; pwd");
        spec.env = vec![("SWITCHYARD_TEST_VAR".to_string(), "marker".to_string())];
        spec.working_dir = dir.path().to_path_buf();

        let (lines, _, error) = collect(spec).await;
        assert!(error.is_none());
        assert_eq!(lines[0].line, "marker");
        let expected = dir.path().canonicalize().unwrap();
        let actual = std::path::Path::new(&lines[1].line).canonicalize().unwrap();
        assert_eq!(actual, expected);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn nonzero_exit_carries_stderr_excerpt() {
        let (lines, exited, error) =
            collect(sh("echo partial; echo 'rate limited' >&2; exit 3")).await;
        assert!(!exited);
        assert_eq!(lines[0], StreamedLine::stdout("partial"));
        match error {
            Some(RunError::ExitNonzero { code, stderr }) => {
                assert_eq!(code, Some(3));
                assert!(stderr.contains("rate limited"));
            }
            other => panic!("expected ExitNonzero, got {:?}", other),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_kills_the_process() {
        let mut spec = sh("echo started; sleep 30; echo never");
        spec.timeout = Duration::from_millis(300);

        let started = std::time::Instant::now();
        let (lines, _, error) = collect(spec).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(lines, vec![StreamedLine::stdout("started")]);
        let error = error.expect("timeout error");
        assert_eq!(error.code(), ErrorCode::Timeout);
        assert!(error.code().is_transient());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn timeout_takes_down_descendants_holding_the_pipes() {
        // The background sleep inherits stdout, so EOF never arrives on its own
        let mut spec = sh("sleep 30 & echo spawned; wait");
        spec.timeout = Duration::from_millis(300);

        let started = std::time::Instant::now();
        let (_, _, error) = collect(spec).await;
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(error.map(|e| e.code()), Some(ErrorCode::Timeout));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn output_cap_is_enforced_across_channels() {
        let mut spec = sh("while true; do echo out; echo err >&2; done");
        spec.max_output_bytes = 4096;

        let (lines, _, error) = collect(spec).await;
        let error = error.expect("output-too-large error");
        assert_eq!(error.code(), ErrorCode::OutputTooLarge);
        assert!(!error.code().is_transient());
        let emitted: usize = lines.iter().map(|l| l.line.len() + 1).sum();
        assert!(emitted <= 4096, "emitted {emitted} bytes past the cap");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_ends_without_error() {
        let spec = sh("echo first; sleep 30; echo never");
        let token = spec.cancellation.clone();
        let mut stream = ProcessStreamRunner::run(spec);

        let first = stream.next().await.expect("first line").expect("not an error");
        assert_eq!(first, RunEvent::Line(StreamedLine::stdout("first")));

        token.cancel();
        let rest = tokio::time::timeout(Duration::from_secs(5), async {
            let mut rest = Vec::new();
            while let Some(item) = stream.next().await {
                rest.push(item);
            }
            rest
        })
        .await
        .expect("stream should end promptly after cancel");
        assert!(rest.is_empty(), "unexpected items after cancel: {rest:?}");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn already_cancelled_request_never_spawns() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("spawned");
        let spec = sh(&format!("touch {}", marker.display()));
        spec.cancellation.cancel();

        let (lines, exited, error) = collect(spec).await;
        assert!(lines.is_empty());
        assert!(!exited, "a run that never started must not report an exit");
        assert!(error.is_none());
        assert!(!marker.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unbounded_timeout_still_runs_to_exit() {
        let mut spec = sh("echo done");
        spec.timeout = Duration::MAX;

        let (lines, exited, error) = collect(spec).await;
        assert!(error.is_none(), "unexpected error: {error:?}");
        assert!(exited);
        assert_eq!(lines, vec![StreamedLine::stdout("done")]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unbounded_timeout_reports_nonzero_exit() {
        let mut spec = sh("exit 7");
        spec.timeout = Duration::MAX;

        let (_, exited, error) = collect(spec).await;
        assert!(!exited);
        assert_eq!(error.map(|e| e.code()), Some(ErrorCode::ExitNonzero));
    }

    #[test]
    fn oversized_timeout_falls_back_to_far_future_deadline() {
        let before = Instant::now();
        let deadline = deadline_after(Duration::MAX);
        assert!(deadline >= before + FAR_FUTURE);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported() {
        let spec = RunSpec {
            program: "switchyard-definitely-not-a-binary".to_string(),
            args: Vec::new(),
            working_dir: std::env::temp_dir(),
            env: Vec::new(),
            timeout: Duration::from_secs(1),
            max_output_bytes: 1024,
            cancellation: CancellationToken::new(),
        };
        let items: Vec<_> = ProcessStreamRunner::run(spec).collect().await;
        assert_eq!(items.len(), 1);
        match &items[0] {
            Err(e) => {
                assert_eq!(e.code(), ErrorCode::SpawnFailure);
                assert!(e.to_string().contains("switchyard-definitely-not-a-binary"));
            }
            Ok(line) => panic!("expected spawn error, got line {:?}", line),
        }
    }
}
