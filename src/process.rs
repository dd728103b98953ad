//! Child-process execution with concurrent capture of stdout and stderr.
//!
//! Each pipe is drained by its own reader thread while the calling thread
//! waits for the child to exit. Neither pipe can fill up and stall the child,
//! and both readers keep going to EOF after the exit is observed, so output
//! still buffered in the pipes at termination is never lost.

use crate::error::{HarnessError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::PathBuf;
use std::process::{Child, Command as ChildCommand, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Interval between exit polls when a timeout is configured.
const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One of the two captured output streams of a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl fmt::Display for StreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamKind::Stdout => f.write_str("stdout"),
            StreamKind::Stderr => f.write_str("stderr"),
        }
    }
}

/// A fully resolved command: program, arguments, working directory and an
/// environment overlay merged over the inherited environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

impl Command {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
        }
    }

    /// Build a command from an argv-style token list. The first token is the program.
    pub fn from_argv(argv: &[String], cwd: impl Into<PathBuf>) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| HarnessError::Config("command has no program".to_string()))?;
        Ok(Self::new(program.clone(), cwd).args(args.iter().cloned()))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Merge an overlay into this command's environment. Later keys win.
    pub fn envs(mut self, overlay: &BTreeMap<String, String>) -> Self {
        for (k, v) in overlay {
            self.env.insert(k.clone(), v.clone());
        }
        self
    }

    /// Human-readable command line, used for logs and error messages.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Exit status and the complete captured text of both streams.
#[derive(Debug, Clone, PartialEq)]
pub struct CaptureResult {
    /// `None` when the child was terminated by a signal.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub elapsed: Duration,
}

impl CaptureResult {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }

    pub fn stream(&self, kind: StreamKind) -> &str {
        match kind {
            StreamKind::Stdout => &self.stdout,
            StreamKind::Stderr => &self.stderr,
        }
    }

    /// The last `lines` non-empty lines of stderr, for error context.
    pub fn stderr_tail(&self, lines: usize) -> String {
        let mut tail: Vec<&str> = self
            .stderr
            .lines()
            .rev()
            .filter(|l| !l.trim().is_empty())
            .take(lines)
            .collect();
        tail.reverse();
        tail.join("\n")
    }
}

/// Runs a command to completion and captures its output.
///
/// The measurer and matrix runner only talk to processes through this trait.
pub trait Launcher {
    fn launch(&self, command: &Command, echo: bool) -> Result<CaptureResult>;
}

/// Spawns real child processes.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    timeout: Option<Duration>,
}

impl ProcessRunner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Kill children that run longer than `timeout`. `None` waits forever.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    /// Run `command`, draining both pipes concurrently.
    ///
    /// With `echo` set, every captured line is also written to this process's
    /// matching stream as soon as it is read.
    pub fn run(&self, command: &Command, echo: bool) -> Result<CaptureResult> {
        debug!(
            cwd = %command.cwd.display(),
            env = ?command.env,
            "Executing: {}",
            command.display()
        );

        let start = Instant::now();
        let mut builder = ChildCommand::new(&command.program);
        builder
            .args(&command.args)
            .current_dir(&command.cwd)
            .envs(&command.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        // With a timeout the child leads its own process group; the deadline
        // kill targets the whole group.
        #[cfg(unix)]
        if self.timeout.is_some() {
            use std::os::unix::process::CommandExt;
            builder.process_group(0);
        }
        let mut child = builder
            .spawn()
            .map_err(|source| HarnessError::ProcessLaunch {
                program: command.program.clone(),
                cwd: command.cwd.clone(),
                source,
            })?;

        let (stdout, stderr) = match (child.stdout.take(), child.stderr.take()) {
            (Some(out), Some(err)) => (out, err),
            _ => {
                reap(&mut child);
                return Err(HarnessError::Capture {
                    stream: StreamKind::Stdout,
                    source: io::Error::other("child pipes unavailable"),
                });
            }
        };

        let out_reader = spawn_reader(stdout, StreamKind::Stdout, echo);
        let err_reader = spawn_reader(stderr, StreamKind::Stderr, echo);

        let waited = self.wait(&mut child);

        // The child is gone (or killed); readers finish once the pipes hit EOF.
        let stdout = join_reader(out_reader, StreamKind::Stdout)?;
        let stderr = join_reader(err_reader, StreamKind::Stderr)?;
        let elapsed = start.elapsed();

        let status = match waited {
            Ok(Some(status)) => status,
            Ok(None) => {
                warn!(
                    "Killed '{}' after {:.1}s timeout",
                    command.display(),
                    elapsed.as_secs_f64()
                );
                return Err(HarnessError::Timeout {
                    program: command.program.clone(),
                    secs: elapsed.as_secs_f64(),
                    stdout_bytes: stdout.len(),
                    stderr_bytes: stderr.len(),
                });
            }
            Err(source) => {
                return Err(HarnessError::Wait {
                    program: command.program.clone(),
                    source,
                })
            }
        };

        debug!(
            "'{}' completed in {:.2}s with exit code: {:?}",
            command.program,
            elapsed.as_secs_f64(),
            status.code()
        );

        Ok(CaptureResult {
            exit_code: status.code(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            elapsed,
        })
    }

    /// Wait for exit. `Ok(None)` means the timeout expired and the child was killed.
    fn wait(&self, child: &mut Child) -> io::Result<Option<ExitStatus>> {
        let Some(limit) = self.timeout else {
            return child.wait().map(Some);
        };

        let deadline = Instant::now() + limit;
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(Some(status)),
                Ok(None) => {}
                Err(e) => {
                    reap_group(child);
                    return Err(e);
                }
            }
            if Instant::now() >= deadline {
                reap_group(child);
                return Ok(None);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl Launcher for ProcessRunner {
    fn launch(&self, command: &Command, echo: bool) -> Result<CaptureResult> {
        self.run(command, echo)
    }
}

fn reap(child: &mut Child) {
    let _ = child.kill();
    let _ = child.wait();
}

/// Kill the child's whole process group, then reap the child.
#[cfg(unix)]
fn reap_group(child: &mut Child) {
    if let Ok(pgid) = libc::pid_t::try_from(child.id()) {
        // SAFETY: killpg only sends a signal; the group was created at spawn
        // and its leader is not yet reaped, so the id cannot have been reused.
        unsafe {
            libc::killpg(pgid, libc::SIGKILL);
        }
    }
    reap(child);
}

#[cfg(not(unix))]
fn reap_group(child: &mut Child) {
    reap(child);
}

fn spawn_reader<R>(pipe: R, kind: StreamKind, echo: bool) -> JoinHandle<io::Result<Vec<u8>>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || drain(pipe, kind, echo))
}

fn join_reader(handle: JoinHandle<io::Result<Vec<u8>>>, stream: StreamKind) -> Result<Vec<u8>> {
    match handle.join() {
        Ok(Ok(bytes)) => Ok(bytes),
        Ok(Err(source)) => Err(HarnessError::Capture { stream, source }),
        Err(_) => Err(HarnessError::Capture {
            stream,
            source: io::Error::other("reader thread panicked"),
        }),
    }
}

/// Read `pipe` line by line until EOF, optionally echoing each line.
///
/// Lines are kept as raw bytes; a trailing line without a newline is kept too.
fn drain<R: Read>(pipe: R, kind: StreamKind, echo: bool) -> io::Result<Vec<u8>> {
    let mut reader = BufReader::new(pipe);
    let mut captured = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }
        if echo {
            echo_line(kind, &line);
        }
        captured.extend_from_slice(&line);
    }

    Ok(captured)
}

fn echo_line(kind: StreamKind, line: &[u8]) {
    // Echo is best effort; a closed console must not abort the capture.
    match kind {
        StreamKind::Stdout => {
            let mut out = io::stdout().lock();
            let _ = out.write_all(line);
            let _ = out.flush();
        }
        StreamKind::Stderr => {
            let mut err = io::stderr().lock();
            let _ = err.write_all(line);
            let _ = err.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt::Write as _;
    use std::path::Path;

    fn sh(script: &str, cwd: &Path) -> Command {
        Command::new("sh", cwd).arg("-c").arg(script)
    }

    fn cwd() -> PathBuf {
        std::env::temp_dir()
    }

    #[test]
    fn should_capture_streams_independently() {
        let result = ProcessRunner::new()
            .run(&sh("echo out; echo err >&2; echo out2", &cwd()), false)
            .unwrap();

        assert!(result.success());
        assert_eq!(result.stdout, "out\nout2\n");
        assert_eq!(result.stderr, "err\n");
    }

    #[test]
    fn should_capture_everything_when_output_exceeds_pipe_capacity() {
        // ~300 KiB per stream, well past the usual 64 KiB pipe buffer.
        let script = r#"
            i=0
            while [ $i -lt 20000 ]; do
                echo "stdout line $i"
                echo "stderr line $i" >&2
                i=$((i+1))
            done
        "#;
        let result = ProcessRunner::new().run(&sh(script, &cwd()), false).unwrap();

        let mut expected_out = String::new();
        let mut expected_err = String::new();
        for i in 0..20000 {
            writeln!(expected_out, "stdout line {i}").unwrap();
            writeln!(expected_err, "stderr line {i}").unwrap();
        }
        assert!(result.success());
        assert_eq!(result.stdout, expected_out);
        assert_eq!(result.stderr, expected_err);
    }

    #[test]
    fn should_drain_stderr_while_stdout_is_silent() {
        // A child that only fills stderr would block forever if stdout were read first.
        let script = "head -c 262144 /dev/zero | tr '\\0' 'e' >&2; echo done";
        let result = ProcessRunner::new().run(&sh(script, &cwd()), false).unwrap();

        assert_eq!(result.stderr.len(), 262144);
        assert_eq!(result.stdout, "done\n");
    }

    #[test]
    fn should_keep_trailing_partial_line() {
        let result = ProcessRunner::new()
            .run(&sh("printf 'a\\nb'; printf 'no newline' >&2", &cwd()), false)
            .unwrap();
        assert_eq!(result.stdout, "a\nb");
        assert_eq!(result.stderr, "no newline");
    }

    #[test]
    fn should_report_nonzero_exit_code() {
        let result = ProcessRunner::new()
            .run(&sh("echo boom >&2; exit 3", &cwd()), false)
            .unwrap();
        assert_eq!(result.exit_code, Some(3));
        assert!(!result.success());
        assert_eq!(result.stderr_tail(5), "boom");
    }

    #[test]
    fn should_fail_to_launch_missing_executable() {
        let cmd = Command::new("/definitely/not/a/real/binary", cwd());
        let err = ProcessRunner::new().run(&cmd, false).unwrap_err();
        assert!(matches!(err, HarnessError::ProcessLaunch { .. }));
    }

    #[test]
    fn should_apply_env_overlay_and_working_directory() {
        let dir = tempfile::tempdir().unwrap();
        let cmd = sh("echo \"$BENCHGRID_TEST_VAR\"; pwd", dir.path()).env("BENCHGRID_TEST_VAR", "overlay");
        let result = ProcessRunner::new().run(&cmd, false).unwrap();

        let mut lines = result.stdout.lines();
        assert_eq!(lines.next(), Some("overlay"));
        let pwd = PathBuf::from(lines.next().unwrap());
        assert_eq!(
            pwd.canonicalize().unwrap(),
            dir.path().canonicalize().unwrap()
        );
    }

    #[test]
    fn should_kill_child_after_timeout() {
        let runner = ProcessRunner::new().with_timeout(Some(Duration::from_millis(100)));
        let start = Instant::now();
        let err = runner.run(&sh("echo started; exec sleep 10", &cwd()), false).unwrap_err();

        assert!(matches!(err, HarnessError::Timeout { stdout_bytes: 8, .. }));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn should_kill_forked_descendants_after_timeout() {
        // No exec: sh forks sleep, which inherits both pipes.
        let runner = ProcessRunner::new().with_timeout(Some(Duration::from_millis(200)));
        let start = Instant::now();
        let err = runner
            .run(&sh("echo started; sleep 5; echo after", &cwd()), false)
            .unwrap_err();

        assert!(matches!(err, HarnessError::Timeout { stdout_bytes: 8, .. }));
        assert!(start.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn should_capture_unchanged_when_echoing() {
        let input: &[u8] = b"first\nsecond\r\n\xffraw tail";
        let captured = drain(std::io::Cursor::new(input), StreamKind::Stderr, true).unwrap();
        assert_eq!(captured, input);

        let result = ProcessRunner::new()
            .run(&sh("echo out; echo err >&2", &cwd()), true)
            .unwrap();
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
    }

    #[test]
    fn should_build_command_from_argv() {
        let argv = vec!["./main".to_string(), "100".to_string(), "8".to_string()];
        let cmd = Command::from_argv(&argv, "/tmp").unwrap();
        assert_eq!(cmd.program, "./main");
        assert_eq!(cmd.args, vec!["100", "8"]);
        assert_eq!(cmd.display(), "./main 100 8");
        assert!(Command::from_argv(&[], "/tmp").is_err());
    }
}
