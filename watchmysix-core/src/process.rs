//! External command supervision.
//!
//! Every step runs in its own process group so that a timeout or
//! cancellation reaches the tool's descendants too (many recon tools shell
//! out to helpers). Output is split into lines and handed to a callback as
//! it arrives.

use std::{
    io,
    path::PathBuf,
    process::Stdio,
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// A fully resolved command line.
#[derive(Debug, Clone)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: Vec<(String, String)>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: Vec::new(),
        }
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

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// The process exited on its own. `code` is `None` when it died from a
    /// signal it did not receive from us.
    Exited { code: Option<i32> },
    /// Killed after exceeding the step timeout.
    TimedOut,
    /// Killed because the cancel signal fired.
    Killed,
}

impl ProcessOutcome {
    pub fn success(&self) -> bool {
        matches!(self, Self::Exited { code: Some(0) })
    }
}

#[derive(Debug, Clone, Copy)]
enum Interrupt {
    Timeout,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct ProcessRunner {
    timeout: Duration,
    kill_grace: Duration,
}

impl ProcessRunner {
    pub fn new(timeout: Duration, kill_grace: Duration) -> Self {
        Self {
            timeout,
            kill_grace,
        }
    }

    /// Run `spec` to completion, invoking `on_line` for every output line.
    ///
    /// Returns `Err` only when the process could not be launched.
    pub async fn run<F>(
        &self,
        spec: &CommandSpec,
        mut on_line: F,
        cancel: &CancellationToken,
    ) -> io::Result<ProcessOutcome>
    where
        F: FnMut(OutputStream, &str) + Send,
    {
        let mut command = Command::new(&spec.program);
        command
            .args(&spec.args)
            .current_dir(&spec.cwd)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        command.process_group(0);

        let mut child = command.spawn()?;
        debug!(program = %spec.program, pid = ?child.id(), "spawned step process");

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::other("stdout was not captured"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::other("stderr was not captured"))?;
        let mut stdout = LineReader::new(stdout);
        let mut stderr = LineReader::new(stderr);

        let deadline = tokio::time::sleep(self.timeout);
        tokio::pin!(deadline);

        let interrupt = loop {
            if !stdout.open && !stderr.open {
                break None;
            }
            tokio::select! {
                line = stdout.next_line(), if stdout.open => {
                    if let Some(line) = line {
                        on_line(OutputStream::Stdout, &line);
                    }
                }
                line = stderr.next_line(), if stderr.open => {
                    if let Some(line) = line {
                        on_line(OutputStream::Stderr, &line);
                    }
                }
                _ = &mut deadline => break Some(Interrupt::Timeout),
                _ = cancel.cancelled() => break Some(Interrupt::Cancelled),
            }
        };

        let interrupt = match interrupt {
            Some(interrupt) => interrupt,
            None => tokio::select! {
                status = child.wait() => {
                    return Ok(ProcessOutcome::Exited { code: status?.code() });
                }
                _ = &mut deadline => Interrupt::Timeout,
                _ = cancel.cancelled() => Interrupt::Cancelled,
            },
        };

        self.terminate(&mut child).await;
        Ok(match interrupt {
            Interrupt::Timeout => ProcessOutcome::TimedOut,
            Interrupt::Cancelled => ProcessOutcome::Killed,
        })
    }

    /// SIGTERM the process group, then SIGKILL it once the grace period
    /// runs out.
    async fn terminate(&self, child: &mut Child) {
        let Some(pid) = child.id() else {
            // Already reaped.
            return;
        };

        signal_group(pid, GroupSignal::Terminate);
        match tokio::time::timeout(self.kill_grace, child.wait()).await {
            Ok(Ok(_)) => {
                // The leader is gone; make sure stragglers in its group are too.
                signal_group(pid, GroupSignal::Kill);
            }
            Ok(Err(err)) => {
                warn!(pid, error = %err, "failed waiting on terminated step");
                signal_group(pid, GroupSignal::Kill);
            }
            Err(_) => {
                debug!(pid, "grace period elapsed, killing process group");
                signal_group(pid, GroupSignal::Kill);
                if let Err(err) = child.start_kill() {
                    debug!(pid, error = %err, "start_kill after group kill");
                }
                if let Err(err) = child.wait().await {
                    warn!(pid, error = %err, "failed reaping killed step");
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum GroupSignal {
    Terminate,
    Kill,
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: GroupSignal) {
    use nix::{
        errno::Errno,
        sys::signal::{Signal, killpg},
        unistd::Pid,
    };

    let signal = match signal {
        GroupSignal::Terminate => Signal::SIGTERM,
        GroupSignal::Kill => Signal::SIGKILL,
    };
    match killpg(Pid::from_raw(pid as i32), signal) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(err) => warn!(pid, ?signal, error = %err, "failed to signal process group"),
    }
}

#[cfg(not(unix))]
fn signal_group(_pid: u32, _signal: GroupSignal) {}

/// Longest line handed to the callback; longer output is split.
pub const MAX_LINE_BYTES: usize = 64 * 1024;

/// Line splitter that keeps partial lines across cancelled reads, so it can
/// sit in a `select!` branch.
struct LineReader<R> {
    inner: BufReader<R>,
    buf: Vec<u8>,
    open: bool,
}

impl<R: AsyncRead + Unpin> LineReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner: BufReader::new(inner),
            buf: Vec::new(),
            open: true,
        }
    }

    async fn next_line(&mut self) -> Option<String> {
        loop {
            let available: &[u8] = match self.inner.fill_buf().await {
                Ok(available) => available,
                Err(err) => {
                    warn!(error = %err, "step output stream failed");
                    &[]
                }
            };
            if available.is_empty() {
                self.open = false;
                if self.buf.is_empty() {
                    return None;
                }
                return Some(self.take_line());
            }

            let room = MAX_LINE_BYTES - self.buf.len();
            let window = &available[..available.len().min(room)];
            match window.iter().position(|&byte| byte == b'\n') {
                Some(end) => {
                    self.buf.extend_from_slice(&window[..=end]);
                    self.inner.consume(end + 1);
                    return Some(self.take_line());
                }
                None => {
                    let taken = window.len();
                    self.buf.extend_from_slice(window);
                    self.inner.consume(taken);
                    if self.buf.len() >= MAX_LINE_BYTES {
                        return Some(self.take_line());
                    }
                }
            }
        }
    }

    fn take_line(&mut self) -> String {
        let mut line = std::mem::take(&mut self.buf);
        while matches!(line.last(), Some(b'\n' | b'\r')) {
            line.pop();
        }
        String::from_utf8_lossy(&line).into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn sh(script: &str, cwd: &std::path::Path) -> CommandSpec {
        CommandSpec::new("/bin/sh", cwd).arg("-c").arg(script)
    }

    #[tokio::test]
    async fn streams_lines_and_reports_exit_code() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(Duration::from_secs(10), Duration::from_secs(1));
        let mut lines = Vec::new();

        let outcome = runner
            .run(
                &sh("echo one; echo two; printf three; exit 3", dir.path()),
                |stream, line| lines.push((stream, line.to_string())),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert_eq!(outcome, ProcessOutcome::Exited { code: Some(3) });
        let stdout: Vec<_> = lines
            .iter()
            .filter(|(stream, _)| *stream == OutputStream::Stdout)
            .map(|(_, line)| line.as_str())
            .collect();
        assert_eq!(stdout, vec!["one", "two", "three"]);
    }

    #[tokio::test]
    async fn captures_stderr_and_environment() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(Duration::from_secs(10), Duration::from_secs(1));
        let mut lines = Vec::new();
        let spec = sh("echo \"key=$CHAOS_KEY\" >&2", dir.path())
            .envs([("CHAOS_KEY", "secret")]);

        let outcome = runner
            .run(&spec, |stream, line| lines.push((stream, line.to_string())), &CancellationToken::new())
            .await
            .unwrap();

        assert!(outcome.success());
        assert_eq!(lines, vec![(OutputStream::Stderr, "key=secret".to_string())]);
    }

    #[tokio::test]
    async fn missing_binary_is_a_launch_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(Duration::from_secs(10), Duration::from_secs(1));
        let err = runner
            .run(
                &CommandSpec::new("/definitely/not/a/tool", dir.path()),
                |_, _| {},
                &CancellationToken::new(),
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }

    #[tokio::test]
    async fn timeout_kills_the_step() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(Duration::from_millis(200), Duration::from_millis(200));
        let started = Instant::now();

        let outcome = runner
            .run(&sh("sleep 30", dir.path()), |_, _| {}, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(outcome, ProcessOutcome::TimedOut);
        assert!(started.elapsed() < Duration::from_secs(5));
    }

    #[tokio::test]
    async fn cancellation_terminates_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(Duration::from_secs(30), Duration::from_millis(500));
        let cancel = CancellationToken::new();
        let pid_file = dir.path().join("child.pid");
        let script = format!(
            "sleep 30 & echo $! > {}; echo started; wait",
            pid_file.display()
        );

        let trigger = cancel.clone();
        let outcome = runner
            .run(
                &sh(&script, dir.path()),
                move |_, line| {
                    if line == "started" {
                        trigger.cancel();
                    }
                },
                &cancel,
            )
            .await
            .unwrap();

        assert_eq!(outcome, ProcessOutcome::Killed);

        #[cfg(target_os = "linux")]
        {
            let pid = std::fs::read_to_string(&pid_file).unwrap();
            let proc_path = format!("/proc/{}", pid.trim());
            let deadline = Instant::now() + Duration::from_secs(3);
            while std::path::Path::new(&proc_path).exists() && Instant::now() < deadline {
                // The orphan may linger as a zombie until init reaps it.
                let status = std::fs::read_to_string(format!("{proc_path}/status"))
                    .unwrap_or_default();
                if status.contains("State:\tZ") {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            let status = std::fs::read_to_string(format!("{proc_path}/status"))
                .unwrap_or_default();
            assert!(status.is_empty() || status.contains("State:\tZ"));
        }
    }

    #[tokio::test]
    async fn unterminated_output_is_split_at_the_line_cap() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ProcessRunner::new(Duration::from_secs(10), Duration::from_secs(1));
        let total = MAX_LINE_BYTES * 2 + 100;
        let mut lines = Vec::new();

        let outcome = runner
            .run(
                &sh(
                    &format!("head -c {total} /dev/zero | tr '\\0' a"),
                    dir.path(),
                ),
                |_, line| lines.push(line.len()),
                &CancellationToken::new(),
            )
            .await
            .unwrap();

        assert!(outcome.success());
        assert_eq!(lines, vec![MAX_LINE_BYTES, MAX_LINE_BYTES, 100]);
    }
}
