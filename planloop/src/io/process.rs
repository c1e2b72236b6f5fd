//! Child process execution with a hard timeout and bounded output capture.

use std::io::{Read, Write};
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// How often a running child is checked for an interrupt.
const INTERRUPT_POLL: Duration = Duration::from_millis(100);
/// How long output readers may keep draining after the child was killed.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Captured child process output.
#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
    pub timed_out: bool,
}

impl CommandOutput {
    /// True only for a zero exit that was not cut short by the timeout.
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.status.success()
    }

    pub fn stdout_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stdout).into_owned();
        if self.stdout_truncated > 0 {
            text.push_str(&format!(
                "\n[stdout truncated {} bytes]\n",
                self.stdout_truncated
            ));
        }
        text
    }

    pub fn stderr_text(&self) -> String {
        let mut text = String::from_utf8_lossy(&self.stderr).into_owned();
        if self.stderr_truncated > 0 {
            text.push_str(&format!(
                "\n[stderr truncated {} bytes]\n",
                self.stderr_truncated
            ));
        }
        text
    }
}

/// Run a command with a timeout and capture stdout/stderr without risking pipe deadlocks.
///
/// Output is read concurrently while the child runs. `output_limit_bytes` bounds the amount of
/// stdout/stderr stored in memory (bytes beyond this are discarded while still draining the pipe).
///
/// On Unix the child leads its own process group. On timeout, or when `interrupt` is raised, the
/// whole group is killed so descendants holding the output pipes cannot outlive the deadline;
/// `timed_out` is set only for the timeout.
#[instrument(skip_all, fields(timeout_secs = timeout.as_secs(), output_limit_bytes))]
pub fn run_command_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
    output_limit_bytes: usize,
    interrupt: Option<&AtomicBool>,
) -> Result<CommandOutput> {
    if stdin.is_some() {
        cmd.stdin(Stdio::piped());
    } else {
        cmd.stdin(Stdio::null());
    }
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        cmd.process_group(0);
    }

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let stdout_handle = thread::spawn(move || read_stream_limited(stdout, output_limit_bytes));
    let stderr_handle = thread::spawn(move || read_stream_limited(stderr, output_limit_bytes));

    // Feed stdin from its own thread so a child that never reads cannot stall
    // us past the timeout. Dropping the handle closes the pipe and signals EOF.
    let stdin_handle = match stdin {
        Some(input) => {
            let mut child_stdin = child
                .stdin
                .take()
                .ok_or_else(|| anyhow!("stdin was not piped"))?;
            let input = input.to_vec();
            Some(thread::spawn(move || {
                if let Err(err) = child_stdin.write_all(&input) {
                    // The child may exit without reading; its status says what happened.
                    warn!(err = %err, "failed to write child stdin");
                }
            }))
        }
        None => None,
    };

    let deadline = Instant::now() + timeout;
    let mut timed_out = false;
    let mut drain_deadline = None;
    let status = loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let slice = match interrupt {
            Some(_) => remaining.min(INTERRUPT_POLL),
            None => remaining,
        };
        if let Some(status) = child.wait_timeout(slice).context("wait for command")? {
            break status;
        }
        let interrupted = interrupt.is_some_and(|flag| flag.load(Ordering::SeqCst));
        if interrupted || Instant::now() >= deadline {
            if interrupted {
                warn!("interrupted, killing command");
            } else {
                warn!(
                    timeout_secs = timeout.as_secs(),
                    "command timed out, killing"
                );
                timed_out = true;
            }
            kill_tree(&mut child)?;
            drain_deadline = Some(Instant::now() + DRAIN_GRACE);
            break child.wait().context("wait command after kill")?;
        }
    };

    if let Some(handle) = stdin_handle
        && handle.join().is_err()
    {
        warn!("stdin writer thread panicked");
    }
    let (stdout, stdout_truncated) =
        join_output(stdout_handle, drain_deadline).context("join stdout")?;
    let (stderr, stderr_truncated) =
        join_output(stderr_handle, drain_deadline).context("join stderr")?;

    if stdout_truncated > 0 || stderr_truncated > 0 {
        warn!(stdout_truncated, stderr_truncated, "output truncated");
    }

    debug!(exit_code = ?status.code(), timed_out, "command finished");
    Ok(CommandOutput {
        status,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        timed_out,
    })
}

/// Kill the child and, on Unix, every process in its group.
fn kill_tree(child: &mut Child) -> Result<()> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        match i32::try_from(child.id()) {
            Ok(pid) => {
                if let Err(err) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
                    warn!(err = %err, "failed to kill process group");
                }
            }
            Err(_) => warn!(pid = child.id(), "pid out of range for process group kill"),
        }
    }
    child.kill().context("kill command")
}

/// Join a reader; past `drain_deadline` the reader is abandoned with empty output.
fn join_output(
    handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>,
    drain_deadline: Option<Instant>,
) -> Result<(Vec<u8>, usize)> {
    if let Some(deadline) = drain_deadline {
        while !handle.is_finished() {
            if Instant::now() >= deadline {
                warn!("output pipe still open after kill, abandoning reader");
                return Ok((Vec::new(), 0));
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}

fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[test]
    fn captures_stdout_and_stdin() {
        let output = run_command_with_timeout(
            sh("cat; echo done >&2"),
            Some(b"hello"),
            Duration::from_secs(5),
            1024,
            None,
        )
        .expect("run");
        assert!(output.succeeded());
        assert_eq!(output.stdout_text(), "hello");
        assert_eq!(output.stderr_text(), "done\n");
    }

    #[test]
    fn reports_nonzero_exit() {
        let output = run_command_with_timeout(sh("exit 3"), None, Duration::from_secs(5), 1024, None)
            .expect("run");
        assert!(!output.succeeded());
        assert_eq!(output.status.code(), Some(3));
    }

    #[test]
    fn kills_on_timeout() {
        let output =
            run_command_with_timeout(sh("exec sleep 5"), None, Duration::from_millis(100), 1024, None)
                .expect("run");
        assert!(output.timed_out);
        assert!(!output.succeeded());
    }

    #[test]
    fn timeout_bounds_wall_time_with_descendants() {
        // The shell stays the parent of `sleep`, which inherits the output pipes.
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 6; echo late"),
            None,
            Duration::from_millis(200),
            1024,
            None,
        )
        .expect("run");
        assert!(output.timed_out);
        assert!(started.elapsed() < Duration::from_secs(4), "{:?}", started.elapsed());
        assert!(!output.stdout_text().contains("late"));
    }

    #[test]
    fn interrupt_kills_running_command() {
        let flag = Arc::new(AtomicBool::new(false));
        let raiser = {
            let flag = Arc::clone(&flag);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                flag.store(true, Ordering::SeqCst);
            })
        };
        let started = Instant::now();
        let output = run_command_with_timeout(
            sh("sleep 6"),
            None,
            Duration::from_secs(30),
            1024,
            Some(&flag),
        )
        .expect("run");
        raiser.join().expect("join");
        assert!(!output.timed_out);
        assert!(!output.succeeded());
        assert!(started.elapsed() < Duration::from_secs(4), "{:?}", started.elapsed());
    }

    #[test]
    fn truncates_output_beyond_limit() {
        let output =
            run_command_with_timeout(sh("printf 'abcdef'"), None, Duration::from_secs(5), 4, None)
                .expect("run");
        assert_eq!(output.stdout, b"abcd");
        assert_eq!(output.stdout_truncated, 2);
        assert!(output.stdout_text().contains("[stdout truncated 2 bytes]"));
    }

    #[test]
    fn spawn_failure_is_an_error() {
        let cmd = Command::new("/nonexistent/planloop-agent");
        let err = run_command_with_timeout(cmd, None, Duration::from_secs(1), 1024, None).unwrap_err();
        assert!(err.to_string().contains("spawn command"));
    }
}
