//! Child-process execution with a hard deadline
//!
//! Scanner invocations run external processes that can hang on a bad file or
//! a wedged daemon. Output is drained on separate threads while the parent
//! polls for exit; past the deadline the child is killed and the caller sees
//! `timed_out` rather than blocking forever.

use anyhow::{Context, Result};
use std::io::Read;
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

const POLL_INTERVAL: Duration = Duration::from_millis(25);

#[derive(Debug)]
pub struct CapturedOutput {
    /// Exit code, if the process exited normally before the deadline.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    pub timed_out: bool,
}

impl CapturedOutput {
    /// stdout and stderr concatenated, for parsers that match either stream.
    pub fn combined(&self) -> String {
        let mut combined = self.stdout.clone();
        if !self.stderr.is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&self.stderr);
        }
        combined
    }
}

fn drain<R: Read + Send + 'static>(reader: R) -> thread::JoinHandle<Vec<u8>> {
    thread::spawn(move || {
        let mut reader = reader;
        let mut buf = Vec::new();
        let _ = reader.read_to_end(&mut buf);
        buf
    })
}

/// Run a command to completion, killing it if it outlives `timeout`.
/// `timeout = None` waits indefinitely.
pub fn run_with_timeout(mut cmd: Command, timeout: Option<Duration>) -> Result<CapturedOutput> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to spawn {:?}", cmd.get_program()))?;

    let stdout_handle = drain(child.stdout.take().expect("stdout was piped"));
    let stderr_handle = drain(child.stderr.take().expect("stderr was piped"));

    let started = Instant::now();
    let mut timed_out = false;
    let exit_status = loop {
        match child.try_wait().context("Failed to poll child process")? {
            Some(status) => break Some(status),
            None => {
                if let Some(limit) = timeout {
                    if started.elapsed() >= limit {
                        let _ = child.kill();
                        let _ = child.wait();
                        timed_out = true;
                        break None;
                    }
                }
                thread::sleep(POLL_INTERVAL);
            }
        }
    };

    let stdout = String::from_utf8_lossy(&stdout_handle.join().unwrap_or_default()).into_owned();
    let stderr = String::from_utf8_lossy(&stderr_handle.join().unwrap_or_default()).into_owned();

    Ok(CapturedOutput {
        exit_code: exit_status.and_then(|s| s.code()),
        stdout,
        stderr,
        timed_out,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fast_command_completes() {
        let mut cmd = Command::new("echo");
        cmd.arg("hello");
        let out = run_with_timeout(cmd, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert!(!out.timed_out);
        assert_eq!(out.stdout.trim(), "hello");
    }

    #[test]
    fn test_slow_command_is_killed() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30");
        let started = Instant::now();
        let out = run_with_timeout(cmd, Some(Duration::from_millis(200))).unwrap();
        assert!(out.timed_out);
        assert!(out.exit_code.is_none());
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[test]
    fn test_no_timeout_waits_for_exit() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "sleep 0.1; echo done"]);
        let out = run_with_timeout(cmd, None).unwrap();
        assert_eq!(out.exit_code, Some(0));
        assert_eq!(out.stdout.trim(), "done");
    }

    #[test]
    fn test_stderr_is_captured_separately() {
        let mut cmd = Command::new("sh");
        cmd.args(["-c", "echo out; echo err >&2; exit 3"]);
        let out = run_with_timeout(cmd, Some(Duration::from_secs(5))).unwrap();
        assert_eq!(out.exit_code, Some(3));
        assert_eq!(out.stdout.trim(), "out");
        assert_eq!(out.stderr.trim(), "err");
        assert!(out.combined().contains("out"));
        assert!(out.combined().contains("err"));
    }
}
