//! Process runner: one generator invocation under a hard wall-clock deadline.
//!
//! The child gets its own process group so a deadline kill also takes down
//! whatever the privilege wrapper and the generator spawned beneath it.

#![allow(missing_docs)]

use std::ffi::OsString;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::Path;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{self as channel, Receiver};
use parking_lot::Mutex;

use crate::core::errors::{HarnessError, Result};
use crate::invoke::environment::EnvBag;

const POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Minimum time given to the pipe readers once the child is gone.
const DRAIN_GRACE: Duration = Duration::from_millis(200);

/// A fully described generator run.
#[derive(Debug, Clone)]
pub struct Invocation<'a> {
    pub program: &'a Path,
    pub args: Vec<OsString>,
    pub env: &'a EnvBag,
    pub workdir: &'a Path,
    pub deadline: Duration,
    /// Privilege emulation wrapper the program is run under.
    pub wrapper: Option<&'a str>,
}

impl Invocation<'_> {
    /// Argument vector as actually executed, wrapper first.
    #[must_use]
    pub fn command_line(&self) -> Vec<OsString> {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        if let Some(wrapper) = self.wrapper {
            argv.push(OsString::from(wrapper));
        }
        argv.push(self.program.as_os_str().to_owned());
        argv.extend(self.args.iter().cloned());
        argv
    }
}

/// Captured result of a successful run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
    pub duration: Duration,
}

/// Runs invocations; optionally echoes child output and honors a cancel flag.
#[derive(Debug, Clone, Default)]
pub struct ProcessRunner {
    forward_output: bool,
    cancel: Option<Arc<AtomicBool>>,
}

impl ProcessRunner {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Echo child stdout/stderr lines to our stderr as they arrive.
    #[must_use]
    pub fn with_forwarding(mut self, forward: bool) -> Self {
        self.forward_output = forward;
        self
    }

    /// Kill the child and fail with `Cancelled` once `flag` becomes true.
    #[must_use]
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel = Some(flag);
        self
    }

    /// Run to completion. Non-zero exit, deadline expiry, and cancellation are errors
    /// carrying the captured streams.
    pub fn run(&self, invocation: &Invocation<'_>) -> Result<RunOutcome> {
        let argv = invocation.command_line();
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| HarnessError::Runtime {
                details: "empty command line".to_string(),
            })?;

        let mut command = Command::new(program);
        command
            .args(args)
            .current_dir(invocation.workdir)
            .env_clear()
            .envs(invocation.env.iter())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            command.process_group(0);
        }

        let start = Instant::now();
        let mut child = command.spawn().map_err(|source| HarnessError::Spawn {
            program: program.to_string_lossy().into_owned(),
            source,
        })?;

        let stdout_reader = child
            .stdout
            .take()
            .map(|pipe| spawn_reader(pipe, "stdout", self.forward_output));
        let stderr_reader = child
            .stderr
            .take()
            .map(|pipe| spawn_reader(pipe, "stderr", self.forward_output));

        let waited = self.wait(&mut child, invocation.deadline);
        // Background children left in the group would hold the pipes open.
        kill_group(&child);
        let drain_until = (start + invocation.deadline).max(Instant::now() + DRAIN_GRACE);
        let stdout = collect_output(stdout_reader, drain_until);
        let stderr = collect_output(stderr_reader, drain_until);

        match waited? {
            Waited::Exited(status) if status.success() => Ok(RunOutcome {
                status,
                stdout,
                stderr,
                duration: start.elapsed(),
            }),
            Waited::Exited(status) => Err(HarnessError::GeneratorFailed {
                status: status.to_string(),
                stdout,
                stderr,
            }),
            Waited::TimedOut => Err(HarnessError::GeneratorTimeout {
                deadline_secs: invocation.deadline.as_secs(),
                stdout,
                stderr,
            }),
            Waited::Cancelled => Err(HarnessError::Cancelled {
                context: "running the generator",
            }),
        }
    }

    fn wait(&self, child: &mut Child, deadline: Duration) -> Result<Waited> {
        let start = Instant::now();
        loop {
            match child.try_wait() {
                Ok(Some(status)) => return Ok(Waited::Exited(status)),
                Ok(None) => {}
                Err(err) => {
                    kill_tree(child);
                    return Err(HarnessError::Runtime {
                        details: format!("waiting for generator failed: {err}"),
                    });
                }
            }

            if start.elapsed() >= deadline {
                kill_tree(child);
                return Ok(Waited::TimedOut);
            }
            if self
                .cancel
                .as_ref()
                .is_some_and(|flag| flag.load(Ordering::Relaxed))
            {
                kill_tree(child);
                return Ok(Waited::Cancelled);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

enum Waited {
    Exited(ExitStatus),
    TimedOut,
    Cancelled,
}

/// SIGKILL the child's process group. The group id is the child's pid, so
/// this also reaches members that outlived an already reaped leader.
fn kill_group(child: &Child) {
    #[cfg(unix)]
    {
        use nix::sys::signal::{Signal, killpg};
        use nix::unistd::Pid;

        if let Ok(raw) = i32::try_from(child.id()) {
            let _ = killpg(Pid::from_raw(raw), Signal::SIGKILL);
        }
    }
    #[cfg(not(unix))]
    let _ = child;
}

/// Kill the group (falling back to the child alone), then reap it.
fn kill_tree(child: &mut Child) {
    kill_group(child);
    let _ = child.kill();
    let _ = child.wait();
}

/// A pipe drained on its own thread into a shared buffer.
struct OutputReader {
    captured: Arc<Mutex<String>>,
    /// Disconnects when the pipe reaches EOF.
    done: Receiver<()>,
}

fn spawn_reader<R>(pipe: R, label: &'static str, forward: bool) -> OutputReader
where
    R: Read + Send + 'static,
{
    let captured = Arc::new(Mutex::new(String::new()));
    let (done_tx, done) = channel::bounded::<()>(0);
    let sink = Arc::clone(&captured);
    thread::spawn(move || {
        let _done_tx = done_tx;
        let mut reader = BufReader::new(pipe);
        let mut line = Vec::new();
        loop {
            line.clear();
            match reader.read_until(b'\n', &mut line) {
                Ok(0) | Err(_) => break,
                Ok(_) => {
                    let text = String::from_utf8_lossy(&line);
                    if forward {
                        let _ = write!(io::stderr(), "[generator {label}] {text}");
                    }
                    sink.lock().push_str(&text);
                }
            }
        }
    });
    OutputReader { captured, done }
}

/// Whatever the reader captured by EOF or `until`, whichever comes first.
/// A reader still blocked on a pipe held by an escaped process is abandoned.
fn collect_output(reader: Option<OutputReader>, until: Instant) -> String {
    reader.map_or_else(String::new, |reader| {
        let _ = reader.done.recv_deadline(until);
        std::mem::take(&mut *reader.captured.lock())
    })
}
