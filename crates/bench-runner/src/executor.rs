use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

/// Where a command's stdout goes when it is not inherited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Redirect {
    Truncate(PathBuf),
    Append(PathBuf),
}

/// A fully structured external invocation. Relative redirect paths resolve
/// against `current_dir`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub current_dir: Option<PathBuf>,
    pub stdin: Option<PathBuf>,
    pub stdout: Option<Redirect>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            current_dir: None,
            stdin: None,
            stdout: None,
        }
    }

    /// Runs `script` through `sh -c`.
    pub fn shell(script: impl Into<String>) -> Self {
        Self::new("sh").arg("-c").arg(script)
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

    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.current_dir = Some(dir.into());
        self
    }

    pub fn stdin_from(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    pub fn stdout_to(mut self, redirect: Redirect) -> Self {
        self.stdout = Some(redirect);
        self
    }

    pub fn display(&self) -> String {
        let mut out = self.program.clone();
        for arg in &self.args {
            out.push(' ');
            out.push_str(&shell_quote(arg));
        }
        if let Some(stdin) = &self.stdin {
            out.push_str(&format!(" < {}", stdin.display()));
        }
        match &self.stdout {
            Some(Redirect::Truncate(p)) => out.push_str(&format!(" > {}", p.display())),
            Some(Redirect::Append(p)) => out.push_str(&format!(" >> {}", p.display())),
            None => {}
        }
        out
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        match &self.current_dir {
            Some(dir) if path.is_relative() => dir.join(path),
            _ => path.to_path_buf(),
        }
    }

    fn to_command(&self) -> io::Result<Command> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        match &self.stdin {
            Some(path) => cmd.stdin(Stdio::from(File::open(self.resolve(path))?)),
            None => cmd.stdin(Stdio::null()),
        };
        match &self.stdout {
            Some(Redirect::Truncate(path)) => {
                cmd.stdout(Stdio::from(File::create(self.resolve(path))?))
            }
            Some(Redirect::Append(path)) => cmd.stdout(Stdio::from(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.resolve(path))?,
            )),
            None => cmd.stdout(Stdio::inherit()),
        };
        cmd.stderr(Stdio::inherit());
        // New group led by the child, so a timeout can signal every descendant at once.
        cmd.process_group(0);
        Ok(cmd)
    }
}

fn shell_quote(s: &str) -> String {
    if s.is_empty() {
        "''".to_string()
    } else if s
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || "-_./:=".contains(c))
    {
        s.to_string()
    } else {
        format!("'{}'", s.replace('\'', "'\"'\"'"))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Exited with status 0.
    Completed(i32),
    TimedOut,
    /// Non-zero exit, death by signal, or a command that could not be started.
    Failed(Option<i32>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionOutcome {
    pub status: ExecutionStatus,
    pub elapsed: Duration,
    pub group_killed: bool,
}

impl ExecutionOutcome {
    pub fn completed(elapsed: Duration) -> Self {
        Self {
            status: ExecutionStatus::Completed(0),
            elapsed,
            group_killed: false,
        }
    }

    pub fn timed_out(elapsed: Duration) -> Self {
        Self {
            status: ExecutionStatus::TimedOut,
            elapsed,
            group_killed: true,
        }
    }

    pub fn failed(code: Option<i32>, elapsed: Duration) -> Self {
        Self {
            status: ExecutionStatus::Failed(code),
            elapsed,
            group_killed: false,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        self.status == ExecutionStatus::TimedOut
    }
}

/// Runs one external command to completion or deadline. Implementations never retry.
pub trait CommandRunner {
    fn run(&mut self, command: &CommandSpec, timeout: Duration) -> ExecutionOutcome;
}

/// Spawns each command as a process-group leader and kills the whole group on timeout.
#[derive(Debug, Clone)]
pub struct ProcessGroupExecutor {
    /// Time between SIGTERM and SIGKILL once the deadline has passed.
    pub kill_grace: Duration,
}

impl Default for ProcessGroupExecutor {
    fn default() -> Self {
        Self {
            kill_grace: Duration::from_secs(5),
        }
    }
}

impl CommandRunner for ProcessGroupExecutor {
    fn run(&mut self, command: &CommandSpec, timeout: Duration) -> ExecutionOutcome {
        let started = Instant::now();
        let child = match command.to_command().and_then(|mut cmd| cmd.spawn()) {
            Ok(child) => child,
            Err(err) => {
                warn!(command = %command.display(), error = %err, "command could not be started");
                return ExecutionOutcome::failed(None, started.elapsed());
            }
        };
        let pgid = child.id() as i32;
        debug!(pgid, command = %command.display(), "spawned process group");

        let (tx, rx) = mpsc::channel();
        let waiter = thread::spawn(move || {
            let mut child = child;
            let _ = tx.send(child.wait());
        });

        let outcome = match rx.recv_timeout(timeout) {
            Ok(Ok(status)) => classify_exit(status, started.elapsed()),
            Ok(Err(err)) => {
                warn!(command = %command.display(), error = %err, "failed to wait on command");
                ExecutionOutcome::failed(None, started.elapsed())
            }
            Err(RecvTimeoutError::Timeout) => {
                signal_process_group(pgid, libc::SIGTERM);
                let leader_reaped = rx.recv_timeout(self.kill_grace).is_ok();
                // An unreaped leader pins the group id. Once it is reaped, the id is
                // only safe to signal while other members still hold it.
                if !leader_reaped || process_group_exists(pgid) {
                    signal_process_group(pgid, libc::SIGKILL);
                }
                if !leader_reaped {
                    let _ = rx.recv();
                }
                warn!(
                    command = %command.display(),
                    timeout_secs = timeout.as_secs_f64(),
                    "command timed out and its process group was killed"
                );
                ExecutionOutcome::timed_out(started.elapsed())
            }
            Err(RecvTimeoutError::Disconnected) => {
                ExecutionOutcome::failed(None, started.elapsed())
            }
        };
        let _ = waiter.join();
        outcome
    }
}

fn classify_exit(status: ExitStatus, elapsed: Duration) -> ExecutionOutcome {
    match status.code() {
        Some(0) => ExecutionOutcome::completed(elapsed),
        Some(code) => ExecutionOutcome::failed(Some(code), elapsed),
        None => {
            debug!(signal = ?status.signal(), "command terminated by signal");
            ExecutionOutcome::failed(None, elapsed)
        }
    }
}

fn process_group_exists(pgid: i32) -> bool {
    let rc = unsafe { libc::killpg(pgid, 0) };
    rc == 0 || io::Error::last_os_error().raw_os_error() != Some(libc::ESRCH)
}

fn signal_process_group(pgid: i32, signal: i32) {
    let rc = unsafe { libc::killpg(pgid, signal) };
    if rc != 0 {
        let error = io::Error::last_os_error();
        if error.raw_os_error() != Some(libc::ESRCH) {
            warn!(pgid, signal, error = %error, "unable to signal process group");
        }
    }
}
