// Copyright 2023 The ChromiumOS Authors
// Use of this source code is governed by a BSD-style license that can be
// found in the LICENSE file.

//! Runs the external tools the sysroot pipeline drives (emerge, bazel,
//! portageq, ...) behind the [`CommandRunner`] trait.

use itertools::Itertools;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use signal_hook::{
    consts::signal::{SIGCHLD, SIGINT, SIGTERM},
    iterator::Signals,
};
use std::{
    collections::BTreeMap,
    fmt,
    io::Read,
    os::unix::process::ExitStatusExt,
    path::PathBuf,
    process::{Child, Command, ExitStatus, Stdio},
    thread::JoinHandle,
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::instrument;

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const KILL_GRACE: Duration = Duration::from_secs(5);

/// Called right before a timed out command is terminated.
pub type PreTimeoutHook = fn();

/// Describes one invocation of an external program.
#[derive(Clone, Debug, Default)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Variables added to the inherited environment. Under sudo they are
    /// passed as `KEY=VALUE` arguments to sudo itself.
    pub extra_env: BTreeMap<String, String>,
    pub sudo: bool,
    /// Keeps the caller's environment under sudo (`sudo -E`).
    pub preserve_env: bool,
    /// Captures stdout and stderr instead of inheriting them.
    pub capture_output: bool,
    pub cwd: Option<PathBuf>,
    pub timeout: Option<Duration>,
    pub pre_timeout_hook: Option<PreTimeoutHook>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            ..Default::default()
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

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.extra_env.insert(key.into(), value.into());
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.extra_env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    pub fn sudo(mut self) -> Self {
        self.sudo = true;
        self
    }

    pub fn preserve_env(mut self) -> Self {
        self.preserve_env = true;
        self
    }

    pub fn capture_output(mut self) -> Self {
        self.capture_output = true;
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn pre_timeout_hook(mut self, hook: PreTimeoutHook) -> Self {
        self.pre_timeout_hook = Some(hook);
        self
    }

    /// Whether `arg` appears verbatim among the arguments.
    pub fn has_arg(&self, arg: &str) -> bool {
        self.args.iter().any(|a| a == arg)
    }

    /// The argv that is actually executed.
    pub fn command_line(&self) -> Vec<String> {
        if !self.sudo {
            return std::iter::once(self.program.clone())
                .chain(self.args.iter().cloned())
                .collect();
        }
        let mut argv = vec!["sudo".to_owned()];
        if self.preserve_env {
            argv.push("-E".to_owned());
        }
        argv.extend(self.extra_env.iter().map(|(k, v)| format!("{k}={v}")));
        argv.push("--".to_owned());
        argv.push(self.program.clone());
        argv.extend(self.args.iter().cloned());
        argv
    }

    fn to_command(&self) -> Command {
        let argv = self.command_line();
        let mut cmd = Command::new(&argv[0]);
        cmd.args(&argv[1..]);
        if !self.sudo {
            cmd.envs(&self.extra_env);
        }
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        if self.capture_output {
            cmd.stdout(Stdio::piped()).stderr(Stdio::piped());
        }
        cmd
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let line = self
            .command_line()
            .into_iter()
            .map(|s| shell_escape::escape(s.into()))
            .join(" ");
        f.write_str(&line)
    }
}

/// What a finished command left behind.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code following the shell convention (128 + signal number for
    /// signaled processes).
    pub code: Option<i32>,
    /// Empty unless [`CommandSpec::capture_output`] was set.
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl fmt::Display for CommandOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {code}"),
            None => f.write_str("unknown exit status"),
        }
    }
}

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("failed to run `{command}`")]
    Io {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("`{command}` failed with {output}")]
    Failed {
        command: String,
        output: CommandOutput,
    },
    #[error("`{command}` timed out after {timeout:?}")]
    TimedOut { command: String, timeout: Duration },
}

impl CommandError {
    /// The process result, when the process ran to completion.
    pub fn output(&self) -> Option<&CommandOutput> {
        match self {
            CommandError::Failed { output, .. } => Some(output),
            _ => None,
        }
    }
}

/// The seam between the orchestration logic and the external tools.
pub trait CommandRunner: Send + Sync {
    /// Runs the command to completion. A non-zero exit is an error.
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError>;

    /// Starts the command and returns without waiting for it.
    fn run_detached(&self, spec: &CommandSpec) -> Result<(), CommandError>;
}

/// Runs commands on the real system.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemRunner;

impl CommandRunner for SystemRunner {
    #[instrument(skip_all, fields(command = %spec.program))]
    fn run(&self, spec: &CommandSpec) -> Result<CommandOutput, CommandError> {
        let command = spec.to_string();
        tracing::debug!("Running {command}");
        let io_error = |source| CommandError::Io {
            command: command.clone(),
            source,
        };

        // Register the signal handler before spawning the process to ensure we don't drop any
        // signals.
        let mut signals = Signals::new([SIGCHLD, SIGINT, SIGTERM]).map_err(io_error)?;
        let mut child = spec.to_command().spawn().map_err(io_error)?;

        let stdout = child.stdout.take().map(drain);
        let stderr = child.stderr.take().map(drain);

        let deadline = spec.timeout.map(|timeout| Instant::now() + timeout);
        let status = wait_forwarding_signals(&mut child, &mut signals, deadline, spec.pre_timeout_hook)
            .map_err(io_error)?;

        let output = CommandOutput {
            code: status.as_ref().map(exit_code),
            stdout: collect(stdout),
            stderr: collect(stderr),
        };
        match status {
            None => Err(CommandError::TimedOut {
                command,
                timeout: spec.timeout.unwrap_or_default(),
            }),
            Some(status) if status.success() => Ok(output),
            Some(_) => Err(CommandError::Failed { command, output }),
        }
    }

    fn run_detached(&self, spec: &CommandSpec) -> Result<(), CommandError> {
        let mut cmd = spec.to_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let mut child = cmd.spawn().map_err(|source| CommandError::Io {
            command: spec.to_string(),
            source,
        })?;
        // Reap the child so it doesn't linger as a zombie.
        std::thread::spawn(move || child.wait());
        Ok(())
    }
}

// Waits for the child with some special signal handling:
//   - Forwards SIGTERM to the child process.
//   - Ignores SIGINT while the process is running. The terminal sends it to the whole
//     foreground process group, so the child gets it without our help.
//   - Terminates the child once `deadline` passes, after calling `hook`.
// Returns None if the child was terminated for exceeding the deadline.
fn wait_forwarding_signals(
    child: &mut Child,
    signals: &mut Signals,
    deadline: Option<Instant>,
    hook: Option<PreTimeoutHook>,
) -> std::io::Result<Option<ExitStatus>> {
    let pid = Pid::from_raw(child.id() as i32);
    loop {
        for signal in signals.pending() {
            if signal == SIGTERM {
                let _ = nix::sys::signal::kill(pid, Signal::SIGTERM);
            }
        }
        if let Some(status) = child.try_wait()? {
            return Ok(Some(status));
        }
        if deadline.is_some_and(|deadline| Instant::now() >= deadline) {
            if let Some(hook) = hook {
                hook();
            }
            terminate(child, pid)?;
            return Ok(None);
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn terminate(child: &mut Child, pid: Pid) -> std::io::Result<()> {
    let _ = nix::sys::signal::kill(pid, Signal::SIGTERM);
    let give_up = Instant::now() + KILL_GRACE;
    while Instant::now() < give_up {
        if child.try_wait()?.is_some() {
            return Ok(());
        }
        std::thread::sleep(POLL_INTERVAL);
    }
    tracing::warn!("Process {pid} ignored SIGTERM; killing it");
    child.kill()?;
    child.wait()?;
    Ok(())
}

/// Converts [`ExitStatus`] to an exit code following the POSIX shell
/// convention.
fn exit_code(status: &ExitStatus) -> i32 {
    match (status.code(), status.signal()) {
        (Some(code), _) => code,
        (None, Some(signal)) => 128 + signal,
        (None, None) => -1,
    }
}

// Pipes are drained on helper threads so a chatty child never blocks on a
// full pipe while we poll it.
fn drain<R: Read + Send + 'static>(mut pipe: R) -> JoinHandle<String> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        let _ = pipe.read_to_end(&mut buf);
        String::from_utf8_lossy(&buf).into_owned()
    })
}

fn collect(handle: Option<JoinHandle<String>>) -> String {
    handle
        .and_then(|handle| handle.join().ok())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn runs_process() -> Result<(), CommandError> {
        let output = SystemRunner.run(&CommandSpec::new("true"))?;
        assert!(output.success());
        Ok(())
    }

    #[test]
    fn failed_process_carries_exit_code() {
        let err = SystemRunner
            .run(&CommandSpec::new("sh").args(["-c", "echo oops >&2; exit 3"]).capture_output())
            .unwrap_err();
        let output = err.output().unwrap();
        assert_eq!(output.code, Some(3));
        assert_eq!(output.stderr, "oops\n");
    }

    #[test]
    fn captures_output_with_extra_env() -> Result<(), CommandError> {
        let output = SystemRunner.run(
            &CommandSpec::new("sh")
                .args(["-c", "echo \"$BOARD\""])
                .env("BOARD", "eve")
                .capture_output(),
        )?;
        assert_eq!(output.stdout, "eve\n");
        Ok(())
    }

    static HOOK_CALLED: AtomicBool = AtomicBool::new(false);

    fn record_hook() {
        HOOK_CALLED.store(true, Ordering::SeqCst);
    }

    #[test]
    fn times_out_after_calling_hook() {
        let err = SystemRunner
            .run(
                &CommandSpec::new("sleep")
                    .arg("30")
                    .timeout(Some(Duration::from_millis(200)))
                    .pre_timeout_hook(record_hook),
            )
            .unwrap_err();
        assert!(matches!(err, CommandError::TimedOut { .. }), "{err:?}");
        assert!(HOOK_CALLED.load(Ordering::SeqCst));
    }

    #[test]
    fn sudo_command_line() {
        let spec = CommandSpec::new("parallel_emerge")
            .args(["--sysroot=/build/eve", "virtual/target-os"])
            .env("PKGDIR", "/build/eve/packages")
            .sudo()
            .preserve_env();
        assert_eq!(
            spec.command_line(),
            vec![
                "sudo",
                "-E",
                "PKGDIR=/build/eve/packages",
                "--",
                "parallel_emerge",
                "--sysroot=/build/eve",
                "virtual/target-os",
            ]
        );
        assert!(spec.has_arg("virtual/target-os"));
    }

    #[test]
    fn missing_program_is_io_error() {
        let err = SystemRunner
            .run(&CommandSpec::new("/nonexistent/cros_sysroot_tool"))
            .unwrap_err();
        assert!(matches!(err, CommandError::Io { .. }), "{err:?}");
    }
}
