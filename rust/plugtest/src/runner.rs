//! Spawning the editor under test.

use std::ffi::OsString;
use std::fmt;
use std::path::Path;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::task::JoinHandle;

use crate::config::Config;
use crate::error::HarnessError;

/// Which editor to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RunMode {
    Vim,
    Nvim,
}

impl RunMode {
    pub const ALL: [RunMode; 2] = [RunMode::Vim, RunMode::Nvim];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Vim => "vim",
            Self::Nvim => "nvim",
        }
    }

    pub fn executable(self, config: &Config) -> &Path {
        match self {
            Self::Vim => &config.vim_executable,
            Self::Nvim => &config.nvim_executable,
        }
    }

    /// Flags that start the editor with no user state, ready to run `-c` commands.
    fn base_args(self) -> &'static [&'static str] {
        match self {
            Self::Vim => &[
                "-u", "NONE", // no vimrc, plugins or defaults.vim
                "-i", "NONE", // no viminfo
                "-n", // no swap file
                "-N", // nocompatible
                "-X", // no xterm
                "-e", // Ex mode
                "-s", // silent batch mode (after -e)
                "-c", "visual", // back to Normal mode
            ],
            Self::Nvim => &["--clean", "--embed", "--headless", "-n"],
        }
    }
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown run mode '{0}' (expected 'vim' or 'nvim')")]
pub struct UnknownRunMode(pub String);

impl FromStr for RunMode {
    type Err = UnknownRunMode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "vim" => Ok(Self::Vim),
            "nvim" => Ok(Self::Nvim),
            other => Err(UnknownRunMode(other.to_owned())),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// Let the editor write to our stdout/stderr instead of capturing its output.
    pub verbose: bool,
    /// Extra environment for the child.
    pub env: Vec<(OsString, OsString)>,
}

/// The full argument vector for `mode`: fixed flags, then one `-c` per command.
pub fn build_args(mode: RunMode, commands: &[String], verbose: bool) -> Vec<String> {
    let mut args = Vec::with_capacity(commands.len() * 2 + 12);
    if verbose {
        args.push("--cmd".to_string());
        args.push("redir >> /dev/stdout".to_string());
    }
    args.extend(mode.base_args().iter().map(|s| s.to_string()));
    for command in commands {
        args.push("-c".to_string());
        args.push(command.clone());
    }
    args
}

/// Spawn the editor for `mode`.
///
/// The child is killed if the returned handle is dropped.
pub fn run(
    mode: RunMode,
    commands: &[String],
    options: &RunOptions,
    config: &Config,
) -> Result<RunnerHandle, HarnessError> {
    let program = mode.executable(config);
    let args = build_args(mode, commands, options.verbose);
    tracing::debug!(%mode, program = %program.display(), ?args, "spawning runner");

    let (stdout, stderr) = if options.verbose {
        (Stdio::inherit(), Stdio::inherit())
    } else {
        (Stdio::piped(), Stdio::piped())
    };
    let mut child = Command::new(program)
        .args(&args)
        .envs(options.env.iter().map(|(k, v)| (k, v)))
        .stdin(Stdio::piped())
        .stdout(stdout)
        .stderr(stderr)
        .kill_on_drop(true)
        .spawn()
        .map_err(|source| HarnessError::Spawn {
            mode,
            program: program.to_path_buf(),
            source,
        })?;

    let stdin = child.stdin.take();
    let capture = match (child.stdout.take(), child.stderr.take()) {
        (Some(stdout), Some(stderr)) => Some(tokio::spawn(collect_output(stdout, stderr))),
        _ => None,
    };
    tracing::debug!(%mode, pid = ?child.id(), "runner spawned");

    Ok(RunnerHandle {
        mode,
        child,
        stdin,
        capture,
        exit: None,
    })
}

/// Read both streams to the end concurrently; stdout first in the result.
async fn collect_output(
    mut stdout: impl AsyncRead + Unpin,
    mut stderr: impl AsyncRead + Unpin,
) -> String {
    let mut out = Vec::new();
    let mut err = Vec::new();
    let (r1, r2) = tokio::join!(stdout.read_to_end(&mut out), stderr.read_to_end(&mut err));
    if let Err(e) = r1.and(r2) {
        tracing::debug!(error = %e, "reading runner output failed");
    }
    out.extend_from_slice(&err);
    String::from_utf8_lossy(&out).into_owned()
}

/// How the runner ended.
#[derive(Debug, Clone)]
pub struct RunnerExit {
    pub status: ExitStatus,
    /// Captured stdout then stderr; `None` when output was inherited.
    pub output: Option<String>,
}

/// One spawned editor process.
#[derive(Debug)]
pub struct RunnerHandle {
    mode: RunMode,
    child: Child,
    stdin: Option<ChildStdin>,
    capture: Option<JoinHandle<String>>,
    exit: Option<RunnerExit>,
}

impl RunnerHandle {
    pub fn mode(&self) -> RunMode {
        self.mode
    }

    /// `None` once the process has been reaped.
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }

    /// Ask the process to terminate. Idempotent and non-blocking.
    pub fn close(&mut self) {
        self.stdin.take();
        if self.exit.is_some() {
            return;
        }
        if let Err(e) = self.child.start_kill() {
            // already exited but not yet reaped
            tracing::debug!(error = %e, "runner kill failed");
        }
    }

    /// Wait for the process to exit and collect its output.
    ///
    /// A non-zero exit is not an error here. Idempotent and cancel-safe.
    pub async fn wait_closed(&mut self) -> std::io::Result<RunnerExit> {
        if let Some(exit) = &self.exit {
            return Ok(exit.clone());
        }
        let status = self.child.wait().await?;
        self.stdin.take();
        let output = match self.capture.as_mut() {
            Some(capture) => Some(capture.await.unwrap_or_default()),
            None => None,
        };
        tracing::debug!(mode = %self.mode, %status, "runner exited");
        let exit = RunnerExit { status, output };
        self.capture = None;
        self.exit = Some(exit.clone());
        Ok(exit)
    }
}
