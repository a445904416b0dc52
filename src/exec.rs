//! External process execution.
//!
//! Every child gets its search path and working directory passed
//! explicitly; the environment and cwd of this process are never changed.

use std::env;
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::config::Config;
use crate::tree::SourceTree;

const POLL_INTERVAL: Duration = Duration::from_millis(50);

// ---------------------------------------------------------------------------
// Search path
// ---------------------------------------------------------------------------

/// Directories searched for host tools, in order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostTools {
    search_path: Vec<PathBuf>,
}

impl HostTools {
    /// Search path made of the inherited `PATH` followed by `extra`.
    pub fn new(extra: impl IntoIterator<Item = PathBuf>) -> Self {
        let mut search_path: Vec<PathBuf> = env::var_os("PATH")
            .map(|p| env::split_paths(&p).collect())
            .unwrap_or_default();
        search_path.extend(extra);
        Self { search_path }
    }

    /// Search path for a tree: the configured directories plus the tree's
    /// host output directory, where freshly built helpers land.
    pub fn for_tree(config: &Config, tree: &dyn SourceTree) -> Self {
        let mut extra = config.host_tool_paths.clone();
        extra.push(tree.root().join(&config.host_out_dir));
        Self::new(extra)
    }

    /// Search path made of exactly `dirs`, ignoring the inherited `PATH`.
    pub fn isolated(dirs: impl IntoIterator<Item = PathBuf>) -> Self {
        Self {
            search_path: dirs.into_iter().collect(),
        }
    }

    /// Value for the `PATH` variable of child processes.
    pub fn path_var(&self) -> OsString {
        env::join_paths(&self.search_path).unwrap_or_else(|e| {
            warn!("search path not representable, children inherit PATH: {e}");
            env::var_os("PATH").unwrap_or_default()
        })
    }

    /// First executable file called `name` on the search path.
    pub fn find(&self, name: &str) -> Option<PathBuf> {
        self.search_path
            .iter()
            .map(|dir| dir.join(name))
            .find(|candidate| is_executable(candidate))
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

// ---------------------------------------------------------------------------
// Commands
// ---------------------------------------------------------------------------

/// How a finished command ended.
#[derive(Debug)]
pub enum Completion {
    Exited(ExitStatus),
    TimedOut,
}

/// A single external invocation.
pub struct ToolCommand {
    program: OsString,
    args: Vec<OsString>,
    path_var: OsString,
    cwd: Option<PathBuf>,
}

impl ToolCommand {
    pub fn new(program: impl AsRef<OsStr>, host_tools: &HostTools) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            path_var: host_tools.path_var(),
            cwd: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Run the child in `dir` instead of the current directory.
    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.cwd = Some(dir.as_ref().to_path_buf());
        self
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).env("PATH", &self.path_var);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    /// Run to completion with inherited stdio.
    pub fn status(&self) -> std::io::Result<ExitStatus> {
        debug!("running: {self}");
        self.command().status()
    }

    /// Run to completion capturing stdout and stderr.
    pub fn output(&self) -> std::io::Result<Output> {
        debug!("running: {self}");
        self.command().stdin(Stdio::null()).output()
    }

    /// Run with inherited stdio, killing the child once `timeout` elapses.
    pub fn status_with_timeout(&self, timeout: Duration) -> std::io::Result<Completion> {
        debug!("running (timeout {}s): {self}", timeout.as_secs());
        let mut child = self.command().stdin(Stdio::null()).spawn()?;
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                return Ok(Completion::Exited(status));
            }
            if Instant::now() >= deadline {
                if let Err(e) = child.kill() {
                    warn!("failed to kill {:?} ({}): {e}", self.program, child.id());
                }
                child.wait()?;
                return Ok(Completion::TimedOut);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.to_string_lossy())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// Short description of a failed exit status, including captured stderr.
pub fn describe_failure(status: ExitStatus, stderr: &[u8]) -> String {
    let stderr = String::from_utf8_lossy(stderr);
    let stderr = stderr.trim();
    if stderr.is_empty() {
        format!("exited with {status}")
    } else {
        format!("exited with {status}: {stderr}")
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
