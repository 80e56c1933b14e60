//! Container and process descriptions shared by the shim service, its
//! runtimes and its clients.

use std::fmt;
use std::path::PathBuf;

/// Longest accepted container or process ID.
pub const MAX_ID_LEN: usize = 76;

/// Process ID of the container's init process. Its pid file is
/// `init.pid`, so exec'd processes may not use it.
pub const INIT_PROCESS_ID: &str = "init";

/// Container and process IDs name files and directories, so they must be a
/// single plain path component. Returns the reason an ID is rejected.
pub fn check_id(kind: &str, id: &str) -> Result<(), String> {
    if id.is_empty() {
        return Err(format!("{kind} id is required"));
    }
    if id.len() > MAX_ID_LEN {
        return Err(format!("{kind} id is longer than {MAX_ID_LEN} characters"));
    }
    if id == "." || id == ".." || id.contains('/') || id.contains('\0') {
        return Err(format!("invalid {kind} id {id:?}"));
    }
    Ok(())
}

/// [`check_id`] for exec'd processes, which also may not take the init
/// process's name.
pub fn check_process_id(id: &str) -> Result<(), String> {
    check_id("process", id)?;
    if id == INIT_PROCESS_ID {
        return Err(format!("process id {id:?} is reserved"));
    }
    Ok(())
}

/// Status of a container or an exec'd process.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Created,
    Running,
    Paused,
    Stopped,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Status::Created => "created",
            Status::Running => "running",
            Status::Paused => "paused",
            Status::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Paths the process's standard streams are attached to. Empty paths mean
/// `/dev/null`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Stdio {
    pub stdin: String,
    pub stdout: String,
    pub stderr: String,
    pub terminal: bool,
}

/// Process to run inside an existing container.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessSpec {
    pub args: Vec<String>,
    pub env: Vec<String>,
    pub cwd: String,
    pub uid: u32,
    pub gid: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateOptions {
    pub id: String,
    pub bundle: PathBuf,
    pub stdio: Stdio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecOptions {
    pub process_id: String,
    pub spec: ProcessSpec,
    pub stdio: Stdio,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessState {
    pub id: String,
    pub pid: u32,
    pub status: Status,
    pub exit_status: u32,
}

/// Snapshot of the container the shim supervises.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct State {
    pub id: String,
    pub bundle: PathBuf,
    pub status: Status,
    /// Pid of the init process.
    pub pid: u32,
    pub exit_status: u32,
    /// Exec'd processes, sorted by ID.
    pub processes: Vec<ProcessState>,
}

impl State {
    pub fn process_by_pid(&self, pid: u32) -> Option<&ProcessState> {
        self.processes.iter().find(|p| p.pid == pid)
    }
}

/// Outcome of a delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeleteResult {
    pub pid: u32,
    pub exit_status: u32,
    /// True when the container itself was removed rather than one exec'd
    /// process.
    pub container: bool,
}
