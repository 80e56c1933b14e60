//! OCI runtime abstraction and the runc/youki command line implementation.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitStatus, waitpid};
use nix::unistd::Pid;
use serde::Serialize;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio as ProcessStdio};
use std::time::Duration;
use tokio::process::Command;

use crate::console::{self, ConsoleSocket};
use crate::error::{Error, Result};
use crate::process::{INIT_PROCESS_ID, ProcessSpec, Stdio, check_process_id};

/// How long the runtime has to hand over a terminal after it exited.
const CONSOLE_TIMEOUT: Duration = Duration::from_secs(10);

/// Operations the shim needs from an OCI runtime.
#[async_trait]
pub trait Runtime: Send + Sync {
    /// Create the container and return the pid of its init process.
    async fn create(&self, id: &str, bundle: &Path, stdio: &Stdio) -> Result<u32>;

    async fn start(&self, id: &str) -> Result<()>;

    /// Start an additional process in the container and return its pid.
    async fn exec(&self, id: &str, process_id: &str, spec: &ProcessSpec, stdio: &Stdio)
    -> Result<u32>;

    /// Signal the container's init process, or every process with `all`.
    async fn kill(&self, id: &str, signal: u32, all: bool) -> Result<()>;

    /// Signal a single process by pid.
    async fn signal(&self, pid: u32, signal: u32) -> Result<()> {
        let signal = Signal::try_from(signal as i32)
            .map_err(|_| Error::InvalidArgument(format!("invalid signal {signal}")))?;
        kill(Pid::from_raw(pid as i32), signal)
            .map_err(|e| Error::Runtime(format!("kill {pid}: {e}")))
    }

    async fn pause(&self, id: &str) -> Result<()>;

    async fn resume(&self, id: &str) -> Result<()>;

    async fn delete(&self, id: &str) -> Result<()>;

    /// Wait for `pid` to exit and return its exit status.
    async fn wait(&self, pid: u32) -> u32;
}

/// Minimal OCI process description for `exec --process`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct OciProcess {
    terminal: bool,
    user: OciUser,
    args: Vec<String>,
    env: Vec<String>,
    cwd: String,
}

#[derive(Debug, Serialize)]
struct OciUser {
    uid: u32,
    gid: u32,
}

impl OciProcess {
    fn new(spec: &ProcessSpec, terminal: bool) -> Self {
        Self {
            terminal,
            user: OciUser {
                uid: spec.uid,
                gid: spec.gid,
            },
            args: spec.args.clone(),
            env: spec.env.clone(),
            cwd: if spec.cwd.is_empty() {
                "/".to_string()
            } else {
                spec.cwd.clone()
            },
        }
    }
}

/// Drives an OCI runtime binary (runc, youki, crun) through its CLI.
pub struct RuncRuntime {
    binary: PathBuf,
    root: Option<PathBuf>,
    work_dir: PathBuf,
}

impl RuncRuntime {
    /// `work_dir` holds pid files and process descriptions.
    pub fn new(
        binary: impl Into<PathBuf>,
        root: Option<PathBuf>,
        work_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            binary: binary.into(),
            root,
            work_dir: work_dir.into(),
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.binary);
        if let Some(root) = &self.root {
            cmd.arg("--root").arg(root);
        }
        cmd
    }

    /// Run a command that does not touch container stdio and fail with its
    /// output on a non-zero exit.
    async fn run(&self, args: &[&str]) -> Result<()> {
        info!("Executing {} {}", self.binary.display(), args.join(" "));

        let output = self
            .command()
            .args(args)
            .stdin(ProcessStdio::null())
            .stdout(ProcessStdio::piped())
            .stderr(ProcessStdio::piped())
            .output()
            .await
            .map_err(|e| self.spawn_error(e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let stdout = String::from_utf8_lossy(&output.stdout);
            let msg = format!(
                "{} {} exited with {}: stderr='{}', stdout='{}'",
                self.binary.display(),
                args.first().copied().unwrap_or_default(),
                output.status,
                stderr.trim(),
                stdout.trim()
            );
            error!("{msg}");
            return Err(Error::Runtime(msg));
        }

        Ok(())
    }

    /// Run `subcommand args..` for the process named `name`. Without a
    /// terminal the runtime's stdio is handed to the process; with one the
    /// runtime allocates a pty and sends it back over a console socket.
    async fn run_attached(
        &self,
        subcommand: &str,
        args: &[&str],
        name: &str,
        stdio: &Stdio,
    ) -> Result<()> {
        if stdio.terminal {
            return self.run_with_console(subcommand, args, name, stdio).await;
        }

        info!("Executing {} {subcommand} {}", self.binary.display(), args.join(" "));
        let status = self
            .command()
            .arg(subcommand)
            .args(args)
            .stdin(open_stdio(&stdio.stdin, true)?)
            .stdout(open_stdio(&stdio.stdout, false)?)
            .stderr(open_stdio(&stdio.stderr, false)?)
            .status()
            .await
            .map_err(|e| self.spawn_error(e))?;
        self.check_status(subcommand, status)
    }

    async fn run_with_console(
        &self,
        subcommand: &str,
        args: &[&str],
        name: &str,
        stdio: &Stdio,
    ) -> Result<()> {
        let socket = ConsoleSocket::bind(self.work_dir.join(format!("{name}.console.sock")))?;
        let socket_path = socket.path().to_string_lossy().into_owned();
        let mut receiver = tokio::spawn(socket.receive_master());

        info!(
            "Executing {} {subcommand} --console-socket {socket_path} {}",
            self.binary.display(),
            args.join(" ")
        );
        let status = self
            .command()
            .arg(subcommand)
            .arg("--console-socket")
            .arg(&socket_path)
            .args(args)
            .stdin(ProcessStdio::null())
            .stdout(ProcessStdio::null())
            .stderr(ProcessStdio::null())
            .status()
            .await
            .map_err(|e| self.spawn_error(e));

        if let Err(e) = status.and_then(|status| self.check_status(subcommand, status)) {
            receiver.abort();
            return Err(e);
        }

        let master = match tokio::time::timeout(CONSOLE_TIMEOUT, &mut receiver).await {
            Ok(received) => {
                received.map_err(|e| Error::Internal(format!("console receiver failed: {e}")))??
            }
            Err(_) => {
                receiver.abort();
                return Err(Error::Runtime(format!("no console received for {name}")));
            }
        };
        console::forward(master, stdio)
    }

    fn spawn_error(&self, e: std::io::Error) -> Error {
        Error::Runtime(format!("failed to execute {}: {e}", self.binary.display()))
    }

    fn check_status(&self, subcommand: &str, status: ExitStatus) -> Result<()> {
        if !status.success() {
            let msg = format!("{} {subcommand} exited with {status}", self.binary.display());
            error!("{msg}");
            return Err(Error::Runtime(msg));
        }
        Ok(())
    }
}

#[async_trait]
impl Runtime for RuncRuntime {
    async fn create(&self, id: &str, bundle: &Path, stdio: &Stdio) -> Result<u32> {
        let pid_file = self.work_dir.join(format!("{INIT_PROCESS_ID}.pid"));
        let bundle = bundle.to_string_lossy();
        let pid_path = pid_file.to_string_lossy();

        self.run_attached(
            "create",
            &["--bundle", &bundle, "--pid-file", &pid_path, id],
            INIT_PROCESS_ID,
            stdio,
        )
        .await?;

        read_pid(&pid_file).await
    }

    async fn start(&self, id: &str) -> Result<()> {
        self.run(&["start", id]).await
    }

    async fn exec(
        &self,
        id: &str,
        process_id: &str,
        spec: &ProcessSpec,
        stdio: &Stdio,
    ) -> Result<u32> {
        // Process IDs name files in the work dir
        check_process_id(process_id).map_err(Error::InvalidArgument)?;
        let process_file = self.work_dir.join(format!("{process_id}.json"));
        let pid_file = self.work_dir.join(format!("{process_id}.pid"));

        let json = serde_json::to_vec(&OciProcess::new(spec, stdio.terminal))
            .map_err(|e| Error::Internal(format!("encode process: {e}")))?;
        tokio::fs::write(&process_file, json).await?;

        let process_path = process_file.to_string_lossy();
        let pid_path = pid_file.to_string_lossy();
        let result = self
            .run_attached(
                "exec",
                &["--detach", "--process", &process_path, "--pid-file", &pid_path, id],
                process_id,
                stdio,
            )
            .await;

        if let Err(e) = tokio::fs::remove_file(&process_file).await {
            debug!("Failed to remove {}: {e}", process_file.display());
        }
        result?;

        read_pid(&pid_file).await
    }

    async fn kill(&self, id: &str, signal: u32, all: bool) -> Result<()> {
        let signal = signal.to_string();
        if all {
            self.run(&["kill", "--all", id, &signal]).await
        } else {
            self.run(&["kill", id, &signal]).await
        }
    }

    async fn pause(&self, id: &str) -> Result<()> {
        self.run(&["pause", id]).await
    }

    async fn resume(&self, id: &str) -> Result<()> {
        self.run(&["resume", id]).await
    }

    async fn delete(&self, id: &str) -> Result<()> {
        self.run(&["delete", "--force", id]).await
    }

    async fn wait(&self, pid: u32) -> u32 {
        wait_for_exit(pid).await
    }
}

/// Open a stdio path for a child. Empty means `/dev/null`; output paths are
/// created if missing so plain log files work as well as fifos.
fn open_stdio(path: &str, input: bool) -> Result<ProcessStdio> {
    if path.is_empty() {
        return Ok(ProcessStdio::null());
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(!input)
        .open(path)
        .map_err(|e| Error::InvalidArgument(format!("open {path}: {e}")))?;
    Ok(file.into())
}

async fn read_pid(pid_file: &Path) -> Result<u32> {
    let contents = tokio::fs::read_to_string(pid_file).await.map_err(|e| {
        Error::Runtime(format!("could not read pid file {}: {e}", pid_file.display()))
    })?;
    contents
        .trim()
        .parse::<u32>()
        .map_err(|e| Error::Runtime(format!("invalid pid in {}: {e}", pid_file.display())))
}

/// Block on `waitpid` for a child (or reparented orphan) of this process.
pub async fn wait_for_exit(pid: u32) -> u32 {
    let target = Pid::from_raw(pid as i32);

    let result = tokio::task::spawn_blocking(move || waitpid(target, None))
        .await
        .unwrap_or(Err(nix::errno::Errno::ECHILD));

    match result {
        Ok(WaitStatus::Exited(_, code)) => {
            info!("Process {pid} exited with code {code}");
            code as u32
        }
        Ok(WaitStatus::Signaled(_, signal, _)) => {
            info!("Process {pid} was terminated by signal {signal:?}");
            128 + signal as u32
        }
        Ok(status) => {
            warn!("Process {pid} ended with unexpected status: {status:?}");
            255
        }
        Err(e) => {
            error!("waitpid failed for process {pid}: {e}");
            255
        }
    }
}
