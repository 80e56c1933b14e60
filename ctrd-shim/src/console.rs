//! Terminal support.
//!
//! For a process with a terminal the OCI runtime allocates the pty itself and
//! sends the master side over a unix socket passed as `--console-socket`.
//! The shim then copies between the master and the process's stdio paths.

use log::{debug, warn};
use nix::sys::socket::{ControlMessageOwned, MsgFlags, recvmsg};
use std::fs::{File, OpenOptions};
use std::io::IoSliceMut;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::path::{Path, PathBuf};
use tokio::net::UnixListener;

use crate::error::{Error, Result};
use crate::process::Stdio;

/// Listening socket the runtime hands the pty master to. The socket file is
/// removed when this is dropped.
pub struct ConsoleSocket {
    path: PathBuf,
    listener: UnixListener,
}

impl ConsoleSocket {
    pub fn bind(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        Ok(Self { path, listener })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Wait for the runtime to connect and receive the pty master.
    pub async fn receive_master(self) -> Result<OwnedFd> {
        let (stream, _) = self.listener.accept().await?;
        let stream = stream.into_std()?;
        stream.set_nonblocking(false)?;

        tokio::task::spawn_blocking(move || receive_fd(stream.as_raw_fd()))
            .await
            .map_err(|e| Error::Internal(format!("console receiver failed: {e}")))?
    }
}

impl Drop for ConsoleSocket {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            debug!("Failed to remove {}: {e}", self.path.display());
        }
    }
}

fn receive_fd(socket: RawFd) -> Result<OwnedFd> {
    // The runtime sends the pty name along with the descriptor
    let mut name = [0u8; 4096];
    let mut iov = [IoSliceMut::new(&mut name)];
    let mut cmsg = nix::cmsg_space!([RawFd; 1]);

    let msg = recvmsg::<()>(socket, &mut iov, Some(&mut cmsg), MsgFlags::MSG_CMSG_CLOEXEC)
        .map_err(|e| Error::Runtime(format!("receiving console: {e}")))?;
    let cmsgs = msg
        .cmsgs()
        .map_err(|e| Error::Runtime(format!("receiving console: {e}")))?;

    for cmsg in cmsgs {
        if let ControlMessageOwned::ScmRights(fds) = cmsg
            && let Some(&fd) = fds.first()
        {
            // SAFETY: SCM_RIGHTS installed a fresh descriptor that nothing
            // else owns
            return Ok(unsafe { OwnedFd::from_raw_fd(fd) });
        }
    }
    Err(Error::Runtime("runtime sent no console descriptor".into()))
}

/// Copy the pty master to the stdout path and the stdin path into the
/// master until the terminal is closed. Output is discarded when no stdout
/// path is set, so the process never blocks on a full pty.
pub fn forward(master: OwnedFd, stdio: &Stdio) -> Result<()> {
    let master = File::from(master);
    let output = tokio::fs::File::from_std(master.try_clone()?);

    if stdio.stdout.is_empty() {
        tokio::spawn(async move {
            let mut output = output;
            let _ = tokio::io::copy(&mut output, &mut tokio::io::sink()).await;
        });
    } else {
        let stdout = OpenOptions::new()
            .write(true)
            .create(true)
            .append(true)
            .open(&stdio.stdout)
            .map_err(|e| Error::InvalidArgument(format!("open {}: {e}", stdio.stdout)))?;
        tokio::spawn(copy(output, tokio::fs::File::from_std(stdout), "stdout"));
    }

    if !stdio.stdin.is_empty() {
        let stdin = File::open(&stdio.stdin)
            .map_err(|e| Error::InvalidArgument(format!("open {}: {e}", stdio.stdin)))?;
        tokio::spawn(copy(
            tokio::fs::File::from_std(stdin),
            tokio::fs::File::from_std(master),
            "stdin",
        ));
    }

    Ok(())
}

async fn copy(mut from: tokio::fs::File, mut to: tokio::fs::File, stream: &'static str) {
    match tokio::io::copy(&mut from, &mut to).await {
        Ok(n) => debug!("Console {stream} closed after {n} bytes"),
        // A closed pty reads as EIO
        Err(e) if e.raw_os_error() == Some(nix::libc::EIO) => debug!("Console {stream} closed"),
        Err(e) => warn!("Console {stream} copy failed: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::pty::openpty;
    use nix::sys::socket::{ControlMessage, sendmsg};
    use std::io::{IoSlice, Write};
    use std::os::unix::net::UnixStream;
    use std::time::Duration;

    /// Connect to `path` and send `fd` the way runc does.
    fn send_console(path: &Path, fd: RawFd) {
        let stream = UnixStream::connect(path).unwrap();
        let name = b"/dev/pts/test";
        let iov = [IoSlice::new(name)];
        let fds = [fd];
        sendmsg::<()>(
            stream.as_raw_fd(),
            &iov,
            &[ControlMessage::ScmRights(&fds)],
            MsgFlags::empty(),
            None,
        )
        .unwrap();
    }

    #[tokio::test]
    async fn test_receive_master_and_forward_output() {
        let dir = tempfile::tempdir().unwrap();
        let socket = ConsoleSocket::bind(dir.path().join("init.console.sock")).unwrap();
        let socket_path = socket.path().to_path_buf();
        let receiver = tokio::spawn(socket.receive_master());

        let pty = openpty(None, None).unwrap();
        let sender_path = socket_path.clone();
        let master_fd = pty.master.as_raw_fd();
        tokio::task::spawn_blocking(move || send_console(&sender_path, master_fd))
            .await
            .unwrap();

        let master = tokio::time::timeout(Duration::from_secs(5), receiver)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!socket_path.exists());

        let stdout = dir.path().join("stdout.log");
        let stdio = Stdio {
            stdout: stdout.to_string_lossy().into_owned(),
            terminal: true,
            ..Default::default()
        };
        forward(master, &stdio).unwrap();

        let mut slave = File::from(pty.slave);
        slave.write_all(b"hello\n").unwrap();

        let mut contents = String::new();
        for _ in 0..50 {
            contents = std::fs::read_to_string(&stdout).unwrap_or_default();
            if contents.contains("hello") {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(contents.contains("hello"));
    }

    #[tokio::test]
    async fn test_connection_without_descriptor_fails() {
        let dir = tempfile::tempdir().unwrap();
        let socket = ConsoleSocket::bind(dir.path().join("p1.console.sock")).unwrap();
        let path = socket.path().to_path_buf();
        let receiver = tokio::spawn(socket.receive_master());

        tokio::task::spawn_blocking(move || {
            let mut stream = UnixStream::connect(&path).unwrap();
            stream.write_all(b"no fd here").unwrap();
        })
        .await
        .unwrap();

        let err = tokio::time::timeout(Duration::from_secs(5), receiver)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, Error::Runtime(_)));
    }
}
