use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Local};
use clap::{Args, Parser, Subcommand};
use hyper_util::rt::TokioIo;
use nix::sys::signal::Signal;
use serde::Serialize;
use tabled::{Table, Tabled};
use tokio::net::UnixStream;
use tokio_stream::StreamExt;
use tonic::transport::{Channel, Endpoint, Uri};
use tower::service_fn;

pub mod proto {
    tonic::include_proto!("ctrd.execution");
}

use proto::execution_service_client::ExecutionServiceClient;
use proto::*;

#[derive(Parser)]
#[command(name = "ctr")]
#[command(about = "CLI for the ctrd container supervisor", long_about = None)]
struct Cli {
    /// ctrd socket
    #[arg(long, default_value = "/run/ctrd/ctrd.sock")]
    address: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct StdioArgs {
    /// File or fifo to use as stdin
    #[arg(long, default_value = "")]
    stdin: String,

    /// File or fifo to use as stdout
    #[arg(long, default_value = "")]
    stdout: String,

    /// File or fifo to use as stderr
    #[arg(long, default_value = "")]
    stderr: String,

    /// Allocate a terminal
    #[arg(short, long)]
    tty: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a container to completion and exit with its status
    Run {
        /// Container ID
        id: String,

        /// Path to the OCI bundle
        bundle: PathBuf,

        #[command(flatten)]
        stdio: StdioArgs,
    },

    /// Create a container without starting it
    Create {
        /// Container ID
        id: String,

        /// Path to the OCI bundle
        bundle: PathBuf,

        #[command(flatten)]
        stdio: StdioArgs,
    },

    /// Start a created container
    Start {
        /// Container ID
        id: String,
    },

    /// Run an additional process in a running container
    Exec {
        /// Container ID
        id: String,

        /// Process ID (generated if omitted)
        #[arg(long)]
        process_id: Option<String>,

        /// Working directory
        #[arg(long, default_value = "/")]
        cwd: String,

        /// Environment variable (KEY=VALUE), may be repeated
        #[arg(short, long)]
        env: Vec<String>,

        #[arg(long, default_value = "0")]
        uid: u32,

        #[arg(long, default_value = "0")]
        gid: u32,

        #[command(flatten)]
        stdio: StdioArgs,

        /// Command and arguments
        #[arg(trailing_var_arg = true, required = true)]
        args: Vec<String>,
    },

    /// Send a signal to a container or process
    Kill {
        /// Container ID
        id: String,

        /// Process pid (0 for the init process)
        #[arg(long, default_value = "0")]
        pid: u32,

        /// Signal name or number
        #[arg(short, long, default_value = "SIGTERM")]
        signal: String,

        /// Signal every process in the container
        #[arg(short, long)]
        all: bool,
    },

    /// Delete a container, or a process with --pid
    Delete {
        /// Container ID
        id: String,

        /// Exec'd process pid (0 deletes the container)
        #[arg(long, default_value = "0")]
        pid: u32,
    },

    /// List containers
    List,

    /// Show container details as JSON
    Info {
        /// Container ID
        id: String,
    },

    /// Pause a running container
    Pause {
        /// Container ID
        id: String,
    },

    /// Resume a paused container
    Resume {
        /// Container ID
        id: String,
    },

    /// Stream lifecycle events as JSON lines until interrupted
    Events,
}

#[derive(Tabled)]
struct ContainerRow {
    #[tabled(rename = "ID")]
    id: String,
    #[tabled(rename = "PID")]
    pid: u32,
    #[tabled(rename = "STATUS")]
    status: String,
    #[tabled(rename = "PROCESSES")]
    processes: usize,
    #[tabled(rename = "BUNDLE")]
    bundle: String,
}

impl From<Container> for ContainerRow {
    fn from(c: Container) -> Self {
        Self {
            status: format_status(c.status()),
            processes: c.processes.len(),
            id: c.id,
            pid: c.pid,
            bundle: c.bundle_path,
        }
    }
}

#[derive(Serialize)]
struct ProcessInfo {
    id: String,
    pid: u32,
    status: String,
    exit_status: u32,
}

#[derive(Serialize)]
struct ContainerInfo {
    id: String,
    bundle: String,
    status: String,
    pid: u32,
    processes: Vec<ProcessInfo>,
}

impl From<Container> for ContainerInfo {
    fn from(c: Container) -> Self {
        Self {
            status: format_status(c.status()),
            processes: c
                .processes
                .into_iter()
                .map(|p| ProcessInfo {
                    status: format_status(p.status()),
                    id: p.id,
                    pid: p.pid,
                    exit_status: p.exit_status,
                })
                .collect(),
            id: c.id,
            bundle: c.bundle_path,
            pid: c.pid,
        }
    }
}

#[derive(Serialize)]
struct EventLine {
    timestamp: String,
    #[serde(rename = "type")]
    kind: &'static str,
    id: String,
    pid: u32,
    exit_status: u32,
}

impl From<Event> for EventLine {
    fn from(e: Event) -> Self {
        let time: DateTime<Local> = DateTime::from_timestamp_nanos(e.timestamp_ns).into();
        Self {
            timestamp: time.to_rfc3339(),
            kind: format_event_type(e.r#type()),
            id: e.id,
            pid: e.pid,
            exit_status: e.exit_status,
        }
    }
}

fn format_status(status: ContainerStatus) -> String {
    match status {
        ContainerStatus::Unspecified => "unknown".to_string(),
        ContainerStatus::Created => "created".to_string(),
        ContainerStatus::Running => "running".to_string(),
        ContainerStatus::Paused => "paused".to_string(),
        ContainerStatus::Stopped => "stopped".to_string(),
    }
}

fn format_event_type(kind: EventType) -> &'static str {
    match kind {
        EventType::Unspecified => "unknown",
        EventType::Create => "create",
        EventType::StartContainer => "start-container",
        EventType::StartProcess => "start-process",
        EventType::Exit => "exit",
        EventType::Pause => "pause",
        EventType::Resume => "resume",
        EventType::Delete => "delete",
    }
}

/// Accepts `9`, `KILL` or `SIGKILL`.
fn parse_signal(s: &str) -> Result<u32, String> {
    if let Ok(n) = s.parse::<u32>() {
        return Ok(n);
    }
    let name = s.to_uppercase();
    let name = if name.starts_with("SIG") {
        name
    } else {
        format!("SIG{name}")
    };
    Signal::from_str(&name)
        .map(|sig| sig as i32 as u32)
        .map_err(|_| format!("unknown signal '{s}'"))
}

async fn connect(
    socket: &Path,
) -> Result<ExecutionServiceClient<Channel>, Box<dyn std::error::Error>> {
    let path = socket.to_path_buf();
    // The URI is ignored, the connector dials the socket
    let channel = Endpoint::from_static("http://[::]:50051")
        .connect_with_connector(service_fn(move |_: Uri| {
            let path = path.clone();
            async move { Ok::<_, std::io::Error>(TokioIo::new(UnixStream::connect(path).await?)) }
        }))
        .await
        .map_err(|e| format!("Cannot connect to ctrd at {}: {e}", socket.display()))?;
    Ok(ExecutionServiceClient::new(channel))
}

fn create_request(id: String, bundle: PathBuf, stdio: StdioArgs) -> CreateContainerRequest {
    CreateContainerRequest {
        id,
        bundle_path: bundle.to_string_lossy().into_owned(),
        stdin: stdio.stdin,
        stdout: stdio.stdout,
        stderr: stdio.stderr,
        console: stdio.tty,
    }
}

/// Create and start a container, wait for its init process to exit, then
/// delete it. Returns the exit status.
async fn run_container(
    client: &mut ExecutionServiceClient<Channel>,
    id: String,
    bundle: PathBuf,
    stdio: StdioArgs,
) -> Result<u32, Box<dyn std::error::Error>> {
    // Subscribe first so the exit cannot be missed
    let mut events = client.events(EventsRequest {}).await?.into_inner();

    let response = client
        .create(create_request(id.clone(), bundle, stdio))
        .await?
        .into_inner();
    let pid = response.container.map(|c| c.pid).unwrap_or_default();
    client.start(StartContainerRequest { id: id.clone() }).await?;

    let mut status = None;
    while let Some(event) = events.next().await {
        let event = event?;
        if event.id == id && event.pid == pid && event.r#type() == EventType::Exit {
            status = Some(event.exit_status);
            break;
        }
    }
    let status = status.ok_or("event stream closed before the container exited")?;

    client
        .delete(DeleteContainerRequest { id, pid: 0 })
        .await?;
    Ok(status)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let mut client = match connect(&cli.address).await {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    match cli.command {
        Commands::Run { id, bundle, stdio } => {
            let status = run_container(&mut client, id, bundle, stdio).await?;
            std::process::exit(status as i32);
        }

        Commands::Create { id, bundle, stdio } => {
            let response = client
                .create(create_request(id.clone(), bundle, stdio))
                .await?
                .into_inner();
            let pid = response.container.map(|c| c.pid).unwrap_or_default();
            println!("Created container: {} (pid {})", id, pid);
        }

        Commands::Start { id } => {
            client.start(StartContainerRequest { id: id.clone() }).await?;
            println!("Started container: {}", id);
        }

        Commands::Exec {
            id,
            process_id,
            cwd,
            env,
            uid,
            gid,
            stdio,
            args,
        } => {
            let process_id = process_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let response = client
                .exec(ExecProcessRequest {
                    id,
                    process_id,
                    spec: Some(ProcessSpec {
                        args,
                        env,
                        cwd,
                        uid,
                        gid,
                    }),
                    stdin: stdio.stdin,
                    stdout: stdio.stdout,
                    stderr: stdio.stderr,
                    terminal: stdio.tty,
                })
                .await?
                .into_inner();
            let process = response.process.unwrap_or_default();
            println!("Started process: {} (pid {})", process.id, process.pid);
        }

        Commands::Kill {
            id,
            pid,
            signal,
            all,
        } => {
            let signal = parse_signal(&signal)?;
            client
                .kill(KillRequest {
                    id: id.clone(),
                    pid,
                    signal,
                    all,
                })
                .await?;
            println!("Sent signal {} to {}", signal, id);
        }

        Commands::Delete { id, pid } => {
            let response = client
                .delete(DeleteContainerRequest { id: id.clone(), pid })
                .await?
                .into_inner();
            if pid == 0 {
                println!(
                    "Deleted container: {} (exit status {})",
                    id, response.exit_status
                );
            } else {
                println!(
                    "Deleted process {} in {} (exit status {})",
                    response.pid, id, response.exit_status
                );
            }
        }

        Commands::List => {
            let response = client
                .list(ListContainersRequest { owner: vec![] })
                .await?;
            let containers = response.into_inner().containers;

            if containers.is_empty() {
                println!("No containers found");
            } else {
                let rows: Vec<ContainerRow> =
                    containers.into_iter().map(ContainerRow::from).collect();
                println!("{}", Table::new(rows));
            }
        }

        Commands::Info { id } => {
            let response = client.get(GetContainerRequest { id }).await?;
            let container = response.into_inner().container.unwrap_or_default();
            let info = ContainerInfo::from(container);
            println!("{}", serde_json::to_string_pretty(&info)?);
        }

        Commands::Pause { id } => {
            client
                .pause(PauseContainerRequest { id: id.clone() })
                .await?;
            println!("Paused container: {}", id);
        }

        Commands::Resume { id } => {
            client
                .resume(ResumeContainerRequest { id: id.clone() })
                .await?;
            println!("Resumed container: {}", id);
        }

        Commands::Events => {
            let mut stream = client.events(EventsRequest {}).await?.into_inner();
            while let Some(event) = stream.next().await {
                let line = EventLine::from(event?);
                println!("{}", serde_json::to_string(&line)?);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_signal() {
        assert_eq!(parse_signal("9"), Ok(9));
        assert_eq!(parse_signal("KILL"), Ok(9));
        assert_eq!(parse_signal("sigterm"), Ok(15));
        assert!(parse_signal("BOGUS").is_err());
    }

    #[test]
    fn test_container_info_json() {
        let info = ContainerInfo::from(Container {
            id: "c1".into(),
            bundle_path: "/bundles/c1".into(),
            status: ContainerStatus::Paused as i32,
            pid: 42,
            processes: vec![Process {
                id: "p1".into(),
                pid: 43,
                status: ContainerStatus::Stopped as i32,
                exit_status: 1,
            }],
        });
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["status"], "paused");
        assert_eq!(json["processes"][0]["exit_status"], 1);
    }

    #[test]
    fn test_event_line_json() {
        let line = EventLine::from(Event {
            id: "c1".into(),
            pid: 7,
            r#type: EventType::StartProcess as i32,
            exit_status: 0,
            timestamp_ns: 1_700_000_000_000_000_000,
        });
        let json = serde_json::to_value(&line).unwrap();
        assert_eq!(json["type"], "start-process");
        assert_eq!(json["pid"], 7);
    }

    #[test]
    fn test_container_row() {
        let row = ContainerRow::from(Container {
            id: "c1".into(),
            bundle_path: "/bundles/c1".into(),
            status: ContainerStatus::Running as i32,
            pid: 42,
            processes: vec![Process::default()],
        });
        assert_eq!(row.status, "running");
        assert_eq!(row.processes, 1);
    }
}
