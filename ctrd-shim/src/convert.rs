//! Conversions between the wire types in [`crate::proto`] and the shim's
//! own types. Used by the gRPC server here and by remote clients.

use chrono::DateTime;
use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::event::{Event, EventKind};
use crate::process::{
    CreateOptions, DeleteResult, ExecOptions, ProcessSpec, ProcessState, State, Status, Stdio,
};
use crate::proto;

impl From<Stdio> for proto::Stdio {
    fn from(s: Stdio) -> Self {
        Self {
            stdin: s.stdin,
            stdout: s.stdout,
            stderr: s.stderr,
            terminal: s.terminal,
        }
    }
}

impl From<proto::Stdio> for Stdio {
    fn from(s: proto::Stdio) -> Self {
        Self {
            stdin: s.stdin,
            stdout: s.stdout,
            stderr: s.stderr,
            terminal: s.terminal,
        }
    }
}

impl From<ProcessSpec> for proto::ProcessSpec {
    fn from(s: ProcessSpec) -> Self {
        Self {
            args: s.args,
            env: s.env,
            cwd: s.cwd,
            uid: s.uid,
            gid: s.gid,
        }
    }
}

impl From<proto::ProcessSpec> for ProcessSpec {
    fn from(s: proto::ProcessSpec) -> Self {
        Self {
            args: s.args,
            env: s.env,
            cwd: s.cwd,
            uid: s.uid,
            gid: s.gid,
        }
    }
}

impl From<CreateOptions> for proto::CreateRequest {
    fn from(opts: CreateOptions) -> Self {
        Self {
            id: opts.id,
            bundle: opts.bundle.to_string_lossy().into_owned(),
            stdio: Some(opts.stdio.into()),
        }
    }
}

impl From<proto::CreateRequest> for CreateOptions {
    fn from(req: proto::CreateRequest) -> Self {
        Self {
            id: req.id,
            bundle: PathBuf::from(req.bundle),
            stdio: req.stdio.map(Into::into).unwrap_or_default(),
        }
    }
}

impl From<ExecOptions> for proto::ExecRequest {
    fn from(opts: ExecOptions) -> Self {
        Self {
            process_id: opts.process_id,
            spec: Some(opts.spec.into()),
            stdio: Some(opts.stdio.into()),
        }
    }
}

impl TryFrom<proto::ExecRequest> for ExecOptions {
    type Error = Error;

    fn try_from(req: proto::ExecRequest) -> Result<Self> {
        let spec = req
            .spec
            .ok_or_else(|| Error::InvalidArgument("process spec is required".into()))?;
        Ok(Self {
            process_id: req.process_id,
            spec: spec.into(),
            stdio: req.stdio.map(Into::into).unwrap_or_default(),
        })
    }
}

impl From<Status> for proto::ContainerStatus {
    fn from(s: Status) -> Self {
        match s {
            Status::Created => proto::ContainerStatus::Created,
            Status::Running => proto::ContainerStatus::Running,
            Status::Paused => proto::ContainerStatus::Paused,
            Status::Stopped => proto::ContainerStatus::Stopped,
        }
    }
}

/// Decode a wire status. Unknown values are rejected rather than guessed.
pub fn status_from_proto(value: i32) -> Result<Status> {
    match proto::ContainerStatus::try_from(value) {
        Ok(proto::ContainerStatus::Created) => Ok(Status::Created),
        Ok(proto::ContainerStatus::Running) => Ok(Status::Running),
        Ok(proto::ContainerStatus::Paused) => Ok(Status::Paused),
        Ok(proto::ContainerStatus::Stopped) => Ok(Status::Stopped),
        _ => Err(Error::Internal(format!("unknown container status {value}"))),
    }
}

impl From<ProcessState> for proto::ProcessState {
    fn from(p: ProcessState) -> Self {
        Self {
            id: p.id,
            pid: p.pid,
            status: proto::ContainerStatus::from(p.status) as i32,
            exit_status: p.exit_status,
        }
    }
}

impl From<State> for proto::StateResponse {
    fn from(s: State) -> Self {
        Self {
            id: s.id,
            bundle: s.bundle.to_string_lossy().into_owned(),
            status: proto::ContainerStatus::from(s.status) as i32,
            pid: s.pid,
            exit_status: s.exit_status,
            processes: s.processes.into_iter().map(Into::into).collect(),
        }
    }
}

impl TryFrom<proto::StateResponse> for State {
    type Error = Error;

    fn try_from(resp: proto::StateResponse) -> Result<Self> {
        let processes = resp
            .processes
            .into_iter()
            .map(|p| {
                Ok(ProcessState {
                    status: status_from_proto(p.status)?,
                    id: p.id,
                    pid: p.pid,
                    exit_status: p.exit_status,
                })
            })
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            status: status_from_proto(resp.status)?,
            id: resp.id,
            bundle: PathBuf::from(resp.bundle),
            pid: resp.pid,
            exit_status: resp.exit_status,
            processes,
        })
    }
}

impl From<DeleteResult> for proto::DeleteResponse {
    fn from(r: DeleteResult) -> Self {
        Self {
            pid: r.pid,
            exit_status: r.exit_status,
            container: r.container,
        }
    }
}

impl From<proto::DeleteResponse> for DeleteResult {
    fn from(r: proto::DeleteResponse) -> Self {
        Self {
            pid: r.pid,
            exit_status: r.exit_status,
            container: r.container,
        }
    }
}

impl From<EventKind> for proto::EventType {
    fn from(kind: EventKind) -> Self {
        match kind {
            EventKind::Create => proto::EventType::Create,
            EventKind::StartContainer => proto::EventType::StartContainer,
            EventKind::StartProcess => proto::EventType::StartProcess,
            EventKind::Exit => proto::EventType::Exit,
            EventKind::Pause => proto::EventType::Pause,
            EventKind::Resume => proto::EventType::Resume,
            EventKind::Delete => proto::EventType::Delete,
        }
    }
}

impl From<Event> for proto::Event {
    fn from(e: Event) -> Self {
        Self {
            id: e.id,
            pid: e.pid,
            r#type: proto::EventType::from(e.kind) as i32,
            exit_status: e.exit_status,
            timestamp_ns: e.timestamp.timestamp_nanos_opt().unwrap_or_default(),
        }
    }
}

impl TryFrom<proto::Event> for Event {
    type Error = Error;

    fn try_from(e: proto::Event) -> Result<Self> {
        let kind = match proto::EventType::try_from(e.r#type) {
            Ok(proto::EventType::Create) => EventKind::Create,
            Ok(proto::EventType::StartContainer) => EventKind::StartContainer,
            Ok(proto::EventType::StartProcess) => EventKind::StartProcess,
            Ok(proto::EventType::Exit) => EventKind::Exit,
            Ok(proto::EventType::Pause) => EventKind::Pause,
            Ok(proto::EventType::Resume) => EventKind::Resume,
            Ok(proto::EventType::Delete) => EventKind::Delete,
            _ => return Err(Error::Internal(format!("unknown event type {}", e.r#type))),
        };
        Ok(Self {
            id: e.id,
            pid: e.pid,
            kind,
            exit_status: e.exit_status,
            timestamp: DateTime::from_timestamp_nanos(e.timestamp_ns),
        })
    }
}
