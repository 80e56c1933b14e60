//! Container lifecycle events.

use chrono::{DateTime, Utc};
use std::fmt;

/// Kind of lifecycle transition an [`Event`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Create,
    StartContainer,
    StartProcess,
    Exit,
    Pause,
    Resume,
    Delete,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::Create => "create",
            EventKind::StartContainer => "start-container",
            EventKind::StartProcess => "start-process",
            EventKind::Exit => "exit",
            EventKind::Pause => "pause",
            EventKind::Resume => "resume",
            EventKind::Delete => "delete",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    /// Container ID.
    pub id: String,
    pub pid: u32,
    pub kind: EventKind,
    /// Only meaningful for [`EventKind::Exit`] and [`EventKind::Delete`].
    pub exit_status: u32,
    pub timestamp: DateTime<Utc>,
}

impl Event {
    pub fn new(id: impl Into<String>, pid: u32, kind: EventKind) -> Self {
        Self {
            id: id.into(),
            pid,
            kind,
            exit_status: 0,
            timestamp: Utc::now(),
        }
    }

    pub fn with_exit_status(mut self, exit_status: u32) -> Self {
        self.exit_status = exit_status;
        self
    }
}
