use serde::{Deserialize, Serialize};

/// Terminal state of one process of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ProcessStatus {
    /// The command could not be started.
    NotStarted,
    /// Exited with code 0.
    Succeeded,
    /// Exited with a nonzero code.
    Failed,
    /// Terminated by a signal, including batch aborts.
    Killed,
}

impl ProcessStatus {
    /// Classify a wait result: `Some(code)` for a normal exit, `None` for a signal.
    pub fn from_exit_code(code: Option<i32>) -> Self {
        match code {
            Some(0) => ProcessStatus::Succeeded,
            Some(_) => ProcessStatus::Failed,
            None => ProcessStatus::Killed,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ProcessStatus::Succeeded)
    }
}

/// Completion record of one process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessReport {
    /// Position of the process in the batch.
    pub index: usize,
    pub label: String,
    /// Argument list after placeholder substitution.
    pub args: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    pub status: ProcessStatus,
}

/// Per-process completion report of a whole batch, in batch order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub processes: Vec<ProcessReport>,
}

impl BatchReport {
    pub fn new(mut processes: Vec<ProcessReport>) -> Self {
        processes.sort_by_key(|p| p.index);
        Self { processes }
    }

    /// `true` when every process exited with code 0.
    pub fn success(&self) -> bool {
        self.processes.iter().all(|p| p.status.is_success())
    }

    pub fn failed(&self) -> impl Iterator<Item = &ProcessReport> {
        self.processes.iter().filter(|p| !p.status.is_success())
    }

    pub fn exit_codes(&self) -> Vec<Option<i32>> {
        self.processes.iter().map(|p| p.exit_code).collect()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }
}
