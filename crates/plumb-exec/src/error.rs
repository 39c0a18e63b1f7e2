use std::{fmt, io, path::PathBuf};

use thiserror::Error;

/// Problems in the batch description, detected before any process is spawned.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("conduit `{name}` already has a producer")]
    DuplicateConduit { name: String },
    #[error("process `{process}` reads unknown conduit `{name}`")]
    UnknownConduit { name: String, process: String },
    #[error("process `{process}` both produces and consumes conduit `{name}`")]
    SelfFeed { name: String, process: String },
    #[error("unclosed `$(` in argument `{template}`")]
    MalformedTemplate { template: String },
    #[error("placeholder `$({name})` has no binding")]
    UnresolvedPlaceholder { name: String },
    #[error("process #{index} has an empty command line")]
    EmptyCommand { index: usize },
}

/// Relay phase that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayStage {
    Open,
    Read,
    Write,
}

impl fmt::Display for RelayStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RelayStage::Open => "open",
            RelayStage::Read => "read",
            RelayStage::Write => "write",
        })
    }
}

#[derive(Error, Debug)]
#[error("relay for conduit `{conduit}` failed to {stage}")]
pub struct RelayError {
    pub conduit: String,
    pub stage: RelayStage,
    #[source]
    pub source: io::Error,
}

impl RelayError {
    pub fn new(conduit: impl Into<String>, stage: RelayStage, source: io::Error) -> Self {
        Self {
            conduit: conduit.into(),
            stage,
            source,
        }
    }
}

#[derive(Error, Debug)]
pub enum ExecError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("fifo {path}")]
    Fifo {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("spawn `{process}` failed")]
    Spawn {
        process: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error("wait for `{process}` failed")]
    Wait {
        process: String,
        #[source]
        source: io::Error,
    },
}

impl ExecError {
    /// `true` for errors raised before launch.
    pub fn is_config(&self) -> bool {
        matches!(self, ExecError::Config(_))
    }
}

pub type ExecResult<T> = Result<T, ExecError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn cause_is_chained_not_repeated() {
        let err: ExecError = RelayError::new(
            "x",
            RelayStage::Write,
            io::Error::new(io::ErrorKind::BrokenPipe, "reader went away"),
        )
        .into();

        assert_eq!(err.to_string(), "relay for conduit `x` failed to write");
        assert_eq!(err.source().map(ToString::to_string).as_deref(), Some("reader went away"));
    }

    #[test]
    fn spawn_error_keeps_its_cause() {
        let err = ExecError::Spawn {
            process: "tool".into(),
            source: io::Error::new(io::ErrorKind::NotFound, "no such file"),
        };
        assert_eq!(err.to_string(), "spawn `tool` failed");
        assert!(err.source().is_some());
        assert!(!err.is_config());
    }
}
