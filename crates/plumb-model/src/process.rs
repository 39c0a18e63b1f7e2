use std::{collections::BTreeMap, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::ConduitName;

/// Direction of a conduit reference, seen from the process that holds it.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PipeRole {
    /// The process reads from the conduit.
    Input,
    /// The process writes into the conduit.
    Output,
}

/// One step of a command line.
///
/// Either literal text (which may still contain `$(name)` placeholders) or an
/// explicit reference to a conduit. A `Pipe` step implicitly declares the conduit
/// as an input or output of its process and renders to that process's binding.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Arg {
    Text(String),
    Pipe { pipe: ConduitName, role: PipeRole },
}

impl Arg {
    pub fn pipe(name: impl Into<ConduitName>, role: PipeRole) -> Self {
        Arg::Pipe {
            pipe: name.into(),
            role,
        }
    }

    /// Literal text of the step, `None` for conduit references.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Arg::Text(text) => Some(text),
            Arg::Pipe { .. } => None,
        }
    }
}

impl From<&str> for Arg {
    fn from(s: &str) -> Self {
        Arg::Text(s.to_string())
    }
}

impl From<String> for Arg {
    fn from(s: String) -> Self {
        Arg::Text(s)
    }
}

/// Redirection target of a standard stream.
///
/// Written in documents as `{pipe: <name>}` or `{file: <path>}`.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawRedirect", into = "RawRedirect")]
pub enum Redirect {
    /// Bind the stream to a named conduit.
    Pipe(ConduitName),
    /// Bind the stream to a plain file.
    File(PathBuf),
}

impl Redirect {
    pub fn pipe(name: impl Into<ConduitName>) -> Self {
        Redirect::Pipe(name.into())
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Redirect::File(path.into())
    }

    pub fn as_pipe(&self) -> Option<&str> {
        match self {
            Redirect::Pipe(name) => Some(name),
            Redirect::File(_) => None,
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawRedirect {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pipe: Option<ConduitName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    file: Option<PathBuf>,
}

impl TryFrom<RawRedirect> for Redirect {
    type Error = String;

    fn try_from(raw: RawRedirect) -> Result<Self, Self::Error> {
        match (raw.pipe, raw.file) {
            (Some(pipe), None) => Ok(Redirect::Pipe(pipe)),
            (None, Some(file)) => Ok(Redirect::File(file)),
            (Some(_), Some(_)) => Err("redirect must set either `pipe` or `file`, not both".into()),
            (None, None) => Err("redirect must set `pipe` or `file`".into()),
        }
    }
}

impl From<Redirect> for RawRedirect {
    fn from(r: Redirect) -> Self {
        match r {
            Redirect::Pipe(pipe) => RawRedirect {
                pipe: Some(pipe),
                file: None,
            },
            Redirect::File(file) => RawRedirect {
                pipe: None,
                file: Some(file),
            },
        }
    }
}

/// One external command of a batch.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct ProcessSpec {
    /// Optional label used in logs and reports.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Argument template; the first rendered element is the program.
    pub args: Vec<Arg>,
    /// Conduits this process writes through a FIFO path argument.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub outputs: Vec<ConduitName>,
    /// Conduits this process reads through a FIFO path argument.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub inputs: Vec<ConduitName>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<Redirect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdout: Option<Redirect>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stderr: Option<Redirect>,
    /// Extra environment variables for the child.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    /// Working directory of the child; relative redirect files resolve against it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,
}

impl ProcessSpec {
    pub fn new<I, A>(args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<Arg>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
            ..Default::default()
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_output(mut self, name: impl Into<ConduitName>) -> Self {
        self.outputs.push(name.into());
        self
    }

    pub fn with_input(mut self, name: impl Into<ConduitName>) -> Self {
        self.inputs.push(name.into());
        self
    }

    pub fn with_stdin(mut self, redirect: Redirect) -> Self {
        self.stdin = Some(redirect);
        self
    }

    pub fn with_stdout(mut self, redirect: Redirect) -> Self {
        self.stdout = Some(redirect);
        self
    }

    pub fn with_stderr(mut self, redirect: Redirect) -> Self {
        self.stderr = Some(redirect);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<PathBuf>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }

    /// Conduits produced through FIFO paths: explicit `outputs` first, then
    /// output `Pipe` args, without repeats.
    pub fn declared_outputs(&self) -> Vec<&str> {
        self.declared(&self.outputs, PipeRole::Output)
    }

    /// Conduits consumed through FIFO paths: explicit `inputs` first, then
    /// input `Pipe` args, without repeats.
    pub fn declared_inputs(&self) -> Vec<&str> {
        self.declared(&self.inputs, PipeRole::Input)
    }

    fn declared<'a>(&'a self, explicit: &'a [ConduitName], want: PipeRole) -> Vec<&'a str> {
        let implicit = self.args.iter().filter_map(|arg| match arg {
            Arg::Pipe { pipe, role } if *role == want => Some(pipe.as_str()),
            _ => None,
        });

        let mut out: Vec<&str> = Vec::new();
        for name in explicit.iter().map(String::as_str).chain(implicit) {
            if !out.contains(&name) {
                out.push(name);
            }
        }
        out
    }

    /// Human readable label: `name`, else the first literal arg, else `process-<index>`.
    pub fn label(&self, index: usize) -> String {
        if let Some(name) = &self.name {
            return name.clone();
        }
        match self.args.first().and_then(Arg::as_text) {
            Some(program) if !program.is_empty() => program.to_string(),
            _ => format!("process-{index}"),
        }
    }
}
