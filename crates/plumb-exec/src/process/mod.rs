//! One external command of a batch, from preparation to completion.
//!
//! ```text
//! Created ──prepare──▶ Prepared ──execute──▶ Running ──wait──▶ Completed(code)
//! ```
//!
//! Preparation needs the frozen registry (placeholder bindings and relay
//! ownership) and is the last point where a [`ConfigError`] can occur.
mod wiring;
pub use wiring::{Handoff, Wiring, wire};

use std::{
    fmt,
    fs::File,
    io,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use plumb_model::{Arg, ProcessReport, ProcessSpec, ProcessStatus, Redirect};
use tokio::{process::Command, sync::mpsc};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, info_span, trace, warn};

use crate::{
    conduit::release_fifo,
    error::{ConfigError, ExecError},
    relay::{BoxReader, BoxWriter},
    template::{Bindings, substitute},
    util::kill_graceful,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Created,
    Prepared,
    Running,
    Completed(Option<i32>),
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessState::Created => f.write_str("created"),
            ProcessState::Prepared => f.write_str("prepared"),
            ProcessState::Running => f.write_str("running"),
            ProcessState::Completed(Some(code)) => write!(f, "completed({code})"),
            ProcessState::Completed(None) => f.write_str("completed(signal)"),
        }
    }
}

/// Message sent by process and relay tasks to the orchestrator.
#[derive(Debug)]
pub enum Event {
    /// Exactly one per process.
    Completed(ProcessReport),
    /// Infrastructure failure; aborts the batch.
    Fault(ExecError),
}

/// Shared launch-time context handed to every process task.
#[derive(Clone)]
pub struct LaunchContext {
    pub events: mpsc::UnboundedSender<Event>,
    pub cancel: CancellationToken,
    pub tracker: TaskTracker,
    pub kill_grace: Duration,
}

/// How one standard stream of the child is set up.
#[derive(Debug, Clone, PartialEq, Eq)]
enum StreamPlan {
    Inherit,
    Null,
    /// Piped and handed to a relay.
    Piped,
    /// Opened for reading (stdin) or truncated for writing (stdout/stderr).
    File(PathBuf),
}

impl StreamPlan {
    fn from_redirect(redirect: Option<&Redirect>, default: StreamPlan, cwd: Option<&Path>) -> Self {
        match redirect {
            None => default,
            Some(Redirect::Pipe(_)) => StreamPlan::Piped,
            Some(Redirect::File(path)) => StreamPlan::File(match cwd {
                Some(dir) if path.is_relative() => dir.join(path),
                _ => path.clone(),
            }),
        }
    }

    fn open(&self, write: bool) -> io::Result<Stdio> {
        Ok(match self {
            StreamPlan::Inherit => Stdio::inherit(),
            StreamPlan::Null => Stdio::null(),
            StreamPlan::Piped => Stdio::piped(),
            StreamPlan::File(path) if write => File::create(path)?.into(),
            StreamPlan::File(path) => File::open(path)?.into(),
        })
    }
}

pub struct RuntimeProcess {
    index: usize,
    label: String,
    args: Vec<String>,
    state: ProcessState,
    command: Command,
    stdin: StreamPlan,
    stdout: StreamPlan,
    stderr: StreamPlan,
    wiring: Wiring,
}

impl RuntimeProcess {
    /// Resolve the argument template against `bindings` and build the command.
    pub fn prepare(
        index: usize,
        spec: &ProcessSpec,
        bindings: &Bindings,
        wiring: Wiring,
    ) -> Result<Self, ConfigError> {
        let label = spec.label(index);
        trace!(target: "plumb.exec.process", index, %label, state = %ProcessState::Created, "preparing");

        let args = resolve_args(&spec.args, bindings)?;
        let Some((program, rest)) = args.split_first().filter(|(p, _)| !p.is_empty()) else {
            return Err(ConfigError::EmptyCommand { index });
        };

        let mut command = Command::new(program);
        command.args(rest).envs(&spec.env).kill_on_drop(true);
        if let Some(cwd) = &spec.cwd {
            command.current_dir(cwd);
        }

        let cwd = spec.cwd.as_deref();
        let process = Self {
            index,
            label,
            state: ProcessState::Prepared,
            command,
            stdin: StreamPlan::from_redirect(spec.stdin.as_ref(), StreamPlan::Null, cwd),
            stdout: StreamPlan::from_redirect(spec.stdout.as_ref(), StreamPlan::Inherit, cwd),
            stderr: StreamPlan::from_redirect(spec.stderr.as_ref(), StreamPlan::Inherit, cwd),
            wiring,
            args,
        };
        trace!(target: "plumb.exec.process", index, args = ?process.args, state = %process.state, "prepared");
        Ok(process)
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Arguments after placeholder substitution; the first one is the program.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    pub fn state(&self) -> ProcessState {
        self.state
    }

    /// Start the owned relays, then the child, and report its completion.
    ///
    /// Sends exactly one [`Event::Completed`] on `ctx.events`, plus an
    /// [`Event::Fault`] for every infrastructure failure on the way.
    pub async fn execute(self, ctx: LaunchContext) {
        let span = info_span!(target: "plumb.exec.process", "process", index = self.index, label = %self.label);
        self.run(ctx).instrument(span).await
    }

    async fn run(mut self, ctx: LaunchContext) {
        let Wiring {
            relays,
            handoff,
            fifos,
            exited,
        } = std::mem::take(&mut self.wiring);

        for relay in relays {
            let relay = match relay.listen() {
                Ok(relay) => relay,
                Err(e) => {
                    let _ = ctx.events.send(Event::Fault(e.into()));
                    continue;
                }
            };
            let events = ctx.events.clone();
            let cancel = ctx.cancel.clone();
            let conduit = relay.conduit().to_string();
            ctx.tracker.spawn(
                async move {
                    tokio::select! {
                        res = relay.run() => {
                            if let Err(e) = res {
                                let _ = events.send(Event::Fault(e.into()));
                            }
                        }
                        _ = cancel.cancelled() => {
                            debug!(target: "plumb.exec.relay", %conduit, "relay cancelled");
                        }
                    }
                }
                .in_current_span(),
            );
        }

        let code = match self.launch(&ctx, handoff).await {
            Launch::Exited(code) => {
                self.state = ProcessState::Completed(code);
                trace!(target: "plumb.exec.process", state = %self.state, "completed");
                Some(code)
            }
            Launch::NotStarted => None,
        };

        // relays feeding this process stop waiting for it to open its inputs
        exited.cancel();
        // own relays see end of stream if the child never opened its outputs
        for path in &fifos {
            release_fifo(path);
        }

        let report = ProcessReport {
            index: self.index,
            label: self.label,
            args: self.args,
            exit_code: code.flatten(),
            status: match code {
                Some(code) => ProcessStatus::from_exit_code(code),
                None => ProcessStatus::NotStarted,
            },
        };
        let _ = ctx.events.send(Event::Completed(report));
    }

    async fn launch(&mut self, ctx: &LaunchContext, handoff: Handoff) -> Launch {
        if ctx.cancel.is_cancelled() {
            debug!(target: "plumb.exec.process", "batch aborted before start");
            return Launch::NotStarted;
        }

        let spawned = self.apply_stdio().and_then(|()| self.command.spawn());
        let mut child = match spawned {
            Ok(child) => child,
            Err(source) => {
                warn!(target: "plumb.exec.process", error = %source, "spawn failed");
                let _ = ctx.events.send(Event::Fault(ExecError::Spawn {
                    process: self.label.clone(),
                    source,
                }));
                // handoff senders drop after the fault is queued
                drop(handoff);
                return Launch::NotStarted;
            }
        };
        self.state = ProcessState::Running;
        debug!(target: "plumb.exec.process", pid = child.id(), state = %self.state, "spawned");

        let Handoff {
            stdin,
            stdout,
            stderr,
        } = handoff;
        if let (Some(tx), Some(pipe)) = (stdin, child.stdin.take()) {
            let _ = tx.send(Box::new(pipe) as BoxWriter);
        }
        if let (Some(tx), Some(pipe)) = (stdout, child.stdout.take()) {
            let _ = tx.send(Box::new(pipe) as BoxReader);
        }
        if let (Some(tx), Some(pipe)) = (stderr, child.stderr.take()) {
            let _ = tx.send(Box::new(pipe) as BoxReader);
        }

        let waited = tokio::select! {
            status = child.wait() => status,
            _ = ctx.cancel.cancelled() => {
                debug!(target: "plumb.exec.process", "batch aborted; stopping child");
                kill_graceful(&mut child, ctx.kill_grace).await
            }
        };

        match waited {
            Ok(status) => {
                debug!(target: "plumb.exec.process", code = status.code(), "exited");
                Launch::Exited(status.code())
            }
            Err(source) => {
                let _ = ctx.events.send(Event::Fault(ExecError::Wait {
                    process: self.label.clone(),
                    source,
                }));
                Launch::Exited(None)
            }
        }
    }

    fn apply_stdio(&mut self) -> io::Result<()> {
        let stdin = self.stdin.open(false)?;
        let stdout = self.stdout.open(true)?;
        let stderr = self.stderr.open(true)?;
        self.command.stdin(stdin).stdout(stdout).stderr(stderr);
        Ok(())
    }
}

impl fmt::Debug for RuntimeProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RuntimeProcess")
            .field("index", &self.index)
            .field("label", &self.label)
            .field("args", &self.args)
            .field("state", &self.state)
            .field("relays", &self.wiring.relays.len())
            .finish()
    }
}

enum Launch {
    Exited(Option<i32>),
    NotStarted,
}

fn resolve_args(args: &[Arg], bindings: &Bindings) -> Result<Vec<String>, ConfigError> {
    args.iter()
        .map(|arg| match arg {
            Arg::Text(text) => substitute(text, bindings),
            Arg::Pipe { pipe, .. } => {
                bindings
                    .get(pipe)
                    .cloned()
                    .ok_or_else(|| ConfigError::UnresolvedPlaceholder { name: pipe.clone() })
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use plumb_model::PipeRole;

    fn bind(pairs: &[(&str, &str)]) -> Bindings {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn prepare_substitutes_templates_and_pipe_args() {
        let spec = ProcessSpec::new([
            Arg::from("tool"),
            Arg::from("--out=$(data)"),
            Arg::pipe("log", PipeRole::Output),
        ]);
        let b = bind(&[("data", "/tmp/f/000-data.out"), ("log", "/tmp/f/001-log.out")]);

        let p = RuntimeProcess::prepare(4, &spec, &b, Wiring::default()).unwrap();
        assert_eq!(p.args(), ["tool", "--out=/tmp/f/000-data.out", "/tmp/f/001-log.out"]);
        assert_eq!(p.state(), ProcessState::Prepared);
        assert_eq!(p.label(), "tool");
        assert_eq!(p.index(), 4);
    }

    #[test]
    fn prepare_rejects_unbound_placeholder() {
        let spec = ProcessSpec::new(["cat", "$(nope)"]);
        let err = RuntimeProcess::prepare(0, &spec, &Bindings::new(), Wiring::default()).unwrap_err();
        assert!(matches!(err, ConfigError::UnresolvedPlaceholder { name } if name == "nope"));
    }

    #[test]
    fn prepare_rejects_empty_command() {
        let empty = ProcessSpec::new(Vec::<Arg>::new());
        let err = RuntimeProcess::prepare(2, &empty, &Bindings::new(), Wiring::default()).unwrap_err();
        assert!(matches!(err, ConfigError::EmptyCommand { index: 2 }));

        let blank = ProcessSpec::new([""]);
        assert!(RuntimeProcess::prepare(0, &blank, &Bindings::new(), Wiring::default()).is_err());
    }

    #[test]
    fn redirect_files_resolve_against_cwd() {
        let cwd = Path::new("/work");
        let rel = Redirect::file("out.txt");
        let abs = Redirect::file("/var/log/x");

        assert_eq!(
            StreamPlan::from_redirect(Some(&rel), StreamPlan::Inherit, Some(cwd)),
            StreamPlan::File(PathBuf::from("/work/out.txt"))
        );
        assert_eq!(
            StreamPlan::from_redirect(Some(&abs), StreamPlan::Inherit, Some(cwd)),
            StreamPlan::File(PathBuf::from("/var/log/x"))
        );
        assert_eq!(
            StreamPlan::from_redirect(None, StreamPlan::Null, Some(cwd)),
            StreamPlan::Null
        );
        assert_eq!(
            StreamPlan::from_redirect(Some(&Redirect::pipe("p")), StreamPlan::Null, None),
            StreamPlan::Piped
        );
    }

    #[test]
    fn state_display() {
        assert_eq!(ProcessState::Completed(Some(3)).to_string(), "completed(3)");
        assert_eq!(ProcessState::Completed(None).to_string(), "completed(signal)");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_reports_exit_code() {
        let spec = ProcessSpec::new(["sh", "-c", "exit 3"]);
        let p = RuntimeProcess::prepare(0, &spec, &Bindings::new(), Wiring::default()).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = LaunchContext {
            events: tx,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            kill_grace: Duration::from_millis(100),
        };
        p.execute(ctx).await;

        match rx.recv().await.unwrap() {
            Event::Completed(report) => {
                assert_eq!(report.exit_code, Some(3));
                assert_eq!(report.status, ProcessStatus::Failed);
            }
            Event::Fault(e) => panic!("unexpected fault: {e}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn execute_reports_spawn_failure() {
        let spec = ProcessSpec::new(["/nonexistent/plumb-test-binary"]);
        let p = RuntimeProcess::prepare(0, &spec, &Bindings::new(), Wiring::default()).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let ctx = LaunchContext {
            events: tx,
            cancel: CancellationToken::new(),
            tracker: TaskTracker::new(),
            kill_grace: Duration::from_millis(100),
        };
        p.execute(ctx).await;

        assert!(matches!(rx.recv().await.unwrap(), Event::Fault(ExecError::Spawn { .. })));
        match rx.recv().await.unwrap() {
            Event::Completed(report) => assert_eq!(report.status, ProcessStatus::NotStarted),
            Event::Fault(e) => panic!("unexpected fault: {e}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cancellation_stops_running_child() {
        let spec = ProcessSpec::new(["sleep", "30"]);
        let p = RuntimeProcess::prepare(0, &spec, &Bindings::new(), Wiring::default()).unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let ctx = LaunchContext {
            events: tx,
            cancel: cancel.clone(),
            tracker: TaskTracker::new(),
            kill_grace: Duration::from_secs(1),
        };
        let task = tokio::spawn(p.execute(ctx));
        tokio::time::sleep(Duration::from_millis(100)).await;
        cancel.cancel();
        task.await.unwrap();

        match rx.recv().await.unwrap() {
            Event::Completed(report) => assert_eq!(report.status, ProcessStatus::Killed),
            Event::Fault(e) => panic!("unexpected fault: {e}"),
        }
    }
}
