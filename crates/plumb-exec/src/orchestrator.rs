//! Batch driver.
//!
//! 1. Build the conduit registry (outputs, then inputs).
//! 2. Prepare every process against the frozen registry.
//! 3. Launch all processes concurrently, each starting its relays first.
//! 4. Wait for exactly one completion per process, in any order.
//! 5. Release leftover FIFO waiters, drain relay tasks, remove the FIFOs.
//!
//! Nothing is spawned unless steps 1 and 2 succeed for the whole batch.
use plumb_model::{BatchReport, BatchSpec};
use tokio::sync::mpsc;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::{
    config::ExecConfig,
    error::{ExecError, ExecResult},
    process::{Event, LaunchContext, RuntimeProcess, wire},
    registry::ConduitRegistry,
};

#[derive(Debug, Clone, Default)]
pub struct Orchestrator {
    cfg: ExecConfig,
}

impl Orchestrator {
    pub fn new(cfg: ExecConfig) -> Self {
        Self { cfg }
    }

    pub fn config(&self) -> &ExecConfig {
        &self.cfg
    }

    /// Run `batch` to completion.
    ///
    /// Returns the per-process report when every process was launched and
    /// joined without infrastructure errors; nonzero exit codes are part of the
    /// report, not errors. Any configuration error is returned before spawning.
    pub async fn run(&self, batch: &BatchSpec) -> ExecResult<BatchReport> {
        let run_id = Uuid::new_v4();
        let span = info_span!(target: "plumb.exec", "batch", %run_id, processes = batch.len());
        self.run_inner(batch).instrument(span).await
    }

    async fn run_inner(&self, batch: &BatchSpec) -> ExecResult<BatchReport> {
        if batch.is_empty() {
            debug!(target: "plumb.exec", "empty batch");
            return Ok(BatchReport::default());
        }

        let registry = ConduitRegistry::build(batch, &self.cfg)?;
        debug!(
            target: "plumb.exec",
            conduits = registry.len(),
            dir = %registry.fifo_dir().display(),
            "registry built"
        );
        let processes = prepare_all(batch, &registry, &self.cfg)?;

        let (events, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let tracker = TaskTracker::new();
        let ctx = LaunchContext {
            events,
            cancel: cancel.clone(),
            tracker: tracker.clone(),
            kill_grace: self.cfg.kill_grace,
        };

        let expected = processes.len();
        for process in processes {
            tracker.spawn(process.execute(ctx.clone()).in_current_span());
        }
        drop(ctx);
        info!(target: "plumb.exec", processes = expected, "batch launched");

        let mut reports = Vec::with_capacity(expected);
        let mut fault: Option<ExecError> = None;
        while reports.len() < expected {
            match rx.recv().await {
                Some(Event::Completed(report)) => {
                    debug!(
                        target: "plumb.exec",
                        index = report.index,
                        label = %report.label,
                        code = report.exit_code,
                        "process completed"
                    );
                    reports.push(report);
                }
                Some(Event::Fault(e)) => record_fault(&mut fault, e, &cancel),
                // every sender is gone; cannot happen while a process task is alive
                None => break,
            }
        }

        tracker.close();
        tracker.wait().await;
        while let Ok(event) = rx.try_recv() {
            if let Event::Fault(e) = event {
                record_fault(&mut fault, e, &cancel);
            }
        }

        let dir = registry.fifo_dir().to_path_buf();
        if let Err(e) = registry.close() {
            warn!(target: "plumb.exec", dir = %dir.display(), error = %e, "failed to remove fifo directory");
        }

        match fault {
            Some(e) => Err(e),
            None => {
                let report = BatchReport::new(reports);
                info!(
                    target: "plumb.exec",
                    processes = report.len(),
                    failed = report.failed().count(),
                    "batch finished"
                );
                Ok(report)
            }
        }
    }
}

fn prepare_all(
    batch: &BatchSpec,
    registry: &ConduitRegistry,
    cfg: &ExecConfig,
) -> ExecResult<Vec<RuntimeProcess>> {
    let wiring = wire(registry, batch.len(), cfg);
    batch
        .iter()
        .zip(wiring)
        .enumerate()
        .map(|(index, (spec, wiring))| {
            RuntimeProcess::prepare(index, spec, registry.bindings(index), wiring).map_err(Into::into)
        })
        .collect()
}

fn record_fault(slot: &mut Option<ExecError>, err: ExecError, cancel: &CancellationToken) {
    let cause = std::error::Error::source(&err).map(ToString::to_string);
    if slot.is_none() {
        warn!(target: "plumb.exec", error = %err, cause, "aborting batch");
        *slot = Some(err);
        cancel.cancel();
    } else {
        debug!(target: "plumb.exec", error = %err, cause, "further failure during abort");
    }
}
