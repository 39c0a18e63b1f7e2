//! Turns the frozen registry into per-process relay ownership.
//!
//! Every conduit gets exactly one [`Relay`], owned by its producer. Conduits
//! attached to a standard stream are fed through oneshot handoffs: the relay
//! holds the receiver, the process that spawns the child holds the sender.
//! FIFO sinks watch their consumer's `exited` token instead.
use std::path::PathBuf;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::{
    config::ExecConfig,
    conduit::{ConsumerSink, ProducerSource},
    registry::ConduitRegistry,
    relay::{BoxReader, BoxWriter, Relay, Sink, Source},
};

/// Senders for the child's standard streams, filled in once it is spawned.
#[derive(Default)]
pub struct Handoff {
    pub stdin: Option<oneshot::Sender<BoxWriter>>,
    pub stdout: Option<oneshot::Sender<BoxReader>>,
    pub stderr: Option<oneshot::Sender<BoxReader>>,
}

/// Everything one process owns at launch time.
#[derive(Default)]
pub struct Wiring {
    /// Relays of the conduits this process produces.
    pub relays: Vec<Relay>,
    pub handoff: Handoff,
    /// Output FIFOs, released once the child is gone.
    pub fifos: Vec<PathBuf>,
    /// Cancelled once the child has exited or failed to start.
    pub exited: CancellationToken,
}

pub fn wire(registry: &ConduitRegistry, count: usize, cfg: &ExecConfig) -> Vec<Wiring> {
    let mut wiring: Vec<Wiring> = (0..count).map(|_| Wiring::default()).collect();

    for conduit in registry.conduits() {
        let producer = conduit.producer();
        let source = match conduit.source() {
            ProducerSource::Fifo(path) => {
                wiring[producer].fifos.push(path.clone());
                Source::Fifo(path.clone())
            }
            ProducerSource::Stdout => {
                let (tx, rx) = oneshot::channel();
                wiring[producer].handoff.stdout = Some(tx);
                Source::Handoff(rx)
            }
            ProducerSource::Stderr => {
                let (tx, rx) = oneshot::channel();
                wiring[producer].handoff.stderr = Some(tx);
                Source::Handoff(rx)
            }
        };

        let mut relay = Relay::new(conduit.name(), source).with_chunk_size(cfg.chunk_size());
        for consumer in conduit.consumers() {
            let sink = match &consumer.sink {
                ConsumerSink::Fifo(path) => {
                    Sink::fifo(path, wiring[consumer.process].exited.clone())
                }
                ConsumerSink::Stdin => {
                    let (tx, rx) = oneshot::channel();
                    wiring[consumer.process].handoff.stdin = Some(tx);
                    Sink::Handoff(rx)
                }
            };
            relay.add_sink(sink);
        }
        wiring[producer].relays.push(relay);
    }
    wiring
}
