//! Conduits: named single-producer, multi-consumer byte channels of one batch.

mod fifo;
pub use fifo::{FifoDir, release as release_fifo};

use std::path::PathBuf;

/// Binding used in argument templates for conduits attached to a standard stream.
pub const STREAM_BINDING: &str = "-";

/// Where a conduit's bytes come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProducerSource {
    /// The producer writes into this FIFO.
    Fifo(PathBuf),
    /// The producer's standard output pipe.
    Stdout,
    /// The producer's standard error pipe.
    Stderr,
}

/// Where a consumer receives its copy of the stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsumerSink {
    /// The consumer reads from this FIFO.
    Fifo(PathBuf),
    /// The consumer's standard input pipe.
    Stdin,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Consumer {
    /// Index of the consuming process in the batch.
    pub process: usize,
    pub sink: ConsumerSink,
}

/// A registered conduit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Conduit {
    name: String,
    producer: usize,
    source: ProducerSource,
    consumers: Vec<Consumer>,
}

impl Conduit {
    pub fn new(name: impl Into<String>, producer: usize, source: ProducerSource) -> Self {
        Self {
            name: name.into(),
            producer,
            source,
            consumers: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Index of the producing process in the batch.
    pub fn producer(&self) -> usize {
        self.producer
    }

    pub fn source(&self) -> &ProducerSource {
        &self.source
    }

    pub fn consumers(&self) -> &[Consumer] {
        &self.consumers
    }

    /// Number of consumers the relay writes to.
    pub fn fan_out(&self) -> usize {
        self.consumers.len()
    }

    pub(crate) fn add_consumer(&mut self, process: usize, sink: ConsumerSink) {
        self.consumers.push(Consumer { process, sink });
    }
}
