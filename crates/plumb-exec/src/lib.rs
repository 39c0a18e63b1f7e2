//! Concurrent execution of a batch of external commands wired together by
//! named conduits.
//!
//! A conduit has one producer and any number of consumers. Producers and
//! consumers see either a FIFO path (substituted into their arguments through
//! `$(name)` placeholders) or one of their standard streams; a relay task per
//! conduit copies every byte to every consumer.
mod config;
pub use config::{DEFAULT_CHUNK_SIZE, ExecConfig};

mod error;
pub use error::{ConfigError, ExecError, ExecResult, RelayError, RelayStage};

pub mod conduit;
pub use conduit::{Conduit, ConsumerSink, FifoDir, ProducerSource};

pub mod relay;
pub use relay::{Relay, RelayStats, Sink, Source};

pub mod template;
pub use template::{Bindings, Template, substitute};

mod registry;
pub use registry::{ConduitRegistry, RegistryBuilder};

pub mod process;
pub use process::{ProcessState, RuntimeProcess};

mod orchestrator;
pub use orchestrator::Orchestrator;

mod util;

pub mod prelude {
    pub use crate::{
        config::ExecConfig,
        error::{ExecError, ExecResult},
        orchestrator::Orchestrator,
    };
    pub use plumb_model::{BatchReport, BatchSpec, ProcessSpec, Redirect};
}
