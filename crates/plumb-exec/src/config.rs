use std::{path::PathBuf, time::Duration};

/// Default relay chunk size in bytes.
pub const DEFAULT_CHUNK_SIZE: usize = 4096;

/// Runtime settings threaded through registry build, preparation and launch.
#[derive(Clone, Debug)]
pub struct ExecConfig {
    /// Name prefix of the per-batch directory that holds backing FIFOs.
    pub fifo_prefix: String,
    /// Parent of that directory; `None` uses the system temp dir.
    pub fifo_dir: Option<PathBuf>,
    /// Bytes read from a conduit source per relay iteration.
    pub relay_chunk_size: usize,
    /// Delay between SIGTERM and SIGKILL when a batch is aborted.
    pub kill_grace: Duration,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            fifo_prefix: "plumb-".to_string(),
            fifo_dir: None,
            relay_chunk_size: DEFAULT_CHUNK_SIZE,
            kill_grace: Duration::from_secs(2),
        }
    }
}

impl ExecConfig {
    pub fn with_fifo_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.fifo_prefix = prefix.into();
        self
    }

    pub fn with_fifo_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.fifo_dir = Some(dir.into());
        self
    }

    pub fn with_relay_chunk_size(mut self, size: usize) -> Self {
        self.relay_chunk_size = size;
        self
    }

    pub fn with_kill_grace(mut self, grace: Duration) -> Self {
        self.kill_grace = grace;
        self
    }

    /// Chunk size actually used by relays (never zero).
    #[inline]
    pub fn chunk_size(&self) -> usize {
        self.relay_chunk_size.max(1)
    }
}
