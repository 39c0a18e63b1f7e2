//! Conduit namespace of one batch.
//!
//! Built in two passes by [`RegistryBuilder`]: outputs first, so that every
//! producer exists before any consumer looks it up, then inputs. Freezing the
//! builder yields a read-only [`ConduitRegistry`] that the launch phase shares.
use std::{collections::BTreeMap, io, path::Path};

use plumb_model::{BatchSpec, Redirect};
use tracing::{debug, trace};

use crate::{
    config::ExecConfig,
    conduit::{Conduit, ConsumerSink, FifoDir, ProducerSource, STREAM_BINDING},
    error::{ConfigError, ExecError, ExecResult},
    template::Bindings,
};

pub struct RegistryBuilder {
    fifos: FifoDir,
    conduits: BTreeMap<String, Conduit>,
    bindings: Vec<Bindings>,
}

impl RegistryBuilder {
    pub fn new(cfg: &ExecConfig) -> ExecResult<Self> {
        let fifos = FifoDir::create(cfg).map_err(|source| ExecError::Fifo {
            path: cfg.fifo_dir.clone().unwrap_or_else(std::env::temp_dir),
            source,
        })?;
        Ok(Self {
            fifos,
            conduits: BTreeMap::new(),
            bindings: Vec::new(),
        })
    }

    /// Pass 1: one conduit per declared output and per stdout/stderr pipe.
    pub fn register_outputs(&mut self, batch: &BatchSpec) -> ExecResult<()> {
        self.size_for(batch);

        for (index, spec) in batch.iter().enumerate() {
            for name in spec.declared_outputs() {
                self.ensure_vacant(name)?;
                let path = self.allocate(name, "out")?;
                self.bind(index, name, path.to_string_lossy().into_owned());
                self.insert(Conduit::new(name, index, ProducerSource::Fifo(path)));
            }

            let streams = [
                (&spec.stdout, ProducerSource::Stdout),
                (&spec.stderr, ProducerSource::Stderr),
            ];
            for (redirect, source) in streams {
                if let Some(name) = redirect.as_ref().and_then(Redirect::as_pipe) {
                    self.ensure_vacant(name)?;
                    self.bind_stream(index, name);
                    self.insert(Conduit::new(name, index, source));
                }
            }
        }
        Ok(())
    }

    /// Pass 2: attach every declared input and stdin pipe to its producer.
    pub fn register_inputs(&mut self, batch: &BatchSpec) -> ExecResult<()> {
        self.size_for(batch);

        for (index, spec) in batch.iter().enumerate() {
            for name in spec.declared_inputs() {
                self.check_consumer(name, index, || spec.label(index))?;
                let path = self.allocate(name, "in")?;
                self.bind(index, name, path.to_string_lossy().into_owned());
                self.attach(name, index, ConsumerSink::Fifo(path));
            }

            if let Some(name) = spec.stdin.as_ref().and_then(Redirect::as_pipe) {
                self.check_consumer(name, index, || spec.label(index))?;
                self.bind_stream(index, name);
                self.attach(name, index, ConsumerSink::Stdin);
            }
        }
        Ok(())
    }

    /// Stop accepting registrations.
    pub fn freeze(self) -> ConduitRegistry {
        debug!(
            target: "plumb.exec.registry",
            conduits = self.conduits.len(),
            fifos = self.fifos.fifos().len(),
            "registry frozen"
        );
        ConduitRegistry {
            fifos: self.fifos,
            conduits: self.conduits,
            bindings: self.bindings,
        }
    }

    fn size_for(&mut self, batch: &BatchSpec) {
        if self.bindings.len() < batch.len() {
            self.bindings.resize_with(batch.len(), Bindings::new);
        }
    }

    fn ensure_vacant(&self, name: &str) -> Result<(), ConfigError> {
        if self.conduits.contains_key(name) {
            return Err(ConfigError::DuplicateConduit {
                name: name.to_string(),
            });
        }
        Ok(())
    }

    fn check_consumer(
        &self,
        name: &str,
        index: usize,
        label: impl FnOnce() -> String,
    ) -> Result<(), ConfigError> {
        match self.conduits.get(name) {
            None => Err(ConfigError::UnknownConduit {
                name: name.to_string(),
                process: label(),
            }),
            Some(conduit) if conduit.producer() == index => Err(ConfigError::SelfFeed {
                name: name.to_string(),
                process: label(),
            }),
            Some(_) => Ok(()),
        }
    }

    fn allocate(&mut self, name: &str, role: &str) -> ExecResult<std::path::PathBuf> {
        self.fifos
            .allocate(name, role)
            .map_err(|source| ExecError::Fifo {
                path: self.fifos.path().to_path_buf(),
                source,
            })
    }

    fn insert(&mut self, conduit: Conduit) {
        trace!(target: "plumb.exec.registry", conduit = conduit.name(), producer = conduit.producer(), "producer registered");
        self.conduits.insert(conduit.name().to_string(), conduit);
    }

    fn attach(&mut self, name: &str, index: usize, sink: ConsumerSink) {
        if let Some(conduit) = self.conduits.get_mut(name) {
            trace!(target: "plumb.exec.registry", conduit = name, consumer = index, "consumer registered");
            conduit.add_consumer(index, sink);
        }
    }

    fn bind(&mut self, index: usize, name: &str, value: String) {
        self.bindings[index].insert(name.to_string(), value);
    }

    fn bind_stream(&mut self, index: usize, name: &str) {
        self.bindings[index]
            .entry(name.to_string())
            .or_insert_with(|| STREAM_BINDING.to_string());
    }
}

/// Frozen conduit namespace plus the per-process path bindings.
///
/// Owns the batch's FIFO directory; dropping the registry removes it.
#[derive(Debug)]
pub struct ConduitRegistry {
    fifos: FifoDir,
    conduits: BTreeMap<String, Conduit>,
    bindings: Vec<Bindings>,
}

impl ConduitRegistry {
    /// Run both registration passes over `batch`.
    pub fn build(batch: &BatchSpec, cfg: &ExecConfig) -> ExecResult<Self> {
        let mut builder = RegistryBuilder::new(cfg)?;
        builder.register_outputs(batch)?;
        builder.register_inputs(batch)?;
        Ok(builder.freeze())
    }

    pub fn get(&self, name: &str) -> Option<&Conduit> {
        self.conduits.get(name)
    }

    /// Conduits ordered by name.
    pub fn conduits(&self) -> impl Iterator<Item = &Conduit> {
        self.conduits.values()
    }

    pub fn len(&self) -> usize {
        self.conduits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.conduits.is_empty()
    }

    /// Template bindings of process `index` (empty for unknown indices).
    pub fn bindings(&self, index: usize) -> &Bindings {
        static EMPTY: Bindings = Bindings::new();
        self.bindings.get(index).unwrap_or(&EMPTY)
    }

    pub fn fifo_dir(&self) -> &Path {
        self.fifos.path()
    }

    /// Remove every backing FIFO.
    pub fn close(self) -> io::Result<()> {
        self.fifos.close()
    }
}
