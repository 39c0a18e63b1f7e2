use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{ModelError, ProcessSpec};

/// Decoded batch document: the ordered set of processes sharing one conduit namespace.
///
/// ```yaml
/// children:
///   - args: [./emit.py, "$(data)"]
///     outputs: [data]
///   - args: [./consume.py, "$(data)", out.txt]
///     inputs: [data]
/// ```
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct BatchSpec {
    #[serde(alias = "processes")]
    pub children: Vec<ProcessSpec>,
}

impl BatchSpec {
    pub fn new(children: Vec<ProcessSpec>) -> Self {
        Self { children }
    }

    pub fn from_yaml_str(doc: &str) -> Result<Self, ModelError> {
        Ok(serde_yml::from_str(doc)?)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ModelError> {
        let path = path.as_ref();
        let doc = std::fs::read_to_string(path).map_err(|source| ModelError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&doc)
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ProcessSpec> {
        self.children.iter()
    }
}
