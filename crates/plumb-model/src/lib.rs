mod error;
pub use error::ModelError;

mod process;
pub use process::{Arg, PipeRole, ProcessSpec, Redirect};

mod batch;
pub use batch::BatchSpec;

mod report;
pub use report::{BatchReport, ProcessReport, ProcessStatus};

/// Name of a conduit, unique within one batch.
pub type ConduitName = String;
