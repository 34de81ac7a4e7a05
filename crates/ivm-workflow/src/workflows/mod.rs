//! Workflows del motor: ingesta, troceado, fanout y consulta de vistas.
pub mod fanout;
pub mod ingest;
pub mod query;
pub mod slicing;

pub use fanout::{DependencyReport, FanoutDependency, FanoutResult, FanoutStatus, FanoutWorkflow};
pub use ingest::{IngestOutcome, IngestRequest, IngestService};
pub use query::{QueryWorkflow, ViewResponse};
pub use slicing::{SlicingMode, SlicingOutcome, SlicingWorkflow};
