//! ivm-workflow: motor de mantenimiento incremental de vistas
//!
//! Compone los puertos de `ivm_store` con los motores puros de `engine`
//! (joins, reglas de troceado, impacto de cambios, índices) para ofrecer los
//! workflows de ingesta, troceado FULL/INCREMENTAL, fanout, consulta de vistas
//! y el worker de outbox que los dispara.

pub mod config;
pub mod engine;
pub mod errors;
pub mod resilience;
pub mod worker;
pub mod workflows;

pub use config::{FanoutConfig, IvmConfig, WorkerConfig};
pub use engine::{ImpactAnalysis, IndexBuilder, JoinExecutor, SlicingEngine};
pub use errors::{ErrorClass, WorkflowError};
pub use resilience::{Backoff, BreakerState, CircuitBreaker};
pub use worker::{OutboxProcessor, OutboxWorker, PollStats, RequeueStats, SlicingOutboxProcessor, WorkerHandle};
pub use workflows::{DependencyReport, FanoutDependency, FanoutResult, FanoutStatus, FanoutWorkflow, IngestOutcome,
                    IngestRequest, IngestService, QueryWorkflow, SlicingMode, SlicingOutcome, SlicingWorkflow,
                    ViewResponse};
