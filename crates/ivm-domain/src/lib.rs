//! ivm-domain: tipos del dominio de mantenimiento incremental de vistas.
//!
//! Identificadores (`TenantId`, `EntityKey`), registros inmutables
//! (`RawDataRecord`, `SliceRecord`, `InvertedIndexEntry`, `OutboxEntry`),
//! contratos declarativos (`RuleSetContract`, `ViewDefinitionContract`) y las
//! utilidades deterministas (JSON canónico + SHA-256) de las que dependen la
//! idempotencia y la detección de cambios.
mod contracts;
pub mod determinism;
mod errors;
mod ids;
pub mod path;
mod records;

pub use contracts::{BuildRule, CircuitBreakerAction, ContractRef, FieldMapping, IndexSpec, JoinSpec, MissingPolicy,
                    RuleSetContract, SliceDefinition, TransformOp, ViewDefinitionContract, DEFAULT_MAX_FANOUT};
pub use determinism::{canonical_json, canonicalize, content_hash};
pub use errors::DomainError;
pub use ids::{EntityKey, TenantId, Version};
pub use records::{InvertedIndexEntry, OutboxEntry, OutboxStatus, RawDataIngested, RawDataRecord, SliceKey, SliceRecord,
                  Tombstone, MAX_OUTBOX_RETRIES, RAW_DATA_INGESTED, RAW_SOURCE};

/// Conjunto ordenado de rutas (JSON pointer) que cambiaron entre dos versiones
/// del payload de una misma entidad.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ChangeSet {
  pub paths: Vec<String>,
}

impl ChangeSet {
  pub fn is_empty(&self) -> bool {
    self.paths.is_empty()
  }

  pub fn len(&self) -> usize {
    self.paths.len()
  }
}
