use crate::errors::Result;
use crate::workflows::slicing::ensure_tenant;
use ivm_domain::{EntityKey, OutboxEntry, RawDataRecord, TenantId, Version};
use ivm_store::{PutOutcome, RawDataRepository};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::sync::Arc;
use uuid::Uuid;

/// Petición de ingesta de una versión de entidad.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestRequest {
  pub tenant_id: TenantId,
  pub entity_key: EntityKey,
  pub version: Version,
  pub schema_id: String,
  pub schema_version: u32,
  pub payload: JsonValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum IngestOutcome {
  /// Registro nuevo; se emitió el evento con este id.
  Created { payload_hash: String, outbox_id: Uuid },
  /// Mismo contenido ya ingestado: no-op.
  Duplicate { payload_hash: String },
}

/// Punto de entrada de escritura: raw data + evento de outbox en la misma
/// unidad de trabajo.
#[derive(Clone)]
pub struct IngestService {
  raw_repo: Arc<dyn RawDataRepository>,
}

impl IngestService {
  pub fn new(raw_repo: Arc<dyn RawDataRepository>) -> Self {
    Self { raw_repo }
  }

  /// Un payload distinto para la misma versión termina en
  /// `InvariantViolation`.
  pub async fn ingest(&self, req: IngestRequest) -> Result<IngestOutcome> {
    ensure_tenant(&req.tenant_id, &req.entity_key)?;
    let record = RawDataRecord::new(req.entity_key, req.version, req.schema_id, req.schema_version, &req.payload);
    let entry = OutboxEntry::raw_data_ingested(&record);
    match self.raw_repo.put_with_outbox(&record, &entry).await? {
      PutOutcome::Inserted => {
        info!("ingestado {} v{} ({})", record.entity_key, record.version, record.payload_hash);
        Ok(IngestOutcome::Created { payload_hash: record.payload_hash, outbox_id: entry.id })
      }
      PutOutcome::AlreadyExists => {
        debug!("{} v{} ya ingestado con el mismo contenido", record.entity_key, record.version);
        Ok(IngestOutcome::Duplicate { payload_hash: record.payload_hash })
      }
    }
  }
}
