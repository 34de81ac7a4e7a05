// records.rs
use crate::determinism::{canonical_json, canonicalize, content_hash};
use crate::{DomainError, EntityKey, TenantId, Version};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use uuid::Uuid;

/// Tope fijo de reintentos de una entrada de outbox. Una entrada `Failed`
/// sólo vuelve a `Pending` mientras `retry_count` esté por debajo.
pub const MAX_OUTBOX_RETRIES: u32 = 5;

/// Tipo de evento emitido por la ingesta.
pub const RAW_DATA_INGESTED: &str = "RAW_DATA_INGESTED";

/// `source_slice_type` de las entradas de índice extraídas del payload crudo.
pub const RAW_SOURCE: &str = "_raw";

/// Registro crudo e inmutable de una entidad en una versión.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawDataRecord {
  pub tenant_id: TenantId,
  pub entity_key: EntityKey,
  pub version: Version,
  pub schema_id: String,
  pub schema_version: u32,
  /// Payload en forma canónica (claves ordenadas).
  pub payload: JsonValue,
  pub payload_hash: String,
}

impl RawDataRecord {
  /// Construye el registro canonicalizando y hasheando el payload.
  pub fn new(entity_key: EntityKey,
             version: Version,
             schema_id: impl Into<String>,
             schema_version: u32,
             payload: &JsonValue)
             -> Self {
    let payload = canonicalize(payload);
    let payload_hash = content_hash(&payload);
    Self { tenant_id: entity_key.tenant().clone(),
           entity_key,
           version,
           schema_id: schema_id.into(),
           schema_version,
           payload,
           payload_hash }
  }

  /// Texto canónico del payload (lo que se hashea).
  pub fn canonical_payload(&self) -> String {
    canonical_json(&self.payload)
  }

  pub fn verify_integrity(&self) -> bool {
    content_hash(&self.payload) == self.payload_hash
  }
}

/// Marca de borrado lógico en una versión.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tombstone {
  pub deleted_at_version: Version,
  pub reason: String,
}

/// Identifica un slice concreto.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SliceKey {
  pub entity_key: EntityKey,
  pub version: Version,
  pub slice_type: String,
}

impl SliceKey {
  pub fn new(entity_key: &EntityKey, version: Version, slice_type: &str) -> Self {
    Self { entity_key: entity_key.clone(), version, slice_type: slice_type.to_string() }
  }
}

impl fmt::Display for SliceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@v{}/{}", self.entity_key, self.version, self.slice_type)
  }
}

/// Proyección tipada e inmutable de una entidad en una versión.
///
/// `revision` numera las publicaciones sobre la misma versión de raw data:
/// 0 es el troceado de la ingesta; las siguientes las publican el
/// re-troceado por cambios en joins y los tombstones. Cada
/// `(clave, revisión)` es inmutable y las lecturas ven la más alta.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceRecord {
  pub tenant_id: TenantId,
  pub entity_key: EntityKey,
  pub version: Version,
  #[serde(default)]
  pub revision: u32,
  pub slice_type: String,
  pub data: JsonValue,
  pub hash: String,
  pub rule_set_id: String,
  pub rule_set_version: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub tombstone: Option<Tombstone>,
}

impl SliceRecord {
  pub fn new(entity_key: &EntityKey,
             version: Version,
             slice_type: &str,
             data: JsonValue,
             rule_set_id: &str,
             rule_set_version: u32)
             -> Self {
    let data = canonicalize(&data);
    let hash = content_hash(&data);
    Self { tenant_id: entity_key.tenant().clone(),
           entity_key: entity_key.clone(),
           version,
           revision: 0,
           slice_type: slice_type.to_string(),
           data,
           hash,
           rule_set_id: rule_set_id.to_string(),
           rule_set_version,
           tombstone: None }
  }

  /// Slice de borrado: sin datos, con el hash de la propia marca para que
  /// reescribir el mismo tombstone sea idempotente.
  pub fn tombstone(entity_key: &EntityKey,
                   version: Version,
                   slice_type: &str,
                   reason: &str,
                   rule_set_id: &str,
                   rule_set_version: u32)
                   -> Self {
    let marker = Tombstone { deleted_at_version: version, reason: reason.to_string() };
    let hash = content_hash(&serde_json::json!({ "tombstone": { "deleted_at_version": version, "reason": reason } }));
    Self { tenant_id: entity_key.tenant().clone(),
           entity_key: entity_key.clone(),
           version,
           revision: 0,
           slice_type: slice_type.to_string(),
           data: JsonValue::Null,
           hash,
           rule_set_id: rule_set_id.to_string(),
           rule_set_version,
           tombstone: Some(marker) }
  }

  /// Copia el contenido (datos y hash) a la revisión 0 de una versión nueva.
  pub fn copy_forward(&self, version: Version) -> Self {
    let mut copy = self.clone();
    copy.version = version;
    copy.revision = 0;
    copy
  }

  pub fn with_revision(mut self, revision: u32) -> Self {
    self.revision = revision;
    self
  }

  /// Mismo contenido publicado (datos, marca de borrado y RuleSet).
  pub fn same_content(&self, other: &SliceRecord) -> bool {
    self.hash == other.hash && self.rule_set_id == other.rule_set_id && self.rule_set_version == other.rule_set_version
  }

  pub fn key(&self) -> SliceKey {
    SliceKey::new(&self.entity_key, self.version, &self.slice_type)
  }

  pub fn is_tombstoned(&self) -> bool {
    self.tombstone.is_some()
  }
}

/// Entrada del índice invertido. En las entradas directas `target_entity_key`
/// es la entidad dueña del valor; en las inversas es la entidad que
/// referencia (downstream) y `ref_entity_key` la referenciada (upstream).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InvertedIndexEntry {
  pub tenant_id: TenantId,
  pub index_type: String,
  pub index_value: String,
  pub target_entity_key: EntityKey,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub ref_entity_key: Option<EntityKey>,
  pub source_slice_type: String,
}

impl InvertedIndexEntry {
  pub fn is_reverse(&self) -> bool {
    self.ref_entity_key.is_some()
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
  Pending,
  Processed,
  Failed,
  Retrying,
}

impl fmt::Display for OutboxStatus {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let s = match self {
      OutboxStatus::Pending => "PENDING",
      OutboxStatus::Processed => "PROCESSED",
      OutboxStatus::Failed => "FAILED",
      OutboxStatus::Retrying => "RETRYING",
    };
    f.write_str(s)
  }
}

/// Evento escrito en la misma unidad de trabajo que su `RawDataRecord`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEntry {
  pub id: Uuid,
  pub aggregate_type: String,
  pub aggregate_id: String,
  pub event_type: String,
  pub payload: JsonValue,
  pub status: OutboxStatus,
  pub retry_count: u32,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub last_error: Option<String>,
  pub created_at: DateTime<Utc>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub processed_at: Option<DateTime<Utc>>,
  /// Inicio del último intento en `Retrying`; vencido el lease del worker,
  /// la entrada vuelve a `Pending`.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub retrying_since: Option<DateTime<Utc>>,
}

impl OutboxEntry {
  pub fn new(aggregate_type: impl Into<String>,
             aggregate_id: impl Into<String>,
             event_type: impl Into<String>,
             payload: JsonValue)
             -> Self {
    Self { id: Uuid::new_v4(),
           aggregate_type: aggregate_type.into(),
           aggregate_id: aggregate_id.into(),
           event_type: event_type.into(),
           payload,
           status: OutboxStatus::Pending,
           retry_count: 0,
           last_error: None,
           created_at: Utc::now(),
           processed_at: None,
           retrying_since: None }
  }

  /// Evento de ingesta para un registro crudo recién escrito.
  pub fn raw_data_ingested(record: &RawDataRecord) -> Self {
    let payload = RawDataIngested { tenant_id: record.tenant_id.clone(),
                                    entity_key: record.entity_key.clone(),
                                    version: record.version,
                                    payload_hash: record.payload_hash.clone() };
    // RawDataIngested sólo contiene cadenas y enteros.
    let body = serde_json::to_value(&payload).unwrap_or(JsonValue::Null);
    Self::new(record.entity_key.entity_type(),
              record.entity_key.to_string(),
              RAW_DATA_INGESTED,
              body)
  }

  pub fn can_retry(&self) -> bool {
    self.retry_count < MAX_OUTBOX_RETRIES
  }
}

/// Cuerpo del evento `RAW_DATA_INGESTED`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawDataIngested {
  pub tenant_id: TenantId,
  pub entity_key: EntityKey,
  pub version: Version,
  pub payload_hash: String,
}

impl RawDataIngested {
  pub fn from_entry(entry: &OutboxEntry) -> Result<Self, DomainError> {
    Ok(serde_json::from_value(entry.payload.clone())?)
  }
}
