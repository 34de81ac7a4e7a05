// Archivo: repository.rs
// Propósito: definir los puertos de persistencia que consume el núcleo
// (raw data, outbox, slices, índice invertido y registro de contratos).
// Describe el contrato que deben implementar las persistencias concretas
// (KV, relacional, in-memory, etc.).
use crate::errors::Result;
use async_trait::async_trait;
use ivm_domain::{ContractRef, EntityKey, InvertedIndexEntry, OutboxEntry, RawDataRecord, RuleSetContract, SliceKey,
                 SliceRecord, TenantId, Version, ViewDefinitionContract};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Resultado de una escritura idempotente.
///
/// Un conflicto (misma clave, contenido distinto) no es un resultado sino un
/// `StoreError::Conflict`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Se escribió al menos un registro nuevo.
    Inserted,
    /// Todo lo recibido ya existía con el mismo hash.
    AlreadyExists,
}

/// Resultado de publicar una revisión de slices sobre una versión.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevisionOutcome {
    /// Se escribió la revisión indicada.
    Published(u32),
    /// La revisión vigente ya tenía ese contenido; no se escribió nada.
    Unchanged(u32),
}

impl RevisionOutcome {
    pub fn revision(&self) -> u32 {
        match self {
            RevisionOutcome::Published(r) | RevisionOutcome::Unchanged(r) => *r,
        }
    }
}

/// Resultado de reemplazar las entradas de índice de una entidad.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexWriteOutcome {
    /// Las entradas anteriores de la entidad quedaron sustituidas.
    Superseded,
    /// La misma versión ya estaba escrita con las mismas entradas.
    Unchanged,
    /// Ya existían entradas de una versión más reciente; no se escribió nada.
    Stale,
}

/// Repositorio de datos crudos versionados.
///
/// Un `(tenant, entity_key, version)` es inmutable: reescribir el mismo hash
/// es un no-op y un hash distinto es `Conflict`.
#[async_trait]
pub trait RawDataRepository: Send + Sync {
    /// Escritura idempotente del registro.
    async fn put_idempotent(&self, record: &RawDataRecord) -> Result<PutOutcome>;

    /// Escribe el registro y su entrada de outbox en la misma unidad de
    /// trabajo. La entrada sólo se inserta si el registro es nuevo.
    async fn put_with_outbox(&self, record: &RawDataRecord, entry: &OutboxEntry) -> Result<PutOutcome>;

    /// Lee una versión concreta. `NotFound` si no existe.
    async fn get(&self, tenant: &TenantId, key: &EntityKey, version: Version) -> Result<RawDataRecord>;

    /// Última versión conocida estrictamente anterior a `version`.
    async fn latest_before(&self, tenant: &TenantId, key: &EntityKey, version: Version)
                           -> Result<Option<RawDataRecord>>;

    /// Última versión conocida de la entidad.
    async fn latest(&self, tenant: &TenantId, key: &EntityKey) -> Result<Option<RawDataRecord>>;
}

/// Repositorio de la tabla de outbox.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    async fn insert(&self, entry: &OutboxEntry) -> Result<()>;

    async fn insert_all(&self, entries: &[OutboxEntry]) -> Result<()>;

    /// Entradas `Pending` en orden de creación.
    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Entradas `Pending` de un tipo de evento.
    async fn find_pending_by_type(&self, event_type: &str, limit: usize) -> Result<Vec<OutboxEntry>>;

    /// Entradas `Failed` (candidatas a reencolar o a intervención manual).
    async fn find_failed(&self, limit: usize) -> Result<Vec<OutboxEntry>>;

    async fn get(&self, id: &Uuid) -> Result<OutboxEntry>;

    /// Marca una entrada en curso de reintento y sella `retrying_since`.
    async fn mark_retrying(&self, id: &Uuid) -> Result<()>;

    /// Devuelve a `Pending` las entradas `Retrying` cuyo último intento
    /// empezó hace más de `lease` (worker caído o abortado a mitad).
    async fn release_stale_retrying(&self, lease: Duration) -> Result<usize>;

    async fn mark_processed(&self, ids: &[Uuid]) -> Result<()>;

    /// Marca la entrada como fallida e incrementa `retry_count`.
    async fn mark_failed(&self, id: &Uuid, reason: &str) -> Result<()>;

    /// Devuelve una entrada `Failed` a `Pending`. Falla con
    /// `RetryBudgetExhausted` si `retry_count` alcanzó el tope.
    async fn reset_to_pending(&self, id: &Uuid) -> Result<()>;
}

/// Repositorio de slices.
#[async_trait]
pub trait SliceRepository: Send + Sync {
    /// Escritura idempotente de un lote en la `revision` de cada slice. Si
    /// algún slice choca con uno existente de hash distinto no se escribe
    /// nada.
    async fn put_all_idempotent(&self, slices: &[SliceRecord]) -> Result<PutOutcome>;

    /// Publica el lote (una entidad y versión) como revisión nueva, por
    /// encima de la más alta existente. Si la revisión vigente de cada slice
    /// ya tiene el mismo contenido es un no-op. La asignación del número es
    /// atómica.
    async fn put_revision(&self, slices: &[SliceRecord]) -> Result<RevisionOutcome>;

    /// Lee la revisión vigente de los slices pedidos. `NotFound` con la
    /// lista de claves que faltan; los tombstones cuentan como ausentes
    /// salvo que `include_tombstones` sea `true`.
    async fn batch_get(&self, tenant: &TenantId, keys: &[SliceKey], include_tombstones: bool)
                       -> Result<Vec<SliceRecord>>;

    /// Revisión vigente de todos los slices (incluidos tombstones) de una
    /// versión.
    async fn get_version(&self, tenant: &TenantId, key: &EntityKey, version: Version) -> Result<Vec<SliceRecord>>;
}

/// Repositorio del índice invertido (entradas directas e inversas).
#[async_trait]
pub trait InvertedIndexRepository: Send + Sync {
    /// Sustituye las entradas de `owner` por `entries` si
    /// `(version, revision)` no es más antigua que la almacenada. Nunca
    /// modifica entradas en sitio.
    async fn put_all_idempotent(&self,
                                tenant: &TenantId,
                                owner: &EntityKey,
                                version: Version,
                                revision: u32,
                                entries: &[InvertedIndexEntry])
                                -> Result<IndexWriteOutcome>;

    /// Entradas vigentes de un tipo de índice con el valor dado.
    async fn query_by_index_type(&self, tenant: &TenantId, index_type: &str, value: &str)
                                 -> Result<Vec<InvertedIndexEntry>>;

    /// Entradas vigentes de una entidad.
    async fn entries_for_owner(&self, tenant: &TenantId, owner: &EntityKey) -> Result<Vec<InvertedIndexEntry>>;
}

/// Registro de contratos (externo al núcleo; sólo lectura para él).
#[async_trait]
pub trait ContractRegistry: Send + Sync {
    async fn load_rule_set(&self, contract: &ContractRef) -> Result<Arc<RuleSetContract>>;

    async fn load_view_definition(&self, contract: &ContractRef) -> Result<Arc<ViewDefinitionContract>>;

    /// RuleSet activo (versión más alta) para un tipo de entidad.
    async fn rule_set_for_entity_type(&self, entity_type: &str) -> Result<Arc<RuleSetContract>>;

    /// Todos los RuleSets activos.
    async fn rule_sets(&self) -> Result<Vec<Arc<RuleSetContract>>>;
}
