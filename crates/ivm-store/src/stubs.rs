// Archivo: stubs.rs
// Propósito: implementaciones en memoria de los puertos para pruebas y
// wiring rápido.
//
// Incluye repositorios en memoria de raw data (con outbox transaccional),
// outbox, slices e índice invertido. No son durables. Todas las
// comprobaciones de conflicto se hacen bajo el lock del almacenamiento
// (check-then-write), igual que haría un motor con escrituras condicionales.
use crate::errors::{Result, StoreError};
use crate::repository::{IndexWriteOutcome, InvertedIndexRepository, OutboxRepository, PutOutcome, RawDataRepository,
                        RevisionOutcome, SliceRepository};
use async_trait::async_trait;
use chrono::Utc;
use ivm_domain::{EntityKey, InvertedIndexEntry, OutboxEntry, OutboxStatus, RawDataRecord, SliceKey, SliceRecord,
                 TenantId, Version, MAX_OUTBOX_RETRIES};
use log::debug;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

/// Helper para mapear `Mutex::lock()` en un `Result` con
/// `StoreError::Storage`.
fn lock<T>(m: &Mutex<T>) -> std::result::Result<MutexGuard<'_, T>, StoreError> {
    m.lock().map_err(|e| StoreError::Storage(format!("mutex poisoned: {:?}", e)))
}

fn check_tenant(tenant: &TenantId, key: &EntityKey) -> Result<()> {
    if key.tenant() != tenant {
        return Err(StoreError::Other(format!("tenant {} no coincide con la clave {}", tenant, key)));
    }
    Ok(())
}

type EntityId = (TenantId, EntityKey);

/// Raw data en memoria. Comparte el outbox para poder escribir registro y
/// evento en la misma unidad de trabajo.
pub struct InMemoryRawDataRepository {
    /// Versiones por entidad, ordenadas.
    records: Mutex<HashMap<EntityId, BTreeMap<Version, RawDataRecord>>>,
    outbox: Arc<InMemoryOutboxRepository>,
}

impl InMemoryRawDataRepository {
    /// Crea el repositorio apuntando al outbox dado.
    pub fn new(outbox: Arc<InMemoryOutboxRepository>) -> Self {
        Self { records: Mutex::new(HashMap::new()), outbox }
    }

    /// Número total de registros (todas las versiones).
    pub fn len(&self) -> usize {
        lock(&self.records).map(|r| r.values().map(|v| v.len()).sum()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Comprueba si el registro puede escribirse. `Ok(true)` si es nuevo.
    fn check_put(records: &HashMap<EntityId, BTreeMap<Version, RawDataRecord>>, record: &RawDataRecord) -> Result<bool> {
        check_tenant(&record.tenant_id, &record.entity_key)?;
        let id = (record.tenant_id.clone(), record.entity_key.clone());
        match records.get(&id).and_then(|versions| versions.get(&record.version)) {
            Some(existing) if existing.payload_hash == record.payload_hash => Ok(false),
            Some(existing) => Err(StoreError::Conflict(format!("{} v{}: hash {} distinto del almacenado {}",
                                                               record.entity_key,
                                                               record.version,
                                                               record.payload_hash,
                                                               existing.payload_hash))),
            None => Ok(true),
        }
    }

    fn insert(records: &mut HashMap<EntityId, BTreeMap<Version, RawDataRecord>>, record: &RawDataRecord) {
        records.entry((record.tenant_id.clone(), record.entity_key.clone()))
               .or_default()
               .insert(record.version, record.clone());
    }
}

#[async_trait]
impl RawDataRepository for InMemoryRawDataRepository {
    async fn put_idempotent(&self, record: &RawDataRecord) -> Result<PutOutcome> {
        let mut records = lock(&self.records)?;
        if !Self::check_put(&records, record)? {
            return Ok(PutOutcome::AlreadyExists);
        }
        Self::insert(&mut records, record);
        Ok(PutOutcome::Inserted)
    }

    async fn put_with_outbox(&self, record: &RawDataRecord, entry: &OutboxEntry) -> Result<PutOutcome> {
        // El lock de raw data se mantiene durante toda la unidad de trabajo.
        let mut records = lock(&self.records)?;
        if !Self::check_put(&records, record)? {
            return Ok(PutOutcome::AlreadyExists);
        }
        self.outbox.insert_locked(entry)?;
        Self::insert(&mut records, record);
        Ok(PutOutcome::Inserted)
    }

    async fn get(&self, tenant: &TenantId, key: &EntityKey, version: Version) -> Result<RawDataRecord> {
        let records = lock(&self.records)?;
        records.get(&(tenant.clone(), key.clone()))
               .and_then(|versions| versions.get(&version))
               .cloned()
               .ok_or_else(|| StoreError::NotFound(format!("raw data {} v{}", key, version)))
    }

    async fn latest_before(&self, tenant: &TenantId, key: &EntityKey, version: Version)
                           -> Result<Option<RawDataRecord>> {
        let records = lock(&self.records)?;
        Ok(records.get(&(tenant.clone(), key.clone()))
                  .and_then(|versions| versions.range(..version).next_back())
                  .map(|(_, r)| r.clone()))
    }

    async fn latest(&self, tenant: &TenantId, key: &EntityKey) -> Result<Option<RawDataRecord>> {
        let records = lock(&self.records)?;
        Ok(records.get(&(tenant.clone(), key.clone()))
                  .and_then(|versions| versions.values().next_back())
                  .cloned())
    }
}

/// Outbox en memoria, en orden de inserción.
#[derive(Default)]
pub struct InMemoryOutboxRepository {
    entries: Mutex<Vec<OutboxEntry>>,
}

impl InMemoryOutboxRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserción síncrona usada por la unidad de trabajo de raw data.
    fn insert_locked(&self, entry: &OutboxEntry) -> Result<()> {
        let mut entries = lock(&self.entries)?;
        if entries.iter().any(|e| e.id == entry.id) {
            return Err(StoreError::Conflict(format!("outbox entry {} ya existe", entry.id)));
        }
        entries.push(entry.clone());
        Ok(())
    }

    /// Copia de todas las entradas (inspección en pruebas y demos).
    pub fn snapshot(&self) -> Vec<OutboxEntry> {
        lock(&self.entries).map(|e| e.clone()).unwrap_or_default()
    }

    fn with_entry<F>(&self, id: &Uuid, f: F) -> Result<()>
        where F: FnOnce(&mut OutboxEntry) -> Result<()>
    {
        let mut entries = lock(&self.entries)?;
        let entry = entries.iter_mut()
                           .find(|e| &e.id == id)
                           .ok_or_else(|| StoreError::NotFound(format!("outbox entry {}", id)))?;
        f(entry)
    }

    fn find_by_status(&self, status: OutboxStatus, event_type: Option<&str>, limit: usize) -> Result<Vec<OutboxEntry>> {
        let entries = lock(&self.entries)?;
        Ok(entries.iter()
                  .filter(|e| e.status == status)
                  .filter(|e| event_type.map_or(true, |t| e.event_type == t))
                  .take(limit)
                  .cloned()
                  .collect())
    }
}

#[async_trait]
impl OutboxRepository for InMemoryOutboxRepository {
    async fn insert(&self, entry: &OutboxEntry) -> Result<()> {
        self.insert_locked(entry)
    }

    async fn insert_all(&self, new_entries: &[OutboxEntry]) -> Result<()> {
        let mut entries = lock(&self.entries)?;
        if let Some(dup) = new_entries.iter().find(|n| entries.iter().any(|e| e.id == n.id)) {
            return Err(StoreError::Conflict(format!("outbox entry {} ya existe", dup.id)));
        }
        entries.extend(new_entries.iter().cloned());
        Ok(())
    }

    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        self.find_by_status(OutboxStatus::Pending, None, limit)
    }

    async fn find_pending_by_type(&self, event_type: &str, limit: usize) -> Result<Vec<OutboxEntry>> {
        self.find_by_status(OutboxStatus::Pending, Some(event_type), limit)
    }

    async fn find_failed(&self, limit: usize) -> Result<Vec<OutboxEntry>> {
        self.find_by_status(OutboxStatus::Failed, None, limit)
    }

    async fn get(&self, id: &Uuid) -> Result<OutboxEntry> {
        let entries = lock(&self.entries)?;
        entries.iter()
               .find(|e| &e.id == id)
               .cloned()
               .ok_or_else(|| StoreError::NotFound(format!("outbox entry {}", id)))
    }

    async fn mark_retrying(&self, id: &Uuid) -> Result<()> {
        self.with_entry(id, |e| {
                e.status = OutboxStatus::Retrying;
                e.retrying_since = Some(Utc::now());
                Ok(())
            })
    }

    async fn release_stale_retrying(&self, lease: Duration) -> Result<usize> {
        // Un lease que no cabe en chrono nunca vence.
        let Ok(lease) = chrono::Duration::from_std(lease) else { return Ok(0) };
        let Some(cutoff) = Utc::now().checked_sub_signed(lease) else { return Ok(0) };
        let mut entries = lock(&self.entries)?;
        let mut released = 0;
        for e in entries.iter_mut()
                        .filter(|e| e.status == OutboxStatus::Retrying)
                        .filter(|e| e.retrying_since.map_or(true, |t| t <= cutoff))
        {
            e.status = OutboxStatus::Pending;
            e.retrying_since = None;
            released += 1;
        }
        Ok(released)
    }

    async fn mark_processed(&self, ids: &[Uuid]) -> Result<()> {
        let mut entries = lock(&self.entries)?;
        if let Some(missing) = ids.iter().find(|id| !entries.iter().any(|e| &e.id == *id)) {
            return Err(StoreError::NotFound(format!("outbox entry {}", missing)));
        }
        let now = Utc::now();
        for e in entries.iter_mut().filter(|e| ids.contains(&e.id)) {
            e.status = OutboxStatus::Processed;
            e.processed_at = Some(now);
            e.retrying_since = None;
            e.last_error = None;
        }
        Ok(())
    }

    async fn mark_failed(&self, id: &Uuid, reason: &str) -> Result<()> {
        self.with_entry(id, |e| {
                e.status = OutboxStatus::Failed;
                e.retrying_since = None;
                e.retry_count = e.retry_count.saturating_add(1);
                e.last_error = Some(reason.to_string());
                Ok(())
            })
    }

    async fn reset_to_pending(&self, id: &Uuid) -> Result<()> {
        self.with_entry(id, |e| {
                if e.status != OutboxStatus::Failed {
                    return Err(StoreError::Conflict(format!("outbox entry {} está en {}, no en FAILED", e.id, e.status)));
                }
                if e.retry_count >= MAX_OUTBOX_RETRIES {
                    return Err(StoreError::RetryBudgetExhausted(format!("outbox entry {} ({} reintentos)",
                                                                        e.id, e.retry_count)));
                }
                e.status = OutboxStatus::Pending;
                Ok(())
            })
    }
}

/// Slices en memoria, con todas las revisiones de cada clave. Cuenta las
/// llamadas de escritura para poder verificar en pruebas que no hubo
/// recomputación.
#[derive(Default)]
pub struct InMemorySliceRepository {
    slices: Mutex<HashMap<(TenantId, SliceKey), BTreeMap<u32, SliceRecord>>>,
    put_calls: AtomicUsize,
}

impl InMemorySliceRepository {
    pub fn new() -> Self {
        Self::default()
    }

    /// Número de llamadas de escritura recibidas.
    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    /// Registros almacenados, contando cada revisión.
    pub fn len(&self) -> usize {
        lock(&self.slices).map(|s| s.values().map(|revs| revs.len()).sum()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type SliceStore = HashMap<(TenantId, SliceKey), BTreeMap<u32, SliceRecord>>;

fn current(slices: &SliceStore, tenant: &TenantId, key: &SliceKey) -> Option<SliceRecord> {
    slices.get(&(tenant.clone(), key.clone()))
          .and_then(|revs| revs.values().next_back())
          .cloned()
}

#[async_trait]
impl SliceRepository for InMemorySliceRepository {
    async fn put_all_idempotent(&self, batch: &[SliceRecord]) -> Result<PutOutcome> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let mut slices = lock(&self.slices)?;
        // Primero se valida el lote completo: o se escribe todo o nada.
        let mut pending: HashMap<(TenantId, SliceKey, u32), &SliceRecord> = HashMap::new();
        for s in batch {
            check_tenant(&s.tenant_id, &s.entity_key)?;
            let id = (s.tenant_id.clone(), s.key());
            let existing_hash = slices.get(&id)
                                      .and_then(|revs| revs.get(&s.revision))
                                      .map(|e| e.hash.as_str())
                                      .or_else(|| {
                                          pending.get(&(id.0.clone(), id.1.clone(), s.revision))
                                                 .map(|p| p.hash.as_str())
                                      });
            match existing_hash {
                Some(h) if h == s.hash => {}
                Some(h) => {
                    debug!("conflicto de slice {} r{}: {} != {}", id.1, s.revision, h, s.hash);
                    return Err(StoreError::Conflict(format!("slice {}: hash {} distinto del almacenado {}",
                                                            id.1, s.hash, h)));
                }
                None => {
                    pending.insert((id.0, id.1, s.revision), s);
                }
            }
        }
        if pending.is_empty() {
            return Ok(PutOutcome::AlreadyExists);
        }
        for ((tenant, key, revision), s) in pending {
            slices.entry((tenant, key)).or_default().insert(revision, s.clone());
        }
        Ok(PutOutcome::Inserted)
    }

    async fn put_revision(&self, batch: &[SliceRecord]) -> Result<RevisionOutcome> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let Some(first) = batch.first() else {
            return Err(StoreError::Other("lote de slices vacío".into()));
        };
        for s in batch {
            check_tenant(&s.tenant_id, &s.entity_key)?;
            if s.tenant_id != first.tenant_id || s.entity_key != first.entity_key || s.version != first.version {
                return Err(StoreError::Other(format!("el lote mezcla {} v{} con {} v{}",
                                                     first.entity_key, first.version, s.entity_key, s.version)));
            }
        }
        let mut slices = lock(&self.slices)?;
        let highest = slices.iter()
                            .filter(|((t, k), _)| {
                                t == &first.tenant_id && k.entity_key == first.entity_key && k.version == first.version
                            })
                            .filter_map(|(_, revs)| revs.keys().next_back().copied())
                            .max();
        if let Some(r) = highest {
            let unchanged = batch.iter().all(|s| {
                                           current(&slices, &s.tenant_id, &s.key()).map_or(false, |c| c.same_content(s))
                                       });
            if unchanged {
                return Ok(RevisionOutcome::Unchanged(r));
            }
        }
        let revision = highest.map_or(0, |r| r + 1);
        for s in batch {
            slices.entry((s.tenant_id.clone(), s.key()))
                  .or_default()
                  .insert(revision, s.clone().with_revision(revision));
        }
        debug!("{} v{}: revisión {} publicada ({} slices)", first.entity_key, first.version, revision, batch.len());
        Ok(RevisionOutcome::Published(revision))
    }

    async fn batch_get(&self, tenant: &TenantId, keys: &[SliceKey], include_tombstones: bool)
                       -> Result<Vec<SliceRecord>> {
        let slices = lock(&self.slices)?;
        let mut found = Vec::with_capacity(keys.len());
        let mut missing = Vec::new();
        for k in keys {
            match current(&slices, tenant, k) {
                Some(s) if include_tombstones || !s.is_tombstoned() => found.push(s),
                _ => missing.push(k.to_string()),
            }
        }
        if !missing.is_empty() {
            return Err(StoreError::NotFound(format!("slices: {}", missing.join(", "))));
        }
        Ok(found)
    }

    async fn get_version(&self, tenant: &TenantId, key: &EntityKey, version: Version) -> Result<Vec<SliceRecord>> {
        let slices = lock(&self.slices)?;
        let mut out: Vec<SliceRecord> =
            slices.iter()
                  .filter(|((t, k), _)| t == tenant && &k.entity_key == key && k.version == version)
                  .filter_map(|(_, revs)| revs.values().next_back().cloned())
                  .collect();
        out.sort_by(|a, b| a.slice_type.cmp(&b.slice_type));
        Ok(out)
    }
}

/// Índice invertido en memoria: por entidad dueña se guarda la versión y
/// revisión que produjeron sus entradas vigentes.
#[derive(Default)]
pub struct InMemoryInvertedIndexRepository {
    owners: Mutex<HashMap<EntityId, ((Version, u32), Vec<InvertedIndexEntry>)>>,
}

impl InMemoryInvertedIndexRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl InvertedIndexRepository for InMemoryInvertedIndexRepository {
    async fn put_all_idempotent(&self,
                                tenant: &TenantId,
                                owner: &EntityKey,
                                version: Version,
                                revision: u32,
                                entries: &[InvertedIndexEntry])
                                -> Result<IndexWriteOutcome> {
        check_tenant(tenant, owner)?;
        if let Some(bad) = entries.iter().find(|e| &e.tenant_id != tenant || &e.target_entity_key != owner) {
            return Err(StoreError::Other(format!("entrada de índice {} no pertenece a {}",
                                                 bad.index_type, owner)));
        }
        let mut sorted = entries.to_vec();
        sorted.sort();
        sorted.dedup();
        let mut owners = lock(&self.owners)?;
        let id = (tenant.clone(), owner.clone());
        let position = (version, revision);
        match owners.get(&id) {
            Some((stored, _)) if *stored > position => return Ok(IndexWriteOutcome::Stale),
            Some((stored, current)) if *stored == position => {
                if *current == sorted {
                    return Ok(IndexWriteOutcome::Unchanged);
                }
                return Err(StoreError::Conflict(format!("índice de {} v{} r{}: entradas distintas de las almacenadas",
                                                        owner, version, revision)));
            }
            _ => {}
        }
        owners.insert(id, (position, sorted));
        Ok(IndexWriteOutcome::Superseded)
    }

    async fn query_by_index_type(&self, tenant: &TenantId, index_type: &str, value: &str)
                                 -> Result<Vec<InvertedIndexEntry>> {
        let owners = lock(&self.owners)?;
        let mut out: Vec<InvertedIndexEntry> =
            owners.iter()
                  .filter(|((t, _), _)| t == tenant)
                  .flat_map(|(_, (_, entries))| entries.iter())
                  .filter(|e| e.index_type == index_type && e.index_value == value)
                  .cloned()
                  .collect();
        out.sort();
        Ok(out)
    }

    async fn entries_for_owner(&self, tenant: &TenantId, owner: &EntityKey) -> Result<Vec<InvertedIndexEntry>> {
        let owners = lock(&self.owners)?;
        Ok(owners.get(&(tenant.clone(), owner.clone()))
                 .map(|(_, entries)| entries.clone())
                 .unwrap_or_default())
    }
}
