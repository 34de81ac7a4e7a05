use crate::engine::{diff, impacted_slices, IndexBuilder, JoinExecutor, SlicingEngine};
use crate::errors::{Result, WorkflowError};
use ivm_domain::{ContractRef, EntityKey, RawDataRecord, RuleSetContract, SliceRecord, TenantId, Version};
use ivm_store::{ContractRegistry, IndexWriteOutcome, InvertedIndexRepository, RawDataRepository, RevisionOutcome,
                SliceRepository};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SlicingMode {
  Full,
  Incremental,
  /// Revisión nueva de una versión ya troceada (cambio en un join).
  Refresh,
  Tombstone,
}

/// Resumen de una ejecución del workflow de troceado.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlicingOutcome {
  pub mode: SlicingMode,
  pub entity_key: EntityKey,
  pub version: Version,
  /// Revisión vigente de los slices de `version` tras la ejecución.
  pub revision: u32,
  /// Versión anterior usada como base del diff, si la hubo.
  pub prior_version: Option<Version>,
  pub rule_set: ContractRef,
  pub slices: Vec<SliceRecord>,
  pub recomputed: Vec<String>,
  pub copied: Vec<String>,
  /// Algún slice difiere (por hash) del de la versión anterior.
  pub changed: bool,
  pub index_entries: usize,
}

/// Orquesta raw data -> slices -> índices para una entidad y versión.
///
/// No guarda estado entre llamadas: todo pasa por los puertos inyectados,
/// por lo que varias instancias (o tareas) pueden ejecutar en paralelo y
/// converger gracias a las escrituras idempotentes.
#[derive(Clone)]
pub struct SlicingWorkflow {
  raw_repo: Arc<dyn RawDataRepository>,
  slice_repo: Arc<dyn SliceRepository>,
  index_repo: Arc<dyn InvertedIndexRepository>,
  registry: Arc<dyn ContractRegistry>,
  engine: SlicingEngine,
}

impl SlicingWorkflow {
  pub fn new(raw_repo: Arc<dyn RawDataRepository>,
             slice_repo: Arc<dyn SliceRepository>,
             index_repo: Arc<dyn InvertedIndexRepository>,
             registry: Arc<dyn ContractRegistry>)
             -> Self {
    let engine = SlicingEngine::new(JoinExecutor::new(raw_repo.clone()));
    Self { raw_repo,
           slice_repo,
           index_repo,
           registry,
           engine }
  }

  /// Recalcula todos los slices de la versión. Si la versión ya está
  /// troceada con este RuleSet (entrega repetida) devuelve lo publicado.
  pub async fn execute_full(&self, tenant: &TenantId, key: &EntityKey, version: Version) -> Result<SlicingOutcome> {
    ensure_tenant(tenant, key)?;
    let record = self.raw_repo.get(tenant, key, version).await?;
    let rule_set = self.registry.rule_set_for_entity_type(key.entity_type()).await?;
    let prior = self.raw_repo.latest_before(tenant, key, version).await?;
    let prior_slices = match &prior {
      Some(p) => self.slice_repo.get_version(tenant, key, p.version).await?,
      None => Vec::new(),
    };
    let prior_version = prior.map(|p| p.version);
    if let Some(stored) = self.already_sliced(tenant, key, version, &rule_set).await? {
      let changed = has_changed(&prior_slices, &stored);
      return Ok(published(SlicingMode::Full, key, version, prior_version, &rule_set, stored, changed));
    }

    let slices = self.engine.build_all(&record, &rule_set).await?;
    let recomputed = slices.iter().map(|s| s.slice_type.clone()).collect();
    self.finish(SlicingMode::Full,
                &record,
                &rule_set,
                prior_version,
                &prior_slices,
                slices,
                recomputed,
                Vec::new())
        .await
  }

  /// FULL si no hay versión anterior; si la hay, INCREMENTAL: sólo se
  /// recalculan los slices impactados por el diff y el resto se copia.
  pub async fn execute_auto(&self, tenant: &TenantId, key: &EntityKey, version: Version) -> Result<SlicingOutcome> {
    ensure_tenant(tenant, key)?;
    let Some(prior) = self.raw_repo.latest_before(tenant, key, version).await? else {
      return self.execute_full(tenant, key, version).await;
    };
    let record = self.raw_repo.get(tenant, key, version).await?;
    let rule_set = self.registry.rule_set_for_entity_type(key.entity_type()).await?;
    let prior_slices = self.slice_repo.get_version(tenant, key, prior.version).await?;
    if let Some(stored) = self.already_sliced(tenant, key, version, &rule_set).await? {
      let changed = has_changed(&prior_slices, &stored);
      return Ok(published(SlicingMode::Incremental, key, version, Some(prior.version), &rule_set, stored, changed));
    }

    let change_set = diff(&prior.payload, &record.payload);
    let analysis = impacted_slices(&change_set, &rule_set)?;
    debug!("{} v{} -> v{}: {} rutas cambiadas, impactados {:?}",
           key,
           prior.version,
           version,
           change_set.len(),
           analysis.impacted);

    let by_type: HashMap<&str, &SliceRecord> = prior_slices.iter().map(|s| (s.slice_type.as_str(), s)).collect();
    let mut to_recompute = Vec::new();
    let mut copies = Vec::new();
    for def in &rule_set.slices {
      let reusable = by_type.get(def.slice_type.as_str())
                            .filter(|s| !s.is_tombstoned())
                            .filter(|s| s.rule_set_id == rule_set.id && s.rule_set_version == rule_set.version);
      match reusable {
        Some(prev) if !analysis.is_impacted(&def.slice_type) => copies.push(prev.copy_forward(version)),
        _ => to_recompute.push(def.slice_type.clone()),
      }
    }

    let built = if to_recompute.is_empty() {
      Vec::new()
    } else {
      self.engine.build_selected(&record, &rule_set, &to_recompute).await?
    };
    let copied: Vec<String> = copies.iter().map(|s| s.slice_type.clone()).collect();

    // Orden declarado: cada tipo sale de `built` o de `copies`.
    let mut pool: HashMap<String, SliceRecord> =
      built.into_iter().chain(copies).map(|s| (s.slice_type.clone(), s)).collect();
    let slices: Vec<SliceRecord> = rule_set.slices.iter().filter_map(|d| pool.remove(&d.slice_type)).collect();

    self.finish(SlicingMode::Incremental,
                &record,
                &rule_set,
                Some(prior.version),
                &prior_slices,
                slices,
                to_recompute,
                copied)
        .await
  }

  /// Re-trocea la última versión de una entidad cuyo payload no cambió pero
  /// sí algo de lo que depende (joins). No crea versiones de raw data:
  /// publica una revisión nueva de los slices de esa versión sólo si el
  /// contenido difiere del vigente, así que repetirlo es un no-op.
  pub async fn reslice(&self, tenant: &TenantId, key: &EntityKey) -> Result<SlicingOutcome> {
    ensure_tenant(tenant, key)?;
    let record = self.raw_repo
                     .latest(tenant, key)
                     .await?
                     .ok_or_else(|| WorkflowError::NotFound(format!("raw data de {}", key)))?;
    let current = self.slice_repo.get_version(tenant, key, record.version).await?;
    if current.is_empty() {
      // Aún sin trocear: se trocea ya con los joins actuales.
      return self.execute_full(tenant, key, record.version).await;
    }
    let rule_set = self.registry.rule_set_for_entity_type(key.entity_type()).await?;
    let prior_version = self.raw_repo.latest_before(tenant, key, record.version).await?.map(|p| p.version);
    if current.iter().any(|s| s.is_tombstoned()) {
      debug!("{} v{}: borrado, no se re-trocea", key, record.version);
      return Ok(published(SlicingMode::Tombstone, key, record.version, prior_version, &rule_set, current, false));
    }

    let built = self.engine.build_all(&record, &rule_set).await?;
    let revision = match self.slice_repo.put_revision(&built).await? {
      RevisionOutcome::Unchanged(r) => {
        debug!("{} v{}: la revisión {} ya refleja los joins", key, record.version, r);
        return Ok(published(SlicingMode::Refresh, key, record.version, prior_version, &rule_set, current, false));
      }
      RevisionOutcome::Published(r) => r,
    };
    let slices: Vec<SliceRecord> = built.into_iter().map(|s| s.with_revision(revision)).collect();
    let index_entries = self.write_index(&record, revision, &slices, &rule_set).await?;
    let changed = has_changed(&current, &slices);
    info!("{} v{} r{}: re-troceado por dependencias, cambiado={}", key, record.version, revision, changed);
    Ok(SlicingOutcome { mode: SlicingMode::Refresh,
                        entity_key: key.clone(),
                        version: record.version,
                        revision,
                        prior_version,
                        rule_set: rule_set.contract_ref(),
                        recomputed: slices.iter().map(|s| s.slice_type.clone()).collect(),
                        slices,
                        copied: Vec::new(),
                        changed,
                        index_entries })
  }

  /// Borrado lógico: publica un tombstone por cada slice declarado en
  /// `version`, encima de lo que hubiera, y deja la entidad sin entradas de
  /// índice. Las versiones anteriores no se tocan.
  pub async fn tombstone(&self,
                         tenant: &TenantId,
                         key: &EntityKey,
                         version: Version,
                         reason: &str)
                         -> Result<SlicingOutcome> {
    ensure_tenant(tenant, key)?;
    let rule_set = self.registry.rule_set_for_entity_type(key.entity_type()).await?;
    let prior_version = self.raw_repo.latest_before(tenant, key, version).await?.map(|p| p.version);
    let marks: Vec<SliceRecord> =
      rule_set.slices
              .iter()
              .map(|d| SliceRecord::tombstone(key, version, &d.slice_type, reason, &rule_set.id, rule_set.version))
              .collect();
    let outcome = self.slice_repo.put_revision(&marks).await?;
    let revision = outcome.revision();
    let slices: Vec<SliceRecord> = marks.into_iter().map(|s| s.with_revision(revision)).collect();
    self.index_repo.put_all_idempotent(tenant, key, version, revision, &[]).await?;
    info!("{} v{} r{}: tombstone ({})", key, version, revision, reason);
    Ok(SlicingOutcome { mode: SlicingMode::Tombstone,
                        entity_key: key.clone(),
                        version,
                        revision,
                        prior_version,
                        rule_set: rule_set.contract_ref(),
                        recomputed: slices.iter().map(|s| s.slice_type.clone()).collect(),
                        slices,
                        copied: Vec::new(),
                        changed: matches!(outcome, RevisionOutcome::Published(_)),
                        index_entries: 0 })
  }

  /// Slices ya publicados de la versión: completos para este RuleSet o
  /// borrados. `None` si hay que trocear.
  async fn already_sliced(&self,
                          tenant: &TenantId,
                          key: &EntityKey,
                          version: Version,
                          rule_set: &RuleSetContract)
                          -> Result<Option<Vec<SliceRecord>>> {
    let stored = self.slice_repo.get_version(tenant, key, version).await?;
    if stored.is_empty() {
      return Ok(None);
    }
    let tombstoned = stored.iter().any(|s| s.is_tombstoned());
    let complete = rule_set.slices.iter().all(|d| {
                                             stored.iter().any(|s| {
                                                            s.slice_type == d.slice_type
                                                            && s.rule_set_id == rule_set.id
                                                            && s.rule_set_version == rule_set.version
                                                          })
                                           });
    Ok((tombstoned || complete).then_some(stored))
  }

  async fn write_index(&self,
                       record: &RawDataRecord,
                       revision: u32,
                       slices: &[SliceRecord],
                       rule_set: &RuleSetContract)
                       -> Result<usize> {
    let key = &record.entity_key;
    let entries = IndexBuilder::build(key, &record.payload, slices, rule_set)?;
    match self.index_repo
              .put_all_idempotent(&record.tenant_id, key, record.version, revision, &entries)
              .await?
    {
      IndexWriteOutcome::Stale => debug!("{} v{}: índice ya escrito por una versión posterior", key, record.version),
      IndexWriteOutcome::Superseded | IndexWriteOutcome::Unchanged => {}
    }
    Ok(entries.len())
  }

  #[allow(clippy::too_many_arguments)]
  async fn finish(&self,
                  mode: SlicingMode,
                  record: &RawDataRecord,
                  rule_set: &RuleSetContract,
                  prior_version: Option<Version>,
                  prior_slices: &[SliceRecord],
                  slices: Vec<SliceRecord>,
                  recomputed: Vec<String>,
                  copied: Vec<String>)
                  -> Result<SlicingOutcome> {
    let key = &record.entity_key;
    self.slice_repo.put_all_idempotent(&slices).await?;
    let index_entries = self.write_index(record, 0, &slices, rule_set).await?;

    let changed = has_changed(prior_slices, &slices);
    info!("{} v{} {:?}: {} recalculados, {} copiados, cambiado={}",
          key,
          record.version,
          mode,
          recomputed.len(),
          copied.len(),
          changed);
    Ok(SlicingOutcome { mode,
                        entity_key: key.clone(),
                        version: record.version,
                        revision: 0,
                        prior_version,
                        rule_set: rule_set.contract_ref(),
                        slices,
                        recomputed,
                        copied,
                        changed,
                        index_entries })
  }
}

/// Resultado sin escrituras: lo vigente de la versión, en orden declarado.
fn published(mode: SlicingMode,
             key: &EntityKey,
             version: Version,
             prior_version: Option<Version>,
             rule_set: &RuleSetContract,
             stored: Vec<SliceRecord>,
             changed: bool)
             -> SlicingOutcome {
  let mode = if stored.iter().any(|s| s.is_tombstoned()) { SlicingMode::Tombstone } else { mode };
  let revision = stored.iter().map(|s| s.revision).max().unwrap_or(0);
  let mut by_type: HashMap<String, SliceRecord> = stored.into_iter().map(|s| (s.slice_type.clone(), s)).collect();
  let mut slices: Vec<SliceRecord> = rule_set.slices.iter().filter_map(|d| by_type.remove(&d.slice_type)).collect();
  let mut rest: Vec<SliceRecord> = by_type.into_values().collect();
  rest.sort_by(|a, b| a.slice_type.cmp(&b.slice_type));
  slices.extend(rest);
  SlicingOutcome { mode,
                   entity_key: key.clone(),
                   version,
                   revision,
                   prior_version,
                   rule_set: rule_set.contract_ref(),
                   slices,
                   recomputed: Vec::new(),
                   copied: Vec::new(),
                   changed,
                   index_entries: 0 }
}

fn has_changed(prior: &[SliceRecord], current: &[SliceRecord]) -> bool {
  if prior.len() != current.len() {
    return true;
  }
  let hashes: HashMap<&str, &str> = prior.iter().map(|s| (s.slice_type.as_str(), s.hash.as_str())).collect();
  current.iter().any(|s| hashes.get(s.slice_type.as_str()) != Some(&s.hash.as_str()))
}

pub(crate) fn ensure_tenant(tenant: &TenantId, key: &EntityKey) -> Result<()> {
  if key.tenant() != tenant {
    return Err(WorkflowError::Validation(format!("{} no pertenece al tenant {}", key, tenant)));
  }
  Ok(())
}
