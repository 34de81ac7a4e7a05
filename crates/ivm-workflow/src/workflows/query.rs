use crate::errors::{Result, WorkflowError};
use crate::workflows::slicing::ensure_tenant;
use indexmap::IndexMap;
use ivm_domain::{ContractRef, EntityKey, MissingPolicy, SliceKey, SliceRecord, TenantId, Version};
use ivm_store::{ContractRegistry, SliceRepository, StoreError};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::sync::Arc;

/// Respuesta de una vista: datos y hash de cada slice requerido.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewResponse {
  pub entity_key: EntityKey,
  pub version: Version,
  pub slices: IndexMap<String, JsonValue>,
  pub hashes: IndexMap<String, String>,
  /// Sólo no vacío con la política `Partial`.
  #[serde(default, skip_serializing_if = "Vec::is_empty")]
  pub missing: Vec<String>,
}

#[derive(Clone)]
pub struct QueryWorkflow {
  slice_repo: Arc<dyn SliceRepository>,
  registry: Arc<dyn ContractRegistry>,
}

impl QueryWorkflow {
  pub fn new(slice_repo: Arc<dyn SliceRepository>, registry: Arc<dyn ContractRegistry>) -> Self {
    Self { slice_repo, registry }
  }

  /// Devuelve los slices que exige la vista. Con `FailClosed` basta un
  /// slice ausente o borrado para devolver `MissingSlice`.
  pub async fn query_view(&self,
                          tenant: &TenantId,
                          key: &EntityKey,
                          version: Version,
                          view: &ContractRef,
                          include_tombstones: bool)
                          -> Result<ViewResponse> {
    let definition = self.registry.load_view_definition(view).await?;
    let (found, missing) = self.fetch(tenant, key, version, &definition.required_slices, include_tombstones)
                               .await?;
    if !missing.is_empty() && definition.missing_policy == MissingPolicy::FailClosed {
      return Err(WorkflowError::MissingSlice { entity_key: key.to_string(), version, missing });
    }
    debug!("vista {} sobre {} v{}: {} slices, {} ausentes", view, key, version, found.len(), missing.len());
    Ok(build_response(key, version, &definition.required_slices, found, missing))
  }

  /// Lectura directa de slices sin vista: siempre falla cerrado.
  pub async fn get_slices(&self,
                          tenant: &TenantId,
                          key: &EntityKey,
                          version: Version,
                          slice_types: &[String],
                          include_tombstones: bool)
                          -> Result<ViewResponse> {
    if slice_types.is_empty() {
      return Err(WorkflowError::Validation("se requiere al menos un tipo de slice".into()));
    }
    let (found, missing) = self.fetch(tenant, key, version, slice_types, include_tombstones).await?;
    if !missing.is_empty() {
      return Err(WorkflowError::MissingSlice { entity_key: key.to_string(), version, missing });
    }
    Ok(build_response(key, version, slice_types, found, missing))
  }

  async fn fetch(&self,
                 tenant: &TenantId,
                 key: &EntityKey,
                 version: Version,
                 slice_types: &[String],
                 include_tombstones: bool)
                 -> Result<(Vec<SliceRecord>, Vec<String>)> {
    ensure_tenant(tenant, key)?;
    let keys: Vec<SliceKey> = slice_types.iter().map(|t| SliceKey::new(key, version, t)).collect();
    match self.slice_repo.batch_get(tenant, &keys, include_tombstones).await {
      Ok(found) => Ok((found, Vec::new())),
      // NotFound: se relee la versión completa para saber qué falta.
      Err(StoreError::NotFound(_)) => {
        let stored = self.slice_repo.get_version(tenant, key, version).await?;
        let present: HashMap<&str, &SliceRecord> =
          stored.iter()
                .filter(|s| include_tombstones || !s.is_tombstoned())
                .map(|s| (s.slice_type.as_str(), s))
                .collect();
        let found = slice_types.iter().filter_map(|t| present.get(t.as_str()).map(|s| (*s).clone())).collect();
        let missing = slice_types.iter().filter(|t| !present.contains_key(t.as_str())).cloned().collect();
        Ok((found, missing))
      }
      Err(e) => Err(e.into()),
    }
  }
}

fn build_response(key: &EntityKey,
                  version: Version,
                  order: &[String],
                  found: Vec<SliceRecord>,
                  missing: Vec<String>)
                  -> ViewResponse {
  let mut by_type: HashMap<String, SliceRecord> = found.into_iter().map(|s| (s.slice_type.clone(), s)).collect();
  let mut slices = IndexMap::new();
  let mut hashes = IndexMap::new();
  for t in order {
    if let Some(record) = by_type.remove(t) {
      hashes.insert(t.clone(), record.hash);
      slices.insert(t.clone(), record.data);
    }
  }
  ViewResponse { entity_key: key.clone(),
                 version,
                 slices,
                 hashes,
                 missing }
}
