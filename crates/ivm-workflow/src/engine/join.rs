use crate::errors::{Result, WorkflowError};
use ivm_domain::path::{parse_path, select};
use ivm_domain::{EntityKey, JoinSpec, TenantId};
use ivm_store::RawDataRepository;
use log::{debug, warn};
use serde_json::{Map, Value as JsonValue};
use std::collections::HashMap;
use std::sync::Arc;

/// Clave bajo la que se embeben los joins en el payload combinado.
pub const JOINS_KEY: &str = "_joins";

/// Resuelve los joins declarados por los slices: lee los ids de la entidad
/// referenciada en el payload y carga su último raw data.
#[derive(Clone)]
pub struct JoinExecutor {
  raw_repo: Arc<dyn RawDataRepository>,
}

impl JoinExecutor {
  pub fn new(raw_repo: Arc<dyn RawDataRepository>) -> Self {
    Self { raw_repo }
  }

  /// Resuelve cada join una vez. Los joins opcionales sin resolver no
  /// aparecen en el resultado; uno requerido sin resolver aborta con
  /// `JoinFailed`. Los errores de almacenamiento se propagan siempre.
  pub async fn resolve_all(&self,
                           tenant: &TenantId,
                           payload: &JsonValue,
                           joins: &[&JoinSpec])
                           -> Result<HashMap<JoinSpec, JsonValue>> {
    let mut out = HashMap::new();
    for join in joins {
      if out.contains_key(*join) {
        continue;
      }
      match self.resolve(tenant, payload, join).await? {
        Ok(value) => {
          out.insert((*join).clone(), value);
        }
        Err(reason) if join.required => {
          return Err(WorkflowError::JoinFailed { join: join.name.clone(), reason });
        }
        Err(reason) => {
          debug!("join opcional '{}' omitido: {}", join.name, reason);
        }
      }
    }
    Ok(out)
  }

  /// El `Err` interno describe por qué el join no se resolvió.
  async fn resolve(&self,
                   tenant: &TenantId,
                   payload: &JsonValue,
                   join: &JoinSpec)
                   -> Result<std::result::Result<JsonValue, String>> {
    let tokens = parse_path(&join.source_path)?;
    let selected = select(payload, &tokens);
    let (ids, is_array) = match selected.as_slice() {
      [] => return Ok(Err(format!("sin valor en {}", join.source_path))),
      [JsonValue::Array(items)] => (items.iter().collect::<Vec<_>>(), true),
      [single] => (vec![*single], false),
      many => (many.to_vec(), true),
    };

    let mut docs = Vec::with_capacity(ids.len());
    for id in ids {
      let local_id = match id {
        JsonValue::String(s) if !s.trim().is_empty() => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        other => return Ok(Err(format!("id no utilizable en {}: {}", join.source_path, other))),
      };
      let key = match EntityKey::new(&join.target_entity_type, tenant, &local_id) {
        Ok(k) => k,
        Err(e) => return Ok(Err(e.to_string())),
      };
      match self.raw_repo.latest(tenant, &key).await? {
        Some(record) => docs.push(record.payload),
        None => {
          warn!("join '{}': entidad referenciada {} inexistente", join.name, key);
          return Ok(Err(format!("entidad {} inexistente", key)));
        }
      }
    }
    Ok(Ok(if is_array { JsonValue::Array(docs) } else { docs.remove(0) }))
  }
}

/// Payload crudo con los joins resueltos bajo `_joins.<nombre>`.
pub fn merge_joins(payload: &JsonValue, resolved: &HashMap<&str, JsonValue>) -> JsonValue {
  let mut merged = payload.clone();
  if resolved.is_empty() {
    return merged;
  }
  if let JsonValue::Object(map) = &mut merged {
    let joins: Map<String, JsonValue> = resolved.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
    map.insert(JOINS_KEY.to_string(), JsonValue::Object(joins));
  }
  merged
}
