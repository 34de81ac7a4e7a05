use crate::errors::Result;
use ivm_domain::path::{parse_path, select};
use ivm_domain::{EntityKey, IndexSpec, InvertedIndexEntry, RuleSetContract, SliceRecord, RAW_SOURCE};
use indexmap::IndexSet;
use log::warn;
use serde_json::Value as JsonValue;

/// Valor canónico con el que se escribe y se consulta el índice: recortado
/// y en minúsculas.
pub fn canonical_index_value(raw: &str) -> String {
  raw.trim().to_lowercase()
}

/// Tipo del índice inverso de `entity_type` hacia `upstream_type`,
/// p.ej. `product_by_brand`.
pub fn reverse_index_type(entity_type: &str, upstream_type: &str) -> String {
  format!("{}_by_{}", entity_type.trim().to_lowercase(), upstream_type.trim().to_lowercase())
}

/// Construye las entradas de índice directas e inversas de una entidad.
pub struct IndexBuilder;

impl IndexBuilder {
  /// Evalúa cada `IndexSpec` del RuleSet sobre el slice origen (o el payload
  /// crudo) y produce entradas ordenadas y sin duplicados.
  pub fn build(entity_key: &EntityKey,
               raw_payload: &JsonValue,
               slices: &[SliceRecord],
               rule_set: &RuleSetContract)
               -> Result<Vec<InvertedIndexEntry>> {
    let mut out = Vec::new();
    for spec in &rule_set.indexes {
      let (source, source_type) = match &spec.source_slice {
        None => (raw_payload, RAW_SOURCE),
        Some(name) => match slices.iter().find(|s| &s.slice_type == name && !s.is_tombstoned()) {
          Some(slice) => (&slice.data, name.as_str()),
          None => continue,
        },
      };
      let tokens = parse_path(&spec.selector)?;
      for (canonical, raw) in index_values(source, &tokens) {
        out.push(InvertedIndexEntry { tenant_id: entity_key.tenant().clone(),
                                      index_type: spec.index_type.clone(),
                                      index_value: canonical.clone(),
                                      target_entity_key: entity_key.clone(),
                                      ref_entity_key: None,
                                      source_slice_type: source_type.to_string() });
        if let Some(entry) = reverse_entry(entity_key, spec, &canonical, &raw, source_type) {
          out.push(entry);
        }
      }
    }
    out.sort();
    out.dedup();
    Ok(out)
  }
}

fn reverse_entry(entity_key: &EntityKey,
                 spec: &IndexSpec,
                 canonical: &str,
                 raw: &str,
                 source_type: &str)
                 -> Option<InvertedIndexEntry> {
  let upstream = spec.references.as_deref()?;
  match EntityKey::new(upstream, entity_key.tenant(), raw) {
    Ok(ref_key) => Some(InvertedIndexEntry { tenant_id: entity_key.tenant().clone(),
                                             index_type: reverse_index_type(entity_key.entity_type(), upstream),
                                             index_value: canonical.to_string(),
                                             target_entity_key: entity_key.clone(),
                                             ref_entity_key: Some(ref_key),
                                             source_slice_type: source_type.to_string() }),
    Err(e) => {
      warn!("{}: referencia '{}' a {} descartada: {}", entity_key, raw, upstream, e);
      None
    }
  }
}

/// Pares (canónico, original recortado) de los escalares alcanzados por el
/// selector. Los arrays se aplanan; nulos, vacíos y objetos se ignoran.
fn index_values(source: &JsonValue, tokens: &[String]) -> Vec<(String, String)> {
  let mut seen = IndexSet::new();
  let mut out = Vec::new();
  let mut push = |raw: String| {
    let canonical = canonical_index_value(&raw);
    if !canonical.is_empty() && seen.insert(canonical.clone()) {
      out.push((canonical, raw.trim().to_string()));
    }
  };
  for value in select(source, tokens) {
    let scalars: Vec<&JsonValue> = match value {
      JsonValue::Array(items) => items.iter().collect(),
      other => vec![other],
    };
    for v in scalars {
      match v {
        JsonValue::String(s) => push(s.clone()),
        JsonValue::Number(n) => push(n.to_string()),
        JsonValue::Bool(b) => push(b.to_string()),
        _ => {}
      }
    }
  }
  out
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn index_values_flatten_and_dedupe() {
    let v = json!({"tags": [" Red ", "red", 7, null, {"x": 1}, ""], "flag": true});
    let tokens = parse_path("$.tags").unwrap();
    let got: Vec<String> = index_values(&v, &tokens).into_iter().map(|(c, _)| c).collect();
    assert_eq!(got, vec!["red", "7"]);
  }

  #[test]
  fn reverse_type_is_lowercase() {
    assert_eq!(reverse_index_type("PRODUCT", "Brand"), "product_by_brand");
  }
}
