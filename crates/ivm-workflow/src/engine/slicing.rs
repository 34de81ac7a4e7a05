use crate::engine::join::{merge_joins, JoinExecutor};
use crate::errors::{Result, WorkflowError};
use ivm_domain::path::{parse_path, pointer_get, pointer_set};
use ivm_domain::{BuildRule, FieldMapping, JoinSpec, RawDataRecord, RuleSetContract, SliceDefinition, SliceRecord,
                 TransformOp};
use log::debug;
use rayon::prelude::*;
use serde_json::{json, Map, Value as JsonValue};
use std::collections::HashMap;

/// Motor de troceado: ejecuta las reglas de un RuleSet sobre el payload de
/// una entidad (más sus joins) y produce los slices.
///
/// La resolución de joins es la única parte asíncrona; la evaluación de
/// reglas y el hash son CPU puro y se reparten con rayon conservando el
/// orden declarado.
#[derive(Clone)]
pub struct SlicingEngine {
  joins: JoinExecutor,
}

impl SlicingEngine {
  pub fn new(joins: JoinExecutor) -> Self {
    Self { joins }
  }

  /// Modo FULL: todos los slices del RuleSet, en orden declarado.
  pub async fn build_all(&self, record: &RawDataRecord, rule_set: &RuleSetContract) -> Result<Vec<SliceRecord>> {
    let defs: Vec<&SliceDefinition> = rule_set.slices.iter().collect();
    self.build(record, rule_set, &defs).await
  }

  /// Sólo los tipos indicados (modo INCREMENTAL). Un tipo no declarado es un
  /// error de validación.
  pub async fn build_selected(&self,
                              record: &RawDataRecord,
                              rule_set: &RuleSetContract,
                              slice_types: &[String])
                              -> Result<Vec<SliceRecord>> {
    if let Some(unknown) = slice_types.iter().find(|t| rule_set.slice(t).is_none()) {
      return Err(WorkflowError::Validation(format!("RuleSet {} no declara el slice {}", rule_set.id, unknown)));
    }
    let defs: Vec<&SliceDefinition> = rule_set.slices
                                              .iter()
                                              .filter(|d| slice_types.contains(&d.slice_type))
                                              .collect();
    self.build(record, rule_set, &defs).await
  }

  async fn build(&self,
                 record: &RawDataRecord,
                 rule_set: &RuleSetContract,
                 defs: &[&SliceDefinition])
                 -> Result<Vec<SliceRecord>> {
    let joins: Vec<&JoinSpec> = defs.iter().flat_map(|d| d.joins.iter()).collect();
    let resolved = self.joins.resolve_all(&record.tenant_id, &record.payload, &joins).await?;

    let slices = defs.par_iter()
                     .map(|def| -> Result<SliceRecord> {
                       let own: HashMap<&str, JsonValue> =
                         def.joins
                            .iter()
                            .filter_map(|j| resolved.get(j).map(|v| (j.name.as_str(), v.clone())))
                            .collect();
                       let merged = merge_joins(&record.payload, &own);
                       let data = apply_rule(&def.rule, &merged, &own)?;
                       Ok(SliceRecord::new(&record.entity_key,
                                           record.version,
                                           &def.slice_type,
                                           data,
                                           &rule_set.id,
                                           rule_set.version))
                     })
                     .collect::<Result<Vec<SliceRecord>>>()?;
    debug!("{} v{}: {} slices construidos", record.entity_key, record.version, slices.len());
    Ok(slices)
  }
}

/// Aplica una regla de construcción. Despacho cerrado por `match`.
pub fn apply_rule(rule: &BuildRule, payload: &JsonValue, joins: &HashMap<&str, JsonValue>) -> Result<JsonValue> {
  match rule {
    BuildRule::PassThrough { paths } => pass_through(payload, paths),
    BuildRule::Transform { fields } => {
      let mut out = Map::new();
      for (name, mapping) in fields {
        if let Some(v) = transform_field(payload, mapping)? {
          out.insert(name.clone(), v);
        }
      }
      Ok(JsonValue::Object(out))
    }
    BuildRule::JoinMerge { base_paths, joins: names } => {
      let mut out = pass_through(payload, base_paths)?;
      for name in names {
        if let Some(doc) = joins.get(name.as_str()) {
          pointer_set(&mut out, std::slice::from_ref(name), doc.clone());
        }
      }
      Ok(out)
    }
  }
}

fn pass_through(payload: &JsonValue, paths: &[String]) -> Result<JsonValue> {
  let mut out = JsonValue::Object(Map::new());
  for p in paths {
    let tokens = parse_path(p)?;
    if tokens.is_empty() {
      return Ok(payload.clone());
    }
    if let Some(v) = pointer_get(payload, &tokens) {
      pointer_set(&mut out, &tokens, v.clone());
    }
  }
  Ok(out)
}

fn transform_field(payload: &JsonValue, mapping: &FieldMapping) -> Result<Option<JsonValue>> {
  let tokens = parse_path(&mapping.source)?;
  let value = pointer_get(payload, &tokens).filter(|v| !v.is_null());
  let out = match &mapping.op {
    TransformOp::Copy => value.cloned(),
    TransformOp::Lowercase => value.map(|v| map_str(v, |s| s.to_lowercase())),
    TransformOp::Uppercase => value.map(|v| map_str(v, |s| s.to_uppercase())),
    TransformOp::Trim => value.map(|v| map_str(v, |s| s.trim().to_string())),
    TransformOp::Count => {
      let n = match value {
        Some(JsonValue::Array(items)) => items.len(),
        Some(JsonValue::Object(map)) => map.len(),
        Some(_) => 1,
        None => 0,
      };
      Some(json!(n))
    }
    TransformOp::Sum => Some(sum(value)),
    TransformOp::Default(d) => Some(value.cloned().unwrap_or_else(|| d.clone())),
  };
  Ok(out)
}

fn map_str<F>(v: &JsonValue, f: F) -> JsonValue
  where F: Fn(&str) -> String
{
  match v {
    JsonValue::String(s) => JsonValue::String(f(s)),
    other => other.clone(),
  }
}

/// Suma los números de un array (o el número suelto). Conserva enteros
/// mientras no haya decimales ni desbordamiento.
fn sum(value: Option<&JsonValue>) -> JsonValue {
  let numbers: Vec<&serde_json::Number> = match value {
    Some(JsonValue::Array(items)) => items.iter()
                                          .filter_map(|v| match v {
                                            JsonValue::Number(n) => Some(n),
                                            _ => None,
                                          })
                                          .collect(),
    Some(JsonValue::Number(n)) => vec![n],
    _ => Vec::new(),
  };
  let ints: Option<i64> = numbers.iter()
                                 .try_fold(0i64, |acc, n| n.as_i64().and_then(|i| acc.checked_add(i)));
  match ints {
    Some(total) => json!(total),
    None => json!(numbers.iter().filter_map(|n| n.as_f64()).sum::<f64>()),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use indexmap::IndexMap;

  fn no_joins() -> HashMap<&'static str, JsonValue> {
    HashMap::new()
  }

  #[test]
  fn pass_through_keeps_structure_and_skips_missing() {
    let payload = json!({"title": "A", "price": {"amount": 100, "currency": "EUR"}, "stock": 3});
    let rule = BuildRule::PassThrough { paths: vec!["/title".into(), "/price/amount".into(), "/nope".into()] };
    let out = apply_rule(&rule, &payload, &no_joins()).unwrap();
    assert_eq!(out, json!({"title": "A", "price": {"amount": 100}}));
  }

  #[test]
  fn transform_applies_ops() {
    let payload = json!({"title": "  Hello ", "tags": ["a", "b"], "prices": [1, 2, 3.5]});
    let fields = IndexMap::from([
      ("title".to_string(), FieldMapping { source: "/title".into(), op: TransformOp::Trim }),
      ("shout".to_string(), FieldMapping { source: "/title".into(), op: TransformOp::Uppercase }),
      ("tag_count".to_string(), FieldMapping { source: "/tags".into(), op: TransformOp::Count }),
      ("total".to_string(), FieldMapping { source: "/prices".into(), op: TransformOp::Sum }),
      ("brand".to_string(), FieldMapping { source: "/brand".into(), op: TransformOp::Default(json!("none")) }),
      ("missing".to_string(), FieldMapping { source: "/missing".into(), op: TransformOp::Copy }),
    ]);
    let out = apply_rule(&BuildRule::Transform { fields }, &payload, &no_joins()).unwrap();
    assert_eq!(out,
               json!({"title": "Hello", "shout": "  HELLO ", "tag_count": 2, "total": 6.5, "brand": "none"}));
  }

  #[test]
  fn integer_sums_stay_integers() {
    assert_eq!(sum(Some(&json!([1, 2, 3]))), json!(6));
    assert_eq!(sum(None), json!(0));
  }

  #[test]
  fn join_merge_embeds_named_documents() {
    let payload = json!({"title": "A", "brand_id": "b1"});
    let mut joins = HashMap::new();
    joins.insert("brand", json!({"name": "Acme"}));
    let rule = BuildRule::JoinMerge { base_paths: vec!["/title".into()], joins: vec!["brand".into(), "absent".into()] };
    let out = apply_rule(&rule, &payload, &joins).unwrap();
    assert_eq!(out, json!({"title": "A", "brand": {"name": "Acme"}}));
  }
}
