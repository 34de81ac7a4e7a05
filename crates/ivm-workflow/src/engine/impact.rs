use crate::errors::{Result, WorkflowError};
use ivm_domain::path::{parse_path, pattern_matches, to_pointer};
use ivm_domain::{ChangeSet, RuleSetContract};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::{BTreeSet, HashSet};

/// Resultado del cálculo de impacto para un par de versiones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImpactAnalysis {
  pub change_set: ChangeSet,
  /// Tipos de slice a recalcular, en orden declarado.
  pub impacted: Vec<String>,
  /// Tipos de slice que se copian de la versión anterior.
  pub unaffected: Vec<String>,
}

impl ImpactAnalysis {
  pub fn is_impacted(&self, slice_type: &str) -> bool {
    self.impacted.iter().any(|t| t == slice_type)
  }
}

/// Rutas (JSON pointer) que difieren entre dos payloads.
///
/// Los objetos se comparan clave a clave en orden, los arrays posición a
/// posición; un cambio de tipo se informa en la ruta del contenedor. Si la
/// raíz entera cambia de tipo la ruta es `""`.
pub fn diff(prev: &JsonValue, curr: &JsonValue) -> ChangeSet {
  let mut paths = Vec::new();
  let mut prefix = Vec::new();
  diff_into(prev, curr, &mut prefix, &mut paths);
  ChangeSet { paths }
}

fn diff_into(prev: &JsonValue, curr: &JsonValue, prefix: &mut Vec<String>, out: &mut Vec<String>) {
  match (prev, curr) {
    (JsonValue::Object(a), JsonValue::Object(b)) => {
      let keys: BTreeSet<&String> = a.keys().chain(b.keys()).collect();
      for k in keys {
        prefix.push(k.clone());
        match (a.get(k), b.get(k)) {
          (Some(x), Some(y)) => diff_into(x, y, prefix, out),
          _ => out.push(to_pointer(prefix)),
        }
        prefix.pop();
      }
    }
    (JsonValue::Array(a), JsonValue::Array(b)) => {
      for i in 0..a.len().max(b.len()) {
        prefix.push(i.to_string());
        match (a.get(i), b.get(i)) {
          (Some(x), Some(y)) => diff_into(x, y, prefix, out),
          _ => out.push(to_pointer(prefix)),
        }
        prefix.pop();
      }
    }
    (a, b) if a != b => out.push(to_pointer(prefix)),
    _ => {}
  }
}

/// Traduce un `ChangeSet` a los tipos de slice afectados.
///
/// Falla cerrado: una ruta cambiada que no cubre ningún patrón del impact
/// map ni de `no_impact_paths` produce `UnmappedChangePath`. Los slices sin
/// entrada en el impact map se recalculan siempre que haya cambios.
pub fn impacted_slices(change_set: &ChangeSet, rule_set: &RuleSetContract) -> Result<ImpactAnalysis> {
  let all: Vec<String> = rule_set.slices.iter().map(|s| s.slice_type.clone()).collect();
  if change_set.is_empty() {
    return Ok(ImpactAnalysis { change_set: change_set.clone(), impacted: Vec::new(), unaffected: all });
  }

  let mut mapped: Vec<(&str, Vec<Vec<String>>)> = Vec::with_capacity(rule_set.impact_map.len());
  for (slice_type, patterns) in &rule_set.impact_map {
    let parsed = patterns.iter().map(|p| parse_path(p)).collect::<std::result::Result<Vec<_>, _>>()?;
    mapped.push((slice_type.as_str(), parsed));
  }
  let no_impact = rule_set.no_impact_paths
                          .iter()
                          .map(|p| parse_path(p))
                          .collect::<std::result::Result<Vec<_>, _>>()?;

  let mut hit: HashSet<&str> = HashSet::new();
  let mut unmapped = Vec::new();
  for path in &change_set.paths {
    let tokens = parse_path(path)?;
    let mut covered = false;
    for (slice_type, patterns) in &mapped {
      if patterns.iter().any(|p| pattern_matches(p, &tokens)) {
        hit.insert(*slice_type);
        covered = true;
      }
    }
    if !covered && !no_impact.iter().any(|p| pattern_matches(p, &tokens)) {
      unmapped.push(path.clone());
    }
  }
  if !unmapped.is_empty() {
    return Err(WorkflowError::UnmappedChangePath { paths: unmapped });
  }

  let (impacted, unaffected): (Vec<String>, Vec<String>) =
    all.into_iter()
       .partition(|t| hit.contains(t.as_str()) || !rule_set.impact_map.contains_key(t));
  Ok(ImpactAnalysis { change_set: change_set.clone(), impacted, unaffected })
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn diff_reports_leaf_and_structural_changes() {
    let prev = json!({"title": "A", "price": {"amount": 1}, "tags": ["x"], "gone": true});
    let curr = json!({"title": "A", "price": {"amount": 2}, "tags": ["x", "y"], "new": 1});
    assert_eq!(diff(&prev, &curr).paths, vec!["/gone", "/new", "/price/amount", "/tags/1"]);
  }

  #[test]
  fn diff_of_identical_payloads_is_empty() {
    let v = json!({"a": [1, {"b": null}]});
    assert!(diff(&v, &v).is_empty());
  }

  #[test]
  fn type_change_is_reported_at_container() {
    assert_eq!(diff(&json!({"p": {"a": 1}}), &json!({"p": 5})).paths, vec!["/p"]);
    assert_eq!(diff(&json!([1]), &json!({"a": 1})).paths, vec![""]);
  }
}
