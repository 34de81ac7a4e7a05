// contracts.rs
//
// Contratos declarativos de sólo lectura: RuleSet (cómo trocear una entidad,
// qué rutas impactan cada slice, qué índices derivar) y ViewDefinition
// (qué slices necesita una vista y qué hacer si falta alguno).
use crate::path::parse_path;
use crate::DomainError;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::collections::HashSet;
use std::fmt;

/// Referencia a un contrato por id + versión.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContractRef {
  pub id: String,
  pub version: u32,
}

impl ContractRef {
  pub fn new(id: impl Into<String>, version: u32) -> Self {
    Self { id: id.into(), version }
  }
}

impl fmt::Display for ContractRef {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}@{}", self.id, self.version)
  }
}

/// Operación aplicada a un campo en una regla `Transform`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", content = "value", rename_all = "snake_case")]
pub enum TransformOp {
  Copy,
  Lowercase,
  Uppercase,
  Trim,
  /// Longitud de un array, o número de claves de un objeto.
  Count,
  /// Suma de los números de un array.
  Sum,
  /// Copia el valor o usa el dado si no existe.
  Default(JsonValue),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldMapping {
  pub source: String,
  #[serde(default = "default_op")]
  pub op: TransformOp,
}

fn default_op() -> TransformOp {
  TransformOp::Copy
}

/// Regla de construcción de un slice. Conjunto cerrado de variantes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BuildRule {
  /// Copia las rutas indicadas conservando su estructura.
  PassThrough { paths: Vec<String> },
  /// Construye un objeto nuevo campo a campo.
  Transform { fields: IndexMap<String, FieldMapping> },
  /// Rutas base más los documentos unidos, embebidos bajo su nombre.
  JoinMerge {
    #[serde(default)]
    base_paths: Vec<String>,
    joins: Vec<String>,
  },
}

/// Búsqueda declarada de otra entidad necesaria para construir un slice.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JoinSpec {
  pub name: String,
  /// Ruta en el payload con el id (o ids) de la entidad referenciada.
  pub source_path: String,
  pub target_entity_type: String,
  #[serde(default)]
  pub required: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SliceDefinition {
  pub slice_type: String,
  pub rule: BuildRule,
  #[serde(default)]
  pub joins: Vec<JoinSpec>,
}

/// Acción del circuit breaker cuando un fanout supera su tope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitBreakerAction {
  #[default]
  Skip,
  Error,
}

pub const DEFAULT_MAX_FANOUT: usize = 1000;

fn default_max_fanout() -> usize {
  DEFAULT_MAX_FANOUT
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexSpec {
  pub index_type: String,
  /// Selector evaluado sobre `source_slice` o, si no hay, sobre el payload.
  pub selector: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub source_slice: Option<String>,
  /// Tipo de entidad upstream referenciada por el valor.
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub references: Option<String>,
  #[serde(default = "default_max_fanout")]
  pub max_fanout: usize,
  #[serde(default)]
  pub circuit_breaker_action: CircuitBreakerAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSetContract {
  pub id: String,
  pub version: u32,
  pub entity_type: String,
  pub slices: Vec<SliceDefinition>,
  /// SliceType -> patrones de ruta que lo afectan.
  #[serde(default)]
  pub impact_map: IndexMap<String, Vec<String>>,
  /// Rutas declaradas explícitamente sin impacto sobre ningún slice.
  #[serde(default)]
  pub no_impact_paths: Vec<String>,
  #[serde(default)]
  pub indexes: Vec<IndexSpec>,
}

impl RuleSetContract {
  pub fn contract_ref(&self) -> ContractRef {
    ContractRef::new(self.id.clone(), self.version)
  }

  pub fn slice_types(&self) -> Vec<&str> {
    self.slices.iter().map(|s| s.slice_type.as_str()).collect()
  }

  pub fn slice(&self, slice_type: &str) -> Option<&SliceDefinition> {
    self.slices.iter().find(|s| s.slice_type == slice_type)
  }

  /// Comprueba la coherencia interna del contrato.
  pub fn validate(&self) -> Result<(), DomainError> {
    if self.entity_type.trim().is_empty() {
      return Err(DomainError::ValidationError(format!("RuleSet {} sin entity_type", self.id)));
    }
    let mut seen = HashSet::new();
    for s in &self.slices {
      if !seen.insert(s.slice_type.as_str()) {
        return Err(DomainError::ValidationError(format!("SliceType duplicado en {}: {}", self.id, s.slice_type)));
      }
      let join_names: HashSet<&str> = s.joins.iter().map(|j| j.name.as_str()).collect();
      for j in &s.joins {
        parse_path(&j.source_path)?;
      }
      match &s.rule {
        BuildRule::PassThrough { paths } => {
          for p in paths {
            parse_path(p)?;
          }
        }
        BuildRule::Transform { fields } => {
          for m in fields.values() {
            parse_path(&m.source)?;
          }
        }
        BuildRule::JoinMerge { base_paths, joins } => {
          for p in base_paths {
            parse_path(p)?;
          }
          if let Some(missing) = joins.iter().find(|j| !join_names.contains(j.as_str())) {
            return Err(DomainError::ValidationError(format!("Slice {} referencia un join no declarado: {}",
                                                            s.slice_type, missing)));
          }
        }
      }
    }
    for (slice_type, patterns) in &self.impact_map {
      if !seen.contains(slice_type.as_str()) {
        return Err(DomainError::ValidationError(format!("impact_map de {} referencia un slice no declarado: {}",
                                                        self.id, slice_type)));
      }
      for p in patterns {
        parse_path(p)?;
      }
    }
    for p in &self.no_impact_paths {
      parse_path(p)?;
    }
    for idx in &self.indexes {
      parse_path(&idx.selector)?;
      if let Some(src) = &idx.source_slice {
        if !seen.contains(src.as_str()) {
          return Err(DomainError::ValidationError(format!("Índice {} lee de un slice no declarado: {}",
                                                          idx.index_type, src)));
        }
      }
    }
    Ok(())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MissingPolicy {
  #[default]
  FailClosed,
  /// Devuelve los slices presentes y la lista de los que faltan.
  Partial,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDefinitionContract {
  pub id: String,
  pub version: u32,
  pub required_slices: Vec<String>,
  #[serde(default)]
  pub missing_policy: MissingPolicy,
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn rule_set_deserializes_from_json() {
    let rs: RuleSetContract = serde_json::from_value(json!({
      "id": "product", "version": 1, "entity_type": "PRODUCT",
      "slices": [
        {"slice_type": "CORE", "rule": {"kind": "pass_through", "paths": ["/title", "/price"]}},
        {"slice_type": "PRICE", "rule": {"kind": "transform", "fields": {
          "amount": {"source": "/price"},
          "label": {"source": "/title", "op": {"op": "lowercase"}}
        }}}
      ],
      "impact_map": {"CORE": ["/title", "/price"], "PRICE": ["/price"]},
      "indexes": [{"index_type": "product_by_brand_id", "selector": "$.brand_id", "references": "BRAND"}]
    })).unwrap();
    assert_eq!(rs.slice_types(), vec!["CORE", "PRICE"]);
    assert_eq!(rs.indexes[0].max_fanout, DEFAULT_MAX_FANOUT);
    assert_eq!(rs.indexes[0].circuit_breaker_action, CircuitBreakerAction::Skip);
    rs.validate().unwrap();
  }

  #[test]
  fn validate_rejects_unknown_impact_slice() {
    let rs = RuleSetContract { id: "x".into(),
                               version: 1,
                               entity_type: "X".into(),
                               slices: vec![],
                               impact_map: IndexMap::from([("CORE".to_string(), vec!["/a".to_string()])]),
                               no_impact_paths: vec![],
                               indexes: vec![] };
    assert!(matches!(rs.validate(), Err(DomainError::ValidationError(_))));
  }
}
