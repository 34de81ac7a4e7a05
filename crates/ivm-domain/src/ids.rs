// ids.rs
use crate::DomainError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Versión de una entidad. La asigna quien ingesta; es creciente por entidad
/// y admite huecos (v1, v5, ...).
pub type Version = u64;

/// Identificador de tenant. Todo acceso a repositorios va acotado por tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
  pub fn new(id: impl Into<String>) -> Result<Self, DomainError> {
    let id = id.into();
    let trimmed = id.trim();
    if trimmed.is_empty() {
      return Err(DomainError::ValidationError("TenantId no puede estar vacío".to_string()));
    }
    if trimmed.contains('#') {
      return Err(DomainError::ValidationError(format!("TenantId no puede contener '#': {}", trimmed)));
    }
    Ok(Self(trimmed.to_string()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for TenantId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

/// Clave compuesta de entidad con forma `TYPE#tenant#localId`.
///
/// El tipo de entidad se normaliza a mayúsculas; el `local_id` se conserva
/// tal cual (puede contener `#`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKey {
  entity_type: String,
  tenant: TenantId,
  local_id: String,
}

impl EntityKey {
  pub fn new(entity_type: &str, tenant: &TenantId, local_id: &str) -> Result<Self, DomainError> {
    let entity_type = entity_type.trim().to_uppercase();
    if entity_type.is_empty() || entity_type.contains('#') {
      return Err(DomainError::ValidationError(format!("Tipo de entidad inválido: '{}'", entity_type)));
    }
    if local_id.trim().is_empty() {
      return Err(DomainError::ValidationError("localId no puede estar vacío".to_string()));
    }
    Ok(Self { entity_type, tenant: tenant.clone(), local_id: local_id.trim().to_string() })
  }

  pub fn parse(s: &str) -> Result<Self, DomainError> {
    let mut parts = s.splitn(3, '#');
    match (parts.next(), parts.next(), parts.next()) {
      (Some(t), Some(tenant), Some(local)) => Self::new(t, &TenantId::new(tenant)?, local),
      _ => Err(DomainError::ValidationError(format!("EntityKey debe tener la forma TYPE#tenant#localId: '{}'", s))),
    }
  }

  pub fn entity_type(&self) -> &str {
    &self.entity_type
  }

  pub fn tenant(&self) -> &TenantId {
    &self.tenant
  }

  pub fn local_id(&self) -> &str {
    &self.local_id
  }
}

impl fmt::Display for EntityKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}#{}#{}", self.entity_type, self.tenant, self.local_id)
  }
}

impl FromStr for EntityKey {
  type Err = DomainError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    Self::parse(s)
  }
}

impl TryFrom<String> for EntityKey {
  type Error = DomainError;

  fn try_from(s: String) -> Result<Self, Self::Error> {
    Self::parse(&s)
  }
}

impl From<EntityKey> for String {
  fn from(k: EntityKey) -> Self {
    k.to_string()
  }
}
