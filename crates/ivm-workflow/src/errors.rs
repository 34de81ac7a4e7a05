use ivm_store::StoreError;
use thiserror::Error;

// Errores comunes del motor IVM.
//
// Este enum centraliza los errores que pueden ocurrir durante la ingesta,
// el troceado, el fanout y las consultas. Los conflictos y los cambios sin
// mapear nunca se resuelven en silencio: se propagan tipados al llamador.
#[derive(Error, Debug)]
pub enum WorkflowError {
  /// Raw data, slice o contrato inexistente.
  #[error("No encontrado: {0}")]
  NotFound(String),

  /// Misma clave + versión con contenido distinto.
  #[error("Violación de invariante: {0}")]
  InvariantViolation(String),

  /// Rutas cambiadas que ningún patrón del impact map cubre.
  #[error("Cambios sin mapear en el impact map: {}", .paths.join(", "))]
  UnmappedChangePath { paths: Vec<String> },

  /// Una vista FAIL_CLOSED con slices ausentes o borrados.
  #[error("Slices requeridos ausentes para {entity_key} v{version}: {}", .missing.join(", "))]
  MissingSlice {
    entity_key: String,
    version: u64,
    missing: Vec<String>,
  },

  /// Un join `required=true` no se pudo resolver.
  #[error("Join '{join}' no resuelto: {reason}")]
  JoinFailed { join: String, reason: String },

  /// Errores del adaptador de almacenamiento.
  #[error("Error de almacenamiento: {0}")]
  Storage(String),

  /// Errores de validacion (contratos, configuración, eventos).
  #[error("Error de validacion: {0}")]
  Validation(String),

  /// Errores originados por operaciones del dominio.
  #[error("Error de dominio: {0}")]
  Domain(#[from] ivm_domain::DomainError),

  /// Errores de serializacion/deserializacion JSON.
  #[error("Error de serializacion: {0}")]
  Serialization(#[from] serde_json::Error),
}

impl From<StoreError> for WorkflowError {
  fn from(e: StoreError) -> Self {
    match e {
      StoreError::NotFound(m) => WorkflowError::NotFound(m),
      StoreError::Conflict(m) => WorkflowError::InvariantViolation(m),
      StoreError::RetryBudgetExhausted(m) => WorkflowError::Validation(format!("reintentos agotados: {}", m)),
      StoreError::Storage(m) | StoreError::Other(m) => WorkflowError::Storage(m),
    }
  }
}

/// Clase de error visible para el usuario.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
  /// "no encontrado" (consulta de algo inexistente).
  NotFound,
  /// Petición mal formada o incompleta según su contrato.
  BadRequest,
  /// Error del cliente por choque con datos inmutables.
  Conflict,
  /// Error de servidor reintentable.
  Retryable,
}

impl WorkflowError {
  pub fn class(&self) -> ErrorClass {
    match self {
      WorkflowError::NotFound(_) | WorkflowError::MissingSlice { .. } => ErrorClass::NotFound,
      WorkflowError::InvariantViolation(_) => ErrorClass::Conflict,
      WorkflowError::UnmappedChangePath { .. }
      | WorkflowError::Validation(_)
      | WorkflowError::Domain(_)
      | WorkflowError::Serialization(_) => ErrorClass::BadRequest,
      WorkflowError::JoinFailed { .. } | WorkflowError::Storage(_) => ErrorClass::Retryable,
    }
  }

  pub fn is_retryable(&self) -> bool {
    self.class() == ErrorClass::Retryable
  }
}

pub type Result<T> = std::result::Result<T, WorkflowError>;
