// Archivo: errors.rs
// Propósito: definir los errores de la capa de persistencia y el alias
// Result<T> usado por los puertos del crate.
use thiserror::Error;
/// Errores comunes de los repositorios.
///
/// - `NotFound`: registro o contrato inexistente.
/// - `Conflict`: misma clave con distinto contenido (violación de
///   inmutabilidad).
/// - `RetryBudgetExhausted`: una entrada de outbox superó el tope de
///   reintentos.
/// - `Storage`: error del motor de almacenamiento.
/// - `Other`: cualquier otro error.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
  /// Registro no encontrado (raw data, slice, contrato, entrada de outbox).
  #[error("No encontrado: {0}")]
  NotFound(String),
  /// Misma clave + versión con hash distinto.
  #[error("Conflicto: {0}")]
  Conflict(String),
  /// La entrada ya consumió todos sus reintentos.
  #[error("Reintentos agotados: {0}")]
  RetryBudgetExhausted(String),
  /// Error genérico de almacenamiento (BD, KV, etc.).
  #[error("Error de almacenamiento: {0}")]
  Storage(String),
  /// Otro tipo de error.
  #[error("Otro: {0}")]
  Other(String),
}

impl From<ivm_domain::DomainError> for StoreError {
  fn from(e: ivm_domain::DomainError) -> Self {
    Self::Other(e.to_string())
  }
}

/// Alias de resultado usado por los puertos del crate.
pub type Result<T> = std::result::Result<T, StoreError>;
