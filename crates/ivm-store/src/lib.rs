//! Crate `ivm-store`: puertos de persistencia del motor IVM
//!
//! Este crate define los contratos de persistencia que consume el núcleo
//! (`RawDataRepository`, `OutboxRepository`, `SliceRepository`,
//! `InvertedIndexRepository`, `ContractRegistry`) y sus implementaciones en
//! memoria, útiles para pruebas y demos.
//!
//! Diseño resumido:
//! - Inmutabilidad por versión: raw data y slices se escriben con upsert
//!   idempotente; misma clave con hash distinto es `StoreError::Conflict`.
//!   Los slices admiten revisiones nuevas sobre una versión (joins que
//!   cambiaron, tombstones) sin reescribir las anteriores.
//! - Outbox transaccional: `put_with_outbox` escribe el registro y su evento
//!   en la misma unidad de trabajo.
//! - Los conflictos se resuelven en la capa de almacenamiento (escrituras
//!   condicionales), nunca con locks en los workflows.
//!
//! Ejemplo rápido:
//! ```rust
//! use ivm_store::stubs::{InMemoryOutboxRepository, InMemoryRawDataRepository};
//! use std::sync::Arc;
//! let outbox = Arc::new(InMemoryOutboxRepository::new());
//! let raw = InMemoryRawDataRepository::new(outbox.clone());
//! assert!(raw.is_empty());
//! ```
pub mod errors;
pub mod registry;
pub mod repository;
pub mod stubs;

pub use errors::*;
pub use registry::*;
pub use repository::*;
pub use stubs::*;
