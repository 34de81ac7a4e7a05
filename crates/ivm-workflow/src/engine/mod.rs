//! Motores puros del pipeline: joins, troceado, impacto de cambios e índices.
//!
//! Ninguno guarda estado propio; los workflows los componen con los puertos
//! de `ivm-store`.
pub mod impact;
pub mod index;
pub mod join;
pub mod slicing;

pub use impact::{diff, impacted_slices, ImpactAnalysis};
pub use index::{canonical_index_value, reverse_index_type, IndexBuilder};
pub use join::{merge_joins, JoinExecutor, JOINS_KEY};
pub use slicing::{apply_rule, SlicingEngine};
