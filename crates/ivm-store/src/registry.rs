// Archivo: registry.rs
// Propósito: registro de contratos en memoria. Los contratos son de sólo
// lectura y se comparten como `Arc`, así que el mismo registro puede
// cachearse para todo el proceso.
use crate::errors::{Result, StoreError};
use crate::repository::ContractRegistry;
use async_trait::async_trait;
use dashmap::DashMap;
use ivm_domain::{ContractRef, DomainError, RuleSetContract, ViewDefinitionContract};
use log::info;
use std::collections::HashMap;
use std::sync::Arc;

/// Registro de contratos respaldado por `DashMap`.
#[derive(Default)]
pub struct InMemoryContractRegistry {
    rule_sets: DashMap<ContractRef, Arc<RuleSetContract>>,
    views: DashMap<ContractRef, Arc<ViewDefinitionContract>>,
}

impl InMemoryContractRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Valida y registra un RuleSet. Registrar dos veces la misma
    /// referencia con contenido distinto es un conflicto.
    pub fn register_rule_set(&self, rule_set: RuleSetContract) -> Result<ContractRef> {
        rule_set.validate()?;
        let contract = rule_set.contract_ref();
        if let Some(existing) = self.rule_sets.get(&contract) {
            if **existing != rule_set {
                return Err(StoreError::Conflict(format!("RuleSet {} ya registrado con otro contenido", contract)));
            }
            return Ok(contract);
        }
        info!("RuleSet registrado: {} ({})", contract, rule_set.entity_type);
        self.rule_sets.insert(contract.clone(), Arc::new(rule_set));
        Ok(contract)
    }

    pub fn register_view_definition(&self, view: ViewDefinitionContract) -> Result<ContractRef> {
        if view.required_slices.is_empty() {
            return Err(DomainError::ValidationError(format!("ViewDefinition {} sin required_slices", view.id)).into());
        }
        let contract = ContractRef::new(view.id.clone(), view.version);
        if let Some(existing) = self.views.get(&contract) {
            if **existing != view {
                return Err(StoreError::Conflict(format!("ViewDefinition {} ya registrada con otro contenido", contract)));
            }
            return Ok(contract);
        }
        self.views.insert(contract.clone(), Arc::new(view));
        Ok(contract)
    }

    /// Registra un RuleSet desde su representación JSON.
    pub fn register_rule_set_json(&self, json: &str) -> Result<ContractRef> {
        let rule_set: RuleSetContract = serde_json::from_str(json).map_err(DomainError::from)?;
        self.register_rule_set(rule_set)
    }

    pub fn register_view_definition_json(&self, json: &str) -> Result<ContractRef> {
        let view: ViewDefinitionContract = serde_json::from_str(json).map_err(DomainError::from)?;
        self.register_view_definition(view)
    }
}

#[async_trait]
impl ContractRegistry for InMemoryContractRegistry {
    async fn load_rule_set(&self, contract: &ContractRef) -> Result<Arc<RuleSetContract>> {
        self.rule_sets
            .get(contract)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| StoreError::NotFound(format!("RuleSet {}", contract)))
    }

    async fn load_view_definition(&self, contract: &ContractRef) -> Result<Arc<ViewDefinitionContract>> {
        self.views
            .get(contract)
            .map(|v| Arc::clone(v.value()))
            .ok_or_else(|| StoreError::NotFound(format!("ViewDefinition {}", contract)))
    }

    async fn rule_set_for_entity_type(&self, entity_type: &str) -> Result<Arc<RuleSetContract>> {
        let wanted = entity_type.to_uppercase();
        self.rule_sets
            .iter()
            .filter(|r| r.value().entity_type.to_uppercase() == wanted)
            .max_by_key(|r| r.key().version)
            .map(|r| Arc::clone(r.value()))
            .ok_or_else(|| StoreError::NotFound(format!("RuleSet para el tipo {}", entity_type)))
    }

    async fn rule_sets(&self) -> Result<Vec<Arc<RuleSetContract>>> {
        // Una entrada por id: la versión más alta.
        let mut latest: HashMap<String, Arc<RuleSetContract>> = HashMap::new();
        for r in self.rule_sets.iter() {
            let keep = latest.get(&r.key().id).map_or(true, |cur| cur.version < r.key().version);
            if keep {
                latest.insert(r.key().id.clone(), Arc::clone(r.value()));
            }
        }
        let mut out: Vec<Arc<RuleSetContract>> = latest.into_values().collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(out)
    }
}
