#![allow(dead_code)]
// Archivo: common/mod.rs
// Propósito: pila completa en memoria y contratos de ejemplo compartidos por
// las pruebas de integración.
use ivm_domain::{CircuitBreakerAction, ContractRef, EntityKey, RuleSetContract, TenantId, ViewDefinitionContract};
use ivm_store::stubs::{InMemoryInvertedIndexRepository, InMemoryOutboxRepository, InMemoryRawDataRepository,
                       InMemorySliceRepository};
use ivm_store::InMemoryContractRegistry;
use ivm_workflow::{FanoutConfig, FanoutWorkflow, IngestRequest, IngestService, QueryWorkflow, SlicingWorkflow};
use serde_json::{json, Value};
use std::sync::Arc;

pub struct Stack {
  pub raw: Arc<InMemoryRawDataRepository>,
  pub outbox: Arc<InMemoryOutboxRepository>,
  pub slices: Arc<InMemorySliceRepository>,
  pub index: Arc<InMemoryInvertedIndexRepository>,
  pub registry: Arc<InMemoryContractRegistry>,
  pub slicing: SlicingWorkflow,
  pub fanout: FanoutWorkflow,
  pub ingest: IngestService,
  pub query: QueryWorkflow,
}

impl Stack {
  pub fn new() -> Self {
    Self::with_brand_index(1000, CircuitBreakerAction::Skip)
  }

  /// Pila con el índice PRODUCT -> BRAND configurado con el tope dado.
  pub fn with_brand_index(max_fanout: usize, action: CircuitBreakerAction) -> Self {
    let outbox = Arc::new(InMemoryOutboxRepository::new());
    let raw = Arc::new(InMemoryRawDataRepository::new(outbox.clone()));
    let slices = Arc::new(InMemorySliceRepository::new());
    let index = Arc::new(InMemoryInvertedIndexRepository::new());
    let registry = Arc::new(InMemoryContractRegistry::new());
    registry.register_rule_set(product_rule_set(max_fanout, action)).unwrap();
    registry.register_rule_set(brand_rule_set()).unwrap();
    registry.register_view_definition(product_detail_view()).unwrap();
    registry.register_view_definition(product_partial_view()).unwrap();

    let slicing = SlicingWorkflow::new(raw.clone(), slices.clone(), index.clone(), registry.clone());
    let fanout = FanoutWorkflow::new(registry.clone(), index.clone(), slicing.clone(), FanoutConfig::default());
    let ingest = IngestService::new(raw.clone());
    let query = QueryWorkflow::new(slices.clone(), registry.clone());
    Self { raw,
           outbox,
           slices,
           index,
           registry,
           slicing,
           fanout,
           ingest,
           query }
  }

  pub async fn ingest(&self, key: &EntityKey, version: u64, payload: Value) {
    let schema = key.entity_type().to_lowercase();
    self.ingest
        .ingest(IngestRequest { tenant_id: key.tenant().clone(),
                                entity_key: key.clone(),
                                version,
                                schema_id: schema,
                                schema_version: 1,
                                payload })
        .await
        .unwrap();
  }
}

pub fn tenant(t: &str) -> TenantId {
  TenantId::new(t).unwrap()
}

pub fn product(t: &TenantId, id: &str) -> EntityKey {
  EntityKey::new("PRODUCT", t, id).unwrap()
}

pub fn brand(t: &TenantId, id: &str) -> EntityKey {
  EntityKey::new("BRAND", t, id).unwrap()
}

pub fn product_payload(title: &str, price: i64, brand_id: &str) -> Value {
  json!({
    "title": title,
    "price": price,
    "brand_id": brand_id,
    "tags": ["Sale", "new"],
    "updated_at": "2024-01-01T00:00:00Z"
  })
}

pub fn product_rule_set(max_fanout: usize, action: CircuitBreakerAction) -> RuleSetContract {
  serde_json::from_value(json!({
    "id": "product",
    "version": 1,
    "entity_type": "PRODUCT",
    "slices": [
      {"slice_type": "CORE", "rule": {"kind": "pass_through", "paths": ["/title", "/price", "/tags"]}},
      {"slice_type": "PRICE", "rule": {"kind": "transform", "fields": {
        "amount": {"source": "/price"},
        "currency": {"source": "/currency", "op": {"op": "default", "value": "EUR"}}
      }}},
      {"slice_type": "BRAND",
       "rule": {"kind": "join_merge", "base_paths": ["/brand_id"], "joins": ["brand"]},
       "joins": [{"name": "brand", "source_path": "/brand_id", "target_entity_type": "BRAND"}]}
    ],
    "impact_map": {
      "CORE": ["/title", "/price", "/tags"],
      "PRICE": ["/price", "/currency"],
      "BRAND": ["/brand_id"]
    },
    "no_impact_paths": ["/updated_at"],
    "indexes": [
      {"index_type": "product_by_brand_id", "selector": "/brand_id", "references": "BRAND",
       "max_fanout": max_fanout, "circuit_breaker_action": action},
      {"index_type": "product_by_tag", "selector": "$.tags[*]", "source_slice": "CORE"}
    ]
  }))
  .unwrap()
}

pub fn brand_rule_set() -> RuleSetContract {
  serde_json::from_value(json!({
    "id": "brand",
    "version": 1,
    "entity_type": "BRAND",
    "slices": [{"slice_type": "CORE", "rule": {"kind": "pass_through", "paths": ["/name"]}}],
    "impact_map": {"CORE": ["/name"]},
    "no_impact_paths": ["/logo"]
  }))
  .unwrap()
}

pub fn product_detail_view() -> ViewDefinitionContract {
  ViewDefinitionContract { id: "product_detail".into(),
                           version: 1,
                           required_slices: vec!["CORE".into(), "PRICE".into()],
                           missing_policy: Default::default() }
}

pub fn product_partial_view() -> ViewDefinitionContract {
  serde_json::from_value(json!({
    "id": "product_card", "version": 1,
    "required_slices": ["CORE", "REVIEWS"],
    "missing_policy": "PARTIAL"
  }))
  .unwrap()
}

pub fn detail_view() -> ContractRef {
  ContractRef::new("product_detail", 1)
}

pub fn card_view() -> ContractRef {
  ContractRef::new("product_card", 1)
}
