use ivm_domain::ContractRef;
use ivm_store::{ContractRegistry, InMemoryContractRegistry, StoreError};

const PRODUCT_V1: &str = r#"{
  "id": "product", "version": 1, "entity_type": "PRODUCT",
  "slices": [{"slice_type": "CORE", "rule": {"kind": "pass_through", "paths": ["/title"]}}],
  "impact_map": {"CORE": ["/title"]}
}"#;

const PRODUCT_V2: &str = r#"{
  "id": "product", "version": 2, "entity_type": "PRODUCT",
  "slices": [{"slice_type": "CORE", "rule": {"kind": "pass_through", "paths": ["/title", "/price"]}}],
  "impact_map": {"CORE": ["/title", "/price"]}
}"#;

#[tokio::test]
async fn resolves_highest_version_per_entity_type() {
  let registry = InMemoryContractRegistry::new();
  registry.register_rule_set_json(PRODUCT_V1).unwrap();
  registry.register_rule_set_json(PRODUCT_V2).unwrap();

  let active = registry.rule_set_for_entity_type("product").await.unwrap();
  assert_eq!(active.version, 2);
  let v1 = registry.load_rule_set(&ContractRef::new("product", 1)).await.unwrap();
  assert_eq!(v1.version, 1);
  assert_eq!(registry.rule_sets().await.unwrap().len(), 1);
}

#[tokio::test]
async fn missing_contracts_are_not_found() {
  let registry = InMemoryContractRegistry::new();
  match registry.load_view_definition(&ContractRef::new("pdp", 1)).await {
    Err(StoreError::NotFound(_)) => {}
    other => panic!("expected not found, got {:?}", other),
  }
  assert!(registry.rule_set_for_entity_type("BRAND").await.is_err());
}

#[tokio::test]
async fn rejects_invalid_and_conflicting_contracts() {
  let registry = InMemoryContractRegistry::new();
  let bad = r#"{"id": "x", "version": 1, "entity_type": "X", "slices": [],
                "impact_map": {"CORE": ["/a"]}}"#;
  assert!(registry.register_rule_set_json(bad).is_err());

  registry.register_rule_set_json(PRODUCT_V1).unwrap();
  // idempotent re-registration
  registry.register_rule_set_json(PRODUCT_V1).unwrap();
  let changed = PRODUCT_V1.replace("\"/title\"]}}", "\"/name\"]}}");
  assert!(matches!(registry.register_rule_set_json(&changed), Err(StoreError::Conflict(_))));

  let empty_view = r#"{"id": "pdp", "version": 1, "required_slices": []}"#;
  assert!(registry.register_view_definition_json(empty_view).is_err());
}
