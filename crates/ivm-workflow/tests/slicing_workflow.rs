mod common;

use common::{brand, detail_view, product, product_payload, product_rule_set, tenant, Stack};
use ivm_domain::{CircuitBreakerAction, SliceRecord};
use ivm_store::{InvertedIndexRepository, SliceRepository};
use ivm_workflow::{SlicingMode, WorkflowError};
use serde_json::json;

fn hashes(slices: &[SliceRecord]) -> Vec<(String, String)> {
  slices.iter().map(|s| (s.slice_type.clone(), s.hash.clone())).collect()
}

#[tokio::test]
async fn full_slicing_is_deterministic_across_key_order() {
  let a = Stack::new();
  let b = Stack::new();
  let t = tenant("acme");
  let key = product(&t, "p1");

  a.ingest(&key, 1, json!({"title": "Lamp", "price": 30, "brand_id": "b1", "tags": ["x"]})).await;
  b.ingest(&key, 1, json!({"tags": ["x"], "brand_id": "b1", "price": 30, "title": "Lamp"})).await;

  let first = a.slicing.execute_full(&t, &key, 1).await.unwrap();
  let again = a.slicing.execute_full(&t, &key, 1).await.unwrap();
  let other = b.slicing.execute_full(&t, &key, 1).await.unwrap();

  assert_eq!(first.mode, SlicingMode::Full);
  assert_eq!(first.recomputed, vec!["CORE", "PRICE", "BRAND"]);
  assert_eq!(hashes(&first.slices), hashes(&again.slices));
  assert_eq!(hashes(&first.slices), hashes(&other.slices));
}

#[tokio::test]
async fn reprocessing_is_idempotent() {
  let stack = Stack::new();
  let t = tenant("acme");
  let key = product(&t, "p1");
  stack.ingest(&key, 1, product_payload("Lamp", 30, "b1")).await;

  stack.slicing.execute_auto(&t, &key, 1).await.unwrap();
  let stored = stack.slices.len();
  stack.slicing.execute_auto(&t, &key, 1).await.unwrap();
  stack.slicing.execute_full(&t, &key, 1).await.unwrap();

  assert_eq!(stack.slices.len(), stored);
  assert_eq!(stored, 3);
}

#[tokio::test]
async fn incremental_matches_full_recompute() {
  let stack = Stack::new();
  let t = tenant("acme");
  let key = product(&t, "p1");
  stack.ingest(&key, 1, product_payload("Lamp", 30, "b1")).await;
  stack.slicing.execute_auto(&t, &key, 1).await.unwrap();

  let v2 = product_payload("Lamp", 45, "b1");
  stack.ingest(&key, 2, v2.clone()).await;
  let incremental = stack.slicing.execute_auto(&t, &key, 2).await.unwrap();

  assert_eq!(incremental.mode, SlicingMode::Incremental);
  assert_eq!(incremental.prior_version, Some(1));
  assert_eq!(incremental.recomputed, vec!["CORE", "PRICE"]);
  assert_eq!(incremental.copied, vec!["BRAND"]);
  assert!(incremental.changed);

  // a fresh stack slicing v2 from scratch must produce the same hashes
  let fresh = Stack::new();
  fresh.ingest(&key, 2, v2).await;
  let full = fresh.slicing.execute_full(&t, &key, 2).await.unwrap();
  assert_eq!(hashes(&incremental.slices), hashes(&full.slices));
}

#[tokio::test]
async fn copied_slices_keep_prior_hash() {
  let stack = Stack::new();
  let t = tenant("acme");
  let key = product(&t, "p1");
  stack.ingest(&key, 1, product_payload("Lamp", 30, "b1")).await;
  let v1 = stack.slicing.execute_auto(&t, &key, 1).await.unwrap();

  stack.ingest(&key, 2, product_payload("Desk lamp", 30, "b1")).await;
  let v2 = stack.slicing.execute_auto(&t, &key, 2).await.unwrap();

  assert_eq!(v2.recomputed, vec!["CORE"]);
  let brand_v1 = v1.slices.iter().find(|s| s.slice_type == "BRAND").unwrap();
  let brand_v2 = v2.slices.iter().find(|s| s.slice_type == "BRAND").unwrap();
  assert_eq!(brand_v1.hash, brand_v2.hash);
  assert_eq!(brand_v2.version, 2);
}

#[tokio::test]
async fn unmapped_change_fails_closed_without_writes() {
  let stack = Stack::new();
  let t = tenant("acme");
  let key = product(&t, "p1");
  stack.ingest(&key, 1, product_payload("Lamp", 30, "b1")).await;
  stack.slicing.execute_auto(&t, &key, 1).await.unwrap();
  let calls = stack.slices.put_calls();

  let mut v2 = product_payload("Lamp", 30, "b1");
  v2["stock"] = json!(7);
  stack.ingest(&key, 2, v2).await;

  match stack.slicing.execute_auto(&t, &key, 2).await {
    Err(WorkflowError::UnmappedChangePath { paths }) => assert_eq!(paths, vec!["/stock"]),
    other => panic!("expected UnmappedChangePath, got {:?}", other),
  }
  assert_eq!(stack.slices.put_calls(), calls);
  assert!(stack.slices.get_version(&t, &key, 2).await.unwrap().is_empty());
}

#[tokio::test]
async fn no_impact_paths_copy_everything_forward() {
  let stack = Stack::new();
  let t = tenant("acme");
  let key = product(&t, "p1");
  stack.ingest(&key, 1, product_payload("Lamp", 30, "b1")).await;
  stack.slicing.execute_auto(&t, &key, 1).await.unwrap();

  let mut v2 = product_payload("Lamp", 30, "b1");
  v2["updated_at"] = json!("2024-02-02T00:00:00Z");
  stack.ingest(&key, 2, v2).await;
  let outcome = stack.slicing.execute_auto(&t, &key, 2).await.unwrap();

  assert!(outcome.recomputed.is_empty());
  assert_eq!(outcome.copied, vec!["CORE", "PRICE", "BRAND"]);
  assert!(!outcome.changed);
}

#[tokio::test]
async fn version_gaps_diff_against_latest_prior() {
  let stack = Stack::new();
  let t = tenant("acme");
  let key = product(&t, "p1");
  stack.ingest(&key, 1, product_payload("Lamp", 30, "b1")).await;
  stack.slicing.execute_auto(&t, &key, 1).await.unwrap();

  stack.ingest(&key, 5, product_payload("Lamp", 30, "b2")).await;
  let outcome = stack.slicing.execute_auto(&t, &key, 5).await.unwrap();

  assert_eq!(outcome.prior_version, Some(1));
  assert_eq!(outcome.recomputed, vec!["BRAND"]);
}

#[tokio::test]
async fn optional_join_resolves_when_target_exists() {
  let stack = Stack::new();
  let t = tenant("acme");
  stack.ingest(&brand(&t, "b1"), 1, json!({"name": "Acme"})).await;
  let key = product(&t, "p1");
  stack.ingest(&key, 1, product_payload("Lamp", 30, "b1")).await;

  let outcome = stack.slicing.execute_full(&t, &key, 1).await.unwrap();
  let brand_slice = outcome.slices.iter().find(|s| s.slice_type == "BRAND").unwrap();
  assert_eq!(brand_slice.data, json!({"brand_id": "b1", "brand": {"name": "Acme"}}));

  // missing optional join: slice still built, without the join
  let orphan = product(&t, "p2");
  stack.ingest(&orphan, 1, product_payload("Chair", 80, "nope")).await;
  let outcome = stack.slicing.execute_full(&t, &orphan, 1).await.unwrap();
  let brand_slice = outcome.slices.iter().find(|s| s.slice_type == "BRAND").unwrap();
  assert_eq!(brand_slice.data, json!({"brand_id": "nope"}));
}

#[tokio::test]
async fn index_entries_are_written_per_owner() {
  let stack = Stack::new();
  let t = tenant("acme");
  let key = product(&t, "p1");
  stack.ingest(&key, 1, product_payload("Lamp", 30, "B1")).await;
  let outcome = stack.slicing.execute_full(&t, &key, 1).await.unwrap();

  // forward brand + reverse brand + two tags
  assert_eq!(outcome.index_entries, 4);
  let reverse = stack.index.query_by_index_type(&t, "product_by_brand", "b1").await.unwrap();
  assert_eq!(reverse.len(), 1);
  assert_eq!(reverse[0].target_entity_key, key);
  assert_eq!(reverse[0].ref_entity_key, Some(brand(&t, "B1")));
  let tags = stack.index.query_by_index_type(&t, "product_by_tag", "sale").await.unwrap();
  assert_eq!(tags.len(), 1);
}

#[tokio::test]
async fn tombstone_hides_slices_and_clears_index() {
  let stack = Stack::new();
  let t = tenant("acme");
  let key = product(&t, "p1");
  stack.ingest(&key, 1, product_payload("Lamp", 30, "b1")).await;
  stack.slicing.execute_auto(&t, &key, 1).await.unwrap();

  let outcome = stack.slicing.tombstone(&t, &key, 2, "discontinued").await.unwrap();
  assert_eq!(outcome.mode, SlicingMode::Tombstone);
  assert!(outcome.slices.iter().all(|s| s.is_tombstoned()));
  assert!(stack.index.entries_for_owner(&t, &key).await.unwrap().is_empty());

  // writing the same tombstone again is a no-op
  stack.slicing.tombstone(&t, &key, 2, "discontinued").await.unwrap();
}

#[tokio::test]
async fn tombstone_over_a_sliced_version_publishes_a_revision() {
  let stack = Stack::new();
  let t = tenant("acme");
  let key = product(&t, "p1");
  stack.ingest(&key, 1, product_payload("Lamp", 30, "b1")).await;
  stack.slicing.execute_auto(&t, &key, 1).await.unwrap();
  stack.ingest(&key, 2, product_payload("Lamp", 45, "b1")).await;
  stack.slicing.execute_auto(&t, &key, 2).await.unwrap();

  let outcome = stack.slicing.tombstone(&t, &key, 2, "recalled").await.unwrap();
  assert_eq!(outcome.revision, 1);
  assert!(outcome.changed);
  assert!(stack.index.entries_for_owner(&t, &key).await.unwrap().is_empty());

  match stack.query.query_view(&t, &key, 2, &detail_view(), false).await {
    Err(WorkflowError::MissingSlice { version, .. }) => assert_eq!(version, 2),
    other => panic!("expected MissingSlice, got {:?}", other),
  }
  let v1 = stack.query.query_view(&t, &key, 1, &detail_view(), false).await.unwrap();
  assert_eq!(v1.slices["PRICE"]["amount"], 30);

  // redelivering the original event does not resurrect v2
  let again = stack.slicing.execute_auto(&t, &key, 2).await.unwrap();
  assert_eq!(again.mode, SlicingMode::Tombstone);
  assert_eq!(again.revision, 1);
  assert!(again.slices.iter().all(|s| s.is_tombstoned()));
}

#[tokio::test]
async fn required_join_failure_stores_nothing() {
  let stack = Stack::new();
  let mut strict = product_rule_set(1000, CircuitBreakerAction::Skip);
  strict.version = 2;
  for slice in strict.slices.iter_mut() {
    for join in slice.joins.iter_mut() {
      join.required = true;
    }
  }
  stack.registry.register_rule_set(strict).unwrap();

  let t = tenant("acme");
  let key = product(&t, "p1");
  stack.ingest(&key, 1, product_payload("Lamp", 30, "missing")).await;
  let calls = stack.slices.put_calls();

  match stack.slicing.execute_auto(&t, &key, 1).await {
    Err(WorkflowError::JoinFailed { join, .. }) => assert_eq!(join, "brand"),
    other => panic!("expected JoinFailed, got {:?}", other),
  }
  assert_eq!(stack.slices.put_calls(), calls);
  assert!(stack.slices.get_version(&t, &key, 1).await.unwrap().is_empty());
  assert!(stack.index.entries_for_owner(&t, &key).await.unwrap().is_empty());

  // once the brand exists the same version slices normally
  stack.ingest(&brand(&t, "missing"), 1, json!({"name": "Found"})).await;
  let outcome = stack.slicing.execute_auto(&t, &key, 1).await.unwrap();
  assert_eq!(outcome.slices.len(), 3);
}

#[tokio::test]
async fn rejects_keys_from_another_tenant() {
  let stack = Stack::new();
  let acme = tenant("acme");
  let other = tenant("globex");
  let key = product(&acme, "p1");
  stack.ingest(&key, 1, product_payload("Lamp", 30, "b1")).await;

  match stack.slicing.execute_full(&other, &key, 1).await {
    Err(WorkflowError::Validation(_)) => {}
    other => panic!("expected validation error, got {:?}", other),
  }
  match stack.slicing.execute_full(&other, &product(&other, "p1"), 1).await {
    Err(WorkflowError::NotFound(_)) => {}
    other => panic!("expected not found, got {:?}", other),
  }
}

#[tokio::test]
async fn redelivery_of_an_old_version_ignores_newer_join_targets() {
  let stack = Stack::new();
  let t = tenant("acme");
  let b1 = brand(&t, "b1");
  let key = product(&t, "p1");
  stack.ingest(&b1, 1, json!({"name": "Acme"})).await;
  stack.ingest(&key, 1, product_payload("Lamp", 30, "b1")).await;
  let first = stack.slicing.execute_auto(&t, &key, 1).await.unwrap();

  stack.ingest(&b1, 2, json!({"name": "Acme 2"})).await;
  let calls = stack.slices.put_calls();
  let again = stack.slicing.execute_full(&t, &key, 1).await.unwrap();
  assert_eq!(hashes(&again.slices), hashes(&first.slices));
  assert_eq!(stack.slices.put_calls(), calls);
  let brand_slice = again.slices.iter().find(|s| s.slice_type == "BRAND").unwrap();
  assert_eq!(brand_slice.data["brand"]["name"], "Acme");
}
