mod common;

use common::{brand, detail_view, product, tenant, Stack};
use ivm_domain::OutboxStatus;
use ivm_workflow::{OutboxWorker, SlicingOutboxProcessor, WorkerConfig};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;

fn worker(stack: &Stack) -> OutboxWorker {
  let processor = Arc::new(SlicingOutboxProcessor::new(stack.slicing.clone(), stack.fanout.clone()));
  let config = WorkerConfig { backoff_base: Duration::from_millis(1),
                              backoff_max: Duration::from_millis(2),
                              ..WorkerConfig::default() };
  OutboxWorker::new(stack.outbox.clone(), processor, config)
}

#[tokio::test]
async fn ingest_slice_update_and_query() {
  let stack = Stack::new();
  let worker = worker(&stack);
  let t = tenant("acme");
  let key = product(&t, "p1");

  stack.ingest(&brand(&t, "b1"), 1, json!({"name": "Acme"})).await;
  assert_eq!(worker.poll_once().await.unwrap().processed, 1);
  stack.ingest(&key, 1, json!({"title": "Lamp", "price": 30, "brand_id": "b1", "tags": ["home"]})).await;
  assert_eq!(worker.poll_once().await.unwrap().processed, 1);

  let v1 = stack.query.query_view(&t, &key, 1, &detail_view(), false).await.unwrap();
  assert_eq!(v1.slices["CORE"], json!({"title": "Lamp", "price": 30, "tags": ["home"]}));

  // price change: CORE and PRICE recomputed, BRAND carried over
  stack.ingest(&key, 2, json!({"title": "Lamp", "price": 35, "brand_id": "b1", "tags": ["home"]})).await;
  assert_eq!(worker.poll_once().await.unwrap().processed, 1);

  let v2 = stack.query.query_view(&t, &key, 2, &detail_view(), false).await.unwrap();
  assert_eq!(v2.slices["PRICE"]["amount"], 35);
  assert_ne!(v1.hashes["PRICE"], v2.hashes["PRICE"]);

  let brand_v1 = stack.query.get_slices(&t, &key, 1, &["BRAND".to_string()], false).await.unwrap();
  let brand_v2 = stack.query.get_slices(&t, &key, 2, &["BRAND".to_string()], false).await.unwrap();
  assert_eq!(brand_v1.hashes["BRAND"], brand_v2.hashes["BRAND"]);

  // upstream change fans out to the product through the reverse index
  stack.ingest(&brand(&t, "b1"), 2, json!({"name": "Acme Corp"})).await;
  assert_eq!(worker.poll_once().await.unwrap().processed, 1);
  let refreshed = stack.query.get_slices(&t, &key, 2, &["BRAND".to_string()], false).await.unwrap();
  assert_eq!(refreshed.slices["BRAND"]["brand"]["name"], "Acme Corp");
  let untouched = stack.query.get_slices(&t, &key, 1, &["BRAND".to_string()], false).await.unwrap();
  assert_eq!(untouched.slices["BRAND"]["brand"]["name"], "Acme");
  assert!(stack.query.get_slices(&t, &key, 3, &["BRAND".to_string()], false).await.is_err());

  assert!(stack.outbox.snapshot().iter().all(|e| e.status == OutboxStatus::Processed));
}

#[tokio::test]
async fn title_change_keeps_price_and_history() {
  let stack = Stack::new();
  let worker = worker(&stack);
  let t = tenant("acme");
  let key = product(&t, "p1");

  stack.ingest(&key, 1, json!({"title": "A", "price": 100})).await;
  assert_eq!(worker.poll_once().await.unwrap().processed, 1);
  stack.ingest(&key, 2, json!({"title": "B", "price": 100})).await;
  assert_eq!(worker.poll_once().await.unwrap().processed, 1);

  let v1 = stack.query.query_view(&t, &key, 1, &detail_view(), false).await.unwrap();
  let v2 = stack.query.query_view(&t, &key, 2, &detail_view(), false).await.unwrap();
  assert_eq!(v1.slices["CORE"]["title"], "A");
  assert_eq!(v2.slices["CORE"]["title"], "B");
  assert_ne!(v1.hashes["CORE"], v2.hashes["CORE"]);
  assert_eq!(v1.hashes["PRICE"], v2.hashes["PRICE"]);
  assert_eq!(v2.slices["PRICE"], json!({"amount": 100, "currency": "EUR"}));
}
