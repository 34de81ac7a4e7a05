use anyhow::Context;
use ivm_domain::{ContractRef, EntityKey, TenantId};
use ivm_store::stubs::{InMemoryInvertedIndexRepository, InMemoryOutboxRepository, InMemoryRawDataRepository,
                       InMemorySliceRepository};
use ivm_store::InMemoryContractRegistry;
use ivm_workflow::{FanoutWorkflow, IngestRequest, IngestService, IvmConfig, OutboxWorker, QueryWorkflow,
                   SlicingOutboxProcessor, SlicingWorkflow};
use log::info;
use serde_json::json;
use std::sync::Arc;

const PRODUCT_RULES: &str = r#"{
  "id": "product", "version": 1, "entity_type": "PRODUCT",
  "slices": [
    {"slice_type": "CORE", "rule": {"kind": "pass_through", "paths": ["/title", "/price"]}},
    {"slice_type": "BRAND",
     "rule": {"kind": "join_merge", "base_paths": ["/brand_id"], "joins": ["brand"]},
     "joins": [{"name": "brand", "source_path": "/brand_id", "target_entity_type": "BRAND"}]}
  ],
  "impact_map": {"CORE": ["/title", "/price"], "BRAND": ["/brand_id"]},
  "no_impact_paths": ["/updated_at"],
  "indexes": [{"index_type": "product_by_brand_id", "selector": "/brand_id", "references": "BRAND",
               "max_fanout": 100, "circuit_breaker_action": "SKIP"}]
}"#;

const BRAND_RULES: &str = r#"{
  "id": "brand", "version": 1, "entity_type": "BRAND",
  "slices": [{"slice_type": "CORE", "rule": {"kind": "pass_through", "paths": ["/name"]}}],
  "impact_map": {"CORE": ["/name"]}
}"#;

const PRODUCT_VIEW: &str = r#"{"id": "product_page", "version": 1, "required_slices": ["CORE", "BRAND"]}"#;

/// Demo de extremo a extremo sobre los repositorios en memoria: ingesta,
/// worker de outbox, troceado incremental, fanout y consulta de una vista.
#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt::init();
    let config = IvmConfig::from_env().context("configuración IVM_* inválida")?;

    let outbox = Arc::new(InMemoryOutboxRepository::new());
    let raw = Arc::new(InMemoryRawDataRepository::new(outbox.clone()));
    let slices = Arc::new(InMemorySliceRepository::new());
    let index = Arc::new(InMemoryInvertedIndexRepository::new());
    let registry = Arc::new(InMemoryContractRegistry::new());
    registry.register_rule_set_json(PRODUCT_RULES)?;
    registry.register_rule_set_json(BRAND_RULES)?;
    let view = registry.register_view_definition_json(PRODUCT_VIEW)?;

    let slicing = SlicingWorkflow::new(raw.clone(), slices.clone(), index.clone(), registry.clone());
    let fanout = FanoutWorkflow::new(registry.clone(), index.clone(), slicing.clone(), config.fanout.clone());
    let ingest = IngestService::new(raw.clone());
    let query = QueryWorkflow::new(slices.clone(), registry.clone());
    let processor = Arc::new(SlicingOutboxProcessor::new(slicing, fanout));
    let worker = OutboxWorker::new(outbox.clone(), processor, config.worker.clone());

    let tenant = TenantId::new("demo")?;
    let brand = EntityKey::new("BRAND", &tenant, "b1")?;
    let product = EntityKey::new("PRODUCT", &tenant, "p1")?;

    let steps = [(&brand, 1, json!({"name": "Acme"})),
                 (&product, 1, json!({"title": "Lamp", "price": 30, "brand_id": "b1"})),
                 (&product, 2, json!({"title": "Lamp", "price": 35, "brand_id": "b1"})),
                 (&brand, 2, json!({"name": "Acme Corp"}))];
    for (key, version, payload) in steps {
        let outcome = ingest.ingest(IngestRequest { tenant_id: tenant.clone(),
                                                    entity_key: key.clone(),
                                                    version,
                                                    schema_id: key.entity_type().to_lowercase(),
                                                    schema_version: 1,
                                                    payload })
                            .await?;
        info!("{} v{}: {:?}", key, version, outcome);
        let stats = worker.poll_once().await?;
        info!("sondeo: {:?}", stats);
    }

    // El fanout del cambio de marca publicó una revisión de la versión 2.
    for version in 1..=2 {
        let page = query.query_view(&tenant, &product, version, &view, false).await?;
        println!("{} v{} -> {}", product, version, serde_json::to_string_pretty(&page.slices)?);
    }
    print_missing(&query, &tenant, &view).await;

    let handle = worker.spawn();
    let graceful = handle.shutdown().await;
    info!("worker detenido (ordenado={}), slices almacenados: {}", graceful, slices.len());
    Ok(())
}

/// Una vista FAIL_CLOSED sobre una entidad sin slices falla con MissingSlice.
async fn print_missing(query: &QueryWorkflow, tenant: &TenantId, view: &ContractRef) {
    let ghost = match EntityKey::new("PRODUCT", tenant, "ghost") {
        Ok(k) => k,
        Err(e) => {
            eprintln!("{}", e);
            return;
        }
    };
    match query.query_view(tenant, &ghost, 1, view, false).await {
        Ok(page) => println!("inesperado: {:?}", page),
        Err(e) => println!("{} -> {:?}: {}", ghost, e.class(), e),
    }
}
