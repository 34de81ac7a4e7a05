use crate::config::FanoutConfig;
use crate::engine::{canonical_index_value, reverse_index_type};
use crate::errors::{Result, WorkflowError};
use crate::resilience::{BreakerState, CircuitBreaker};
use crate::workflows::slicing::{ensure_tenant, SlicingOutcome, SlicingWorkflow};
use dashmap::DashMap;
use ivm_domain::{CircuitBreakerAction, EntityKey, TenantId, Version};
use ivm_store::{ContractRegistry, InvertedIndexRepository};
use log::{error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Relación "el tipo downstream referencia al upstream", inferida de los
/// `IndexSpec` con `references`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutDependency {
  /// Tipo del índice inverso que se consulta.
  pub index_type: String,
  pub downstream_entity_type: String,
  pub upstream_entity_type: String,
  pub max_fanout: usize,
  pub circuit_breaker_action: CircuitBreakerAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FanoutStatus {
  Success,
  PartialFailure,
  Failed,
}

/// Recuento de una dependencia procesada para una entidad upstream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencyReport {
  pub index_type: String,
  pub upstream_key: EntityKey,
  pub downstream_entity_type: String,
  /// Nivel de cascada (1 = downstream directos del cambio original).
  pub depth: usize,
  pub total_affected: usize,
  pub processed: usize,
  pub skipped: usize,
  pub failed: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FanoutResult {
  pub upstream_key: EntityKey,
  pub upstream_version: Version,
  pub dependencies: Vec<DependencyReport>,
  pub total_affected: usize,
  pub processed: usize,
  pub skipped: usize,
  pub failed: usize,
  pub status: FanoutStatus,
}

impl FanoutResult {
  fn new(upstream_key: &EntityKey, upstream_version: Version, dependencies: Vec<DependencyReport>) -> Self {
    let sum = |f: fn(&DependencyReport) -> usize| dependencies.iter().map(f).sum::<usize>();
    let (total_affected, processed, skipped, failed) =
      (sum(|d| d.total_affected), sum(|d| d.processed), sum(|d| d.skipped), sum(|d| d.failed));
    let status = match (processed, failed) {
      (_, 0) => FanoutStatus::Success,
      (0, _) => FanoutStatus::Failed,
      _ => FanoutStatus::PartialFailure,
    };
    Self { upstream_key: upstream_key.clone(),
           upstream_version,
           dependencies,
           total_affected,
           processed,
           skipped,
           failed,
           status }
  }
}

/// Propaga el cambio de una entidad upstream a las entidades que la
/// referencian, re-troceándolas con paralelismo acotado. El re-troceado
/// publica una revisión de la última versión de cada downstream; nunca crea
/// versiones de datos crudos.
#[derive(Clone)]
pub struct FanoutWorkflow {
  registry: Arc<dyn ContractRegistry>,
  index_repo: Arc<dyn InvertedIndexRepository>,
  slicing: SlicingWorkflow,
  config: FanoutConfig,
  breakers: Arc<DashMap<String, CircuitBreaker>>,
}

impl FanoutWorkflow {
  pub fn new(registry: Arc<dyn ContractRegistry>,
             index_repo: Arc<dyn InvertedIndexRepository>,
             slicing: SlicingWorkflow,
             config: FanoutConfig)
             -> Self {
    Self { registry,
           index_repo,
           slicing,
           config,
           breakers: Arc::new(DashMap::new()) }
  }

  /// Dependencias cuyo upstream es `upstream_type`, una por índice inverso.
  pub async fn infer_dependencies(&self, upstream_type: &str) -> Result<Vec<FanoutDependency>> {
    let upstream = upstream_type.trim().to_uppercase();
    let mut seen = HashSet::new();
    let mut deps = Vec::new();
    for rs in self.registry.rule_sets().await? {
      for spec in &rs.indexes {
        let Some(references) = spec.references.as_deref() else { continue };
        if !references.trim().eq_ignore_ascii_case(&upstream) {
          continue;
        }
        let index_type = reverse_index_type(&rs.entity_type, &upstream);
        if seen.insert(index_type.clone()) {
          deps.push(FanoutDependency { index_type,
                                       downstream_entity_type: rs.entity_type.trim().to_uppercase(),
                                       upstream_entity_type: upstream.clone(),
                                       max_fanout: spec.max_fanout,
                                       circuit_breaker_action: spec.circuit_breaker_action });
        }
      }
    }
    Ok(deps)
  }

  /// Re-trocea los downstream de `upstream_key` y, en cascada, los de las
  /// entidades que publicaron una revisión nueva, hasta `max_depth` niveles.
  pub async fn on_entity_change(&self,
                                tenant: &TenantId,
                                upstream_type: &str,
                                upstream_key: &EntityKey,
                                upstream_version: Version)
                                -> Result<FanoutResult> {
    ensure_tenant(tenant, upstream_key)?;
    let mut reports = Vec::new();
    let mut visited: HashSet<EntityKey> = HashSet::from([upstream_key.clone()]);
    let mut queue = VecDeque::from([(upstream_key.clone(), upstream_type.trim().to_uppercase(), 1usize)]);

    while let Some((key, entity_type, depth)) = queue.pop_front() {
      for dep in self.infer_dependencies(&entity_type).await? {
        let (report, changed) = self.process_dependency(tenant, &key, &dep, depth, &mut visited).await?;
        reports.push(report);
        if depth < self.config.max_depth {
          for k in changed {
            let t = k.entity_type().to_string();
            queue.push_back((k, t, depth + 1));
          }
        }
      }
    }

    let result = FanoutResult::new(upstream_key, upstream_version, reports);
    info!("fanout {} v{}: afectados={} procesados={} omitidos={} fallidos={} ({:?})",
          upstream_key,
          upstream_version,
          result.total_affected,
          result.processed,
          result.skipped,
          result.failed,
          result.status);
    Ok(result)
  }

  async fn process_dependency(&self,
                              tenant: &TenantId,
                              upstream_key: &EntityKey,
                              dep: &FanoutDependency,
                              depth: usize,
                              visited: &mut HashSet<EntityKey>)
                              -> Result<(DependencyReport, Vec<EntityKey>)> {
    let value = canonical_index_value(upstream_key.local_id());
    let entries = self.index_repo.query_by_index_type(tenant, &dep.index_type, &value).await?;
    let targets: Vec<EntityKey> =
      entries.into_iter()
             .filter(|e| {
               e.ref_entity_key.as_ref().map(|r| r.entity_type() == upstream_key.entity_type()).unwrap_or(false)
             })
             .map(|e| e.target_entity_key)
             .filter(|k| !visited.contains(k))
             .collect::<BTreeSet<_>>()
             .into_iter()
             .collect();

    let mut report = DependencyReport { index_type: dep.index_type.clone(),
                                        upstream_key: upstream_key.clone(),
                                        downstream_entity_type: dep.downstream_entity_type.clone(),
                                        depth,
                                        total_affected: targets.len(),
                                        processed: 0,
                                        skipped: 0,
                                        failed: 0 };
    if targets.is_empty() {
      return Ok((report, Vec::new()));
    }

    if targets.len() > dep.max_fanout {
      let count = targets.len();
      self.short_circuit(&mut report, dep, count, &format!("{} entidades superan max_fanout={}", count, dep.max_fanout));
      return Ok((report, Vec::new()));
    }
    let Some(trial) = self.admit(&dep.index_type) else {
      let count = targets.len();
      self.short_circuit(&mut report, dep, count, "circuito abierto");
      return Ok((report, Vec::new()));
    };

    visited.extend(targets.iter().cloned());
    let mut changed = Vec::new();
    let mut pending = targets.into_iter();

    // Con el circuito semiabierto sólo la primera entidad hace de prueba.
    if trial {
      if let Some(first) = pending.next() {
        let result = self.slicing.reslice(tenant, &first).await;
        let ok = self.tally(&mut report, dep, first, result, &mut changed);
        if !ok {
          let rest = pending.len();
          if rest > 0 {
            self.short_circuit(&mut report, dep, rest, "prueba del circuito semiabierto fallida");
          }
          return Ok((report, changed));
        }
      }
    }

    let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
    let mut set: JoinSet<(EntityKey, Result<SlicingOutcome>)> = JoinSet::new();
    for target in pending {
      let slicing = self.slicing.clone();
      let tenant = tenant.clone();
      let semaphore = semaphore.clone();
      set.spawn(async move {
        let result = match semaphore.acquire_owned().await {
          Ok(_permit) => slicing.reslice(&tenant, &target).await,
          Err(_) => Err(WorkflowError::Storage("semáforo de fanout cerrado".into())),
        };
        (target, result)
      });
    }

    while let Some(joined) = set.join_next().await {
      match joined {
        Ok((target, result)) => {
          self.tally(&mut report, dep, target, result, &mut changed);
        }
        Err(e) => {
          report.failed += 1;
          self.record(&dep.index_type, false);
          error!("fanout {}: tarea abortada: {}", dep.index_type, e);
        }
      }
    }
    changed.sort();
    Ok((report, changed))
  }

  /// Contabiliza el re-troceado de una entidad. Devuelve si tuvo éxito.
  fn tally(&self,
           report: &mut DependencyReport,
           dep: &FanoutDependency,
           target: EntityKey,
           result: Result<SlicingOutcome>,
           changed: &mut Vec<EntityKey>)
           -> bool {
    match result {
      Ok(outcome) => {
        report.processed += 1;
        self.record(&dep.index_type, true);
        if outcome.changed {
          changed.push(target);
        }
        true
      }
      Err(e) => {
        report.failed += 1;
        self.record(&dep.index_type, false);
        warn!("fanout {}: re-troceado de {} falló: {}", dep.index_type, target, e);
        false
      }
    }
  }

  /// Aplica la acción del circuit breaker a `count` entidades sin tocarlas.
  fn short_circuit(&self, report: &mut DependencyReport, dep: &FanoutDependency, count: usize, why: &str) {
    match dep.circuit_breaker_action {
      CircuitBreakerAction::Skip => {
        report.skipped += count;
        warn!("fanout {} desde {} omitido: {}", dep.index_type, report.upstream_key, why);
      }
      CircuitBreakerAction::Error => {
        report.failed += count;
        error!("fanout {} desde {} fallido: {}", dep.index_type, report.upstream_key, why);
      }
    }
  }

  /// `None` si el circuito rechaza la dependencia; `Some(true)` si la
  /// llamada admitida es la prueba del estado semiabierto.
  fn admit(&self, index_type: &str) -> Option<bool> {
    let mut breaker = self.breakers.entry(index_type.to_string()).or_insert_with(|| {
                                    CircuitBreaker::new(self.config.breaker_failure_threshold,
                                                        self.config.breaker_cooldown)
                                  });
    let closed = breaker.state() == BreakerState::Closed;
    breaker.allow().then_some(!closed)
  }

  fn record(&self, index_type: &str, success: bool) {
    if let Some(mut breaker) = self.breakers.get_mut(index_type) {
      if success {
        breaker.record_success();
      } else {
        breaker.record_failure();
      }
    }
  }
}
