// Archivo: worker.rs
// Propósito: worker de sondeo del outbox. Lee entradas PENDING, las procesa
// con concurrencia acotada y reintentos locales, y deja el resultado en el
// estado de cada entrada. Ningún error de procesamiento sale del worker.
use crate::config::WorkerConfig;
use crate::errors::{Result, WorkflowError};
use crate::resilience::Backoff;
use crate::workflows::{FanoutStatus, FanoutWorkflow, SlicingWorkflow};
use async_trait::async_trait;
use ivm_domain::{OutboxEntry, RawDataIngested, RAW_DATA_INGESTED};
use ivm_store::{OutboxRepository, StoreError};
use log::{debug, error, info, warn};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Semaphore};
use tokio::task::{JoinHandle, JoinSet};
use uuid::Uuid;

/// Procesa una entrada de outbox. Debe ser idempotente: el worker puede
/// entregar la misma entrada más de una vez.
#[async_trait]
pub trait OutboxProcessor: Send + Sync {
  async fn process(&self, entry: &OutboxEntry) -> Result<()>;
}

/// Procesador de `RAW_DATA_INGESTED`: troceado automático y fanout hacia
/// las entidades que referencian a esta.
///
/// El fanout corre para cada versión nueva aunque los slices propios no
/// cambien: los downstream embeben el raw data completo vía joins. Una
/// entrega repetida no tiene efecto, porque el re-troceado sólo publica
/// revisiones cuyo contenido difiere del vigente.
#[derive(Clone)]
pub struct SlicingOutboxProcessor {
  slicing: SlicingWorkflow,
  fanout: FanoutWorkflow,
}

impl SlicingOutboxProcessor {
  pub fn new(slicing: SlicingWorkflow, fanout: FanoutWorkflow) -> Self {
    Self { slicing, fanout }
  }
}

#[async_trait]
impl OutboxProcessor for SlicingOutboxProcessor {
  async fn process(&self, entry: &OutboxEntry) -> Result<()> {
    if entry.event_type != RAW_DATA_INGESTED {
      return Err(WorkflowError::Validation(format!("tipo de evento desconocido: {}", entry.event_type)));
    }
    let event = RawDataIngested::from_entry(entry)?;
    let outcome = self.slicing
                      .execute_auto(&event.tenant_id, &event.entity_key, event.version)
                      .await?;
    debug!("{} v{}: troceado {:?}, cambiado={}", event.entity_key, event.version, outcome.mode, outcome.changed);
    let result = self.fanout
                     .on_entity_change(&event.tenant_id,
                                       event.entity_key.entity_type(),
                                       &event.entity_key,
                                       event.version)
                     .await?;
    match result.status {
      FanoutStatus::Success => Ok(()),
      FanoutStatus::PartialFailure => {
        warn!("fanout parcial desde {}: {} fallidos de {}", event.entity_key, result.failed, result.total_affected);
        Ok(())
      }
      FanoutStatus::Failed => Err(WorkflowError::Validation(format!("fanout desde {} fallido ({} entidades)",
                                                                    event.entity_key, result.failed))),
    }
  }
}

/// Recuento de un sondeo.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollStats {
  pub fetched: usize,
  pub processed: usize,
  pub failed: usize,
  /// Reintentos locales realizados en el lote.
  pub retries: usize,
}

/// Recuento de un reencolado de entradas FAILED.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequeueStats {
  pub requeued: usize,
  /// Entradas que agotaron `MAX_OUTBOX_RETRIES` y quedan en FAILED.
  pub exhausted: usize,
}

pub struct OutboxWorker {
  outbox: Arc<dyn OutboxRepository>,
  processor: Arc<dyn OutboxProcessor>,
  config: WorkerConfig,
  backoff: Backoff,
}

impl OutboxWorker {
  pub fn new(outbox: Arc<dyn OutboxRepository>, processor: Arc<dyn OutboxProcessor>, config: WorkerConfig) -> Self {
    let backoff = Backoff::new(config.backoff_base, config.backoff_max);
    Self { outbox,
           processor,
           config,
           backoff }
  }

  /// Un ciclo: libera las entradas con lease vencido, lee un lote, lo
  /// procesa y registra el resultado de cada entrada. Sólo devuelve `Err` si
  /// falla el propio repositorio de outbox.
  pub async fn poll_once(&self) -> Result<PollStats> {
    let released = self.outbox.release_stale_retrying(self.config.lease_timeout).await?;
    if released > 0 {
      warn!("outbox: {} entradas RETRYING con lease vencido vuelven a PENDING", released);
    }
    let batch = match &self.config.event_type {
      Some(t) => self.outbox.find_pending_by_type(t, self.config.batch_size).await?,
      None => self.outbox.find_pending(self.config.batch_size).await?,
    };
    let mut stats = PollStats { fetched: batch.len(), ..PollStats::default() };
    if batch.is_empty() {
      return Ok(stats);
    }

    let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
    let mut set: JoinSet<(Uuid, std::result::Result<(), String>, usize)> = JoinSet::new();
    let mut in_flight: HashSet<Uuid> = batch.iter().map(|e| e.id).collect();
    for entry in batch {
      let outbox = self.outbox.clone();
      let processor = self.processor.clone();
      let semaphore = semaphore.clone();
      let backoff = self.backoff;
      let max_attempts = self.config.max_attempts;
      set.spawn(async move {
        let id = entry.id;
        match semaphore.acquire_owned().await {
          Ok(_permit) => {
            let (result, retries) =
              process_with_retries(outbox.as_ref(), processor.as_ref(), &entry, backoff, max_attempts).await;
            (id, result, retries)
          }
          Err(_) => (id, Err("semáforo del worker cerrado".to_string()), 0),
        }
      });
    }

    let mut done = Vec::new();
    let mut failures = Vec::new();
    let mut aborted = Vec::new();
    while let Some(joined) = set.join_next().await {
      match joined {
        Ok((id, Ok(()), retries)) => {
          in_flight.remove(&id);
          stats.retries += retries;
          done.push(id);
        }
        Ok((id, Err(reason), retries)) => {
          in_flight.remove(&id);
          stats.retries += retries;
          failures.push((id, reason));
        }
        Err(e) => {
          error!("tarea del worker abortada: {}", e);
          aborted.push(e.to_string());
        }
      }
    }
    // Las tareas que entraron en pánico no devuelven su id: son las que
    // quedan en vuelo.
    let reason = aborted.first().cloned().unwrap_or_else(|| "tarea abortada".to_string());
    failures.extend(in_flight.into_iter().map(|id| (id, format!("tarea abortada: {}", reason))));

    if !done.is_empty() {
      self.outbox.mark_processed(&done).await?;
    }
    for (id, reason) in &failures {
      error!("outbox {} FAILED: {}", id, reason);
      self.outbox.mark_failed(id, reason).await?;
    }
    stats.processed = done.len();
    stats.failed = failures.len();
    info!("outbox: {} leídas, {} procesadas, {} fallidas, {} reintentos",
          stats.fetched,
          stats.processed,
          stats.failed,
          stats.retries);
    Ok(stats)
  }

  /// Devuelve a PENDING las entradas FAILED que aún tienen presupuesto de
  /// reintentos.
  pub async fn requeue_failed(&self, limit: usize) -> Result<RequeueStats> {
    let mut stats = RequeueStats::default();
    for entry in self.outbox.find_failed(limit).await? {
      match self.outbox.reset_to_pending(&entry.id).await {
        Ok(()) => stats.requeued += 1,
        Err(StoreError::RetryBudgetExhausted(m)) => {
          stats.exhausted += 1;
          error!("outbox {} sin reintentos: requiere intervención ({})", entry.id, m);
        }
        Err(e) => return Err(e.into()),
      }
    }
    if stats.requeued > 0 || stats.exhausted > 0 {
      warn!("outbox: {} reencoladas, {} agotadas", stats.requeued, stats.exhausted);
    }
    Ok(stats)
  }

  /// Bucle de sondeo hasta que `shutdown` pase a `true`. El lote en curso
  /// siempre termina antes de salir.
  pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
    info!("worker de outbox iniciado (lote={}, concurrencia={})",
          self.config.batch_size,
          self.config.concurrency);
    loop {
      if *shutdown.borrow() {
        break;
      }
      let wait = match self.poll_once().await {
        Ok(stats) if stats.fetched > 0 => self.config.active_poll_interval,
        Ok(_) => self.config.idle_poll_interval,
        Err(e) => {
          warn!("sondeo de outbox fallido: {}", e);
          self.config.idle_poll_interval
        }
      };
      tokio::select! {
        _ = tokio::time::sleep(wait) => {}
        changed = shutdown.changed() => {
          if changed.is_err() {
            break;
          }
        }
      }
    }
    info!("worker de outbox detenido");
  }

  /// Lanza `run` en una tarea de tokio.
  pub fn spawn(self) -> WorkerHandle {
    let (tx, rx) = watch::channel(false);
    let timeout = self.config.shutdown_timeout;
    let task = tokio::spawn(async move { self.run(rx).await });
    WorkerHandle { shutdown: tx, task, timeout }
  }
}

async fn process_with_retries(outbox: &dyn OutboxRepository,
                              processor: &dyn OutboxProcessor,
                              entry: &OutboxEntry,
                              backoff: Backoff,
                              max_attempts: u32)
                              -> (std::result::Result<(), String>, usize) {
  let mut attempt = 0u32;
  loop {
    match processor.process(entry).await {
      Ok(()) => return (Ok(()), attempt as usize),
      Err(e) if e.is_retryable() && attempt + 1 < max_attempts => {
        let delay = backoff.delay(attempt);
        warn!("outbox {} intento {} fallido ({}); reintento en {:?}", entry.id, attempt + 1, e, delay);
        if let Err(se) = outbox.mark_retrying(&entry.id).await {
          warn!("outbox {}: no se pudo marcar RETRYING: {}", entry.id, se);
        }
        tokio::time::sleep(delay).await;
        attempt += 1;
      }
      Err(e) => return (Err(e.to_string()), attempt as usize),
    }
  }
}

/// Control de un worker lanzado con `spawn`.
pub struct WorkerHandle {
  shutdown: watch::Sender<bool>,
  task: JoinHandle<()>,
  timeout: Duration,
}

impl WorkerHandle {
  /// Pide el apagado y espera al lote en curso. Devuelve `false` si hubo
  /// que abortar la tarea al vencer el timeout; las entradas que quedaran
  /// en RETRYING vuelven a PENDING cuando vence `lease_timeout`.
  pub async fn shutdown(self) -> bool {
    let timeout = self.timeout;
    self.shutdown_with_timeout(timeout).await
  }

  pub async fn shutdown_with_timeout(mut self, timeout: Duration) -> bool {
    let _ = self.shutdown.send(true);
    match tokio::time::timeout(timeout, &mut self.task).await {
      Ok(_) => true,
      Err(_) => {
        warn!("el worker no terminó en {:?}; se aborta", timeout);
        self.task.abort();
        false
      }
    }
  }
}
