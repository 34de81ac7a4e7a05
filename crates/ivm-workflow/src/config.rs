use crate::errors::{Result, WorkflowError};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

/// Configuración del worker de outbox.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
  /// Entradas leídas por sondeo.
  pub batch_size: usize,
  /// Entradas procesadas en paralelo dentro de un lote.
  pub concurrency: usize,
  /// Espera tras un sondeo con trabajo.
  pub active_poll_interval: Duration,
  /// Espera tras un sondeo vacío.
  pub idle_poll_interval: Duration,
  /// Intentos en proceso antes de marcar la entrada como FAILED.
  pub max_attempts: u32,
  pub backoff_base: Duration,
  pub backoff_max: Duration,
  /// Si se indica, sólo se sondean entradas de este tipo de evento.
  pub event_type: Option<String>,
  /// Tiempo máximo que el apagado espera al lote en curso.
  pub shutdown_timeout: Duration,
  /// Antigüedad a partir de la cual una entrada RETRYING se considera
  /// abandonada y vuelve a PENDING. Debe superar el backoff máximo.
  pub lease_timeout: Duration,
}

impl Default for WorkerConfig {
  fn default() -> Self {
    WorkerConfig { batch_size: 50,
                   concurrency: 4,
                   active_poll_interval: Duration::from_millis(100),
                   idle_poll_interval: Duration::from_millis(2_000),
                   max_attempts: 3,
                   backoff_base: Duration::from_millis(50),
                   backoff_max: Duration::from_millis(5_000),
                   event_type: None,
                   shutdown_timeout: Duration::from_secs(10),
                   lease_timeout: Duration::from_secs(300) }
  }
}

/// Configuración del fanout.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FanoutConfig {
  /// Re-troceados en paralelo por dependencia.
  pub concurrency: usize,
  /// Niveles de cascada permitidos (1 = sólo los downstream directos).
  pub max_depth: usize,
  /// Fallos consecutivos que abren el circuito de una dependencia.
  pub breaker_failure_threshold: u32,
  pub breaker_cooldown: Duration,
}

impl Default for FanoutConfig {
  fn default() -> Self {
    FanoutConfig { concurrency: 8,
                   max_depth: 3,
                   breaker_failure_threshold: 5,
                   breaker_cooldown: Duration::from_secs(30) }
  }
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IvmConfig {
  pub worker: WorkerConfig,
  pub fanout: FanoutConfig,
}

impl IvmConfig {
  /// Carga la configuración desde variables de entorno `IVM_*` (y `.env` si
  /// existe). Las variables ausentes toman el valor por defecto.
  pub fn from_env() -> Result<Self> {
    dotenvy::dotenv().ok();
    Self::from_lookup(|name| std::env::var(name).ok())
  }

  /// Igual que `from_env` pero leyendo de una función arbitraria.
  pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where F: Fn(&str) -> Option<String>
  {
    let mut cfg = IvmConfig::default();
    let w = &mut cfg.worker;
    set_parsed(&lookup, "IVM_OUTBOX_BATCH_SIZE", &mut w.batch_size)?;
    set_parsed(&lookup, "IVM_OUTBOX_CONCURRENCY", &mut w.concurrency)?;
    set_millis(&lookup, "IVM_OUTBOX_ACTIVE_POLL_MS", &mut w.active_poll_interval)?;
    set_millis(&lookup, "IVM_OUTBOX_IDLE_POLL_MS", &mut w.idle_poll_interval)?;
    set_parsed(&lookup, "IVM_OUTBOX_MAX_ATTEMPTS", &mut w.max_attempts)?;
    set_millis(&lookup, "IVM_OUTBOX_BACKOFF_BASE_MS", &mut w.backoff_base)?;
    set_millis(&lookup, "IVM_OUTBOX_BACKOFF_MAX_MS", &mut w.backoff_max)?;
    set_millis(&lookup, "IVM_SHUTDOWN_TIMEOUT_MS", &mut w.shutdown_timeout)?;
    set_millis(&lookup, "IVM_OUTBOX_LEASE_MS", &mut w.lease_timeout)?;
    if let Some(t) = lookup("IVM_OUTBOX_EVENT_TYPE").filter(|t| !t.trim().is_empty()) {
      w.event_type = Some(t.trim().to_string());
    }
    let f = &mut cfg.fanout;
    set_parsed(&lookup, "IVM_FANOUT_CONCURRENCY", &mut f.concurrency)?;
    set_parsed(&lookup, "IVM_FANOUT_MAX_DEPTH", &mut f.max_depth)?;
    set_parsed(&lookup, "IVM_BREAKER_FAILURE_THRESHOLD", &mut f.breaker_failure_threshold)?;
    set_millis(&lookup, "IVM_BREAKER_COOLDOWN_MS", &mut f.breaker_cooldown)?;
    cfg.validate()?;
    Ok(cfg)
  }

  pub fn validate(&self) -> Result<()> {
    let w = &self.worker;
    if w.batch_size == 0 || w.concurrency == 0 || w.max_attempts == 0 {
      return Err(WorkflowError::Validation("batch_size, concurrency y max_attempts deben ser > 0".into()));
    }
    if w.backoff_base > w.backoff_max {
      return Err(WorkflowError::Validation("IVM_OUTBOX_BACKOFF_BASE_MS no puede superar IVM_OUTBOX_BACKOFF_MAX_MS".into()));
    }
    if self.fanout.concurrency == 0 || self.fanout.max_depth == 0 || self.fanout.breaker_failure_threshold == 0 {
      return Err(WorkflowError::Validation("la configuración de fanout debe ser > 0".into()));
    }
    Ok(())
  }
}

fn set_parsed<F, T>(lookup: &F, name: &str, target: &mut T) -> Result<()>
  where F: Fn(&str) -> Option<String>,
        T: FromStr
{
  if let Some(raw) = lookup(name) {
    *target = raw.trim()
                 .parse()
                 .map_err(|_| WorkflowError::Validation(format!("{} no es un valor válido: '{}'", name, raw)))?;
  }
  Ok(())
}

fn set_millis<F>(lookup: &F, name: &str, target: &mut Duration) -> Result<()>
  where F: Fn(&str) -> Option<String>
{
  let mut ms = u64::try_from(target.as_millis()).unwrap_or(u64::MAX);
  set_parsed(lookup, name, &mut ms)?;
  *target = Duration::from_millis(ms);
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::HashMap;

  #[test]
  fn reads_overrides_and_keeps_defaults() {
    let vars = HashMap::from([("IVM_OUTBOX_BATCH_SIZE", "10"),
                              ("IVM_OUTBOX_IDLE_POLL_MS", "750"),
                              ("IVM_FANOUT_MAX_DEPTH", "1"),
                              ("IVM_OUTBOX_EVENT_TYPE", "RAW_DATA_INGESTED")]);
    let cfg = IvmConfig::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
    assert_eq!(cfg.worker.batch_size, 10);
    assert_eq!(cfg.worker.idle_poll_interval, Duration::from_millis(750));
    assert_eq!(cfg.worker.event_type.as_deref(), Some("RAW_DATA_INGESTED"));
    assert_eq!(cfg.fanout.max_depth, 1);
    assert_eq!(cfg.worker.concurrency, WorkerConfig::default().concurrency);
  }

  #[test]
  fn oversized_defaults_saturate_instead_of_wrapping() {
    let mut d = Duration::MAX;
    set_millis(&|_: &str| None, "IVM_OUTBOX_LEASE_MS", &mut d).unwrap();
    assert_eq!(d, Duration::from_millis(u64::MAX));

    let cfg = IvmConfig::from_lookup(|k| (k == "IVM_OUTBOX_LEASE_MS").then(|| "1500".to_string())).unwrap();
    assert_eq!(cfg.worker.lease_timeout, Duration::from_millis(1500));
  }

  #[test]
  fn rejects_garbage_values() {
    let err = IvmConfig::from_lookup(|k| (k == "IVM_OUTBOX_BATCH_SIZE").then(|| "muchos".to_string()));
    assert!(matches!(err, Err(WorkflowError::Validation(_))));
    let zero = IvmConfig::from_lookup(|k| (k == "IVM_FANOUT_CONCURRENCY").then(|| "0".to_string()));
    assert!(zero.is_err());
  }
}
