// Archivo: resilience.rs
// Propósito: circuit breaker por dependencia de fanout y backoff exponencial
// con jitter para los reintentos del worker de outbox.
use rand::Rng;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
  Closed,
  Open,
  HalfOpen,
}

/// Circuit breaker clásico de tres estados.
///
/// Se abre tras `failure_threshold` fallos consecutivos; pasado `cooldown`
/// deja pasar una única llamada de prueba (HalfOpen) que lo cierra si tiene
/// éxito y lo vuelve a abrir si falla. Mientras la prueba no termina, el
/// resto de llamadas se rechaza.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
  state: BreakerState,
  consecutive_failures: u32,
  failure_threshold: u32,
  cooldown: Duration,
  opened_at: Option<Instant>,
  trial_in_flight: bool,
}

impl CircuitBreaker {
  pub fn new(failure_threshold: u32, cooldown: Duration) -> Self {
    Self { state: BreakerState::Closed,
           consecutive_failures: 0,
           failure_threshold: failure_threshold.max(1),
           cooldown,
           opened_at: None,
           trial_in_flight: false }
  }

  pub fn state(&self) -> BreakerState {
    self.state
  }

  /// Indica si se puede intentar la llamada. Transiciona Open -> HalfOpen
  /// cuando venció el cooldown y reserva la llamada de prueba.
  pub fn allow(&mut self) -> bool {
    match self.state {
      BreakerState::Closed => true,
      BreakerState::HalfOpen => {
        if self.trial_in_flight {
          return false;
        }
        self.trial_in_flight = true;
        true
      }
      BreakerState::Open => {
        let expired = self.opened_at.map(|t| t.elapsed() >= self.cooldown).unwrap_or(true);
        if expired {
          self.state = BreakerState::HalfOpen;
          self.trial_in_flight = true;
        }
        expired
      }
    }
  }

  pub fn record_success(&mut self) {
    self.state = BreakerState::Closed;
    self.consecutive_failures = 0;
    self.opened_at = None;
    self.trial_in_flight = false;
  }

  pub fn record_failure(&mut self) {
    self.trial_in_flight = false;
    self.consecutive_failures = self.consecutive_failures.saturating_add(1);
    if self.state == BreakerState::HalfOpen || self.consecutive_failures >= self.failure_threshold {
      self.state = BreakerState::Open;
      self.opened_at = Some(Instant::now());
    }
  }
}

/// Backoff exponencial con tope y jitter completo.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
  base: Duration,
  max: Duration,
}

impl Backoff {
  pub fn new(base: Duration, max: Duration) -> Self {
    Self { base, max: max.max(base) }
  }

  /// Techo del retardo para el intento `attempt` (0 = primer reintento).
  pub fn ceiling(&self, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.min(31)).unwrap_or(u32::MAX);
    self.base.saturating_mul(factor).min(self.max)
  }

  /// Retardo aleatorio en `[0, ceiling(attempt)]`.
  pub fn delay(&self, attempt: u32) -> Duration {
    let ceiling = u64::try_from(self.ceiling(attempt).as_millis()).unwrap_or(u64::MAX);
    if ceiling == 0 {
      return Duration::ZERO;
    }
    Duration::from_millis(rand::rng().random_range(0..=ceiling))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn breaker_opens_after_threshold_and_recovers() {
    let mut b = CircuitBreaker::new(2, Duration::from_millis(0));
    assert!(b.allow());
    b.record_failure();
    assert_eq!(b.state(), BreakerState::Closed);
    b.record_failure();
    assert_eq!(b.state(), BreakerState::Open);
    // cooldown cero: la siguiente llamada es de prueba
    assert!(b.allow());
    assert_eq!(b.state(), BreakerState::HalfOpen);
    b.record_success();
    assert_eq!(b.state(), BreakerState::Closed);
  }

  #[test]
  fn open_breaker_rejects_during_cooldown() {
    let mut b = CircuitBreaker::new(1, Duration::from_secs(60));
    b.record_failure();
    assert!(!b.allow());
    assert!(!b.allow());
  }

  #[test]
  fn half_open_failure_reopens() {
    let mut b = CircuitBreaker::new(3, Duration::from_millis(0));
    for _ in 0..3 {
      b.record_failure();
    }
    assert!(b.allow());
    b.record_failure();
    assert_eq!(b.state(), BreakerState::Open);
  }

  #[test]
  fn half_open_lets_a_single_trial_through() {
    let mut b = CircuitBreaker::new(1, Duration::from_millis(0));
    b.record_failure();
    assert!(b.allow());
    assert_eq!(b.state(), BreakerState::HalfOpen);
    // the trial has not reported yet
    assert!(!b.allow());
    assert!(!b.allow());
    b.record_success();
    assert!(b.allow());
    assert!(b.allow());
  }

  #[test]
  fn backoff_is_capped() {
    let b = Backoff::new(Duration::from_millis(50), Duration::from_millis(300));
    assert_eq!(b.ceiling(0), Duration::from_millis(50));
    assert_eq!(b.ceiling(2), Duration::from_millis(200));
    assert_eq!(b.ceiling(10), Duration::from_millis(300));
    assert!(b.delay(40) <= Duration::from_millis(300));
  }
}
