//! Bounded pool of engine sessions.
//!
//! Capacity is the only backpressure on the external engine: a session slot
//! is either leased or idle, and `leased + idle <= capacity` holds under the
//! pool mutex at all times. Leases hand their session back on drop, so every
//! exit path of a case execution releases exactly once.
use crate::engine::{Engine, EngineSession, SessionError, TraceChunk};
use crate::util::duration_ms;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub capacity: usize,
    pub acquire_timeout: Duration,
    /// Fresh sessions tried after a failed liveness check or open.
    pub max_substitutions: usize,
    pub ping_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            capacity: 2,
            acquire_timeout: Duration::from_secs(60),
            max_substitutions: 2,
            ping_timeout: Duration::from_secs(2),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("no engine session available after {waited_ms} ms: {reason}")]
    Exhausted { waited_ms: u64, reason: String },
}

/// Accounting snapshot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub leased: usize,
    pub idle: usize,
    pub peak_leased: usize,
    pub acquired: usize,
    pub released: usize,
    pub opened: usize,
    pub evicted: usize,
}

struct PooledSession {
    id: u64,
    session: Box<dyn EngineSession>,
}

#[derive(Default)]
struct PoolState {
    idle: Vec<PooledSession>,
    leased: usize,
    next_id: u64,
    stats: PoolStats,
}

pub struct SessionPool {
    engine: Arc<dyn Engine>,
    config: PoolConfig,
    state: Mutex<PoolState>,
    available: Condvar,
}

enum Slot {
    Reused(PooledSession),
    Fresh,
}

impl SessionPool {
    pub fn new(engine: Arc<dyn Engine>, config: PoolConfig) -> Self {
        let capacity = config.capacity.max(1);
        let state = PoolState {
            stats: PoolStats {
                capacity,
                ..PoolStats::default()
            },
            ..PoolState::default()
        };
        Self {
            engine,
            config: PoolConfig { capacity, ..config },
            state: Mutex::new(state),
            available: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.config.capacity
    }

    pub fn acquire_timeout(&self) -> Duration {
        self.config.acquire_timeout
    }

    pub fn engine_description(&self) -> String {
        self.engine.describe()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.lock();
        PoolStats {
            leased: state.leased,
            idle: state.idle.len(),
            ..state.stats
        }
    }

    /// Acquire a live session using the configured timeout.
    pub fn acquire(&self) -> Result<SessionLease<'_>, PoolError> {
        self.acquire_within(self.config.acquire_timeout)
    }

    /// Block until a slot frees up or `timeout` elapses, then hand out a
    /// session that passed its liveness check.
    pub fn acquire_within(&self, timeout: Duration) -> Result<SessionLease<'_>, PoolError> {
        let start = Instant::now();
        let deadline = start + timeout;
        let slot = self.reserve_slot(deadline, start)?;

        let mut last_error = None;
        if let Slot::Reused(mut pooled) = slot {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                self.restore_idle(pooled);
                return Err(Self::timed_out(start));
            }
            if pooled.session.ping(self.config.ping_timeout.min(remaining)) {
                return Ok(self.lease(pooled, start));
            }
            tracing::warn!(session_id = pooled.id, "idle session failed liveness check");
            pooled.session.close();
            self.lock().stats.evicted += 1;
            last_error = Some("idle session failed liveness check".to_string());
        }

        // The first fresh open is not a substitution when the slot was empty.
        let budget = if last_error.is_some() {
            self.config.max_substitutions
        } else {
            self.config.max_substitutions + 1
        };
        for attempt in 0..budget {
            if Instant::now() >= deadline {
                self.free_slot();
                return Err(PoolError::Exhausted {
                    waited_ms: duration_ms(start.elapsed()),
                    reason: format!(
                        "acquire timeout elapsed after {attempt} session opens ({})",
                        last_error.unwrap_or_else(|| "no open attempted".to_string())
                    ),
                });
            }
            match self.open_fresh() {
                Ok(pooled) => return Ok(self.lease(pooled, start)),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "engine session open failed");
                    last_error = Some(err.to_string());
                }
            }
        }

        self.free_slot();
        Err(PoolError::Exhausted {
            waited_ms: duration_ms(start.elapsed()),
            reason: format!(
                "session substitution budget spent ({})",
                last_error.unwrap_or_else(|| "no attempts allowed".to_string())
            ),
        })
    }

    fn timed_out(start: Instant) -> PoolError {
        PoolError::Exhausted {
            waited_ms: duration_ms(start.elapsed()),
            reason: "acquire timeout elapsed".to_string(),
        }
    }

    /// Undo a slot reservation that took an idle session.
    fn restore_idle(&self, pooled: PooledSession) {
        let mut state = self.lock();
        state.leased = state.leased.saturating_sub(1);
        state.idle.push(pooled);
        drop(state);
        self.available.notify_one();
    }

    fn reserve_slot(&self, deadline: Instant, start: Instant) -> Result<Slot, PoolError> {
        let mut state = self.lock();
        loop {
            if let Some(pooled) = state.idle.pop() {
                Self::mark_leased(&mut state);
                return Ok(Slot::Reused(pooled));
            }
            if state.leased + state.idle.len() < self.config.capacity {
                Self::mark_leased(&mut state);
                return Ok(Slot::Fresh);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(PoolError::Exhausted {
                    waited_ms: duration_ms(start.elapsed()),
                    reason: format!("all {} sessions in use", self.config.capacity),
                });
            }
            let (guard, _) = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            state = guard;
        }
    }

    fn mark_leased(state: &mut PoolState) {
        state.leased += 1;
        state.stats.peak_leased = state.stats.peak_leased.max(state.leased);
    }

    fn open_fresh(&self) -> Result<PooledSession, SessionError> {
        let session = self.engine.open_session()?;
        let mut state = self.lock();
        state.next_id += 1;
        state.stats.opened += 1;
        Ok(PooledSession {
            id: state.next_id,
            session,
        })
    }

    fn lease(&self, pooled: PooledSession, start: Instant) -> SessionLease<'_> {
        self.lock().stats.acquired += 1;
        tracing::debug!(
            session_id = pooled.id,
            waited_ms = start.elapsed().as_millis(),
            "session acquired"
        );
        SessionLease {
            pool: self,
            id: pooled.id,
            session: Some(pooled.session),
            healthy: true,
        }
    }

    fn free_slot(&self) {
        let mut state = self.lock();
        state.leased = state.leased.saturating_sub(1);
        drop(state);
        self.available.notify_one();
    }

    /// Return a lease to the pool. Equivalent to dropping it.
    pub fn release(&self, lease: SessionLease<'_>) {
        drop(lease);
    }

    fn give_back(&self, id: u64, mut session: Box<dyn EngineSession>, healthy: bool) {
        if !healthy {
            tracing::warn!(session_id = id, "evicting unhealthy session");
            session.close();
        }
        let mut state = self.lock();
        state.leased = state.leased.saturating_sub(1);
        state.stats.released += 1;
        if healthy {
            state.idle.push(PooledSession { id, session });
        } else {
            state.stats.evicted += 1;
        }
        drop(state);
        self.available.notify_one();
    }

    /// Close every idle session. Leased sessions close when released.
    pub fn close_idle(&self) {
        let idle = std::mem::take(&mut self.lock().idle);
        for mut pooled in idle {
            pooled.session.close();
        }
    }
}

impl Drop for SessionPool {
    fn drop(&mut self) {
        self.close_idle();
    }
}

/// Exclusive use of one pooled session.
pub struct SessionLease<'p> {
    pool: &'p SessionPool,
    id: u64,
    session: Option<Box<dyn EngineSession>>,
    healthy: bool,
}

impl SessionLease<'_> {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn send(&mut self, command: &str, timeout: Duration) -> Result<TraceChunk, SessionError> {
        match self.session.as_mut() {
            Some(session) => session.send(command, timeout),
            None => Err(SessionError::Closed("lease already released".to_string())),
        }
    }

    /// The session will be closed instead of reused when released.
    pub fn mark_unhealthy(&mut self) {
        self.healthy = false;
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy
    }
}

impl Drop for SessionLease<'_> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.give_back(self.id, session, self.healthy);
        }
    }
}
