//! Upstream API key pool with cooldown-aware rotation.
//!
//! All mutable rotation state lives behind one mutex so that selection,
//! cursor advance and lazy re-enabling happen as a single step.

use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;

/// Mask an API key for logging: first 4 + `****` + last 4 characters.
pub fn mask_key(key: &str) -> String {
    let chars: Vec<char> = key.chars().collect();
    if chars.len() <= 8 {
        return "****".to_string();
    }
    let head: String = chars[..4].iter().collect();
    let tail: String = chars[chars.len() - 4..].iter().collect();
    format!("{}****{}", head, tail)
}

/// How the pool picks among currently available keys.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum SelectionStrategy {
    #[default]
    RoundRobin,
    First,
    Random,
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RoundRobin => write!(f, "round-robin"),
            Self::First => write!(f, "first"),
            Self::Random => write!(f, "random"),
        }
    }
}

/// Time source for cooldown bookkeeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to. Used to simulate cooldown expiry.
#[cfg(test)]
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

#[cfg(test)]
impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += ChronoDuration::from_std(by).unwrap_or_else(|_| ChronoDuration::zero());
    }
}

#[cfg(test)]
impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Lifecycle events published by the pool. Keys are carried masked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyEvent {
    Disabled { key: String, until: DateTime<Utc> },
    Reenabled { key: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyPoolError {
    /// No keys were configured.
    Empty,
    /// Every key is cooling down; `until` is the soonest deadline.
    AllKeysDisabled {
        until: DateTime<Utc>,
        retry_after: Duration,
    },
}

impl fmt::Display for KeyPoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "No API keys configured"),
            Self::AllKeysDisabled { retry_after, .. } => write!(
                f,
                "All API keys are currently disabled; next key available in {:.2} seconds",
                retry_after.as_secs_f64()
            ),
        }
    }
}

impl std::error::Error for KeyPoolError {}

/// Point-in-time view of one key, safe to log or serialize.
#[derive(Debug, Clone, Serialize)]
pub struct KeyStatus {
    pub key: String,
    pub available: bool,
    pub disabled_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct PoolState {
    cursor: usize,
    disabled_until: HashMap<String, DateTime<Utc>>,
    last_selected: Option<String>,
}

pub struct KeyPool {
    keys: Vec<String>,
    cooldown: ChronoDuration,
    strategy: SelectionStrategy,
    sticky: bool,
    state: Mutex<PoolState>,
    clock: Arc<dyn Clock>,
    events: broadcast::Sender<KeyEvent>,
}

impl KeyPool {
    /// Create a pool over `keys` in rotation order. Fails if `keys` is empty.
    pub fn new(keys: Vec<String>, cooldown: Duration) -> Result<Self, KeyPoolError> {
        if keys.is_empty() {
            return Err(KeyPoolError::Empty);
        }
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            keys,
            cooldown: ChronoDuration::from_std(cooldown)
                .unwrap_or_else(|_| ChronoDuration::days(365)),
            strategy: SelectionStrategy::default(),
            sticky: false,
            state: Mutex::new(PoolState::default()),
            clock: Arc::new(SystemClock),
            events,
        })
    }

    pub fn with_strategy(mut self, strategy: SelectionStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Keep returning the previously selected key while it stays available.
    pub fn with_sticky(mut self, sticky: bool) -> Self {
        self.sticky = sticky;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn strategy(&self) -> SelectionStrategy {
        self.strategy
    }

    pub fn subscribe(&self) -> broadcast::Receiver<KeyEvent> {
        self.events.subscribe()
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// `now` plus the cooldown, saturating at the latest representable time.
    fn cooldown_deadline(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        now.checked_add_signed(self.cooldown)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn emit(&self, event: KeyEvent) {
        // No subscribers is the normal case.
        let _ = self.events.send(event);
    }

    /// Select the next key to use.
    pub fn next(&self) -> Result<String, KeyPoolError> {
        let mut state = self.lock();
        let now = self.clock.now();

        let mut available = vec![false; self.keys.len()];
        for (idx, key) in self.keys.iter().enumerate() {
            let deadline = state.disabled_until.get(key).copied();
            match deadline {
                None => available[idx] = true,
                Some(until) if until <= now => {
                    state.disabled_until.remove(key);
                    tracing::info!(key = %mask_key(key), "API key is now enabled again");
                    self.emit(KeyEvent::Reenabled { key: mask_key(key) });
                    available[idx] = true;
                }
                Some(_) => {}
            }
        }

        if !available.iter().any(|a| *a) {
            let until = state
                .disabled_until
                .values()
                .copied()
                .min()
                .unwrap_or(now);
            let retry_after = (until - now).to_std().unwrap_or(Duration::ZERO);
            tracing::error!(
                "All API keys are currently disabled. The next key will be available in {:.2} seconds.",
                retry_after.as_secs_f64()
            );
            return Err(KeyPoolError::AllKeysDisabled { until, retry_after });
        }

        let sticky_idx = if self.sticky {
            state
                .last_selected
                .as_ref()
                .and_then(|last| self.keys.iter().position(|k| k == last))
                .filter(|idx| available[*idx])
        } else {
            None
        };

        let idx = match sticky_idx {
            Some(idx) => idx,
            None => match self.strategy {
                SelectionStrategy::RoundRobin => {
                    let len = self.keys.len();
                    let mut chosen = 0;
                    for _ in 0..len {
                        let candidate = state.cursor;
                        state.cursor = (state.cursor + 1) % len;
                        if available[candidate] {
                            chosen = candidate;
                            break;
                        }
                    }
                    chosen
                }
                SelectionStrategy::First => available.iter().position(|a| *a).unwrap_or(0),
                SelectionStrategy::Random => {
                    let candidates: Vec<usize> = (0..self.keys.len())
                        .filter(|idx| available[*idx])
                        .collect();
                    *candidates.choose(&mut rand::thread_rng()).unwrap_or(&0)
                }
            },
        };

        let key = self.keys[idx].clone();
        state.last_selected = Some(key.clone());
        Ok(key)
    }

    /// Take `key` out of rotation until `reset_at_ms` (epoch millis) or for the
    /// configured cooldown. An existing, later deadline is never shortened.
    pub fn disable(&self, key: &str, reset_at_ms: Option<i64>) {
        let mut state = self.lock();
        let now = self.clock.now();

        let requested = match reset_at_ms {
            Some(ms) => match Utc.timestamp_millis_opt(ms).single() {
                Some(reset) if reset > now => {
                    tracing::info!("Using server-provided reset time: {}", reset);
                    reset
                }
                Some(_) => {
                    tracing::warn!(
                        "Server-provided reset time is in the past, using default cooldown of {} seconds",
                        self.cooldown.num_seconds()
                    );
                    self.cooldown_deadline(now)
                }
                None => {
                    tracing::warn!(
                        "Unusable reset time {}, using default cooldown of {} seconds",
                        ms,
                        self.cooldown.num_seconds()
                    );
                    self.cooldown_deadline(now)
                }
            },
            None => {
                tracing::info!(
                    "No reset time provided, using default cooldown of {} seconds",
                    self.cooldown.num_seconds()
                );
                self.cooldown_deadline(now)
            }
        };

        let until = match state.disabled_until.get(key) {
            Some(existing) if *existing > requested => *existing,
            _ => requested,
        };
        state.disabled_until.insert(key.to_string(), until);

        tracing::warn!(key = %mask_key(key), until = %until, "API key has been disabled");
        self.emit(KeyEvent::Disabled {
            key: mask_key(key),
            until,
        });
    }

    /// Whether `key` would currently be eligible for selection.
    pub fn is_available(&self, key: &str) -> bool {
        let state = self.lock();
        let now = self.clock.now();
        state
            .disabled_until
            .get(key)
            .map_or(true, |until| *until <= now)
    }

    pub fn status(&self) -> Vec<KeyStatus> {
        let state = self.lock();
        let now = self.clock.now();
        self.keys
            .iter()
            .map(|key| {
                let until = state.disabled_until.get(key).copied().filter(|u| *u > now);
                KeyStatus {
                    key: mask_key(key),
                    available: until.is_none(),
                    disabled_until: until,
                }
            })
            .collect()
    }
}

impl fmt::Debug for KeyPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KeyPool")
            .field("keys", &self.keys.iter().map(|k| mask_key(k)).collect::<Vec<_>>())
            .field("strategy", &self.strategy)
            .field("sticky", &self.sticky)
            .finish()
    }
}
