use std::{
    collections::{HashMap, VecDeque},
    fmt,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{ClassLimits, RateLimitConfig};

const WINDOW: Duration = Duration::from_secs(60);
const LOG_COOLDOWN: Duration = Duration::from_secs(5);
const WARNING_USAGE_RATIO: f64 = 0.8;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationClass {
    ReadData,
    SetConfig,
    ExecuteAction,
    HealthCheck,
}

impl OperationClass {
    pub const ALL: [Self; 4] = [
        Self::ReadData,
        Self::SetConfig,
        Self::ExecuteAction,
        Self::HealthCheck,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::ReadData => "read_data",
            Self::SetConfig => "set_config",
            Self::ExecuteAction => "execute_action",
            Self::HealthCheck => "health_check",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Self::ReadData => "Device telemetry reads",
            Self::SetConfig => "Configuration changes",
            Self::ExecuteAction => "Critical device actions",
            Self::HealthCheck => "System health checks",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|class| class.as_str() == raw)
    }
}

/// Rate-limit partition key for one caller.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CallerId(String);

impl CallerId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Explicit client id wins, then the first forwarded address, then the peer.
    pub fn derive(
        client_id: Option<&str>,
        forwarded_for: Option<&str>,
        peer: Option<&str>,
    ) -> Self {
        if let Some(id) = client_id.map(str::trim).filter(|id| !id.is_empty()) {
            return Self(format!("client_{id}"));
        }
        let forwarded = forwarded_for
            .and_then(|raw| raw.split(',').next())
            .map(str::trim)
            .filter(|addr| !addr.is_empty());
        match forwarded.or(peer) {
            Some(addr) => Self(format!("ip_{addr}")),
            None => Self::default(),
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CallerId {
    fn default() -> Self {
        Self("default".to_string())
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "limit_type", rename_all = "snake_case")]
pub enum DenialReason {
    MinimumInterval {
        wait_seconds: f64,
    },
    RequestsPerMinute {
        requests_in_last_minute: usize,
        max_per_minute: u32,
        reset_in_seconds: f64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitDenial {
    pub operation: OperationClass,
    pub description: &'static str,
    #[serde(flatten)]
    pub reason: DenialReason,
}

impl RateLimitDenial {
    pub fn retry_after(&self) -> Duration {
        let seconds = match self.reason {
            DenialReason::MinimumInterval { wait_seconds } => wait_seconds,
            DenialReason::RequestsPerMinute {
                reset_in_seconds, ..
            } => reset_in_seconds,
        };
        Duration::from_secs_f64(seconds.max(0.0))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    Allowed,
    Denied(RateLimitDenial),
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }

    pub fn into_result(self) -> Result<(), RateLimitDenial> {
        match self {
            Self::Allowed => Ok(()),
            Self::Denied(denial) => Err(denial),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum UsageState {
    Available,
    Warning,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassStatus {
    pub operation_type: OperationClass,
    pub description: &'static str,
    pub min_interval_seconds: f64,
    pub max_per_minute: u32,
    pub requests_in_last_minute: usize,
    pub last_request_seconds_ago: Option<f64>,
    pub usage_percentage: f64,
    pub status: UsageState,
    pub next_allowed_in_seconds: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimiterStats {
    pub enabled: bool,
    pub total_requests: u64,
    pub blocked_requests: u64,
    pub success_rate: f64,
    pub operations: Vec<ClassStatus>,
    pub uptime_seconds: f64,
}

#[derive(Debug, Default)]
struct RateWindow {
    last_request_at: Option<Instant>,
    history: VecDeque<Instant>,
}

impl RateWindow {
    fn prune(&mut self, now: Instant) {
        while let Some(oldest) = self.history.front() {
            if now.saturating_duration_since(*oldest) >= WINDOW {
                self.history.pop_front();
            } else {
                break;
            }
        }
    }

    fn in_window(&self, now: Instant) -> usize {
        self.history
            .iter()
            .filter(|at| now.saturating_duration_since(**at) < WINDOW)
            .count()
    }
}

#[derive(Debug)]
struct LimiterState {
    limits: HashMap<OperationClass, ClassLimits>,
    windows: HashMap<(OperationClass, CallerId), RateWindow>,
    last_logged: HashMap<String, Instant>,
    last_sweep: Instant,
    total_requests: u64,
    blocked_requests: u64,
}

impl LimiterState {
    /// Drops partitions that can no longer deny anything, so rotating caller
    /// ids cannot grow the maps without bound.
    fn sweep(&mut self, now: Instant) {
        if now.saturating_duration_since(self.last_sweep) < WINDOW {
            return;
        }
        self.last_sweep = now;
        let limits = &self.limits;
        let before = self.windows.len();
        self.windows.retain(|(class, _), window| {
            let retention = limits
                .get(class)
                .map_or(WINDOW, |l| l.min_interval().max(WINDOW));
            window
                .last_request_at
                .is_some_and(|last| now.saturating_duration_since(last) < retention)
        });
        self.last_logged
            .retain(|_, at| now.saturating_duration_since(*at) < LOG_COOLDOWN);
        let dropped = before - self.windows.len();
        if dropped > 0 {
            debug!("rate limiter dropped {dropped} idle partitions");
        }
    }
}

/// Dual-constraint limiter: a minimum spacing between allowed requests plus a
/// sliding one-minute ceiling, both per (operation class, caller).
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    started_at: Instant,
    state: Mutex<LimiterState>,
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let limits = OperationClass::ALL
            .into_iter()
            .map(|class| (class, config.limits(class)))
            .collect();
        Self {
            enabled: config.enabled,
            started_at: Instant::now(),
            state: Mutex::new(LimiterState {
                limits,
                windows: HashMap::new(),
                last_logged: HashMap::new(),
                last_sweep: Instant::now(),
                total_requests: 0,
                blocked_requests: 0,
            }),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn check(&self, class: OperationClass, caller: &CallerId) -> RateDecision {
        self.check_at(class, caller, Instant::now())
    }

    pub fn check_at(&self, class: OperationClass, caller: &CallerId, now: Instant) -> RateDecision {
        if !self.enabled {
            return RateDecision::Allowed;
        }

        let mut state = self.lock();
        state.sweep(now);
        state.total_requests += 1;
        let limits = state.limits[&class];
        let window = state
            .windows
            .entry((class, caller.clone()))
            .or_default();

        if let Some(last) = window.last_request_at {
            let elapsed = now.saturating_duration_since(last);
            if elapsed < limits.min_interval() {
                let remaining = (limits.min_interval() - elapsed).as_secs_f64();
                let denial = RateLimitDenial {
                    operation: class,
                    description: class.description(),
                    reason: DenialReason::MinimumInterval {
                        wait_seconds: round1(remaining),
                    },
                };
                state.blocked_requests += 1;
                if Self::should_log(&mut state, format!("interval_{}_{caller}", class.as_str()), now) {
                    warn!(
                        "rate limit {} [{caller}]: minimum interval, {remaining:.1}s remaining ({} blocked so far)",
                        class.as_str(),
                        state.blocked_requests
                    );
                }
                return RateDecision::Denied(denial);
            }
        }

        window.prune(now);
        if window.history.len() >= limits.max_per_minute as usize {
            let oldest = window.history.front().copied().unwrap_or(now);
            let reset_in = WINDOW
                .saturating_sub(now.saturating_duration_since(oldest))
                .as_secs_f64();
            let denial = RateLimitDenial {
                operation: class,
                description: class.description(),
                reason: DenialReason::RequestsPerMinute {
                    requests_in_last_minute: window.history.len(),
                    max_per_minute: limits.max_per_minute,
                    reset_in_seconds: round1(reset_in),
                },
            };
            state.blocked_requests += 1;
            if Self::should_log(&mut state, format!("perminute_{}_{caller}", class.as_str()), now) {
                warn!(
                    "rate limit {} [{caller}]: {}/min exceeded, reset in {reset_in:.1}s",
                    class.as_str(),
                    limits.max_per_minute
                );
            }
            return RateDecision::Denied(denial);
        }

        window.last_request_at = Some(now);
        window.history.push_back(now);
        let used = window.history.len();
        if matches!(class, OperationClass::SetConfig | OperationClass::ExecuteAction) {
            debug!(
                "rate limit ok {} [{caller}]: {used}/{} in last minute",
                class.as_str(),
                limits.max_per_minute
            );
        }
        RateDecision::Allowed
    }

    pub fn status(&self, class: OperationClass, caller: &CallerId) -> ClassStatus {
        self.status_at(class, caller, Instant::now())
    }

    pub fn status_at(&self, class: OperationClass, caller: &CallerId, now: Instant) -> ClassStatus {
        let state = self.lock();
        Self::status_locked(&state, class, caller, now)
    }

    fn status_locked(
        state: &LimiterState,
        class: OperationClass,
        caller: &CallerId,
        now: Instant,
    ) -> ClassStatus {
        let limits = state.limits[&class];
        let window = state.windows.get(&(class, caller.clone()));
        let used = window.map(|w| w.in_window(now)).unwrap_or(0);
        let last_request_seconds_ago = window
            .and_then(|w| w.last_request_at)
            .map(|last| round1(now.saturating_duration_since(last).as_secs_f64()));

        let next_allowed = window
            .and_then(|w| w.last_request_at)
            .map(|last| {
                limits
                    .min_interval()
                    .saturating_sub(now.saturating_duration_since(last))
            })
            .unwrap_or(Duration::ZERO);

        let max = limits.max_per_minute as usize;
        let status = if !next_allowed.is_zero() || used >= max {
            UsageState::Blocked
        } else if used as f64 >= max as f64 * WARNING_USAGE_RATIO {
            UsageState::Warning
        } else {
            UsageState::Available
        };

        ClassStatus {
            operation_type: class,
            description: class.description(),
            min_interval_seconds: limits.min_interval().as_secs_f64(),
            max_per_minute: limits.max_per_minute,
            requests_in_last_minute: used,
            last_request_seconds_ago,
            usage_percentage: round1(used as f64 / max as f64 * 100.0),
            status,
            next_allowed_in_seconds: round1(next_allowed.as_secs_f64()),
        }
    }

    pub fn stats(&self) -> RateLimiterStats {
        let now = Instant::now();
        let state = self.lock();
        let caller = CallerId::default();
        let operations = OperationClass::ALL
            .into_iter()
            .map(|class| Self::status_locked(&state, class, &caller, now))
            .collect();
        let success_rate = if state.total_requests == 0 {
            100.0
        } else {
            let allowed = state.total_requests - state.blocked_requests;
            (allowed as f64 / state.total_requests as f64 * 10_000.0).round() / 100.0
        };

        RateLimiterStats {
            enabled: self.enabled,
            total_requests: state.total_requests,
            blocked_requests: state.blocked_requests,
            success_rate,
            operations,
            uptime_seconds: round1(now.saturating_duration_since(self.started_at).as_secs_f64()),
        }
    }

    /// Clears the caller's window for one class, or for every class when none
    /// is given. Other callers are never touched.
    pub fn reset(&self, class: Option<OperationClass>, caller: &CallerId) {
        let mut state = self.lock();
        let classes = match class {
            Some(class) => vec![class],
            None => OperationClass::ALL.to_vec(),
        };
        for class in classes {
            state.windows.remove(&(class, caller.clone()));
            let suffix = format!("_{}_{caller}", class.as_str());
            state.last_logged.retain(|key, _| !key.ends_with(&suffix));
        }
        match class {
            Some(class) => info!("rate limits reset for {} [{caller}]", class.as_str()),
            None => info!("all rate limits reset for [{caller}]"),
        }
    }

    pub fn update_limits(
        &self,
        class: OperationClass,
        min_interval: Option<Duration>,
        max_per_minute: Option<u32>,
    ) -> ClassLimits {
        let mut state = self.lock();
        let limits = state
            .limits
            .entry(class)
            .or_insert_with(|| RateLimitConfig::default().limits(class));
        if let Some(interval) = min_interval {
            limits.min_interval_ms = interval.as_millis() as u64;
        }
        if let Some(max) = max_per_minute {
            limits.max_per_minute = max;
        }
        limits.sanitize();
        let updated = *limits;
        info!(
            "limits updated for {}: interval={}ms max_per_min={}",
            class.as_str(),
            updated.min_interval_ms,
            updated.max_per_minute
        );
        updated
    }

    pub fn limits(&self, class: OperationClass) -> ClassLimits {
        self.lock().limits[&class]
    }

    fn should_log(state: &mut LimiterState, key: String, now: Instant) -> bool {
        match state.last_logged.get(&key) {
            Some(last) if now.saturating_duration_since(*last) < LOG_COOLDOWN => false,
            _ => {
                state.last_logged.insert(key, now);
                true
            }
        }
    }

    fn lock(&self) -> MutexGuard<'_, LimiterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
