use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::rate_limit::OperationClass;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SerialConfig {
    pub port: String,
    pub baudrate: u32,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyS5".to_string(),
            baudrate: 9_600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DispatchConfig {
    pub read_lock_timeout_ms: u64,
    pub write_lock_timeout_ms: u64,
    pub read_strategy_timeout_ms: u64,
    pub write_strategy_timeout_ms: u64,
    pub write_retries: u8,
    pub settle_delay_ms: u64,
    pub max_consecutive_errors: u32,
    pub reconnect_attempts: u32,
    pub reconnect_backoff_ms: u64,
    pub reconnect_backoff_max_ms: u64,
    pub link_check_interval_ms: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            read_lock_timeout_ms: 250,
            write_lock_timeout_ms: 8_000,
            read_strategy_timeout_ms: 2_000,
            write_strategy_timeout_ms: 3_000,
            write_retries: 1,
            settle_delay_ms: 300,
            max_consecutive_errors: 5,
            reconnect_attempts: 3,
            reconnect_backoff_ms: 1_000,
            reconnect_backoff_max_ms: 8_000,
            link_check_interval_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CacheConfig {
    pub ttl_ms: u64,
    pub grace_ttl_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl_ms: 2_000,
            grace_ttl_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassLimits {
    pub min_interval_ms: u64,
    pub max_per_minute: u32,
}

impl ClassLimits {
    pub const fn new(min_interval_ms: u64, max_per_minute: u32) -> Self {
        Self {
            min_interval_ms,
            max_per_minute,
        }
    }

    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn sanitize(&mut self) {
        self.min_interval_ms = self.min_interval_ms.min(600_000);
        self.max_per_minute = self.max_per_minute.clamp(1, 10_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub read_data: ClassLimits,
    pub set_config: ClassLimits,
    pub execute_action: ClassLimits,
    pub health_check: ClassLimits,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            read_data: ClassLimits::new(600, 30),
            set_config: ClassLimits::new(1_800, 6),
            execute_action: ClassLimits::new(6_000, 3),
            health_check: ClassLimits::new(1_000, 60),
        }
    }
}

impl RateLimitConfig {
    pub fn limits(&self, class: OperationClass) -> ClassLimits {
        match class {
            OperationClass::ReadData => self.read_data,
            OperationClass::SetConfig => self.set_config,
            OperationClass::ExecuteAction => self.execute_action,
            OperationClass::HealthCheck => self.health_check,
        }
    }

    pub fn sanitize(&mut self) {
        self.read_data.sanitize();
        self.set_config.sanitize();
        self.execute_action.sanitize();
        self.health_check.sanitize();
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RuntimeConfig {
    pub serial: SerialConfig,
    pub dispatch: DispatchConfig,
    pub cache: CacheConfig,
    pub rate_limit: RateLimitConfig,
    pub schedule_poll_interval_ms: u64,
    pub timezone: String,
    #[serde(default = "default_http_port")]
    pub http_port: u16,
}

fn default_http_port() -> u16 {
    8_000
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            serial: SerialConfig::default(),
            dispatch: DispatchConfig::default(),
            cache: CacheConfig::default(),
            rate_limit: RateLimitConfig::default(),
            schedule_poll_interval_ms: 30_000,
            timezone: "UTC".to_string(),
            http_port: default_http_port(),
        }
    }
}

impl DispatchConfig {
    pub fn sanitize(&mut self) {
        self.read_lock_timeout_ms = self.read_lock_timeout_ms.clamp(10, 5_000);
        self.write_lock_timeout_ms = self.write_lock_timeout_ms.clamp(100, 60_000);
        self.read_strategy_timeout_ms = self.read_strategy_timeout_ms.clamp(50, 30_000);
        self.write_strategy_timeout_ms = self.write_strategy_timeout_ms.clamp(50, 30_000);
        self.write_retries = self.write_retries.min(5);
        self.settle_delay_ms = self.settle_delay_ms.min(5_000);
        self.max_consecutive_errors = self.max_consecutive_errors.clamp(1, 100);
        self.reconnect_attempts = self.reconnect_attempts.clamp(1, 20);
        self.reconnect_backoff_ms = self.reconnect_backoff_ms.clamp(10, 60_000);
        self.reconnect_backoff_max_ms = self
            .reconnect_backoff_max_ms
            .max(self.reconnect_backoff_ms);
        self.link_check_interval_ms = self.link_check_interval_ms.clamp(100, 300_000);
    }
}

impl CacheConfig {
    pub fn sanitize(&mut self) {
        self.ttl_ms = self.ttl_ms.clamp(100, 60_000);
        // grace never shorter than the nominal ttl
        self.grace_ttl_ms = self.grace_ttl_ms.clamp(self.ttl_ms, 600_000);
    }
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        if self.serial.baudrate == 0 {
            self.serial.baudrate = SerialConfig::default().baudrate;
        }
        self.dispatch.sanitize();
        self.cache.sanitize();
        self.rate_limit.sanitize();
        self.schedule_poll_interval_ms = self.schedule_poll_interval_ms.clamp(1_000, 300_000);
        if self.timezone.parse::<chrono_tz::Tz>().is_err() {
            tracing::warn!("unknown timezone {:?}, falling back to UTC", self.timezone);
            self.timezone = "UTC".to_string();
        }
        if self.http_port == 0 {
            self.http_port = default_http_port();
        }
    }
}
