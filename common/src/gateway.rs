use std::{
    mem,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::NaiveDateTime;
use chrono_tz::Tz;
use serde::Serialize;
use serde_json::Value;
use tokio::{sync::watch, task::JoinHandle, time::MissedTickBehavior};
use tracing::{info, warn};

use crate::{
    cache::CacheStats,
    config::{ClassLimits, RuntimeConfig},
    dispatcher::{ConnectionInfo, Dispatcher},
    error::{GatewayError, Result},
    framing::Acknowledgement,
    params::{ParamValue, Parameter},
    presets::Preset,
    rate_limit::{CallerId, ClassStatus, OperationClass, RateLimiter, RateLimiterStats},
    schedule::{ScheduleConfig, ScheduleInfo, ScheduleStatus, MAX_SCHEDULE_DURATION_SECS},
    scheduler::{stop_requested, Scheduler},
    telemetry::Snapshot,
    transport::Connector,
};

pub const MAX_TOGGLE_SECS: u32 = 43_200;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToggleOutcome {
    pub acknowledgement: Acknowledgement,
    pub duration_seconds: u32,
    pub manual_override_until: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PresetApplyReport {
    pub applied: Vec<Parameter>,
    pub failed: Option<Parameter>,
    pub error: Option<String>,
}

impl PresetApplyReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_none()
    }
}

/// Everything the request surface talks to. Built once, started explicitly,
/// stopped explicitly.
pub struct Gateway {
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
    limiter: RateLimiter,
    link_check_interval: Duration,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Gateway {
    pub fn new(config: &RuntimeConfig, connector: Arc<dyn Connector>, schedule: ScheduleConfig) -> Self {
        let timezone = config.timezone.parse::<Tz>().unwrap_or(Tz::UTC);
        let dispatcher = Arc::new(Dispatcher::new(
            connector,
            config.serial.clone(),
            config.dispatch.clone(),
            &config.cache,
        ));
        let scheduler = Arc::new(Scheduler::new(
            schedule,
            dispatcher.clone(),
            timezone,
            Duration::from_millis(config.schedule_poll_interval_ms),
        ));
        let (shutdown, _) = watch::channel(false);

        Self {
            dispatcher,
            scheduler,
            limiter: RateLimiter::new(&config.rate_limit),
            link_check_interval: Duration::from_millis(config.dispatch.link_check_interval_ms),
            shutdown,
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub async fn start(&self) {
        if let Err(err) = self.dispatcher.start().await {
            warn!("device not reachable at startup, running degraded: {err}");
        }

        let schedule_task = tokio::spawn(self.scheduler.clone().run(self.shutdown.subscribe()));
        let link_task = tokio::spawn(run_link_supervisor(
            self.dispatcher.clone(),
            self.link_check_interval,
            self.shutdown.subscribe(),
        ));
        self.tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend([schedule_task, link_task]);
        info!("gateway started");
    }

    pub async fn stop(&self) {
        let _ = self.shutdown.send(true);
        let tasks = mem::take(&mut *self.tasks.lock().unwrap_or_else(PoisonError::into_inner));
        for task in tasks {
            if let Err(err) = task.await {
                warn!("background task ended abnormally: {err}");
            }
        }
        self.dispatcher.stop().await;
        info!("gateway stopped");
    }

    pub async fn get_snapshot(&self) -> Result<Arc<Snapshot>> {
        self.dispatcher.get_snapshot().await
    }

    pub async fn get_parameter(&self, name: &str) -> Result<Value> {
        self.dispatcher.get_parameter(name).await
    }

    /// Registry lookup and coercion happen here, before the channel is touched.
    pub async fn set_parameter(&self, name: &str, value: ParamValue) -> Result<(Parameter, ParamValue)> {
        let param = Parameter::from_name(name)?;
        let value = param.coerce(value)?;
        self.dispatcher.set_parameter(param, &value).await?;
        Ok((param, value))
    }

    pub async fn toggle_load(&self, seconds: u32, is_override: bool) -> Result<ToggleOutcome> {
        let max = if is_override {
            MAX_SCHEDULE_DURATION_SECS
        } else {
            MAX_TOGGLE_SECS
        };
        if seconds < 1 || seconds > max {
            return Err(GatewayError::InvalidParameter(format!(
                "toggle duration {seconds}s outside 1..={max}s"
            )));
        }

        let acknowledgement = self.dispatcher.toggle_load(seconds).await?;
        let manual_override_until = is_override.then(|| self.scheduler.set_manual_override(seconds));
        Ok(ToggleOutcome {
            acknowledgement,
            duration_seconds: seconds,
            manual_override_until,
        })
    }

    pub async fn cancel_override(&self) -> Result<Acknowledgement> {
        self.dispatcher.cancel_temporary_off().await
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        self.dispatcher.connection_info()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.dispatcher.cache_stats()
    }

    pub fn schedule_status(&self) -> ScheduleStatus {
        self.scheduler.status()
    }

    pub fn schedule_info(&self) -> ScheduleInfo {
        self.scheduler.info()
    }

    pub fn schedule_config(&self) -> ScheduleConfig {
        self.scheduler.config()
    }

    pub fn schedule_configure(
        &self,
        enabled: bool,
        start_time: &str,
        duration_seconds: u64,
    ) -> Result<ScheduleConfig> {
        self.scheduler.configure(enabled, start_time, duration_seconds)
    }

    pub fn schedule_enable(&self) -> ScheduleConfig {
        self.scheduler.set_enabled(true)
    }

    pub fn schedule_disable(&self) -> ScheduleConfig {
        self.scheduler.set_enabled(false)
    }

    pub fn schedule_clear_override(&self) -> bool {
        self.scheduler.clear_override()
    }

    pub fn rate_limiter_check(&self, class: OperationClass, caller: &CallerId) -> Result<()> {
        self.limiter
            .check(class, caller)
            .into_result()
            .map_err(GatewayError::RateLimitExceeded)
    }

    pub fn rate_limiter_status(&self, class: OperationClass, caller: &CallerId) -> ClassStatus {
        self.limiter.status(class, caller)
    }

    pub fn rate_limiter_stats(&self) -> RateLimiterStats {
        self.limiter.stats()
    }

    pub fn rate_limiter_reset(&self, class: Option<OperationClass>, caller: &CallerId) {
        self.limiter.reset(class, caller);
    }

    pub fn rate_limiter_update_limits(
        &self,
        class: OperationClass,
        min_interval: Option<Duration>,
        max_per_minute: Option<u32>,
    ) -> ClassLimits {
        self.limiter.update_limits(class, min_interval, max_per_minute)
    }

    /// Writes the preset one parameter at a time, stopping at the first
    /// failure.
    pub async fn apply_preset(&self, preset: &Preset) -> Result<PresetApplyReport> {
        preset.validate()?;
        let mut report = PresetApplyReport {
            applied: Vec::new(),
            failed: None,
            error: None,
        };
        for (param, value) in preset.parameters() {
            let value = param.coerce(value)?;
            match self.dispatcher.set_parameter(param, &value).await {
                Ok(_) => report.applied.push(param),
                Err(err) => {
                    warn!("preset stopped at {param}: {err}");
                    report.failed = Some(param);
                    report.error = Some(err.to_string());
                    break;
                }
            }
        }
        Ok(report)
    }
}

async fn run_link_supervisor(
    dispatcher: Arc<Dispatcher>,
    every: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut interval = tokio::time::interval(every);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = stop_requested(&mut shutdown) => break,
        }
        tokio::select! {
            result = dispatcher.maintain_link() => {
                if let Err(err) = result {
                    warn!("link still down: {err}");
                }
            }
            _ = stop_requested(&mut shutdown) => {
                info!("reconnect abandoned for shutdown");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        presets::sample_preset,
        testing::{fast_dispatch_config, SimulatedConnector},
    };
    use pretty_assertions::assert_eq;

    fn config() -> RuntimeConfig {
        RuntimeConfig {
            dispatch: fast_dispatch_config(),
            ..RuntimeConfig::default()
        }
    }

    async fn started(connector: Arc<SimulatedConnector>) -> Gateway {
        let gateway = Gateway::new(&config(), connector, ScheduleConfig::default());
        gateway.start().await;
        gateway
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_or_out_of_range_parameters_never_reach_device() {
        let connector = Arc::new(SimulatedConnector::responsive());
        let gateway = started(connector.clone()).await;

        assert!(matches!(
            gateway.set_parameter("voltagePanel", ParamValue::Float(13.0)).await,
            Err(GatewayError::InvalidParameter(_))
        ));
        assert!(matches!(
            gateway.set_parameter("bulkVoltage", ParamValue::Float(16.0)).await,
            Err(GatewayError::InvalidParameter(_))
        ));
        assert!(!connector.commands().iter().any(|c| c.starts_with("CMD:SET_")));

        let (param, value) = gateway
            .set_parameter("isLithium", ParamValue::Text("true".into()))
            .await
            .unwrap();
        assert_eq!(param, Parameter::IsLithium);
        assert_eq!(value, ParamValue::Bool(true));
        assert!(connector.commands().contains(&"CMD:SET_isLithium:1".to_string()));
        gateway.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn override_toggle_suppresses_schedule() {
        let connector = Arc::new(SimulatedConnector::responsive());
        let gateway = started(connector.clone()).await;

        let outcome = gateway.toggle_load(600, true).await.unwrap();
        assert!(outcome.manual_override_until.is_some());
        assert!(gateway.schedule_status().manual_override_active);
        assert!(gateway.schedule_clear_override());

        let outcome = gateway.toggle_load(600, false).await.unwrap();
        assert_eq!(outcome.manual_override_until, None);
        assert!(!gateway.schedule_status().manual_override_active);

        assert!(gateway.toggle_load(0, false).await.is_err());
        assert!(gateway.toggle_load(MAX_TOGGLE_SECS, false).await.is_ok());
        assert!(gateway.toggle_load(MAX_SCHEDULE_DURATION_SECS + 1, true).await.is_err());
        gateway.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn preset_is_written_parameter_by_parameter() {
        let connector = Arc::new(SimulatedConnector::responsive());
        let gateway = started(connector.clone()).await;

        let report = gateway.apply_preset(&sample_preset()).await.unwrap();
        assert!(report.is_complete());
        assert_eq!(report.applied.len(), Parameter::ALL.len());
        let writes: Vec<_> = connector
            .commands()
            .into_iter()
            .filter(|c| c.starts_with("CMD:SET_"))
            .collect();
        assert_eq!(writes.first().map(String::as_str), Some("CMD:SET_isLithium:1"));
        assert_eq!(writes.len(), Parameter::ALL.len());
        gateway.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_preset_is_rejected_before_any_write() {
        let connector = Arc::new(SimulatedConnector::responsive());
        let gateway = started(connector.clone()).await;

        let preset = Preset {
            float_voltage: 14.8,
            ..sample_preset()
        };
        assert!(matches!(
            gateway.apply_preset(&preset).await,
            Err(GatewayError::PresetInvalid(_))
        ));
        assert!(!connector.commands().iter().any(|c| c.starts_with("CMD:SET_")));
        gateway.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limit_denial_is_typed() {
        let connector = Arc::new(SimulatedConnector::responsive());
        let gateway = Gateway::new(&config(), connector, ScheduleConfig::default());
        let caller = CallerId::new("client_test");

        assert!(gateway.rate_limiter_check(OperationClass::ExecuteAction, &caller).is_ok());
        match gateway.rate_limiter_check(OperationClass::ExecuteAction, &caller) {
            Err(GatewayError::RateLimitExceeded(denial)) => {
                assert_eq!(denial.operation, OperationClass::ExecuteAction)
            }
            other => panic!("expected denial, got {other:?}"),
        }
        gateway.rate_limiter_reset(None, &caller);
        assert!(gateway.rate_limiter_check(OperationClass::ExecuteAction, &caller).is_ok());
        assert_eq!(gateway.rate_limiter_stats().total_requests, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn stop_interrupts_a_reconnect_in_progress() {
        let mut runtime = config();
        runtime.dispatch.reconnect_attempts = 10;
        let connector = Arc::new(SimulatedConnector::new(|_: &str| None));
        let gateway = Gateway::new(&runtime, connector.clone(), ScheduleConfig::default());
        gateway.start().await;
        assert!(!gateway.connection_info().connected);

        // supervisor is now probing a device that never answers
        tokio::time::sleep(Duration::from_millis(150)).await;
        let opens = connector.opens();
        let began = tokio::time::Instant::now();
        gateway.stop().await;

        assert!(began.elapsed() < Duration::from_secs(1));
        assert!(connector.opens() > 10);
        assert_eq!(connector.opens(), opens);
    }

    #[tokio::test(start_paused = true)]
    async fn unreachable_device_starts_degraded_and_recovers() {
        let connector = Arc::new(SimulatedConnector::responsive().failing_opens(3));
        let gateway = started(connector.clone()).await;
        assert!(!gateway.connection_info().connected);
        assert!(matches!(
            gateway.get_snapshot().await,
            Err(GatewayError::Unavailable(_))
        ));

        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(gateway.connection_info().connected);
        assert!(gateway.get_snapshot().await.is_ok());
        gateway.stop().await;
        assert!(!gateway.connection_info().connected);
    }
}
