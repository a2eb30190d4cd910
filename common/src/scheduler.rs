use std::{
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use chrono::{NaiveDateTime, Utc};
use chrono_tz::Tz;
use tokio::{sync::watch, time::MissedTickBehavior};
use tracing::{info, warn};

use crate::{
    dispatcher::LoadSwitch,
    error::Result,
    schedule::{ScheduleAction, ScheduleConfig, ScheduleEngine, ScheduleInfo, ScheduleStatus},
};

/// Resolves once shutdown is signalled or the signalling side is gone.
pub(crate) async fn stop_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Drives a `ScheduleEngine` from wall-clock time in the configured zone.
/// The engine lock is never held across a device call.
pub struct Scheduler {
    engine: Mutex<ScheduleEngine>,
    switch: Arc<dyn LoadSwitch>,
    timezone: Tz,
    poll_interval: Duration,
}

impl Scheduler {
    pub fn new(
        config: ScheduleConfig,
        switch: Arc<dyn LoadSwitch>,
        timezone: Tz,
        poll_interval: Duration,
    ) -> Self {
        Self {
            engine: Mutex::new(ScheduleEngine::new(config)),
            switch,
            timezone,
            poll_interval,
        }
    }

    pub fn local_now(&self) -> NaiveDateTime {
        Utc::now().with_timezone(&self.timezone).naive_local()
    }

    /// One evaluation. Returns whether a toggle was delivered.
    pub async fn run_tick(&self, now: NaiveDateTime) -> bool {
        let action = self.engine().tick(now);
        let Some(ScheduleAction::ToggleLoad {
            seconds,
            window_start,
        }) = action
        else {
            return false;
        };

        info!("schedule window {window_start}: switching load off for {seconds}s");
        match self.switch.toggle_load(seconds).await {
            Ok(_) => {
                self.engine().mark_executed(window_start);
                true
            }
            Err(err) => {
                warn!("scheduled toggle failed, retrying next tick: {err}");
                false
            }
        }
    }

    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.poll_interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            "schedule loop started (every {}s, {})",
            self.poll_interval.as_secs(),
            self.timezone
        );

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = stop_requested(&mut shutdown) => break,
            }
            // A toggle still waiting on the device is abandoned on shutdown.
            tokio::select! {
                _ = self.run_tick(self.local_now()) => {}
                _ = stop_requested(&mut shutdown) => break,
            }
        }
        info!("schedule loop stopped");
    }

    pub fn configure(
        &self,
        enabled: bool,
        start_time: &str,
        duration_seconds: u64,
    ) -> Result<ScheduleConfig> {
        let mut engine = self.engine();
        let config = engine.configure(enabled, start_time, duration_seconds)?;
        Ok(config.clone())
    }

    pub fn set_enabled(&self, enabled: bool) -> ScheduleConfig {
        let mut engine = self.engine();
        engine.set_enabled(enabled);
        info!("schedule {}", if enabled { "enabled" } else { "disabled" });
        engine.config().clone()
    }

    pub fn config(&self) -> ScheduleConfig {
        self.engine().config().clone()
    }

    pub fn set_manual_override(&self, duration_seconds: u32) -> NaiveDateTime {
        let now = self.local_now();
        self.engine().set_manual_override(duration_seconds, now)
    }

    pub fn clear_override(&self) -> bool {
        self.engine().clear_manual_override()
    }

    pub fn status(&self) -> ScheduleStatus {
        let now = self.local_now();
        self.engine().status(now)
    }

    pub fn info(&self) -> ScheduleInfo {
        ScheduleInfo::new(self.timezone.name())
    }

    fn engine(&self) -> MutexGuard<'_, ScheduleEngine> {
        self.engine.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
