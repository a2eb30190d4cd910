use chrono::{Duration, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;
use tracing::info;

pub const MAX_SCHEDULE_DURATION_SECS: u32 = 28_800;
pub const DEFAULT_SCHEDULE_DURATION_SECS: u32 = 21_600;
pub const TIME_FORMAT: &str = "%H:%M";
pub const OVERRIDE_BEHAVIOR: &str = "cancels_daily_schedule_until_next_day";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleConfigError {
    #[error("start time '{0}' is not a valid HH:MM time")]
    MalformedStartTime(String),
    #[error("duration must be at least 1 second")]
    DurationTooShort,
    #[error("duration {requested}s exceeds the {max}s maximum")]
    DurationTooLong { requested: u64, max: u32 },
}

/// Accepts `H:MM` or `HH:MM`, 24-hour clock.
pub fn parse_start_time(raw: &str) -> Result<NaiveTime, ScheduleConfigError> {
    let malformed = || ScheduleConfigError::MalformedStartTime(raw.to_string());
    let (hours, minutes) = raw.trim().split_once(':').ok_or_else(malformed)?;
    let digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
    if !digits(hours) || hours.len() > 2 || !digits(minutes) || minutes.len() != 2 {
        return Err(malformed());
    }
    let hour: u32 = hours.parse().map_err(|_| malformed())?;
    let minute: u32 = minutes.parse().map_err(|_| malformed())?;
    if hour > 23 || minute > 59 {
        return Err(malformed());
    }
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(malformed)
}

mod hhmm {
    use super::*;

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format(TIME_FORMAT).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_start_time(&raw).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleConfig {
    pub enabled: bool,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    pub duration_seconds: u32,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_time: NaiveTime::MIN,
            duration_seconds: DEFAULT_SCHEDULE_DURATION_SECS,
        }
    }
}

impl ScheduleConfig {
    pub fn new(
        enabled: bool,
        start_time: &str,
        duration_seconds: u64,
    ) -> Result<Self, ScheduleConfigError> {
        let start_time = parse_start_time(start_time)?;
        if duration_seconds < 1 {
            return Err(ScheduleConfigError::DurationTooShort);
        }
        if duration_seconds > MAX_SCHEDULE_DURATION_SECS as u64 {
            return Err(ScheduleConfigError::DurationTooLong {
                requested: duration_seconds,
                max: MAX_SCHEDULE_DURATION_SECS,
            });
        }
        Ok(Self {
            enabled,
            start_time,
            duration_seconds: duration_seconds as u32,
        })
    }

    pub fn duration(&self) -> Duration {
        Duration::seconds(self.duration_seconds as i64)
    }

    pub fn end_time(&self) -> NaiveTime {
        self.start_time.overflowing_add_signed(self.duration()).0
    }

    /// Clamps a configuration that bypassed `new`, e.g. one read from disk.
    pub fn normalize(&mut self) {
        self.duration_seconds = self.duration_seconds.clamp(1, MAX_SCHEDULE_DURATION_SECS);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScheduleState {
    Idle,
    WindowActive,
    Overridden,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScheduleAction {
    ToggleLoad {
        seconds: u32,
        window_start: NaiveDateTime,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleStatus {
    pub enabled: bool,
    pub start_time: String,
    pub duration_seconds: u32,
    pub duration_hours: f64,
    pub end_time: String,
    pub currently_active: bool,
    pub next_execution: Option<NaiveDateTime>,
    pub manual_override_active: bool,
    pub manual_override_until: Option<NaiveDateTime>,
    pub current_time: NaiveDateTime,
    pub state: ScheduleState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScheduleInfo {
    pub max_duration_hours: u32,
    pub time_format: &'static str,
    pub timezone: String,
    pub override_behavior: &'static str,
    pub persistence: bool,
    pub override_persistence: bool,
}

impl ScheduleInfo {
    pub fn new(timezone: impl Into<String>) -> Self {
        Self {
            max_duration_hours: MAX_SCHEDULE_DURATION_SECS / 3_600,
            time_format: "HH:MM",
            timezone: timezone.into(),
            override_behavior: OVERRIDE_BEHAVIOR,
            persistence: true,
            override_persistence: false,
        }
    }
}

fn start_of_next_day(now: NaiveDateTime) -> NaiveDateTime {
    (now.date() + Duration::days(1)).and_time(NaiveTime::MIN)
}

/// Daily load-off window with a manual override that suppresses it until the
/// next local day at the earliest. Pure: every call takes local `now`.
#[derive(Debug, Clone)]
pub struct ScheduleEngine {
    config: ScheduleConfig,
    state: ScheduleState,
    override_until: Option<NaiveDateTime>,
    executed_window: Option<NaiveDateTime>,
}

impl ScheduleEngine {
    pub fn new(config: ScheduleConfig) -> Self {
        Self {
            config,
            state: ScheduleState::Idle,
            override_until: None,
            executed_window: None,
        }
    }

    pub fn config(&self) -> &ScheduleConfig {
        &self.config
    }

    pub fn state(&self) -> ScheduleState {
        self.state
    }

    /// Validates first; the stored configuration is untouched on error.
    pub fn configure(
        &mut self,
        enabled: bool,
        start_time: &str,
        duration_seconds: u64,
    ) -> Result<&ScheduleConfig, ScheduleConfigError> {
        let config = ScheduleConfig::new(enabled, start_time, duration_seconds)?;
        info!(
            "schedule configured: enabled={} start={} duration={}s",
            config.enabled,
            config.start_time.format(TIME_FORMAT),
            config.duration_seconds
        );
        self.apply(config);
        Ok(&self.config)
    }

    pub fn set_enabled(&mut self, enabled: bool) {
        let config = ScheduleConfig {
            enabled,
            ..self.config.clone()
        };
        self.apply(config);
    }

    fn apply(&mut self, config: ScheduleConfig) {
        if config.start_time != self.config.start_time
            || config.duration_seconds != self.config.duration_seconds
        {
            self.executed_window = None;
        }
        if !config.enabled {
            self.state = ScheduleState::Idle;
        }
        self.config = config;
    }

    /// Returns the instant the override lifts.
    pub fn set_manual_override(&mut self, duration_seconds: u32, now: NaiveDateTime) -> NaiveDateTime {
        let requested = now + Duration::seconds(duration_seconds as i64);
        let until = requested.max(start_of_next_day(now));
        info!("manual override active until {until}");
        self.override_until = Some(until);
        self.state = ScheduleState::Overridden;
        until
    }

    pub fn clear_manual_override(&mut self) -> bool {
        let was_active = self.override_until.take().is_some();
        if was_active {
            info!("manual override cleared");
            self.state = ScheduleState::Idle;
        }
        was_active
    }

    fn override_active(&mut self, now: NaiveDateTime) -> bool {
        match self.override_until {
            Some(until) if now >= until => {
                info!("manual override expired at {until}");
                self.override_until = None;
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    /// Start of the window containing `now`, including yesterday's window
    /// when it runs past midnight.
    pub fn active_window(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        if !self.config.enabled {
            return None;
        }
        let today = now.date().and_time(self.config.start_time);
        [today, today - Duration::days(1)]
            .into_iter()
            .find(|start| *start <= now && now < *start + self.config.duration())
    }

    pub fn tick(&mut self, now: NaiveDateTime) -> Option<ScheduleAction> {
        if self.override_active(now) {
            self.state = ScheduleState::Overridden;
            return None;
        }

        match self.active_window(now) {
            Some(window_start) => {
                if self.state != ScheduleState::WindowActive {
                    info!("entering schedule window started {window_start}");
                }
                self.state = ScheduleState::WindowActive;
                (self.executed_window != Some(window_start)).then_some(ScheduleAction::ToggleLoad {
                    seconds: self.config.duration_seconds,
                    window_start,
                })
            }
            None => {
                if self.state == ScheduleState::WindowActive {
                    info!("schedule window elapsed");
                }
                self.state = ScheduleState::Idle;
                None
            }
        }
    }

    /// Records that the toggle for `window_start` reached the device.
    pub fn mark_executed(&mut self, window_start: NaiveDateTime) {
        self.executed_window = Some(window_start);
    }

    pub fn next_execution(&self, now: NaiveDateTime) -> Option<NaiveDateTime> {
        if !self.config.enabled {
            return None;
        }
        let mut candidate = now.date().and_time(self.config.start_time);
        while candidate < now || self.override_until.is_some_and(|until| candidate < until) {
            candidate += Duration::days(1);
        }
        Some(candidate)
    }

    pub fn status(&mut self, now: NaiveDateTime) -> ScheduleStatus {
        let overridden = self.override_active(now);
        let in_window = self.active_window(now).is_some();
        let state = if overridden {
            ScheduleState::Overridden
        } else if in_window {
            ScheduleState::WindowActive
        } else {
            ScheduleState::Idle
        };

        ScheduleStatus {
            enabled: self.config.enabled,
            start_time: self.config.start_time.format(TIME_FORMAT).to_string(),
            duration_seconds: self.config.duration_seconds,
            duration_hours: (self.config.duration_seconds as f64 / 3_600.0 * 100.0).round() / 100.0,
            end_time: self.config.end_time().format(TIME_FORMAT).to_string(),
            currently_active: state == ScheduleState::WindowActive,
            next_execution: self.next_execution(now),
            manual_override_active: overridden,
            manual_override_until: self.override_until,
            current_time: now,
            state,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use pretty_assertions::assert_eq;

    fn fixed_time(day: u32, hour: u32, minute: u32, second: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2026, 3, day)
            .unwrap()
            .and_hms_opt(hour, minute, second)
            .unwrap()
    }

    fn engine(start: &str, duration: u64) -> ScheduleEngine {
        ScheduleEngine::new(ScheduleConfig::new(true, start, duration).unwrap())
    }

    #[test]
    fn start_time_parsing() {
        assert_eq!(parse_start_time("7:05").unwrap(), NaiveTime::from_hms_opt(7, 5, 0).unwrap());
        assert_eq!(parse_start_time("23:59").unwrap(), NaiveTime::from_hms_opt(23, 59, 0).unwrap());
        for raw in ["24:00", "12:60", "12:5", "noon", "", "1:2:3", "-1:00", "123:00"] {
            assert!(parse_start_time(raw).is_err(), "{raw} accepted");
        }
    }

    #[test]
    fn stored_config_is_normalized() {
        let mut config: ScheduleConfig = serde_json::from_str(
            r#"{"enabled":true,"start_time":"22:30","duration_seconds":90000}"#,
        )
        .unwrap();
        config.normalize();
        assert_eq!(config.duration_seconds, MAX_SCHEDULE_DURATION_SECS);
        assert_eq!(config.start_time, NaiveTime::from_hms_opt(22, 30, 0).unwrap());

        config.duration_seconds = 0;
        config.normalize();
        assert_eq!(config.duration_seconds, 1);
    }

    #[test]
    fn rejected_configuration_leaves_previous_untouched() {
        let mut engine = engine("06:00", 3_600);
        let before = engine.config().clone();

        assert_eq!(
            engine.configure(true, "25:00", 60).unwrap_err(),
            ScheduleConfigError::MalformedStartTime("25:00".to_string())
        );
        assert_eq!(
            engine.configure(true, "01:00", 0).unwrap_err(),
            ScheduleConfigError::DurationTooShort
        );
        assert_eq!(
            engine.configure(true, "01:00", 28_801).unwrap_err(),
            ScheduleConfigError::DurationTooLong {
                requested: 28_801,
                max: 28_800
            }
        );
        assert_eq!(engine.config(), &before);
        assert!(engine.configure(true, "01:00", 28_800).is_ok());
    }

    #[test]
    fn override_spans_to_next_day() {
        let mut engine = engine("00:00", 21_600);
        let now = fixed_time(10, 23, 50, 0);
        let until = engine.set_manual_override(30 * 60, now);
        assert!(until >= fixed_time(11, 0, 0, 0));

        // long overrides keep their own end
        let until = engine.set_manual_override(8 * 3_600, fixed_time(10, 20, 0, 0));
        assert_eq!(until, fixed_time(11, 4, 0, 0));
    }

    #[test]
    fn override_expires_lazily() {
        let mut engine = engine("12:00", 600);
        engine.set_manual_override(60, fixed_time(10, 9, 0, 0));
        assert!(engine.status(fixed_time(10, 23, 59, 59)).manual_override_active);

        let status = engine.status(fixed_time(11, 0, 0, 0));
        assert!(!status.manual_override_active);
        assert_eq!(status.manual_override_until, None);
    }

    #[test]
    fn window_crossing_midnight_is_honoured() {
        let mut engine = engine("22:00", 5 * 3_600);
        assert_eq!(
            engine.tick(fixed_time(11, 1, 0, 0)),
            Some(ScheduleAction::ToggleLoad {
                seconds: 18_000,
                window_start: fixed_time(10, 22, 0, 0),
            })
        );
        // not yet delivered, so the next tick asks again
        assert!(engine.tick(fixed_time(11, 2, 0, 0)).is_some());
        engine.mark_executed(fixed_time(10, 22, 0, 0));
        assert_eq!(engine.tick(fixed_time(11, 2, 30, 0)), None);
        assert_eq!(engine.tick(fixed_time(11, 2, 0, 0)), None);
        assert_eq!(engine.tick(fixed_time(11, 3, 0, 0)), None);
        assert_eq!(engine.state(), ScheduleState::Idle);
    }

    #[test]
    fn daily_scenario_with_manual_override() {
        let mut engine = ScheduleEngine::new(ScheduleConfig::default());
        engine.configure(true, "00:00", 21_600).unwrap();
        assert_eq!(engine.tick(fixed_time(10, 23, 59, 50)), None);

        let action = engine.tick(fixed_time(11, 0, 0, 5));
        assert_eq!(
            action,
            Some(ScheduleAction::ToggleLoad {
                seconds: 21_600,
                window_start: fixed_time(11, 0, 0, 0),
            })
        );
        engine.mark_executed(fixed_time(11, 0, 0, 0));
        assert_eq!(engine.state(), ScheduleState::WindowActive);

        engine.set_manual_override(600, fixed_time(11, 0, 5, 0));
        for (hour, minute) in [(0, 6), (3, 0), (5, 59), (6, 0), (12, 0), (23, 59)] {
            assert_eq!(engine.tick(fixed_time(11, hour, minute, 30)), None);
            assert_eq!(engine.state(), ScheduleState::Overridden);
        }

        assert!(engine.tick(fixed_time(12, 0, 0, 30)).is_some());
    }

    #[test]
    fn disabled_schedule_never_fires() {
        let mut engine = engine("00:00", 60);
        engine.set_enabled(false);
        assert_eq!(engine.tick(fixed_time(10, 0, 0, 30)), None);
        assert_eq!(engine.next_execution(fixed_time(10, 0, 0, 30)), None);

        engine.set_enabled(true);
        assert_eq!(engine.config().duration_seconds, 60);
        assert!(engine.tick(fixed_time(10, 0, 0, 30)).is_some());
    }

    #[test]
    fn status_reports_window_and_next_execution() {
        let mut engine = engine("06:30", 5_400);
        let status = engine.status(fixed_time(10, 7, 0, 0));
        assert_eq!(status.end_time, "08:00");
        assert_eq!(status.duration_hours, 1.5);
        assert!(status.currently_active);
        assert_eq!(status.state, ScheduleState::WindowActive);
        assert_eq!(status.next_execution, Some(fixed_time(11, 6, 30, 0)));

        engine.set_manual_override(60, fixed_time(10, 7, 0, 0));
        let status = engine.status(fixed_time(10, 7, 1, 0));
        assert!(!status.currently_active);
        assert_eq!(status.next_execution, Some(fixed_time(11, 6, 30, 0)));
        assert!(engine.clear_manual_override());
        assert!(!engine.clear_manual_override());
    }

    #[test]
    fn config_serializes_start_time_as_hhmm() {
        let config = ScheduleConfig::new(true, "7:05", 3_600).unwrap();
        let value = serde_json::to_value(&config).unwrap();
        assert_eq!(value["start_time"], "07:05");
        let back: ScheduleConfig = serde_json::from_value(value).unwrap();
        assert_eq!(back, config);
        assert!(serde_json::from_value::<ScheduleConfig>(serde_json::json!({
            "enabled": true,
            "start_time": "99:99",
            "duration_seconds": 60
        }))
        .is_err());
    }
}
