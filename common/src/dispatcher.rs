use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::{sync::Mutex, time::timeout};
use tracing::{debug, info, warn};

use crate::{
    cache::{CacheStats, FreshnessCache},
    config::{CacheConfig, DispatchConfig, SerialConfig},
    error::{GatewayError, Result},
    framing::{Acknowledgement, Frame},
    params::{ParamValue, Parameter},
    protocol::Command,
    telemetry::{Snapshot, Telemetry},
    transport::{Connector, LinkStatus, Transport},
};

const SNAPSHOT_KEY: &str = "snapshot";

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub connected: bool,
    pub port: String,
    pub baudrate: u32,
    pub last_communication: Option<DateTime<Utc>>,
    pub communication_errors: u32,
    pub total_errors: u64,
    pub has_cached_data: bool,
    pub cache_age_seconds: Option<f64>,
    pub channel_busy: bool,
}

/// Anything that can switch the load off for a while. The schedule drives
/// the dispatcher through this seam.
#[async_trait]
pub trait LoadSwitch: Send + Sync {
    async fn toggle_load(&self, seconds: u32) -> Result<Acknowledgement>;
}

/// Serialises every use of the device channel. Reads try the lock briefly and
/// fall back to the cache; writes wait for it and always report failures.
pub struct Dispatcher {
    channel: Mutex<Transport>,
    cache: FreshnessCache<&'static str, Arc<Snapshot>>,
    status: Arc<LinkStatus>,
    serial: SerialConfig,
    dispatch: DispatchConfig,
    grace_ttl: Duration,
}

impl Dispatcher {
    pub fn new(
        connector: Arc<dyn Connector>,
        serial: SerialConfig,
        dispatch: DispatchConfig,
        cache: &CacheConfig,
    ) -> Self {
        let status = Arc::new(LinkStatus::default());
        Self {
            channel: Mutex::new(Transport::new(connector, dispatch.clone(), status.clone())),
            cache: FreshnessCache::new(Duration::from_millis(cache.ttl_ms)),
            status,
            serial,
            dispatch,
            grace_ttl: Duration::from_millis(cache.grace_ttl_ms),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.status.is_connected()
    }

    /// Opens the link and seeds the cache from the probe. A failure leaves
    /// the dispatcher running degraded; the supervisor keeps retrying.
    pub async fn start(&self) -> Result<()> {
        let mut channel = self.channel.lock().await;
        let frame = channel.reconnect().await?;
        drop(channel);
        if let Err(err) = self.store_frame(frame) {
            warn!("initial probe did not decode: {err}");
        }
        Ok(())
    }

    pub async fn stop(&self) {
        let mut channel = self.channel.lock().await;
        channel.close();
        self.cache.clear();
    }

    /// Reconnects if the link is down. Holds the channel through the whole
    /// backoff, so readers fall back to cache meanwhile.
    pub async fn maintain_link(&self) -> Result<()> {
        if self.status.is_connected() {
            return Ok(());
        }
        let mut channel = self.channel.lock().await;
        if channel.is_connected() {
            return Ok(());
        }
        info!("link to {} is down, reconnecting", channel.endpoint());
        let frame = channel.reconnect().await?;
        drop(channel);
        self.store_frame(frame).map(|_| ())
    }

    pub async fn get_snapshot(&self) -> Result<Arc<Snapshot>> {
        if let Some(snapshot) = self.cache.get(&SNAPSHOT_KEY) {
            return Ok(snapshot);
        }

        let waited = Duration::from_millis(self.dispatch.read_lock_timeout_ms);
        let Ok(mut channel) = timeout(waited, self.channel.lock()).await else {
            debug!("channel busy, serving read from cache");
            return self.cached_or(GatewayError::LockTimeout { waited });
        };

        // Another reader may have refreshed while this one waited.
        if let Some(snapshot) = self.cache.get(&SNAPSHOT_KEY) {
            return Ok(snapshot);
        }
        if !channel.is_connected() {
            drop(channel);
            return self.last_known_or(GatewayError::ConnectionLost("link is down".to_string()));
        }

        let command = Command::read_telemetry(&self.dispatch);
        let outcome = self.run_exchange(&mut channel, &command).await;
        let outcome = outcome.and_then(|frame| self.store_frame(frame));
        if let Err(err) = &outcome {
            self.note_failure(&mut channel, err);
        }
        drop(channel);

        match outcome {
            Ok(snapshot) => Ok(snapshot),
            Err(err) => {
                warn!("telemetry read failed: {err}");
                self.last_known_or(err)
            }
        }
    }

    pub async fn get_parameter(&self, name: &str) -> Result<Value> {
        let snapshot = self.get_snapshot().await?;
        snapshot.field(name).ok_or_else(|| {
            GatewayError::InvalidParameter(format!("'{name}' is not reported by the device"))
        })
    }

    /// Expects an already coerced value.
    pub async fn set_parameter(&self, param: Parameter, value: &ParamValue) -> Result<Acknowledgement> {
        info!("setting {param} = {value}");
        self.execute_write(Command::set_parameter(param, value, &self.dispatch))
            .await
    }

    pub async fn toggle_load(&self, seconds: u32) -> Result<Acknowledgement> {
        info!("switching load off for {seconds}s");
        self.execute_write(Command::toggle_load(seconds, &self.dispatch))
            .await
    }

    pub async fn cancel_temporary_off(&self) -> Result<Acknowledgement> {
        info!("cancelling temporary load-off");
        self.execute_write(Command::cancel_override(&self.dispatch))
            .await
    }

    pub fn connection_info(&self) -> ConnectionInfo {
        let cache_age = self.cache.age(&SNAPSHOT_KEY);
        ConnectionInfo {
            connected: self.status.is_connected(),
            port: self.serial.port.clone(),
            baudrate: self.serial.baudrate,
            last_communication: self.status.last_success(),
            communication_errors: self.status.consecutive_errors(),
            total_errors: self.status.total_errors(),
            has_cached_data: cache_age.is_some(),
            cache_age_seconds: cache_age.map(|age| (age.as_secs_f64() * 10.0).round() / 10.0),
            channel_busy: self.channel.try_lock().is_err(),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    async fn execute_write(&self, command: Command) -> Result<Acknowledgement> {
        let waited = Duration::from_millis(self.dispatch.write_lock_timeout_ms);
        let mut channel = timeout(waited, self.channel.lock())
            .await
            .map_err(|_| GatewayError::LockTimeout { waited })?;
        if !channel.is_connected() {
            return Err(GatewayError::ConnectionLost("link is down".to_string()));
        }

        let retries = command.budget().retries;
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = match self.run_exchange(&mut channel, &command).await {
                Ok(Frame::Ack(ack)) if ack.accepted => Ok(ack),
                Ok(Frame::Ack(ack)) => Err(GatewayError::DeviceRejected(ack.message)),
                Ok(Frame::Telemetry(_)) => Err(GatewayError::FrameInvalid(
                    "telemetry received in place of an acknowledgement".to_string(),
                )),
                Err(err) => Err(err),
            };

            match outcome {
                Ok(ack) => {
                    self.cache.invalidate(&SNAPSHOT_KEY);
                    debug!("{} acknowledged: {}", command.kind(), ack.message);
                    return Ok(ack);
                }
                Err(GatewayError::FrameTimeout { .. }) if attempt <= retries => {
                    warn!(
                        "{} timed out, retrying ({attempt}/{retries})",
                        command.kind()
                    );
                }
                Err(err) => {
                    if !matches!(err, GatewayError::DeviceRejected(_)) {
                        self.note_failure(&mut channel, &err);
                    }
                    warn!("{} failed: {err}", command.kind());
                    return Err(err);
                }
            }
        }
    }

    async fn run_exchange(&self, channel: &mut Transport, command: &Command) -> Result<Frame> {
        let deadline = channel.exchange_deadline(command);
        timeout(deadline, channel.exchange(command))
            .await
            .unwrap_or_else(|_| {
                Err(GatewayError::FrameTimeout {
                    command: command.kind(),
                    waited: deadline,
                })
            })
    }

    fn store_frame(&self, frame: Frame) -> Result<Arc<Snapshot>> {
        let Frame::Telemetry(object) = frame else {
            return Err(GatewayError::FrameInvalid(
                "acknowledgement received in place of telemetry".to_string(),
            ));
        };
        let snapshot = Arc::new(Snapshot::new(Telemetry::from_object(object)?, Utc::now()));
        self.cache.set(SNAPSHOT_KEY, snapshot.clone());
        Ok(snapshot)
    }

    fn note_failure(&self, channel: &mut Transport, err: &GatewayError) {
        let consecutive = self.status.record_error();
        if !err.is_link_failure() && consecutive >= self.dispatch.max_consecutive_errors {
            warn!("{consecutive} consecutive channel errors, dropping link");
            channel.close();
        }
    }

    /// Busy channel: only a snapshot inside the grace window is served.
    fn cached_or(&self, cause: GatewayError) -> Result<Arc<Snapshot>> {
        match self.cache.get_within(&SNAPSHOT_KEY, self.grace_ttl) {
            Some(snapshot) => Ok(snapshot),
            None => Err(GatewayError::Unavailable(Box::new(cause))),
        }
    }

    /// Device failure: any snapshot still held is served; its capture time
    /// tells the caller how stale it is.
    fn last_known_or(&self, cause: GatewayError) -> Result<Arc<Snapshot>> {
        match self.cache.get_any(&SNAPSHOT_KEY) {
            Some(snapshot) => {
                debug!("serving last known snapshot after: {cause}");
                Ok(snapshot)
            }
            None => Err(GatewayError::Unavailable(Box::new(cause))),
        }
    }
}

#[async_trait]
impl LoadSwitch for Dispatcher {
    async fn toggle_load(&self, seconds: u32) -> Result<Acknowledgement> {
        Dispatcher::toggle_load(self, seconds).await
    }
}
